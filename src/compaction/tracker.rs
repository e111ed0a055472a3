//! Token budget tracking across agent turns.

use super::config::HandoffThreshold;
use crate::stream::Usage;

/// Token and cost accounting for one workflow.
///
/// Lifetime totals only ever grow. The session estimate tracks how much new
/// content the current agent session has taken on, and restarts whenever the
/// session is replaced (handoff or a fresh task).
#[derive(Debug, Clone, PartialEq)]
pub struct ContextBudget {
    window_tokens: u64,
    threshold: HandoffThreshold,
    total_input_tokens: u64,
    total_output_tokens: u64,
    total_cost_usd: f64,
    session_tokens: u64,
    handoffs: u32,
}

impl Default for ContextBudget {
    fn default() -> Self {
        Self::new(super::DEFAULT_CONTEXT_WINDOW_TOKENS, HandoffThreshold::default())
    }
}

impl ContextBudget {
    pub fn new(window_tokens: u64, threshold: HandoffThreshold) -> Self {
        Self {
            window_tokens: window_tokens.max(1),
            threshold,
            total_input_tokens: 0,
            total_output_tokens: 0,
            total_cost_usd: 0.0,
            session_tokens: 0,
            handoffs: 0,
        }
    }

    /// Account for one finished agent turn.
    pub fn record_turn(&mut self, usage: &Usage, cost_usd: f64) {
        self.total_input_tokens += usage.input_tokens;
        self.total_output_tokens += usage.output_tokens;
        if cost_usd.is_finite() && cost_usd > 0.0 {
            self.total_cost_usd += cost_usd;
        }
        // Cache reads re-read context the session already holds.
        self.session_tokens +=
            usage.input_tokens + usage.cache_creation_input_tokens + usage.output_tokens;
    }

    /// Fraction of the window still free in the current session, in `0.0..=1.0`.
    pub fn percent_remaining(&self) -> f64 {
        (1.0 - self.session_tokens as f64 / self.window_tokens as f64).max(0.0)
    }

    pub fn remaining_tokens(&self) -> u64 {
        self.window_tokens.saturating_sub(self.session_tokens)
    }

    /// The current session is close enough to the window to hand off.
    pub fn needs_handoff(&self) -> bool {
        self.threshold
            .is_crossed(self.percent_remaining(), self.remaining_tokens())
    }

    /// Restart the session estimate for a fresh agent session.
    pub fn start_new_session(&mut self) {
        self.session_tokens = 0;
    }

    pub fn record_handoff(&mut self) {
        self.handoffs += 1;
        self.start_new_session();
    }

    pub fn total_input_tokens(&self) -> u64 {
        self.total_input_tokens
    }

    pub fn total_output_tokens(&self) -> u64 {
        self.total_output_tokens
    }

    pub fn total_cost_usd(&self) -> f64 {
        self.total_cost_usd
    }

    pub fn session_tokens(&self) -> u64 {
        self.session_tokens
    }

    pub fn window_tokens(&self) -> u64 {
        self.window_tokens
    }

    pub fn threshold(&self) -> HandoffThreshold {
        self.threshold
    }

    pub fn handoffs(&self) -> u32 {
        self.handoffs
    }

    /// Get a status summary for display.
    pub fn status_summary(&self) -> String {
        format!(
            "Context: {:.1}% free ({} / {} tokens this session), {} in / {} out total, ${:.4}{}",
            self.percent_remaining() * 100.0,
            self.session_tokens,
            self.window_tokens,
            self.total_input_tokens,
            self.total_output_tokens,
            self.total_cost_usd,
            if self.handoffs > 0 {
                format!(", {} handoff(s)", self.handoffs)
            } else {
                String::new()
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(input: u64, output: u64) -> Usage {
        Usage {
            input_tokens: input,
            output_tokens: output,
            ..Usage::default()
        }
    }

    #[test]
    fn test_new_budget_is_empty() {
        let budget = ContextBudget::new(100_000, HandoffThreshold::default());
        assert_eq!(budget.total_input_tokens(), 0);
        assert_eq!(budget.percent_remaining(), 1.0);
        assert!(!budget.needs_handoff());
    }

    #[test]
    fn test_totals_are_monotonic_across_handoffs() {
        let mut budget = ContextBudget::new(100_000, HandoffThreshold::default());
        budget.record_turn(&usage(40_000, 1_000), 0.5);
        budget.record_turn(&usage(30_000, 2_000), 0.25);
        let before = budget.total_input_tokens();

        budget.record_handoff();
        assert_eq!(budget.total_input_tokens(), before);
        assert_eq!(budget.total_output_tokens(), 3_000);
        assert!((budget.total_cost_usd() - 0.75).abs() < 1e-9);
        assert_eq!(budget.session_tokens(), 0);
        assert_eq!(budget.handoffs(), 1);

        budget.record_turn(&usage(10, 10), 0.0);
        assert!(budget.total_input_tokens() > before);
    }

    #[test]
    fn test_totals_count_uncached_input_only() {
        let mut budget = ContextBudget::new(100_000, HandoffThreshold::default());
        budget.record_turn(
            &Usage {
                input_tokens: 100,
                output_tokens: 50,
                cache_creation_input_tokens: 1_000,
                cache_read_input_tokens: 50_000,
            },
            0.0,
        );
        assert_eq!(budget.total_input_tokens(), 100);
        assert_eq!(budget.total_output_tokens(), 50);
        assert_eq!(budget.session_tokens(), 1_150);
    }

    #[test]
    fn test_handoff_below_ten_percent() {
        let mut budget = ContextBudget::new(100_000, HandoffThreshold::Percentage(10.0));
        budget.record_turn(&usage(89_000, 0), 0.0);
        assert!(!budget.needs_handoff());
        budget.record_turn(&usage(2_000, 0), 0.0);
        assert!(budget.needs_handoff());
        assert!((budget.percent_remaining() - 0.09).abs() < 1e-9);
    }

    #[test]
    fn test_percent_remaining_never_negative() {
        let mut budget = ContextBudget::new(1_000, HandoffThreshold::default());
        budget.record_turn(&usage(5_000, 0), 0.0);
        assert_eq!(budget.percent_remaining(), 0.0);
        assert_eq!(budget.remaining_tokens(), 0);
    }

    #[test]
    fn test_absolute_threshold() {
        let mut budget = ContextBudget::new(100_000, HandoffThreshold::Absolute(30_000));
        budget.record_turn(&usage(75_000, 0), 0.0);
        assert!(budget.needs_handoff());
    }

    #[test]
    fn test_status_summary_mentions_handoffs() {
        let mut budget = ContextBudget::new(100_000, HandoffThreshold::default());
        assert!(!budget.status_summary().contains("handoff"));
        budget.record_handoff();
        assert!(budget.status_summary().contains("1 handoff"));
    }
}
