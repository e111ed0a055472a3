//! Context Budget & Handoff
//!
//! Agent sessions have a fixed context window. This module tracks how much of
//! it the current session has consumed and, when it runs low, replaces the
//! session with a fresh one seeded by a continuation summary.
//!
//! ## Features
//!
//! - **Budget Tracking**: lifetime input/output tokens and cost, plus a
//!   per-session estimate that restarts with every new session
//! - **Handoff Detection**: a configurable threshold on the remaining window
//! - **Continuation Summary**: a deterministic text block describing progress,
//!   changed files, and remaining work for the next session
//!
//! ## Configuration
//!
//! ```toml
//! [agent]
//! context_window_tokens = 200000
//! handoff_threshold = "10%"   # or an absolute token count, e.g. "20000"
//! ```

mod config;
mod handoff;
mod summary;
mod tracker;

pub use config::{HandoffThreshold, parse_handoff_threshold};
pub use handoff::{HandoffReport, build_continuation, handoff_prompt, parse_handoff_report};
pub use summary::ContinuationSummary;
pub use tracker::ContextBudget;

/// Default agent context window in tokens.
pub const DEFAULT_CONTEXT_WINDOW_TOKENS: u64 = 200_000;

/// Hand off when less than this percentage of the window remains.
pub const DEFAULT_HANDOFF_PERCENT: f64 = 10.0;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_budget_uses_module_defaults() {
        let budget = ContextBudget::default();
        assert_eq!(budget.window_tokens(), DEFAULT_CONTEXT_WINDOW_TOKENS);
        assert_eq!(
            budget.threshold(),
            HandoffThreshold::Percentage(DEFAULT_HANDOFF_PERCENT)
        );
    }
}
