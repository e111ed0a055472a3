//! Handoff threshold parsing.

use anyhow::{Context, Result};

/// When to hand a session off to a fresh one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HandoffThreshold {
    /// Hand off when less than this percentage of the window remains (e.g. 10%)
    Percentage(f64),
    /// Hand off when fewer than this many tokens remain
    Absolute(u64),
}

impl HandoffThreshold {
    /// Whether a session with `remaining_fraction` of its window (0.0..=1.0)
    /// and `remaining_tokens` left should be handed off.
    pub fn is_crossed(&self, remaining_fraction: f64, remaining_tokens: u64) -> bool {
        match self {
            HandoffThreshold::Percentage(pct) => remaining_fraction * 100.0 < *pct,
            HandoffThreshold::Absolute(tokens) => remaining_tokens < *tokens,
        }
    }
}

impl Default for HandoffThreshold {
    fn default() -> Self {
        HandoffThreshold::Percentage(super::DEFAULT_HANDOFF_PERCENT)
    }
}

impl std::fmt::Display for HandoffThreshold {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandoffThreshold::Percentage(pct) => write!(f, "{}%", pct),
            HandoffThreshold::Absolute(tokens) => write!(f, "{}", tokens),
        }
    }
}

/// Parse a threshold string: `"10%"` (percent of window remaining) or
/// `"20000"` (tokens remaining).
pub fn parse_handoff_threshold(s: &str) -> Result<HandoffThreshold> {
    let s = s.trim();

    if s.is_empty() {
        anyhow::bail!("Handoff threshold cannot be empty");
    }

    if let Some(num_str) = s.strip_suffix('%') {
        let pct: f64 = num_str
            .trim()
            .parse()
            .with_context(|| format!("Invalid percentage in handoff threshold: {}", s))?;

        if !(pct > 0.0 && pct < 100.0) {
            anyhow::bail!(
                "Handoff threshold percentage must be between 0 and 100, got {}",
                pct
            );
        }

        Ok(HandoffThreshold::Percentage(pct))
    } else {
        let tokens: u64 = s
            .parse()
            .with_context(|| format!("Invalid absolute handoff threshold: {}", s))?;

        if tokens == 0 {
            anyhow::bail!("Handoff threshold cannot be zero");
        }

        Ok(HandoffThreshold::Absolute(tokens))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_percentage() {
        assert_eq!(
            parse_handoff_threshold("10%").unwrap(),
            HandoffThreshold::Percentage(10.0)
        );
        assert_eq!(
            parse_handoff_threshold(" 12.5 % ").unwrap(),
            HandoffThreshold::Percentage(12.5)
        );
    }

    #[test]
    fn test_parse_absolute() {
        assert_eq!(
            parse_handoff_threshold("20000").unwrap(),
            HandoffThreshold::Absolute(20_000)
        );
    }

    #[test]
    fn test_parse_invalid() {
        assert!(parse_handoff_threshold("").is_err());
        assert!(parse_handoff_threshold("lots").is_err());
        assert!(parse_handoff_threshold("0%").is_err());
        assert!(parse_handoff_threshold("100%").is_err());
        assert!(parse_handoff_threshold("-5%").is_err());
        assert!(parse_handoff_threshold("0").is_err());
    }

    #[test]
    fn test_is_crossed() {
        let pct = HandoffThreshold::Percentage(10.0);
        assert!(!pct.is_crossed(0.10, 20_000));
        assert!(pct.is_crossed(0.09, 18_000));

        let abs = HandoffThreshold::Absolute(15_000);
        assert!(!abs.is_crossed(0.05, 15_000));
        assert!(abs.is_crossed(0.5, 14_999));
    }

    #[test]
    fn test_display_round_trips() {
        for s in ["10%", "20000"] {
            assert_eq!(parse_handoff_threshold(s).unwrap().to_string(), s);
        }
    }
}
