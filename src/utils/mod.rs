//! Small shared helpers with no dependency on engine state.
pub mod truncate;

pub use truncate::{truncate_text, TruncationPolicy};

/// Whitespace-split token count used by the safety monitor and evaluator
/// brevity checks (spec §4.3/§4.7 `token_count`). Distinct from
/// `truncate::approx_token_count`, which is a byte-based heuristic sized
/// for truncation budgets rather than a brevity signal.
pub fn whitespace_token_count(text: &str) -> u32 {
    text.split_whitespace().count() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_whitespace_separated_tokens() {
        assert_eq!(whitespace_token_count("  a  b   c"), 3);
        assert_eq!(whitespace_token_count(""), 0);
        assert_eq!(whitespace_token_count("single"), 1);
    }
}
