//! Token estimation.
//!
//! The engine never shells out to a real tokenizer: every stored
//! `token_count` and every assembler/compaction accounting figure uses the
//! same cheap character-based estimate unless a caller supplies a better
//! number (e.g. a token count reported by the model provider).

/// `ceil(char_count / 4)`.
pub fn estimate_tokens(text: &str) -> u32 {
    let chars = text.chars().count();
    u32::try_from(chars.div_ceil(4)).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn counts_unicode_scalars_not_bytes() {
        // "caf\u{e9}" — 4 chars, 5 bytes.
        assert_eq!(estimate_tokens("caf\u{e9}"), 1);
    }
}
