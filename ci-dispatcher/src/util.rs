// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Small string helpers shared by the record store, HTTP service, and
//! forge client.

use once_regex::sha_re;

mod once_regex {
    use regex::Regex;
    use std::sync::OnceLock;

    static SHA_RE: OnceLock<Regex> = OnceLock::new();

    pub fn sha_re() -> &'static Regex {
        SHA_RE.get_or_init(|| Regex::new(r"(?i)^[0-9a-f]{7,40}$").unwrap())
    }
}

/// True iff `value` is 7-40 lowercase-or-uppercase hex characters.
pub fn is_sha(value: &str) -> bool {
    sha_re().is_match(value)
}

/// First `min(n, len(v))` characters of `v`.
pub fn short_id(value: &str, n: usize) -> String {
    value.chars().take(n).collect()
}

/// Truncates `s` to at most `max_len` characters, as done for status
/// descriptions before they are posted to the forge.
pub fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        s.chars().take(max_len).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha_accepts_prefix_lengths() {
        assert!(is_sha("cabe27e"));
        assert!(is_sha(&"a".repeat(40)));
        assert!(!is_sha(&"a".repeat(41)));
        assert!(!is_sha("a".repeat(6).as_str()));
        assert!(!is_sha("not-hex!"));
    }

    #[test]
    fn short_id_clamps_to_length() {
        assert_eq!(short_id("cabe27e5abcdef", 7), "cabe27e");
        assert_eq!(short_id("ab", 7), "ab");
    }

    #[test]
    fn truncate_respects_max_len() {
        assert_eq!(truncate("hello", 10), "hello");
        assert_eq!(truncate("hello world", 5), "hello");
    }
}
