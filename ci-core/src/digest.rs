// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

/// MD5 hex digest of a source file's bytes, matching the hash the coverage
/// parser embeds alongside each file's line-hit array.
pub fn source_digest(data: impl AsRef<[u8]>) -> String {
    format!("{:x}", md5::compute(data.as_ref()))
}

/// Number of newline-delimited lines in a source file, used to size the
/// per-line coverage array.
pub fn line_count(data: &str) -> usize {
    data.lines().count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_digest_is_stable() {
        assert_eq!(source_digest(b"a\nb\n"), source_digest(b"a\nb\n"));
        assert_ne!(source_digest(b"a\nb\n"), source_digest(b"a\nb\nc\n"));
    }

    #[test]
    fn line_count_counts_newline_delimited_lines() {
        assert_eq!(line_count("a\nb\nc\n"), 3);
        assert_eq!(line_count(""), 0);
        assert_eq!(line_count("no trailing newline"), 1);
    }
}
