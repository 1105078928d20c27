pub mod book_list;
pub mod logging;

/// Index of downloaded book folders, kept next to the data directory.
pub const BOOKS_FILE: &str = "books.json";

/// Turns a display name into a filesystem-safe slug.
///
/// Strips the Windows-forbidden character class, swaps spaces for
/// underscores and caps the result at 100 characters. Idempotent.
pub fn format_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| !matches!(c, '\\' | '/' | '*' | '?' | ':' | '"' | '<' | '>' | '|'))
        .map(|c| if c == ' ' { '_' } else { c })
        .collect();
    cleaned.trim().chars().take(100).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_filename_strips_forbidden_characters() {
        assert_eq!(format_filename("Vol 1: Khởi đầu?"), "Vol_1_Khởi_đầu");
        assert_eq!(format_filename(r#"a\b/c*d?e:f"g<h>i|j"#), "abcdefghij");
    }

    #[test]
    fn format_filename_is_idempotent() {
        let once = format_filename("Tập 2 - Mùa hè");
        assert_eq!(format_filename(&once), once);
    }

    #[test]
    fn format_filename_truncates_to_100_chars() {
        let long = "x".repeat(300);
        assert_eq!(format_filename(&long).chars().count(), 100);
    }

    #[test]
    fn format_filename_preserves_ascii_alphanumerics() {
        assert_eq!(format_filename("Abc123"), "Abc123");
    }
}
