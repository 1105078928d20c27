//! The `books.json` index of downloaded novel folders.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Default, Serialize, Deserialize)]
struct BookIndex {
    #[serde(default)]
    books: Vec<String>,
}

/// Reads the list of book folder slugs, creating an empty index file when
/// none exists yet.
pub fn read_books(path: &Path) -> Vec<String> {
    if !path.exists() {
        if let Err(e) = fs::write(path, "{\"books\": []}") {
            warn!(error = %e, "could not create books index");
        }
        return Vec::new();
    }
    match fs::read_to_string(path) {
        Ok(raw) => serde_json::from_str::<BookIndex>(&raw)
            .map(|idx| idx.books)
            .unwrap_or_default(),
        Err(_) => Vec::new(),
    }
}

/// Adds a book folder to the index if it is not already present.
///
/// The index is re-read immediately before the append so interleaved
/// writers never drop each other's entries.
pub fn add_book(path: &Path, book_folder: &str) {
    let mut books = read_books(path);
    if books.iter().any(|b| b == book_folder) {
        return;
    }
    books.push(book_folder.to_string());
    let index = BookIndex { books };
    match serde_json::to_string_pretty(&index) {
        Ok(json) => {
            if let Err(e) = fs::write(path, json) {
                warn!(error = %e, "could not write books index");
            } else {
                info!("added '{}' to {}", book_folder, path.display());
            }
        }
        Err(e) => warn!(error = %e, "could not serialize books index"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("books.json");

        add_book(&path, "novel_a");
        assert_eq!(read_books(&path), vec!["novel_a".to_string()]);

        add_book(&path, "novel_a");
        assert_eq!(read_books(&path), vec!["novel_a".to_string()]);

        add_book(&path, "another");
        let books = read_books(&path);
        assert_eq!(
            books,
            vec!["novel_a".to_string(), "another".to_string()],
            "entries keep insertion order"
        );
        assert_eq!(books.iter().filter(|b| *b == "novel_a").count(), 1);
    }

    #[test]
    fn read_creates_empty_index() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("books.json");
        assert!(read_books(&path).is_empty());
        assert!(path.exists());
    }
}
