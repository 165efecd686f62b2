use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BookListError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed book list: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// One synchronized book. `client_id` is assigned on this side when the
/// book is first registered; `device_id` is the store record identifier
/// and stays absent until the book has actually landed on the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookRecord {
    pub title: String,
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default)]
    pub authors: Vec<String>,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub modified: i64,
    #[serde(default)]
    pub tags: Vec<String>,
    pub path: String,
}

impl BookRecord {
    /// Identity across the two sides. Device identifiers win when both
    /// records carry one; otherwise the client identifiers decide. An
    /// absent device identifier never matches anything.
    pub fn same_book(&self, other: &BookRecord) -> bool {
        if let (Some(mine), Some(theirs)) = (&self.device_id, &other.device_id)
            && mine == theirs
        {
            return true;
        }
        self.client_id == other.client_id
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BookList(Vec<BookRecord>);

impl BookList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, BookRecord> {
        self.0.iter()
    }

    pub fn contains(&self, book: &BookRecord) -> bool {
        self.0.iter().any(|known| known.same_book(book))
    }

    pub fn push(&mut self, book: BookRecord) {
        self.0.push(book);
    }

    /// Adds the book, or refreshes the entry it already matches.
    pub fn upsert(&mut self, book: BookRecord) {
        if let Some(existing) = self.0.iter_mut().find(|known| known.same_book(&book)) {
            *existing = book;
        } else {
            self.0.push(book);
        }
    }

    pub fn retain(&mut self, keep: impl FnMut(&BookRecord) -> bool) {
        self.0.retain(keep);
    }

    /// Drops every record whose device path is in `paths`.
    pub fn remove_paths(&mut self, paths: &[String]) {
        self.0.retain(|book| !paths.contains(&book.path));
    }

    /// Reads the list from disk; a missing file is an empty list.
    pub fn load(path: &Path) -> Result<Self, BookListError> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let raw = std::fs::read_to_string(path)?;
        Ok(Self::from_json(&raw)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), BookListError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }
}
