use garde::Validate;
use serde::{Deserialize, Serialize};

/// Highest keyword count the marketplace accepts per image.
pub const MAX_KEYWORDS: usize = 49;

/// Keywords as the vision model returns them: usually a JSON array, sometimes
/// a single comma-separated string.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum KeywordsValue {
    List(Vec<String>),
    Text(String),
}

/// Category as the vision model returns it: a number, a numeric string, or a
/// category name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum CategoryValue {
    Number(f64),
    Text(String),
}

/// Unvalidated fields parsed out of the model's reply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawMetadata {
    pub title: String,
    pub keywords: KeywordsValue,
    pub category: CategoryValue,
}

/// Canonical per-image metadata, ready for CSV export.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
pub struct Metadata {
    #[garde(skip)]
    pub filename: String,

    #[garde(length(chars, min = 1, max = 200))]
    pub title: String,

    /// Comma-delimited keyword list.
    #[garde(length(min = 1))]
    pub keywords: String,

    #[garde(range(min = 1, max = 21))]
    pub category: u8,
}
