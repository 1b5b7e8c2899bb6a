//! Coercion of raw model output into canonical [`Metadata`].

use garde::Validate;
use std::collections::HashSet;

use crate::models::metadata::{CategoryValue, KeywordsValue, Metadata, RawMetadata, MAX_KEYWORDS};
use crate::services::categories;

#[derive(Debug, thiserror::Error)]
pub enum NormalizeError {
    #[error("Unrecognised category {0:?}")]
    Category(String),

    #[error("Metadata failed validation: {0}")]
    Invalid(String),
}

/// List keywords are trimmed, de-duplicated case-insensitively, capped and
/// joined with `", "`. String keywords pass through unchanged.
pub fn normalize_keywords(keywords: &KeywordsValue) -> String {
    match keywords {
        KeywordsValue::Text(text) => text.clone(),
        KeywordsValue::List(list) => {
            let mut seen = HashSet::new();
            list.iter()
                .map(|k| k.trim())
                .filter(|k| !k.is_empty())
                .filter(|k| seen.insert(k.to_lowercase()))
                .take(MAX_KEYWORDS)
                .collect::<Vec<_>>()
                .join(", ")
        }
    }
}

pub fn normalize_category(category: &CategoryValue) -> Result<u8, NormalizeError> {
    match category {
        CategoryValue::Number(n) => {
            let id = n.trunc() as i64;
            if n.fract() == 0.0 && categories::is_valid_id(id) {
                Ok(id as u8)
            } else {
                Err(NormalizeError::Category(n.to_string()))
            }
        }
        CategoryValue::Text(text) => {
            categories::resolve(text).ok_or_else(|| NormalizeError::Category(text.clone()))
        }
    }
}

pub fn normalize(filename: &str, raw: &RawMetadata) -> Result<Metadata, NormalizeError> {
    let metadata = Metadata {
        filename: filename.to_string(),
        title: raw.title.trim().to_string(),
        keywords: normalize_keywords(&raw.keywords),
        category: normalize_category(&raw.category)?,
    };
    metadata
        .validate()
        .map_err(|e| NormalizeError::Invalid(e.to_string()))?;
    Ok(metadata)
}
