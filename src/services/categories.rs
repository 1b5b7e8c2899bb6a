//! Stock marketplace category table and name resolution.

use serde::Serialize;
use strsim::jaro_winkler;

/// Threshold for the last-resort fuzzy match (0.0 - 1.0).
const FUZZY_THRESHOLD: f64 = 0.85;

#[derive(Debug, Clone, Copy, Serialize)]
pub struct Category {
    pub id: u8,
    pub name: &'static str,
    #[serde(skip)]
    aliases: &'static [&'static str],
}

pub const CATEGORIES: &[Category] = &[
    Category { id: 1, name: "Animals", aliases: &["animal", "wildlife", "pets", "pet"] },
    Category { id: 2, name: "Buildings and Architecture", aliases: &["architecture", "building", "buildings"] },
    Category { id: 3, name: "Business", aliases: &["office", "finance", "corporate"] },
    Category { id: 4, name: "Drinks", aliases: &["drink", "beverage", "beverages"] },
    Category { id: 5, name: "The Environment", aliases: &["environment", "nature", "ecology"] },
    Category { id: 6, name: "States of Mind", aliases: &["emotions", "emotion", "feelings", "mood"] },
    Category { id: 7, name: "Food", aliases: &["cuisine", "meal", "cooking"] },
    Category { id: 8, name: "Graphic Resources", aliases: &["graphics", "background", "backgrounds", "texture", "textures", "pattern"] },
    Category { id: 9, name: "Hobbies and Leisure", aliases: &["hobby", "hobbies", "leisure", "recreation"] },
    Category { id: 10, name: "Industry", aliases: &["industrial", "manufacturing", "factory"] },
    Category { id: 11, name: "Landscapes", aliases: &["landscape", "scenery"] },
    Category { id: 12, name: "Lifestyle", aliases: &["life style"] },
    Category { id: 13, name: "People", aliases: &["person", "portrait", "portraits"] },
    Category { id: 14, name: "Plants and Flowers", aliases: &["plant", "plants", "flower", "flowers", "botany"] },
    Category { id: 15, name: "Culture and Religion", aliases: &["culture", "religion", "tradition"] },
    Category { id: 16, name: "Science", aliases: &["scientific", "laboratory", "research"] },
    Category { id: 17, name: "Social Issues", aliases: &["social", "society"] },
    Category { id: 18, name: "Sports", aliases: &["sport", "fitness", "athletics"] },
    Category { id: 19, name: "Technology", aliases: &["tech", "computers", "electronics"] },
    Category { id: 20, name: "Transport", aliases: &["transportation", "vehicles", "vehicle", "cars"] },
    Category { id: 21, name: "Travel", aliases: &["tourism", "vacation", "holiday"] },
];

pub const MIN_CATEGORY: u8 = 1;
pub const MAX_CATEGORY: u8 = 21;

pub fn is_valid_id(id: i64) -> bool {
    (MIN_CATEGORY as i64..=MAX_CATEGORY as i64).contains(&id)
}

/// Resolve a category from a model-supplied string: a numeric id, or a name
/// matched by exact name, then alias, then word prefix, then substring, then
/// fuzzy similarity.
pub fn resolve(input: &str) -> Option<u8> {
    let needle = input.trim().to_lowercase();
    if needle.is_empty() {
        return None;
    }

    if let Ok(id) = needle.parse::<i64>() {
        return is_valid_id(id).then_some(id as u8);
    }
    if let Ok(value) = needle.parse::<f64>() {
        let id = value.trunc() as i64;
        return (value.fract() == 0.0 && is_valid_id(id)).then_some(id as u8);
    }

    if let Some(c) = CATEGORIES.iter().find(|c| c.name.to_lowercase() == needle) {
        return Some(c.id);
    }

    if let Some(c) = CATEGORIES.iter().find(|c| c.aliases.contains(&needle.as_str())) {
        return Some(c.id);
    }

    // Partial word: every word of the input prefixes a word of the name.
    let input_words: Vec<&str> = needle.split_whitespace().collect();
    if let Some(c) = CATEGORIES.iter().find(|c| {
        let name = c.name.to_lowercase();
        let name_words: Vec<&str> = name.split_whitespace().collect();
        input_words
            .iter()
            .all(|w| name_words.iter().any(|n| n.starts_with(w)))
    }) {
        return Some(c.id);
    }

    if let Some(c) = CATEGORIES
        .iter()
        .find(|c| c.name.to_lowercase().contains(&needle) || needle.contains(&c.name.to_lowercase()))
    {
        return Some(c.id);
    }

    CATEGORIES
        .iter()
        .map(|c| (c.id, jaro_winkler(&c.name.to_lowercase(), &needle)))
        .filter(|(_, score)| *score >= FUZZY_THRESHOLD)
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(id, _)| id)
}
