//! Filter metadata documents
//!
//! One document per rollup key, in three shapes distinguished by `type`.
//! Field names match what the facet consumers query.

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum FilterKind {
    #[serde(rename = "category")]
    Category,
    #[serde(rename = "subcategory")]
    Subcategory,
    #[serde(rename = "subSubcategory")]
    SubSubcategory,
}

impl FilterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterKind::Category => "category",
            FilterKind::Subcategory => "subcategory",
            FilterKind::SubSubcategory => "subSubcategory",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "category" => Some(FilterKind::Category),
            "subcategory" => Some(FilterKind::Subcategory),
            "subSubcategory" => Some(FilterKind::SubSubcategory),
            _ => None,
        }
    }
}

/// A materialized filter facet entry.
///
/// `category` is set for subcategory and sub-subcategory documents,
/// `subcategory` only for sub-subcategory documents. The constructors are the
/// only way the writer builds these, so the shape always matches `kind`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FilterMetadata {
    #[serde(rename = "type")]
    pub kind: FilterKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subcategory: Option<String>,
    pub value: String,
    pub count: i64,
    #[serde(rename = "lastUpdated", skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
}

impl FilterMetadata {
    pub fn category(value: &str, count: i64) -> Self {
        Self {
            kind: FilterKind::Category,
            category: None,
            subcategory: None,
            value: value.to_string(),
            count,
            last_updated: None,
        }
    }

    pub fn subcategory(category: &str, value: &str, count: i64) -> Self {
        Self {
            kind: FilterKind::Subcategory,
            category: Some(category.to_string()),
            subcategory: None,
            value: value.to_string(),
            count,
            last_updated: None,
        }
    }

    pub fn sub_subcategory(category: &str, subcategory: &str, value: &str, count: i64) -> Self {
        Self {
            kind: FilterKind::SubSubcategory,
            category: Some(category.to_string()),
            subcategory: Some(subcategory.to_string()),
            value: value.to_string(),
            count,
            last_updated: None,
        }
    }

    pub fn stamped(mut self, at: DateTime<Utc>) -> Self {
        self.last_updated = Some(at);
        self
    }
}
