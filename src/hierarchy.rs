//! Grouped-count rows and the absent-label rule
//!
//! A hierarchy field is absent when it is null, missing, or the `"N/A"`
//! placeholder. Rows keep the raw source values; presence is decided at fold
//! time so the reader stays a plain projection of the grouping result.

/// Placeholder value the source data uses for "no label"
pub const ABSENT_SENTINEL: &str = "N/A";

/// Source field holding the category label
pub const CATEGORY_FIELD: &str = "category";
/// Source field holding the subcategory label
pub const SUBCATEGORY_FIELD: &str = "subcategory";
/// Source field holding the sub-subcategory label
pub const SUB_SUBCATEGORY_FIELD: &str = "Categories";

/// Returns the label if it is a real hierarchy value.
pub fn present(label: Option<&str>) -> Option<&str> {
    match label {
        Some(value) if value != ABSENT_SENTINEL => Some(value),
        _ => None,
    }
}

/// One row of the grouping query: a distinct (category, subcategory,
/// sub-subcategory) triple and how many source records share it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HierarchyRow {
    pub category: Option<String>,
    pub subcategory: Option<String>,
    pub sub_subcategory: Option<String>,
    pub count: i64,
}

impl HierarchyRow {
    pub fn new(
        category: Option<&str>,
        subcategory: Option<&str>,
        sub_subcategory: Option<&str>,
        count: i64,
    ) -> Self {
        Self {
            category: category.map(str::to_string),
            subcategory: subcategory.map(str::to_string),
            sub_subcategory: sub_subcategory.map(str::to_string),
            count,
        }
    }

    pub fn category(&self) -> Option<&str> {
        present(self.category.as_deref())
    }

    pub fn subcategory(&self) -> Option<&str> {
        present(self.subcategory.as_deref())
    }

    pub fn sub_subcategory(&self) -> Option<&str> {
        present(self.sub_subcategory.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinel_and_null_are_absent() {
        assert_eq!(present(None), None);
        assert_eq!(present(Some("N/A")), None);
        assert_eq!(present(Some("Retail")), Some("Retail"));
        // Only the exact sentinel is a placeholder
        assert_eq!(present(Some("n/a")), Some("n/a"));
        assert_eq!(present(Some("")), Some(""));
    }

    #[test]
    fn test_row_accessors_hide_placeholders() {
        let row = HierarchyRow::new(Some("N/A"), Some("X"), None, 4);
        assert_eq!(row.category(), None);
        assert_eq!(row.subcategory(), Some("X"));
        assert_eq!(row.sub_subcategory(), None);
    }
}
