//! Hierarchical rollup of grouped counts
//!
//! Folds grouped-count rows into per-category, per-(category, subcategory)
//! and per-(category, subcategory, sub-subcategory) totals. A row only counts
//! toward a level when every label down to that level is present, so a row
//! with an absent category contributes nothing even if lower levels are set.
//!
//! Keys are tuples, never delimited strings, and the maps are ordered so the
//! materialized document set is identical across runs over the same data.

use crate::hierarchy::HierarchyRow;
use crate::metadata::FilterMetadata;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

pub type SubcategoryKey = (String, String);
pub type SubSubcategoryKey = (String, String, String);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HierarchyRollup {
    pub category_counts: BTreeMap<String, i64>,
    pub subcategory_counts: BTreeMap<SubcategoryKey, i64>,
    pub sub_subcategory_counts: BTreeMap<SubSubcategoryKey, i64>,
}

impl HierarchyRollup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_row(&mut self, row: &HierarchyRow) {
        let Some(category) = row.category() else {
            return;
        };
        *self.category_counts.entry(category.to_string()).or_insert(0) += row.count;

        let Some(subcategory) = row.subcategory() else {
            return;
        };
        *self
            .subcategory_counts
            .entry((category.to_string(), subcategory.to_string()))
            .or_insert(0) += row.count;

        let Some(sub_subcategory) = row.sub_subcategory() else {
            return;
        };
        *self
            .sub_subcategory_counts
            .entry((
                category.to_string(),
                subcategory.to_string(),
                sub_subcategory.to_string(),
            ))
            .or_insert(0) += row.count;
    }

    /// Number of documents `into_documents` will produce
    pub fn document_count(&self) -> usize {
        self.category_counts.len() + self.subcategory_counts.len() + self.sub_subcategory_counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.category_counts.is_empty()
    }

    /// Materialize one document per key: categories first, then subcategories,
    /// then sub-subcategories, each in key order.
    pub fn into_documents(self, stamp: Option<DateTime<Utc>>) -> Vec<FilterMetadata> {
        let mut docs = Vec::with_capacity(self.document_count());

        docs.extend(
            self.category_counts
                .into_iter()
                .map(|(value, count)| FilterMetadata::category(&value, count)),
        );
        docs.extend(
            self.subcategory_counts
                .into_iter()
                .map(|((category, value), count)| FilterMetadata::subcategory(&category, &value, count)),
        );
        docs.extend(self.sub_subcategory_counts.into_iter().map(
            |((category, subcategory, value), count)| {
                FilterMetadata::sub_subcategory(&category, &subcategory, &value, count)
            },
        ));

        match stamp {
            Some(at) => docs.into_iter().map(|doc| doc.stamped(at)).collect(),
            None => docs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::FilterKind;

    fn row(c: Option<&str>, s: Option<&str>, ss: Option<&str>, n: i64) -> HierarchyRow {
        HierarchyRow::new(c, s, ss, n)
    }

    fn rollup_of<'a>(rows: impl IntoIterator<Item = &'a HierarchyRow>) -> HierarchyRollup {
        let mut rollup = HierarchyRollup::new();
        for row in rows {
            rollup.add_row(row);
        }
        rollup
    }

    #[test]
    fn test_three_record_scenario() {
        // {A,X} twice and {A,Y} once arrive as two grouped rows
        let rows = vec![row(Some("A"), Some("X"), None, 2), row(Some("A"), Some("Y"), None, 1)];
        let rollup = rollup_of(&rows);

        assert_eq!(rollup.category_counts.get("A"), Some(&3));
        assert_eq!(rollup.subcategory_counts.get(&("A".into(), "X".into())), Some(&2));
        assert_eq!(rollup.subcategory_counts.get(&("A".into(), "Y".into())), Some(&1));
        assert!(rollup.sub_subcategory_counts.is_empty());

        let docs = rollup.into_documents(None);
        assert_eq!(
            docs,
            vec![
                FilterMetadata::category("A", 3),
                FilterMetadata::subcategory("A", "X", 2),
                FilterMetadata::subcategory("A", "Y", 1),
            ]
        );
    }

    #[test]
    fn test_absent_category_blocks_every_level() {
        let rows = vec![
            row(Some("N/A"), Some("X"), None, 1),
            row(None, Some("X"), Some("Q"), 5),
        ];
        let rollup = rollup_of(&rows);
        assert!(rollup.is_empty());
        assert_eq!(rollup.document_count(), 0);
    }

    #[test]
    fn test_absent_subcategory_stops_at_category() {
        let rows = vec![
            row(Some("A"), None, Some("Q"), 4),
            row(Some("A"), Some("N/A"), Some("Q"), 6),
        ];
        let rollup = rollup_of(&rows);
        assert_eq!(rollup.category_counts.get("A"), Some(&10));
        assert!(rollup.subcategory_counts.is_empty());
        assert!(rollup.sub_subcategory_counts.is_empty());
    }

    #[test]
    fn test_full_hierarchy_counts_every_level() {
        let rows = vec![
            row(Some("A"), Some("X"), Some("Q"), 3),
            row(Some("A"), Some("X"), Some("R"), 2),
            row(Some("A"), Some("X"), None, 1),
            row(Some("B"), Some("X"), Some("Q"), 7),
        ];
        let rollup = rollup_of(&rows);

        assert_eq!(rollup.category_counts.get("A"), Some(&6));
        assert_eq!(rollup.category_counts.get("B"), Some(&7));
        assert_eq!(rollup.subcategory_counts.get(&("A".into(), "X".into())), Some(&6));
        assert_eq!(
            rollup
                .sub_subcategory_counts
                .get(&("A".into(), "X".into(), "Q".into())),
            Some(&3)
        );
        assert_eq!(rollup.sub_subcategory_counts.len(), 3);
    }

    #[test]
    fn test_order_does_not_change_totals() {
        let rows = vec![
            row(Some("A"), Some("X"), Some("Q"), 3),
            row(Some("B"), None, None, 2),
            row(Some("A"), Some("Y"), None, 9),
            row(Some("A"), Some("X"), None, 1),
        ];
        let forward = rollup_of(&rows);
        let backward = rollup_of(rows.iter().rev());
        assert_eq!(forward, backward);
        assert_eq!(forward.into_documents(None), backward.into_documents(None));
    }

    #[test]
    fn test_repeated_key_accumulates() {
        let mut rollup = HierarchyRollup::new();
        rollup.add_row(&row(Some("A"), None, None, 1));
        rollup.add_row(&row(Some("A"), None, None, 2));
        assert_eq!(rollup.category_counts.get("A"), Some(&3));
    }

    #[test]
    fn test_delimiter_in_labels_keeps_levels_apart() {
        // "A:B" + "C" and "A" + "B:C" would collide as joined strings
        let rows = vec![
            row(Some("A:B"), Some("C"), None, 1),
            row(Some("A"), Some("B:C"), None, 1),
        ];
        let rollup = rollup_of(&rows);
        assert_eq!(rollup.subcategory_counts.len(), 2);

        let docs = rollup.into_documents(None);
        let subs: Vec<_> = docs
            .iter()
            .filter(|d| d.kind == FilterKind::Subcategory)
            .map(|d| (d.category.clone().unwrap(), d.value.clone()))
            .collect();
        assert!(subs.contains(&("A:B".to_string(), "C".to_string())));
        assert!(subs.contains(&("A".to_string(), "B:C".to_string())));
    }

    #[test]
    fn test_stamp_applies_to_every_document() {
        let rows = vec![row(Some("A"), Some("X"), Some("Q"), 1)];
        let at = Utc::now();
        let docs = rollup_of(&rows).into_documents(Some(at));
        assert_eq!(docs.len(), 3);
        assert!(docs.iter().all(|d| d.last_updated == Some(at)));
    }
}
