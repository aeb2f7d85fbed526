//! Per-category facet cache
//!
//! The second precompute pass. For every present category it collects the
//! distinct subcategory, sub-subcategory, country, state and city labels seen
//! on records of that category and materializes one `filtersCache` document
//! per category. Absent labels (null, missing, `"N/A"`) are never collected,
//! and records with an absent category contribute nothing.

use crate::hierarchy::present;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// Source field holding the country label
pub const COUNTRY_FIELD: &str = "Country";
/// Source field holding the state label
pub const STATE_FIELD: &str = "State";
/// Source field holding the city label
pub const CITY_FIELD: &str = "City";

/// One of the label lists kept per category
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FacetField {
    SubCategories,
    SubSubCategories,
    Countries,
    States,
    Cities,
}

impl FacetField {
    pub const ALL: [FacetField; 5] = [
        FacetField::SubCategories,
        FacetField::SubSubCategories,
        FacetField::Countries,
        FacetField::States,
        FacetField::Cities,
    ];

    /// Field name in the cache document
    pub fn as_str(&self) -> &'static str {
        match self {
            FacetField::SubCategories => "subCategories",
            FacetField::SubSubCategories => "subSubCategories",
            FacetField::Countries => "countries",
            FacetField::States => "states",
            FacetField::Cities => "cities",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        FacetField::ALL.into_iter().find(|field| field.as_str() == raw)
    }

    /// Source record field the labels are read from
    pub fn source_field(&self) -> &'static str {
        match self {
            FacetField::SubCategories => crate::hierarchy::SUBCATEGORY_FIELD,
            FacetField::SubSubCategories => crate::hierarchy::SUB_SUBCATEGORY_FIELD,
            FacetField::Countries => COUNTRY_FIELD,
            FacetField::States => STATE_FIELD,
            FacetField::Cities => CITY_FIELD,
        }
    }
}

/// Distinct labels seen for one category, as read from the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CategoryFacets {
    pub category: String,
    pub sub_categories: BTreeSet<String>,
    pub sub_sub_categories: BTreeSet<String>,
    pub countries: BTreeSet<String>,
    pub states: BTreeSet<String>,
    pub cities: BTreeSet<String>,
}

impl CategoryFacets {
    pub fn new(category: &str) -> Self {
        Self {
            category: category.to_string(),
            ..Default::default()
        }
    }

    fn values_mut(&mut self, field: FacetField) -> &mut BTreeSet<String> {
        match field {
            FacetField::SubCategories => &mut self.sub_categories,
            FacetField::SubSubCategories => &mut self.sub_sub_categories,
            FacetField::Countries => &mut self.countries,
            FacetField::States => &mut self.states,
            FacetField::Cities => &mut self.cities,
        }
    }

    /// Record a label; placeholders and missing values are skipped.
    pub fn insert(&mut self, field: FacetField, value: Option<&str>) {
        if let Some(value) = present(value) {
            self.values_mut(field).insert(value.to_string());
        }
    }

    fn merge(&mut self, other: CategoryFacets) {
        self.sub_categories.extend(other.sub_categories);
        self.sub_sub_categories.extend(other.sub_sub_categories);
        self.countries.extend(other.countries);
        self.states.extend(other.states);
        self.cities.extend(other.cities);
    }
}

/// A materialized `filtersCache` document
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FiltersCacheEntry {
    pub category: String,
    pub sub_categories: Vec<String>,
    pub sub_sub_categories: Vec<String>,
    pub countries: Vec<String>,
    pub states: Vec<String>,
    pub cities: Vec<String>,
    pub last_updated: DateTime<Utc>,
}

impl FiltersCacheEntry {
    pub fn values(&self, field: FacetField) -> &[String] {
        match field {
            FacetField::SubCategories => &self.sub_categories,
            FacetField::SubSubCategories => &self.sub_sub_categories,
            FacetField::Countries => &self.countries,
            FacetField::States => &self.states,
            FacetField::Cities => &self.cities,
        }
    }
}

/// Folds category facets into one entry per category.
///
/// A category arriving more than once has its label sets unioned, so the
/// result does not depend on how the store splits its rows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FacetRollup {
    pub by_category: BTreeMap<String, CategoryFacets>,
}

impl FacetRollup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, facets: CategoryFacets) {
        if present(Some(&facets.category)).is_none() {
            return;
        }
        match self.by_category.get_mut(&facets.category) {
            Some(existing) => existing.merge(facets),
            None => {
                self.by_category.insert(facets.category.clone(), facets);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.by_category.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_category.is_empty()
    }

    /// True when no category carries a single sub-subcategory label
    pub fn lacks_sub_subcategories(&self) -> bool {
        self.by_category
            .values()
            .all(|facets| facets.sub_sub_categories.is_empty())
    }

    /// One entry per category in category order, labels sorted.
    pub fn into_entries(self, stamp: DateTime<Utc>) -> Vec<FiltersCacheEntry> {
        self.by_category
            .into_values()
            .map(|facets| FiltersCacheEntry {
                category: facets.category,
                sub_categories: facets.sub_categories.into_iter().collect(),
                sub_sub_categories: facets.sub_sub_categories.into_iter().collect(),
                countries: facets.countries.into_iter().collect(),
                states: facets.states.into_iter().collect(),
                cities: facets.cities.into_iter().collect(),
                last_updated: stamp,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn with(mut facets: CategoryFacets, field: FacetField, values: &[&str]) -> CategoryFacets {
        for value in values {
            facets.insert(field, Some(value));
        }
        facets
    }

    #[test]
    fn test_placeholders_are_not_collected() {
        let mut facets = CategoryFacets::new("Food");
        facets.insert(FacetField::Cities, Some("Leeds"));
        facets.insert(FacetField::Cities, Some("N/A"));
        facets.insert(FacetField::Cities, None);
        facets.insert(FacetField::Cities, Some("Leeds"));
        assert_eq!(facets.cities.len(), 1);
    }

    #[test]
    fn test_rollup_merges_and_skips_absent_categories() {
        let mut rollup = FacetRollup::new();
        rollup.add(with(CategoryFacets::new("Food"), FacetField::Countries, &["UK"]));
        rollup.add(with(CategoryFacets::new("Food"), FacetField::Countries, &["FR", "UK"]));
        rollup.add(with(CategoryFacets::new("N/A"), FacetField::Countries, &["DE"]));
        rollup.add(CategoryFacets::new("Auto"));

        assert_eq!(rollup.len(), 2);
        assert!(rollup.lacks_sub_subcategories());

        let at = Utc::now();
        let entries = rollup.into_entries(at);
        assert_eq!(entries[0].category, "Auto");
        assert!(entries[0].countries.is_empty());
        assert_eq!(entries[1].category, "Food");
        assert_eq!(entries[1].countries, vec!["FR".to_string(), "UK".to_string()]);
        assert!(entries.iter().all(|e| e.last_updated == at));
    }

    #[test]
    fn test_entry_document_shape() {
        let at = DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let mut rollup = FacetRollup::new();
        let food = with(CategoryFacets::new("Food"), FacetField::SubCategories, &["Bakery"]);
        let food = with(food, FacetField::SubSubCategories, &["Cakes"]);
        rollup.add(with(food, FacetField::States, &["Yorkshire"]));
        assert!(!rollup.lacks_sub_subcategories());

        let entry = &rollup.into_entries(at)[0];
        assert_eq!(
            serde_json::to_value(entry).unwrap(),
            json!({
                "category": "Food",
                "subCategories": ["Bakery"],
                "subSubCategories": ["Cakes"],
                "countries": [],
                "states": ["Yorkshire"],
                "cities": [],
                "lastUpdated": "2024-05-01T12:00:00Z"
            })
        );
    }

    #[test]
    fn test_field_names_round_trip() {
        for field in FacetField::ALL {
            assert_eq!(FacetField::parse(field.as_str()), Some(field));
        }
        assert_eq!(FacetField::Countries.source_field(), "Country");
        assert_eq!(FacetField::SubSubCategories.source_field(), "Categories");
        assert_eq!(FacetField::parse("category"), None);
    }
}
