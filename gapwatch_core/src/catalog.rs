//! Collection catalog seam.
//!
//! The catalog is the external system of record for collection extents and
//! historical data units. Registration reads extents from it; backfill pages
//! through its units.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{GapError, Result};
use crate::ranges::TimeRange;
use crate::types::{Collection, CollectionId, EventKind, EventRecord};

/// A historical data unit with its closed temporal interval.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataUnit {
    /// Catalog-assigned id
    pub id: String,
    /// Interval start
    pub start: DateTime<Utc>,
    /// Interval end
    pub end: DateTime<Utc>,
}

impl DataUnit {
    /// Converts the unit into a data-added event record.
    pub fn to_record(&self, collection: &CollectionId) -> EventRecord {
        EventRecord::new(
            self.id.clone(),
            collection,
            self.start,
            self.end,
            EventKind::DataAdded,
        )
    }
}

/// One page of catalog units.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CatalogPage {
    /// Units in this page
    pub units: Vec<DataUnit>,
    /// Cursor for the next page; `None` when exhausted
    pub next: Option<String>,
}

/// Read access to the collection catalog.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Returns the collection with its temporal extent, if the catalog
    /// knows it.
    async fn collection(&self, id: &CollectionId) -> Result<Option<Collection>>;

    /// Number of data units recorded for the collection.
    async fn unit_count(&self, id: &CollectionId) -> Result<u64>;

    /// Units whose start lies in `window`, ordered by start.
    async fn units_page(
        &self,
        id: &CollectionId,
        window: &TimeRange,
        cursor: Option<String>,
        page_size: usize,
    ) -> Result<CatalogPage>;
}

#[derive(Debug, Default)]
struct Entry {
    collection: Option<Collection>,
    units: Vec<DataUnit>,
}

/// In-memory catalog.
#[derive(Debug, Default)]
pub struct StaticCatalog {
    entries: RwLock<HashMap<CollectionId, Entry>>,
}

impl StaticCatalog {
    /// Creates an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a collection.
    pub async fn insert_collection(&self, collection: Collection) {
        let key = collection.id.clone();
        let mut entries = self.entries.write().await;
        entries.entry(key).or_default().collection = Some(collection);
    }

    /// Appends data units to a collection.
    pub async fn add_units(&self, id: &CollectionId, units: impl IntoIterator<Item = DataUnit>) {
        let mut entries = self.entries.write().await;
        let entry = entries.entry(id.clone()).or_default();
        entry.units.extend(units);
        entry
            .units
            .sort_by(|a, b| a.start.cmp(&b.start).then_with(|| a.id.cmp(&b.id)));
    }
}

#[async_trait]
impl Catalog for StaticCatalog {
    async fn collection(&self, id: &CollectionId) -> Result<Option<Collection>> {
        let entries = self.entries.read().await;
        Ok(entries.get(id).and_then(|e| e.collection.clone()))
    }

    async fn unit_count(&self, id: &CollectionId) -> Result<u64> {
        let entries = self.entries.read().await;
        Ok(entries.get(id).map_or(0, |e| e.units.len() as u64))
    }

    async fn units_page(
        &self,
        id: &CollectionId,
        window: &TimeRange,
        cursor: Option<String>,
        page_size: usize,
    ) -> Result<CatalogPage> {
        let offset = match cursor {
            Some(c) => c
                .parse::<usize>()
                .map_err(|_| GapError::validation(format!("invalid catalog cursor: {}", c)))?,
            None => 0,
        };

        let entries = self.entries.read().await;
        let matching: Vec<&DataUnit> = entries
            .get(id)
            .map(|e| {
                e.units
                    .iter()
                    .filter(|u| window.start <= u.start && u.start < window.end)
                    .collect()
            })
            .unwrap_or_default();

        let end = (offset + page_size.max(1)).min(matching.len());
        let units: Vec<DataUnit> = matching
            .get(offset..end)
            .unwrap_or_default()
            .iter()
            .map(|u| (*u).clone())
            .collect();
        let next = (end < matching.len()).then(|| end.to_string());

        Ok(CatalogPage { units, next })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn unit(i: i64) -> DataUnit {
        let base = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        DataUnit {
            id: format!("G{}", i),
            start: base + Duration::hours(i),
            end: base + Duration::hours(i) + Duration::minutes(59),
        }
    }

    #[tokio::test]
    async fn test_paging_visits_every_unit_once() {
        let catalog = StaticCatalog::new();
        let id = CollectionId::new("X", "1.0").unwrap();
        catalog.add_units(&id, (0..25).map(unit)).await;

        let window = TimeRange::new(unit(0).start, unit(25).start).unwrap();
        let mut cursor = None;
        let mut seen = Vec::new();
        loop {
            let page = catalog.units_page(&id, &window, cursor, 10).await.unwrap();
            seen.extend(page.units.into_iter().map(|u| u.id));
            match page.next {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        assert_eq!(seen.len(), 25);
        assert_eq!(catalog.unit_count(&id).await.unwrap(), 25);
    }

    #[tokio::test]
    async fn test_window_filters_by_start() {
        let catalog = StaticCatalog::new();
        let id = CollectionId::new("X", "1.0").unwrap();
        catalog.add_units(&id, (0..10).map(unit)).await;

        let window = TimeRange::new(unit(2).start, unit(5).start).unwrap();
        let page = catalog.units_page(&id, &window, None, 100).await.unwrap();
        let ids: Vec<_> = page.units.iter().map(|u| u.id.as_str()).collect();
        assert_eq!(ids, vec!["G2", "G3", "G4"]);
        assert!(page.next.is_none());
    }

    #[tokio::test]
    async fn test_insert_collection_replaces_extent() {
        let catalog = StaticCatalog::new();
        let id = CollectionId::new("X", "1.0").unwrap();
        catalog.add_units(&id, (0..3).map(unit)).await;

        let mut collection = Collection {
            id: id.clone(),
            extent_start: unit(0).start,
            extent_end: None,
        };
        catalog.insert_collection(collection.clone()).await;
        collection.extent_end = Some(unit(3).start);
        catalog.insert_collection(collection.clone()).await;

        assert_eq!(catalog.collection(&id).await.unwrap(), Some(collection));
        assert_eq!(catalog.unit_count(&id).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_unknown_collection() {
        let catalog = StaticCatalog::new();
        let id = CollectionId::new("X", "1.0").unwrap();
        assert!(catalog.collection(&id).await.unwrap().is_none());
        assert_eq!(catalog.unit_count(&id).await.unwrap(), 0);
    }
}
