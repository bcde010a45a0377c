//! In-memory data source.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use super::DataSource;
use crate::domain::{RawRecord, TimeRange};
use crate::error::SourceError;

/// Records held in memory, grouped by entity
#[derive(Debug, Clone, Default)]
pub struct MemoryDataSource {
    records: Arc<RwLock<BTreeMap<String, Vec<RawRecord>>>>,
}

impl MemoryDataSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: impl IntoIterator<Item = RawRecord>) -> Self {
        let source = Self::new();
        source.extend(records);
        source
    }

    pub fn extend(&self, records: impl IntoIterator<Item = RawRecord>) {
        let mut map = self.records.write().unwrap_or_else(|e| e.into_inner());
        for record in records {
            map.entry(record.entity_id.clone()).or_default().push(record);
        }
    }

    /// Replace every record of one entity
    pub fn replace(&self, entity_id: &str, records: Vec<RawRecord>) {
        let mut map = self.records.write().unwrap_or_else(|e| e.into_inner());
        map.insert(entity_id.to_string(), records);
    }
}

#[async_trait]
impl DataSource for MemoryDataSource {
    fn name(&self) -> &str {
        "memory"
    }

    async fn fetch(&self, entity_id: &str, range: TimeRange) -> Result<Vec<RawRecord>, SourceError> {
        let map = self.records.read().unwrap_or_else(|e| e.into_inner());
        Ok(map
            .get(entity_id)
            .map(|records| {
                records
                    .iter()
                    // Records without a timestamp are passed through for the validator
                    .filter(|r| r.timestamp.map_or(true, |ts| range.contains(ts)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn entities(&self) -> Result<Vec<String>, SourceError> {
        let map = self.records.read().unwrap_or_else(|e| e.into_inner());
        Ok(map.keys().cloned().collect())
    }
}
