use super::{bind_once, require_id, Dataset};
use crate::core::{Reading, ReadingRow};
use crate::error::{MortarError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::fmt;

/// Dataset over readings that have already been fully received.
///
/// Deserializes from `{"SourceName": .., "Name": .., "Readings": [[ts, value], ..]}`.
#[derive(Debug, Clone, Deserialize)]
pub struct ArrayDataset {
    #[serde(alias = "SourceName", default)]
    source_name: String,
    #[serde(alias = "Name", default)]
    name: String,
    #[serde(alias = "Readings", default)]
    readings: Vec<Reading>,
    #[serde(skip)]
    id: Option<i64>,
    #[serde(skip)]
    cursor: Option<usize>,
}

impl ArrayDataset {
    pub fn new(source_name: &str, name: &str, readings: Vec<Reading>) -> Self {
        Self {
            source_name: source_name.to_string(),
            name: name.to_string(),
            readings,
            id: None,
            cursor: None,
        }
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }
}

#[async_trait]
impl Dataset for ArrayDataset {
    fn source_name(&self) -> &str {
        &self.source_name
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn set_id(&mut self, id: i64) -> Result<()> {
        bind_once(&mut self.id, id, &self.source_name, &self.name)
    }

    async fn advance(&mut self) -> Result<bool> {
        let next = self.cursor.map_or(0, |c| c + 1).min(self.readings.len());
        self.cursor = Some(next);
        Ok(next < self.readings.len())
    }

    fn current(&self) -> Result<ReadingRow> {
        let stream_id = require_id(self.id)?;
        let reading = self
            .cursor
            .and_then(|c| self.readings.get(c))
            .ok_or_else(|| MortarError::Internal("No current reading".to_string()))?;
        Ok(ReadingRow { time: reading.time, stream_id, value: reading.value })
    }
}

impl fmt::Display for ArrayDataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Dataset[SourceName={}, Name={}, # Readings={}]",
            self.source_name,
            self.name,
            self.readings.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAYLOAD: &str = r#"{
        "SourceName": "bldg1",
        "Name": "temp",
        "Readings": [["2020-01-01T00:00:00Z", 1.0], ["2020-01-01T00:01:00Z", 2.5]]
    }"#;

    #[tokio::test]
    async fn test_pull_protocol() {
        let mut ds: ArrayDataset = serde_json::from_str(PAYLOAD).unwrap();
        assert_eq!(ds.len(), 2);
        ds.set_id(9).unwrap();

        let mut values = Vec::new();
        while ds.advance().await.unwrap() {
            let row = ds.current().unwrap();
            assert_eq!(row.stream_id, 9);
            values.push(row.value);
        }
        assert_eq!(values, vec![1.0, 2.5]);
        assert!(!ds.advance().await.unwrap());
    }

    #[tokio::test]
    async fn test_current_requires_id() {
        let mut ds: ArrayDataset = serde_json::from_str(PAYLOAD).unwrap();
        assert!(ds.advance().await.unwrap());
        let err = ds.current().unwrap_err();
        assert!(err.to_string().contains("Need to set ID"));
    }

    #[test]
    fn test_set_id_only_once() {
        let mut ds = ArrayDataset::new("bldg1", "temp", Vec::new());
        ds.set_id(1).unwrap();
        assert!(ds.set_id(2).is_err());
    }

    #[test]
    fn test_check_requires_names() {
        let ds = ArrayDataset::new("", "temp", Vec::new());
        assert!(ds.check().is_err());
        assert_eq!(ds.to_string(), "Dataset[SourceName=, Name=temp, # Readings=0]");
    }
}
