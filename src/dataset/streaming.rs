use super::{bind_once, feed, require_id, Dataset, FeedReceiver, FeedSender};
use crate::core::{Reading, ReadingRow};
use crate::error::{MortarError, Result};
use async_trait::async_trait;
use std::fmt;

/// Dataset fed one reading at a time by a producer task (e.g. a CSV parser).
#[derive(Debug)]
pub struct StreamingDataset {
    source_name: String,
    name: String,
    id: Option<i64>,
    readings: FeedReceiver<Reading>,
    current: Option<Reading>,
}

impl StreamingDataset {
    /// A dataset plus the sender its producer pushes readings into.
    pub fn channel(source_name: &str, name: &str) -> (FeedSender<Reading>, Self) {
        let (tx, rx) = feed();
        let ds = Self {
            source_name: source_name.to_string(),
            name: name.to_string(),
            id: None,
            readings: rx,
            current: None,
        };
        (tx, ds)
    }
}

#[async_trait]
impl Dataset for StreamingDataset {
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
        self.current = self.readings.next().await?;
        Ok(self.current.is_some())
    }

    fn current(&self) -> Result<ReadingRow> {
        let stream_id = require_id(self.id)?;
        let reading =
            self.current.ok_or_else(|| MortarError::Internal("No current reading".to_string()))?;
        Ok(ReadingRow { time: reading.time, stream_id, value: reading.value })
    }

    fn take_failure(&mut self) -> Option<MortarError> {
        self.readings.take_failure()
    }
}

impl fmt::Display for StreamingDataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Dataset[SourceName={}, Name={}, # Readings=?]", self.source_name, self.name)
    }
}
