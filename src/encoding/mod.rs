//! Arrow IPC encoding of read responses.
//!
//! A read response is two Arrow IPC streams written back to back:
//!
//! 1. a metadata stream holding one record batch with a row per resolved stream
//!    (`brick_class`, `brick_uri`, `units`, `name`, `stream_id`);
//! 2. a data stream holding any number of record batches of `(time, value, id)`,
//!    each at most `max_rows` rows long.
//!
//! Each stream carries its own schema message and end-of-stream marker, so a
//! consumer opens a stream reader, drains it, then opens the next one on the same
//! byte source. Encoded bytes are drained to the output after every message, so
//! memory stays bounded by one batch regardless of the result size.

use crate::core::{DataRow, StreamMetadata};
use crate::error::{MortarError, Result};
use arrow::array::{
    ArrayRef, Float64Builder, Int64Array, StringArray, StringBuilder, TimestampNanosecondBuilder,
};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use arrow::ipc::writer::StreamWriter;
use arrow::record_batch::RecordBatch;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// MIME type of a read response body
pub const ARROW_STREAM_CONTENT_TYPE: &str = "application/vnd.apache.arrow.stream";

pub fn metadata_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("brick_class", DataType::Utf8, true),
        Field::new("brick_uri", DataType::Utf8, true),
        Field::new("units", DataType::Utf8, true),
        Field::new("name", DataType::Utf8, true),
        Field::new("stream_id", DataType::Int64, false),
    ]))
}

pub fn data_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("time", DataType::Timestamp(TimeUnit::Nanosecond, Some("UTC".into())), false),
        Field::new("value", DataType::Float64, false),
        Field::new("id", DataType::Utf8, false),
    ]))
}

/// Build the single metadata record batch.
pub fn metadata_batch(rows: &[StreamMetadata]) -> Result<RecordBatch> {
    let classes: StringArray = rows.iter().map(|r| r.brick_class.as_deref()).collect();
    let uris: StringArray = rows.iter().map(|r| r.brick_uri.as_deref()).collect();
    let units: StringArray = rows.iter().map(|r| r.units.as_deref()).collect();
    let names: StringArray = rows.iter().map(|r| r.name.as_deref()).collect();
    let ids = Int64Array::from_iter_values(rows.iter().map(|r| r.stream_id));

    let columns: Vec<ArrayRef> =
        vec![Arc::new(classes), Arc::new(uris), Arc::new(units), Arc::new(names), Arc::new(ids)];
    Ok(RecordBatch::try_new(metadata_schema(), columns)?)
}

/// One Arrow IPC stream written to an async sink.
pub struct IpcStreamWriter<'a, W> {
    writer: StreamWriter<Vec<u8>>,
    out: &'a mut W,
}

impl<'a, W: AsyncWrite + Unpin + Send> IpcStreamWriter<'a, W> {
    /// Start a stream; the schema message is written immediately.
    pub async fn try_new(out: &'a mut W, schema: &Schema) -> Result<Self> {
        let writer = StreamWriter::try_new(Vec::new(), schema)?;
        let mut this = Self { writer, out };
        this.drain().await?;
        Ok(this)
    }

    pub async fn write(&mut self, batch: &RecordBatch) -> Result<()> {
        self.writer.write(batch)?;
        self.drain().await
    }

    /// Write the end-of-stream marker and flush the sink.
    pub async fn finish(mut self) -> Result<()> {
        self.writer.finish()?;
        self.drain().await?;
        self.out.flush().await.map_err(encoding_io)
    }

    async fn drain(&mut self) -> Result<()> {
        let bytes = std::mem::take(self.writer.get_mut());
        if !bytes.is_empty() {
            self.out.write_all(&bytes).await.map_err(encoding_io)?;
        }
        Ok(())
    }
}

fn encoding_io(err: std::io::Error) -> MortarError {
    MortarError::Encoding(format!("Could not write record: {}", err))
}

/// Write the metadata section of a read response.
pub async fn write_metadata<W>(out: &mut W, rows: &[StreamMetadata]) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    let batch = metadata_batch(rows)?;
    let mut writer = IpcStreamWriter::try_new(out, &metadata_schema()).await?;
    writer.write(&batch).await?;
    writer.finish().await
}

/// Buffers data rows and flushes a record batch every `max_rows` rows.
pub struct DataBatchWriter<'a, W> {
    stream: IpcStreamWriter<'a, W>,
    schema: SchemaRef,
    max_rows: usize,
    times: TimestampNanosecondBuilder,
    values: Float64Builder,
    labels: StringBuilder,
    buffered: usize,
    batches: usize,
    rows: u64,
}

impl<'a, W: AsyncWrite + Unpin + Send> DataBatchWriter<'a, W> {
    pub async fn try_new(out: &'a mut W, max_rows: usize) -> Result<Self> {
        if max_rows == 0 {
            return Err(MortarError::Internal("batch size must be positive".to_string()));
        }
        let schema = data_schema();
        let stream = IpcStreamWriter::try_new(out, &schema).await?;
        Ok(Self {
            stream,
            schema,
            max_rows,
            times: TimestampNanosecondBuilder::new().with_timezone("UTC"),
            values: Float64Builder::new(),
            labels: StringBuilder::new(),
            buffered: 0,
            batches: 0,
            rows: 0,
        })
    }

    pub async fn push(&mut self, row: &DataRow) -> Result<()> {
        let nanos = row.time.timestamp_nanos_opt().ok_or_else(|| {
            MortarError::Encoding(format!("Timestamp {} out of range", row.time.to_rfc3339()))
        })?;
        self.times.append_value(nanos);
        self.values.append_value(row.value);
        self.labels.append_value(&row.label);
        self.buffered += 1;
        self.rows += 1;

        if self.buffered >= self.max_rows {
            self.flush().await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        let columns: Vec<ArrayRef> = vec![
            Arc::new(self.times.finish()),
            Arc::new(self.values.finish()),
            Arc::new(self.labels.finish()),
        ];
        let batch = RecordBatch::try_new(self.schema.clone(), columns)?;
        self.stream.write(&batch).await?;
        self.buffered = 0;
        self.batches += 1;
        Ok(())
    }

    /// Flush the remainder and close the stream. An empty result still gets one
    /// zero-row batch so readers always see a batch.
    pub async fn finish(mut self) -> Result<EncodeSummary> {
        if self.buffered > 0 || self.batches == 0 {
            self.flush().await?;
        }
        let summary = EncodeSummary { rows: self.rows, batches: self.batches };
        self.stream.finish().await?;
        Ok(summary)
    }
}

/// What a data section contained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EncodeSummary {
    pub rows: u64,
    pub batches: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Array, Float64Array, TimestampNanosecondArray};
    use arrow::ipc::reader::StreamReader;
    use chrono::{TimeZone, Utc};
    use std::io::Cursor;

    fn row(secs: i64, value: f64) -> DataRow {
        DataRow {
            time: Utc.timestamp_opt(secs, 0).unwrap(),
            value,
            label: "http://ex.org/t1".to_string(),
        }
    }

    fn read_stream(cursor: &mut Cursor<Vec<u8>>) -> (SchemaRef, Vec<RecordBatch>) {
        let reader = StreamReader::try_new(cursor, None).unwrap();
        let schema = reader.schema();
        let batches = reader.collect::<std::result::Result<Vec<_>, _>>().unwrap();
        (schema, batches)
    }

    #[tokio::test]
    async fn test_metadata_then_data_sections() {
        let mut out = Vec::new();
        let metadata = vec![StreamMetadata {
            brick_class: Some("https://brickschema.org/schema/Brick#Temperature_Sensor".to_string()),
            brick_uri: None,
            units: Some("degF".to_string()),
            name: Some("temp".to_string()),
            stream_id: 7,
        }];
        write_metadata(&mut out, &metadata).await.unwrap();
        let mut data = DataBatchWriter::try_new(&mut out, 10).await.unwrap();
        data.push(&row(0, 1.5)).await.unwrap();
        data.push(&row(60, 2.5)).await.unwrap();
        let summary = data.finish().await.unwrap();
        assert_eq!(summary, EncodeSummary { rows: 2, batches: 1 });

        let mut cursor = Cursor::new(out);
        let (md_schema, md) = read_stream(&mut cursor);
        assert_eq!(md_schema, metadata_schema());
        assert_eq!(md.len(), 1);
        assert_eq!(md[0].num_rows(), 1);
        let uris = md[0].column(1).as_any().downcast_ref::<StringArray>().unwrap();
        assert!(uris.is_null(0));

        let (schema, batches) = read_stream(&mut cursor);
        assert_eq!(schema, data_schema());
        let times = batches[0].column(0).as_any().downcast_ref::<TimestampNanosecondArray>().unwrap();
        assert_eq!(times.value(1), 60_000_000_000);
        let values = batches[0].column(1).as_any().downcast_ref::<Float64Array>().unwrap();
        assert_eq!(values.value(0), 1.5);
    }

    #[tokio::test]
    async fn test_batches_split_at_max_rows() {
        let mut out = Vec::new();
        let mut data = DataBatchWriter::try_new(&mut out, 3).await.unwrap();
        for i in 0..7 {
            data.push(&row(i, i as f64)).await.unwrap();
        }
        let summary = data.finish().await.unwrap();
        assert_eq!(summary.batches, 3);

        let (_, batches) = read_stream(&mut Cursor::new(out));
        let sizes: Vec<usize> = batches.iter().map(|b| b.num_rows()).collect();
        assert_eq!(sizes, vec![3, 3, 1]);
    }

    #[tokio::test]
    async fn test_exact_multiple_has_no_trailing_empty_batch() {
        let mut out = Vec::new();
        let mut data = DataBatchWriter::try_new(&mut out, 2).await.unwrap();
        for i in 0..4 {
            data.push(&row(i, 0.0)).await.unwrap();
        }
        data.finish().await.unwrap();

        let (_, batches) = read_stream(&mut Cursor::new(out));
        assert_eq!(batches.len(), 2);
    }

    #[tokio::test]
    async fn test_empty_result_is_decodable() {
        let mut out = Vec::new();
        write_metadata(&mut out, &[]).await.unwrap();
        DataBatchWriter::try_new(&mut out, 2_000_000).await.unwrap().finish().await.unwrap();

        let mut cursor = Cursor::new(out);
        let (_, md) = read_stream(&mut cursor);
        assert_eq!(md[0].num_rows(), 0);
        let (schema, batches) = read_stream(&mut cursor);
        assert_eq!(schema.fields().len(), 3);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].num_rows(), 0);
    }
}
