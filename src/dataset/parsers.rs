//! Blocking wire-format parsers feeding streaming datasets.
//!
//! Each parser runs on tokio's blocking pool and pushes decoded elements into a
//! [`FeedSender`]. On the first bad element it records the failure, closes the
//! feed and cancels the ingestion's context; it never parses past an error.

use super::triples::StatementTerms;
use super::FeedSender;
use crate::context::Context;
use crate::core::{Reading, TripleFormat};
use crate::error::MortarError;
use oxigraph::io::RdfParser;
use std::io::Read;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Parse `timestamp,value` rows from `reader`. Resolves to the number of rows pushed.
pub fn spawn_csv_parser<R>(reader: R, sender: FeedSender<Reading>, ctx: Context) -> JoinHandle<u64>
where
    R: Read + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        // field counts are checked per row so errors can name the row
        let mut csv = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let mut pushed = 0u64;
        for (idx, record) in csv.records().enumerate() {
            let row = idx + 1;
            let parsed = match record {
                Ok(record) => Reading::from_csv_record(&record)
                    .map_err(|e| e.context(format!("Bad row {} in CSV file", row))),
                Err(e) => Err(MortarError::Validation(format!("Error reading CSV file: {}", e))),
            };
            match parsed {
                Ok(reading) => {
                    if !sender.blocking_send(reading) {
                        debug!(rows = pushed, "CSV consumer went away; stopping parser");
                        return pushed;
                    }
                    pushed += 1;
                }
                Err(err) => {
                    warn!(row, error = %err, "Rejecting CSV upload");
                    sender.fail(err);
                    ctx.cancel();
                    return pushed;
                }
            }
        }
        pushed
    })
}

/// Parse an RDF document from `reader`. Resolves to the number of statements pushed.
pub fn spawn_rdf_parser<R>(
    reader: R,
    format: TripleFormat,
    sender: FeedSender<StatementTerms>,
    ctx: Context,
) -> JoinHandle<u64>
where
    R: Read + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let mut pushed = 0u64;
        for quad in RdfParser::from_format(format.rdf_format()).for_reader(reader) {
            match quad {
                Ok(quad) => {
                    if !sender.blocking_send(StatementTerms::from_quad(&quad)) {
                        debug!(statements = pushed, "RDF consumer went away; stopping parser");
                        return pushed;
                    }
                    pushed += 1;
                }
                Err(e) => {
                    let err = MortarError::Validation(format!(
                        "Could not parse statement {}: {}",
                        pushed + 1,
                        e
                    ));
                    warn!(error = %err, "Rejecting RDF upload");
                    sender.fail(err);
                    ctx.cancel();
                    return pushed;
                }
            }
        }
        pushed
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{Dataset, StreamingDataset, StreamingTripleDataset, TripleDataset};
    use chrono::Utc;
    use std::io::Cursor;

    #[tokio::test]
    async fn test_csv_parser_feeds_dataset() {
        let csv = "2020-01-01T00:00:00Z,1\n2020-01-01T00:01:00Z, 2.5\n";
        let ctx = Context::background();
        let (tx, mut ds) = StreamingDataset::channel("bldg1", "temp");
        ds.set_id(1).unwrap();
        let handle = spawn_csv_parser(Cursor::new(csv.as_bytes().to_vec()), tx, ctx.clone());

        let mut values = Vec::new();
        while ds.advance().await.unwrap() {
            values.push(ds.current().unwrap().value);
        }
        assert_eq!(values, vec![1.0, 2.5]);
        assert_eq!(handle.await.unwrap(), 2);
        assert!(!ctx.is_cancelled());
    }

    #[tokio::test]
    async fn test_csv_parser_reports_bad_row_and_cancels() {
        let csv = "2020-01-01T00:00:00Z,1\n2020-01-01T00:01:00Z,oops\n2020-01-01T00:02:00Z,3\n";
        let ctx = Context::background();
        let (tx, mut ds) = StreamingDataset::channel("bldg1", "temp");
        ds.set_id(1).unwrap();
        let handle = spawn_csv_parser(Cursor::new(csv.as_bytes().to_vec()), tx, ctx.clone());

        assert!(ds.advance().await.unwrap());
        let err = ds.advance().await.unwrap_err();
        assert!(err.to_string().contains("Bad row 2 in CSV file"), "unexpected error: {}", err);
        assert_eq!(handle.await.unwrap(), 1);
        assert!(ctx.is_cancelled());
    }

    #[tokio::test]
    async fn test_rdf_parser_feeds_dataset() {
        let doc = "<http://ex.org/a> <http://ex.org/p> <http://ex.org/b> .\n\
                   <http://ex.org/a> <http://ex.org/p> \"lit\" .\n";
        let (tx, mut ds) = StreamingTripleDataset::channel("bldg1", "upload", Utc::now());
        let handle = spawn_rdf_parser(
            Cursor::new(doc.as_bytes().to_vec()),
            TripleFormat::NTriples,
            tx,
            Context::background(),
        );
        let mut count = 0;
        while ds.advance().await.unwrap() {
            count += 1;
        }
        assert_eq!(count, 2);
        assert_eq!(handle.await.unwrap(), 2);
    }
}
