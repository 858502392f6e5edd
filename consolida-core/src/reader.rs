//! Lazy, restartable reading of registry extracts in bounded batches.
//!
//! A reader holds at most one batch of decoded records. Each batch reports the
//! position of the next unread row; persisting that [`Checkpoint`] together
//! with the batch lets a later run reopen the file right after the last
//! committed batch.

use std::fs::File;
use std::io;
use std::marker::PhantomData;
use std::path::PathBuf;

use csv::{ByteRecord, Position, ReaderBuilder};
use serde::{Deserialize, Serialize};

use crate::decode::{DecodeError, FieldCursor, FromRow};
use crate::locator::SourceFile;
use crate::model::Period;
use crate::registry::{Layout, TextEncoding};

/// Rows per batch when nothing else is configured.
pub const DEFAULT_BATCH_SIZE: usize = 50_000;

// Upper bound for the up-front allocation of a batch.
const PREALLOCATED_ROWS: usize = 4_096;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
/// Byte, line, and record position of the next unread row of a file.
pub struct Checkpoint {
    /// Byte offset from the start of the file.
    pub byte: u64,
    /// One-based line number.
    pub line: u64,
    /// Zero-based record index.
    pub record: u64,
}

impl From<&Position> for Checkpoint {
    fn from(position: &Position) -> Self {
        Self {
            byte: position.byte(),
            line: position.line(),
            record: position.record(),
        }
    }
}

impl From<Checkpoint> for Position {
    fn from(checkpoint: Checkpoint) -> Self {
        let mut position = Position::new();
        position
            .set_byte(checkpoint.byte)
            .set_line(checkpoint.line)
            .set_record(checkpoint.record);
        position
    }
}

#[derive(thiserror::Error, Debug)]
/// Failures that make a whole file unreadable.
pub enum ReadError {
    /// The file could not be opened.
    #[error("Cannot open {path}: {source}")]
    Open {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        source: io::Error,
    },
    /// Reading or seeking failed mid-file.
    #[error("Cannot read {path}: {source}")]
    Io {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        source: csv::Error,
    },
    /// The batch size is zero.
    #[error("Batch size must be at least one row")]
    EmptyBatch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A row that was skipped, with the context needed to retry it manually.
pub struct RowError {
    /// Source file identifier.
    pub source: String,
    /// One-based line of the row.
    pub line: u64,
    /// First column of the row, usually its base identifier.
    pub key: Option<String>,
    /// Decoding failure.
    pub error: DecodeError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A decoded record and the line it came from.
pub struct SourceRecord<R> {
    /// One-based line of the row.
    pub line: u64,
    /// Decoded record.
    pub record: R,
}

#[derive(Debug)]
/// A bounded group of rows read from one file.
pub struct Batch<R> {
    /// Well-formed records, in file order.
    pub records: Vec<SourceRecord<R>>,
    /// Rows of this batch that could not be decoded.
    pub errors: Vec<RowError>,
    /// Position of the first row of the batch.
    pub start: Checkpoint,
    /// Position of the first row after the batch.
    pub resume_from: Checkpoint,
}

impl<R> Batch<R> {
    /// Rows consumed from the file by this batch, decoded or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len() + self.errors.len()
    }

    /// Whether the batch consumed no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Streams typed batches out of one extract.
pub struct BatchReader<R> {
    reader: csv::Reader<File>,
    path: PathBuf,
    source: String,
    period: Period,
    layout: Layout,
    batch_size: usize,
    record: ByteRecord,
    rows_read: u64,
    rows_skipped: u64,
    finished: bool,
    _records: PhantomData<fn() -> R>,
}

impl<R: FromRow> BatchReader<R> {
    /// Open `source` with `layout`, optionally seeking to a checkpoint.
    ///
    /// # Errors
    ///
    /// Returns a [`ReadError`] when the file cannot be opened or seeked.
    pub fn open(
        source: &SourceFile,
        layout: &Layout,
        batch_size: usize,
        resume: Option<Checkpoint>,
    ) -> Result<Self, ReadError> {
        if batch_size == 0 {
            return Err(ReadError::EmptyBatch);
        }
        let file = File::open(&source.path).map_err(|err| ReadError::Open {
            path: source.path.clone(),
            source: err,
        })?;
        let mut reader = ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .delimiter(layout.delimiter)
            .quote(layout.quote)
            .from_reader(file);
        if let Some(checkpoint) = resume {
            reader
                .seek(Position::from(checkpoint))
                .map_err(|err| ReadError::Io {
                    path: source.path.clone(),
                    source: err,
                })?;
        }
        Ok(Self {
            reader,
            path: source.path.clone(),
            source: source.source_id(),
            period: source.period,
            layout: layout.clone(),
            batch_size,
            record: ByteRecord::new(),
            rows_read: 0,
            rows_skipped: 0,
            finished: false,
            _records: PhantomData,
        })
    }

    /// Rows consumed so far by this reader.
    #[must_use]
    pub fn rows_read(&self) -> u64 {
        self.rows_read
    }

    /// Rows skipped so far because they could not be decoded.
    #[must_use]
    pub fn rows_skipped(&self) -> u64 {
        self.rows_skipped
    }

    /// Position of the next unread row.
    #[must_use]
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint::from(self.reader.position())
    }

    /// Read the next batch of at most `batch_size` rows.
    ///
    /// # Errors
    ///
    /// Returns [`ReadError::Io`] when the file itself cannot be read further.
    pub fn next_batch(&mut self) -> Result<Option<Batch<R>>, ReadError> {
        if self.finished {
            return Ok(None);
        }
        let start = self.checkpoint();
        let mut batch = Batch {
            records: Vec::with_capacity(self.batch_size.min(PREALLOCATED_ROWS)),
            errors: Vec::new(),
            start,
            resume_from: start,
        };

        while batch.len() < self.batch_size {
            let line = self.reader.position().line();
            match self.reader.read_byte_record(&mut self.record) {
                Ok(false) => {
                    self.finished = true;
                    break;
                }
                Ok(true) => {
                    self.rows_read += 1;
                    match self.decode() {
                        Ok(record) => batch.records.push(SourceRecord { line, record }),
                        Err(error) => batch.errors.push(self.row_error(line, error)),
                    }
                }
                Err(err) if err.is_io_error() => {
                    return Err(ReadError::Io {
                        path: self.path.clone(),
                        source: err,
                    });
                }
                Err(err) => {
                    self.rows_read += 1;
                    self.record.clear();
                    let error = DecodeError::Malformed(err.to_string());
                    batch.errors.push(self.row_error(line, error));
                }
            }
        }

        self.rows_skipped += batch.errors.len() as u64;
        for error in &batch.errors {
            tracing::debug!(
                source = %error.source,
                line = error.line,
                key = error.key.as_deref().unwrap_or(""),
                error = %error.error,
                "skipping malformed row"
            );
        }
        batch.resume_from = self.checkpoint();
        Ok((!batch.is_empty()).then_some(batch))
    }

    fn decode(&self) -> Result<R, DecodeError> {
        let expected = self.layout.columns.len();
        if self.record.len() != expected {
            return Err(DecodeError::ColumnCount {
                expected,
                found: self.record.len(),
            });
        }
        let values = self
            .record
            .iter()
            .zip(self.layout.columns.iter().copied())
            .map(|(bytes, column)| decode_text(bytes, self.layout.encoding, column))
            .collect::<Result<Vec<_>, _>>()?;
        let mut cursor = FieldCursor::new(self.layout.columns, &values);
        R::from_row(&mut cursor, self.period)
    }

    fn row_error(&self, line: u64, error: DecodeError) -> RowError {
        let key = self
            .record
            .get(0)
            .map(|bytes| decode_text(bytes, TextEncoding::Latin1, "key"))
            .and_then(Result::ok)
            .map(|text| text.trim().to_owned())
            .filter(|text| !text.is_empty());
        RowError {
            source: self.source.clone(),
            line,
            key,
            error,
        }
    }
}

impl<R: FromRow> Iterator for BatchReader<R> {
    type Item = Result<Batch<R>, ReadError>;

    fn next(&mut self) -> Option<Self::Item> {
        let next = self.next_batch();
        if next.is_err() {
            self.finished = true;
        }
        next.transpose()
    }
}

/// Decode one field in the layout encoding.
///
/// # Errors
///
/// Returns [`DecodeError::Encoding`] for invalid UTF-8; Latin-1 never fails.
pub fn decode_text(
    bytes: &[u8],
    encoding: TextEncoding,
    column: &'static str,
) -> Result<String, DecodeError> {
    match encoding {
        TextEncoding::Latin1 => Ok(bytes.iter().copied().map(char::from).collect()),
        TextEncoding::Utf8 => std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| DecodeError::Encoding(column)),
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::model::{Company, RecordKind};
    use crate::registry::KindRegistry;

    #[test]
    fn batches_report_where_the_next_one_starts() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("K3241.K03200Y0.D30513.EMPRECSV");
        let body: String = ["1", "2", "3"]
            .iter()
            .map(|id| format!("{id};EMPRESA;2062;49;0,00;03;\n"))
            .collect();
        fs::write(&path, body).expect("write extract");
        let source = SourceFile {
            period: "2023-05".parse().expect("valid period"),
            kind: RecordKind::Company,
            path,
        };
        let registry = KindRegistry::standard().expect("valid registry");
        let layout = registry.layout(RecordKind::Company).expect("layout");

        let mut reader = BatchReader::<Company>::open(&source, layout, 2, None).expect("open");
        let first = reader.next_batch().expect("read").expect("first batch");
        assert_eq!((first.start.byte, first.start.record), (0, 0), "starts at the top");
        assert_eq!((first.resume_from.line, first.resume_from.record), (3, 2), "after two rows");
        assert_eq!(reader.checkpoint(), first.resume_from, "reader agrees");

        let mut resumed =
            BatchReader::<Company>::open(&source, layout, 2, Some(first.resume_from))
                .expect("reopen");
        let rest = resumed.next_batch().expect("read").expect("remaining batch");
        let ids: Vec<&str> = rest
            .records
            .iter()
            .map(|row| row.record.base_id.as_str())
            .collect();
        assert_eq!(ids, vec!["00000003"], "only the unread row");
        assert_eq!(rest.records.first().map(|row| row.line), Some(3), "line kept");
        assert!(resumed.next_batch().expect("read").is_none(), "drained");
    }

    #[test]
    fn latin1_bytes_map_to_their_code_points() {
        let decoded = decode_text(b"S\xc3O PAULO \xe7", TextEncoding::Latin1, "label");
        assert_eq!(decoded.as_deref(), Ok("SÃO PAULO ç"), "one char per byte");
        assert!(
            decode_text(b"\xc3", TextEncoding::Utf8, "label").is_err(),
            "truncated utf-8 rejected"
        );
    }

    #[test]
    fn checkpoint_round_trips_through_csv_position() {
        let checkpoint = Checkpoint {
            byte: 120,
            line: 4,
            record: 3,
        };
        let position = Position::from(checkpoint);
        assert_eq!(Checkpoint::from(&position), checkpoint, "same position");
    }
}
