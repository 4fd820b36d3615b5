use std::io::Read;

use serde::{Deserialize, Serialize};

use crate::domain::OccurrenceRecord;
use crate::error::RarityError;
use crate::reference::ReferenceMap;

/// Rows between progress log lines.
pub const PROGRESS_EVERY: u64 = 100_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnNames {
    pub latitude: String,
    pub longitude: String,
    pub taxon_key: String,
}

impl Default for ColumnNames {
    fn default() -> Self {
        Self {
            latitude: "decimalLatitude".to_string(),
            longitude: "decimalLongitude".to_string(),
            taxon_key: "taxonKey".to_string(),
        }
    }
}

/// How occurrence rows are laid out. GBIF Darwin Core archives are
/// tab-separated and unquoted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordFormat {
    pub delimiter: u8,
    pub quoting: bool,
    pub columns: ColumnNames,
}

impl Default for RecordFormat {
    fn default() -> Self {
        Self {
            delimiter: b'\t',
            quoting: false,
            columns: ColumnNames::default(),
        }
    }
}

/// Running totals for one ingestion pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RowTally {
    pub rows: u64,
    pub matched: u64,
    pub parse_errors: u64,
    pub unresolved: u64,
}

impl RowTally {
    pub fn dropped(&self) -> u64 {
        self.parse_errors + self.unresolved
    }

    pub fn dropped_fraction(&self) -> f64 {
        if self.rows == 0 {
            return 0.0;
        }
        self.dropped() as f64 / self.rows as f64
    }

    pub fn merge(&mut self, other: &RowTally) {
        self.rows += other.rows;
        self.matched += other.matched;
        self.parse_errors += other.parse_errors;
        self.unresolved += other.unresolved;
    }
}

enum RowOutcome {
    Parsed { latitude: f64, longitude: f64, key: u64 },
    Malformed(RarityError),
}

/// Single-pass projection of delimited rows into resolved occurrences.
/// Malformed and unresolvable rows are tallied and skipped; only I/O failures
/// of the underlying stream surface as errors, after which iteration stops.
pub struct OccurrenceRows<'m, R: Read> {
    entry: String,
    reader: csv::Reader<R>,
    record: csv::ByteRecord,
    latitude_idx: usize,
    longitude_idx: usize,
    key_idx: usize,
    reference: &'m ReferenceMap,
    tally: RowTally,
    finished: bool,
}

impl<'m, R: Read> OccurrenceRows<'m, R> {
    pub fn new(
        entry: &str,
        source: R,
        format: &RecordFormat,
        reference: &'m ReferenceMap,
    ) -> Result<Self, RarityError> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(format.delimiter)
            .quoting(format.quoting)
            .flexible(true)
            .from_reader(source);
        let headers = reader
            .byte_headers()
            .map_err(|err| RarityError::ArchiveCorrupt {
                path: entry.into(),
                message: format!("unreadable header: {err}"),
            })?
            .clone();
        let column = |name: &str| {
            headers
                .iter()
                .position(|h| trim_bytes(h) == name.as_bytes())
                .ok_or_else(|| RarityError::MissingColumn {
                    entry: entry.to_string(),
                    column: name.to_string(),
                })
        };

        Ok(Self {
            entry: entry.to_string(),
            latitude_idx: column(&format.columns.latitude)?,
            longitude_idx: column(&format.columns.longitude)?,
            key_idx: column(&format.columns.taxon_key)?,
            reader,
            record: csv::ByteRecord::new(),
            reference,
            tally: RowTally::default(),
            finished: false,
        })
    }

    pub fn tally(&self) -> RowTally {
        self.tally
    }

    fn parse_current(&self) -> RowOutcome {
        let line = self.record.position().map(|p| p.line()).unwrap_or(0);
        let malformed =
            |message: String| RowOutcome::Malformed(RarityError::RowParse { line, message });
        let field = |idx: usize, name: &str| -> Result<&str, String> {
            let raw = self
                .record
                .get(idx)
                .ok_or_else(|| format!("row is missing the {name} field"))?;
            std::str::from_utf8(raw)
                .map(str::trim)
                .map_err(|_| format!("{name} is not valid UTF-8"))
        };

        let coordinate = |idx: usize, name: &str, limit: f64| -> Result<f64, String> {
            let text = field(idx, name)?;
            let value = text
                .parse::<f64>()
                .map_err(|_| format!("{name} {text:?} is not a number"))?;
            if !value.is_finite() || value.abs() > limit {
                return Err(format!("{name} {value} is out of range"));
            }
            Ok(value)
        };

        let latitude = match coordinate(self.latitude_idx, "latitude", 90.0) {
            Ok(value) => value,
            Err(message) => return malformed(message),
        };
        let longitude = match coordinate(self.longitude_idx, "longitude", 180.0) {
            Ok(value) => value,
            Err(message) => return malformed(message),
        };
        let key = match field(self.key_idx, "taxon key").and_then(|text| {
            text.parse::<u64>()
                .map_err(|_| format!("taxon key {text:?} is not numeric"))
        }) {
            Ok(key) => key,
            Err(message) => return malformed(message),
        };

        RowOutcome::Parsed {
            latitude,
            longitude,
            key,
        }
    }

    fn log_progress(&self) {
        if self.tally.rows % PROGRESS_EVERY == 0 {
            tracing::info!(
                entry = %self.entry,
                processed = self.tally.rows,
                matched = self.tally.matched,
                parse_errors = self.tally.parse_errors,
                unresolved = self.tally.unresolved,
                "ingest progress"
            );
        }
    }
}

impl<'m, R: Read> Iterator for OccurrenceRows<'m, R> {
    type Item = Result<OccurrenceRecord<'m>, RarityError>;

    fn next(&mut self) -> Option<Self::Item> {
        let reference: &'m ReferenceMap = self.reference;
        while !self.finished {
            match self.reader.read_byte_record(&mut self.record) {
                Ok(false) => self.finished = true,
                Ok(true) => {
                    self.tally.rows += 1;
                    self.log_progress();
                    match self.parse_current() {
                        RowOutcome::Malformed(err) => {
                            self.tally.parse_errors += 1;
                            tracing::trace!(entry = %self.entry, "dropped row: {err}");
                        }
                        RowOutcome::Parsed {
                            latitude,
                            longitude,
                            key,
                        } => match reference.resolve(key) {
                            Some(species) => {
                                self.tally.matched += 1;
                                return Some(Ok(OccurrenceRecord {
                                    taxon_key: key,
                                    species,
                                    latitude,
                                    longitude,
                                }));
                            }
                            None => {
                                self.tally.unresolved += 1;
                                tracing::trace!(
                                    entry = %self.entry,
                                    "dropped row: {}",
                                    RarityError::UnresolvedReferenceKey(key)
                                );
                            }
                        },
                    }
                }
                Err(err) if err.is_io_error() => {
                    self.finished = true;
                    return Some(Err(RarityError::ArchiveCorrupt {
                        path: self.entry.as_str().into(),
                        message: err.to_string(),
                    }));
                }
                Err(err) => {
                    self.tally.rows += 1;
                    self.tally.parse_errors += 1;
                    tracing::trace!(entry = %self.entry, "dropped row: {err}");
                }
            }
        }
        None
    }
}

fn trim_bytes(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &bytes[start..end]
}
