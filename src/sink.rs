use std::io::{BufWriter, Write};

use camino::Utf8Path;
use chrono::{DateTime, SecondsFormat, Utc};

use crate::domain::{CellKey, Region, SpeciesCode};
use crate::error::RarityError;

/// A row in one of the output tables, in column order.
pub trait OutputRow {
    fn record(&self) -> Vec<String>;
}

pub const FREQUENCY_HEADER: [&str; 4] = ["species_code", "n_records", "percentile", "last_sync"];
pub const REGION_HEADER: [&str; 5] =
    ["state", "species_code", "n_local", "percentile", "last_sync"];
pub const SEED_HEADER: [&str; 3] = ["species_code", "com_name", "gbif_key"];

pub fn cell_header(precision: usize) -> [String; 3] {
    [
        format!("geohash{precision}"),
        "species_code".to_string(),
        "n".to_string(),
    ]
}

/// ISO-8601 UTC with millisecond precision, e.g. `2024-06-01T12:00:00.000Z`.
pub fn sync_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn percentile_text(percentile: f64) -> String {
    format!("{percentile:.4}")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellCountRow {
    pub cell: CellKey,
    pub species: SpeciesCode,
    pub n: u64,
}

impl OutputRow for CellCountRow {
    fn record(&self) -> Vec<String> {
        vec![
            self.cell.to_string(),
            self.species.to_string(),
            self.n.to_string(),
        ]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FrequencyRow {
    pub species: SpeciesCode,
    pub n_records: u64,
    pub percentile: f64,
    pub last_sync: String,
}

impl OutputRow for FrequencyRow {
    fn record(&self) -> Vec<String> {
        vec![
            self.species.to_string(),
            self.n_records.to_string(),
            percentile_text(self.percentile),
            self.last_sync.clone(),
        ]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegionFrequencyRow {
    pub region: Region,
    pub species: SpeciesCode,
    pub n_local: u64,
    pub percentile: f64,
    pub last_sync: String,
}

impl OutputRow for RegionFrequencyRow {
    fn record(&self) -> Vec<String> {
        vec![
            self.region.to_string(),
            self.species.to_string(),
            self.n_local.to_string(),
            percentile_text(self.percentile),
            self.last_sync.clone(),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedRow {
    pub species: SpeciesCode,
    pub common_name: String,
    pub gbif_key: u64,
}

impl OutputRow for SeedRow {
    fn record(&self) -> Vec<String> {
        vec![
            self.species.to_string(),
            self.common_name.replace(',', ""),
            self.gbif_key.to_string(),
        ]
    }
}

/// Writes `header` and then every row, in order, to `destination`.
///
/// Output goes to a temporary file next to the destination which is renamed
/// into place only after a successful flush; if anything fails the temporary
/// file is removed and an existing destination is left as it was.
pub fn write_rows<H, R>(
    destination: &Utf8Path,
    header: &[H],
    rows: &[R],
) -> Result<usize, RarityError>
where
    H: AsRef<str>,
    R: OutputRow,
{
    let parent = match destination.parent() {
        Some(parent) if !parent.as_str().is_empty() => parent,
        _ => Utf8Path::new("."),
    };
    std::fs::create_dir_all(parent.as_std_path())
        .map_err(|err| RarityError::sink(destination, err))?;
    let temp = tempfile::Builder::new()
        .prefix(".rarity-out")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| RarityError::sink(destination, err))?;

    {
        let mut writer = csv::WriterBuilder::new()
            .terminator(csv::Terminator::Any(b'\n'))
            .from_writer(BufWriter::new(temp.as_file()));
        writer
            .write_record(header.iter().map(|h| h.as_ref()))
            .map_err(|err| RarityError::sink(destination, err))?;
        for row in rows {
            writer
                .write_record(row.record())
                .map_err(|err| RarityError::sink(destination, err))?;
        }
        let mut buffered = writer
            .into_inner()
            .map_err(|err| RarityError::sink(destination, err.error()))?;
        buffered
            .flush()
            .map_err(|err| RarityError::sink(destination, err))?;
    }
    temp.as_file()
        .sync_all()
        .map_err(|err| RarityError::sink(destination, err))?;
    temp.persist(destination.as_std_path())
        .map_err(|err| RarityError::sink(destination, err.error))?;

    tracing::debug!(path = %destination, rows = rows.len(), "output written");
    Ok(rows.len())
}
