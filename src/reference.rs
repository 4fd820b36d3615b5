use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufReader, Read};

use camino::Utf8Path;
use flate2::read::GzDecoder;

use crate::domain::SpeciesCode;
use crate::error::RarityError;

pub const KEY_COLUMN: &str = "gbif_key";
pub const CODE_COLUMN: &str = "species_code";

/// One row of the reference mapping. Species the name matcher could not place
/// have no GBIF key; they stay in the list so remote counts can report them as
/// zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceEntry {
    pub code: SpeciesCode,
    pub gbif_key: Option<u64>,
}

/// GBIF taxon key → species code, loaded once and read-only for the run.
#[derive(Debug, Clone, Default)]
pub struct ReferenceMap {
    by_key: HashMap<u64, SpeciesCode>,
    entries: Vec<ReferenceEntry>,
}

impl ReferenceMap {
    pub fn from_entries(entries: Vec<ReferenceEntry>) -> Self {
        let mut by_key = HashMap::with_capacity(entries.len());
        for entry in &entries {
            if let Some(key) = entry.gbif_key {
                by_key.entry(key).or_insert_with(|| entry.code.clone());
            }
        }
        Self { by_key, entries }
    }

    /// Loads a CSV with `gbif_key` and `species_code` columns; `.gz` files are
    /// decompressed on the fly.
    pub fn load(path: &Utf8Path) -> Result<Self, RarityError> {
        let file = File::open(path.as_std_path()).map_err(|err| match err.kind() {
            io::ErrorKind::NotFound => RarityError::InputNotFound(path.to_path_buf()),
            _ => RarityError::ReferenceRead {
                path: path.to_path_buf(),
                message: err.to_string(),
            },
        })?;
        let reader: Box<dyn Read> = if path.extension() == Some("gz") {
            Box::new(GzDecoder::new(BufReader::new(file)))
        } else {
            Box::new(BufReader::new(file))
        };
        let map = Self::from_reader(reader).map_err(|err| match err {
            RarityError::ReferenceRead { message, .. } => RarityError::ReferenceRead {
                path: path.to_path_buf(),
                message,
            },
            other => other,
        })?;
        tracing::info!(
            path = %path,
            species = map.entries.len(),
            keyed = map.by_key.len(),
            "loaded reference mapping"
        );
        Ok(map)
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self, RarityError> {
        let read_err = |message: String| RarityError::ReferenceRead {
            path: Default::default(),
            message,
        };
        let mut csv = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
        let headers = csv.headers().map_err(|err| read_err(err.to_string()))?.clone();
        let column = |name: &str| {
            headers
                .iter()
                .position(|h| h == name)
                .ok_or_else(|| RarityError::MissingColumn {
                    entry: "reference mapping".to_string(),
                    column: name.to_string(),
                })
        };
        let key_idx = column(KEY_COLUMN)?;
        let code_idx = column(CODE_COLUMN)?;

        let mut entries = Vec::new();
        for record in csv.records() {
            let record = record.map_err(|err| read_err(err.to_string()))?;
            let Some(code) = record.get(code_idx).and_then(|v| v.parse::<SpeciesCode>().ok()) else {
                continue;
            };
            let gbif_key = record
                .get(key_idx)
                .filter(|v| !v.is_empty())
                .and_then(|v| v.parse::<u64>().ok());
            entries.push(ReferenceEntry { code, gbif_key });
        }
        Ok(Self::from_entries(entries))
    }

    pub fn resolve(&self, taxon_key: u64) -> Option<&SpeciesCode> {
        self.by_key.get(&taxon_key)
    }

    pub fn entries(&self) -> &[ReferenceEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub const CHECKLIST_CODE_COLUMN: &str = "species_code";
pub const CHECKLIST_COMMON_COLUMN: &str = "English name";
pub const CHECKLIST_SCIENTIFIC_COLUMN: &str = "scientific name";
pub const CHECKLIST_CATEGORY_COLUMN: &str = "category";

/// A taxonomy checklist row (Clements/eBird layout) awaiting a GBIF match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecklistEntry {
    pub code: SpeciesCode,
    pub common_name: String,
    pub scientific_name: String,
}

/// Reads checklist rows whose category equals `category` (case-insensitive).
pub fn load_checklist(path: &Utf8Path, category: &str) -> Result<Vec<ChecklistEntry>, RarityError> {
    let read_err = |message: String| RarityError::ReferenceRead {
        path: path.to_path_buf(),
        message,
    };
    let mut csv = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_path(path.as_std_path())
        .map_err(|err| match err.kind() {
            csv::ErrorKind::Io(io) if io.kind() == io::ErrorKind::NotFound => {
                RarityError::InputNotFound(path.to_path_buf())
            }
            _ => read_err(err.to_string()),
        })?;
    let headers = csv.headers().map_err(|err| read_err(err.to_string()))?.clone();
    let column = |name: &str| {
        headers
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| RarityError::MissingColumn {
                entry: path.to_string(),
                column: name.to_string(),
            })
    };
    let code_idx = column(CHECKLIST_CODE_COLUMN)?;
    let common_idx = column(CHECKLIST_COMMON_COLUMN)?;
    let scientific_idx = column(CHECKLIST_SCIENTIFIC_COLUMN)?;
    let category_idx = column(CHECKLIST_CATEGORY_COLUMN)?;

    let mut entries = Vec::new();
    let mut skipped = 0u64;
    for record in csv.records() {
        let record = record.map_err(|err| read_err(err.to_string()))?;
        let in_category = record
            .get(category_idx)
            .is_some_and(|value| value.eq_ignore_ascii_case(category));
        if !in_category {
            continue;
        }
        let code = record.get(code_idx).and_then(|v| v.parse::<SpeciesCode>().ok());
        let scientific_name = record.get(scientific_idx).filter(|v| !v.is_empty());
        match (code, scientific_name) {
            (Some(code), Some(scientific_name)) => entries.push(ChecklistEntry {
                code,
                common_name: record.get(common_idx).unwrap_or_default().to_string(),
                scientific_name: scientific_name.to_string(),
            }),
            _ => skipped += 1,
        }
    }
    tracing::info!(path = %path, category, taxa = entries.len(), skipped, "loaded checklist");
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_unkeyed_species_out_of_lookup() {
        let data = "species_code,com_name,gbif_key\n\
                    amerob,American Robin,9510564\n\
                    xxxbird,Unknown,\n";
        let map = ReferenceMap::from_reader(data.as_bytes()).unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map.resolve(9510564).unwrap().as_str(), "amerob");
        assert_eq!(map.entries()[1].gbif_key, None);
    }

    #[test]
    fn first_code_wins_for_duplicate_keys() {
        let data = "gbif_key,species_code\n1,aaa\n1,bbb\n";
        let map = ReferenceMap::from_reader(data.as_bytes()).unwrap();
        assert_eq!(map.resolve(1).unwrap().as_str(), "aaa");
    }
}
