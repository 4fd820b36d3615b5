use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::RarityError;

/// Short internal taxon code (eBird style, e.g. `amerob`) resolved from a GBIF key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SpeciesCode(String);

impl SpeciesCode {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SpeciesCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SpeciesCode {
    type Err = RarityError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let is_valid = !trimmed.is_empty()
            && trimmed
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-');
        if !is_valid {
            return Err(RarityError::InvalidConfig(format!(
                "invalid species code: {value:?}"
            )));
        }
        Ok(Self(trimmed.to_string()))
    }
}

/// Geohash cell identifier at a fixed precision.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CellKey(String);

impl CellKey {
    pub(crate) fn from_geohash(hash: String) -> Self {
        Self(hash)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn precision(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Display for CellKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// State or province name used as a facet filter.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Region(String);

impl Region {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OccurrenceRecord<'a> {
    pub taxon_key: u64,
    pub species: &'a SpeciesCode,
    pub latitude: f64,
    pub longitude: f64,
}

/// Inclusive year window for remote occurrence queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct YearRange {
    pub from: i32,
    pub to: i32,
}

impl YearRange {
    pub fn new(from: i32, to: i32) -> Result<Self, RarityError> {
        if from > to {
            return Err(RarityError::InvalidConfig(format!(
                "year range starts after it ends: {from}..{to}"
            )));
        }
        Ok(Self { from, to })
    }

    /// GBIF range syntax, `from,to`.
    pub fn query_value(&self) -> String {
        format!("{},{}", self.from, self.to)
    }
}

impl Default for YearRange {
    fn default() -> Self {
        Self {
            from: 2019,
            to: 2024,
        }
    }
}

impl fmt::Display for YearRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.from, self.to)
    }
}

impl FromStr for YearRange {
    type Err = RarityError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || RarityError::InvalidConfig(format!("invalid year range: {value:?}"));
        let (from, to) = value
            .trim()
            .split_once([',', '-'])
            .ok_or_else(invalid)?;
        let from = from.trim().parse::<i32>().map_err(|_| invalid())?;
        let to = to.trim().parse::<i32>().map_err(|_| invalid())?;
        YearRange::new(from, to)
    }
}

/// What the orchestrator does with an entity whose remote call was exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ExhaustedPolicy {
    /// Record a count of zero and keep the entity in the population.
    #[default]
    Zero,
    /// Leave the entity out of the output.
    Skip,
    /// Cancel the run.
    Abort,
}

impl fmt::Display for ExhaustedPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExhaustedPolicy::Zero => write!(f, "zero"),
            ExhaustedPolicy::Skip => write!(f, "skip"),
            ExhaustedPolicy::Abort => write!(f, "abort"),
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn year_range_accepts_both_separators() {
        let comma: YearRange = "2019,2024".parse().unwrap();
        let dash: YearRange = "2019-2024".parse().unwrap();
        assert_eq!(comma, dash);
        assert_eq!(comma.query_value(), "2019,2024");
    }

    #[test]
    fn year_range_rejects_inverted() {
        let err = "2024,2019".parse::<YearRange>().unwrap_err();
        assert_matches!(err, RarityError::InvalidConfig(_));
    }

    #[test]
    fn species_code_rejects_blank() {
        assert!("  ".parse::<SpeciesCode>().is_err());
        assert_eq!("amerob".parse::<SpeciesCode>().unwrap().as_str(), "amerob");
    }
}
