use std::fs;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::archive::EntryMatcher;
use crate::domain::{ExhaustedPolicy, Region, YearRange};
use crate::error::RarityError;
use crate::gbif::{DEFAULT_BASE_URL, QueryFilters};
use crate::geohash::Precision;
use crate::records::{ColumnNames, RecordFormat};
use crate::remote::RetryPolicy;
use crate::throttle::RateLimits;

pub const DEFAULT_CONFIG_FILE: &str = "rarity.json";

/// On-disk configuration. Every field is optional; missing values fall back to
/// the built-in defaults.
#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub qps: Option<u32>,
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub backoff_base_ms: Option<u64>,
    #[serde(default)]
    pub call_timeout_secs: Option<u64>,
    #[serde(default)]
    pub run_timeout_secs: Option<u64>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub years: Option<YearRange>,
    #[serde(default)]
    pub licenses: Option<Vec<String>>,
    #[serde(default)]
    pub higher_taxon_key: Option<u64>,
    #[serde(default)]
    pub countries: Option<Vec<String>>,
    #[serde(default)]
    pub basis_of_record: Option<String>,
    #[serde(default)]
    pub regions: Option<Vec<String>>,
    #[serde(default)]
    pub precision: Option<usize>,
    #[serde(default)]
    pub exhausted_policy: Option<ExhaustedPolicy>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub entry_suffix: Option<String>,
    #[serde(default)]
    pub entry_pattern: Option<String>,
    #[serde(default)]
    pub delimiter: Option<char>,
    #[serde(default)]
    pub columns: Option<ColumnNames>,
}

/// Command-line values that take precedence over the config file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub qps: Option<u32>,
    pub concurrency: Option<usize>,
    pub max_attempts: Option<u32>,
    pub call_timeout_secs: Option<u64>,
    pub run_timeout_secs: Option<u64>,
    pub years: Option<YearRange>,
    pub licenses: Option<Vec<String>>,
    pub regions: Option<Vec<String>>,
    pub precision: Option<usize>,
    pub exhausted_policy: Option<ExhaustedPolicy>,
    pub category: Option<String>,
    pub entry_pattern: Option<String>,
    pub delimiter: Option<char>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub limits: RateLimits,
    pub retry: RetryPolicy,
    pub call_timeout: Duration,
    pub run_timeout: Option<Duration>,
    pub base_url: String,
    pub filters: QueryFilters,
    pub regions: Vec<Region>,
    pub precision: Precision,
    pub exhausted_policy: ExhaustedPolicy,
    pub category: String,
    pub entry_matcher: EntryMatcher,
    pub format: RecordFormat,
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Reads `path`, or `rarity.json` in the working directory when no path is
    /// given. Only an explicitly named file is required to exist.
    pub fn resolve(
        path: Option<&Utf8Path>,
        overrides: Overrides,
    ) -> Result<ResolvedConfig, RarityError> {
        let config_path = path
            .map(Utf8Path::to_path_buf)
            .unwrap_or_else(|| Utf8PathBuf::from(DEFAULT_CONFIG_FILE));

        let config = if path.is_none() && !config_path.as_std_path().exists() {
            Config::default()
        } else {
            let content = fs::read_to_string(config_path.as_std_path())
                .map_err(|_| RarityError::ConfigRead(config_path.clone()))?;
            let config: Config = serde_json::from_str(&content)
                .map_err(|err| RarityError::ConfigParse(err.to_string()))?;
            tracing::debug!(path = %config_path, "loaded config file");
            config
        };

        Self::resolve_config(config, overrides)
    }

    pub fn resolve_config(
        config: Config,
        overrides: Overrides,
    ) -> Result<ResolvedConfig, RarityError> {
        let defaults = RateLimits::default();
        let limits = RateLimits::new(
            overrides.qps.or(config.qps).unwrap_or(defaults.qps),
            overrides
                .concurrency
                .or(config.concurrency)
                .unwrap_or(defaults.concurrency),
        )?;

        let default_retry = RetryPolicy::default();
        let max_attempts = overrides
            .max_attempts
            .or(config.max_attempts)
            .unwrap_or(default_retry.max_attempts);
        if max_attempts == 0 {
            return Err(RarityError::InvalidConfig(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        let retry = RetryPolicy {
            max_attempts,
            base_delay: config
                .backoff_base_ms
                .map(Duration::from_millis)
                .unwrap_or(default_retry.base_delay),
        };

        let default_filters = QueryFilters::default();
        let filters = QueryFilters {
            years: overrides.years.or(config.years).unwrap_or(default_filters.years),
            licenses: overrides
                .licenses
                .or(config.licenses)
                .unwrap_or(default_filters.licenses),
            higher_taxon_key: config
                .higher_taxon_key
                .unwrap_or(default_filters.higher_taxon_key),
            countries: config.countries.unwrap_or(default_filters.countries),
            basis_of_record: config.basis_of_record.or(default_filters.basis_of_record),
        };

        let regions = overrides
            .regions
            .or(config.regions)
            .map(|names| names.into_iter().map(Region::new).collect())
            .unwrap_or_else(default_regions);

        let precision = match overrides.precision.or(config.precision) {
            Some(chars) => Precision::new(chars)?,
            None => Precision::default(),
        };

        let pattern = overrides.entry_pattern.or(config.entry_pattern);
        let entry_matcher = match (pattern, config.entry_suffix) {
            (Some(pattern), _) => EntryMatcher::pattern(&pattern)?,
            (None, Some(suffix)) => EntryMatcher::Suffix(suffix),
            (None, None) => EntryMatcher::default(),
        };

        let mut format = RecordFormat::default();
        if let Some(delimiter) = overrides.delimiter.or(config.delimiter) {
            if !delimiter.is_ascii() {
                return Err(RarityError::InvalidConfig(format!(
                    "delimiter must be a single ASCII character, got {delimiter:?}"
                )));
            }
            format.delimiter = delimiter as u8;
            format.quoting = delimiter != '\t';
        }
        if let Some(columns) = config.columns {
            format.columns = columns;
        }

        Ok(ResolvedConfig {
            limits,
            retry,
            call_timeout: Duration::from_secs(
                overrides
                    .call_timeout_secs
                    .or(config.call_timeout_secs)
                    .unwrap_or(20),
            ),
            run_timeout: overrides
                .run_timeout_secs
                .or(config.run_timeout_secs)
                .map(Duration::from_secs),
            base_url: config.base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            filters,
            regions,
            precision,
            exhausted_policy: overrides
                .exhausted_policy
                .or(config.exhausted_policy)
                .unwrap_or_default(),
            category: overrides
                .category
                .or(config.category)
                .unwrap_or_else(|| "species".to_string()),
            entry_matcher,
            format,
        })
    }
}

/// US states, Canadian provinces and territories, and Mexican states.
pub const DEFAULT_REGIONS: &[&str] = &[
    "Alabama", "Alaska", "Arizona", "Arkansas", "California", "Colorado", "Connecticut",
    "Delaware", "District of Columbia", "Florida", "Georgia", "Hawaii", "Idaho", "Illinois",
    "Indiana", "Iowa", "Kansas", "Kentucky", "Louisiana", "Maine", "Maryland", "Massachusetts",
    "Michigan", "Minnesota", "Mississippi", "Missouri", "Montana", "Nebraska", "Nevada",
    "New Hampshire", "New Jersey", "New Mexico", "New York", "North Carolina", "North Dakota",
    "Ohio", "Oklahoma", "Oregon", "Pennsylvania", "Rhode Island", "South Carolina",
    "South Dakota", "Tennessee", "Texas", "Utah", "Vermont", "Virginia", "Washington",
    "West Virginia", "Wisconsin", "Wyoming",
    "Alberta", "British Columbia", "Manitoba", "New Brunswick", "Newfoundland and Labrador",
    "Nova Scotia", "Ontario", "Prince Edward Island", "Quebec", "Saskatchewan",
    "Northwest Territories", "Nunavut", "Yukon",
    "Aguascalientes", "Baja California", "Baja California Sur", "Campeche", "Chiapas",
    "Chihuahua", "Coahuila", "Colima", "Durango", "Guanajuato", "Guerrero", "Hidalgo",
    "Jalisco", "México", "Mexico City", "Michoacán", "Morelos", "Nayarit", "Nuevo León",
    "Oaxaca", "Puebla", "Querétaro", "Quintana Roo", "San Luis Potosí", "Sinaloa", "Sonora",
    "Tabasco", "Tamaulipas", "Tlaxcala", "Veracruz", "Yucatán", "Zacatecas",
];

pub fn default_regions() -> Vec<Region> {
    DEFAULT_REGIONS.iter().map(|name| Region::new(*name)).collect()
}
