use std::fs;
use std::time::Duration;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;

use occurrence_rarity::config::{Config, ConfigLoader, Overrides};
use occurrence_rarity::domain::{ExhaustedPolicy, YearRange};
use occurrence_rarity::error::RarityError;

fn write_config(dir: &tempfile::TempDir, body: &str) -> Utf8PathBuf {
    let path = Utf8PathBuf::from_path_buf(dir.path().join("rarity.json")).unwrap();
    fs::write(path.as_std_path(), body).unwrap();
    path
}

#[test]
fn file_values_apply_and_cli_wins() {
    let temp = tempfile::tempdir().unwrap();
    let path = write_config(
        &temp,
        r#"{
            "qps": 10,
            "concurrency": 20,
            "backoff_base_ms": 100,
            "years": {"from": 2020, "to": 2023},
            "regions": ["Maine", "Quebec"],
            "exhausted_policy": "skip",
            "precision": 5,
            "columns": {"latitude": "lat", "longitude": "lon", "taxon_key": "speciesKey"}
        }"#,
    );

    let resolved = ConfigLoader::resolve(
        Some(&path),
        Overrides {
            qps: Some(25),
            exhausted_policy: Some(ExhaustedPolicy::Abort),
            ..Overrides::default()
        },
    )
    .unwrap();

    assert_eq!(resolved.limits.qps, 25);
    assert_eq!(resolved.limits.concurrency, 20);
    assert_eq!(resolved.retry.base_delay, Duration::from_millis(100));
    assert_eq!(resolved.filters.years, YearRange::new(2020, 2023).unwrap());
    assert_eq!(resolved.regions.len(), 2);
    assert_eq!(resolved.exhausted_policy, ExhaustedPolicy::Abort);
    assert_eq!(resolved.precision.chars(), 5);
    assert_eq!(resolved.format.columns.taxon_key, "speciesKey");
}

#[test]
fn unknown_keys_are_rejected() {
    let temp = tempfile::tempdir().unwrap();
    let path = write_config(&temp, r#"{"qps": 10, "threads": 4}"#);

    let result = ConfigLoader::resolve(Some(&path), Overrides::default());
    assert_matches!(result, Err(RarityError::ConfigParse(_)));
}

#[test]
fn explicit_missing_file_is_an_error() {
    let temp = tempfile::tempdir().unwrap();
    let path = Utf8PathBuf::from_path_buf(temp.path().join("absent.json")).unwrap();

    let result = ConfigLoader::resolve(Some(&path), Overrides::default());
    assert_matches!(result, Err(RarityError::ConfigRead(_)));
}

#[test]
fn zero_limits_are_invalid() {
    let zero_qps = ConfigLoader::resolve_config(
        Config::default(),
        Overrides {
            qps: Some(0),
            ..Overrides::default()
        },
    );
    assert_matches!(zero_qps, Err(RarityError::InvalidConfig(_)));

    let zero_attempts = ConfigLoader::resolve_config(
        Config {
            max_attempts: Some(0),
            ..Config::default()
        },
        Overrides::default(),
    );
    assert_matches!(zero_attempts, Err(RarityError::InvalidConfig(_)));
}

#[test]
fn comma_delimiter_enables_quoting() {
    let resolved = ConfigLoader::resolve_config(
        Config::default(),
        Overrides {
            delimiter: Some(','),
            ..Overrides::default()
        },
    )
    .unwrap();
    assert_eq!(resolved.format.delimiter, b',');
    assert!(resolved.format.quoting);
}

#[test]
fn year_range_parses_both_separators() {
    assert_eq!("2019,2024".parse::<YearRange>().unwrap(), YearRange::default());
    assert_eq!("2019-2024".parse::<YearRange>().unwrap(), YearRange::default());
    assert_matches!("2024,2019".parse::<YearRange>(), Err(RarityError::InvalidConfig(_)));
}
