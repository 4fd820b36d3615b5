use std::fs::{self, File};
use std::io::Write;

use assert_matches::assert_matches;
use camino::{Utf8Path, Utf8PathBuf};
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use occurrence_rarity::app::{ProgressEvent, ProgressSink, aggregate_cells, run_cells};
use occurrence_rarity::archive::{ArchiveReader, EntryMatcher};
use occurrence_rarity::config::{Config, ConfigLoader, Overrides};
use occurrence_rarity::error::RarityError;
use occurrence_rarity::geohash::Precision;
use occurrence_rarity::records::RecordFormat;
use occurrence_rarity::reference::{ReferenceEntry, ReferenceMap};

struct Silent;

impl ProgressSink for Silent {
    fn event(&self, _event: ProgressEvent) {}
}

const HEADER: &str = "gbifID\tdecimalLatitude\tdecimalLongitude\ttaxonKey\n";

fn write_archive(dir: &Utf8Path, entries: &[(&str, &str)]) -> Utf8PathBuf {
    let path = dir.join("download.zip");
    let mut writer = ZipWriter::new(File::create(path.as_std_path()).unwrap());
    for (name, body) in entries {
        writer.start_file(*name, SimpleFileOptions::default()).unwrap();
        writer.write_all(body.as_bytes()).unwrap();
    }
    writer.finish().unwrap();
    path
}

fn utf8_dir(dir: &tempfile::TempDir) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap()
}

fn reference() -> ReferenceMap {
    ReferenceMap::from_entries(vec![ReferenceEntry {
        code: "ABCD".parse().unwrap(),
        gbif_key: Some(12345),
    }])
}

#[test]
fn aggregates_resolved_rows_per_cell() {
    let temp = tempfile::tempdir().unwrap();
    let dir = utf8_dir(&temp);
    let body = format!(
        "{HEADER}1\t41.2\t-72.9\t12345\n2\t41.2\t-72.9\t12345\n3\t5.0\t5.0\t999\n"
    );
    let path = write_archive(&dir, &[("occurrence.txt", &body)]);

    let reference = reference();
    let mut archive = ArchiveReader::open(&path, &EntryMatcher::default()).unwrap();
    let (table, tally) = aggregate_cells(
        &mut archive,
        &RecordFormat::default(),
        &reference,
        Precision::default(),
    )
    .unwrap();

    let rows = table.snapshot();
    assert_eq!(rows.len(), 1);
    let ((cell, species), n) = &rows[0];
    assert_eq!(cell.as_str(), "drk4");
    assert_eq!(species.as_str(), "ABCD");
    assert_eq!(*n, 2);
    assert_eq!(tally.rows, 3);
    assert_eq!(tally.matched, 2);
    assert_eq!(tally.unresolved, 1);
    assert_eq!(tally.parse_errors, 0);
}

#[test]
fn reads_every_matching_entry_and_ignores_the_rest() {
    let temp = tempfile::tempdir().unwrap();
    let dir = utf8_dir(&temp);
    let part = format!("{HEADER}1\t41.2\t-72.9\t12345\n");
    let path = write_archive(
        &dir,
        &[
            ("meta.xml", "<archive/>"),
            ("part-1/occurrence.txt", &part),
            ("verbatim.txt", "not\tused\n"),
            ("part-2/occurrence.txt", &part),
        ],
    );

    let reference = reference();
    let mut archive = ArchiveReader::open(&path, &EntryMatcher::default()).unwrap();
    assert_eq!(
        archive.entry_names().collect::<Vec<_>>(),
        vec!["part-1/occurrence.txt", "part-2/occurrence.txt"]
    );
    let (table, tally) = aggregate_cells(
        &mut archive,
        &RecordFormat::default(),
        &reference,
        Precision::default(),
    )
    .unwrap();
    assert_eq!(tally.rows, 2);
    assert_eq!(table.snapshot()[0].1, 2);
}

#[test]
fn missing_entry_is_reported() {
    let temp = tempfile::tempdir().unwrap();
    let dir = utf8_dir(&temp);
    let path = write_archive(&dir, &[("meta.xml", "<archive/>")]);

    let result = ArchiveReader::open(&path, &EntryMatcher::default());
    assert_matches!(result, Err(RarityError::EntryNotFound { .. }));
}

#[test]
fn garbage_archive_is_corrupt() {
    let temp = tempfile::tempdir().unwrap();
    let dir = utf8_dir(&temp);
    let path = dir.join("download.zip");
    fs::write(path.as_std_path(), b"this is not a zip file at all").unwrap();

    let result = ArchiveReader::open(&path, &EntryMatcher::default());
    assert_matches!(result, Err(RarityError::ArchiveCorrupt { .. }));
}

#[test]
fn absent_archive_is_input_not_found() {
    let temp = tempfile::tempdir().unwrap();
    let dir = utf8_dir(&temp);
    let result = ArchiveReader::open(&dir.join("missing.zip"), &EntryMatcher::default());
    assert_matches!(result, Err(RarityError::InputNotFound(_)));
}

#[test]
fn entry_pattern_selects_alternate_files() {
    let temp = tempfile::tempdir().unwrap();
    let dir = utf8_dir(&temp);
    let path = write_archive(&dir, &[("data/obs_2024.tsv", HEADER), ("occurrence.txt", HEADER)]);

    let matcher = EntryMatcher::pattern(r"obs_\d{4}\.tsv$").unwrap();
    let archive = ArchiveReader::open(&path, &matcher).unwrap();
    assert_eq!(archive.entry_names().collect::<Vec<_>>(), vec!["data/obs_2024.tsv"]);
}

#[test]
fn run_cells_writes_sorted_table_with_precision_header() {
    let temp = tempfile::tempdir().unwrap();
    let dir = utf8_dir(&temp);
    let body = format!(
        "{HEADER}1\t41.2\t-72.9\t12345\n2\t5.0\t5.0\t12345\n\
         3\t41.2\t-72.9\t12345\n4\tnorth\t-72.9\t12345\n"
    );
    let archive = write_archive(&dir, &[("occurrence.txt", &body)]);
    let reference_path = dir.join("species_seed.csv");
    fs::write(
        reference_path.as_std_path(),
        "species_code,com_name,gbif_key\nABCD,Alpha Bird,12345\n",
    )
    .unwrap();
    let output = dir.join("out/cells.csv");

    let config = ConfigLoader::resolve_config(
        Config::default(),
        Overrides {
            precision: Some(6),
            ..Overrides::default()
        },
    )
    .unwrap();
    let summary = run_cells(&config, &archive, &reference_path, &output, &Silent).unwrap();

    assert_eq!(summary.rows_written, 2);
    let tally = summary.tally.unwrap();
    assert_eq!(tally.parse_errors, 1);
    assert_eq!(tally.matched, 3);
    let written = fs::read_to_string(output.as_std_path()).unwrap();
    assert_eq!(written, "geohash6,species_code,n\ndrk4mh,ABCD,2\ns0gs3y,ABCD,1\n");
}
