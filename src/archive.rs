use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, Read};

use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use zip::ZipArchive;

use crate::error::RarityError;

pub const DEFAULT_ENTRY_SUFFIX: &str = "occurrence.txt";

/// Selects which archive entries carry occurrence rows.
#[derive(Debug, Clone)]
pub enum EntryMatcher {
    Suffix(String),
    Pattern(Regex),
}

impl EntryMatcher {
    pub fn pattern(pattern: &str) -> Result<Self, RarityError> {
        Regex::new(pattern)
            .map(EntryMatcher::Pattern)
            .map_err(|err| RarityError::InvalidConfig(format!("entry pattern: {err}")))
    }

    pub fn matches(&self, name: &str) -> bool {
        match self {
            EntryMatcher::Suffix(suffix) => name.ends_with(suffix.as_str()),
            EntryMatcher::Pattern(re) => re.is_match(name),
        }
    }
}

impl Default for EntryMatcher {
    fn default() -> Self {
        EntryMatcher::Suffix(DEFAULT_ENTRY_SUFFIX.to_string())
    }
}

impl fmt::Display for EntryMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryMatcher::Suffix(suffix) => write!(f, "*{suffix}"),
            EntryMatcher::Pattern(re) => write!(f, "/{}/", re.as_str()),
        }
    }
}

/// Streams matching entries out of a zip archive one at a time. Only the
/// central directory is read up front; entry bodies are decompressed on demand
/// through a bounded buffer, and the single archive file handle is released
/// when the reader is dropped.
#[derive(Debug)]
pub struct ArchiveReader {
    path: Utf8PathBuf,
    archive: ZipArchive<BufReader<File>>,
    matching: Vec<(usize, String)>,
    cursor: usize,
}

/// One decompressing entry stream. Borrows the reader, so only one entry is
/// open at a time.
pub struct ArchiveEntry<'a> {
    name: String,
    inner: Box<dyn Read + 'a>,
}

impl ArchiveEntry<'_> {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Read for ArchiveEntry<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl ArchiveReader {
    pub fn open(path: &Utf8Path, matcher: &EntryMatcher) -> Result<Self, RarityError> {
        let file = File::open(path.as_std_path()).map_err(|err| match err.kind() {
            io::ErrorKind::NotFound => RarityError::InputNotFound(path.to_path_buf()),
            _ => RarityError::Filesystem(format!("open archive {path}: {err}")),
        })?;
        let mut archive =
            ZipArchive::new(BufReader::new(file)).map_err(|err| RarityError::archive(path, err))?;

        let mut matching = Vec::new();
        for index in 0..archive.len() {
            let entry = archive
                .by_index_raw(index)
                .map_err(|err| RarityError::archive(path, err))?;
            if entry.is_dir() {
                continue;
            }
            let name = entry.name().to_string();
            if matcher.matches(&name) {
                matching.push((index, name));
            }
        }

        if matching.is_empty() {
            return Err(RarityError::EntryNotFound {
                path: path.to_path_buf(),
                pattern: matcher.to_string(),
            });
        }

        Ok(Self {
            path: path.to_path_buf(),
            archive,
            matching,
            cursor: 0,
        })
    }

    /// Names of the matching entries, in archive order.
    pub fn entry_names(&self) -> impl Iterator<Item = &str> {
        self.matching.iter().map(|(_, name)| name.as_str())
    }

    /// Opens the next matching entry, or `None` once all have been visited.
    pub fn next_entry(&mut self) -> Result<Option<ArchiveEntry<'_>>, RarityError> {
        let Some((index, name)) = self.matching.get(self.cursor).cloned() else {
            return Ok(None);
        };
        self.cursor += 1;
        let file = self
            .archive
            .by_index(index)
            .map_err(|err| RarityError::archive(&self.path, err))?;
        Ok(Some(ArchiveEntry {
            name,
            inner: Box::new(BufReader::new(file)),
        }))
    }
}
