use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use reqwest::blocking::Client;
use serde::Serialize;

use crate::archive::ArchiveReader;
use crate::config::ResolvedConfig;
use crate::domain::{ExhaustedPolicy, Region, SpeciesCode};
use crate::error::RarityError;
use crate::gbif::{FacetCount, GbifApi, GbifConnector};
use crate::geohash::{Precision, cell_key};
use crate::pool::{ConnectionPool, Connector};
use crate::rank::{rank, rank_grouped};
use crate::records::{OccurrenceRows, RecordFormat, RowTally};
use crate::reference::{ChecklistEntry, ReferenceEntry, ReferenceMap, load_checklist};
use crate::remote::{CallFailure, ResilientClient};
use crate::sink::{
    CellCountRow, FREQUENCY_HEADER, FrequencyRow, REGION_HEADER, RegionFrequencyRow, SEED_HEADER,
    SeedRow, cell_header, sync_timestamp, write_rows,
};
use crate::table::{CellSpeciesKey, CountTable, RegionSpeciesKey};
use crate::throttle::RateBudget;

/// Completions between remote progress log lines.
pub const REMOTE_PROGRESS_EVERY: usize = 500;

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink: Sync {
    fn event(&self, event: ProgressEvent);
}

/// Forwards progress to the tracing subscriber.
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn event(&self, event: ProgressEvent) {
        match event.elapsed {
            Some(elapsed) => {
                tracing::info!(elapsed_ms = elapsed.as_millis() as u64, "{}", event.message)
            }
            None => tracing::info!("{}", event.message),
        }
    }
}

fn phase(sink: &dyn ProgressSink, message: String, started: Option<Instant>) {
    sink.event(ProgressEvent {
        message,
        elapsed: started.map(|at| at.elapsed()),
    });
}

/// The remote operations the pipelines issue. [`GbifApi`] is the production
/// implementation; tests substitute in-process fakes.
pub trait OccurrenceService: Sync {
    type Connection;

    fn occurrence_count(&self, conn: &Self::Connection, taxon_key: u64) -> Result<u64, CallFailure>;
    fn species_facets(
        &self,
        conn: &Self::Connection,
        region: &Region,
    ) -> Result<Vec<FacetCount>, CallFailure>;
    fn match_species(
        &self,
        conn: &Self::Connection,
        name: &str,
    ) -> Result<Option<u64>, CallFailure>;
}

impl OccurrenceService for GbifApi {
    type Connection = Client;

    fn occurrence_count(&self, conn: &Client, taxon_key: u64) -> Result<u64, CallFailure> {
        GbifApi::occurrence_count(self, conn, taxon_key)
    }

    fn species_facets(
        &self,
        conn: &Client,
        region: &Region,
    ) -> Result<Vec<FacetCount>, CallFailure> {
        GbifApi::species_facets(self, conn, region)
    }

    fn match_species(&self, conn: &Client, name: &str) -> Result<Option<u64>, CallFailure> {
        GbifApi::match_species(self, conn, name)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RemoteStats {
    pub entities: usize,
    pub succeeded: usize,
    pub exhausted: usize,
    pub not_run: usize,
    pub calls_issued: u64,
    pub peak_in_flight: usize,
    pub pool_rebuilds: u64,
}

/// Structured result of one pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub pipeline: &'static str,
    pub output: Utf8PathBuf,
    pub rows_written: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tally: Option<RowTally>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dropped_fraction: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote: Option<RemoteStats>,
    pub cancelled: bool,
}

/// Streams every matching archive entry into a (cell, species) count table.
pub fn aggregate_cells(
    archive: &mut ArchiveReader,
    format: &RecordFormat,
    reference: &ReferenceMap,
    precision: Precision,
) -> Result<(CountTable<CellSpeciesKey>, RowTally), RarityError> {
    let mut table = CountTable::new();
    let mut tally = RowTally::default();
    while let Some(entry) = archive.next_entry()? {
        let name = entry.name().to_string();
        let mut rows = OccurrenceRows::new(&name, entry, format, reference)?;
        for record in rows.by_ref() {
            let record = record?;
            let cell = cell_key(record.latitude, record.longitude, precision);
            table.increment((cell, record.species.clone()));
        }
        let entry_tally = rows.tally();
        tracing::info!(
            entry = %name,
            processed = entry_tally.rows,
            matched = entry_tally.matched,
            parse_errors = entry_tally.parse_errors,
            unresolved = entry_tally.unresolved,
            "entry done"
        );
        tally.merge(&entry_tally);
    }
    Ok((table, tally))
}

/// Local mode: archive → geohash cell counts.
pub fn run_cells(
    config: &ResolvedConfig,
    archive_path: &Utf8Path,
    reference_path: &Utf8Path,
    output: &Utf8Path,
    sink: &dyn ProgressSink,
) -> Result<RunSummary, RarityError> {
    let reference = ReferenceMap::load(reference_path)?;
    let mut archive = ArchiveReader::open(archive_path, &config.entry_matcher)?;
    phase(
        sink,
        format!("streaming {} entr(ies) from {archive_path}", archive.entry_names().count()),
        None,
    );

    let started = Instant::now();
    let (table, tally) =
        aggregate_cells(&mut archive, &config.format, &reference, config.precision)?;
    drop(archive);
    phase(
        sink,
        format!(
            "ingested {} rows: {} matched, {} malformed, {} unresolved",
            tally.rows, tally.matched, tally.parse_errors, tally.unresolved
        ),
        Some(started),
    );

    let rows: Vec<CellCountRow> = table
        .snapshot()
        .into_iter()
        .map(|((cell, species), n)| CellCountRow { cell, species, n })
        .collect();
    let rows_written = write_rows(output, &cell_header(config.precision.chars()), &rows)?;

    Ok(RunSummary {
        pipeline: "cells",
        output: output.to_path_buf(),
        rows_written,
        tally: Some(tally),
        dropped_fraction: Some(tally.dropped_fraction()),
        remote: None,
        cancelled: false,
    })
}

/// Builds the shared budget, pool and client for a remote run. The run
/// deadline, if any, starts counting here.
pub fn gbif_client(config: &ResolvedConfig) -> Result<ResilientClient<GbifConnector>, RarityError> {
    let pool = Arc::new(ConnectionPool::new(GbifConnector::new(config.call_timeout))?);
    let budget = Arc::new(RateBudget::new(config.limits));
    if let Some(timeout) = config.run_timeout {
        budget.set_deadline(Instant::now() + timeout);
    }
    Ok(ResilientClient::new(pool, budget, config.retry))
}

/// Per-item results of a fan-out, in input order. `None` marks items that were
/// never started because the run was cancelled.
struct FanOut<T> {
    outcomes: Vec<Option<Result<T, RarityError>>>,
    cancelled: bool,
}

/// Remote pipelines over one shared client.
pub struct App<C: Connector, S: OccurrenceService<Connection = C::Connection>> {
    config: ResolvedConfig,
    client: ResilientClient<C>,
    service: S,
    synced_at: DateTime<Utc>,
}

impl<C, S> App<C, S>
where
    C: Connector,
    S: OccurrenceService<Connection = C::Connection>,
{
    pub fn new(config: ResolvedConfig, client: ResilientClient<C>, service: S) -> Self {
        Self {
            config,
            client,
            service,
            synced_at: Utc::now(),
        }
    }

    /// Fixes the timestamp written to `last_sync`.
    pub fn with_synced_at(mut self, synced_at: DateTime<Utc>) -> Self {
        self.synced_at = synced_at;
        self
    }

    pub fn client(&self) -> &ResilientClient<C> {
        &self.client
    }

    /// Remote mode: occurrence count per reference species, ranked globally.
    pub fn species_frequency(
        &self,
        reference: &ReferenceMap,
        output: &Utf8Path,
        sink: &dyn ProgressSink,
    ) -> Result<RunSummary, RarityError> {
        let entries = reference.entries();
        phase(
            sink,
            format!(
                "counting occurrences for {} species ({})",
                entries.len(),
                self.config.filters.years
            ),
            None,
        );
        let started = Instant::now();

        let fan_out = self.fan_out(entries, "species", |entry: &ReferenceEntry| {
            match entry.gbif_key {
                None => Ok(0),
                Some(key) => self
                    .client
                    .call(&key.to_string(), |conn| self.service.occurrence_count(conn, key)),
            }
        });
        phase(sink, "remote counts complete".to_string(), Some(started));

        let mut stats = self.remote_stats(entries.len());
        let mut population = Vec::with_capacity(entries.len());
        for (entry, outcome) in entries.iter().zip(fan_out.outcomes) {
            if let Some(count) = self.settle(entry.code.as_str(), outcome, 0, &mut stats)? {
                population.push((entry.code.clone(), count));
            }
        }

        let last_sync = sync_timestamp(self.synced_at);
        let rows: Vec<FrequencyRow> = rank(population)
            .into_iter()
            .map(|ranked| FrequencyRow {
                species: ranked.entity,
                n_records: ranked.raw_count,
                percentile: ranked.percentile,
                last_sync: last_sync.clone(),
            })
            .collect();
        let rows_written = write_rows(output, &FREQUENCY_HEADER, &rows)?;
        self.client.pool().shutdown();

        Ok(RunSummary {
            pipeline: "freq",
            output: output.to_path_buf(),
            rows_written,
            tally: None,
            dropped_fraction: None,
            remote: Some(stats),
            cancelled: fan_out.cancelled,
        })
    }

    /// Remote mode: per-region species facet counts, ranked within each region.
    pub fn regional_frequency(
        &self,
        reference: &ReferenceMap,
        output: &Utf8Path,
        sink: &dyn ProgressSink,
    ) -> Result<RunSummary, RarityError> {
        let regions = &self.config.regions;
        phase(sink, format!("fetching species facets for {} regions", regions.len()), None);
        let started = Instant::now();

        let fan_out = self.fan_out(regions, "region", |region: &Region| {
            self.client
                .call(region.as_str(), |conn| self.service.species_facets(conn, region))
        });
        phase(sink, "facet queries complete".to_string(), Some(started));

        let mut stats = self.remote_stats(regions.len());
        let mut table: CountTable<RegionSpeciesKey> = CountTable::new();
        let mut tally = RowTally::default();
        for (region, outcome) in regions.iter().zip(fan_out.outcomes) {
            let Some(facets) = self.settle(region.as_str(), outcome, Vec::new(), &mut stats)? else {
                continue;
            };
            for facet in facets {
                tally.rows += 1;
                match reference.resolve(facet.taxon_key) {
                    Some(code) => {
                        tally.matched += 1;
                        table.add((region.clone(), code.clone()), facet.count);
                    }
                    None => tally.unresolved += 1,
                }
            }
            tracing::debug!(region = %region, rows = table.len(), "region done");
        }

        let last_sync = sync_timestamp(self.synced_at);
        let population: Vec<(Region, SpeciesCode, u64)> = table
            .snapshot()
            .into_iter()
            .map(|((region, species), n)| (region, species, n))
            .collect();
        let rows: Vec<RegionFrequencyRow> = rank_grouped(population)
            .into_iter()
            .map(|(region, ranked)| RegionFrequencyRow {
                region,
                species: ranked.entity,
                n_local: ranked.raw_count,
                percentile: ranked.percentile,
                last_sync: last_sync.clone(),
            })
            .collect();
        let rows_written = write_rows(output, &REGION_HEADER, &rows)?;
        self.client.pool().shutdown();

        Ok(RunSummary {
            pipeline: "regions",
            output: output.to_path_buf(),
            rows_written,
            tally: Some(tally),
            dropped_fraction: Some(tally.dropped_fraction()),
            remote: Some(stats),
            cancelled: fan_out.cancelled,
        })
    }

    /// Remote mode: matches checklist names against the GBIF backbone and
    /// writes the reference mapping the other pipelines read.
    pub fn seed_reference(
        &self,
        checklist: &Utf8Path,
        output: &Utf8Path,
        sink: &dyn ProgressSink,
    ) -> Result<RunSummary, RarityError> {
        let entries = load_checklist(checklist, &self.config.category)?;
        phase(sink, format!("matching {} checklist names", entries.len()), None);
        let started = Instant::now();

        let fan_out = self.fan_out(&entries, "name", |entry: &ChecklistEntry| {
            self.client.call(&entry.scientific_name, |conn| {
                self.service.match_species(conn, &entry.scientific_name)
            })
        });
        phase(sink, "name matching complete".to_string(), Some(started));

        let mut stats = self.remote_stats(entries.len());
        let mut tally = RowTally::default();
        let mut rows = Vec::new();
        for (entry, outcome) in entries.iter().zip(fan_out.outcomes) {
            tally.rows += 1;
            match self.settle(&entry.scientific_name, outcome, None, &mut stats)? {
                Some(Some(gbif_key)) => {
                    tally.matched += 1;
                    rows.push(SeedRow {
                        species: entry.code.clone(),
                        common_name: entry.common_name.clone(),
                        gbif_key,
                    });
                }
                Some(None) => tally.unresolved += 1,
                None => {}
            }
        }

        let rows_written = write_rows(output, &SEED_HEADER, &rows)?;
        self.client.pool().shutdown();

        Ok(RunSummary {
            pipeline: "seed",
            output: output.to_path_buf(),
            rows_written,
            tally: Some(tally),
            dropped_fraction: Some(tally.dropped_fraction()),
            remote: Some(stats),
            cancelled: fan_out.cancelled,
        })
    }

    /// Applies the exhausted-call policy to one outcome. `Ok(None)` means the
    /// entity is left out of the output.
    fn settle<T>(
        &self,
        label: &str,
        outcome: Option<Result<T, RarityError>>,
        substitute: T,
        stats: &mut RemoteStats,
    ) -> Result<Option<T>, RarityError> {
        match outcome {
            Some(Ok(value)) => {
                stats.succeeded += 1;
                Ok(Some(value))
            }
            None | Some(Err(RarityError::Cancelled)) => {
                stats.not_run += 1;
                Ok(None)
            }
            Some(Err(err)) => {
                stats.exhausted += 1;
                match self.config.exhausted_policy {
                    ExhaustedPolicy::Zero => {
                        tracing::warn!(entity = label, "{err}; substituting a default");
                        Ok(Some(substitute))
                    }
                    ExhaustedPolicy::Skip => {
                        tracing::warn!(entity = label, "{err}; skipping");
                        Ok(None)
                    }
                    ExhaustedPolicy::Abort => Err(err),
                }
            }
        }
    }

    fn remote_stats(&self, entities: usize) -> RemoteStats {
        let budget = self.client.budget().stats();
        RemoteStats {
            entities,
            calls_issued: budget.issued,
            peak_in_flight: budget.peak_in_flight,
            pool_rebuilds: self.client.pool().rebuilds(),
            ..RemoteStats::default()
        }
    }

    /// Runs `task` for every item on one worker thread per concurrency slot.
    /// Workers stop picking up new items once the budget is cancelled; under
    /// the abort policy the first exhausted call cancels it.
    fn fan_out<I, T, F>(&self, items: &[I], noun: &str, task: F) -> FanOut<T>
    where
        I: Sync,
        T: Send,
        F: Fn(&I) -> Result<T, RarityError> + Sync,
    {
        let budget = self.client.budget();
        let total = items.len();
        let workers = self.config.limits.concurrency.min(total).max(1);
        let next = AtomicUsize::new(0);
        let completed = AtomicUsize::new(0);
        let failed = AtomicUsize::new(0);
        let slots: Mutex<Vec<Option<Result<T, RarityError>>>> =
            Mutex::new((0..total).map(|_| None).collect());
        let abort_on_exhausted = self.config.exhausted_policy == ExhaustedPolicy::Abort;

        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| {
                    loop {
                        if budget.is_cancelled() {
                            break;
                        }
                        let index = next.fetch_add(1, Ordering::Relaxed);
                        if index >= total {
                            break;
                        }
                        let outcome = task(&items[index]);
                        match &outcome {
                            Ok(_) => {}
                            Err(RarityError::Cancelled) => {}
                            Err(err) => {
                                failed.fetch_add(1, Ordering::Relaxed);
                                tracing::debug!("{noun} #{index}: {err}");
                                if abort_on_exhausted {
                                    budget.cancel();
                                }
                            }
                        }
                        slots.lock().unwrap_or_else(PoisonError::into_inner)[index] = Some(outcome);

                        let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
                        if done % REMOTE_PROGRESS_EVERY == 0 {
                            let errors = failed.load(Ordering::Relaxed);
                            tracing::info!(
                                processed = done,
                                total,
                                ok = done - errors,
                                errors,
                                "{noun} progress"
                            );
                        }
                    }
                });
            }
        });

        let outcomes = slots.into_inner().unwrap_or_else(PoisonError::into_inner);
        // A deadline that passes after the last item finished leaves nothing unrun.
        let cancelled = outcomes
            .iter()
            .any(|outcome| matches!(outcome, None | Some(Err(RarityError::Cancelled))));
        if cancelled {
            tracing::warn!(
                completed = completed.load(Ordering::Relaxed),
                total,
                "run cancelled; keeping partial results"
            );
        }
        FanOut {
            outcomes,
            cancelled,
        }
    }
}
