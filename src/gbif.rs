use std::error::Error as StdError;
use std::io;
use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::{Deserialize, Serialize};

use crate::domain::{Region, YearRange};
use crate::error::RarityError;
use crate::pool::Connector;
use crate::remote::CallFailure;

pub const DEFAULT_BASE_URL: &str = "https://api.gbif.org/v1";
/// GBIF backbone key for class Aves.
pub const AVES_TAXON_KEY: u64 = 212;
pub const FACET_LIMIT: u32 = 100_000;

/// Builds the keep-alive HTTP client that serves as the shared pool.
#[derive(Debug, Clone)]
pub struct GbifConnector {
    pub call_timeout: Duration,
    pub max_idle_per_host: usize,
}

impl GbifConnector {
    pub fn new(call_timeout: Duration) -> Self {
        Self {
            call_timeout,
            max_idle_per_host: 20,
        }
    }
}

impl Connector for GbifConnector {
    type Connection = Client;

    fn connect(&self) -> Result<Client, RarityError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("occurrence-rarity/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| RarityError::HttpClient(err.to_string()))?,
        );
        Client::builder()
            .default_headers(headers)
            .timeout(self.call_timeout)
            .pool_max_idle_per_host(self.max_idle_per_host)
            .tcp_keepalive(Duration::from_secs(30))
            .build()
            .map_err(|err| RarityError::HttpClient(err.to_string()))
    }
}

/// Filters applied to occurrence queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryFilters {
    pub years: YearRange,
    pub licenses: Vec<String>,
    pub higher_taxon_key: u64,
    pub countries: Vec<String>,
    pub basis_of_record: Option<String>,
}

impl Default for QueryFilters {
    fn default() -> Self {
        Self {
            years: YearRange::default(),
            licenses: vec!["CC0_1_0".to_string(), "CC_BY_4_0".to_string()],
            higher_taxon_key: AVES_TAXON_KEY,
            countries: vec!["US".to_string(), "CA".to_string(), "MX".to_string()],
            basis_of_record: Some("HUMAN_OBSERVATION".to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FacetCount {
    pub taxon_key: u64,
    pub count: u64,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    facets: Vec<Facet>,
}

#[derive(Debug, Deserialize)]
struct Facet {
    #[serde(default)]
    counts: Vec<FacetEntry>,
}

#[derive(Debug, Deserialize)]
struct FacetEntry {
    name: String,
    count: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MatchResponse {
    usage_key: Option<u64>,
}

type Params = Vec<(&'static str, String)>;

/// The three GBIF operations the pipelines need. Each one is a single attempt
/// against a borrowed client; retries and throttling belong to the caller.
#[derive(Debug, Clone)]
pub struct GbifApi {
    base_url: String,
    filters: QueryFilters,
}

impl GbifApi {
    pub fn new(base_url: impl Into<String>, filters: QueryFilters) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            filters,
        }
    }

    pub fn count_params(&self, taxon_key: u64) -> Params {
        vec![
            ("taxonKey", taxon_key.to_string()),
            ("year", self.filters.years.query_value()),
        ]
    }

    pub fn facet_params(&self, region: &Region) -> Params {
        let mut params = vec![("taxonKey", self.filters.higher_taxon_key.to_string())];
        params.extend(self.filters.countries.iter().map(|c| ("country", c.clone())));
        params.push(("stateProvince", region.as_str().to_string()));
        params.push(("year", self.filters.years.query_value()));
        if let Some(basis) = &self.filters.basis_of_record {
            params.push(("basisOfRecord", basis.clone()));
        }
        params.extend(self.filters.licenses.iter().map(|l| ("license", l.clone())));
        params.push(("facet", "speciesKey".to_string()));
        params.push(("facetLimit", FACET_LIMIT.to_string()));
        params.push(("limit", "0".to_string()));
        params
    }

    pub fn match_params(name: &str) -> Params {
        vec![("strict", "true".to_string()), ("name", name.to_string())]
    }

    /// Occurrence count for one taxon. A body that is not a bare number
    /// counts as zero.
    pub fn occurrence_count(&self, client: &Client, taxon_key: u64) -> Result<u64, CallFailure> {
        let request = client
            .get(format!("{}/occurrence/count", self.base_url))
            .query(&self.count_params(taxon_key));
        let body = fetch_text(request)?;
        Ok(parse_count(&body))
    }

    /// Per-species occurrence counts inside one region.
    pub fn species_facets(
        &self,
        client: &Client,
        region: &Region,
    ) -> Result<Vec<FacetCount>, CallFailure> {
        let request = client
            .get(format!("{}/occurrence/search", self.base_url))
            .query(&self.facet_params(region));
        let body = fetch_text(request)?;
        parse_facets(&body)
    }

    /// Strict backbone match of a scientific name.
    pub fn match_species(&self, client: &Client, name: &str) -> Result<Option<u64>, CallFailure> {
        let request = client
            .get(format!("{}/species/match", self.base_url))
            .query(&Self::match_params(name));
        let body = fetch_text(request)?;
        let parsed: MatchResponse = serde_json::from_str(&body)
            .map_err(|err| CallFailure::permanent(format!("species match body: {err}")))?;
        Ok(parsed.usage_key)
    }
}

fn fetch_text(request: RequestBuilder) -> Result<String, CallFailure> {
    let response = request.send().map_err(classify)?;
    let status = response.status();
    if !status.is_success() {
        let message = format!("GBIF returned status {}", status.as_u16());
        return Err(if is_retryable_status(status.as_u16()) {
            CallFailure::transient(message)
        } else {
            CallFailure::permanent(message)
        });
    }
    response.text().map_err(classify)
}

pub fn parse_count(body: &str) -> u64 {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|value| value.as_u64())
        .unwrap_or(0)
}

pub fn parse_facets(body: &str) -> Result<Vec<FacetCount>, CallFailure> {
    let parsed: SearchResponse = serde_json::from_str(body)
        .map_err(|err| CallFailure::permanent(format!("facet search body: {err}")))?;
    Ok(parsed
        .facets
        .into_iter()
        .next()
        .map(|facet| facet.counts)
        .unwrap_or_default()
        .into_iter()
        .filter_map(|entry| {
            entry.name.parse::<u64>().ok().map(|taxon_key| FacetCount {
                taxon_key,
                count: entry.count,
            })
        })
        .collect())
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn classify(err: reqwest::Error) -> CallFailure {
    if is_connection_reset(&err) {
        CallFailure::reset(err.to_string())
    } else if err.is_decode() {
        CallFailure::permanent(err.to_string())
    } else {
        CallFailure::transient(err.to_string())
    }
}

fn is_connection_reset(err: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(err) = current {
        if let Some(io) = err.downcast_ref::<io::Error>() {
            if matches!(
                io.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            ) {
                return true;
            }
        }
        current = err.source();
    }
    false
}
