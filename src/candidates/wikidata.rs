//! Wikidata-backed candidate source: `wbsearchentities` then a batched
//! `wbgetentities` detail fetch for the top hits.

use async_trait::async_trait;
use lru::LruCache;
use reqwest::header;
use serde::Deserialize;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use super::{promote_hinted, CandidateFetch, CandidateSource};
use crate::entity::normalizer::years_in;
use crate::entity::{Candidate, TemporalBounds};
use crate::remote::{BackoffPolicy, RateLimiter, RemoteError};
use crate::TARGET_WEB_REQUEST;

const BIRTH: &str = "P569";
const DEATH: &str = "P570";
const START_TIME: &str = "P580";
const END_TIME: &str = "P582";

#[derive(Debug, Clone)]
pub struct WikidataConfig {
    pub endpoint: String,
    pub language: String,
    /// Search hits kept per query.
    pub max_candidates: usize,
    /// How many of the top hits get a detail fetch.
    pub detail_limit: usize,
    /// Detailed entities kept between queries; least recently used go first.
    pub detail_cache_capacity: usize,
    pub request_timeout: Duration,
    pub user_agent: String,
}

impl Default for WikidataConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://www.wikidata.org/w/api.php".to_string(),
            language: "en".to_string(),
            max_candidates: 7,
            detail_limit: 5,
            detail_cache_capacity: 10_000,
            request_timeout: Duration::from_secs(30),
            user_agent: format!(
                "lorelink/{} (entity reconciliation batch job)",
                env!("CARGO_PKG_VERSION")
            ),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    search: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    id: Option<String>,
    label: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    aliases: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct EntitiesResponse {
    #[serde(default)]
    entities: HashMap<String, EntityDoc>,
}

#[derive(Debug, Deserialize)]
struct EntityDoc {
    id: Option<String>,
    #[serde(default)]
    missing: Option<String>,
    #[serde(default)]
    labels: HashMap<String, LangValue>,
    #[serde(default)]
    descriptions: HashMap<String, LangValue>,
    #[serde(default)]
    aliases: HashMap<String, Vec<LangValue>>,
    #[serde(default)]
    claims: HashMap<String, Vec<Claim>>,
}

#[derive(Debug, Deserialize)]
struct LangValue {
    value: String,
}

#[derive(Debug, Deserialize)]
struct Claim {
    mainsnak: Snak,
}

#[derive(Debug, Deserialize)]
struct Snak {
    #[serde(default)]
    datavalue: Option<DataValue>,
}

#[derive(Debug, Deserialize)]
struct DataValue {
    value: serde_json::Value,
}

pub struct WikidataSource {
    client: reqwest::Client,
    config: WikidataConfig,
    limiter: Arc<RateLimiter>,
    backoff: BackoffPolicy,
    details: Mutex<LruCache<String, Candidate>>,
}

impl WikidataSource {
    pub fn new(
        config: WikidataConfig,
        limiter: Arc<RateLimiter>,
        backoff: BackoffPolicy,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .timeout(config.request_timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build HTTP client: {}", e))?;

        let capacity = NonZeroUsize::new(config.detail_cache_capacity).unwrap_or(NonZeroUsize::MIN);
        Ok(Self {
            client,
            config,
            limiter,
            backoff,
            details: Mutex::new(LruCache::new(capacity)),
        })
    }

    /// Number of entities whose details are currently cached.
    pub fn cached_details(&self) -> usize {
        self.details.lock().map(|cache| cache.len()).unwrap_or_default()
    }

    /// Splits `ids` into cached details and the ids still to fetch.
    fn cached(&self, ids: &[String]) -> (HashMap<String, Candidate>, Vec<String>) {
        let mut found = HashMap::new();
        let mut missing = Vec::new();
        let Ok(mut cache) = self.details.lock() else {
            return (found, ids.to_vec());
        };
        for id in ids {
            match cache.get(id) {
                Some(candidate) => {
                    found.insert(id.clone(), candidate.clone());
                }
                None => missing.push(id.clone()),
            }
        }
        (found, missing)
    }

    fn remember(&self, candidates: &[Candidate]) {
        if let Ok(mut cache) = self.details.lock() {
            for candidate in candidates {
                cache.put(candidate.external_id.clone(), candidate.clone());
            }
        }
    }

    fn search_url(&self, name: &str) -> Result<Url, RemoteError> {
        let limit = self.config.max_candidates.to_string();
        Url::parse_with_params(
            &self.config.endpoint,
            &[
                ("action", "wbsearchentities"),
                ("search", name),
                ("language", self.config.language.as_str()),
                ("uselang", self.config.language.as_str()),
                ("type", "item"),
                ("limit", limit.as_str()),
                ("format", "json"),
            ],
        )
        .map_err(|e| RemoteError::Permanent(format!("invalid endpoint: {}", e)))
    }

    fn detail_url(&self, ids: &[String]) -> Result<Url, RemoteError> {
        let ids = ids.join("|");
        Url::parse_with_params(
            &self.config.endpoint,
            &[
                ("action", "wbgetentities"),
                ("ids", ids.as_str()),
                ("props", "labels|aliases|descriptions|claims"),
                ("languages", self.config.language.as_str()),
                ("format", "json"),
            ],
        )
        .map_err(|e| RemoteError::Permanent(format!("invalid endpoint: {}", e)))
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, url: Url) -> Result<T, RemoteError> {
        debug!(target: TARGET_WEB_REQUEST, "GET {}", url);
        let response = self
            .client
            .get(url.clone())
            .header(header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(RemoteError::from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            return Err(RemoteError::from_status(status, url.as_str()));
        }
        response.json::<T>().await.map_err(RemoteError::from_reqwest)
    }

    async fn search(&self, name: &str) -> Result<Vec<Candidate>, RemoteError> {
        let url = self.search_url(name)?;
        let response: SearchResponse = self
            .backoff
            .run(&self.limiter, "wikidata search", || self.get_json(url.clone()))
            .await?;

        let hits: Vec<Candidate> = response
            .search
            .into_iter()
            .filter_map(|hit| {
                let (Some(id), Some(label)) = (hit.id, hit.label) else {
                    warn!(target: TARGET_WEB_REQUEST, "Dropping search hit without id/label for '{}'", name);
                    return None;
                };
                Some(
                    Candidate::new(&id, &label)
                        .with_description(hit.description.as_deref().unwrap_or_default())
                        .with_aliases(hit.aliases),
                )
            })
            .filter(Candidate::is_well_formed)
            .collect();
        Ok(hits)
    }

    async fn fetch_details(&self, ids: &[String]) -> Result<Vec<Candidate>, RemoteError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let url = self.detail_url(ids)?;
        let response: EntitiesResponse = self
            .backoff
            .run(&self.limiter, "wikidata details", || self.get_json(url.clone()))
            .await?;

        let details: Vec<Candidate> = response
            .entities
            .into_iter()
            .filter(|(_, doc)| doc.missing.is_none())
            .filter_map(|(key, doc)| self.candidate_from_doc(&key, doc))
            .collect();
        self.remember(&details);
        Ok(details)
    }

    fn candidate_from_doc(&self, key: &str, doc: EntityDoc) -> Option<Candidate> {
        let lang = self.config.language.as_str();
        let id = doc.id.unwrap_or_else(|| key.to_string());
        let label = doc.labels.get(lang).map(|l| l.value.clone())?;
        let description = doc
            .descriptions
            .get(lang)
            .map(|d| d.value.clone())
            .unwrap_or_default();

        let mut bounds = TemporalBounds::new(
            claim_year(&doc.claims, BIRTH).or_else(|| claim_year(&doc.claims, START_TIME)),
            claim_year(&doc.claims, DEATH).or_else(|| claim_year(&doc.claims, END_TIME)),
        );
        if bounds.is_empty() {
            // Descriptions such as "Irish king (1002-1014)" carry the span when claims don't.
            if let [start, end] = years_in(&description).as_slice() {
                if start <= end {
                    bounds = TemporalBounds::new(Some(*start), Some(*end));
                }
            }
        }

        let aliases = doc
            .aliases
            .get(lang)
            .map(|values| values.iter().map(|v| v.value.clone()).collect::<Vec<_>>())
            .unwrap_or_default();

        let candidate = Candidate::new(&id, &label)
            .with_description(&description)
            .with_aliases(aliases);
        Some(Candidate { bounds, ..candidate })
    }
}

#[async_trait]
impl CandidateSource for WikidataSource {
    async fn fetch(&self, name: &str, hint: Option<&str>) -> CandidateFetch {
        let hits = match self.search(name).await {
            Ok(hits) => hits,
            Err(err) => {
                warn!(target: TARGET_WEB_REQUEST, "Candidate search for '{}' failed: {}", name, err);
                return CandidateFetch::failed(err.to_string());
            }
        };
        if hits.is_empty() {
            debug!(target: TARGET_WEB_REQUEST, "No candidates for '{}'", name);
            return CandidateFetch::found(hits);
        }

        // The hint only decides which hits get details; the service's ranking is kept.
        let detailed_ids: Vec<String> = promote_hinted(hits.clone(), hint)
            .into_iter()
            .take(self.config.detail_limit)
            .map(|hit| hit.external_id)
            .collect();
        let (mut details, uncached) = self.cached(&detailed_ids);

        match self.fetch_details(&uncached).await {
            Ok(fetched) => {
                details.extend(fetched.into_iter().map(|c| (c.external_id.clone(), c)));
            }
            Err(err) => {
                warn!(target: TARGET_WEB_REQUEST, "Detail fetch for '{}' failed: {}", name, err);
                return CandidateFetch::failed(err.to_string());
            }
        }

        let candidates: Vec<Candidate> = hits
            .into_iter()
            .map(|hit| details.remove(&hit.external_id).unwrap_or(hit))
            .collect();

        info!(
            target: TARGET_WEB_REQUEST,
            "Fetched {} candidate(s) for '{}' ({} detail fetch(es), {} cached)",
            candidates.len(),
            name,
            uncached.len(),
            self.cached_details()
        );
        CandidateFetch::found(candidates)
    }
}

/// Year of the first time-valued claim for `property`.
fn claim_year(claims: &HashMap<String, Vec<Claim>>, property: &str) -> Option<i32> {
    claims.get(property)?.iter().find_map(|claim| {
        let value = &claim.mainsnak.datavalue.as_ref()?.value;
        parse_wikidata_year(value.get("time")?.as_str()?)
    })
}

/// Parses the year out of a Wikidata time string such as `+1412-01-06T00:00:00Z`
/// or `-0500-00-00T00:00:00Z`.
pub fn parse_wikidata_year(time: &str) -> Option<i32> {
    let (sign, rest) = match time.as_bytes().first()? {
        b'+' => (1, &time[1..]),
        b'-' => (-1, &time[1..]),
        _ => (1, time),
    };
    let year: i32 = rest.split('-').next()?.parse().ok()?;
    Some(sign * year)
}
