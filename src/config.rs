use anyhow::{bail, Result};
use async_openai::{config::OpenAIConfig, Client as OpenAIClient};
use ollama_rs::Ollama;
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::candidates::{WikidataConfig, WikidataSource};
use crate::checkpoint::{ChunkedCheckpointStore, DEFAULT_CHUNK_CAPACITY};
use crate::environment::{get_env_string_or, get_env_var_or};
use crate::llm::{LlmAdjudicator, DEFAULT_LLM_TIMEOUT};
use crate::matching::{MatchPolicy, Matcher, NgramEmbedder};
use crate::remote::{BackoffPolicy, RateLimiter};
use crate::runner::{RunOptions, DEFAULT_CHECKPOINT_INTERVAL, DEFAULT_CONCURRENCY, DEFAULT_PAGE_SIZE};
use crate::{LLMClient, LLMParams};

const DEFAULT_REQUEST_INTERVAL_MS: u64 = 250;
const DEFAULT_MIN_CONFIDENCE: f64 = 0.5;

#[derive(Debug, Clone, PartialEq)]
pub enum LlmBackend {
    Ollama { host: String, port: u16 },
    OpenAI { api_key: Option<String> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct LlmSettings {
    pub backend: LlmBackend,
    pub model: String,
    pub temperature: f32,
    pub request_timeout: Duration,
}

impl LlmSettings {
    pub fn params(&self) -> Result<LLMParams> {
        let llm_client = match &self.backend {
            LlmBackend::OpenAI { api_key } => {
                let Some(api_key) = api_key else {
                    bail!("OPENAI_API_KEY must be set when LORELINK_LLM_TYPE is openai");
                };
                let config = OpenAIConfig::new().with_api_key(api_key);
                LLMClient::OpenAI(OpenAIClient::with_config(config))
            }
            LlmBackend::Ollama { host, port } => {
                info!("Connecting to Ollama at {}:{}", host, port);
                LLMClient::Ollama(Ollama::new(host.clone(), *port))
            }
        };
        Ok(LLMParams {
            llm_client,
            model: self.model.clone(),
            temperature: self.temperature,
        })
    }
}

/// Everything a pipeline command needs, read from the environment and then
/// adjusted by command line flags.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub database_path: String,
    pub checkpoint_dir: PathBuf,
    /// Where adjudication and retry passes write superseding results.
    pub followup_dir: PathBuf,
    pub chunk_capacity: usize,
    pub concurrency: usize,
    pub checkpoint_interval: usize,
    pub page_size: usize,
    pub min_confidence: f64,
    pub policy: MatchPolicy,
    pub wikidata: WikidataConfig,
    /// Minimum spacing between any two remote calls.
    pub request_interval: Duration,
    pub backoff: BackoffPolicy,
    pub use_embeddings: bool,
    /// `None` leaves borderline entities queued for a later adjudication pass.
    pub llm: Option<LlmSettings>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let checkpoint_dir = PathBuf::from("checkpoints/main");
        Self {
            database_path: "lorelink.db".to_string(),
            followup_dir: followup_sibling(&checkpoint_dir),
            checkpoint_dir,
            chunk_capacity: DEFAULT_CHUNK_CAPACITY,
            concurrency: DEFAULT_CONCURRENCY,
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
            page_size: DEFAULT_PAGE_SIZE,
            min_confidence: DEFAULT_MIN_CONFIDENCE,
            policy: MatchPolicy::default(),
            wikidata: WikidataConfig::default(),
            request_interval: Duration::from_millis(DEFAULT_REQUEST_INTERVAL_MS),
            backoff: BackoffPolicy::default(),
            use_embeddings: true,
            llm: None,
        }
    }
}

fn followup_sibling(checkpoint_dir: &std::path::Path) -> PathBuf {
    checkpoint_dir.with_file_name("followup")
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let checkpoint_dir = env::var("LORELINK_CHECKPOINT_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.checkpoint_dir);
        let followup_dir = env::var("LORELINK_FOLLOWUP_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| followup_sibling(&checkpoint_dir));

        let policy = MatchPolicy {
            fuzzy_accept: get_env_var_or("LORELINK_FUZZY_ACCEPT", defaults.policy.fuzzy_accept),
            embedding_accept: get_env_var_or(
                "LORELINK_EMBEDDING_ACCEPT",
                defaults.policy.embedding_accept,
            ),
            adjudication_floor: get_env_var_or(
                "LORELINK_ADJUDICATION_FLOOR",
                defaults.policy.adjudication_floor,
            ),
            temporal_tolerance_years: get_env_var_or(
                "LORELINK_TEMPORAL_TOLERANCE",
                defaults.policy.temporal_tolerance_years,
            ),
            adjudication_top_k: get_env_var_or("LORELINK_ADJUDICATION_TOP_K", defaults.policy.adjudication_top_k),
            llm_min_certainty: get_env_var_or(
                "LORELINK_LLM_MIN_CERTAINTY",
                defaults.policy.llm_min_certainty,
            ),
        };

        let wikidata = WikidataConfig {
            endpoint: get_env_string_or("LORELINK_WIKIDATA_ENDPOINT", &defaults.wikidata.endpoint),
            language: get_env_string_or("LORELINK_LANGUAGE", &defaults.wikidata.language),
            detail_cache_capacity: get_env_var_or(
                "LORELINK_DETAIL_CACHE",
                defaults.wikidata.detail_cache_capacity,
            ),
            ..defaults.wikidata
        };

        let backoff = BackoffPolicy {
            max_retries: get_env_var_or("LORELINK_MAX_RETRIES", defaults.backoff.max_retries),
            ..defaults.backoff
        };

        Self {
            database_path: get_env_string_or("DATABASE_PATH", &defaults.database_path),
            checkpoint_dir,
            followup_dir,
            chunk_capacity: get_env_var_or("LORELINK_CHUNK_CAPACITY", defaults.chunk_capacity),
            concurrency: get_env_var_or("LORELINK_WORKERS", defaults.concurrency),
            checkpoint_interval: get_env_var_or(
                "LORELINK_CHECKPOINT_INTERVAL",
                defaults.checkpoint_interval,
            ),
            page_size: get_env_var_or("LORELINK_PAGE_SIZE", defaults.page_size),
            min_confidence: get_env_var_or("LORELINK_MIN_CONFIDENCE", defaults.min_confidence),
            policy,
            wikidata,
            request_interval: Duration::from_millis(get_env_var_or(
                "LORELINK_REQUEST_INTERVAL_MS",
                DEFAULT_REQUEST_INTERVAL_MS,
            )),
            backoff,
            use_embeddings: get_env_var_or("LORELINK_EMBEDDINGS", defaults.use_embeddings),
            llm: llm_settings_from_env(),
        }
    }

    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            concurrency: self.concurrency,
            checkpoint_interval: self.checkpoint_interval,
            page_size: self.page_size,
            ..RunOptions::default()
        }
    }

    pub fn checkpoint_store(&self) -> ChunkedCheckpointStore {
        ChunkedCheckpointStore::new(&self.checkpoint_dir, self.chunk_capacity)
    }

    pub fn followup_store(&self) -> ChunkedCheckpointStore {
        ChunkedCheckpointStore::new(&self.followup_dir, self.chunk_capacity)
    }

    pub fn rate_limiter(&self) -> Arc<RateLimiter> {
        Arc::new(RateLimiter::new(self.request_interval))
    }

    pub fn candidate_source(&self, limiter: Arc<RateLimiter>) -> Result<WikidataSource> {
        WikidataSource::new(self.wikidata.clone(), limiter, self.backoff.clone())
    }

    /// The matcher, with the LLM adjudicator attached when one is configured.
    pub fn matcher(&self, limiter: Arc<RateLimiter>) -> Result<Matcher> {
        let mut matcher = Matcher::new(self.policy.clone());
        if self.use_embeddings {
            matcher = matcher.with_embedder(Arc::new(NgramEmbedder::default()));
        }
        if let Some(settings) = &self.llm {
            let adjudicator = LlmAdjudicator::new(settings.params()?, limiter, self.backoff.clone())
                .with_timeout(settings.request_timeout);
            info!(
                "Adjudicating with {} model {}",
                adjudicator.backend_name(),
                settings.model
            );
            matcher = matcher.with_adjudicator(Arc::new(adjudicator));
        }
        Ok(matcher)
    }
}

fn llm_settings_from_env() -> Option<LlmSettings> {
    let model = env::var("LORELINK_LLM_MODEL")
        .ok()
        .filter(|model| !model.trim().is_empty())?;

    let backend = match get_env_string_or("LORELINK_LLM_TYPE", "ollama").as_str() {
        "openai" => LlmBackend::OpenAI {
            api_key: env::var("OPENAI_API_KEY").ok(),
        },
        _ => LlmBackend::Ollama {
            host: get_env_string_or("OLLAMA_HOST", "http://localhost"),
            port: get_env_var_or("OLLAMA_PORT", 11434),
        },
    };

    Some(LlmSettings {
        backend,
        model,
        temperature: get_env_var_or("LORELINK_LLM_TEMPERATURE", 0.0),
        request_timeout: Duration::from_secs(get_env_var_or(
            "LORELINK_LLM_TIMEOUT_SECS",
            DEFAULT_LLM_TIMEOUT.as_secs(),
        )),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_followup_dir_sits_next_to_checkpoint() {
        let config = PipelineConfig::default();
        assert_eq!(config.followup_dir, PathBuf::from("checkpoints/followup"));
        assert_eq!(
            followup_sibling(std::path::Path::new("/var/lib/lorelink/run-2")),
            PathBuf::from("/var/lib/lorelink/followup")
        );
    }

    #[test]
    fn test_openai_requires_key() {
        let settings = LlmSettings {
            backend: LlmBackend::OpenAI { api_key: None },
            model: "gpt-4o-mini".to_string(),
            temperature: 0.0,
            request_timeout: DEFAULT_LLM_TIMEOUT,
        };
        assert!(settings.params().is_err());

        let ollama = LlmSettings {
            backend: LlmBackend::Ollama {
                host: "http://localhost".to_string(),
                port: 11434,
            },
            ..settings
        };
        assert!(matches!(ollama.params().unwrap().llm_client, LLMClient::Ollama(_)));
    }

    #[test]
    fn test_matcher_without_llm_has_no_adjudicator() {
        let config = PipelineConfig::default();
        let limiter = Arc::new(RateLimiter::unlimited());
        assert!(!config.matcher(limiter.clone()).unwrap().has_adjudicator());

        let with_llm = PipelineConfig {
            llm: Some(LlmSettings {
                backend: LlmBackend::Ollama {
                    host: "http://localhost".to_string(),
                    port: 11434,
                },
                model: "llama3".to_string(),
                temperature: 0.0,
                request_timeout: Duration::from_secs(5),
            }),
            ..config
        };
        assert!(with_llm.matcher(limiter).unwrap().has_adjudicator());
    }
}
