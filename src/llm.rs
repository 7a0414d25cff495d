use async_openai::error::OpenAIError;
use async_openai::types::{
    ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs, ResponseFormat,
};
use async_trait::async_trait;
use ollama_rs::generation::completion::request::GenerationRequest;
use ollama_rs::models::ModelOptions;
use ollama_rs::generation::parameters::{FormatType, JsonStructure};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error};

use crate::entity::{Candidate, ResolvableEntity};
use crate::matching::{parse_verdict, Adjudicator, Verdict};
use crate::prompts::adjudication_prompt;
use crate::remote::{BackoffPolicy, RateLimiter, RemoteError};
use crate::{LLMClient, LLMParams, TARGET_LLM_REQUEST};

pub const DEFAULT_LLM_TIMEOUT: Duration = Duration::from_secs(120);

/// Sends one prompt to the configured backend and returns the raw text.
pub async fn generate_llm_response(
    prompt: &str,
    params: &LLMParams,
    request_timeout: Duration,
) -> Result<String, RemoteError> {
    debug!(target: TARGET_LLM_REQUEST, "Sending LLM request to {}: {}", params.model, prompt);

    let response = match &params.llm_client {
        LLMClient::Ollama(ollama) => {
            let mut request = GenerationRequest::new(params.model.clone(), prompt.to_string());
            request.options = Some(ModelOptions::default().temperature(params.temperature));
            request.format = Some(FormatType::StructuredJson(Box::new(JsonStructure::new::<Verdict>())));

            match timeout(request_timeout, ollama.generate(request)).await {
                Ok(Ok(response)) => response.response,
                Ok(Err(e)) => {
                    return Err(RemoteError::Transient(format!("Ollama error: {}", e)));
                }
                Err(_) => {
                    return Err(RemoteError::Transient(format!(
                        "Ollama request timed out after {:?}",
                        request_timeout
                    )));
                }
            }
        }
        LLMClient::OpenAI(client) => {
            let message = ChatCompletionRequestUserMessageArgs::default()
                .content(prompt)
                .build()
                .map_err(|e| RemoteError::Permanent(e.to_string()))?;
            let request = CreateChatCompletionRequestArgs::default()
                .model(params.model.clone())
                .messages([message.into()])
                .temperature(params.temperature)
                .response_format(ResponseFormat::JsonObject)
                .build()
                .map_err(|e| RemoteError::Permanent(e.to_string()))?;

            match timeout(request_timeout, client.chat().create(request)).await {
                Ok(Ok(response)) => response
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|choice| choice.message.content)
                    .unwrap_or_default(),
                Ok(Err(e)) => return Err(classify_openai_error(e)),
                Err(_) => {
                    return Err(RemoteError::Transient(format!(
                        "OpenAI request timed out after {:?}",
                        request_timeout
                    )));
                }
            }
        }
    };

    if response.trim().is_empty() {
        return Err(RemoteError::Transient("empty LLM response".to_string()));
    }
    debug!(target: TARGET_LLM_REQUEST, "LLM response received: {}", response);
    Ok(response)
}

fn classify_openai_error(err: OpenAIError) -> RemoteError {
    match err {
        OpenAIError::Reqwest(e) => RemoteError::from_reqwest(e),
        OpenAIError::ApiError(api)
            if api
                .r#type
                .as_deref()
                .is_some_and(|t| t.contains("rate_limit") || t.contains("server_error")) =>
        {
            RemoteError::Transient(api.message)
        }
        other => RemoteError::Permanent(other.to_string()),
    }
}

/// Adjudicates borderline entities with an LLM, sharing the rate limiter and
/// backoff policy of the candidate source.
#[derive(Clone)]
pub struct LlmAdjudicator {
    params: LLMParams,
    limiter: Arc<RateLimiter>,
    backoff: BackoffPolicy,
    request_timeout: Duration,
}

impl LlmAdjudicator {
    pub fn new(params: LLMParams, limiter: Arc<RateLimiter>, backoff: BackoffPolicy) -> Self {
        Self {
            params,
            limiter,
            backoff,
            request_timeout: DEFAULT_LLM_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    pub fn backend_name(&self) -> &'static str {
        match self.params.llm_client {
            LLMClient::Ollama(_) => "Ollama",
            LLMClient::OpenAI(_) => "OpenAI API",
        }
    }
}

#[async_trait]
impl Adjudicator for LlmAdjudicator {
    async fn adjudicate(
        &self,
        entity: &ResolvableEntity,
        candidates: &[Candidate],
    ) -> Result<Verdict, RemoteError> {
        let prompt = adjudication_prompt(entity, candidates);
        let label = format!("adjudication of '{}'", entity.display_name);

        let raw = self
            .backoff
            .run(&self.limiter, &label, || {
                generate_llm_response(&prompt, &self.params, self.request_timeout)
            })
            .await
            .inspect_err(|e| {
                error!(
                    target: TARGET_LLM_REQUEST,
                    "{} via {} failed: {}", label, self.backend_name(), e
                )
            })?;

        parse_verdict(&raw)
    }
}
