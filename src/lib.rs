pub mod candidates;
pub mod checkpoint;
pub mod config;
pub mod db;
pub mod entity;
pub mod environment;
pub mod links;
pub mod llm;
pub mod logging;
pub mod matching;
pub mod prompts;
pub mod remote;
pub mod runner;

use async_openai::{config::OpenAIConfig, Client as OpenAIClient};
use ollama_rs::Ollama;

pub const TARGET_WEB_REQUEST: &str = "web_request";
pub const TARGET_LLM_REQUEST: &str = "llm_request";
pub const TARGET_DB: &str = "db_query";
pub const TARGET_CHECKPOINT: &str = "checkpoint";
pub const TARGET_MATCHING: &str = "matching";
pub const TARGET_RUNNER: &str = "runner";

#[derive(Clone, Debug)]
pub enum LLMClient {
    Ollama(Ollama),
    OpenAI(OpenAIClient<OpenAIConfig>),
}

#[derive(Clone, Debug)]
pub struct LLMParams {
    pub llm_client: LLMClient,
    pub model: String,
    pub temperature: f32,
}
