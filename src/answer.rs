//! Retrieval-augmented answers.
//!
//! `ask` retrieves the best `final_limit` hits for a prompt, joins their
//! text as context, renders the QA template and hands it to a
//! [`Completer`]. The completion model itself lives behind the trait.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{Config, LlmConfig};
use crate::db;
use crate::embedding::{self, post_json_with_retry, DEFAULT_OPENAI_URL};
use crate::search::{SearchMode, SearchResult, Searcher};
use crate::sqlite_store::SqliteIndexStore;

/// Classic "stuff" QA prompt.
pub const DEFAULT_TEMPLATE: &str = "Use the following pieces of context to answer the question at the end. \
If you don't know the answer, just say that you don't know, don't try to make up an answer.\n\n\
{context}\n\n\
Question: {question}\n\
Helpful Answer:";

/// Text generation capability.
#[async_trait]
pub trait Completer: Send + Sync {
    fn is_enabled(&self) -> bool {
        true
    }

    async fn complete(&self, prompt: &str) -> Result<String>;
}

pub struct DisabledCompleter;

#[async_trait]
impl Completer for DisabledCompleter {
    fn is_enabled(&self) -> bool {
        false
    }

    async fn complete(&self, _prompt: &str) -> Result<String> {
        bail!("LLM provider is disabled. Set [llm] provider in config.")
    }
}

/// OpenAI-compatible chat completions.
///
/// Requires `OPENAI_API_KEY` in the environment.
pub struct OpenAiCompleter {
    client: reqwest::Client,
    api_key: String,
    url: String,
    model: String,
    temperature: f32,
}

impl OpenAiCompleter {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("llm.model required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            api_key,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| DEFAULT_OPENAI_URL.to_string()),
            model,
            temperature: config.temperature,
        })
    }
}

#[async_trait]
impl Completer for OpenAiCompleter {
    async fn complete(&self, prompt: &str) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "temperature": self.temperature,
            "messages": [{ "role": "user", "content": prompt }],
        });
        let url = format!("{}/chat/completions", self.url.trim_end_matches('/'));
        let json = post_json_with_retry(&self.client, &url, &self.api_key, &body, 3).await?;
        parse_chat_response(&json)
    }
}

fn parse_chat_response(json: &serde_json::Value) -> Result<String> {
    match json["choices"][0]["message"]["content"].as_str() {
        Some(content) => Ok(content.trim().to_string()),
        None => bail!("Invalid chat response: missing choices[0].message.content"),
    }
}

pub fn create_completer(config: &LlmConfig) -> Result<Arc<dyn Completer>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledCompleter)),
        "openai" => Ok(Arc::new(OpenAiCompleter::new(config)?)),
        other => bail!("Unknown llm provider: {}", other),
    }
}

/// Substitute `{question}` and `{context}` in `template`.
///
/// Single pass over the template: placeholders inside the substituted
/// text are left alone.
pub fn render_prompt(template: &str, question: &str, context: &str) -> String {
    let mut out = String::with_capacity(template.len() + question.len() + context.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let tail = &rest[start..];
        if let Some(after) = tail.strip_prefix("{question}") {
            out.push_str(question);
            rest = after;
        } else if let Some(after) = tail.strip_prefix("{context}") {
            out.push_str(context);
            rest = after;
        } else {
            out.push('{');
            rest = &tail[1..];
        }
    }
    out.push_str(rest);
    out
}

/// Render the template and complete it.
pub async fn answer(
    completer: &dyn Completer,
    query: &str,
    context: &str,
    template: Option<&str>,
) -> Result<String> {
    let template = template.unwrap_or(DEFAULT_TEMPLATE);
    if !template.contains("{question}") || !template.contains("{context}") {
        bail!("Prompt template must contain {{question}} and {{context}} placeholders");
    }
    completer
        .complete(&render_prompt(template, query, context))
        .await
}

/// Join retrieved texts into one context block.
pub fn join_context(results: &[SearchResult]) -> String {
    results
        .iter()
        .map(|r| r.text.trim())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Retrieve `limit` results for `prompt` and answer with them as context.
pub async fn ask(
    searcher: &Searcher,
    completer: &dyn Completer,
    prompt: &str,
    template: Option<&str>,
    mode: SearchMode,
    limit: usize,
) -> Result<String> {
    let results = searcher.similarity_search(prompt, limit, mode).await?;
    tracing::debug!(prompt = %prompt, hits = results.len(), "Retrieved context");
    answer(completer, prompt, &join_context(&results), template).await
}

/// `cix ask`: print the answer.
pub async fn run_ask(
    config: &Config,
    prompt: &str,
    template: Option<String>,
    no_context: bool,
) -> Result<()> {
    let completer = create_completer(&config.llm)?;
    if !completer.is_enabled() {
        bail!("LLM provider is disabled. Set [llm] provider in config.");
    }

    let text = if no_context {
        completer.complete(prompt).await?
    } else {
        let pool = db::connect(config).await?;
        let searcher = Searcher::new(
            Arc::new(SqliteIndexStore::new(pool.clone())),
            embedding::create_embedder(&config.embedding)?,
            &config.retrieval,
        );
        let mode: SearchMode = config.retrieval.mode.parse()?;
        let template = template.or_else(|| config.llm.prompt_template.clone());
        let text = ask(
            &searcher,
            completer.as_ref(),
            prompt,
            template.as_deref(),
            mode,
            config.retrieval.final_limit,
        )
        .await?;
        pool.close().await;
        text
    };

    println!("{}", text);
    Ok(())
}
