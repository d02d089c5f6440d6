//! Similarity search over the index.
//!
//! Three modes:
//!
//! - `keyword`: full-text candidates only
//! - `semantic`: vector candidates only (requires embeddings)
//! - `hybrid`: both, min-max normalized per channel and merged as
//!   `(1 - alpha) * keyword + alpha * vector`

use anyhow::{bail, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use crate::config::{Config, RetrievalConfig};
use crate::db;
use crate::embedding::{self, Embedder};
use crate::sqlite_store::SqliteIndexStore;
use crate::store::{Hit, IndexStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    Keyword,
    Semantic,
    Hybrid,
}

impl SearchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchMode::Keyword => "keyword",
            SearchMode::Semantic => "semantic",
            SearchMode::Hybrid => "hybrid",
        }
    }

    fn needs_vectors(&self) -> bool {
        !matches!(self, SearchMode::Keyword)
    }
}

impl FromStr for SearchMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "keyword" => Ok(SearchMode::Keyword),
            "semantic" => Ok(SearchMode::Semantic),
            "hybrid" => Ok(SearchMode::Hybrid),
            _ => bail!(
                "Unknown search mode: {}. Use keyword, semantic, or hybrid.",
                s
            ),
        }
    }
}

/// A ranked search result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    pub id: String,
    pub source_id: String,
    pub text: String,
    pub score: f64,
}

pub struct Searcher {
    index: Arc<dyn IndexStore>,
    embedder: Arc<dyn Embedder>,
    hybrid_alpha: f64,
    candidate_k: usize,
}

impl Searcher {
    pub fn new(
        index: Arc<dyn IndexStore>,
        embedder: Arc<dyn Embedder>,
        retrieval: &RetrievalConfig,
    ) -> Self {
        Self {
            index,
            embedder,
            hybrid_alpha: retrieval.hybrid_alpha,
            candidate_k: retrieval.candidate_k,
        }
    }

    /// Top `k` results for `term`, best first. Ties break on id.
    pub async fn similarity_search(
        &self,
        term: &str,
        k: usize,
        mode: SearchMode,
    ) -> Result<Vec<SearchResult>> {
        if term.trim().is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        if mode.needs_vectors() && !self.embedder.is_enabled() {
            bail!(
                "Mode '{}' requires embeddings. Set [embedding] provider in config.",
                mode.as_str()
            );
        }

        let candidate_k = self.candidate_k.max(k);
        let keyword_candidates = if mode != SearchMode::Semantic {
            self.index.keyword_search(term, candidate_k).await?
        } else {
            Vec::new()
        };
        let vector_candidates = if mode.needs_vectors() {
            let query_vec = embedding::embed_query(self.embedder.as_ref(), term).await?;
            self.index.vector_search(&query_vec, candidate_k).await?
        } else {
            Vec::new()
        };

        let alpha = match mode {
            SearchMode::Keyword => 0.0,
            SearchMode::Semantic => 1.0,
            SearchMode::Hybrid => self.hybrid_alpha,
        };
        let mut results = merge_candidates(&keyword_candidates, &vector_candidates, alpha);
        results.truncate(k);
        Ok(results)
    }
}

/// Weighted merge of the two normalized channels.
fn merge_candidates(keyword: &[Hit], vector: &[Hit], alpha: f64) -> Vec<SearchResult> {
    let kw_map: HashMap<&str, f64> = normalize_scores(keyword)
        .into_iter()
        .map(|(h, s)| (h.uid.as_str(), s))
        .collect();
    let vec_map: HashMap<&str, f64> = normalize_scores(vector)
        .into_iter()
        .map(|(h, s)| (h.uid.as_str(), s))
        .collect();

    let mut all_hits: HashMap<&str, &Hit> = HashMap::new();
    for hit in keyword.iter().chain(vector) {
        all_hits.entry(hit.uid.as_str()).or_insert(hit);
    }

    let mut results: Vec<SearchResult> = all_hits
        .into_iter()
        .map(|(uid, hit)| {
            let k = kw_map.get(uid).copied().unwrap_or(0.0);
            let v = vec_map.get(uid).copied().unwrap_or(0.0);
            SearchResult {
                id: uid.to_string(),
                source_id: hit.source_id.clone(),
                text: hit.text.clone(),
                score: (1.0 - alpha) * k + alpha * v,
            }
        })
        .collect();

    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.id.cmp(&b.id))
    });
    results
}

/// Min-max normalize scores to [0, 1]. Equal scores all become 1.0.
fn normalize_scores(candidates: &[Hit]) -> Vec<(&Hit, f64)> {
    if candidates.is_empty() {
        return Vec::new();
    }

    let s_min = candidates
        .iter()
        .map(|c| c.raw_score)
        .fold(f64::INFINITY, f64::min);
    let s_max = candidates
        .iter()
        .map(|c| c.raw_score)
        .fold(f64::NEG_INFINITY, f64::max);

    candidates
        .iter()
        .map(|c| {
            let norm = if (s_max - s_min).abs() < f64::EPSILON {
                1.0
            } else {
                (c.raw_score - s_min) / (s_max - s_min)
            };
            (c, norm)
        })
        .collect()
}

/// `cix search`: print ranked results.
pub async fn run_search(config: &Config, term: &str, mode: &str, limit: Option<usize>) -> Result<()> {
    let mode: SearchMode = mode.parse()?;
    let pool = db::connect(config).await?;
    let embedder = embedding::create_embedder(&config.embedding)?;
    let searcher = Searcher::new(
        Arc::new(SqliteIndexStore::new(pool.clone())),
        embedder,
        &config.retrieval,
    );

    let results = searcher
        .similarity_search(term, limit.unwrap_or(config.retrieval.final_limit), mode)
        .await?;

    if results.is_empty() {
        println!("No results.");
    }
    for (i, result) in results.iter().enumerate() {
        println!("{}. [{:.2}] {}", i + 1, result.score, result.source_id);
        let excerpt: String = result.text.chars().take(240).collect();
        println!("    excerpt: \"{}\"", excerpt.replace('\n', " ").trim());
        println!("    id: {}", result.id);
        println!();
    }

    pool.close().await;
    Ok(())
}
