//! Notion workspace adapter.
//!
//! Loads a root page and every descendant `child_page` through the public
//! REST API. Each page is rendered to plain text lines; nested blocks are
//! indented two spaces per level. Chunking into documents happens later in
//! the normalizer.
//!
//! # Environment Variables
//!
//! - `NOTION_INTEGRATION_TOKEN`: internal integration secret

use anyhow::Result;
use async_recursion::async_recursion;
use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::blob::http_error;
use crate::config::NotionConnectorConfig;
use crate::error::{IngestError, IngestResult};
use crate::models::{Identity, NotionPage, Origin, RawPayload, RawRecord, SourceKind};
use crate::traits::SourceAdapter;

const NOTION_VERSION: &str = "2022-06-28";
const TOKEN_VAR: &str = "NOTION_INTEGRATION_TOKEN";

pub struct NotionAdapter {
    token: Option<String>,
    api_url: String,
    max_depth: usize,
    client: reqwest::Client,
}

impl NotionAdapter {
    pub fn from_env(config: &NotionConnectorConfig) -> Result<Self> {
        let token = std::env::var(TOKEN_VAR).ok().filter(|t| !t.trim().is_empty());
        Self::new(config, token)
    }

    pub fn new(config: &NotionConnectorConfig, token: Option<String>) -> Result<Self> {
        Ok(Self {
            token,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            max_depth: config.max_depth,
            client: reqwest::Client::builder().build()?,
        })
    }

    async fn get_json(&self, path: &str, query: &[(&str, &str)]) -> IngestResult<Value> {
        let token = self
            .token
            .as_deref()
            .ok_or_else(|| IngestError::unavailable("notion", format!("{} not set", TOKEN_VAR)))?;

        let resp = self
            .client
            .get(format!("{}{}", self.api_url, path))
            .query(query)
            .bearer_auth(token)
            .header("Notion-Version", NOTION_VERSION)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(http_error("notion", status, &body));
        }
        Ok(resp.json().await?)
    }

    async fn page_title(&self, page_id: &str) -> IngestResult<String> {
        let page = self.get_json(&format!("/v1/pages/{}", page_id), &[]).await?;
        Ok(page_title(&page))
    }

    /// Every child block of `block_id`, following `start_cursor` pagination.
    async fn children(&self, block_id: &str) -> IngestResult<Vec<Value>> {
        let path = format!("/v1/blocks/{}/children", block_id);
        let mut blocks = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let mut query = vec![("page_size", "100")];
            if let Some(ref cursor) = cursor {
                query.push(("start_cursor", cursor.as_str()));
            }
            let body = self.get_json(&path, &query).await?;
            if let Some(results) = body["results"].as_array() {
                blocks.extend(results.iter().cloned());
            }

            let has_more = body["has_more"].as_bool().unwrap_or(false);
            match body["next_cursor"].as_str() {
                Some(next) if has_more => cursor = Some(next.to_string()),
                _ => break,
            }
        }
        Ok(blocks)
    }

    /// Render the blocks under `block_id` into `lines`, collecting child
    /// page ids instead of inlining them.
    #[async_recursion]
    async fn render_tree(
        &self,
        block_id: &str,
        indent: usize,
        lines: &mut Vec<String>,
        child_pages: &mut Vec<String>,
    ) -> IngestResult<()> {
        for block in self.children(block_id).await? {
            let Some(id) = block["id"].as_str() else {
                continue;
            };
            if block["type"] == "child_page" {
                child_pages.push(id.to_string());
                continue;
            }
            if let Some(line) = render_block(&block, indent) {
                lines.push(line);
            }
            if block["has_children"].as_bool().unwrap_or(false) && indent < self.max_depth {
                self.render_tree(id, indent + 1, lines, child_pages).await?;
            }
        }
        Ok(())
    }

    #[async_recursion]
    async fn load_page(
        &self,
        page_id: &str,
        depth: usize,
        pages: &mut Vec<NotionPage>,
    ) -> IngestResult<()> {
        let title = self.page_title(page_id).await?;
        let mut lines = Vec::new();
        let mut child_pages = Vec::new();
        self.render_tree(page_id, 0, &mut lines, &mut child_pages)
            .await?;

        debug!(
            page_id = %page_id,
            lines = lines.len(),
            child_pages = child_pages.len(),
            "Loaded notion page"
        );
        pages.push(NotionPage {
            id: page_id.to_string(),
            title,
            lines,
        });

        if depth < self.max_depth {
            for child in child_pages {
                if pages.iter().any(|p| p.id == child) {
                    continue;
                }
                self.load_page(&child, depth + 1, pages).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SourceAdapter for NotionAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::Notion
    }

    fn description(&self) -> &str {
        "Notion pages and their child pages"
    }

    fn unavailable_reason(&self) -> Option<String> {
        self.token
            .is_none()
            .then(|| format!("{} not set", TOKEN_VAR))
    }

    async fn list_identities(&self, origin: &Origin) -> IngestResult<Vec<Identity>> {
        let Origin::Notion { page_id } = origin else {
            return Err(IngestError::ConfigurationMissing(format!(
                "notion adapter cannot read origin {}",
                origin
            )));
        };
        Ok(vec![Identity {
            key: page_id.clone(),
            origin: origin.clone(),
        }])
    }

    async fn fetch(&self, identity: &Identity) -> IngestResult<RawRecord> {
        let mut pages = Vec::new();
        self.load_page(&identity.key, 0, &mut pages).await?;
        Ok(RawRecord {
            kind: SourceKind::Notion,
            identity: identity.clone(),
            name: identity.key.clone(),
            payload: RawPayload::NotionPages(pages),
        })
    }
}

/// Concatenated `plain_text` of a rich text array.
fn plain_text(rich_text: &Value) -> String {
    rich_text
        .as_array()
        .map(|parts| {
            parts
                .iter()
                .filter_map(|part| part["plain_text"].as_str())
                .collect::<String>()
        })
        .unwrap_or_default()
}

/// Title of a page object: the text of its `title` typed property.
fn page_title(page: &Value) -> String {
    page["properties"]
        .as_object()
        .and_then(|props| props.values().find(|p| p["type"] == "title"))
        .map(|prop| plain_text(&prop["title"]))
        .unwrap_or_default()
}

/// One text line for a block, or `None` for blocks without text.
fn render_block(block: &Value, indent: usize) -> Option<String> {
    let kind = block["type"].as_str()?;
    let body = &block[kind];
    let text = plain_text(&body["rich_text"]);

    let line = match kind {
        "heading_1" => format!("# {}", text),
        "heading_2" => format!("## {}", text),
        "heading_3" => format!("### {}", text),
        "bulleted_list_item" | "toggle" => format!("- {}", text),
        "numbered_list_item" => format!("1. {}", text),
        "to_do" => {
            let mark = if body["checked"].as_bool().unwrap_or(false) {
                "x"
            } else {
                " "
            };
            format!("[{}] {}", mark, text)
        }
        "quote" | "callout" => format!("> {}", text),
        "code" => text,
        "divider" => "---".to_string(),
        _ => text,
    };
    if line.trim().is_empty() {
        return None;
    }
    Some(format!("{}{}", "  ".repeat(indent), line))
}
