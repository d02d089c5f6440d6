//! NoSQL collection adapter (MongoDB Atlas Data API style).
//!
//! A collection is read page by page with `POST {endpoint}/action/find`,
//! sorted by `_id` so paging is stable, until a page comes back short.
//!
//! # Environment Variables
//!
//! - `NOSQL_API_KEY`: Data API key
//! - `NOSQL_ENDPOINT`: overrides `[connectors.nosql] endpoint`

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::blob::http_error;
use crate::config::NoSqlConnectorConfig;
use crate::error::{IngestError, IngestResult};
use crate::models::{Identity, Origin, RawPayload, RawRecord, SourceKind};
use crate::traits::SourceAdapter;

const API_KEY_VAR: &str = "NOSQL_API_KEY";
const ENDPOINT_VAR: &str = "NOSQL_ENDPOINT";

pub struct NoSqlAdapter {
    api_key: Option<String>,
    endpoint: Option<String>,
    data_source: String,
    page_size: usize,
    client: reqwest::Client,
}

impl NoSqlAdapter {
    pub fn from_env(config: &NoSqlConnectorConfig) -> Result<Self> {
        let api_key = std::env::var(API_KEY_VAR).ok().filter(|k| !k.trim().is_empty());
        let endpoint = std::env::var(ENDPOINT_VAR)
            .ok()
            .filter(|e| !e.trim().is_empty())
            .or_else(|| config.endpoint.clone());
        Self::new(config, endpoint, api_key)
    }

    pub fn new(
        config: &NoSqlConnectorConfig,
        endpoint: Option<String>,
        api_key: Option<String>,
    ) -> Result<Self> {
        Ok(Self {
            api_key,
            endpoint: endpoint.map(|e| e.trim_end_matches('/').to_string()),
            data_source: config.data_source.clone(),
            page_size: config.page_size.max(1),
            client: reqwest::Client::builder().build()?,
        })
    }

    async fn find_page(&self, database: &str, collection: &str, skip: usize) -> IngestResult<Vec<Value>> {
        let (Some(endpoint), Some(api_key)) = (self.endpoint.as_deref(), self.api_key.as_deref())
        else {
            return Err(IngestError::unavailable(
                "nosql",
                self.unavailable_reason().unwrap_or_default(),
            ));
        };

        let body = find_request(&self.data_source, database, collection, self.page_size, skip);
        let resp = self
            .client
            .post(format!("{}/action/find", endpoint))
            .header("api-key", api_key)
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(http_error("nosql", status, &text));
        }

        let payload: Value = resp.json().await?;
        match payload["documents"].as_array() {
            Some(rows) => Ok(rows.clone()),
            None => Err(IngestError::normalization(
                collection,
                "find response has no documents array",
            )),
        }
    }
}

/// Body of one `find` call.
fn find_request(
    data_source: &str,
    database: &str,
    collection: &str,
    limit: usize,
    skip: usize,
) -> Value {
    json!({
        "dataSource": data_source,
        "database": database,
        "collection": collection,
        "filter": {},
        "sort": { "_id": 1 },
        "limit": limit,
        "skip": skip,
    })
}

#[async_trait]
impl SourceAdapter for NoSqlAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::NoSql
    }

    fn description(&self) -> &str {
        "NoSQL collections via an HTTP data API"
    }

    fn unavailable_reason(&self) -> Option<String> {
        match (&self.endpoint, &self.api_key) {
            (None, _) => Some(format!(
                "no endpoint configured ({} or [connectors.nosql] endpoint)",
                ENDPOINT_VAR
            )),
            (_, None) => Some(format!("{} not set", API_KEY_VAR)),
            _ => None,
        }
    }

    async fn list_identities(&self, origin: &Origin) -> IngestResult<Vec<Identity>> {
        let Origin::NoSql { collection, .. } = origin else {
            return Err(IngestError::ConfigurationMissing(format!(
                "nosql adapter cannot read origin {}",
                origin
            )));
        };
        Ok(vec![Identity {
            key: collection.clone(),
            origin: origin.clone(),
        }])
    }

    async fn fetch(&self, identity: &Identity) -> IngestResult<RawRecord> {
        let Origin::NoSql {
            database,
            collection,
        } = &identity.origin
        else {
            return Err(IngestError::ConfigurationMissing(format!(
                "nosql adapter cannot read origin {}",
                identity.origin
            )));
        };

        let mut rows = Vec::new();
        loop {
            let page = self.find_page(database, collection, rows.len()).await?;
            let short = page.len() < self.page_size;
            rows.extend(page);
            if short {
                break;
            }
        }
        debug!(database = %database, collection = %collection, rows = rows.len(), "Fetched collection");

        Ok(RawRecord {
            kind: SourceKind::NoSql,
            identity: identity.clone(),
            name: collection.clone(),
            payload: RawPayload::Rows(rows),
        })
    }
}
