//! Azure Blob Storage blob store.
//!
//! Talks to the Blob service REST API directly. Requests are authorized
//! either with a Shared Key signature (account key in the connection string)
//! or by appending the connection string's SAS token.
//!
//! # Environment Variables
//!
//! - `AZURE_STORAGE_CONNECTION_STRING`: standard connection string, e.g.
//!   `DefaultEndpointsProtocol=https;AccountName=acme;AccountKey=...;EndpointSuffix=core.windows.net`
//!
//! `BlobEndpoint=` overrides the derived endpoint (Azurite uses
//! `http://127.0.0.1:10000/devstoreaccount1`).

use anyhow::Result;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::Url;
use sha2::Sha256;
use tokio::io::AsyncWrite;

use crate::blob::{http_error, stream_body_to, xml_blocks, xml_value, BlobObject, BlobStore};
use crate::error::{IngestError, IngestResult};

const API_VERSION: &str = "2021-08-06";
const CONNECTION_STRING_VAR: &str = "AZURE_STORAGE_CONNECTION_STRING";

/// Parsed storage account settings.
#[derive(Debug, Clone, PartialEq)]
struct StorageAccount {
    name: String,
    key: Option<Vec<u8>>,
    sas: Option<String>,
    endpoint: String,
}

impl StorageAccount {
    fn parse(connection_string: &str) -> std::result::Result<Self, String> {
        let mut name = None;
        let mut key = None;
        let mut sas = None;
        let mut endpoint = None;
        let mut protocol = "https".to_string();
        let mut suffix = "core.windows.net".to_string();

        for part in connection_string.split(';').map(str::trim) {
            if part.is_empty() {
                continue;
            }
            // Values (keys, SAS tokens) may themselves contain '='
            let Some((k, v)) = part.split_once('=') else {
                return Err(format!("malformed connection string segment '{}'", part));
            };
            match k {
                "AccountName" => name = Some(v.to_string()),
                "AccountKey" => {
                    key = Some(
                        STANDARD
                            .decode(v)
                            .map_err(|e| format!("AccountKey is not valid base64: {}", e))?,
                    )
                }
                "SharedAccessSignature" => sas = Some(v.trim_start_matches('?').to_string()),
                "BlobEndpoint" => endpoint = Some(v.trim_end_matches('/').to_string()),
                "DefaultEndpointsProtocol" => protocol = v.to_string(),
                "EndpointSuffix" => suffix = v.to_string(),
                _ => {}
            }
        }

        let name = name.ok_or_else(|| "connection string has no AccountName".to_string())?;
        if key.is_none() && sas.is_none() {
            return Err("connection string has neither AccountKey nor SharedAccessSignature".into());
        }
        let endpoint =
            endpoint.unwrap_or_else(|| format!("{}://{}.blob.{}", protocol, name, suffix));

        Ok(Self {
            name,
            key,
            sas,
            endpoint,
        })
    }
}

/// Azure implementation of [`BlobStore`].
pub struct AzureBlobStore {
    account: std::result::Result<StorageAccount, String>,
    client: reqwest::Client,
}

impl AzureBlobStore {
    pub fn from_env() -> Result<Self> {
        let account = match std::env::var(CONNECTION_STRING_VAR) {
            Ok(value) if !value.trim().is_empty() => StorageAccount::parse(&value),
            _ => Err(format!("{} not set", CONNECTION_STRING_VAR)),
        };
        Ok(Self {
            account,
            client: reqwest::Client::builder().build()?,
        })
    }

    fn account(&self) -> IngestResult<&StorageAccount> {
        self.account
            .as_ref()
            .map_err(|reason| IngestError::unavailable("azure", reason.clone()))
    }

    fn url(&self, container: &str, blob: Option<&str>, query: &[(&str, &str)]) -> IngestResult<Url> {
        let account = self.account()?;
        let mut raw = format!("{}/{}", account.endpoint, container);
        if let Some(blob) = blob {
            raw.push('/');
            raw.push_str(blob);
        }
        let mut url = Url::parse(&raw)
            .map_err(|e| IngestError::ConfigurationMissing(format!("invalid blob url {}: {}", raw, e)))?;
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query.iter().copied());
        }
        Ok(url)
    }

    fn signed_get(&self, mut url: Url, now: DateTime<Utc>) -> IngestResult<reqwest::RequestBuilder> {
        let account = self.account()?;
        let date = now.format("%a, %d %b %Y %H:%M:%S GMT").to_string();

        let authorization = match (&account.key, &account.sas) {
            (Some(key), _) => {
                let string_to_sign = string_to_sign(&account.name, &url, &date);
                let mut mac = Hmac::<Sha256>::new_from_slice(key)
                    .map_err(|e| IngestError::unavailable("azure", e.to_string()))?;
                mac.update(string_to_sign.as_bytes());
                let signature = STANDARD.encode(mac.finalize().into_bytes());
                Some(format!("SharedKey {}:{}", account.name, signature))
            }
            (None, Some(sas)) => {
                let query = match url.query() {
                    Some(existing) if !existing.is_empty() => format!("{}&{}", existing, sas),
                    _ => sas.clone(),
                };
                url.set_query(Some(&query));
                None
            }
            (None, None) => {
                return Err(IngestError::unavailable("azure", "no credentials"));
            }
        };

        let mut request = self
            .client
            .get(url)
            .header("x-ms-date", &date)
            .header("x-ms-version", API_VERSION);
        if let Some(authorization) = authorization {
            request = request.header("Authorization", authorization);
        }
        Ok(request)
    }
}

/// Shared Key string-to-sign for a body-less GET.
///
/// Twelve standard header slots (all empty for a plain GET because
/// `x-ms-date` replaces `Date`), then canonicalized headers and resource.
fn string_to_sign(account: &str, url: &Url, date: &str) -> String {
    let canonical_headers = format!("x-ms-date:{}\nx-ms-version:{}\n", date, API_VERSION);
    format!(
        "GET\n\n\n\n\n\n\n\n\n\n\n\n{}{}",
        canonical_headers,
        canonicalized_resource(account, url)
    )
}

/// `/{account}{path}` followed by one `\nname:value` line per query
/// parameter, names lowercased and sorted.
fn canonicalized_resource(account: &str, url: &Url) -> String {
    let mut resource = format!("/{}{}", account, url.path());
    let mut params: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (k.to_lowercase(), v.into_owned()))
        .collect();
    params.sort();
    for (name, value) in params {
        resource.push('\n');
        resource.push_str(&name);
        resource.push(':');
        resource.push_str(&value);
    }
    resource
}

/// Parse one List Blobs page: blobs and the marker of the next page.
fn parse_list_blobs_response(xml: &str) -> (Vec<BlobObject>, Option<String>) {
    let objects = xml_blocks(xml, "Blob")
        .into_iter()
        .filter_map(|block| {
            let name = xml_value(block, "Name")?;
            let size = xml_value(block, "Content-Length")
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(0);
            Some(BlobObject { name, size })
        })
        .collect();
    let next_marker = xml_value(xml, "NextMarker").filter(|m| !m.is_empty());
    (objects, next_marker)
}

#[async_trait]
impl BlobStore for AzureBlobStore {
    fn unavailable_reason(&self) -> Option<String> {
        self.account.as_ref().err().cloned()
    }

    async fn list(&self, container: &str, prefix: Option<&str>) -> IngestResult<Vec<BlobObject>> {
        let mut objects = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let mut query = vec![("restype", "container"), ("comp", "list")];
            if let Some(prefix) = prefix {
                query.push(("prefix", prefix));
            }
            if let Some(ref marker) = marker {
                query.push(("marker", marker.as_str()));
            }
            let url = self.url(container, None, &query)?;

            let resp = self.signed_get(url, Utc::now())?.send().await?;
            let status = resp.status();
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(http_error("azure", status, &body));
            }

            let body = resp.text().await?;
            let (batch, next_marker) = parse_list_blobs_response(&body);
            objects.extend(batch);

            match next_marker {
                Some(next) => marker = Some(next),
                None => break,
            }
        }

        Ok(objects)
    }

    async fn download_to(
        &self,
        container: &str,
        name: &str,
        writer: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> IngestResult<u64> {
        let url = self.url(container, Some(name), &[])?;
        let resp = self.signed_get(url, Utc::now())?.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(http_error("azure", status, &body));
        }
        stream_body_to(resp, writer).await
    }
}
