//! Amazon S3 blob store.
//!
//! Lists and downloads objects using the S3 REST API with AWS Signature V4
//! authentication. Listing follows `ListObjectsV2` continuation tokens;
//! downloads are streamed into the caller's writer. Custom endpoints
//! (MinIO, LocalStack) are addressed path-style.
//!
//! Uses only pure-Rust dependencies (`hmac`, `sha2`) for AWS signing.
//!
//! # Configuration
//!
//! ```toml
//! [connectors.s3]
//! bucket = "acme-docs"          # used when a request names no bucket
//! region = "us-east-1"
//! # endpoint_url = "http://localhost:9000"   # MinIO
//! ```
//!
//! # Environment Variables
//!
//! - `AWS_ACCESS_KEY_ID`: required
//! - `AWS_SECRET_ACCESS_KEY`: required
//! - `AWS_SESSION_TOKEN`: optional (temporary credentials / IAM roles)
//!
//! Without the two required variables the store reports itself unavailable.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWrite;

use crate::blob::{http_error, stream_body_to, xml_blocks, xml_value, BlobObject, BlobStore};
use crate::config::S3ConnectorConfig;
use crate::error::{IngestError, IngestResult};

type HmacSha256 = Hmac<Sha256>;

// ============ AWS Credentials ============

/// AWS credentials loaded from environment variables.
#[derive(Clone)]
struct AwsCredentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

impl AwsCredentials {
    fn from_env() -> Option<Self> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID").ok()?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY").ok()?;
        Some(Self {
            access_key_id,
            secret_access_key,
            session_token: std::env::var("AWS_SESSION_TOKEN").ok(),
        })
    }
}

/// S3 implementation of [`BlobStore`].
pub struct S3BlobStore {
    creds: Option<AwsCredentials>,
    region: String,
    endpoint_url: Option<String>,
    client: reqwest::Client,
}

impl S3BlobStore {
    pub fn from_env(config: &S3ConnectorConfig) -> Result<Self> {
        Ok(Self {
            creds: AwsCredentials::from_env(),
            region: config.region.clone(),
            endpoint_url: config.endpoint_url.clone(),
            client: reqwest::Client::builder().build()?,
        })
    }

    fn creds(&self) -> IngestResult<&AwsCredentials> {
        self.creds.as_ref().ok_or_else(|| {
            IngestError::unavailable("s3", "AWS_ACCESS_KEY_ID / AWS_SECRET_ACCESS_KEY not set")
        })
    }

    /// Build a SigV4-signed GET request for `path` within `bucket`.
    fn signed_get(
        &self,
        bucket: &str,
        key: Option<&str>,
        query_params: &[(String, String)],
        now: DateTime<Utc>,
    ) -> IngestResult<reqwest::RequestBuilder> {
        let creds = self.creds()?;
        let target = s3_target(bucket, &self.region, self.endpoint_url.as_deref());

        let encoded_key = key
            .map(|k| k.split('/').map(uri_encode).collect::<Vec<_>>().join("/"))
            .unwrap_or_default();
        let canonical_uri = format!("{}/{}", target.base_path, encoded_key);

        // Canonical query string must be sorted
        let mut sorted_params = query_params.to_vec();
        sorted_params.sort_by(|a, b| a.0.cmp(&b.0));
        let canonical_querystring: String = sorted_params
            .iter()
            .map(|(k, v)| format!("{}={}", uri_encode(k), uri_encode(v)))
            .collect::<Vec<_>>()
            .join("&");

        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let payload_hash = hex_sha256(b"");

        let mut headers = vec![
            ("host".to_string(), target.host.clone()),
            ("x-amz-content-sha256".to_string(), payload_hash.clone()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        if let Some(ref token) = creds.session_token {
            headers.push(("x-amz-security-token".to_string(), token.clone()));
        }
        headers.sort_by(|a, b| a.0.cmp(&b.0));

        let signed_headers: String = headers
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(";");
        let canonical_headers: String = headers
            .iter()
            .map(|(k, v)| format!("{}:{}\n", k, v))
            .collect();

        let canonical_request = format!(
            "GET\n{}\n{}\n{}\n{}\n{}",
            canonical_uri, canonical_querystring, canonical_headers, signed_headers, payload_hash
        );

        let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, self.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            credential_scope,
            hex_sha256(canonical_request.as_bytes())
        );
        let signing_key =
            derive_signing_key(&creds.secret_access_key, &date_stamp, &self.region, "s3");
        let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes()));

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            creds.access_key_id, credential_scope, signed_headers, signature
        );

        let mut url = format!("{}://{}{}", target.scheme, target.host, canonical_uri);
        if !canonical_querystring.is_empty() {
            url.push('?');
            url.push_str(&canonical_querystring);
        }

        let mut req_builder = self
            .client
            .get(&url)
            .header("Authorization", &authorization)
            .header("x-amz-content-sha256", &payload_hash)
            .header("x-amz-date", &amz_date);
        if let Some(ref token) = creds.session_token {
            req_builder = req_builder.header("x-amz-security-token", token);
        }
        Ok(req_builder)
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    fn unavailable_reason(&self) -> Option<String> {
        self.creds
            .is_none()
            .then(|| "AWS_ACCESS_KEY_ID / AWS_SECRET_ACCESS_KEY not set".to_string())
    }

    async fn list(&self, bucket: &str, prefix: Option<&str>) -> IngestResult<Vec<BlobObject>> {
        let mut objects = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut query_params = vec![
                ("list-type".to_string(), "2".to_string()),
                ("max-keys".to_string(), "1000".to_string()),
            ];
            if let Some(prefix) = prefix {
                query_params.push(("prefix".to_string(), prefix.to_string()));
            }
            if let Some(ref token) = continuation_token {
                query_params.push(("continuation-token".to_string(), token.clone()));
            }

            let resp = self
                .signed_get(bucket, None, &query_params, Utc::now())?
                .send()
                .await?;
            let status = resp.status();
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(http_error("s3", status, &body));
            }

            let xml_body = resp.text().await?;
            let (batch, is_truncated, next_token) = parse_list_objects_response(&xml_body);
            objects.extend(batch);

            match (is_truncated, next_token) {
                (true, Some(token)) => continuation_token = Some(token),
                _ => break,
            }
        }

        Ok(objects)
    }

    async fn download_to(
        &self,
        bucket: &str,
        key: &str,
        writer: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> IngestResult<u64> {
        let resp = self
            .signed_get(bucket, Some(key), &[], Utc::now())?
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(http_error("s3", status, &body));
        }
        stream_body_to(resp, writer).await
    }
}

// ============ AWS SigV4 Helpers ============

struct S3Target {
    scheme: String,
    host: String,
    /// Empty for virtual-hosted style, `/{bucket}` for path style.
    base_path: String,
}

/// Virtual-hosted `<bucket>.s3.<region>.amazonaws.com`, or path style
/// against a custom endpoint.
fn s3_target(bucket: &str, region: &str, endpoint_url: Option<&str>) -> S3Target {
    match endpoint_url {
        Some(endpoint) => {
            let scheme = if endpoint.starts_with("http://") {
                "http"
            } else {
                "https"
            };
            let host = endpoint
                .trim_start_matches("https://")
                .trim_start_matches("http://")
                .trim_end_matches('/')
                .to_string();
            S3Target {
                scheme: scheme.to_string(),
                host,
                base_path: format!("/{}", uri_encode(bucket)),
            }
        }
        None => S3Target {
            scheme: "https".to_string(),
            host: format!("{}.s3.{}.amazonaws.com", bucket, region),
            base_path: String::new(),
        },
    }
}

fn hex_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Derive the SigV4 signing key.
///
/// ```text
/// kDate    = HMAC("AWS4" + secret, dateStamp)
/// kRegion  = HMAC(kDate, region)
/// kService = HMAC(kRegion, service)
/// kSigning = HMAC(kService, "aws4_request")
/// ```
fn derive_signing_key(secret_key: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(
        format!("AWS4{}", secret_key).as_bytes(),
        date_stamp.as_bytes(),
    );
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// RFC 3986 encoding; only `A-Z a-z 0-9 - _ . ~` pass through.
fn uri_encode(s: &str) -> String {
    let mut result = String::new();
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char);
            }
            _ => {
                result.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    result
}

/// Parse one `ListObjectsV2` page: objects, truncation flag, next token.
fn parse_list_objects_response(xml: &str) -> (Vec<BlobObject>, bool, Option<String>) {
    let is_truncated = xml_value(xml, "IsTruncated")
        .map(|v| v == "true")
        .unwrap_or(false);
    let next_token = xml_value(xml, "NextContinuationToken");

    let objects = xml_blocks(xml, "Contents")
        .into_iter()
        .filter_map(|block| {
            let name = xml_value(block, "Key")?;
            if name.is_empty() || name.ends_with('/') {
                return None;
            }
            let size = xml_value(block, "Size")
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(0);
            Some(BlobObject { name, size })
        })
        .collect();

    (objects, is_truncated, next_token)
}
