use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use mps_config::{AppConfig, ResolvedSecrets};
use mps_runtime::{GatewayError, Page, PullRequest, RemoteGateway};
use mps_schemas::EntityType;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{classify_status, clip_body, retry_after, transport_error};

/// Marketplace posting API.
///
/// List: `POST {base}/v3/posting/{fbs|fbo}/list` with a `since/to` filter and
/// an opaque `last_id` cursor. Single posting: `POST {base}/v3/posting/{fbs|fbo}/get`.
/// Every request carries `Client-Id`, `Api-Key` and `X-Tenant`.
#[derive(Clone)]
pub struct PlatformGateway {
    http: reqwest::Client,
    base_url: String,
    client_id: String,
    api_key: String,
    timeout: Duration,
}

impl std::fmt::Debug for PlatformGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlatformGateway")
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl PlatformGateway {
    pub fn new(base_url: String, client_id: String, api_key: String, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("platform http client build failed")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            client_id,
            api_key,
            timeout,
        })
    }

    pub fn from_config(cfg: &AppConfig, secrets: &ResolvedSecrets) -> Result<Self> {
        Self::new(
            cfg.platform.base_url.clone(),
            secrets.platform_client_id.clone().unwrap_or_default(),
            secrets.require_platform_api_key()?.to_string(),
            Duration::from_secs(cfg.platform.timeout_secs.max(1)),
        )
    }

    fn url(&self, entity_type: EntityType, op: &str) -> String {
        let scheme = match entity_type {
            EntityType::PostingFbs => "fbs",
            EntityType::PostingFbo => "fbo",
        };
        format!("{}/v3/posting/{}/{}", self.base_url, scheme, op)
    }

    async fn post<B: Serialize + ?Sized>(
        &self,
        url: String,
        tenant: &str,
        body: &B,
    ) -> Result<reqwest::Response, GatewayError> {
        self.http
            .post(url)
            .header("Client-Id", &self.client_id)
            .header("Api-Key", &self.api_key)
            .header("X-Tenant", tenant)
            .json(body)
            .send()
            .await
            .map_err(|e| transport_error(e, self.timeout))
    }

    async fn error_from(&self, resp: reqwest::Response) -> GatewayError {
        let status = resp.status();
        let after = retry_after(resp.headers());
        let body = resp.text().await.unwrap_or_default();
        classify_status(status, clip_body(&body), after)
    }
}

// ---------------------------------------------------------------------------
// Wire shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ListBody<'a> {
    filter: ListFilter,
    limit: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_id: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct ListFilter {
    since: String,
    to: String,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    result: ListResult,
}

#[derive(Debug, Deserialize)]
struct ListResult {
    #[serde(default)]
    postings: Vec<Value>,
    #[serde(default)]
    has_next: bool,
    #[serde(default)]
    last_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct GetBody<'a> {
    posting_number: &'a str,
}

#[derive(Debug, Deserialize)]
struct GetResponse {
    result: Option<Value>,
}

fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[async_trait]
impl RemoteGateway for PlatformGateway {
    async fn pull(&self, req: &PullRequest) -> Result<Page, GatewayError> {
        let body = ListBody {
            filter: ListFilter {
                since: ts(req.since),
                to: ts(req.to),
            },
            limit: req.page_size,
            last_id: req.cursor.as_deref(),
        };
        let resp = self
            .post(self.url(req.entity_type, "list"), &req.tenant, &body)
            .await?;
        if !resp.status().is_success() {
            return Err(self.error_from(resp).await);
        }
        let parsed: ListResponse = resp
            .json()
            .await
            .map_err(|e| GatewayError::Decode(e.to_string()))?;

        let next_cursor = parsed.result.last_id.filter(|s| !s.is_empty());
        tracing::debug!(
            tenant = %req.tenant,
            entity_type = %req.entity_type,
            records = parsed.result.postings.len(),
            has_next = parsed.result.has_next,
            "platform page fetched"
        );
        Ok(Page {
            records: parsed.result.postings,
            next_cursor,
            has_more: parsed.result.has_next,
        })
    }

    async fn fetch_posting(
        &self,
        tenant: &str,
        entity_type: EntityType,
        posting_number: &str,
    ) -> Result<Option<Value>, GatewayError> {
        let resp = self
            .post(self.url(entity_type, "get"), tenant, &GetBody { posting_number })
            .await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(self.error_from(resp).await);
        }
        let parsed: GetResponse = resp
            .json()
            .await
            .map_err(|e| GatewayError::Decode(e.to_string()))?;
        Ok(parsed.result.filter(|v| !v.is_null()))
    }
}
