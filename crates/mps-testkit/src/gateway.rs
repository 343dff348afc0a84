use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use mps_runtime::{GatewayError, Page, PullRequest, RemoteGateway};
use mps_schemas::EntityType;
use serde_json::Value;

/// Replays queued pull results in order. An exhausted script answers with an
/// empty page.
#[derive(Default)]
pub struct ScriptedGateway {
    pulls: Mutex<VecDeque<Result<Page, GatewayError>>>,
    postings: Mutex<BTreeMap<String, Value>>,
    requests: Mutex<Vec<PullRequest>>,
    fetches: Mutex<Vec<String>>,
    delay: Mutex<Option<Duration>>,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_page(&self, records: Vec<Value>, next_cursor: Option<&str>, has_more: bool) {
        self.push_result(Ok(Page {
            records,
            next_cursor: next_cursor.map(str::to_string),
            has_more,
        }));
    }

    pub fn push_error(&self, err: GatewayError) {
        self.push_result(Err(err));
    }

    pub fn push_result(&self, r: Result<Page, GatewayError>) {
        lock(&self.pulls).push_back(r);
    }

    /// Single-posting lookups answer from here; unknown numbers are `None`.
    pub fn put_posting(&self, raw: Value) {
        let number = raw
            .get("posting_number")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        lock(&self.postings).insert(number, raw);
    }

    /// Every call sleeps this long first (timeout tests).
    pub fn set_delay(&self, d: Duration) {
        *lock(&self.delay) = Some(d);
    }

    pub fn requests(&self) -> Vec<PullRequest> {
        lock(&self.requests).clone()
    }

    pub fn fetched(&self) -> Vec<String> {
        lock(&self.fetches).clone()
    }

    pub fn remaining(&self) -> usize {
        lock(&self.pulls).len()
    }

    async fn maybe_sleep(&self) {
        let d = *lock(&self.delay);
        if let Some(d) = d {
            tokio::time::sleep(d).await;
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl RemoteGateway for ScriptedGateway {
    async fn pull(&self, req: &PullRequest) -> Result<Page, GatewayError> {
        lock(&self.requests).push(req.clone());
        self.maybe_sleep().await;
        let next = lock(&self.pulls).pop_front();
        next.unwrap_or_else(|| Ok(Page::default()))
    }

    async fn fetch_posting(
        &self,
        _tenant: &str,
        _entity_type: EntityType,
        posting_number: &str,
    ) -> Result<Option<Value>, GatewayError> {
        lock(&self.fetches).push(posting_number.to_string());
        self.maybe_sleep().await;
        Ok(lock(&self.postings).get(posting_number).cloned())
    }
}
