use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, CONTENT_TYPE, ETAG, IF_MATCH, USER_AGENT};
use reqwest::Method;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};
use url::Url;

use aggsync_core::config::{Config, DEFAULT_TIMEOUT_SECS, DEFAULT_USER_AGENT};
use aggsync_core::{Rule, Segment, SegmentId, SegmentedRuleSet, VersionToken};

use crate::error::StoreError;
use crate::retry::RetryPolicy;
use crate::store::RemoteRuleStore;

const SEGMENTED_RULES_ENDPOINT: &[&str] = &["aggregations", "segmented_rules"];
const RULES_ENDPOINT: &[&str] = &["aggregations", "rules"];
const SEGMENTS_ENDPOINT: &[&str] = &["aggregations", "rules", "segments"];
const RULE_ENDPOINT: &[&str] = &["aggregations", "rule"];

/// Status line, headers and body of a successful response.
struct RawResponse {
    headers: HeaderMap,
    body: Vec<u8>,
}

/// [`RemoteRuleStore`] backed by the aggregation rules REST API.
pub struct HttpRuleStore {
    client: reqwest::Client,
    base_url: Url,
    api_key: Option<String>,
    headers: BTreeMap<String, String>,
    user_agent: String,
    retry: RetryPolicy,
    timeout: Duration,
    debug: bool,
}

impl HttpRuleStore {
    pub fn new(base_url: &str) -> Result<Self, StoreError> {
        let base_url = Url::parse(base_url).map_err(|e| StoreError::InvalidUrl(format!("{base_url}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(StoreError::InvalidUrl(base_url.to_string()));
        }
        Ok(Self {
            client: reqwest::Client::new(),
            base_url,
            api_key: None,
            headers: BTreeMap::new(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            retry: RetryPolicy::default(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS as u64),
            debug: false,
        })
    }

    /// Build a store from loaded config. Fails if no API URL is configured.
    pub fn from_config(config: &Config) -> Result<Self, StoreError> {
        let url = config
            .api
            .url
            .as_deref()
            .ok_or_else(|| StoreError::InvalidUrl("AGGSYNC_API_URL not set".into()))?;
        let mut store = Self::new(url)?
            .with_retry_policy(RetryPolicy::from_config(&config.retry))
            .with_user_agent(config.api.user_agent.clone())
            .with_timeout(config.api.timeout)
            .with_debug(config.api.debug);
        if let Some(key) = &config.api.api_key {
            store = store.with_api_key(key.clone());
        }
        for (name, value) in &config.api.http_headers {
            store = store.with_header(name.clone(), value.clone());
        }
        Ok(store)
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Bound on each attempt, headers and body included.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Join path segments onto the base URL, keeping any base path, and add
    /// the `segment` query parameter for non-default segments.
    fn endpoint(&self, parts: &[&str], segment: Option<&SegmentId>) -> Result<Url, StoreError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| StoreError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(parts);
        if let Some(id) = segment.and_then(SegmentId::as_query) {
            url.query_pairs_mut().append_pair("segment", id);
        }
        Ok(url)
    }

    fn rule_endpoint(&self, metric: &str, segment: &SegmentId) -> Result<Url, StoreError> {
        let mut parts = RULE_ENDPOINT.to_vec();
        parts.push(metric);
        self.endpoint(&parts, Some(segment))
    }

    /// Send one logical request, retrying transport failures and retryable
    /// statuses according to the retry policy.
    async fn request(
        &self,
        method: Method,
        url: &Url,
        if_match: Option<&VersionToken>,
        body: Option<Vec<u8>>,
    ) -> Result<RawResponse, StoreError> {
        let mut attempt = 0;
        loop {
            let mut req = self
                .client
                .request(method.clone(), url.clone())
                .timeout(self.timeout)
                .header(USER_AGENT, &self.user_agent)
                .header(CONTENT_TYPE, "application/json");
            if let Some(key) = &self.api_key {
                req = req.bearer_auth(key);
            }
            for (name, value) in &self.headers {
                req = req.header(name.as_str(), value.as_str());
            }
            if let Some(token) = if_match {
                req = req.header(IF_MATCH, token.as_str());
            }
            if let Some(body) = &body {
                req = req.body(body.clone());
            }

            if self.debug {
                match &body {
                    Some(b) => debug!(%method, %url, body = %String::from_utf8_lossy(b), "request"),
                    None => debug!(%method, %url, "request with no body data"),
                }
            }

            let (status, headers, body_bytes) = match Self::exchange(req).await {
                Ok(exchanged) => exchanged,
                Err(e) if attempt < self.retry.max_retries() => {
                    let wait = self.retry.delay(attempt);
                    warn!(%method, %url, error = %e, attempt, ?wait, "request failed, retrying");
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                    continue;
                }
                Err(e) => return Err(StoreError::Http(e)),
            };

            if self.debug {
                debug!(%method, %url, status, body = %String::from_utf8_lossy(&body_bytes), "response");
            }

            if status >= 400 && attempt < self.retry.max_retries() && self.retry.should_retry_status(status) {
                let wait = self.retry.delay(attempt);
                warn!(%method, %url, status, attempt, ?wait, "retryable status, retrying");
                tokio::time::sleep(wait).await;
                attempt += 1;
                continue;
            }

            if status < 400 {
                return Ok(RawResponse {
                    headers,
                    body: body_bytes,
                });
            }
            let body = String::from_utf8_lossy(&body_bytes).into_owned();
            return Err(match status {
                404 => StoreError::NotFound { body },
                409 | 412 => StoreError::Conflict { status, body },
                _ => StoreError::Api { status, body },
            });
        }
    }

    /// Send the request and read the whole body. A failure at either step is
    /// a transport failure.
    async fn exchange(req: reqwest::RequestBuilder) -> Result<(u16, HeaderMap, Vec<u8>), reqwest::Error> {
        let resp = req.send().await?;
        let status = resp.status().as_u16();
        let headers = resp.headers().clone();
        let body = resp.bytes().await?;
        Ok((status, headers, body.to_vec()))
    }

    fn encode<T: serde::Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, StoreError> {
        serde_json::to_vec(value).map_err(|e| StoreError::Decode(format!("failed to encode request: {e}")))
    }
}

impl RawResponse {
    fn json<T: DeserializeOwned>(&self) -> Result<T, StoreError> {
        serde_json::from_slice(&self.body).map_err(|e| StoreError::Decode(e.to_string()))
    }

    fn etag(&self, url: &Url) -> Result<VersionToken, StoreError> {
        self.headers
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(VersionToken::new)
            .ok_or_else(|| StoreError::MissingEtag {
                endpoint: url.path().to_string(),
            })
    }
}

#[async_trait]
impl RemoteRuleStore for HttpRuleStore {
    async fn fetch_segmented(&self) -> Result<Vec<SegmentedRuleSet>, StoreError> {
        let url = self.endpoint(SEGMENTED_RULES_ENDPOINT, None)?;
        let sets: Option<Vec<SegmentedRuleSet>> = self.request(Method::GET, &url, None, None).await?.json()?;
        Ok(sets.unwrap_or_default())
    }

    async fn fetch_all(&self, segment: &SegmentId) -> Result<(Vec<Rule>, VersionToken), StoreError> {
        let url = self.endpoint(RULES_ENDPOINT, Some(segment))?;
        let resp = self.request(Method::GET, &url, None, None).await?;
        let rules: Option<Vec<Rule>> = resp.json()?;
        Ok((rules.unwrap_or_default(), resp.etag(&url)?))
    }

    async fn replace_all(
        &self,
        segment: &SegmentId,
        rules: &[Rule],
        token: &VersionToken,
    ) -> Result<VersionToken, StoreError> {
        let url = self.endpoint(RULES_ENDPOINT, Some(segment))?;
        // An empty slice encodes as `[]`, never `null`.
        let body = Self::encode(rules)?;
        let resp = self.request(Method::POST, &url, Some(token), Some(body)).await?;
        resp.etag(&url)
    }

    async fn create_one(
        &self,
        segment: &SegmentId,
        rule: &Rule,
        token: &VersionToken,
    ) -> Result<VersionToken, StoreError> {
        let url = self.rule_endpoint(&rule.metric, segment)?;
        let body = Self::encode(rule)?;
        let resp = self.request(Method::POST, &url, Some(token), Some(body)).await?;
        resp.etag(&url)
    }

    async fn read_one(&self, segment: &SegmentId, metric: &str) -> Result<(Rule, VersionToken), StoreError> {
        let url = self.rule_endpoint(metric, segment)?;
        let resp = self.request(Method::GET, &url, None, None).await?;
        let rule = resp.json()?;
        Ok((rule, resp.etag(&url)?))
    }

    async fn update_one(
        &self,
        segment: &SegmentId,
        rule: &Rule,
        token: &VersionToken,
    ) -> Result<VersionToken, StoreError> {
        let url = self.rule_endpoint(&rule.metric, segment)?;
        let body = Self::encode(rule)?;
        let resp = self.request(Method::PUT, &url, Some(token), Some(body)).await?;
        resp.etag(&url)
    }

    async fn delete_one(
        &self,
        segment: &SegmentId,
        metric: &str,
        token: &VersionToken,
    ) -> Result<VersionToken, StoreError> {
        let url = self.rule_endpoint(metric, segment)?;
        let resp = self.request(Method::DELETE, &url, Some(token), None).await?;
        resp.etag(&url)
    }

    async fn list_segments(&self) -> Result<Vec<Segment>, StoreError> {
        let url = self.endpoint(SEGMENTS_ENDPOINT, None)?;
        let segments: Option<Vec<Segment>> = self.request(Method::GET, &url, None, None).await?.json()?;
        Ok(segments.unwrap_or_default())
    }

    /// The API does not echo the created segment, so it is looked up by
    /// selector afterwards.
    async fn create_segment(&self, segment: &Segment) -> Result<Segment, StoreError> {
        let url = self.endpoint(SEGMENTS_ENDPOINT, None)?;
        let body = Self::encode(segment)?;
        self.request(Method::POST, &url, None, Some(body)).await?;
        self.list_segments()
            .await?
            .into_iter()
            .find(|s| s.selector == segment.selector)
            .ok_or_else(|| StoreError::NotFound {
                body: format!("segment with selector {} not listed after creation", segment.selector),
            })
    }

    async fn update_segment(&self, segment: &Segment) -> Result<(), StoreError> {
        let url = self.endpoint(SEGMENTS_ENDPOINT, None)?;
        let body = Self::encode(segment)?;
        self.request(Method::PUT, &url, None, Some(body)).await?;
        Ok(())
    }

    async fn delete_segment(&self, segment: &SegmentId) -> Result<(), StoreError> {
        let url = self.endpoint(SEGMENTS_ENDPOINT, Some(segment))?;
        self.request(Method::DELETE, &url, None, None).await?;
        Ok(())
    }
}
