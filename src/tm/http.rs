//! HTTP implementation of the TM collaborator.
//!
//! GET-only client with three behaviors layered on top of `reqwest`:
//! bounded retry with exponential backoff on 5xx and transport errors, a
//! circuit breaker that rejects calls after repeated failures, and auth
//! via a forwarded user token or a cached M2M token.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine;
use rand::Rng;
use serde_json::Value;

use super::{translate_transaction, TmApi, TmError, TmOverview};
use crate::config::TmSettings;
use crate::state::Transaction;

/// Retry attempts per call.
const MAX_ATTEMPTS: u32 = 3;

/// Initial backoff between attempts, in milliseconds.
const INITIAL_BACKOFF_MS: u64 = 150;

/// Safety margin subtracted from `expires_in` when caching M2M tokens.
const TOKEN_EXPIRY_MARGIN_SECS: u64 = 60;

// ── Circuit breaker ─────────────────────────────────────────────

#[derive(Debug, Default)]
struct BreakerState {
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

/// Gate that rejects calls after `threshold` consecutive failures until
/// `cooldown` elapses.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Create a breaker with the given threshold and cooldown.
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold,
            cooldown,
            state: Mutex::new(BreakerState::default()),
        }
    }

    /// Whether a call may proceed right now.
    pub fn allow(&self) -> bool {
        self.allow_at(Instant::now())
    }

    fn allow_at(&self, now: Instant) -> bool {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match state.open_until {
            Some(until) if now < until => false,
            Some(_) => {
                // Cooldown elapsed: half-open, allow a probe.
                state.open_until = None;
                true
            }
            None => true,
        }
    }

    /// Record a successful call, closing the breaker.
    pub fn record_success(&self) {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.consecutive_failures = 0;
        state.open_until = None;
    }

    /// Record a failed call, opening the breaker at the threshold.
    pub fn record_failure(&self) {
        self.record_failure_at(Instant::now());
    }

    fn record_failure_at(&self, now: Instant) {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        if state.consecutive_failures >= self.threshold {
            state.open_until = now.checked_add(self.cooldown);
        }
    }
}

// ── M2M token cache ─────────────────────────────────────────────

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

/// Cached client-credentials token, refreshed `TOKEN_EXPIRY_MARGIN_SECS`
/// before expiry. The lock prevents concurrent refresh stampedes.
#[derive(Debug, Default)]
struct TokenCache {
    inner: tokio::sync::Mutex<Option<CachedToken>>,
}

// ── Client ──────────────────────────────────────────────────────

/// HTTP client for the TM service.
///
/// Cheap to clone: breaker and token cache are shared, so a per-request
/// scoped clone (forwarded user token, trace id) keeps global breaker
/// state.
pub struct HttpTmClient {
    settings: TmSettings,
    client: reqwest::Client,
    breaker: Arc<CircuitBreaker>,
    token_cache: Arc<TokenCache>,
    user_token: Option<String>,
    trace_id: Option<String>,
}

impl std::fmt::Debug for HttpTmClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTmClient")
            .field("base_url", &self.settings.base_url)
            .finish_non_exhaustive()
    }
}

impl HttpTmClient {
    /// Create a TM client from settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(settings: TmSettings) -> Result<Self, TmError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_seconds))
            .build()?;
        let breaker = Arc::new(CircuitBreaker::new(
            settings.circuit_breaker_threshold,
            Duration::from_secs(settings.circuit_breaker_cooldown_seconds),
        ));
        Ok(Self {
            settings,
            client,
            breaker,
            token_cache: Arc::new(TokenCache::default()),
            user_token: None,
            trace_id: None,
        })
    }

    /// Derive a per-investigation client carrying the forwarded user token
    /// and trace context. Breaker and token cache remain shared.
    pub fn scoped(&self, user_token: Option<String>, trace_id: Option<String>) -> Self {
        Self {
            settings: self.settings.clone(),
            client: self.client.clone(),
            breaker: Arc::clone(&self.breaker),
            token_cache: Arc::clone(&self.token_cache),
            user_token,
            trace_id,
        }
    }

    async fn bearer_token(&self) -> Result<String, TmError> {
        if let Some(token) = &self.user_token {
            return Ok(token.clone());
        }
        self.m2m_token().await
    }

    async fn m2m_token(&self) -> Result<String, TmError> {
        let mut cached = self.token_cache.inner.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.expires_at {
                return Ok(token.access_token.clone());
            }
        }

        let url = format!(
            "{}/oauth/token",
            self.settings.base_url.trim_end_matches('/')
        );
        let basic = base64::engine::general_purpose::STANDARD.encode(format!(
            "{}:{}",
            self.settings.m2m_client_id, self.settings.m2m_client_secret
        ));
        let response = self
            .client
            .post(&url)
            .header("authorization", format!("Basic {basic}"))
            .form(&[
                ("grant_type", "client_credentials"),
                ("audience", self.settings.m2m_audience.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(TmError::Auth(format!("token endpoint returned {status}")));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| TmError::Auth(e.to_string()))?;
        let access_token = body["access_token"]
            .as_str()
            .ok_or_else(|| TmError::Auth("missing access_token".to_owned()))?
            .to_owned();
        let expires_in = body["expires_in"].as_u64().unwrap_or(300);
        let ttl = expires_in.saturating_sub(TOKEN_EXPIRY_MARGIN_SECS);
        let expires_at = Instant::now()
            .checked_add(Duration::from_secs(ttl))
            .unwrap_or_else(Instant::now);

        *cached = Some(CachedToken {
            access_token: access_token.clone(),
            expires_at,
        });
        Ok(access_token)
    }

    /// GET a JSON document with retry and breaker accounting.
    async fn get_json(&self, path: &str, query: &[(&str, String)]) -> Result<Value, TmError> {
        if !self.breaker.allow() {
            return Err(TmError::CircuitOpen);
        }

        let result = self.get_json_with_retry(path, query).await;
        match &result {
            Ok(_) => self.breaker.record_success(),
            Err(TmError::HttpStatus { status, .. }) if *status < 500 => {
                // 4xx is a caller problem, not a TM outage.
            }
            Err(_) => self.breaker.record_failure(),
        }
        result
    }

    async fn get_json_with_retry(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Value, TmError> {
        let mut backoff_ms = INITIAL_BACKOFF_MS;
        let mut last_error = TmError::Auth("no attempt made".to_owned());

        for attempt in 1..=MAX_ATTEMPTS {
            match self.get_json_once(path, query).await {
                Ok(value) => return Ok(value),
                Err(e) if is_retryable(&e) && attempt < MAX_ATTEMPTS => {
                    tracing::warn!(attempt, path, error = %e, "tm call failed, retrying");
                    let jitter: u64 = rand::thread_rng().gen_range(0..75);
                    tokio::time::sleep(Duration::from_millis(backoff_ms.saturating_add(jitter)))
                        .await;
                    backoff_ms = backoff_ms.saturating_mul(2);
                    last_error = e;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error)
    }

    async fn get_json_once(&self, path: &str, query: &[(&str, String)]) -> Result<Value, TmError> {
        let url = format!("{}{}", self.settings.base_url.trim_end_matches('/'), path);
        let token = self.bearer_token().await?;

        let mut request = self.client.get(&url).bearer_auth(token).query(query);
        if let Some(trace_id) = &self.trace_id {
            request = request.header("x-trace-id", trace_id);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(TmError::HttpStatus {
                status: status.as_u16(),
                body: crate::redaction::truncate_on_boundary(&text, 500).to_owned(),
            });
        }
        serde_json::from_str(&text).map_err(|e| TmError::Translation(e.to_string()))
    }

    /// Fetch one history endpoint with bounded pagination.
    async fn paged_history(
        &self,
        path: &str,
        hours_back: u32,
        max_pages: u32,
    ) -> Result<Vec<Transaction>, TmError> {
        let mut transactions = Vec::new();
        let mut page: u32 = 1;

        while page <= max_pages.max(1) {
            let body = self
                .get_json(
                    path,
                    &[
                        ("hours_back", hours_back.to_string()),
                        ("page", page.to_string()),
                        ("page_size", self.settings.history_page_size.to_string()),
                    ],
                )
                .await?;

            let items = body["items"].as_array().cloned().unwrap_or_default();
            for item in &items {
                transactions.push(translate_transaction(item)?);
            }

            match body["next_page"].as_u64() {
                // A next_page that does not advance would spin; treat it
                // as the last page.
                Some(next) if u32::try_from(next).unwrap_or(u32::MAX) > page => {
                    page = u32::try_from(next).unwrap_or(u32::MAX);
                }
                _ => break,
            }
        }

        Ok(transactions)
    }
}

#[async_trait]
impl TmApi for HttpTmClient {
    async fn overview(
        &self,
        transaction_id: &str,
        include_rules: bool,
    ) -> Result<TmOverview, TmError> {
        let path = format!("/api/v1/transactions/{transaction_id}/overview");
        let body = self
            .get_json(&path, &[("include_rules", include_rules.to_string())])
            .await?;

        let transaction = translate_transaction(&body["transaction"])?;
        Ok(TmOverview {
            transaction,
            review: non_null(body.get("review")),
            notes: body["notes"].as_array().cloned().unwrap_or_default(),
            case: non_null(body.get("case")),
            matched_rules: body["matched_rules"].as_array().cloned().unwrap_or_default(),
        })
    }

    async fn card_history(
        &self,
        card_id: &str,
        hours_back: u32,
        max_pages: u32,
    ) -> Result<Vec<Transaction>, TmError> {
        let path = format!("/api/v1/cards/{card_id}/transactions");
        self.paged_history(&path, hours_back, max_pages).await
    }

    async fn merchant_history(
        &self,
        merchant_id: &str,
        hours_back: u32,
        max_pages: u32,
    ) -> Result<Vec<Transaction>, TmError> {
        let path = format!("/api/v1/merchants/{merchant_id}/transactions");
        self.paged_history(&path, hours_back, max_pages).await
    }

    async fn health(&self) -> bool {
        let url = format!("{}/health", self.settings.base_url.trim_end_matches('/'));
        match self.client.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}

/// Whether an error is worth another attempt.
fn is_retryable(error: &TmError) -> bool {
    match error {
        TmError::Request(_) => true,
        TmError::HttpStatus { status, .. } => *status >= 500,
        _ => false,
    }
}

fn non_null(value: Option<&Value>) -> Option<Value> {
    match value {
        Some(Value::Null) | None => None,
        Some(v) => Some(v.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_breaker_opens_after_threshold() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        assert!(breaker.allow());
        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.allow());
        breaker.record_failure();
        assert!(!breaker.allow());
    }

    #[test]
    fn test_breaker_success_resets_count() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.allow());
    }

    #[test]
    fn test_breaker_half_opens_after_cooldown() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(10));
        let now = Instant::now();
        breaker.record_failure_at(now);
        assert!(!breaker.allow_at(now.checked_add(Duration::from_millis(5)).expect("time")));
        assert!(breaker.allow_at(now.checked_add(Duration::from_millis(20)).expect("time")));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(is_retryable(&TmError::HttpStatus {
            status: 502,
            body: String::new()
        }));
        assert!(!is_retryable(&TmError::HttpStatus {
            status: 404,
            body: String::new()
        }));
        assert!(!is_retryable(&TmError::CircuitOpen));
        assert!(!is_retryable(&TmError::Translation("x".to_owned())));
    }

    #[test]
    fn test_scoped_client_shares_breaker() {
        let client = HttpTmClient::new(TmSettings::default()).expect("client");
        let scoped = client.scoped(Some("user-token".to_owned()), Some("trace-1".to_owned()));
        client.breaker.record_failure();
        client.breaker.record_failure();
        client.breaker.record_failure();
        assert!(!scoped.breaker.allow());
    }

    #[test]
    fn test_non_null_filters_json_null() {
        assert!(non_null(Some(&Value::Null)).is_none());
        assert!(non_null(None).is_none());
        assert!(non_null(Some(&serde_json::json!({"a": 1}))).is_some());
    }
}
