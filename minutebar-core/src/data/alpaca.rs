//! Alpaca market-data feed.
//!
//! Fetches one-minute stock bars from the v2 bars endpoint, following
//! `next_page_token` until the feed is exhausted or the row cap is reached.
//! There is no retry loop here: a failed fetch fails the poll cycle and the
//! next scheduled cycle is the retry. HTTP 429 trips the circuit breaker for
//! the feed's `Retry-After` so the following cycles fail fast.

use super::circuit_breaker::CircuitBreaker;
use super::provider::{BarFeed, BarRequest, DataError};
use super::response::BarResponse;
use chrono::SecondsFormat;
use reqwest::StatusCode;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://data.alpaca.markets";

/// Largest page the bars endpoint serves.
const MAX_PAGE_LIMIT: usize = 10_000;

/// API key pair for the data endpoint.
#[derive(Clone)]
pub struct AlpacaCredentials {
    pub key_id: String,
    pub secret_key: String,
}

impl std::fmt::Debug for AlpacaCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlpacaCredentials")
            .field("key_id", &self.key_id)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

/// Alpaca bar feed over a blocking HTTP client.
pub struct AlpacaFeed {
    client: reqwest::blocking::Client,
    base_url: String,
    credentials: AlpacaCredentials,
    circuit_breaker: Arc<CircuitBreaker>,
}

impl AlpacaFeed {
    pub fn new(
        credentials: AlpacaCredentials,
        base_url: impl Into<String>,
        circuit_breaker: Arc<CircuitBreaker>,
    ) -> Result<Self, DataError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("minutebar/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| DataError::Client(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials,
            circuit_breaker,
        })
    }

    fn bars_url(&self) -> String {
        format!("{}/v2/stocks/bars", self.base_url)
    }

    /// Fetch one page and decode it as JSON.
    fn fetch_page(
        &self,
        request: &BarRequest,
        page_token: Option<&str>,
        remaining: usize,
    ) -> Result<Value, DataError> {
        let params = query_params(request, page_token, remaining);

        let resp = self
            .client
            .get(self.bars_url())
            .header("APCA-API-KEY-ID", &self.credentials.key_id)
            .header("APCA-API-SECRET-KEY", &self.credentials.secret_key)
            .query(&params)
            .send()
            .map_err(|e| DataError::NetworkUnreachable(e.to_string()))?;

        let status = resp.status();

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(DataError::AuthenticationRequired(format!(
                "feed rejected credentials (HTTP {})",
                status.as_u16()
            )));
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok());
            self.circuit_breaker
                .trip(retry_after.map(Duration::from_secs));
            return Err(DataError::RateLimited {
                retry_after_secs: self.circuit_breaker.remaining_cooldown().as_secs(),
            });
        }

        if !status.is_success() {
            let body = resp.text().unwrap_or_default();
            return Err(DataError::Http {
                status: status.as_u16(),
                body: body.chars().take(200).collect(),
            });
        }

        resp.json::<Value>()
            .map_err(|e| DataError::ResponseFormatChanged(format!("undecodable bars page: {e}")))
    }
}

impl BarFeed for AlpacaFeed {
    fn name(&self) -> &str {
        "alpaca"
    }

    fn fetch_bars(&self, request: &BarRequest) -> Result<Vec<BarResponse>, DataError> {
        if !self.circuit_breaker.is_allowed() {
            return Err(DataError::CircuitBreakerTripped);
        }

        let mut pages = Vec::new();
        let mut rows = 0;
        let mut page_token: Option<String> = None;

        loop {
            let remaining = request.limit.saturating_sub(rows).max(1);
            let body = self.fetch_page(request, page_token.as_deref(), remaining)?;
            let next = next_page_token(&body);

            let page = BarResponse::from_json(body)?;
            rows += page.row_count();
            pages.push(page);

            match next {
                Some(token) if rows < request.limit => page_token = Some(token),
                Some(_) => {
                    tracing::warn!(
                        rows,
                        limit = request.limit,
                        "row cap reached with pages remaining; bars truncated"
                    );
                    break;
                }
                None => break,
            }
        }

        self.circuit_breaker.record_success();
        Ok(pages)
    }

    fn is_available(&self) -> bool {
        self.circuit_breaker.is_allowed()
    }
}

/// Query string for one bars page.
fn query_params(
    request: &BarRequest,
    page_token: Option<&str>,
    remaining: usize,
) -> Vec<(&'static str, String)> {
    let mut params = vec![
        ("symbols", request.symbols.join(",")),
        ("timeframe", "1Min".to_string()),
        (
            "start",
            request.start.to_rfc3339_opts(SecondsFormat::Secs, true),
        ),
        ("end", request.end.to_rfc3339_opts(SecondsFormat::Secs, true)),
        ("feed", request.feed.as_str().to_string()),
        ("limit", remaining.min(MAX_PAGE_LIMIT).to_string()),
    ];
    if let Some(token) = page_token {
        params.push(("page_token", token.to_string()));
    }
    params
}

fn next_page_token(body: &Value) -> Option<String> {
    body.get("next_page_token")
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::provider::FeedTier;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn request() -> BarRequest {
        BarRequest {
            symbols: vec!["AAPL".into(), "MSFT".into()],
            start: Utc.with_ymd_and_hms(2024, 3, 5, 14, 30, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2024, 3, 5, 21, 0, 0).unwrap(),
            feed: FeedTier::Iex,
            limit: 25_000,
        }
    }

    fn param<'a>(params: &'a [(&'static str, String)], key: &str) -> Option<&'a str> {
        params
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn query_params_cover_request() {
        let params = query_params(&request(), None, 25_000);
        assert_eq!(param(&params, "symbols"), Some("AAPL,MSFT"));
        assert_eq!(param(&params, "timeframe"), Some("1Min"));
        assert_eq!(param(&params, "start"), Some("2024-03-05T14:30:00Z"));
        assert_eq!(param(&params, "end"), Some("2024-03-05T21:00:00Z"));
        assert_eq!(param(&params, "feed"), Some("iex"));
        assert_eq!(param(&params, "limit"), Some("10000"));
        assert_eq!(param(&params, "page_token"), None);
    }

    #[test]
    fn query_params_carry_page_token_and_remaining_cap() {
        let params = query_params(&request(), Some("abc"), 1_500);
        assert_eq!(param(&params, "page_token"), Some("abc"));
        assert_eq!(param(&params, "limit"), Some("1500"));
    }

    #[test]
    fn next_page_token_ignores_null_and_empty() {
        assert_eq!(next_page_token(&json!({"next_page_token": null})), None);
        assert_eq!(next_page_token(&json!({"next_page_token": ""})), None);
        assert_eq!(
            next_page_token(&json!({"next_page_token": "QUFQTHwy"})),
            Some("QUFQTHwy".to_string())
        );
    }

    #[test]
    fn tripped_breaker_fails_fast() {
        let breaker = Arc::new(CircuitBreaker::default_provider());
        breaker.trip(None);
        let feed = AlpacaFeed::new(
            AlpacaCredentials {
                key_id: "key".into(),
                secret_key: "secret".into(),
            },
            "http://127.0.0.1:9",
            breaker,
        )
        .unwrap();

        assert!(!feed.is_available());
        assert!(matches!(
            feed.fetch_bars(&request()),
            Err(DataError::CircuitBreakerTripped)
        ));
    }

    #[test]
    fn credentials_debug_redacts_secret() {
        let creds = AlpacaCredentials {
            key_id: "PK123".into(),
            secret_key: "shh".into(),
        };
        let shown = format!("{creds:?}");
        assert!(shown.contains("PK123"));
        assert!(!shown.contains("shh"));
    }
}
