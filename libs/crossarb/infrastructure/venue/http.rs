//! Shared REST machinery: signing hook, rate-limit quota, cooldown window.
//!
//! Every venue REST call goes through [`RestClient`]. While a cooldown is
//! active the client fails fast with [`VenueError::Cooldown`] before any
//! network I/O; WebSocket traffic is unaffected by design.

use crate::domain::venue::VenueId;
use crate::error::VenueError;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use serde_json::Value;
use sha2::Sha256;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Signs private requests. Credential handling stays outside the core; the
/// venue client only ever sees this interface.
pub trait Signer: Send + Sync {
    fn api_key(&self) -> &str;
    /// Hex signature over the request payload.
    fn sign(&self, payload: &str) -> String;
}

/// HMAC-SHA256 signer, the scheme shared by the spot venues.
pub struct HmacSha256Signer {
    api_key: String,
    secret: String,
}

impl HmacSha256Signer {
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            secret: secret.into(),
        }
    }
}

impl Signer for HmacSha256Signer {
    fn api_key(&self) -> &str {
        &self.api_key
    }

    fn sign(&self, payload: &str) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.secret.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}

/// Signer for unauthenticated/test use.
pub struct NoopSigner;

impl Signer for NoopSigner {
    fn api_key(&self) -> &str {
        ""
    }

    fn sign(&self, _payload: &str) -> String {
        String::new()
    }
}

/// How a venue reports REST quota in response headers.
#[derive(Debug, Clone, Copy)]
pub enum RateLimitHeader {
    /// Header carries the remaining allowance
    Remaining { header: &'static str, limit: u64 },
    /// Header carries the used allowance
    Used { header: &'static str, limit: u64 },
}

struct CooldownGate {
    active: bool,
    until: Instant,
}

pub struct RestClient {
    venue: VenueId,
    base_url: String,
    http: reqwest::Client,
    signer: Arc<dyn Signer>,
    rate_limit_header: Option<RateLimitHeader>,
    cooldown: Mutex<CooldownGate>,
}

impl RestClient {
    pub fn new(
        venue: VenueId,
        base_url: impl Into<String>,
        signer: Arc<dyn Signer>,
        rate_limit_header: Option<RateLimitHeader>,
    ) -> Self {
        Self {
            venue,
            base_url: base_url.into(),
            http: reqwest::Client::new(),
            signer,
            rate_limit_header,
            cooldown: Mutex::new(CooldownGate {
                active: false,
                until: Instant::now(),
            }),
        }
    }

    pub fn venue(&self) -> VenueId {
        self.venue
    }

    /// True while the cooldown window is open; expiry clears the flag.
    pub fn is_in_cooldown(&self) -> bool {
        let mut gate = self.cooldown.lock();
        if gate.active && Instant::now() >= gate.until {
            gate.active = false;
            debug!(venue = %self.venue, "cooldown expired");
        }
        gate.active
    }

    pub fn remaining_cooldown(&self) -> Duration {
        let gate = self.cooldown.lock();
        if gate.active {
            gate.until.saturating_duration_since(Instant::now())
        } else {
            Duration::ZERO
        }
    }

    pub fn start_cooldown(&self, minutes: u64) {
        let mut gate = self.cooldown.lock();
        gate.active = true;
        gate.until = Instant::now() + Duration::from_secs(minutes * 60);
        warn!(venue = %self.venue, minutes, "entering cooldown");
    }

    /// GET with query parameters; signed requests get the signature appended
    /// to the query string.
    pub async fn get_json(
        &self,
        endpoint: &str,
        params: &[(&str, String)],
        signed: bool,
    ) -> Result<Value, VenueError> {
        self.check_cooldown()?;
        let url = format!("{}{}?{}", self.base_url, endpoint, self.query(params, signed));
        let mut request = self.http.get(&url);
        if signed {
            request = request.header("X-API-KEY", self.signer.api_key());
        }
        self.execute(request, endpoint).await
    }

    /// DELETE with query parameters (order cancellation on REST venues).
    pub async fn delete_json(
        &self,
        endpoint: &str,
        params: &[(&str, String)],
        signed: bool,
    ) -> Result<Value, VenueError> {
        self.check_cooldown()?;
        let url = format!("{}{}?{}", self.base_url, endpoint, self.query(params, signed));
        let mut request = self.http.delete(&url);
        if signed {
            request = request.header("X-API-KEY", self.signer.api_key());
        }
        self.execute(request, endpoint).await
    }

    fn query(&self, params: &[(&str, String)], signed: bool) -> String {
        let mut query = params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        if signed {
            let signature = self.signer.sign(&query);
            if !query.is_empty() {
                query.push('&');
            }
            query.push_str(&format!("signature={signature}"));
        }
        query
    }

    /// POST with a form body; signed when `signed` is set. The signature is
    /// computed over the urlencoded body and appended as `signature`.
    pub async fn post_form(
        &self,
        endpoint: &str,
        form: &[(&str, String)],
        signed: bool,
    ) -> Result<Value, VenueError> {
        self.check_cooldown()?;
        let url = format!("{}{}", self.base_url, endpoint);

        let mut body = form
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        let mut request = self.http.post(&url);
        if signed {
            let signature = self.signer.sign(&body);
            if !body.is_empty() {
                body.push('&');
            }
            body.push_str(&format!("signature={signature}"));
            request = request.header("X-API-KEY", self.signer.api_key());
        }
        request = request
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(body);
        self.execute(request, endpoint).await
    }

    /// POST with an empty body (KuCoin bullet bootstrap).
    pub async fn post_empty(&self, endpoint: &str) -> Result<Value, VenueError> {
        self.check_cooldown()?;
        let url = format!("{}{}", self.base_url, endpoint);
        let request = self.http.post(&url).header("Content-Type", "application/json");
        self.execute(request, endpoint).await
    }

    fn check_cooldown(&self) -> Result<(), VenueError> {
        if self.is_in_cooldown() {
            let remaining = self.remaining_cooldown().as_secs();
            debug!(venue = %self.venue, remaining, "request skipped: cooldown");
            return Err(VenueError::Cooldown {
                venue: self.venue,
                remaining_secs: remaining,
            });
        }
        Ok(())
    }

    async fn execute(
        &self,
        request: reqwest::RequestBuilder,
        endpoint: &str,
    ) -> Result<Value, VenueError> {
        let response = request.send().await.map_err(|e| VenueError::Transport {
            venue: self.venue,
            detail: e.to_string(),
        })?;

        let status = response.status().as_u16();
        self.process_rate_limit_headers(response.headers());

        let body = response.text().await.map_err(|e| VenueError::Transport {
            venue: self.venue,
            detail: e.to_string(),
        })?;

        if status >= 400 {
            warn!(venue = %self.venue, endpoint, status, "HTTP error");
            self.apply_error_cooldown(status, &body);
            return Err(match status {
                403 | 418 | 429 => VenueError::RateLimited {
                    venue: self.venue,
                    status,
                },
                _ => VenueError::Http {
                    venue: self.venue,
                    status,
                    body,
                },
            });
        }

        serde_json::from_str(&body).map_err(|e| VenueError::Protocol {
            venue: self.venue,
            detail: format!("{endpoint}: {e}"),
        })
    }

    /// Parse the venue's documented quota header and open a cooldown when
    /// less than 10% of the allowance remains.
    fn process_rate_limit_headers(&self, headers: &reqwest::header::HeaderMap) {
        let Some(policy) = self.rate_limit_header else {
            return;
        };
        let read = |name: &str| -> Option<u64> {
            headers.get(name)?.to_str().ok()?.trim().parse().ok()
        };
        let (remaining, limit) = match policy {
            RateLimitHeader::Remaining { header, limit } => (read(header), limit),
            RateLimitHeader::Used { header, limit } => {
                (read(header).map(|used| limit.saturating_sub(used)), limit)
            }
        };
        if let Some(remaining) = remaining {
            debug!(venue = %self.venue, remaining, limit, "rate limit quota");
            if remaining < limit / 10 {
                self.start_cooldown(1);
            }
        }
    }

    fn apply_error_cooldown(&self, status: u16, body: &str) {
        self.start_cooldown(cooldown_minutes(status, body));
    }
}

/// HTTP status to cooldown minutes.
///
/// 429 honors the venue's `retryAfter` (seconds) when the body carries one,
/// with a one-minute floor.
pub fn cooldown_minutes(status: u16, body: &str) -> u64 {
    match status {
        403 => 60,
        408 => 5,
        418 => 120,
        429 => retry_after_minutes(body).unwrap_or(30),
        503 => 15,
        400..=499 => 10,
        _ => 15,
    }
}

fn retry_after_minutes(body: &str) -> Option<u64> {
    let value: Value = serde_json::from_str(body).ok()?;
    let seconds = value.get("retryAfter")?.as_u64()?;
    Some((seconds / 60).max(1))
}
