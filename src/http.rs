//! HTTP client for the hosted backend (PostgREST-style API).
//!
//! Provides both sides the background callback talks to:
//! - [`LocationSink`]: history insert + current-position RPC
//! - [`DriverLookup`]: session user and driver record
//!
//! The current-position write goes through a server function so the row's
//! `last_update` is stamped with the database clock, never the phone's:
//!
//! ```sql
//! create function upsert_driver_current_location(
//!   p_driver_id text, p_latitude float8, p_longitude float8, p_accuracy float8,
//!   p_speed float8, p_heading float8, p_timestamp timestamptz
//! ) returns void language sql as $$
//!   insert into driver_current_locations as c
//!     (driver_id, latitude, longitude, accuracy, speed, heading, timestamp, last_update)
//!   values (p_driver_id, p_latitude, p_longitude, p_accuracy, p_speed, p_heading, p_timestamp, now())
//!   on conflict (driver_id) do update set
//!     latitude = excluded.latitude, longitude = excluded.longitude,
//!     accuracy = excluded.accuracy, speed = excluded.speed, heading = excluded.heading,
//!     timestamp = excluded.timestamp, last_update = now();
//! $$;
//! ```
//!
//! Trait methods are synchronous and `block_on` an internal runtime; they
//! must not be called from inside another tokio runtime.

use std::sync::RwLock;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::elapsed_ms;
use crate::error::{Result, TrackingError};
use crate::identity::DriverLookup;
use crate::pipeline::LocationSink;
use crate::types::LocationRecord;

const MAX_BACKOFF_MS: u64 = 4_000;

/// Backend connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteStoreConfig {
    /// Project URL, e.g. `https://abc.supabase.co`
    pub base_url: String,
    /// Public (anon) API key
    pub api_key: String,
    pub history_table: String,
    pub projection_function: String,
    pub drivers_table: String,
    pub request_timeout_ms: u64,
    pub max_retries: u32,
}

impl Default for RemoteStoreConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: String::new(),
            history_table: "driver_locations".to_string(),
            projection_function: "upsert_driver_current_location".to_string(),
            drivers_table: "drivers".to_string(),
            request_timeout_ms: 10_000,
            max_retries: 3,
        }
    }
}

impl RemoteStoreConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.base_url.starts_with("https://") || self.base_url.starts_with("http://")) {
            return Err(TrackingError::Config {
                message: format!("base_url must be an http(s) URL, got {:?}", self.base_url),
            });
        }
        if self.api_key.trim().is_empty() {
            return Err(TrackingError::Config {
                message: "api_key must not be empty".to_string(),
            });
        }
        Ok(())
    }

    fn base(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }

    pub fn history_url(&self) -> String {
        format!("{}/rest/v1/{}", self.base(), self.history_table)
    }

    pub fn projection_url(&self) -> String {
        format!("{}/rest/v1/rpc/{}", self.base(), self.projection_function)
    }

    pub fn drivers_url(&self) -> String {
        format!("{}/rest/v1/{}", self.base(), self.drivers_table)
    }

    pub fn user_url(&self) -> String {
        format!("{}/auth/v1/user", self.base())
    }
}

/// Body for the current-position RPC. `last_update` is left to the server.
pub fn projection_payload(record: &LocationRecord) -> Value {
    json!({
        "p_driver_id": record.driver_id,
        "p_latitude": record.latitude,
        "p_longitude": record.longitude,
        "p_accuracy": record.accuracy,
        "p_speed": record.speed,
        "p_heading": record.heading,
        "p_timestamp": record.timestamp,
    })
}

fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Exponential backoff: 500ms, 1s, 2s, 4s max.
fn backoff_for(attempt: u32) -> Duration {
    Duration::from_millis((500u64 << attempt.min(3)).min(MAX_BACKOFF_MS))
}

#[derive(Debug, Deserialize)]
struct UserResponse {
    id: String,
}

pub struct RemoteStore {
    client: Client,
    runtime: tokio::runtime::Runtime,
    config: RemoteStoreConfig,
    access_token: RwLock<Option<String>>,
}

impl RemoteStore {
    pub fn new(config: RemoteStoreConfig) -> Result<Self> {
        config.validate()?;

        let client = Client::builder()
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(60))
            .tcp_keepalive(Duration::from_secs(30))
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| TrackingError::Config {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("tracking-http")
            .enable_all()
            .build()
            .map_err(|e| TrackingError::internal(format!("Failed to create runtime: {}", e)))?;

        info!("[RemoteStore] Created for {}", config.base());
        Ok(Self {
            client,
            runtime,
            config,
            access_token: RwLock::new(None),
        })
    }

    /// Set (or clear, on sign-out) the user's session token.
    pub fn set_access_token(&self, token: Option<String>) {
        let mut guard = self
            .access_token
            .write()
            .unwrap_or_else(|e| e.into_inner());
        *guard = token.filter(|t| !t.trim().is_empty());
    }

    fn access_token(&self) -> Option<String> {
        self.access_token
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Bearer is the session token when signed in, else the anon key.
    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        let bearer = self
            .access_token()
            .unwrap_or_else(|| self.config.api_key.clone());
        request
            .header("apikey", &self.config.api_key)
            .bearer_auth(bearer)
    }

    /// Send with retry on 429/5xx and transport errors. Non-retryable
    /// statuses are returned to the caller as-is.
    async fn send_with_retry<F>(&self, label: &str, build: F) -> Result<Response>
    where
        F: Fn() -> RequestBuilder,
    {
        let start = Instant::now();
        let mut attempt = 0u32;
        loop {
            let outcome = self.authorize(build()).send().await;
            let retry_reason = match outcome {
                Ok(response) if !is_retryable(response.status()) => {
                    debug!(
                        "[RemoteStore] {} -> {} ({} ms)",
                        label,
                        response.status(),
                        elapsed_ms(start)
                    );
                    return Ok(response);
                }
                Ok(response) => {
                    let status = response.status();
                    if attempt >= self.config.max_retries {
                        return Err(TrackingError::Sink {
                            message: format!("{} failed after {} retries", label, attempt),
                            status_code: Some(status.as_u16()),
                        });
                    }
                    format!("status {}", status)
                }
                Err(e) => {
                    if attempt >= self.config.max_retries {
                        return Err(e.into());
                    }
                    e.to_string()
                }
            };

            let backoff = backoff_for(attempt);
            warn!(
                "[RemoteStore] {} attempt {} failed ({}), retrying in {:?}",
                label,
                attempt + 1,
                retry_reason,
                backoff
            );
            tokio::time::sleep(backoff).await;
            attempt += 1;
        }
    }

    async fn expect_success(label: &str, response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(TrackingError::Sink {
            message: format!("{}: {}", label, body.trim()),
            status_code: Some(status.as_u16()),
        })
    }

    async fn insert_history(&self, record: &LocationRecord) -> Result<()> {
        let url = self.config.history_url();
        let response = self
            .send_with_retry("history insert", || {
                self.client
                    .post(&url)
                    .header("Prefer", "return=minimal")
                    .json(record)
            })
            .await?;
        Self::expect_success("history insert", response).await?;
        Ok(())
    }

    async fn upsert_projection(&self, record: &LocationRecord) -> Result<()> {
        let url = self.config.projection_url();
        let payload = projection_payload(record);
        let response = self
            .send_with_retry("current position upsert", || {
                self.client.post(&url).json(&payload)
            })
            .await?;
        Self::expect_success("current position upsert", response).await?;
        Ok(())
    }

    async fn fetch_session_user(&self) -> Result<Option<String>> {
        if self.access_token().is_none() {
            return Ok(None);
        }
        let url = self.config.user_url();
        let response = self
            .send_with_retry("session user", || self.client.get(&url))
            .await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            info!("[RemoteStore] Session token rejected, treating as signed out");
            return Ok(None);
        }
        let response = Self::expect_success("session user", response).await?;
        let user: UserResponse = response.json().await?;
        Ok(Some(user.id))
    }

    async fn fetch_driver_id(&self, user_id: &str) -> Result<Option<String>> {
        let url = self.config.drivers_url();
        let filter = format!("eq.{}", user_id);
        let response = self
            .send_with_retry("driver lookup", || {
                self.client
                    .get(&url)
                    .query(&[("user_id", filter.as_str()), ("select", "id")])
            })
            .await?;
        let response = Self::expect_success("driver lookup", response).await?;
        let rows: Vec<Value> = response.json().await?;
        Ok(rows.first().and_then(|row| match row.get("id") {
            Some(Value::String(id)) => Some(id.clone()),
            Some(Value::Number(id)) => Some(id.to_string()),
            _ => None,
        }))
    }
}

impl LocationSink for RemoteStore {
    fn append_history(&self, record: &LocationRecord) -> Result<()> {
        self.runtime.block_on(self.insert_history(record))
    }

    fn upsert_current(&self, record: &LocationRecord) -> Result<()> {
        self.runtime.block_on(self.upsert_projection(record))
    }
}

impl DriverLookup for RemoteStore {
    fn session_user_id(&self) -> Result<Option<String>> {
        self.runtime
            .block_on(self.fetch_session_user())
            .map_err(|e| TrackingError::Identity {
                message: e.to_string(),
            })
    }

    fn driver_id_for_user(&self, user_id: &str) -> Result<Option<String>> {
        self.runtime
            .block_on(self.fetch_driver_id(user_id))
            .map_err(|e| TrackingError::Identity {
                message: e.to_string(),
            })
    }
}
