//! Server transport (§4.G, §6): the push/pull/audit-push surface the
//! Internal Sync Engine drives, plus the retry classification its
//! backoff loop needs.

use async_trait::async_trait;
use registry_core::{AuditEntry, FormSubmission};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Distinguishes retriable transport failures (network error, 5xx,
/// timeout) from definitive ones (§5 Timeouts, §4.G retry policy).
#[derive(Debug, Error, Clone)]
pub enum TransportError {
    #[error("transient transport failure: {0}")]
    Transient(String),
    #[error("transport failure: {0}")]
    Fatal(String),
}

impl TransportError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// A page pulled from the server (§6 on-wire shape).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullPage {
    pub events: Vec<FormSubmission>,
    pub next_cursor: Option<String>,
}

/// Push request body (§6).
#[derive(Debug, Clone, Serialize)]
pub struct PushRequest<'a> {
    pub events: &'a [FormSubmission],
    pub config_id: &'a str,
}

/// Pulled/pushed against one server config. Implementations talk HTTP
/// JSON per §6; a `MockTransport` backs tests (§4.H built-in adapter
/// requirement extends to the internal engine's own test tooling).
#[async_trait]
pub trait SyncTransport: Send + Sync {
    async fn push(&self, config_id: &str, token: &str, events: &[FormSubmission]) -> Result<(), TransportError>;

    async fn pull(&self, config_id: &str, token: &str, cursor: Option<&str>) -> Result<PullPage, TransportError>;

    async fn push_audit(&self, config_id: &str, token: &str, entries: &[AuditEntry]) -> Result<(), TransportError>;
}

/// HTTP JSON transport over `reqwest`. The bearer token is supplied per
/// call by the sync engine, loaded fresh from `TokenStorage` at the start
/// of each sync (§6) rather than fixed at construction.
pub struct HttpSyncTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSyncTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str, token: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        self.client.request(method, url).bearer_auth(token)
    }

    fn classify_status(status: reqwest::StatusCode) -> TransportError {
        if status.is_server_error() || status == reqwest::StatusCode::REQUEST_TIMEOUT {
            TransportError::Transient(format!("server responded {status}"))
        } else {
            TransportError::Fatal(format!("server responded {status}"))
        }
    }

    fn classify_reqwest(err: reqwest::Error) -> TransportError {
        if err.is_timeout() || err.is_connect() {
            TransportError::Transient(err.to_string())
        } else {
            TransportError::Fatal(err.to_string())
        }
    }
}

#[async_trait]
impl SyncTransport for HttpSyncTransport {
    async fn push(&self, config_id: &str, token: &str, events: &[FormSubmission]) -> Result<(), TransportError> {
        let body = PushRequest { events, config_id };
        let response = self
            .request(reqwest::Method::POST, "/sync/push", token)
            .json(&body)
            .send()
            .await
            .map_err(Self::classify_reqwest)?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::classify_status(response.status()))
        }
    }

    async fn pull(&self, config_id: &str, token: &str, cursor: Option<&str>) -> Result<PullPage, TransportError> {
        let mut req = self
            .request(reqwest::Method::GET, "/sync/pull", token)
            .query(&[("configId", config_id)]);
        if let Some(cursor) = cursor {
            req = req.query(&[("since", cursor)]);
        }
        let response = req.send().await.map_err(Self::classify_reqwest)?;
        if !response.status().is_success() {
            return Err(Self::classify_status(response.status()));
        }
        response.json::<PullPage>().await.map_err(Self::classify_reqwest)
    }

    async fn push_audit(&self, config_id: &str, token: &str, entries: &[AuditEntry]) -> Result<(), TransportError> {
        #[derive(Serialize)]
        struct Body<'a> {
            audit_logs: &'a [AuditEntry],
            config_id: &'a str,
        }
        let response = self
            .request(reqwest::Method::POST, "/sync/audit", token)
            .json(&Body {
                audit_logs: entries,
                config_id,
            })
            .send()
            .await
            .map_err(Self::classify_reqwest)?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::classify_status(response.status()))
        }
    }
}
