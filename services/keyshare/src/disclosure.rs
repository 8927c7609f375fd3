//! Interface to the attribute-disclosure session engine.
//!
//! The engine is an external collaborator: the console starts a disclosure
//! session and hands over a callback; the engine later delivers the session
//! result on a task of its own. The remote implementation talks to an IRMA
//! server over HTTP and polls for the result.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;
use utoipa::ToSchema;

/// Terminal state of a disclosure session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionStatus {
    Done,
    Cancelled,
    Timeout,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProofStatus {
    Valid,
    Invalid,
    Expired,
    MissingAttributes,
}

#[derive(Clone, Debug)]
pub struct DisclosedAttribute {
    pub identifier: String,
    pub raw_value: Option<String>,
}

#[derive(Clone, Debug)]
pub struct SessionResult {
    pub status: SessionStatus,
    pub proof_status: ProofStatus,
    /// Disclosed attributes, grouped per conjunction of the request.
    pub disclosed: Vec<Vec<DisclosedAttribute>>,
}

impl SessionResult {
    /// First disclosed raw value, the common case for single-attribute
    /// requests.
    #[must_use]
    pub fn first_raw_value(&self) -> Option<&str> {
        self.disclosed
            .first()
            .and_then(|con| con.first())
            .and_then(|attr| attr.raw_value.as_deref())
    }
}

/// Attribute identifiers the session asks the user to disclose.
#[derive(Clone, Debug)]
pub struct DisclosureRequest {
    pub attributes: Vec<String>,
}

/// Handoff payload shown to the user, typically rendered as a QR code.
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct Qr {
    pub u: String,
    pub irmaqr: String,
}

pub type ResultCallback = Box<dyn FnOnce(SessionResult) -> BoxFuture<'static, ()> + Send>;

#[async_trait]
pub trait DisclosureEngine: Send + Sync {
    /// Start a disclosure session. The callback fires once the session
    /// reaches a terminal state.
    async fn start_disclosure(
        &self,
        request: DisclosureRequest,
        callback: ResultCallback,
    ) -> Result<Qr>;
}

const RESULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
const RESULT_POLL_BUDGET: Duration = Duration::from_secs(10 * 60);

/// Disclosure engine backed by a remote IRMA server's session REST API.
pub struct RemoteDisclosureEngine {
    client: reqwest::Client,
    base_url: String,
}

impl RemoteDisclosureEngine {
    #[must_use]
    pub fn new(base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[derive(Serialize)]
struct RemoteSessionRequest {
    #[serde(rename = "@context")]
    context: &'static str,
    disclose: Vec<Vec<Vec<String>>>,
}

#[derive(Deserialize)]
struct RemoteSessionPackage {
    #[serde(rename = "sessionPtr")]
    session_ptr: Qr,
    token: String,
}

#[derive(Deserialize)]
struct RemoteSessionResult {
    status: String,
    #[serde(rename = "proofStatus", default)]
    proof_status: Option<String>,
    #[serde(default)]
    disclosed: Option<Vec<Vec<RemoteAttribute>>>,
}

#[derive(Deserialize)]
struct RemoteAttribute {
    id: String,
    #[serde(rename = "rawvalue")]
    raw_value: Option<String>,
}

fn parse_status(status: &str) -> Option<SessionStatus> {
    match status {
        "DONE" => Some(SessionStatus::Done),
        "CANCELLED" => Some(SessionStatus::Cancelled),
        "TIMEOUT" => Some(SessionStatus::Timeout),
        _ => None,
    }
}

fn parse_proof_status(proof_status: Option<&str>) -> ProofStatus {
    match proof_status {
        Some("VALID") => ProofStatus::Valid,
        Some("EXPIRED") => ProofStatus::Expired,
        Some("MISSING_ATTRIBUTES") => ProofStatus::MissingAttributes,
        _ => ProofStatus::Invalid,
    }
}

impl From<RemoteSessionResult> for SessionResult {
    fn from(remote: RemoteSessionResult) -> Self {
        let status = parse_status(&remote.status).unwrap_or(SessionStatus::Timeout);
        Self {
            status,
            proof_status: parse_proof_status(remote.proof_status.as_deref()),
            disclosed: remote
                .disclosed
                .unwrap_or_default()
                .into_iter()
                .map(|con| {
                    con.into_iter()
                        .map(|attr| DisclosedAttribute {
                            identifier: attr.id,
                            raw_value: attr.raw_value,
                        })
                        .collect()
                })
                .collect(),
        }
    }
}

#[async_trait]
impl DisclosureEngine for RemoteDisclosureEngine {
    async fn start_disclosure(
        &self,
        request: DisclosureRequest,
        callback: ResultCallback,
    ) -> Result<Qr> {
        let body = RemoteSessionRequest {
            context: "https://irma.app/ld/request/disclosure/v2",
            disclose: vec![vec![request.attributes.clone()]],
        };
        let package: RemoteSessionPackage = self
            .client
            .post(format!("{}/session", self.base_url))
            .json(&body)
            .send()
            .await
            .context("failed to start disclosure session")?
            .error_for_status()
            .context("disclosure session was refused")?
            .json()
            .await
            .context("failed to decode disclosure session package")?;

        let client = self.client.clone();
        let result_url = format!("{}/session/{}/result", self.base_url, package.token);
        tokio::spawn(async move {
            let deadline = tokio::time::Instant::now() + RESULT_POLL_BUDGET;
            loop {
                sleep(RESULT_POLL_INTERVAL).await;
                if tokio::time::Instant::now() >= deadline {
                    warn!("disclosure session result polling gave up");
                    return;
                }
                let remote: RemoteSessionResult = match client
                    .get(&result_url)
                    .send()
                    .await
                    .and_then(reqwest::Response::error_for_status)
                {
                    Ok(response) => match response.json().await {
                        Ok(remote) => remote,
                        Err(err) => {
                            warn!("failed to decode disclosure result: {err}");
                            continue;
                        }
                    },
                    Err(err) => {
                        warn!("failed to poll disclosure result: {err}");
                        continue;
                    }
                };
                if parse_status(&remote.status).is_some() {
                    callback(remote.into()).await;
                    return;
                }
            }
        });

        Ok(package.session_ptr)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Engine stub that records callbacks so tests can fire results
    /// deterministically.
    #[derive(Default)]
    pub struct StubEngine {
        callbacks: Mutex<Vec<(DisclosureRequest, ResultCallback)>>,
    }

    impl StubEngine {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn pending(&self) -> usize {
            self.callbacks.lock().expect("stub lock").len()
        }

        pub fn last_request_attributes(&self) -> Vec<String> {
            self.callbacks
                .lock()
                .expect("stub lock")
                .last()
                .map(|(request, _)| request.attributes.clone())
                .unwrap_or_default()
        }

        /// Deliver `result` to the most recently registered session.
        pub async fn fire(&self, result: SessionResult) {
            let (_, callback) = self
                .callbacks
                .lock()
                .expect("stub lock")
                .pop()
                .expect("a disclosure session was started");
            callback(result).await;
        }
    }

    #[async_trait]
    impl DisclosureEngine for StubEngine {
        async fn start_disclosure(
            &self,
            request: DisclosureRequest,
            callback: ResultCallback,
        ) -> Result<Qr> {
            self.callbacks
                .lock()
                .expect("stub lock")
                .push((request, callback));
            Ok(Qr {
                u: "https://irma.example/irma/session/stub".to_string(),
                irmaqr: "disclosing".to_string(),
            })
        }
    }

    pub fn valid_disclosure(raw_value: &str, identifier: &str) -> SessionResult {
        SessionResult {
            status: SessionStatus::Done,
            proof_status: ProofStatus::Valid,
            disclosed: vec![vec![DisclosedAttribute {
                identifier: identifier.to_string(),
                raw_value: Some(raw_value.to_string()),
            }]],
        }
    }
}
