use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use autopoliza_core::domain::policy::PolicyNumber;

use super::{
    CollaboratorError, IssuanceBackend, IssuanceOutcome, IssuanceRequest, RetrievalAnswer,
    RetrievalBackend,
};

const RETRIEVAL: &str = "retrieval";
const ISSUANCE: &str = "issuance";

fn build_client(backend: &'static str, timeout: Duration) -> Result<Client, CollaboratorError> {
    Client::builder().timeout(timeout).build().map_err(|error| CollaboratorError::Unavailable {
        backend,
        detail: format!("could not build http client: {error}"),
    })
}

fn unavailable(backend: &'static str, error: reqwest::Error) -> CollaboratorError {
    if error.is_timeout() {
        CollaboratorError::Timeout { backend, secs: 0 }
    } else {
        CollaboratorError::Unavailable { backend, detail: error.to_string() }
    }
}

async fn probe(client: &Client, backend: &'static str, url: String) -> Result<(), CollaboratorError> {
    let response = client.get(url).send().await.map_err(|error| unavailable(backend, error))?;
    if response.status().is_success() {
        Ok(())
    } else {
        Err(CollaboratorError::Unavailable {
            backend,
            detail: format!("health check returned {}", response.status()),
        })
    }
}

#[derive(Serialize)]
struct QueryRequest<'a> {
    question: &'a str,
    history: &'a [String],
}

#[derive(Deserialize)]
struct QueryReply {
    answer: String,
    confidence: f64,
    #[serde(default)]
    sources: Vec<Value>,
}

fn source_label(source: Value) -> Option<String> {
    match source {
        Value::String(label) => Some(label),
        Value::Object(fields) => ["source", "title", "document"]
            .iter()
            .find_map(|key| fields.get(*key).and_then(Value::as_str).map(str::to_string)),
        _ => None,
    }
}

/// Retrieval service reached over HTTP: `POST {base_url}/query`.
#[derive(Clone, Debug)]
pub struct HttpRetrievalBackend {
    client: Client,
    base_url: String,
}

impl HttpRetrievalBackend {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, CollaboratorError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self { client: build_client(RETRIEVAL, timeout)?, base_url })
    }
}

#[async_trait]
impl RetrievalBackend for HttpRetrievalBackend {
    fn name(&self) -> &'static str {
        RETRIEVAL
    }

    async fn query(
        &self,
        question: &str,
        history: &[String],
    ) -> Result<RetrievalAnswer, CollaboratorError> {
        let url = format!("{}/query", self.base_url);
        debug!(backend = RETRIEVAL, question_len = question.len(), "querying retrieval backend");

        let response = self
            .client
            .post(url)
            .json(&QueryRequest { question, history })
            .send()
            .await
            .map_err(|error| unavailable(RETRIEVAL, error))?;
        if !response.status().is_success() {
            return Err(CollaboratorError::Unavailable {
                backend: RETRIEVAL,
                detail: format!("query returned {}", response.status()),
            });
        }

        let reply: QueryReply = response.json().await.map_err(|error| {
            CollaboratorError::Malformed { backend: RETRIEVAL, detail: error.to_string() }
        })?;
        if !(0.0..=1.0).contains(&reply.confidence) {
            return Err(CollaboratorError::Malformed {
                backend: RETRIEVAL,
                detail: format!("confidence {} outside [0, 1]", reply.confidence),
            });
        }

        Ok(RetrievalAnswer {
            answer: reply.answer,
            confidence: reply.confidence,
            sources: reply.sources.into_iter().filter_map(source_label).collect(),
        })
    }

    async fn health(&self) -> Result<(), CollaboratorError> {
        probe(&self.client, RETRIEVAL, format!("{}/health", self.base_url)).await
    }
}

#[derive(Deserialize)]
struct IssuanceReply {
    numero_poliza: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    detail: Option<String>,
}

impl IssuanceReply {
    fn error_text(&self) -> Option<String> {
        self.error.clone().or_else(|| self.detail.clone())
    }
}

/// Policy issuance service reached over HTTP: `POST {base_url}/expedir-poliza`.
#[derive(Clone, Debug)]
pub struct HttpIssuanceBackend {
    client: Client,
    base_url: String,
    api_key: Option<SecretString>,
}

impl HttpIssuanceBackend {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<SecretString>,
        timeout: Duration,
    ) -> Result<Self, CollaboratorError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self { client: build_client(ISSUANCE, timeout)?, base_url, api_key })
    }
}

#[async_trait]
impl IssuanceBackend for HttpIssuanceBackend {
    fn name(&self) -> &'static str {
        ISSUANCE
    }

    async fn issue(&self, request: &IssuanceRequest) -> Result<IssuanceOutcome, CollaboratorError> {
        let mut call = self.client.post(format!("{}/expedir-poliza", self.base_url)).json(request);
        if let Some(api_key) = &self.api_key {
            call = call.bearer_auth(api_key.expose_secret());
        }

        let response = call.send().await.map_err(|error| unavailable(ISSUANCE, error))?;
        let status = response.status();
        if status.is_server_error() {
            return Err(CollaboratorError::Unavailable {
                backend: ISSUANCE,
                detail: format!("issuance returned {status}"),
            });
        }

        let reply: IssuanceReply = response.json().await.map_err(|error| {
            CollaboratorError::Malformed { backend: ISSUANCE, detail: error.to_string() }
        })?;

        if status.is_success() {
            if let Some(number) = reply.numero_poliza.clone().filter(|number| !number.is_empty()) {
                return Ok(IssuanceOutcome::Issued { policy_number: PolicyNumber(number) });
            }
        }

        let error = reply.error_text().unwrap_or_else(|| format!("issuance returned {status}"));
        Ok(IssuanceOutcome::Rejected { error })
    }

    async fn health(&self) -> Result<(), CollaboratorError> {
        probe(&self.client, ISSUANCE, format!("{}/health", self.base_url)).await
    }
}
