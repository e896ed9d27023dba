//! Thin request layer over the remote agent's HTTP surface.
//!
//! Four operations: create thread, create run, get run status, read
//! thread messages/state. Every call is network I/O only; non-2xx
//! responses surface as typed errors carrying the body for diagnostics.

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::config::Config;
use crate::logging::{log, obj, v_str, Domain, Level};

const API_KEY_HEADER: &str = "X-Api-Key";

#[derive(Debug, Error)]
pub enum AgentError {
    /// Missing credentials. Fatal, raised before any network call.
    #[error("agent backend not configured: missing {0}")]
    Config(&'static str),
    /// Non-2xx from the agent. The body is kept verbatim for diagnostics.
    #[error("agent returned HTTP {status}: {body}")]
    Remote { status: u16, body: String },
    #[error("agent transport failure: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("undecodable agent response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Identifiers returned by run creation. `run_id` is absent when the
/// backend answered with a thread-creation-only response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunHandle {
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub run_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Queued,
    Running,
    Success,
    Error,
    #[serde(other)]
    Unknown,
}

/// One asynchronous invocation of the agent against a thread.
#[derive(Debug, Clone, Deserialize)]
pub struct Run {
    pub status: RunStatus,
    #[serde(default)]
    pub output: Option<RunOutput>,
    #[serde(default)]
    pub error: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunOutput {
    #[serde(default)]
    pub messages: Vec<Value>,
}

/// Entry from the `/messages` endpoint. Older deployments emit `role`,
/// newer ones `type`; content shape varies (see `extract`).
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteMessage {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub content: Value,
}

/// Full thread state from the `/state` endpoint. `values` carries the
/// message history plus the structured side channel (market views,
/// scenario analyses, priced portfolio).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RemoteState {
    #[serde(default)]
    pub values: Value,
}

/// The agent's HTTP surface, as a seam so the orchestration protocol can
/// be exercised against a scripted in-memory backend.
#[async_trait]
pub trait AgentApi: Send + Sync {
    async fn create_thread(&self) -> Result<String, AgentError>;
    /// With `thread_id == None` the backend is asked to create a thread
    /// and a run in one round trip.
    async fn create_run(&self, thread_id: Option<&str>, text: &str) -> Result<RunHandle, AgentError>;
    async fn run_status(&self, thread_id: &str, run_id: &str) -> Result<Run, AgentError>;
    async fn thread_messages(&self, thread_id: &str) -> Result<Vec<RemoteMessage>, AgentError>;
    async fn thread_state(&self, thread_id: &str) -> Result<RemoteState, AgentError>;
}

pub struct AgentClient {
    client: Client,
    base: String,
    api_key: String,
    assistant_id: Option<String>,
}

impl AgentClient {
    pub fn new(cfg: &Config) -> Result<Self, AgentError> {
        let base = cfg
            .api_url
            .as_ref()
            .filter(|v| !v.trim().is_empty())
            .ok_or(AgentError::Config("GRAPH_API_URL"))?
            .trim_end_matches('/')
            .to_string();
        let api_key = cfg
            .api_key
            .as_ref()
            .filter(|v| !v.trim().is_empty())
            .ok_or(AgentError::Config("GRAPH_API_KEY"))?
            .clone();
        Ok(Self {
            client: Client::builder()
                .timeout(cfg.http_timeout())
                .build()
                .unwrap_or_else(|_| Client::new()),
            base,
            api_key,
            assistant_id: cfg.assistant_id.clone(),
        })
    }

    fn run_body(&self, text: &str) -> Value {
        let mut body = json!({
            "input": {
                "messages": [{ "role": "human", "content": text }]
            }
        });
        if let Some(assistant_id) = &self.assistant_id {
            body["assistant_id"] = json!(assistant_id);
        }
        body
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, AgentError> {
        let resp = self
            .client
            .get(url)
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .await?;
        Self::decode(url, resp).await
    }

    async fn post_json<T: DeserializeOwned>(&self, url: &str, body: &Value) -> Result<T, AgentError> {
        let resp = self
            .client
            .post(url)
            .header(API_KEY_HEADER, &self.api_key)
            .json(body)
            .send()
            .await?;
        Self::decode(url, resp).await
    }

    async fn decode<T: DeserializeOwned>(url: &str, resp: reqwest::Response) -> Result<T, AgentError> {
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            log(
                Level::Error,
                Domain::Agent,
                "remote_error",
                obj(&[
                    ("url", v_str(url)),
                    ("status", json!(status.as_u16())),
                    ("body", v_str(&body)),
                ]),
            );
            return Err(AgentError::Remote {
                status: status.as_u16(),
                body,
            });
        }
        Ok(serde_json::from_str(&body)?)
    }
}

#[derive(Debug, Deserialize)]
struct ThreadResponse {
    thread_id: String,
}

#[async_trait]
impl AgentApi for AgentClient {
    async fn create_thread(&self) -> Result<String, AgentError> {
        let url = format!("{}/threads", self.base);
        let mut body = json!({});
        if let Some(assistant_id) = &self.assistant_id {
            body["assistant_id"] = json!(assistant_id);
        }
        let resp: ThreadResponse = self.post_json(&url, &body).await?;
        log(
            Level::Info,
            Domain::Agent,
            "thread_created",
            obj(&[("thread_id", v_str(&resp.thread_id))]),
        );
        Ok(resp.thread_id)
    }

    async fn create_run(&self, thread_id: Option<&str>, text: &str) -> Result<RunHandle, AgentError> {
        let url = match thread_id {
            Some(id) => format!("{}/threads/{}/runs", self.base, id),
            None => format!("{}/threads", self.base),
        };
        let handle: RunHandle = self.post_json(&url, &self.run_body(text)).await?;
        log(
            Level::Info,
            Domain::Agent,
            "run_created",
            obj(&[
                ("reused_thread", json!(thread_id.is_some())),
                ("has_run_id", json!(handle.run_id.is_some())),
            ]),
        );
        Ok(handle)
    }

    async fn run_status(&self, thread_id: &str, run_id: &str) -> Result<Run, AgentError> {
        let url = format!("{}/threads/{}/runs/{}", self.base, thread_id, run_id);
        self.get_json(&url).await
    }

    async fn thread_messages(&self, thread_id: &str) -> Result<Vec<RemoteMessage>, AgentError> {
        let url = format!("{}/threads/{}/messages", self.base, thread_id);
        self.get_json(&url).await
    }

    async fn thread_state(&self, thread_id: &str) -> Result<RemoteState, AgentError> {
        let url = format!("{}/threads/{}/state", self.base, thread_id);
        self.get_json(&url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configured() -> Config {
        Config {
            api_url: Some("http://localhost:8123/".to_string()),
            api_key: Some("k".to_string()),
            assistant_id: Some("fx-agent".to_string()),
            poll_max_attempts: 1,
            poll_interval_ms: 1,
            bootstrap_max_attempts: 1,
            http_timeout_secs: 1,
        }
    }

    #[test]
    fn test_missing_url_is_config_error() {
        let cfg = Config { api_url: None, ..configured() };
        assert!(matches!(AgentClient::new(&cfg), Err(AgentError::Config("GRAPH_API_URL"))));
    }

    #[test]
    fn test_missing_key_is_config_error() {
        let cfg = Config { api_key: Some("  ".to_string()), ..configured() };
        assert!(matches!(AgentClient::new(&cfg), Err(AgentError::Config("GRAPH_API_KEY"))));
    }

    #[test]
    fn test_base_url_trailing_slash_stripped() {
        let client = AgentClient::new(&configured()).unwrap();
        assert_eq!(client.base, "http://localhost:8123");
    }

    #[test]
    fn test_run_body_uses_human_role() {
        let client = AgentClient::new(&configured()).unwrap();
        let body = client.run_body("price a straddle");
        assert_eq!(body["input"]["messages"][0]["role"], "human");
        assert_eq!(body["input"]["messages"][0]["content"], "price a straddle");
        assert_eq!(body["assistant_id"], "fx-agent");
    }

    #[test]
    fn test_run_body_omits_absent_assistant() {
        let cfg = Config { assistant_id: None, ..configured() };
        let client = AgentClient::new(&cfg).unwrap();
        let body = client.run_body("hi");
        assert!(body.get("assistant_id").is_none());
    }

    #[test]
    fn test_run_status_decodes_unknown_variants() {
        let run: Run = serde_json::from_value(json!({"status": "interrupted"})).unwrap();
        assert_eq!(run.status, RunStatus::Unknown);
        let run: Run = serde_json::from_value(json!({"status": "success"})).unwrap();
        assert_eq!(run.status, RunStatus::Success);
    }

    #[test]
    fn test_run_handle_tolerates_thread_only_response() {
        let handle: RunHandle = serde_json::from_value(json!({"thread_id": "t1"})).unwrap();
        assert_eq!(handle.thread_id.as_deref(), Some("t1"));
        assert!(handle.run_id.is_none());
    }
}
