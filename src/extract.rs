//! Assistant-response extraction from a succeeded run.
//!
//! The backend exposes three views of the same turn that do not agree in
//! shape or completeness, so extraction is an ordered fallback chain:
//!
//! 1. the run's own output message list,
//! 2. the thread's `/messages` endpoint,
//! 3. the full `/state` endpoint.
//!
//! Each step runs only if the previous one yielded nothing usable. The
//! structured side channel (`graph_state`) is captured whenever step 3
//! runs, independent of whether text was found there.

use serde_json::Value;

use crate::client::{AgentApi, RemoteMessage, Run};
use crate::logging::{log, obj, v_str, Domain, Level};

/// Returned when every extraction step comes up empty. The send still
/// succeeds; the user can simply ask again once the backend catches up.
pub const PROCESSING_PLACEHOLDER: &str = "I'm processing your request. Please try again.";

#[derive(Debug, Default)]
pub struct Extracted {
    pub text: Option<String>,
    /// Full `state.values` from step 3, when that step was reached.
    pub graph_state: Option<Value>,
}

pub async fn extract_response(api: &dyn AgentApi, thread_id: &str, run: &Run) -> Extracted {
    // Step 1: the run already carries its output messages.
    if let Some(output) = &run.output {
        if let Some(last) = output.messages.last() {
            if let Some(text) = content_text(last.get("content").unwrap_or(&Value::Null)) {
                log(
                    Level::Debug,
                    Domain::Extract,
                    "text_from_run_output",
                    obj(&[("thread_id", v_str(thread_id))]),
                );
                return Extracted { text: Some(text), graph_state: None };
            }
        }
    }

    // Step 2: the messages endpoint, last assistant entry.
    match api.thread_messages(thread_id).await {
        Ok(messages) => {
            if let Some(text) = last_assistant_text(&messages) {
                log(
                    Level::Debug,
                    Domain::Extract,
                    "text_from_messages",
                    obj(&[("thread_id", v_str(thread_id))]),
                );
                return Extracted { text: Some(text), graph_state: None };
            }
        }
        Err(err) => {
            log(
                Level::Warn,
                Domain::Extract,
                "messages_fetch_failed",
                obj(&[
                    ("thread_id", v_str(thread_id)),
                    ("error", v_str(&err.to_string())),
                ]),
            );
        }
    }

    // Step 3: full thread state. Also the only source of the structured
    // side channel, so its values are kept even when no text is found.
    match api.thread_state(thread_id).await {
        Ok(state) => {
            let text = state
                .values
                .get("messages")
                .and_then(Value::as_array)
                .and_then(|messages| messages.last())
                .and_then(|last| content_text(last.get("content").unwrap_or(&Value::Null)));
            if text.is_none() {
                log(
                    Level::Warn,
                    Domain::Extract,
                    "no_text_in_state",
                    obj(&[("thread_id", v_str(thread_id))]),
                );
            }
            Extracted { text, graph_state: Some(state.values) }
        }
        Err(err) => {
            log(
                Level::Warn,
                Domain::Extract,
                "state_fetch_failed",
                obj(&[
                    ("thread_id", v_str(thread_id)),
                    ("error", v_str(&err.to_string())),
                ]),
            );
            Extracted::default()
        }
    }
}

fn last_assistant_text(messages: &[RemoteMessage]) -> Option<String> {
    messages
        .iter()
        .rev()
        .find(|m| {
            m.role.as_deref() == Some("assistant") || m.kind.as_deref() == Some("ai")
        })
        .and_then(|m| content_text(&m.content))
}

/// Normalize the remote's content field into plain text. Observed shapes:
/// a plain string, an array of typed segments, an object with a `text`
/// field, or something else entirely (stringified as a last resort).
pub fn content_text(content: &Value) -> Option<String> {
    match content {
        Value::Null => None,
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(s.clone())
            }
        }
        Value::Array(segments) => {
            if segments.is_empty() {
                return None;
            }
            let text_segment = segments
                .iter()
                .find(|seg| seg.get("type").and_then(Value::as_str) == Some("text"))
                .and_then(|seg| seg.get("text").and_then(Value::as_str));
            if let Some(text) = text_segment {
                return Some(text.to_string());
            }
            if let Some(text) = segments.first().and_then(|seg| seg.get("text")).and_then(Value::as_str) {
                return Some(text.to_string());
            }
            Some(content.to_string())
        }
        Value::Object(fields) => {
            if let Some(text) = fields.get("text").and_then(Value::as_str) {
                return Some(text.to_string());
            }
            Some(content.to_string())
        }
        other => Some(other.to_string()),
    }
}
