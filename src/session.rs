//! Chat sessions and the send/poll/extract orchestration protocol.
//!
//! A session owns its local transcript, its lazily bound remote thread,
//! and the analysis artifacts its turns produced. `ChatService` drives
//! the full turn protocol and routes the structured side channel into
//! the shared market-views snapshot.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::analysis::{self, AnalysisOutput};
use crate::client::{AgentApi, RunHandle};
use crate::config::Config;
use crate::extract::{self, PROCESSING_PLACEHOLDER};
use crate::logging::{log, next_id, obj, v_str, Domain, Level};
use crate::poller::{poll_run, PollBudget, PollOutcome};
use crate::views::{self, MarketViewsState};

pub const TIMEOUT_MESSAGE: &str = "Your query is taking longer than expected to process. This often happens with complex financial analysis. Please try asking a simpler question or try again in a moment.";
pub const THREAD_ONLY_MESSAGE: &str = "Thread created successfully. Please send your message.";
pub const ERROR_MESSAGE: &str =
    "I'm sorry, I encountered an error processing your request. Please try again.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    fn new(role: Role, content: String) -> Self {
        Self {
            id: next_id("m"),
            role,
            content,
            timestamp: Utc::now(),
        }
    }
}

/// One conversation. The remote thread is bound on the first answered
/// turn and reused afterwards so the agent keeps its context.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: String,
    pub title: String,
    pub last_activity: DateTime<Utc>,
    pub thread_id: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub analysis_outputs: Vec<AnalysisOutput>,
    pub has_unviewed_results: bool,
    /// Last `priced_portfolio` seen on this thread, kept for Greeks
    /// backfill on a later scenario batch.
    pub priced_portfolio: Option<Value>,
}

impl Session {
    fn new() -> Self {
        Self {
            id: next_id("s"),
            title: "New Chat".to_string(),
            last_activity: Utc::now(),
            thread_id: None,
            messages: Vec::new(),
            analysis_outputs: Vec::new(),
            has_unviewed_results: false,
            priced_portfolio: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("message is empty")]
    EmptyMessage,
    #[error("unknown session: {0}")]
    UnknownSession(String),
}

/// How the turn ended. Every variant still appends an assistant message;
/// the caller can use this to decide on retry affordances.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    Answered,
    /// The backend created a thread but started no run.
    ThreadOnly,
    /// Poll budget exhausted. The thread is kept; the run may still
    /// finish remotely.
    TimedOut,
    Failed { detail: String },
}

#[derive(Debug)]
pub struct SendResult {
    pub assistant_text: String,
    pub thread_id: Option<String>,
    pub graph_state: Option<Value>,
    pub outcome: TurnOutcome,
}

struct Turn {
    text: String,
    thread_id: Option<String>,
    graph_state: Option<Value>,
    outcome: TurnOutcome,
}

pub struct ChatService {
    api: Arc<dyn AgentApi>,
    budget: PollBudget,
    bootstrap_budget: PollBudget,
    sessions: Mutex<HashMap<String, Session>>,
    /// Per-session turn serialization. Guards remote calls, so it is an
    /// async mutex held across awaits; the std mutexes above never are.
    send_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    views: Mutex<MarketViewsState>,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ChatService {
    pub fn new(api: Arc<dyn AgentApi>, cfg: &Config) -> Self {
        Self {
            api,
            budget: PollBudget {
                max_attempts: cfg.poll_max_attempts,
                interval: cfg.poll_interval(),
            },
            bootstrap_budget: PollBudget {
                max_attempts: cfg.bootstrap_max_attempts,
                interval: cfg.poll_interval(),
            },
            sessions: Mutex::new(HashMap::new()),
            send_locks: Mutex::new(HashMap::new()),
            views: Mutex::new(MarketViewsState::default()),
        }
    }

    pub fn create_session(&self) -> Session {
        let session = Session::new();
        log(
            Level::Info,
            Domain::Session,
            "session_created",
            obj(&[("session_id", v_str(&session.id))]),
        );
        locked(&self.sessions).insert(session.id.clone(), session.clone());
        session
    }

    pub fn session(&self, session_id: &str) -> Option<Session> {
        locked(&self.sessions).get(session_id).cloned()
    }

    /// All sessions, most recently active first.
    pub fn sessions(&self) -> Vec<Session> {
        let mut all: Vec<Session> = locked(&self.sessions).values().cloned().collect();
        all.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        all
    }

    pub fn mark_viewed(&self, session_id: &str) {
        if let Some(session) = locked(&self.sessions).get_mut(session_id) {
            session.has_unviewed_results = false;
        }
    }

    pub fn market_views(&self) -> MarketViewsState {
        locked(&self.views).clone()
    }

    /// Run one full chat turn. Exactly one user and one assistant
    /// message are appended on every path past validation, degraded
    /// outcomes included.
    pub async fn send_message(&self, session_id: &str, text: &str) -> Result<SendResult, SendError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(SendError::EmptyMessage);
        }

        // Serialize turns per session. Concurrent sends on a fresh
        // session would otherwise race to bind the thread and orphan
        // one of the two.
        let send_lock = self.send_lock(session_id)?;
        let _turn_guard = send_lock.lock().await;

        let thread_id = {
            let mut sessions = locked(&self.sessions);
            let session = sessions
                .get_mut(session_id)
                .ok_or_else(|| SendError::UnknownSession(session_id.to_string()))?;
            session.messages.push(ChatMessage::new(Role::User, text.to_string()));
            session.last_activity = Utc::now();
            if session.title == "New Chat" {
                session.title = derive_title(text);
            }
            session.thread_id.clone()
        };

        let turn = self.run_turn(thread_id.as_deref(), text).await;
        self.apply_turn(session_id, &turn);

        Ok(SendResult {
            assistant_text: turn.text,
            thread_id: turn.thread_id,
            graph_state: turn.graph_state,
            outcome: turn.outcome,
        })
    }

    fn send_lock(&self, session_id: &str) -> Result<Arc<tokio::sync::Mutex<()>>, SendError> {
        if !locked(&self.sessions).contains_key(session_id) {
            return Err(SendError::UnknownSession(session_id.to_string()));
        }
        let mut locks = locked(&self.send_locks);
        Ok(locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone())
    }

    /// The remote half of a turn: create run, poll, extract. Every
    /// failure mode collapses into a user-facing text plus an outcome.
    async fn run_turn(&self, thread_id: Option<&str>, text: &str) -> Turn {
        let handle = match self.api.create_run(thread_id, text).await {
            Ok(handle) => handle,
            Err(err) => {
                log(
                    Level::Error,
                    Domain::Session,
                    "run_creation_failed",
                    obj(&[("error", v_str(&err.to_string()))]),
                );
                return Turn {
                    text: ERROR_MESSAGE.to_string(),
                    thread_id: thread_id.map(str::to_string),
                    graph_state: None,
                    outcome: TurnOutcome::Failed { detail: err.to_string() },
                };
            }
        };

        let RunHandle { thread_id: new_thread, run_id } = handle;
        let bound_thread = new_thread.or_else(|| thread_id.map(str::to_string));

        let Some(run_id) = run_id else {
            return Turn {
                text: THREAD_ONLY_MESSAGE.to_string(),
                thread_id: bound_thread,
                graph_state: None,
                outcome: TurnOutcome::ThreadOnly,
            };
        };
        let Some(bound_thread) = bound_thread else {
            // A run id without any thread id is unusable.
            return Turn {
                text: ERROR_MESSAGE.to_string(),
                thread_id: None,
                graph_state: None,
                outcome: TurnOutcome::Failed { detail: "run created without a thread id".to_string() },
            };
        };

        match poll_run(self.api.as_ref(), &bound_thread, &run_id, self.budget).await {
            PollOutcome::Succeeded(run) => {
                let extracted = extract::extract_response(self.api.as_ref(), &bound_thread, &run).await;
                Turn {
                    text: extracted
                        .text
                        .unwrap_or_else(|| PROCESSING_PLACEHOLDER.to_string()),
                    thread_id: Some(bound_thread),
                    graph_state: extracted.graph_state,
                    outcome: TurnOutcome::Answered,
                }
            }
            PollOutcome::Failed(detail) => Turn {
                text: ERROR_MESSAGE.to_string(),
                thread_id: Some(bound_thread),
                graph_state: None,
                outcome: TurnOutcome::Failed { detail },
            },
            PollOutcome::TimedOut => Turn {
                text: TIMEOUT_MESSAGE.to_string(),
                thread_id: Some(bound_thread),
                graph_state: None,
                outcome: TurnOutcome::TimedOut,
            },
        }
    }

    /// Fold the turn back into session state and route the side channel.
    fn apply_turn(&self, session_id: &str, turn: &Turn) {
        if let Some(values) = &turn.graph_state {
            if let Some((directional, macros)) = views::reconcile(values) {
                locked(&self.views).replace(directional, macros);
            }
        }

        let mut sessions = locked(&self.sessions);
        let Some(session) = sessions.get_mut(session_id) else {
            return;
        };

        if let Some(values) = &turn.graph_state {
            // Classify against the PRIOR turn's portfolio, then stash
            // this turn's.
            if let Some(output) = analysis::classify(values, session.priced_portfolio.as_ref()) {
                session.analysis_outputs.push(output);
                session.has_unviewed_results = true;
            }
            if let Some(portfolio) = values.get("priced_portfolio") {
                if !portfolio.is_null() {
                    session.priced_portfolio = Some(portfolio.clone());
                }
            }
        }

        if turn.thread_id.is_some() {
            session.thread_id = turn.thread_id.clone();
        }
        session
            .messages
            .push(ChatMessage::new(Role::Assistant, turn.text.clone()));
        session.last_activity = Utc::now();
        log(
            Level::Info,
            Domain::Session,
            "turn_applied",
            obj(&[
                ("session_id", v_str(session_id)),
                ("messages", json!(session.messages.len())),
                ("outputs", json!(session.analysis_outputs.len())),
            ]),
        );
    }

    /// Hydrate market views outside any chat turn. Without a thread, a
    /// throwaway one is bootstrapped with a greeting run so the backend
    /// materializes its state.
    pub async fn fetch_graph_state(&self, thread_id: Option<&str>) -> anyhow::Result<Value> {
        let thread_id = match thread_id {
            Some(id) => id.to_string(),
            None => {
                let id = self.api.create_thread().await?;
                let handle = self.api.create_run(Some(&id), "hello").await?;
                if let Some(run_id) = handle.run_id {
                    // Best effort: state is read regardless of outcome.
                    let outcome =
                        poll_run(self.api.as_ref(), &id, &run_id, self.bootstrap_budget).await;
                    if !matches!(outcome, PollOutcome::Succeeded(_)) {
                        log(
                            Level::Warn,
                            Domain::Session,
                            "bootstrap_run_incomplete",
                            obj(&[("thread_id", v_str(&id))]),
                        );
                    }
                }
                id
            }
        };

        let state = self.api.thread_state(&thread_id).await?;
        if let Some((directional, macros)) = views::reconcile(&state.values) {
            locked(&self.views).replace(directional, macros);
        }
        Ok(state.values)
    }
}

const KNOWN_PAIRS: &[&str] = &[
    "EURUSD", "GBPUSD", "USDJPY", "USDCHF", "AUDUSD", "USDCAD", "NZDUSD", "EURGBP", "EURJPY",
    "GBPJPY",
];

/// Session title from the first user message: detected currency pairs
/// plus a topic keyword, else a truncation of the message itself.
fn derive_title(text: &str) -> String {
    let compact = text.to_uppercase().replace('/', "");
    let pairs: Vec<&str> = KNOWN_PAIRS
        .iter()
        .filter(|pair| compact.contains(**pair))
        .copied()
        .collect();

    let lower = text.to_lowercase();
    let topic = if lower.contains("vol") {
        Some("Volatility")
    } else if lower.contains("scenario") || lower.contains("stress") {
        Some("Scenario Analysis")
    } else if lower.contains("hedg") {
        Some("Hedging")
    } else if lower.contains("fed")
        || lower.contains("ecb")
        || lower.contains("boj")
        || lower.contains("central bank")
    {
        Some("Central Bank Outlook")
    } else {
        None
    };

    match (pairs.is_empty(), topic) {
        (false, Some(topic)) => format!("{} {}", pairs.join(", "), topic),
        (false, None) => pairs.join(", "),
        (true, Some(topic)) => topic.to_string(),
        (true, None) => {
            let trimmed = text.trim();
            if trimmed.chars().count() <= 32 {
                trimmed.to_string()
            } else {
                let cut: String = trimmed.chars().take(32).collect();
                format!("{}...", cut.trim_end())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_title_pair_and_topic() {
        assert_eq!(derive_title("what's your EUR/USD vol view?"), "EURUSD Volatility");
    }

    #[test]
    fn test_title_multiple_pairs() {
        assert_eq!(derive_title("compare EURUSD and GBPUSD"), "EURUSD, GBPUSD");
    }

    #[test]
    fn test_title_topic_only() {
        assert_eq!(derive_title("run a stress test on my book"), "Scenario Analysis");
        assert_eq!(derive_title("when does the Fed cut?"), "Central Bank Outlook");
    }

    #[test]
    fn test_title_truncates_long_free_text() {
        let title = derive_title("please summarize everything that happened in markets today");
        assert!(title.ends_with("..."));
        assert!(title.chars().count() <= 35);
    }

    #[test]
    fn test_title_short_free_text_kept() {
        assert_eq!(derive_title("good morning"), "good morning");
    }
}
