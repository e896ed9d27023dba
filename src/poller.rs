//! Bounded polling loop against a created run.
//!
//! State machine: Submitted -> { Running (self-loop) -> Succeeded |
//! Failed | TimedOut }. The loop sleeps before every status check, so
//! total wait is bounded by `max_attempts * interval` and the backend is
//! never busy-polled. Transient failures of a status check consume one
//! attempt and keep the loop alive; only the attempt budget ends it.

use std::time::Duration;

use serde_json::{json, Value};
use tokio::time::sleep;

use crate::client::{AgentApi, Run, RunStatus};
use crate::logging::{log, obj, v_str, Domain, Level};

#[derive(Clone, Copy, Debug)]
pub struct PollBudget {
    pub max_attempts: u32,
    pub interval: Duration,
}

/// Terminal result of a polling loop. `TimedOut` is a defined degraded
/// outcome, distinct from `Failed`: the run may still complete remotely
/// and the caller keeps the thread.
#[derive(Debug)]
pub enum PollOutcome {
    Succeeded(Run),
    Failed(String),
    TimedOut,
}

pub async fn poll_run(
    api: &dyn AgentApi,
    thread_id: &str,
    run_id: &str,
    budget: PollBudget,
) -> PollOutcome {
    for attempt in 1..=budget.max_attempts {
        sleep(budget.interval).await;
        match api.run_status(thread_id, run_id).await {
            Ok(run) => match run.status {
                RunStatus::Success => {
                    log(
                        Level::Info,
                        Domain::Poll,
                        "run_succeeded",
                        obj(&[("run_id", v_str(run_id)), ("attempts", json!(attempt))]),
                    );
                    return PollOutcome::Succeeded(run);
                }
                RunStatus::Error => {
                    let detail = run
                        .error
                        .as_ref()
                        .map(error_detail)
                        .unwrap_or_else(|| "unknown remote error".to_string());
                    log(
                        Level::Error,
                        Domain::Poll,
                        "run_failed",
                        obj(&[("run_id", v_str(run_id)), ("detail", v_str(&detail))]),
                    );
                    return PollOutcome::Failed(detail);
                }
                _ => {
                    // Still queued/running. Long analyses are normal here.
                    if attempt > 30 && attempt % 10 == 0 {
                        log(
                            Level::Info,
                            Domain::Poll,
                            "still_running",
                            obj(&[("run_id", v_str(run_id)), ("attempts", json!(attempt))]),
                        );
                    }
                }
            },
            Err(err) => {
                // Transient status-check failure: consume the attempt, keep going.
                log(
                    Level::Warn,
                    Domain::Poll,
                    "status_check_failed",
                    obj(&[
                        ("run_id", v_str(run_id)),
                        ("attempt", json!(attempt)),
                        ("error", v_str(&err.to_string())),
                    ]),
                );
            }
        }
    }

    log(
        Level::Warn,
        Domain::Poll,
        "poll_budget_exhausted",
        obj(&[
            ("run_id", v_str(run_id)),
            ("max_attempts", json!(budget.max_attempts)),
        ]),
    );
    PollOutcome::TimedOut
}

fn error_detail(err: &Value) -> String {
    match err.as_str() {
        Some(s) => s.to_string(),
        None => err.to_string(),
    }
}
