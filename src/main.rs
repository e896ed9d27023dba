use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use fxdesk::client::AgentClient;
use fxdesk::config::Config;
use fxdesk::logging::{log, obj, v_str, Domain, Level};
use fxdesk::session::{ChatService, TurnOutcome};

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::from_env();
    let client = AgentClient::new(&cfg)?;
    let service = ChatService::new(Arc::new(client), &cfg);

    log(
        Level::Info,
        Domain::System,
        "desk_started",
        obj(&[("poll_max_attempts", serde_json::json!(cfg.poll_max_attempts))]),
    );

    let mut session = service.create_session();
    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    stdout
        .write_all(b"fxdesk ready. /new /sessions /views /outputs /hydrate /quit\n> ")
        .await?;
    stdout.flush().await?;

    while let Some(line) = lines.next_line().await? {
        let input = line.trim();
        match input {
            "" => {}
            "/quit" => break,
            "/new" => {
                session = service.create_session();
                stdout
                    .write_all(format!("session {}\n", session.id).as_bytes())
                    .await?;
            }
            "/sessions" => {
                for s in service.sessions() {
                    stdout
                        .write_all(
                            format!(
                                "{}  {}  ({} messages){}\n",
                                s.id,
                                s.title,
                                s.messages.len(),
                                if s.has_unviewed_results { "  *" } else { "" }
                            )
                            .as_bytes(),
                        )
                        .await?;
                }
            }
            "/views" => {
                let views = service.market_views();
                for v in &views.directional_views {
                    stdout
                        .write_all(
                            format!(
                                "{}  {:?}  {:?}  conf {}\n",
                                v.currency_pair, v.direction, v.timeframe, v.confidence
                            )
                            .as_bytes(),
                        )
                        .await?;
                }
                for v in &views.macro_views {
                    stdout
                        .write_all(format!("{}  {:?}\n", v.topic, v.outlook).as_bytes())
                        .await?;
                }
            }
            "/outputs" => {
                if let Some(s) = service.session(&session.id) {
                    for output in &s.analysis_outputs {
                        stdout
                            .write_all(
                                format!("{}  {}\n", output.title, output.description).as_bytes(),
                            )
                            .await?;
                    }
                    service.mark_viewed(&session.id);
                }
            }
            "/hydrate" => {
                let thread = service.session(&session.id).and_then(|s| s.thread_id);
                match service.fetch_graph_state(thread.as_deref()).await {
                    Ok(_) => stdout.write_all(b"views refreshed\n").await?,
                    Err(err) => {
                        stdout
                            .write_all(format!("hydrate failed: {err:#}\n").as_bytes())
                            .await?
                    }
                }
            }
            text => match service.send_message(&session.id, text).await {
                Ok(result) => {
                    stdout
                        .write_all(format!("{}\n", result.assistant_text).as_bytes())
                        .await?;
                    if let TurnOutcome::Failed { detail } = &result.outcome {
                        log(
                            Level::Warn,
                            Domain::System,
                            "turn_failed",
                            obj(&[("detail", v_str(detail))]),
                        );
                    }
                }
                Err(err) => {
                    stdout
                        .write_all(format!("cannot send: {err}\n").as_bytes())
                        .await?
                }
            },
        }
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;
    }

    Ok(())
}
