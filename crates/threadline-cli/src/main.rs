use std::collections::HashSet;

use anyhow::{Context, bail};
use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use threadline_sync::{ChatClient, ConnectionState, SyncConfig, ThreadView};
use threadline_types::events::ServerFrame;
use threadline_types::models::{Message, MessageId, Payload, ThreadId};

const HELP: &str = "\
commands:
  <text>               send a message
  /typing              tell the thread you are typing
  /structured k=v ...  send a structured message
  /read <id>           mark a message as seen
  /read-all            mark the whole thread read
  /flush               send pending read receipts now
  /hide | /show        simulate the window losing/regaining focus
  /reconnect           reconnect after the connection failed
  /quit";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "threadline_cli=info,threadline_sync=debug".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    // Config
    let token = std::env::var("THREADLINE_TOKEN").context("THREADLINE_TOKEN is not set")?;
    let thread_id: ThreadId = match std::env::args().nth(1) {
        Some(arg) => arg.parse().context("thread id must be a number")?,
        None => std::env::var("THREADLINE_THREAD_ID")
            .context("pass a thread id or set THREADLINE_THREAD_ID")?
            .parse()
            .context("THREADLINE_THREAD_ID must be a number")?,
    };
    let config = SyncConfig::from_env()?;

    let mut client = ChatClient::connect_with_token(config, token)?;
    let (mut frames, mut view) = {
        let session = client.open_thread(thread_id).await?;
        (session.frames(), session.view())
    };

    let initial = view.borrow_and_update().clone();
    let mut printed = HashSet::new();
    for msg in unseen_messages(&mut printed, &initial) {
        println!("{}", render(msg));
    }
    info!("thread {} loaded, {} unread", thread_id, initial.unread);
    println!("{}", HELP);

    let mut last = initial;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match run_command(&client, line.trim()).await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => eprintln!("error: {e:#}"),
                }
            }
            frame = frames.recv() => match frame {
                Ok(frame) => on_frame(&frame),
                Err(RecvError::Lagged(n)) => warn!("skipped {} frames", n),
                Err(RecvError::Closed) => break,
            },
            changed = view.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = view.borrow_and_update().clone();
                for msg in unseen_messages(&mut printed, &current) {
                    println!("{}", render(msg));
                    // Printed to the terminal counts as seen.
                    if let Some(session) = client.active() {
                        let _ = session.element_became_visible(msg.id);
                    }
                }
                report_changes(&last, &current);
                last = current;
            }
        }
    }

    client.close_active().await;
    Ok(())
}

/// Handle one stdin line. Returns false when the user quits.
async fn run_command(client: &ChatClient, line: &str) -> anyhow::Result<bool> {
    let Some(session) = client.active() else {
        bail!("no open thread");
    };

    let (cmd, rest) = line.split_once(' ').unwrap_or((line, ""));
    match cmd {
        "" => {}
        "/quit" => return Ok(false),
        "/help" => println!("{}", HELP),
        "/typing" => {
            session.notify_typing().await?;
        }
        "/structured" => session.send_structured(parse_fields(rest)?).await?,
        "/read" => {
            let id = rest.trim().parse::<MessageId>().context("usage: /read <message id>")?;
            session.element_became_visible(id)?;
        }
        "/read-all" => {
            let marked = client.mark_all_read().await?;
            println!("marked {} messages read", marked);
        }
        "/flush" => session.flush_reads()?,
        "/hide" => session.page_visibility_changed(false)?,
        "/show" => session.page_visibility_changed(true)?,
        "/reconnect" => session.reconnect()?,
        _ if cmd.starts_with('/') => bail!("unknown command {cmd}, try /help"),
        _ => session.send_text(line).await?,
    }
    Ok(true)
}

/// Receipts and server errors. Messages are rendered from the view.
fn on_frame(frame: &ServerFrame) {
    match frame {
        ServerFrame::Read { message_id, user, .. } => {
            println!("  ({} read #{})", user, message_id);
        }
        ServerFrame::Error { detail } => eprintln!("server error: {}", detail),
        _ => {}
    }
}

/// Messages in log order that have not been printed yet.
fn unseen_messages<'a>(printed: &mut HashSet<MessageId>, view: &'a ThreadView) -> Vec<&'a Message> {
    view.messages
        .iter()
        .filter(|msg| printed.insert(msg.id))
        .collect()
}

fn report_changes(last: &ThreadView, current: &ThreadView) {
    if last.state != current.state {
        println!("-- {}", current.state);
        if current.state == ConnectionState::Failed {
            println!("-- type /reconnect to try again");
        }
    }
    if last.error != current.error {
        if let Some(error) = &current.error {
            println!("!! {}", error);
        }
    }
    if last.online != current.online {
        println!("-- online: {}", current.online.join(", "));
    }
    if last.typing != current.typing && !current.typing.is_empty() {
        println!("-- {} typing...", current.typing.join(", "));
    }
    if last.unread != current.unread {
        info!("{} unread", current.unread);
    }
}

fn render(msg: &Message) -> String {
    let badge = if msg.is_admin { " [staff]" } else { "" };
    let body = match &msg.payload {
        Payload::Text(text) => text.clone(),
        Payload::Structured(fields) => fields
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(" "),
    };
    format!(
        "#{} {} {}{}: {}",
        msg.id,
        msg.created_at.format("%H:%M"),
        msg.sender,
        badge,
        body
    )
}

/// `k=v` pairs; values that parse as JSON keep their type.
fn parse_fields(raw: &str) -> anyhow::Result<Map<String, Value>> {
    let mut fields = Map::new();
    for pair in raw.split_whitespace() {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("expected key=value, got {pair}");
        };
        let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
        fields.insert(key.to_string(), value);
    }
    if fields.is_empty() {
        bail!("usage: /structured key=value ...");
    }
    Ok(fields)
}
