//! Terminal client for orchestrator sessions.
//!
//! Attaches the local terminal to a session on the hub, reconnecting with
//! exponential backoff when the transport drops without a close frame. The
//! session id is persisted so a restart of this client resumes the same
//! backing process.

use anyhow::{bail, Context, Result};
use clap::Parser;
use crossterm::terminal;
use futures_util::{SinkExt, StreamExt};
use std::io::Write;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;
use url::Url;
use wharf_core::backoff::{ReconnectPolicy, ReconnectState, SessionPhase};
use wharf_core::{classify, encode_control, ChannelPayload, ControlFrame, SessionKind};

#[derive(Parser, Debug)]
#[command(name = "wharf-attach")]
struct Args {
    /// Environment to attach to.
    environment: String,
    #[arg(long, default_value = "")]
    hub: String,
    /// interactive, log-stream or combined-log-stream.
    #[arg(long, default_value = "interactive")]
    kind: String,
    /// Service whose logs to follow (log-stream only).
    #[arg(long)]
    service: Option<String>,
    #[arg(long, default_value = "")]
    state_dir: String,
}

enum ConnectionEnd {
    /// Server said the session is over; do not reconnect.
    Closed { reason: String, process_exit: bool },
    /// Local stdin ended; the session stays alive on the hub.
    Detached,
    /// Abnormal transport drop; eligible for reconnect.
    Dropped,
}

#[tokio::main]
async fn main() {
    // Terminal data owns stdout; diagnostics go to stderr.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(std::env::var("WHARF_LOG").unwrap_or_else(|_| "warn".to_string())));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Err(err) = run(Args::parse()).await {
        eprintln!("wharf-attach: {err:#}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let kind = parse_kind(&args.kind)?;
    if kind == SessionKind::LogStream && args.service.is_none() {
        bail!("--service is required for log-stream sessions");
    }
    let url = hub_url(&args.hub)?;
    let store = SessionStore::new(resolve_state_dir(&args.state_dir), &args.environment, kind);
    let mut session_id = store.load();
    let mut cursor: u64 = 0;

    let _raw = if kind.is_interactive() {
        Some(RawModeGuard::enable()?)
    } else {
        None
    };

    // Stdin only feeds interactive sessions; log viewers keep the channel
    // open but idle.
    let (stdin_tx, mut stdin_rx) = mpsc::channel::<Vec<u8>>(64);
    let _stdin_keepalive = if kind.is_interactive() {
        spawn_stdin_reader(stdin_tx);
        None
    } else {
        Some(stdin_tx)
    };
    let mut resize_rx = spawn_resize_watcher();

    let policy = ReconnectPolicy::default();
    let mut reconnect = ReconnectState::new(policy);
    loop {
        let end = run_connection(
            &url,
            &args.environment,
            kind,
            args.service.as_deref(),
            &mut session_id,
            &mut cursor,
            &mut reconnect,
            &mut stdin_rx,
            &mut resize_rx,
        )
        .await;
        match end {
            Ok(ConnectionEnd::Closed {
                reason,
                process_exit,
            }) => {
                store.clear();
                if process_exit {
                    eprintln!("\r\nsession ended: {reason}");
                } else {
                    eprintln!("\r\nsession closed: {reason}");
                }
                return Ok(());
            }
            Ok(ConnectionEnd::Detached) => {
                if let Some(id) = &session_id {
                    store.save(id);
                }
                eprintln!("\r\ndetached, session stays live");
                return Ok(());
            }
            Ok(ConnectionEnd::Dropped) | Err(_) => {
                if let Some(id) = &session_id {
                    store.save(id);
                }
                match reconnect.next_attempt() {
                    Some(delay) => {
                        let attempt = match reconnect.phase() {
                            SessionPhase::Reconnecting { attempt } => attempt,
                            _ => 0,
                        };
                        warn!(event = "transport_dropped", attempt, delay_secs = delay.as_secs());
                        eprintln!(
                            "\r\n{}",
                            reconnect_notice(attempt, policy.max_attempts, delay)
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => bail!("connection lost and reconnect attempts exhausted"),
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_connection(
    url: &Url,
    environment: &str,
    kind: SessionKind,
    service: Option<&str>,
    session_id: &mut Option<String>,
    cursor: &mut u64,
    reconnect: &mut ReconnectState,
    stdin_rx: &mut mpsc::Receiver<Vec<u8>>,
    resize_rx: &mut mpsc::Receiver<(u16, u16)>,
) -> Result<ConnectionEnd> {
    let (mut ws, _) = connect_async(url.clone())
        .await
        .context("hub connection failed")?;
    debug!(event = "hub_connected", url = %url);

    let hello = encode_control(&ControlFrame::Hello {
        environment: environment.to_string(),
        kind,
        service: service.map(str::to_string),
        session_id: session_id.clone(),
        cursor: Some(*cursor),
    })?;
    ws.send(Message::Text(hello)).await.context("hello send failed")?;
    if kind.is_interactive() {
        if let Ok((cols, rows)) = terminal::size() {
            let resize = encode_control(&ControlFrame::Resize { cols, rows })?;
            let _ = ws.send(Message::Text(resize)).await;
        }
    }

    loop {
        tokio::select! {
            inbound = ws.next() => {
                let msg = match inbound {
                    Some(Ok(msg)) => msg,
                    _ => return Ok(ConnectionEnd::Dropped),
                };
                let data = match msg {
                    Message::Text(text) => text.into_bytes(),
                    Message::Binary(bytes) => bytes,
                    Message::Close(_) => return Ok(ConnectionEnd::Dropped),
                    _ => continue,
                };
                match classify(&data) {
                    ChannelPayload::Output(bytes) => {
                        write_output(bytes)?;
                        *cursor += bytes.len() as u64;
                    }
                    ChannelPayload::Control(ControlFrame::Session { session_id: id }) => {
                        *session_id = Some(id);
                        reconnect.connected();
                    }
                    ChannelPayload::Control(ControlFrame::Status { message, .. }) => {
                        eprintln!("\r\n[hub] {message}");
                    }
                    ChannelPayload::Control(ControlFrame::Clear) => {
                        write_output(b"\x1b[2J\x1b[1;1H")?;
                    }
                    ChannelPayload::Control(ControlFrame::Closed { reason, process_exit }) => {
                        reconnect.close();
                        return Ok(ConnectionEnd::Closed { reason, process_exit });
                    }
                    ChannelPayload::Control(frame) => {
                        debug!(event = "unexpected_control", frame = ?frame);
                    }
                }
            }
            input = stdin_rx.recv() => {
                match input {
                    Some(bytes) => {
                        if ws.send(Message::Binary(bytes)).await.is_err() {
                            return Ok(ConnectionEnd::Dropped);
                        }
                    }
                    None => {
                        let _ = ws.close(None).await;
                        return Ok(ConnectionEnd::Detached);
                    }
                }
            }
            size = resize_rx.recv() => {
                if let Some((cols, rows)) = size {
                    let resize = encode_control(&ControlFrame::Resize { cols, rows })?;
                    if ws.send(Message::Text(resize)).await.is_err() {
                        return Ok(ConnectionEnd::Dropped);
                    }
                }
            }
        }
    }
}

fn reconnect_notice(attempt: u32, max_attempts: u32, delay: std::time::Duration) -> String {
    format!(
        "connection lost, reconnecting (attempt {attempt}/{max_attempts}) in {}s",
        delay.as_secs()
    )
}

fn write_output(bytes: &[u8]) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(bytes)?;
    stdout.flush()?;
    Ok(())
}

fn spawn_stdin_reader(tx: mpsc::Sender<Vec<u8>>) {
    tokio::task::spawn_blocking(move || {
        use std::io::Read;
        let mut stdin = std::io::stdin();
        let mut buffer = [0u8; 4096];
        loop {
            match stdin.read(&mut buffer) {
                Ok(0) | Err(_) => break,
                Ok(count) => {
                    if tx.blocking_send(buffer[..count].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
    });
}

#[cfg(unix)]
fn spawn_resize_watcher() -> mpsc::Receiver<(u16, u16)> {
    let (tx, rx) = mpsc::channel(8);
    tokio::spawn(async move {
        let mut winch = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::window_change()) {
            Ok(signal) => signal,
            Err(_) => return,
        };
        while winch.recv().await.is_some() {
            if let Ok((cols, rows)) = terminal::size() {
                if tx.send((cols, rows)).await.is_err() {
                    return;
                }
            }
        }
    });
    rx
}

#[cfg(not(unix))]
fn spawn_resize_watcher() -> mpsc::Receiver<(u16, u16)> {
    let (_tx, rx) = mpsc::channel(8);
    std::mem::forget(_tx);
    rx
}

struct RawModeGuard;

impl RawModeGuard {
    fn enable() -> Result<Self> {
        terminal::enable_raw_mode().context("raw mode unavailable")?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
    }
}

/// Persists the session id so a restarted client resumes instead of
/// spawning a second shell.
struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    fn new(dir: PathBuf, environment: &str, kind: SessionKind) -> Self {
        Self {
            path: dir.join(format!("attach-{environment}-{kind}.session")),
        }
    }

    fn load(&self) -> Option<String> {
        let raw = std::fs::read_to_string(&self.path).ok()?;
        let id = raw.trim().to_string();
        if id.is_empty() {
            None
        } else {
            Some(id)
        }
    }

    fn save(&self, id: &str) {
        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let _ = std::fs::write(&self.path, id);
    }

    fn clear(&self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn parse_kind(raw: &str) -> Result<SessionKind> {
    match raw.trim() {
        "interactive" => Ok(SessionKind::Interactive),
        "log-stream" => Ok(SessionKind::LogStream),
        "combined-log-stream" => Ok(SessionKind::CombinedLogStream),
        other => bail!("unknown session kind '{other}'"),
    }
}

fn hub_url(flag: &str) -> Result<Url> {
    let raw = if !flag.trim().is_empty() {
        flag.to_string()
    } else if let Ok(addr) = std::env::var("WHARF_ADDR") {
        format!("ws://{addr}/ws")
    } else {
        "ws://127.0.0.1:9800/ws".to_string()
    };
    Url::parse(&raw).with_context(|| format!("invalid hub url '{raw}'"))
}

fn resolve_state_dir(flag: &str) -> PathBuf {
    if !flag.trim().is_empty() {
        return PathBuf::from(flag);
    }
    if let Ok(value) = std::env::var("WHARF_DATA_DIR") {
        if !value.trim().is_empty() {
            return PathBuf::from(value);
        }
    }
    std::env::var("HOME")
        .map(|home| PathBuf::from(home).join(".wharf"))
        .unwrap_or_else(|_| PathBuf::from(".wharf"))
}
