//! HTTP and WebSocket surface of the orchestrator.

use crate::catalog::BranchCatalog;
use crate::discovery::Discovery;
use crate::map_registry;
use crate::providers::{ContainerProvider, GitProvider};
use crate::safety::{DiskProbe, OperationRequest, SafetyGate};
use crate::session::{
    pause_transition, spawn_interactive, spawn_log_stream, SessionEvent, SessionManager,
};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path as AxumPath, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use wharf_core::{
    encode_control, ChannelPayload, ControlFrame, EnvironmentName, OrchestratorError, SessionKind,
};
use wharf_storage::PortRegistry;

#[derive(Clone, Debug)]
pub struct HubConfig {
    pub repo_root: PathBuf,
    pub shell: String,
}

pub struct Hub<G, C, D> {
    pub config: HubConfig,
    pub registry: Arc<PortRegistry>,
    pub catalog: BranchCatalog<G>,
    pub discovery: Discovery<G, C>,
    pub gate: SafetyGate<D>,
    pub sessions: Arc<SessionManager>,
}

/// HTTP status for each orchestrator error kind.
fn error_status(err: &OrchestratorError) -> StatusCode {
    match err {
        OrchestratorError::NotFound(_) => StatusCode::NOT_FOUND,
        OrchestratorError::AlreadyManaged(_)
        | OrchestratorError::Conflict(_)
        | OrchestratorError::PortExhausted(_) => StatusCode::CONFLICT,
        OrchestratorError::PreconditionFailed(_) => StatusCode::BAD_REQUEST,
        OrchestratorError::RemoteUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        OrchestratorError::Transport(_) | OrchestratorError::ProcessExit(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

struct ApiError(OrchestratorError);

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = error_status(&self.0);
        let body = serde_json::json!({
            "error": self.0.kind(),
            "message": self.0.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

pub fn router<G, C, D>(hub: Arc<Hub<G, C, D>>) -> Router
where
    G: GitProvider + 'static,
    C: ContainerProvider + 'static,
    D: DiskProbe + 'static,
{
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/ws", get(ws_handler::<G, C, D>))
        .route("/api/branches", get(list_branches::<G, C, D>))
        .route("/api/environments", get(list_environments::<G, C, D>))
        .route("/api/discovery", get(list_candidates::<G, C, D>))
        .route("/api/import/:name", post(import_environment::<G, C, D>))
        .route("/api/safety/validate", post(validate_operation::<G, C, D>))
        .route("/api/sessions/:id/close", post(close_session::<G, C, D>))
        .with_state(hub)
}

#[derive(Debug, Default, Deserialize)]
struct BranchQuery {
    #[serde(default)]
    refresh: bool,
}

async fn list_branches<G, C, D>(
    State(hub): State<Arc<Hub<G, C, D>>>,
    Query(query): Query<BranchQuery>,
) -> Result<impl IntoResponse, ApiError>
where
    G: GitProvider,
    C: ContainerProvider,
    D: DiskProbe,
{
    let bound = bound_branches(&hub.registry)?;
    let listing = hub.catalog.list_available(&bound, query.refresh).await?;
    Ok(Json(listing))
}

/// Branches already bound to a registered environment.
fn bound_branches(registry: &PortRegistry) -> Result<HashSet<String>, OrchestratorError> {
    Ok(registry
        .list_environments()
        .map_err(map_registry)?
        .into_iter()
        .map(|env| env.branch)
        .collect())
}

async fn list_environments<G, C, D>(
    State(hub): State<Arc<Hub<G, C, D>>>,
) -> Result<impl IntoResponse, ApiError>
where
    G: GitProvider,
    C: ContainerProvider,
    D: DiskProbe,
{
    let environments = hub.registry.list_environments().map_err(map_registry)?;
    Ok(Json(environments))
}

async fn list_candidates<G, C, D>(
    State(hub): State<Arc<Hub<G, C, D>>>,
) -> Result<impl IntoResponse, ApiError>
where
    G: GitProvider,
    C: ContainerProvider,
    D: DiskProbe,
{
    let candidates = hub.discovery.discover_unmanaged().await?;
    Ok(Json(candidates))
}

async fn import_environment<G, C, D>(
    State(hub): State<Arc<Hub<G, C, D>>>,
    AxumPath(name): AxumPath<String>,
) -> Result<impl IntoResponse, ApiError>
where
    G: GitProvider,
    C: ContainerProvider,
    D: DiskProbe,
{
    let environment = hub.discovery.import_environment(&name).await?;
    Ok(Json(environment))
}

/// Operator-initiated close: terminates the backing process and notifies
/// every attached client with a terminal `closed` frame.
async fn close_session<G, C, D>(
    State(hub): State<Arc<Hub<G, C, D>>>,
    AxumPath(id): AxumPath<String>,
) -> Result<impl IntoResponse, ApiError>
where
    G: GitProvider,
    C: ContainerProvider,
    D: DiskProbe,
{
    hub.sessions.close(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn validate_operation<G, C, D>(
    State(hub): State<Arc<Hub<G, C, D>>>,
    Json(request): Json<OperationRequest>,
) -> Result<impl IntoResponse, ApiError>
where
    G: GitProvider,
    C: ContainerProvider,
    D: DiskProbe,
{
    Ok(Json(hub.gate.validate(&request)))
}

async fn ws_handler<G, C, D>(
    ws: WebSocketUpgrade,
    State(hub): State<Arc<Hub<G, C, D>>>,
) -> impl IntoResponse
where
    G: GitProvider + 'static,
    C: ContainerProvider + 'static,
    D: DiskProbe + 'static,
{
    ws.on_upgrade(move |socket| async move {
        handle_socket(hub, socket).await;
    })
}

async fn handle_socket<G, C, D>(hub: Arc<Hub<G, C, D>>, socket: WebSocket)
where
    G: GitProvider,
    C: ContainerProvider,
    D: DiskProbe,
{
    use futures_util::{SinkExt, StreamExt};

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(256);
    let write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_sender.send(msg).await.is_err() {
                return;
            }
        }
    });

    // The first frame must be a hello; anything else ends the channel.
    let first = match ws_receiver.next().await {
        Some(Ok(msg)) => msg,
        _ => return,
    };
    let data = match message_bytes(first) {
        Some(bytes) => bytes,
        None => return,
    };
    let (environment, kind, service, offered_id, cursor) = match wharf_core::classify(&data) {
        ChannelPayload::Control(ControlFrame::Hello {
            environment,
            kind,
            service,
            session_id,
            cursor,
        }) => (environment, kind, service, session_id, cursor),
        _ => {
            warn!(event = "handshake_invalid");
            return;
        }
    };

    let handshake = open_session(&hub, &environment, kind, service.as_deref(), offered_id.as_deref());
    let handle = match handshake {
        Ok(handle) => handle,
        Err(err) => {
            warn!(event = "handshake_rejected", environment = %environment, error = %err);
            send_control(
                &tx,
                &ControlFrame::Closed {
                    reason: err.to_string(),
                    process_exit: false,
                },
            )
            .await;
            let _ = tx.send(Message::Close(None)).await;
            drop(tx);
            let _ = write_task.await;
            return;
        }
    };

    let mut attachment = handle.attach(cursor);
    send_control(
        &tx,
        &ControlFrame::Session {
            session_id: attachment.session_id.clone(),
        },
    )
    .await;
    if !attachment.backlog.is_empty() {
        let _ = tx.send(Message::Binary(attachment.backlog.clone())).await;
    }

    let mut paused = false;
    loop {
        tokio::select! {
            event = attachment.events.recv() => {
                match event {
                    Some(SessionEvent::Output(bytes)) => {
                        if tx.send(Message::Binary(bytes)).await.is_err() {
                            break;
                        }
                    }
                    Some(SessionEvent::Control(frame)) => {
                        send_control(&tx, &frame).await;
                    }
                    None => break,
                }
                if let Some(now_paused) = pause_transition(paused, attachment.events.len()) {
                    paused = now_paused;
                    let message = if paused {
                        "client falling behind, output paused"
                    } else {
                        "output resumed"
                    };
                    send_control(&tx, &ControlFrame::Status { paused, message: message.to_string() }).await;
                }
            }
            changed = attachment.closed.changed() => {
                if changed.is_err() {
                    break;
                }
                let info = attachment.closed.borrow().clone();
                if let Some(info) = info {
                    send_control(
                        &tx,
                        &ControlFrame::Closed {
                            reason: info.reason,
                            process_exit: info.process_exit,
                        },
                    )
                    .await;
                    let _ = tx.send(Message::Close(None)).await;
                    break;
                }
            }
            inbound = ws_receiver.next() => {
                let msg = match inbound {
                    Some(Ok(msg)) => msg,
                    // Transport drop: the session stays alive for resume.
                    _ => break,
                };
                let data = match msg {
                    Message::Text(text) => text.into_bytes(),
                    Message::Binary(bytes) => bytes,
                    Message::Close(_) => break,
                    Message::Ping(_) | Message::Pong(_) => continue,
                };
                match wharf_core::classify(&data) {
                    ChannelPayload::Control(ControlFrame::Resize { cols, rows }) => {
                        if let Err(err) = handle.resize(cols, rows) {
                            warn!(event = "resize_rejected", session_id = %handle.id, error = %err);
                        }
                    }
                    ChannelPayload::Control(ControlFrame::Clear) => {
                        if let Err(err) = handle.clear().await {
                            warn!(event = "clear_rejected", session_id = %handle.id, error = %err);
                        }
                    }
                    ChannelPayload::Control(frame) => {
                        warn!(event = "unexpected_control", session_id = %handle.id, frame = ?frame);
                    }
                    ChannelPayload::Output(bytes) => {
                        if kind.is_interactive() {
                            if let Err(err) = handle.write_input(bytes) {
                                warn!(event = "input_failed", session_id = %handle.id, error = %err);
                                break;
                            }
                        }
                    }
                }
            }
        }
    }

    info!(event = "channel_detached", session_id = %handle.id);
    drop(tx);
    let _ = write_task.await;
}

fn open_session<G, C, D>(
    hub: &Arc<Hub<G, C, D>>,
    environment: &str,
    kind: SessionKind,
    service: Option<&str>,
    offered_id: Option<&str>,
) -> Result<Arc<crate::session::SessionHandle>, OrchestratorError>
where
    G: GitProvider,
    C: ContainerProvider,
    D: DiskProbe,
{
    let name: EnvironmentName = environment.parse()?;
    let env = hub
        .registry
        .get_environment(&name)
        .map_err(map_registry)?
        .ok_or_else(|| OrchestratorError::NotFound(format!("environment {name}")))?;
    if kind == SessionKind::LogStream && service.is_none() {
        return Err(OrchestratorError::PreconditionFailed(
            "log-stream sessions require a service".to_string(),
        ));
    }

    let shell = hub.config.shell.clone();
    let worktree = env.worktree_path.clone();
    let service = service.map(str::to_string);
    let (handle, resumed) = hub.sessions.open(name.as_str(), kind, offered_id, move || {
        match kind {
            SessionKind::Interactive => spawn_interactive(&shell, &worktree),
            SessionKind::LogStream => spawn_log_stream(&worktree, service.as_deref()),
            SessionKind::CombinedLogStream => spawn_log_stream(&worktree, None),
        }
    })?;
    if resumed {
        info!(event = "session_resumed_over_ws", session_id = %handle.id);
    }
    Ok(handle)
}

async fn send_control(tx: &mpsc::Sender<Message>, frame: &ControlFrame) {
    if let Ok(text) = encode_control(frame) {
        let _ = tx.send(Message::Text(text)).await;
    }
}

fn message_bytes(msg: Message) -> Option<Vec<u8>> {
    match msg {
        Message::Text(text) => Some(text.into_bytes()),
        Message::Binary(bytes) => Some(bytes),
        Message::Close(_) | Message::Ping(_) | Message::Pong(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Backing, BackingControl};
    use crate::testing::{MockDocker, MockGit};

    struct StaticProbe;

    impl DiskProbe for StaticProbe {
        fn available_space(&self, _path: &std::path::Path) -> std::io::Result<u64> {
            Ok(u64::MAX)
        }
    }

    fn test_hub() -> Arc<Hub<MockGit, MockDocker, StaticProbe>> {
        let registry = Arc::new(PortRegistry::open_in_memory().unwrap());
        let git = Arc::new(MockGit::default());
        let docker = Arc::new(MockDocker::default());
        Arc::new(Hub {
            config: HubConfig {
                repo_root: PathBuf::from("/repo"),
                shell: "/bin/sh".to_string(),
            },
            registry: Arc::clone(&registry),
            catalog: BranchCatalog::new(Arc::clone(&git)),
            discovery: Discovery::new(git, docker, registry, PathBuf::from("/repo")),
            gate: SafetyGate::with_probe(StaticProbe),
            sessions: Arc::new(SessionManager::new()),
        })
    }

    struct NoopControl;

    impl BackingControl for NoopControl {
        fn write_input(&self, _bytes: &[u8]) -> Result<(), OrchestratorError> {
            Ok(())
        }

        fn resize(&self, _cols: u16, _rows: u16) -> Result<(), OrchestratorError> {
            Ok(())
        }

        fn terminate(&self) {}
    }

    #[tokio::test]
    async fn close_endpoint_ends_sessions_and_rejects_unknown_ids() {
        let hub = test_hub();
        let (_tx, rx) = mpsc::channel(8);
        let backing = Backing {
            output: rx,
            control: Arc::new(NoopControl),
        };
        let (handle, _) = hub
            .sessions
            .open("feature-a", SessionKind::Interactive, None, move || Ok(backing))
            .unwrap();
        let mut closed = handle.attach(None).closed;

        let response = close_session(State(Arc::clone(&hub)), AxumPath(handle.id.clone())).await;
        assert!(response.is_ok());
        closed.changed().await.unwrap();
        let info = closed.borrow().clone().unwrap();
        assert!(!info.process_exit);
        assert!(hub.sessions.get(&handle.id).is_none());

        let missing = close_session(State(hub), AxumPath("ghost".to_string())).await;
        assert!(matches!(
            missing,
            Err(ApiError(OrchestratorError::NotFound(_)))
        ));
    }

    #[test]
    fn error_kinds_map_to_expected_statuses() {
        assert_eq!(
            error_status(&OrchestratorError::NotFound("x".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            error_status(&OrchestratorError::AlreadyManaged("x".into())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            error_status(&OrchestratorError::PortExhausted("x".into())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            error_status(&OrchestratorError::PreconditionFailed("x".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            error_status(&OrchestratorError::RemoteUnavailable("x".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            error_status(&OrchestratorError::Transport("x".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn bound_branches_reflect_registered_environments() {
        use wharf_core::{Environment, EnvironmentStatus};

        let registry = PortRegistry::open_in_memory().unwrap();
        registry
            .insert_environment(&Environment {
                name: "feature-a".parse().unwrap(),
                worktree_path: PathBuf::from("/tmp/wt-feature-a"),
                branch: "feature/a".to_string(),
                status: EnvironmentStatus::Managed,
                is_base: false,
                ports: Default::default(),
                containers: Vec::new(),
            })
            .unwrap();
        let bound = bound_branches(&registry).unwrap();
        assert!(bound.contains("feature/a"));
        assert!(!bound.contains("feature-a"));
    }
}
