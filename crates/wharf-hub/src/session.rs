//! Session lifecycle and output fan-out.
//!
//! A session outlives any single transport connection. The backing process
//! (a PTY shell or a log follower) keeps running while clients come and
//! go; a replay buffer lets a reconnecting client catch up from the byte
//! offset it last saw.

use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use std::collections::{HashMap, VecDeque};
use std::io::{Read, Write};
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;
use wharf_core::{ControlFrame, OrchestratorError, SessionKind};

/// Bytes of recent output kept for replay on reconnect.
pub const REPLAY_BUFFER_BYTES: usize = 256 * 1024;
/// Per-attachment event queue depth.
pub const ATTACH_QUEUE_CAPACITY: usize = 256;
/// Queue depth at which a slow client is told the stream is paused.
pub const PAUSE_HIGH_WATER: usize = 192;
/// Queue depth at which a paused client is told the stream resumed.
pub const RESUME_LOW_WATER: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub reason: String,
    pub process_exit: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Output(Vec<u8>),
    Control(ControlFrame),
}

/// Recent output with a monotonically growing byte offset. `start_offset`
/// is the offset of the first retained byte; clearing the buffer keeps the
/// offset so cursors stay meaningful across a clear.
struct ReplayBuffer {
    data: VecDeque<u8>,
    start_offset: u64,
    capacity: usize,
}

impl ReplayBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            data: VecDeque::new(),
            start_offset: 0,
            capacity,
        }
    }

    fn end_offset(&self) -> u64 {
        self.start_offset + self.data.len() as u64
    }

    fn append(&mut self, bytes: &[u8]) {
        self.data.extend(bytes);
        while self.data.len() > self.capacity {
            self.data.pop_front();
            self.start_offset += 1;
        }
    }

    /// Bytes from `cursor` onward, or the whole buffer when the cursor is
    /// absent or already evicted. Returns the offset the returned bytes
    /// start at.
    fn since(&self, cursor: Option<u64>) -> (u64, Vec<u8>) {
        let from = match cursor {
            Some(cursor) if cursor >= self.start_offset && cursor <= self.end_offset() => cursor,
            _ => self.start_offset,
        };
        let skip = (from - self.start_offset) as usize;
        (from, self.data.iter().skip(skip).copied().collect())
    }

    fn clear(&mut self) {
        self.start_offset = self.end_offset();
        self.data.clear();
    }
}

/// Control surface of a backing process. Input and resize are rejected by
/// backings that do not support them.
pub trait BackingControl: Send + Sync {
    fn write_input(&self, bytes: &[u8]) -> Result<(), OrchestratorError>;
    fn resize(&self, cols: u16, rows: u16) -> Result<(), OrchestratorError>;
    fn terminate(&self);
}

/// A spawned backing process: its output stream plus its control surface.
pub struct Backing {
    pub output: mpsc::Receiver<Vec<u8>>,
    pub control: Arc<dyn BackingControl>,
}

pub struct SessionHandle {
    pub id: String,
    pub environment: String,
    pub kind: SessionKind,
    control: Arc<dyn BackingControl>,
    replay: Mutex<ReplayBuffer>,
    subscribers: Mutex<Vec<mpsc::Sender<SessionEvent>>>,
    closed_tx: watch::Sender<Option<CloseInfo>>,
}

/// One client's view of a session: catch-up bytes plus the live feed.
pub struct Attachment {
    pub session_id: String,
    pub backlog: Vec<u8>,
    pub offset: u64,
    pub events: mpsc::Receiver<SessionEvent>,
    pub closed: watch::Receiver<Option<CloseInfo>>,
}

impl SessionHandle {
    fn new(id: String, environment: String, kind: SessionKind, control: Arc<dyn BackingControl>) -> Self {
        let (closed_tx, _) = watch::channel(None);
        Self {
            id,
            environment,
            kind,
            control,
            replay: Mutex::new(ReplayBuffer::new(REPLAY_BUFFER_BYTES)),
            subscribers: Mutex::new(Vec::new()),
            closed_tx,
        }
    }

    fn lock_replay(&self) -> std::sync::MutexGuard<'_, ReplayBuffer> {
        self.replay
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_subscribers(&self) -> std::sync::MutexGuard<'_, Vec<mpsc::Sender<SessionEvent>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn attach(&self, cursor: Option<u64>) -> Attachment {
        let (tx, rx) = mpsc::channel(ATTACH_QUEUE_CAPACITY);
        let (offset, backlog) = self.lock_replay().since(cursor);
        self.lock_subscribers().push(tx);
        Attachment {
            session_id: self.id.clone(),
            backlog,
            offset,
            events: rx,
            closed: self.closed_tx.subscribe(),
        }
    }

    pub fn write_input(&self, bytes: &[u8]) -> Result<(), OrchestratorError> {
        self.control.write_input(bytes)
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), OrchestratorError> {
        if !self.kind.is_interactive() {
            return Err(OrchestratorError::PreconditionFailed(
                "resize applies to interactive sessions only".to_string(),
            ));
        }
        self.control.resize(cols, rows)
    }

    /// Reset the scrollback of a log session and tell every attached
    /// client to drop its local copy.
    pub async fn clear(&self) -> Result<(), OrchestratorError> {
        if self.kind.is_interactive() {
            return Err(OrchestratorError::PreconditionFailed(
                "clear applies to log sessions only".to_string(),
            ));
        }
        self.lock_replay().clear();
        self.broadcast(SessionEvent::Control(ControlFrame::Clear)).await;
        Ok(())
    }

    async fn broadcast(&self, event: SessionEvent) {
        // Snapshot under the lock, send outside it.
        let subscribers: Vec<_> = self.lock_subscribers().clone();
        let mut dead = false;
        for tx in &subscribers {
            if tx.send(event.clone()).await.is_err() {
                dead = true;
            }
        }
        if dead {
            self.lock_subscribers().retain(|tx| !tx.is_closed());
        }
    }

    fn finish(&self, info: CloseInfo) {
        let _ = self.closed_tx.send(Some(info));
    }
}

pub struct SessionManager {
    sessions: Mutex<HashMap<String, Arc<SessionHandle>>>,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn lock_sessions(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<SessionHandle>>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, id: &str) -> Option<Arc<SessionHandle>> {
        self.lock_sessions().get(id).cloned()
    }

    /// Open a session, resuming an existing one when the offered id names a
    /// live session for the same environment and kind. Returns the handle
    /// and whether it was resumed. The spawner runs only when a new backing
    /// process is needed.
    pub fn open<F>(
        self: &Arc<Self>,
        environment: &str,
        kind: SessionKind,
        offered_id: Option<&str>,
        spawn: F,
    ) -> Result<(Arc<SessionHandle>, bool), OrchestratorError>
    where
        F: FnOnce() -> Result<Backing, OrchestratorError>,
    {
        if let Some(offered) = offered_id {
            if let Some(existing) = self.get(offered) {
                if existing.environment == environment && existing.kind == kind {
                    debug!(event = "session_resumed", session_id = offered, environment);
                    return Ok((existing, true));
                }
                warn!(
                    event = "session_resume_mismatch",
                    session_id = offered,
                    offered_environment = environment,
                    actual_environment = %existing.environment
                );
            }
        }

        let backing = spawn()?;
        let id = Uuid::new_v4().to_string();
        let handle = Arc::new(SessionHandle::new(
            id.clone(),
            environment.to_string(),
            kind,
            backing.control,
        ));
        self.lock_sessions().insert(id.clone(), handle.clone());
        info!(event = "session_opened", session_id = %id, environment, kind = ?kind);

        let manager = Arc::clone(self);
        let pump_handle = handle.clone();
        let mut output = backing.output;
        tokio::spawn(async move {
            while let Some(chunk) = output.recv().await {
                pump_handle.lock_replay().append(&chunk);
                pump_handle.broadcast(SessionEvent::Output(chunk)).await;
            }
            // Output stream ended: the backing process is gone.
            manager.lock_sessions().remove(&pump_handle.id);
            info!(event = "session_process_exited", session_id = %pump_handle.id);
            pump_handle.finish(CloseInfo {
                reason: "process exited".to_string(),
                process_exit: true,
            });
        });

        Ok((handle, false))
    }

    /// Intentionally close a session, terminating its backing process.
    pub fn close(&self, id: &str) -> Result<(), OrchestratorError> {
        let handle = self
            .lock_sessions()
            .remove(id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("session {id}")))?;
        handle.control.terminate();
        handle.finish(CloseInfo {
            reason: "closed by operator".to_string(),
            process_exit: false,
        });
        info!(event = "session_closed", session_id = id);
        Ok(())
    }
}

/// Queue-depth crossings that warrant a pause or resume notification.
/// Returns the new paused state when it changes.
pub fn pause_transition(paused: bool, depth: usize) -> Option<bool> {
    if !paused && depth >= PAUSE_HIGH_WATER {
        Some(true)
    } else if paused && depth <= RESUME_LOW_WATER {
        Some(false)
    } else {
        None
    }
}

struct PtyControl {
    writer: Mutex<Box<dyn Write + Send>>,
    master: Mutex<Box<dyn MasterPty + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
}

impl BackingControl for PtyControl {
    fn write_input(&self, bytes: &[u8]) -> Result<(), OrchestratorError> {
        let mut writer = self
            .writer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        writer
            .write_all(bytes)
            .and_then(|_| writer.flush())
            .map_err(|err| OrchestratorError::Transport(format!("pty write failed: {err}")))
    }

    fn resize(&self, cols: u16, rows: u16) -> Result<(), OrchestratorError> {
        self.master
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|err| OrchestratorError::Transport(format!("pty resize failed: {err}")))
    }

    fn terminate(&self) {
        let _ = self
            .killer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .kill();
    }
}

/// Spawn a shell inside a fresh PTY rooted at the environment's worktree.
pub fn spawn_interactive(shell: &str, worktree: &Path) -> Result<Backing, OrchestratorError> {
    let pty = native_pty_system();
    let pair = pty
        .openpty(PtySize {
            rows: 24,
            cols: 80,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|err| OrchestratorError::Transport(format!("openpty failed: {err}")))?;

    let mut cmd = CommandBuilder::new(shell);
    cmd.cwd(worktree);
    let mut child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|err| OrchestratorError::Transport(format!("shell spawn failed: {err}")))?;
    let killer = child.clone_killer();

    let mut reader = pair
        .master
        .try_clone_reader()
        .map_err(|err| OrchestratorError::Transport(format!("pty reader failed: {err}")))?;
    let writer = pair
        .master
        .take_writer()
        .map_err(|err| OrchestratorError::Transport(format!("pty writer failed: {err}")))?;

    let (tx, rx) = mpsc::channel::<Vec<u8>>(64);
    std::thread::spawn(move || {
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
    });
    // The waiter owns the child so the PTY process gets reaped.
    std::thread::spawn(move || {
        let _ = child.wait();
    });

    Ok(Backing {
        output: rx,
        control: Arc::new(PtyControl {
            writer: Mutex::new(writer),
            master: Mutex::new(pair.master),
            killer: Mutex::new(killer),
        }),
    })
}

struct LogControl {
    child: Mutex<tokio::process::Child>,
}

impl BackingControl for LogControl {
    fn write_input(&self, _bytes: &[u8]) -> Result<(), OrchestratorError> {
        Err(OrchestratorError::PreconditionFailed(
            "log streams do not accept input".to_string(),
        ))
    }

    fn resize(&self, _cols: u16, _rows: u16) -> Result<(), OrchestratorError> {
        Err(OrchestratorError::PreconditionFailed(
            "log streams have no terminal".to_string(),
        ))
    }

    fn terminate(&self) {
        let _ = self
            .child
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .start_kill();
    }
}

/// Follow compose logs for one service, or all services when `service` is
/// absent.
pub fn spawn_log_stream(worktree: &Path, service: Option<&str>) -> Result<Backing, OrchestratorError> {
    let mut cmd = Command::new("docker");
    cmd.arg("compose")
        .arg("logs")
        .arg("--follow")
        .arg("--no-color");
    if let Some(service) = service {
        cmd.arg(service);
    }
    cmd.current_dir(worktree)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|err| OrchestratorError::Transport(format!("log follower spawn failed: {err}")))?;
    let stdout = child.stdout.take().ok_or_else(|| {
        OrchestratorError::Transport("log follower has no stdout".to_string())
    })?;
    let stderr = child.stderr.take();

    let (tx, rx) = mpsc::channel::<Vec<u8>>(64);
    tokio::spawn(pump_stream(stdout, tx.clone()));
    if let Some(stderr) = stderr {
        tokio::spawn(pump_stream(stderr, tx));
    }

    Ok(Backing {
        output: rx,
        control: Arc::new(LogControl {
            child: Mutex::new(child),
        }),
    })
}

async fn pump_stream<R>(mut reader: R, tx: mpsc::Sender<Vec<u8>>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    use tokio::io::AsyncReadExt;
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).await.is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingControl {
        input: Mutex<Vec<u8>>,
        resized: Mutex<Option<(u16, u16)>>,
        terminated: AtomicBool,
    }

    impl BackingControl for RecordingControl {
        fn write_input(&self, bytes: &[u8]) -> Result<(), OrchestratorError> {
            self.input.lock().unwrap().extend_from_slice(bytes);
            Ok(())
        }

        fn resize(&self, cols: u16, rows: u16) -> Result<(), OrchestratorError> {
            *self.resized.lock().unwrap() = Some((cols, rows));
            Ok(())
        }

        fn terminate(&self) {
            self.terminated.store(true, Ordering::SeqCst);
        }
    }

    fn synthetic_backing() -> (mpsc::Sender<Vec<u8>>, Arc<RecordingControl>, Backing) {
        let (tx, rx) = mpsc::channel(64);
        let control = Arc::new(RecordingControl::default());
        let backing = Backing {
            output: rx,
            control: control.clone(),
        };
        (tx, control, backing)
    }

    async fn next_output(events: &mut mpsc::Receiver<SessionEvent>) -> Vec<u8> {
        loop {
            match tokio::time::timeout(Duration::from_secs(1), events.recv())
                .await
                .expect("event within timeout")
                .expect("channel open")
            {
                SessionEvent::Output(bytes) => return bytes,
                SessionEvent::Control(_) => continue,
            }
        }
    }

    #[test]
    fn replay_buffer_tracks_offsets_across_eviction() {
        let mut buffer = ReplayBuffer::new(8);
        buffer.append(b"abcdefgh");
        assert_eq!(buffer.since(None), (0, b"abcdefgh".to_vec()));

        buffer.append(b"ij");
        assert_eq!(buffer.start_offset, 2);
        assert_eq!(buffer.since(None), (2, b"cdefghij".to_vec()));
        // A cursor inside the window resumes mid-stream.
        assert_eq!(buffer.since(Some(6)), (6, b"ghij".to_vec()));
        // An evicted cursor falls back to the whole window.
        assert_eq!(buffer.since(Some(0)), (2, b"cdefghij".to_vec()));
    }

    #[test]
    fn replay_buffer_clear_preserves_offset() {
        let mut buffer = ReplayBuffer::new(1024);
        buffer.append(b"hello");
        buffer.clear();
        assert_eq!(buffer.start_offset, 5);
        assert_eq!(buffer.since(None), (5, Vec::new()));
        buffer.append(b"x");
        assert_eq!(buffer.since(Some(5)), (5, b"x".to_vec()));
    }

    #[test]
    fn pause_transitions_fire_only_at_watermarks() {
        assert_eq!(pause_transition(false, 10), None);
        assert_eq!(pause_transition(false, PAUSE_HIGH_WATER), Some(true));
        assert_eq!(pause_transition(true, PAUSE_HIGH_WATER), None);
        assert_eq!(pause_transition(true, 100), None);
        assert_eq!(pause_transition(true, RESUME_LOW_WATER), Some(false));
        assert_eq!(pause_transition(false, RESUME_LOW_WATER), None);
    }

    #[tokio::test]
    async fn output_reaches_attached_client_and_replay() {
        let manager = Arc::new(SessionManager::new());
        let (tx, _control, backing) = synthetic_backing();
        let (handle, resumed) = manager
            .open("feature-a", SessionKind::Interactive, None, move || Ok(backing))
            .unwrap();
        assert!(!resumed);

        let mut attachment = handle.attach(None);
        assert!(attachment.backlog.is_empty());

        tx.send(b"$ ls\n".to_vec()).await.unwrap();
        assert_eq!(next_output(&mut attachment.events).await, b"$ ls\n");

        // A late attachment sees the same bytes as backlog.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let late = handle.attach(None);
        assert_eq!(late.backlog, b"$ ls\n");
        assert_eq!(late.offset, 0);
    }

    #[tokio::test]
    async fn resume_with_matching_id_reuses_backing() {
        let manager = Arc::new(SessionManager::new());
        let spawns = Arc::new(AtomicUsize::new(0));

        let (tx, _control, backing) = synthetic_backing();
        let counter = spawns.clone();
        let (first, resumed) = manager
            .open("feature-a", SessionKind::Interactive, None, move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(backing)
            })
            .unwrap();
        assert!(!resumed);

        tx.send(b"before drop\n".to_vec()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Client reconnects offering the same id.
        let counter = spawns.clone();
        let (second, resumed) = manager
            .open(
                "feature-a",
                SessionKind::Interactive,
                Some(&first.id),
                move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    panic!("resume must not respawn");
                },
            )
            .unwrap();
        assert!(resumed);
        assert_eq!(second.id, first.id);
        assert_eq!(spawns.load(Ordering::SeqCst), 1);

        // Replay covers output produced while disconnected.
        let attachment = second.attach(Some(0));
        assert_eq!(attachment.backlog, b"before drop\n");
    }

    #[tokio::test]
    async fn resume_with_mismatched_environment_spawns_fresh() {
        let manager = Arc::new(SessionManager::new());
        let (_tx, _control, backing) = synthetic_backing();
        let (first, _) = manager
            .open("feature-a", SessionKind::Interactive, None, move || Ok(backing))
            .unwrap();

        let (_tx2, _control2, backing2) = synthetic_backing();
        let (second, resumed) = manager
            .open(
                "feature-b",
                SessionKind::Interactive,
                Some(&first.id),
                move || Ok(backing2),
            )
            .unwrap();
        assert!(!resumed);
        assert_ne!(second.id, first.id);
    }

    #[tokio::test]
    async fn operator_close_terminates_and_reports_not_process_exit() {
        let manager = Arc::new(SessionManager::new());
        let (_tx, control, backing) = synthetic_backing();
        let (handle, _) = manager
            .open("feature-a", SessionKind::Interactive, None, move || Ok(backing))
            .unwrap();
        let mut closed = handle.attach(None).closed;

        manager.close(&handle.id).unwrap();
        assert!(control.terminated.load(Ordering::SeqCst));
        closed.changed().await.unwrap();
        let info = closed.borrow().clone().unwrap();
        assert!(!info.process_exit);
        assert!(manager.get(&handle.id).is_none());
    }

    #[tokio::test]
    async fn backing_exit_removes_session_and_reports_process_exit() {
        let manager = Arc::new(SessionManager::new());
        let (tx, _control, backing) = synthetic_backing();
        let (handle, _) = manager
            .open("feature-a", SessionKind::Interactive, None, move || Ok(backing))
            .unwrap();
        let mut closed = handle.attach(None).closed;

        drop(tx);
        closed.changed().await.unwrap();
        let info = closed.borrow().clone().unwrap();
        assert!(info.process_exit);
        assert!(manager.get(&handle.id).is_none());
    }

    #[tokio::test]
    async fn clear_resets_log_replay_and_notifies_clients() {
        let manager = Arc::new(SessionManager::new());
        let (tx, _control, backing) = synthetic_backing();
        let (handle, _) = manager
            .open("feature-a", SessionKind::LogStream, None, move || Ok(backing))
            .unwrap();
        let mut attachment = handle.attach(None);

        tx.send(b"old log line\n".to_vec()).await.unwrap();
        assert_eq!(next_output(&mut attachment.events).await, b"old log line\n");

        handle.clear().await.unwrap();
        let event = tokio::time::timeout(Duration::from_secs(1), attachment.events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, SessionEvent::Control(ControlFrame::Clear));
        assert!(handle.attach(None).backlog.is_empty());
    }

    #[tokio::test]
    async fn kind_gates_resize_and_clear() {
        let manager = Arc::new(SessionManager::new());
        let (_tx, control, backing) = synthetic_backing();
        let (interactive, _) = manager
            .open("feature-a", SessionKind::Interactive, None, move || Ok(backing))
            .unwrap();
        interactive.resize(120, 40).unwrap();
        assert_eq!(*control.resized.lock().unwrap(), Some((120, 40)));
        assert!(interactive.clear().await.is_err());

        let (_tx2, _control2, backing2) = synthetic_backing();
        let (logs, _) = manager
            .open("feature-a", SessionKind::LogStream, None, move || Ok(backing2))
            .unwrap();
        assert!(logs.resize(80, 24).is_err());
    }

    #[tokio::test]
    async fn input_routes_to_backing_control() {
        let manager = Arc::new(SessionManager::new());
        let (_tx, control, backing) = synthetic_backing();
        let (handle, _) = manager
            .open("feature-a", SessionKind::Interactive, None, move || Ok(backing))
            .unwrap();
        handle.write_input(b"echo hi\r").unwrap();
        assert_eq!(control.input.lock().unwrap().as_slice(), b"echo hi\r");
    }
}
