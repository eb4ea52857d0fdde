use std::collections::HashMap;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin};
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, warn};

use crate::error::{AgentboxError, Result};
use crate::supervisor::events::{EventBridge, SessionEvent};

/// Coalescing window for stdout/stderr before an event is emitted. Bounds
/// event-delivery rate to the host without adding meaningful latency.
const OUTPUT_FLUSH_DEBOUNCE: Duration = Duration::from_millis(25);

/// A chatty worker flushes early rather than growing the buffer unbounded
/// while the debounce timer keeps restarting.
const OUTPUT_FLUSH_BYTES: usize = 64 * 1024;

/// Live processes keyed by caller-supplied id. Owned by the supervisor;
/// the exit handler clears its own entry.
pub(crate) type LiveMap = Arc<Mutex<HashMap<String, Arc<ProcessSession>>>>;

/// Lifecycle of one worker process.
///
/// Ready is entered on the first byte of stdout or stderr; the workload has
/// no explicit ready signal, so first output stands in for the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Starting,
    Ready,
    Exited,
}

struct StdinWrite {
    payload: Vec<u8>,
    ack: oneshot::Sender<bool>,
}

struct Shared {
    id: String,
    phase: Mutex<Phase>,
    changed: Notify,
    bridge: Arc<EventBridge>,
}

impl Shared {
    fn phase(&self) -> Phase {
        *self.phase.lock().expect("phase lock poisoned")
    }

    /// First-output handshake: flips Starting to Ready exactly once and
    /// announces the guest connection before the write queue is released.
    async fn mark_ready(&self) {
        let flipped = {
            let mut phase = self.phase.lock().expect("phase lock poisoned");
            if *phase == Phase::Starting {
                *phase = Phase::Ready;
                true
            } else {
                false
            }
        };
        if flipped {
            self.bridge
                .emit(SessionEvent::GuestConnection {
                    id: self.id.clone(),
                    connected: true,
                })
                .await;
            self.changed.notify_waiters();
        }
    }

    fn set_exited(&self) {
        *self.phase.lock().expect("phase lock poisoned") = Phase::Exited;
        self.changed.notify_waiters();
    }

    async fn wait_past_starting(&self) -> Phase {
        loop {
            let notified = self.changed.notified();
            let phase = self.phase();
            if phase != Phase::Starting {
                return phase;
            }
            notified.await;
        }
    }

    async fn wait_exited(&self) {
        loop {
            let notified = self.changed.notified();
            if self.phase() == Phase::Exited {
                return;
            }
            notified.await;
        }
    }
}

/// One spawned worker process: owns the OS handle and its stdio exclusively,
/// queues stdin writes until the handshake, and reports exit through the
/// event bridge.
pub struct ProcessSession {
    id: String,
    session: String,
    pid: u32,
    started_at: DateTime<Utc>,
    shared: Arc<Shared>,
    stdin_tx: mpsc::UnboundedSender<StdinWrite>,
}

/// Point-in-time view of a live process for the status interface.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessStatus {
    pub id: String,
    pub session: String,
    pub pid: u32,
    pub phase: Phase,
    pub connected: bool,
    pub started_at: DateTime<Utc>,
}

impl ProcessSession {
    /// Wire up a freshly spawned child: register it in the live map and
    /// start the stdio pump and exit tasks.
    pub(crate) fn start(
        id: String,
        session: String,
        mut child: Child,
        bridge: Arc<EventBridge>,
        live: LiveMap,
    ) -> Result<Arc<Self>> {
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AgentboxError::Spawn("worker stdin was not piped".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentboxError::Spawn("worker stdout was not piped".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AgentboxError::Spawn("worker stderr was not piped".to_string()))?;
        let pid = child.id().unwrap_or(0);

        let shared = Arc::new(Shared {
            id: id.clone(),
            phase: Mutex::new(Phase::Starting),
            changed: Notify::new(),
            bridge,
        });
        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();

        let process = Arc::new(Self {
            id: id.clone(),
            session,
            pid,
            started_at: Utc::now(),
            shared: shared.clone(),
            stdin_tx,
        });
        live.lock()
            .expect("live-process map poisoned")
            .insert(id.clone(), process.clone());

        let stdout_task = tokio::spawn(pump_output(stdout, shared.clone(), false));
        let stderr_task = tokio::spawn(pump_output(stderr, shared.clone(), true));
        tokio::spawn(pump_stdin(stdin, stdin_rx, shared.clone()));

        let this = process.clone();
        tokio::spawn(async move {
            let status = child.wait().await;
            // Readers drain to EOF and flush their final partial buffers
            // before the exit event goes out.
            let _ = stdout_task.await;
            let _ = stderr_task.await;

            let (code, signal) = match &status {
                Ok(status) => (
                    status.code().unwrap_or(0),
                    status.signal().map(signal_name).unwrap_or_default(),
                ),
                Err(_) => (-1, String::new()),
            };

            shared.set_exited();
            {
                let mut live = live.lock().expect("live-process map poisoned");
                if live.get(&id).is_some_and(|p| Arc::ptr_eq(p, &this)) {
                    live.remove(&id);
                }
            }

            if let Err(e) = status {
                shared
                    .bridge
                    .emit(SessionEvent::Error {
                        id: id.clone(),
                        message: format!("waiting for worker failed: {e}"),
                    })
                    .await;
            }
            debug!(id = %id, code, signal = %signal, "Worker exited");
            shared
                .bridge
                .emit(SessionEvent::Exit { id, code, signal })
                .await;
        });

        Ok(process)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn phase(&self) -> Phase {
        self.shared.phase()
    }

    pub fn is_connected(&self) -> bool {
        self.phase() == Phase::Ready
    }

    pub fn status(&self) -> ProcessStatus {
        ProcessStatus {
            id: self.id.clone(),
            session: self.session.clone(),
            pid: self.pid,
            phase: self.phase(),
            connected: self.is_connected(),
            started_at: self.started_at,
        }
    }

    /// Queue a stdin write. Resolves true once the bytes reached the pipe;
    /// false when the process has exited or the pipe broke underneath an
    /// in-flight write.
    pub async fn write_stdin(&self, payload: Vec<u8>) -> bool {
        if self.phase() == Phase::Exited {
            return false;
        }
        let (ack, done) = oneshot::channel();
        if self.stdin_tx.send(StdinWrite { payload, ack }).is_err() {
            return false;
        }
        done.await.unwrap_or(false)
    }

    /// Signal the worker. Fire-and-forget; the exit handler does the real
    /// teardown when the OS reports it.
    pub fn kill(&self, signal: i32) {
        if self.pid == 0 || self.phase() == Phase::Exited {
            return;
        }
        let rc = unsafe { libc::kill(self.pid as libc::pid_t, signal) };
        if rc != 0 {
            debug!(id = %self.id, pid = self.pid, signal, "kill(2) failed (already gone?)");
        }
    }
}

/// Read one output stream to EOF, coalescing chunks behind a short debounce
/// and marking the handshake on the first byte.
async fn pump_output(mut stream: impl AsyncRead + Unpin, shared: Arc<Shared>, is_stderr: bool) {
    let mut chunk = [0u8; 8192];
    let mut pending: Vec<u8> = Vec::new();
    loop {
        tokio::select! {
            read = stream.read(&mut chunk) => match read {
                Ok(0) => break,
                Ok(n) => {
                    shared.mark_ready().await;
                    pending.extend_from_slice(&chunk[..n]);
                    if pending.len() >= OUTPUT_FLUSH_BYTES {
                        flush_output(&shared, is_stderr, &mut pending).await;
                    }
                }
                Err(e) => {
                    debug!(id = %shared.id, error = %e, "Output stream read failed");
                    break;
                }
            },
            _ = tokio::time::sleep(OUTPUT_FLUSH_DEBOUNCE), if !pending.is_empty() => {
                flush_output(&shared, is_stderr, &mut pending).await;
            }
        }
    }
    // Final partial buffer always goes out, debounce timer or not.
    if !pending.is_empty() {
        flush_output(&shared, is_stderr, &mut pending).await;
    }
}

async fn flush_output(shared: &Shared, is_stderr: bool, pending: &mut Vec<u8>) {
    let data = String::from_utf8_lossy(pending).into_owned();
    pending.clear();
    let id = shared.id.clone();
    let event = if is_stderr {
        SessionEvent::Stderr { id, data }
    } else {
        SessionEvent::Stdout { id, data }
    };
    shared.bridge.emit(event).await;
}

/// Single consumer of the stdin queue. Gated on the handshake so writes
/// issued while Starting reach the pipe in FIFO order only after Ready.
async fn pump_stdin(
    mut stdin: ChildStdin,
    mut queue: mpsc::UnboundedReceiver<StdinWrite>,
    shared: Arc<Shared>,
) {
    if shared.wait_past_starting().await == Phase::Exited {
        drain_queue(&mut queue);
        return;
    }
    loop {
        tokio::select! {
            write = queue.recv() => match write {
                None => break,
                Some(write) => {
                    let ok = if shared.phase() == Phase::Exited {
                        false
                    } else {
                        deliver(&mut stdin, &write.payload, &shared.id).await
                    };
                    let _ = write.ack.send(ok);
                }
            },
            _ = shared.wait_exited() => break,
        }
    }
    drain_queue(&mut queue);
}

/// write_all + flush against the child pipe; the OS buffer provides the
/// backpressure, no buffering is added on top.
async fn deliver(stdin: &mut ChildStdin, payload: &[u8], id: &str) -> bool {
    let result = match stdin.write_all(payload).await {
        Ok(()) => stdin.flush().await,
        Err(e) => Err(e),
    };
    match result {
        Ok(()) => true,
        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
            // Expected when a write was in flight as the worker died.
            debug!(id = %id, "stdin pipe closed by exited worker");
            false
        }
        Err(e) => {
            warn!(id = %id, error = %e, "stdin write failed");
            false
        }
    }
}

fn drain_queue(queue: &mut mpsc::UnboundedReceiver<StdinWrite>) {
    queue.close();
    while let Ok(write) = queue.try_recv() {
        let _ = write.ack.send(false);
    }
}

fn signal_name(signal: i32) -> String {
    match signal {
        libc::SIGHUP => "SIGHUP".to_string(),
        libc::SIGINT => "SIGINT".to_string(),
        libc::SIGQUIT => "SIGQUIT".to_string(),
        libc::SIGKILL => "SIGKILL".to_string(),
        libc::SIGTERM => "SIGTERM".to_string(),
        libc::SIGSEGV => "SIGSEGV".to_string(),
        libc::SIGPIPE => "SIGPIPE".to_string(),
        other => format!("SIG{other}"),
    }
}
