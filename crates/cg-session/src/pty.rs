use std::io::{Read as IoRead, Write as IoWrite};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use cg_runtime::CommandSpec;

use crate::lock_or_recover;

const READ_BUFFER: usize = 4096;
const CHANNEL_DEPTH: usize = 256;
/// Empty polls tolerated after the child exits before reporting EOF, so the
/// reader thread can drain whatever the shell printed last.
const EXIT_POLLS_BEFORE_EOF: u32 = 3;
const EXIT_POLL_STEP: Duration = Duration::from_millis(25);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum PtyError {
    #[error("pty spawn failed: {0}")]
    SpawnFailed(String),

    #[error("shell {0} is dead")]
    Dead(String),

    #[error("pty I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pty internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, PtyError>;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Outcome of a single non-blocking read attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    Data(Vec<u8>),
    WouldBlock,
    Eof,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShellStatus {
    Starting,
    Connected,
    Disconnected,
    Dead,
}

/// Why a bound connection was asked to let go of its shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetachReason {
    /// A newer connection took over.
    Superseded,
    /// The shell was closed through the API or by its session ending.
    ShellClosed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellInfo {
    pub shell_id: String,
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub status: ShellStatus,
}

struct BoundConn {
    conn_id: u64,
    stop: oneshot::Sender<DetachReason>,
    done: oneshot::Receiver<()>,
}

/// Held by the connection currently attached to a shell. Dropping it tells a
/// superseding connection (or a closing registry) that this one is finished.
pub struct Binding {
    conn_id: u64,
    stop: oneshot::Receiver<DetachReason>,
    _done: oneshot::Sender<()>,
}

impl Binding {
    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    /// Resolve when this binding is asked to stop. Await at most once.
    pub async fn stopped(&mut self) -> DetachReason {
        (&mut self.stop)
            .await
            .unwrap_or(DetachReason::ShellClosed)
    }
}

// ---------------------------------------------------------------------------
// ShellSession
// ---------------------------------------------------------------------------

/// One interactive shell attached to a PTY.
///
/// The master side is read by a dedicated thread that forwards chunks over a
/// bounded channel, and written by a second thread fed from another bounded
/// channel, so no async task ever blocks on the PTY fd. Callers poll output
/// with [`ShellSession::try_read`].
pub struct ShellSession {
    shell_id: String,
    session_id: String,
    created_at: DateTime<Utc>,
    pid: Option<u32>,
    status: Mutex<ShellStatus>,
    output: flume::Receiver<Vec<u8>>,
    input: Mutex<Option<flume::Sender<Vec<u8>>>>,
    child: Arc<Mutex<Box<dyn Child + Send + Sync>>>,
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    binding: Mutex<Option<BoundConn>>,
    next_conn: AtomicU64,
    exit_polls: AtomicU32,
    closed: AtomicBool,
    _reader_thread: Option<std::thread::JoinHandle<()>>,
    _writer_thread: Option<std::thread::JoinHandle<()>>,
}

impl ShellSession {
    /// Spawn `spec` on a fresh PTY of `rows` x `cols`.
    pub fn open(
        shell_id: impl Into<String>,
        session_id: impl Into<String>,
        spec: &CommandSpec,
        rows: u16,
        cols: u16,
    ) -> Result<Arc<Self>> {
        let shell_id = shell_id.into();
        let session_id = session_id.into();

        let pair = native_pty_system()
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;

        let mut command = CommandBuilder::new(&spec.program);
        for arg in &spec.args {
            command.arg(arg);
        }
        for (k, v) in &spec.env {
            command.env(k, v);
        }
        if let Some(cwd) = &spec.cwd {
            command.cwd(cwd);
        }

        let child = pair
            .slave
            .spawn_command(command)
            .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;
        // Only the child may hold the slave, otherwise the master never sees EOF.
        drop(pair.slave);
        let pid = child.process_id();

        debug!(%shell_id, program = %spec.program, args = ?spec.args, ?pid, "spawned shell");

        // -- output reader thread --
        let (read_tx, read_rx) = flume::bounded::<Vec<u8>>(CHANNEL_DEPTH);
        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;
        let reader_id = shell_id.clone();
        let reader_thread = std::thread::Builder::new()
            .name(format!("pty-read-{reader_id}"))
            .spawn(move || {
                let mut buf = [0u8; READ_BUFFER];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            if read_tx.send(buf[..n].to_vec()).is_err() {
                                break;
                            }
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            // EIO is what Linux reports once the slave side closes.
                            debug!(shell_id = %reader_id, "pty reader finished: {e}");
                            break;
                        }
                    }
                }
            })?;

        // -- input writer thread --
        let (write_tx, write_rx) = flume::bounded::<Vec<u8>>(CHANNEL_DEPTH);
        let mut writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;
        let writer_thread = std::thread::Builder::new()
            .name(format!("pty-write-{shell_id}"))
            .spawn(move || {
                while let Ok(data) = write_rx.recv() {
                    if writer.write_all(&data).is_err() {
                        break;
                    }
                    let _ = writer.flush();
                }
            })?;

        // Some shells stay silent until they see input.
        let _ = write_tx.try_send(b"\n".to_vec());

        info!(%shell_id, %session_id, ?pid, "shell opened");

        Ok(Arc::new(Self {
            shell_id,
            session_id,
            created_at: Utc::now(),
            pid,
            status: Mutex::new(ShellStatus::Starting),
            output: read_rx,
            input: Mutex::new(Some(write_tx)),
            child: Arc::new(Mutex::new(child)),
            master: Mutex::new(Some(pair.master)),
            binding: Mutex::new(None),
            next_conn: AtomicU64::new(0),
            exit_polls: AtomicU32::new(0),
            closed: AtomicBool::new(false),
            _reader_thread: Some(reader_thread),
            _writer_thread: Some(writer_thread),
        }))
    }

    pub fn shell_id(&self) -> &str {
        &self.shell_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Host pid of the process spawned on the PTY.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn status(&self) -> ShellStatus {
        *lock_or_recover(&self.status, "shell status")
    }

    /// Snapshot for listings; an exited process reads as `Dead` even before
    /// anything has polled its EOF.
    pub fn info(&self) -> ShellInfo {
        let status = if self.is_alive() {
            self.status()
        } else {
            ShellStatus::Dead
        };
        ShellInfo {
            shell_id: self.shell_id.clone(),
            session_id: self.session_id.clone(),
            created_at: self.created_at,
            status,
        }
    }

    fn set_status(&self, next: ShellStatus) {
        let mut status = lock_or_recover(&self.status, "shell status");
        if *status != ShellStatus::Dead && *status != next {
            debug!(shell_id = %self.shell_id, from = ?*status, to = ?next, "shell status");
            *status = next;
        }
    }

    fn mark_dead(&self) {
        let mut status = lock_or_recover(&self.status, "shell status");
        if *status != ShellStatus::Dead {
            info!(shell_id = %self.shell_id, "shell is dead");
            *status = ShellStatus::Dead;
        }
    }

    pub fn is_dead(&self) -> bool {
        self.status() == ShellStatus::Dead
    }

    /// Whether the spawned process is still running.
    pub fn is_alive(&self) -> bool {
        let mut child = lock_or_recover(&self.child, "shell child");
        matches!(child.try_wait(), Ok(None))
    }

    // -- I/O ----------------------------------------------------------------

    /// One non-blocking read attempt.
    pub fn try_read(&self) -> ReadOutcome {
        match self.output.try_recv() {
            Ok(chunk) => {
                self.exit_polls.store(0, Ordering::Relaxed);
                ReadOutcome::Data(chunk)
            }
            Err(flume::TryRecvError::Disconnected) => {
                self.mark_dead();
                ReadOutcome::Eof
            }
            Err(flume::TryRecvError::Empty) => {
                if self.closed.load(Ordering::SeqCst) {
                    return ReadOutcome::Eof;
                }
                if self.is_alive() {
                    return ReadOutcome::WouldBlock;
                }
                let polls = self.exit_polls.fetch_add(1, Ordering::Relaxed) + 1;
                if polls >= EXIT_POLLS_BEFORE_EOF {
                    self.mark_dead();
                    ReadOutcome::Eof
                } else {
                    ReadOutcome::WouldBlock
                }
            }
        }
    }

    /// Forward raw bytes to the shell. Waits when the input queue is full.
    pub async fn write(&self, data: Vec<u8>) -> Result<()> {
        let tx = lock_or_recover(&self.input, "shell input").clone();
        let Some(tx) = tx else {
            return Err(PtyError::Dead(self.shell_id.clone()));
        };
        if self.is_dead() {
            return Err(PtyError::Dead(self.shell_id.clone()));
        }
        tx.send_async(data).await.map_err(|_| {
            self.mark_dead();
            PtyError::Dead(self.shell_id.clone())
        })
    }

    pub fn resize(&self, rows: u16, cols: u16) -> Result<()> {
        let master = lock_or_recover(&self.master, "shell master");
        let Some(master) = master.as_ref() else {
            return Err(PtyError::Dead(self.shell_id.clone()));
        };
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::Internal(format!("resize failed: {e}")))?;
        debug!(shell_id = %self.shell_id, rows, cols, "PTY resized");
        Ok(())
    }

    // -- binding ------------------------------------------------------------

    /// Attach a new connection, asking any current one to stop with
    /// [`DetachReason::Superseded`] and waiting up to `wait` for it to finish.
    pub async fn bind(&self, wait: Duration) -> Binding {
        let conn_id = self.next_conn.fetch_add(1, Ordering::SeqCst) + 1;
        let (stop_tx, stop_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();

        let previous = lock_or_recover(&self.binding, "shell binding").replace(BoundConn {
            conn_id,
            stop: stop_tx,
            done: done_rx,
        });
        self.set_status(ShellStatus::Connected);

        if let Some(prev) = previous {
            info!(shell_id = %self.shell_id, old = prev.conn_id, new = conn_id, "superseding terminal connection");
            let _ = prev.stop.send(DetachReason::Superseded);
            if tokio::time::timeout(wait, prev.done).await.is_err() {
                warn!(shell_id = %self.shell_id, old = prev.conn_id, "superseded connection did not finish in time");
            }
        }

        Binding {
            conn_id,
            stop: stop_rx,
            _done: done_tx,
        }
    }

    /// Release the binding if `conn_id` still owns it.
    pub fn unbind(&self, conn_id: u64) -> bool {
        let mut slot = lock_or_recover(&self.binding, "shell binding");
        match slot.as_ref() {
            Some(bound) if bound.conn_id == conn_id => {
                slot.take();
                drop(slot);
                self.set_status(ShellStatus::Disconnected);
                debug!(shell_id = %self.shell_id, conn_id, "connection unbound");
                true
            }
            _ => false,
        }
    }

    pub fn bound_conn(&self) -> Option<u64> {
        lock_or_recover(&self.binding, "shell binding")
            .as_ref()
            .map(|b| b.conn_id)
    }

    /// Ask the bound connection (if any) to stop because the shell is going
    /// away, and wait up to `wait` for it to finish.
    pub async fn detach(&self, wait: Duration) {
        let bound = lock_or_recover(&self.binding, "shell binding").take();
        if let Some(bound) = bound {
            let _ = bound.stop.send(DetachReason::ShellClosed);
            if tokio::time::timeout(wait, bound.done).await.is_err() {
                warn!(shell_id = %self.shell_id, conn_id = bound.conn_id, "bridge did not finish before close");
            }
        }
    }

    // -- teardown -----------------------------------------------------------

    fn signal(&self, sig: libc::c_int) -> bool {
        match self.pid {
            // SAFETY: plain kill(2) on a pid this session spawned.
            Some(pid) => unsafe { libc::kill(pid as libc::pid_t, sig) == 0 },
            None => false,
        }
    }

    /// SIGTERM the shell, escalate to a kill after `grace`, then release the
    /// PTY. Safe to call any number of times.
    pub async fn close(&self, grace: Duration) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.mark_dead();
        // Dropping the only sender ends the writer thread.
        lock_or_recover(&self.input, "shell input").take();

        if self.is_alive() {
            self.signal(libc::SIGTERM);
            let deadline = tokio::time::Instant::now() + grace;
            while self.is_alive() && tokio::time::Instant::now() < deadline {
                tokio::time::sleep(EXIT_POLL_STEP).await;
            }
        }

        let child = Arc::clone(&self.child);
        let shell_id = self.shell_id.clone();
        let reaped = tokio::task::spawn_blocking(move || {
            let mut child = lock_or_recover(&child, "shell child");
            if matches!(child.try_wait(), Ok(None)) {
                warn!(%shell_id, "shell ignored SIGTERM, killing");
                if let Err(e) = child.kill() {
                    warn!(%shell_id, "kill failed: {e}");
                }
            }
            let _ = child.wait();
        })
        .await;
        if let Err(e) = reaped {
            warn!(shell_id = %self.shell_id, "reaper task failed: {e}");
        }

        lock_or_recover(&self.master, "shell master").take();
        info!(shell_id = %self.shell_id, "shell closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for ShellSession {
    fn drop(&mut self) {
        if self.closed.load(Ordering::SeqCst) || !self.is_alive() {
            return;
        }
        debug!(shell_id = %self.shell_id, "dropping live shell, killing");
        self.signal(libc::SIGKILL);
        // Reap off-thread so the killed child does not linger as a zombie.
        let child = Arc::clone(&self.child);
        let spawned = std::thread::Builder::new()
            .name(format!("pty-reap-{}", self.shell_id))
            .spawn(move || {
                let _ = lock_or_recover(&child, "shell child").wait();
            });
        if let Err(e) = spawned {
            warn!(shell_id = %self.shell_id, "could not start reaper thread: {e}");
        }
    }
}

impl std::fmt::Debug for ShellSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShellSession")
            .field("shell_id", &self.shell_id)
            .field("session_id", &self.session_id)
            .field("pid", &self.pid)
            .field("status", &self.status())
            .finish()
    }
}
