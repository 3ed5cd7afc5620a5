//! Supervised child process
//!
//! Owns at most one long-lived subprocess (the cluster master), pipes
//! its combined stdout and stderr into a bounded ring of recent lines,
//! and reports start and exit through the engine event queue. The
//! child's death is a signal to the AM, not an error.

use std::collections::VecDeque;
use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::engine::EngineEvent;

/// Lines of combined output retained.
pub const DEFAULT_OUTPUT_LINES: usize = 64;

/// Grace period between a termination request and a forceful kill.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);

/// Error type for supervisor operations.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("a supervised process is already running")]
    AlreadyRunning,

    #[error("empty command")]
    EmptyCommand,

    #[error("spawn failed: {0}")]
    Spawn(std::io::Error),
}

struct Inner {
    pid: Option<u32>,
    exit: Option<watch::Receiver<Option<i32>>>,
}

/// Supervisor for one child process.
pub struct ProcessSupervisor {
    events: UnboundedSender<EngineEvent>,
    output: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
    grace: Duration,
    inner: Mutex<Inner>,
}

impl ProcessSupervisor {
    pub fn new(events: UnboundedSender<EngineEvent>) -> Self {
        Self::with_limits(events, DEFAULT_OUTPUT_LINES, DEFAULT_STOP_GRACE)
    }

    pub fn with_limits(
        events: UnboundedSender<EngineEvent>,
        capacity: usize,
        grace: Duration,
    ) -> Self {
        Self {
            events,
            output: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
            grace,
            inner: Mutex::new(Inner { pid: None, exit: None }),
        }
    }

    /// Whether a spawned child has not yet exited.
    pub fn is_running(&self) -> bool {
        let inner = self.inner.lock();
        matches!(&inner.exit, Some(rx) if rx.borrow().is_none())
    }

    /// Exit code of the last child, `None` until it terminates.
    pub fn exit_code(&self) -> Option<i32> {
        let inner = self.inner.lock();
        inner.exit.as_ref().and_then(|rx| *rx.borrow())
    }

    /// Up to the configured number of most recent output lines, in
    /// arrival order.
    pub fn recent_output(&self) -> Vec<String> {
        self.output.lock().iter().cloned().collect()
    }

    /// Spawn the child. Fails when a child is already live. The
    /// started event fires after the fork succeeds and before any
    /// output is read; the exited event fires exactly once per spawn.
    pub fn spawn(
        &self,
        command: &[String],
        env: &IndexMap<String, String>,
    ) -> Result<(), SupervisorError> {
        let (program, args) = command.split_first().ok_or(SupervisorError::EmptyCommand)?;

        let mut inner = self.inner.lock();
        if matches!(&inner.exit, Some(rx) if rx.borrow().is_none()) {
            return Err(SupervisorError::AlreadyRunning);
        }

        let mut child = Command::new(program)
            .args(args)
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(SupervisorError::Spawn)?;

        let pid = child.id();
        info!(program = %program, pid = ?pid, "spawned supervised process");

        let (exit_tx, exit_rx) = watch::channel(None);
        inner.pid = pid;
        inner.exit = Some(exit_rx);
        self.output.lock().clear();
        drop(inner);

        let _ = self.events.send(EngineEvent::MasterStarted);

        if let Some(stdout) = child.stdout.take() {
            self.spawn_reader(stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            self.spawn_reader(stderr);
        }

        let events = self.events.clone();
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status
                    .code()
                    .unwrap_or_else(|| status.signal().map(|s| -s).unwrap_or(-1)),
                Err(e) => {
                    warn!(error = %e, "waiting on supervised process failed");
                    -1
                }
            };
            info!(code, "supervised process exited");
            let _ = exit_tx.send(Some(code));
            let _ = events.send(EngineEvent::MasterExited(code));
        });

        Ok(())
    }

    fn spawn_reader<R>(&self, stream: R)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let output = self.output.clone();
        let capacity = self.capacity;
        tokio::spawn(async move {
            let mut lines = BufReader::new(stream).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let mut ring = output.lock();
                if ring.len() == capacity {
                    ring.pop_front();
                }
                ring.push_back(line);
            }
        });
    }

    /// Request graceful termination, escalating to a kill after the
    /// grace period. Idempotent; returns once the child has exited.
    pub async fn stop(&self) {
        let (pid, mut exit) = {
            let inner = self.inner.lock();
            match (&inner.pid, &inner.exit) {
                (Some(pid), Some(rx)) if rx.borrow().is_none() => (*pid, rx.clone()),
                _ => return,
            }
        };

        debug!(pid, "sending SIGTERM to supervised process");
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            debug!(pid, error = %e, "SIGTERM delivery failed");
        }

        if tokio::time::timeout(self.grace, exit.wait_for(|code| code.is_some()))
            .await
            .is_ok()
        {
            return;
        }

        warn!(pid, "supervised process ignored SIGTERM, killing");
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            debug!(pid, error = %e, "SIGKILL delivery failed");
        }
        let _ = tokio::time::timeout(Duration::from_secs(5), exit.wait_for(|code| code.is_some()))
            .await;
    }
}
