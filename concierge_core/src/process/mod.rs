//! Process execution: shell children and outbound HTTP requests.
//!
//! Both [`shell::ShellProcess`] and [`http::HttpClientProcess`] produce the
//! same [`ProcessResult`] shape so [`crate::task::TaskDispatcher`] can treat
//! them uniformly when folding per-host outcomes into a [`crate::task::Task`].
//!
//! Running processes are tracked in a [`ProcessRegistry`] keyed by
//! `(task_id, hostname)` — the "process arena" from the design notes. A
//! single arena (rather than one table per command kind) means abort and
//! stdin-injection requests only need one lookup path regardless of which
//! kind of process backs a given task/host pair.

pub mod http;
pub mod shell;

use std::collections::HashMap;
use std::sync::Mutex;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use http::HttpClientProcess;
pub use shell::ShellProcess;

/// The outcome of running a single command against a single host.
#[derive(Debug, Clone)]
pub struct ProcessResult {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub error: Option<String>,
}

impl ProcessResult {
    fn ok(exit_code: Option<i32>, stdout: String, stderr: String) -> Self {
        Self {
            success: true,
            exit_code,
            stdout,
            stderr,
            error: None,
        }
    }

    fn failed(error: impl Into<String>, exit_code: Option<i32>, stdout: String, stderr: String) -> Self {
        Self {
            success: false,
            exit_code,
            stdout,
            stderr,
            error: Some(error.into()),
        }
    }
}

/// A frame pushed to a streaming WebSocket client while a process runs.
#[derive(Debug, Clone)]
pub enum StreamFrame {
    /// A line of output in `cli` streaming mode.
    Text(String),
    /// A complete extracted JPEG frame (already length-prefixed) in `jpeg_stream` mode.
    Binary(Vec<u8>),
}

/// A live process's cancellation handle, its pid (for signal delivery on
/// unix), and, if `socket_raw_stdin` is set, a channel for forwarding
/// inbound WebSocket bytes to its stdin.
struct ProcessHandle {
    cancel: CancellationToken,
    pid: Option<u32>,
    stdin_tx: Option<mpsc::UnboundedSender<Bytes>>,
}

/// Tracks every in-flight process so it can be aborted or fed stdin by
/// `(task_id, hostname)` without the caller needing to know which command
/// kind is backing it.
#[derive(Default)]
pub struct ProcessRegistry {
    inner: Mutex<HashMap<(String, String), ProcessHandle>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new process and returns the token it should watch for cancellation.
    fn register(
        &self,
        task_id: &str,
        hostname: &str,
        stdin_tx: Option<mpsc::UnboundedSender<Bytes>>,
        pid: Option<u32>,
    ) -> CancellationToken {
        let cancel = CancellationToken::new();
        self.inner.lock().expect("registry lock poisoned").insert(
            (task_id.to_string(), hostname.to_string()),
            ProcessHandle {
                cancel: cancel.clone(),
                pid,
                stdin_tx,
            },
        );
        cancel
    }

    /// Drops the bookkeeping entry for a completed process. Does not itself cancel anything.
    fn remove(&self, task_id: &str, hostname: &str) {
        self.inner
            .lock()
            .expect("registry lock poisoned")
            .remove(&(task_id.to_string(), hostname.to_string()));
    }

    /// Requests cancellation of the process at `(task_id, hostname)`. Returns
    /// `false` if no such process is currently registered.
    pub fn abort(&self, task_id: &str, hostname: &str) -> bool {
        match self
            .inner
            .lock()
            .expect("registry lock poisoned")
            .get(&(task_id.to_string(), hostname.to_string()))
        {
            Some(handle) => {
                handle.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Forwards `data` to the process's stdin, if it accepts stdin input.
    /// Returns `false` if no such process is registered or it has no stdin channel.
    pub fn send_stdin(&self, task_id: &str, hostname: &str, data: Bytes) -> bool {
        match self
            .inner
            .lock()
            .expect("registry lock poisoned")
            .get(&(task_id.to_string(), hostname.to_string()))
        {
            Some(handle) => match &handle.stdin_tx {
                Some(tx) => tx.send(data).is_ok(),
                None => false,
            },
            None => false,
        }
    }

    /// Whether a process is currently registered for `(task_id, hostname)`.
    pub fn is_running(&self, task_id: &str, hostname: &str) -> bool {
        self.inner
            .lock()
            .expect("registry lock poisoned")
            .contains_key(&(task_id.to_string(), hostname.to_string()))
    }

    /// Delivers a signal to the process group at `(task_id, hostname)`.
    /// Returns `false` if no such process is registered or it has no pid
    /// (not yet spawned, or spawned on a platform without process groups).
    #[cfg(unix)]
    pub fn signal(&self, task_id: &str, hostname: &str, sig: i32) -> bool {
        match self
            .inner
            .lock()
            .expect("registry lock poisoned")
            .get(&(task_id.to_string(), hostname.to_string()))
        {
            Some(handle) => match handle.pid {
                Some(pid) => {
                    unsafe { libc::kill(-(pid as i32), sig) };
                    true
                }
                None => false,
            },
            None => false,
        }
    }

    #[cfg(not(unix))]
    pub fn signal(&self, _task_id: &str, _hostname: &str, _sig: i32) -> bool {
        false
    }

    /// Closes the stdin pipe of the process at `(task_id, hostname)` by
    /// dropping the registry's sender half. The forwarder task sees its
    /// channel close, exits, and drops the owned `ChildStdin`, which sends
    /// EOF to the child without touching the process itself.
    /// Returns `false` if no such process is registered or it has no stdin channel.
    pub fn close_stdin(&self, task_id: &str, hostname: &str) -> bool {
        match self
            .inner
            .lock()
            .expect("registry lock poisoned")
            .get_mut(&(task_id.to_string(), hostname.to_string()))
        {
            Some(handle) => handle.stdin_tx.take().is_some(),
            None => false,
        }
    }
}
