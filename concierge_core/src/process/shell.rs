//! Local shell command execution, with optional stdout streaming and stdin
//! injection for the WebSocket gateway.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use bytes::Bytes;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, AsyncBufReadExt};
use tokio::sync::mpsc;

use crate::config::{ShellCommand, SocketRawMode};
use crate::error::ConciergeError;
use crate::placeholder::literal_expand_str;

use super::{ProcessRegistry, ProcessResult, StreamFrame};

const ABORT_GRACE: Duration = Duration::from_secs(5);
const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];
const JPEG_EOI: [u8; 2] = [0xFF, 0xD9];

/// Executes a [`ShellCommand`] against a single host.
pub struct ShellProcess;

impl ShellProcess {
    /// Spawns, optionally streams, and waits for a shell command.
    ///
    /// `registry` tracks the process under `(task_id, hostname)` for the
    /// duration of the call so that a concurrent abort or stdin-injection
    /// request can reach it. `stream_tx`, if present, receives output frames
    /// per `cmd.socket_raw_mode` as they're produced.
    pub async fn run(
        cmd: &ShellCommand,
        task_id: &str,
        hostname: &str,
        params: &HashMap<String, Value>,
        registry: &ProcessRegistry,
        stream_tx: Option<mpsc::UnboundedSender<StreamFrame>>,
    ) -> ProcessResult {
        let program = literal_expand_str(&cmd.command, hostname, params);
        let args: Vec<String> = cmd
            .arguments
            .iter()
            .map(|a| literal_expand_str(a, hostname, params))
            .collect();

        let mut builder = tokio::process::Command::new(&program);
        builder
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        builder.stdin(if cmd.socket_raw_stdin { Stdio::piped() } else { Stdio::null() });

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            builder.process_group(0);
        }

        let mut child = match builder.spawn() {
            Ok(c) => c,
            Err(e) => return ProcessResult::failed(ConciergeError::ProcessSpawnFailed(e.to_string()).to_string(), None, String::new(), String::new()),
        };

        let pid = child.id();
        let stdin_tx = if cmd.socket_raw_stdin {
            let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
            if let Some(mut stdin) = child.stdin.take() {
                tokio::spawn(async move {
                    while let Some(chunk) = rx.recv().await {
                        if stdin.write_all(&chunk).await.is_err() {
                            break;
                        }
                    }
                });
            }
            Some(tx)
        } else {
            None
        };

        let cancel = registry.register(task_id, hostname, stdin_tx, pid);

        let stdout = child.stdout.take().expect("stdout piped");
        let stderr = child.stderr.take().expect("stderr piped");

        let stdout_task = spawn_stdout_reader(stdout, cmd.socket_raw_mode, stream_tx.clone());
        let stderr_task = tokio::spawn(async move {
            let mut reader = stderr;
            let mut buf = String::new();
            let mut raw = Vec::new();
            let _ = reader.read_to_end(&mut raw).await;
            buf.push_str(&String::from_utf8_lossy(&raw));
            buf
        });

        let wait_bound = cmd.timeout.wait_duration();

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => WaitOutcome::Aborted,
            res = wait_with_bound(&mut child, wait_bound) => res,
        };

        registry.remove(task_id, hostname);

        let stdout_text = stdout_task.await.unwrap_or_default();
        let stderr_text = stderr_task.await.unwrap_or_default();

        match outcome {
            WaitOutcome::Exited(status) => {
                let code = status.code();
                if status.success() {
                    ProcessResult::ok(code, stdout_text, stderr_text)
                } else {
                    ProcessResult::failed(
                        ConciergeError::ProcessNonZeroExit(code.unwrap_or(-1)).to_string(),
                        code,
                        stdout_text,
                        stderr_text,
                    )
                }
            }
            WaitOutcome::TimedOut => {
                terminate(pid, &mut child).await;
                ProcessResult::failed(ConciergeError::Timeout.to_string(), None, stdout_text, stderr_text)
            }
            WaitOutcome::Aborted => {
                terminate(pid, &mut child).await;
                ProcessResult::failed(ConciergeError::Aborted.to_string(), None, stdout_text, stderr_text)
            }
        }
    }
}

enum WaitOutcome {
    Exited(std::process::ExitStatus),
    TimedOut,
    Aborted,
}

async fn wait_with_bound(child: &mut tokio::process::Child, bound: Option<Duration>) -> WaitOutcome {
    match bound {
        None => WaitOutcome::Exited(child.wait().await.unwrap_or_else(|_| default_exit_status())),
        Some(d) => match tokio::time::timeout(d, child.wait()).await {
            Ok(Ok(status)) => WaitOutcome::Exited(status),
            Ok(Err(_)) => WaitOutcome::Exited(default_exit_status()),
            Err(_) => WaitOutcome::TimedOut,
        },
    }
}

#[cfg(unix)]
fn default_exit_status() -> std::process::ExitStatus {
    use std::os::unix::process::ExitStatusExt;
    std::process::ExitStatus::from_raw(-1)
}

#[cfg(not(unix))]
fn default_exit_status() -> std::process::ExitStatus {
    std::process::Command::new("true").status().expect("trivial status")
}

/// Sends `SIGTERM` to the process group, waits out the grace period, then
/// escalates to `SIGKILL` if the child is still alive.
async fn terminate(pid: Option<u32>, child: &mut tokio::process::Child) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        unsafe {
            libc::kill(-(pid as i32), libc::SIGTERM);
        }
        if tokio::time::timeout(ABORT_GRACE, child.wait()).await.is_ok() {
            return;
        }
    }
    let _ = child.start_kill();
    let _ = child.wait().await;
}

fn spawn_stdout_reader(
    stdout: tokio::process::ChildStdout,
    mode: SocketRawMode,
    stream_tx: Option<mpsc::UnboundedSender<StreamFrame>>,
) -> tokio::task::JoinHandle<String> {
    tokio::spawn(async move {
        match mode {
            SocketRawMode::Disabled => {
                let mut buf = Vec::new();
                let mut reader = stdout;
                let _ = reader.read_to_end(&mut buf).await;
                String::from_utf8_lossy(&buf).into_owned()
            }
            SocketRawMode::Cli => {
                let mut reader = BufReader::new(stdout);
                let mut line = String::new();
                let mut collected = String::new();
                loop {
                    line.clear();
                    match reader.read_line(&mut line).await {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {
                            if let Some(tx) = &stream_tx {
                                let _ = tx.send(StreamFrame::Text(line.trim_end().to_string()));
                            }
                            collected.push_str(&line);
                        }
                    }
                }
                collected
            }
            SocketRawMode::JpegStream => {
                let mut reader = stdout;
                let mut buf = Vec::new();
                let mut chunk = [0u8; 8192];
                loop {
                    match reader.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            buf.extend_from_slice(&chunk[..n]);
                            extract_jpeg_frames(&mut buf, stream_tx.as_ref());
                        }
                    }
                }
                String::new()
            }
        }
    })
}

/// Scans `buf` for complete JPEG frames (SOI..EOI), emits each as a framed
/// binary message, and drops consumed bytes from the front of `buf`.
fn extract_jpeg_frames(buf: &mut Vec<u8>, stream_tx: Option<&mpsc::UnboundedSender<StreamFrame>>) {
    loop {
        let Some(start) = find_marker(buf, &JPEG_SOI, 0) else {
            buf.clear();
            return;
        };
        let Some(end) = find_marker(buf, &JPEG_EOI, start + 2) else {
            if start > 0 {
                buf.drain(..start);
            }
            return;
        };
        let frame_end = end + 2;
        let frame = &buf[start..frame_end];
        if let Some(tx) = stream_tx {
            let _ = tx.send(StreamFrame::Binary(frame_jpeg_message(frame)));
        }
        buf.drain(..frame_end);
    }
}

fn find_marker(buf: &[u8], marker: &[u8; 2], from: usize) -> Option<usize> {
    if from >= buf.len() {
        return None;
    }
    buf[from..].windows(2).position(|w| w == marker).map(|p| p + from)
}

/// Builds the `u32 be type_len | type bytes | u32 be data_len | data` wire
/// framing used for binary JPEG messages.
fn frame_jpeg_message(jpeg: &[u8]) -> Vec<u8> {
    const FRAME_TYPE: &[u8] = b"image/jpeg";
    let type_len = FRAME_TYPE.len() as u32;
    let data_len = jpeg.len() as u32;
    let mut out = Vec::with_capacity(4 + FRAME_TYPE.len() + 4 + jpeg.len());
    out.extend_from_slice(&type_len.to_be_bytes());
    out.extend_from_slice(FRAME_TYPE);
    out.extend_from_slice(&data_len.to_be_bytes());
    out.extend_from_slice(jpeg);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Timeout;
    use tokio::sync::mpsc;

    fn cmd(command: &str, args: &[&str], timeout: Timeout) -> ShellCommand {
        ShellCommand {
            name: "test".to_string(),
            command: command.to_string(),
            arguments: args.iter().map(|s| s.to_string()).collect(),
            timeout,
            socket_raw_mode: SocketRawMode::Disabled,
            socket_raw_stdin: false,
        }
    }

    #[tokio::test]
    async fn captures_stdout_on_success() {
        let registry = ProcessRegistry::new();
        let c = cmd("echo", &["hello"], Timeout::Sync(5));
        let result = ShellProcess::run(&c, "t1", "h1", &HashMap::new(), &registry, None).await;
        assert!(result.success);
        assert!(result.stdout.contains("hello"));
    }

    #[tokio::test]
    async fn nonzero_exit_is_failure() {
        let registry = ProcessRegistry::new();
        let c = cmd("sh", &["-c", "exit 3"], Timeout::Sync(5));
        let result = ShellProcess::run(&c, "t2", "h1", &HashMap::new(), &registry, None).await;
        assert!(!result.success);
        assert_eq!(result.exit_code, Some(3));
    }

    #[tokio::test]
    async fn timeout_marks_failure() {
        let registry = ProcessRegistry::new();
        let c = cmd("sleep", &["5"], Timeout::Sync(1));
        let result = ShellProcess::run(&c, "t3", "h1", &HashMap::new(), &registry, None).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("Timeout"));
    }

    #[tokio::test]
    async fn abort_terminates_process() {
        let registry = std::sync::Arc::new(ProcessRegistry::new());
        let c = cmd("sleep", &["30"], Timeout::Sync(0));
        let reg2 = registry.clone();
        let handle = tokio::spawn(async move { ShellProcess::run(&c, "t4", "h1", &HashMap::new(), &reg2, None).await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(registry.abort("t4", "h1"));
        let result = handle.await.unwrap();
        assert!(!result.success);
    }

    #[test]
    fn extracts_single_jpeg_frame() {
        let mut buf = vec![0x00, 0xFF, 0xD8, 0x01, 0x02, 0xFF, 0xD9, 0x00];
        let (tx, mut rx) = mpsc::unbounded_channel();
        extract_jpeg_frames(&mut buf, Some(&tx));
        let frame = rx.try_recv().unwrap();
        match frame {
            StreamFrame::Binary(bytes) => {
                assert_eq!(&bytes[0..4], &10u32.to_be_bytes());
                assert_eq!(&bytes[4..14], b"image/jpeg");
                assert_eq!(&bytes[14..18], &6u32.to_be_bytes());
                assert_eq!(&bytes[18..], &[0xFF, 0xD8, 0x01, 0x02, 0xFF, 0xD9][..]);
            }
            _ => panic!("expected binary frame"),
        }
    }
}
