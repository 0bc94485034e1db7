//! Connection handling and client routing for the streaming gateway.
//!
//! One TCP/TLS listener accepts every WebSocket connection; this module
//! does the per-connection handshake, then the frame read/write loop, and
//! keeps a [`ClientRegistry`] mapping `(task_id, hostname)` to every
//! currently-connected client so [`crate::process`] output can be pushed to
//! the right sockets without the process layer knowing anything about
//! WebSockets.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::error::ConciergeError;
use crate::process::{ProcessRegistry, StreamFrame};

use super::codec::{self, Frame, Opcode};
use super::token::TokenIssuer;

type ClientId = u64;

/// Tracks every connected streaming client by `(task_id, hostname)` so
/// output can be fanned out without a per-process registry of sockets.
#[derive(Default)]
pub struct ClientRegistry {
    inner: Mutex<HashMap<(String, String), Vec<(ClientId, mpsc::UnboundedSender<Vec<u8>>)>>>,
    next_id: AtomicU64,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, task_id: &str, hostname: &str, tx: mpsc::UnboundedSender<Vec<u8>>) -> ClientId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .lock()
            .expect("client registry lock poisoned")
            .entry((task_id.to_string(), hostname.to_string()))
            .or_default()
            .push((id, tx));
        id
    }

    fn unregister(&self, task_id: &str, hostname: &str, id: ClientId) {
        let mut guard = self.inner.lock().expect("client registry lock poisoned");
        if let Some(clients) = guard.get_mut(&(task_id.to_string(), hostname.to_string())) {
            clients.retain(|(cid, _)| *cid != id);
            if clients.is_empty() {
                guard.remove(&(task_id.to_string(), hostname.to_string()));
            }
        }
    }

    /// Pushes an already-encoded frame to every client watching `(task_id, hostname)`.
    pub fn send_to(&self, task_id: &str, hostname: &str, frame: Vec<u8>) -> usize {
        let guard = self.inner.lock().expect("client registry lock poisoned");
        let Some(clients) = guard.get(&(task_id.to_string(), hostname.to_string())) else {
            return 0;
        };
        clients.iter().filter(|(_, tx)| tx.send(frame.clone()).is_ok()).count()
    }

    /// Pushes a frame to every client watching any host under `task_id`.
    pub fn broadcast_status(&self, task_id: &str, frame: Vec<u8>) -> usize {
        let guard = self.inner.lock().expect("client registry lock poisoned");
        guard
            .iter()
            .filter(|((tid, _), _)| tid == task_id)
            .flat_map(|(_, clients)| clients.iter())
            .filter(|(_, tx)| tx.send(frame.clone()).is_ok())
            .count()
    }
}

/// Reads an HTTP/1.1 request's request line and headers (up to the blank
/// line) from `stream`, returning the raw text.
async fn read_request_head<S: AsyncRead + Unpin>(stream: &mut S) -> Result<String, ConciergeError> {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(ConciergeError::TokenInvalid("connection closed during handshake".to_string()));
        }
        buf.push(byte[0]);
        if buf.len() >= 4 && &buf[buf.len() - 4..] == b"\r\n\r\n" {
            break;
        }
        if buf.len() > 16 * 1024 {
            return Err(ConciergeError::TokenInvalid("handshake request too large".to_string()));
        }
    }
    String::from_utf8(buf).map_err(|e| ConciergeError::TokenInvalid(e.to_string()))
}

struct Handshake {
    task_id: String,
    hostname: String,
    token: String,
    client_key: String,
}

/// Parses `GET /concierge/api/v1/ws/{task_id}/{hostname}?token=... HTTP/1.1`
/// plus the `Sec-WebSocket-Key` header out of a raw request head.
fn parse_handshake(head: &str) -> Result<Handshake, ConciergeError> {
    let bad = || ConciergeError::TokenInvalid("malformed websocket handshake".to_string());

    let request_line = head.lines().next().ok_or_else(bad)?;
    let path = request_line.split_whitespace().nth(1).ok_or_else(bad)?;
    let (path, query) = path.split_once('?').unwrap_or((path, ""));

    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    let (task_id, hostname) = match segments.as_slice() {
        [.., task_id, hostname] if segments.len() >= 2 => (task_id.to_string(), hostname.to_string()),
        _ => return Err(bad()),
    };

    let token = query
        .split('&')
        .find_map(|kv| kv.strip_prefix("token="))
        .ok_or_else(bad)?
        .to_string();

    let client_key = codec::find_header(head, "Sec-WebSocket-Key").ok_or_else(bad)?.to_string();

    Ok(Handshake {
        task_id,
        hostname,
        token,
        client_key,
    })
}

/// Drives one WebSocket connection end to end: handshake, token
/// verification, then the read/write loop until the client disconnects or
/// sends a close frame.
pub async fn handle_connection<S>(
    mut stream: S,
    issuer: &TokenIssuer,
    registry: &ClientRegistry,
    process_registry: &ProcessRegistry,
    now: i64,
) -> Result<(), ConciergeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let head = read_request_head(&mut stream).await?;
    let handshake = parse_handshake(&head)?;
    let grant = issuer.verify(&handshake.token, &handshake.hostname, now)?;

    stream.write_all(codec::handshake_response(&handshake.client_key).as_bytes()).await?;

    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let client_id = registry.register(&grant.task_id, &grant.hostname, tx);

    let mut buf: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        tokio::select! {
            biased;
            outbound = rx.recv() => {
                match outbound {
                    Some(frame) => {
                        if stream.write_all(&frame).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            n = stream.read(&mut chunk) => {
                let n = match n {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                buf.extend_from_slice(&chunk[..n]);

                loop {
                    match codec::decode_frame(&buf) {
                        Ok(Some((frame, consumed))) => {
                            buf.drain(..consumed);
                            if !handle_inbound_frame(&frame, &grant, process_registry, &mut stream).await {
                                registry.unregister(&grant.task_id, &grant.hostname, client_id);
                                return Ok(());
                            }
                        }
                        Ok(None) => break,
                        Err(_) => {
                            registry.unregister(&grant.task_id, &grant.hostname, client_id);
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    registry.unregister(&grant.task_id, &grant.hostname, client_id);
    Ok(())
}

/// Handles one decoded inbound frame. Returns `false` if the connection
/// should now close.
async fn handle_inbound_frame<S: AsyncWrite + Unpin>(
    frame: &Frame,
    grant: &super::token::TokenGrant,
    process_registry: &ProcessRegistry,
    stream: &mut S,
) -> bool {
    match frame.opcode {
        Opcode::Close => {
            let _ = stream.write_all(&codec::encode_close()).await;
            false
        }
        Opcode::Ping => {
            let _ = stream.write_all(&codec::encode_pong(&frame.payload)).await;
            true
        }
        Opcode::Pong => true,
        Opcode::Text => {
            if !dispatch_control(&frame.payload, grant, process_registry) {
                process_registry.send_stdin(&grant.task_id, &grant.hostname, Bytes::from(frame.payload.clone()));
            }
            true
        }
        Opcode::Binary => {
            process_registry.send_stdin(&grant.task_id, &grant.hostname, Bytes::from(frame.payload.clone()));
            true
        }
        Opcode::Continuation => true,
    }
}

/// Recognizes a `{"type":"control","char":"C"|"D"|"Z"}` text frame and
/// routes it to the process signalled instead of forwarding it as stdin.
/// `C` sends `SIGINT`, `D` closes stdin, `Z` sends `SIGTSTP`. Returns
/// `false` for anything that isn't a recognized control message, so the
/// caller falls through to forwarding the payload verbatim.
fn dispatch_control(payload: &[u8], grant: &super::token::TokenGrant, process_registry: &ProcessRegistry) -> bool {
    let Ok(text) = std::str::from_utf8(payload) else { return false };
    let Ok(value) = serde_json::from_str::<serde_json::Value>(text) else { return false };
    if value.get("type").and_then(|v| v.as_str()) != Some("control") {
        return false;
    }
    match value.get("char").and_then(|v| v.as_str()) {
        #[cfg(unix)]
        Some("C") => process_registry.signal(&grant.task_id, &grant.hostname, libc::SIGINT),
        Some("D") => process_registry.close_stdin(&grant.task_id, &grant.hostname),
        #[cfg(unix)]
        Some("Z") => process_registry.signal(&grant.task_id, &grant.hostname, libc::SIGTSTP),
        _ => false,
    };
    true
}

/// Translates a process-level [`StreamFrame`] into an encoded WebSocket
/// frame ready for [`ClientRegistry::send_to`].
pub fn encode_stream_frame(frame: &StreamFrame) -> Vec<u8> {
    match frame {
        StreamFrame::Text(s) => codec::encode_text(s),
        StreamFrame::Binary(data) => codec::encode_binary(data),
    }
}

/// Notifies every client attached to `task_id` that the task's status
/// changed, as a JSON text frame `{"task_id": ..., "running": ...}`.
pub fn status_frame(task_id: &str, running: bool) -> Vec<u8> {
    let text = format!(r#"{{"task_id":"{task_id}","running":{running}}}"#);
    codec::encode_text(&text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessRegistry;
    use crate::ws::token::TokenIssuer;
    use std::time::Duration;

    #[tokio::test]
    async fn handshake_succeeds_with_valid_token() {
        let issuer = TokenIssuer::new(b"secret".to_vec());
        let token = issuer.issue("alice", "task1", "host1", Duration::from_secs(60), 1000);

        let (mut client, server) = tokio::io::duplex(8192);
        let registry = ClientRegistry::new();
        let process_registry = ProcessRegistry::new();

        let request = format!(
            "GET /concierge/api/v1/ws/task1/host1?token={token} HTTP/1.1\r\n\
             Host: example.com\r\n\
             Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
             \r\n"
        );

        let server_fut = tokio::spawn(async move {
            let _ = handle_connection(server, &issuer, &registry, &process_registry, 1000).await;
        });

        client.write_all(request.as_bytes()).await.unwrap();
        // Send a close frame (masked, as required of clients) so the server task exits promptly.
        client.write_all(&masked_close_frame()).await.unwrap();

        let mut response = vec![0u8; 4096];
        let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut response))
            .await
            .unwrap()
            .unwrap();
        let text = String::from_utf8_lossy(&response[..n]);
        assert!(text.contains("101 Switching Protocols"));
        assert!(text.contains("Sec-WebSocket-Protocol: concierge.v1"));

        drop(client);
        let _ = tokio::time::timeout(Duration::from_secs(2), server_fut).await;
    }

    fn masked_close_frame() -> Vec<u8> {
        let key = [0, 0, 0, 0];
        let mut out = vec![0x88, 0x80];
        out.extend_from_slice(&key);
        out
    }

    #[test]
    fn client_registry_routes_by_task_and_host() {
        let registry = ClientRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register("t1", "h1", tx);
        assert_eq!(registry.send_to("t1", "h1", vec![1, 2, 3]), 1);
        assert_eq!(registry.send_to("t1", "h2", vec![9]), 0);
        assert_eq!(rx.try_recv().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn broadcast_status_reaches_all_hosts_of_a_task() {
        let registry = ClientRegistry::new();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        registry.register("t1", "h1", tx1);
        registry.register("t1", "h2", tx2);
        assert_eq!(registry.broadcast_status("t1", vec![7]), 2);
        assert_eq!(rx1.try_recv().unwrap(), vec![7]);
        assert_eq!(rx2.try_recv().unwrap(), vec![7]);
    }

    #[test]
    fn dispatch_control_recognizes_close_stdin() {
        let process_registry = ProcessRegistry::new();
        let grant = super::super::token::TokenGrant {
            user: "alice".to_string(),
            task_id: "t1".to_string(),
            hostname: "h1".to_string(),
            exp: 0,
        };
        let handled = dispatch_control(br#"{"type":"control","char":"D"}"#, &grant, &process_registry);
        assert!(handled);
    }

    #[test]
    fn dispatch_control_ignores_plain_text() {
        let process_registry = ProcessRegistry::new();
        let grant = super::super::token::TokenGrant {
            user: "alice".to_string(),
            task_id: "t1".to_string(),
            hostname: "h1".to_string(),
            exp: 0,
        };
        assert!(!dispatch_control(b"ls -la\n", &grant, &process_registry));
    }

    #[test]
    fn parses_handshake_path_and_token() {
        let head = "GET /concierge/api/v1/ws/task1/host1?token=abc123 HTTP/1.1\r\nSec-WebSocket-Key: k==\r\n\r\n";
        let h = parse_handshake(head).unwrap();
        assert_eq!(h.task_id, "task1");
        assert_eq!(h.hostname, "host1");
        assert_eq!(h.token, "abc123");
        assert_eq!(h.client_key, "k==");
    }
}
