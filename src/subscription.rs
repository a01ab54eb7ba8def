//! Upstream Subscription (spec section 4.2): a background worker that maintains an
//! NTRIP v2 connection to the remote reference-station caster for one mountpoint and
//! exposes the raw bytes it reads through a lock-protected buffer. Grounded in
//! `examples/original_source/services/get_rtcm.py`'s `NtripClient` thread, rewritten
//! as a `tokio::spawn`ed task the way the teacher crate drives its background
//! connections (`src/connection/outgoing.rs`).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use log::{error, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);
const READ_CHUNK: usize = 4096;

/// Bound applied to the shared buffer: an implementation MAY cap it and drop the
/// oldest bytes, per spec section 4.2, since RTCM framing resynchronizes on its own.
/// One MiB comfortably outpaces any correction stream's burst rate at normal rover
/// read cadence.
const MAX_BUFFERED_BYTES: usize = 1024 * 1024;

#[derive(Clone)]
struct Credentials {
    host: String,
    port: u16,
    mount: String,
    user: String,
    pass: String,
}

pub struct UpstreamSubscription {
    running: Arc<AtomicBool>,
    buffer: Arc<Mutex<Vec<u8>>>,
    handle: JoinHandle<()>,
}

impl UpstreamSubscription {
    /// Start a worker subscribing to `mount` on `(host, port)`.
    pub fn start(host: String, port: u16, mount: String, user: String, pass: String) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let buffer = Arc::new(Mutex::new(Vec::new()));

        let creds = Credentials {
            host,
            port,
            mount,
            user,
            pass,
        };

        let worker_running = running.clone();
        let worker_buffer = buffer.clone();
        let handle = tokio::spawn(async move {
            run_worker(creds, worker_running, worker_buffer).await;
        });

        UpstreamSubscription {
            running,
            buffer,
            handle,
        }
    }

    /// Idempotent: signals the worker to exit before its next reconnect attempt, and
    /// waits for it to finish so no socket outlives this call.
    pub async fn stop(self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.handle.await;
    }

    /// Drain the accumulated bytes, atomically, so none appended concurrently by the
    /// worker are lost between the drain and the clear (spec section 5).
    pub async fn drain(&self) -> Vec<u8> {
        let mut guard = self.buffer.lock().await;
        std::mem::take(&mut *guard)
    }
}

async fn run_worker(creds: Credentials, running: Arc<AtomicBool>, buffer: Arc<Mutex<Vec<u8>>>) {
    while running.load(Ordering::SeqCst) {
        match subscribe_once(&creds, &running, &buffer).await {
            Ok(()) => {}
            Err(e) => warn!("upstream subscription to {} error: {e}", creds.mount),
        }

        if !running.load(Ordering::SeqCst) {
            break;
        }

        tokio::time::sleep(RECONNECT_BACKOFF).await;
    }
    info!("upstream subscription to {} stopped", creds.mount);
}

async fn subscribe_once(
    creds: &Credentials,
    running: &Arc<AtomicBool>,
    buffer: &Arc<Mutex<Vec<u8>>>,
) -> std::io::Result<()> {
    let mut stream = tokio::time::timeout(
        CONNECT_TIMEOUT,
        TcpStream::connect((creds.host.as_str(), creds.port)),
    )
    .await
    .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"))??;

    let auth = BASE64.encode(format!("{}:{}", creds.user, creds.pass));
    let request = format!(
        "GET /{mount} HTTP/1.1\r\n\
         Host: {host}\r\n\
         Ntrip-Version: Ntrip/2.0\r\n\
         User-Agent: NTRIP rbmc-relay/0.1\r\n\
         Authorization: Basic {auth}\r\n\r\n",
        mount = creds.mount,
        host = creds.host,
    );
    stream.write_all(request.as_bytes()).await?;

    consume_response_header(&mut stream).await?;
    info!("upstream subscription to {} connected", creds.mount);

    let mut read_buf = [0u8; READ_CHUNK];
    while running.load(Ordering::SeqCst) {
        let n = stream.read(&mut read_buf).await?;
        if n == 0 {
            return Ok(()); // EOF: outer loop reconnects after backoff.
        }
        let mut guard = buffer.lock().await;
        guard.extend_from_slice(&read_buf[..n]);
        if guard.len() > MAX_BUFFERED_BYTES {
            let overflow = guard.len() - MAX_BUFFERED_BYTES;
            guard.drain(..overflow);
        }
    }
    Ok(())
}

async fn consume_response_header(stream: &mut TcpStream) -> std::io::Result<()> {
    let mut header = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "upstream closed before sending a response header",
            ));
        }
        header.push(byte[0]);
        if header.ends_with(b"\r\n\r\n") {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn drain_is_atomic_and_clears_the_buffer() {
        let buffer = Arc::new(Mutex::new(vec![1, 2, 3]));
        let sub = UpstreamSubscription {
            running: Arc::new(AtomicBool::new(true)),
            buffer: buffer.clone(),
            handle: tokio::spawn(async {}),
        };
        let drained = sub.drain().await;
        assert_eq!(drained, vec![1, 2, 3]);
        assert!(buffer.lock().await.is_empty());
    }

    #[tokio::test]
    async fn s6_no_duplicate_header_bytes_reach_the_buffer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(b"HTTP/1.1 200 OK\r\n\r\nfirstbytes").await.unwrap();
            tokio::time::sleep(Duration::from_millis(500)).await;
            drop(sock);
        });

        let sub = UpstreamSubscription::start(
            addr.ip().to_string(),
            addr.port(),
            "MOUNT".to_string(),
            "user".to_string(),
            "pass".to_string(),
        );

        tokio::time::sleep(Duration::from_millis(150)).await;
        let drained = sub.drain().await;
        // Only the payload, never the consumed "HTTP/1.1 200 OK\r\n\r\n" header.
        assert_eq!(drained, b"firstbytes".to_vec());

        sub.stop().await;
    }
}
