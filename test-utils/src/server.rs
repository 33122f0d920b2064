//! In-process mock NNTP server

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufStream};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

#[derive(Default)]
struct ServerState {
    /// msg-id (angle brackets included) -> yEnc-encoded article body
    articles: RwLock<HashMap<String, Bytes>>,
    /// msg-ids this server answers 430 for even when stored
    missing: RwLock<HashSet<String>>,
    /// Required credentials; `None` skips AUTHINFO entirely
    credentials: RwLock<Option<(String, String)>>,
    /// Artificial delay before serving each BODY
    body_latency: Mutex<Duration>,
    connections_accepted: AtomicUsize,
    connections_active: AtomicUsize,
    bodies_served: AtomicUsize,
    body_requests: Mutex<HashMap<String, usize>>,
}

/// A TCP NNTP server for tests.
///
/// Binds an ephemeral localhost port on [`MockNntpServer::start`] and
/// serves until dropped. Plain TCP only; the data plane's TLS path is
/// exercised against real providers, not in unit tests.
pub struct MockNntpServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
    shutdown: CancellationToken,
}

impl MockNntpServer {
    /// Bind and start serving.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap_or_else(|e| panic!("failed to bind mock server: {e}"));
        let addr = listener
            .local_addr()
            .unwrap_or_else(|e| panic!("mock server has no local addr: {e}"));
        let state = Arc::new(ServerState::default());
        let shutdown = CancellationToken::new();

        tokio::spawn(accept_loop(listener, Arc::clone(&state), shutdown.clone()));
        debug!(%addr, "mock NNTP server up");

        Self {
            addr,
            state,
            shutdown,
        }
    }

    /// Address the server is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Host string for provider records.
    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    /// Port for provider records.
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Require `AUTHINFO` with these credentials.
    pub fn require_auth(&self, username: impl Into<String>, password: impl Into<String>) {
        *self.state.credentials.write() = Some((username.into(), password.into()));
    }

    /// Store an already-encoded article body.
    pub fn add_raw_article(&self, msg_id: impl Into<String>, body: impl Into<Bytes>) {
        self.state.articles.write().insert(msg_id.into(), body.into());
    }

    /// Encode `payload` as a single-part yEnc posting and store it.
    pub fn add_article(&self, msg_id: impl Into<String>, payload: &[u8]) {
        let body = yenc_codec::encode(payload, &yenc_codec::EncodeOptions::new("article.bin"));
        self.add_raw_article(msg_id, body);
    }

    /// Answer 430 for this msg-id from now on.
    pub fn mark_missing(&self, msg_id: impl Into<String>) {
        self.state.missing.write().insert(msg_id.into());
    }

    /// Stop answering 430 for this msg-id.
    pub fn unmark_missing(&self, msg_id: &str) {
        self.state.missing.write().remove(msg_id);
    }

    /// Delay every BODY response by `latency`.
    pub fn set_body_latency(&self, latency: Duration) {
        *self.state.body_latency.lock() = latency;
    }

    /// Total connections ever accepted.
    pub fn connections_accepted(&self) -> usize {
        self.state.connections_accepted.load(Ordering::Relaxed)
    }

    /// Connections currently open.
    pub fn active_connections(&self) -> usize {
        self.state.connections_active.load(Ordering::Relaxed)
    }

    /// BODY commands served successfully.
    pub fn bodies_served(&self) -> usize {
        self.state.bodies_served.load(Ordering::Relaxed)
    }

    /// How many BODY requests arrived for one msg-id.
    pub fn body_requests(&self, msg_id: &str) -> usize {
        self.state
            .body_requests
            .lock()
            .get(msg_id)
            .copied()
            .unwrap_or(0)
    }
}

impl Drop for MockNntpServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn accept_loop(listener: TcpListener, state: Arc<ServerState>, shutdown: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            () = shutdown.cancelled() => return,
            accepted = listener.accept() => accepted,
        };
        let Ok((socket, peer)) = accepted else {
            continue;
        };
        trace!(%peer, "mock server accepted connection");
        state.connections_accepted.fetch_add(1, Ordering::Relaxed);
        state.connections_active.fetch_add(1, Ordering::Relaxed);
        let state = Arc::clone(&state);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = shutdown.cancelled() => {}
                _ = serve_connection(socket, &state) => {}
            }
            state.connections_active.fetch_sub(1, Ordering::Relaxed);
        });
    }
}

async fn serve_connection(socket: TcpStream, state: &ServerState) -> std::io::Result<()> {
    let mut io = BufStream::new(socket);
    io.write_all(b"200 mock-nntp ready\r\n").await?;
    io.flush().await?;

    let mut authed_user: Option<String> = None;
    let mut line = String::new();

    loop {
        line.clear();
        if io.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        let trimmed = line.trim_end();
        let (command, argument) = match trimmed.split_once(' ') {
            Some((c, a)) => (c.to_ascii_uppercase(), a.to_string()),
            None => (trimmed.to_ascii_uppercase(), String::new()),
        };

        match command.as_str() {
            "AUTHINFO" => {
                let response = handle_authinfo(state, &argument, &mut authed_user);
                io.write_all(response.as_bytes()).await?;
            }
            "BODY" => {
                if !is_authorized(state, authed_user.as_deref()) {
                    io.write_all(b"480 authentication required\r\n").await?;
                } else {
                    let latency = *state.body_latency.lock();
                    if !latency.is_zero() {
                        tokio::time::sleep(latency).await;
                    }
                    serve_body(state, &argument, &mut io).await?;
                }
            }
            "STAT" | "HEAD" => {
                if !is_authorized(state, authed_user.as_deref()) {
                    io.write_all(b"480 authentication required\r\n").await?;
                } else {
                    serve_presence(state, &command, &argument, &mut io).await?;
                }
            }
            "QUIT" => {
                io.write_all(b"205 goodbye\r\n").await?;
                io.flush().await?;
                return Ok(());
            }
            _ => {
                io.write_all(b"500 unknown command\r\n").await?;
            }
        }
        io.flush().await?;
    }
}

fn handle_authinfo(
    state: &ServerState,
    argument: &str,
    authed_user: &mut Option<String>,
) -> &'static str {
    let Some((which, value)) = argument.split_once(' ') else {
        return "501 syntax error\r\n";
    };
    let expected = state.credentials.read().clone();
    let Some((user, pass)) = expected else {
        return "281 no authentication required\r\n";
    };
    match which.to_ascii_uppercase().as_str() {
        "USER" => {
            *authed_user = Some(value.to_string());
            "381 password required\r\n"
        }
        "PASS" => {
            if authed_user.as_deref() == Some(user.as_str()) && value == pass {
                *authed_user = Some(format!("{value}:ok"));
                "281 authentication accepted\r\n"
            } else {
                "481 authentication failed\r\n"
            }
        }
        _ => "501 syntax error\r\n",
    }
}

fn is_authorized(state: &ServerState, authed_user: Option<&str>) -> bool {
    state.credentials.read().is_none() || authed_user.is_some_and(|u| u.ends_with(":ok"))
}

async fn serve_body(
    state: &ServerState,
    msg_id: &str,
    io: &mut BufStream<TcpStream>,
) -> std::io::Result<()> {
    *state
        .body_requests
        .lock()
        .entry(msg_id.to_string())
        .or_insert(0) += 1;

    if state.missing.read().contains(msg_id) {
        io.write_all(b"430 no such article\r\n").await?;
        return Ok(());
    }
    let Some(body) = state.articles.read().get(msg_id).cloned() else {
        io.write_all(b"430 no such article\r\n").await?;
        return Ok(());
    };

    io.write_all(format!("222 0 {msg_id} body\r\n").as_bytes())
        .await?;
    // Dot-stuff on the way out, exactly as a provider would.
    for line in body.split_inclusive(|&b| b == b'\n') {
        let line = line
            .strip_suffix(b"\r\n")
            .or_else(|| line.strip_suffix(b"\n"))
            .unwrap_or(line);
        if line.first() == Some(&b'.') {
            io.write_all(b".").await?;
        }
        io.write_all(line).await?;
        io.write_all(b"\r\n").await?;
    }
    io.write_all(b".\r\n").await?;
    state.bodies_served.fetch_add(1, Ordering::Relaxed);
    Ok(())
}

async fn serve_presence(
    state: &ServerState,
    command: &str,
    msg_id: &str,
    io: &mut BufStream<TcpStream>,
) -> std::io::Result<()> {
    let present =
        !state.missing.read().contains(msg_id) && state.articles.read().contains_key(msg_id);
    if !present {
        io.write_all(b"430 no such article\r\n").await?;
        return Ok(());
    }
    if command == "STAT" {
        io.write_all(format!("223 0 {msg_id}\r\n").as_bytes())
            .await?;
    } else {
        io.write_all(format!("221 0 {msg_id} headers\r\n").as_bytes())
            .await?;
        io.write_all(b"Message-ID: dummy\r\n.\r\n").await?;
    }
    Ok(())
}
