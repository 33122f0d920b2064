//! A single authenticated NNTP session and its lifecycle state machine

use bytes::{Bytes, BytesMut};
use rustls_pki_types::ServerName;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::response::{self, Response};
use crate::types::{MsgId, Provider};

/// Combined IO bound for plain-TCP and TLS transports
pub trait AsyncIo: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncIo for T {}

/// Connection lifecycle states.
///
/// `Dialing → Authenticating → Idle ↔ InUse → {Closing, Broken}`; any state
/// moves to `Broken` on a protocol violation or transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Transport up, server greeting not yet accepted
    Dialing,
    /// Greeting accepted, AUTHINFO exchange in progress
    Authenticating,
    /// Parked in the pool, ready to borrow
    Idle,
    /// Exclusively owned by one fetch
    InUse,
    /// Cleanly shut down; terminal
    Closing,
    /// Failed; terminal, must not return to the pool
    Broken,
}

/// A live authenticated NNTP session bound to one provider.
///
/// Owned exclusively while borrowed from the pool; all commands take
/// `&mut self`, so a connection can never serve two fetches at once.
pub struct NntpConnection {
    io: BufStream<Box<dyn AsyncIo>>,
    provider_index: usize,
    state: ConnState,
    last_used: Instant,
    line_buf: Vec<u8>,
    /// A command has been written whose response is not fully consumed.
    /// Stays set when a future is dropped mid-exchange, so the pool knows
    /// the session is protocol-dirty and must be destroyed, not reused.
    in_command: bool,
}

impl NntpConnection {
    /// Dial, greet, and authenticate a new session against `provider`.
    ///
    /// TLS is negotiated when the provider asks for it. The whole exchange
    /// is bounded by `dial_timeout`.
    pub async fn connect(
        provider: &Provider,
        tls_config: &Arc<rustls::ClientConfig>,
        dial_timeout: Duration,
    ) -> Result<Self> {
        let conn = timeout(dial_timeout, Self::dial(provider, tls_config)).await;
        match conn {
            Ok(result) => result,
            Err(_) => Err(Error::ConnectTimeout {
                host: provider.host.clone(),
                port: provider.port,
                timeout_secs: dial_timeout.as_secs(),
            }),
        }
    }

    async fn dial(provider: &Provider, tls_config: &Arc<rustls::ClientConfig>) -> Result<Self> {
        let address = provider.address();
        debug!(provider = provider.index, %address, tls = provider.tls, "dialing");

        let tcp = TcpStream::connect(&address)
            .await
            .map_err(|_| Error::ConnectionFailed {
                host: provider.host.clone(),
                port: provider.port,
            })?;
        tcp.set_nodelay(true)?;

        let io: Box<dyn AsyncIo> = if provider.tls {
            let server_name = ServerName::try_from(provider.host.clone()).map_err(|_| {
                Error::InvalidServerName {
                    host: provider.host.clone(),
                }
            })?;
            let connector = TlsConnector::from(Arc::clone(tls_config));
            Box::new(connector.connect(server_name, tcp).await?)
        } else {
            Box::new(tcp)
        };

        let mut conn = Self {
            io: BufStream::new(io),
            provider_index: provider.index,
            state: ConnState::Dialing,
            last_used: Instant::now(),
            line_buf: Vec::with_capacity(512),
            in_command: false,
        };

        let greeting = conn.read_response().await?;
        if greeting.is_connection_limit() {
            return Err(Error::ConnectionLimit {
                line: greeting.line,
            });
        }
        if greeting.code != response::GREETING_POSTING_OK
            && greeting.code != response::GREETING_NO_POSTING
        {
            return Err(Error::UnexpectedResponse {
                expected: response::GREETING_NO_POSTING,
                code: greeting.code,
                line: greeting.line,
            });
        }
        conn.state = ConnState::Authenticating;

        if let Some(username) = &provider.username {
            conn.authenticate(username, provider.password.as_deref())
                .await?;
        }

        conn.state = ConnState::Idle;
        debug!(provider = provider.index, "session established");
        Ok(conn)
    }

    async fn authenticate(&mut self, username: &str, password: Option<&str>) -> Result<()> {
        let user_response = self.command(&format!("AUTHINFO USER {username}")).await?;
        match user_response.code {
            response::AUTH_ACCEPTED => return Ok(()),
            response::PASSWORD_REQUIRED => {}
            response::AUTH_REJECTED | response::AUTH_OUT_OF_SEQUENCE => {
                return Err(Error::AuthRejected {
                    code: user_response.code,
                });
            }
            code => {
                return Err(Error::UnexpectedResponse {
                    expected: response::PASSWORD_REQUIRED,
                    code,
                    line: user_response.line,
                });
            }
        }

        let password = password.unwrap_or_default();
        let pass_response = self.command(&format!("AUTHINFO PASS {password}")).await?;
        match pass_response.code {
            response::AUTH_ACCEPTED => Ok(()),
            response::AUTH_REJECTED | response::AUTH_OUT_OF_SEQUENCE => {
                Err(Error::AuthRejected {
                    code: pass_response.code,
                })
            }
            code => Err(Error::UnexpectedResponse {
                expected: response::AUTH_ACCEPTED,
                code,
                line: pass_response.line,
            }),
        }
    }

    /// Retrieve an article body, dot-unstuffed, line structure intact.
    ///
    /// The connection stays healthy across a 430 or a refusal; transport
    /// and protocol failures mark it broken.
    pub async fn body(&mut self, msg_id: &MsgId) -> Result<Bytes> {
        let response = self.command(&format!("BODY {msg_id}")).await?;
        match response.code {
            response::BODY_FOLLOWS => {
                self.in_command = true;
                let body = self.read_multiline().await?;
                self.in_command = false;
                Ok(body)
            }
            response::NO_SUCH_ARTICLE => Err(Error::ArticleMissing {
                msg_id: msg_id.clone(),
            }),
            _ if response.is_connection_limit() => Err(Error::ConnectionLimit {
                line: response.line,
            }),
            code => Err(Error::ArticleRefused {
                msg_id: msg_id.clone(),
                code,
            }),
        }
    }

    /// `STAT`: does the provider carry this article?
    pub async fn stat(&mut self, msg_id: &MsgId) -> Result<bool> {
        let response = self.command(&format!("STAT {msg_id}")).await?;
        match response.code {
            response::ARTICLE_EXISTS => Ok(true),
            response::NO_SUCH_ARTICLE => Ok(false),
            code => Err(Error::ArticleRefused {
                msg_id: msg_id.clone(),
                code,
            }),
        }
    }

    /// `HEAD`: like [`Self::stat`] but forces the provider to produce the
    /// headers, catching providers that index articles they cannot serve.
    pub async fn head(&mut self, msg_id: &MsgId) -> Result<bool> {
        let response = self.command(&format!("HEAD {msg_id}")).await?;
        match response.code {
            response::HEAD_FOLLOWS => {
                self.in_command = true;
                self.read_multiline().await?;
                self.in_command = false;
                Ok(true)
            }
            response::NO_SUCH_ARTICLE => Ok(false),
            code => Err(Error::ArticleRefused {
                msg_id: msg_id.clone(),
                code,
            }),
        }
    }

    /// Send `QUIT` and close. Best effort; errors are swallowed because the
    /// socket is going away either way.
    pub async fn quit(mut self) {
        self.state = ConnState::Closing;
        if self.write_line("QUIT").await.is_ok() {
            let _ = self.read_response().await;
        }
    }

    /// Send one command and read its status line. The status line is the
    /// complete response for single-line commands; multiline consumers
    /// re-mark the exchange until the terminator arrives.
    async fn command(&mut self, line: &str) -> Result<Response> {
        self.write_line(line).await?;
        let response = self.read_response().await?;
        self.in_command = false;
        trace!(
            provider = self.provider_index,
            command = line.split(' ').next().unwrap_or(line),
            code = response.code,
            "command completed"
        );
        Ok(response)
    }

    async fn write_line(&mut self, line: &str) -> Result<()> {
        self.in_command = true;
        let result = async {
            self.io.write_all(line.as_bytes()).await?;
            self.io.write_all(b"\r\n").await?;
            self.io.flush().await
        }
        .await;
        if let Err(e) = result {
            self.state = ConnState::Broken;
            return Err(e.into());
        }
        self.last_used = Instant::now();
        Ok(())
    }

    async fn read_response(&mut self) -> Result<Response> {
        let line = self.read_line().await?;
        match Response::parse(&String::from_utf8_lossy(&line)) {
            Ok(response) => Ok(response),
            Err(e) => {
                self.state = ConnState::Broken;
                Err(e)
            }
        }
    }

    async fn read_line(&mut self) -> Result<Vec<u8>> {
        self.line_buf.clear();
        let n = self.io.read_until(b'\n', &mut self.line_buf).await?;
        if n == 0 {
            self.state = ConnState::Broken;
            return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
        }
        let mut line = self.line_buf.clone();
        while line.last().is_some_and(|&b| b == b'\n' || b == b'\r') {
            line.pop();
        }
        Ok(line)
    }

    /// Read a dot-terminated multiline block, undoing dot-stuffing.
    async fn read_multiline(&mut self) -> Result<Bytes> {
        let mut body = BytesMut::with_capacity(1 << 20);
        loop {
            let line = self.read_line().await?;
            if line == b"." {
                self.last_used = Instant::now();
                return Ok(body.freeze());
            }
            if line.starts_with(b"..") {
                body.extend_from_slice(&line[1..]);
            } else {
                body.extend_from_slice(&line);
            }
            body.extend_from_slice(b"\r\n");
        }
    }

    /// Mark this connection unusable; the pool will destroy it on release.
    pub fn mark_broken(&mut self) {
        self.state = ConnState::Broken;
    }

    /// Whether this connection must not be reused: broken, or dropped in
    /// the middle of a command exchange.
    pub fn is_broken(&self) -> bool {
        self.state == ConnState::Broken || self.in_command
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnState {
        self.state
    }

    pub(crate) fn mark_in_use(&mut self) {
        self.state = ConnState::InUse;
    }

    pub(crate) fn mark_idle(&mut self) {
        self.state = ConnState::Idle;
        self.last_used = Instant::now();
    }

    /// Index of the provider this session is bound to.
    pub fn provider_index(&self) -> usize {
        self.provider_index
    }

    /// How long this connection has been unused.
    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }
}

impl std::fmt::Debug for NntpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NntpConnection")
            .field("provider_index", &self.provider_index)
            .field("state", &self.state)
            .field("idle_for", &self.idle_for())
            .finish_non_exhaustive()
    }
}
