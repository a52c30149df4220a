//! Transport listeners and per-client sessions.
//!
//! Every accepted client is greeted with the daemon identity, must
//! authenticate when the endpoint carries a password, and then alternates
//! between framed requests and the shared event broadcast on a single
//! outbound stream.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::broadcast;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls::ServerConfig as RustlsServerConfig;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bot::Bot;
use crate::command::error_envelope;
use crate::error::{DaemonError, WireError};
use crate::transport::frame::{FrameBuffer, encode};
use crate::transport::{TlsPaths, TransportError, TransportResult, TransportSpec};

trait TransportStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> TransportStream for T {}

enum Listener {
    Unix(UnixListener),
    Tcp(TcpListener),
    Tls(TcpListener, TlsAcceptor),
}

/// One bound listening endpoint. Dropping it removes a unix socket file so
/// restarts do not trip over a stale path.
pub struct TransportServer {
    listener: Listener,
    password: Option<String>,
    unix_path: Option<PathBuf>,
}

impl TransportServer {
    pub async fn bind(spec: &TransportSpec) -> TransportResult<Self> {
        match spec {
            TransportSpec::Unix { path, password } => {
                // a previous crash may have left the socket file behind
                if path.exists() {
                    info!(path = %path.display(), "removing stale control socket");
                    std::fs::remove_file(path)?;
                }
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent)?;
                    }
                }

                let listener = UnixListener::bind(path)?;
                info!(path = %path.display(), "transport listening");

                Ok(Self {
                    listener: Listener::Unix(listener),
                    password: password.clone(),
                    unix_path: Some(path.clone()),
                })
            }

            TransportSpec::Tcp {
                address,
                port,
                password,
                tls,
            } => {
                let listener = TcpListener::bind((address.as_str(), *port)).await?;
                info!(address, port, tls = tls.is_some(), "transport listening");

                let listener = match tls {
                    None => Listener::Tcp(listener),
                    Some(paths) => {
                        if !cfg!(feature = "tls") {
                            return Err(TransportError::SslDisabled);
                        }
                        Listener::Tls(listener, acceptor(paths)?)
                    }
                };

                Ok(Self {
                    listener,
                    password: password.clone(),
                    unix_path: None,
                })
            }
        }
    }

    /// Local TCP port, for tests binding port 0.
    pub fn local_port(&self) -> Option<u16> {
        match &self.listener {
            Listener::Tcp(listener) | Listener::Tls(listener, _) => {
                listener.local_addr().ok().map(|addr| addr.port())
            }
            Listener::Unix(_) => None,
        }
    }

    /// Accepts clients until shutdown; each client runs in its own task.
    pub async fn accept_loop(self, bot: Arc<Bot>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,

                accepted = accept_one(&self.listener) => match accepted {
                    Ok(stream) => {
                        let bot = bot.clone();
                        let password = self.password.clone();
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            handle_client(stream, password, bot, shutdown).await;
                        });
                    }
                    Err(err) => {
                        error!(error = %err, "transport accept failed");
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                },
            }
        }
    }
}

impl Drop for TransportServer {
    fn drop(&mut self) {
        if let Some(path) = &self.unix_path {
            if path.exists() {
                if let Err(err) = std::fs::remove_file(path) {
                    warn!(path = %path.display(), error = %err, "failed to remove control socket");
                }
            }
        }
    }
}

async fn accept_one(listener: &Listener) -> std::io::Result<Box<dyn TransportStream>> {
    match listener {
        Listener::Unix(listener) => {
            let (stream, _) = listener.accept().await?;
            Ok(Box::new(stream))
        }
        Listener::Tcp(listener) => {
            let (stream, _) = listener.accept().await?;
            Ok(Box::new(stream))
        }
        Listener::Tls(listener, acceptor) => {
            let (stream, _) = listener.accept().await?;
            let stream = acceptor.accept(stream).await?;
            Ok(Box::new(stream))
        }
    }
}

fn acceptor(paths: &TlsPaths) -> TransportResult<TlsAcceptor> {
    let cert_file = std::fs::File::open(&paths.certificate)?;
    let certs = rustls_pemfile::certs(&mut std::io::BufReader::new(cert_file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| TransportError::Tls(err.to_string()))?;

    let key_file = std::fs::File::open(&paths.key)?;
    let key = rustls_pemfile::private_key(&mut std::io::BufReader::new(key_file))
        .map_err(|err| TransportError::Tls(err.to_string()))?
        .ok_or_else(|| TransportError::Tls("no private key found".to_string()))?;

    let config = RustlsServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|err| TransportError::Tls(err.to_string()))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// The greeting sent to every client before anything else.
pub fn greeting() -> Value {
    let mut parts = env!("CARGO_PKG_VERSION")
        .split('.')
        .map(|part| part.parse::<u64>().unwrap_or(0));

    json!({
        "program": "irccd",
        "major": parts.next().unwrap_or(0),
        "minor": parts.next().unwrap_or(0),
        "patch": parts.next().unwrap_or(0),
    })
}

async fn handle_client(
    stream: Box<dyn TransportStream>,
    password: Option<String>,
    bot: Arc<Bot>,
    shutdown: CancellationToken,
) {
    let id = Uuid::new_v4();
    debug!(client = %id, "control client connected");

    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut frames = FrameBuffer::new();
    let mut events: broadcast::Receiver<Value> = bot.subscribe();

    if writer.write_all(&encode(&greeting())).await.is_err() {
        return;
    }

    let mut authenticated = password.is_none();
    let mut buf = [0u8; 4096];

    'session: loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,

            read = reader.read(&mut buf) => {
                let n = match read {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(err) => {
                        debug!(client = %id, error = %err, "client read error");
                        break;
                    }
                };

                frames.extend(&buf[..n]);
                loop {
                    let request = match frames.next_frame() {
                        Ok(Some(request)) => request,
                        Ok(None) => break,
                        Err(err) => {
                            // protocol violation: report once and drop the client
                            warn!(client = %id, error = %err, "bad control record");
                            let err = WireError::from(DaemonError::CorruptMessage);
                            let _ = writer.write_all(&encode(&error_envelope("", &err))).await;
                            break 'session;
                        }
                    };

                    let command = request
                        .get("command")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_string();

                    let response = if command == "auth" {
                        let supplied = request.get("password").and_then(Value::as_str);
                        match &password {
                            Some(expected) if supplied == Some(expected.as_str()) => {
                                authenticated = true;
                                json!({"command": "auth"})
                            }
                            None => {
                                authenticated = true;
                                json!({"command": "auth"})
                            }
                            Some(_) => {
                                let err = WireError::from(DaemonError::InvalidAuth);
                                let _ = writer
                                    .write_all(&encode(&error_envelope("auth", &err)))
                                    .await;
                                break 'session;
                            }
                        }
                    } else if !authenticated {
                        error_envelope(&command, &WireError::from(DaemonError::AuthRequired))
                    } else {
                        bot.dispatch_request(&request).await
                    };

                    if writer.write_all(&encode(&response)).await.is_err() {
                        break 'session;
                    }
                }
            }

            event = events.recv() => match event {
                Ok(event) => {
                    if authenticated && writer.write_all(&encode(&event)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(client = %id, missed, "client lagged behind the event stream");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    debug!(client = %id, "control client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::frame::FrameBuffer;
    use serde_json::Map;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpStream;
    use tokio::time::timeout;

    const TICK: Duration = Duration::from_secs(5);

    struct TestClient {
        stream: TcpStream,
        frames: FrameBuffer,
    }

    impl TestClient {
        async fn connect(port: u16) -> Self {
            let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
            Self {
                stream,
                frames: FrameBuffer::new(),
            }
        }

        async fn send(&mut self, value: Value) {
            self.stream.write_all(&encode(&value)).await.unwrap();
        }

        async fn next(&mut self) -> Map<String, Value> {
            let mut buf = [0u8; 4096];
            loop {
                if let Some(frame) = self.frames.next_frame().unwrap() {
                    return frame;
                }

                let n = timeout(TICK, self.stream.read(&mut buf))
                    .await
                    .expect("timed out waiting for frame")
                    .unwrap();
                assert!(n > 0, "connection closed while waiting for frame");
                self.frames.extend(&buf[..n]);
            }
        }

        async fn expect_closed(&mut self) {
            let mut buf = [0u8; 64];
            let n = timeout(TICK, self.stream.read(&mut buf))
                .await
                .expect("timed out waiting for close")
                .unwrap();
            assert_eq!(n, 0, "expected the server to close the connection");
        }
    }

    async fn start(password: Option<&str>) -> (Arc<Bot>, u16, CancellationToken) {
        let bot = Bot::new();
        let spec = TransportSpec::Tcp {
            address: "127.0.0.1".to_string(),
            port: 0,
            password: password.map(str::to_string),
            tls: None,
        };

        let server = TransportServer::bind(&spec).await.unwrap();
        let port = server.local_port().unwrap();
        let shutdown = CancellationToken::new();
        tokio::spawn(server.accept_loop(bot.clone(), shutdown.clone()));

        (bot, port, shutdown)
    }

    #[tokio::test]
    async fn greeting_identifies_the_daemon() {
        let (_bot, port, _shutdown) = start(None).await;

        let mut client = TestClient::connect(port).await;
        let hello = client.next().await;
        assert_eq!(hello.get("program").unwrap(), "irccd");
        assert!(hello.get("major").unwrap().is_u64());
    }

    #[tokio::test]
    async fn password_gates_every_command() {
        let (_bot, port, _shutdown) = start(Some("secret")).await;

        // commands before auth are rejected with auth_required
        let mut client = TestClient::connect(port).await;
        client.next().await;
        client.send(json!({"command": "server-list"})).await;

        let response = client.next().await;
        assert_eq!(response.get("error").unwrap(), 3);
        assert_eq!(response.get("errorCategory").unwrap(), "irccd");

        // a wrong password errors and closes the connection
        client
            .send(json!({"command": "auth", "password": "wrong"}))
            .await;
        let response = client.next().await;
        assert_eq!(response.get("command").unwrap(), "auth");
        assert_eq!(response.get("error").unwrap(), 4);
        client.expect_closed().await;

        // a fresh client with the right password gets through
        let mut client = TestClient::connect(port).await;
        client.next().await;
        client
            .send(json!({"command": "auth", "password": "secret"}))
            .await;
        let response = client.next().await;
        assert_eq!(response.get("command").unwrap(), "auth");
        assert!(response.get("error").is_none());

        client.send(json!({"command": "server-list"})).await;
        let response = client.next().await;
        assert_eq!(response.get("command").unwrap(), "server-list");
        assert!(response.get("error").is_none());
    }

    #[tokio::test]
    async fn events_reach_subscribed_clients() {
        let (bot, port, _shutdown) = start(None).await;

        let mut client = TestClient::connect(port).await;
        client.next().await;

        // one request/response round trip guarantees the client task runs
        client.send(json!({"command": "server-list"})).await;
        client.next().await;

        bot.broadcast(json!({"event": "onConnect", "server": "local"}));

        let event = client.next().await;
        assert_eq!(event.get("event").unwrap(), "onConnect");
        assert_eq!(event.get("server").unwrap(), "local");
    }

    #[tokio::test]
    async fn corrupt_record_closes_the_connection() {
        let (_bot, port, _shutdown) = start(None).await;

        let mut client = TestClient::connect(port).await;
        client.next().await;

        client.stream.write_all(b"not json\r\n\r\n").await.unwrap();
        let response = client.next().await;
        assert_eq!(response.get("errorCategory").unwrap(), "irccd");
        client.expect_closed().await;
    }
}
