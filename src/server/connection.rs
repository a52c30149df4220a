//! Connection task for one IRC server: socket lifecycle, registration,
//! ping discipline, outbound rate limiting and reconnect with budget.

use std::sync::Arc;
use std::time::Duration;

use leaky_bucket::RateLimiter;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::net::{TcpStream, lookup_host};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bot::BotSignal;
use crate::parsing::{IrcMessage, IrcParser, LineBuffer};
use crate::server::event::{Event, EventFactory};
use crate::server::{Server, ServerCommand, SessionState};

pub type SessionResult<T> = core::result::Result<T, SessionError>;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("no resolved address matches the configured families")]
    NoUsableAddress,

    #[error("hostname is not a valid TLS server name")]
    InvalidTlsName,
}

trait SessionStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> SessionStream for T {}

/// How one session ended.
enum SessionEnd {
    /// Explicit QUIT; do not reconnect.
    Quit,
    /// Global shutdown; do not reconnect.
    Shutdown,
    /// Socket error, EOF or ping timeout; reconnect per budget.
    Lost,
    /// Explicit reconnect request; reconnect without touching the budget.
    Restart,
}

/// Drives one server until it quits, is shut down, or exhausts its
/// reconnect budget. In the latter case a `Retired` signal asks the bot to
/// drop the server from the directory.
pub async fn run(
    server: Arc<Server>,
    mut cmd_rx: UnboundedReceiver<ServerCommand>,
    signals: UnboundedSender<BotSignal>,
    shutdown: CancellationToken,
) {
    let mut tries: i32 = 0;

    'outer: loop {
        server.set_state(SessionState::Connecting).await;
        server.clear_channels().await;

        let attempt = match establish(&server).await {
            Ok(stream) => {
                session(&server, stream, &mut cmd_rx, &signals, &shutdown).await
            }
            Err(err) => {
                warn!(server = server.name(), error = %err, "connect failed");
                (SessionEnd::Lost, false)
            }
        };

        server.set_state(SessionState::Disconnected).await;
        server.clear_channels().await;

        let (end, was_connected) = attempt;
        if was_connected {
            tries = 0;
            let _ = signals.send(BotSignal::Event(Event::Disconnect {
                server: server.clone(),
            }));
        }

        match end {
            SessionEnd::Quit | SessionEnd::Shutdown => break,
            SessionEnd::Restart => continue,
            SessionEnd::Lost => {
                tries += 1;
                let budget = server.config().reconnect_tries;
                let allowed = budget < 0 || tries <= budget;

                if !allowed {
                    info!(
                        server = server.name(),
                        tries, "reconnect budget exhausted, retiring server"
                    );
                    let _ = signals.send(BotSignal::Retired(server.name().to_string()));
                    break;
                }

                debug!(
                    server = server.name(),
                    delay = ?server.config().reconnect_delay,
                    attempt = tries,
                    "scheduling reconnect"
                );

                let deadline = Instant::now() + server.config().reconnect_delay;
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break 'outer,
                        _ = sleep_until(deadline) => break,
                        cmd = cmd_rx.recv() => match cmd {
                            Some(ServerCommand::Quit(_)) | None => break 'outer,
                            Some(ServerCommand::Reconnect) => break,
                            // queued lines have no session to go to
                            Some(ServerCommand::Line(_)) => continue,
                        },
                    }
                }
            }
        }
    }

    server.set_state(SessionState::Disconnected).await;
    debug!(server = server.name(), "connection task finished");
}

/// Resolves the endpoint honouring the ipv4/ipv6 flags and performs the TCP
/// and, when enabled, TLS handshake.
async fn establish(server: &Arc<Server>) -> SessionResult<Box<dyn SessionStream>> {
    let config = server.config();
    let addrs = lookup_host((config.hostname.as_str(), config.port)).await?;

    let mut last_err = None;
    let mut tcp = None;

    for addr in addrs {
        if (addr.is_ipv4() && !config.ipv4) || (addr.is_ipv6() && !config.ipv6) {
            continue;
        }

        match TcpStream::connect(addr).await {
            Ok(stream) => {
                tcp = Some(stream);
                break;
            }
            Err(err) => last_err = Some(err),
        }
    }

    let tcp = match tcp {
        Some(stream) => stream,
        None => {
            return Err(last_err
                .map(SessionError::Io)
                .unwrap_or(SessionError::NoUsableAddress));
        }
    };

    if !config.ssl {
        return Ok(Box::new(tcp));
    }

    debug!(server = config.name, "starting TLS handshake");
    let stream = tls::connect(&config.hostname, config.ssl_verify, tcp).await?;
    Ok(Box::new(stream))
}

/// One established session, from registration to whatever ends it. The
/// second element reports whether the 001 welcome was reached, which is
/// what gates the onDisconnect event and the budget reset.
async fn session(
    server: &Arc<Server>,
    stream: Box<dyn SessionStream>,
    cmd_rx: &mut UnboundedReceiver<ServerCommand>,
    signals: &UnboundedSender<BotSignal>,
    shutdown: &CancellationToken,
) -> (SessionEnd, bool) {
    let config = server.config().clone();
    let (mut reader, mut writer) = tokio::io::split(stream);

    server.set_state(SessionState::Handshaking).await;

    // registration sequence; not subject to the user rate limit
    if let Some(password) = &config.password {
        if write_line(&mut writer, &format!("PASS {}", password)).await.is_err() {
            return (SessionEnd::Lost, false);
        }
    }
    if write_line(&mut writer, &format!("NICK {}", config.nickname)).await.is_err() {
        return (SessionEnd::Lost, false);
    }
    if write_line(
        &mut writer,
        &format!("USER {} 0 * :{}", config.username, config.realname),
    )
    .await
    .is_err()
    {
        return (SessionEnd::Lost, false);
    }

    // modest pacing for user-submitted lines
    let limiter = RateLimiter::builder()
        .initial(1)
        .max(1)
        .refill(1)
        .interval(Duration::from_millis(500))
        .build();

    let parser = IrcParser::new();
    let mut lines = LineBuffer::new();
    let mut factory = EventFactory::new();
    let mut connected = false;

    let mut buf = [0u8; 4096];
    let mut last_activity = Instant::now();
    let mut ping_sent = false;

    loop {
        // send a probe PING halfway, give up at the full ping timeout
        let deadline = if ping_sent {
            last_activity + config.ping_timeout
        } else {
            last_activity + config.ping_timeout / 2
        };

        tokio::select! {
            _ = shutdown.cancelled() => {
                server.set_state(SessionState::Disconnecting).await;
                let _ = write_line(&mut writer, "QUIT :shutting down").await;
                return (SessionEnd::Shutdown, connected);
            }

            read = reader.read(&mut buf) => {
                let n = match read {
                    Ok(0) => {
                        info!(server = config.name, "remote closed the connection");
                        return (SessionEnd::Lost, connected);
                    }
                    Ok(n) => n,
                    Err(err) => {
                        warn!(server = config.name, error = %err, "read error");
                        return (SessionEnd::Lost, connected);
                    }
                };

                last_activity = Instant::now();
                ping_sent = false;

                lines.extend(&String::from_utf8_lossy(&buf[..n]));
                while let Some(line) = lines.next_line() {
                    match handle_line(server, &parser, &mut factory, &mut writer, &line, signals)
                        .await
                    {
                        Ok(reached_welcome) => connected = connected || reached_welcome,
                        Err(err) => {
                            warn!(server = config.name, error = %err, "write error");
                            return (SessionEnd::Lost, connected);
                        }
                    }
                }
            }

            cmd = cmd_rx.recv() => match cmd {
                Some(ServerCommand::Line(line)) => {
                    limiter.acquire_one().await;
                    if let Err(err) = write_line(&mut writer, &line).await {
                        warn!(server = config.name, error = %err, "write error");
                        return (SessionEnd::Lost, connected);
                    }
                }
                Some(ServerCommand::Quit(reason)) => {
                    server.set_state(SessionState::Disconnecting).await;
                    let quit = match reason {
                        Some(reason) => format!("QUIT :{}", reason),
                        None => "QUIT".to_string(),
                    };
                    let _ = write_line(&mut writer, &quit).await;
                    return (SessionEnd::Quit, connected);
                }
                Some(ServerCommand::Reconnect) => {
                    server.set_state(SessionState::Disconnecting).await;
                    let _ = write_line(&mut writer, "QUIT :reconnecting").await;
                    return (SessionEnd::Restart, connected);
                }
                None => return (SessionEnd::Quit, connected),
            },

            _ = sleep_until(deadline) => {
                if ping_sent {
                    warn!(
                        server = config.name,
                        timeout = ?config.ping_timeout,
                        "ping timeout"
                    );
                    return (SessionEnd::Lost, connected);
                }

                ping_sent = true;
                if write_line(&mut writer, &format!("PING :{}", config.hostname))
                    .await
                    .is_err()
                {
                    return (SessionEnd::Lost, connected);
                }
            }
        }
    }
}

/// Handles one inbound line: protocol keepalives and CTCP queries are
/// answered in place, everything else goes through the synthesis table.
/// Returns `Ok(true)` when the line was the 001 welcome.
async fn handle_line(
    server: &Arc<Server>,
    parser: &IrcParser,
    factory: &mut EventFactory,
    writer: &mut WriteHalf<Box<dyn SessionStream>>,
    line: &str,
    signals: &UnboundedSender<BotSignal>,
) -> std::io::Result<bool> {
    let config = server.config();

    let msg = match parser.parse(line) {
        Ok(msg) => msg,
        Err(err) => {
            warn!(server = config.name, error = %err, line, "dropping malformed line");
            return Ok(false);
        }
    };

    match msg.command.as_str() {
        "PING" => {
            let token = msg.param(0);
            write_line(writer, &format!("PONG :{}", token)).await?;
            return Ok(false);
        }

        "001" => {
            if !msg.param(0).is_empty() {
                server.set_nickname(msg.param(0)).await;
            }
            server.set_state(SessionState::Connected).await;
            info!(server = config.name, nickname = msg.param(0), "registered");

            let _ = signals.send(BotSignal::Event(Event::Connect {
                server: server.clone(),
            }));

            for spec in &config.channels {
                server.join(&spec.name, spec.key.as_deref()).await;
            }

            return Ok(true);
        }

        "PRIVMSG" => {
            // CTCP queries answered here, never dispatched
            if let Some(ctcp) = IrcMessage::ctcp(msg.param(1)) {
                let query = ctcp.split_whitespace().next().unwrap_or("");
                match query {
                    "VERSION" if !config.ctcp_version.is_empty() => {
                        let reply = IrcMessage::new(
                            "NOTICE",
                            vec![
                                msg.origin().to_string(),
                                IrcMessage::ctcp_wrap(&format!(
                                    "VERSION {}",
                                    config.ctcp_version
                                )),
                            ],
                        );
                        write_line(writer, &reply.to_string()).await?;
                        return Ok(false);
                    }
                    "SOURCE" if !config.ctcp_source.is_empty() => {
                        let reply = IrcMessage::new(
                            "NOTICE",
                            vec![
                                msg.origin().to_string(),
                                IrcMessage::ctcp_wrap(&format!(
                                    "SOURCE {}",
                                    config.ctcp_source
                                )),
                            ],
                        );
                        write_line(writer, &reply.to_string()).await?;
                        return Ok(false);
                    }
                    _ => {}
                }
            }
        }

        _ => {}
    }

    if let Some(event) = factory.synthesize(server, &msg).await {
        // flag-driven reactions to our own situation
        match &event {
            Event::Kick {
                channel, target, ..
            } if config.auto_rejoin && server.is_self(target).await => {
                server.join(channel, None).await;
            }
            Event::Invite {
                channel, target, ..
            } if config.join_invite && server.is_self(target).await => {
                server.join(channel, None).await;
            }
            _ => {}
        }

        let _ = signals.send(BotSignal::Event(event));
    }

    Ok(false)
}

async fn write_line(
    writer: &mut WriteHalf<Box<dyn SessionStream>>,
    line: &str,
) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\r\n").await
}

mod tls {
    use std::sync::Arc;

    use tokio::net::TcpStream;
    use tokio_rustls::TlsConnector;
    use tokio_rustls::client::TlsStream;
    use tokio_rustls::rustls::client::danger::{
        HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
    };
    use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use tokio_rustls::rustls::{
        self, ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme,
    };

    use super::SessionError;

    pub async fn connect(
        hostname: &str,
        verify: bool,
        tcp: TcpStream,
    ) -> Result<TlsStream<TcpStream>, SessionError> {
        let config = if verify {
            let mut roots = RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

            ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        } else {
            ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyCert::new()))
                .with_no_client_auth()
        };

        let connector = TlsConnector::from(Arc::new(config));
        let name = ServerName::try_from(hostname.to_string())
            .map_err(|_| SessionError::InvalidTlsName)?;

        Ok(connector.connect(name, tcp).await?)
    }

    /// Verifier used when `ssl-verify` is off: signatures are still checked,
    /// the certificate chain is not.
    #[derive(Debug)]
    struct AcceptAnyCert(rustls::crypto::CryptoProvider);

    impl AcceptAnyCert {
        fn new() -> Self {
            Self(rustls::crypto::aws_lc_rs::default_provider())
        }
    }

    impl ServerCertVerifier for AcceptAnyCert {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            rustls::crypto::verify_tls12_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            rustls::crypto::verify_tls13_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.0
                .signature_verification_algorithms
                .supported_schemes()
        }
    }
}
