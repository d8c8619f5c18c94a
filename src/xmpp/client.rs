//! The network driver: socket setup (with optional HTTP CONNECT proxy),
//! TLS (direct or STARTTLS), SASL authentication, resource binding, and
//! the live event loop feeding the session.
//!
//! All session state is owned by this driver's task; external callers
//! talk to it through the [`Command`] channel and observe it through the
//! session hooks they registered before [`Client::run`].

use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_native_tls::TlsConnector;
use tracing::{debug, error, info, warn};

use super::bus::{HandlerTier, StanzaBus, StanzaKind};
use super::element::Element;
use super::iq::{Bookmark, IqRequestKind};
use super::sasl::{self, ScramSha1};
use super::session::{Session, SessionState};
use super::stanzas::{self, ChatState};
use super::stream::{StreamEvent, XmlStream};
use super::ns;
use crate::backoff::Backoff;
use crate::config::{parse_fingerprint, Config};
use crate::events::EventContext;
use crate::roster::Presence;

/// How long a connection must be up before the reconnect backoff resets.
const STABILITY_THRESHOLD: Duration = Duration::from_secs(60);

/// Consecutive reconnection attempts before giving up.
const MAX_RECONNECT_ATTEMPTS: u32 = 20;

/// Negotiation read timeout.
const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Commands posted into the driver loop from other tasks.
#[derive(Debug)]
pub enum Command {
    SendMessage {
        to: String,
        body: String,
        subject: Option<String>,
    },
    SendChatState {
        to: String,
        state: ChatState,
    },
    SetStatus {
        status: Presence,
        message: Option<String>,
    },
    AddBuddy {
        jid: String,
        name: Option<String>,
        group: Option<String>,
    },
    UpdateBuddy {
        jid: String,
        name: Option<String>,
        group: Option<String>,
    },
    DelBuddy {
        jid: String,
    },
    JoinMuc {
        room: String,
        nick: String,
        password: Option<String>,
    },
    Request {
        jid: String,
        kind: IqRequestKind,
    },
    ResolveEvent {
        id: String,
        context: EventContext,
    },
    SetCarbons(bool),
    SetBookmark(Bookmark),
    DelBookmark(String),
    SetRosterNote {
        jid: String,
        note: Option<String>,
    },
    SendRaw(String),
    Disconnect,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Orderly `</stream:stream>` from the server.
    StreamClosed,
    /// Server stream error; carries the condition.
    StreamError(String),
    /// Session replaced by another client with the same resource.
    Conflict,
    /// Transport dropped or parser failure.
    ConnectionLost,
    AuthFailed,
    UserRequest,
}

trait Duplex: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Duplex for T {}
type BoxStream = Box<dyn Duplex>;

pub struct Client {
    session: Session,
    bus: StanzaBus<Session>,
}

impl Client {
    pub fn new(config: Config) -> Self {
        let mut bus = StanzaBus::new();
        // Built-in handler registration mirrors the dispatch order the
        // protocol wants: subscription presences before status
        // presences, iq services before the not-implemented fallback.
        bus.register(StanzaKind::Presence, HandlerTier::Normal, |s: &mut Session, el| {
            s.handle_s10n_stanza(el)
        });
        bus.register(StanzaKind::Presence, HandlerTier::Last, |s: &mut Session, el| {
            s.handle_presence_stanza(el)
        });
        bus.register(StanzaKind::Message, HandlerTier::Normal, |s: &mut Session, el| {
            s.handle_message_stanza(el)
        });
        bus.register(StanzaKind::Iq, HandlerTier::Normal, |s: &mut Session, el| {
            s.handle_iq_stanza(el)
        });
        bus.register(StanzaKind::Iq, HandlerTier::Last, |s: &mut Session, el| {
            s.handle_iq_fallback(el)
        });
        Self {
            session: Session::new(config),
            bus,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    /// Routes one inbound stanza through the bus and registers any IQ
    /// callbacks the handlers queued.
    pub fn handle_stanza(&mut self, el: &Element) {
        self.flush_queued_iq();
        self.bus.dispatch(&mut self.session, el);
        self.flush_queued_iq();
    }

    pub(crate) fn flush_queued_iq(&mut self) {
        for (id, callback) in self.session.take_queued_iq() {
            self.bus.expect_reply(id, callback);
        }
    }

    #[cfg(test)]
    pub(crate) fn bus_pending(&self, id: &str) -> bool {
        self.bus.has_pending(id)
    }

    fn apply_command(&mut self, command: Command) -> Option<DisconnectReason> {
        match command {
            Command::SendMessage { to, body, subject } => {
                self.session
                    .send_message(&to, &body, subject.as_deref(), false);
            }
            Command::SendChatState { to, state } => {
                self.session.send_chat_state(&to, state);
            }
            Command::SetStatus { status, message } => {
                self.session.set_status(status, None, message.as_deref());
            }
            Command::AddBuddy { jid, name, group } => {
                self.session
                    .add_buddy(&jid, name.as_deref(), group.as_deref());
            }
            Command::UpdateBuddy { jid, name, group } => {
                self.session
                    .update_buddy(&jid, name.as_deref(), group.as_deref());
            }
            Command::DelBuddy { jid } => self.session.del_buddy(&jid),
            Command::JoinMuc {
                room,
                nick,
                password,
            } => self.session.join_muc(&room, &nick, password.as_deref()),
            Command::Request { jid, kind } => self.session.request(&jid, kind),
            Command::ResolveEvent { id, context } => {
                self.session.resolve_event(&id, context)
            }
            Command::SetCarbons(enable) => {
                if enable {
                    self.session.carbons_enable();
                } else {
                    self.session.carbons_disable();
                }
            }
            Command::SetBookmark(bookmark) => self.session.set_bookmark(bookmark),
            Command::DelBookmark(roomjid) => self.session.del_bookmark(&roomjid),
            Command::SetRosterNote { jid, note } => {
                self.session.set_rosternote(&jid, note.as_deref())
            }
            Command::SendRaw(raw) => self.session.send_raw(raw),
            Command::Disconnect => return Some(DisconnectReason::UserRequest),
        }
        self.flush_queued_iq();
        None
    }

    /// Connects and keeps the session alive, reconnecting with jitter
    /// after a live session drops. Returns when the user disconnects or
    /// on a non-recoverable condition.
    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) -> Result<()> {
        let mut backoff = Backoff::reconnect();
        loop {
            info!(
                "Connecting to XMPP server (attempt {})...",
                backoff.attempt + 1
            );
            let connected_at = Instant::now();
            let outcome = self.run_session(&mut commands).await;

            let was_live = matches!(
                self.session.state(),
                SessionState::Live | SessionState::Closing
            );
            self.bus.cancel_all(&mut self.session);
            self.session.on_disconnect();

            let reason = match outcome {
                Ok(reason) => reason,
                Err(e) => {
                    if e.downcast_ref::<AuthError>().is_some() {
                        // Wrong credentials won't fix themselves
                        return Err(e);
                    }
                    if !was_live {
                        return Err(e.context("cannot connect"));
                    }
                    warn!("Connection error: {e}");
                    DisconnectReason::ConnectionLost
                }
            };

            match reason {
                DisconnectReason::UserRequest => {
                    info!("Disconnected");
                    return Ok(());
                }
                DisconnectReason::AuthFailed => {
                    bail!("Authentication failed");
                }
                DisconnectReason::Conflict => {
                    // Reconnecting would ping-pong with the other client
                    bail!("Session replaced by another client (conflict)");
                }
                DisconnectReason::StreamError(ref condition) => {
                    warn!("Stream error: {condition}");
                }
                _ => {}
            }

            if !was_live {
                bail!("Connection failed before going live");
            }
            if connected_at.elapsed() >= STABILITY_THRESHOLD {
                backoff.reset();
            }
            if backoff.exceeded_max_attempts(MAX_RECONNECT_ATTEMPTS) {
                bail!("Max reconnection attempts ({MAX_RECONNECT_ATTEMPTS}) exceeded");
            }
            let delay = backoff.next_delay();
            info!("Reconnecting in {}s...", delay.as_secs());
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                command = commands.recv() => {
                    match command {
                        Some(Command::Disconnect) | None => return Ok(()),
                        // Any other command is a user-initiated
                        // reconnect: retry immediately
                        Some(command) => { self.apply_command(command); }
                    }
                }
            }
        }
    }

    /// One connection attempt: negotiate, then serve the live loop until
    /// the stream ends one way or another.
    async fn run_session(
        &mut self,
        commands: &mut mpsc::UnboundedReceiver<Command>,
    ) -> Result<DisconnectReason> {
        self.session.set_state(SessionState::Connecting);
        let (mut wire, features) = self.establish_transport().await?;
        // A fresh TLS transport still needs its stream opened; the plain
        // path already consumed the features during the STARTTLS decision
        let features = match features {
            Some(features) => features,
            None => {
                let domain = self.session.config.domain().to_string();
                wire.send_str(&XmlStream::open_stream(ns::CLIENT, &domain, None))
                    .await?;
                wire.expect_features().await?
            }
        };

        self.authenticate(&mut wire, features).await?;
        self.bind_resource(&mut wire).await?;

        self.session.on_live();
        self.flush_queued_iq();

        self.live_loop(wire, commands).await
    }

    // ── transport setup ─────────────────────────────────

    async fn establish_transport(
        &mut self,
    ) -> Result<(Wire<BoxStream>, Option<stanzas::StreamFeatures>)> {
        let config = &self.session.config;
        let host = config.connect_host().to_string();
        let port = config.connect_port();
        let domain = config.domain().to_string();
        let tracelog = config.tracelog_level;

        if let Some(ciphers) = &config.ssl_ciphers {
            warn!("ssl_ciphers = '{ciphers}' is not supported by the TLS backend, ignoring");
        }

        let tcp = self.connect_tcp(&host, port).await?;
        info!("TCP connected to {host}:{port}");

        if self.session.config.ssl {
            // Direct SSL: handshake before any XML
            self.session.set_state(SessionState::TlsNegotiating);
            let tls = self.tls_handshake(tcp, &domain).await?;
            return Ok((Wire::new(Box::new(tls), tracelog), None));
        }

        // Plain stream first; upgrade via STARTTLS when wanted
        let mut wire = Wire::new(Box::new(tcp) as BoxStream, tracelog);
        wire.send_str(&XmlStream::open_stream(ns::CLIENT, &domain, None))
            .await?;
        let features = wire.expect_features().await?;

        let starttls = self.session.config.tls;
        if !features.starttls && starttls {
            bail!("Server does not advertise STARTTLS");
        }
        if features.starttls && (starttls || features.starttls_required) {
            wire.send(&stanzas::build_starttls()).await?;
            let proceed = wire.next_stanza().await?;
            if !stanzas::is_tls_proceed(&proceed) {
                bail!("STARTTLS refused: <{}>", proceed.name);
            }
            self.session.set_state(SessionState::TlsNegotiating);
            let tcp = wire.into_inner();
            let tls = self.tls_handshake(tcp, &domain).await?;
            info!("TLS established");
            return Ok((Wire::new(Box::new(tls), tracelog), None));
        }

        debug!("continuing without TLS");
        Ok((wire, Some(features)))
    }

    async fn connect_tcp(&self, host: &str, port: u16) -> Result<TcpStream> {
        let config = &self.session.config;
        let Some(proxy_host) = &config.proxy_host else {
            return TcpStream::connect((host, port))
                .await
                .with_context(|| format!("connecting to {host}:{port}"));
        };
        let proxy_port = config.proxy_port.unwrap_or(3128);
        let mut stream = TcpStream::connect((proxy_host.as_str(), proxy_port))
            .await
            .with_context(|| format!("connecting to proxy {proxy_host}:{proxy_port}"))?;
        info!("using proxy {proxy_host}:{proxy_port}");

        let mut request = format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n");
        if let (Some(user), Some(pass)) = (&config.proxy_user, &config.proxy_pass) {
            use base64::Engine;
            let credentials = base64::engine::general_purpose::STANDARD
                .encode(format!("{user}:{pass}"));
            request.push_str(&format!("Proxy-Authorization: Basic {credentials}\r\n"));
        }
        request.push_str("\r\n");
        stream.write_all(request.as_bytes()).await?;

        // Read the proxy status line and headers
        let mut response = Vec::new();
        let mut byte = [0u8; 1];
        while !response.ends_with(b"\r\n\r\n") {
            let n = tokio::time::timeout(NEGOTIATION_TIMEOUT, stream.read(&mut byte))
                .await
                .context("proxy response timeout")??;
            if n == 0 {
                bail!("Proxy closed the connection");
            }
            response.push(byte[0]);
            if response.len() > 8192 {
                bail!("Oversized proxy response");
            }
        }
        let status = String::from_utf8_lossy(&response);
        let ok = status
            .lines()
            .next()
            .map(|line| line.contains(" 200 ") || line.ends_with(" 200"))
            .unwrap_or(false);
        if !ok {
            bail!("Proxy CONNECT failed: {}", status.lines().next().unwrap_or(""));
        }
        Ok(stream)
    }

    async fn tls_handshake<S: AsyncRead + AsyncWrite + Unpin>(
        &self,
        stream: S,
        domain: &str,
    ) -> Result<tokio_native_tls::TlsStream<S>> {
        let config = &self.session.config;
        let mut builder = native_tls::TlsConnector::builder();
        if config.ssl_ignore_checks {
            builder
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true);
        }
        if let Some(ca_path) = &config.ssl_ca {
            let pem = std::fs::read(ca_path)
                .with_context(|| format!("reading ssl_ca {}", ca_path.display()))?;
            let cert = native_tls::Certificate::from_pem(&pem)?;
            builder.add_root_certificate(cert);
        }
        let connector = TlsConnector::from(builder.build()?);
        let tls = connector
            .connect(domain, stream)
            .await
            .context("TLS handshake")?;
        self.check_fingerprint(&tls)?;
        Ok(tls)
    }

    /// A configured fingerprint must match the peer certificate, even in
    /// ignore-checks mode.
    fn check_fingerprint<S: AsyncRead + AsyncWrite + Unpin>(
        &self,
        tls: &tokio_native_tls::TlsStream<S>,
    ) -> Result<()> {
        let Some(expected) = &self.session.config.ssl_fingerprint else {
            return Ok(());
        };
        let expected =
            parse_fingerprint(expected).ok_or_else(|| anyhow!("Bad ssl_fingerprint"))?;
        let cert = tls
            .get_ref()
            .peer_certificate()?
            .ok_or_else(|| anyhow!("No certificate found!"))?;
        let der = cert.to_der()?;
        let got = Sha1::digest(&der);
        if got.as_slice() != expected.as_slice() {
            bail!(
                "Certificate fingerprint mismatch! Remote fingerprint: {}",
                hex_fingerprint(&got)
            );
        }
        Ok(())
    }

    // ── SASL & bind ─────────────────────────────────────

    async fn authenticate(
        &mut self,
        wire: &mut Wire<BoxStream>,
        features: stanzas::StreamFeatures,
    ) -> Result<()> {
        self.session.set_state(SessionState::Authenticating);
        let config = &self.session.config;
        let username = config.username().to_string();
        let password = config.password.clone();
        debug!("SASL mechanisms: {:?}", features.mechanisms);

        let auth_failed = |el: &Element| -> anyhow::Error {
            let condition = stanzas::sasl_failure_condition(el);
            error!("Authentication failed: {condition}");
            anyhow::Error::new(AuthError(condition))
        };

        if features.mechanisms.iter().any(|m| m == "SCRAM-SHA-1") {
            let mut scram = ScramSha1::new(&username, &password);
            wire.send(&stanzas::build_sasl_auth("SCRAM-SHA-1", &scram.client_first()))
                .await?;
            let challenge = wire.next_stanza().await?;
            match challenge.name.as_str() {
                "challenge" => {}
                "failure" => return Err(auth_failed(&challenge)),
                other => bail!("Expected SASL challenge, got <{other}>"),
            }
            let response = scram.handle_challenge(&challenge.text())?;
            wire.send(&stanzas::build_sasl_response(&response)).await?;
            let outcome = wire.next_stanza().await?;
            match outcome.name.as_str() {
                "success" => scram.verify_success(Some(&outcome.text()))?,
                _ => return Err(auth_failed(&outcome)),
            }
            info!("SASL SCRAM-SHA-1 authentication successful");
        } else if features.mechanisms.iter().any(|m| m == "PLAIN") {
            wire.send(&stanzas::build_sasl_auth(
                "PLAIN",
                &sasl::plain_payload(&username, &password),
            ))
            .await?;
            let outcome = wire.next_stanza().await?;
            if outcome.name != "success" {
                return Err(auth_failed(&outcome));
            }
            info!("SASL PLAIN authentication successful");
        } else {
            bail!(
                "No supported SASL mechanism (need SCRAM-SHA-1 or PLAIN, got {:?})",
                features.mechanisms
            );
        }
        Ok(())
    }

    async fn bind_resource(&mut self, wire: &mut Wire<BoxStream>) -> Result<()> {
        self.session.set_state(SessionState::Binding);
        let domain = self.session.config.domain().to_string();
        let resource = self.session.config.effective_resource();

        // A fresh XML document follows SASL
        wire.reset();
        wire.send_str(&XmlStream::open_stream(ns::CLIENT, &domain, None))
            .await?;
        let features = wire.expect_features().await?;

        let bind_id = self.session.new_stanza_id();
        wire.send(&stanzas::build_bind(&bind_id, &resource)).await?;
        let reply = loop {
            let stanza = wire.next_stanza().await?;
            if stanza.name == "iq" && stanza.attr("id") == Some(bind_id.as_str()) {
                break stanza;
            }
            debug!("ignoring pre-bind stanza <{}>", stanza.name);
        };
        let jid = stanzas::bound_jid(&reply)
            .ok_or_else(|| anyhow!("Failed to bind resource: {}", reply.serialize()))?;
        info!("Bound as {jid}");
        self.session.set_self_jid(jid);

        // Legacy session establishment (RFC 3921), still advertised by
        // some servers
        if features.session {
            let session_id = self.session.new_stanza_id();
            let iq = stanzas::build_iq(
                stanzas::IqKind::Set,
                &session_id,
                None,
                Element::new("session").with_attr("xmlns", ns::SESSION),
            );
            wire.send(&iq).await?;
            loop {
                let stanza = wire.next_stanza().await?;
                if stanza.name == "iq" && stanza.attr("id") == Some(session_id.as_str()) {
                    break;
                }
                debug!("ignoring pre-session stanza <{}>", stanza.name);
            }
        }
        Ok(())
    }

    // ── live loop ───────────────────────────────────────

    async fn live_loop(
        &mut self,
        wire: Wire<BoxStream>,
        commands: &mut mpsc::UnboundedReceiver<Command>,
    ) -> Result<DisconnectReason> {
        let Wire {
            stream, mut xs, ..
        } = wire;
        let (reader, mut writer) = tokio::io::split(stream);

        // The read task only moves bytes; parsing stays on this task
        let (bytes_tx, mut bytes_rx) = mpsc::channel::<Vec<u8>>(32);
        let read_handle = tokio::spawn(async move {
            let mut reader = reader;
            let mut buf = vec![0u8; 65536];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if bytes_tx.send(buf[..n].to_vec()).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let ping_interval = self.session.config.pinginterval;
        let mut keepalive = tokio::time::interval(Duration::from_secs(
            if ping_interval == 0 { 3600 } else { ping_interval },
        ));
        keepalive.tick().await; // the first tick fires immediately
        let mut sweeper = tokio::time::interval(Duration::from_secs(5));
        sweeper.tick().await;

        let result = 'live: loop {
            // Everything the handlers produced goes out before we wait
            for data in self.session.take_outbound() {
                if self.session.config.tracelog_level >= 2 {
                    debug!("send: {data}");
                }
                if let Err(e) = writer.write_all(data.as_bytes()).await {
                    error!("Write error: {e}");
                    break 'live DisconnectReason::ConnectionLost;
                }
            }

            tokio::select! {
                chunk = bytes_rx.recv() => {
                    let Some(chunk) = chunk else {
                        warn!("XMPP connection closed by server");
                        break 'live DisconnectReason::ConnectionLost;
                    };
                    if self.session.config.tracelog_level >= 2 {
                        debug!("recv: {}", String::from_utf8_lossy(&chunk));
                    }
                    let events = xs.feed(&chunk);
                    if let Some(reason) = self.process_events(events) {
                        break 'live reason;
                    }
                }
                command = commands.recv() => {
                    let Some(command) = command else {
                        break 'live DisconnectReason::UserRequest;
                    };
                    if let Some(reason) = self.apply_command(command) {
                        // Orderly close: announce unavailability first
                        self.session.set_status(Presence::Offline, None, Some(""));
                        for data in self.session.take_outbound() {
                            let _ = writer.write_all(data.as_bytes()).await;
                        }
                        let _ = writer.write_all(b"</stream:stream>").await;
                        break 'live reason;
                    }
                }
                _ = keepalive.tick(), if ping_interval > 0 => {
                    // Whitespace keep-alive
                    if writer.write_all(b" ").await.is_err() {
                        break 'live DisconnectReason::ConnectionLost;
                    }
                }
                _ = sweeper.tick() => {
                    let timeout = self.session.config.iq_timeout;
                    if timeout > 0 {
                        self.bus.expire_pending(
                            &mut self.session,
                            Duration::from_secs(timeout),
                            Instant::now(),
                        );
                    }
                    self.session.expire_events();
                    self.flush_queued_iq();
                }
            }
        };

        read_handle.abort();
        Ok(result)
    }

    fn process_events(&mut self, events: Vec<StreamEvent>) -> Option<DisconnectReason> {
        for event in events {
            match event {
                StreamEvent::Stanza(el) => {
                    if el.name == "stream:error" || el.name == "error" {
                        let condition = el
                            .child_elements()
                            .next()
                            .map(|c| c.name.clone())
                            .unwrap_or_else(|| "undefined-condition".to_string());
                        error!("Stream error: {condition}");
                        return Some(if condition == "conflict" {
                            DisconnectReason::Conflict
                        } else {
                            DisconnectReason::StreamError(condition)
                        });
                    }
                    self.handle_stanza(&el);
                }
                StreamEvent::StreamEnd => return Some(DisconnectReason::StreamClosed),
                StreamEvent::StreamError { kind, detail } => {
                    error!("Fatal stream parse condition {kind:?}: {detail}");
                    return Some(DisconnectReason::ConnectionLost);
                }
                StreamEvent::StreamStart { .. } => {}
            }
        }
        None
    }
}

/// Typed auth failure so the supervisor can tell it apart from transport
/// errors (auth failures never auto-reconnect).
#[derive(Debug)]
pub struct AuthError(pub String);

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "authentication failed: {}", self.0)
    }
}

impl std::error::Error for AuthError {}

fn hex_fingerprint(digest: &[u8]) -> String {
    digest
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// A transport plus the incremental parser, with an event queue for the
/// sequential negotiation phases.
struct Wire<S> {
    stream: S,
    xs: XmlStream,
    queue: std::collections::VecDeque<StreamEvent>,
    tracelog_level: u8,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Wire<S> {
    fn new(stream: S, tracelog_level: u8) -> Self {
        Self {
            stream,
            xs: XmlStream::new(),
            queue: std::collections::VecDeque::new(),
            tracelog_level,
        }
    }

    fn reset(&mut self) {
        self.xs.reset();
        self.queue.clear();
    }

    fn into_inner(self) -> S {
        self.stream
    }

    async fn send_str(&mut self, data: &str) -> Result<()> {
        if self.tracelog_level >= 2 {
            debug!("send: {data}");
        }
        self.stream.write_all(data.as_bytes()).await?;
        Ok(())
    }

    async fn send(&mut self, stanza: &Element) -> Result<()> {
        self.send_str(&XmlStream::serialize(stanza)).await
    }

    async fn next_event(&mut self) -> Result<StreamEvent> {
        loop {
            if let Some(event) = self.queue.pop_front() {
                if let StreamEvent::StreamError { kind, detail } = &event {
                    bail!("Stream parse error during negotiation: {kind:?}: {detail}");
                }
                return Ok(event);
            }
            let mut buf = vec![0u8; 8192];
            let n = tokio::time::timeout(NEGOTIATION_TIMEOUT, self.stream.read(&mut buf))
                .await
                .context("negotiation timeout")??;
            if n == 0 {
                bail!("Connection closed during negotiation");
            }
            if self.tracelog_level >= 2 {
                debug!("recv: {}", String::from_utf8_lossy(&buf[..n]));
            }
            self.queue.extend(self.xs.feed(&buf[..n]));
        }
    }

    /// Next top-level stanza, skipping the stream header.
    async fn next_stanza(&mut self) -> Result<Element> {
        loop {
            match self.next_event().await? {
                StreamEvent::Stanza(el) => {
                    if el.name == "stream:error" || el.name == "error" {
                        let condition = el
                            .child_elements()
                            .next()
                            .map(|c| c.name.clone())
                            .unwrap_or_default();
                        bail!("Stream error during negotiation: {condition}");
                    }
                    return Ok(el);
                }
                StreamEvent::StreamStart { .. } => continue,
                StreamEvent::StreamEnd => bail!("Stream closed during negotiation"),
                StreamEvent::StreamError { .. } => unreachable!(),
            }
        }
    }

    async fn expect_features(&mut self) -> Result<stanzas::StreamFeatures> {
        let stanza = self.next_stanza().await?;
        if !stanzas::is_features(&stanza) {
            bail!("Expected stream features, got <{}>", stanza.name);
        }
        Ok(stanzas::parse_features(&stanza))
    }
}
