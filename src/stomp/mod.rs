//! STOMP 1.1 broker sink.
//!
//! Publishes each event as a receipt-acknowledged `SEND` frame with a
//! `jms-map-xml` body to `/topic/<path>` over one long-lived connection.
//! The connection state machine is Disconnected → Connecting → Connected:
//! a write while disconnected starts a background connect task and reports
//! transient failure, so the delivery worker parks the sink in retry mode
//! (with a fast 2 s delay) until the handshake finishes.

pub mod frame;
pub mod url;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::event::LogEvent;
use crate::level::Level;
use crate::net::{Connector, TransportError, TransportReader};
use crate::sink::{LevelGate, Sink};
use crate::splitter::LineSplitter;

use self::frame::{Frame, FrameDecoder, FrameError};
use self::url::{StompUrl, UrlError};

/// Handshake reply must arrive within this window.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// A publish waits this long for its receipt.
const RECEIPT_TIMEOUT: Duration = Duration::from_secs(6);
/// Client-to-server heartbeat offer: none outgoing, 5 s incoming.
const HEARTBEAT_OFFER: &str = "0,5000";

#[derive(Debug, thiserror::Error)]
pub enum StompError {
    #[error(transparent)]
    Url(#[from] UrlError),
    #[error("only stomp and stomp+ssl protocols are supported, not {0:?}")]
    UnsupportedProtocol(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("no reply to CONNECT in time")]
    HandshakeTimeout,
    #[error("no receipt in time")]
    ReceiptTimeout,
    #[error("server speaks version {0:?}, we only speak 1.1")]
    UnsupportedVersion(String),
    #[error("cannot accept heart-beat header {0:?}")]
    UnsupportedHeartbeat(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("connection closed")]
    ConnectionClosed,
}

impl From<FrameError> for StompError {
    fn from(e: FrameError) -> Self {
        StompError::Protocol(e.to_string())
    }
}

struct Connection {
    writer: crate::net::TransportWriter,
    replies: mpsc::UnboundedReceiver<Frame>,
    reader: JoinHandle<()>,
}

struct ConnState {
    connected: AtomicBool,
    connecting: AtomicBool,
    connect_done: AtomicBool,
    conn: tokio::sync::Mutex<Option<Connection>>,
}

/// Sink publishing to a STOMP message broker.
pub struct StompSink {
    app_name: String,
    url: StompUrl,
    connector: Connector,
    host_tag: String,
    user_tag: String,
    gate: LevelGate,
    receipt: AtomicU64,
    state: Arc<ConnState>,
}

impl std::fmt::Debug for StompSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StompSink")
            .field("app_name", &self.app_name)
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

impl StompSink {
    /// Parse the broker URL and capture the host/user tags. `stomp+ssl://`
    /// enables TLS (self-signed broker certificates are tolerated). The
    /// connection itself is established lazily by the first write.
    pub fn new(app_name: &str, url: &str) -> Result<Self, StompError> {
        let url = StompUrl::parse(url)?;
        let mut connector = Connector::new(url.host.clone(), url.port);
        match url.protocol.as_str() {
            "stomp" => {}
            "stomp+ssl" => connector.use_tls(true),
            other => return Err(StompError::UnsupportedProtocol(other.to_owned())),
        }

        let host_tag = hostname::get()
            .map(|h| xml_escape(&h.to_string_lossy()))
            .unwrap_or_else(|_| "/UNKNOWN/".to_owned());
        let user_tag = std::env::var("USER")
            .or_else(|_| std::env::var("LOGNAME"))
            .map(|u| xml_escape(&u))
            .unwrap_or_else(|_| "/UNKNOWN/".to_owned());

        Ok(Self {
            app_name: xml_escape(app_name),
            url,
            connector,
            host_tag,
            user_tag,
            gate: LevelGate::default(),
            receipt: AtomicU64::new(0),
            state: Arc::new(ConnState {
                connected: AtomicBool::new(false),
                connecting: AtomicBool::new(false),
                connect_done: AtomicBool::new(false),
                conn: tokio::sync::Mutex::new(None),
            }),
        })
    }

    /// Route the connection through an unauthenticated SOCKS5 proxy.
    pub fn use_socks(&mut self, host: impl Into<String>, port: u16) {
        self.connector.use_socks(host, port);
    }

    /// Drive the state machine. Returns `true` only when a live connection
    /// is ready for a publish; otherwise a connect task is running (or has
    /// just been started) and the caller should report transient failure.
    fn ensure_connected(&self) -> bool {
        if self.state.connected.load(Ordering::Acquire) {
            return true;
        }
        if self.state.connecting.swap(true, Ordering::AcqRel) {
            if self.state.connect_done.load(Ordering::Acquire) {
                self.state.connecting.store(false, Ordering::Release);
                // a failed attempt leaves connected false; the next write
                // starts the cycle over
                self.state.connected.load(Ordering::Acquire)
            } else {
                // still trying to connect
                false
            }
        } else {
            tracing::debug!(host = %self.url.host, "starting connect task");
            self.state.connect_done.store(false, Ordering::Release);
            tokio::spawn(connect_task(
                self.state.clone(),
                self.connector.clone(),
                self.url.clone(),
            ));
            false
        }
    }

    async fn disconnect(&self) {
        self.state.connected.store(false, Ordering::Release);
        if let Some(mut conn) = self.state.conn.lock().await.take() {
            conn.writer.shutdown().await;
            conn.reader.abort();
        }
    }

    async fn publish(&self, event: &LogEvent) -> Result<(), StompError> {
        let receipt = self.receipt.fetch_add(1, Ordering::SeqCst) + 1;
        // omitting content-length is deliberate: with it, ActiveMQ delivers a
        // BytesMessage instead of a TextMessage to JMS subscribers
        let mut packet = format!(
            "SEND\ndestination:/topic/{}\ntransformation:jms-map-xml\nreceipt:{}\n\n{}",
            self.url.path,
            receipt,
            self.map_body(event),
        )
        .into_bytes();
        packet.push(0);

        let mut guard = self.state.conn.lock().await;
        let conn = guard.as_mut().ok_or(StompError::ConnectionClosed)?;
        conn.writer.write_all(&packet).await?;

        let reply = timeout(RECEIPT_TIMEOUT, conn.replies.recv())
            .await
            .map_err(|_| StompError::ReceiptTimeout)?
            .ok_or(StompError::ConnectionClosed)?;
        if reply.command != "RECEIPT" {
            // an ERROR frame has already been logged by the reader
            return Err(StompError::Protocol(format!(
                "expected RECEIPT, got {:?}",
                reply.command
            )));
        }
        match reply.header("receipt-id") {
            None => Err(StompError::Protocol("no receipt-id".to_owned())),
            Some(id) if id == receipt.to_string() => Ok(()),
            Some(id) => Err(StompError::Protocol(format!(
                "receipt-id {id:?} does not match receipt {receipt}"
            ))),
        }
    }

    /// The `jms-map-xml` body: a string-to-string map of event attributes.
    fn map_body(&self, event: &LogEvent) -> String {
        format!(
            "<map>\n\
             <entry><string>APPLICATION-ID</string><string>{}</string></entry>\n\
             <entry><string>CREATETIME</string><string>{}</string></entry>\n\
             <entry><string>HOST</string><string>{}</string></entry>\n\
             <entry><string>NAME</string><string>{}</string></entry>\n\
             <entry><string>SEVERITY</string><string>{}</string></entry>\n\
             <entry><string>TEXT</string><string>{}</string></entry>\n\
             <entry><string>TYPE</string><string>log</string></entry>\n\
             <entry><string>USER</string><string>{}</string></entry>\n\
             <entry><string>CLASS</string><string>{}</string></entry>\n\
             </map>\n",
            self.app_name,
            event.time_string,
            self.host_tag,
            xml_escape(&event.function),
            event.level.broker_tag(),
            xml_escape(&event.message),
            self.user_tag,
            xml_escape(&event.subsystem_name),
        )
    }
}

#[async_trait]
impl Sink for StompSink {
    fn name(&self) -> String {
        format!("stomp: {}", self.url.host)
    }

    /// Fast retry while a connection attempt is in flight, slow otherwise.
    fn retry_delay(&self) -> Duration {
        if self.state.connecting.load(Ordering::Acquire) {
            Duration::from_secs(2)
        } else {
            Duration::from_secs(30)
        }
    }

    fn min_level(&self) -> Level {
        self.gate.get()
    }

    fn set_min_level(&self, level: Level) {
        self.gate.set(level);
    }

    async fn send(&self, event: &LogEvent) -> bool {
        if !self.ensure_connected() {
            return false;
        }
        match self.publish(event).await {
            Ok(()) => true,
            Err(error) => {
                tracing::warn!(%error, host = %self.url.host, "publish failed");
                self.disconnect().await;
                false
            }
        }
    }
}

/// Background handshake: TCP (+SOCKS, +TLS), CONNECT, reader spawn, wait
/// for a conforming CONNECTED reply.
async fn connect_task(state: Arc<ConnState>, connector: Connector, url: StompUrl) {
    match establish(&connector, &url, &state).await {
        Ok(connection) => {
            *state.conn.lock().await = Some(connection);
            state.connected.store(true, Ordering::Release);
        }
        Err(error) => {
            tracing::warn!(%error, host = %url.host, "connection failed");
        }
    }
    state.connect_done.store(true, Ordering::Release);
}

async fn establish(
    connector: &Connector,
    url: &StompUrl,
    state: &Arc<ConnState>,
) -> Result<Connection, StompError> {
    let stream = connector.connect().await?;
    let (reader, mut writer) = stream.split();

    let mut connect = format!(
        "CONNECT\naccept-version:1.1\nheart-beat:{HEARTBEAT_OFFER}\nhost:{}\n",
        url.host
    );
    if !url.login.is_empty() {
        connect.push_str(&format!("login:{}\npasscode:{}\n", url.login, url.password));
    }
    connect.push('\n');
    let mut packet = connect.into_bytes();
    packet.push(0);
    writer.write_all(&packet).await?;

    let heartbeat_ms = Arc::new(AtomicU64::new(0));
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
    let reader =
        tokio::spawn(reader_task(reader, reply_tx, heartbeat_ms.clone(), state.clone()));

    let result = async {
        let reply = timeout(CONNECT_TIMEOUT, reply_rx.recv())
            .await
            .map_err(|_| StompError::HandshakeTimeout)?
            .ok_or(StompError::ConnectionClosed)?;
        if reply.command != "CONNECTED" {
            return Err(StompError::Protocol(format!(
                "expected CONNECTED, got {:?}",
                reply.command
            )));
        }
        match reply.header("version") {
            Some("1.1") => {}
            Some(other) => return Err(StompError::UnsupportedVersion(other.to_owned())),
            None => {
                return Err(StompError::Protocol(
                    "no version header in CONNECTED frame".to_owned(),
                ))
            }
        }
        let sx = parse_heartbeat(&reply)?;
        heartbeat_ms.store(sx, Ordering::Relaxed);
        if sx > 0 {
            tracing::debug!(interval_ms = sx, "heartbeat negotiated");
        }
        Ok(())
    }
    .await;

    match result {
        Ok(()) => Ok(Connection { writer, replies: reply_rx, reader }),
        Err(error) => {
            writer.shutdown().await;
            reader.abort();
            Err(error)
        }
    }
}

/// Extract the server-to-client heartbeat interval `sx` in milliseconds.
/// A nonzero `sy` (server asking us to send heartbeats) is unsupported.
fn parse_heartbeat(reply: &Frame) -> Result<u64, StompError> {
    let Some(value) = reply.header("heart-beat") else {
        tracing::debug!("no heart-beat header in CONNECTED frame");
        return Ok(0);
    };
    let (sx, sy) = value
        .split_once(',')
        .ok_or_else(|| StompError::UnsupportedHeartbeat(value.to_owned()))?;
    if sy != "0" {
        return Err(StompError::UnsupportedHeartbeat(value.to_owned()));
    }
    sx.parse::<u64>()
        .map_err(|_| StompError::UnsupportedHeartbeat(value.to_owned()))
}

/// Reads frames off the wire and feeds them to the writer side. A read
/// silence of 1.5 × the negotiated heartbeat interval counts as a lost
/// heartbeat and closes the connection down.
async fn reader_task(
    mut reader: TransportReader,
    replies: mpsc::UnboundedSender<Frame>,
    heartbeat_ms: Arc<AtomicU64>,
    state: Arc<ConnState>,
) {
    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; 1536];
    'read: loop {
        let interval = heartbeat_ms.load(Ordering::Relaxed);
        let limit = (interval > 0).then(|| Duration::from_millis(interval + interval / 2));
        match reader.read_timeout(&mut buf, limit).await {
            Ok(None) => {
                tracing::warn!("heartbeat lost");
                break;
            }
            Ok(Some(0)) => {
                tracing::warn!("server closed the connection");
                break;
            }
            Err(error) => {
                tracing::warn!(%error, "read failed");
                break;
            }
            Ok(Some(n)) => match decoder.feed(&buf[..n]) {
                Err(error) => {
                    tracing::warn!(%error, "dropping the connection");
                    break;
                }
                Ok(frames) => {
                    for frame in frames {
                        if frame.command == "ERROR" {
                            log_broker_error(&frame);
                        }
                        // the writer consumes ERROR frames too, surfacing
                        // them as publish failures
                        if replies.send(frame).is_err() {
                            break 'read;
                        }
                    }
                }
            },
        }
    }
    state.connected.store(false, Ordering::Release);
}

fn log_broker_error(frame: &Frame) {
    match frame.header("message") {
        Some(message) => tracing::warn!(%message, "ERROR from server"),
        None => tracing::warn!("ERROR from server"),
    }
    let body = String::from_utf8_lossy(&frame.body);
    let mut splitter = LineSplitter::new(|line: &str| tracing::debug!(%line, "server error body"));
    splitter.feed(&body);
}

/// Escape text for the XML map body: `&` first, then the quote and angle
/// characters; NUL bytes are spelled `\0`.
fn xml_escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\0' => out.push_str("\\0"),
            other => out.push(other),
        }
    }
    out
}
