//! Gateway (WebSocket) transport for the Discord API.
//!
//! Owns the connection lifecycle:
//!   - connect → HELLO → IDENTIFY (or RESUME)
//!   - background heartbeat task
//!   - sequence number + session id tracking
//!   - reconnect with exponential back-off
//!   - outbound send budget (120 events / 60s)
//!
//! The bot only ever sees a channel of [`GatewayEvent`]s.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::events::GatewayEvent;
use crate::types::{GatewayPayload, Intents};

const DEFAULT_GATEWAY_URL: &str = "wss://gateway.discord.gg/?v=10&encoding=json";

const SEND_BUDGET_MAX: usize = 120;
const SEND_BUDGET_WINDOW: Duration = Duration::from_secs(60);

const MAX_RECONNECT_ATTEMPTS: u32 = 8;

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<Ws, WsMessage>;
type WsStream = SplitStream<Ws>;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum GatewayError {
    /// WebSocket connect / read / write failure.
    Socket(String),
    /// The gateway sent something other than what the protocol requires.
    Protocol(String),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::Socket(e) => write!(f, "gateway socket error: {}", e),
            GatewayError::Protocol(e) => write!(f, "gateway protocol error: {}", e),
        }
    }
}

impl std::error::Error for GatewayError {}

// ---------------------------------------------------------------------------
// Outbound send budget
// ---------------------------------------------------------------------------

/// Sliding-window limiter over outbound gateway sends.
struct SendBudget {
    sent: VecDeque<Instant>,
    max: usize,
    window: Duration,
}

impl SendBudget {
    fn new(max: usize, window: Duration) -> Self {
        Self {
            sent: VecDeque::with_capacity(max),
            max,
            window,
        }
    }

    /// How long to wait before the next send is allowed, if at all.
    fn delay(&mut self, now: Instant) -> Option<Duration> {
        while let Some(&oldest) = self.sent.front() {
            if now.duration_since(oldest) >= self.window {
                self.sent.pop_front();
            } else {
                break;
            }
        }
        if self.sent.len() < self.max {
            return None;
        }
        self.sent
            .front()
            .map(|&oldest| (oldest + self.window).saturating_duration_since(now))
    }

    fn record(&mut self, now: Instant) {
        self.sent.push_back(now);
    }
}

// ---------------------------------------------------------------------------
// Configuration / handle
// ---------------------------------------------------------------------------

/// Options for connecting to the Discord gateway.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub token: String,
    pub intents: Intents,
}

/// Receiving end of a running gateway connection.
pub struct GatewayHandle {
    /// Typed events, in arrival order.
    pub events: mpsc::Receiver<GatewayEvent>,
    /// The background driver; finishes when the gateway gives up.
    pub driver: tokio::task::JoinHandle<()>,
}

#[derive(Debug, Clone, Default)]
struct SessionState {
    session_id: Option<String>,
    resume_gateway_url: Option<String>,
    sequence: Option<u64>,
}

/// Shared write half plus its send budget.
#[derive(Clone)]
struct Outbound {
    sink: Arc<Mutex<WsSink>>,
    budget: Arc<Mutex<SendBudget>>,
}

impl Outbound {
    fn new(sink: WsSink) -> Self {
        Self {
            sink: Arc::new(Mutex::new(sink)),
            budget: Arc::new(Mutex::new(SendBudget::new(
                SEND_BUDGET_MAX,
                SEND_BUDGET_WINDOW,
            ))),
        }
    }

    /// Send a JSON payload, waiting for send budget first.
    async fn send(&self, payload: &serde_json::Value) -> Result<(), GatewayError> {
        loop {
            let delay = self.budget.lock().await.delay(Instant::now());
            match delay {
                Some(d) => {
                    debug!(delay_ms = d.as_millis() as u64, "gateway send budget exhausted, waiting");
                    tokio::time::sleep(d).await;
                }
                None => break,
            }
        }
        self.budget.lock().await.record(Instant::now());

        let text = serde_json::to_string(payload)
            .map_err(|e| GatewayError::Protocol(e.to_string()))?;
        self.sink
            .lock()
            .await
            .send(WsMessage::Text(text))
            .await
            .map_err(|e| GatewayError::Socket(e.to_string()))
    }

    async fn close(&self) {
        let _ = self.sink.lock().await.send(WsMessage::Close(None)).await;
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Spawn the gateway driver and return the event receiver.
pub fn connect(config: GatewayConfig) -> GatewayHandle {
    let (event_tx, event_rx) = mpsc::channel::<GatewayEvent>(256);
    let driver = tokio::spawn(gateway_driver(config, event_tx));
    GatewayHandle {
        events: event_rx,
        driver,
    }
}

// ---------------------------------------------------------------------------
// Driver loop
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq, Eq)]
enum DisconnectReason {
    ShouldResume,
    ShouldReidentify,
    Fatal,
    EventChannelClosed,
}

async fn gateway_driver(config: GatewayConfig, event_tx: mpsc::Sender<GatewayEvent>) {
    let session = Arc::new(Mutex::new(SessionState::default()));
    let mut attempts: u32 = 0;

    loop {
        let url = {
            let s = session.lock().await;
            gateway_url(s.resume_gateway_url.as_deref())
        };

        let reason = match run_connection(&config, &url, &session, &event_tx).await {
            Ok(reason) => {
                attempts = 0;
                reason
            }
            Err(e) => {
                error!(error = %e, "gateway connection failed");
                DisconnectReason::ShouldResume
            }
        };

        match reason {
            DisconnectReason::ShouldResume => info!("will attempt RESUME"),
            DisconnectReason::ShouldReidentify => {
                info!("session invalidated, will re-IDENTIFY");
                let mut s = session.lock().await;
                s.session_id = None;
                s.sequence = None;
            }
            DisconnectReason::Fatal => {
                error!("fatal gateway error, shutting down");
                return;
            }
            DisconnectReason::EventChannelClosed => {
                info!("event channel closed, shutting down gateway driver");
                return;
            }
        }

        attempts += 1;
        if attempts > MAX_RECONNECT_ATTEMPTS {
            error!("exceeded max reconnect attempts, giving up");
            return;
        }
        let backoff = backoff_delay(attempts);
        warn!(
            delay_ms = backoff.as_millis() as u64,
            attempt = attempts,
            "reconnecting after backoff"
        );
        tokio::time::sleep(backoff).await;
    }
}

/// One connection from handshake to disconnect.
async fn run_connection(
    config: &GatewayConfig,
    url: &str,
    session: &Arc<Mutex<SessionState>>,
    event_tx: &mpsc::Sender<GatewayEvent>,
) -> Result<DisconnectReason, GatewayError> {
    info!(url = %url, "connecting to Discord gateway");
    let (ws, _) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|e| GatewayError::Socket(e.to_string()))?;

    let (sink, mut stream) = ws.split();
    let outbound = Outbound::new(sink);

    let heartbeat_interval = read_hello(&mut stream).await?;
    info!(interval_ms = heartbeat_interval, "received HELLO");

    let handshake = {
        let s = session.lock().await;
        match (&s.session_id, s.sequence) {
            (Some(session_id), Some(seq)) => json!({
                "op": 6,
                "d": { "token": config.token, "session_id": session_id, "seq": seq }
            }),
            _ => json!({
                "op": 2,
                "d": {
                    "token": config.token,
                    "intents": config.intents.bits(),
                    "properties": { "os": "linux", "browser": "gpu-usage-bot", "device": "gpu-usage-bot" }
                }
            }),
        }
    };
    outbound.send(&handshake).await?;
    info!(op = handshake["op"].as_u64(), "sent handshake");

    let heartbeat = tokio::spawn(heartbeat_task(
        outbound.clone(),
        Arc::clone(session),
        heartbeat_interval,
    ));

    let reason = read_loop(&mut stream, &outbound, session, event_tx).await;

    heartbeat.abort();
    outbound.close().await;
    Ok(reason)
}

async fn heartbeat_task(outbound: Outbound, session: Arc<Mutex<SessionState>>, interval_ms: u64) {
    // First beat after `interval * jitter`, per the gateway docs.
    let jitter = rand::random::<f64>();
    tokio::time::sleep(Duration::from_millis((interval_ms as f64 * jitter) as u64)).await;

    let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
    loop {
        interval.tick().await;
        let seq = session.lock().await.sequence;
        if let Err(e) = outbound.send(&json!({ "op": 1, "d": seq })).await {
            warn!(error = %e, "heartbeat send failed, stopping heartbeat task");
            return;
        }
        debug!(seq = ?seq, "sent heartbeat");
    }
}

async fn read_loop(
    stream: &mut WsStream,
    outbound: &Outbound,
    session: &Arc<Mutex<SessionState>>,
    event_tx: &mpsc::Sender<GatewayEvent>,
) -> DisconnectReason {
    while let Some(msg) = stream.next().await {
        let text = match msg {
            Ok(WsMessage::Text(text)) => text,
            Ok(WsMessage::Close(frame)) => {
                let code = frame.as_ref().map(|f| u16::from(f.code));
                warn!(close_code = ?code, "WebSocket closed by server");
                return code.map_or(DisconnectReason::ShouldResume, classify_close_code);
            }
            Ok(_) => continue,
            Err(e) => {
                warn!(error = %e, "WebSocket read error");
                return DisconnectReason::ShouldResume;
            }
        };

        let payload: GatewayPayload = match serde_json::from_str(&text) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "failed to parse gateway payload");
                continue;
            }
        };

        if let Some(s) = payload.s {
            session.lock().await.sequence = Some(s);
        }

        let event = GatewayEvent::from_payload(payload);
        match &event {
            GatewayEvent::Ready(ready) => {
                let mut s = session.lock().await;
                s.session_id = Some(ready.session_id.clone());
                s.resume_gateway_url = Some(ready.resume_gateway_url.clone());
            }
            GatewayEvent::HeartbeatRequest => {
                let seq = session.lock().await.sequence;
                if let Err(e) = outbound.send(&json!({ "op": 1, "d": seq })).await {
                    warn!(error = %e, "failed to send requested heartbeat");
                }
                continue;
            }
            GatewayEvent::HeartbeatAck => debug!("heartbeat acknowledged"),
            GatewayEvent::Reconnect => {
                info!("gateway requested reconnect (op 7)");
                return DisconnectReason::ShouldResume;
            }
            GatewayEvent::InvalidSession(resumable) => {
                warn!(resumable, "session invalidated (op 9)");
                tokio::time::sleep(Duration::from_secs(2)).await;
                return if *resumable {
                    DisconnectReason::ShouldResume
                } else {
                    DisconnectReason::ShouldReidentify
                };
            }
            _ => {}
        }

        if event_tx.send(event).await.is_err() {
            return DisconnectReason::EventChannelClosed;
        }
    }

    info!("WebSocket stream ended");
    DisconnectReason::ShouldResume
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Wait for op 10 HELLO and return its heartbeat interval in milliseconds.
async fn read_hello(stream: &mut WsStream) -> Result<u64, GatewayError> {
    let msg = tokio::time::timeout(Duration::from_secs(30), stream.next())
        .await
        .map_err(|_| GatewayError::Protocol("timed out waiting for HELLO".to_string()))?
        .ok_or_else(|| GatewayError::Protocol("stream ended before HELLO".to_string()))?
        .map_err(|e| GatewayError::Socket(e.to_string()))?;

    let text = match msg {
        WsMessage::Text(text) => text,
        other => {
            return Err(GatewayError::Protocol(format!(
                "expected text frame for HELLO, got {:?}",
                other
            )))
        }
    };

    let payload: GatewayPayload =
        serde_json::from_str(&text).map_err(|e| GatewayError::Protocol(e.to_string()))?;
    parse_hello(&payload)
}

fn parse_hello(payload: &GatewayPayload) -> Result<u64, GatewayError> {
    if payload.op != 10 {
        return Err(GatewayError::Protocol(format!(
            "expected op 10 (HELLO), got op {}",
            payload.op
        )));
    }
    payload
        .d
        .as_ref()
        .and_then(|d| d.get("heartbeat_interval"))
        .and_then(|v| v.as_u64())
        .ok_or_else(|| GatewayError::Protocol("HELLO missing heartbeat_interval".to_string()))
}

/// Resume URLs from READY come without query parameters.
fn gateway_url(resume_url: Option<&str>) -> String {
    match resume_url {
        None => DEFAULT_GATEWAY_URL.to_string(),
        Some(url) if url.contains("v=10") => url.to_string(),
        Some(url) if url.contains('?') => format!("{}&v=10&encoding=json", url),
        Some(url) => format!("{}/?v=10&encoding=json", url.trim_end_matches('/')),
    }
}

/// Map a gateway close code to what the driver should do next.
fn classify_close_code(code: u16) -> DisconnectReason {
    match code {
        // Authentication failed, invalid shard, sharding required,
        // invalid API version, invalid or disallowed intents.
        4004 | 4010 | 4011 | 4012 | 4013 | 4014 => DisconnectReason::Fatal,
        // Invalid seq or session timed out.
        4007 | 4009 => DisconnectReason::ShouldReidentify,
        _ => DisconnectReason::ShouldResume,
    }
}

/// Exponential backoff with jitter, capped at 60 s.
fn backoff_delay(attempt: u32) -> Duration {
    let base_ms = 1000u64 * 2u64.saturating_pow(attempt.min(6));
    let jittered = (rand::random::<f64>() * 0.5 + 0.75) * base_ms as f64;
    Duration::from_millis(jittered.min(60_000.0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_codes_are_classified() {
        assert_eq!(classify_close_code(4004), DisconnectReason::Fatal);
        assert_eq!(classify_close_code(4014), DisconnectReason::Fatal);
        assert_eq!(classify_close_code(4009), DisconnectReason::ShouldReidentify);
        assert_eq!(classify_close_code(1001), DisconnectReason::ShouldResume);
    }

    #[test]
    fn resume_url_gets_query_params() {
        assert_eq!(gateway_url(None), DEFAULT_GATEWAY_URL);
        assert_eq!(
            gateway_url(Some("wss://resume.discord.gg")),
            "wss://resume.discord.gg/?v=10&encoding=json"
        );
        assert_eq!(
            gateway_url(Some("wss://x.gg/?v=10&encoding=json")),
            "wss://x.gg/?v=10&encoding=json"
        );
    }

    #[test]
    fn hello_interval_is_extracted() {
        let payload = GatewayPayload {
            op: 10,
            d: Some(json!({ "heartbeat_interval": 41250 })),
            s: None,
            t: None,
        };
        assert_eq!(parse_hello(&payload).unwrap(), 41250);

        let wrong_op = GatewayPayload { op: 0, ..payload };
        assert!(parse_hello(&wrong_op).is_err());
    }

    #[test]
    fn send_budget_blocks_when_full() {
        let mut budget = SendBudget::new(2, Duration::from_secs(60));
        let now = Instant::now();
        assert!(budget.delay(now).is_none());
        budget.record(now);
        budget.record(now);
        let wait = budget.delay(now).expect("budget should be exhausted");
        assert!(wait <= Duration::from_secs(60));
        assert!(budget.delay(now + Duration::from_secs(61)).is_none());
    }

    #[test]
    fn backoff_is_capped() {
        for attempt in 0..20 {
            assert!(backoff_delay(attempt) <= Duration::from_secs(60));
        }
    }
}
