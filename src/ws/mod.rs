// =============================================================================
// WS Connection Manager (C7)
// =============================================================================
//
// Owns one `SharedConnection` per unique `token_key`. Several broker
// accounts sharing a token share a single socket; listeners (Position,
// Leader, Max-Loss) register on top of it and receive dispatched events.
// Connect/reconnect loop generalized from one-symbol-per-socket to
// one-socket-per-token-key with a listener registry and a concurrent-connect
// semaphore.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Timelike, Utc};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Semaphore};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, instrument, warn};

use crate::ids::{backoff_jitter, jitter, new_id};
use crate::types::{OrderStatus, Side};

const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(2500);
const DEAD_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;
const CONNECTION_LIFETIME: Duration = Duration::from_secs(85 * 60);
const DEAD_SUB_WINDOW: Duration = Duration::from_secs(30);
const DEAD_SUB_CONSECUTIVE_WINDOWS: u32 = 10;
const POST_RELEASE_COOLDOWN: Duration = Duration::from_secs(3);
const INITIAL_STAGGER_MAX: Duration = Duration::from_secs(30);

/// Events dispatched from a shared connection to its registered listeners.
/// `event_id` is the broker-assigned identifier used for idempotency dedup
/// by each listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WsEvent {
    Position {
        event_id: String,
        account_id: i64,
        symbol: String,
        net_qty: Decimal,
        avg_entry: Decimal,
    },
    Fill {
        event_id: String,
        account_id: i64,
        symbol: String,
        side: Side,
        qty: Decimal,
        price: Decimal,
        cl_ord_id: Option<String>,
    },
    Order {
        event_id: String,
        account_id: i64,
        order_id: String,
        symbol: String,
        status: OrderStatus,
    },
    Balance {
        event_id: String,
        account_id: i64,
        cash_balance: Decimal,
    },
}

/// `on_message` MUST be non-blocking: no network I/O, no long computation.
/// Anything requiring I/O should post a task to a worker pool instead of
/// doing it inline.
pub trait WsListener: Send + Sync {
    fn on_message(&self, event: &WsEvent);
}

/// Dispatch one event to every listener, isolating each listener's fault so
/// one panicking listener does not take down the others or the connection.
pub fn dispatch_to_listeners(listeners: &[Arc<dyn WsListener>], event: &WsEvent) {
    for listener in listeners {
        let listener = listener.clone();
        let event = event.clone();
        if let Err(panic) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            listener.on_message(&event);
        })) {
            warn!(?panic, "ws listener panicked while handling event; isolated");
        }
    }
}

/// True during the instrument's expected trading session. A conservative
/// placeholder matching CME's daily ~1h maintenance break (22:00-23:00 UTC);
/// a production deployment would source this per-instrument.
pub fn is_market_hours(now: chrono::DateTime<Utc>) -> bool {
    !(22..23).contains(&now.hour())
}

struct ListenerEntry {
    listener: Arc<dyn WsListener>,
    subaccounts: HashSet<i64>,
}

enum ConnectionCommand {
    Resync,
    Shutdown,
}

/// Tracks dead-subscription state: consecutive 30s windows with zero data
/// messages, only counted during market hours.
pub struct DeadSubTracker {
    consecutive_empty_windows: AtomicU32,
    last_data_at_ms: AtomicU64,
}

impl DeadSubTracker {
    pub fn new(now_ms: i64) -> Self {
        Self {
            consecutive_empty_windows: AtomicU32::new(0),
            last_data_at_ms: AtomicU64::new(now_ms as u64),
        }
    }

    pub fn record_data(&self, now_ms: i64) {
        self.last_data_at_ms.store(now_ms as u64, Ordering::Relaxed);
        self.consecutive_empty_windows.store(0, Ordering::Relaxed);
    }

    /// Called once per 30s tick. Returns `true` once the connection should
    /// be declared dead (10 consecutive empty windows = 300s).
    pub fn tick(&self, market_hours: bool) -> bool {
        if !market_hours {
            return false;
        }
        let n = self.consecutive_empty_windows.fetch_add(1, Ordering::Relaxed) + 1;
        n >= DEAD_SUB_CONSECUTIVE_WINDOWS
    }
}

pub struct SharedConnectionHandle {
    pub token_key: String,
    subaccounts: RwLock<HashSet<i64>>,
    listeners: RwLock<Vec<ListenerEntry>>,
    command_tx: mpsc::UnboundedSender<ConnectionCommand>,
}

impl SharedConnectionHandle {
    fn all_listeners(&self) -> Vec<Arc<dyn WsListener>> {
        self.listeners.read().iter().map(|e| e.listener.clone()).collect()
    }

    fn subaccount_union(&self) -> HashSet<i64> {
        self.subaccounts.read().clone()
    }
}

/// Owns every shared connection, keyed by `token_key`, and the process-wide
/// concurrent-connect semaphore that gates new socket opens (the single
/// most important 429-storm prevention).
pub struct WsManager {
    connections: RwLock<HashMap<String, Arc<SharedConnectionHandle>>>,
    connected_tokens: Arc<RwLock<HashSet<String>>>,
    connect_semaphore: Arc<Semaphore>,
    ws_url_base: String,
}

impl WsManager {
    pub fn new(ws_url_base: impl Into<String>) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            connected_tokens: Arc::new(RwLock::new(HashSet::new())),
            connect_semaphore: Arc::new(Semaphore::new(2)),
            ws_url_base: ws_url_base.into(),
        }
    }

    /// `true` if the shared connection for `token_key` currently holds a
    /// live socket. Used by the reconciliation loop to avoid racing a
    /// Position Listener that's actively subscribed for the same strategy.
    pub fn is_connected(&self, token_key: &str) -> bool {
        self.connected_tokens.read().contains(token_key)
    }

    /// Register a listener on the shared connection for `token_key`,
    /// creating and spawning it if this is the first registration. The
    /// union of subaccounts across all listeners is re-synced if it grew.
    pub fn register_listener(
        &self,
        token_key: &str,
        subaccount_ids: &[i64],
        listener: Arc<dyn WsListener>,
    ) {
        let existing = self.connections.read().get(token_key).cloned();
        let handle = match existing {
            Some(handle) => handle,
            None => self.spawn_connection(token_key),
        };

        let grew = {
            let mut subaccounts = handle.subaccounts.write();
            let before = subaccounts.len();
            subaccounts.extend(subaccount_ids.iter().copied());
            subaccounts.len() != before
        };

        handle.listeners.write().push(ListenerEntry {
            listener,
            subaccounts: subaccount_ids.iter().copied().collect(),
        });

        if grew {
            let _ = handle.command_tx.send(ConnectionCommand::Resync);
        }
    }

    fn spawn_connection(&self, token_key: &str) -> Arc<SharedConnectionHandle> {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let handle = Arc::new(SharedConnectionHandle {
            token_key: token_key.to_string(),
            subaccounts: RwLock::new(HashSet::new()),
            listeners: RwLock::new(Vec::new()),
            command_tx,
        });

        self.connections.write().insert(token_key.to_string(), handle.clone());

        let handle_for_task = handle.clone();
        let semaphore = self.connect_semaphore.clone();
        let url_base = self.ws_url_base.clone();
        let connected_tokens = self.connected_tokens.clone();
        tokio::spawn(async move {
            run_shared_connection(handle_for_task, semaphore, url_base, connected_tokens, command_rx).await;
        });

        handle
    }

    pub fn deregister_token(&self, token_key: &str) {
        if let Some(handle) = self.connections.write().remove(token_key) {
            let _ = handle.command_tx.send(ConnectionCommand::Shutdown);
        }
    }
}

#[instrument(skip(handle, semaphore, command_rx, connected_tokens), fields(token_key = %handle.token_key))]
async fn run_shared_connection(
    handle: Arc<SharedConnectionHandle>,
    semaphore: Arc<Semaphore>,
    url_base: String,
    connected_tokens: Arc<RwLock<HashSet<String>>>,
    mut command_rx: mpsc::UnboundedReceiver<ConnectionCommand>,
) {
    tokio::time::sleep(jitter(INITIAL_STAGGER_MAX)).await;

    let mut attempt: u32 = 0;
    loop {
        let connect_result = {
            let permit = semaphore.acquire().await.expect("semaphore never closed");
            let handshake = connect_and_subscribe(&handle, &url_base, &connected_tokens).await;
            // The cooldown is part of what the permit gates: the next waiter
            // must not be allowed to dial in before this connection has had
            // `POST_RELEASE_COOLDOWN` to settle, so sleep before releasing.
            tokio::time::sleep(POST_RELEASE_COOLDOWN).await;
            drop(permit);
            handshake
        };

        let run_result = match connect_result {
            Ok((write, read)) => run_receive_loop(&handle, write, read).await,
            Err(err) => Err(err),
        };
        connected_tokens.write().remove(&handle.token_key);

        match run_result {
            Ok(dead_sub) => {
                attempt = 0;
                if dead_sub {
                    let sleep_for = Duration::from_secs(30) + jitter(Duration::from_secs(15));
                    info!(sleep_ms = sleep_for.as_millis() as u64, "dead subscription detected, reconnecting");
                    tokio::time::sleep(sleep_for).await;
                }
            }
            Err(err) => {
                attempt += 1;
                let base = Duration::from_secs(1 << attempt.min(6));
                let sleep_for = backoff_jitter(base, 0.1).min(Duration::from_secs(60));
                warn!(error = %err, attempt, sleep_ms = sleep_for.as_millis() as u64, "ws connect failed, backing off");
                tokio::time::sleep(sleep_for).await;
            }
        }

        if let Ok(ConnectionCommand::Shutdown) = command_rx.try_recv() {
            info!("shared connection shutting down");
            return;
        }
    }
}

type WsWrite = futures_util::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;
type WsRead =
    futures_util::stream::SplitStream<tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>>;

/// Connect and send the initial sync/subscribe frame. This is the only part
/// of a connection's life gated by the concurrent-connect semaphore — the
/// permit covers the handshake, not the multi-minute receive loop that
/// follows it.
async fn connect_and_subscribe(
    handle: &Arc<SharedConnectionHandle>,
    url_base: &str,
    connected_tokens: &Arc<RwLock<HashSet<String>>>,
) -> anyhow::Result<(WsWrite, WsRead)> {
    let url = format!("{url_base}/{}", handle.token_key);
    let config = WebSocketConfig {
        max_message_size: Some(MAX_MESSAGE_SIZE),
        max_frame_size: Some(MAX_MESSAGE_SIZE),
        ..Default::default()
    };

    let (ws_stream, _resp) = tokio_tungstenite::connect_async_with_config(&url, Some(config), false)
        .await
        .map_err(|e| anyhow::anyhow!("ws connect failed: {e}"))?;
    info!(url = %url, "ws connected");
    connected_tokens.write().insert(handle.token_key.clone());

    let (mut write, read) = ws_stream.split();

    let subaccounts = handle.subaccount_union();
    let sync_request = serde_json::json!({
        "type": "sync",
        "subaccounts": subaccounts,
        "splitResponses": true,
    });
    write.send(Message::Text(sync_request.to_string())).await?;

    Ok((write, read))
}

/// Runs for the entire connection lifetime — heartbeat, dead-sub detection,
/// receive loop — until it disconnects, rotates (85-minute lifetime), or
/// dead-sub detection fires. Deliberately outside the concurrent-connect
/// semaphore: holding a permit here would let 2 live token_keys starve every
/// other token_key's connect attempts for up to 85 minutes. Returns
/// `Ok(true)` if it exited due to dead-subscription detection.
async fn run_receive_loop(handle: &Arc<SharedConnectionHandle>, mut write: WsWrite, mut read: WsRead) -> anyhow::Result<bool> {
    let tracker = DeadSubTracker::new(crate::ids::now_millis());
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    let mut dead_sub_ticker = tokio::time::interval(DEAD_SUB_WINDOW);
    let lifetime_deadline = tokio::time::sleep(CONNECTION_LIFETIME);
    tokio::pin!(lifetime_deadline);
    let mut last_message_at = tokio::time::Instant::now();

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                if write.send(Message::Ping(Vec::new())).await.is_err() {
                    return Ok(false);
                }
            }
            _ = dead_sub_ticker.tick() => {
                if tracker.tick(is_market_hours(Utc::now())) {
                    return Ok(true);
                }
            }
            _ = &mut lifetime_deadline => {
                info!("rotating connection before auth-token expiry");
                return Ok(false);
            }
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        last_message_at = tokio::time::Instant::now();
                        tracker.record_data(crate::ids::now_millis());
                        if let Some(event) = parse_event(&text) {
                            dispatch_to_listeners(&handle.all_listeners(), &event);
                        }
                    }
                    Some(Ok(_)) => {
                        last_message_at = tokio::time::Instant::now();
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "ws read error");
                        return Err(anyhow::anyhow!("ws read error: {e}"));
                    }
                    None => {
                        warn!("ws stream ended");
                        return Ok(false);
                    }
                }
            }
        }

        if last_message_at.elapsed() >= DEAD_TIMEOUT {
            warn!("no server message for 10s, declaring connection dead");
            return Err(anyhow::anyhow!("liveness timeout"));
        }
    }
}

/// Parse one broker WS frame into a `WsEvent`. Unrecognized shapes are
/// dropped rather than surfaced as an error — a broker adds fields/event
/// types far more often than this pipeline needs to react to.
fn parse_event(text: &str) -> Option<WsEvent> {
    let root: serde_json::Value = serde_json::from_str(text).ok()?;
    let event_id = root["eventId"].as_str().unwrap_or(&new_id()).to_string();
    let account_id = root["accountId"].as_i64()?;

    match root["type"].as_str()? {
        "position" => Some(WsEvent::Position {
            event_id,
            account_id,
            symbol: root["symbol"].as_str()?.to_string(),
            net_qty: root["netPos"].as_str().and_then(|s| s.parse().ok())?,
            avg_entry: root["avgEntry"].as_str().and_then(|s| s.parse().ok())?,
        }),
        "fill" => Some(WsEvent::Fill {
            event_id,
            account_id,
            symbol: root["symbol"].as_str()?.to_string(),
            side: if root["side"].as_str()? == "BUY" { Side::Long } else { Side::Short },
            qty: root["qty"].as_str().and_then(|s| s.parse().ok())?,
            price: root["price"].as_str().and_then(|s| s.parse().ok())?,
            cl_ord_id: root["clOrdId"].as_str().map(|s| s.to_string()),
        }),
        "order" => Some(WsEvent::Order {
            event_id,
            account_id,
            order_id: root["orderId"].to_string(),
            symbol: root["symbol"].as_str()?.to_string(),
            status: match root["status"].as_str()? {
                "NEW" => OrderStatus::Accepted,
                "PARTIALLY_FILLED" => OrderStatus::Working,
                "FILLED" => OrderStatus::Filled,
                "CANCELED" => OrderStatus::Canceled,
                _ => OrderStatus::Rejected,
            },
        }),
        "balance" => Some(WsEvent::Balance {
            event_id,
            account_id,
            cash_balance: root["cashBalance"].as_str().and_then(|s| s.parse().ok())?,
        }),
        _ => None,
    }
}
