//! WebSocket client for a single Nostr relay.
//!
//! One background task owns the read half of the socket. It records `OK`
//! acknowledgements, counts `NOTICE`s and routes subscription traffic to the
//! query that opened it; callers only ever write through [`RelayClient`].

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tokio_socks::tcp::Socks5Stream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{client_async_tls, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::event::Event;

/// Blanket trait for boxed async read/write streams.
pub trait AsyncReadWrite: AsyncRead + AsyncWrite {}
impl<T: AsyncRead + AsyncWrite> AsyncReadWrite for T {}

pub type WsStream = WebSocketStream<MaybeTlsStream<Box<dyn AsyncReadWrite + Unpin + Send>>>;

/// Establish a WebSocket connection, optionally via a SOCKS5 proxy. `wss://`
/// URLs are wrapped in TLS.
pub async fn connect_ws(relay: &str, socks: Option<&str>) -> Result<WsStream> {
    let url = Url::parse(relay)?;
    let host = url.host_str().ok_or_else(|| anyhow!("missing host"))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| anyhow!("missing port"))?;
    let req = relay.into_client_request()?;
    let stream: Box<dyn AsyncReadWrite + Unpin + Send> = if let Some(proxy) = socks {
        Box::new(Socks5Stream::connect(proxy, (host, port)).await?)
    } else {
        Box::new(TcpStream::connect((host, port)).await?)
    };
    let (ws, _) = client_async_tls(req, stream).await?;
    Ok(ws)
}

/// Subscription filter (NIP-01). Empty fields are omitted.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct Filter {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ids: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub authors: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub kinds: Vec<u32>,
    #[serde(rename = "#d", skip_serializing_if = "Vec::is_empty")]
    pub d: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl Filter {
    pub fn ids<I: IntoIterator<Item = String>>(ids: I) -> Self {
        let ids: Vec<String> = ids.into_iter().collect();
        Self {
            limit: Some(ids.len()),
            ids,
            ..Self::default()
        }
    }

    /// Latest version of each `(kind, author, d)` in `d`.
    pub fn durable(kind: u32, author: &str, d: Vec<String>) -> Self {
        Self {
            kinds: vec![kind],
            authors: vec![author.to_string()],
            d,
            ..Self::default()
        }
    }
}

/// Relay → client message.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    Event { sub: String, event: Box<Event> },
    Ok { id: String, accepted: bool, message: String },
    Eose { sub: String },
    Closed { sub: String, message: String },
    Notice(String),
}

impl RelayMessage {
    /// Parse a text frame; unknown or malformed frames yield `None`.
    pub fn parse(text: &str) -> Option<Self> {
        let val: Value = serde_json::from_str(text).ok()?;
        let arr = val.as_array()?;
        let str_at = |i: usize| arr.get(i).and_then(Value::as_str).map(str::to_string);
        match arr.first()?.as_str()? {
            "EVENT" => {
                let event = serde_json::from_value(arr.get(2)?.clone()).ok()?;
                Some(RelayMessage::Event {
                    sub: str_at(1)?,
                    event: Box::new(event),
                })
            }
            "OK" => Some(RelayMessage::Ok {
                id: str_at(1)?,
                accepted: arr.get(2)?.as_bool()?,
                message: str_at(3).unwrap_or_default(),
            }),
            "EOSE" => Some(RelayMessage::Eose { sub: str_at(1)? }),
            "CLOSED" => Some(RelayMessage::Closed {
                sub: str_at(1)?,
                message: str_at(2).unwrap_or_default(),
            }),
            "NOTICE" => Some(RelayMessage::Notice(str_at(1).unwrap_or_default())),
            _ => None,
        }
    }
}

/// Relay verdict for one submitted record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub accepted: bool,
    pub message: String,
}

enum SubItem {
    Event(Box<Event>),
    End,
}

#[derive(Default)]
struct Shared {
    acks: RwLock<HashMap<String, Ack>>,
    ack_count: AtomicUsize,
    notices: AtomicUsize,
    subs: Mutex<HashMap<String, mpsc::UnboundedSender<SubItem>>>,
    closed: AtomicBool,
}

/// Connected relay session.
pub struct RelayClient {
    url: String,
    sink: Mutex<SplitSink<WsStream, Message>>,
    shared: Arc<Shared>,
    next_sub: AtomicU64,
    reader: JoinHandle<()>,
}

impl RelayClient {
    pub async fn connect(url: &str, socks: Option<&str>) -> Result<Self> {
        let ws = connect_ws(url, socks)
            .await
            .map_err(|e| anyhow!("connecting to {url}: {e}"))?;
        debug!(relay = %url, "connected");
        let (sink, stream) = ws.split();
        let shared = Arc::new(Shared::default());
        let reader = tokio::spawn(read_loop(stream, shared.clone(), url.to_string()));
        Ok(Self {
            url: url.to_string(),
            sink: Mutex::new(sink),
            shared,
            next_sub: AtomicU64::new(0),
            reader,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn send_json(&self, value: Value) -> Result<()> {
        if self.is_closed() {
            return Err(anyhow!("connection to {} is closed", self.url));
        }
        self.sink
            .lock()
            .await
            .send(Message::Text(value.to_string()))
            .await?;
        Ok(())
    }

    /// Submit one record. Does not wait for the acknowledgement.
    pub async fn send_event(&self, ev: &Event) -> Result<()> {
        self.send_json(json!(["EVENT", ev])).await
    }

    pub async fn ack(&self, id: &str) -> Option<Ack> {
        self.shared.acks.read().await.get(id).cloned()
    }

    pub async fn acks(&self) -> HashMap<String, Ack> {
        self.shared.acks.read().await.clone()
    }

    /// Number of `OK` frames received so far.
    pub fn acks_received(&self) -> usize {
        self.shared.ack_count.load(Ordering::SeqCst)
    }

    pub fn notices(&self) -> usize {
        self.shared.notices.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Run a one-shot subscription and collect events until `EOSE`.
    ///
    /// Hitting `wait` returns what arrived so far. A connection that drops
    /// before `EOSE` is an error.
    pub async fn query(&self, filters: Vec<Filter>, wait: Duration) -> Result<Vec<Event>> {
        let sub = format!("scriptorium-{}", self.next_sub.fetch_add(1, Ordering::SeqCst));
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.shared.subs.lock().await.insert(sub.clone(), tx);

        let mut req = vec![json!("REQ"), json!(sub)];
        req.extend(filters.iter().map(|f| json!(f)));
        if let Err(e) = self.send_json(Value::Array(req)).await {
            self.shared.subs.lock().await.remove(&sub);
            return Err(e);
        }

        let deadline = Instant::now() + wait;
        let mut events = Vec::new();
        let outcome = loop {
            match timeout_at(deadline, rx.recv()).await {
                Ok(Some(SubItem::Event(ev))) => events.push(*ev),
                Ok(Some(SubItem::End)) => break Ok(()),
                Ok(None) => break Err(anyhow!("connection to {} closed during query", self.url)),
                Err(_) => {
                    warn!(relay = %self.url, sub = %sub, received = events.len(), "query timed out before EOSE");
                    break Ok(());
                }
            }
        };

        self.shared.subs.lock().await.remove(&sub);
        if !self.is_closed() {
            if let Err(e) = self.send_json(json!(["CLOSE", sub])).await {
                debug!(error = %e, "failed to close subscription");
            }
        }
        outcome.map(|_| events)
    }

    /// Close the socket and stop the reader.
    pub async fn close(self) {
        if let Err(e) = self.sink.lock().await.close().await {
            debug!(relay = %self.url, error = %e, "close failed");
        }
        self.reader.abort();
    }
}

async fn read_loop(mut stream: SplitStream<WsStream>, shared: Arc<Shared>, url: String) {
    while let Some(msg) = stream.next().await {
        let txt = match msg {
            Ok(Message::Text(txt)) => txt,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                warn!(relay = %url, error = %e, "relay read failed");
                break;
            }
        };
        match RelayMessage::parse(&txt) {
            Some(RelayMessage::Ok { id, accepted, message }) => {
                if !accepted {
                    warn!(relay = %url, id = %id, reason = %message, "record rejected");
                }
                shared.acks.write().await.insert(id, Ack { accepted, message });
                shared.ack_count.fetch_add(1, Ordering::SeqCst);
            }
            Some(RelayMessage::Notice(notice)) => {
                info!(relay = %url, notice = %notice, "relay notice");
                shared.notices.fetch_add(1, Ordering::SeqCst);
            }
            Some(RelayMessage::Event { sub, event }) => {
                if let Some(tx) = shared.subs.lock().await.get(&sub) {
                    let _ = tx.send(SubItem::Event(event));
                }
            }
            Some(RelayMessage::Eose { sub }) => {
                if let Some(tx) = shared.subs.lock().await.get(&sub) {
                    let _ = tx.send(SubItem::End);
                }
            }
            Some(RelayMessage::Closed { sub, message }) => {
                warn!(relay = %url, sub = %sub, reason = %message, "subscription closed by relay");
                if let Some(tx) = shared.subs.lock().await.get(&sub) {
                    let _ = tx.send(SubItem::End);
                }
            }
            None => debug!(relay = %url, frame = %txt, "ignoring frame"),
        }
    }
    shared.closed.store(true, Ordering::SeqCst);
    shared.subs.lock().await.clear();
}
