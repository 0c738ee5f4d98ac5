//! In-process relay used by the integration tests.
//!
//! Keeps the latest version per durable key for addressable kinds, answers
//! `REQ` filters on `ids`, `authors`, `kinds` and `#d`, and can be told to
//! stay silent or to reject one `d` value.

#![allow(dead_code)]

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use scriptorium::{
    event::{Draft, Event, Tag, KIND_CONTENT},
    keys::SecretKeySigner,
    sign,
};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_tungstenite::{accept_async, tungstenite::Message as TMsg};

#[derive(Debug, Clone)]
pub struct MockOptions {
    /// Answer every `EVENT` with an `OK`.
    pub ack: bool,
    /// Keep accepted records so queries can find them.
    pub store: bool,
    /// Reject records carrying this `d` value.
    pub reject_d: Option<String>,
}

impl Default for MockOptions {
    fn default() -> Self {
        Self {
            ack: true,
            store: true,
            reject_d: None,
        }
    }
}

#[derive(Default)]
struct Store {
    events: Vec<Event>,
    received: usize,
}

impl Store {
    fn insert(&mut self, ev: Event) {
        let addressable = (30000..40000).contains(&ev.kind);
        if let (true, Some(key)) = (addressable, ev.durable_key()) {
            match self
                .events
                .iter_mut()
                .find(|old| old.durable_key().as_ref() == Some(&key))
            {
                Some(old) if old.created_at > ev.created_at => {}
                Some(old) => *old = ev,
                None => self.events.push(ev),
            }
        } else if !self.events.iter().any(|old| old.id == ev.id) {
            self.events.push(ev);
        }
    }

    fn query(&self, filters: &[Value]) -> Vec<Event> {
        self.events
            .iter()
            .filter(|ev| filters.iter().any(|f| matches(f, ev)))
            .cloned()
            .collect()
    }
}

fn allows(filter: &Value, name: &str, value: Value) -> bool {
    match filter.get(name).and_then(Value::as_array) {
        Some(allowed) => allowed.contains(&value),
        None => true,
    }
}

fn matches(filter: &Value, ev: &Event) -> bool {
    allows(filter, "ids", json!(ev.id))
        && allows(filter, "authors", json!(ev.pubkey))
        && allows(filter, "kinds", json!(ev.kind))
        && allows(filter, "#d", json!(ev.d_tag()))
}

pub struct MockRelay {
    pub url: String,
    store: Arc<Mutex<Store>>,
}

impl MockRelay {
    pub async fn start(opts: MockOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let store = Arc::new(Mutex::new(Store::default()));
        let shared = store.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(stream, shared.clone(), opts.clone()));
            }
        });
        Self { url, store }
    }

    /// Seed the relay as if the records had been published earlier.
    pub async fn preload(&self, events: &[Event]) {
        let mut store = self.store.lock().await;
        for ev in events {
            store.insert(ev.clone());
        }
    }

    pub async fn stored(&self) -> Vec<Event> {
        self.store.lock().await.events.clone()
    }

    /// `EVENT` frames received over all connections.
    pub async fn received(&self) -> usize {
        self.store.lock().await.received
    }
}

async fn serve(stream: TcpStream, store: Arc<Mutex<Store>>, opts: MockOptions) {
    let Ok(mut ws) = accept_async(stream).await else {
        return;
    };
    while let Some(Ok(msg)) = ws.next().await {
        let TMsg::Text(txt) = msg else { continue };
        let Ok(v) = serde_json::from_str::<Value>(&txt) else {
            continue;
        };
        let mut replies = Vec::new();
        match v[0].as_str() {
            Some("EVENT") => {
                let Ok(ev) = serde_json::from_value::<Event>(v[1].clone()) else {
                    continue;
                };
                let rejected = opts.reject_d.as_deref().is_some_and(|d| ev.d_tag() == Some(d));
                let mut store = store.lock().await;
                store.received += 1;
                if !rejected && opts.store {
                    store.insert(ev.clone());
                }
                if opts.ack {
                    let message = if rejected { "blocked: not allowed here" } else { "" };
                    replies.push(json!(["OK", ev.id, !rejected, message]));
                }
            }
            Some("REQ") => {
                let sub = v[1].clone();
                let filters = v.as_array().map(|a| a[2..].to_vec()).unwrap_or_default();
                for ev in store.lock().await.query(&filters) {
                    replies.push(json!(["EVENT", sub, ev]));
                }
                replies.push(json!(["EOSE", sub]));
            }
            _ => {}
        }
        for reply in replies {
            if ws.send(TMsg::Text(reply.to_string())).await.is_err() {
                return;
            }
        }
    }
}

pub fn signer() -> SecretKeySigner {
    SecretKeySigner::from_bytes(&[7u8; 32]).unwrap()
}

pub fn content_draft(d: &str, body: &str) -> Draft {
    let mut draft = Draft::new(KIND_CONTENT);
    draft.tags.push(Tag::new(["d", d]));
    draft.tags.push(Tag::new(["title", d]));
    draft.content = body.to_string();
    draft
}

/// `n` signed content records `section-0 .. section-{n-1}`.
pub fn signed_batch(n: usize, created_at: u64) -> Vec<Event> {
    let drafts: Vec<Draft> = (0..n)
        .map(|i| content_draft(&format!("section-{i}"), &format!("body {i}")))
        .collect();
    sign::sign_batch(&drafts, &signer(), created_at).unwrap()
}
