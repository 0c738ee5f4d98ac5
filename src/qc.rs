//! Quality control: reconcile a signed batch against what a relay holds.
//!
//! Two passes. The id pass asks for every identifier in chunks; a hit means
//! the relay's current version is exactly ours. Records missed there are
//! looked up by durable key, which tells a stale or superseded copy apart
//! from nothing at all. Only the id pass decides whether a record is missing.

use std::{
    collections::{BTreeMap, HashSet},
    time::Duration,
};

use anyhow::Result;
use serde::Serialize;
use tracing::{info, warn};

use crate::event::{Coordinate, Event};
use crate::relay::{Filter, RelayClient};

#[derive(Debug, Clone)]
pub struct QcOptions {
    /// Identifiers or `d` values per query.
    pub chunk: usize,
    pub query_timeout: Duration,
}

impl Default for QcOptions {
    fn default() -> Self {
        Self {
            chunk: 100,
            query_timeout: Duration::from_secs(20),
        }
    }
}

/// A record whose identifier the relay did not return.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MissingRecord {
    pub kind: u32,
    pub d: Option<String>,
    pub id: String,
    /// Some version with the same durable key exists on the relay.
    pub key_present: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct QcReport {
    pub relay: String,
    pub total: usize,
    pub found_by_id: usize,
    /// Missing by id, but another version under the same key exists.
    pub found_by_key: usize,
    pub missing: usize,
    pub missing_records: Vec<MissingRecord>,
    pub errors: Vec<String>,
}

impl QcReport {
    pub fn is_clean(&self) -> bool {
        self.missing == 0 && self.errors.is_empty()
    }

    /// Exit status for the CLI: `0` clean, `4` missing records, `1` when
    /// queries failed but nothing was reported missing.
    pub fn exit_code(&self) -> u8 {
        if self.missing > 0 {
            4
        } else if !self.errors.is_empty() {
            1
        } else {
            0
        }
    }
}

/// Connect, reconcile `events`, disconnect.
pub async fn run(
    relay_url: &str,
    socks: Option<&str>,
    events: &[Event],
    opts: &QcOptions,
) -> Result<QcReport> {
    let client = RelayClient::connect(relay_url, socks).await?;
    let report = check(&client, events, opts).await;
    client.close().await;
    Ok(report)
}

pub async fn check(client: &RelayClient, events: &[Event], opts: &QcOptions) -> QcReport {
    let chunk = opts.chunk.max(1);
    let mut report = QcReport {
        relay: client.url().to_string(),
        total: events.len(),
        ..QcReport::default()
    };

    let mut found_ids: HashSet<String> = HashSet::new();
    let ids: Vec<&str> = events.iter().map(|e| e.id.as_str()).collect();
    for (n, batch) in ids.chunks(chunk).enumerate() {
        let wanted: HashSet<&str> = batch.iter().copied().collect();
        let filter = Filter::ids(batch.iter().map(|s| s.to_string()));
        match client.query(vec![filter], opts.query_timeout).await {
            Ok(found) => found_ids.extend(
                found
                    .into_iter()
                    .map(|e| e.id)
                    .filter(|id| wanted.contains(id.as_str())),
            ),
            Err(e) => {
                warn!(chunk = n, error = %e, "id query failed");
                report.errors.push(format!("id chunk {n}: {e}"));
            }
        }
    }

    let unmatched: Vec<&Event> = events.iter().filter(|e| !found_ids.contains(&e.id)).collect();

    // Durable-key pass, grouped by (kind, author).
    let mut groups: BTreeMap<(u32, String), Vec<String>> = BTreeMap::new();
    for ev in &unmatched {
        if let Some(key) = ev.durable_key() {
            groups.entry((key.kind, key.pubkey)).or_default().push(key.d);
        }
    }
    let mut present: HashSet<Coordinate> = HashSet::new();
    for ((kind, author), ds) in groups {
        for batch in ds.chunks(chunk) {
            let filter = Filter::durable(kind, &author, batch.to_vec());
            match client.query(vec![filter], opts.query_timeout).await {
                Ok(found) => present.extend(found.iter().filter_map(Event::durable_key)),
                Err(e) => {
                    warn!(kind, error = %e, "durable-key query failed");
                    report.errors.push(format!("key query {kind}:{author}: {e}"));
                }
            }
        }
    }

    report.found_by_id = events.len() - unmatched.len();
    for ev in unmatched {
        let key_present = ev.durable_key().is_some_and(|k| present.contains(&k));
        if key_present {
            report.found_by_key += 1;
        }
        report.missing_records.push(MissingRecord {
            kind: ev.kind,
            d: ev.d_tag().map(str::to_string),
            id: ev.id.clone(),
            key_present,
        });
    }
    report.missing = report.missing_records.len();

    info!(
        relay = %report.relay,
        total = report.total,
        found_by_id = report.found_by_id,
        found_by_key = report.found_by_key,
        missing = report.missing,
        errors = report.errors.len(),
        "quality control finished"
    );
    report
}

/// Records from `events` listed as missing in `report`, in original order.
pub fn missing_events(events: &[Event], report: &QcReport) -> Vec<Event> {
    let ids: HashSet<&str> = report.missing_records.iter().map(|m| m.id.as_str()).collect();
    events
        .iter()
        .filter(|e| ids.contains(e.id.as_str()))
        .cloned()
        .collect()
}
