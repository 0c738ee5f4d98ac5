//! Relay publish client: submit a signed batch over one connection, settle,
//! then spot-check the first record.

use std::{collections::HashSet, future::Future, time::Duration};

use anyhow::{bail, Result};
use serde::Serialize;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::event::Event;
use crate::relay::{Filter, RelayClient};

#[derive(Debug, Clone)]
pub struct PublishOptions {
    /// Short pause after every `pause_every` submissions.
    pub pause_every: usize,
    pub pause: Duration,
    /// Long pause after every `long_pause_every` submissions.
    pub long_pause_every: usize,
    pub long_pause: Duration,
    /// Hard ceiling for the post-submission settling wait.
    pub settle: Duration,
    /// Interval between acknowledgement-count polls while settling.
    pub poll: Duration,
    /// Unchanged polls in a row that end settling early.
    pub plateau_polls: usize,
    pub query_timeout: Duration,
    /// Run the first-record spot-check after settling.
    pub verify: bool,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            pause_every: 50,
            pause: Duration::from_millis(250),
            long_pause_every: 500,
            long_pause: Duration::from_millis(2000),
            settle: Duration::from_secs(30),
            poll: Duration::from_millis(500),
            plateau_polls: 4,
            query_timeout: Duration::from_secs(20),
            verify: true,
        }
    }
}

impl PublishOptions {
    /// Backpressure pause owed after the `sent`-th submission, if any.
    pub fn pause_after(&self, sent: usize) -> Option<Duration> {
        if self.long_pause_every > 0 && sent % self.long_pause_every == 0 {
            Some(self.long_pause)
        } else if self.pause_every > 0 && sent % self.pause_every == 0 {
            Some(self.pause)
        } else {
            None
        }
    }
}

/// Overall outcome of one publish run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishStatus {
    /// Every record went out and the spot-check found the first one.
    Verified,
    /// Every record went out; verification was not requested.
    Published,
    /// Every record went out but the spot-check came back empty.
    PublishedUnverified,
    /// Some records failed to send or were rejected.
    Partial,
    /// Nothing reached the relay.
    Failed,
    /// Stopped by the user; what was already sent stays sent.
    Interrupted,
}

impl PublishStatus {
    pub fn exit_code(self) -> u8 {
        match self {
            PublishStatus::Verified | PublishStatus::Published => 0,
            PublishStatus::Failed => 1,
            PublishStatus::Partial => 2,
            PublishStatus::PublishedUnverified => 3,
            PublishStatus::Interrupted => 130,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Rejection {
    pub id: String,
    pub d: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PublishReport {
    pub relay: String,
    pub total: usize,
    /// Records handed to the socket without error.
    pub submitted: usize,
    pub send_failures: usize,
    pub accepted: usize,
    pub rejected: usize,
    /// Submitted records that never got an `OK`; counted as published.
    pub unacknowledged: usize,
    pub notices: usize,
    pub verified: bool,
    pub rejections: Vec<Rejection>,
    pub status: PublishStatus,
}

#[derive(Default)]
struct Progress {
    attempted: usize,
    failed: HashSet<usize>,
    verified: bool,
}

/// Publish `events` to `relay_url` in order.
///
/// `shutdown` resolving stops the run at the next suspension point and
/// yields [`PublishStatus::Interrupted`]. Only a failed connect is an `Err`;
/// everything after that is reported in the returned [`PublishReport`].
pub async fn publish<F>(
    relay_url: &str,
    socks: Option<&str>,
    events: &[Event],
    opts: &PublishOptions,
    shutdown: F,
) -> Result<PublishReport>
where
    F: Future<Output = ()>,
{
    if events.is_empty() {
        bail!("nothing to publish");
    }
    let client = RelayClient::connect(relay_url, socks).await?;
    info!(relay = %relay_url, records = events.len(), "publishing");

    let mut progress = Progress::default();
    tokio::pin!(shutdown);
    let interrupted = tokio::select! {
        _ = &mut shutdown => true,
        _ = drive(&client, events, opts, &mut progress) => false,
    };
    if interrupted {
        warn!(relay = %relay_url, sent = progress.attempted, "publish interrupted");
    }

    let report = tally(&client, events, &progress, interrupted, opts.verify).await;
    client.close().await;

    info!(
        relay = %report.relay,
        submitted = report.submitted,
        accepted = report.accepted,
        rejected = report.rejected,
        unacknowledged = report.unacknowledged,
        send_failures = report.send_failures,
        verified = report.verified,
        status = ?report.status,
        "publish finished"
    );
    Ok(report)
}

async fn drive(client: &RelayClient, events: &[Event], opts: &PublishOptions, progress: &mut Progress) {
    for (idx, ev) in events.iter().enumerate() {
        progress.attempted = idx + 1;
        if let Err(e) = client.send_event(ev).await {
            warn!(id = %ev.id, d = ?ev.d_tag(), error = %e, "send failed");
            progress.failed.insert(idx);
        }
        if idx + 1 < events.len() {
            if let Some(pause) = opts.pause_after(idx + 1) {
                debug!(sent = idx + 1, pause_ms = pause.as_millis() as u64, "backpressure pause");
                sleep(pause).await;
            }
        }
    }

    let sent = events.len() - progress.failed.len();
    settle(client, sent, opts).await;

    if opts.verify && !client.is_closed() {
        progress.verified = spot_check(client, &events[0], opts.query_timeout).await;
    }
}

/// Wait for acknowledgements until all arrived, the count stops moving for
/// `plateau_polls` polls, or the hard ceiling passes.
async fn settle(client: &RelayClient, expected: usize, opts: &PublishOptions) {
    let deadline = Instant::now() + opts.settle;
    let mut last = client.acks_received();
    let mut flat = 0;
    while last < expected && Instant::now() < deadline && !client.is_closed() {
        sleep(opts.poll).await;
        let now = client.acks_received();
        if now == last {
            flat += 1;
            if flat >= opts.plateau_polls {
                debug!(acks = now, expected, "acknowledgements plateaued");
                break;
            }
        } else {
            flat = 0;
            last = now;
        }
    }
}

/// Query the first record by durable key (by id when it has none). Any
/// non-empty result verifies the batch.
pub async fn spot_check(client: &RelayClient, first: &Event, wait: Duration) -> bool {
    let filter = match first.durable_key() {
        Some(key) => Filter::durable(key.kind, &key.pubkey, vec![key.d]),
        None => Filter::ids([first.id.clone()]),
    };
    match client.query(vec![filter], wait).await {
        Ok(found) => {
            if !found.is_empty() && !found.iter().any(|e| e.id == first.id) {
                warn!(id = %first.id, "relay holds a different version of the first record");
            }
            !found.is_empty()
        }
        Err(e) => {
            warn!(error = %e, "spot-check query failed");
            false
        }
    }
}

async fn tally(
    client: &RelayClient,
    events: &[Event],
    progress: &Progress,
    interrupted: bool,
    verify: bool,
) -> PublishReport {
    let acks = client.acks().await;
    let mut report = PublishReport {
        relay: client.url().to_string(),
        total: events.len(),
        submitted: 0,
        send_failures: progress.failed.len(),
        accepted: 0,
        rejected: 0,
        unacknowledged: 0,
        notices: client.notices(),
        verified: progress.verified,
        rejections: Vec::new(),
        status: PublishStatus::Failed,
    };

    for (idx, ev) in events.iter().enumerate().take(progress.attempted) {
        if progress.failed.contains(&idx) {
            continue;
        }
        report.submitted += 1;
        match acks.get(&ev.id) {
            Some(ack) if ack.accepted || ack.message.starts_with("duplicate") => report.accepted += 1,
            Some(ack) => {
                report.rejected += 1;
                report.rejections.push(Rejection {
                    id: ev.id.clone(),
                    d: ev.d_tag().map(str::to_string),
                    message: ack.message.clone(),
                });
            }
            None => report.unacknowledged += 1,
        }
    }

    report.status = classify(&report, interrupted, verify);
    report
}

fn classify(report: &PublishReport, interrupted: bool, verify: bool) -> PublishStatus {
    if interrupted {
        PublishStatus::Interrupted
    } else if report.accepted + report.unacknowledged == 0 {
        PublishStatus::Failed
    } else if report.rejected + report.send_failures > 0 {
        PublishStatus::Partial
    } else if !verify {
        PublishStatus::Published
    } else if report.verified {
        PublishStatus::Verified
    } else {
        PublishStatus::PublishedUnverified
    }
}
