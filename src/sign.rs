//! Canonical serialization, identifiers and Schnorr signatures.
//!
//! The identifier of a record is the SHA-256 of
//! `[0, pubkey, created_at, kind, tags, content]` serialized as compact JSON;
//! the signature is a BIP-340 Schnorr signature over those 32 bytes.

use std::{
    collections::HashMap,
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::{anyhow, Result};
use rand::{seq::SliceRandom, thread_rng};
use secp256k1::{schnorr::Signature, Message, Secp256k1, XOnlyPublicKey};
use sha2::{Digest, Sha256};

use crate::event::{Coordinate, Draft, Event, Tag, PUBKEY_PLACEHOLDER};
use crate::keys::Signer;

/// Current Unix time in seconds.
pub fn unix_now() -> Result<u64> {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| anyhow!("system clock is before the Unix epoch: {e}"))?;
    Ok(elapsed.as_secs())
}

/// Exact byte string that is hashed into the record identifier.
pub fn canonical_bytes(
    pubkey: &str,
    created_at: u64,
    kind: u32,
    tags: &[Tag],
    content: &str,
) -> Result<Vec<u8>> {
    let arr = serde_json::json!([0, pubkey, created_at, kind, tags, content]);
    Ok(serde_json::to_vec(&arr)?)
}

/// Recompute the Nostr event hash from its fields.
pub fn event_hash(ev: &Event) -> Result<[u8; 32]> {
    let data = canonical_bytes(&ev.pubkey, ev.created_at, ev.kind, &ev.tags, &ev.content)?;
    Ok(Sha256::digest(&data).into())
}

/// Turn a draft into a signed event. Address tags still carrying the
/// placeholder author get the signer's key.
pub fn finalize(draft: &Draft, signer: &dyn Signer, created_at: u64) -> Result<Event> {
    let pubkey = signer.public_key_hex();
    let mut tags = draft.tags.clone();
    for tag in tags.iter_mut().filter(|t| t.is("a")) {
        substitute_author(tag, &pubkey);
    }
    let mut ev = Event {
        id: String::new(),
        pubkey,
        kind: draft.kind,
        created_at,
        tags,
        content: draft.content.clone(),
        sig: String::new(),
    };
    let hash = event_hash(&ev)?;
    ev.id = hex::encode(hash);
    ev.sig = hex::encode(signer.sign(&hash));
    Ok(ev)
}

/// Sign a whole compiled batch with one shared `created_at`.
///
/// Drafts are signed in reverse order so every child (always emitted after
/// its parent) already has an identifier when the parent's address tags are
/// resolved; the fourth `a`-tag element is filled with it. Output order
/// matches input order.
pub fn sign_batch(drafts: &[Draft], signer: &dyn Signer, created_at: u64) -> Result<Vec<Event>> {
    let pubkey = signer.public_key_hex();
    let mut ids: HashMap<(u32, String), String> = HashMap::new();
    let mut signed: Vec<Option<Event>> = vec![None; drafts.len()];

    for (idx, draft) in drafts.iter().enumerate().rev() {
        let mut draft = draft.clone();
        for tag in draft.tags.iter_mut().filter(|t| t.is("a")) {
            substitute_author(tag, &pubkey);
            let Some(coord) = tag.value().and_then(Coordinate::parse) else {
                continue;
            };
            if coord.pubkey != pubkey {
                continue;
            }
            if let Some(id) = ids.get(&(coord.kind, coord.d)) {
                while tag.0.len() < 4 {
                    tag.0.push(String::new());
                }
                tag.0[3] = id.clone();
            }
        }
        let ev = finalize(&draft, signer, created_at)?;
        if let Some(d) = ev.d_tag() {
            ids.insert((ev.kind, d.to_string()), ev.id.clone());
        }
        signed[idx] = Some(ev);
    }

    Ok(signed.into_iter().flatten().collect())
}

fn substitute_author(tag: &mut Tag, pubkey: &str) {
    let Some(coord) = tag.value().and_then(Coordinate::parse) else {
        return;
    };
    if coord.pubkey == PUBKEY_PLACEHOLDER {
        tag.0[1] = Coordinate::new(coord.kind, pubkey, coord.d).to_string();
    }
}

/// Verify an event's ID and Schnorr signature.
pub fn verify_event(ev: &Event) -> Result<()> {
    let hash = event_hash(ev)?;
    let calc_id = hex::encode(hash);
    if calc_id != ev.id {
        return Err(anyhow!("id mismatch for {}", ev.id));
    }
    let sig = Signature::from_slice(&hex::decode(&ev.sig)?)?;
    let pk = XOnlyPublicKey::from_slice(&hex::decode(&ev.pubkey)?)?;
    let secp = Secp256k1::verification_only();
    let msg = Message::from_digest(hash);
    secp.verify_schnorr(&sig, &msg, &pk)?;
    Ok(())
}

/// Verify a random sample of `events`; returns how many were checked.
pub fn verify_sample(events: &[Event], sample: usize) -> Result<usize> {
    let mut picked: Vec<&Event> = events.iter().collect();
    picked.shuffle(&mut thread_rng());
    let take = sample.min(picked.len());
    for ev in picked.iter().take(take) {
        verify_event(ev)?;
    }
    Ok(take)
}
