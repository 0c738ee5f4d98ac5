//! Compile hierarchical documents into Nostr publication graphs (kind 30040
//! indexes over kind 30041 content), sign them, publish them to a relay and
//! reconcile what the relay actually holds.

pub mod compile;
pub mod config;
pub mod delete;
pub mod event;
pub mod keys;
pub mod layout;
pub mod publish;
pub mod qc;
pub mod relay;
pub mod sign;
