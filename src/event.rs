//! Nostr record model: unsigned drafts and finalized events.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Deletion marker kind (NIP-09).
pub const KIND_DELETION: u32 = 5;
/// Structural index record (collection, book, chapter).
pub const KIND_INDEX: u32 = 30040;
/// Leaf content record (section or verse text).
pub const KIND_CONTENT: u32 = 30041;

/// Author key written into address tags before the signing key is known.
/// [`crate::sign`] swaps it for the real x-only public key.
pub const PUBKEY_PLACEHOLDER: &str = "<pubkey>";

/// Wrapper for a Nostr tag expressed as an array of strings.
///
/// The first element names the tag and the rest carry data. Tags used by a
/// publication graph:
///
/// - `d` – durable identifier, unique per author and kind
/// - `a` – address of a child record, `kind:pubkey:d`
/// - `C`, `T`, `c`, `s`, `v` – hierarchy classification
/// - `title`, `author`, `type`, … – descriptive tags
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tag(pub Vec<String>);

impl Tag {
    /// Build a tag from any sequence of string-like parts.
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Tag(parts.into_iter().map(Into::into).collect())
    }

    /// Address tag pointing at `coordinate`. The event id slot stays empty
    /// until the child has been signed.
    pub fn address(coordinate: &Coordinate, relay_hint: &str) -> Self {
        Tag::new([
            "a".to_string(),
            coordinate.to_string(),
            relay_hint.to_string(),
            String::new(),
        ])
    }

    pub fn name(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    pub fn value(&self) -> Option<&str> {
        self.0.get(1).map(String::as_str)
    }

    pub fn is(&self, name: &str) -> bool {
        self.name() == Some(name)
    }
}

/// Record as produced by the compiler: no author, timestamp, id or signature.
///
/// Persisted one per line as `{"kind": 30041, "tags": [...], "content": "..."}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Draft {
    pub kind: u32,
    pub tags: Vec<Tag>,
    pub content: String,
}

impl Draft {
    pub fn new(kind: u32) -> Self {
        Self {
            kind,
            tags: Vec::new(),
            content: String::new(),
        }
    }

    /// Value of the `d` tag, if any.
    pub fn d_tag(&self) -> Option<&str> {
        first_value(&self.tags, "d")
    }

    /// Coordinates referenced by this record's `a` tags, in tag order.
    pub fn addresses(&self) -> Vec<Coordinate> {
        addresses(&self.tags)
    }

    pub fn values(&self, name: &str) -> Vec<&str> {
        self.tags
            .iter()
            .filter(|t| t.is(name))
            .filter_map(Tag::value)
            .collect()
    }
}

/// Finalized Nostr event as submitted to relays.
///
/// ```json
/// {
///   "id": "5c83…",
///   "pubkey": "79be…",
///   "kind": 30041,
///   "created_at": 1700000000,
///   "tags": [["d", "drm-bible-genesis-1-1"], ["s", "1"]],
///   "content": "In the beginning…",
///   "sig": "b1f0…"
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    /// Hex SHA-256 of the canonical serialization.
    pub id: String,
    /// Author x-only public key (hex).
    pub pubkey: String,
    pub kind: u32,
    /// Unix timestamp of creation.
    pub created_at: u64,
    pub tags: Vec<Tag>,
    pub content: String,
    /// Schnorr signature over the id (hex).
    pub sig: String,
}

impl Event {
    pub fn d_tag(&self) -> Option<&str> {
        first_value(&self.tags, "d")
    }

    /// `(kind, pubkey, d)` identity under which relays keep only the latest
    /// version. `None` for records without a `d` tag.
    pub fn durable_key(&self) -> Option<Coordinate> {
        self.d_tag().map(|d| Coordinate {
            kind: self.kind,
            pubkey: self.pubkey.clone(),
            d: d.to_string(),
        })
    }

    pub fn addresses(&self) -> Vec<Coordinate> {
        addresses(&self.tags)
    }

    /// Strip the signature fields, keeping kind, tags and content. Address
    /// tags naming this record's author get the placeholder back so the draft
    /// can be signed again under any key.
    pub fn to_draft(&self) -> Draft {
        let mut tags = self.tags.clone();
        for tag in tags.iter_mut().filter(|t| t.is("a")) {
            if let Some(coord) = tag.value().and_then(Coordinate::parse) {
                if coord.pubkey == self.pubkey {
                    tag.0[1] = Coordinate::new(coord.kind, PUBKEY_PLACEHOLDER, coord.d).to_string();
                }
            }
        }
        Draft {
            kind: self.kind,
            tags,
            content: self.content.clone(),
        }
    }
}

/// Address of a record: `kind:pubkey:d`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Coordinate {
    pub kind: u32,
    pub pubkey: String,
    pub d: String,
}

impl Coordinate {
    pub fn new(kind: u32, pubkey: impl Into<String>, d: impl Into<String>) -> Self {
        Self {
            kind,
            pubkey: pubkey.into(),
            d: d.into(),
        }
    }

    /// Parse `kind:pubkey:d`. The `d` part may itself contain colons.
    pub fn parse(value: &str) -> Option<Self> {
        let mut parts = value.splitn(3, ':');
        let kind = parts.next()?.parse().ok()?;
        let pubkey = parts.next()?.to_string();
        let d = parts.next()?.to_string();
        Some(Self { kind, pubkey, d })
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.kind, self.pubkey, self.d)
    }
}

fn first_value<'a>(tags: &'a [Tag], name: &str) -> Option<&'a str> {
    tags.iter().find(|t| t.is(name)).and_then(Tag::value)
}

fn addresses(tags: &[Tag]) -> Vec<Coordinate> {
    tags.iter()
        .filter(|t| t.is("a"))
        .filter_map(Tag::value)
        .filter_map(Coordinate::parse)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_serializes_as_plain_array() {
        let tag = Tag::new(["d", "slug"]);
        assert_eq!(serde_json::to_string(&tag).unwrap(), r#"["d","slug"]"#);
    }

    #[test]
    fn draft_round_trips_through_ndjson_shape() {
        let line = r#"{"kind":30041,"tags":[["d","x"],["s","1"]],"content":"text"}"#;
        let draft: Draft = serde_json::from_str(line).unwrap();
        assert_eq!(draft.kind, KIND_CONTENT);
        assert_eq!(draft.d_tag(), Some("x"));
        assert_eq!(serde_json::to_string(&draft).unwrap(), line);
    }

    #[test]
    fn signed_line_still_parses_as_draft() {
        let line = r#"{"id":"aa","pubkey":"pp","kind":30040,"created_at":1,"tags":[],"content":"","sig":"ss"}"#;
        let draft: Draft = serde_json::from_str(line).unwrap();
        assert_eq!(draft.kind, KIND_INDEX);
        assert!(serde_json::from_str::<Event>(r#"{"kind":1,"tags":[],"content":""}"#).is_err());
    }

    #[test]
    fn coordinate_parse_and_display() {
        let c = Coordinate::parse("30041:abcd:book-1-2").unwrap();
        assert_eq!(c.kind, 30041);
        assert_eq!(c.pubkey, "abcd");
        assert_eq!(c.d, "book-1-2");
        assert_eq!(c.to_string(), "30041:abcd:book-1-2");
        assert!(Coordinate::parse("nope").is_none());
        assert!(Coordinate::parse("x:abcd:d").is_none());
    }

    #[test]
    fn address_tag_wire_form() {
        let c = Coordinate::new(KIND_CONTENT, PUBKEY_PLACEHOLDER, "a-b");
        let tag = Tag::address(&c, "wss://relay");
        assert_eq!(tag.0, vec!["a", "30041:<pubkey>:a-b", "wss://relay", ""]);
        let draft = Draft {
            kind: KIND_INDEX,
            tags: vec![Tag::new(["d", "p"]), tag],
            content: String::new(),
        };
        assert_eq!(draft.addresses(), vec![c]);
    }

    #[test]
    fn durable_key_requires_d_tag() {
        let mut ev = Event {
            id: "i".into(),
            pubkey: "p".into(),
            kind: KIND_DELETION,
            created_at: 1,
            tags: vec![],
            content: String::new(),
            sig: String::new(),
        };
        assert!(ev.durable_key().is_none());
        ev.tags.push(Tag::new(["d", "slug"]));
        assert_eq!(ev.durable_key(), Some(Coordinate::new(5, "p", "slug")));
        assert_eq!(ev.to_draft().tags, ev.tags);
    }

    #[test]
    fn to_draft_restores_placeholder_author() {
        let ev = Event {
            id: "i".into(),
            pubkey: "p".into(),
            kind: KIND_INDEX,
            created_at: 1,
            tags: vec![
                Tag::new(["d", "root"]),
                Tag::new(["a", "30041:p:leaf", "wss://r", "c1"]),
                Tag::new(["a", "30041:other:leaf", "wss://r", "c2"]),
            ],
            content: String::new(),
            sig: String::new(),
        };
        let draft = ev.to_draft();
        assert_eq!(draft.tags[1].0, ["a", "30041:<pubkey>:leaf", "wss://r", "c1"]);
        assert_eq!(draft.tags[2], ev.tags[2]);
    }
}
