//! Deletion markers (NIP-09) for a previously published batch.

use crate::event::{Draft, Event, Tag, KIND_DELETION};

/// One kind-5 draft per record, referencing it by id and, when it has a
/// durable key, by address so relays drop every version under that key.
pub fn deletion_drafts(events: &[Event], reason: &str) -> Vec<Draft> {
    events
        .iter()
        .map(|ev| {
            let mut draft = Draft::new(KIND_DELETION);
            draft.tags.push(Tag::new(["e", ev.id.as_str()]));
            if let Some(key) = ev.durable_key() {
                draft.tags.push(Tag::new(["a".to_string(), key.to_string()]));
            }
            draft.tags.push(Tag::new(["k".to_string(), ev.kind.to_string()]));
            draft.content = reason.to_string();
            draft
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{KIND_CONTENT, KIND_INDEX};

    fn ev(id: &str, kind: u32, d: Option<&str>) -> Event {
        Event {
            id: id.into(),
            pubkey: "pk".into(),
            kind,
            created_at: 1,
            tags: d.map(|d| vec![Tag::new(["d", d])]).unwrap_or_default(),
            content: "x".into(),
            sig: "s".into(),
        }
    }

    #[test]
    fn one_marker_per_record() {
        let events = [ev("i1", KIND_INDEX, Some("root")), ev("i2", KIND_CONTENT, None)];
        let drafts = deletion_drafts(&events, "withdrawn");
        assert_eq!(drafts.len(), 2);
        assert!(drafts.iter().all(|d| d.kind == KIND_DELETION && d.content == "withdrawn"));

        assert_eq!(drafts[0].values("e"), ["i1"]);
        assert_eq!(drafts[0].values("a"), ["30040:pk:root"]);
        assert_eq!(drafts[0].values("k"), ["30040"]);

        assert_eq!(drafts[1].values("e"), ["i2"]);
        assert!(drafts[1].values("a").is_empty());
        assert!(drafts[1].d_tag().is_none());
    }
}
