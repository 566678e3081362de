//! Duplicate suppression for inbound realtime events
//!
//! Transports retransmit on ambiguous acks and may deliver the same event
//! twice across a reconnect. Two checks run in arrival order:
//!
//! 1. back-to-back retransmit: same id and content hash as the last event
//!    processed, within the window
//! 2. reordered duplicate: id seen anywhere in the recent window

use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

use super::events::Envelope;

/// Identity of an inbound event for dedup purposes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub event_id: String,
    pub content_hash: String,
}

const ID_FIELDS: &[&str] = &["id", "messageId", "_id", "eventId"];
const SENDER_FIELDS: &[&str] = &["senderId", "sender", "from", "userId"];
const CONTENT_FIELDS: &[&str] = &["content", "text", "message", "body"];
const TIMESTAMP_FIELDS: &[&str] = &["timestamp", "createdAt", "sentAt"];
const CONVERSATION_FIELDS: &[&str] = &["chatId", "conversationId", "roomId"];

fn field(data: &serde_json::Value, names: &[&str]) -> Option<String> {
    names.iter().find_map(|name| match data.get(*name)? {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s.clone()),
        // Nested sender objects: {"sender": {"id": ...}}
        serde_json::Value::Object(obj) => obj
            .get("id")
            .or_else(|| obj.get("_id"))
            .map(|v| v.as_str().map(String::from).unwrap_or_else(|| v.to_string())),
        other => Some(other.to_string()),
    })
}

impl Fingerprint {
    pub fn of(envelope: &Envelope) -> Self {
        let data = &envelope.data;

        let mut hasher = Sha256::new();
        let timestamp = field(data, TIMESTAMP_FIELDS)
            .or_else(|| envelope.timestamp.map(|t| t.to_rfc3339()));
        for part in [
            field(data, SENDER_FIELDS),
            field(data, CONTENT_FIELDS),
            timestamp,
            field(data, CONVERSATION_FIELDS),
        ] {
            hasher.update(part.unwrap_or_default().as_bytes());
            hasher.update([0x1f]);
        }
        let digest = hasher.finalize();
        let content_hash: String = digest[..8].iter().map(|b| format!("{:02x}", b)).collect();

        // Ids are scoped by event type: a read receipt for message m1 is not
        // a duplicate of message m1 itself.
        let id = field(data, ID_FIELDS).unwrap_or_else(|| content_hash.clone());
        let event_id = format!("{}:{}", envelope.event_type, id);

        Self {
            event_id,
            content_hash,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accepted,
    /// Identical to the last processed event.
    Retransmit,
    /// Id already in the recent window.
    Reordered,
}

/// Bounded, time-ordered record of recently accepted event ids.
#[derive(Debug)]
pub struct RecentMessageWindow {
    entries: VecDeque<(String, Instant)>,
    last: Option<(Fingerprint, Instant)>,
    window: Duration,
    cap: usize,
}

impl RecentMessageWindow {
    pub fn new(window: Duration, cap: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            last: None,
            window,
            cap: cap.max(1),
        }
    }

    /// Decide whether an event arriving at `now` is new. Accepted events are
    /// recorded.
    pub fn admit(&mut self, fingerprint: &Fingerprint, now: Instant) -> Admission {
        self.prune(now);

        if let Some((ref last, at)) = self.last {
            if last == fingerprint && now.duration_since(at) <= self.window {
                return Admission::Retransmit;
            }
        }

        if self
            .entries
            .iter()
            .any(|(id, _)| *id == fingerprint.event_id)
        {
            return Admission::Reordered;
        }

        self.entries.push_back((fingerprint.event_id.clone(), now));
        while self.entries.len() > self.cap {
            self.entries.pop_front();
        }
        self.last = Some((fingerprint.clone(), now));
        Admission::Accepted
    }

    fn prune(&mut self, now: Instant) {
        while let Some((_, at)) = self.entries.front() {
            if now.duration_since(*at) > self.window {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.last = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message(id: &str, content: &str) -> Envelope {
        Envelope::new(
            "new_message",
            json!({
                "id": id,
                "chatId": "c1",
                "senderId": "u2",
                "content": content,
                "createdAt": "2024-05-01T10:00:00Z"
            }),
        )
    }

    #[test]
    fn test_fingerprint_is_stable() {
        let a = Fingerprint::of(&message("m1", "hello"));
        let b = Fingerprint::of(&message("m1", "hello"));
        assert_eq!(a, b);
        assert_eq!(a.event_id, "new_message:m1");
        assert_eq!(a.content_hash.len(), 16);

        let edited = Fingerprint::of(&message("m1", "hello!"));
        assert_eq!(edited.event_id, a.event_id);
        assert_ne!(edited.content_hash, a.content_hash);
    }

    #[test]
    fn test_fingerprint_without_id_uses_hash() {
        let env = Envelope::new("typing", json!({ "chatId": "c1", "userId": "u2" }));
        let fp = Fingerprint::of(&env);
        assert_eq!(fp.event_id, format!("typing:{}", fp.content_hash));
    }

    #[test]
    fn test_retransmit_within_window() {
        let start = Instant::now();
        let mut window = RecentMessageWindow::new(Duration::from_secs(5), 100);
        let fp = Fingerprint::of(&message("m1", "hello"));

        assert_eq!(window.admit(&fp, start), Admission::Accepted);
        assert_eq!(
            window.admit(&fp, start + Duration::from_secs(2)),
            Admission::Retransmit
        );
        assert_eq!(window.len(), 1);
    }

    #[test]
    fn test_reordered_duplicate() {
        let start = Instant::now();
        let mut window = RecentMessageWindow::new(Duration::from_secs(5), 100);
        let m1 = Fingerprint::of(&message("m1", "hello"));
        let m2 = Fingerprint::of(&message("m2", "world"));

        assert_eq!(window.admit(&m1, start), Admission::Accepted);
        assert_eq!(window.admit(&m2, start), Admission::Accepted);
        assert_eq!(
            window.admit(&m1, start + Duration::from_secs(1)),
            Admission::Reordered
        );
    }

    #[test]
    fn test_accepted_again_after_window() {
        let start = Instant::now();
        let mut window = RecentMessageWindow::new(Duration::from_secs(5), 100);
        let fp = Fingerprint::of(&message("m1", "hello"));

        assert_eq!(window.admit(&fp, start), Admission::Accepted);
        assert_eq!(
            window.admit(&fp, start + Duration::from_millis(5001)),
            Admission::Accepted
        );
    }

    #[test]
    fn test_cap_evicts_oldest() {
        let start = Instant::now();
        let mut window = RecentMessageWindow::new(Duration::from_secs(5), 3);
        for i in 0..5 {
            let fp = Fingerprint::of(&message(&format!("m{}", i), "x"));
            assert_eq!(window.admit(&fp, start), Admission::Accepted);
        }
        assert_eq!(window.len(), 3);

        // m0 was evicted and is no longer recognised by id.
        let m0 = Fingerprint::of(&message("m0", "x"));
        assert_eq!(window.admit(&m0, start), Admission::Accepted);

        window.clear();
        assert!(window.is_empty());
    }
}
