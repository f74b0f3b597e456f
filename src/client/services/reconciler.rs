use chrono::{DateTime, Utc};
use log::debug;
use uuid::Uuid;

use crate::common::models::{ClientMessageId, ConversationId, Message, Provenance, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// New confirmed message added to the view
    Inserted,
    /// Echo of a provisional message: the provisional entry was replaced
    Confirmed,
    /// Server id already present, nothing changed
    Duplicate,
}

/// Ordered view of one conversation: timestamp ascending, ties by insertion order.
///
/// Provisional messages are matched to their echo only through the client
/// correlation id. An echo without it is kept as a separate entry.
#[derive(Debug, Clone)]
pub struct MessageReconciler {
    conversation_id: ConversationId,
    self_id: UserId,
    messages: Vec<Message>,
}

impl MessageReconciler {
    pub fn new(conversation_id: ConversationId, self_id: UserId) -> Self {
        Self {
            conversation_id,
            self_id,
            messages: Vec::new(),
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Optimistically add a message authored on this device.
    pub fn append_local(&mut self, content: &str, now: DateTime<Utc>) -> Message {
        let client_id: ClientMessageId = Uuid::new_v4();
        let message = Message {
            id: client_id.to_string(),
            conversation_id: self.conversation_id.clone(),
            sender_id: self.self_id.clone(),
            content: content.to_string(),
            timestamp: now,
            is_read: None,
            provenance: Provenance::Provisional,
            client_id: Some(client_id),
        };
        self.insert_sorted(message.clone());
        message
    }

    /// Add a message confirmed by the server (socket frame or history).
    pub fn append_remote(&mut self, mut message: Message) -> ReconcileOutcome {
        message.provenance = Provenance::Confirmed;
        message.conversation_id = self.conversation_id.clone();
        if message.sender_id != self.self_id && message.is_read.is_none() {
            message.is_read = Some(false);
        }

        if self
            .messages
            .iter()
            .any(|m| m.provenance == Provenance::Confirmed && m.id == message.id)
        {
            debug!("[RECONCILER] Ignoring duplicate message {}", message.id);
            return ReconcileOutcome::Duplicate;
        }

        let mut outcome = ReconcileOutcome::Inserted;
        if let Some(client_id) = message.client_id {
            if let Some(pos) = self
                .messages
                .iter()
                .position(|m| m.is_provisional() && m.client_id == Some(client_id))
            {
                self.messages.remove(pos);
                outcome = ReconcileOutcome::Confirmed;
            }
        }

        self.insert_sorted(message);
        outcome
    }

    pub fn seed_history(&mut self, history: Vec<Message>) -> usize {
        history
            .into_iter()
            .map(|m| self.append_remote(m))
            .filter(|o| *o != ReconcileOutcome::Duplicate)
            .count()
    }

    /// Locally authored messages still waiting for their echo.
    pub fn pending(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter().filter(|m| m.is_provisional())
    }

    pub fn unread_count(&self) -> usize {
        self.messages
            .iter()
            .filter(|m| m.sender_id != self.self_id && m.is_read == Some(false))
            .count()
    }

    fn insert_sorted(&mut self, message: Message) {
        let idx = self
            .messages
            .partition_point(|m| m.timestamp <= message.timestamp);
        self.messages.insert(idx, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn remote(id: &str, sender: &str, content: &str, ts: DateTime<Utc>) -> Message {
        Message {
            id: id.to_string(),
            conversation_id: "ignored".to_string(),
            sender_id: sender.to_string(),
            content: content.to_string(),
            timestamp: ts,
            is_read: None,
            provenance: Provenance::Confirmed,
            client_id: None,
        }
    }

    fn is_sorted(r: &MessageReconciler) -> bool {
        r.messages().windows(2).all(|w| w[0].timestamp <= w[1].timestamp)
    }

    #[test]
    fn keeps_timestamp_order_with_out_of_order_delivery() {
        let mut r = MessageReconciler::new("c1".to_string(), "me".to_string());
        r.append_remote(remote("3", "bob", "third", at(30)));
        r.append_remote(remote("1", "bob", "first", at(10)));
        r.append_local("second", at(20));
        let contents: Vec<_> = r.messages().iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["first", "second", "third"]);
        assert!(r.messages().iter().all(|m| m.conversation_id == "c1"));
    }

    #[test]
    fn ties_keep_insertion_order() {
        let mut r = MessageReconciler::new("c1".to_string(), "me".to_string());
        r.append_remote(remote("a", "bob", "A", at(5)));
        r.append_remote(remote("b", "bob", "B", at(5)));
        r.append_local("C", at(5));
        let contents: Vec<_> = r.messages().iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["A", "B", "C"]);
    }

    #[test]
    fn echo_without_correlation_id_is_kept_as_duplicate() {
        let mut r = MessageReconciler::new("c1".to_string(), "me".to_string());
        let local = r.append_local("hi", at(0));
        let outcome = r.append_remote(remote("srv-1", "me", "hi", at(0) - Duration::milliseconds(300)));
        assert_eq!(outcome, ReconcileOutcome::Inserted);
        assert_eq!(r.len(), 2);
        assert!(is_sorted(&r));
        assert_eq!(r.pending().count(), 1);
        assert_eq!(r.pending().next().map(|m| m.id.clone()), Some(local.id));
    }

    #[test]
    fn echo_with_correlation_id_replaces_the_provisional_entry() {
        let mut r = MessageReconciler::new("c1".to_string(), "me".to_string());
        r.append_remote(remote("0", "bob", "before", at(0)));
        let local = r.append_local("hi", at(10));
        r.append_remote(remote("2", "bob", "after", at(20)));

        let mut echo = remote("srv-9", "me", "hi", at(15));
        echo.client_id = local.client_id;
        assert_eq!(r.append_remote(echo), ReconcileOutcome::Confirmed);

        assert_eq!(r.len(), 3);
        assert_eq!(r.pending().count(), 0);
        let confirmed = &r.messages()[1];
        assert_eq!(confirmed.id, "srv-9");
        assert_eq!(confirmed.timestamp, at(15));
        assert_eq!(confirmed.provenance, Provenance::Confirmed);
    }

    #[test]
    fn same_server_id_is_ignored() {
        let mut r = MessageReconciler::new("c1".to_string(), "me".to_string());
        assert_eq!(r.append_remote(remote("1", "bob", "x", at(0))), ReconcileOutcome::Inserted);
        assert_eq!(r.append_remote(remote("1", "bob", "x", at(0))), ReconcileOutcome::Duplicate);
        assert_eq!(r.len(), 1);
    }

    #[test]
    fn read_flags_only_on_confirmed_messages() {
        let mut r = MessageReconciler::new("c1".to_string(), "me".to_string());
        let local = r.append_local("mine", at(0));
        assert_eq!(local.is_read, None);

        r.append_remote(remote("1", "bob", "unread", at(1)));
        let mut read = remote("2", "bob", "read", at(2));
        read.is_read = Some(true);
        r.append_remote(read);
        r.append_remote(remote("3", "me", "own echo", at(3)));

        assert_eq!(r.messages()[1].is_read, Some(false));
        assert_eq!(r.messages()[3].is_read, None);
        assert_eq!(r.unread_count(), 1);
    }

    #[test]
    fn seeding_history_skips_known_messages() {
        let mut r = MessageReconciler::new("c1".to_string(), "me".to_string());
        r.append_remote(remote("2", "bob", "live", at(20)));
        let added = r.seed_history(vec![
            remote("1", "bob", "old", at(10)),
            remote("2", "bob", "live", at(20)),
        ]);
        assert_eq!(added, 1);
        assert_eq!(r.len(), 2);
        assert_eq!(r.messages()[0].content, "old");
    }
}
