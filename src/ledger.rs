//! Ordered, append-only, deduplicated message list for the selected conversation

use crate::messages::{Message, MessageKey};
use std::collections::HashSet;

/// Messages in arrival order. Entries are never removed or reordered except by
/// a full `reset`/`load_history`/`take`.
#[derive(Debug, Default)]
pub struct MessageLedger {
    entries: Vec<Message>,
    seen: HashSet<MessageKey>,
}

impl MessageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.entries.clear();
        self.seen.clear();
    }

    /// Replace the contents with a fetched history batch.
    /// Equal-keyed rows inside the batch collapse to the first one.
    pub fn load_history(&mut self, messages: Vec<Message>) {
        self.reset();
        for message in messages {
            self.append(message);
        }
    }

    /// Append unless an equal-keyed message is already present
    pub fn append(&mut self, message: Message) -> bool {
        if !self.seen.insert(message.key()) {
            return false;
        }
        self.entries.push(message);
        true
    }

    /// Drain every entry, leaving the ledger empty
    pub fn take(&mut self) -> Vec<Message> {
        self.seen.clear();
        std::mem::take(&mut self.entries)
    }

    pub fn contains(&self, key: &MessageKey) -> bool {
        self.seen.contains(key)
    }

    pub fn messages(&self) -> &[Message] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn msg(sender: &str, content: &str, ts: &str) -> Message {
        Message {
            sender_id: sender.to_string(),
            receiver_id: "alice".to_string(),
            content: content.to_string(),
            timestamp: ts.to_string(),
            read: false,
        }
    }

    #[test]
    fn test_append_twice_is_idempotent() {
        let mut ledger = MessageLedger::new();
        let m = msg("bob", "hi", "T1");
        assert!(ledger.append(m.clone()));
        assert!(!ledger.append(m));
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_read_flag_not_part_of_key() {
        let mut ledger = MessageLedger::new();
        let m1 = msg("bob", "hi", "T1");
        let mut m2 = m1.clone();
        m2.read = true;
        ledger.append(m1);
        assert!(!ledger.append(m2));
        assert_eq!(ledger.len(), 1);
        assert!(!ledger.messages()[0].read);
    }

    #[test]
    fn test_order_preserved() {
        let mut ledger = MessageLedger::new();
        let m1 = msg("bob", "first", "T2");
        let m2 = msg("bob", "second", "T1");
        ledger.append(m1.clone());
        ledger.append(m2.clone());
        // Insertion order, not timestamp order
        assert_eq!(ledger.messages(), &[m1, m2]);
    }

    #[test]
    fn test_load_history_replaces() {
        let mut ledger = MessageLedger::new();
        ledger.append(msg("carol", "old", "T0"));

        ledger.load_history(vec![
            msg("bob", "a", "T1"),
            msg("bob", "a", "T1"),
            msg("alice", "b", "T2"),
        ]);

        assert_eq!(ledger.len(), 2);
        assert!(!ledger.contains(&msg("carol", "old", "T0").key()));
        assert!(ledger.contains(&msg("bob", "a", "T1").key()));
    }

    #[test]
    fn test_reset_and_take() {
        let mut ledger = MessageLedger::new();
        ledger.append(msg("bob", "a", "T1"));
        ledger.append(msg("bob", "b", "T2"));

        let drained = ledger.take();
        assert_eq!(drained.len(), 2);
        assert!(ledger.is_empty());
        // Keys forgotten with the entries
        assert!(ledger.append(msg("bob", "a", "T1")));

        ledger.reset();
        assert!(ledger.is_empty());
    }

    fn arb_message() -> impl Strategy<Value = Message> {
        ("[a-c]{1,2}", "[a-z ]{0,6}", "T[0-9]", any::<bool>()).prop_map(|(s, c, t, read)| Message {
            sender_id: s,
            receiver_id: "peer".to_string(),
            content: c,
            timestamp: t,
            read,
        })
    }

    proptest! {
        #[test]
        fn prop_no_duplicate_keys(messages in prop::collection::vec(arb_message(), 0..40)) {
            let mut ledger = MessageLedger::new();
            for m in &messages {
                ledger.append(m.clone());
            }
            let keys: HashSet<_> = ledger.messages().iter().map(Message::key).collect();
            prop_assert_eq!(keys.len(), ledger.len());
        }

        #[test]
        fn prop_first_occurrence_order(messages in prop::collection::vec(arb_message(), 0..40)) {
            let mut ledger = MessageLedger::new();
            let mut expected = Vec::new();
            let mut seen = HashSet::new();
            for m in &messages {
                if seen.insert(m.key()) {
                    expected.push(m.clone());
                }
                ledger.append(m.clone());
            }
            prop_assert_eq!(ledger.messages(), expected.as_slice());
        }

        #[test]
        fn prop_append_reports_insertion(messages in prop::collection::vec(arb_message(), 0..40)) {
            let mut ledger = MessageLedger::new();
            for m in messages {
                let before = ledger.len();
                let inserted = ledger.append(m);
                prop_assert_eq!(inserted, ledger.len() == before + 1);
            }
        }
    }
}
