//! Transaction redo buffer.
//!
//! While a transaction is open, every redoable command is appended here so
//! that a transient connection failure can be healed by replaying the whole
//! transaction on a fresh session. The buffer is bounded: overflowing marks
//! it dirty and disables replay until the transaction boundary clears it.

use crate::message::ClientMessage;

#[derive(Debug)]
pub struct TransactionSaver {
    messages: Vec<ClientMessage>,
    capacity: usize,
    dirty: bool,
}

impl TransactionSaver {
    pub fn new(capacity: usize) -> Self {
        Self {
            messages: Vec::new(),
            capacity,
            dirty: false,
        }
    }

    /// Record a command executed inside the current transaction.
    pub fn record(&mut self, message: ClientMessage) {
        if self.dirty {
            return;
        }
        if self.messages.len() >= self.capacity {
            self.dirty = true;
            self.messages.clear();
            return;
        }
        self.messages.push(message);
    }

    /// Replay is impossible: the buffer overflowed this transaction.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn messages(&self) -> &[ClientMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Transaction boundary reached (commit/rollback): forget everything.
    pub fn clear(&mut self) {
        self.messages.clear();
        self.dirty = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(sql: &str) -> ClientMessage {
        ClientMessage::Query { sql: sql.into() }
    }

    #[test]
    fn records_in_order() {
        let mut saver = TransactionSaver::new(8);
        saver.record(query("INSERT INTO t VALUES (1)"));
        saver.record(query("UPDATE t SET a=2"));
        assert_eq!(saver.len(), 2);
        assert!(matches!(
            &saver.messages()[0],
            ClientMessage::Query { sql } if sql.contains("INSERT")
        ));
    }

    #[test]
    fn overflow_disables_replay() {
        let mut saver = TransactionSaver::new(2);
        saver.record(query("a"));
        saver.record(query("b"));
        assert!(!saver.is_dirty());
        saver.record(query("c"));
        assert!(saver.is_dirty());
        assert!(saver.is_empty());

        // Still dirty until the transaction boundary.
        saver.record(query("d"));
        assert!(saver.is_empty());
        saver.clear();
        assert!(!saver.is_dirty());
        saver.record(query("e"));
        assert_eq!(saver.len(), 1);
    }
}
