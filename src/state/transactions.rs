use std::collections::HashMap;

use tracing::debug;

use super::flow_table::FlowId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionKey {
    pub flow: FlowId,
    pub id: u64,
}

/// A request and, once seen, its reply. `M` is the call metadata the request
/// decoder stored so the reply can be interpreted without the request bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct Transaction<M> {
    pub key: TransactionKey,
    pub request_frame: u64,
    pub reply_frame: Option<u64>,
    pub metadata: M,
    pub duplicate_requests: Vec<u64>,
    pub duplicate_replies: Vec<u64>,
}

impl<M> Transaction<M> {
    pub fn is_complete(&self) -> bool {
        self.reply_frame.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenOutcome {
    Opened(TransactionKey),
    /// The id was already in use; the original transaction was kept untouched.
    Duplicate {
        key: TransactionKey,
        original_frame: u64,
    },
}

impl OpenOutcome {
    pub fn key(&self) -> TransactionKey {
        match self {
            OpenOutcome::Opened(key) | OpenOutcome::Duplicate { key, .. } => *key,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, OpenOutcome::Duplicate { .. })
    }
}

#[derive(Debug)]
pub struct Completion<'a, M> {
    pub transaction: &'a Transaction<M>,
    /// A reply for this transaction had already been seen in an earlier frame.
    pub duplicate: bool,
}

/// Correlates requests and replies by (flow, transaction id).
#[derive(Debug)]
pub struct TransactionTable<M> {
    entries: HashMap<TransactionKey, Transaction<M>>,
}

impl<M> Default for TransactionTable<M> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<M> TransactionTable<M> {
    pub fn open(&mut self, flow: FlowId, id: u64, frame: u64, metadata: M) -> OpenOutcome {
        let key = TransactionKey { flow, id };
        if let Some(existing) = self.entries.get_mut(&key) {
            if existing.request_frame != frame && !existing.duplicate_requests.contains(&frame) {
                existing.duplicate_requests.push(frame);
            }
            debug!(%flow, id, frame, original = existing.request_frame, "duplicate request");
            return OpenOutcome::Duplicate {
                key,
                original_frame: existing.request_frame,
            };
        }

        self.entries.insert(
            key,
            Transaction {
                key,
                request_frame: frame,
                reply_frame: None,
                metadata,
                duplicate_requests: Vec::new(),
                duplicate_replies: Vec::new(),
            },
        );
        debug!(%flow, id, frame, "opened transaction");
        OpenOutcome::Opened(key)
    }

    /// Matches a reply seen in `frame`. `None` means the request was never seen.
    pub fn complete(&mut self, flow: FlowId, id: u64, frame: u64) -> Option<Completion<'_, M>> {
        let key = TransactionKey { flow, id };
        let transaction = self.entries.get_mut(&key)?;

        let duplicate = match transaction.reply_frame {
            None => {
                transaction.reply_frame = Some(frame);
                debug!(
                    %flow,
                    id,
                    frame,
                    request = transaction.request_frame,
                    "completed transaction"
                );
                false
            }
            Some(reply) if reply == frame => false,
            Some(reply) => {
                if !transaction.duplicate_replies.contains(&frame) {
                    transaction.duplicate_replies.push(frame);
                }
                debug!(%flow, id, frame, original = reply, "duplicate reply");
                true
            }
        };

        Some(Completion {
            transaction,
            duplicate,
        })
    }

    /// Read-only lookup for layered decoders.
    pub fn peek(&self, flow: FlowId, id: u64) -> Option<&Transaction<M>> {
        self.entries.get(&TransactionKey { flow, id })
    }

    pub fn get(&self, key: &TransactionKey) -> Option<&Transaction<M>> {
        self.entries.get(key)
    }

    pub fn for_flow(&self, flow: FlowId) -> impl Iterator<Item = &Transaction<M>> {
        self.entries.values().filter(move |txn| txn.key.flow == flow)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::{OpenOutcome, TransactionKey, TransactionTable};
    use crate::state::flow_table::FlowId;

    #[derive(Debug, Clone, PartialEq)]
    struct Call {
        procedure: &'static str,
    }

    const FLOW: FlowId = FlowId(1);

    #[test]
    fn reply_returns_request_metadata() {
        let mut table = TransactionTable::default();
        let opened = table.open(FLOW, 7, 1, Call { procedure: "connect" });
        assert_eq!(opened, OpenOutcome::Opened(TransactionKey { flow: FLOW, id: 7 }));

        let completion = table.complete(FLOW, 7, 2).expect("transaction is open");
        assert!(!completion.duplicate);
        assert_eq!(completion.transaction.request_frame, 1);
        assert_eq!(completion.transaction.reply_frame, Some(2));
        assert_eq!(completion.transaction.metadata.procedure, "connect");
    }

    #[test]
    fn unknown_reply_is_unmatched() {
        let mut table: TransactionTable<Call> = TransactionTable::default();
        assert!(table.complete(FLOW, 99, 5).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn duplicate_request_keeps_original_metadata() {
        let mut table = TransactionTable::default();
        table.open(FLOW, 7, 1, Call { procedure: "connect" });
        let again = table.open(FLOW, 7, 3, Call { procedure: "bind" });
        assert!(again.is_duplicate());
        assert_eq!(
            again,
            OpenOutcome::Duplicate {
                key: TransactionKey { flow: FLOW, id: 7 },
                original_frame: 1
            }
        );

        let txn = table.peek(FLOW, 7).expect("open");
        assert_eq!(txn.metadata.procedure, "connect");
        assert_eq!(txn.duplicate_requests, vec![3]);
    }

    #[test]
    fn second_reply_is_flagged_duplicate() {
        let mut table = TransactionTable::default();
        table.open(FLOW, 7, 1, Call { procedure: "connect" });
        assert!(!table.complete(FLOW, 7, 2).expect("open").duplicate);
        let second = table.complete(FLOW, 7, 4).expect("open");
        assert!(second.duplicate);
        assert_eq!(second.transaction.reply_frame, Some(2));
        assert_eq!(second.transaction.duplicate_replies, vec![4]);
    }

    #[test]
    fn same_ids_on_different_flows_do_not_collide() {
        let mut table = TransactionTable::default();
        table.open(FlowId(1), 7, 1, Call { procedure: "a" });
        let other = table.open(FlowId(2), 7, 2, Call { procedure: "b" });
        assert!(!other.is_duplicate());
        assert_eq!(table.len(), 2);
        assert_eq!(table.for_flow(FlowId(2)).count(), 1);
    }

    #[test]
    fn peek_does_not_complete() {
        let mut table = TransactionTable::default();
        table.open(FLOW, 1, 1, Call { procedure: "x" });
        assert!(!table.peek(FLOW, 1).expect("open").is_complete());
        assert!(!table.complete(FLOW, 1, 2).expect("open").duplicate);
    }
}
