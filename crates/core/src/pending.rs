//! Table of requests awaiting a response.

use crate::error::{Error, Result};
use serde_json::Value;
use statrpc_protocol::RequestId;
use std::collections::HashMap;
use tokio::sync::oneshot;

pub(crate) type Responder = oneshot::Sender<Result<Value>>;

/// Pending calls keyed by request id.
///
/// Once closed, the table rejects new entries so a request racing with
/// disposal cannot be left without an answer.
#[derive(Debug, Default)]
pub(crate) struct PendingCalls {
    calls: HashMap<RequestId, Responder>,
    closed: bool,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a call. Fails if the table is closed or the id is in use.
    pub fn insert(&mut self, id: RequestId, responder: Responder) -> Result<()> {
        if self.closed {
            return Err(Error::Disposed);
        }
        if self.calls.contains_key(&id) {
            return Err(Error::DuplicateId(id.0));
        }
        self.calls.insert(id, responder);
        Ok(())
    }

    /// Completes the call with `id`. Returns false if no such call is pending.
    pub fn resolve(&mut self, id: RequestId, result: Result<Value>) -> bool {
        match self.calls.remove(&id) {
            Some(responder) => {
                // the caller may have stopped waiting
                let _ = responder.send(result);
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, id: RequestId) -> bool {
        self.calls.remove(&id).is_some()
    }

    /// Closes the table and rejects every outstanding call with
    /// [`Error::Disposed`]. Returns how many calls were rejected.
    pub fn close(&mut self) -> usize {
        self.closed = true;
        let count = self.calls.len();
        for (_, responder) in self.calls.drain() {
            let _ = responder.send(Err(Error::Disposed));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_delivers_result_once() {
        let mut pending = PendingCalls::new();
        let (tx, mut rx) = oneshot::channel();
        pending.insert(RequestId(1), tx).unwrap();

        assert!(pending.resolve(RequestId(1), Ok(Value::from(5))));
        assert!(!pending.resolve(RequestId(1), Ok(Value::from(6))));
        assert_eq!(rx.try_recv().unwrap().unwrap(), Value::from(5));
        assert_eq!(pending.len(), 0);
    }

    #[test]
    fn resolve_unknown_id_is_ignored() {
        let mut pending = PendingCalls::new();
        assert!(!pending.resolve(RequestId(42), Ok(Value::Null)));
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let mut pending = PendingCalls::new();
        let (tx1, _rx1) = oneshot::channel();
        let (tx2, _rx2) = oneshot::channel();
        pending.insert(RequestId(1), tx1).unwrap();
        assert!(pending.insert(RequestId(1), tx2).is_err());
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn close_rejects_all_outstanding() {
        let mut pending = PendingCalls::new();
        let mut receivers = Vec::new();
        for id in 1..=3 {
            let (tx, rx) = oneshot::channel();
            pending.insert(RequestId(id), tx).unwrap();
            receivers.push(rx);
        }

        assert_eq!(pending.close(), 3);
        assert_eq!(pending.len(), 0);
        for mut rx in receivers {
            assert!(matches!(rx.try_recv().unwrap(), Err(Error::Disposed)));
        }
    }

    #[test]
    fn closed_table_refuses_inserts() {
        let mut pending = PendingCalls::new();
        pending.close();
        let (tx, _rx) = oneshot::channel();
        assert!(matches!(
            pending.insert(RequestId(1), tx),
            Err(Error::Disposed)
        ));
    }
}
