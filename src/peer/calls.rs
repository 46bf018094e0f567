//! Outstanding-call table keyed by correlation id.
//!
//! Each entry pairs a completion slot with a one-shot deadline timer.
//! Resolution by any path (reply, remote error, timeout, auth failure)
//! removes the entry first, so a second resolver observes an absent id and
//! does nothing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::errors::RpcError;
use crate::packer::Value;

/// One call's completion slot.
pub(crate) type CompletionSender = oneshot::Sender<Result<Value, RpcError>>;

struct CallRecord {
    slot: CompletionSender,
    timer: Option<JoinHandle<()>>,
}

/// Table of calls awaiting a reply.
#[derive(Default)]
pub(crate) struct CallTable {
    records: Mutex<HashMap<Vec<u8>, CallRecord>>,
}

impl CallTable {
    /// Insert a fresh record and arm its deadline timer.
    pub(crate) fn insert(
        self: &Arc<Self>,
        correlation_id: Vec<u8>,
        slot: CompletionSender,
        timeout: Duration,
    ) {
        let timer = tokio::spawn({
            let table = Arc::clone(self);
            let cid = correlation_id.clone();
            async move {
                tokio::time::sleep(timeout).await;
                if table.take(&cid).is_some_and(|slot| {
                    slot.send(Err(RpcError::Timeout)).is_err()
                }) {
                    debug!("timed-out call was no longer awaited");
                }
            }
        });
        let record = CallRecord {
            slot,
            timer: Some(timer),
        };
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(correlation_id, record);
    }

    /// Remove the record, cancel its timer, and hand back the slot.
    ///
    /// Returns `None` for a correlation id with no outstanding call, which
    /// is how duplicate and late resolutions become no-ops.
    pub(crate) fn take(&self, correlation_id: &[u8]) -> Option<CompletionSender> {
        let record = self
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(correlation_id)?;
        if let Some(timer) = record.timer {
            timer.abort();
        }
        Some(record.slot)
    }

    /// Resolve the call, if it is still outstanding.
    ///
    /// Returns `false` when the correlation id is unknown; callers log the
    /// late arrival and move on.
    pub(crate) fn resolve(&self, correlation_id: &[u8], result: Result<Value, RpcError>) -> bool {
        match self.take(correlation_id) {
            Some(slot) => {
                // the caller may have gone away; that is not an error
                let _ = slot.send(result);
                true
            }
            None => false,
        }
    }

    /// Number of calls still awaiting a reply.
    pub(crate) fn outstanding(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cid(n: u8) -> Vec<u8> {
        vec![n; 16]
    }

    #[tokio::test]
    async fn reply_resolves_and_clears_the_record() {
        let table = Arc::new(CallTable::default());
        let (tx, rx) = oneshot::channel();
        table.insert(cid(1), tx, Duration::from_secs(5));
        assert_eq!(table.outstanding(), 1);

        assert!(table.resolve(&cid(1), Ok(Value::Int(1))));
        assert_eq!(table.outstanding(), 0);
        assert!(matches!(rx.await, Ok(Ok(Value::Int(1)))));
    }

    #[tokio::test]
    async fn deadline_fires_timeout_once() {
        let table = Arc::new(CallTable::default());
        let (tx, rx) = oneshot::channel();
        table.insert(cid(2), tx, Duration::from_millis(20));

        assert!(matches!(rx.await, Ok(Err(RpcError::Timeout))));
        assert_eq!(table.outstanding(), 0);
        // a reply arriving after the deadline is a no-op
        assert!(!table.resolve(&cid(2), Ok(Value::Nil)));
    }

    #[tokio::test]
    async fn duplicate_resolution_is_a_no_op() {
        let table = Arc::new(CallTable::default());
        let (tx, _rx) = oneshot::channel();
        table.insert(cid(3), tx, Duration::from_secs(5));

        assert!(table.resolve(&cid(3), Ok(Value::Int(1))));
        assert!(!table.resolve(&cid(3), Ok(Value::Int(2))));
    }

    #[tokio::test]
    async fn resolution_cancels_the_timer() {
        let table = Arc::new(CallTable::default());
        let (tx, mut rx) = oneshot::channel();
        table.insert(cid(4), tx, Duration::from_millis(30));
        assert!(table.resolve(&cid(4), Ok(Value::Int(5))));

        tokio::time::sleep(Duration::from_millis(60)).await;
        // the slot saw exactly one resolution
        assert!(matches!(rx.try_recv(), Ok(Ok(Value::Int(5)))));
    }
}
