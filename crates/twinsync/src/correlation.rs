use crate::error::{Result, TwinError};
use bytes::Bytes;
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::{debug, trace};
use twinsync_protocol::{CorrelationId, PendingTable, RequestKind};

/// A correlated reply from the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceResponse {
    pub status: u16,
    pub version: Option<u64>,
    pub body: Bytes,
}

impl ServiceResponse {
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Converts a non-2xx reply into the matching error.
    pub fn into_result(self) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            let message = String::from_utf8_lossy(&self.body).into_owned();
            Err(TwinError::from_status(self.status, message))
        }
    }
}

pub type Waiter = oneshot::Sender<Result<ServiceResponse>>;
pub type WaiterReceiver = oneshot::Receiver<Result<ServiceResponse>>;

/// Outstanding requests of one session and the waiters blocked on them.
#[derive(Debug, Default)]
pub struct CorrelationTable {
    table: PendingTable<Waiter>,
}

impl CorrelationTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: RequestKind, deadline: Instant) -> (CorrelationId, WaiterReceiver) {
        let (tx, rx) = oneshot::channel();
        let id = self.table.register(kind, deadline, tx);
        trace!(%id, ?kind, "Registered pending request");
        (id, rx)
    }

    /// Completes the request `id`. Unknown ids are ignored, which absorbs
    /// duplicate and late replies. A reply at or after the deadline
    /// resolves the request with `Timeout`.
    pub fn resolve(&mut self, id: CorrelationId, result: Result<ServiceResponse>, now: Instant) -> bool {
        let Some(entry) = self.table.take(id) else {
            debug!(%id, "Dropping reply for unknown request");
            return false;
        };

        if entry.deadline <= now {
            let _ = entry.waiter.send(Err(TwinError::Timeout));
            return false;
        }

        let _ = entry.waiter.send(result);
        true
    }

    /// Resolves every request past its deadline with `Timeout`.
    pub fn expire_overdue(&mut self, now: Instant) -> usize {
        let expired = self.table.take_overdue(now);
        for (id, entry) in &expired {
            debug!(%id, kind = ?entry.kind, "Pending request timed out");
        }
        let count = expired.len();
        for (_, entry) in expired {
            let _ = entry.waiter.send(Err(TwinError::Timeout));
        }
        count
    }

    /// Removes `id` without notifying its waiter.
    pub fn cancel(&mut self, id: CorrelationId) -> bool {
        self.table.take(id).is_some()
    }

    pub fn fail_all(&mut self, error: &TwinError) -> usize {
        let drained = self.table.drain();
        let count = drained.len();
        for (_, entry) in drained {
            let _ = entry.waiter.send(Err(error.clone()));
        }
        count
    }

    #[must_use]
    pub fn contains(&self, id: CorrelationId) -> bool {
        self.table.contains(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.table.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn ok(status: u16) -> Result<ServiceResponse> {
        Ok(ServiceResponse {
            status,
            version: None,
            body: Bytes::new(),
        })
    }

    #[test]
    fn test_second_resolve_is_noop() {
        let mut table = CorrelationTable::new();
        let now = Instant::now();
        let (id, mut rx) = table.register(RequestKind::TwinGet, now + Duration::from_secs(5));

        assert!(table.resolve(id, ok(200), now));
        assert!(!table.resolve(id, ok(500), now));
        assert_eq!(rx.try_recv().unwrap().unwrap().status, 200);
        assert!(table.is_empty());
    }

    #[test]
    fn test_resolve_just_before_deadline_delivers_result() {
        let mut table = CorrelationTable::new();
        let now = Instant::now();
        let deadline = now + Duration::from_millis(100);
        let (id, mut rx) = table.register(RequestKind::TwinPatch, deadline);

        assert!(table.resolve(id, ok(204), deadline - Duration::from_millis(1)));
        assert_eq!(rx.try_recv().unwrap().unwrap().status, 204);
    }

    #[test]
    fn test_resolve_at_deadline_times_out() {
        let mut table = CorrelationTable::new();
        let now = Instant::now();
        let deadline = now + Duration::from_millis(100);
        let (id, mut rx) = table.register(RequestKind::TwinPatch, deadline);

        assert!(!table.resolve(id, ok(204), deadline));
        assert_eq!(rx.try_recv().unwrap(), Err(TwinError::Timeout));
    }

    #[test]
    fn test_expire_overdue_only_touches_due_entries() {
        let mut table = CorrelationTable::new();
        let now = Instant::now();
        let (_, mut due) = table.register(RequestKind::MethodInvoke, now);
        let (later, _rx) = table.register(RequestKind::MethodInvoke, now + Duration::from_secs(1));

        assert_eq!(table.expire_overdue(now), 1);
        assert_eq!(due.try_recv().unwrap(), Err(TwinError::Timeout));
        assert!(table.contains(later));
    }

    #[test]
    fn test_fail_all() {
        let mut table = CorrelationTable::new();
        let deadline = Instant::now() + Duration::from_secs(1);
        let (_, mut a) = table.register(RequestKind::TwinGet, deadline);
        let (_, mut b) = table.register(RequestKind::MethodInvoke, deadline);

        assert_eq!(table.fail_all(&TwinError::SessionClosed), 2);
        assert_eq!(a.try_recv().unwrap(), Err(TwinError::SessionClosed));
        assert_eq!(b.try_recv().unwrap(), Err(TwinError::SessionClosed));
        assert!(table.is_empty());
    }

    #[test]
    fn test_into_result_maps_status() {
        let response = ServiceResponse {
            status: 404,
            version: None,
            body: Bytes::from_static(b"no twin"),
        };
        assert_eq!(
            response.into_result(),
            Err(TwinError::NotFound("no twin".to_string()))
        );
    }
}
