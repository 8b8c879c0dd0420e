use crate::time::Instant;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Opaque token linking an outbound request to its response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationId(u64);

impl CorrelationId {
    #[must_use]
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Parses the `$rid` form used on the wire.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        s.parse().ok().map(Self)
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-session id source. Ids start at 1 and only grow.
#[derive(Debug)]
pub struct CorrelationIdGenerator {
    next: AtomicU64,
}

impl CorrelationIdGenerator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    #[must_use]
    pub fn next(&self) -> CorrelationId {
        CorrelationId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for CorrelationIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    TwinGet,
    TwinPatch,
    MethodInvoke,
}

#[derive(Debug)]
pub struct PendingEntry<W> {
    pub kind: RequestKind,
    pub deadline: Instant,
    pub waiter: W,
}

/// Outstanding requests keyed by correlation id.
///
/// Each entry leaves the table exactly once, through `take`,
/// `take_overdue` or `drain`; a second lookup for the same id finds
/// nothing, which is how duplicate and late responses are ignored.
#[derive(Debug)]
pub struct PendingTable<W> {
    entries: HashMap<CorrelationId, PendingEntry<W>>,
    ids: CorrelationIdGenerator,
}

impl<W> PendingTable<W> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            ids: CorrelationIdGenerator::new(),
        }
    }

    pub fn register(&mut self, kind: RequestKind, deadline: Instant, waiter: W) -> CorrelationId {
        let mut id = self.ids.next();
        while self.entries.contains_key(&id) {
            id = self.ids.next();
        }
        self.entries.insert(
            id,
            PendingEntry {
                kind,
                deadline,
                waiter,
            },
        );
        id
    }

    pub fn take(&mut self, id: CorrelationId) -> Option<PendingEntry<W>> {
        self.entries.remove(&id)
    }

    /// Removes and returns every entry whose deadline is at or before `now`.
    pub fn take_overdue(&mut self, now: Instant) -> Vec<(CorrelationId, PendingEntry<W>)> {
        let overdue: Vec<CorrelationId> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        overdue
            .into_iter()
            .filter_map(|id| self.entries.remove(&id).map(|entry| (id, entry)))
            .collect()
    }

    pub fn drain(&mut self) -> Vec<(CorrelationId, PendingEntry<W>)> {
        self.entries.drain().collect()
    }

    #[must_use]
    pub fn contains(&self, id: CorrelationId) -> bool {
        self.entries.contains_key(&id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<W> Default for PendingTable<W> {
    fn default() -> Self {
        Self::new()
    }
}
