//! Local twin cache: desired-delta application and reported-patch tracking.

use crate::collection::{validate_property_key, PropertyMetadata, TwinCollection};
use crate::error::Result;
use crate::prelude::{debug_log, warn_log};
use crate::twin::{Property, TwinState};
use crate::value::TwinValue;
use std::collections::BTreeMap;

/// Result of applying an inbound desired-property delta.
#[derive(Debug, Clone, PartialEq)]
pub enum DeltaOutcome {
    /// Every key was committed; `changes` lists them in key order.
    Applied { changes: Vec<Property> },
    /// The delta is not newer than the cached desired version and was
    /// dropped without touching the cache.
    Stale { current: u64, received: u64 },
}

impl DeltaOutcome {
    #[must_use]
    pub fn changes(&self) -> &[Property] {
        match self {
            Self::Applied { changes } => changes,
            Self::Stale { .. } => &[],
        }
    }

    #[must_use]
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::Stale { .. })
    }
}

/// Reported-property patch ready to be sent.
///
/// Each key carries the local revision it was built from so that an
/// acknowledgement only clears edits that happened before the patch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReportedPatch {
    collection: TwinCollection,
    revisions: BTreeMap<String, u64>,
}

impl ReportedPatch {
    #[must_use]
    pub fn collection(&self) -> &TwinCollection {
        &self.collection
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.revisions.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.revisions.len()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.revisions.keys()
    }

    /// # Errors
    /// Returns `Serialization` if encoding fails.
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.collection.to_json())?)
    }
}

#[derive(Debug, Default)]
pub struct TwinCache {
    state: TwinState,
    dirty: BTreeMap<String, u64>,
    next_revision: u64,
}

impl TwinCache {
    #[must_use]
    pub fn new(device_id: impl Into<String>, module_id: Option<String>) -> Self {
        Self {
            state: TwinState::new(device_id, module_id),
            dirty: BTreeMap::new(),
            next_revision: 0,
        }
    }

    #[must_use]
    pub fn state(&self) -> &TwinState {
        &self.state
    }

    #[must_use]
    pub fn desired(&self) -> &TwinCollection {
        &self.state.properties.desired
    }

    #[must_use]
    pub fn reported(&self) -> &TwinCollection {
        &self.state.properties.reported
    }

    #[must_use]
    pub fn desired_version(&self) -> Option<u64> {
        self.state.properties.desired.version()
    }

    /// Merges an inbound delta into the desired properties.
    ///
    /// `new_version` falls back to the delta's own `$version`. A key mapped
    /// to `Null` is removed. The whole delta is applied before returning, so
    /// a caller holding the cache lock never exposes a partial update.
    pub fn apply_inbound_delta(
        &mut self,
        delta: TwinCollection,
        new_version: Option<u64>,
    ) -> DeltaOutcome {
        let version = new_version.or(delta.version());

        if let (Some(current), Some(received)) = (self.desired_version(), version) {
            if received <= current {
                warn_log!(
                    current,
                    received,
                    "Discarding stale desired property delta"
                );
                return DeltaOutcome::Stale { current, received };
            }
        }

        let mut changes = Vec::with_capacity(delta.len());
        for (key, value) in delta {
            changes.push(self.commit_desired(key, value, version));
        }
        if version.is_some() {
            self.state.properties.desired.set_version(version);
        }

        debug_log!(
            version = ?version,
            keys = changes.len(),
            "Applied desired property delta"
        );
        DeltaOutcome::Applied { changes }
    }

    /// Writes one desired key. Keys are independent, so the order in which
    /// a delta's keys are committed does not affect the result.
    fn commit_desired(&mut self, key: String, value: TwinValue, version: Option<u64>) -> Property {
        let desired = &mut self.state.properties.desired;
        if value.is_null() {
            desired.remove(&key);
        } else {
            desired.insert(key.clone(), value.clone());
            desired.set_metadata(
                &key,
                PropertyMetadata {
                    last_updated_version: version,
                },
            );
        }
        Property {
            key,
            value,
            version,
        }
    }

    /// Replaces the desired document with a full copy fetched from the
    /// service and returns the keys whose values differ from the cache.
    ///
    /// Keys missing from `desired` are reported as removed (`Null`).
    pub fn refresh_desired(&mut self, desired: TwinCollection) -> DeltaOutcome {
        let mut delta = TwinCollection::new();

        for (key, value) in desired.iter() {
            if self.desired().get(key) != Some(value) {
                delta.insert(key.clone(), value.clone());
            }
        }
        for key in self.desired().keys() {
            if !desired.contains_key(key) {
                delta.insert(key.clone(), TwinValue::Null);
            }
        }

        self.apply_inbound_delta(delta, desired.version())
    }

    /// Installs a full twin fetched from the service.
    ///
    /// Local reported edits that have not been acknowledged yet are kept on
    /// top of the fetched reported section.
    pub fn replace(&mut self, mut twin: TwinState) {
        for key in self.dirty.keys() {
            match self.state.properties.reported.get(key) {
                Some(value) => {
                    twin.properties.reported.insert(key.clone(), value.clone());
                }
                None => {
                    twin.properties.reported.remove(key);
                }
            }
        }
        self.state = twin;
    }

    /// Records a local reported-property edit.
    ///
    /// # Errors
    /// Returns `InvalidArgument` if the key is not a valid property name.
    pub fn set_reported(&mut self, key: &str, value: impl Into<TwinValue>) -> Result<()> {
        validate_property_key(key)?;
        let value = value.into();
        if value.is_null() {
            self.state.properties.reported.remove(key);
        } else {
            self.state.properties.reported.insert(key, value);
        }
        self.mark_dirty(key);
        Ok(())
    }

    /// Records removal of a reported property; the next patch carries a
    /// `Null` tombstone for it.
    ///
    /// # Errors
    /// Returns `InvalidArgument` if the key is not a valid property name.
    pub fn remove_reported(&mut self, key: &str) -> Result<()> {
        self.set_reported(key, TwinValue::Null)
    }

    fn mark_dirty(&mut self, key: &str) {
        self.next_revision += 1;
        self.dirty.insert(key.to_string(), self.next_revision);
    }

    pub fn dirty_keys(&self) -> impl Iterator<Item = &String> {
        self.dirty.keys()
    }

    /// Builds a patch containing every reported key changed since its last
    /// acknowledged send.
    #[must_use]
    pub fn build_reported_patch(&self) -> ReportedPatch {
        self.build_patch(self.dirty.iter())
    }

    /// Builds a patch limited to `keys`; keys without unacknowledged edits
    /// are skipped.
    #[must_use]
    pub fn build_reported_patch_for<S: AsRef<str>>(&self, keys: &[S]) -> ReportedPatch {
        self.build_patch(
            keys.iter()
                .filter_map(|k| self.dirty.get_key_value(k.as_ref())),
        )
    }

    fn build_patch<'a>(&self, entries: impl Iterator<Item = (&'a String, &'a u64)>) -> ReportedPatch {
        let mut patch = ReportedPatch::default();
        for (key, revision) in entries {
            let value = self
                .reported()
                .get(key)
                .cloned()
                .unwrap_or(TwinValue::Null);
            patch.collection.insert(key.clone(), value);
            patch.revisions.insert(key.clone(), *revision);
        }
        patch
    }

    /// Advances the acknowledged baseline for exactly the keys in `patch`.
    ///
    /// A key edited again after the patch was built stays dirty.
    pub fn acknowledge_patch(&mut self, patch: &ReportedPatch, version: Option<u64>) {
        for (key, revision) in &patch.revisions {
            if self.dirty.get(key) == Some(revision) {
                self.dirty.remove(key);
            }
        }
        if let Some(version) = version {
            let reported = &mut self.state.properties.reported;
            if reported.version().map_or(true, |current| version > current) {
                reported.set_version(Some(version));
            }
        }
    }

    pub fn clear(&mut self) {
        let device_id = std::mem::take(&mut self.state.device_id);
        let module_id = self.state.module_id.take();
        self.state = TwinState::new(device_id, module_id);
        self.dirty.clear();
    }
}
