// Copyright 2026 The Matrix.org Foundation C.I.C.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{collections::BTreeMap, sync::RwLock as StdRwLock};

use async_trait::async_trait;
use tracing::{debug, instrument};

use super::{MembershipChanges, MembershipRow, MembershipStore, Result, StoreError};
use crate::{Event, EventNid, EventStateKeyNid, RoomNid};

#[derive(Debug, Default)]
struct MemoryStoreInner {
    events: BTreeMap<EventNid, Event>,
    members: BTreeMap<(RoomNid, EventStateKeyNid), MembershipRow>,
}

/// In-Memory, non-persistent implementation of the `MembershipStore`.
///
/// Default if no other is configured at startup.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: StdRwLock<MemoryStoreInner>,
}

impl MemoryStore {
    /// Create a new empty MemoryStore
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MembershipStore for MemoryStore {
    async fn events(&self, event_nids: &[EventNid]) -> Result<BTreeMap<EventNid, Event>> {
        let inner = self.inner.read().unwrap();

        Ok(event_nids
            .iter()
            .filter_map(|nid| inner.events.get(nid).map(|event| (*nid, event.clone())))
            .collect())
    }

    async fn membership(
        &self,
        room_nid: RoomNid,
        target: EventStateKeyNid,
    ) -> Result<Option<MembershipRow>> {
        Ok(self.inner.read().unwrap().members.get(&(room_nid, target)).cloned())
    }

    #[instrument(skip_all)]
    async fn save_changes(&self, changes: &MembershipChanges) -> Result<()> {
        let mut inner = self.inner.write().unwrap();

        let conflict = changes.find_conflict(|room_nid, target| {
            Ok::<_, StoreError>(inner.members.get(&(room_nid, target)).cloned())
        })?;
        if let Some((room_nid, target)) = conflict {
            return Err(StoreError::Conflict { room_nid, target });
        }

        for (nid, event) in &changes.events {
            inner.events.insert(*nid, event.clone());
        }

        for (key, row) in &changes.members {
            inner.members.insert(*key, row.clone());
        }

        debug!(
            events = changes.events.len(),
            members = changes.members.len(),
            "Saved membership changes"
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{MemoryStore, Result, StoreError};
    use crate::store::MembershipStore;

    async fn get_store() -> Result<impl MembershipStore, StoreError> {
        Ok(MemoryStore::new())
    }

    membership_store_integration_tests!();
}
