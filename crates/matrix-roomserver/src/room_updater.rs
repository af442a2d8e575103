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

//! Transactional updates of the memberships of a room.
//!
//! A [`RoomUpdater`] is scoped to one room and one state update. It hands out
//! a [`MembershipUpdater`] per target user, whose operations each apply one
//! membership transition atomically and report what they did.

use std::{
    collections::{BTreeMap, btree_map::Entry},
    fmt,
    sync::Arc,
};

use async_trait::async_trait;
use ruma::{EventId, OwnedEventId, RoomVersionId, UserId};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, instrument, trace};

use crate::{
    Event, EventStateKeyNid, RoomNid,
    store::{
        CurrentMembership, DynMembershipStore, InviteRecord, MembershipChanges, MembershipRow,
        StoreError,
    },
};

/// What a single membership transition did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MembershipUpdate {
    /// Whether the transition changed anything.
    ///
    /// For an invite this is only true if the invite wasn't known before.
    pub applied: bool,
    /// The outstanding invites the transition retired.
    pub retired_invites: Vec<OwnedEventId>,
}

/// The membership of one user in one room, locked for the duration of a
/// room update.
#[async_trait]
pub trait MembershipUpdater: Send {
    /// Whether the user is currently joined.
    fn is_join(&self) -> bool;

    /// Whether the user currently left or is banned.
    fn is_leave(&self) -> bool;

    /// Mark the user as invited by the given invite event.
    ///
    /// Returns an applied update only if this invite wasn't recorded before.
    /// The same invite can reach us more than once, e.g. when an event is
    /// reprocessed or when a remote server already sent it to us through the
    /// federation invite API.
    async fn set_to_invite(&mut self, event: &Event) -> Result<MembershipUpdate, StoreError>;

    /// Mark the user as joined.
    ///
    /// If `is_update` is true the user is already joined and only the join
    /// event is replaced, no invite gets retired. Otherwise every outstanding
    /// invite is retired and returned.
    async fn set_to_join(
        &mut self,
        sender: &UserId,
        event_id: &EventId,
        is_update: bool,
    ) -> Result<MembershipUpdate, StoreError>;

    /// Mark the user as left or banned, retiring and returning every
    /// outstanding invite.
    async fn set_to_leave(
        &mut self,
        sender: &UserId,
        event_id: &EventId,
    ) -> Result<MembershipUpdate, StoreError>;
}

/// The update of a single room, handing out a [`MembershipUpdater`] per user.
#[async_trait]
pub trait RoomUpdater: Send {
    /// The version of the room being updated.
    fn room_version(&self) -> &RoomVersionId;

    /// Get the membership updater of the given target user.
    ///
    /// Opening the updater of the same user twice during one room update
    /// gives back the state left by the first one.
    async fn membership_updater<'a>(
        &'a mut self,
        target: EventStateKeyNid,
    ) -> Result<Box<dyn MembershipUpdater + 'a>, StoreError>;
}

#[derive(Debug)]
struct PendingMembership {
    /// The row as it was read from the store.
    committed: Option<MembershipRow>,
    row: MembershipRow,
    dirty: bool,
}

/// A [`RoomUpdater`] backed by a [`MembershipStore`][crate::MembershipStore].
///
/// Memberships are read from the store the first time they are needed and
/// changed in memory afterwards. Nothing is written until [`commit()`] is
/// called, dropping the transaction discards every change. The commit fails
/// with [`StoreError::Conflict`] if a changed row was modified in the store
/// since it was read.
///
/// The room stays locked as long as the transaction is alive, see
/// [`Store::begin_room_update()`][crate::Store::begin_room_update].
///
/// [`commit()`]: RoomTransaction::commit
pub struct RoomTransaction {
    store: Arc<DynMembershipStore>,
    room_nid: RoomNid,
    room_version: RoomVersionId,
    members: BTreeMap<EventStateKeyNid, PendingMembership>,
    room_lock: OwnedMutexGuard<()>,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for RoomTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoomTransaction")
            .field("room_nid", &self.room_nid)
            .field("room_version", &self.room_version)
            .field("members", &self.members)
            .finish_non_exhaustive()
    }
}

impl RoomTransaction {
    pub(crate) fn new(
        store: Arc<DynMembershipStore>,
        room_nid: RoomNid,
        room_version: RoomVersionId,
        room_lock: OwnedMutexGuard<()>,
    ) -> Self {
        Self { store, room_nid, room_version, members: BTreeMap::new(), room_lock }
    }

    /// The room this transaction updates.
    pub fn room_nid(&self) -> RoomNid {
        self.room_nid
    }

    /// Whether any membership was changed so far.
    pub fn has_changes(&self) -> bool {
        self.members.values().any(|pending| pending.dirty)
    }

    /// Write every changed membership to the store in one batch.
    #[instrument(skip(self), fields(room_nid = %self.room_nid))]
    pub async fn commit(self) -> Result<(), StoreError> {
        let Self { store, room_nid, members, room_lock, .. } = self;

        let mut changes = MembershipChanges::new();
        for (target, pending) in members {
            if pending.dirty {
                changes.expect_membership(room_nid, target, pending.committed);
                changes.add_membership(room_nid, target, pending.row);
            }
        }

        if !changes.is_empty() {
            debug!(members = changes.members.len(), "Committing membership changes");
            store.save_changes(&changes).await?;
        }

        drop(room_lock);
        Ok(())
    }
}

#[async_trait]
impl RoomUpdater for RoomTransaction {
    fn room_version(&self) -> &RoomVersionId {
        &self.room_version
    }

    async fn membership_updater<'a>(
        &'a mut self,
        target: EventStateKeyNid,
    ) -> Result<Box<dyn MembershipUpdater + 'a>, StoreError> {
        let pending = match self.members.entry(target) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let committed = self.store.membership(self.room_nid, target).await?;
                let row = committed.clone().unwrap_or_default();
                trace!(%target, membership = ?row.membership, "Loaded membership");
                entry.insert(PendingMembership { committed, row, dirty: false })
            }
        };

        Ok(Box::new(StoreMembershipUpdater { pending }))
    }
}

struct StoreMembershipUpdater<'a> {
    pending: &'a mut PendingMembership,
}

impl StoreMembershipUpdater<'_> {
    fn retire_invites(&mut self) -> Vec<OwnedEventId> {
        let mut retired = Vec::new();

        for invite in self.pending.row.invites.iter_mut().filter(|invite| !invite.retired) {
            invite.retired = true;
            retired.push(invite.event_id.clone());
        }

        if !retired.is_empty() {
            self.pending.dirty = true;
        }

        retired
    }

    fn set_membership(
        &mut self,
        membership: CurrentMembership,
        sender: &UserId,
        event_id: &EventId,
    ) {
        let row = &mut self.pending.row;
        row.membership = membership;
        row.sender = Some(sender.to_owned());
        row.event_id = Some(event_id.to_owned());
        self.pending.dirty = true;
    }
}

#[async_trait]
impl MembershipUpdater for StoreMembershipUpdater<'_> {
    fn is_join(&self) -> bool {
        self.pending.row.membership == CurrentMembership::Join
    }

    fn is_leave(&self) -> bool {
        self.pending.row.membership == CurrentMembership::LeaveOrBan
    }

    async fn set_to_invite(&mut self, event: &Event) -> Result<MembershipUpdate, StoreError> {
        let is_new = !self.pending.row.has_invite(event.event_id());

        if is_new {
            self.pending.row.invites.push(InviteRecord {
                event_id: event.event_id().to_owned(),
                sender: event.sender().to_owned(),
                retired: false,
            });
            self.pending.dirty = true;
        }

        if self.pending.row.membership != CurrentMembership::Invite {
            self.set_membership(CurrentMembership::Invite, event.sender(), event.event_id());
        }

        Ok(MembershipUpdate { applied: is_new, retired_invites: Vec::new() })
    }

    async fn set_to_join(
        &mut self,
        sender: &UserId,
        event_id: &EventId,
        is_update: bool,
    ) -> Result<MembershipUpdate, StoreError> {
        let retired_invites = if is_update { Vec::new() } else { self.retire_invites() };

        let applied = !self.is_join() || is_update;
        if applied {
            self.set_membership(CurrentMembership::Join, sender, event_id);
        }

        Ok(MembershipUpdate { applied, retired_invites })
    }

    async fn set_to_leave(
        &mut self,
        sender: &UserId,
        event_id: &EventId,
    ) -> Result<MembershipUpdate, StoreError> {
        let retired_invites = self.retire_invites();

        let applied = !self.is_leave();
        if applied {
            self.set_membership(CurrentMembership::LeaveOrBan, sender, event_id);
        }

        Ok(MembershipUpdate { applied, retired_invites })
    }
}
