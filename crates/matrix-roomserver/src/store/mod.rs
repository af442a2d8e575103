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

//! The membership store holds the events of the rooms and the current
//! membership of every user in them, along with the invites they received.
//!
//! Implementing the [`MembershipStore`] trait, you can plug any storage
//! backend into the roomserver. By default an in-memory store is used.
//!
//! The [`Store`] wraps the backend and hands out [`RoomTransaction`]s, which
//! serialize the membership updates of a room and write them back atomically.

use std::{
    collections::BTreeMap,
    fmt,
    ops::Deref,
    sync::{Arc, Mutex as StdMutex},
};

use async_trait::async_trait;
use ruma::{EventId, OwnedEventId, OwnedUserId, RoomVersionId};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::trace;

mod memory_store;

pub use self::memory_store::MemoryStore;
use crate::{Event, EventNid, EventStateKeyNid, RoomNid, RoomTransaction};

/// Membership store specific error type.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// An error happened in the underlying database backend.
    #[error(transparent)]
    Backend(Box<dyn std::error::Error + Send + Sync>),
    /// An error happened while serializing or deserializing some data.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// An error happened while deserializing a Matrix identifier, e.g. an user
    /// id.
    #[error(transparent)]
    Identifier(#[from] ruma::IdParseError),
    /// The store failed to encode or decode some data.
    #[error("Error encoding or decoding data from the store: {0}")]
    Codec(String),
    /// A membership row was changed by someone else since it was read, the
    /// batch was not saved.
    #[error("The membership of {target} in room {room_nid} was changed concurrently")]
    Conflict {
        /// The room of the membership row.
        room_nid: RoomNid,
        /// The user of the membership row.
        target: EventStateKeyNid,
    },
}

impl StoreError {
    /// Create a new [`Backend`][Self::Backend] error.
    ///
    /// Shorthand for `StoreError::Backend(Box::new(error))`.
    #[inline]
    pub fn backend<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Backend(Box::new(error))
    }
}

/// A `MembershipStore` specific result type.
pub type Result<T, E = StoreError> = std::result::Result<T, E>;

/// The membership a user currently has in a room, as far as the store is
/// concerned.
///
/// Leaves and bans are not told apart, both mean the user is neither joined
/// nor invited.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CurrentMembership {
    /// The user left or was banned, or never was in the room.
    #[default]
    LeaveOrBan,
    /// The user has an invite to the room.
    Invite,
    /// The user is joined to the room.
    Join,
}

impl CurrentMembership {
    /// The number this membership is stored as.
    pub fn as_u8(self) -> u8 {
        match self {
            CurrentMembership::LeaveOrBan => 1,
            CurrentMembership::Invite => 2,
            CurrentMembership::Join => 3,
        }
    }

    /// The membership stored as the given number, if any.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(CurrentMembership::LeaveOrBan),
            2 => Some(CurrentMembership::Invite),
            3 => Some(CurrentMembership::Join),
            _ => None,
        }
    }
}

/// An invite a user received to a room.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InviteRecord {
    /// The ID of the invite event.
    pub event_id: OwnedEventId,
    /// The user that sent the invite.
    pub sender: OwnedUserId,
    /// Whether the invite was superseded by a join, leave or ban.
    pub retired: bool,
}

/// The stored membership of a single user in a single room.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipRow {
    /// The current membership.
    pub membership: CurrentMembership,
    /// The event that set the current membership.
    pub event_id: Option<OwnedEventId>,
    /// The sender of that event.
    pub sender: Option<OwnedUserId>,
    /// Every invite the user ever received to the room, retired or not.
    pub invites: Vec<InviteRecord>,
}

impl MembershipRow {
    /// The IDs of the invites that are still outstanding.
    pub fn outstanding_invites(&self) -> impl Iterator<Item = &EventId> {
        self.invites.iter().filter(|invite| !invite.retired).map(|invite| &*invite.event_id)
    }

    /// Whether an invite with the given ID was ever recorded.
    pub fn has_invite(&self, event_id: &EventId) -> bool {
        self.invites.iter().any(|invite| invite.event_id.as_str() == event_id.as_str())
    }
}

/// A batch of writes that a [`MembershipStore`] applies atomically.
#[derive(Clone, Debug, Default)]
pub struct MembershipChanges {
    /// Events to store, by their numeric id.
    pub events: BTreeMap<EventNid, Event>,
    /// Membership rows to store, replacing any existing row.
    pub members: BTreeMap<(RoomNid, EventStateKeyNid), MembershipRow>,
    /// The rows the stored membership rows must still be equal to, `None`
    /// meaning there must be no row at all.
    ///
    /// If any of them differs, saving fails with
    /// [`StoreError::Conflict`] and nothing is written.
    pub expected_members: BTreeMap<(RoomNid, EventStateKeyNid), Option<MembershipRow>>,
}

impl MembershipChanges {
    /// Create a new empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an event to the batch.
    pub fn add_event(&mut self, event: Event) {
        self.events.insert(event.event_nid(), event);
    }

    /// Add a membership row to the batch.
    pub fn add_membership(
        &mut self,
        room_nid: RoomNid,
        target: EventStateKeyNid,
        row: MembershipRow,
    ) {
        self.members.insert((room_nid, target), row);
    }

    /// Only save the batch if the membership row of the given user is still
    /// `previous`.
    pub fn expect_membership(
        &mut self,
        room_nid: RoomNid,
        target: EventStateKeyNid,
        previous: Option<MembershipRow>,
    ) {
        self.expected_members.insert((room_nid, target), previous);
    }

    /// The first expected membership row that differs from the one `current`
    /// returns.
    ///
    /// Backends call this while they hold their write lock.
    pub fn find_conflict<E>(
        &self,
        mut current: impl FnMut(RoomNid, EventStateKeyNid) -> Result<Option<MembershipRow>, E>,
    ) -> Result<Option<(RoomNid, EventStateKeyNid)>, E> {
        for (&(room_nid, target), expected) in &self.expected_members {
            if current(room_nid, target)? != *expected {
                return Ok(Some((room_nid, target)));
            }
        }

        Ok(None)
    }

    /// Whether the batch holds nothing.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.members.is_empty()
    }
}

/// An abstract membership store trait that can be used to implement different
/// stores for the roomserver.
#[async_trait]
pub trait MembershipStore: fmt::Debug + Send + Sync {
    /// Load the events with the given numeric ids.
    ///
    /// Ids the store doesn't know about are left out of the result, they are
    /// not an error.
    ///
    /// # Arguments
    ///
    /// * `event_nids` - The ids of the events to load.
    async fn events(&self, event_nids: &[EventNid]) -> Result<BTreeMap<EventNid, Event>>;

    /// Get the committed membership of a user in a room.
    ///
    /// # Arguments
    ///
    /// * `room_nid` - The room the membership is for.
    ///
    /// * `target` - The state key, i.e. the user, the membership is for.
    async fn membership(
        &self,
        room_nid: RoomNid,
        target: EventStateKeyNid,
    ) -> Result<Option<MembershipRow>>;

    /// Save a batch of changes in the store, all or nothing.
    ///
    /// The check of [`MembershipChanges::expected_members`] and the writes
    /// must happen atomically, also against other processes using the same
    /// storage.
    async fn save_changes(&self, changes: &MembershipChanges) -> Result<()>;
}

/// A type-erased [`MembershipStore`].
pub type DynMembershipStore = dyn MembershipStore;

/// A type that can be type-erased into `Arc<DynMembershipStore>`.
///
/// This trait is not meant to be implemented directly outside
/// `matrix-roomserver`, but it is automatically implemented for everything
/// that implements `MembershipStore`.
pub trait IntoMembershipStore {
    #[doc(hidden)]
    fn into_membership_store(self) -> Arc<DynMembershipStore>;
}

impl<T> IntoMembershipStore for T
where
    T: MembershipStore + 'static,
{
    fn into_membership_store(self) -> Arc<DynMembershipStore> {
        Arc::new(self)
    }
}

impl IntoMembershipStore for Arc<DynMembershipStore> {
    fn into_membership_store(self) -> Arc<DynMembershipStore> {
        self
    }
}

/// A wrapper around a [`MembershipStore`] that hands out room transactions.
#[derive(Clone)]
pub struct Store {
    inner: Arc<DynMembershipStore>,
    room_locks: Arc<StdMutex<BTreeMap<RoomNid, Arc<Mutex<()>>>>>,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store").field("inner", &self.inner).finish_non_exhaustive()
    }
}

impl Store {
    /// Wrap the given backend.
    pub fn new(inner: Arc<DynMembershipStore>) -> Self {
        Self { inner, room_locks: Default::default() }
    }

    /// Start a membership update of the given room.
    ///
    /// Waits until no other transaction of the same room started by this
    /// `Store` is in flight, the returned transaction keeps the room locked
    /// until it is committed or dropped. Transactions of other `Store`s over
    /// the same backend are caught when committing, see
    /// [`StoreError::Conflict`].
    pub async fn begin_room_update(
        &self,
        room_nid: RoomNid,
        room_version: RoomVersionId,
    ) -> RoomTransaction {
        let lock = {
            let mut room_locks = self.room_locks.lock().unwrap();
            // Locks nobody holds or waits on can go, they are recreated on demand.
            room_locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            room_locks.entry(room_nid).or_default().clone()
        };

        let guard = lock.lock_owned().await;
        trace!(%room_nid, "Locked room for a membership update");

        RoomTransaction::new(self.inner.clone(), room_nid, room_version, guard)
    }
}

impl Deref for Store {
    type Target = DynMembershipStore;

    fn deref(&self) -> &Self::Target {
        self.inner.deref()
    }
}

/// Configuration for the membership store.
///
/// # Example
///
/// ```
/// # use matrix_roomserver::StoreConfig;
///
/// let store = StoreConfig::new().build();
/// ```
#[derive(Clone, Default)]
pub struct StoreConfig {
    pub(crate) membership_store: Option<Arc<DynMembershipStore>>,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for StoreConfig {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("StoreConfig").finish()
    }
}

impl StoreConfig {
    /// Create a new default `StoreConfig`.
    #[must_use]
    pub fn new() -> Self {
        Default::default()
    }

    /// Set a custom implementation of a `MembershipStore`.
    ///
    /// The store must be opened before being set.
    pub fn membership_store(mut self, store: impl IntoMembershipStore) -> Self {
        self.membership_store = Some(store.into_membership_store());
        self
    }

    /// Build the [`Store`], falling back to a [`MemoryStore`] if no store was
    /// set.
    pub fn build(self) -> Store {
        let inner =
            self.membership_store.unwrap_or_else(|| MemoryStore::new().into_membership_store());
        Store::new(inner)
    }
}
