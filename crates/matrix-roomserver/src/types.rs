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

//! Numeric identifiers the roomserver keys its tables on.
//!
//! Rooms, events, event types and state keys are all interned into numbers
//! when they are first seen, the reconciliation code only ever deals with
//! those numbers and looks the full events up when it needs their content.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize,
            Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value)
            }
        }
    };
}

numeric_id! {
    /// The numeric id of a room.
    RoomNid
}

numeric_id! {
    /// The numeric id of an event.
    EventNid
}

numeric_id! {
    /// The numeric id of an event type.
    EventTypeNid
}

numeric_id! {
    /// The numeric id of a state key.
    ///
    /// For membership events the state key is the user whose membership is
    /// described, so this doubles as the id of the target user.
    EventStateKeyNid
}

impl EventTypeNid {
    /// `m.room.create`
    pub const ROOM_CREATE: Self = Self(1);
    /// `m.room.power_levels`
    pub const ROOM_POWER_LEVELS: Self = Self(2);
    /// `m.room.join_rules`
    pub const ROOM_JOIN_RULES: Self = Self(3);
    /// `m.room.third_party_invite`
    pub const ROOM_THIRD_PARTY_INVITE: Self = Self(4);
    /// `m.room.member`
    pub const ROOM_MEMBER: Self = Self(5);
    /// `m.room.redaction`
    pub const ROOM_REDACTION: Self = Self(6);
    /// `m.room.history_visibility`
    pub const ROOM_HISTORY_VISIBILITY: Self = Self(7);
}

/// The `(event type, state key)` pair that a piece of room state is keyed on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StateKeyTuple {
    /// The type of the state event.
    pub event_type_nid: EventTypeNid,
    /// The state key of the state event.
    pub event_state_key_nid: EventStateKeyNid,
}

impl StateKeyTuple {
    /// Create a new tuple from its two halves.
    pub fn new(event_type_nid: EventTypeNid, event_state_key_nid: EventStateKeyNid) -> Self {
        Self { event_type_nid, event_state_key_nid }
    }

    /// Is this the slot of an `m.room.member` event?
    pub fn is_membership(&self) -> bool {
        self.event_type_nid == EventTypeNid::ROOM_MEMBER
    }
}

/// An event that holds, or held, the state for a [`StateKeyTuple`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StateEntry {
    /// The slot this entry fills.
    #[serde(flatten)]
    pub state_key_tuple: StateKeyTuple,
    /// The event filling the slot.
    pub event_nid: EventNid,
}

impl StateEntry {
    /// Create a new state entry.
    pub fn new(
        event_type_nid: EventTypeNid,
        event_state_key_nid: EventStateKeyNid,
        event_nid: EventNid,
    ) -> Self {
        Self { state_key_tuple: StateKeyTuple::new(event_type_nid, event_state_key_nid), event_nid }
    }

    /// Shorthand for an `m.room.member` entry targeting the given state key.
    pub fn membership(target: EventStateKeyNid, event_nid: EventNid) -> Self {
        Self::new(EventTypeNid::ROOM_MEMBER, target, event_nid)
    }
}
