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

//! Events the roomserver publishes to tell its consumers about invites.
//!
//! Consumers could work out the same thing by following every state change
//! in the room event stream. These events exist so that a consumer only has
//! to follow a single stream to know whether a user is currently invited.

use ruma::{OwnedEventId, OwnedUserId, RoomVersionId, events::room::member::MembershipState};
use serde::{Deserialize, Serialize};

use crate::HeaderedEvent;

/// An event written to the output log after a room state update.
///
/// Serialized as a single-key object naming the kind of event, e.g.
/// `{"retire_invite_event": {...}}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputEvent {
    /// A user was invited to a room.
    NewInviteEvent(OutputNewInviteEvent),
    /// An invite is no longer current.
    RetireInviteEvent(OutputRetireInviteEvent),
}

impl OutputEvent {
    /// The new invite, if this is a [`OutputEvent::NewInviteEvent`].
    pub fn as_new_invite(&self) -> Option<&OutputNewInviteEvent> {
        match self {
            OutputEvent::NewInviteEvent(event) => Some(event),
            OutputEvent::RetireInviteEvent(_) => None,
        }
    }

    /// The retired invite, if this is a [`OutputEvent::RetireInviteEvent`].
    pub fn as_retire_invite(&self) -> Option<&OutputRetireInviteEvent> {
        match self {
            OutputEvent::NewInviteEvent(_) => None,
            OutputEvent::RetireInviteEvent(event) => Some(event),
        }
    }
}

/// A new invite, published even though the invite also shows up in the room
/// event stream.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutputNewInviteEvent {
    /// The `m.room.member` invite event.
    pub event: HeaderedEvent,
    /// The version of the room the user was invited to.
    pub room_version: RoomVersionId,
}

/// An invite that was retired because the user joined, left or was banned.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRetireInviteEvent {
    /// The ID of the invite event that was retired.
    pub event_id: OwnedEventId,
    /// The membership that replaced the invite: join, leave or ban.
    pub membership: MembershipState,
    /// The ID of the event that retired the invite.
    pub retired_by_event_id: OwnedEventId,
    /// The user that was invited.
    pub target_user_id: OwnedUserId,
}
