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

//! Error conditions.

use ruma::OwnedEventId;
use thiserror::Error;

use crate::{EventNid, EventStateKeyNid, store::StoreError};

/// Result type of the membership reconciliation.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors that abort a membership reconciliation.
///
/// Every one of them means the room state update failed as a whole and the
/// surrounding transaction has to be rolled back.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum Error {
    /// Loading events or updating a membership failed in the store.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A membership event doesn't carry a well-formed `membership` value.
    #[error("The membership of event {event_id} couldn't be parsed: {source}")]
    MembershipParse {
        /// The event with the broken content.
        event_id: OwnedEventId,
        /// Why the content couldn't be parsed.
        #[source]
        source: serde_json::Error,
    },

    /// A membership transition needs a new event, but the state delta didn't
    /// reference one we could load.
    ///
    /// This points at a corrupt delta produced by state resolution.
    #[error(
        "The membership transition of state key {target} requires an event but none was found \
        (added event: {added_event_nid:?})"
    )]
    InvariantViolation {
        /// The user whose membership was changing.
        target: EventStateKeyNid,
        /// The event the delta claimed was added, if any.
        added_event_nid: Option<EventNid>,
    },

    /// A membership event has a value that isn't one of invite, join, leave
    /// or ban.
    ///
    /// This should never happen, state resolution only lets those through.
    #[error("Membership `{membership}` of event {event_id} is not one of the allowed values")]
    InvalidMembershipValue {
        /// The offending event.
        event_id: OwnedEventId,
        /// The membership it declares.
        membership: String,
    },

    /// A membership event has a state key that isn't a user ID.
    #[error("The state key of membership event {event_id} is not a valid user ID")]
    InvalidTarget {
        /// The offending event.
        event_id: OwnedEventId,
    },
}

impl Error {
    /// Whether this error is the sign of a protocol level bug rather than a
    /// runtime failure.
    ///
    /// Callers usually want to alert on those instead of retrying.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::InvalidMembershipValue { .. })
    }
}
