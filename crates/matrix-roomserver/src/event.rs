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

use ruma::{
    EventId, OwnedEventId, OwnedUserId, RoomVersionId, UserId,
    events::{AnyStateEvent, room::member::MembershipState},
    serde::Raw,
};
use serde::{Deserialize, Serialize, de::Error as _};

use crate::{Error, EventNid};

/// A state event as stored by the roomserver.
///
/// The raw JSON is kept around untouched, only the header fields needed to
/// reconcile memberships are parsed eagerly.
#[derive(Clone, Debug)]
pub struct Event {
    event_nid: EventNid,
    event_id: OwnedEventId,
    sender: OwnedUserId,
    state_key: Option<String>,
    raw: Raw<AnyStateEvent>,
}

#[derive(Deserialize)]
struct MembershipContent {
    membership: MembershipState,
}

impl Event {
    /// Wrap the raw JSON of an event that was assigned the given numeric id.
    ///
    /// Fails if the `event_id` or `sender` fields are missing, or if any of
    /// the header fields is malformed.
    pub fn new(event_nid: EventNid, raw: Raw<AnyStateEvent>) -> Result<Self, serde_json::Error> {
        let event_id = raw
            .get_field::<OwnedEventId>("event_id")?
            .ok_or_else(|| serde_json::Error::missing_field("event_id"))?;
        let sender = raw
            .get_field::<OwnedUserId>("sender")?
            .ok_or_else(|| serde_json::Error::missing_field("sender"))?;
        let state_key = raw.get_field::<String>("state_key")?;

        Ok(Self { event_nid, event_id, sender, state_key, raw })
    }

    /// The numeric id of the event.
    pub fn event_nid(&self) -> EventNid {
        self.event_nid
    }

    /// The ID of the event.
    pub fn event_id(&self) -> &EventId {
        &self.event_id
    }

    /// The user that sent the event.
    pub fn sender(&self) -> &UserId {
        &self.sender
    }

    /// The state key of the event, `None` if this isn't a state event.
    pub fn state_key(&self) -> Option<&str> {
        self.state_key.as_deref()
    }

    /// The raw JSON of the event.
    pub fn raw(&self) -> &Raw<AnyStateEvent> {
        &self.raw
    }

    /// The `membership` declared in the content of this event.
    pub fn membership(&self) -> Result<MembershipState, Error> {
        let content = self
            .raw
            .get_field::<MembershipContent>("content")
            .and_then(|content| content.ok_or_else(|| serde_json::Error::missing_field("content")))
            .map_err(|source| Error::MembershipParse { event_id: self.event_id.clone(), source })?;

        Ok(content.membership)
    }

    /// The user a membership event applies to, taken from its state key.
    pub fn target_user_id(&self) -> Result<OwnedUserId, Error> {
        self.state_key
            .as_deref()
            .and_then(|state_key| UserId::parse(state_key).ok())
            .ok_or_else(|| Error::InvalidTarget { event_id: self.event_id.clone() })
    }

    /// Attach the version of the room this event belongs to.
    pub fn headered(&self, room_version: RoomVersionId) -> HeaderedEvent {
        HeaderedEvent { room_version, event_id: self.event_id.clone(), event: self.raw.clone() }
    }
}

/// An event together with the version of the room it was sent in.
///
/// Consumers need the room version to know how to interpret the event, e.g.
/// which redaction algorithm applies to it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HeaderedEvent {
    /// The version of the room the event belongs to.
    pub room_version: RoomVersionId,
    /// The ID of the event.
    pub event_id: OwnedEventId,
    /// The event itself.
    pub event: Raw<AnyStateEvent>,
}

#[cfg(test)]
mod tests {
    use assert_matches2::{assert_let, assert_matches};
    use ruma::{RoomVersionId, event_id, events::room::member::MembershipState, user_id};
    use serde_json::json;

    use super::Event;
    use crate::{Error, EventNid, test_utils::raw_state_event};

    #[test]
    fn test_header_fields() {
        let event = Event::new(
            EventNid(1),
            raw_state_event(json!({
                "type": "m.room.member",
                "event_id": "$join:localhost",
                "sender": "@alice:localhost",
                "state_key": "@alice:localhost",
                "content": { "membership": "join" },
            })),
        )
        .unwrap();

        assert_eq!(event.event_nid(), EventNid(1));
        assert_eq!(event.event_id(), event_id!("$join:localhost"));
        assert_eq!(event.sender(), user_id!("@alice:localhost"));
        assert_eq!(event.state_key(), Some("@alice:localhost"));
        assert_eq!(event.membership().unwrap(), MembershipState::Join);
        assert_eq!(event.target_user_id().unwrap().as_str(), "@alice:localhost");
    }

    #[test]
    fn test_missing_header_fields() {
        let missing_event_id = raw_state_event(json!({
            "type": "m.room.member",
            "sender": "@alice:localhost",
            "state_key": "@alice:localhost",
            "content": { "membership": "join" },
        }));
        assert!(Event::new(EventNid(1), missing_event_id).is_err());

        let missing_sender = raw_state_event(json!({
            "type": "m.room.member",
            "event_id": "$join:localhost",
            "state_key": "@alice:localhost",
            "content": { "membership": "join" },
        }));
        assert!(Event::new(EventNid(1), missing_sender).is_err());
    }

    #[test]
    fn test_malformed_membership() {
        let no_content = Event::new(
            EventNid(1),
            raw_state_event(json!({
                "type": "m.room.member",
                "event_id": "$a:localhost",
                "sender": "@alice:localhost",
                "state_key": "@alice:localhost",
            })),
        )
        .unwrap();
        assert_let!(Err(Error::MembershipParse { event_id, .. }) = no_content.membership());
        assert_eq!(event_id.as_str(), "$a:localhost");

        let no_membership = Event::new(
            EventNid(2),
            raw_state_event(json!({
                "type": "m.room.member",
                "event_id": "$b:localhost",
                "sender": "@alice:localhost",
                "state_key": "@alice:localhost",
                "content": { "displayname": "Alice" },
            })),
        )
        .unwrap();
        assert_matches!(no_membership.membership(), Err(Error::MembershipParse { .. }));

        let not_a_string = Event::new(
            EventNid(3),
            raw_state_event(json!({
                "type": "m.room.member",
                "event_id": "$c:localhost",
                "sender": "@alice:localhost",
                "state_key": "@alice:localhost",
                "content": { "membership": 12 },
            })),
        )
        .unwrap();
        assert_matches!(not_a_string.membership(), Err(Error::MembershipParse { .. }));
    }

    #[test]
    fn test_unknown_membership_still_parses() {
        let event = Event::new(
            EventNid(1),
            raw_state_event(json!({
                "type": "m.room.member",
                "event_id": "$a:localhost",
                "sender": "@alice:localhost",
                "state_key": "@alice:localhost",
                "content": { "membership": "knock" },
            })),
        )
        .unwrap();

        assert_eq!(event.membership().unwrap(), MembershipState::Knock);
    }

    #[test]
    fn test_invalid_target() {
        let event = Event::new(
            EventNid(1),
            raw_state_event(json!({
                "type": "m.room.member",
                "event_id": "$a:localhost",
                "sender": "@alice:localhost",
                "state_key": "not a user",
                "content": { "membership": "join" },
            })),
        )
        .unwrap();

        assert_matches!(event.target_user_id(), Err(Error::InvalidTarget { .. }));
    }

    #[test]
    fn test_headered() {
        let event = Event::new(
            EventNid(1),
            raw_state_event(json!({
                "type": "m.room.member",
                "event_id": "$a:localhost",
                "sender": "@alice:localhost",
                "state_key": "@bob:localhost",
                "content": { "membership": "invite" },
            })),
        )
        .unwrap();

        let headered = event.headered(RoomVersionId::V10);
        assert_eq!(headered.room_version, RoomVersionId::V10);
        assert_eq!(headered.event_id.as_str(), "$a:localhost");
        assert_eq!(headered.event.json().get(), event.raw().json().get());
    }
}
