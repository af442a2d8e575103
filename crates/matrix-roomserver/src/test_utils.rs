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

//! Helpers to build events in tests.

use ruma::{
    events::{AnyStateEvent, room::member::MembershipState},
    serde::Raw,
};
use serde_json::{Value as JsonValue, json};

use crate::{Event, EventNid};

/// The room every test event claims to belong to.
pub const TEST_ROOM_ID: &str = "!test:localhost";

/// Create a `Raw<AnyStateEvent>` from arbitrary JSON.
pub fn raw_state_event(value: JsonValue) -> Raw<AnyStateEvent> {
    Raw::new(&value).expect("JSON values always serialize").cast()
}

/// Create an `m.room.member` event.
///
/// `target` is the state key, the user whose membership changes.
pub fn member_event(
    event_nid: u64,
    event_id: &str,
    sender: &str,
    target: &str,
    membership: MembershipState,
) -> Event {
    let raw = raw_state_event(json!({
        "type": "m.room.member",
        "room_id": TEST_ROOM_ID,
        "event_id": event_id,
        "sender": sender,
        "state_key": target,
        "origin_server_ts": 1_700_000_000_000u64 + event_nid,
        "content": { "membership": membership.as_str() },
    }));

    Event::new(EventNid(event_nid), raw).expect("test member events are well-formed")
}

/// Create an `m.room.member` event sent by the target itself, like a join or
/// a leave usually is.
pub fn own_member_event(
    event_nid: u64,
    event_id: &str,
    user: &str,
    membership: MembershipState,
) -> Event {
    member_event(event_nid, event_id, user, user, membership)
}
