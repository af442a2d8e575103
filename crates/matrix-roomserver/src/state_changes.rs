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

//! Pairing of the state entries a room drops and gains into per-slot
//! before/after changes.

use std::collections::{BTreeMap, btree_map::Entry};

use crate::{EventNid, StateEntry, StateKeyTuple};

/// The before and after of a single state slot.
///
/// At least one of the two sides is always set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StateChange {
    /// The slot that changed.
    pub state_key_tuple: StateKeyTuple,
    /// The event that held the slot before the change.
    pub removed_event_nid: Option<EventNid>,
    /// The event that holds the slot after the change.
    pub added_event_nid: Option<EventNid>,
}

impl StateChange {
    /// The events this change references, the removed one first.
    pub fn event_nids(&self) -> impl Iterator<Item = EventNid> {
        self.removed_event_nid.into_iter().chain(self.added_event_nid)
    }
}

/// Pair up the removed and added state entries by their
/// [`StateKeyTuple`].
///
/// Every tuple seen on either side shows up exactly once in the result. The
/// order of the result carries no meaning.
///
/// State resolution never puts the same tuple twice on one side. If it did,
/// the last entry of that side would win.
pub fn pair_up_changes(removed: &[StateEntry], added: &[StateEntry]) -> Vec<StateChange> {
    let mut tuples: BTreeMap<StateKeyTuple, StateChange> = BTreeMap::new();

    for add in added {
        match tuples.entry(add.state_key_tuple) {
            Entry::Occupied(mut change) => change.get_mut().added_event_nid = Some(add.event_nid),
            Entry::Vacant(slot) => {
                slot.insert(StateChange {
                    state_key_tuple: add.state_key_tuple,
                    removed_event_nid: None,
                    added_event_nid: Some(add.event_nid),
                });
            }
        }
    }

    for remove in removed {
        match tuples.entry(remove.state_key_tuple) {
            Entry::Occupied(mut change) => {
                change.get_mut().removed_event_nid = Some(remove.event_nid);
            }
            Entry::Vacant(slot) => {
                slot.insert(StateChange {
                    state_key_tuple: remove.state_key_tuple,
                    removed_event_nid: Some(remove.event_nid),
                    added_event_nid: None,
                });
            }
        }
    }

    tuples.into_values().collect()
}

/// Pair up the state changes, keeping only the `m.room.member` ones.
pub fn membership_changes(removed: &[StateEntry], added: &[StateEntry]) -> Vec<StateChange> {
    pair_up_changes(removed, added)
        .into_iter()
        .filter(|change| change.state_key_tuple.is_membership())
        .collect()
}
