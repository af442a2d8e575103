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

#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs, missing_debug_implementations)]

mod error;
mod event;
mod membership;
pub mod output;
pub mod room_updater;
pub mod state_changes;
pub mod store;
#[cfg(any(test, feature = "testing"))]
pub mod test_utils;
mod types;

pub use error::{Error, Result};
pub use event::{Event, HeaderedEvent};
pub use membership::update_memberships;
pub use output::{OutputEvent, OutputNewInviteEvent, OutputRetireInviteEvent};
pub use room_updater::{MembershipUpdate, MembershipUpdater, RoomTransaction, RoomUpdater};
pub use store::{
    CurrentMembership, DynMembershipStore, IntoMembershipStore, InviteRecord, MemoryStore,
    MembershipChanges, MembershipRow, MembershipStore, Store, StoreConfig, StoreError,
};
pub use types::{EventNid, EventStateKeyNid, EventTypeNid, RoomNid, StateEntry, StateKeyTuple};

#[cfg(test)]
#[ctor::ctor]
fn init_logging() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .init();
}
