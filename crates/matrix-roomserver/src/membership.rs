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

use std::collections::BTreeSet;

use ruma::{OwnedEventId, RoomVersionId, events::room::member::MembershipState};
use tracing::{debug, instrument, warn};

use crate::{
    Error, Event, EventNid, MembershipStore, MembershipUpdater, OutputEvent, OutputNewInviteEvent,
    OutputRetireInviteEvent, Result, RoomUpdater, StateEntry,
    state_changes::{StateChange, membership_changes},
};

/// Update the current membership and the invites of every user affected by a
/// change in the current state of a room.
///
/// `removed` and `added` are the state entries the room loses and gains.
/// Every membership transition is applied through the given `updater`, which
/// is expected to be scoped to the room and to the transaction that stores
/// the new state.
///
/// Returns the output events telling consumers about the invites that were
/// added or retired by the change. They should only be published once the
/// transaction was committed. On error nothing is returned and the
/// transaction has to be rolled back.
#[instrument(skip_all, fields(removed = removed.len(), added = added.len()))]
pub async fn update_memberships<S, U>(
    store: &S,
    updater: &mut U,
    removed: &[StateEntry],
    added: &[StateEntry],
) -> Result<Vec<OutputEvent>>
where
    S: MembershipStore + ?Sized,
    U: RoomUpdater + ?Sized,
{
    let changes = membership_changes(removed, added);
    if changes.is_empty() {
        return Ok(Vec::new());
    }

    let event_nids: BTreeSet<EventNid> = changes.iter().flat_map(StateChange::event_nids).collect();
    let event_nids: Vec<EventNid> = event_nids.into_iter().collect();

    // TODO: Store the membership in its own column so we don't have to load
    // the whole event JSON just to look at it.
    let events = store.events(&event_nids).await?;

    let mut updates = Vec::new();

    for change in &changes {
        let remove = change.removed_event_nid.and_then(|nid| events.get(&nid));
        let add = change.added_event_nid.and_then(|nid| events.get(&nid));

        update_membership(updater, change, remove, add, &mut updates).await?;
    }

    debug!(changes = changes.len(), updates = updates.len(), "Updated memberships");

    Ok(updates)
}

/// The membership a side of a change stands for.
///
/// A side without an event means the user isn't in the room.
fn membership_of(event: Option<&Event>) -> Result<MembershipState> {
    match event {
        Some(event) => event.membership(),
        None => Ok(MembershipState::Leave),
    }
}

async fn update_membership<U>(
    updater: &mut U,
    change: &StateChange,
    remove: Option<&Event>,
    add: Option<&Event>,
    updates: &mut Vec<OutputEvent>,
) -> Result<()>
where
    U: RoomUpdater + ?Sized,
{
    let target = change.state_key_tuple.event_state_key_nid;

    let old_membership = membership_of(remove)?;
    let new_membership = membership_of(add)?;

    // A join replacing a join still has to update the join event, e.g. for
    // profile changes.
    if old_membership == new_membership && new_membership != MembershipState::Join {
        debug!(%target, membership = new_membership.as_str(), "Membership didn't change");
        return Ok(());
    }

    let Some(add) = add else {
        warn!(
            %target,
            removed_event_nid = ?change.removed_event_nid,
            added_event_nid = ?change.added_event_nid,
            "Membership transition without an event to transition to"
        );
        return Err(Error::InvariantViolation { target, added_event_nid: change.added_event_nid });
    };

    let room_version = updater.room_version().clone();
    let mut mu = updater.membership_updater(target).await?;

    match new_membership {
        MembershipState::Invite => {
            update_to_invite_membership(&mut *mu, add, room_version, updates).await
        }
        MembershipState::Join => update_to_join_membership(&mut *mu, add, updates).await,
        MembershipState::Leave | MembershipState::Ban => {
            update_to_leave_membership(&mut *mu, add, new_membership, updates).await
        }
        other => Err(Error::InvalidMembershipValue {
            event_id: add.event_id().to_owned(),
            membership: other.as_str().to_owned(),
        }),
    }
}

async fn update_to_invite_membership<M>(
    mu: &mut M,
    add: &Event,
    room_version: RoomVersionId,
    updates: &mut Vec<OutputEvent>,
) -> Result<()>
where
    M: MembershipUpdater + ?Sized,
{
    // Consumers learn about the invite through the room event stream too, but
    // this way they only have to follow a single stream to know who is
    // invited.
    if mu.set_to_invite(add).await?.applied {
        debug!(event_id = %add.event_id(), "New invite");
        updates.push(OutputEvent::NewInviteEvent(OutputNewInviteEvent {
            event: add.headered(room_version.clone()),
            room_version,
        }));
    }

    Ok(())
}

async fn update_to_join_membership<M>(
    mu: &mut M,
    add: &Event,
    updates: &mut Vec<OutputEvent>,
) -> Result<()>
where
    M: MembershipUpdater + ?Sized,
{
    // Already joined, there can't be an invite to retire.
    if mu.is_join() {
        mu.set_to_join(add.sender(), add.event_id(), true).await?;
        return Ok(());
    }

    let update = mu.set_to_join(add.sender(), add.event_id(), false).await?;
    push_retired_invites(update.retired_invites, MembershipState::Join, add, updates)
}

async fn update_to_leave_membership<M>(
    mu: &mut M,
    add: &Event,
    new_membership: MembershipState,
    updates: &mut Vec<OutputEvent>,
) -> Result<()>
where
    M: MembershipUpdater + ?Sized,
{
    if mu.is_leave() {
        return Ok(());
    }

    let update = mu.set_to_leave(add.sender(), add.event_id()).await?;
    push_retired_invites(update.retired_invites, new_membership, add, updates)
}

fn push_retired_invites(
    retired_invites: Vec<OwnedEventId>,
    membership: MembershipState,
    add: &Event,
    updates: &mut Vec<OutputEvent>,
) -> Result<()> {
    if retired_invites.is_empty() {
        return Ok(());
    }

    let target_user_id = add.target_user_id()?;

    for event_id in retired_invites {
        debug!(%event_id, retired_by = %add.event_id(), "Retired invite");
        updates.push(OutputEvent::RetireInviteEvent(OutputRetireInviteEvent {
            event_id,
            membership: membership.clone(),
            retired_by_event_id: add.event_id().to_owned(),
            target_user_id: target_user_id.clone(),
        }));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use assert_matches2::{assert_let, assert_matches};
    use async_trait::async_trait;
    use ruma::{RoomVersionId, events::room::member::MembershipState, user_id};
    use similar_asserts::assert_eq;

    use super::update_memberships;
    use crate::{
        Error, Event, EventNid, EventStateKeyNid, EventTypeNid, MembershipChanges,
        MembershipRow, MembershipStore, OutputEvent, RoomNid, StateEntry, Store, StoreConfig,
        StoreError,
        store::CurrentMembership,
        test_utils::{member_event, own_member_event},
    };

    const ROOM: RoomNid = RoomNid(1);
    const BOB: EventStateKeyNid = EventStateKeyNid(2);
    const CAROL: EventStateKeyNid = EventStateKeyNid(3);

    async fn store_with(events: Vec<Event>) -> Store {
        let store = StoreConfig::new().build();
        let mut changes = MembershipChanges::new();
        for event in events {
            changes.add_event(event);
        }
        store.save_changes(&changes).await.unwrap();
        store
    }

    async fn apply(
        store: &Store,
        removed: &[StateEntry],
        added: &[StateEntry],
    ) -> Result<Vec<OutputEvent>, Error> {
        let mut txn = store.begin_room_update(ROOM, RoomVersionId::V10).await;
        let updates = update_memberships(&**store, &mut txn, removed, added).await?;
        txn.commit().await?;
        Ok(updates)
    }

    async fn row(store: &Store, target: EventStateKeyNid) -> MembershipRow {
        store.membership(ROOM, target).await.unwrap().unwrap_or_default()
    }

    fn invite(nid: u64, event_id: &str) -> Event {
        member_event(nid, event_id, "@alice:localhost", "@bob:localhost", MembershipState::Invite)
    }

    fn bob(nid: u64, event_id: &str, membership: MembershipState) -> Event {
        own_member_event(nid, event_id, "@bob:localhost", membership)
    }

    fn entry(target: EventStateKeyNid, nid: u64) -> StateEntry {
        StateEntry::membership(target, EventNid(nid))
    }

    #[tokio::test]
    async fn test_invite_join_leave_scenario() {
        let store = store_with(vec![
            invite(1, "$invite:localhost"),
            bob(2, "$join:localhost", MembershipState::Join),
            bob(3, "$leave:localhost", MembershipState::Leave),
        ])
        .await;

        // Bob gets invited.
        let updates = apply(&store, &[], &[entry(BOB, 1)]).await.unwrap();
        assert_eq!(updates.len(), 1);
        assert_let!(OutputEvent::NewInviteEvent(new_invite) = &updates[0]);
        assert_eq!(new_invite.event.event_id.as_str(), "$invite:localhost");
        assert_eq!(new_invite.event.room_version, RoomVersionId::V10);
        assert_eq!(new_invite.room_version, RoomVersionId::V10);
        assert_eq!(row(&store, BOB).await.membership, CurrentMembership::Invite);

        // Bob joins, retiring the invite.
        let updates = apply(&store, &[entry(BOB, 1)], &[entry(BOB, 2)]).await.unwrap();
        assert_eq!(updates.len(), 1);
        assert_let!(OutputEvent::RetireInviteEvent(retired) = &updates[0]);
        assert_eq!(retired.event_id.as_str(), "$invite:localhost");
        assert_eq!(retired.membership, MembershipState::Join);
        assert_eq!(retired.retired_by_event_id.as_str(), "$join:localhost");
        assert_eq!(retired.target_user_id, user_id!("@bob:localhost"));
        assert_eq!(row(&store, BOB).await.membership, CurrentMembership::Join);

        // Bob leaves, there is no invite left to retire.
        let updates = apply(&store, &[entry(BOB, 2)], &[entry(BOB, 3)]).await.unwrap();
        assert!(updates.is_empty());

        let row = row(&store, BOB).await;
        assert_eq!(row.membership, CurrentMembership::LeaveOrBan);
        assert_eq!(row.event_id.as_ref().map(|id| id.as_str()), Some("$leave:localhost"));
        assert_eq!(row.outstanding_invites().count(), 0);
    }

    #[tokio::test]
    async fn test_unchanged_membership_is_skipped() {
        let store = store_with(vec![
            bob(1, "$leave1:localhost", MembershipState::Leave),
            bob(2, "$leave2:localhost", MembershipState::Leave),
            invite(3, "$invite1:localhost"),
            invite(4, "$invite2:localhost"),
        ])
        .await;

        let mut updater = RecordingUpdater::default();

        // Leave to leave.
        let updates =
            update_memberships(&*store, &mut updater, &[entry(BOB, 1)], &[entry(BOB, 2)])
                .await
                .unwrap();
        assert!(updates.is_empty());

        // Nothing to leave is a leave too.
        let updates =
            update_memberships(&*store, &mut updater, &[entry(BOB, 1)], &[]).await.unwrap();
        assert!(updates.is_empty());

        // Invite to invite.
        let updates =
            update_memberships(&*store, &mut updater, &[entry(BOB, 3)], &[entry(BOB, 4)])
                .await
                .unwrap();
        assert!(updates.is_empty());

        assert_eq!(updater.opened, 0);
    }

    #[tokio::test]
    async fn test_join_to_join_updates_the_join_event() {
        let store = store_with(vec![
            bob(1, "$join:localhost", MembershipState::Join),
            bob(2, "$profile:localhost", MembershipState::Join),
        ])
        .await;

        apply(&store, &[], &[entry(BOB, 1)]).await.unwrap();

        let updates = apply(&store, &[entry(BOB, 1)], &[entry(BOB, 2)]).await.unwrap();
        assert!(updates.is_empty());

        let row = row(&store, BOB).await;
        assert_eq!(row.membership, CurrentMembership::Join);
        assert_eq!(row.event_id.as_ref().map(|id| id.as_str()), Some("$profile:localhost"));
    }

    #[tokio::test]
    async fn test_replayed_invite_is_published_once() {
        let store = store_with(vec![invite(1, "$invite:localhost")]).await;

        let updates = apply(&store, &[], &[entry(BOB, 1)]).await.unwrap();
        assert_eq!(updates.len(), 1);

        // The same delta processed a second time.
        let updates = apply(&store, &[], &[entry(BOB, 1)]).await.unwrap();
        assert!(updates.is_empty());
        assert_eq!(row(&store, BOB).await.invites.len(), 1);
    }

    #[tokio::test]
    async fn test_leave_and_ban_retire_invites() {
        let store = store_with(vec![
            invite(1, "$invite:localhost"),
            bob(2, "$leave:localhost", MembershipState::Leave),
            member_event(
                3,
                "$invite_carol:localhost",
                "@alice:localhost",
                "@carol:localhost",
                MembershipState::Invite,
            ),
            member_event(
                4,
                "$ban_carol:localhost",
                "@alice:localhost",
                "@carol:localhost",
                MembershipState::Ban,
            ),
        ])
        .await;

        apply(&store, &[], &[entry(BOB, 1), entry(CAROL, 3)]).await.unwrap();

        let updates = apply(&store, &[entry(BOB, 1), entry(CAROL, 3)], &[
            entry(BOB, 2),
            entry(CAROL, 4),
        ])
        .await
        .unwrap();

        let retired: BTreeMap<_, _> = updates
            .iter()
            .map(|update| {
                let retired = update.as_retire_invite().expect("only retirements are expected");
                (retired.target_user_id.to_string(), retired.clone())
            })
            .collect();
        assert_eq!(retired.len(), 2);

        let bob = &retired["@bob:localhost"];
        assert_eq!(bob.event_id.as_str(), "$invite:localhost");
        assert_eq!(bob.membership, MembershipState::Leave);
        assert_eq!(bob.retired_by_event_id.as_str(), "$leave:localhost");

        let carol = &retired["@carol:localhost"];
        assert_eq!(carol.event_id.as_str(), "$invite_carol:localhost");
        assert_eq!(carol.membership, MembershipState::Ban);
        assert_eq!(carol.retired_by_event_id.as_str(), "$ban_carol:localhost");

        assert_eq!(row(&store, CAROL).await.membership, CurrentMembership::LeaveOrBan);
    }

    #[tokio::test]
    async fn test_leave_when_already_left_is_idempotent() {
        let store = store_with(vec![
            bob(1, "$join:localhost", MembershipState::Join),
            bob(2, "$leave:localhost", MembershipState::Leave),
            bob(3, "$ban:localhost", MembershipState::Ban),
        ])
        .await;

        apply(&store, &[], &[entry(BOB, 1)]).await.unwrap();
        apply(&store, &[entry(BOB, 1)], &[entry(BOB, 2)]).await.unwrap();

        // The committed row already says leave, the ban doesn't touch it.
        let updates = apply(&store, &[entry(BOB, 2)], &[entry(BOB, 3)]).await.unwrap();
        assert!(updates.is_empty());
        assert_eq!(
            row(&store, BOB).await.event_id.as_ref().map(|id| id.as_str()),
            Some("$leave:localhost")
        );
    }

    #[tokio::test]
    async fn test_missing_added_event_is_an_invariant_violation() {
        let store = store_with(vec![invite(1, "$invite:localhost")]).await;
        apply(&store, &[], &[entry(BOB, 1)]).await.unwrap();

        // The delta claims event 99 replaces the invite, but it doesn't exist.
        let result = apply(&store, &[entry(BOB, 1)], &[entry(BOB, 99)]).await;
        assert_let!(Err(Error::InvariantViolation { target, added_event_nid }) = result);
        assert_eq!(target, BOB);
        assert_eq!(added_event_nid, Some(EventNid(99)));

        // The invite wasn't touched.
        assert_eq!(row(&store, BOB).await.membership, CurrentMembership::Invite);
    }

    #[tokio::test]
    async fn test_retiring_for_a_non_user_state_key_aborts() {
        let store = store_with(vec![
            invite(1, "$invite:localhost"),
            member_event(2, "$join:localhost", "@bob:localhost", "bob", MembershipState::Join),
        ])
        .await;
        apply(&store, &[], &[entry(BOB, 1)]).await.unwrap();

        let result = apply(&store, &[entry(BOB, 1)], &[entry(BOB, 2)]).await;
        assert_let!(Err(Error::InvalidTarget { event_id }) = result);
        assert_eq!(event_id.as_str(), "$join:localhost");

        // Neither the join nor the retirement were committed.
        let row = row(&store, BOB).await;
        assert_eq!(row.membership, CurrentMembership::Invite);
        assert_eq!(row.outstanding_invites().count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_membership_is_fatal() {
        let store = store_with(vec![bob(1, "$knock:localhost", MembershipState::Knock)]).await;

        let result = apply(&store, &[], &[entry(BOB, 1)]).await;
        assert_let!(Err(error) = result);
        assert!(error.is_fatal());
        assert_let!(Error::InvalidMembershipValue { event_id, membership } = error);
        assert_eq!(event_id.as_str(), "$knock:localhost");
        assert_eq!(membership, "knock");
    }

    #[tokio::test]
    async fn test_unknown_membership_unchanged_is_skipped() {
        let store = store_with(vec![
            bob(1, "$knock1:localhost", MembershipState::Knock),
            bob(2, "$knock2:localhost", MembershipState::Knock),
        ])
        .await;

        let updates = apply(&store, &[entry(BOB, 1)], &[entry(BOB, 2)]).await.unwrap();
        assert!(updates.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_membership_aborts() {
        let broken = Event::new(
            EventNid(1),
            crate::test_utils::raw_state_event(serde_json::json!({
                "type": "m.room.member",
                "event_id": "$broken:localhost",
                "sender": "@bob:localhost",
                "state_key": "@bob:localhost",
                "content": {},
            })),
        )
        .unwrap();
        let store = store_with(vec![broken]).await;

        let result = apply(&store, &[], &[entry(BOB, 1)]).await;
        assert_matches!(result, Err(Error::MembershipParse { .. }));
    }

    #[tokio::test]
    async fn test_failure_discards_the_whole_update() {
        let store = store_with(vec![
            invite(1, "$invite:localhost"),
            own_member_event(2, "$knock:localhost", "@carol:localhost", MembershipState::Knock),
        ])
        .await;

        let result = apply(&store, &[], &[entry(BOB, 1), entry(CAROL, 2)]).await;
        assert_matches!(result, Err(Error::InvalidMembershipValue { .. }));

        // Bob's invite was handled in the same update, it must not have stuck.
        assert!(store.membership(ROOM, BOB).await.unwrap().is_none());

        // The invite is still new the next time around.
        let updates = apply(&store, &[], &[entry(BOB, 1)]).await.unwrap();
        assert_eq!(updates.len(), 1);
    }

    #[tokio::test]
    async fn test_other_state_is_ignored() {
        let store = store_with(vec![]).await;
        let mut updater = RecordingUpdater::default();

        let updates = update_memberships(
            &*store,
            &mut updater,
            &[StateEntry::new(EventTypeNid::ROOM_JOIN_RULES, EventStateKeyNid(0), EventNid(1))],
            &[StateEntry::new(EventTypeNid::ROOM_JOIN_RULES, EventStateKeyNid(0), EventNid(2))],
        )
        .await
        .unwrap();

        assert!(updates.is_empty());
        assert_eq!(updater.opened, 0);
    }

    #[tokio::test]
    async fn test_store_failure_aborts() {
        let mut updater = RecordingUpdater::default();

        let result = update_memberships(&FailingStore, &mut updater, &[], &[entry(BOB, 1)]).await;
        assert_matches!(result, Err(Error::Store(StoreError::Codec(_))));
        assert_eq!(updater.opened, 0);
    }

    /// A room updater that only counts how often it's asked for a membership
    /// updater, and refuses to hand one out.
    #[derive(Debug)]
    struct RecordingUpdater {
        room_version: RoomVersionId,
        opened: usize,
    }

    impl Default for RecordingUpdater {
        fn default() -> Self {
            Self { room_version: RoomVersionId::V10, opened: 0 }
        }
    }

    #[async_trait]
    impl crate::RoomUpdater for RecordingUpdater {
        fn room_version(&self) -> &RoomVersionId {
            &self.room_version
        }

        async fn membership_updater<'a>(
            &'a mut self,
            _target: EventStateKeyNid,
        ) -> Result<Box<dyn crate::MembershipUpdater + 'a>, StoreError> {
            self.opened += 1;
            Err(StoreError::Codec("no updater in this test".to_owned()))
        }
    }

    #[derive(Debug)]
    struct FailingStore;

    #[async_trait]
    impl MembershipStore for FailingStore {
        async fn events(
            &self,
            _event_nids: &[EventNid],
        ) -> Result<BTreeMap<EventNid, Event>, StoreError> {
            Err(StoreError::Codec("the store is broken".to_owned()))
        }

        async fn membership(
            &self,
            _room_nid: RoomNid,
            _target: EventStateKeyNid,
        ) -> Result<Option<MembershipRow>, StoreError> {
            Err(StoreError::Codec("the store is broken".to_owned()))
        }

        async fn save_changes(&self, _changes: &MembershipChanges) -> Result<(), StoreError> {
            Err(StoreError::Codec("the store is broken".to_owned()))
        }
    }
}
