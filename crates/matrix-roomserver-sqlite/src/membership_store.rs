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

//! An SQLite-based backend for the [`MembershipStore`].

use std::{collections::BTreeMap, fmt, path::Path};

use async_trait::async_trait;
use deadpool_sqlite::{Object as SqliteAsyncConn, Pool as SqlitePool, Runtime};
use matrix_roomserver::{
    CurrentMembership, Event, EventNid, EventStateKeyNid, InviteRecord, MembershipChanges,
    MembershipRow, MembershipStore, RoomNid, StoreError,
};
use ruma::{EventId, UserId, events::AnyStateEvent, serde::Raw};
use rusqlite::{OptionalExtension, Transaction, params_from_iter};
use tokio::fs;
use tracing::{debug, instrument, trace};

use crate::{
    OpenStoreError,
    error::{Error, Result},
    utils::{SqliteAsyncConnExt, SqliteTransactionExt, load_db_version, repeat_vars},
};

/// The database name.
const DATABASE_NAME: &str = "matrix-roomserver.sqlite3";

/// Identifier of the latest database version.
///
/// This is used to figure whether the SQLite database requires a migration.
/// Every new SQL migration should imply a bump of this number, and changes in
/// the [`run_migrations`] function.
const DATABASE_VERSION: u8 = 1;

/// A membership row as it comes out of the database, before its identifiers
/// are parsed.
#[derive(Debug, PartialEq)]
struct StoredMembership {
    membership: u8,
    event_id: Option<String>,
    sender: Option<String>,
    invites: Vec<(String, String, bool)>,
}

/// An SQLite-based membership store.
#[derive(Clone)]
pub struct SqliteMembershipStore {
    pool: SqlitePool,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for SqliteMembershipStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteMembershipStore").finish_non_exhaustive()
    }
}

impl SqliteMembershipStore {
    /// Open the SQLite-based membership store in the given directory.
    ///
    /// The directory is created if it doesn't exist yet.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, OpenStoreError> {
        let path = path.as_ref();
        fs::create_dir_all(path).await.map_err(OpenStoreError::CreateDir)?;

        let config = deadpool_sqlite::Config::new(path.join(DATABASE_NAME));
        let pool = config.create_pool(Runtime::Tokio1)?;

        Self::open_with_pool(pool).await
    }

    /// Create an SQLite-based membership store using the given SQLite database
    /// pool.
    pub async fn open_with_pool(pool: SqlitePool) -> Result<Self, OpenStoreError> {
        let conn = pool.get().await?;

        let version = load_db_version(&conn).await?;
        run_migrations(&conn, version).await.map_err(|e| OpenStoreError::Migration(e.into()))?;

        Ok(Self { pool })
    }

    async fn acquire(&self) -> Result<SqliteAsyncConn> {
        Ok(self.pool.get().await?)
    }
}

/// Run the migrations for the given version of the database.
async fn run_migrations(conn: &SqliteAsyncConn, version: u8) -> Result<()> {
    if version == 0 {
        debug!("Creating database");
    } else if version < DATABASE_VERSION {
        debug!(version, new_version = DATABASE_VERSION, "Upgrading database");
    } else {
        return Ok(());
    }

    if version < 1 {
        // First turn on WAL mode, this can't be done in the transaction, it fails with
        // the error message: "cannot change into wal mode from within a transaction".
        conn.execute_batch("PRAGMA journal_mode = wal;").await?;
        conn.with_transaction(|txn| {
            txn.execute_batch(include_str!("../migrations/001_init.sql"))?;
            txn.set_kv("version", &[1])?;
            Ok(())
        })
        .await?;
    }

    Ok(())
}

fn load_membership(
    txn: &Transaction<'_>,
    key: (u64, u64),
) -> rusqlite::Result<Option<StoredMembership>> {
    let row = txn
        .query_row(
            "SELECT membership, event_id, sender FROM membership \
             WHERE room_nid = ?1 AND target_nid = ?2",
            key,
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;

    let Some((membership, event_id, sender)) = row else {
        return Ok(None);
    };

    let invites = txn
        .prepare(
            "SELECT invite_event_id, sender, retired FROM invites \
             WHERE room_nid = ?1 AND target_nid = ?2 ORDER BY rowid",
        )?
        .query_map(key, |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Some(StoredMembership { membership, event_id, sender, invites }))
}

fn encode_membership(row: &MembershipRow) -> StoredMembership {
    StoredMembership {
        membership: row.membership.as_u8(),
        event_id: row.event_id.as_ref().map(|event_id| event_id.to_string()),
        sender: row.sender.as_ref().map(|sender| sender.to_string()),
        invites: row
            .invites
            .iter()
            .map(|invite| (invite.event_id.to_string(), invite.sender.to_string(), invite.retired))
            .collect(),
    }
}

fn decode_event(event_nid: u64, json: &str) -> Result<(EventNid, Event), StoreError> {
    let event_nid = EventNid(event_nid);
    let raw: Raw<AnyStateEvent> = serde_json::from_str(json)?;
    Ok((event_nid, Event::new(event_nid, raw)?))
}

fn decode_membership(stored: StoredMembership) -> Result<MembershipRow, StoreError> {
    let membership = CurrentMembership::from_u8(stored.membership).ok_or_else(|| {
        StoreError::Codec(format!("Unknown membership value {}", stored.membership))
    })?;

    let invites = stored
        .invites
        .into_iter()
        .map(|(event_id, sender, retired)| -> Result<_, StoreError> {
            Ok(InviteRecord {
                event_id: EventId::parse(event_id)?,
                sender: UserId::parse(sender)?,
                retired,
            })
        })
        .collect::<Result<Vec<_>, StoreError>>()?;

    Ok(MembershipRow {
        membership,
        event_id: stored.event_id.map(EventId::parse).transpose()?,
        sender: stored.sender.map(UserId::parse).transpose()?,
        invites,
    })
}

#[async_trait]
impl MembershipStore for SqliteMembershipStore {
    async fn events(
        &self,
        event_nids: &[EventNid],
    ) -> Result<BTreeMap<EventNid, Event>, StoreError> {
        if event_nids.is_empty() {
            return Ok(BTreeMap::new());
        }

        let event_nids: Vec<u64> = event_nids.iter().map(|nid| nid.0).collect();
        let result_capacity = event_nids.len();

        let rows = self
            .acquire()
            .await?
            .chunk_large_query_over(event_nids, Some(result_capacity), |txn, event_nids| {
                let sql = format!(
                    "SELECT event_nid, data FROM events WHERE event_nid IN ({})",
                    repeat_vars(event_nids.len())
                );

                let rows = txn
                    .prepare(&sql)?
                    .query_map(params_from_iter(event_nids), |row| {
                        Ok((row.get::<_, u64>(0)?, row.get::<_, String>(1)?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;

                Ok(rows)
            })
            .await?;

        trace!(loaded = rows.len(), "Loaded events");

        rows.iter().map(|(event_nid, json)| decode_event(*event_nid, json)).collect()
    }

    async fn membership(
        &self,
        room_nid: RoomNid,
        target: EventStateKeyNid,
    ) -> Result<Option<MembershipRow>, StoreError> {
        let key = (room_nid.0, target.0);

        let stored = self
            .acquire()
            .await?
            .with_transaction(move |txn| Ok(load_membership(txn, key)?))
            .await?;

        stored.map(decode_membership).transpose()
    }

    #[instrument(skip_all)]
    async fn save_changes(&self, changes: &MembershipChanges) -> Result<(), StoreError> {
        if changes.is_empty() {
            return Ok(());
        }

        let events: Vec<_> = changes
            .events
            .values()
            .map(|event| {
                let json = event.raw().json().get().to_owned();
                (event.event_nid().0, event.event_id().to_string(), json)
            })
            .collect();
        let members: Vec<_> = changes
            .members
            .iter()
            .map(|((room_nid, target), row)| (room_nid.0, target.0, row.clone()))
            .collect();
        let expected_members: Vec<_> = changes
            .expected_members
            .iter()
            .map(|((room_nid, target), row)| {
                ((room_nid.0, target.0), row.as_ref().map(encode_membership))
            })
            .collect();

        debug!(events = events.len(), members = members.len(), "Saving membership changes");

        self.acquire()
            .await?
            .with_write_transaction(move |txn| {
                for (key, expected) in &expected_members {
                    if load_membership(txn, *key)? != *expected {
                        return Err(Error::Conflict(RoomNid(key.0), EventStateKeyNid(key.1)));
                    }
                }

                let mut insert_event = txn.prepare_cached(
                    "INSERT INTO events (event_nid, event_id, data) VALUES (?1, ?2, ?3) \
                     ON CONFLICT (event_nid) DO UPDATE SET event_id = ?2, data = ?3",
                )?;
                for (event_nid, event_id, json) in &events {
                    insert_event.execute((event_nid, event_id, json))?;
                }

                let mut upsert_membership = txn.prepare_cached(
                    "INSERT INTO membership (room_nid, target_nid, membership, event_id, sender) \
                     VALUES (?1, ?2, ?3, ?4, ?5) \
                     ON CONFLICT (room_nid, target_nid) \
                     DO UPDATE SET membership = ?3, event_id = ?4, sender = ?5",
                )?;
                let mut delete_invites = txn.prepare_cached(
                    "DELETE FROM invites WHERE room_nid = ?1 AND target_nid = ?2",
                )?;
                let mut insert_invite = txn.prepare_cached(
                    "INSERT INTO invites (invite_event_id, room_nid, target_nid, sender, retired) \
                     VALUES (?1, ?2, ?3, ?4, ?5) \
                     ON CONFLICT (invite_event_id) \
                     DO UPDATE SET room_nid = ?2, target_nid = ?3, sender = ?4, retired = ?5",
                )?;

                for (room_nid, target, row) in &members {
                    upsert_membership.execute((
                        room_nid,
                        target,
                        row.membership.as_u8(),
                        row.event_id.as_ref().map(|event_id| event_id.as_str()),
                        row.sender.as_ref().map(|sender| sender.as_str()),
                    ))?;

                    // The row holds every invite of the user, so it replaces
                    // the stored ones as a whole.
                    delete_invites.execute((room_nid, target))?;
                    for invite in &row.invites {
                        insert_invite.execute((
                            invite.event_id.as_str(),
                            room_nid,
                            target,
                            invite.sender.as_str(),
                            invite.retired,
                        ))?;
                    }
                }

                Ok(())
            })
            .await?;

        Ok(())
    }
}
