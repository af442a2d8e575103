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

use deadpool_sqlite::{CreatePoolError, InteractError, PoolError};
use matrix_roomserver::{EventStateKeyNid, RoomNid, StoreError};
use thiserror::Error;
use tokio::io;

/// All the errors that can occur when opening a SQLite store.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum OpenStoreError {
    /// Failed to create the DB's parent directory.
    #[error("Failed to create the database's parent directory")]
    CreateDir(#[source] io::Error),

    /// Failed to create the DB pool.
    #[error(transparent)]
    CreatePool(#[from] CreatePoolError),

    /// Failed to get a DB connection from the pool.
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// Failed to load the database version.
    #[error("Failed to load the database version")]
    LoadVersion(#[source] StoreError),

    /// The version stored in the database has an unexpected format.
    #[error("Invalid database version")]
    InvalidVersion,

    /// The database has a `kv` table but no version in it.
    #[error("Missing database version")]
    MissingVersion,

    /// Failed to apply migrations.
    #[error("Failed to run migrations")]
    Migration(#[source] StoreError),

    /// The data source names a backend that isn't available, or isn't a valid
    /// data source at all.
    #[error("Unsupported data source `{0}`, expected a `file:` or `memory:` URL")]
    UnsupportedDataSource(String),
}

#[derive(Error, Debug)]
pub(crate) enum Error {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("The SQLite task failed: {0}")]
    Interact(String),

    #[error("SQLite's maximum variable number is out of range: {0}")]
    SqliteMaximumVariableNumber(i32),

    #[error("The membership of {1} in room {0} was changed concurrently")]
    Conflict(RoomNid, EventStateKeyNid),
}

impl From<InteractError> for Error {
    fn from(value: InteractError) -> Self {
        Self::Interact(value.to_string())
    }
}

impl From<Error> for StoreError {
    fn from(value: Error) -> Self {
        match value {
            Error::Sqlite(e) => StoreError::backend(e),
            Error::Pool(e) => StoreError::backend(e),
            e @ (Error::Interact(_) | Error::SqliteMaximumVariableNumber(_)) => {
                StoreError::backend(e)
            }
            Error::Conflict(room_nid, target) => StoreError::Conflict { room_nid, target },
        }
    }
}

pub(crate) type Result<T, E = Error> = std::result::Result<T, E>;
