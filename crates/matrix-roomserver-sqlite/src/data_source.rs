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

use std::path::PathBuf;

use matrix_roomserver::{MemoryStore, StoreConfig};
use tracing::info;
use url::Url;

use crate::{OpenStoreError, SqliteMembershipStore};

/// Open the membership store described by a data source string.
///
/// * `file:<path>` opens an [`SqliteMembershipStore`] in the directory at
///   `<path>`, relative paths are resolved against the working directory.
///   `file:///<path>` URLs are accepted as well. The path can be neither empty
///   nor the root directory.
///
/// * `memory:` uses a [`MemoryStore`], which is lost when the process exits.
///
/// Every other data source is rejected.
///
/// # Example
///
/// ```no_run
/// # async {
/// use matrix_roomserver_sqlite::open_data_source;
///
/// let store = open_data_source("file:roomserver").await?.build();
/// # Ok::<_, matrix_roomserver_sqlite::OpenStoreError>(()) };
/// ```
pub async fn open_data_source(data_source: &str) -> Result<StoreConfig, OpenStoreError> {
    let unsupported = || OpenStoreError::UnsupportedDataSource(data_source.to_owned());

    let url = Url::parse(data_source).map_err(|_| unsupported())?;

    match url.scheme() {
        "file" => {
            let path = match data_source.strip_prefix("file:") {
                Some("") => return Err(unsupported()),
                Some(path) if !path.starts_with("//") => PathBuf::from(path),
                _ => url.to_file_path().map_err(|()| unsupported())?,
            };

            // The root of the file system, e.g. from `file:///`.
            if path.parent().is_none() {
                return Err(unsupported());
            }

            info!(path = %path.display(), "Opening the SQLite membership store");
            let store = SqliteMembershipStore::open(path).await?;

            Ok(StoreConfig::new().membership_store(store))
        }
        "memory" => {
            info!("Using the in-memory membership store");
            Ok(StoreConfig::new().membership_store(MemoryStore::new()))
        }
        _ => Err(unsupported()),
    }
}
