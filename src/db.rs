use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqliteJournalMode};
use sqlx::ConnectOptions;
use std::path::Path;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Open a fresh connection to the SQLite file at `path`.
///
/// The store opens one connection per operation and closes it when done,
/// so readers never share a handle with a concurrent rebuild.
pub async fn connect(path: &Path) -> Result<SqliteConnection> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::Store(format!("cannot create {}: {}", parent.display(), e))
            })?;
        }
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(std::time::Duration::from_secs(5));

    Ok(options.connect().await?)
}
