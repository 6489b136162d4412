//! A single physical shard: one SQLite file serving one (partition, keyspace)
//! pair.
//!
//! All statement execution against a shard happens under its one
//! `Mutex<Connection>`; a shard is the unit of write contention. Each shard
//! also owns a background sweeper thread that physically purges rows whose
//! TTL fell past the grace window. The sweeper holds only a weak reference
//! to the shard internals and stops when the handle is torn down.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rusqlite::{Connection, ErrorCode, OptionalExtension};
use tracing::{debug, error, warn};

use crate::error::{Result, StoreError};
use crate::record::{now_secs, ModelTag, TagSet, TAG_SEPARATOR};

/// How long a sweeper sleeps between purge passes.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Grace window (seconds) between logical expiry and physical purge.
///
/// An offline sync peer must be able to observe and replay a delete before
/// the row disappears, so expired rows are retained for two hours.
pub(crate) const PURGE_GRACE_SECS: i64 = 7_200;

/// Fixed backoff before re-attempting a transiently busy statement.
const BUSY_BACKOFF: Duration = Duration::from_millis(5);

struct ShardInner {
    path: PathBuf,
    conn: Mutex<Connection>,
    stopped: Mutex<bool>,
    stop_signal: Condvar,
}

/// Handle to one open shard.
pub struct Shard {
    inner: Arc<ShardInner>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Shard {
    /// Open (creating if absent) the shard file at `path`, ensure the schema
    /// exists, and start the background sweeper.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Init` if the file cannot be opened and
    /// `StoreError::Schema` if schema creation fails.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| StoreError::Init(format!("Cannot open shard {}: {}", path.display(), e)))?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS records (
                id TEXT PRIMARY KEY,
                value BLOB,
                ttl INTEGER,
                timestamp INTEGER NOT NULL,
                model TEXT,
                version INTEGER,
                filter TEXT NOT NULL DEFAULT ''
            );

            CREATE INDEX IF NOT EXISTS idx_records_ttl
            ON records (ttl);

            CREATE INDEX IF NOT EXISTS idx_records_model
            ON records (model, version);
            "#,
        )
        .map_err(|e| StoreError::Schema(format!("Shard schema creation failed: {}", e)))?;

        debug!(shard = %path.display(), "shard opened");

        let inner = Arc::new(ShardInner {
            path: path.to_path_buf(),
            conn: Mutex::new(conn),
            stopped: Mutex::new(false),
            stop_signal: Condvar::new(),
        });

        let sweeper = spawn_sweeper(Arc::downgrade(&inner));

        Ok(Self {
            inner,
            sweeper: Mutex::new(Some(sweeper)),
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Stop the sweeper and wait for it to exit. Idempotent.
    pub fn close(&self) {
        {
            let Ok(mut stopped) = self.inner.stopped.lock() else {
                return;
            };
            *stopped = true;
        }
        self.inner.stop_signal.notify_all();
        if let Ok(mut sweeper) = self.sweeper.lock() {
            if let Some(handle) = sweeper.take() {
                let _ = handle.join();
            }
        }
    }

    /// Run `op` against the shard connection, retrying on a transient busy
    /// condition with a fixed backoff. A driver misuse condition indicates a
    /// programming error in the engine itself and aborts the process.
    fn with_conn<T>(&self, op: impl Fn(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let conn = self
            .inner
            .conn
            .lock()
            .map_err(|_| StoreError::Execute("Shard connection poisoned".to_string()))?;
        execute_with_retry(&conn, op)
    }

    /// Upsert a record row by its id.
    pub(crate) fn upsert(
        &self,
        id: &str,
        value: &[u8],
        ttl: Option<i64>,
        timestamp: i64,
        model: Option<&ModelTag>,
        tags: &TagSet,
    ) -> Result<()> {
        let filter = tags.to_column();
        let model_name = model.map(|m| m.name.clone());
        let model_version = model.map(|m| m.version);
        self.with_conn(|conn| {
            conn.execute(
                r#"
                INSERT INTO records (id, value, ttl, timestamp, model, version, filter)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ON CONFLICT(id) DO UPDATE SET
                    value = excluded.value,
                    ttl = excluded.ttl,
                    timestamp = excluded.timestamp,
                    model = excluded.model,
                    version = excluded.version,
                    filter = excluded.filter
                "#,
                (
                    id,
                    value,
                    ttl,
                    timestamp,
                    model_name.as_deref(),
                    model_version,
                    &filter,
                ),
            )
            .map(|_| ())
        })
    }

    /// Fetch a live record value by id. Expired rows read as absent even
    /// though they physically remain until the sweep.
    pub(crate) fn fetch(&self, id: &str, now: i64) -> Result<Option<Vec<u8>>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT value FROM records WHERE id = ?1 AND (ttl IS NULL OR ttl >= ?2)",
                (id, now),
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()
        })
    }

    /// Logically delete a live record by setting its TTL into the past.
    /// Returns whether a live row was affected.
    pub(crate) fn mark_deleted(&self, id: &str, now: i64) -> Result<bool> {
        let affected = self.with_conn(|conn| {
            conn.execute(
                "UPDATE records SET ttl = ?1, timestamp = ?2
                 WHERE id = ?3 AND (ttl IS NULL OR ttl >= ?2)",
                (now - 1, now, id),
            )
        })?;
        Ok(affected > 0)
    }

    /// Select all live, tag-matching values in ascending timestamp order.
    pub(crate) fn select_tagged(&self, tags: &TagSet, now: i64) -> Result<Vec<Vec<u8>>> {
        self.with_conn(|conn| {
            let (sql, patterns) = tagged_query(tags);
            let mut stmt = conn.prepare(&sql)?;
            let mut params: Vec<&dyn rusqlite::ToSql> = vec![&now];
            for pattern in &patterns {
                params.push(pattern);
            }
            let rows = stmt.query_map(params.as_slice(), |row| row.get::<_, Vec<u8>>(0))?;
            rows.collect()
        })
    }

    /// Visit live, tag-matching values in ascending timestamp order. The
    /// visitor returns `false` to stop.
    pub(crate) fn visit_tagged(
        &self,
        tags: &TagSet,
        now: i64,
        visitor: &mut dyn FnMut(&[u8]) -> bool,
    ) -> Result<()> {
        let conn = self
            .inner
            .conn
            .lock()
            .map_err(|_| StoreError::Execute("Shard connection poisoned".to_string()))?;
        let (sql, patterns) = tagged_query(tags);
        let mut stmt = conn.prepare(&sql).map_err(StoreError::from)?;
        let mut params: Vec<&dyn rusqlite::ToSql> = vec![&now];
        for pattern in &patterns {
            params.push(pattern);
        }
        let mut rows = stmt.query(params.as_slice()).map_err(StoreError::from)?;
        while let Some(row) = rows.next().map_err(StoreError::from)? {
            let value: Vec<u8> = row.get(0).map_err(StoreError::from)?;
            if !visitor(&value) {
                break;
            }
        }
        Ok(())
    }

    /// Scan records tagged with `from` and rewrite or delete them, record by
    /// record. The transform receives the stored payload and returns the
    /// replacement payload, `Ok(None)` to delete, or an error to abort.
    pub(crate) fn migrate_model(
        &self,
        from: &ModelTag,
        to: &ModelTag,
        transform: &dyn Fn(&[u8]) -> Result<Option<Vec<u8>>>,
    ) -> Result<()> {
        // Materialize candidate rows first so the connection is free for the
        // per-record rewrite statements.
        let candidates: Vec<(String, Vec<u8>)> = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, value FROM records WHERE model = ?1 AND version = ?2",
            )?;
            let rows =
                stmt.query_map((&from.name, from.version), |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
                })?;
            rows.collect()
        })?;

        let now = now_secs();
        for (id, value) in candidates {
            match transform(&value)? {
                Some(replacement) => {
                    self.with_conn(|conn| {
                        conn.execute(
                            "UPDATE records SET value = ?1, model = ?2, version = ?3, timestamp = ?4
                             WHERE id = ?5",
                            (&replacement, &to.name, to.version, now, &id),
                        )
                        .map(|_| ())
                    })?;
                }
                None => {
                    self.with_conn(|conn| {
                        conn.execute("DELETE FROM records WHERE id = ?1", [&id]).map(|_| ())
                    })?;
                }
            }
        }
        Ok(())
    }

    /// Execute a transaction bracketing statement.
    pub(crate) fn transact_raw(&self, statement: &str) -> Result<()> {
        self.with_conn(|conn| conn.execute_batch(statement))
    }

    /// Physically delete rows whose TTL fell more than the grace window into
    /// the past. Returns the number of purged rows.
    pub(crate) fn purge_expired(&self, now: i64) -> Result<usize> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM records WHERE ttl IS NOT NULL AND ttl < ?1",
                [now - PURGE_GRACE_SECS],
            )
        })
    }
}

impl Drop for Shard {
    fn drop(&mut self) {
        // Signal without joining; the sweeper only holds a weak reference
        // and exits on its next wakeup.
        if let Ok(mut stopped) = self.inner.stopped.lock() {
            *stopped = true;
        }
        self.inner.stop_signal.notify_all();
    }
}

/// Build the live-rows query for a tag set: the TTL filter plus one
/// containment term per required tag (logical AND), ordered by ascending
/// timestamp. Patterns are anchored on the separators the column form wraps
/// every tag with, so a tag only matches whole. Returns the SQL and the
/// LIKE patterns, in order.
fn tagged_query(tags: &TagSet) -> (String, Vec<String>) {
    let mut sql =
        String::from("SELECT value FROM records WHERE (ttl IS NULL OR ttl >= ?1)");
    let mut patterns = Vec::with_capacity(tags.digests().len());
    for (i, tag) in tags.digests().iter().enumerate() {
        sql.push_str(&format!(" AND filter LIKE ?{}", i + 2));
        patterns.push(format!("%{}{}{}%", TAG_SEPARATOR, tag, TAG_SEPARATOR));
    }
    sql.push_str(" ORDER BY timestamp ASC");
    (sql, patterns)
}

/// Run one statement closure, retrying while the driver reports a transient
/// busy condition and aborting on misuse.
fn execute_with_retry<T>(
    conn: &Connection,
    op: impl Fn(&Connection) -> rusqlite::Result<T>,
) -> Result<T> {
    loop {
        match op(conn) {
            Ok(value) => return Ok(value),
            Err(rusqlite::Error::SqliteFailure(e, msg)) => match e.code {
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                    thread::sleep(BUSY_BACKOFF);
                }
                ErrorCode::ApiMisuse => {
                    error!(error = ?e, "sqlite driver misuse");
                    panic!(
                        "sqlite driver misuse: {}",
                        msg.unwrap_or_else(|| e.to_string())
                    );
                }
                _ => {
                    return Err(StoreError::Execute(
                        msg.unwrap_or_else(|| e.to_string()),
                    ))
                }
            },
            Err(e) => return Err(e.into()),
        }
    }
}

fn spawn_sweeper(inner: Weak<ShardInner>) -> JoinHandle<()> {
    thread::spawn(move || loop {
        let Some(shard) = inner.upgrade() else {
            break;
        };
        let exit = {
            let Ok(stopped) = shard.stopped.lock() else {
                break;
            };
            // A close() issued during the previous purge has already
            // notified; re-check before sleeping.
            if *stopped {
                break;
            }
            let (stopped, _) = match shard.stop_signal.wait_timeout_while(
                stopped,
                SWEEP_INTERVAL,
                |stopped| !*stopped,
            ) {
                Ok(v) => v,
                Err(_) => break,
            };
            *stopped
        };
        if exit {
            break;
        }
        let Ok(conn) = shard.conn.lock() else { break };
        match execute_with_retry(&conn, |conn| {
            conn.execute(
                "DELETE FROM records WHERE ttl IS NOT NULL AND ttl < ?1",
                [now_secs() - PURGE_GRACE_SECS],
            )
        }) {
            Ok(purged) if purged > 0 => {
                debug!(shard = %shard.path.display(), purged, "ttl sweep purged rows");
            }
            Ok(_) => {}
            Err(e) => warn!(shard = %shard.path.display(), error = %e, "ttl sweep failed"),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_shard(dir: &TempDir) -> Shard {
        Shard::open(&dir.path().join("test.db")).expect("shard should open")
    }

    #[test]
    fn test_upsert_fetch_round_trip() {
        let dir = TempDir::new().unwrap();
        let shard = open_shard(&dir);
        let now = now_secs();

        shard
            .upsert("id-1", b"payload", None, now, None, &TagSet::new())
            .unwrap();
        let value = shard.fetch("id-1", now).unwrap();
        assert_eq!(value.as_deref(), Some(b"payload".as_slice()));
        shard.close();
    }

    #[test]
    fn test_upsert_replaces_existing_row() {
        let dir = TempDir::new().unwrap();
        let shard = open_shard(&dir);
        let now = now_secs();

        shard
            .upsert("id-1", b"v1", None, now, None, &TagSet::new())
            .unwrap();
        shard
            .upsert("id-1", b"v2", None, now + 1, None, &TagSet::new())
            .unwrap();

        assert_eq!(shard.fetch("id-1", now).unwrap().as_deref(), Some(b"v2".as_slice()));
        assert_eq!(shard.select_tagged(&TagSet::new(), now).unwrap().len(), 1);
        shard.close();
    }

    #[test]
    fn test_expired_row_reads_as_absent_but_survives_grace() {
        let dir = TempDir::new().unwrap();
        let shard = open_shard(&dir);
        let now = now_secs();

        // ttl one second in the past: logically deleted
        shard
            .upsert("id-1", b"payload", Some(now - 1), now, None, &TagSet::new())
            .unwrap();
        assert!(shard.fetch("id-1", now).unwrap().is_none());

        // inside the grace window the row physically remains
        assert_eq!(shard.purge_expired(now).unwrap(), 0);

        // past the grace window it is purged
        assert_eq!(shard.purge_expired(now + PURGE_GRACE_SECS + 2).unwrap(), 1);
        shard.close();
    }

    #[test]
    fn test_mark_deleted_only_affects_live_rows() {
        let dir = TempDir::new().unwrap();
        let shard = open_shard(&dir);
        let now = now_secs();

        shard
            .upsert("id-1", b"payload", None, now, None, &TagSet::new())
            .unwrap();
        assert!(shard.mark_deleted("id-1", now).unwrap());
        // already logically deleted
        assert!(!shard.mark_deleted("id-1", now).unwrap());
        assert!(!shard.mark_deleted("missing", now).unwrap());
        shard.close();
    }

    #[test]
    fn test_tagged_selection_requires_all_tags() {
        let dir = TempDir::new().unwrap();
        let shard = open_shard(&dir);
        let now = now_secs();

        let mut both = TagSet::new();
        both.insert_pair("color", "red");
        both.insert_pair("size", "large");
        let mut only_color = TagSet::new();
        only_color.insert_pair("color", "red");

        shard.upsert("id-1", b"both", None, now, None, &both).unwrap();
        shard
            .upsert("id-2", b"color-only", None, now + 1, None, &only_color)
            .unwrap();

        let matched = shard.select_tagged(&both, now + 2).unwrap();
        assert_eq!(matched, vec![b"both".to_vec()]);

        let loose = shard.select_tagged(&only_color, now + 2).unwrap();
        assert_eq!(loose.len(), 2);
        shard.close();
    }

    #[test]
    fn test_raw_tag_probe_matches_whole_tags_only() {
        let dir = TempDir::new().unwrap();
        let shard = open_shard(&dir);
        let now = now_secs();

        let mut broad = TagSet::new();
        broad.insert_raw_pair("aa", "bb");
        shard.upsert("id-1", b"v", None, now, None, &broad).unwrap();

        // a probe for a=b is a substring of aa=bb but not a whole tag
        let mut narrow = TagSet::new();
        narrow.insert_raw_pair("a", "b");
        assert!(shard.select_tagged(&narrow, now).unwrap().is_empty());

        let mut exact = TagSet::new();
        exact.insert_raw_pair("aa", "bb");
        assert_eq!(shard.select_tagged(&exact, now).unwrap().len(), 1);
        shard.close();
    }

    #[test]
    fn test_selection_orders_by_timestamp_ascending() {
        let dir = TempDir::new().unwrap();
        let shard = open_shard(&dir);
        let now = now_secs();

        shard.upsert("b", b"second", None, now + 5, None, &TagSet::new()).unwrap();
        shard.upsert("a", b"first", None, now, None, &TagSet::new()).unwrap();
        shard.upsert("c", b"third", None, now + 10, None, &TagSet::new()).unwrap();

        let values = shard.select_tagged(&TagSet::new(), now).unwrap();
        assert_eq!(values, vec![b"first".to_vec(), b"second".to_vec(), b"third".to_vec()]);
        shard.close();
    }

    #[test]
    fn test_visit_tagged_stops_early() {
        let dir = TempDir::new().unwrap();
        let shard = open_shard(&dir);
        let now = now_secs();

        for i in 0..5 {
            shard
                .upsert(&format!("id-{}", i), b"v", None, now + i, None, &TagSet::new())
                .unwrap();
        }

        let mut seen = 0;
        shard
            .visit_tagged(&TagSet::new(), now, &mut |_| {
                seen += 1;
                seen < 2
            })
            .unwrap();
        assert_eq!(seen, 2);
        shard.close();
    }

    #[test]
    fn test_migrate_model_rewrites_and_deletes() {
        let dir = TempDir::new().unwrap();
        let shard = open_shard(&dir);
        let now = now_secs();
        let from = ModelTag::new("user", 1);
        let to = ModelTag::new("user", 2);

        shard
            .upsert("keep", b"keep-me", None, now, Some(&from), &TagSet::new())
            .unwrap();
        shard
            .upsert("drop", b"drop-me", None, now, Some(&from), &TagSet::new())
            .unwrap();

        shard
            .migrate_model(&from, &to, &|value| {
                if value == b"drop-me" {
                    Ok(None)
                } else {
                    Ok(Some(b"kept-v2".to_vec()))
                }
            })
            .unwrap();

        // the old tag no longer matches anything
        shard
            .migrate_model(&from, &to, &|_| panic!("no v1 records should remain"))
            .unwrap();
        assert_eq!(shard.fetch("keep", now).unwrap().as_deref(), Some(b"kept-v2".as_slice()));
        assert!(shard.fetch("drop", now).unwrap().is_none());
        shard.close();
    }

    #[test]
    fn test_close_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let shard = open_shard(&dir);
        shard.close();
        shard.close();
    }

    #[test]
    fn test_close_does_not_wait_out_the_sweep_interval() {
        let dir = TempDir::new().unwrap();
        let shard = open_shard(&dir);
        let started = std::time::Instant::now();
        shard.close();
        assert!(
            started.elapsed() < Duration::from_secs(5),
            "close blocked for {:?}",
            started.elapsed()
        );
    }
}
