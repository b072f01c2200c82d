// This file is part of Alpenhorn and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

//! Transactional key-value backing store for the PKG, on SQLite. Every
//! write runs in its own transaction; the extract path relies on the audit
//! write committing before the reply leaves the server.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension};

const SCHEMA_VERSION: i64 = 1;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS kv (
    key BLOB PRIMARY KEY,
    value BLOB NOT NULL
);
";

/// SQLite connection behind a mutex. rusqlite connections are not Sync, so
/// all access is serialized here; transactions stay short (single key).
pub struct Db {
    conn: Mutex<Connection>,
}

impl Db {
    pub fn open<P: AsRef<Path>>(path: P) -> rusqlite::Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> rusqlite::Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> rusqlite::Result<Self> {
        let current: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
        if current != SCHEMA_VERSION {
            conn.execute_batch(SCHEMA)?;
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        }
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn get(&self, key: &[u8]) -> rusqlite::Result<Option<Vec<u8>>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT value FROM kv WHERE key = ?1",
            rusqlite::params![key],
            |row| row.get(0),
        )
        .optional()
    }

    /// Writes one key in its own committed transaction.
    pub fn put(&self, key: &[u8], value: &[u8]) -> rusqlite::Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            rusqlite::params![key, value],
        )?;
        tx.commit()
    }

    /// Writes one key only if it is absent. Returns whether the write
    /// happened, atomically with the existence check.
    pub fn put_if_absent(&self, key: &[u8], value: &[u8]) -> rusqlite::Result<bool> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let inserted = tx.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO NOTHING",
            rusqlite::params![key, value],
        )?;
        tx.commit()?;
        Ok(inserted == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_put_roundtrip() {
        let db = Db::open_in_memory().unwrap();
        assert_eq!(db.get(b"missing").unwrap(), None);
        db.put(b"k", b"v1").unwrap();
        assert_eq!(db.get(b"k").unwrap().as_deref(), Some(&b"v1"[..]));
        db.put(b"k", b"v2").unwrap();
        assert_eq!(db.get(b"k").unwrap().as_deref(), Some(&b"v2"[..]));
    }

    #[test]
    fn put_if_absent_is_first_writer_wins() {
        let db = Db::open_in_memory().unwrap();
        assert!(db.put_if_absent(b"k", b"first").unwrap());
        assert!(!db.put_if_absent(b"k", b"second").unwrap());
        assert_eq!(db.get(b"k").unwrap().as_deref(), Some(&b"first"[..]));
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pkg.db");
        {
            let db = Db::open(&path).unwrap();
            db.put(b"k", b"v").unwrap();
        }
        let db = Db::open(&path).unwrap();
        assert_eq!(db.get(b"k").unwrap().as_deref(), Some(&b"v"[..]));
    }
}
