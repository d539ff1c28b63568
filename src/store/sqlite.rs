use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;

use crate::store::repo::{KvChange, KvStore, change_feed};

pub struct SqliteKv {
    conn: Mutex<Connection>,
    changes: broadcast::Sender<KvChange>,
}

impl SqliteKv {
    pub fn open(path: &std::path::Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("opening store at {}", path.display()))?;
        let kv = Self {
            conn: Mutex::new(conn),
            changes: change_feed(),
        };
        kv.migrate()?;
        Ok(kv)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn migrate(&self) -> Result<()> {
        self.conn().execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS kv (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }
}

impl KvStore for SqliteKv {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        let raw: Option<String> = self
            .conn()
            .query_row(r#"SELECT value FROM kv WHERE key=?1"#, params![key], |r| {
                r.get(0)
            })
            .optional()?;
        match raw {
            Some(s) => Ok(Some(
                serde_json::from_str(&s).with_context(|| format!("corrupt value for '{key}'"))?,
            )),
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: Value) -> Result<()> {
        let encoded = serde_json::to_string(&value)?;
        self.conn().execute(
            r#"
            INSERT INTO kv (key, value) VALUES (?1, ?2)
            ON CONFLICT(key) DO UPDATE SET value=excluded.value
            "#,
            params![key, encoded],
        )?;
        let _ = self.changes.send(KvChange {
            key: key.to_string(),
            new_value: Some(value),
        });
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.conn()
            .execute(r#"DELETE FROM kv WHERE key=?1"#, params![key])?;
        let _ = self.changes.send(KvChange {
            key: key.to_string(),
            new_value: None,
        });
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<KvChange> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        {
            let kv = SqliteKv::open(&path).unwrap();
            kv.set("apiUrl", json!("http://localhost:3000")).unwrap();
            kv.set("apiUrl", json!("http://tracker.test")).unwrap();
            kv.set("gone", json!(1)).unwrap();
            kv.remove("gone").unwrap();
        }
        let kv = SqliteKv::open(&path).unwrap();
        assert_eq!(kv.get("apiUrl").unwrap(), Some(json!("http://tracker.test")));
        assert_eq!(kv.get("gone").unwrap(), None);
    }

    #[test]
    fn writes_are_announced() {
        let dir = tempfile::tempdir().unwrap();
        let kv = SqliteKv::open(&dir.path().join("store.db")).unwrap();
        let mut rx = kv.subscribe();
        kv.set("trackingEnabled", json!(false)).unwrap();
        let change = rx.try_recv().unwrap();
        assert_eq!(change.key, "trackingEnabled");
        assert_eq!(change.new_value, Some(json!(false)));
    }
}
