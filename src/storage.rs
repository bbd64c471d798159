use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::api::UserProfile;

/// On-disk state shared across runs. Today that is a single persisted
/// session row; the migration list leaves room to grow.
#[derive(Debug, Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PersistedSession {
    pub credential: Option<String>,
    pub identity: Option<UserProfile>,
}

#[derive(Debug, Default, Clone)]
pub struct Options {
    pub path: Option<PathBuf>,
}

impl Store {
    pub fn open(opts: Options) -> Result<Self> {
        let path = if let Some(path) = opts.path {
            path
        } else {
            default_path().context("storage: resolve default path")?
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("storage: create directory {}", parent.display()))?;
        }

        let conn = Connection::open(&path)
            .with_context(|| format!("storage: open database at {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", &"WAL")
            .context("storage: set WAL")?;
        conn.pragma_update(None, "foreign_keys", &"ON")
            .context("storage: enable foreign keys")?;
        conn.pragma_update(None, "busy_timeout", &5000)
            .context("storage: set busy timeout")?;
        migrate(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn close(self) -> Result<()> {
        let conn = Arc::try_unwrap(self.conn)
            .map_err(|_| anyhow!("storage: connection still in use"))?
            .into_inner();
        conn.close()
            .map_err(|(_, err)| err)
            .context("storage: close connection")
    }

    pub fn load_session(&self) -> Result<PersistedSession> {
        let conn = self.conn.lock();
        let row: Option<(Option<String>, Option<String>)> = conn
            .query_row(
                "SELECT credential, identity FROM session WHERE id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .context("storage: query session")?;

        let Some((credential, identity_json)) = row else {
            return Ok(PersistedSession::default());
        };
        let identity = match identity_json {
            Some(json) => {
                Some(serde_json::from_str(&json).context("storage: decode persisted identity")?)
            }
            None => None,
        };
        Ok(PersistedSession {
            credential,
            identity,
        })
    }

    pub fn save_credential(&self, credential: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
INSERT INTO session (id, credential, updated_at)
VALUES (1, ?1, ?2)
ON CONFLICT(id) DO UPDATE SET
  credential = excluded.credential,
  updated_at = excluded.updated_at
"#,
            params![credential, Utc::now().timestamp()],
        )
        .context("storage: save credential")?;
        Ok(())
    }

    pub fn save_identity(&self, identity: &UserProfile) -> Result<()> {
        let json = serde_json::to_string(identity).context("storage: encode identity")?;
        let conn = self.conn.lock();
        conn.execute(
            r#"
INSERT INTO session (id, identity, updated_at)
VALUES (1, ?1, ?2)
ON CONFLICT(id) DO UPDATE SET
  identity = excluded.identity,
  updated_at = excluded.updated_at
"#,
            params![json, Utc::now().timestamp()],
        )
        .context("storage: save identity")?;
        Ok(())
    }

    pub fn clear_session(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM session WHERE id = 1", [])
            .context("storage: clear session")?;
        Ok(())
    }
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at INTEGER NOT NULL
)
"#,
        [],
    )?;

    let current: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    let migrations = migrations();
    for (idx, sql) in migrations.iter().enumerate() {
        let version = (idx + 1) as i64;
        if version <= current {
            continue;
        }
        conn.execute_batch(sql)?;
        conn.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
            params![version, Utc::now().timestamp()],
        )?;
    }
    Ok(())
}

fn migrations() -> Vec<&'static str> {
    vec![
        r#"
CREATE TABLE IF NOT EXISTS session (
  id INTEGER PRIMARY KEY CHECK (id = 1),
  credential TEXT,
  identity TEXT,
  updated_at INTEGER NOT NULL
);
"#,
    ]
}

pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("deyo-tui").join("state.db"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_temp() -> (tempfile::TempDir, Store) {
        let dir = tempdir().unwrap();
        let store = Store::open(Options {
            path: Some(dir.path().join("state.db")),
        })
        .unwrap();
        (dir, store)
    }

    fn profile() -> UserProfile {
        UserProfile {
            id: "u1".into(),
            display_name: "deyo".into(),
            avatar_url: Some("https://cdn.deyo.blog/u1.png".into()),
        }
    }

    #[test]
    fn open_creates_database() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.db");
        let store = Store::open(Options {
            path: Some(path.clone()),
        })
        .unwrap();
        assert!(path.exists());
        store.close().unwrap();
    }

    #[test]
    fn session_round_trip() {
        let (_dir, store) = open_temp();
        assert_eq!(store.load_session().unwrap(), PersistedSession::default());

        store.save_credential("tok-123").unwrap();
        store.save_identity(&profile()).unwrap();

        let loaded = store.load_session().unwrap();
        assert_eq!(loaded.credential.as_deref(), Some("tok-123"));
        assert_eq!(loaded.identity, Some(profile()));
    }

    #[test]
    fn clear_removes_both_fields() {
        let (_dir, store) = open_temp();
        store.save_credential("tok-123").unwrap();
        store.save_identity(&profile()).unwrap();
        store.clear_session().unwrap();
        assert_eq!(store.load_session().unwrap(), PersistedSession::default());
    }

    #[test]
    fn credential_alone_persists_without_identity() {
        let (_dir, store) = open_temp();
        store.save_credential("tok-123").unwrap();
        let loaded = store.load_session().unwrap();
        assert_eq!(loaded.credential.as_deref(), Some("tok-123"));
        assert!(loaded.identity.is_none());
    }
}
