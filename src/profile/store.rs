//! Profile persistence behind a key-value interface.
//!
//! The pool holds its working set in memory; stores only need wholesale
//! load, upsert, and delete. `SqliteStore` is the durable backend,
//! `MemoryStore` backs tests and ephemeral runs.

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use uuid::Uuid;

use super::Profile;

/// Abstract profile persistence.
pub trait ProfileStore: Send + Sync {
    fn load_all(&self) -> Result<Vec<Profile>>;
    fn upsert(&self, profile: &Profile) -> Result<()>;
    fn remove(&self, id: Uuid) -> Result<()>;
}

/// In-memory store for tests and throwaway sessions.
pub struct MemoryStore {
    rows: Mutex<HashMap<Uuid, Profile>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
        }
    }
}

impl ProfileStore for MemoryStore {
    fn load_all(&self) -> Result<Vec<Profile>> {
        Ok(self.rows.lock().expect("store poisoned").values().cloned().collect())
    }

    fn upsert(&self, profile: &Profile) -> Result<()> {
        self.rows
            .lock()
            .expect("store poisoned")
            .insert(profile.id, profile.clone());
        Ok(())
    }

    fn remove(&self, id: Uuid) -> Result<()> {
        self.rows.lock().expect("store poisoned").remove(&id);
        Ok(())
    }
}

/// SQLite-backed store. The fingerprint is kept as a JSON column so schema
/// changes in the signal set never require a migration.
pub struct SqliteStore {
    db: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a store at the given path.
    pub fn open(path: &PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Connection::open(path)
            .with_context(|| format!("failed to open profile store: {}", path.display()))?;

        db.execute_batch(
            "CREATE TABLE IF NOT EXISTS profiles (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                fingerprint TEXT NOT NULL,
                usage_count INTEGER NOT NULL DEFAULT 0,
                success_rate REAL NOT NULL DEFAULT 1.0,
                banned INTEGER NOT NULL DEFAULT 0,
                last_used TEXT NOT NULL,
                created_at TEXT NOT NULL
            );",
        )
        .context("failed to create profiles table")?;

        Ok(Self { db: Mutex::new(db) })
    }

    /// Open the default store at ~/.wraith/profiles.db.
    pub fn default_store() -> Result<Self> {
        let path = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(".wraith")
            .join("profiles.db");
        Self::open(&path)
    }
}

impl ProfileStore for SqliteStore {
    fn load_all(&self) -> Result<Vec<Profile>> {
        let db = self.db.lock().expect("store poisoned");
        let mut stmt = db.prepare(
            "SELECT id, name, fingerprint, usage_count, success_rate, banned, last_used, created_at
             FROM profiles",
        )?;
        let rows = stmt.query_map([], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let fingerprint: String = row.get(2)?;
            let usage_count: u32 = row.get(3)?;
            let success_rate: f64 = row.get(4)?;
            let banned: bool = row.get(5)?;
            let last_used: String = row.get(6)?;
            let created_at: String = row.get(7)?;
            Ok((
                id,
                name,
                fingerprint,
                usage_count,
                success_rate,
                banned,
                last_used,
                created_at,
            ))
        })?;

        let mut profiles = Vec::new();
        for row in rows {
            let (id, name, fingerprint, usage_count, success_rate, banned, last_used, created_at) =
                row?;
            profiles.push(Profile {
                id: id.parse().context("malformed profile id")?,
                name,
                fingerprint: serde_json::from_str(&fingerprint)
                    .context("malformed fingerprint json")?,
                usage_count,
                success_rate,
                banned,
                last_used: last_used.parse().context("malformed last_used")?,
                created_at: created_at.parse().context("malformed created_at")?,
            });
        }
        Ok(profiles)
    }

    fn upsert(&self, profile: &Profile) -> Result<()> {
        let db = self.db.lock().expect("store poisoned");
        db.execute(
            "INSERT OR REPLACE INTO profiles
                (id, name, fingerprint, usage_count, success_rate, banned, last_used, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                profile.id.to_string(),
                profile.name,
                serde_json::to_string(&profile.fingerprint)?,
                profile.usage_count,
                profile.success_rate,
                profile.banned,
                profile.last_used.to_rfc3339(),
                profile.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn remove(&self, id: Uuid) -> Result<()> {
        let db = self.db.lock().expect("store poisoned");
        db.execute(
            "DELETE FROM profiles WHERE id = ?1",
            rusqlite::params![id.to_string()],
        )?;
        Ok(())
    }
}
