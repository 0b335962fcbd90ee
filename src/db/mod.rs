use crate::errors::{AppError, AppResult};
use crate::models::EngineSettings;
use crate::validation::validate_settings;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

#[cfg(test)]
pub(crate) mod fixtures;

const SCHEMA_SQL: &str = include_str!("schema.sql");
const SETTINGS_KEY: &str = "engine";

/// Owns the single SQLite connection. Callers serialise on the mutex, and
/// every mutating pipeline runs inside one transaction obtained from
/// [`Database::write`].
#[derive(Debug)]
pub struct Database {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl Database {
    pub fn new(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| AppError::Io(err.to_string()))?;
        }
        let conn = Connection::open(path).map_err(AppError::from)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA_SQL).map_err(AppError::from)?;

        let db = Self {
            conn: Mutex::new(conn),
            db_path: path.to_path_buf(),
        };
        db.ensure_default_settings()?;

        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    pub(crate) fn lock(&self) -> AppResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))
    }

    /// Runs read-only work against the connection outside any explicit
    /// transaction.
    pub fn read<T>(&self, work: impl FnOnce(&Connection) -> AppResult<T>) -> AppResult<T> {
        let conn = self.lock()?;
        work(&conn)
    }

    /// Runs `work` inside one transaction. Any error rolls the whole
    /// transaction back; `dry_run` rolls back a successful run as well.
    pub fn write<T>(
        &self,
        dry_run: bool,
        work: impl FnOnce(&mut Transaction<'_>) -> AppResult<T>,
    ) -> AppResult<T> {
        let mut conn = self.lock()?;
        let mut tx = conn.transaction()?;
        let output = work(&mut tx)?;
        if dry_run {
            tx.rollback()?;
        } else {
            tx.commit()?;
        }
        Ok(output)
    }

    pub fn get_settings(&self) -> AppResult<EngineSettings> {
        let conn = self.lock()?;
        let raw = conn
            .query_row(
                "SELECT value_json FROM settings WHERE key = ?1",
                [SETTINGS_KEY],
                |row| row.get::<_, String>(0),
            )
            .optional()?;

        match raw {
            Some(raw) => Ok(serde_json::from_str::<EngineSettings>(&raw).unwrap_or_default()),
            None => Ok(EngineSettings::default()),
        }
    }

    pub fn update_settings(&self, update: serde_json::Value) -> AppResult<EngineSettings> {
        let current = self.get_settings()?;
        let mut merged = serde_json::to_value(current)?;
        merge_json(&mut merged, update);
        let settings: EngineSettings = serde_json::from_value(merged)
            .map_err(|err| AppError::Validation(format!("Invalid settings: {}", err)))?;
        validate_settings(&settings)?;

        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO settings (key, value_json, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json, updated_at = excluded.updated_at",
            params![SETTINGS_KEY, serde_json::to_string(&settings)?, Utc::now().to_rfc3339()],
        )?;

        Ok(settings)
    }

    fn ensure_default_settings(&self) -> AppResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO settings (key, value_json, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO NOTHING",
            params![
                SETTINGS_KEY,
                serde_json::to_string(&EngineSettings::default())?,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }
}

pub(crate) fn parse_time(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|error| invalid_text(error.to_string()))
}

pub(crate) fn invalid_text(message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn merge_json(target: &mut serde_json::Value, update: serde_json::Value) {
    match (target, update) {
        (serde_json::Value::Object(target_map), serde_json::Value::Object(update_map)) => {
            for (key, value) in update_map {
                merge_json(target_map.entry(key).or_insert(serde_json::Value::Null), value);
            }
        }
        (target, update) => {
            *target = update;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Database;
    use crate::errors::AppError;
    use crate::models::EngineSettings;

    #[test]
    fn new_database_seeds_default_settings() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::new(&dir.path().join("nested").join("engine.db")).expect("db");

        assert!(db.path().exists());
        assert_eq!(db.get_settings().expect("settings"), EngineSettings::default());
    }

    #[test]
    fn reopening_keeps_updated_settings() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db_path = dir.path().join("engine.db");
        {
            let db = Database::new(&db_path).expect("db");
            let updated = db
                .update_settings(serde_json::json!({ "decayAlpha": 0.5, "recommendationLimit": 5 }))
                .expect("update settings");
            assert_eq!(updated.decay_alpha, 0.5);
            assert_eq!(updated.recommendation_limit, 5);
            assert_eq!(updated.graph_top_n, 30);
        }

        let reopened = Database::new(&db_path).expect("reopen");
        let settings = reopened.get_settings().expect("settings");
        assert_eq!(settings.decay_alpha, 0.5);
        assert_eq!(settings.recommendation_limit, 5);
    }

    #[test]
    fn invalid_settings_update_is_rejected_and_not_stored() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::new(&dir.path().join("engine.db")).expect("db");

        let err = db
            .update_settings(serde_json::json!({ "decayAlpha": 1.5 }))
            .expect_err("alpha out of range");
        assert!(matches!(err, AppError::Validation(_)));

        let err = db
            .update_settings(serde_json::json!({ "recommendationLimit": "three" }))
            .expect_err("wrong type");
        assert!(matches!(err, AppError::Validation(_)));

        assert_eq!(db.get_settings().expect("settings"), EngineSettings::default());
    }

    #[test]
    fn dry_run_and_failed_writes_leave_no_trace() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::new(&dir.path().join("engine.db")).expect("db");

        db.write(true, |tx| {
            tx.execute("INSERT INTO themes (id, name) VALUES (1, 'Carbon')", [])?;
            Ok(())
        })
        .expect("dry run write");

        let failed = db.write(false, |tx| {
            tx.execute("INSERT INTO themes (id, name) VALUES (2, 'Water')", [])?;
            Err::<(), _>(AppError::Validation("abort".to_string()))
        });
        assert!(failed.is_err());

        let count: i64 = db
            .read(|conn| Ok(conn.query_row("SELECT COUNT(1) FROM themes", [], |row| row.get(0))?))
            .expect("count themes");
        assert_eq!(count, 0);
    }

    #[test]
    fn foreign_keys_are_enforced() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::new(&dir.path().join("engine.db")).expect("db");

        let result = db.write(false, |tx| {
            tx.execute(
                "INSERT INTO interventions (name, theme_id) VALUES ('Orphan', 99)",
                [],
            )?;
            Ok(())
        });
        assert!(matches!(result, Err(AppError::Storage(_))));
    }
}
