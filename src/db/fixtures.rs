use super::Database;
use crate::catalog::{create_project, upsert_intervention, upsert_theme};
use crate::models::{NewIntervention, NewTheme};
use rusqlite::Connection;
use tempfile::TempDir;

pub(crate) const TOLERANCE: f64 = 1e-9;

pub(crate) fn open_test_db() -> (TempDir, Database) {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = Database::new(&dir.path().join("test.db")).expect("db");
    (dir, db)
}

pub(crate) fn seed_theme(conn: &Connection, id: i64, name: &str) {
    upsert_theme(
        conn,
        &NewTheme {
            id,
            name: name.to_string(),
            description: None,
        },
    )
    .expect("seed theme");
}

pub(crate) fn seed_intervention(
    conn: &Connection,
    name: &str,
    theme_id: i64,
    base_effectiveness: Option<f64>,
    is_stage: bool,
) -> i64 {
    upsert_intervention(
        conn,
        &NewIntervention {
            id: None,
            name: name.to_string(),
            theme_id,
            base_effectiveness,
            cost_weight: None,
            is_stage,
            description: None,
        },
    )
    .expect("seed intervention")
}

pub(crate) fn seed_project(conn: &Connection) -> i64 {
    create_project(conn, "Test project").expect("seed project").id
}

pub(crate) fn assert_close(actual: f64, expected: f64) {
    assert!(
        (actual - expected).abs() < TOLERANCE,
        "expected {expected}, got {actual}"
    );
}
