//! End-to-end migration runs against migration directories on disk.

use std::fs;
use std::path::Path;

use deeler_migrate::prelude::*;
use sqlx::AnyPool;
use tempfile::TempDir;

async fn connect() -> Database {
    let options = DatabaseOptions {
        url: Some("sqlite::memory:".to_string()),
        max_connections: 1,
        ..DatabaseOptions::default()
    };
    Database::connect(&options)
        .await
        .expect("Failed to open in-memory database")
}

fn write(dir: &Path, file: &str, sql: &str) {
    fs::write(dir.join(file), sql).unwrap();
}

/// Writes units 1-3, each creating one table.
fn three_unit_dir() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    for (version, table) in [(1, "users"), (2, "posts"), (3, "tags")] {
        write(
            dir.path(),
            &format!("{version:04}_{table}.up.sql"),
            &format!("CREATE TABLE {table} (id INTEGER PRIMARY KEY);\nINSERT INTO {table} (id) VALUES (1);\n"),
        );
        write(
            dir.path(),
            &format!("{version:04}_{table}.down.sql"),
            &format!("DROP TABLE {table};\n"),
        );
    }
    dir
}

async fn applied(pool: &AnyPool) -> Vec<Version> {
    Ledger::new(pool)
        .applied_versions()
        .await
        .unwrap()
        .into_iter()
        .collect()
}

async fn table_exists(pool: &AnyPool, table: &str) -> bool {
    let row: Option<(String,)> =
        sqlx::query_as("SELECT name FROM sqlite_master WHERE type = 'table' AND name = $1")
            .bind(table)
            .fetch_optional(pool)
            .await
            .unwrap();
    row.is_some()
}

#[tokio::test]
async fn up_applies_everything_in_order() {
    let dir = three_unit_dir();
    let set = MigrationSource::new(dir.path()).load().unwrap();
    let db = connect().await;

    let report = Migrator::new(db.pool(), &set).run(Command::Up).await.unwrap();
    assert_eq!(report.applied, vec![1, 2, 3]);
    assert_eq!(applied(db.pool()).await, vec![1, 2, 3]);

    let entries = Ledger::new(db.pool()).entries().await.unwrap();
    let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["users", "posts", "tags"]);
    assert!(entries.windows(2).all(|w| w[0].applied_at <= w[1].applied_at));
}

#[tokio::test]
async fn second_up_is_noop() {
    let dir = three_unit_dir();
    let set = MigrationSource::new(dir.path()).load().unwrap();
    let db = connect().await;
    let migrator = Migrator::new(db.pool(), &set);

    migrator.run(Command::Up).await.unwrap();
    let report = migrator.run(Command::Up).await.unwrap();
    assert!(report.is_noop());
}

#[tokio::test]
async fn failing_unit_keeps_earlier_progress() {
    let dir = three_unit_dir();
    let db = connect().await;

    // Ledger = {1, 2}
    let set = MigrationSource::new(dir.path()).load().unwrap();
    Migrator::new(db.pool(), &set).to(2).await.unwrap();

    // Unit 3 now fails halfway through
    write(
        dir.path(),
        "0003_tags.up.sql",
        "CREATE TABLE tags (id INTEGER PRIMARY KEY);\nINSERT INTO no_such_table (id) VALUES (1);\n",
    );
    let set = MigrationSource::new(dir.path()).load().unwrap();
    let err = Migrator::new(db.pool(), &set)
        .run(Command::Up)
        .await
        .unwrap_err();

    assert_eq!(err.version(), Some(3));
    assert!(err.to_string().contains("Migration 3 (tags)"));
    assert_eq!(applied(db.pool()).await, vec![1, 2]);
    assert!(!table_exists(db.pool(), "tags").await);
}

#[tokio::test]
async fn down_walks_back_to_empty() {
    let dir = three_unit_dir();
    let set = MigrationSource::new(dir.path()).load().unwrap();
    let db = connect().await;
    let migrator = Migrator::new(db.pool(), &set);
    migrator.up().await.unwrap();

    let mut previous = applied(db.pool()).await;
    while !previous.is_empty() {
        let report = migrator.run(Command::Down).await.unwrap();
        let current = applied(db.pool()).await;
        assert_eq!(report.reverted, vec![*previous.last().unwrap()]);
        assert_eq!(current.len(), previous.len() - 1);
        previous = current;
    }

    assert!(matches!(
        migrator.run(Command::Down).await,
        Err(MigrateError::NothingToRevert)
    ));
    for table in ["users", "posts", "tags"] {
        assert!(!table_exists(db.pool(), table).await);
    }
}

#[tokio::test]
async fn up_then_down_removes_ledger_entry() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "7_widgets.up.sql", "CREATE TABLE widgets (id INTEGER);");
    write(dir.path(), "7_widgets.down.sql", "DROP TABLE widgets;");
    let set = MigrationSource::new(dir.path()).load().unwrap();
    let db = connect().await;
    let migrator = Migrator::new(db.pool(), &set);

    migrator.up().await.unwrap();
    assert_eq!(applied(db.pool()).await, vec![7]);
    migrator.down().await.unwrap();
    assert!(applied(db.pool()).await.is_empty());
    assert!(!table_exists(db.pool(), "widgets").await);
}

#[tokio::test]
async fn to_moves_backwards_newest_first() {
    let dir = three_unit_dir();
    let set = MigrationSource::new(dir.path()).load().unwrap();
    let db = connect().await;
    let migrator = Migrator::new(db.pool(), &set);
    migrator.up().await.unwrap();

    let report = migrator.run(Command::To(1)).await.unwrap();
    assert_eq!(report.reverted, vec![3, 2]);
    assert_eq!(applied(db.pool()).await, vec![1]);

    let again = migrator.run(Command::To(1)).await.unwrap();
    assert!(again.is_noop());
    assert_eq!(applied(db.pool()).await, vec![1]);
}

#[tokio::test]
async fn to_unknown_version_touches_nothing() {
    let dir = three_unit_dir();
    let set = MigrationSource::new(dir.path()).load().unwrap();
    let db = connect().await;

    let err = Migrator::new(db.pool(), &set)
        .run(Command::To(99))
        .await
        .unwrap_err();
    assert!(matches!(err, MigrateError::UnknownVersion(99)));
    assert!(!table_exists(db.pool(), "schema_migrations").await);
}

#[tokio::test]
async fn filesystem_order_is_not_trusted() {
    let dir = tempfile::tempdir().unwrap();
    // Lexical order would run 10 before 9
    write(dir.path(), "10_second.up.sql", "ALTER TABLE base ADD COLUMN extra TEXT;");
    write(dir.path(), "9_first.up.sql", "CREATE TABLE base (id INTEGER);");
    let set = MigrationSource::new(dir.path()).load().unwrap();
    let db = connect().await;

    let report = Migrator::new(db.pool(), &set).up().await.unwrap();
    assert_eq!(report.applied, vec![9, 10]);
}

#[tokio::test]
async fn multi_statement_bodies_run_in_one_unit() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "1_seed.up.sql",
        "-- seed data\nCREATE TABLE notes (body TEXT);\nINSERT INTO notes (body) VALUES ('a; b');\nINSERT INTO notes (body) VALUES ('it''s');\n",
    );
    write(dir.path(), "1_seed.down.sql", "DROP TABLE notes;");
    let set = MigrationSource::new(dir.path()).load().unwrap();

    let db = connect().await;
    Migrator::new(db.pool(), &set).up().await.unwrap();

    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM notes")
        .fetch_one(db.pool())
        .await
        .unwrap();
    assert_eq!(count, 2);
}

#[tokio::test]
async fn trigger_file_applies_and_fires() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "1_audit.up.sql",
        "CREATE TABLE a (id INTEGER);\n\
         CREATE TABLE b (id INTEGER);\n\
         CREATE TRIGGER a_ins AFTER INSERT ON a\n\
         BEGIN\n\
           INSERT INTO b VALUES (NEW.id);\n\
         END;\n",
    );
    write(dir.path(), "1_audit.down.sql", "DROP TRIGGER a_ins;\nDROP TABLE b;\nDROP TABLE a;\n");
    let set = MigrationSource::new(dir.path()).load().unwrap();
    let db = connect().await;

    let report = Migrator::new(db.pool(), &set).up().await.unwrap();
    assert_eq!(report.applied, vec![1]);

    sqlx::query("INSERT INTO a (id) VALUES (3)")
        .execute(db.pool())
        .await
        .unwrap();
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM b")
        .fetch_one(db.pool())
        .await
        .unwrap();
    assert_eq!(count, 1);
}

#[tokio::test]
async fn escaped_string_body_loads_intact() {
    let dir = tempfile::tempdir().unwrap();
    let body = "INSERT INTO notes (body) VALUES (E'it\\'s; fine');\n";
    write(dir.path(), "1_notes.up.sql", body);

    let set = MigrationSource::new(dir.path()).load().unwrap();
    assert_eq!(set.get(1).unwrap().up_sql(), body);
}
