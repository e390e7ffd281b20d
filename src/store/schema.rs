use rusqlite::{Connection, OptionalExtension};

use crate::error::StoreError;

struct Migration {
    version: u32,
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial",
        sql: include_str!("migrations/001_initial.sql"),
    },
    Migration {
        version: 2,
        name: "permanent_memory",
        sql: include_str!("migrations/002_permanent_memory.sql"),
    },
];

/// Highest schema version this build knows how to produce.
pub const CURRENT_SCHEMA_VERSION: u32 = 2;

pub fn run_migrations(conn: &Connection) -> Result<u32, StoreError> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)")?;

    let mut current = match read_version(conn)? {
        Some(version) => version,
        None => {
            // Databases written before version tracking already carry the initial tables.
            let baseline = if has_table(conn, "sessions")? { 1 } else { 0 };
            conn.execute("INSERT INTO schema_version (version) VALUES (?)", [baseline])?;
            if baseline > 0 {
                tracing::info!("Detected existing database, baselined schema at version {}", baseline);
            }
            baseline
        }
    };

    for migration in MIGRATIONS {
        if migration.version > current {
            apply_migration(conn, migration)?;
            current = migration.version;
        }
    }

    Ok(current)
}

pub fn read_version(conn: &Connection) -> Result<Option<u32>, StoreError> {
    let version = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
            row.get::<_, u32>(0)
        })
        .optional()?;
    Ok(version)
}

fn has_table(conn: &Connection, name: &str) -> Result<bool, StoreError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
        [name],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn apply_migration(conn: &Connection, migration: &Migration) -> Result<(), StoreError> {
    tracing::info!(
        "Applying migration {:03}: {}",
        migration.version,
        migration.name
    );

    conn.execute_batch(&format!(
        "BEGIN TRANSACTION; {} UPDATE schema_version SET version = {}; COMMIT;",
        migration.sql, migration.version
    ))
    .map_err(|e| {
        // Leave the connection usable if the batch stopped midway.
        let _ = conn.execute_batch("ROLLBACK");
        StoreError::Unavailable(format!(
            "migration {:03} ({}) failed: {}",
            migration.version, migration.name, e
        ))
    })?;

    tracing::info!("Migration {:03} applied successfully", migration.version);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_exists(conn: &Connection, name: &str) -> bool {
        has_table(conn, name).unwrap()
    }

    #[test]
    fn test_migrations_run_on_fresh_db() {
        let conn = Connection::open_in_memory().unwrap();
        let version = run_migrations(&conn).unwrap();

        assert_eq!(version, CURRENT_SCHEMA_VERSION);
        assert!(table_exists(&conn, "sessions"));
        assert!(table_exists(&conn, "drafts"));
        assert!(table_exists(&conn, "permanent_memory"));
        assert_eq!(read_version(&conn).unwrap(), Some(CURRENT_SCHEMA_VERSION));
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();

        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 1);
        assert_eq!(read_version(&conn).unwrap(), Some(CURRENT_SCHEMA_VERSION));
    }

    #[test]
    fn test_existing_db_gets_baseline() {
        let conn = Connection::open_in_memory().unwrap();

        // A database written before version tracking: initial tables, no schema_version.
        conn.execute_batch(include_str!("migrations/001_initial.sql"))
            .unwrap();
        conn.execute(
            "INSERT INTO sessions (id, branch, started_at, status, data) VALUES ('s1', 'main', '2024-01-01T00:00:00Z', 'active', '{}')",
            [],
        )
        .unwrap();

        let version = run_migrations(&conn).unwrap();

        assert_eq!(version, CURRENT_SCHEMA_VERSION);
        assert!(table_exists(&conn, "permanent_memory"));
        let kept: i64 = conn
            .query_row("SELECT COUNT(*) FROM sessions", [], |row| row.get(0))
            .unwrap();
        assert_eq!(kept, 1);
    }

    #[test]
    fn test_fts_index_follows_observation_rows() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        conn.execute_batch(
            "INSERT INTO sessions (id, branch, started_at, status, data) VALUES ('s1', 'main', '2024-01-01T00:00:00Z', 'active', '{}');
             INSERT INTO observations (id, session_id, type, title, narrative, created_at)
             VALUES ('o1', 's1', 'discovery', 'Parser', 'the tokenizer panicked on emoji', '2024-01-01T00:00:00Z');",
        )
        .unwrap();

        let hits = |term: &str| -> i64 {
            conn.query_row(
                "SELECT COUNT(*) FROM observations_fts WHERE observations_fts MATCH ?",
                [term],
                |row| row.get(0),
            )
            .unwrap()
        };
        assert_eq!(hits("emoji"), 1);

        conn.execute(
            "UPDATE observations SET narrative = 'the lexer choked on unicode' WHERE id = 'o1'",
            [],
        )
        .unwrap();
        assert_eq!(hits("emoji"), 0);
        assert_eq!(hits("unicode"), 1);

        conn.execute("DELETE FROM observations WHERE id = 'o1'", []).unwrap();
        assert_eq!(hits("unicode"), 0);
    }
}
