use crate::database::{DatabaseError, Result};
use crate::model::Table;
/// Database schema definitions
use sqlx::SqlitePool;

pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    // Create lists table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS lists (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            list_order INTEGER NOT NULL DEFAULT 0,
            created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create candidates table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS candidates (
            id INTEGER PRIMARY KEY,
            list_id INTEGER NOT NULL,
            name TEXT NOT NULL,
            score INTEGER NOT NULL DEFAULT 0 CHECK (score >= 0),
            candidate_order INTEGER NOT NULL DEFAULT 0,
            created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
            updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
            FOREIGN KEY (list_id) REFERENCES lists(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create ballot_lines table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ballot_lines (
            id INTEGER PRIMARY KEY,
            ballot_group_id INTEGER NOT NULL,
            candidate_id INTEGER NOT NULL,
            vote INTEGER NOT NULL CHECK (vote IN (-1, 0, 1)),
            classification TEXT NOT NULL CHECK (classification IN ('valid', 'blank', 'invalid')),
            source TEXT NOT NULL CHECK (source IN ('a', 'b')),
            recorded_at TIMESTAMP NOT NULL,
            FOREIGN KEY (candidate_id) REFERENCES candidates(id),
            UNIQUE(ballot_group_id, candidate_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create change_log table, fed by triggers
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS change_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            table_name TEXT NOT NULL,
            op TEXT NOT NULL,
            row_id INTEGER,
            changed_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    create_triggers(pool).await?;
    create_indexes(pool).await?;

    Ok(())
}

async fn create_triggers(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TRIGGER IF NOT EXISTS ballot_lines_append_only
        BEFORE UPDATE ON ballot_lines
        BEGIN
            SELECT RAISE(ABORT, 'ballot lines are append-only');
        END
        "#,
    )
    .execute(pool)
    .await?;

    for table in Table::ALL {
        for (op, row) in [("insert", "NEW"), ("update", "NEW"), ("delete", "OLD")] {
            let trigger_sql = format!(
                r#"
                CREATE TRIGGER IF NOT EXISTS {table}_{op}_log
                AFTER {op_upper} ON {table}
                BEGIN
                    INSERT INTO change_log (table_name, op, row_id)
                    VALUES ('{table}', '{op}', {row}.id);
                END
                "#,
                table = table.as_str(),
                op = op,
                op_upper = op.to_uppercase(),
                row = row,
            );
            sqlx::query(&trigger_sql).execute(pool).await?;
        }
    }

    Ok(())
}

async fn create_indexes(pool: &SqlitePool) -> Result<()> {
    let indexes = vec![
        "CREATE INDEX IF NOT EXISTS idx_candidates_list ON candidates(list_id)",
        "CREATE INDEX IF NOT EXISTS idx_ballot_lines_group ON ballot_lines(ballot_group_id)",
        "CREATE INDEX IF NOT EXISTS idx_ballot_lines_candidate ON ballot_lines(candidate_id)",
    ];

    for index_sql in indexes {
        sqlx::query(index_sql).execute(pool).await?;
    }

    Ok(())
}

/// Verify database schema integrity
pub async fn verify_schema(pool: &SqlitePool) -> Result<()> {
    let tables: Vec<String> =
        sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .fetch_all(pool)
            .await?;

    let expected_tables = ["ballot_lines", "candidates", "change_log", "lists"];

    for expected in &expected_tables {
        if !tables.iter().any(|name| name == expected) {
            return Err(DatabaseError::Integrity(format!(
                "Missing table: {}",
                expected
            )));
        }
    }

    Ok(())
}
