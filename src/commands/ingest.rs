use super::{open_database, CommandResult};
use crate::database::ingestion::{print_ingestion_summary, BallotIngester};
use crate::database::schema::verify_schema;
use colored::*;
use std::path::Path;

/// Create the database file and schema.
pub async fn init(database_path: &Path) -> CommandResult {
    let db = open_database(database_path).await?;
    verify_schema(db.pool()).await?;
    println!(
        "✅ Database initialized: {}",
        database_path.display().to_string().bright_green()
    );
    Ok(())
}

pub async fn ingest_roster(database_path: &Path, roster_path: &Path) -> CommandResult {
    let db = open_database(database_path).await?;
    let summary = BallotIngester::new(db).ingest_roster(roster_path).await?;
    print_ingestion_summary(&summary);
    Ok(())
}

pub async fn ingest_ballots(database_path: &Path, ballots_path: &Path) -> CommandResult {
    let db = open_database(database_path).await?;
    let summary = BallotIngester::new(db).ingest_ballots(ballots_path).await?;
    print_ingestion_summary(&summary);
    Ok(())
}
