mod ingest;
mod mark;
mod report;
mod simulate;
mod watch;

pub use ingest::{ingest_ballots, ingest_roster, init};
pub use mark::mark;
pub use report::report;
pub use simulate::simulate;
pub use watch::watch;

use crate::config::{ConfigError, EngineConfig};
use crate::database::ingestion::IngestionError;
use crate::database::{DatabaseError, TallyDatabase};
use crate::reports::ReportError;
use crate::tally::EngineError;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Database(#[from] DatabaseError),
    #[error(transparent)]
    Ingestion(#[from] IngestionError),
    #[error(transparent)]
    Report(#[from] ReportError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("{0}")]
    Input(String),
}

pub type CommandResult<T = ()> = std::result::Result<T, CommandError>;

/// Load the engine config, or the defaults when no file is given.
pub fn load_config(path: Option<&Path>) -> CommandResult<EngineConfig> {
    let config = match path {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

async fn open_database(database_path: &Path) -> CommandResult<TallyDatabase> {
    let url = format!("sqlite:{}", database_path.display());
    Ok(TallyDatabase::new(&url).await?)
}
