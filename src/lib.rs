pub mod commands;
pub mod config;
pub mod database;
pub mod feed;
pub mod model;
pub mod reports;
pub mod tally;

#[cfg(test)]
mod test_support;
