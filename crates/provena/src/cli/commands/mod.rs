//! CLI commands

mod config;
mod run;
mod storage;

pub use config::ConfigCommand;
pub use run::RunCommand;
pub use storage::StorageCommand;
