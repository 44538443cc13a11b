//! Configuration module

pub mod cli;
pub mod settings;

pub use cli::{CliArgs, Command, PairArgs};
pub use settings::{PairSettings, Settings, scan_window, watch_duration};
