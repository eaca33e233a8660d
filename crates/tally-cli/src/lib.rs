//! tally-cli library: the pieces behind the `tally` command.
//!
//! - `FileStore`: local slots as files in the data directory
//! - `WsRemote`: the remote store client for `tally-store`
//! - `Config`: `config.json` in the data directory
//! - `Command`: subcommands and their reducer actions

pub mod commands;
pub mod config;
pub mod file_store;
pub mod session;
pub mod ws_remote;

pub use commands::Command;
pub use config::Config;
pub use file_store::FileStore;
pub use ws_remote::WsRemote;
