//! The log file source
//!
//! Everything upstream of the engines: discovering log files by glob,
//! following each one across rotations and turning its lines into `Record`s
//! for a `RecordSink`.

pub mod file_server;
pub mod file_watcher;

pub use self::file_server::FileServer;
pub use self::file_watcher::FileWatcher;
