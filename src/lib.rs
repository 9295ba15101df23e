pub mod compaction;
pub mod config;
pub mod engine;
pub mod error;
pub mod ids;
pub mod kv;
pub mod memtable;
pub mod scope;
pub mod sstable;
pub mod version;
pub mod wal;

pub use config::Config;
pub use engine::Engine;
pub use error::{Error, Result};
