pub mod config;
pub mod io_utils;
pub mod scheduler;

pub use config::{ConfigError, LedgerKind, NodeConfig, DB_FILE_NAME, DEFAULT_DATA_DIR};
pub use io_utils::{parse_hex32, write_file_atomic};
pub use scheduler::{next_tick_delay, Scheduler};
