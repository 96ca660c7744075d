use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use stampd_core::constants::{
    DEFAULT_FLUSH_OFFSET_SECS, DEFAULT_FLUSH_PERIOD_SECS, DEFAULT_STUCK_MULTIPLE,
};
use stampd_ledger::LedgerClient;
use stampd_store::FlushConfig;

pub const DB_FILE_NAME: &str = "stampd.redb";
pub const DEFAULT_DATA_DIR: &str = "./stampd-data";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LedgerKind {
    /// In-process devnet ledger; nothing leaves the process.
    #[default]
    Mem,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct NodeConfig {
    pub data_dir: PathBuf,
    pub flush_period_secs: u64,
    /// Flushes fire this far past each period boundary.
    pub flush_offset_secs: u64,
    pub stuck_multiple: u32,
    pub enable_collections: bool,
    pub log_filter: String,
    pub ledger: LedgerKind,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            flush_period_secs: DEFAULT_FLUSH_PERIOD_SECS,
            flush_offset_secs: DEFAULT_FLUSH_OFFSET_SECS,
            stuck_multiple: DEFAULT_STUCK_MULTIPLE,
            enable_collections: false,
            log_filter: "info".to_string(),
            ledger: LedgerKind::Mem,
        }
    }
}

impl NodeConfig {
    /// Read and validate `path`. A missing file means all defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let cfg = match fs::read_to_string(path) {
            Ok(raw) => Self::parse(path, &raw)?,
            Err(e) if e.kind() == ErrorKind::NotFound => Self::default(),
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        cfg.validate()?;
        Ok(cfg)
    }

    fn parse(path: &Path, raw: &str) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.flush_period_secs == 0 {
            return Err(ConfigError::Invalid("flush_period_secs must be > 0".into()));
        }
        if self.flush_offset_secs >= self.flush_period_secs {
            return Err(ConfigError::Invalid(format!(
                "flush_offset_secs ({}) must be less than flush_period_secs ({})",
                self.flush_offset_secs, self.flush_period_secs
            )));
        }
        if self.stuck_multiple == 0 {
            return Err(ConfigError::Invalid("stuck_multiple must be > 0".into()));
        }
        Ok(())
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(DB_FILE_NAME)
    }

    pub fn period(&self) -> Duration {
        Duration::from_secs(self.flush_period_secs)
    }

    pub fn offset(&self) -> Duration {
        Duration::from_secs(self.flush_offset_secs)
    }

    pub fn flush_config(&self) -> FlushConfig {
        FlushConfig {
            period: self.period(),
            stuck_multiple: self.stuck_multiple,
            enable_collections: self.enable_collections,
        }
    }

    pub fn build_ledger(&self) -> Result<Arc<dyn LedgerClient>, ConfigError> {
        match self.ledger {
            #[cfg(feature = "dev-mem")]
            LedgerKind::Mem => Ok(Arc::new(stampd_ledger::MemLedger::new())),
            #[cfg(not(feature = "dev-mem"))]
            LedgerKind::Mem => Err(ConfigError::Invalid(
                "ledger = \"mem\" requires feature dev-mem".into(),
            )),
        }
    }
}
