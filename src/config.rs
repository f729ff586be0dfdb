//! Engine configuration.
//!
//! Every tunable has a default matching the engine's built-in sizes, so an
//! empty JSON object is a valid configuration:
//!
//! ```
//! use fcgi_mux::EngineConfig;
//!
//! let config = EngineConfig::from_json_str(r#"{ "stdin_limit": 1048576 }"#).unwrap();
//! assert_eq!(config.stdin_limit, 1 << 20);
//! assert_eq!(config.page_size, 4096);
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FcgiError, Result};
use crate::protocol::MAX_CONTENT_LENGTH;

/// Default stream buffer page size.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Default output page size. One page always fits in one record.
pub const DEFAULT_OUTPUT_PAGE_SIZE: usize = 4096;

/// Default Input Pump read size.
pub const DEFAULT_INPUT_CHUNK_SIZE: usize = 4096;

/// Default Input Pump poll sleep in milliseconds.
pub const DEFAULT_INPUT_POLL_INTERVAL_MS: u64 = 1;

/// Default amount of unconsumed input the pump buffers before waiting.
pub const DEFAULT_INPUT_HIGH_WATER: usize = 1024 * 1024;

/// Default initial bound of each per-request buffer.
pub const DEFAULT_STREAM_LIMIT: usize = 64 * 1024;

/// Tunables for one [`Service`](crate::Service).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Page size of every stream buffer.
    pub page_size: usize,
    /// Page size of the output page pool (at most 65535).
    pub output_page_size: usize,
    /// Bytes the Input Pump reads per transport call.
    pub input_chunk_size: usize,
    /// Sleep between availability polls while the transport is idle.
    pub input_poll_interval_ms: u64,
    /// The pump stops reading while more than this many bytes wait unconsumed.
    pub input_high_water: usize,
    /// Initial bound of the PARAMS buffer.
    pub params_limit: usize,
    /// Initial bound of the STDIN buffer, until CONTENT_LENGTH is known.
    pub stdin_limit: usize,
    /// Initial bound of the DATA buffer, until FCGI_DATA_LENGTH is known.
    pub data_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            output_page_size: DEFAULT_OUTPUT_PAGE_SIZE,
            input_chunk_size: DEFAULT_INPUT_CHUNK_SIZE,
            input_poll_interval_ms: DEFAULT_INPUT_POLL_INTERVAL_MS,
            input_high_water: DEFAULT_INPUT_HIGH_WATER,
            params_limit: DEFAULT_STREAM_LIMIT,
            stdin_limit: DEFAULT_STREAM_LIMIT,
            data_limit: DEFAULT_STREAM_LIMIT,
        }
    }
}

impl EngineConfig {
    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Check that every size is usable.
    pub fn validate(&self) -> Result<()> {
        let nonzero = [
            ("page_size", self.page_size),
            ("output_page_size", self.output_page_size),
            ("input_chunk_size", self.input_chunk_size),
            ("input_high_water", self.input_high_water),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(FcgiError::InvalidConfig(format!("{} must be non-zero", name)));
            }
        }
        if self.output_page_size > MAX_CONTENT_LENGTH {
            return Err(FcgiError::InvalidConfig(format!(
                "output_page_size {} exceeds the record limit {}",
                self.output_page_size, MAX_CONTENT_LENGTH
            )));
        }
        Ok(())
    }

    /// Poll interval as a `Duration`.
    #[inline]
    pub fn input_poll_interval(&self) -> Duration {
        // never zero: the pump sleeps at least 1ms between idle polls
        Duration::from_millis(self.input_poll_interval_ms.max(1))
    }
}
