//! Background thread moving transport bytes into the connection's input buffer.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::EngineConfig;
use crate::error::Result;
use crate::memory::Buffer;
use crate::transport::Connection;

/// Settings for one Input Pump.
#[derive(Debug, Clone, Copy)]
pub struct PumpConfig {
    /// Bytes read per transport call.
    pub chunk_size: usize,
    /// Sleep while the transport has nothing to read.
    pub poll_interval: Duration,
    /// Stop reading while more than this many bytes wait unconsumed.
    pub high_water: usize,
}

impl From<&EngineConfig> for PumpConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            chunk_size: config.input_chunk_size,
            poll_interval: config.input_poll_interval(),
            high_water: config.input_high_water,
        }
    }
}

/// Start the pump: the sole producer for `buffer`.
///
/// The thread exits when the peer closes, the transport fails, or `buffer`
/// is interrupted. It always closes `buffer` on the way out so the consumer
/// sees end of stream.
pub fn spawn_input_pump(
    conn: Arc<dyn Connection>,
    buffer: Arc<Buffer>,
    config: PumpConfig,
) -> Result<JoinHandle<()>> {
    let handle = thread::Builder::new()
        .name("fcgi-input".to_string())
        .spawn(move || {
            pump_loop(conn.as_ref(), &buffer, config);
            buffer.close();
            tracing::debug!("input pump exiting");
        })?;
    Ok(handle)
}

fn pump_loop(conn: &dyn Connection, buffer: &Buffer, config: PumpConfig) {
    let mut chunk = vec![0u8; config.chunk_size];
    loop {
        if buffer.is_interrupted() {
            return;
        }

        match conn.bytes_available() {
            Ok(0) => {
                thread::sleep(config.poll_interval);
                continue;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("transport availability check failed: {}", e);
                return;
            }
        }

        let n = match conn.read(&mut chunk, 1) {
            Ok(0) => {
                tracing::debug!("peer closed the connection");
                return;
            }
            Ok(n) => n,
            Err(e) => {
                tracing::warn!("transport read failed: {}", e);
                return;
            }
        };

        let accepted = buffer.begin_writing().write(&chunk[..n]);
        if accepted < n {
            tracing::warn!("input buffer full, dropped {} bytes", n - accepted);
            return;
        }
        tracing::trace!("pumped {} bytes", n);

        if buffer.wait_until_drained_below(config.high_water).is_err() {
            return;
        }
    }
}
