use crate::codec::Compression;
use std::time::Duration;

/// Default port of the TCP relay listener.
pub const DEFAULT_RELAY_PORT: u16 = 42421;

/// Size of the copy and receive buffers.
pub const BUFFER_SIZE: usize = 4096;

/// Maximum size of the session identifier frame.
pub const SESSION_ID_LIMIT: usize = 64;

/// How many records the activity ring keeps.
pub const MESSAGE_BUFFER_SIZE: usize = 100;

/// Runtime settings consumed by the relay and the multiplexer.
///
/// The embedding layer (CLI flags, usually) fills this in; every field has
/// a usable default.
#[derive(Debug, Clone)]
pub struct Config {
    /// Sessions idle longer than this are force-closed by the sweep.
    pub idle_timeout: Duration,
    /// How often the idle sweep runs.
    pub sweep_interval: Duration,
    /// Accepts beyond this many live sessions are dropped at the listener.
    pub max_connections: usize,
    /// Raise the log filter to debug.
    pub debug: bool,
    /// Codec applied to outgoing multiplexer payloads.
    pub compression: Compression,
    /// Compression level, 1-9.
    pub compression_level: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(5 * 60),
            max_connections: 1000,
            debug: false,
            compression: Compression::None,
            compression_level: 6,
        }
    }
}
