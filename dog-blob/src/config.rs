use std::time::Duration;

use dog_core::DogConfigSnapshot;

/// Default cap on a fully materialized body (512 MiB).
pub const DEFAULT_MAX_BUFFERED_BYTES: u64 = 512 * 1024 * 1024;

/// Default inactivity timeout on an open channel.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for reading blobs out of a backing store
#[derive(Debug, Clone)]
pub struct BlobConfig {
    /// No bytes for this long on an open channel is a mid-transfer abort.
    /// `None` disables the check.
    pub idle_timeout: Option<Duration>,

    /// Largest body BUFFER mode will hold in memory.
    pub max_buffered_bytes: u64,
}

impl Default for BlobConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Some(DEFAULT_IDLE_TIMEOUT),
            max_buffered_bytes: DEFAULT_MAX_BUFFERED_BYTES,
        }
    }
}

impl BlobConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read `relay.idle_timeout_secs` and `relay.max_buffered_bytes`;
    /// an idle timeout of 0 disables it.
    pub fn from_snapshot(config: &DogConfigSnapshot) -> Self {
        let mut out = Self::default();
        if let Some(idle) = config.get_duration_secs("relay.idle_timeout_secs") {
            out.idle_timeout = (!idle.is_zero()).then_some(idle);
        }
        if let Some(max) = config.get_u64("relay.max_buffered_bytes") {
            out.max_buffered_bytes = max;
        }
        out
    }

    pub fn with_idle_timeout(mut self, idle: Option<Duration>) -> Self {
        self.idle_timeout = idle;
        self
    }

    pub fn with_max_buffered_bytes(mut self, bytes: u64) -> Self {
        self.max_buffered_bytes = bytes;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dog_core::DogConfig;

    #[test]
    fn snapshot_overrides_defaults() {
        let mut config = DogConfig::new();
        config.set("relay.idle_timeout_secs", "0");
        config.set("relay.max_buffered_bytes", "1024");

        let blob = BlobConfig::from_snapshot(&config.snapshot());
        assert_eq!(blob.idle_timeout, None);
        assert_eq!(blob.max_buffered_bytes, 1024);

        let defaults = BlobConfig::from_snapshot(&DogConfig::new().snapshot());
        assert_eq!(defaults.idle_timeout, Some(DEFAULT_IDLE_TIMEOUT));
        assert_eq!(defaults.max_buffered_bytes, DEFAULT_MAX_BUFFERED_BYTES);
    }
}
