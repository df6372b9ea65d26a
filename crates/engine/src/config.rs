//! Engine configuration

use common::Timeout;
use serde::{Deserialize, Serialize};

/// Tunables of a [`Driver`](crate::Driver)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Hold back general and output events appended after a buffered data
    /// event or input error while data events are disabled
    pub strict_fifo: bool,

    /// Upper bound on how long a drain thread waits inside an application
    /// callback before moving on. Unset means wait forever, which is the
    /// only UPOS conforming behaviour; a sink exceeding a configured bound
    /// is logged as non-conformant.
    pub callback_wait_ms: Option<u64>,

    /// Name prefix of the dispatcher thread; the driver name when unset
    pub worker_name: Option<String>,
}

impl EngineConfig {
    pub fn callback_wait(&self) -> Timeout {
        Timeout::from(self.callback_wait_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert!(!config.strict_fifo);
        assert!(config.callback_wait().is_infinite());
        assert!(config.worker_name.is_none());
    }

    #[test]
    fn test_callback_wait() {
        let config = EngineConfig {
            callback_wait_ms: Some(250),
            ..Default::default()
        };
        assert_eq!(config.callback_wait(), Timeout::from_millis(250));
    }
}
