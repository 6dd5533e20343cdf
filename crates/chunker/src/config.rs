use serde::{Deserialize, Serialize};

use crate::error::{ChunkerError, Result};

/// Default window size in characters
pub const DEFAULT_CHUNK_SIZE: usize = 1000;

/// Default overlap between consecutive windows in characters
pub const DEFAULT_OVERLAP: usize = 200;

/// Configuration for window chunking behavior
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ChunkerConfig {
    /// Target chunk size in characters
    pub chunk_size: usize,

    /// Characters shared between consecutive chunks
    pub overlap: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            overlap: DEFAULT_OVERLAP,
        }
    }
}

impl ChunkerConfig {
    /// Validate configuration
    ///
    /// The overlap must be strictly smaller than the chunk size, otherwise
    /// the window start would never advance.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(ChunkerError::invalid_config("chunk_size must be > 0"));
        }

        if self.overlap >= self.chunk_size {
            return Err(ChunkerError::InvalidConfig(format!(
                "overlap ({}) must be smaller than chunk_size ({})",
                self.overlap, self.chunk_size
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        let config = ChunkerConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        // Invalid: overlap == chunk_size
        let config = ChunkerConfig {
            chunk_size: 100,
            overlap: 100,
        };
        assert!(config.validate().is_err());

        // Invalid: overlap > chunk_size
        let config = ChunkerConfig {
            chunk_size: 100,
            overlap: 150,
        };
        assert!(config.validate().is_err());

        // Invalid: zero chunk size
        let config = ChunkerConfig {
            chunk_size: 0,
            overlap: 0,
        };
        assert!(config.validate().is_err());

        // Valid configuration
        let config = ChunkerConfig {
            chunk_size: 100,
            overlap: 20,
        };
        assert!(config.validate().is_ok());
    }
}
