//! Chain-level configuration shared by the scanner, bundler and rewriters.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::range::round_to_bundle_start;

pub const DEFAULT_BUNDLE_SIZE: u64 = 100;
/// Bundles are buffered whole in memory before being written.
pub const MAX_BUNDLE_SIZE: u64 = 10_000_000;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("bundle size must be greater than zero")]
    ZeroBundleSize,
    #[error("bundle size {0} exceeds the maximum of {MAX_BUNDLE_SIZE}")]
    BundleSizeTooLarge(u64),
    #[error("unable to read chain config {path}: {source}")]
    Read { path: String, source: std::io::Error },
    #[error("invalid chain config {path}: {source}")]
    Parse { path: String, source: serde_json::Error },
}

/// Bundle geometry of one chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    /// Number of consecutive block numbers held by one bundle.
    pub bundle_size:            u64,
    /// First block a chain can stream; the first bundle starts here rather
    /// than at zero and may therefore be short.
    pub first_streamable_block: u64,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            bundle_size:            DEFAULT_BUNDLE_SIZE,
            first_streamable_block: 0,
        }
    }
}

impl ChainConfig {
    pub fn new(bundle_size: u64, first_streamable_block: u64) -> Result<Self, ConfigError> {
        let cfg = Self { bundle_size, first_streamable_block };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bundle_size == 0 {
            return Err(ConfigError::ZeroBundleSize);
        }
        if self.bundle_size > MAX_BUNDLE_SIZE {
            return Err(ConfigError::BundleSizeTooLarge(self.bundle_size));
        }
        Ok(())
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let display = path.display().to_string();
        let raw = std::fs::read(path)
            .map_err(|source| ConfigError::Read { path: display.clone(), source })?;
        let cfg: Self = serde_json::from_slice(&raw)
            .map_err(|source| ConfigError::Parse { path: display, source })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Whether `num` may open a bundle: a multiple of the bundle size or the
    /// chain's first streamable block.
    pub fn is_boundary(&self, num: u64) -> bool {
        num % self.bundle_size == 0 || num == self.first_streamable_block
    }

    /// How many blocks the bundle starting at `base` should hold.
    pub fn expected_block_count(&self, base: u64) -> u64 {
        let first_base = round_to_bundle_start(self.first_streamable_block, self.bundle_size);
        if base == first_base {
            self.bundle_size - (self.first_streamable_block - first_base)
        } else {
            self.bundle_size
        }
    }
}
