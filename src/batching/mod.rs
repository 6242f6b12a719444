// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Batch accumulation for the dual write shapes.

pub mod accumulator;

pub use accumulator::{AccumulatorStats, BatchAccumulator, FlushReport};

use chrono::Utc;

/// Which of the two accumulated shapes a batch carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchKind {
    /// Ordered append to the global history list
    History,
    /// Per-device latest overwrite
    Latest,
}

impl BatchKind {
    /// Batch-id prefix for this kind.
    #[must_use]
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::History => "hist",
            Self::Latest => "latest",
        }
    }
}

impl std::fmt::Display for BatchKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.prefix())
    }
}

/// Generate a batch id: `<kind>_<epoch_ms>_<random>`.
///
/// The millisecond component keeps ids roughly sortable by creation time;
/// the random suffix disambiguates flushes within the same millisecond.
#[must_use]
pub fn generate_batch_id(kind: BatchKind) -> String {
    format!(
        "{}_{}_{:06x}",
        kind.prefix(),
        Utc::now().timestamp_millis(),
        rand::random::<u32>() & 0xff_ffff
    )
}
