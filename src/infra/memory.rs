//! Device memory tiering used to size in-memory caches.

use std::sync::OnceLock;

use sysinfo::System;
use tracing::debug;

const GIB: u64 = 1024 * 1024 * 1024;
const MIB: u64 = 1024 * 1024;

/// Coarse classification of physical memory on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryTier {
    /// Less than 4 GiB, or unknown.
    Low,
    /// 4 GiB up to 8 GiB.
    Medium,
    /// 8 GiB or more.
    High,
}

static DETECTED: OnceLock<MemoryTier> = OnceLock::new();

impl MemoryTier {
    /// Probe the host once and reuse the answer for the life of the process.
    pub fn detect() -> Self {
        *DETECTED.get_or_init(|| {
            let mut system = System::new();
            system.refresh_memory();
            let total = system.total_memory();
            let tier = Self::from_total_bytes(total);
            debug!(
                op = "memory_tier::detect",
                total_bytes = total,
                tier = ?tier,
                "Detected device memory tier"
            );
            tier
        })
    }

    pub fn from_total_bytes(total: u64) -> Self {
        match total {
            0 => MemoryTier::Low,
            bytes if bytes < 4 * GIB => MemoryTier::Low,
            bytes if bytes < 8 * GIB => MemoryTier::Medium,
            _ => MemoryTier::High,
        }
    }

    /// Maximum number of pooled block views.
    pub fn pool_capacity(self) -> usize {
        match self {
            MemoryTier::Low => 50,
            MemoryTier::Medium => 100,
            MemoryTier::High => 200,
        }
    }

    /// Decoded-bitmap budget for the in-memory image tier.
    pub fn image_memory_budget_bytes(self) -> u64 {
        match self {
            MemoryTier::Low => 50 * MIB,
            MemoryTier::Medium => 100 * MIB,
            MemoryTier::High => 200 * MIB,
        }
    }
}
