//! Logical/physical core mapping and the reference cycle counter.
//!
//! Per-core telemetry is partitioned two ways:
//! - each *physical* core has exactly one **primary** logical thread that
//!   owns its frequency-counter slot (sibling hyperthreads would otherwise
//!   double-count into the same slot);
//! - exactly one **master** core package-wide performs one-time global
//!   actions such as re-dumping the canonical P-state table.
//!
//! The mapping fails closed: a logical id the topology does not know yields
//! no role, and the operation is skipped rather than risking an
//! out-of-bounds write into a per-core array.

use std::time::Instant;

use serde::Serialize;

/// Role of the logical core currently executing a rendezvous callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CoreRole {
    /// Logical core id (hardware thread).
    pub logical: u32,
    /// Physical core index in `[0, physical_count)`.
    pub physical: u32,
    /// Sole logical thread responsible for this physical core's telemetry.
    pub primary: bool,
    /// Sole core responsible for package-global one-time actions.
    pub master: bool,
}

/// Static core layout of a single package.
#[derive(Debug, Clone, Copy)]
pub struct CoreTopology {
    physical_count: u32,
    logical_count: u32,
}

impl CoreTopology {
    /// Build from known counts. `logical_count` must be a positive multiple
    /// of `physical_count` (1 or 2 threads per core on the parts in scope).
    pub fn new(physical_count: u32, logical_count: u32) -> Self {
        assert!(physical_count > 0 && logical_count >= physical_count);
        Self {
            physical_count,
            logical_count,
        }
    }

    /// Detect the running machine's layout.
    ///
    /// Logical count comes from the scheduler; the physical count divides
    /// out SMT siblings reported by sysfs. Falls back to no-SMT when sysfs
    /// is unavailable.
    pub fn detect() -> Self {
        let logical = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);
        let siblings = smt_siblings_per_core().unwrap_or(1).max(1);
        Self::new((logical / siblings).max(1), logical)
    }

    pub fn physical_count(&self) -> u32 {
        self.physical_count
    }

    pub fn logical_count(&self) -> u32 {
        self.logical_count
    }

    /// Map a logical core id to its role, or `None` for an id outside the
    /// package (fail closed, skip the operation).
    ///
    /// Layout convention: logical ids `[0, physical_count)` are the primary
    /// threads, ids `[physical_count, logical_count)` their SMT siblings in
    /// the same physical order. Core 0 is the master.
    pub fn role_of(&self, logical: u32) -> Option<CoreRole> {
        if logical >= self.logical_count {
            return None;
        }
        Some(CoreRole {
            logical,
            physical: logical % self.physical_count,
            primary: logical < self.physical_count,
            master: logical == 0,
        })
    }
}

fn smt_siblings_per_core() -> Option<u32> {
    let raw =
        std::fs::read_to_string("/sys/devices/system/cpu/cpu0/topology/thread_siblings_list")
            .ok()?;
    // Formats seen in the wild: "0,8" / "0-1" / "0".
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let count = if let Some((a, b)) = trimmed.split_once('-') {
        let a: u32 = a.parse().ok()?;
        let b: u32 = b.parse().ok()?;
        b.saturating_sub(a) + 1
    } else {
        trimmed.split(',').count() as u32
    };
    Some(count)
}

// ---------------------------------------------------------------------------
// Reference cycle counter
// ---------------------------------------------------------------------------

/// Monotonic cycle counter plus its calibrated frequency, used to convert
/// energy-counter deltas into wall-time power.
pub trait CycleCounter: Send + Sync {
    fn now_cycles(&self) -> u64;
    /// Counter frequency in Hz, captured once at startup.
    fn frequency_hz(&self) -> u64;
}

/// Time-stamp-counter implementation, calibrated against the OS clock once
/// at construction. The TSC on family 17h is invariant, so a single short
/// calibration window is sufficient.
pub struct TscCounter {
    frequency_hz: u64,
}

impl TscCounter {
    #[cfg(target_arch = "x86_64")]
    pub fn calibrate() -> Self {
        let t0 = Instant::now();
        let c0 = Self::rdtsc();
        std::thread::sleep(std::time::Duration::from_millis(20));
        let c1 = Self::rdtsc();
        let elapsed = t0.elapsed().as_secs_f64();
        let frequency_hz = ((c1.saturating_sub(c0)) as f64 / elapsed) as u64;
        Self { frequency_hz }
    }

    #[cfg(target_arch = "x86_64")]
    fn rdtsc() -> u64 {
        // SAFETY: RDTSC has no preconditions on x86_64.
        unsafe { core::arch::x86_64::_rdtsc() }
    }
}

#[cfg(target_arch = "x86_64")]
impl CycleCounter for TscCounter {
    fn now_cycles(&self) -> u64 {
        Self::rdtsc()
    }

    fn frequency_hz(&self) -> u64 {
        self.frequency_hz
    }
}

/// Portable fallback counter backed by [`Instant`], counting nanoseconds.
pub struct InstantCounter {
    origin: Instant,
}

impl InstantCounter {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for InstantCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl CycleCounter for InstantCounter {
    fn now_cycles(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }

    fn frequency_hz(&self) -> u64 {
        1_000_000_000
    }
}
