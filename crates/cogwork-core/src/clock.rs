//! Tick counter, fixed-step accumulator and the state hash.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::fixed::{Fixed64, Ticks};

// ---------------------------------------------------------------------------
// WorldClock
// ---------------------------------------------------------------------------

/// Counts committed ticks and turns elapsed real time into whole ticks.
///
/// `advance` accumulates real time and reports how many fixed steps fit,
/// carrying the remainder forward. The tick counter itself only moves
/// through [`commit`](Self::commit), after a tick has fully committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorldClock {
    tick: Ticks,
    step: Duration,
    accumulator: Duration,
    paused: bool,
}

impl WorldClock {
    pub fn new(tick_rate: u32) -> Self {
        Self::starting_at(0, tick_rate)
    }

    pub fn starting_at(tick: Ticks, tick_rate: u32) -> Self {
        Self {
            tick,
            step: Duration::from_nanos(1_000_000_000 / u64::from(tick_rate.max(1))),
            accumulator: Duration::ZERO,
            paused: false,
        }
    }

    /// Last committed tick.
    pub fn tick(&self) -> Ticks {
        self.tick
    }

    pub fn step(&self) -> Duration {
        self.step
    }

    /// Time banked toward the next step.
    pub fn accumulated(&self) -> Duration {
        self.accumulator
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    /// Resume without replaying the time spent paused.
    pub fn resume(&mut self) {
        self.paused = false;
        self.accumulator = Duration::ZERO;
    }

    /// Bank `elapsed` and return how many ticks are now due. Paused clocks
    /// bank nothing.
    pub fn accumulate(&mut self, elapsed: Duration) -> u64 {
        if self.paused {
            return 0;
        }
        self.accumulator += elapsed;
        let due = self.accumulator.as_nanos() / self.step.as_nanos().max(1);
        let due = u64::try_from(due).unwrap_or(u64::MAX);
        self.accumulator -= self.step * u32::try_from(due).unwrap_or(u32::MAX);
        due
    }

    /// Give back ticks that were banked but could not run.
    pub fn refund(&mut self, ticks: u64) {
        self.accumulator += self.step * u32::try_from(ticks).unwrap_or(u32::MAX);
    }

    /// Record one more committed tick.
    pub fn commit(&mut self) -> Ticks {
        self.tick += 1;
        self.tick
    }
}

// ---------------------------------------------------------------------------
// State hash
// ---------------------------------------------------------------------------

/// FNV-1a (64-bit) over canonical state bytes, for desync detection.
/// Not cryptographic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StateHash(pub u64);

impl StateHash {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    pub fn new() -> Self {
        Self(Self::FNV_OFFSET)
    }

    pub fn of(bytes: &[u8]) -> Self {
        let mut h = Self::new();
        h.write(bytes);
        h
    }

    pub fn write(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.0 ^= b as u64;
            self.0 = self.0.wrapping_mul(Self::FNV_PRIME);
        }
    }

    pub fn write_u64(&mut self, v: u64) {
        self.write(&v.to_le_bytes());
    }

    pub fn write_u32(&mut self, v: u32) {
        self.write(&v.to_le_bytes());
    }

    pub fn write_fixed64(&mut self, v: Fixed64) {
        self.write(&v.to_bits().to_le_bytes());
    }

    pub fn finish(self) -> u64 {
        self.0
    }
}

impl Default for StateHash {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for StateHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}
