//! Absolute simulated time and the femtosecond/cycle conversion used to keep
//! heterogeneous clock domains comparable on one priority queue.
//!
//! The reference engine keys its event queue by a floating-point
//! "microseconds since start" value. Floating point time does not implement
//! `Ord`, and repeated `delta_cycles / freq` divisions drift under
//! accumulation, so here time is an integer count of femtoseconds
//! (`1e-15 s`). A module's clock period in femtoseconds is
//! `1_000_000_000 / frequency_mhz`, which is exact for the clean divisors
//! used throughout the test suite (1000, 500, 250 MHz, ...) and rounds down
//! by at most one femtosecond otherwise — far below any cycle boundary.

use std::fmt;
use std::ops::{Add, Sub};

/// Femtoseconds since simulation start. Wraps a `u64` so the event queue can
/// order by plain integer comparison instead of `f64`, which has no total
/// order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SimTime(u64);

impl SimTime {
    pub const ZERO: SimTime = SimTime(0);

    pub const fn from_fs(fs: u64) -> Self {
        SimTime(fs)
    }

    pub const fn as_fs(self) -> u64 {
        self.0
    }

    pub fn checked_add(self, delta: u64) -> Self {
        SimTime(self.0.saturating_add(delta))
    }
}

impl Add<u64> for SimTime {
    type Output = SimTime;
    fn add(self, rhs: u64) -> SimTime {
        SimTime(self.0 + rhs)
    }
}

impl Sub for SimTime {
    type Output = u64;
    fn sub(self, rhs: SimTime) -> u64 {
        self.0.saturating_sub(rhs.0)
    }
}

impl fmt::Display for SimTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}fs", self.0)
    }
}

/// Clock period of a module running at `frequency_mhz`, in femtoseconds.
///
/// `frequency_mhz` is cycles per microsecond, so one cycle takes
/// `1_000_000_000 / frequency_mhz` femtoseconds.
pub fn period_fs(frequency_mhz: u32) -> u64 {
    debug_assert!(frequency_mhz > 0, "module frequency must be positive");
    1_000_000_000u64 / frequency_mhz as u64
}

/// Convert a cycle delta at `frequency_mhz` into a femtosecond duration.
pub fn cycles_to_fs(delta_cycles: u64, frequency_mhz: u32) -> u64 {
    delta_cycles.saturating_mul(period_fs(frequency_mhz))
}

/// The cycle a module at `frequency_mhz` has reached once its clock has run
/// for `time` since simulation start, rounded up to match the reference
/// engine's `math.ceil(event_time * freq)`.
pub fn fs_to_cycle(time: SimTime, frequency_mhz: u32) -> u64 {
    let fs = time.as_fs() as u128;
    let freq = frequency_mhz as u128;
    let numerator = fs * freq;
    let denom = 1_000_000_000u128;
    ((numerator + denom - 1) / denom) as u64
}
