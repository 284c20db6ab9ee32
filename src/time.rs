//! 32-bit device-time arithmetic.
//!
//! The radio exposes a 40-bit free-running counter ticking at the UWB
//! chip's native rate (≈ 4.0064 ns/tick, DS §8.2). We only ever schedule
//! against the upper 32 bits of it, so a full wrap takes place roughly
//! every 17 s. All comparisons must therefore use signed wraparound
//! subtraction rather than a plain `<`/`>`.

/// Approximate tick period, expressed in tenths of a picosecond to stay in
/// integer arithmetic: 1 tick ≈ 15650 * 2^-32 s ≈ 4.0064 ns.
pub const DWT_TIME_UNITS_PS_X10: u64 = 40_064;

/// A device-time instant: the upper 32 bits of the radio's free-running
/// counter. Wraps roughly every 17 seconds.
#[derive(Clone, Copy, PartialEq, Eq, Default, Debug, defmt::Format)]
pub struct DeviceTime32(pub u32);

impl DeviceTime32 {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub fn wrapping_add(self, delta: u32) -> Self {
        Self(self.0.wrapping_add(delta))
    }

    pub fn wrapping_sub(self, delta: u32) -> Self {
        Self(self.0.wrapping_sub(delta))
    }

    /// Signed difference `self - other`, matching the C idiom
    /// `(int32_t)(t2 - t1)`.
    pub fn diff(self, other: Self) -> i32 {
        self.0.wrapping_sub(other.0) as i32
    }

    /// True if `self` is strictly after `other` on the ~17s wraparound
    /// horizon (i.e. `self` is not more than half the counter range behind).
    pub fn after(self, other: Self) -> bool {
        self.diff(other) > 0
    }

    pub fn before(self, other: Self) -> bool {
        self.diff(other) < 0
    }

    /// Convert a microsecond duration into device-time ticks.
    pub const fn us_to_ticks(us: u32) -> u32 {
        // 1 us = 1_000_000 ps / 40.064 ps/tick(*10) -> ticks = us * 10_000_000 / DWT_TIME_UNITS_PS_X10
        ((us as u64) * 10_000_000 / DWT_TIME_UNITS_PS_X10) as u32
    }

    pub fn plus_us(self, us: u32) -> Self {
        self.wrapping_add(Self::us_to_ticks(us))
    }
}

impl core::ops::Add<u32> for DeviceTime32 {
    type Output = Self;
    fn add(self, rhs: u32) -> Self::Output {
        self.wrapping_add(rhs)
    }
}

impl core::ops::Sub<u32> for DeviceTime32 {
    type Output = Self;
    fn sub(self, rhs: u32) -> Self::Output {
        self.wrapping_sub(rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn after_handles_wraparound() {
        let near_wrap = DeviceTime32::new(u32::MAX - 10);
        let past_wrap = DeviceTime32::new(5);
        assert!(past_wrap.after(near_wrap));
        assert!(!near_wrap.after(past_wrap));
    }

    #[test]
    fn diff_is_signed() {
        let a = DeviceTime32::new(100);
        let b = DeviceTime32::new(150);
        assert_eq!(b.diff(a), 50);
        assert_eq!(a.diff(b), -50);
    }

    #[test]
    fn us_round_trip_is_approximately_linear() {
        let t0 = DeviceTime32::new(0);
        let t1 = t0.plus_us(1000);
        // 1000us should be roughly 1000 * 1e6 / 4.0064 ticks ~= 249_601 ticks
        assert!(t1.raw() > 249_000 && t1.raw() < 250_200);
    }
}
