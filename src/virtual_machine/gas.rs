//! Gas metering.
//!
//! The machine never decides on its own when an execution has run too long:
//! every opcode and every collection visit is converted into gas and handed to
//! a [`GasMeter`] supplied by the caller. A meter refusing a charge is the only
//! cancellation primitive; its error propagates out of the machine unchanged.

use crate::virtual_machine::errors::VMError;

/// Number of gas categories tracked by [`GasProfile`].
const GAS_CATEGORY_COUNT: usize = 3;

/// Gas charged per CPU cycle of an opcode.
pub const GAS_FACTOR_CPU: u64 = 1;

/// Categories of gas consumption, used as the `reason` of a charge.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum GasCategory {
    /// Per-opcode CPU cycles.
    OpcodeCpu = 0,
    /// Visits performed by a deep collection pass.
    GarbageCollection = 1,
    /// Per-element work done inside host-implemented builtins.
    NativeCall = 2,
}

impl GasCategory {
    pub const fn as_str(&self) -> &'static str {
        match self {
            GasCategory::OpcodeCpu => "Opcode CPU",
            GasCategory::GarbageCollection => "Garbage Collection",
            GasCategory::NativeCall => "Native Call",
        }
    }

    /// All categories in discriminant order.
    const ALL: [GasCategory; GAS_CATEGORY_COUNT] = [
        GasCategory::OpcodeCpu,
        GasCategory::GarbageCollection,
        GasCategory::NativeCall,
    ];
}

/// Gas consumption profile, one bucket per [`GasCategory`].
#[derive(Clone, Debug)]
pub struct GasProfile {
    counts: [u64; GAS_CATEGORY_COUNT],
}

impl Default for GasProfile {
    fn default() -> Self {
        Self {
            counts: [0; GAS_CATEGORY_COUNT],
        }
    }
}

impl GasProfile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds gas to the specified category.
    #[inline(always)]
    pub fn add(&mut self, category: GasCategory, amount: u64) {
        let slot = &mut self.counts[category as usize];
        *slot = slot.saturating_add(amount);
    }

    /// Returns the gas recorded for one category.
    pub fn get(&self, category: GasCategory) -> u64 {
        self.counts[category as usize]
    }

    /// Returns the total gas across all categories.
    pub fn total(&self) -> u64 {
        self.counts
            .iter()
            .fold(0u64, |acc, &v| acc.saturating_add(v))
    }

    /// Returns an iterator over all categories and their gas costs.
    pub fn iter(&self) -> impl Iterator<Item = (GasCategory, u64)> {
        GasCategory::ALL.into_iter().zip(self.counts)
    }
}

/// Budget consumed by a running machine.
pub trait GasMeter {
    /// Charges `amount`; fails once the budget is exhausted.
    fn consume(&mut self, amount: u64, reason: GasCategory) -> Result<(), VMError>;

    /// Gas consumed so far.
    fn consumed(&self) -> u64;

    /// Upper bound on [`consumed`](GasMeter::consumed), `u64::MAX` when unbounded.
    fn limit(&self) -> u64;

    /// Gas left before the meter refuses charges.
    fn remaining(&self) -> u64 {
        self.limit().saturating_sub(self.consumed())
    }
}

/// Meter with a fixed limit and a per-category profile.
#[derive(Clone, Debug)]
pub struct BasicGasMeter {
    limit: u64,
    used: u64,
    profile: GasProfile,
}

impl BasicGasMeter {
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            used: 0,
            profile: GasProfile::new(),
        }
    }

    pub fn profile(&self) -> &GasProfile {
        &self.profile
    }
}

impl GasMeter for BasicGasMeter {
    fn consume(&mut self, amount: u64, reason: GasCategory) -> Result<(), VMError> {
        let used = self.used.saturating_add(amount);
        if used > self.limit {
            // A refused charge leaves the meter exhausted.
            self.profile.add(reason, self.limit - self.used);
            self.used = self.limit;
            return Err(VMError::OutOfGas {
                reason: reason.as_str(),
                used,
                limit: self.limit,
            });
        }
        self.used = used;
        self.profile.add(reason, amount);
        Ok(())
    }

    fn consumed(&self) -> u64 {
        self.used
    }

    fn limit(&self) -> u64 {
        self.limit
    }
}

/// Meter that records usage but never runs out; for trusted evaluation.
#[derive(Clone, Debug, Default)]
pub struct InfiniteGasMeter {
    used: u64,
}

impl GasMeter for InfiniteGasMeter {
    fn consume(&mut self, amount: u64, _reason: GasCategory) -> Result<(), VMError> {
        self.used = self.used.saturating_add(amount);
        Ok(())
    }

    fn consumed(&self) -> u64 {
        self.used
    }

    fn limit(&self) -> u64 {
        u64::MAX
    }
}

/// Default gas limit for a single execution.
pub const EXECUTION_GAS_LIMIT: u64 = 30_000_000;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_meter_charges_until_limit() {
        let mut meter = BasicGasMeter::new(100);
        meter.consume(60, GasCategory::OpcodeCpu).unwrap();
        meter.consume(40, GasCategory::GarbageCollection).unwrap();
        assert_eq!(meter.consumed(), 100);
        assert_eq!(meter.remaining(), 0);
        assert_eq!(meter.profile().get(GasCategory::OpcodeCpu), 60);
        assert_eq!(meter.profile().get(GasCategory::GarbageCollection), 40);
    }

    #[test]
    fn basic_meter_fails_past_limit() {
        let mut meter = BasicGasMeter::new(10);
        meter.consume(8, GasCategory::OpcodeCpu).unwrap();
        let err = meter.consume(5, GasCategory::OpcodeCpu).unwrap_err();
        assert!(matches!(
            err,
            VMError::OutOfGas {
                used: 13,
                limit: 10,
                ..
            }
        ));
        assert_eq!(meter.consumed(), 10);
        assert_eq!(meter.profile().total(), 10);
    }

    #[test]
    fn infinite_meter_never_fails() {
        let mut meter = InfiniteGasMeter::default();
        meter.consume(u64::MAX, GasCategory::OpcodeCpu).unwrap();
        meter.consume(1, GasCategory::NativeCall).unwrap();
        assert_eq!(meter.consumed(), u64::MAX);
        assert_eq!(meter.limit(), u64::MAX);
    }

    #[test]
    fn profile_iterates_in_discriminant_order() {
        let mut profile = GasProfile::new();
        profile.add(GasCategory::NativeCall, 3);
        let collected: Vec<_> = profile.iter().collect();
        assert_eq!(collected.len(), GAS_CATEGORY_COUNT);
        assert_eq!(collected[2], (GasCategory::NativeCall, 3));
        assert_eq!(collected[0], (GasCategory::OpcodeCpu, 0));
    }
}
