use serde::Deserialize;
use smallvec::SmallVec;

use crate::dispatch::error::{ConfigError, DispatchError};
use crate::dispatch::request::Tier;

/// One contiguous window of physical addresses backed by a single tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct AddressRange {
    pub base: u64,
    pub size: u64,
    pub tier: Tier,
}

impl AddressRange {
    pub fn new(base: u64, size: u64, tier: Tier) -> Self {
        Self { base, size, tier }
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr - self.base < self.size
    }
}

/// Static address map.  Ranges are kept sorted by base so a lookup is a binary search.
#[derive(Debug, Clone)]
pub struct AddressDecoder {
    ranges: SmallVec<[AddressRange; 4]>,
}

impl AddressDecoder {
    pub fn new(ranges: &[AddressRange]) -> Result<Self, ConfigError> {
        if ranges.is_empty() {
            return Err(ConfigError::NoRanges);
        }
        let mut sorted: SmallVec<[AddressRange; 4]> = SmallVec::from_slice(ranges);
        for range in &sorted {
            if range.size == 0 {
                return Err(ConfigError::EmptyRange { base: range.base });
            }
            // the last byte must be addressable; a range may end exactly at 2^64
            if range.base.checked_add(range.size - 1).is_none() {
                return Err(ConfigError::RangeOverflow {
                    base: range.base,
                    size: range.size,
                });
            }
        }
        sorted.sort_by_key(|range| range.base);
        for pair in sorted.windows(2) {
            let (a, b) = (pair[0], pair[1]);
            if b.base - a.base < a.size {
                return Err(ConfigError::Overlap {
                    a_base: a.base,
                    a_end: a.base.saturating_add(a.size),
                    b_base: b.base,
                    b_end: b.base.saturating_add(b.size),
                });
            }
        }
        Ok(Self { ranges: sorted })
    }

    pub fn decode(&self, addr: u64) -> Result<Tier, DispatchError> {
        // last range whose base is <= addr
        let idx = self.ranges.partition_point(|range| range.base <= addr);
        idx.checked_sub(1)
            .map(|i| self.ranges[i])
            .filter(|range| range.contains(addr))
            .map(|range| range.tier)
            .ok_or(DispatchError::AddressOutOfRange { addr })
    }

    pub fn ranges(&self) -> &[AddressRange] {
        &self.ranges
    }

    /// Lowest base and highest (saturating) end across the map; what gets advertised upstream as
    /// the window this dispatcher answers for.
    pub fn span(&self) -> (u64, u64) {
        let start = self.ranges.first().map(|r| r.base).unwrap_or(0);
        let end = self
            .ranges
            .last()
            .map(|r| r.base.saturating_add(r.size))
            .unwrap_or(0);
        (start, end)
    }
}
