use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::dispatch::request::AccessKind;
use crate::traffic::config::{PatternKind, TrafficConfig};

/// Deterministic address/op stream for one issuer.
#[derive(Debug, Clone)]
pub struct AddressPattern {
    kind: PatternKind,
    base: u64,
    span: u64,
    align: u64,
    stride: u64,
    write_ratio: f64,
    cursor: u64,
    rng: StdRng,
}

impl AddressPattern {
    pub fn new(config: &TrafficConfig) -> Self {
        let align = config.req_bytes.max(1) as u64;
        Self {
            kind: config.pattern,
            base: config.addr_min,
            span: config.addr_max.saturating_sub(config.addr_min),
            align,
            stride: config.stride.max(1),
            write_ratio: config.write_ratio.clamp(0.0, 1.0),
            cursor: 0,
            rng: StdRng::seed_from_u64(config.seed),
        }
    }

    pub fn next_access(&mut self) -> (u64, AccessKind) {
        let offset = match self.kind {
            PatternKind::Random => {
                let slots = self.span / self.align;
                if slots == 0 {
                    0
                } else {
                    self.rng.gen_range(0..slots) * self.align
                }
            }
            PatternKind::Sequential => {
                let offset = if self.span == 0 { 0 } else { self.cursor % self.span };
                self.cursor = self.cursor.wrapping_add(self.stride);
                offset
            }
        };
        let kind = if self.rng.gen_bool(self.write_ratio) {
            AccessKind::Write
        } else {
            AccessKind::Read
        };
        (self.base.saturating_add(offset), kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(pattern: PatternKind) -> TrafficConfig {
        TrafficConfig {
            pattern,
            addr_min: 0x1000,
            addr_max: 0x1100,
            stride: 0x40,
            ..TrafficConfig::default()
        }
    }

    #[test]
    fn sequential_wraps_inside_window() {
        let mut pattern = AddressPattern::new(&config(PatternKind::Sequential));
        let addrs: Vec<_> = (0..6).map(|_| pattern.next_access().0).collect();
        assert_eq!(vec![0x1000, 0x1040, 0x1080, 0x10c0, 0x1000, 0x1040], addrs);
    }

    #[test]
    fn random_stays_aligned_in_window() {
        let mut pattern = AddressPattern::new(&config(PatternKind::Random));
        for _ in 0..500 {
            let (addr, _) = pattern.next_access();
            assert!((0x1000..0x1100).contains(&addr), "{addr:#x}");
            assert_eq!(0, addr % 64);
        }
    }

    #[test]
    fn same_seed_same_stream() {
        let mut a = AddressPattern::new(&config(PatternKind::Random));
        let mut b = AddressPattern::new(&config(PatternKind::Random));
        for _ in 0..64 {
            assert_eq!(a.next_access(), b.next_access());
        }
    }

    #[test]
    fn write_ratio_extremes() {
        let mut reads = AddressPattern::new(&TrafficConfig {
            write_ratio: 0.0,
            ..config(PatternKind::Random)
        });
        let mut writes = AddressPattern::new(&TrafficConfig {
            write_ratio: 1.0,
            ..config(PatternKind::Random)
        });
        for _ in 0..32 {
            assert_eq!(AccessKind::Read, reads.next_access().1);
            assert_eq!(AccessKind::Write, writes.next_access().1);
        }
    }
}
