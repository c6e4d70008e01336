//! Allocation instrumentation.
//!
//! Observers see every charge the allocator makes. They are a side channel:
//! nothing an observer does can change what the machine charges or executes.

use std::collections::BTreeMap;

/// One charge made by the allocator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AllocEvent {
    pub bytes: i64,
    pub objects: u64,
    pub kind: &'static str,
    /// Active functions, innermost first. Empty unless the observer asked for it.
    pub stack: Vec<String>,
}

pub trait AllocObserver {
    fn on_alloc(&mut self, event: &AllocEvent);

    /// Whether events should carry a stack snapshot.
    fn wants_stack(&self) -> bool {
        false
    }
}

/// Supplies the names of the active call frames.
pub trait StackProbe {
    /// `pkg.func` names, innermost first.
    fn stack(&self) -> Vec<String>;
}

/// Bytes and objects attributed to one function.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SiteTotals {
    pub bytes: i64,
    pub objects: u64,
}

/// Sampling profiler that attributes charges to the innermost function.
#[derive(Debug)]
pub struct AllocProfiler {
    rate: u64,
    seen: u64,
    sites: BTreeMap<String, SiteTotals>,
    samples: Vec<AllocEvent>,
}

impl AllocProfiler {
    /// Keeps one event in `rate`; a rate of 0 or 1 keeps all of them.
    pub fn new(rate: u64) -> Self {
        Self {
            rate: rate.max(1),
            seen: 0,
            sites: BTreeMap::new(),
            samples: Vec::new(),
        }
    }

    pub fn sites(&self) -> &BTreeMap<String, SiteTotals> {
        &self.sites
    }

    pub fn samples(&self) -> &[AllocEvent] {
        &self.samples
    }

    pub fn total_bytes(&self) -> i64 {
        self.sites.values().map(|s| s.bytes).sum()
    }
}

impl AllocObserver for AllocProfiler {
    fn on_alloc(&mut self, event: &AllocEvent) {
        self.seen += 1;
        if self.seen % self.rate != 0 {
            return;
        }
        let site = event
            .stack
            .first()
            .cloned()
            .unwrap_or_else(|| "<toplevel>".to_string());
        let totals = self.sites.entry(site).or_default();
        totals.bytes += event.bytes;
        totals.objects += event.objects;
        self.samples.push(event.clone());
    }

    fn wants_stack(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(bytes: i64, site: &str) -> AllocEvent {
        AllocEvent {
            bytes,
            objects: 1,
            kind: "array",
            stack: vec![site.to_string(), "main.main".to_string()],
        }
    }

    #[test]
    fn aggregates_by_innermost_frame() {
        let mut p = AllocProfiler::new(1);
        p.on_alloc(&event(10, "main.f"));
        p.on_alloc(&event(5, "main.f"));
        p.on_alloc(&event(7, "main.g"));
        assert_eq!(
            p.sites()["main.f"],
            SiteTotals {
                bytes: 15,
                objects: 2
            }
        );
        assert_eq!(p.total_bytes(), 22);
        assert_eq!(p.samples().len(), 3);
    }

    #[test]
    fn sampling_rate_skips_events() {
        let mut p = AllocProfiler::new(3);
        for _ in 0..7 {
            p.on_alloc(&event(1, "main.f"));
        }
        assert_eq!(p.samples().len(), 2);
    }

    #[test]
    fn empty_stack_is_toplevel() {
        let mut p = AllocProfiler::new(0);
        p.on_alloc(&AllocEvent {
            bytes: 4,
            objects: 0,
            kind: "string",
            stack: vec![],
        });
        assert_eq!(p.sites()["<toplevel>"].bytes, 4);
    }
}
