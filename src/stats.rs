use std::time::{Duration, Instant};

/// Receives phase timings and capacity warnings from a `group_by` invocation.
pub trait StatsSink {
    fn record(&mut self, phase: &'static str, elapsed: Duration);

    fn capacity_overflow(&mut self, _overflow: &CapacityOverflow) {}
}

/// Distinct grouping keys shared hash buckets and were merged into one output row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityOverflow {
    /// Number of non-empty buckets (output rows).
    pub groups: usize,
    pub capacity: usize,
    /// Tuples whose grouping key differs from their bucket's first tuple.
    /// Zero when key verification is disabled.
    pub aliased_tuples: u64,
}

pub const PHASE_PACK: &str = "pack";
pub const PHASE_BUILD_KEYS: &str = "build_groupby_key";
pub const PHASE_VERIFY_KEYS: &str = "verify_group_keys";
pub const PHASE_COUNT: &str = "count_group_num";
pub const PHASE_SCAN: &str = "scan";
pub const PHASE_AGGREGATE: &str = "aggregate";
pub const PHASE_MATERIALIZE: &str = "materialize";

#[derive(Debug, Default, Clone)]
pub struct PhaseTimings {
    phases: Vec<(&'static str, Duration)>,
    overflows: Vec<CapacityOverflow>,
}

impl PhaseTimings {
    pub fn new() -> PhaseTimings {
        PhaseTimings::default()
    }

    pub fn phases(&self) -> &[(&'static str, Duration)] {
        &self.phases
    }

    pub fn phase_names(&self) -> Vec<&'static str> {
        self.phases.iter().map(|&(name, _)| name).collect()
    }

    pub fn get(&self, phase: &str) -> Option<Duration> {
        self.phases
            .iter()
            .filter(|&&(name, _)| name == phase)
            .map(|&(_, elapsed)| elapsed)
            .reduce(|a, b| a + b)
    }

    pub fn total(&self) -> Duration {
        self.phases.iter().map(|&(_, elapsed)| elapsed).sum()
    }

    pub fn overflows(&self) -> &[CapacityOverflow] {
        &self.overflows
    }
}

impl StatsSink for PhaseTimings {
    fn record(&mut self, phase: &'static str, elapsed: Duration) {
        self.phases.push((phase, elapsed));
    }

    fn capacity_overflow(&mut self, overflow: &CapacityOverflow) {
        self.overflows.push(*overflow);
    }
}

pub struct NoopStats;

impl StatsSink for NoopStats {
    fn record(&mut self, _: &'static str, _: Duration) {}
}

pub(crate) struct PhaseTimer {
    start: Instant,
}

impl PhaseTimer {
    pub fn start() -> PhaseTimer {
        PhaseTimer { start: Instant::now() }
    }

    pub fn finish(self, phase: &'static str, stats: &mut dyn StatsSink) {
        let elapsed = self.start.elapsed();
        log::debug!("{} took {:?}", phase, elapsed);
        stats.record(phase, elapsed);
    }
}
