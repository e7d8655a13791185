//! Collector statistics

use std::time::Duration;

/// Collection statistics
#[derive(Debug, Clone)]
pub struct GcStats {
    /// Total number of reachability passes
    pub collections: usize,

    /// Total objects freed
    pub objects_freed: usize,

    /// Total bytes freed
    pub bytes_freed: usize,

    /// Total time spent marking
    pub total_mark_time: Duration,

    /// Last mark duration
    pub last_mark_time: Duration,

    /// Maximum mark duration
    pub max_mark_time: Duration,

    /// Total time spent in purge ticks
    pub total_purge_time: Duration,

    /// Objects found reachable by the last pass
    pub last_marked_count: usize,

    /// Objects found unreachable by the last pass
    pub last_unreachable_count: usize,

    /// Objects freed since the last pass
    pub purged_since_last_mark: usize,

    /// Barrier waves of the last pass
    pub last_waves: usize,

    /// Workers used by the last pass
    pub last_workers: usize,

    /// Weak references nulled since the last pass
    pub weak_references_cleared: usize,

    /// Clusters dissolved after passes, dead or invalidated
    pub clusters_dissolved: usize,

    /// Live objects after the last completed purge
    pub live_objects: usize,

    /// Live bytes after the last completed purge
    pub live_bytes: usize,
}

impl Default for GcStats {
    fn default() -> Self {
        Self {
            collections: 0,
            objects_freed: 0,
            bytes_freed: 0,
            total_mark_time: Duration::ZERO,
            last_mark_time: Duration::ZERO,
            max_mark_time: Duration::ZERO,
            total_purge_time: Duration::ZERO,
            last_marked_count: 0,
            last_unreachable_count: 0,
            purged_since_last_mark: 0,
            last_waves: 0,
            last_workers: 0,
            weak_references_cleared: 0,
            clusters_dissolved: 0,
            live_objects: 0,
            live_bytes: 0,
        }
    }
}

impl GcStats {
    /// Update after a reachability pass
    pub(crate) fn record_mark(
        &mut self,
        mark_time: Duration,
        marked: usize,
        unreachable: usize,
        waves: usize,
        workers: usize,
    ) {
        self.collections += 1;
        self.total_mark_time += mark_time;
        self.last_mark_time = mark_time;
        if mark_time > self.max_mark_time {
            self.max_mark_time = mark_time;
        }

        self.last_marked_count = marked;
        self.last_unreachable_count = unreachable;
        self.last_waves = waves;
        self.last_workers = workers;
        self.purged_since_last_mark = 0;
        self.weak_references_cleared = 0;
    }

    /// Update after a purge tick
    pub(crate) fn record_purge(&mut self, tick_time: Duration, freed: usize, freed_bytes: usize) {
        self.total_purge_time += tick_time;
        self.objects_freed += freed;
        self.bytes_freed += freed_bytes;
        self.purged_since_last_mark += freed;
    }

    /// Average mark duration
    pub fn avg_mark_time(&self) -> Duration {
        if self.collections == 0 {
            return Duration::ZERO;
        }
        self.total_mark_time / self.collections as u32
    }

    /// Share of the last pass's population that survived (0.0 to 1.0)
    pub fn survival_rate(&self) -> f64 {
        let population = self.last_marked_count + self.last_unreachable_count;
        if population == 0 {
            return 0.0;
        }
        self.last_marked_count as f64 / population as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_mark() {
        let mut stats = GcStats::default();
        stats.record_mark(Duration::from_millis(4), 30, 10, 1, 1);
        stats.record_mark(Duration::from_millis(2), 15, 5, 3, 4);

        assert_eq!(stats.collections, 2);
        assert_eq!(stats.last_mark_time, Duration::from_millis(2));
        assert_eq!(stats.max_mark_time, Duration::from_millis(4));
        assert_eq!(stats.avg_mark_time(), Duration::from_millis(3));
        assert_eq!(stats.survival_rate(), 0.75);
        assert_eq!(stats.last_workers, 4);
    }

    #[test]
    fn test_purge_counter_resets_on_mark() {
        let mut stats = GcStats::default();
        stats.record_purge(Duration::from_millis(1), 3, 96);
        assert_eq!(stats.purged_since_last_mark, 3);
        stats.record_mark(Duration::ZERO, 0, 0, 1, 1);
        assert_eq!(stats.purged_since_last_mark, 0);
        assert_eq!(stats.objects_freed, 3);
        assert_eq!(stats.bytes_freed, 96);
    }
}
