//! N+1 detection for lazy association access.
//!
//! Loading an association one owner at a time issues one query per owner.
//! The tracker counts lazy loads per (owner type, association) and warns
//! once a pair reaches the threshold, pointing at [`Session::eager`].
//!
//! ```ignore
//! for album in &albums {
//!     session.load(&cx, album, "artist").await;   // one query each
//! }
//! // fix: one query for every album
//! session.eager_load(&cx, &albums, &EagerTree::new().include("artist")).await;
//! ```
//!
//! [`Session::eager`]: crate::Session::eager

use std::collections::HashMap;
use std::time::Instant;

/// Call sites kept per tracker; older ones are dropped.
const MAX_CALL_SITES: usize = 64;

/// Where a lazy load was triggered.
#[derive(Debug, Clone)]
pub struct CallSite {
    pub owner_type: &'static str,
    pub association: &'static str,
    pub file: &'static str,
    pub line: u32,
    pub at: Instant,
}

/// Summary of recorded lazy loads.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct N1Stats {
    /// Lazy loads recorded.
    pub total_loads: usize,
    /// Distinct (owner type, association) pairs loaded lazily.
    pub associations_loaded: usize,
    /// Pairs at or above the threshold.
    pub potential_n1: usize,
}

/// Counts lazy loads per (owner type, association).
#[derive(Debug)]
pub struct N1QueryTracker {
    counts: HashMap<(&'static str, &'static str), usize>,
    threshold: usize,
    call_sites: Vec<CallSite>,
}

impl Default for N1QueryTracker {
    fn default() -> Self {
        Self::new(3)
    }
}

impl N1QueryTracker {
    /// Create a tracker that warns after `threshold` lazy loads of one
    /// association. A threshold of 0 is treated as 1.
    #[must_use]
    pub fn new(threshold: usize) -> Self {
        Self {
            counts: HashMap::new(),
            threshold: threshold.max(1),
            call_sites: Vec::new(),
        }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Record one lazy load, warning when the pair reaches the threshold.
    #[track_caller]
    pub fn record_load(&mut self, owner_type: &'static str, association: &'static str) {
        let count = self.counts.entry((owner_type, association)).or_insert(0);
        *count += 1;
        let count = *count;

        let caller = std::panic::Location::caller();
        if self.call_sites.len() == MAX_CALL_SITES {
            self.call_sites.remove(0);
        }
        self.call_sites.push(CallSite {
            owner_type,
            association,
            file: caller.file(),
            line: caller.line(),
            at: Instant::now(),
        });

        if count == self.threshold {
            self.warn(owner_type, association, count);
        }
    }

    fn warn(&self, owner_type: &'static str, association: &'static str, count: usize) {
        tracing::warn!(
            target: "rowgraph::n1",
            owner_type = owner_type,
            association = association,
            queries = count,
            threshold = self.threshold,
            "N+1 query pattern: load '{association}' for every {owner_type} with Session::eager instead"
        );
        for site in self
            .call_sites
            .iter()
            .filter(|s| s.owner_type == owner_type && s.association == association)
            .take(5)
        {
            tracing::debug!(
                target: "rowgraph::n1",
                file = site.file,
                line = site.line,
                "lazy load call site"
            );
        }
    }

    /// Lazy loads recorded for one pair.
    pub fn count_for(&self, owner_type: &str, association: &str) -> usize {
        self.counts
            .iter()
            .find(|((o, a), _)| *o == owner_type && *a == association)
            .map_or(0, |(_, c)| *c)
    }

    pub fn stats(&self) -> N1Stats {
        N1Stats {
            total_loads: self.counts.values().sum(),
            associations_loaded: self.counts.len(),
            potential_n1: self.counts.values().filter(|c| **c >= self.threshold).count(),
        }
    }

    /// Recent call sites, oldest first.
    pub fn call_sites(&self) -> &[CallSite] {
        &self.call_sites
    }

    /// Forget all counts and call sites.
    pub fn reset(&mut self) {
        self.counts.clear();
        self.call_sites.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_per_pair() {
        let mut tracker = N1QueryTracker::new(10);
        tracker.record_load("album", "artist");
        tracker.record_load("album", "artist");
        tracker.record_load("album", "tags");
        assert_eq!(tracker.count_for("album", "artist"), 2);
        assert_eq!(tracker.count_for("album", "tags"), 1);
        assert_eq!(tracker.count_for("artist", "albums"), 0);
    }

    #[test]
    fn test_stats_flag_pairs_at_threshold() {
        let mut tracker = N1QueryTracker::new(2);
        tracker.record_load("album", "artist");
        tracker.record_load("album", "artist");
        tracker.record_load("album", "tags");
        assert_eq!(
            tracker.stats(),
            N1Stats {
                total_loads: 3,
                associations_loaded: 2,
                potential_n1: 1,
            }
        );
    }

    #[test]
    fn test_call_sites_capture_location_and_are_bounded() {
        let mut tracker = N1QueryTracker::default();
        for _ in 0..(MAX_CALL_SITES + 5) {
            tracker.record_load("album", "artist");
        }
        assert_eq!(tracker.call_sites().len(), MAX_CALL_SITES);
        let site = &tracker.call_sites()[0];
        assert!(site.file.ends_with("n1_detection.rs"));
        assert!(site.line > 0);
        let sites = tracker.call_sites();
        assert!(sites[sites.len() - 1].at >= sites[0].at);
    }

    #[test]
    fn test_reset_and_zero_threshold() {
        let mut tracker = N1QueryTracker::new(0);
        assert_eq!(tracker.threshold(), 1);
        tracker.record_load("album", "artist");
        tracker.reset();
        assert_eq!(tracker.stats(), N1Stats::default());
        assert!(tracker.call_sites().is_empty());
    }
}
