use std::collections::{HashMap, VecDeque};
use std::time::Duration;

const WINDOW: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone)]
struct UsageEvent {
    at_ms: i64,
    success: bool,
    model: String,
}

/// In-memory sliding-window counters used by credential selection. The
/// request log is the persistent source of truth; these rings are a cache
/// seeded from it and advanced per outcome.
#[derive(Debug, Default)]
pub struct UsageCounters {
    rings: HashMap<String, VecDeque<UsageEvent>>,
}

impl UsageCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, project_id: &str, at_ms: i64, success: bool, model: &str) {
        let ring = self.rings.entry(project_id.to_string()).or_default();
        ring.push_back(UsageEvent {
            at_ms,
            success,
            model: model.to_string(),
        });
        Self::prune(ring, at_ms);
    }

    /// Requests (success or failure) within the trailing hour.
    pub fn count_within_window(&mut self, project_id: &str, now_ms: i64) -> usize {
        match self.rings.get_mut(project_id) {
            Some(ring) => {
                Self::prune(ring, now_ms);
                ring.len()
            }
            None => 0,
        }
    }

    /// Most recent use, 0 when never used. Failures count: a request was
    /// spent against the credential either way.
    pub fn last_used_at(&self, project_id: &str) -> i64 {
        self.rings
            .get(project_id)
            .and_then(|ring| ring.back())
            .map(|event| event.at_ms)
            .unwrap_or(0)
    }

    pub fn models_seen(&self, project_id: &str) -> Vec<String> {
        let mut models = Vec::new();
        if let Some(ring) = self.rings.get(project_id) {
            for event in ring {
                if !models.contains(&event.model) {
                    models.push(event.model.clone());
                }
            }
        }
        models
    }

    pub fn success_failure(&self, project_id: &str) -> (usize, usize) {
        match self.rings.get(project_id) {
            Some(ring) => {
                let success = ring.iter().filter(|event| event.success).count();
                (success, ring.len() - success)
            }
            None => (0, 0),
        }
    }

    fn prune(ring: &mut VecDeque<UsageEvent>, now_ms: i64) {
        let cutoff = now_ms - WINDOW.as_millis() as i64;
        while let Some(front) = ring.front() {
            if front.at_ms < cutoff {
                ring.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_prunes_after_an_hour() {
        let mut counters = UsageCounters::new();
        let start = 1_000_000_000_000;
        counters.record("p1", start, true, "m");
        counters.record("p1", start + 1000, true, "m");
        assert_eq!(counters.count_within_window("p1", start + 2000), 2);

        // 61 minutes later the first two fall out of the window.
        let later = start + 61 * 60 * 1000;
        assert_eq!(counters.count_within_window("p1", later), 0);
    }

    #[test]
    fn last_used_tracks_latest_event() {
        let mut counters = UsageCounters::new();
        assert_eq!(counters.last_used_at("p1"), 0);
        counters.record("p1", 100, true, "m1");
        counters.record("p1", 200, false, "m2");
        assert_eq!(counters.last_used_at("p1"), 200);
        assert_eq!(counters.success_failure("p1"), (1, 1));
        assert_eq!(counters.models_seen("p1"), vec!["m1", "m2"]);
    }
}
