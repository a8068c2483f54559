//! Self-heal and step instrumentation.
//!
//! Lightweight atomic counters, logged on increment so operators can follow
//! retries without a metrics backend.

use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::info;

/// Counters for step execution and self-heal activity.
#[derive(Debug, Default)]
pub struct WorkerMetrics {
    pub self_heal_attempts_total: AtomicUsize,
    pub self_heal_recovered_total: AtomicUsize,
    pub self_heal_exhausted_total: AtomicUsize,
    pub wall_timeout_total: AtomicUsize,
    pub idle_timeout_total: AtomicUsize,
    pub no_progress_total: AtomicUsize,
}

impl WorkerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_self_heal_attempt(&self, step_index: usize, attempt: u32, strategy: &str) {
        self.self_heal_attempts_total.fetch_add(1, Ordering::Relaxed);
        info!(step = step_index, attempt, strategy, "task.self_heal.attempt");
    }

    pub fn record_self_heal_recovered(&self, step_index: usize, attempt: u32) {
        self.self_heal_recovered_total
            .fetch_add(1, Ordering::Relaxed);
        info!(step = step_index, attempt, "task.self_heal.recovered");
    }

    pub fn record_self_heal_exhausted(&self, step_index: usize, attempt: u32) {
        self.self_heal_exhausted_total
            .fetch_add(1, Ordering::Relaxed);
        info!(step = step_index, attempt, "task.self_heal.exhausted");
    }

    pub fn record_wall_timeout(&self, step_index: usize, attempt: u32) {
        self.wall_timeout_total.fetch_add(1, Ordering::Relaxed);
        info!(step = step_index, attempt, "task.step.wall_timeout");
    }

    pub fn record_idle_timeout(&self, step_index: usize, attempt: u32) {
        self.idle_timeout_total.fetch_add(1, Ordering::Relaxed);
        info!(step = step_index, attempt, "task.step.idle_timeout");
    }

    pub fn record_no_progress(&self, step_index: usize, attempt: u32) {
        self.no_progress_total.fetch_add(1, Ordering::Relaxed);
        info!(step = step_index, attempt, "task.step.no_progress");
    }

    pub fn record_step_duration(&self, step_index: usize, attempt: u32, seconds: f64) {
        info!(
            step = step_index,
            attempt,
            duration_seconds = seconds,
            "task.step.duration"
        );
    }

    pub fn wall_timeouts(&self) -> usize {
        self.wall_timeout_total.load(Ordering::Relaxed)
    }

    pub fn idle_timeouts(&self) -> usize {
        self.idle_timeout_total.load(Ordering::Relaxed)
    }

    pub fn self_heal_attempts(&self) -> usize {
        self.self_heal_attempts_total.load(Ordering::Relaxed)
    }

    pub fn no_progress_trips(&self) -> usize {
        self.no_progress_total.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero() {
        let metrics = WorkerMetrics::new();
        assert_eq!(metrics.wall_timeouts(), 0);
        assert_eq!(metrics.idle_timeouts(), 0);
        assert_eq!(metrics.self_heal_attempts(), 0);
        assert_eq!(metrics.no_progress_trips(), 0);
    }

    #[test]
    fn increments_accumulate() {
        let metrics = WorkerMetrics::new();
        metrics.record_wall_timeout(0, 1);
        metrics.record_wall_timeout(1, 2);
        metrics.record_idle_timeout(0, 1);
        metrics.record_self_heal_attempt(0, 2, "soft_reset");
        metrics.record_no_progress(0, 2);
        assert_eq!(metrics.wall_timeouts(), 2);
        assert_eq!(metrics.idle_timeouts(), 1);
        assert_eq!(metrics.self_heal_attempts(), 1);
        assert_eq!(metrics.no_progress_trips(), 1);
    }
}
