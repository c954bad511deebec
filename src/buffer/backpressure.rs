//! Queue-depth backpressure gauge with hysteresis

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

/// Tracks whether the buffer is under pressure
///
/// Pressure switches on when depth reaches `pause_threshold` of capacity and
/// off only once depth falls to `resume_threshold`. Each transition is
/// logged exactly once.
#[derive(Debug)]
pub struct BackpressureGauge {
    capacity: usize,
    pause_at: usize,
    resume_at: usize,
    paused: AtomicBool,
}

impl BackpressureGauge {
    /// Create a gauge for a queue of `capacity` items
    pub fn new(capacity: usize, pause_threshold: f64, resume_threshold: f64) -> Self {
        Self {
            capacity,
            pause_at: ((capacity as f64 * pause_threshold).ceil() as usize).max(1),
            resume_at: (capacity as f64 * resume_threshold) as usize,
            paused: AtomicBool::new(false),
        }
    }

    /// Feed the current depth; returns whether the queue is under pressure
    pub fn observe(&self, depth: usize) -> bool {
        if depth >= self.pause_at {
            if self
                .paused
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                warn!(
                    depth,
                    capacity = self.capacity,
                    "buffer backpressure threshold reached"
                );
            }
            true
        } else if depth <= self.resume_at {
            if self
                .paused
                .compare_exchange(true, false, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                info!(depth, capacity = self.capacity, "buffer backpressure relieved");
            }
            false
        } else {
            self.paused.load(Ordering::Acquire)
        }
    }

    /// Last observed pressure state
    pub fn under_pressure(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Fraction of capacity in use at `depth`
    pub fn utilization(&self, depth: usize) -> f64 {
        if self.capacity == 0 {
            return 1.0;
        }
        depth as f64 / self.capacity as f64
    }

    /// Gauge status at `depth`
    pub fn status(&self, depth: usize) -> BackpressureStatus {
        BackpressureStatus {
            depth,
            capacity: self.capacity,
            pause_at: self.pause_at,
            resume_at: self.resume_at,
            under_pressure: self.under_pressure(),
        }
    }
}

/// Snapshot of the gauge
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackpressureStatus {
    /// Current depth
    pub depth: usize,
    /// Queue capacity
    pub capacity: usize,
    /// Depth at which pressure switches on
    pub pause_at: usize,
    /// Depth at which pressure switches off
    pub resume_at: usize,
    /// Whether pressure is on
    pub under_pressure: bool,
}
