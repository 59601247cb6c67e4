//! Per-session serialization of mutating socket operations.
//!
//! Each session gets a lane: a FIFO-fair async mutex holding the start time
//! of the previous operation. An operation waits for the lane, then for the
//! minimum spacing to elapse, then runs while still holding the lane. Lanes
//! of different sessions never interact.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::Instant;

use switchboard_core::SessionId;

#[derive(Default)]
struct Lane {
    last_start: Mutex<Option<Instant>>,
}

pub struct TaskSerializer {
    spacing: Duration,
    lanes: DashMap<SessionId, Arc<Lane>>,
}

impl TaskSerializer {
    pub fn new(spacing: Duration) -> Self {
        Self {
            spacing,
            lanes: DashMap::new(),
        }
    }

    pub fn spacing(&self) -> Duration {
        self.spacing
    }

    /// Run `op` once every earlier operation queued for `session_id` has
    /// finished and the spacing since the previous start has elapsed.
    pub async fn run<F, T>(&self, session_id: &SessionId, op: F) -> T
    where
        F: Future<Output = T>,
    {
        let lane = self.lanes.entry(session_id.clone()).or_default().clone();

        let mut last_start = lane.last_start.lock().await;
        if let Some(prev) = *last_start {
            tokio::time::sleep_until(prev + self.spacing).await;
        }
        *last_start = Some(Instant::now());
        op.await
    }

    /// Drop the lane for a deleted session. Operations already waiting on it
    /// still run in order.
    pub fn forget(&self, session_id: &SessionId) {
        let _ = self.lanes.remove(session_id);
    }

    pub fn clear(&self) {
        self.lanes.clear();
    }

    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }
}
