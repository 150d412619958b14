//! Non-blocking detection jobs.
//!
//! The scheduler starts at most one worker per running step and polls for its
//! outcome once per tick. Handoff goes through a single mutex-guarded slot: a
//! worker writes its result only while its token is still the current one, so
//! completions that lost a start/stop race are discarded under the lock.

use std::sync::{Arc, Mutex};

/// Identifies one detection job. Superseded tokens never write to the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobToken(u64);

/// What a detection worker resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum Detection {
    /// Template search: center position (when accepted) and confidence.
    Template {
        pos: Option<(u32, u32)>,
        confidence: f32,
    },
    /// Color search: blob centroid (when accepted) and contour area, or the
    /// probed pixel with area 1 in pixel-probe mode.
    Color { pos: Option<(u32, u32)>, area: f64 },
}

impl Detection {
    pub fn found(&self) -> bool {
        match self {
            Detection::Template { pos, .. } | Detection::Color { pos, .. } => pos.is_some(),
        }
    }
}

#[derive(Debug, Default)]
struct Slot {
    current: u64,
    busy: bool,
    result: Option<Detection>,
}

/// Owns the worker lifecycle and the shared result slot.
#[derive(Debug)]
pub struct DetectionService {
    slot: Arc<Mutex<Slot>>,
    next_token: u64,
}

impl DetectionService {
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Mutex::new(Slot::default())),
            next_token: 0,
        }
    }

    /// Spawn one blocking worker for the job. The caller must not start a new
    /// job while [`busy`](Self::busy) reports an outstanding one; it re-polls
    /// on the next tick instead.
    pub fn start<F>(&mut self, job: F) -> JobToken
    where
        F: FnOnce() -> Detection + Send + 'static,
    {
        self.next_token += 1;
        let token = self.next_token;

        {
            let mut slot = self.slot.lock().unwrap();
            slot.current = token;
            slot.busy = true;
            slot.result = None;
        }

        let slot = Arc::clone(&self.slot);
        tokio::task::spawn_blocking(move || {
            let outcome = job();
            let mut slot = slot.lock().unwrap();
            if slot.current == token {
                slot.result = Some(outcome);
                slot.busy = false;
            }
        });

        JobToken(token)
    }

    /// Whether a worker for the current token is still running.
    pub fn busy(&self) -> bool {
        self.slot.lock().unwrap().busy
    }

    /// Take a completed result, if one is waiting.
    pub fn poll(&self) -> Option<Detection> {
        self.slot.lock().unwrap().result.take()
    }

    /// Invalidate the current token and clear the slot. Any still-running
    /// worker becomes stale and its completion is dropped.
    pub fn cancel(&mut self) {
        self.next_token += 1;
        let mut slot = self.slot.lock().unwrap();
        slot.current = self.next_token;
        slot.busy = false;
        slot.result = None;
    }
}

impl Default for DetectionService {
    fn default() -> Self {
        Self::new()
    }
}
