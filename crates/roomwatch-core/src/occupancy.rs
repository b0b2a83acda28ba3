//! Room occupancy state machine.
//!
//! State transitions:
//! - EMPTY → OCCUPIED: a processed frame contains at least one face
//! - OCCUPIED → EMPTY: a processed frame contains no face AND more than
//!   `no_face_timeout` has passed since the last face was seen
//!
//! Any face counts as presence, known or not.

use std::time::{Duration, Instant};

/// Default debounce before an occupied room is considered empty again.
pub const DEFAULT_NO_FACE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RoomState {
    #[default]
    Empty,
    Occupied,
}

/// Transition reported by [`OccupancyTracker::observe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OccupancyEvent {
    Entered,
    Vacated,
}

#[derive(Debug, Clone)]
pub struct OccupancyTracker {
    state: RoomState,
    last_face_seen_at: Option<Instant>,
    no_face_timeout: Duration,
}

impl Default for OccupancyTracker {
    fn default() -> Self {
        Self::new(DEFAULT_NO_FACE_TIMEOUT)
    }
}

impl OccupancyTracker {
    pub fn new(no_face_timeout: Duration) -> Self {
        Self {
            state: RoomState::Empty,
            last_face_seen_at: None,
            no_face_timeout,
        }
    }

    pub fn state(&self) -> RoomState {
        self.state
    }

    pub fn last_face_seen_at(&self) -> Option<Instant> {
        self.last_face_seen_at
    }

    /// Feed the face count of one processed frame captured at `now`.
    pub fn observe(&mut self, faces: usize, now: Instant) -> Option<OccupancyEvent> {
        if faces > 0 {
            self.last_face_seen_at = Some(now);
            if self.state == RoomState::Empty {
                self.state = RoomState::Occupied;
                return Some(OccupancyEvent::Entered);
            }
            return None;
        }

        let last_seen = self.last_face_seen_at?;
        if now.saturating_duration_since(last_seen) <= self.no_face_timeout {
            return None;
        }

        let was_occupied = self.state == RoomState::Occupied;
        self.state = RoomState::Empty;
        was_occupied.then_some(OccupancyEvent::Vacated)
    }
}
