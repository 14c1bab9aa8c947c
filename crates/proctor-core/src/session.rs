use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError, TryLockError};

use chrono::{DateTime, Duration, Utc};
use image::DynamicImage;

/// Session-table size above which idle sessions are evicted.
const DEFAULT_CAPACITY: usize = 1000;
/// Idle time after which a session may be evicted.
const DEFAULT_RETENTION_SECS: i64 = 3600;

/// Capacity and retention policy for the session table.
#[derive(Debug, Clone)]
pub struct SessionPolicy {
    pub capacity: usize,
    pub retention: Duration,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            retention: Duration::seconds(DEFAULT_RETENTION_SECS),
        }
    }
}

/// Movement-tracking state of one live monitoring session.
///
/// `recent_scores` never exceeds the monitor's history capacity and
/// `consecutive_score` never drops below zero.
#[derive(Debug, Default)]
pub struct SessionMovementState {
    pub last_frame: Option<DynamicImage>,
    pub last_frame_at: Option<DateTime<Utc>>,
    pub last_detection_at: Option<DateTime<Utc>>,
    pub recent_scores: VecDeque<f64>,
    pub consecutive_score: f64,
}

impl SessionMovementState {
    /// Uninitialized until the first frame has been stored.
    pub fn is_tracking(&self) -> bool {
        self.last_frame.is_some()
    }

    /// Append a raw movement value, dropping the oldest beyond `capacity`.
    pub fn push_score(&mut self, raw: f64, capacity: usize) {
        self.recent_scores.push_back(raw);
        while self.recent_scores.len() > capacity.max(1) {
            self.recent_scores.pop_front();
        }
    }

    pub fn average_score(&self) -> f64 {
        if self.recent_scores.is_empty() {
            return 0.0;
        }
        self.recent_scores.iter().sum::<f64>() / self.recent_scores.len() as f64
    }
}

pub type SharedSession = Arc<Mutex<SessionMovementState>>;

/// Keyed, ephemeral session state.
///
/// Callers hold the per-session lock for the whole read-modify-write of a
/// frame; different sessions never contend beyond the brief table lookup.
pub trait SessionStore: Send + Sync {
    /// Fetch the session, creating an empty one if absent. Creating a session
    /// that would push the table over capacity first evicts idle sessions.
    fn entry(&self, session_id: &str, now: DateTime<Utc>) -> SharedSession;

    fn get(&self, session_id: &str) -> Option<SharedSession>;

    fn remove(&self, session_id: &str) -> bool;

    /// Drop every session idle beyond the retention window. Returns the
    /// number evicted.
    fn evict_expired(&self, now: DateTime<Utc>) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Table slot: the shared state plus the last time `entry` handed it out.
///
/// Idleness is judged on `touched`, which is stamped under the table lock,
/// so a session is never evicted between creation and its first frame.
struct Tracked {
    session: SharedSession,
    touched: DateTime<Utc>,
}

impl Tracked {
    fn is_idle(&self, now: DateTime<Utc>, retention: Duration) -> bool {
        now.signed_duration_since(self.touched) > retention
    }
}

/// Process-local session table.
pub struct InMemorySessionStore {
    policy: SessionPolicy,
    sessions: Mutex<HashMap<String, Tracked>>,
}

impl InMemorySessionStore {
    pub fn new(policy: SessionPolicy) -> Self {
        Self {
            policy,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &SessionPolicy {
        &self.policy
    }

    fn evict_locked(&self, sessions: &mut HashMap<String, Tracked>, now: DateTime<Utc>) -> usize {
        let before = sessions.len();
        sessions.retain(|_, tracked| match tracked.session.try_lock() {
            Ok(_) => !tracked.is_idle(now, self.policy.retention),
            // In use by a frame right now.
            Err(TryLockError::WouldBlock) => true,
            // A frame panicked mid-update; the state cannot be trusted.
            Err(TryLockError::Poisoned(_)) => false,
        });
        let evicted = before - sessions.len();
        if evicted > 0 {
            tracing::info!(evicted, remaining = sessions.len(), "evicted idle sessions");
        }
        evicted
    }
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new(SessionPolicy::default())
    }
}

impl SessionStore for InMemorySessionStore {
    fn entry(&self, session_id: &str, now: DateTime<Utc>) -> SharedSession {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tracked) = sessions.get_mut(session_id) {
            tracked.touched = tracked.touched.max(now);
            return Arc::clone(&tracked.session);
        }

        if sessions.len() >= self.policy.capacity {
            self.evict_locked(&mut sessions, now);
        }

        let session = SharedSession::default();
        sessions.insert(
            session_id.to_string(),
            Tracked {
                session: Arc::clone(&session),
                touched: now,
            },
        );
        tracing::debug!(session_id, tracked = sessions.len(), "session created");
        session
    }

    fn get(&self, session_id: &str) -> Option<SharedSession> {
        let sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        sessions
            .get(session_id)
            .map(|tracked| Arc::clone(&tracked.session))
    }

    fn remove(&self, session_id: &str) -> bool {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        sessions.remove(session_id).is_some()
    }

    fn evict_expired(&self, now: DateTime<Utc>) -> usize {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        self.evict_locked(&mut sessions, now)
    }

    fn len(&self) -> usize {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}
