// ============================================
// Session Service
// ============================================
//
// Per-user session context for the temporal engine. One mutex guards the
// session map together with the engine, so a session update and its memory
// update are applied as one unit.

use crate::config::SessionConfig;
use crate::error::{AppError, Result};
use crate::models::{EventCode, EventKind, ScoredItem};
use crate::services::graph::temporal::unix_seconds;
use crate::services::tgn::TgnInference;
use crate::services::weighting::WeightPolicy;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::{debug, info};

/// Result of recording a session interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionAddOutcome {
    Recorded,
    /// Event type carries no signal; nothing recorded
    Ignored,
    /// Game not in the trained model
    UnknownItem,
    EngineNotLoaded,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionInteraction {
    pub item_id: String,
    pub timestamp: DateTime<Utc>,
    pub weight: f32,
    pub event: EventCode,
}

#[derive(Debug, Clone)]
struct Session {
    started_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    interaction_count: usize,
    recent: VecDeque<SessionInteraction>,
}

impl Session {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            started_at: now,
            last_activity: now,
            interaction_count: 0,
            recent: VecDeque::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionContext {
    pub user_id: String,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub interaction_count: usize,
    pub recent: Vec<SessionInteraction>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub active_sessions: usize,
    pub total_interactions: u64,
    pub live_memory_users: usize,
}

#[derive(Default)]
struct SessionState {
    sessions: HashMap<String, Session>,
    engine: Option<TgnInference>,
    total_interactions: u64,
}

impl SessionState {
    /// Removes the session and restores the user's memory row.
    fn close(&mut self, user_id: &str) -> bool {
        let existed = self.sessions.remove(user_id).is_some();
        if let Some(engine) = self.engine.as_mut() {
            if let Some(user) = engine.users().get(user_id) {
                engine.reset_user(user);
            }
        }
        existed
    }

    fn expire_if_idle(&mut self, user_id: &str, now: DateTime<Utc>, timeout: Duration) {
        let idle = self
            .sessions
            .get(user_id)
            .map_or(false, |s| now - s.last_activity > timeout);
        if idle {
            debug!(user_id, "Session expired");
            self.close(user_id);
        }
    }
}

pub struct SessionService {
    config: SessionConfig,
    policy: WeightPolicy,
    state: Mutex<SessionState>,
}

impl SessionService {
    pub fn new(config: SessionConfig, policy: WeightPolicy) -> Self {
        Self {
            config,
            policy,
            state: Mutex::new(SessionState::default()),
        }
    }

    fn timeout(&self) -> Duration {
        Duration::seconds(i64::try_from(self.config.timeout_secs).unwrap_or(i64::MAX))
    }

    /// Swaps in a freshly trained engine. Existing sessions refer to the
    /// previous model's memory and are dropped.
    pub fn install_engine(&self, engine: TgnInference) {
        let mut state = self.state.lock();
        let dropped = state.sessions.len();
        state.sessions.clear();
        state.engine = Some(engine);
        info!(dropped_sessions = dropped, "TGN engine installed");
    }

    pub fn has_engine(&self) -> bool {
        self.state.lock().engine.is_some()
    }

    /// Runs `f` against the installed engine under the session lock.
    pub fn with_engine<R>(&self, f: impl FnOnce(&TgnInference) -> R) -> Option<R> {
        self.state.lock().engine.as_ref().map(f)
    }

    pub fn add_interaction(
        &self,
        user_id: &str,
        item_id: &str,
        kind: EventKind,
        duration_secs: Option<f64>,
        at: DateTime<Utc>,
    ) -> Result<SessionAddOutcome> {
        let Some(event) = EventCode::from_kind(kind) else {
            return Ok(SessionAddOutcome::Ignored);
        };
        let weight = self.policy.event_weight(kind, duration_secs) as f32;

        let mut state = self.state.lock();
        let Some(engine) = state.engine.as_ref() else {
            return Ok(SessionAddOutcome::EngineNotLoaded);
        };
        let Some(item) = engine.items().get(item_id) else {
            return Ok(SessionAddOutcome::UnknownItem);
        };
        let capacity = engine.history_capacity().max(self.config.recent_exclusion);

        state.expire_if_idle(user_id, at, self.timeout());

        // Engine first: on error the session is left untouched
        if let Some(engine) = state.engine.as_mut() {
            if let Some(user) = engine.users().get(user_id) {
                engine.observe(user, item, event, weight, unix_seconds(at))?;
            }
        }

        let session = state
            .sessions
            .entry(user_id.to_string())
            .or_insert_with(|| Session::new(at));
        session.last_activity = session.last_activity.max(at);
        session.interaction_count += 1;
        session.recent.push_back(SessionInteraction {
            item_id: item_id.to_string(),
            timestamp: at,
            weight,
            event,
        });
        while session.recent.len() > capacity {
            session.recent.pop_front();
        }
        state.total_interactions += 1;

        debug!(user_id, item_id, weight, "Session interaction recorded");
        Ok(SessionAddOutcome::Recorded)
    }

    /// Recommendations as of `at`, excluding the session's most recent
    /// items in addition to `exclude`.
    pub fn recommendations(
        &self,
        user_id: &str,
        top_k: usize,
        exclude: &HashSet<String>,
        at: DateTime<Utc>,
    ) -> Result<Vec<ScoredItem>> {
        let mut state = self.state.lock();
        if state.engine.is_none() {
            return Err(AppError::NotComputed("TGN engine not loaded".to_string()));
        }
        state.expire_if_idle(user_id, at, self.timeout());

        let session = state
            .sessions
            .entry(user_id.to_string())
            .or_insert_with(|| Session::new(at));
        session.last_activity = session.last_activity.max(at);

        let mut excluded = exclude.clone();
        excluded.extend(
            session
                .recent
                .iter()
                .rev()
                .take(self.config.recent_exclusion)
                .map(|i| i.item_id.clone()),
        );

        match state.engine.as_ref() {
            Some(engine) => engine.get_recommendations(user_id, top_k, &excluded, unix_seconds(at)),
            None => Ok(Vec::new()),
        }
    }

    pub fn session_context(&self, user_id: &str, now: DateTime<Utc>) -> Option<SessionContext> {
        let mut state = self.state.lock();
        state.expire_if_idle(user_id, now, self.timeout());
        state.sessions.get(user_id).map(|s| SessionContext {
            user_id: user_id.to_string(),
            started_at: s.started_at,
            last_activity: s.last_activity,
            interaction_count: s.interaction_count,
            recent: s.recent.iter().cloned().collect(),
        })
    }

    /// Ends a session immediately. Returns whether one existed.
    pub fn end_session(&self, user_id: &str) -> bool {
        let ended = self.state.lock().close(user_id);
        if ended {
            info!(user_id, "Session ended");
        }
        ended
    }

    pub fn cleanup_expired_sessions(&self, now: DateTime<Utc>) -> usize {
        let timeout = self.timeout();
        let mut state = self.state.lock();
        let expired: Vec<String> = state
            .sessions
            .iter()
            .filter(|(_, s)| now - s.last_activity > timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for user_id in &expired {
            state.close(user_id);
        }
        if !expired.is_empty() {
            info!(removed = expired.len(), "Expired sessions cleaned up");
        }
        expired.len()
    }

    pub fn stats(&self) -> SessionStats {
        let state = self.state.lock();
        SessionStats {
            active_sessions: state.sessions.len(),
            total_interactions: state.total_interactions,
            live_memory_users: state.engine.as_ref().map_or(0, TgnInference::live_users),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::seeded_rng;
    use crate::services::graph::NodeIndex;
    use crate::services::tgn::tests::tiny_config;
    use crate::services::tgn::{MemoryState, TgnModel};

    fn engine() -> TgnInference {
        let model = TgnModel::new(tiny_config(), 2, 8, &mut seeded_rng(3));
        TgnInference::new(
            model,
            NodeIndex::from_ids(["alice".to_string(), "bob".to_string()]),
            NodeIndex::from_ids((0..8).map(|i| format!("g{i}"))),
            MemoryState::zeros(2, 6),
        )
    }

    fn service() -> SessionService {
        let service = SessionService::new(
            SessionConfig {
                timeout_secs: 60,
                recent_exclusion: 5,
            },
            WeightPolicy::default(),
        );
        service.install_engine(engine());
        service
    }

    #[test]
    fn test_outcomes() {
        let empty = SessionService::new(SessionConfig::default(), WeightPolicy::default());
        let now = Utc::now();
        assert_eq!(
            empty.add_interaction("alice", "g0", EventKind::Click, None, now).unwrap(),
            SessionAddOutcome::EngineNotLoaded
        );

        let service = service();
        assert_eq!(
            service.add_interaction("alice", "zzz", EventKind::Click, None, now).unwrap(),
            SessionAddOutcome::UnknownItem
        );
        assert_eq!(
            service.add_interaction("alice", "g0", EventKind::Unknown, None, now).unwrap(),
            SessionAddOutcome::Ignored
        );
        assert_eq!(
            service.add_interaction("alice", "g0", EventKind::Play, Some(120.0), now).unwrap(),
            SessionAddOutcome::Recorded
        );
        assert_eq!(service.stats().total_interactions, 1);
        assert_eq!(service.stats().live_memory_users, 1);
    }

    #[test]
    fn test_recent_items_excluded() {
        let service = service();
        let start = Utc::now();
        for i in 0..6 {
            let at = start + Duration::seconds(i);
            service
                .add_interaction("alice", &format!("g{i}"), EventKind::Click, None, at)
                .unwrap();
        }

        let recs = service
            .recommendations("alice", 8, &HashSet::new(), start + Duration::seconds(10))
            .unwrap();
        let ids: HashSet<String> = recs.iter().map(|r| r.id.clone()).collect();
        // g1..g5 are the last five; g0 has aged out of the window
        assert_eq!(recs.len(), 3);
        for i in 1..6 {
            assert!(!ids.contains(&format!("g{i}")));
        }
        assert!(ids.contains("g0"));
    }

    #[test]
    fn test_expiry_resets_memory_and_context() {
        let service = service();
        let start = Utc::now();
        service.add_interaction("bob", "g2", EventKind::Click, None, start).unwrap();
        assert!(service.session_context("bob", start).is_some());
        assert_eq!(service.stats().live_memory_users, 1);

        let later = start + Duration::seconds(120);
        assert!(service.session_context("bob", later).is_none());
        assert_eq!(service.stats().live_memory_users, 0);
    }

    #[test]
    fn test_end_session_and_cleanup() {
        let service = service();
        let start = Utc::now();
        service.add_interaction("alice", "g1", EventKind::Click, None, start).unwrap();
        service.add_interaction("bob", "g1", EventKind::Click, None, start).unwrap();
        service
            .add_interaction("guest", "g1", EventKind::Click, None, start + Duration::seconds(100))
            .unwrap();

        assert!(service.end_session("alice"));
        assert!(!service.end_session("alice"));
        assert_eq!(service.stats().live_memory_users, 1);

        let removed = service.cleanup_expired_sessions(start + Duration::seconds(90));
        assert_eq!(removed, 1);
        assert_eq!(service.stats().active_sessions, 1);
        assert_eq!(service.stats().live_memory_users, 0);
    }

    #[test]
    fn test_context_tracks_interactions() {
        let service = service();
        let start = Utc::now();
        service.add_interaction("alice", "g3", EventKind::Impression, None, start).unwrap();
        service
            .add_interaction("alice", "g4", EventKind::Play, None, start + Duration::seconds(5))
            .unwrap();

        let context = service.session_context("alice", start + Duration::seconds(6)).unwrap();
        assert_eq!(context.interaction_count, 2);
        assert_eq!(context.started_at, start);
        assert_eq!(context.recent.last().map(|i| i.item_id.as_str()), Some("g4"));
        assert!((context.recent[0].weight - 0.2).abs() < 1e-6);
    }
}
