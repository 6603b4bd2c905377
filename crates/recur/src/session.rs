use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::interp::Value;

/// Persistent variable bindings for one interpreter session.
#[derive(Debug, Default)]
pub struct SessionState {
    pub variables: BTreeMap<String, Value>,
}

/// A named interpreter session. The state is behind a `tokio::sync::Mutex`
/// so a session is never executed in parallel with itself; distinct
/// sessions run independently.
pub struct Session {
    pub id: String,
    pub created_at: DateTime<Utc>,
    last_access: RwLock<DateTime<Utc>>,
    pub state: tokio::sync::Mutex<SessionState>,
}

impl Session {
    fn new(id: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            created_at: now,
            last_access: RwLock::new(now),
            state: tokio::sync::Mutex::new(SessionState::default()),
        }
    }

    pub fn last_access(&self) -> DateTime<Utc> {
        *self.last_access.read().expect("session lock poisoned")
    }

    pub fn touch(&self) {
        *self.last_access.write().expect("session lock poisoned") = Utc::now();
    }
}

/// Summary row for `list()`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
    pub variable_count: usize,
}

/// Owns interpreter sessions keyed by id, with TTL expiry and LRU eviction
/// above a configured cap.
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    ttl: Duration,
    max_sessions: usize,
}

impl SessionManager {
    pub fn new(ttl: Duration, max_sessions: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            ttl,
            max_sessions: max_sessions.max(1),
        }
    }

    /// Fetch a session, creating it if absent. Creation may evict the
    /// least-recently-used session to stay within the cap.
    pub fn get_or_create(&self, id: &str) -> Arc<Session> {
        {
            let sessions = self.sessions.read().expect("session map lock poisoned");
            if let Some(session) = sessions.get(id) {
                session.touch();
                return session.clone();
            }
        }

        let mut sessions = self.sessions.write().expect("session map lock poisoned");
        if let Some(session) = sessions.get(id) {
            session.touch();
            return session.clone();
        }

        if sessions.len() >= self.max_sessions {
            let lru = sessions
                .values()
                .min_by_key(|s| s.last_access())
                .map(|s| s.id.clone());
            if let Some(lru_id) = lru {
                tracing::debug!(session = %lru_id, "evicting least-recently-used session");
                sessions.remove(&lru_id);
            }
        }

        let session = Arc::new(Session::new(id.to_string()));
        sessions.insert(id.to_string(), session.clone());
        session
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions
            .read()
            .expect("session map lock poisoned")
            .get(id)
            .cloned()
    }

    /// Destroy a session. Returns true when it existed.
    pub fn destroy(&self, id: &str) -> bool {
        self.sessions
            .write()
            .expect("session map lock poisoned")
            .remove(id)
            .is_some()
    }

    /// Summaries of all live sessions, most recently used first.
    pub async fn list(&self) -> Vec<SessionInfo> {
        let sessions: Vec<Arc<Session>> = {
            let map = self.sessions.read().expect("session map lock poisoned");
            map.values().cloned().collect()
        };
        let mut infos = Vec::with_capacity(sessions.len());
        for session in sessions {
            let variable_count = session.state.lock().await.variables.len();
            infos.push(SessionInfo {
                id: session.id.clone(),
                created_at: session.created_at,
                last_access: session.last_access(),
                variable_count,
            });
        }
        infos.sort_by(|a, b| b.last_access.cmp(&a.last_access));
        infos
    }

    /// Spawn a background task that sweeps expired sessions on an
    /// interval. The task runs until the returned handle is aborted or the
    /// manager is dropped by every other holder.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let manager = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    return;
                };
                let evicted = manager.sweep();
                if evicted > 0 {
                    tracing::debug!(evicted, "session sweep evicted expired sessions");
                }
            }
        })
    }

    /// Drop sessions whose last access is older than the TTL. Returns the
    /// number evicted. Intended to run from a periodic sweep task.
    pub fn sweep(&self) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::hours(1));
        let mut sessions = self.sessions.write().expect("session map lock poisoned");
        let before = sessions.len();
        sessions.retain(|_, s| s.last_access() >= cutoff);
        before - sessions.len()
    }

    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .expect("session map lock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new(Duration::from_secs(3600), 32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_or_create_returns_same_session() {
        let manager = SessionManager::default();
        let a = manager.get_or_create("alpha");
        let b = manager.get_or_create("alpha");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(manager.len(), 1);
    }

    #[tokio::test]
    async fn destroy_removes_session() {
        let manager = SessionManager::default();
        manager.get_or_create("alpha");
        assert!(manager.destroy("alpha"));
        assert!(!manager.destroy("alpha"));
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn lru_eviction_over_cap() {
        let manager = SessionManager::new(Duration::from_secs(3600), 2);
        let first = manager.get_or_create("first");
        std::thread::sleep(std::time::Duration::from_millis(5));
        manager.get_or_create("second");
        std::thread::sleep(std::time::Duration::from_millis(5));
        first.touch();
        manager.get_or_create("third");

        // "second" was least recently used and gets evicted
        assert_eq!(manager.len(), 2);
        assert!(manager.get("first").is_some());
        assert!(manager.get("second").is_none());
        assert!(manager.get("third").is_some());
    }

    #[tokio::test]
    async fn sweep_evicts_expired_sessions() {
        let manager = SessionManager::new(Duration::from_millis(1), 8);
        manager.get_or_create("old");
        std::thread::sleep(std::time::Duration::from_millis(10));
        let evicted = manager.sweep();
        assert_eq!(evicted, 1);
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn sweeper_task_evicts_in_background() {
        let manager = Arc::new(SessionManager::new(Duration::from_millis(1), 8));
        manager.get_or_create("stale");
        std::thread::sleep(std::time::Duration::from_millis(5));

        let handle = manager.spawn_sweeper(Duration::from_millis(10));
        tokio::time::sleep(std::time::Duration::from_millis(60)).await;
        assert!(manager.is_empty());
        handle.abort();
    }

    #[tokio::test]
    async fn list_reports_variable_counts() {
        let manager = SessionManager::default();
        let session = manager.get_or_create("s");
        session
            .state
            .lock()
            .await
            .variables
            .insert("x".into(), Value::Int(1));
        let infos = manager.list().await;
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].id, "s");
        assert_eq!(infos[0].variable_count, 1);
    }
}
