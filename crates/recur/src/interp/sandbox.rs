use std::collections::{BTreeMap, HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::eval::{self, Limits};
use super::value::Value;
use super::{ExecError, InterpreterResult};
use crate::session::SessionManager;

/// Global output caps, applied to every profile.
pub const OUTPUT_CAP_BYTES: usize = 100 * 1024;
pub const OUTPUT_CAP_LINES: usize = 1000;

/// Grace period between the cooperative deadline and the hard join timeout.
const HARD_DEADLINE_GRACE: Duration = Duration::from_millis(500);

const CACHE_CAPACITY: usize = 128;

/// Resource preset for one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecProfile {
    /// Arithmetic and string ops.
    Quick,
    /// Data shaping.
    #[default]
    Default,
    /// Heavy computation.
    Analysis,
    /// Batch work.
    Extended,
}

impl ExecProfile {
    pub fn timeout(&self) -> Duration {
        match self {
            Self::Quick => Duration::from_secs(5),
            Self::Default => Duration::from_secs(30),
            Self::Analysis => Duration::from_secs(120),
            Self::Extended => Duration::from_secs(300),
        }
    }

    pub fn memory_cap(&self) -> u64 {
        match self {
            Self::Quick => 128 * 1024 * 1024,
            Self::Default => 512 * 1024 * 1024,
            Self::Analysis => 2 * 1024 * 1024 * 1024,
            Self::Extended => 4 * 1024 * 1024 * 1024,
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "quick" => Some(Self::Quick),
            "default" => Some(Self::Default),
            "analysis" => Some(Self::Analysis),
            "extended" => Some(Self::Extended),
            _ => None,
        }
    }
}

struct CacheEntry {
    result: InterpreterResult,
    post_vars: BTreeMap<String, Value>,
}

/// Memoizes successful executions by (code, session state snapshot),
/// evicting oldest-first once full.
#[derive(Default)]
struct ExecCache {
    entries: HashMap<u64, CacheEntry>,
    order: VecDeque<u64>,
}

impl ExecCache {
    fn get(&self, key: u64) -> Option<&CacheEntry> {
        self.entries.get(&key)
    }

    fn insert(&mut self, key: u64, entry: CacheEntry) {
        if self.entries.contains_key(&key) {
            return;
        }
        if self.entries.len() >= CACHE_CAPACITY
            && let Some(oldest) = self.order.pop_front()
        {
            self.entries.remove(&oldest);
        }
        self.entries.insert(key, entry);
        self.order.push_back(key);
    }
}

/// In-process restricted execution environment with persistent session
/// state. One sandbox is shared by all completions of an engine.
pub struct Sandbox {
    sessions: Arc<SessionManager>,
    cache: Mutex<ExecCache>,
}

impl Sandbox {
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self {
            sessions,
            cache: Mutex::new(ExecCache::default()),
        }
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Execute a code fragment in the named session (created on first
    /// use). `overrides` are merged into the session variables for this
    /// run only; bindings made by the code persist back on success.
    pub async fn execute(
        &self,
        code: &str,
        session_id: &str,
        profile: ExecProfile,
        overrides: Option<BTreeMap<String, Value>>,
    ) -> InterpreterResult {
        let session = self.sessions.get_or_create(session_id);
        let mut state = session.state.lock().await;

        let mut vars = state.variables.clone();
        if let Some(overrides) = overrides {
            vars.extend(overrides);
        }

        let key = cache_key(code, &vars);
        {
            let cache = self.cache.lock().expect("exec cache lock poisoned");
            if let Some(entry) = cache.get(key) {
                tracing::debug!(session = %session_id, "interpreter cache hit");
                state.variables = entry.post_vars.clone();
                session.touch();
                return entry.result.clone();
            }
        }

        let timeout = profile.timeout();
        let cancel = Arc::new(AtomicBool::new(false));
        let limits = Limits {
            deadline: Instant::now() + timeout,
            timeout_ms: timeout.as_millis() as u64,
            cancel: cancel.clone(),
            memory_cap: profile.memory_cap(),
            output_cap_bytes: OUTPUT_CAP_BYTES,
            output_cap_lines: OUTPUT_CAP_LINES,
        };

        let code_owned = code.to_string();
        let started = Instant::now();
        let handle = tokio::task::spawn_blocking(move || {
            let cpu_started = Instant::now();
            let outcome = eval::run(&code_owned, vars, limits);
            (outcome, cpu_started.elapsed())
        });

        let joined = tokio::time::timeout(timeout + HARD_DEADLINE_GRACE, handle).await;
        let execution_time_ms = started.elapsed().as_millis() as u64;

        let result = match joined {
            Ok(Ok((outcome, cpu_elapsed))) => {
                let error = outcome.error.as_ref().map(|e| e.to_string());
                let error_kind = outcome.error.as_ref().map(ExecError::kind);
                if outcome.error.is_none() {
                    state.variables = outcome.vars;
                }
                InterpreterResult {
                    stdout: outcome.stdout,
                    error,
                    error_kind,
                    execution_time_ms,
                    truncated: outcome.truncated,
                    memory_peak_bytes: Some(outcome.memory_peak),
                    cpu_time_ms: Some(cpu_elapsed.as_millis() as u64),
                }
            }
            Ok(Err(join_err)) => {
                tracing::error!(error = %join_err, "interpreter worker panicked");
                let err = ExecError::Runtime("internal error: interpreter worker died".into());
                InterpreterResult {
                    stdout: String::new(),
                    error: Some(err.to_string()),
                    error_kind: Some(err.kind()),
                    execution_time_ms,
                    truncated: false,
                    memory_peak_bytes: None,
                    cpu_time_ms: None,
                }
            }
            Err(_) => {
                // Hard deadline: the cooperative check was not reached in
                // time. Flag the worker so the detached thread unwinds.
                cancel.store(true, Ordering::Relaxed);
                let err = ExecError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                };
                InterpreterResult {
                    stdout: String::new(),
                    error: Some(err.to_string()),
                    error_kind: Some(err.kind()),
                    execution_time_ms,
                    truncated: false,
                    memory_peak_bytes: None,
                    cpu_time_ms: None,
                }
            }
        };

        session.touch();

        if result.error.is_none() {
            let mut cache = self.cache.lock().expect("exec cache lock poisoned");
            cache.insert(
                key,
                CacheEntry {
                    result: result.clone(),
                    post_vars: state.variables.clone(),
                },
            );
        }

        result
    }

    /// Read a single variable from a session without executing code.
    pub async fn read_variable(&self, session_id: &str, name: &str) -> Option<Value> {
        let session = self.sessions.get(session_id)?;
        let state = session.state.lock().await;
        session.touch();
        state.variables.get(name).cloned()
    }

    /// Names of all variables bound in a session.
    pub async fn variable_names(&self, session_id: &str) -> Vec<String> {
        match self.sessions.get(session_id) {
            Some(session) => {
                let state = session.state.lock().await;
                state.variables.keys().cloned().collect()
            }
            None => Vec::new(),
        }
    }

    /// Bind a variable in a session without executing code.
    pub async fn write_variable(&self, session_id: &str, name: &str, value: Value) {
        let session = self.sessions.get_or_create(session_id);
        let mut state = session.state.lock().await;
        state.variables.insert(name.to_string(), value);
        session.touch();
    }
}

/// Cache key over the code text and a canonical rendering of the variable
/// snapshot. Sessions holding non-representable values (functions) still
/// hash deterministically via their repr.
fn cache_key(code: &str, vars: &BTreeMap<String, Value>) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    code.hash(&mut hasher);
    for (name, value) in vars {
        name.hash(&mut hasher);
        value.to_repr().hash(&mut hasher);
    }
    hasher.finish()
}
