//! Shared application state and the session registry.

use crate::config::Config;
use crate::file_store::FileStore;
use crate::runner::Runner;
use crate::workspace::Workspaces;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

/// Bookkeeping for a session seen by this process.
#[derive(Debug, Default)]
struct Session {
    /// Held for the whole of any workspace-mutating operation.
    lock: Arc<Mutex<()>>,
    /// Content types reported by uploads, by file name.
    content_types: HashMap<String, String>,
}

impl Session {
    /// Nobody holds or waits on the lock and there is nothing to remember.
    fn idle(&self) -> bool {
        Arc::strong_count(&self.lock) == 1 && self.content_types.is_empty()
    }
}

type SessionMap = HashMap<String, Session>;

fn prune(sessions: &mut SessionMap, id: &str) {
    if sessions.get(id).is_some_and(Session::idle) {
        sessions.remove(id);
    }
}

/// Thread-safe session registry keyed by session id.
///
/// An entry lives only while its lock is in use or it carries upload
/// metadata, so ids that never store anything do not accumulate.
#[derive(Debug, Clone, Default)]
pub struct Sessions {
    inner: Arc<RwLock<SessionMap>>,
}

/// Exclusive hold on one session. Dropping it releases the lock and
/// forgets the session if nothing else refers to it.
pub struct SessionGuard {
    guard: Option<OwnedMutexGuard<()>>,
    sessions: Sessions,
    id: String,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.guard.take();
        match self.sessions.inner.try_write() {
            Ok(mut sessions) => prune(&mut sessions, &self.id),
            Err(_) => {
                let Ok(handle) = tokio::runtime::Handle::try_current() else {
                    return;
                };
                let sessions = self.sessions.clone();
                let id = std::mem::take(&mut self.id);
                handle.spawn(async move {
                    prune(&mut *sessions.inner.write().await, &id);
                });
            }
        }
    }
}

impl Sessions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the exclusive lock for `id`, registering the session if needed.
    ///
    /// Operations on one session are serialized; different sessions never
    /// wait on each other beyond the brief registry write.
    pub async fn lock(&self, id: &str) -> SessionGuard {
        let lock = {
            let mut sessions = self.inner.write().await;
            sessions.entry(id.to_string()).or_default().lock.clone()
        };
        SessionGuard {
            guard: Some(lock.lock_owned().await),
            sessions: self.clone(),
            id: id.to_string(),
        }
    }

    pub async fn record_content_type(&self, id: &str, name: &str, content_type: &str) {
        let mut sessions = self.inner.write().await;
        sessions
            .entry(id.to_string())
            .or_default()
            .content_types
            .insert(name.to_string(), content_type.to_string());
    }

    pub async fn content_type(&self, id: &str, name: &str) -> Option<String> {
        let sessions = self.inner.read().await;
        sessions
            .get(id)
            .and_then(|s| s.content_types.get(name).cloned())
    }

    pub async fn forget_file(&self, id: &str, name: &str) {
        let mut sessions = self.inner.write().await;
        if let Some(session) = sessions.get_mut(id) {
            session.content_types.remove(name);
        }
        prune(&mut sessions, id);
    }

    /// Drop everything known about `id`. A holder or waiter keeps the
    /// entry alive until it lets go.
    pub async fn reset(&self, id: &str) {
        let mut sessions = self.inner.write().await;
        if let Some(session) = sessions.get_mut(id) {
            session.content_types.clear();
        }
        prune(&mut sessions, id);
    }

    #[cfg(test)]
    pub(crate) async fn len(&self) -> usize {
        self.inner.read().await.len()
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub runner: Runner,
    pub files: FileStore,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let config = Arc::new(config);
        let workspaces = Workspaces::new(&config.sessions_dir, &config.uploads_dir);
        let sessions = Sessions::new();
        Self {
            runner: Runner::new(config.clone(), workspaces.clone(), sessions.clone()),
            files: FileStore::new(config.clone(), workspaces, sessions),
            config,
        }
    }
}
