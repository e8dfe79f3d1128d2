//! Session registry.
//!
//! One [`SessionRegistry`] exists per process. It is built by the composition
//! root and shared as `Arc<SessionRegistry>`; there is no global instance.
//! All state sits behind a single mutex that is never held across an await.

mod children;
mod table;

pub use children::ChildSessionRegistry;
pub use table::SessionTable;

use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::{
    cleanup::{CleanupCoordinator, DisconnectCleanup},
    session::Session,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct SessionCounts {
    pub total: usize,
    pub parents: usize,
    pub children: usize,
}

#[derive(Debug, Default)]
struct RegistryState {
    sessions: SessionTable,
    relationships: ChildSessionRegistry,
    default_session_id: Option<String>,
}

pub struct SessionRegistry {
    state: Mutex<RegistryState>,
    cleanup: Arc<dyn CleanupCoordinator>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(Arc::new(DisconnectCleanup::default()))
    }
}

impl SessionRegistry {
    pub fn new(cleanup: Arc<dyn CleanupCoordinator>) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            cleanup,
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register_session(&self, session: Arc<Session>) {
        let id = session.id().to_string();
        let previous = self.lock().sessions.insert(session);
        if previous.is_some() {
            tracing::warn!("Session {} was registered twice; replacing previous entry", id);
        } else {
            tracing::info!("Registered session {}", id);
        }
    }

    /// Removing an unknown id is a no-op.
    pub fn unregister_session(&self, session_id: &str) -> Option<Arc<Session>> {
        let mut state = self.lock();
        let removed = state.sessions.remove(session_id);
        if removed.is_some() {
            if state.default_session_id.as_deref() == Some(session_id) {
                state.default_session_id = None;
            }
            tracing::info!("Unregistered session {}", session_id);
        }
        removed
    }

    pub fn get_session(&self, session_id: &str) -> Option<Arc<Session>> {
        self.lock().sessions.get(session_id).cloned()
    }

    pub fn get_all_sessions(&self) -> Vec<Arc<Session>> {
        self.lock().sessions.iter().cloned().collect()
    }

    pub fn get_sessions_by_language(&self, language: &str) -> Vec<Arc<Session>> {
        self.lock()
            .sessions
            .iter()
            .filter(|s| s.language() == language)
            .cloned()
            .collect()
    }

    pub fn count_sessions(&self) -> SessionCounts {
        let state = self.lock();
        let children = state.sessions.iter().filter(|s| s.is_child()).count();
        SessionCounts {
            total: state.sessions.len(),
            parents: state.sessions.len() - children,
            children,
        }
    }

    pub fn register_parent_child(&self, parent_id: &str, child_id: &str) {
        self.lock().relationships.register_parent_child(parent_id, child_id);
    }

    pub fn get_children(&self, parent_id: &str) -> Vec<Arc<Session>> {
        let state = self.lock();
        state.relationships.get_children(parent_id, &state.sessions)
    }

    pub fn get_child_ids(&self, parent_id: &str) -> Vec<String> {
        self.lock().relationships.get_child_ids(parent_id).to_vec()
    }

    pub fn has_children(&self, parent_id: &str) -> bool {
        self.lock().relationships.has_children(parent_id)
    }

    pub fn set_active_child(&self, parent_id: &str, child_id: &str) {
        self.lock().relationships.set_active_child(parent_id, child_id);
        tracing::debug!("Active child of {} is now {}", parent_id, child_id);
    }

    pub fn get_active_child(&self, parent_id: &str) -> Option<String> {
        self.lock()
            .relationships
            .get_active_child(parent_id)
            .map(str::to_string)
    }

    pub fn remove_parent_child_mapping(&self, parent_id: &str) {
        self.lock().relationships.remove_parent_child_mapping(parent_id);
    }

    pub fn resolve_active_session(&self, session: &Arc<Session>) -> Arc<Session> {
        let state = self.lock();
        state.relationships.resolve_active_session(session, &state.sessions)
    }

    pub fn get_active_session(&self, language: &str) -> Option<Arc<Session>> {
        let state = self.lock();
        state
            .relationships
            .get_active_session_for_language(language, &state.sessions)
    }

    /// Marks a registered session as the target for commands that name none.
    /// Returns `false` when the id is not registered.
    pub fn set_default_session(&self, session_id: &str) -> bool {
        let mut state = self.lock();
        if !state.sessions.contains(session_id) {
            return false;
        }
        state.default_session_id = Some(session_id.to_string());
        true
    }

    pub fn default_session(&self) -> Option<Arc<Session>> {
        let state = self.lock();
        state
            .default_session_id
            .as_deref()
            .and_then(|id| state.sessions.get(id))
            .cloned()
    }

    pub fn clear_default_session(&self) {
        self.lock().default_session_id = None;
    }

    /// Tears down `session_id` and its live children, children first, then
    /// drops them from the table and the relationship maps. Returns `false`
    /// for an unknown id.
    pub async fn cleanup_session(&self, session_id: &str) -> bool {
        let targets = {
            let state = self.lock();
            let Some(session) = state.sessions.get(session_id).cloned() else {
                tracing::debug!("Cleanup requested for unknown session {}", session_id);
                return false;
            };
            let mut targets = state.relationships.get_children(session_id, &state.sessions);
            targets.push(session);
            targets
        };

        for target in &targets {
            if let Err(e) = self.cleanup.cleanup_session(target).await {
                tracing::warn!("Cleanup of session {} failed: {}", target.id(), e);
            }
        }

        let mut state = self.lock();
        for target in &targets {
            state.sessions.remove(target.id());
            state.relationships.remove_parent_child_mapping(target.id());
            state.relationships.forget_child(target.id());
            if state.default_session_id.as_deref() == Some(target.id()) {
                state.default_session_id = None;
            }
        }
        tracing::info!("Cleaned up session {} ({} sessions removed)", session_id, targets.len());
        true
    }

    /// Tears down every session, children before parents, and empties the
    /// registry.
    pub async fn cleanup_all(&self) {
        let ordered: Vec<Arc<Session>> = {
            let state = self.lock();
            let children = state.sessions.iter().filter(|s| s.is_child());
            let parents = state.sessions.iter().filter(|s| !s.is_child());
            children.chain(parents).cloned().collect()
        };

        if let Err(e) = self.cleanup.cleanup_all(&ordered).await {
            tracing::warn!("Cleanup of all sessions failed: {}", e);
        }

        let mut state = self.lock();
        for session in &ordered {
            state.sessions.remove(session.id());
        }
        state.relationships.clear();
        state.default_session_id = None;
        tracing::info!("Cleaned up {} sessions", ordered.len());
    }

    /// Clears every table without running cleanup. Test isolation only.
    #[cfg(any(test, feature = "test-support"))]
    pub fn reset(&self) {
        let mut state = self.lock();
        state.sessions.clear();
        state.relationships.clear();
        state.default_session_id = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{session::SessionStatus, Result};
    use async_trait::async_trait;

    #[derive(Default)]
    struct RecordingCleanup {
        cleaned: Mutex<Vec<String>>,
    }

    impl RecordingCleanup {
        fn cleaned(&self) -> Vec<String> {
            self.cleaned.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CleanupCoordinator for RecordingCleanup {
        async fn cleanup_session(&self, session: &Session) -> Result<()> {
            self.cleaned.lock().unwrap().push(session.id().to_string());
            Ok(())
        }
    }

    fn registry_with(cleanup: Arc<RecordingCleanup>) -> SessionRegistry {
        SessionRegistry::new(cleanup)
    }

    fn register(registry: &SessionRegistry, session: Session) -> Arc<Session> {
        let session = Arc::new(session);
        registry.register_session(session.clone());
        session
    }

    #[test]
    fn test_register_lookup_and_unregister() {
        let registry = SessionRegistry::default();
        register(&registry, Session::new("a", "python"));
        register(&registry, Session::new("b", "javascript"));
        register(&registry, Session::new("c", "python").as_child());

        assert_eq!(registry.get_session("a").map(|s| s.language().to_string()), Some("python".into()));
        assert!(registry.get_session("zzz").is_none());
        assert_eq!(registry.get_all_sessions().len(), 3);

        let python: Vec<_> = registry
            .get_sessions_by_language("python")
            .iter()
            .map(|s| s.id().to_string())
            .collect();
        assert_eq!(python, ["a", "c"]);

        assert_eq!(
            registry.count_sessions(),
            SessionCounts { total: 3, parents: 2, children: 1 }
        );

        assert!(registry.unregister_session("a").is_some());
        assert!(registry.unregister_session("a").is_none());
        assert_eq!(registry.count_sessions().total, 2);
    }

    #[test]
    fn test_relationship_delegation() {
        let registry = SessionRegistry::default();
        register(&registry, Session::new("p", "python"));
        register(&registry, Session::new("c1", "python").as_child());

        registry.register_parent_child("p", "c1");
        registry.register_parent_child("p", "c2");
        registry.register_parent_child("p", "c1");

        assert_eq!(registry.get_child_ids("p"), ["c1", "c2"]);
        assert!(registry.has_children("p"));
        let children: Vec<_> = registry.get_children("p").iter().map(|s| s.id().to_string()).collect();
        assert_eq!(children, ["c1"]);

        registry.set_active_child("p", "c1");
        assert_eq!(registry.get_active_child("p").as_deref(), Some("c1"));

        let parent = registry.get_session("p").expect("parent");
        assert_eq!(registry.resolve_active_session(&parent).id(), "c1");

        registry.unregister_session("c1");
        assert_eq!(registry.resolve_active_session(&parent).id(), "p");
        assert!(registry.get_children("p").is_empty());
        assert_eq!(registry.get_child_ids("p").len(), 2);

        registry.remove_parent_child_mapping("p");
        assert!(!registry.has_children("p"));
        assert_eq!(registry.get_active_child("p"), None);
    }

    #[test]
    fn test_parent_child_routing_scenario() {
        let registry = SessionRegistry::default();
        register(&registry, Session::new("P", "python"));
        register(
            &registry,
            Session::new("C", "python").as_child().with_status(SessionStatus::Paused),
        );
        registry.register_parent_child("P", "C");

        let target = registry.get_active_session("python").expect("target");
        assert_eq!(target.id(), "C");

        registry.remove_parent_child_mapping("P");
        let target = registry.get_active_session("python").expect("target");
        assert_eq!(target.id(), "P");
    }

    #[test]
    fn test_default_session_is_single_authoritative_field() {
        let registry = SessionRegistry::default();
        assert!(!registry.set_default_session("missing"));

        register(&registry, Session::new("a", "rust"));
        assert!(registry.set_default_session("a"));
        assert_eq!(registry.default_session().map(|s| s.id().to_string()), Some("a".into()));

        registry.unregister_session("a");
        assert!(registry.default_session().is_none());

        register(&registry, Session::new("b", "rust"));
        registry.set_default_session("b");
        registry.clear_default_session();
        assert!(registry.default_session().is_none());
    }

    #[test]
    fn test_reset_clears_without_cleanup() {
        let cleanup = Arc::new(RecordingCleanup::default());
        let registry = registry_with(cleanup.clone());
        register(&registry, Session::new("p", "python"));
        registry.register_parent_child("p", "c");
        registry.set_active_child("p", "c");

        registry.reset();

        assert_eq!(registry.count_sessions(), SessionCounts::default());
        assert!(!registry.has_children("p"));
        assert_eq!(registry.get_active_child("p"), None);
        assert!(cleanup.cleaned().is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_session_tears_down_children_first() {
        let cleanup = Arc::new(RecordingCleanup::default());
        let registry = registry_with(cleanup.clone());
        register(&registry, Session::new("p", "python"));
        register(&registry, Session::new("c1", "python").as_child());
        register(&registry, Session::new("c2", "python").as_child());
        register(&registry, Session::new("other", "python"));
        registry.register_parent_child("p", "c1");
        registry.register_parent_child("p", "c2");
        registry.register_parent_child("other", "c2");
        registry.set_default_session("c1");

        assert!(registry.cleanup_session("p").await);
        assert!(!registry.cleanup_session("p").await);

        assert_eq!(cleanup.cleaned(), ["c1", "c2", "p"]);
        assert_eq!(registry.count_sessions().total, 1);
        assert!(!registry.has_children("p"));
        assert!(!registry.has_children("other"));
        assert!(registry.default_session().is_none());
    }

    #[tokio::test]
    async fn test_cleanup_all_orders_children_before_parents() {
        let cleanup = Arc::new(RecordingCleanup::default());
        let registry = registry_with(cleanup.clone());
        register(&registry, Session::new("p", "python"));
        register(&registry, Session::new("c", "python").as_child());
        register(&registry, Session::new("q", "javascript"));
        registry.register_parent_child("p", "c");

        registry.cleanup_all().await;

        assert_eq!(cleanup.cleaned(), ["c", "p", "q"]);
        assert_eq!(registry.count_sessions(), SessionCounts::default());
        assert!(!registry.has_children("p"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_registration_and_routing() {
        let registry = Arc::new(SessionRegistry::default());

        let writers: Vec<_> = (0..8)
            .map(|i| {
                let registry = registry.clone();
                tokio::spawn(async move {
                    let parent = format!("p{i}");
                    let child = format!("c{i}");
                    registry.register_session(Arc::new(Session::new(parent.clone(), "python")));
                    registry.register_session(Arc::new(
                        Session::new(child.clone(), "python")
                            .as_child()
                            .with_status(SessionStatus::Paused),
                    ));
                    registry.register_parent_child(&parent, &child);
                })
            })
            .collect();

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move {
                    for _ in 0..200 {
                        if let Some(active) = registry.get_active_session("python") {
                            assert_eq!(active.language(), "python");
                        }
                        let counts = registry.count_sessions();
                        assert_eq!(counts.total, counts.parents + counts.children);
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();

        for handle in writers.into_iter().chain(readers) {
            handle.await.expect("task completes without panicking");
        }

        assert_eq!(
            registry.count_sessions(),
            SessionCounts { total: 16, parents: 8, children: 8 }
        );
        for i in 0..8 {
            assert_eq!(registry.get_child_ids(&format!("p{i}")), [format!("c{i}")]);
        }
        let active = registry.get_active_session("python").expect("a candidate exists");
        assert!(active.is_child());
        assert_eq!(active.status(), SessionStatus::Paused);
    }
}
