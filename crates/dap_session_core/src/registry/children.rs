//! Parent/child relationships between sessions.
//!
//! Ids recorded here may outlive their sessions: a child can be cleaned up
//! before its parent learns about it. Every lookup checks the live session
//! table and silently skips ids that are no longer there.

use std::{collections::HashMap, sync::Arc};

use super::table::SessionTable;
use crate::session::{Session, SessionStatus};

#[derive(Debug, Default)]
pub struct ChildSessionRegistry {
    /// parent id -> child ids, unique, in registration order
    children: HashMap<String, Vec<String>>,
    /// parent id -> currently active child id
    active: HashMap<String, String>,
}

impl ChildSessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` when the child was already recorded for this parent.
    pub fn register_parent_child(&mut self, parent_id: &str, child_id: &str) -> bool {
        let children = self.children.entry(parent_id.to_string()).or_default();
        if children.iter().any(|id| id == child_id) {
            tracing::debug!("Child {} already registered under {}", child_id, parent_id);
            return false;
        }
        children.push(child_id.to_string());
        tracing::debug!("Registered child session: parent={}, child={}", parent_id, child_id);
        true
    }

    pub fn get_children(&self, parent_id: &str, sessions: &SessionTable) -> Vec<Arc<Session>> {
        self.get_child_ids(parent_id)
            .iter()
            .filter_map(|id| sessions.get(id).cloned())
            .collect()
    }

    /// Recorded ids, including ones whose session is gone.
    pub fn get_child_ids(&self, parent_id: &str) -> &[String] {
        self.children.get(parent_id).map_or(&[], Vec::as_slice)
    }

    pub fn has_children(&self, parent_id: &str) -> bool {
        !self.get_child_ids(parent_id).is_empty()
    }

    pub fn set_active_child(&mut self, parent_id: &str, child_id: &str) {
        self.active.insert(parent_id.to_string(), child_id.to_string());
    }

    pub fn get_active_child(&self, parent_id: &str) -> Option<&str> {
        self.active.get(parent_id).map(String::as_str)
    }

    /// Routes to the session's active child when that child is still live.
    pub fn resolve_active_session(&self, session: &Arc<Session>, sessions: &SessionTable) -> Arc<Session> {
        self.live_active_child(session.id(), sessions)
            .unwrap_or_else(|| session.clone())
    }

    /// Picks the session an agent's next command for `language` should go to.
    ///
    /// Candidates are the non-child sessions of that language, in registration
    /// order. For each candidate: a live recorded active child wins, then a
    /// paused child, then a running one; a candidate with no live children is
    /// itself the target. A candidate whose live children are all terminated
    /// or errored is skipped, and the first candidate is the fallback.
    pub fn get_active_session_for_language(
        &self,
        language: &str,
        sessions: &SessionTable,
    ) -> Option<Arc<Session>> {
        let candidates: Vec<&Arc<Session>> = sessions
            .iter()
            .filter(|s| s.language() == language && !s.is_child())
            .collect();

        for candidate in &candidates {
            if let Some(active) = self.live_active_child(candidate.id(), sessions) {
                return Some(active);
            }

            let children = self.get_children(candidate.id(), sessions);
            if children.is_empty() {
                return Some((*candidate).clone());
            }

            let by_status = |status: SessionStatus| {
                children.iter().find(|child| child.status() == status).cloned()
            };
            if let Some(child) = by_status(SessionStatus::Paused).or_else(|| by_status(SessionStatus::Running)) {
                return Some(child);
            }
        }

        candidates.first().map(|candidate| (*candidate).clone())
    }

    pub fn remove_parent_child_mapping(&mut self, parent_id: &str) {
        self.children.remove(parent_id);
        self.active.remove(parent_id);
    }

    /// Drops `child_id` from every parent's set and active slot.
    pub fn forget_child(&mut self, child_id: &str) {
        for children in self.children.values_mut() {
            children.retain(|id| id != child_id);
        }
        self.children.retain(|_, children| !children.is_empty());
        self.active.retain(|_, active| active != child_id);
    }

    pub fn clear(&mut self) {
        self.children.clear();
        self.active.clear();
    }

    fn live_active_child(&self, parent_id: &str, sessions: &SessionTable) -> Option<Arc<Session>> {
        self.get_active_child(parent_id)
            .and_then(|child_id| sessions.get(child_id))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(sessions: Vec<Session>) -> SessionTable {
        sessions.into_iter().collect()
    }

    fn child(id: &str, language: &str, status: SessionStatus) -> Session {
        Session::new(id, language).as_child().with_status(status)
    }

    #[test]
    fn test_register_parent_child_has_set_semantics() {
        let mut registry = ChildSessionRegistry::new();
        assert!(registry.register_parent_child("p", "c1"));
        assert!(registry.register_parent_child("p", "c2"));
        assert!(!registry.register_parent_child("p", "c1"));

        assert_eq!(registry.get_child_ids("p"), ["c1", "c2"]);
        assert!(registry.has_children("p"));
        assert!(!registry.has_children("unknown"));
        assert!(registry.get_child_ids("unknown").is_empty());
    }

    #[test]
    fn test_get_children_drops_dangling_ids() {
        let mut registry = ChildSessionRegistry::new();
        let sessions = table(vec![
            Session::new("p", "python"),
            child("c1", "python", SessionStatus::Running),
        ]);
        registry.register_parent_child("p", "c1");
        registry.register_parent_child("p", "ghost");

        let children = registry.get_children("p", &sessions);
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].id(), "c1");
        assert!(registry.get_children("nobody", &sessions).is_empty());
    }

    #[test]
    fn test_active_child_is_last_write_wins() {
        let mut registry = ChildSessionRegistry::new();
        assert_eq!(registry.get_active_child("p"), None);

        registry.set_active_child("p", "c1");
        registry.set_active_child("p", "c2");
        assert_eq!(registry.get_active_child("p"), Some("c2"));
    }

    #[test]
    fn test_resolve_active_session() {
        let mut registry = ChildSessionRegistry::new();
        let sessions = table(vec![
            Session::new("p", "python"),
            child("c1", "python", SessionStatus::Paused),
        ]);
        let parent = sessions.get("p").cloned().expect("parent registered");

        assert_eq!(registry.resolve_active_session(&parent, &sessions).id(), "p");

        registry.set_active_child("p", "c1");
        assert_eq!(registry.resolve_active_session(&parent, &sessions).id(), "c1");

        registry.set_active_child("p", "gone");
        assert_eq!(registry.resolve_active_session(&parent, &sessions).id(), "p");
    }

    #[test]
    fn test_language_lookup_prefers_paused_child() {
        let mut registry = ChildSessionRegistry::new();
        let sessions = table(vec![
            Session::new("p", "javascript"),
            child("running", "javascript", SessionStatus::Running),
            child("paused", "javascript", SessionStatus::Paused),
        ]);
        registry.register_parent_child("p", "running");
        registry.register_parent_child("p", "paused");

        let target = registry
            .get_active_session_for_language("javascript", &sessions)
            .expect("a target");
        assert_eq!(target.id(), "paused");
    }

    #[test]
    fn test_language_lookup_uses_running_child_when_none_paused() {
        let mut registry = ChildSessionRegistry::new();
        let sessions = table(vec![
            Session::new("p", "python"),
            child("done", "python", SessionStatus::Terminated),
            child("busy", "python", SessionStatus::Running),
        ]);
        registry.register_parent_child("p", "done");
        registry.register_parent_child("p", "busy");

        let target = registry.get_active_session_for_language("python", &sessions);
        assert_eq!(target.map(|s| s.id().to_string()), Some("busy".into()));
    }

    #[test]
    fn test_language_lookup_active_child_wins_over_paused() {
        let mut registry = ChildSessionRegistry::new();
        let sessions = table(vec![
            Session::new("p", "python"),
            child("paused", "python", SessionStatus::Paused),
            child("chosen", "python", SessionStatus::Running),
        ]);
        registry.register_parent_child("p", "paused");
        registry.register_parent_child("p", "chosen");
        registry.set_active_child("p", "chosen");

        let target = registry.get_active_session_for_language("python", &sessions);
        assert_eq!(target.map(|s| s.id().to_string()), Some("chosen".into()));
    }

    #[test]
    fn test_language_lookup_falls_back_to_parent_and_none() {
        let mut registry = ChildSessionRegistry::new();
        let sessions = table(vec![
            Session::new("p", "python"),
            child("orphan", "python", SessionStatus::Paused),
        ]);
        registry.register_parent_child("p", "ghost");

        let target = registry.get_active_session_for_language("python", &sessions);
        assert_eq!(target.map(|s| s.id().to_string()), Some("p".into()));
        assert!(registry.get_active_session_for_language("go", &sessions).is_none());
    }

    #[test]
    fn test_language_lookup_skips_parent_with_only_finished_children() {
        let mut registry = ChildSessionRegistry::new();
        let sessions = table(vec![
            Session::new("p1", "python"),
            child("dead", "python", SessionStatus::Terminated),
            Session::new("p2", "python"),
            child("live", "python", SessionStatus::Paused),
        ]);
        registry.register_parent_child("p1", "dead");
        registry.register_parent_child("p2", "live");

        let target = registry.get_active_session_for_language("python", &sessions);
        assert_eq!(target.map(|s| s.id().to_string()), Some("live".into()));

        let only_dead = table(vec![
            Session::new("p1", "python"),
            child("dead", "python", SessionStatus::Errored),
        ]);
        let target = registry.get_active_session_for_language("python", &only_dead);
        assert_eq!(target.map(|s| s.id().to_string()), Some("p1".into()));
    }

    #[test]
    fn test_remove_mapping_and_forget_child() {
        let mut registry = ChildSessionRegistry::new();
        registry.register_parent_child("p", "c1");
        registry.register_parent_child("p", "c2");
        registry.register_parent_child("q", "c3");
        registry.set_active_child("p", "c1");

        registry.forget_child("c1");
        assert_eq!(registry.get_child_ids("p"), ["c2"]);
        assert_eq!(registry.get_active_child("p"), None);

        registry.remove_parent_child_mapping("p");
        registry.remove_parent_child_mapping("never-registered");
        assert!(!registry.has_children("p"));
        assert!(registry.has_children("q"));

        registry.clear();
        assert!(!registry.has_children("q"));
    }
}
