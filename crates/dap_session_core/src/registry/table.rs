use std::{collections::HashMap, sync::Arc};

use crate::session::Session;

/// Live sessions keyed by id, iterated in registration order.
#[derive(Debug, Default)]
pub struct SessionTable {
    entries: HashMap<String, Arc<Session>>,
    order: Vec<String>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces. A replaced session keeps its original position.
    pub fn insert(&mut self, session: Arc<Session>) -> Option<Arc<Session>> {
        let id = session.id().to_string();
        let previous = self.entries.insert(id.clone(), session);
        if previous.is_none() {
            self.order.push(id);
        }
        previous
    }

    pub fn remove(&mut self, id: &str) -> Option<Arc<Session>> {
        let removed = self.entries.remove(id)?;
        self.order.retain(|entry| entry != id);
        Some(removed)
    }

    pub fn get(&self, id: &str) -> Option<&Arc<Session>> {
        self.entries.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Session>> {
        self.order.iter().filter_map(|id| self.entries.get(id))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}

impl FromIterator<Session> for SessionTable {
    fn from_iter<I: IntoIterator<Item = Session>>(iter: I) -> Self {
        let mut table = Self::new();
        for session in iter {
            table.insert(Arc::new(session));
        }
        table
    }
}
