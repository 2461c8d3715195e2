//! Topic names to topic ids.
//!
//! Each process keeps its own registry, filled from its configuration. This
//! is a naming table only, not a discovery protocol: two processes agree on a
//! topic by agreeing on its segment file.

use iox_collections::{PrefixTree, node_capacity};
use std::fmt;

pub const MAX_TOPICS: usize = 64;
pub const MAX_TOPIC_NAME_LEN: usize = 32;

/// Dense id assigned to a topic in registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TopicId(pub u16);

impl fmt::Display for TopicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

type Names = PrefixTree<TopicId, MAX_TOPICS, MAX_TOPIC_NAME_LEN, { node_capacity(MAX_TOPICS, MAX_TOPIC_NAME_LEN) }>;

/// Registered topic names, searchable by exact name or by prefix
/// (`"radar/"` matches `"radar/front"` and `"radar/rear"`).
pub struct TopicRegistry {
    names: Box<Names>,
    next_id: u16,
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self {
            names: Box::new(Names::new()),
            next_id: 0,
        }
    }

    /// Registers `name`, returning its id.
    ///
    /// Registering a name twice returns the id it already has. Returns `None`
    /// if the name is longer than [`MAX_TOPIC_NAME_LEN`] bytes or
    /// [`MAX_TOPICS`] names are registered or the id space is used up.
    pub fn register(&mut self, name: &str) -> Option<TopicId> {
        if let Some(id) = self.lookup(name) {
            return Some(id);
        }
        let id = TopicId(self.next_id);
        let next = self.next_id.checked_add(1)?;
        if !self.names.insert(name, id) {
            return None;
        }
        self.next_id = next;
        Some(id)
    }

    pub fn lookup(&self, name: &str) -> Option<TopicId> {
        self.names.find(name).first().map(|&&id| id)
    }

    /// Ids of all topics whose name starts with `prefix`, in id order.
    pub fn lookup_prefix(&self, prefix: &str) -> Vec<TopicId> {
        let mut ids: Vec<TopicId> = self.names.find_prefix(prefix).into_iter().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Forgets `name`. Its id is not handed out again.
    pub fn unregister(&mut self, name: &str) -> bool {
        self.names.remove(name)
    }

    /// Registered names in lexicographic order.
    pub fn names(&self) -> Vec<String> {
        self.names.keys()
    }

    pub fn len(&self) -> usize {
        self.names.size()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl Default for TopicRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_follow_registration_order() {
        let mut registry = TopicRegistry::new();
        assert_eq!(registry.register("radar/front"), Some(TopicId(0)));
        assert_eq!(registry.register("radar/rear"), Some(TopicId(1)));
        assert_eq!(registry.register("lidar"), Some(TopicId(2)));
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn duplicate_name_keeps_its_id() {
        let mut registry = TopicRegistry::new();
        let id = registry.register("radar").unwrap();
        assert_eq!(registry.register("radar"), Some(id));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.register("other"), Some(TopicId(1)));
    }

    #[test]
    fn prefix_lookup() {
        let mut registry = TopicRegistry::new();
        for name in ["radar/rear", "lidar/top", "radar/front", "radar"] {
            registry.register(name);
        }
        assert_eq!(registry.lookup_prefix("radar/"), vec![TopicId(0), TopicId(2)]);
        assert_eq!(registry.lookup_prefix("radar").len(), 3);
        assert_eq!(registry.lookup_prefix("").len(), 4);
        assert!(registry.lookup_prefix("sonar").is_empty());
        assert_eq!(
            registry.names(),
            vec!["lidar/top", "radar", "radar/front", "radar/rear"]
        );
    }

    #[test]
    fn unregister_does_not_reuse_ids() {
        let mut registry = TopicRegistry::new();
        registry.register("a");
        assert!(registry.unregister("a"));
        assert!(!registry.unregister("a"));
        assert_eq!(registry.lookup("a"), None);
        assert!(registry.is_empty());
        assert_eq!(registry.register("a"), Some(TopicId(1)));
    }

    #[test]
    fn limits_are_enforced() {
        let mut registry = TopicRegistry::new();
        let long = "x".repeat(MAX_TOPIC_NAME_LEN + 1);
        assert_eq!(registry.register(&long), None);
        assert!(registry.register(&long[..MAX_TOPIC_NAME_LEN]).is_some());

        for i in 1..MAX_TOPICS {
            assert!(registry.register(&format!("t{i}")).is_some());
        }
        assert_eq!(registry.len(), MAX_TOPICS);
        assert_eq!(registry.register("one-too-many"), None);
        assert!(registry.register("t1").is_some());
    }

    #[test]
    fn exhausted_id_space_refuses_new_names() {
        let mut registry = TopicRegistry::new();
        registry.next_id = u16::MAX - 1;
        assert_eq!(registry.register("last"), Some(TopicId(u16::MAX - 1)));
        assert_eq!(registry.register("overflow"), None);
        assert_eq!(registry.lookup("overflow"), None);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.register("last"), Some(TopicId(u16::MAX - 1)));
    }
}
