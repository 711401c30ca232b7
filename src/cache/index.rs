//! Bidirectional tag index.
//!
//! Tracks which stored keys carry which tags so a tag deletion can find every
//! affected entry, and so evicted entries can be dropped from the index.

use std::collections::{HashMap, HashSet};

use super::tags::{Tag, TagSet};

/// Tracks tag → keys and key → tags mappings.
#[derive(Debug, Default)]
pub struct TagIndex {
    tag_to_keys: HashMap<Tag, HashSet<String>>,
    key_to_tags: HashMap<String, TagSet>,
}

impl TagIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `key` carries `tags`, replacing any previous registration.
    ///
    /// Returns the tags the previous registration held that no key carries
    /// any more.
    pub fn register(&mut self, key: &str, tags: &TagSet) -> Vec<Tag> {
        let mut orphaned = self.unregister(key);
        orphaned.retain(|tag| !tags.contains(tag.as_str()));
        for tag in tags {
            self.tag_to_keys
                .entry(tag.clone())
                .or_default()
                .insert(key.to_string());
        }
        self.key_to_tags.insert(key.to_string(), tags.clone());
        orphaned
    }

    /// Forget `key` and drop tag entries that no longer point anywhere.
    ///
    /// Returns the tags that lost their last key.
    pub fn unregister(&mut self, key: &str) -> Vec<Tag> {
        let Some(tags) = self.key_to_tags.remove(key) else {
            return Vec::new();
        };
        let mut orphaned = Vec::new();
        for tag in &tags {
            if let Some(keys) = self.tag_to_keys.get_mut(tag) {
                keys.remove(key);
                if keys.is_empty() {
                    self.tag_to_keys.remove(tag);
                    orphaned.push(tag.clone());
                }
            }
        }
        orphaned
    }

    pub fn has_tag(&self, tag: &Tag) -> bool {
        self.tag_to_keys.contains_key(tag)
    }

    /// Every key carrying at least one of `tags`.
    pub fn keys_for_tags(&self, tags: &TagSet) -> HashSet<String> {
        tags.iter()
            .filter_map(|tag| self.tag_to_keys.get(tag))
            .flatten()
            .cloned()
            .collect()
    }

    pub fn tags_for_key(&self, key: &str) -> Option<&TagSet> {
        self.key_to_tags.get(key)
    }

    pub fn clear(&mut self) {
        self.tag_to_keys.clear();
        self.key_to_tags.clear();
    }

    pub fn tag_count(&self) -> usize {
        self.tag_to_keys.len()
    }

    pub fn key_count(&self) -> usize {
        self.key_to_tags.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(values: &[&str]) -> TagSet {
        TagSet::try_from_strs(values).expect("valid tags")
    }

    #[test]
    fn register_and_lookup() {
        let mut index = TagIndex::new();
        index.register("page:/node/5", &tags(&["node:5", "node_list"]));
        index.register("page:/", &tags(&["node_list"]));

        let keys = index.keys_for_tags(&tags(&["node:5"]));
        assert_eq!(keys.len(), 1);
        assert!(keys.contains("page:/node/5"));

        let keys = index.keys_for_tags(&tags(&["node_list", "user:1"]));
        assert_eq!(keys.len(), 2);

        assert_eq!(
            index.tags_for_key("page:/").map(TagSet::to_strings),
            Some(vec!["node_list".to_string()])
        );
    }

    #[test]
    fn unregister_cleans_up_both_directions() {
        let mut index = TagIndex::new();
        index.register("k", &tags(&["a", "b"]));
        assert_eq!(index.key_count(), 1);
        assert_eq!(index.tag_count(), 2);

        let mut orphaned = index.unregister("k");
        orphaned.sort();
        assert_eq!(orphaned, tags(&["a", "b"]).iter().cloned().collect::<Vec<_>>());
        assert_eq!(index.key_count(), 0);
        assert_eq!(index.tag_count(), 0);

        // Unknown keys are ignored.
        assert!(index.unregister("missing").is_empty());
    }

    #[test]
    fn re_register_replaces_previous_tags() {
        let mut index = TagIndex::new();
        index.register("k", &tags(&["old", "kept"]));
        index.register("other", &tags(&["shared"]));
        let orphaned = index.register("k", &tags(&["new", "kept"]));

        assert_eq!(orphaned, tags(&["old"]).iter().cloned().collect::<Vec<_>>());
        assert!(index.has_tag(&Tag::new("kept").expect("tag")));
        assert!(index.keys_for_tags(&tags(&["old"])).is_empty());
        assert!(index.keys_for_tags(&tags(&["new"])).contains("k"));
        assert_eq!(index.tag_count(), 3);
    }

    #[test]
    fn clear_removes_all_mappings() {
        let mut index = TagIndex::new();
        index.register("k1", &tags(&["a"]));
        index.register("k2", &tags(&["b"]));

        index.clear();
        assert_eq!(index.key_count(), 0);
        assert_eq!(index.tag_count(), 0);
    }
}
