//! Per-run caches
//!
//! * [`BaseCache`] memoizes storage reads by path. Storage is read through
//!   one transaction per run, so entries never go stale.
//! * [`VirtualCache`] memoizes rule results by plugged path (or function
//!   path plus arguments). A `with` scope pushes a fresh layer; lookups only
//!   consult the top layer, so nothing computed under one set of overrides
//!   leaks into another.

use ahash::AHashMap;
use verdict_lang::Term;

#[derive(Debug, Default)]
pub struct BaseCache {
    entries: AHashMap<Vec<String>, Option<Term>>,
}

impl BaseCache {
    /// `Some(None)` records a path known to be missing.
    pub fn get(&self, path: &[String]) -> Option<&Option<Term>> {
        self.entries.get(path)
    }

    pub fn put(&mut self, path: Vec<String>, value: Option<Term>) {
        self.entries.insert(path, value);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug)]
pub struct VirtualCache {
    stack: Vec<AHashMap<Vec<Term>, Term>>,
}

impl Default for VirtualCache {
    fn default() -> Self {
        VirtualCache {
            stack: vec![AHashMap::new()],
        }
    }
}

impl VirtualCache {
    pub fn push(&mut self) {
        self.stack.push(AHashMap::new());
    }

    pub fn pop(&mut self) {
        if self.stack.len() > 1 {
            self.stack.pop();
        }
    }

    pub fn get(&self, key: &[Term]) -> Option<&Term> {
        self.stack.last().and_then(|layer| layer.get(key))
    }

    pub fn put(&mut self, key: Vec<Term>, value: Term) {
        if let Some(layer) = self.stack.last_mut() {
            layer.insert(key, value);
        }
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> Vec<Term> {
        vec![Term::var("data"), Term::string(s)]
    }

    #[test]
    fn entries_written_before_push_survive_pop() {
        let mut cache = VirtualCache::default();
        cache.put(key("p"), Term::int(1));
        cache.push();
        assert_eq!(cache.get(&key("p")), None);
        cache.put(key("p"), Term::int(2));
        assert_eq!(cache.get(&key("p")), Some(&Term::int(2)));
        cache.pop();
        assert_eq!(cache.get(&key("p")), Some(&Term::int(1)));
        assert_eq!(cache.depth(), 1);
    }

    #[test]
    fn bottom_layer_is_never_popped() {
        let mut cache = VirtualCache::default();
        cache.put(key("q"), Term::boolean(true));
        cache.pop();
        assert_eq!(cache.get(&key("q")), Some(&Term::boolean(true)));
    }

    #[test]
    fn base_cache_remembers_missing_paths() {
        let mut cache = BaseCache::default();
        cache.put(vec!["a".into()], None);
        assert_eq!(cache.get(&["a".to_string()]), Some(&None));
        assert_eq!(cache.get(&["b".to_string()]), None);
    }
}
