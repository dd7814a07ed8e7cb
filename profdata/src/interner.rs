// Name interning for functions, metrics, user events and groups.
//
// Each DataSource owns one Interner per kind of named entity.  Ids are dense and assigned in
// first-seen order, so the order in which a parser presents names determines the ids, and two
// loads of the same input produce the same ids.

use std::collections::HashMap;

#[derive(Debug, Default, Clone)]
pub struct Interner {
    ids: HashMap<String, usize>,
    names: Vec<String>,
}

impl Interner {
    pub fn new() -> Interner {
        Interner {
            ids: HashMap::new(),
            names: vec![],
        }
    }

    /// Return the id for `name`, allocating the next ordinal if the name has not been seen before.
    /// The boolean is true iff the id was newly allocated.

    pub fn intern(&mut self, name: &str) -> (usize, bool) {
        if let Some(id) = self.ids.get(name) {
            return (*id, false);
        }
        let id = self.names.len();
        self.names.push(name.to_string());
        self.ids.insert(name.to_string(), id);
        (id, true)
    }

    /// Look up a name without allocating.

    pub fn get(&self, name: &str) -> Option<usize> {
        self.ids.get(name).copied()
    }

    pub fn name(&self, id: usize) -> Option<&str> {
        self.names.get(id).map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[test]
fn test_interner_first_seen_order() {
    let mut i = Interner::new();
    assert!(i.intern("main") == (0, true));
    assert!(i.intern("foo") == (1, true));
    assert!(i.intern("main") == (0, false));
    assert!(i.intern("bar") == (2, true));
    assert!(i.len() == 3);
    assert!(i.get("foo") == Some(1));
    assert!(i.get("baz").is_none());
    assert!(i.name(2) == Some("bar"));
    assert!(i.name(3).is_none());
}

#[test]
fn test_interners_are_independent() {
    let mut a = Interner::new();
    let mut b = Interner::new();
    a.intern("x");
    a.intern("y");
    assert!(b.intern("y") == (0, true));
    assert!(a.get("y") == Some(1));
}
