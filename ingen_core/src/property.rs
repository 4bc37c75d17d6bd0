//! Property multimaps attached to every engine object.

use crate::atom::Atom;
use crate::uri::Uri;
use smallvec::SmallVec;

/// Where a property is visible.
///
/// `Internal` properties describe an object as seen from inside its parent
/// graph; `External` as seen from outside (e.g. the graph port the object is
/// exposed through). `Default` properties are visible in both.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PropertyContext {
    Default,
    Internal,
    External,
}

/// One property value with its visibility context.
#[derive(Clone, Debug, PartialEq)]
pub struct Property {
    pub value: Atom,
    pub context: PropertyContext,
}

impl Property {
    pub fn new(value: impl Into<Atom>) -> Self {
        Self {
            value: value.into(),
            context: PropertyContext::Default,
        }
    }
    pub fn external(value: impl Into<Atom>) -> Self {
        Self {
            value: value.into(),
            context: PropertyContext::External,
        }
    }
    pub fn internal(value: impl Into<Atom>) -> Self {
        Self {
            value: value.into(),
            context: PropertyContext::Internal,
        }
    }
}

/// Insertion-ordered multimap of `Uri → Property`.
///
/// Most objects carry a handful of properties, so storage is a flat vector
/// scanned linearly.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Properties {
    entries: Vec<(Uri, Property)>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a value under `key`, keeping existing values.
    pub fn insert(&mut self, key: Uri, prop: Property) {
        self.entries.push((key, prop));
    }

    /// Replace all values under `key` with a single value.
    pub fn put(&mut self, key: &Uri, prop: Property) {
        self.entries.retain(|(k, _)| k != key);
        self.entries.push((key.clone(), prop));
    }

    /// Remove values under `key` matching `value`. A [`Atom::Wildcard`]
    /// pattern removes every value under the key. Returns the removed
    /// properties in insertion order.
    pub fn remove(&mut self, key: &Uri, value: &Atom) -> SmallVec<[Property; 1]> {
        let mut removed = SmallVec::new();
        self.entries.retain(|(k, p)| {
            if k == key && (value.is_wildcard() || p.value == *value) {
                removed.push(p.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    /// The first value under `key`, if any.
    pub fn get_first(&self, key: &Uri) -> Option<&Atom> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, p)| &p.value)
    }

    pub fn contains(&self, key: &Uri, value: &Atom) -> bool {
        self.entries
            .iter()
            .any(|(k, p)| k == key && p.value == *value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Uri, &Property)> {
        self.entries.iter().map(|(k, p)| (k, p))
    }

    /// Properties visible in `context` (`Default` entries always included).
    pub fn iter_context(
        &self,
        context: PropertyContext,
    ) -> impl Iterator<Item = (&Uri, &Property)> {
        self.entries
            .iter()
            .filter(move |(_, p)| {
                p.context == PropertyContext::Default || p.context == context
            })
            .map(|(k, p)| (k, p))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Apply `other` over `self`: each key in `other` replaces that key's
    /// values. Used by idempotent `put`.
    pub fn replace_from(&mut self, other: &Properties) {
        for (key, prop) in other.iter() {
            if self.entries.iter().any(|(k, _)| k == key) {
                self.entries.retain(|(k, _)| k != key);
            }
            self.entries.push((key.clone(), prop.clone()));
        }
    }
}

impl FromIterator<(Uri, Property)> for Properties {
    fn from_iter<T: IntoIterator<Item = (Uri, Property)>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> Uri {
        Uri::parse(s).unwrap()
    }

    #[test]
    fn multimap_semantics() {
        let mut props = Properties::new();
        let k = key("ingen:#value");
        props.insert(k.clone(), Property::new(1.0f32));
        props.insert(k.clone(), Property::new(2.0f32));
        assert_eq!(props.len(), 2);
        assert_eq!(props.get_first(&k), Some(&Atom::Float(1.0)));

        props.put(&k, Property::new(3.0f32));
        assert_eq!(props.len(), 1);
        assert_eq!(props.get_first(&k), Some(&Atom::Float(3.0)));
    }

    #[test]
    fn wildcard_removal() {
        let mut props = Properties::new();
        let k = key("ingen:#binding");
        props.insert(k.clone(), Property::new(1));
        props.insert(k.clone(), Property::new(2));
        props.insert(key("ingen:#other"), Property::new(9));

        let removed = props.remove(&k, &Atom::Wildcard);
        assert_eq!(removed.len(), 2);
        assert_eq!(props.len(), 1);
        assert!(props.get_first(&k).is_none());
    }

    #[test]
    fn context_filtering() {
        let mut props = Properties::new();
        props.insert(key("a:x"), Property::internal(1));
        props.insert(key("a:y"), Property::external(2));
        props.insert(key("a:z"), Property::new(3));
        let internal: Vec<_> = props.iter_context(PropertyContext::Internal).collect();
        assert_eq!(internal.len(), 2);
    }
}
