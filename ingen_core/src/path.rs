//! Hierarchical names for engine objects.
//!
//! A [`Symbol`] is one path component, restricted to `[A-Za-z_][A-Za-z0-9_]*`
//! so that symbols are valid identifiers in every host language Ingen talks
//! to. A [`Path`] is a `/`-separated sequence of symbols, always absolute.
//! Paths order lexically with `/` sorting before any symbol character, so a
//! `BTreeMap<Path, _>` keeps each subtree contiguous.

use ecow::EcoString;

/// Errors from parsing a [`Symbol`] or [`Path`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PathError {
    #[error("empty string is not a valid symbol or path")]
    Empty,
    #[error("`{0}` contains an invalid character")]
    InvalidChar(EcoString),
    #[error("`{0}` does not start with `/`")]
    NotAbsolute(EcoString),
    #[error("`{0}` has a trailing `/`")]
    TrailingSlash(EcoString),
}

fn is_symbol_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}
fn is_symbol_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// One path component: `[A-Za-z_][A-Za-z0-9_]*`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Symbol(EcoString);

impl Symbol {
    /// Parse a string into a symbol, rejecting invalid characters.
    pub fn parse(s: impl AsRef<str>) -> Result<Self, PathError> {
        let s = s.as_ref();
        let mut chars = s.chars();
        match chars.next() {
            None => return Err(PathError::Empty),
            Some(c) if !is_symbol_start(c) => return Err(PathError::InvalidChar(s.into())),
            Some(_) => {}
        }
        if chars.all(is_symbol_char) {
            Ok(Symbol(s.into()))
        } else {
            Err(PathError::InvalidChar(s.into()))
        }
    }

    /// Mangle an arbitrary string into a valid symbol. Invalid characters
    /// become `_`; an empty or digit-leading input gains a `_` prefix.
    pub fn from_lossy(s: impl AsRef<str>) -> Self {
        let s = s.as_ref();
        let mut out = EcoString::new();
        for (i, c) in s.chars().enumerate() {
            if (i == 0 && is_symbol_start(c)) || (i > 0 && is_symbol_char(c)) {
                out.push(c);
            } else if i == 0 && c.is_ascii_digit() {
                out.push('_');
                out.push(c);
            } else {
                out.push('_');
            }
        }
        if out.is_empty() {
            out.push('_');
        }
        Symbol(out)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The first symbol in the sequence `base`, `base_2`, `base_3`, … for
    /// which `taken` returns false. Used to resolve name collisions when
    /// creating objects without an explicit symbol.
    pub fn next_free(base: &Symbol, mut taken: impl FnMut(&Symbol) -> bool) -> Symbol {
        if !taken(base) {
            return base.clone();
        }
        let mut i = 2u32;
        loop {
            let candidate = Symbol(ecow::eco_format!("{}_{}", base.0, i));
            if !taken(&candidate) {
                return candidate;
            }
            i += 1;
        }
    }
}

impl core::fmt::Display for Symbol {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An absolute `/`-separated path of symbols. The root graph is `"/"`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Path(EcoString);

impl Path {
    /// The path of the root graph.
    pub fn root() -> Self {
        Path("/".into())
    }

    /// Parse an absolute path string.
    pub fn parse(s: impl AsRef<str>) -> Result<Self, PathError> {
        let s = s.as_ref();
        if s.is_empty() {
            return Err(PathError::Empty);
        }
        if !s.starts_with('/') {
            return Err(PathError::NotAbsolute(s.into()));
        }
        if s == "/" {
            return Ok(Path::root());
        }
        if s.ends_with('/') {
            return Err(PathError::TrailingSlash(s.into()));
        }
        for component in s[1..].split('/') {
            Symbol::parse(component)?;
        }
        Ok(Path(s.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    /// The parent path, or None for the root.
    pub fn parent(&self) -> Option<Path> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind('/') {
            Some(0) => Some(Path::root()),
            Some(i) => Some(Path(self.0[..i].into())),
            None => None,
        }
    }

    /// The final symbol of this path. The root has no symbol.
    pub fn symbol(&self) -> Option<Symbol> {
        if self.is_root() {
            return None;
        }
        let i = self.0.rfind('/').expect("non-root paths contain `/`");
        Some(Symbol(self.0[i + 1..].into()))
    }

    /// Child path `self/sym`.
    pub fn child(&self, sym: &Symbol) -> Path {
        if self.is_root() {
            Path(ecow::eco_format!("/{}", sym))
        } else {
            Path(ecow::eco_format!("{}/{}", self.0, sym))
        }
    }

    /// True if `self` is a strict ancestor of `other`.
    pub fn is_parent_of(&self, other: &Path) -> bool {
        if self == other {
            return false;
        }
        if self.is_root() {
            return true;
        }
        other.0.starts_with(self.0.as_str())
            && other.0.as_bytes().get(self.0.len()) == Some(&b'/')
    }

    /// Rebase `self` from subtree `old_root` to `new_root`. Returns None if
    /// `self` is not `old_root` or below it.
    pub fn rebased(&self, old_root: &Path, new_root: &Path) -> Option<Path> {
        if self == old_root {
            return Some(new_root.clone());
        }
        if !old_root.is_parent_of(self) {
            return None;
        }
        let tail = if old_root.is_root() {
            &self.0[..]
        } else {
            &self.0[old_root.0.len()..]
        };
        if new_root.is_root() {
            Some(Path(tail.into()))
        } else {
            Some(Path(ecow::eco_format!("{}{}", new_root.0, tail)))
        }
    }
}

impl core::fmt::Display for Path {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbol_parsing() {
        assert!(Symbol::parse("osc").is_ok());
        assert!(Symbol::parse("_out2").is_ok());
        assert!(Symbol::parse("2osc").is_err());
        assert!(Symbol::parse("a-b").is_err());
        assert!(Symbol::parse("").is_err());
        assert_eq!(Symbol::from_lossy("2 osc!").as_str(), "_2_osc_");
        assert_eq!(Symbol::from_lossy("").as_str(), "_");
    }

    #[test]
    fn path_parsing() {
        assert!(Path::parse("/").is_ok());
        assert!(Path::parse("/a/b_2").is_ok());
        assert!(Path::parse("a/b").is_err());
        assert!(Path::parse("/a/").is_err());
        assert!(Path::parse("/a//b").is_err());
    }

    #[test]
    fn path_relations() {
        let p = Path::parse("/main/osc").unwrap();
        assert_eq!(p.parent(), Some(Path::parse("/main").unwrap()));
        assert_eq!(p.symbol().unwrap().as_str(), "osc");
        assert_eq!(Path::parse("/main").unwrap().parent(), Some(Path::root()));
        assert!(Path::root().is_parent_of(&p));
        assert!(Path::parse("/main").unwrap().is_parent_of(&p));
        assert!(!Path::parse("/mai").unwrap().is_parent_of(&p));
        assert!(!p.is_parent_of(&p));
    }

    #[test]
    fn path_rebase() {
        let p = Path::parse("/a/b/c").unwrap();
        let moved = p
            .rebased(&Path::parse("/a").unwrap(), &Path::parse("/x/y").unwrap())
            .unwrap();
        assert_eq!(moved, Path::parse("/x/y/b/c").unwrap());
        assert!(
            p.rebased(&Path::parse("/q").unwrap(), &Path::root())
                .is_none()
        );
    }

    #[test]
    fn next_free_symbol() {
        let base = Symbol::parse("osc").unwrap();
        let taken = ["osc", "osc_2"];
        let free = Symbol::next_free(&base, |s| taken.contains(&s.as_str()));
        assert_eq!(free.as_str(), "osc_3");
    }
}
