//! Absolute URIs.
//!
//! URIs name plugins (`http://…`, `ingen:/internals/Note`) and engine
//! objects (`ingen:/main/osc` maps to the path `/main/osc`).

use crate::path::{Path, PathError};
use ecow::EcoString;

/// Scheme prefix for URIs referring to engine object paths.
pub const INGEN_SCHEME: &str = "ingen:";
/// URI prefix of the built-in internal plugins.
pub const INTERNALS_PREFIX: &str = "ingen:/internals/";

/// An absolute URI: `scheme:rest` with a non-empty alphabetic scheme.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Uri(EcoString);

impl Uri {
    /// Parse an absolute URI. Only the scheme shape is checked.
    pub fn parse(s: impl AsRef<str>) -> Result<Self, PathError> {
        let s = s.as_ref();
        if s.is_empty() {
            return Err(PathError::Empty);
        }
        let Some(colon) = s.find(':') else {
            return Err(PathError::NotAbsolute(s.into()));
        };
        if colon == 0
            || !s[..colon]
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.')
        {
            return Err(PathError::InvalidChar(s.into()));
        }
        Ok(Uri(s.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The engine path this URI refers to, if it is an `ingen:/…` object URI.
    /// Internal plugin URIs (`ingen:/internals/…`) are not object paths.
    pub fn to_path(&self) -> Option<Path> {
        if self.0.starts_with(INTERNALS_PREFIX) {
            return None;
        }
        let rest = self.0.strip_prefix(INGEN_SCHEME)?;
        Path::parse(rest).ok()
    }

    /// The object URI for an engine path.
    pub fn from_path(path: &Path) -> Uri {
        Uri(ecow::eco_format!("{}{}", INGEN_SCHEME, path))
    }

    /// True for `ingen:/internals/…` plugin URIs.
    pub fn is_internal_plugin(&self) -> bool {
        self.0.starts_with(INTERNALS_PREFIX)
    }
}

impl core::fmt::Display for Uri {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uri_parsing() {
        assert!(Uri::parse("http://example.org/p").is_ok());
        assert!(Uri::parse("ingen:/a/b").is_ok());
        assert!(Uri::parse("not a uri").is_err());
        assert!(Uri::parse(":missing").is_err());
    }

    #[test]
    fn uri_path_round_trip() {
        let p = Path::parse("/main/osc").unwrap();
        let u = Uri::from_path(&p);
        assert_eq!(u.as_str(), "ingen:/main/osc");
        assert_eq!(u.to_path(), Some(p));
        assert_eq!(
            Uri::parse("ingen:/internals/Note").unwrap().to_path(),
            None
        );
        assert!(Uri::parse("ingen:/internals/Note").unwrap().is_internal_plugin());
    }
}
