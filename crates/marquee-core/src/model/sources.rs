use serde::{Deserialize, Serialize};
use std::fmt;

/// Token stored when no source names survive normalization.
pub const DEFAULT_SOURCE_TOKEN: &str = "default";

/// Separator used when joining normalized source names.
pub const SOURCE_SEPARATOR: char = ',';

/// A normalized, order-independent set of provider source names.
///
/// Names are trimmed, lower-cased, de-duplicated, and sorted, so
/// `["TMDB", "omdb"]` and `["omdb", " tmdb "]` produce the same key.
///
/// A name containing [`SOURCE_SEPARATOR`] is split into the names it
/// separates: `["omdb,tmdb"]` is the set `{omdb, tmdb}`, which keeps
/// [`names`](Self::names) consistent with the stored key.
///
/// An empty set normalizes to [`DEFAULT_SOURCE_TOKEN`]. That name is
/// reserved: the single source `"default"` is the same set as no sources.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceSet(String);

impl SourceSet {
    pub fn new<I, S>(sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut names: Vec<String> = sources
            .into_iter()
            .flat_map(|s| {
                s.as_ref()
                    .split(SOURCE_SEPARATOR)
                    .map(|name| name.trim().to_lowercase())
                    .collect::<Vec<_>>()
            })
            .filter(|s| !s.is_empty())
            .collect();
        names.sort();
        names.dedup();

        if names.is_empty() {
            return Self(DEFAULT_SOURCE_TOKEN.to_string());
        }

        Self(names.join(&SOURCE_SEPARATOR.to_string()))
    }

    /// Rebuild a set from its stored key without re-normalizing.
    pub(crate) fn from_key(key: String) -> Self {
        Self(key)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_default(&self) -> bool {
        self.0 == DEFAULT_SOURCE_TOKEN
    }

    /// Iterate over the individual source names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.split(SOURCE_SEPARATOR)
    }
}

impl fmt::Display for SourceSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SourceSet {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
