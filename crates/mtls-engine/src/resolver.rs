//! Resolution of configured locations to bytes
//!
//! The engine never touches the filesystem directly. Locations are handed to a
//! [`ResourceResolver`], which returns the raw bytes in a zeroizing buffer.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, trace};
use zeroize::Zeroizing;

/// Prefix for classpath-style locations, resolved against classpath roots
pub const CLASSPATH_PREFIX: &str = "classpath:";

/// Resolver failure; the loader attaches the credential purpose and location
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveError {
    /// Why the location could not be read
    pub reason: String,
}

impl ResolveError {
    /// Create a resolver failure
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Turns a configured location into bytes
#[async_trait]
pub trait ResourceResolver: Send + Sync + std::fmt::Debug {
    /// Read the full contents behind `location`
    async fn resolve(&self, location: &str) -> Result<Zeroizing<Vec<u8>>, ResolveError>;
}

/// Filesystem resolver supporting `classpath:`, `file:` and plain path locations
#[derive(Debug, Clone)]
pub struct FileSystemResolver {
    classpath_roots: Vec<PathBuf>,
}

impl FileSystemResolver {
    /// Resolver with the current directory as the only classpath root
    pub fn new() -> Self {
        Self {
            classpath_roots: vec![PathBuf::from(".")],
        }
    }

    /// Replace the classpath roots, searched in order
    pub fn with_classpath_roots<I, P>(roots: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            classpath_roots: roots.into_iter().map(Into::into).collect(),
        }
    }

    fn candidates(&self, location: &str) -> Vec<PathBuf> {
        if let Some(relative) = location.strip_prefix(CLASSPATH_PREFIX) {
            let relative = relative.trim_start_matches('/');
            return self
                .classpath_roots
                .iter()
                .map(|root| root.join(relative))
                .collect();
        }

        if location.starts_with("file:") {
            if let Ok(url) = url::Url::parse(location)
                && let Ok(path) = url.to_file_path()
            {
                return vec![path];
            }
            // `file:relative/path` is not a valid URL but is common in configs
            return vec![PathBuf::from(location.trim_start_matches("file:"))];
        }

        vec![PathBuf::from(location)]
    }
}

impl Default for FileSystemResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResourceResolver for FileSystemResolver {
    async fn resolve(&self, location: &str) -> Result<Zeroizing<Vec<u8>>, ResolveError> {
        let candidates = self.candidates(location);
        let mut last_error = None;

        for path in &candidates {
            trace!(path = %path.display(), "Trying resource candidate");
            match tokio::fs::read(path).await {
                Ok(bytes) => {
                    debug!(location, path = %path.display(), "Resolved resource");
                    return Ok(Zeroizing::new(bytes));
                }
                Err(e) => last_error = Some(describe(path, &e)),
            }
        }

        Err(ResolveError::new(last_error.unwrap_or_else(|| {
            format!("no candidate paths for '{location}'")
        })))
    }
}

fn describe(path: &Path, error: &std::io::Error) -> String {
    format!("{}: {error}", path.display())
}

/// In-memory resolver for embedded material and tests
#[derive(Default)]
pub struct StaticResolver {
    entries: HashMap<String, Zeroizing<Vec<u8>>>,
}

impl StaticResolver {
    /// Empty resolver
    pub fn new() -> Self {
        Self::default()
    }

    /// Register bytes under a location
    pub fn with(mut self, location: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        self.insert(location, bytes);
        self
    }

    /// Register or replace bytes under a location
    pub fn insert(&mut self, location: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        self.entries
            .insert(location.into(), Zeroizing::new(bytes.into()));
    }
}

impl std::fmt::Debug for StaticResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticResolver")
            .field("locations", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[async_trait]
impl ResourceResolver for StaticResolver {
    async fn resolve(&self, location: &str) -> Result<Zeroizing<Vec<u8>>, ResolveError> {
        self.entries
            .get(location)
            .cloned()
            .ok_or_else(|| ResolveError::new(format!("no resource registered for '{location}'")))
    }
}
