use crate::name::validate_env_name;
use crate::EnvError;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A named environment and the root it lives under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Environment {
    pub name: String,
    pub root: PathBuf,
    pub path: PathBuf,
}

impl Environment {
    fn new(name: &str, root: &Path) -> Self {
        Self {
            name: name.to_owned(),
            root: root.to_path_buf(),
            path: root.join(name),
        }
    }

    /// Interpreter inside the environment. May not exist yet.
    #[inline]
    pub fn python(&self) -> PathBuf {
        self.path.join("bin").join("python")
    }

    pub fn exists(&self) -> bool {
        self.path.is_dir()
    }
}

/// Ordered set of search roots. The first root is where new environments go.
///
/// Lookups never create anything on disk.
#[derive(Debug, Clone)]
pub struct EnvRegistry {
    roots: Vec<PathBuf>,
}

impl EnvRegistry {
    pub fn new(roots: Vec<PathBuf>) -> Result<Self, EnvError> {
        if roots.is_empty() {
            return Err(EnvError::NoRoots);
        }
        Ok(Self { roots })
    }

    #[inline]
    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    #[inline]
    pub fn default_root(&self) -> &Path {
        &self.roots[0]
    }

    #[inline]
    pub fn default_path_for(&self, name: &str) -> PathBuf {
        self.default_root().join(name)
    }

    /// First root (in priority order) holding a directory called `name`.
    ///
    /// Symlinks are followed for the directory test; rejecting them is the
    /// deletion guard's job.
    pub fn resolve(&self, name: &str) -> Option<Environment> {
        let found = self
            .roots
            .iter()
            .find(|root| root.join(name).is_dir())
            .map(|root| Environment::new(name, root));
        if let Some(env) = &found {
            debug!("resolved '{name}' to {}", env.path.display());
        }
        found
    }

    /// Resolve `name`, or anchor it at the default root when it does not exist yet.
    pub fn locate(&self, name: &str) -> Environment {
        self.resolve(name)
            .unwrap_or_else(|| Environment::new(name, self.default_root()))
    }

    /// Union of environment names across every root, sorted and deduplicated.
    ///
    /// Entries that are not directories, hidden entries, and names that could
    /// not be addressed through the API are skipped. Unreadable roots are
    /// logged and ignored.
    pub fn list(&self) -> Vec<String> {
        let mut names = BTreeSet::new();
        for root in &self.roots {
            let entries = match fs::read_dir(root) {
                Ok(rd) => rd,
                Err(e) => {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!("cannot list root {}: {e}", root.display());
                    }
                    continue;
                }
            };
            for entry in entries.filter_map(Result::ok) {
                let Some(name) = entry.file_name().to_str().map(String::from) else {
                    continue;
                };
                if name.starts_with('.') || validate_env_name(&name).is_err() {
                    continue;
                }
                if entry.path().is_dir() {
                    names.insert(name);
                }
            }
        }
        names.into_iter().collect()
    }
}
