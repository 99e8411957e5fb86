use crate::registry::EnvRegistry;
use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// The service's own runtime. Never removable through the API.
pub const PROTECTED_ENV: &str = "pyops";

/// Why a delete was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Denial {
    Protected,
    NotFound,
    NotADirectory,
    Symlink,
    OutsideRoots,
    RemovalFailed(String),
}

impl fmt::Display for Denial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Protected => f.write_str("protected environment"),
            Self::NotFound => f.write_str("not found"),
            Self::NotADirectory => f.write_str("not a directory"),
            Self::Symlink => f.write_str("symlink not allowed"),
            Self::OutsideRoots => f.write_str("outside allowed roots"),
            Self::RemovalFailed(msg) => write!(f, "removal failed: {msg}"),
        }
    }
}

impl std::error::Error for Denial {}

#[derive(Debug, Clone)]
pub struct DeletionGuard {
    roots: Vec<PathBuf>,
    protected: BTreeSet<String>,
}

impl DeletionGuard {
    pub fn new(roots: Vec<PathBuf>, protected: impl IntoIterator<Item = String>) -> Self {
        Self {
            roots,
            protected: protected.into_iter().collect(),
        }
    }

    /// Guard over the registry's roots protecting only [`PROTECTED_ENV`].
    pub fn for_registry(registry: &EnvRegistry) -> Self {
        Self::new(registry.roots().to_vec(), [PROTECTED_ENV.to_owned()])
    }

    pub fn is_protected(&self, name: &str) -> bool {
        self.protected.contains(name)
    }

    /// First failing check wins: protected name, missing path, non-directory,
    /// symlink, real path not strictly inside a configured root.
    pub fn may_delete(&self, name: &str, path: &Path) -> Result<(), Denial> {
        if self.is_protected(name) {
            return Err(Denial::Protected);
        }

        let meta = fs::metadata(path).map_err(|_| Denial::NotFound)?;
        if !meta.is_dir() {
            return Err(Denial::NotADirectory);
        }

        let link_meta = fs::symlink_metadata(path).map_err(|_| Denial::NotFound)?;
        if link_meta.file_type().is_symlink() {
            return Err(Denial::Symlink);
        }

        let real = fs::canonicalize(path).map_err(|_| Denial::NotFound)?;
        if !self.inside_roots(&real) {
            return Err(Denial::OutsideRoots);
        }

        Ok(())
    }

    fn inside_roots(&self, real: &Path) -> bool {
        self.roots
            .iter()
            .filter_map(|root| fs::canonicalize(root).ok())
            .any(|root| real != root && real.starts_with(&root))
    }
}

/// Locate `name`, run it past the guard, and remove the directory tree.
///
/// Returns the removed path. A failed removal (permissions, a concurrent
/// delete) is reported as a denial rather than an error.
pub fn remove_environment(
    registry: &EnvRegistry,
    guard: &DeletionGuard,
    name: &str,
) -> Result<PathBuf, Denial> {
    let env = registry.locate(name);
    guard.may_delete(name, &env.path)?;

    info!("deleting environment '{name}' at {}", env.path.display());
    fs::remove_dir_all(&env.path).map_err(|e| {
        warn!("failed to remove {}: {e}", env.path.display());
        Denial::RemovalFailed(e.to_string())
    })?;
    Ok(env.path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;

    struct Fixture {
        _dir: tempfile::TempDir,
        outside: PathBuf,
        registry: EnvRegistry,
        guard: DeletionGuard,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let primary = dir.path().join("primary");
        let secondary = dir.path().join("secondary");
        let outside = dir.path().join("outside");
        for d in [&primary, &secondary, &outside] {
            fs::create_dir_all(d).unwrap();
        }
        let registry = EnvRegistry::new(vec![primary, secondary]).unwrap();
        let guard = DeletionGuard::for_registry(&registry);
        Fixture {
            _dir: dir,
            outside,
            registry,
            guard,
        }
    }

    #[test]
    fn denial_messages() {
        assert_eq!(Denial::Protected.to_string(), "protected environment");
        assert_eq!(Denial::NotFound.to_string(), "not found");
        assert_eq!(Denial::NotADirectory.to_string(), "not a directory");
        assert_eq!(Denial::Symlink.to_string(), "symlink not allowed");
        assert_eq!(Denial::OutsideRoots.to_string(), "outside allowed roots");
        assert!(Denial::RemovalFailed("EACCES".to_owned())
            .to_string()
            .contains("EACCES"));
    }

    #[test]
    fn plain_environment_allowed_and_removed() {
        let fx = fixture();
        let path = fx.registry.default_path_for("demo");
        fs::create_dir_all(path.join("bin")).unwrap();

        assert!(fx.guard.may_delete("demo", &path).is_ok());
        let removed = remove_environment(&fx.registry, &fx.guard, "demo").unwrap();
        assert_eq!(removed, path);
        assert!(!path.exists());
    }

    #[test]
    fn removal_uses_resolved_root() {
        let fx = fixture();
        let path = fx.registry.roots()[1].join("lower");
        fs::create_dir_all(&path).unwrap();
        remove_environment(&fx.registry, &fx.guard, "lower").unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn protected_denied_when_real_directory() {
        let fx = fixture();
        let path = fx.registry.default_path_for(PROTECTED_ENV);
        fs::create_dir_all(&path).unwrap();
        assert_eq!(
            fx.guard.may_delete(PROTECTED_ENV, &path),
            Err(Denial::Protected)
        );
        assert_eq!(
            remove_environment(&fx.registry, &fx.guard, PROTECTED_ENV),
            Err(Denial::Protected)
        );
        assert!(path.exists());
    }

    #[test]
    fn protected_denied_when_missing() {
        let fx = fixture();
        let path = fx.registry.default_path_for(PROTECTED_ENV);
        assert_eq!(
            fx.guard.may_delete(PROTECTED_ENV, &path),
            Err(Denial::Protected)
        );
    }

    #[test]
    fn protected_denied_when_symlink() {
        let fx = fixture();
        let target = fx.registry.roots()[1].join("target");
        fs::create_dir_all(&target).unwrap();
        let path = fx.registry.default_path_for(PROTECTED_ENV);
        symlink(&target, &path).unwrap();
        assert_eq!(
            fx.guard.may_delete(PROTECTED_ENV, &path),
            Err(Denial::Protected)
        );
    }

    #[test]
    fn protected_denied_when_outside_roots() {
        let fx = fixture();
        let path = fx.outside.join(PROTECTED_ENV);
        fs::create_dir_all(&path).unwrap();
        assert_eq!(
            fx.guard.may_delete(PROTECTED_ENV, &path),
            Err(Denial::Protected)
        );
        assert!(path.exists());
    }

    #[test]
    fn protected_denied_from_lower_root() {
        let fx = fixture();
        let path = fx.registry.roots()[1].join(PROTECTED_ENV);
        fs::create_dir_all(&path).unwrap();
        assert_eq!(
            remove_environment(&fx.registry, &fx.guard, PROTECTED_ENV),
            Err(Denial::Protected)
        );
        assert!(path.exists());
    }

    #[test]
    fn missing_environment_not_found() {
        let fx = fixture();
        assert_eq!(
            remove_environment(&fx.registry, &fx.guard, "ghost"),
            Err(Denial::NotFound)
        );
    }

    #[test]
    fn regular_file_is_not_a_directory() {
        let fx = fixture();
        let path = fx.registry.default_path_for("file");
        fs::write(&path, b"data").unwrap();
        assert_eq!(
            fx.guard.may_delete("file", &path),
            Err(Denial::NotADirectory)
        );
    }

    #[test]
    fn symlink_to_root_contained_dir_denied() {
        let fx = fixture();
        let target = fx.registry.roots()[1].join("legit");
        fs::create_dir_all(&target).unwrap();
        let link = fx.registry.default_path_for("linked");
        symlink(&target, &link).unwrap();

        assert_eq!(fx.guard.may_delete("linked", &link), Err(Denial::Symlink));
        assert_eq!(
            remove_environment(&fx.registry, &fx.guard, "linked"),
            Err(Denial::Symlink)
        );
        assert!(target.exists());
    }

    #[test]
    fn symlink_to_outside_dir_denied() {
        let fx = fixture();
        let link = fx.registry.default_path_for("escape");
        symlink(&fx.outside, &link).unwrap();
        assert_eq!(fx.guard.may_delete("escape", &link), Err(Denial::Symlink));
        assert!(fx.outside.exists());
    }

    #[test]
    fn dangling_symlink_not_found() {
        let fx = fixture();
        let link = fx.registry.default_path_for("dangling");
        symlink(fx.outside.join("nowhere"), &link).unwrap();
        assert_eq!(fx.guard.may_delete("dangling", &link), Err(Denial::NotFound));
    }

    #[test]
    fn real_path_outside_roots_denied() {
        let fx = fixture();
        let path = fx.outside.join("stray");
        fs::create_dir_all(&path).unwrap();
        assert_eq!(
            fx.guard.may_delete("stray", &path),
            Err(Denial::OutsideRoots)
        );
        assert!(path.exists());
    }

    #[test]
    fn traversal_path_outside_roots_denied() {
        let fx = fixture();
        fs::create_dir_all(fx.outside.join("victim")).unwrap();
        let crafted = fx.registry.default_root().join("../outside/victim");
        assert_eq!(
            fx.guard.may_delete("victim", &crafted),
            Err(Denial::OutsideRoots)
        );
    }

    #[test]
    fn root_itself_is_outside() {
        let fx = fixture();
        let crafted = fx.registry.default_root().join(".");
        assert_eq!(
            fx.guard.may_delete("x", &crafted),
            Err(Denial::OutsideRoots)
        );
    }

    #[test]
    fn custom_protected_set() {
        let fx = fixture();
        let guard = DeletionGuard::new(
            fx.registry.roots().to_vec(),
            ["base".to_owned(), PROTECTED_ENV.to_owned()],
        );
        assert!(guard.is_protected("base"));
        assert!(!guard.is_protected("demo"));
        let path = fx.registry.default_path_for("base");
        fs::create_dir_all(&path).unwrap();
        assert_eq!(guard.may_delete("base", &path), Err(Denial::Protected));
    }
}
