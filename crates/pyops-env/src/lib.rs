//! Environment naming, root registry, and deletion safety for pyops.
//!
//! An environment is a directory `root/name` holding an isolated Python runtime.
//! [`EnvRegistry`] resolves names across an ordered list of search roots and
//! lists everything found under them; [`DeletionGuard`] decides whether a
//! resolved directory may be removed.

pub mod guard;
pub mod name;
pub mod registry;

pub use guard::{remove_environment, DeletionGuard, Denial, PROTECTED_ENV};
pub use name::{validate_env_name, MAX_NAME_LEN};
pub use registry::{EnvRegistry, Environment};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EnvError {
    #[error("invalid environment name: {0}")]
    InvalidName(String),
    #[error("at least one environment root must be configured")]
    NoRoots,
    #[error("environment I/O error: {0}")]
    Io(#[from] std::io::Error),
}
