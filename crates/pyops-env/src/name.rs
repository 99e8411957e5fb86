use crate::EnvError;

pub const MAX_NAME_LEN: usize = 32;

/// Check a name taken from external input against `[A-Za-z0-9_-]{1,32}`.
pub fn validate_env_name(name: &str) -> Result<(), EnvError> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(EnvError::InvalidName(format!(
            "'{name}': environment name must be 1-{MAX_NAME_LEN} characters"
        )));
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
    {
        return Err(EnvError::InvalidName(format!(
            "'{name}': environment name must match [A-Za-z0-9_-]"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_pattern_names() {
        for name in ["demo", "a", "py_ops-2", "ABC_def-123", &"x".repeat(32)] {
            assert!(validate_env_name(name).is_ok(), "{name} should be valid");
        }
    }

    #[test]
    fn rejects_empty_and_too_long() {
        assert!(validate_env_name("").is_err());
        assert!(validate_env_name(&"x".repeat(33)).is_err());
    }

    #[test]
    fn rejects_traversal_and_separators() {
        for name in ["..", ".", "a/b", "../etc", "a b", "name.txt", "é", "a\0b"] {
            assert!(validate_env_name(name).is_err(), "{name:?} should be rejected");
        }
    }
}
