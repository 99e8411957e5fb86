//! Child-process execution for pyops.
//!
//! Two runners share one spawning path: [`run`] waits for the child and
//! returns everything it printed, [`stream`] hands output back line by line
//! while the child is still running. Both merge stdout and stderr onto a
//! single pipe, so the combined order is the order the kernel saw the writes.

pub mod invocation;
pub mod process;
mod signal;
pub mod stream;

pub use invocation::Invocation;
pub use process::{run, RunOutput};
pub use stream::{stream, stream_with_input, Next, OutputStream};

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("'{command}' timed out after {}s", .after.as_secs())]
    TimedOut {
        command: String,
        after: Duration,
        output: String,
    },
    #[error("process I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exec_error_display_spawn() {
        let e = ExecError::Spawn {
            program: "/nope/python".to_owned(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        assert!(e.to_string().contains("/nope/python"));
    }

    #[test]
    fn exec_error_display_timeout() {
        let e = ExecError::TimedOut {
            command: "python x.py".to_owned(),
            after: Duration::from_secs(180),
            output: String::new(),
        };
        let msg = e.to_string();
        assert!(msg.contains("python x.py"));
        assert!(msg.contains("180s"));
    }
}
