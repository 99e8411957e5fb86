use crate::invocation::Invocation;
use crate::signal::kill_process_group;
use crate::ExecError;
use std::io::Read;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};
use wait_timeout::ChildExt;

/// Result of a child that ran to completion.
///
/// A non-zero exit is still a normal result; only failing to start or
/// overrunning the time limit is an [`ExecError`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutput {
    /// `-1` when the child was terminated by a signal.
    pub exit_code: i32,
    /// stdout and stderr as written to the shared pipe.
    pub output: String,
}

impl RunOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Run to completion and capture combined output.
pub fn run(invocation: &Invocation) -> Result<RunOutput, ExecError> {
    info!("running {}", invocation.display());
    let (mut child, mut reader) = invocation.spawn_merged()?;
    let pgid = child.id();

    // Drain while the child runs; a full pipe would otherwise stall it.
    let collector: JoinHandle<Vec<u8>> = thread::spawn(move || {
        let mut buf = Vec::new();
        if let Err(e) = reader.read_to_end(&mut buf) {
            warn!("reading child output failed: {e}");
        }
        buf
    });

    let status = match invocation.time_limit() {
        Some(limit) => match child.wait_timeout(limit)? {
            Some(status) => status,
            None => {
                warn!(
                    "{} exceeded {}s, terminating",
                    invocation.display(),
                    limit.as_secs()
                );
                kill_process_group(pgid);
                let _ = child.kill();
                let _ = child.wait();
                return Err(ExecError::TimedOut {
                    command: invocation.display(),
                    after: limit,
                    output: collect(collector),
                });
            }
        },
        None => child.wait()?,
    };

    let output = collect(collector);
    let exit_code = status.code().unwrap_or(-1);
    debug!(
        "{} exited with {exit_code} ({} bytes of output)",
        invocation.display(),
        output.len()
    );
    Ok(RunOutput { exit_code, output })
}

fn collect(handle: JoinHandle<Vec<u8>>) -> String {
    let bytes = handle.join().unwrap_or_default();
    String::from_utf8_lossy(&bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn sh(script: &str) -> Invocation {
        Invocation::new("/bin/sh").args(["-c", script])
    }

    #[test]
    fn captures_exit_code_and_output() {
        let out = run(&sh("echo hello; echo oops >&2; exit 7")).unwrap();
        assert_eq!(out.exit_code, 7);
        assert!(!out.success());
        assert!(out.output.contains("hello"));
        assert!(out.output.contains("oops"));
    }

    #[test]
    fn zero_exit_is_success() {
        let out = run(&sh("printf 'done'")).unwrap();
        assert!(out.success());
        assert_eq!(out.output, "done");
    }

    #[test]
    fn large_output_does_not_deadlock() {
        let out = run(&sh("i=0; while [ $i -lt 20000 ]; do echo line-$i; i=$((i+1)); done")).unwrap();
        assert!(out.success());
        assert_eq!(out.output.lines().count(), 20000);
    }

    #[test]
    fn honours_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        let out = run(&sh("pwd").current_dir(dir.path())).unwrap();
        let expected = std::fs::canonicalize(dir.path()).unwrap();
        assert_eq!(out.output.trim(), expected.to_string_lossy());
    }

    #[test]
    fn timeout_kills_and_keeps_partial_output() {
        let start = Instant::now();
        let err = run(&sh("echo early; sleep 30").timeout(Duration::from_millis(300))).unwrap_err();
        assert!(start.elapsed() < Duration::from_secs(10));
        match err {
            ExecError::TimedOut { output, after, .. } => {
                assert_eq!(after, Duration::from_millis(300));
                assert!(output.contains("early"));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[test]
    fn timeout_reaches_grandchildren() {
        let start = Instant::now();
        let err = run(&sh("sleep 30 & wait").timeout(Duration::from_millis(200))).unwrap_err();
        assert!(matches!(err, ExecError::TimedOut { .. }));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn missing_executable_is_spawn_error() {
        let err = run(&Invocation::new("/no/such/env/bin/python")).unwrap_err();
        assert!(matches!(err, ExecError::Spawn { .. }));
    }
}
