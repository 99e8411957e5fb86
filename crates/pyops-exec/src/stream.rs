use crate::invocation::Invocation;
use crate::signal::kill_process_group;
use crate::ExecError;
use os_pipe::PipeReader;
use std::io::{BufRead, BufReader};
use std::iter::FusedIterator;
use std::process::Child;
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;
use tempfile::TempPath;
use tracing::{debug, info, warn};

const REAP_POLL: Duration = Duration::from_millis(25);

/// State shared by the producer thread and the [`OutputStream`].
///
/// Dropped when both sides are gone; the temporary input goes with it.
struct Session {
    pid: u32,
    label: String,
    reaped: Mutex<bool>,
    input: Option<TempPath>,
}

impl Session {
    /// Kill the child's process group unless it has already been reaped.
    ///
    /// The check and the kill happen under the same lock the reaper holds
    /// while calling `try_wait`, so a recycled pid is never signalled.
    fn terminate(&self) {
        let reaped = self.reaped.lock().unwrap_or_else(PoisonError::into_inner);
        if !*reaped {
            kill_process_group(self.pid);
        }
    }

    fn reap(&self, child: &mut Child) -> i32 {
        loop {
            {
                let mut reaped = self.reaped.lock().unwrap_or_else(PoisonError::into_inner);
                match child.try_wait() {
                    Ok(Some(status)) => {
                        *reaped = true;
                        return status.code().unwrap_or(-1);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!("waiting on {} failed: {e}", self.label);
                        *reaped = true;
                        return -1;
                    }
                }
            }
            thread::sleep(REAP_POLL);
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(path) = self.input.take() {
            let shown = path.display().to_string();
            match path.close() {
                Ok(()) => debug!("removed temporary input {shown}"),
                Err(e) => warn!("failed to remove temporary input {shown}: {e}"),
            }
        }
    }
}

/// Result of waiting a bounded time on an [`OutputStream`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Next {
    Item(String),
    /// Nothing arrived within the wait; the command is still running.
    Pending,
    Finished,
}

/// Live output of one running command.
///
/// Yields a `$ <command>` preamble, one item per output line, then
/// `[exit <code>]`. Every item ends with exactly one `\n`. The stream is
/// one-shot; dropping it before the trailer kills the command.
pub struct OutputStream {
    preamble: Option<String>,
    lines: Receiver<String>,
    session: Arc<Session>,
    done: bool,
}

impl OutputStream {
    pub fn pid(&self) -> u32 {
        self.session.pid
    }

    pub fn command_line(&self) -> &str {
        &self.session.label
    }

    /// Like [`Iterator::next`], but returns [`Next::Pending`] after `wait`
    /// so the consumer can check on its own peer while the command is quiet.
    pub fn next_within(&mut self, wait: Duration) -> Next {
        if let Some(preamble) = self.preamble.take() {
            return Next::Item(preamble);
        }
        if self.done {
            return Next::Finished;
        }
        match self.lines.recv_timeout(wait) {
            Ok(line) => Next::Item(line),
            Err(RecvTimeoutError::Timeout) => Next::Pending,
            Err(RecvTimeoutError::Disconnected) => {
                self.done = true;
                Next::Finished
            }
        }
    }
}

impl Iterator for OutputStream {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        if let Some(preamble) = self.preamble.take() {
            return Some(preamble);
        }
        if self.done {
            return None;
        }
        match self.lines.recv() {
            Ok(line) => Some(line),
            Err(_) => {
                self.done = true;
                None
            }
        }
    }
}

impl FusedIterator for OutputStream {}

impl Drop for OutputStream {
    fn drop(&mut self) {
        if !self.done {
            debug!("stream for {} dropped early", self.session.label);
        }
        self.session.terminate();
    }
}

/// Start `invocation` and stream its combined output.
pub fn stream(invocation: &Invocation) -> Result<OutputStream, ExecError> {
    stream_with_input(invocation, None)
}

/// Like [`stream`], but ties a temporary input file to the stream's lifetime.
///
/// The file is removed after the command has been reaped and the stream has
/// been dropped, whether it was drained or abandoned. If the command cannot
/// be started the file is removed immediately and no output is produced.
pub fn stream_with_input(
    invocation: &Invocation,
    input: Option<TempPath>,
) -> Result<OutputStream, ExecError> {
    let label = invocation.display();
    let (child, reader) = invocation.spawn_merged()?;
    let pid = child.id();
    info!("streaming {label} (pid {pid})");

    let session = Arc::new(Session {
        pid,
        label: label.clone(),
        reaped: Mutex::new(false),
        input,
    });
    let (tx, rx) = sync_channel(0);

    let producer = Arc::clone(&session);
    thread::spawn(move || pump(child, reader, &producer, &tx));

    Ok(OutputStream {
        preamble: Some(format!("$ {label}\n")),
        lines: rx,
        session,
        done: false,
    })
}

fn pump(mut child: Child, reader: PipeReader, session: &Session, tx: &SyncSender<String>) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut abandoned = false;
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                if tx.send(frame_line(&buf)).is_err() {
                    debug!("consumer of {} went away, terminating", session.label);
                    session.terminate();
                    abandoned = true;
                    break;
                }
            }
            Err(e) => {
                warn!("reading output of {} failed: {e}", session.label);
                session.terminate();
                break;
            }
        }
    }
    drop(reader);

    let code = session.reap(&mut child);
    if abandoned || tx.send(format!("[exit {code}]\n")).is_err() {
        info!(
            "{} exited with code {code}; nobody was reading its stream",
            session.label
        );
    } else {
        debug!("{} exited with code {code}", session.label);
    }
}

/// Normalise one raw line: drop trailing CR/LF, keep only the last
/// carriage-return segment (what a terminal would show), end with `\n`.
fn frame_line(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    let trimmed = text.trim_end_matches(|c: char| c == '\n' || c == '\r');
    let visible = trimmed.rsplit('\r').next().unwrap_or(trimmed);
    let mut line = String::with_capacity(visible.len() + 1);
    line.push_str(visible);
    line.push('\n');
    line
}
