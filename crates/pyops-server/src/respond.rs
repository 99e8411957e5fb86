use crate::peer::PeerWatch;
use pyops_exec::{Next, OutputStream};
use serde_json::Value;
use std::io::{self, Write};
use std::time::Duration;
use tiny_http::{Header, Request, Response, StatusCode};
use tracing::{debug, info, warn};

/// How long a quiet command may go before the client connection is checked.
const HANGUP_POLL: Duration = Duration::from_millis(250);

const STREAM_HEAD: &str = "HTTP/1.1 200 OK\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
Cache-Control: no-cache, no-store\r\n\
X-Accel-Buffering: no\r\n\
X-Content-Type-Options: nosniff\r\n\
Transfer-Encoding: chunked\r\n\
Connection: close\r\n\r\n";

/// What a handler produced.
pub enum Reply {
    Json(u16, Value),
    Text(u16, String),
    Stream(OutputStream),
}

impl Reply {
    pub fn ok(value: Value) -> Self {
        Self::Json(200, value)
    }

    pub fn status(&self) -> u16 {
        match self {
            Self::Json(code, _) | Self::Text(code, _) => *code,
            Self::Stream(_) => 200,
        }
    }
}

pub fn send(req: Request, reply: Reply) {
    match reply {
        Reply::Json(code, value) => respond_json(req, code, &value),
        Reply::Text(code, text) => respond_text(req, code, text),
        Reply::Stream(lines) => respond_stream(req, lines),
    }
}

pub fn respond_json(req: Request, code: u16, value: &Value) {
    let body = serde_json::to_vec(value).unwrap_or_else(|_| b"{}".to_vec());
    let header =
        Header::from_bytes("Content-Type", "application/json").expect("valid header");
    let _ = req.respond(
        Response::from_data(body)
            .with_status_code(StatusCode(code))
            .with_header(header),
    );
}

pub fn respond_text(req: Request, code: u16, text: String) {
    let header = Header::from_bytes("Content-Type", "text/plain; charset=utf-8")
        .expect("valid header");
    let _ = req.respond(
        Response::from_string(text)
            .with_status_code(StatusCode(code))
            .with_header(header),
    );
}

/// Write the stream as chunked text/plain, one HTTP chunk per line.
///
/// The stream is dropped as soon as the client is gone, which terminates the
/// command and releases its temporary input. A failed write shows that for a
/// chatty command; a quiet one is caught by watching the connection.
pub fn respond_stream(req: Request, mut lines: OutputStream) {
    let label = lines.command_line().to_owned();
    let watch = req.remote_addr().copied().and_then(PeerWatch::attach);
    if watch.is_none() {
        debug!("no hang-up watch for {label}");
    }
    let mut writer = req.into_writer();
    let hung_up = || watch.as_ref().is_some_and(PeerWatch::hung_up);
    match relay(&mut writer, &mut lines, hung_up) {
        Ok(Relay::Delivered) => debug!("stream for {label} delivered"),
        Ok(Relay::PeerGone) => info!("client left quiet stream for {label}"),
        Err(e) => warn!("client left stream for {label}: {e}"),
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Relay {
    Delivered,
    PeerGone,
}

/// Copy `lines` to `writer` until the command finishes or `hung_up` reports
/// the client gone during a quiet period.
pub(crate) fn relay<W, F>(
    writer: &mut W,
    lines: &mut OutputStream,
    hung_up: F,
) -> io::Result<Relay>
where
    W: Write + ?Sized,
    F: Fn() -> bool,
{
    writer.write_all(STREAM_HEAD.as_bytes())?;
    writer.flush()?;
    loop {
        match lines.next_within(HANGUP_POLL) {
            Next::Item(line) => write_chunk(writer, &line)?,
            Next::Pending if hung_up() => return Ok(Relay::PeerGone),
            Next::Pending => {}
            Next::Finished => break,
        }
    }
    writer.write_all(b"0\r\n\r\n")?;
    writer.flush()?;
    Ok(Relay::Delivered)
}

fn write_chunk<W: Write + ?Sized>(writer: &mut W, line: &str) -> io::Result<()> {
    write!(writer, "{:x}\r\n", line.len())?;
    writer.write_all(line.as_bytes())?;
    writer.write_all(b"\r\n")?;
    writer.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pyops_exec::{stream, Invocation};
    use std::path::Path;
    use std::time::Instant;

    fn sh(script: &str) -> OutputStream {
        stream(&Invocation::new("/bin/sh").arg("-c").arg(script)).unwrap()
    }

    fn body_of(out: Vec<u8>) -> String {
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Transfer-Encoding: chunked\r\n"));
        assert!(text.contains("Cache-Control: no-cache"));
        text.split_once("\r\n\r\n").unwrap().1.to_owned()
    }

    #[test]
    fn chunked_framing() {
        let mut lines = sh("echo a; sleep 1; echo bb");
        let mut out = Vec::new();
        let outcome = relay(&mut out, &mut lines, || false).unwrap();
        assert_eq!(outcome, Relay::Delivered);

        let body = body_of(out);
        let (size, rest) = body.split_once("\r\n").unwrap();
        assert!(rest.starts_with("$ /bin/sh -c "));
        assert_eq!(usize::from_str_radix(size, 16).unwrap(), rest.find('\n').unwrap() + 1);
        assert!(body.ends_with("2\r\na\n\r\n3\r\nbb\n\r\n9\r\n[exit 0]\n\r\n0\r\n\r\n"));
    }

    #[test]
    fn quiet_command_stops_when_client_leaves() {
        let mut lines = sh("echo go; exec sleep 30");
        let pid = lines.pid();
        let start = Instant::now();
        let mut out = Vec::new();
        let outcome = relay(&mut out, &mut lines, || true).unwrap();
        assert_eq!(outcome, Relay::PeerGone);
        assert!(!body_of(out).ends_with("0\r\n\r\n"));

        drop(lines);
        let proc_dir = format!("/proc/{pid}");
        while Path::new(&proc_dir).exists() {
            assert!(start.elapsed() < Duration::from_secs(10), "child outlived the client");
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    struct Broken;

    impl Write for Broken {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            Err(io::Error::from(io::ErrorKind::BrokenPipe))
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn chunked_write_error_surfaces() {
        let mut lines = sh("echo x");
        let err = relay(&mut Broken, &mut lines, || false).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn reply_status() {
        assert_eq!(Reply::ok(Value::Null).status(), 200);
        assert_eq!(Reply::Text(400, String::new()).status(), 400);
    }
}
