//! `multipart/x-mixed-replace` output for browsers and `<img>` tags.

use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use anyhow::Result;

use crate::error::PipelineError;
use crate::session::{Session, Sink, TickOutput};

pub const BOUNDARY: &str = "frame";
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);
/// Reads per check before giving up on draining a chatty client.
const MAX_DRAIN_READS: usize = 64;

pub struct MjpegSink<W> {
    out: W,
    started: bool,
    broken: bool,
}

impl<W: Write> MjpegSink<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            started: false,
            broken: false,
        }
    }

    /// A failed write means the consumer is gone for good.
    fn track<T>(&mut self, result: Result<T>) -> Result<T> {
        if result.is_err() {
            self.broken = true;
        }
        result
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn write_part(&mut self, jpeg: &[u8]) -> Result<()> {
        let header = format!(
            "--{BOUNDARY}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
            jpeg.len()
        );
        self.out.write_all(header.as_bytes())?;
        self.out.write_all(jpeg)?;
        self.out.write_all(b"\r\n")?;
        self.out.flush()?;
        Ok(())
    }
}

impl<W: Write + PeerLiveness> Sink for MjpegSink<W> {
    fn open(&mut self) -> Result<()> {
        let header = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: multipart/x-mixed-replace; boundary={BOUNDARY}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n"
        );
        let written = self
            .out
            .write_all(header.as_bytes())
            .and_then(|_| self.out.flush())
            .map_err(anyhow::Error::from);
        self.track(written)?;
        self.started = true;
        Ok(())
    }

    fn emit(&mut self, tick: &TickOutput) -> Result<()> {
        let written = self.write_part(&tick.jpeg);
        self.track(written)
    }

    fn poll_closed(&mut self) -> bool {
        if !self.broken && self.out.peer_closed() {
            self.broken = true;
        }
        self.broken
    }

    fn fail(&mut self, err: &PipelineError) {
        if self.started {
            // Headers are gone; the only signal left is ending the stream.
            return;
        }
        let body = serde_json::json!({ "error": err.to_string() }).to_string();
        let response = format!(
            "{}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n{}",
            super::status_line(err.http_status()),
            body.len(),
            body
        );
        if let Err(write_err) = self.out.write_all(response.as_bytes()) {
            log::debug!("could not report session error: {}", write_err);
        }
    }
}

/// Check for a consumer that hung up.
pub trait PeerLiveness {
    fn peer_closed(&mut self) -> bool;
}

/// The stream is one-way after the request, so anything the client sends
/// is read and discarded until end of stream or nothing is pending.
impl PeerLiveness for TcpStream {
    fn peer_closed(&mut self) -> bool {
        if self.set_nonblocking(true).is_err() {
            return true;
        }
        let mut scratch = [0u8; 512];
        let mut closed = false;
        for _ in 0..MAX_DRAIN_READS {
            match self.read(&mut scratch) {
                Ok(0) => {
                    closed = true;
                    break;
                }
                Ok(_) => continue,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(_) => {
                    closed = true;
                    break;
                }
            }
        }
        if self.set_nonblocking(false).is_err() {
            return true;
        }
        closed
    }
}

impl PeerLiveness for Vec<u8> {
    fn peer_closed(&mut self) -> bool {
        false
    }
}

pub fn serve(stream: TcpStream, mut session: Session) -> Result<()> {
    stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
    let mut sink = MjpegSink::new(stream);
    if let Err(err) = session.run(&mut sink) {
        log::info!("mjpeg session ended: {}", err);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    #[test]
    fn parts_carry_boundary_and_length() {
        let mut sink = MjpegSink::new(Vec::new());
        sink.open().unwrap();
        sink.write_part(&[0xFF, 0xD8, 0xFF, 0xD9]).unwrap();
        let out = sink.into_inner();
        let text = String::from_utf8_lossy(&out);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("multipart/x-mixed-replace; boundary=frame"));
        assert!(text.contains("--frame\r\nContent-Type: image/jpeg\r\nContent-Length: 4\r\n\r\n"));
        assert!(out.ends_with(&[0xFF, 0xD8, 0xFF, 0xD9, b'\r', b'\n']));
    }

    #[test]
    fn failure_before_start_is_a_json_error() {
        let mut sink = MjpegSink::new(Vec::new());
        sink.fail(&PipelineError::RateLimited {
            camera_id: 5,
            retry_after: StdDuration::from_secs(10),
        });
        let text = String::from_utf8(sink.into_inner()).unwrap();
        assert!(text.starts_with("HTTP/1.1 503 Service Unavailable\r\n"));
        assert!(text.contains("application/json"));
        assert!(text.contains("rate limited"));
    }

    #[test]
    fn failure_after_start_writes_nothing_more() {
        let mut sink = MjpegSink::new(Vec::new());
        sink.open().unwrap();
        let len = sink.out.len();
        sink.fail(&PipelineError::EngineNotReady("gone".into()));
        assert_eq!(sink.into_inner().len(), len);
    }

    struct BrokenPipe;

    impl Write for BrokenPipe {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::new(ErrorKind::BrokenPipe, "peer reset"))
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl PeerLiveness for BrokenPipe {
        fn peer_closed(&mut self) -> bool {
            false
        }
    }

    #[test]
    fn write_error_marks_consumer_gone() {
        let mut sink = MjpegSink::new(BrokenPipe);
        assert!(!sink.poll_closed());
        assert!(sink.open().is_err());
        assert!(sink.poll_closed());
    }

    #[test]
    fn hangup_is_seen_behind_unread_client_bytes() {
        use std::net::{Shutdown, TcpListener};

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (mut server, _) = listener.accept().unwrap();

        client.write_all(b"stray bytes after the request").unwrap();
        std::thread::sleep(StdDuration::from_millis(50));
        assert!(!server.peer_closed());

        client.write_all(b"more").unwrap();
        client.shutdown(Shutdown::Write).unwrap();
        std::thread::sleep(StdDuration::from_millis(50));
        assert!(server.peer_closed());
    }
}
