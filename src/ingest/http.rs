use std::io::Read;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};

use super::{FrameSource, SourceStats};
use crate::frame::{Frame, MAX_JPEG_BYTES};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const SNAPSHOT_INTERVAL: Duration = Duration::from_millis(200);
const STALL_GRACE: Duration = Duration::from_secs(5);

/// HTTP camera source: multipart MJPEG streams or polled JPEG snapshots,
/// chosen by the response content type.
pub struct HttpJpegSource {
    url: String,
    stream: Option<HttpStream>,
    last_frame_at: Option<Instant>,
    connected_at: Option<Instant>,
    frame_count: u64,
    last_error: Option<String>,
}

enum HttpStream {
    Mjpeg(MjpegReader),
    Snapshot,
}

impl HttpJpegSource {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            stream: None,
            last_frame_at: None,
            connected_at: None,
            frame_count: 0,
            last_error: None,
        }
    }

    fn agent() -> ureq::Agent {
        ureq::AgentBuilder::new()
            .timeout_connect(CONNECT_TIMEOUT)
            .timeout_read(CONNECT_TIMEOUT)
            .build()
    }

    fn fail(&mut self, err: anyhow::Error) -> anyhow::Error {
        self.last_error = Some(format!("{:#}", err));
        err
    }
}

impl FrameSource for HttpJpegSource {
    fn connect(&mut self) -> Result<()> {
        let response = Self::agent()
            .get(&self.url)
            .call()
            .with_context(|| format!("connect to http stream {}", self.url))?;
        let content_type = response.header("Content-Type").unwrap_or("").to_lowercase();
        if content_type.contains("multipart") {
            self.stream = Some(HttpStream::Mjpeg(MjpegReader::new(response.into_reader())));
        } else {
            self.stream = Some(HttpStream::Snapshot);
        }
        self.connected_at = Some(Instant::now());
        self.last_error = None;
        log::info!("HttpJpegSource: connected to {} ({})", self.url, content_type);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let bytes = match self.stream.as_mut() {
            None => return Err(anyhow!("http source not connected; call connect() first")),
            Some(HttpStream::Mjpeg(reader)) => reader.read_next_jpeg(),
            Some(HttpStream::Snapshot) => {
                if self
                    .last_frame_at
                    .is_some_and(|last| last.elapsed() < SNAPSHOT_INTERVAL)
                {
                    return Ok(None);
                }
                fetch_snapshot(&self.url)
            }
        };
        let bytes = bytes.map_err(|err| self.fail(err))?;
        let frame = Frame::decode_jpeg(&bytes, self.frame_count + 1).map_err(|err| self.fail(err))?;
        self.frame_count += 1;
        self.last_frame_at = Some(Instant::now());
        Ok(Some(frame))
    }

    fn is_healthy(&self) -> bool {
        if self.last_error.is_some() {
            return false;
        }
        let Some(connected_at) = self.connected_at else {
            return false;
        };
        match self.last_frame_at {
            Some(last) => last.elapsed() <= STALL_GRACE,
            None => connected_at.elapsed() <= STALL_GRACE,
        }
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            source: self.url.clone(),
        }
    }
}

fn fetch_snapshot(url: &str) -> Result<Vec<u8>> {
    let response = HttpJpegSource::agent()
        .get(url)
        .call()
        .with_context(|| format!("fetch jpeg snapshot from {}", url))?;
    let mut bytes = Vec::new();
    response
        .into_reader()
        .take(MAX_JPEG_BYTES as u64 + 1)
        .read_to_end(&mut bytes)
        .context("read jpeg snapshot")?;
    if bytes.is_empty() {
        return Err(anyhow!("empty jpeg snapshot"));
    }
    Ok(bytes)
}

/// Splits a multipart body into JPEGs by SOI/EOI markers, ignoring part
/// headers entirely.
struct MjpegReader {
    reader: Box<dyn Read + Send>,
    buffer: Vec<u8>,
}

impl MjpegReader {
    fn new(reader: Box<dyn Read + Send>) -> Self {
        Self {
            reader,
            buffer: Vec::with_capacity(64 * 1024),
        }
    }

    fn read_next_jpeg(&mut self) -> Result<Vec<u8>> {
        let mut chunk = vec![0u8; 8192];
        loop {
            if let Some((start, end)) = find_jpeg_bounds(&self.buffer) {
                let frame = self.buffer[start..end].to_vec();
                self.buffer.drain(..end);
                return Ok(frame);
            }

            let read = self.reader.read(&mut chunk).context("read mjpeg chunk")?;
            if read == 0 {
                return Err(anyhow!("mjpeg stream ended"));
            }
            self.buffer.extend_from_slice(&chunk[..read]);

            if self.buffer.len() > MAX_JPEG_BYTES * 2 {
                let drain_len = self.buffer.len() - 2;
                self.buffer.drain(..drain_len);
            }
        }
    }
}

fn find_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let start = buffer.windows(2).position(|w| w == [0xFF, 0xD8])?;
    let end = buffer[start + 2..]
        .windows(2)
        .position(|w| w == [0xFF, 0xD9])?;
    Some((start, start + 2 + end + 2))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::encode_jpeg;
    use image::RgbImage;
    use std::io::Cursor;

    #[test]
    fn jpeg_bounds_skip_part_headers() {
        let data = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n\xFF\xD8abc\xFF\xD9\r\n";
        let (start, end) = find_jpeg_bounds(data).unwrap();
        assert_eq!(&data[start..end], b"\xFF\xD8abc\xFF\xD9");
        assert!(find_jpeg_bounds(b"\xFF\xD8 no end").is_none());
    }

    #[test]
    fn mjpeg_reader_yields_consecutive_frames() {
        let jpeg = encode_jpeg(&RgbImage::new(8, 8), 80).unwrap();
        let mut body = Vec::new();
        for _ in 0..2 {
            body.extend_from_slice(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n");
            body.extend_from_slice(&jpeg);
            body.extend_from_slice(b"\r\n");
        }
        let mut reader = MjpegReader::new(Box::new(Cursor::new(body)));
        assert_eq!(reader.read_next_jpeg().unwrap(), jpeg);
        assert_eq!(reader.read_next_jpeg().unwrap(), jpeg);
        assert!(reader.read_next_jpeg().is_err());
    }
}
