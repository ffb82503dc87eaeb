//! FFmpeg-backed source for RTSP cameras and HLS playlists.

use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use ffmpeg_next as ffmpeg;

use super::{FrameSource, SourceStats};
use crate::frame::Frame;

const STALL_TIMEOUT: Duration = Duration::from_secs(5);

pub struct FfmpegSource {
    url: String,
    input: Option<ffmpeg::format::context::Input>,
    stream_index: usize,
    decoder: Option<ffmpeg::codec::decoder::Video>,
    scaler: Option<ffmpeg::software::scaling::Context>,
    frame_count: u64,
    last_frame_at: Option<Instant>,
    connected_at: Option<Instant>,
    last_error: Option<String>,
}

impl FfmpegSource {
    pub fn new(url: &str) -> Result<Self> {
        ffmpeg::init().context("initialize ffmpeg")?;
        Ok(Self {
            url: url.to_string(),
            input: None,
            stream_index: 0,
            decoder: None,
            scaler: None,
            frame_count: 0,
            last_frame_at: None,
            connected_at: None,
            last_error: None,
        })
    }

    fn decode_next(&mut self) -> Result<Option<Frame>> {
        let input = self
            .input
            .as_mut()
            .ok_or_else(|| anyhow!("ffmpeg source not connected; call connect() first"))?;
        let decoder = self
            .decoder
            .as_mut()
            .ok_or_else(|| anyhow!("ffmpeg decoder missing"))?;

        let mut decoded = ffmpeg::frame::Video::empty();
        let mut rgb_frame = ffmpeg::frame::Video::empty();

        for (stream, packet) in input.packets() {
            if stream.index() != self.stream_index {
                continue;
            }
            decoder
                .send_packet(&packet)
                .context("send packet to ffmpeg decoder")?;
            if decoder.receive_frame(&mut decoded).is_err() {
                continue;
            }

            // Resolution can change mid-stream on HLS variant switches.
            let rebuild = match &self.scaler {
                Some(s) => {
                    s.input().width != decoded.width()
                        || s.input().height != decoded.height()
                        || s.input().format != decoded.format()
                }
                None => true,
            };
            if rebuild {
                self.scaler = Some(
                    ffmpeg::software::scaling::Context::get(
                        decoded.format(),
                        decoded.width(),
                        decoded.height(),
                        ffmpeg::util::format::pixel::Pixel::RGB24,
                        decoded.width(),
                        decoded.height(),
                        ffmpeg::software::scaling::flag::Flags::BILINEAR,
                    )
                    .context("create ffmpeg scaler")?,
                );
            }
            let scaler = self
                .scaler
                .as_mut()
                .ok_or_else(|| anyhow!("ffmpeg scaler missing"))?;
            scaler
                .run(&decoded, &mut rgb_frame)
                .context("scale frame to RGB")?;
            let (pixels, width, height) = frame_to_pixels(&rgb_frame)?;
            self.frame_count += 1;
            return Frame::from_rgb(pixels, width, height, self.frame_count).map(Some);
        }
        Err(anyhow!("stream ended"))
    }
}

impl FrameSource for FfmpegSource {
    fn connect(&mut self) -> Result<()> {
        let input = ffmpeg::format::input(&self.url)
            .with_context(|| format!("failed to open '{}' with ffmpeg", self.url))?;
        let input_stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| anyhow!("stream has no video track"))?;
        self.stream_index = input_stream.index();
        let context = ffmpeg::codec::context::Context::from_parameters(input_stream.parameters())
            .context("load video decoder parameters")?;
        let decoder = context
            .decoder()
            .video()
            .context("open ffmpeg video decoder")?;
        self.decoder = Some(decoder);
        self.input = Some(input);
        self.scaler = None;
        self.connected_at = Some(Instant::now());
        self.last_error = None;
        log::info!("FfmpegSource: connected to {}", self.url);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        match self.decode_next() {
            Ok(frame) => {
                self.last_frame_at = Some(Instant::now());
                Ok(frame)
            }
            Err(err) => {
                self.last_error = Some(format!("{:#}", err));
                Err(err)
            }
        }
    }

    fn is_healthy(&self) -> bool {
        if self.last_error.is_some() {
            return false;
        }
        let Some(connected_at) = self.connected_at else {
            return false;
        };
        match self.last_frame_at {
            Some(last) => last.elapsed() <= STALL_TIMEOUT,
            None => connected_at.elapsed() <= STALL_TIMEOUT,
        }
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            source: self.url.clone(),
        }
    }
}

fn frame_to_pixels(frame: &ffmpeg::frame::Video) -> Result<(Vec<u8>, u32, u32)> {
    let width = frame.width();
    let height = frame.height();
    let row_bytes = (width as usize) * 3;
    let stride = frame.stride(0);
    let data = frame.data(0);

    if stride == row_bytes {
        let packed = data
            .get(..row_bytes * height as usize)
            .context("ffmpeg frame is shorter than its dimensions")?;
        return Ok((packed.to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        pixels.extend_from_slice(
            data.get(start..start + row_bytes)
                .context("ffmpeg frame row is out of bounds")?,
        );
    }
    Ok((pixels, width, height))
}
