//! Local file frame source using FFmpeg.
//!
//! The file is opened lazily in `open` so that a missing or unreadable file is
//! reported on the producer thread. End of stream drains the decoder before
//! returning `None`; `rewind` seeks back to the start and flushes the decoder.

use anyhow::{anyhow, Context, Result};
use ffmpeg_next as ffmpeg;

use super::file::{FileConfig, FileStats};
use crate::frame::SourceFrame;

struct Decoding {
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    decoder: ffmpeg::codec::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    fps: Option<f64>,
    draining: bool,
}

pub(crate) struct FfmpegFileSource {
    config: FileConfig,
    state: Option<Decoding>,
    position: u64,
    frames_read: u64,
    rewinds: u64,
}

impl FfmpegFileSource {
    pub(crate) fn new(config: FileConfig) -> Self {
        Self {
            config,
            state: None,
            position: 0,
            frames_read: 0,
            rewinds: 0,
        }
    }

    pub(crate) fn open(&mut self) -> Result<()> {
        ffmpeg::init().context("initialize ffmpeg")?;
        let input = ffmpeg::format::input(&self.config.path).with_context(|| {
            format!("failed to open file input '{}' with ffmpeg", self.config.path)
        })?;
        let input_stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| anyhow!("file has no video track"))?;
        let stream_index = input_stream.index();
        let rate = input_stream.avg_frame_rate();
        let fps = if rate.denominator() != 0 && rate.numerator() > 0 {
            Some(f64::from(rate))
        } else {
            None
        };
        let context = ffmpeg::codec::context::Context::from_parameters(input_stream.parameters())
            .context("load video decoder parameters")?;
        let decoder = context
            .decoder()
            .video()
            .context("open ffmpeg video decoder")?;

        let scaler = ffmpeg::software::scaling::context::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::util::format::pixel::Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            ffmpeg::software::scaling::flag::Flags::BILINEAR,
        )
        .context("create ffmpeg scaler")?;

        log::info!(
            "FileSource: opened {} (ffmpeg {}x{}, {:?} fps)",
            self.config.path,
            decoder.width(),
            decoder.height(),
            fps
        );
        self.state = Some(Decoding {
            input,
            stream_index,
            decoder,
            scaler,
            fps,
            draining: false,
        });
        Ok(())
    }

    pub(crate) fn read_frame(&mut self) -> Result<Option<SourceFrame>> {
        let state = self
            .state
            .as_mut()
            .ok_or_else(|| anyhow!("source {} is not open", self.config.path))?;

        let mut decoded = ffmpeg::frame::Video::empty();
        loop {
            if state.decoder.receive_frame(&mut decoded).is_ok() {
                let mut rgb_frame = ffmpeg::frame::Video::empty();
                state
                    .scaler
                    .run(&decoded, &mut rgb_frame)
                    .context("scale frame to RGB")?;
                let (pixels, width, height) = frame_to_pixels(&rgb_frame)?;
                let index = self.position;
                self.position += 1;
                self.frames_read += 1;
                return SourceFrame::from_rgb(pixels, width, height, index).map(Some);
            }
            if state.draining {
                return Ok(None);
            }

            let mut sent = false;
            for (stream, packet) in state.input.packets() {
                if stream.index() != state.stream_index {
                    continue;
                }
                state
                    .decoder
                    .send_packet(&packet)
                    .context("send packet to ffmpeg decoder")?;
                sent = true;
                break;
            }
            if !sent {
                state.decoder.send_eof().context("flush ffmpeg decoder")?;
                state.draining = true;
            }
        }
    }

    pub(crate) fn rewind(&mut self) -> Result<()> {
        let state = self
            .state
            .as_mut()
            .ok_or_else(|| anyhow!("source {} is not open", self.config.path))?;
        state
            .input
            .seek(0, ..)
            .with_context(|| format!("seek to start of '{}'", self.config.path))?;
        state.decoder.flush();
        state.draining = false;
        self.position = 0;
        self.rewinds += 1;
        Ok(())
    }

    pub(crate) fn nominal_fps(&self) -> Option<f64> {
        self.state.as_ref().and_then(|s| s.fps)
    }

    pub(crate) fn dimensions(&self) -> Option<(u32, u32)> {
        self.state
            .as_ref()
            .map(|s| (s.decoder.width(), s.decoder.height()))
    }

    pub(crate) fn stats(&self) -> FileStats {
        FileStats {
            frames_read: self.frames_read,
            rewinds: self.rewinds,
            path: self.config.path.clone(),
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
        let len = row_bytes * height as usize;
        let pixels = data
            .get(..len)
            .context("ffmpeg frame is shorter than expected")?;
        return Ok((pixels.to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .context("ffmpeg frame row is out of bounds")?,
        );
    }

    Ok((pixels, width, height))
}
