//! Video decode/encode seam.
//!
//! Sources are never fully decoded into memory: analysis pulls a handful of
//! sampled frames, and compositing streams every frame through a
//! [`FrameEditor`] on its way from the decoder to the encoder. The audio
//! track is stream-copied from the source so it stays byte-identical.

use async_trait::async_trait;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

use crate::models::composite::TimeRange;

/// Stream properties of a source video.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoInfo {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub frame_count: usize,
    pub duration: f64,
    pub has_audio: bool,
}

impl VideoInfo {
    pub fn timestamp(&self, frame: usize) -> f64 {
        frame as f64 / self.fps
    }

    /// Frame shown at `seconds`, clamped to the stream.
    pub fn frame_at(&self, seconds: f64) -> usize {
        let idx = (seconds.max(0.0) * self.fps).floor() as usize;
        idx.min(self.frame_count.saturating_sub(1))
    }
}

/// What to keep when re-encoding.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscodePlan {
    /// Frames written to the output; everything else is dropped.
    pub keep_frames: Range<usize>,
    /// Audio span to carry over; `None` keeps the whole track.
    pub audio_window: Option<TimeRange>,
}

impl TranscodePlan {
    pub fn full(info: &VideoInfo) -> Self {
        Self {
            keep_frames: 0..info.frame_count,
            audio_window: None,
        }
    }
}

/// Per-frame hook invoked between decode and encode.
pub trait FrameEditor: Send {
    fn edit(&mut self, index: usize, frame: &mut RgbImage) -> Result<(), EditError>;
}

#[derive(Debug, thiserror::Error)]
pub enum EditError {
    #[error("Cancelled")]
    Cancelled,

    #[error("{0}")]
    Failed(String),
}

#[async_trait]
pub trait VideoCodec: Send + Sync {
    fn name(&self) -> &'static str;

    /// Content type of encoded output.
    fn output_content_type(&self) -> &'static str {
        "video/mp4"
    }

    async fn inspect(&self, source: &[u8]) -> Result<VideoInfo, CodecError>;

    /// Decode the frames at `indices`, returned in the same order.
    async fn extract_frames(
        &self,
        source: &[u8],
        info: &VideoInfo,
        indices: &[usize],
    ) -> Result<Vec<RgbImage>, CodecError>;

    /// Decode, edit and re-encode the kept frames; audio is carried over.
    async fn transcode(
        &self,
        source: &[u8],
        info: &VideoInfo,
        plan: &TranscodePlan,
        editor: &mut dyn FrameEditor,
    ) -> Result<Vec<u8>, CodecError>;
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Inspection failed: {0}")]
    Inspect(String),

    #[error("Decode failed: {0}")]
    Decode(String),

    #[error("Encode failed: {0}")]
    Encode(String),

    #[error("Frame edit failed: {0}")]
    Edit(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<EditError> for CodecError {
    fn from(e: EditError) -> Self {
        match e {
            EditError::Cancelled => CodecError::Cancelled,
            EditError::Failed(msg) => CodecError::Edit(msg),
        }
    }
}

/// Codec backed by the `ffmpeg` / `ffprobe` command-line tools.
pub struct FfmpegCodec {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
}

#[derive(Debug, Deserialize)]
struct StreamReport {
    format: ReportFormat,
    streams: Vec<ReportStream>,
}

#[derive(Debug, Deserialize)]
struct ReportFormat {
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ReportStream {
    codec_type: String,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
    nb_frames: Option<String>,
    duration: Option<String>,
}

fn parse_frame_rate(rate: &str) -> Option<f64> {
    match rate.split_once('/') {
        Some((n, d)) => {
            let num: f64 = n.parse().ok()?;
            let den: f64 = d.parse().ok()?;
            (den > 0.0 && num > 0.0).then(|| num / den)
        }
        None => rate.parse().ok().filter(|r: &f64| *r > 0.0),
    }
}

impl FfmpegCodec {
    pub fn new(ffmpeg: impl Into<PathBuf>, ffprobe: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
        }
    }

    async fn stage_source(dir: &Path, source: &[u8]) -> Result<PathBuf, CodecError> {
        let path = dir.join("source");
        tokio::fs::write(&path, source).await?;
        Ok(path)
    }

    async fn inspect_path(&self, path: &Path) -> Result<VideoInfo, CodecError> {
        let output = Command::new(&self.ffprobe)
            .args([
                "-v",
                "quiet",
                "-print_format",
                "json",
                "-show_format",
                "-show_streams",
            ])
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if !output.status.success() {
            return Err(CodecError::Inspect(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        let report: StreamReport = serde_json::from_slice(&output.stdout)?;
        let video = report
            .streams
            .iter()
            .find(|s| s.codec_type == "video")
            .ok_or_else(|| CodecError::Inspect("No video stream found".to_string()))?;
        let has_audio = report.streams.iter().any(|s| s.codec_type == "audio");

        let fps = video
            .avg_frame_rate
            .as_deref()
            .and_then(parse_frame_rate)
            .or_else(|| video.r_frame_rate.as_deref().and_then(parse_frame_rate))
            .ok_or_else(|| CodecError::Inspect("Unknown frame rate".to_string()))?;

        let duration = video
            .duration
            .as_deref()
            .or(report.format.duration.as_deref())
            .and_then(|d| d.parse::<f64>().ok())
            .unwrap_or(0.0);

        let frame_count = video
            .nb_frames
            .as_deref()
            .and_then(|n| n.parse::<usize>().ok())
            .unwrap_or_else(|| (duration * fps).round() as usize);

        let (width, height) = (video.width.unwrap_or(0), video.height.unwrap_or(0));
        if width == 0 || height == 0 || frame_count == 0 {
            return Err(CodecError::Inspect(format!(
                "Unusable video stream ({}x{}, {} frames)",
                width, height, frame_count
            )));
        }

        Ok(VideoInfo {
            width,
            height,
            fps,
            frame_count,
            duration: if duration > 0.0 {
                duration
            } else {
                frame_count as f64 / fps
            },
            has_audio,
        })
    }

    fn frame_from_raw(info: &VideoInfo, raw: Vec<u8>) -> Result<RgbImage, CodecError> {
        RgbImage::from_raw(info.width, info.height, raw)
            .ok_or_else(|| CodecError::Decode("Short frame buffer".to_string()))
    }
}

#[async_trait]
impl VideoCodec for FfmpegCodec {
    fn name(&self) -> &'static str {
        "ffmpeg"
    }

    async fn inspect(&self, source: &[u8]) -> Result<VideoInfo, CodecError> {
        let dir = tempfile::tempdir()?;
        let path = Self::stage_source(dir.path(), source).await?;
        self.inspect_path(&path).await
    }

    async fn extract_frames(
        &self,
        source: &[u8],
        info: &VideoInfo,
        indices: &[usize],
    ) -> Result<Vec<RgbImage>, CodecError> {
        if indices.is_empty() {
            return Ok(Vec::new());
        }
        let dir = tempfile::tempdir()?;
        let path = Self::stage_source(dir.path(), source).await?;

        let mut wanted: Vec<usize> = indices.to_vec();
        wanted.sort_unstable();
        wanted.dedup();
        let select = wanted
            .iter()
            .map(|i| format!("eq(n\\,{})", i))
            .collect::<Vec<_>>()
            .join("+");

        let output = Command::new(&self.ffmpeg)
            .args(["-v", "error", "-i"])
            .arg(&path)
            .args([
                "-vf",
                &format!("select='{}'", select),
                "-fps_mode",
                "passthrough",
                "-f",
                "rawvideo",
                "-pix_fmt",
                "rgb24",
                "pipe:1",
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if !output.status.success() {
            return Err(CodecError::Decode(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        let frame_size = (info.width * info.height * 3) as usize;
        let decoded: Vec<RgbImage> = output
            .stdout
            .chunks_exact(frame_size)
            .map(|chunk| Self::frame_from_raw(info, chunk.to_vec()))
            .collect::<Result<_, _>>()?;
        if decoded.len() != wanted.len() {
            return Err(CodecError::Decode(format!(
                "Expected {} sampled frames, decoded {}",
                wanted.len(),
                decoded.len()
            )));
        }

        indices
            .iter()
            .map(|i| {
                let pos = wanted.binary_search(i).map_err(|_| {
                    CodecError::Decode(format!("Frame {} missing from selection", i))
                })?;
                Ok(decoded[pos].clone())
            })
            .collect()
    }

    async fn transcode(
        &self,
        source: &[u8],
        info: &VideoInfo,
        plan: &TranscodePlan,
        editor: &mut dyn FrameEditor,
    ) -> Result<Vec<u8>, CodecError> {
        let dir = tempfile::tempdir()?;
        let path = Self::stage_source(dir.path(), source).await?;
        let out_path = dir.path().join("output.mp4");

        let mut decoder = Command::new(&self.ffmpeg)
            .args(["-v", "error", "-i"])
            .arg(&path)
            .args([
                "-fps_mode",
                "passthrough",
                "-f",
                "rawvideo",
                "-pix_fmt",
                "rgb24",
                "pipe:1",
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let mut encoder_cmd = Command::new(&self.ffmpeg);
        encoder_cmd.args([
            "-y",
            "-v",
            "error",
            "-f",
            "rawvideo",
            "-pix_fmt",
            "rgb24",
            "-s",
            &format!("{}x{}", info.width, info.height),
            "-framerate",
            &format!("{}", info.fps),
            "-i",
            "pipe:0",
        ]);
        if info.has_audio {
            if let Some(window) = plan.audio_window {
                encoder_cmd.args([
                    "-ss",
                    &format!("{:.3}", window.start),
                    "-t",
                    &format!("{:.3}", window.duration()),
                ]);
            }
            encoder_cmd
                .arg("-i")
                .arg(&path)
                .args(["-map", "0:v:0", "-map", "1:a:0", "-c:a", "copy"]);
        } else {
            encoder_cmd.arg("-an");
        }
        encoder_cmd
            .args([
                "-vf",
                "pad=ceil(iw/2)*2:ceil(ih/2)*2",
                "-c:v",
                "libx264",
                "-pix_fmt",
                "yuv420p",
                "-movflags",
                "+faststart",
            ])
            .arg(&out_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut encoder = encoder_cmd.spawn()?;
        let encoder_log = encoder
            .stderr
            .take()
            .map(|stderr| tokio::spawn(read_tail(stderr, STDERR_TAIL_BYTES)));

        let mut frames_in = decoder
            .stdout
            .take()
            .ok_or_else(|| CodecError::Decode("Decoder stdout unavailable".to_string()))?;
        let mut frames_out = encoder
            .stdin
            .take()
            .ok_or_else(|| CodecError::Encode("Encoder stdin unavailable".to_string()))?;

        let frame_size = (info.width * info.height * 3) as usize;
        let mut index = 0usize;
        loop {
            let mut raw = vec![0u8; frame_size];
            match frames_in.read_exact(&mut raw).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(CodecError::Decode(e.to_string())),
            }
            if plan.keep_frames.contains(&index) {
                let mut frame = Self::frame_from_raw(info, raw)?;
                editor.edit(index, &mut frame)?;
                frames_out
                    .write_all(frame.as_raw())
                    .await
                    .map_err(|e| CodecError::Encode(e.to_string()))?;
            }
            index += 1;
        }
        drop(frames_out);

        let decoded = decoder.wait().await?;
        if !decoded.success() {
            return Err(CodecError::Decode(format!("Decoder exited with {}", decoded)));
        }
        let encoded = encoder.wait().await?;
        let log = match encoder_log {
            Some(task) => task.await.unwrap_or_default(),
            None => Vec::new(),
        };
        if !encoded.success() {
            return Err(CodecError::Encode(format!(
                "Encoder exited with {}: {}",
                encoded,
                String::from_utf8_lossy(&log).trim()
            )));
        }

        Ok(tokio::fs::read(&out_path).await?)
    }
}

/// Encoder diagnostics kept for error reports.
const STDERR_TAIL_BYTES: usize = 8 * 1024;

/// Read `reader` to EOF, keeping only its last `limit` bytes.
async fn read_tail<R: AsyncRead + Unpin>(mut reader: R, limit: usize) -> Vec<u8> {
    let mut tail = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                tail.extend_from_slice(&buf[..n]);
                if tail.len() > limit {
                    tail.drain(..tail.len() - limit);
                }
            }
        }
    }
    tail
}
