//! Synthetic media for pipeline tests
//!
//! Videos are small serialized frame sequences understood by the in-memory
//! codec in `helpers`. Every frame carries its own index in the green channel
//! of pixel (0, 0) so detectors and assertions can tell frames apart.

use base64::Engine;
use image::{ImageFormat, Rgba, RgbaImage, RgbImage};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

pub const WIDTH: u32 = 64;
pub const HEIGHT: u32 = 36;
pub const FPS: f64 = 10.0;
pub const FRAMES: usize = 60;
/// Audio bytes per second of synthetic video.
pub const AUDIO_RATE: usize = 100;

/// Neutral mid-grey background.
pub const BACKGROUND: [u8; 3] = [128, 128, 128];
/// Passes the skin-tone rule used by local face detection.
pub const SKIN: [u8; 3] = [220, 170, 140];

/// Serialized form of a synthetic video.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyntheticVideo {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    /// Raw RGB frames, base64 encoded.
    pub frames: Vec<String>,
    pub audio: Option<String>,
    pub audio_rate: usize,
}

impl SyntheticVideo {
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("serialize synthetic video")
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        serde_json::from_slice(bytes).expect("parse synthetic video")
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn frame(&self, index: usize) -> RgbImage {
        let raw = base64::engine::general_purpose::STANDARD
            .decode(&self.frames[index])
            .expect("decode frame");
        RgbImage::from_raw(self.width, self.height, raw).expect("frame size")
    }

    pub fn set_frame(&mut self, index: usize, frame: &RgbImage) {
        self.frames[index] = base64::engine::general_purpose::STANDARD.encode(frame.as_raw());
    }

    pub fn audio_bytes(&self) -> Option<Vec<u8>> {
        self.audio.as_ref().map(|a| {
            base64::engine::general_purpose::STANDARD
                .decode(a)
                .expect("decode audio")
        })
    }

    /// Fill a pixel rectangle with `color` on every frame in `frames`.
    pub fn paint(&mut self, frames: std::ops::Range<usize>, x: u32, y: u32, w: u32, h: u32, color: [u8; 3]) {
        for index in frames {
            let mut frame = self.frame(index);
            for py in y..(y + h).min(self.height) {
                for px in x..(x + w).min(self.width) {
                    frame.put_pixel(px, py, image::Rgb(color));
                }
            }
            self.set_frame(index, &frame);
        }
    }
}

/// Frame index encoded by [`grey_video`].
pub fn frame_tag(frame: &RgbImage) -> usize {
    frame.get_pixel(0, 0).0[1] as usize
}

/// Evenly lit grey video with a tagged corner pixel and an audio ramp.
pub fn grey_video(frames: usize, with_audio: bool) -> SyntheticVideo {
    let engine = base64::engine::general_purpose::STANDARD;
    let encoded = (0..frames)
        .map(|index| {
            let mut frame = RgbImage::from_pixel(WIDTH, HEIGHT, image::Rgb(BACKGROUND));
            frame.put_pixel(0, 0, image::Rgb([0, index as u8, 0]));
            engine.encode(frame.as_raw())
        })
        .collect();

    let audio_len = (frames as f64 / FPS * AUDIO_RATE as f64).round() as usize;
    let audio: Vec<u8> = (0..audio_len).map(|i| (i % 251) as u8).collect();

    SyntheticVideo {
        width: WIDTH,
        height: HEIGHT,
        fps: FPS,
        frames: encoded,
        audio: with_audio.then(|| engine.encode(audio)),
        audio_rate: AUDIO_RATE,
    }
}

/// Default six-second test clip.
pub fn standard_video() -> SyntheticVideo {
    grey_video(FRAMES, true)
}

/// A blue can on a transparent background.
pub fn product_png() -> Vec<u8> {
    let mut can = RgbaImage::from_pixel(10, 20, Rgba([0, 0, 0, 0]));
    for y in 2..20 {
        for x in 1..9 {
            can.put_pixel(x, y, Rgba([30, 60, 200, 255]));
        }
    }
    let mut buf = Cursor::new(Vec::new());
    can.write_to(&mut buf, ImageFormat::Png).expect("encode product png");
    buf.into_inner()
}
