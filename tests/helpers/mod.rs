//! Test doubles and engine wiring for pipeline tests

use async_trait::async_trait;
use base64::Engine;
use image::{RgbImage, RgbaImage};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use placement_compositor::config::policy::PolicyConfig;
use placement_compositor::models::asset::Adjustment;
use placement_compositor::models::job::Job;
use placement_compositor::models::media::MediaRef;
use placement_compositor::models::requests::CreateJobRequest;
use placement_compositor::models::scene::Region;
use placement_compositor::services::capability::CapabilityError;
use placement_compositor::services::job_manager::JobManager;
use placement_compositor::services::media::{
    CodecError, FrameEditor, TranscodePlan, VideoCodec, VideoInfo,
};
use placement_compositor::services::pipeline::{Pipeline, PipelineDeps};
use placement_compositor::services::retry::RetryConfig;
use placement_compositor::services::storage::{MediaStore, MemoryStore, StorageError};
use placement_compositor::services::stylist::{LocalStyler, StyleCapability};
use placement_compositor::services::vision::{Detection, DetectionLabel, ZoneDetector};

use crate::fixtures::{self, frame_tag, SyntheticVideo};

/// Codec over [`SyntheticVideo`] blobs. Frames pass through the editor
/// exactly as the real codec would hand them over.
#[derive(Default)]
pub struct SyntheticCodec {
    /// Sleep between frames while transcoding.
    pub frame_delay: Duration,
    /// Number of upcoming transcodes that fail with an encode error.
    pub failing_transcodes: AtomicUsize,
    pub transcodes: AtomicUsize,
}

impl SyntheticCodec {
    pub fn with_frame_delay(frame_delay: Duration) -> Self {
        Self {
            frame_delay,
            ..Default::default()
        }
    }

    pub fn failing(times: usize) -> Self {
        Self {
            failing_transcodes: AtomicUsize::new(times),
            ..Default::default()
        }
    }

    fn parse(source: &[u8]) -> Result<SyntheticVideo, CodecError> {
        Ok(serde_json::from_slice(source)?)
    }

    fn decode(video: &SyntheticVideo, index: usize) -> Result<RgbImage, CodecError> {
        let raw = base64::engine::general_purpose::STANDARD
            .decode(video.frames.get(index).ok_or_else(|| {
                CodecError::Decode(format!("Frame {} out of range", index))
            })?)
            .map_err(|e| CodecError::Decode(e.to_string()))?;
        RgbImage::from_raw(video.width, video.height, raw)
            .ok_or_else(|| CodecError::Decode("Short frame".into()))
    }
}

#[async_trait]
impl VideoCodec for SyntheticCodec {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    fn output_content_type(&self) -> &'static str {
        "application/json"
    }

    async fn inspect(&self, source: &[u8]) -> Result<VideoInfo, CodecError> {
        let video = Self::parse(source)?;
        if video.frames.is_empty() {
            return Err(CodecError::Inspect("No frames".into()));
        }
        Ok(VideoInfo {
            width: video.width,
            height: video.height,
            fps: video.fps,
            frame_count: video.frames.len(),
            duration: video.frames.len() as f64 / video.fps,
            has_audio: video.audio.is_some(),
        })
    }

    async fn extract_frames(
        &self,
        source: &[u8],
        _info: &VideoInfo,
        indices: &[usize],
    ) -> Result<Vec<RgbImage>, CodecError> {
        let video = Self::parse(source)?;
        indices.iter().map(|&i| Self::decode(&video, i)).collect()
    }

    async fn transcode(
        &self,
        source: &[u8],
        _info: &VideoInfo,
        plan: &TranscodePlan,
        editor: &mut dyn FrameEditor,
    ) -> Result<Vec<u8>, CodecError> {
        self.transcodes.fetch_add(1, Ordering::SeqCst);
        let video = Self::parse(source)?;

        let mut frames = Vec::with_capacity(plan.keep_frames.len());
        for index in plan.keep_frames.clone() {
            let mut frame = Self::decode(&video, index)?;
            editor.edit(index, &mut frame)?;
            frames.push(base64::engine::general_purpose::STANDARD.encode(frame.as_raw()));
            if !self.frame_delay.is_zero() {
                tokio::time::sleep(self.frame_delay).await;
            }
        }

        let failing = self
            .failing_transcodes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(CodecError::Encode("encoder crashed".into()));
        }

        let audio = match (&video.audio, plan.audio_window) {
            (None, _) => None,
            (Some(audio), None) => Some(audio.clone()),
            (Some(audio), Some(window)) => {
                let engine = base64::engine::general_purpose::STANDARD;
                let bytes = engine
                    .decode(audio)
                    .map_err(|e| CodecError::Decode(e.to_string()))?;
                let start = ((window.start * video.audio_rate as f64).round() as usize).min(bytes.len());
                let end = ((window.end * video.audio_rate as f64).round() as usize).min(bytes.len());
                Some(engine.encode(&bytes[start..end.max(start)]))
            }
        };

        Ok(serde_json::to_vec(&SyntheticVideo {
            frames,
            audio,
            ..video
        })?)
    }
}

/// A detection reported for every frame whose timestamp is in `[from, to)`.
#[derive(Clone)]
pub struct Scripted {
    pub from: f64,
    pub to: f64,
    pub detection: Detection,
}

pub fn scripted(from: f64, to: f64, label: DetectionLabel, region: Region, confidence: f64) -> Scripted {
    Scripted {
        from,
        to,
        detection: Detection {
            label,
            region,
            confidence,
            depth: None,
            rationale: None,
        },
    }
}

#[derive(Clone, Copy, PartialEq)]
pub enum DetectorMode {
    Normal,
    Unavailable,
    Hang,
}

/// Detector that replays a script keyed on the tagged frame index.
pub struct ScriptedDetector {
    pub script: Vec<Scripted>,
    pub mode: DetectorMode,
    pub calls: AtomicUsize,
}

impl ScriptedDetector {
    pub fn new(script: Vec<Scripted>) -> Self {
        Self {
            script,
            mode: DetectorMode::Normal,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_mode(mut self, mode: DetectorMode) -> Self {
        self.mode = mode;
        self
    }
}

#[async_trait]
impl ZoneDetector for ScriptedDetector {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn detect(&self, frame: &RgbImage) -> Result<Vec<Detection>, CapabilityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.mode {
            DetectorMode::Unavailable => {
                return Err(CapabilityError::unavailable("scripted", "offline"))
            }
            DetectorMode::Hang => {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            DetectorMode::Normal => {}
        }
        let t = frame_tag(frame) as f64 / fixtures::FPS;
        Ok(self
            .script
            .iter()
            .filter(|s| s.from <= t && t < s.to)
            .map(|s| s.detection.clone())
            .collect())
    }
}

/// Style capability that is always down.
pub struct OfflineStyler;

#[async_trait]
impl StyleCapability for OfflineStyler {
    fn name(&self) -> &str {
        "offline"
    }

    async fn apply(
        &self,
        _image: &RgbaImage,
        _adjustments: &[Adjustment],
    ) -> Result<RgbaImage, CapabilityError> {
        Err(CapabilityError::unavailable("offline", "maintenance window"))
    }
}

/// Style capability that reaches the service but always errors.
pub struct FlakyStyler {
    pub calls: AtomicUsize,
}

#[async_trait]
impl StyleCapability for FlakyStyler {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn apply(
        &self,
        _image: &RgbaImage,
        _adjustments: &[Adjustment],
    ) -> Result<RgbaImage, CapabilityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(CapabilityError::transient("flaky", "HTTP 500"))
    }
}

/// Local styling that parks every call after the first until released.
pub struct GatedStyler {
    pub calls: AtomicUsize,
    pub entered: tokio::sync::Notify,
    gate: tokio::sync::Semaphore,
}

impl GatedStyler {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            entered: tokio::sync::Notify::new(),
            gate: tokio::sync::Semaphore::new(0),
        }
    }

    pub fn release(&self) {
        self.gate.add_permits(1);
    }
}

#[async_trait]
impl StyleCapability for GatedStyler {
    fn name(&self) -> &str {
        "gated"
    }

    async fn apply(
        &self,
        image: &RgbaImage,
        adjustments: &[Adjustment],
    ) -> Result<RgbaImage, CapabilityError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) > 0 {
            self.entered.notify_one();
            let _permit = self
                .gate
                .acquire()
                .await
                .map_err(|_| CapabilityError::unavailable("gated", "gate closed"))?;
        }
        LocalStyler.apply(image, adjustments).await
    }
}

/// Store whose writes under `jobs/` land at once but only return after `delay`.
pub struct LaggingStore {
    pub inner: Arc<MemoryStore>,
    pub delay: Duration,
}

#[async_trait]
impl MediaStore for LaggingStore {
    fn name(&self) -> &'static str {
        "lagging"
    }

    async fn get(&self, media: &MediaRef) -> Result<Vec<u8>, StorageError> {
        self.inner.get(media).await
    }

    async fn put_at(
        &self,
        key: &str,
        data: &[u8],
        content_type: &str,
    ) -> Result<MediaRef, StorageError> {
        let media = self.inner.put_at(key, data, content_type).await?;
        if key.starts_with("jobs/") {
            tokio::time::sleep(self.delay).await;
        }
        Ok(media)
    }

    async fn exists(&self, media: &MediaRef) -> Result<bool, StorageError> {
        self.inner.exists(media).await
    }

    async fn delete(&self, media: &MediaRef) -> Result<(), StorageError> {
        self.inner.delete(media).await
    }
}

pub struct EngineOptions {
    pub codec: Arc<SyntheticCodec>,
    pub detector: Arc<dyn ZoneDetector>,
    pub styler: Option<Arc<dyn StyleCapability>>,
    pub policy: PolicyConfig,
    pub retry: RetryConfig,
    pub stage_timeout: Duration,
    pub capability_timeout: Duration,
    pub workers: usize,
    pub queue_capacity: usize,
    /// Delay added after every job-scoped write.
    pub put_delay: Option<Duration>,
}

impl EngineOptions {
    pub fn new(detector: Arc<dyn ZoneDetector>) -> Self {
        Self {
            codec: Arc::new(SyntheticCodec::default()),
            detector,
            styler: Some(Arc::new(LocalStyler)),
            policy: PolicyConfig::default(),
            retry: RetryConfig::default()
                .with_max_retries(2)
                .with_base_delay(Duration::from_millis(5)),
            stage_timeout: Duration::from_secs(20),
            capability_timeout: Duration::from_secs(5),
            workers: 2,
            queue_capacity: 16,
            put_delay: None,
        }
    }
}

pub struct TestEngine {
    pub jobs: Arc<JobManager>,
    pub store: Arc<MemoryStore>,
    pub codec: Arc<SyntheticCodec>,
}

impl TestEngine {
    pub fn start(options: EngineOptions) -> Self {
        let store = Arc::new(MemoryStore::new());
        let pipeline_store: Arc<dyn MediaStore> = match options.put_delay {
            Some(delay) => Arc::new(LaggingStore {
                inner: store.clone(),
                delay,
            }),
            None => store.clone(),
        };
        let pipeline = Pipeline::new(PipelineDeps {
            store: pipeline_store,
            codec: options.codec.clone(),
            detector: options.detector,
            styler: options.styler,
            policy: options.policy,
            retry: options.retry,
            stage_timeout: options.stage_timeout,
            capability_timeout: options.capability_timeout,
        });
        Self {
            jobs: JobManager::start(pipeline, options.workers, options.queue_capacity),
            store,
            codec: options.codec,
        }
    }

    /// Store a source video and the standard product image.
    pub fn seed(&self, video: &SyntheticVideo) -> (MediaRef, MediaRef) {
        let tag = Uuid::new_v4();
        (
            self.store.insert(format!("video-{}.json", tag), video.to_bytes()),
            self.store.insert(format!("product-{}.png", tag), fixtures::product_png()),
        )
    }

    pub fn request(&self, video: &MediaRef, image: &MediaRef, category: &str) -> CreateJobRequest {
        CreateJobRequest {
            source_video_ref: video.to_string(),
            product_image_ref: image.to_string(),
            product_category: category.to_string(),
            platform_hint: None,
            trim: None,
        }
    }

    /// Poll until the job reaches a terminal status.
    pub async fn wait(&self, id: Uuid) -> Job {
        for _ in 0..1000 {
            let job = self.jobs.get_status(id).expect("job exists");
            if job.is_terminal() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} did not finish in time", id);
    }

    /// Poll until `predicate` holds for the job.
    pub async fn wait_for(&self, id: Uuid, predicate: impl Fn(&Job) -> bool) -> Job {
        for _ in 0..1000 {
            let job = self.jobs.get_status(id).expect("job exists");
            if predicate(&job) {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job {} never reached the expected state", id);
    }

    pub async fn output(&self, job: &Job) -> SyntheticVideo {
        let composite = job
            .artifacts
            .composite
            .as_ref()
            .expect("composite artifact");
        let bytes = self
            .store
            .get(&composite.output_video)
            .await
            .expect("output stored");
        SyntheticVideo::from_bytes(&bytes)
    }
}

/// Tabletop zone in the lower middle of the frame.
pub fn table() -> Region {
    Region::new(0.25, 0.55, 0.5, 0.4)
}

/// Upper wall area.
pub fn wall() -> Region {
    Region::new(0.1, 0.05, 0.8, 0.35)
}
