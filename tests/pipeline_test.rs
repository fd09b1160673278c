//! End-to-end pipeline tests over the in-memory codec
//!
//! Run with: cargo test --test pipeline_test

mod fixtures;
mod helpers;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use fixtures::*;
use helpers::*;
use placement_compositor::models::job::{ErrorKind, JobStatus, Stage};
use placement_compositor::models::quality::Recommendation;
use placement_compositor::models::requests::TrimRequest;
use placement_compositor::models::scene::ZoneType;
use placement_compositor::services::job_manager::EngineError;
use placement_compositor::services::storage::{job_prefix, MediaStore};
use placement_compositor::services::vision::DetectionLabel;

fn surface_and_wall() -> ScriptedDetector {
    ScriptedDetector::new(vec![
        scripted(1.5, 2.5, DetectionLabel::Surface, table(), 0.9),
        scripted(3.5, 4.5, DetectionLabel::Wall, wall(), 0.95),
    ])
}

#[tokio::test]
async fn test_only_compatible_zone_is_selected() {
    let engine = TestEngine::start(EngineOptions::new(Arc::new(surface_and_wall())));
    let (video, image) = engine.seed(&standard_video());

    let id = engine
        .jobs
        .create(engine.request(&video, &image, "beverage"))
        .await
        .unwrap();
    let job = engine.wait(id).await;
    assert_eq!(job.status, JobStatus::Completed, "error: {:?}", job.error);

    let result = engine.jobs.result(id).unwrap();
    assert_eq!(result.placement_summary.zone_type, ZoneType::Surface);
    assert_eq!(result.placement_summary.confidence, 0.9);
    assert!((result.placement_summary.anchor_timestamp - 1.8).abs() < 1e-9);
    assert!(!result.placement_summary.rationale.is_empty());
    assert!(result.placement_summary.styled);
    assert_eq!(job.progress, 1.0);
}

#[tokio::test]
async fn test_no_zones_fails_before_styling() {
    let engine = TestEngine::start(EngineOptions::new(Arc::new(ScriptedDetector::new(vec![]))));
    let (video, image) = engine.seed(&standard_video());

    let id = engine
        .jobs
        .create(engine.request(&video, &image, "phone"))
        .await
        .unwrap();
    let job = engine.wait(id).await;

    assert_eq!(job.status, JobStatus::Failed);
    let error = job.error.as_ref().unwrap();
    assert_eq!(error.kind, ErrorKind::AnalysisFailure);
    assert_eq!(error.stage, Some(Stage::Placement));
    assert!(job.artifacts.scene_analysis.is_some());
    assert!(job.artifacts.styled_asset.is_none());
    assert!(job.artifacts.composite.is_none());
    assert_eq!(engine.codec.transcodes.load(Ordering::SeqCst), 0);
    assert!(matches!(
        engine.jobs.result(id),
        Err(EngineError::InvalidState {
            status: JobStatus::Failed,
            ..
        })
    ));
}

#[tokio::test]
async fn test_unavailable_styling_still_completes() {
    let mut options = EngineOptions::new(Arc::new(surface_and_wall()));
    options.styler = Some(Arc::new(OfflineStyler));
    let engine = TestEngine::start(options);
    let (video, image) = engine.seed(&standard_video());

    let id = engine
        .jobs
        .create(engine.request(&video, &image, "beverage"))
        .await
        .unwrap();
    let job = engine.wait(id).await;
    assert_eq!(job.status, JobStatus::Completed);

    let styled = job.artifacts.styled_asset.as_ref().unwrap();
    assert!(!styled.styled);
    assert!(styled.adjustments.is_empty());
    assert!(styled.fallback_reason.is_some());

    let result = engine.jobs.result(id).unwrap();
    assert!(!result.placement_summary.styled);
    assert!(result
        .quality_report
        .notes
        .iter()
        .any(|n| n.contains("not restyled")));
}

#[tokio::test]
async fn test_transient_styling_errors_exhaust_retries() {
    let styler = Arc::new(FlakyStyler {
        calls: Default::default(),
    });
    let mut options = EngineOptions::new(Arc::new(surface_and_wall()));
    options.styler = Some(styler.clone());
    let engine = TestEngine::start(options);
    let (video, image) = engine.seed(&standard_video());

    let id = engine
        .jobs
        .create(engine.request(&video, &image, "beverage"))
        .await
        .unwrap();
    let job = engine.wait(id).await;

    assert_eq!(job.status, JobStatus::Failed);
    let error = job.error.as_ref().unwrap();
    assert_eq!(error.kind, ErrorKind::ExternalServiceError);
    assert_eq!(error.stage, Some(Stage::Styling));
    assert_eq!(job.attempts.get(Stage::Styling), 2);
    assert_eq!(styler.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_cancel_during_compositing() {
    let mut options = EngineOptions::new(Arc::new(surface_and_wall()));
    options.codec = Arc::new(SyntheticCodec::with_frame_delay(Duration::from_millis(30)));
    let engine = TestEngine::start(options);
    let (video, image) = engine.seed(&standard_video());

    let id = engine
        .jobs
        .create(engine.request(&video, &image, "beverage"))
        .await
        .unwrap();
    engine
        .wait_for(id, |job| {
            job.status == JobStatus::Compositing && job.progress > 0.45
        })
        .await;
    let blobs_before = engine.store.len();

    let snapshot = engine.jobs.cancel(id).unwrap();
    assert!(snapshot.cancel_requested);
    assert_eq!(snapshot.status, JobStatus::Compositing);

    let job = engine.wait(id).await;
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(job.error.is_none());
    assert!(job.artifacts.composite.is_none());
    assert!(job.artifacts.quality_report.is_none());
    assert_eq!(engine.store.len(), blobs_before);
    assert!(matches!(
        engine.jobs.result(id),
        Err(EngineError::InvalidState {
            status: JobStatus::Cancelled,
            ..
        })
    ));
}

#[tokio::test]
async fn test_product_never_drawn_over_detected_face() {
    let engine = TestEngine::start(EngineOptions::new(Arc::new(surface_and_wall())));
    let mut source = standard_video();
    // A face wanders into the tabletop for frames 20..26 only.
    source.paint(20..26, 26, 20, 12, 12, SKIN);
    let (video, image) = engine.seed(&source);

    let id = engine
        .jobs
        .create(engine.request(&video, &image, "beverage"))
        .await
        .unwrap();
    let job = engine.wait(id).await;
    assert_eq!(job.status, JobStatus::Completed, "error: {:?}", job.error);

    let composite = job.artifacts.composite.as_ref().unwrap();
    assert_eq!(composite.frames_skipped, 6);
    assert_eq!(
        composite.frames_composited + composite.frames_skipped,
        composite.window_frames
    );

    let output = engine.output(&job).await;
    for index in 20..26 {
        assert_eq!(output.frame(index), source.frame(index), "frame {}", index);
    }
    assert_ne!(output.frame(18), source.frame(18));
    assert_eq!(output.frame(0), source.frame(0));
    assert_eq!(output.frame(59), source.frame(59));
}

#[tokio::test]
async fn test_output_preserves_duration_and_audio() {
    let engine = TestEngine::start(EngineOptions::new(Arc::new(surface_and_wall())));
    let source = standard_video();
    let (video, image) = engine.seed(&source);

    let id = engine
        .jobs
        .create(engine.request(&video, &image, "beverage"))
        .await
        .unwrap();
    let job = engine.wait(id).await;
    assert_eq!(job.status, JobStatus::Completed);

    let composite = job.artifacts.composite.as_ref().unwrap();
    assert!(composite.audio_preserved);
    assert!(!composite.trimmed);
    assert!((composite.output_duration - 6.0).abs() < 1e-9);

    let output = engine.output(&job).await;
    assert_eq!(output.frame_count(), source.frame_count());
    assert_eq!(output.fps, source.fps);
    assert_eq!(output.audio_bytes(), source.audio_bytes());
}

#[tokio::test]
async fn test_explicit_trim_cuts_video_and_audio() {
    let engine = TestEngine::start(EngineOptions::new(Arc::new(surface_and_wall())));
    let source = standard_video();
    let (video, image) = engine.seed(&source);

    let mut request = engine.request(&video, &image, "beverage");
    request.trim = Some(TrimRequest {
        start: 1.0,
        end: 4.0,
    });
    let id = engine.jobs.create(request).await.unwrap();
    let job = engine.wait(id).await;
    assert_eq!(job.status, JobStatus::Completed, "error: {:?}", job.error);

    let composite = job.artifacts.composite.as_ref().unwrap();
    assert!(composite.trimmed);
    assert!((composite.output_duration - 3.0).abs() < 1e-9);

    let output = engine.output(&job).await;
    assert_eq!(output.frame_count(), 30);
    assert_eq!(frame_tag(&output.frame(0)), 10);
    let audio = source.audio_bytes().unwrap();
    assert_eq!(output.audio_bytes().unwrap(), audio[100..400].to_vec());
}

#[tokio::test]
async fn test_identical_inputs_give_identical_results() {
    let engine = TestEngine::start(EngineOptions::new(Arc::new(surface_and_wall())));
    let (video, image) = engine.seed(&standard_video());

    let first = engine
        .jobs
        .create(engine.request(&video, &image, "beverage"))
        .await
        .unwrap();
    let second = engine
        .jobs
        .create(engine.request(&video, &image, "beverage"))
        .await
        .unwrap();
    let first_job = engine.wait(first).await;
    let second_job = engine.wait(second).await;

    let a = engine.jobs.result(first).unwrap();
    let b = engine.jobs.result(second).unwrap();
    assert_ne!(a.output_video_ref, b.output_video_ref);
    assert!(a.output_video_ref.as_str().starts_with(&job_prefix(first)));
    assert!(b.output_video_ref.as_str().starts_with(&job_prefix(second)));
    assert_eq!(
        engine.output(&first_job).await.frames,
        engine.output(&second_job).await.frames
    );
    assert_eq!(a.placement_summary.region, b.placement_summary.region);
    assert_eq!(a.placement_summary.anchor_timestamp, b.placement_summary.anchor_timestamp);
    assert_eq!(a.quality_report.realism, b.quality_report.realism);
    assert_eq!(a.quality_report.brand_safety, b.quality_report.brand_safety);
    assert_eq!(
        a.quality_report.engagement_potential,
        b.quality_report.engagement_potential
    );
}

#[tokio::test]
async fn test_cancelling_one_job_keeps_identical_job_outputs() {
    let styler = Arc::new(GatedStyler::new());
    let mut options = EngineOptions::new(Arc::new(surface_and_wall()));
    options.styler = Some(styler.clone());
    options.workers = 1;
    let engine = TestEngine::start(options);
    let (video, image) = engine.seed(&standard_video());

    let first = engine
        .jobs
        .create(engine.request(&video, &image, "beverage"))
        .await
        .unwrap();
    let done = engine.wait(first).await;
    assert_eq!(done.status, JobStatus::Completed, "error: {:?}", done.error);

    let second = engine
        .jobs
        .create(engine.request(&video, &image, "beverage"))
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), styler.entered.notified())
        .await
        .expect("second job reaches styling");
    let snapshot = engine.jobs.cancel(second).unwrap();
    assert_eq!(snapshot.status, JobStatus::Styling);
    styler.release();

    let cancelled = engine.wait(second).await;
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert!(cancelled.artifacts.styled_asset.is_none());

    let styled = done.artifacts.styled_asset.as_ref().unwrap();
    assert!(engine.store.exists(&styled.asset_ref).await.unwrap());
    let result = engine.jobs.result(first).unwrap();
    assert!(engine.store.get(&result.output_video_ref).await.is_ok());
    assert_eq!(engine.output(&done).await.frame_count(), FRAMES);
    assert_eq!(engine.store.count_prefixed(&job_prefix(first)), 2);
    assert_eq!(engine.store.count_prefixed(&job_prefix(second)), 0);
}

#[tokio::test]
async fn test_timed_out_write_is_rolled_back() {
    let mut options = EngineOptions::new(Arc::new(surface_and_wall()));
    options.put_delay = Some(Duration::from_secs(2));
    options.stage_timeout = Duration::from_millis(300);
    options.retry = options.retry.with_max_retries(1);
    let engine = TestEngine::start(options);
    let (video, image) = engine.seed(&standard_video());

    let id = engine
        .jobs
        .create(engine.request(&video, &image, "beverage"))
        .await
        .unwrap();
    let job = engine.wait(id).await;

    assert_eq!(job.status, JobStatus::Failed);
    let error = job.error.as_ref().unwrap();
    assert_eq!(error.kind, ErrorKind::Timeout);
    assert_eq!(error.stage, Some(Stage::Styling));
    assert_eq!(engine.store.count_prefixed(&job_prefix(id)), 0);
}

#[tokio::test]
async fn test_trim_excluding_placement_window_is_input_error() {
    let engine = TestEngine::start(EngineOptions::new(Arc::new(surface_and_wall())));
    let (video, image) = engine.seed(&standard_video());

    let mut request = engine.request(&video, &image, "beverage");
    request.trim = Some(TrimRequest {
        start: 5.0,
        end: 6.0,
    });
    let id = engine.jobs.create(request).await.unwrap();
    let job = engine.wait(id).await;

    assert_eq!(job.status, JobStatus::Failed);
    let error = job.error.as_ref().unwrap();
    assert_eq!(error.kind, ErrorKind::InputError);
    assert_eq!(error.stage, Some(Stage::Compositing));
    assert_eq!(engine.codec.transcodes.load(Ordering::SeqCst), 0);
    assert_eq!(engine.store.count_prefixed(&job_prefix(id)), 1);
}

#[tokio::test]
async fn test_rejected_output_is_still_a_completed_job() {
    let mut options = EngineOptions::new(Arc::new(surface_and_wall()));
    options.policy.quality.reject_realism = 0.99;
    let engine = TestEngine::start(options);
    let (video, image) = engine.seed(&standard_video());

    let id = engine
        .jobs
        .create(engine.request(&video, &image, "beverage"))
        .await
        .unwrap();
    let job = engine.wait(id).await;
    assert_eq!(job.status, JobStatus::Completed);

    let result = engine.jobs.result(id).unwrap();
    assert_eq!(result.quality_report.recommendation, Recommendation::Reject);
    assert!(result.rejected);
    for score in [
        result.quality_report.realism,
        result.quality_report.brand_safety,
        result.quality_report.engagement_potential,
    ] {
        assert!((0.0..=1.0).contains(&score));
    }
}

#[tokio::test]
async fn test_hung_detector_times_out_after_retries() {
    let detector = ScriptedDetector::new(vec![]).with_mode(DetectorMode::Hang);
    let mut options = EngineOptions::new(Arc::new(detector));
    options.capability_timeout = Duration::from_millis(50);
    let engine = TestEngine::start(options);
    let (video, image) = engine.seed(&standard_video());

    let id = engine
        .jobs
        .create(engine.request(&video, &image, "beverage"))
        .await
        .unwrap();
    let job = engine.wait(id).await;

    assert_eq!(job.status, JobStatus::Failed);
    let error = job.error.as_ref().unwrap();
    assert_eq!(error.kind, ErrorKind::Timeout);
    assert_eq!(error.stage, Some(Stage::Analysis));
    assert_eq!(job.attempts.get(Stage::Analysis), 2);
}

#[tokio::test]
async fn test_stage_budget_exceeded_is_timeout() {
    let mut options = EngineOptions::new(Arc::new(surface_and_wall()));
    options.codec = Arc::new(SyntheticCodec::with_frame_delay(Duration::from_millis(50)));
    options.stage_timeout = Duration::from_millis(400);
    options.retry = options.retry.with_max_retries(0);
    let engine = TestEngine::start(options);
    let (video, image) = engine.seed(&standard_video());

    let id = engine
        .jobs
        .create(engine.request(&video, &image, "beverage"))
        .await
        .unwrap();
    let job = engine.wait(id).await;

    assert_eq!(job.status, JobStatus::Failed);
    let error = job.error.as_ref().unwrap();
    assert_eq!(error.kind, ErrorKind::Timeout);
    assert_eq!(error.stage, Some(Stage::Compositing));
}

#[tokio::test]
async fn test_render_failure_retried_in_place() {
    let mut options = EngineOptions::new(Arc::new(surface_and_wall()));
    options.codec = Arc::new(SyntheticCodec::failing(1));
    let engine = TestEngine::start(options);
    let (video, image) = engine.seed(&standard_video());

    let id = engine
        .jobs
        .create(engine.request(&video, &image, "beverage"))
        .await
        .unwrap();
    let job = engine.wait(id).await;

    assert_eq!(job.status, JobStatus::Completed, "error: {:?}", job.error);
    assert!(job.error.is_none());
    assert_eq!(job.attempts.get(Stage::Compositing), 1);
    assert_eq!(engine.codec.transcodes.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_vision_outage_degrades_to_local_detection() {
    let detector = ScriptedDetector::new(vec![]).with_mode(DetectorMode::Unavailable);
    let engine = TestEngine::start(EngineOptions::new(Arc::new(detector)));
    let (video, image) = engine.seed(&standard_video());

    let id = engine
        .jobs
        .create(engine.request(&video, &image, "beverage"))
        .await
        .unwrap();
    let job = engine.wait(id).await;
    assert_eq!(job.status, JobStatus::Completed, "error: {:?}", job.error);

    let analysis = job.artifacts.scene_analysis.as_ref().unwrap();
    assert!(analysis.degraded);
    assert!(analysis.detector.contains("fallback"));
    let report = job.artifacts.quality_report.as_ref().unwrap();
    assert!(report.notes.iter().any(|n| n.contains("fallback")));
}

#[tokio::test]
async fn test_undecodable_source_is_input_error() {
    let engine = TestEngine::start(EngineOptions::new(Arc::new(surface_and_wall())));
    let video = engine.store.insert("broken.mp4", b"\x00\x00\x00 ftyp garbage".to_vec());
    let image = engine.store.insert("can.png", product_png());

    let id = engine
        .jobs
        .create(engine.request(&video, &image, "beverage"))
        .await
        .unwrap();
    let job = engine.wait(id).await;

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.as_ref().unwrap().kind, ErrorKind::InputError);
    assert_eq!(job.attempts.get(Stage::Analysis), 0);
}

#[tokio::test]
async fn test_progress_never_regresses() {
    let mut options = EngineOptions::new(Arc::new(surface_and_wall()));
    options.codec = Arc::new(SyntheticCodec::with_frame_delay(Duration::from_millis(5)));
    let engine = TestEngine::start(options);
    let (video, image) = engine.seed(&standard_video());

    let id = engine
        .jobs
        .create(engine.request(&video, &image, "beverage"))
        .await
        .unwrap();

    let mut last = 0.0;
    let mut seen = Vec::new();
    loop {
        let job = engine.jobs.get_status(id).unwrap();
        assert!(job.progress >= last, "{} after {}", job.progress, last);
        last = job.progress;
        if seen.last() != Some(&job.status) {
            seen.push(job.status);
        }
        if job.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    assert_eq!(last, 1.0);
    assert_eq!(seen.last(), Some(&JobStatus::Completed));
}

#[tokio::test]
async fn test_invalid_requests_rejected_at_creation() {
    let engine = TestEngine::start(EngineOptions::new(Arc::new(surface_and_wall())));
    let (video, image) = engine.seed(&standard_video());

    let err = engine
        .jobs
        .create(engine.request(&video, &image, "spaceship"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidInput(_)));

    let missing = placement_compositor::models::media::MediaRef::from("nope.mp4");
    let err = engine
        .jobs
        .create(engine.request(&missing, &image, "beverage"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidInput(ref m) if m.contains("source_video_ref")));
    assert_eq!(engine.jobs.active_jobs(), 0);
}
