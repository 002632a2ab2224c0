//! End-to-end behaviour of the manager over the fake host.

use std::sync::Arc;
use std::time::Duration;

use media_preflight_rs::media::{FailureReason, HostError, HostPermission};
use media_preflight_rs::testing::FakeHost;
use media_preflight_rs::{
    CaptureKind, DeviceKind, MediaError, MediaEvent, MediaSessionManager, PermissionState,
    PlaybackOutcome, PreflightConfig, Selection, SessionState,
};

fn host() -> Arc<FakeHost> {
    Arc::new(
        FakeHost::new()
            .with_device("c1", DeviceKind::Camera, "Front Camera")
            .with_device("c2", DeviceKind::Camera, "USB Camera")
            .with_device("m1", DeviceKind::Microphone, "Built-in Mic")
            .with_device("m2", DeviceKind::Microphone, "Headset Mic")
            .with_device("s1", DeviceKind::Speaker, "Speakers")
            .granted(),
    )
}

fn manager(host: &Arc<FakeHost>) -> MediaSessionManager {
    MediaSessionManager::new(host.clone(), PreflightConfig::default()).unwrap()
}

fn selection(camera: Option<&str>, mic: Option<&str>) -> Selection {
    Selection {
        camera_id: camera.map(str::to_string),
        microphone_id: mic.map(str::to_string),
        speaker_id: None,
    }
}

#[tokio::test]
async fn camera_switch_keeps_audio_track() {
    let host = host();
    let manager = manager(&host);

    let catalog = manager.refresh_catalog().await.unwrap();
    let cameras: Vec<_> = catalog.cameras.iter().map(|d| d.id.as_str()).collect();
    assert_eq!(cameras, ["c1", "c2"]);

    let first = manager
        .request_stream(&selection(Some("c1"), Some("m1")))
        .await
        .unwrap();
    assert_eq!(first.state, SessionState::Active);
    assert_eq!(first.video.as_ref().unwrap().device_id(), "c1");
    assert_eq!(first.audio.as_ref().unwrap().device_id(), "m1");

    let second = manager
        .request_stream(&selection(Some("c2"), Some("m1")))
        .await
        .unwrap();
    assert_eq!(second.audio.unwrap().id(), first.audio.unwrap().id());
    assert_eq!(second.video.unwrap().device_id(), "c2");
    assert!(!first.video.unwrap().is_live());
}

#[tokio::test]
async fn microphone_switch_keeps_camera_track() {
    let host = host();
    let manager = manager(&host);

    let first = manager
        .request_stream(&selection(Some("c1"), Some("m1")))
        .await
        .unwrap();
    let second = manager
        .request_stream(&selection(Some("c1"), Some("m2")))
        .await
        .unwrap();

    assert_eq!(second.video.unwrap().id(), first.video.unwrap().id());
    assert_eq!(second.audio.unwrap().device_id(), "m2");
    assert_eq!(host.open_count(CaptureKind::Video), 1);
}

#[tokio::test]
async fn never_more_than_one_live_track_per_kind() {
    let host = host();
    let manager = manager(&host);

    let sequence = [
        (Some("c1"), Some("m1")),
        (Some("c2"), Some("m1")),
        (None, Some("m2")),
        (Some("c9"), None),
        (Some("c1"), Some("m9")),
        (None, None),
    ];
    for (camera, mic) in sequence {
        let _ = manager.request_stream(&selection(camera, mic)).await;
        assert!(host.live_tracks(CaptureKind::Video) <= 1);
        assert!(host.live_tracks(CaptureKind::Audio) <= 1);
    }
}

#[tokio::test]
async fn teardown_twice_matches_once() {
    let host = host();
    let manager = manager(&host);
    manager
        .request_stream(&selection(Some("c1"), Some("m1")))
        .await
        .unwrap();

    let observe = || {
        (
            manager.state(),
            host.live_tracks(CaptureKind::Video),
            host.live_tracks(CaptureKind::Audio),
        )
    };

    manager.teardown_all().await;
    let once = observe();
    manager.teardown_all().await;
    let twice = observe();

    assert_eq!(once, (SessionState::Idle, 0, 0));
    assert_eq!(once, twice);
    assert!(manager.snapshot().video.is_none());
}

#[tokio::test]
async fn stopping_absent_kind_is_a_no_op() {
    let host = host();
    let manager = manager(&host);

    manager.stop_kind(CaptureKind::Audio).await;
    assert_eq!(manager.state(), SessionState::Idle);

    manager.start_kind(CaptureKind::Video).await.unwrap();
    manager.stop_kind(CaptureKind::Audio).await;
    assert_eq!(manager.state(), SessionState::Active);
    assert_eq!(host.live_tracks(CaptureKind::Video), 1);
}

#[tokio::test]
async fn start_kind_leaves_other_kind_alone() {
    let host = host();
    let manager = manager(&host);

    let video = manager.start_kind(CaptureKind::Video).await.unwrap();
    let both = manager.start_kind(CaptureKind::Audio).await.unwrap();

    assert!(video.audio.is_none());
    assert_eq!(both.video.unwrap().id(), video.video.unwrap().id());
    assert!(both.audio.is_some());
}

#[tokio::test]
async fn select_device_reacquires_only_that_kind() {
    let host = host();
    let manager = manager(&host);
    manager.refresh_catalog().await.unwrap();
    let first = manager
        .request_stream(&selection(Some("c1"), Some("m1")))
        .await
        .unwrap();

    let snapshot = manager
        .select_device(DeviceKind::Microphone, Some("m2"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(snapshot.audio.unwrap().device_id(), "m2");
    assert_eq!(snapshot.video.unwrap().id(), first.video.unwrap().id());
    assert_eq!(manager.selection().microphone_id.as_deref(), Some("m2"));
}

#[tokio::test]
async fn denied_then_granted_reveals_labels() {
    let host = Arc::new(
        FakeHost::new()
            .with_device("c1", DeviceKind::Camera, "Front Camera")
            .with_device("m1", DeviceKind::Microphone, "Built-in Mic"),
    );
    host.set_prompt_answer(CaptureKind::Video, HostPermission::Denied);
    let manager = manager(&host);

    assert!(manager.request_access(CaptureKind::Video).await.is_err());
    assert_eq!(manager.permission(CaptureKind::Video), PermissionState::Denied);
    manager.refresh_catalog().await.unwrap();
    assert_eq!(manager.catalog().cameras[0].label, "");

    host.set_prompt_answer(CaptureKind::Video, HostPermission::Granted);
    let state = manager.request_access(CaptureKind::Video).await.unwrap();
    assert_eq!(state, PermissionState::Granted);
    assert_eq!(manager.catalog().cameras[0].label, "Front Camera");
}

#[tokio::test]
async fn permanent_denial_fails_session_and_is_reported() {
    let host = host();
    host.block_reprompt(CaptureKind::Audio);
    let manager = manager(&host);
    let mut events = manager.subscribe_events();

    let err = manager
        .request_stream(&selection(None, None))
        .await
        .unwrap_err();
    assert!(!err.is_recoverable());
    assert!(manager.request_access(CaptureKind::Audio).await.is_err());
    assert_eq!(manager.permission(CaptureKind::Audio), PermissionState::Denied);
    assert_eq!(host.live_tracks(CaptureKind::Video), 0);

    let mut saw_failure = false;
    while let Ok(event) = events.try_recv() {
        saw_failure |= matches!(event, MediaEvent::Failure(_));
    }
    assert!(saw_failure);
}

#[tokio::test]
async fn failed_switch_leaves_selection_on_live_devices() {
    let host = host();
    let manager = manager(&host);
    manager.refresh_catalog().await.unwrap();
    let first = manager
        .request_stream(&selection(Some("c1"), Some("m1")))
        .await
        .unwrap();

    host.fail_open(CaptureKind::Audio, Some(HostError::Busy("in use".into())));
    assert!(manager
        .request_stream(&selection(Some("c1"), Some("m2")))
        .await
        .is_err());
    assert_eq!(manager.selection().microphone_id.as_deref(), Some("m1"));
    assert_eq!(manager.snapshot().audio.unwrap().device_id(), "m1");

    // Changing only the camera must not retry the microphone that failed
    let snapshot = manager
        .select_device(DeviceKind::Camera, Some("c2"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(snapshot.video.unwrap().device_id(), "c2");
    assert_eq!(snapshot.audio.unwrap().id(), first.audio.unwrap().id());
    assert_eq!(manager.selection().camera_id.as_deref(), Some("c2"));
    assert_eq!(manager.selection().microphone_id.as_deref(), Some("m1"));
}

#[tokio::test]
async fn concurrent_requests_are_serialized() {
    let host = host();
    host.set_open_delay(Some(Duration::from_millis(5)));
    let manager = manager(&host);

    let a = selection(Some("c1"), Some("m1"));
    let b = selection(Some("c2"), Some("m2"));
    let (first, second) = tokio::join!(manager.request_stream(&a), manager.request_stream(&b));
    first.unwrap();
    second.unwrap();

    assert_eq!(host.max_concurrent_opens(), 1);
    assert_eq!(host.live_tracks(CaptureKind::Video), 1);
    assert_eq!(host.live_tracks(CaptureKind::Audio), 1);
    assert_eq!(manager.snapshot().video.unwrap().device_id(), "c2");
}

#[tokio::test]
async fn unavailable_device_triggers_refresh() {
    let host = host();
    let manager = manager(&host);
    manager.refresh_catalog().await.unwrap();
    manager.select_device(DeviceKind::Microphone, Some("m2")).await.unwrap();

    host.remove_device("m2");
    host.fail_open(CaptureKind::Audio, Some(HostError::NotFound));
    let err = manager.start_kind(CaptureKind::Audio).await.unwrap_err();

    assert!(matches!(err, MediaError::DeviceUnavailable { .. }));
    assert!(!manager.catalog().contains(DeviceKind::Microphone, "m2"));
    assert_eq!(manager.selection().microphone_id, None);
    assert_eq!(
        manager.state(),
        SessionState::Failed(FailureReason::DeviceUnavailable)
    );
}

#[tokio::test]
async fn test_tone_routes_to_selected_speaker() {
    let host = host();
    let manager = manager(&host);
    manager.refresh_catalog().await.unwrap();
    manager.select_device(DeviceKind::Speaker, Some("s1")).await.unwrap();

    let outcome = manager.play_on_selected_output().await.unwrap();
    assert_eq!(outcome, PlaybackOutcome::Routed { output_id: "s1".into() });

    host.set_routing_supported(false);
    let outcome = manager.play_on_selected_output().await.unwrap();
    assert!(outcome.warning().is_some());
    assert_eq!(host.played().last().unwrap().output_id, None);
}
