//! Wall-clock driven playback through the public controller API.

mod common;

use std::sync::Arc;
use std::time::Duration;

use avsync::decode::SourceProbe;
use avsync::{
    Controller, ManualClock, PlaybackControl, PlaybackError, PlaybackState, PlayerConfig,
    SeekOutcome, SyntheticSource,
};

fn ten_second_clip() -> (Controller, ManualClock, SourceProbe) {
    common::init_tracing();
    let source = SyntheticSource::new(Duration::from_secs(10), (25, 1));
    let probe = source.probe();
    let clock = ManualClock::new();
    let controller = Controller::open_with_clock(
        Box::new(source),
        None,
        PlayerConfig::default(),
        Arc::new(clock.clone()),
    )
    .unwrap();
    (controller, clock, probe)
}

fn offset(controller: &mut Controller) -> Duration {
    controller
        .current_video_frame()
        .unwrap()
        .frame
        .expect("a frame is held")
        .offset
}

#[test]
fn test_frame_at_two_seconds() {
    let (mut controller, clock, _probe) = ten_second_clip();
    assert!(matches!(controller, Controller::VideoOnly(_)));

    controller.play().unwrap();
    clock.advance(Duration::from_millis(2_040));
    assert_eq!(offset(&mut controller), Duration::from_millis(2_000));
}

#[test]
fn test_looping_wraps_position_and_frames() {
    let (mut controller, clock, _probe) = ten_second_clip();
    controller.set_looping(true).unwrap();
    controller.play().unwrap();

    clock.advance(Duration::from_millis(9_980));
    let before = offset(&mut controller);
    assert_eq!(before, Duration::from_millis(9_960));

    clock.advance(Duration::from_millis(520));
    assert_eq!(controller.position().unwrap(), Duration::from_millis(500));
    let after = offset(&mut controller);
    assert!(after < before);
    assert_eq!(after, Duration::from_millis(480));
    assert_eq!(controller.state().unwrap(), PlaybackState::Playing);
}

#[test]
fn test_seek_past_end_keeps_last_frame() {
    let (mut controller, clock, _probe) = ten_second_clip();
    controller.play().unwrap();
    clock.advance(Duration::from_millis(1_010));
    assert_eq!(offset(&mut controller), Duration::from_secs(1));

    assert!(matches!(
        controller.seek(Duration::from_secs(12)).unwrap(),
        SeekOutcome::AtEnd
    ));
    assert_eq!(controller.position().unwrap(), Duration::from_secs(10));

    let shown = controller.current_video_frame().unwrap();
    assert!(shown.reached_end);
    assert_eq!(shown.frame.unwrap().offset, Duration::from_secs(1));
}

#[test]
fn test_position_is_monotonic_while_playing() {
    let (mut controller, clock, _probe) = ten_second_clip();
    controller.play().unwrap();

    let mut previous = Duration::ZERO;
    for _ in 0..100 {
        clock.advance(Duration::from_millis(37));
        let position = controller.position().unwrap();
        assert!(position >= previous);
        previous = position;
        controller.current_video_frame().unwrap();
    }
}

#[test]
fn test_frame_never_ahead_of_position() {
    let (mut controller, clock, _probe) = ten_second_clip();
    controller.play().unwrap();

    for step in [7u64, 33, 40, 41, 120, 3, 500] {
        clock.advance(Duration::from_millis(step));
        let position = controller.position().unwrap();
        let frame = offset(&mut controller);
        assert!(frame <= position);
        assert!(position - frame < Duration::from_millis(80));
    }
}

#[test]
fn test_stop_pins_position() {
    let (mut controller, clock, probe) = ten_second_clip();
    controller.play().unwrap();
    clock.advance(Duration::from_secs(3));
    controller.stop().unwrap();
    assert_eq!(controller.position().unwrap(), Duration::ZERO);
    assert!(controller.current_video_frame().unwrap().frame.is_none());
    assert!(!probe.is_decoding());

    controller.play().unwrap();
    clock.advance(Duration::from_secs(11));
    assert_eq!(controller.state().unwrap(), PlaybackState::Stopped);
    assert_eq!(controller.position().unwrap(), controller.duration());
}

#[test]
fn test_pause_resume_continues_from_frozen_position() {
    let (mut controller, clock, _probe) = ten_second_clip();
    controller.play().unwrap();
    clock.advance(Duration::from_millis(1_500));
    controller.pause().unwrap();

    clock.advance(Duration::from_secs(5));
    assert_eq!(controller.position().unwrap(), Duration::from_millis(1_500));

    controller.play().unwrap();
    clock.advance(Duration::from_millis(520));
    assert_eq!(controller.position().unwrap(), Duration::from_millis(2_020));
    assert_eq!(offset(&mut controller), Duration::from_secs(2));
}

#[test]
fn test_stop_and_close_are_idempotent() {
    let (mut controller, clock, probe) = ten_second_clip();
    controller.play().unwrap();
    clock.advance(Duration::from_secs(1));

    controller.stop().unwrap();
    controller.stop().unwrap();
    assert_eq!(controller.state().unwrap(), PlaybackState::Stopped);

    controller.close().unwrap();
    controller.close().unwrap();
    assert!(probe.is_closed());
    assert!(matches!(controller.play(), Err(PlaybackError::Closed)));
}

#[test]
fn test_skipped_frames_are_not_end_of_stream() {
    common::init_tracing();
    let source = SyntheticSource::new(Duration::from_secs(2), (25, 1)).skip_every(3);
    let clock = ManualClock::new();
    let mut controller = Controller::open_with_clock(
        Box::new(source),
        None,
        PlayerConfig::default(),
        Arc::new(clock.clone()),
    )
    .unwrap();

    controller.play().unwrap();
    clock.advance(Duration::from_millis(1_000));
    let shown = controller.current_video_frame().unwrap();
    assert!(!shown.reached_end);
    assert!(shown.frame.is_some());
    assert_eq!(controller.state().unwrap(), PlaybackState::Playing);
}
