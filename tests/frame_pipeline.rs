use hmd_runtime::config::AppConfig;
use hmd_runtime::engine::signal::{self, Message};
use hmd_runtime::engine::{FramePipeline, TickOutcome};
use hmd_runtime::render::software::{SoftwareContext, SoftwareGl};
use hmd_runtime::render::{ClearColorRenderer, ContextBackend, GraphicsContext};
use hmd_runtime::vr::runtime::{CompositionLayer, EnvironmentBlendMode, HostContext, SessionState};
use hmd_runtime::vr::session::TrackingSession;
use hmd_runtime::vr::simulated::SimulatedRuntime;
use std::time::Instant;

struct Fixture {
    runtime: SimulatedRuntime,
    sender: signal::SignalSender,
    pipeline: FramePipeline,
}

fn fixture(config: AppConfig) -> Fixture {
    let _ = env_logger::builder().is_test(true).try_init();
    let gl = SoftwareGl::new();
    let runtime = SimulatedRuntime::default().with_graphics(gl.clone());
    let graphics = GraphicsContext::new(move || {
        Ok(Box::new(SoftwareContext::new(gl.clone())) as Box<dyn ContextBackend>)
    });
    let mut session = TrackingSession::new(Box::new(runtime.clone()), graphics);
    session
        .initialize(&config, &HostContext::default())
        .expect("initialize");
    let (sender, receiver) = signal::channel(config.signal_capacity).expect("channel");
    let pipeline = FramePipeline::new(
        session,
        &config,
        Box::new(ClearColorRenderer::default()),
        receiver,
        Instant::now(),
    )
    .expect("pipeline");
    Fixture {
        runtime,
        sender,
        pipeline,
    }
}

#[test]
fn session_begins_once_before_the_first_wait() {
    let mut f = fixture(AppConfig::default());
    for _ in 0..3 {
        assert_eq!(f.pipeline.tick().expect("tick"), TickOutcome::Continue);
    }

    let calls = f.runtime.calls();
    let first_wait = calls
        .iter()
        .position(|call| *call == "xrWaitFrame")
        .expect("a frame was waited on");
    let begins_before_wait = calls[..first_wait]
        .iter()
        .filter(|call| **call == "xrBeginSession")
        .count();
    assert_eq!(begins_before_wait, 1);
    assert_eq!(f.runtime.call_count("xrBeginSession"), 1);
}

#[test]
fn stopping_ends_the_session_exactly_once() {
    let mut f = fixture(AppConfig::default());
    f.pipeline.tick().expect("tick");

    f.runtime.push_session_state(SessionState::Stopping);
    f.pipeline.tick().expect("tick");
    f.pipeline.tick().expect("tick");

    assert_eq!(f.runtime.call_count("xrEndSession"), 1);
    assert!(!f.pipeline.session().is_active());
    assert_eq!(f.pipeline.frame_index(), 0);
}

#[test]
fn every_submitted_frame_carries_an_opaque_projection_layer() {
    let mut f = fixture(AppConfig::default());
    let mut indices = Vec::new();
    for _ in 0..4 {
        f.pipeline.tick().expect("tick");
        indices.push(f.pipeline.frame_index());
    }
    assert_eq!(indices, vec![1, 2, 3, 4]);

    let frames = f.runtime.submitted_frames();
    assert_eq!(frames.len(), 4);
    for frame in &frames {
        assert_eq!(frame.blend_mode, EnvironmentBlendMode::Opaque);
        assert!(!frame.layers.is_empty());
        let CompositionLayer::Projection(layer) = &frame.layers.as_slice()[0];
        assert_eq!(layer.views.len(), 2);
    }
    assert!(frames
        .windows(2)
        .all(|pair| pair[0].display_time < pair[1].display_time));
    assert_eq!(f.pipeline.telemetry().stats().total_frames, 4);
}

#[test]
fn host_exit_signal_stops_the_loop() {
    let mut f = fixture(AppConfig::default());
    f.pipeline.tick().expect("tick");
    assert!(f.sender.post(Message::exit()));

    assert_eq!(f.pipeline.tick().expect("tick"), TickOutcome::Stop);
    assert!(f.pipeline.session().stop_requested());

    f.pipeline.shutdown();
    assert!(!f.runtime.is_instance_alive());
    assert_eq!(f.runtime.live_swapchains(), 0);
}

#[test]
fn run_returns_once_the_runtime_exits() {
    let mut f = fixture(AppConfig::default());
    f.pipeline.tick().expect("tick");
    f.runtime.push_session_state(SessionState::Exiting);

    f.pipeline.run().expect("run");
    assert!(f.pipeline.session().stop_requested());
}
