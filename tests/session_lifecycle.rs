use hmd_runtime::config::AppConfig;
use hmd_runtime::render::software::{SoftwareContext, SoftwareGl};
use hmd_runtime::render::{ContextBackend, GraphicsContext};
use hmd_runtime::vr::runtime::{HostContext, ReferenceSpaceType, SessionState};
use hmd_runtime::vr::simulated::{ERROR_RUNTIME_FAILURE, SimulatedConfig, SimulatedRuntime};
use hmd_runtime::vr::session::{InitStep, TrackingSession};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn session_over(runtime: &SimulatedRuntime, gl: &SoftwareGl) -> TrackingSession {
    let gl = gl.clone();
    let graphics = GraphicsContext::new(move || {
        Ok(Box::new(SoftwareContext::new(gl.clone())) as Box<dyn ContextBackend>)
    });
    TrackingSession::new(Box::new(runtime.clone()), graphics)
}

fn position(calls: &[&str], call: &str) -> usize {
    calls
        .iter()
        .position(|c| *c == call)
        .unwrap_or_else(|| panic!("{call} was never made"))
}

#[test]
fn initialization_runs_in_order() {
    init_logging();
    let gl = SoftwareGl::new();
    let runtime = SimulatedRuntime::default().with_graphics(gl.clone());
    let mut session = session_over(&runtime, &gl);

    session
        .initialize(&AppConfig::default(), &HostContext::default())
        .expect("initialize");

    let calls = runtime.calls();
    let order = [
        "xrInitializeLoaderKHR",
        "xrCreateInstance",
        "xrGetSystem",
        "xrCreateSession",
        "xrEnumerateViewConfigurations",
        "xrEnumerateReferenceSpaces",
    ];
    for pair in order.windows(2) {
        assert!(
            position(&calls, pair[0]) < position(&calls, pair[1]),
            "{} should precede {}",
            pair[0],
            pair[1]
        );
    }
    assert!(gl.is_current());
    assert!(!session.is_active());
    assert_eq!(session.state(), SessionState::Unknown);
}

#[test]
fn each_failing_step_reports_its_code_and_unwinds() {
    init_logging();
    let cases = [
        ("xrInitializeLoaderKHR", InitStep::Loader),
        ("xrCreateInstance", InitStep::Instance),
        ("xrGetSystem", InitStep::System),
        ("xrCreateSession", InitStep::Session),
        ("xrEnumerateViewConfigurations", InitStep::ViewConfiguration),
        ("xrEnumerateReferenceSpaces", InitStep::ReferenceSpaces),
    ];
    for (call, step) in cases {
        let gl = SoftwareGl::new();
        let runtime = SimulatedRuntime::default().with_graphics(gl.clone());
        runtime.fail_call(call, ERROR_RUNTIME_FAILURE);
        let mut session = session_over(&runtime, &gl);

        let err = session
            .initialize(&AppConfig::default(), &HostContext::default())
            .expect_err("initialization should fail");
        assert_eq!(err.step, step, "failing {call}");
        assert_eq!(err.code(), step.code());
        assert!(!runtime.is_instance_alive(), "instance left alive after {call}");
        assert!(!runtime.is_session_alive(), "session left alive after {call}");
        assert_eq!(runtime.live_spaces(), 0);
        assert!(!gl.is_current());
    }
}

#[test]
fn runtime_without_stage_still_initializes() {
    init_logging();
    let gl = SoftwareGl::new();
    let runtime = SimulatedRuntime::new(SimulatedConfig {
        reference_spaces: vec![ReferenceSpaceType::View, ReferenceSpaceType::Local],
        ..SimulatedConfig::default()
    })
    .with_graphics(gl.clone());
    let mut session = session_over(&runtime, &gl);

    session
        .initialize(&AppConfig::default(), &HostContext::default())
        .expect("initialize");

    assert!(session.spaces().stage.is_none());
    assert!(runtime.reference_space_poses(ReferenceSpaceType::Stage).is_empty());
}

#[test]
fn lifecycle_from_ready_to_exit() {
    init_logging();
    let gl = SoftwareGl::new();
    let runtime = SimulatedRuntime::default().with_graphics(gl.clone());
    let mut session = session_over(&runtime, &gl);
    session
        .initialize(&AppConfig::default(), &HostContext::default())
        .expect("initialize");

    session.poll_events().expect("poll");
    assert!(session.is_active());
    assert!(session.has_focus());
    assert_eq!(runtime.call_count("xrBeginSession"), 1);

    runtime.push_session_state(SessionState::Stopping);
    session.poll_events().expect("poll");
    assert!(!session.is_active());
    assert_eq!(runtime.call_count("xrEndSession"), 1);

    runtime.push_session_state(SessionState::Exiting);
    session.poll_events().expect("poll");
    assert!(session.stop_requested());

    session.shutdown();
    session.shutdown();
    assert!(!runtime.is_instance_alive());
    assert_eq!(runtime.live_spaces(), 0);
}
