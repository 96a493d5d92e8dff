use crate::config::AppConfig;
use crate::render::GraphicsContext;
use crate::vr::capabilities::{Capabilities, negotiate_extensions};
use crate::vr::runtime::{
    HostContext, PerfDomain, PerfLevel, ReferenceSpaceType, RuntimeEvent, SessionState,
    SpaceHandle, SystemId, SystemProperties, ThreadKind, ViewConfigurationProperties,
    ViewConfigurationType, ViewConfigurationView, ViewStateFlags, XrRuntime,
};
use crate::vr::{Posef, SpaceLocation, Time, View, XrError, XrResult, XrResultExt};
use thiserror::Error;

/// Initialization steps in the order they run. Each failing step has its own negative code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitStep {
    Loader,
    Instance,
    System,
    GraphicsContext,
    Session,
    ViewConfiguration,
    ReferenceSpaces,
}

impl InitStep {
    pub fn code(self) -> i32 {
        match self {
            InitStep::Loader => -1,
            InitStep::Instance => -2,
            InitStep::System => -3,
            InitStep::GraphicsContext => -4,
            InitStep::Session => -5,
            InitStep::ViewConfiguration => -6,
            InitStep::ReferenceSpaces => -7,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            InitStep::Loader => "loader",
            InitStep::Instance => "instance",
            InitStep::System => "system",
            InitStep::GraphicsContext => "graphics context",
            InitStep::Session => "session",
            InitStep::ViewConfiguration => "view configuration",
            InitStep::ReferenceSpaces => "reference spaces",
        }
    }
}

#[derive(Debug, Error)]
#[error("{} initialization failed (code {}): {source}", .step.label(), .step.code())]
pub struct InitError {
    pub step: InitStep,
    #[source]
    pub source: XrError,
}

impl InitError {
    pub fn code(&self) -> i32 {
        self.step.code()
    }
}

fn at(step: InitStep) -> impl FnOnce(XrError) -> InitError {
    move |source| InitError { step, source }
}

#[derive(Debug, Clone)]
pub struct ViewConfiguration {
    pub ty: ViewConfigurationType,
    pub properties: ViewConfigurationProperties,
    pub views: Vec<ViewConfigurationView>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReferenceSpaces {
    pub view: Option<SpaceHandle>,
    pub local: Option<SpaceHandle>,
    pub stage: Option<SpaceHandle>,
    /// Local-type space anchored at the head pose of the first active frame.
    pub head: Option<SpaceHandle>,
    /// Local-type space anchored at the heading (yaw only) of the first active frame.
    pub forward_direction: Option<SpaceHandle>,
}

/// Owns the runtime connection from loader to reference spaces and drives the session
/// lifecycle from runtime events.
pub struct TrackingSession {
    runtime: Box<dyn XrRuntime>,
    graphics: GraphicsContext,
    instance_alive: bool,
    system: Option<SystemId>,
    system_properties: SystemProperties,
    session_alive: bool,
    enabled_extensions: Vec<&'static str>,
    capabilities: Capabilities,
    view_configuration: Option<ViewConfiguration>,
    spaces: ReferenceSpaces,
    state: SessionState,
    active: bool,
    has_focus: bool,
    stop_requested: bool,
    cpu_level: PerfLevel,
    gpu_level: PerfLevel,
}

impl TrackingSession {
    pub fn new(runtime: Box<dyn XrRuntime>, graphics: GraphicsContext) -> Self {
        Self {
            runtime,
            graphics,
            instance_alive: false,
            system: None,
            system_properties: SystemProperties::default(),
            session_alive: false,
            enabled_extensions: Vec::new(),
            capabilities: Capabilities::default(),
            view_configuration: None,
            spaces: ReferenceSpaces::default(),
            state: SessionState::Unknown,
            active: false,
            has_focus: false,
            stop_requested: false,
            cpu_level: PerfLevel::Boost,
            gpu_level: PerfLevel::Boost,
        }
    }

    /// Runs every initialization step in order. On failure the steps that completed are torn
    /// down again and the failing step's error is returned.
    pub fn initialize(&mut self, config: &AppConfig, host: &HostContext) -> Result<(), InitError> {
        self.cpu_level = config.cpu_level;
        self.gpu_level = config.gpu_level;

        let result = self.run_steps(config, host);
        match &result {
            Ok(()) => log::info!("[session] initialized on {}", self.runtime.label()),
            Err(err) => {
                log::error!("[session] {err}");
                self.shutdown();
            }
        }
        result
    }

    fn run_steps(&mut self, config: &AppConfig, host: &HostContext) -> Result<(), InitError> {
        self.runtime
            .initialize_loader(host)
            .map_err(at(InitStep::Loader))?;
        self.create_instance(config).map_err(at(InitStep::Instance))?;
        self.query_system().map_err(at(InitStep::System))?;
        self.create_graphics_context()
            .map_err(at(InitStep::GraphicsContext))?;
        self.create_session().map_err(at(InitStep::Session))?;
        self.select_view_configuration()
            .map_err(at(InitStep::ViewConfiguration))?;
        self.create_reference_spaces()
            .map_err(at(InitStep::ReferenceSpaces))?;
        Ok(())
    }

    fn create_instance(&mut self, config: &AppConfig) -> XrResult<()> {
        let available = self.runtime.enumerate_extensions()?;
        log::debug!("[session] runtime offers {} extension(s)", available.len());
        for name in &available {
            log::debug!("[session]   {name}");
        }

        let enabled = negotiate_extensions(&available)?;
        self.runtime
            .create_instance(&config.application_info(), &enabled)?;
        self.instance_alive = true;

        let properties = self.runtime.instance_properties()?;
        let (major, minor, patch) = properties.runtime_version;
        log::info!(
            "[session] runtime {} {major}.{minor}.{patch}",
            properties.runtime_name
        );

        self.capabilities = Capabilities::resolve(&enabled, self.runtime.as_ref());
        self.enabled_extensions = enabled;
        Ok(())
    }

    fn query_system(&mut self) -> XrResult<()> {
        let system = self.runtime.system()?;
        let properties = self.runtime.system_properties(system)?;
        log::info!(
            "[session] system {} (vendor {:#x}), max swapchain {}x{}, max layers {}",
            properties.system_name,
            properties.vendor_id,
            properties.max_swapchain_width,
            properties.max_swapchain_height,
            properties.max_layer_count
        );
        log::info!(
            "[session] tracking: orientation {}, position {}",
            properties.orientation_tracking,
            properties.position_tracking
        );
        self.system = Some(system);
        self.system_properties = properties;
        Ok(())
    }

    fn create_graphics_context(&mut self) -> XrResult<()> {
        self.graphics.make_current()?;
        Ok(())
    }

    fn create_session(&mut self) -> XrResult<()> {
        let system = self.system.ok_or(XrError::Lifecycle("xrCreateSession"))?;
        let requirements = self.runtime.graphics_requirements(system)?;
        let version = self.graphics.api_version()?;
        let found = version.packed();
        if found < requirements.min_api_version || found > requirements.max_api_version {
            return Err(XrError::GraphicsVersion {
                found,
                min: requirements.min_api_version,
                max: requirements.max_api_version,
            });
        }

        let binding = self.graphics.binding()?;
        self.runtime.create_session(system, &binding)?;
        self.session_alive = true;
        log::info!("[session] session created with GL ES {version}");
        Ok(())
    }

    fn select_view_configuration(&mut self) -> XrResult<()> {
        let system = self
            .system
            .ok_or(XrError::Lifecycle("xrEnumerateViewConfigurations"))?;
        let available = self.runtime.enumerate_view_configurations(system)?;
        log::debug!("[session] view configurations: {available:?}");
        let ty = ViewConfigurationType::PrimaryStereo;
        if !available.contains(&ty) {
            return Err(XrError::NoStereoViewConfiguration);
        }

        let properties = self.runtime.view_configuration_properties(system, ty)?;
        let mut views = self.runtime.enumerate_view_configuration_views(system, ty)?;
        if views.len() < 2 {
            return Err(XrError::NoStereoViewConfiguration);
        }
        if views.len() > 2 {
            log::warn!(
                "[session] runtime reported {} views, using the first two",
                views.len()
            );
            views.truncate(2);
        }
        for (eye, view) in views.iter().enumerate() {
            log::debug!(
                "[session] view {eye}: recommended {}x{} ({} samples), max {}x{} ({} samples)",
                view.recommended_width,
                view.recommended_height,
                view.recommended_samples,
                view.max_width,
                view.max_height,
                view.max_samples
            );
        }

        self.view_configuration = Some(ViewConfiguration {
            ty,
            properties,
            views,
        });
        Ok(())
    }

    fn create_reference_spaces(&mut self) -> XrResult<()> {
        let available = self.runtime.enumerate_reference_spaces()?;
        log::debug!("[session] reference spaces: {available:?}");
        if available.is_empty() {
            return Err(XrError::NoReferenceSpaces);
        }

        self.spaces.view = Some(
            self.runtime
                .create_reference_space(ReferenceSpaceType::View, Posef::IDENTITY)?,
        );
        self.spaces.local = Some(
            self.runtime
                .create_reference_space(ReferenceSpaceType::Local, Posef::IDENTITY)?,
        );
        if available.contains(&ReferenceSpaceType::Stage) {
            self.spaces.stage = Some(
                self.runtime
                    .create_reference_space(ReferenceSpaceType::Stage, Posef::IDENTITY)?,
            );
        } else {
            log::warn!("[session] stage space not available");
        }
        Ok(())
    }

    /// Drains every pending runtime event.
    pub fn poll_events(&mut self) -> XrResult<()> {
        while let Some(event) = self.runtime.poll_event().logged()? {
            self.handle_event(event)?;
        }
        Ok(())
    }

    pub fn handle_event(&mut self, event: RuntimeEvent) -> XrResult<()> {
        match event {
            RuntimeEvent::EventsLost { lost } => {
                log::warn!("[session] runtime dropped {lost} event(s)");
            }
            RuntimeEvent::InstanceLossPending { loss_time } => {
                log::warn!(
                    "[session] instance loss pending at {}ns",
                    loss_time.as_nanos()
                );
                self.stop_requested = true;
            }
            RuntimeEvent::SessionStateChanged { state, .. } => {
                self.handle_state_change(state)?;
            }
            RuntimeEvent::InteractionProfileChanged => {
                log::info!("[session] interaction profile changed");
            }
            RuntimeEvent::PerfSettingsChanged { domain, from, to } => {
                log::debug!("[session] {domain:?} performance level {from} -> {to}");
            }
            RuntimeEvent::ReferenceSpaceChangePending => {
                log::debug!("[session] reference space change pending");
            }
            RuntimeEvent::Unknown(ty) => {
                log::debug!("[session] ignoring event type {ty}");
            }
        }
        Ok(())
    }

    fn handle_state_change(&mut self, state: SessionState) -> XrResult<()> {
        log::info!(
            "[session] state {} -> {}",
            self.state.as_str(),
            state.as_str()
        );
        self.state = state;
        match state {
            SessionState::Ready => self.begin()?,
            SessionState::Stopping => self.end()?,
            SessionState::Focused => self.has_focus = true,
            SessionState::Visible => self.has_focus = false,
            SessionState::Exiting => self.stop_requested = true,
            SessionState::LossPending => {
                self.active = false;
                self.has_focus = false;
                self.stop_requested = true;
            }
            SessionState::Unknown | SessionState::Idle | SessionState::Synchronized => {}
        }
        Ok(())
    }

    fn begin(&mut self) -> XrResult<()> {
        if self.active {
            log::warn!("[session] READY while already running, ignoring");
            return Ok(());
        }
        let ty = self
            .view_configuration
            .as_ref()
            .map_or(ViewConfigurationType::PrimaryStereo, |config| config.ty);
        if let Err(err) = self.runtime.begin_session(ty) {
            log::error!("[session] begin failed, session stays inactive: {err}");
            return Ok(());
        }
        self.active = true;
        log::info!("[session] session running");
        self.apply_performance_hints()
    }

    fn apply_performance_hints(&mut self) -> XrResult<()> {
        if self.capabilities.perf_settings {
            self.runtime
                .set_performance_level(PerfDomain::Cpu, self.cpu_level)
                .logged()?;
            self.runtime
                .set_performance_level(PerfDomain::Gpu, self.gpu_level)
                .logged()?;
        } else {
            log::warn!("[session] performance settings unavailable, keeping runtime defaults");
        }

        if self.capabilities.android_thread_settings {
            self.runtime
                .set_application_thread(ThreadKind::ApplicationMain)
                .logged()?;
        } else {
            log::warn!("[session] thread settings unavailable, render thread not registered");
        }
        Ok(())
    }

    fn end(&mut self) -> XrResult<()> {
        if !self.active {
            log::warn!("[session] STOPPING without a running session");
            return Ok(());
        }
        self.runtime.end_session().logged()?;
        self.active = false;
        self.has_focus = false;
        log::info!("[session] session ended");
        Ok(())
    }

    /// Re-anchors the head and forward-direction spaces at the head pose predicted for `time`.
    pub fn recenter(&mut self, time: Time) -> XrResult<()> {
        let (Some(view), Some(local)) = (self.spaces.view, self.spaces.local) else {
            return Err(XrError::Lifecycle("recenter"));
        };
        let location = self.runtime.locate_space(view, local, time).logged()?;
        let head_pose = if location.is_valid() {
            location.pose
        } else {
            log::warn!("[session] head pose invalid at first frame, anchoring at origin");
            Posef::IDENTITY
        };

        for space in [
            self.spaces.forward_direction.take(),
            self.spaces.head.take(),
        ]
        .into_iter()
        .flatten()
        {
            self.runtime.destroy_space(space);
        }

        self.spaces.forward_direction = Some(
            self.runtime
                .create_reference_space(ReferenceSpaceType::Local, head_pose.heading())
                .logged()?,
        );
        self.spaces.head = Some(
            self.runtime
                .create_reference_space(ReferenceSpaceType::Local, head_pose)
                .logged()?,
        );
        log::debug!("[session] recentered at {:?}", head_pose.position);
        Ok(())
    }

    /// Head pose relative to the local space.
    pub fn locate_head(&self, time: Time) -> XrResult<SpaceLocation> {
        let (Some(view), Some(local)) = (self.spaces.view, self.spaces.local) else {
            return Err(XrError::Lifecycle("xrLocateSpace"));
        };
        self.runtime.locate_space(view, local, time).logged()
    }

    /// Per-eye views relative to the local space.
    pub fn locate_views(&self, time: Time) -> XrResult<(ViewStateFlags, Vec<View>)> {
        let (Some(local), Some(config)) = (self.spaces.local, self.view_configuration.as_ref())
        else {
            return Err(XrError::Lifecycle("xrLocateViews"));
        };
        self.runtime.locate_views(config.ty, time, local).logged()
    }

    /// Tears down spaces, session, instance and graphics context, in that order. Safe to call
    /// repeatedly and after a partial initialization.
    pub fn shutdown(&mut self) {
        let spaces = std::mem::take(&mut self.spaces);
        for space in [
            spaces.stage,
            spaces.forward_direction,
            spaces.local,
            spaces.head,
            spaces.view,
        ]
        .into_iter()
        .flatten()
        {
            self.runtime.destroy_space(space);
        }

        if self.session_alive {
            if self.active && self.state.is_running() {
                if let Err(err) = self.runtime.end_session() {
                    log::warn!("[session] end on shutdown failed: {err}");
                }
            }
            self.runtime.destroy_session();
            self.session_alive = false;
            self.active = false;
            self.has_focus = false;
        }

        if self.instance_alive {
            self.runtime.destroy_instance();
            self.instance_alive = false;
        }

        self.graphics.shutdown();
        self.system = None;
        self.view_configuration = None;
        self.capabilities = Capabilities::default();
        self.enabled_extensions.clear();
    }

    pub fn request_stop(&mut self) {
        self.stop_requested = true;
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn has_focus(&self) -> bool {
        self.has_focus
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn enabled_extensions(&self) -> &[&'static str] {
        &self.enabled_extensions
    }

    pub fn system_properties(&self) -> &SystemProperties {
        &self.system_properties
    }

    pub fn view_configuration(&self) -> Option<&ViewConfiguration> {
        self.view_configuration.as_ref()
    }

    pub fn spaces(&self) -> ReferenceSpaces {
        self.spaces
    }

    pub fn graphics(&self) -> &GraphicsContext {
        &self.graphics
    }

    pub fn runtime(&self) -> &dyn XrRuntime {
        self.runtime.as_ref()
    }

    pub fn runtime_mut(&mut self) -> &mut dyn XrRuntime {
        self.runtime.as_mut()
    }
}

impl Drop for TrackingSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::software::{SoftwareContext, SoftwareGl};
    use crate::render::{ContextBackend, GraphicsError};
    use crate::vr::capabilities::{EXT_PERFORMANCE_SETTINGS, THREAD_SETTINGS_ENTRY_POINT};
    use crate::vr::simulated::{ERROR_RUNTIME_FAILURE, SimulatedConfig, SimulatedRuntime};
    use crate::vr::{Quaternionf, Vector3f};

    fn software_context(gl: &SoftwareGl) -> GraphicsContext {
        let gl = gl.clone();
        GraphicsContext::new(move || {
            Ok(Box::new(SoftwareContext::new(gl.clone())) as Box<dyn ContextBackend>)
        })
    }

    fn session_over(runtime: &SimulatedRuntime, gl: &SoftwareGl) -> TrackingSession {
        TrackingSession::new(Box::new(runtime.clone()), software_context(gl))
    }

    fn initialized(config: SimulatedConfig) -> (SimulatedRuntime, SoftwareGl, TrackingSession) {
        let runtime = SimulatedRuntime::new(config);
        let gl = SoftwareGl::new();
        let mut session = session_over(&runtime, &gl);
        session
            .initialize(&AppConfig::default(), &HostContext::default())
            .expect("session should initialize");
        (runtime, gl, session)
    }

    fn fail_init(runtime: &SimulatedRuntime, gl: &SoftwareGl) -> InitError {
        let mut session = session_over(runtime, gl);
        session
            .initialize(&AppConfig::default(), &HostContext::default())
            .unwrap_err()
    }

    fn assert_fully_unwound(runtime: &SimulatedRuntime, gl: &SoftwareGl) {
        assert!(!runtime.is_instance_alive());
        assert!(!runtime.is_session_alive());
        assert_eq!(runtime.live_spaces(), 0);
        assert!(!gl.is_current());
    }

    #[test]
    fn initializes_spaces_and_capabilities() {
        let (runtime, gl, session) = initialized(SimulatedConfig::default());

        let spaces = session.spaces();
        assert!(spaces.view.is_some() && spaces.local.is_some() && spaces.stage.is_some());
        assert!(spaces.head.is_none() && spaces.forward_direction.is_none());
        assert_eq!(runtime.live_spaces(), 3);
        assert!(session.capabilities().perf_settings);
        assert!(session.capabilities().hand_tracking);
        assert_eq!(session.view_configuration().expect("views").views.len(), 2);
        assert!(gl.is_current());
        assert!(!session.is_active());
    }

    #[test]
    fn loader_failure_touches_nothing_else() {
        let runtime = SimulatedRuntime::default();
        runtime.fail_call("xrInitializeLoaderKHR", ERROR_RUNTIME_FAILURE);
        let gl = SoftwareGl::new();

        let err = fail_init(&runtime, &gl);
        assert_eq!(err.code(), -1);
        assert_eq!(runtime.calls(), vec!["xrInitializeLoaderKHR"]);
    }

    #[test]
    fn missing_required_extension_fails_instance_step() {
        let runtime = SimulatedRuntime::new(SimulatedConfig {
            extensions: vec!["XR_KHR_opengl_es_enable".to_string()],
            ..SimulatedConfig::default()
        });
        let gl = SoftwareGl::new();

        let err = fail_init(&runtime, &gl);
        assert_eq!(err.step, InitStep::Instance);
        assert_eq!(err.code(), -2);
        assert_eq!(runtime.call_count("xrCreateInstance"), 0);
    }

    #[test]
    fn system_failure_destroys_instance() {
        let runtime = SimulatedRuntime::default();
        runtime.fail_call("xrGetSystem", ERROR_RUNTIME_FAILURE);
        let gl = SoftwareGl::new();

        let err = fail_init(&runtime, &gl);
        assert_eq!(err.code(), -3);
        assert_fully_unwound(&runtime, &gl);
        assert_eq!(runtime.call_count("xrDestroyInstance"), 1);
    }

    #[test]
    fn graphics_failure_reports_its_own_code() {
        let runtime = SimulatedRuntime::default();
        let mut session = TrackingSession::new(
            Box::new(runtime.clone()),
            GraphicsContext::new(|| Err(GraphicsError::NoDisplay)),
        );

        let err = session
            .initialize(&AppConfig::default(), &HostContext::default())
            .unwrap_err();
        assert_eq!(err.code(), -4);
        assert!(!runtime.is_instance_alive());
        assert_eq!(runtime.call_count("xrCreateSession"), 0);
    }

    #[test]
    fn graphics_version_outside_runtime_range_fails_session_step() {
        let runtime = SimulatedRuntime::new(SimulatedConfig {
            graphics_requirements: crate::vr::runtime::GraphicsRequirements {
                min_api_version: 310,
                max_api_version: 310,
            },
            ..SimulatedConfig::default()
        });
        let gl = SoftwareGl::new();

        let err = fail_init(&runtime, &gl);
        assert_eq!(err.code(), -5);
        assert!(matches!(err.source, XrError::GraphicsVersion { found: 302, .. }));
        assert_fully_unwound(&runtime, &gl);
    }

    #[test]
    fn missing_stereo_configuration_unwinds_session() {
        let runtime = SimulatedRuntime::new(SimulatedConfig {
            view_configurations: vec![ViewConfigurationType::PrimaryMono],
            ..SimulatedConfig::default()
        });
        let gl = SoftwareGl::new();

        let err = fail_init(&runtime, &gl);
        assert_eq!(err.code(), -6);
        assert_fully_unwound(&runtime, &gl);
        let calls = runtime.calls();
        let tail = &calls[calls.len() - 2..];
        assert_eq!(tail, &["xrDestroySession", "xrDestroyInstance"]);
    }

    #[test]
    fn no_reference_spaces_fails_last_step() {
        let runtime = SimulatedRuntime::new(SimulatedConfig {
            reference_spaces: Vec::new(),
            ..SimulatedConfig::default()
        });
        let gl = SoftwareGl::new();

        let err = fail_init(&runtime, &gl);
        assert_eq!(err.step, InitStep::ReferenceSpaces);
        assert_eq!(err.code(), -7);
        assert_fully_unwound(&runtime, &gl);
    }

    #[test]
    fn stage_is_optional() {
        let (runtime, _gl, session) = initialized(SimulatedConfig {
            reference_spaces: vec![ReferenceSpaceType::View, ReferenceSpaceType::Local],
            ..SimulatedConfig::default()
        });
        assert!(session.spaces().stage.is_none());
        assert_eq!(runtime.live_spaces(), 2);
    }

    #[test]
    fn ready_begins_once_and_applies_performance_hints() {
        let (runtime, _gl, mut session) = initialized(SimulatedConfig::default());

        session.poll_events().expect("poll");
        assert!(session.is_active());
        assert!(session.has_focus());
        assert_eq!(session.state(), SessionState::Focused);
        assert_eq!(runtime.call_count("xrBeginSession"), 1);
        assert_eq!(
            runtime.perf_levels(),
            vec![
                (PerfDomain::Cpu, PerfLevel::Boost),
                (PerfDomain::Gpu, PerfLevel::Boost)
            ]
        );
        assert_eq!(runtime.app_threads(), vec![ThreadKind::ApplicationMain]);

        runtime.push_session_state(SessionState::Ready);
        session.poll_events().expect("poll");
        assert_eq!(runtime.call_count("xrBeginSession"), 1);
    }

    #[test]
    fn focus_follows_visible_and_focused() {
        let (runtime, _gl, mut session) = initialized(SimulatedConfig::default());
        session.poll_events().expect("poll");

        runtime.push_session_state(SessionState::Visible);
        session.poll_events().expect("poll");
        assert!(!session.has_focus());
        assert!(session.is_active());

        runtime.push_session_state(SessionState::Focused);
        session.poll_events().expect("poll");
        assert!(session.has_focus());
    }

    #[test]
    fn stopping_ends_session_exactly_once() {
        let (runtime, _gl, mut session) = initialized(SimulatedConfig::default());
        session.poll_events().expect("poll");

        runtime.push_session_state(SessionState::Stopping);
        session.poll_events().expect("poll");
        assert!(!session.is_active());
        assert_eq!(runtime.call_count("xrEndSession"), 1);

        runtime.push_session_state(SessionState::Stopping);
        session.poll_events().expect("poll");
        assert_eq!(runtime.call_count("xrEndSession"), 1);

        runtime.push_session_state(SessionState::Ready);
        session.poll_events().expect("poll");
        assert!(session.is_active());
        assert_eq!(runtime.call_count("xrBeginSession"), 2);
    }

    #[test]
    fn begin_failure_fails_closed() {
        let (runtime, _gl, mut session) = initialized(SimulatedConfig::default());
        runtime.fail_call("xrBeginSession", ERROR_RUNTIME_FAILURE);

        session.poll_events().expect("begin failure is not fatal");
        assert!(!session.is_active());
        assert!(runtime.perf_levels().is_empty());
    }

    #[test]
    fn missing_entry_points_skip_hints() {
        let (runtime, _gl, mut session) = initialized(SimulatedConfig {
            entry_points: vec![THREAD_SETTINGS_ENTRY_POINT.to_string()],
            ..SimulatedConfig::default()
        });
        assert!(session.enabled_extensions().contains(&EXT_PERFORMANCE_SETTINGS));

        session.poll_events().expect("poll");
        assert!(session.is_active());
        assert_eq!(
            runtime.call_count("xrPerfSettingsSetPerformanceLevelEXT"),
            0
        );
        assert_eq!(runtime.app_threads(), vec![ThreadKind::ApplicationMain]);
    }

    #[test]
    fn exit_and_loss_request_stop() {
        for event in [
            RuntimeEvent::SessionStateChanged {
                state: SessionState::Exiting,
                time: Time::default(),
            },
            RuntimeEvent::SessionStateChanged {
                state: SessionState::LossPending,
                time: Time::default(),
            },
            RuntimeEvent::InstanceLossPending {
                loss_time: Time::default(),
            },
        ] {
            let (runtime, _gl, mut session) = initialized(SimulatedConfig {
                auto_advance: false,
                ..SimulatedConfig::default()
            });
            runtime.push_event(event);
            session.poll_events().expect("poll");
            assert!(session.stop_requested());
        }
    }

    #[test]
    fn loss_pending_deactivates_a_running_session() {
        let (runtime, _gl, mut session) = initialized(SimulatedConfig::default());
        session.poll_events().expect("poll");
        assert!(session.is_active());
        assert!(session.has_focus());

        runtime.push_session_state(SessionState::LossPending);
        session.poll_events().expect("poll");
        assert!(session.stop_requested());
        assert!(!session.is_active());
        assert!(!session.has_focus());
    }

    #[test]
    fn end_failure_is_fatal() {
        let (runtime, _gl, mut session) = initialized(SimulatedConfig::default());
        session.poll_events().expect("poll");
        runtime.fail_call("xrEndSession", ERROR_RUNTIME_FAILURE);
        runtime.push_session_state(SessionState::Stopping);

        let err = session.poll_events().unwrap_err();
        assert_eq!(err.code(), Some(ERROR_RUNTIME_FAILURE));
    }

    #[test]
    fn recenter_anchors_head_and_heading() {
        let (runtime, _gl, mut session) = initialized(SimulatedConfig::default());
        let yaw = Quaternionf::from_yaw(0.5);
        let pitch = Quaternionf {
            x: (0.2f32).sin(),
            y: 0.0,
            z: 0.0,
            w: (0.2f32).cos(),
        };
        let head = Posef::new(yaw.mul(pitch), Vector3f::new(0.1, 1.7, -0.3));
        runtime.set_head_pose(head);

        session.recenter(Time::from_nanos(1)).expect("recenter");
        session.recenter(Time::from_nanos(2)).expect("recenter again");

        let locals = runtime.reference_space_poses(ReferenceSpaceType::Local);
        assert_eq!(locals.len(), 3);
        let forward = locals[1];
        let anchored = locals[2];
        assert!((forward.orientation.yaw() - 0.5).abs() < 1e-4);
        assert!(forward.orientation.x.abs() < 1e-6);
        assert!((anchored.position.y - 1.7).abs() < 1e-5);
        assert!((anchored.orientation.x - head.orientation.x).abs() < 1e-5);
    }

    #[test]
    fn shutdown_ends_running_session_and_is_idempotent() {
        let (runtime, gl, mut session) = initialized(SimulatedConfig::default());
        session.poll_events().expect("poll");
        session.recenter(Time::from_nanos(1)).expect("recenter");

        session.shutdown();
        let calls_after_first = runtime.calls().len();
        session.shutdown();

        assert_eq!(runtime.calls().len(), calls_after_first);
        assert_eq!(runtime.call_count("xrEndSession"), 1);
        assert_eq!(runtime.call_count("xrDestroySpace"), 5);
        assert_fully_unwound(&runtime, &gl);
        assert!(!session.is_active());
    }
}
