//! Deterministic in-process tracking runtime. Clones share state, so a test can keep one
//! handle for scripting events and inspecting calls while the session owns another.

use crate::render::context::GraphicsBinding;
use crate::render::formats::{GL_RGBA8, GL_SRGB8_ALPHA8};
use crate::render::software::SoftwareGl;
use crate::vr::capabilities::{
    OPTIONAL_EXTENSIONS, PERF_SETTINGS_ENTRY_POINT, REQUIRED_EXTENSIONS,
    THREAD_SETTINGS_ENTRY_POINT,
};
use crate::vr::runtime::{
    ActionHandle, ActionSetHandle, ActionStateBoolean, ActionStateVector2f, ActionType,
    ApplicationInfo, EnvironmentBlendMode, FrameTiming, GraphicsRequirements, HostContext,
    ImageWait, InstanceProperties, LayerList, PathHandle, PerfDomain, PerfLevel,
    ReferenceSpaceType, RuntimeEvent, SessionState, SpaceHandle, SuggestedBinding,
    SwapchainCreateInfo, SwapchainHandle, SystemId, SystemProperties, ThreadKind,
    ViewConfigurationProperties, ViewConfigurationType, ViewConfigurationView, ViewStateFlags,
    XrRuntime,
};
use crate::vr::{Fovf, Posef, SpaceLocation, Time, Vector2f, Vector3f, View, XrError, XrResult};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

pub const ERROR_VALIDATION_FAILURE: i32 = -1;
pub const ERROR_RUNTIME_FAILURE: i32 = -2;
pub const ERROR_FUNCTION_UNSUPPORTED: i32 = -7;
pub const ERROR_EXTENSION_NOT_PRESENT: i32 = -9;
pub const ERROR_HANDLE_INVALID: i32 = -12;
pub const ERROR_SESSION_RUNNING: i32 = -14;
pub const ERROR_SESSION_NOT_RUNNING: i32 = -16;
pub const ERROR_SWAPCHAIN_FORMAT_UNSUPPORTED: i32 = -26;
pub const ERROR_CALL_ORDER_INVALID: i32 = -37;
pub const ERROR_ACTIONSET_NOT_ATTACHED: i32 = -46;

pub fn result_name(code: i32) -> &'static str {
    match code {
        ERROR_VALIDATION_FAILURE => "XR_ERROR_VALIDATION_FAILURE",
        ERROR_RUNTIME_FAILURE => "XR_ERROR_RUNTIME_FAILURE",
        ERROR_FUNCTION_UNSUPPORTED => "XR_ERROR_FUNCTION_UNSUPPORTED",
        ERROR_EXTENSION_NOT_PRESENT => "XR_ERROR_EXTENSION_NOT_PRESENT",
        ERROR_HANDLE_INVALID => "XR_ERROR_HANDLE_INVALID",
        ERROR_SESSION_RUNNING => "XR_ERROR_SESSION_RUNNING",
        ERROR_SESSION_NOT_RUNNING => "XR_ERROR_SESSION_NOT_RUNNING",
        ERROR_SWAPCHAIN_FORMAT_UNSUPPORTED => "XR_ERROR_SWAPCHAIN_FORMAT_UNSUPPORTED",
        ERROR_CALL_ORDER_INVALID => "XR_ERROR_CALL_ORDER_INVALID",
        ERROR_ACTIONSET_NOT_ATTACHED => "XR_ERROR_ACTIONSET_NOT_ATTACHED",
        _ => "XR_UNKNOWN_RESULT",
    }
}

const EYE_HALF_IPD: f32 = 0.032;

#[derive(Debug, Clone)]
pub struct SimulatedConfig {
    pub runtime_name: String,
    pub extensions: Vec<String>,
    pub entry_points: Vec<String>,
    pub system: SystemProperties,
    pub graphics_requirements: GraphicsRequirements,
    pub view_configurations: Vec<ViewConfigurationType>,
    pub view: ViewConfigurationView,
    pub view_count: usize,
    pub reference_spaces: Vec<ReferenceSpaceType>,
    pub swapchain_formats: Vec<i64>,
    pub swapchain_length: u32,
    pub display_period: Duration,
    /// Emit the state transitions a runtime drives on its own: IDLE and READY after session
    /// creation, SYNCHRONIZED through FOCUSED after begin, IDLE after end.
    pub auto_advance: bool,
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        let extensions = REQUIRED_EXTENSIONS
            .iter()
            .chain(OPTIONAL_EXTENSIONS)
            .map(|name| name.to_string())
            .collect();
        Self {
            runtime_name: "Simulated Runtime".to_string(),
            extensions,
            entry_points: vec![
                PERF_SETTINGS_ENTRY_POINT.to_string(),
                THREAD_SETTINGS_ENTRY_POINT.to_string(),
            ],
            system: SystemProperties {
                system_name: "Simulated Headset".to_string(),
                vendor_id: 0x2833,
                max_layer_count: 16,
                max_swapchain_width: 4096,
                max_swapchain_height: 4096,
                orientation_tracking: true,
                position_tracking: true,
            },
            graphics_requirements: GraphicsRequirements {
                min_api_version: 300,
                max_api_version: 320,
            },
            view_configurations: vec![ViewConfigurationType::PrimaryStereo],
            view: ViewConfigurationView {
                recommended_width: 1024,
                max_width: 2048,
                recommended_height: 1024,
                max_height: 2048,
                recommended_samples: 1,
                max_samples: 4,
            },
            view_count: 2,
            reference_spaces: vec![
                ReferenceSpaceType::View,
                ReferenceSpaceType::Local,
                ReferenceSpaceType::Stage,
            ],
            swapchain_formats: vec![GL_SRGB8_ALPHA8, GL_RGBA8],
            swapchain_length: 3,
            display_period: Duration::from_nanos(13_888_889),
            auto_advance: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum SpaceKind {
    Reference(ReferenceSpaceType),
    Action { subaction: String },
}

#[derive(Debug, Clone)]
struct SimSpace {
    kind: SpaceKind,
    offset: Posef,
}

#[derive(Debug, Clone)]
struct SimSwapchain {
    images: Vec<u32>,
    next: usize,
    acquired: VecDeque<(u32, bool)>,
    last_waited: Option<u32>,
}

#[derive(Debug, Clone)]
struct SimAction {
    name: String,
    ty: ActionType,
}

#[derive(Debug, Clone)]
pub struct SubmittedFrame {
    pub display_time: Time,
    pub blend_mode: EnvironmentBlendMode,
    pub layers: LayerList,
}

type StateKey = (String, Option<String>);

#[derive(Debug, Default)]
struct SimState {
    calls: Vec<&'static str>,
    failures: HashMap<&'static str, i32>,
    events: VecDeque<RuntimeEvent>,
    loader_ready: bool,
    instance: bool,
    enabled_extensions: Vec<String>,
    session: bool,
    session_running: bool,
    next_handle: u64,
    spaces: HashMap<u64, SimSpace>,
    swapchains: HashMap<u64, SimSwapchain>,
    paths: HashMap<String, u64>,
    path_names: HashMap<u64, String>,
    action_sets: HashMap<u64, String>,
    actions: HashMap<u64, SimAction>,
    attached: bool,
    suggested: Vec<(String, String)>,
    staged_booleans: HashMap<StateKey, bool>,
    synced_booleans: HashMap<StateKey, ActionStateBoolean>,
    staged_vectors: HashMap<StateKey, Vector2f>,
    synced_vectors: HashMap<StateKey, ActionStateVector2f>,
    hand_active: HashMap<String, bool>,
    hand_poses: HashMap<String, Posef>,
    head_pose: Posef,
    view_flags: ViewStateFlags,
    time: i64,
    pending_timeouts: u32,
    submitted: Vec<SubmittedFrame>,
    perf_levels: Vec<(PerfDomain, PerfLevel)>,
    app_threads: Vec<ThreadKind>,
}

impl SimState {
    fn enter(&mut self, call: &'static str) -> XrResult<()> {
        self.calls.push(call);
        match self.failures.get(call) {
            Some(code) => Err(XrError::runtime(call, *code, result_name(*code))),
            None => Ok(()),
        }
    }

    fn handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn require_session(&self, call: &'static str) -> XrResult<()> {
        if self.session {
            Ok(())
        } else {
            Err(XrError::runtime(
                call,
                ERROR_HANDLE_INVALID,
                result_name(ERROR_HANDLE_INVALID),
            ))
        }
    }

    fn push_state(&mut self, state: SessionState) {
        self.events.push_back(RuntimeEvent::SessionStateChanged {
            state,
            time: Time::from_nanos(self.time),
        });
    }

    fn key(&self, action: ActionHandle, subaction_path: Option<PathHandle>) -> Option<StateKey> {
        let action = self.actions.get(&action.into_raw())?;
        let path = subaction_path.and_then(|path| self.path_names.get(&path.into_raw()).cloned());
        Some((action.name.clone(), path))
    }

    fn world_pose(&self, space: SpaceHandle) -> Option<(Posef, bool)> {
        let space = self.spaces.get(&space.into_raw())?;
        let (origin, valid) = match &space.kind {
            SpaceKind::Reference(ReferenceSpaceType::View) => (self.head_pose, true),
            SpaceKind::Reference(ReferenceSpaceType::Stage) => (
                Posef::new(Default::default(), Vector3f::new(0.0, -1.6, 0.0)),
                true,
            ),
            SpaceKind::Reference(_) => (Posef::IDENTITY, true),
            SpaceKind::Action { subaction } => (
                self.hand_poses
                    .get(subaction)
                    .copied()
                    .unwrap_or(Posef::IDENTITY),
                self.hand_active.get(subaction).copied().unwrap_or(true),
            ),
        };
        Some((origin.compose(space.offset), valid))
    }
}

#[derive(Clone)]
pub struct SimulatedRuntime {
    config: Arc<SimulatedConfig>,
    state: Arc<Mutex<SimState>>,
    gl: Option<SoftwareGl>,
}

impl Default for SimulatedRuntime {
    fn default() -> Self {
        Self::new(SimulatedConfig::default())
    }
}

impl SimulatedRuntime {
    pub fn new(config: SimulatedConfig) -> Self {
        let state = SimState {
            view_flags: ViewStateFlags {
                orientation_valid: true,
                position_valid: true,
            },
            head_pose: Posef::new(Default::default(), Vector3f::new(0.0, 1.6, 0.0)),
            ..SimState::default()
        };
        Self {
            config: Arc::new(config),
            state: Arc::new(Mutex::new(state)),
            gl: None,
        }
    }

    /// Swapchain images become textures on this device.
    pub fn with_graphics(mut self, gl: SoftwareGl) -> Self {
        self.gl = Some(gl);
        self
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state
            .lock()
            .expect("simulated runtime mutex should not poison")
    }

    /// Creates an instance and a headless session without going through `TrackingSession`.
    pub fn start_headless_session(&mut self) -> XrResult<()> {
        let app = ApplicationInfo {
            application_name: "headless".to_string(),
            application_version: 1,
            engine_name: "headless".to_string(),
            engine_version: 1,
        };
        self.create_instance(&app, &[])?;
        let system = self.system()?;
        self.create_session(system, &GraphicsBinding::Headless)
    }

    pub fn push_event(&self, event: RuntimeEvent) {
        self.lock().events.push_back(event);
    }

    pub fn push_session_state(&self, state: SessionState) {
        self.lock().push_state(state);
    }

    /// Every later call named `call` fails with `code` until cleared.
    pub fn fail_call(&self, call: &'static str, code: i32) {
        self.lock().failures.insert(call, code);
    }

    pub fn clear_failure(&self, call: &'static str) {
        self.lock().failures.remove(call);
    }

    pub fn queue_image_timeouts(&self, count: u32) {
        self.lock().pending_timeouts = count;
    }

    pub fn set_head_pose(&self, pose: Posef) {
        self.lock().head_pose = pose;
    }

    pub fn set_view_flags(&self, flags: ViewStateFlags) {
        self.lock().view_flags = flags;
    }

    pub fn set_hand_active(&self, hand_path: &str, active: bool) {
        self.lock().hand_active.insert(hand_path.to_string(), active);
    }

    pub fn set_hand_pose(&self, hand_path: &str, pose: Posef) {
        self.lock().hand_poses.insert(hand_path.to_string(), pose);
    }

    /// Stages a boolean input; it becomes visible at the next action sync.
    pub fn set_boolean(&self, action: &str, subaction_path: Option<&str>, pressed: bool) {
        self.lock().staged_booleans.insert(
            (action.to_string(), subaction_path.map(str::to_string)),
            pressed,
        );
    }

    pub fn set_vector2(&self, action: &str, subaction_path: Option<&str>, value: Vector2f) {
        self.lock().staged_vectors.insert(
            (action.to_string(), subaction_path.map(str::to_string)),
            value,
        );
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.lock().calls.clone()
    }

    pub fn call_count(&self, call: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|recorded| **recorded == call)
            .count()
    }

    pub fn is_loader_ready(&self) -> bool {
        self.lock().loader_ready
    }

    pub fn is_instance_alive(&self) -> bool {
        self.lock().instance
    }

    pub fn enabled_extensions(&self) -> Vec<String> {
        self.lock().enabled_extensions.clone()
    }

    pub fn is_session_alive(&self) -> bool {
        self.lock().session
    }

    pub fn is_session_running(&self) -> bool {
        self.lock().session_running
    }

    pub fn live_spaces(&self) -> usize {
        self.lock().spaces.len()
    }

    /// Offsets of live reference spaces of `ty`, in creation order.
    pub fn reference_space_poses(&self, ty: ReferenceSpaceType) -> Vec<Posef> {
        let state = self.lock();
        let mut spaces: Vec<_> = state
            .spaces
            .iter()
            .filter(|(_, space)| space.kind == SpaceKind::Reference(ty))
            .map(|(handle, space)| (*handle, space.offset))
            .collect();
        spaces.sort_by_key(|(handle, _)| *handle);
        spaces.into_iter().map(|(_, pose)| pose).collect()
    }

    pub fn live_swapchains(&self) -> usize {
        self.lock().swapchains.len()
    }

    /// Images acquired from `swapchain` and not yet released.
    pub fn outstanding_images(&self, swapchain: SwapchainHandle) -> usize {
        self.lock()
            .swapchains
            .get(&swapchain.into_raw())
            .map_or(0, |chain| chain.acquired.len())
    }

    /// Index of the image the most recent successful wait on `swapchain` completed for.
    pub fn last_waited_image(&self, swapchain: SwapchainHandle) -> Option<u32> {
        self.lock()
            .swapchains
            .get(&swapchain.into_raw())
            .and_then(|chain| chain.last_waited)
    }

    pub fn is_attached(&self) -> bool {
        self.lock().attached
    }

    pub fn suggested_bindings(&self) -> Vec<(String, String)> {
        self.lock().suggested.clone()
    }

    pub fn submitted_frames(&self) -> Vec<SubmittedFrame> {
        self.lock().submitted.clone()
    }

    pub fn perf_levels(&self) -> Vec<(PerfDomain, PerfLevel)> {
        self.lock().perf_levels.clone()
    }

    pub fn app_threads(&self) -> Vec<ThreadKind> {
        self.lock().app_threads.clone()
    }
}

impl XrRuntime for SimulatedRuntime {
    fn label(&self) -> &'static str {
        "Simulated Runtime"
    }

    fn initialize_loader(&mut self, _host: &HostContext) -> XrResult<()> {
        let mut state = self.lock();
        state.enter("xrInitializeLoaderKHR")?;
        state.loader_ready = true;
        Ok(())
    }

    fn enumerate_extensions(&mut self) -> XrResult<Vec<String>> {
        self.lock().enter("xrEnumerateInstanceExtensionProperties")?;
        Ok(self.config.extensions.clone())
    }

    fn create_instance(&mut self, _app: &ApplicationInfo, extensions: &[&str]) -> XrResult<()> {
        let mut state = self.lock();
        state.enter("xrCreateInstance")?;
        if let Some(missing) = extensions
            .iter()
            .find(|name| !self.config.extensions.iter().any(|ext| ext == *name))
        {
            log::debug!("[sim] extension {missing} requested but not offered");
            return Err(XrError::runtime(
                "xrCreateInstance",
                ERROR_EXTENSION_NOT_PRESENT,
                result_name(ERROR_EXTENSION_NOT_PRESENT),
            ));
        }
        state.instance = true;
        state.enabled_extensions = extensions.iter().map(|name| name.to_string()).collect();
        Ok(())
    }

    fn instance_properties(&self) -> XrResult<InstanceProperties> {
        self.lock().enter("xrGetInstanceProperties")?;
        Ok(InstanceProperties {
            runtime_name: self.config.runtime_name.clone(),
            runtime_version: (1, 0, 0),
        })
    }

    fn has_entry_point(&self, name: &str) -> bool {
        let state = self.lock();
        state.instance && self.config.entry_points.iter().any(|entry| entry == name)
    }

    fn destroy_instance(&mut self) {
        let mut state = self.lock();
        state.calls.push("xrDestroyInstance");
        state.instance = false;
        state.enabled_extensions.clear();
    }

    fn system(&mut self) -> XrResult<SystemId> {
        self.lock().enter("xrGetSystem")?;
        Ok(SystemId::from_raw(1))
    }

    fn system_properties(&self, _system: SystemId) -> XrResult<SystemProperties> {
        self.lock().enter("xrGetSystemProperties")?;
        Ok(self.config.system.clone())
    }

    fn graphics_requirements(&self, _system: SystemId) -> XrResult<GraphicsRequirements> {
        self.lock().enter("xrGetOpenGLESGraphicsRequirementsKHR")?;
        Ok(self.config.graphics_requirements)
    }

    fn create_session(&mut self, _system: SystemId, _binding: &GraphicsBinding) -> XrResult<()> {
        let mut state = self.lock();
        state.enter("xrCreateSession")?;
        state.session = true;
        if self.config.auto_advance {
            state.push_state(SessionState::Idle);
            state.push_state(SessionState::Ready);
        }
        Ok(())
    }

    fn begin_session(&mut self, _view_configuration: ViewConfigurationType) -> XrResult<()> {
        let mut state = self.lock();
        state.enter("xrBeginSession")?;
        state.require_session("xrBeginSession")?;
        if state.session_running {
            return Err(XrError::runtime(
                "xrBeginSession",
                ERROR_SESSION_RUNNING,
                result_name(ERROR_SESSION_RUNNING),
            ));
        }
        state.session_running = true;
        if self.config.auto_advance {
            state.push_state(SessionState::Synchronized);
            state.push_state(SessionState::Visible);
            state.push_state(SessionState::Focused);
        }
        Ok(())
    }

    fn end_session(&mut self) -> XrResult<()> {
        let mut state = self.lock();
        state.enter("xrEndSession")?;
        if !state.session_running {
            return Err(XrError::runtime(
                "xrEndSession",
                ERROR_SESSION_NOT_RUNNING,
                result_name(ERROR_SESSION_NOT_RUNNING),
            ));
        }
        state.session_running = false;
        if self.config.auto_advance {
            state.push_state(SessionState::Idle);
        }
        Ok(())
    }

    fn destroy_session(&mut self) {
        let mut state = self.lock();
        state.calls.push("xrDestroySession");
        state.session = false;
        state.session_running = false;
    }

    fn poll_event(&mut self) -> XrResult<Option<RuntimeEvent>> {
        let mut state = self.lock();
        state.enter("xrPollEvent")?;
        Ok(state.events.pop_front())
    }

    fn enumerate_view_configurations(
        &self,
        _system: SystemId,
    ) -> XrResult<Vec<ViewConfigurationType>> {
        self.lock().enter("xrEnumerateViewConfigurations")?;
        Ok(self.config.view_configurations.clone())
    }

    fn view_configuration_properties(
        &self,
        _system: SystemId,
        ty: ViewConfigurationType,
    ) -> XrResult<ViewConfigurationProperties> {
        self.lock().enter("xrGetViewConfigurationProperties")?;
        Ok(ViewConfigurationProperties {
            ty,
            fov_mutable: true,
        })
    }

    fn enumerate_view_configuration_views(
        &self,
        _system: SystemId,
        _ty: ViewConfigurationType,
    ) -> XrResult<Vec<ViewConfigurationView>> {
        self.lock().enter("xrEnumerateViewConfigurationViews")?;
        Ok(vec![self.config.view; self.config.view_count])
    }

    fn enumerate_reference_spaces(&self) -> XrResult<Vec<ReferenceSpaceType>> {
        let mut state = self.lock();
        state.enter("xrEnumerateReferenceSpaces")?;
        state.require_session("xrEnumerateReferenceSpaces")?;
        Ok(self.config.reference_spaces.clone())
    }

    fn create_reference_space(
        &mut self,
        ty: ReferenceSpaceType,
        pose: Posef,
    ) -> XrResult<SpaceHandle> {
        let mut state = self.lock();
        state.enter("xrCreateReferenceSpace")?;
        state.require_session("xrCreateReferenceSpace")?;
        if !self.config.reference_spaces.contains(&ty) {
            return Err(XrError::runtime(
                "xrCreateReferenceSpace",
                ERROR_VALIDATION_FAILURE,
                result_name(ERROR_VALIDATION_FAILURE),
            ));
        }
        let handle = state.handle();
        state.spaces.insert(
            handle,
            SimSpace {
                kind: SpaceKind::Reference(ty),
                offset: pose,
            },
        );
        Ok(SpaceHandle::from_raw(handle))
    }

    fn create_action_space(
        &mut self,
        action: ActionHandle,
        subaction_path: PathHandle,
        pose: Posef,
    ) -> XrResult<SpaceHandle> {
        let mut state = self.lock();
        state.enter("xrCreateActionSpace")?;
        state.require_session("xrCreateActionSpace")?;
        let is_pose = state
            .actions
            .get(&action.into_raw())
            .is_some_and(|action| action.ty == ActionType::Pose);
        let subaction = state.path_names.get(&subaction_path.into_raw()).cloned();
        let (true, Some(subaction)) = (is_pose, subaction) else {
            return Err(XrError::runtime(
                "xrCreateActionSpace",
                ERROR_HANDLE_INVALID,
                result_name(ERROR_HANDLE_INVALID),
            ));
        };
        let handle = state.handle();
        state.spaces.insert(
            handle,
            SimSpace {
                kind: SpaceKind::Action { subaction },
                offset: pose,
            },
        );
        Ok(SpaceHandle::from_raw(handle))
    }

    fn locate_space(
        &self,
        space: SpaceHandle,
        base: SpaceHandle,
        _time: Time,
    ) -> XrResult<SpaceLocation> {
        let mut state = self.lock();
        state.enter("xrLocateSpace")?;
        let (Some((space_pose, space_valid)), Some((base_pose, base_valid))) =
            (state.world_pose(space), state.world_pose(base))
        else {
            return Err(XrError::runtime(
                "xrLocateSpace",
                ERROR_HANDLE_INVALID,
                result_name(ERROR_HANDLE_INVALID),
            ));
        };
        let valid = space_valid && base_valid;
        Ok(SpaceLocation {
            pose: base_pose.inverse().compose(space_pose),
            position_valid: valid,
            orientation_valid: valid,
        })
    }

    fn destroy_space(&mut self, space: SpaceHandle) {
        let mut state = self.lock();
        state.calls.push("xrDestroySpace");
        state.spaces.remove(&space.into_raw());
    }

    fn wait_frame(&mut self) -> XrResult<FrameTiming> {
        let mut state = self.lock();
        state.enter("xrWaitFrame")?;
        if !state.session_running {
            return Err(XrError::runtime(
                "xrWaitFrame",
                ERROR_SESSION_NOT_RUNNING,
                result_name(ERROR_SESSION_NOT_RUNNING),
            ));
        }
        let period = self.config.display_period.as_nanos() as i64;
        state.time += period;
        Ok(FrameTiming {
            predicted_display_time: Time::from_nanos(state.time + period),
            predicted_display_period: self.config.display_period,
            should_render: true,
        })
    }

    fn begin_frame(&mut self) -> XrResult<()> {
        self.lock().enter("xrBeginFrame")
    }

    fn locate_views(
        &self,
        _ty: ViewConfigurationType,
        _time: Time,
        space: SpaceHandle,
    ) -> XrResult<(ViewStateFlags, Vec<View>)> {
        let mut state = self.lock();
        state.enter("xrLocateViews")?;
        let Some((base_pose, _)) = state.world_pose(space) else {
            return Err(XrError::runtime(
                "xrLocateViews",
                ERROR_HANDLE_INVALID,
                result_name(ERROR_HANDLE_INVALID),
            ));
        };
        let head = base_pose.inverse().compose(state.head_pose);
        let views = (0..self.config.view_count)
            .map(|eye| {
                let offset = if eye == 0 { -EYE_HALF_IPD } else { EYE_HALF_IPD };
                View {
                    pose: head.compose(Posef::new(
                        Default::default(),
                        Vector3f::new(offset, 0.0, 0.0),
                    )),
                    fov: Fovf::symmetric(0.8),
                }
            })
            .collect();
        Ok((state.view_flags, views))
    }

    fn end_frame(
        &mut self,
        time: Time,
        blend_mode: EnvironmentBlendMode,
        layers: &LayerList,
    ) -> XrResult<()> {
        let mut state = self.lock();
        state.enter("xrEndFrame")?;
        state.submitted.push(SubmittedFrame {
            display_time: time,
            blend_mode,
            layers: layers.clone(),
        });
        Ok(())
    }

    fn enumerate_swapchain_formats(&self) -> XrResult<Vec<i64>> {
        let mut state = self.lock();
        state.enter("xrEnumerateSwapchainFormats")?;
        state.require_session("xrEnumerateSwapchainFormats")?;
        Ok(self.config.swapchain_formats.clone())
    }

    fn create_swapchain(&mut self, info: &SwapchainCreateInfo) -> XrResult<SwapchainHandle> {
        let mut state = self.lock();
        state.enter("xrCreateSwapchain")?;
        state.require_session("xrCreateSwapchain")?;
        if !self.config.swapchain_formats.contains(&info.format) {
            return Err(XrError::runtime(
                "xrCreateSwapchain",
                ERROR_SWAPCHAIN_FORMAT_UNSUPPORTED,
                result_name(ERROR_SWAPCHAIN_FORMAT_UNSUPPORTED),
            ));
        }
        let images = (0..self.config.swapchain_length)
            .map(|index| match &self.gl {
                Some(gl) => gl.allocate_texture(info.width, info.height, info.array_size),
                None => 1000 + index,
            })
            .collect();
        let handle = state.handle();
        state.swapchains.insert(
            handle,
            SimSwapchain {
                images,
                next: 0,
                acquired: VecDeque::new(),
                last_waited: None,
            },
        );
        Ok(SwapchainHandle::from_raw(handle))
    }

    fn enumerate_swapchain_images(&self, swapchain: SwapchainHandle) -> XrResult<Vec<u32>> {
        let mut state = self.lock();
        state.enter("xrEnumerateSwapchainImages")?;
        state
            .swapchains
            .get(&swapchain.into_raw())
            .map(|swapchain| swapchain.images.clone())
            .ok_or_else(|| {
                XrError::runtime(
                    "xrEnumerateSwapchainImages",
                    ERROR_HANDLE_INVALID,
                    result_name(ERROR_HANDLE_INVALID),
                )
            })
    }

    fn acquire_swapchain_image(&mut self, swapchain: SwapchainHandle) -> XrResult<u32> {
        let mut state = self.lock();
        state.enter("xrAcquireSwapchainImage")?;
        let Some(chain) = state.swapchains.get_mut(&swapchain.into_raw()) else {
            return Err(XrError::runtime(
                "xrAcquireSwapchainImage",
                ERROR_HANDLE_INVALID,
                result_name(ERROR_HANDLE_INVALID),
            ));
        };
        if chain.acquired.len() >= chain.images.len() {
            return Err(XrError::runtime(
                "xrAcquireSwapchainImage",
                ERROR_CALL_ORDER_INVALID,
                result_name(ERROR_CALL_ORDER_INVALID),
            ));
        }
        let index = chain.next as u32;
        chain.next = (chain.next + 1) % chain.images.len();
        chain.acquired.push_back((index, false));
        Ok(index)
    }

    fn wait_swapchain_image(
        &mut self,
        swapchain: SwapchainHandle,
        _timeout: Duration,
    ) -> XrResult<ImageWait> {
        let mut state = self.lock();
        state.enter("xrWaitSwapchainImage")?;
        if state.pending_timeouts > 0 {
            state.pending_timeouts -= 1;
            return Ok(ImageWait::TimedOut);
        }
        let waited = state.swapchains.get_mut(&swapchain.into_raw()).and_then(|chain| {
            let entry = chain.acquired.iter_mut().find(|(_, waited)| !*waited)?;
            entry.1 = true;
            chain.last_waited = Some(entry.0);
            Some(entry.0)
        });
        match waited {
            Some(_) => Ok(ImageWait::Ready),
            None => Err(XrError::runtime(
                "xrWaitSwapchainImage",
                ERROR_CALL_ORDER_INVALID,
                result_name(ERROR_CALL_ORDER_INVALID),
            )),
        }
    }

    fn release_swapchain_image(&mut self, swapchain: SwapchainHandle) -> XrResult<()> {
        let mut state = self.lock();
        state.enter("xrReleaseSwapchainImage")?;
        let released = state
            .swapchains
            .get_mut(&swapchain.into_raw())
            .and_then(|chain| {
                let waited = matches!(chain.acquired.front(), Some((_, true)));
                if waited {
                    chain.acquired.pop_front()
                } else {
                    None
                }
            });
        match released {
            Some(_) => Ok(()),
            None => Err(XrError::runtime(
                "xrReleaseSwapchainImage",
                ERROR_CALL_ORDER_INVALID,
                result_name(ERROR_CALL_ORDER_INVALID),
            )),
        }
    }

    fn destroy_swapchain(&mut self, swapchain: SwapchainHandle) {
        let mut state = self.lock();
        state.calls.push("xrDestroySwapchain");
        if let Some(chain) = state.swapchains.remove(&swapchain.into_raw()) {
            if let Some(gl) = &self.gl {
                for texture in chain.images {
                    gl.release_texture(texture);
                }
            }
        }
    }

    fn string_to_path(&mut self, path: &str) -> XrResult<PathHandle> {
        let mut state = self.lock();
        state.enter("xrStringToPath")?;
        if !path.starts_with('/') {
            return Err(XrError::runtime(
                "xrStringToPath",
                ERROR_VALIDATION_FAILURE,
                result_name(ERROR_VALIDATION_FAILURE),
            ));
        }
        if let Some(existing) = state.paths.get(path) {
            return Ok(PathHandle::from_raw(*existing));
        }
        let handle = state.handle();
        state.paths.insert(path.to_string(), handle);
        state.path_names.insert(handle, path.to_string());
        Ok(PathHandle::from_raw(handle))
    }

    fn create_action_set(
        &mut self,
        name: &str,
        _localized_name: &str,
        _priority: u32,
    ) -> XrResult<ActionSetHandle> {
        let mut state = self.lock();
        state.enter("xrCreateActionSet")?;
        let handle = state.handle();
        state.action_sets.insert(handle, name.to_string());
        Ok(ActionSetHandle::from_raw(handle))
    }

    fn create_action(
        &mut self,
        set: ActionSetHandle,
        name: &str,
        _localized_name: &str,
        ty: ActionType,
        _subaction_paths: &[PathHandle],
    ) -> XrResult<ActionHandle> {
        let mut state = self.lock();
        state.enter("xrCreateAction")?;
        if !state.action_sets.contains_key(&set.into_raw()) {
            return Err(XrError::runtime(
                "xrCreateAction",
                ERROR_HANDLE_INVALID,
                result_name(ERROR_HANDLE_INVALID),
            ));
        }
        let handle = state.handle();
        state.actions.insert(
            handle,
            SimAction {
                name: name.to_string(),
                ty,
            },
        );
        Ok(ActionHandle::from_raw(handle))
    }

    fn suggest_bindings(
        &mut self,
        profile: PathHandle,
        bindings: &[SuggestedBinding],
    ) -> XrResult<()> {
        let mut state = self.lock();
        state.enter("xrSuggestInteractionProfileBindings")?;
        if !state.path_names.contains_key(&profile.into_raw()) {
            return Err(XrError::runtime(
                "xrSuggestInteractionProfileBindings",
                ERROR_VALIDATION_FAILURE,
                result_name(ERROR_VALIDATION_FAILURE),
            ));
        }
        let resolved: Option<Vec<(String, String)>> = bindings
            .iter()
            .map(|binding| {
                let action = state.actions.get(&binding.action.into_raw())?.name.clone();
                let path = state.path_names.get(&binding.path.into_raw())?.clone();
                Some((action, path))
            })
            .collect();
        let Some(resolved) = resolved else {
            return Err(XrError::runtime(
                "xrSuggestInteractionProfileBindings",
                ERROR_HANDLE_INVALID,
                result_name(ERROR_HANDLE_INVALID),
            ));
        };
        state.suggested.extend(resolved);
        Ok(())
    }

    fn attach_action_sets(&mut self, _sets: &[ActionSetHandle]) -> XrResult<()> {
        let mut state = self.lock();
        state.enter("xrAttachSessionActionSets")?;
        state.require_session("xrAttachSessionActionSets")?;
        state.attached = true;
        Ok(())
    }

    fn sync_actions(&mut self, _set: ActionSetHandle) -> XrResult<()> {
        let mut state = self.lock();
        state.enter("xrSyncActions")?;
        if !state.attached {
            return Err(XrError::runtime(
                "xrSyncActions",
                ERROR_ACTIONSET_NOT_ATTACHED,
                result_name(ERROR_ACTIONSET_NOT_ATTACHED),
            ));
        }
        let SimState {
            staged_booleans,
            synced_booleans,
            staged_vectors,
            synced_vectors,
            ..
        } = &mut *state;
        for synced in synced_booleans.values_mut() {
            synced.changed_since_last_sync = false;
        }
        for (key, pressed) in staged_booleans.iter() {
            let synced = synced_booleans.entry(key.clone()).or_default();
            synced.changed_since_last_sync = synced.current != *pressed;
            synced.current = *pressed;
            synced.is_active = true;
        }
        for synced in synced_vectors.values_mut() {
            synced.changed_since_last_sync = false;
        }
        for (key, value) in staged_vectors.iter() {
            let synced = synced_vectors.entry(key.clone()).or_default();
            synced.changed_since_last_sync = synced.current != *value;
            synced.current = *value;
            synced.is_active = true;
        }
        Ok(())
    }

    fn action_state_boolean(
        &self,
        action: ActionHandle,
        subaction_path: Option<PathHandle>,
    ) -> XrResult<ActionStateBoolean> {
        let mut state = self.lock();
        state.enter("xrGetActionStateBoolean")?;
        let key = state.key(action, subaction_path).ok_or_else(|| {
            XrError::runtime(
                "xrGetActionStateBoolean",
                ERROR_HANDLE_INVALID,
                result_name(ERROR_HANDLE_INVALID),
            )
        })?;
        Ok(state.synced_booleans.get(&key).copied().unwrap_or_default())
    }

    fn action_state_vector2f(
        &self,
        action: ActionHandle,
        subaction_path: Option<PathHandle>,
    ) -> XrResult<ActionStateVector2f> {
        let mut state = self.lock();
        state.enter("xrGetActionStateVector2f")?;
        let key = state.key(action, subaction_path).ok_or_else(|| {
            XrError::runtime(
                "xrGetActionStateVector2f",
                ERROR_HANDLE_INVALID,
                result_name(ERROR_HANDLE_INVALID),
            )
        })?;
        Ok(state.synced_vectors.get(&key).copied().unwrap_or_default())
    }

    fn action_state_pose_active(
        &self,
        action: ActionHandle,
        subaction_path: Option<PathHandle>,
    ) -> XrResult<bool> {
        let mut state = self.lock();
        state.enter("xrGetActionStatePose")?;
        let Some((_, Some(path))) = state.key(action, subaction_path) else {
            return Ok(false);
        };
        Ok(state.attached && state.hand_active.get(&path).copied().unwrap_or(true))
    }

    fn destroy_action_set(&mut self, set: ActionSetHandle) {
        let mut state = self.lock();
        state.calls.push("xrDestroyActionSet");
        state.action_sets.remove(&set.into_raw());
        state.actions.clear();
        state.attached = false;
    }

    fn set_performance_level(&mut self, domain: PerfDomain, level: PerfLevel) -> XrResult<()> {
        let mut state = self.lock();
        state.enter("xrPerfSettingsSetPerformanceLevelEXT")?;
        if !self.has_entry_point_locked(&state, PERF_SETTINGS_ENTRY_POINT) {
            return Err(XrError::runtime(
                "xrPerfSettingsSetPerformanceLevelEXT",
                ERROR_FUNCTION_UNSUPPORTED,
                result_name(ERROR_FUNCTION_UNSUPPORTED),
            ));
        }
        state.perf_levels.push((domain, level));
        Ok(())
    }

    fn set_application_thread(&mut self, kind: ThreadKind) -> XrResult<()> {
        let mut state = self.lock();
        state.enter("xrSetAndroidApplicationThreadKHR")?;
        if !self.has_entry_point_locked(&state, THREAD_SETTINGS_ENTRY_POINT) {
            return Err(XrError::runtime(
                "xrSetAndroidApplicationThreadKHR",
                ERROR_FUNCTION_UNSUPPORTED,
                result_name(ERROR_FUNCTION_UNSUPPORTED),
            ));
        }
        state.app_threads.push(kind);
        Ok(())
    }
}

impl SimulatedRuntime {
    fn has_entry_point_locked(&self, state: &SimState, name: &str) -> bool {
        state.instance && self.config.entry_points.iter().any(|entry| entry == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failures_are_injected_per_call() {
        let mut runtime = SimulatedRuntime::default();
        runtime.fail_call("xrGetSystem", ERROR_RUNTIME_FAILURE);
        runtime.start_headless_session().unwrap_err();

        assert!(runtime.is_instance_alive());
        assert!(!runtime.is_session_alive());
        assert_eq!(runtime.calls(), vec!["xrCreateInstance", "xrGetSystem"]);
    }

    #[test]
    fn boolean_changes_are_reported_once_per_sync() {
        let mut runtime = SimulatedRuntime::default();
        runtime.start_headless_session().expect("session");
        let set = runtime.create_action_set("set", "Set", 0).expect("set");
        let action = runtime
            .create_action(set, "menu", "Menu", ActionType::Boolean, &[])
            .expect("action");
        runtime.attach_action_sets(&[set]).expect("attach");

        runtime.set_boolean("menu", None, true);
        runtime.sync_actions(set).expect("sync");
        let first = runtime.action_state_boolean(action, None).expect("state");
        runtime.sync_actions(set).expect("sync");
        let second = runtime.action_state_boolean(action, None).expect("state");

        assert!(first.current && first.changed_since_last_sync);
        assert!(second.current && !second.changed_since_last_sync);
    }

    #[test]
    fn located_views_straddle_the_head() {
        let mut runtime = SimulatedRuntime::default();
        runtime.start_headless_session().expect("session");
        let local = runtime
            .create_reference_space(ReferenceSpaceType::Local, Posef::IDENTITY)
            .expect("local");

        let (flags, views) = runtime
            .locate_views(
                ViewConfigurationType::PrimaryStereo,
                Time::from_nanos(0),
                local,
            )
            .expect("views");

        assert!(flags.orientation_valid && flags.position_valid);
        assert_eq!(views.len(), 2);
        assert!(views[0].pose.position.x < 0.0 && views[1].pose.position.x > 0.0);
        assert!((views[0].pose.position.y - 1.6).abs() < 1e-5);
    }

    #[test]
    fn release_requires_a_completed_wait() {
        let mut runtime = SimulatedRuntime::default();
        runtime.start_headless_session().expect("session");
        let swapchain = runtime
            .create_swapchain(&SwapchainCreateInfo {
                format: GL_SRGB8_ALPHA8,
                width: 8,
                height: 8,
                sample_count: 1,
                array_size: 1,
                face_count: 1,
                mip_count: 1,
                color_attachment: true,
                sampled: true,
            })
            .expect("swapchain");

        runtime.acquire_swapchain_image(swapchain).expect("acquire");
        let err = runtime.release_swapchain_image(swapchain).unwrap_err();
        assert_eq!(err.code(), Some(ERROR_CALL_ORDER_INVALID));
    }
}
