use crate::render::context::GraphicsBinding;
use crate::vr::{Fovf, Posef, SpaceLocation, Time, Vector2f, View, XrResult};
use std::time::Duration;

macro_rules! runtime_handle {
    ($($name:ident),* $(,)?) => {
        $(
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
            pub struct $name(u64);

            impl $name {
                pub const fn from_raw(raw: u64) -> Self {
                    Self(raw)
                }

                pub const fn into_raw(self) -> u64 {
                    self.0
                }
            }
        )*
    };
}

runtime_handle!(
    SystemId,
    SpaceHandle,
    SwapchainHandle,
    ActionSetHandle,
    ActionHandle,
    PathHandle
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SessionState {
    Unknown,
    Idle,
    Ready,
    Synchronized,
    Visible,
    Focused,
    Stopping,
    LossPending,
    Exiting,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Unknown => "UNKNOWN",
            SessionState::Idle => "IDLE",
            SessionState::Ready => "READY",
            SessionState::Synchronized => "SYNCHRONIZED",
            SessionState::Visible => "VISIBLE",
            SessionState::Focused => "FOCUSED",
            SessionState::Stopping => "STOPPING",
            SessionState::LossPending => "LOSS_PENDING",
            SessionState::Exiting => "EXITING",
        }
    }

    /// States in which `xrEndSession` is legal.
    pub fn is_running(self) -> bool {
        matches!(
            self,
            SessionState::Ready
                | SessionState::Synchronized
                | SessionState::Visible
                | SessionState::Focused
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PerfDomain {
    Cpu,
    Gpu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PerfLevel {
    PowerSavings,
    SustainedLow,
    SustainedHigh,
    Boost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadKind {
    ApplicationMain,
    ApplicationWorker,
    RendererMain,
    RendererWorker,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeEvent {
    EventsLost { lost: u32 },
    InstanceLossPending { loss_time: Time },
    SessionStateChanged { state: SessionState, time: Time },
    InteractionProfileChanged,
    PerfSettingsChanged {
        domain: PerfDomain,
        from: u32,
        to: u32,
    },
    ReferenceSpaceChangePending,
    Unknown(i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViewConfigurationType {
    PrimaryMono,
    PrimaryStereo,
    Other(i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReferenceSpaceType {
    View,
    Local,
    Stage,
    Other(i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvironmentBlendMode {
    Opaque,
    Additive,
    AlphaBlend,
}

#[derive(Debug, Clone)]
pub struct ApplicationInfo {
    pub application_name: String,
    pub application_version: u32,
    pub engine_name: String,
    pub engine_version: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceProperties {
    pub runtime_name: String,
    pub runtime_version: (u16, u16, u32),
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SystemProperties {
    pub system_name: String,
    pub vendor_id: u32,
    pub max_layer_count: u32,
    pub max_swapchain_width: u32,
    pub max_swapchain_height: u32,
    pub orientation_tracking: bool,
    pub position_tracking: bool,
}

/// Supported graphics API range, encoded as `major * 100 + minor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GraphicsRequirements {
    pub min_api_version: u32,
    pub max_api_version: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ViewConfigurationView {
    pub recommended_width: u32,
    pub max_width: u32,
    pub recommended_height: u32,
    pub max_height: u32,
    pub recommended_samples: u32,
    pub max_samples: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewConfigurationProperties {
    pub ty: ViewConfigurationType,
    pub fov_mutable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ViewStateFlags {
    pub orientation_valid: bool,
    pub position_valid: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameTiming {
    pub predicted_display_time: Time,
    pub predicted_display_period: Duration,
    pub should_render: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainCreateInfo {
    pub format: i64,
    pub width: u32,
    pub height: u32,
    pub sample_count: u32,
    pub array_size: u32,
    pub face_count: u32,
    pub mip_count: u32,
    pub color_attachment: bool,
    pub sampled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageWait {
    Ready,
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect2Di {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainSubImage {
    pub swapchain: SwapchainHandle,
    pub rect: Rect2Di,
    pub array_index: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProjectionView {
    pub pose: Posef,
    pub fov: Fovf,
    pub sub_image: SwapchainSubImage,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProjectionLayer {
    pub space: SpaceHandle,
    pub views: Vec<ProjectionView>,
}

/// Closed set of composition layers this runtime submits.
#[derive(Debug, Clone, PartialEq)]
pub enum CompositionLayer {
    Projection(ProjectionLayer),
}

/// A layer list that always holds at least one layer.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerList(Vec<CompositionLayer>);

impl LayerList {
    pub fn new(first: CompositionLayer) -> Self {
        Self(vec![first])
    }

    pub fn push(&mut self, layer: CompositionLayer) {
        self.0.push(layer);
    }

    pub fn as_slice(&self) -> &[CompositionLayer] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionType {
    Boolean,
    Vector2f,
    Pose,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ActionStateBoolean {
    pub current: bool,
    pub changed_since_last_sync: bool,
    pub is_active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ActionStateVector2f {
    pub current: Vector2f,
    pub changed_since_last_sync: bool,
    pub is_active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuggestedBinding {
    pub action: ActionHandle,
    pub path: PathHandle,
}

/// Host-side pointers the loader needs on Android, carried as integers so they cross threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HostContext {
    pub java_vm: usize,
    pub activity: usize,
}

/// The tracking runtime as seen by the session: one method per runtime entry point this crate
/// drives. Implementations own every runtime handle they hand out.
pub trait XrRuntime: Send {
    fn label(&self) -> &'static str;

    fn initialize_loader(&mut self, host: &HostContext) -> XrResult<()>;
    fn enumerate_extensions(&mut self) -> XrResult<Vec<String>>;
    fn create_instance(&mut self, app: &ApplicationInfo, extensions: &[&str]) -> XrResult<()>;
    fn instance_properties(&self) -> XrResult<InstanceProperties>;
    /// Whether an extension entry point resolved on the live instance.
    fn has_entry_point(&self, name: &str) -> bool;
    fn destroy_instance(&mut self);

    fn system(&mut self) -> XrResult<SystemId>;
    fn system_properties(&self, system: SystemId) -> XrResult<SystemProperties>;
    fn graphics_requirements(&self, system: SystemId) -> XrResult<GraphicsRequirements>;

    fn create_session(&mut self, system: SystemId, binding: &GraphicsBinding) -> XrResult<()>;
    fn begin_session(&mut self, view_configuration: ViewConfigurationType) -> XrResult<()>;
    fn end_session(&mut self) -> XrResult<()>;
    fn destroy_session(&mut self);
    fn poll_event(&mut self) -> XrResult<Option<RuntimeEvent>>;

    fn enumerate_view_configurations(
        &self,
        system: SystemId,
    ) -> XrResult<Vec<ViewConfigurationType>>;
    fn view_configuration_properties(
        &self,
        system: SystemId,
        ty: ViewConfigurationType,
    ) -> XrResult<ViewConfigurationProperties>;
    fn enumerate_view_configuration_views(
        &self,
        system: SystemId,
        ty: ViewConfigurationType,
    ) -> XrResult<Vec<ViewConfigurationView>>;

    fn enumerate_reference_spaces(&self) -> XrResult<Vec<ReferenceSpaceType>>;
    fn create_reference_space(
        &mut self,
        ty: ReferenceSpaceType,
        pose: Posef,
    ) -> XrResult<SpaceHandle>;
    fn create_action_space(
        &mut self,
        action: ActionHandle,
        subaction_path: PathHandle,
        pose: Posef,
    ) -> XrResult<SpaceHandle>;
    fn locate_space(
        &self,
        space: SpaceHandle,
        base: SpaceHandle,
        time: Time,
    ) -> XrResult<SpaceLocation>;
    fn destroy_space(&mut self, space: SpaceHandle);

    fn wait_frame(&mut self) -> XrResult<FrameTiming>;
    fn begin_frame(&mut self) -> XrResult<()>;
    fn locate_views(
        &self,
        ty: ViewConfigurationType,
        time: Time,
        space: SpaceHandle,
    ) -> XrResult<(ViewStateFlags, Vec<View>)>;
    fn end_frame(
        &mut self,
        time: Time,
        blend_mode: EnvironmentBlendMode,
        layers: &LayerList,
    ) -> XrResult<()>;

    fn enumerate_swapchain_formats(&self) -> XrResult<Vec<i64>>;
    fn create_swapchain(&mut self, info: &SwapchainCreateInfo) -> XrResult<SwapchainHandle>;
    /// GL texture names backing each swapchain image.
    fn enumerate_swapchain_images(&self, swapchain: SwapchainHandle) -> XrResult<Vec<u32>>;
    fn acquire_swapchain_image(&mut self, swapchain: SwapchainHandle) -> XrResult<u32>;
    fn wait_swapchain_image(
        &mut self,
        swapchain: SwapchainHandle,
        timeout: Duration,
    ) -> XrResult<ImageWait>;
    fn release_swapchain_image(&mut self, swapchain: SwapchainHandle) -> XrResult<()>;
    fn destroy_swapchain(&mut self, swapchain: SwapchainHandle);

    fn string_to_path(&mut self, path: &str) -> XrResult<PathHandle>;
    fn create_action_set(
        &mut self,
        name: &str,
        localized_name: &str,
        priority: u32,
    ) -> XrResult<ActionSetHandle>;
    fn create_action(
        &mut self,
        set: ActionSetHandle,
        name: &str,
        localized_name: &str,
        ty: ActionType,
        subaction_paths: &[PathHandle],
    ) -> XrResult<ActionHandle>;
    fn suggest_bindings(
        &mut self,
        profile: PathHandle,
        bindings: &[SuggestedBinding],
    ) -> XrResult<()>;
    fn attach_action_sets(&mut self, sets: &[ActionSetHandle]) -> XrResult<()>;
    fn sync_actions(&mut self, set: ActionSetHandle) -> XrResult<()>;
    fn action_state_boolean(
        &self,
        action: ActionHandle,
        subaction_path: Option<PathHandle>,
    ) -> XrResult<ActionStateBoolean>;
    fn action_state_vector2f(
        &self,
        action: ActionHandle,
        subaction_path: Option<PathHandle>,
    ) -> XrResult<ActionStateVector2f>;
    fn action_state_pose_active(
        &self,
        action: ActionHandle,
        subaction_path: Option<PathHandle>,
    ) -> XrResult<bool>;
    fn destroy_action_set(&mut self, set: ActionSetHandle);

    fn set_performance_level(&mut self, domain: PerfDomain, level: PerfLevel) -> XrResult<()>;
    /// Registers the calling thread with the runtime's scheduler.
    fn set_application_thread(&mut self, kind: ThreadKind) -> XrResult<()>;
}
