//! `XrRuntime` over the system OpenXR loader with a GL ES graphics binding. Runtime objects are
//! owned here and handed to the session as opaque handles.

use crate::render::context::{GraphicsBinding, GraphicsError};
use crate::vr::capabilities::{PERF_SETTINGS_ENTRY_POINT, THREAD_SETTINGS_ENTRY_POINT};
use crate::vr::runtime::{
    ActionHandle, ActionSetHandle, ActionStateBoolean, ActionStateVector2f, ActionType,
    ApplicationInfo, CompositionLayer, EnvironmentBlendMode, FrameTiming, GraphicsRequirements,
    HostContext, ImageWait, InstanceProperties, LayerList, PathHandle, PerfDomain, PerfLevel,
    ReferenceSpaceType, RuntimeEvent, SessionState, SpaceHandle, SuggestedBinding,
    SwapchainCreateInfo, SwapchainHandle, SystemId, SystemProperties, ThreadKind,
    ViewConfigurationProperties, ViewConfigurationType, ViewConfigurationView, ViewStateFlags,
    XrRuntime,
};
use crate::vr::{
    Fovf, Posef, Quaternionf, SpaceLocation, Time, Vector2f, Vector3f, View, XrError, XrResult,
};
use openxr as xr;
use std::collections::HashMap;
use std::time::Duration;

unsafe extern "C" {
    fn gettid() -> i32;
}

enum ActionSlot {
    Boolean(xr::Action<bool>),
    Vector2f(xr::Action<xr::Vector2f>),
    Pose(xr::Action<xr::Posef>),
}

struct LiveSession {
    session: xr::Session<xr::OpenGlEs>,
    frame_waiter: xr::FrameWaiter,
    frame_stream: xr::FrameStream<xr::OpenGlEs>,
}

#[derive(Default)]
pub struct OpenXrRuntime {
    entry: Option<xr::Entry>,
    instance: Option<xr::Instance>,
    session: Option<LiveSession>,
    next_handle: u64,
    spaces: HashMap<u64, xr::Space>,
    swapchains: HashMap<u64, xr::Swapchain<xr::OpenGlEs>>,
    action_sets: HashMap<u64, xr::ActionSet>,
    actions: HashMap<u64, ActionSlot>,
}

fn failed(call: &'static str) -> impl Fn(xr::sys::Result) -> XrError {
    move |code| XrError::runtime(call, code.into_raw(), format!("XR_{code:?}"))
}

fn extension_flags(set: &mut xr::ExtensionSet) -> [(&'static str, &mut bool); 9] {
    [
        ("XR_KHR_opengl_es_enable", &mut set.khr_opengl_es_enable),
        ("XR_EXT_performance_settings", &mut set.ext_performance_settings),
        ("XR_KHR_android_thread_settings", &mut set.khr_android_thread_settings),
        ("XR_FB_passthrough", &mut set.fb_passthrough),
        ("XR_META_performance_metrics", &mut set.meta_performance_metrics),
        (
            "XR_FB_composition_layer_settings",
            &mut set.fb_composition_layer_settings,
        ),
        ("XR_EXT_hand_tracking", &mut set.ext_hand_tracking),
        ("XR_FB_touch_controller_pro", &mut set.fb_touch_controller_pro),
        ("XR_KHR_visibility_mask", &mut set.khr_visibility_mask),
    ]
}

fn to_xr_pose(pose: Posef) -> xr::Posef {
    xr::Posef {
        orientation: xr::Quaternionf {
            x: pose.orientation.x,
            y: pose.orientation.y,
            z: pose.orientation.z,
            w: pose.orientation.w,
        },
        position: xr::Vector3f {
            x: pose.position.x,
            y: pose.position.y,
            z: pose.position.z,
        },
    }
}

fn from_xr_pose(pose: xr::Posef) -> Posef {
    Posef::new(
        Quaternionf {
            x: pose.orientation.x,
            y: pose.orientation.y,
            z: pose.orientation.z,
            w: pose.orientation.w,
        },
        Vector3f::new(pose.position.x, pose.position.y, pose.position.z),
    )
}

fn to_xr_fov(fov: Fovf) -> xr::Fovf {
    xr::Fovf {
        angle_left: fov.angle_left,
        angle_right: fov.angle_right,
        angle_up: fov.angle_up,
        angle_down: fov.angle_down,
    }
}

fn from_xr_fov(fov: xr::Fovf) -> Fovf {
    Fovf {
        angle_left: fov.angle_left,
        angle_right: fov.angle_right,
        angle_up: fov.angle_up,
        angle_down: fov.angle_down,
    }
}

fn to_xr_time(time: Time) -> xr::Time {
    xr::Time::from_nanos(time.as_nanos())
}

fn to_xr_view_configuration(ty: ViewConfigurationType) -> xr::ViewConfigurationType {
    match ty {
        ViewConfigurationType::PrimaryMono => xr::ViewConfigurationType::PRIMARY_MONO,
        ViewConfigurationType::PrimaryStereo => xr::ViewConfigurationType::PRIMARY_STEREO,
        ViewConfigurationType::Other(raw) => xr::ViewConfigurationType::from_raw(raw),
    }
}

fn from_xr_view_configuration(ty: xr::ViewConfigurationType) -> ViewConfigurationType {
    match ty {
        xr::ViewConfigurationType::PRIMARY_MONO => ViewConfigurationType::PrimaryMono,
        xr::ViewConfigurationType::PRIMARY_STEREO => ViewConfigurationType::PrimaryStereo,
        other => ViewConfigurationType::Other(other.into_raw()),
    }
}

fn to_xr_reference_space(ty: ReferenceSpaceType) -> xr::ReferenceSpaceType {
    match ty {
        ReferenceSpaceType::View => xr::ReferenceSpaceType::VIEW,
        ReferenceSpaceType::Local => xr::ReferenceSpaceType::LOCAL,
        ReferenceSpaceType::Stage => xr::ReferenceSpaceType::STAGE,
        ReferenceSpaceType::Other(raw) => xr::ReferenceSpaceType::from_raw(raw),
    }
}

fn from_xr_reference_space(ty: xr::ReferenceSpaceType) -> ReferenceSpaceType {
    match ty {
        xr::ReferenceSpaceType::VIEW => ReferenceSpaceType::View,
        xr::ReferenceSpaceType::LOCAL => ReferenceSpaceType::Local,
        xr::ReferenceSpaceType::STAGE => ReferenceSpaceType::Stage,
        other => ReferenceSpaceType::Other(other.into_raw()),
    }
}

fn from_xr_session_state(state: xr::SessionState) -> SessionState {
    match state {
        xr::SessionState::IDLE => SessionState::Idle,
        xr::SessionState::READY => SessionState::Ready,
        xr::SessionState::SYNCHRONIZED => SessionState::Synchronized,
        xr::SessionState::VISIBLE => SessionState::Visible,
        xr::SessionState::FOCUSED => SessionState::Focused,
        xr::SessionState::STOPPING => SessionState::Stopping,
        xr::SessionState::LOSS_PENDING => SessionState::LossPending,
        xr::SessionState::EXITING => SessionState::Exiting,
        _ => SessionState::Unknown,
    }
}

fn location_of(location: xr::SpaceLocation) -> SpaceLocation {
    SpaceLocation {
        pose: from_xr_pose(location.pose),
        position_valid: location
            .location_flags
            .contains(xr::SpaceLocationFlags::POSITION_VALID),
        orientation_valid: location
            .location_flags
            .contains(xr::SpaceLocationFlags::ORIENTATION_VALID),
    }
}

impl OpenXrRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate_handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn entry(&self, call: &'static str) -> XrResult<&xr::Entry> {
        self.entry.as_ref().ok_or(XrError::Lifecycle(call))
    }

    fn instance(&self, call: &'static str) -> XrResult<&xr::Instance> {
        self.instance.as_ref().ok_or(XrError::Lifecycle(call))
    }

    fn live(&self, call: &'static str) -> XrResult<&LiveSession> {
        self.session.as_ref().ok_or(XrError::Lifecycle(call))
    }

    fn space(&self, call: &'static str, space: SpaceHandle) -> XrResult<&xr::Space> {
        self.spaces
            .get(&space.into_raw())
            .ok_or(XrError::Lifecycle(call))
    }

    fn swapchain(
        &mut self,
        call: &'static str,
        swapchain: SwapchainHandle,
    ) -> XrResult<&mut xr::Swapchain<xr::OpenGlEs>> {
        self.swapchains
            .get_mut(&swapchain.into_raw())
            .ok_or(XrError::Lifecycle(call))
    }

    fn action(&self, call: &'static str, action: ActionHandle) -> XrResult<&ActionSlot> {
        self.actions
            .get(&action.into_raw())
            .ok_or(XrError::Lifecycle(call))
    }
}

fn subaction(path: Option<PathHandle>) -> xr::Path {
    path.map_or(xr::Path::NULL, |path| xr::Path::from_raw(path.into_raw()))
}

impl XrRuntime for OpenXrRuntime {
    fn label(&self) -> &'static str {
        "OpenXR"
    }

    fn initialize_loader(&mut self, host: &HostContext) -> XrResult<()> {
        // SAFETY: loads the platform loader library; no OpenXR calls are in flight yet.
        let entry = unsafe { xr::Entry::load() }.map_err(|err| {
            log::error!("[xr] failed to load OpenXR loader: {err}");
            XrError::runtime("xrInitializeLoaderKHR", -1, err.to_string())
        })?;
        if host.java_vm == 0 || host.activity == 0 {
            log::warn!("[xr] host context is incomplete, relying on the registered NDK context");
        }
        entry
            .initialize_android_loader()
            .map_err(failed("xrInitializeLoaderKHR"))?;
        self.entry = Some(entry);
        Ok(())
    }

    fn enumerate_extensions(&mut self) -> XrResult<Vec<String>> {
        let mut available = self
            .entry("xrEnumerateInstanceExtensionProperties")?
            .enumerate_extensions()
            .map_err(failed("xrEnumerateInstanceExtensionProperties"))?;
        let mut names: Vec<String> = extension_flags(&mut available)
            .into_iter()
            .filter(|(_, offered)| **offered)
            .map(|(name, _)| name.to_string())
            .collect();
        names.append(&mut available.other);
        Ok(names)
    }

    fn create_instance(&mut self, app: &ApplicationInfo, extensions: &[&str]) -> XrResult<()> {
        let mut enabled = xr::ExtensionSet::default();
        let mut other = Vec::new();
        let mut flags = extension_flags(&mut enabled);
        for name in extensions {
            match flags.iter_mut().find(|(known, _)| *known == *name) {
                Some((_, flag)) => **flag = true,
                None => other.push((*name).to_string()),
            }
        }
        enabled.other = other;
        let info = xr::ApplicationInfo {
            application_name: &app.application_name,
            application_version: app.application_version,
            engine_name: &app.engine_name,
            engine_version: app.engine_version,
        };
        let instance = self
            .entry("xrCreateInstance")?
            .create_instance(&info, &enabled, &[])
            .map_err(failed("xrCreateInstance"))?;
        self.instance = Some(instance);
        Ok(())
    }

    fn instance_properties(&self) -> XrResult<InstanceProperties> {
        let properties = self
            .instance("xrGetInstanceProperties")?
            .properties()
            .map_err(failed("xrGetInstanceProperties"))?;
        let version = properties.runtime_version;
        Ok(InstanceProperties {
            runtime_name: properties.runtime_name,
            runtime_version: (version.major(), version.minor(), version.patch()),
        })
    }

    fn has_entry_point(&self, name: &str) -> bool {
        let Some(instance) = &self.instance else {
            return false;
        };
        match name {
            PERF_SETTINGS_ENTRY_POINT => instance.exts().ext_performance_settings.is_some(),
            THREAD_SETTINGS_ENTRY_POINT => instance.exts().khr_android_thread_settings.is_some(),
            _ => false,
        }
    }

    fn destroy_instance(&mut self) {
        self.actions.clear();
        self.action_sets.clear();
        self.spaces.clear();
        self.swapchains.clear();
        self.session = None;
        self.instance = None;
    }

    fn system(&mut self) -> XrResult<SystemId> {
        let system = self
            .instance("xrGetSystem")?
            .system(xr::FormFactor::HEAD_MOUNTED_DISPLAY)
            .map_err(failed("xrGetSystem"))?;
        Ok(SystemId::from_raw(system.into_raw()))
    }

    fn system_properties(&self, system: SystemId) -> XrResult<SystemProperties> {
        let properties = self
            .instance("xrGetSystemProperties")?
            .system_properties(xr::SystemId::from_raw(system.into_raw()))
            .map_err(failed("xrGetSystemProperties"))?;
        Ok(SystemProperties {
            system_name: properties.system_name,
            vendor_id: properties.vendor_id,
            max_layer_count: properties.graphics_properties.max_layer_count,
            max_swapchain_width: properties.graphics_properties.max_swapchain_image_width,
            max_swapchain_height: properties.graphics_properties.max_swapchain_image_height,
            orientation_tracking: properties.tracking_properties.orientation_tracking,
            position_tracking: properties.tracking_properties.position_tracking,
        })
    }

    fn graphics_requirements(&self, system: SystemId) -> XrResult<GraphicsRequirements> {
        let requirements = self
            .instance("xrGetOpenGLESGraphicsRequirementsKHR")?
            .graphics_requirements::<xr::OpenGlEs>(xr::SystemId::from_raw(system.into_raw()))
            .map_err(failed("xrGetOpenGLESGraphicsRequirementsKHR"))?;
        let packed = |version: xr::Version| u32::from(version.major()) * 100 + u32::from(version.minor());
        Ok(GraphicsRequirements {
            min_api_version: packed(requirements.min_api_version_supported),
            max_api_version: packed(requirements.max_api_version_supported),
        })
    }

    fn create_session(&mut self, system: SystemId, binding: &GraphicsBinding) -> XrResult<()> {
        let GraphicsBinding::Egl {
            display,
            config,
            context,
        } = *binding
        else {
            return Err(XrError::Graphics(GraphicsError::Backend(
                "OpenXR sessions need an EGL binding".to_string(),
            )));
        };
        let info = xr::opengles::SessionCreateInfo::Android {
            display: display as *mut _,
            config: config as *mut _,
            context: context as *mut _,
        };
        // SAFETY: the binding comes from the live EGL context owned by the render thread, which
        // outlives the session.
        let (session, frame_waiter, frame_stream) = unsafe {
            self.instance("xrCreateSession")?
                .create_session::<xr::OpenGlEs>(xr::SystemId::from_raw(system.into_raw()), &info)
        }
        .map_err(failed("xrCreateSession"))?;
        self.session = Some(LiveSession {
            session,
            frame_waiter,
            frame_stream,
        });
        Ok(())
    }

    fn begin_session(&mut self, view_configuration: ViewConfigurationType) -> XrResult<()> {
        self.live("xrBeginSession")?
            .session
            .begin(to_xr_view_configuration(view_configuration))
            .map_err(failed("xrBeginSession"))?;
        Ok(())
    }

    fn end_session(&mut self) -> XrResult<()> {
        self.live("xrEndSession")?
            .session
            .end()
            .map_err(failed("xrEndSession"))?;
        Ok(())
    }

    fn destroy_session(&mut self) {
        self.swapchains.clear();
        self.session = None;
    }

    fn poll_event(&mut self) -> XrResult<Option<RuntimeEvent>> {
        let instance = self.instance("xrPollEvent")?;
        let mut buffer = xr::EventDataBuffer::new();
        loop {
            let Some(event) = instance
                .poll_event(&mut buffer)
                .map_err(failed("xrPollEvent"))?
            else {
                return Ok(None);
            };
            let event = match event {
                xr::Event::EventsLost(e) => RuntimeEvent::EventsLost {
                    lost: e.lost_event_count(),
                },
                xr::Event::InstanceLossPending(e) => RuntimeEvent::InstanceLossPending {
                    loss_time: Time::from_nanos(e.loss_time().as_nanos()),
                },
                xr::Event::SessionStateChanged(e) => RuntimeEvent::SessionStateChanged {
                    state: from_xr_session_state(e.state()),
                    time: Time::from_nanos(e.time().as_nanos()),
                },
                xr::Event::InteractionProfileChanged(_) => RuntimeEvent::InteractionProfileChanged,
                xr::Event::ReferenceSpaceChangePending(_) => {
                    RuntimeEvent::ReferenceSpaceChangePending
                }
                xr::Event::PerfSettingsEXT(e) => RuntimeEvent::PerfSettingsChanged {
                    domain: if e.domain() == xr::PerfSettingsDomainEXT::GPU {
                        PerfDomain::Gpu
                    } else {
                        PerfDomain::Cpu
                    },
                    from: e.from_level().into_raw() as u32,
                    to: e.to_level().into_raw() as u32,
                },
                _ => continue,
            };
            return Ok(Some(event));
        }
    }

    fn enumerate_view_configurations(
        &self,
        system: SystemId,
    ) -> XrResult<Vec<ViewConfigurationType>> {
        let types = self
            .instance("xrEnumerateViewConfigurations")?
            .enumerate_view_configurations(xr::SystemId::from_raw(system.into_raw()))
            .map_err(failed("xrEnumerateViewConfigurations"))?;
        Ok(types.into_iter().map(from_xr_view_configuration).collect())
    }

    fn view_configuration_properties(
        &self,
        system: SystemId,
        ty: ViewConfigurationType,
    ) -> XrResult<ViewConfigurationProperties> {
        let properties = self
            .instance("xrGetViewConfigurationProperties")?
            .view_configuration_properties(
                xr::SystemId::from_raw(system.into_raw()),
                to_xr_view_configuration(ty),
            )
            .map_err(failed("xrGetViewConfigurationProperties"))?;
        Ok(ViewConfigurationProperties {
            ty: from_xr_view_configuration(properties.view_configuration_type),
            fov_mutable: properties.fov_mutable,
        })
    }

    fn enumerate_view_configuration_views(
        &self,
        system: SystemId,
        ty: ViewConfigurationType,
    ) -> XrResult<Vec<ViewConfigurationView>> {
        let views = self
            .instance("xrEnumerateViewConfigurationViews")?
            .enumerate_view_configuration_views(
                xr::SystemId::from_raw(system.into_raw()),
                to_xr_view_configuration(ty),
            )
            .map_err(failed("xrEnumerateViewConfigurationViews"))?;
        Ok(views
            .into_iter()
            .map(|view| ViewConfigurationView {
                recommended_width: view.recommended_image_rect_width,
                max_width: view.max_image_rect_width,
                recommended_height: view.recommended_image_rect_height,
                max_height: view.max_image_rect_height,
                recommended_samples: view.recommended_swapchain_sample_count,
                max_samples: view.max_swapchain_sample_count,
            })
            .collect())
    }

    fn enumerate_reference_spaces(&self) -> XrResult<Vec<ReferenceSpaceType>> {
        let spaces = self
            .live("xrEnumerateReferenceSpaces")?
            .session
            .enumerate_reference_spaces()
            .map_err(failed("xrEnumerateReferenceSpaces"))?;
        Ok(spaces.into_iter().map(from_xr_reference_space).collect())
    }

    fn create_reference_space(
        &mut self,
        ty: ReferenceSpaceType,
        pose: Posef,
    ) -> XrResult<SpaceHandle> {
        let space = self
            .live("xrCreateReferenceSpace")?
            .session
            .create_reference_space(to_xr_reference_space(ty), to_xr_pose(pose))
            .map_err(failed("xrCreateReferenceSpace"))?;
        let handle = self.allocate_handle();
        self.spaces.insert(handle, space);
        Ok(SpaceHandle::from_raw(handle))
    }

    fn create_action_space(
        &mut self,
        action: ActionHandle,
        subaction_path: PathHandle,
        pose: Posef,
    ) -> XrResult<SpaceHandle> {
        let session = self.live("xrCreateActionSpace")?.session.clone();
        let ActionSlot::Pose(action) = self.action("xrCreateActionSpace", action)? else {
            return Err(XrError::Lifecycle("xrCreateActionSpace"));
        };
        let space = action
            .create_space(
                session,
                xr::Path::from_raw(subaction_path.into_raw()),
                to_xr_pose(pose),
            )
            .map_err(failed("xrCreateActionSpace"))?;
        let handle = self.allocate_handle();
        self.spaces.insert(handle, space);
        Ok(SpaceHandle::from_raw(handle))
    }

    fn locate_space(
        &self,
        space: SpaceHandle,
        base: SpaceHandle,
        time: Time,
    ) -> XrResult<SpaceLocation> {
        let location = self
            .space("xrLocateSpace", space)?
            .locate(self.space("xrLocateSpace", base)?, to_xr_time(time))
            .map_err(failed("xrLocateSpace"))?;
        Ok(location_of(location))
    }

    fn destroy_space(&mut self, space: SpaceHandle) {
        self.spaces.remove(&space.into_raw());
    }

    fn wait_frame(&mut self) -> XrResult<FrameTiming> {
        let live = self.session.as_mut().ok_or(XrError::Lifecycle("xrWaitFrame"))?;
        let state = live.frame_waiter.wait().map_err(failed("xrWaitFrame"))?;
        Ok(FrameTiming {
            predicted_display_time: Time::from_nanos(state.predicted_display_time.as_nanos()),
            predicted_display_period: Duration::from_nanos(
                state.predicted_display_period.as_nanos().max(0) as u64,
            ),
            should_render: state.should_render,
        })
    }

    fn begin_frame(&mut self) -> XrResult<()> {
        let live = self
            .session
            .as_mut()
            .ok_or(XrError::Lifecycle("xrBeginFrame"))?;
        live.frame_stream.begin().map_err(failed("xrBeginFrame"))
    }

    fn locate_views(
        &self,
        ty: ViewConfigurationType,
        time: Time,
        space: SpaceHandle,
    ) -> XrResult<(ViewStateFlags, Vec<View>)> {
        let (flags, views) = self
            .live("xrLocateViews")?
            .session
            .locate_views(
                to_xr_view_configuration(ty),
                to_xr_time(time),
                self.space("xrLocateViews", space)?,
            )
            .map_err(failed("xrLocateViews"))?;
        let flags = ViewStateFlags {
            orientation_valid: flags.contains(xr::ViewStateFlags::ORIENTATION_VALID),
            position_valid: flags.contains(xr::ViewStateFlags::POSITION_VALID),
        };
        let views = views
            .into_iter()
            .map(|view| View {
                pose: from_xr_pose(view.pose),
                fov: from_xr_fov(view.fov),
            })
            .collect();
        Ok((flags, views))
    }

    fn end_frame(
        &mut self,
        time: Time,
        blend_mode: EnvironmentBlendMode,
        layers: &LayerList,
    ) -> XrResult<()> {
        let Self {
            session,
            spaces,
            swapchains,
            ..
        } = self;
        let live = session.as_mut().ok_or(XrError::Lifecycle("xrEndFrame"))?;

        let mut projection_views = Vec::with_capacity(layers.len());
        for layer in layers.as_slice() {
            let CompositionLayer::Projection(projection) = layer;
            let views = projection
                .views
                .iter()
                .map(|view| {
                    let swapchain = swapchains
                        .get(&view.sub_image.swapchain.into_raw())
                        .ok_or(XrError::Lifecycle("xrEndFrame"))?;
                    let rect = view.sub_image.rect;
                    Ok(xr::CompositionLayerProjectionView::new()
                        .pose(to_xr_pose(view.pose))
                        .fov(to_xr_fov(view.fov))
                        .sub_image(
                            xr::SwapchainSubImage::new()
                                .swapchain(swapchain)
                                .image_array_index(view.sub_image.array_index)
                                .image_rect(xr::Rect2Di {
                                    offset: xr::Offset2Di {
                                        x: rect.x,
                                        y: rect.y,
                                    },
                                    extent: xr::Extent2Di {
                                        width: rect.width,
                                        height: rect.height,
                                    },
                                }),
                        ))
                })
                .collect::<XrResult<Vec<_>>>()?;
            let space = spaces
                .get(&projection.space.into_raw())
                .ok_or(XrError::Lifecycle("xrEndFrame"))?;
            projection_views.push((space, views));
        }
        let projections: Vec<_> = projection_views
            .iter()
            .map(|(space, views)| {
                xr::CompositionLayerProjection::new()
                    .space(space)
                    .views(views)
            })
            .collect();
        let bases: Vec<&xr::CompositionLayerBase<'_, xr::OpenGlEs>> =
            projections.iter().map(|layer| &**layer).collect();

        let blend_mode = match blend_mode {
            EnvironmentBlendMode::Opaque => xr::EnvironmentBlendMode::OPAQUE,
            EnvironmentBlendMode::Additive => xr::EnvironmentBlendMode::ADDITIVE,
            EnvironmentBlendMode::AlphaBlend => xr::EnvironmentBlendMode::ALPHA_BLEND,
        };
        live.frame_stream
            .end(to_xr_time(time), blend_mode, &bases)
            .map_err(failed("xrEndFrame"))
    }

    fn enumerate_swapchain_formats(&self) -> XrResult<Vec<i64>> {
        let formats = self
            .live("xrEnumerateSwapchainFormats")?
            .session
            .enumerate_swapchain_formats()
            .map_err(failed("xrEnumerateSwapchainFormats"))?;
        Ok(formats.into_iter().map(i64::from).collect())
    }

    fn create_swapchain(&mut self, info: &SwapchainCreateInfo) -> XrResult<SwapchainHandle> {
        let mut usage_flags = xr::SwapchainUsageFlags::EMPTY;
        if info.color_attachment {
            usage_flags |= xr::SwapchainUsageFlags::COLOR_ATTACHMENT;
        }
        if info.sampled {
            usage_flags |= xr::SwapchainUsageFlags::SAMPLED;
        }
        let format = u32::try_from(info.format).map_err(|_| {
            XrError::runtime("xrCreateSwapchain", -1, "XR_ERROR_SWAPCHAIN_FORMAT_UNSUPPORTED")
        })?;
        let swapchain = self
            .live("xrCreateSwapchain")?
            .session
            .create_swapchain(&xr::SwapchainCreateInfo {
                create_flags: xr::SwapchainCreateFlags::EMPTY,
                usage_flags,
                format,
                sample_count: info.sample_count,
                width: info.width,
                height: info.height,
                face_count: info.face_count,
                array_size: info.array_size,
                mip_count: info.mip_count,
            })
            .map_err(failed("xrCreateSwapchain"))?;
        let handle = self.allocate_handle();
        self.swapchains.insert(handle, swapchain);
        Ok(SwapchainHandle::from_raw(handle))
    }

    fn enumerate_swapchain_images(&self, swapchain: SwapchainHandle) -> XrResult<Vec<u32>> {
        self.swapchains
            .get(&swapchain.into_raw())
            .ok_or(XrError::Lifecycle("xrEnumerateSwapchainImages"))?
            .enumerate_images()
            .map_err(failed("xrEnumerateSwapchainImages"))
    }

    fn acquire_swapchain_image(&mut self, swapchain: SwapchainHandle) -> XrResult<u32> {
        self.swapchain("xrAcquireSwapchainImage", swapchain)?
            .acquire_image()
            .map_err(failed("xrAcquireSwapchainImage"))
    }

    fn wait_swapchain_image(
        &mut self,
        swapchain: SwapchainHandle,
        timeout: Duration,
    ) -> XrResult<ImageWait> {
        let instance = self.instance("xrWaitSwapchainImage")?;
        let swapchain = self
            .swapchains
            .get(&swapchain.into_raw())
            .ok_or(XrError::Lifecycle("xrWaitSwapchainImage"))?;
        let info = xr::sys::SwapchainImageWaitInfo {
            ty: xr::sys::SwapchainImageWaitInfo::TYPE,
            next: std::ptr::null(),
            timeout: xr::Duration::from_nanos(timeout.as_nanos().min(i64::MAX as u128) as i64),
        };
        // SAFETY: the swapchain handle is live and `info` is a fully initialized wait info.
        let result = unsafe { (instance.fp().wait_swapchain_image)(swapchain.as_raw(), &info) };
        match result {
            xr::sys::Result::SUCCESS => Ok(ImageWait::Ready),
            xr::sys::Result::TIMEOUT_EXPIRED => Ok(ImageWait::TimedOut),
            code => Err(failed("xrWaitSwapchainImage")(code)),
        }
    }

    fn release_swapchain_image(&mut self, swapchain: SwapchainHandle) -> XrResult<()> {
        self.swapchain("xrReleaseSwapchainImage", swapchain)?
            .release_image()
            .map_err(failed("xrReleaseSwapchainImage"))
    }

    fn destroy_swapchain(&mut self, swapchain: SwapchainHandle) {
        self.swapchains.remove(&swapchain.into_raw());
    }

    fn string_to_path(&mut self, path: &str) -> XrResult<PathHandle> {
        let path = self
            .instance("xrStringToPath")?
            .string_to_path(path)
            .map_err(failed("xrStringToPath"))?;
        Ok(PathHandle::from_raw(path.into_raw()))
    }

    fn create_action_set(
        &mut self,
        name: &str,
        localized_name: &str,
        priority: u32,
    ) -> XrResult<ActionSetHandle> {
        let set = self
            .instance("xrCreateActionSet")?
            .create_action_set(name, localized_name, priority)
            .map_err(failed("xrCreateActionSet"))?;
        let handle = self.allocate_handle();
        self.action_sets.insert(handle, set);
        Ok(ActionSetHandle::from_raw(handle))
    }

    fn create_action(
        &mut self,
        set: ActionSetHandle,
        name: &str,
        localized_name: &str,
        ty: ActionType,
        subaction_paths: &[PathHandle],
    ) -> XrResult<ActionHandle> {
        let set = self
            .action_sets
            .get(&set.into_raw())
            .ok_or(XrError::Lifecycle("xrCreateAction"))?;
        let paths: Vec<xr::Path> = subaction_paths
            .iter()
            .map(|path| xr::Path::from_raw(path.into_raw()))
            .collect();
        let slot = match ty {
            ActionType::Boolean => set
                .create_action::<bool>(name, localized_name, &paths)
                .map(ActionSlot::Boolean),
            ActionType::Vector2f => set
                .create_action::<xr::Vector2f>(name, localized_name, &paths)
                .map(ActionSlot::Vector2f),
            ActionType::Pose => set
                .create_action::<xr::Posef>(name, localized_name, &paths)
                .map(ActionSlot::Pose),
        }
        .map_err(failed("xrCreateAction"))?;
        let handle = self.allocate_handle();
        self.actions.insert(handle, slot);
        Ok(ActionHandle::from_raw(handle))
    }

    fn suggest_bindings(
        &mut self,
        profile: PathHandle,
        bindings: &[SuggestedBinding],
    ) -> XrResult<()> {
        let instance = self.instance("xrSuggestInteractionProfileBindings")?;
        let bindings = bindings
            .iter()
            .map(|binding| {
                let path = xr::Path::from_raw(binding.path.into_raw());
                Ok(
                    match self.action("xrSuggestInteractionProfileBindings", binding.action)? {
                        ActionSlot::Boolean(action) => xr::Binding::new(action, path),
                        ActionSlot::Vector2f(action) => xr::Binding::new(action, path),
                        ActionSlot::Pose(action) => xr::Binding::new(action, path),
                    },
                )
            })
            .collect::<XrResult<Vec<_>>>()?;
        instance
            .suggest_interaction_profile_bindings(xr::Path::from_raw(profile.into_raw()), &bindings)
            .map_err(failed("xrSuggestInteractionProfileBindings"))
    }

    fn attach_action_sets(&mut self, sets: &[ActionSetHandle]) -> XrResult<()> {
        let sets = sets
            .iter()
            .map(|set| {
                self.action_sets
                    .get(&set.into_raw())
                    .ok_or(XrError::Lifecycle("xrAttachSessionActionSets"))
            })
            .collect::<XrResult<Vec<_>>>()?;
        self.live("xrAttachSessionActionSets")?
            .session
            .attach_action_sets(&sets)
            .map_err(failed("xrAttachSessionActionSets"))
    }

    fn sync_actions(&mut self, set: ActionSetHandle) -> XrResult<()> {
        let set = self
            .action_sets
            .get(&set.into_raw())
            .ok_or(XrError::Lifecycle("xrSyncActions"))?;
        self.live("xrSyncActions")?
            .session
            .sync_actions(&[xr::ActiveActionSet::new(set)])
            .map_err(failed("xrSyncActions"))
    }

    fn action_state_boolean(
        &self,
        action: ActionHandle,
        subaction_path: Option<PathHandle>,
    ) -> XrResult<ActionStateBoolean> {
        let ActionSlot::Boolean(action) = self.action("xrGetActionStateBoolean", action)? else {
            return Err(XrError::Lifecycle("xrGetActionStateBoolean"));
        };
        let state = action
            .state(&self.live("xrGetActionStateBoolean")?.session, subaction(subaction_path))
            .map_err(failed("xrGetActionStateBoolean"))?;
        Ok(ActionStateBoolean {
            current: state.current_state,
            changed_since_last_sync: state.changed_since_last_sync,
            is_active: state.is_active,
        })
    }

    fn action_state_vector2f(
        &self,
        action: ActionHandle,
        subaction_path: Option<PathHandle>,
    ) -> XrResult<ActionStateVector2f> {
        let ActionSlot::Vector2f(action) = self.action("xrGetActionStateVector2f", action)? else {
            return Err(XrError::Lifecycle("xrGetActionStateVector2f"));
        };
        let state = action
            .state(&self.live("xrGetActionStateVector2f")?.session, subaction(subaction_path))
            .map_err(failed("xrGetActionStateVector2f"))?;
        Ok(ActionStateVector2f {
            current: Vector2f::new(state.current_state.x, state.current_state.y),
            changed_since_last_sync: state.changed_since_last_sync,
            is_active: state.is_active,
        })
    }

    fn action_state_pose_active(
        &self,
        action: ActionHandle,
        subaction_path: Option<PathHandle>,
    ) -> XrResult<bool> {
        let ActionSlot::Pose(action) = self.action("xrGetActionStatePose", action)? else {
            return Err(XrError::Lifecycle("xrGetActionStatePose"));
        };
        action
            .is_active(&self.live("xrGetActionStatePose")?.session, subaction(subaction_path))
            .map_err(failed("xrGetActionStatePose"))
    }

    fn destroy_action_set(&mut self, set: ActionSetHandle) {
        // Actions belong to the set and go with it.
        self.actions.clear();
        self.action_sets.remove(&set.into_raw());
    }

    fn set_performance_level(&mut self, domain: PerfDomain, level: PerfLevel) -> XrResult<()> {
        let call = "xrPerfSettingsSetPerformanceLevelEXT";
        let perf = self
            .instance(call)?
            .exts()
            .ext_performance_settings
            .as_ref()
            .ok_or(XrError::MissingExtension("XR_EXT_performance_settings"))?;
        let session = self.live(call)?.session.as_raw();
        let domain = match domain {
            PerfDomain::Cpu => xr::PerfSettingsDomainEXT::CPU,
            PerfDomain::Gpu => xr::PerfSettingsDomainEXT::GPU,
        };
        let level = match level {
            PerfLevel::PowerSavings => xr::PerfSettingsLevelEXT::POWER_SAVINGS,
            PerfLevel::SustainedLow => xr::PerfSettingsLevelEXT::SUSTAINED_LOW,
            PerfLevel::SustainedHigh => xr::PerfSettingsLevelEXT::SUSTAINED_HIGH,
            PerfLevel::Boost => xr::PerfSettingsLevelEXT::BOOST,
        };
        // SAFETY: the entry point was resolved for this instance and the session is live.
        let result = unsafe { (perf.perf_settings_set_performance_level)(session, domain, level) };
        if result.into_raw() < 0 {
            return Err(failed(call)(result));
        }
        Ok(())
    }

    fn set_application_thread(&mut self, kind: ThreadKind) -> XrResult<()> {
        let call = "xrSetAndroidApplicationThreadKHR";
        let threads = self
            .instance(call)?
            .exts()
            .khr_android_thread_settings
            .as_ref()
            .ok_or(XrError::MissingExtension("XR_KHR_android_thread_settings"))?;
        let session = self.live(call)?.session.as_raw();
        let kind = match kind {
            ThreadKind::ApplicationMain => xr::AndroidThreadTypeKHR::APPLICATION_MAIN,
            ThreadKind::ApplicationWorker => xr::AndroidThreadTypeKHR::APPLICATION_WORKER,
            ThreadKind::RendererMain => xr::AndroidThreadTypeKHR::RENDERER_MAIN,
            ThreadKind::RendererWorker => xr::AndroidThreadTypeKHR::RENDERER_WORKER,
        };
        // SAFETY: gettid has no preconditions; the entry point belongs to this instance.
        let result = unsafe {
            let thread_id = gettid() as u32;
            (threads.set_android_application_thread)(session, kind, thread_id)
        };
        if result.into_raw() < 0 {
            return Err(failed(call)(result));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poses_convert_both_ways() {
        let pose = Posef::new(Quaternionf::from_yaw(0.4), Vector3f::new(0.1, 1.6, -0.3));
        assert_eq!(from_xr_pose(to_xr_pose(pose)), pose);
    }

    #[test]
    fn unknown_view_configurations_keep_their_raw_value() {
        assert_eq!(
            from_xr_view_configuration(to_xr_view_configuration(ViewConfigurationType::Other(7))),
            ViewConfigurationType::Other(7)
        );
    }

    #[test]
    fn extension_table_covers_negotiated_names() {
        let mut set = xr::ExtensionSet::default();
        let names: Vec<&str> = extension_flags(&mut set)
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        for name in crate::vr::capabilities::REQUIRED_EXTENSIONS
            .iter()
            .chain(crate::vr::capabilities::OPTIONAL_EXTENSIONS)
        {
            assert!(names.contains(name), "{name} missing from extension table");
        }
    }
}
