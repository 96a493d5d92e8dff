pub mod signal;
pub mod telemetry;
pub mod thread;

use crate::config::{AppConfig, ConfigError};
use crate::render::framebuffer::{
    Acquired, FramebufferConfig, FramebufferError, SwapchainFramebuffer,
};
use crate::render::{FramebufferTarget, GlDevice, RenderPass, SceneRenderer};
use crate::vr::input::{InputStateFrame, InputStateStatic};
use crate::vr::runtime::{
    CompositionLayer, EnvironmentBlendMode, LayerList, ProjectionLayer, ProjectionView,
    ViewStateFlags, XrRuntime,
};
use crate::vr::session::{InitError, TrackingSession};
use crate::vr::{SpaceLocation, Time, View, XrError, XrResult, XrResultExt};
use signal::{MessageKind, SignalError, SignalReceiver};
use std::time::Instant;
use telemetry::{FrameSample, FrameTelemetry};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Init(#[from] InitError),
    #[error(transparent)]
    Framebuffer(#[from] FramebufferError),
    #[error(transparent)]
    Runtime(#[from] XrError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Signal(#[from] SignalError),
    #[error("failed to spawn render thread: {0}")]
    Spawn(std::io::Error),
    #[error("render thread panicked")]
    RenderThreadPanicked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Continue,
    Stop,
}

/// What the last submitted frame looked like.
#[derive(Debug, Clone, Default)]
pub struct FrameState {
    pub frame_index: u64,
    pub display_time: Time,
    pub head: SpaceLocation,
    pub view_flags: ViewStateFlags,
    pub views: Vec<View>,
    pub eyes_rendered: u32,
}

/// Runs the per-tick sequence: events, host messages, then while the session is active
/// wait, begin, locate, input, render and end.
pub struct FramePipeline {
    session: TrackingSession,
    gl: Box<dyn GlDevice>,
    framebuffers: Vec<SwapchainFramebuffer>,
    multiview: bool,
    input: Option<InputStateStatic>,
    input_frame: InputStateFrame,
    renderer: Box<dyn SceneRenderer>,
    signals: SignalReceiver,
    max_messages_per_tick: usize,
    frame_index: u64,
    started_at: Instant,
    telemetry: FrameTelemetry,
    last_frame: FrameState,
}

impl FramePipeline {
    /// Builds eye swapchains and input on an initialized session.
    pub fn new(
        mut session: TrackingSession,
        config: &AppConfig,
        renderer: Box<dyn SceneRenderer>,
        signals: SignalReceiver,
        started_at: Instant,
    ) -> Result<Self, AppError> {
        let views = session
            .view_configuration()
            .map(|configuration| configuration.views.clone())
            .ok_or(XrError::Lifecycle("FramePipeline::new"))?;
        let mut gl = session.graphics().load_device().map_err(XrError::from)?;

        let capabilities = gl.capabilities();
        let multiview = config.multiview && capabilities.multiview;
        if config.multiview && !multiview {
            log::warn!("[pipeline] multiview unavailable, rendering each eye separately");
        }
        let targets: Vec<_> = if multiview {
            views.iter().take(1).collect()
        } else {
            views.iter().collect()
        };

        let mut framebuffers = Vec::with_capacity(targets.len());
        for view in targets {
            let framebuffer_config = FramebufferConfig {
                multiview,
                ..config.framebuffer_config(view.recommended_width, view.recommended_height)
            };
            match SwapchainFramebuffer::create(
                session.runtime_mut(),
                gl.as_mut(),
                &framebuffer_config,
            ) {
                Ok(framebuffer) => framebuffers.push(framebuffer),
                Err(err) => {
                    for mut framebuffer in framebuffers {
                        framebuffer.destroy(session.runtime_mut(), gl.as_mut());
                    }
                    return Err(err.into());
                }
            }
        }

        let input = match InputStateStatic::create(session.runtime_mut()) {
            Ok(input) => input,
            Err(err) => {
                for mut framebuffer in framebuffers {
                    framebuffer.destroy(session.runtime_mut(), gl.as_mut());
                }
                return Err(err.into());
            }
        };

        log::info!(
            "[pipeline] {} eye target(s), multiview {multiview}, scene {}",
            framebuffers.len(),
            renderer.label()
        );
        Ok(Self {
            session,
            gl,
            framebuffers,
            multiview,
            input: Some(input),
            input_frame: InputStateFrame::default(),
            renderer,
            signals,
            max_messages_per_tick: config.max_messages_per_tick,
            frame_index: 0,
            started_at,
            telemetry: FrameTelemetry::new(config.telemetry_window, config.frame_budget_ms),
            last_frame: FrameState::default(),
        })
    }

    pub fn tick(&mut self) -> XrResult<TickOutcome> {
        self.session.poll_events()?;

        for message in self.signals.drain(self.max_messages_per_tick) {
            match message.kind {
                MessageKind::ExitNeeded => {
                    log::info!("[pipeline] exit requested by host");
                    self.session.request_stop();
                }
            }
        }

        if self.session.stop_requested() {
            return Ok(TickOutcome::Stop);
        }

        if !self.session.is_active() {
            if self.frame_index != 0 {
                log::debug!(
                    "[pipeline] session inactive after {} frame(s)",
                    self.frame_index
                );
            }
            self.frame_index = 0;
            std::thread::yield_now();
            return Ok(TickOutcome::Continue);
        }

        self.frame_index += 1;
        self.render_frame()?;
        Ok(TickOutcome::Continue)
    }

    /// Ticks until the session or the host asks to stop.
    pub fn run(&mut self) -> XrResult<()> {
        while self.tick()? == TickOutcome::Continue {}
        log::info!(
            "[pipeline] stopped, {}",
            self.telemetry
                .to_json()
                .unwrap_or_else(|err| format!("stats unavailable: {err}"))
        );
        Ok(())
    }

    fn render_frame(&mut self) -> XrResult<()> {
        let wait_start = Instant::now();
        let timing = self.session.runtime_mut().wait_frame().logged()?;
        let wait_ms = elapsed_ms(wait_start);
        self.session.runtime_mut().begin_frame().logged()?;
        let time = timing.predicted_display_time;

        if self.frame_index == 1 {
            self.session.recenter(time)?;
            let elapsed = self.started_at.elapsed();
            if self.telemetry.mark_first_frame(elapsed) {
                log::info!(
                    "[pipeline] time to first frame {:.1} ms",
                    elapsed.as_secs_f64() * 1000.0
                );
            } else {
                log::info!("[pipeline] first frame after reactivation");
            }
        }

        let head = self.session.locate_head(time)?;
        self.sync_input(time)?;
        if self.input_frame.exit_requested() {
            log::info!("[pipeline] menu pressed, stopping");
            self.session.request_stop();
        }

        let (view_flags, views) = self.session.locate_views(time)?;
        let render_start = Instant::now();
        let eyes_rendered = if !(view_flags.orientation_valid && view_flags.position_valid) {
            log::warn!("[pipeline] frame {} view poses invalid", self.frame_index);
            0
        } else if !timing.should_render {
            0
        } else {
            self.render_views(&views)?
        };
        let render_ms = elapsed_ms(render_start);

        let submit_start = Instant::now();
        let layers = LayerList::new(CompositionLayer::Projection(self.projection_layer(&views)?));
        self.session
            .runtime_mut()
            .end_frame(time, EnvironmentBlendMode::Opaque, &layers)
            .logged()?;
        let submit_ms = elapsed_ms(submit_start);

        self.telemetry.record(
            FrameSample {
                frame_index: self.frame_index,
                wait_ms,
                render_ms,
                submit_ms,
                eyes_rendered,
            },
            views.len() as u32,
        );
        self.last_frame = FrameState {
            frame_index: self.frame_index,
            display_time: time,
            head,
            view_flags,
            views,
            eyes_rendered,
        };
        Ok(())
    }

    fn sync_input(&mut self, time: Time) -> XrResult<()> {
        let Some(input) = self.input.as_mut() else {
            return Ok(());
        };
        let local = self
            .session
            .spaces()
            .local
            .ok_or(XrError::Lifecycle("xrSyncActions"))?;
        self.input_frame
            .sync_buttons_and_thumbsticks(self.session.runtime_mut(), input)?;
        self.input_frame
            .sync_hand_poses(self.session.runtime_mut(), input, local, time)?;
        if self.input_frame.has_button_changes() {
            log::trace!("[pipeline] button state changed: {:?}", self.input_frame);
        }
        Ok(())
    }

    fn render_views(&mut self, views: &[View]) -> XrResult<u32> {
        let runtime = self.session.runtime_mut();
        let gl = self.gl.as_mut();
        let renderer = self.renderer.as_mut();

        if self.multiview {
            let Some(framebuffer) = self.framebuffers.first_mut() else {
                return Ok(0);
            };
            let pass = RenderPass {
                frame_index: self.frame_index,
                views,
                width: framebuffer.width(),
                height: framebuffer.height(),
                multiview: true,
            };
            let rendered = render_target(runtime, gl, framebuffer, renderer, &pass)?;
            return Ok(if rendered { views.len() as u32 } else { 0 });
        }

        let mut eyes = 0;
        for (view, framebuffer) in views.iter().zip(self.framebuffers.iter_mut()) {
            let pass = RenderPass {
                frame_index: self.frame_index,
                views: std::slice::from_ref(view),
                width: framebuffer.width(),
                height: framebuffer.height(),
                multiview: false,
            };
            if render_target(runtime, gl, framebuffer, renderer, &pass)? {
                eyes += 1;
            }
        }
        Ok(eyes)
    }

    fn projection_layer(&self, views: &[View]) -> XrResult<ProjectionLayer> {
        let space = self
            .session
            .spaces()
            .local
            .ok_or(XrError::Lifecycle("xrEndFrame"))?;
        let views = views
            .iter()
            .enumerate()
            .filter_map(|(eye, view)| {
                let sub_image = if self.multiview {
                    self.framebuffers.first()?.sub_image(eye as u32)?
                } else {
                    self.framebuffers.get(eye)?.sub_image(0)?
                };
                Some(ProjectionView {
                    pose: view.pose,
                    fov: view.fov,
                    sub_image,
                })
            })
            .collect();
        Ok(ProjectionLayer { space, views })
    }

    /// Releases swapchains and input, then shuts the session down. Idempotent.
    pub fn shutdown(&mut self) {
        let runtime = self.session.runtime_mut();
        if let Some(mut input) = self.input.take() {
            input.destroy(runtime);
        }
        for mut framebuffer in self.framebuffers.drain(..) {
            framebuffer.destroy(runtime, self.gl.as_mut());
        }
        self.session.shutdown();
        self.frame_index = 0;
    }

    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    pub fn last_frame(&self) -> &FrameState {
        &self.last_frame
    }

    pub fn telemetry(&self) -> &FrameTelemetry {
        &self.telemetry
    }

    pub fn input_frame(&self) -> &InputStateFrame {
        &self.input_frame
    }

    pub fn session(&self) -> &TrackingSession {
        &self.session
    }

    pub fn framebuffers(&self) -> &[SwapchainFramebuffer] {
        &self.framebuffers
    }

    pub fn is_multiview(&self) -> bool {
        self.multiview
    }
}

impl Drop for FramePipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Acquire, draw, resolve and release one swapchain target. Returns whether anything was drawn.
fn render_target(
    runtime: &mut dyn XrRuntime,
    gl: &mut dyn GlDevice,
    framebuffer: &mut SwapchainFramebuffer,
    renderer: &mut dyn SceneRenderer,
    pass: &RenderPass<'_>,
) -> XrResult<bool> {
    if framebuffer.acquire(runtime).logged()? == Acquired::TimedOut {
        log::warn!("[pipeline] frame {} eye skipped, image not ready", pass.frame_index);
        return Ok(false);
    }

    let rendered = framebuffer.set_current(gl)
        && match renderer.render(gl, pass) {
            Ok(()) => true,
            Err(err) => {
                log::error!("[pipeline] {} failed: {err}", renderer.label());
                false
            }
        };
    if rendered {
        framebuffer.resolve(gl);
    }
    gl.bind_framebuffer(FramebufferTarget::Draw, None);
    framebuffer.release(runtime).logged()?;
    Ok(rendered)
}

fn elapsed_ms(start: Instant) -> f32 {
    start.elapsed().as_secs_f32() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::software::{SoftwareContext, SoftwareGl};
    use crate::render::{ClearColorRenderer, ContextBackend, GlCapabilities, GraphicsContext};
    use crate::vr::runtime::{HostContext, SessionState};
    use crate::vr::simulated::{SimulatedConfig, SimulatedRuntime};
    use signal::{Message, SignalSender, channel};

    struct Harness {
        runtime: SimulatedRuntime,
        gl: SoftwareGl,
        sender: SignalSender,
        pipeline: FramePipeline,
    }

    fn harness_with(config: AppConfig, sim: SimulatedConfig, gl: SoftwareGl) -> Harness {
        let runtime = SimulatedRuntime::new(sim).with_graphics(gl.clone());
        let context_gl = gl.clone();
        let graphics = GraphicsContext::new(move || {
            Ok(Box::new(SoftwareContext::new(context_gl.clone())) as Box<dyn ContextBackend>)
        });
        let mut session = TrackingSession::new(Box::new(runtime.clone()), graphics);
        session
            .initialize(&config, &HostContext::default())
            .expect("session should initialize");
        let (sender, receiver) = channel(config.signal_capacity).expect("channel");
        let pipeline = FramePipeline::new(
            session,
            &config,
            Box::new(ClearColorRenderer::default()),
            receiver,
            Instant::now(),
        )
        .expect("pipeline");
        Harness {
            runtime,
            gl,
            sender,
            pipeline,
        }
    }

    fn harness() -> Harness {
        harness_with(
            AppConfig::default(),
            SimulatedConfig::default(),
            SoftwareGl::new(),
        )
    }

    #[test]
    fn frame_index_counts_active_ticks_and_resets() {
        let mut h = harness();
        let mut indices = Vec::new();
        for _ in 0..3 {
            h.pipeline.tick().expect("tick");
            indices.push(h.pipeline.frame_index());
        }
        h.runtime.push_session_state(SessionState::Stopping);
        h.pipeline.tick().expect("tick");
        indices.push(h.pipeline.frame_index());
        h.runtime.push_session_state(SessionState::Ready);
        h.pipeline.tick().expect("tick");
        indices.push(h.pipeline.frame_index());

        assert_eq!(indices, vec![1, 2, 3, 0, 1]);
        assert_eq!(h.runtime.call_count("xrBeginSession"), 2);
        assert_eq!(h.runtime.call_count("xrEndSession"), 1);
    }

    #[test]
    fn per_eye_frames_render_resolve_and_submit() {
        let mut h = harness();
        h.pipeline.tick().expect("tick");

        let frames = h.runtime.submitted_frames();
        assert_eq!(frames.len(), 1);
        let CompositionLayer::Projection(layer) = &frames[0].layers.as_slice()[0];
        assert_eq!(layer.views.len(), 2);
        assert_ne!(layer.views[0].sub_image.swapchain, layer.views[1].sub_image.swapchain);
        assert_eq!(h.pipeline.last_frame().eyes_rendered, 2);
        assert_eq!(h.gl.blits().len(), 2);
        assert_eq!(h.gl.clear_count(), 2);
        assert_eq!(h.gl.bound_framebuffers(), (None, None));
    }

    #[test]
    fn multiview_renders_once_into_array_layers() {
        let config = AppConfig {
            multiview: true,
            ..AppConfig::default()
        };
        let mut h = harness_with(config, SimulatedConfig::default(), SoftwareGl::new());
        h.pipeline.tick().expect("tick");

        assert!(h.pipeline.is_multiview());
        assert_eq!(h.pipeline.framebuffers().len(), 1);
        let frames = h.runtime.submitted_frames();
        let CompositionLayer::Projection(layer) = &frames[0].layers.as_slice()[0];
        assert_eq!(layer.views[0].sub_image.array_index, 0);
        assert_eq!(layer.views[1].sub_image.array_index, 1);
        assert_eq!(h.gl.clear_count(), 1);
        assert!(h.gl.blits().is_empty());
    }

    #[test]
    fn multiview_without_device_support_falls_back_per_eye() {
        let config = AppConfig {
            multiview: true,
            ..AppConfig::default()
        };
        let gl = SoftwareGl::with_capabilities(GlCapabilities {
            multiview: false,
            max_samples: 4,
        });
        let h = harness_with(config, SimulatedConfig::default(), gl);
        assert!(!h.pipeline.is_multiview());
        assert_eq!(h.pipeline.framebuffers().len(), 2);
    }

    #[test]
    fn timed_out_eyes_are_skipped_but_layer_is_submitted() {
        let mut h = harness();
        h.runtime.queue_image_timeouts(4);
        h.pipeline.tick().expect("tick");

        assert_eq!(h.pipeline.last_frame().eyes_rendered, 1);
        let frames = h.runtime.submitted_frames();
        assert_eq!(frames.len(), 1);
        let CompositionLayer::Projection(layer) = &frames[0].layers.as_slice()[0];
        assert_eq!(layer.views.len(), 2);
        assert_eq!(h.runtime.call_count("xrReleaseSwapchainImage"), 1);
    }

    #[test]
    fn repeated_timeouts_recover_on_the_next_ready_image() {
        let mut h = harness();
        h.pipeline.tick().expect("tick");
        let left = h.pipeline.framebuffers()[0].swapchain().expect("swapchain");
        let right = h.pipeline.framebuffers()[1].swapchain().expect("swapchain");

        for _ in 0..3 {
            h.runtime.queue_image_timeouts(4);
            h.pipeline.tick().expect("timed out tick");
            assert_eq!(h.pipeline.last_frame().eyes_rendered, 1);
        }
        let pending = h.pipeline.framebuffers()[0]
            .pending_index()
            .expect("left image still pending");
        assert_eq!(h.runtime.outstanding_images(left), 1);

        h.pipeline.tick().expect("recovered tick");
        assert_eq!(h.pipeline.last_frame().eyes_rendered, 2);
        assert_eq!(h.runtime.last_waited_image(left), Some(pending));
        assert_eq!(h.runtime.outstanding_images(left), 0);
        assert_eq!(h.runtime.outstanding_images(right), 0);
        assert_eq!(h.runtime.submitted_frames().len(), 5);
    }

    #[test]
    fn invalid_view_poses_still_submit_a_layer() {
        let mut h = harness();
        h.runtime.set_view_flags(ViewStateFlags {
            orientation_valid: false,
            position_valid: true,
        });
        h.pipeline.tick().expect("tick");

        assert_eq!(h.pipeline.last_frame().eyes_rendered, 0);
        assert_eq!(h.runtime.call_count("xrAcquireSwapchainImage"), 0);
        assert_eq!(h.runtime.submitted_frames().len(), 1);
    }

    #[test]
    fn host_exit_message_stops_before_rendering() {
        let mut h = harness();
        assert!(h.sender.post(Message::exit()));

        assert_eq!(h.pipeline.tick().expect("tick"), TickOutcome::Stop);
        assert_eq!(h.runtime.call_count("xrWaitFrame"), 0);
    }

    #[test]
    fn menu_press_stops_on_next_tick() {
        let mut h = harness();
        h.runtime.set_boolean("menu", None, true);

        assert_eq!(h.pipeline.tick().expect("tick"), TickOutcome::Continue);
        assert_eq!(h.runtime.submitted_frames().len(), 1);
        assert_eq!(h.pipeline.tick().expect("tick"), TickOutcome::Stop);
    }

    #[test]
    fn first_frame_recenters_and_records_startup_time() {
        let mut h = harness();
        h.pipeline.tick().expect("tick");
        h.pipeline.tick().expect("tick");

        let spaces = h.pipeline.session().spaces();
        assert!(spaces.head.is_some() && spaces.forward_direction.is_some());
        assert_eq!(
            h.runtime
                .reference_space_poses(crate::vr::runtime::ReferenceSpaceType::Local)
                .len(),
            3
        );
        assert!(h.pipeline.telemetry().time_to_first_frame().is_some());
        assert_eq!(h.pipeline.telemetry().stats().total_frames, 2);
    }

    #[test]
    fn shutdown_releases_everything_once() {
        let mut h = harness();
        h.pipeline.tick().expect("tick");
        h.pipeline.shutdown();
        h.pipeline.shutdown();

        assert_eq!(h.runtime.live_swapchains(), 0);
        assert_eq!(h.runtime.live_spaces(), 0);
        assert!(!h.runtime.is_instance_alive());
        assert_eq!(h.runtime.call_count("xrDestroyActionSet"), 1);
        assert_eq!(h.gl.live_framebuffers(), 0);
        assert_eq!(h.gl.live_renderbuffers(), 0);
    }
}
