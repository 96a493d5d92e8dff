use crate::config::AppConfig;
use crate::engine::signal::{self, Message, SignalReceiver, SignalSender};
use crate::engine::{AppError, FramePipeline};
use crate::render::software::{SoftwareContext, SoftwareGl};
use crate::render::{ClearColorRenderer, ContextBackend, GraphicsContext, SceneRenderer};
use crate::vr::runtime::{HostContext, XrRuntime};
use crate::vr::session::TrackingSession;
use crate::vr::simulated::SimulatedRuntime;
use std::thread::{self, JoinHandle};
use std::time::Instant;

pub const RENDER_THREAD_NAME: &str = "VR::Main";

/// Builds the runtime, graphics context and scene on the render thread.
pub trait Platform: Send + 'static {
    fn runtime(&mut self) -> Box<dyn XrRuntime>;
    fn graphics(&mut self) -> GraphicsContext;
    fn scene_renderer(&mut self) -> Box<dyn SceneRenderer> {
        Box::new(ClearColorRenderer::default())
    }
}

/// In-process runtime and software GL, sharing state with the handles kept by the caller.
#[derive(Clone, Default)]
pub struct SimulatedPlatform {
    pub runtime: SimulatedRuntime,
    pub gl: SoftwareGl,
}

impl SimulatedPlatform {
    pub fn new(runtime: SimulatedRuntime, gl: SoftwareGl) -> Self {
        Self {
            runtime: runtime.with_graphics(gl.clone()),
            gl,
        }
    }
}

impl Platform for SimulatedPlatform {
    fn runtime(&mut self) -> Box<dyn XrRuntime> {
        Box::new(self.runtime.clone())
    }

    fn graphics(&mut self) -> GraphicsContext {
        let gl = self.gl.clone();
        GraphicsContext::new(move || {
            Ok(Box::new(SoftwareContext::new(gl.clone())) as Box<dyn ContextBackend>)
        })
    }
}

/// OpenXR loader plus an EGL pbuffer context.
#[cfg(all(feature = "vr-openxr", target_os = "android"))]
pub struct AndroidPlatform;

#[cfg(all(feature = "vr-openxr", target_os = "android"))]
impl Platform for AndroidPlatform {
    fn runtime(&mut self) -> Box<dyn XrRuntime> {
        Box::new(crate::vr::openxr::OpenXrRuntime::new())
    }

    fn graphics(&mut self) -> GraphicsContext {
        GraphicsContext::new(|| {
            crate::render::egl::EglContext::create()
                .map(|context| Box::new(context) as Box<dyn ContextBackend>)
        })
    }
}

/// Host-side handle to the render thread.
pub struct AppThread {
    sender: SignalSender,
    handle: Option<JoinHandle<Result<(), AppError>>>,
}

impl AppThread {
    /// Spawns the render thread. Initialization happens on that thread; failures surface from
    /// `destroy`, or abort the process when `abort_on_fatal` is set.
    pub fn create<P: Platform>(
        config: AppConfig,
        host: HostContext,
        platform: P,
    ) -> Result<Self, AppError> {
        config.validate()?;
        let started_at = Instant::now();
        let (sender, receiver) = signal::channel(config.signal_capacity)?;

        let handle = thread::Builder::new()
            .name(RENDER_THREAD_NAME.to_string())
            .spawn(move || {
                let abort_on_fatal = config.abort_on_fatal;
                let result = run_render_thread(config, host, platform, receiver, started_at);
                if let Err(err) = &result {
                    log::error!("[app] render thread failed: {err}");
                    if abort_on_fatal {
                        std::process::abort();
                    }
                }
                result
            })
            .map_err(AppError::Spawn)?;

        log::info!("[app] render thread started");
        Ok(Self {
            sender,
            handle: Some(handle),
        })
    }

    /// Asks the render thread to exit. Dropped silently when the queue is full.
    pub fn request_exit(&self) -> bool {
        self.sender.post(Message::exit())
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Signals exit and joins the render thread.
    pub fn destroy(mut self) -> Result<(), AppError> {
        self.join()
    }

    fn join(&mut self) -> Result<(), AppError> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        self.request_exit();
        let result = handle
            .join()
            .map_err(|_| AppError::RenderThreadPanicked)
            .and_then(|result| result);
        log::info!("[app] render thread joined");
        result
    }

    /// Leaks the handle into an opaque value for the host shell.
    pub fn into_raw(self) -> i64 {
        Box::into_raw(Box::new(self)) as i64
    }

    /// # Safety
    /// `raw` must come from [`AppThread::into_raw`] and must not be used again afterwards.
    pub unsafe fn from_raw(raw: i64) -> Self {
        // SAFETY: the caller guarantees `raw` is a pointer produced by `into_raw`.
        unsafe { *Box::from_raw(raw as *mut AppThread) }
    }
}

impl Drop for AppThread {
    fn drop(&mut self) {
        if let Err(err) = self.join() {
            log::error!("[app] render thread ended with error: {err}");
        }
    }
}

/// Body of the render thread: initialize, run the frame loop, tear down.
pub fn run_render_thread<P: Platform>(
    config: AppConfig,
    host: HostContext,
    mut platform: P,
    receiver: SignalReceiver,
    started_at: Instant,
) -> Result<(), AppError> {
    let mut session = TrackingSession::new(platform.runtime(), platform.graphics());
    session.initialize(&config, &host)?;

    let mut pipeline = FramePipeline::new(
        session,
        &config,
        platform.scene_renderer(),
        receiver,
        started_at,
    )?;
    let result = pipeline.run();
    pipeline.shutdown();
    result?;
    Ok(())
}
