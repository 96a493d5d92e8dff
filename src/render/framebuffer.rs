use crate::render::formats::GL_DEPTH_COMPONENT24;
use crate::render::{Attachment, FramebufferStatus, FramebufferTarget, GlDevice, GlName};
use crate::vr::runtime::{
    ImageWait, Rect2Di, SwapchainCreateInfo, SwapchainHandle, SwapchainSubImage, XrRuntime,
};
use crate::vr::{XrError, XrResult};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_WAIT_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramebufferConfig {
    pub color_format: i64,
    pub width: u32,
    pub height: u32,
    pub samples: u32,
    pub multiview: bool,
    pub wait_timeout: Duration,
    pub wait_retries: u32,
}

impl FramebufferConfig {
    pub fn new(color_format: i64, width: u32, height: u32, samples: u32, multiview: bool) -> Self {
        Self {
            color_format,
            width,
            height,
            samples,
            multiview,
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            wait_retries: DEFAULT_WAIT_RETRIES,
        }
    }
}

#[derive(Debug, Error)]
pub enum FramebufferError {
    #[error("swapchain format {0:#x} is not supported by the runtime")]
    UnsupportedFormat(i64),
    #[error("framebuffer for swapchain image {image} is incomplete: {status}")]
    Incomplete {
        image: usize,
        status: FramebufferStatus,
    },
    #[error(transparent)]
    Runtime(#[from] XrError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DepthStorage {
    Renderbuffer(GlName),
    TextureArray(GlName),
}

#[derive(Debug, Clone, Copy)]
struct ImageTarget {
    color_texture: GlName,
    depth: DepthStorage,
    msaa_color: Option<GlName>,
    framebuffer: GlName,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquired {
    Image(u32),
    TimedOut,
}

/// One runtime swapchain plus a GL framebuffer per swapchain image. Depth and, when
/// multisampling, an intermediate color renderbuffer are owned per image.
#[derive(Debug)]
pub struct SwapchainFramebuffer {
    swapchain: Option<SwapchainHandle>,
    color_format: i64,
    width: u32,
    height: u32,
    samples: u32,
    multiview: bool,
    targets: Vec<ImageTarget>,
    current: Option<usize>,
    waited: bool,
    pending: Option<u32>,
    wait_timeout: Duration,
    wait_retries: u32,
}

impl SwapchainFramebuffer {
    pub fn create(
        runtime: &mut dyn XrRuntime,
        gl: &mut dyn GlDevice,
        config: &FramebufferConfig,
    ) -> Result<Self, FramebufferError> {
        let capabilities = gl.capabilities();
        let multiview = if config.multiview && !capabilities.multiview {
            log::warn!("[framebuffer] multiview requested but GL_OVR_multiview2 is unavailable");
            false
        } else {
            config.multiview
        };
        let mut samples = config.samples.max(1);
        if capabilities.max_samples > 0 && samples > capabilities.max_samples {
            log::warn!(
                "[framebuffer] clamping {samples}x MSAA to device limit {}",
                capabilities.max_samples
            );
            samples = capabilities.max_samples;
        }

        let formats = runtime.enumerate_swapchain_formats()?;
        log::debug!("[framebuffer] runtime swapchain formats: {formats:x?}");
        if !formats.contains(&config.color_format) {
            log::error!(
                "[framebuffer] color format {:#x} not offered by the runtime",
                config.color_format
            );
            return Err(FramebufferError::UnsupportedFormat(config.color_format));
        }

        let swapchain = runtime.create_swapchain(&SwapchainCreateInfo {
            format: config.color_format,
            width: config.width,
            height: config.height,
            sample_count: 1,
            array_size: if multiview { 2 } else { 1 },
            face_count: 1,
            mip_count: 1,
            color_attachment: true,
            sampled: true,
        })?;

        let mut framebuffer = Self {
            swapchain: Some(swapchain),
            color_format: config.color_format,
            width: config.width,
            height: config.height,
            samples,
            multiview,
            targets: Vec::new(),
            current: None,
            waited: false,
            pending: None,
            wait_timeout: config.wait_timeout,
            wait_retries: config.wait_retries,
        };

        match framebuffer.build_targets(runtime, gl, swapchain) {
            Ok(()) => {
                log::debug!("[framebuffer] created {}", framebuffer.describe());
                Ok(framebuffer)
            }
            Err(err) => {
                framebuffer.destroy(runtime, gl);
                Err(err)
            }
        }
    }

    fn build_targets(
        &mut self,
        runtime: &mut dyn XrRuntime,
        gl: &mut dyn GlDevice,
        swapchain: SwapchainHandle,
    ) -> Result<(), FramebufferError> {
        let images = runtime.enumerate_swapchain_images(swapchain)?;
        for (index, color_texture) in images.into_iter().enumerate() {
            gl.configure_swapchain_texture(color_texture, self.multiview);

            let framebuffer = gl.create_framebuffer();
            gl.bind_framebuffer(FramebufferTarget::Draw, Some(framebuffer));

            let target = if self.multiview {
                let depth = gl.create_depth_array(self.width, self.height, 2);
                gl.attach_texture_multiview(
                    FramebufferTarget::Draw,
                    Attachment::Color0,
                    color_texture,
                    0,
                    2,
                );
                gl.attach_texture_multiview(FramebufferTarget::Draw, Attachment::Depth, depth, 0, 2);
                ImageTarget {
                    color_texture,
                    depth: DepthStorage::TextureArray(depth),
                    msaa_color: None,
                    framebuffer,
                }
            } else {
                let depth = gl.create_renderbuffer();
                let depth_samples = if self.samples > 1 { self.samples } else { 0 };
                gl.renderbuffer_storage(
                    depth,
                    GL_DEPTH_COMPONENT24,
                    depth_samples,
                    self.width,
                    self.height,
                );
                gl.attach_renderbuffer(FramebufferTarget::Draw, Attachment::Depth, depth);

                let msaa_color = if self.samples > 1 {
                    let color = gl.create_renderbuffer();
                    gl.renderbuffer_storage(
                        color,
                        self.color_format as u32,
                        self.samples,
                        self.width,
                        self.height,
                    );
                    gl.attach_renderbuffer(FramebufferTarget::Draw, Attachment::Color0, color);
                    Some(color)
                } else {
                    gl.attach_texture(FramebufferTarget::Draw, Attachment::Color0, color_texture);
                    None
                };
                ImageTarget {
                    color_texture,
                    depth: DepthStorage::Renderbuffer(depth),
                    msaa_color,
                    framebuffer,
                }
            };
            self.targets.push(target);

            let status = self.validate_bound(gl, index);
            if !status.is_complete() {
                gl.bind_framebuffer(FramebufferTarget::Draw, None);
                log::error!("[framebuffer] image {index} incomplete: {status}");
                return Err(FramebufferError::Incomplete {
                    image: index,
                    status,
                });
            }
        }
        gl.bind_framebuffer(FramebufferTarget::Draw, None);
        Ok(())
    }

    /// Checks the bound draw framebuffer of `index`, reallocating multisampled depth at the
    /// color sample count when the two have diverged.
    fn validate_bound(&self, gl: &mut dyn GlDevice, index: usize) -> FramebufferStatus {
        let status = gl.check_status(FramebufferTarget::Draw);
        if status.is_complete() {
            return status;
        }
        let target = self.targets[index];
        let (DepthStorage::Renderbuffer(depth), Some(color)) = (target.depth, target.msaa_color)
        else {
            return status;
        };
        let color_samples = gl.renderbuffer_samples(color);
        let depth_samples = gl.renderbuffer_samples(depth);
        if color_samples == depth_samples {
            return status;
        }

        log::warn!(
            "[framebuffer] image {index} depth has {depth_samples} samples, color {color_samples}; reallocating depth"
        );
        gl.renderbuffer_storage(
            depth,
            GL_DEPTH_COMPONENT24,
            color_samples,
            self.width,
            self.height,
        );
        gl.attach_renderbuffer(FramebufferTarget::Draw, Attachment::Depth, depth);
        gl.check_status(FramebufferTarget::Draw)
    }

    /// Acquires the next swapchain image and waits for it, retrying timed-out waits. An image
    /// whose wait timed out stays acquired and is waited on again by the next call instead of
    /// acquiring another one.
    pub fn acquire(&mut self, runtime: &mut dyn XrRuntime) -> XrResult<Acquired> {
        let swapchain = self
            .swapchain
            .ok_or(XrError::Lifecycle("xrAcquireSwapchainImage"))?;
        let index = match self.pending.take() {
            Some(index) => {
                log::debug!("[framebuffer] resuming wait on swapchain image {index}");
                index
            }
            None => runtime.acquire_swapchain_image(swapchain)?,
        };
        self.current = None;
        self.waited = false;
        self.pending = Some(index);

        for attempt in 0..=self.wait_retries {
            match runtime.wait_swapchain_image(swapchain, self.wait_timeout)? {
                ImageWait::Ready => {
                    self.pending = None;
                    self.current = Some(index as usize);
                    self.waited = true;
                    return Ok(Acquired::Image(index));
                }
                ImageWait::TimedOut if attempt < self.wait_retries => {
                    log::debug!(
                        "[framebuffer] retry {} waiting for swapchain image {index}",
                        attempt + 1
                    );
                }
                ImageWait::TimedOut => {}
            }
        }

        log::error!(
            "[framebuffer] swapchain image {index} not ready after {} retries",
            self.wait_retries
        );
        Ok(Acquired::TimedOut)
    }

    /// Binds the acquired image's framebuffer for drawing. Returns false when the target cannot
    /// be made complete, in which case nothing should be drawn into it.
    pub fn set_current(&mut self, gl: &mut dyn GlDevice) -> bool {
        let Some(index) = self.current.filter(|index| *index < self.targets.len()) else {
            return false;
        };
        gl.bind_framebuffer(FramebufferTarget::Draw, Some(self.targets[index].framebuffer));
        let status = self.validate_bound(gl, index);
        if !status.is_complete() {
            log::error!("[framebuffer] skipping image {index}: {status}");
            gl.bind_framebuffer(FramebufferTarget::Draw, None);
            return false;
        }
        true
    }

    /// Copies the multisampled color of the current image into its swapchain texture and
    /// discards the multisampled depth. No-op without multisampling or with multiview.
    pub fn resolve(&self, gl: &mut dyn GlDevice) {
        if self.samples <= 1 || self.multiview {
            return;
        }
        let Some(target) = self.current.and_then(|index| self.targets.get(index)) else {
            return;
        };

        let resolve_framebuffer = gl.create_framebuffer();
        gl.bind_framebuffer(FramebufferTarget::Draw, Some(resolve_framebuffer));
        gl.attach_texture(
            FramebufferTarget::Draw,
            Attachment::Color0,
            target.color_texture,
        );
        let draw_status = gl.check_status(FramebufferTarget::Draw);

        gl.bind_framebuffer(FramebufferTarget::Read, Some(target.framebuffer));
        let read_status = gl.check_status(FramebufferTarget::Read);

        if draw_status.is_complete() && read_status.is_complete() {
            gl.blit_color(self.width, self.height);
            gl.invalidate(FramebufferTarget::Read, &[Attachment::Depth]);
        } else {
            log::error!(
                "[framebuffer] resolve skipped: draw {draw_status}, read {read_status}"
            );
        }

        gl.bind_framebuffer(FramebufferTarget::Read, None);
        gl.bind_framebuffer(FramebufferTarget::Draw, None);
        gl.delete_framebuffer(resolve_framebuffer);
    }

    /// Returns the current image to the runtime. An image whose wait never completed stays
    /// pending for the next acquire.
    pub fn release(&mut self, runtime: &mut dyn XrRuntime) -> XrResult<()> {
        let Some(swapchain) = self.swapchain else {
            return Ok(());
        };
        if self.current.is_some() && self.waited {
            runtime.release_swapchain_image(swapchain)?;
        }
        self.current = None;
        self.waited = false;
        Ok(())
    }

    pub fn sub_image(&self, array_index: u32) -> Option<SwapchainSubImage> {
        Some(SwapchainSubImage {
            swapchain: self.swapchain?,
            rect: Rect2Di {
                x: 0,
                y: 0,
                width: self.width as i32,
                height: self.height as i32,
            },
            array_index,
        })
    }

    pub fn destroy(&mut self, runtime: &mut dyn XrRuntime, gl: &mut dyn GlDevice) {
        for target in self.targets.drain(..) {
            gl.delete_framebuffer(target.framebuffer);
            match target.depth {
                DepthStorage::Renderbuffer(depth) => gl.delete_renderbuffer(depth),
                DepthStorage::TextureArray(depth) => gl.delete_texture(depth),
            }
            if let Some(color) = target.msaa_color {
                gl.delete_renderbuffer(color);
            }
        }
        if let Some(swapchain) = self.swapchain.take() {
            runtime.destroy_swapchain(swapchain);
        }
        self.current = None;
        self.waited = false;
        self.pending = None;
    }

    pub fn describe(&self) -> String {
        format!(
            "{}x{} format {:#x}, {} sample(s), multiview {}, {} image(s), current {:?}",
            self.width,
            self.height,
            self.color_format,
            self.samples,
            self.multiview,
            self.targets.len(),
            self.current
        )
    }

    pub fn swapchain(&self) -> Option<SwapchainHandle> {
        self.swapchain
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn samples(&self) -> u32 {
        self.samples
    }

    pub fn is_multiview(&self) -> bool {
        self.multiview
    }

    pub fn image_count(&self) -> usize {
        self.targets.len()
    }

    pub fn current_index(&self) -> Option<usize> {
        self.current
    }

    /// Index of an acquired image still waiting to become ready.
    pub fn pending_index(&self) -> Option<u32> {
        self.pending
    }

    pub fn color_texture(&self, index: usize) -> Option<GlName> {
        self.targets.get(index).map(|target| target.color_texture)
    }

    pub fn framebuffer(&self, index: usize) -> Option<GlName> {
        self.targets.get(index).map(|target| target.framebuffer)
    }

    pub fn msaa_color(&self, index: usize) -> Option<GlName> {
        self.targets.get(index).and_then(|target| target.msaa_color)
    }

    pub fn depth_renderbuffer(&self, index: usize) -> Option<GlName> {
        match self.targets.get(index)?.depth {
            DepthStorage::Renderbuffer(depth) => Some(depth),
            DepthStorage::TextureArray(_) => None,
        }
    }
}
