//! `GlDevice` over a live OpenGL ES 3 context through `glow`. Entry points glow does not wrap
//! are resolved from the platform loader when the device is built.

use crate::render::{
    Attachment, FramebufferStatus, FramebufferTarget, GlCapabilities, GlDevice, GlName,
};
use glow::HasContext;
use std::ffi::c_void;
use std::num::NonZeroU32;

const GL_RENDERBUFFER_SAMPLES: u32 = 0x8CAB;
const GL_TEXTURE_BORDER_COLOR: u32 = 0x1004;
const MULTIVIEW_EXTENSION: &str = "GL_OVR_multiview2";

type FramebufferTextureMultiviewFn =
    unsafe extern "system" fn(u32, u32, u32, i32, i32, i32);
type GetRenderbufferParameterivFn = unsafe extern "system" fn(u32, u32, *mut i32);

pub struct GlowDevice {
    gl: glow::Context,
    capabilities: GlCapabilities,
    framebuffer_texture_multiview: Option<FramebufferTextureMultiviewFn>,
    get_renderbuffer_parameteriv: Option<GetRenderbufferParameterivFn>,
}

impl GlowDevice {
    /// # Safety
    /// A GL ES 3 context must be current on this thread, and `loader` must return entry points
    /// for that context (or null).
    pub unsafe fn load(loader: impl Fn(&str) -> *const c_void) -> Self {
        // SAFETY: forwarded from the caller.
        let gl = unsafe { glow::Context::from_loader_function(|name| loader(name)) };
        // SAFETY: the pointers come from the loader of the current context and are only
        // transmuted to the signatures the GL ES registry gives them.
        let framebuffer_texture_multiview = unsafe {
            let ptr = loader("glFramebufferTextureMultiviewOVR");
            (!ptr.is_null())
                .then(|| std::mem::transmute::<*const c_void, FramebufferTextureMultiviewFn>(ptr))
        };
        let get_renderbuffer_parameteriv = unsafe {
            let ptr = loader("glGetRenderbufferParameteriv");
            (!ptr.is_null())
                .then(|| std::mem::transmute::<*const c_void, GetRenderbufferParameterivFn>(ptr))
        };

        let has_multiview = gl.supported_extensions().contains(MULTIVIEW_EXTENSION);
        if has_multiview && framebuffer_texture_multiview.is_none() {
            log::warn!("[gl] {MULTIVIEW_EXTENSION} advertised but its attach entry point is missing");
        }
        // SAFETY: plain state query on the current context.
        let max_samples = unsafe { gl.get_parameter_i32(glow::MAX_SAMPLES) }.max(1) as u32;
        let capabilities = GlCapabilities {
            multiview: has_multiview && framebuffer_texture_multiview.is_some(),
            max_samples,
        };
        let version = gl.version();
        log::info!(
            "[gl] GL ES {}.{} ({}), multiview {}, max samples {}",
            version.major,
            version.minor,
            version.vendor_info,
            capabilities.multiview,
            capabilities.max_samples
        );

        Self {
            gl,
            capabilities,
            framebuffer_texture_multiview,
            get_renderbuffer_parameteriv,
        }
    }
}

fn framebuffer_target(target: FramebufferTarget) -> u32 {
    match target {
        FramebufferTarget::Draw => glow::DRAW_FRAMEBUFFER,
        FramebufferTarget::Read => glow::READ_FRAMEBUFFER,
    }
}

fn attachment_point(attachment: Attachment) -> u32 {
    match attachment {
        Attachment::Color0 => glow::COLOR_ATTACHMENT0,
        Attachment::Depth => glow::DEPTH_ATTACHMENT,
    }
}

fn texture(name: GlName) -> Option<glow::NativeTexture> {
    NonZeroU32::new(name).map(glow::NativeTexture)
}

fn renderbuffer(name: GlName) -> Option<glow::NativeRenderbuffer> {
    NonZeroU32::new(name).map(glow::NativeRenderbuffer)
}

fn framebuffer(name: GlName) -> Option<glow::NativeFramebuffer> {
    NonZeroU32::new(name).map(glow::NativeFramebuffer)
}

impl GlDevice for GlowDevice {
    fn label(&self) -> &'static str {
        "OpenGL ES"
    }

    fn capabilities(&self) -> GlCapabilities {
        self.capabilities
    }

    fn configure_swapchain_texture(&mut self, name: GlName, array: bool) {
        let target = if array {
            glow::TEXTURE_2D_ARRAY
        } else {
            glow::TEXTURE_2D
        };
        // SAFETY: parameter updates on a texture the runtime handed out for this context.
        unsafe {
            self.gl.bind_texture(target, texture(name));
            self.gl
                .tex_parameter_i32(target, glow::TEXTURE_WRAP_S, glow::CLAMP_TO_BORDER as i32);
            self.gl
                .tex_parameter_i32(target, glow::TEXTURE_WRAP_T, glow::CLAMP_TO_BORDER as i32);
            self.gl.tex_parameter_f32_slice(
                target,
                GL_TEXTURE_BORDER_COLOR,
                &[0.0, 0.0, 0.0, 0.0],
            );
            self.gl
                .tex_parameter_i32(target, glow::TEXTURE_MIN_FILTER, glow::LINEAR as i32);
            self.gl
                .tex_parameter_i32(target, glow::TEXTURE_MAG_FILTER, glow::LINEAR as i32);
            self.gl.bind_texture(target, None);
        }
    }

    fn create_depth_array(&mut self, width: u32, height: u32, layers: u32) -> GlName {
        // SAFETY: allocates and fills a new texture object owned by this device.
        unsafe {
            let depth = match self.gl.create_texture() {
                Ok(depth) => depth,
                Err(err) => {
                    log::error!("[gl] glGenTextures failed: {err}");
                    return 0;
                }
            };
            self.gl.bind_texture(glow::TEXTURE_2D_ARRAY, Some(depth));
            self.gl.tex_storage_3d(
                glow::TEXTURE_2D_ARRAY,
                1,
                glow::DEPTH_COMPONENT24,
                width as i32,
                height as i32,
                layers as i32,
            );
            self.gl.bind_texture(glow::TEXTURE_2D_ARRAY, None);
            depth.0.get()
        }
    }

    fn delete_texture(&mut self, name: GlName) {
        if let Some(texture) = texture(name) {
            // SAFETY: the name was created by this device.
            unsafe { self.gl.delete_texture(texture) };
        }
    }

    fn create_renderbuffer(&mut self) -> GlName {
        // SAFETY: object creation on the current context.
        match unsafe { self.gl.create_renderbuffer() } {
            Ok(renderbuffer) => renderbuffer.0.get(),
            Err(err) => {
                log::error!("[gl] glGenRenderbuffers failed: {err}");
                0
            }
        }
    }

    fn renderbuffer_storage(
        &mut self,
        name: GlName,
        internal_format: u32,
        samples: u32,
        width: u32,
        height: u32,
    ) {
        // SAFETY: storage allocation for a renderbuffer created by this device.
        unsafe {
            self.gl.bind_renderbuffer(glow::RENDERBUFFER, renderbuffer(name));
            if samples > 1 {
                self.gl.renderbuffer_storage_multisample(
                    glow::RENDERBUFFER,
                    samples as i32,
                    internal_format,
                    width as i32,
                    height as i32,
                );
            } else {
                self.gl.renderbuffer_storage(
                    glow::RENDERBUFFER,
                    internal_format,
                    width as i32,
                    height as i32,
                );
            }
            self.gl.bind_renderbuffer(glow::RENDERBUFFER, None);
        }
    }

    fn renderbuffer_samples(&self, name: GlName) -> u32 {
        let Some(get_parameter) = self.get_renderbuffer_parameteriv else {
            return 0;
        };
        let mut samples = 0;
        // SAFETY: the entry point was resolved for this context and writes one integer.
        unsafe {
            self.gl.bind_renderbuffer(glow::RENDERBUFFER, renderbuffer(name));
            get_parameter(glow::RENDERBUFFER, GL_RENDERBUFFER_SAMPLES, &mut samples);
            self.gl.bind_renderbuffer(glow::RENDERBUFFER, None);
        }
        samples.max(0) as u32
    }

    fn delete_renderbuffer(&mut self, name: GlName) {
        if let Some(renderbuffer) = renderbuffer(name) {
            // SAFETY: the name was created by this device.
            unsafe { self.gl.delete_renderbuffer(renderbuffer) };
        }
    }

    fn create_framebuffer(&mut self) -> GlName {
        // SAFETY: object creation on the current context.
        match unsafe { self.gl.create_framebuffer() } {
            Ok(framebuffer) => framebuffer.0.get(),
            Err(err) => {
                log::error!("[gl] glGenFramebuffers failed: {err}");
                0
            }
        }
    }

    fn delete_framebuffer(&mut self, name: GlName) {
        if let Some(framebuffer) = framebuffer(name) {
            // SAFETY: the name was created by this device.
            unsafe { self.gl.delete_framebuffer(framebuffer) };
        }
    }

    fn bind_framebuffer(&mut self, target: FramebufferTarget, name: Option<GlName>) {
        // SAFETY: binding an existing framebuffer, or the default one.
        unsafe {
            self.gl
                .bind_framebuffer(framebuffer_target(target), name.and_then(framebuffer))
        };
    }

    fn attach_renderbuffer(
        &mut self,
        target: FramebufferTarget,
        attachment: Attachment,
        name: GlName,
    ) {
        // SAFETY: attaches to the framebuffer bound at `target`.
        unsafe {
            self.gl.framebuffer_renderbuffer(
                framebuffer_target(target),
                attachment_point(attachment),
                glow::RENDERBUFFER,
                renderbuffer(name),
            )
        };
    }

    fn attach_texture(&mut self, target: FramebufferTarget, attachment: Attachment, name: GlName) {
        // SAFETY: attaches to the framebuffer bound at `target`.
        unsafe {
            self.gl.framebuffer_texture_2d(
                framebuffer_target(target),
                attachment_point(attachment),
                glow::TEXTURE_2D,
                texture(name),
                0,
            )
        };
    }

    fn attach_texture_multiview(
        &mut self,
        target: FramebufferTarget,
        attachment: Attachment,
        name: GlName,
        base_view: u32,
        views: u32,
    ) {
        let Some(attach) = self.framebuffer_texture_multiview else {
            log::error!("[gl] multiview attach requested without glFramebufferTextureMultiviewOVR");
            return;
        };
        // SAFETY: the entry point was resolved for this context.
        unsafe {
            attach(
                framebuffer_target(target),
                attachment_point(attachment),
                name,
                0,
                base_view as i32,
                views as i32,
            )
        };
    }

    fn check_status(&self, target: FramebufferTarget) -> FramebufferStatus {
        // SAFETY: plain state query.
        FramebufferStatus::from_gl(unsafe {
            self.gl.check_framebuffer_status(framebuffer_target(target))
        })
    }

    fn viewport(&mut self, width: u32, height: u32) {
        // SAFETY: plain state update.
        unsafe {
            self.gl.viewport(0, 0, width as i32, height as i32);
            self.gl.scissor(0, 0, width as i32, height as i32);
        }
    }

    fn clear(&mut self, color: [f32; 4], depth: f32) {
        // SAFETY: clears the bound draw framebuffer.
        unsafe {
            self.gl.clear_color(color[0], color[1], color[2], color[3]);
            self.gl.clear_depth_f32(depth);
            self.gl.depth_mask(true);
            self.gl.clear(glow::COLOR_BUFFER_BIT | glow::DEPTH_BUFFER_BIT);
        }
    }

    fn blit_color(&mut self, width: u32, height: u32) {
        let (width, height) = (width as i32, height as i32);
        // SAFETY: copies between the bound read and draw framebuffers.
        unsafe {
            self.gl.blit_framebuffer(
                0,
                0,
                width,
                height,
                0,
                0,
                width,
                height,
                glow::COLOR_BUFFER_BIT,
                glow::NEAREST,
            )
        };
    }

    fn invalidate(&mut self, target: FramebufferTarget, attachments: &[Attachment]) {
        let points: Vec<u32> = attachments.iter().copied().map(attachment_point).collect();
        // SAFETY: discards contents of the framebuffer bound at `target`.
        unsafe {
            self.gl
                .invalidate_framebuffer(framebuffer_target(target), &points)
        };
    }
}
