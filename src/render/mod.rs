pub mod context;
#[cfg(all(feature = "vr-openxr", target_os = "android"))]
pub mod egl;
pub mod framebuffer;
#[cfg(feature = "vr-openxr")]
pub mod glow_device;
pub mod software;

pub use context::{ApiVersion, ContextBackend, GraphicsBinding, GraphicsContext, GraphicsError};

use crate::vr::View;
use std::fmt;

/// GL object name (texture, renderbuffer or framebuffer). Zero is never a live object.
pub type GlName = u32;

pub mod formats {
    pub const GL_RGBA8: i64 = 0x8058;
    pub const GL_SRGB8_ALPHA8: i64 = 0x8C43;
    pub const GL_DEPTH_COMPONENT24: u32 = 0x81A6;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramebufferTarget {
    Draw,
    Read,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attachment {
    Color0,
    Depth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramebufferStatus {
    Complete,
    IncompleteAttachment,
    IncompleteMissingAttachment,
    IncompleteDimensions,
    IncompleteMultisample,
    IncompleteViewTargets,
    Unsupported,
    Unknown(u32),
}

impl FramebufferStatus {
    pub fn from_gl(status: u32) -> Self {
        match status {
            0x8CD5 => FramebufferStatus::Complete,
            0x8CD6 => FramebufferStatus::IncompleteAttachment,
            0x8CD7 => FramebufferStatus::IncompleteMissingAttachment,
            0x8CD9 => FramebufferStatus::IncompleteDimensions,
            0x8D56 => FramebufferStatus::IncompleteMultisample,
            0x9633 => FramebufferStatus::IncompleteViewTargets,
            0x8CDD => FramebufferStatus::Unsupported,
            other => FramebufferStatus::Unknown(other),
        }
    }

    pub fn is_complete(self) -> bool {
        self == FramebufferStatus::Complete
    }

    pub fn label(self) -> &'static str {
        match self {
            FramebufferStatus::Complete => "GL_FRAMEBUFFER_COMPLETE",
            FramebufferStatus::IncompleteAttachment => "GL_FRAMEBUFFER_INCOMPLETE_ATTACHMENT",
            FramebufferStatus::IncompleteMissingAttachment => {
                "GL_FRAMEBUFFER_INCOMPLETE_MISSING_ATTACHMENT"
            }
            FramebufferStatus::IncompleteDimensions => "GL_FRAMEBUFFER_INCOMPLETE_DIMENSIONS",
            FramebufferStatus::IncompleteMultisample => "GL_FRAMEBUFFER_INCOMPLETE_MULTISAMPLE",
            FramebufferStatus::IncompleteViewTargets => {
                "GL_FRAMEBUFFER_INCOMPLETE_VIEW_TARGETS_OVR"
            }
            FramebufferStatus::Unsupported => "GL_FRAMEBUFFER_UNSUPPORTED",
            FramebufferStatus::Unknown(_) => "unknown framebuffer status",
        }
    }
}

impl fmt::Display for FramebufferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FramebufferStatus::Unknown(raw) => write!(f, "{} ({raw:#x})", self.label()),
            _ => f.write_str(self.label()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GlCapabilities {
    /// `GL_OVR_multiview2` and its attach entry point are present.
    pub multiview: bool,
    pub max_samples: u32,
}

/// The slice of OpenGL ES the swapchain framebuffers and scene renderer drive. Calls act on
/// the device's currently bound framebuffers, as GL does.
pub trait GlDevice {
    fn label(&self) -> &'static str;
    fn capabilities(&self) -> GlCapabilities;

    fn configure_swapchain_texture(&mut self, texture: GlName, array: bool);
    fn create_depth_array(&mut self, width: u32, height: u32, layers: u32) -> GlName;
    fn delete_texture(&mut self, texture: GlName);

    fn create_renderbuffer(&mut self) -> GlName;
    fn renderbuffer_storage(
        &mut self,
        renderbuffer: GlName,
        internal_format: u32,
        samples: u32,
        width: u32,
        height: u32,
    );
    fn renderbuffer_samples(&self, renderbuffer: GlName) -> u32;
    fn delete_renderbuffer(&mut self, renderbuffer: GlName);

    fn create_framebuffer(&mut self) -> GlName;
    fn delete_framebuffer(&mut self, framebuffer: GlName);
    fn bind_framebuffer(&mut self, target: FramebufferTarget, framebuffer: Option<GlName>);
    fn attach_renderbuffer(
        &mut self,
        target: FramebufferTarget,
        attachment: Attachment,
        renderbuffer: GlName,
    );
    fn attach_texture(&mut self, target: FramebufferTarget, attachment: Attachment, texture: GlName);
    fn attach_texture_multiview(
        &mut self,
        target: FramebufferTarget,
        attachment: Attachment,
        texture: GlName,
        base_view: u32,
        views: u32,
    );
    fn check_status(&self, target: FramebufferTarget) -> FramebufferStatus;

    fn viewport(&mut self, width: u32, height: u32);
    fn clear(&mut self, color: [f32; 4], depth: f32);
    /// Copies the read framebuffer's color into the draw framebuffer, nearest filtering.
    fn blit_color(&mut self, width: u32, height: u32);
    fn invalidate(&mut self, target: FramebufferTarget, attachments: &[Attachment]);
}

#[derive(Debug)]
pub enum RenderError {
    TargetIncomplete(FramebufferStatus),
    Backend(&'static str),
}

impl fmt::Display for RenderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RenderError::TargetIncomplete(status) => {
                write!(f, "render target incomplete: {status}")
            }
            RenderError::Backend(reason) => write!(f, "scene backend failure: {reason}"),
        }
    }
}

impl std::error::Error for RenderError {}

pub type RenderResult<T> = Result<T, RenderError>;

/// What one scene draw covers: a single eye, or both eyes at once when multiview is bound.
#[derive(Debug, Clone, Copy)]
pub struct RenderPass<'a> {
    pub frame_index: u64,
    pub views: &'a [View],
    pub width: u32,
    pub height: u32,
    pub multiview: bool,
}

pub trait SceneRenderer {
    fn label(&self) -> &'static str;
    fn render(&mut self, gl: &mut dyn GlDevice, pass: &RenderPass<'_>) -> RenderResult<()>;
}

/// Minimal scene: clears every bound view to a solid color and resets depth.
#[derive(Debug, Clone, Copy)]
pub struct ClearColorRenderer {
    pub color: [f32; 4],
}

impl Default for ClearColorRenderer {
    fn default() -> Self {
        Self {
            color: [0.05, 0.05, 0.12, 1.0],
        }
    }
}

impl SceneRenderer for ClearColorRenderer {
    fn label(&self) -> &'static str {
        "Clear Color Renderer"
    }

    fn render(&mut self, gl: &mut dyn GlDevice, pass: &RenderPass<'_>) -> RenderResult<()> {
        gl.viewport(pass.width, pass.height);
        gl.clear(self.color, 1.0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn framebuffer_status_decodes_gl_enums() {
        assert!(FramebufferStatus::from_gl(0x8CD5).is_complete());
        assert_eq!(
            FramebufferStatus::from_gl(0x8D56),
            FramebufferStatus::IncompleteMultisample
        );
        assert_eq!(
            FramebufferStatus::from_gl(0x1234).to_string(),
            "unknown framebuffer status (0x1234)"
        );
    }
}
