//! In-process GL device that keeps object state and contents as plain values. Framebuffer
//! completeness, clears, blits and invalidation follow GL ES 3 rules closely enough for the
//! swapchain framebuffers to be exercised without a driver.

use crate::render::context::{ApiVersion, ContextBackend, GraphicsBinding, GraphicsError};
use crate::render::{
    Attachment, FramebufferStatus, FramebufferTarget, GlCapabilities, GlDevice, GlName,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

type Color = [f32; 4];

#[derive(Debug, Clone)]
struct TextureObject {
    width: u32,
    height: u32,
    depth_format: bool,
    configured: bool,
    colors: Vec<Option<Color>>,
    depths: Vec<Option<f32>>,
}

impl TextureObject {
    fn new(width: u32, height: u32, layers: u32, depth_format: bool) -> Self {
        let layers = layers.max(1) as usize;
        Self {
            width,
            height,
            depth_format,
            configured: false,
            colors: vec![None; layers],
            depths: vec![None; layers],
        }
    }
}

#[derive(Debug, Clone, Default)]
struct RenderbufferObject {
    format: u32,
    samples: u32,
    width: u32,
    height: u32,
    pinned_samples: Option<u32>,
    color: Option<Color>,
    depth: Option<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttachmentSource {
    Texture(GlName),
    TextureViews {
        texture: GlName,
        base_view: u32,
        views: u32,
    },
    Renderbuffer(GlName),
}

#[derive(Debug, Clone, Default)]
struct FramebufferObject {
    color: Option<AttachmentSource>,
    depth: Option<AttachmentSource>,
}

impl FramebufferObject {
    fn slot(&mut self, attachment: Attachment) -> &mut Option<AttachmentSource> {
        match attachment {
            Attachment::Color0 => &mut self.color,
            Attachment::Depth => &mut self.depth,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlitRecord {
    pub read: GlName,
    pub draw: GlName,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidateRecord {
    pub framebuffer: GlName,
    pub attachments: Vec<Attachment>,
}

#[derive(Debug)]
struct SoftwareState {
    next_name: GlName,
    capabilities: GlCapabilities,
    textures: HashMap<GlName, TextureObject>,
    renderbuffers: HashMap<GlName, RenderbufferObject>,
    framebuffers: HashMap<GlName, FramebufferObject>,
    draw_binding: Option<GlName>,
    read_binding: Option<GlName>,
    viewport: (u32, u32),
    current: bool,
    blits: Vec<BlitRecord>,
    invalidations: Vec<InvalidateRecord>,
    clears: usize,
}

impl Default for SoftwareState {
    fn default() -> Self {
        Self {
            next_name: 1,
            capabilities: GlCapabilities {
                multiview: true,
                max_samples: 4,
            },
            textures: HashMap::new(),
            renderbuffers: HashMap::new(),
            framebuffers: HashMap::new(),
            draw_binding: None,
            read_binding: None,
            viewport: (0, 0),
            current: false,
            blits: Vec::new(),
            invalidations: Vec::new(),
            clears: 0,
        }
    }
}

struct SourceInfo {
    samples: u32,
    width: u32,
    height: u32,
    views: Option<u32>,
}

impl SoftwareState {
    fn allocate_name(&mut self) -> GlName {
        let name = self.next_name;
        self.next_name += 1;
        name
    }

    fn binding(&self, target: FramebufferTarget) -> Option<GlName> {
        match target {
            FramebufferTarget::Draw => self.draw_binding,
            FramebufferTarget::Read => self.read_binding,
        }
    }

    fn source_info(&self, source: AttachmentSource) -> Option<SourceInfo> {
        match source {
            AttachmentSource::Texture(texture) => self.textures.get(&texture).map(|tex| SourceInfo {
                samples: 1,
                width: tex.width,
                height: tex.height,
                views: None,
            }),
            AttachmentSource::TextureViews {
                texture,
                base_view,
                views,
            } => self.textures.get(&texture).and_then(|tex| {
                ((base_view + views) as usize <= tex.colors.len()).then_some(SourceInfo {
                    samples: 1,
                    width: tex.width,
                    height: tex.height,
                    views: Some(views),
                })
            }),
            AttachmentSource::Renderbuffer(rb) => {
                self.renderbuffers.get(&rb).map(|object| SourceInfo {
                    samples: object.samples.max(1),
                    width: object.width,
                    height: object.height,
                    views: None,
                })
            }
        }
    }

    fn status_of(&self, framebuffer: GlName) -> FramebufferStatus {
        let Some(object) = self.framebuffers.get(&framebuffer) else {
            return FramebufferStatus::Unsupported;
        };
        let Some(color) = object.color else {
            return FramebufferStatus::IncompleteMissingAttachment;
        };
        let Some(color) = self.source_info(color) else {
            return FramebufferStatus::IncompleteAttachment;
        };
        if color.width == 0 || color.height == 0 {
            return FramebufferStatus::IncompleteAttachment;
        }
        if let Some(depth) = object.depth {
            let Some(depth) = self.source_info(depth) else {
                return FramebufferStatus::IncompleteAttachment;
            };
            if depth.width != color.width || depth.height != color.height {
                return FramebufferStatus::IncompleteDimensions;
            }
            if depth.views != color.views {
                return FramebufferStatus::IncompleteViewTargets;
            }
            if depth.samples != color.samples {
                return FramebufferStatus::IncompleteMultisample;
            }
        }
        FramebufferStatus::Complete
    }

    fn write_color(&mut self, source: AttachmentSource, color: Option<Color>) {
        match source {
            AttachmentSource::Texture(texture) => {
                if let Some(tex) = self.textures.get_mut(&texture) {
                    tex.colors[0] = color;
                }
            }
            AttachmentSource::TextureViews {
                texture,
                base_view,
                views,
            } => {
                if let Some(tex) = self.textures.get_mut(&texture) {
                    for layer in base_view..base_view + views {
                        if let Some(slot) = tex.colors.get_mut(layer as usize) {
                            *slot = color;
                        }
                    }
                }
            }
            AttachmentSource::Renderbuffer(rb) => {
                if let Some(object) = self.renderbuffers.get_mut(&rb) {
                    object.color = color;
                }
            }
        }
    }

    fn read_color(&self, source: AttachmentSource) -> Option<Color> {
        match source {
            AttachmentSource::Texture(texture) => self.textures.get(&texture)?.colors[0],
            AttachmentSource::TextureViews {
                texture, base_view, ..
            } => *self.textures.get(&texture)?.colors.get(base_view as usize)?,
            AttachmentSource::Renderbuffer(rb) => self.renderbuffers.get(&rb)?.color,
        }
    }

    fn write_depth(&mut self, source: AttachmentSource, depth: Option<f32>) {
        match source {
            AttachmentSource::Texture(texture) => {
                if let Some(tex) = self.textures.get_mut(&texture) {
                    tex.depths[0] = depth;
                }
            }
            AttachmentSource::TextureViews {
                texture,
                base_view,
                views,
            } => {
                if let Some(tex) = self.textures.get_mut(&texture) {
                    for layer in base_view..base_view + views {
                        if let Some(slot) = tex.depths.get_mut(layer as usize) {
                            *slot = depth;
                        }
                    }
                }
            }
            AttachmentSource::Renderbuffer(rb) => {
                if let Some(object) = self.renderbuffers.get_mut(&rb) {
                    object.depth = depth;
                }
            }
        }
    }
}

/// Shared handle: clones observe and mutate the same device state.
#[derive(Clone, Default)]
pub struct SoftwareGl {
    state: Arc<Mutex<SoftwareState>>,
}

impl SoftwareGl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capabilities(capabilities: GlCapabilities) -> Self {
        let gl = Self::new();
        gl.lock().capabilities = capabilities;
        gl
    }

    fn lock(&self) -> MutexGuard<'_, SoftwareState> {
        self.state
            .lock()
            .expect("software gl state mutex should not poison")
    }

    /// Allocates a color texture with `layers` array slices, as a runtime does for swapchain images.
    pub fn allocate_texture(&self, width: u32, height: u32, layers: u32) -> GlName {
        let mut state = self.lock();
        let name = state.allocate_name();
        state
            .textures
            .insert(name, TextureObject::new(width, height, layers, false));
        name
    }

    pub fn release_texture(&self, texture: GlName) {
        self.lock().textures.remove(&texture);
    }

    pub fn texture_color(&self, texture: GlName, layer: u32) -> Option<Color> {
        self.lock()
            .textures
            .get(&texture)
            .and_then(|tex| tex.colors.get(layer as usize).copied().flatten())
    }

    pub fn texture_configured(&self, texture: GlName) -> bool {
        self.lock()
            .textures
            .get(&texture)
            .is_some_and(|tex| tex.configured)
    }

    pub fn renderbuffer_color(&self, renderbuffer: GlName) -> Option<Color> {
        self.lock()
            .renderbuffers
            .get(&renderbuffer)
            .and_then(|rb| rb.color)
    }

    pub fn renderbuffer_depth(&self, renderbuffer: GlName) -> Option<f32> {
        self.lock()
            .renderbuffers
            .get(&renderbuffer)
            .and_then(|rb| rb.depth)
    }

    pub fn renderbuffer_format(&self, renderbuffer: GlName) -> Option<u32> {
        self.lock().renderbuffers.get(&renderbuffer).map(|rb| rb.format)
    }

    /// Overwrites the stored sample count of an existing renderbuffer.
    pub fn set_renderbuffer_samples(&self, renderbuffer: GlName, samples: u32) {
        if let Some(rb) = self.lock().renderbuffers.get_mut(&renderbuffer) {
            rb.samples = samples;
        }
    }

    /// Makes later storage calls on this renderbuffer ignore the requested sample count.
    pub fn pin_renderbuffer_samples(&self, renderbuffer: GlName, samples: u32) {
        if let Some(rb) = self.lock().renderbuffers.get_mut(&renderbuffer) {
            rb.pinned_samples = Some(samples);
            rb.samples = samples;
        }
    }

    pub fn framebuffer_color_views(&self, framebuffer: GlName) -> Option<u32> {
        match self.lock().framebuffers.get(&framebuffer)?.color? {
            AttachmentSource::TextureViews { views, .. } => Some(views),
            _ => None,
        }
    }

    pub fn blits(&self) -> Vec<BlitRecord> {
        self.lock().blits.clone()
    }

    pub fn invalidations(&self) -> Vec<InvalidateRecord> {
        self.lock().invalidations.clone()
    }

    pub fn clear_count(&self) -> usize {
        self.lock().clears
    }

    pub fn live_framebuffers(&self) -> usize {
        self.lock().framebuffers.len()
    }

    pub fn live_renderbuffers(&self) -> usize {
        self.lock().renderbuffers.len()
    }

    pub fn live_textures(&self) -> usize {
        self.lock().textures.len()
    }

    pub fn bound_framebuffers(&self) -> (Option<GlName>, Option<GlName>) {
        let state = self.lock();
        (state.draw_binding, state.read_binding)
    }

    pub fn is_current(&self) -> bool {
        self.lock().current
    }
}

impl GlDevice for SoftwareGl {
    fn label(&self) -> &'static str {
        "Software GL"
    }

    fn capabilities(&self) -> GlCapabilities {
        self.lock().capabilities
    }

    fn configure_swapchain_texture(&mut self, texture: GlName, _array: bool) {
        if let Some(tex) = self.lock().textures.get_mut(&texture) {
            tex.configured = true;
        }
    }

    fn create_depth_array(&mut self, width: u32, height: u32, layers: u32) -> GlName {
        let mut state = self.lock();
        let name = state.allocate_name();
        state
            .textures
            .insert(name, TextureObject::new(width, height, layers, true));
        name
    }

    fn delete_texture(&mut self, texture: GlName) {
        self.lock().textures.remove(&texture);
    }

    fn create_renderbuffer(&mut self) -> GlName {
        let mut state = self.lock();
        let name = state.allocate_name();
        state
            .renderbuffers
            .insert(name, RenderbufferObject::default());
        name
    }

    fn renderbuffer_storage(
        &mut self,
        renderbuffer: GlName,
        internal_format: u32,
        samples: u32,
        width: u32,
        height: u32,
    ) {
        if let Some(rb) = self.lock().renderbuffers.get_mut(&renderbuffer) {
            rb.format = internal_format;
            rb.samples = rb.pinned_samples.unwrap_or(samples);
            rb.width = width;
            rb.height = height;
            rb.color = None;
            rb.depth = None;
        }
    }

    fn renderbuffer_samples(&self, renderbuffer: GlName) -> u32 {
        self.lock()
            .renderbuffers
            .get(&renderbuffer)
            .map_or(0, |rb| rb.samples)
    }

    fn delete_renderbuffer(&mut self, renderbuffer: GlName) {
        self.lock().renderbuffers.remove(&renderbuffer);
    }

    fn create_framebuffer(&mut self) -> GlName {
        let mut state = self.lock();
        let name = state.allocate_name();
        state
            .framebuffers
            .insert(name, FramebufferObject::default());
        name
    }

    fn delete_framebuffer(&mut self, framebuffer: GlName) {
        let mut state = self.lock();
        state.framebuffers.remove(&framebuffer);
        if state.draw_binding == Some(framebuffer) {
            state.draw_binding = None;
        }
        if state.read_binding == Some(framebuffer) {
            state.read_binding = None;
        }
    }

    fn bind_framebuffer(&mut self, target: FramebufferTarget, framebuffer: Option<GlName>) {
        let mut state = self.lock();
        match target {
            FramebufferTarget::Draw => state.draw_binding = framebuffer,
            FramebufferTarget::Read => state.read_binding = framebuffer,
        }
    }

    fn attach_renderbuffer(
        &mut self,
        target: FramebufferTarget,
        attachment: Attachment,
        renderbuffer: GlName,
    ) {
        let mut state = self.lock();
        if let Some(fb) = state.binding(target) {
            if let Some(object) = state.framebuffers.get_mut(&fb) {
                *object.slot(attachment) = Some(AttachmentSource::Renderbuffer(renderbuffer));
            }
        }
    }

    fn attach_texture(&mut self, target: FramebufferTarget, attachment: Attachment, texture: GlName) {
        let mut state = self.lock();
        if let Some(fb) = state.binding(target) {
            if let Some(object) = state.framebuffers.get_mut(&fb) {
                *object.slot(attachment) = Some(AttachmentSource::Texture(texture));
            }
        }
    }

    fn attach_texture_multiview(
        &mut self,
        target: FramebufferTarget,
        attachment: Attachment,
        texture: GlName,
        base_view: u32,
        views: u32,
    ) {
        let mut state = self.lock();
        if !state.capabilities.multiview {
            return;
        }
        if let Some(fb) = state.binding(target) {
            if let Some(object) = state.framebuffers.get_mut(&fb) {
                *object.slot(attachment) = Some(AttachmentSource::TextureViews {
                    texture,
                    base_view,
                    views,
                });
            }
        }
    }

    fn check_status(&self, target: FramebufferTarget) -> FramebufferStatus {
        let state = self.lock();
        match state.binding(target) {
            Some(fb) => state.status_of(fb),
            None => FramebufferStatus::Complete,
        }
    }

    fn viewport(&mut self, width: u32, height: u32) {
        self.lock().viewport = (width, height);
    }

    fn clear(&mut self, color: [f32; 4], depth: f32) {
        let mut state = self.lock();
        let Some(fb) = state.draw_binding else {
            return;
        };
        let Some(object) = state.framebuffers.get(&fb).cloned() else {
            return;
        };
        if let Some(source) = object.color {
            state.write_color(source, Some(color));
        }
        if let Some(source) = object.depth {
            state.write_depth(source, Some(depth));
        }
        state.clears += 1;
    }

    fn blit_color(&mut self, width: u32, height: u32) {
        let mut state = self.lock();
        let (Some(read), Some(draw)) = (state.read_binding, state.draw_binding) else {
            return;
        };
        let source = state.framebuffers.get(&read).and_then(|fb| fb.color);
        let dest = state.framebuffers.get(&draw).and_then(|fb| fb.color);
        if let (Some(source), Some(dest)) = (source, dest) {
            let color = state.read_color(source);
            state.write_color(dest, color);
        }
        state.blits.push(BlitRecord {
            read,
            draw,
            width,
            height,
        });
    }

    fn invalidate(&mut self, target: FramebufferTarget, attachments: &[Attachment]) {
        let mut state = self.lock();
        let Some(fb) = state.binding(target) else {
            return;
        };
        let Some(object) = state.framebuffers.get(&fb).cloned() else {
            return;
        };
        for attachment in attachments {
            match attachment {
                Attachment::Color0 => {
                    if let Some(source) = object.color {
                        state.write_color(source, None);
                    }
                }
                Attachment::Depth => {
                    if let Some(source) = object.depth {
                        state.write_depth(source, None);
                    }
                }
            }
        }
        state.invalidations.push(InvalidateRecord {
            framebuffer: fb,
            attachments: attachments.to_vec(),
        });
    }
}

/// Headless context backend handing out `SoftwareGl` devices.
pub struct SoftwareContext {
    gl: SoftwareGl,
}

impl SoftwareContext {
    pub fn new(gl: SoftwareGl) -> Self {
        Self { gl }
    }
}

impl ContextBackend for SoftwareContext {
    fn label(&self) -> &'static str {
        "Software"
    }

    fn binding(&self) -> GraphicsBinding {
        GraphicsBinding::Headless
    }

    fn api_version(&self) -> ApiVersion {
        ApiVersion::new(3, 2)
    }

    fn make_current(&self) -> Result<(), GraphicsError> {
        self.gl.lock().current = true;
        Ok(())
    }

    fn release_current(&self) -> Result<(), GraphicsError> {
        self.gl.lock().current = false;
        Ok(())
    }

    fn load_device(&self) -> Result<Box<dyn GlDevice>, GraphicsError> {
        Ok(Box::new(self.gl.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::formats::GL_DEPTH_COMPONENT24;

    fn msaa_target(gl: &mut SoftwareGl, samples: u32) -> (GlName, GlName, GlName) {
        let color = gl.create_renderbuffer();
        gl.renderbuffer_storage(color, 0x8058, samples, 64, 64);
        let depth = gl.create_renderbuffer();
        gl.renderbuffer_storage(depth, GL_DEPTH_COMPONENT24, samples, 64, 64);
        let fb = gl.create_framebuffer();
        gl.bind_framebuffer(FramebufferTarget::Draw, Some(fb));
        gl.attach_renderbuffer(FramebufferTarget::Draw, Attachment::Color0, color);
        gl.attach_renderbuffer(FramebufferTarget::Draw, Attachment::Depth, depth);
        (fb, color, depth)
    }

    #[test]
    fn mismatched_sample_counts_are_incomplete() {
        let mut gl = SoftwareGl::new();
        let (_, _, depth) = msaa_target(&mut gl, 4);
        assert!(gl.check_status(FramebufferTarget::Draw).is_complete());

        gl.set_renderbuffer_samples(depth, 2);
        assert_eq!(
            gl.check_status(FramebufferTarget::Draw),
            FramebufferStatus::IncompleteMultisample
        );
    }

    #[test]
    fn clear_then_blit_copies_color_only() {
        let mut gl = SoftwareGl::new();
        let (msaa_fb, _, depth) = msaa_target(&mut gl, 4);
        gl.clear([1.0, 0.0, 0.0, 1.0], 0.5);
        assert_eq!(gl.renderbuffer_depth(depth), Some(0.5));

        let texture = gl.allocate_texture(64, 64, 1);
        let resolve_fb = gl.create_framebuffer();
        gl.bind_framebuffer(FramebufferTarget::Draw, Some(resolve_fb));
        gl.attach_texture(FramebufferTarget::Draw, Attachment::Color0, texture);
        gl.bind_framebuffer(FramebufferTarget::Read, Some(msaa_fb));
        gl.blit_color(64, 64);

        assert_eq!(gl.texture_color(texture, 0), Some([1.0, 0.0, 0.0, 1.0]));
        assert_eq!(gl.blits().len(), 1);
    }

    #[test]
    fn multiview_attach_ignored_without_extension() {
        let mut gl = SoftwareGl::with_capabilities(GlCapabilities {
            multiview: false,
            max_samples: 4,
        });
        let texture = gl.allocate_texture(32, 32, 2);
        let fb = gl.create_framebuffer();
        gl.bind_framebuffer(FramebufferTarget::Draw, Some(fb));
        gl.attach_texture_multiview(FramebufferTarget::Draw, Attachment::Color0, texture, 0, 2);

        assert_eq!(
            gl.check_status(FramebufferTarget::Draw),
            FramebufferStatus::IncompleteMissingAttachment
        );
    }
}
