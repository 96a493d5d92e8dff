//! EGL pbuffer context for the render thread. The compositor owns presentation, so the surface
//! only exists to make the context current.

use crate::render::context::{ApiVersion, ContextBackend, GraphicsBinding, GraphicsError};
use crate::render::glow_device::GlowDevice;
use crate::render::GlDevice;
use khronos_egl as egl;
use std::ffi::c_void;

const EGL_OPENGL_ES3_BIT: egl::Int = 0x0040;
const PBUFFER_SIZE: egl::Int = 16;
const GL_VERSION: u32 = 0x1F02;

type GetStringFn = unsafe extern "system" fn(u32) -> *const u8;

pub struct EglContext {
    egl: egl::Instance<egl::Static>,
    display: egl::Display,
    config: egl::Config,
    context: egl::Context,
    surface: egl::Surface,
    api_version: ApiVersion,
}

fn egl_error(call: &'static str, err: egl::Error) -> GraphicsError {
    let (code, name) = match err {
        egl::Error::NotInitialized => (0x3001, "EGL_NOT_INITIALIZED"),
        egl::Error::BadAccess => (0x3002, "EGL_BAD_ACCESS"),
        egl::Error::BadAlloc => (0x3003, "EGL_BAD_ALLOC"),
        egl::Error::BadAttribute => (0x3004, "EGL_BAD_ATTRIBUTE"),
        egl::Error::BadConfig => (0x3005, "EGL_BAD_CONFIG"),
        egl::Error::BadContext => (0x3006, "EGL_BAD_CONTEXT"),
        egl::Error::BadCurrentSurface => (0x3007, "EGL_BAD_CURRENT_SURFACE"),
        egl::Error::BadDisplay => (0x3008, "EGL_BAD_DISPLAY"),
        egl::Error::BadMatch => (0x3009, "EGL_BAD_MATCH"),
        egl::Error::BadNativePixmap => (0x300A, "EGL_BAD_NATIVE_PIXMAP"),
        egl::Error::BadNativeWindow => (0x300B, "EGL_BAD_NATIVE_WINDOW"),
        egl::Error::BadParameter => (0x300C, "EGL_BAD_PARAMETER"),
        egl::Error::BadSurface => (0x300D, "EGL_BAD_SURFACE"),
        egl::Error::ContextLost => (0x300E, "EGL_CONTEXT_LOST"),
    };
    log::error!("[egl] {call} failed: {name}");
    GraphicsError::Egl { call, code, name }
}

impl EglContext {
    /// Initializes the default display and creates a GL ES 3 context with a 16x16 pbuffer.
    pub fn create() -> Result<Self, GraphicsError> {
        let egl = egl::Instance::new(egl::Static);
        // SAFETY: DEFAULT_DISPLAY is always a valid native display id.
        let display = unsafe { egl.get_display(egl::DEFAULT_DISPLAY) }
            .ok_or(GraphicsError::NoDisplay)?;
        let (major, minor) = egl
            .initialize(display)
            .map_err(|err| egl_error("eglInitialize", err))?;
        log::info!("[egl] EGL {major}.{minor}");

        let config_attribs = [
            egl::RED_SIZE,
            8,
            egl::GREEN_SIZE,
            8,
            egl::BLUE_SIZE,
            8,
            egl::ALPHA_SIZE,
            8,
            egl::DEPTH_SIZE,
            0,
            egl::STENCIL_SIZE,
            0,
            egl::SAMPLES,
            0,
            egl::RENDERABLE_TYPE,
            EGL_OPENGL_ES3_BIT,
            egl::SURFACE_TYPE,
            egl::PBUFFER_BIT,
            egl::NONE,
        ];
        let config = match egl.choose_first_config(display, &config_attribs) {
            Ok(Some(config)) => config,
            Ok(None) => {
                log::error!("[egl] no RGBA8 GL ES 3 config with pbuffer support");
                let _ = egl.terminate(display);
                return Err(GraphicsError::NoConfig);
            }
            Err(err) => {
                let _ = egl.terminate(display);
                return Err(egl_error("eglChooseConfig", err));
            }
        };
        log::debug!("[egl] config {:#x}", config.as_ptr() as usize);

        let context_attribs = [egl::CONTEXT_CLIENT_VERSION, 3, egl::NONE];
        let context = match egl.create_context(display, config, None, &context_attribs) {
            Ok(context) => context,
            Err(err) => {
                let _ = egl.terminate(display);
                return Err(egl_error("eglCreateContext", err));
            }
        };

        let surface_attribs = [egl::WIDTH, PBUFFER_SIZE, egl::HEIGHT, PBUFFER_SIZE, egl::NONE];
        let surface = match egl.create_pbuffer_surface(display, config, &surface_attribs) {
            Ok(surface) => surface,
            Err(err) => {
                let _ = egl.destroy_context(display, context);
                let _ = egl.terminate(display);
                return Err(egl_error("eglCreatePbufferSurface", err));
            }
        };

        let mut created = Self {
            egl,
            display,
            config,
            context,
            surface,
            api_version: ApiVersion::new(3, 0),
        };
        created.make_current()?;
        created.api_version = created.query_api_version();
        Ok(created)
    }

    fn proc_address(&self, name: &str) -> *const c_void {
        self.egl
            .get_proc_address(name)
            .map_or(std::ptr::null(), |f| f as *const c_void)
    }

    /// Reads `GL_VERSION` ("OpenGL ES 3.2 ...") from the current context.
    fn query_api_version(&self) -> ApiVersion {
        let ptr = self.proc_address("glGetString");
        if ptr.is_null() {
            return self.api_version;
        }
        // SAFETY: glGetString has this signature and the context is current.
        let version = unsafe {
            let get_string = std::mem::transmute::<*const c_void, GetStringFn>(ptr);
            let raw = get_string(GL_VERSION);
            if raw.is_null() {
                return self.api_version;
            }
            std::ffi::CStr::from_ptr(raw.cast()).to_string_lossy().into_owned()
        };
        log::info!("[egl] GL_VERSION {version}");
        parse_es_version(&version).unwrap_or(self.api_version)
    }
}

fn parse_es_version(version: &str) -> Option<ApiVersion> {
    let numbers = version.strip_prefix("OpenGL ES ")?;
    let numbers = numbers.split_whitespace().next()?;
    let (major, minor) = numbers.split_once('.')?;
    Some(ApiVersion::new(major.parse().ok()?, minor.parse().ok()?))
}

impl ContextBackend for EglContext {
    fn label(&self) -> &'static str {
        "EGL"
    }

    fn binding(&self) -> GraphicsBinding {
        GraphicsBinding::Egl {
            display: self.display.as_ptr() as usize,
            config: self.config.as_ptr() as usize,
            context: self.context.as_ptr() as usize,
        }
    }

    fn api_version(&self) -> ApiVersion {
        self.api_version
    }

    fn make_current(&self) -> Result<(), GraphicsError> {
        self.egl
            .make_current(
                self.display,
                Some(self.surface),
                Some(self.surface),
                Some(self.context),
            )
            .map_err(|err| egl_error("eglMakeCurrent", err))
    }

    fn release_current(&self) -> Result<(), GraphicsError> {
        self.egl
            .make_current(self.display, None, None, None)
            .map_err(|err| egl_error("eglMakeCurrent", err))
    }

    fn load_device(&self) -> Result<Box<dyn GlDevice>, GraphicsError> {
        // SAFETY: `make_current` ran during creation and the render thread keeps it current.
        let device = unsafe { GlowDevice::load(|name| self.proc_address(name)) };
        Ok(Box::new(device))
    }
}

impl Drop for EglContext {
    fn drop(&mut self) {
        let _ = self.egl.make_current(self.display, None, None, None);
        if let Err(err) = self.egl.destroy_surface(self.display, self.surface) {
            log::warn!("[egl] eglDestroySurface failed: {err}");
        }
        if let Err(err) = self.egl.destroy_context(self.display, self.context) {
            log::warn!("[egl] eglDestroyContext failed: {err}");
        }
        if let Err(err) = self.egl.terminate(self.display) {
            log::warn!("[egl] eglTerminate failed: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_es_version_strings() {
        assert_eq!(
            parse_es_version("OpenGL ES 3.2 V@0502.0"),
            Some(ApiVersion::new(3, 2))
        );
        assert_eq!(parse_es_version("OpenGL ES 3.0"), Some(ApiVersion::new(3, 0)));
        assert_eq!(parse_es_version("4.6 Core"), None);
    }
}
