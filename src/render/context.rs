use crate::render::GlDevice;
use once_cell::unsync::OnceCell;
use std::fmt;
use thiserror::Error;

/// Handles the runtime needs to bind a session to the application's GL context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphicsBinding {
    Egl {
        display: usize,
        config: usize,
        context: usize,
    },
    Headless,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ApiVersion {
    pub major: u32,
    pub minor: u32,
}

impl ApiVersion {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// `major * 100 + minor`, the encoding runtime graphics requirements use.
    pub fn packed(self) -> u32 {
        self.major * 100 + self.minor
    }
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[derive(Debug, Error)]
pub enum GraphicsError {
    #[error("no display available")]
    NoDisplay,
    #[error("no framebuffer config matches the requested attributes")]
    NoConfig,
    #[error("{call} failed: {name} ({code:#x})")]
    Egl {
        call: &'static str,
        code: i32,
        name: &'static str,
    },
    #[error("{0}")]
    Backend(String),
}

/// A created platform context. Exists only once the lazy `GraphicsContext` has been touched.
pub trait ContextBackend {
    fn label(&self) -> &'static str;
    fn binding(&self) -> GraphicsBinding;
    fn api_version(&self) -> ApiVersion;
    fn make_current(&self) -> Result<(), GraphicsError>;
    fn release_current(&self) -> Result<(), GraphicsError>;
    fn load_device(&self) -> Result<Box<dyn GlDevice>, GraphicsError>;
}

type ContextFactory = Box<dyn Fn() -> Result<Box<dyn ContextBackend>, GraphicsError> + Send>;

/// Render-thread graphics context, created on first use and torn down by `shutdown`.
pub struct GraphicsContext {
    factory: ContextFactory,
    backend: OnceCell<Box<dyn ContextBackend>>,
}

impl GraphicsContext {
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn() -> Result<Box<dyn ContextBackend>, GraphicsError> + Send + 'static,
    {
        Self {
            factory: Box::new(factory),
            backend: OnceCell::new(),
        }
    }

    pub fn backend(&self) -> Result<&dyn ContextBackend, GraphicsError> {
        self.backend
            .get_or_try_init(|| {
                let backend = (self.factory)()?;
                log::info!(
                    "[gl] {} context created, API {}",
                    backend.label(),
                    backend.api_version()
                );
                Ok(backend)
            })
            .map(|backend| backend.as_ref())
    }

    pub fn is_created(&self) -> bool {
        self.backend.get().is_some()
    }

    pub fn binding(&self) -> Result<GraphicsBinding, GraphicsError> {
        Ok(self.backend()?.binding())
    }

    pub fn api_version(&self) -> Result<ApiVersion, GraphicsError> {
        Ok(self.backend()?.api_version())
    }

    pub fn make_current(&self) -> Result<(), GraphicsError> {
        self.backend()?.make_current()
    }

    /// Releasing a context that was never created is a no-op.
    pub fn release_current(&self) -> Result<(), GraphicsError> {
        match self.backend.get() {
            Some(backend) => backend.release_current(),
            None => Ok(()),
        }
    }

    pub fn load_device(&self) -> Result<Box<dyn GlDevice>, GraphicsError> {
        self.backend()?.load_device()
    }

    pub fn shutdown(&mut self) {
        if let Some(backend) = self.backend.take() {
            if let Err(err) = backend.release_current() {
                log::warn!("[gl] release on shutdown failed: {err}");
            }
            log::debug!("[gl] {} context destroyed", backend.label());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::software::{SoftwareContext, SoftwareGl};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_context(created: Arc<AtomicUsize>, gl: SoftwareGl) -> GraphicsContext {
        GraphicsContext::new(move || {
            created.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(SoftwareContext::new(gl.clone())) as Box<dyn ContextBackend>)
        })
    }

    #[test]
    fn context_is_created_once_on_first_use() {
        let created = Arc::new(AtomicUsize::new(0));
        let context = counting_context(Arc::clone(&created), SoftwareGl::new());
        assert!(!context.is_created());

        context.make_current().expect("make current");
        context.make_current().expect("make current again");
        context.binding().expect("binding");

        assert!(context.is_created());
        assert_eq!(created.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn release_before_creation_is_noop() {
        let created = Arc::new(AtomicUsize::new(0));
        let context = counting_context(Arc::clone(&created), SoftwareGl::new());

        context.release_current().expect("release");
        assert_eq!(created.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn shutdown_releases_and_is_idempotent() {
        let gl = SoftwareGl::new();
        let mut context = counting_context(Arc::new(AtomicUsize::new(0)), gl.clone());
        context.make_current().expect("make current");
        assert!(gl.is_current());

        context.shutdown();
        context.shutdown();

        assert!(!gl.is_current());
        assert!(!context.is_created());
    }

    #[test]
    fn factory_failure_surfaces_and_leaves_context_uncreated() {
        let context = GraphicsContext::new(|| Err(GraphicsError::NoDisplay));
        let err = context.make_current().unwrap_err();
        assert!(matches!(err, GraphicsError::NoDisplay));
        assert!(!context.is_created());
    }
}
