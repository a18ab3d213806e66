//! Configuration for the certificate pipeline and its HTTP adapter.
//!
//! Every knob lives in [`ServiceConfig`], built via
//! [`ServiceConfigBuilder`]. The config is passed explicitly into
//! [`crate::generate::CertificatePipeline::new`]; nothing reads ambient
//! process-wide state after construction.

use crate::error::CertError;
use crate::progress::PipelineObserver;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for the certificate service.
///
/// # Example
/// ```rust
/// use certpress::ServiceConfig;
///
/// let config = ServiceConfig::builder()
///     .render_timeout_secs(30)
///     .max_concurrent_renders(2)
///     .renderer("node", ["html-to-pdf.js"])
///     .build()
///     .unwrap();
/// assert_eq!(config.render_timeout_secs, 30);
/// ```
#[derive(Clone)]
pub struct ServiceConfig {
    /// Address the HTTP service binds to. Default: `127.0.0.1:5000`.
    pub bind_addr: SocketAddr,

    /// Request ceiling in bytes, covering text fields and the image.
    /// Default: 16 MiB.
    pub max_upload_bytes: usize,

    /// Lower-case image extensions the upload guard accepts.
    /// Default: png, jpg, jpeg, gif.
    pub allowed_extensions: Vec<String>,

    /// Also require the upload's leading bytes to sniff as PNG, JPEG or GIF.
    /// Default: true.
    pub verify_image_content: bool,

    /// Wall-clock limit for one renderer invocation. Default: 60.
    pub render_timeout_secs: u64,

    /// Renderer executable. Default: `node`.
    pub renderer_program: PathBuf,

    /// Arguments placed before the two positional paths.
    /// Default: `["html-to-pdf.js"]`.
    pub renderer_args: Vec<String>,

    /// Working directory for the renderer. Default: inherit.
    pub renderer_workdir: Option<PathBuf>,

    /// Extension of the rendered document, without the dot. Default: `pdf`.
    pub output_extension: String,

    /// Root under which every run gets a private directory.
    /// Default: `$TMPDIR/certpress`.
    pub staging_root: PathBuf,

    /// Maximum simultaneous renderer processes. Default: 4.
    pub max_concurrent_renders: usize,

    /// How long a run waits for a render slot before failing with
    /// [`CertError::Busy`]. `0` rejects immediately. Default: 30.
    pub queue_timeout_secs: u64,

    /// Key material for signing flash-message cookies. Not security
    /// critical. Default: random per process.
    pub flash_secret: String,

    /// Receives state-machine transitions for every run.
    pub observer: Option<Arc<dyn PipelineObserver>>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 5000)),
            max_upload_bytes: 16 * 1024 * 1024,
            allowed_extensions: ["png", "jpg", "jpeg", "gif"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            verify_image_content: true,
            render_timeout_secs: 60,
            renderer_program: PathBuf::from("node"),
            renderer_args: vec!["html-to-pdf.js".to_string()],
            renderer_workdir: None,
            output_extension: "pdf".to_string(),
            staging_root: std::env::temp_dir().join("certpress"),
            max_concurrent_renders: 4,
            queue_timeout_secs: 30,
            flash_secret: uuid::Uuid::new_v4().simple().to_string(),
            observer: None,
        }
    }
}

impl fmt::Debug for ServiceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceConfig")
            .field("bind_addr", &self.bind_addr)
            .field("max_upload_bytes", &self.max_upload_bytes)
            .field("allowed_extensions", &self.allowed_extensions)
            .field("verify_image_content", &self.verify_image_content)
            .field("render_timeout_secs", &self.render_timeout_secs)
            .field("renderer_program", &self.renderer_program)
            .field("renderer_args", &self.renderer_args)
            .field("renderer_workdir", &self.renderer_workdir)
            .field("output_extension", &self.output_extension)
            .field("staging_root", &self.staging_root)
            .field("max_concurrent_renders", &self.max_concurrent_renders)
            .field("queue_timeout_secs", &self.queue_timeout_secs)
            .field("flash_secret", &"<redacted>")
            .field("observer", &self.observer.as_ref().map(|_| "<dyn PipelineObserver>"))
            .finish()
    }
}

impl ServiceConfig {
    /// Create a new builder for `ServiceConfig`.
    pub fn builder() -> ServiceConfigBuilder {
        ServiceConfigBuilder {
            config: Self::default(),
        }
    }

    pub fn render_timeout(&self) -> Duration {
        Duration::from_secs(self.render_timeout_secs)
    }

    pub fn queue_timeout(&self) -> Duration {
        Duration::from_secs(self.queue_timeout_secs)
    }

    /// Case-insensitive membership test against the extension allow-set.
    pub fn is_allowed_extension(&self, ext: &str) -> bool {
        let ext = ext.to_ascii_lowercase();
        self.allowed_extensions.iter().any(|allowed| *allowed == ext)
    }
}

/// Builder for [`ServiceConfig`].
#[derive(Debug)]
pub struct ServiceConfigBuilder {
    config: ServiceConfig,
}

impl ServiceConfigBuilder {
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.config.bind_addr = addr;
        self
    }

    pub fn max_upload_bytes(mut self, bytes: usize) -> Self {
        self.config.max_upload_bytes = bytes.max(1024);
        self
    }

    pub fn allowed_extensions<I, S>(mut self, exts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.config.allowed_extensions = exts
            .into_iter()
            .map(|e| e.as_ref().trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|e| !e.is_empty())
            .collect();
        self
    }

    pub fn verify_image_content(mut self, v: bool) -> Self {
        self.config.verify_image_content = v;
        self
    }

    pub fn render_timeout_secs(mut self, secs: u64) -> Self {
        self.config.render_timeout_secs = secs.max(1);
        self
    }

    /// Set the renderer executable and the arguments placed before the
    /// input/output paths.
    pub fn renderer<I, S>(mut self, program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.renderer_program = program.into();
        self.config.renderer_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn renderer_workdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.renderer_workdir = Some(dir.into());
        self
    }

    pub fn output_extension(mut self, ext: impl Into<String>) -> Self {
        self.config.output_extension = ext.into().trim_start_matches('.').to_ascii_lowercase();
        self
    }

    pub fn staging_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.config.staging_root = root.into();
        self
    }

    pub fn max_concurrent_renders(mut self, n: usize) -> Self {
        self.config.max_concurrent_renders = n.max(1);
        self
    }

    pub fn queue_timeout_secs(mut self, secs: u64) -> Self {
        self.config.queue_timeout_secs = secs;
        self
    }

    pub fn flash_secret(mut self, secret: impl Into<String>) -> Self {
        self.config.flash_secret = secret.into();
        self
    }

    pub fn observer(mut self, observer: Arc<dyn PipelineObserver>) -> Self {
        self.config.observer = Some(observer);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ServiceConfig, CertError> {
        let c = &self.config;
        if c.allowed_extensions.is_empty() {
            return Err(CertError::InvalidConfig(
                "At least one image extension must be allowed".into(),
            ));
        }
        if c.output_extension.is_empty()
            || !c.output_extension.chars().all(|ch| ch.is_ascii_alphanumeric())
        {
            return Err(CertError::InvalidConfig(format!(
                "Output extension must be non-empty ASCII alphanumerics, got '{}'",
                c.output_extension
            )));
        }
        if c.renderer_program.as_os_str().is_empty() {
            return Err(CertError::InvalidConfig("Renderer program is empty".into()));
        }
        if c.flash_secret.is_empty() {
            return Err(CertError::InvalidConfig("Flash secret is empty".into()));
        }
        Ok(self.config)
    }
}
