//! CLI binary for certpress.
//!
//! A thin shim over the library crate: `serve` runs the HTTP service,
//! `render` pushes one JSON record through the same pipeline locally.

use anyhow::{bail, Context, Result};
use certpress::{
    serve, CertificatePipeline, ImageUpload, PipelineObserver, RejectReason, RunState,
    ServiceConfig, ServiceConfigBuilder, Submission,
};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{self, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}

// ── Spinner driven by pipeline state ─────────────────────────────────────────

struct SpinnerObserver {
    bar: ProgressBar,
}

impl SpinnerObserver {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}  {elapsed:.dim}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]),
        );
        bar.set_prefix("certpress");
        bar.set_message("checking fields…");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self { bar })
    }
}

impl PipelineObserver for SpinnerObserver {
    fn on_transition(&self, _run_id: &str, _from: RunState, to: RunState) {
        match to {
            RunState::Validated => self.bar.set_message("waiting for a render slot…"),
            RunState::Staged => self.bar.set_message("inputs staged"),
            RunState::Rendering => self.bar.set_message("rendering…"),
            RunState::Succeeded => self.bar.set_message("collecting document…"),
            RunState::Failed => self.bar.set_message("failed, cleaning up…"),
            RunState::Cleaned => self.bar.finish_and_clear(),
            RunState::Received => {}
        }
    }

    fn on_upload_rejected(&self, _run_id: &str, reason: &RejectReason) {
        if *reason != RejectReason::Absent {
            self.bar
                .println(format!("  {} photo ignored: {}", yellow("⚠"), reason));
        }
    }
}

// ── Arguments ────────────────────────────────────────────────────────────────

const AFTER_HELP: &str = r#"EXAMPLES:
  # Serve the form on the default address (127.0.0.1:5000)
  certpress serve

  # Serve with a custom renderer and two render slots
  certpress serve --renderer node --renderer-arg ./html-to-pdf.js --max-concurrent-renders 2

  # Render one certificate locally
  certpress render --data form.json --photo child.jpg -o certificate.pdf

RENDERER CONTRACT:
  <renderer> <renderer-arg…> <record.json> <output>
  Exit status 0 plus a non-empty output file means success; stderr is
  logged as the diagnostic otherwise.

ENVIRONMENT VARIABLES:
  Every flag has a CERTPRESS_* variable (see --help for each).
  RUST_LOG overrides --log-level.
"#;

#[derive(Parser, Debug)]
#[command(
    name = "certpress",
    version,
    about = "Render web form submissions into certificate documents",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Default log level when RUST_LOG is unset.
    #[arg(long, global = true, env = "CERTPRESS_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines.
    #[arg(long, global = true, env = "CERTPRESS_LOG_JSON")]
    log_json: bool,

    /// Errors only; no spinner.
    #[arg(short, long, global = true, env = "CERTPRESS_QUIET")]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP service.
    Serve(ServeArgs),
    /// Render a single certificate from a JSON record.
    Render(RenderArgs),
}

/// Pipeline settings shared by both subcommands.
#[derive(Args, Debug)]
struct PipelineArgs {
    /// Renderer executable.
    #[arg(long, env = "CERTPRESS_RENDERER", default_value = "node")]
    renderer: PathBuf,

    /// Argument placed before the record and output paths (repeatable).
    #[arg(
        long = "renderer-arg",
        env = "CERTPRESS_RENDERER_ARGS",
        value_delimiter = ',',
        default_value = "html-to-pdf.js"
    )]
    renderer_args: Vec<String>,

    /// Working directory for the renderer.
    #[arg(long, env = "CERTPRESS_RENDERER_WORKDIR")]
    renderer_workdir: Option<PathBuf>,

    /// Seconds before a renderer is killed.
    #[arg(long, env = "CERTPRESS_RENDER_TIMEOUT", default_value_t = 60)]
    render_timeout: u64,

    /// Extension of the rendered document.
    #[arg(long, env = "CERTPRESS_OUTPUT_EXTENSION", default_value = "pdf")]
    output_extension: String,

    /// Directory under which each run gets a private staging directory.
    #[arg(long, env = "CERTPRESS_STAGING_ROOT")]
    staging_root: Option<PathBuf>,

    /// Accepted photo extensions.
    #[arg(
        long,
        env = "CERTPRESS_ALLOWED_EXTENSIONS",
        value_delimiter = ',',
        default_value = "png,jpg,jpeg,gif"
    )]
    allowed_extensions: Vec<String>,

    /// Trust the photo extension without sniffing its content.
    #[arg(long, env = "CERTPRESS_NO_VERIFY_IMAGE")]
    no_verify_image: bool,

    /// Request ceiling in bytes.
    #[arg(long, env = "CERTPRESS_MAX_UPLOAD_BYTES", default_value_t = 16 * 1024 * 1024)]
    max_upload_bytes: usize,
}

#[derive(Args, Debug)]
struct ServeArgs {
    #[command(flatten)]
    pipeline: PipelineArgs,

    /// Listen address.
    #[arg(long, env = "CERTPRESS_BIND", default_value = "127.0.0.1:5000")]
    bind: SocketAddr,

    /// Simultaneous renderer processes.
    #[arg(long, env = "CERTPRESS_MAX_CONCURRENT_RENDERS", default_value_t = 4)]
    max_concurrent_renders: usize,

    /// Seconds a request waits for a render slot (0 = fail fast).
    #[arg(long, env = "CERTPRESS_QUEUE_TIMEOUT", default_value_t = 30)]
    queue_timeout: u64,

    /// Key for signing flash cookies. Random per process when unset.
    #[arg(long, env = "CERTPRESS_FLASH_SECRET", hide_env_values = true)]
    flash_secret: Option<String>,
}

#[derive(Args, Debug)]
struct RenderArgs {
    #[command(flatten)]
    pipeline: PipelineArgs,

    /// JSON object with the form fields.
    #[arg(long, short = 'd')]
    data: PathBuf,

    /// Optional photo.
    #[arg(long, short = 'p')]
    photo: Option<PathBuf>,

    /// Output file. Default: the attachment name in the current directory.
    #[arg(long, short = 'o')]
    output: Option<PathBuf>,
}

impl PipelineArgs {
    fn builder(&self) -> ServiceConfigBuilder {
        let mut b = ServiceConfig::builder()
            .renderer(&self.renderer, self.renderer_args.iter().cloned())
            .render_timeout_secs(self.render_timeout)
            .output_extension(&self.output_extension)
            .allowed_extensions(&self.allowed_extensions)
            .verify_image_content(!self.no_verify_image)
            .max_upload_bytes(self.max_upload_bytes);
        if let Some(dir) = &self.renderer_workdir {
            b = b.renderer_workdir(dir);
        }
        if let Some(root) = &self.staging_root {
            b = b.staging_root(root);
        }
        b
    }
}

// ── Entry point ──────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let spinner = !cli.quiet && matches!(cli.command, Command::Render(_));
    init_tracing(&cli, spinner);

    match cli.command {
        Command::Serve(args) => run_serve(args).await,
        Command::Render(args) => run_render(args, spinner, cli.quiet).await,
    }
}

fn init_tracing(cli: &Cli, spinner: bool) {
    // The spinner gives the feedback that matters; keep INFO lines from
    // tearing through it.
    let level = if cli.quiet {
        "error"
    } else if spinner && cli.log_level == "info" {
        "warn"
    } else {
        cli.log_level.as_str()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .init();
    }
}

async fn run_serve(args: ServeArgs) -> Result<()> {
    let mut builder = args
        .pipeline
        .builder()
        .bind_addr(args.bind)
        .max_concurrent_renders(args.max_concurrent_renders)
        .queue_timeout_secs(args.queue_timeout);
    if let Some(secret) = args.flash_secret {
        builder = builder.flash_secret(secret);
    }
    let config = builder.build().context("Invalid configuration")?;
    serve(config).await.context("Server failed")?;
    Ok(())
}

async fn run_render(args: RenderArgs, spinner: bool, quiet: bool) -> Result<()> {
    let submission = load_submission(&args.data, args.photo.as_deref())?;

    let mut builder = args.pipeline.builder().max_concurrent_renders(1);
    if spinner {
        builder = builder.observer(SpinnerObserver::new() as Arc<dyn PipelineObserver>);
    }
    let config = builder.build().context("Invalid configuration")?;
    let pipeline = CertificatePipeline::new(config).context("Cannot prepare staging root")?;

    let doc = pipeline
        .generate(submission)
        .await
        .context("Certificate generation failed")?;

    let output = args
        .output
        .unwrap_or_else(|| PathBuf::from(&doc.filename));
    write_atomic(&output, &doc.bytes)?;

    if !quiet {
        eprintln!(
            "{} {}  {}  →  {}",
            green("✔"),
            bold(&doc.filename),
            dim(&format!("{} bytes, render {}ms", doc.len(), doc.render_ms)),
            bold(&output.display().to_string()),
        );
    }
    Ok(())
}

/// Build a submission from a JSON object file and an optional photo.
///
/// Non-string JSON values are stringified; `null` becomes empty.
fn load_submission(data: &Path, photo: Option<&Path>) -> Result<Submission> {
    let raw = std::fs::read(data).with_context(|| format!("Cannot read {}", data.display()))?;
    let value: serde_json::Value = serde_json::from_slice(&raw)
        .with_context(|| format!("{} is not valid JSON", data.display()))?;
    let Some(object) = value.as_object() else {
        bail!("{} must contain a JSON object of form fields", data.display());
    };

    let mut submission = Submission::new();
    for (key, v) in object {
        let text = match v {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Null => String::new(),
            other => other.to_string(),
        };
        submission = submission.with_field(key.clone(), text);
    }

    if let Some(path) = photo {
        let bytes =
            std::fs::read(path).with_context(|| format!("Cannot read photo {}", path.display()))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        submission = submission.with_image(ImageUpload::new(name, bytes));
    }
    Ok(submission)
}

/// Write via a temp file in the target directory, then rename, so a
/// half-written certificate never appears under the final name.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Cannot create {}", dir.display()))?;
    let mut tmp = tempfile::NamedTempFile::new_in(&dir)
        .with_context(|| format!("Cannot create temp file in {}", dir.display()))?;
    tmp.write_all(bytes)
        .with_context(|| format!("Cannot write {}", path.display()))?;
    tmp.persist(path)
        .with_context(|| format!("Cannot move certificate to {}", path.display()))?;
    Ok(())
}
