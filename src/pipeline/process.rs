//! Bounded subprocess execution with fully drained output pipes.
//!
//! The renderer is treated as unreliable: it may hang, flood its output, or
//! leave grandchildren holding the pipes open. [`run_bounded`] therefore
//!
//! - closes stdin,
//! - drains stdout and stderr on their own tasks from the moment the child
//!   starts, so a chatty child never blocks on a full pipe,
//! - waits at most [`ProcessSpec::timeout`], then kills and reaps the child,
//! - on unix, starts the child as leader of its own process group and
//!   SIGKILLs that group once the child is gone, so helpers it forked
//!   (a headless browser, say) never outlive the run,
//! - gives the drain tasks a short grace period after exit before
//!   abandoning them.
//!
//! The group kill also fires from `Drop`, which covers a caller whose
//! future is cancelled mid-render.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Bytes of each stream kept for diagnostics. Reading continues past this.
pub const MAX_CAPTURE_BYTES: usize = 64 * 1024;

/// How long to wait for pipe readers once the child is gone.
const PIPE_GRACE: Duration = Duration::from_secs(2);

/// What to run.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub workdir: Option<PathBuf>,
    pub timeout: Duration,
}

/// How the process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessExit {
    /// Exited on its own.
    Exited(ExitStatus),
    /// Exceeded the timeout and was killed.
    TimedOut,
}

/// Structured result of one bounded run.
#[derive(Debug, Clone)]
pub struct ProcessReport {
    pub exit: ProcessExit,
    /// Captured stdout (at most [`MAX_CAPTURE_BYTES`]).
    pub stdout: Vec<u8>,
    /// Captured stderr (at most [`MAX_CAPTURE_BYTES`]).
    pub stderr: Vec<u8>,
    pub elapsed: Duration,
}

impl ProcessReport {
    pub fn success(&self) -> bool {
        matches!(self.exit, ProcessExit::Exited(status) if status.success())
    }

    /// Exit code, if the process exited normally.
    pub fn code(&self) -> Option<i32> {
        match self.exit {
            ProcessExit::Exited(status) => status.code(),
            ProcessExit::TimedOut => None,
        }
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim().to_string()
    }
}

/// Run `spec` to completion or timeout.
///
/// # Errors
/// Only when the process cannot be spawned or waited on; a non-zero exit
/// or a timeout is reported in [`ProcessReport::exit`].
pub async fn run_bounded(spec: &ProcessSpec) -> std::io::Result<ProcessReport> {
    let start = Instant::now();
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &spec.workdir {
        cmd.current_dir(dir);
    }
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn()?;
    #[cfg(unix)]
    let mut group = ProcessGroup::led_by(child.id());
    debug!(
        "Spawned {} (pid {:?}) with {} arg(s)",
        spec.program.display(),
        child.id(),
        spec.args.len()
    );

    let stdout = child.stdout.take().map(|s| tokio::spawn(drain(s)));
    let stderr = child.stderr.take().map(|s| tokio::spawn(drain(s)));

    let waited = timeout(spec.timeout, child.wait()).await;
    let exit = match waited {
        Ok(status) => ProcessExit::Exited(status?),
        Err(_) => {
            warn!(
                "{} exceeded {:?}; killing pid {:?}",
                spec.program.display(),
                spec.timeout,
                child.id()
            );
            #[cfg(unix)]
            group.kill();
            // `kill` also reaps the child. An error here means it exited on
            // its own between the timeout and the signal.
            if let Err(e) = child.kill().await {
                debug!("kill after timeout: {}", e);
            }
            ProcessExit::TimedOut
        }
    };
    // Anything the renderer left behind goes too, and with it any
    // lingering holders of the pipes.
    #[cfg(unix)]
    group.kill();

    let stdout = collect(stdout).await;
    let stderr = collect(stderr).await;

    Ok(ProcessReport {
        exit,
        stdout,
        stderr,
        elapsed: start.elapsed(),
    })
}

/// The child's process group. SIGKILLed by [`ProcessGroup::kill`], or on
/// drop if that never ran.
#[cfg(unix)]
struct ProcessGroup(Option<nix::unistd::Pid>);

#[cfg(unix)]
impl ProcessGroup {
    /// With `process_group(0)` the group id equals the leader's pid.
    fn led_by(pid: Option<u32>) -> Self {
        let pgid = pid
            .and_then(|p| i32::try_from(p).ok())
            .map(nix::unistd::Pid::from_raw);
        Self(pgid)
    }

    /// Signals at most once.
    fn kill(&mut self) {
        use nix::errno::Errno;
        use nix::sys::signal::{killpg, Signal};

        let Some(pgid) = self.0.take() else { return };
        match killpg(pgid, Signal::SIGKILL) {
            // Nothing left in the group.
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => warn!("killpg({}) failed: {}", pgid, e),
        }
    }
}

#[cfg(unix)]
impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Read `reader` to EOF, keeping the first [`MAX_CAPTURE_BYTES`].
async fn drain<R: AsyncRead + Unpin>(mut reader: R) -> Vec<u8> {
    let mut kept = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = MAX_CAPTURE_BYTES.saturating_sub(kept.len());
                kept.extend_from_slice(&chunk[..n.min(room)]);
            }
        }
    }
    kept
}

async fn collect(task: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    let Some(mut task) = task else {
        return Vec::new();
    };
    match timeout(PIPE_GRACE, &mut task).await {
        Ok(Ok(bytes)) => bytes,
        Ok(Err(e)) => {
            debug!("pipe reader failed: {}", e);
            Vec::new()
        }
        Err(_) => {
            // A grandchild still holds the pipe open.
            task.abort();
            Vec::new()
        }
    }
}
