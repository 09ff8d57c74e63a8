//! `derpprobe` process supervision.
//!
//! Runs the probe once, buffers both output streams, and resolves to
//! exactly one [`ProbeOutcome`]. The deadline is the only cancellation:
//! on expiry the probe gets SIGTERM and a short grace period, then
//! `kill_on_drop` takes care of anything still running.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use derpwatch_core::ProbeConfig;

/// Name used for the probe in error messages.
pub const PROBE_LABEL: &str = "derpprobe";

/// Minimum timeout for `-once` runs; the probe's own cycle needs this long.
pub const ONCE_TIMEOUT_FLOOR: Duration = Duration::from_millis(65_000);

/// Time allowed after SIGTERM before the probe is killed outright.
const TERM_GRACE: Duration = Duration::from_secs(2);

/// Time allowed for output readers to drain after the probe exits.
const DRAIN_GRACE: Duration = Duration::from_secs(1);

const RAW_OUTPUT_FLAGS: [&str; 2] = ["-json", "--json"];
const DERP_MAP_FLAGS: [&str; 2] = ["-derp-map", "--derp-map"];
const ONCE_FLAGS: [&str; 2] = ["-once", "--once"];

/// A fully assembled probe invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeCommand {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
}

impl ProbeCommand {
    pub fn from_config(config: &ProbeConfig) -> Self {
        let args = assemble_args(&config.args, config.derp_map.as_deref(), config.raw_output);
        let timeout = effective_timeout(&args, Duration::from_millis(config.timeout_ms));
        Self {
            program: config.binary.clone(),
            args,
            timeout,
        }
    }
}

/// Terminal state of one probe run.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    /// The probe exited. Signal deaths report `-1`.
    Completed {
        exit_code: i32,
        stdout: String,
        stderr: String,
    },
    /// The deadline passed first; output is whatever arrived before it.
    TimedOut {
        timeout: Duration,
        stdout: String,
        stderr: String,
    },
    /// The probe could not be started.
    LaunchFailed { reason: String },
}

/// Whether `arg` is `flag` or `flag=<value>`.
fn is_flag(arg: &str, flags: &[&str]) -> bool {
    flags
        .iter()
        .any(|f| arg == *f || arg.strip_prefix(f).is_some_and(|rest| rest.starts_with('=')))
}

/// Build the probe's argument list from user arguments.
///
/// Structured-output flags are dropped unless the structured parser is in
/// use; `-derp-map` is added when a map is configured and not already given.
pub fn assemble_args(user_args: &[String], derp_map: Option<&str>, raw_output: bool) -> Vec<String> {
    let mut args: Vec<String> = user_args
        .iter()
        .filter(|a| raw_output || !is_flag(a, &RAW_OUTPUT_FLAGS))
        .cloned()
        .collect();

    if let Some(map) = derp_map.map(str::trim).filter(|m| !m.is_empty()) {
        if !args.iter().any(|a| is_flag(a, &DERP_MAP_FLAGS)) {
            args.push(format!("-derp-map={map}"));
        }
    }
    args
}

/// Raise the timeout to [`ONCE_TIMEOUT_FLOOR`] for single-shot runs.
pub fn effective_timeout(args: &[String], configured: Duration) -> Duration {
    let once = args.iter().any(|a| {
        ONCE_FLAGS.iter().any(|f| {
            a == f
                || a.strip_prefix(f)
                    .and_then(|rest| rest.strip_prefix('='))
                    .is_some_and(|v| v.eq_ignore_ascii_case("true") || v == "1")
        })
    });
    if once {
        configured.max(ONCE_TIMEOUT_FLOOR)
    } else {
        configured
    }
}

type Buffer = Arc<Mutex<Vec<u8>>>;

fn spawn_capture<R>(stream: &'static str, reader: Option<R>, buffer: Buffer) -> Option<JoinHandle<()>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut reader = reader?;
    Some(tokio::spawn(async move {
        let mut chunk = [0u8; 8192];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) => break,
                Err(e) => {
                    debug!(stream, error = %e, "failed to read probe output");
                    break;
                }
                Ok(n) => buffer.lock().await.extend_from_slice(&chunk[..n]),
            }
        }
    }))
}

async fn drain(handle: Option<JoinHandle<()>>, grace: Duration) {
    let Some(mut handle) = handle else {
        return;
    };
    if tokio::time::timeout(grace, &mut handle).await.is_err() {
        // A grandchild may still hold the pipe open.
        handle.abort();
    }
}

async fn take(buffer: &Buffer) -> String {
    let bytes = std::mem::take(&mut *buffer.lock().await);
    String::from_utf8_lossy(&bytes).into_owned()
}

#[cfg(unix)]
fn send_sigterm(child: &Child) -> bool {
    let Some(pid) = child.id() else {
        return false;
    };
    // SAFETY: plain syscall on a pid we spawned and have not reaped.
    unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) == 0 }
}

#[cfg(not(unix))]
fn send_sigterm(_child: &Child) -> bool {
    false
}

/// Ask the probe to stop, falling back to a hard kill.
async fn terminate(child: &mut Child) {
    if send_sigterm(child) && tokio::time::timeout(TERM_GRACE, child.wait()).await.is_ok() {
        return;
    }
    if let Err(e) = child.kill().await {
        debug!(error = %e, "failed to kill probe");
    }
}

/// Run the probe once and resolve its outcome.
pub async fn run_probe(cmd: &ProbeCommand) -> ProbeOutcome {
    debug!(program = %cmd.program, args = ?cmd.args, timeout_ms = cmd.timeout.as_millis() as u64, "launching probe");

    let mut child = match Command::new(&cmd.program)
        .args(&cmd.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            warn!(program = %cmd.program, error = %e, "failed to launch probe");
            return ProbeOutcome::LaunchFailed {
                reason: e.to_string(),
            };
        }
    };

    let stdout_buf: Buffer = Arc::default();
    let stderr_buf: Buffer = Arc::default();
    let stdout_task = spawn_capture("stdout", child.stdout.take(), stdout_buf.clone());
    let stderr_task = spawn_capture("stderr", child.stderr.take(), stderr_buf.clone());

    match tokio::time::timeout(cmd.timeout, child.wait()).await {
        Ok(Ok(status)) => {
            drain(stdout_task, DRAIN_GRACE).await;
            drain(stderr_task, DRAIN_GRACE).await;
            let exit_code = status.code().unwrap_or(-1);
            debug!(exit_code, "probe exited");
            ProbeOutcome::Completed {
                exit_code,
                stdout: take(&stdout_buf).await,
                stderr: take(&stderr_buf).await,
            }
        }
        Ok(Err(e)) => {
            warn!(error = %e, "failed to wait for probe");
            drain(stdout_task, Duration::ZERO).await;
            drain(stderr_task, Duration::ZERO).await;
            ProbeOutcome::LaunchFailed {
                reason: e.to_string(),
            }
        }
        Err(_) => {
            warn!(timeout_ms = cmd.timeout.as_millis() as u64, "probe timed out, terminating");
            terminate(&mut child).await;
            drain(stdout_task, DRAIN_GRACE).await;
            drain(stderr_task, DRAIN_GRACE).await;
            ProbeOutcome::TimedOut {
                timeout: cmd.timeout,
                stdout: take(&stdout_buf).await,
                stderr: take(&stderr_buf).await,
            }
        }
    }
}
