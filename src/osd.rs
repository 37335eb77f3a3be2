use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, info, warn};

// --- OSD helper supervision ---------------------------------------------------
//
// The on-screen lyrics renderer is an external program that connects back to
// our lyrics stream. At most one instance runs at a time.
//
// States: NotRunning -> Starting -> Running -> Stopping -> NotRunning.
// Starting and Stopping happen under the write lock. Outside an explicit stop,
// only the exit watcher clears Running, and only for its own generation.

/// Grace period between SIGINT and SIGKILL.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(3);

/// Directory next to our executable that may carry a bundled helper.
pub const BUNDLED_SUBDIR: &str = "osdlyric";

const DEFAULT_DISPLAY: &str = ":0";
const FORCED_GDK_BACKEND: &str = "x11";

/// Finds the helper: first in the bundled dir, then on PATH.
#[derive(Debug, Clone)]
pub struct HelperLocator {
    bundled_dir: Option<PathBuf>,
    program: String,
}

impl HelperLocator {
    /// Looks in `<dir of current exe>/osdlyric` before PATH.
    pub fn new(program: impl Into<String>) -> Self {
        let bundled_dir = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(BUNDLED_SUBDIR)));
        Self {
            bundled_dir,
            program: program.into(),
        }
    }

    pub fn with_bundled_dir(bundled_dir: impl Into<PathBuf>, program: impl Into<String>) -> Self {
        Self {
            bundled_dir: Some(bundled_dir.into()),
            program: program.into(),
        }
    }

    pub fn locate(&self) -> anyhow::Result<PathBuf> {
        if let Some(dir) = &self.bundled_dir {
            let candidate = dir.join(&self.program);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
        which::which(&self.program).map_err(|e| {
            anyhow!(
                "OSD helper {:?} not found in the bundled directory or on PATH: {e}",
                self.program
            )
        })
    }
}

/// Signals are delivered by the exit watcher, which owns the `Child`, so a
/// pid is never signalled after it has been reaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopRequest {
    Interrupt,
    Kill,
}

struct RunningHelper {
    pid: u32,
    generation: u64,
    control: mpsc::UnboundedSender<StopRequest>,
    exited: watch::Receiver<bool>,
}

impl RunningHelper {
    /// Asks the watcher to SIGINT the child. Ignored once the child is gone.
    fn interrupt(&self) {
        let _ = self.control.send(StopRequest::Interrupt);
    }

    /// Asks the watcher to SIGKILL the child.
    fn force_kill(&self) {
        let _ = self.control.send(StopRequest::Kill);
    }

    /// True once the watcher has reaped the child.
    async fn wait_exit(&self, limit: Option<Duration>) -> bool {
        let mut exited = self.exited.clone();
        let wait = async move {
            // A closed channel means the watcher is gone, which only happens after exit.
            let _ = exited.wait_for(|done| *done).await;
        };
        match limit {
            Some(limit) => tokio::time::timeout(limit, wait).await.is_ok(),
            None => {
                wait.await;
                true
            }
        }
    }
}

type Slot = Arc<RwLock<Option<RunningHelper>>>;

pub struct OsdSupervisor {
    locator: HelperLocator,
    slot: Slot,
    next_generation: AtomicU64,
}

impl OsdSupervisor {
    pub fn new(locator: HelperLocator) -> Self {
        Self {
            locator,
            slot: Arc::new(RwLock::new(None)),
            next_generation: AtomicU64::new(0),
        }
    }

    pub async fn set_enabled(&self, enabled: bool) -> anyhow::Result<()> {
        if enabled {
            self.start().await
        } else {
            self.stop().await;
            Ok(())
        }
    }

    /// True while a helper handle is held (as last observed by the watcher).
    pub async fn is_enabled(&self) -> bool {
        self.slot.read().await.is_some()
    }

    pub async fn pid(&self) -> Option<u32> {
        self.slot.read().await.as_ref().map(|h| h.pid)
    }

    async fn start(&self) -> anyhow::Result<()> {
        let mut slot = self.slot.write().await;

        if let Some(old) = slot.take() {
            info!("osd: replacing running helper pid {}", old.pid);
            old.force_kill();
            old.wait_exit(None).await;
        }

        let path = self.locator.locate()?;
        let mut cmd = Command::new(&path);
        apply_display_env(&mut cmd, std::env::var_os("DISPLAY").is_some());
        cmd.stdin(Stdio::null());

        let child = cmd
            .spawn()
            .with_context(|| format!("failed to start OSD helper {}", path.display()))?;
        let pid = child.id().unwrap_or_default();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (exited_tx, exited_rx) = watch::channel(false);

        *slot = Some(RunningHelper {
            pid,
            generation,
            control: control_tx,
            exited: exited_rx,
        });
        drop(slot);

        info!("osd: started {} (pid {pid})", path.display());
        tokio::spawn(watch_helper(child, control_rx, exited_tx, self.slot.clone(), generation));
        Ok(())
    }

    /// SIGINT, then up to [`STOP_TIMEOUT`] for exit, then SIGKILL. No-op when idle.
    async fn stop(&self) {
        let mut slot = self.slot.write().await;
        let Some(helper) = slot.take() else {
            debug!("osd: stop requested but no helper is running");
            return;
        };

        info!("osd: stopping helper pid {}", helper.pid);
        helper.interrupt();

        if !helper.wait_exit(Some(STOP_TIMEOUT)).await {
            warn!("osd: helper pid {} ignored interrupt, killing", helper.pid);
            helper.force_kill();
            helper.wait_exit(None).await;
        }
        info!("osd: helper stopped");
    }
}

/// Injects a default display when none is set and pins the GTK backend.
fn apply_display_env(cmd: &mut Command, has_display: bool) {
    if !has_display {
        info!("osd: DISPLAY not set, defaulting to {DEFAULT_DISPLAY}");
        cmd.env("DISPLAY", DEFAULT_DISPLAY);
    }
    cmd.env("GDK_BACKEND", FORCED_GDK_BACKEND);
}

async fn watch_helper(
    mut child: Child,
    mut control: mpsc::UnboundedReceiver<StopRequest>,
    exited: watch::Sender<bool>,
    slot: Slot,
    generation: u64,
) {
    let status = loop {
        let request = tokio::select! {
            status = child.wait() => break status,
            request = control.recv() => request,
        };
        // Until `wait` has returned the child is unreaped, so its pid is still ours.
        let interrupted = match (request, child.id()) {
            (Some(StopRequest::Interrupt), Some(pid)) => match send_interrupt(pid) {
                Ok(()) => true,
                Err(e) => {
                    warn!("osd: interrupt failed, killing instead: {e:#}");
                    false
                }
            },
            // A dropped handle also lands here: losing it means killing the child.
            _ => false,
        };
        if !interrupted {
            if let Err(e) = child.start_kill() {
                warn!("osd: kill failed: {e}");
            }
            break child.wait().await;
        }
    };
    match status {
        Ok(status) => info!("osd: helper exited ({status})"),
        Err(e) => warn!("osd: failed to wait for helper: {e}"),
    }
    exited.send_replace(true);

    let mut slot = slot.write().await;
    if slot.as_ref().is_some_and(|h| h.generation == generation) {
        *slot = None;
        info!("osd: helper gone, marked not running");
    }
}

#[cfg(unix)]
fn send_interrupt(pid: u32) -> anyhow::Result<()> {
    let pid = libc::pid_t::try_from(pid).context("pid out of range")?;
    if pid <= 0 {
        anyhow::bail!("helper has no pid");
    }
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(pid, libc::SIGINT) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error()).context("SIGINT failed");
    }
    Ok(())
}

#[cfg(not(unix))]
fn send_interrupt(_pid: u32) -> anyhow::Result<()> {
    anyhow::bail!("interrupt signals are not supported on this platform")
}
