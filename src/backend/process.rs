//! Process controller - owns one engine child process
//!
//! The controller captures stdout and stderr of the child line by line,
//! retains a bounded ring of recent lines for late joiners and fans live
//! lines out to subscribers without ever blocking on them. Stopping sends
//! SIGTERM, waits for the child to exit and escalates to SIGKILL when the
//! grace period runs out.

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};

/// Capacity of each subscriber channel. A subscriber that falls this many
/// lines behind starts losing lines, never slowing the capture task down.
pub const SUBSCRIBER_CAPACITY: usize = 100;

type OnStop = Arc<dyn Fn() + Send + Sync>;

/// Identifies one spawned child across the controller's lifetime. The
/// generation guards against a concurrent restart swapping the child out
/// between a signal and the matching cleanup.
#[derive(Clone)]
struct ChildHandle {
    pid: i32,
    generation: u64,
    exit: Arc<ExitSignal>,
}

struct ExitSignal {
    done: AtomicBool,
    notify: Notify,
}

impl ExitSignal {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            done: AtomicBool::new(false),
            notify: Notify::new(),
        })
    }

    fn set(&self) {
        self.done.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    async fn wait(&self) {
        loop {
            if self.done.load(Ordering::SeqCst) {
                return;
            }
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.done.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }
}

struct LogState {
    buffer: VecDeque<String>,
    subscribers: Vec<mpsc::Sender<String>>,
}

struct Shared {
    log_buffer_size: usize,
    logs: Mutex<LogState>,
    child: Mutex<Option<ChildHandle>>,
    on_stop: Mutex<Option<OnStop>>,
}

impl Shared {
    fn process_line(&self, line: String) {
        debug!(target: "engine", "{}", line);
        let mut logs = self.logs.lock();
        logs.buffer.push_back(line.clone());
        if logs.buffer.len() > self.log_buffer_size {
            logs.buffer.pop_front();
        }
        logs.subscribers.retain(|tx| match tx.try_send(line.clone()) {
            Ok(()) => true,
            // Full channel: the line is dropped for this subscriber only.
            Err(mpsc::error::TrySendError::Full(_)) => true,
            // Receiver went away: prune the subscription.
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    fn clear_child_if(&self, generation: u64) {
        let mut child = self.child.lock();
        if child
            .as_ref()
            .map(|h| h.generation == generation)
            .unwrap_or(false)
        {
            *child = None;
        }
    }
}

/// Supervises at most one child process at a time.
pub struct ProcessController {
    shared: Arc<Shared>,
    stop_timeout: Duration,
    next_generation: AtomicU64,
    restarting: AtomicBool,
}

impl ProcessController {
    pub fn new(log_buffer_size: usize, stop_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                log_buffer_size,
                logs: Mutex::new(LogState {
                    buffer: VecDeque::with_capacity(log_buffer_size),
                    subscribers: Vec::new(),
                }),
                child: Mutex::new(None),
                on_stop: Mutex::new(None),
            }),
            stop_timeout,
            next_generation: AtomicU64::new(0),
            restarting: AtomicBool::new(false),
        }
    }

    /// Install the callback invoked when the supervised process leaves the
    /// running state. Replaces any previously installed callback.
    pub fn set_on_stop<F: Fn() + Send + Sync + 'static>(&self, f: F) {
        *self.shared.on_stop.lock() = Some(Arc::new(f));
    }

    /// Spawn the command and begin capturing its output.
    ///
    /// Stdout and stderr are always piped. If the caller configured a piped
    /// stdin it is handed back for config delivery. Fails with
    /// [`Error::ProcessAlreadyRunning`] when a child is already supervised.
    pub fn setup_cmd(&self, mut cmd: Command) -> Result<Option<ChildStdin>> {
        if self.is_running() {
            error!("process already running");
            return Err(Error::ProcessAlreadyRunning);
        }

        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        let mut child = cmd
            .spawn()
            .map_err(|e| Error::Process(format!("failed to start process: {}", e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Process("failed to get stdout pipe".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Process("failed to get stderr pipe".to_string()))?;
        let stdin = child.stdin.take();

        let pid = child
            .id()
            .ok_or_else(|| Error::Process("process exited before supervision".to_string()))?
            as i32;

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let handle = ChildHandle {
            pid,
            generation,
            exit: ExitSignal::new(),
        };

        *self.shared.child.lock() = Some(handle.clone());

        let shared = self.shared.clone();
        tokio::spawn(capture_process_logs(shared, child, stdout, stderr, handle));

        info!("process started");
        Ok(stdin)
    }

    /// Authoritative liveness: true iff a child handle is recorded.
    pub fn is_running(&self) -> bool {
        self.shared.child.lock().is_some()
    }

    /// Forward an arbitrary signal to the child (SIGHUP for reloads).
    pub fn reload(&self, signal: Signal) -> Result<()> {
        let child = self.shared.child.lock();
        let handle = child.as_ref().ok_or(Error::ProcessNotRunning)?;
        kill(Pid::from_raw(handle.pid), signal)
            .map_err(|e| Error::Process(format!("failed to reload process: {}", e)))
    }

    /// Stop the child: SIGTERM, wait up to the grace period, SIGKILL.
    ///
    /// The recorded handle is cleared only if it still refers to the child
    /// that was signalled.
    pub async fn stop(&self) -> Result<()> {
        let handle = {
            let child = self.shared.child.lock();
            match child.as_ref() {
                Some(h) => h.clone(),
                None => {
                    error!("process not running");
                    return Err(Error::ProcessNotRunning);
                }
            }
        };

        if let Err(e) = kill(Pid::from_raw(handle.pid), Signal::SIGTERM) {
            warn!("failed to send SIGTERM to process: {}", e);
        }

        let exited = tokio::time::timeout(self.stop_timeout, handle.exit.wait())
            .await
            .is_ok();
        if !exited {
            if let Err(e) = kill(Pid::from_raw(handle.pid), Signal::SIGKILL) {
                debug!("failed to kill process after timeout: {}", e);
            }
        }

        self.shared.clear_child_if(handle.generation);
        info!("process stopped");
        Ok(())
    }

    /// Stop the child and hand control back to the caller's start closure.
    /// A second restart while one is in flight fails with
    /// [`Error::ProcessAlreadyRestarting`].
    pub async fn restart<F, Fut>(&self, do_start: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        if self.restarting.swap(true, Ordering::SeqCst) {
            error!("process already restarting");
            return Err(Error::ProcessAlreadyRestarting);
        }

        let result = async {
            self.stop().await?;
            info!("process restarted");
            do_start().await
        }
        .await;

        self.restarting.store(false, Ordering::SeqCst);
        result
    }

    /// A copy of the ring buffer contents, oldest line first.
    pub fn get_buffer(&self) -> Vec<String> {
        let logs = self.shared.logs.lock();
        logs.buffer.iter().cloned().collect()
    }

    /// Attach a fresh log subscriber. Dropping the receiver unsubscribes;
    /// the channel ends when the supervised process exits.
    pub fn subscribe_logs(&self) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        self.shared.logs.lock().subscribers.push(tx);
        rx
    }
}

/// Reads stdout and stderr to EOF, then reaps the child, clears the handle,
/// fires the on-stop callback and closes every subscriber channel.
async fn capture_process_logs(
    shared: Arc<Shared>,
    mut child: Child,
    stdout: ChildStdout,
    stderr: ChildStderr,
    handle: ChildHandle,
) {
    let mut out_lines = BufReader::new(stdout).lines();
    let mut err_lines = BufReader::new(stderr).lines();
    let mut out_done = false;
    let mut err_done = false;

    while !(out_done && err_done) {
        tokio::select! {
            line = out_lines.next_line(), if !out_done => match line {
                Ok(Some(line)) => shared.process_line(line),
                Ok(None) => out_done = true,
                Err(e) => {
                    error!("error reading stdout: {}", e);
                    out_done = true;
                }
            },
            line = err_lines.next_line(), if !err_done => match line {
                Ok(Some(line)) => shared.process_line(line),
                Ok(None) => err_done = true,
                Err(e) => {
                    error!("error reading stderr: {}", e);
                    err_done = true;
                }
            },
        }
    }

    let _ = child.wait().await;

    shared.clear_child_if(handle.generation);
    warn!("process stopped");

    let on_stop = shared.on_stop.lock().clone();
    if let Some(on_stop) = on_stop {
        on_stop();
    }
    // Release stop() waiters only once the on-stop callback has run, so a
    // restart observing the exit cannot race the callback's side effects.
    handle.exit.set();

    let subscribers = {
        let mut logs = shared.logs.lock();
        std::mem::take(&mut logs.subscribers)
    };
    // Dropping the senders closes every subscriber channel exactly once.
    drop(subscribers);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    fn controller() -> ProcessController {
        ProcessController::new(100, Duration::from_millis(500))
    }

    async fn drain(mut rx: mpsc::Receiver<String>) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(line) = rx.recv().await {
            lines.push(line);
        }
        lines
    }

    #[tokio::test]
    async fn test_stop_without_child_fails() {
        let pc = controller();
        assert!(matches!(pc.stop().await, Err(Error::ProcessNotRunning)));
    }

    #[tokio::test]
    async fn test_reload_without_child_fails() {
        let pc = controller();
        assert!(matches!(
            pc.reload(Signal::SIGHUP),
            Err(Error::ProcessNotRunning)
        ));
    }

    #[tokio::test]
    async fn test_restart_without_child_fails() {
        let pc = controller();
        let result = pc.restart(|| async { Ok(()) }).await;
        assert!(matches!(result, Err(Error::ProcessNotRunning)));
    }

    #[tokio::test]
    async fn test_setup_cmd_twice_fails() {
        let pc = controller();
        pc.setup_cmd(sh("sleep 5")).unwrap();
        assert!(matches!(
            pc.setup_cmd(sh("sleep 5")),
            Err(Error::ProcessAlreadyRunning)
        ));
        pc.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_ring_buffer_keeps_most_recent_lines() {
        let pc = ProcessController::new(3, Duration::from_millis(500));
        let rx = pc.subscribe_logs();
        pc.setup_cmd(sh("printf 'l0\\nl1\\nl2\\nl3\\nl4\\n'")).unwrap();
        // The subscriber channel closes once the child has exited and the
        // capture task is done.
        drain(rx).await;
        assert_eq!(pc.get_buffer(), vec!["l2", "l3", "l4"]);
        assert!(!pc.is_running());
    }

    #[tokio::test]
    async fn test_subscriber_sees_lines_in_order() {
        let pc = controller();
        let rx = pc.subscribe_logs();
        pc.setup_cmd(sh("printf 'a\\nb\\nc\\n'")).unwrap();
        assert_eq!(drain(rx).await, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_lines_without_blocking() {
        let pc = controller();
        let slow = pc.subscribe_logs();
        let done = pc.subscribe_logs();
        pc.setup_cmd(sh("i=0; while [ $i -lt 500 ]; do echo line$i; i=$((i+1)); done"))
            .unwrap();
        // Capture completes even though `slow` is never read from.
        drain(done).await;
        let received = drain(slow).await;
        assert!(!received.is_empty());
        assert!(received.len() <= SUBSCRIBER_CAPACITY);
        // Whatever arrived is a prefix of the emitted lines.
        for (i, line) in received.iter().enumerate() {
            assert_eq!(line, &format!("line{}", i));
        }
        assert!(!pc.is_running());
    }

    #[tokio::test]
    async fn test_stop_escalates_to_kill() {
        let pc = ProcessController::new(100, Duration::from_millis(300));
        pc.setup_cmd(sh("trap '' TERM; sleep 10")).unwrap();
        // Let the shell install its trap before signalling.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let started = Instant::now();
        pc.stop().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!pc.is_running());
    }

    #[tokio::test]
    async fn test_stop_returns_quickly_when_child_obeys_sigterm() {
        let pc = ProcessController::new(100, Duration::from_secs(3));
        pc.setup_cmd(sh("sleep 10")).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let started = Instant::now();
        pc.stop().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!pc.is_running());
    }

    #[tokio::test]
    async fn test_concurrent_restart_rejected() {
        let pc = Arc::new(controller());
        pc.setup_cmd(sh("sleep 10")).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let first = pc.restart(|| async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok(())
        });
        let second = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            pc.restart(|| async { Ok(()) }).await
        };
        let (first, second) = tokio::join!(first, second);
        assert!(first.is_ok());
        assert!(matches!(second, Err(Error::ProcessAlreadyRestarting)));
    }

    #[tokio::test]
    async fn test_on_stop_fires_once_per_exit() {
        let pc = controller();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        pc.set_on_stop(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let rx = pc.subscribe_logs();
        pc.setup_cmd(sh("echo bye")).unwrap();
        drain(rx).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_subscriber_after_exit_gets_closed_on_next_exit() {
        let pc = controller();
        let rx = pc.subscribe_logs();
        pc.setup_cmd(sh("echo one")).unwrap();
        assert_eq!(drain(rx).await, vec!["one"]);

        let rx = pc.subscribe_logs();
        pc.setup_cmd(sh("echo two")).unwrap();
        assert_eq!(drain(rx).await, vec!["two"]);
    }
}
