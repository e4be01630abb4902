//! Worker state machine for a single supervised child process.
use std::os::unix::process::CommandExt;
use std::{
    collections::HashMap,
    fs::File,
    io,
    path::{Path, PathBuf},
    process::{Child, Command, ExitStatus, Stdio},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use nix::{
    sys::signal::{self, Signal},
    unistd::Pid,
};
use strum_macros::AsRefStr;
use tracing::{debug, error, info, warn};

use crate::config::{AutoRestart, ServiceConfig, StopSignal};
use crate::notifier::Notifier;

/// Granularity of the start-confirmation, stop-grace and exit polls.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Destination of a worker's stdout or stderr stream.
///
/// A file sink is opened once by the owning service and shared by every
/// worker of that service; the descriptor is duplicated per spawn and the
/// file is closed when the last reference drops.
#[derive(Debug, Clone)]
pub enum OutputSink {
    /// Discard the stream.
    Null,
    /// Write to a file opened in truncating write mode.
    File {
        /// Path the file was opened from.
        path: PathBuf,
        /// Shared handle, duplicated into each child.
        file: Arc<File>,
    },
}

impl OutputSink {
    /// Opens a sink for the given path, falling back to the null sink
    /// when the file cannot be created.
    pub fn open(path: Option<&str>) -> Self {
        match path {
            None => OutputSink::Null,
            Some(path) => match File::create(path) {
                Ok(file) => OutputSink::File {
                    path: PathBuf::from(path),
                    file: Arc::new(file),
                },
                Err(err) => {
                    warn!("failed to open output file {path}: {err} - defaulting to null sink");
                    OutputSink::Null
                }
            },
        }
    }

    /// Path this sink writes to, if any.
    pub fn path(&self) -> Option<&Path> {
        match self {
            OutputSink::Null => None,
            OutputSink::File { path, .. } => Some(path),
        }
    }

    /// Duplicates the sink into a handle a child can be spawned with.
    fn as_stdio(&self) -> Stdio {
        match self {
            OutputSink::Null => Stdio::null(),
            OutputSink::File { path, file } => match file.try_clone() {
                Ok(clone) => Stdio::from(clone),
                Err(err) => {
                    warn!("failed to duplicate handle for {}: {err}", path.display());
                    Stdio::null()
                }
            },
        }
    }
}

impl PartialEq for OutputSink {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (OutputSink::Null, OutputSink::Null) => true,
            (OutputSink::File { path: a, .. }, OutputSink::File { path: b, .. }) => a == b,
            _ => false,
        }
    }
}

/// The spawn-relevant slice of a service configuration.
///
/// Two workers with equal specs are interchangeable; `Service::reload`
/// compares specs to decide whether existing workers can be kept.
#[derive(Debug, Clone, PartialEq)]
pub struct SpawnSpec {
    /// Command line, split on whitespace to form the argv.
    pub cmd: String,
    /// File mode creation mask (mode bits).
    pub umask: u32,
    /// Working directory, passed verbatim to the OS.
    pub workingdir: String,
    /// Sink receiving the child's stdout.
    pub stdout: OutputSink,
    /// Sink receiving the child's stderr.
    pub stderr: OutputSink,
    /// OS user the child runs as.
    pub user: Option<String>,
    /// Full environment of the child.
    pub env: HashMap<String, String>,
}

impl SpawnSpec {
    /// Builds the slice from a service configuration and its sinks.
    pub fn new(config: &ServiceConfig, stdout: OutputSink, stderr: OutputSink) -> Self {
        Self {
            cmd: config.cmd.clone(),
            umask: config.umask_mode(),
            workingdir: config.workingdir.clone(),
            stdout,
            stderr,
            user: config.user.clone(),
            env: config.env.clone(),
        }
    }
}

/// The state of a worker.
///
/// See <http://supervisord.org/subprocess.html#process-states> for the
/// lifecycle this mirrors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr)]
pub enum WorkerState {
    /// Never spawned, or cleanly terminated by `stop`.
    Stopped,
    /// Spawned but not yet confirmed alive past `starttime`.
    Starting,
    /// Alive and confirmed.
    Running,
    /// Last spawn attempt failed; another retry will follow.
    Backoff,
    /// Stop signal delivered, awaiting the graceful exit window.
    Stopping,
    /// The child terminated by itself.
    Exited,
    /// Retries exhausted.
    Fatal,
}

impl WorkerState {
    /// Whether moving to `next` is one of the permitted transitions.
    pub fn allows(self, next: WorkerState) -> bool {
        use WorkerState::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Backoff)
                | (Starting, Stopping)
                | (Backoff, Starting)
                | (Backoff, Fatal)
                | (Backoff, Stopped)
                | (Running, Exited)
                | (Running, Stopping)
                | (Stopping, Stopped)
                | (Exited, Starting)
                | (Exited, Fatal)
                | (Exited, Stopped)
                | (Fatal, Stopped)
        )
    }
}

struct WorkerInner {
    state: WorkerState,
    retries: u32,
    child: Option<Child>,
    notifier: Option<Notifier>,
}

/// One supervised child process.
///
/// All methods absorb their failures: spawn and wait errors drive the
/// state machine instead of propagating, and calls that do not apply to
/// the current state are logged no-ops.
pub struct Worker {
    service: String,
    spec: SpawnSpec,
    inner: Mutex<WorkerInner>,
}

impl Worker {
    /// Creates a worker in the `Stopped` state.
    pub fn new(service: &str, spec: SpawnSpec, notifier: Option<Notifier>) -> Self {
        Self {
            service: service.to_string(),
            spec,
            inner: Mutex::new(WorkerInner {
                state: WorkerState::Stopped,
                retries: 0,
                child: None,
                notifier,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, WorkerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current state.
    pub fn state(&self) -> WorkerState {
        self.lock().state
    }

    /// Lifetime spawn-attempt counter.
    pub fn retries(&self) -> u32 {
        self.lock().retries
    }

    /// Resets the lifetime spawn-attempt counter.
    pub fn reset_retries(&self) {
        self.lock().retries = 0;
    }

    /// The spawn-relevant configuration slice this worker was built from.
    pub fn spec(&self) -> &SpawnSpec {
        &self.spec
    }

    /// Replaces the notifier reference, e.g. after a configuration reload.
    pub fn set_notifier(&self, notifier: Option<Notifier>) {
        self.lock().notifier = notifier;
    }

    /// Applies a state transition; illegal ones are logged and ignored.
    fn transition(&self, next: WorkerState) -> bool {
        let mut inner = self.lock();
        if inner.state.allows(next) {
            inner.state = next;
            true
        } else {
            debug!(
                "{}: ignoring illegal transition {} -> {}",
                self.service,
                inner.state.as_ref(),
                next.as_ref()
            );
            false
        }
    }

    /// Non-blocking check of the child's exit status.
    fn poll(&self) -> Option<ExitStatus> {
        let mut inner = self.lock();
        match inner.child.as_mut()?.try_wait() {
            Ok(status) => status,
            Err(err) => {
                warn!("{}: failed to poll child: {err}", self.service);
                None
            }
        }
    }

    fn pid(&self) -> Option<u32> {
        self.lock().child.as_ref().map(Child::id)
    }

    fn notifier(&self) -> Option<Notifier> {
        self.lock().notifier.clone()
    }

    /// Spawns the child process described by the spawn slice.
    fn spawn(&self) -> io::Result<Child> {
        let mut argv = self.spec.cmd.split_whitespace();
        let program = argv
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command"))?;

        let mut command = Command::new(program);
        command
            .args(argv)
            .current_dir(&self.spec.workingdir)
            .env_clear()
            .envs(&self.spec.env)
            .stdin(Stdio::null())
            .stdout(self.spec.stdout.as_stdio())
            .stderr(self.spec.stderr.as_stdio());

        if let Some(name) = &self.spec.user {
            let user = nix::unistd::User::from_name(name)
                .map_err(io::Error::from)?
                .ok_or_else(|| {
                    io::Error::new(io::ErrorKind::NotFound, format!("unknown user '{name}'"))
                })?;
            command.uid(user.uid.as_raw()).gid(user.gid.as_raw());
        }

        let umask = self.spec.umask;
        unsafe {
            command.pre_exec(move || {
                nix::sys::stat::umask(nix::sys::stat::Mode::from_bits_truncate(
                    umask as libc::mode_t,
                ));
                Ok(())
            });
        }

        command.spawn()
    }

    /// Starts the worker and confirms it stays alive past `starttime`.
    ///
    /// Retries take increasingly more time depending on the number of
    /// attempts already made, adding one second each time. Failures never
    /// propagate; the worker ends up `Running` or `Fatal`.
    pub async fn start(&self, retries: u32, starttime: u64) {
        if self.state() == WorkerState::Stopping {
            warn!("{}: start requested while stopping, ignoring", self.service);
            return;
        }
        if let Some(pid) = self.pid()
            && self.poll().is_none()
        {
            warn!("{}: process {pid} is already running", self.service);
            return;
        }

        let mut budget = i64::from(retries);
        loop {
            self.transition(WorkerState::Starting);
            match self.spawn() {
                Ok(child) => {
                    let pid = child.id();
                    self.lock().child = Some(child);
                    info!("{}: starting process with pid {pid}", self.service);

                    for _ in 0..starttime.saturating_mul(10) {
                        if self.poll().is_some() {
                            break;
                        }
                        tokio::time::sleep(POLL_INTERVAL).await;
                    }
                    if starttime == 0 || self.poll().is_none() {
                        if self.transition(WorkerState::Running) {
                            info!("{}: process {pid} is now running", self.service);
                            if let Some(notifier) = self.notifier() {
                                notifier.send_start(&self.service, self.state().as_ref());
                            }
                        }
                        return;
                    }
                    error!(
                        "{}: process {pid} exited before {starttime} seconds",
                        self.service
                    );
                }
                Err(err) => {
                    error!("{}: failed to spawn process: {err}", self.service);
                }
            }

            budget -= 1;
            let attempts = {
                let mut inner = self.lock();
                inner.retries += 1;
                inner.retries
            };
            self.transition(WorkerState::Backoff);
            if budget <= 0 {
                break;
            }
            info!(
                "{}: retrying in {} seconds ({budget} attempts left)",
                self.service,
                attempts + 1
            );
            tokio::time::sleep(Duration::from_secs(u64::from(attempts) + 1)).await;
        }

        error!("{}: giving up after exhausting start retries", self.service);
        if self.transition(WorkerState::Fatal)
            && let Some(notifier) = self.notifier()
        {
            notifier.send_exited(&self.service, self.state().as_ref());
        }
    }

    /// Waits for the child to terminate and records the outcome.
    ///
    /// Tolerates being called on a worker that is not running, because it
    /// may race with `stop`.
    pub async fn wait(&self, startretries: u32) {
        {
            let inner = self.lock();
            if inner.child.is_none()
                || !matches!(inner.state, WorkerState::Running | WorkerState::Exited)
            {
                debug!(
                    "{}: wait called while not started (state {})",
                    self.service,
                    inner.state.as_ref()
                );
                return;
            }
        }

        debug!("{}: waiting for process to finish", self.service);
        let status = loop {
            if let Some(status) = self.poll() {
                break status;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        };

        {
            let inner = self.lock();
            if !matches!(inner.state, WorkerState::Running | WorkerState::Exited) {
                debug!(
                    "{}: exit observed after stop, leaving state {}",
                    self.service,
                    inner.state.as_ref()
                );
                return;
            }
        }

        if self.state() == WorkerState::Running {
            self.transition(WorkerState::Exited);
        }
        let retries = self.retries();
        if retries > 0 && retries >= startretries {
            error!("{}: max retry attempts exceeded", self.service);
            self.transition(WorkerState::Fatal);
        } else {
            info!(
                "{}: process exited with code {:?}",
                self.service,
                status.code()
            );
        }
        if let Some(notifier) = self.notifier() {
            notifier.send_exited(&self.service, self.state().as_ref());
        }
    }

    /// Delivers the configured stop signal, escalating to SIGKILL after
    /// the grace period.
    ///
    /// Workers sitting in `Backoff`, `Exited` or `Fatal` have no live
    /// child to signal; they reset their retry counter and go straight
    /// to `Stopped`, so a stopped service is uniformly stopped.
    pub async fn stop(&self, stopsignal: StopSignal, stoptime: u64) {
        match self.state() {
            WorkerState::Running | WorkerState::Starting => {}
            WorkerState::Backoff | WorkerState::Exited | WorkerState::Fatal => {
                self.reset_retries();
                self.transition(WorkerState::Stopped);
                info!("{}: stopped without a live process", self.service);
                return;
            }
            state => {
                warn!(
                    "{}: stop called while not running (state {})",
                    self.service,
                    state.as_ref()
                );
                return;
            }
        }

        if let Some(pid) = self.pid() {
            match signal::kill(Pid::from_raw(pid as i32), stopsignal.as_nix()) {
                Ok(()) => info!(
                    "{}: sending signal {} to pid {pid}",
                    self.service,
                    stopsignal.as_ref()
                ),
                Err(err) => warn!("{}: failed to signal pid {pid}: {err}", self.service),
            }
        }
        self.transition(WorkerState::Stopping);

        for _ in 0..stoptime.saturating_mul(10) {
            tokio::time::sleep(POLL_INTERVAL).await;
            if self.poll().is_some() {
                break;
            }
        }
        if self.poll().is_none() {
            warn!("{}: process unresponsive, killing forcefully", self.service);
            if let Some(pid) = self.pid()
                && let Err(err) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL)
            {
                warn!("{}: failed to kill pid {pid}: {err}", self.service);
            }
            while self.pid().is_some() && self.poll().is_none() {
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        }

        self.reset_retries();
        self.transition(WorkerState::Stopped);
        info!("{}: process stopped successfully", self.service);
        if let Some(notifier) = self.notifier() {
            notifier.send_stop(&self.service, self.state().as_ref());
        }
    }

    /// Restarts an exited worker according to the configured policy.
    ///
    /// `always` restarts unconditionally; `unexpected` restarts only when
    /// the exit code is not listed in `exitcodes`; `never` does nothing.
    pub async fn autorestart(
        &self,
        exitcodes: &[i32],
        retries: u32,
        starttime: u64,
        policy: AutoRestart,
    ) {
        {
            let inner = self.lock();
            if inner.child.is_none() {
                warn!("{}: autorestart called before any start", self.service);
                return;
            }
            if inner.state != WorkerState::Exited {
                warn!(
                    "{}: autorestart called while not exited (state {})",
                    self.service,
                    inner.state.as_ref()
                );
                return;
            }
        }

        let exit_code = self.poll().and_then(|status| status.code());
        let expected = exit_code.is_some_and(|code| exitcodes.contains(&code));
        if policy == AutoRestart::Always || (policy == AutoRestart::Unexpected && !expected) {
            info!("{}: restarting process", self.service);
            self.lock().retries += 1;
            self.start(retries, starttime).await;
        } else {
            debug!("{}: process does not need to be restarted", self.service);
        }
    }

    /// Terminates the child if it is still alive and awaits its exit.
    ///
    /// Idempotent; called when the owning service is deleted or its
    /// workers are rebuilt during a reload.
    pub async fn delete(&self) {
        if self.pid().is_none() || self.poll().is_some() {
            return;
        }
        self.transition(WorkerState::Stopping);
        if let Some(pid) = self.pid()
            && let Err(err) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
        {
            error!("{}: failed to terminate process {pid}: {err}", self.service);
            return;
        }
        while self.pid().is_some() && self.poll().is_none() {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        // a deleted worker must never be restarted by its monitor
        self.transition(WorkerState::Stopped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(cmd: &str) -> SpawnSpec {
        SpawnSpec {
            cmd: cmd.to_string(),
            umask: 0,
            workingdir: "/tmp".to_string(),
            stdout: OutputSink::Null,
            stderr: OutputSink::Null,
            user: None,
            env: HashMap::new(),
        }
    }

    #[test]
    fn permitted_transitions_only() {
        use WorkerState::*;

        assert!(Stopped.allows(Starting));
        assert!(Starting.allows(Running));
        assert!(Starting.allows(Backoff));
        assert!(Starting.allows(Stopping));
        assert!(Backoff.allows(Starting));
        assert!(Backoff.allows(Fatal));
        assert!(Backoff.allows(Stopped));
        assert!(Running.allows(Exited));
        assert!(Running.allows(Stopping));
        assert!(Stopping.allows(Stopped));
        assert!(Exited.allows(Starting));
        assert!(Exited.allows(Fatal));
        assert!(Exited.allows(Stopped));
        assert!(Fatal.allows(Stopped));

        assert!(!Stopped.allows(Running));
        assert!(!Stopping.allows(Starting));
        assert!(!Stopping.allows(Running));
        assert!(!Fatal.allows(Starting));
        assert!(!Exited.allows(Exited));
    }

    #[test]
    fn specs_compare_by_sink_path() {
        let a = spec("/bin/sleep 1");
        let mut b = spec("/bin/sleep 1");
        assert_eq!(a, b);

        b.stdout = OutputSink::File {
            path: "/tmp/out".into(),
            file: Arc::new(tempfile::tempfile().unwrap()),
        };
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn failing_spawn_with_no_budget_is_fatal() {
        let worker = Worker::new("broken", spec("/nonexistent/binary"), None);
        worker.start(0, 0).await;
        assert_eq!(worker.state(), WorkerState::Fatal);
        assert_eq!(worker.retries(), 1);
    }

    #[tokio::test]
    async fn immediate_confirmation_with_zero_starttime() {
        let worker = Worker::new("sleeper", spec("/bin/sleep 5"), None);
        worker.start(0, 0).await;
        assert_eq!(worker.state(), WorkerState::Running);
        worker.delete().await;
    }

    #[tokio::test]
    async fn second_start_is_a_noop() {
        let worker = Worker::new("sleeper", spec("/bin/sleep 5"), None);
        worker.start(0, 0).await;
        worker.start(0, 0).await;
        assert_eq!(worker.state(), WorkerState::Running);
        assert_eq!(worker.retries(), 0);
        worker.delete().await;
    }

    #[tokio::test]
    async fn stop_on_stopped_worker_is_a_noop() {
        let worker = Worker::new("idle", spec("/bin/sleep 1"), None);
        worker.stop(StopSignal::Term, 1).await;
        assert_eq!(worker.state(), WorkerState::Stopped);
    }

    #[tokio::test]
    async fn stop_on_fatal_worker_resets_it_to_stopped() {
        let worker = Worker::new("broken", spec("/nonexistent/binary"), None);
        worker.start(0, 0).await;
        assert_eq!(worker.state(), WorkerState::Fatal);

        worker.stop(StopSignal::Term, 1).await;
        assert_eq!(worker.state(), WorkerState::Stopped);
        assert_eq!(worker.retries(), 0);
    }

    #[tokio::test]
    async fn wait_before_start_is_a_noop() {
        let worker = Worker::new("idle", spec("/bin/sleep 1"), None);
        worker.wait(3).await;
        assert_eq!(worker.state(), WorkerState::Stopped);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let worker = Worker::new("sleeper", spec("/bin/sleep 5"), None);
        worker.start(0, 0).await;
        worker.delete().await;
        worker.delete().await;
    }
}
