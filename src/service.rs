//! A service: N identical workers sharing one configuration and sinks.
use std::{
    collections::HashMap,
    path::Path,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use futures::future::join_all;
use tokio::sync::oneshot;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info};

use crate::config::ServiceConfig;
use crate::notifier::Notifier;
use crate::worker::{OutputSink, SpawnSpec, Worker, WorkerState};

/// In-flight start and monitor tasks of a service, each tagged with the
/// worker it drives so cancellation can target a subset of workers.
///
/// Start entries are removed by the monitor that observed them settle;
/// both sets are drained (and aborted) by `stop` and `delete`.
#[derive(Default)]
struct TaskTracker {
    next_id: u64,
    starts: HashMap<u64, (Arc<Worker>, AbortHandle)>,
    monitors: HashMap<u64, (Arc<Worker>, JoinHandle<()>)>,
}

/// Point-in-time status of a service.
#[derive(Debug, Clone)]
pub struct ServiceStatus {
    /// Service name.
    pub name: String,
    /// Configured command line.
    pub cmd: String,
    /// Worker states in creation order.
    pub workers: Vec<WorkerState>,
}

impl ServiceStatus {
    /// Ordered key/value rows: `name`, `cmd`, then one `process_N` entry
    /// per worker with the state label as value.
    pub fn rows(&self) -> Vec<(String, String)> {
        let mut rows = vec![
            ("name".to_string(), self.name.clone()),
            ("cmd".to_string(), self.cmd.clone()),
        ];
        for (index, state) in self.workers.iter().enumerate() {
            rows.push((format!("process_{}", index + 1), state.as_ref().to_string()));
        }
        rows
    }
}

/// An aggregate of `numprocs` identical workers.
///
/// The service owns the stdout and stderr sinks (opened once, shared by
/// every worker) and the monitor tasks that implement the restart
/// policy.
pub struct Service {
    name: String,
    config: Mutex<ServiceConfig>,
    workers: Mutex<Vec<Arc<Worker>>>,
    sinks: Mutex<(OutputSink, OutputSink)>,
    tasks: Arc<Mutex<TaskTracker>>,
    notifier: Mutex<Option<Notifier>>,
}

impl Service {
    /// Creates a service with its sinks opened and `numprocs` workers in
    /// the `Stopped` state.
    pub fn new(config: ServiceConfig, notifier: Option<Notifier>) -> Arc<Self> {
        let stdout = OutputSink::open(config.stdout.as_deref());
        let stderr = OutputSink::open(config.stderr.as_deref());
        let spec = SpawnSpec::new(&config, stdout.clone(), stderr.clone());

        let workers = (0..config.numprocs)
            .map(|_| Arc::new(Worker::new(&config.name, spec.clone(), notifier.clone())))
            .collect();

        Arc::new(Self {
            name: config.name.clone(),
            config: Mutex::new(config),
            workers: Mutex::new(workers),
            sinks: Mutex::new((stdout, stderr)),
            tasks: Arc::new(Mutex::new(TaskTracker::default())),
            notifier: Mutex::new(notifier),
        })
    }

    /// Service name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Snapshot of the current configuration.
    pub fn config(&self) -> ServiceConfig {
        self.config
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Overwrites the configuration; takes effect on the next `reload`.
    pub fn set_config(&self, config: ServiceConfig) {
        *self.config.lock().unwrap_or_else(PoisonError::into_inner) = config;
    }

    /// Replaces the notifier handed to workers.
    pub fn set_notifier(&self, notifier: Option<Notifier>) {
        *self.notifier.lock().unwrap_or_else(PoisonError::into_inner) = notifier;
    }

    fn notifier(&self) -> Option<Notifier> {
        self.notifier
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn lock_workers(&self) -> MutexGuard<'_, Vec<Arc<Worker>>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_tasks(&self) -> MutexGuard<'_, TaskTracker> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn abort_tasks(&self) {
        let mut tasks = self.lock_tasks();
        for (_, (_, handle)) in tasks.starts.drain() {
            handle.abort();
        }
        for (_, (_, handle)) in tasks.monitors.drain() {
            handle.abort();
        }
    }

    /// Cancels only the tracked tasks belonging to the given workers,
    /// e.g. the excess workers dropped by a shrinking reload. Without
    /// this, a cancelled worker's retry loop could wake from its backoff
    /// sleep and spawn an untracked child.
    fn abort_tasks_for(&self, workers: &[Arc<Worker>]) {
        let doomed = |owner: &Arc<Worker>| workers.iter().any(|w| Arc::ptr_eq(w, owner));
        let mut tasks = self.lock_tasks();
        tasks.starts.retain(|_, (owner, handle)| {
            if doomed(owner) {
                handle.abort();
                false
            } else {
                true
            }
        });
        tasks.monitors.retain(|_, (owner, handle)| {
            if doomed(owner) {
                handle.abort();
                false
            } else {
                true
            }
        });
    }

    /// Starts the service if `autostart` is configured.
    pub async fn autostart(&self) {
        if self.config().autostart {
            self.start().await;
            info!("service {} autostarted", self.name);
        }
    }

    /// Starts every worker, replacing dead ones first.
    ///
    /// Each worker gets a start task and a monitor task that drives the
    /// restart policy once the start settles. Returns when all start
    /// tasks have returned; monitors keep running until `stop`.
    pub async fn start(&self) {
        let config = self.config();
        let mut start_handles = Vec::new();
        {
            let mut workers = self.lock_workers();
            workers.retain(|worker| {
                let keep = matches!(
                    worker.state(),
                    WorkerState::Running | WorkerState::Starting | WorkerState::Stopping
                );
                if !keep {
                    debug!(
                        "{}: replacing worker in state {}",
                        self.name,
                        worker.state().as_ref()
                    );
                }
                keep
            });

            let sinks = self.sinks.lock().unwrap_or_else(PoisonError::into_inner);
            let spec = SpawnSpec::new(&config, sinks.0.clone(), sinks.1.clone());
            drop(sinks);
            let notifier = self.notifier();
            while workers.len() < config.numprocs as usize {
                workers.push(Arc::new(Worker::new(
                    &self.name,
                    spec.clone(),
                    notifier.clone(),
                )));
            }

            let mut tasks = self.lock_tasks();
            for worker in workers.iter() {
                let id = tasks.next_id;
                tasks.next_id += 1;

                let (settled, started) = oneshot::channel();
                let start_worker = Arc::clone(worker);
                let (retries, starttime) = (config.startretries, config.starttime);
                let handle = tokio::spawn(async move {
                    start_worker.start(retries, starttime).await;
                    let _ = settled.send(());
                });
                tasks
                    .starts
                    .insert(id, (Arc::clone(worker), handle.abort_handle()));

                let monitor = tokio::spawn(Self::monitor(
                    Arc::clone(worker),
                    config.clone(),
                    started,
                    Arc::clone(&self.tasks),
                    id,
                ));
                tasks.monitors.insert(id, (Arc::clone(worker), monitor));
                start_handles.push(handle);
            }
        }

        for handle in start_handles {
            let _ = handle.await;
        }
    }

    /// Watches one worker after its start settled: waits for the child,
    /// then restarts it per policy until it stays up, gives up, or the
    /// policy declines.
    async fn monitor(
        worker: Arc<Worker>,
        config: ServiceConfig,
        started: oneshot::Receiver<()>,
        tasks: Arc<Mutex<TaskTracker>>,
        id: u64,
    ) {
        if started.await.is_err() {
            // start task was cancelled before settling
            return;
        }

        worker.wait(config.startretries).await;
        while worker.state() == WorkerState::Exited && worker.retries() < config.startretries {
            debug!("{}: checking if an autorestart is required", config.name);
            tokio::time::sleep(Duration::from_secs(u64::from(worker.retries()) + 1)).await;
            worker
                .autorestart(
                    &config.exitcodes,
                    config.startretries,
                    config.starttime,
                    config.autorestart,
                )
                .await;
            if worker.state() == WorkerState::Exited {
                debug!("{}: no autorestart required", config.name);
                return;
            }
            worker.wait(config.startretries).await;
        }

        worker.reset_retries();
        tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .starts
            .remove(&id);
    }

    /// Stops every worker after cancelling in-flight start and monitor
    /// tasks.
    pub async fn stop(&self) {
        let config = self.config();
        self.abort_tasks();

        let workers: Vec<Arc<Worker>> = self.lock_workers().clone();
        join_all(
            workers
                .iter()
                .map(|worker| worker.stop(config.stopsignal, config.stoptime)),
        )
        .await;
    }

    /// Best-effort stop followed by a fresh start.
    pub async fn restart(&self) {
        self.stop().await;
        self.start().await;
    }

    /// Joins all monitor tasks. Pretty much only useful for testing.
    pub async fn wait(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut tasks = self.lock_tasks();
            tasks
                .monitors
                .drain()
                .map(|(_, (_, handle))| handle)
                .collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Applies the current configuration to the worker set.
    ///
    /// Excess workers are deleted and missing ones created. When the
    /// spawn-relevant slice changed (command, umask, working directory,
    /// sink paths, user or environment) every worker is rebuilt from
    /// scratch; otherwise existing workers are kept untouched apart from
    /// their notifier reference. Finishes by honoring `autostart`.
    pub async fn reload(&self) {
        let config = self.config();
        let notifier = self.notifier();
        let target = config.numprocs as usize;

        let excess: Vec<Arc<Worker>> = {
            let mut workers = self.lock_workers();
            if workers.len() > target {
                workers.split_off(target)
            } else {
                Vec::new()
            }
        };
        if !excess.is_empty() {
            self.abort_tasks_for(&excess);
        }
        for worker in excess {
            worker.delete().await;
        }

        let (stdout, stderr) = {
            let sinks = self.sinks.lock().unwrap_or_else(PoisonError::into_inner);
            let stdout = if same_path(&sinks.0, config.stdout.as_deref()) {
                sinks.0.clone()
            } else {
                OutputSink::open(config.stdout.as_deref())
            };
            let stderr = if same_path(&sinks.1, config.stderr.as_deref()) {
                sinks.1.clone()
            } else {
                OutputSink::open(config.stderr.as_deref())
            };
            (stdout, stderr)
        };
        let spec = SpawnSpec::new(&config, stdout.clone(), stderr.clone());

        let rebuild = self
            .lock_workers()
            .first()
            .is_some_and(|worker| *worker.spec() != spec);
        if rebuild {
            debug!("{}: spawn configuration changed, rebuilding workers", self.name);
            self.abort_tasks();
            let old: Vec<Arc<Worker>> = self.lock_workers().drain(..).collect();
            for worker in old {
                worker.delete().await;
            }
            let mut workers = self.lock_workers();
            for _ in 0..target {
                workers.push(Arc::new(Worker::new(
                    &self.name,
                    spec.clone(),
                    notifier.clone(),
                )));
            }
        } else {
            let mut workers = self.lock_workers();
            while workers.len() < target {
                workers.push(Arc::new(Worker::new(
                    &self.name,
                    spec.clone(),
                    notifier.clone(),
                )));
            }
            for worker in workers.iter() {
                worker.set_notifier(notifier.clone());
            }
        }
        *self.sinks.lock().unwrap_or_else(PoisonError::into_inner) = (stdout, stderr);

        self.autostart().await;
    }

    /// Snapshot of the service state; never mutates any worker.
    pub fn status(&self) -> ServiceStatus {
        let config = self.config();
        ServiceStatus {
            name: config.name,
            cmd: config.cmd,
            workers: self.lock_workers().iter().map(|w| w.state()).collect(),
        }
    }

    /// Terminates every worker and empties the service.
    pub async fn delete(&self) {
        info!("deleting service {}", self.name);
        self.abort_tasks();

        let workers: Vec<Arc<Worker>> = {
            let mut guard = self.lock_workers();
            guard.drain(..).collect()
        };
        for worker in workers {
            worker.delete().await;
        }
        debug!("service {} deleted", self.name);
    }
}

fn same_path(sink: &OutputSink, path: Option<&str>) -> bool {
    sink.path() == path.map(Path::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AutoRestart, StopSignal};

    fn service_config(name: &str, cmd: &str, numprocs: u32) -> ServiceConfig {
        ServiceConfig {
            name: name.to_string(),
            cmd: cmd.to_string(),
            numprocs,
            umask: 22,
            workingdir: "/tmp".to_string(),
            autostart: false,
            autorestart: AutoRestart::Never,
            exitcodes: vec![0],
            startretries: 1,
            starttime: 0,
            stopsignal: StopSignal::Term,
            stoptime: 1,
            stdout: None,
            stderr: None,
            user: None,
            env: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn construction_creates_stopped_workers() {
        let service = Service::new(service_config("web", "/bin/sleep 5", 3), None);
        let status = service.status();

        assert_eq!(status.name, "web");
        assert_eq!(status.workers.len(), 3);
        assert!(status.workers.iter().all(|s| *s == WorkerState::Stopped));

        let rows = service.status().rows();
        assert_eq!(rows[0], ("name".into(), "web".into()));
        assert_eq!(rows[1], ("cmd".into(), "/bin/sleep 5".into()));
        assert_eq!(rows[2], ("process_1".into(), "Stopped".into()));
        assert_eq!(rows[4], ("process_3".into(), "Stopped".into()));
    }

    #[tokio::test]
    async fn start_then_stop_round_trip() {
        let service = Service::new(service_config("sleepers", "/bin/sleep 30", 2), None);
        service.start().await;
        assert!(
            service
                .status()
                .workers
                .iter()
                .all(|s| *s == WorkerState::Running)
        );

        service.stop().await;
        assert!(
            service
                .status()
                .workers
                .iter()
                .all(|s| *s == WorkerState::Stopped)
        );
    }

    #[tokio::test]
    async fn start_never_leaves_workers_stopped() {
        let service = Service::new(service_config("broken", "/nonexistent/bin", 2), None);
        service.start().await;
        assert!(
            service
                .status()
                .workers
                .iter()
                .all(|s| matches!(s, WorkerState::Backoff | WorkerState::Fatal))
        );
        service.delete().await;
    }

    #[tokio::test]
    async fn delete_empties_the_service() {
        let service = Service::new(service_config("sleepers", "/bin/sleep 30", 2), None);
        service.start().await;
        service.delete().await;
        assert!(service.status().workers.is_empty());
    }

    #[tokio::test]
    async fn reload_with_identical_config_keeps_workers() {
        let service = Service::new(service_config("web", "/bin/sleep 30", 2), None);
        service.start().await;
        let before = service.status().workers;

        service.reload().await;
        assert_eq!(service.status().workers, before);
        assert!(
            service
                .status()
                .workers
                .iter()
                .all(|s| *s == WorkerState::Running)
        );
        service.delete().await;
    }

    #[tokio::test]
    async fn reload_resizes_worker_set() {
        let service = Service::new(service_config("web", "/bin/sleep 30", 3), None);

        let mut smaller = service_config("web", "/bin/sleep 30", 1);
        smaller.numprocs = 1;
        service.set_config(smaller);
        service.reload().await;
        assert_eq!(service.status().workers.len(), 1);

        service.set_config(service_config("web", "/bin/sleep 30", 4));
        service.reload().await;
        assert_eq!(service.status().workers.len(), 4);
        service.delete().await;
    }

    #[tokio::test]
    async fn reload_with_new_cmd_rebuilds_workers() {
        let service = Service::new(service_config("web", "/bin/sleep 30", 2), None);
        service.start().await;

        service.set_config(service_config("web", "/bin/sleep 60", 2));
        service.reload().await;

        let status = service.status();
        assert_eq!(status.cmd, "/bin/sleep 60");
        // autostart is off, so the fresh workers stay stopped
        assert!(status.workers.iter().all(|s| *s == WorkerState::Stopped));
        service.delete().await;
    }
}
