use super::monitor::LifeWatch;
use super::restart::{RestartDecision, RestartPolicy};
use super::spawner::spawn_process;
use super::types::{LifeReport, OsHandle, ProcessInstance, ProcessState, ProcessStatus, TerminationEvent};
use super::watch::{FileWatcher, WATCH_DEBOUNCE};
use crate::config::{ProcessSpec, Registry, SupervisorSettings};
use crate::error::{Result, ShepherdError};
use crate::logs::{LogPipe, LogTargets};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, WeakUnboundedSender};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

type Reply = oneshot::Sender<ProcessStatus>;

/// Everything that can happen to an instance. Handled one at a time, in order.
enum InstanceEvent {
    Start(Reply),
    Stop(Reply),
    Restart(Option<Reply>),
    Status(Reply),
    LifeEnded { generation: u64, report: LifeReport },
    PipeDrained { generation: u64 },
    MemorySample { generation: u64, bytes: u64 },
    BackoffElapsed { generation: u64 },
    FileChanged(PathBuf),
}

/// What to do once the current life has been stopped
#[derive(Debug, Clone, Copy)]
struct Relaunch {
    reset_restart_count: bool,
}

/// Owns one [`ProcessInstance`] and applies every transition to it.
///
/// Events from API calls, the monitor, backoff timers and the file watcher all
/// arrive on one queue. Anything produced by an earlier life or a cancelled
/// timer carries a stale generation and is dropped.
///
/// An exit is recorded as soon as the child is gone. The output pipe of that
/// life may stay open longer (a descendant can inherit it); the next launch
/// and any stop reply wait until it has drained.
struct InstanceActor {
    instance: ProcessInstance,
    policy: RestartPolicy,
    kill_timeout: Duration,
    sample_interval: Duration,
    events: WeakUnboundedSender<InstanceEvent>,
    generation: u64,
    backoff_timer: Option<JoinHandle<()>>,
    started: Option<Instant>,
    relaunch: Option<Relaunch>,
    stop_waiters: Vec<Reply>,
    relaunch_waiters: Vec<Reply>,
    /// Generation of the life whose output is still being written out
    draining: Option<u64>,
    /// A launch requested while `draining` was set
    launch_pending: bool,
    launch_waiters: Vec<Reply>,
    _watcher: Option<FileWatcher>,
}

impl InstanceActor {
    async fn run(mut self, mut rx: UnboundedReceiver<InstanceEvent>) {
        while let Some(event) = rx.recv().await {
            self.handle(event);
        }

        // Every handle is gone; make sure nothing outlives the supervisor
        self.cancel_backoff();
        if let Some(handle) = self.instance.os_handle.as_mut() {
            handle.request_termination();
        }
    }

    fn handle(&mut self, event: InstanceEvent) {
        match event {
            InstanceEvent::Start(reply) => self.on_start(reply),
            InstanceEvent::Stop(reply) => self.on_stop(reply),
            InstanceEvent::Restart(reply) => self.on_restart(reply),
            InstanceEvent::Status(reply) => self.reply(reply),
            InstanceEvent::LifeEnded { generation, report } if generation == self.generation => {
                self.on_life_ended(report)
            }
            InstanceEvent::PipeDrained { generation } if self.draining == Some(generation) => {
                self.on_pipe_drained()
            }
            InstanceEvent::MemorySample { generation, bytes } if generation == self.generation => {
                self.instance.memory_usage_bytes = Some(bytes);
            }
            InstanceEvent::BackoffElapsed { generation }
                if generation == self.generation
                    && self.instance.state == ProcessState::RestartBackoff =>
            {
                self.backoff_timer = None;
                self.instance.restart_count += 1;
                info!(
                    "Restarting process {} (restart #{})",
                    self.instance.name(),
                    self.instance.restart_count
                );
                self.launch();
            }
            InstanceEvent::FileChanged(path) => self.on_file_changed(path),
            _ => debug!("Dropping stale event for process {}", self.instance.name()),
        }
    }

    fn on_start(&mut self, reply: Reply) {
        match self.instance.state {
            ProcessState::Stopped | ProcessState::Crashed | ProcessState::RestartBackoff => {
                self.instance.restart_count = 0;
                self.instance.consecutive_failures = 0;
                self.launch();
                self.reply_once_launched(reply);
            }
            ProcessState::Starting if self.launch_pending => {
                self.instance.restart_count = 0;
                self.instance.consecutive_failures = 0;
                self.launch_waiters.push(reply);
            }
            ProcessState::Stopping => {
                self.relaunch = Some(Relaunch {
                    reset_restart_count: true,
                });
                self.relaunch_waiters.push(reply);
            }
            ProcessState::Running | ProcessState::Starting => self.reply(reply),
        }
    }

    fn on_stop(&mut self, reply: Reply) {
        self.relaunch = None;
        match self.instance.state {
            ProcessState::Starting if self.launch_pending => {
                info!("Cancelling pending launch of process {}", self.instance.name());
                self.launch_pending = false;
                self.instance.mark_stopped();
                self.stop_waiters.append(&mut self.launch_waiters);
                self.stop_waiters.push(reply);
            }
            ProcessState::Running | ProcessState::Starting => {
                self.begin_stop();
                self.stop_waiters.push(reply);
            }
            ProcessState::Stopping => self.stop_waiters.push(reply),
            ProcessState::RestartBackoff => {
                info!("Cancelling pending restart of process {}", self.instance.name());
                self.cancel_backoff();
                self.generation += 1;
                self.instance.mark_stopped();
                self.reply_once_drained(reply);
            }
            ProcessState::Stopped | ProcessState::Crashed => {
                self.instance.mark_stopped();
                self.reply_once_drained(reply);
            }
        }
    }

    fn on_restart(&mut self, reply: Option<Reply>) {
        match self.instance.state {
            ProcessState::Starting if self.launch_pending => self.launch_waiters.extend(reply),
            ProcessState::Running | ProcessState::Starting => {
                self.relaunch = Some(Relaunch {
                    reset_restart_count: false,
                });
                self.begin_stop();
                self.relaunch_waiters.extend(reply);
            }
            ProcessState::Stopping => {
                self.relaunch.get_or_insert(Relaunch {
                    reset_restart_count: false,
                });
                self.relaunch_waiters.extend(reply);
            }
            ProcessState::RestartBackoff | ProcessState::Stopped | ProcessState::Crashed => {
                self.launch();
                if let Some(reply) = reply {
                    self.reply_once_launched(reply);
                }
            }
        }
    }

    fn on_file_changed(&mut self, path: PathBuf) {
        let settled = self
            .started
            .is_some_and(|at| at.elapsed() >= WATCH_DEBOUNCE);
        if self.instance.state != ProcessState::Running || !settled {
            return;
        }

        info!(
            "Change detected in {}, restarting process {}",
            path.display(),
            self.instance.name()
        );
        self.on_restart(None);
    }

    fn on_life_ended(&mut self, report: LifeReport) {
        self.instance.record_exit(&report);
        self.started = None;

        if self.instance.state == ProcessState::Stopping {
            info!("Process {} stopped", self.instance.name());
            if self.draining.is_none() {
                self.finish_stop();
            }
            return;
        }

        match report.event {
            TerminationEvent::NormalExit(_) => {
                info!("Process {} {}", self.instance.name(), report.event)
            }
            _ => {
                warn!("Process {} {}", self.instance.name(), report.event);
                self.instance.state = ProcessState::Crashed;
            }
        }
        self.apply_policy(&report.event);
    }

    fn on_pipe_drained(&mut self) {
        self.draining = None;

        if self.instance.state == ProcessState::Stopping && self.instance.os_handle.is_none() {
            self.finish_stop();
            return;
        }

        if self.launch_pending {
            self.launch_pending = false;
            self.launch();
            let waiters: Vec<Reply> = self.launch_waiters.drain(..).collect();
            for reply in waiters {
                self.reply(reply);
            }
        }

        // Stops that only waited for the output of a life that had already ended
        let waiters: Vec<Reply> = self.stop_waiters.drain(..).collect();
        for reply in waiters {
            self.reply(reply);
        }
    }

    fn begin_stop(&mut self) {
        self.instance.mark_stopping();
        if let Some(handle) = self.instance.os_handle.as_mut() {
            handle.request_termination();
        }
    }

    fn finish_stop(&mut self) {
        match self.relaunch.take() {
            Some(relaunch) => {
                if relaunch.reset_restart_count {
                    self.instance.restart_count = 0;
                    self.instance.consecutive_failures = 0;
                }
                self.launch();
            }
            None => self.instance.mark_stopped(),
        }

        let waiters: Vec<Reply> = self
            .stop_waiters
            .drain(..)
            .chain(self.relaunch_waiters.drain(..))
            .collect();
        for reply in waiters {
            self.reply(reply);
        }
    }

    fn apply_policy(&mut self, event: &TerminationEvent) {
        match self.policy.decide(&self.instance.spec, &self.instance, event) {
            RestartDecision::Stop => {
                info!(
                    "Autorestart disabled, leaving process {} stopped",
                    self.instance.name()
                );
                self.instance.mark_stopped();
            }
            RestartDecision::RestartNow => self.enter_backoff(Duration::ZERO),
            RestartDecision::RestartAfter(delay) => {
                info!(
                    "Process {} will restart in {:?}",
                    self.instance.name(),
                    delay
                );
                self.enter_backoff(delay);
            }
        }
    }

    /// Wait out `delay`, then relaunch. A zero delay still goes through the
    /// queue so that a stop already queued behind this event wins.
    fn enter_backoff(&mut self, delay: Duration) {
        self.instance.consecutive_failures = self
            .policy
            .effective_failures(&self.instance)
            .saturating_add(1);
        self.instance.mark_backoff();
        self.generation += 1;

        let generation = self.generation;
        let events = self.events.clone();
        let timer = async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if let Some(tx) = events.upgrade() {
                let _ = tx.send(InstanceEvent::BackoffElapsed { generation });
            }
        };
        self.backoff_timer = Some(tokio::spawn(timer));
    }

    fn cancel_backoff(&mut self) {
        if let Some(timer) = self.backoff_timer.take() {
            timer.abort();
        }
    }

    /// Start a new life. At most one OS process per instance exists at a time;
    /// callers only get here once the previous life has ended.
    fn launch(&mut self) {
        self.cancel_backoff();
        if self.draining.is_some() {
            debug!(
                "Output of the previous life of {} is still draining, launch deferred",
                self.instance.name()
            );
            self.launch_pending = true;
            self.instance.state = ProcessState::Starting;
            return;
        }

        self.generation += 1;
        let generation = self.generation;

        self.instance.mark_starting();
        let spec: Arc<ProcessSpec> = Arc::clone(&self.instance.spec);

        let mut spawned = match spawn_process(&spec) {
            Ok(spawned) => spawned,
            Err(e) => {
                error!("{}", e);
                self.instance.mark_launch_failed();
                self.apply_policy(&TerminationEvent::unreachable());
                return;
            }
        };

        let pipe = LogPipe::attach(
            LogTargets::for_spec(&spec),
            spawned.child.stdout.take(),
            spawned.child.stderr.take(),
        );

        let pid = spawned.pid;
        let (terminate_tx, terminate_rx) = oneshot::channel();
        let watch = LifeWatch {
            name: spec.name.clone(),
            child: spawned.child,
            pid,
            max_memory_bytes: spec.max_memory_bytes,
            sample_interval: self.sample_interval,
            grace_period: self.kill_timeout,
        };

        let samples = self.events.clone();
        let events = self.events.clone();
        let drain_timeout = self.kill_timeout;
        tokio::spawn(async move {
            let report = watch
                .run(terminate_rx, move |bytes| {
                    if let Some(tx) = samples.upgrade() {
                        let _ = tx.send(InstanceEvent::MemorySample { generation, bytes });
                    }
                })
                .await;

            if let Some(tx) = events.upgrade() {
                let _ = tx.send(InstanceEvent::LifeEnded { generation, report });
            }

            // Output of this life must be on disk before the next life opens the files
            drain_log_pipe(pipe, drain_timeout).await;

            if let Some(tx) = events.upgrade() {
                let _ = tx.send(InstanceEvent::PipeDrained { generation });
            }
        });

        self.draining = Some(generation);
        self.instance.mark_running(OsHandle::new(pid, terminate_tx));
        self.started = Some(Instant::now());
        info!("Started process {} (PID: {})", spec.name, pid);
    }

    fn reply(&self, reply: Reply) {
        let _ = reply.send(self.instance.status());
    }

    /// Answer now, or once a deferred launch has happened
    fn reply_once_launched(&mut self, reply: Reply) {
        if self.launch_pending {
            self.launch_waiters.push(reply);
        } else {
            self.reply(reply);
        }
    }

    /// Answer now, or once the last life's output is on disk
    fn reply_once_drained(&mut self, reply: Reply) {
        if self.draining.is_some() {
            self.stop_waiters.push(reply);
        } else {
            self.reply(reply);
        }
    }
}

async fn drain_log_pipe(mut pipe: JoinHandle<()>, limit: Duration) {
    if tokio::time::timeout(limit, &mut pipe).await.is_err() {
        // A descendant still holds the pipes open
        warn!("Log pipe did not close within {:?}, detaching it", limit);
        pipe.abort();
    }
}

/// Handle to the running set of process instances
///
/// All methods take `&self`; the supervisor can be shared behind an `Arc`
/// between the control socket and the signal handler.
pub struct Supervisor {
    senders: Vec<UnboundedSender<InstanceEvent>>,
    index: HashMap<String, usize>,
}

impl Supervisor {
    /// Create one stopped instance per spec. Must be called inside a tokio runtime.
    pub fn new(registry: Registry) -> Self {
        let settings = registry.settings();
        let policy = RestartPolicy::from_settings(settings);

        let mut senders = Vec::with_capacity(registry.len());
        let mut index = HashMap::with_capacity(registry.len());

        for (position, spec) in registry.specs().iter().enumerate() {
            let (tx, rx) = mpsc::unbounded_channel();
            let watcher = if spec.watch_enabled {
                start_watcher(spec, settings, tx.downgrade())
            } else {
                None
            };

            let actor = InstanceActor {
                instance: ProcessInstance::new(Arc::clone(spec)),
                policy: policy.clone(),
                kill_timeout: settings.kill_timeout(),
                sample_interval: settings.memory_check_interval(),
                events: tx.downgrade(),
                generation: 0,
                backoff_timer: None,
                started: None,
                relaunch: None,
                stop_waiters: Vec::new(),
                relaunch_waiters: Vec::new(),
                draining: None,
                launch_pending: false,
                launch_waiters: Vec::new(),
                _watcher: watcher,
            };
            tokio::spawn(actor.run(rx));

            senders.push(tx);
            index.insert(spec.name.clone(), position);
        }

        Self { senders, index }
    }

    /// Start every instance in declaration order
    pub async fn start_all(&self) -> Vec<ProcessStatus> {
        info!("Starting {} process(es)", self.senders.len());
        self.broadcast(InstanceEvent::Start).await
    }

    /// Start a stopped instance. Resets its restart count.
    pub async fn start(&self, name: &str) -> Result<ProcessStatus> {
        self.request(name, InstanceEvent::Start).await
    }

    /// Stop an instance and wait until its process has exited.
    /// The restart policy is not consulted.
    pub async fn stop(&self, name: &str) -> Result<ProcessStatus> {
        self.request(name, InstanceEvent::Stop).await
    }

    /// Stop the current life (if any) and launch a new one
    pub async fn restart(&self, name: &str) -> Result<ProcessStatus> {
        self.request(name, |reply| InstanceEvent::Restart(Some(reply)))
            .await
    }

    pub async fn status(&self, name: &str) -> Result<ProcessStatus> {
        self.request(name, InstanceEvent::Status).await
    }

    /// Snapshot of every instance, in declaration order
    pub async fn list(&self) -> Vec<ProcessStatus> {
        self.broadcast(InstanceEvent::Status).await
    }

    /// Stop every instance concurrently
    pub async fn stop_all(&self) -> Vec<ProcessStatus> {
        self.broadcast(InstanceEvent::Stop).await
    }

    /// Stop everything, then release the instances
    pub async fn shutdown(self) -> Vec<ProcessStatus> {
        info!("Shutting down supervisor");
        let statuses = self.stop_all().await;
        info!("All processes stopped");
        statuses
    }

    async fn request(
        &self,
        name: &str,
        make: impl FnOnce(Reply) -> InstanceEvent,
    ) -> Result<ProcessStatus> {
        let position = *self
            .index
            .get(name)
            .ok_or_else(|| ShepherdError::UnknownProcess(name.to_string()))?;

        let (tx, rx) = oneshot::channel();
        self.senders[position]
            .send(make(tx))
            .map_err(|_| ShepherdError::Internal(format!("instance task for '{}' is gone", name)))?;
        rx.await
            .map_err(|_| ShepherdError::Internal(format!("instance task for '{}' dropped a request", name)))
    }

    /// Send one request to every instance before awaiting any reply
    async fn broadcast(&self, make: fn(Reply) -> InstanceEvent) -> Vec<ProcessStatus> {
        let mut pending = Vec::with_capacity(self.senders.len());
        for sender in &self.senders {
            let (tx, rx) = oneshot::channel();
            if sender.send(make(tx)).is_ok() {
                pending.push(rx);
            }
        }

        let mut statuses = Vec::with_capacity(pending.len());
        for rx in pending {
            match rx.await {
                Ok(status) => statuses.push(status),
                Err(_) => error!("An instance task dropped a request"),
            }
        }
        statuses
    }
}

fn start_watcher(
    spec: &ProcessSpec,
    settings: &SupervisorSettings,
    events: WeakUnboundedSender<InstanceEvent>,
) -> Option<FileWatcher> {
    let root = match spec.working_directory.clone() {
        Some(dir) => dir,
        None => match std::env::current_dir() {
            Ok(dir) => dir,
            Err(e) => {
                warn!("Cannot watch files for process {}: {}", spec.name, e);
                return None;
            }
        },
    };
    // Only files the supervisor itself writes; the log directory may be the watched tree
    let ignored = vec![
        spec.stdout_path.clone(),
        spec.stderr_path.clone(),
        settings.control_socket(),
    ];

    let started = FileWatcher::start(&root, ignored, move |path| {
        if let Some(tx) = events.upgrade() {
            let _ = tx.send(InstanceEvent::FileChanged(path.to_path_buf()));
        }
    });

    match started {
        Ok(watcher) => {
            info!(
                "Watching {} for process {}",
                watcher.root().display(),
                spec.name
            );
            Some(watcher)
        }
        Err(e) => {
            // The process still runs, it just won't restart on changes
            warn!("{}", e);
            None
        }
    }
}
