//! The build coordinator: a single actor serializing all scheduling state.
//!
//! One coordinator exists per build session. Its handler task owns the
//! configuration, the in-flight job set, the FIFO overflow queue, the timing
//! session, and the loaded-libraries set; every mutation goes through the
//! request channel, so handlers run one at a time. Runners are spawned as
//! independent tasks, at most `max_jobs` at any instant.
//!
//! Handle calls await replies without a deadline; callers needing a timeout
//! can wrap them in `tokio::time::timeout`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::runner;
use crate::script::{RecipeRegistry, WorkUnit};
use crate::timing::Session;

/// Completion message delivered to a job's owner.
#[derive(Debug)]
pub struct Done {
    /// The unit the job executed.
    pub unit: WorkUnit,
    /// Opaque datum supplied at enqueue time (the worker passes vertex ids).
    pub data: u64,
    /// How the job ended.
    pub result: JobResult,
}

/// Outcome of one runner execution.
#[derive(Debug)]
pub enum JobResult {
    /// Recipe ran (or was skipped as up to date) without failure.
    Ok,
    /// A non-error value was thrown inside the recipe.
    Throw(String),
    /// An error was raised.
    Raise(Error),
}

/// Channel end owners receive completion messages on.
pub type OwnerTx = mpsc::UnboundedSender<Done>;

struct PendingJob {
    unit: WorkUnit,
    data: u64,
    owner: OwnerTx,
}

pub(crate) enum Request {
    SetConfig {
        config: Config,
        reply: oneshot::Sender<()>,
    },
    GetConfig {
        reply: oneshot::Sender<Config>,
    },
    Enqueue {
        unit: WorkUnit,
        data: u64,
        owner: OwnerTx,
        reply: oneshot::Sender<()>,
    },
    Done {
        job_id: u64,
        unit: WorkUnit,
        data: u64,
        owner: OwnerTx,
        result: JobResult,
    },
    ApplyTimer {
        apply: Box<dyn FnOnce(Option<Session>) -> Option<Session> + Send>,
        reply: oneshot::Sender<()>,
    },
    TakeTimer {
        reply: oneshot::Sender<Option<Session>>,
    },
    AddLib {
        name: String,
        reply: oneshot::Sender<bool>,
    },
    GetLibs {
        reply: oneshot::Sender<HashSet<String>>,
    },
    DelLib {
        name: String,
        reply: oneshot::Sender<bool>,
    },
    ClearLibs {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable handle on the coordinator actor.
#[derive(Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::UnboundedSender<Request>,
}

fn gone<T>(_: T) -> Error {
    Error::Script("coordinator is not running".to_string())
}

impl CoordinatorHandle {
    /// Spawn the coordinator actor. The registry resolves recipe references
    /// when jobs are dispatched to runners.
    pub fn spawn(registry: Arc<RecipeRegistry>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let actor_tx = tx.clone();
        tokio::spawn(async move {
            Actor::new(actor_tx, registry).run(rx).await;
        });
        Self { tx }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Request,
    ) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx.send(make(reply_tx)).map_err(gone)?;
        reply_rx.await.map_err(gone)
    }

    /// Replace the configuration; `max_jobs` follows `options.jobs`.
    pub async fn set_config(&self, config: Config) -> Result<()> {
        self.request(|reply| Request::SetConfig { config, reply }).await
    }

    /// Current configuration.
    pub async fn get_config(&self) -> Result<Config> {
        self.request(|reply| Request::GetConfig { reply }).await
    }

    /// Hand a job to the pool: launched at once when a slot is free,
    /// queued otherwise. Replies as soon as the job is accepted.
    pub async fn enqueue(&self, unit: WorkUnit, data: u64, owner: OwnerTx) -> Result<()> {
        self.request(|reply| Request::Enqueue {
            unit,
            data,
            owner,
            reply,
        })
        .await
    }

    /// Replace the timing session with `apply(current)`.
    pub async fn apply_timer(
        &self,
        apply: impl FnOnce(Option<Session>) -> Option<Session> + Send + 'static,
    ) -> Result<()> {
        self.request(|reply| Request::ApplyTimer {
            apply: Box::new(apply),
            reply,
        })
        .await
    }

    /// Remove and return the timing session.
    pub async fn take_timer(&self) -> Result<Option<Session>> {
        self.request(|reply| Request::TakeTimer { reply }).await
    }

    /// Add a library to the loaded set. True when it was not present yet.
    pub async fn add_lib(&self, name: impl Into<String>) -> Result<bool> {
        let name = name.into();
        self.request(|reply| Request::AddLib { name, reply }).await
    }

    /// The loaded-libraries set.
    pub async fn get_libs(&self) -> Result<HashSet<String>> {
        self.request(|reply| Request::GetLibs { reply }).await
    }

    /// Remove a library from the loaded set. True when it was present.
    pub async fn del_lib(&self, name: impl Into<String>) -> Result<bool> {
        let name = name.into();
        self.request(|reply| Request::DelLib { name, reply }).await
    }

    /// Empty the loaded-libraries set.
    pub async fn clear_libs(&self) -> Result<()> {
        self.request(|reply| Request::ClearLibs { reply }).await
    }
}

struct Actor {
    tx: mpsc::UnboundedSender<Request>,
    registry: Arc<RecipeRegistry>,
    config: Config,
    max_jobs: usize,
    jobs: HashMap<u64, ()>,
    queue: VecDeque<PendingJob>,
    timing: Option<Session>,
    libraries: HashSet<String>,
    next_job_id: u64,
}

impl Actor {
    fn new(tx: mpsc::UnboundedSender<Request>, registry: Arc<RecipeRegistry>) -> Self {
        Self {
            tx,
            registry,
            config: Config::default(),
            max_jobs: 1,
            jobs: HashMap::new(),
            queue: VecDeque::new(),
            timing: None,
            libraries: HashSet::new(),
            next_job_id: 0,
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Request>) {
        while let Some(request) = rx.recv().await {
            self.handle(request);
        }
        debug!("coordinator loop exiting");
    }

    fn launch(&mut self, job: PendingJob) {
        let job_id = self.next_job_id;
        self.next_job_id += 1;
        self.jobs.insert(job_id, ());

        runner::spawn(
            self.tx.clone(),
            Arc::clone(&self.registry),
            job_id,
            job.unit,
            job.data,
            job.owner,
        );
    }

    fn handle(&mut self, request: Request) {
        match request {
            Request::SetConfig { config, reply } => {
                self.max_jobs = config.options.jobs.max(1);
                self.config = config;
                let _ = reply.send(());
            }

            Request::GetConfig { reply } => {
                let _ = reply.send(self.config.clone());
            }

            Request::Enqueue {
                unit,
                data,
                owner,
                reply,
            } => {
                let job = PendingJob { unit, data, owner };
                if self.jobs.len() < self.max_jobs {
                    self.launch(job);
                } else {
                    self.queue.push_back(job);
                }
                let _ = reply.send(());
            }

            Request::Done {
                job_id,
                unit,
                data,
                owner,
                result,
            } => {
                let _ = self.jobs.remove(&job_id);
                let _ = owner.send(Done { unit, data, result });
                if let Some(next) = self.queue.pop_front() {
                    self.launch(next);
                }
            }

            Request::ApplyTimer { apply, reply } => {
                self.timing = apply(self.timing.take());
                let _ = reply.send(());
            }

            Request::TakeTimer { reply } => {
                let _ = reply.send(self.timing.take());
            }

            Request::AddLib { name, reply } => {
                let _ = reply.send(self.libraries.insert(name));
            }

            Request::GetLibs { reply } => {
                let _ = reply.send(self.libraries.clone());
            }

            Request::DelLib { name, reply } => {
                let _ = reply.send(self.libraries.remove(&name));
            }

            Request::ClearLibs { reply } => {
                self.libraries.clear();
                let _ = reply.send(());
            }
        }
    }
}
