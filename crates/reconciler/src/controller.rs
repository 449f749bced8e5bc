//! The controller: watch set, work queue and worker pool for one reconciler.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use fleet_cluster::{Cluster, ResourceEventHandler};
use fleet_core::ResourceKind;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, info, info_span, warn};

use crate::error::{Error, Result};
use crate::handler::{EnqueueRequestHandler, OwnerSpec};
use crate::queue::{Queue, RateLimitingQueue};
use crate::reconciler::Reconciler;
use crate::types::{Disposition, Request};
use crate::watch::WatchOptions;

/// Default delay before a worker that hit a reconcile error resumes.
pub const DEFAULT_JITTER_PERIOD: Duration = Duration::from_secs(1);

/// Default number of concurrent workers.
pub const DEFAULT_MAX_CONCURRENT_RECONCILES: usize = 1;

/// Options for [`Controller::new`]. Unset fields take their defaults.
#[derive(Clone, Default)]
pub struct ControllerOptions {
    /// Delay before restarting a worker stopped by a reconcile error.
    /// Defaults to [`DEFAULT_JITTER_PERIOD`].
    pub jitter_period: Option<Duration>,
    /// Extra random delay on top of `jitter_period`, as a fraction of it.
    /// Defaults to no jitter.
    pub jitter_factor: Option<f64>,
    /// Number of workers. Defaults to [`DEFAULT_MAX_CONCURRENT_RECONCILES`].
    pub max_concurrent_reconciles: Option<usize>,
    /// Queue override. Defaults to a [`RateLimitingQueue`] with the default
    /// controller rate limiter.
    pub queue: Option<Arc<dyn Queue<Request>>>,
    /// Parent span for every log line emitted by the workers. Defaults to
    /// `controller{name}`.
    pub span: Option<Span>,
}

impl fmt::Debug for ControllerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControllerOptions")
            .field("jitter_period", &self.jitter_period)
            .field("jitter_factor", &self.jitter_factor)
            .field("max_concurrent_reconciles", &self.max_concurrent_reconciles)
            .field("queue", &self.queue.is_some())
            .field("span", &self.span)
            .finish()
    }
}

/// What a worker does after handling one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkerStep {
    /// Take the next item.
    Continue,
    /// The reconcile failed; pause before taking more work.
    Cooldown,
    /// The queue is shut down.
    Stop,
}

/// Everything a worker task needs.
#[derive(Clone)]
struct Worker {
    reconciler: Arc<dyn Reconciler>,
    queue: Arc<dyn Queue<Request>>,
    jitter_period: Duration,
    jitter_factor: f64,
}

impl Worker {
    async fn process_next_work_item(&self) -> WorkerStep {
        let Some(request) = self.queue.get().await else {
            return WorkerStep::Stop;
        };
        let step = self.reconcile(&request).await;
        self.queue.done(&request);
        step
    }

    async fn reconcile(&self, request: &Request) -> WorkerStep {
        if !request.is_valid() {
            warn!(request = ?request, "Dropping request without a name");
            self.queue.forget(request);
            return WorkerStep::Continue;
        }

        match self.reconciler.reconcile(request.clone()).await {
            Err(e) => {
                error!(request = %request, error = %e, "Reconciler error");
                self.queue.add_rate_limited(request.clone());
                WorkerStep::Cooldown
            }
            Ok(result) => {
                match result.disposition() {
                    Disposition::RequeueAfter(delay) => {
                        debug!(request = %request, delay_ms = delay.as_millis(), "Requeue after");
                        self.queue.add_after(request.clone(), delay);
                    }
                    Disposition::RequeueRateLimited => {
                        debug!(request = %request, "Requeue with backoff");
                        self.queue.add_rate_limited(request.clone());
                    }
                    Disposition::Forget => {
                        debug!(request = %request, "Reconciled");
                        self.queue.forget(request);
                    }
                }
                WorkerStep::Continue
            }
        }
    }

    fn cooldown(&self) -> Duration {
        if self.jitter_factor > 0.0 {
            let extra = self.jitter_period.mul_f64(rand::random::<f64>() * self.jitter_factor);
            self.jitter_period.saturating_add(extra)
        } else {
            self.jitter_period
        }
    }

    /// Process items until the queue shuts down or `token` is cancelled,
    /// pausing after every reconcile error.
    async fn run(self, id: usize, token: CancellationToken) {
        debug!(worker = id, "Worker started");
        loop {
            let step = loop {
                match self.process_next_work_item().await {
                    WorkerStep::Continue => {}
                    other => break other,
                }
            };
            if step == WorkerStep::Stop {
                break;
            }

            let pause = self.cooldown();
            debug!(worker = id, pause_ms = pause.as_millis(), "Worker cooling down");
            tokio::select! {
                () = token.cancelled() => break,
                () = tokio::time::sleep(pause) => {}
            }
        }
        debug!(worker = id, "Worker stopped");
    }
}

/// Runs one [`Reconciler`] over requests from every cluster it watches.
pub struct Controller {
    name: String,
    clusters: Vec<Arc<dyn Cluster>>,
    worker: Worker,
    max_concurrent_reconciles: usize,
    span: Span,
}

impl Controller {
    /// Create a controller, resolving every unset option to its default.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `jitter_factor` is negative or not
    /// finite.
    pub fn new(
        name: impl Into<String>,
        reconciler: Arc<dyn Reconciler>,
        options: ControllerOptions,
    ) -> Result<Self> {
        let name = name.into();
        let jitter_factor = options.jitter_factor.unwrap_or(0.0);
        if !jitter_factor.is_finite() || jitter_factor < 0.0 {
            return Err(Error::invalid_config(format!(
                "jitter factor must be a non-negative number, got {jitter_factor}"
            )));
        }

        let queue = options.queue.unwrap_or_else(|| {
            Arc::new(RateLimitingQueue::<Request>::with_default_rate_limiter(name.clone()))
        });
        let span = options
            .span
            .unwrap_or_else(|| info_span!("controller", name = %name));

        Ok(Self {
            clusters: Vec::new(),
            worker: Worker {
                reconciler,
                queue,
                jitter_period: options
                    .jitter_period
                    .filter(|p| !p.is_zero())
                    .unwrap_or(DEFAULT_JITTER_PERIOD),
                jitter_factor,
            },
            max_concurrent_reconciles: options
                .max_concurrent_reconciles
                .filter(|n| *n > 0)
                .unwrap_or(DEFAULT_MAX_CONCURRENT_RECONCILES),
            span,
            name,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The queue shared by every handler and worker of this controller.
    pub fn queue(&self) -> &Arc<dyn Queue<Request>> {
        &self.worker.queue
    }

    pub fn jitter_period(&self) -> Duration {
        self.worker.jitter_period
    }

    pub fn max_concurrent_reconciles(&self) -> usize {
        self.max_concurrent_reconciles
    }

    /// Every cluster passed to a `watch_resource*` call, in call order.
    ///
    /// The owner of the controller must start and sync these caches before
    /// calling [`Controller::start`].
    pub fn caches(&self) -> &[Arc<dyn Cluster>] {
        &self.clusters
    }

    /// Route events for `kind` in `cluster` through `handler`.
    ///
    /// The cluster joins the watch set even if registration fails.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WatchFailed`] if the cluster rejects the handler.
    pub async fn watch_resource(
        &mut self,
        token: &CancellationToken,
        cluster: Arc<dyn Cluster>,
        kind: &ResourceKind,
        handler: Arc<dyn ResourceEventHandler>,
    ) -> Result<()> {
        self.clusters.push(Arc::clone(&cluster));
        cluster
            .add_event_handler(token, kind, handler)
            .await
            .map_err(|e| Error::watch_failed(cluster.name(), kind.to_string(), e.to_string()))?;
        info!(parent: &self.span, cluster = %cluster.name(), kind = %kind, "Watching resource");
        Ok(())
    }

    /// Watch `kind` in `cluster` and reconcile the observed objects.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WatchFailed`] if the cluster rejects the handler.
    pub async fn watch_resource_reconcile_object(
        &mut self,
        token: &CancellationToken,
        cluster: Arc<dyn Cluster>,
        kind: &ResourceKind,
        options: WatchOptions,
    ) -> Result<()> {
        let handler =
            EnqueueRequestHandler::for_object(Arc::clone(&cluster), Arc::clone(self.queue()), options);
        self.watch_resource(token, cluster, kind, Arc::new(handler)).await
    }

    /// Watch `kind` in `cluster` and reconcile the owners described by `owner`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WatchFailed`] if the cluster rejects the handler.
    pub async fn watch_resource_reconcile_owner(
        &mut self,
        token: &CancellationToken,
        cluster: Arc<dyn Cluster>,
        kind: &ResourceKind,
        owner: OwnerSpec,
        options: WatchOptions,
    ) -> Result<()> {
        let handler = EnqueueRequestHandler::for_owner(
            Arc::clone(&cluster),
            Arc::clone(self.queue()),
            owner,
            options,
        );
        self.watch_resource(token, cluster, kind, Arc::new(handler)).await
    }

    /// Run the workers until `token` is cancelled, then shut the queue down.
    ///
    /// Returns once the queue is shut down. Reconciles already in flight are
    /// left to finish on their own.
    ///
    /// # Errors
    ///
    /// Currently always returns `Ok`; the signature leaves room for startup
    /// failures.
    pub async fn start(&self, token: CancellationToken) -> Result<()> {
        let span = self.span.clone();
        async {
            info!(workers = self.max_concurrent_reconciles, "Starting workers");
            for id in 0..self.max_concurrent_reconciles {
                let worker = self.worker.clone();
                tokio::spawn(worker.run(id, token.clone()).in_current_span());
            }

            token.cancelled().await;
            info!("Shutting down workers");
            self.worker.queue.shut_down();
            Ok(())
        }
        .instrument(span)
        .await
    }

    #[cfg(test)]
    pub(crate) async fn process_next_work_item(&self) -> WorkerStep {
        self.worker.process_next_work_item().await
    }
}

impl fmt::Debug for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Controller")
            .field("name", &self.name)
            .field("clusters", &self.clusters)
            .field("max_concurrent_reconciles", &self.max_concurrent_reconciles)
            .field("jitter_period", &self.worker.jitter_period)
            .finish_non_exhaustive()
    }
}
