//! Event watcher: subscribes to the runtime event bus and dispatches
//! lifecycle events to registered handlers.
//!
//! Handlers are registered per topic with a filter expression before
//! [`Watcher::listen`] consumes the watcher. Every matching handler runs as
//! its own task; at most `max_in_flight` run at once and the loop waits for a
//! free slot before dispatching more. Handlers for the same container run
//! one after another in the order their events arrived.

use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot::{self, error::TryRecvError};
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::error::DiscoveryError;
use crate::events::{Envelope, LifecycleEvent, Topic};
use crate::filter::Filter;
use crate::metadata::{ContainerAdaptor, ContainerInfo};
use crate::metrics::{self, ResubscribeReason};
use crate::runtime::RuntimeClient;

/// Default bound on concurrently running handler tasks.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 64;

/// Default time in-flight handlers get to finish on shutdown.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

const MAX_BACKOFF_SECS: u64 = 30;

/// A registered event handler.
pub type Callback =
    Arc<dyn Fn(Arc<ContainerInfo>, LifecycleEvent) -> BoxFuture<'static, ()> + Send + Sync>;

struct Registration {
    topic: Topic,
    filter: Filter,
    callback: Callback,
}

/// Watches runtime lifecycle events.
pub struct Watcher<C> {
    client: Arc<C>,
    registrations: Vec<Registration>,
    max_in_flight: usize,
    drain_timeout: Duration,
}

impl<C: RuntimeClient> Watcher<C> {
    /// Create a watcher over a connected runtime client.
    pub fn new(client: Arc<C>) -> Self {
        Self {
            client,
            registrations: Vec::new(),
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }

    /// Set the bound on concurrently running handlers. Zero is treated as one.
    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight.max(1);
        self
    }

    /// Set how long in-flight handlers may run after cancellation.
    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    /// Register a handler for task start events matching `filter`.
    pub fn handle_start<F, Fut>(
        &mut self,
        filter: &str,
        callback: F,
    ) -> Result<(), DiscoveryError>
    where
        F: Fn(Arc<ContainerInfo>, LifecycleEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.register(Topic::Start, filter, callback)
    }

    /// Register a handler for task exit events matching `filter`.
    pub fn handle_exit<F, Fut>(
        &mut self,
        filter: &str,
        callback: F,
    ) -> Result<(), DiscoveryError>
    where
        F: Fn(Arc<ContainerInfo>, LifecycleEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.register(Topic::Exit, filter, callback)
    }

    /// Register a handler for task delete events matching `filter`.
    pub fn handle_delete<F, Fut>(
        &mut self,
        filter: &str,
        callback: F,
    ) -> Result<(), DiscoveryError>
    where
        F: Fn(Arc<ContainerInfo>, LifecycleEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.register(Topic::Delete, filter, callback)
    }

    fn register<F, Fut>(
        &mut self,
        topic: Topic,
        filter: &str,
        callback: F,
    ) -> Result<(), DiscoveryError>
    where
        F: Fn(Arc<ContainerInfo>, LifecycleEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let filter = Filter::parse(filter)?;
        debug!(topic = topic.as_str(), filter = ?filter, "registered handler");
        self.registrations.push(Registration {
            topic,
            filter,
            callback: Arc::new(move |container, event| callback(container, event).boxed()),
        });
        Ok(())
    }

    /// Number of registered handlers.
    pub fn registrations(&self) -> usize {
        self.registrations.len()
    }

    fn wants(&self, topic: Topic) -> bool {
        self.registrations.iter().any(|r| r.topic == topic)
    }

    /// Seed from the current container list, then dispatch live events until
    /// `cancel` fires.
    ///
    /// When the event stream ends or cannot be opened the watcher subscribes
    /// again with exponential backoff and re-seeds, since events may have been
    /// missed in between. Containers that were started before the gap and are
    /// no longer running get a synthetic delete.
    pub async fn listen(self, cancel: CancellationToken) -> Result<(), DiscoveryError> {
        let mut dispatcher = Dispatcher::new(self.max_in_flight);
        let mut backoff_secs = 1u64;
        let mut first_connect = true;

        'subscribe: loop {
            if cancel.is_cancelled() {
                break;
            }

            // Subscribe before listing so nothing falls between the two.
            let mut stream = match self.client.subscribe().await {
                Ok(stream) => {
                    backoff_secs = 1;
                    if first_connect {
                        metrics::record_resubscribe(ResubscribeReason::InitialConnect);
                        first_connect = false;
                    }
                    info!("subscribed to runtime events");
                    stream
                }
                Err(e) => {
                    error!("failed to subscribe to runtime events: {}", e);
                    metrics::record_resubscribe(ResubscribeReason::Error);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = sleep(Duration::from_secs(backoff_secs)) => {}
                    }
                    backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
                    continue;
                }
            };

            if !self.seed(&mut dispatcher, &cancel).await {
                break;
            }

            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => {
                        info!("watcher received shutdown signal");
                        break 'subscribe;
                    }

                    Some(result) = dispatcher.tasks.join_next(),
                        if !dispatcher.tasks.is_empty() =>
                    {
                        log_task_result(result);
                        dispatcher.prune_chains();
                        metrics::record_in_flight(dispatcher.tasks.len());
                    }

                    item = stream.next() => {
                        match item {
                            Some(Ok(envelope)) => {
                                if !self.handle_envelope(&mut dispatcher, &cancel, envelope).await {
                                    break 'subscribe;
                                }
                            }
                            Some(Err(e)) => {
                                warn!("event stream error: {}", e);
                                metrics::record_event_dropped("stream_error");
                            }
                            None => {
                                info!("event stream ended");
                                metrics::record_resubscribe(ResubscribeReason::StreamEnded);
                                break;
                            }
                        }
                    }
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(Duration::from_secs(1)) => {}
            }
        }

        dispatcher.drain(self.drain_timeout).await;
        info!("watcher stopped");
        Ok(())
    }

    /// Dispatch a synthetic start for every running container, and a
    /// synthetic delete for every started container that is gone.
    async fn seed(&self, dispatcher: &mut Dispatcher, cancel: &CancellationToken) -> bool {
        if !self.wants(Topic::Start) {
            return true;
        }

        let containers = match self.client.list_containers().await {
            Ok(containers) => containers,
            Err(e) => {
                error!("failed to list containers: {}", e);
                return true;
            }
        };
        let listed = containers.len();

        let mut running = Vec::with_capacity(listed);
        for container in containers {
            match self.client.task_pid(&container.id).await {
                Ok(Some(pid)) if pid > 0 => running.push(container),
                Ok(_) => trace!(container_id = %container.id, "container has no running task"),
                // Unknown task state; resolution decides.
                Err(e) => {
                    debug!(container_id = %container.id, "task lookup failed: {}", e);
                    running.push(container);
                }
            }
        }
        info!(listed, running = running.len(), "seeding from running containers");

        let live: HashSet<&str> = running.iter().map(|c| c.id.as_str()).collect();
        let vanished: Vec<String> = dispatcher
            .started
            .iter()
            .filter(|id| !live.contains(id.as_str()))
            .cloned()
            .collect();

        for id in vanished {
            debug!(container_id = %id, "container went away while unsubscribed");
            let event = LifecycleEvent::synthetic_delete(id.clone());
            dispatcher.track(&event);
            let container = ContainerInfo {
                id,
                ..Default::default()
            };
            if !self.dispatch(dispatcher, cancel, Arc::new(container), event).await {
                return false;
            }
        }

        for container in running {
            let event = LifecycleEvent::synthetic_start(container.id.clone());
            dispatcher.track(&event);
            if !self.dispatch(dispatcher, cancel, Arc::new(container), event).await {
                return false;
            }
        }
        true
    }

    async fn handle_envelope(
        &self,
        dispatcher: &mut Dispatcher,
        cancel: &CancellationToken,
        envelope: Envelope,
    ) -> bool {
        let event = match LifecycleEvent::decode(&envelope) {
            Ok(Some(event)) => event,
            Ok(None) => {
                trace!(topic = %envelope.topic, "ignoring event");
                return true;
            }
            Err(e) => {
                warn!("dropping event: {}", e);
                metrics::record_event_dropped("decode");
                return true;
            }
        };

        let topic = event.topic();
        metrics::record_event(topic.as_str());
        dispatcher.track(&event);
        if !self.wants(topic) {
            return true;
        }

        let container = match self.client.load_container(event.container_id()).await {
            Ok(container) => container,
            // The container may be gone by the time its task exits; removal
            // handlers still need to hear about it.
            Err(e) if topic != Topic::Start => {
                debug!(
                    container_id = event.container_id(),
                    "metadata unavailable for {} event: {}",
                    topic.as_str(),
                    e
                );
                ContainerInfo {
                    id: event.container_id().to_string(),
                    ..Default::default()
                }
            }
            Err(e) => {
                warn!(container_id = event.container_id(), "dropping start event: {}", e);
                metrics::record_event_dropped("metadata");
                return true;
            }
        };

        self.dispatch(dispatcher, cancel, Arc::new(container), event).await
    }

    /// Run every matching handler. Returns false once cancelled.
    async fn dispatch(
        &self,
        dispatcher: &mut Dispatcher,
        cancel: &CancellationToken,
        container: Arc<ContainerInfo>,
        event: LifecycleEvent,
    ) -> bool {
        let topic = event.topic();
        for registration in self.registrations.iter().filter(|r| r.topic == topic) {
            if !registration.filter.matches(&ContainerAdaptor::new(&container)) {
                trace!(
                    container_id = %container.id,
                    topic = topic.as_str(),
                    "filter did not match"
                );
                continue;
            }
            let task = (registration.callback)(container.clone(), event.clone());
            if !dispatcher.spawn(cancel, topic, &container.id, task).await {
                return false;
            }
        }
        true
    }
}

/// Bounded set of running handler tasks.
struct Dispatcher {
    semaphore: Arc<Semaphore>,
    tasks: JoinSet<()>,

    /// container id -> completion of the last task queued for it
    chains: HashMap<String, oneshot::Receiver<()>>,

    /// Containers with a start dispatched and no primary exit or delete
    /// since.
    started: HashSet<String>,
}

impl Dispatcher {
    fn new(max_in_flight: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_in_flight)),
            tasks: JoinSet::new(),
            chains: HashMap::new(),
            started: HashSet::new(),
        }
    }

    fn track(&mut self, event: &LifecycleEvent) {
        let id = event.container_id();
        match event {
            LifecycleEvent::Start { .. } => {
                self.started.insert(id.to_string());
            }
            _ if event.is_primary_exit() => {
                self.started.remove(id);
            }
            _ => {}
        }
    }

    /// Wait for a free slot and spawn `task` behind the tasks already queued
    /// for `container_id`. Returns false if cancelled while waiting.
    async fn spawn(
        &mut self,
        cancel: &CancellationToken,
        topic: Topic,
        container_id: &str,
        task: BoxFuture<'static, ()>,
    ) -> bool {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return false,
            permit = self.semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return false,
            },
        };

        let (done, next) = oneshot::channel::<()>();
        let previous = self.chains.insert(container_id.to_string(), next);
        self.tasks.spawn(async move {
            // Completes when the predecessor finishes, panics or is aborted.
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            task.await;
            drop(done);
            drop(permit);
        });
        metrics::record_dispatch(topic.as_str());
        metrics::record_in_flight(self.tasks.len());

        // Reap whatever already finished so the set does not grow.
        while let Some(result) = self.tasks.try_join_next() {
            log_task_result(result);
        }
        self.prune_chains();
        true
    }

    /// Forget containers whose last queued task has finished.
    fn prune_chains(&mut self) {
        self.chains.retain(|_, last| matches!(last.try_recv(), Err(TryRecvError::Empty)));
    }

    async fn drain(&mut self, timeout: Duration) {
        if self.tasks.is_empty() {
            return;
        }
        info!(in_flight = self.tasks.len(), "waiting for handler tasks");

        let tasks = &mut self.tasks;
        let drained = tokio::time::timeout(timeout, async {
            while let Some(result) = tasks.join_next().await {
                log_task_result(result);
            }
        })
        .await;

        if drained.is_err() {
            warn!(remaining = self.tasks.len(), "handler tasks did not finish, aborting");
            self.tasks.abort_all();
            while self.tasks.join_next().await.is_some() {}
        }
        metrics::record_in_flight(0);
    }
}

fn log_task_result(result: Result<(), JoinError>) {
    if let Err(e) = result {
        if e.is_panic() {
            error!("handler task panicked: {}", e);
        }
    }
}
