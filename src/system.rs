//! The event loop that owns the container map and drives the backends.
//!
//! One task consumes the queue; every message is handled to completion
//! before the next is taken, so per-container ordering is the queue's FIFO
//! ordering and backends never see interleaved mutations. When the queue
//! drains, every backend gets a `rest()` call before the loop blocks again.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::error::TryRecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::{self, DnsBackend};
use crate::config::{Config, HostContext};
use crate::container::Container;
use crate::docker::{ContainerRuntime, DockerClient, DockerWatcher};
use crate::error::{BackendError, Error};
use crate::event::{self, Event, EventReceiver, EventSender};
use crate::record::DnsRecord;
use crate::reconcile;

enum Flow {
    Continue,
    Terminate,
}

/// The reconciliation and event-processing engine.
pub struct System {
    host: HostContext,
    host_records: Vec<DnsRecord>,
    containers: HashMap<String, Container>,
    backends: Vec<Box<dyn DnsBackend>>,
    runtime: Arc<dyn ContainerRuntime>,
    events: EventReceiver,
}

impl System {
    pub fn new(
        host: HostContext,
        host_records: Vec<DnsRecord>,
        backends: Vec<Box<dyn DnsBackend>>,
        runtime: Arc<dyn ContainerRuntime>,
        events: EventReceiver,
    ) -> Self {
        Self {
            host,
            host_records,
            containers: HashMap::new(),
            backends,
            runtime,
            events,
        }
    }

    /// Number of tracked containers.
    pub fn tracked(&self) -> usize {
        self.containers.len()
    }

    /// Consume the queue until `Terminate` (or until every sender is gone).
    pub async fn run(mut self) -> Result<(), Error> {
        loop {
            let event = match self.events.try_recv() {
                Ok(event) => event,
                Err(TryRecvError::Empty) => {
                    for backend in &mut self.backends {
                        backend.rest().await;
                    }
                    match self.events.recv().await {
                        Some(event) => event,
                        None => {
                            warn!("all event producers dropped; stopping");
                            return Ok(());
                        }
                    }
                }
                Err(TryRecvError::Disconnected) => {
                    warn!("all event producers dropped; stopping");
                    return Ok(());
                }
            };

            crate::metrics::record_event(event.kind());
            match self.dispatch(event).await? {
                Flow::Continue => {}
                Flow::Terminate => {
                    info!("event loop terminating");
                    return Ok(());
                }
            }
        }
    }

    async fn dispatch(&mut self, event: Event) -> Result<Flow, Error> {
        debug!(?event, "dispatching event");
        match event {
            Event::Started { id } => self.handle_started(&id).await?,
            Event::Stopped { id } => self.handle_stopped(&id),
            Event::Died { id, exit_code } => self.handle_died(&id, exit_code).await?,
            Event::Removed { id } => self.handle_removed(&id).await?,
            Event::ReconcileAll => self.reconcile_all().await?,
            Event::SuppressAll => self.suppress_all().await,
            Event::Terminate => return Ok(Flow::Terminate),
        }
        crate::metrics::record_container_counts(
            self.containers.len(),
            self.containers.values().filter(|c| c.crashed).count(),
        );
        Ok(Flow::Continue)
    }

    async fn handle_started(&mut self, id: &str) -> Result<(), Error> {
        let summary = match self.runtime.get(id).await {
            Ok(Some(summary)) => summary,
            Ok(None) => {
                warn!(container_id = %id, "started container not found in runtime; dropping event");
                crate::metrics::record_event_dropped("started", "missing_metadata");
                return Ok(());
            }
            Err(e) => {
                warn!(container_id = %id, error = %e, "failed to fetch container metadata; dropping event");
                crate::metrics::record_event_dropped("started", "runtime_error");
                return Ok(());
            }
        };

        // A restart after a crash still has the previous generation's
        // records published; withdraw those before publishing fresh.
        if let Some(stale) = self.containers.remove(id) {
            if stale.crashed {
                info!(container_id = %id, "suppressing records of crashed previous generation");
                self.for_each_backend(&stale, Mutation::Suppress).await?;
            }
        }

        let container = Container::new(&summary, &self.host);
        if container.records().is_empty() {
            debug!(container_id = %id, "container derives no records; not tracking");
            return Ok(());
        }

        info!(
            container_id = %id,
            container_name = %container.name(),
            records = container.records().len(),
            "publishing container records"
        );
        self.for_each_backend(&container, Mutation::Publish).await?;
        self.containers.insert(id.to_string(), container);
        Ok(())
    }

    fn handle_stopped(&mut self, id: &str) {
        match self.containers.get_mut(id) {
            Some(container) => {
                debug!(container_id = %id, "stop intent observed");
                container.stopped = true;
            }
            None => {
                warn!(container_id = %id, "stop event for untracked container; dropping");
                crate::metrics::record_event_dropped("stopped", "not_tracked");
            }
        }
    }

    async fn handle_died(&mut self, id: &str, exit_code: i64) -> Result<(), Error> {
        let Some(container) = self.containers.get_mut(id) else {
            warn!(container_id = %id, "death event for untracked container; dropping");
            crate::metrics::record_event_dropped("died", "not_tracked");
            return Ok(());
        };

        if exit_code != 0 && !container.stopped {
            // Leave the records up so clients keep an address through a
            // crash-restart loop.
            warn!(container_id = %id, exit_code, "container died uncleanly; retaining records");
            container.crashed = true;
            return Ok(());
        }

        info!(container_id = %id, exit_code, "container exited cleanly; suppressing records");
        if let Some(container) = self.containers.remove(id) {
            self.for_each_backend(&container, Mutation::Suppress).await?;
        }
        Ok(())
    }

    async fn handle_removed(&mut self, id: &str) -> Result<(), Error> {
        let Some(container) = self.containers.remove(id) else {
            warn!(container_id = %id, "removal event for untracked container; dropping");
            crate::metrics::record_event_dropped("removed", "not_tracked");
            return Ok(());
        };

        info!(container_id = %id, "container removed; suppressing records");
        self.for_each_backend(&container, Mutation::Suppress).await
    }

    /// Rebuild the container map from the runtime, then reconcile every
    /// backend against the desired set.
    async fn reconcile_all(&mut self) -> Result<(), Error> {
        info!("starting reconciliation pass");
        self.rebuild_containers().await;

        let desired = self.desired_records();
        for backend in &mut self.backends {
            if let Err(e) =
                reconcile::reconcile_backend(backend.as_mut(), &desired, &self.host.hostname).await
            {
                if e.is_fatal() {
                    return Err(Error::Backend {
                        backend: backend.name().to_string(),
                        source: e,
                    });
                }
                warn!(backend = backend.name(), error = %e, "reconciliation pass failed; will retry next pass");
            }
        }
        Ok(())
    }

    /// Re-enumerate live containers. The list endpoint's schema differs
    /// from the inspect endpoint's, so each id is fetched individually;
    /// containers that vanish in between are dropped silently.
    async fn rebuild_containers(&mut self) {
        let ids = match self.runtime.list().await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "failed to list containers; keeping current map");
                return;
            }
        };

        let mut rebuilt = HashMap::new();
        for id in ids {
            match self.runtime.get(&id).await {
                Ok(Some(summary)) => {
                    let mut container = Container::new(&summary, &self.host);
                    if container.records().is_empty() {
                        continue;
                    }
                    // Carry lifecycle flags across the rebuild.
                    if let Some(previous) = self.containers.get(&id) {
                        container.stopped = previous.stopped;
                        container.crashed = previous.crashed;
                    }
                    rebuilt.insert(id, container);
                }
                Ok(None) => {}
                Err(e) => {
                    debug!(container_id = %id, error = %e, "container vanished during rebuild");
                }
            }
        }

        // Crashed containers are not listed as live but their records are
        // deliberately retained until restart or removal.
        for (id, container) in self.containers.drain() {
            if container.crashed {
                rebuilt.entry(id).or_insert(container);
            }
        }

        debug!(tracked = rebuilt.len(), "rebuilt container map");
        self.containers = rebuilt;
    }

    /// Union of every tracked container's records plus the host records,
    /// de-duplicated by record identity, in stable order.
    fn desired_records(&self) -> Vec<DnsRecord> {
        let mut seen = std::collections::HashSet::new();
        let mut desired = Vec::new();

        for rr in &self.host_records {
            if seen.insert(rr.clone()) {
                desired.push(rr.clone());
            }
        }

        let mut ids: Vec<&String> = self.containers.keys().collect();
        ids.sort();
        for id in ids {
            for rr in self.containers[id].records() {
                if seen.insert(rr.clone()) {
                    desired.push(rr.clone());
                }
            }
        }
        desired
    }

    /// Withdraw everything: every tracked container's records, then the
    /// shared discovery records. Used at graceful shutdown; errors are
    /// logged rather than propagated since the loop is about to exit.
    async fn suppress_all(&mut self) {
        info!("suppressing all published records");
        let containers: Vec<Container> = self.containers.drain().map(|(_, c)| c).collect();

        for backend in &mut self.backends {
            for container in &containers {
                if let Err(e) = container.suppress_records(backend.as_mut()).await {
                    error!(backend = backend.name(), error = %e, "failed to suppress container records at shutdown");
                }
            }
            if let Err(e) = backend.suppress_shared_records().await {
                error!(backend = backend.name(), error = %e, "failed to suppress shared records at shutdown");
            }
        }
    }

    async fn for_each_backend(
        &mut self,
        container: &Container,
        mutation: Mutation,
    ) -> Result<(), Error> {
        for backend in &mut self.backends {
            let result = match mutation {
                Mutation::Publish => container.publish_records(backend.as_mut()).await,
                Mutation::Suppress => container.suppress_records(backend.as_mut()).await,
            };
            if let Err(e) = result {
                return Err(fatal(backend.name(), e));
            }
        }
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum Mutation {
    Publish,
    Suppress,
}

fn fatal(backend: &str, source: BackendError) -> Error {
    Error::Backend {
        backend: backend.to_string(),
        source,
    }
}

/// Wire up and run the daemon: watcher, reconcile timer, shutdown
/// forwarding, and the event loop itself. Returns when the loop exits.
pub async fn run(config: Config, shutdown: CancellationToken) -> Result<(), Error> {
    let host = config.daemon.host_context()?;
    let host_records = config.daemon.host_records(&host);
    let backends = backend::from_config(&config, &host.base_domain)?;

    let client = DockerClient::new(&config.daemon.docker_host)?;
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(client.clone());

    let (tx, rx) = event::queue(config.daemon.event_queue_depth);

    let watcher = DockerWatcher::new(client, tx.clone());
    let watcher_handle = tokio::spawn(watcher.run(shutdown.clone()));

    let timer_handle = tokio::spawn(reconcile_timer(
        tx.clone(),
        Duration::from_secs(config.daemon.reconcile_interval_secs.max(1)),
        shutdown.clone(),
    ));

    let shutdown_handle = tokio::spawn(forward_shutdown(
        tx.clone(),
        shutdown.clone(),
        config.daemon.suppress_on_shutdown,
    ));

    crate::metrics::record_start_timestamp();

    // Converge on whatever already exists before trusting the event stream.
    if tx.send(Event::ReconcileAll).await.is_err() {
        return Err(Error::QueueClosed);
    }
    drop(tx);

    let system = System::new(host, host_records, backends, runtime, rx);
    let result = system.run().await;

    shutdown.cancel();
    let _ = watcher_handle.await;
    let _ = timer_handle.await;
    let _ = shutdown_handle.await;

    result
}

/// Enqueue a full reconciliation on an interval.
async fn reconcile_timer(tx: EventSender, interval: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // the first tick fires immediately; startup already reconciles
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {
                debug!("periodic reconciliation");
                if tx.send(Event::ReconcileAll).await.is_err() {
                    return;
                }
            }
        }
    }
}

/// Turn the shutdown signal into queue messages: optionally `SuppressAll`,
/// then `Terminate`.
async fn forward_shutdown(tx: EventSender, shutdown: CancellationToken, suppress: bool) {
    shutdown.cancelled().await;
    if suppress {
        let _ = tx.send(Event::SuppressAll).await;
    }
    let _ = tx.send(Event::Terminate).await;
}
