//! Wiring of the pipeline.

use std::sync::Arc;

use sequent_core::clock::{SharedClock, SystemClock};
use sequent_core::command::Command;
use sequent_core::config::EngineConfig;
use sequent_core::error::EngineError;
use sequent_core::store::{CommandStore, EventStore, SnapshotStore, WatermarkStore};
use tracing::info;
use uuid::Uuid;

use crate::bus::{CommandBus, CommandHandle};
use crate::envelope::CommandEnvelope;
use crate::error::ExecuteError;
use crate::process_manager::{ProcessManager, ProcessManagerSubscriber};
use crate::processor::{CommandProcessor, CommandResult};
use crate::publisher::{EventSubscriber, Publisher};
use crate::registry::Registry;
use crate::repository::Repository;
use crate::sequencer::Sequencer;
use crate::snapshotter::Snapshotter;

/// A running command pipeline.
#[derive(Clone)]
pub struct Engine {
    bus: CommandBus,
    processor: Arc<CommandProcessor>,
    publisher: Publisher,
    repository: Repository,
}

impl Engine {
    /// Starts configuring an engine.
    #[must_use]
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    /// Queues a command. See [`CommandBus::send`].
    #[must_use]
    pub fn send<C: Command>(&self, command: C) -> CommandHandle {
        self.bus.send(command)
    }

    /// Sends a command and waits for the outcome.
    ///
    /// # Errors
    ///
    /// See [`ExecuteError`].
    pub async fn execute<C: Command>(&self, command: C) -> Result<CommandResult, ExecuteError> {
        self.bus.execute(command).await
    }

    /// The command bus, cheap to clone into request handlers.
    #[must_use]
    pub fn bus(&self) -> &CommandBus {
        &self.bus
    }

    /// The processor behind the sequencer. Calling it directly skips
    /// per-aggregate ordering; correctness then rests on the event store's
    /// version check alone.
    #[must_use]
    pub fn processor(&self) -> &Arc<CommandProcessor> {
        &self.processor
    }

    /// Runs a wrapped command on the processor directly.
    ///
    /// # Errors
    ///
    /// See [`ExecuteError`].
    pub async fn process_unsequenced(
        &self,
        envelope: &CommandEnvelope,
    ) -> Result<CommandResult, ExecuteError> {
        self.processor.process(envelope).await
    }

    /// The publisher delivering committed streams.
    #[must_use]
    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    /// Read access to aggregates.
    #[must_use]
    pub fn repository(&self) -> &Repository {
        &self.repository
    }

    /// Adds a subscriber at runtime.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Misconfiguration` for a duplicate name.
    pub fn subscribe(&self, subscriber: Arc<dyn EventSubscriber>) -> Result<(), EngineError> {
        self.publisher.subscribe(subscriber)
    }

    /// Registers a process manager whose follow-up commands go through this
    /// engine's bus.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Misconfiguration` for a duplicate name.
    pub fn register_process_manager<P: ProcessManager>(&self, manager: P) -> Result<(), EngineError> {
        self.publisher.subscribe(Arc::new(ProcessManagerSubscriber {
            manager,
            bus: self.bus.clone(),
        }))
    }

    /// Re-queues every stream subscribers have not acknowledged yet.
    ///
    /// # Errors
    ///
    /// Returns the event or watermark store's error.
    pub async fn resume(&self) -> Result<usize, EngineError> {
        self.publisher.resume_all().await
    }

    /// Re-queues unacknowledged streams of one aggregate.
    ///
    /// # Errors
    ///
    /// Returns the event or watermark store's error.
    pub async fn catch_up(&self, aggregate_id: Uuid) -> Result<usize, EngineError> {
        self.publisher.catch_up(aggregate_id).await
    }

    /// Stops accepting commands and stops delivery retries.
    pub fn shutdown(&self) {
        self.bus.close();
        self.publisher.shutdown();
        info!("engine shut down");
    }
}

/// Assembles an [`Engine`]. The event, command and watermark stores and the
/// registry are required; the snapshot store is optional.
#[derive(Default)]
pub struct EngineBuilder {
    config: EngineConfig,
    registry: Option<Registry>,
    events: Option<Arc<dyn EventStore>>,
    commands: Option<Arc<dyn CommandStore>>,
    snapshots: Option<Arc<dyn SnapshotStore>>,
    watermarks: Option<Arc<dyn WatermarkStore>>,
    clock: Option<SharedClock>,
    subscribers: Vec<Arc<dyn EventSubscriber>>,
}

impl EngineBuilder {
    /// Replaces the default configuration.
    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the handler registry.
    #[must_use]
    pub fn registry(mut self, registry: Registry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Sets the event store.
    #[must_use]
    pub fn event_store(mut self, store: Arc<dyn EventStore>) -> Self {
        self.events = Some(store);
        self
    }

    /// Sets the handled-command store.
    #[must_use]
    pub fn command_store(mut self, store: Arc<dyn CommandStore>) -> Self {
        self.commands = Some(store);
        self
    }

    /// Enables snapshots.
    #[must_use]
    pub fn snapshot_store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.snapshots = Some(store);
        self
    }

    /// Sets the watermark store.
    #[must_use]
    pub fn watermark_store(mut self, store: Arc<dyn WatermarkStore>) -> Self {
        self.watermarks = Some(store);
        self
    }

    /// Overrides the system clock.
    #[must_use]
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Adds a subscriber present from the start.
    #[must_use]
    pub fn subscriber(mut self, subscriber: Arc<dyn EventSubscriber>) -> Self {
        self.subscribers.push(subscriber);
        self
    }

    /// Builds the engine. Must be called inside a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Misconfiguration` if a required part is missing,
    /// the worker limit is zero, or two subscribers share a name.
    pub fn build(self) -> Result<Engine, EngineError> {
        let missing = |part: &str| EngineError::Misconfiguration(format!("engine needs {part}"));
        let registry = Arc::new(self.registry.ok_or_else(|| missing("a registry"))?);
        let events = self.events.ok_or_else(|| missing("an event store"))?;
        let commands = self.commands.ok_or_else(|| missing("a command store"))?;
        let watermarks = self.watermarks.ok_or_else(|| missing("a watermark store"))?;
        if self.config.worker_limit == 0 {
            return Err(EngineError::Misconfiguration(
                "worker limit must be at least 1".to_owned(),
            ));
        }
        let clock = self.clock.unwrap_or_else(SystemClock::shared);

        let publisher = Publisher::new(watermarks, Some(Arc::clone(&events)), &self.config);
        for subscriber in self.subscribers {
            publisher.subscribe(subscriber)?;
        }
        let snapshotter = match &self.snapshots {
            Some(store) => Snapshotter::spawn(Arc::clone(store), self.config.snapshot_queue_capacity),
            None => Snapshotter::disabled(),
        };
        let repository = Repository::new(Arc::clone(&events), self.snapshots, Arc::clone(&registry));

        let processor = Arc::new(CommandProcessor {
            registry,
            repository: repository.clone(),
            events,
            commands,
            publisher: publisher.clone(),
            snapshotter,
            clock,
            conflict_retry: self.config.conflict_retry,
        });
        let sequencer = Sequencer::new(Arc::clone(&processor), &self.config);
        let bus = CommandBus::new(sequencer, self.config.default_command_timeout);

        info!(
            worker_limit = self.config.worker_limit,
            subscribers = publisher.subscriber_names().len(),
            "engine started"
        );
        Ok(Engine {
            bus,
            processor,
            publisher,
            repository,
        })
    }
}
