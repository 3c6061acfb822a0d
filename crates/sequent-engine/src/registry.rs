//! Command handlers and the registry that routes commands to them.
//!
//! The registry is assembled once at startup with [`RegistryBuilder`] and is
//! immutable afterwards. It knows three things: which handler runs each
//! command type, which aggregate types exist, and how (and how often) each
//! aggregate type is snapshotted.

use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use sequent_core::aggregate::{AggregateRoot, Snapshotable};
use sequent_core::command::Command;
use sequent_core::error::EngineError;
use sequent_core::snapshot::SnapshotPolicy;
use uuid::Uuid;

use crate::context::CommandContext;
use crate::error::{HandlerError, HandlerResult};

/// Business logic for one command type.
///
/// Handlers load aggregates through the [`CommandContext`], call domain
/// methods on them and return. The engine turns whatever the aggregates
/// recorded into streams and commits them. A handler may run more than once
/// for the same command when a commit loses a concurrency race, so it must
/// not have side effects outside the context.
#[async_trait]
pub trait CommandHandler<C: Command>: Send + Sync + 'static {
    /// Handles `command`.
    ///
    /// # Errors
    ///
    /// Returns `HandlerError::Rejected` to refuse the command, or
    /// `HandlerError::System` for failures that should not be recorded.
    async fn handle(&self, command: &C, ctx: &mut CommandContext) -> HandlerResult;
}

#[async_trait]
pub(crate) trait ErasedHandler: Send + Sync {
    async fn handle(
        &self,
        command: &(dyn Any + Send + Sync),
        ctx: &mut CommandContext,
    ) -> HandlerResult;
}

struct TypedHandler<C, H> {
    handler: H,
    _command: PhantomData<fn() -> C>,
}

#[async_trait]
impl<C, H> ErasedHandler for TypedHandler<C, H>
where
    C: Command,
    H: CommandHandler<C>,
{
    async fn handle(
        &self,
        command: &(dyn Any + Send + Sync),
        ctx: &mut CommandContext,
    ) -> HandlerResult {
        let command = command.downcast_ref::<C>().ok_or_else(|| {
            HandlerError::System(EngineError::Misconfiguration(format!(
                "handler for {} was given a different command type",
                C::COMMAND_TYPE
            )))
        })?;
        self.handler.handle(command, ctx).await
    }
}

/// Captures and restores snapshots for one aggregate type.
pub(crate) struct SnapshotCodec<A> {
    pub(crate) capture: fn(&A) -> Result<serde_json::Value, EngineError>,
    pub(crate) restore: fn(Uuid, i64, &serde_json::Value) -> Result<A, EngineError>,
}

impl<A> Clone for SnapshotCodec<A> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<A> Copy for SnapshotCodec<A> {}

/// Snapshot configuration resolved for a concrete aggregate type.
pub(crate) struct SnapshotSettings<A> {
    pub(crate) policy: SnapshotPolicy,
    pub(crate) codec: Option<SnapshotCodec<A>>,
}

impl<A> Clone for SnapshotSettings<A> {
    fn clone(&self) -> Self {
        Self {
            policy: self.policy,
            codec: self.codec,
        }
    }
}

struct AggregateDescriptor {
    type_id: TypeId,
    rust_type: &'static str,
    policy: SnapshotPolicy,
    // A `SnapshotCodec<A>` for the registered `A`.
    codec: Option<Arc<dyn Any + Send + Sync>>,
}

/// Immutable routing table built by [`RegistryBuilder`].
pub struct Registry {
    handlers: HashMap<&'static str, Arc<dyn ErasedHandler>>,
    aggregates: HashMap<&'static str, AggregateDescriptor>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("command_types", &self.handlers.keys().collect::<Vec<_>>())
            .field("aggregate_types", &self.aggregates.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Registry {
    /// Starts an empty registry.
    #[must_use]
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Whether a handler is registered for `command_type`.
    #[must_use]
    pub fn handles(&self, command_type: &str) -> bool {
        self.handlers.contains_key(command_type)
    }

    /// Registered command types, in no particular order.
    pub fn command_types(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.handlers.keys().copied()
    }

    pub(crate) fn handler(&self, command_type: &str) -> Option<Arc<dyn ErasedHandler>> {
        self.handlers.get(command_type).cloned()
    }

    /// Resolves the snapshot settings for `A`.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Misconfiguration` if `A` was never registered or
    /// another type was registered under `A::AGGREGATE_TYPE`.
    pub(crate) fn snapshot_settings<A: AggregateRoot>(
        &self,
    ) -> Result<SnapshotSettings<A>, EngineError> {
        let descriptor = self.aggregates.get(A::AGGREGATE_TYPE).ok_or_else(|| {
            EngineError::Misconfiguration(format!(
                "aggregate type {} is not registered",
                A::AGGREGATE_TYPE
            ))
        })?;
        if descriptor.type_id != TypeId::of::<A>() {
            return Err(EngineError::Misconfiguration(format!(
                "aggregate type {} is registered as {}, not {}",
                A::AGGREGATE_TYPE,
                descriptor.rust_type,
                type_name::<A>()
            )));
        }
        let codec = descriptor
            .codec
            .as_ref()
            .and_then(|codec| codec.downcast_ref::<SnapshotCodec<A>>())
            .copied();
        Ok(SnapshotSettings {
            policy: descriptor.policy,
            codec,
        })
    }
}

/// Collects handlers and aggregate types, then validates them in
/// [`build`](Self::build).
#[derive(Default)]
pub struct RegistryBuilder {
    handlers: HashMap<&'static str, Arc<dyn ErasedHandler>>,
    aggregates: HashMap<&'static str, AggregateDescriptor>,
    problems: Vec<String>,
}

impl RegistryBuilder {
    /// Registers an aggregate type that is always rebuilt by full replay.
    #[must_use]
    pub fn aggregate<A: AggregateRoot>(self) -> Self {
        self.insert_aggregate::<A>(AggregateDescriptor {
            type_id: TypeId::of::<A>(),
            rust_type: type_name::<A>(),
            policy: SnapshotPolicy::Never,
            codec: None,
        })
    }

    /// Registers an aggregate type that is snapshotted according to `policy`.
    /// Existing snapshots are still used on load when `policy` is
    /// [`SnapshotPolicy::Never`].
    #[must_use]
    pub fn snapshotted<A: Snapshotable>(self, policy: SnapshotPolicy) -> Self {
        let codec: SnapshotCodec<A> = SnapshotCodec {
            capture: A::capture_snapshot,
            restore: A::restore,
        };
        self.insert_aggregate::<A>(AggregateDescriptor {
            type_id: TypeId::of::<A>(),
            rust_type: type_name::<A>(),
            policy,
            codec: Some(Arc::new(codec)),
        })
    }

    /// Registers the handler for command type `C`.
    #[must_use]
    pub fn handler<C, H>(mut self, handler: H) -> Self
    where
        C: Command,
        H: CommandHandler<C>,
    {
        let erased: Arc<dyn ErasedHandler> = Arc::new(TypedHandler::<C, H> {
            handler,
            _command: PhantomData,
        });
        match self.handlers.entry(C::COMMAND_TYPE) {
            Entry::Occupied(_) => self.problems.push(format!(
                "command type {} has more than one handler",
                C::COMMAND_TYPE
            )),
            Entry::Vacant(slot) => {
                slot.insert(erased);
            }
        }
        self
    }

    fn insert_aggregate<A: AggregateRoot>(mut self, descriptor: AggregateDescriptor) -> Self {
        match self.aggregates.entry(A::AGGREGATE_TYPE) {
            Entry::Occupied(_) => self.problems.push(format!(
                "aggregate type {} is registered more than once",
                A::AGGREGATE_TYPE
            )),
            Entry::Vacant(slot) => {
                slot.insert(descriptor);
            }
        }
        self
    }

    /// Finishes the registry.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Misconfiguration` listing every duplicate
    /// registration.
    pub fn build(self) -> Result<Registry, EngineError> {
        if !self.problems.is_empty() {
            return Err(EngineError::Misconfiguration(self.problems.join("; ")));
        }
        Ok(Registry {
            handlers: self.handlers,
            aggregates: self.aggregates,
        })
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};
    use sequent_core::event::DomainEvent;

    use super::*;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Pinged;

    impl DomainEvent for Pinged {
        fn event_type(&self) -> &'static str {
            "probe.pinged"
        }
    }

    struct Probe {
        id: Uuid,
        version: i64,
    }

    impl AggregateRoot for Probe {
        type Event = Pinged;
        const AGGREGATE_TYPE: &'static str = "probe";

        fn blank(id: Uuid) -> Self {
            Self { id, version: 0 }
        }
        fn aggregate_id(&self) -> Uuid {
            self.id
        }
        fn version(&self) -> i64 {
            self.version
        }
        fn apply(&mut self, _event: &Pinged) {
            self.version += 1;
        }
        fn uncommitted_events(&self) -> &[Pinged] {
            &[]
        }
        fn take_uncommitted_events(&mut self) -> Vec<Pinged> {
            Vec::new()
        }
    }

    impl Snapshotable for Probe {
        fn capture_snapshot(&self) -> Result<serde_json::Value, EngineError> {
            Ok(serde_json::json!({}))
        }
        fn restore(id: Uuid, version: i64, _: &serde_json::Value) -> Result<Self, EngineError> {
            Ok(Self { id, version })
        }
    }

    struct Impostor;

    impl AggregateRoot for Impostor {
        type Event = Pinged;
        const AGGREGATE_TYPE: &'static str = "probe";

        fn blank(_id: Uuid) -> Self {
            Self
        }
        fn aggregate_id(&self) -> Uuid {
            Uuid::nil()
        }
        fn version(&self) -> i64 {
            0
        }
        fn apply(&mut self, _event: &Pinged) {}
        fn uncommitted_events(&self) -> &[Pinged] {
            &[]
        }
        fn take_uncommitted_events(&mut self) -> Vec<Pinged> {
            Vec::new()
        }
    }

    #[derive(Debug)]
    struct Ping(Uuid);

    impl Command for Ping {
        const COMMAND_TYPE: &'static str = "probe.ping";

        fn command_id(&self) -> Uuid {
            self.0
        }
        fn aggregate_id(&self) -> Uuid {
            self.0
        }
    }

    struct NoopHandler;

    #[async_trait]
    impl CommandHandler<Ping> for NoopHandler {
        async fn handle(&self, _command: &Ping, _ctx: &mut CommandContext) -> HandlerResult {
            Ok(())
        }
    }

    #[test]
    fn test_handlers_are_keyed_by_command_type() {
        let registry = Registry::builder()
            .aggregate::<Probe>()
            .handler::<Ping, _>(NoopHandler)
            .build()
            .unwrap();

        assert!(registry.handles("probe.ping"));
        assert!(!registry.handles("probe.pong"));
        assert!(registry.handler("probe.ping").is_some());
    }

    #[test]
    fn test_duplicate_handler_fails_build() {
        let result = Registry::builder()
            .handler::<Ping, _>(NoopHandler)
            .handler::<Ping, _>(NoopHandler)
            .build();

        assert!(matches!(result, Err(EngineError::Misconfiguration(m)) if m.contains("probe.ping")));
    }

    #[test]
    fn test_snapshot_settings_resolve_codec() {
        let registry = Registry::builder()
            .snapshotted::<Probe>(SnapshotPolicy::EveryNVersions(10))
            .build()
            .unwrap();

        let settings = registry.snapshot_settings::<Probe>().unwrap();

        assert_eq!(settings.policy, SnapshotPolicy::EveryNVersions(10));
        let codec = settings.codec.unwrap();
        let restored = (codec.restore)(Uuid::nil(), 7, &serde_json::json!({})).unwrap();
        assert_eq!(restored.version, 7);
    }

    #[test]
    fn test_plain_aggregate_has_no_codec() {
        let registry = Registry::builder().aggregate::<Probe>().build().unwrap();

        let settings = registry.snapshot_settings::<Probe>().unwrap();

        assert_eq!(settings.policy, SnapshotPolicy::Never);
        assert!(settings.codec.is_none());
    }

    #[test]
    fn test_unregistered_or_mismatched_aggregate_is_misconfiguration() {
        let empty = Registry::builder().build().unwrap();
        assert!(empty.snapshot_settings::<Probe>().is_err());

        let registry = Registry::builder().aggregate::<Probe>().build().unwrap();
        let err = registry.snapshot_settings::<Impostor>().err().unwrap();
        assert!(matches!(err, EngineError::Misconfiguration(m) if m.contains("Impostor")));
    }
}
