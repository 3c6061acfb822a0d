//! The command lifecycle: dedupe, handle, commit, publish, record.

use std::sync::Arc;

use sequent_core::clock::SharedClock;
use sequent_core::command::{CommandOutcome, CommitRef, HandledCommand, Rejection};
use sequent_core::config::RetryPolicy;
use sequent_core::error::EngineError;
use sequent_core::event::EventStream;
use sequent_core::store::{AppendOutcome, CommandStore, EventStore, InsertOutcome};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::context::{CommandContext, TrackedAggregate};
use crate::envelope::CommandEnvelope;
use crate::error::{ExecuteError, HandlerError};
use crate::publisher::Publisher;
use crate::registry::{ErasedHandler, Registry};
use crate::repository::Repository;
use crate::snapshotter::Snapshotter;

/// A successful command.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandResult {
    /// The command that succeeded.
    pub command_id: Uuid,
    /// The streams it committed, empty if it changed nothing.
    pub commits: Vec<CommitRef>,
    /// The value the handler set with `CommandContext::set_result`.
    pub result: serde_json::Value,
    /// `true` when the outcome was recorded by an earlier submission of the
    /// same command and this call only replayed it.
    pub replayed: bool,
}

/// Runs commands end to end.
///
/// The processor does not serialize anything itself: two calls for the same
/// aggregate may race, and the event store's version check decides the
/// winner. The sequencer in front of it makes such races rare.
pub struct CommandProcessor {
    pub(crate) registry: Arc<Registry>,
    pub(crate) repository: Repository,
    pub(crate) events: Arc<dyn EventStore>,
    pub(crate) commands: Arc<dyn CommandStore>,
    pub(crate) publisher: Publisher,
    pub(crate) snapshotter: Snapshotter,
    pub(crate) clock: SharedClock,
    pub(crate) conflict_retry: RetryPolicy,
}

enum Attempt {
    Committed {
        commits: Vec<Commit>,
        tracked: Vec<Box<dyn TrackedAggregate>>,
        result: serde_json::Value,
    },
    Rejected(Rejection),
    Conflict {
        aggregate_id: Uuid,
        expected: i64,
        actual: i64,
    },
}

struct Commit {
    stream: EventStream,
    // Index into the tracked aggregates when this attempt wrote the stream,
    // `None` when an earlier attempt had already written it.
    written_by: Option<usize>,
}

impl CommandProcessor {
    /// Executes a command without going through the sequencer.
    ///
    /// # Errors
    ///
    /// See [`ExecuteError`]. `Rejected` outcomes are recorded and replayed on
    /// resubmission; `System` failures are not recorded.
    #[instrument(
        name = "command",
        skip_all,
        fields(
            command_id = %envelope.command_id,
            command_type = envelope.command_type,
            aggregate_id = %envelope.aggregate_id,
            correlation_id = %envelope.correlation_id,
        )
    )]
    pub async fn process(&self, envelope: &CommandEnvelope) -> Result<CommandResult, ExecuteError> {
        if let Some(handled) = self.commands.get(envelope.command_id).await? {
            debug!("command already handled; replaying outcome");
            return into_result(handled.command_id, handled.outcome, true);
        }
        let handler = self
            .registry
            .handler(envelope.command_type)
            .ok_or_else(|| ExecuteError::HandlerNotFound(envelope.command_type.to_owned()))?;

        let mut retries = 0;
        loop {
            match self.attempt(envelope, handler.as_ref()).await? {
                Attempt::Committed {
                    commits,
                    tracked,
                    result,
                } => return self.complete(envelope, commits, &tracked, result).await,
                Attempt::Rejected(rejection) => {
                    info!(code = %rejection.code, "command rejected");
                    let (outcome, replayed) = self
                        .record(envelope, CommandOutcome::Rejected(rejection))
                        .await?;
                    return into_result(envelope.command_id, outcome, replayed);
                }
                Attempt::Conflict {
                    aggregate_id,
                    expected,
                    actual,
                } => {
                    if retries >= self.conflict_retry.max_retries {
                        warn!(%aggregate_id, retries, "giving up after repeated conflicts");
                        return Err(ExecuteError::ConcurrencyConflict {
                            aggregate_id,
                            attempts: retries + 1,
                        });
                    }
                    let delay = self.conflict_retry.backoff(retries);
                    retries += 1;
                    debug!(
                        %aggregate_id,
                        expected,
                        actual,
                        retries,
                        ?delay,
                        "concurrency conflict; reloading"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn attempt(
        &self,
        envelope: &CommandEnvelope,
        handler: &dyn ErasedHandler,
    ) -> Result<Attempt, ExecuteError> {
        let mut ctx = CommandContext::new(self.repository.clone(), self.clock.clone(), envelope);
        match handler.handle(&*envelope.payload, &mut ctx).await {
            Ok(()) => {}
            Err(HandlerError::Rejected(rejection)) => return Ok(Attempt::Rejected(rejection)),
            Err(HandlerError::System(EngineError::ConcurrencyConflict {
                aggregate_id,
                expected,
                actual,
            })) => {
                return Ok(Attempt::Conflict {
                    aggregate_id,
                    expected,
                    actual,
                });
            }
            Err(HandlerError::System(err)) => return Err(err.into()),
        }

        let meta = ctx.stream_meta();
        let (mut tracked, result) = ctx.into_parts();
        let timestamp = self.clock.now();
        let mut commits = Vec::new();
        for (index, aggregate) in tracked.iter_mut().enumerate() {
            let Some(stream) = aggregate.build_stream(&meta, timestamp)? else {
                continue;
            };
            match self.events.append_stream(stream).await {
                Ok(AppendOutcome::Persisted(stream)) => commits.push(Commit {
                    stream,
                    written_by: Some(index),
                }),
                Ok(AppendOutcome::Duplicate(existing)) => {
                    debug!(
                        aggregate_id = %existing.aggregate_id,
                        version = existing.version(),
                        "stream was committed by an earlier attempt"
                    );
                    commits.push(Commit {
                        stream: existing,
                        written_by: None,
                    });
                }
                Err(EngineError::ConcurrencyConflict {
                    aggregate_id,
                    expected,
                    actual,
                }) => {
                    return Ok(Attempt::Conflict {
                        aggregate_id,
                        expected,
                        actual,
                    });
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(Attempt::Committed {
            commits,
            tracked,
            result,
        })
    }

    async fn complete(
        &self,
        envelope: &CommandEnvelope,
        commits: Vec<Commit>,
        tracked: &[Box<dyn TrackedAggregate>],
        result: serde_json::Value,
    ) -> Result<CommandResult, ExecuteError> {
        let now = self.clock.now();
        for index in commits.iter().filter_map(|commit| commit.written_by) {
            match tracked[index].snapshot(now) {
                Some(Ok(snapshot)) => {
                    self.snapshotter.offer(snapshot);
                }
                Some(Err(err)) => warn!(
                    aggregate_id = %tracked[index].aggregate_id(),
                    error = %err,
                    "snapshot capture failed"
                ),
                None => {}
            }
        }

        let refs = commits.iter().map(|commit| commit_ref(&commit.stream)).collect();
        for commit in commits {
            self.publisher.submit(commit.stream);
        }

        let (outcome, replayed) = self
            .record(
                envelope,
                CommandOutcome::Succeeded {
                    commits: refs,
                    result,
                },
            )
            .await?;
        info!("command succeeded");
        into_result(envelope.command_id, outcome, replayed)
    }

    /// Records the outcome and returns the one that won if another
    /// submission of the same command recorded first.
    async fn record(
        &self,
        envelope: &CommandEnvelope,
        outcome: CommandOutcome,
    ) -> Result<(CommandOutcome, bool), ExecuteError> {
        let handled = HandledCommand {
            command_id: envelope.command_id,
            aggregate_id: envelope.aggregate_id,
            command_type: envelope.command_type.to_owned(),
            outcome: outcome.clone(),
            handled_at: self.clock.now(),
        };
        match self.commands.try_insert(handled).await? {
            InsertOutcome::Inserted => Ok((outcome, false)),
            InsertOutcome::AlreadyExists(existing) => {
                debug!("another submission recorded this command first");
                Ok((existing.outcome, true))
            }
        }
    }
}

fn into_result(
    command_id: Uuid,
    outcome: CommandOutcome,
    replayed: bool,
) -> Result<CommandResult, ExecuteError> {
    match outcome {
        CommandOutcome::Succeeded { commits, result } => Ok(CommandResult {
            command_id,
            commits,
            result,
            replayed,
        }),
        CommandOutcome::Rejected(rejection) => Err(ExecuteError::Rejected(rejection)),
    }
}

fn commit_ref(stream: &EventStream) -> CommitRef {
    CommitRef {
        aggregate_id: stream.aggregate_id,
        aggregate_type: stream.aggregate_type.clone(),
        version: stream.version(),
        event_count: stream.events.len(),
    }
}
