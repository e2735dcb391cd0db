//! Bounded asynchronous command queue.
//!
//! Commands are executed one at a time by a worker task, in submission
//! order. The queue lives in memory only; anything not yet executed is lost
//! on a crash.

use crate::command::{CommandOutcome, CommandRegistry, EntityCommand};
use crate::error::CommandError;
use parking_lot::Mutex;
use std::any::{type_name, Any, TypeId};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Default queue capacity.
pub const DEFAULT_CAPACITY: usize = 256;

struct Job {
    type_id: TypeId,
    command_type: &'static str,
    name: &'static str,
    entity_id: String,
    command: Box<dyn Any + Send>,
    reply: oneshot::Sender<Result<CommandOutcome, CommandError>>,
}

/// Feeds commands to a [`CommandRegistry`] from a single worker.
pub struct CommandQueue {
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CommandQueue {
    /// Spawns the worker. Must be called inside a tokio runtime.
    pub fn start(registry: Arc<CommandRegistry>, capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let worker = tokio::spawn(run_worker(registry, receiver));
        Self {
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Enqueues `command` and waits for its result. Waits for space when the
    /// queue is full.
    pub async fn submit<C: EntityCommand>(
        &self,
        command: C,
    ) -> Result<CommandOutcome, CommandError> {
        let sender = self
            .sender
            .lock()
            .clone()
            .ok_or(CommandError::QueueClosed)?;

        let (reply, result) = oneshot::channel();
        let job = Job {
            type_id: TypeId::of::<C>(),
            command_type: type_name::<C>(),
            name: command.name(),
            entity_id: command.entity_id().to_string(),
            command: Box::new(command),
            reply,
        };
        sender.send(job).await.map_err(|_| CommandError::QueueClosed)?;
        result.await.map_err(|_| CommandError::QueueClosed)?
    }

    /// Commands waiting for the worker.
    pub fn pending(&self) -> usize {
        self.sender
            .lock()
            .as_ref()
            .map_or(0, |s| s.max_capacity() - s.capacity())
    }

    /// Stops accepting commands, lets the worker drain what is queued, and
    /// waits for it to exit.
    pub async fn shutdown(&self) {
        self.sender.lock().take();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                tracing::error!(error = %e, "command queue worker failed");
            }
        }
    }
}

async fn run_worker(registry: Arc<CommandRegistry>, mut receiver: mpsc::Receiver<Job>) {
    tracing::debug!("Command queue worker started");
    while let Some(job) = receiver.recv().await {
        let result = registry
            .execute_boxed(job.type_id, job.command_type, job.name, job.command)
            .await;
        if let Err(e) = &result {
            tracing::debug!(
                command = job.name,
                id = %job.entity_id,
                error = %e,
                "queued command failed"
            );
        }
        // The submitter may have given up waiting.
        let _ = job.reply.send(result);
    }
    tracing::debug!("Command queue worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandHandler, EntityCommandHandler};
    use crate::testing::{clock, seed, store, Task, TaskState};
    use async_trait::async_trait;
    use leasehold_core::Entity;
    use leasehold_storage::EntityStore;

    struct Note {
        id: String,
        text: String,
    }

    impl EntityCommand for Note {
        fn entity_id(&self) -> &str {
            &self.id
        }

        fn name(&self) -> &'static str {
            "note"
        }
    }

    struct NoteHandler;

    #[async_trait]
    impl CommandHandler for NoteHandler {
        type Command = Note;
        type Payload = Task;

        fn modify(&self, entity: &mut Entity<Task>, c: &Note) -> Result<bool, CommandError> {
            entity.payload.note.push_str(&c.text);
            Ok(true)
        }
    }

    async fn queue_over(
        store: Arc<leasehold_storage::InMemoryEntityStore<Task>>,
        capacity: usize,
    ) -> CommandQueue {
        let mut registry = CommandRegistry::new();
        registry.register(EntityCommandHandler::new(NoteHandler, store));
        CommandQueue::start(Arc::new(registry), capacity)
    }

    #[tokio::test]
    async fn test_submit_returns_handler_result() {
        let store = store(clock());
        seed(&store, 1, TaskState::Ready).await;
        let queue = queue_over(store.clone(), 4).await;

        let out = queue
            .submit(Note {
                id: "t-000".into(),
                text: "a".into(),
            })
            .await
            .unwrap();
        assert!(out.changed);

        let err = queue
            .submit(Note {
                id: "missing".into(),
                text: "b".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::NotFound { .. }));
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_concurrent_submissions_are_serialized() {
        let store = store(clock());
        seed(&store, 1, TaskState::Ready).await;
        let queue = Arc::new(queue_over(store.clone(), 2).await);

        let mut handles = Vec::new();
        for text in ["a", "b", "c", "d", "e"] {
            let q = queue.clone();
            handles.push(tokio::spawn(async move {
                q.submit(Note {
                    id: "t-000".into(),
                    text: text.into(),
                })
                .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        // One worker: no save ever conflicts, so every note lands.
        let stored = store.find("t-000").await.unwrap();
        assert_eq!(stored.payload.note.len(), 5);
        assert_eq!(stored.version(), 6);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_is_rejected() {
        let store = store(clock());
        let queue = queue_over(store, 1).await;
        queue.shutdown().await;
        queue.shutdown().await;

        let err = queue
            .submit(Note {
                id: "t-000".into(),
                text: "x".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::QueueClosed));
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn test_unregistered_command_through_queue() {
        struct Other;
        impl EntityCommand for Other {
            fn entity_id(&self) -> &str {
                "x"
            }
            fn name(&self) -> &'static str {
                "other"
            }
        }

        let queue = queue_over(store(clock()), 1).await;
        let err = queue.submit(Other).await.unwrap_err();
        assert_eq!(err.error_code(), "NO_HANDLER");
        queue.shutdown().await;
    }
}
