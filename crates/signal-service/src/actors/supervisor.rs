//! Room supervisor actor.
//!
//! Owns the room map. Rooms are created lazily on first request and kept
//! when they empty out, so a room key remains a stable rendezvous point
//! for reconnecting clients. A room whose task has died is replaced on
//! the next request for its key.

use crate::actors::messages::{SupervisorMessage, SupervisorStatus};
use crate::actors::room::{RoomActor, RoomActorHandle};
use crate::config::Config;
use crate::errors::SignalError;
use crate::recording::PortAllocator;

use common::types::RoomId;
use media_engine::EngineWorker;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const MAILBOX_CAPACITY: usize = 64;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Handle for interacting with the room supervisor.
#[derive(Clone)]
pub struct RoomSupervisorHandle {
    sender: mpsc::Sender<SupervisorMessage>,
    cancel_token: CancellationToken,
}

impl RoomSupervisorHandle {
    /// Spawn the supervisor actor.
    #[must_use]
    pub fn new(
        worker: Arc<dyn EngineWorker>,
        config: Arc<Config>,
        cancel_token: CancellationToken,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(MAILBOX_CAPACITY);

        let port_allocator = Arc::new(PortAllocator::new(
            config.record_min_port,
            config.record_max_port,
        ));

        let actor = RoomSupervisorActor {
            receiver,
            cancel_token: cancel_token.clone(),
            worker,
            config,
            port_allocator,
            rooms: HashMap::new(),
        };
        tokio::spawn(actor.run());

        Self {
            sender,
            cancel_token,
        }
    }

    /// Get the actor handle for a room, creating the room on first use.
    pub async fn room_handle(&self, room_id: RoomId) -> Result<RoomActorHandle, SignalError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SupervisorMessage::RoomHandle {
                room_id,
                respond_to: tx,
            })
            .await
            .map_err(|_| SignalError::Internal("room supervisor unavailable".to_string()))?;
        rx.await
            .map_err(|_| SignalError::Internal("room supervisor dropped the request".to_string()))?
    }

    /// Current supervisor status.
    pub async fn status(&self) -> Result<SupervisorStatus, SignalError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SupervisorMessage::GetStatus { respond_to: tx })
            .await
            .map_err(|_| SignalError::Internal("room supervisor unavailable".to_string()))?;
        rx.await
            .map_err(|_| SignalError::Internal("room supervisor dropped the request".to_string()))
    }

    /// Signal the supervisor (and every room) to shut down.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

struct ManagedRoom {
    handle: RoomActorHandle,
    task: JoinHandle<()>,
}

struct RoomSupervisorActor {
    receiver: mpsc::Receiver<SupervisorMessage>,
    cancel_token: CancellationToken,
    worker: Arc<dyn EngineWorker>,
    config: Arc<Config>,
    /// Shared across rooms: the recording port range is a service-wide
    /// resource.
    port_allocator: Arc<PortAllocator>,
    rooms: HashMap<RoomId, ManagedRoom>,
}

impl RoomSupervisorActor {
    async fn run(mut self) {
        info!(target: "supervisor", "room supervisor started");

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => break,
                message = self.receiver.recv() => match message {
                    Some(message) => self.handle_message(message),
                    None => break,
                },
            }
        }

        self.shutdown().await;
        info!(target: "supervisor", "room supervisor stopped");
    }

    fn handle_message(&mut self, message: SupervisorMessage) {
        match message {
            SupervisorMessage::RoomHandle {
                room_id,
                respond_to,
            } => {
                let _ = respond_to.send(Ok(self.room_handle(room_id)));
            }
            SupervisorMessage::GetStatus { respond_to } => {
                let _ = respond_to.send(SupervisorStatus {
                    room_count: self.rooms.len(),
                });
            }
        }
    }

    fn room_handle(&mut self, room_id: RoomId) -> RoomActorHandle {
        // Reap a room whose task has ended (panic or engine loss); its
        // key gets a fresh actor.
        if let Some(managed) = self.rooms.get(&room_id) {
            if managed.task.is_finished() {
                warn!(target: "supervisor", room_id = %room_id, "room actor task ended, replacing");
                self.rooms.remove(&room_id);
            }
        }

        if let Some(managed) = self.rooms.get(&room_id) {
            return managed.handle.clone();
        }

        debug!(target: "supervisor", room_id = %room_id, "creating room");
        let (handle, task) = RoomActor::spawn(
            room_id.clone(),
            Arc::clone(&self.worker),
            Arc::clone(&self.config),
            Arc::clone(&self.port_allocator),
            self.cancel_token.child_token(),
        );
        self.rooms.insert(
            room_id,
            ManagedRoom {
                handle: handle.clone(),
                task,
            },
        );
        handle
    }

    async fn shutdown(&mut self) {
        for (room_id, managed) in self.rooms.drain() {
            managed.handle.cancel();
            match tokio::time::timeout(SHUTDOWN_GRACE, managed.task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(target: "supervisor", room_id = %room_id, error = %e, "room task failed during shutdown");
                }
                Err(_) => {
                    warn!(target: "supervisor", room_id = %room_id, "room did not stop within the grace period");
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use common::types::ClientId;
    use media_engine::loopback::{LoopbackWorker, WorkerSettings};
    use std::collections::HashMap as StdHashMap;

    fn supervisor(worker: &Arc<LoopbackWorker>) -> RoomSupervisorHandle {
        RoomSupervisorHandle::new(
            Arc::clone(worker) as Arc<dyn EngineWorker>,
            Arc::new(Config::from_vars(&StdHashMap::new()).unwrap()),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_same_key_returns_same_room() {
        let worker = LoopbackWorker::spawn(WorkerSettings::default());
        let supervisor = supervisor(&worker);

        let first = supervisor.room_handle(RoomId::from("alpha")).await.unwrap();
        let second = supervisor.room_handle(RoomId::from("alpha")).await.unwrap();

        // Both handles reach the same actor: a join through one is
        // visible through the other.
        let (tx, _rx) = tokio::sync::mpsc::channel(16);
        first.join(ClientId::new(), tx).await.unwrap();
        assert_eq!(second.occupant_count().await.unwrap(), 0);

        assert_eq!(supervisor.status().await.unwrap().room_count, 1);
        worker.close();
    }

    #[tokio::test]
    async fn test_rooms_survive_emptying() {
        let worker = LoopbackWorker::spawn(WorkerSettings::default());
        let supervisor = supervisor(&worker);

        let room = supervisor.room_handle(RoomId::from("beta")).await.unwrap();
        let client = ClientId::new();
        let (tx, _rx) = tokio::sync::mpsc::channel(16);
        room.join(client, tx).await.unwrap();
        room.disconnect(client).await;

        assert_eq!(supervisor.status().await.unwrap().room_count, 1);

        // The same key still reaches a live actor with its router intact.
        supervisor.room_handle(RoomId::from("beta")).await.unwrap();
        assert_eq!(worker.routers_created(), 1);

        worker.close();
    }

    #[tokio::test]
    async fn test_distinct_keys_get_distinct_rooms() {
        let worker = LoopbackWorker::spawn(WorkerSettings::default());
        let supervisor = supervisor(&worker);

        supervisor.room_handle(RoomId::from("a")).await.unwrap();
        supervisor.room_handle(RoomId::from("b")).await.unwrap();

        assert_eq!(supervisor.status().await.unwrap().room_count, 2);
        worker.close();
    }

    #[tokio::test]
    async fn test_cancel_stops_rooms() {
        let worker = LoopbackWorker::spawn(WorkerSettings::default());
        let supervisor = supervisor(&worker);

        let room = supervisor.room_handle(RoomId::from("gamma")).await.unwrap();
        supervisor.cancel();

        // Give the shutdown a moment to propagate to the child actor.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(room.is_cancelled());

        worker.close();
    }
}
