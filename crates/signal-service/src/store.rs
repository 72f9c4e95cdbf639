//! Room metadata store.
//!
//! A minimal keyed collection of room records (`{id → {name}}`) with
//! create / find-all / delete, plus the REST routes that expose it. The
//! in-memory map stands in for a database-backed collection behind the
//! same interface; signaling never touches it.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

/// One stored room record.
#[derive(Debug, Clone, Serialize)]
pub struct RoomRecord {
    pub id: Uuid,
    pub name: String,
}

/// Body of `POST /rooms`.
#[derive(Debug, Deserialize)]
pub struct CreateRoomRequest {
    pub name: String,
}

/// In-memory room metadata collection.
#[derive(Clone, Default)]
pub struct RoomStore {
    records: Arc<RwLock<HashMap<Uuid, RoomRecord>>>,
}

impl RoomStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create(&self, name: String) -> RoomRecord {
        let record = RoomRecord {
            id: Uuid::new_v4(),
            name,
        };
        self.records
            .write()
            .await
            .insert(record.id, record.clone());
        info!(target: "store", id = %record.id, name = %record.name, "room record created");
        record
    }

    pub async fn find_all(&self) -> Vec<RoomRecord> {
        self.records.read().await.values().cloned().collect()
    }

    /// Delete a record; `false` when the id was unknown.
    pub async fn delete(&self, id: Uuid) -> bool {
        self.records.write().await.remove(&id).is_some()
    }
}

/// REST routes over the store (`POST /rooms`, `GET /rooms`,
/// `DELETE /rooms/:id`).
pub fn router(store: RoomStore) -> Router {
    Router::new()
        .route("/rooms", get(list_rooms).post(create_room))
        .route("/rooms/:id", delete(delete_room))
        .with_state(store)
}

async fn create_room(
    State(store): State<RoomStore>,
    Json(request): Json<CreateRoomRequest>,
) -> impl IntoResponse {
    let record = store.create(request.name).await;
    (StatusCode::CREATED, Json(record))
}

async fn list_rooms(State(store): State<RoomStore>) -> Json<Vec<RoomRecord>> {
    Json(store.find_all().await)
}

async fn delete_room(State(store): State<RoomStore>, Path(id): Path<Uuid>) -> StatusCode {
    if store.delete(id).await {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}
