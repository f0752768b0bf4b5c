//! Reservation CRUD handlers.
//!
//! # Endpoints
//!
//! - `GET /reservations[?name=]` - List all, or those with an exact name
//! - `POST /reservations` - Create one
//! - `POST /reservations/batch` - Create several, all or nothing
//! - `GET /reservations/{id}` - Fetch one
//! - `DELETE /reservations/{id}` - Delete one

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use tracing::instrument;

use crate::error::AppResult;
use crate::models::{BatchReservationRequest, NewReservation, Reservation, ReservationQuery};
use crate::state::AppState;

#[instrument(skip(state))]
pub async fn list_reservations(
    State(state): State<AppState>,
    Query(query): Query<ReservationQuery>,
) -> AppResult<Json<Vec<Reservation>>> {
    let reservations = state.reservations.list(query.name.as_deref()).await?;
    Ok(Json(reservations))
}

/// Create a reservation.
///
/// # Request Body
///
/// ```json
/// { "name": "Josh" }
/// ```
#[instrument(skip(state, payload))]
pub async fn create_reservation(
    State(state): State<AppState>,
    Json(payload): Json<NewReservation>,
) -> AppResult<(StatusCode, Json<Reservation>)> {
    let saved = state.reservations.create(&payload.name).await?;
    Ok((StatusCode::CREATED, Json(saved)))
}

/// Create several reservations in one transaction.
///
/// A single invalid name rejects the whole batch with 400 and nothing is
/// stored.
///
/// # Request Body
///
/// ```json
/// { "names": ["Josh", "Cornelia"] }
/// ```
#[instrument(skip(state, payload), fields(batch_size = payload.names.len()))]
pub async fn create_batch(
    State(state): State<AppState>,
    Json(payload): Json<BatchReservationRequest>,
) -> AppResult<(StatusCode, Json<Vec<Reservation>>)> {
    let saved = state.reservations.save_all_by_name(&payload.names).await?;
    Ok((StatusCode::CREATED, Json(saved)))
}

#[instrument(skip(state))]
pub async fn get_reservation(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> AppResult<Json<Reservation>> {
    Ok(Json(state.reservations.get(id).await?))
}

#[instrument(skip(state))]
pub async fn delete_reservation(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> AppResult<StatusCode> {
    state.reservations.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}
