//! Stage service — the four-seat mic panel of a room.
//!
//! DESIGN
//! ======
//! Each room owns one stage document: a fixed array of four seats plus a
//! version counter, persisted as a JSONB row in `stages`. Seat mutations are
//! read-modify-write races by nature (two users tapping the last seat), so
//! every write is a conditional commit: `UPDATE ... WHERE version = $read`.
//! A failed commit means another writer landed first; the operation reloads
//! and re-applies its transition, up to [`COMMIT_ATTEMPTS`] times.
//!
//! Seat transitions themselves are pure functions over the seat array, kept
//! free of IO so the rules (first free seat wins, no double seating, mute is
//! an involution) are testable without a database.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use uuid::Uuid;

// =============================================================================
// TYPES
// =============================================================================

/// Number of mic seats on every stage.
pub const SEAT_COUNT: usize = 4;

/// How many conditional commits to attempt before giving up.
const COMMIT_ATTEMPTS: u32 = 3;

/// A user occupying a seat. Freshly seated users start unmuted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeatOccupant {
    pub user_id: Uuid,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub muted: bool,
    /// Epoch-millis stamp of when the seat was taken.
    pub joined_at: i64,
}

/// The seat array. `None` is an empty seat.
pub type Seats = [Option<SeatOccupant>; SEAT_COUNT];

/// Versioned stage document for one room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageDoc {
    pub seats: Seats,
    pub version: i64,
}

impl StageDoc {
    #[must_use]
    pub fn empty() -> Self {
        Self { seats: Seats::default(), version: 0 }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("stage not found for room {0}")]
    RoomNotFound(Uuid),
    #[error("this account is not allowed on stage")]
    NotAllowed,
    #[error("already seated")]
    AlreadySeated { seat: usize },
    #[error("not seated")]
    NotSeated,
    #[error("stage full")]
    StageFull,
    #[error("seat change lost {attempts} races in a row, try again")]
    Conflict { attempts: u32 },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl crate::frame::ErrorCode for StageError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::RoomNotFound(_) => "E_ROOM_NOT_FOUND",
            Self::NotAllowed => "E_STAGE_NOT_ALLOWED",
            Self::AlreadySeated { .. } => "E_ALREADY_SEATED",
            Self::NotSeated => "E_NOT_SEATED",
            Self::StageFull => "E_STAGE_FULL",
            Self::Conflict { .. } => "E_STAGE_CONFLICT",
            Self::Database(_) => "E_DATABASE",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

// =============================================================================
// SEAT TRANSITIONS (pure)
// =============================================================================

/// Index of the seat a user occupies, if any.
#[must_use]
pub fn seat_of(seats: &Seats, user_id: Uuid) -> Option<usize> {
    seats
        .iter()
        .position(|seat| seat.as_ref().is_some_and(|o| o.user_id == user_id))
}

/// Seat a user in the first empty seat (lowest index wins).
fn take_seat(seats: &mut Seats, occupant: SeatOccupant) -> Result<usize, StageError> {
    if let Some(seat) = seat_of(seats, occupant.user_id) {
        return Err(StageError::AlreadySeated { seat });
    }
    let Some(idx) = seats.iter().position(Option::is_none) else {
        return Err(StageError::StageFull);
    };
    seats[idx] = Some(occupant);
    Ok(idx)
}

/// Clear the seat a user occupies.
fn release_seat(seats: &mut Seats, user_id: Uuid) -> Result<usize, StageError> {
    let idx = seat_of(seats, user_id).ok_or(StageError::NotSeated)?;
    seats[idx] = None;
    Ok(idx)
}

/// Flip a seated user's mute flag, returning the seat and the new flag.
fn flip_mute(seats: &mut Seats, user_id: Uuid) -> Result<(usize, bool), StageError> {
    let idx = seat_of(seats, user_id).ok_or(StageError::NotSeated)?;
    let Some(occupant) = seats[idx].as_mut() else {
        return Err(StageError::NotSeated);
    };
    occupant.muted = !occupant.muted;
    Ok((idx, occupant.muted))
}

// =============================================================================
// STORE
// =============================================================================

/// Versioned load/commit over stage documents.
///
/// `commit` returns `Ok(false)` when `expected_version` no longer matches,
/// meaning a concurrent writer won the race and the caller should reload.
#[async_trait]
pub trait StageStore: Send + Sync {
    async fn load(&self, room_id: Uuid) -> Result<StageDoc, StageError>;
    async fn commit(&self, room_id: Uuid, expected_version: i64, seats: &Seats) -> Result<bool, StageError>;
}

/// Postgres-backed store. The stage row is created together with its room.
pub struct PgStageStore {
    pool: PgPool,
}

impl PgStageStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StageStore for PgStageStore {
    async fn load(&self, room_id: Uuid) -> Result<StageDoc, StageError> {
        let row = sqlx::query("SELECT seats, version FROM stages WHERE room_id = $1")
            .bind(room_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StageError::RoomNotFound(room_id))?;

        let seats: sqlx::types::Json<Seats> = row.get("seats");
        Ok(StageDoc { seats: seats.0, version: row.get("version") })
    }

    async fn commit(&self, room_id: Uuid, expected_version: i64, seats: &Seats) -> Result<bool, StageError> {
        let result = sqlx::query(
            "UPDATE stages SET seats = $1, version = version + 1 WHERE room_id = $2 AND version = $3",
        )
        .bind(sqlx::types::Json(seats))
        .bind(room_id)
        .bind(expected_version)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}

// =============================================================================
// OPERATIONS
// =============================================================================

/// Outcome of a successful stage mutation, ready for broadcast.
#[derive(Debug, Clone)]
pub struct StageChange {
    /// The seat the operation touched.
    pub seat: usize,
    /// The full stage document after the commit.
    pub doc: StageDoc,
}

/// Take the first free seat.
///
/// # Errors
///
/// `NotAllowed` for accounts without the speak flag, `AlreadySeated` if the
/// user holds a seat, `StageFull` when all four are taken, `Conflict` after
/// losing every commit race.
pub async fn request_seat(
    store: &dyn StageStore,
    room_id: Uuid,
    user_id: Uuid,
    display_name: &str,
    avatar_url: Option<&str>,
    can_speak: bool,
) -> Result<StageChange, StageError> {
    if !can_speak {
        return Err(StageError::NotAllowed);
    }
    mutate(store, room_id, |seats| {
        let occupant = SeatOccupant {
            user_id,
            display_name: display_name.to_string(),
            avatar_url: avatar_url.map(str::to_string),
            muted: false,
            joined_at: crate::frame::now_ms(),
        };
        take_seat(seats, occupant)
    })
    .await
}

/// Give up the held seat.
///
/// # Errors
///
/// `NotSeated` if the user holds no seat.
pub async fn leave_seat(store: &dyn StageStore, room_id: Uuid, user_id: Uuid) -> Result<StageChange, StageError> {
    mutate(store, room_id, |seats| release_seat(seats, user_id)).await
}

/// Leave the stage if seated; quietly does nothing otherwise.
///
/// Called when a user parts a room or their last connection drops, so a
/// vanished user never holds a dead seat.
pub async fn leave_seat_if_present(
    store: &dyn StageStore,
    room_id: Uuid,
    user_id: Uuid,
) -> Result<Option<StageChange>, StageError> {
    match leave_seat(store, room_id, user_id).await {
        Ok(change) => Ok(Some(change)),
        Err(StageError::NotSeated) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Toggle the mute flag on the held seat.
///
/// # Errors
///
/// `NotSeated` if the user holds no seat.
pub async fn toggle_mute(store: &dyn StageStore, room_id: Uuid, user_id: Uuid) -> Result<StageChange, StageError> {
    mutate(store, room_id, |seats| flip_mute(seats, user_id).map(|(seat, _)| seat)).await
}

/// Current stage snapshot for a room.
pub async fn snapshot(store: &dyn StageStore, room_id: Uuid) -> Result<StageDoc, StageError> {
    store.load(room_id).await
}

/// Load, apply a pure transition, and conditionally commit. Retries on
/// version conflicts; domain errors from the transition are final.
async fn mutate<F>(store: &dyn StageStore, room_id: Uuid, mut transition: F) -> Result<StageChange, StageError>
where
    F: FnMut(&mut Seats) -> Result<usize, StageError>,
{
    for _ in 0..COMMIT_ATTEMPTS {
        let doc = store.load(room_id).await?;
        let mut seats = doc.seats.clone();
        let seat = transition(&mut seats)?;
        if store.commit(room_id, doc.version, &seats).await? {
            return Ok(StageChange { seat, doc: StageDoc { seats, version: doc.version + 1 } });
        }
        tracing::debug!(%room_id, version = doc.version, "stage commit lost race, retrying");
    }
    Err(StageError::Conflict { attempts: COMMIT_ATTEMPTS })
}

// =============================================================================
// TEST STORE
// =============================================================================


#[cfg(test)]
#[path = "stage_test.rs"]
mod tests;
