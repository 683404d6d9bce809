//! Common type definitions.
//!
//! All entity IDs are UUIDs wrapped in type aliases for better type safety:
//!
//! - [`AccountId`]: Credit account identifier
//! - [`ReservationId`]: Funds-reservation identifier
//! - [`AssetId`]: Generated-asset identifier
//! - [`ModelId`]: Catalog model identifier
//! - [`FilterId`]: Catalog filter identifier

use uuid::Uuid;

pub type AccountId = Uuid;
pub type ReservationId = Uuid;
pub type AssetId = Uuid;
pub type ModelId = Uuid;
pub type FilterId = Uuid;

/// Abbreviate a UUID to its first 8 characters for more readable logs
/// Example: "550e8400-e29b-41d4-a716-446655440000" -> "550e8400"
pub fn abbrev_uuid(uuid: &Uuid) -> String {
    uuid.to_string().chars().take(8).collect()
}
