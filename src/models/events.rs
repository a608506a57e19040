use serde::Serialize;
use time::OffsetDateTime;

use super::state::ConnectionState;

/// A single state transition, published to all bridge subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct StateChange {
    pub device_id: String,
    pub old_state: ConnectionState,
    pub new_state: ConnectionState,
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
    /// Human-readable detail for the host's status string (e.g. the error
    /// that caused a drop). `None` for routine transitions.
    pub detail: Option<String>,
}
