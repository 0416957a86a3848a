//! Utility functions for identifiers and timestamp handling.

pub mod timestamps;

pub use timestamps::{
    compact_timestamp, format_elapsed, format_iso8601, iso_timestamp, now_utc, Timestamp,
};

use uuid::Uuid;

/// Generates a new session identifier (UUID v4).
#[must_use]
pub fn generate_session_id() -> Uuid {
    Uuid::new_v4()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_session_id_is_v4() {
        let id = generate_session_id();
        assert_eq!(id.get_version_num(), 4);
        assert_ne!(id, generate_session_id());
    }
}
