//! converge-common - Shared types and constants
//!
//! This crate holds the SDK-free pieces shared by the convergence core, the
//! AWS adapters and the CLI.
//!
//! ## Modules
//!
//! - [`defaults`]: Default polling, retry and concurrency values
//! - [`resource_kind`]: Resource kinds and their capability table

pub mod defaults;
pub mod resource_kind;

pub use resource_kind::{Capabilities, ResourceKind};

/// Get the current timestamp in milliseconds since UNIX epoch.
///
/// Returns 0 if system time is before the epoch (should never happen in practice).
#[inline]
pub fn timestamp_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Current wall-clock time in hundredths of a second.
///
/// Used as the seed for unique resource name suffixes.
#[inline]
pub fn timestamp_centis() -> u64 {
    (timestamp_millis() / 10).max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn centis_tracks_millis() {
        let millis = timestamp_millis();
        let centis = timestamp_centis() as i64;
        assert!(centis >= millis / 10);
        assert!(centis - millis / 10 < 100);
    }
}
