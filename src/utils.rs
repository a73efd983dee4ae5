//! Small helpers shared across the broker.

use std::{
    path::PathBuf,
    time::{SystemTime, UNIX_EPOCH},
};

/// Joins a directory path with a child path and returns it as a `String`.
///
/// # Panics
///
/// Panics if the resulting path contains invalid UTF-8.
pub fn get_path(dir_path: &str, child: &str) -> String {
    let path: PathBuf = [dir_path, child].iter().collect();
    path.to_str().unwrap().to_owned()
}

/// Milliseconds since the Unix epoch, used to stamp domain events and room
/// snapshots.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_path_joins_components() {
        let path = get_path("/var/data", "rooms.json");
        #[cfg(unix)]
        assert_eq!(path, "/var/data/rooms.json");
    }

    #[test]
    fn test_get_path_relative_base() {
        let path = get_path(".", "credentials");
        #[cfg(unix)]
        assert_eq!(path, "./credentials");
    }

    #[test]
    fn test_now_millis_is_recent() {
        let first = now_millis();
        let second = now_millis();
        assert!(second >= first);
        // Sanity: later than 2023-01-01.
        assert!(first > 1_672_531_200_000);
    }
}
