//! gpt-service library
//!
//! Streams text generated by a local model to remote callers. A caller
//! configures a session once, then sends queries whose output is pushed back
//! token by token.

pub mod config;
pub mod error;
pub mod generation;
pub mod inference;
pub mod server;

pub use error::ServiceError;

/// Safely truncate a string at a char boundary, never panics.
pub fn truncate_str(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    // Walk backwards from max_bytes to find a valid char boundary
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Generates a random seed using system entropy
pub fn rand_seed() -> u32 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    RandomState::new().build_hasher().finish() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_str_on_char_boundary() {
        assert_eq!(truncate_str("hello", 10), "hello");
        assert_eq!(truncate_str("hello", 3), "hel");
        // "é" is two bytes
        assert_eq!(truncate_str("aé", 2), "a");
    }
}
