//! Utility functions and constants
//!
//! **Why**: Centralized helpers used across multiple modules
//!
//! **Used by**: context (HTTP Basic auth), window (CSRF token check)

/// Secret comparison helpers
pub mod secret {
    /// Compare two equally long byte strings without data-dependent early exit.
    ///
    /// Unequal lengths return false immediately; only the length is revealed.
    #[inline(never)]
    pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
        if a.len() != b.len() {
            return false;
        }
        let diff = a
            .iter()
            .zip(b)
            .fold(0u8, |acc, (x, y)| acc | (x ^ y));
        std::hint::black_box(diff) == 0
    }

    /// Check `user:password` presented by a client against the configured one.
    pub fn credentials_match(presented: Option<&str>, expected: &str) -> bool {
        match presented {
            Some(presented) => constant_time_eq(presented.as_bytes(), expected.as_bytes()),
            None => false,
        }
    }

    /// Random token for CSRF protection (122 random bits, hex).
    pub fn random_token() -> String {
        uuid::Uuid::new_v4().simple().to_string()
    }
}
