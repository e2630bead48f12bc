//! Shared constants for integration tests.
//!
//! Integration tests are compiled as separate crates (one per top-level file in
//! `tests/`). Placing shared constants under `tests/common/` avoids creating an
//! additional integration test binary while still allowing reuse via:
//!
//! ```rust
//! #[path = "common/test_constants.rs"]
//! mod test_constants;
//! ```

/// API key used by integration tests.
pub const TEST_API_KEY: &str = "test-key";

/// Secret key used by integration tests.
pub const TEST_API_SECRET: &str = "test-secret";

/// Base URL that never resolves; used when no request should be sent.
pub const UNROUTABLE_API_URL: &str = "https://api.invalid";
