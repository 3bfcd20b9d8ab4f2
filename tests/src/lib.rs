//! # Switchyard Test Suite
//!
//! Unified test crate containing:
//!
//! ## Structure
//!
//! ```text
//! tests/
//! ├── benches/
//! │   └── dispatch_benchmarks.rs  # Post throughput, registration churn
//! └── src/
//!     ├── fixtures.rs             # Shared event types and recording objects
//!     └── integration/            # End-to-end bus scenarios
//!         ├── routing.rs
//!         ├── reentrancy.rs
//!         ├── background.rs
//!         ├── delayed.rs
//!         ├── lifecycle.rs
//!         ├── cross_thread.rs
//!         └── telemetry.rs
//! ```
//!
//! ## Running Tests
//!
//! ```bash
//! # All tests
//! cargo test -p switchyard-tests
//!
//! # By scenario
//! cargo test -p switchyard-tests integration::background::
//!
//! # Benchmarks
//! cargo bench -p switchyard-tests
//! ```

#![allow(dead_code)]
