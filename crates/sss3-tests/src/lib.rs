//! End-to-end tests for the SSS3 session client
//!
//! These tests run a [`SessionController`](sss3_session::SessionController)
//! against the scripted broker from `sss3_broker::testing`:
//! - control channel negotiation (register, discovery, session request)
//! - broker pushes (setup, teardown, unsupported methods)
//! - the multicast data plane, when the host supports it
//!
//! # Running Tests
//!
//! Multicast scenarios need a route for `239.0.0.0/8`; on hosts without one
//! they print a notice and return early.
//!
//! ```bash
//! cargo test -p sss3-tests
//! ```
//!
//! # Test Structure
//!
//! - `negotiation_test.rs` - protocol scenarios that never start the data plane
//! - `session_e2e_test.rs` - full sessions with frames over multicast

// This crate only contains tests, no library code
