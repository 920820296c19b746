//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - Redis testcontainer setup and stream helpers
//! - In-memory authenticator, edit log and pub/sub medium

// Each test binary uses a different subset.
#![allow(dead_code)]

pub mod containers;
pub mod mocks;
