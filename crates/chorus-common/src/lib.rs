//! # chorus-common
//!
//! Shared configuration and primitives used across the Chorus voice backend.
//! This is the foundation layer — no business logic, just contracts.

pub mod config;
