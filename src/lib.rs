//! Pathguard - Path-Keyed Admission Control
//!
//! This crate implements an in-memory admission controller: a concurrent
//! prefix tree that maps ordered key sequences (route, method, caller) to
//! independent token buckets, with copy-on-write garbage collection of idle
//! limiters and point-in-time snapshot export.

pub mod config;
pub mod error;
pub mod ratelimit;
