//! Integration test suite for conductor.
//!
//! These tests drive whole workflows through the public API with a scripted
//! runner, under tokio's paused clock so timing assertions are exact.
//!
//! # Test Categories
//!
//! - `dag_resolution`: Cycle rejection, readiness and stage planning
//! - `execution`: Concurrency bound, stage ordering, context visibility
//! - `failures`: Retry exactness, partial failure, fail-fast policy
//! - `lifecycle`: Cancellation, workflow timeout, events, round-trips
//! - `scenario`: The plan/research/synthesize workflow
//! - `expansion`: Dynamic task expansion
//! - `service`: The control surface over a file-backed store

mod fixtures;

mod dag_resolution;
mod failures;
mod scenario;
mod service;
