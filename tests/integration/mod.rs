//! Integration test suite for gauntlet.
//!
//! These tests drive the orchestrator end to end against scripted mock
//! workers and a temporary storage root. They cover fan-out, evaluation,
//! escalation and persistence, including the approval round trip.
//!
//! # Test Categories
//!
//! - `dispatch`: fan-out counts, slot isolation, timeouts
//! - `evaluation`: gating, tie-breaks, outline violations
//! - `escalation`: resolution order, bounds, cancellation
//! - `persistence`: placement faults, archival, approval decisions
//!
//! # CI Compatibility
//!
//! No external agent processes are spawned; every worker is in-process.

mod fixtures;

mod dispatch;
mod escalation;
mod evaluation;
mod persistence;
