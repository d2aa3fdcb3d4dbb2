//! Core traits and types for the refold event-sourcing engine.
//!
//! This crate provides the building blocks the facade crate re-exports:
//!
//! - [`wrapper`] - The stream wrapper: catch-up, optimistic appends,
//!   transactions, snapshot cadence (`StreamWrapper`)
//! - [`projection`] - The projection capability trait (`Projection`)
//! - [`group`] - Reified projection groups (`ReifiedGroup`)
//! - [`stream`] - Event stream contract and in-memory driver (`EventStream`)
//! - [`cache`] - Snapshot cache contract and implementations
//!   (`ProjectionCache`, `NoCache`)
//! - [`notify`] - Refresh notification latch (`RefreshNotifier`)
//! - [`quarantine`] - Record of skipped events (`Quarantine`)
//! - [`cancel`] - Cooperative cancellation (`CancelToken`)
//!
//! Most users should depend on the [`refold`](https://docs.rs/refold) crate,
//! which re-exports these types with a cleaner API surface.

pub mod cache;
pub mod cancel;
pub mod group;
pub mod notify;
pub mod projection;
pub mod quarantine;
pub mod stream;
pub mod wrapper;
