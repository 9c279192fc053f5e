//! Strand Journal - a queryable record of committed entity lifecycle changes.
//!
//! This crate provides an [`EventSystem`](strand_store::lifecycle::EventSystem)
//! for the strand entity store that keeps every lifecycle notification as a
//! serializable record, so tools and tests can ask what a series of commits
//! did to which entities.
//!
//! # Modules
//!
//! - [`journal`]: [`LifecycleJournal`] and its [`LifecycleRecord`] entries,
//!   with queries by entity, component name and event kind.

#![deny(unsafe_code)]

pub mod journal;

pub use journal::{LifecycleJournal, LifecycleRecord};
