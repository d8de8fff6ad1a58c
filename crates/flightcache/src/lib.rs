//! A read-through, single-flight, type-keyed in-process cache.
//!
//! The entry point is [`caching::Cache`]. The [`repository`] module contains the
//! data-access collaborator contract the cache is meant to sit in front of, together with
//! [`repository::Cached`], which wires both together.

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod logging;
pub mod repository;
