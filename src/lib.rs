//! Client assignment and multi-source activity reconciliation for a
//! real-estate sales CRM.
//!
//! - [`territory::scope`] decides which clients an actor may see.
//! - [`territory::assignment`] diffs and applies territory assignments.
//! - [`territory::activity`] answers which clients were worked on in a window.
//! - [`territory::pager`] and [`territory::chunking`] keep every store request
//!   under the page-size and predicate-size ceilings.

pub mod config;
pub mod db;
pub mod error;
pub mod settings;
pub mod territory;
