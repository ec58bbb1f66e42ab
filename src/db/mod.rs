//! Database module: insert/query models and SQL repositories.
//!
//! This module is split into two submodules:
//! - `model`: insert payloads and filters accepted by repositories.
//! - `repo`: SQL-only functions that map rows into domain entities.
//!
//! External modules should import from `course_forge::db`; the repository API
//! and the query models are re-exported here.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::{JobFilter, NewJob, NewNotification, NewOutline};
