//! Core value model and error taxonomy for the marlin MariaDB/MySQL client.
//!
//! This crate is protocol-agnostic: it defines what callers see (values,
//! temporal and geometry types, errors with stable SQLSTATE classes), while
//! the `marlin` crate owns the wire protocol that produces them.

pub mod error;
pub mod geometry;
pub mod value;

pub use error::{Error, Result};
pub use geometry::Geometry;
pub use value::{Date, DateTime, Time, Value};
