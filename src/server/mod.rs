//! HTTP surface of the service binary.
//!
//! - [`api`]: health, prometheus metrics, memory stats and the delete
//!   vector / delta column group read paths

pub mod api;
