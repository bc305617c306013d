//! Shared primitives: configuration, errors, findings, the SQL scanner and
//! the catalog loader. Everything the five components have in common lives here.

pub mod catalog;
pub mod config;
pub mod db;
pub mod error;
pub mod finding;
pub mod heuristics;
pub mod output;
pub mod sqlscan;
pub mod time;
