//! Batata lock operator tool
//!
//! Loads lock settings the way the server does (YAML file, `BATATA_*`
//! environment, command line) and runs contention drills against a set of
//! in-memory stores to exercise the quorum lock end to end.

pub mod config;
pub mod drill;
pub mod logging;
