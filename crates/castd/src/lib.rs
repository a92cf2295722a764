//! castd: the cast agent.
//!
//! The agent is a single context object built once at startup and passed
//! to whatever drives it (the CLI here, an HTTP layer elsewhere).

pub mod agent;

pub use agent::Agent;
