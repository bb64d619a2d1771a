//! keyswarm: a worker pool that drains an AI generation backlog over a pool of
//! interchangeable API keys, with failover, a global circuit breaker and
//! per-unit escalating retries.

pub mod anthropic;
pub mod breaker;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod git;
pub mod jobs;
pub mod orchestrator;
pub mod pool;
pub mod state_machine;
pub mod stop;
pub mod ui;
