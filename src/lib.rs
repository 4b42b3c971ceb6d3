#![warn(rust_2018_idioms)]
#![allow(dead_code)]

pub mod agent;
pub mod attributes;
pub mod candidate;
pub mod error;
pub mod rand;
pub mod state;
pub mod stream;
pub mod transport;

pub use agent::{agent_config::AgentConfig, agent_stats::AgentStats, Agent, Event};
pub use stream::Credentials;
