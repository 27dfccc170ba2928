pub mod agent;
pub mod auth;
pub mod client;
pub mod config;
pub mod console;
pub mod deploy;
pub mod inspect;
pub mod model;
pub mod protocol;
pub mod provider;
pub mod provision;
pub mod sampler;
pub mod state;
pub mod supervisor;
pub mod timings;
pub mod watch;
