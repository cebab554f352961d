pub mod api;
pub mod attribution;
pub mod audit;
pub mod config;
pub mod dead_letter;
pub mod dedup;
pub mod error;
pub mod event;
pub mod journey;
pub mod metrics_consts;
pub mod partition;
pub mod pipeline;
pub mod retry;
pub mod server;
pub mod sink;
pub mod time;
