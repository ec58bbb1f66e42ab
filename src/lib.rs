pub mod approval;
pub mod client;
pub mod config;
pub mod db;
pub mod error;
pub mod generation;
pub mod identity;
pub mod janitor;
pub mod model;
pub mod notify;
pub mod orchestrator;
pub mod pipeline;
pub mod retry;
pub mod worker;
