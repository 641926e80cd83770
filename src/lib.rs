pub mod config;
pub mod errors;
pub mod git;
pub mod lint;
pub mod models;
pub mod pipeline;
pub mod sandbox;
pub mod scheduler;
pub mod storage;
pub mod worker;
