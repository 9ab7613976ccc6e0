// learners and their building blocks
pub mod algorithms;
pub mod batch;
pub mod collector;
pub mod config;
pub mod environments;
pub mod gradients;
pub mod losses;
pub mod networks;
pub mod replay_buffer;
pub mod returns;
pub mod trust_region;
pub mod utils;

// Traits
pub mod agent;
pub mod environment; // environment trait
pub mod policy;
