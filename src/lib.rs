pub mod admin;
pub mod cli;
pub mod config;
pub mod logging;
pub mod provision;
pub mod smoke;
pub mod startup;
pub mod supervisor;
pub mod targets;
