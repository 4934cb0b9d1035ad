pub mod config;
pub mod fill;
pub mod partition;
pub mod run;
