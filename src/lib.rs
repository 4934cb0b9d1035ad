pub mod backfill;
pub mod cli;
pub mod config;
pub mod derive;
pub mod stream;
pub mod time;
pub mod web;
