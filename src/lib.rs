pub mod classify;
pub mod cli;
pub mod config;
pub mod controller;
pub mod error;
pub mod finding;
pub mod generator;
pub mod ledger;
pub mod process;
pub mod rate_limit;
pub mod report;
pub mod review;
pub mod similarity;
pub mod state;
pub mod stuck;
pub mod templates;
