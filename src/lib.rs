pub mod answers;
pub mod config;
pub mod embedding;
pub mod error;
pub mod matching;
pub mod models;
pub mod report;
pub mod scoring;
pub mod store;
pub mod team;
