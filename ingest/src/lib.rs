pub mod checkpoint;
pub mod config;
pub mod discover;
pub mod error;
pub mod governor;
pub mod parse;
pub mod pipeline;
pub mod sink;
pub mod stats;
pub mod transcript;
