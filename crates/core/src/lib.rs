pub mod allocation;
pub mod config;
pub mod domain;
pub mod error;
pub mod ingest;
pub mod optimizer;
pub mod recommender;
pub mod scoring;
pub mod selector;
pub mod storage;
pub mod time;
pub mod universe;

pub use error::PortfolioError;
