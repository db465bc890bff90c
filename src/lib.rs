pub mod bucket;
pub mod config;
pub mod error;
pub mod ingest;
pub mod model;
pub mod mqtt;
pub mod offsets;
pub mod pipeline;
pub mod query;
pub mod rollup;
pub mod simulator;
pub mod sketch;
pub mod store;
pub mod sum;
