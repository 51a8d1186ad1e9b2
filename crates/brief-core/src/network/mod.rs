mod client;
mod config;

pub use client::{ApiClient, ClientError, ClientResult};
pub use config::HttpConfig;
