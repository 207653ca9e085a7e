use reqwest::Client;
use std::time::Duration;

use crate::config::env_u64;

pub fn build_client() -> Client {
    let timeout = env_u64("HTTP_TIMEOUT_SECS", 15);
    let connect = env_u64("HTTP_CONNECT_TIMEOUT_SECS", 5);
    Client::builder()
        .timeout(Duration::from_secs(timeout))
        .connect_timeout(Duration::from_secs(connect))
        .user_agent(concat!("pixelift-billing/", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_else(|_| Client::new())
}
