use once_cell::sync::Lazy;
use reqwest::Client;
use std::time::Duration;

use crate::constants::{
    HTTP_CONNECT_TIMEOUT_SECS, HTTP_POOL_IDLE_PER_HOST, NONSTREAM_READ_TIMEOUT_SECS, USER_AGENT,
};

// One shared pool for everything that expects a bounded response, one for
// streaming calls where the overall timeout must stay open. Inter-chunk
// budgets for streams are enforced by the streaming guard, not here.
pub static SHARED_CLIENT: Lazy<Client> =
    Lazy::new(|| create_base_client(Some(NONSTREAM_READ_TIMEOUT_SECS)));
pub static SHARED_CLIENT_STREAMING: Lazy<Client> = Lazy::new(|| create_base_client(None));

fn create_base_client(total_timeout_secs: Option<u64>) -> Client {
    let mut builder = Client::builder()
        .connect_timeout(Duration::from_secs(HTTP_CONNECT_TIMEOUT_SECS))
        .pool_max_idle_per_host(HTTP_POOL_IDLE_PER_HOST)
        .user_agent(USER_AGENT);

    if let Some(secs) = total_timeout_secs {
        builder = builder.timeout(Duration::from_secs(secs));
    }

    builder.build().unwrap_or_else(|e| {
        tracing::error!("[E-HTTP-CLIENT] failed_to_build_shared_client: {}", e);
        Client::new()
    })
}

pub fn get_client() -> Client {
    SHARED_CLIENT.clone()
}

pub fn get_streaming_client() -> Client {
    SHARED_CLIENT_STREAMING.clone()
}
