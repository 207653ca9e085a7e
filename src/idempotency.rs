//! De-duplication of Stripe event deliveries.
//!
//! Stripe retries a webhook until it sees a 2xx, and may deliver the same
//! event more than once. Each event id is claimed before handling; a failed
//! handler releases its claim so the retry is processed.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::Mutex;
use tracing::warn;

const KEY_PREFIX: &str = "pixelift:stripe-event:";

#[derive(Clone)]
pub struct ProcessedEvents {
    redis: Option<redis::Client>,
    local: Arc<Mutex<HashMap<String, Instant>>>,
    ttl: Duration,
}

impl ProcessedEvents {
    pub fn new(redis: Option<redis::Client>, ttl: Duration) -> Self {
        Self {
            redis,
            local: Arc::new(Mutex::new(HashMap::new())),
            ttl,
        }
    }

    pub fn in_memory(ttl: Duration) -> Self {
        Self::new(None, ttl)
    }

    /// Returns `true` when this call is the first to see `event_id`.
    pub async fn claim(&self, event_id: &str) -> bool {
        if let Some(client) = &self.redis {
            match redis_claim(client, event_id, self.ttl).await {
                Ok(claimed) => return claimed,
                Err(err) => warn!(
                    target = "pixelift.webhook",
                    error = %err,
                    "redis claim failed; using local event cache"
                ),
            }
        }
        let mut guard = self.local.lock().await;
        let now = Instant::now();
        guard.retain(|_, seen| now.duration_since(*seen) < self.ttl);
        if guard.contains_key(event_id) {
            return false;
        }
        guard.insert(event_id.to_string(), now);
        true
    }

    pub async fn release(&self, event_id: &str) {
        if let Some(client) = &self.redis {
            redis_release(client, event_id).await;
        }
        self.local.lock().await.remove(event_id);
    }
}

async fn redis_claim(
    client: &redis::Client,
    event_id: &str,
    ttl: Duration,
) -> Result<bool, redis::RedisError> {
    let mut conn = client.get_multiplexed_async_connection().await?;
    let reply: Option<String> = redis::cmd("SET")
        .arg(format!("{KEY_PREFIX}{event_id}"))
        .arg(1)
        .arg("NX")
        .arg("EX")
        .arg(ttl.as_secs().max(1))
        .query_async(&mut conn)
        .await?;
    Ok(reply.is_some())
}

async fn redis_release(client: &redis::Client, event_id: &str) {
    if let Ok(mut conn) = client.get_multiplexed_async_connection().await {
        let _: Result<(), _> = redis::cmd("DEL")
            .arg(format!("{KEY_PREFIX}{event_id}"))
            .query_async(&mut conn)
            .await;
    }
}
