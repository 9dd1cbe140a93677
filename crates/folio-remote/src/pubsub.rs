//! Redis Pub/Sub for cross-instance invalidation.

use dashmap::DashMap;
use deadpool_redis::Pool;
use redis::AsyncCommands;
use std::sync::Arc;
use std::time::Duration;

use crate::backend::RemoteEntry;

/// Channel carrying invalidation messages. Each message is a rendered key
/// prefix; receivers drop every local entry under it. An exact key is its
/// own prefix, so single-key deletes ride the same channel.
/// Over-matching only costs an extra refetch, never staleness.
pub const INVALIDATE_CHANNEL: &str = "folio:invalidate";

/// Invalidation listener that keeps local tiers synchronized across
/// instances.
///
/// 1. Subscribe to [`INVALIDATE_CHANNEL`]
/// 2. On each message, drop matching keys from the local tier
/// 3. Reconnect with exponential backoff if the connection is lost
pub struct InvalidationListener {
    pub redis_url: String,
    pub local_cache: Arc<DashMap<String, RemoteEntry>>,
}

impl InvalidationListener {
    /// Start listening in a background task.
    pub async fn start(self) {
        tokio::spawn(async move {
            let mut backoff = Duration::from_secs(1);
            const MAX_BACKOFF: Duration = Duration::from_secs(300);

            loop {
                match self.run().await {
                    Ok(()) => {
                        backoff = Duration::from_secs(1);
                    }
                    Err(e) => {
                        tracing::error!(
                            error = %e,
                            backoff_secs = backoff.as_secs(),
                            "invalidation listener error, reconnecting"
                        );
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(MAX_BACKOFF);
                    }
                }
            }
        });
    }

    async fn run(&self) -> Result<(), String> {
        use futures_util::StreamExt;

        let client = redis::Client::open(self.redis_url.clone())
            .map_err(|e| format!("failed to create redis client: {e}"))?;

        let mut pubsub = client
            .get_async_pubsub()
            .await
            .map_err(|e| format!("failed to get pub/sub connection: {e}"))?;

        pubsub
            .subscribe(INVALIDATE_CHANNEL)
            .await
            .map_err(|e| format!("failed to subscribe: {e}"))?;

        tracing::info!(channel = INVALIDATE_CHANNEL, "subscribed to invalidation channel");

        let mut stream = pubsub.on_message();
        loop {
            match stream.next().await {
                Some(msg) => {
                    if let Ok(prefix) = msg.get_payload::<String>() {
                        tracing::debug!(prefix = %prefix, "received remote invalidation");
                        self.local_cache.retain(|key, _| !key.starts_with(&prefix));
                    } else {
                        tracing::warn!("failed to parse invalidation message payload");
                    }
                }
                None => {
                    return Err("pub/sub connection closed".to_string());
                }
            }
        }
    }
}

/// Publish an invalidation prefix to other instances.
///
/// `RemoteCache::delete` and `delete_by_prefix` publish automatically;
/// this is for callers that invalidated through another path.
pub async fn publish_invalidation(redis: &Pool, prefix: &str) -> Result<(), String> {
    let mut conn = redis
        .get()
        .await
        .map_err(|e| format!("failed to get redis connection: {e}"))?;

    conn.publish::<_, _, ()>(INVALIDATE_CHANNEL, prefix)
        .await
        .map_err(|e| format!("failed to publish invalidation: {e}"))?;

    tracing::debug!(prefix = %prefix, "published remote invalidation");
    Ok(())
}
