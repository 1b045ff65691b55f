use redis::{aio::MultiplexedConnection, AsyncCommands, Client};

use crate::{error::AppResult, events::Topic};

/// Channel prefix shared by all server instances.
const EVENT_CHANNEL_PREFIX: &str = "events";

#[derive(Clone)]
pub struct RedisClient {
    client: Client,
    conn: MultiplexedConnection,
}

impl RedisClient {
    pub async fn new(url: &str) -> AppResult<Self> {
        let client = Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self { client, conn })
    }

    /// Publish a serialized event envelope for the other server instances.
    pub async fn publish_event(&self, topic: Topic, payload: &str) -> AppResult<()> {
        let mut conn = self.conn.clone();
        let channel = format!("{}:{}", EVENT_CHANNEL_PREFIX, topic.as_str());
        conn.publish::<_, _, ()>(&channel, payload).await?;
        Ok(())
    }

    /// Pattern-subscribe to the event channels of every instance.
    pub async fn subscribe_events(&self) -> AppResult<redis::aio::PubSub> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub
            .psubscribe(format!("{}:*", EVENT_CHANNEL_PREFIX))
            .await?;
        Ok(pubsub)
    }
}
