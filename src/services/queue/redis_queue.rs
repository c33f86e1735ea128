use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};
use tokio::time::{sleep, Instant};
use uuid::Uuid;

use super::{Delivery, JobMessage, QueueError, Receipt, WorkQueue};

/// Pause between empty polls while a receive is waiting.
const POLL_TICK: Duration = Duration::from_millis(250);

/// Reclaim expired leases, then pop one ready message and lease it.
///
/// KEYS: ready list, in-flight zset (receipt -> deadline ms), payload hash.
/// ARGV: now ms, lease deadline ms, new receipt.
const RECEIVE_SCRIPT: &str = r#"
local expired = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1], 'LIMIT', 0, 100)
for _, receipt in ipairs(expired) do
    local payload = redis.call('HGET', KEYS[3], receipt)
    redis.call('ZREM', KEYS[2], receipt)
    redis.call('HDEL', KEYS[3], receipt)
    if payload then
        redis.call('LPUSH', KEYS[1], payload)
    end
end
local payload = redis.call('RPOP', KEYS[1])
if not payload then
    return false
end
redis.call('ZADD', KEYS[2], ARGV[2], ARGV[3])
redis.call('HSET', KEYS[3], ARGV[3], payload)
return payload
"#;

/// Move a lease deadline, but only while the lease is still live.
///
/// KEYS: in-flight zset. ARGV: now ms, new deadline ms, receipt.
const EXTEND_SCRIPT: &str = r#"
local deadline = redis.call('ZSCORE', KEYS[1], ARGV[3])
if not deadline or tonumber(deadline) <= tonumber(ARGV[1]) then
    return 0
end
redis.call('ZADD', KEYS[1], ARGV[2], ARGV[3])
return 1
"#;

/// Redis-backed leased work queue.
///
/// Ready messages sit in a list. A received message moves into a sorted set
/// scored by its lease deadline, with its payload kept in a hash under the
/// receipt. Expired leases are pushed back onto the list by the next receive.
pub struct RedisWorkQueue {
    conn: MultiplexedConnection,
    ready_key: String,
    in_flight_key: String,
    payload_key: String,
    receive_script: Script,
    extend_script: Script,
}

impl RedisWorkQueue {
    pub async fn connect(redis_url: &str, prefix: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self {
            conn,
            ready_key: format!("{}:ready", prefix),
            in_flight_key: format!("{}:in_flight", prefix),
            payload_key: format!("{}:payloads", prefix),
            receive_script: Script::new(RECEIVE_SCRIPT),
            extend_script: Script::new(EXTEND_SCRIPT),
        })
    }

    async fn try_receive(&self, lease: Duration) -> Result<Option<Delivery>, QueueError> {
        let mut conn = self.conn.clone();
        let now_ms = Utc::now().timestamp_millis();
        let receipt = Receipt::generate();

        let payload: Option<String> = self
            .receive_script
            .key(&self.ready_key)
            .key(&self.in_flight_key)
            .key(&self.payload_key)
            .arg(now_ms)
            .arg(now_ms + lease.as_millis() as i64)
            .arg(&receipt.0)
            .invoke_async(&mut conn)
            .await?;

        let Some(payload) = payload else {
            return Ok(None);
        };

        match serde_json::from_str::<JobMessage>(&payload) {
            Ok(message) => Ok(Some(Delivery { message, receipt })),
            Err(e) => {
                // Unparseable payloads would come back forever; drop them here.
                tracing::error!(payload = %payload, error = %e, "Dropping malformed queue message");
                self.delete(&receipt).await?;
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl WorkQueue for RedisWorkQueue {
    async fn publish(&self, job_id: Uuid) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(&JobMessage { job_id })?;
        conn.lpush::<_, _, ()>(&self.ready_key, &payload).await?;
        Ok(())
    }

    async fn receive(
        &self,
        lease: Duration,
        wait: Duration,
    ) -> Result<Option<Delivery>, QueueError> {
        let give_up_at = Instant::now() + wait;

        loop {
            if let Some(delivery) = self.try_receive(lease).await? {
                return Ok(Some(delivery));
            }
            let now = Instant::now();
            if now >= give_up_at {
                return Ok(None);
            }
            sleep((give_up_at - now).min(POLL_TICK)).await;
        }
    }

    async fn extend(&self, receipt: &Receipt, duration: Duration) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let now_ms = Utc::now().timestamp_millis();

        let extended: i32 = self
            .extend_script
            .key(&self.in_flight_key)
            .arg(now_ms)
            .arg(now_ms + duration.as_millis() as i64)
            .arg(&receipt.0)
            .invoke_async(&mut conn)
            .await?;

        if extended == 0 {
            return Err(QueueError::LeaseLost(receipt.clone()));
        }
        Ok(())
    }

    async fn delete(&self, receipt: &Receipt) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let (removed, _): (i32, i32) = redis::pipe()
            .atomic()
            .zrem(&self.in_flight_key, &receipt.0)
            .hdel(&self.payload_key, &receipt.0)
            .query_async(&mut conn)
            .await?;

        if removed == 0 {
            return Err(QueueError::LeaseLost(receipt.clone()));
        }
        Ok(())
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        let mut conn = self.conn.clone();
        let depth: u64 = conn.llen(&self.ready_key).await?;
        Ok(depth)
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }
}
