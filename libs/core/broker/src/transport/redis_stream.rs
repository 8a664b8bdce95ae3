//! Redis Streams transport
//!
//! One stream per queue, consumed through a consumer group:
//! - publish: `XADD <queue> MAXLEN ~ <max_length> * message <json>`
//! - receive: `XREADGROUP GROUP <group> <consumer> BLOCK <ms> COUNT 1 STREAMS <queue> >`
//! - ack: `XACK`; requeue adds the updated message back and then acks the original
//!
//! Blocking reads run on their own connections, one per concurrent receive, with a
//! response timeout longer than the block. Publish, ack and promotion share the
//! command connection and never queue behind a read.
//!
//! Entries left pending by a consumer that died are claimed with `XPENDING` and
//! `XCLAIM` once they have been idle for `claim_min_idle`.
//!
//! Redis has no native delayed delivery. With `delayed_delivery` enabled, delayed
//! messages are parked in the sorted set `<queue>:delayed` scored by due time in
//! milliseconds, and a promoter task moves due members into the stream with a Lua
//! script. The script adds each member to the stream before removing it from the
//! set and runs atomically, so a failed add leaves the member parked and several
//! instances never duplicate a delayed message.

use super::Transport;
use crate::config::{BrokerConfig, DeliveryMode};
use crate::delay::DelayMode;
use crate::error::TransportError;
use crate::message::{Delivery, Message};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use core_config::{env_parse, env_required, ConfigError, FromEnv};
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::{RedisResult, Script};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Stream entry field holding the JSON-encoded message.
const MESSAGE_FIELD: &str = "message";

/// Pending entries recovered per connect.
const RECOVERY_BATCH: usize = 1000;

/// Delayed members promoted per promoter tick.
const PROMOTE_BATCH: usize = 100;

/// Extra response time a reader connection allows on top of the block.
const READ_TIMEOUT_MARGIN: Duration = Duration::from_secs(2);

/// KEYS: delayed set, stream. ARGV: now ms, batch, max length, message field.
const PROMOTE_SCRIPT: &str = r"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
for _, member in ipairs(due) do
    redis.call('XADD', KEYS[2], 'MAXLEN', '~', ARGV[3], '*', ARGV[4], member)
    redis.call('ZREM', KEYS[1], member)
end
return #due
";

type StreamEntry = (String, Vec<(String, String)>);
type StreamReply = Vec<(String, Vec<StreamEntry>)>;

/// Redis-specific settings. Queue, group and consumer identity come from [`BrokerConfig`].
#[derive(Debug, Clone)]
pub struct RedisTransportConfig {
    pub url: String,

    /// Maximum stream length before trimming (`MAXLEN ~`)
    pub max_length: i64,

    /// How often the promoter checks for due delayed messages
    pub promote_interval: Duration,

    /// Pending entries idle at least this long are claimed from their consumer.
    /// Must exceed the longest handler run, or entries still being handled are
    /// delivered twice.
    pub claim_min_idle: Duration,

    /// How often a receive looks for idle pending entries
    pub claim_interval: Duration,
}

impl RedisTransportConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_length: 100_000,
            promote_interval: Duration::from_millis(100),
            claim_min_idle: Duration::from_secs(30),
            claim_interval: Duration::from_secs(10),
        }
    }

    pub fn with_max_length(mut self, max_length: i64) -> Self {
        self.max_length = max_length;
        self
    }

    pub fn with_promote_interval(mut self, interval: Duration) -> Self {
        self.promote_interval = interval;
        self
    }

    pub fn with_claim_min_idle(mut self, min_idle: Duration) -> Self {
        self.claim_min_idle = min_idle;
        self
    }

    pub fn with_claim_interval(mut self, interval: Duration) -> Self {
        self.claim_interval = interval;
        self
    }
}

impl FromEnv for RedisTransportConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self::new(env_required("REDIS_URL")?)
            .with_max_length(env_parse("REDIS_STREAM_MAX_LENGTH", 100_000i64)?)
            .with_promote_interval(Duration::from_millis(env_parse(
                "REDIS_PROMOTE_INTERVAL_MS",
                100u64,
            )?))
            .with_claim_min_idle(Duration::from_millis(env_parse(
                "REDIS_CLAIM_MIN_IDLE_MS",
                30_000u64,
            )?))
            .with_claim_interval(Duration::from_millis(env_parse(
                "REDIS_CLAIM_INTERVAL_MS",
                10_000u64,
            )?)))
    }
}

struct Inner {
    config: RedisTransportConfig,
    stream: String,
    delayed_key: String,
    group: String,
    consumer: String,
    /// Where a newly created group starts reading.
    group_start: &'static str,
    delayed_delivery: bool,
    /// Longest `BLOCK` a receive issues.
    max_block: Duration,
    client: RwLock<Option<redis::Client>>,
    /// Command connection: publish, ack, promotion, claims.
    conn: RwLock<Option<ConnectionManager>>,
    /// Idle reader connections for blocking reads.
    readers: Mutex<Vec<ConnectionManager>>,
    /// Recovered or claimed entries, handed out before new ones.
    backlog: Mutex<VecDeque<Delivery>>,
    last_claim: Mutex<Instant>,
    promote_script: Script,
    recovered: AtomicBool,
    closed: AtomicBool,
    promoter: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

/// [`Transport`] over a Redis stream and consumer group.
#[derive(Clone)]
pub struct RedisStreamTransport {
    inner: Arc<Inner>,
}

impl RedisStreamTransport {
    pub fn new(config: RedisTransportConfig, broker: &BrokerConfig) -> Self {
        // Broadcast: every instance reads the whole stream through its own group.
        let (group, group_start) = match broker.delivery {
            DeliveryMode::Competing => (broker.consumer_group.clone(), "0"),
            DeliveryMode::Broadcast => (
                format!("{}:{}", broker.consumer_group, broker.consumer_id),
                "$",
            ),
        };

        Self {
            inner: Arc::new(Inner {
                config,
                stream: broker.queue.clone(),
                delayed_key: format!("{}:delayed", broker.queue),
                group,
                consumer: broker.consumer_id.clone(),
                group_start,
                delayed_delivery: broker.delayed_delivery,
                max_block: broker.receive_timeout,
                client: RwLock::new(None),
                conn: RwLock::new(None),
                readers: Mutex::new(Vec::new()),
                backlog: Mutex::new(VecDeque::new()),
                last_claim: Mutex::new(Instant::now()),
                promote_script: Script::new(PROMOTE_SCRIPT),
                recovered: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                promoter: Mutex::new(None),
            }),
        }
    }

    pub fn stream_name(&self) -> &str {
        &self.inner.stream
    }

    pub fn delayed_key(&self) -> &str {
        &self.inner.delayed_key
    }

    pub fn consumer_group(&self) -> &str {
        &self.inner.group
    }

    /// Stream length, for diagnostics.
    pub async fn stream_len(&self) -> Result<i64, TransportError> {
        let mut conn = self.inner.connection().await?;
        let len: i64 = redis::cmd("XLEN")
            .arg(&self.inner.stream)
            .query_async(&mut conn)
            .await?;
        Ok(len)
    }

    /// Number of delayed messages still waiting for promotion.
    pub async fn delayed_len(&self) -> Result<i64, TransportError> {
        let mut conn = self.inner.connection().await?;
        let len: i64 = redis::cmd("ZCARD")
            .arg(&self.inner.delayed_key)
            .query_async(&mut conn)
            .await?;
        Ok(len)
    }

    async fn start_promoter(&self) {
        let mut promoter = self.inner.promoter.lock().await;
        if promoter.is_some() {
            return;
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(promote_loop(self.inner.clone(), stop_rx));
        *promoter = Some((stop_tx, handle));
    }

    async fn stop_promoter(&self) {
        if let Some((stop_tx, handle)) = self.inner.promoter.lock().await.take() {
            let _ = stop_tx.send(true);
            if let Err(e) = handle.await {
                warn!(error = %e, "Delayed message promoter ended abnormally");
            }
        }
    }
}

impl Inner {
    async fn connection(&self) -> Result<ConnectionManager, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.conn
            .read()
            .await
            .clone()
            .ok_or_else(|| TransportError::Connection("redis transport not connected".into()))
    }

    /// Check out a reader connection, opening one if none is idle.
    async fn reader(&self) -> Result<ConnectionManager, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if let Some(reader) = self.readers.lock().await.pop() {
            return Ok(reader);
        }

        let client = self
            .client
            .read()
            .await
            .clone()
            .ok_or_else(|| TransportError::Connection("redis transport not connected".into()))?;
        let config = ConnectionManagerConfig::new()
            .set_response_timeout(Some(self.max_block + READ_TIMEOUT_MARGIN));

        debug!(stream = %self.stream, "Opening reader connection");
        Ok(ConnectionManager::new_with_config(client, config).await?)
    }

    async fn release_reader(&self, reader: ConnectionManager) {
        if !self.closed.load(Ordering::SeqCst) {
            self.readers.lock().await.push(reader);
        }
    }

    /// Create the consumer group if it doesn't exist.
    async fn init_consumer_group(&self, conn: &mut ConnectionManager) -> Result<(), TransportError> {
        let result: RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(self.group_start)
            .arg("MKSTREAM")
            .query_async(conn)
            .await;

        match result {
            Ok(()) => {
                info!(stream = %self.stream, group = %self.group, "Created consumer group");
                Ok(())
            }
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!(stream = %self.stream, group = %self.group, "Consumer group already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn xadd(&self, conn: &mut ConnectionManager, message: &Message) -> Result<String, TransportError> {
        let json = serde_json::to_string(message)?;
        let entry_id: String = redis::cmd("XADD")
            .arg(&self.stream)
            .arg("MAXLEN")
            .arg("~")
            .arg(self.config.max_length)
            .arg("*")
            .arg(MESSAGE_FIELD)
            .arg(&json)
            .query_async(conn)
            .await?;
        Ok(entry_id)
    }

    async fn xack(&self, conn: &mut ConnectionManager, entry_id: &str) -> Result<(), TransportError> {
        let _: i64 = redis::cmd("XACK")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(entry_id)
            .query_async(conn)
            .await?;
        Ok(())
    }

    /// Read entries for this consumer. `start` is `>` for new entries, `0` for pending ones.
    async fn read_group(
        &self,
        conn: &mut ConnectionManager,
        start: &str,
        count: usize,
        block: Option<Duration>,
    ) -> Result<Vec<StreamEntry>, TransportError> {
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP").arg(&self.group).arg(&self.consumer);

        if let Some(block) = block {
            // BLOCK 0 would wait forever.
            cmd.arg("BLOCK").arg((block.as_millis() as u64).max(1));
        }

        cmd.arg("COUNT")
            .arg(count)
            .arg("STREAMS")
            .arg(&self.stream)
            .arg(start);

        let result: RedisResult<Option<StreamReply>> = cmd.query_async(conn).await;

        match result {
            Ok(Some(streams)) => Ok(streams.into_iter().flat_map(|(_, entries)| entries).collect()),
            Ok(None) => Ok(Vec::new()),
            Err(e) if e.to_string().contains("NOGROUP") => {
                // Stream or group was deleted underneath us.
                warn!(stream = %self.stream, group = %self.group, "Consumer group missing, recreating");
                self.init_consumer_group(conn).await?;
                Ok(Vec::new())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Decode entries, acknowledging any that are malformed so they are not redelivered forever.
    async fn decode_entries(
        &self,
        conn: &mut ConnectionManager,
        entries: Vec<StreamEntry>,
    ) -> Result<Vec<Delivery>, TransportError> {
        let mut deliveries = Vec::with_capacity(entries.len());

        for (entry_id, fields) in entries {
            let json = fields
                .iter()
                .find(|(k, _)| k == MESSAGE_FIELD)
                .map(|(_, v)| v.as_str());

            match json.map(|raw| serde_json::from_str::<Message>(raw)) {
                Some(Ok(message)) => deliveries.push(Delivery::new(message, entry_id)),
                Some(Err(e)) => {
                    warn!(entry_id = %entry_id, error = %e, "Failed to parse message, dropping");
                    self.xack(conn, &entry_id).await?;
                }
                None => {
                    warn!(
                        entry_id = %entry_id,
                        fields = ?fields.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>(),
                        "Missing 'message' field in entry, dropping"
                    );
                    self.xack(conn, &entry_id).await?;
                }
            }
        }

        Ok(deliveries)
    }

    /// Move due delayed messages into the stream. Returns how many this call promoted.
    async fn promote_due(&self) -> Result<usize, TransportError> {
        let mut conn = self.connection().await?;

        let promoted: usize = self
            .promote_script
            .key(&self.delayed_key)
            .key(&self.stream)
            .arg(Utc::now().timestamp_millis())
            .arg(PROMOTE_BATCH)
            .arg(self.config.max_length)
            .arg(MESSAGE_FIELD)
            .invoke_async(&mut conn)
            .await?;

        Ok(promoted)
    }

    /// Whether the claim interval has passed, restarting it if so.
    async fn claim_due(&self) -> bool {
        let mut last = self.last_claim.lock().await;
        if last.elapsed() < self.config.claim_interval {
            return false;
        }
        *last = Instant::now();
        true
    }

    /// Take over pending entries idle longer than `claim_min_idle`, from any consumer
    /// in the group, and queue them for delivery. Returns how many were claimed.
    async fn claim_idle(&self) -> Result<usize, TransportError> {
        let mut conn = self.connection().await?;
        let min_idle = self.config.claim_min_idle.as_millis() as u64;

        // (entry id, consumer, idle ms, delivery count)
        let result: RedisResult<Vec<(String, String, u64, u64)>> = redis::cmd("XPENDING")
            .arg(&self.stream)
            .arg(&self.group)
            .arg("-")
            .arg("+")
            .arg(RECOVERY_BATCH)
            .query_async(&mut conn)
            .await;

        let pending = match result {
            Ok(pending) => pending,
            Err(e) if e.to_string().contains("NOGROUP") => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let idle: Vec<String> = pending
            .into_iter()
            .filter(|(_, _, idle_ms, _)| *idle_ms >= min_idle)
            .map(|(id, _, _, _)| id)
            .collect();

        if idle.is_empty() {
            return Ok(0);
        }

        // Entries trimmed since delivery come back as nil.
        let claimed: Vec<Option<StreamEntry>> = redis::cmd("XCLAIM")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(min_idle)
            .arg(&idle)
            .query_async(&mut conn)
            .await?;

        let deliveries = self
            .decode_entries(&mut conn, claimed.into_iter().flatten().collect())
            .await?;
        let count = deliveries.len();
        self.backlog.lock().await.extend(deliveries);

        Ok(count)
    }
}

async fn promote_loop(inner: Arc<Inner>, mut stop_rx: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(inner.config.promote_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    debug!(key = %inner.delayed_key, "Delayed message promoter started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stop_rx.changed() => break,
        }

        if *stop_rx.borrow() {
            break;
        }

        match inner.promote_due().await {
            Ok(0) => {}
            Ok(n) => debug!(promoted = n, "Promoted delayed messages"),
            Err(e) if e.is_connection() => {
                debug!(error = %e, "Promoter waiting for connection");
            }
            Err(TransportError::Closed) => break,
            Err(e) => error!(error = %e, "Failed to promote delayed messages"),
        }
    }

    debug!(key = %inner.delayed_key, "Delayed message promoter stopped");
}

#[async_trait]
impl Transport for RedisStreamTransport {
    fn name(&self) -> &'static str {
        "redis"
    }

    fn delay_mode(&self) -> DelayMode {
        if self.inner.delayed_delivery {
            DelayMode::Emulated
        } else {
            DelayMode::Unsupported
        }
    }

    async fn connect(&self) -> Result<(), TransportError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        let client = redis::Client::open(self.inner.config.url.as_str())?;
        let mut conn = ConnectionManager::new(client.clone()).await?;

        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        self.inner.init_consumer_group(&mut conn).await?;

        // Entries delivered to this consumer before a restart and never acked.
        if !self.inner.recovered.swap(true, Ordering::SeqCst) {
            let entries = self
                .inner
                .read_group(&mut conn, "0", RECOVERY_BATCH, None)
                .await?;
            let pending = self.inner.decode_entries(&mut conn, entries).await?;
            if !pending.is_empty() {
                warn!(count = pending.len(), consumer = %self.inner.consumer, "Recovered pending messages");
            }
            self.inner.backlog.lock().await.extend(pending);
        }

        *self.inner.client.write().await = Some(client);
        *self.inner.conn.write().await = Some(conn);
        self.inner.readers.lock().await.clear();

        if self.inner.delayed_delivery {
            self.start_promoter().await;
        }

        info!(
            stream = %self.inner.stream,
            group = %self.inner.group,
            consumer = %self.inner.consumer,
            "Connected to Redis"
        );
        Ok(())
    }

    async fn publish(&self, message: &Message) -> Result<(), TransportError> {
        let mut conn = self.inner.connection().await?;
        let entry_id = self.inner.xadd(&mut conn, message).await?;

        debug!(
            stream = %self.inner.stream,
            entry_id = %entry_id,
            message_id = %message.id,
            "Published message"
        );
        Ok(())
    }

    async fn publish_delayed(
        &self,
        message: &Message,
        deliver_at: DateTime<Utc>,
    ) -> Result<(), TransportError> {
        if !self.inner.delayed_delivery {
            return Err(TransportError::Unsupported(
                "delayed delivery (enable delayed_delivery)",
            ));
        }

        let mut message = message.clone();
        message.deliver_at = Some(deliver_at);
        let json = serde_json::to_string(&message)?;

        let mut conn = self.inner.connection().await?;
        let _: i64 = redis::cmd("ZADD")
            .arg(&self.inner.delayed_key)
            .arg(deliver_at.timestamp_millis())
            .arg(&json)
            .query_async(&mut conn)
            .await?;

        debug!(
            key = %self.inner.delayed_key,
            message_id = %message.id,
            deliver_at = %deliver_at,
            "Parked delayed message"
        );
        Ok(())
    }

    async fn receive(&self, wait: Duration) -> Result<Option<Delivery>, TransportError> {
        if let Some(delivery) = self.inner.backlog.lock().await.pop_front() {
            return Ok(Some(delivery));
        }

        if self.inner.claim_due().await {
            match self.inner.claim_idle().await {
                Ok(0) => {}
                Ok(count) => {
                    warn!(count, consumer = %self.inner.consumer, "Claimed idle pending messages");
                    if let Some(delivery) = self.inner.backlog.lock().await.pop_front() {
                        return Ok(Some(delivery));
                    }
                }
                Err(e) if e.is_connection() || matches!(e, TransportError::Closed) => return Err(e),
                Err(e) => warn!(error = %e, "Failed to claim idle pending messages"),
            }
        }

        let mut reader = self.inner.reader().await?;
        let block = wait.min(self.inner.max_block);

        let entries = match self.inner.read_group(&mut reader, ">", 1, Some(block)).await {
            Ok(entries) => {
                self.inner.release_reader(reader).await;
                entries
            }
            Err(e) if e.is_timeout() => {
                // The reader is dropped; an entry it was handed stays pending until claimed.
                debug!(stream = %self.inner.stream, error = %e, "Blocking read timed out");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        if entries.is_empty() {
            return Ok(None);
        }

        let mut conn = self.inner.connection().await?;
        Ok(self
            .inner
            .decode_entries(&mut conn, entries)
            .await?
            .into_iter()
            .next())
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), TransportError> {
        let mut conn = self.inner.connection().await?;
        self.inner.xack(&mut conn, &delivery.tag).await?;
        debug!(entry_id = %delivery.tag, "Acknowledged message");
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), TransportError> {
        let mut conn = self.inner.connection().await?;

        // Add before ack: a crash in between duplicates the message instead of losing it.
        if requeue {
            self.inner.xadd(&mut conn, &delivery.message).await?;
        }
        self.inner.xack(&mut conn, &delivery.tag).await?;

        debug!(entry_id = %delivery.tag, requeue, "Rejected message");
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.stop_promoter().await;
        self.inner.readers.lock().await.clear();
        self.inner.conn.write().await.take();
        self.inner.client.write().await.take();

        info!(stream = %self.inner.stream, "Redis transport closed");
        Ok(())
    }
}
