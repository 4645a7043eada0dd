//! Redis Streams backend.
//!
//! Every `StreamTransport` operation maps onto one stream command: `XADD`,
//! `XREAD`, `XGROUP CREATE`, `XREADGROUP`, `XAUTOCLAIM`, `XACK`, `XPENDING`,
//! `XTRIM` and `XLEN`. `touch` re-claims an entry for its current holder with
//! `XCLAIM ... JUSTID`, which resets the idle time without counting a
//! delivery; a short script checks the holder first so a touch never steals
//! an entry another consumer re-claimed.
//!
//! Short commands share one multiplexed connection. Blocking reads take a
//! dedicated connection from a small idle pool, since a blocked `XREAD`
//! holds up everything queued behind it on the same socket.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex as StdMutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{Cmd, FromRedisValue, RedisError, Value};
use tokio::sync::Mutex;

use relay_protocol::Fields;

use crate::transport::*;
use crate::{StreamId, TransportError};

/// Upper bound on pending entries fetched by one `XPENDING` call.
const PENDING_PAGE: usize = 10_000;

/// Idle dedicated connections kept for blocking reads.
const MAX_IDLE_BLOCKING: usize = 4;

/// Resets an entry's idle time only while `consumer` still holds it.
/// KEYS[1] = stream, ARGV = group, consumer, ids...
const TOUCH_SCRIPT: &str = r#"
local touched = 0
for i = 3, #ARGV do
  local p = redis.call('XPENDING', KEYS[1], ARGV[1], ARGV[i], ARGV[i], 1)
  if #p > 0 and p[1][2] == ARGV[2] then
    redis.call('XCLAIM', KEYS[1], ARGV[1], ARGV[2], 0, ARGV[i], 'JUSTID')
    touched = touched + 1
  end
end
return touched
"#;

pub struct RedisTransport {
    client: redis::Client,
    shared: Mutex<Option<MultiplexedConnection>>,
    idle: StdMutex<Vec<MultiplexedConnection>>,
    closed: AtomicBool,
}

impl RedisTransport {
    /// Open a client for `url` (`redis://host:port/db`) and check that the
    /// server answers.
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        let client = redis::Client::open(url)
            .map_err(|e| TransportError::UnsupportedUrl(format!("{}: {e}", crate::redact_url(url))))?;
        let transport = Self {
            client,
            shared: Mutex::new(None),
            idle: StdMutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        };
        transport.ping().await?;
        tracing::info!("Connected to Redis");
        Ok(transport)
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    async fn shared_connection(&self) -> Result<MultiplexedConnection, TransportError> {
        self.ensure_open()?;
        let mut shared = self.shared.lock().await;
        if let Some(conn) = shared.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(classify)?;
        *shared = Some(conn.clone());
        Ok(conn)
    }

    /// Run a short command on the shared connection. A connection-level
    /// failure drops the connection so the next call reconnects.
    async fn query<T: FromRedisValue>(&self, cmd: &Cmd) -> Result<T, TransportError> {
        let mut conn = self.shared_connection().await?;
        match cmd.query_async(&mut conn).await {
            Ok(value) => Ok(value),
            Err(e) => {
                if is_connection_failure(&e) {
                    *self.shared.lock().await = None;
                }
                Err(classify(e))
            }
        }
    }

    /// Run a blocking command on a dedicated connection.
    async fn query_blocking(&self, cmd: &Cmd) -> Result<Value, TransportError> {
        self.ensure_open()?;
        let pooled = self.idle().pop();
        let mut conn = match pooled {
            Some(conn) => conn,
            None => self
                .client
                .get_multiplexed_async_connection()
                .await
                .map_err(classify)?,
        };
        let value: Value = cmd
            .query_async(&mut conn)
            .await
            .map_err(classify)?;
        let mut idle = self.idle();
        if idle.len() < MAX_IDLE_BLOCKING && !self.closed.load(Ordering::Acquire) {
            idle.push(conn);
        }
        Ok(value)
    }

    fn idle(&self) -> std::sync::MutexGuard<'_, Vec<MultiplexedConnection>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn query_group<T: FromRedisValue>(
        &self,
        cmd: &Cmd,
        stream: &str,
        group: &str,
    ) -> Result<T, TransportError> {
        self.query(cmd).await.map_err(|e| group_error(e, stream, group))
    }
}

fn is_connection_failure(e: &RedisError) -> bool {
    e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal()
}

/// Map a Redis error onto the transient/permanent split the retry layer
/// relies on.
fn classify(e: RedisError) -> TransportError {
    if e.is_timeout() {
        return TransportError::Timeout(e.to_string());
    }
    if is_connection_failure(&e) {
        return TransportError::Connection(e.to_string());
    }
    match e.code() {
        Some("LOADING" | "TRYAGAIN" | "BUSY" | "MASTERDOWN") => {
            TransportError::Connection(e.to_string())
        }
        _ => TransportError::Backend(e.to_string()),
    }
}

fn group_error(e: TransportError, stream: &str, group: &str) -> TransportError {
    match e {
        TransportError::Backend(msg) if msg.contains("NOGROUP") => TransportError::NoSuchGroup {
            stream: stream.to_string(),
            group: group.to_string(),
        },
        other => other,
    }
}

/// `BLOCK` takes whole milliseconds and treats 0 as "forever".
fn block_millis(block: Duration) -> Option<u64> {
    if block.is_zero() {
        None
    } else {
        Some((block.as_millis() as u64).max(1))
    }
}

fn malformed(what: &str, value: &Value) -> TransportError {
    TransportError::MalformedEntry(format!("unexpected {what} reply: {value:?}"))
}

fn text(value: &Value) -> Result<String, TransportError> {
    match value {
        Value::BulkString(bytes) => String::from_utf8(bytes.clone())
            .map_err(|e| TransportError::MalformedEntry(format!("non-UTF-8 value: {e}"))),
        Value::SimpleString(s) => Ok(s.clone()),
        Value::Int(n) => Ok(n.to_string()),
        other => Err(malformed("string", other)),
    }
}

fn int(value: &Value) -> Result<u64, TransportError> {
    match value {
        Value::Int(n) => Ok((*n).max(0) as u64),
        other => text(other)?
            .parse()
            .map_err(|_| malformed("integer", other)),
    }
}

fn items(value: &Value) -> Result<&[Value], TransportError> {
    match value {
        Value::Array(items) | Value::Set(items) => Ok(items),
        Value::Nil => Ok(&[]),
        other => Err(malformed("array", other)),
    }
}

/// `[id, [field, value, ...]]`. Entries deleted while pending come back
/// with nil fields and are skipped.
fn parse_entry(value: &Value) -> Result<Option<StreamEntry>, TransportError> {
    let [id, body] = items(value)? else {
        return Err(malformed("entry", value));
    };
    let id: StreamId = text(id)?.parse()?;
    if matches!(body, Value::Nil) {
        return Ok(None);
    }
    let mut fields = Fields::new();
    for pair in items(body)?.chunks(2) {
        let [key, val] = pair else {
            return Err(malformed("field list", body));
        };
        fields.insert(text(key)?, text(val)?);
    }
    Ok(Some(StreamEntry { id, fields }))
}

fn parse_entries(value: &Value) -> Result<Vec<StreamEntry>, TransportError> {
    let mut entries = Vec::new();
    for item in items(value)? {
        if let Some(entry) = parse_entry(item)? {
            entries.push(entry);
        }
    }
    Ok(entries)
}

/// `XREAD`/`XREADGROUP` reply: nil on timeout, else `[[stream, entries]...]`
/// (or a map of the same under RESP3).
fn parse_read(value: &Value) -> Result<BTreeMap<String, Vec<StreamEntry>>, TransportError> {
    let mut batch = BTreeMap::new();
    let pairs: Vec<(&Value, &Value)> = match value {
        Value::Nil => return Ok(batch),
        Value::Map(pairs) => pairs.iter().map(|(k, v)| (k, v)).collect(),
        other => {
            let mut pairs = Vec::new();
            for item in items(other)? {
                let [name, entries] = items(item)? else {
                    return Err(malformed("stream batch", item));
                };
                pairs.push((name, entries));
            }
            pairs
        }
    };
    for (name, entries) in pairs {
        let entries = parse_entries(entries)?;
        if !entries.is_empty() {
            batch.insert(text(name)?, entries);
        }
    }
    Ok(batch)
}

/// Extended `XPENDING` reply: `[[id, consumer, idle_ms, deliveries]...]`.
fn parse_pending(value: &Value) -> Result<Vec<PendingEntry>, TransportError> {
    items(value)?
        .iter()
        .map(|item| {
            let [id, consumer, idle, count] = items(item)? else {
                return Err(malformed("pending entry", item));
            };
            Ok(PendingEntry {
                id: text(id)?.parse()?,
                consumer: text(consumer)?,
                idle: Duration::from_millis(int(idle)?),
                delivery_count: int(count)? as u32,
            })
        })
        .collect()
}

#[async_trait]
impl StreamTransport for RedisTransport {
    async fn append(
        &self,
        stream: &str,
        fields: Fields,
        max_len: Option<usize>,
    ) -> Result<StreamId, TransportError> {
        if fields.is_empty() {
            return Err(TransportError::MalformedEntry(
                "an entry needs at least one field".into(),
            ));
        }
        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream);
        if let Some(max_len) = max_len {
            cmd.arg("MAXLEN").arg("~").arg(max_len);
        }
        cmd.arg("*");
        for (key, value) in &fields {
            cmd.arg(key).arg(value);
        }
        let id: String = self.query(&cmd).await?;
        let id = id.parse()?;
        tracing::trace!(stream, id = %id, "Appended entry");
        Ok(id)
    }

    async fn read_blocking(
        &self,
        offsets: &BTreeMap<String, StreamId>,
        block: Duration,
        count: usize,
    ) -> Result<BTreeMap<String, Vec<StreamEntry>>, TransportError> {
        if offsets.is_empty() {
            return Ok(BTreeMap::new());
        }
        let mut cmd = redis::cmd("XREAD");
        cmd.arg("COUNT").arg(count);
        let block = block_millis(block);
        if let Some(ms) = block {
            cmd.arg("BLOCK").arg(ms);
        }
        cmd.arg("STREAMS");
        for name in offsets.keys() {
            cmd.arg(name);
        }
        for after in offsets.values() {
            cmd.arg(after.to_string());
        }
        let reply = match block {
            Some(_) => self.query_blocking(&cmd).await?,
            None => self.query::<Value>(&cmd).await?,
        };
        parse_read(&reply)
    }

    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start: GroupStart,
    ) -> Result<bool, TransportError> {
        let start = match start {
            GroupStart::Beginning => "0".to_string(),
            GroupStart::Latest => "$".to_string(),
            GroupStart::After(id) => id.to_string(),
        };
        let mut cmd = redis::cmd("XGROUP");
        cmd.arg("CREATE").arg(stream).arg(group).arg(&start).arg("MKSTREAM");
        match self.query::<Value>(&cmd).await {
            Ok(_) => {
                tracing::debug!(stream, group, start = %start, "Created consumer group");
                Ok(true)
            }
            Err(TransportError::Backend(msg)) if msg.contains("BUSYGROUP") => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<GroupEntry>, TransportError> {
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP").arg(group).arg(consumer).arg("COUNT").arg(count);
        let block = block_millis(block);
        if let Some(ms) = block {
            cmd.arg("BLOCK").arg(ms);
        }
        cmd.arg("STREAMS").arg(stream).arg(">");
        let reply = match block {
            Some(_) => self.query_blocking(&cmd).await,
            None => self.query::<Value>(&cmd).await,
        }
        .map_err(|e| group_error(e, stream, group))?;

        Ok(parse_read(&reply)?
            .remove(stream)
            .unwrap_or_default()
            .into_iter()
            .map(|entry| GroupEntry {
                entry,
                delivery_count: 1,
            })
            .collect())
    }

    async fn claim_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<GroupEntry>, TransportError> {
        let mut cmd = redis::cmd("XAUTOCLAIM");
        cmd.arg(stream)
            .arg(group)
            .arg(consumer)
            .arg(min_idle.as_millis() as u64)
            .arg("0-0")
            .arg("COUNT")
            .arg(count);
        let reply: Value = self.query_group(&cmd, stream, group).await?;
        let claimed = match items(&reply)? {
            [_cursor, entries, ..] => parse_entries(entries)?,
            _ => return Err(malformed("XAUTOCLAIM", &reply)),
        };
        let (Some(first), Some(last)) = (claimed.first(), claimed.last()) else {
            return Ok(Vec::new());
        };

        // XAUTOCLAIM does not report delivery counts; read them back.
        let mut cmd = redis::cmd("XPENDING");
        cmd.arg(stream)
            .arg(group)
            .arg(first.id.to_string())
            .arg(last.id.to_string())
            .arg(PENDING_PAGE)
            .arg(consumer);
        let reply: Value = self.query_group(&cmd, stream, group).await?;
        let counts: BTreeMap<StreamId, u32> = parse_pending(&reply)?
            .into_iter()
            .map(|p| (p.id, p.delivery_count))
            .collect();

        Ok(claimed
            .into_iter()
            .map(|entry| GroupEntry {
                delivery_count: counts.get(&entry.id).copied().unwrap_or(1),
                entry,
            })
            .collect())
    }

    async fn touch(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        ids: &[StreamId],
    ) -> Result<usize, TransportError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut cmd = redis::cmd("EVAL");
        cmd.arg(TOUCH_SCRIPT).arg(1).arg(stream).arg(group).arg(consumer);
        for id in ids {
            cmd.arg(id.to_string());
        }
        let touched: usize = self.query_group(&cmd, stream, group).await?;
        Ok(touched)
    }

    async fn ack(&self, stream: &str, group: &str, id: StreamId) -> Result<bool, TransportError> {
        let mut cmd = redis::cmd("XACK");
        cmd.arg(stream).arg(group).arg(id.to_string());
        let acked: usize = self.query_group(&cmd, stream, group).await?;
        Ok(acked > 0)
    }

    async fn pending(
        &self,
        stream: &str,
        group: &str,
    ) -> Result<Vec<PendingEntry>, TransportError> {
        let mut cmd = redis::cmd("XPENDING");
        cmd.arg(stream).arg(group).arg("-").arg("+").arg(PENDING_PAGE);
        let reply: Value = self.query_group(&cmd, stream, group).await?;
        parse_pending(&reply)
    }

    async fn trim(&self, stream: &str, max_len: usize) -> Result<usize, TransportError> {
        let mut cmd = redis::cmd("XTRIM");
        cmd.arg(stream).arg("MAXLEN").arg(max_len);
        self.query(&cmd).await
    }

    async fn len(&self, stream: &str) -> Result<usize, TransportError> {
        let mut cmd = redis::cmd("XLEN");
        cmd.arg(stream);
        self.query(&cmd).await
    }

    async fn ping(&self) -> Result<(), TransportError> {
        let _: Value = self.query(&redis::cmd("PING")).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::Release);
        *self.shared.lock().await = None;
        self.idle().clear();
        tracing::info!("Closed Redis connections");
        Ok(())
    }
}
