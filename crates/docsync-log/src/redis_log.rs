//! Redis Streams implementation of [`DurableLog`].
//!
//! Every operation is one stream command: XADD with approximate MAXLEN
//! trimming, XGROUP CREATE ... MKSTREAM, XREADGROUP, XACK, XPENDING,
//! XCLAIM, XINFO STREAM and XRANGE. Approximate trimming lets Redis keep
//! slightly more than `capacity` entries, never fewer.
//!
//! Blocking reads run on connections of their own so a waiting consumer
//! never stalls the commands of the others. Pending entries whose message
//! was trimmed are dropped by XCLAIM itself on Redis 7 and later.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::{Client, Cmd, RedisError, Value};
use tracing::{debug, info};

use docsync_types::{BrokerSettings, StreamFields};

use crate::error::LogError;
use crate::id::MessageId;
use crate::log::{DurableLog, GroupCreation, PendingEntry, StartPosition, StreamEntry, StreamInfo};

/// [`DurableLog`] backed by a Redis server.
pub struct RedisLog {
    client: Client,
    shared: ConnectionManager,
    /// Idle connections for blocking XREADGROUP calls
    blocking: Mutex<Vec<MultiplexedConnection>>,
}

impl RedisLog {
    /// Connect to the broker at `url` (`redis://host:port/db`).
    pub async fn connect(url: &str) -> Result<Self, LogError> {
        let client = Client::open(url).map_err(|e| LogError::Connection(e.to_string()))?;
        let shared = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| LogError::Connection(e.to_string()))?;
        info!(addr = %client.get_connection_info().addr, "Connected to Redis");
        Ok(Self {
            client,
            shared,
            blocking: Mutex::new(Vec::new()),
        })
    }

    pub async fn from_settings(settings: &BrokerSettings) -> Result<Self, LogError> {
        Self::connect(&settings.url).await
    }

    async fn query(&self, cmd: &Cmd) -> Result<Value, RedisError> {
        let mut conn = self.shared.clone();
        cmd.query_async(&mut conn).await
    }

    async fn blocking_connection(&self) -> Result<MultiplexedConnection, LogError> {
        let idle = self.lock_blocking()?.pop();
        match idle {
            Some(conn) => Ok(conn),
            None => self
                .client
                .get_multiplexed_async_connection()
                .await
                .map_err(|e| LogError::Connection(e.to_string())),
        }
    }

    fn lock_blocking(&self) -> Result<std::sync::MutexGuard<'_, Vec<MultiplexedConnection>>, LogError> {
        self.blocking
            .lock()
            .map_err(|_| LogError::Other("blocking connection pool poisoned".to_string()))
    }
}

#[async_trait]
impl DurableLog for RedisLog {
    async fn append(
        &self,
        stream: &str,
        fields: StreamFields,
        capacity: usize,
    ) -> Result<MessageId, LogError> {
        let reply = self
            .query(&xadd(stream, &fields, capacity))
            .await
            .map_err(|e| classify(e, stream, None))?;
        parse_id(&reply)
    }

    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start: StartPosition,
    ) -> Result<GroupCreation, LogError> {
        match self.query(&xgroup_create(stream, group, start)).await {
            Ok(_) => {
                info!(stream, group, ?start, "Created consumer group");
                Ok(GroupCreation::Created)
            }
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(GroupCreation::AlreadyExists),
            Err(e) => Err(classify(e, stream, Some(group))),
        }
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        max_count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, LogError> {
        let cmd = xreadgroup(stream, group, consumer, max_count, block);
        if block.is_zero() {
            let reply = self
                .query(&cmd)
                .await
                .map_err(|e| classify(e, stream, Some(group)))?;
            return parse_read_reply(&reply);
        }

        let mut conn = self.blocking_connection().await?;
        let reply: Value = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| classify(e, stream, Some(group)))?;
        self.lock_blocking()?.push(conn);
        parse_read_reply(&reply)
    }

    async fn ack(&self, stream: &str, group: &str, id: &MessageId) -> Result<bool, LogError> {
        let mut cmd = redis::cmd("XACK");
        cmd.arg(stream).arg(group).arg(id.to_string());
        let reply = self
            .query(&cmd)
            .await
            .map_err(|e| classify(e, stream, Some(group)))?;
        Ok(int(&reply)? > 0)
    }

    async fn list_pending(
        &self,
        stream: &str,
        group: &str,
        max_count: usize,
    ) -> Result<Vec<PendingEntry>, LogError> {
        let mut cmd = redis::cmd("XPENDING");
        cmd.arg(stream).arg(group).arg("-").arg("+").arg(max_count.max(1));
        let reply = self
            .query(&cmd)
            .await
            .map_err(|e| classify(e, stream, Some(group)))?;
        parse_pending(&reply)
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[MessageId],
    ) -> Result<Vec<StreamEntry>, LogError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let reply = self
            .query(&xclaim(stream, group, consumer, min_idle, ids))
            .await
            .map_err(|e| classify(e, stream, Some(group)))?;
        let claimed = parse_entries(&reply)?;
        debug!(stream, group, consumer, requested = ids.len(), claimed = claimed.len(), "XCLAIM");
        Ok(claimed)
    }

    async fn stream_info(&self, stream: &str) -> Result<StreamInfo, LogError> {
        let mut cmd = redis::cmd("XINFO");
        cmd.arg("STREAM").arg(stream);
        let reply = self
            .query(&cmd)
            .await
            .map_err(|e| classify(e, stream, None))?;
        parse_info(&reply)
    }

    async fn range(&self, stream: &str, max_count: usize) -> Result<Vec<StreamEntry>, LogError> {
        let mut cmd = redis::cmd("XRANGE");
        cmd.arg(stream).arg("-").arg("+").arg("COUNT").arg(max_count.max(1));
        let reply = self
            .query(&cmd)
            .await
            .map_err(|e| classify(e, stream, None))?;
        parse_entries(&reply)
    }
}

fn xadd(stream: &str, fields: &StreamFields, capacity: usize) -> Cmd {
    let mut cmd = redis::cmd("XADD");
    cmd.arg(stream)
        .arg("MAXLEN")
        .arg("~")
        .arg(capacity.max(1))
        .arg("*");
    for (key, value) in fields {
        cmd.arg(key).arg(value);
    }
    cmd
}

fn xgroup_create(stream: &str, group: &str, start: StartPosition) -> Cmd {
    let from = match start {
        StartPosition::Beginning => "0",
        StartPosition::NewOnly => "$",
    };
    let mut cmd = redis::cmd("XGROUP");
    cmd.arg("CREATE")
        .arg(stream)
        .arg(group)
        .arg(from)
        .arg("MKSTREAM");
    cmd
}

fn xreadgroup(stream: &str, group: &str, consumer: &str, max_count: usize, block: Duration) -> Cmd {
    let mut cmd = redis::cmd("XREADGROUP");
    cmd.arg("GROUP")
        .arg(group)
        .arg(consumer)
        .arg("COUNT")
        .arg(max_count.max(1));
    // BLOCK 0 waits forever; a zero duration means "don't block" here.
    if !block.is_zero() {
        cmd.arg("BLOCK").arg(millis(block).max(1));
    }
    cmd.arg("STREAMS").arg(stream).arg(">");
    cmd
}

fn xclaim(stream: &str, group: &str, consumer: &str, min_idle: Duration, ids: &[MessageId]) -> Cmd {
    let mut cmd = redis::cmd("XCLAIM");
    cmd.arg(stream).arg(group).arg(consumer).arg(millis(min_idle));
    for id in ids {
        cmd.arg(id.to_string());
    }
    cmd
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn classify(err: RedisError, stream: &str, group: Option<&str>) -> LogError {
    if err.is_io_error()
        || err.is_connection_dropped()
        || err.is_connection_refusal()
        || err.is_timeout()
    {
        return LogError::Connection(err.to_string());
    }
    match (err.code(), group) {
        (Some("NOGROUP"), Some(group)) => LogError::NoSuchGroup {
            stream: stream.to_string(),
            group: group.to_string(),
        },
        _ if err.to_string().to_lowercase().contains("no such key") => {
            LogError::NoSuchStream(stream.to_string())
        }
        _ => LogError::Other(err.to_string()),
    }
}

fn unexpected(what: &str, value: &Value) -> LogError {
    LogError::Other(format!("unexpected {what} reply: {value:?}"))
}

fn text(value: &Value) -> Result<String, LogError> {
    match value {
        Value::BulkString(bytes) => String::from_utf8(bytes.clone())
            .map_err(|_| LogError::Other("non UTF-8 stream data".to_string())),
        Value::SimpleString(s) => Ok(s.clone()),
        other => Err(unexpected("string", other)),
    }
}

fn int(value: &Value) -> Result<u64, LogError> {
    match value {
        Value::Int(n) => u64::try_from(*n).map_err(|_| unexpected("count", value)),
        other => text(other)?.parse().map_err(|_| unexpected("integer", other)),
    }
}

fn parse_id(value: &Value) -> Result<MessageId, LogError> {
    text(value)?.parse()
}

/// Flat `[k1, v1, k2, v2, ...]` arrays (RESP2) and maps (RESP3) alike.
fn pairs(value: &Value) -> Result<Vec<(&Value, &Value)>, LogError> {
    match value {
        Value::Array(items) if items.len() % 2 == 0 => Ok(items
            .chunks_exact(2)
            .map(|pair| (&pair[0], &pair[1]))
            .collect()),
        Value::Map(items) => Ok(items.iter().map(|(k, v)| (k, v)).collect()),
        other => Err(unexpected("field list", other)),
    }
}

fn parse_fields(value: &Value) -> Result<StreamFields, LogError> {
    pairs(value)?
        .into_iter()
        .map(|(key, value)| Ok((text(key)?, text(value)?)))
        .collect()
}

/// Entry lists of XRANGE, XCLAIM and XREADGROUP. Entries whose message
/// no longer exists come back as nil and are skipped.
fn parse_entries(value: &Value) -> Result<Vec<StreamEntry>, LogError> {
    let items = match value {
        Value::Nil => return Ok(Vec::new()),
        Value::Array(items) => items,
        other => return Err(unexpected("entry list", other)),
    };
    let mut entries = Vec::with_capacity(items.len());
    for item in items {
        match item {
            Value::Nil => continue,
            Value::Array(parts) if parts.len() == 2 => {
                if matches!(parts[1], Value::Nil) {
                    continue;
                }
                entries.push(StreamEntry::new(parse_id(&parts[0])?, parse_fields(&parts[1])?));
            }
            other => return Err(unexpected("entry", other)),
        }
    }
    Ok(entries)
}

/// XREADGROUP reply: nil on timeout, else `[[stream, entries], ...]`.
fn parse_read_reply(value: &Value) -> Result<Vec<StreamEntry>, LogError> {
    let streams: Vec<&Value> = match value {
        Value::Nil => return Ok(Vec::new()),
        Value::Array(streams) => streams
            .iter()
            .map(|stream| match stream {
                Value::Array(parts) if parts.len() == 2 => Ok(&parts[1]),
                other => Err(unexpected("stream", other)),
            })
            .collect::<Result<_, _>>()?,
        Value::Map(streams) => streams.iter().map(|(_, entries)| entries).collect(),
        other => return Err(unexpected("XREADGROUP", other)),
    };
    let mut entries = Vec::new();
    for stream in streams {
        entries.extend(parse_entries(stream)?);
    }
    Ok(entries)
}

/// Extended XPENDING reply: `[[id, consumer, idle_ms, deliveries], ...]`.
fn parse_pending(value: &Value) -> Result<Vec<PendingEntry>, LogError> {
    let items = match value {
        Value::Nil => return Ok(Vec::new()),
        Value::Array(items) => items,
        other => return Err(unexpected("XPENDING", other)),
    };
    items
        .iter()
        .map(|item| match item {
            Value::Array(parts) if parts.len() == 4 => Ok(PendingEntry {
                id: parse_id(&parts[0])?,
                consumer: text(&parts[1])?,
                idle: Duration::from_millis(int(&parts[2])?),
                delivery_count: int(&parts[3])?,
            }),
            other => Err(unexpected("pending entry", other)),
        })
        .collect()
}

fn parse_info(value: &Value) -> Result<StreamInfo, LogError> {
    let mut info = StreamInfo::default();
    let mut entries_added = None;
    for (key, value) in pairs(value)? {
        let Ok(key) = text(key) else { continue };
        match key.as_str() {
            "length" => info.length = int(value)? as usize,
            "groups" => info.groups = int(value)? as usize,
            "entries-added" => entries_added = Some(int(value)?),
            _ => {}
        }
    }
    // Servers before 7.0 do not track the total.
    info.entries_added = entries_added.unwrap_or(info.length as u64);
    Ok(info)
}
