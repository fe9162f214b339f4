//! Window store shared across processes through Redis.
//!
//! Each identifier is a sorted set scored by event time. Pruning, the
//! conditional append and counting run inside one Lua script, so concurrent
//! callers on any instance cannot slip past the limit between a read and a
//! write. Event timestamps come from each caller's clock: skew between
//! instances shifts window edges by that skew.
//!
//! Retention follows the widest window and largest limit this process has
//! used. Instances sharing a key prefix are expected to run the same quotas.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, IntoConnectionInfo, Script};
use tracing::{info, trace, warn};
use uuid::Uuid;

use super::backend::{window_floor, BackendKind, RetentionBounds, WindowCount, WindowStore};
use crate::config::RemoteConfig;
use crate::error::{FormGuardError, Result};

/// KEYS[1] window key
/// ARGV: now, window floor, retention floor, retention ms, member, max events,
/// conditional flag, record flag, cap
const WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local now = ARGV[1]
local floor = ARGV[2]
local retain_floor = ARGV[3]
local retain = tonumber(ARGV[4])
local member = ARGV[5]
local max_events = tonumber(ARGV[6])
local conditional = ARGV[7] == '1'
local record = ARGV[8] == '1'
local cap = tonumber(ARGV[9])

redis.call('ZREMRANGEBYSCORE', key, '-inf', '(' .. retain_floor)
local count = redis.call('ZCOUNT', key, floor, '+inf')
local recorded = 0
if record and (not conditional or count < max_events) then
    redis.call('ZADD', key, now, member)
    redis.call('ZREMRANGEBYRANK', key, 0, -(cap + 1))
    if redis.call('PTTL', key) < retain then
        redis.call('PEXPIRE', key, retain)
    end
    count = redis.call('ZCOUNT', key, floor, '+inf')
    recorded = 1
end

local function score_at(offset)
    local hit = redis.call('ZRANGEBYSCORE', key, floor, '+inf', 'WITHSCORES', 'LIMIT', offset, 1)
    if hit[2] then
        return tonumber(hit[2])
    end
    return -1
end

local release_at = count - max_events
if release_at < 0 then
    release_at = 0
end
return {count, recorded, score_at(0), score_at(release_at)}
"#;

/// What a script invocation should do after pruning.
#[derive(Debug, Clone, Copy)]
enum Mode {
    Record { conditional: bool },
    Peek,
}

/// Redis-backed window store.
///
/// Holds a reconnecting connection handle, which is cheap to clone and safe
/// to use from many tasks at once, plus the retention bounds seen so far.
pub struct RemoteWindowStore {
    conn: ConnectionManager,
    key_prefix: String,
    timeout: Duration,
    script: Script,
    bounds: RetentionBounds,
}

impl std::fmt::Debug for RemoteWindowStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteWindowStore")
            .field("key_prefix", &self.key_prefix)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl RemoteWindowStore {
    /// Connect to the configured endpoint.
    ///
    /// A malformed endpoint is a `Configuration` error; an unreachable one is
    /// `BackendUnavailable`.
    pub async fn connect(config: &RemoteConfig) -> Result<Self> {
        let endpoint = config.endpoint.as_deref().ok_or_else(|| {
            FormGuardError::Configuration("remote.endpoint is not set".to_string())
        })?;

        let mut connection_info = endpoint.into_connection_info().map_err(|e| {
            FormGuardError::Configuration(format!("invalid remote.endpoint: {}", e))
        })?;
        if let Some(credential) = &config.credential {
            connection_info.redis.password = Some(credential.clone());
        }
        let addr = connection_info.addr.to_string();

        let client = Client::open(connection_info)
            .map_err(|e| FormGuardError::Configuration(e.to_string()))?;

        let conn = tokio::time::timeout(config.connect_timeout(), ConnectionManager::new(client))
            .await
            .map_err(|_| {
                warn!(addr = %addr, "Timed out connecting to remote window store");
                FormGuardError::BackendUnavailable("connection timed out".to_string())
            })??;

        info!(addr = %addr, key_prefix = %config.key_prefix, "Connected to remote window store");

        Ok(Self {
            conn,
            key_prefix: config.key_prefix.clone(),
            timeout: config.timeout(),
            script: Script::new(WINDOW_SCRIPT),
            bounds: RetentionBounds::default(),
        })
    }

    fn key_for(&self, identifier: &str) -> String {
        format!("{}:{}", self.key_prefix, identifier)
    }

    async fn run(
        &self,
        identifier: &str,
        now: i64,
        window: Duration,
        max_events: u64,
        mode: Mode,
    ) -> Result<WindowCount> {
        let (retain_ms, cap) = self.bounds.observe(window, max_events);
        let (conditional, record) = match mode {
            Mode::Record { conditional } => (conditional, true),
            Mode::Peek => (false, false),
        };
        let member = format!("{}-{}", now, Uuid::new_v4());

        let mut invocation = self.script.key(self.key_for(identifier));
        invocation
            .arg(now)
            .arg(window_floor(now, window))
            .arg(now.saturating_sub(retain_ms))
            .arg(retain_ms)
            .arg(member)
            .arg(max_events)
            .arg(i64::from(conditional))
            .arg(i64::from(record))
            .arg(cap);

        let mut conn = self.conn.clone();
        let reply: Vec<i64> = tokio::time::timeout(self.timeout, invocation.invoke_async(&mut conn))
            .await
            .map_err(|_| {
                FormGuardError::BackendUnavailable(format!(
                    "no reply within {:?}",
                    self.timeout
                ))
            })??;

        let result = parse_reply(&reply)?;
        trace!(
            identifier = %identifier,
            count = result.count,
            recorded = result.recorded,
            "Remote window script completed"
        );
        Ok(result)
    }
}

fn parse_reply(reply: &[i64]) -> Result<WindowCount> {
    match reply {
        [count, recorded, oldest, release] => Ok(WindowCount {
            count: u64::try_from(*count).unwrap_or(0),
            oldest: (*oldest >= 0).then_some(*oldest),
            release: (*release >= 0).then_some(*release),
            recorded: *recorded == 1,
        }),
        other => Err(FormGuardError::BackendUnavailable(format!(
            "unexpected script reply: {:?}",
            other
        ))),
    }
}

#[async_trait]
impl WindowStore for RemoteWindowStore {
    async fn record_and_count(
        &self,
        identifier: &str,
        now: i64,
        window: Duration,
        max_events: u64,
    ) -> Result<WindowCount> {
        self.run(
            identifier,
            now,
            window,
            max_events,
            Mode::Record { conditional: false },
        )
        .await
    }

    async fn record_if_below(
        &self,
        identifier: &str,
        now: i64,
        window: Duration,
        max_events: u64,
    ) -> Result<WindowCount> {
        self.run(
            identifier,
            now,
            window,
            max_events,
            Mode::Record { conditional: true },
        )
        .await
    }

    async fn peek(
        &self,
        identifier: &str,
        now: i64,
        window: Duration,
        max_events: u64,
    ) -> Result<WindowCount> {
        self.run(identifier, now, window, max_events, Mode::Peek).await
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Remote
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const WINDOW: Duration = Duration::from_secs(10);

    fn test_config(endpoint: &str) -> RemoteConfig {
        RemoteConfig {
            endpoint: Some(endpoint.to_string()),
            connect_timeout_ms: 1000,
            key_prefix: format!("formguard-test-{}", Uuid::new_v4()),
            ..RemoteConfig::default()
        }
    }

    /// Connects to `REDIS_URL` (or a local default); `None` when unreachable.
    async fn get_test_store() -> Option<RemoteWindowStore> {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        RemoteWindowStore::connect(&test_config(&url)).await.ok()
    }

    #[test]
    fn test_parse_reply() {
        let parsed = parse_reply(&[3, 1, 1_000, 2_000]).unwrap();
        assert_eq!(parsed.count, 3);
        assert!(parsed.recorded);
        assert_eq!(parsed.oldest, Some(1_000));
        assert_eq!(parsed.release, Some(2_000));

        let empty = parse_reply(&[0, 0, -1, -1]).unwrap();
        assert_eq!(empty, WindowCount::empty());

        assert!(matches!(
            parse_reply(&[1, 2, 3]),
            Err(FormGuardError::BackendUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_endpoint_is_configuration_error() {
        let result = RemoteWindowStore::connect(&test_config("not a url")).await;
        assert!(matches!(result, Err(FormGuardError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_backend_unavailable() {
        let mut config = test_config("redis://127.0.0.1:1");
        config.connect_timeout_ms = 300;
        let result = RemoteWindowStore::connect(&config).await;
        assert!(matches!(result, Err(FormGuardError::BackendUnavailable(_))));
    }

    #[tokio::test]
    async fn test_remote_record_and_peek() {
        let store = match get_test_store().await {
            Some(store) => store,
            None => return,
        };

        let first = store.record_and_count("x", 0, WINDOW, 10).await.unwrap();
        assert_eq!(first.count, 1);
        assert_eq!(first.oldest, Some(0));

        store.record_and_count("x", 1_000, WINDOW, 10).await.unwrap();
        let peeked = store.peek("x", 5_000, WINDOW, 10).await.unwrap();
        assert_eq!(peeked.count, 2);
        assert!(!peeked.recorded);

        let aged = store.peek("x", 10_001, WINDOW, 10).await.unwrap();
        assert_eq!(aged.count, 1);
        assert_eq!(aged.oldest, Some(1_000));
    }

    #[tokio::test]
    async fn test_remote_record_if_below() {
        let store = match get_test_store().await {
            Some(store) => store,
            None => return,
        };

        for i in 0..3 {
            assert!(store.record_if_below("y", i, WINDOW, 3).await.unwrap().recorded);
        }
        let denied = store.record_if_below("y", 3, WINDOW, 3).await.unwrap();
        assert!(!denied.recorded);
        assert_eq!(denied.count, 3);
        assert_eq!(denied.release, Some(0));
    }

    #[tokio::test]
    async fn test_remote_attempts_are_capped() {
        let store = match get_test_store().await {
            Some(store) => store,
            None => return,
        };

        for ts in 0..50 {
            let result = store.record_and_count("capped", ts, WINDOW, 3).await.unwrap();
            assert!(result.count <= 4);
        }
        let result = store.peek("capped", 49, WINDOW, 3).await.unwrap();
        assert_eq!(result.count, 4);
        assert_eq!(result.oldest, Some(46));
        assert_eq!(result.release, Some(47));
    }

    #[tokio::test]
    async fn test_remote_short_window_keeps_longer_history() {
        let store = match get_test_store().await {
            Some(store) => store,
            None => return,
        };
        let long = Duration::from_secs(60);

        assert!(store.record_if_below("w", 0, long, 2).await.unwrap().recorded);
        assert!(store.record_if_below("w", 1_000, long, 2).await.unwrap().recorded);
        assert!(store.record_if_below("w", 20_000, WINDOW, 100).await.unwrap().recorded);

        let again = store.record_if_below("w", 21_000, long, 2).await.unwrap();
        assert!(!again.recorded);
        assert_eq!(again.count, 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_remote_concurrent_appends_respect_limit() {
        let store = match get_test_store().await {
            Some(store) => Arc::new(store),
            None => return,
        };

        let mut handles = Vec::new();
        for _ in 0..20 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.record_if_below("z", 0, WINDOW, 5).await.unwrap()
            }));
        }
        let mut recorded = 0;
        for handle in handles {
            if handle.await.unwrap().recorded {
                recorded += 1;
            }
        }
        assert_eq!(recorded, 5);
    }
}
