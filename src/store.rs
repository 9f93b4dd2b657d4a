// =============================================================================
// State Store — Redis-backed key-value state + strategy-event stream
// =============================================================================
//
// All keys are namespaced by account scope. Redis is optional: when the
// connection is absent or an operation fails, callers get a best-effort
// no-op and strategy logic continues unaffected.

use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

/// Mid-price cache TTL for external consumers (seconds).
const PRICE_TTL_SEC: u64 = 30;

/// Account-scoped state store.
#[derive(Clone)]
pub struct StateStore {
    scope: String,
    conn: Option<redis::aio::ConnectionManager>,
}

impl StateStore {
    /// Connect to redis at `url`; a failed connection yields a disabled
    /// store rather than an error.
    pub async fn connect(url: &str, scope: &str) -> Self {
        let conn = match redis::Client::open(url) {
            Ok(client) => match tokio::time::timeout(
                std::time::Duration::from_secs(2),
                client.get_connection_manager(),
            )
            .await
            {
                Ok(Ok(conn)) => {
                    info!(url, scope, "state store connected");
                    Some(conn)
                }
                Ok(Err(e)) => {
                    warn!(url, error = %e, "state store unavailable — running without persistence");
                    None
                }
                Err(_) => {
                    warn!(url, "state store connection timed out — running without persistence");
                    None
                }
            },
            Err(e) => {
                warn!(url, error = %e, "invalid redis url — running without persistence");
                None
            }
        };
        Self {
            scope: scope.to_string(),
            conn,
        }
    }

    /// A store that persists nothing (tests, redis-less deployments).
    pub fn disabled(scope: &str) -> Self {
        Self {
            scope: scope.to_string(),
            conn: None,
        }
    }

    pub fn is_available(&self) -> bool {
        self.conn.is_some()
    }

    pub fn scoped_key(&self, key: &str) -> String {
        format!("{}:{}", self.scope, key)
    }

    fn events_key(&self) -> String {
        self.scoped_key("strategy_events")
    }

    // ── JSON state blobs ────────────────────────────────────────────────

    /// Read and deserialize a scoped state key. `None` on miss or error.
    pub async fn get_state<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let mut conn = self.conn.clone()?;
        let full_key = self.scoped_key(key);
        let raw: Option<String> = match conn.get(&full_key).await {
            Ok(v) => v,
            Err(e) => {
                debug!(key = %full_key, error = %e, "state read failed");
                return None;
            }
        };
        let raw = raw?;
        match serde_json::from_str(&raw) {
            Ok(v) => Some(v),
            Err(e) => {
                debug!(key = %full_key, error = %e, "state decode failed");
                None
            }
        }
    }

    /// Serialize and write a scoped state key. Best-effort.
    pub async fn set_state<T: Serialize>(&self, key: &str, value: &T) -> bool {
        let Some(mut conn) = self.conn.clone() else {
            return false;
        };
        let full_key = self.scoped_key(key);
        let raw = match serde_json::to_string(value) {
            Ok(r) => r,
            Err(e) => {
                debug!(key = %full_key, error = %e, "state encode failed");
                return false;
            }
        };
        match conn.set::<_, _, ()>(&full_key, raw).await {
            Ok(()) => true,
            Err(e) => {
                debug!(key = %full_key, error = %e, "state write failed");
                false
            }
        }
    }

    // ── Price cache ─────────────────────────────────────────────────────

    /// Cache a mid-price under `price:{SYMBOL}` (scoped) with a 30 s TTL
    /// for external risk consumers.
    pub async fn set_price(&self, symbol: &str, mark: f64, ts_ms: i64) {
        let Some(mut conn) = self.conn.clone() else {
            return;
        };
        let key = self.scoped_key(&format!("price:{}", symbol.to_uppercase()));
        let payload = serde_json::json!({ "mark": mark, "ts_ms": ts_ms, "source": "helix" });
        if let Err(e) = conn
            .set_ex::<_, _, ()>(&key, payload.to_string(), PRICE_TTL_SEC)
            .await
        {
            debug!(key = %key, error = %e, "price cache write failed");
        }
    }

    // ── Strategy events ─────────────────────────────────────────────────

    /// Append strategy events to the time-indexed stream.
    /// `items` are (event_time_ms, serialized_event) pairs; uniqueness comes
    /// from the event id embedded in the payload.
    pub async fn append_strategy_events(&self, items: &[(i64, String)]) -> anyhow::Result<()> {
        let Some(mut conn) = self.conn.clone() else {
            anyhow::bail!("state store unavailable");
        };
        if items.is_empty() {
            return Ok(());
        }
        let key = self.events_key();
        let members: Vec<(i64, &str)> = items
            .iter()
            .map(|(score, payload)| (*score, payload.as_str()))
            .collect();
        conn.zadd_multiple::<_, i64, &str, ()>(&key, &members)
            .await?;
        Ok(())
    }

    /// Drop events older than the retention window.
    pub async fn prune_strategy_events(&self, retention_days: f64, now_ms: i64) {
        let Some(mut conn) = self.conn.clone() else {
            return;
        };
        let cutoff = now_ms - (retention_days.max(0.0) * 86_400_000.0) as i64;
        let key = self.events_key();
        match conn
            .zrembyscore::<_, i64, i64, i64>(&key, i64::MIN, cutoff)
            .await
        {
            Ok(removed) if removed > 0 => {
                debug!(removed, "strategy events pruned");
            }
            Ok(_) => {}
            Err(e) => {
                debug!(error = %e, "strategy event prune failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_store_reports_unavailable() {
        let store = StateStore::disabled("acct-test");
        assert!(!store.is_available());
    }

    #[test]
    fn keys_are_scope_prefixed() {
        let store = StateStore::disabled("acct-abc123");
        assert_eq!(
            store.scoped_key("runtime_state:BTCUSDT"),
            "acct-abc123:runtime_state:BTCUSDT"
        );
        assert_eq!(store.events_key(), "acct-abc123:strategy_events");
    }

    #[tokio::test]
    async fn disabled_store_degrades_gracefully() {
        let store = StateStore::disabled("acct-test");
        let miss: Option<serde_json::Value> = store.get_state("runtime_state:BTCUSDT").await;
        assert!(miss.is_none());
        assert!(!store.set_state("session_config", &serde_json::json!({})).await);
        assert!(store
            .append_strategy_events(&[(0, "{}".to_string())])
            .await
            .is_err());
    }
}
