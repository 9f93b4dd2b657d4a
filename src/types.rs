// =============================================================================
// Shared types used across the Helix grid engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Order side as sent to the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Terminal order state reported by the user-data stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Filled,
    Canceled,
    Expired,
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Filled => write!(f, "FILLED"),
            Self::Canceled => write!(f, "CANCELED"),
            Self::Expired => write!(f, "EXPIRED"),
        }
    }
}

/// Cooperative shutdown signal shared by all long-running tasks.
#[derive(Clone, Default)]
pub struct StopSignal {
    inner: std::sync::Arc<StopInner>,
}

#[derive(Default)]
struct StopInner {
    flag: std::sync::atomic::AtomicBool,
    notify: tokio::sync::Notify,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.inner
            .flag
            .store(true, std::sync::atomic::Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_set(&self) -> bool {
        self.inner.flag.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Resolve when the signal is set (immediately if already set).
    pub async fn wait(&self) {
        if self.is_set() {
            return;
        }
        let notified = self.inner.notify.notified();
        if self.is_set() {
            return;
        }
        notified.await;
    }

    /// Sleep for `secs`, returning early (true) when the signal fires.
    pub async fn sleep_interruptible(&self, secs: f64) -> bool {
        tokio::select! {
            _ = self.wait() => true,
            _ = tokio::time::sleep(std::time::Duration::from_secs_f64(secs)) => self.is_set(),
        }
    }
}

/// Current UNIX timestamp in seconds (fractional).
pub fn now_ts() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
