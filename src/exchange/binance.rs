// =============================================================================
// Binance Futures Executor — HMAC-SHA256 signed REST + user-data stream
// =============================================================================
//
// SECURITY: the secret key is never logged or serialized. All signed requests
// carry X-MBX-APIKEY as a header and a recvWindow of 5 000 ms to tolerate
// minor clock drift between the bot and Binance servers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::Method;
use sha2::Sha256;
use tokio_tungstenite::connect_async;
use tracing::{debug, error, info, warn};

use crate::exchange::{
    derive_account_scope, round_price, round_qty, to_unified_symbol, ExchangeExecutor,
    FillResult, OrderUpdateHandler, PositionInfo, SymbolInfo,
};
use crate::types::{now_ts, OrderSide, OrderStatus};

type HmacSha256 = Hmac<Sha256>;

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

const FUTURES_REST: &str = "https://fapi.binance.com";
const FUTURES_WSS: &str = "wss://fstream.binance.com/ws";

/// Binance error code: post-only order would immediately match.
const ERR_WOULD_MATCH: i64 = -5022;
/// Binance error code: no need to modify the order (amend is a no-op).
const ERR_NO_NEED_TO_MODIFY: i64 = -5027;
/// Binance error code: unknown order (already gone).
const ERR_UNKNOWN_ORDER: i64 = -2011;

/// Binance USDⓈ-M futures executor.
pub struct BinanceFuturesExecutor {
    secret: String,
    base_url: String,
    client: reqwest::Client,
    account_scope: String,
    symbol_info: RwLock<HashMap<String, SymbolInfo>>,
    tracked_orders: RwLock<HashMap<String, String>>,
    order_update_handler: RwLock<Option<OrderUpdateHandler>>,
}

impl BinanceFuturesExecutor {
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>, preferred_scope: &str) -> Self {
        let api_key = api_key.into();
        let secret = secret.into();
        let account_scope = derive_account_scope(&api_key, preferred_scope);

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }
        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        debug!(scope = %account_scope, "BinanceFuturesExecutor initialised");

        Self {
            secret,
            base_url: FUTURES_REST.to_string(),
            client,
            account_scope,
            symbol_info: RwLock::new(HashMap::new()),
            tracked_orders: RwLock::new(HashMap::new()),
            order_update_handler: RwLock::new(None),
        }
    }

    pub fn account_scope(&self) -> &str {
        &self.account_scope
    }

    // ── Signing ─────────────────────────────────────────────────────────

    fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    /// Signed request returning the parsed body plus Binance error code (if any).
    async fn signed_request(
        &self,
        method: Method,
        path: &str,
        params: &str,
    ) -> Result<(serde_json::Value, Option<i64>)> {
        let qs = self.signed_query(params);
        let url = format!("{}{}?{}", self.base_url, path, qs);

        let resp = self
            .client
            .request(method.clone(), &url)
            .send()
            .await
            .with_context(|| format!("{method} {path} request failed"))?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .with_context(|| format!("{method} {path}: invalid JSON response"))?;

        let code = body.get("code").and_then(|c| c.as_i64()).filter(|c| *c < 0);
        if !status.is_success() && code.is_none() {
            anyhow::bail!("{method} {path} returned {status}: {body}");
        }
        Ok((body, code))
    }

    // ── Symbol filters ──────────────────────────────────────────────────

    async fn load_exchange_info(&self) -> Result<()> {
        let url = format!("{}/fapi/v1/exchangeInfo", self.base_url);
        let body: serde_json::Value = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /fapi/v1/exchangeInfo failed")?
            .json()
            .await
            .context("exchangeInfo: invalid JSON")?;

        let symbols = body["symbols"]
            .as_array()
            .context("exchangeInfo missing 'symbols'")?;

        let mut parsed = 0usize;
        let mut cache = self.symbol_info.write();
        for entry in symbols {
            let Some(raw) = entry["symbol"].as_str() else { continue };
            let mut info = SymbolInfo {
                symbol: raw.to_string(),
                min_qty: 0.0,
                qty_step: 0.0,
                price_step: 0.0,
                price_precision: entry["pricePrecision"].as_u64().unwrap_or(8) as u32,
                qty_precision: entry["quantityPrecision"].as_u64().unwrap_or(8) as u32,
                min_notional: 5.0,
            };
            if let Some(filters) = entry["filters"].as_array() {
                for f in filters {
                    match f["filterType"].as_str() {
                        Some("LOT_SIZE") => {
                            info.min_qty = str_f64(&f["minQty"]);
                            info.qty_step = str_f64(&f["stepSize"]);
                        }
                        Some("PRICE_FILTER") => {
                            info.price_step = str_f64(&f["tickSize"]);
                        }
                        Some("MIN_NOTIONAL") => {
                            let n = str_f64(&f["notional"]);
                            if n > 0.0 {
                                info.min_notional = n;
                            }
                        }
                        _ => {}
                    }
                }
            }
            cache.insert(raw.to_string(), info);
            parsed += 1;
        }
        info!(symbols = parsed, "exchange info loaded");
        Ok(())
    }

    fn fill_from_order_response(&self, body: &serde_json::Value, symbol: &str) -> Option<FillResult> {
        let executed = str_f64(&body["executedQty"]);
        if executed <= 0.0 {
            return None;
        }
        let avg_price = str_f64(&body["avgPrice"]);
        let side = match body["side"].as_str() {
            Some("SELL") => OrderSide::Sell,
            _ => OrderSide::Buy,
        };
        Some(FillResult {
            order_id: order_id_string(body),
            symbol: symbol.to_string(),
            side,
            qty: executed,
            avg_price,
            cost: executed * avg_price,
            // Commission is not part of the order response; the user-data
            // stream carries it and callers estimate from the fee schedule.
            fee: 0.0,
            is_maker: false,
            timestamp: now_ts(),
        })
    }

    fn track(&self, order_id: &str, symbol: &str) {
        self.tracked_orders
            .write()
            .insert(order_id.to_string(), symbol.to_string());
    }

    fn untrack(&self, order_id: &str) {
        self.tracked_orders.write().remove(order_id);
    }

    // ── User-data stream ────────────────────────────────────────────────

    async fn create_listen_key(&self) -> Result<String> {
        let url = format!("{}/fapi/v1/listenKey", self.base_url);
        let body: serde_json::Value = self
            .client
            .post(&url)
            .send()
            .await
            .context("POST /fapi/v1/listenKey failed")?
            .json()
            .await
            .context("listenKey: invalid JSON")?;
        body["listenKey"]
            .as_str()
            .map(|s| s.to_string())
            .context("listenKey missing in response")
    }

    async fn keepalive_listen_key(&self) -> Result<()> {
        let url = format!("{}/fapi/v1/listenKey", self.base_url);
        self.client
            .put(&url)
            .send()
            .await
            .context("PUT /fapi/v1/listenKey failed")?;
        Ok(())
    }

    fn dispatch_order_update(&self, payload: &serde_json::Value) {
        let order = &payload["o"];
        let status = match order["X"].as_str() {
            Some("FILLED") => OrderStatus::Filled,
            Some("CANCELED") => OrderStatus::Canceled,
            Some("EXPIRED") => OrderStatus::Expired,
            _ => return,
        };
        let order_id = order["i"]
            .as_u64()
            .map(|v| v.to_string())
            .or_else(|| order["i"].as_str().map(|s| s.to_string()))
            .unwrap_or_default();
        if order_id.is_empty() {
            return;
        }
        self.untrack(&order_id);

        let fill = if status == OrderStatus::Filled {
            let symbol = order["s"].as_str().unwrap_or_default().to_string();
            let qty = str_f64(&order["z"]);
            let avg_price = str_f64(&order["ap"]);
            let side = match order["S"].as_str() {
                Some("SELL") => OrderSide::Sell,
                _ => OrderSide::Buy,
            };
            Some(FillResult {
                order_id: order_id.clone(),
                symbol,
                side,
                qty,
                avg_price,
                cost: qty * avg_price,
                fee: str_f64(&order["n"]),
                is_maker: order["m"].as_bool().unwrap_or(false),
                timestamp: payload["E"].as_f64().unwrap_or(0.0) / 1000.0,
            })
        } else {
            None
        };

        let handler = self.order_update_handler.read().clone();
        if let Some(handler) = handler {
            handler(&order_id, status, fill);
        }
    }

    async fn user_stream_loop(self: Arc<Self>) {
        loop {
            let listen_key = match self.create_listen_key().await {
                Ok(k) => k,
                Err(e) => {
                    error!(error = %e, "listen key creation failed — retrying in 5s");
                    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                    continue;
                }
            };
            let url = format!("{FUTURES_WSS}/{listen_key}");

            // Keepalive every 30 minutes while this connection lives.
            let keepalive = {
                let this = Arc::clone(&self);
                tokio::spawn(async move {
                    loop {
                        tokio::time::sleep(std::time::Duration::from_secs(1800)).await;
                        if let Err(e) = this.keepalive_listen_key().await {
                            warn!(error = %e, "listen key keepalive failed");
                        }
                    }
                })
            };

            match connect_async(&url).await {
                Ok((ws_stream, _)) => {
                    info!("user-data stream connected");
                    let (_write, mut read) = ws_stream.split();
                    while let Some(msg) = read.next().await {
                        match msg {
                            Ok(tokio_tungstenite::tungstenite::Message::Text(text)) => {
                                if let Ok(payload) =
                                    serde_json::from_str::<serde_json::Value>(&text)
                                {
                                    if payload["e"].as_str() == Some("ORDER_TRADE_UPDATE") {
                                        self.dispatch_order_update(&payload);
                                    }
                                }
                            }
                            Ok(_) => {}
                            Err(e) => {
                                error!(error = %e, "user-data stream read error");
                                break;
                            }
                        }
                    }
                    warn!("user-data stream ended — reconnecting in 3s");
                }
                Err(e) => {
                    error!(error = %e, "user-data stream connect failed — retrying in 5s");
                }
            }
            keepalive.abort();
            tokio::time::sleep(std::time::Duration::from_secs(3)).await;
        }
    }
}

/// Tagged client order id so our orders are recognisable in exports.
fn new_client_order_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("hx-{}", &id[..20])
}

fn str_f64(v: &serde_json::Value) -> f64 {
    v.as_str()
        .and_then(|s| s.parse().ok())
        .or_else(|| v.as_f64())
        .unwrap_or(0.0)
}

fn order_id_string(body: &serde_json::Value) -> String {
    body["orderId"]
        .as_u64()
        .map(|v| v.to_string())
        .or_else(|| body["orderId"].as_str().map(|s| s.to_string()))
        .unwrap_or_default()
}

#[async_trait]
impl ExchangeExecutor for BinanceFuturesExecutor {
    async fn get_symbol_info(&self, symbol: &str) -> Option<SymbolInfo> {
        {
            let cache = self.symbol_info.read();
            if let Some(info) = cache.get(symbol) {
                return Some(info.clone());
            }
        }
        if let Err(e) = self.load_exchange_info().await {
            warn!(symbol, error = %e, "exchange info load failed");
            return None;
        }
        self.symbol_info.read().get(symbol).cloned()
    }

    async fn fire_limit_sell(&self, symbol: &str, qty: f64, price: f64) -> Option<String> {
        let info = self.get_symbol_info(symbol).await?;
        let qty = round_qty(qty, &info);
        let price = round_price(price, &info);
        if qty < info.min_qty {
            return None;
        }

        let client_id = new_client_order_id();
        let params = format!(
            "symbol={symbol}&side=SELL&type=LIMIT&timeInForce=GTX&quantity={qty}&price={price}\
             &newClientOrderId={client_id}"
        );
        match self.signed_request(Method::POST, "/fapi/v1/order", &params).await {
            Ok((body, None)) => {
                let oid = order_id_string(&body);
                if oid.is_empty() {
                    return None;
                }
                self.track(&oid, symbol);
                Some(oid)
            }
            Ok((_, Some(code))) => {
                if code == ERR_WOULD_MATCH {
                    debug!(symbol, "GTX sell rejected (would be taker)");
                } else {
                    warn!(symbol, code, "GTX sell rejected");
                }
                None
            }
            Err(e) => {
                warn!(symbol, error = %e, "fire_limit_sell failed");
                None
            }
        }
    }

    async fn limit_buy(&self, symbol: &str, qty: f64, price: f64) -> Option<FillResult> {
        let info = self.get_symbol_info(symbol).await?;
        let qty = round_qty(qty, &info);
        let price = round_price(price, &info);
        if qty < info.min_qty {
            return None;
        }

        let params = format!(
            "symbol={symbol}&side=BUY&type=LIMIT&timeInForce=GTX&quantity={qty}&price={price}\
             &reduceOnly=true&newOrderRespType=RESULT"
        );
        match self.signed_request(Method::POST, "/fapi/v1/order", &params).await {
            Ok((body, None)) => {
                if body["status"].as_str() == Some("FILLED") {
                    return self.fill_from_order_response(&body, symbol);
                }
                let oid = order_id_string(&body);
                if oid.is_empty() {
                    return None;
                }
                // Rested as maker — give it one short confirmation window,
                // then cancel: this path wants an immediate exit.
                tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                let query = format!("symbol={symbol}&orderId={oid}");
                if let Ok((order, None)) = self
                    .signed_request(Method::GET, "/fapi/v1/order", &query)
                    .await
                {
                    let status = order["status"].as_str().unwrap_or_default();
                    let filled = str_f64(&order["executedQty"]);
                    if filled > 0.0 {
                        if status != "FILLED" {
                            self.cancel_order(&oid, symbol).await;
                        }
                        return self.fill_from_order_response(&order, symbol);
                    }
                }
                self.cancel_order(&oid, symbol).await;
                None
            }
            Ok((_, Some(code))) => {
                if code == ERR_WOULD_MATCH {
                    debug!(symbol, "GTX buy rejected (would be taker)");
                }
                None
            }
            Err(e) => {
                warn!(symbol, error = %e, "limit_buy failed");
                None
            }
        }
    }

    async fn rest_limit_buy(
        &self,
        symbol: &str,
        qty: f64,
        price: f64,
    ) -> Option<(String, Option<FillResult>)> {
        let info = self.get_symbol_info(symbol).await?;
        let qty = round_qty(qty, &info);
        let price = round_price(price, &info);
        if qty < info.min_qty {
            return None;
        }

        let client_id = new_client_order_id();
        let params = format!(
            "symbol={symbol}&side=BUY&type=LIMIT&timeInForce=GTX&quantity={qty}&price={price}\
             &reduceOnly=true&newOrderRespType=RESULT&newClientOrderId={client_id}"
        );
        match self.signed_request(Method::POST, "/fapi/v1/order", &params).await {
            Ok((body, None)) => {
                let oid = order_id_string(&body);
                if oid.is_empty() {
                    return None;
                }
                if body["status"].as_str() == Some("FILLED") {
                    return Some((oid, self.fill_from_order_response(&body, symbol)));
                }
                self.track(&oid, symbol);
                Some((oid, None))
            }
            Ok((_, Some(code))) => {
                if code == ERR_WOULD_MATCH {
                    debug!(symbol, "resting GTX buy rejected (would be taker)");
                }
                None
            }
            Err(e) => {
                warn!(symbol, error = %e, "rest_limit_buy failed");
                None
            }
        }
    }

    async fn ioc_buy(&self, symbol: &str, qty: f64, price: f64) -> Option<FillResult> {
        let info = self.get_symbol_info(symbol).await?;
        let qty = round_qty(qty, &info);
        let price = round_price(price, &info);
        if qty < info.min_qty {
            return None;
        }

        let params = format!(
            "symbol={symbol}&side=BUY&type=LIMIT&timeInForce=IOC&quantity={qty}&price={price}\
             &reduceOnly=true&newOrderRespType=RESULT"
        );
        match self.signed_request(Method::POST, "/fapi/v1/order", &params).await {
            Ok((body, None)) => self.fill_from_order_response(&body, symbol),
            Ok((_, Some(code))) => {
                debug!(symbol, code, "IOC buy rejected");
                None
            }
            Err(e) => {
                warn!(symbol, error = %e, "ioc_buy failed");
                None
            }
        }
    }

    async fn market_buy(&self, symbol: &str, qty: f64) -> Option<FillResult> {
        let info = self.get_symbol_info(symbol).await?;
        let qty = round_qty(qty, &info);
        if qty < info.min_qty {
            return None;
        }

        let params = format!(
            "symbol={symbol}&side=BUY&type=MARKET&quantity={qty}&reduceOnly=true\
             &newOrderRespType=RESULT"
        );
        match self.signed_request(Method::POST, "/fapi/v1/order", &params).await {
            Ok((body, None)) => self.fill_from_order_response(&body, symbol),
            Ok((_, Some(code))) => {
                warn!(symbol, code, "market buy rejected");
                None
            }
            Err(e) => {
                warn!(symbol, error = %e, "market_buy failed");
                None
            }
        }
    }

    async fn amend_order(
        &self,
        order_id: &str,
        symbol: &str,
        side: OrderSide,
        qty: f64,
        price: f64,
    ) -> Option<String> {
        let info = self.get_symbol_info(symbol).await?;
        let qty = round_qty(qty, &info);
        let price = round_price(price, &info);
        if qty < info.min_qty {
            return None;
        }

        let params = format!(
            "orderId={order_id}&symbol={symbol}&side={}&quantity={qty}&price={price}",
            side.as_str()
        );
        match self.signed_request(Method::PUT, "/fapi/v1/order", &params).await {
            Ok((body, None)) => {
                let new_id = order_id_string(&body);
                if new_id.is_empty() {
                    return Some(order_id.to_string());
                }
                if new_id != order_id {
                    self.untrack(order_id);
                    self.track(&new_id, symbol);
                }
                Some(new_id)
            }
            Ok((_, Some(code))) => match code {
                // Order is alive with the requested price already.
                ERR_NO_NEED_TO_MODIFY => Some(order_id.to_string()),
                ERR_WOULD_MATCH => {
                    debug!(symbol, "amend rejected (would be taker)");
                    None
                }
                ERR_UNKNOWN_ORDER => {
                    debug!(symbol, "amend target already gone");
                    None
                }
                _ => {
                    warn!(symbol, code, "amend rejected");
                    None
                }
            },
            Err(e) => {
                warn!(symbol, error = %e, "amend_order failed");
                None
            }
        }
    }

    async fn cancel_order(&self, order_id: &str, symbol: &str) -> bool {
        let params = format!("symbol={symbol}&orderId={order_id}");
        let result = self
            .signed_request(Method::DELETE, "/fapi/v1/order", &params)
            .await;
        self.untrack(order_id);
        match result {
            Ok((_, None)) => true,
            // Already gone counts as success.
            Ok((_, Some(code))) => code == ERR_UNKNOWN_ORDER,
            Err(e) => {
                warn!(symbol, error = %e, "cancel_order failed");
                false
            }
        }
    }

    async fn cancel_all_symbol_orders(&self, symbol: &str) -> usize {
        let stale: Vec<String> = {
            let tracked = self.tracked_orders.read();
            tracked
                .iter()
                .filter(|(_, sym)| sym.as_str() == symbol)
                .map(|(oid, _)| oid.clone())
                .collect()
        };
        let params = format!("symbol={symbol}");
        match self
            .signed_request(Method::DELETE, "/fapi/v1/allOpenOrders", &params)
            .await
        {
            Ok(_) => {
                let mut tracked = self.tracked_orders.write();
                for oid in &stale {
                    tracked.remove(oid);
                }
                stale.len()
            }
            Err(e) => {
                warn!(symbol, error = %e, "cancel_all_symbol_orders failed");
                0
            }
        }
    }

    async fn cancel_all_tracked_orders(&self) -> usize {
        let tracked: Vec<(String, String)> = {
            let map = self.tracked_orders.read();
            map.iter().map(|(o, s)| (o.clone(), s.clone())).collect()
        };
        let mut cancelled = 0;
        for (oid, symbol) in tracked {
            if self.cancel_order(&oid, &symbol).await {
                cancelled += 1;
            }
        }
        cancelled
    }

    async fn get_positions(&self) -> HashMap<String, PositionInfo> {
        let mut out = HashMap::new();
        let body = match self
            .signed_request(Method::GET, "/fapi/v2/positionRisk", "")
            .await
        {
            Ok((body, None)) => body,
            Ok((_, Some(code))) => {
                warn!(code, "positionRisk rejected");
                return out;
            }
            Err(e) => {
                warn!(error = %e, "get_positions failed");
                return out;
            }
        };

        let Some(entries) = body.as_array() else { return out };
        for entry in entries {
            let Some(raw) = entry["symbol"].as_str() else { continue };
            let amt = str_f64(&entry["positionAmt"]);
            if amt.abs() < 1e-12 {
                continue;
            }
            let entry_price = str_f64(&entry["entryPrice"]);
            let mark = str_f64(&entry["markPrice"]);
            out.insert(
                to_unified_symbol(raw),
                PositionInfo {
                    side: if amt < 0.0 { "short" } else { "long" }.to_string(),
                    contracts: amt.abs(),
                    notional: (amt.abs() * if mark > 0.0 { mark } else { entry_price }).abs(),
                    entry_price,
                    unrealized_pnl: str_f64(&entry["unRealizedProfit"]),
                },
            );
        }
        out
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<()> {
        let params = format!("symbol={symbol}&leverage={leverage}");
        self.signed_request(Method::POST, "/fapi/v1/leverage", &params)
            .await
            .map(|_| ())
    }

    fn set_order_update_handler(&self, handler: OrderUpdateHandler) {
        *self.order_update_handler.write() = Some(handler);
    }

    async fn start_user_stream(self: Arc<Self>) -> Result<()> {
        tokio::spawn(self.user_stream_loop());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_deterministic_hex() {
        let ex = BinanceFuturesExecutor::new("key", "secret", "");
        let sig = ex.sign("symbol=BTCUSDT&side=SELL");
        assert_eq!(sig.len(), 64);
        assert_eq!(sig, ex.sign("symbol=BTCUSDT&side=SELL"));
        assert_ne!(sig, ex.sign("symbol=BTCUSDT&side=BUY"));
    }

    #[test]
    fn str_f64_handles_both_encodings() {
        assert_eq!(str_f64(&serde_json::json!("1.5")), 1.5);
        assert_eq!(str_f64(&serde_json::json!(2.5)), 2.5);
        assert_eq!(str_f64(&serde_json::json!(null)), 0.0);
    }

    #[test]
    fn fill_parsed_from_order_response() {
        let ex = BinanceFuturesExecutor::new("key", "secret", "");
        let body = serde_json::json!({
            "orderId": 123456u64,
            "executedQty": "0.002",
            "avgPrice": "50000.0",
            "side": "BUY",
            "status": "FILLED",
        });
        let fill = ex.fill_from_order_response(&body, "BTCUSDT").unwrap();
        assert_eq!(fill.order_id, "123456");
        assert_eq!(fill.qty, 0.002);
        assert_eq!(fill.avg_price, 50_000.0);
        assert_eq!(fill.side, OrderSide::Buy);
        assert!((fill.cost - 100.0).abs() < 1e-9);
    }

    #[test]
    fn zero_fill_response_is_none() {
        let ex = BinanceFuturesExecutor::new("key", "secret", "");
        let body = serde_json::json!({ "orderId": 1u64, "executedQty": "0" });
        assert!(ex.fill_from_order_response(&body, "BTCUSDT").is_none());
    }
}
