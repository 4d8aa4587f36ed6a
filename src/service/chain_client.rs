//! 链上 RPC 客户端
//!
//! 对外部 BSC 节点的薄封装：带重试的 JSON-RPC 调用。外部节点被视为
//! 不可靠数据源：会超时、会返回旧数据、响应可能重复，任何一次调用
//! 成功都不代表链上状态已终局，终局性判断只看确认数。

use std::time::Duration;

use async_trait::async_trait;
use ethers::types::U256;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{Result, SettlementError};

const MAX_RETRIES: u32 = 3;
const RETRY_DELAY_MS: u64 = 1000;

/// ERC20 Transfer(address,address,uint256) 事件主题
const TRANSFER_TOPIC: &str = "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";
/// balanceOf(address) 函数选择器
const BALANCE_OF_SELECTOR: &str = "0x70a08231";

/// 扫描到的入账转账
#[derive(Debug, Clone)]
pub struct IncomingTransfer {
    pub tx_hash: String,
    pub amount: Decimal,
    pub block_number: u64,
}

/// 链上访问接口
///
/// 监控与归集都只依赖这个 trait，测试用内存实现替换
#[async_trait]
pub trait ChainRpc: Send + Sync {
    async fn latest_block(&self) -> Result<u64>;

    /// 指定区块范围内打到 address 的代币转账
    async fn token_transfers_to(
        &self,
        address: &str,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<IncomingTransfer>>;

    /// 地址当前代币余额（最小单位）
    async fn token_balance(&self, address: &str) -> Result<U256>;

    async fn transaction_count(&self, address: &str) -> Result<u64>;

    async fn gas_price(&self) -> Result<u64>;

    /// 广播已签名交易，返回交易哈希
    async fn broadcast(&self, raw_tx: &str) -> Result<String>;

    /// 交易当前确认数；未上链（或被重组移出）返回 0
    async fn confirmations(&self, tx_hash: &str) -> Result<u64>;
}

pub struct JsonRpcChainClient {
    http: reqwest::Client,
    rpc_url: String,
    token_contract: String,
    token_decimals: u32,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    /// 正常响应；eth_getTransactionReceipt 查不到时是合法的 null
    #[serde(default)]
    result: Value,
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

impl JsonRpcChainClient {
    pub fn new(rpc_url: &str, token_contract: &str, token_decimals: u32) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            http,
            rpc_url: rpc_url.to_string(),
            token_contract: token_contract.to_lowercase(),
            token_decimals,
        }
    }

    /// 发起一次 JSON-RPC 调用，传输层失败时固定间隔重试
    ///
    /// 节点明确返回的协议错误不重试：请求已被理解，重发不会有不同结果
    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        let mut last_error = String::new();

        for attempt in 1..=MAX_RETRIES {
            match self.http.post(&self.rpc_url).json(&body).send().await {
                Ok(response) => match response.json::<RpcResponse>().await {
                    Ok(rpc) => {
                        if let Some(err) = rpc.error {
                            return Err(SettlementError::ChainUnavailable(format!(
                                "{method} rejected by node (code {}): {}",
                                err.code, err.message
                            )));
                        }
                        return Ok(rpc.result);
                    }
                    Err(e) => {
                        last_error = format!("{method}: malformed response: {e}");
                    }
                },
                Err(e) => {
                    last_error = format!("{method}: transport error: {e}");
                }
            }

            tracing::warn!(
                method = method,
                attempt = attempt,
                error = %last_error,
                "Chain RPC call failed, will retry"
            );

            if attempt < MAX_RETRIES {
                tokio::time::sleep(Duration::from_millis(RETRY_DELAY_MS * attempt as u64)).await;
            }
        }

        Err(SettlementError::ChainUnavailable(last_error))
    }

    async fn call_for_str(&self, method: &str, params: Value) -> Result<String> {
        let result = self.call(method, params).await?;
        result
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| {
                SettlementError::ChainUnavailable(format!("{method}: result is not a string"))
            })
    }
}

fn parse_hex_u64(s: &str) -> Result<u64> {
    u64::from_str_radix(s.trim_start_matches("0x"), 16)
        .map_err(|e| SettlementError::ChainUnavailable(format!("invalid hex quantity {s:?}: {e}")))
}

fn parse_hex_u256(s: &str) -> Result<U256> {
    U256::from_str_radix(s.trim_start_matches("0x"), 16)
        .map_err(|e| SettlementError::ChainUnavailable(format!("invalid hex quantity {s:?}: {e}")))
}

/// 地址补齐到 32 字节作为日志过滤主题
fn address_topic(address: &str) -> String {
    format!(
        "0x000000000000000000000000{}",
        address.trim_start_matches("0x").to_lowercase()
    )
}

/// 链上最小单位金额换算为十进制代币数量
pub fn base_units_to_decimal(amount: U256, decimals: u32) -> Result<Decimal> {
    let mut value = Decimal::from_str_exact(&amount.to_string()).map_err(|e| {
        SettlementError::ChainUnavailable(format!("token amount {amount} out of range: {e}"))
    })?;
    value.set_scale(decimals).map_err(|e| {
        SettlementError::ChainUnavailable(format!("token scale {decimals} invalid: {e}"))
    })?;
    Ok(value.normalize())
}

#[async_trait]
impl ChainRpc for JsonRpcChainClient {
    async fn latest_block(&self) -> Result<u64> {
        let hex = self.call_for_str("eth_blockNumber", json!([])).await?;
        parse_hex_u64(&hex)
    }

    async fn token_transfers_to(
        &self,
        address: &str,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<IncomingTransfer>> {
        let filter = json!([{
            "fromBlock": format!("0x{from_block:x}"),
            "toBlock": format!("0x{to_block:x}"),
            "address": self.token_contract,
            "topics": [TRANSFER_TOPIC, Value::Null, address_topic(address)],
        }]);

        let logs = self.call("eth_getLogs", filter).await?;
        let logs = logs.as_array().ok_or_else(|| {
            SettlementError::ChainUnavailable("eth_getLogs: result is not an array".into())
        })?;

        let mut transfers = Vec::with_capacity(logs.len());
        for log in logs {
            // 重组移除的日志不处理
            if log.get("removed").and_then(Value::as_bool) == Some(true) {
                continue;
            }
            let tx_hash = log
                .get("transactionHash")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    SettlementError::ChainUnavailable("eth_getLogs: log without txHash".into())
                })?
                .to_lowercase();
            let block_number = parse_hex_u64(
                log.get("blockNumber").and_then(Value::as_str).ok_or_else(|| {
                    SettlementError::ChainUnavailable("eth_getLogs: log without blockNumber".into())
                })?,
            )?;
            let raw_amount = parse_hex_u256(
                log.get("data").and_then(Value::as_str).ok_or_else(|| {
                    SettlementError::ChainUnavailable("eth_getLogs: log without data".into())
                })?,
            )?;

            transfers.push(IncomingTransfer {
                tx_hash,
                amount: base_units_to_decimal(raw_amount, self.token_decimals)?,
                block_number,
            });
        }

        Ok(transfers)
    }

    async fn token_balance(&self, address: &str) -> Result<U256> {
        let data = format!(
            "{}000000000000000000000000{}",
            BALANCE_OF_SELECTOR,
            address.trim_start_matches("0x").to_lowercase()
        );
        let params = json!([{ "to": self.token_contract, "data": data }, "latest"]);
        let hex = self.call_for_str("eth_call", params).await?;
        parse_hex_u256(&hex)
    }

    async fn transaction_count(&self, address: &str) -> Result<u64> {
        let hex = self
            .call_for_str("eth_getTransactionCount", json!([address, "pending"]))
            .await?;
        parse_hex_u64(&hex)
    }

    async fn gas_price(&self) -> Result<u64> {
        let hex = self.call_for_str("eth_gasPrice", json!([])).await?;
        parse_hex_u64(&hex)
    }

    async fn broadcast(&self, raw_tx: &str) -> Result<String> {
        self.call_for_str("eth_sendRawTransaction", json!([raw_tx]))
            .await
    }

    async fn confirmations(&self, tx_hash: &str) -> Result<u64> {
        let receipt = self
            .call("eth_getTransactionReceipt", json!([tx_hash]))
            .await?;
        if receipt.is_null() {
            return Ok(0);
        }

        let block_number = match receipt.get("blockNumber").and_then(Value::as_str) {
            Some(hex) => parse_hex_u64(hex)?,
            // 已知但未入块
            None => return Ok(0),
        };

        let latest = self.latest_block().await?;
        Ok(latest.saturating_sub(block_number) + 1)
    }
}
