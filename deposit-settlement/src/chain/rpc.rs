// Copyright (c) 2024 Botho Foundation

//! JSON-RPC 2.0 chain client.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use base64::Engine;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use super::{AccountRef, ChainClient, ParsedTransaction, SignatureInfo};
use crate::error::{SettlementError, SettlementResult};

/// Commitment level used for every read.
const COMMITMENT: &str = "confirmed";

/// JSON-RPC request ID counter
static REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// JSON-RPC 2.0 request
#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    method: &'a str,
    params: Value,
    id: u64,
}

/// JSON-RPC 2.0 response
#[derive(Debug, Deserialize)]
struct JsonRpcResponse<T> {
    result: Option<T>,
    error: Option<JsonRpcError>,
}

/// JSON-RPC error
#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RpcSignature {
    signature: String,
    slot: u64,
    #[serde(default)]
    err: Option<Value>,
    #[serde(default, rename = "blockTime")]
    block_time: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct WithContext<T> {
    value: T,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlockhashValue {
    blockhash: String,
}

/// Chain client talking to a single RPC endpoint.
pub struct RpcChainClient {
    client: reqwest::Client,
    endpoint: String,
}

impl RpcChainClient {
    /// Create a client with the given request timeout.
    pub fn new(endpoint: &str, timeout: Duration) -> SettlementResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
        })
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> SettlementResult<T> {
        self.call_optional(method, params)
            .await?
            .ok_or_else(|| SettlementError::Chain(format!("{} returned no result", method)))
    }

    /// Like `call`, but a null result is `Ok(None)`.
    async fn call_optional<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> SettlementResult<Option<T>> {
        let id = REQUEST_ID.fetch_add(1, Ordering::SeqCst);
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            method,
            params,
            id,
        };

        let response = self.client.post(&self.endpoint).json(&request).send().await?;
        if !response.status().is_success() {
            return Err(SettlementError::Chain(format!(
                "{} returned HTTP {}",
                method,
                response.status()
            )));
        }

        let body: JsonRpcResponse<T> = response.json().await?;
        if let Some(error) = body.error {
            return Err(SettlementError::Chain(format!(
                "{} failed with RPC error {}: {}",
                method, error.code, error.message
            )));
        }

        Ok(body.result)
    }
}

#[async_trait]
impl ChainClient for RpcChainClient {
    async fn current_slot(&self) -> SettlementResult<u64> {
        self.call("getSlot", json!([{ "commitment": COMMITMENT }]))
            .await
    }

    async fn signatures_for_address(
        &self,
        address: &str,
        limit: usize,
        before: Option<&str>,
    ) -> SettlementResult<Vec<SignatureInfo>> {
        let mut options = json!({ "limit": limit, "commitment": COMMITMENT });
        if let Some(before) = before {
            options["before"] = json!(before);
        }
        let entries: Vec<RpcSignature> = self
            .call("getSignaturesForAddress", json!([address, options]))
            .await?;

        Ok(entries
            .into_iter()
            .map(|e| SignatureInfo {
                signature: e.signature,
                slot: e.slot,
                failed: e.err.map(|v| !v.is_null()).unwrap_or(false),
                block_time: e.block_time,
            })
            .collect())
    }

    async fn transaction(&self, signature: &str) -> SettlementResult<Option<ParsedTransaction>> {
        let value: Option<Value> = self
            .call_optional(
                "getTransaction",
                json!([signature, {
                    "encoding": "jsonParsed",
                    "commitment": COMMITMENT,
                    "maxSupportedTransactionVersion": 0
                }]),
            )
            .await?;

        let Some(value) = value else {
            debug!("Transaction {} not yet available", signature);
            return Ok(None);
        };

        parse_transaction(signature, &value)
            .map(Some)
            .ok_or_else(|| {
                SettlementError::Chain(format!("malformed transaction payload for {}", signature))
            })
    }

    async fn balance(&self, address: &str) -> SettlementResult<u64> {
        let balance: WithContext<u64> = self
            .call("getBalance", json!([address, { "commitment": COMMITMENT }]))
            .await?;
        Ok(balance.value)
    }

    async fn latest_blockhash(&self) -> SettlementResult<String> {
        let blockhash: WithContext<BlockhashValue> = self
            .call("getLatestBlockhash", json!([{ "commitment": COMMITMENT }]))
            .await?;
        Ok(blockhash.value.blockhash)
    }

    async fn send_transaction(&self, wire: &[u8]) -> SettlementResult<String> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(wire);
        self.call(
            "sendTransaction",
            json!([encoded, { "encoding": "base64", "preflightCommitment": COMMITMENT }]),
        )
        .await
    }
}

/// Extract the fields the scanner needs from a `jsonParsed` transaction.
pub(crate) fn parse_transaction(signature: &str, value: &Value) -> Option<ParsedTransaction> {
    let slot = value.get("slot")?.as_u64()?;
    let meta = value.get("meta")?;
    let failed = meta.get("err").map(|e| !e.is_null()).unwrap_or(false);

    let balances = |field: &str| -> Option<Vec<u64>> {
        meta.get(field)?
            .as_array()?
            .iter()
            .map(|b| b.as_u64())
            .collect()
    };
    let pre_balances = balances("preBalances")?;
    let post_balances = balances("postBalances")?;

    let message = value.get("transaction")?.get("message")?;
    let account_keys = message
        .get("accountKeys")?
        .as_array()?
        .iter()
        .map(|k| match k {
            // jsonParsed form
            Value::Object(_) => Some(AccountRef {
                pubkey: k.get("pubkey")?.as_str()?.to_string(),
                signer: k.get("signer").and_then(Value::as_bool).unwrap_or(false),
            }),
            // plain json form
            Value::String(s) => Some(AccountRef {
                pubkey: s.clone(),
                signer: false,
            }),
            _ => None,
        })
        .collect::<Option<Vec<_>>>()?;

    if pre_balances.len() != account_keys.len() || post_balances.len() != account_keys.len() {
        return None;
    }

    let memos = message
        .get("instructions")
        .and_then(Value::as_array)
        .map(|ixs| {
            ixs.iter()
                .filter(|ix| {
                    ix.get("program").and_then(Value::as_str) == Some("spl-memo")
                })
                .filter_map(|ix| ix.get("parsed").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    Some(ParsedTransaction {
        signature: signature.to_string(),
        slot,
        failed,
        account_keys,
        pre_balances,
        post_balances,
        memos,
    })
}
