//! EVM JSON-RPC implementation of [`ChainClient`]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;

use super::abi::{self, Word};
use super::types::{RpcBlock, RpcLog, RpcResponse};
use super::{
    ChainClient, ChainEvent, EventKind, EventMeta, OnChainContribution, OnChainInstallment,
    OnChainLoan,
};
use crate::error::{ReconcileError, ReconcileResult};

const ZERO_ADDRESS: &str = "0x0000000000000000000000000000000000000000";

pub struct JsonRpcChainClient {
    rpc_url: String,
    contract_address: String,
    client: Client,
}

impl JsonRpcChainClient {
    pub fn new(rpc_url: String, contract_address: String, timeout: Duration) -> Self {
        Self {
            rpc_url,
            contract_address: contract_address.to_lowercase(),
            client: Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_else(|_| Client::new()),
        }
    }

    async fn call_rpc<T: DeserializeOwned>(&self, method: &str, params: Value) -> ReconcileResult<T> {
        let payload = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        let resp = self
            .client
            .post(&self.rpc_url)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?
            .json::<RpcResponse<T>>()
            .await?;

        if let Some(err) = resp.error {
            return Err(ReconcileError::Rpc(format!(
                "{} failed ({}): {}",
                method, err.code, err.message
            )));
        }

        resp.result
            .ok_or_else(|| ReconcileError::Rpc(format!("{} returned no result", method)))
    }

    async fn eth_call(&self, data: String) -> ReconcileResult<Vec<u8>> {
        let raw: String = self
            .call_rpc(
                "eth_call",
                json!([{ "to": self.contract_address, "data": data }, "latest"]),
            )
            .await?;
        abi::decode_hex(&raw)
    }

    async fn block_timestamp(&self, block_number: u64) -> ReconcileResult<DateTime<Utc>> {
        // A block the node has not seen yet comes back as null, which surfaces
        // as a transient "no result" error
        let block: RpcBlock = self
            .call_rpc(
                "eth_getBlockByNumber",
                json!([abi::to_quantity(block_number), false]),
            )
            .await?;

        let mut word: Word = [0u8; 32];
        word[24..].copy_from_slice(&abi::parse_quantity(&block.timestamp)?.to_be_bytes());
        abi::as_timestamp(&word)
    }

    fn loan_arg(loan_id: &str) -> ReconcileResult<Word> {
        abi::word_from_hex(loan_id)
    }
}

#[async_trait]
impl ChainClient for JsonRpcChainClient {
    async fn block_number(&self) -> ReconcileResult<u64> {
        let raw: String = self.call_rpc("eth_blockNumber", json!([])).await?;
        abi::parse_quantity(&raw)
    }

    async fn events(
        &self,
        kind: EventKind,
        from_block: u64,
        to_block: u64,
    ) -> ReconcileResult<Vec<ChainEvent>> {
        let logs: Vec<RpcLog> = self
            .call_rpc(
                "eth_getLogs",
                json!([{
                    "address": self.contract_address,
                    "fromBlock": abi::to_quantity(from_block),
                    "toBlock": abi::to_quantity(to_block),
                    "topics": [kind.topic()],
                }]),
            )
            .await?;

        let mut timestamps: HashMap<u64, DateTime<Utc>> = HashMap::new();
        let mut events = Vec::with_capacity(logs.len());

        for log in logs.iter().filter(|l| !l.removed) {
            let block_number = abi::parse_quantity(&log.block_number)?;
            let timestamp = match timestamps.get(&block_number) {
                Some(ts) => *ts,
                None => {
                    let ts = self.block_timestamp(block_number).await?;
                    timestamps.insert(block_number, ts);
                    ts
                }
            };

            let meta = EventMeta {
                tx_hash: log.transaction_hash.to_lowercase(),
                log_index: abi::parse_quantity(&log.log_index)?,
                block_number,
                timestamp,
            };

            match abi::decode_log(kind, &log.topics, &log.data, meta) {
                Ok(event) => events.push(event),
                Err(e) => tracing::warn!(
                    event = kind.name(),
                    tx_hash = %log.transaction_hash,
                    error = %e,
                    "Skipping undecodable log"
                ),
            }
        }

        events.sort_by_key(|e| (e.meta.block_number, e.meta.log_index));
        tracing::debug!(
            event = kind.name(),
            from_block,
            to_block,
            count = events.len(),
            "Fetched contract events"
        );
        Ok(events)
    }

    async fn loan(&self, loan_id: &str) -> ReconcileResult<OnChainLoan> {
        let data = abi::encode_call(abi::LOANS_SELECTOR, &[Self::loan_arg(loan_id)?]);
        let loan = abi::decode_loan(&self.eth_call(data).await?)?;
        // Unknown ids read back as a zeroed struct
        if loan.borrower == ZERO_ADDRESS {
            return Err(ReconcileError::not_found("On-chain loan", loan_id));
        }
        Ok(loan)
    }

    async fn installment_schedule(
        &self,
        loan_id: &str,
    ) -> ReconcileResult<Vec<OnChainInstallment>> {
        let data = abi::encode_call(
            abi::INSTALLMENT_SCHEDULE_SELECTOR,
            &[Self::loan_arg(loan_id)?],
        );
        abi::decode_installments(&self.eth_call(data).await?)
    }

    async fn contributions(&self, loan_id: &str) -> ReconcileResult<Vec<OnChainContribution>> {
        let data = abi::encode_call(abi::CONTRIBUTIONS_SELECTOR, &[Self::loan_arg(loan_id)?]);
        abi::decode_contributions(&self.eth_call(data).await?)
    }

    async fn price(&self) -> ReconcileResult<Decimal> {
        let data = abi::encode_call(abi::GET_PRICE_SELECTOR, &[]);
        abi::decode_price(&self.eth_call(data).await?)
    }
}
