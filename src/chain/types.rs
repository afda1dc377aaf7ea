use serde::{Deserialize, Serialize};

/// JSON-RPC envelope
#[derive(Debug, Deserialize)]
pub struct RpcResponse<T> {
    pub result: Option<T>,
    pub error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RpcErrorBody {
    pub code: i64,
    pub message: String,
}

/// Raw EVM log from `eth_getLogs`
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RpcLog {
    pub address: String,
    pub topics: Vec<String>, // hex words, topic0 first
    pub data: String,
    pub block_number: String,
    pub transaction_hash: String,
    pub log_index: String,
    #[serde(default)]
    pub removed: bool,
}

/// Subset of `eth_getBlockByNumber` we read
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RpcBlock {
    pub number: String,
    pub timestamp: String,
}
