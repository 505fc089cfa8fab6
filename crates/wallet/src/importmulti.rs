//! JSON request surface for `importmulti`.

use std::fmt;

use fluxd_storage::KeyValueStore;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::import::{ImportError, ImportItem, ImportKind};
use crate::node::WalletNode;
use crate::wallet::WalletError;

pub const RPC_MISC_ERROR: i32 = -1;
pub const RPC_WALLET_ERROR: i32 = -4;
pub const RPC_INVALID_ADDRESS_OR_KEY: i32 = -5;
pub const RPC_INVALID_PARAMETER: i32 = -8;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

impl RpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn usage() -> Self {
        Self::new(RPC_MISC_ERROR, help_text())
    }

    pub fn to_json(&self) -> Value {
        json!({ "code": self.code, "message": self.message })
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "error code: {}\nerror message:\n{}", self.code, self.message)
    }
}

impl std::error::Error for RpcError {}

impl From<ImportError> for RpcError {
    fn from(err: ImportError) -> Self {
        let code = match &err {
            ImportError::InvalidArgument(_) | ImportError::OutOfRange(_) => RPC_INVALID_PARAMETER,
            ImportError::InvalidCredential(_) => RPC_INVALID_ADDRESS_OR_KEY,
            ImportError::ImportFailed { .. } => RPC_MISC_ERROR,
            ImportError::Wallet(_) | ImportError::Chain(_) | ImportError::Rescan(_) => {
                RPC_WALLET_ERROR
            }
        };
        RpcError::new(code, err.to_string())
    }
}

impl From<WalletError> for RpcError {
    fn from(err: WalletError) -> Self {
        RpcError::new(RPC_WALLET_ERROR, err.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct RawImportItem {
    #[serde(rename = "type")]
    kind: Option<String>,
    value: Option<String>,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    timestamp: Option<Value>,
    #[serde(default)]
    p2sh: Option<bool>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ImportRequest {
    pub items: Vec<ImportItem>,
    pub rescan: bool,
}

/// Parses positional params `[items]` or `[items, rescan]`.
///
/// Every item is validated here, so a malformed item fails before the wallet
/// is touched.
pub fn parse_request(params: &Value) -> Result<ImportRequest, RpcError> {
    let params = match params {
        Value::Array(params) if (1..=2).contains(&params.len()) => params,
        _ => return Err(RpcError::usage()),
    };
    let Value::Array(raw_items) = &params[0] else {
        return Err(RpcError::usage());
    };
    let rescan = match params.get(1) {
        None | Some(Value::Null) => true,
        Some(Value::Bool(rescan)) => *rescan,
        Some(Value::Object(options)) => match options.get("rescan") {
            None => true,
            Some(Value::Bool(rescan)) => *rescan,
            Some(_) => return Err(RpcError::usage()),
        },
        Some(_) => return Err(RpcError::usage()),
    };

    let items = raw_items
        .iter()
        .map(parse_item)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ImportRequest { items, rescan })
}

fn parse_item(raw: &Value) -> Result<ImportItem, RpcError> {
    let raw: RawImportItem = serde_json::from_value(raw.clone())
        .map_err(|err| RpcError::new(RPC_INVALID_PARAMETER, format!("Invalid import item: {err}")))?;
    let (Some(kind), Some(value)) = (raw.kind, raw.value) else {
        return Err(RpcError::new(
            RPC_INVALID_PARAMETER,
            "Missing required fields",
        ));
    };
    let kind = ImportKind::parse(&kind).ok_or_else(|| {
        RpcError::new(
            RPC_INVALID_PARAMETER,
            format!("Invalid import type '{kind}'"),
        )
    })?;
    let timestamp = match raw.timestamp {
        None | Some(Value::Null) => None,
        Some(raw) => Some(parse_timestamp(&raw).ok_or_else(|| {
            RpcError::new(RPC_INVALID_PARAMETER, format!("Invalid timestamp {raw}"))
        })?),
    };
    Ok(ImportItem {
        kind,
        value,
        label: raw.label.unwrap_or_default(),
        timestamp,
        treat_as_script: raw.p2sh.unwrap_or(false),
    })
}

fn parse_timestamp(raw: &Value) -> Option<i64> {
    match raw {
        Value::Number(number) => number.as_i64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

/// Runs `importmulti` against `node`. Returns JSON `null` on success.
pub fn handle_importmulti<S: KeyValueStore>(
    node: &WalletNode<S>,
    params: &Value,
) -> Result<Value, RpcError> {
    let request = parse_request(params)?;
    node.import_multi(&request.items, request.rescan)?;
    Ok(Value::Null)
}

pub fn help_text() -> String {
    [
        "importmulti [{\"type\":\"privkey\"|\"pubkey\"|\"address\"|\"script\",\"value\":\"...\",\"label\":\"...\",\"timestamp\":n,\"p2sh\":bool},...] ( rescan )",
        "",
        "Import several private keys, public keys, addresses or scripts in one call.",
        "The wallet is locked for the whole call, including the optional rescan.",
        "",
        "Arguments:",
        "1. requests   (array, required) import items",
        "     type       (string, required) privkey, pubkey, address or script",
        "     value      (string, required) WIF key, hex public key, address or hex script",
        "     label      (string, optional, default \"\") address book label",
        "     timestamp  (number, optional) creation time; the earliest one bounds the rescan",
        "     p2sh       (bool, optional, default false) treat a hex script as a P2SH redeem script",
        "2. rescan     (bool or {\"rescan\":bool}, optional, default true) rescan the chain afterwards",
        "",
        "Result: null",
        "",
        "Examples:",
        "  fluxd-wallet importmulti '[{\"type\":\"address\",\"value\":\"t1...\"}]' false",
    ]
    .join("\n")
}
