//! On-chain surfaces consumed by the node.
//!
//! The node talks to three contracts, all resolved from the single configured
//! entry point: the request/response contract (`SomniaAgents`), the workload
//! registry (`AgentRegistry`), and the liveness contract (`Committee`).
//! Bindings are declared here with the `sol!` macro; every state-changing call
//! goes through the [`submitter::Submitter`], reads go through plain `eth_call`.
//!
//! # Submodules
//!
//! - [`submitter`] — Single-worker transaction queue that owns the wallet nonce.
//! - [`listener`] — WebSocket event subscription and request dispatch.
//! - [`heartbeat`] — Periodic liveness transactions.

pub mod heartbeat;
pub mod listener;
pub mod submitter;

use alloy_provider::{DynProvider, Provider};
use alloy_rpc_types_eth::{BlockId, TransactionRequest};
use alloy_sol_types::{Revert, SolError, sol};
use url::Url;

sol! {
    #[sol(rpc)]
    #[derive(Debug)]
    contract SomniaAgents {
        event RequestCreated(
            uint256 indexed requestId,
            uint256 indexed agentId,
            address requester,
            address[] subcommittee,
            bytes payload,
            address callback
        );

        function agentRegistry() external view returns (address);
        function committee() external view returns (address);
        function isRequestPending(uint256 requestId) external view returns (bool);
        function submitResponse(uint256 requestId, bytes calldata result, uint256 receipt, uint256 price) external;
    }

    #[sol(rpc)]
    #[derive(Debug)]
    contract AgentRegistry {
        struct Agent {
            uint256 agentId;
            address owner;
            string metadataUri;
            string containerImageUri;
            uint256 cost;
        }

        function getAgent(uint256 agentId) external view returns (Agent memory);
    }

    #[sol(rpc)]
    #[derive(Debug)]
    contract Committee {
        function heartbeatMembership() external;
        function leaveMembership() external;
        function isActive(address member) external view returns (bool);
    }
}

/// Derives the WebSocket subscription endpoint from the HTTP RPC URL.
///
/// `http(s)` becomes `ws(s)` and the path is replaced with `/ws`, matching the
/// gateway convention of the target chain.
pub fn ws_rpc_url(rpc_url: &Url) -> Result<Url, url::ParseError> {
    let scheme = match rpc_url.scheme() {
        "https" | "wss" => "wss",
        _ => "ws",
    };
    // set_scheme refuses cross-family changes like https->wss; rebuild instead.
    let authority = rpc_url
        .host_str()
        .map(|host| match rpc_url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        })
        .unwrap_or_default();
    Url::parse(&format!("{scheme}://{authority}/ws"))
}

/// Decodes standard `Error(string)` revert data (`0x08c379a0` selector).
///
/// Returns `None` for unknown selectors so callers can log the raw hex for
/// external lookup.
pub fn decode_revert_reason(data: &[u8]) -> Option<String> {
    Revert::abi_decode(data).ok().map(|revert| revert.reason)
}

/// Replays a reverted transaction as an `eth_call` against a specific block and
/// extracts the revert reason.
///
/// Unknown selectors come back hex-encoded. `None` means the replay did not
/// revert (state moved on) or the RPC returned no revert data.
pub async fn replay_revert_reason(
    provider: &DynProvider,
    tx: TransactionRequest,
    block: BlockId,
) -> Option<String> {
    match provider.call(tx).block(block).await {
        Ok(_) => None,
        Err(error) => {
            let payload = error.as_error_resp()?;
            let data = payload.as_revert_data()?;
            decode_revert_reason(&data).or_else(|| Some(format!("0x{}", hex::encode(&data))))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_url_from_https() {
        let rpc = Url::parse("https://rpc.somnia.network/api").unwrap();
        let ws = ws_rpc_url(&rpc).unwrap();
        assert_eq!(ws.as_str(), "wss://rpc.somnia.network/ws");
    }

    #[test]
    fn ws_url_from_http_with_port() {
        let rpc = Url::parse("http://127.0.0.1:8545").unwrap();
        let ws = ws_rpc_url(&rpc).unwrap();
        assert_eq!(ws.as_str(), "ws://127.0.0.1:8545/ws");
    }

    #[test]
    fn revert_reason_round_trips() {
        let revert = Revert {
            reason: "request not pending".to_string(),
        };
        let encoded = revert.abi_encode();
        assert_eq!(
            decode_revert_reason(&encoded).as_deref(),
            Some("request not pending")
        );
    }

    #[test]
    fn unknown_selector_is_not_decoded() {
        let data = [0xde, 0xad, 0xbe, 0xef, 0x00, 0x00];
        assert_eq!(decode_revert_reason(&data), None);
    }
}
