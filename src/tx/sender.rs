//! Transaction sender: build against a fresh ref block, sign, submit

use super::signer::{RawTransaction, TransactionSigner};
use crate::chain::ChainManager;
use crate::error::RelayerResult;

use std::sync::Arc;
use tracing::info;

/// A transaction accepted by a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentTransaction {
    pub transaction_id: String,
    /// Hex encoding of the signed transaction as submitted
    pub raw_transaction: String,
    pub from: String,
}

pub struct TransactionSender {
    /// Chain manager
    chain_manager: Arc<ChainManager>,
    /// Per-chain signing keys
    signer: Arc<TransactionSigner>,
}

impl TransactionSender {
    pub fn new(chain_manager: Arc<ChainManager>, signer: Arc<TransactionSigner>) -> Self {
        Self {
            chain_manager,
            signer,
        }
    }

    /// Build, sign and submit a contract call. Nothing is retried here; the
    /// calling workflow retries on its next tick.
    pub async fn send(
        &self,
        chain_id: &str,
        contract_address: &str,
        method_name: &str,
        params: &[u8],
    ) -> RelayerResult<SentTransaction> {
        let client = self.chain_manager.client(chain_id)?;
        let from = self.signer.address(chain_id)?;

        let status = client.chain_status().await?;
        let raw = RawTransaction::new(from.clone(), contract_address, &status, method_name, params)?;
        let signed = self.signer.sign(chain_id, raw)?;
        let raw_transaction = signed.encode()?;

        let transaction_id = client.send_raw_transaction(&raw_transaction).await?;

        info!(
            "Transaction sent on chain {}: {} {}.{} (ref block {})",
            chain_id,
            transaction_id,
            contract_address,
            method_name,
            status.last_irreversible_block_height
        );
        crate::metrics::record_tx_submitted(chain_id);

        Ok(SentTransaction {
            transaction_id,
            raw_transaction,
            from,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{test_chain_config, MockChainClient};
    use crate::error::RelayerError;
    use crate::tx::signer::tests::{chain_status, test_signer};
    use crate::tx::signer::SignedTransaction;

    fn sender_with(client: MockChainClient, signer: TransactionSigner) -> TransactionSender {
        let chains = Arc::new(ChainManager::empty());
        chains.register(test_chain_config("AELF", &[]), Arc::new(client));
        TransactionSender::new(chains, Arc::new(signer))
    }

    #[tokio::test]
    async fn test_send_uses_last_irreversible_block() {
        let mut client = MockChainClient::new();
        client
            .expect_chain_status()
            .times(1)
            .returning(|| Ok(chain_status(4242)));
        client
            .expect_send_raw_transaction()
            .times(1)
            .withf(|raw| {
                let bytes = hex::decode(raw).unwrap();
                let signed: SignedTransaction = serde_json::from_slice(&bytes).unwrap();
                signed.raw.ref_block_number == 4242 && signed.raw.method_name == "BatchSettle"
            })
            .returning(|_| Ok("tx-1".to_string()));

        let sender = sender_with(client, test_signer(&["AELF"]));
        let sent = sender
            .send("AELF", "PointsContract", "BatchSettle", b"{}")
            .await
            .unwrap();

        assert_eq!(sent.transaction_id, "tx-1");
        assert!(!sent.raw_transaction.is_empty());
        assert!(sent.from.starts_with("0x"));
    }

    #[tokio::test]
    async fn test_missing_wallet_fails_before_any_rpc() {
        let client = MockChainClient::new();
        let sender = sender_with(client, TransactionSigner::new());

        let err = sender
            .send("AELF", "PointsContract", "BatchSettle", b"{}")
            .await
            .unwrap_err();
        assert!(matches!(err, RelayerError::Wallet(_)));
    }

    #[tokio::test]
    async fn test_unknown_chain_is_a_config_error() {
        let sender = sender_with(MockChainClient::new(), test_signer(&["AELF"]));
        let err = sender.send("tDVW", "C", "M", b"").await.unwrap_err();
        assert!(matches!(err, RelayerError::ChainNotFound { .. }));
    }
}
