//! Turns a [`LockEvent`] into a signed `unlockTokens` transaction for the destination chain.

use crate::{
    abi::unlockTokensCall,
    connection::ChainConnection,
    error::ProcessError,
    gas_oracle::GasPriceOracle,
    types::{LockEvent, UnlockAction},
};
use alloy_consensus::{SignableTransaction, TxEnvelope, TxLegacy};
use alloy_eips::eip2718::Encodable2718;
use alloy_network::TxSignerSync;
use alloy_primitives::{Address, Bytes, TxKind, U256};
use alloy_signer_local::PrivateKeySigner;
use alloy_sol_types::SolCall;
use std::{fmt, sync::Arc};
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// Default gas limit ceiling for unlock transactions
pub const DEFAULT_UNLOCK_GAS_LIMIT: u64 = 200_000;

/// Maps the source account of a lock to the recipient on the destination chain.
pub type AddressMapper = Arc<dyn Fn(Address) -> Address + Send + Sync>;

/// Mapper for symmetric bridges: the locker receives the unlocked tokens.
pub fn identity_mapper() -> AddressMapper {
    Arc::new(|from| from)
}

/// Builds and signs destination-chain unlock actions
pub struct ActionProcessor {
    destination: Arc<ChainConnection>,
    contract: Address,
    signer: PrivateKeySigner,
    oracle: Arc<GasPriceOracle>,
    gas_limit: u64,
    address_mapper: AddressMapper,
    chain_id: OnceCell<u64>,
}

impl fmt::Debug for ActionProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionProcessor")
            .field("destination", &self.destination.name())
            .field("contract", &self.contract)
            .field("sender", &self.signer.address())
            .field("gas_limit", &self.gas_limit)
            .field("chain_id", &self.chain_id.get())
            .finish_non_exhaustive()
    }
}

impl ActionProcessor {
    /// Creates a processor with the identity address mapping and the default gas limit.
    pub fn new(
        destination: Arc<ChainConnection>,
        contract: Address,
        signer: PrivateKeySigner,
        oracle: Arc<GasPriceOracle>,
    ) -> Self {
        Self {
            destination,
            contract,
            signer,
            oracle,
            gas_limit: DEFAULT_UNLOCK_GAS_LIMIT,
            address_mapper: identity_mapper(),
            chain_id: OnceCell::new(),
        }
    }

    /// Sets the gas limit ceiling.
    pub const fn with_gas_limit(mut self, gas_limit: u64) -> Self {
        self.gas_limit = gas_limit;
        self
    }

    /// Replaces the source → destination address mapping.
    pub fn with_address_mapper(mut self, mapper: AddressMapper) -> Self {
        self.address_mapper = mapper;
        self
    }

    /// Account the unlock transactions are sent from
    pub fn sender(&self) -> Address {
        self.signer.address()
    }

    /// Builds and signs the unlock transaction for `event`. Does not broadcast it.
    pub async fn process(&self, event: &LockEvent) -> Result<UnlockAction, ProcessError> {
        let contract = self
            .destination
            .bound_contract(self.contract)
            .map_err(|e| ProcessError::DestinationUnavailable(e.to_string()))?;

        let recipient = (self.address_mapper)(event.from);
        info!(
            target: "relayer::processor",
            nonce = %event.nonce,
            amount = %event.amount,
            %recipient,
            chain = %self.destination.name(),
            "Processing lock event"
        );

        let quote = self.oracle.quote().await;
        let sender = self.signer.address();

        let sequence = self.destination.transaction_count(sender).await.map_err(|e| {
            ProcessError::BuildFailed(format!("sequence number lookup for {sender} failed: {e}"))
        })?;

        let chain_id = *self
            .chain_id
            .get_or_try_init(|| self.destination.chain_id())
            .await
            .map_err(|e| ProcessError::BuildFailed(format!("chain id lookup failed: {e}")))?;

        let input =
            unlockTokensCall { recipient, amount: event.amount, sourceNonce: event.nonce }.abi_encode();

        let mut tx = TxLegacy {
            chain_id: Some(chain_id),
            nonce: sequence,
            gas_price: quote.price,
            gas_limit: self.gas_limit,
            to: TxKind::Call(contract.address()),
            value: U256::ZERO,
            input: input.into(),
        };

        let signature = self
            .signer
            .sign_transaction_sync(&mut tx)
            .map_err(|e| ProcessError::BuildFailed(format!("signing failed: {e}")))?;

        let signed = tx.into_signed(signature);
        let tx_hash = *signed.hash();
        let raw = Bytes::from(TxEnvelope::Legacy(signed).encoded_2718());

        debug!(
            target: "relayer::processor",
            %tx_hash,
            sequence,
            gas_price = quote.price,
            gas_source = %quote.source,
            "Signed unlock transaction"
        );

        Ok(UnlockAction {
            recipient,
            amount: event.amount,
            source_nonce: event.nonce,
            source_tx: event.transaction_hash,
            sender,
            sequence,
            chain_id,
            gas_price: quote.price,
            gas_source: quote.source,
            gas_limit: self.gas_limit,
            signature,
            tx_hash,
            raw,
        })
    }
}
