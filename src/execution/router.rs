//! Router swap transaction building
//!
//! Encodes `exactInputSingle` calls against the V3 router and assembles
//! signed EIP-1559 transactions from a gas plan and reserved nonce.

use std::sync::Arc;

use chrono::Utc;
use ethers::abi::Token;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, Eip1559TransactionRequest, U256};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::chain::ChainConfig;
use crate::error::{Error, Result};

use super::gas::GasPlan;

/// exactInputSingle((address,address,uint24,address,uint256,uint256,uint256,uint160))
pub const SELECTOR_EXACT_INPUT_SINGLE: [u8; 4] = [0x41, 0x4b, 0xf3, 0x89];

/// Swap deadline window
const DEADLINE_SECS: i64 = 300;

/// ABI-encode an `exactInputSingle` call.
pub fn encode_exact_input_single(
    token_in: Address,
    token_out: Address,
    fee: u32,
    recipient: Address,
    deadline: U256,
    amount_in: U256,
    amount_out_minimum: U256,
) -> Bytes {
    let params = Token::Tuple(vec![
        Token::Address(token_in),
        Token::Address(token_out),
        Token::Uint(U256::from(fee)),
        Token::Address(recipient),
        Token::Uint(deadline),
        Token::Uint(amount_in),
        Token::Uint(amount_out_minimum),
        Token::Uint(U256::zero()), // sqrtPriceLimitX96: no limit
    ]);

    let mut calldata = SELECTOR_EXACT_INPUT_SINGLE.to_vec();
    calldata.extend(ethers::abi::encode(&[params]));
    Bytes::from(calldata)
}

/// Minimum acceptable output for a slippage tolerance.
pub fn min_amount_out(expected_out: U256, max_slippage_percent: Decimal) -> U256 {
    let slippage_bps = (max_slippage_percent * Decimal::from(100))
        .to_u64()
        .unwrap_or(100)
        .min(10_000);
    expected_out * U256::from(10_000 - slippage_bps) / U256::from(10_000u64)
}

pub struct SwapBuilder {
    chain: Arc<ChainConfig>,
}

impl SwapBuilder {
    pub fn new(chain: Arc<ChainConfig>) -> Self {
        Self { chain }
    }

    /// Build the unsigned buy transaction: WETH in, target token out.
    pub fn build_buy(
        &self,
        token_out: Address,
        fee: u32,
        recipient: Address,
        amount_in_wei: U256,
        expected_out: U256,
        max_slippage_percent: Decimal,
        gas: &GasPlan,
        nonce: u64,
    ) -> Eip1559TransactionRequest {
        let deadline = U256::from((Utc::now().timestamp() + DEADLINE_SECS) as u64);
        let calldata = encode_exact_input_single(
            self.chain.weth,
            token_out,
            fee,
            recipient,
            deadline,
            amount_in_wei,
            min_amount_out(expected_out, max_slippage_percent),
        );

        Eip1559TransactionRequest::new()
            .chain_id(self.chain.chain_id)
            .to(self.chain.router_v3)
            .value(amount_in_wei)
            .data(calldata)
            .nonce(nonce)
            .gas(gas.gas_limit)
            .max_fee_per_gas(gas.max_fee_per_gas)
            .max_priority_fee_per_gas(gas.max_priority_fee_per_gas)
    }

    /// Build the unsigned sell transaction: token in, WETH out.
    pub fn build_sell(
        &self,
        token_in: Address,
        fee: u32,
        recipient: Address,
        amount_in: U256,
        expected_out: U256,
        max_slippage_percent: Decimal,
        gas: &GasPlan,
        nonce: u64,
    ) -> Eip1559TransactionRequest {
        let deadline = U256::from((Utc::now().timestamp() + DEADLINE_SECS) as u64);
        let calldata = encode_exact_input_single(
            token_in,
            self.chain.weth,
            fee,
            recipient,
            deadline,
            amount_in,
            min_amount_out(expected_out, max_slippage_percent),
        );

        Eip1559TransactionRequest::new()
            .chain_id(self.chain.chain_id)
            .to(self.chain.router_v3)
            .data(calldata)
            .nonce(nonce)
            .gas(gas.gas_limit)
            .max_fee_per_gas(gas.max_fee_per_gas)
            .max_priority_fee_per_gas(gas.max_priority_fee_per_gas)
    }

    /// Sign a built transaction into raw broadcastable bytes.
    pub fn sign(&self, wallet: &LocalWallet, tx: Eip1559TransactionRequest) -> Result<Bytes> {
        let typed: TypedTransaction = tx.into();
        let signature = wallet
            .sign_transaction_sync(&typed)
            .map_err(|e| Error::TransactionBuild(format!("signing failed: {e}")))?;
        Ok(typed.rlp_signed(&signature))
    }
}

/// Parse a hex signer key into a wallet bound to a chain id.
pub fn wallet_from_key(key: &str, chain_id: u64) -> Result<LocalWallet> {
    let key = key.trim_start_matches("0x");
    key.parse::<LocalWallet>()
        .map(|w| w.with_chain_id(chain_id))
        .map_err(|e| Error::InvalidSignerKey(e.to_string()))
}
