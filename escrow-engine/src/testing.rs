//! Test support: entity fixtures and a re-export of the in-process ledger.
//!
//! Scenario tests (and local development against no real chain) wire a
//! [`MockChain`] plus a [`MemoryStore`](crate::store::MemoryStore) seeded
//! with these fixtures.

pub use escrow_chain::testing::MockChain;

pub mod fixtures {
    use std::time::Duration;

    use escrow_core::{
        action::NextAction,
        amount::{Amount, AssetAmount, Funds},
        ids::{
            Address, BlockchainIdentifier, PaymentSourceId, RequestId,
            WalletId,
        },
        model::{
            EscrowRequest, HotWallet, PaymentSource, RequestTimes, WalletBase,
        },
        network::Network,
        rng::SysRng,
        seal::SealKey,
        state::{RequestSide, WalletKind},
        time::TimestampMs,
    };
    use escrow_chain::wallet::{SEED_LEN, vkey_of_seed};

    /// The seal key every fixture wallet is sealed under.
    pub fn seal_key() -> SealKey {
        SealKey::new([0x42; 32])
    }

    pub fn source_template() -> PaymentSource {
        PaymentSource {
            id: PaymentSourceId(0),
            network: Network::Test,
            contract_address: Address::new(
                "script_test1escrow".to_owned(),
            )
            .unwrap(),
            cooldown_ms: 600_000,
            fee_rate_permille: 50,
            fee_receiver_address: Address::new("addr_test1fee".to_owned())
                .unwrap(),
            admin_addresses: [
                Address::new("addr_test1adm1".to_owned()).unwrap(),
                Address::new("addr_test1adm2".to_owned()).unwrap(),
                Address::new("addr_test1adm3".to_owned()).unwrap(),
            ],
            rpc_api_key: "fixture-key".to_owned(),
            sync_in_progress: false,
            disable_payment_at: None,
            deleted_at: None,
        }
    }

    /// A hot wallet whose sealed seed is `[seed_byte; 32]` and whose vkey
    /// matches it.
    pub fn hot_wallet(
        source: PaymentSourceId,
        kind: WalletKind,
        seed_byte: u8,
    ) -> HotWallet {
        let seed = [seed_byte; SEED_LEN];
        let vkey = vkey_of_seed(&seed).unwrap();
        let mut rng = SysRng::new();
        HotWallet {
            id: WalletId(0),
            payment_source_id: source,
            kind,
            address: Address::new(format!("addr_test1hot{seed_byte}"))
                .unwrap(),
            vkey,
            sealed_seed: seal_key().seal(&mut rng, &seed).unwrap(),
            locked_at: None,
            pending_transaction_id: None,
            deleted_at: None,
        }
    }

    /// A counterparty descriptor matching [`hot_wallet`] with the same
    /// seed byte (the "other deployment's" hot wallet, seen from here).
    pub fn wallet_base(
        source: PaymentSourceId,
        kind: WalletKind,
        seed_byte: u8,
    ) -> WalletBase {
        let template = hot_wallet(source, kind, seed_byte);
        WalletBase {
            id: WalletId(0),
            payment_source_id: source,
            address: template.address,
            vkey: template.vkey,
            kind,
        }
    }

    /// Deadlines starting half an hour from now with comfortable gaps.
    pub fn future_times() -> RequestTimes {
        let now = TimestampMs::now();
        RequestTimes {
            pay_by_time: now.saturating_add(Duration::from_secs(30 * 60)),
            submit_result_time: now
                .saturating_add(Duration::from_secs(60 * 60)),
            unlock_time: now.saturating_add(Duration::from_secs(2 * 60 * 60)),
            external_dispute_unlock_time: now
                .saturating_add(Duration::from_secs(4 * 60 * 60)),
        }
    }

    /// A bare request record; tests adjust the fields they exercise.
    pub fn request_template(
        side: RequestSide,
        identifier: &str,
    ) -> EscrowRequest {
        let now = TimestampMs::now();
        EscrowRequest {
            id: RequestId(0),
            side,
            payment_source_id: PaymentSourceId(1),
            blockchain_identifier: BlockchainIdentifier::new(
                identifier.to_owned(),
            )
            .unwrap(),
            input_hash: "ab".repeat(32),
            result_hash: None,
            metadata: None,
            times: future_times(),
            seller_cooldown_time: TimestampMs::MIN,
            buyer_cooldown_time: TimestampMs::MIN,
            funds: Funds(vec![AssetAmount::lovelace(
                Amount::try_from_i64(5_000_000).unwrap(),
            )]),
            collateral_return_lovelace: Amount::try_from_i64(2_000_000)
                .unwrap(),
            total_buyer_fees: Amount::ZERO,
            total_seller_fees: Amount::ZERO,
            smart_contract_wallet_id: None,
            seller_wallet_id: None,
            buyer_wallet_id: None,
            current_transaction_id: None,
            transaction_history: Vec::new(),
            next_action: NextAction::new(
                escrow_core::action::RequestedAction::WaitingForExternalAction,
            ),
            on_chain_state: None,
            created_at: now,
            updated_at: now,
        }
    }
}
