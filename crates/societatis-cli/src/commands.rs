//! CLI command implementations.

use crate::AppContext;
use serde_json::json;
use societatis_transfers::{RepairReport, TransferFlags, TransfersContainer};
use societatis_types::{Currency, Hash};
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

type Result = std::result::Result<(), Box<dyn std::error::Error>>;

// ─── Helpers ────────────────────────────────────────────────────────────────

fn currency(ctx: &AppContext) -> Currency {
    let mut currency = Currency::for_network(ctx.network);
    if let Some(age) = ctx.spendable_age {
        currency = currency.with_spendable_age(age);
    }
    if let Some(age) = ctx.safe_spendable_age {
        currency = currency.with_safe_spendable_age(age);
    }
    currency
}

/// Load the snapshot into a fresh index, applying the height override.
fn open(
    ctx: &AppContext,
) -> std::result::Result<(TransfersContainer, RepairReport), Box<dyn std::error::Error>> {
    let container = TransfersContainer::with_default_ages(Arc::new(currency(ctx)));
    let mut reader = BufReader::new(File::open(&ctx.snapshot)?);
    let report = container.load(&mut reader)?;
    if !report.is_clean() {
        log::warn!("snapshot repaired on load: {:?}", report);
    }
    if let Some(height) = ctx.height {
        if !container.advance_height(height) {
            log::warn!(
                "--height {} is below the saved height {}, keeping the saved height",
                height,
                container.current_height()
            );
        }
    }
    log::debug!("{:?}", container);
    Ok((container, report))
}

fn print_json(value: &serde_json::Value) -> Result {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn state_balances(container: &TransfersContainer) -> serde_json::Value {
    let state = |flags: TransferFlags| container.balance(flags | TransferFlags::TYPE_ALL);
    json!({
        "unconfirmed": state(TransferFlags::STATE_UNCONFIRMED),
        "locked": state(TransferFlags::STATE_LOCKED),
        "unlocked": state(TransferFlags::STATE_UNLOCKED),
        "safeUnlocked": container.safe_balance(TransferFlags::STATE_UNLOCKED | TransferFlags::TYPE_ALL),
        "spent": state(TransferFlags::STATE_SPENT),
    })
}

// ─── Commands ───────────────────────────────────────────────────────────────

pub fn summary(ctx: &AppContext) -> Result {
    let (container, report) = open(ctx)?;
    print_json(&json!({
        "network": ctx.network.to_string(),
        "currentHeight": container.current_height(),
        "transactionSpendableAge": container.transaction_spendable_age(),
        "safeTransactionSpendableAge": container.safe_transaction_spendable_age(),
        "transactions": container.transaction_count(),
        "transfers": container.transfer_count(),
        "unconfirmedTransactions": container.unconfirmed_transactions(),
        "safeTransactions": container.safe_transactions(),
        "balances": state_balances(&container),
        "repair": report,
    }))
}

pub fn balance(ctx: &AppContext, flags: TransferFlags, safe: bool) -> Result {
    let (container, _) = open(ctx)?;
    let amount = if safe {
        container.safe_balance(flags)
    } else {
        container.balance(flags)
    };
    print_json(&json!({
        "flags": flags.bits(),
        "safe": safe,
        "balance": amount,
    }))
}

pub fn outputs(ctx: &AppContext, flags: TransferFlags, safe: bool) -> Result {
    let (container, _) = open(ctx)?;
    let outputs = if safe {
        container.safe_outputs(flags)
    } else {
        container.list_outputs(flags)
    };
    print_json(&serde_json::to_value(outputs)?)
}

pub fn transactions(ctx: &AppContext) -> Result {
    let (container, _) = open(ctx)?;
    let details: Vec<_> = container
        .transactions()
        .iter()
        .filter_map(|tx| container.transaction_info(&tx.transaction_hash))
        .collect();
    print_json(&serde_json::to_value(details)?)
}

pub fn transaction(ctx: &AppContext, hash: &Hash) -> Result {
    let (container, _) = open(ctx)?;
    let details = container
        .transaction_info(hash)
        .ok_or_else(|| format!("transaction {} not found", hash))?;
    print_json(&json!({
        "transaction": details,
        "outputs": container.transaction_outputs(hash, TransferFlags::ALL),
        "inputs": container.transaction_inputs(hash, TransferFlags::ALL),
    }))
}

pub fn spent(ctx: &AppContext) -> Result {
    let (container, _) = open(ctx)?;
    print_json(&serde_json::to_value(container.spent_outputs())?)
}

pub fn check(ctx: &AppContext) -> Result {
    let (container, report) = open(ctx)?;
    container.check_invariants()?;
    print_json(&json!({
        "ok": true,
        "repair": report,
    }))
}
