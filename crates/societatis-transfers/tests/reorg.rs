//! Reorganization scenarios against a single transfer index.

use societatis_transfers::{
    OutputRecord, RelevantOutput, SpentOutputRecord, Transaction, TransactionBlockInfo,
    TransferFlags, TransfersContainer,
};
use societatis_types::{Currency, Hash, KeyImage, Network, PublicKey};
use std::sync::Arc;

fn h(n: u8) -> Hash {
    Hash::new([n; 32])
}

fn container() -> TransfersContainer {
    TransfersContainer::new(Arc::new(Currency::for_network(Network::Testnet)), 1, 4)
}

fn block(height: u32) -> TransactionBlockInfo {
    TransactionBlockInfo::new(height, 1_500_000_000 + height as u64 * 120, 0)
}

/// Transaction `n` paying `amount` to the account; the key image is `[n; 32]`.
fn payment(n: u8, amount: u64) -> (Transaction, Vec<RelevantOutput>) {
    let tx = Transaction::new(h(n), PublicKey::new([n; 32]))
        .with_key_output(amount, PublicKey::new([n.wrapping_add(100); 32]));
    let outs = vec![RelevantOutput::key(
        amount,
        0,
        PublicKey::new([n.wrapping_add(100); 32]),
        KeyImage::new([n; 32]),
    )];
    (tx, outs)
}

fn with_indices(outs: &[RelevantOutput], first: u32) -> Vec<RelevantOutput> {
    outs.iter()
        .enumerate()
        .map(|(i, o)| o.with_global_index(first + i as u32))
        .collect()
}

#[derive(Debug, PartialEq, Eq)]
struct View {
    outputs: Vec<OutputRecord>,
    spent: Vec<SpentOutputRecord>,
    transactions: usize,
    current_height: u32,
}

fn view(c: &TransfersContainer) -> View {
    let mut outputs = c.list_outputs(TransferFlags::ALL);
    outputs.sort_by_key(|o| o.position());
    let mut spent = c.spent_outputs();
    spent.sort_by_key(|s| s.output.position());
    View {
        outputs,
        spent,
        transactions: c.transaction_count(),
        current_height: c.current_height(),
    }
}

#[test]
fn scenario_confirm_then_rollback() {
    let c = container();
    let (t1, outs) = payment(1, 100);
    assert!(c
        .submit_transaction(&TransactionBlockInfo::unconfirmed(), &t1, &outs)
        .unwrap());
    assert!(c.confirm_transaction(&block(100), &h(1), &[5]).unwrap());

    let available = c.list_outputs(TransferFlags::ALL_AVAILABLE);
    assert_eq!(available.len(), 1);
    assert_eq!(available[0].amount, 100);
    assert_eq!(available[0].global_output_index, 5);
    assert_eq!(c.balance(TransferFlags::ALL_AVAILABLE), 100);

    let removed = c.rollback(100);
    assert_eq!(removed, vec![h(1)]);
    assert!(c.list_outputs(TransferFlags::ALL).is_empty());
    assert!(c.unconfirmed_transactions().is_empty());
    assert_eq!(c.balance(TransferFlags::ALL_AVAILABLE), 0);
    c.check_invariants().unwrap();
}

#[test]
fn scenario_spend_then_rollback() {
    let c = container();
    let (t1, outs) = payment(1, 100);
    c.submit_transaction(&block(100), &t1, &with_indices(&outs, 5))
        .unwrap();

    let t2 = Transaction::new(h(2), PublicKey::new([2; 32])).with_key_input(100, KeyImage::new([1; 32]));
    assert!(c.submit_transaction(&block(101), &t2, &[]).unwrap());

    let spent = c.spent_outputs();
    assert_eq!(spent.len(), 1);
    assert_eq!(spent[0].output.transaction_hash, h(1));
    assert_eq!(spent[0].spending_transaction_hash, h(2));
    assert_eq!(c.balance(TransferFlags::ALL_AVAILABLE), 0);

    assert_eq!(c.rollback(101), vec![h(2)]);
    let available = c.list_outputs(TransferFlags::ALL_AVAILABLE);
    assert_eq!(available.len(), 1);
    assert_eq!(available[0].transaction_hash, h(1));
    assert!(c.spent_outputs().is_empty());
    assert_eq!(c.current_height(), 100);
    c.check_invariants().unwrap();
}

#[test]
fn rollback_and_replay_restores_state() {
    let c = container();
    let (t1, o1) = payment(1, 100);
    let (t2, o2) = payment(2, 250);
    let t3 = Transaction::new(h(3), PublicKey::new([3; 32]))
        .with_key_input(100, KeyImage::new([1; 32]))
        .with_key_output(60, PublicKey::new([33; 32]))
        .with_key_output(40, PublicKey::new([34; 32]));
    let o3 = vec![
        RelevantOutput::key(40, 1, PublicKey::new([34; 32]), KeyImage::new([34; 32])).with_global_index(20)
    ];
    let (t4, o4) = payment(4, 7);

    let chain: Vec<(u32, &Transaction, Vec<RelevantOutput>)> = vec![
        (100, &t1, with_indices(&o1, 10)),
        (101, &t2, with_indices(&o2, 11)),
        (102, &t3, o3.clone()),
        (103, &t4, with_indices(&o4, 21)),
    ];
    for (height, tx, outs) in &chain {
        assert!(c.submit_transaction(&block(*height), *tx, outs).unwrap());
    }
    c.advance_height(103);
    let before = view(&c);
    let balance_before = c.balance(TransferFlags::ALL);

    let removed = c.rollback(101);
    assert_eq!(removed, vec![h(4), h(3), h(2)]);
    assert_eq!(c.current_height(), 100);

    for (height, tx, outs) in chain.iter().filter(|(height, _, _)| *height >= 101) {
        assert!(c.submit_transaction(&block(*height), *tx, outs).unwrap());
    }
    assert_eq!(view(&c), before);
    assert_eq!(c.balance(TransferFlags::ALL), balance_before);
    c.check_invariants().unwrap();
}

#[test]
fn rollback_clears_safe_flag() {
    let c = container();
    let (t1, o1) = payment(1, 100);
    let (t2, o2) = payment(2, 50);
    c.submit_transaction(&block(10), &t1, &with_indices(&o1, 0))
        .unwrap();
    c.submit_transaction(&block(11), &t2, &with_indices(&o2, 1))
        .unwrap();
    assert!(c.mark_transaction_safe(&h(1)));
    assert!(c.mark_transaction_safe(&h(2)));
    assert!(c.mark_transaction_safe(&h(2)));
    assert_eq!(c.safe_transactions(), vec![h(1), h(2)]);

    c.advance_height(20);
    c.rollback(11);
    assert_eq!(c.safe_transactions(), vec![h(1)]);
}

#[test]
fn rollback_removes_dependent_unconfirmed_spends() {
    let c = container();
    let (t1, o1) = payment(1, 100);
    c.submit_transaction(&block(50), &t1, &with_indices(&o1, 0))
        .unwrap();

    // Pool transaction spending the confirmed output and paying change.
    let t2 = Transaction::new(h(2), PublicKey::new([2; 32]))
        .with_key_input(100, KeyImage::new([1; 32]))
        .with_key_output(90, PublicKey::new([22; 32]));
    let o2 = vec![RelevantOutput::key(90, 0, PublicKey::new([22; 32]), KeyImage::new([22; 32]))];
    c.submit_transaction(&TransactionBlockInfo::unconfirmed(), &t2, &o2)
        .unwrap();
    // Second pool transaction spending the change.
    let t3 = Transaction::new(h(3), PublicKey::new([3; 32])).with_key_input(90, KeyImage::new([22; 32]));
    c.submit_transaction(&TransactionBlockInfo::unconfirmed(), &t3, &[])
        .unwrap();

    // An unrelated pool transaction survives.
    let (t4, o4) = payment(4, 5);
    c.submit_transaction(&TransactionBlockInfo::unconfirmed(), &t4, &o4)
        .unwrap();

    let removed = c.rollback(50);
    assert_eq!(removed, vec![h(2), h(3), h(1)]);
    assert_eq!(c.unconfirmed_transactions(), vec![h(4)]);
    assert_eq!(
        c.balance(TransferFlags::TYPE_ALL | TransferFlags::STATE_UNCONFIRMED),
        5
    );
    c.check_invariants().unwrap();
}

#[test]
fn rollback_above_everything_is_noop() {
    let c = container();
    let (t1, o1) = payment(1, 100);
    c.submit_transaction(&block(10), &t1, &with_indices(&o1, 0))
        .unwrap();
    assert!(c.rollback(11).is_empty());
    assert_eq!(c.current_height(), 10);
    assert_eq!(c.transfer_count(), 1);
}
