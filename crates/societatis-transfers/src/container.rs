//! The per-account transfer index.
//!
//! [`TransfersContainer`] stores one account's outputs in three tables
//! (unconfirmed, available, spent) plus transaction metadata and the set of
//! transactions marked safe. Every operation takes the same lock, so callers
//! observe either the state before a mutation or the state after it.
//!
//! Mutations validate everything up front and only then apply, so a failed
//! call leaves the index untouched.

use crate::descriptor::SpentOutputDescriptor;
use crate::error::TransfersError;
use crate::flags::TransferFlags;
use crate::records::{
    OutputRecord, OutputTarget, RelevantOutput, SpentOutputRecord, TransactionBlockInfo,
    TransactionDetails, TransactionInformation,
};
use crate::snapshot::{self, Snapshot};
use crate::table::{TransferId, TransferTable};
use crate::transaction::{TransactionInput, TransactionOutputTarget, TransactionReader};
use serde::Serialize;
use societatis_types::{
    Currency, Hash, KeyImage, OutputType, UNCONFIRMED_TRANSACTION_GLOBAL_OUTPUT_INDEX,
    UNCONFIRMED_TRANSACTION_HEIGHT,
};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::io::{Read, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// What reconciliation changed while loading a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairReport {
    pub transactions_discarded: usize,
    pub records_discarded: usize,
    pub records_rederived: usize,
    pub spends_reverted: usize,
    pub safe_dropped: usize,
    pub height_raised: bool,
}

impl RepairReport {
    pub fn is_clean(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Location {
    Unconfirmed,
    Available,
    Spent,
}

// =============================================================================
// State
// =============================================================================

#[derive(Debug, Default)]
struct State {
    next_id: TransferId,
    transactions: HashMap<Hash, TransactionInformation>,
    heights: BTreeMap<u32, BTreeSet<Hash>>,
    unconfirmed: TransferTable<OutputRecord>,
    available: TransferTable<OutputRecord>,
    spent: TransferTable<SpentOutputRecord>,
    safe: BTreeSet<Hash>,
    current_height: u32,
    /// Newest block known with its timestamp; anchors chain-time estimates.
    chain_reference: Option<(u32, u64)>,
}

fn build_records<R: TransactionReader + ?Sized>(
    block: &TransactionBlockInfo,
    tx: &R,
    outputs: &[RelevantOutput],
) -> Result<Vec<OutputRecord>, TransfersError> {
    let hash = tx.hash();
    let tx_outputs = tx.outputs();
    let mismatch = |index: u32, reason: &str| TransfersError::OutputMismatch {
        hash,
        index,
        reason: reason.to_string(),
    };

    let mut seen = HashSet::new();
    let mut records = Vec::with_capacity(outputs.len());
    for out in outputs {
        let index = out.output_in_transaction;
        let source = tx_outputs
            .get(index as usize)
            .ok_or_else(|| mismatch(index, "no such output"))?;
        if !seen.insert(index) {
            return Err(mismatch(index, "supplied twice"));
        }
        if source.amount != out.amount {
            return Err(mismatch(index, "amount differs"));
        }
        let target_matches = match (&source.target, &out.target) {
            (TransactionOutputTarget::Key { key }, OutputTarget::Key { output_key, .. }) => {
                key == output_key
            }
            (
                TransactionOutputTarget::Multisignature {
                    required_signatures: expected,
                    ..
                },
                OutputTarget::Multisignature {
                    required_signatures,
                },
            ) => expected == required_signatures,
            _ => false,
        };
        if !target_matches {
            return Err(mismatch(index, "target differs"));
        }

        let global_output_index = if block.is_confirmed() {
            if out.global_output_index == UNCONFIRMED_TRANSACTION_GLOBAL_OUTPUT_INDEX {
                return Err(mismatch(index, "missing global output index"));
            }
            out.global_output_index
        } else {
            UNCONFIRMED_TRANSACTION_GLOBAL_OUTPUT_INDEX
        };

        records.push(OutputRecord {
            amount: out.amount,
            global_output_index,
            output_in_transaction: index,
            transaction_hash: hash,
            transaction_public_key: tx.public_key(),
            target: out.target,
            unlock_time: tx.unlock_time(),
            block: *block,
            visible: true,
        });
    }
    Ok(records)
}

/// Fits a loaded record to its transaction. `None` when it cannot be fitted.
fn normalize(info: &TransactionInformation, mut rec: OutputRecord) -> Option<(OutputRecord, bool)> {
    let mut changed = false;
    if info.is_confirmed() {
        if rec.global_output_index == UNCONFIRMED_TRANSACTION_GLOBAL_OUTPUT_INDEX {
            return None;
        }
    } else if rec.global_output_index != UNCONFIRMED_TRANSACTION_GLOBAL_OUTPUT_INDEX {
        rec.global_output_index = UNCONFIRMED_TRANSACTION_GLOBAL_OUTPUT_INDEX;
        changed = true;
    }
    let block = info.block();
    if rec.block != block {
        rec.block = block;
        changed = true;
    }
    Some((rec, changed))
}

impl State {
    fn table_output(&self, location: Location, id: TransferId) -> Option<&OutputRecord> {
        match location {
            Location::Unconfirmed => self.unconfirmed.get(id),
            Location::Available => self.available.get(id),
            Location::Spent => self.spent.get(id).map(|s| &s.output),
        }
    }

    fn records(&self) -> impl Iterator<Item = (Location, TransferId, &OutputRecord)> + '_ {
        self.unconfirmed
            .iter()
            .map(|(id, r)| (Location::Unconfirmed, id, r))
            .chain(self.available.iter().map(|(id, r)| (Location::Available, id, r)))
            .chain(self.spent.iter().map(|(id, s)| (Location::Spent, id, &s.output)))
    }

    /// Outputs created by `hash`, wherever they currently live.
    fn outputs_of(&self, hash: &Hash) -> Vec<(Location, TransferId, &OutputRecord)> {
        let mut out = Vec::new();
        for location in [Location::Unconfirmed, Location::Available, Location::Spent] {
            let ids = match location {
                Location::Unconfirmed => self.unconfirmed.ids_by_transaction(hash),
                Location::Available => self.available.ids_by_transaction(hash),
                Location::Spent => self.spent.ids_by_transaction(hash),
            };
            for id in ids {
                if let Some(rec) = self.table_output(location, id) {
                    out.push((location, id, rec));
                }
            }
        }
        out
    }

    fn take_unspent(&mut self, id: TransferId) -> Option<OutputRecord> {
        self.available
            .remove(id)
            .or_else(|| self.unconfirmed.remove(id))
    }

    fn index_height(&mut self, hash: Hash, height: u32) {
        self.heights.entry(height).or_default().insert(hash);
    }

    fn unindex_height(&mut self, hash: &Hash, height: u32) {
        if let Some(hashes) = self.heights.get_mut(&height) {
            hashes.remove(hash);
            if hashes.is_empty() {
                self.heights.remove(&height);
            }
        }
    }

    fn raise_height(&mut self, height: u32) {
        if height > self.current_height {
            self.current_height = height;
        }
    }

    fn note_block(&mut self, height: u32, timestamp: u64) {
        if self.chain_reference.map_or(true, |(known, _)| height >= known) {
            self.chain_reference = Some((height, timestamp));
        }
    }

    fn rebuild_chain_reference(&mut self) {
        self.chain_reference = self
            .transactions
            .values()
            .filter(|tx| tx.is_confirmed())
            .map(|tx| (tx.block_height, tx.timestamp))
            .max();
    }

    fn chain_time(&self, currency: &Currency) -> u64 {
        match self.chain_reference {
            Some((height, timestamp)) => {
                currency.estimate_chain_time(timestamp, height, self.current_height)
            }
            None => 0,
        }
    }

    /// Among records sharing a key image only one is visible: the spent one
    /// if any, else the oldest available, else the first unconfirmed.
    fn update_visibility(&mut self, key_image: KeyImage) {
        let descriptor = SpentOutputDescriptor::from_key_image(key_image);
        let spent = self.spent.ids_by_descriptor(&descriptor);
        let mut available = self.available.ids_by_descriptor(&descriptor);
        available.sort_by_key(|id| {
            let height = self.available.get(*id).map_or(u32::MAX, |r| r.block.height);
            (height, *id)
        });
        let unconfirmed = self.unconfirmed.ids_by_descriptor(&descriptor);

        let winner = spent
            .first()
            .or(available.first())
            .or(unconfirmed.first())
            .copied();

        for id in spent {
            let visible = Some(id) == winner;
            if self.spent.get(id).is_some_and(|s| s.output.visible != visible) {
                self.spent.modify(id, |s| s.output.visible = visible);
            }
        }
        for id in available {
            let visible = Some(id) == winner;
            if self.available.get(id).is_some_and(|r| r.visible != visible) {
                self.available.modify(id, |r| r.visible = visible);
            }
        }
        for id in unconfirmed {
            let visible = Some(id) == winner;
            if self.unconfirmed.get(id).is_some_and(|r| r.visible != visible) {
                self.unconfirmed.modify(id, |r| r.visible = visible);
            }
        }
    }

    fn update_visibility_all<I: IntoIterator<Item = KeyImage>>(&mut self, key_images: I) {
        for key_image in key_images {
            self.update_visibility(key_image);
        }
    }

    fn same_outputs(&self, hash: &Hash, records: &[OutputRecord]) -> bool {
        let mut known: Vec<(u32, u64, OutputTarget)> = self
            .outputs_of(hash)
            .into_iter()
            .map(|(_, _, r)| (r.output_in_transaction, r.amount, r.target))
            .collect();
        let mut supplied: Vec<(u32, u64, OutputTarget)> = records
            .iter()
            .map(|r| (r.output_in_transaction, r.amount, r.target))
            .collect();
        known.sort_by_key(|k| k.0);
        supplied.sort_by_key(|k| k.0);
        known == supplied
    }

    // ─── Submission ─────────────────────────────────────────────────────────

    fn submit<R: TransactionReader + ?Sized>(
        &mut self,
        block: &TransactionBlockInfo,
        tx: &R,
        outputs: &[RelevantOutput],
    ) -> Result<bool, TransfersError> {
        let hash = tx.hash();
        let records = build_records(block, tx, outputs)?;

        if self.transactions.contains_key(&hash) {
            if self.same_outputs(&hash, &records) {
                log::debug!("transaction {} already recorded", hash);
                return Ok(false);
            }
            log::warn!("transaction {} resubmitted with different outputs", hash);
            return Err(TransfersError::ConflictingTransaction(hash));
        }

        let confirmed = block.is_confirmed();
        if confirmed && block.height < self.current_height {
            return Err(TransfersError::BlockBelowCurrentHeight {
                height: block.height,
                current: self.current_height,
            });
        }

        if confirmed {
            let mut fresh = HashSet::new();
            for rec in records
                .iter()
                .filter(|r| r.output_type() == OutputType::Multisignature)
            {
                let descriptor = rec.descriptor();
                if self.available.has_descriptor(&descriptor)
                    || self.spent.has_descriptor(&descriptor)
                    || !fresh.insert(descriptor)
                {
                    return Err(TransfersError::TransferAlreadyExists {
                        amount: rec.amount,
                        global_index: rec.global_output_index,
                    });
                }
            }
        }

        // Ids the new outputs will get, so inputs can spend them too.
        let first_id = self.next_id;
        let spends = self.plan_spends(&hash, confirmed, tx.inputs(), &records, first_id)?;

        if records.is_empty() && spends.is_empty() {
            return Ok(false);
        }

        let mut touched = BTreeSet::new();
        self.next_id = first_id + records.len() as TransferId;
        let created = records.len();
        for (offset, rec) in records.into_iter().enumerate() {
            let id = first_id + offset as TransferId;
            touched.extend(rec.key_image());
            if confirmed {
                self.available.insert(id, rec);
            } else {
                self.unconfirmed.insert(id, rec);
            }
        }
        let spent = spends.len();
        for (id, input_in_transaction) in spends {
            if let Some(output) = self.take_unspent(id) {
                touched.extend(output.key_image());
                self.spent.insert(
                    id,
                    SpentOutputRecord {
                        output,
                        spending_block: *block,
                        spending_transaction_hash: hash,
                        input_in_transaction,
                    },
                );
            }
        }

        self.transactions.insert(
            hash,
            TransactionInformation {
                transaction_hash: hash,
                public_key: tx.public_key(),
                block_height: block.height,
                timestamp: block.timestamp,
                transaction_index: block.transaction_index,
                unlock_time: tx.unlock_time(),
                total_amount_in: tx.input_total_amount(),
                total_amount_out: tx.output_total_amount(),
                extra: tx.extra().to_vec(),
                payment_id: tx.payment_id(),
                coinbase: tx
                    .inputs()
                    .iter()
                    .any(|input| matches!(input, TransactionInput::Generating { .. })),
            },
        );
        self.index_height(hash, block.height);
        if confirmed {
            self.raise_height(block.height);
            self.note_block(block.height, block.timestamp);
        }
        self.update_visibility_all(touched);

        log::debug!(
            "recorded transaction {} at height {}: {} outputs, {} spends",
            hash,
            block.height,
            created,
            spent
        );
        Ok(true)
    }

    /// Match inputs against stored (and about-to-be-stored) outputs.
    /// Returns `(transfer id, input index)` pairs.
    ///
    /// A confirmed spender never matches unconfirmed outputs of other
    /// transactions.
    fn plan_spends(
        &self,
        hash: &Hash,
        confirmed: bool,
        inputs: &[TransactionInput],
        pending: &[OutputRecord],
        first_pending_id: TransferId,
    ) -> Result<Vec<(TransferId, u32)>, TransfersError> {
        let mut spends = Vec::new();
        let mut seen = HashSet::new();

        for (index, input) in inputs.iter().enumerate() {
            let (descriptor, amount) = match input {
                TransactionInput::Key {
                    amount, key_image, ..
                } => (SpentOutputDescriptor::from_key_image(*key_image), *amount),
                TransactionInput::Multisignature {
                    amount,
                    output_index,
                    ..
                } => (
                    SpentOutputDescriptor::from_multisignature(*amount, *output_index),
                    *amount,
                ),
                TransactionInput::Generating { .. } => continue,
            };

            let mut candidates: Vec<(u32, TransferId, u64)> = self
                .available
                .ids_by_descriptor(&descriptor)
                .into_iter()
                .filter_map(|id| self.available.get(id).map(|r| (r.block.height, id, r.amount)))
                .collect();
            candidates.sort();
            if descriptor.key_image().is_some() {
                if !confirmed {
                    candidates.extend(
                        self.unconfirmed
                            .ids_by_descriptor(&descriptor)
                            .into_iter()
                            .filter_map(|id| self.unconfirmed.get(id).map(|r| (r.block.height, id, r.amount))),
                    );
                }
                candidates.extend(pending.iter().enumerate().filter_map(|(offset, r)| {
                    (r.descriptor() == descriptor)
                        .then(|| (r.block.height, first_pending_id + offset as TransferId, r.amount))
                }));
            }

            let already_spent = self.spent.has_descriptor(&descriptor);
            if candidates.is_empty() && !already_spent {
                continue;
            }
            if already_spent || !seen.insert(descriptor) {
                log::warn!("transaction {} input {} spends a spent output", hash, index);
                return Err(TransfersError::AlreadySpent {
                    hash: *hash,
                    input: index,
                });
            }
            match candidates.iter().find(|(_, _, a)| *a == amount) {
                Some((_, id, _)) => spends.push((*id, index as u32)),
                None => {
                    log::warn!(
                        "transaction {} input {} amount {} matches no stored output",
                        hash,
                        index,
                        amount
                    );
                    return Err(TransfersError::InputAmountMismatch {
                        hash: *hash,
                        input: index,
                        amount,
                    });
                }
            }
        }
        Ok(spends)
    }

    // ─── Confirmation ───────────────────────────────────────────────────────

    fn confirm(
        &mut self,
        block: &TransactionBlockInfo,
        hash: &Hash,
        global_indices: &[u32],
    ) -> Result<bool, TransfersError> {
        if !block.is_confirmed() {
            return Err(TransfersError::UnconfirmedBlockInfo);
        }
        match self.transactions.get(hash) {
            Some(info) if !info.is_confirmed() => {}
            _ => return Ok(false),
        }
        if block.height < self.current_height {
            return Err(TransfersError::BlockBelowCurrentHeight {
                height: block.height,
                current: self.current_height,
            });
        }
        let unconfirmed_origin = self
            .spent
            .ids_by_spending_transaction(hash)
            .into_iter()
            .filter_map(|id| self.spent.get(id))
            .find(|s| !s.output.is_confirmed() && s.output.transaction_hash != *hash)
            .map(|s| s.output.transaction_hash);
        if let Some(origin) = unconfirmed_origin {
            return Err(TransfersError::UnconfirmedOrigin { hash: *hash, origin });
        }

        // Outputs still waiting for a global index, in supply order.
        let mut waiting: Vec<(TransferId, Location)> = self
            .outputs_of(hash)
            .into_iter()
            .filter(|(location, _, rec)| *location != Location::Available && !rec.is_confirmed())
            .map(|(location, id, _)| (id, location))
            .collect();
        waiting.sort_by_key(|(id, _)| *id);

        if waiting.len() != global_indices.len() {
            log::warn!(
                "confirmation of {} carries {} global indices for {} outputs",
                hash,
                global_indices.len(),
                waiting.len()
            );
            return Err(TransfersError::GlobalIndexCountMismatch {
                hash: *hash,
                expected: waiting.len(),
                actual: global_indices.len(),
            });
        }

        let mut fresh = HashSet::new();
        for (&(id, location), &global_index) in waiting.iter().zip(global_indices) {
            let Some(rec) = self.table_output(location, id) else {
                continue;
            };
            if global_index == UNCONFIRMED_TRANSACTION_GLOBAL_OUTPUT_INDEX {
                return Err(TransfersError::OutputMismatch {
                    hash: *hash,
                    index: rec.output_in_transaction,
                    reason: "missing global output index".into(),
                });
            }
            if rec.output_type() == OutputType::Multisignature {
                let descriptor = SpentOutputDescriptor::from_multisignature(rec.amount, global_index);
                if self.available.has_descriptor(&descriptor)
                    || self.spent.has_descriptor(&descriptor)
                    || !fresh.insert(descriptor)
                {
                    return Err(TransfersError::TransferAlreadyExists {
                        amount: rec.amount,
                        global_index,
                    });
                }
            }
        }

        let mut touched = BTreeSet::new();
        for (&(id, location), &global_index) in waiting.iter().zip(global_indices) {
            match location {
                Location::Spent => {
                    self.spent.modify(id, |s| {
                        s.output.block = *block;
                        s.output.global_output_index = global_index;
                        touched.extend(s.output.key_image());
                    });
                }
                _ => {
                    if let Some(mut rec) = self.unconfirmed.remove(id) {
                        rec.block = *block;
                        rec.global_output_index = global_index;
                        touched.extend(rec.key_image());
                        self.available.insert(id, rec);
                    }
                }
            }
        }
        for id in self.spent.ids_by_spending_transaction(hash) {
            self.spent.modify(id, |s| s.spending_block = *block);
        }
        if let Some(info) = self.transactions.get_mut(hash) {
            info.set_block(block);
        }
        self.unindex_height(hash, UNCONFIRMED_TRANSACTION_HEIGHT);
        self.index_height(*hash, block.height);
        self.raise_height(block.height);
        self.note_block(block.height, block.timestamp);
        self.update_visibility_all(touched);

        log::debug!(
            "confirmed transaction {} at height {} ({} outputs)",
            hash,
            block.height,
            global_indices.len()
        );
        Ok(true)
    }

    // ─── Removal ────────────────────────────────────────────────────────────

    /// Drop a transaction, its outputs and its spends. Spent records whose
    /// spender is dropped return to the table they were spent from.
    fn remove_transaction(&mut self, hash: &Hash) -> Vec<KeyImage> {
        let mut touched = Vec::new();
        for id in self.spent.ids_by_spending_transaction(hash) {
            if let Some(spent) = self.spent.remove(id) {
                let output = spent.output;
                touched.extend(output.key_image());
                if output.is_confirmed() {
                    self.available.insert(id, output);
                } else {
                    self.unconfirmed.insert(id, output);
                }
            }
        }
        for (_, rec) in self.unconfirmed.remove_transaction(hash) {
            touched.extend(rec.key_image());
        }
        for (_, rec) in self.available.remove_transaction(hash) {
            touched.extend(rec.key_image());
        }
        for (_, spent) in self.spent.remove_transaction(hash) {
            touched.extend(spent.output.key_image());
        }
        if let Some(info) = self.transactions.remove(hash) {
            self.unindex_height(hash, info.block_height);
        }
        self.safe.remove(hash);
        touched
    }

    fn delete_unconfirmed(&mut self, hash: &Hash) -> bool {
        match self.transactions.get(hash) {
            Some(info) if !info.is_confirmed() => {}
            _ => return false,
        }
        let touched = self.remove_transaction(hash);
        self.update_visibility_all(touched);
        log::debug!("deleted unconfirmed transaction {}", hash);
        true
    }

    fn rollback(&mut self, height: u32) -> Vec<Hash> {
        let confirmed: Vec<Hash> = self
            .heights
            .range(height..UNCONFIRMED_TRANSACTION_HEIGHT)
            .rev()
            .flat_map(|(_, hashes)| hashes.iter().copied())
            .collect();
        let mut doomed: HashSet<Hash> = confirmed.iter().copied().collect();

        // Unconfirmed transactions spending anything that goes away go too.
        let unconfirmed: Vec<Hash> = self
            .heights
            .get(&UNCONFIRMED_TRANSACTION_HEIGHT)
            .map(|hashes| hashes.iter().copied().collect())
            .unwrap_or_default();
        let mut removed = Vec::new();
        loop {
            let before = removed.len();
            for hash in &unconfirmed {
                if doomed.contains(hash) {
                    continue;
                }
                let spends_doomed = self
                    .spent
                    .ids_by_spending_transaction(hash)
                    .into_iter()
                    .filter_map(|id| self.spent.get(id))
                    .any(|s| doomed.contains(&s.output.transaction_hash));
                if spends_doomed {
                    doomed.insert(*hash);
                    removed.push(*hash);
                }
            }
            if removed.len() == before {
                break;
            }
        }
        removed.extend(confirmed);

        let mut touched = BTreeSet::new();
        for hash in &removed {
            touched.extend(self.remove_transaction(hash));
        }
        self.current_height = self.current_height.min(height.saturating_sub(1));
        if self.chain_reference.is_some_and(|(known, _)| known >= height) {
            self.rebuild_chain_reference();
        }
        self.update_visibility_all(touched);

        log::info!(
            "rolled back to height {}: {} transactions removed",
            height,
            removed.len()
        );
        removed
    }

    // ─── Snapshots ──────────────────────────────────────────────────────────

    fn to_snapshot(&self) -> Snapshot {
        let mut transactions: Vec<TransactionInformation> =
            self.transactions.values().cloned().collect();
        transactions.sort_by_key(|tx| (tx.block_height, tx.transaction_index, tx.transaction_hash));
        Snapshot {
            transactions,
            unconfirmed: self.unconfirmed.iter().map(|(_, r)| r.clone()).collect(),
            available: self.available.iter().map(|(_, r)| r.clone()).collect(),
            spent: self.spent.iter().map(|(_, s)| s.clone()).collect(),
            safe: self.safe.iter().copied().collect(),
            current_height: self.current_height,
        }
    }

    /// Rebuild a consistent state from a possibly torn snapshot.
    fn reconcile(snapshot: Snapshot) -> (State, RepairReport) {
        let mut report = RepairReport::default();
        let mut state = State {
            current_height: snapshot.current_height,
            ..State::default()
        };

        for tx in snapshot.transactions {
            if state.transactions.contains_key(&tx.transaction_hash) {
                log::warn!("snapshot repair: duplicate transaction {} dropped", tx.transaction_hash);
                report.transactions_discarded += 1;
                continue;
            }
            state.transactions.insert(tx.transaction_hash, tx);
        }

        let mut unspent = Vec::new();
        for rec in snapshot.unconfirmed.into_iter().chain(snapshot.available) {
            let Some(info) = state.transactions.get(&rec.transaction_hash) else {
                log::warn!(
                    "snapshot repair: output of unknown transaction {} discarded",
                    rec.transaction_hash
                );
                report.records_discarded += 1;
                continue;
            };
            let hash = rec.transaction_hash;
            match normalize(info, rec) {
                Some((rec, changed)) => {
                    if changed {
                        log::warn!("snapshot repair: output of {} re-derived", hash);
                        report.records_rederived += 1;
                    }
                    unspent.push(rec);
                }
                None => {
                    log::warn!(
                        "snapshot repair: confirmed output of {} lacks a global index",
                        hash
                    );
                    report.records_discarded += 1;
                }
            }
        }

        let mut spent = Vec::new();
        for record in snapshot.spent {
            let hash = record.output.transaction_hash;
            let Some(info) = state.transactions.get(&hash) else {
                log::warn!("snapshot repair: spent output of unknown transaction {} discarded", hash);
                report.records_discarded += 1;
                continue;
            };
            let Some((output, changed)) = normalize(info, record.output) else {
                log::warn!(
                    "snapshot repair: confirmed spent output of {} lacks a global index",
                    hash
                );
                report.records_discarded += 1;
                continue;
            };
            if changed {
                report.records_rederived += 1;
            }
            match state.transactions.get(&record.spending_transaction_hash) {
                Some(spender)
                    if spender.is_confirmed()
                        && (!output.is_confirmed()
                            || spender.block_height < output.block.height) =>
                {
                    log::warn!(
                        "snapshot repair: confirmed spender {} precedes output of {}, reverted",
                        record.spending_transaction_hash,
                        hash
                    );
                    report.spends_reverted += 1;
                    unspent.push(output);
                }
                Some(spender) => {
                    let spending_block = spender.block();
                    if spending_block != record.spending_block {
                        report.records_rederived += 1;
                    }
                    spent.push(SpentOutputRecord {
                        output,
                        spending_block,
                        spending_transaction_hash: record.spending_transaction_hash,
                        input_in_transaction: record.input_in_transaction,
                    });
                }
                None => {
                    log::warn!(
                        "snapshot repair: spender {} missing, output of {} reverted",
                        record.spending_transaction_hash,
                        hash
                    );
                    report.spends_reverted += 1;
                    unspent.push(output);
                }
            }
        }

        // One record per chain output; a spent record wins.
        let mut positions = HashSet::new();
        let mut descriptors = HashSet::new();
        let mut kept_spent = Vec::new();
        for record in spent {
            if !positions.insert(record.output.position()) {
                report.records_discarded += 1;
                continue;
            }
            if descriptors.insert(record.output.descriptor()) {
                kept_spent.push(record);
            } else {
                log::warn!(
                    "snapshot repair: second spend of one output by {} reverted",
                    record.spending_transaction_hash
                );
                report.spends_reverted += 1;
                unspent.push(record.output);
            }
        }
        // Earlier outputs in chain order keep a contested multisignature descriptor.
        unspent.sort_by_key(|rec| (rec.block.height, rec.transaction_hash, rec.output_in_transaction));
        let mut kept_unspent = Vec::new();
        for rec in unspent {
            if !positions.insert(rec.position()) {
                log::warn!(
                    "snapshot repair: duplicate output {}:{} discarded",
                    rec.transaction_hash,
                    rec.output_in_transaction
                );
                report.records_discarded += 1;
            } else if rec.output_type() == OutputType::Multisignature
                && rec.is_confirmed()
                && !descriptors.insert(rec.descriptor())
            {
                log::warn!(
                    "snapshot repair: multisignature output (amount {}, global index {}) of {} discarded",
                    rec.amount,
                    rec.global_output_index,
                    rec.transaction_hash
                );
                report.records_discarded += 1;
            } else {
                kept_unspent.push(rec);
            }
        }

        let known_safe = snapshot.safe.len();
        state.safe = snapshot
            .safe
            .into_iter()
            .filter(|hash| state.transactions.contains_key(hash))
            .collect();
        report.safe_dropped = known_safe - state.safe.len();

        let top = state
            .transactions
            .values()
            .filter(|tx| tx.is_confirmed())
            .map(|tx| tx.block_height)
            .max();
        if let Some(top) = top {
            if top > state.current_height {
                log::warn!(
                    "snapshot repair: current height raised from {} to {}",
                    state.current_height,
                    top
                );
                state.current_height = top;
                report.height_raised = true;
            }
        }

        // Fresh ids in chain order: block, transaction, output position.
        enum Slot {
            Unspent(OutputRecord),
            Spent(SpentOutputRecord),
        }
        let mut slots: Vec<Slot> = kept_unspent
            .into_iter()
            .map(Slot::Unspent)
            .chain(kept_spent.into_iter().map(Slot::Spent))
            .collect();
        slots.sort_by_key(|slot| {
            let rec = match slot {
                Slot::Unspent(r) => r,
                Slot::Spent(s) => &s.output,
            };
            (rec.block.height, rec.transaction_hash, rec.output_in_transaction)
        });

        let mut key_images = BTreeSet::new();
        for slot in slots {
            let id = state.next_id;
            state.next_id += 1;
            match slot {
                Slot::Unspent(rec) => {
                    key_images.extend(rec.key_image());
                    if rec.is_confirmed() {
                        state.available.insert(id, rec);
                    } else {
                        state.unconfirmed.insert(id, rec);
                    }
                }
                Slot::Spent(s) => {
                    key_images.extend(s.output.key_image());
                    state.spent.insert(id, s);
                }
            }
        }

        let heights: Vec<(Hash, u32)> = state
            .transactions
            .values()
            .map(|tx| (tx.transaction_hash, tx.block_height))
            .collect();
        for (hash, height) in heights {
            state.index_height(hash, height);
        }
        state.rebuild_chain_reference();
        state.update_visibility_all(key_images);

        (state, report)
    }

    fn check(&self) -> Result<(), String> {
        if !(self.unconfirmed.indices_consistent()
            && self.available.indices_consistent()
            && self.spent.indices_consistent())
        {
            return Err("table indices out of sync".into());
        }

        let mut positions = HashSet::new();
        let mut multisig = HashSet::new();
        for (location, id, rec) in self.records() {
            let info = self.transactions.get(&rec.transaction_hash).ok_or_else(|| {
                format!("output {} belongs to unknown transaction {}", id, rec.transaction_hash)
            })?;
            if !positions.insert(rec.position()) {
                return Err(format!(
                    "output {}:{} stored twice",
                    rec.transaction_hash, rec.output_in_transaction
                ));
            }
            if rec.block != info.block() {
                return Err(format!("output {} disagrees with its transaction block", id));
            }
            let has_index = rec.global_output_index != UNCONFIRMED_TRANSACTION_GLOBAL_OUTPUT_INDEX;
            match location {
                Location::Unconfirmed if info.is_confirmed() => {
                    return Err(format!("unconfirmed output {} of a confirmed transaction", id));
                }
                Location::Available if !info.is_confirmed() => {
                    return Err(format!("available output {} of an unconfirmed transaction", id));
                }
                _ => {}
            }
            if info.is_confirmed() != has_index {
                return Err(format!("output {} global index disagrees with confirmation", id));
            }
            if rec.output_type() == OutputType::Multisignature
                && info.is_confirmed()
                && !multisig.insert(rec.descriptor())
            {
                return Err(format!(
                    "multisignature output (amount {}, global index {}) stored twice",
                    rec.amount, rec.global_output_index
                ));
            }
        }

        let mut spent_descriptors = HashSet::new();
        for (id, s) in self.spent.iter() {
            let spender = self
                .transactions
                .get(&s.spending_transaction_hash)
                .ok_or_else(|| format!("spent output {} has unknown spender", id))?;
            if spender.block() != s.spending_block {
                return Err(format!("spent output {} disagrees with its spender block", id));
            }
            if !spent_descriptors.insert(s.output.descriptor()) {
                return Err(format!("output {} spent twice", id));
            }
            if spender.is_confirmed() && !s.output.is_confirmed() {
                return Err(format!(
                    "output {} of unconfirmed transaction {} spent by confirmed {}",
                    id, s.output.transaction_hash, s.spending_transaction_hash
                ));
            }
            if spender.is_confirmed() && spender.block_height < s.output.block.height {
                return Err(format!(
                    "output {} spent at height {} before its creation at {}",
                    id, spender.block_height, s.output.block.height
                ));
            }
        }

        if let Some(hash) = self.safe.iter().find(|h| !self.transactions.contains_key(*h)) {
            return Err(format!("safe transaction {} is unknown", hash));
        }

        let mut heights: BTreeMap<u32, BTreeSet<Hash>> = BTreeMap::new();
        for tx in self.transactions.values() {
            heights.entry(tx.block_height).or_default().insert(tx.transaction_hash);
            if tx.is_confirmed() && tx.block_height > self.current_height {
                return Err(format!(
                    "transaction {} at height {} above current height {}",
                    tx.transaction_hash, tx.block_height, self.current_height
                ));
            }
        }
        if heights != self.heights {
            return Err("height index out of sync".into());
        }
        Ok(())
    }

    fn restore(&mut self, data: &[u8]) -> Result<RepairReport, TransfersError> {
        let snapshot = match snapshot::decode(data) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                *self = State::default();
                log::warn!("snapshot rejected: {}", e);
                return Err(e);
            }
        };
        let (state, report) = State::reconcile(snapshot);
        *self = state;
        if let Err(reason) = self.check() {
            *self = State::default();
            log::warn!("snapshot could not be reconciled: {}", reason);
            return Err(TransfersError::Unreconcilable(reason));
        }
        log::info!(
            "loaded {} transactions, {} outputs at height {}",
            self.transactions.len(),
            self.unconfirmed.len() + self.available.len() + self.spent.len(),
            self.current_height
        );
        Ok(report)
    }
}

// =============================================================================
// Container
// =============================================================================

/// Transfer index for one account.
pub struct TransfersContainer {
    currency: Arc<Currency>,
    transaction_spendable_age: u32,
    safe_transaction_spendable_age: u32,
    state: Mutex<State>,
}

impl TransfersContainer {
    pub fn new(
        currency: Arc<Currency>,
        transaction_spendable_age: u32,
        safe_transaction_spendable_age: u32,
    ) -> Self {
        Self {
            currency,
            transaction_spendable_age,
            safe_transaction_spendable_age,
            state: Mutex::new(State::default()),
        }
    }

    /// Container using the currency's default spendable ages.
    pub fn with_default_ages(currency: Arc<Currency>) -> Self {
        let age = currency.transaction_spendable_age;
        let safe_age = currency.safe_transaction_spendable_age;
        Self::new(currency, age, safe_age)
    }

    pub fn currency(&self) -> &Currency {
        &self.currency
    }

    pub fn transaction_spendable_age(&self) -> u32 {
        self.transaction_spendable_age
    }

    pub fn safe_transaction_spendable_age(&self) -> u32 {
        self.safe_transaction_spendable_age
    }

    // Every mutation validates before applying, so state behind a poisoned
    // lock is still whole.
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ─── Mutations ──────────────────────────────────────────────────────────

    /// Record a transaction and the outputs of it that belong to the account,
    /// and move outputs it spends to the spent table.
    ///
    /// Returns `Ok(false)` when nothing new was recorded: the transaction is
    /// already known with the same outputs, or it neither pays nor spends
    /// this account.
    pub fn submit_transaction<R: TransactionReader + ?Sized>(
        &self,
        block: &TransactionBlockInfo,
        tx: &R,
        outputs: &[RelevantOutput],
    ) -> Result<bool, TransfersError> {
        self.lock().submit(block, tx, outputs)
    }

    /// Promote an unconfirmed transaction, assigning `global_indices` to its
    /// waiting outputs in the order they were supplied.
    ///
    /// `Ok(false)` if the hash is unknown or already confirmed.
    pub fn confirm_transaction(
        &self,
        block: &TransactionBlockInfo,
        hash: &Hash,
        global_indices: &[u32],
    ) -> Result<bool, TransfersError> {
        self.lock().confirm(block, hash, global_indices)
    }

    pub fn delete_unconfirmed_transaction(&self, hash: &Hash) -> bool {
        self.lock().delete_unconfirmed(hash)
    }

    /// Undo everything at or above `height`. Returns the removed
    /// transactions, still-unconfirmed dependents first.
    pub fn rollback(&self, height: u32) -> Vec<Hash> {
        self.lock().rollback(height)
    }

    /// Move the current height forward. Returns false (and changes nothing)
    /// if `height` is below the current height.
    pub fn advance_height(&self, height: u32) -> bool {
        let mut state = self.lock();
        if height < state.current_height {
            return false;
        }
        state.current_height = height;
        true
    }

    /// Like [`advance_height`](Self::advance_height), also recording the
    /// block timestamp used to estimate chain time.
    pub fn advance_to_block(&self, height: u32, timestamp: u64) -> bool {
        let mut state = self.lock();
        if height < state.current_height {
            return false;
        }
        state.current_height = height;
        state.note_block(height, timestamp);
        true
    }

    /// Mark a known transaction safe. Idempotent; false for unknown hashes.
    pub fn mark_transaction_safe(&self, hash: &Hash) -> bool {
        let mut state = self.lock();
        if !state.transactions.contains_key(hash) {
            return false;
        }
        state.safe.insert(*hash);
        true
    }

    pub fn clear(&self) {
        *self.lock() = State::default();
    }

    // ─── Queries ────────────────────────────────────────────────────────────

    pub fn current_height(&self) -> u32 {
        self.lock().current_height
    }

    pub fn transfer_count(&self) -> usize {
        let state = self.lock();
        state.unconfirmed.len() + state.available.len() + state.spent.len()
    }

    pub fn transaction_count(&self) -> usize {
        self.lock().transactions.len()
    }

    /// Visible records matching `flags`. With `safe` set, lock state is
    /// evaluated with the safe spendable age unless the owning transaction
    /// is marked safe.
    fn matching<'s>(&self, state: &'s State, flags: TransferFlags, safe: bool) -> Vec<&'s OutputRecord> {
        let chain_time = state.chain_time(&self.currency);
        let age_of = |rec: &OutputRecord| {
            let age = if safe && !state.safe.contains(&rec.transaction_hash) {
                self.safe_transaction_spendable_age
            } else {
                self.transaction_spendable_age
            };
            let coinbase = state
                .transactions
                .get(&rec.transaction_hash)
                .is_some_and(|tx| tx.coinbase);
            if coinbase {
                age.max(self.currency.mined_money_unlock_window)
            } else {
                age
            }
        };
        let included = |rec: &OutputRecord, state_flag: TransferFlags| {
            rec.visible
                && flags.contains(TransferFlags::for_output_type(rec.output_type()))
                && flags.contains(state_flag)
        };

        let mut out = Vec::new();
        for (_, rec) in state.available.iter() {
            let unlocked = self.currency.is_output_unlocked(
                rec.unlock_time,
                rec.block.height,
                age_of(rec),
                state.current_height,
                chain_time,
            );
            let state_flag = if unlocked {
                TransferFlags::STATE_UNLOCKED
            } else {
                TransferFlags::STATE_LOCKED
            };
            if included(rec, state_flag) {
                out.push(rec);
            }
        }
        for (_, rec) in state.unconfirmed.iter() {
            if included(rec, TransferFlags::STATE_UNCONFIRMED) {
                out.push(rec);
            }
        }
        for (_, spent) in state.spent.iter() {
            if included(&spent.output, TransferFlags::STATE_SPENT) {
                out.push(&spent.output);
            }
        }
        out
    }

    pub fn balance(&self, flags: TransferFlags) -> u64 {
        let state = self.lock();
        self.matching(&state, flags, false)
            .iter()
            .fold(0u64, |acc, r| acc.saturating_add(r.amount))
    }

    pub fn list_outputs(&self, flags: TransferFlags) -> Vec<OutputRecord> {
        let state = self.lock();
        self.matching(&state, flags, false)
            .into_iter()
            .cloned()
            .collect()
    }

    /// [`balance`](Self::balance) evaluated with the safe spendable age.
    pub fn safe_balance(&self, flags: TransferFlags) -> u64 {
        let state = self.lock();
        self.matching(&state, flags, true)
            .iter()
            .fold(0u64, |acc, r| acc.saturating_add(r.amount))
    }

    pub fn safe_outputs(&self, flags: TransferFlags) -> Vec<OutputRecord> {
        let state = self.lock();
        self.matching(&state, flags, true)
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn transaction_info(&self, hash: &Hash) -> Option<TransactionDetails> {
        let state = self.lock();
        let info = state.transactions.get(hash)?.clone();
        let amount_out = state
            .outputs_of(hash)
            .iter()
            .fold(0u64, |acc, (_, _, r)| acc.saturating_add(r.amount));
        let amount_in = state
            .spent
            .ids_by_spending_transaction(hash)
            .into_iter()
            .filter_map(|id| state.spent.get(id))
            .fold(0u64, |acc, s| acc.saturating_add(s.output.amount));
        Some(TransactionDetails {
            info,
            amount_in,
            amount_out,
        })
    }

    /// All known transactions in chain order, unconfirmed last.
    pub fn transactions(&self) -> Vec<TransactionInformation> {
        self.lock().to_snapshot().transactions
    }

    pub fn transaction_outputs(&self, hash: &Hash, flags: TransferFlags) -> Vec<OutputRecord> {
        let state = self.lock();
        self.matching(&state, flags, false)
            .into_iter()
            .filter(|r| r.transaction_hash == *hash)
            .cloned()
            .collect()
    }

    /// Outputs spent by `hash`, filtered by the kind bits of `flags`.
    pub fn transaction_inputs(&self, hash: &Hash, flags: TransferFlags) -> Vec<SpentOutputRecord> {
        let state = self.lock();
        state
            .spent
            .ids_by_spending_transaction(hash)
            .into_iter()
            .filter_map(|id| state.spent.get(id))
            .filter(|s| flags.contains(TransferFlags::for_output_type(s.output.output_type())))
            .cloned()
            .collect()
    }

    pub fn unconfirmed_transactions(&self) -> Vec<Hash> {
        self.lock()
            .heights
            .get(&UNCONFIRMED_TRANSACTION_HEIGHT)
            .map(|hashes| hashes.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn spent_outputs(&self) -> Vec<SpentOutputRecord> {
        self.lock().spent.iter().map(|(_, s)| s.clone()).collect()
    }

    /// Hashes marked safe, ascending.
    pub fn safe_transactions(&self) -> Vec<Hash> {
        self.lock().safe.iter().copied().collect()
    }

    /// Verify every structural invariant of the index.
    pub fn check_invariants(&self) -> Result<(), TransfersError> {
        self.lock().check().map_err(TransfersError::Unreconcilable)
    }

    // ─── Persistence ────────────────────────────────────────────────────────

    pub fn snapshot(&self) -> Snapshot {
        self.lock().to_snapshot()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        snapshot::encode(&self.lock().to_snapshot())
    }

    pub fn save<W: Write>(&self, writer: &mut W) -> Result<(), TransfersError> {
        let state = self.lock();
        writer.write_all(&snapshot::encode(&state.to_snapshot()))?;
        writer.flush()?;
        Ok(())
    }

    /// Replace the contents with a snapshot, repairing what can be repaired.
    /// On failure the container is left empty.
    pub fn load<R: Read>(&self, reader: &mut R) -> Result<RepairReport, TransfersError> {
        let mut state = self.lock();
        let mut data = Vec::new();
        if let Err(e) = reader.read_to_end(&mut data) {
            *state = State::default();
            return Err(e.into());
        }
        state.restore(&data)
    }

    pub fn load_bytes(&self, data: &[u8]) -> Result<RepairReport, TransfersError> {
        self.lock().restore(data)
    }
}

impl std::fmt::Debug for TransfersContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("TransfersContainer")
            .field("current_height", &state.current_height)
            .field("transactions", &state.transactions.len())
            .field("unconfirmed", &state.unconfirmed.len())
            .field("available", &state.available.len())
            .field("spent", &state.spent.len())
            .finish()
    }
}
