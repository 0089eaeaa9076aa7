//! Binary snapshot format for the transfer index.
//!
//! Layout: version varint, then the transaction, unconfirmed, available and
//! spent tables (each a count followed by records in id order), then the
//! safe-transaction set (count + hashes), then the current height.
//! Integers are LEB128 varints; keys and hashes are raw 32 bytes.

use crate::error::TransfersError;
use crate::records::{
    OutputRecord, OutputTarget, SpentOutputRecord, TransactionBlockInfo, TransactionInformation,
};
use societatis_types::hash::KEY_SIZE;
use societatis_types::{Hash, KeyImage, PublicKey};

pub const SNAPSHOT_VERSION: u32 = 1;

const TARGET_KEY: u8 = 0;
const TARGET_MULTISIGNATURE: u8 = 1;

/// Plain-data image of a transfer index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub transactions: Vec<TransactionInformation>,
    pub unconfirmed: Vec<OutputRecord>,
    pub available: Vec<OutputRecord>,
    pub spent: Vec<SpentOutputRecord>,
    pub safe: Vec<Hash>,
    pub current_height: u32,
}

// =============================================================================
// Writer
// =============================================================================

pub(crate) struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub(crate) fn new() -> Self {
        Self {
            buf: Vec::with_capacity(1024),
        }
    }

    pub(crate) fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    pub(crate) fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub(crate) fn write_varint(&mut self, mut value: u64) {
        loop {
            let mut byte = (value & 0x7F) as u8;
            value >>= 7;
            if value != 0 {
                byte |= 0x80;
            }
            self.buf.push(byte);
            if value == 0 {
                break;
            }
        }
    }

    pub(crate) fn write_key(&mut self, key: &[u8; KEY_SIZE]) {
        self.buf.extend_from_slice(key);
    }

    pub(crate) fn write_bytes(&mut self, bytes: &[u8]) {
        self.write_varint(bytes.len() as u64);
        self.buf.extend_from_slice(bytes);
    }

    fn write_block(&mut self, block: &TransactionBlockInfo) {
        self.write_varint(block.height as u64);
        self.write_varint(block.timestamp);
        self.write_varint(block.transaction_index as u64);
    }

    fn write_transaction(&mut self, tx: &TransactionInformation) {
        self.write_key(tx.transaction_hash.as_bytes());
        self.write_key(tx.public_key.as_bytes());
        self.write_block(&tx.block());
        self.write_varint(tx.unlock_time);
        self.write_varint(tx.total_amount_in);
        self.write_varint(tx.total_amount_out);
        self.write_bytes(&tx.extra);
        match &tx.payment_id {
            Some(id) => {
                self.write_u8(1);
                self.write_key(id.as_bytes());
            }
            None => self.write_u8(0),
        }
        self.write_u8(tx.coinbase as u8);
    }

    fn write_output(&mut self, out: &OutputRecord) {
        self.write_varint(out.amount);
        self.write_varint(out.global_output_index as u64);
        self.write_varint(out.output_in_transaction as u64);
        self.write_key(out.transaction_hash.as_bytes());
        self.write_key(out.transaction_public_key.as_bytes());
        match &out.target {
            OutputTarget::Key {
                output_key,
                key_image,
            } => {
                self.write_u8(TARGET_KEY);
                self.write_key(output_key.as_bytes());
                self.write_key(key_image.as_bytes());
            }
            OutputTarget::Multisignature {
                required_signatures,
            } => {
                self.write_u8(TARGET_MULTISIGNATURE);
                self.write_varint(*required_signatures as u64);
            }
        }
        self.write_varint(out.unlock_time);
        self.write_block(&out.block);
        self.write_u8(out.visible as u8);
    }

    fn write_spent(&mut self, spent: &SpentOutputRecord) {
        self.write_output(&spent.output);
        self.write_block(&spent.spending_block);
        self.write_key(spent.spending_transaction_hash.as_bytes());
        self.write_varint(spent.input_in_transaction as u64);
    }
}

// =============================================================================
// Reader
// =============================================================================

pub(crate) struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

fn eof() -> TransfersError {
    TransfersError::Snapshot("unexpected EOF".into())
}

impl<'a> Reader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub(crate) fn read_u8(&mut self) -> Result<u8, TransfersError> {
        let v = *self.data.get(self.pos).ok_or_else(eof)?;
        self.pos += 1;
        Ok(v)
    }

    pub(crate) fn read_varint(&mut self) -> Result<u64, TransfersError> {
        let mut value: u64 = 0;
        let mut shift: u32 = 0;
        loop {
            let byte = self.read_u8()?;
            if shift == 63 && byte > 1 {
                return Err(TransfersError::Snapshot("varint overflow".into()));
            }
            value |= ((byte & 0x7F) as u64) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
            if shift > 63 {
                return Err(TransfersError::Snapshot("varint overflow".into()));
            }
        }
    }

    pub(crate) fn read_u32(&mut self) -> Result<u32, TransfersError> {
        let v = self.read_varint()?;
        u32::try_from(v).map_err(|_| TransfersError::Snapshot(format!("value {} exceeds u32", v)))
    }

    /// Element count, bounded by the bytes left so corrupt input cannot
    /// request a huge allocation.
    pub(crate) fn read_count(&mut self) -> Result<usize, TransfersError> {
        let n = self.read_varint()?;
        if n > self.remaining() as u64 {
            return Err(TransfersError::Snapshot(format!(
                "count {} exceeds remaining {} bytes",
                n,
                self.remaining()
            )));
        }
        Ok(n as usize)
    }

    pub(crate) fn read_key(&mut self) -> Result<[u8; KEY_SIZE], TransfersError> {
        let end = self.pos + KEY_SIZE;
        let slice = self.data.get(self.pos..end).ok_or_else(eof)?;
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(slice);
        self.pos = end;
        Ok(key)
    }

    pub(crate) fn read_bytes(&mut self) -> Result<Vec<u8>, TransfersError> {
        let n = self.read_count()?;
        let v = self.data[self.pos..self.pos + n].to_vec();
        self.pos += n;
        Ok(v)
    }

    fn read_bool(&mut self) -> Result<bool, TransfersError> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            b => Err(TransfersError::Snapshot(format!("invalid bool byte {}", b))),
        }
    }

    fn read_block(&mut self) -> Result<TransactionBlockInfo, TransfersError> {
        Ok(TransactionBlockInfo {
            height: self.read_u32()?,
            timestamp: self.read_varint()?,
            transaction_index: self.read_u32()?,
        })
    }

    fn read_transaction(&mut self) -> Result<TransactionInformation, TransfersError> {
        let transaction_hash = Hash::new(self.read_key()?);
        let public_key = PublicKey::new(self.read_key()?);
        let block = self.read_block()?;
        let unlock_time = self.read_varint()?;
        let total_amount_in = self.read_varint()?;
        let total_amount_out = self.read_varint()?;
        let extra = self.read_bytes()?;
        let payment_id = if self.read_bool()? {
            Some(Hash::new(self.read_key()?))
        } else {
            None
        };
        let coinbase = self.read_bool()?;
        Ok(TransactionInformation {
            transaction_hash,
            public_key,
            block_height: block.height,
            timestamp: block.timestamp,
            transaction_index: block.transaction_index,
            unlock_time,
            total_amount_in,
            total_amount_out,
            extra,
            payment_id,
            coinbase,
        })
    }

    fn read_output(&mut self) -> Result<OutputRecord, TransfersError> {
        let amount = self.read_varint()?;
        let global_output_index = self.read_u32()?;
        let output_in_transaction = self.read_u32()?;
        let transaction_hash = Hash::new(self.read_key()?);
        let transaction_public_key = PublicKey::new(self.read_key()?);
        let target = match self.read_u8()? {
            TARGET_KEY => OutputTarget::Key {
                output_key: PublicKey::new(self.read_key()?),
                key_image: KeyImage::new(self.read_key()?),
            },
            TARGET_MULTISIGNATURE => OutputTarget::Multisignature {
                required_signatures: self.read_u32()?,
            },
            tag => {
                return Err(TransfersError::Snapshot(format!(
                    "unknown output target tag {}",
                    tag
                )))
            }
        };
        Ok(OutputRecord {
            amount,
            global_output_index,
            output_in_transaction,
            transaction_hash,
            transaction_public_key,
            target,
            unlock_time: self.read_varint()?,
            block: self.read_block()?,
            visible: self.read_bool()?,
        })
    }

    fn read_spent(&mut self) -> Result<SpentOutputRecord, TransfersError> {
        Ok(SpentOutputRecord {
            output: self.read_output()?,
            spending_block: self.read_block()?,
            spending_transaction_hash: Hash::new(self.read_key()?),
            input_in_transaction: self.read_u32()?,
        })
    }

    fn read_list<T>(
        &mut self,
        mut f: impl FnMut(&mut Self) -> Result<T, TransfersError>,
    ) -> Result<Vec<T>, TransfersError> {
        let n = self.read_count()?;
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(f(self)?);
        }
        Ok(out)
    }
}

// =============================================================================
// Public API
// =============================================================================

pub fn encode(snapshot: &Snapshot) -> Vec<u8> {
    let mut w = Writer::new();
    w.write_varint(SNAPSHOT_VERSION as u64);

    w.write_varint(snapshot.transactions.len() as u64);
    for tx in &snapshot.transactions {
        w.write_transaction(tx);
    }
    w.write_varint(snapshot.unconfirmed.len() as u64);
    for out in &snapshot.unconfirmed {
        w.write_output(out);
    }
    w.write_varint(snapshot.available.len() as u64);
    for out in &snapshot.available {
        w.write_output(out);
    }
    w.write_varint(snapshot.spent.len() as u64);
    for spent in &snapshot.spent {
        w.write_spent(spent);
    }
    w.write_varint(snapshot.safe.len() as u64);
    for hash in &snapshot.safe {
        w.write_key(hash.as_bytes());
    }
    w.write_varint(snapshot.current_height as u64);
    w.into_inner()
}

pub fn decode(data: &[u8]) -> Result<Snapshot, TransfersError> {
    let mut r = Reader::new(data);
    let snapshot = decode_from(&mut r)?;
    if r.remaining() != 0 {
        return Err(TransfersError::Snapshot(format!(
            "{} trailing bytes",
            r.remaining()
        )));
    }
    Ok(snapshot)
}

pub(crate) fn decode_from(r: &mut Reader<'_>) -> Result<Snapshot, TransfersError> {
    let version = r.read_u32()?;
    if version != SNAPSHOT_VERSION {
        return Err(TransfersError::UnsupportedSnapshotVersion(version));
    }
    Ok(Snapshot {
        transactions: r.read_list(Reader::read_transaction)?,
        unconfirmed: r.read_list(Reader::read_output)?,
        available: r.read_list(Reader::read_output)?,
        spent: r.read_list(Reader::read_spent)?,
        safe: r.read_list(|r| r.read_key().map(Hash::new))?,
        current_height: r.read_u32()?,
    })
}
