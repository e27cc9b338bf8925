//! Script plumbing for the consensus engine.
//!
//! Script execution itself is an external collaborator behind [`ScriptVerifier`].
//! This module owns what consensus needs without running scripts: signature
//! operation counting for mass, and fanning input checks out over a worker pool.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;

use crate::core::codec::Encodable;
use crate::core::hash::Hash;
use crate::core::types::Transaction;

/// Opcodes that matter for sig-op counting and push parsing.
pub const OP_PUSHDATA1: u8 = 0x4c;
pub const OP_PUSHDATA2: u8 = 0x4d;
pub const OP_PUSHDATA4: u8 = 0x4e;
pub const OP_CHECKSIG: u8 = 0xac;
pub const OP_CHECKSIGVERIFY: u8 = 0xad;
pub const OP_CHECKMULTISIG: u8 = 0xae;
pub const OP_CHECKMULTISIGVERIFY: u8 = 0xaf;

/// Sig-op weight of an un-analysed multisig.
pub const MAX_PUBKEYS_PER_MULTISIG: u64 = 20;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScriptError {
    #[error("malformed script: {0}")]
    Malformed(String),
    #[error("script failed: {0}")]
    Failed(String),
}

bitflags::bitflags! {
    /// Verification flags passed through to the script engine.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ScriptFlags: u32 {
        const NONE = 0;
        const VERIFY_STRICT_ENCODING = 1 << 0;
        const VERIFY_CLEAN_STACK = 1 << 1;
    }
}

/// Shared cache of signature checks that already succeeded.
#[derive(Debug, Default)]
pub struct SigCache {
    entries: Mutex<HashSet<Hash>>,
    max_entries: usize,
}

impl SigCache {
    pub fn new(max_entries: usize) -> Self {
        SigCache { entries: Mutex::new(HashSet::new()), max_entries }
    }

    pub fn contains(&self, key: &Hash) -> bool {
        self.entries.lock().contains(key)
    }

    pub fn insert(&self, key: Hash) {
        let mut entries = self.entries.lock();
        if entries.len() >= self.max_entries {
            // Evict an arbitrary entry; the cache is only an accelerator.
            if let Some(victim) = entries.iter().next().copied() {
                entries.remove(&victim);
            }
        }
        entries.insert(key);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// External script engine.
pub trait ScriptVerifier: Send + Sync {
    fn verify(
        &self,
        script_sig: &[u8],
        prev_script_pub_key: &[u8],
        tx_bytes: &[u8],
        input_index: usize,
        flags: ScriptFlags,
        sig_cache: Option<&SigCache>,
    ) -> Result<(), ScriptError>;
}

/// Verifier that accepts every input. For networks and tests that do not
/// exercise scripts.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAllVerifier;

impl ScriptVerifier for AcceptAllVerifier {
    fn verify(
        &self,
        _script_sig: &[u8],
        _prev_script_pub_key: &[u8],
        _tx_bytes: &[u8],
        _input_index: usize,
        _flags: ScriptFlags,
        _sig_cache: Option<&SigCache>,
    ) -> Result<(), ScriptError> {
        Ok(())
    }
}

// ─── Sig-op counting ─────────────────────────────────────────────────

/// Counts signature operations by walking opcodes and skipping pushed data.
/// A truncated push ends the walk, counting what was seen so far.
pub fn count_sig_ops(script: &[u8]) -> u64 {
    let mut count = 0u64;
    let mut pos = 0usize;
    while pos < script.len() {
        let op = script[pos];
        pos += 1;
        let push_len = match op {
            0x01..=0x4b => op as usize,
            OP_PUSHDATA1 => match read_push_len(script, &mut pos, 1) {
                Some(n) => n,
                None => break,
            },
            OP_PUSHDATA2 => match read_push_len(script, &mut pos, 2) {
                Some(n) => n,
                None => break,
            },
            OP_PUSHDATA4 => match read_push_len(script, &mut pos, 4) {
                Some(n) => n,
                None => break,
            },
            OP_CHECKSIG | OP_CHECKSIGVERIFY => {
                count += 1;
                0
            }
            OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
                count += MAX_PUBKEYS_PER_MULTISIG;
                0
            }
            _ => 0,
        };
        pos = pos.saturating_add(push_len);
    }
    count
}

fn read_push_len(script: &[u8], pos: &mut usize, width: usize) -> Option<usize> {
    let bytes = script.get(*pos..*pos + width)?;
    *pos += width;
    let mut buf = [0u8; 4];
    buf[..width].copy_from_slice(bytes);
    Some(u32::from_le_bytes(buf) as usize)
}

// ─── Parallel verification ───────────────────────────────────────────

/// One input to verify: the spending tx, the input index and the script it spends.
pub struct ScriptJob<'a> {
    pub tx: &'a Transaction,
    pub input_index: usize,
    pub prev_script_pub_key: &'a [u8],
}

/// The first failing input, identified by its spending tx.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptFailure {
    pub tx_id: Hash,
    pub input_index: usize,
    pub error: ScriptError,
}

/// Verify every job on up to `threads` workers. The first failure stops the
/// remaining workers; success means every input verified.
pub fn verify_scripts_parallel(
    jobs: &[ScriptJob<'_>],
    verifier: &dyn ScriptVerifier,
    flags: ScriptFlags,
    sig_cache: Option<&SigCache>,
    threads: usize,
) -> Result<(), ScriptFailure> {
    if jobs.is_empty() {
        return Ok(());
    }

    let threads = threads.clamp(1, jobs.len());
    let next = AtomicUsize::new(0);
    let stop = AtomicBool::new(false);
    let (tx, rx) = mpsc::channel::<ScriptFailure>();

    std::thread::scope(|scope| {
        for _ in 0..threads {
            let tx = tx.clone();
            let next = &next;
            let stop = &stop;
            scope.spawn(move || {
                // Serialized once per tx per worker.
                let mut cached: Option<(Hash, Vec<u8>)> = None;
                loop {
                    if stop.load(Ordering::Relaxed) {
                        return;
                    }
                    let i = next.fetch_add(1, Ordering::Relaxed);
                    let Some(job) = jobs.get(i) else {
                        return;
                    };

                    let tx_id = job.tx.id();
                    if cached.as_ref().map(|(id, _)| *id) != Some(tx_id) {
                        cached = Some((tx_id, job.tx.to_bytes()));
                    }
                    let tx_bytes = cached.as_ref().map(|(_, b)| b.as_slice()).unwrap_or_default();
                    let script_sig = &job.tx.inputs[job.input_index].signature_script;

                    if let Err(error) = verifier.verify(
                        script_sig,
                        job.prev_script_pub_key,
                        tx_bytes,
                        job.input_index,
                        flags,
                        sig_cache,
                    ) {
                        stop.store(true, Ordering::Relaxed);
                        let _ = tx.send(ScriptFailure { tx_id, input_index: job.input_index, error });
                        return;
                    }
                }
            });
        }
    });

    drop(tx);
    match rx.recv() {
        Ok(failure) => Err(failure),
        Err(_) => Ok(()),
    }
}
