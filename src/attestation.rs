//! Attestation chain and checkpoint continuation protocol (spec.md §4.6).
//!
//! `chain_hash_i = H(chain_hash_{i-1} || H(canonical(entry_i)))`, starting
//! from a well-known genesis hash. A checkpoint lets a caller resume a paged
//! export and verify nothing was inserted or reordered underneath them:
//! `checkpoint_hash = H(attestation_chain_hash || next_cursor ||
//! context_fingerprint)`.

use crate::canonical::{chain_hash, hex_sha256};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Chain hash of an empty sequence — the starting point for a fresh chain.
pub fn genesis() -> String {
    hex_sha256(b"")
}

/// Fold a sequence of canonical-JSON entries into a single attestation chain
/// hash, starting from `previous_chain_hash` (pass [`genesis`] for a fresh
/// chain).
pub fn fold_chain(previous_chain_hash: &str, entries: &[Value]) -> String {
    let mut chain = previous_chain_hash.to_string();
    for entry in entries {
        let entry_hash = hex_sha256(&crate::canonical::canonical_bytes(entry));
        chain = chain_hash(&[&chain, &entry_hash]);
    }
    chain
}

/// Start a new attestation chain from genesis.
pub fn fold_chain_from_genesis(entries: &[Value]) -> String {
    fold_chain(&genesis(), entries)
}

/// An attestation over one export page: the final chain hash after folding
/// in every entry on this page, plus the running chain hash that preceded
/// this page (so a verifier can independently re-derive it entry by entry),
/// and the `key_id`/`signature` pair spec.md §3 and §4.6 require every
/// export to carry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attestation {
    pub previous_chain_hash: String,
    pub chain_hash: String,
    pub entry_count: usize,
    pub key_id: String,
    pub signature: String,
}

/// Signs an attestation's chain hash with a configured key. Real signature
/// schemes are out of scope (spec.md §1 Non-goals); this is the same
/// deterministic stand-in `compensation.rs::sign_receipt` uses for receipts:
/// `H(chain_hash || key_id || secret)`.
#[derive(Debug, Clone)]
pub struct AttestationSigner {
    pub key_id: String,
    secret: String,
}

impl AttestationSigner {
    pub fn new(key_id: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            key_id: key_id.into(),
            secret: secret.into(),
        }
    }

    fn sign(&self, chain_hash: &str) -> String {
        let mut bytes = chain_hash.as_bytes().to_vec();
        bytes.extend_from_slice(self.key_id.as_bytes());
        bytes.extend_from_slice(self.secret.as_bytes());
        hex_sha256(&bytes)
    }
}

pub fn attest(previous_chain_hash: &str, entries: &[Value], signer: &AttestationSigner) -> Attestation {
    let chain_hash = fold_chain(previous_chain_hash, entries);
    let signature = signer.sign(&chain_hash);
    Attestation {
        previous_chain_hash: previous_chain_hash.to_string(),
        chain_hash,
        entry_count: entries.len(),
        key_id: signer.key_id.clone(),
        signature,
    }
}

/// A resumable checkpoint binding an attestation chain hash to a cursor and
/// a caller-supplied fingerprint of the export's filter context (tenant,
/// kind, retention cutoff, and any other parameters that must stay stable
/// across pages for the checkpoint to mean anything).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub next_cursor: Option<String>,
    pub context_fingerprint: String,
    pub checkpoint_hash: String,
}

pub fn make_checkpoint(
    attestation_chain_hash: &str,
    next_cursor: Option<&str>,
    context_fingerprint: &str,
) -> Checkpoint {
    let checkpoint_hash = chain_hash(&[
        attestation_chain_hash,
        next_cursor.unwrap_or(""),
        context_fingerprint,
    ]);
    Checkpoint {
        next_cursor: next_cursor.map(str::to_string),
        context_fingerprint: context_fingerprint.to_string(),
        checkpoint_hash,
    }
}

/// Recompute a context fingerprint from the stable export parameters, so a
/// checkpoint presented on a later call can be checked against the caller's
/// current filter before resuming.
pub fn context_fingerprint(parts: &[&str]) -> String {
    hex_sha256(parts.join("\u{1f}").as_bytes())
}

pub fn verify_checkpoint(
    checkpoint: &Checkpoint,
    attestation_chain_hash: &str,
    context_fingerprint: &str,
) -> bool {
    checkpoint.context_fingerprint == context_fingerprint
        && checkpoint.checkpoint_hash
            == chain_hash(&[
                attestation_chain_hash,
                checkpoint.next_cursor.as_deref().unwrap_or(""),
                context_fingerprint,
            ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn chain_hash_depends_on_entry_order() {
        let a = fold_chain_from_genesis(&[json!({"x": 1}), json!({"x": 2})]);
        let b = fold_chain_from_genesis(&[json!({"x": 2}), json!({"x": 1})]);
        assert_ne!(a, b);
    }

    #[test]
    fn folding_incrementally_matches_folding_all_at_once() {
        let entries = vec![json!({"x": 1}), json!({"x": 2}), json!({"x": 3})];
        let all_at_once = fold_chain_from_genesis(&entries);

        let mid = fold_chain_from_genesis(&entries[..2]);
        let incremental = fold_chain(&mid, &entries[2..]);
        assert_eq!(all_at_once, incremental);
    }

    #[test]
    fn checkpoint_round_trips_through_verify() {
        let chain = fold_chain_from_genesis(&[json!({"x": 1})]);
        let fp = context_fingerprint(&["tenant-1", "decision", "30"]);
        let checkpoint = make_checkpoint(&chain, Some("cursor-2"), &fp);
        assert!(verify_checkpoint(&checkpoint, &chain, &fp));
    }

    #[test]
    fn checkpoint_rejects_mismatched_fingerprint() {
        let chain = fold_chain_from_genesis(&[json!({"x": 1})]);
        let fp = context_fingerprint(&["tenant-1", "decision", "30"]);
        let checkpoint = make_checkpoint(&chain, Some("cursor-2"), &fp);
        let other_fp = context_fingerprint(&["tenant-2", "decision", "30"]);
        assert!(!verify_checkpoint(&checkpoint, &chain, &other_fp));
    }

    #[test]
    fn attest_carries_key_id_and_a_signature_bound_to_the_chain_hash() {
        let signer = AttestationSigner::new("key-1", "shh");
        let a = attest(&genesis(), &[json!({"x": 1})], &signer);
        assert_eq!(a.key_id, "key-1");
        assert!(!a.signature.is_empty());

        let other_signer = AttestationSigner::new("key-2", "shh");
        let b = attest(&genesis(), &[json!({"x": 1})], &other_signer);
        assert_eq!(a.chain_hash, b.chain_hash);
        assert_ne!(a.signature, b.signature);
        assert_ne!(a.key_id, b.key_id);
    }
}
