//! Hash-chain encoding of the audit log.
//!
//! Each record is one line: `<hash-hex>\t<entry-json>\n`, where
//! `hash = SHA-256(prev_hash_hex || entry_json)`. The hash covers the exact
//! JSON bytes on disk, so any altered byte changes it.

use super::entry::AuditLogEntry;
use sha2::{Digest, Sha256};

/// Previous-hash value of the first entry.
pub const GENESIS_PREV_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

pub fn chain_hash(prev_hash: &str, entry_json: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash.as_bytes());
    hasher.update(entry_json);
    format!("{:x}", hasher.finalize())
}

pub fn encode_line(hash: &str, entry_json: &str) -> String {
    format!("{}\t{}\n", hash, entry_json)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainLink {
    pub entry: AuditLogEntry,
    pub hash: String,
    pub json: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainVerdict {
    Intact,
    /// First entry whose stored data does not match the chain.
    Broken { sequence: u64 },
}

/// Parse and verify a serialized log. Returns the links verified before
/// any break, plus the verdict.
pub fn verify(data: &[u8]) -> (Vec<ChainLink>, ChainVerdict) {
    let mut links = Vec::new();
    if data.is_empty() {
        return (links, ChainVerdict::Intact);
    }

    let Some(body) = data.strip_suffix(b"\n") else {
        // A final line without its newline is a partial or altered write.
        let sequence = data.iter().filter(|b| **b == b'\n').count() as u64;
        return (links, ChainVerdict::Broken { sequence });
    };

    let mut prev_hash = GENESIS_PREV_HASH.to_string();
    for (index, line) in body.split(|b| *b == b'\n').enumerate() {
        let sequence = index as u64;
        match check_link(line, sequence, &prev_hash) {
            Some(link) => {
                prev_hash = link.hash.clone();
                links.push(link);
            }
            None => return (links, ChainVerdict::Broken { sequence }),
        }
    }
    (links, ChainVerdict::Intact)
}

fn check_link(line: &[u8], sequence: u64, prev_hash: &str) -> Option<ChainLink> {
    let line = std::str::from_utf8(line).ok()?;
    let (hash, json) = line.split_once('\t')?;
    if chain_hash(prev_hash, json.as_bytes()) != hash {
        return None;
    }
    let entry: AuditLogEntry = serde_json::from_str(json).ok()?;
    if entry.sequence != sequence || entry.prev_hash != prev_hash {
        return None;
    }
    Some(ChainLink {
        entry,
        hash: hash.to_string(),
        json: json.to_string(),
    })
}
