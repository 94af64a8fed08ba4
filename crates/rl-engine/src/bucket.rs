use sha2::{Digest, Sha256};
use std::collections::HashMap;

const EMPTY_BUCKET: &str = "ctx:empty";
const MAX_READABLE_LEN: usize = 200;

/// Canonical bandit bucket for a request context.
///
/// Keys and values are trimmed and lowercased, then joined as sorted
/// `k=v` pairs: `ctx:country=us|device=mobile`. Keys past the readable
/// length are truncated and suffixed with a short content hash so distinct
/// contexts stay distinct.
pub fn bucket_key(context: &HashMap<String, String>) -> String {
    let mut parts: Vec<(String, String)> = context
        .iter()
        .map(|(k, v)| (k.trim().to_lowercase(), v.trim().to_lowercase()))
        .filter(|(k, _)| !k.is_empty())
        .collect();
    if parts.is_empty() {
        return EMPTY_BUCKET.to_string();
    }
    parts.sort();

    let joined = parts
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("|");
    let raw = format!("ctx:{joined}");
    if raw.len() <= MAX_READABLE_LEN {
        return raw;
    }

    let digest = Sha256::digest(raw.as_bytes());
    let mut cut = MAX_READABLE_LEN;
    while !raw.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}|h={}", &raw[..cut], hex::encode(&digest[..8]))
}
