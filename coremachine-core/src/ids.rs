use serde_json::Value;
use sha2::{Digest, Sha256};

/// Render a JSON value in canonical form: compact, with object keys sorted.
///
/// serde_json's default `Map` is backed by a `BTreeMap`, so re-building the
/// value through it yields sorted keys at every nesting level. Numbers and
/// strings serialize verbatim.
pub fn canonical_json(value: &Value) -> String {
    fn sort(value: &Value) -> Value {
        match value {
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), sort(v)))
                    .collect::<serde_json::Map<String, Value>>(),
            ),
            Value::Array(items) => Value::Array(items.iter().map(sort).collect()),
            other => other.clone(),
        }
    }

    sort(value).to_string()
}

fn hex_digest(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// The idempotency key for a job: identical `(job_type, params)` submissions
/// always produce the same 64-hex fingerprint.
pub fn job_fingerprint(job_type: &str, params: &Value) -> String {
    hex_digest(&format!("{}:{}", job_type, canonical_json(params)))
}

/// Deterministic task id from its coordinates, so re-planning a stage yields
/// identical ids and a crashed partial enqueue can resume.
pub fn task_fingerprint(job_id: &str, stage: u32, task_index: &str) -> String {
    hex_digest(&format!("{}:{}:{}", job_id, stage, task_index))
}

/// The version-lineage key. version_id is deliberately excluded so that
/// different versions of the same resource share a lineage.
pub fn lineage_fingerprint(platform_id: &str, dataset_id: &str, resource_id: &str) -> String {
    hex_digest(&format!("{}:{}:{}", platform_id, dataset_id, resource_id))
}

/// Derive a `pg_advisory_xact_lock` key from an arbitrary scope string.
/// First 8 bytes of the digest, big-endian.
pub fn advisory_lock_key(scope: &str) -> i64 {
    let mut hasher = Sha256::new();
    hasher.update(scope.as_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}
