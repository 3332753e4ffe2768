use super::{OperationItem, Result, TxError};
use serde::Serialize;

const FNV_OFFSET_BASIS: u64 = 14695981039346656037;
const FNV_PRIME: u64 = 1099511628211;

/// FNV-1a over raw bytes. Stable across processes and platforms.
pub fn fnv1a64(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for byte in bytes {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Hash of a value's canonical JSON encoding.
///
/// `serde_json` maps are ordered, so equal values always hash equal.
pub fn checksum_of<T: Serialize + ?Sized>(value: &T) -> Result<u64> {
    let bytes = serde_json::to_vec(value)
        .map_err(|err| TxError::Serialization(format!("checksum encode: {}", err)))?;
    Ok(fnv1a64(&bytes))
}

pub fn item_checksum(item: &OperationItem) -> Result<u64> {
    checksum_of(item)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fnv_known_vector() {
        assert_eq!(fnv1a64(b""), FNV_OFFSET_BASIS);
        assert_eq!(fnv1a64(b"a"), 0xaf63dc4c8601ec8c);
    }

    #[test]
    fn test_item_checksum_ignores_key_insertion_order() {
        let a = OperationItem::update("i1", "doc")
            .with_payload(json!({"title": "x", "body": "y"}));
        let b = OperationItem::update("i1", "doc")
            .with_payload(json!({"body": "y", "title": "x"}));
        assert_eq!(item_checksum(&a).unwrap(), item_checksum(&b).unwrap());

        let c = OperationItem::update("i1", "doc").with_payload(json!({"title": "z"}));
        assert_ne!(item_checksum(&a).unwrap(), item_checksum(&c).unwrap());
    }
}
