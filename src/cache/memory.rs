//! メモリバックエンド
//!
//! レスポンスボディを不変バッファとしてメモリに保持するストレージです。
//! 取得したボディハンドルはバッファを共有するため、エビクト後も
//! 既存のリーダーは影響を受けません。

use super::header::HeaderMap;
use super::lru::{CappedLru, EntrySize};
use super::storage::{Body, Storage, StoreError, StoreResult, StoredResponse};
use std::sync::Arc;

#[derive(Clone)]
struct MemoryEntry {
    status: u16,
    header: HeaderMap,
    body: Arc<[u8]>,
}

impl EntrySize for MemoryEntry {
    fn size(&self) -> u64 {
        self.body.len() as u64
    }
}

/// メモリストレージ
pub struct MemoryStorage {
    items: CappedLru<MemoryEntry>,
}

impl MemoryStorage {
    /// 指定容量（バイト）で作成。0で無制限。
    pub fn new(capacity: u64) -> Self {
        Self {
            items: CappedLru::new(capacity),
        }
    }
}

impl Storage for MemoryStorage {
    fn store(&self, key: &str, res: StoredResponse) -> StoreResult<()> {
        // メモリボディは共有バッファをそのまま引き継ぐ
        let body: Arc<[u8]> = match res.body {
            Body::Memory(data) => data,
            other => other.read_all()?.into(),
        };

        self.items.insert(
            key.to_string(),
            MemoryEntry {
                status: res.status,
                header: res.header,
                body,
            },
        );
        Ok(())
    }

    fn get(&self, key: &str) -> StoreResult<StoredResponse> {
        let entry = self.items.get(key).ok_or(StoreError::NotFound)?;
        Ok(StoredResponse {
            status: entry.status,
            header: entry.header,
            body: Body::Memory(entry.body),
        })
    }

    fn get_meta(&self, key: &str) -> StoreResult<(u16, HeaderMap)> {
        let entry = self.items.get(key).ok_or(StoreError::NotFound)?;
        Ok((entry.status, entry.header))
    }

    fn freshen(&self, key: &str, status: u16, header: HeaderMap) -> StoreResult<()> {
        self.items
            .with_mut(key, |entry| {
                entry.status = status;
                entry.header = header;
            })
            .ok_or(StoreError::NotFound)
    }

    fn delete(&self, key: &str) -> StoreResult<()> {
        self.items.remove(key).map(|_| ()).ok_or(StoreError::NotFound)
    }

    fn keys(&self) -> Vec<String> {
        self.items.keys()
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::lru::UNBOUNDED_CAPACITY;

    fn response(body: &[u8]) -> StoredResponse {
        let mut header = HeaderMap::new();
        header.add("Content-Type", "text/plain");
        StoredResponse {
            status: 200,
            header,
            body: Body::from_bytes(body.to_vec()),
        }
    }

    #[test]
    fn test_store_and_get_round_trip() {
        let storage = MemoryStorage::new(UNBOUNDED_CAPACITY);
        storage.store("get:http://example.org/", response(b"llamas")).unwrap();

        let got = storage.get("get:http://example.org/").unwrap();
        assert_eq!(got.status, 200);
        assert_eq!(got.header.get("Content-Type"), Some("text/plain"));
        assert_eq!(got.body.read_all().unwrap(), b"llamas");
    }

    #[test]
    fn test_get_missing_is_not_found() {
        let storage = MemoryStorage::new(UNBOUNDED_CAPACITY);
        assert!(matches!(
            storage.get("missing"),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn test_store_replaces_existing() {
        let storage = MemoryStorage::new(UNBOUNDED_CAPACITY);
        storage.store("k", response(b"old")).unwrap();
        storage.store("k", response(b"new")).unwrap();

        assert_eq!(storage.len(), 1);
        assert_eq!(storage.get("k").unwrap().body.read_all().unwrap(), b"new");
    }

    #[test]
    fn test_freshen_preserves_body() {
        let storage = MemoryStorage::new(UNBOUNDED_CAPACITY);
        storage.store("k", response(b"llamas")).unwrap();

        let mut header = HeaderMap::new();
        header.add("X-New", "1");
        storage.freshen("k", 200, header).unwrap();

        let got = storage.get("k").unwrap();
        assert_eq!(got.header.get("X-New"), Some("1"));
        assert!(!got.header.contains("Content-Type"));
        assert_eq!(got.body.read_all().unwrap(), b"llamas");
    }

    #[test]
    fn test_freshen_missing_is_not_found() {
        let storage = MemoryStorage::new(UNBOUNDED_CAPACITY);
        assert!(matches!(
            storage.freshen("missing", 200, HeaderMap::new()),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn test_delete() {
        let storage = MemoryStorage::new(UNBOUNDED_CAPACITY);
        storage.store("k", response(b"data")).unwrap();

        storage.delete("k").unwrap();
        assert!(matches!(storage.get("k"), Err(StoreError::NotFound)));
        assert!(matches!(storage.delete("k"), Err(StoreError::NotFound)));
    }

    #[test]
    fn test_capacity_eviction() {
        // エントリコスト = ボディ10バイト + キー2バイト
        let storage = MemoryStorage::new(30);

        for i in 0..5 {
            storage.store(&format!("k{}", i), response(&[0u8; 10])).unwrap();
        }

        assert!(storage.len() < 5);
    }

    #[test]
    fn test_evicted_body_still_readable_by_holder() {
        let storage = MemoryStorage::new(20);
        storage.store("a", response(b"first-body")).unwrap();

        let held = storage.get("a").unwrap();

        // エビクトを誘発
        storage.store("b", response(b"second-body")).unwrap();

        assert_eq!(held.body.read_all().unwrap(), b"first-body");
    }

    #[test]
    fn test_keys_order() {
        let storage = MemoryStorage::new(UNBOUNDED_CAPACITY);
        storage.store("a", response(b"1")).unwrap();
        storage.store("b", response(b"2")).unwrap();
        storage.get("a").unwrap();

        assert_eq!(storage.keys(), vec!["a", "b"]);
    }
}
