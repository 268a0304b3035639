//! 容量制限付きLRUリスト
//!
//! バイト容量で制限されたLRUマップを提供します。メモリ・ディスク両方の
//! バックエンドがこのラッパーを共有し、エビクションポリシーの重複を
//! 避けています。

use lru::LruCache;
use std::sync::Mutex;

/// 容量0はエビクション無効（無制限）を意味する
pub const UNBOUNDED_CAPACITY: u64 = 0;

/// エントリのバイトサイズを返すトレイト
pub trait EntrySize {
    fn size(&self) -> u64;
}

/// バイト容量制限付きLRUマップ
///
/// エントリのコストは「値のサイズ + キー長」。挿入後に合計が容量を
/// 超えている間、LRU末尾からエビクトします。全操作は単一のロックで
/// 保護され、個々にアトミックです。
pub struct CappedLru<V> {
    inner: Mutex<Inner<V>>,
}

struct Inner<V> {
    list: LruCache<String, V>,
    size: u64,
    capacity: u64,
}

impl<V: EntrySize> CappedLru<V> {
    /// 指定容量（バイト）で作成。0で無制限。
    pub fn new(capacity: u64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                list: LruCache::unbounded(),
                size: 0,
                capacity,
            }),
        }
    }

    fn cost(key: &str, value: &V) -> u64 {
        value.size() + key.len() as u64
    }

    /// エントリを挿入し、エビクトされたエントリを返す
    ///
    /// 既存キーは置換されます（置換された値はエビクト扱いにしない）。
    /// 返り値はLRU末尾から追い出された（キー, 値）のリスト。
    pub fn insert(&self, key: String, value: V) -> Vec<(String, V)> {
        let mut inner = self.inner.lock().unwrap();

        let cost = Self::cost(&key, &value);
        if let Some(old) = inner.list.put(key.clone(), value) {
            inner.size -= Self::cost(&key, &old);
        }
        inner.size += cost;

        let mut evicted = Vec::new();
        if inner.capacity != UNBOUNDED_CAPACITY {
            while inner.size > inner.capacity {
                match inner.list.pop_lru() {
                    Some((k, v)) => {
                        inner.size -= Self::cost(&k, &v);
                        evicted.push((k, v));
                    }
                    None => break,
                }
            }
        }

        evicted
    }

    /// エントリを取得し、MRUへ移動
    pub fn get(&self, key: &str) -> Option<V>
    where
        V: Clone,
    {
        let mut inner = self.inner.lock().unwrap();
        inner.list.get(key).cloned()
    }

    /// エントリをインプレースで書き換え、MRUへ移動
    ///
    /// メタデータのみの更新（freshen）で使用します。サイズはボディ長と
    /// キー長のみで数えるため、ここでは再計算しません。
    pub fn with_mut<R>(&self, key: &str, f: impl FnOnce(&mut V) -> R) -> Option<R> {
        let mut inner = self.inner.lock().unwrap();
        inner.list.get_mut(key).map(f)
    }

    /// エントリを削除
    pub fn remove(&self, key: &str) -> Option<V> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(value) = inner.list.pop(key) {
            inner.size -= Self::cost(key, &value);
            Some(value)
        } else {
            None
        }
    }

    /// キー一覧（MRUからLRUの順）
    pub fn keys(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner.list.iter().map(|(k, _)| k.clone()).collect()
    }

    /// エントリ数
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().list.len()
    }

    /// 現在の合計サイズ（バイト）
    pub fn size(&self) -> u64 {
        self.inner.lock().unwrap().size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Blob(Vec<u8>);

    impl EntrySize for Blob {
        fn size(&self) -> u64 {
            self.0.len() as u64
        }
    }

    #[test]
    fn test_insert_and_get() {
        let lru = CappedLru::new(UNBOUNDED_CAPACITY);
        lru.insert("a".to_string(), Blob(vec![1, 2, 3]));

        assert_eq!(lru.get("a"), Some(Blob(vec![1, 2, 3])));
        assert_eq!(lru.get("b"), None);
        assert_eq!(lru.len(), 1);
    }

    #[test]
    fn test_size_includes_key_length() {
        let lru = CappedLru::new(UNBOUNDED_CAPACITY);
        lru.insert("abc".to_string(), Blob(vec![0; 10]));

        assert_eq!(lru.size(), 13);
    }

    #[test]
    fn test_eviction_keeps_size_under_capacity() {
        // エントリコスト = 10 + 2 = 12バイト
        let lru = CappedLru::new(30);

        for i in 0..5 {
            lru.insert(format!("k{}", i), Blob(vec![0; 10]));
            assert!(lru.size() <= 30, "size {} exceeds capacity", lru.size());
        }

        assert_eq!(lru.len(), 2);
    }

    #[test]
    fn test_eviction_order_is_lru() {
        let lru = CappedLru::new(36);
        lru.insert("k0".to_string(), Blob(vec![0; 10]));
        lru.insert("k1".to_string(), Blob(vec![0; 10]));
        lru.insert("k2".to_string(), Blob(vec![0; 10]));

        // k0をMRUへ昇格させてからk3を挿入
        lru.get("k0");
        let evicted = lru.insert("k3".to_string(), Blob(vec![0; 10]));

        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].0, "k1");
        assert!(lru.get("k0").is_some());
    }

    #[test]
    fn test_replace_does_not_count_as_eviction() {
        let lru = CappedLru::new(UNBOUNDED_CAPACITY);
        lru.insert("a".to_string(), Blob(vec![0; 10]));
        let evicted = lru.insert("a".to_string(), Blob(vec![0; 4]));

        assert!(evicted.is_empty());
        assert_eq!(lru.len(), 1);
        assert_eq!(lru.size(), 5);
    }

    #[test]
    fn test_oversized_entry_evicts_itself() {
        let lru = CappedLru::new(5);
        let evicted = lru.insert("big".to_string(), Blob(vec![0; 100]));

        assert_eq!(evicted.len(), 1);
        assert_eq!(lru.len(), 0);
        assert_eq!(lru.size(), 0);
    }

    #[test]
    fn test_keys_mru_to_lru() {
        let lru = CappedLru::new(UNBOUNDED_CAPACITY);
        lru.insert("a".to_string(), Blob(vec![]));
        lru.insert("b".to_string(), Blob(vec![]));
        lru.insert("c".to_string(), Blob(vec![]));
        lru.get("a");

        assert_eq!(lru.keys(), vec!["a", "c", "b"]);
    }

    #[test]
    fn test_zero_capacity_never_evicts() {
        let lru = CappedLru::new(UNBOUNDED_CAPACITY);
        for i in 0..100 {
            let evicted = lru.insert(format!("k{}", i), Blob(vec![0; 1000]));
            assert!(evicted.is_empty());
        }
        assert_eq!(lru.len(), 100);
    }

    #[test]
    fn test_with_mut_updates_in_place() {
        let lru = CappedLru::new(UNBOUNDED_CAPACITY);
        lru.insert("a".to_string(), Blob(vec![1]));

        let updated = lru.with_mut("a", |b| {
            b.0 = vec![2];
        });

        assert!(updated.is_some());
        assert_eq!(lru.get("a"), Some(Blob(vec![2])));
        assert!(lru.with_mut("missing", |_| ()).is_none());
    }
}
