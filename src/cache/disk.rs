//! ディスクバックエンド
//!
//! レスポンスボディをキーのMD5ハッシュ名のファイルとして保存し、
//! メタデータのみをメモリに保持するストレージです。
//! エビクトはファイルを削除しますが、既に開いているリーダーは
//! unlink-while-openセマンティクスにより最後まで読み切れます。

use super::header::HeaderMap;
use super::lru::{CappedLru, EntrySize};
use super::storage::{Body, Storage, StoreError, StoreResult, StoredResponse};
use ftlog::warn;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Clone)]
struct DiskEntry {
    status: u16,
    header: HeaderMap,
    path: Arc<PathBuf>,
    len: u64,
}

impl EntrySize for DiskEntry {
    fn size(&self) -> u64 {
        self.len
    }
}

/// ディスクストレージ
pub struct DiskStorage {
    dir: PathBuf,
    file_mode: u32,
    items: CappedLru<DiskEntry>,
}

impl DiskStorage {
    /// ディレクトリと容量（バイト）を指定して作成。容量0で無制限。
    pub fn new(dir: impl Into<PathBuf>, file_mode: u32, capacity: u64) -> StoreResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        Ok(Self {
            dir,
            file_mode,
            items: CappedLru::new(capacity),
        })
    }

    /// キーからファイルパスを導出（MD5の16進表記）
    fn key_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{:x}", md5::compute(key.as_bytes())))
    }

    /// ボディをファイルへ書き込み、書き込めたバイト数を返す
    fn write_body(&self, path: &PathBuf, data: &[u8]) -> StoreResult<u64> {
        let mut file = fs::File::create(path)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(self.file_mode);
            file.set_permissions(perms)?;
        }

        file.write_all(data)?;
        Ok(data.len() as u64)
    }

    fn unlink_evicted(&self, evicted: Vec<(String, DiskEntry)>) {
        for (key, entry) in evicted {
            if let Err(e) = fs::remove_file(entry.path.as_ref()) {
                warn!("evicted cache file for {} could not be removed: {}", key, e);
            }
        }
    }
}

impl Storage for DiskStorage {
    fn store(&self, key: &str, res: StoredResponse) -> StoreResult<()> {
        let data = res.body.read_all()?;
        let path = self.key_path(key);

        // 同一キーの置換はLRU側で行われ、ファイルは同パスのため上書きで足りる
        let len = self.write_body(&path, &data)?;

        let evicted = self.items.insert(
            key.to_string(),
            DiskEntry {
                status: res.status,
                header: res.header,
                path: Arc::new(path),
                len,
            },
        );
        self.unlink_evicted(evicted);

        Ok(())
    }

    fn get(&self, key: &str) -> StoreResult<StoredResponse> {
        let entry = self.items.get(key).ok_or(StoreError::NotFound)?;
        Ok(StoredResponse {
            status: entry.status,
            header: entry.header,
            body: Body::File {
                path: entry.path,
                len: entry.len,
            },
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
        let entry = self.items.remove(key).ok_or(StoreError::NotFound)?;
        fs::remove_file(entry.path.as_ref())?;
        Ok(())
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
    use std::io::Read;
    use tempfile::tempdir;

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
        let dir = tempdir().unwrap();
        let storage = DiskStorage::new(dir.path(), 0o600, UNBOUNDED_CAPACITY).unwrap();

        storage.store("get:http://example.org/", response(b"llamas")).unwrap();

        let got = storage.get("get:http://example.org/").unwrap();
        assert_eq!(got.status, 200);
        assert_eq!(got.body.len(), 6);
        assert_eq!(got.body.read_all().unwrap(), b"llamas");
    }

    #[test]
    fn test_body_file_is_md5_named() {
        let dir = tempdir().unwrap();
        let storage = DiskStorage::new(dir.path(), 0o600, UNBOUNDED_CAPACITY).unwrap();

        storage.store("k", response(b"data")).unwrap();

        // md5("k") = 8ce4b16b22b58894aa86c421e8759df3
        assert!(dir.path().join("8ce4b16b22b58894aa86c421e8759df3").exists());
    }

    #[test]
    fn test_get_missing_is_not_found() {
        let dir = tempdir().unwrap();
        let storage = DiskStorage::new(dir.path(), 0o600, UNBOUNDED_CAPACITY).unwrap();

        assert!(matches!(storage.get("missing"), Err(StoreError::NotFound)));
    }

    #[test]
    fn test_freshen_preserves_body_file() {
        let dir = tempdir().unwrap();
        let storage = DiskStorage::new(dir.path(), 0o600, UNBOUNDED_CAPACITY).unwrap();
        storage.store("k", response(b"llamas")).unwrap();

        let mut header = HeaderMap::new();
        header.add("X-New", "1");
        storage.freshen("k", 200, header).unwrap();

        let got = storage.get("k").unwrap();
        assert_eq!(got.header.get("X-New"), Some("1"));
        assert_eq!(got.body.read_all().unwrap(), b"llamas");
    }

    #[test]
    fn test_delete_removes_file() {
        let dir = tempdir().unwrap();
        let storage = DiskStorage::new(dir.path(), 0o600, UNBOUNDED_CAPACITY).unwrap();
        storage.store("k", response(b"data")).unwrap();

        let path = dir.path().join(format!("{:x}", md5::compute(b"k")));
        assert!(path.exists());

        storage.delete("k").unwrap();
        assert!(!path.exists());
        assert!(matches!(storage.get("k"), Err(StoreError::NotFound)));
    }

    #[test]
    fn test_eviction_unlinks_files() {
        let dir = tempdir().unwrap();
        // コスト = 10バイトボディ + 2バイトキー
        let storage = DiskStorage::new(dir.path(), 0o600, 30).unwrap();

        for i in 0..5 {
            storage.store(&format!("k{}", i), response(&[0u8; 10])).unwrap();
        }

        assert!(storage.len() < 5);
        let remaining = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(remaining, storage.len());
    }

    #[test]
    fn test_open_reader_survives_eviction() {
        let dir = tempdir().unwrap();
        let storage = DiskStorage::new(dir.path(), 0o600, 16).unwrap();
        storage.store("a", response(b"first-body")).unwrap();

        let held = storage.get("a").unwrap();
        let mut reader = held.body.reader().unwrap();

        // エビクトを誘発してファイルをunlinkさせる
        storage.store("b", response(b"second-body")).unwrap();
        assert!(matches!(storage.get("a"), Err(StoreError::NotFound)));

        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"first-body");
    }

    #[test]
    fn test_replace_same_key_overwrites_file() {
        let dir = tempdir().unwrap();
        let storage = DiskStorage::new(dir.path(), 0o600, UNBOUNDED_CAPACITY).unwrap();

        storage.store("k", response(b"old-content")).unwrap();
        storage.store("k", response(b"new")).unwrap();

        assert_eq!(storage.len(), 1);
        assert_eq!(storage.get("k").unwrap().body.read_all().unwrap(), b"new");
    }
}
