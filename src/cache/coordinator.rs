//! キャッシュコーディネーター
//!
//! ストアと明示的無効化マーカーを所有し、保存・取得・freshen・無効化を
//! 仲介します。非同期保存の完了待ちのためのカウンターも保持します。

use super::disk::DiskStorage;
use super::header::HeaderMap;
use super::key::Key;
use super::memory::MemoryStorage;
use super::resource::Resource;
use super::storage::{Storage, StoreResult, StoredResponse};
use super::validator::validators_match;
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// キャッシュコーディネーター
///
/// ストア本体・無効化マーカー・保留書き込みカウンターを束ねます。
/// 複数ワーカーから共有されるため全操作は`&self`で完結します。
pub struct Cache {
    storage: Box<dyn Storage>,
    stale: DashMap<String, SystemTime>,
    writes: Arc<PendingWrites>,
}

impl Cache {
    /// メモリバックエンドで作成
    pub fn memory(capacity: u64) -> Self {
        Self::with_storage(Box::new(MemoryStorage::new(capacity)))
    }

    /// ディスクバックエンドで作成
    pub fn disk(dir: impl Into<PathBuf>, file_mode: u32, capacity: u64) -> StoreResult<Self> {
        Ok(Self::with_storage(Box::new(DiskStorage::new(
            dir, file_mode, capacity,
        )?)))
    }

    /// 任意のストレージ実装で作成
    pub fn with_storage(storage: Box<dyn Storage>) -> Self {
        Self {
            storage,
            stale: DashMap::new(),
            writes: Arc::new(PendingWrites::new()),
        }
    }

    /// リソースを全キーの下に保存
    ///
    /// 各キーの無効化マーカーは新しいレスポンスで上書きされるため破棄します。
    pub fn store(&self, res: &Resource, keys: &[Key]) -> StoreResult<()> {
        for key in keys {
            let key = key.string();
            self.stale.remove(&key);
            self.storage.store(
                &key,
                StoredResponse {
                    status: res.status(),
                    header: res.header().clone(),
                    body: res.body().clone(),
                },
            )?;
        }
        Ok(())
    }

    /// キーでリソースを取得
    ///
    /// 無効化マーカーが存在し、リソースの`Date`がマーカーより後でない場合、
    /// `stale = true`を付けて返します（`Date`が無い場合も同様）。
    pub fn retrieve(&self, key: &Key) -> StoreResult<Resource> {
        let key_str = key.string();
        let stored = self.storage.get(&key_str)?;
        let mut res = Resource::from_stored(stored);

        if let Some(marker) = self.stale.get(&key_str) {
            let superseded = match res.header().date("Date") {
                Some(date) => date > *marker.value(),
                None => false,
            };
            if !superseded {
                res.set_stale(true);
            }
        }

        Ok(res)
    }

    /// 検証成功後のメタデータ更新
    ///
    /// 各キーについて保存済みメタデータを取得し、検証子が新レスポンスと
    /// 一致する場合のみ置換します。一致しない場合は安全側に倒して
    /// 無効化マーカーを付けます。キーが存在しなければ何もしません。
    pub fn freshen(
        &self,
        status: u16,
        header: &HeaderMap,
        keys: &[Key],
        now: SystemTime,
    ) -> StoreResult<()> {
        for key in keys {
            let key_str = key.string();
            match self.storage.get_meta(&key_str) {
                Ok((_, stored_header)) => {
                    if validators_match(&stored_header, header) {
                        self.storage.freshen(&key_str, status, header.clone())?;
                        self.stale.remove(&key_str);
                    } else {
                        self.stale.insert(key_str, now);
                    }
                }
                Err(super::storage::StoreError::NotFound) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// キーを無効化
    ///
    /// エントリは削除せず、現在時刻のマーカーを記録します。
    /// 以後の取得はマーカーより古いレスポンスを`stale`として返します。
    pub fn invalidate(&self, keys: &[Key], now: SystemTime) {
        for key in keys {
            self.stale.insert(key.string(), now);
        }
    }

    /// 保留中の非同期書き込みカウンター
    pub fn pending_writes(&self) -> Arc<PendingWrites> {
        Arc::clone(&self.writes)
    }

    /// ストア内のエントリ数
    pub fn len(&self) -> usize {
        self.storage.len()
    }

    /// ストアが空かどうか
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 保留中書き込みカウンター
///
/// 非同期保存タスクの開始時にガードを取り、完了（ドロップ）で減算します。
/// テストは`join`で全書き込みの完了を待てます。プロセス全体ではなく
/// コーディネーター単位で持つため、テストごとに独立します。
pub struct PendingWrites {
    count: AtomicUsize,
}

impl PendingWrites {
    fn new() -> Self {
        Self {
            count: AtomicUsize::new(0),
        }
    }

    /// 書き込み開始を記録し、完了ガードを返す
    pub fn begin(self: Arc<Self>) -> WriteGuard {
        self.count.fetch_add(1, Ordering::SeqCst);
        WriteGuard { writes: self }
    }

    /// 保留中の書き込み数
    pub fn pending(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// 全ての保留書き込みが完了するまで待つ
    pub async fn join(&self) {
        while self.pending() > 0 {
            monoio::time::sleep(Duration::from_millis(1)).await;
        }
    }
}

/// 書き込み完了ガード
pub struct WriteGuard {
    writes: Arc<PendingWrites>,
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        self.writes.count.fetch_sub(1, Ordering::SeqCst);
    }
}
