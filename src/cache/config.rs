//! キャッシュ設定

use serde::Deserialize;
use std::path::PathBuf;

/// デフォルト値関数
fn default_shared() -> bool { true }
fn default_file_mode() -> u32 { 0o600 }
fn default_pseudonym() -> String { "httpcache".to_string() }

/// ストレージバックエンド種別
#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// ボディをメモリに保持
    Memory,
    /// ボディをディスクに保存しメタデータのみメモリに保持
    Disk,
}

impl Default for BackendKind {
    fn default() -> Self {
        BackendKind::Memory
    }
}

/// キャッシュ設定
#[derive(Deserialize, Clone, Debug)]
pub struct CacheConfig {
    /// 共有キャッシュセマンティクスを使用するか
    ///
    /// trueの場合、`s-maxage`・`proxy-revalidate`・`private`・
    /// `Authorization`の制約を評価します。
    ///
    /// デフォルト: true
    #[serde(default = "default_shared")]
    pub shared: bool,

    /// ストア容量（バイト）
    ///
    /// 0で無制限。超過分はLRU末尾からエビクトされます。
    ///
    /// デフォルト: 0
    #[serde(default)]
    pub capacity: u64,

    /// バックエンド種別
    ///
    /// デフォルト: memory
    #[serde(default)]
    pub backend: BackendKind,

    /// ディスクバックエンドの保存先ディレクトリ
    ///
    /// `backend = "disk"`の場合に必須
    #[serde(default)]
    pub dir: Option<PathBuf>,

    /// ディスクバックエンドのファイルモード
    ///
    /// デフォルト: 0o600
    #[serde(default = "default_file_mode")]
    pub file_mode: u32,

    /// Viaヘッダーに付与する仮名
    ///
    /// デフォルト: "httpcache"
    #[serde(default = "default_pseudonym")]
    pub pseudonym: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            shared: default_shared(),
            capacity: 0,
            backend: BackendKind::default(),
            dir: None,
            file_mode: default_file_mode(),
            pseudonym: default_pseudonym(),
        }
    }
}

impl CacheConfig {
    /// 設定の整合性を検証
    pub fn validate(&self) -> Result<(), String> {
        if self.backend == BackendKind::Disk && self.dir.is_none() {
            return Err("cache.dir is required for the disk backend".to_string());
        }
        Ok(())
    }
}
