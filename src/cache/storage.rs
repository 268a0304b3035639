//! ストレージ契約
//!
//! キー付きリソースストアのインターフェースを定義します。
//! メモリ・ディスクの両バックエンドが同じ契約を実装し、
//! LRUポリシーは共通のラッパー（`lru.rs`）が担います。

use super::header::HeaderMap;
use std::fmt;
use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::Arc;

/// ストア操作エラー
#[derive(Debug)]
pub enum StoreError {
    /// キーが存在しない
    NotFound,
    /// I/O障害（ディスクバックエンドのみ）
    Io(io::Error),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::NotFound => f.write_str("key not found in store"),
            StoreError::Io(e) => write!(f, "store i/o error: {}", e),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<io::Error> for StoreError {
    fn from(e: io::Error) -> Self {
        StoreError::Io(e)
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// レスポンスボディハンドル
///
/// メモリバックエンドでは不変バッファを共有し、ディスクバックエンドでは
/// リーダーごとに独立したファイルディスクリプタを開きます。
/// どのリーダーも毎回同じバイト列を返し、ランダムアクセスをサポートします。
#[derive(Debug, Clone)]
pub enum Body {
    /// メモリ上のボディ（読み取り間で共有される不変バッファ）
    Memory(Arc<[u8]>),
    /// ディスク上のボディ
    File { path: Arc<PathBuf>, len: u64 },
}

impl Body {
    /// バイト列からメモリボディを作成
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Body::Memory(data.into())
    }

    /// 空のボディ
    pub fn empty() -> Self {
        Body::Memory(Arc::from(&[][..]))
    }

    /// ボディ長（バイト）
    pub fn len(&self) -> u64 {
        match self {
            Body::Memory(data) => data.len() as u64,
            Body::File { len, .. } => *len,
        }
    }

    /// ボディが空かどうか
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 読み取りハンドルを開く
    pub fn reader(&self) -> io::Result<BodyReader> {
        match self {
            Body::Memory(data) => Ok(BodyReader::Memory(Cursor::new(Arc::clone(data)))),
            Body::File { path, .. } => Ok(BodyReader::File(File::open(path.as_ref())?)),
        }
    }

    /// ボディ全体をバイト列として読み出す
    pub fn read_all(&self) -> io::Result<Vec<u8>> {
        match self {
            Body::Memory(data) => Ok(data.to_vec()),
            Body::File { path, .. } => std::fs::read(path.as_ref()),
        }
    }
}

/// ボディ読み取りハンドル
///
/// `Read` + `Seek`を実装し、レンジ配信で使用します。
pub enum BodyReader {
    Memory(Cursor<Arc<[u8]>>),
    File(File),
}

impl Read for BodyReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            BodyReader::Memory(c) => c.read(buf),
            BodyReader::File(f) => f.read(buf),
        }
    }
}

impl Seek for BodyReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match self {
            BodyReader::Memory(c) => c.seek(pos),
            BodyReader::File(f) => f.seek(pos),
        }
    }
}

/// ストアに保存されるレスポンス
#[derive(Debug, Clone)]
pub struct StoredResponse {
    /// ステータスコード
    pub status: u16,
    /// レスポンスヘッダー
    pub header: HeaderMap,
    /// ボディハンドル
    pub body: Body,
}

/// リソースストア
///
/// キー付きのレスポンス保存。全操作は個々にアトミックで、
/// 複数ワーカーからの同時呼び出しに対して安全です。
pub trait Storage: Send + Sync {
    /// レスポンスを保存（既存キーは置換、LRU位置は最新へ）
    fn store(&self, key: &str, res: StoredResponse) -> StoreResult<()>;

    /// レスポンスを取得し、キーをMRUへ移動
    fn get(&self, key: &str) -> StoreResult<StoredResponse>;

    /// ボディに触れずステータスとヘッダーのみ取得
    fn get_meta(&self, key: &str) -> StoreResult<(u16, HeaderMap)>;

    /// メタデータのみを置換（ボディは不変）
    fn freshen(&self, key: &str, status: u16, header: HeaderMap) -> StoreResult<()>;

    /// エントリを削除
    fn delete(&self, key: &str) -> StoreResult<()>;

    /// キー一覧（MRUからLRUの順）
    fn keys(&self) -> Vec<String>;

    /// エントリ数
    fn len(&self) -> usize;
}
