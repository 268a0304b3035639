//! # HTTPキャッシュモジュール
//!
//! RFC 7234準拠の共有・プライベートHTTPキャッシュのコアを提供します。
//! リクエストの分類、キー付きストアの照会、条件付き再検証、配信と保存を
//! 調停するステートマシンが中心です。
//!
//! ## アーキテクチャ
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │  CacheHandler（パイプライン）                │
//! │  ├─ CacheControl / Key / Resource            │← 判定と計算
//! │  ├─ Validator                                │← 条件付き再検証
//! │  ├─ ResponseStreamer                         │← ティー配信
//! │  └─ Cache（コーディネーター）                │
//! │     ├─ 無効化マーカー (DashMap)              │
//! │     └─ Storage（メモリ / ディスク + LRU）    │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! ## 使用例
//!
//! ```toml
//! [cache]
//! shared = true
//! capacity = 104857600  # 100MB
//! backend = "disk"
//! dir = "/var/cache/utsushi"
//! ```

mod clock;
mod config;
mod control;
mod coordinator;
mod disk;
mod handler;
mod header;
mod key;
mod lru;
mod memory;
mod resource;
mod storage;
mod streamer;
mod upstream;
mod validator;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{BackendKind, CacheConfig};
pub use control::{CacheControl, ParseError};
pub use coordinator::{Cache, PendingWrites};
pub use disk::DiskStorage;
pub use handler::{CacheHandler, CACHE_HEADER, PROXY_DATE_HEADER};
pub use header::HeaderMap;
pub use key::Key;
pub use memory::MemoryStorage;
pub use resource::Resource;
pub use storage::{Body, Storage, StoreError, StoredResponse};
pub use streamer::{ClientSink, ResponseStreamer};
pub use upstream::{FullBody, HttpRequest, ResponseHead, Upstream, UpstreamBody};
