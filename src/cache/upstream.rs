//! アップストリーム連携
//!
//! キャッシュコアとフォワーダーの境界を定義します。
//! フォワーダーはリクエストを受け取り、レスポンスヘッダーと
//! ボディストリームを返します。実装は`main.rs`のプロキシと
//! テスト用のモックの両方が提供します。

use super::header::HeaderMap;
use std::io;

/// HTTPリクエスト
///
/// パース済みのリクエスト。キャッシュキー生成とアップストリーム転送の
/// 両方で使用します。
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// HTTPメソッド（大文字）
    pub method: Box<str>,
    /// スキーム（`http`固定だがキー正規化で使用）
    pub scheme: Box<str>,
    /// ホスト名（Hostヘッダー由来）
    pub host: Box<str>,
    /// リクエストパス
    pub path: Box<str>,
    /// クエリ文字列（`?`を含まない）
    pub query: Option<Box<str>>,
    /// HTTPマイナーバージョン（1.0なら0、1.1なら1）
    pub version_minor: u8,
    /// リクエストヘッダー
    pub header: HeaderMap,
    /// リクエストボディ
    pub body: Vec<u8>,
}

impl HttpRequest {
    /// 最小構成のリクエストを作成
    pub fn new(method: &str, host: &str, path: &str) -> Self {
        let (path, query) = match path.split_once('?') {
            Some((p, q)) => (p, Some(q)),
            None => (path, None),
        };

        Self {
            method: method.to_ascii_uppercase().into(),
            scheme: "http".into(),
            host: host.into(),
            path: path.into(),
            query: query.map(Into::into),
            version_minor: 1,
            header: HeaderMap::new(),
            body: Vec::new(),
        }
    }

    /// HTTP/1.1リクエストかどうか
    #[inline]
    pub fn is_http11(&self) -> bool {
        self.version_minor == 1
    }

    /// パスとクエリを結合した文字列を取得
    pub fn path_and_query(&self) -> String {
        match &self.query {
            Some(q) => format!("{}?{}", self.path, q),
            None => self.path.to_string(),
        }
    }
}

/// アップストリームレスポンスのヘッダー部
#[derive(Debug, Clone)]
pub struct ResponseHead {
    /// ステータスコード
    pub status: u16,
    /// レスポンスヘッダー
    pub header: HeaderMap,
}

/// アップストリームレスポンスのボディストリーム
///
/// チャンク単位でボディを取り出します。`None`でストリーム終端。
/// Transfer-Encodingの解除はフォワーダー側の責務で、ここを流れるのは
/// ペイロードのオクテットのみです。
#[allow(async_fn_in_trait)]
pub trait UpstreamBody {
    async fn chunk(&mut self) -> io::Result<Option<Vec<u8>>>;
}

/// アップストリームフォワーダー
///
/// リクエストからレスポンスを生成するコラボレーター。
/// ヘッダー部を先に返し、ボディは後からストリームとして取り出します。
#[allow(async_fn_in_trait)]
pub trait Upstream {
    type Body: UpstreamBody;

    async fn forward(&self, req: &HttpRequest) -> io::Result<(ResponseHead, Self::Body)>;
}

/// バッファ済みボディ
///
/// 全体をメモリに持つボディ。モックや空ボディで使用します。
pub struct FullBody(Option<Vec<u8>>);

impl FullBody {
    pub fn new(data: Vec<u8>) -> Self {
        Self(if data.is_empty() { None } else { Some(data) })
    }

    pub fn empty() -> Self {
        Self(None)
    }
}

impl UpstreamBody for FullBody {
    async fn chunk(&mut self) -> io::Result<Option<Vec<u8>>> {
        Ok(self.0.take())
    }
}
