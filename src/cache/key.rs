//! キャッシュキー
//!
//! メソッドとURLからプライマリキーを、レスポンスの`Vary`ヘッダーから
//! セカンダリキーを導出します。キーは文字列形式で比較されます。

use super::upstream::HttpRequest;
use std::fmt;

/// キャッシュキー
///
/// `method:scheme://host/path?query`形式の文字列としてリソースを
/// 一意に識別します。メソッドは小文字、スキームとホストは小文字へ
/// 正規化されます。`Vary`由来のセカンダリキーは
/// `primary::name=value;name=value`形式になります。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Key {
    method: Box<str>,
    url: Box<str>,
    vary: Option<Box<str>>,
}

impl Key {
    /// メソッドとURL構成要素からプライマリキーを作成
    pub fn new(method: &str, scheme: &str, host: &str, path: &str, query: Option<&str>) -> Self {
        let mut url = String::with_capacity(scheme.len() + host.len() + path.len() + 16);
        url.push_str(&scheme.to_ascii_lowercase());
        url.push_str("://");
        url.push_str(&host.to_ascii_lowercase());
        url.push_str(path);
        if let Some(q) = query {
            url.push('?');
            url.push_str(q);
        }

        Self {
            method: method.to_ascii_lowercase().into(),
            url: url.into(),
            vary: None,
        }
    }

    /// リクエストからプライマリキーを生成
    pub fn from_request(req: &HttpRequest) -> Self {
        Self::new(
            &req.method,
            &req.scheme,
            &req.host,
            &req.path,
            req.query.as_deref(),
        )
    }

    /// メソッド部分を差し替えたキーを返す
    ///
    /// HEADリクエストをGETエントリへフォールバックさせる際に使用します。
    pub fn for_method(&self, method: &str) -> Self {
        Self {
            method: method.to_ascii_lowercase().into(),
            url: self.url.clone(),
            vary: self.vary.clone(),
        }
    }

    /// `Vary`ヘッダーからセカンダリキーを導出
    ///
    /// `Vary`に列挙されたヘッダー名を元の順序で走査し、リクエストの
    /// 対応する値を`name=value`形式で連結します。リクエストに存在しない
    /// ヘッダーは空値として含めます。
    pub fn vary(&self, vary_header: &str, req: &HttpRequest) -> Self {
        let mut secondary = String::new();

        for name in vary_header.split(',') {
            let name = name.trim();
            if name.is_empty() {
                continue;
            }
            if !secondary.is_empty() {
                secondary.push(';');
            }
            secondary.push_str(name);
            secondary.push('=');
            if let Some(value) = req.header.get(name) {
                secondary.push_str(value);
            }
        }

        Self {
            method: self.method.clone(),
            url: self.url.clone(),
            vary: Some(secondary.into()),
        }
    }

    /// 文字列形式を取得
    pub fn string(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.method, self.url)?;
        if let Some(vary) = &self.vary {
            write!(f, "::{}", vary)?;
        }
        Ok(())
    }
}
