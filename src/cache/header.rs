//! HTTPヘッダーマップ
//!
//! レスポンス・リクエストのヘッダーを保持する順序付きマルチマップを提供します。
//! ヘッダー名の比較は大文字小文字を区別しません。

use std::time::SystemTime;

/// Hop-by-hopヘッダー一覧（RFC 7230 Section 6.1）
///
/// プロキシを通過してはならないヘッダー。転送前および保存前に除去します。
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "Connection",
    "Keep-Alive",
    "Proxy-Authenticate",
    "Proxy-Authorization",
    "TE",
    "Trailers",
    "Transfer-Encoding",
    "Upgrade",
];

/// HTTPヘッダーマップ
///
/// 挿入順を保持するマルチマップ。同名ヘッダーの重複を許可し、
/// 取得時は大文字小文字を区別せずに照合します。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeaderMap {
    entries: Vec<(Box<str>, Box<str>)>,
}

impl HeaderMap {
    /// 空のヘッダーマップを作成
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    /// 最初に一致するヘッダー値を取得
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_ref())
    }

    /// 一致する全てのヘッダー値を取得
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.entries
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_ref())
    }

    /// 同名ヘッダーの値を`", "`で結合して取得
    ///
    /// 複数行に分かれたCache-Controlヘッダーの解析で使用します。
    pub fn combined(&self, name: &str) -> Option<String> {
        let mut joined = String::new();
        for v in self.get_all(name) {
            if !joined.is_empty() {
                joined.push_str(", ");
            }
            joined.push_str(v);
        }
        if joined.is_empty() {
            None
        } else {
            Some(joined)
        }
    }

    /// ヘッダーを追加（既存の同名ヘッダーは保持）
    pub fn add(&mut self, name: &str, value: &str) {
        self.entries.push((name.into(), value.into()));
    }

    /// ヘッダーを設定（既存の同名ヘッダーは置換）
    pub fn set(&mut self, name: &str, value: &str) {
        self.remove(name);
        self.entries.push((name.into(), value.into()));
    }

    /// 一致するヘッダーを全て削除
    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    /// ヘッダーが存在するかチェック
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// 全エントリを挿入順にイテレート
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_ref(), v.as_ref()))
    }

    /// エントリ数
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// マップが空かどうか
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// HTTP-date形式のヘッダー値を時刻として取得
    ///
    /// IMF-fixdate（例: `Sun, 06 Nov 1994 08:49:37 GMT`）以外は`None`。
    pub fn date(&self, name: &str) -> Option<SystemTime> {
        self.get(name)
            .and_then(|v| httpdate::parse_http_date(v).ok())
    }

    /// 時刻をHTTP-date形式で設定
    pub fn set_date(&mut self, name: &str, t: SystemTime) {
        self.set(name, &httpdate::fmt_http_date(t));
    }

    /// 整数値ヘッダーを取得
    pub fn int(&self, name: &str) -> Option<u64> {
        self.get(name).and_then(|v| v.trim().parse().ok())
    }

    /// Hop-by-hopヘッダーを除去
    ///
    /// `Connection`ヘッダーに列挙されたヘッダーも併せて除去します。
    pub fn strip_hop_by_hop(&mut self) {
        let named: Vec<String> = self
            .get_all("Connection")
            .flat_map(|v| v.split(','))
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();

        for name in &named {
            self.remove(name);
        }
        for name in HOP_BY_HOP_HEADERS {
            self.remove(name);
        }
    }
}

impl FromIterator<(String, String)> for HeaderMap {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(n, v)| (n.into_boxed_str(), v.into_boxed_str()))
                .collect(),
        }
    }
}
