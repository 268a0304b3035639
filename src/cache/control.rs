//! Cache-Controlディレクティブパーサー
//!
//! `Cache-Control`ヘッダー値をディレクティブ名→値リストのマルチマップへ
//! 解析します。引用文字列内のカンマ・空白はリテラルとして扱います。

use std::fmt;
use std::time::Duration;

/// Cache-Control解析エラー
///
/// 引用文字列が閉じられていない等の構造的な破損で発生します。
/// 呼び出し側はレスポンスをキャッシュ不可として扱います。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError;

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("malformed cache-control header")
    }
}

impl std::error::Error for ParseError {}

/// Cache-Controlディレクティブ集合
///
/// ディレクティブ名（小文字化済み）から値リストへの順序付きマルチマップ。
/// 値を持たないディレクティブは空のリストを持ちます。
/// 未知のディレクティブもそのまま保持します。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheControl {
    directives: Vec<(Box<str>, Vec<Box<str>>)>,
}

impl CacheControl {
    /// ヘッダー値文字列を解析
    ///
    /// 個々の不正なディレクティブは無視して解析を継続します。
    /// 引用文字列が閉じられていない場合のみ`ParseError`を返します。
    pub fn parse(input: &str) -> Result<Self, ParseError> {
        // ヘッダー値はASCII前提。バイト位置でスライスするため先に弾く。
        if !input.is_ascii() {
            return Err(ParseError);
        }

        let mut cc = CacheControl::default();
        let bytes = input.as_bytes();
        let length = bytes.len();

        let mut in_token = false;
        let mut in_quote = false;
        let mut offset = 0;

        // `name=value`トークンへ分割（引用内のカンマは区切りとして扱わない）
        for i in 0..length {
            let c = bytes[i];

            if in_token && c == b',' && !in_quote {
                cc.add_token(&input[offset..i]);
                in_token = false;
            } else if in_token && c == b'"' && i > 0 && bytes[i - 1] == b'=' {
                in_quote = true;
            } else if !in_token && c != b',' && c != b' ' {
                in_token = true;
                offset = i;
            } else if in_token && in_quote && c == b'"' {
                cc.add_token(&input[offset..=i]);
                in_token = false;
                in_quote = false;
            }
        }

        if in_quote {
            return Err(ParseError);
        }

        // 末尾のトークンを処理
        if in_token && offset < length {
            cc.add_token(&input[offset..length]);
        }

        Ok(cc)
    }

    /// `name`または`name=value`形式のトークンを追加
    fn add_token(&mut self, token: &str) {
        let (name, value) = match token.find('=') {
            Some(idx) => (&token[..idx], token[idx + 1..].trim_matches('"')),
            None => (token, ""),
        };

        let name = name.trim();
        if name.is_empty() {
            return;
        }

        self.add(&name.to_ascii_lowercase(), value);
    }

    /// ディレクティブを追加
    pub fn add(&mut self, name: &str, value: &str) {
        if let Some((_, values)) = self
            .directives
            .iter_mut()
            .find(|(n, _)| n.as_ref() == name)
        {
            if !value.is_empty() {
                values.push(value.into());
            }
            return;
        }

        let values = if value.is_empty() {
            Vec::new()
        } else {
            vec![value.into()]
        };
        self.directives.push((name.into(), values));
    }

    /// ディレクティブが存在するかチェック（値の有無は問わない）
    pub fn has(&self, name: &str) -> bool {
        self.directives.iter().any(|(n, _)| n.as_ref() == name)
    }

    /// 最初の値を取得
    ///
    /// ディレクティブが値を持たない場合は`None`。
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values(name).first().map(|v| v.as_ref())
    }

    /// 全ての値を取得
    pub fn values(&self, name: &str) -> &[Box<str>] {
        self.directives
            .iter()
            .find(|(n, _)| n.as_ref() == name)
            .map(|(_, v)| v.as_slice())
            .unwrap_or(&[])
    }

    /// 秒数ディレクティブを`Duration`として取得
    ///
    /// `max-age`、`s-maxage`、`min-fresh`、`max-stale`で使用。
    /// 値が存在しないか10進整数でない場合は`None`。
    pub fn duration(&self, name: &str) -> Option<Duration> {
        self.get(name)
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
    }

    /// ディレクティブが一つも無いかどうか
    pub fn is_empty(&self) -> bool {
        self.directives.is_empty()
    }
}
