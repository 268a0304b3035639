//! キャッシュリソース
//!
//! 保存されたレスポンス表現と、その鮮度・有効期限に関する
//! RFC 7234の計算を提供します。

use super::control::CacheControl;
use super::header::HeaderMap;
use super::storage::{Body, StoredResponse};
use std::time::{Duration, SystemTime};

/// Last-Modifiedからのヒューリスティック鮮度の除数
///
/// 明示的な有効期限が無い場合、`(now - Last-Modified) / 10`を
/// 鮮度として採用する（RFC 7234 Section 4.2.2の慣行）。
const LAST_MODIFIED_DIVISOR: u32 = 10;

/// 113警告を付与する経過時間の閾値
const HEURISTIC_WARNING_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// キャッシュされたレスポンス表現
///
/// ステータス・ヘッダー・ボディハンドルに加えて、解析済みの
/// `Cache-Control`と明示的無効化のマーカーを保持します。
/// 保存後のステータスとヘッダーはfreshen以外では変化しません。
#[derive(Debug, Clone)]
pub struct Resource {
    status: u16,
    header: HeaderMap,
    body: Body,
    cc: Option<CacheControl>,
    stale: bool,
}

impl Resource {
    /// ステータス・ヘッダー・ボディからリソースを作成
    ///
    /// `Cache-Control`は複数行を結合して解析します。解析に失敗した場合は
    /// ディレクティブ無しとして保持し、キャッシュ可否判定側で
    /// 「解析不能＝キャッシュ不可」と扱います。
    pub fn new(status: u16, header: HeaderMap, body: Body) -> Self {
        let cc = match header.combined("Cache-Control") {
            Some(raw) => CacheControl::parse(&raw).ok(),
            None => Some(CacheControl::default()),
        };

        Self {
            status,
            header,
            body,
            cc,
            stale: false,
        }
    }

    /// ストアから取り出したレスポンスをリソース化
    pub fn from_stored(stored: StoredResponse) -> Self {
        Self::new(stored.status, stored.header, stored.body)
    }

    /// ステータスコード
    #[inline]
    pub fn status(&self) -> u16 {
        self.status
    }

    /// レスポンスヘッダー
    #[inline]
    pub fn header(&self) -> &HeaderMap {
        &self.header
    }

    /// ヘッダーを置換（検証成功後のfreshenで使用）
    pub fn set_header(&mut self, header: HeaderMap) {
        self.cc = match header.combined("Cache-Control") {
            Some(raw) => CacheControl::parse(&raw).ok(),
            None => Some(CacheControl::default()),
        };
        self.header = header;
    }

    /// ボディハンドル
    #[inline]
    pub fn body(&self) -> &Body {
        &self.body
    }

    /// 明示的に無効化されたかどうか
    #[inline]
    pub fn is_stale(&self) -> bool {
        self.stale
    }

    /// 無効化マーカーを設定
    pub fn set_stale(&mut self, stale: bool) {
        self.stale = stale;
    }

    /// 解析済みCache-Control
    ///
    /// `None`はヘッダーが解析不能だったことを意味します。
    pub fn cache_control(&self) -> Option<&CacheControl> {
        self.cc.as_ref()
    }

    /// 現在の経過時間（秒）を計算
    ///
    /// 保存済みレスポンスの`Age`ヘッダーは保存時点で伝搬遅延を補正済みの
    /// 値が入っているため、ここでは`(now - Date) + Age`で十分です。
    /// `Date`が無い場合は`Age`のみ、どちらも無ければ`None`
    /// （呼び出し側は再検証が必要と扱う）。
    pub fn age(&self, now: SystemTime) -> Option<u64> {
        let age_header = self.header.int("Age");

        if let Some(date) = self.header.date("Date") {
            let apparent = now
                .duration_since(date)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            return Some(apparent + age_header.unwrap_or(0));
        }

        age_header
    }

    /// 有効な最大鮮度（秒）を計算
    ///
    /// 共有キャッシュでは`s-maxage`を優先し、次に`max-age`、
    /// 次に`Expires - now`。いずれも無ければ0（明示的な有効期限なし）。
    /// 期限切れの`Expires`は負値になります。
    pub fn max_age(&self, shared: bool, now: SystemTime) -> i64 {
        if let Some(cc) = &self.cc {
            if shared {
                if let Some(d) = cc.duration("s-maxage") {
                    if d.as_secs() > 0 {
                        return d.as_secs() as i64;
                    }
                }
            }

            if let Some(d) = cc.duration("max-age") {
                if d.as_secs() > 0 {
                    return d.as_secs() as i64;
                }
            }
        }

        if let Some(expires) = self.header.date("Expires") {
            return match expires.duration_since(now) {
                Ok(d) => d.as_secs() as i64,
                Err(e) => -(e.duration().as_secs() as i64),
            };
        }

        0
    }

    /// 鮮度に関わらず再検証が必須かどうか
    ///
    /// `must-revalidate`、共有キャッシュでの`proxy-revalidate`、
    /// 共有キャッシュでの`s-maxage`（proxy-revalidateを含意）、
    /// または明示的無効化マーカーで真になります。
    pub fn must_validate(&self, shared: bool) -> bool {
        if self.stale {
            return true;
        }

        match &self.cc {
            Some(cc) => {
                cc.has("must-revalidate")
                    || (shared && cc.has("proxy-revalidate"))
                    || (shared && cc.has("s-maxage"))
            }
            None => false,
        }
    }

    /// 明示的な有効期限を持つかどうか
    ///
    /// `max-age > 0`、`s-maxage > 0`、または解析可能な`Expires`。
    pub fn has_explicit_expiration(&self) -> bool {
        if let Some(cc) = &self.cc {
            if let Some(d) = cc.duration("max-age") {
                if d.as_secs() > 0 {
                    return true;
                }
            }
            if let Some(d) = cc.duration("s-maxage") {
                if d.as_secs() > 0 {
                    return true;
                }
            }
        }

        self.header.date("Expires").is_some()
    }

    /// 検証子（`ETag`または`Last-Modified`）を持つかどうか
    pub fn has_validators(&self) -> bool {
        self.header.contains("ETag") || self.header.contains("Last-Modified")
    }

    /// ヒューリスティック鮮度（秒）
    ///
    /// 明示的な有効期限が無く`Last-Modified`がある場合のみ、
    /// `(now - Last-Modified) / 10`。
    pub fn heuristic_freshness(&self, now: SystemTime) -> u64 {
        if self.has_explicit_expiration() {
            return 0;
        }

        match self.header.date("Last-Modified") {
            Some(lm) => now
                .duration_since(lm)
                .map(|d| (d / LAST_MODIFIED_DIVISOR).as_secs())
                .unwrap_or(0),
            None => 0,
        }
    }

    /// 付与すべきWarningヘッダー値
    ///
    /// 経過時間とヒューリスティック鮮度がどちらも24時間を超える場合に
    /// 113警告（Heuristic Expiration）を返します。
    pub fn warnings(&self, now: SystemTime) -> Vec<&'static str> {
        let mut warns = Vec::new();

        let day = HEURISTIC_WARNING_AGE.as_secs();
        if let Some(age) = self.age(now) {
            if age > day && self.heuristic_freshness(now) > day {
                warns.push(r#"113 - "Heuristic Expiration""#);
            }
        }

        warns
    }

    /// エラーでないステータス（200以上400未満）かどうか
    #[inline]
    pub fn is_non_error_status(&self) -> bool {
        (200..400).contains(&self.status)
    }

    /// `Last-Modified`を時刻として取得
    pub fn last_modified(&self) -> Option<SystemTime> {
        self.header.date("Last-Modified")
    }

    /// `private`フィールドリストに列挙されたヘッダーを除去
    ///
    /// 共有キャッシュが`Cache-Control: private="X, Y"`付きのレスポンスを
    /// 保存する際、保存前に呼び出します。
    pub fn remove_private_headers(&mut self) {
        let names: Vec<String> = match &self.cc {
            Some(cc) => cc
                .values("private")
                .iter()
                .flat_map(|v| v.split(','))
                .map(|n| n.trim().to_string())
                .filter(|n| !n.is_empty())
                .collect(),
            None => return,
        };

        for name in names {
            self.header.remove(&name);
        }
    }
}

/// 伝搬遅延とクロックスキューを補正した経過時間を計算
///
/// RFC 7234 Section 4.2.3のアルゴリズム:
/// `corrected_initial_age = max(apparent_age, Age + response_delay)`、
/// これに滞留時間を加えたものが現在の経過時間。
/// `Date`ヘッダーが無い場合は計算不能で`None`。
pub fn corrected_age(
    header: &HeaderMap,
    request_time: SystemTime,
    response_time: SystemTime,
    now: SystemTime,
) -> Option<Duration> {
    let date = header.date("Date")?;

    let apparent_age = response_time
        .duration_since(date)
        .unwrap_or(Duration::ZERO);

    let response_delay = response_time
        .duration_since(request_time)
        .unwrap_or(Duration::ZERO);
    let age_value = Duration::from_secs(header.int("Age").unwrap_or(0));
    let corrected_age_value = age_value + response_delay;

    let corrected_initial_age = apparent_age.max(corrected_age_value);

    let resident_time = now.duration_since(response_time).unwrap_or(Duration::ZERO);

    Some(corrected_initial_age + resident_time)
}
