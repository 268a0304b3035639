//! 条件付き再検証
//!
//! 保存済みリソースの検証子を使ってアップストリームへ条件付き
//! リクエストを発行し、レスポンスの検証子を比較して保存済み表現が
//! まだ有効かどうかを判定します。

use super::clock::Clock;
use super::header::HeaderMap;
use super::resource::{corrected_age, Resource};
use super::upstream::{HttpRequest, Upstream, UpstreamBody};
use ftlog::debug;

/// 検証結果
pub enum Validation {
    /// 保存済み表現は有効。freshen用の新ヘッダーを保持。
    Valid(HeaderMap),
    /// 表現が変化した。パイプラインはPASSへフォールバックする。
    Changed,
}

/// 比較対象の検証ヘッダー（この順で比較する）
const VALIDATION_HEADERS: &[&str] = &["ETag", "Content-MD5", "Last-Modified", "Content-Length"];

/// 保存済みリソースをアップストリームに対して検証
///
/// 保存済みの`ETag`があれば`If-None-Match`、無ければ`Last-Modified`を
/// `If-Modified-Since`として設定します。アップストリームに到達できない
/// 場合は`Changed`として扱います（保存済みリソースは変更しない）。
pub async fn validate<U: Upstream>(
    upstream: &U,
    req: &HttpRequest,
    res: &Resource,
    clock: &dyn Clock,
) -> Validation {
    let mut outreq = req.clone();
    outreq.header.strip_hop_by_hop();

    if let Some(etag) = res.header().get("ETag") {
        outreq.header.set("If-None-Match", etag);
    } else if let Some(last_modified) = res.header().get("Last-Modified") {
        outreq.header.set("If-Modified-Since", last_modified);
    }

    let request_time = clock.now();
    let (head, mut body) = match upstream.forward(&outreq).await {
        Ok(r) => r,
        Err(e) => {
            debug!("validation request failed: {}", e);
            return Validation::Changed;
        }
    };
    let response_time = clock.now();

    // 304のボディは空だが、ストリームは読み切って接続を解放する
    loop {
        match body.chunk().await {
            Ok(Some(_)) => continue,
            Ok(None) => break,
            Err(e) => {
                debug!("error draining validation response: {}", e);
                return Validation::Changed;
            }
        }
    }

    let mut new_header = head.header;
    if let Some(age) = corrected_age(&new_header, request_time, response_time, clock.now()) {
        let mut buf = itoa::Buffer::new();
        new_header.set("Age", buf.format(age.as_secs()));
    }
    new_header.set_date("Proxy-Date", clock.now());

    if validators_match(res.header(), &new_header) {
        Validation::Valid(new_header)
    } else {
        Validation::Changed
    }
}

/// 検証ヘッダーの一致を判定
///
/// 両方に存在するヘッダーは等値が必須。新レスポンスのみに存在する
/// ヘッダーは`ETag`と`Last-Modified`の場合のみ不一致として扱います。
pub fn validators_match(stored: &HeaderMap, new: &HeaderMap) -> bool {
    for name in VALIDATION_HEADERS {
        let new_value = match new.get(name) {
            Some(v) => v,
            None => continue,
        };

        match stored.get(name) {
            Some(stored_value) => {
                if stored_value != new_value {
                    debug!("{} changed, {:?} != {:?}", name, new_value, stored_value);
                    return false;
                }
            }
            None => {
                if name.eq_ignore_ascii_case("ETag")
                    || name.eq_ignore_ascii_case("Last-Modified")
                {
                    debug!("{} appeared on validation response", name);
                    return false;
                }
            }
        }
    }

    true
}
