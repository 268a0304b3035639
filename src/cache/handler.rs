//! リクエストパイプライン
//!
//! リクエストの分類、ストア照会、鮮度判定、再検証、配信、保存、無効化を
//! 調停するステートマシンです。
//!
//! ```text
//! ADMIT → CLASSIFY → [LOOKUP → FRESHNESS → VALIDATE]? → SERVE/PASS/PIPE
//! ```

use super::clock::Clock;
use super::control::CacheControl;
use super::coordinator::Cache;
use super::header::HeaderMap;
use super::key::Key;
use super::resource::{corrected_age, Resource};
use super::storage::{Body, StoreError};
use super::streamer::{ClientSink, ResponseStreamer};
use super::upstream::{HttpRequest, Upstream, UpstreamBody};
use super::validator::{validate, Validation};
use ftlog::{debug, error};
use once_cell::sync::Lazy;
use std::collections::HashSet;
use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;
use std::time::Duration;

/// キャッシュ結果を通知するヘッダー
pub const CACHE_HEADER: &str = "X-Cache";

/// PASS時にキャッシュの現在時刻を通知するヘッダー
pub const PROXY_DATE_HEADER: &str = "Proxy-Date";

/// デフォルトのVia仮名
pub const DEFAULT_PSEUDONYM: &str = "httpcache";

/// ボディ配信時のチャンクサイズ
const BODY_CHUNK_SIZE: usize = 64 * 1024;

/// 保存を許可するステータスコード
static STOREABLE_STATUSES: Lazy<HashSet<u16>> =
    Lazy::new(|| [200, 301, 302, 303, 304, 307, 404, 410].into_iter().collect());

/// `public`があればデフォルトでキャッシュ可能なステータスコード
static CACHEABLE_BY_DEFAULT: Lazy<HashSet<u16>> =
    Lazy::new(|| [200, 203, 204, 300, 301, 404, 410].into_iter().collect());

/// キャッシュハンドラー
///
/// コーディネーターとアップストリームを束ね、リクエストごとの
/// ステートマシンを実行します。ワーカー間で共有されます。
pub struct CacheHandler<U> {
    shared: bool,
    pseudonym: Box<str>,
    upstream: U,
    cache: Arc<Cache>,
    clock: Arc<dyn Clock>,
}

/// 解析済みリクエストとキャッシュ用メタデータ
struct CacheRequest<'a> {
    req: &'a HttpRequest,
    key: Key,
    cc: CacheControl,
}

impl<'a> CacheRequest<'a> {
    fn new(req: &'a HttpRequest) -> Result<Self, &'static str> {
        let cc = match req.header.combined("Cache-Control") {
            Some(raw) => {
                CacheControl::parse(&raw).map_err(|_| "invalid cache-control header")?
            }
            None => CacheControl::default(),
        };

        if req.is_http11() && req.host.is_empty() {
            return Err("host header can't be empty");
        }

        Ok(Self {
            req,
            key: Key::from_request(req),
            cc,
        })
    }

    /// リクエスト自体がキャッシュと対話できるかどうか
    fn is_cacheable(&self) -> bool {
        if !(self.req.method.as_ref() == "GET" || self.req.method.as_ref() == "HEAD") {
            return false;
        }

        if self.req.header.contains("If-Match")
            || self.req.header.contains("If-Unmodified-Since")
            || self.req.header.contains("If-Range")
        {
            return false;
        }

        if self.cc.has("no-store") || self.cc.has("no-cache") {
            return false;
        }

        if self.cc.get("max-age") == Some("0") {
            return false;
        }

        if let Some(pragma) = self.req.header.get("Pragma") {
            if pragma.eq_ignore_ascii_case("no-cache") {
                return false;
            }
        }

        true
    }

    /// 状態変更メソッドかどうか
    fn is_state_changing(&self) -> bool {
        matches!(
            self.req.method.as_ref(),
            "POST" | "PUT" | "DELETE" | "PATCH"
        )
    }
}

impl<U: Upstream> CacheHandler<U> {
    /// ハンドラーを作成
    ///
    /// デフォルトはプライベートキャッシュ・仮名`httpcache`。
    pub fn new(cache: Arc<Cache>, upstream: U, clock: Arc<dyn Clock>) -> Self {
        Self {
            shared: false,
            pseudonym: DEFAULT_PSEUDONYM.into(),
            upstream,
            cache,
            clock,
        }
    }

    /// 共有キャッシュセマンティクスの有効・無効を設定
    pub fn set_shared(&mut self, shared: bool) {
        self.shared = shared;
    }

    /// Via仮名を設定
    pub fn set_pseudonym(&mut self, pseudonym: &str) {
        self.pseudonym = pseudonym.into();
    }

    /// リクエストを処理する
    ///
    /// 返り値のエラーはクライアント接続への書き込み失敗のみで、
    /// それ以外の障害はエラーレスポンスとして処理されます。
    pub async fn handle<S: ClientSink>(
        &self,
        req: &HttpRequest,
        sink: &mut S,
    ) -> std::io::Result<()> {
        let creq = match CacheRequest::new(req) {
            Ok(c) => c,
            Err(msg) => return http_error(sink, 400, msg).await,
        };

        if !creq.is_cacheable() {
            debug!("request not cacheable");
            return self.pipe_upstream(sink, &creq).await;
        }

        let cache_type = if self.shared { "shared" } else { "private" };

        let res = match self.lookup(&creq) {
            Ok(res) => Some(res),
            Err(StoreError::NotFound) => None,
            Err(StoreError::Io(e)) => {
                error!("cache lookup failed: {}", e);
                return http_error(sink, 500, "cache lookup error").await;
            }
        };

        let mut res = match res {
            Some(res) => {
                debug!("{} {} found in {} cache", req.method, creq.key, cache_type);
                res
            }
            None => {
                if creq.cc.has("only-if-cached") {
                    return http_error(sink, 504, "key not in cache").await;
                }
                debug!("{} {} not in {} cache", req.method, creq.key, cache_type);
                return self.pass_upstream(sink, &creq).await;
            }
        };

        if self.needs_validation(&res, &creq) {
            if creq.cc.has("only-if-cached") {
                return http_error(sink, 504, "key was in cache, but required validation")
                    .await;
            }

            debug!("validating cached response");
            match validate(&self.upstream, req, &res, self.clock.as_ref()).await {
                Validation::Valid(new_header) => {
                    debug!("response is valid");
                    if let Err(e) = self.cache.freshen(
                        res.status(),
                        &new_header,
                        &[creq.key.clone()],
                        self.clock.now(),
                    ) {
                        error!("freshen of {} failed: {}", creq.key, e);
                    }
                    res.set_header(new_header);
                    res.set_stale(false);
                }
                Validation::Changed => {
                    debug!("response is changed");
                    return self.pass_upstream(sink, &creq).await;
                }
            }
        }

        debug!("serving from cache");
        self.serve_resource(&res, sink, &creq).await
    }

    /// プライマリキー（HEADはGETへのフォールバック付き）と
    /// Varyセカンダリキーでリソースを検索する
    fn lookup(&self, creq: &CacheRequest<'_>) -> Result<Resource, StoreError> {
        let res = match self.cache.retrieve(&creq.key) {
            Ok(res) => res,
            Err(StoreError::NotFound) if creq.req.method.as_ref() == "HEAD" => {
                let res = self.cache.retrieve(&creq.key.for_method("GET"))?;
                return if res.has_explicit_expiration() {
                    debug!("using cached GET request for serving HEAD");
                    Ok(res)
                } else {
                    Err(StoreError::NotFound)
                };
            }
            Err(e) => return Err(e),
        };

        // Varyがあればセカンダリキーで引き直す
        if let Some(vary) = res.header().get("Vary") {
            let vary = vary.to_string();
            return self.cache.retrieve(&creq.key.vary(&vary, creq.req));
        }

        Ok(res)
    }

    /// リソースの残り鮮度（秒）を計算
    ///
    /// リクエストの`max-age`は有効期限の上限として働き、
    /// ヒューリスティック鮮度は明示的な値より大きければ採用されます。
    /// 経過時間が計算できない場合は`None`（要検証）。
    fn freshness(&self, res: &Resource, creq: &CacheRequest<'_>) -> Option<i64> {
        let now = self.clock.now();
        let mut max_age = res.max_age(self.shared, now);

        if let Some(req_max_age) = creq.cc.duration("max-age") {
            let req_max_age = req_max_age.as_secs() as i64;
            if req_max_age < max_age {
                debug!("using request max-age of {}s", req_max_age);
                max_age = req_max_age;
            }
        }

        let age = res.age(now)?;

        if res.is_stale() {
            return Some(0);
        }

        let heuristic = res.heuristic_freshness(now) as i64;
        if heuristic > max_age {
            debug!("using heuristic freshness of {}s", heuristic);
            max_age = heuristic;
        }

        Some(max_age - age as i64)
    }

    /// 配信前に再検証が必要かどうか
    fn needs_validation(&self, res: &Resource, creq: &CacheRequest<'_>) -> bool {
        if res.must_validate(self.shared) {
            return true;
        }

        let freshness = match self.freshness(res, creq) {
            Some(f) => f,
            None => {
                debug!("error calculating freshness");
                return true;
            }
        };

        if let Some(min_fresh) = creq.cc.duration("min-fresh") {
            if freshness < min_fresh.as_secs() as i64 {
                debug!(
                    "resource is fresh, but won't satisfy min-fresh of {}s",
                    min_fresh.as_secs()
                );
                return true;
            }
        }

        debug!("resource has a freshness of {}s", freshness);

        if freshness <= 0 && creq.cc.has("max-stale") {
            if creq.cc.values("max-stale").is_empty() {
                debug!("resource is stale, but client sent max-stale");
                return false;
            } else if let Some(max_stale) = creq.cc.duration("max-stale") {
                if max_stale.as_secs() as i64 >= -freshness {
                    debug!(
                        "resource is stale, but within allowed max-stale period of {}s",
                        max_stale.as_secs()
                    );
                    return false;
                }
            }
        }

        freshness <= 0
    }

    /// レスポンスが保存可能かどうか（ヘッダーのみで判定）
    fn is_cacheable_response(&self, res: &Resource, creq: &CacheRequest<'_>) -> bool {
        let cc = match res.cache_control() {
            Some(cc) => cc,
            None => {
                error!("error parsing response cache-control");
                return false;
            }
        };

        if cc.has("no-cache") || cc.has("no-store") {
            return false;
        }

        // 値なしのprivateは共有キャッシュで保存不可。
        // フィールドリスト付きは保存可能だが該当ヘッダーは保存前に除去される。
        if self.shared && cc.has("private") && cc.values("private").is_empty() {
            return false;
        }

        if let Some(vary) = res.header().get("Vary") {
            if vary.trim() == "*" {
                return false;
            }
        }

        if !STOREABLE_STATUSES.contains(&res.status()) {
            return false;
        }

        if self.shared
            && creq.req.header.contains("Authorization")
            && !(cc.has("s-maxage") || cc.has("must-revalidate") || cc.has("public"))
        {
            return false;
        }

        // 有効期限はこのキャッシュのモードで評価する。プライベートキャッシュに
        // とってs-maxageのみのレスポンスは期限情報を持たない。
        let now = self.clock.now();
        let has_usable_expiration =
            res.max_age(self.shared, now) > 0 || res.header().date("Expires").is_some();

        if has_usable_expiration || res.has_validators() || res.heuristic_freshness(now) > 0 {
            return true;
        }

        CACHEABLE_BY_DEFAULT.contains(&res.status()) && cc.has("public")
    }

    /// アップストリームへ転送し、保存せずにそのまま中継する
    ///
    /// HEADレスポンスは既存GETエントリのメタデータをfreshenし、
    /// 状態変更メソッドの成功はGET/HEADキーを無効化します。
    async fn pipe_upstream<S: ClientSink>(
        &self,
        sink: &mut S,
        creq: &CacheRequest<'_>,
    ) -> std::io::Result<()> {
        let mut outreq = creq.req.clone();
        outreq.header.strip_hop_by_hop();

        debug!("piping request upstream");
        let (head, mut body) = match self.upstream.forward(&outreq).await {
            Ok(r) => r,
            Err(e) => {
                error!("upstream request failed: {}", e);
                return http_error(sink, 502, "bad gateway").await;
            }
        };

        let mut out = head.header.clone();
        out.set(CACHE_HEADER, "SKIP");
        self.append_via(&mut out);

        let mut streamer = ResponseStreamer::passthrough(sink);
        streamer.write_head(head.status, &out).await?;
        loop {
            match body.chunk().await {
                Ok(Some(chunk)) => streamer.write_chunk(&chunk).await?,
                Ok(None) => break,
                Err(e) => {
                    debug!("error reading upstream body: {}", e);
                    return Err(e);
                }
            }
        }

        let probe = Resource::new(head.status, head.header.clone(), Body::empty());

        if creq.req.method.as_ref() == "HEAD" {
            if probe.is_non_error_status() {
                let mut freshen_header = head.header.clone();
                freshen_header.strip_hop_by_hop();
                if let Err(e) = self.cache.freshen(
                    head.status,
                    &freshen_header,
                    &[creq.key.for_method("GET")],
                    self.clock.now(),
                ) {
                    error!("freshen from HEAD failed: {}", e);
                }
            }
        } else if creq.is_state_changing() && probe.is_non_error_status() {
            debug!("invalidating GET/HEAD keys for {}", creq.key);
            self.cache.invalidate(
                &[creq.key.for_method("GET"), creq.key.for_method("HEAD")],
                self.clock.now(),
            );
        }

        Ok(())
    }

    /// アップストリームへ転送し、結果をクライアントへ流しつつ保存する
    async fn pass_upstream<S: ClientSink>(
        &self,
        sink: &mut S,
        creq: &CacheRequest<'_>,
    ) -> std::io::Result<()> {
        let mut outreq = creq.req.clone();
        outreq.header.strip_hop_by_hop();

        let request_time = self.clock.now();
        debug!("passing request upstream");

        let (head, mut body) = match self.upstream.forward(&outreq).await {
            Ok(r) => r,
            Err(e) => {
                error!("upstream request failed: {}", e);
                return http_error(sink, 502, "bad gateway").await;
            }
        };
        let response_time = self.clock.now();

        // ボディに触れる前にヘッダーのみで保存可否を判定する
        let probe = Resource::new(head.status, head.header.clone(), Body::empty());
        if !self.is_cacheable_response(&probe, creq) {
            debug!("resource is uncacheable");
            let mut out = head.header.clone();
            out.set(CACHE_HEADER, "SKIP");
            self.append_via(&mut out);

            let mut streamer = ResponseStreamer::passthrough(sink);
            streamer.write_head(head.status, &out).await?;
            loop {
                match body.chunk().await {
                    Ok(Some(chunk)) => streamer.write_chunk(&chunk).await?,
                    Ok(None) => break,
                    Err(e) => return Err(e),
                }
            }
            return Ok(());
        }

        let mut stored_header = head.header.clone();
        stored_header.strip_hop_by_hop();

        if let Some(age) = corrected_age(&head.header, request_time, response_time, self.clock.now())
        {
            let mut buf = itoa::Buffer::new();
            stored_header.set("Age", buf.format(ceil_secs(age)));
        } else {
            debug!("error calculating corrected age");
        }
        stored_header.set_date(PROXY_DATE_HEADER, self.clock.now());
        self.append_via(&mut stored_header);

        let mut out = stored_header.clone();
        out.set(CACHE_HEADER, "MISS");

        let mut streamer = ResponseStreamer::capturing(sink);
        streamer.write_head(head.status, &out).await?;
        loop {
            match body.chunk().await {
                Ok(Some(chunk)) => {
                    if let Err(e) = streamer.write_chunk(&chunk).await {
                        // クライアント切断。キャプチャは不完全なので保存しない。
                        debug!("client write failed during capture: {}", e);
                        return Err(e);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!("error reading upstream body: {}", e);
                    return Err(e);
                }
            }
        }

        let capture = streamer
            .into_capture()
            .expect("capturing streamer always has a buffer");
        let mut resource = Resource::new(
            head.status,
            stored_header,
            Body::from_bytes(capture.to_vec()),
        );

        if self.shared {
            resource.remove_private_headers();
        }

        let mut keys = vec![creq.key.clone()];
        if let Some(vary) = resource.header().get("Vary") {
            keys.push(creq.key.vary(vary, creq.req));
        }

        self.store_async(resource, keys);
        Ok(())
    }

    /// リソースを非同期にストアへ書き込む
    fn store_async(&self, res: Resource, keys: Vec<Key>) {
        let cache = Arc::clone(&self.cache);
        let guard = cache.pending_writes().begin();

        monoio::spawn(async move {
            let _guard = guard;
            let names: Vec<String> = keys.iter().map(|k| k.string()).collect();
            if let Err(e) = cache.store(&res, &keys) {
                error!("storing resource under {:?} failed: {}", names, e);
            } else {
                debug!("stored resource under {:?}", names);
            }
        });
    }

    /// 保存済みリソースをクライアントへ配信する
    async fn serve_resource<S: ClientSink>(
        &self,
        res: &Resource,
        sink: &mut S,
        creq: &CacheRequest<'_>,
    ) -> std::io::Result<()> {
        let now = self.clock.now();
        let mut out = res.header().clone();

        let age = match res.age(now) {
            Some(age) => age,
            None => return http_error(sink, 500, "error calculating age").await,
        };

        for warning in res.warnings(now) {
            out.add("Warning", warning);
        }

        match self.freshness(res, creq) {
            Some(freshness) if freshness > 0 => {}
            _ => out.add("Warning", r#"110 - "Response is Stale""#),
        }

        let mut buf = itoa::Buffer::new();
        out.set("Age", buf.format(age));
        self.append_via(&mut out);
        out.set(CACHE_HEADER, "HIT");

        if res.status() == 200 {
            self.serve_content(res, out, sink, creq).await
        } else {
            sink.write_head(res.status(), &out).await?;
            if creq.req.method.as_ref() != "HEAD" {
                copy_body(res, sink, 0, res.body().len()).await?;
            }
            Ok(())
        }
    }

    /// 200レスポンスの条件付き・レンジ対応配信
    ///
    /// `If-None-Match`/`If-Modified-Since`に304で応え、単一レンジの
    /// `Range`には206で応えます。複数レンジはフル200へフォールバック。
    async fn serve_content<S: ClientSink>(
        &self,
        res: &Resource,
        mut out: HeaderMap,
        sink: &mut S,
        creq: &CacheRequest<'_>,
    ) -> std::io::Result<()> {
        let is_head = creq.req.method.as_ref() == "HEAD";

        if let Some(if_none_match) = creq.req.header.get("If-None-Match") {
            if etag_matches(if_none_match, res.header().get("ETag")) {
                out.remove("Content-Type");
                out.remove("Content-Length");
                return sink.write_head(304, &out).await;
            }
        } else if let Some(since) = creq.req.header.date("If-Modified-Since") {
            if let Some(last_modified) = res.last_modified() {
                if last_modified <= since {
                    out.remove("Content-Type");
                    out.remove("Content-Length");
                    return sink.write_head(304, &out).await;
                }
            }
        }

        let total = res.body().len();

        if let Some(range_header) = creq.req.header.get("Range") {
            match parse_range(range_header, total) {
                RangeSpec::Satisfiable(start, end) => {
                    let len = end - start + 1;
                    let mut buf = itoa::Buffer::new();
                    out.set("Content-Length", buf.format(len));
                    out.set(
                        "Content-Range",
                        &format!("bytes {}-{}/{}", start, end, total),
                    );
                    out.set("Accept-Ranges", "bytes");
                    sink.write_head(206, &out).await?;
                    if !is_head {
                        copy_body(res, sink, start, len).await?;
                    }
                    return Ok(());
                }
                RangeSpec::Unsatisfiable => {
                    out.remove("Content-Length");
                    out.set("Content-Range", &format!("bytes */{}", total));
                    return sink.write_head(416, &out).await;
                }
                RangeSpec::Ignore => {}
            }
        }

        let mut buf = itoa::Buffer::new();
        out.set("Content-Length", buf.format(total));
        out.set("Accept-Ranges", "bytes");
        sink.write_head(200, &out).await?;
        if !is_head {
            copy_body(res, sink, 0, total).await?;
        }
        Ok(())
    }

    /// Viaヘッダーに自身のトークンを追記する
    fn append_via(&self, header: &mut HeaderMap) {
        let token = format!("1.1 {}", self.pseudonym);

        match header.get("Via") {
            Some(existing) => {
                if existing.split(',').any(|t| t.trim() == token) {
                    return;
                }
                let combined = format!("{}, {}", existing, token);
                header.set("Via", &combined);
            }
            None => header.set("Via", &token),
        }
    }
}

/// レンジ指定の解析結果
enum RangeSpec {
    /// 充足可能な単一レンジ（開始・終了は両端を含む）
    Satisfiable(u64, u64),
    /// レンジ外
    Unsatisfiable,
    /// レンジとして扱わない（不正な形式・複数レンジ）
    Ignore,
}

/// `Range`ヘッダーを解析（単一レンジのみ対応）
fn parse_range(header: &str, total: u64) -> RangeSpec {
    let spec = match header.strip_prefix("bytes=") {
        Some(s) => s.trim(),
        None => return RangeSpec::Ignore,
    };

    if spec.contains(',') {
        // 複数レンジはフルレスポンスへフォールバック
        return RangeSpec::Ignore;
    }

    let (start, end) = match spec.split_once('-') {
        Some(parts) => parts,
        None => return RangeSpec::Ignore,
    };

    if start.is_empty() {
        // suffix形式: bytes=-n（末尾nバイト）
        let n: u64 = match end.parse() {
            Ok(n) => n,
            Err(_) => return RangeSpec::Ignore,
        };
        if n == 0 || total == 0 {
            return RangeSpec::Unsatisfiable;
        }
        let n = n.min(total);
        return RangeSpec::Satisfiable(total - n, total - 1);
    }

    let start: u64 = match start.parse() {
        Ok(s) => s,
        Err(_) => return RangeSpec::Ignore,
    };
    if start >= total {
        return RangeSpec::Unsatisfiable;
    }

    let end: u64 = if end.is_empty() {
        total - 1
    } else {
        match end.parse::<u64>() {
            Ok(e) => e.min(total - 1),
            Err(_) => return RangeSpec::Ignore,
        }
    };

    if end < start {
        return RangeSpec::Ignore;
    }

    RangeSpec::Satisfiable(start, end)
}

/// `If-None-Match`とETagの比較（強一致）
fn etag_matches(if_none_match: &str, etag: Option<&str>) -> bool {
    if if_none_match.trim() == "*" {
        return etag.is_some();
    }

    match etag {
        Some(etag) => if_none_match.split(',').any(|t| t.trim() == etag),
        None => false,
    }
}

/// 保存済みボディをシンクへコピーする
async fn copy_body<S: ClientSink>(
    res: &Resource,
    sink: &mut S,
    start: u64,
    len: u64,
) -> std::io::Result<()> {
    let mut reader = res.body().reader()?;
    if start > 0 {
        reader.seek(SeekFrom::Start(start))?;
    }

    let mut remaining = len;
    let mut buf = vec![0u8; BODY_CHUNK_SIZE];
    while remaining > 0 {
        let want = (remaining as usize).min(buf.len());
        let n = reader.read(&mut buf[..want])?;
        if n == 0 {
            break;
        }
        sink.write_body(&buf[..n]).await?;
        remaining -= n as u64;
    }
    Ok(())
}

/// プレーンテキストのエラーレスポンスを書き込む
async fn http_error<S: ClientSink>(
    sink: &mut S,
    status: u16,
    message: &str,
) -> std::io::Result<()> {
    let body = format!("{}\n", message);
    let mut header = HeaderMap::new();
    header.set("Content-Type", "text/plain; charset=utf-8");
    let mut buf = itoa::Buffer::new();
    header.set("Content-Length", buf.format(body.len()));

    sink.write_head(status, &header).await?;
    sink.write_body(body.as_bytes()).await
}

/// 秒への切り上げ
fn ceil_secs(d: Duration) -> u64 {
    if d.subsec_nanos() > 0 {
        d.as_secs() + 1
    } else {
        d.as_secs()
    }
}
