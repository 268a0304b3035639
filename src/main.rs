use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

mod cache;

use cache::{
    BackendKind, Cache, CacheConfig, CacheHandler, ClientSink, HeaderMap, HttpRequest,
    ResponseHead, SystemClock, Upstream, UpstreamBody, CACHE_HEADER,
};
use ftlog::{error, info, warn};
use httparse::{Request, Status};
use monoio::io::{AsyncReadRent, AsyncWriteRentExt};
use monoio::net::{TcpListener, TcpStream};
use monoio::time::timeout;
use monoio::RuntimeBuilder;
use serde::Deserialize;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use time::OffsetDateTime;

// ====================
// 定数定義
// ====================

// パースエラー用静的レスポンス（ハンドラー到達前のエラー）
static ERR_MSG_BAD_REQUEST: &[u8] =
    b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
static ERR_MSG_REQUEST_TOO_LARGE: &[u8] =
    b"HTTP/1.1 413 Request Entity Too Large\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

// バッファサイズ
const BUF_SIZE: usize = 65536; // 64KB

// セキュリティ制限
const MAX_HEADER_SIZE: usize = 8192; // 8KB - ヘッダーサイズ上限
const MAX_BODY_SIZE: usize = 10485760; // 10MB - バッファするボディの上限

// タイムアウト設定
const READ_TIMEOUT: Duration = Duration::from_secs(30);
const WRITE_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

// バックエンドコネクションプール設定
const BACKEND_POOL_MAX_IDLE_PER_HOST: usize = 8;
const BACKEND_POOL_IDLE_TIMEOUT_SECS: u64 = 30;

// ====================
// Graceful Shutdown フラグ
// ====================

static SHUTDOWN_FLAG: AtomicBool = AtomicBool::new(false);

// ====================
// バックエンドコネクションプール
// ====================
//
// スレッドローカルなコネクションプールにより、バックエンドへの接続を
// 再利用します。ホスト:ポートをキーにしています。
// ====================

/// プールされた接続のエントリ
struct PooledConnection {
    stream: TcpStream,
    created_at: std::time::Instant,
}

impl PooledConnection {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            created_at: std::time::Instant::now(),
        }
    }

    /// 接続がまだ有効かどうかを判定（タイムアウトチェック）
    fn is_valid(&self) -> bool {
        self.created_at.elapsed().as_secs() < BACKEND_POOL_IDLE_TIMEOUT_SECS
    }
}

struct HttpConnectionPool {
    connections: HashMap<String, VecDeque<PooledConnection>>,
}

impl HttpConnectionPool {
    fn new() -> Self {
        Self {
            connections: HashMap::new(),
        }
    }

    /// プールから接続を取得（有効な接続がなければNone）
    fn get(&mut self, key: &str) -> Option<TcpStream> {
        if let Some(queue) = self.connections.get_mut(key) {
            while let Some(entry) = queue.pop_front() {
                if entry.is_valid() {
                    return Some(entry.stream);
                }
                // 無効な接続は破棄
            }
        }
        None
    }

    /// 接続をプールに返却
    fn put(&mut self, key: String, stream: TcpStream) {
        let queue = self.connections.entry(key).or_insert_with(VecDeque::new);

        while queue.len() >= BACKEND_POOL_MAX_IDLE_PER_HOST {
            queue.pop_front();
        }

        queue.push_back(PooledConnection::new(stream));
    }
}

thread_local! {
    static HTTP_POOL: RefCell<HttpConnectionPool> = RefCell::new(HttpConnectionPool::new());
}

// ====================
// バッファプール
// ====================

thread_local! {
    static BUF_POOL: RefCell<Vec<Vec<u8>>> = RefCell::new(
        (0..32).map(|_| vec![0u8; BUF_SIZE]).collect()
    );
}

/// バッファ取得ヘルパー
#[inline(always)]
fn buf_get() -> Vec<u8> {
    BUF_POOL.with(|p| p.borrow_mut().pop().unwrap_or_else(|| vec![0u8; BUF_SIZE]))
}

/// バッファ返却ヘルパー
///
/// 前回のリクエストデータが残らないよう、長さをクリアしてから
/// ゼロ初期化して返却します。
#[inline(always)]
fn buf_put(mut buf: Vec<u8>) {
    BUF_POOL.with(|p| {
        let mut pool = p.borrow_mut();
        if pool.len() < 128 {
            buf.clear();
            buf.resize(BUF_SIZE, 0);
            pool.push(buf);
        }
    });
}

// ====================
// 設定構造体
// ====================

#[derive(Deserialize)]
struct Config {
    server: ServerConfigSection,
    upstream: UpstreamConfigSection,
    #[serde(default)]
    cache: CacheConfig,
}

#[derive(Deserialize)]
struct ServerConfigSection {
    listen: String,
}

#[derive(Deserialize)]
struct UpstreamConfigSection {
    url: String,
}

/// プロキシ先ターゲット
#[derive(Clone)]
struct ProxyTarget {
    host: String,
    port: u16,
    path_prefix: String,
}

impl ProxyTarget {
    fn parse(url: &str) -> Option<Self> {
        let rest = url.strip_prefix("http://")?;

        let (host_port, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, "/"),
        };

        let (host, port) = match host_port.find(':') {
            Some(idx) => {
                let h = &host_port[..idx];
                let p = host_port[idx + 1..].parse().ok()?;
                (h.to_string(), p)
            }
            None => (host_port.to_string(), 80),
        };

        Some(ProxyTarget {
            host,
            port,
            path_prefix: path.trim_end_matches('/').to_string(),
        })
    }

    fn pool_key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// デフォルトポートかどうかを判定
    #[inline]
    fn is_default_port(&self) -> bool {
        self.port == 80
    }
}

fn load_config(path: &Path) -> io::Result<Config> {
    let config_str = std::fs::read_to_string(path)?;
    let config: Config = toml::from_str(&config_str)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("TOML parse error: {}", e)))?;

    config
        .cache
        .validate()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    Ok(config)
}

// ====================
// HTTPヘッダー検証（Header Injection防止）
// ====================
//
// httparseがパースしたヘッダーを再検証し、不正な文字を含むヘッダーを
// 除外することで、HTTP Request Smuggling攻撃を防止します。
// ====================

/// ヘッダー名が有効か検証（RFC 7230 token準拠）
#[inline]
fn is_valid_header_name(name: &[u8]) -> bool {
    if name.is_empty() {
        return false;
    }

    name.iter().all(|&c| {
        c.is_ascii_alphanumeric()
            || matches!(
                c,
                b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.'
                    | b'^' | b'_' | b'`' | b'|' | b'~'
            )
    })
}

/// ヘッダー値が有効か検証（CR/LF/NUL禁止）
#[inline]
fn is_valid_header_value(value: &[u8]) -> bool {
    value.iter().all(|&c| c != b'\r' && c != b'\n' && c != 0)
}

/// Transfer-Encodingヘッダー値からchunkedかどうかを判定
///
/// カンマ区切りの最後の要素がchunkedであることを確認します。
#[inline]
fn is_chunked_encoding(value: &[u8]) -> bool {
    let value_str = match std::str::from_utf8(value) {
        Ok(s) => s,
        Err(_) => return false,
    };

    value_str
        .rsplit(',')
        .next()
        .map(|t| t.trim().eq_ignore_ascii_case("chunked"))
        .unwrap_or(false)
}

// ====================
// Chunked Transfer Encoding デコーダ（RFC 7230 Section 4.1 準拠）
// ====================
//
// Chunked-Bodyの構文:
//   chunked-body   = *chunk last-chunk trailer-part CRLF
//   chunk          = chunk-size [ chunk-ext ] CRLF chunk-data CRLF
//
// キャッシュはペイロードのオクテットを保存するため、終端検出に加えて
// チャンクデータの抽出も行います。トレーラーは読み飛ばします。
// ====================

/// Chunkedデコーダの状態
#[derive(Debug, Clone, Copy, PartialEq)]
enum ChunkedState {
    /// チャンクサイズの16進数を読み取り中
    ReadingChunkSize,
    /// チャンク拡張（;以降）を読み取り中
    ReadingChunkExtension,
    /// チャンクサイズ行の\r後、\nを期待
    ExpectingChunkSizeLF,
    /// チャンクデータを読み取り中
    ReadingChunkData,
    /// チャンクデータ後の\rを期待
    ExpectingChunkDataCR,
    /// チャンクデータ後の\nを期待
    ExpectingChunkDataLF,
    /// トレーラーヘッダーまたは終端の空行を読み取り中
    ReadingTrailerLine,
    /// トレーラー行の\r後、\nを期待
    ExpectingTrailerLF,
    /// 転送完了
    Complete,
}

/// Chunked転送デコーダ（ステートマシン）
struct ChunkedDecoder {
    state: ChunkedState,
    chunk_remaining: u64,
    size_accumulator: u64,
    size_has_digit: bool,
    trailer_line_empty: bool,
}

impl ChunkedDecoder {
    fn new() -> Self {
        Self {
            state: ChunkedState::ReadingChunkSize,
            chunk_remaining: 0,
            size_accumulator: 0,
            size_has_digit: false,
            trailer_line_empty: true,
        }
    }

    /// 入力を処理してペイロードを`out`へ追記する
    ///
    /// 消費したバイト数と転送完了フラグを返します。
    fn decode(&mut self, input: &[u8], out: &mut Vec<u8>) -> (usize, bool) {
        for (i, &byte) in input.iter().enumerate() {
            if self.state == ChunkedState::Complete {
                return (i, true);
            }
            if self.feed_byte(byte, out) {
                return (i + 1, true);
            }
        }
        (input.len(), false)
    }

    /// 1バイトを処理して状態を更新。完了した場合はtrueを返す。
    #[inline]
    fn feed_byte(&mut self, byte: u8, out: &mut Vec<u8>) -> bool {
        match self.state {
            ChunkedState::ReadingChunkSize => match byte {
                b'0'..=b'9' => {
                    self.size_accumulator = self
                        .size_accumulator
                        .saturating_mul(16)
                        .saturating_add((byte - b'0') as u64);
                    self.size_has_digit = true;
                }
                b'a'..=b'f' => {
                    self.size_accumulator = self
                        .size_accumulator
                        .saturating_mul(16)
                        .saturating_add((byte - b'a' + 10) as u64);
                    self.size_has_digit = true;
                }
                b'A'..=b'F' => {
                    self.size_accumulator = self
                        .size_accumulator
                        .saturating_mul(16)
                        .saturating_add((byte - b'A' + 10) as u64);
                    self.size_has_digit = true;
                }
                b';' => {
                    self.state = ChunkedState::ReadingChunkExtension;
                }
                b'\r' => {
                    self.state = ChunkedState::ExpectingChunkSizeLF;
                }
                _ => {
                    // 不正な文字はスキップ（緩い解析）
                }
            },

            ChunkedState::ReadingChunkExtension => {
                if byte == b'\r' {
                    self.state = ChunkedState::ExpectingChunkSizeLF;
                }
            }

            ChunkedState::ExpectingChunkSizeLF => {
                if byte == b'\n' {
                    if !self.size_has_digit {
                        self.state = ChunkedState::ReadingChunkSize;
                    } else if self.size_accumulator == 0 {
                        // 最後のチャンク - トレーラーセクションへ
                        self.state = ChunkedState::ReadingTrailerLine;
                        self.trailer_line_empty = true;
                    } else {
                        self.chunk_remaining = self.size_accumulator;
                        self.state = ChunkedState::ReadingChunkData;
                    }
                    self.size_accumulator = 0;
                    self.size_has_digit = false;
                } else {
                    self.state = ChunkedState::ReadingChunkSize;
                    self.size_accumulator = 0;
                    self.size_has_digit = false;
                }
            }

            ChunkedState::ReadingChunkData => {
                out.push(byte);
                self.chunk_remaining = self.chunk_remaining.saturating_sub(1);
                if self.chunk_remaining == 0 {
                    self.state = ChunkedState::ExpectingChunkDataCR;
                }
            }

            ChunkedState::ExpectingChunkDataCR => {
                if byte == b'\r' {
                    self.state = ChunkedState::ExpectingChunkDataLF;
                } else {
                    self.state = ChunkedState::ReadingChunkSize;
                }
            }

            ChunkedState::ExpectingChunkDataLF => {
                self.state = ChunkedState::ReadingChunkSize;
            }

            ChunkedState::ReadingTrailerLine => match byte {
                b'\r' => {
                    self.state = ChunkedState::ExpectingTrailerLF;
                }
                _ => {
                    self.trailer_line_empty = false;
                }
            },

            ChunkedState::ExpectingTrailerLF => {
                if byte == b'\n' {
                    if self.trailer_line_empty {
                        self.state = ChunkedState::Complete;
                        return true;
                    } else {
                        self.state = ChunkedState::ReadingTrailerLine;
                        self.trailer_line_empty = true;
                    }
                } else {
                    self.state = ChunkedState::ReadingTrailerLine;
                    self.trailer_line_empty = false;
                }
            }

            ChunkedState::Complete => {
                return true;
            }
        }
        false
    }
}

// ====================
// アップストリームフォワーダー
// ====================
//
// キャッシュコアのUpstreamトレイトをバックエンドへの実接続で実装します。
// レスポンスヘッダーを先にパースして返し、ボディはフレーミング
// （Content-Length / chunked / EOF）に従ってストリームとして取り出します。
// ====================

#[derive(Clone)]
struct ProxyUpstream {
    target: Arc<ProxyTarget>,
}

impl ProxyUpstream {
    /// バックエンドへのリクエストバイト列を構築
    fn build_request(&self, req: &HttpRequest) -> Vec<u8> {
        let path = if self.target.path_prefix.is_empty() {
            req.path_and_query()
        } else {
            format!("{}{}", self.target.path_prefix, req.path_and_query())
        };

        let mut request = Vec::with_capacity(1024);
        request.extend_from_slice(req.method.as_bytes());
        request.extend_from_slice(b" ");
        request.extend_from_slice(path.as_bytes());
        request.extend_from_slice(b" HTTP/1.1\r\nHost: ");
        request.extend_from_slice(self.target.host.as_bytes());

        if !self.target.is_default_port() {
            request.extend_from_slice(b":");
            let mut port_buf = itoa::Buffer::new();
            request.extend_from_slice(port_buf.format(self.target.port).as_bytes());
        }

        request.extend_from_slice(b"\r\n");

        for (name, value) in req.header.iter() {
            // hostとconnectionは別途処理済みのためスキップ
            if name.eq_ignore_ascii_case("host") || name.eq_ignore_ascii_case("connection") {
                continue;
            }
            if name.eq_ignore_ascii_case("content-length") {
                continue;
            }

            // Header Injection防止: ヘッダー名と値の再検証
            if !is_valid_header_name(name.as_bytes()) {
                warn!("invalid header name detected, skipping: {:?}", name);
                continue;
            }
            if !is_valid_header_value(value.as_bytes()) {
                warn!("invalid header value detected, skipping header: {:?}", name);
                continue;
            }

            request.extend_from_slice(name.as_bytes());
            request.extend_from_slice(b": ");
            request.extend_from_slice(value.as_bytes());
            request.extend_from_slice(b"\r\n");
        }

        if !req.body.is_empty() {
            request.extend_from_slice(b"Content-Length: ");
            let mut len_buf = itoa::Buffer::new();
            request.extend_from_slice(len_buf.format(req.body.len()).as_bytes());
            request.extend_from_slice(b"\r\n");
        }

        // バックエンドにはKeep-Aliveを要求
        request.extend_from_slice(b"Connection: keep-alive\r\n\r\n");
        request
    }

    /// プールまたは新規接続でバックエンドへ接続
    async fn connect(&self) -> io::Result<TcpStream> {
        if let Some(stream) = HTTP_POOL.with(|p| p.borrow_mut().get(&self.target.pool_key())) {
            return Ok(stream);
        }

        let addr = format!("{}:{}", self.target.host, self.target.port);
        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "backend connect timeout"))??;
        let _ = stream.set_nodelay(true);
        Ok(stream)
    }
}

impl Upstream for ProxyUpstream {
    type Body = ProxyBody;

    async fn forward(&self, req: &HttpRequest) -> io::Result<(ResponseHead, ProxyBody)> {
        let mut stream = self.connect().await?;

        // リクエスト送信
        let request = self.build_request(req);
        let (res, _) = timeout(WRITE_TIMEOUT, stream.write_all(request))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "backend write timeout"))?;
        res?;

        if !req.body.is_empty() {
            let (res, _) = timeout(WRITE_TIMEOUT, stream.write_all(req.body.clone()))
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "backend write timeout"))?;
            res?;
        }

        // レスポンスヘッダー受信
        let mut accumulated: Vec<u8> = Vec::with_capacity(BUF_SIZE);
        loop {
            let buf = buf_get();
            let read_result = timeout(READ_TIMEOUT, stream.read(buf)).await;
            let (res, returned_buf) = match read_result {
                Ok(r) => r,
                Err(_) => {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "backend read timeout"))
                }
            };

            let n = res?;
            if n == 0 {
                buf_put(returned_buf);
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "backend closed before sending headers",
                ));
            }

            accumulated.extend_from_slice(&returned_buf[..n]);
            buf_put(returned_buf);

            if accumulated.len() > MAX_HEADER_SIZE {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "backend response headers too large",
                ));
            }

            let mut headers_storage = [httparse::EMPTY_HEADER; 64];
            let mut response = httparse::Response::new(&mut headers_storage);
            match response.parse(&accumulated) {
                Ok(Status::Complete(header_len)) => {
                    let status = response.code.unwrap_or(502);
                    let version_minor = response.version.unwrap_or(1);

                    let mut header = HeaderMap::new();
                    let mut content_length: Option<u64> = None;
                    let mut chunked = false;
                    let mut backend_close = version_minor == 0;

                    for h in response.headers.iter() {
                        let value = match std::str::from_utf8(h.value) {
                            Ok(v) => v,
                            Err(_) => continue,
                        };
                        if h.name.eq_ignore_ascii_case("content-length") {
                            content_length = value.trim().parse().ok();
                        } else if h.name.eq_ignore_ascii_case("transfer-encoding") {
                            chunked = is_chunked_encoding(h.value);
                        } else if h.name.eq_ignore_ascii_case("connection") {
                            if value.eq_ignore_ascii_case("close") {
                                backend_close = true;
                            } else if value.eq_ignore_ascii_case("keep-alive") {
                                backend_close = false;
                            }
                        }
                        header.add(h.name, value);
                    }

                    let leftover = accumulated[header_len..].to_vec();

                    // フレーミングの決定
                    let framing = if req.method.as_ref() == "HEAD"
                        || status == 204
                        || status == 304
                        || (100..200).contains(&status)
                    {
                        Framing::None
                    } else if chunked {
                        Framing::Chunked(ChunkedDecoder::new())
                    } else if let Some(len) = content_length {
                        Framing::Remaining(len)
                    } else {
                        // 長さ不明: 接続クローズで終端
                        backend_close = true;
                        Framing::Eof
                    };

                    let body = ProxyBody {
                        stream: Some(stream),
                        pool_key: self.target.pool_key(),
                        framing,
                        leftover,
                        keep_alive: !backend_close,
                    };

                    return Ok((ResponseHead { status, header }, body));
                }
                Ok(Status::Partial) => continue,
                Err(_) => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "invalid backend response",
                    ));
                }
            }
        }
    }
}

/// ボディのフレーミング方式
enum Framing {
    /// ボディなし（HEAD・204・304）
    None,
    /// Content-Lengthの残りバイト数
    Remaining(u64),
    /// Transfer-Encoding: chunked
    Chunked(ChunkedDecoder),
    /// 接続クローズで終端
    Eof,
}

/// バックエンドレスポンスのボディストリーム
///
/// chunkedはデコードしてペイロードのみを返します。ボディを最後まで
/// 読み切った時点で、Keep-Alive可能な接続はプールへ返却されます。
struct ProxyBody {
    stream: Option<TcpStream>,
    pool_key: String,
    framing: Framing,
    leftover: Vec<u8>,
    keep_alive: bool,
}

impl ProxyBody {
    /// ボディ完了時の接続返却
    fn finish(&mut self) {
        if let Some(stream) = self.stream.take() {
            if self.keep_alive {
                let key = std::mem::take(&mut self.pool_key);
                HTTP_POOL.with(|p| p.borrow_mut().put(key, stream));
            }
            // keep_aliveでない接続はドロップでクローズ
        }
    }

    /// ストリームから次の生データを読む（leftover優先）
    async fn fill(&mut self) -> io::Result<Vec<u8>> {
        if !self.leftover.is_empty() {
            return Ok(std::mem::take(&mut self.leftover));
        }

        let stream = match self.stream.as_mut() {
            Some(s) => s,
            None => return Ok(Vec::new()),
        };

        let buf = buf_get();
        let (res, returned_buf) = timeout(READ_TIMEOUT, stream.read(buf))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "backend read timeout"))?;

        let n = res?;
        let data = returned_buf[..n].to_vec();
        buf_put(returned_buf);
        Ok(data)
    }
}

impl UpstreamBody for ProxyBody {
    async fn chunk(&mut self) -> io::Result<Option<Vec<u8>>> {
        loop {
            // 終端済みならストリームを返却して終わる
            if matches!(&self.framing, Framing::None | Framing::Remaining(0)) {
                self.finish();
                return Ok(None);
            }

            let mut data = self.fill().await?;

            match &mut self.framing {
                Framing::None | Framing::Remaining(0) => unreachable!(),

                Framing::Remaining(remaining) => {
                    if data.is_empty() {
                        return Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "backend closed mid-body",
                        ));
                    }

                    let want = (*remaining).min(data.len() as u64) as usize;
                    // Content-Lengthを超えた分は次のレスポンスの先頭（パイプライン）
                    if data.len() > want {
                        self.leftover = data.split_off(want);
                    }
                    *remaining -= want as u64;
                    return Ok(Some(data));
                }

                Framing::Chunked(decoder) => {
                    if data.is_empty() {
                        return Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "backend closed mid-chunked-body",
                        ));
                    }

                    let mut out = Vec::new();
                    let (consumed, done) = decoder.decode(&data, &mut out);

                    if done {
                        if consumed < data.len() {
                            self.leftover = data[consumed..].to_vec();
                        }
                        self.framing = Framing::None;
                        self.finish();
                        if out.is_empty() {
                            return Ok(None);
                        }
                        return Ok(Some(out));
                    }

                    if !out.is_empty() {
                        return Ok(Some(out));
                    }
                    // デコード出力がまだ無い場合は読み込みを継続
                }

                Framing::Eof => {
                    if data.is_empty() {
                        self.keep_alive = false;
                        self.finish();
                        return Ok(None);
                    }
                    return Ok(Some(data));
                }
            }
        }
    }
}

// ====================
// クライアントシンク
// ====================

/// ステータスコードの理由句
fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        410 => "Gone",
        413 => "Request Entity Too Large",
        416 => "Range Not Satisfiable",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        504 => "Gateway Timeout",
        s if (200..300).contains(&s) => "OK",
        s if (300..400).contains(&s) => "Redirect",
        s if (400..500).contains(&s) => "Client Error",
        _ => "Server Error",
    }
}

/// クライアント接続へのレスポンスシンク
///
/// ヘッダーのシリアライズとConnectionヘッダーの決定を担います。
/// Content-Lengthの無いボディ付きレスポンスは接続クローズで
/// フレーミングします。
struct TcpSink<'a> {
    stream: &'a mut TcpStream,
    client_wants_close: bool,
    is_head: bool,
    status: u16,
    cache_status: String,
    body_bytes: u64,
    close_after: bool,
}

impl<'a> TcpSink<'a> {
    fn new(stream: &'a mut TcpStream, client_wants_close: bool, is_head: bool) -> Self {
        Self {
            stream,
            client_wants_close,
            is_head,
            status: 0,
            cache_status: String::new(),
            body_bytes: 0,
            close_after: false,
        }
    }

    /// 接続を閉じるべきかどうか
    fn should_close(&self) -> bool {
        self.client_wants_close || self.close_after
    }

    async fn write_all(&mut self, data: Vec<u8>) -> io::Result<()> {
        let (res, _) = timeout(WRITE_TIMEOUT, self.stream.write_all(data))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "client write timeout"))?;
        res?;
        Ok(())
    }
}

impl ClientSink for TcpSink<'_> {
    async fn write_head(&mut self, status: u16, header: &HeaderMap) -> io::Result<()> {
        self.status = status;
        if let Some(cache_status) = header.get(CACHE_HEADER) {
            self.cache_status = cache_status.to_string();
        }

        let body_possible = !self.is_head && status != 204 && status != 304 && status >= 200;
        let has_length = header.contains("Content-Length");
        if body_possible && !has_length {
            // 長さ不明のボディは接続クローズで終端する
            self.close_after = true;
        }

        let mut out = Vec::with_capacity(512);
        out.extend_from_slice(b"HTTP/1.1 ");
        let mut status_buf = itoa::Buffer::new();
        out.extend_from_slice(status_buf.format(status).as_bytes());
        out.extend_from_slice(b" ");
        out.extend_from_slice(status_text(status).as_bytes());
        out.extend_from_slice(b"\r\n");

        for (name, value) in header.iter() {
            // Hop-by-hopヘッダーはこの接続のものを使う
            if name.eq_ignore_ascii_case("connection")
                || name.eq_ignore_ascii_case("keep-alive")
                || name.eq_ignore_ascii_case("transfer-encoding")
            {
                continue;
            }
            if !is_valid_header_value(value.as_bytes()) {
                warn!("invalid response header value, skipping: {:?}", name);
                continue;
            }
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }

        if self.should_close() {
            out.extend_from_slice(b"Connection: close\r\n\r\n");
        } else {
            out.extend_from_slice(b"Connection: keep-alive\r\n\r\n");
        }

        self.write_all(out).await
    }

    async fn write_body(&mut self, chunk: &[u8]) -> io::Result<()> {
        if chunk.is_empty() {
            return Ok(());
        }
        self.body_bytes += chunk.len() as u64;
        self.write_all(chunk.to_vec()).await
    }
}

// ====================
// リクエスト処理ループ
// ====================

/// リクエストボディを読み込む
///
/// Content-Lengthまたはchunkedに従ってボディ全体をバッファします。
/// 上限を超えた場合は`None`を返します。
async fn read_request_body(
    stream: &mut TcpStream,
    pending: &mut Vec<u8>,
    content_length: usize,
    is_chunked: bool,
) -> io::Result<Option<Vec<u8>>> {
    if is_chunked {
        let mut decoder = ChunkedDecoder::new();
        let mut body = Vec::new();

        loop {
            let data = std::mem::take(pending);
            let (consumed, done) = decoder.decode(&data, &mut body);
            if body.len() > MAX_BODY_SIZE {
                return Ok(None);
            }
            if done {
                *pending = data[consumed..].to_vec();
                return Ok(Some(body));
            }

            let buf = buf_get();
            let (res, returned_buf) = timeout(READ_TIMEOUT, stream.read(buf))
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "client read timeout"))?;
            let n = res?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "client closed mid-body",
                ));
            }
            pending.extend_from_slice(&returned_buf[..n]);
            buf_put(returned_buf);
        }
    }

    if content_length == 0 {
        return Ok(Some(Vec::new()));
    }
    if content_length > MAX_BODY_SIZE {
        return Ok(None);
    }

    while pending.len() < content_length {
        let buf = buf_get();
        let (res, returned_buf) = timeout(READ_TIMEOUT, stream.read(buf))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "client read timeout"))?;
        let n = res?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "client closed mid-body",
            ));
        }
        pending.extend_from_slice(&returned_buf[..n]);
        buf_put(returned_buf);
    }

    let rest = pending.split_off(content_length);
    let body = std::mem::replace(pending, rest);
    Ok(Some(body))
}

/// 接続単位のリクエスト処理ループ
async fn handle_requests(mut stream: TcpStream, handler: Arc<CacheHandler<ProxyUpstream>>) {
    let mut accumulated: Vec<u8> = Vec::with_capacity(BUF_SIZE);

    loop {
        // ヘッダーが揃うまで読み込み（アイドルタイムアウト付き）
        let header_len = loop {
            {
                let mut headers_storage = [httparse::EMPTY_HEADER; 64];
                let mut req = Request::new(&mut headers_storage);
                match req.parse(&accumulated) {
                    Ok(Status::Complete(header_len)) => break header_len,
                    Ok(Status::Partial) => {}
                    Err(_) => {
                        let _ = timeout(WRITE_TIMEOUT, stream.write_all(ERR_MSG_BAD_REQUEST.to_vec()))
                            .await;
                        return;
                    }
                }
            }

            if accumulated.len() > MAX_HEADER_SIZE {
                let _ =
                    timeout(WRITE_TIMEOUT, stream.write_all(ERR_MSG_REQUEST_TOO_LARGE.to_vec()))
                        .await;
                return;
            }

            let buf = buf_get();
            let read_result = timeout(IDLE_TIMEOUT, stream.read(buf)).await;
            let (res, returned_buf) = match read_result {
                Ok(r) => r,
                Err(_) => return, // アイドルタイムアウト
            };
            let n = match res {
                Ok(0) | Err(_) => {
                    buf_put(returned_buf);
                    return;
                }
                Ok(n) => n,
            };
            accumulated.extend_from_slice(&returned_buf[..n]);
            buf_put(returned_buf);
        };

        // リクエスト情報の抽出
        let mut headers_storage = [httparse::EMPTY_HEADER; 64];
        let mut parsed = Request::new(&mut headers_storage);
        if parsed.parse(&accumulated).is_err() {
            let _ = timeout(WRITE_TIMEOUT, stream.write_all(ERR_MSG_BAD_REQUEST.to_vec())).await;
            return;
        }

        let method = parsed.method.unwrap_or("GET").to_ascii_uppercase();
        let raw_path = parsed.path.unwrap_or("/").to_string();
        let version_minor = parsed.version.unwrap_or(1);

        let mut header = HeaderMap::new();
        let mut content_length: usize = 0;
        let mut is_chunked = false;
        let mut client_wants_close = version_minor == 0;

        for h in parsed.headers.iter() {
            if h.name.is_empty() {
                continue;
            }
            let value = match std::str::from_utf8(h.value) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if h.name.eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse().unwrap_or(0);
            } else if h.name.eq_ignore_ascii_case("transfer-encoding") {
                is_chunked = is_chunked_encoding(h.value);
            } else if h.name.eq_ignore_ascii_case("connection") {
                if value.eq_ignore_ascii_case("close") {
                    client_wants_close = true;
                } else if value.eq_ignore_ascii_case("keep-alive") {
                    client_wants_close = false;
                }
            }
            header.add(h.name, value);
        }
        drop(parsed);

        // ヘッダー後の先読みデータを切り出し
        let mut pending = accumulated.split_off(header_len);
        accumulated.clear();

        // ボディ読み込み
        let body = match read_request_body(&mut stream, &mut pending, content_length, is_chunked)
            .await
        {
            Ok(Some(body)) => body,
            Ok(None) => {
                let _ =
                    timeout(WRITE_TIMEOUT, stream.write_all(ERR_MSG_REQUEST_TOO_LARGE.to_vec()))
                        .await;
                return;
            }
            Err(_) => return,
        };
        accumulated = pending;

        // 絶対URI形式（プロキシリクエスト）とorigin-formの両方に対応
        let (host_from_uri, path) = match raw_path.strip_prefix("http://") {
            Some(rest) => match rest.find('/') {
                Some(idx) => (Some(rest[..idx].to_string()), rest[idx..].to_string()),
                None => (Some(rest.to_string()), "/".to_string()),
            },
            None => (None, raw_path),
        };

        let host = host_from_uri
            .or_else(|| header.get("Host").map(|h| h.to_string()))
            .unwrap_or_default();

        let (path_only, query) = match path.split_once('?') {
            Some((p, q)) => (p.to_string(), Some(q.to_string())),
            None => (path, None),
        };

        let request = HttpRequest {
            method: method.into(),
            scheme: "http".into(),
            host: host.into(),
            path: path_only.into(),
            query: query.map(Into::into),
            version_minor,
            header,
            body,
        };

        let start_time = OffsetDateTime::now_utc();
        let mut sink = TcpSink::new(&mut stream, client_wants_close, request.method.as_ref() == "HEAD");

        let result = handler.handle(&request, &mut sink).await;

        let status = sink.status;
        let cache_status = std::mem::take(&mut sink.cache_status);
        let body_bytes = sink.body_bytes;
        let should_close = sink.should_close();

        log_access(&request, status, body_bytes, &cache_status, start_time);

        if result.is_err() || should_close {
            return;
        }
        // Keep-Alive: ループを継続して次のリクエストを待機
    }
}

// ====================
// ロギング
// ====================

fn log_access(
    req: &HttpRequest,
    status: u16,
    resp_body_size: u64,
    cache_status: &str,
    start_time: OffsetDateTime,
) {
    let end_time = OffsetDateTime::now_utc();
    let duration_ms = (end_time - start_time).whole_milliseconds();
    let cache_status = if cache_status.is_empty() { "-" } else { cache_status };

    info!(
        "Access: time={} duration={}ms method={} path={} status={} cache={} req_body_size={} resp_body_size={}",
        start_time,
        duration_ms,
        req.method,
        req.path_and_query(),
        status,
        cache_status,
        req.body.len(),
        resp_body_size
    );
}

// ====================
// メイン関数
// ====================

fn main() {
    let _guard = ftlog::Builder::new().try_init().unwrap();

    let config = match load_config(Path::new("config.toml")) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config load error: {}", e);
            return;
        }
    };

    let listen_addr = config
        .server
        .listen
        .parse::<SocketAddr>()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 8080)));

    let target = match ProxyTarget::parse(&config.upstream.url) {
        Some(t) => Arc::new(t),
        None => {
            eprintln!("Invalid upstream URL: {}", config.upstream.url);
            return;
        }
    };

    let cache = match build_cache(&config.cache) {
        Ok(c) => Arc::new(c),
        Err(e) => {
            eprintln!("Cache init error: {}", e);
            return;
        }
    };

    let mut handler = CacheHandler::new(
        Arc::clone(&cache),
        ProxyUpstream {
            target: Arc::clone(&target),
        },
        Arc::new(SystemClock),
    );
    handler.set_shared(config.cache.shared);
    handler.set_pseudonym(&config.cache.pseudonym);
    let handler = Arc::new(handler);

    let hostname = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string());

    info!("============================================");
    info!("RFC 7234 Caching Reverse Proxy");
    info!("Hostname: {}", hostname);
    info!("Listen Address: {}", listen_addr);
    info!("Upstream: http://{}:{}", target.host, target.port);
    info!(
        "Cache: shared={} capacity={} backend={:?}",
        config.cache.shared, config.cache.capacity, config.cache.backend
    );
    info!("Threads: {}", num_cpus::get());
    info!("============================================");

    setup_signal_handler();

    let num_threads = num_cpus::get();
    let mut handles = Vec::with_capacity(num_threads);

    for thread_id in 0..num_threads {
        let handler_clone = Arc::clone(&handler);
        let addr = listen_addr;

        let handle = thread::spawn(move || {
            let mut rt = RuntimeBuilder::<monoio::IoUringDriver>::new()
                .enable_timer()
                .build()
                .expect("Failed to create runtime");
            rt.block_on(async move {
                let listener = match create_listener(addr) {
                    Ok(l) => l,
                    Err(e) => {
                        error!("[Thread {}] Bind error: {}", thread_id, e);
                        return;
                    }
                };

                info!("[Thread {}] Worker started", thread_id);

                loop {
                    if SHUTDOWN_FLAG.load(Ordering::Relaxed) {
                        info!("[Thread {}] Shutting down...", thread_id);
                        break;
                    }

                    // タイムアウト付きaccept（Graceful Shutdown対応）
                    let accept_result = timeout(Duration::from_secs(1), listener.accept()).await;

                    let (stream, _peer_addr) = match accept_result {
                        Ok(Ok(s)) => s,
                        Ok(Err(e)) => {
                            error!("[Thread {}] Accept error: {}", thread_id, e);
                            continue;
                        }
                        Err(_) => continue,
                    };

                    let _ = stream.set_nodelay(true);

                    let handler = Arc::clone(&handler_clone);
                    monoio::spawn(async move {
                        handle_requests(stream, handler).await;
                    });
                }

                info!("[Thread {}] Worker stopped", thread_id);
            });
        });
        handles.push(handle);
    }

    for handle in handles {
        let _ = handle.join();
    }

    info!("Server shutdown complete");
}

/// 設定からキャッシュを構築
fn build_cache(config: &CacheConfig) -> io::Result<Cache> {
    match config.backend {
        BackendKind::Memory => Ok(Cache::memory(config.capacity)),
        BackendKind::Disk => {
            let dir = config
                .dir
                .as_ref()
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "cache.dir required"))?;
            Cache::disk(dir, config.file_mode, config.capacity)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))
        }
    }
}

/// シグナルハンドラのセットアップ
fn setup_signal_handler() {
    ctrlc::set_handler(move || {
        info!("Received shutdown signal, initiating graceful shutdown...");
        SHUTDOWN_FLAG.store(true, Ordering::SeqCst);
    })
    .expect("Failed to set signal handler");
}

fn create_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let config = monoio::net::ListenerConfig::default()
        .reuse_port(true)
        .backlog(8192);
    TcpListener::bind_with_config(addr, &config)
}
