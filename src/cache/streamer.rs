//! レスポンスストリーマー
//!
//! アップストリームのボディをクライアントへ流しつつ、同時に
//! キャッシュ用のアーティファクトを組み立てるティーを提供します。

use super::header::HeaderMap;
use std::cell::RefCell;
use std::io;
use std::rc::Rc;

/// クライアント側レスポンスシンク
///
/// パイプラインが書き込む先。実サーバーではTCP接続、テストでは
/// キャプチャ構造体が実装します。
#[allow(async_fn_in_trait)]
pub trait ClientSink {
    /// ステータスとヘッダーを書き込む
    async fn write_head(&mut self, status: u16, header: &HeaderMap) -> io::Result<()>;

    /// ボディの断片を書き込む
    async fn write_body(&mut self, chunk: &[u8]) -> io::Result<()>;
}

/// 複数リーダー対応のキャプチャバッファ
///
/// ストリーマーが追記し、完了後に任意個のリーダーが独立した位置から
/// 同じバイト列を読み出せます。
#[derive(Clone, Default)]
pub struct CaptureBuffer {
    inner: Rc<RefCell<Vec<u8>>>,
}

impl CaptureBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn append(&self, data: &[u8]) {
        self.inner.borrow_mut().extend_from_slice(data);
    }

    /// 現在のバッファ長
    pub fn len(&self) -> usize {
        self.inner.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 先頭からのリーダーを作成
    pub fn reader(&self) -> CaptureReader {
        CaptureReader {
            buffer: self.clone(),
            pos: 0,
        }
    }

    /// バッファ全体をコピーして取り出す
    pub fn to_vec(&self) -> Vec<u8> {
        self.inner.borrow().clone()
    }
}

/// キャプチャバッファのリーダー
pub struct CaptureReader {
    buffer: CaptureBuffer,
    pos: usize,
}

impl io::Read for CaptureReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let inner = self.buffer.inner.borrow();
        let available = &inner[self.pos.min(inner.len())..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.pos += n;
        Ok(n)
    }
}

/// レスポンスストリーマー
///
/// クライアントシンクをラップし、書き込みを複製してキャプチャへも
/// 追記します。ヘッダーは一度だけ書き込まれます。クライアントへの
/// 書き込みエラーは呼び出し側へ伝搬しますが、キャプチャへの追記は
/// その前に完了しています。
pub struct ResponseStreamer<'a, S> {
    sink: &'a mut S,
    capture: Option<CaptureBuffer>,
    head_written: bool,
    status: u16,
}

impl<'a, S: ClientSink> ResponseStreamer<'a, S> {
    /// キャプチャ付きで作成（PASS用）
    pub fn capturing(sink: &'a mut S) -> Self {
        Self {
            sink,
            capture: Some(CaptureBuffer::new()),
            head_written: false,
            status: 0,
        }
    }

    /// パススルーのみで作成（PIPE/SKIP用）
    pub fn passthrough(sink: &'a mut S) -> Self {
        Self {
            sink,
            capture: None,
            head_written: false,
            status: 0,
        }
    }

    /// ヘッダーを書き込む（最初の一度だけ有効）
    pub async fn write_head(&mut self, status: u16, header: &HeaderMap) -> io::Result<()> {
        if self.head_written {
            return Ok(());
        }
        self.head_written = true;
        self.status = status;
        self.sink.write_head(status, header).await
    }

    /// ボディ断片を書き込み、キャプチャにも複製する
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()> {
        if let Some(capture) = &self.capture {
            capture.append(chunk);
        }
        self.sink.write_body(chunk).await
    }

    /// 書き込まれたステータス
    pub fn status(&self) -> u16 {
        self.status
    }

    /// キャプチャバッファを取り出す
    pub fn into_capture(self) -> Option<CaptureBuffer> {
        self.capture
    }
}
