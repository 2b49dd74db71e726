// ============================================================================
// src/sockbuf.rs - Socket Byte Queue
// ============================================================================
//!
//! # ソケットバイトキュー
//!
//! ソケット片方向（送信/受信）ごとのバッファFIFO。
//!
//! ## 会計
//! - `data_bytes`: 収容バッファのペイロード長の総和
//! - `overhead_bytes`: 収容バッファの（メタデータ+確保容量）の総和
//!
//! 両カウンタは常にキュー内容の総和と一致する。`space()`は負値を
//! 取り得る（過充填の一時的な容認）。フロー制御の判断材料になる。

#![allow(dead_code)]

use alloc::collections::VecDeque;

use crate::buf::BufHandle;
use crate::socket::types::{SocketError, SocketResult};

/// reserve()が受け付ける上限（これ以上は拒否）
pub const RESERVE_LIMIT_MAX: usize = 65536;

/// ソケットバイトキュー
pub struct SockBuf {
    /// バッファFIFO
    bufs: VecDeque<BufHandle>,
    /// ペイロードバイト総和
    data_bytes: usize,
    /// オーバーヘッドバイト総和
    overhead_bytes: usize,
    /// ペイロードバイト上限
    data_limit: usize,
    /// オーバーヘッドバイト上限（reserve時に2*limit）
    overhead_limit: usize,
    /// 低水位マーク（ストリーム送信の受理判断）
    low_water: usize,
}

impl SockBuf {
    /// 空のキューを作成（カウンタ/上限はゼロ）
    pub const fn new() -> Self {
        Self {
            bufs: VecDeque::new(),
            data_bytes: 0,
            overhead_bytes: 0,
            data_limit: 0,
            overhead_limit: 0,
            low_water: 0,
        }
    }

    /// バッファを末尾に追加
    ///
    /// 先にソケット後方参照を必ず切り離す。キュー上のバッファが
    /// ソケットへの参照を持ち続けると、データが残る限りソケットの
    /// 参照カウントがゼロに到達できなくなる。
    pub fn append(&mut self, mut buf: BufHandle) {
        buf.detach_socket();
        self.data_bytes += buf.len();
        self.overhead_bytes += buf.overhead();
        self.bufs.push_back(buf);
    }

    /// 圧縮付き追加
    ///
    /// 空ペイロードは即解放（何も送らない送信でキューを伸ばさない）。
    /// 末尾バッファと結合してその総容量に収まるなら、必要に応じて
    /// 末尾のペイロードを領域先頭へ詰めてから追記し、`buf`を解放する。
    /// 結合できなければ通常のappendへ。
    pub fn append_and_compress(&mut self, buf: BufHandle) {
        if buf.is_empty() {
            return;
        }
        if let Some(tail) = self.bufs.back_mut() {
            if tail.len() + buf.len() <= tail.capacity() {
                if tail.tailroom() < buf.len() {
                    tail.shift_to_front();
                }
                tail.append_data(buf.data());
                self.data_bytes += buf.len();
                return;
            }
        }
        self.append(buf);
    }

    /// 先頭からちょうどnバイトを除去
    ///
    /// 先頭バッファがnバイトより多く持つなら前方を剥がして終了、
    /// そうでなければバッファ全体を解放して続行する。nが残っている
    /// のにキューが尽きた場合はロジックエラーとして診断する。
    pub fn drop_bytes(&mut self, mut n: usize) {
        while n > 0 {
            let Some(front) = self.bufs.front_mut() else {
                log::error!("sockbuf: drop({n}) ran past the end of the queue");
                return;
            };
            let len = front.len();
            if len > n {
                front.pull_front(n);
                self.data_bytes -= n;
                return;
            }
            let overhead = front.overhead();
            self.bufs.pop_front();
            self.data_bytes -= len;
            self.overhead_bytes -= overhead;
            n -= len;
        }
    }

    /// 先頭バッファを除去・解放
    pub fn drop_first(&mut self) {
        if let Some(front) = self.bufs.pop_front() {
            self.data_bytes -= front.len();
            self.overhead_bytes -= front.overhead();
        }
    }

    /// 先頭バッファを取り出す（カウンタ調整つき）
    ///
    /// キュー投入モードのアプリケーションが受信キューを排出するのに使う。
    pub fn pop_front(&mut self) -> Option<BufHandle> {
        let front = self.bufs.pop_front()?;
        self.data_bytes -= front.len();
        self.overhead_bytes -= front.overhead();
        Some(front)
    }

    /// 全バッファを解放してカウンタをゼロに
    pub fn flush(&mut self) {
        self.bufs.clear();
        self.data_bytes = 0;
        self.overhead_bytes = 0;
    }

    /// バイト上限を設定
    ///
    /// 65536以上は拒否。オーバーヘッド上限は2倍（小さいバッファが
    /// 多数並ぶケースでヘッダ分の膨張を許容する）。低水位マークは
    /// `[1, limit]`に収める。上限ゼロは会計の無効化であり、低水位
    /// マークもゼロに戻す。
    pub fn reserve(&mut self, limit: usize) -> SocketResult<()> {
        if limit >= RESERVE_LIMIT_MAX {
            return Err(SocketError::InvalidArgument);
        }
        self.data_limit = limit;
        self.overhead_limit = 2 * limit;
        self.low_water = if limit == 0 {
            0
        } else {
            self.low_water.clamp(1, limit)
        };
        Ok(())
    }

    /// 低水位マークを設定（次のreserveでクランプされる）
    #[inline]
    pub fn set_low_water(&mut self, low_water: usize) {
        self.low_water = low_water;
    }

    /// 残り受け入れ余地（符号付き）
    ///
    /// 過充填されていれば負。呼び出し側はこれで受理/背圧を判断する。
    #[inline]
    pub fn space(&self) -> isize {
        let data = self.data_limit as isize - self.data_bytes as isize;
        let overhead = self.overhead_limit as isize - self.overhead_bytes as isize;
        data.min(overhead)
    }

    /// ペイロードバイト総和
    #[inline(always)]
    pub fn data_bytes(&self) -> usize {
        self.data_bytes
    }

    /// オーバーヘッドバイト総和
    #[inline(always)]
    pub fn overhead_bytes(&self) -> usize {
        self.overhead_bytes
    }

    /// ペイロードバイト上限
    #[inline(always)]
    pub fn data_limit(&self) -> usize {
        self.data_limit
    }

    /// オーバーヘッドバイト上限
    #[inline(always)]
    pub fn overhead_limit(&self) -> usize {
        self.overhead_limit
    }

    /// 低水位マーク
    #[inline(always)]
    pub fn low_water(&self) -> usize {
        self.low_water
    }

    /// キューが空か
    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.bufs.is_empty()
    }

    /// 収容バッファ数
    #[inline(always)]
    pub fn buf_count(&self) -> usize {
        self.bufs.len()
    }

    /// 会計の自己修復監査
    ///
    /// 実リストから両カウンタを再計算し、不一致はログに残して修正する。
    /// ホットパスでは使わない診断用。
    pub fn check(&mut self) {
        let mut data = 0usize;
        let mut overhead = 0usize;
        for buf in &self.bufs {
            data += buf.len();
            overhead += buf.overhead();
        }
        if data != self.data_bytes {
            log::warn!(
                "sockbuf: data_bytes mismatch (counted {} recorded {})",
                data,
                self.data_bytes
            );
            self.data_bytes = data;
        }
        if overhead != self.overhead_bytes {
            log::warn!(
                "sockbuf: overhead_bytes mismatch (counted {} recorded {})",
                overhead,
                self.overhead_bytes
            );
            self.overhead_bytes = overhead;
        }
    }
}

impl Default for SockBuf {
    fn default() -> Self {
        Self::new()
    }
}

// =====================================================
// テスト
// =====================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buf::Buf;

    fn simple(len: usize) -> BufHandle {
        let mut buf = Buf::alloc(0, 0, len.max(1)).unwrap();
        buf.shift_to_front();
        let data = alloc::vec![7u8; len];
        buf.append_data(&data);
        buf
    }

    #[test]
    fn test_counters_track_contents() {
        let mut sb = SockBuf::new();
        let b1 = simple(10);
        let b2 = simple(20);
        let expected_overhead = b1.overhead() + b2.overhead();
        sb.append(b1);
        sb.append(b2);

        assert_eq!(sb.data_bytes(), 30);
        assert_eq!(sb.overhead_bytes(), expected_overhead);
        assert_eq!(sb.buf_count(), 2);

        sb.drop_first();
        assert_eq!(sb.data_bytes(), 20);
        sb.flush();
        assert_eq!(sb.data_bytes(), 0);
        assert_eq!(sb.overhead_bytes(), 0);
        assert!(sb.is_empty());
    }

    #[test]
    fn test_reserve_and_space() {
        let mut sb = SockBuf::new();
        sb.reserve(100).unwrap();
        assert_eq!(sb.space(), 100);
        assert_eq!(sb.overhead_limit(), 200);
        assert!(sb.low_water() >= 1 && sb.low_water() <= 100);

        assert_eq!(
            sb.reserve(RESERVE_LIMIT_MAX),
            Err(SocketError::InvalidArgument)
        );
    }

    #[test]
    fn test_reserve_clamps_low_water() {
        let mut sb = SockBuf::new();
        sb.set_low_water(500);
        sb.reserve(100).unwrap();
        assert_eq!(sb.low_water(), 100);

        // 上限ゼロは会計の無効化: 低水位マークも上限を超えない
        sb.reserve(0).unwrap();
        assert_eq!(sb.low_water(), 0);
        assert_eq!(sb.space(), 0);
    }

    #[test]
    fn test_space_goes_negative_past_limit() {
        let mut sb = SockBuf::new();
        sb.reserve(400).unwrap();

        // 150バイトずつ: 2個までは合計300 <= 400で非負、3個目で負へ
        sb.append(simple(150));
        assert!(sb.space() >= 0, "space={} after 150", sb.space());
        sb.append(simple(150));
        assert!(sb.space() >= 0, "space={} after 300", sb.space());
        sb.append(simple(150));
        assert!(sb.space() < 0, "space={} after 450", sb.space());
    }

    #[test]
    fn test_drop_bytes_partial_and_whole() {
        let mut sb = SockBuf::new();
        sb.append(simple(10));
        sb.append(simple(10));

        // 先頭の一部だけ剥がす
        sb.drop_bytes(4);
        assert_eq!(sb.data_bytes(), 16);
        assert_eq!(sb.buf_count(), 2);

        // 先頭の残り+2個目の一部
        sb.drop_bytes(8);
        assert_eq!(sb.data_bytes(), 8);
        assert_eq!(sb.buf_count(), 1);

        // 過剰要求は診断されるがpanicしない
        sb.drop_bytes(100);
        assert!(sb.is_empty());
    }

    #[test]
    fn test_append_and_compress_merges_into_tail() {
        let mut sb = SockBuf::new();
        // 余裕のある末尾バッファ
        let mut tail = Buf::alloc(0, 0, 64).unwrap();
        tail.shift_to_front();
        tail.append_data(&[1, 2, 3]);
        sb.append(tail);
        let overhead_before = sb.overhead_bytes();

        let mut add = Buf::alloc(0, 0, 8).unwrap();
        add.shift_to_front();
        add.append_data(&[4, 5]);
        sb.append_and_compress(add);

        // 結合された: バッファ数は増えず、データだけ増える
        assert_eq!(sb.buf_count(), 1);
        assert_eq!(sb.data_bytes(), 5);
        assert_eq!(sb.overhead_bytes(), overhead_before);

        let merged = sb.pop_front().unwrap();
        assert_eq!(merged.data(), &[1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_append_and_compress_shifts_when_tailroom_short() {
        let mut sb = SockBuf::new();
        // 末尾寄せのウィンドウ: tailroomはほぼゼロだが容量には収まる
        let mut tail = Buf::alloc(0, 4, 64).unwrap();
        tail.append_data(&[1, 2, 3, 4]);
        assert!(tail.tailroom() < 8);
        sb.append(tail);

        let mut add = Buf::alloc(0, 0, 8).unwrap();
        add.shift_to_front();
        add.append_data(&[5, 6, 7, 8]);
        sb.append_and_compress(add);

        assert_eq!(sb.buf_count(), 1);
        let merged = sb.pop_front().unwrap();
        assert_eq!(merged.data(), &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_append_and_compress_frees_empty() {
        let mut sb = SockBuf::new();
        sb.append_and_compress(Buf::alloc(0, 0, 8).unwrap());
        assert!(sb.is_empty());
        assert_eq!(sb.data_bytes(), 0);
    }

    #[test]
    fn test_check_self_heals() {
        let mut sb = SockBuf::new();
        sb.append(simple(10));
        // カウンタを故意に壊す
        sb.data_bytes = 999;
        sb.overhead_bytes = 1;
        sb.check();
        assert_eq!(sb.data_bytes(), 10);
        assert!(sb.overhead_bytes() > 10);
    }
}
