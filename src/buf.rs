// ============================================================================
// src/buf.rs - Packet Buffer Arena
// ============================================================================
//!
//! # パケットバッファ
//!
//! データ領域とメタデータを一つのヒープ確保にまとめたパケット単位。
//!
//! ## 機能
//! - ヘッドルーム付き確保（プロトコル層が再確保なしでヘッダを前置できる）
//! - ヘッドルーム拡張（再配置 or 同一領域内シフト）
//! - クローン / ターンアラウンド / メタデータ複製
//!
//! ## 所有権
//! - 経路情報ブロックは複数バッファで共有（参照カウント）
//! - 先行ノードアドレスブロックは単独所有
//! - ソケットへの後方参照は弱い参照扱い: キュー投入時に必ず切り離す

#![allow(dead_code)]

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;

use crate::addr::{Ip6Addr, SockAddr6};
use crate::route::RouteInfo;
use crate::socket::SocketRef;

/// アロケータの丸め粒度
pub const ALLOC_CELL: usize = 4;

/// 確保サイズ上限（16bitサイズ天井）
pub const MAX_TOTAL_SIZE: usize = u16::MAX as usize;

/// スタック既定のヘッドルーム（IPv6ヘッダ+リンク層ヘッダ分）
pub const DEFAULT_HEADROOM: usize = 40;

/// スタック既定の最小確保サイズ
pub const DEFAULT_MIN_SIZE: usize = 96;

/// デフォルトホップリミット
pub const DEFAULT_HOP_LIMIT: u8 = 64;

/// フローラベル未指定マーカー
pub const FLOW_LABEL_UNSPEC: u32 = 0xffff_ffff;

bitflags! {
    /// パケット単位のブールオプション
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BufFlags: u16 {
        /// マルチキャストを自分にもループバックする
        const MCAST_LOOP   = 1 << 0;
        /// トンネル内パケット
        const TUNNELED     = 1 << 1;
        /// RPLエラー通知を伴う
        const RPL_ERROR    = 1 << 2;
        /// フラグメント禁止
        const DONT_FRAG    = 1 << 3;
        /// 最小MTUポリシーで送出
        const USE_MIN_MTU  = 1 << 4;
        /// リンク層セキュリティをバイパス
        const NO_SECURITY  = 1 << 5;
    }
}

/// パケット優先度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// IEEE 802.15.4 リンクメタデータ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Ieee802154Meta {
    /// リンク品質インジケータ
    pub lqi: u8,
    /// 受信信号強度
    pub rssi: i8,
    /// チャネル番号
    pub channel: u8,
    /// フレームペンディングビット
    pub frame_pending: bool,
}

/// リンク技術別メタデータ（タグ付きユニオン）
///
/// 現在は802.15.4のみだが、リンク技術の追加を閉ざさない。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkMeta {
    Ieee802154(Ieee802154Meta),
}

impl Default for LinkMeta {
    fn default() -> Self {
        LinkMeta::Ieee802154(Ieee802154Meta::default())
    }
}

/// バッファハンドル
///
/// 所有権を消費する操作（free/grow）はムーブで受け取るため、
/// 解放後のハンドルが残ることはない。
pub type BufHandle = Box<Buf>;

/// パケットバッファ
///
/// 固定長のバイト領域と `data_start`/`data_end` カーソル（ウィンドウ）、
/// およびパケットメタデータを保持する。
/// 不変条件: `0 <= data_start <= data_end <= capacity`
pub struct Buf {
    /// データ領域（1回のヒープ確保、長さ=capacity）
    storage: Box<[u8]>,
    /// データウィンドウ先頭
    data_start: usize,
    /// データウィンドウ終端
    data_end: usize,
    /// 送信元アドレス
    pub src: SockAddr6,
    /// 宛先アドレス
    pub dst: SockAddr6,
    /// ホップリミット
    pub hop_limit: u8,
    /// トラフィッククラス
    pub traffic_class: u8,
    /// フローラベル（FLOW_LABEL_UNSPEC = 未指定）
    pub flow_label: u32,
    /// ブールオプション
    pub flags: BufFlags,
    /// 優先度タグ
    pub priority: Priority,
    /// リンク技術別メタデータ
    pub link: LinkMeta,
    /// 共有経路情報（参照カウント共有、クローンには引き継がない）
    route: Option<Arc<RouteInfo>>,
    /// 先行ノードアドレス（単独所有）
    predecessor: Option<Box<Ip6Addr>>,
    /// ソケットへの後方参照（保持中はソケットの参照カウント+1）
    socket: Option<SocketRef>,
}

impl Buf {
    /// バッファ確保
    ///
    /// `total = max(headroom + size, min_total)` を粒度に丸めて確保する。
    /// 16bitサイズ天井を超えるか、メモリ枯渇時はNone。
    /// 成功時のウィンドウは `[total - size, total - size]`
    /// （headroomバイト以上の先行余白を持つ空ウィンドウ）。
    pub fn alloc(headroom: usize, size: usize, min_total: usize) -> Option<BufHandle> {
        let wanted = headroom.checked_add(size)?.max(min_total);
        let total = wanted.checked_add(ALLOC_CELL - 1)? & !(ALLOC_CELL - 1);
        if total > MAX_TOTAL_SIZE {
            return None;
        }

        // 失敗可能な確保のみを使う（枯渇はNoneで返す）
        let mut backing: Vec<u8> = Vec::new();
        backing.try_reserve_exact(total).ok()?;
        backing.resize(total, 0);

        Some(Box::new(Buf {
            storage: backing.into_boxed_slice(),
            data_start: total - size,
            data_end: total - size,
            src: SockAddr6::UNSPECIFIED,
            dst: SockAddr6::UNSPECIFIED,
            hop_limit: DEFAULT_HOP_LIMIT,
            traffic_class: 0,
            flow_label: FLOW_LABEL_UNSPEC,
            flags: BufFlags::empty(),
            priority: Priority::Normal,
            link: LinkMeta::default(),
            route: None,
            predecessor: None,
            socket: None,
        }))
    }

    /// ヘッドルームなしで確保
    #[inline]
    pub fn alloc_minimal(size: usize) -> Option<BufHandle> {
        Self::alloc(0, size, 0)
    }

    /// スタック既定のヘッドルーム/最小サイズで確保
    #[inline]
    pub fn alloc_default(size: usize) -> Option<BufHandle> {
        Self::alloc(DEFAULT_HEADROOM, size, DEFAULT_MIN_SIZE)
    }

    /// 総容量
    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// ペイロード長
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.data_end - self.data_start
    }

    /// ペイロードが空か
    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.data_start == self.data_end
    }

    /// 先行余白（ヘッダ前置に使える領域）
    #[inline(always)]
    pub fn headroom(&self) -> usize {
        self.data_start
    }

    /// 後続余白（追記に使える領域）
    #[inline(always)]
    pub fn tailroom(&self) -> usize {
        self.capacity() - self.data_end
    }

    /// ウィンドウ先頭オフセット
    #[inline(always)]
    pub fn data_start(&self) -> usize {
        self.data_start
    }

    /// ウィンドウ終端オフセット
    #[inline(always)]
    pub fn data_end(&self) -> usize {
        self.data_end
    }

    /// ペイロードスライス
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.storage[self.data_start..self.data_end]
    }

    /// 可変ペイロードスライス
    #[inline]
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.storage[self.data_start..self.data_end]
    }

    /// バイト会計上のオーバーヘッド（メタデータ+確保容量）
    #[inline]
    pub fn overhead(&self) -> usize {
        core::mem::size_of::<Buf>() + self.capacity()
    }

    /// ウィンドウ不変条件の検査（consistency-checksビルドのみ）
    ///
    /// 違反はプログラミングエラー検出器としての致命的halt。
    /// 回復可能なエラー経路と混同してはならない。
    #[inline(always)]
    pub fn check(&self) {
        #[cfg(feature = "consistency-checks")]
        {
            assert!(
                self.data_start <= self.data_end && self.data_end <= self.storage.len(),
                "buffer window corrupted: start={} end={} capacity={}",
                self.data_start,
                self.data_end,
                self.storage.len()
            );
        }
    }

    /// データ末尾に追記してウィンドウ終端を進める
    ///
    /// 呼び出し側が後続余白を確保済みであること（通常は`grow_headroom`経由）。
    /// 不足は破壊前提条件であり、回復可能エラーではない。
    pub fn append_data(&mut self, bytes: &[u8]) {
        let end = self.data_end + bytes.len();
        self.storage[self.data_end..end].copy_from_slice(bytes);
        self.data_end = end;
        self.check();
    }

    /// 先頭からnバイトを剥がす（ウィンドウ先頭を進める）
    pub fn pull_front(&mut self, n: usize) {
        debug_assert!(n <= self.len());
        self.data_start += n.min(self.len());
        self.check();
    }

    /// ペイロードを領域先頭（オフセット0）へ詰める
    pub fn shift_to_front(&mut self) {
        let len = self.len();
        self.storage.copy_within(self.data_start..self.data_end, 0);
        self.data_start = 0;
        self.data_end = len;
        self.check();
    }

    /// ヘッドルーム拡張
    ///
    /// 容量不足なら新しいバッファへ再配置（メタデータはウィンドウ以外を
    /// 引き継ぎ、先行余白をちょうど`needed`に配置）。容量は足りるが
    /// 先行余白が不足する場合は同一領域内でペイロードをシフトする。
    /// 再確保に失敗した場合、元のバッファは通常の解放経路で解放され
    /// Noneを返す（リークさせない）。
    pub fn grow_headroom(mut buf: BufHandle, needed: usize) -> Option<BufHandle> {
        let len = buf.len();

        if buf.capacity() - len < needed {
            let Some(mut fresh) = Buf::alloc(needed, len, 0) else {
                drop(buf);
                return None;
            };
            Buf::copy_metadata(&mut fresh, &mut buf, false);
            fresh.data_start = needed;
            fresh.data_end = needed + len;
            let (s, e) = (buf.data_start, buf.data_end);
            fresh.storage[needed..needed + len].copy_from_slice(&buf.storage[s..e]);
            fresh.check();
            return Some(fresh);
        }

        if buf.data_start < needed {
            buf.storage.copy_within(buf.data_start..buf.data_end, needed);
            buf.data_start = needed;
            buf.data_end = needed + len;
            buf.check();
        }
        Some(buf)
    }

    /// クローン
    ///
    /// ペイロードを独立所有する複製を返す。先行ノード・経路参照・
    /// ソケット後方参照は複製せず、マルチキャストループフラグは
    /// 強制的に落とす（ループ増殖の防止）。
    pub fn clone_buf(&self) -> Option<BufHandle> {
        let len = self.len();
        let mut copy = Buf::alloc_minimal(len)?;
        let s = copy.data_start;
        copy.storage[s..s + len].copy_from_slice(self.data());
        copy.data_end = s + len;

        copy.src = self.src;
        copy.dst = self.dst;
        copy.hop_limit = self.hop_limit;
        copy.traffic_class = self.traffic_class;
        copy.flow_label = self.flow_label;
        copy.flags = self.flags - BufFlags::MCAST_LOOP;
        copy.priority = self.priority;
        copy.link = self.link;
        copy.check();
        Some(copy)
    }

    /// ターンアラウンド（受信パケットを応答パケットとして再利用）
    ///
    /// 単回使用のフィールドをその場で剥ぎ取る: 先行ノードと経路参照を
    /// 解放し、トンネル/RPLエラーフラグを落とし、リンクメタデータを
    /// 既定値に戻し、ソケット後方参照を切り離す。
    pub fn turnaround(&mut self) {
        self.predecessor = None;
        self.route = None;
        self.flags -= BufFlags::TUNNELED | BufFlags::RPL_ERROR;
        self.link = LinkMeta::default();
        self.detach_socket();
    }

    /// メタデータ複製
    ///
    /// `src`の全フィールドを`dst`へ複写する（`dst`自身のウィンドウ/容量は
    /// 除く）。経路参照は共有カウント+1で両者が共有する。先行ノードと
    /// ソケット後方参照は単独所有資源のため、`keep_in_src`で指定された
    /// 側だけが保持するよう他方から除去する。
    pub fn copy_metadata(dst: &mut Buf, src: &mut Buf, keep_in_src: bool) {
        dst.src = src.src;
        dst.dst = src.dst;
        dst.hop_limit = src.hop_limit;
        dst.traffic_class = src.traffic_class;
        dst.flow_label = src.flow_label;
        dst.flags = src.flags;
        dst.priority = src.priority;
        dst.link = src.link;
        dst.route = src.route.clone();

        dst.detach_socket();
        if keep_in_src {
            dst.predecessor = None;
        } else {
            dst.predecessor = src.predecessor.take();
            dst.socket = src.socket.take();
        }
    }

    /// 経路情報を設定（共有参照）
    #[inline]
    pub fn set_route(&mut self, route: Arc<RouteInfo>) {
        self.route = Some(route);
    }

    /// 経路情報を取得
    #[inline]
    pub fn route(&self) -> Option<&Arc<RouteInfo>> {
        self.route.as_ref()
    }

    /// 先行ノードアドレスを設定（単独所有）
    #[inline]
    pub fn set_predecessor(&mut self, addr: Ip6Addr) {
        self.predecessor = Some(Box::new(addr));
    }

    /// 先行ノードアドレスを取得
    #[inline]
    pub fn predecessor(&self) -> Option<&Ip6Addr> {
        self.predecessor.as_deref()
    }

    /// ソケット後方参照を設定（参照カウント+1）
    pub fn set_socket(&mut self, sock: &SocketRef) {
        self.detach_socket();
        sock.reference();
        self.socket = Some(sock.clone());
    }

    /// ソケット後方参照を取得
    #[inline]
    pub fn socket_ref(&self) -> Option<&SocketRef> {
        self.socket.as_ref()
    }

    /// ソケット後方参照を切り離す（参照カウント-1）
    pub fn detach_socket(&mut self) {
        if let Some(sock) = self.socket.take() {
            sock.dereference();
        }
    }
}

impl Drop for Buf {
    fn drop(&mut self) {
        // 経路参照・先行ノードは所有権で自動解放。ソケット後方参照は
        // 参照カウントを返す必要がある。
        self.detach_socket();
    }
}

impl core::fmt::Debug for Buf {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Buf")
            .field("capacity", &self.capacity())
            .field("window", &(self.data_start..self.data_end))
            .field("dst", &self.dst)
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

// =====================================================
// テスト
// =====================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_rounding_and_window() {
        // total = max(40+60, 127) = 127 -> 粒度4に丸めて128
        let buf = Buf::alloc(40, 60, 127).unwrap();
        assert_eq!(buf.capacity(), 128);
        assert_eq!(buf.data_start(), 128 - 60);
        assert_eq!(buf.data_end(), 128 - 60);
        assert!(buf.is_empty());
        assert!(buf.headroom() >= 40);
    }

    #[test]
    fn test_alloc_ceiling() {
        assert!(Buf::alloc(0, MAX_TOTAL_SIZE + 1, 0).is_none());
        assert!(Buf::alloc(MAX_TOTAL_SIZE, MAX_TOTAL_SIZE, 0).is_none());
        // 天井ちょうどは丸め後に超えない限り成功
        assert!(Buf::alloc(0, 0, MAX_TOTAL_SIZE - 3).is_some());
    }

    #[test]
    fn test_window_invariant_after_mutations() {
        let mut buf = Buf::alloc(8, 16, 0).unwrap();
        buf.append_data(&[1, 2, 3, 4]);
        assert!(buf.data_start() <= buf.data_end());
        assert!(buf.data_end() <= buf.capacity());
        buf.pull_front(2);
        assert_eq!(buf.data(), &[3, 4]);
        assert!(buf.data_start() <= buf.data_end());
    }

    #[test]
    fn test_grow_headroom_shuffle_in_place() {
        // 容量は足りるが先行余白が不足 -> 同一領域内シフト
        let mut buf = Buf::alloc(4, 8, 64).unwrap();
        buf.append_data(&[0xaa, 0xbb, 0xcc]);
        let cap = buf.capacity();
        let needed = buf.data_start() + 4;
        assert!(cap - buf.len() >= needed);

        let buf = Buf::grow_headroom(buf, needed).unwrap();
        assert_eq!(buf.capacity(), cap, "no relocation expected");
        assert_eq!(buf.data_start(), needed);
        assert_eq!(buf.data(), &[0xaa, 0xbb, 0xcc]);
    }

    #[test]
    fn test_grow_headroom_relocate() {
        let mut buf = Buf::alloc(0, 8, 0).unwrap();
        buf.append_data(&[1, 2, 3, 4, 5, 6, 7, 8]);
        buf.hop_limit = 7;
        let needed = buf.capacity() + 32;

        let buf = Buf::grow_headroom(buf, needed).unwrap();
        assert_eq!(buf.data_start(), needed);
        assert_eq!(buf.data(), &[1, 2, 3, 4, 5, 6, 7, 8]);
        // メタデータは引き継がれる
        assert_eq!(buf.hop_limit, 7);
    }

    #[test]
    fn test_clone_independence_and_filtering() {
        let mut orig = Buf::alloc(8, 8, 0).unwrap();
        orig.append_data(&[9, 8, 7]);
        orig.flags = BufFlags::MCAST_LOOP | BufFlags::DONT_FRAG;
        orig.set_predecessor(Ip6Addr::LOOPBACK);
        orig.set_route(Arc::new(RouteInfo {
            next_hop: Ip6Addr::LOOPBACK,
            ifindex: 1,
        }));
        orig.hop_limit = 3;

        let copy = orig.clone_buf().unwrap();
        assert_eq!(copy.data(), &[9, 8, 7]);
        assert_eq!(copy.hop_limit, 3);
        // 単回使用資源は複製されない
        assert!(copy.predecessor().is_none());
        assert!(copy.route().is_none());
        assert!(copy.socket_ref().is_none());
        // マルチキャストループは強制的に落ちる
        assert!(!copy.flags.contains(BufFlags::MCAST_LOOP));
        assert!(copy.flags.contains(BufFlags::DONT_FRAG));

        // 元を解放してもクローンは独立
        drop(orig);
        assert_eq!(copy.data(), &[9, 8, 7]);
    }

    #[test]
    fn test_copy_metadata_single_owner_resources() {
        let mut a = Buf::alloc(0, 4, 0).unwrap();
        let mut b = Buf::alloc(0, 4, 0).unwrap();
        let route = Arc::new(RouteInfo {
            next_hop: Ip6Addr::LOOPBACK,
            ifindex: 2,
        });
        b.set_route(route.clone());
        b.set_predecessor(Ip6Addr::LOOPBACK);
        b.hop_limit = 11;

        // keep_in_src = true: srcが単独所有資源を保持し続ける
        Buf::copy_metadata(&mut a, &mut b, true);
        assert_eq!(a.hop_limit, 11);
        assert!(a.route().is_some());
        assert!(b.route().is_some(), "route is shared by both");
        assert_eq!(Arc::strong_count(&route), 3);
        assert!(a.predecessor().is_none());
        assert!(b.predecessor().is_some());

        // keep_in_src = false: 資源はdstへ移る
        let mut c = Buf::alloc(0, 4, 0).unwrap();
        Buf::copy_metadata(&mut c, &mut b, false);
        assert!(c.predecessor().is_some());
        assert!(b.predecessor().is_none());
    }

    #[test]
    fn test_turnaround_strips_single_use_fields() {
        let mut buf = Buf::alloc(0, 8, 0).unwrap();
        buf.flags = BufFlags::TUNNELED | BufFlags::RPL_ERROR | BufFlags::DONT_FRAG;
        buf.set_predecessor(Ip6Addr::LOOPBACK);
        buf.set_route(Arc::new(RouteInfo {
            next_hop: Ip6Addr::LOOPBACK,
            ifindex: 1,
        }));

        buf.turnaround();
        assert!(buf.predecessor().is_none());
        assert!(buf.route().is_none());
        assert!(!buf.flags.contains(BufFlags::TUNNELED));
        assert!(!buf.flags.contains(BufFlags::RPL_ERROR));
        // 単回使用でないフラグは残る
        assert!(buf.flags.contains(BufFlags::DONT_FRAG));
    }

    #[test]
    fn test_shift_to_front() {
        let mut buf = Buf::alloc(16, 8, 0).unwrap();
        buf.append_data(&[5, 6, 7]);
        buf.shift_to_front();
        assert_eq!(buf.data_start(), 0);
        assert_eq!(buf.data(), &[5, 6, 7]);
    }
}
