// ============================================================================
// src/socket/mod.rs - Socket Object & Lifecycle Primitives
// ============================================================================
//!
//! # ソケットオブジェクト
//!
//! ID・ライフサイクルフラグ・制御ブロック・送受信バイトキューを持つ
//! ソケット本体と、その参照カウント管理。
//!
//! ## 参照カウント
//! - 飽和カウンタ。オーバーフロー/アンダーフローは診断ログを残すが
//!   致命的ではない
//! - デクリメントでゼロに到達したら論理的解放: 両キューをフラッシュし、
//!   マルチキャストグループを抜け、制御ブロックを初期化する
//! - メモリ自体の解放は最後のArcが落ちた時点（協調モデルでは両者は
//!   実質同時に起きる）
//!
//! ## 役割のタグ付きユニオン
//! リスナーは未Accept子ソケットのキューを、通常ソケットは親への
//! バックリンク（PENDING中のみ）を持つ。両方を無条件に持つことはない。
//! イベントコールバックと所属コンテキストはどちらの形でも必要になる
//! （リスナーにも「接続到着」が配達される）ため、ユニオンの外に置く。

#![allow(dead_code)]

pub mod pcb;
pub mod registry;
pub mod types;

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, Ordering};
use spin::Mutex;

use crate::event::{ContextId, EventCallback};
use crate::sockbuf::SockBuf;
use pcb::InetPcb;
use types::{AddressFamily, IpProto, SockType, SocketFlags, SocketId};

/// ストリームソケットの既定受信バイト上限
pub const STREAM_RECV_LIMIT: usize = 2048;

/// ストリームソケットの既定送信バイト上限
pub const STREAM_SEND_LIMIT: usize = 2048;

/// ストリームソケットの既定送信低水位マーク
pub const STREAM_SEND_LOW_WATER: usize = 512;

/// 共有ソケットハンドル
pub type SocketRef = Arc<Socket>;

/// ソケットの役割（タグ付きユニオン）
pub enum SocketRole {
    /// 通常ソケット。PENDING中は親リスナーへのバックリンクを持つ
    Leaf {
        /// 親リスナー（PENDINGの間だけSome）
        parent: Option<SocketRef>,
    },
    /// リスナー: 未Acceptの子ソケットキュー
    Listener {
        /// 保留できる子の上限
        backlog: usize,
        /// 未Acceptの子（各エントリは参照を1つ保持）
        pending: VecDeque<SocketRef>,
    },
}

/// ソケットの可変状態（Mutex保護対象）
pub struct SocketInner {
    /// 割り当て済みID（テーブル添字、未割り当てはUNASSIGNED）
    pub id: SocketId,
    /// ライフサイクルフラグ
    pub flags: SocketFlags,
    /// 所属実行コンテキスト（イベント配達先）
    pub context: ContextId,
    /// プロトコル制御ブロック（唯一所有）
    pub pcb: InetPcb,
    /// 受信キュー
    pub recv: SockBuf,
    /// 送信キュー
    pub send: SockBuf,
    /// 役割
    pub role: SocketRole,
}

/// ソケット
pub struct Socket {
    /// アドレスファミリ（不変）
    family: AddressFamily,
    /// ソケットタイプ（不変）
    stype: SockType,
    /// 参照カウント（飽和、診断つき）
    refs: AtomicU32,
    /// イベントコールバック（所属コンテキスト上でのみ起動される）
    callback: Mutex<Option<EventCallback>>,
    /// 可変状態
    inner: Mutex<SocketInner>,
}

impl Socket {
    /// ソケットを確保
    ///
    /// ID未割り当て・フラグなし・両キュー空で作る。ストリームタイプは
    /// 既定の送受信バイト上限と送信低水位マークを持つ。
    pub fn alloc_socket(
        family: AddressFamily,
        stype: SockType,
        proto: IpProto,
        context: ContextId,
    ) -> SocketRef {
        let mut recv = SockBuf::new();
        let mut send = SockBuf::new();
        if stype == SockType::Stream {
            send.set_low_water(STREAM_SEND_LOW_WATER);
            // 上限は定数で RESERVE_LIMIT_MAX 未満
            let _ = recv.reserve(STREAM_RECV_LIMIT);
            let _ = send.reserve(STREAM_SEND_LIMIT);
        }

        Arc::new(Socket {
            family,
            stype,
            refs: AtomicU32::new(1),
            callback: Mutex::new(None),
            inner: Mutex::new(SocketInner {
                id: SocketId::UNASSIGNED,
                flags: SocketFlags::empty(),
                context,
                pcb: InetPcb::new(proto),
                recv,
                send,
                role: SocketRole::Leaf { parent: None },
            }),
        })
    }

    /// アドレスファミリ取得
    #[inline(always)]
    pub const fn family(&self) -> AddressFamily {
        self.family
    }

    /// ソケットタイプ取得
    #[inline(always)]
    pub const fn stype(&self) -> SockType {
        self.stype
    }

    /// 可変状態のロック取得
    #[inline]
    pub fn inner(&self) -> spin::MutexGuard<'_, SocketInner> {
        self.inner.lock()
    }

    /// 現在の参照カウント
    #[inline]
    pub fn refcount(&self) -> u32 {
        self.refs.load(Ordering::Relaxed)
    }

    /// 参照カウントをインクリメント（飽和）
    pub fn reference(&self) {
        let prev = self.refs.load(Ordering::Relaxed);
        if prev == u32::MAX {
            log::warn!("socket: refcount overflow (saturated)");
            return;
        }
        self.refs.store(prev + 1, Ordering::Relaxed);
    }

    /// 参照カウントをデクリメント
    ///
    /// ゼロのデクリメントは診断して無視する（二重解放をここで止める）。
    /// ゼロ到達で論理的解放を行う。
    pub fn dereference(&self) {
        let prev = self.refs.load(Ordering::Relaxed);
        if prev == 0 {
            log::error!("socket: refcount underflow ignored");
            return;
        }
        self.refs.store(prev - 1, Ordering::Relaxed);
        if prev == 1 {
            self.free_internal();
        }
    }

    /// 論理的解放（参照カウントゼロ到達時）
    ///
    /// 両キューをフラッシュし、マルチキャストグループを抜けてから
    /// 制御ブロックのバインドを消す。
    fn free_internal(&self) {
        let mut inner = self.inner.lock();
        #[cfg(feature = "verbose_logging")]
        log::trace!("socket: freeing id={:?}", inner.id);
        inner.recv.flush();
        inner.send.flush();
        inner.pcb.leave_all_groups();
        inner.pcb.clear_binding();
        inner
            .flags
            .insert(SocketFlags::CLOSED | SocketFlags::SHUT_WR | SocketFlags::CANT_RECV_MORE);
        *self.callback.lock() = None;
    }

    /// イベントコールバックを設定
    pub fn set_callback(&self, callback: EventCallback) {
        *self.callback.lock() = Some(callback);
    }

    /// イベントコールバックを取得（クローン）
    pub fn callback(&self) -> Option<EventCallback> {
        self.callback.lock().clone()
    }

    /// 割り当て済みID（ロック越しの便宜アクセサ）
    #[inline]
    pub fn id(&self) -> SocketId {
        self.inner.lock().id
    }

    /// 現在のフラグ（ロック越しの便宜アクセサ)
    #[inline]
    pub fn flags(&self) -> SocketFlags {
        self.inner.lock().flags
    }
}

// =====================================================
// テスト
// =====================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buf::Buf;
    use crate::socket::types::SocketError;

    fn leaf() -> SocketRef {
        Socket::alloc_socket(
            AddressFamily::Inet6,
            SockType::Datagram,
            IpProto::UDP,
            ContextId::from_raw(0),
        )
    }

    #[test]
    fn test_stream_defaults() {
        let sock = Socket::alloc_socket(
            AddressFamily::Inet6,
            SockType::Stream,
            IpProto::TCP,
            ContextId::from_raw(0),
        );
        let inner = sock.inner();
        assert_eq!(inner.send.data_limit(), STREAM_SEND_LIMIT);
        assert_eq!(inner.recv.data_limit(), STREAM_RECV_LIMIT);
        assert_eq!(inner.send.low_water(), STREAM_SEND_LOW_WATER);
        assert!(!inner.id.is_assigned());
        assert!(inner.flags.is_empty());
    }

    #[test]
    fn test_refcount_underflow_diagnosed() {
        let sock = leaf();
        assert_eq!(sock.refcount(), 1);
        sock.dereference();
        assert_eq!(sock.refcount(), 0);
        // ゼロからのデクリメントはpanicせず無視される
        sock.dereference();
        assert_eq!(sock.refcount(), 0);
    }

    #[test]
    fn test_free_flushes_queues() {
        let sock = leaf();
        {
            let mut inner = sock.inner();
            let mut buf = Buf::alloc(0, 0, 16).unwrap();
            buf.shift_to_front();
            buf.append_data(&[1, 2, 3]);
            inner.recv.append(buf);
            assert_eq!(inner.recv.data_bytes(), 3);
            inner.pcb.local = crate::addr::SockAddr6::new(crate::addr::Ip6Addr::LOOPBACK, 99);
        }
        sock.dereference();
        let inner = sock.inner();
        assert_eq!(inner.recv.data_bytes(), 0);
        assert!(inner.pcb.local.is_unspecified());
        assert!(inner.flags.contains(SocketFlags::CLOSED));
    }

    #[test]
    fn test_buffer_backref_counts_reference() {
        let sock = leaf();
        let mut buf = Buf::alloc(0, 0, 16).unwrap();
        buf.set_socket(&sock);
        assert_eq!(sock.refcount(), 2);

        // キュー投入は後方参照を必ず切り離す
        let mut sb = SockBuf::new();
        sb.append(buf);
        assert_eq!(sock.refcount(), 1);

        // キュー上のバッファは参照を持たないので、フラッシュしても変化なし
        sb.flush();
        assert_eq!(sock.refcount(), 1);
    }

    #[test]
    fn test_buffer_drop_releases_backref() {
        let sock = leaf();
        {
            let mut buf = Buf::alloc(0, 0, 16).unwrap();
            buf.set_socket(&sock);
            assert_eq!(sock.refcount(), 2);
            // スコープ終了でDrop -> 参照返却
        }
        assert_eq!(sock.refcount(), 1);
    }

    #[test]
    fn test_reserve_limit_guard() {
        let sock = leaf();
        let mut inner = sock.inner();
        assert_eq!(
            inner.recv.reserve(70000),
            Err(SocketError::InvalidArgument)
        );
        assert!(inner.recv.reserve(1024).is_ok());
    }
}
