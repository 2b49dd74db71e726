// ============================================================================
// src/stack.rs - Socket Stack Core (lifecycle, dispatch, sendmsg)
// ============================================================================
//!
//! # ソケットスタック中核
//!
//! ソケットの生成/接続/リッスン/解放、受信ディスパッチ(socket_up)、
//! 送信エントリポイント(sendmsg)を束ねる。ルーティング・TCP状態機械・
//! インターフェース表は外部コラボレータとしてトレイト越しに使う。
//!
//! ## 受信の2モード
//! 受信キューにバイト上限が設定されているかどうかでソケットごとに選ぶ:
//! - レガシー: 受信バッファ本体をイベントに載せて1件ずつ投函
//! - キュー: 受信キューへ積み、「データあり」通知だけ投函。積む前に
//!   `space() >= len` を検査し、あふれは破棄（ブロックしない）
//!
//! 破棄は組み込みIPスタックでは正常なトラフィック損失であり、
//! 統計カウンタ以外には現れない。

#![allow(dead_code)]

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use bitflags::bitflags;
use core::sync::atomic::{AtomicUsize, Ordering};
use spin::Mutex;

use crate::addr::{Ip6Addr, SockAddr6};
use crate::buf::{Buf, BufFlags, BufHandle, DEFAULT_HEADROOM, DEFAULT_MIN_SIZE};
use crate::event::{ContextId, EventCallback, EventRouter, SocketEvent};
use crate::netif::{Interfaces, LinkKind, Netif};
use crate::route::Routes;
use crate::socket::pcb::{InetPcb, OPT_UNSET};
use crate::socket::registry::SocketTable;
use crate::socket::types::{
    AbortReason, AddressFamily, IpProto, SockType, SocketError, SocketFlags, SocketId,
    SocketResult,
};
use crate::socket::{Socket, SocketRef, SocketRole};
use crate::transport::TcpTransport;

/// キューモードのデータグラムソケット既定受信バイト上限
pub const DGRAM_RECV_LIMIT: usize = 1280;

// =====================================================
// 補助メッセージ（ancillary data）
// =====================================================

/// 補助メッセージのレベル: IPPROTO_IPV6
pub const CMSG_LEVEL_IPV6: u8 = 41;

/// パケット送信元情報（16バイトアドレス + 4バイトifindex LE）
pub const CMSG_PKTINFO: u8 = 50;
/// ホップリミット上書き（i16 LE, [-1,255]）
pub const CMSG_HOPLIMIT: u8 = 52;
/// フラグメント禁止（i8, [0,1]）
pub const CMSG_DONTFRAG: u8 = 62;
/// 最小MTUポリシー（i8, [-1,1]）
pub const CMSG_USE_MIN_MTU: u8 = 63;
/// トラフィッククラス上書き（i16 LE, [-1,255]）
pub const CMSG_TCLASS: u8 = 67;
/// マルチキャストの自己ループバック（1バイト真偽値）
pub const CMSG_MCAST_LOOP: u8 = 19;

/// 補助メッセージから組み立てたメッセージ単位の上書き
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SendOptions {
    /// 送信元アドレス（PKTINFO）
    pub src: Option<Ip6Addr>,
    /// 送出インターフェース（PKTINFO、0は未指定）
    pub ifindex: Option<u32>,
    /// ホップリミット（-1 = 既定に従う）
    pub hop_limit: Option<i16>,
    /// トラフィッククラス（-1 = ソケット既定）
    pub traffic_class: Option<i16>,
    /// 最小MTUポリシー
    pub use_min_mtu: Option<i8>,
    /// フラグメント禁止
    pub dont_frag: Option<bool>,
    /// マルチキャスト自己ループバック
    pub mcast_loop: Option<bool>,
}

/// 補助メッセージ列を解析する
///
/// レコードは [level u8][type u8][len u8][payload] の繰り返し。
/// 未知のタグは読み飛ばす。切り詰め・値域外はInvalidArgument。
pub fn parse_control(mut control: &[u8]) -> SocketResult<SendOptions> {
    let mut opts = SendOptions::default();

    while !control.is_empty() {
        if control.len() < 3 {
            return Err(SocketError::InvalidArgument);
        }
        let level = control[0];
        let ctype = control[1];
        let len = control[2] as usize;
        if control.len() < 3 + len {
            return Err(SocketError::InvalidArgument);
        }
        let payload = &control[3..3 + len];

        if level == CMSG_LEVEL_IPV6 {
            match ctype {
                CMSG_PKTINFO => {
                    if len != 20 {
                        return Err(SocketError::InvalidArgument);
                    }
                    let mut octets = [0u8; 16];
                    octets.copy_from_slice(&payload[..16]);
                    let addr = Ip6Addr::new(octets);
                    let ifindex =
                        u32::from_le_bytes([payload[16], payload[17], payload[18], payload[19]]);
                    if !addr.is_unspecified() {
                        opts.src = Some(addr);
                    }
                    if ifindex != 0 {
                        opts.ifindex = Some(ifindex);
                    }
                }
                CMSG_HOPLIMIT => {
                    let v = parse_i16(payload)?;
                    if !(-1..=255).contains(&v) {
                        return Err(SocketError::InvalidArgument);
                    }
                    opts.hop_limit = Some(v);
                }
                CMSG_TCLASS => {
                    let v = parse_i16(payload)?;
                    if !(-1..=255).contains(&v) {
                        return Err(SocketError::InvalidArgument);
                    }
                    opts.traffic_class = Some(v);
                }
                CMSG_USE_MIN_MTU => {
                    let v = parse_i8(payload)?;
                    if !(-1..=1).contains(&v) {
                        return Err(SocketError::InvalidArgument);
                    }
                    opts.use_min_mtu = Some(v);
                }
                CMSG_DONTFRAG => {
                    let v = parse_i8(payload)?;
                    if !(0..=1).contains(&v) {
                        return Err(SocketError::InvalidArgument);
                    }
                    opts.dont_frag = Some(v != 0);
                }
                CMSG_MCAST_LOOP => {
                    let v = parse_i8(payload)?;
                    opts.mcast_loop = Some(v != 0);
                }
                _ => {} // 未知タグは無視
            }
        }
        control = &control[3 + len..];
    }
    Ok(opts)
}

fn parse_i16(payload: &[u8]) -> SocketResult<i16> {
    if payload.len() != 2 {
        return Err(SocketError::InvalidArgument);
    }
    Ok(i16::from_le_bytes([payload[0], payload[1]]))
}

fn parse_i8(payload: &[u8]) -> SocketResult<i8> {
    if payload.len() != 1 {
        return Err(SocketError::InvalidArgument);
    }
    Ok(payload[0] as i8)
}

// =====================================================
// 送信エントリポイントの引数型
// =====================================================

bitflags! {
    /// sendmsgの動作フラグ
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SendFlags: u8 {
        /// ストリーム送信で全量受理する互換動作
        /// （厳密なバイト会計より旧来の一発返却を優先する）
        const ONESHOT_COMPAT = 1 << 0;
    }
}

/// sendmsgへ渡すペイロード
pub enum SendPayload<'a> {
    /// 組み立て済みバッファ（検証なしでそのまま使う）
    Buffer(BufHandle),
    /// scatter-gather記述
    Slices(&'a [&'a [u8]]),
}

/// scatter-gather記述の総バイト長（オーバーフローはInvalidArgument）
fn total_len(slices: &[&[u8]]) -> SocketResult<usize> {
    let mut total = 0usize;
    for s in slices {
        total = total
            .checked_add(s.len())
            .ok_or(SocketError::InvalidArgument)?;
    }
    Ok(total)
}

// =====================================================
// 統計
// =====================================================

/// スタック全体の診断カウンタ
///
/// 破棄は黙って起きる。ここが唯一の観測点。
#[derive(Debug, Default)]
pub struct StackStats {
    /// 受信: 配達またはキュー投入できた数
    pub rx_admitted: AtomicUsize,
    /// 受信: 対応ソケットなしで破棄
    pub rx_no_socket: AtomicUsize,
    /// 受信: ソケット状態（PENDING/CLOSED/未割り当て）で破棄
    pub rx_bad_state: AtomicUsize,
    /// 受信: フロー制御あふれで破棄
    pub rx_flow_dropped: AtomicUsize,
    /// 受信: 通知を積めず破棄
    pub rx_event_dropped: AtomicUsize,
    /// 送信: 下位層へ渡した数
    pub tx_packets: AtomicUsize,
    /// 投函できなかったライフサイクルイベント数
    pub events_lost: AtomicUsize,
}

/// 統計のスナップショット（一括読み出し用）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub rx_admitted: usize,
    pub rx_no_socket: usize,
    pub rx_bad_state: usize,
    pub rx_flow_dropped: usize,
    pub rx_event_dropped: usize,
    pub tx_packets: usize,
    pub events_lost: usize,
}

impl StackStats {
    #[inline]
    fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// 現在値をまとめて読み出す
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            rx_admitted: self.rx_admitted.load(Ordering::Relaxed),
            rx_no_socket: self.rx_no_socket.load(Ordering::Relaxed),
            rx_bad_state: self.rx_bad_state.load(Ordering::Relaxed),
            rx_flow_dropped: self.rx_flow_dropped.load(Ordering::Relaxed),
            rx_event_dropped: self.rx_event_dropped.load(Ordering::Relaxed),
            tx_packets: self.tx_packets.load(Ordering::Relaxed),
            events_lost: self.events_lost.load(Ordering::Relaxed),
        }
    }
}

/// 下位プロトコル層への送出口（外部コラボレータ境界）
pub trait TxSink: Send + Sync {
    /// 完成した送信バッファを引き渡す
    fn transmit(&self, buf: BufHandle);
}

// =====================================================
// スタック本体
// =====================================================

/// ソケットスタック
pub struct Stack {
    table: Mutex<SocketTable>,
    router: EventRouter,
    routes: Arc<dyn Routes>,
    ifaces: Arc<dyn Interfaces>,
    tcp: Arc<dyn TcpTransport>,
    tx: Arc<dyn TxSink>,
    /// 診断カウンタ
    pub stats: StackStats,
}

impl Stack {
    /// コラボレータを束ねてスタックを作る
    pub fn new(
        routes: Arc<dyn Routes>,
        ifaces: Arc<dyn Interfaces>,
        tcp: Arc<dyn TcpTransport>,
        tx: Arc<dyn TxSink>,
    ) -> Self {
        Self {
            table: Mutex::new(SocketTable::new()),
            router: EventRouter::new(),
            routes,
            ifaces,
            tcp,
            tx,
            stats: StackStats::default(),
        }
    }

    // -------------------------------------------------
    // ライフサイクル
    // -------------------------------------------------

    /// ソケットを作ってIDテーブルに載せる
    ///
    /// プロトコルはソケットタイプに強制される（DGRAM⇒UDP、STREAM⇒TCP）。
    /// RAWはTCP/UDP以外を明示する必要がある。ポート衝突はPortInUse、
    /// テーブル満杯はTableFullで区別して返す。
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        &self,
        family: AddressFamily,
        stype: SockType,
        proto: IpProto,
        port: u16,
        context: ContextId,
        callback: EventCallback,
        queued_recv: bool,
    ) -> SocketResult<SocketId> {
        let AddressFamily::Inet6 = family;
        let proto = match stype {
            SockType::Datagram => IpProto::UDP,
            SockType::Stream => IpProto::TCP,
            SockType::Raw => {
                if proto == IpProto::TCP || proto == IpProto::UDP {
                    return Err(SocketError::InvalidArgument);
                }
                proto
            }
        };

        let mut table = self.table.lock();
        if table.port_in_use(proto, port) {
            return Err(SocketError::PortInUse);
        }

        let sock = Socket::alloc_socket(family, stype, proto, context);
        sock.set_callback(callback);
        {
            let mut inner = sock.inner();
            inner.pcb.local.port = port;
            if queued_recv && stype != SockType::Stream {
                // キューモード: 上限の設定そのものがモード選択になる
                inner.recv.reserve(DGRAM_RECV_LIMIT)?;
            }
        }
        table.id_assign_and_attach(&sock)
    }

    /// IDからソケットを引く
    pub fn get(&self, id: SocketId) -> Option<SocketRef> {
        self.table.lock().get(id)
    }

    /// IDとの対応を外し、ソケットを解放経路へ進める
    ///
    /// テーブル保持分と生成時の参照を両方返す。キューに残るバッファの
    /// 後方参照が尽きた時点で論理的解放が走る。
    pub fn id_detach(&self, id: SocketId) -> SocketResult<()> {
        let sock = self
            .table
            .lock()
            .detach_slot(id)
            .ok_or(SocketError::NotFound)?;
        self.release(&sock);
        sock.dereference(); // テーブル分
        sock.dereference(); // 生成時の分
        Ok(())
    }

    /// ソケットをクローズ状態へ進める（冪等）
    ///
    /// TCPセッションがあれば読み取り側シャットダウン後にクローズを試みる
    /// （この呼び出し自体がセッション解体を連鎖させうる）。なければ
    /// 5タプルを消してポートを再利用可能にする。リスナーはPENDINGの
    /// 子を再帰的に解放する。自身がPENDINGならキューを抜けて参照を
    /// 1つ返すだけで、親への通知はしない。
    pub fn release(&self, sock: &SocketRef) {
        let mut children = VecDeque::new();
        let mut parent_link = None;
        let was_pending;
        let session;
        {
            let mut inner = sock.inner();
            if inner.flags.contains(SocketFlags::CLOSED) {
                return;
            }
            was_pending = inner.flags.contains(SocketFlags::PENDING);
            inner.flags.insert(
                SocketFlags::CLOSED | SocketFlags::SHUT_WR | SocketFlags::CANT_RECV_MORE,
            );
            inner.flags.remove(SocketFlags::PENDING);

            session = if sock.stype() == SockType::Stream {
                self.tcp.session_for(&inner.pcb)
            } else {
                None
            };
            if session.is_none() {
                inner.pcb.clear_binding();
            }
            inner.recv.flush();

            match &mut inner.role {
                SocketRole::Listener { pending, .. } => {
                    children = core::mem::take(pending);
                }
                SocketRole::Leaf { parent } => {
                    parent_link = parent.take();
                }
            }
        }

        if let Some(session) = session {
            self.tcp.shutdown_read(session);
            self.tcp.close(session);
        }

        // リスナー経路: 取り出した子を解放する。子自身のPENDING分岐が
        // キュー保持分の参照を返す
        for child in &children {
            self.release(child);
        }

        if was_pending {
            if let Some(listener) = parent_link {
                let mut li = listener.inner();
                if let SocketRole::Listener { pending, .. } = &mut li.role {
                    pending.retain(|c| !Arc::ptr_eq(c, sock));
                }
            }
            sock.dereference(); // キュー保持分
        }
    }

    /// ストリームソケットをリッスン状態にする
    ///
    /// 再リッスンは拒否する。役割の置き換えは保留キューの子を解放
    /// しないまま捨てることになるため。
    pub fn listen(&self, id: SocketId, backlog: usize) -> SocketResult<()> {
        let sock = self.get(id).ok_or(SocketError::NotFound)?;
        if sock.stype() != SockType::Stream {
            return Err(SocketError::WrongState);
        }
        let mut inner = sock.inner();
        if inner.flags.intersects(
            SocketFlags::CONNECTING
                | SocketFlags::CONNECTED
                | SocketFlags::LISTENING
                | SocketFlags::CLOSED,
        ) {
            return Err(SocketError::WrongState);
        }
        inner.flags.insert(SocketFlags::LISTENING);
        inner.role = SocketRole::Listener {
            backlog: backlog.max(1),
            pending: VecDeque::new(),
        };
        Ok(())
    }

    /// 接続を開始する
    ///
    /// ストリームはCONNECTINGになり、完了はトランスポートが
    /// `connection_complete`で通知する。データグラムは既定の宛先を
    /// 固定してその場でCONNECTEDになる。
    pub fn connect(&self, id: SocketId, peer: SockAddr6) -> SocketResult<()> {
        let sock = self.get(id).ok_or(SocketError::NotFound)?;
        let mut inner = sock.inner();
        if inner.flags.intersects(
            SocketFlags::CONNECTING
                | SocketFlags::CONNECTED
                | SocketFlags::LISTENING
                | SocketFlags::CLOSED,
        ) {
            return Err(SocketError::WrongState);
        }
        if peer.addr.is_unspecified() || (inner.pcb.proto.has_ports() && peer.port == 0) {
            return Err(SocketError::InvalidArgument);
        }
        if !peer.addr.has_small_scope() && self.routes.route_to(&peer.addr).is_none() {
            return Err(SocketError::NoRoute);
        }

        inner.pcb.peer = peer;
        if sock.stype() == SockType::Stream {
            inner.flags.insert(SocketFlags::CONNECTING);
        } else {
            inner.flags.insert(SocketFlags::CONNECTED);
        }
        Ok(())
    }

    /// 接続到着: リスナーの子ソケットを作って保留キューへ積む
    ///
    /// リッスンしていなければWrongState、バックログ満杯ならBacklogFull。
    /// 子はPENDING+CONNECTINGで始まり、制御ブロックはリスナーのものを
    /// 引き継ぐ（グループ参加を除く）。
    pub fn new_incoming_connection(&self, listener: &SocketRef) -> SocketResult<SocketRef> {
        let mut inner = listener.inner();
        if !inner.flags.contains(SocketFlags::LISTENING) {
            return Err(SocketError::WrongState);
        }
        match &inner.role {
            SocketRole::Listener { backlog, pending } => {
                if pending.len() >= *backlog {
                    return Err(SocketError::BacklogFull);
                }
            }
            SocketRole::Leaf { .. } => return Err(SocketError::WrongState),
        }

        let child = Socket::alloc_socket(
            listener.family(),
            listener.stype(),
            IpProto::TCP,
            inner.context,
        );
        {
            let mut ci = child.inner();
            ci.pcb = inner.pcb.clone_for_child();
            ci.flags.insert(SocketFlags::PENDING | SocketFlags::CONNECTING);
            ci.role = SocketRole::Leaf {
                parent: Some(listener.clone()),
            };
        }
        child.reference(); // キュー保持分
        if let SocketRole::Listener { pending, .. } = &mut inner.role {
            pending.push_back(child.clone());
        }
        Ok(child)
    }

    /// 接続完了済みの子を1つ取り出してIDを割り当てる
    pub fn accept(&self, id: SocketId) -> SocketResult<SocketId> {
        let listener = self.get(id).ok_or(SocketError::NotFound)?;
        let child = {
            let mut inner = listener.inner();
            if !inner.flags.contains(SocketFlags::LISTENING) {
                return Err(SocketError::WrongState);
            }
            match &mut inner.role {
                SocketRole::Listener { pending, .. } => {
                    let pos = pending
                        .iter()
                        .position(|c| c.flags().contains(SocketFlags::CONNECTED))
                        .ok_or(SocketError::WouldBlock)?;
                    pending.remove(pos).ok_or(SocketError::WouldBlock)?
                }
                SocketRole::Leaf { .. } => return Err(SocketError::WrongState),
            }
        };

        {
            let mut ci = child.inner();
            ci.flags.remove(SocketFlags::PENDING);
            if let SocketRole::Leaf { parent } = &mut ci.role {
                *parent = None;
            }
        }

        let attached = self.table.lock().id_assign_and_attach(&child);
        match attached {
            Ok(cid) => {
                child.dereference(); // キュー保持分を返す
                Ok(cid)
            }
            Err(e) => {
                self.release(&child);
                child.dereference(); // キュー保持分
                child.dereference(); // 生成時の分
                Err(e)
            }
        }
    }

    // -------------------------------------------------
    // トランスポート通知
    // -------------------------------------------------

    /// 接続完了通知
    ///
    /// PENDINGの子なら親リスナーへ「接続到着」を、そうでなければ本人へ
    /// 「接続完了」を投函する。
    pub fn connection_complete(&self, sock: &SocketRef) {
        let (is_pending, parent) = {
            let mut inner = sock.inner();
            inner.flags.remove(SocketFlags::CONNECTING);
            inner.flags.insert(SocketFlags::CONNECTED);
            let parent = match &inner.role {
                SocketRole::Leaf { parent } => parent.clone(),
                SocketRole::Listener { .. } => None,
            };
            (inner.flags.contains(SocketFlags::PENDING), parent)
        };

        let outcome = if is_pending {
            match parent {
                Some(listener) => self.router.post(&listener, SocketEvent::IncomingReady),
                None => return,
            }
        } else {
            self.router.post(sock, SocketEvent::ConnectDone)
        };
        if outcome.is_err() {
            StackStats::bump(&self.stats.events_lost);
        }
    }

    /// 接続断通知
    ///
    /// まだPENDINGならアプリはハンドルを持っていないので黙って破棄する。
    /// それ以外は理由つきの切断イベントを投函する。
    pub fn connection_abandoned(&self, sock: &SocketRef, reason: AbortReason) {
        let is_pending = {
            let mut inner = sock.inner();
            inner.flags.remove(SocketFlags::CONNECTING);
            inner.flags.insert(
                SocketFlags::CONNECTED | SocketFlags::SHUT_WR | SocketFlags::CANT_RECV_MORE,
            );
            inner.send.flush();
            inner.flags.contains(SocketFlags::PENDING)
        };

        if is_pending {
            self.release(sock);
        } else if self.router.post(sock, SocketEvent::Aborted(reason)).is_err() {
            StackStats::bump(&self.stats.events_lost);
        }
    }

    // -------------------------------------------------
    // 受信経路
    // -------------------------------------------------

    /// 受信ディスパッチ
    ///
    /// バッファに宛先ソケットがタグ付けされていなければlookupで解決する。
    /// 対応なし/状態不正/フロー制御あふれ/通知失敗はいずれもバッファを
    /// 破棄して終わる（戻り値なし、カウンタのみ）。
    pub fn socket_up(&self, proto: IpProto, mut buf: BufHandle) {
        let sock = match buf.socket_ref() {
            Some(sock) => sock.clone(),
            None => {
                let found = self
                    .table
                    .lock()
                    .lookup(AddressFamily::Inet6, proto, &buf.dst, &buf.src, true);
                match found {
                    Some(sock) => sock,
                    None => {
                        StackStats::bump(&self.stats.rx_no_socket);
                        return; // バッファはここでDrop
                    }
                }
            }
        };
        buf.detach_socket();

        let (queued_mode, payload_len) = {
            let inner = sock.inner();
            if inner.flags.intersects(SocketFlags::PENDING | SocketFlags::CLOSED)
                || !inner.id.is_assigned()
            {
                StackStats::bump(&self.stats.rx_bad_state);
                return;
            }
            (inner.recv.data_limit() > 0, buf.len())
        };

        if queued_mode {
            if sock.inner().recv.space() < payload_len as isize {
                StackStats::bump(&self.stats.rx_flow_dropped);
                return;
            }
            // 通知を先に積む。積めなければ受理失敗と同じ扱いで破棄する
            if self.router.post(&sock, SocketEvent::DataQueued).is_err() {
                StackStats::bump(&self.stats.rx_event_dropped);
                return;
            }
            sock.inner().recv.append(buf);
            StackStats::bump(&self.stats.rx_admitted);
        } else {
            match self.router.post(&sock, SocketEvent::Received(buf)) {
                Ok(()) => StackStats::bump(&self.stats.rx_admitted),
                Err(_event) => {
                    // 返ってきたイベントごとバッファをDropする
                    StackStats::bump(&self.stats.rx_event_dropped);
                }
            }
        }
    }

    /// 指定コンテキストの保留イベントを配達する
    pub fn deliver_events(&self, ctx: ContextId) -> usize {
        self.router.deliver_pending(ctx)
    }

    // -------------------------------------------------
    // 送信経路
    // -------------------------------------------------

    /// 送信エントリポイント
    ///
    /// 戻り値は受理したバイト数。ストリームはフロー制御による部分受理が
    /// ありうる。データグラム/RAWは全量かエラーのどちらか。
    pub fn sendmsg(
        &self,
        id: SocketId,
        payload: SendPayload<'_>,
        control: &[u8],
        flags: SendFlags,
        dst: Option<SockAddr6>,
    ) -> SocketResult<usize> {
        let sock = self.get(id).ok_or(SocketError::NotFound)?;
        match sock.stype() {
            SockType::Stream => self.send_stream(&sock, payload, flags, dst),
            SockType::Datagram | SockType::Raw => {
                self.send_dgram(&sock, payload, control, dst)
            }
        }
    }

    /// ストリーム送信: 送信キューへのバイト積み込み
    ///
    /// CONNECTED必須、SHUT_WR後は拒否、明示宛先は不可。空の書き込みは
    /// 成功の無操作。空き領域が低水位未満なら全体を拒否し、以上なら
    /// 入る分だけ受理する（ONESHOT_COMPATは会計を無視して全量受理）。
    fn send_stream(
        &self,
        sock: &SocketRef,
        payload: SendPayload<'_>,
        flags: SendFlags,
        dst: Option<SockAddr6>,
    ) -> SocketResult<usize> {
        if dst.is_some() {
            return Err(SocketError::InvalidArgument);
        }
        let mut inner = sock.inner();
        if inner.flags.contains(SocketFlags::SHUT_WR) {
            return Err(SocketError::Shutdown);
        }
        if !inner.flags.contains(SocketFlags::CONNECTED) {
            return Err(SocketError::NotConnected);
        }

        match payload {
            SendPayload::Buffer(buf) => {
                let len = buf.len();
                inner.send.append_and_compress(buf);
                Ok(len)
            }
            SendPayload::Slices(slices) => {
                let total = total_len(slices)?;
                if total == 0 {
                    return Ok(0);
                }

                let accepted = if flags.contains(SendFlags::ONESHOT_COMPAT) {
                    total
                } else {
                    let space = inner.send.space();
                    if space < inner.send.low_water() as isize {
                        return Err(SocketError::WouldBlock);
                    }
                    total.min(space as usize)
                };

                let mut buf = Buf::alloc(0, accepted, accepted)
                    .ok_or(SocketError::NoBufs)?;
                copy_slices(&mut buf, slices, accepted);
                inner.send.append_and_compress(buf);
                Ok(accepted)
            }
        }
    }

    /// データグラム/RAW送信: バッファ組み立てと送出
    fn send_dgram(
        &self,
        sock: &SocketRef,
        payload: SendPayload<'_>,
        control: &[u8],
        dst: Option<SockAddr6>,
    ) -> SocketResult<usize> {
        let opts = parse_control(control)?;

        // 組み立て済みバッファ以外はここでアリーナから確保する
        let mut buf = match payload {
            SendPayload::Buffer(buf) => buf,
            SendPayload::Slices(slices) => {
                let total = total_len(slices)?;
                let mut buf = Buf::alloc(DEFAULT_HEADROOM, total, DEFAULT_MIN_SIZE)
                    .ok_or(SocketError::NoBufs)?;
                copy_slices(&mut buf, slices, total);
                buf
            }
        };
        let sent = buf.len();

        let inner = sock.inner();
        if inner.flags.contains(SocketFlags::SHUT_WR) {
            return Err(SocketError::Shutdown);
        }
        let pcb = &inner.pcb;

        let dst = match dst {
            Some(dst) => dst,
            None => {
                if pcb.peer.is_unspecified() {
                    return Err(SocketError::NotConnected);
                }
                pcb.peer
            }
        };
        if dst.addr.is_unspecified() {
            return Err(SocketError::InvalidArgument);
        }

        let iface = self.select_outgoing(&dst.addr, &opts, pcb)?;
        let src = self.select_src(&iface, &dst.addr, &opts, pcb)?;
        let hops = resolve_hop_limit(&dst.addr, &opts, pcb, &iface);

        buf.src = SockAddr6::new(src, pcb.local.port);
        buf.dst = dst;
        buf.hop_limit = hops;
        buf.traffic_class = match opts.traffic_class {
            Some(v) if v != OPT_UNSET => v as u8,
            _ if pcb.traffic_class != OPT_UNSET => pcb.traffic_class as u8,
            _ => 0,
        };
        buf.flow_label = pcb.flow_label;
        apply_flags(&mut buf, &opts, pcb);

        if !dst.addr.has_small_scope() {
            if let Some(route) = self.routes.choose_next_hop(&dst.addr) {
                buf.set_route(route);
            }
        }
        drop(inner);

        self.tx.transmit(buf);
        StackStats::bump(&self.stats.tx_packets);
        Ok(sent)
    }

    /// 送出インターフェースの決定
    ///
    /// 優先順: PKTINFOの明示指定 → マルチキャスト宛のソケット指定
    /// インターフェース → 広スコープ宛の経路表引き →
    /// 残るスモールスコープ宛は6LoWPAN、なければIPv6への固定フォール
    /// バック。
    fn select_outgoing(
        &self,
        dst: &Ip6Addr,
        opts: &SendOptions,
        pcb: &InetPcb,
    ) -> SocketResult<Arc<Netif>> {
        if let Some(ifindex) = opts.ifindex {
            return self
                .ifaces
                .by_index(ifindex)
                .ok_or(SocketError::InvalidArgument);
        }
        if dst.is_multicast() && pcb.mcast_ifindex != 0 {
            if let Some(iface) = self.ifaces.by_index(pcb.mcast_ifindex) {
                return Ok(iface);
            }
        }
        if !dst.has_small_scope() {
            let ifindex = self.routes.route_to(dst).ok_or(SocketError::NoRoute)?;
            return self
                .ifaces
                .by_index(ifindex)
                .ok_or(SocketError::NoRoute);
        }
        self.ifaces
            .by_kind(LinkKind::Lowpan)
            .or_else(|| self.ifaces.by_kind(LinkKind::Ipv6))
            .ok_or(SocketError::NoRoute)
    }

    /// 送信元アドレスの決定
    ///
    /// 明示指定 → バインド済みローカル → インターフェースの選択方針。
    fn select_src(
        &self,
        iface: &Netif,
        dst: &Ip6Addr,
        opts: &SendOptions,
        pcb: &InetPcb,
    ) -> SocketResult<Ip6Addr> {
        if let Some(src) = opts.src {
            return Ok(src);
        }
        if !pcb.local.addr.is_unspecified() {
            return Ok(pcb.local.addr);
        }
        iface.select_source(dst).ok_or(SocketError::NoRoute)
    }
}

/// ホップリミットの決定
///
/// メッセージ上書き → マルチキャストのソケット既定 → ユニキャストの
/// ソケット既定 → インターフェース既定。
fn resolve_hop_limit(dst: &Ip6Addr, opts: &SendOptions, pcb: &InetPcb, iface: &Netif) -> u8 {
    if let Some(hops) = opts.hop_limit {
        if hops != OPT_UNSET {
            return hops as u8;
        }
    }
    let socket_default = if dst.is_multicast() {
        pcb.mcast_hops
    } else {
        pcb.ucast_hops
    };
    if socket_default != OPT_UNSET {
        return socket_default as u8;
    }
    iface.hop_limit
}

/// メッセージ/ソケットオプションからバッファフラグを立てる
fn apply_flags(buf: &mut Buf, opts: &SendOptions, pcb: &InetPcb) {
    let dont_frag = opts.dont_frag.unwrap_or(pcb.dont_frag);
    buf.flags.set(BufFlags::DONT_FRAG, dont_frag);

    let min_mtu = match opts.use_min_mtu {
        Some(v) if v >= 0 => v == 1,
        _ => pcb.use_min_mtu == 1,
    };
    buf.flags.set(BufFlags::USE_MIN_MTU, min_mtu);

    if buf.dst.addr.is_multicast() {
        let loop_back = opts.mcast_loop.unwrap_or(pcb.mcast_loop);
        buf.flags.set(BufFlags::MCAST_LOOP, loop_back);
    }
    if pcb.security_bypass {
        buf.flags.insert(BufFlags::NO_SECURITY);
    }
}

/// scatter-gather記述から先頭`limit`バイトをバッファへ詰める
///
/// 確保直後の空ウィンドウに後続容量が`limit`以上ある前提。
fn copy_slices(buf: &mut Buf, slices: &[&[u8]], limit: usize) {
    let mut remaining = limit;
    for slice in slices {
        if remaining == 0 {
            break;
        }
        let take = slice.len().min(remaining);
        buf.append_data(&slice[..take]);
        remaining -= take;
    }
}

// =====================================================
// テスト
// =====================================================
