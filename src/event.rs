// ============================================================================
// src/event.rs - Cooperative Event Delivery
// ============================================================================
//!
//! # イベント配達
//!
//! 協調スケジューリングモデルでの非同期通知。ブロックする操作は存在せず、
//! 待ちが必要な要求はすべて「後で自分のコンテキストにイベントが届く」
//! 形で満たされる。
//!
//! ## 契約
//! - 同一コンテキスト宛のイベントは投函順に配達される。コンテキストを
//!   またぐ順序保証はない
//! - キューは有界。満杯時のpostはイベントを呼び出し元へ返す
//!   （運んでいたバッファの解放責任を呼び出し元に戻すため）
//! - 取り消しプリミティブはない。CLOSED/PENDINGになったソケット宛の
//!   通知は配達時のフラグ検査で黙って破棄される

#![allow(dead_code)]

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use hashbrown::HashMap;
use spin::Mutex;

use crate::buf::BufHandle;
use crate::socket::types::{AbortReason, SocketFlags};
use crate::socket::SocketRef;

/// コンテキストあたりの保留イベント上限
pub const MAX_QUEUED_EVENTS: usize = 32;

/// 実行コンテキスト（タスクレット）の識別子
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ContextId(u16);

impl ContextId {
    /// 生の値から作成
    #[inline(always)]
    pub const fn from_raw(id: u16) -> Self {
        Self(id)
    }

    /// 生の値を取得
    #[inline(always)]
    pub const fn raw(self) -> u16 {
        self.0
    }
}

/// ソケットへ配達される通知
pub enum SocketEvent {
    /// 受信データ本体を運ぶ一発通知（レガシーモード）
    Received(BufHandle),
    /// 受信キューにデータが積まれた（キューモード、本体は別途ドレイン）
    DataQueued,
    /// 接続完了
    ConnectDone,
    /// リスナーへの接続到着通知
    IncomingReady,
    /// 接続断（理由つき）
    Aborted(AbortReason),
}

impl SocketEvent {
    /// 運搬中のバッファを取り出す（破棄経路用）
    pub fn into_buffer(self) -> Option<BufHandle> {
        match self {
            Self::Received(buf) => Some(buf),
            _ => None,
        }
    }
}

impl core::fmt::Debug for SocketEvent {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Received(buf) => write!(f, "Received({} bytes)", buf.len()),
            Self::DataQueued => write!(f, "DataQueued"),
            Self::ConnectDone => write!(f, "ConnectDone"),
            Self::IncomingReady => write!(f, "IncomingReady"),
            Self::Aborted(reason) => write!(f, "Aborted({:?})", reason),
        }
    }
}

/// イベントコールバック
///
/// 宛先ソケットの所属コンテキスト上でのみ起動される。
pub type EventCallback = Arc<dyn Fn(SocketRef, SocketEvent) + Send + Sync>;

/// 配達待ちの1件
struct PendingEvent {
    target: SocketRef,
    event: SocketEvent,
}

/// コンテキストごとの有界キューを束ねるルータ
pub struct EventRouter {
    queues: Mutex<HashMap<ContextId, VecDeque<PendingEvent>>>,
}

impl EventRouter {
    /// 空のルータを作る
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// 宛先ソケットの所属コンテキストへイベントを投函
    ///
    /// キュー満杯ならイベントを返す。呼び出し元はそこから運搬中の
    /// バッファを回収して解放する。
    pub fn post(&self, target: &SocketRef, event: SocketEvent) -> Result<(), SocketEvent> {
        let ctx = target.inner().context;
        let mut queues = self.queues.lock();
        let queue = queues.entry(ctx).or_insert_with(VecDeque::new);
        if queue.len() >= MAX_QUEUED_EVENTS {
            log::warn!("event: queue full for context {}", ctx.raw());
            return Err(event);
        }
        queue.push_back(PendingEvent {
            target: target.clone(),
            event,
        });
        Ok(())
    }

    /// 指定コンテキストの保留イベントをすべて配達
    ///
    /// 配達直前にフラグを再検査し、CLOSED/PENDINGになっていた宛先への
    /// 通知は黙って破棄する。コールバックはロック外で呼ぶ。
    /// 戻り値は実際に配達した件数。
    pub fn deliver_pending(&self, ctx: ContextId) -> usize {
        let batch = {
            let mut queues = self.queues.lock();
            match queues.get_mut(&ctx) {
                Some(queue) => core::mem::take(queue),
                None => return 0,
            }
        };

        let mut delivered = 0;
        for pending in batch {
            let flags = pending.target.flags();
            if flags.intersects(SocketFlags::CLOSED | SocketFlags::PENDING) {
                #[cfg(feature = "verbose_logging")]
                log::trace!("event: discarding stale {:?}", pending.event);
                continue;
            }
            if let Some(callback) = pending.target.callback() {
                callback(pending.target, pending.event);
                delivered += 1;
            }
        }
        delivered
    }

    /// 指定コンテキストの保留件数
    pub fn pending_count(&self, ctx: ContextId) -> usize {
        self.queues.lock().get(&ctx).map_or(0, VecDeque::len)
    }
}

impl Default for EventRouter {
    fn default() -> Self {
        Self::new()
    }
}

// =====================================================
// テスト
// =====================================================
