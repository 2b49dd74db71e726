//! # トランスポートセッション境界
//!
//! TCP状態機械は外部コラボレータ。ここではソケット層が必要とする
//! 最小の操作だけをトレイトとして切り出す。

#![allow(dead_code)]

use crate::buf::BufHandle;
use crate::socket::pcb::InetPcb;

/// トランスポートセッションの識別子
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct SessionId(u32);

impl SessionId {
    /// 生の値から作成
    #[inline(always)]
    pub const fn from_raw(id: u32) -> Self {
        Self(id)
    }

    /// 生の値を取得
    #[inline(always)]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

/// 送信依頼の結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// 受理された
    Ok,
    /// セッションが送信できる状態にない
    WrongState,
}

/// TCPトランスポート（外部コラボレータ境界）
///
/// shutdown_read/closeはセッション自体の解体を引き起こしうる。
/// 呼び出し側はソケットロックを持たずに呼ぶこと。
pub trait TcpTransport: Send + Sync {
    /// 制御ブロックの5タプルに対応するセッションを引く
    fn session_for(&self, pcb: &InetPcb) -> Option<SessionId>;
    /// 読み取り側をシャットダウン
    fn shutdown_read(&self, session: SessionId);
    /// セッションを閉じる
    fn close(&self, session: SessionId);
    /// データを送信キューへ渡す
    fn send(&self, session: SessionId, buf: BufHandle) -> SendOutcome;
}
