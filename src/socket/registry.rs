//! # ソケットIDテーブル
//!
//! 小さな非負整数IDとソケットの固定長対応表。
//!
//! - IDの有効性は「スロットが埋まっていて、かつ格納ソケット自身の
//!   idフィールドが一致する」ことで判定する。スロットの再利用後に
//!   古いIDで取り出してしまう事故をここで防ぐ
//! - 割り当ては前回割り当てスロットの次からのラウンドロビン走査。
//!   直近に解放されたIDがすぐ再利用されにくくなる
//! - テーブルの書き換えはattach/detachのみ。協調スケジューリング下で
//!   中断なしに完了する

#![allow(dead_code)]

use crate::addr::SockAddr6;
use crate::socket::types::{AddressFamily, IpProto, SocketError, SocketId, SocketResult};
use crate::socket::SocketRef;

/// 同時に存在できるソケット数
pub const MAX_SOCKETS: usize = 16;

/// ID→ソケットの固定長テーブル
pub struct SocketTable {
    slots: [Option<SocketRef>; MAX_SOCKETS],
    /// 前回割り当てたスロット（次回走査の起点）
    last: usize,
}

impl SocketTable {
    /// 空テーブルを作る
    pub const fn new() -> Self {
        Self {
            slots: [const { None }; MAX_SOCKETS],
            last: MAX_SOCKETS - 1,
        }
    }

    /// 次の空きスロットにソケットを割り当て、IDを書き込む
    ///
    /// テーブル自身も参照を1つ保持する。満杯ならTableFull。
    pub fn id_assign_and_attach(&mut self, sock: &SocketRef) -> SocketResult<SocketId> {
        for step in 1..=MAX_SOCKETS {
            let idx = (self.last + step) % MAX_SOCKETS;
            if self.slots[idx].is_none() {
                let id = SocketId::from_raw(idx as u16);
                sock.inner().id = id;
                sock.reference();
                self.slots[idx] = Some(sock.clone());
                self.last = idx;
                #[cfg(feature = "verbose_logging")]
                log::trace!("socket table: attached id={}", idx);
                return Ok(id);
            }
        }
        Err(SocketError::TableFull)
    }

    /// IDとソケットの対応を外す
    ///
    /// 取り外したソケットを返す（テーブル保持分の参照返却は呼び出し側の
    /// 責任。解放経路の順序制御をそちらに寄せるため）。
    pub fn detach_slot(&mut self, id: SocketId) -> Option<SocketRef> {
        let sock = self.get(id)?;
        sock.inner().id = SocketId::UNASSIGNED;
        self.slots[id.index()] = None;
        #[cfg(feature = "verbose_logging")]
        log::trace!("socket table: detached id={}", id.raw());
        Some(sock)
    }

    /// IDからソケットを取得
    ///
    /// スロットが埋まっていて、かつ格納ソケットのidが一致するときだけ
    /// 返す。
    pub fn get(&self, id: SocketId) -> Option<SocketRef> {
        if !id.is_assigned() || id.index() >= MAX_SOCKETS {
            return None;
        }
        let sock = self.slots[id.index()].as_ref()?;
        if sock.inner().id != id {
            return None;
        }
        Some(sock.clone())
    }

    /// 指定プロトコルでポートが使用中か
    pub fn port_in_use(&self, proto: IpProto, port: u16) -> bool {
        if port == 0 {
            return false;
        }
        self.slots.iter().flatten().any(|sock| {
            let inner = sock.inner();
            inner.pcb.proto == proto && inner.pcb.local.port == port
        })
    }

    /// 受信パケットに対応するソケットを線形走査で探す
    ///
    /// アドレスファミリとプロトコルの一致は必須。TCP/UDPはポート一致も
    /// 必須: ローカルポートは非ゼロかつ一致、リモートポートは一致
    /// （ワイルドカード許可時は候補のリモートポート0も可）。
    /// アドレスはローカル/リモート独立に「完全一致、またはワイルド
    /// カード許可かつ候補側が未指定」で一致とみなす。
    pub fn lookup(
        &self,
        family: AddressFamily,
        proto: IpProto,
        local: &SockAddr6,
        remote: &SockAddr6,
        allow_wildcards: bool,
    ) -> Option<SocketRef> {
        for sock in self.slots.iter().flatten() {
            if sock.family() != family {
                continue;
            }
            let inner = sock.inner();
            let pcb = &inner.pcb;
            if pcb.proto != proto {
                continue;
            }
            if proto.has_ports() {
                if pcb.local.port == 0 || pcb.local.port != local.port {
                    continue;
                }
                if pcb.peer.port != remote.port && !(allow_wildcards && pcb.peer.port == 0) {
                    continue;
                }
            }
            if !addr_matches(&pcb.local.addr, &local.addr, allow_wildcards) {
                continue;
            }
            if !addr_matches(&pcb.peer.addr, &remote.addr, allow_wildcards) {
                continue;
            }
            drop(inner);
            return Some(sock.clone());
        }
        None
    }

    /// 使用中スロット数
    pub fn active_count(&self) -> usize {
        self.slots.iter().flatten().count()
    }
}

/// 候補ソケット側アドレスとパケット側アドレスの一致判定
#[inline]
fn addr_matches(
    bound: &crate::addr::Ip6Addr,
    packet: &crate::addr::Ip6Addr,
    allow_wildcards: bool,
) -> bool {
    bound == packet || (allow_wildcards && bound.is_unspecified())
}

// =====================================================
// テスト
// =====================================================
