//! # ネットワークインターフェース
//!
//! 送信経路の選択に必要な最小限のインターフェース表現。ヘッダ圧縮や
//! リンク層フレーミングは別レイヤの仕事で、ここでは送出先の決定と
//! 送信元アドレス選択だけを担う。

#![allow(dead_code)]

use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::RwLock;

use crate::addr::Ip6Addr;
use crate::buf::DEFAULT_HOP_LIMIT;

/// リンク技術の種別
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    /// 6LoWPAN (IEEE 802.15.4)
    Lowpan,
    /// 素のIPv6リンク
    Ipv6,
    /// ループバック
    Loopback,
}

/// ネットワークインターフェース
pub struct Netif {
    /// インターフェース番号（1起点、0は「未指定」）
    pub ifindex: u32,
    /// リンク技術
    pub kind: LinkKind,
    /// このインターフェース既定のホップリミット
    pub hop_limit: u8,
    /// 付与済みアドレス
    addrs: RwLock<Vec<Ip6Addr>>,
}

impl Netif {
    /// 新規作成（アドレスなし、既定ホップリミット）
    pub fn new(ifindex: u32, kind: LinkKind) -> Self {
        Self {
            ifindex,
            kind,
            hop_limit: DEFAULT_HOP_LIMIT,
            addrs: RwLock::new(Vec::new()),
        }
    }

    /// アドレスを付与
    pub fn add_addr(&self, addr: Ip6Addr) {
        self.addrs.write().push(addr);
    }

    /// 宛先に応じた送信元アドレスを選ぶ
    ///
    /// リンクローカル/スモールスコープ宛にはリンクローカルを優先し、
    /// それ以外は最初の非リンクローカルを使う。どちらも無ければ
    /// 付与済みの先頭アドレス。
    pub fn select_source(&self, dst: &Ip6Addr) -> Option<Ip6Addr> {
        let addrs = self.addrs.read();
        if dst.has_small_scope() {
            if let Some(addr) = addrs.iter().find(|a| a.is_link_local()) {
                return Some(*addr);
            }
        } else if let Some(addr) = addrs.iter().find(|a| !a.is_link_local()) {
            return Some(*addr);
        }
        addrs.first().copied()
    }

    /// 指定アドレスがこのインターフェースに付与済みか
    pub fn has_addr(&self, addr: &Ip6Addr) -> bool {
        self.addrs.read().contains(addr)
    }
}

/// インターフェース表（外部コラボレータ境界）
pub trait Interfaces: Send + Sync {
    /// 番号でインターフェースを引く
    fn by_index(&self, ifindex: u32) -> Option<Arc<Netif>>;
    /// リンク技術で最初のインターフェースを引く
    fn by_kind(&self, kind: LinkKind) -> Option<Arc<Netif>>;
}

/// 単純なインターフェース表の実装
pub struct NetifTable {
    ifaces: Vec<Arc<Netif>>,
}

impl NetifTable {
    /// 空の表を作る
    pub const fn new() -> Self {
        Self { ifaces: Vec::new() }
    }

    /// インターフェースを登録
    pub fn register(&mut self, iface: Arc<Netif>) {
        self.ifaces.push(iface);
    }
}

impl Interfaces for NetifTable {
    fn by_index(&self, ifindex: u32) -> Option<Arc<Netif>> {
        self.ifaces.iter().find(|i| i.ifindex == ifindex).cloned()
    }

    fn by_kind(&self, kind: LinkKind) -> Option<Arc<Netif>> {
        self.ifaces.iter().find(|i| i.kind == kind).cloned()
    }
}

impl Default for NetifTable {
    fn default() -> Self {
        Self::new()
    }
}

// =====================================================
// テスト
// =====================================================
