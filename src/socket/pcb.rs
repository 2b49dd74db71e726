//! # プロトコル制御ブロック - アドレス/ポート/ソケットオプション
//!
//! InetPcb
//!
//! ソケットが唯一所有する。所有ソケットの解放時に、参加中の
//! マルチキャストグループを抜けてから破棄される。

use hashbrown::HashSet;

use crate::addr::{Ip6Addr, SockAddr6};
use crate::buf::FLOW_LABEL_UNSPEC;
use crate::socket::types::IpProto;

/// ホップリミット等の「ソケット既定を使う」マーカー
pub const OPT_UNSET: i16 = -1;

/// インターネットプロトコル制御ブロック
#[derive(Debug, Clone)]
pub struct InetPcb {
    /// バインド済みローカルアドレス+ポート
    pub local: SockAddr6,
    /// ピアアドレス+ポート
    pub peer: SockAddr6,
    /// プロトコル番号
    pub proto: IpProto,
    /// ユニキャストホップリミット（-1 = インターフェース既定）
    pub ucast_hops: i16,
    /// マルチキャストホップリミット（-1 = インターフェース既定）
    pub mcast_hops: i16,
    /// マルチキャスト送出インターフェース（0 = 未指定）
    pub mcast_ifindex: u32,
    /// マルチキャストの自己ループバック
    pub mcast_loop: bool,
    /// トラフィッククラス（-1 = 既定）
    pub traffic_class: i16,
    /// フローラベル（FLOW_LABEL_UNSPEC = 未指定）
    pub flow_label: u32,
    /// リンク層セキュリティのバイパス
    pub security_bypass: bool,
    /// 最小MTUポリシー（-1 = 既定, 0 = 無効, 1 = 有効）
    pub use_min_mtu: i8,
    /// フラグメント禁止
    pub dont_frag: bool,
    /// 参加中のマルチキャストグループ (グループアドレス, インターフェース)
    groups: HashSet<(Ip6Addr, u32)>,
}

impl InetPcb {
    /// 新規作成
    pub fn new(proto: IpProto) -> Self {
        Self {
            local: SockAddr6::UNSPECIFIED,
            peer: SockAddr6::UNSPECIFIED,
            proto,
            ucast_hops: OPT_UNSET,
            mcast_hops: OPT_UNSET,
            mcast_ifindex: 0,
            mcast_loop: true,
            traffic_class: OPT_UNSET,
            flow_label: FLOW_LABEL_UNSPEC,
            security_bypass: false,
            use_min_mtu: -1,
            dont_frag: false,
            groups: HashSet::new(),
        }
    }

    /// リスナーの子ソケット用クローン
    ///
    /// バインド情報とオプションを引き継ぐ。グループ参加は引き継がない。
    pub fn clone_for_child(&self) -> Self {
        Self {
            groups: HashSet::new(),
            ..self.clone()
        }
    }

    /// マルチキャストグループに参加
    ///
    /// 既に参加済みならfalse
    pub fn join_group(&mut self, group: Ip6Addr, ifindex: u32) -> bool {
        self.groups.insert((group, ifindex))
    }

    /// マルチキャストグループから離脱
    pub fn leave_group(&mut self, group: Ip6Addr, ifindex: u32) -> bool {
        self.groups.remove(&(group, ifindex))
    }

    /// 参加中のグループ数
    #[inline]
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// グループに参加中か
    #[inline]
    pub fn in_group(&self, group: Ip6Addr, ifindex: u32) -> bool {
        self.groups.contains(&(group, ifindex))
    }

    /// 全グループから離脱（所有ソケットの解放直前に呼ぶ）
    pub fn leave_all_groups(&mut self) {
        #[cfg(feature = "verbose_logging")]
        if !self.groups.is_empty() {
            log::trace!("pcb: leaving {} multicast group(s)", self.groups.len());
        }
        self.groups.clear();
    }

    /// バインド済み5タプルを消す（ポートを再利用可能にする）
    pub fn clear_binding(&mut self) {
        self.local = SockAddr6::UNSPECIFIED;
        self.peer = SockAddr6::UNSPECIFIED;
    }
}

// =====================================================
// テスト
// =====================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_membership() {
        let mut pcb = InetPcb::new(IpProto::UDP);
        let group = Ip6Addr::new([0xff, 0x02, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]);

        assert!(pcb.join_group(group, 1));
        assert!(!pcb.join_group(group, 1), "duplicate join");
        assert!(pcb.in_group(group, 1));
        assert_eq!(pcb.group_count(), 1);

        pcb.leave_all_groups();
        assert_eq!(pcb.group_count(), 0);
    }

    #[test]
    fn test_child_clone_drops_groups() {
        let mut pcb = InetPcb::new(IpProto::TCP);
        pcb.local = SockAddr6::new(Ip6Addr::LOOPBACK, 7000);
        pcb.ucast_hops = 12;
        pcb.join_group(Ip6Addr::LOOPBACK, 1);

        let child = pcb.clone_for_child();
        assert_eq!(child.local.port, 7000);
        assert_eq!(child.ucast_hops, 12);
        assert_eq!(child.group_count(), 0);
    }

    #[test]
    fn test_clear_binding() {
        let mut pcb = InetPcb::new(IpProto::UDP);
        pcb.local = SockAddr6::new(Ip6Addr::LOOPBACK, 5000);
        pcb.peer = SockAddr6::new(Ip6Addr::LOOPBACK, 5001);
        pcb.clear_binding();
        assert!(pcb.local.is_unspecified());
        assert!(pcb.peer.is_unspecified());
    }
}
