//! # 経路表境界 - ルーティングはスコープ外
//!
//! RouteInfo, Routes
//!
//! 経路決定ロジック（RPL等）は本コアの外にある。ここでは送信経路に
//! 必要な最小の問い合わせ境界のみを定義する。

use alloc::sync::Arc;

use crate::addr::Ip6Addr;

/// 経路情報ブロック
///
/// 複数のバッファから共有参照される（Arcで参照カウント管理、
/// カウント0で解放）。共有中の変更は行わない。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteInfo {
    /// ネクストホップアドレス
    pub next_hop: Ip6Addr,
    /// 送出インターフェース番号
    pub ifindex: u32,
}

/// 経路表への問い合わせ境界
pub trait Routes: Send + Sync {
    /// 宛先への送出インターフェースを解決
    fn route_to(&self, dst: &Ip6Addr) -> Option<u32>;

    /// 宛先へのネクストホップ経路情報を解決
    fn choose_next_hop(&self, dst: &Ip6Addr) -> Option<Arc<RouteInfo>>;
}
