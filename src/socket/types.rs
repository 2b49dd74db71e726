//! # 基本型定義 - ソケット層の型
//!
//! SocketId, SockType, AddressFamily, IpProto, SocketFlags, SocketError等

use bitflags::bitflags;

/// ソケットID（固定長テーブルの小さい非負整数）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct SocketId(u16);

impl SocketId {
    /// 未割り当て
    pub const UNASSIGNED: Self = Self(u16::MAX);

    /// 生の値から作成（内部用）
    #[inline(always)]
    pub const fn from_raw(id: u16) -> Self {
        Self(id)
    }

    /// 生の値を取得
    #[inline(always)]
    pub const fn raw(self) -> u16 {
        self.0
    }

    /// テーブル添字
    #[inline(always)]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// 割り当て済みか
    #[inline(always)]
    pub const fn is_assigned(self) -> bool {
        self.0 != u16::MAX
    }
}

/// アドレスファミリ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    /// IPv6
    Inet6,
}

/// ソケットタイプ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockType {
    /// ストリームソケット（TCP）
    Stream,
    /// データグラムソケット（UDP）
    Datagram,
    /// RAWソケット（直接IP層アクセス）
    Raw,
}

/// IPプロトコル番号
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct IpProto(u8);

impl IpProto {
    pub const TCP: Self = Self(6);
    pub const UDP: Self = Self(17);
    pub const ICMPV6: Self = Self(58);

    /// 生の値から作成
    #[inline(always)]
    pub const fn from_raw(proto: u8) -> Self {
        Self(proto)
    }

    /// 生の値を取得
    #[inline(always)]
    pub const fn raw(self) -> u8 {
        self.0
    }

    /// ポートを持つトランスポートか（TCP/UDP）
    #[inline(always)]
    pub const fn has_ports(self) -> bool {
        self.0 == 6 || self.0 == 17
    }
}

bitflags! {
    /// ソケットライフサイクルのフラグビット集合
    ///
    /// 生成直後は空。connectでCONNECTING、完了でCONNECTED。
    /// クローズ経路はCLOSED/SHUT_WR/CANT_RECV_MOREを立てる（終端状態）。
    /// PENDINGは未AcceptのリスナーTCP子ソケット、LISTENINGはアクセプタ。
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SocketFlags: u8 {
        const CONNECTING     = 1 << 0;
        const CONNECTED      = 1 << 1;
        const CLOSED         = 1 << 2;
        const SHUT_WR        = 1 << 3;
        const CANT_RECV_MORE = 1 << 4;
        const PENDING        = 1 << 5;
        const LISTENING      = 1 << 6;
    }
}

/// 接続断の理由（トランスポートから通知される）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// 接続拒否
    Refused,
    /// リセット受信
    Reset,
    /// タイムアウト
    TimedOut,
}

/// ソケットエラー
///
/// 資源枯渇系（TableFull/BacklogFull/PortInUse）は汎用の失敗と
/// 混同しない: 呼び出し側が「別ポートを試す」と「メモリ不足」を
/// 区別できる必要がある。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketError {
    /// ソケットが見つからない（IDが解決できない）
    NotFound,
    /// 無効な引数
    InvalidArgument,
    /// 未対応のアドレスファミリ
    AfNotSupported,
    /// バッファ/イベント確保失敗
    NoBufs,
    /// フロー制御による受理拒否
    WouldBlock,
    /// 状態が不正（リッスンしていない等）
    WrongState,
    /// 接続されていない
    NotConnected,
    /// 書き込み側シャットダウン済み
    Shutdown,
    /// ポートがすでに使用中
    PortInUse,
    /// IDテーブル満杯
    TableFull,
    /// リッスンバックログ満杯
    BacklogFull,
    /// 経路なし
    NoRoute,
}

impl core::fmt::Display for SocketError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NotFound => write!(f, "Socket not found"),
            Self::InvalidArgument => write!(f, "Invalid argument"),
            Self::AfNotSupported => write!(f, "Address family not supported"),
            Self::NoBufs => write!(f, "No buffer space"),
            Self::WouldBlock => write!(f, "Operation would exceed flow-control limits"),
            Self::WrongState => write!(f, "Invalid socket state"),
            Self::NotConnected => write!(f, "Not connected"),
            Self::Shutdown => write!(f, "Shut down for writing"),
            Self::PortInUse => write!(f, "Port already in use"),
            Self::TableFull => write!(f, "Socket table full"),
            Self::BacklogFull => write!(f, "Listen backlog full"),
            Self::NoRoute => write!(f, "No route to destination"),
        }
    }
}

/// ソケット結果型
pub type SocketResult<T> = Result<T, SocketError>;

// =====================================================
// テスト
// =====================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_id() {
        let id = SocketId::from_raw(3);
        assert!(id.is_assigned());
        assert_eq!(id.index(), 3);
        assert!(!SocketId::UNASSIGNED.is_assigned());
    }

    #[test]
    fn test_proto_ports() {
        assert!(IpProto::TCP.has_ports());
        assert!(IpProto::UDP.has_ports());
        assert!(!IpProto::ICMPV6.has_ports());
    }

    #[test]
    fn test_terminal_flags() {
        let mut flags = SocketFlags::CONNECTING;
        flags.remove(SocketFlags::CONNECTING);
        flags.insert(SocketFlags::CONNECTED);
        assert_eq!(flags, SocketFlags::CONNECTED);

        flags.insert(SocketFlags::CLOSED | SocketFlags::SHUT_WR | SocketFlags::CANT_RECV_MORE);
        assert!(flags.contains(SocketFlags::CLOSED));
    }
}
