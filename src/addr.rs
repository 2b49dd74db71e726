//! # IPv6アドレス型 - アドレスとスコープ判定
//!
//! Ip6Addr, SockAddr6
//!
//! 6LoWPANメッシュではリンクローカル/レルムローカル宛てと
//! グローバル宛てで経路選択が分岐するため、スコープ判定を持つ。

use core::fmt;

/// IPv6アドレス（128bit）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct Ip6Addr(pub [u8; 16]);

impl Ip6Addr {
    /// 未指定アドレス (::)
    pub const UNSPECIFIED: Self = Self([0; 16]);

    /// ループバックアドレス (::1)
    pub const LOOPBACK: Self = Self([0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]);

    /// 新規作成
    #[inline(always)]
    pub const fn new(octets: [u8; 16]) -> Self {
        Self(octets)
    }

    /// オクテット列を取得
    #[inline(always)]
    pub const fn octets(&self) -> [u8; 16] {
        self.0
    }

    /// 未指定アドレスか (::)
    #[inline]
    pub fn is_unspecified(&self) -> bool {
        self.0 == [0; 16]
    }

    /// ループバックか (::1)
    #[inline]
    pub fn is_loopback(&self) -> bool {
        *self == Self::LOOPBACK
    }

    /// マルチキャストか (ff00::/8)
    #[inline(always)]
    pub const fn is_multicast(&self) -> bool {
        self.0[0] == 0xff
    }

    /// リンクローカルユニキャストか (fe80::/10)
    #[inline(always)]
    pub const fn is_link_local(&self) -> bool {
        self.0[0] == 0xfe && (self.0[1] & 0xc0) == 0x80
    }

    /// マルチキャストスコープ値 (RFC 4291)
    /// マルチキャストでない場合は0
    #[inline]
    pub const fn multicast_scope(&self) -> u8 {
        if self.is_multicast() { self.0[1] & 0x0f } else { 0 }
    }

    /// 小スコープ宛てか（リンクローカル、またはスコープ3以下のマルチキャスト）
    ///
    /// 6LoWPANのレルムローカル(scope 3)までは経路表を引かず
    /// デフォルトインターフェースへ直接送出する。
    #[inline]
    pub const fn has_small_scope(&self) -> bool {
        self.is_link_local() || (self.is_multicast() && self.multicast_scope() <= 3)
    }
}

impl fmt::Display for Ip6Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, chunk) in self.0.chunks_exact(2).enumerate() {
            if i > 0 {
                write!(f, ":")?;
            }
            write!(f, "{:x}", u16::from_be_bytes([chunk[0], chunk[1]]))?;
        }
        Ok(())
    }
}

/// ソケットアドレス（IPv6 + ポート）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SockAddr6 {
    /// IPアドレス
    pub addr: Ip6Addr,
    /// ポート番号
    pub port: u16,
}

impl SockAddr6 {
    /// 未指定アドレス
    pub const UNSPECIFIED: Self = Self {
        addr: Ip6Addr::UNSPECIFIED,
        port: 0,
    };

    /// 新規作成
    #[inline(always)]
    pub const fn new(addr: Ip6Addr, port: u16) -> Self {
        Self { addr, port }
    }

    /// ポート付きで作成
    #[inline(always)]
    pub const fn with_port(self, port: u16) -> Self {
        Self {
            addr: self.addr,
            port,
        }
    }

    /// アドレス・ポートともに未指定か
    #[inline]
    pub fn is_unspecified(&self) -> bool {
        self.addr.is_unspecified() && self.port == 0
    }
}

impl fmt::Display for SockAddr6 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]:{}", self.addr, self.port)
    }
}

// =====================================================
// テスト
// =====================================================
