// ============================================================================
// src/lib.rs - wpan6: IPv6/6LoWPAN socket buffering core
// ============================================================================
//!
//! # wpan6
//!
//! メモリ制約の厳しい機器向け組み込みIPv6/6LoWPANスタックの、
//! パケットバッファ確保とソケットのバッファリング/ライフサイクル中核。
//!
//! - [`buf`] - パケットバッファ: 1回のヒープ確保にデータ窓とメタデータを
//!   同居させるアリーナ式アロケータ。ヘッドルーム成長・クローン・
//!   ターンアラウンドを提供する
//! - [`sockbuf`] - ソケット方向別のバイト会計つきFIFOとフロー制御
//! - [`socket`] - ソケット本体・制御ブロック・IDテーブル・参照カウント
//! - [`event`] - 協調スケジューリング下の有界イベント配達
//! - [`stack`] - 受信ディスパッチと送信エントリポイント(sendmsg)
//!
//! ヒープアロケータ・経路表・TCP状態機械・リンク層フレーミングは
//! 外部コラボレータで、トレイト境界([`route::Routes`],
//! [`netif::Interfaces`], [`transport::TcpTransport`],
//! [`stack::TxSink`])の向こう側にある。
//!
//! ブロックする操作はない。待ちが必要な要求はすべて呼び出し元の
//! コンテキストへ後からイベントが届く形で満たされる。

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod addr;
pub mod buf;
pub mod event;
pub mod netif;
pub mod route;
pub mod sockbuf;
pub mod socket;
pub mod stack;
pub mod transport;

pub use addr::{Ip6Addr, SockAddr6};
pub use buf::{Buf, BufFlags, BufHandle, Priority};
pub use event::{ContextId, EventCallback, EventRouter, SocketEvent};
pub use sockbuf::SockBuf;
pub use socket::types::{
    AbortReason, AddressFamily, IpProto, SockType, SocketError, SocketFlags, SocketId,
    SocketResult,
};
pub use socket::{Socket, SocketRef};
pub use stack::{SendFlags, SendPayload, Stack, StackStats, TxSink};
