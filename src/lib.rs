//! # SRP (Selective Repeat Protocol)
//!
//! UDP 기반 selective-repeat 신뢰성 전송 프로토콜
//!
//! ## 핵심 특징
//! - **Selective ACK**: 수신측이 high mark + 누락 구간을 run-length로 압축 보고
//! - **Gap 우선 재전송**: 보고된 누락 청크를 새 청크보다 먼저 재전송
//! - **슬라이딩 윈도우**: 스트림당 in-flight 청크 수 제한
//! - **스트림 다중화**: 하나의 소켓 위에 (peer, stream id) 단위 동시 전송
//! - **주입식 클럭**: 타이머를 가짜 클럭으로 구동하여 결정적 테스트 가능
//! - **실패 통지**: 재시도 소진 시 호출자에게 명시적으로 실패 전달

pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod endpoint;
pub mod error;
pub mod inbound;
pub mod outbound;
pub mod range;
pub mod stats;
pub mod wire;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use dispatcher::{Dispatcher, Event, SendOutcome, Transport};
pub use endpoint::{DeliveryReceiver, Endpoint};
pub use error::{Error, Result};
pub use inbound::InboundStream;
pub use outbound::OutboundStream;
pub use range::RangeSet;
pub use stats::ProtocolStats;
pub use wire::{Packet, PacketKind};

/// 스트림 ID (32비트, 송신측이 할당)
pub type StreamId = u32;

/// 청크 인덱스 (16비트, 스트림 내 순번)
pub type ChunkIndex = u16;

/// 패킷 공통 헤더 크기: stream_id(4) + kind(1)
pub const HEADER_SIZE: usize = 5;

/// 기본 청크 크기 (바이트)
pub const DEFAULT_CHUNK_SIZE: usize = 1200;

/// ACK run-length 한 바이트가 표현 가능한 최대 run 길이
pub const MAX_ACK_RUN: usize = 128;
