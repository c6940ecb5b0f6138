//! 에러 타입 정의

use thiserror::Error;

/// SRP 프로토콜 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("패킷이 너무 짧음: {len} bytes")]
    TruncatedPacket { len: usize },

    #[error("알 수 없는 패킷 종류: {kind}")]
    UnknownKind { kind: u8 },

    #[error("ACK run 길이 초과: {len} (최대 128)")]
    AckRunTooLong { len: usize },

    #[error("ACK run이 인덱스 0 아래로 벗어남: cursor={cursor}, run={run}")]
    AckRunOverrun { cursor: i32, run: u32 },

    #[error("빈 페이로드는 전송 불가")]
    EmptyPayload,

    #[error("페이로드가 너무 큼: {chunks} 청크 (최대 {max})")]
    PayloadTooLarge { chunks: usize, max: usize },

    #[error("동시 스트림 한도 초과: 최대 {max}")]
    StreamLimit { max: usize },

    #[error("엔드포인트 종료됨")]
    ChannelClosed,
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
