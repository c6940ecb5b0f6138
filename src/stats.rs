//! 전송 통계

/// 프로토콜 카운터
///
/// 디스패처가 단일 태스크 안에서 갱신하고,
/// 엔드포인트가 스냅샷으로 외부에 노출한다.
#[derive(Debug, Clone, Default)]
pub struct ProtocolStats {
    /// 최초 전송한 데이터 청크 수
    pub chunks_sent: u64,

    /// 재전송한 데이터 청크 수
    pub chunks_retransmitted: u64,

    /// 수신하여 새로 저장한 청크 수
    pub chunks_received: u64,

    /// 중복 수신 청크 수
    pub duplicate_chunks: u64,

    /// 발신한 ACK 수
    pub acks_sent: u64,

    /// 수신한 ACK 수
    pub acks_received: u64,

    /// 무시한 구버전 ACK 수
    pub stale_acks: u64,

    /// 모르는 스트림 앞으로 온 ACK 수
    pub unknown_acks: u64,

    /// 디코드 실패 데이터그램 수
    pub malformed_packets: u64,

    /// 송신 완료된 스트림 수
    pub streams_delivered: u64,

    /// 재시도 소진으로 포기한 송신 스트림 수
    pub streams_abandoned: u64,

    /// 조립 완료하여 상위로 전달한 수신 스트림 수
    pub streams_received: u64,

    /// 진행 없이 정리된 수신 스트림 수
    pub streams_expired: u64,

    /// 송신 페이로드 바이트 합계
    pub bytes_sent: u64,

    /// 상위로 전달한 바이트 합계
    pub bytes_delivered: u64,
}

impl ProtocolStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// 전체 송신 대비 재전송 비율
    pub fn retransmit_ratio(&self) -> f64 {
        let total = self.chunks_sent + self.chunks_retransmitted;
        if total == 0 {
            return 0.0;
        }
        self.chunks_retransmitted as f64 / total as f64
    }

    /// 수신 청크 중 중복 비율
    pub fn duplicate_ratio(&self) -> f64 {
        let total = self.chunks_received + self.duplicate_chunks;
        if total == 0 {
            return 0.0;
        }
        self.duplicate_chunks as f64 / total as f64
    }
}
