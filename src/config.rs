//! 프로토콜 설정

use std::time::Duration;

use crate::DEFAULT_CHUNK_SIZE;

/// SRP 프로토콜 설정
///
/// 모든 필드는 생성 시점에 고정되며 런타임 중 변경되지 않는다.
#[derive(Debug, Clone)]
pub struct Config {
    /// 청크당 최대 페이로드 크기 (바이트)
    pub max_chunk_size: usize,

    /// 송신 윈도우 크기 (스트림당 in-flight 청크 수)
    pub window_size: usize,

    /// 동시 추적 스트림 수 하드 캡 (양방향 합계)
    pub max_connections: usize,

    /// 즉시 ACK를 강제하는 신규 수신 청크 수
    pub ack_batch_threshold: usize,

    /// 재전송 타이머 주기 (밀리초)
    pub retry_timeout_ms: u64,

    /// ACK 발신 지연 (밀리초)
    pub ack_delay_ms: u64,

    /// 재전송 시도 한도 (ACK 수신 시 리셋)
    pub retry_budget: u32,

    /// 진행 없는 수신 스트림 정리 타임아웃 (밀리초)
    pub inbound_idle_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_chunk_size: DEFAULT_CHUNK_SIZE,
            window_size: 32,
            max_connections: 64,
            ack_batch_threshold: 16,
            retry_timeout_ms: 200,
            ack_delay_ms: 50,
            retry_budget: 8,
            inbound_idle_timeout_ms: 5000,
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 페이로드를 나눴을 때의 총 청크 수
    pub fn total_chunks(&self, payload_len: usize) -> usize {
        (payload_len + self.max_chunk_size - 1) / self.max_chunk_size
    }

    /// 재전송 타이머 주기
    pub fn retry_timeout(&self) -> Duration {
        Duration::from_millis(self.retry_timeout_ms)
    }

    /// ACK 발신 지연
    pub fn ack_delay(&self) -> Duration {
        Duration::from_millis(self.ack_delay_ms)
    }

    /// 수신 스트림 정리 타임아웃
    pub fn inbound_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.inbound_idle_timeout_ms)
    }

    /// 로컬/저지연 네트워크용 설정
    pub fn local_network() -> Self {
        Self {
            max_chunk_size: 1400,
            window_size: 64,
            max_connections: 128,
            ack_batch_threshold: 32,
            retry_timeout_ms: 50,
            ack_delay_ms: 10,
            retry_budget: 4,
            inbound_idle_timeout_ms: 1000,
        }
    }

    /// 손실이 잦은 네트워크용 설정
    pub fn lossy_network() -> Self {
        Self {
            max_chunk_size: 1000,
            window_size: 16,
            max_connections: 32,
            ack_batch_threshold: 8,
            retry_timeout_ms: 400,
            ack_delay_ms: 100,
            retry_budget: 16,
            inbound_idle_timeout_ms: 15000,
        }
    }
}
