//! 수신 스트림 상태 기계
//!
//! - 청크를 순서와 무관하게 수집, 인덱스 기준으로 재조립
//! - high mark와 그 아래 누락 구간을 추적하여 selective ACK 생성
//! - FINAL 관측 + 누락 없음이면 상위로 정확히 한 번 전달

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace};

use crate::range::RangeSet;
use crate::wire::Packet;
use crate::{ChunkIndex, Config, StreamId};

/// 수신 스트림
pub struct InboundStream {
    stream_id: StreamId,
    peer: SocketAddr,

    /// 관측된 최고 청크 인덱스 (-1: 아직 없음)
    high_mark: i32,

    /// high mark 아래의 누락 구간
    missing: RangeSet,

    /// 수신 청크 저장소
    chunks: HashMap<ChunkIndex, Bytes>,

    /// 관측된 최대 청크 크기 (재조립 오프셋 계산용)
    chunk_size: usize,

    /// FINAL 청크를 본 적 있음
    final_seen: bool,

    /// 전달 완료 (중복 전달 방지 가드)
    complete: bool,

    /// 중복 수신 횟수
    duplicates: u64,

    /// 마지막 ACK 이후 새로 수신한 청크 수
    newly_received: usize,

    /// ACK 발신 기한 (완료 후에는 없음)
    ack_deadline: Option<Instant>,

    ack_delay: Duration,

    /// 마지막 진행 시각 (유휴 정리용)
    last_progress: Instant,
}

impl InboundStream {
    pub fn new(stream_id: StreamId, peer: SocketAddr, config: &Config, now: Instant) -> Self {
        Self {
            stream_id,
            peer,
            high_mark: -1,
            missing: RangeSet::new(),
            chunks: HashMap::new(),
            chunk_size: 0,
            final_seen: false,
            complete: false,
            duplicates: 0,
            newly_received: 0,
            ack_deadline: None,
            ack_delay: config.ack_delay(),
            last_progress: now,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn duplicates(&self) -> u64 {
        self.duplicates
    }

    /// 마지막 ACK 이후 새로 받은 청크 수
    pub fn newly_received(&self) -> usize {
        self.newly_received
    }

    pub fn ack_deadline(&self) -> Option<Instant> {
        self.ack_deadline
    }

    pub fn ack_due(&self, now: Instant) -> bool {
        matches!(self.ack_deadline, Some(deadline) if deadline <= now)
    }

    /// 진행 없이 방치된 스트림인지 (완료 스트림의 linger 만료 포함)
    pub fn expired(&self, now: Instant, idle_timeout: Duration) -> bool {
        now.duration_since(self.last_progress) > idle_timeout
    }

    /// 유휴 정리가 예정된 시각
    pub fn idle_deadline(&self, idle_timeout: Duration) -> Instant {
        self.last_progress + idle_timeout
    }

    /// 데이터 청크 수신
    ///
    /// 새로 저장했으면 true, 중복이면 false.
    /// high mark를 넘는 인덱스는 사이 구간을 누락으로 기록하고,
    /// 그 이하는 누락 구간에서 지운다 (없으면 중복).
    pub fn on_data(
        &mut self,
        index: ChunkIndex,
        data: Bytes,
        is_final: bool,
        now: Instant,
    ) -> bool {
        if self.complete {
            // 전달은 끝났고 송신측 확인만 남은 상태의 잔류 패킷
            self.duplicates += 1;
            self.last_progress = now;
            return false;
        }

        let idx = index as i32;
        if idx > self.high_mark {
            if idx - self.high_mark > 1 {
                self.missing.insert((self.high_mark + 1) as ChunkIndex, index - 1);
            }
            self.high_mark = idx;
        } else if !self.missing.fill(index) {
            self.duplicates += 1;
            return false;
        }

        self.chunk_size = self.chunk_size.max(data.len());
        self.chunks.insert(index, data);
        if is_final {
            self.final_seen = true;
        }

        self.newly_received += 1;
        self.last_progress = now;
        if self.ack_deadline.is_none() {
            self.ack_deadline = Some(now + self.ack_delay);
        }

        trace!(
            "스트림 {} 청크 {} 수신: high_mark={}, 누락 {}구간",
            self.stream_id,
            index,
            self.high_mark,
            self.missing.len()
        );
        true
    }

    /// 현재 상태의 selective ACK 패킷 생성
    pub fn gen_ack(&self) -> Packet {
        Packet::Ack {
            stream_id: self.stream_id,
            high_mark: self.high_mark.max(0) as ChunkIndex,
            missing: self.missing.clone(),
        }
    }

    /// ACK 발신 직후 호출: 배치 카운터 리셋, 타이머 재설정
    pub fn ack_sent(&mut self, now: Instant) {
        self.newly_received = 0;
        self.ack_deadline = if self.complete {
            None
        } else {
            Some(now + self.ack_delay)
        };
    }

    /// 완료 조건 검사 및 재조립
    ///
    /// FINAL을 봤고 누락이 없으면 청크를 `index * chunk_size` 오프셋에
    /// 배치하여 원본 버퍼를 복원한다. 전달은 정확히 한 번만 일어난다.
    pub fn try_complete(&mut self) -> Option<Bytes> {
        if self.complete || !self.final_seen || !self.missing.is_empty() || self.high_mark < 0 {
            return None;
        }

        let count = self.high_mark as usize + 1;
        let last_len = self
            .chunks
            .get(&(self.high_mark as ChunkIndex))
            .map(|c| c.len())
            .unwrap_or(0);
        let total = (count - 1) * self.chunk_size + last_len;

        let mut buf = BytesMut::with_capacity(total);
        buf.resize(total, 0);

        for i in 0..count {
            if let Some(chunk) = self.chunks.get(&(i as ChunkIndex)) {
                let offset = i * self.chunk_size;
                let end = (offset + chunk.len()).min(total);
                buf[offset..end].copy_from_slice(&chunk[..end - offset]);
            }
        }

        self.complete = true;
        self.ack_deadline = None;
        self.chunks = HashMap::new();

        debug!(
            "스트림 {} 조립 완료: {} bytes, {} 청크, 중복 {}",
            self.stream_id, total, count, self.duplicates
        );
        Some(buf.freeze())
    }
}
