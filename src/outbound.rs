//! 송신 스트림 상태 기계
//!
//! - 페이로드를 고정 크기 청크로 분할, 슬라이딩 윈도우로 전송
//! - ACK의 누락 보고를 새 청크보다 먼저 재전송 (gap 우선)
//! - 타임아웃마다 재시도 예산 차감, ACK 수신 시 리셋

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, trace};

use crate::dispatcher::Transport;
use crate::range::RangeSet;
use crate::stats::ProtocolStats;
use crate::wire::Packet;
use crate::{ChunkIndex, Config, StreamId};

/// 스트림 상태 전이 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    /// 전송 진행 중
    Active,

    /// 모든 청크가 확인됨
    Complete,

    /// 재시도 예산 소진
    Abandoned,
}

/// 송신 스트림
pub struct OutboundStream {
    stream_id: StreamId,
    peer: SocketAddr,

    /// 전체 페이로드
    payload: Bytes,

    chunk_size: usize,
    window_size: usize,

    /// 총 청크 수
    total_chunks: u32,

    /// 한 번도 보낸 적 없는 다음 청크 인덱스
    head: u32,

    /// 재전송 커서
    ///
    /// 음수: 보고된 누락 리스트의 뒤에서부터의 오프셋.
    /// 음수가 아니면 다음으로 (재)전송할 청크 인덱스.
    their_ack_cursor: i64,

    /// 상대가 확인한 최고 인덱스 (-1: 아직 ACK 없음)
    high_ack: i64,

    /// 상대가 보고한 누락 인덱스 (오름차순)
    missing: Vec<ChunkIndex>,

    /// 모든 청크를 한 번 이상 전송함
    done: bool,

    /// 남은 재전송 시도 횟수
    retry_budget: u32,

    max_retry_budget: u32,
    retry_timeout: Duration,

    /// 재전송 타이머 기한
    deadline: Instant,
}

impl OutboundStream {
    pub fn new(
        stream_id: StreamId,
        peer: SocketAddr,
        payload: Bytes,
        config: &Config,
        now: Instant,
    ) -> Self {
        let total_chunks = config.total_chunks(payload.len()) as u32;

        Self {
            stream_id,
            peer,
            payload,
            chunk_size: config.max_chunk_size,
            window_size: config.window_size,
            total_chunks,
            head: 0,
            their_ack_cursor: 0,
            high_ack: -1,
            missing: Vec::new(),
            done: false,
            retry_budget: config.retry_budget,
            max_retry_budget: config.retry_budget,
            retry_timeout: config.retry_timeout(),
            deadline: now + config.retry_timeout(),
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// 첫 윈도우 전송 후 재전송 타이머를 건다
    pub fn start(&mut self, tx: &dyn Transport, now: Instant, stats: &mut ProtocolStats) {
        for _ in 0..self.window_size {
            if self.send(self.head, tx, stats) {
                self.head += 1;
            } else {
                break;
            }
        }
        self.their_ack_cursor = self.head as i64;
        self.arm(now);

        trace!(
            "스트림 {} 시작: {} bytes, {}/{} 청크 전송",
            self.stream_id,
            self.payload.len(),
            self.head,
            self.total_chunks
        );
    }

    /// ACK 반영
    ///
    /// 이미 아는 것보다 낮은 high mark는 구버전 ACK이므로 무시하고
    /// 타이머만 다시 건다. 유효한 ACK는 누락 리스트를 교체하고 예산을
    /// 리셋한 뒤 윈도우만큼 후속 전송을 시도한다.
    pub fn on_ack(
        &mut self,
        high_mark: ChunkIndex,
        missing: &RangeSet,
        tx: &dyn Transport,
        now: Instant,
        stats: &mut ProtocolStats,
    ) -> StreamStatus {
        stats.acks_received += 1;

        if (high_mark as i64) < self.high_ack {
            stats.stale_acks += 1;
            self.arm(now);
            return StreamStatus::Active;
        }

        self.high_ack = high_mark as i64;
        self.missing = missing.flatten();
        self.retry_budget = self.max_retry_budget;
        self.reset_cursor();

        if self.fully_acked() {
            debug!("스트림 {} 전송 완료 확인", self.stream_id);
            return StreamStatus::Complete;
        }

        for _ in 0..self.window_size {
            if !self.send_next(tx, stats) {
                break;
            }
        }
        self.arm(now);
        StreamStatus::Active
    }

    /// 재전송 타이머 만료
    pub fn on_timeout(
        &mut self,
        tx: &dyn Transport,
        now: Instant,
        stats: &mut ProtocolStats,
    ) -> StreamStatus {
        self.retry_budget = self.retry_budget.saturating_sub(1);
        if self.retry_budget == 0 {
            debug!(
                "스트림 {} 포기: 재시도 소진 (high_ack={})",
                self.stream_id, self.high_ack
            );
            return StreamStatus::Abandoned;
        }

        if self.done && self.fully_acked() {
            return StreamStatus::Complete;
        }

        // ACK 없이 타임아웃에 도달했으므로 미확인 영역부터 다시 전송한다
        self.reset_cursor();

        for _ in 0..self.window_size {
            if !self.send_next(tx, stats) {
                break;
            }
        }
        self.arm(now);
        StreamStatus::Active
    }

    /// 다음 한 청크 (재)전송
    ///
    /// 우선순위: 보고된 누락 청크 -> head 아래 미확인 청크 -> 새 청크.
    pub fn send_next(&mut self, tx: &dyn Transport, stats: &mut ProtocolStats) -> bool {
        if self.their_ack_cursor < 0 {
            let pos = (self.missing.len() as i64 + self.their_ack_cursor) as usize;
            let index = self.missing[pos] as u32;
            self.resend(index, tx, stats);
            self.their_ack_cursor += 1;
            if self.their_ack_cursor == 0 {
                // 누락분 소진: 미확인 영역으로 이동
                self.their_ack_cursor = self.high_ack + 1;
            }
            true
        } else if (self.their_ack_cursor as u32) < self.head {
            let index = self.their_ack_cursor as u32;
            self.resend(index, tx, stats);
            self.their_ack_cursor += 1;
            true
        } else if !self.done {
            if self.send(self.head, tx, stats) {
                self.head += 1;
                self.their_ack_cursor = self.head as i64;
                true
            } else {
                false
            }
        } else {
            false
        }
    }

    /// 커서를 누락 리스트 선두(없으면 high_ack 바로 위)로 되돌린다
    fn reset_cursor(&mut self) {
        self.their_ack_cursor = if self.missing.is_empty() {
            self.high_ack + 1
        } else {
            -(self.missing.len() as i64)
        };
    }

    fn fully_acked(&self) -> bool {
        self.missing.is_empty() && self.high_ack + 1 >= self.total_chunks as i64
    }

    fn arm(&mut self, now: Instant) {
        self.deadline = now + self.retry_timeout;
    }

    /// 인덱스의 청크를 DATA/FINAL 패킷으로 인코딩
    ///
    /// 인덱스가 페이로드 범위를 벗어나면 None.
    fn chunk_packet(&self, index: u32) -> Option<Vec<u8>> {
        let offset = index as usize * self.chunk_size;
        if offset >= self.payload.len() {
            return None;
        }
        let end = (offset + self.chunk_size).min(self.payload.len());

        let packet = Packet::Data {
            stream_id: self.stream_id,
            index: index as ChunkIndex,
            data: self.payload.slice(offset..end),
            is_final: offset + self.chunk_size >= self.payload.len(),
        };
        Some(packet.encode())
    }

    /// 신규 청크 전송. 페이로드가 소진되었으면 done 표시 후 false.
    fn send(&mut self, index: u32, tx: &dyn Transport, stats: &mut ProtocolStats) -> bool {
        match self.chunk_packet(index) {
            Some(bytes) => {
                tx.transmit(self.peer, &bytes);
                stats.chunks_sent += 1;
                stats.bytes_sent += bytes.len() as u64;
                true
            }
            None => {
                self.done = true;
                false
            }
        }
    }

    fn resend(&self, index: u32, tx: &dyn Transport, stats: &mut ProtocolStats) {
        if let Some(bytes) = self.chunk_packet(index) {
            tx.transmit(self.peer, &bytes);
            stats.chunks_retransmitted += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// 전송된 패킷을 기록하는 가짜 트랜스포트
    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<Vec<u8>>>,
    }

    impl RecordingTransport {
        fn take(&self) -> Vec<Packet> {
            self.sent
                .lock()
                .drain(..)
                .map(|raw| Packet::decode(&raw).unwrap())
                .collect()
        }
    }

    impl Transport for RecordingTransport {
        fn transmit(&self, _peer: SocketAddr, data: &[u8]) {
            self.sent.lock().push(data.to_vec());
        }
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:9000".parse().unwrap()
    }

    fn config(chunk: usize, window: usize) -> Config {
        Config {
            max_chunk_size: chunk,
            window_size: window,
            ..Config::default()
        }
    }

    fn data_indices(packets: &[Packet]) -> Vec<u16> {
        packets
            .iter()
            .map(|p| match p {
                Packet::Data { index, .. } => *index,
                other => panic!("DATA가 아님: {:?}", other),
            })
            .collect()
    }

    #[test]
    fn test_start_sends_window_and_marks_final() {
        // 10,000 bytes / 1000 chunk -> 10개, 마지막이 FINAL
        let tx = RecordingTransport::default();
        let mut stats = ProtocolStats::new();
        let cfg = config(1000, 16);
        let payload = Bytes::from(vec![0xAB; 10_000]);
        let mut stream = OutboundStream::new(1, peer(), payload, &cfg, Instant::now());

        stream.start(&tx, Instant::now(), &mut stats);

        let packets = tx.take();
        assert_eq!(packets.len(), 10);
        assert_eq!(data_indices(&packets), (0..10).collect::<Vec<u16>>());

        for (i, p) in packets.iter().enumerate() {
            match p {
                Packet::Data { data, is_final, .. } => {
                    assert_eq!(data.len(), 1000);
                    assert_eq!(*is_final, i == 9);
                }
                other => panic!("DATA가 아님: {:?}", other),
            }
        }
        assert_eq!(stats.chunks_sent, 10);
    }

    #[test]
    fn test_start_respects_window() {
        let tx = RecordingTransport::default();
        let mut stats = ProtocolStats::new();
        let cfg = config(100, 4);
        let payload = Bytes::from(vec![1u8; 1000]);
        let mut stream = OutboundStream::new(1, peer(), payload, &cfg, Instant::now());

        stream.start(&tx, Instant::now(), &mut stats);

        assert_eq!(data_indices(&tx.take()), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_gap_priority_retransmission() {
        let tx = RecordingTransport::default();
        let mut stats = ProtocolStats::new();
        let cfg = config(100, 4);
        let payload = Bytes::from(vec![1u8; 2000]); // 20 청크
        let now = Instant::now();
        let mut stream = OutboundStream::new(1, peer(), payload, &cfg, now);

        stream.start(&tx, now, &mut stats);
        tx.take(); // 0..4

        // 상대: 3까지 봤고 1, 2가 누락
        let missing = RangeSet::from_ranges(&[(1, 2)]);
        let status = stream.on_ack(3, &missing, &tx, now, &mut stats);
        assert_eq!(status, StreamStatus::Active);

        // 누락 1, 2가 새 청크보다 먼저 나가야 한다
        let indices = data_indices(&tx.take());
        assert_eq!(&indices[..2], &[1, 2]);
        assert!(indices[2..].iter().all(|&i| i >= 4));
        assert_eq!(stats.chunks_retransmitted, 2);
    }

    #[test]
    fn test_stale_ack_ignored() {
        let tx = RecordingTransport::default();
        let mut stats = ProtocolStats::new();
        let cfg = config(100, 8);
        let payload = Bytes::from(vec![1u8; 2000]);
        let now = Instant::now();
        let mut stream = OutboundStream::new(1, peer(), payload, &cfg, now);

        stream.start(&tx, now, &mut stats);
        tx.take();

        stream.on_ack(6, &RangeSet::new(), &tx, now, &mut stats);
        tx.take();

        // 더 낮은 high mark는 무시
        let status = stream.on_ack(3, &RangeSet::from_ranges(&[(1, 2)]), &tx, now, &mut stats);
        assert_eq!(status, StreamStatus::Active);
        assert!(tx.take().is_empty());
        assert_eq!(stats.stale_acks, 1);
    }

    #[test]
    fn test_complete_when_fully_acked() {
        let tx = RecordingTransport::default();
        let mut stats = ProtocolStats::new();
        let cfg = config(100, 16);
        let payload = Bytes::from(vec![1u8; 550]); // 6 청크 (마지막 50 bytes)
        let now = Instant::now();
        let mut stream = OutboundStream::new(1, peer(), payload, &cfg, now);

        stream.start(&tx, now, &mut stats);
        tx.take();

        let status = stream.on_ack(5, &RangeSet::new(), &tx, now, &mut stats);
        assert_eq!(status, StreamStatus::Complete);
    }

    #[test]
    fn test_timeout_retransmits_unacked() {
        let tx = RecordingTransport::default();
        let mut stats = ProtocolStats::new();
        let cfg = config(100, 4);
        let payload = Bytes::from(vec![1u8; 400]);
        let now = Instant::now();
        let mut stream = OutboundStream::new(1, peer(), payload, &cfg, now);

        stream.start(&tx, now, &mut stats);
        tx.take();

        // ACK가 전혀 없는 상태의 타임아웃: 처음부터 다시 보낸다
        let status = stream.on_timeout(&tx, now, &mut stats);
        assert_eq!(status, StreamStatus::Active);
        assert_eq!(data_indices(&tx.take()), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_retry_budget_exhaustion_abandons() {
        let tx = RecordingTransport::default();
        let mut stats = ProtocolStats::new();
        let mut cfg = config(100, 2);
        cfg.retry_budget = 3;
        let payload = Bytes::from(vec![1u8; 400]);
        let now = Instant::now();
        let mut stream = OutboundStream::new(1, peer(), payload, &cfg, now);

        stream.start(&tx, now, &mut stats);

        assert_eq!(stream.on_timeout(&tx, now, &mut stats), StreamStatus::Active);
        assert_eq!(stream.on_timeout(&tx, now, &mut stats), StreamStatus::Active);
        assert_eq!(
            stream.on_timeout(&tx, now, &mut stats),
            StreamStatus::Abandoned
        );
    }

    #[test]
    fn test_ack_resets_retry_budget() {
        let tx = RecordingTransport::default();
        let mut stats = ProtocolStats::new();
        let mut cfg = config(100, 2);
        cfg.retry_budget = 2;
        let payload = Bytes::from(vec![1u8; 1000]);
        let now = Instant::now();
        let mut stream = OutboundStream::new(1, peer(), payload, &cfg, now);

        stream.start(&tx, now, &mut stats);

        assert_eq!(stream.on_timeout(&tx, now, &mut stats), StreamStatus::Active);
        // ACK가 예산을 리셋하므로 다시 한 번의 타임아웃은 버틴다
        stream.on_ack(0, &RangeSet::new(), &tx, now, &mut stats);
        assert_eq!(stream.on_timeout(&tx, now, &mut stats), StreamStatus::Active);
    }

    #[test]
    fn test_short_last_chunk() {
        let tx = RecordingTransport::default();
        let mut stats = ProtocolStats::new();
        let cfg = config(100, 8);
        let payload = Bytes::from(vec![7u8; 250]);
        let now = Instant::now();
        let mut stream = OutboundStream::new(1, peer(), payload, &cfg, now);

        stream.start(&tx, now, &mut stats);

        let packets = tx.take();
        assert_eq!(packets.len(), 3);
        match &packets[2] {
            Packet::Data { data, is_final, .. } => {
                assert_eq!(data.len(), 50);
                assert!(is_final);
            }
            other => panic!("DATA가 아님: {:?}", other),
        }
    }
}
