//! 스트림 디스패처
//!
//! 하나의 데이터그램 소켓 위에서 여러 논리 스트림을 다중화한다.
//! 수신 데이터그램을 `(peer, stream_id)` 키로 해당 스트림에 라우팅하고,
//! 송신 스트림 ID를 할당하며, 완료된 수신 스트림의 전달 업콜을 낸다.
//!
//! 모든 스트림 상태는 디스패처를 소유한 단일 태스크 안에서만 변경된다.
//! 락 없는 단일 스레드 실행 모델이므로 이 타입 자체는 공유하지 않는다.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::clock::Clock;
use crate::inbound::InboundStream;
use crate::outbound::{OutboundStream, StreamStatus};
use crate::stats::ProtocolStats;
use crate::wire::Packet;
use crate::{ChunkIndex, Config, Error, Result, StreamId};

/// 환경이 제공하는 전송 프리미티브
///
/// best-effort, 논블로킹. 유실/재정렬될 수 있다.
pub trait Transport: Send + Sync {
    fn transmit(&self, peer: SocketAddr, data: &[u8]);
}

/// 송신 스트림의 최종 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// 모든 청크가 상대에게 확인됨
    Delivered,

    /// 재시도 예산 소진으로 포기함
    Failed,
}

/// 디스패처가 상위로 올리는 이벤트
#[derive(Debug)]
pub enum Event {
    /// 수신 스트림 조립 완료 (스트림당 정확히 한 번)
    Delivered { peer: SocketAddr, data: Bytes },

    /// 송신 스트림 종결
    Outcome {
        peer: SocketAddr,
        stream_id: StreamId,
        outcome: SendOutcome,
    },
}

type StreamKey = (SocketAddr, StreamId);

/// 스트림 디스패처
pub struct Dispatcher {
    config: Config,
    clock: Arc<dyn Clock>,
    transport: Arc<dyn Transport>,

    /// 송신 스트림 테이블
    outbound: HashMap<StreamKey, OutboundStream>,

    /// 수신 스트림 테이블 (송신과 독립된 ID 공간)
    inbound: HashMap<StreamKey, InboundStream>,

    /// 다음 송신 스트림 ID
    next_stream_id: StreamId,

    events: VecDeque<Event>,
    stats: ProtocolStats,
}

impl Dispatcher {
    pub fn new(config: Config, clock: Arc<dyn Clock>, transport: Arc<dyn Transport>) -> Self {
        Self {
            config,
            clock,
            transport,
            outbound: HashMap::new(),
            inbound: HashMap::new(),
            // 이전 프로세스의 스트림과 ID가 겹치지 않도록 무작위 시작점 사용
            next_stream_id: rand::random(),
            events: VecDeque::new(),
            stats: ProtocolStats::new(),
        }
    }

    /// 페이로드 전송 시작
    ///
    /// 스트림 ID를 할당하고 송신 스트림을 만들어 첫 윈도우를 내보낸다.
    /// `max_connections`는 하드 캡이다.
    pub fn send(&mut self, peer: SocketAddr, data: Bytes) -> Result<StreamId> {
        if data.is_empty() {
            return Err(Error::EmptyPayload);
        }

        let chunks = self.config.total_chunks(data.len());
        let max_chunks = ChunkIndex::MAX as usize + 1;
        if chunks > max_chunks {
            return Err(Error::PayloadTooLarge {
                chunks,
                max: max_chunks,
            });
        }

        if self.active_streams() >= self.config.max_connections {
            return Err(Error::StreamLimit {
                max: self.config.max_connections,
            });
        }

        let mut id = self.next_stream_id;
        while self.outbound.contains_key(&(peer, id)) {
            id = id.wrapping_add(1);
        }
        self.next_stream_id = id.wrapping_add(1);

        let now = self.clock.now();
        let mut stream = OutboundStream::new(id, peer, data, &self.config, now);
        stream.start(self.transport.as_ref(), now, &mut self.stats);
        self.outbound.insert((peer, id), stream);

        debug!("송신 스트림 {} 시작: peer={}", id, peer);
        Ok(id)
    }

    /// 수신 데이터그램 라우팅
    pub fn on_datagram(&mut self, peer: SocketAddr, raw: &[u8]) {
        let packet = match Packet::decode(raw) {
            Ok(packet) => packet,
            Err(e) => {
                self.stats.malformed_packets += 1;
                debug!("디코드 실패 ({} bytes, peer={}): {}", raw.len(), peer, e);
                return;
            }
        };

        match packet {
            Packet::Ack {
                stream_id,
                high_mark,
                missing,
            } => self.handle_ack(peer, stream_id, high_mark, &missing),
            Packet::Data {
                stream_id,
                index,
                data,
                is_final,
            } => self.handle_data(peer, stream_id, index, data, is_final),
        }
    }

    fn handle_ack(
        &mut self,
        peer: SocketAddr,
        stream_id: StreamId,
        high_mark: ChunkIndex,
        missing: &crate::range::RangeSet,
    ) {
        let key = (peer, stream_id);
        let now = self.clock.now();

        // 모르는 스트림: 이미 완료되어 정리됐을 수도 있으므로 조용히 버린다
        let Some(stream) = self.outbound.get_mut(&key) else {
            self.stats.unknown_acks += 1;
            trace!("미지 스트림 {} ACK 무시: peer={}", stream_id, peer);
            return;
        };

        let status = stream.on_ack(high_mark, missing, self.transport.as_ref(), now, &mut self.stats);
        match status {
            StreamStatus::Active => {}
            StreamStatus::Complete => self.finish_outbound(key, SendOutcome::Delivered),
            StreamStatus::Abandoned => self.finish_outbound(key, SendOutcome::Failed),
        }
    }

    fn handle_data(
        &mut self,
        peer: SocketAddr,
        stream_id: StreamId,
        index: ChunkIndex,
        data: Bytes,
        is_final: bool,
    ) {
        let key = (peer, stream_id);
        let now = self.clock.now();

        if !self.inbound.contains_key(&key) && self.active_streams() >= self.config.max_connections
        {
            warn!(
                "수신 스트림 한도 초과, 드롭: peer={}, stream={}",
                peer, stream_id
            );
            return;
        }

        let config = &self.config;
        let stream = self
            .inbound
            .entry(key)
            .or_insert_with(|| InboundStream::new(stream_id, peer, config, now));

        let newly = stream.on_data(index, data, is_final, now);
        if newly {
            self.stats.chunks_received += 1;
        } else {
            self.stats.duplicate_chunks += 1;
        }

        if stream.is_complete() {
            // 이미 전달까지 끝난 스트림의 잔류 패킷:
            // 송신측이 완료를 알 수 있도록 전체 확인 ACK만 다시 보낸다
            let ack = stream.gen_ack().encode();
            self.transport.transmit(peer, &ack);
            self.stats.acks_sent += 1;
            stream.ack_sent(now);
            return;
        }

        if newly && stream.newly_received() >= self.config.ack_batch_threshold {
            let ack = stream.gen_ack().encode();
            self.transport.transmit(peer, &ack);
            self.stats.acks_sent += 1;
            stream.ack_sent(now);
        }

        if let Some(assembled) = stream.try_complete() {
            // 완료 즉시 전체 확인 ACK를 보내 송신측 윈도우를 닫는다
            let ack = stream.gen_ack().encode();
            self.transport.transmit(peer, &ack);
            self.stats.acks_sent += 1;
            stream.ack_sent(now);

            self.stats.streams_received += 1;
            self.stats.bytes_delivered += assembled.len() as u64;
            self.events.push_back(Event::Delivered {
                peer,
                data: assembled,
            });
        }
    }

    /// 타이머 구동
    ///
    /// 기한이 지난 송신 스트림의 재전송 타임아웃과 수신 스트림의
    /// ACK 발신을 처리하고, 방치된 수신 스트림을 정리한다.
    pub fn poll(&mut self) {
        let now = self.clock.now();

        let mut finished: Vec<(StreamKey, SendOutcome)> = Vec::new();
        for (&key, stream) in self.outbound.iter_mut() {
            if stream.deadline() <= now {
                match stream.on_timeout(self.transport.as_ref(), now, &mut self.stats) {
                    StreamStatus::Active => {}
                    StreamStatus::Complete => finished.push((key, SendOutcome::Delivered)),
                    StreamStatus::Abandoned => finished.push((key, SendOutcome::Failed)),
                }
            }
        }
        for (key, outcome) in finished {
            self.finish_outbound(key, outcome);
        }

        let idle = self.config.inbound_idle_timeout();
        let mut expired: Vec<StreamKey> = Vec::new();
        for (&key, stream) in self.inbound.iter_mut() {
            if stream.expired(now, idle) {
                expired.push(key);
                continue;
            }
            if stream.ack_due(now) {
                let ack = stream.gen_ack().encode();
                self.transport.transmit(key.0, &ack);
                self.stats.acks_sent += 1;
                stream.ack_sent(now);
            }
        }
        for key in expired {
            if let Some(stream) = self.inbound.remove(&key) {
                if !stream.is_complete() {
                    self.stats.streams_expired += 1;
                    warn!(
                        "수신 스트림 {} 유휴 정리: peer={}, 미완료",
                        key.1, key.0
                    );
                }
            }
        }
    }

    /// 다음으로 깨어나야 할 시각
    pub fn next_deadline(&self) -> Option<Instant> {
        let idle = self.config.inbound_idle_timeout();

        let outbound = self.outbound.values().map(|s| s.deadline());
        let inbound_ack = self.inbound.values().filter_map(|s| s.ack_deadline());
        let inbound_idle = self.inbound.values().map(|s| s.idle_deadline(idle));

        outbound.chain(inbound_ack).chain(inbound_idle).min()
    }

    /// 쌓인 이벤트 하나 꺼내기
    pub fn poll_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    pub fn stats(&self) -> &ProtocolStats {
        &self.stats
    }

    pub fn active_streams(&self) -> usize {
        self.outbound.len() + self.inbound.len()
    }

    pub fn outbound_count(&self) -> usize {
        self.outbound.len()
    }

    pub fn inbound_count(&self) -> usize {
        self.inbound.len()
    }

    fn finish_outbound(&mut self, key: StreamKey, outcome: SendOutcome) {
        if self.outbound.remove(&key).is_some() {
            match outcome {
                SendOutcome::Delivered => self.stats.streams_delivered += 1,
                SendOutcome::Failed => self.stats.streams_abandoned += 1,
            }
            self.events.push_back(Event::Outcome {
                peer: key.0,
                stream_id: key.1,
                outcome,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use parking_lot::Mutex;
    use std::time::Duration;

    /// 전송 데이터그램을 큐에 쌓는 가짜 트랜스포트
    #[derive(Default)]
    struct QueueTransport {
        queue: Mutex<VecDeque<Vec<u8>>>,
    }

    impl QueueTransport {
        fn drain(&self) -> Vec<Vec<u8>> {
            self.queue.lock().drain(..).collect()
        }
    }

    impl Transport for QueueTransport {
        fn transmit(&self, _peer: SocketAddr, data: &[u8]) {
            self.queue.lock().push_back(data.to_vec());
        }
    }

    fn addr(port: u16) -> SocketAddr {
        format!("10.0.0.1:{}", port).parse().unwrap()
    }

    fn test_config() -> Config {
        Config {
            max_chunk_size: 100,
            window_size: 4,
            max_connections: 8,
            ack_batch_threshold: 4,
            retry_timeout_ms: 200,
            ack_delay_ms: 50,
            retry_budget: 8,
            inbound_idle_timeout_ms: 5000,
        }
    }

    fn make(
        config: Config,
        clock: Arc<ManualClock>,
    ) -> (Dispatcher, Arc<QueueTransport>) {
        let transport = Arc::new(QueueTransport::default());
        let dispatcher = Dispatcher::new(config, clock, transport.clone());
        (dispatcher, transport)
    }

    /// 두 디스패처 사이에서 패킷을 주고받는 펌프.
    /// `drop_every`가 0이 아니면 그 주기로 데이터그램을 유실시킨다.
    fn pump(
        a: &mut Dispatcher,
        a_tx: &QueueTransport,
        a_addr: SocketAddr,
        b: &mut Dispatcher,
        b_tx: &QueueTransport,
        b_addr: SocketAddr,
        drop_every: usize,
        counter: &mut usize,
    ) {
        for raw in a_tx.drain() {
            *counter += 1;
            if drop_every != 0 && *counter % drop_every == 0 {
                continue;
            }
            b.on_datagram(a_addr, &raw);
        }
        for raw in b_tx.drain() {
            *counter += 1;
            if drop_every != 0 && *counter % drop_every == 0 {
                continue;
            }
            a.on_datagram(b_addr, &raw);
        }
    }

    #[test]
    fn test_delivery_clean_channel() {
        let clock = Arc::new(ManualClock::new());
        let (mut a, a_tx) = make(test_config(), clock.clone());
        let (mut b, b_tx) = make(test_config(), clock.clone());
        let (a_addr, b_addr) = (addr(1), addr(2));

        let payload = Bytes::from((0..=255u8).cycle().take(1000).collect::<Vec<u8>>());
        let stream_id = a.send(b_addr, payload.clone()).unwrap();

        let mut counter = 0;
        let mut delivered = None;
        let mut outcome = None;

        for _ in 0..100 {
            pump(&mut a, &a_tx, a_addr, &mut b, &b_tx, b_addr, 0, &mut counter);
            clock.advance(Duration::from_millis(50));
            a.poll();
            b.poll();

            while let Some(event) = b.poll_event() {
                if let Event::Delivered { data, .. } = event {
                    assert!(delivered.is_none(), "중복 전달");
                    delivered = Some(data);
                }
            }
            while let Some(event) = a.poll_event() {
                if let Event::Outcome {
                    stream_id: id,
                    outcome: oc,
                    ..
                } = event
                {
                    assert_eq!(id, stream_id);
                    outcome = Some(oc);
                }
            }
            if delivered.is_some() && outcome.is_some() {
                break;
            }
        }

        assert_eq!(delivered.unwrap(), payload);
        assert_eq!(outcome.unwrap(), SendOutcome::Delivered);
        assert_eq!(a.outbound_count(), 0);
    }

    #[test]
    fn test_eventual_delivery_under_loss() {
        let clock = Arc::new(ManualClock::new());
        let (mut a, a_tx) = make(test_config(), clock.clone());
        let (mut b, b_tx) = make(test_config(), clock.clone());
        let (a_addr, b_addr) = (addr(1), addr(2));

        let payload = Bytes::from((0..97u8).cycle().take(10_000).collect::<Vec<u8>>());
        a.send(b_addr, payload.clone()).unwrap();

        // 매 3번째 데이터그램 유실 + 매 5번째 중복 도착
        let mut counter = 0usize;
        let mut delivered = Vec::new();
        let mut outcome = None;

        for _ in 0..1000 {
            for raw in a_tx.drain() {
                counter += 1;
                if counter % 3 == 0 {
                    continue;
                }
                b.on_datagram(a_addr, &raw);
                if counter % 5 == 0 {
                    b.on_datagram(a_addr, &raw);
                }
            }
            for raw in b_tx.drain() {
                counter += 1;
                if counter % 3 == 0 {
                    continue;
                }
                a.on_datagram(b_addr, &raw);
            }

            clock.advance(Duration::from_millis(60));
            a.poll();
            b.poll();

            while let Some(event) = b.poll_event() {
                if let Event::Delivered { data, .. } = event {
                    delivered.push(data);
                }
            }
            while let Some(event) = a.poll_event() {
                if let Event::Outcome { outcome: oc, .. } = event {
                    outcome = Some(oc);
                }
            }
            if !delivered.is_empty() && outcome.is_some() {
                break;
            }
        }

        assert_eq!(delivered.len(), 1, "정확히 한 번 전달");
        assert_eq!(delivered[0], payload);
        assert_eq!(outcome.unwrap(), SendOutcome::Delivered);
        assert!(b.stats().duplicate_chunks > 0);
    }

    #[test]
    fn test_total_loss_reports_failure() {
        let clock = Arc::new(ManualClock::new());
        let (mut a, _a_tx) = make(test_config(), clock.clone());
        let b_addr = addr(2);

        let stream_id = a.send(b_addr, Bytes::from(vec![1u8; 500])).unwrap();

        // ACK가 전혀 오지 않으면 예산 소진 후 실패를 알린다
        let mut outcome = None;
        for _ in 0..20 {
            clock.advance(Duration::from_millis(250));
            a.poll();
            while let Some(event) = a.poll_event() {
                if let Event::Outcome {
                    stream_id: id,
                    outcome: oc,
                    ..
                } = event
                {
                    assert_eq!(id, stream_id);
                    outcome = Some(oc);
                }
            }
            if outcome.is_some() {
                break;
            }
        }

        assert_eq!(outcome.unwrap(), SendOutcome::Failed);
        assert_eq!(a.outbound_count(), 0);
        assert_eq!(a.stats().streams_abandoned, 1);
    }

    #[test]
    fn test_send_rejects_empty_and_oversized() {
        let clock = Arc::new(ManualClock::new());
        let (mut a, _tx) = make(test_config(), clock);

        assert!(matches!(
            a.send(addr(2), Bytes::new()),
            Err(Error::EmptyPayload)
        ));

        // 청크 크기 100으로 u16 인덱스 공간을 넘는 페이로드
        let huge = Bytes::from(vec![0u8; 100 * 65_537]);
        assert!(matches!(
            a.send(addr(2), huge),
            Err(Error::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_stream_limit_hard_cap() {
        let clock = Arc::new(ManualClock::new());
        let mut config = test_config();
        config.max_connections = 2;
        let (mut a, _tx) = make(config, clock);

        a.send(addr(2), Bytes::from(vec![1u8; 100])).unwrap();
        a.send(addr(2), Bytes::from(vec![2u8; 100])).unwrap();
        assert!(matches!(
            a.send(addr(2), Bytes::from(vec![3u8; 100])),
            Err(Error::StreamLimit { max: 2 })
        ));
    }

    #[test]
    fn test_unknown_ack_dropped_silently() {
        let clock = Arc::new(ManualClock::new());
        let (mut a, _tx) = make(test_config(), clock);

        let ack = Packet::Ack {
            stream_id: 12345,
            high_mark: 3,
            missing: crate::range::RangeSet::new(),
        };
        a.on_datagram(addr(2), &ack.encode());

        assert_eq!(a.stats().unknown_acks, 1);
        assert_eq!(a.active_streams(), 0);
    }

    #[test]
    fn test_malformed_datagram_counted() {
        let clock = Arc::new(ManualClock::new());
        let (mut a, _tx) = make(test_config(), clock);

        a.on_datagram(addr(2), &[1, 2, 3]);
        a.on_datagram(addr(2), &[0, 0, 0, 1, 99, 0, 0]);

        assert_eq!(a.stats().malformed_packets, 2);
    }

    #[test]
    fn test_batch_threshold_forces_immediate_ack() {
        let clock = Arc::new(ManualClock::new());
        let mut config = test_config();
        config.ack_batch_threshold = 2;
        let (mut b, b_tx) = make(config, clock);
        let a_addr = addr(1);

        let data = Packet::Data {
            stream_id: 9,
            index: 0,
            data: Bytes::from(vec![0u8; 100]),
            is_final: false,
        };
        b.on_datagram(a_addr, &data.encode());
        assert!(b_tx.drain().is_empty(), "임계값 전에는 ACK 없음");

        let data = Packet::Data {
            stream_id: 9,
            index: 1,
            data: Bytes::from(vec![1u8; 100]),
            is_final: false,
        };
        b.on_datagram(a_addr, &data.encode());

        let sent = b_tx.drain();
        assert_eq!(sent.len(), 1);
        match Packet::decode(&sent[0]).unwrap() {
            Packet::Ack {
                stream_id,
                high_mark,
                missing,
            } => {
                assert_eq!(stream_id, 9);
                assert_eq!(high_mark, 1);
                assert!(missing.is_empty());
            }
            other => panic!("ACK가 아님: {:?}", other),
        }
    }

    #[test]
    fn test_completion_sends_full_ack_and_lingers() {
        let clock = Arc::new(ManualClock::new());
        let (mut b, b_tx) = make(test_config(), clock.clone());
        let a_addr = addr(1);

        // 10개 청크 (9번이 FINAL) 순서대로 도착
        for i in 0..10u16 {
            let data = Packet::Data {
                stream_id: 3,
                index: i,
                data: Bytes::from(vec![i as u8; 100]),
                is_final: i == 9,
            };
            b.on_datagram(a_addr, &data.encode());
        }

        // 완료 즉시 high_mark=9, 누락 없음 ACK가 나간다
        let acks: Vec<Packet> = b_tx
            .drain()
            .iter()
            .map(|raw| Packet::decode(raw).unwrap())
            .collect();
        match acks.last().unwrap() {
            Packet::Ack {
                high_mark, missing, ..
            } => {
                assert_eq!(*high_mark, 9);
                assert!(missing.is_empty());
            }
            other => panic!("ACK가 아님: {:?}", other),
        }

        assert!(matches!(
            b.poll_event(),
            Some(Event::Delivered { data, .. }) if data.len() == 1000
        ));

        // 완료 스트림은 잔류 패킷 처리를 위해 당분간 남는다
        assert_eq!(b.inbound_count(), 1);

        // 잔류 DATA에는 전체 확인 ACK만 재발신, 재전달은 없다
        let data = Packet::Data {
            stream_id: 3,
            index: 9,
            data: Bytes::from(vec![9u8; 100]),
            is_final: true,
        };
        b.on_datagram(a_addr, &data.encode());
        assert_eq!(b_tx.drain().len(), 1);
        assert!(b.poll_event().is_none());

        // linger가 지나면 정리된다
        clock.advance(Duration::from_secs(30));
        b.poll();
        assert_eq!(b.inbound_count(), 0);
        assert_eq!(b.stats().streams_expired, 0);
    }

    #[test]
    fn test_stalled_inbound_expires() {
        let clock = Arc::new(ManualClock::new());
        let (mut b, _b_tx) = make(test_config(), clock.clone());

        let data = Packet::Data {
            stream_id: 5,
            index: 0,
            data: Bytes::from(vec![0u8; 100]),
            is_final: false,
        };
        b.on_datagram(addr(1), &data.encode());
        assert_eq!(b.inbound_count(), 1);

        clock.advance(Duration::from_secs(10));
        b.poll();

        assert_eq!(b.inbound_count(), 0);
        assert_eq!(b.stats().streams_expired, 1);
    }

    #[test]
    fn test_next_deadline_tracks_streams() {
        let clock = Arc::new(ManualClock::new());
        let (mut a, _tx) = make(test_config(), clock.clone());

        assert!(a.next_deadline().is_none());

        a.send(addr(2), Bytes::from(vec![1u8; 100])).unwrap();
        let deadline = a.next_deadline().unwrap();
        assert_eq!(deadline - clock.now(), Duration::from_millis(200));
    }
}
