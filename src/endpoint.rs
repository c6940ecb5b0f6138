//! 엔드포인트 (소켓 바인딩 + 구동 태스크)
//!
//! - UDP 소켓 바인딩 및 데이터그램 수신
//! - 디스패처 단일 소유 태스크 구동
//! - 송신 요청/결과 전달 채널

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, info, warn};

use crate::clock::SystemClock;
use crate::dispatcher::{Dispatcher, Event, SendOutcome, Transport};
use crate::stats::ProtocolStats;
use crate::{Config, Error, Result, StreamId};

/// 완료된 수신 페이로드 채널 수신기 타입
pub type DeliveryReceiver = mpsc::Receiver<(SocketAddr, Bytes)>;

/// 내부 명령
enum EndpointCmd {
    Datagram(SocketAddr, Bytes),
    Send {
        peer: SocketAddr,
        data: Bytes,
        reply: oneshot::Sender<Result<SendOutcome>>,
    },
    Stop,
}

/// UDP 소켓 위의 fire-and-forget 전송
///
/// 송신 버퍼가 가득 차면 그냥 버린다. 유실은 재전송 계층이 복구한다.
struct UdpTransport {
    socket: Arc<UdpSocket>,
}

impl Transport for UdpTransport {
    fn transmit(&self, peer: SocketAddr, data: &[u8]) {
        let _ = self.socket.try_send_to(data, peer);
    }
}

/// 엔드포인트 내부 상태 (단일 태스크에서만 접근)
struct EndpointInner {
    dispatcher: Dispatcher,
    pending: HashMap<(SocketAddr, StreamId), oneshot::Sender<Result<SendOutcome>>>,
    delivered_tx: mpsc::Sender<(SocketAddr, Bytes)>,
}

impl EndpointInner {
    fn handle_send(
        &mut self,
        peer: SocketAddr,
        data: Bytes,
        reply: oneshot::Sender<Result<SendOutcome>>,
    ) {
        match self.dispatcher.send(peer, data) {
            Ok(stream_id) => {
                self.pending.insert((peer, stream_id), reply);
            }
            Err(e) => {
                let _ = reply.send(Err(e));
            }
        }
    }

    async fn drain_events(&mut self) {
        while let Some(event) = self.dispatcher.poll_event() {
            match event {
                Event::Delivered { peer, data } => {
                    debug!("페이로드 전달: peer={}, {} bytes", peer, data.len());
                    let _ = self.delivered_tx.send((peer, data)).await;
                }
                Event::Outcome {
                    peer,
                    stream_id,
                    outcome,
                } => {
                    if let Some(reply) = self.pending.remove(&(peer, stream_id)) {
                        let _ = reply.send(Ok(outcome));
                    }
                }
            }
        }
    }
}

/// 엔드포인트 핸들 (외부에서 제어용)
pub struct Endpoint {
    cmd_tx: mpsc::Sender<EndpointCmd>,
    stats: Arc<RwLock<ProtocolStats>>,
    running: Arc<AtomicBool>,
    local_addr: SocketAddr,
}

impl Endpoint {
    /// 소켓 바인딩 및 구동 태스크 시작
    pub async fn bind(config: Config, bind_addr: SocketAddr) -> Result<(Self, DeliveryReceiver)> {
        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        let local_addr = socket.local_addr()?;

        let (cmd_tx, mut cmd_rx) = mpsc::channel::<EndpointCmd>(1000);
        let (delivered_tx, delivered_rx) = mpsc::channel::<(SocketAddr, Bytes)>(100);

        let stats = Arc::new(RwLock::new(ProtocolStats::new()));
        let running = Arc::new(AtomicBool::new(true));

        let transport = Arc::new(UdpTransport {
            socket: socket.clone(),
        });
        let dispatcher = Dispatcher::new(config, Arc::new(SystemClock), transport);

        info!("SRP endpoint started on {}", local_addr);

        // 수신 태스크
        let socket_recv = socket.clone();
        let cmd_tx_recv = cmd_tx.clone();
        let running_recv = running.clone();

        tokio::spawn(async move {
            let mut buf = vec![0u8; 65535];

            while running_recv.load(Ordering::SeqCst) {
                match tokio::time::timeout(
                    Duration::from_millis(10),
                    socket_recv.recv_from(&mut buf),
                )
                .await
                {
                    Ok(Ok((len, peer))) => {
                        let raw = Bytes::copy_from_slice(&buf[..len]);
                        let _ = cmd_tx_recv.send(EndpointCmd::Datagram(peer, raw)).await;
                    }
                    Ok(Err(e)) => {
                        warn!("수신 에러: {}", e);
                    }
                    Err(_) => {
                        // 타임아웃, 계속
                    }
                }
            }
        });

        // 메인 처리 태스크
        let stats_main = stats.clone();
        let running_main = running.clone();

        let mut inner = EndpointInner {
            dispatcher,
            pending: HashMap::new(),
            delivered_tx,
        };

        tokio::spawn(async move {
            loop {
                let deadline = inner
                    .dispatcher
                    .next_deadline()
                    .map(tokio::time::Instant::from_std)
                    .unwrap_or_else(|| {
                        tokio::time::Instant::now() + Duration::from_millis(100)
                    });

                tokio::select! {
                    cmd = cmd_rx.recv() => match cmd {
                        Some(EndpointCmd::Datagram(peer, raw)) => {
                            inner.dispatcher.on_datagram(peer, &raw);
                        }
                        Some(EndpointCmd::Send { peer, data, reply }) => {
                            inner.handle_send(peer, data, reply);
                        }
                        Some(EndpointCmd::Stop) | None => break,
                    },
                    _ = tokio::time::sleep_until(deadline) => {}
                }

                inner.dispatcher.poll();
                inner.drain_events().await;

                // 통계 스냅샷 갱신
                *stats_main.write().await = inner.dispatcher.stats().clone();

                if !running_main.load(Ordering::SeqCst) {
                    break;
                }
            }

            running_main.store(false, Ordering::SeqCst);
        });

        let endpoint = Self {
            cmd_tx,
            stats,
            running,
            local_addr,
        };

        Ok((endpoint, delivered_rx))
    }

    /// 페이로드 전송 후 최종 결과 대기
    ///
    /// 전달 확인 또는 재시도 예산 소진까지 블로킹한다.
    pub async fn send(&self, peer: SocketAddr, data: Bytes) -> Result<SendOutcome> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(EndpointCmd::Send {
                peer,
                data,
                reply: reply_tx,
            })
            .await
            .map_err(|_| Error::ChannelClosed)?;

        reply_rx.await.map_err(|_| Error::ChannelClosed)?
    }

    /// 정지
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.cmd_tx.send(EndpointCmd::Stop).await;
    }

    /// 통계 반환
    pub async fn stats(&self) -> ProtocolStats {
        self.stats.read().await.clone()
    }

    /// 바인딩된 주소
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// 실행 중 여부
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
