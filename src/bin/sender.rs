//! SRP 송신자 - Selective Repeat Protocol
//!
//! 선택적 재전송 기반 신뢰 전송 프로토콜 송신 데모
//! - 윈도우 전송 + 선택적 ACK 기반 재전송
//! - 전달 확인 또는 포기까지 대기
//!
//! 사용법:
//!   cargo run --release --bin srp-sender -- [OPTIONS]
//!
//! 예시:
//!   # 파일 전송
//!   cargo run --release --bin srp-sender -- --peer 127.0.0.1:9000 --file data.bin
//!
//!   # 불안정 네트워크 프리셋
//!   cargo run --release --bin srp-sender -- -p 127.0.0.1:9000 -f data.bin --lossy

use std::net::SocketAddr;
use std::path::PathBuf;

use bytes::Bytes;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use srp::{Config, Endpoint, SendOutcome};

/// 송신자 설정
struct SenderConfig {
    bind_addr: SocketAddr,
    peer_addr: SocketAddr,
    file_path: Option<PathBuf>,
    config: Config,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:0".parse().unwrap(),
            peer_addr: "127.0.0.1:9000".parse().unwrap(),
            file_path: None,
            config: Config::default(),
        }
    }
}

fn parse_args() -> SenderConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = SenderConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" | "-b" => {
                if i + 1 < args.len() {
                    config.bind_addr = args[i + 1].parse().expect("유효한 주소 필요");
                    i += 1;
                }
            }
            "--peer" | "-p" => {
                if i + 1 < args.len() {
                    config.peer_addr = args[i + 1].parse().expect("유효한 주소 필요");
                    i += 1;
                }
            }
            "--file" | "-f" => {
                if i + 1 < args.len() {
                    config.file_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--chunk-size" => {
                if i + 1 < args.len() {
                    config.config.max_chunk_size = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--window" => {
                if i + 1 < args.len() {
                    config.config.window_size = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--retries" => {
                if i + 1 < args.len() {
                    config.config.retry_budget = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--lossy" => {
                config.config = Config::lossy_network();
            }
            "--local" => {
                config.config = Config::local_network();
            }
            "--help" | "-h" => {
                println!(
                    r#"SRP Sender - Selective Repeat Protocol 송신자

선택적 재전송 기반 신뢰 전송 프로토콜 송신 데모
- 윈도우 전송 + 선택적 ACK 기반 재전송

사용법:
  cargo run --release --bin srp-sender -- [OPTIONS]

옵션:
  -b, --bind <ADDR>     바인드 주소 (기본: 0.0.0.0:0)
  -p, --peer <ADDR>     수신자 주소 (기본: 127.0.0.1:9000)
  -f, --file <PATH>     전송할 파일 경로
  --chunk-size <SIZE>   청크 크기 바이트 (기본: 1200)
  --window <N>          송신 윈도우 크기 (기본: 32)
  --retries <N>         재시도 예산 (기본: 8)
  --lossy               불안정 네트워크 프리셋
  --local               로컬 네트워크 프리셋
  -h, --help            이 도움말 출력

예시:
  cargo run --release --bin srp-sender -- -p 192.168.0.10:9000 -f large_file.bin
"#
                );
                std::process::exit(0);
            }
            _ => {}
        }
        i += 1;
    }

    config
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 설정
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let sender_config = parse_args();

    info!("SRP Sender starting...");
    info!("Peer address: {}", sender_config.peer_addr);
    info!("Chunk size: {} bytes", sender_config.config.max_chunk_size);
    info!("Window size: {}", sender_config.config.window_size);

    // 전송할 데이터 준비
    let data = if let Some(path) = &sender_config.file_path {
        info!("Loading file: {:?}", path);
        Bytes::from(std::fs::read(path)?)
    } else {
        // 테스트용 더미 데이터 (64KB)
        info!("Using test data (64KB)");
        Bytes::from(vec![0xABu8; 64 * 1024])
    };

    info!("Data size: {} bytes", data.len());

    let (endpoint, _delivered_rx) =
        Endpoint::bind(sender_config.config, sender_config.bind_addr).await?;
    info!("Bound to {}", endpoint.local_addr());

    let started = std::time::Instant::now();
    let outcome = endpoint.send(sender_config.peer_addr, data.clone()).await?;
    let elapsed = started.elapsed();

    match outcome {
        SendOutcome::Delivered => {
            info!(
                "전송 완료: {} bytes, {:.2}ms, {:.2} MB/s",
                data.len(),
                elapsed.as_secs_f64() * 1000.0,
                data.len() as f64 / elapsed.as_secs_f64() / 1_000_000.0
            );
        }
        SendOutcome::Failed => {
            warn!("전송 포기: 재시도 예산 소진 ({:.2}ms)", elapsed.as_secs_f64() * 1000.0);
        }
    }

    let stats = endpoint.stats().await;
    info!(
        "통계: 청크 {} 전송, {} 재전송 ({:.1}%)",
        stats.chunks_sent,
        stats.chunks_retransmitted,
        stats.retransmit_ratio() * 100.0
    );

    endpoint.stop().await;
    Ok(())
}
