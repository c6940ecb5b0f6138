//! SRP 수신자 - Selective Repeat Protocol
//!
//! 선택적 재전송 기반 신뢰 전송 프로토콜 수신 데모
//! - 누락 구간을 선택적 ACK로 알려 재전송 유도
//! - 완성된 페이로드를 파일로 저장
//!
//! 사용법:
//!   cargo run --release --bin srp-receiver -- [OPTIONS]
//!
//! 예시:
//!   cargo run --release --bin srp-receiver -- --bind 0.0.0.0:9000 --output received.bin

use std::net::SocketAddr;
use std::path::PathBuf;

use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use srp::{Config, Endpoint};

/// 수신자 설정
struct ReceiverConfig {
    bind_addr: SocketAddr,
    output_path: Option<PathBuf>,
    count: Option<usize>,
    config: Config,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:9000".parse().unwrap(),
            output_path: None,
            count: None,
            config: Config::default(),
        }
    }
}

fn parse_args() -> ReceiverConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = ReceiverConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" | "-b" => {
                if i + 1 < args.len() {
                    config.bind_addr = args[i + 1].parse().expect("유효한 주소 필요");
                    i += 1;
                }
            }
            "--output" | "-o" => {
                if i + 1 < args.len() {
                    config.output_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--count" | "-c" => {
                if i + 1 < args.len() {
                    config.count = Some(args[i + 1].parse().expect("유효한 숫자 필요"));
                    i += 1;
                }
            }
            "--ack-delay" => {
                if i + 1 < args.len() {
                    config.config.ack_delay_ms = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!(
                    r#"SRP Receiver - Selective Repeat Protocol 수신자

선택적 재전송 기반 신뢰 전송 프로토콜 수신 데모
- 누락 구간을 선택적 ACK로 알려 재전송 유도

사용법:
  cargo run --release --bin srp-receiver -- [OPTIONS]

옵션:
  -b, --bind <ADDR>    바인드 주소 (기본: 0.0.0.0:9000)
  -o, --output <PATH>  저장 파일 경로 (여러 개면 번호가 붙음)
  -c, --count <N>      N개 수신 후 종료 (기본: 무한)
  --ack-delay <MS>     ACK 지연 밀리초 (기본: 50)
  -h, --help           이 도움말 출력

예시:
  cargo run --release --bin srp-receiver -- -b 0.0.0.0:9000 -o data.bin -c 1
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

    let receiver_config = parse_args();

    info!("SRP Receiver starting...");

    let (endpoint, mut delivered_rx) =
        Endpoint::bind(receiver_config.config, receiver_config.bind_addr).await?;
    info!("Listening on {}", endpoint.local_addr());

    let mut received = 0usize;

    while let Some((peer, data)) = delivered_rx.recv().await {
        received += 1;
        info!("수신 완료 #{}: peer={}, {} bytes", received, peer, data.len());

        if let Some(path) = &receiver_config.output_path {
            let path = if received == 1 {
                path.clone()
            } else {
                path.with_extension(format!("{}", received))
            };
            std::fs::write(&path, &data)?;
            info!("저장: {:?}", path);
        }

        if let Some(count) = receiver_config.count {
            if received >= count {
                break;
            }
        }
    }

    let stats = endpoint.stats().await;
    info!(
        "통계: 청크 {} 수신, 중복 {} ({:.1}%), ACK {} 발신",
        stats.chunks_received,
        stats.duplicate_chunks,
        stats.duplicate_ratio() * 100.0,
        stats.acks_sent
    );

    endpoint.stop().await;
    Ok(())
}
