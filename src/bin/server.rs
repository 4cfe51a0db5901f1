//! CFTP 서버 - Chunked File Transfer Protocol
//!
//! 청크 단위 파일 서빙 서버
//! - 고정 48바이트 헤더 프레이밍 + stop-and-wait 전송
//! - 이어받기(RESUME_REQUEST) / 재전송 한도 / 파일 목록 조회
//! - 4가지 동시성 백엔드 선택 가능
//!
//! 사용법:
//!   cargo run --release --bin cftp-server -- [OPTIONS]
//!
//! 예시:
//!   # 기본 (스레드풀 백엔드, ./files 서빙)
//!   cargo run --release --bin cftp-server -- --bind 0.0.0.0:9000
//!
//!   # 비동기 백엔드 + 큰 청크
//!   cargo run --release --bin cftp-server -- --backend async --chunk-size 65536

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use cftp::wire::DigestKind;
use cftp::{BackendKind, Config, Server};

/// 서버 기동 설정
struct ServerArgs {
    bind_addr: SocketAddr,
    backend: BackendKind,
    config: Config,
}

impl Default for ServerArgs {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:9000".parse().unwrap(),
            backend: BackendKind::Threaded,
            config: Config::default(),
        }
    }
}

fn parse_args() -> ServerArgs {
    let args: Vec<String> = std::env::args().collect();
    let mut server = ServerArgs::default();
    let mut temp_dir: Option<PathBuf> = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" | "-b" => {
                if i + 1 < args.len() {
                    server.bind_addr = args[i + 1].parse().expect("유효한 주소 필요");
                    i += 1;
                }
            }
            "--root" | "-r" => {
                if i + 1 < args.len() {
                    server.config.root_dir = PathBuf::from(&args[i + 1]);
                    i += 1;
                }
            }
            "--temp" => {
                if i + 1 < args.len() {
                    temp_dir = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--backend" => {
                if i + 1 < args.len() {
                    server.backend = args[i + 1].parse().expect("유효한 백엔드 필요");
                    i += 1;
                }
            }
            "--chunk-size" => {
                if i + 1 < args.len() {
                    server.config.chunk_size = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--max-retries" => {
                if i + 1 < args.len() {
                    server.config.max_retries = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--workers" | "-w" => {
                if i + 1 < args.len() {
                    server.config.worker_threads = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--timeout" => {
                if i + 1 < args.len() {
                    let secs: u64 = args[i + 1].parse().expect("유효한 숫자 필요");
                    server.config.session_timeout_ms = secs * 1000;
                    i += 1;
                }
            }
            "--crc32" => {
                server.config.digest = DigestKind::Crc32;
            }
            "--recursive-list" => {
                server.config.list_recursive = true;
            }
            "--help" | "-h" => {
                println!(
                    r#"CFTP Server - 청크 단위 파일 전송 서버

고정 헤더 프레이밍 + stop-and-wait 청크 전송, 이어받기 지원

사용법:
  cargo run --release --bin cftp-server -- [OPTIONS]

옵션:
  -b, --bind <ADDR>       바인드 주소 (기본: 0.0.0.0:9000)
  -r, --root <DIR>        서빙 루트 디렉터리 (기본: ./files)
  --temp <DIR>            임시 디렉터리 (기본: <root>/_temp)
  --backend <KIND>        sequential | threaded | multiplexed | async
                          (기본: threaded)
  -w, --workers <N>       스레드 백엔드 워커 수 (기본: 4)
  --chunk-size <SIZE>     청크 크기 바이트 (기본: 8192)
  --max-retries <N>       청크당 재전송 한도 (기본: 3)
  --timeout <SECS>        유휴 세션 타임아웃 초 (기본: 3600)
  --crc32                 BLAKE3 대신 CRC32 체크섬 사용
  --recursive-list        파일 목록을 하위 디렉터리까지 포함
  -h, --help              이 도움말 출력

예시:
  # 특정 디렉터리를 멀티플렉스 백엔드로 서빙
  cargo run --release --bin cftp-server -- -r /srv/files --backend multiplexed
"#
                );
                std::process::exit(0);
            }
            _ => {}
        }
        i += 1;
    }

    server.config.temp_dir = temp_dir.unwrap_or_else(|| server.config.root_dir.join("_temp"));
    server
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 설정
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = parse_args();

    info!("CFTP Server starting...");
    info!("Bind address: {}", args.bind_addr);
    info!("Backend: {:?}", args.backend);
    info!("Root dir: {:?}", args.config.root_dir);
    info!("Chunk size: {} bytes", args.config.chunk_size);
    info!("Max retries: {}", args.config.max_retries);

    let server = Server::start(args.bind_addr, args.config, args.backend)?;
    info!("Server listening on {}", server.local_addr());

    // 주기적으로 상태 출력
    loop {
        std::thread::sleep(Duration::from_secs(60));
        let status = server.status();
        info!(
            "status: running={}, active_sessions={}",
            status.running, status.active_sessions
        );
    }
}
