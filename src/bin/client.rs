//! CFTP 클라이언트 - Chunked File Transfer Protocol
//!
//! 청크 단위 파일 다운로드 클라이언트
//! - 청크별 체크섬 검증, 불일치 시 재전송 요청
//! - 중단된 다운로드는 part 파일에서 자동 이어받기
//!
//! 사용법:
//!   cargo run --release --bin cftp-client -- [OPTIONS]
//!
//! 예시:
//!   # 서버 파일 목록 조회
//!   cargo run --release --bin cftp-client -- --list
//!
//!   # 파일 다운로드
//!   cargo run --release --bin cftp-client -- --get data.bin -o ./downloads
//!
//!   # 중단된 다운로드 이어받기
//!   cargo run --release --bin cftp-client -- --resume data.bin

use std::net::SocketAddr;
use std::path::PathBuf;

use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use cftp::wire::DigestKind;
use cftp::{Config, FileClient};

/// 클라이언트 실행 설정
struct ClientArgs {
    server_addr: SocketAddr,
    list: bool,
    get: Option<String>,
    resume: Option<String>,
    config: Config,
}

impl Default for ClientArgs {
    fn default() -> Self {
        let mut config = Config::default();
        config.root_dir = PathBuf::from("./downloads");
        config.temp_dir = PathBuf::from("./downloads/_temp");
        Self {
            server_addr: "127.0.0.1:9000".parse().unwrap(),
            list: false,
            get: None,
            resume: None,
            config,
        }
    }
}

fn parse_args() -> ClientArgs {
    let args: Vec<String> = std::env::args().collect();
    let mut client = ClientArgs::default();
    let mut output: Option<PathBuf> = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--connect" | "-c" => {
                if i + 1 < args.len() {
                    client.server_addr = args[i + 1].parse().expect("유효한 주소 필요");
                    i += 1;
                }
            }
            "--output" | "-o" => {
                if i + 1 < args.len() {
                    output = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--list" | "-l" => {
                client.list = true;
            }
            "--get" | "-g" => {
                if i + 1 < args.len() {
                    client.get = Some(args[i + 1].clone());
                    i += 1;
                }
            }
            "--resume" => {
                if i + 1 < args.len() {
                    client.resume = Some(args[i + 1].clone());
                    i += 1;
                }
            }
            "--crc32" => {
                client.config.digest = DigestKind::Crc32;
            }
            "--help" | "-h" => {
                println!(
                    r#"CFTP Client - 청크 단위 파일 전송 클라이언트

청크별 체크섬 검증 + 이어받기 지원 다운로드 클라이언트

사용법:
  cargo run --release --bin cftp-client -- [OPTIONS]

옵션:
  -c, --connect <ADDR>    서버 주소 (기본: 127.0.0.1:9000)
  -o, --output <DIR>      다운로드 디렉터리 (기본: ./downloads)
  -l, --list              서버 파일 목록 조회
  -g, --get <FILE>        파일 다운로드
  --resume <FILE>         part 파일에서 이어받기
  --crc32                 BLAKE3 대신 CRC32 체크섬 사용 (서버와 일치해야 함)
  -h, --help              이 도움말 출력

예시:
  # 목록 조회 후 다운로드
  cargo run --release --bin cftp-client -- -c 192.168.0.10:9000 --list
  cargo run --release --bin cftp-client -- -c 192.168.0.10:9000 --get big.bin
"#
                );
                std::process::exit(0);
            }
            _ => {}
        }
        i += 1;
    }

    if let Some(dir) = output {
        client.config.temp_dir = dir.join("_temp");
        client.config.root_dir = dir;
    }
    client
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 설정
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = parse_args();

    info!("Connecting to {}", args.server_addr);
    let mut client = FileClient::connect(args.server_addr, args.config)?;

    if args.list {
        let entries = client.list()?;
        println!("{:<40} {:>12}  {}", "NAME", "SIZE", "TYPE");
        for entry in &entries {
            println!(
                "{:<40} {:>12}  {}",
                entry.name,
                entry.size,
                if entry.is_dir { "dir" } else { "file" }
            );
        }
        info!("{} entries", entries.len());
    }

    if let Some(filename) = &args.get {
        info!("Downloading: {}", filename);
        let path = client.download(filename)?;
        info!("Saved: {:?}", path);
    }

    if let Some(filename) = &args.resume {
        info!("Resuming: {}", filename);
        let path = client.resume(filename)?;
        info!("Saved: {:?}", path);
    }

    Ok(())
}
