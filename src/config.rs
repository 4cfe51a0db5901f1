//! 프로토콜/서버 설정

use std::path::PathBuf;

use crate::wire::DigestKind;
use crate::DEFAULT_CHUNK_SIZE;

/// CFTP 설정
#[derive(Debug, Clone)]
pub struct Config {
    /// 서빙 파일 루트 디렉터리
    pub root_dir: PathBuf,

    /// 진행 중 전송 임시 디렉터리
    pub temp_dir: PathBuf,

    /// 청크 크기 (바이트)
    pub chunk_size: u32,

    /// 청크당 재전송 허용 횟수
    pub max_retries: u32,

    /// 유휴 세션 타임아웃 (밀리초)
    pub session_timeout_ms: u64,

    /// 유휴 세션 정리 주기 (밀리초)
    pub sweep_interval_ms: u64,

    /// 소켓 읽기 버퍼 크기 (바이트)
    pub read_buffer_size: usize,

    /// 스레드 백엔드 워커 수
    pub worker_threads: usize,

    /// 체크섬 다이제스트 종류
    pub digest: DigestKind,

    /// 파일 목록 범위
    /// false = 루트 디렉터리 바로 아래만 (기본, 비재귀)
    pub list_recursive: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("./files"),
            temp_dir: PathBuf::from("./files/_temp"),
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_retries: 3,
            session_timeout_ms: 3_600_000, // 1시간
            sweep_interval_ms: 10_000,
            read_buffer_size: 64 * 1024,
            worker_threads: 4,
            digest: DigestKind::Blake3,
            list_recursive: false,
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 디렉터리 지정 설정
    pub fn with_dirs(root_dir: impl Into<PathBuf>, temp_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            temp_dir: temp_dir.into(),
            ..Self::default()
        }
    }

    /// 파일 크기 기준 총 청크 수 계산
    pub fn total_chunks(&self, file_size: u64) -> u32 {
        if file_size == 0 {
            return 0;
        }
        ((file_size + self.chunk_size as u64 - 1) / self.chunk_size as u64) as u32
    }

    /// 청크 번호별 실제 길이 계산
    pub fn chunk_len(&self, file_size: u64, chunk_number: u32) -> u32 {
        let offset = chunk_number as u64 * self.chunk_size as u64;
        let remaining = file_size.saturating_sub(offset);
        remaining.min(self.chunk_size as u64) as u32
    }
}
