//! # CFTP (Chunked File Transfer Protocol)
//!
//! TCP 기반 청크 단위 파일 전송 프로토콜 엔진
//!
//! ## 핵심 특징
//! - **고정 헤더 프레이밍**: 48바이트 헤더 + 가변 페이로드, 체크섬 검증
//! - **Stop-and-Wait**: 청크 하나씩 전송/ACK, 순서 보장
//! - **이어받기**: RESUME_REQUEST로 임의 청크부터 재개
//! - **재전송 한도**: 체크섬 오류 시 제한된 횟수만 재전송
//! - **4가지 동시성 백엔드**: 순차 / 스레드풀 / 멀티플렉스 / 비동기
//! - **세션 레지스트리**: 전송 상태 추적, 유휴 세션 자동 정리

pub mod backend;
pub mod client;
pub mod config;
pub mod error;
pub mod file_manager;
pub mod handler;
pub mod message;
pub mod session;
pub mod wire;

pub use backend::{BackendKind, Server, ServerStatus};
pub use client::{ClientHandler, ClientState, FileClient};
pub use config::Config;
pub use error::{Error, FrameError, Result};
pub use file_manager::{FileInfo, FileManager};
pub use handler::{ServerHandler, ServerState};
pub use message::{ErrorCode, ListEntry, MsgType};
pub use session::{
    SessionId, SessionRegistry, SessionStatus, TransferDirection, TransferSession,
};
pub use wire::{DigestKind, Frame, FrameDecoder, ProtocolHeader};

/// 프로토콜 버전
pub const PROTOCOL_VERSION: u16 = 1;

/// 기본 청크 크기 (바이트)
pub const DEFAULT_CHUNK_SIZE: u32 = 8192;

/// 고정 헤더 크기 (바이트)
pub const HEADER_SIZE: usize = 48;

/// 페이로드 최대 허용 크기 (바이트, 비정상 프레임 방어용)
pub const MAX_PAYLOAD_SIZE: u32 = 4 * 1024 * 1024;
