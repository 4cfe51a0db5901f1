//! 에러 타입 정의

use thiserror::Error;

use crate::message::ErrorCode;

/// 프레임 디코딩 에러 (치명적, 연결 종료)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("헤더 길이 부족: expected {expected}, got {got}")]
    TruncatedHeader { expected: usize, got: usize },

    #[error("유효하지 않은 프로토콜 버전: expected {expected}, got {got}")]
    InvalidVersion { expected: u16, got: u16 },

    #[error("알 수 없는 메시지 타입: {0}")]
    UnknownMsgType(u16),

    #[error("페이로드 길이 불일치: header {declared}, actual {actual}")]
    PayloadLengthMismatch { declared: u32, actual: u32 },

    #[error("페이로드 크기 초과: {got} > {max}")]
    PayloadTooLarge { got: u32, max: u32 },

    #[error("체크섬 불일치: expected {expected}, got {got}")]
    ChecksumMismatch { expected: String, got: String },
}

/// CFTP 프로토콜 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("직렬화 에러: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("프레임 에러: {0}")]
    Frame(#[from] FrameError),

    #[error("프로토콜 위반: state={state}, msg_type={msg_type}")]
    Protocol { state: String, msg_type: String },

    #[error("파일 없음: {filename}")]
    NotFound { filename: String },

    #[error("이어받기 범위 초과: start_chunk={start_chunk}, total_chunks={total_chunks}")]
    InvalidRange { start_chunk: u32, total_chunks: u32 },

    #[error("무결성 검증 실패: expected {expected}, got {got}")]
    Integrity { expected: String, got: String },

    #[error("재전송 한도 초과: chunk={chunk_number}, retries={retries}")]
    RetryExhausted { chunk_number: u32, retries: u32 },

    #[error("저장소 에러: {0}")]
    Resource(String),

    #[error("세션 없음: {session_id}")]
    SessionNotFound { session_id: u64 },

    #[error("원격 에러: code={code:?}, detail={detail}")]
    Remote { code: ErrorCode, detail: String },

    #[error("채널 에러")]
    ChannelError,

    #[error("연결 종료")]
    ConnectionClosed,
}

impl Error {
    /// 연결을 끊어야 하는 에러인지 여부
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Error::NotFound { .. } | Error::InvalidRange { .. } | Error::Integrity { .. }
        )
    }

    /// 와이어 에러 코드로 변환
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Error::Frame(FrameError::InvalidVersion { .. }) => ErrorCode::UnsupportedVersion,
            Error::Frame(_) => ErrorCode::Frame,
            Error::Protocol { .. } => ErrorCode::Protocol,
            Error::NotFound { .. } => ErrorCode::NotFound,
            Error::InvalidRange { .. } => ErrorCode::InvalidRange,
            Error::Integrity { .. } => ErrorCode::Integrity,
            Error::RetryExhausted { .. } => ErrorCode::RetryExhausted,
            Error::Io(_) | Error::Resource(_) => ErrorCode::Resource,
            _ => ErrorCode::Unknown,
        }
    }
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
