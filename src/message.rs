//! 프로토콜 메시지 정의
//!
//! msg_type별 페이로드 스키마. 헤더는 고정 레이아웃(wire.rs),
//! 페이로드는 bincode 직렬화.

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// 메시지 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u16)]
pub enum MsgType {
    /// 핸드셰이크 (클라이언트 → 서버)
    Handshake = 1,

    /// 파일 요청
    FileRequest = 2,

    /// 파일 메타데이터 응답
    FileMetadata = 3,

    /// 파일 데이터 청크
    FileData = 4,

    /// 전체 파일 체크섬 검증 요청
    ChecksumVerify = 5,

    /// 에러 통보
    Error = 6,

    /// 확인 응답
    Ack = 7,

    /// 이어받기 요청
    ResumeRequest = 8,

    /// 파일 목록 요청
    ListRequest = 10,

    /// 파일 목록 응답
    ListResponse = 11,
}

impl MsgType {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(MsgType::Handshake),
            2 => Some(MsgType::FileRequest),
            3 => Some(MsgType::FileMetadata),
            4 => Some(MsgType::FileData),
            5 => Some(MsgType::ChecksumVerify),
            6 => Some(MsgType::Error),
            7 => Some(MsgType::Ack),
            8 => Some(MsgType::ResumeRequest),
            10 => Some(MsgType::ListRequest),
            11 => Some(MsgType::ListResponse),
            _ => None,
        }
    }
}

/// 와이어 에러 코드
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u16)]
pub enum ErrorCode {
    Unknown = 0,
    Frame = 1,
    Protocol = 2,
    NotFound = 3,
    InvalidRange = 4,
    /// 청크 체크섬 불일치 (클라이언트 → 서버, 재전송 요청)
    Checksum = 5,
    /// 전체 파일 다이제스트 불일치
    Integrity = 6,
    Resource = 7,
    RetryExhausted = 8,
    UnsupportedVersion = 9,
}

impl ErrorCode {
    /// 연결을 끊어야 하는 코드인지 여부
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            ErrorCode::Unknown
                | ErrorCode::Frame
                | ErrorCode::Protocol
                | ErrorCode::Resource
                | ErrorCode::RetryExhausted
                | ErrorCode::UnsupportedVersion
        )
    }
}

/// 핸드셰이크 페이로드 (클라이언트 → 서버)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakePayload {
    /// 클라이언트 프로토콜 버전
    pub version: u16,

    /// 클라이언트 식별자
    pub client_id: String,
}

/// 파일 요청 페이로드
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRequestPayload {
    pub filename: String,
}

/// 이어받기 요청 페이로드
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeRequestPayload {
    pub filename: String,

    /// 재개할 청크 번호 (0 ≤ start_chunk ≤ total_chunks)
    pub start_chunk: u32,
}

/// 파일 메타데이터 페이로드 (서버 → 클라이언트)
///
/// 이어받기 응답에서는 file_size/total_chunks가 남은 바이트/청크 수를 뜻한다.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMetadataPayload {
    pub file_size: u64,
    pub total_chunks: u32,
    pub chunk_size: u32,

    /// 전체 파일 다이제스트 (이어받기여도 전체 파일 기준)
    pub file_checksum: [u8; 32],
}

/// ACK 페이로드
///
/// 청크 ACK는 헤더의 chunk_number에 확인한 청크 번호를 실어 보낸다.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckPayload {
    /// 확인하는 메시지의 시퀀스 번호
    pub acked_sequence: u32,
}

/// 전체 파일 체크섬 검증 페이로드 (클라이언트 → 서버)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChecksumVerifyPayload {
    pub checksum: [u8; 32],
}

/// 에러 페이로드
///
/// 체크섬 에러(code=Checksum)는 chunk_number/expected/received를 채워
/// 서버가 해당 청크를 재전송하게 한다.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub chunk_number: u32,
    pub expected: [u8; 32],
    pub received: [u8; 32],
    pub detail: String,
}

impl ErrorPayload {
    /// 일반 에러 (청크 정보 없음)
    pub fn new(code: ErrorCode, detail: impl Into<String>) -> Self {
        Self {
            code,
            chunk_number: 0,
            expected: [0u8; 32],
            received: [0u8; 32],
            detail: detail.into(),
        }
    }

    /// 청크 체크섬 에러
    pub fn checksum_error(chunk_number: u32, expected: [u8; 32], received: [u8; 32]) -> Self {
        Self {
            code: ErrorCode::Checksum,
            chunk_number,
            expected,
            received,
            detail: String::new(),
        }
    }
}

/// 파일 목록 항목
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListEntry {
    pub name: String,
    pub size: u64,

    /// 수정 시각 (unix epoch 초)
    pub mtime_secs: u64,
    pub is_dir: bool,
}

/// 파일 목록 응답 페이로드
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListResponsePayload {
    pub entries: Vec<ListEntry>,
}

/// 페이로드 직렬화
pub fn encode_payload<T: Serialize>(payload: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(payload)?)
}

/// 페이로드 역직렬화
pub fn decode_payload<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_msg_type_mapping() {
        for raw in [1u16, 2, 3, 4, 5, 6, 7, 8, 10, 11] {
            let t = MsgType::from_u16(raw).unwrap();
            assert_eq!(t as u16, raw);
        }
        assert!(MsgType::from_u16(9).is_none());
        assert!(MsgType::from_u16(99).is_none());
    }

    #[test]
    fn test_payload_roundtrip() {
        let meta = FileMetadataPayload {
            file_size: 1_048_576,
            total_chunks: 128,
            chunk_size: 8192,
            file_checksum: [0x5A; 32],
        };

        let bytes = encode_payload(&meta).unwrap();
        let restored: FileMetadataPayload = decode_payload(&bytes).unwrap();

        assert_eq!(restored.file_size, meta.file_size);
        assert_eq!(restored.total_chunks, meta.total_chunks);
        assert_eq!(restored.file_checksum, meta.file_checksum);
    }

    #[test]
    fn test_error_payload_checksum() {
        let err = ErrorPayload::checksum_error(12, [1u8; 32], [2u8; 32]);
        let bytes = encode_payload(&err).unwrap();
        let restored: ErrorPayload = decode_payload(&bytes).unwrap();

        assert_eq!(restored.code, ErrorCode::Checksum);
        assert_eq!(restored.chunk_number, 12);
        assert!(!restored.code.is_fatal());
        assert!(ErrorCode::RetryExhausted.is_fatal());
    }
}
