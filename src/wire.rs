//! 와이어 코덱
//!
//! 고정 48바이트 헤더 + 가변 페이로드 프레임의 인코딩/디코딩
//!
//! 헤더 레이아웃 (네트워크 바이트 오더):
//! version(2) | msg_type(2) | sequence_number(4) | chunk_number(4) |
//! payload_length(4) | checksum(32)

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::FrameError;
use crate::message::MsgType;
use crate::{HEADER_SIZE, MAX_PAYLOAD_SIZE, PROTOCOL_VERSION};

/// 체크섬 다이제스트 종류
///
/// 와이어 상 체크섬 필드는 항상 32바이트. 다이제스트는 프로토콜 버전과
/// 무관한 설정 항목이며 양 끝단이 같은 종류를 사용해야 한다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DigestKind {
    /// BLAKE3 (32바이트 출력, 기본값)
    #[default]
    Blake3,

    /// CRC32 (4바이트 출력, 나머지 0 패딩)
    Crc32,
}

impl DigestKind {
    /// 페이로드 바이트의 다이제스트 계산
    ///
    /// 빈 페이로드는 빈 입력의 다이제스트를 가진다.
    pub fn digest(self, data: &[u8]) -> [u8; 32] {
        match self {
            DigestKind::Blake3 => *blake3::hash(data).as_bytes(),
            DigestKind::Crc32 => {
                let mut out = [0u8; 32];
                out[..4].copy_from_slice(&crc32fast::hash(data).to_be_bytes());
                out
            }
        }
    }
}

/// 바이트 앞부분의 16진수 표현 (에러 메시지용)
pub(crate) fn hex_prefix(bytes: &[u8; 32]) -> String {
    bytes[..8].iter().map(|b| format!("{:02x}", b)).collect()
}

/// 프로토콜 헤더
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolHeader {
    /// 프로토콜 버전
    pub version: u16,

    /// 메시지 타입
    pub msg_type: MsgType,

    /// 메시지 시퀀스 번호 (연결 내 단조 증가, 청크 번호와 독립)
    pub sequence_number: u32,

    /// 청크 번호 (FILE_DATA / 청크 ACK에서 사용, 그 외 0)
    pub chunk_number: u32,

    /// 페이로드 길이 (바이트)
    pub payload_length: u32,

    /// 페이로드 체크섬 (32바이트)
    pub checksum: [u8; 32],
}

impl ProtocolHeader {
    /// 헤더를 48바이트로 직렬화
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..2].copy_from_slice(&self.version.to_be_bytes());
        buf[2..4].copy_from_slice(&(self.msg_type as u16).to_be_bytes());
        buf[4..8].copy_from_slice(&self.sequence_number.to_be_bytes());
        buf[8..12].copy_from_slice(&self.chunk_number.to_be_bytes());
        buf[12..16].copy_from_slice(&self.payload_length.to_be_bytes());
        buf[16..48].copy_from_slice(&self.checksum);
        buf
    }

    /// 48바이트에서 헤더 파싱
    ///
    /// 버전 검증이 가장 먼저 수행되며, 알 수 없는 버전이면 페이로드를
    /// 해석하기 전에 실패한다.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < HEADER_SIZE {
            return Err(FrameError::TruncatedHeader {
                expected: HEADER_SIZE,
                got: bytes.len(),
            });
        }

        let version = u16::from_be_bytes([bytes[0], bytes[1]]);
        if version != PROTOCOL_VERSION {
            return Err(FrameError::InvalidVersion {
                expected: PROTOCOL_VERSION,
                got: version,
            });
        }

        let raw_type = u16::from_be_bytes([bytes[2], bytes[3]]);
        let msg_type = MsgType::from_u16(raw_type).ok_or(FrameError::UnknownMsgType(raw_type))?;

        let sequence_number = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let chunk_number = u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        let payload_length = u32::from_be_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]);

        if payload_length > MAX_PAYLOAD_SIZE {
            return Err(FrameError::PayloadTooLarge {
                got: payload_length,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let mut checksum = [0u8; 32];
        checksum.copy_from_slice(&bytes[16..48]);

        Ok(Self {
            version,
            msg_type,
            sequence_number,
            chunk_number,
            payload_length,
            checksum,
        })
    }
}

/// 프레임 (헤더 + 페이로드)
#[derive(Debug, Clone)]
pub struct Frame {
    pub header: ProtocolHeader,
    pub payload: Bytes,
}

impl Frame {
    /// 새 프레임 생성 (체크섬/길이 자동 계산)
    pub fn new(
        msg_type: MsgType,
        sequence_number: u32,
        chunk_number: u32,
        payload: Bytes,
        digest: DigestKind,
    ) -> Self {
        let checksum = digest.digest(&payload);
        Self {
            header: ProtocolHeader {
                version: PROTOCOL_VERSION,
                msg_type,
                sequence_number,
                chunk_number,
                payload_length: payload.len() as u32,
                checksum,
            },
            payload,
        }
    }

    /// 프레임을 바이트로 직렬화
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        buf.put_slice(&self.header.to_bytes());
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// 정확히 한 프레임을 담은 버퍼에서 디코딩 (체크섬 검증 포함)
    pub fn decode(bytes: &[u8], digest: DigestKind) -> Result<Self, FrameError> {
        let header = ProtocolHeader::from_bytes(bytes)?;

        let actual = (bytes.len() - HEADER_SIZE) as u32;
        if header.payload_length != actual {
            return Err(FrameError::PayloadLengthMismatch {
                declared: header.payload_length,
                actual,
            });
        }

        let payload = Bytes::copy_from_slice(&bytes[HEADER_SIZE..]);
        let frame = Self { header, payload };
        frame.verify_checksum(digest)?;
        Ok(frame)
    }

    /// 페이로드 체크섬 검증
    ///
    /// 디코더는 검증하지 않으므로 핸들러가 프레임별로 호출해 심각도를
    /// 결정한다. 서버는 불일치를 치명적으로, 클라이언트는 FILE_DATA
    /// 불일치를 재전송 요청으로 다룬다.
    pub fn verify_checksum(&self, digest: DigestKind) -> Result<(), FrameError> {
        let computed = digest.digest(&self.payload);
        if computed != self.header.checksum {
            return Err(FrameError::ChecksumMismatch {
                expected: hex_prefix(&self.header.checksum),
                got: hex_prefix(&computed),
            });
        }
        Ok(())
    }
}

/// 스트리밍 프레임 디코더
///
/// 부분 수신을 버퍼에 누적하고 완성된 프레임만 꺼낸다.
/// 멀티플렉스/비동기 백엔드의 partial read를 이 버퍼가 흡수한다.
/// 체크섬 검증은 하지 않는다 — `Frame::verify_checksum` 참고.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(HEADER_SIZE + 16 * 1024),
        }
    }

    /// 수신 바이트 누적
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// 완성된 프레임 하나 반환 (없으면 None)
    pub fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        if self.buf.len() < HEADER_SIZE {
            return Ok(None);
        }

        let header = ProtocolHeader::from_bytes(&self.buf)?;
        let frame_len = HEADER_SIZE + header.payload_length as usize;
        if self.buf.len() < frame_len {
            return Ok(None);
        }

        let frame_bytes = self.buf.split_to(frame_len);
        let payload = Bytes::copy_from_slice(&frame_bytes[HEADER_SIZE..]);

        Ok(Some(Frame { header, payload }))
    }

    /// 버퍼에 남은 바이트 수
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip_exact() {
        let header = ProtocolHeader {
            version: PROTOCOL_VERSION,
            msg_type: MsgType::FileData,
            sequence_number: 42,
            chunk_number: 7,
            payload_length: 100,
            checksum: [0xAB; 32],
        };

        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), HEADER_SIZE);

        let restored = ProtocolHeader::from_bytes(&bytes).unwrap();
        assert_eq!(header, restored);
    }

    #[test]
    fn test_frame_roundtrip() {
        let payload = Bytes::from(vec![1u8, 2, 3, 4, 5]);
        let frame = Frame::new(MsgType::FileData, 1, 0, payload.clone(), DigestKind::Blake3);

        let encoded = frame.encode();
        let decoded = Frame::decode(&encoded, DigestKind::Blake3).unwrap();

        assert_eq!(decoded.header, frame.header);
        assert_eq!(decoded.payload, payload);
    }

    #[test]
    fn test_empty_payload_digest() {
        let frame = Frame::new(MsgType::Ack, 3, 0, Bytes::new(), DigestKind::Blake3);
        assert_eq!(frame.header.checksum, *blake3::hash(b"").as_bytes());

        let decoded = Frame::decode(&frame.encode(), DigestKind::Blake3).unwrap();
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_invalid_version_rejected() {
        let mut bytes = Frame::new(MsgType::Ack, 0, 0, Bytes::new(), DigestKind::Blake3)
            .encode()
            .to_vec();
        bytes[0] = 0xFF;
        bytes[1] = 0xFF;

        match Frame::decode(&bytes, DigestKind::Blake3) {
            Err(FrameError::InvalidVersion { got, .. }) => assert_eq!(got, 0xFFFF),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_truncated_header() {
        let err = ProtocolHeader::from_bytes(&[0u8; 10]).unwrap_err();
        assert!(matches!(err, FrameError::TruncatedHeader { got: 10, .. }));
    }

    #[test]
    fn test_payload_length_mismatch() {
        let frame = Frame::new(
            MsgType::FileData,
            0,
            0,
            Bytes::from(vec![9u8; 16]),
            DigestKind::Blake3,
        );
        let mut bytes = frame.encode().to_vec();
        // 페이로드 일부 잘라내기
        bytes.truncate(bytes.len() - 4);

        assert!(matches!(
            Frame::decode(&bytes, DigestKind::Blake3),
            Err(FrameError::PayloadLengthMismatch { .. })
        ));
    }

    #[test]
    fn test_checksum_mismatch() {
        let frame = Frame::new(
            MsgType::FileData,
            0,
            0,
            Bytes::from(vec![9u8; 16]),
            DigestKind::Blake3,
        );
        let mut bytes = frame.encode().to_vec();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;

        assert!(matches!(
            Frame::decode(&bytes, DigestKind::Blake3),
            Err(FrameError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_crc32_digest_padding() {
        let d = DigestKind::Crc32.digest(b"hello");
        assert_eq!(&d[..4], &crc32fast::hash(b"hello").to_be_bytes());
        assert_eq!(&d[4..], &[0u8; 28]);
    }

    #[test]
    fn test_decoder_partial_feed() {
        let frame = Frame::new(
            MsgType::FileData,
            5,
            2,
            Bytes::from(vec![7u8; 300]),
            DigestKind::Blake3,
        );
        let encoded = frame.encode();

        let mut decoder = FrameDecoder::new();

        // 17바이트씩 나눠 먹여도 경계에서 정확히 복원
        for chunk in encoded.chunks(17) {
            decoder.extend(chunk);
        }

        let decoded = decoder.next_frame().unwrap().unwrap();
        assert_eq!(decoded.header.sequence_number, 5);
        assert_eq!(decoded.payload.len(), 300);
        assert!(decoder.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_decoder_back_to_back_frames() {
        let a = Frame::new(MsgType::Ack, 1, 0, Bytes::new(), DigestKind::Blake3);
        let b = Frame::new(
            MsgType::FileData,
            2,
            0,
            Bytes::from(vec![1u8; 64]),
            DigestKind::Blake3,
        );

        let mut decoder = FrameDecoder::new();
        decoder.extend(&a.encode());
        decoder.extend(&b.encode());

        assert_eq!(
            decoder.next_frame().unwrap().unwrap().header.msg_type,
            MsgType::Ack
        );
        assert_eq!(
            decoder.next_frame().unwrap().unwrap().header.msg_type,
            MsgType::FileData
        );
        assert_eq!(decoder.pending(), 0);
    }
}
