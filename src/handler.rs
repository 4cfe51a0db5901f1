//! 서버측 프로토콜 상태 머신
//!
//! sans-I/O 설계: 소켓을 직접 만지지 않고 바이트를 먹이고(feed) 보낼
//! 바이트를 꺼낸다(poll_output). 네 가지 백엔드(backend.rs)가 모두 이
//! 핸들러 하나를 구동하므로 와이어 동작이 백엔드와 무관하게 동일하다.
//!
//! 상태 전이:
//! - **INIT** → HANDSHAKE 수신 → **HANDSHAKEN**
//! - **HANDSHAKEN** → FILE_REQUEST / RESUME_REQUEST → **TRANSFERRING**
//! - **TRANSFERRING** → 마지막 청크 ACK → **COMPLETE**
//! - **COMPLETE** → 같은 연결에서 추가 요청 허용 (HANDSHAKEN과 동일 취급)
//! - 치명적 에러 → **ERROR** (연결 종료)
//!
//! 전송은 stop-and-wait: FILE_DATA 하나를 보내고 ACK(또는 체크섬 에러)를
//! 기다린다. 체크섬 에러는 max_retries 한도 내에서 같은 청크를 재전송한다.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::file_manager::FileManager;
use crate::message::{
    decode_payload, encode_payload, AckPayload, ChecksumVerifyPayload, ErrorCode, ErrorPayload,
    FileMetadataPayload, FileRequestPayload, HandshakePayload, ListEntry, ListResponsePayload,
    MsgType, ResumeRequestPayload,
};
use crate::session::{SessionRegistry, SessionStatus, TransferDirection, TransferSession};
use crate::wire::{Frame, FrameDecoder};
use crate::PROTOCOL_VERSION;

/// 서버 연결 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Init,
    Handshaken,
    Transferring,
    Complete,
    Error,
}

/// 진행 중인 서빙 전송
#[derive(Debug)]
struct OutboundTransfer {
    session: Arc<TransferSession>,

    /// 마지막으로 보낸 (ACK 대기 중인) 청크 번호
    current_chunk: u32,

    /// 전송 범위 끝 (exclusive)
    end_chunk: u32,

    /// 현재 청크에 사용한 재전송 횟수
    retries_used: u32,
}

/// 서버측 연결 핸들러
///
/// 연결마다 하나씩 생성되며 레지스트리/파일 매니저는 서버 인스턴스가
/// 소유한 것을 Arc로 공유받는다.
pub struct ServerHandler {
    config: Config,
    file_manager: Arc<FileManager>,
    registry: Arc<SessionRegistry>,

    decoder: FrameDecoder,
    out: VecDeque<Bytes>,

    state: ServerState,
    client_id: String,
    next_seq: u32,
    transfer: Option<OutboundTransfer>,

    /// 마지막으로 완료된 전송의 전체 파일 다이제스트 (CHECKSUM_VERIFY 대조용)
    last_checksum: Option<[u8; 32]>,

    close_after_flush: bool,
}

impl ServerHandler {
    pub fn new(
        config: Config,
        file_manager: Arc<FileManager>,
        registry: Arc<SessionRegistry>,
    ) -> Self {
        Self {
            config,
            file_manager,
            registry,
            decoder: FrameDecoder::new(),
            out: VecDeque::new(),
            state: ServerState::Init,
            client_id: String::new(),
            next_seq: 0,
            transfer: None,
            last_checksum: None,
            close_after_flush: false,
        }
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    /// 보낼 바이트가 모두 나간 뒤 연결을 닫아야 하는지 여부
    pub fn wants_close(&self) -> bool {
        self.close_after_flush
    }

    /// 다음 송신 프레임 (없으면 None)
    pub fn poll_output(&mut self) -> Option<Bytes> {
        self.out.pop_front()
    }

    /// 수신 바이트 처리
    ///
    /// 완성된 프레임을 모두 소비한다. 프레임 에러는 치명적: ERROR 프레임을
    /// 큐잉하고 연결 종료를 표시한다.
    pub fn feed(&mut self, data: &[u8]) {
        self.decoder.extend(data);

        loop {
            if self.close_after_flush {
                return;
            }

            let frame = match self.decoder.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => return,
                Err(e) => {
                    warn!("프레임 에러: client={}: {}", self.client_id, e);
                    let err: Error = e.into();
                    self.send_error(&err);
                    self.fail();
                    return;
                }
            };

            // 서버 수신 프레임의 체크섬 불일치는 치명적
            if let Err(e) = frame.verify_checksum(self.config.digest) {
                warn!("프레임 체크섬 불일치: client={}: {}", self.client_id, e);
                let err: Error = e.into();
                self.send_error(&err);
                self.fail();
                return;
            }

            if let Err(e) = self.handle_frame(frame) {
                self.send_error(&e);
                if e.is_fatal() {
                    warn!("치명적 에러: client={}: {}", self.client_id, e);
                    self.fail();
                } else {
                    debug!("복구 가능 에러: client={}: {}", self.client_id, e);
                }
            }
        }
    }

    /// 연결 종료 시 정리
    ///
    /// 미완료 세션을 레지스트리에서 제거한다. 임시 파일 정리는 정책에
    /// 따라 유휴 스윕이 담당한다.
    pub fn on_disconnect(&mut self) {
        if let Some(transfer) = self.transfer.take() {
            self.registry.remove(transfer.session.id);
            info!(
                "연결 종료로 세션 정리: id={}, {:.1}% 전송",
                transfer.session.id,
                transfer.session.progress() * 100.0
            );
        }
    }

    fn handle_frame(&mut self, frame: Frame) -> Result<()> {
        let msg_type = frame.header.msg_type;
        debug!(
            "수신: state={:?}, msg_type={:?}, seq={}, chunk={}",
            self.state, msg_type, frame.header.sequence_number, frame.header.chunk_number
        );

        match (self.state, msg_type) {
            (ServerState::Init, MsgType::Handshake) => self.on_handshake(&frame),

            // COMPLETE는 HANDSHAKEN과 동일하게 추가 요청을 받는다
            (ServerState::Handshaken | ServerState::Complete, MsgType::FileRequest) => {
                let req: FileRequestPayload = decode_payload(&frame.payload)?;
                self.start_transfer(&req.filename, 0)
            }
            (ServerState::Handshaken | ServerState::Complete, MsgType::ResumeRequest) => {
                let req: ResumeRequestPayload = decode_payload(&frame.payload)?;
                self.start_transfer(&req.filename, req.start_chunk)
            }
            (ServerState::Handshaken | ServerState::Complete, MsgType::ListRequest) => {
                self.on_list_request()
            }
            (ServerState::Complete, MsgType::ChecksumVerify) => self.on_checksum_verify(&frame),

            (ServerState::Transferring, MsgType::Ack) => self.on_ack(&frame),

            // 클라이언트 에러 보고는 어느 상태에서든 받는다
            (_, MsgType::Error) => self.on_client_error(&frame),

            (state, msg_type) => Err(Error::Protocol {
                state: format!("{:?}", state),
                msg_type: format!("{:?}", msg_type),
            }),
        }
    }

    fn on_handshake(&mut self, frame: &Frame) -> Result<()> {
        let hs: HandshakePayload = decode_payload(&frame.payload)?;

        if hs.version != PROTOCOL_VERSION {
            // 페이로드 버전 불일치도 프레임 버전처럼 치명적으로 다룬다
            return Err(Error::Frame(crate::error::FrameError::InvalidVersion {
                expected: PROTOCOL_VERSION,
                got: hs.version,
            }));
        }

        self.client_id = hs.client_id;
        self.state = ServerState::Handshaken;
        info!("핸드셰이크 완료: client={}", self.client_id);

        let ack = encode_payload(&AckPayload {
            acked_sequence: frame.header.sequence_number,
        })?;
        self.push_frame(MsgType::Ack, 0, Bytes::from(ack));
        Ok(())
    }

    /// 전송 시작 (신규 요청은 start_chunk=0, 이어받기는 요청된 청크부터)
    fn start_transfer(&mut self, filename: &str, start_chunk: u32) -> Result<()> {
        let info = self.file_manager.file_info(filename)?;
        if info.is_directory {
            return Err(Error::NotFound {
                filename: filename.to_string(),
            });
        }

        let total_chunks = self.config.total_chunks(info.size);
        if start_chunk > total_chunks {
            return Err(Error::InvalidRange {
                start_chunk,
                total_chunks,
            });
        }

        let file_checksum = self
            .file_manager
            .file_checksum(&self.file_manager.resolve(filename)?, self.config.digest)?;

        let session = self.registry.create(
            self.client_id.clone(),
            filename.to_string(),
            info.size,
            self.config.chunk_size,
            total_chunks,
            TransferDirection::Outbound,
            self.file_manager.part_path(filename),
            self.file_manager.resolve(filename)?,
            file_checksum,
        );

        // 이어받기 전에 이미 받은 청크는 기록된 것으로 취급
        for n in 0..start_chunk {
            session.mark_chunk_received(n);
        }

        // 이어받기 메타데이터는 남은 바이트/청크 수를 보고한다
        let skipped = start_chunk as u64 * self.config.chunk_size as u64;
        let meta = encode_payload(&FileMetadataPayload {
            file_size: info.size.saturating_sub(skipped),
            total_chunks: total_chunks - start_chunk,
            chunk_size: self.config.chunk_size,
            file_checksum,
        })?;
        self.push_frame(MsgType::FileMetadata, 0, Bytes::from(meta));

        info!(
            "전송 시작: client={}, file={}, chunks={}..{}",
            self.client_id, filename, start_chunk, total_chunks
        );

        if start_chunk == total_chunks {
            // 빈 파일이거나 이미 전부 받은 이어받기: 보낼 데이터 없음
            self.finish_transfer(session);
            return Ok(());
        }

        self.transfer = Some(OutboundTransfer {
            session,
            current_chunk: start_chunk,
            end_chunk: total_chunks,
            retries_used: 0,
        });
        self.state = ServerState::Transferring;
        self.send_current_chunk()
    }

    /// 현재 청크의 FILE_DATA 송신
    fn send_current_chunk(&mut self) -> Result<()> {
        let (filename, chunk) = {
            let t = self.transfer.as_ref().ok_or(Error::ConnectionClosed)?;
            (t.session.filename.clone(), t.current_chunk)
        };
        let data = self.file_manager.read_chunk(&filename, chunk)?;
        self.push_frame(MsgType::FileData, chunk, data);
        Ok(())
    }

    fn on_ack(&mut self, frame: &Frame) -> Result<()> {
        let acked = frame.header.chunk_number;

        let done = {
            let Some(transfer) = self.transfer.as_mut() else {
                return Ok(());
            };

            if acked != transfer.current_chunk {
                return Err(Error::Protocol {
                    state: format!("Transferring(chunk={})", transfer.current_chunk),
                    msg_type: format!("Ack(chunk={})", acked),
                });
            }

            transfer.session.mark_chunk_received(acked);
            transfer.retries_used = 0;
            acked + 1 == transfer.end_chunk
        };

        if done {
            let transfer = self.transfer.take().ok_or(Error::ConnectionClosed)?;
            self.finish_transfer(transfer.session);
            return Ok(());
        }

        if let Some(transfer) = self.transfer.as_mut() {
            transfer.current_chunk = acked + 1;
        }
        self.send_current_chunk()
    }

    /// 클라이언트가 보고한 에러 처리
    ///
    /// 청크 체크섬 에러는 한도 내 재전송, 그 외 치명적 코드는 연결 종료.
    fn on_client_error(&mut self, frame: &Frame) -> Result<()> {
        let err: ErrorPayload = decode_payload(&frame.payload)?;

        if err.code == ErrorCode::Checksum {
            let transfer = self.transfer.as_mut().ok_or(Error::ConnectionClosed)?;
            if err.chunk_number != transfer.current_chunk {
                return Err(Error::Protocol {
                    state: format!("Transferring(chunk={})", transfer.current_chunk),
                    msg_type: format!("ChecksumError(chunk={})", err.chunk_number),
                });
            }

            if transfer.retries_used >= self.config.max_retries {
                return Err(Error::RetryExhausted {
                    chunk_number: err.chunk_number,
                    retries: self.config.max_retries,
                });
            }

            transfer.retries_used += 1;
            warn!(
                "청크 재전송: client={}, chunk={}, retry {}/{}",
                self.client_id, err.chunk_number, transfer.retries_used, self.config.max_retries
            );
            return self.send_current_chunk();
        }

        warn!(
            "클라이언트 에러 수신: code={:?}, detail={}",
            err.code, err.detail
        );
        if err.code.is_fatal() {
            self.fail();
        }
        Ok(())
    }

    fn on_checksum_verify(&mut self, frame: &Frame) -> Result<()> {
        let verify: ChecksumVerifyPayload = decode_payload(&frame.payload)?;
        let expected = self.last_checksum.ok_or_else(|| Error::Protocol {
            state: "Complete".into(),
            msg_type: "ChecksumVerify(없는 전송)".into(),
        })?;

        if verify.checksum != expected {
            return Err(Error::Integrity {
                expected: crate::wire::hex_prefix(&expected),
                got: crate::wire::hex_prefix(&verify.checksum),
            });
        }

        let ack = encode_payload(&AckPayload {
            acked_sequence: frame.header.sequence_number,
        })?;
        self.push_frame(MsgType::Ack, 0, Bytes::from(ack));
        Ok(())
    }

    fn on_list_request(&mut self) -> Result<()> {
        let entries: Vec<ListEntry> = self
            .file_manager
            .list_files(self.config.list_recursive)?
            .into_iter()
            .map(|f| ListEntry {
                name: f.name,
                size: f.size,
                mtime_secs: f
                    .modified
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or(0),
                is_dir: f.is_directory,
            })
            .collect();

        let payload = encode_payload(&ListResponsePayload { entries })?;
        self.push_frame(MsgType::ListResponse, 0, Bytes::from(payload));
        Ok(())
    }

    fn finish_transfer(&mut self, session: Arc<TransferSession>) {
        session.set_status(SessionStatus::Complete);
        self.last_checksum = Some(session.file_checksum);
        self.registry.remove(session.id);
        self.state = ServerState::Complete;
        info!(
            "전송 완료: client={}, file={}, chunks={}",
            self.client_id, session.filename, session.total_chunks
        );
    }

    fn send_error(&mut self, err: &Error) {
        let payload = ErrorPayload::new(err.error_code(), err.to_string());
        match encode_payload(&payload) {
            Ok(bytes) => self.push_frame(MsgType::Error, 0, Bytes::from(bytes)),
            Err(e) => warn!("에러 프레임 직렬화 실패: {}", e),
        }
    }

    /// 치명적 에러 처리: 세션 상태 기록 후 연결 종료 표시.
    /// 임시/진행 상태는 이어받기를 위해 보존된다.
    fn fail(&mut self) {
        if let Some(transfer) = self.transfer.take() {
            transfer.session.set_status(SessionStatus::Error);
            self.registry.remove(transfer.session.id);
        }
        self.state = ServerState::Error;
        self.close_after_flush = true;
    }

    fn push_frame(&mut self, msg_type: MsgType, chunk_number: u32, payload: Bytes) {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        let frame = Frame::new(msg_type, seq, chunk_number, payload, self.config.digest);
        self.out.push_back(frame.encode());
    }
}
