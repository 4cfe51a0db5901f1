//! 클라이언트측 상태 머신과 블로킹 클라이언트
//!
//! `ClientHandler`는 서버 핸들러와 같은 sans-I/O 계약(feed / poll_output /
//! wants_close)을 따른다. `FileClient`는 그 위에 TcpStream을 얹은 블로킹
//! 래퍼로, CLI 바이너리가 사용한다.
//!
//! 수신 흐름: HANDSHAKE → (요청) → FILE_METADATA → FILE_DATA × N (청크마다
//! 다이제스트 검증 후 ACK, 불일치면 CHECKSUM 에러로 재전송 요청) →
//! 전체 파일 검증/이동 → CHECKSUM_VERIFY → ACK.
//!
//! 이어받기: part 파일 크기에서 시작 청크를 계산해 RESUME_REQUEST를 보낸다.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

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

/// 클라이언트 연결 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// 핸드셰이크 ACK 대기
    AwaitingHandshake,

    /// 요청 가능
    Idle,

    /// FILE_METADATA 대기
    AwaitingMetadata,

    /// FILE_DATA 수신 중
    Receiving,

    /// CHECKSUM_VERIFY의 ACK 대기
    AwaitingVerify,

    /// LIST_RESPONSE 대기
    AwaitingList,

    /// 치명적 에러 (연결 종료)
    Error,
}

/// 진행 중인 수신 전송
#[derive(Debug)]
struct InboundTransfer {
    session: Arc<TransferSession>,

    /// 다음에 기대하는 청크 번호 (절대 번호)
    expected_chunk: u32,

    /// 전체 청크 수 (이어받기여도 파일 전체 기준)
    end_chunk: u32,

    /// 현재 청크에 보낸 재전송 요청 횟수
    retries_used: u32,
}

/// 클라이언트측 연결 핸들러 (sans-I/O)
pub struct ClientHandler {
    config: Config,
    file_manager: Arc<FileManager>,
    registry: Arc<SessionRegistry>,

    decoder: FrameDecoder,
    out: VecDeque<Bytes>,

    state: ClientState,
    next_seq: u32,

    /// 요청 후 메타데이터 대기 중인 (파일명, 시작 청크)
    pending_request: Option<(String, u32)>,
    transfer: Option<InboundTransfer>,

    listing: Option<Vec<ListEntry>>,
    completed: Option<PathBuf>,
    last_error: Option<(ErrorCode, String)>,
    close_after_flush: bool,
}

impl ClientHandler {
    /// 새 핸들러 생성 (HANDSHAKE 프레임이 즉시 큐잉된다)
    pub fn new(
        config: Config,
        file_manager: Arc<FileManager>,
        registry: Arc<SessionRegistry>,
        client_id: String,
    ) -> Result<Self> {
        let mut handler = Self {
            config,
            file_manager,
            registry,
            decoder: FrameDecoder::new(),
            out: VecDeque::new(),
            state: ClientState::AwaitingHandshake,
            next_seq: 0,
            pending_request: None,
            transfer: None,
            listing: None,
            completed: None,
            last_error: None,
            close_after_flush: false,
        };

        let hs = encode_payload(&HandshakePayload {
            version: PROTOCOL_VERSION,
            client_id,
        })?;
        handler.push_frame(MsgType::Handshake, 0, Bytes::from(hs));
        Ok(handler)
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn wants_close(&self) -> bool {
        self.close_after_flush
    }

    pub fn poll_output(&mut self) -> Option<Bytes> {
        self.out.pop_front()
    }

    /// 완료된 다운로드의 최종 경로
    pub fn take_completed(&mut self) -> Option<PathBuf> {
        self.completed.take()
    }

    /// 마지막 에러 (서버 보고 또는 로컬)
    pub fn take_error(&mut self) -> Option<(ErrorCode, String)> {
        self.last_error.take()
    }

    pub fn take_listing(&mut self) -> Option<Vec<ListEntry>> {
        self.listing.take()
    }

    /// 현재 전송 진행률 (전송 중이 아니면 None)
    pub fn progress(&self) -> Option<f64> {
        self.transfer.as_ref().map(|t| t.session.progress())
    }

    /// 파일 다운로드 요청 (Idle에서만 유효)
    pub fn request_file(&mut self, filename: &str) -> Result<()> {
        self.ensure_idle("FileRequest")?;
        let payload = encode_payload(&FileRequestPayload {
            filename: filename.to_string(),
        })?;
        self.push_frame(MsgType::FileRequest, 0, Bytes::from(payload));
        self.pending_request = Some((filename.to_string(), 0));
        self.state = ClientState::AwaitingMetadata;
        Ok(())
    }

    /// 이어받기 요청
    pub fn request_resume(&mut self, filename: &str, start_chunk: u32) -> Result<()> {
        self.ensure_idle("ResumeRequest")?;
        let payload = encode_payload(&ResumeRequestPayload {
            filename: filename.to_string(),
            start_chunk,
        })?;
        self.push_frame(MsgType::ResumeRequest, 0, Bytes::from(payload));
        self.pending_request = Some((filename.to_string(), start_chunk));
        self.state = ClientState::AwaitingMetadata;
        Ok(())
    }

    /// 파일 목록 요청
    pub fn request_list(&mut self) -> Result<()> {
        self.ensure_idle("ListRequest")?;
        self.push_frame(MsgType::ListRequest, 0, Bytes::new());
        self.state = ClientState::AwaitingList;
        Ok(())
    }

    fn ensure_idle(&self, what: &str) -> Result<()> {
        if self.state != ClientState::Idle {
            return Err(Error::Protocol {
                state: format!("{:?}", self.state),
                msg_type: what.to_string(),
            });
        }
        Ok(())
    }

    /// 수신 바이트 처리
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
                    warn!("프레임 에러: {}", e);
                    self.last_error = Some((ErrorCode::Frame, e.to_string()));
                    self.fail();
                    return;
                }
            };

            // FILE_DATA의 체크섬 불일치는 재전송 요청, 그 외 프레임은 치명적
            let computed = self.config.digest.digest(&frame.payload);
            if computed != frame.header.checksum {
                if frame.header.msg_type == MsgType::FileData
                    && self.state == ClientState::Receiving
                {
                    self.on_corrupt_chunk(&frame, computed);
                    continue;
                }
                self.last_error = Some((ErrorCode::Frame, "체크섬 불일치".into()));
                self.fail();
                return;
            }

            if let Err(e) = self.handle_frame(frame) {
                self.last_error = Some((e.error_code(), e.to_string()));
                if e.is_fatal() {
                    warn!("치명적 에러: {}", e);
                    self.fail();
                } else {
                    debug!("복구 가능 에러: {}", e);
                    self.abort_to_idle();
                }
            }
        }
    }

    /// 연결 종료 시 정리 (part 파일은 이어받기용으로 보존)
    pub fn on_disconnect(&mut self) {
        if let Some(transfer) = self.transfer.take() {
            transfer.session.set_status(SessionStatus::Error);
            self.registry.remove(transfer.session.id);
            info!(
                "연결 종료: {} {:.1}% 수신, part 파일 보존",
                transfer.session.filename,
                transfer.session.progress() * 100.0
            );
        }
    }

    fn handle_frame(&mut self, frame: Frame) -> Result<()> {
        let msg_type = frame.header.msg_type;
        debug!(
            "수신: state={:?}, msg_type={:?}, chunk={}",
            self.state, msg_type, frame.header.chunk_number
        );

        match (self.state, msg_type) {
            (ClientState::AwaitingHandshake, MsgType::Ack) => {
                self.state = ClientState::Idle;
                debug!("핸드셰이크 완료");
                Ok(())
            }
            (ClientState::AwaitingMetadata, MsgType::FileMetadata) => self.on_metadata(&frame),
            (ClientState::Receiving, MsgType::FileData) => self.on_file_data(&frame),
            (ClientState::AwaitingVerify, MsgType::Ack) => {
                self.state = ClientState::Idle;
                debug!("전체 파일 검증 확인");
                Ok(())
            }
            (ClientState::AwaitingList, MsgType::ListResponse) => {
                let list: ListResponsePayload = decode_payload(&frame.payload)?;
                self.listing = Some(list.entries);
                self.state = ClientState::Idle;
                Ok(())
            }
            (_, MsgType::Error) => self.on_server_error(&frame),

            (state, msg_type) => Err(Error::Protocol {
                state: format!("{:?}", state),
                msg_type: format!("{:?}", msg_type),
            }),
        }
    }

    fn on_metadata(&mut self, frame: &Frame) -> Result<()> {
        let meta: FileMetadataPayload = decode_payload(&frame.payload)?;
        let (filename, start_chunk) = self
            .pending_request
            .take()
            .ok_or(Error::ConnectionClosed)?;

        // 이어받기 메타데이터는 남은 양을 보고하므로 전체 기준으로 환산
        let skipped = start_chunk as u64 * meta.chunk_size as u64;
        let total_chunks = start_chunk + meta.total_chunks;
        let file_size = skipped + meta.file_size;

        let final_path = self.file_manager.resolve(&filename)?;
        let session = self.registry.create(
            String::new(),
            filename.clone(),
            file_size,
            meta.chunk_size,
            total_chunks,
            TransferDirection::Inbound,
            self.file_manager.part_path(&filename),
            final_path,
            meta.file_checksum,
        );

        if start_chunk == 0 {
            // 신규 다운로드: 이전 시도의 part 파일이 있으면 버린다
            self.file_manager.discard_temp(&session);
        }
        for n in 0..start_chunk {
            session.mark_chunk_received(n);
        }

        info!(
            "수신 시작: file={}, size={}, chunks={}..{}",
            filename, file_size, start_chunk, total_chunks
        );

        if start_chunk == total_chunks {
            // 빈 파일 또는 이미 전부 받은 이어받기
            if total_chunks == 0 {
                self.file_manager.create_temp(&session)?;
            }
            return self.complete_transfer(session);
        }

        self.transfer = Some(InboundTransfer {
            session,
            expected_chunk: start_chunk,
            end_chunk: total_chunks,
            retries_used: 0,
        });
        self.state = ClientState::Receiving;
        Ok(())
    }

    fn on_file_data(&mut self, frame: &Frame) -> Result<()> {
        let chunk = frame.header.chunk_number;

        let done = {
            let transfer = self.transfer.as_mut().ok_or(Error::ConnectionClosed)?;
            if chunk != transfer.expected_chunk {
                return Err(Error::Protocol {
                    state: format!("Receiving(expected={})", transfer.expected_chunk),
                    msg_type: format!("FileData(chunk={})", chunk),
                });
            }

            self.file_manager
                .write_chunk(&transfer.session, chunk, &frame.payload)?;
            transfer.retries_used = 0;
            transfer.expected_chunk = chunk + 1;
            transfer.expected_chunk == transfer.end_chunk
        };

        let ack = encode_payload(&AckPayload {
            acked_sequence: frame.header.sequence_number,
        })?;
        self.push_frame(MsgType::Ack, chunk, Bytes::from(ack));

        if done {
            let transfer = self.transfer.take().ok_or(Error::ConnectionClosed)?;
            return self.complete_transfer(transfer.session);
        }
        Ok(())
    }

    /// 청크 체크섬 불일치: 재전송 요청 (한도 초과 시 로컬에서 포기)
    fn on_corrupt_chunk(&mut self, frame: &Frame, computed: [u8; 32]) {
        let chunk = frame.header.chunk_number;

        let exhausted = match self.transfer.as_mut() {
            Some(t) => {
                t.retries_used += 1;
                t.retries_used > self.config.max_retries
            }
            None => true,
        };
        if exhausted {
            self.last_error = Some((
                ErrorCode::RetryExhausted,
                format!("청크 {} 재전송 한도 초과", chunk),
            ));
            self.fail();
            return;
        }

        warn!("청크 체크섬 불일치, 재전송 요청: chunk={}", chunk);
        let payload = ErrorPayload::checksum_error(chunk, frame.header.checksum, computed);
        match encode_payload(&payload) {
            Ok(bytes) => self.push_frame(MsgType::Error, chunk, Bytes::from(bytes)),
            Err(e) => warn!("에러 프레임 직렬화 실패: {}", e),
        }
    }

    /// 전체 파일 검증 + 최종 경로 이동, 성공 시 CHECKSUM_VERIFY 송신
    ///
    /// 검증 실패 시 part 파일은 보존된다 (file_manager::finalize 참고).
    fn complete_transfer(&mut self, session: Arc<TransferSession>) -> Result<()> {
        if let Err(e) = self.file_manager.finalize(&session, self.config.digest) {
            session.set_status(SessionStatus::Error);
            self.registry.remove(session.id);
            return Err(e);
        }

        session.set_status(SessionStatus::Complete);
        self.registry.remove(session.id);
        self.completed = Some(session.final_path.clone());

        let verify = encode_payload(&ChecksumVerifyPayload {
            checksum: session.file_checksum,
        })?;
        self.push_frame(MsgType::ChecksumVerify, 0, Bytes::from(verify));
        self.state = ClientState::AwaitingVerify;
        Ok(())
    }

    fn on_server_error(&mut self, frame: &Frame) -> Result<()> {
        let err: ErrorPayload = decode_payload(&frame.payload)?;
        warn!("서버 에러: code={:?}, detail={}", err.code, err.detail);
        self.last_error = Some((err.code, err.detail));

        if err.code.is_fatal() {
            self.fail();
        } else {
            self.abort_to_idle();
        }
        Ok(())
    }

    /// 복구 가능 에러: 진행 중 요청을 접고 Idle로 복귀 (연결 유지)
    fn abort_to_idle(&mut self) {
        self.pending_request = None;
        if let Some(transfer) = self.transfer.take() {
            transfer.session.set_status(SessionStatus::Error);
            self.registry.remove(transfer.session.id);
        }
        if self.state != ClientState::Error {
            self.state = ClientState::Idle;
        }
    }

    fn fail(&mut self) {
        if let Some(transfer) = self.transfer.take() {
            transfer.session.set_status(SessionStatus::Error);
            self.registry.remove(transfer.session.id);
        }
        self.state = ClientState::Error;
        self.close_after_flush = true;
    }

    fn push_frame(&mut self, msg_type: MsgType, chunk_number: u32, payload: Bytes) {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        let frame = Frame::new(msg_type, seq, chunk_number, payload, self.config.digest);
        self.out.push_back(frame.encode());
    }
}

/// 블로킹 파일 클라이언트
///
/// TcpStream 위에서 `ClientHandler`를 구동한다. 요청 하나를 보내고
/// Idle로 돌아올 때까지 펌프를 돌리는 단순한 동기 모델.
pub struct FileClient {
    stream: TcpStream,
    handler: ClientHandler,
    file_manager: Arc<FileManager>,
    read_buf: Vec<u8>,
}

impl FileClient {
    /// 서버 접속 + 핸드셰이크
    pub fn connect(addr: impl ToSocketAddrs, config: Config) -> Result<Self> {
        let stream = TcpStream::connect(addr)?;
        let _ = stream.set_nodelay(true);

        let file_manager = Arc::new(FileManager::new(
            &config.root_dir,
            &config.temp_dir,
            config.chunk_size,
        )?);
        let registry = Arc::new(SessionRegistry::new(Duration::from_millis(
            config.session_timeout_ms,
        )));
        let client_id = format!("cftp-{:08x}", rand::random::<u32>());
        let read_buf = vec![0u8; config.read_buffer_size];

        let handler = ClientHandler::new(config, file_manager.clone(), registry, client_id)?;
        let mut client = Self {
            stream,
            handler,
            file_manager,
            read_buf,
        };
        client.run_to_idle()?;
        Ok(client)
    }

    /// 파일 다운로드, 최종 경로 반환
    pub fn download(&mut self, filename: &str) -> Result<PathBuf> {
        self.handler.request_file(filename)?;
        self.run_to_idle()?;
        self.handler.take_completed().ok_or_else(|| self.remote_error())
    }

    /// 이어받기 (part 파일 크기에서 시작 청크 자동 계산)
    pub fn resume(&mut self, filename: &str) -> Result<PathBuf> {
        let start_chunk = self.file_manager.resume_point(filename);
        self.handler.request_resume(filename, start_chunk)?;
        self.run_to_idle()?;
        self.handler.take_completed().ok_or_else(|| self.remote_error())
    }

    /// 서버 파일 목록 조회
    pub fn list(&mut self) -> Result<Vec<ListEntry>> {
        self.handler.request_list()?;
        self.run_to_idle()?;
        self.handler.take_listing().ok_or_else(|| self.remote_error())
    }

    fn remote_error(&mut self) -> Error {
        match self.handler.take_error() {
            Some((code, detail)) => Error::Remote { code, detail },
            None => Error::ConnectionClosed,
        }
    }

    fn run_to_idle(&mut self) -> Result<()> {
        loop {
            while let Some(bytes) = self.handler.poll_output() {
                self.stream.write_all(&bytes)?;
            }

            match self.handler.state() {
                ClientState::Idle => return Ok(()),
                ClientState::Error => return Err(self.remote_error()),
                _ => {}
            }
            if self.handler.wants_close() {
                return Err(self.remote_error());
            }

            let n = self.stream.read(&mut self.read_buf)?;
            if n == 0 {
                self.handler.on_disconnect();
                return Err(Error::ConnectionClosed);
            }
            self.handler.feed(&self.read_buf[..n]);
        }
    }
}
