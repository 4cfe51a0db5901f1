//! 동시성 백엔드와 서버 파사드
//!
//! 하나의 `ServerHandler`를 네 가지 방식으로 스케줄링한다:
//!
//! - **Sequential**: 연결 하나를 끝까지 처리한 뒤 다음 accept
//! - **Threaded**: accept 루프가 crossbeam 채널로 고정 워커 풀에 전달
//! - **Multiplexed**: 단일 스레드 논블로킹, WouldBlock을 준비 신호로 사용
//! - **Async**: tokio current-thread 런타임, 파일 I/O가 섞인 feed는
//!   spawn_blocking으로 우회
//!
//! 어떤 백엔드든 와이어 동작은 동일하다. 핸들러가 sans-I/O라서 가능하다.

use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::file_manager::FileManager;
use crate::handler::ServerHandler;
use crate::session::SessionRegistry;

/// 백엔드 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Sequential,
    Threaded,
    Multiplexed,
    Async,
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "sequential" => Ok(BackendKind::Sequential),
            "threaded" => Ok(BackendKind::Threaded),
            "multiplexed" => Ok(BackendKind::Multiplexed),
            "async" => Ok(BackendKind::Async),
            other => Err(format!("알 수 없는 백엔드: {}", other)),
        }
    }
}

/// 백엔드가 공유하는 서버 상태
///
/// 레지스트리와 파일 매니저는 서버 인스턴스가 소유하고 Arc로 전달된다.
/// 전역 상태는 없다.
#[derive(Clone)]
struct ServeContext {
    config: Config,
    file_manager: Arc<FileManager>,
    registry: Arc<SessionRegistry>,
    shutdown: Arc<AtomicBool>,
}

impl ServeContext {
    fn stopping(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    fn new_handler(&self) -> ServerHandler {
        ServerHandler::new(
            self.config.clone(),
            self.file_manager.clone(),
            self.registry.clone(),
        )
    }

    /// 유휴 세션 정리: 레지스트리에서 제거하고 임시 파일을 삭제한다
    fn sweep(&self) {
        for session in self.registry.sweep_idle() {
            self.file_manager.discard_temp(&session);
        }
    }
}

/// 정리 주기 타이머
struct SweepTimer {
    last: Instant,
    interval: Duration,
}

impl SweepTimer {
    fn new(interval_ms: u64) -> Self {
        Self {
            last: Instant::now(),
            interval: Duration::from_millis(interval_ms),
        }
    }

    fn tick(&mut self, ctx: &ServeContext) {
        if self.last.elapsed() >= self.interval {
            ctx.sweep();
            self.last = Instant::now();
        }
    }
}

/// 블로킹 연결 서비스 (Sequential/Threaded 공용)
fn serve_blocking(stream: TcpStream, ctx: &ServeContext) -> Result<()> {
    let mut handler = ctx.new_handler();
    let result = pump_blocking(stream, ctx, &mut handler);
    handler.on_disconnect();
    result
}

fn pump_blocking(mut stream: TcpStream, ctx: &ServeContext, handler: &mut ServerHandler) -> Result<()> {
    // 종료 플래그를 주기적으로 확인할 수 있게 읽기 타임아웃을 건다
    stream.set_read_timeout(Some(Duration::from_millis(100)))?;
    let mut buf = vec![0u8; ctx.config.read_buffer_size];

    loop {
        while let Some(bytes) = handler.poll_output() {
            stream.write_all(&bytes)?;
        }
        if handler.wants_close() || ctx.stopping() {
            return Ok(());
        }

        match stream.read(&mut buf) {
            Ok(0) => return Ok(()),
            Ok(n) => handler.feed(&buf[..n]),
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {}
            Err(e) => return Err(e.into()),
        }
    }
}

/// 순차 백엔드: 연결 하나씩
fn run_sequential(listener: TcpListener, ctx: ServeContext) -> Result<()> {
    listener.set_nonblocking(true)?;
    let mut sweep = SweepTimer::new(ctx.config.sweep_interval_ms);

    while !ctx.stopping() {
        sweep.tick(&ctx);

        match listener.accept() {
            Ok((stream, peer)) => {
                debug!("연결 수락: {}", peer);
                stream.set_nonblocking(false)?;
                if let Err(e) = serve_blocking(stream, &ctx) {
                    debug!("연결 종료: {}: {}", peer, e);
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(e) => warn!("accept 실패: {}", e),
        }
    }
    Ok(())
}

/// 스레드 백엔드: accept 루프 + 고정 워커 풀
fn run_threaded(listener: TcpListener, ctx: ServeContext) -> Result<()> {
    listener.set_nonblocking(true)?;
    let (tx, rx) = crossbeam_channel::bounded::<TcpStream>(64);

    let mut workers = Vec::with_capacity(ctx.config.worker_threads);
    for i in 0..ctx.config.worker_threads {
        let rx = rx.clone();
        let ctx = ctx.clone();
        let worker = std::thread::Builder::new()
            .name(format!("cftp-worker-{}", i))
            .spawn(move || {
                while let Ok(stream) = rx.recv() {
                    let peer = stream.peer_addr().ok();
                    if let Err(e) = serve_blocking(stream, &ctx) {
                        debug!("연결 종료: {:?}: {}", peer, e);
                    }
                }
            })?;
        workers.push(worker);
    }
    drop(rx);

    let mut sweep = SweepTimer::new(ctx.config.sweep_interval_ms);
    while !ctx.stopping() {
        sweep.tick(&ctx);

        match listener.accept() {
            Ok((stream, peer)) => {
                debug!("연결 수락: {}", peer);
                stream.set_nonblocking(false)?;
                if tx.send(stream).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(e) => warn!("accept 실패: {}", e),
        }
    }

    // 채널을 닫으면 워커가 큐를 비운 뒤 종료한다
    drop(tx);
    for worker in workers {
        let _ = worker.join();
    }
    Ok(())
}

/// 멀티플렉스 백엔드의 연결 하나
struct MuxConn {
    stream: TcpStream,
    peer: SocketAddr,
    handler: ServerHandler,
    pending: VecDeque<bytes::Bytes>,
    write_offset: usize,
}

impl MuxConn {
    /// 읽기/쓰기 한 차례 진행
    ///
    /// 반환: (연결 유지 여부, 진행 여부). WouldBlock은 준비 안 됨 신호로만
    /// 쓰고 에러로 다루지 않는다.
    fn pump(&mut self, buf: &mut [u8]) -> (bool, bool) {
        let mut progressed = false;

        loop {
            match self.stream.read(buf) {
                Ok(0) => return self.close("클라이언트 종료"),
                Ok(n) => {
                    self.handler.feed(&buf[..n]);
                    progressed = true;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => return self.close(&e.to_string()),
            }
        }

        while let Some(bytes) = self.handler.poll_output() {
            self.pending.push_back(bytes);
        }

        while let Some(front) = self.pending.front() {
            match self.stream.write(&front[self.write_offset..]) {
                Ok(n) => {
                    self.write_offset += n;
                    progressed = true;
                    if self.write_offset == front.len() {
                        self.pending.pop_front();
                        self.write_offset = 0;
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => return self.close(&e.to_string()),
            }
        }

        if self.handler.wants_close() && self.pending.is_empty() {
            return self.close("핸들러 종료 요청");
        }
        (true, progressed)
    }

    fn close(&mut self, reason: &str) -> (bool, bool) {
        debug!("연결 종료: {}: {}", self.peer, reason);
        self.handler.on_disconnect();
        (false, true)
    }
}

/// 멀티플렉스 백엔드: 단일 스레드 논블로킹 폴링 루프
fn run_multiplexed(listener: TcpListener, ctx: ServeContext) -> Result<()> {
    listener.set_nonblocking(true)?;
    let mut conns: Vec<MuxConn> = Vec::new();
    let mut buf = vec![0u8; ctx.config.read_buffer_size];
    let mut sweep = SweepTimer::new(ctx.config.sweep_interval_ms);

    while !ctx.stopping() {
        sweep.tick(&ctx);
        let mut progressed = false;

        match listener.accept() {
            Ok((stream, peer)) => {
                debug!("연결 수락: {}", peer);
                stream.set_nonblocking(true)?;
                conns.push(MuxConn {
                    stream,
                    peer,
                    handler: ctx.new_handler(),
                    pending: VecDeque::new(),
                    write_offset: 0,
                });
                progressed = true;
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => warn!("accept 실패: {}", e),
        }

        conns.retain_mut(|conn| {
            let (keep, moved) = conn.pump(&mut buf);
            progressed |= moved;
            keep
        });

        if !progressed {
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    for conn in &mut conns {
        conn.handler.on_disconnect();
    }
    Ok(())
}

/// 비동기 연결 서비스
///
/// 소켓 읽기/쓰기는 await 지점, 파일 I/O가 포함된 feed는 blocking 풀로
/// 보내 다른 연결을 굶기지 않는다.
async fn serve_async(mut stream: tokio::net::TcpStream, ctx: ServeContext) -> Result<()> {
    let mut handler = ctx.new_handler();
    let mut buf = vec![0u8; ctx.config.read_buffer_size];

    loop {
        while let Some(bytes) = handler.poll_output() {
            stream.write_all(&bytes).await?;
        }
        if handler.wants_close() {
            break;
        }

        let n = stream.read(&mut buf).await?;
        if n == 0 {
            break;
        }

        let data = buf[..n].to_vec();
        handler = tokio::task::spawn_blocking(move || {
            let mut handler = handler;
            handler.feed(&data);
            handler
        })
        .await
        .map_err(|_| Error::ChannelError)?;
    }

    handler.on_disconnect();
    Ok(())
}

/// 비동기 백엔드: current-thread tokio 런타임
fn run_async(listener: TcpListener, ctx: ServeContext) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        listener.set_nonblocking(true)?;
        let listener = tokio::net::TcpListener::from_std(listener)?;
        let mut sweep =
            tokio::time::interval(Duration::from_millis(ctx.config.sweep_interval_ms.max(1)));

        while !ctx.stopping() {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("연결 수락: {}", peer);
                        let ctx = ctx.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve_async(stream, ctx).await {
                                debug!("연결 종료: {}: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => warn!("accept 실패: {}", e),
                },
                _ = sweep.tick() => ctx.sweep(),
                _ = tokio::time::sleep(Duration::from_millis(50)) => {}
            }
        }
        Ok(())
    })
}

/// 서버 상태 스냅샷
#[derive(Debug, Clone)]
pub struct ServerStatus {
    pub running: bool,
    pub backend: BackendKind,
    pub local_addr: SocketAddr,
    pub active_sessions: usize,
}

/// 서버 파사드
///
/// 리스너를 바인딩하고 선택한 백엔드를 배경 스레드에서 돌린다.
/// 레지스트리/파일 매니저는 이 인스턴스가 소유한다.
pub struct Server {
    backend: BackendKind,
    local_addr: SocketAddr,
    registry: Arc<SessionRegistry>,
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Server {
    /// 서버 시작 (바인딩 후 즉시 반환)
    pub fn start(addr: impl ToSocketAddrs, config: Config, backend: BackendKind) -> Result<Self> {
        let listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;

        let file_manager = Arc::new(FileManager::new(
            &config.root_dir,
            &config.temp_dir,
            config.chunk_size,
        )?);
        let registry = Arc::new(SessionRegistry::new(Duration::from_millis(
            config.session_timeout_ms,
        )));
        let shutdown = Arc::new(AtomicBool::new(false));

        let ctx = ServeContext {
            config,
            file_manager,
            registry: registry.clone(),
            shutdown: shutdown.clone(),
        };

        info!("서버 시작: addr={}, backend={:?}", local_addr, backend);
        let thread = std::thread::Builder::new()
            .name("cftp-server".into())
            .spawn(move || {
                let result = match backend {
                    BackendKind::Sequential => run_sequential(listener, ctx),
                    BackendKind::Threaded => run_threaded(listener, ctx),
                    BackendKind::Multiplexed => run_multiplexed(listener, ctx),
                    BackendKind::Async => run_async(listener, ctx),
                };
                if let Err(e) = result {
                    error!("백엔드 종료: {}", e);
                }
            })?;

        Ok(Self {
            backend,
            local_addr,
            registry,
            shutdown,
            thread: Some(thread),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// 현재 상태 스냅샷
    pub fn status(&self) -> ServerStatus {
        ServerStatus {
            running: self.thread.is_some() && !self.shutdown.load(Ordering::Relaxed),
            backend: self.backend,
            local_addr: self.local_addr,
            active_sessions: self.registry.len(),
        }
    }

    /// 서버 정지 (배경 스레드 합류까지 대기)
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
            info!("서버 정지: addr={}", self.local_addr);
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::FileClient;
    use std::fs;

    fn start_server(backend: BackendKind, dir: &std::path::Path) -> Server {
        let mut config = Config::with_dirs(dir.join("root"), dir.join("root/_temp"));
        config.sweep_interval_ms = 50;
        Server::start("127.0.0.1:0", config, backend).unwrap()
    }

    fn client_config(dir: &std::path::Path, tag: &str) -> Config {
        Config::with_dirs(
            dir.join(format!("dl-{}", tag)),
            dir.join(format!("dl-{}/_temp", tag)),
        )
    }

    /// 백엔드 하나로 실제 소켓 왕복: 목록 조회 + 다운로드 + 내용 검증
    fn roundtrip(backend: BackendKind) {
        let dir = tempfile::tempdir().unwrap();
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 239) as u8).collect();

        let mut server = start_server(backend, dir.path());
        fs::write(dir.path().join("root/data.bin"), &data).unwrap();

        let mut client =
            FileClient::connect(server.local_addr(), client_config(dir.path(), "a")).unwrap();

        let entries = client.list().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "data.bin");
        assert_eq!(entries[0].size, data.len() as u64);

        let path = client.download("data.bin").unwrap();
        assert_eq!(fs::read(&path).unwrap(), data);

        // 없는 파일은 에러, 연결은 살아서 재시도 가능
        match client.download("ghost.bin") {
            Err(Error::Remote { code, .. }) => {
                assert_eq!(code, crate::message::ErrorCode::NotFound)
            }
            other => panic!("unexpected: {:?}", other),
        }
        let path = client.download("data.bin").unwrap();
        assert_eq!(fs::read(&path).unwrap(), data);

        server.stop();
        assert!(!server.status().running);
    }

    #[test]
    fn test_sequential_backend_roundtrip() {
        roundtrip(BackendKind::Sequential);
    }

    #[test]
    fn test_threaded_backend_roundtrip() {
        roundtrip(BackendKind::Threaded);
    }

    #[test]
    fn test_multiplexed_backend_roundtrip() {
        roundtrip(BackendKind::Multiplexed);
    }

    #[test]
    fn test_async_backend_roundtrip() {
        roundtrip(BackendKind::Async);
    }

    /// 스레드 백엔드에서 동시 클라이언트 4개
    #[test]
    fn test_threaded_concurrent_clients() {
        let dir = tempfile::tempdir().unwrap();
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();

        let mut server = start_server(BackendKind::Threaded, dir.path());
        fs::write(dir.path().join("root/shared.bin"), &data).unwrap();

        let addr = server.local_addr();
        let mut handles = Vec::new();
        for t in 0..4 {
            let config = client_config(dir.path(), &format!("t{}", t));
            let expected = data.clone();
            handles.push(std::thread::spawn(move || {
                let mut client = FileClient::connect(addr, config).unwrap();
                let path = client.download("shared.bin").unwrap();
                assert_eq!(fs::read(&path).unwrap(), expected);
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        server.stop();
    }

    /// 멀티플렉스 백엔드에서 동시 클라이언트 (단일 스레드 인터리빙)
    #[test]
    fn test_multiplexed_concurrent_clients() {
        let dir = tempfile::tempdir().unwrap();
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 241) as u8).collect();

        let mut server = start_server(BackendKind::Multiplexed, dir.path());
        fs::write(dir.path().join("root/shared.bin"), &data).unwrap();

        let addr = server.local_addr();
        let mut handles = Vec::new();
        for t in 0..3 {
            let config = client_config(dir.path(), &format!("m{}", t));
            let expected = data.clone();
            handles.push(std::thread::spawn(move || {
                let mut client = FileClient::connect(addr, config).unwrap();
                let path = client.download("shared.bin").unwrap();
                assert_eq!(fs::read(&path).unwrap(), expected);
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        server.stop();
    }

    /// 이어받기: 전반부만 가진 part 파일에서 재개해 전체 완성
    #[test]
    fn test_resume_over_socket() {
        let dir = tempfile::tempdir().unwrap();
        let data: Vec<u8> = (0..8192u32 * 8).map(|i| (i % 233) as u8).collect();

        let mut server = start_server(BackendKind::Sequential, dir.path());
        fs::write(dir.path().join("root/big.bin"), &data).unwrap();

        let config = client_config(dir.path(), "r");
        fs::create_dir_all(config.temp_dir.as_path()).unwrap();
        // 전반부 4청크를 이미 받아둔 상태를 재현
        fs::write(config.temp_dir.join("big.bin.part"), &data[..8192 * 4]).unwrap();

        let mut client = FileClient::connect(server.local_addr(), config).unwrap();
        let path = client.resume("big.bin").unwrap();
        assert_eq!(fs::read(&path).unwrap(), data);

        server.stop();
    }

    #[test]
    fn test_status_reports_backend() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = start_server(BackendKind::Async, dir.path());

        let status = server.status();
        assert!(status.running);
        assert_eq!(status.backend, BackendKind::Async);
        assert_eq!(status.active_sessions, 0);

        server.stop();
        assert!(!server.status().running);
    }

    #[test]
    fn test_backend_kind_parsing() {
        assert_eq!(
            "sequential".parse::<BackendKind>().unwrap(),
            BackendKind::Sequential
        );
        assert_eq!("async".parse::<BackendKind>().unwrap(), BackendKind::Async);
        assert!("fancy".parse::<BackendKind>().is_err());
    }
}
