//! 전송 세션과 세션 레지스트리
//!
//! - 레지스트리 뮤텍스는 맵 삽입/조회/삭제 동안만 잡는다 (I/O 중 금지)
//! - 세션별 가변 상태는 세션이 소유한 뮤텍스로 보호 (세션 간 병렬성 유지)

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

/// 세션 ID (64비트, 프로세스 내 유일)
pub type SessionId = u64;

/// 세션 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// 전송 진행 중
    Transferring,

    /// 전송 완료 (임시 파일은 최종 경로로 이동됨)
    Complete,

    /// 복구 불가 에러 (임시 파일은 이어받기용으로 보존)
    Error,
}

/// 전송 방향
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    /// 서빙 (루트 디렉터리에서 읽어 전송)
    Outbound,

    /// 수신 (임시 파일에 기록 후 최종 경로로 이동)
    Inbound,
}

/// 세션별 가변 상태
#[derive(Debug)]
struct SessionState {
    chunks_received: HashSet<u32>,
    status: SessionStatus,
    last_active: Instant,
}

/// 전송 세션
///
/// 불변 식별 필드는 생성 시 고정, 가변 상태만 세션 뮤텍스 뒤에 둔다.
#[derive(Debug)]
pub struct TransferSession {
    /// 세션 ID
    pub id: SessionId,

    /// 클라이언트 식별자
    pub client_id: String,

    /// 파일명 (루트 디렉터리 기준 상대 경로)
    pub filename: String,

    /// 전체 파일 크기 (바이트)
    pub file_size: u64,

    /// 청크 크기 (바이트)
    pub chunk_size: u32,

    /// 총 청크 수
    pub total_chunks: u32,

    /// 전송 방향
    pub direction: TransferDirection,

    /// 임시 파일 경로 (수신 세션)
    pub temp_path: PathBuf,

    /// 최종 파일 경로
    pub final_path: PathBuf,

    /// 전체 파일 다이제스트
    pub file_checksum: [u8; 32],

    state: Mutex<SessionState>,
}

impl TransferSession {
    /// 청크 수신/확인 기록
    ///
    /// 반환값: 새로 기록되었으면 true (중복이면 false)
    pub fn mark_chunk_received(&self, chunk_number: u32) -> bool {
        debug_assert!(chunk_number < self.total_chunks || self.total_chunks == 0);
        let mut state = self.state.lock();
        state.last_active = Instant::now();
        state.chunks_received.insert(chunk_number)
    }

    /// 기록된 청크 수
    pub fn received_count(&self) -> u32 {
        self.state.lock().chunks_received.len() as u32
    }

    /// 모든 청크가 기록되었는지 여부
    pub fn is_complete(&self) -> bool {
        self.received_count() == self.total_chunks
    }

    /// 누락된 청크 번호 목록 (오름차순)
    pub fn missing_chunks(&self) -> Vec<u32> {
        let state = self.state.lock();
        (0..self.total_chunks)
            .filter(|n| !state.chunks_received.contains(n))
            .collect()
    }

    /// 진행률 (0.0 ~ 1.0)
    pub fn progress(&self) -> f64 {
        if self.total_chunks == 0 {
            return 1.0;
        }
        self.received_count() as f64 / self.total_chunks as f64
    }

    /// 현재 상태
    pub fn status(&self) -> SessionStatus {
        self.state.lock().status
    }

    /// 상태 변경
    pub fn set_status(&self, status: SessionStatus) {
        let mut state = self.state.lock();
        state.status = status;
        state.last_active = Instant::now();
    }

    /// 활동 시각 갱신
    pub fn touch(&self) {
        self.state.lock().last_active = Instant::now();
    }

    /// 마지막 활동 이후 경과 시간
    pub fn idle_for(&self) -> Duration {
        self.state.lock().last_active.elapsed()
    }
}

/// 세션 레지스트리
///
/// 서버 인스턴스가 소유하는 명시적 상태 객체. 전역이 아니라 참조로
/// 각 연결 핸들러에 전달된다.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionId, Arc<TransferSession>>>,
    next_id: AtomicU64,
    idle_timeout: Duration,
}

impl SessionRegistry {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            idle_timeout,
        }
    }

    /// 새 세션 생성 (충돌 없는 ID 발급)
    ///
    /// temp_path 키잉은 호출자 몫: 수신측은 이어받기를 위해 파일명 기반
    /// `{basename}.part`를 쓴다.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        &self,
        client_id: String,
        filename: String,
        file_size: u64,
        chunk_size: u32,
        total_chunks: u32,
        direction: TransferDirection,
        temp_path: PathBuf,
        final_path: PathBuf,
        file_checksum: [u8; 32],
    ) -> Arc<TransferSession> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        let session = Arc::new(TransferSession {
            id,
            client_id,
            filename,
            file_size,
            chunk_size,
            total_chunks,
            direction,
            temp_path,
            final_path,
            file_checksum,
            state: Mutex::new(SessionState {
                chunks_received: HashSet::new(),
                status: SessionStatus::Transferring,
                last_active: Instant::now(),
            }),
        });

        self.sessions.lock().insert(id, session.clone());
        debug!("세션 생성: id={}, file={}", id, session.filename);
        session
    }

    /// 세션 조회 (활동 시각 갱신)
    pub fn get(&self, id: SessionId) -> Option<Arc<TransferSession>> {
        let session = self.sessions.lock().get(&id).cloned();
        if let Some(ref s) = session {
            s.touch();
        }
        session
    }

    /// 세션 제거
    pub fn remove(&self, id: SessionId) -> Option<Arc<TransferSession>> {
        let removed = self.sessions.lock().remove(&id);
        if removed.is_some() {
            debug!("세션 제거: id={}", id);
        }
        removed
    }

    /// 활성 세션 수
    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 유휴 세션 정리
    ///
    /// 타임아웃을 넘긴 세션을 맵에서 제거하고 반환한다.
    /// 임시 파일 삭제는 호출자(파일 매니저) 몫 — 맵 뮤텍스는 I/O 중
    /// 잡지 않는다.
    pub fn sweep_idle(&self) -> Vec<Arc<TransferSession>> {
        let expired: Vec<Arc<TransferSession>> = {
            let mut sessions = self.sessions.lock();
            let ids: Vec<SessionId> = sessions
                .iter()
                .filter(|(_, s)| s.idle_for() > self.idle_timeout)
                .map(|(&id, _)| id)
                .collect();
            ids.iter().filter_map(|id| sessions.remove(id)).collect()
        };

        for session in &expired {
            warn!(
                "유휴 세션 정리: id={}, file={}, {:.1}% 수신",
                session.id,
                session.filename,
                session.progress() * 100.0
            );
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_session(registry: &SessionRegistry, total_chunks: u32) -> Arc<TransferSession> {
        registry.create(
            "client-1".into(),
            "a.bin".into(),
            total_chunks as u64 * 8192,
            8192,
            total_chunks,
            TransferDirection::Outbound,
            PathBuf::from("/tmp/a.bin.part"),
            PathBuf::from("/tmp/a.bin"),
            [0u8; 32],
        )
    }

    #[test]
    fn test_create_get_remove() {
        let registry = SessionRegistry::new(Duration::from_secs(60));
        let session = make_session(&registry, 4);

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(session.id).unwrap().id, session.id);

        registry.remove(session.id);
        assert!(registry.get(session.id).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_chunk_tracking() {
        let registry = SessionRegistry::new(Duration::from_secs(60));
        let session = make_session(&registry, 4);

        assert!(session.mark_chunk_received(0));
        assert!(!session.mark_chunk_received(0)); // 중복
        assert!(session.mark_chunk_received(2));

        assert_eq!(session.received_count(), 2);
        assert_eq!(session.missing_chunks(), vec![1, 3]);
        assert!(!session.is_complete());
        assert!((session.progress() - 0.5).abs() < f64::EPSILON);

        session.mark_chunk_received(1);
        session.mark_chunk_received(3);
        assert!(session.is_complete());
    }

    #[test]
    fn test_concurrent_id_uniqueness() {
        // 10,000개 동시 생성 → 10,000개 서로 다른 ID
        let registry = Arc::new(SessionRegistry::new(Duration::from_secs(60)));
        let mut handles = Vec::new();

        for t in 0..8 {
            let registry = registry.clone();
            handles.push(std::thread::spawn(move || {
                let mut ids = Vec::with_capacity(1250);
                for i in 0..1250 {
                    let session = registry.create(
                        format!("client-{}", t),
                        format!("f{}.bin", i),
                        8192,
                        8192,
                        1,
                        TransferDirection::Outbound,
                        PathBuf::from("/tmp/f.bin.part"),
                        PathBuf::from("/tmp/f.bin"),
                        [0u8; 32],
                    );
                    ids.push(session.id);
                }
                ids
            }));
        }

        let mut all: Vec<SessionId> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(all.len(), 10_000);

        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 10_000);
        assert_eq!(registry.len(), 10_000);
    }

    #[test]
    fn test_caller_supplied_paths() {
        // create에 넘긴 경로가 그대로 세션에 남는다
        let registry = SessionRegistry::new(Duration::from_secs(60));
        let session = registry.create(
            "c".into(),
            "dir/file.bin".into(),
            8192,
            8192,
            1,
            TransferDirection::Inbound,
            PathBuf::from("/tmp/cftp/file.bin.part"),
            PathBuf::from("/data/file.bin"),
            [0u8; 32],
        );

        assert_eq!(session.temp_path, PathBuf::from("/tmp/cftp/file.bin.part"));
        assert_eq!(session.final_path, PathBuf::from("/data/file.bin"));
    }

    #[test]
    fn test_idle_sweep() {
        let registry = SessionRegistry::new(Duration::from_millis(30));
        let stale = make_session(&registry, 4);
        let fresh = make_session(&registry, 4);

        std::thread::sleep(Duration::from_millis(60));

        // stale은 건드리지 않고 fresh만 갱신
        fresh.touch();

        let swept = registry.sweep_idle();
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].id, stale.id);
        assert_eq!(registry.len(), 1);
        assert!(registry.get(fresh.id).is_some());
    }

}
