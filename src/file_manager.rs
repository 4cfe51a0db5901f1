//! 파일 매니저
//!
//! - 청크 정렬 오프셋 읽기/쓰기 (쓰기마다 독립 핸들 → 서로 다른 청크의
//!   동시 쓰기 허용)
//! - 전체 파일 다이제스트 검증 후 임시 → 최종 경로 원자적 이동
//! - 루트 디렉터리 목록 조회

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::session::TransferSession;
use crate::wire::{hex_prefix, DigestKind};

/// 파일 정보
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// 파일명 (루트 기준 상대 경로)
    pub name: String,

    /// 크기 (바이트)
    pub size: u64,

    /// 수정 시각
    pub modified: SystemTime,

    /// 디렉터리 여부
    pub is_directory: bool,
}

/// 파일 매니저
#[derive(Debug)]
pub struct FileManager {
    root_dir: PathBuf,
    temp_dir: PathBuf,
    chunk_size: u32,
}

impl FileManager {
    /// 새 파일 매니저 생성 (디렉터리 없으면 생성)
    pub fn new(
        root_dir: impl Into<PathBuf>,
        temp_dir: impl Into<PathBuf>,
        chunk_size: u32,
    ) -> Result<Self> {
        let root_dir = root_dir.into();
        let temp_dir = temp_dir.into();

        fs::create_dir_all(&root_dir)?;
        fs::create_dir_all(&temp_dir)?;

        Ok(Self {
            root_dir,
            temp_dir,
            chunk_size,
        })
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// 총 청크 수 계산
    pub fn total_chunks(&self, file_size: u64) -> u32 {
        if file_size == 0 {
            return 0;
        }
        ((file_size + self.chunk_size as u64 - 1) / self.chunk_size as u64) as u32
    }

    /// 루트 기준 상대 경로 해석 (경로 탈출 차단)
    pub fn resolve(&self, filename: &str) -> Result<PathBuf> {
        let rel = Path::new(filename);
        if rel.is_absolute()
            || rel
                .components()
                .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
        {
            return Err(Error::NotFound {
                filename: filename.to_string(),
            });
        }
        Ok(self.root_dir.join(rel))
    }

    /// 파일 정보 조회
    pub fn file_info(&self, filename: &str) -> Result<FileInfo> {
        let path = self.resolve(filename)?;
        let meta = fs::metadata(&path).map_err(|_| Error::NotFound {
            filename: filename.to_string(),
        })?;

        Ok(FileInfo {
            name: filename.to_string(),
            size: meta.len(),
            modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            is_directory: meta.is_dir(),
        })
    }

    /// 루트 디렉터리 목록 조회
    ///
    /// recursive=false면 루트 바로 아래 항목만 (기본 설정).
    /// 임시 디렉터리가 루트 아래에 있으면 목록에서 제외한다.
    pub fn list_files(&self, recursive: bool) -> Result<Vec<FileInfo>> {
        let mut results = Vec::new();
        self.list_dir(&self.root_dir, "", recursive, &mut results)?;
        results.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(results)
    }

    fn list_dir(
        &self,
        dir: &Path,
        prefix: &str,
        recursive: bool,
        results: &mut Vec<FileInfo>,
    ) -> Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path == self.temp_dir {
                continue;
            }

            let meta = entry.metadata()?;
            let name = if prefix.is_empty() {
                entry.file_name().to_string_lossy().into_owned()
            } else {
                format!("{}/{}", prefix, entry.file_name().to_string_lossy())
            };

            results.push(FileInfo {
                name: name.clone(),
                size: meta.len(),
                modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                is_directory: meta.is_dir(),
            });

            if recursive && meta.is_dir() {
                self.list_dir(&path, &name, recursive, results)?;
            }
        }
        Ok(())
    }

    /// 청크 읽기 (서빙측)
    ///
    /// `chunk_number * chunk_size` 오프셋에서 최대 chunk_size 바이트.
    /// 마지막 청크는 남은 길이만큼만 반환된다.
    pub fn read_chunk(&self, filename: &str, chunk_number: u32) -> Result<Bytes> {
        let path = self.resolve(filename)?;
        let mut file = File::open(&path).map_err(|_| Error::NotFound {
            filename: filename.to_string(),
        })?;

        let offset = chunk_number as u64 * self.chunk_size as u64;
        file.seek(SeekFrom::Start(offset))?;

        let mut buf = vec![0u8; self.chunk_size as usize];
        let mut read = 0;
        while read < buf.len() {
            let n = file.read(&mut buf[read..])?;
            if n == 0 {
                break;
            }
            read += n;
        }
        buf.truncate(read);
        Ok(Bytes::from(buf))
    }

    /// 수신 파일의 임시 경로: `temp_dir/{basename}.part`
    ///
    /// 파일명 기반 키잉이라 프로세스를 다시 시작해도 이어받기 지점을
    /// 찾을 수 있다.
    pub fn part_path(&self, filename: &str) -> PathBuf {
        let base = Path::new(filename)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| filename.to_string());
        self.temp_dir.join(format!("{}.part", base))
    }

    /// 부분 수신 파일의 이어받기 시작 청크
    ///
    /// 청크는 순서대로 도착해 순차 기록되므로 part 파일 크기가 곧 받은
    /// 바이트 수다. 완성 못 한 꼬리 청크는 버리고 경계에서 다시 받는다.
    pub fn resume_point(&self, filename: &str) -> u32 {
        let part = self.part_path(filename);
        match fs::metadata(&part) {
            Ok(meta) => (meta.len() / self.chunk_size as u64) as u32,
            Err(_) => 0,
        }
    }

    /// 수신 세션의 임시 파일 생성 (크기 사전 할당)
    pub fn create_temp(&self, session: &TransferSession) -> Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&session.temp_path)?;
        file.set_len(session.file_size)?;
        debug!("임시 파일 생성: {:?}", session.temp_path);
        Ok(())
    }

    /// 청크 쓰기 (수신측)
    ///
    /// `chunk_number * chunk_size` 오프셋에 기록. 호출마다 독립 파일
    /// 핸들을 열므로 서로 다른 청크의 쓰기는 동시에 진행돼도 안전하다.
    /// chunks_received 갱신만 세션 뮤텍스를 잡는다.
    pub fn write_chunk(&self, session: &TransferSession, chunk_number: u32, data: &[u8]) -> Result<()> {
        if chunk_number >= session.total_chunks {
            return Err(Error::InvalidRange {
                start_chunk: chunk_number,
                total_chunks: session.total_chunks,
            });
        }

        let offset = chunk_number as u64 * session.chunk_size as u64;
        let end = offset + data.len() as u64;
        if data.len() > session.chunk_size as usize || end > session.file_size {
            return Err(Error::Resource(format!(
                "청크 범위 초과: chunk={}, len={}, file_size={}",
                chunk_number,
                data.len(),
                session.file_size
            )));
        }

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&session.temp_path)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;

        session.mark_chunk_received(chunk_number);
        Ok(())
    }

    /// 전체 파일 다이제스트 계산 (스트리밍)
    pub fn file_checksum(&self, path: &Path, digest: DigestKind) -> Result<[u8; 32]> {
        let mut file = File::open(path)?;
        let mut buf = vec![0u8; 64 * 1024];

        match digest {
            DigestKind::Blake3 => {
                let mut hasher = blake3::Hasher::new();
                loop {
                    let n = file.read(&mut buf)?;
                    if n == 0 {
                        break;
                    }
                    hasher.update(&buf[..n]);
                }
                Ok(*hasher.finalize().as_bytes())
            }
            DigestKind::Crc32 => {
                let mut hasher = crc32fast::Hasher::new();
                loop {
                    let n = file.read(&mut buf)?;
                    if n == 0 {
                        break;
                    }
                    hasher.update(&buf[..n]);
                }
                let mut out = [0u8; 32];
                out[..4].copy_from_slice(&hasher.finalize().to_be_bytes());
                Ok(out)
            }
        }
    }

    /// 전송 완료 처리
    ///
    /// 모든 청크 수신 확인 → 전체 다이제스트 검증 → 임시 파일을 최종
    /// 경로로 원자적 이동(rename). 다이제스트 불일치 시 임시 파일은
    /// 그대로 남아 이어받기가 가능하다.
    pub fn finalize(&self, session: &TransferSession, digest: DigestKind) -> Result<()> {
        if !session.is_complete() {
            return Err(Error::Resource(format!(
                "미완료 전송: {}/{} 청크",
                session.received_count(),
                session.total_chunks
            )));
        }

        let computed = self.file_checksum(&session.temp_path, digest)?;
        if computed != session.file_checksum {
            warn!(
                "무결성 검증 실패: session={}, file={}",
                session.id, session.filename
            );
            return Err(Error::Integrity {
                expected: hex_prefix(&session.file_checksum),
                got: hex_prefix(&computed),
            });
        }

        if let Some(parent) = session.final_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&session.temp_path, &session.final_path)?;

        info!(
            "전송 완료: session={}, {:?} → {:?}",
            session.id, session.temp_path, session.final_path
        );
        Ok(())
    }

    /// 임시 파일 삭제 (유휴 세션 정리용)
    pub fn discard_temp(&self, session: &TransferSession) {
        if session.temp_path.exists() {
            if let Err(e) = fs::remove_file(&session.temp_path) {
                warn!("임시 파일 삭제 실패: {:?}: {}", session.temp_path, e);
            } else {
                debug!("임시 파일 삭제: {:?}", session.temp_path);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{SessionRegistry, TransferDirection};
    use std::sync::Arc;
    use std::time::Duration;

    fn setup() -> (tempfile::TempDir, FileManager) {
        let dir = tempfile::tempdir().unwrap();
        let fm = FileManager::new(dir.path().join("root"), dir.path().join("temp"), 8192).unwrap();
        (dir, fm)
    }

    fn make_inbound_session(
        fm: &FileManager,
        registry: &SessionRegistry,
        file_size: u64,
        checksum: [u8; 32],
    ) -> Arc<crate::session::TransferSession> {
        registry.create(
            "c".into(),
            "out.bin".into(),
            file_size,
            fm.chunk_size(),
            fm.total_chunks(file_size),
            TransferDirection::Inbound,
            fm.part_path("out.bin"),
            fm.root_dir().join("out.bin"),
            checksum,
        )
    }

    #[test]
    fn test_read_chunk_boundaries() {
        let (_dir, fm) = setup();
        let data: Vec<u8> = (0..20000u32).map(|i| (i % 251) as u8).collect();
        fs::write(fm.root_dir().join("src.bin"), &data).unwrap();

        // 20000 / 8192 = 2 full + 1 partial
        assert_eq!(fm.total_chunks(20000), 3);
        assert_eq!(fm.read_chunk("src.bin", 0).unwrap().len(), 8192);
        assert_eq!(fm.read_chunk("src.bin", 1).unwrap().len(), 8192);

        let last = fm.read_chunk("src.bin", 2).unwrap();
        assert_eq!(last.len(), 20000 - 2 * 8192);
        assert_eq!(&last[..], &data[2 * 8192..]);
    }

    #[test]
    fn test_write_chunks_and_finalize() {
        let (_dir, fm) = setup();
        let registry = SessionRegistry::new(Duration::from_secs(60));

        let data: Vec<u8> = (0..20000u32).map(|i| (i * 7 % 256) as u8).collect();
        let checksum = DigestKind::Blake3.digest(&data);
        let session = make_inbound_session(&fm, &registry, data.len() as u64, checksum);

        fm.create_temp(&session).unwrap();
        for (i, chunk) in data.chunks(8192).enumerate() {
            fm.write_chunk(&session, i as u32, chunk).unwrap();
        }

        assert!(session.is_complete());
        fm.finalize(&session, DigestKind::Blake3).unwrap();

        assert!(!session.temp_path.exists());
        assert_eq!(fs::read(&session.final_path).unwrap(), data);
    }

    #[test]
    fn test_finalize_integrity_mismatch_keeps_temp() {
        let (_dir, fm) = setup();
        let registry = SessionRegistry::new(Duration::from_secs(60));

        let data = vec![0x11u8; 9000];
        // 고의로 틀린 체크섬
        let session = make_inbound_session(&fm, &registry, data.len() as u64, [0xEE; 32]);

        fm.create_temp(&session).unwrap();
        fm.write_chunk(&session, 0, &data[..8192]).unwrap();
        fm.write_chunk(&session, 1, &data[8192..]).unwrap();

        let err = fm.finalize(&session, DigestKind::Blake3).unwrap_err();
        assert!(matches!(err, Error::Integrity { .. }));

        // 임시 파일 보존 → 이어받기 가능
        assert!(session.temp_path.exists());
        assert!(!session.final_path.exists());
    }

    #[test]
    fn test_concurrent_disjoint_writes() {
        // 서로 다른 청크의 병렬 쓰기 후 전체 다이제스트 일치 확인
        let (_dir, fm) = setup();
        let fm = Arc::new(fm);
        let registry = SessionRegistry::new(Duration::from_secs(60));

        let data: Vec<u8> = (0..8192u32 * 16).map(|i| (i % 253) as u8).collect();
        let checksum = DigestKind::Blake3.digest(&data);
        let session = make_inbound_session(&fm, &registry, data.len() as u64, checksum);
        fm.create_temp(&session).unwrap();

        let data = Arc::new(data);
        let mut handles = Vec::new();
        for t in 0..4 {
            let fm = fm.clone();
            let session = session.clone();
            let data = data.clone();
            handles.push(std::thread::spawn(move || {
                for i in (t..16).step_by(4) {
                    let start = i * 8192;
                    fm.write_chunk(&session, i as u32, &data[start..start + 8192])
                        .unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        assert!(session.is_complete());
        fm.finalize(&session, DigestKind::Blake3).unwrap();

        let written = fs::read(&session.final_path).unwrap();
        assert_eq!(DigestKind::Blake3.digest(&written), checksum);
    }

    #[test]
    fn test_write_chunk_bounds() {
        let (_dir, fm) = setup();
        let registry = SessionRegistry::new(Duration::from_secs(60));
        let session = make_inbound_session(&fm, &registry, 10000, [0u8; 32]);
        fm.create_temp(&session).unwrap();

        // total_chunks = 2
        assert!(matches!(
            fm.write_chunk(&session, 2, &[0u8; 10]),
            Err(Error::InvalidRange { .. })
        ));
        // 마지막 청크에 chunk_size만큼 쓰면 file_size 초과
        assert!(matches!(
            fm.write_chunk(&session, 1, &[0u8; 8192]),
            Err(Error::Resource(_))
        ));
    }

    #[test]
    fn test_list_files_flat() {
        let (_dir, fm) = setup();
        fs::write(fm.root_dir().join("a.txt"), b"aaa").unwrap();
        fs::create_dir(fm.root_dir().join("sub")).unwrap();
        fs::write(fm.root_dir().join("sub/b.txt"), b"bbbb").unwrap();

        // 비재귀 (기본): 루트 바로 아래만
        let flat = fm.list_files(false).unwrap();
        let names: Vec<&str> = flat.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "sub"]);
        assert!(flat[1].is_directory);

        // 재귀: 하위 포함
        let deep = fm.list_files(true).unwrap();
        let names: Vec<&str> = deep.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "sub", "sub/b.txt"]);
        assert_eq!(deep[2].size, 4);
    }

    #[test]
    fn test_path_escape_rejected() {
        let (_dir, fm) = setup();
        assert!(matches!(
            fm.file_info("../etc/passwd"),
            Err(Error::NotFound { .. })
        ));
        assert!(matches!(
            fm.read_chunk("/etc/passwd", 0),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn test_resume_point() {
        let (_dir, fm) = setup();
        assert_eq!(fm.resume_point("x.bin"), 0);

        // 2개 청크 + 꼬리 일부까지 받다 끊긴 part 파일
        fs::write(fm.part_path("x.bin"), vec![0u8; 8192 * 2 + 100]).unwrap();
        // 불완전한 꼬리는 버리고 청크 경계에서 재개
        assert_eq!(fm.resume_point("x.bin"), 2);

        assert_eq!(fm.part_path("dir/x.bin"), fm.temp_dir().join("x.bin.part"));
    }

    #[test]
    fn test_discard_temp() {
        let (_dir, fm) = setup();
        let registry = SessionRegistry::new(Duration::from_secs(60));
        let session = make_inbound_session(&fm, &registry, 100, [0u8; 32]);

        fm.create_temp(&session).unwrap();
        assert!(session.temp_path.exists());

        fm.discard_temp(&session);
        assert!(!session.temp_path.exists());
    }
}
