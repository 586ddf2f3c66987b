//! 完成后的文件校验
//!
//! 在阻塞线程池上流式计算整个文件的 MD5（期望摘要为 SHA-256 时同时计算 SHA-256），
//! 通过共享计数器汇报已处理的字节数。

use crate::downloader::{DownloadError, ExpectedDigest};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// 读缓冲大小
const READ_BUFFER_SIZE: usize = 1024 * 1024;

/// 校验结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyOutcome {
    pub md5: String,
    pub sha256: Option<String>,
}

/// 校验文件：长度必须等于 `expected_size`，摘要必须与 `expected` 一致
pub async fn verify_file(
    path: PathBuf,
    expected_size: u64,
    expected: Option<ExpectedDigest>,
    verified: Arc<AtomicU64>,
) -> Result<VerifyOutcome, DownloadError> {
    let result = tokio::task::spawn_blocking(move || {
        hash_file(&path, expected_size, expected.as_ref(), &verified)
    })
    .await
    .map_err(|e| DownloadError::CorruptDownload(format!("校验任务异常: {}", e)))?;

    match &result {
        Ok(outcome) => info!("✅ 文件校验通过: md5={}", outcome.md5),
        Err(e) => warn!("⚠️ 文件校验失败: {}", e),
    }
    result
}

fn hash_file(
    path: &Path,
    expected_size: u64,
    expected: Option<&ExpectedDigest>,
    verified: &AtomicU64,
) -> Result<VerifyOutcome, DownloadError> {
    let mut file = File::open(path)
        .map_err(|e| DownloadError::CorruptDownload(format!("无法打开文件: {}", e)))?;
    let actual_size = file
        .metadata()
        .map_err(|e| DownloadError::CorruptDownload(format!("获取文件元数据失败: {}", e)))?
        .len();

    if actual_size != expected_size {
        return Err(DownloadError::CorruptDownload(format!(
            "文件大小不匹配: 期望 {} bytes, 实际 {} bytes",
            expected_size, actual_size
        )));
    }

    let mut md5_ctx = md5::Context::new();
    let mut sha256 = matches!(expected, Some(ExpectedDigest::Sha256(_))).then(Sha256::new);

    verified.store(0, Ordering::SeqCst);
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let n = file
            .read(&mut buffer)
            .map_err(|e| DownloadError::CorruptDownload(format!("读取文件失败: {}", e)))?;
        if n == 0 {
            break;
        }
        md5_ctx.consume(&buffer[..n]);
        if let Some(hasher) = sha256.as_mut() {
            hasher.update(&buffer[..n]);
        }
        verified.fetch_add(n as u64, Ordering::SeqCst);
    }

    let outcome = VerifyOutcome {
        md5: format!("{:x}", md5_ctx.compute()),
        sha256: sha256.map(|h| hex::encode(h.finalize())),
    };

    match expected {
        Some(ExpectedDigest::Md5(want)) if !want.eq_ignore_ascii_case(&outcome.md5) => {
            Err(DownloadError::CorruptDownload(format!(
                "MD5 不匹配: 期望 {}, 实际 {}",
                want, outcome.md5
            )))
        }
        Some(ExpectedDigest::Sha256(want))
            if !outcome
                .sha256
                .as_deref()
                .is_some_and(|got| want.eq_ignore_ascii_case(got)) =>
        {
            Err(DownloadError::CorruptDownload(format!(
                "SHA-256 不匹配: 期望 {}, 实际 {}",
                want,
                outcome.sha256.as_deref().unwrap_or("")
            )))
        }
        _ => Ok(outcome),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn temp_file(content: &[u8]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, content).unwrap();
        file
    }

    #[tokio::test]
    async fn test_md5_computed_and_counted() {
        let file = temp_file(b"hello world");
        let verified = Arc::new(AtomicU64::new(0));

        let outcome = verify_file(file.path().to_path_buf(), 11, None, verified.clone())
            .await
            .unwrap();

        assert_eq!(outcome.md5, "5eb63bbbe01eeed093cb22bb8f5acdc3");
        assert!(outcome.sha256.is_none());
        assert_eq!(verified.load(Ordering::SeqCst), 11);
    }

    #[tokio::test]
    async fn test_expected_md5_mismatch() {
        let file = temp_file(b"hello world");
        let err = verify_file(
            file.path().to_path_buf(),
            11,
            Some(ExpectedDigest::Md5("00000000000000000000000000000000".to_string())),
            Arc::new(AtomicU64::new(0)),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, DownloadError::CorruptDownload(_)));
    }

    #[tokio::test]
    async fn test_expected_sha256() {
        let file = temp_file(b"hello world");
        let want = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

        let outcome = verify_file(
            file.path().to_path_buf(),
            11,
            Some(ExpectedDigest::Sha256(want.to_uppercase())),
            Arc::new(AtomicU64::new(0)),
        )
        .await
        .unwrap();

        assert_eq!(outcome.sha256.as_deref(), Some(want));
    }

    #[tokio::test]
    async fn test_size_mismatch() {
        let file = temp_file(b"short");
        let err = verify_file(file.path().to_path_buf(), 100, None, Arc::new(AtomicU64::new(0)))
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::CorruptDownload(_)));
    }

    #[tokio::test]
    async fn test_missing_file() {
        let err = verify_file(
            PathBuf::from("/nonexistent/mirror-dl/file.bin"),
            1,
            None,
            Arc::new(AtomicU64::new(0)),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DownloadError::CorruptDownload(_)));
    }
}
