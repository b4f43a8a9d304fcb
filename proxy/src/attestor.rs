//! Workload attestation: mapping a caller process id to selectors.

use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;

use authority_api::selectors::{Selector, Unix};
use thiserror::Error;

/// Errors raised attesting a caller process.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AttestError {
    /// The caller process no longer exists.
    #[error("process {pid} not found")]
    ProcessNotFound {
        /// Process id that was looked up.
        pid: i32,
    },

    /// The process exists but its attributes could not be read.
    #[error("failed to inspect process {pid}: {source}")]
    Inspect {
        /// Process id that was inspected.
        pid: i32,
        /// The underlying filesystem error.
        #[source]
        source: io::Error,
    },
}

/// Derives selectors describing a caller process.
///
/// Attestation happens on every call. Process ids are recycled by the
/// operating system, so a cached attestation result could describe a
/// different process than the one currently connected.
#[tonic::async_trait]
pub trait WorkloadAttestor: Send + Sync + 'static {
    /// Returns the selectors of the process with the given id.
    async fn attest(&self, pid: i32) -> Result<Vec<Selector>, AttestError>;
}

/// Attests processes from the proc filesystem: owner uid, owner gid and,
/// when readable, the executable path.
#[derive(Debug)]
pub struct UnixAttestor {
    proc_root: PathBuf,
}

impl UnixAttestor {
    /// Creates an attestor reading from `/proc`.
    #[must_use]
    pub fn new() -> Self {
        Self::with_proc_root(PathBuf::from("/proc"))
    }

    /// Creates an attestor reading from an alternative proc root.
    #[must_use]
    pub fn with_proc_root(proc_root: PathBuf) -> Self {
        UnixAttestor { proc_root }
    }
}

impl Default for UnixAttestor {
    fn default() -> Self {
        Self::new()
    }
}

#[tonic::async_trait]
impl WorkloadAttestor for UnixAttestor {
    async fn attest(&self, pid: i32) -> Result<Vec<Selector>, AttestError> {
        let proc_dir = self.proc_root.join(pid.to_string());

        let metadata = tokio::fs::metadata(&proc_dir).await.map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                AttestError::ProcessNotFound { pid }
            } else {
                AttestError::Inspect { pid, source: e }
            }
        })?;

        let mut selectors = vec![
            Selector::Unix(Unix::Uid(metadata.uid())),
            Selector::Unix(Unix::Gid(metadata.gid())),
        ];

        // The exe link is absent for kernel threads and unreadable across
        // user namespaces. Uid and gid selectors are still meaningful.
        if let Ok(exe) = tokio::fs::read_link(proc_dir.join("exe")).await {
            selectors.push(Selector::Unix(Unix::Path(
                exe.to_string_lossy().into_owned(),
            )));
        }

        Ok(selectors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use authority_api::selectors_key;

    #[tokio::test]
    async fn test_missing_process_not_found() {
        let dir = std::env::temp_dir().join(format!("attestor-test-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let attestor = UnixAttestor::with_proc_root(dir.clone());

        let err = attestor.attest(999_999).await.unwrap_err();
        assert!(matches!(err, AttestError::ProcessNotFound { pid: 999_999 }));

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn test_attests_uid_and_gid() {
        let dir = std::env::temp_dir().join(format!("attestor-uidgid-{}", std::process::id()));
        let proc_dir = dir.join("1234");
        tokio::fs::create_dir_all(&proc_dir).await.unwrap();
        let attestor = UnixAttestor::with_proc_root(dir.clone());

        let selectors = attestor.attest(1234).await.unwrap();
        let key = selectors_key(&selectors);
        assert!(key.contains("unix:uid:"));
        assert!(key.contains("unix:gid:"));

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn test_attests_exe_path_when_present() {
        let dir = std::env::temp_dir().join(format!("attestor-exe-{}", std::process::id()));
        let proc_dir = dir.join("4321");
        tokio::fs::create_dir_all(&proc_dir).await.unwrap();
        tokio::fs::symlink("/usr/bin/service", proc_dir.join("exe"))
            .await
            .unwrap();
        let attestor = UnixAttestor::with_proc_root(dir.clone());

        let selectors = attestor.attest(4321).await.unwrap();
        let key = selectors_key(&selectors);
        assert!(key.contains("unix:path:/usr/bin/service"));

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn test_same_process_attests_to_same_key() {
        let dir = std::env::temp_dir().join(format!("attestor-stable-{}", std::process::id()));
        tokio::fs::create_dir_all(dir.join("77")).await.unwrap();
        let attestor = UnixAttestor::with_proc_root(dir.clone());

        let first = selectors_key(&attestor.attest(77).await.unwrap());
        let second = selectors_key(&attestor.attest(77).await.unwrap());
        assert_eq!(first, second);

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }
}
