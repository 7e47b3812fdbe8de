//! Packing and unpacking collaborators.
//!
//! The origin streams `tar -C <parent> -cf - <name>` into the transfer loop;
//! every writing participant pipes the loop's output into
//! `tar -xf - -C <dest>`. The loop itself only ever sees byte streams.

use crate::error::{BcastError, ConfigError, Result};
use crate::streaming::{ByteSink, ByteSource};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::debug;

/// Split a source path into tar's working directory and the archived name.
///
/// Trailing separators are ignored; a bare name is archived from `.`.
pub fn split_source(path: &Path) -> std::result::Result<(PathBuf, OsString), ConfigError> {
    let name = path
        .file_name()
        .ok_or_else(|| ConfigError::InvalidSourcePath(path.to_path_buf()))?;
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    Ok((parent, name.to_os_string()))
}

fn check_status(op: &'static str, status: ExitStatus) -> Result<()> {
    if status.success() {
        Ok(())
    } else {
        Err(BcastError::Archive {
            op,
            reason: format!("tar exited with {}", status),
        })
    }
}

/// Running `tar -c` on the origin
pub struct Packer {
    child: Child,
}

impl Packer {
    /// Spawn the packer for `source` and return its output as a byte source.
    pub fn spawn(tar: &str, source: &Path) -> Result<(Self, ByteSource<ChildStdout>)> {
        let (parent, name) = split_source(source)?;
        if !source.exists() {
            return Err(ConfigError::SourceMissing(source.to_path_buf()).into());
        }

        let mut cmd = Command::new(tar);
        cmd.arg("-C").arg(&parent).arg("-cf").arg("-").arg(&name);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::inherit());
        cmd.kill_on_drop(true);

        debug!(tar, parent = %parent.display(), name = ?name, "spawning packer");
        let mut child = cmd.spawn().map_err(|e| BcastError::Archive {
            op: "pack",
            reason: format!("failed to spawn {}: {}", tar, e),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| BcastError::Archive {
            op: "pack",
            reason: "packer has no stdout".to_string(),
        })?;

        Ok((Self { child }, ByteSource::new(stdout)))
    }

    /// Wait for the packer to exit and check its status.
    pub async fn wait(mut self) -> Result<()> {
        let status = self.child.wait().await?;
        check_status("pack", status)
    }
}

/// Running `tar -x` on a writing participant
pub struct Unpacker {
    child: Child,
}

impl Unpacker {
    /// Create `dest` and spawn the unpacker, returning its input as a byte sink.
    pub async fn spawn(tar: &str, dest: &Path) -> Result<(Self, ByteSink<ChildStdin>)> {
        tokio::fs::create_dir_all(dest).await?;

        let mut cmd = Command::new(tar);
        cmd.arg("-xf").arg("-").arg("-C").arg(dest);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::inherit());
        cmd.kill_on_drop(true);

        debug!(tar, dest = %dest.display(), "spawning unpacker");
        let mut child = cmd.spawn().map_err(|e| BcastError::Archive {
            op: "unpack",
            reason: format!("failed to spawn {}: {}", tar, e),
        })?;
        let stdin = child.stdin.take().ok_or_else(|| BcastError::Archive {
            op: "unpack",
            reason: "unpacker has no stdin".to_string(),
        })?;

        Ok((Self { child }, ByteSink::new(stdin)))
    }

    /// Wait for the unpacker to finish materializing. The sink must already
    /// be dropped so the unpacker sees end-of-input.
    pub async fn wait(mut self) -> Result<()> {
        let status = self.child.wait().await?;
        check_status("unpack", status)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn tar_available() -> bool {
        std::process::Command::new("tar")
            .arg("--version")
            .output()
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    #[test]
    fn test_split_source() {
        let (parent, name) = split_source(Path::new("/data/models/llama/")).unwrap();
        assert_eq!(parent, PathBuf::from("/data/models"));
        assert_eq!(name, OsString::from("llama"));

        let (parent, name) = split_source(Path::new("weights")).unwrap();
        assert_eq!(parent, PathBuf::from("."));
        assert_eq!(name, OsString::from("weights"));

        let (parent, name) = split_source(Path::new("/env.tar.gz")).unwrap();
        assert_eq!(parent, PathBuf::from("/"));
        assert_eq!(name, OsString::from("env.tar.gz"));
    }

    #[test]
    fn test_split_source_rejects_root() {
        assert!(matches!(
            split_source(Path::new("/")),
            Err(ConfigError::InvalidSourcePath(_))
        ));
        assert!(split_source(Path::new("a/..")).is_err());
    }

    #[test]
    fn test_missing_source_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let err = match Packer::spawn("tar", &tmp.path().join("absent")) {
            Err(e) => e,
            Ok(_) => panic!("expected missing source to fail"),
        };
        assert!(matches!(err, BcastError::Config(ConfigError::SourceMissing(_))));
    }

    #[tokio::test]
    async fn test_pack_then_unpack_roundtrip() {
        if !tar_available() {
            eprintln!("Skipping test: tar not found");
            return;
        }

        let src = TempDir::new().unwrap();
        let tree = src.path().join("tree");
        fs::create_dir_all(tree.join("nested")).unwrap();
        fs::write(tree.join("a.txt"), "alpha").unwrap();
        fs::write(tree.join("nested/b.bin"), vec![9u8; 4096]).unwrap();

        let dest = TempDir::new().unwrap();
        let out = dest.path().join("out");

        let (packer, mut source) = Packer::spawn("tar", &tree).unwrap();
        let (unpacker, mut sink) = Unpacker::spawn("tar", &out).await.unwrap();

        let mut buf = vec![0u8; 1024];
        loop {
            let n = source.read_chunk(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            sink.write_all(&buf[..n]).await.unwrap();
        }
        sink.flush().await.unwrap();
        drop(sink);
        drop(source);

        packer.wait().await.unwrap();
        unpacker.wait().await.unwrap();

        assert_eq!(fs::read_to_string(out.join("tree/a.txt")).unwrap(), "alpha");
        assert_eq!(fs::read(out.join("tree/nested/b.bin")).unwrap(), vec![9u8; 4096]);
    }

    #[tokio::test]
    async fn test_failing_unpacker_is_reported() {
        let dest = TempDir::new().unwrap();
        let (unpacker, sink) = match Unpacker::spawn("false", dest.path()).await {
            Ok(pair) => pair,
            Err(_) => {
                eprintln!("Skipping test: `false` not found");
                return;
            }
        };
        drop(sink);

        let err = unpacker.wait().await.unwrap_err();
        assert!(matches!(err, BcastError::Archive { op: "unpack", .. }));
    }
}
