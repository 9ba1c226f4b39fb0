//! The `mac,ip` bindings file read by dnsmasq's `--dhcp-hostsfile`.
//!
//! Callers serialise access per network; nothing here locks.

use hostnet_common::{HostnetError, HostnetResult};
use std::io::{ErrorKind, SeekFrom};
use std::path::Path;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::warn;

use crate::types::HostBinding;

fn leading_token(line: &str) -> &str {
    line.split(',').next().unwrap_or_default().trim()
}

/// Replaces the file with exactly `bindings`.
pub async fn write_bindings(path: &Path, bindings: &[HostBinding]) -> HostnetResult<()> {
    let content: String = bindings.iter().map(|b| format!("{}\n", b.line())).collect();
    fs::write(path, content)
        .await
        .map_err(|e| HostnetError::io(path, e))
}

/// Appends one binding.
pub async fn append_binding(path: &Path, binding: &HostBinding) -> HostnetResult<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| HostnetError::io(path, e))?;
    file.write_all(format!("{}\n", binding.line()).as_bytes())
        .await
        .map_err(|e| HostnetError::io(path, e))?;
    file.flush().await.map_err(|e| HostnetError::io(path, e))
}

/// Drops every line whose leading token equals `mac` and returns how many
/// went.
///
/// The rewrite goes through one read/write handle: read, seek to start,
/// write, truncate to the new length, sync.
pub async fn remove_binding(path: &Path, mac: &str) -> HostnetResult<usize> {
    let io_err = |e| HostnetError::io(path, e);
    let mac = mac.to_ascii_lowercase();

    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .await
        .map_err(io_err)?;

    let mut content = String::new();
    file.read_to_string(&mut content).await.map_err(io_err)?;

    let mut kept = String::with_capacity(content.len());
    let mut removed = 0;
    for line in content.lines() {
        if leading_token(line).eq_ignore_ascii_case(&mac) {
            removed += 1;
            continue;
        }
        kept.push_str(line);
        kept.push('\n');
    }

    file.seek(SeekFrom::Start(0)).await.map_err(io_err)?;
    file.write_all(kept.as_bytes()).await.map_err(io_err)?;
    file.flush().await.map_err(io_err)?;
    file.set_len(kept.len() as u64).await.map_err(io_err)?;
    file.sync_all().await.map_err(io_err)?;

    Ok(removed)
}

/// Reads every binding. A missing file has none; malformed lines are skipped.
pub async fn read_bindings(path: &Path) -> HostnetResult<Vec<HostBinding>> {
    let content = match fs::read_to_string(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(HostnetError::io(path, e)),
    };
    Ok(content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|line| match line.parse::<HostBinding>() {
            Ok(b) => Some(b),
            Err(e) => {
                warn!("Skipping malformed binding in {}: {}", path.display(), e);
                None
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn binding(mac: &str, ip: &str) -> HostBinding {
        HostBinding::new(mac, ip.parse().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_append_then_remove_restores_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host");
        write_bindings(&path, &[binding("fa:16:3e:00:00:01", "10.0.0.5")])
            .await
            .unwrap();
        let before = std::fs::read_to_string(&path).unwrap();

        append_binding(&path, &binding("fa:16:3e:00:00:02", "10.0.0.6"))
            .await
            .unwrap();
        assert_eq!(read_bindings(&path).await.unwrap().len(), 2);

        let removed = remove_binding(&path, "fa:16:3e:00:00:02").await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), before);
    }

    #[tokio::test]
    async fn test_remove_truncates_shorter_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host");
        std::fs::write(
            &path,
            "fa:16:3e:00:00:01,10.0.0.5\nfa:16:3e:00:00:02,10.0.0.6\nfa:16:3e:00:00:01,10.0.0.7\n",
        )
        .unwrap();

        let removed = remove_binding(&path, "FA:16:3E:00:00:01").await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "fa:16:3e:00:00:02,10.0.0.6\n"
        );
    }

    #[tokio::test]
    async fn test_remove_matches_whole_token() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host");
        std::fs::write(&path, "fa:16:3e:00:00:011,10.0.0.5\n").unwrap();
        assert_eq!(remove_binding(&path, "fa:16:3e:00:00:01").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_remove_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = remove_binding(&dir.path().join("host"), "fa:16:3e:00:00:01")
            .await
            .unwrap_err();
        assert!(matches!(err, HostnetError::Io { .. }));
    }

    #[tokio::test]
    async fn test_read_skips_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host");
        std::fs::write(&path, "fa:16:3e:00:00:01,10.0.0.5\nnonsense\n\n").unwrap();
        assert_eq!(
            read_bindings(&path).await.unwrap(),
            vec![binding("fa:16:3e:00:00:01", "10.0.0.5")]
        );
        assert!(read_bindings(&dir.path().join("missing")).await.unwrap().is_empty());
    }
}
