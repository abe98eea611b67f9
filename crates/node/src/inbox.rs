use std::path::{Path, PathBuf};

use peerlog_session::PeerId;

/// Write a received payload under `dir`, named after the sender.
pub async fn store_payload(dir: &Path, peer: &PeerId, payload: &[u8]) -> std::io::Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;

    let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S");
    let unique = &uuid::Uuid::new_v4().to_string()[..8];
    let path = dir.join(format!(
        "{}-{}-{}.bin",
        stamp,
        file_safe(peer.display_name()),
        unique
    ));

    tokio::fs::write(&path, payload).await?;
    Ok(path)
}

fn file_safe(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_safe() {
        assert_eq!(file_safe("Ben's iPhone"), "Ben_s_iPhone");
        assert_eq!(file_safe("../etc"), "___etc");
    }

    #[tokio::test]
    async fn test_store_payload_creates_inbox() {
        let dir = tempfile::tempdir().unwrap();
        let inbox = dir.path().join("inbox");

        let path = store_payload(&inbox, &PeerId::new("alice"), b"selfie")
            .await
            .unwrap();

        assert!(path.starts_with(&inbox));
        assert!(path.file_name().unwrap().to_string_lossy().contains("-alice-"));
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"selfie");
    }
}
