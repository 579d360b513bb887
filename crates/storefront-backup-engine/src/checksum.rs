use std::path::Path;

use sha2::{Digest, Sha256};
use storefront_backup_core::{BackupError, IoContext};
use tokio::io::AsyncReadExt;

const READ_CHUNK: usize = 64 * 1024;

/// Stream a file through SHA-256 and return the lowercase hex digest.
///
/// # Errors
/// Returns an error when the file cannot be opened or read.
pub async fn sha256_file(path: &Path) -> Result<String, BackupError> {
    let mut file = tokio::fs::File::open(path)
        .await
        .io_context(|| format!("failed to open {} for checksum", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0_u8; READ_CHUNK];

    loop {
        let read = file
            .read(&mut buf)
            .await
            .io_context(|| format!("failed to read {} for checksum", path.display()))?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}
