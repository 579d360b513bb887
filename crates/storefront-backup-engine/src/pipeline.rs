//! Blocking stream pipelines composed from `std::io` stages.
//!
//! Backup: live file -> gzip -> AES-256-CBC -> artifact.
//! Restore: artifact -> AES-256-CBC -> gunzip -> temp file.
//! Stages are optional and the first failing stage aborts the whole copy.

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use storefront_backup_core::{BackupError, IoContext};

use crate::crypto::{CbcDecryptReader, CbcEncryptWriter, EncryptionKey, IV_LEN};

/// A write stage that must be finalized explicitly (trailers, padding, fsync).
trait Sink: Write + Send {
    fn finish_sink(self: Box<Self>) -> io::Result<()>;
}

impl Sink for BufWriter<File> {
    fn finish_sink(self: Box<Self>) -> io::Result<()> {
        let file = self.into_inner().map_err(io::IntoInnerError::into_error)?;
        file.sync_all()
    }
}

impl Sink for GzEncoder<Box<dyn Sink>> {
    fn finish_sink(self: Box<Self>) -> io::Result<()> {
        self.finish()?.finish_sink()
    }
}

impl Sink for CbcEncryptWriter<Box<dyn Sink>> {
    fn finish_sink(self: Box<Self>) -> io::Result<()> {
        self.finish()?.finish_sink()
    }
}

pub(crate) struct CipherParams<'a> {
    pub key: &'a EncryptionKey,
    pub iv: [u8; IV_LEN],
}

/// Stream `source` into `destination`, compressing and/or encrypting on the way.
///
/// `destination` must not exist yet.
///
/// Returns the number of plaintext bytes read from `source`.
pub(crate) fn run_backup_pipeline(
    source: &Path,
    destination: &Path,
    compress: bool,
    cipher: Option<CipherParams<'_>>,
) -> Result<u64, BackupError> {
    let input = File::open(source)
        .io_context(|| format!("failed to open live database {}", source.display()))?;
    let mut reader = BufReader::new(input);

    // Never truncate an artifact that is already on disk.
    let output = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(destination)
        .io_context(|| format!("failed to create backup artifact {}", destination.display()))?;
    let mut sink: Box<dyn Sink> = Box::new(BufWriter::new(output));
    if let Some(params) = cipher {
        sink = Box::new(CbcEncryptWriter::new(sink, params.key, &params.iv)?);
    }
    if compress {
        sink = Box::new(GzEncoder::new(sink, Compression::default()));
    }

    let copied = io::copy(&mut reader, &mut sink)
        .io_context(|| format!("failed to stream backup into {}", destination.display()))?;
    sink.finish_sink()
        .io_context(|| format!("failed to finalize backup artifact {}", destination.display()))?;
    Ok(copied)
}

/// Reverse of [`run_backup_pipeline`]: decrypt and/or decompress `artifact` into `destination`.
///
/// Returns the number of plaintext bytes written.
pub(crate) fn run_restore_pipeline(
    artifact: &Path,
    destination: &Path,
    compressed: bool,
    cipher: Option<CipherParams<'_>>,
) -> Result<u64, BackupError> {
    let input = File::open(artifact)
        .io_context(|| format!("failed to open backup artifact {}", artifact.display()))?;
    let mut source: Box<dyn Read + Send> = Box::new(BufReader::new(input));
    if let Some(params) = cipher {
        source = Box::new(CbcDecryptReader::new(source, params.key, &params.iv)?);
    }
    if compressed {
        source = Box::new(GzDecoder::new(source));
    }

    let output = File::create(destination)
        .io_context(|| format!("failed to create restore file {}", destination.display()))?;
    let mut writer = BufWriter::new(output);
    let written = io::copy(&mut source, &mut writer)
        .io_context(|| format!("failed to decode backup artifact {}", artifact.display()))?;
    let file = writer
        .into_inner()
        .map_err(io::IntoInnerError::into_error)
        .io_context(|| format!("failed to flush restore file {}", destination.display()))?;
    file.sync_all()
        .io_context(|| format!("failed to sync restore file {}", destination.display()))?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::crypto::generate_iv;

    fn fixture_bytes() -> Vec<u8> {
        (0..50_000_u32).map(|i| (i.wrapping_mul(31) % 251) as u8).collect()
    }

    fn round_trip(compress: bool, encrypt: bool) -> Result<(), BackupError> {
        let dir = tempfile::tempdir().io_context(|| "tempdir".into())?;
        let live = dir.path().join("live.sqlite");
        let artifact = dir.path().join("artifact.bin");
        let restored = dir.path().join("restored.sqlite");
        let body = fixture_bytes();
        fs::write(&live, &body).io_context(|| "write fixture".into())?;

        let key = EncryptionKey::derive("pipeline-test")?;
        let iv = generate_iv();
        let params = || encrypt.then(|| CipherParams { key: &key, iv });

        let read = run_backup_pipeline(&live, &artifact, compress, params())?;
        assert_eq!(read, body.len() as u64);

        let stored = fs::read(&artifact).io_context(|| "read artifact".into())?;
        if compress || encrypt {
            assert_ne!(stored, body);
        } else {
            assert_eq!(stored, body);
        }

        let written = run_restore_pipeline(&artifact, &restored, compress, params())?;
        assert_eq!(written, body.len() as u64);
        assert_eq!(fs::read(&restored).io_context(|| "read restored".into())?, body);
        Ok(())
    }

    #[test]
    fn plain_round_trip() -> Result<(), BackupError> {
        round_trip(false, false)
    }

    #[test]
    fn compressed_round_trip() -> Result<(), BackupError> {
        round_trip(true, false)
    }

    #[test]
    fn encrypted_round_trip() -> Result<(), BackupError> {
        round_trip(false, true)
    }

    #[test]
    fn compressed_and_encrypted_round_trip() -> Result<(), BackupError> {
        round_trip(true, true)
    }

    #[test]
    fn truncated_gzip_artifact_fails_to_decode() -> Result<(), BackupError> {
        let dir = tempfile::tempdir().io_context(|| "tempdir".into())?;
        let live = dir.path().join("live.sqlite");
        let artifact = dir.path().join("artifact.gz");
        fs::write(&live, fixture_bytes()).io_context(|| "write fixture".into())?;
        run_backup_pipeline(&live, &artifact, true, None)?;

        let stored = fs::read(&artifact).io_context(|| "read artifact".into())?;
        fs::write(&artifact, &stored[..stored.len() / 2]).io_context(|| "truncate".into())?;

        let result = run_restore_pipeline(&artifact, &dir.path().join("out"), true, None);
        assert!(matches!(result, Err(BackupError::Io { .. })));
        Ok(())
    }

    #[test]
    fn existing_artifact_is_not_overwritten() -> Result<(), BackupError> {
        let dir = tempfile::tempdir().io_context(|| "tempdir".into())?;
        let live = dir.path().join("live.sqlite");
        let artifact = dir.path().join("artifact.gz");
        fs::write(&live, fixture_bytes()).io_context(|| "write fixture".into())?;
        fs::write(&artifact, b"earlier backup").io_context(|| "write artifact".into())?;

        match run_backup_pipeline(&live, &artifact, true, None) {
            Err(BackupError::Io { source, .. }) => {
                assert_eq!(source.kind(), io::ErrorKind::AlreadyExists);
            }
            other => panic!("expected AlreadyExists, got {other:?}"),
        }
        assert_eq!(fs::read(&artifact).io_context(|| "read".into())?, b"earlier backup");
        Ok(())
    }

    #[test]
    fn missing_source_fails_before_creating_artifact() -> Result<(), BackupError> {
        let dir = tempfile::tempdir().io_context(|| "tempdir".into())?;
        let artifact = dir.path().join("artifact.bin");
        let result = run_backup_pipeline(&dir.path().join("absent"), &artifact, false, None);
        assert!(result.is_err());
        assert!(!artifact.exists());
        Ok(())
    }
}
