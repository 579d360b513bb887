//! Artifact encryption: scrypt key derivation and streaming AES-256-CBC stages.
//!
//! Artifacts are plain AES-256-CBC with PKCS#7 padding and no header; the IV
//! lives in the sidecar metadata. The key is derived once from the configured
//! passphrase and a fixed application salt.

use std::fmt;
use std::io::{self, Read, Write};

use aes::Aes256;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::generic_array::GenericArray;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::rngs::OsRng;
use rand::RngCore;
use storefront_backup_core::BackupError;
use zeroize::{Zeroize, ZeroizeOnDrop};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

pub const KEY_LEN: usize = 32;
pub const IV_LEN: usize = 16;
const BLOCK_LEN: usize = 16;
const READ_CHUNK: usize = 16 * 1024;

const KEY_DERIVATION_SALT: &[u8] = b"pureza-backup-salt";
const SCRYPT_LOG_N: u8 = 14;
const SCRYPT_R: u32 = 8;
const SCRYPT_P: u32 = 1;

/// Derived AES-256 key, zeroed when dropped.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey {
    key: [u8; KEY_LEN],
}

impl EncryptionKey {
    /// # Errors
    /// Returns `BackupError::Crypto` when scrypt rejects its parameters.
    pub fn derive(passphrase: &str) -> Result<Self, BackupError> {
        let params = scrypt::Params::new(SCRYPT_LOG_N, SCRYPT_R, SCRYPT_P, KEY_LEN)
            .map_err(|err| BackupError::Crypto(format!("invalid scrypt parameters: {err}")))?;
        let mut key = [0_u8; KEY_LEN];
        scrypt::scrypt(passphrase.as_bytes(), KEY_DERIVATION_SALT, &params, &mut key)
            .map_err(|err| BackupError::Crypto(format!("scrypt key derivation failed: {err}")))?;
        Ok(Self { key })
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.key
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionKey").field("key", &"[REDACTED]").finish()
    }
}

#[must_use]
pub fn generate_iv() -> [u8; IV_LEN] {
    let mut iv = [0_u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);
    iv
}

/// # Errors
/// Returns `BackupError::Crypto` unless `raw` is exactly 16 bytes of hex.
pub fn parse_iv(raw: &str) -> Result<[u8; IV_LEN], BackupError> {
    let bytes = hex::decode(raw.trim())
        .map_err(|err| BackupError::Crypto(format!("encryption IV is not valid hex: {err}")))?;
    <[u8; IV_LEN]>::try_from(bytes.as_slice()).map_err(|_| {
        BackupError::Crypto(format!(
            "encryption IV must be {IV_LEN} bytes (got {})",
            bytes.len()
        ))
    })
}

fn invalid_data(message: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.to_string())
}

/// Write stage that encrypts everything written through it.
///
/// Call [`CbcEncryptWriter::finish`] to emit the padded final block.
pub struct CbcEncryptWriter<W: Write> {
    inner: W,
    cipher: Aes256CbcEnc,
    pending: Vec<u8>,
}

impl<W: Write> CbcEncryptWriter<W> {
    /// # Errors
    /// Returns `BackupError::Crypto` when the key or IV has the wrong length.
    pub fn new(inner: W, key: &EncryptionKey, iv: &[u8; IV_LEN]) -> Result<Self, BackupError> {
        let cipher = Aes256CbcEnc::new_from_slices(key.as_bytes(), iv)
            .map_err(|err| BackupError::Crypto(format!("failed to initialize cipher: {err}")))?;
        Ok(Self { inner, cipher, pending: Vec::with_capacity(READ_CHUNK) })
    }

    /// Pad and encrypt the trailing block, flush, and hand back the inner writer.
    ///
    /// # Errors
    /// Returns an error when the inner writer fails.
    pub fn finish(self) -> io::Result<W> {
        let Self { mut inner, cipher, mut pending } = self;
        let message_len = pending.len();
        pending.resize(BLOCK_LEN, 0);
        let sealed = cipher
            .encrypt_padded_mut::<Pkcs7>(&mut pending, message_len)
            .map_err(|_| io::Error::other("trailing block does not fit the padding buffer"))?
            .len();
        inner.write_all(&pending[..sealed])?;
        pending.zeroize();
        inner.flush()?;
        Ok(inner)
    }
}

impl<W: Write> Write for CbcEncryptWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pending.extend_from_slice(buf);
        let full = self.pending.len() - self.pending.len() % BLOCK_LEN;
        if full == 0 {
            return Ok(buf.len());
        }

        for block in self.pending[..full].chunks_exact_mut(BLOCK_LEN) {
            self.cipher.encrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        self.inner.write_all(&self.pending[..full])?;
        self.pending.drain(..full);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Read stage that decrypts an AES-256-CBC stream and strips PKCS#7 padding.
///
/// The last ciphertext block is held back until the source is exhausted so the
/// padding can be validated. Truncated or tampered input surfaces as
/// `InvalidData` before any plaintext tail is released.
pub struct CbcDecryptReader<R: Read> {
    inner: R,
    /// Taken when the final block is unpadded.
    cipher: Option<Aes256CbcDec>,
    ciphertext: Vec<u8>,
    plaintext: Vec<u8>,
    position: usize,
    exhausted: bool,
}

impl<R: Read> CbcDecryptReader<R> {
    /// # Errors
    /// Returns `BackupError::Crypto` when the key or IV has the wrong length.
    pub fn new(inner: R, key: &EncryptionKey, iv: &[u8; IV_LEN]) -> Result<Self, BackupError> {
        let cipher = Aes256CbcDec::new_from_slices(key.as_bytes(), iv)
            .map_err(|err| BackupError::Crypto(format!("failed to initialize cipher: {err}")))?;
        Ok(Self {
            inner,
            cipher: Some(cipher),
            ciphertext: Vec::with_capacity(READ_CHUNK + BLOCK_LEN),
            plaintext: Vec::with_capacity(READ_CHUNK + BLOCK_LEN),
            position: 0,
            exhausted: false,
        })
    }

    fn refill(&mut self) -> io::Result<()> {
        self.plaintext.clear();
        self.position = 0;

        let mut chunk = [0_u8; READ_CHUNK];
        let read = loop {
            match self.inner.read(&mut chunk) {
                Ok(read) => break read,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        };

        if read == 0 {
            self.exhausted = true;
            return self.finish_block();
        }

        self.ciphertext.extend_from_slice(&chunk[..read]);
        let aligned = self.ciphertext.len() - self.ciphertext.len() % BLOCK_LEN;
        // An aligned buffer may end with the final padded block; keep it back.
        let ready =
            if aligned == self.ciphertext.len() { aligned.saturating_sub(BLOCK_LEN) } else { aligned };
        if ready == 0 {
            return Ok(());
        }

        let Some(cipher) = self.cipher.as_mut() else {
            return Err(invalid_data("ciphertext continues past the final block"));
        };
        for block in self.ciphertext[..ready].chunks_exact_mut(BLOCK_LEN) {
            cipher.decrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        self.plaintext.extend_from_slice(&self.ciphertext[..ready]);
        self.ciphertext.drain(..ready);
        Ok(())
    }

    fn finish_block(&mut self) -> io::Result<()> {
        if self.ciphertext.len() != BLOCK_LEN {
            return Err(invalid_data("ciphertext length is not a multiple of the AES block size"));
        }

        let Some(cipher) = self.cipher.take() else {
            return Err(invalid_data("final block was already decrypted"));
        };
        let plain_len = cipher
            .decrypt_padded_mut::<Pkcs7>(&mut self.ciphertext)
            .map_err(|_| invalid_data("invalid PKCS#7 padding (wrong key or corrupted artifact)"))?
            .len();

        self.plaintext.extend_from_slice(&self.ciphertext[..plain_len]);
        self.ciphertext.zeroize();
        Ok(())
    }
}

impl<R: Read> Read for CbcDecryptReader<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.position < self.plaintext.len() {
                let available = &self.plaintext[self.position..];
                let count = available.len().min(out.len());
                out[..count].copy_from_slice(&available[..count]);
                self.position += count;
                return Ok(count);
            }
            if self.exhausted || out.is_empty() {
                return Ok(0);
            }
            self.refill()?;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn fixed_key() -> EncryptionKey {
        EncryptionKey { key: [7_u8; KEY_LEN] }
    }

    fn encrypt(plaintext: &[u8], write_size: usize) -> io::Result<Vec<u8>> {
        let key = fixed_key();
        let iv = [3_u8; IV_LEN];
        let mut writer = CbcEncryptWriter::new(Vec::new(), &key, &iv).map_err(io::Error::other)?;
        for piece in plaintext.chunks(write_size.max(1)) {
            writer.write_all(piece)?;
        }
        writer.finish()
    }

    fn decrypt(ciphertext: &[u8]) -> io::Result<Vec<u8>> {
        let key = fixed_key();
        let iv = [3_u8; IV_LEN];
        let mut reader =
            CbcDecryptReader::new(Cursor::new(ciphertext.to_vec()), &key, &iv).map_err(io::Error::other)?;
        let mut out = Vec::new();
        reader.read_to_end(&mut out)?;
        Ok(out)
    }

    #[test]
    fn matches_one_shot_padded_encryption() -> io::Result<()> {
        let plaintext: Vec<u8> = (0..1000_u32).map(|i| (i % 256) as u8).collect();
        let streamed = encrypt(&plaintext, 37)?;

        let mut buf = vec![0_u8; plaintext.len() + BLOCK_LEN];
        let reference = Aes256CbcEnc::new(&[7_u8; KEY_LEN].into(), &[3_u8; IV_LEN].into())
            .encrypt_padded_b2b_mut::<Pkcs7>(&plaintext, &mut buf)
            .map_err(|_| io::Error::other("reference padding failed"))?;
        assert_eq!(streamed.as_slice(), reference);
        Ok(())
    }

    #[test]
    fn block_aligned_plaintext_gets_a_full_padding_block() -> io::Result<()> {
        let plaintext = vec![0xAB_u8; BLOCK_LEN * 4];
        let ciphertext = encrypt(&plaintext, 16)?;
        assert_eq!(ciphertext.len(), BLOCK_LEN * 5);
        assert_eq!(decrypt(&ciphertext)?, plaintext);
        Ok(())
    }

    #[test]
    fn empty_plaintext_survives() -> io::Result<()> {
        let ciphertext = encrypt(&[], 1)?;
        assert_eq!(ciphertext.len(), BLOCK_LEN);
        assert!(decrypt(&ciphertext)?.is_empty());
        Ok(())
    }

    #[test]
    fn large_stream_crosses_read_chunks() -> io::Result<()> {
        let plaintext: Vec<u8> = (0..(READ_CHUNK * 3 + 5)).map(|i| (i % 253) as u8).collect();
        let ciphertext = encrypt(&plaintext, 4096)?;
        assert_eq!(decrypt(&ciphertext)?, plaintext);
        Ok(())
    }

    #[test]
    fn truncated_ciphertext_is_rejected() -> io::Result<()> {
        let ciphertext = encrypt(b"storefront orders table", 8)?;
        let err = match decrypt(&ciphertext[..ciphertext.len() - 3]) {
            Ok(_) => return Err(io::Error::other("expected truncated ciphertext to fail")),
            Err(err) => err,
        };
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(decrypt(&[]).is_err());
        Ok(())
    }

    #[test]
    fn final_block_with_bad_padding_is_rejected() -> io::Result<()> {
        use cbc::cipher::block_padding::NoPadding;

        // Last byte 0x00 is never valid PKCS#7.
        let mut plaintext = vec![0x41_u8; BLOCK_LEN * 2];
        plaintext[BLOCK_LEN * 2 - 1] = 0;
        let mut buf = vec![0_u8; plaintext.len()];
        let ciphertext = Aes256CbcEnc::new(&[7_u8; KEY_LEN].into(), &[3_u8; IV_LEN].into())
            .encrypt_padded_b2b_mut::<NoPadding>(&plaintext, &mut buf)
            .map_err(|_| io::Error::other("unpadded encryption failed"))?
            .to_vec();

        let err = match decrypt(&ciphertext) {
            Ok(_) => return Err(io::Error::other("expected bad padding to fail")),
            Err(err) => err,
        };
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(err.to_string().contains("PKCS#7"));
        Ok(())
    }

    #[test]
    fn wrong_key_fails_padding_check() -> io::Result<()> {
        let ciphertext = encrypt(b"exactly sixteen!", 16)?;
        let other = EncryptionKey { key: [9_u8; KEY_LEN] };
        let mut reader = CbcDecryptReader::new(Cursor::new(ciphertext), &other, &[3_u8; IV_LEN])
            .map_err(io::Error::other)?;
        let mut out = Vec::new();
        // A wrong key yields garbage padding except with negligible probability.
        let result = reader.read_to_end(&mut out);
        assert!(result.is_err() || out != b"exactly sixteen!");
        Ok(())
    }

    #[test]
    fn iv_parsing_requires_sixteen_hex_bytes() {
        let iv = generate_iv();
        assert!(matches!(parse_iv(&hex::encode(iv)), Ok(parsed) if parsed == iv));
        assert!(parse_iv("abcd").is_err());
        assert!(parse_iv("zz").is_err());
    }

    #[test]
    fn derived_key_is_deterministic_and_passphrase_bound() -> Result<(), BackupError> {
        let first = EncryptionKey::derive("correct horse")?;
        let second = EncryptionKey::derive("correct horse")?;
        let other = EncryptionKey::derive("battery staple")?;
        assert_eq!(first.as_bytes(), second.as_bytes());
        assert_ne!(first.as_bytes(), other.as_bytes());
        assert!(format!("{first:?}").contains("REDACTED"));
        Ok(())
    }
}
