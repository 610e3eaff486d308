//! Chunked AES-256-GCM deliverable format.
//!
//! ```text
//! [65-byte signature][12-byte IV][chunk 0][chunk 1]...[chunk n]
//! chunk = ciphertext (<= chunk_len bytes) || 16-byte tag
//! ```
//!
//! Every chunk except the last carries exactly `chunk_len` bytes of
//! ciphertext. Chunk `i` is encrypted with the IV incremented `i` times
//! (big-endian, with carry). The provider signs `sha256(tag_0 || ... || tag_n)`
//! as an EIP-191 personal message, so a truncated, reordered or substituted
//! chunk list fails either a tag check or the signature check.

use crate::crypto::{recover_address, sign_message, RECOVERABLE_SIGNATURE_LEN};
use crate::error::{Error, Result};
use crate::types::Address;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use secp256k1::SecretKey;
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

/// Ciphertext bytes per full chunk (64 MiB).
pub const CHUNK_LEN: usize = 64 * 1024 * 1024;

/// IV size (12 bytes).
pub const IV_SIZE: usize = 12;

/// AES-GCM tag size (16 bytes).
pub const TAG_SIZE: usize = 16;

/// Key size for AES-256 (32 bytes).
pub const KEY_SIZE: usize = 32;

/// Increment a big-endian IV by one, wrapping on overflow.
pub fn increment_iv(iv: &mut [u8; IV_SIZE]) {
    for byte in iv.iter_mut().rev() {
        let (next, carry) = byte.overflowing_add(1);
        *byte = next;
        if !carry {
            return;
        }
    }
}

fn cipher(key: &[u8; KEY_SIZE]) -> Result<Aes256Gcm> {
    Aes256Gcm::new_from_slice(key)
        .map_err(|e| Error::Crypto(format!("Failed to create cipher: {e}")))
}

/// Encrypt and sign `plaintext` in the deliverable format.
///
/// An empty plaintext yields a single empty chunk.
///
/// # Errors
///
/// Returns a crypto error if `chunk_len` is zero or encryption fails.
pub fn seal(
    plaintext: &[u8],
    key: &[u8; KEY_SIZE],
    iv: [u8; IV_SIZE],
    signer: &SecretKey,
    chunk_len: usize,
) -> Result<Vec<u8>> {
    if chunk_len == 0 {
        return Err(Error::Crypto("chunk length must be positive".to_string()));
    }
    let cipher = cipher(key)?;
    let mut body = Vec::with_capacity(plaintext.len() + TAG_SIZE);
    let mut tags = Vec::new();
    let mut running = iv;

    let chunks: Vec<&[u8]> = if plaintext.is_empty() {
        vec![plaintext]
    } else {
        plaintext.chunks(chunk_len).collect()
    };
    for chunk in chunks {
        let sealed = cipher
            .encrypt(Nonce::from_slice(&running), chunk)
            .map_err(|e| Error::Crypto(format!("Encryption failed: {e}")))?;
        tags.extend_from_slice(&sealed[sealed.len() - TAG_SIZE..]);
        body.extend_from_slice(&sealed);
        increment_iv(&mut running);
    }

    let digest: [u8; 32] = Sha256::digest(&tags).into();
    let signature = sign_message(signer, &digest);

    let mut out = Vec::with_capacity(RECOVERABLE_SIGNATURE_LEN + IV_SIZE + body.len());
    out.extend_from_slice(&signature);
    out.extend_from_slice(&iv);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Read until `buf` is full or the reader is exhausted.
async fn fill<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

fn temp_path(output: &Path) -> PathBuf {
    let suffix: u64 = rand::random();
    let name = output
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    output.with_file_name(format!(".{name}.{suffix:016x}.partial"))
}

/// Decrypt `encrypted` into `output`, verifying every tag and the tag-chain
/// signature against `signer`.
///
/// Plaintext is staged in a sibling temporary file and moved into place only
/// after the signature check; on failure the temporary file is removed and
/// `output` is left untouched.
///
/// # Errors
///
/// - [`Error::Verification`] for a truncated file, a file without chunks, a
///   failed tag or a signature from anyone but `signer`;
/// - [`Error::Io`] for file system failures.
pub async fn decrypt_file(
    encrypted: &Path,
    output: &Path,
    key: &[u8; KEY_SIZE],
    signer: Address,
    chunk_len: usize,
) -> Result<()> {
    let temp = temp_path(output);
    match decrypt_into(encrypted, &temp, key, signer, chunk_len).await {
        Ok(chunks) => {
            fs::rename(&temp, output).await?;
            debug!("Decrypted {chunks} chunks into {}", output.display());
            Ok(())
        }
        Err(e) => {
            if let Err(cleanup) = fs::remove_file(&temp).await {
                if cleanup.kind() != ErrorKind::NotFound {
                    warn!("Failed to remove {}: {cleanup}", temp.display());
                }
            }
            Err(e)
        }
    }
}

async fn decrypt_into(
    encrypted: &Path,
    temp: &Path,
    key: &[u8; KEY_SIZE],
    signer: Address,
    chunk_len: usize,
) -> Result<usize> {
    if chunk_len == 0 {
        return Err(Error::Crypto("chunk length must be positive".to_string()));
    }
    let cipher = cipher(key)?;
    let mut input = File::open(encrypted).await?;

    let mut header = [0u8; RECOVERABLE_SIGNATURE_LEN + IV_SIZE];
    if fill(&mut input, &mut header).await? < header.len() {
        return Err(Error::Verification(
            "deliverable is shorter than its header".to_string(),
        ));
    }
    let (signature, iv_bytes) = header.split_at(RECOVERABLE_SIGNATURE_LEN);
    let mut iv = [0u8; IV_SIZE];
    iv.copy_from_slice(iv_bytes);

    let mut output = File::create(temp).await?;
    let mut record = vec![0u8; chunk_len + TAG_SIZE];
    let mut tags = Vec::new();
    let mut chunks = 0usize;

    loop {
        let n = fill(&mut input, &mut record).await?;
        if n == 0 {
            break;
        }
        if n < TAG_SIZE {
            return Err(Error::Verification(format!(
                "chunk {chunks} is truncated ({n} bytes)"
            )));
        }

        let plaintext = cipher
            .decrypt(Nonce::from_slice(&iv), &record[..n])
            .map_err(|_| Error::Verification(format!("chunk {chunks} failed authentication")))?;
        output.write_all(&plaintext).await?;
        tags.extend_from_slice(&record[n - TAG_SIZE..n]);
        increment_iv(&mut iv);
        chunks += 1;

        // A short record can only be the last one.
        if n < record.len() {
            break;
        }
    }

    if chunks == 0 {
        return Err(Error::Verification("deliverable has no chunks".to_string()));
    }

    let digest: [u8; 32] = Sha256::digest(&tags).into();
    let recovered = recover_address(&digest, signature)
        .map_err(|e| Error::Verification(format!("tag-chain signature is invalid: {e}")))?;
    if recovered != signer {
        return Err(Error::Verification(format!(
            "tag-chain signed by {recovered}, expected {signer}"
        )));
    }

    output.flush().await?;
    output.sync_all().await?;
    Ok(chunks)
}
