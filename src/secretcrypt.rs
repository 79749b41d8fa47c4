//! Streaming encryption/decryption using scrypt + XSalsa20Poly1305
//!
//! This module implements passphrase-based encryption using:
//! - scrypt for key derivation from passphrase
//! - NaCl secretbox (XSalsa20Poly1305) for authenticated encryption
//!
//! Input is sealed in chunks so that progress can be reported and a
//! transfer can be cancelled between chunks. The binary format is:
//! - magic: 4 bytes ("SBXS")
//! - version: 1 byte
//! - scrypt log2(N): 1 byte
//! - salt: 8 bytes
//! - base nonce: 24 bytes
//! - metadata: u16 count, then per entry u16 key length, key, u16 value length, value
//! - chunks: u32 sealed length followed by the sealed box of `flag || data`
//!
//! All integers are big-endian. Every stream ends with exactly one chunk
//! whose flag is `FLAG_FINAL`; the nonce of chunk `i` is the base nonce with
//! its last 8 bytes XORed with `i`.

use crate::engine::{CryptoEngine, Outcome, ProgressFn};
use crate::error::{BatchError, ErrorCategory, ErrorKind, Result};
use crypto_secretbox::aead::{Aead, KeyInit};
use crypto_secretbox::{Nonce, XSalsa20Poly1305};
use scrypt::{Params, scrypt};
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use zeroize::Zeroizing;

/// Magic marker at the start of every stream
const MAGIC: &[u8; 4] = b"SBXS";

/// Current stream format version
const FORMAT_VERSION: u8 = 1;

/// Length of salt in bytes
const SALT_LEN: usize = 8;

/// Length of nonce in bytes
const NONCE_LEN: usize = 24;

/// Length of derived key in bytes
const KEY_LEN: usize = 32;

/// Length of the Poly1305 tag added to every sealed chunk
const TAG_LEN: usize = 16;

/// scrypt r parameter (block size)
const SCRYPT_R: u32 = 8;

/// scrypt p parameter (parallelization)
const SCRYPT_P: u32 = 1;

/// Accepted range of log2(N)
const MIN_LOG_N: u8 = 10;
const MAX_LOG_N: u8 = 22;

/// Plaintext bytes per chunk
pub const CHUNK_SIZE: usize = 64 * 1024;

const FLAG_MORE: u8 = 0;
const FLAG_FINAL: u8 = 1;

const FIXED_HEADER_LEN: usize = MAGIC.len() + 2 + SALT_LEN + NONCE_LEN;

/// Header fields preceding the first chunk.
#[derive(Debug)]
pub struct StreamHeader {
    pub log_n: u8,
    pub salt: [u8; SALT_LEN],
    pub nonce: [u8; NONCE_LEN],
    pub metadata: Vec<(String, String)>,
}

/// A [`CryptoEngine`] producing and consuming the chunked secretbox format.
///
/// One instance serves one transfer; once cancelled it stays cancelled.
#[derive(Debug, Default)]
pub struct SecretboxEngine {
    cancelled: AtomicBool,
}

impl SecretboxEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl CryptoEngine for SecretboxEngine {
    fn encrypt(
        &self,
        password: &[u8],
        kdf_iterations: u32,
        input: &mut dyn Read,
        output: &mut dyn Write,
        metadata: &[(String, String)],
        progress: &mut ProgressFn<'_>,
        update_interval: u64,
    ) -> Result<Outcome> {
        if password.is_empty() {
            return Err(BatchError::with_kind(
                ErrorCategory::User,
                ErrorKind::InvalidInput,
                "empty password",
            ));
        }
        let log_n = log_n_for(kdf_iterations)?;
        if self.is_cancelled() {
            return Ok(Outcome::Cancelled);
        }

        let header = StreamHeader {
            log_n,
            salt: rand::random(),
            nonce: rand::random(),
            metadata: metadata.to_vec(),
        };
        let key = derive_key(password, &header.salt, log_n)?;
        if self.is_cancelled() {
            return Ok(Outcome::Cancelled);
        }
        let cipher = new_cipher(&key)?;

        write_header(output, &header)?;

        let mut tracker = PositionTracker::new(update_interval);
        let mut chunk = Zeroizing::new(vec![0u8; CHUNK_SIZE + 1]);
        let mut counter = 0u64;
        loop {
            if self.is_cancelled() {
                return Ok(Outcome::Cancelled);
            }

            let n = read_full(input, &mut chunk[1..])
                .map_err(|e| io_error("failed to read plaintext", e))?;
            let is_final = n < CHUNK_SIZE;
            chunk[0] = if is_final { FLAG_FINAL } else { FLAG_MORE };

            let sealed = cipher
                .encrypt(&chunk_nonce(&header.nonce, counter), &chunk[..n + 1])
                .map_err(|_| {
                    BatchError::with_kind(
                        ErrorCategory::Internal,
                        ErrorKind::SecretboxFailure,
                        "encryption failed",
                    )
                })?;
            output
                .write_all(&(sealed.len() as u32).to_be_bytes())
                .and_then(|_| output.write_all(&sealed))
                .map_err(|e| io_error("failed to write ciphertext", e))?;

            tracker.advance(n as u64, progress);
            counter += 1;
            if is_final {
                break;
            }
        }

        tracker.finish(progress);
        Ok(Outcome::Completed)
    }

    fn decrypt(
        &self,
        password: &[u8],
        input: &mut dyn Read,
        output: &mut dyn Write,
        progress: &mut ProgressFn<'_>,
        update_interval: u64,
    ) -> Result<Outcome> {
        if password.is_empty() {
            return Err(BatchError::with_kind(
                ErrorCategory::User,
                ErrorKind::InvalidInput,
                "empty password",
            ));
        }

        let mut tracker = PositionTracker::new(update_interval);
        let (header, header_len) = read_header_counted(input)?;
        tracker.advance(header_len, progress);

        if self.is_cancelled() {
            return Ok(Outcome::Cancelled);
        }
        let key = derive_key(password, &header.salt, header.log_n)?;
        if self.is_cancelled() {
            return Ok(Outcome::Cancelled);
        }
        let cipher = new_cipher(&key)?;

        let mut counter = 0u64;
        loop {
            if self.is_cancelled() {
                return Ok(Outcome::Cancelled);
            }

            let mut len_bytes = [0u8; 4];
            read_exact_or_truncated(input, &mut len_bytes, "chunk length")?;
            let sealed_len = u32::from_be_bytes(len_bytes) as usize;
            if !(TAG_LEN + 1..=CHUNK_SIZE + 1 + TAG_LEN).contains(&sealed_len) {
                return Err(BatchError::with_kind(
                    ErrorCategory::User,
                    ErrorKind::BinaryFormat,
                    format!("invalid chunk length {}", sealed_len),
                ));
            }

            let mut sealed = vec![0u8; sealed_len];
            read_exact_or_truncated(input, &mut sealed, "sealed chunk")?;

            let plaintext = Zeroizing::new(
                cipher
                    .decrypt(&chunk_nonce(&header.nonce, counter), sealed.as_slice())
                    .map_err(|_| {
                        BatchError::with_kind(
                            ErrorCategory::User,
                            ErrorKind::AuthenticationFailed,
                            "corrupt input, tampered-with data, or bad passphrase",
                        )
                    })?,
            );
            let Some((&flag, data)) = plaintext.split_first() else {
                return Err(BatchError::with_kind(
                    ErrorCategory::Internal,
                    ErrorKind::InternalInvariant,
                    "opened chunk is empty",
                ));
            };

            output
                .write_all(data)
                .map_err(|e| io_error("failed to write plaintext", e))?;
            tracker.advance((len_bytes.len() + sealed_len) as u64, progress);
            counter += 1;

            match flag {
                FLAG_FINAL => break,
                FLAG_MORE => continue,
                other => {
                    return Err(BatchError::with_kind(
                        ErrorCategory::User,
                        ErrorKind::BinaryFormat,
                        format!("invalid chunk flag {}", other),
                    ));
                }
            }
        }

        let mut probe = [0u8; 1];
        if read_full(input, &mut probe).map_err(|e| io_error("failed to read ciphertext", e))? != 0
        {
            return Err(BatchError::with_kind(
                ErrorCategory::User,
                ErrorKind::TrailingData,
                "invalid input: unexpected data after final chunk",
            ));
        }

        tracker.finish(progress);
        Ok(Outcome::Completed)
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
fn read_header(input: &mut dyn Read) -> Result<StreamHeader> {
    read_header_counted(input).map(|(header, _)| header)
}

/// Reports positions to the progress callback at most once per interval,
/// plus once for the final position.
struct PositionTracker {
    interval: u64,
    position: u64,
    last_reported: Option<u64>,
}

impl PositionTracker {
    fn new(interval: u64) -> Self {
        Self {
            interval: interval.max(1),
            position: 0,
            last_reported: None,
        }
    }

    fn advance(&mut self, bytes: u64, progress: &mut ProgressFn<'_>) {
        self.position += bytes;
        let since = self.position - self.last_reported.unwrap_or(0);
        if since >= self.interval {
            progress(self.position);
            self.last_reported = Some(self.position);
        }
    }

    fn finish(&mut self, progress: &mut ProgressFn<'_>) {
        if self.last_reported != Some(self.position) {
            progress(self.position);
            self.last_reported = Some(self.position);
        }
    }
}

/// Validate that the KDF cost is a power of two within range and return log2(N)
fn log_n_for(kdf_iterations: u32) -> Result<u8> {
    let log_n = kdf_iterations.trailing_zeros() as u8;
    if !kdf_iterations.is_power_of_two() || !(MIN_LOG_N..=MAX_LOG_N).contains(&log_n) {
        return Err(BatchError::with_kind(
            ErrorCategory::User,
            ErrorKind::InvalidInput,
            format!(
                "invalid KDF iterations {}: must be a power of two between 2^{} and 2^{}",
                kdf_iterations, MIN_LOG_N, MAX_LOG_N
            ),
        ));
    }
    Ok(log_n)
}

/// Derive a 32-byte key from a passphrase and salt using scrypt
fn derive_key(passphrase: &[u8], salt: &[u8; SALT_LEN], log_n: u8) -> Result<Zeroizing<[u8; KEY_LEN]>> {
    let params = Params::new(log_n, SCRYPT_R, SCRYPT_P, KEY_LEN).map_err(|e| {
        BatchError::with_kind_and_source(
            ErrorCategory::Internal,
            ErrorKind::ScryptFailure,
            "failed to create scrypt params",
            e,
        )
    })?;

    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    scrypt(passphrase, salt, &params, &mut key[..]).map_err(|e| {
        BatchError::with_kind_and_source(
            ErrorCategory::Internal,
            ErrorKind::ScryptFailure,
            "scrypt key derivation failed",
            e,
        )
    })?;

    Ok(key)
}

fn new_cipher(key: &[u8; KEY_LEN]) -> Result<XSalsa20Poly1305> {
    XSalsa20Poly1305::new_from_slice(key).map_err(|_| {
        BatchError::with_kind(
            ErrorCategory::Internal,
            ErrorKind::InternalInvariant,
            "derived key has an invalid length",
        )
    })
}

fn chunk_nonce(base: &[u8; NONCE_LEN], counter: u64) -> Nonce {
    let mut nonce = *base;
    for (byte, mask) in nonce[NONCE_LEN - 8..].iter_mut().zip(counter.to_be_bytes()) {
        *byte ^= mask;
    }
    Nonce::from(nonce)
}

fn write_header(output: &mut dyn Write, header: &StreamHeader) -> Result<()> {
    let mut buf = Vec::with_capacity(FIXED_HEADER_LEN + 2);
    buf.extend_from_slice(MAGIC);
    buf.push(FORMAT_VERSION);
    buf.push(header.log_n);
    buf.extend_from_slice(&header.salt);
    buf.extend_from_slice(&header.nonce);

    let count = u16::try_from(header.metadata.len()).map_err(|_| metadata_too_large())?;
    buf.extend_from_slice(&count.to_be_bytes());
    for (key, value) in &header.metadata {
        for field in [key.as_bytes(), value.as_bytes()] {
            let len = u16::try_from(field.len()).map_err(|_| metadata_too_large())?;
            buf.extend_from_slice(&len.to_be_bytes());
            buf.extend_from_slice(field);
        }
    }

    output
        .write_all(&buf)
        .map_err(|e| io_error("failed to write header", e))
}

fn read_header_counted(input: &mut dyn Read) -> Result<(StreamHeader, u64)> {
    let mut fixed = [0u8; FIXED_HEADER_LEN];
    read_exact_or_truncated(input, &mut fixed, "header")?;
    let mut consumed = fixed.len() as u64;

    if &fixed[..MAGIC.len()] != MAGIC {
        return Err(BatchError::with_kind(
            ErrorCategory::User,
            ErrorKind::BinaryFormat,
            "input unrecognized as saltybatch data",
        ));
    }
    let version = fixed[MAGIC.len()];
    if version != FORMAT_VERSION {
        return Err(BatchError::with_kind(
            ErrorCategory::User,
            ErrorKind::BinaryFormat,
            format!("unsupported format version {}", version),
        ));
    }
    let log_n = fixed[MAGIC.len() + 1];
    if !(MIN_LOG_N..=MAX_LOG_N).contains(&log_n) {
        return Err(BatchError::with_kind(
            ErrorCategory::User,
            ErrorKind::BinaryFormat,
            format!("KDF parameter out of range: log2(N) = {}", log_n),
        ));
    }

    let mut pos = MAGIC.len() + 2;
    let mut salt = [0u8; SALT_LEN];
    salt.copy_from_slice(&fixed[pos..pos + SALT_LEN]);
    pos += SALT_LEN;
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&fixed[pos..pos + NONCE_LEN]);

    let mut count_bytes = [0u8; 2];
    read_exact_or_truncated(input, &mut count_bytes, "metadata")?;
    consumed += 2;
    let count = u16::from_be_bytes(count_bytes);

    let mut metadata = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let mut fields = [String::new(), String::new()];
        for field in fields.iter_mut() {
            let mut len_bytes = [0u8; 2];
            read_exact_or_truncated(input, &mut len_bytes, "metadata")?;
            let mut raw = vec![0u8; u16::from_be_bytes(len_bytes) as usize];
            read_exact_or_truncated(input, &mut raw, "metadata")?;
            consumed += (len_bytes.len() + raw.len()) as u64;
            *field = String::from_utf8_lossy(&raw).into_owned();
        }
        let [key, value] = fields;
        metadata.push((key, value));
    }

    Ok((
        StreamHeader {
            log_n,
            salt,
            nonce,
            metadata,
        },
        consumed,
    ))
}

/// Read until `buf` is full or EOF is reached, returning the bytes read
fn read_full(input: &mut dyn Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match input.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn read_exact_or_truncated(input: &mut dyn Read, buf: &mut [u8], what: &str) -> Result<()> {
    input.read_exact(buf).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            BatchError::with_kind(
                ErrorCategory::User,
                ErrorKind::TruncatedInput,
                format!("input likely truncated while reading {}", what),
            )
        } else {
            io_error(format!("failed to read {}", what), e)
        }
    })
}

fn io_error(msg: impl Into<String>, err: io::Error) -> BatchError {
    BatchError::with_kind_and_source(ErrorCategory::Internal, ErrorKind::Io, msg, err)
}

fn metadata_too_large() -> BatchError {
    BatchError::with_kind(
        ErrorCategory::User,
        ErrorKind::InvalidInput,
        "metadata entry too large",
    )
}
