//! Encrypted archive envelope.
//!
//! Byte layout, in order:
//!
//! ```text
//! magic "BKUPENV\0" (8) | version (1) | flags (1, v2+) | iv (16)
//! | [salt_len (1) | salt (salt_len)]   when flags bit 0 is set
//! | AES-256-CBC/PKCS#7 ciphertext
//! | HMAC-SHA256 over everything above (32)
//! ```
//!
//! A password is stretched with Argon2id over the stored salt; without one
//! the 32-byte installation key is used directly. Either master key is split
//! with HKDF-SHA256 into an encryption key and a MAC key. Because the MAC key
//! depends on the password, a wrong password is reported as an integrity
//! failure rather than a decryption failure.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use argon2::Argon2;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::utils::pulse::{quiet, Pulse, PulseWriter};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type HmacSha256 = Hmac<Sha256>;

pub const MAGIC: &[u8; 8] = b"BKUPENV\0";
pub const CURRENT_VERSION: u8 = 2;
pub const FLAG_PASSWORD: u8 = 0b0000_0001;
pub const IV_LEN: usize = 16;
pub const TAG_LEN: usize = 32;
pub const MIN_SALT_LEN: usize = 8;
pub const MAX_SALT_LEN: usize = 64;

const SALT_LEN: usize = 16;
const BLOCK_LEN: usize = 16;
const CHUNK_LEN: usize = 64 * 1024;
const ENC_INFO: &[u8] = b"backup-envelope/v2/encryption";
const MAC_INFO: &[u8] = b"backup-envelope/v2/authentication";

#[derive(Error, Debug)]
pub enum EnvelopeError {
    #[error("not an encrypted archive (bad magic bytes)")]
    BadMagic,

    #[error("unsupported envelope version {0}")]
    UnsupportedVersion(u8),

    #[error("unsupported envelope flags {0:#04x}")]
    UnsupportedFlags(u8),

    #[error("malformed envelope: {0}")]
    Malformed(String),

    #[error("envelope is truncated")]
    Truncated,

    #[error("{0}")]
    KeyMismatch(&'static str),

    #[error("key derivation failed: {0}")]
    Kdf(String),

    #[error("envelope failed its integrity check (tampered, corrupt, or wrong password)")]
    Integrity,

    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl EnvelopeError {
    fn from_read(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            EnvelopeError::Truncated
        } else {
            EnvelopeError::Io(err)
        }
    }
}

/// Secret material an envelope is sealed with.
#[derive(Clone)]
pub enum KeySource {
    Password(String),
    InstallationKey([u8; 32]),
}

impl KeySource {
    pub fn generate_installation_key() -> [u8; 32] {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        key
    }

    /// Parse a hex-encoded installation key as kept in settings.
    pub fn installation_key_from_hex(text: &str) -> Result<Self, EnvelopeError> {
        let bytes = hex::decode(text.trim())
            .map_err(|e| EnvelopeError::Malformed(format!("installation key: {e}")))?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| EnvelopeError::Malformed("installation key must be 32 bytes".into()))?;
        Ok(KeySource::InstallationKey(key))
    }

    pub fn is_password(&self) -> bool {
        matches!(self, KeySource::Password(_))
    }
}

impl fmt::Debug for KeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeySource::Password(_) => f.write_str("KeySource::Password([REDACTED])"),
            KeySource::InstallationKey(_) => f.write_str("KeySource::InstallationKey([REDACTED])"),
        }
    }
}

/// Everything in front of the ciphertext.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvelopeHeader {
    pub version: u8,
    pub flags: u8,
    pub iv: [u8; IV_LEN],
    pub salt: Option<Vec<u8>>,
}

impl EnvelopeHeader {
    fn fresh(source: &KeySource) -> Self {
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);
        let salt = source.is_password().then(|| {
            let mut salt = vec![0u8; SALT_LEN];
            OsRng.fill_bytes(&mut salt);
            salt
        });
        Self {
            version: CURRENT_VERSION,
            flags: if salt.is_some() { FLAG_PASSWORD } else { 0 },
            iv,
            salt,
        }
    }

    pub fn password_protected(&self) -> bool {
        self.flags & FLAG_PASSWORD != 0
    }

    pub fn encoded_len(&self) -> usize {
        let flags = usize::from(self.version >= 2);
        let salt = self.salt.as_ref().map_or(0, |s| 1 + s.len());
        MAGIC.len() + 1 + flags + IV_LEN + salt
    }

    fn write_to<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_all(MAGIC)?;
        out.write_all(&[self.version])?;
        if self.version >= 2 {
            out.write_all(&[self.flags])?;
        }
        out.write_all(&self.iv)?;
        if let Some(salt) = &self.salt {
            out.write_all(&[salt.len() as u8])?;
            out.write_all(salt)?;
        }
        Ok(())
    }

    /// Parse and validate the header. No secret material is touched.
    pub fn read_from<R: Read>(input: &mut R) -> Result<Self, EnvelopeError> {
        let mut magic = [0u8; 8];
        input.read_exact(&mut magic).map_err(EnvelopeError::from_read)?;
        if &magic != MAGIC {
            return Err(EnvelopeError::BadMagic);
        }

        let mut byte = [0u8; 1];
        input.read_exact(&mut byte).map_err(EnvelopeError::from_read)?;
        let version = byte[0];
        let flags = match version {
            1 => 0,
            2 => {
                input.read_exact(&mut byte).map_err(EnvelopeError::from_read)?;
                byte[0]
            }
            other => return Err(EnvelopeError::UnsupportedVersion(other)),
        };
        if flags & !FLAG_PASSWORD != 0 {
            return Err(EnvelopeError::UnsupportedFlags(flags));
        }

        let mut iv = [0u8; IV_LEN];
        input.read_exact(&mut iv).map_err(EnvelopeError::from_read)?;

        let salt = if flags & FLAG_PASSWORD != 0 {
            input.read_exact(&mut byte).map_err(EnvelopeError::from_read)?;
            let len = usize::from(byte[0]);
            if !(MIN_SALT_LEN..=MAX_SALT_LEN).contains(&len) {
                return Err(EnvelopeError::Malformed(format!("salt length {len}")));
            }
            let mut salt = vec![0u8; len];
            input.read_exact(&mut salt).map_err(EnvelopeError::from_read)?;
            Some(salt)
        } else {
            None
        };

        Ok(Self { version, flags, iv, salt })
    }
}

struct DerivedKeys {
    encryption: [u8; 32],
    authentication: [u8; 32],
}

fn derive_keys(source: &KeySource, header: &EnvelopeHeader) -> Result<DerivedKeys, EnvelopeError> {
    let master = match (source, header.salt.as_deref()) {
        (KeySource::Password(password), Some(salt)) => {
            if password.is_empty() {
                return Err(EnvelopeError::Kdf("password must not be empty".into()));
            }
            let mut master = [0u8; 32];
            Argon2::default()
                .hash_password_into(password.as_bytes(), salt, &mut master)
                .map_err(|e| EnvelopeError::Kdf(e.to_string()))?;
            master
        }
        (KeySource::InstallationKey(key), None) => *key,
        (KeySource::Password(_), None) => {
            return Err(EnvelopeError::KeyMismatch(
                "archive was sealed with the installation key, not a password",
            ))
        }
        (KeySource::InstallationKey(_), Some(_)) => {
            return Err(EnvelopeError::KeyMismatch("archive is password protected"))
        }
    };

    let hk = Hkdf::<Sha256>::new(None, &master);
    let mut keys = DerivedKeys {
        encryption: [0u8; 32],
        authentication: [0u8; 32],
    };
    hk.expand(ENC_INFO, &mut keys.encryption)
        .and_then(|_| hk.expand(MAC_INFO, &mut keys.authentication))
        .map_err(|e| EnvelopeError::Kdf(e.to_string()))?;
    Ok(keys)
}

fn new_mac(key: &[u8; 32]) -> Result<HmacSha256, EnvelopeError> {
    <HmacSha256 as Mac>::new_from_slice(key).map_err(|e| EnvelopeError::Kdf(e.to_string()))
}

/// Writer that feeds everything it writes into the envelope HMAC.
struct MacWriter<W: Write> {
    inner: W,
    mac: HmacSha256,
}

impl<W: Write> Write for MacWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.mac.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

fn read_full<R: Read>(input: &mut R, buf: &mut [u8]) -> io::Result<usize> {
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

fn encrypt_blocks(cipher: &mut Aes256CbcEnc, data: &mut [u8]) {
    for block in data.chunks_exact_mut(BLOCK_LEN) {
        cipher.encrypt_block_mut(GenericArray::from_mut_slice(block));
    }
}

fn decrypt_blocks(cipher: &mut Aes256CbcDec, data: &mut [u8]) {
    for block in data.chunks_exact_mut(BLOCK_LEN) {
        cipher.decrypt_block_mut(GenericArray::from_mut_slice(block));
    }
}

fn seal_stream<R: Read, W: Write>(
    mut input: R,
    output: W,
    source: &KeySource,
    header: &EnvelopeHeader,
) -> Result<u64, EnvelopeError> {
    let keys = derive_keys(source, header)?;
    let mut cipher = Aes256CbcEnc::new_from_slices(&keys.encryption, &header.iv)
        .map_err(|e| EnvelopeError::Kdf(e.to_string()))?;
    let mut out = MacWriter {
        inner: output,
        mac: new_mac(&keys.authentication)?,
    };

    header.write_to(&mut out)?;
    let mut written = header.encoded_len() as u64;

    let mut buf = vec![0u8; CHUNK_LEN + BLOCK_LEN];
    let mut pending = 0usize;
    loop {
        let n = read_full(&mut input, &mut buf[pending..pending + CHUNK_LEN])?;
        if n == 0 {
            break;
        }
        pending += n;
        let whole = pending - pending % BLOCK_LEN;
        encrypt_blocks(&mut cipher, &mut buf[..whole]);
        out.write_all(&buf[..whole])?;
        written += whole as u64;
        buf.copy_within(whole..pending, 0);
        pending -= whole;
    }

    // PKCS#7: always at least one byte of padding, a whole block when aligned.
    let pad = BLOCK_LEN - pending;
    buf[pending..BLOCK_LEN].fill(pad as u8);
    encrypt_blocks(&mut cipher, &mut buf[..BLOCK_LEN]);
    out.write_all(&buf[..BLOCK_LEN])?;
    written += BLOCK_LEN as u64;

    let MacWriter { mut inner, mac } = out;
    inner.write_all(&mac.finalize().into_bytes())?;
    inner.flush()?;
    Ok(written + TAG_LEN as u64)
}

fn open_stream<R: Read + Seek, W: Write>(
    mut input: R,
    mut output: W,
    source: &KeySource,
) -> Result<u64, EnvelopeError> {
    let total = input.seek(SeekFrom::End(0))?;
    input.seek(SeekFrom::Start(0))?;

    let header = EnvelopeHeader::read_from(&mut input)?;
    let header_len = header.encoded_len() as u64;
    if total < header_len + (BLOCK_LEN + TAG_LEN) as u64 {
        return Err(EnvelopeError::Truncated);
    }
    let body_len = total - header_len - TAG_LEN as u64;

    let keys = derive_keys(source, &header)?;

    // Authenticate the whole envelope before decrypting a single block.
    input.seek(SeekFrom::Start(0))?;
    let mut mac = new_mac(&keys.authentication)?;
    let mut buf = vec![0u8; CHUNK_LEN];
    let mut protected = (&mut input).take(header_len + body_len);
    loop {
        let n = read_full(&mut protected, &mut buf)?;
        if n == 0 {
            break;
        }
        mac.update(&buf[..n]);
    }
    let mut tag = [0u8; TAG_LEN];
    input.read_exact(&mut tag).map_err(EnvelopeError::from_read)?;
    mac.verify_slice(&tag).map_err(|_| EnvelopeError::Integrity)?;

    if body_len % BLOCK_LEN as u64 != 0 {
        return Err(EnvelopeError::Decryption(
            "ciphertext is not a whole number of blocks".into(),
        ));
    }

    input.seek(SeekFrom::Start(header_len))?;
    let mut cipher = Aes256CbcDec::new_from_slices(&keys.encryption, &header.iv)
        .map_err(|e| EnvelopeError::Kdf(e.to_string()))?;
    let mut body = input.take(body_len);
    let mut held: Option<[u8; BLOCK_LEN]> = None;
    let mut written = 0u64;
    loop {
        let n = read_full(&mut body, &mut buf)?;
        if n == 0 {
            break;
        }
        decrypt_blocks(&mut cipher, &mut buf[..n]);
        if let Some(previous) = held.take() {
            output.write_all(&previous)?;
            written += BLOCK_LEN as u64;
        }
        output.write_all(&buf[..n - BLOCK_LEN])?;
        written += (n - BLOCK_LEN) as u64;
        let mut last = [0u8; BLOCK_LEN];
        last.copy_from_slice(&buf[n - BLOCK_LEN..n]);
        held = Some(last);
    }

    let last = held.ok_or(EnvelopeError::Truncated)?;
    let pad = usize::from(last[BLOCK_LEN - 1]);
    if pad == 0 || pad > BLOCK_LEN || !last[BLOCK_LEN - pad..].iter().all(|b| usize::from(*b) == pad)
    {
        return Err(EnvelopeError::Decryption("invalid padding".into()));
    }
    output.write_all(&last[..BLOCK_LEN - pad])?;
    output.flush()?;
    Ok(written + (BLOCK_LEN - pad) as u64)
}

fn part_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

/// Write `dst` as the envelope of `src`. Returns the envelope size.
pub fn encrypt_file(src: &Path, dst: &Path, source: &KeySource) -> Result<u64, EnvelopeError> {
    encrypt_file_with(src, dst, source, &mut quiet())
}

/// [`encrypt_file`], firing `pulse` between chunks of ciphertext.
pub fn encrypt_file_with(
    src: &Path,
    dst: &Path,
    source: &KeySource,
    pulse: &mut Pulse<'_>,
) -> Result<u64, EnvelopeError> {
    let header = EnvelopeHeader::fresh(source);
    let input = BufReader::new(File::open(src)?);
    let part = part_path(dst);
    let result = File::create(&part)
        .map_err(EnvelopeError::from)
        .and_then(|file| {
            let mut out = BufWriter::new(file);
            let size = seal_stream(input, PulseWriter::new(&mut out, &mut *pulse), source, &header)?;
            out.into_inner()
                .map_err(|e| EnvelopeError::Io(e.into_error()))?
                .sync_all()?;
            Ok(size)
        });

    match result {
        Ok(size) => {
            fs::rename(&part, dst)?;
            tracing::debug!(path = %dst.display(), size, "Archive sealed");
            Ok(size)
        }
        Err(e) => {
            let _ = fs::remove_file(&part);
            Err(e)
        }
    }
}

/// Authenticate and decrypt `src` into `dst`. Nothing appears at `dst`
/// unless the whole envelope verified and decrypted.
pub fn decrypt_file(src: &Path, dst: &Path, source: &KeySource) -> Result<u64, EnvelopeError> {
    let input = BufReader::new(File::open(src)?);
    let part = part_path(dst);
    let result = File::create(&part)
        .map_err(EnvelopeError::from)
        .and_then(|file| {
            let mut out = BufWriter::new(file);
            let size = open_stream(input, &mut out, source)?;
            out.into_inner()
                .map_err(|e| EnvelopeError::Io(e.into_error()))?
                .sync_all()?;
            Ok(size)
        });

    match result {
        Ok(size) => {
            fs::rename(&part, dst)?;
            Ok(size)
        }
        Err(e) => {
            let _ = fs::remove_file(&part);
            tracing::warn!(path = %src.display(), error = %e, "Envelope rejected");
            Err(e)
        }
    }
}

/// In-memory variant of [`encrypt_file`].
pub fn seal(plaintext: &[u8], source: &KeySource) -> Result<Vec<u8>, EnvelopeError> {
    let header = EnvelopeHeader::fresh(source);
    let mut out = Vec::with_capacity(header.encoded_len() + plaintext.len() + BLOCK_LEN + TAG_LEN);
    seal_stream(plaintext, &mut out, source, &header)?;
    Ok(out)
}

/// In-memory variant of [`decrypt_file`].
pub fn open(envelope: &[u8], source: &KeySource) -> Result<Vec<u8>, EnvelopeError> {
    let mut out = Vec::with_capacity(envelope.len());
    open_stream(Cursor::new(envelope), &mut out, source)?;
    Ok(out)
}

pub fn inspect<R: Read>(mut reader: R) -> Result<EnvelopeHeader, EnvelopeError> {
    EnvelopeHeader::read_from(&mut reader)
}

/// Cheap magic-bytes probe.
pub fn is_envelope(path: &Path) -> io::Result<bool> {
    let mut magic = [0u8; 8];
    let mut file = File::open(path)?;
    match file.read_exact(&mut magic) {
        Ok(()) => Ok(&magic == MAGIC),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}
