use crate::{Error, Result};
use aes::Aes256;
use cbc::cipher::generic_array::GenericArray;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use sha2::Sha256;
use std::io::{self, Read, Write};

/// Built-in salt for key derivation. Artifacts carry no salt, so changing this makes every
/// existing encrypted artifact unreadable.
const SALT: &[u8] = b"vaultkeep-salt";
const KDF_ROUNDS: u32 = 2;
const CHUNK_SIZE: usize = 512;
const BLOCK: usize = 16;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// AES-256 key and CBC initialization vector derived from a passphrase.
pub struct CipherKey {
    key: [u8; 32],
    iv: [u8; 16],
}

impl CipherKey {
    /// Derives key and IV with PBKDF2-HMAC-SHA256 over the fixed salt. The same passphrase
    /// always yields the same key and IV.
    pub fn derive(passphrase: &str) -> Result<Self> {
        if passphrase.is_empty() {
            return Err(Error::EmptyKey);
        }

        let mut material = [0u8; 48];
        pbkdf2::pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), SALT, KDF_ROUNDS, &mut material);

        let mut key = [0u8; 32];
        let mut iv = [0u8; 16];
        key.copy_from_slice(&material[..32]);
        iv.copy_from_slice(&material[32..]);
        Ok(Self { key, iv })
    }

    fn encryptor(&self) -> Result<Aes256CbcEnc> {
        Aes256CbcEnc::new_from_slices(&self.key, &self.iv)
            .map_err(|e| Error::Encryption(e.to_string()))
    }

    fn decryptor(&self) -> Result<Aes256CbcDec> {
        Aes256CbcDec::new_from_slices(&self.key, &self.iv)
            .map_err(|e| Error::Encryption(e.to_string()))
    }
}

fn read_chunk<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        match reader.read(buf) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

/// Encrypts `input` into `output` with AES-256-CBC and PKCS#7 padding, streaming in
/// 512-byte chunks.
pub fn encrypt<R: Read, W: Write>(input: &mut R, output: &mut W, passphrase: &str) -> Result<()> {
    let mut cipher = CipherKey::derive(passphrase)?.encryptor()?;

    let mut pending: Vec<u8> = Vec::with_capacity(CHUNK_SIZE + BLOCK);
    let mut chunk = [0u8; CHUNK_SIZE];
    loop {
        let n = read_chunk(input, &mut chunk)?;
        if n == 0 {
            break;
        }
        pending.extend_from_slice(&chunk[..n]);

        let whole = pending.len() / BLOCK * BLOCK;
        for block in pending[..whole].chunks_exact_mut(BLOCK) {
            cipher.encrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        output.write_all(&pending[..whole])?;
        pending.drain(..whole);
    }

    // PKCS#7: always add 1..=16 bytes.
    let pad = BLOCK - pending.len();
    pending.resize(BLOCK, pad as u8);
    cipher.encrypt_block_mut(GenericArray::from_mut_slice(&mut pending));
    output.write_all(&pending)?;
    output.flush()?;
    Ok(())
}

/// Reverses [`encrypt`]. A wrong passphrase almost always surfaces as a padding error.
pub fn decrypt<R: Read, W: Write>(input: &mut R, output: &mut W, passphrase: &str) -> Result<()> {
    let mut cipher = CipherKey::derive(passphrase)?.decryptor()?;

    let mut pending: Vec<u8> = Vec::with_capacity(CHUNK_SIZE + BLOCK);
    let mut chunk = [0u8; CHUNK_SIZE];
    loop {
        let n = read_chunk(input, &mut chunk)?;
        if n == 0 {
            break;
        }
        pending.extend_from_slice(&chunk[..n]);

        // The final block is held back until end of input so its padding can be stripped.
        let whole = pending.len() / BLOCK * BLOCK;
        let ready = whole.saturating_sub(BLOCK);
        for block in pending[..ready].chunks_exact_mut(BLOCK) {
            cipher.decrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        output.write_all(&pending[..ready])?;
        pending.drain(..ready);
    }

    if pending.len() != BLOCK {
        return Err(Error::Encryption(
            "ciphertext is not a whole number of blocks".to_string(),
        ));
    }

    cipher.decrypt_block_mut(GenericArray::from_mut_slice(&mut pending));
    let pad = pending[BLOCK - 1] as usize;
    if pad == 0 || pad > BLOCK || pending[BLOCK - pad..].iter().any(|&b| b as usize != pad) {
        return Err(Error::Encryption(
            "invalid padding (wrong key or corrupted data)".to_string(),
        ));
    }
    output.write_all(&pending[..BLOCK - pad])?;
    output.flush()?;
    Ok(())
}
