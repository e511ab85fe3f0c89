use std::fs;
use std::path::PathBuf;
use std::sync::{Mutex, RwLock};

use aes::Aes128;
use cfb8::cipher::{AsyncStreamCipher, KeyIvInit};
use cfb8::{Decryptor, Encryptor};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::TryRngCore;
use sha2::Sha256;

use crate::error::{Result, StoreError};
use crate::lru::LruCache;

type HmacSha256 = Hmac<Sha256>;

const MAC_LEN: usize = 32;
const IV_LEN: usize = 16;

/// Decrypted slots kept around between reads.
const CACHE_SLOTS: usize = 10;

struct BackendState {
    length: usize,
    cache: LruCache<usize, Vec<u8>>,
}

/// An integer-indexed array of authenticated ciphertext blocks, one file per
/// slot inside a single directory. Every stored block is
/// `HMAC-SHA256(iv ‖ ct) ‖ iv ‖ AES-128-CFB8(plaintext)` and is replaced
/// atomically via a temp file and rename.
pub struct Backend {
    key: [u8; 16],
    directory: PathBuf,
    /// Reads share, writes exclude.
    lock: RwLock<()>,
    state: Mutex<BackendState>,
}

impl Backend {
    pub fn open(key: [u8; 16], directory: impl Into<PathBuf>) -> Result<Self> {
        let directory = directory.into();

        let mut length = 0;
        for entry in fs::read_dir(&directory)? {
            // anything that isn't named by a slot number is ignored
            if let Ok(index) = entry?.file_name().to_string_lossy().parse::<usize>() {
                length = length.max(index + 1);
            }
        }

        Ok(Self {
            key,
            directory,
            lock: RwLock::new(()),
            state: Mutex::new(BackendState {
                length,
                cache: LruCache::new(CACHE_SLOTS),
            }),
        })
    }

    /// Highest written slot plus one.
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().length
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot_path(&self, index: usize) -> PathBuf {
        self.directory.join(index.to_string())
    }

    /// Fetches and decrypts one slot. `Ok(None)` means the slot has never
    /// been written; a failed MAC or read is an error for this slot only.
    pub fn get(&self, index: usize) -> Result<Option<Vec<u8>>> {
        let _shared = self.lock.read().unwrap();
        let path = self.slot_path(index);

        {
            let mut state = self.state.lock().unwrap();
            if let Some((data, fetched)) = state.cache.get(&index) {
                let fresh = fs::metadata(&path)
                    .and_then(|meta| meta.modified())
                    .map(|mtime| mtime <= fetched)
                    .unwrap_or(false);
                if fresh {
                    return Ok(Some(data));
                }
                state.cache.remove(&index);
            }
        }

        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let plain = self.decrypt(raw)?;

        let mut state = self.state.lock().unwrap();
        if index >= state.length {
            state.length = index + 1;
        }
        state.cache.put(index, plain.clone());

        Ok(Some(plain))
    }

    /// Encrypts and atomically replaces one slot.
    pub fn set(&self, index: usize, plaintext: &[u8]) -> Result<()> {
        let _exclusive = self.lock.write().unwrap();

        let sealed = self.encrypt(plaintext)?;
        let dest = self.slot_path(index);
        let temp = self.directory.join(format!("{index}.temp"));
        fs::write(&temp, &sealed)?;
        fs::rename(&temp, &dest)?;

        let mut state = self.state.lock().unwrap();
        if index >= state.length {
            state.length = index + 1;
        }
        state.cache.put(index, plaintext.to_vec());

        Ok(())
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut iv = [0u8; IV_LEN];
        OsRng.try_fill_bytes(&mut iv)?;

        let mut body = plaintext.to_vec();
        Encryptor::<Aes128>::new_from_slices(&self.key, &iv)?.encrypt(&mut body);

        let mut mac = HmacSha256::new_from_slice(&self.key)?;
        mac.update(&iv);
        mac.update(&body);

        let mut out = Vec::with_capacity(MAC_LEN + IV_LEN + body.len());
        out.extend_from_slice(&mac.finalize().into_bytes());
        out.extend_from_slice(&iv);
        out.extend_from_slice(&body);
        Ok(out)
    }

    fn decrypt(&self, raw: Vec<u8>) -> Result<Vec<u8>> {
        if raw.len() < MAC_LEN + IV_LEN {
            return StoreError::corrupt("ciphertext shorter than its header");
        }

        let (tag, rest) = raw.split_at(MAC_LEN);
        let mut mac = HmacSha256::new_from_slice(&self.key)?;
        mac.update(rest);
        mac.verify_slice(tag)?;

        let (iv, ciphertext) = rest.split_at(IV_LEN);
        let mut body = ciphertext.to_vec();
        Decryptor::<Aes128>::new_from_slices(&self.key, iv)?.decrypt(&mut body);
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(dir: &std::path::Path) -> Backend {
        Backend::open(*b"0123456789abcdef", dir).unwrap()
    }

    #[test]
    fn roundtrip_and_length() {
        let dir = tempfile::tempdir().unwrap();
        let back = backend(dir.path());
        assert_eq!(back.len(), 0);

        back.set(3, b"three").unwrap();
        assert_eq!(back.len(), 4);
        assert_eq!(back.get(3).unwrap(), Some(b"three".to_vec()));
        assert_eq!(back.get(2).unwrap(), None);
    }

    #[test]
    fn reopen_scans_slot_files() {
        let dir = tempfile::tempdir().unwrap();
        {
            let back = backend(dir.path());
            back.set(0, b"zero").unwrap();
            back.set(7, b"seven").unwrap();
        }
        std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        let back = backend(dir.path());
        assert_eq!(back.len(), 8);
        assert_eq!(back.get(7).unwrap(), Some(b"seven".to_vec()));
    }

    #[test]
    fn tampering_fails_the_mac() {
        let dir = tempfile::tempdir().unwrap();
        let back = backend(dir.path());
        back.set(0, b"secret").unwrap();

        let path = dir.path().join("0");
        let mut raw = std::fs::read(&path).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xff;
        std::fs::write(&path, &raw).unwrap();

        // a second handle, so the cached plaintext can't answer
        let fresh = backend(dir.path());
        assert!(fresh.get(0).is_err());
    }

    #[test]
    fn wrong_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        backend(dir.path()).set(0, b"secret").unwrap();

        let other = Backend::open(*b"fedcba9876543210", dir.path()).unwrap();
        assert!(other.get(0).is_err());
    }

    #[test]
    fn overwrite_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let back = backend(dir.path());
        back.set(1, b"old").unwrap();
        back.set(1, b"new").unwrap();
        assert_eq!(back.get(1).unwrap(), Some(b"new".to_vec()));
    }
}
