//! Session encryption. Once a login completes, both directions of a
//! connection run through AES-128/CFB-8: every framed byte after the switch
//! is cipher output. CFB-8 works on single-byte blocks, so the ciphers can
//! be fed incrementally with whatever the socket delivers.

use aes::Aes128;
use cfb8::cipher::inout::InOutBuf;
use cfb8::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};

pub const KEY_SIZE: usize = 16;
pub const IV_SIZE: usize = 16;

type Enc = cfb8::Encryptor<Aes128>;
type Dec = cfb8::Decryptor<Aes128>;

/// Outbound half of the session cipher.
pub struct SendCipher {
    inner: Enc,
}

impl SendCipher {
    #[inline]
    pub fn new(key: &[u8; KEY_SIZE], iv: &[u8; IV_SIZE]) -> SendCipher {
        SendCipher {
            inner: Enc::new(key.into(), iv.into()),
        }
    }

    /// Encrypts `data` in place, advancing the cipher stream.
    #[inline]
    pub fn encrypt(&mut self, data: &mut [u8]) {
        let (blocks, rest) = InOutBuf::from(data).into_chunks();
        debug_assert!(rest.is_empty());
        self.inner.encrypt_blocks_inout_mut(blocks);
    }
}

/// Inbound half of the session cipher.
pub struct RecvCipher {
    inner: Dec,
}

impl RecvCipher {
    #[inline]
    pub fn new(key: &[u8; KEY_SIZE], iv: &[u8; IV_SIZE]) -> RecvCipher {
        RecvCipher {
            inner: Dec::new(key.into(), iv.into()),
        }
    }

    /// Decrypts `data` in place, advancing the cipher stream.
    #[inline]
    pub fn decrypt(&mut self, data: &mut [u8]) {
        let (blocks, rest) = InOutBuf::from(data).into_chunks();
        debug_assert!(rest.is_empty());
        self.inner.decrypt_blocks_inout_mut(blocks);
    }
}

/// Builds both directions from one shared secret. The protocol uses the
/// secret as key and initialization vector alike.
#[inline]
pub fn pair(secret: &[u8; KEY_SIZE]) -> (SendCipher, RecvCipher) {
    (SendCipher::new(secret, secret), RecvCipher::new(secret, secret))
}
