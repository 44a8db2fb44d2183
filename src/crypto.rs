//! Thin adapter over the crypto primitive crates.
//!
//! Protocol code never touches `aes`/`ctr`/`cbc`/`aes-gcm`/`des`/`hmac`
//! directly; it goes through the digest, MAC and cipher surfaces here. Each
//! cipher table entry carries its block size, key size and capability set,
//! and dispatch is through the constructed context, not through the caller
//! knowing the variant.

#[allow(unused_imports)]
use {
    crate::error::{self, Error, Result},
    log::{debug, error, info, log, trace, warn},
};

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, BlockSizeUser, KeyIvInit, StreamCipher};
use aes_gcm::{AeadInPlace, Aes128Gcm, Aes256Gcm, KeyInit};
use digest::DynDigest;
use hmac::{Hmac, Mac};
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::sshnames::*;

/// Fills `buf` from the process RNG.
pub(crate) fn fill_random(buf: &mut [u8]) {
    rand::thread_rng().fill_bytes(buf);
}

/// Hash functions available to KEX, KDF and host-key verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DigestAlgo {
    Sha1,
    Sha256,
    Sha384,
    Sha512,
    Md5,
}

impl DigestAlgo {
    pub fn hasher(&self) -> Box<dyn DynDigest> {
        match self {
            DigestAlgo::Sha1 => Box::new(sha1::Sha1::default()),
            DigestAlgo::Sha256 => Box::new(sha2::Sha256::default()),
            DigestAlgo::Sha384 => Box::new(sha2::Sha384::default()),
            DigestAlgo::Sha512 => Box::new(sha2::Sha512::default()),
            DigestAlgo::Md5 => Box::new(md5::Md5::default()),
        }
    }

    pub fn output_len(&self) -> usize {
        match self {
            DigestAlgo::Sha1 => 20,
            DigestAlgo::Sha256 => 32,
            DigestAlgo::Sha384 => 48,
            DigestAlgo::Sha512 => 64,
            DigestAlgo::Md5 => 16,
        }
    }

    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        let mut h = self.hasher();
        h.update(data);
        h.finalize_reset().to_vec()
    }
}

/// MAC algorithms offered in KEXINIT, keyed HMAC over `seq || packet`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MacAlgo {
    HmacSha256,
    HmacSha1,
    HmacSha512,
    HmacMd5,
}

impl MacAlgo {
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            SSH_NAME_HMAC_SHA2_256 => Ok(MacAlgo::HmacSha256),
            SSH_NAME_HMAC_SHA1 => Ok(MacAlgo::HmacSha1),
            SSH_NAME_HMAC_SHA2_512 => Ok(MacAlgo::HmacSha512),
            SSH_NAME_HMAC_MD5 => Ok(MacAlgo::HmacMd5),
            _ => error::AlgoNoMatch { algo: "mac" }.fail(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            MacAlgo::HmacSha256 => SSH_NAME_HMAC_SHA2_256,
            MacAlgo::HmacSha1 => SSH_NAME_HMAC_SHA1,
            MacAlgo::HmacSha512 => SSH_NAME_HMAC_SHA2_512,
            MacAlgo::HmacMd5 => SSH_NAME_HMAC_MD5,
        }
    }

    /// Key length equals the underlying digest output, RFC 4253 6.4.
    pub fn key_len(&self) -> usize {
        self.mac_len()
    }

    pub fn mac_len(&self) -> usize {
        match self {
            MacAlgo::HmacSha256 => 32,
            MacAlgo::HmacSha1 => 20,
            MacAlgo::HmacSha512 => 64,
            MacAlgo::HmacMd5 => 16,
        }
    }
}

macro_rules! hmac_compute {
    ($d:ty, $key:expr, $seq:expr, $data:expr) => {{
        let mut m = <Hmac<$d> as Mac>::new_from_slice($key)
            .map_err(|_| Error::CryptoInit { msg: "hmac key" })?;
        m.update(&$seq.to_be_bytes());
        m.update($data);
        Ok(m.finalize().into_bytes().to_vec())
    }};
}

macro_rules! hmac_verify {
    ($d:ty, $key:expr, $seq:expr, $data:expr, $mac:expr) => {{
        let mut m = <Hmac<$d> as Mac>::new_from_slice($key)
            .map_err(|_| Error::CryptoInit { msg: "hmac key" })?;
        m.update(&$seq.to_be_bytes());
        m.update($data);
        m.verify_slice($mac).map_err(|_| Error::BadIntegrity)
    }};
}

/// An integrity key for one direction.
#[derive(Zeroize, ZeroizeOnDrop)]
pub(crate) struct IntegKey {
    #[zeroize(skip)]
    algo: MacAlgo,
    key: Vec<u8>,
}

impl IntegKey {
    pub fn new(algo: MacAlgo, key: Vec<u8>) -> Self {
        IntegKey { algo, key }
    }

    pub fn mac_len(&self) -> usize {
        self.algo.mac_len()
    }

    /// MAC over the sequence number and the cleartext packet.
    pub fn compute(&self, seq: u32, packet: &[u8]) -> Result<Vec<u8>> {
        match self.algo {
            MacAlgo::HmacSha256 => hmac_compute!(sha2::Sha256, &self.key, seq, packet),
            MacAlgo::HmacSha1 => hmac_compute!(sha1::Sha1, &self.key, seq, packet),
            MacAlgo::HmacSha512 => hmac_compute!(sha2::Sha512, &self.key, seq, packet),
            MacAlgo::HmacMd5 => hmac_compute!(md5::Md5, &self.key, seq, packet),
        }
    }

    /// Constant-time verification of a received MAC.
    pub fn verify(&self, seq: u32, packet: &[u8], mac: &[u8]) -> Result<()> {
        match self.algo {
            MacAlgo::HmacSha256 => hmac_verify!(sha2::Sha256, &self.key, seq, packet, mac),
            MacAlgo::HmacSha1 => hmac_verify!(sha1::Sha1, &self.key, seq, packet, mac),
            MacAlgo::HmacSha512 => hmac_verify!(sha2::Sha512, &self.key, seq, packet, mac),
            MacAlgo::HmacMd5 => hmac_verify!(md5::Md5, &self.key, seq, packet, mac),
        }
    }
}

/// The supported cipher table. GCM and 3DES are constructible but are not
/// placed in the KEXINIT offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CipherAlgo {
    Aes128Ctr,
    Aes192Ctr,
    Aes256Ctr,
    Aes128Cbc,
    Aes192Cbc,
    Aes256Cbc,
    Aes128Gcm,
    Aes256Gcm,
    TripleDesCbc,
}

pub(crate) const CIPHER_TABLE: &[CipherAlgo] = &[
    CipherAlgo::Aes128Ctr,
    CipherAlgo::Aes192Ctr,
    CipherAlgo::Aes256Ctr,
    CipherAlgo::Aes128Cbc,
    CipherAlgo::Aes192Cbc,
    CipherAlgo::Aes256Cbc,
    CipherAlgo::Aes128Gcm,
    CipherAlgo::Aes256Gcm,
    CipherAlgo::TripleDesCbc,
];

impl CipherAlgo {
    /// Looks the name up in the cipher table.
    pub fn from_name(name: &str) -> Result<Self> {
        CIPHER_TABLE
            .iter()
            .find(|a| a.name() == name)
            .copied()
            .ok_or(Error::AlgoNoMatch { algo: "encryption" })
    }

    pub fn name(&self) -> &'static str {
        match self {
            CipherAlgo::Aes128Ctr => SSH_NAME_AES128_CTR,
            CipherAlgo::Aes192Ctr => SSH_NAME_AES192_CTR,
            CipherAlgo::Aes256Ctr => SSH_NAME_AES256_CTR,
            CipherAlgo::Aes128Cbc => SSH_NAME_AES128_CBC,
            CipherAlgo::Aes192Cbc => SSH_NAME_AES192_CBC,
            CipherAlgo::Aes256Cbc => SSH_NAME_AES256_CBC,
            CipherAlgo::Aes128Gcm => SSH_NAME_AES128_GCM,
            CipherAlgo::Aes256Gcm => SSH_NAME_AES256_GCM,
            CipherAlgo::TripleDesCbc => SSH_NAME_3DES_CBC,
        }
    }

    pub fn block_size(&self) -> usize {
        match self {
            CipherAlgo::TripleDesCbc => 8,
            _ => 16,
        }
    }

    /// Key length in bytes.
    pub fn key_len(&self) -> usize {
        match self {
            CipherAlgo::Aes128Ctr | CipherAlgo::Aes128Cbc | CipherAlgo::Aes128Gcm => 16,
            CipherAlgo::Aes192Ctr | CipherAlgo::Aes192Cbc => 24,
            CipherAlgo::Aes256Ctr | CipherAlgo::Aes256Cbc | CipherAlgo::Aes256Gcm => 32,
            CipherAlgo::TripleDesCbc => 24,
        }
    }

    pub fn iv_len(&self) -> usize {
        match self {
            CipherAlgo::Aes128Gcm | CipherAlgo::Aes256Gcm => 12,
            CipherAlgo::TripleDesCbc => 8,
            _ => 16,
        }
    }

    pub fn is_aead(&self) -> bool {
        matches!(self, CipherAlgo::Aes128Gcm | CipherAlgo::Aes256Gcm)
    }

    pub fn tag_len(&self) -> usize {
        if self.is_aead() {
            16
        } else {
            0
        }
    }
}

/// In-place keystream or block transform, direction fixed at construction.
pub(crate) trait Transform: Send {
    fn apply(&mut self, data: &mut [u8]);
}

struct StreamT<C: StreamCipher + Send>(C);

impl<C: StreamCipher + Send> Transform for StreamT<C> {
    fn apply(&mut self, data: &mut [u8]) {
        self.0.apply_keystream(data);
    }
}

struct CbcEncT<C: BlockEncryptMut + Send>(C);

impl<C: BlockEncryptMut + Send> Transform for CbcEncT<C> {
    fn apply(&mut self, data: &mut [u8]) {
        debug_assert_eq!(data.len() % C::block_size(), 0);
        for block in data.chunks_exact_mut(C::block_size()) {
            self.0.encrypt_block_mut(GenericArray::from_mut_slice(block));
        }
    }
}

struct CbcDecT<C: BlockDecryptMut + Send>(C);

impl<C: BlockDecryptMut + Send> Transform for CbcDecT<C> {
    fn apply(&mut self, data: &mut [u8]) {
        debug_assert_eq!(data.len() % C::block_size(), 0);
        for block in data.chunks_exact_mut(C::block_size()) {
            self.0.decrypt_block_mut(GenericArray::from_mut_slice(block));
        }
    }
}

enum GcmKey {
    A128(Aes128Gcm),
    A256(Aes256Gcm),
}

/// AES-GCM per RFC 5647: fixed 12-byte nonce whose trailing 64 bits are an
/// invocation counter incremented after every packet. The 4-byte length
/// field is associated data and travels unencrypted.
pub(crate) struct GcmCtx {
    key: GcmKey,
    nonce: [u8; 12],
}

impl GcmCtx {
    fn new(algo: CipherAlgo, key: &[u8], iv: &[u8]) -> Result<Self> {
        let err = || Error::CryptoInit { msg: "aes-gcm key" };
        let key = match algo {
            CipherAlgo::Aes128Gcm => {
                GcmKey::A128(Aes128Gcm::new_from_slice(key).map_err(|_| err())?)
            }
            CipherAlgo::Aes256Gcm => {
                GcmKey::A256(Aes256Gcm::new_from_slice(key).map_err(|_| err())?)
            }
            _ => return error::CryptoInit { msg: "not an aead cipher" }.fail(),
        };
        if iv.len() != 12 {
            return error::CryptoInit { msg: "aes-gcm iv" }.fail();
        }
        let mut nonce = [0u8; 12];
        nonce.copy_from_slice(iv);
        Ok(GcmCtx { key, nonce })
    }

    fn bump_nonce(&mut self) {
        let mut ctr = [0u8; 8];
        ctr.copy_from_slice(&self.nonce[4..]);
        let ctr = u64::from_be_bytes(ctr).wrapping_add(1);
        self.nonce[4..].copy_from_slice(&ctr.to_be_bytes());
    }

    /// Encrypts `data` in place and returns the tag.
    pub fn seal(&mut self, aad: &[u8], data: &mut [u8]) -> Result<Vec<u8>> {
        let nonce = aes_gcm::Nonce::from_slice(&self.nonce);
        let tag = match &self.key {
            GcmKey::A128(c) => c.encrypt_in_place_detached(nonce, aad, data),
            GcmKey::A256(c) => c.encrypt_in_place_detached(nonce, aad, data),
        }
        .map_err(|_| Error::BadIntegrity)?;
        self.bump_nonce();
        Ok(tag.to_vec())
    }

    /// Decrypts `data` in place, verifying the tag.
    pub fn open(&mut self, aad: &[u8], data: &mut [u8], tag: &[u8]) -> Result<()> {
        if tag.len() != 16 {
            return Err(Error::BadIntegrity);
        }
        let nonce = aes_gcm::Nonce::from_slice(&self.nonce);
        let tag = aes_gcm::Tag::from_slice(tag);
        match &self.key {
            GcmKey::A128(c) => c.decrypt_in_place_detached(nonce, aad, data, tag),
            GcmKey::A256(c) => c.decrypt_in_place_detached(nonce, aad, data, tag),
        }
        .map_err(|_| Error::BadIntegrity)?;
        self.bump_nonce();
        Ok(())
    }
}

/// An initialized cipher handle for one direction.
pub(crate) enum CipherCtx {
    /// Pre-NEWKEYS cleartext.
    None,
    /// CTR/CBC/3DES, paired with a separate HMAC.
    Std { algo: CipherAlgo, t: Box<dyn Transform> },
    /// AEAD, integrity by tag.
    Aead { algo: CipherAlgo, g: GcmCtx },
}

impl CipherCtx {
    /// `set_encrypt_key` of the adapter surface.
    pub fn encryptor(algo: CipherAlgo, key: &[u8], iv: &[u8]) -> Result<Self> {
        Self::build(algo, key, iv, true)
    }

    /// `set_decrypt_key` of the adapter surface.
    pub fn decryptor(algo: CipherAlgo, key: &[u8], iv: &[u8]) -> Result<Self> {
        Self::build(algo, key, iv, false)
    }

    fn build(algo: CipherAlgo, key: &[u8], iv: &[u8], enc: bool) -> Result<Self> {
        let err = || Error::CryptoInit { msg: "cipher key/iv" };
        // SSH framing supplies its own padding, none is applied here.
        let t: Box<dyn Transform> = match algo {
            CipherAlgo::Aes128Ctr => Box::new(StreamT(
                ctr::Ctr128BE::<aes::Aes128>::new_from_slices(key, iv).map_err(|_| err())?,
            )),
            CipherAlgo::Aes192Ctr => Box::new(StreamT(
                ctr::Ctr128BE::<aes::Aes192>::new_from_slices(key, iv).map_err(|_| err())?,
            )),
            CipherAlgo::Aes256Ctr => Box::new(StreamT(
                ctr::Ctr128BE::<aes::Aes256>::new_from_slices(key, iv).map_err(|_| err())?,
            )),
            CipherAlgo::Aes128Cbc if enc => Box::new(CbcEncT(
                cbc::Encryptor::<aes::Aes128>::new_from_slices(key, iv).map_err(|_| err())?,
            )),
            CipherAlgo::Aes128Cbc => Box::new(CbcDecT(
                cbc::Decryptor::<aes::Aes128>::new_from_slices(key, iv).map_err(|_| err())?,
            )),
            CipherAlgo::Aes192Cbc if enc => Box::new(CbcEncT(
                cbc::Encryptor::<aes::Aes192>::new_from_slices(key, iv).map_err(|_| err())?,
            )),
            CipherAlgo::Aes192Cbc => Box::new(CbcDecT(
                cbc::Decryptor::<aes::Aes192>::new_from_slices(key, iv).map_err(|_| err())?,
            )),
            CipherAlgo::Aes256Cbc if enc => Box::new(CbcEncT(
                cbc::Encryptor::<aes::Aes256>::new_from_slices(key, iv).map_err(|_| err())?,
            )),
            CipherAlgo::Aes256Cbc => Box::new(CbcDecT(
                cbc::Decryptor::<aes::Aes256>::new_from_slices(key, iv).map_err(|_| err())?,
            )),
            CipherAlgo::TripleDesCbc if enc => Box::new(CbcEncT(
                cbc::Encryptor::<des::TdesEde3>::new_from_slices(key, iv).map_err(|_| err())?,
            )),
            CipherAlgo::TripleDesCbc => Box::new(CbcDecT(
                cbc::Decryptor::<des::TdesEde3>::new_from_slices(key, iv).map_err(|_| err())?,
            )),
            CipherAlgo::Aes128Gcm | CipherAlgo::Aes256Gcm => {
                return Ok(CipherCtx::Aead { algo, g: GcmCtx::new(algo, key, iv)? });
            }
        };
        Ok(CipherCtx::Std { algo, t })
    }

    pub fn is_aead(&self) -> bool {
        matches!(self, CipherCtx::Aead { .. })
    }

    pub fn block_size(&self) -> usize {
        match self {
            CipherCtx::None => 8,
            CipherCtx::Std { algo, .. } | CipherCtx::Aead { algo, .. } => algo.block_size(),
        }
    }

    pub fn tag_len(&self) -> usize {
        match self {
            CipherCtx::Aead { algo, .. } => algo.tag_len(),
            _ => 0,
        }
    }

    /// In-place encrypt or decrypt for non-AEAD contexts.
    pub fn apply(&mut self, data: &mut [u8]) -> Result<()> {
        match self {
            CipherCtx::None => Ok(()),
            CipherCtx::Std { t, .. } => {
                t.apply(data);
                Ok(())
            }
            CipherCtx::Aead { .. } => {
                error::Protocol { msg: "aead cipher used as a block cipher" }.fail()
            }
        }
    }

    pub fn aead(&mut self) -> Result<&mut GcmCtx> {
        match self {
            CipherCtx::Aead { g, .. } => Ok(g),
            _ => error::Protocol { msg: "not an aead cipher" }.fail(),
        }
    }

    /// `get_length`: the cleartext packet length of an incoming AEAD packet.
    /// For AES-GCM the four length bytes arrive unencrypted.
    pub fn aead_packet_length(&self, first4: &[u8; 4]) -> u32 {
        u32::from_be_bytes(*first4)
    }
}
