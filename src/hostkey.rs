//! Server host-key handling.
//!
//! The KEXDH reply carries the host key as a wire blob
//! (`string "ssh-rsa", mpint e, mpint n`) and a signature blob
//! (`string "ssh-rsa", string sig`) over the exchange hash. The signature
//! scheme for `ssh-rsa` is RSASSA-PKCS1-v1_5 with SHA-1 (RFC 4253 6.6).
//! Trust in the key itself is decided elsewhere, by the caller's behaviour
//! hook; this module only checks the mathematics.

#[allow(unused_imports)]
use {
    crate::error::{self, Error, Result},
    log::{debug, error, info, log, trace, warn},
};

use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Sign, RsaPublicKey};

use crate::buffer::Buffer;
use crate::crypto::DigestAlgo;
use crate::sshnames::SSH_NAME_RSA;

/// Verifies the server signature over the exchange hash `h`.
pub(crate) fn verify_signature(key_blob: &[u8], h: &[u8], sig_blob: &[u8]) -> Result<()> {
    let key = parse_rsa_blob(key_blob)?;
    let sig = parse_sig_blob(sig_blob, key.size())?;

    let hashed = DigestAlgo::Sha1.digest(h);
    key.verify(Pkcs1v15Sign::new::<sha1::Sha1>(), &hashed, &sig).map_err(|_| {
        warn!("host key signature did not verify");
        Error::HostKey { msg: "signature verification failed" }
    })?;
    debug!("host key signature is valid");
    Ok(())
}

fn parse_rsa_blob(blob: &[u8]) -> Result<RsaPublicKey> {
    let mut b = Buffer::from_slice(blob);
    let name = b.get_string()?;
    if name != SSH_NAME_RSA.as_bytes() {
        return error::HostKey { msg: "unexpected host key type" }.fail();
    }
    let e = b.get_mpint()?;
    let n = b.get_mpint()?;
    if !b.is_empty() {
        return error::HostKey { msg: "trailing bytes in host key" }.fail();
    }

    RsaPublicKey::new(
        rsa::BigUint::from_bytes_be(&n.to_bytes_be()),
        rsa::BigUint::from_bytes_be(&e.to_bytes_be()),
    )
    .map_err(|_| Error::HostKey { msg: "unusable RSA public key" })
}

/// Extracts the raw signature, left-padded with zeros to the modulus size;
/// some servers strip leading zero bytes.
fn parse_sig_blob(blob: &[u8], key_size: usize) -> Result<Vec<u8>> {
    let mut b = Buffer::from_slice(blob);
    let name = b.get_string()?;
    if name != SSH_NAME_RSA.as_bytes() {
        return error::HostKey { msg: "unexpected signature type" }.fail();
    }
    let raw = b.get_string()?;
    if raw.len() > key_size {
        return error::HostKey { msg: "signature longer than modulus" }.fail();
    }
    let mut sig = vec![0u8; key_size - raw.len()];
    sig.extend_from_slice(&raw);
    Ok(sig)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rsa::traits::PublicKeyParts;
    use rsa::RsaPrivateKey;

    pub(crate) fn make_rsa_key() -> RsaPrivateKey {
        RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap()
    }

    pub(crate) fn rsa_key_blob(key: &RsaPrivateKey) -> Vec<u8> {
        let pubkey = key.to_public_key();
        let mut b = Buffer::new();
        b.add_string(SSH_NAME_RSA.as_bytes());
        b.add_mpint(&num_bigint::BigUint::from_bytes_be(&pubkey.e().to_bytes_be()));
        b.add_mpint(&num_bigint::BigUint::from_bytes_be(&pubkey.n().to_bytes_be()));
        b.payload().to_vec()
    }

    pub(crate) fn rsa_sign_blob(key: &RsaPrivateKey, h: &[u8]) -> Vec<u8> {
        let hashed = DigestAlgo::Sha1.digest(h);
        let sig = key.sign(Pkcs1v15Sign::new::<sha1::Sha1>(), &hashed).unwrap();
        let mut b = Buffer::new();
        b.add_string(SSH_NAME_RSA.as_bytes());
        b.add_string(&sig);
        b.payload().to_vec()
    }

    #[test]
    fn verify_good_signature() {
        let key = make_rsa_key();
        let h = [0x42u8; 20];
        verify_signature(&rsa_key_blob(&key), &h, &rsa_sign_blob(&key, &h)).unwrap();
    }

    #[test]
    fn reject_tampered_hash() {
        let key = make_rsa_key();
        let sig = rsa_sign_blob(&key, &[0x42u8; 20]);
        let r = verify_signature(&rsa_key_blob(&key), &[0x43u8; 20], &sig);
        assert!(matches!(r, Err(Error::HostKey { .. })));
    }

    #[test]
    fn reject_tampered_signature() {
        let key = make_rsa_key();
        let h = [7u8; 20];
        let mut sig = rsa_sign_blob(&key, &h);
        let last = sig.len() - 1;
        sig[last] ^= 1;
        let r = verify_signature(&rsa_key_blob(&key), &h, &sig);
        assert!(matches!(r, Err(Error::HostKey { .. })));
    }

    #[test]
    fn reject_unknown_key_type() {
        let mut b = Buffer::new();
        b.add_string(b"ssh-dss");
        let r = verify_signature(b.payload(), &[0u8; 20], &[]);
        assert!(matches!(r, Err(Error::HostKey { .. })));
    }
}
