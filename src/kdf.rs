//! Key material expansion, RFC 4253 7.2.
//!
//! Each of the six key slots is derived as
//! `K1 = HASH(K || H || X || session_id)` and extended with
//! `K_{n+1} = HASH(K || H || K1 || ... || Kn)` until the requested length is
//! reached. `X` is the slot letter `'A'..'F'` and `K` is hashed in its mpint
//! wire encoding. The session id is the exchange hash of the first key
//! exchange and never changes afterwards.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result},
    log::{debug, error, info, log, trace, warn},
};

use num_bigint::BigUint;
use zeroize::Zeroizing;

use crate::buffer::encode_mpint;
use crate::crypto::DigestAlgo;

pub(crate) fn derive_key(
    hash: DigestAlgo,
    k: &BigUint,
    h: &[u8],
    letter: char,
    session_id: &[u8],
    out_len: usize,
) -> Zeroizing<Vec<u8>> {
    let kenc = Zeroizing::new(encode_mpint(k));
    let mut hasher = hash.hasher();

    let mut out = Zeroizing::new(Vec::with_capacity(out_len + hash.output_len()));
    hasher.update(&kenc);
    hasher.update(h);
    hasher.update(&[letter as u8]);
    hasher.update(session_id);
    out.extend_from_slice(&hasher.finalize_reset());

    while out.len() < out_len {
        hasher.update(&kenc);
        hasher.update(h);
        hasher.update(&out);
        let block = Zeroizing::new(hasher.finalize_reset().to_vec());
        out.extend_from_slice(&block);
    }
    out.truncate(out_len);
    out
}
