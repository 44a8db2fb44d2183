//! Algorithm negotiation and Diffie-Hellman key exchange, RFC 4253 7-8.
//!
//! Both sides send a KEXINIT listing their preferences per slot; for each
//! slot the first client name also present in the server list wins. The
//! chosen method here is classic finite-field Diffie-Hellman over the
//! RFC 3526 group14 (or RFC 2409 group1) prime with SHA-1, the exchange
//! variant of `SSH_MSG_KEXDH_INIT`/`SSH_MSG_KEXDH_REPLY`.
//!
//! The exchange hash is
//! `H = HASH(V_C || V_S || I_C || I_S || K_S || e || f || K)` with the
//! version strings and KEXINIT payloads length-framed and the integers as
//! mpints. The H of the first exchange becomes the session id.

#[allow(unused_imports)]
use {
    crate::error::{self, Error, Result},
    log::{debug, error, info, log, trace, warn},
};

use core::fmt;

use hex_literal::hex;
use num_bigint::{BigUint, RandBigInt};

use crate::buffer::Buffer;
use crate::crypto::{self, CipherAlgo, DigestAlgo, MacAlgo};
use crate::sshnames::*;

/// Preference lists for each KEXINIT slot.
pub(crate) struct AlgoConfig {
    pub kexs: &'static [&'static str],
    pub hostkeys: &'static [&'static str],
    pub ciphers: &'static [&'static str],
    pub macs: &'static [&'static str],
    pub comps: &'static [&'static str],
}

impl Default for AlgoConfig {
    fn default() -> Self {
        AlgoConfig {
            kexs: &[SSH_NAME_KEX_GROUP14_SHA1, SSH_NAME_KEX_GROUP1_SHA1],
            hostkeys: &[SSH_NAME_RSA],
            ciphers: &[
                SSH_NAME_AES128_CTR,
                SSH_NAME_AES192_CTR,
                SSH_NAME_AES256_CTR,
                SSH_NAME_AES128_CBC,
                SSH_NAME_AES192_CBC,
                SSH_NAME_AES256_CBC,
            ],
            macs: &[SSH_NAME_HMAC_SHA2_256, SSH_NAME_HMAC_SHA1],
            comps: &[SSH_NAME_NONE],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KexAlgo {
    DhGroup14Sha1,
    DhGroup1Sha1,
}

impl KexAlgo {
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            SSH_NAME_KEX_GROUP14_SHA1 => Ok(KexAlgo::DhGroup14Sha1),
            SSH_NAME_KEX_GROUP1_SHA1 => Ok(KexAlgo::DhGroup1Sha1),
            _ => error::AlgoNoMatch { algo: "kex" }.fail(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            KexAlgo::DhGroup14Sha1 => SSH_NAME_KEX_GROUP14_SHA1,
            KexAlgo::DhGroup1Sha1 => SSH_NAME_KEX_GROUP1_SHA1,
        }
    }

    pub fn hash(&self) -> DigestAlgo {
        match self {
            KexAlgo::DhGroup14Sha1 | KexAlgo::DhGroup1Sha1 => DigestAlgo::Sha1,
        }
    }

    pub fn group(&self) -> &'static DhGroup {
        match self {
            KexAlgo::DhGroup14Sha1 => &DH_GROUP14,
            KexAlgo::DhGroup1Sha1 => &DH_GROUP1,
        }
    }
}

/// The algorithms chosen for this session, client perspective: `enc` is
/// client-to-server, `dec` is server-to-client.
#[derive(Debug)]
pub(crate) struct Algos {
    pub kex: KexAlgo,
    pub hostkey: String,
    pub cipher_enc: CipherAlgo,
    pub cipher_dec: CipherAlgo,
    pub mac_enc: MacAlgo,
    pub mac_dec: MacAlgo,
}

impl fmt::Display for Algos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "negotiated algorithms {{ kex {} hostkey {} cipher c->s {} s->c {} mac c->s {} s->c {} }}",
            self.kex.name(),
            self.hostkey,
            self.cipher_enc.name(),
            self.cipher_dec.name(),
            self.mac_enc.name(),
            self.mac_dec.name(),
        )
    }
}

fn namelist(names: &[&str]) -> Vec<u8> {
    names.join(",").into_bytes()
}

/// Builds a KEXINIT payload, leading message byte included.
/// The payload is retained verbatim by the caller for the exchange hash.
pub(crate) fn kexinit_payload(conf: &AlgoConfig) -> Vec<u8> {
    let mut cookie = [0u8; 16];
    crypto::fill_random(&mut cookie);

    let mut b = Buffer::new();
    b.add_u8(SSH_MSG_KEXINIT);
    b.add_data(&cookie);
    b.add_string(&namelist(conf.kexs));
    b.add_string(&namelist(conf.hostkeys));
    b.add_string(&namelist(conf.ciphers));
    b.add_string(&namelist(conf.ciphers));
    b.add_string(&namelist(conf.macs));
    b.add_string(&namelist(conf.macs));
    b.add_string(&namelist(conf.comps));
    b.add_string(&namelist(conf.comps));
    b.add_string(b"");
    b.add_string(b"");
    b.add_u8(0); // first_kex_packet_follows
    b.add_u32(0); // reserved
    b.payload().to_vec()
}

/// The server's KEXINIT name-lists.
#[derive(Debug)]
pub(crate) struct RemoteKexInit {
    pub kexs: Vec<String>,
    pub hostkeys: Vec<String>,
    pub ciphers_c2s: Vec<String>,
    pub ciphers_s2c: Vec<String>,
    pub macs_c2s: Vec<String>,
    pub macs_s2c: Vec<String>,
    pub comps_c2s: Vec<String>,
    pub comps_s2c: Vec<String>,
    pub first_follows: bool,
}

fn take_namelist(b: &mut Buffer) -> Result<Vec<String>> {
    let raw = b.get_string()?;
    let s = core::str::from_utf8(&raw)
        .map_err(|_| Error::Protocol { msg: "name-list not ASCII" })?;
    Ok(s.split(',').filter(|n| !n.is_empty()).map(str::to_string).collect())
}

pub(crate) fn parse_kexinit(payload: &[u8]) -> Result<RemoteKexInit> {
    let mut b = Buffer::from_slice(payload);
    if b.get_u8()? != SSH_MSG_KEXINIT {
        return error::Protocol { msg: "expected KEXINIT" }.fail();
    }
    b.pass_bytes(16)?; // cookie

    let kexs = take_namelist(&mut b)?;
    let hostkeys = take_namelist(&mut b)?;
    let ciphers_c2s = take_namelist(&mut b)?;
    let ciphers_s2c = take_namelist(&mut b)?;
    let macs_c2s = take_namelist(&mut b)?;
    let macs_s2c = take_namelist(&mut b)?;
    let comps_c2s = take_namelist(&mut b)?;
    let comps_s2c = take_namelist(&mut b)?;
    take_namelist(&mut b)?; // languages, ignored
    take_namelist(&mut b)?;
    let first_follows = b.get_u8()? != 0;
    b.get_u32()?; // reserved

    Ok(RemoteKexInit {
        kexs,
        hostkeys,
        ciphers_c2s,
        ciphers_s2c,
        macs_c2s,
        macs_s2c,
        comps_c2s,
        comps_s2c,
        first_follows,
    })
}

/// First name in the client list that the server also offers, RFC 4253 7.1.
fn first_match(
    client: &[&'static str],
    server: &[String],
    slot: &'static str,
) -> Result<&'static str> {
    for c in client {
        if server.iter().any(|s| s == c) {
            return Ok(c);
        }
    }
    debug!("no {slot} match, server offered {server:?}");
    error::AlgoNoMatch { algo: slot }.fail()
}

pub(crate) fn negotiate(conf: &AlgoConfig, p: &RemoteKexInit) -> Result<Algos> {
    let kex = KexAlgo::from_name(first_match(conf.kexs, &p.kexs, "kex")?)?;
    let hostkey = first_match(conf.hostkeys, &p.hostkeys, "hostkey")?.to_string();
    let cipher_enc = CipherAlgo::from_name(first_match(conf.ciphers, &p.ciphers_c2s, "encryption")?)?;
    let cipher_dec = CipherAlgo::from_name(first_match(conf.ciphers, &p.ciphers_s2c, "encryption")?)?;
    let mac_enc = MacAlgo::from_name(first_match(conf.macs, &p.macs_c2s, "mac")?)?;
    let mac_dec = MacAlgo::from_name(first_match(conf.macs, &p.macs_s2c, "mac")?)?;
    first_match(conf.comps, &p.comps_c2s, "compression")?;
    first_match(conf.comps, &p.comps_s2c, "compression")?;

    let algos = Algos { kex, hostkey, cipher_enc, cipher_dec, mac_enc, mac_dec };
    debug!("{algos}");
    Ok(algos)
}

pub(crate) struct DhGroup {
    pub p: &'static [u8],
    pub g: u32,
}

/// RFC 3526 section 3, the 2048-bit MODP group.
pub(crate) static DH_GROUP14: DhGroup = DhGroup {
    p: &hex!("ffffffffffffffffc90fdaa22168c234c4c6628b80dc1cd129024e088a67cc74020bbea63b139b22514a08798e3404ddef9519b3cd3a431b302b0a6df25f14374fe1356d6d51c245e485b576625e7ec6f44c42e9a637ed6b0bff5cb6f406b7edee386bfb5a899fa5ae9f24117c4b1fe649286651ece45b3dc2007cb8a163bf0598da48361c55d39a69163fa8fd24cf5f83655d23dca3ad961c62f356208552bb9ed529077096966d670c354e4abc9804f1746c08ca18217c32905e462e36ce3be39e772c180e86039b2783a2ec07a28fb5c55df06f4c52c9de2bcbf6955817183995497cea956ae515d2261898fa051015728e5a8aacaa68ffffffffffffffff"),
    g: 2,
};

/// RFC 2409 section 6.2, the 1024-bit Oakley group.
pub(crate) static DH_GROUP1: DhGroup = DhGroup {
    p: &hex!("ffffffffffffffffc90fdaa22168c234c4c6628b80dc1cd129024e088a67cc74020bbea63b139b22514a08798e3404ddef9519b3cd3a431b302b0a6df25f14374fe1356d6d51c245e485b576625e7ec6f44c42e9a637ed6b0bff5cb6f406b7edee386bfb5a899fa5ae9f24117c4b1fe649286651ece65381ffffffffffffffff"),
    g: 2,
};

/// One side of a Diffie-Hellman exchange. Holds the private exponent until
/// the shared secret is produced.
pub(crate) struct DhExchange {
    group: &'static DhGroup,
    x: BigUint,
    pub e: BigUint,
}

impl DhExchange {
    /// Picks `x` uniformly from `[2, q-1]`, `q = (p-1)/2`, and computes
    /// `e = g^x mod p`.
    pub fn new(group: &'static DhGroup) -> Self {
        let p = BigUint::from_bytes_be(group.p);
        let q: BigUint = (&p - 1u32) >> 1;
        let x = rand::thread_rng().gen_biguint_range(&BigUint::from(2u32), &q);
        let e = BigUint::from(group.g).modpow(&x, &p);
        DhExchange { group, x, e }
    }

    /// `K = f^x mod p`. The server public must lie in `(1, p-1)`.
    pub fn shared_secret(&self, f: &BigUint) -> Result<BigUint> {
        let p = BigUint::from_bytes_be(self.group.p);
        let pm1: BigUint = &p - 1u32;
        if *f <= BigUint::from(1u32) || *f >= pm1 {
            return error::Protocol { msg: "server DH public out of range" }.fail();
        }
        Ok(f.modpow(&self.x, &p))
    }
}

impl fmt::Debug for DhExchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DhExchange").field("e", &self.e).finish_non_exhaustive()
    }
}

/// `H = HASH(V_C || V_S || I_C || I_S || K_S || e || f || K)`, RFC 4253 8.
/// Version strings exclude their CR LF.
pub(crate) fn exchange_hash(
    hash: DigestAlgo,
    v_c: &str,
    v_s: &str,
    i_c: &[u8],
    i_s: &[u8],
    k_s: &[u8],
    e: &BigUint,
    f: &BigUint,
    k: &BigUint,
) -> Vec<u8> {
    let mut b = Buffer::new();
    b.set_secure();
    b.add_string(v_c.as_bytes());
    b.add_string(v_s.as_bytes());
    b.add_string(i_c);
    b.add_string(i_s);
    b.add_string(k_s);
    b.add_mpint(e);
    b.add_mpint(f);
    b.add_mpint(k);
    hash.digest(b.payload())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::init_test_log;

    #[test]
    fn config_names_construct() {
        // every offered name must be constructible
        let conf = AlgoConfig::default();
        for n in conf.kexs {
            KexAlgo::from_name(n).unwrap();
        }
        for n in conf.ciphers {
            CipherAlgo::from_name(n).unwrap();
        }
        for n in conf.macs {
            MacAlgo::from_name(n).unwrap();
        }
    }

    #[test]
    fn tie_break_is_client_order() {
        let server: Vec<String> = ["c", "b"].iter().map(|s| s.to_string()).collect();
        assert_eq!(first_match(&["a", "b", "c"], &server, "kex").unwrap(), "b");
    }

    #[test]
    fn no_common_name_fails() {
        let server: Vec<String> = vec!["z".to_string()];
        let r = first_match(&["a", "b"], &server, "kex");
        assert!(matches!(r, Err(Error::AlgoNoMatch { algo: "kex" })));
    }

    #[test]
    fn kexinit_roundtrip() {
        init_test_log();
        let conf = AlgoConfig::default();
        let payload = kexinit_payload(&conf);
        let p = parse_kexinit(&payload).unwrap();
        assert_eq!(p.kexs, conf.kexs.iter().map(|s| s.to_string()).collect::<Vec<_>>());
        assert_eq!(p.ciphers_c2s, p.ciphers_s2c);
        assert!(!p.first_follows);
        let algos = negotiate(&conf, &p).unwrap();
        assert_eq!(algos.kex, KexAlgo::DhGroup14Sha1);
        assert_eq!(algos.cipher_enc, CipherAlgo::Aes128Ctr);
        assert_eq!(algos.mac_enc, MacAlgo::HmacSha256);
    }

    #[test]
    fn group_primes_have_expected_size() {
        assert_eq!(DH_GROUP14.p.len(), 256);
        assert_eq!(DH_GROUP1.p.len(), 128);
        // both primes are odd with the top bit set
        assert_eq!(DH_GROUP14.p[0], 0xff);
        assert_eq!(DH_GROUP14.p[255] & 1, 1);
    }

    #[test]
    fn dh_agreement() {
        init_test_log();
        let a = DhExchange::new(&DH_GROUP14);
        let b = DhExchange::new(&DH_GROUP14);
        let k1 = a.shared_secret(&b.e).unwrap();
        let k2 = b.shared_secret(&a.e).unwrap();
        assert_eq!(k1, k2);
    }

    #[test]
    fn degenerate_publics_rejected() {
        let a = DhExchange::new(&DH_GROUP1);
        let p = BigUint::from_bytes_be(DH_GROUP1.p);
        for bad in [BigUint::from(0u32), BigUint::from(1u32), &p - 1u32, p.clone()] {
            assert!(a.shared_secret(&bad).is_err());
        }
    }

    #[test]
    fn exchange_hash_sensitivity() {
        let e = BigUint::from(5u32);
        let f = BigUint::from(7u32);
        let k = BigUint::from(9u32);
        let h1 = exchange_hash(
            DigestAlgo::Sha1, "SSH-2.0-a", "SSH-2.0-b", b"ic", b"is", b"ks", &e, &f, &k,
        );
        let h2 = exchange_hash(
            DigestAlgo::Sha1, "SSH-2.0-a", "SSH-2.0-b", b"ic", b"is", b"ks", &e, &f,
            &BigUint::from(10u32),
        );
        assert_eq!(h1.len(), 20);
        assert_ne!(h1, h2);
    }
}
