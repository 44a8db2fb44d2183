//! The SSH binary packet protocol, RFC 4253 section 6.
//!
//! A packet on the wire is
//! `u32 packet_length, u8 padding_length, payload, padding, mac`.
//! Padding is 4..255 random bytes sized so the encrypted region is a
//! multiple of the cipher block size (minimum 8). For AEAD ciphers the
//! length field stays outside the encrypted region and the tag replaces the
//! MAC. The MAC input is the sequence number concatenated with the full
//! cleartext packet.
//!
//! [`KeyState`] owns the directional keys and both sequence counters. The
//! counters are u32, wrap modulo 2^32, and are never reset by a rekey
//! (RFC 4253 6.4); a rekey swaps only the keys. A rekey should be forced
//! before a counter wraps; this implementation leaves that to the driver,
//! which performs a single key exchange per session.

#[allow(unused_imports)]
use {
    crate::error::{self, Error, Result},
    log::{debug, error, info, log, trace, warn},
};

use core::num::Wrapping;
use std::io::{Read, Write};

use num_bigint::BigUint;
use pretty_hex::PrettyHex;
use zeroize::Zeroizing;

use crate::buffer::Buffer;
use crate::crypto::{self, CipherCtx, IntegKey};
use crate::kdf;
use crate::kex::Algos;

pub(crate) const SSH_LENGTH_SIZE: usize = 4;
const SSH_MIN_PADLEN: usize = 4;
const SSH_MIN_BLOCK: usize = 8;
/// Upper bound accepted for the packet_length field.
const MAX_PACKET_LEN: usize = 256 * 1024;

/// Keys for both directions, produced by key exchange.
pub(crate) struct Keys {
    pub enc: CipherCtx,
    pub dec: CipherCtx,
    pub integ_enc: Option<IntegKey>,
    pub integ_dec: Option<IntegKey>,
}

impl Keys {
    pub fn new_cleartext() -> Self {
        Keys { enc: CipherCtx::None, dec: CipherCtx::None, integ_enc: None, integ_dec: None }
    }

    /// Expands the shared secret into the six key slots of RFC 4253 7.2 and
    /// initialises the cipher and integrity contexts. The letter assignment
    /// mirrors for the server side.
    pub fn derive(
        algos: &Algos,
        k: &BigUint,
        h: &[u8],
        session_id: &[u8],
        is_client: bool,
    ) -> Result<Self> {
        let hash = algos.kex.hash();
        let (iv_e, iv_d, k_e, k_d, i_e, i_d) = if is_client {
            ('A', 'B', 'C', 'D', 'E', 'F')
        } else {
            ('B', 'A', 'D', 'C', 'F', 'E')
        };

        let iv = kdf::derive_key(hash, k, h, iv_e, session_id, algos.cipher_enc.iv_len());
        let key = kdf::derive_key(hash, k, h, k_e, session_id, algos.cipher_enc.key_len());
        let enc = CipherCtx::encryptor(algos.cipher_enc, &key, &iv)?;

        let iv = kdf::derive_key(hash, k, h, iv_d, session_id, algos.cipher_dec.iv_len());
        let key = kdf::derive_key(hash, k, h, k_d, session_id, algos.cipher_dec.key_len());
        let dec = CipherCtx::decryptor(algos.cipher_dec, &key, &iv)?;

        let integ_enc = if algos.cipher_enc.is_aead() {
            None
        } else {
            let mk = kdf::derive_key(hash, k, h, i_e, session_id, algos.mac_enc.key_len());
            Some(IntegKey::new(algos.mac_enc, mk.to_vec()))
        };
        let integ_dec = if algos.cipher_dec.is_aead() {
            None
        } else {
            let mk = kdf::derive_key(hash, k, h, i_d, session_id, algos.mac_dec.key_len());
            Some(IntegKey::new(algos.mac_dec, mk.to_vec()))
        };

        Ok(Keys { enc, dec, integ_enc, integ_dec })
    }
}

/// Packet framing state: active keys plus per-direction sequence numbers.
pub(crate) struct KeyState {
    keys: Keys,
    tx_seq: Wrapping<u32>,
    rx_seq: Wrapping<u32>,
}

impl KeyState {
    pub fn new_cleartext() -> Self {
        KeyState { keys: Keys::new_cleartext(), tx_seq: Wrapping(0), rx_seq: Wrapping(0) }
    }

    /// Swaps in freshly negotiated keys. Sequence numbers carry across.
    pub fn rekey(&mut self, keys: Keys) {
        self.keys = keys;
    }

    pub fn tx_seq(&self) -> u32 {
        self.tx_seq.0
    }

    pub fn rx_seq(&self) -> u32 {
        self.rx_seq.0
    }

    fn padding_for(&self, payload_len: usize) -> usize {
        let bsize = self.keys.enc.block_size().max(SSH_MIN_BLOCK);
        // aead ciphers exclude the length field from block alignment
        let covered = 1
            + payload_len
            + if self.keys.enc.is_aead() { 0 } else { SSH_LENGTH_SIZE };
        let mut padlen = bsize - covered % bsize;
        if padlen < SSH_MIN_PADLEN {
            padlen += bsize;
        }
        padlen
    }

    /// Frames, protects and writes the payload held in `out`, then
    /// reinitialises `out` and advances the send sequence number.
    pub fn send_packet<W: Write>(&mut self, w: &mut W, out: &mut Buffer) -> Result<()> {
        let payload_len = out.len();
        let padlen = self.padding_for(payload_len);
        let pktlen = 1 + payload_len + padlen;

        let mut head = [0u8; SSH_LENGTH_SIZE + 1];
        head[..SSH_LENGTH_SIZE].copy_from_slice(&(pktlen as u32).to_be_bytes());
        head[SSH_LENGTH_SIZE] = padlen as u8;
        out.prepend_data(&head);

        let mut pad = [0u8; 32];
        crypto::fill_random(&mut pad[..padlen]);
        out.add_data(&pad[..padlen]);

        let seq = self.tx_seq.0;
        trace!("send seq {seq} payload {payload_len} pad {padlen}");
        let mac = {
            let packet = out.payload_mut();
            if self.keys.enc.is_aead() {
                let (aad, body) = packet.split_at_mut(SSH_LENGTH_SIZE);
                self.keys.enc.aead()?.seal(aad, body)?
            } else {
                let mac = match &self.keys.integ_enc {
                    Some(ik) => ik.compute(seq, packet)?,
                    None => Vec::new(),
                };
                self.keys.enc.apply(packet)?;
                mac
            }
        };

        w.write_all(out.payload())?;
        if !mac.is_empty() {
            w.write_all(&mac)?;
        }
        w.flush()?;

        self.tx_seq += Wrapping(1);
        out.reinit();
        Ok(())
    }

    /// Reads one packet, verifies its integrity and leaves the payload in
    /// `inb`. Advances the receive sequence number.
    pub fn recv_packet<R: Read>(&mut self, r: &mut R, inb: &mut Buffer) -> Result<()> {
        let seq = self.rx_seq.0;
        let bsize = self.keys.dec.block_size().max(SSH_MIN_BLOCK);

        let (pktlen, packet) = if self.keys.dec.is_aead() {
            let mut len4 = [0u8; SSH_LENGTH_SIZE];
            r.read_exact(&mut len4)?;
            let pktlen = self.keys.dec.aead_packet_length(&len4) as usize;
            if pktlen < SSH_MIN_PADLEN || pktlen > MAX_PACKET_LEN || pktlen % bsize != 0 {
                debug!("bad aead packet length {pktlen}");
                return error::Protocol { msg: "invalid packet length" }.fail();
            }
            let tag_len = self.keys.dec.tag_len();
            let mut packet =
                Zeroizing::new(vec![0u8; SSH_LENGTH_SIZE + pktlen + tag_len]);
            packet[..SSH_LENGTH_SIZE].copy_from_slice(&len4);
            r.read_exact(&mut packet[SSH_LENGTH_SIZE..])?;

            let (aad, rest) = packet.split_at_mut(SSH_LENGTH_SIZE);
            let (body, tag) = rest.split_at_mut(pktlen);
            self.keys.dec.aead()?.open(aad, body, tag)?;
            (pktlen, packet)
        } else {
            let mut first = Zeroizing::new(vec![0u8; bsize]);
            r.read_exact(&mut first)?;
            self.keys.dec.apply(&mut first)?;
            let pktlen =
                u32::from_be_bytes(first[..SSH_LENGTH_SIZE].try_into().unwrap()) as usize;
            if pktlen < SSH_MIN_PADLEN
                || pktlen > MAX_PACKET_LEN
                || (pktlen + SSH_LENGTH_SIZE) % bsize != 0
            {
                debug!("bad packet length {pktlen}");
                return error::Protocol { msg: "invalid packet length" }.fail();
            }
            let mac_len = self.keys.integ_dec.as_ref().map_or(0, |ik| ik.mac_len());
            let total = SSH_LENGTH_SIZE + pktlen + mac_len;
            let mut packet = Zeroizing::new(vec![0u8; total]);
            packet[..bsize].copy_from_slice(&first);
            r.read_exact(&mut packet[bsize..])?;

            let clear_end = SSH_LENGTH_SIZE + pktlen;
            if clear_end > bsize {
                let (head, _) = packet.split_at_mut(clear_end);
                self.keys.dec.apply(&mut head[bsize..])?;
            }
            if let Some(ik) = &self.keys.integ_dec {
                let (clear, mac) = packet.split_at(clear_end);
                ik.verify(seq, clear, mac)?;
            }
            (pktlen, packet)
        };

        let padlen = packet[SSH_LENGTH_SIZE] as usize;
        if padlen < SSH_MIN_PADLEN {
            return error::Protocol { msg: "padding too short" }.fail();
        }
        let payload_len = pktlen
            .checked_sub(1 + padlen)
            .ok_or(Error::Protocol { msg: "padding exceeds packet" })?;

        trace!("recv seq {seq} payload {payload_len} pad {padlen}");
        trace!(
            "recv {:?}",
            packet[SSH_LENGTH_SIZE + 1..SSH_LENGTH_SIZE + 1 + payload_len].hex_dump()
        );
        inb.reinit();
        inb.add_data(&packet[SSH_LENGTH_SIZE + 1..SSH_LENGTH_SIZE + 1 + payload_len]);
        self.rx_seq += Wrapping(1);
        Ok(())
    }
}
