//! Expandable byte buffer with SSH wire-format codecs.
//!
//! A [`Buffer`] has a write end that only appends and a read cursor that only
//! moves forward, `0 <= read position <= write position`. All multi-byte
//! integers are big-endian. On top of the typed single-value operations the
//! buffer exposes a format-string driven [`Buffer::pack`]/[`Buffer::unpack`]
//! pair; each format character names a wire type:
//!
//! | code | type              | wire layout                          |
//! |------|-------------------|--------------------------------------|
//! | `b`  | u8                | 1 byte                               |
//! | `w`  | u16               | 2 bytes BE                           |
//! | `d`  | u32               | 4 bytes BE                           |
//! | `q`  | u64               | 8 bytes BE                           |
//! | `s`  | byte string       | u32 length, then bytes               |
//! | `S`  | SSH string object | u32 length, then bytes               |
//! | `P`  | raw bytes         | bytes verbatim, no length prefix     |
//! | `B`  | mpint             | u32 length, two's-complement BE      |
//!
//! A buffer that has held secret material should be switched to secure mode
//! with [`Buffer::set_secure`]; the valid region is then zeroed on every
//! reinit and on drop.

#[allow(unused_imports)]
use {
    crate::error::{self, Error, Result},
    log::{debug, error, info, log, trace, warn},
};

use num_bigint::BigUint;
use zeroize::Zeroize;

/// Hard cap on a received string length, to stop runaway allocation.
pub(crate) const MAX_STRING_LEN: usize = 256 * 1024;

/// A typed wire value for [`Buffer::pack`] and [`Buffer::unpack`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Val {
    /// `b`
    Byte(u8),
    /// `w`
    U16(u16),
    /// `d`
    U32(u32),
    /// `q`
    U64(u64),
    /// `s` and `S`: length-prefixed byte string
    Str(Vec<u8>),
    /// `P`: raw bytes, written verbatim. On unpack, `P` must be the last
    /// format character and consumes the remainder of the buffer.
    Raw(Vec<u8>),
    /// `B`: multi-precision integer
    Mpint(BigUint),
}

#[derive(Default)]
pub struct Buffer {
    data: Vec<u8>,
    pos: usize,
    secure: bool,
}

impl Buffer {
    pub fn new() -> Self {
        Buffer::default()
    }

    pub fn from_slice(data: &[u8]) -> Self {
        Buffer { data: data.to_vec(), pos: 0, secure: false }
    }

    /// Arms zero-on-release wiping for the valid region.
    pub fn set_secure(&mut self) {
        self.secure = true;
    }

    /// Number of unread bytes between the read cursor and the write end.
    pub fn len(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resets both cursors to zero without shrinking capacity. In secure
    /// mode the previous valid region is zeroed first.
    pub fn reinit(&mut self) {
        if self.secure {
            self.data.as_mut_slice().zeroize();
        }
        self.data.clear();
        self.pos = 0;
    }

    /// The unread region.
    pub fn payload(&self) -> &[u8] {
        &self.data[self.pos..]
    }

    pub(crate) fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.pos..]
    }

    pub fn add_data(&mut self, d: &[u8]) {
        self.data.extend_from_slice(d);
    }

    pub fn add_u8(&mut self, v: u8) {
        self.data.push(v);
    }

    pub fn add_u16(&mut self, v: u16) {
        self.data.extend_from_slice(&v.to_be_bytes());
    }

    pub fn add_u32(&mut self, v: u32) {
        self.data.extend_from_slice(&v.to_be_bytes());
    }

    pub fn add_u64(&mut self, v: u64) {
        self.data.extend_from_slice(&v.to_be_bytes());
    }

    /// u32 length prefix followed by the bytes, RFC 4251 `string`.
    pub fn add_string(&mut self, s: &[u8]) {
        self.add_u32(s.len() as u32);
        self.add_data(s);
    }

    /// RFC 4251 `mpint`. Zero encodes as an empty string; a positive value
    /// whose most significant bit is set gains a leading zero byte.
    pub fn add_mpint(&mut self, n: &BigUint) {
        let enc = encode_mpint(n);
        self.add_data(&enc);
    }

    /// Inserts bytes ahead of the unread region, shifting it forward.
    pub fn prepend_data(&mut self, d: &[u8]) {
        self.data.splice(self.pos..self.pos, d.iter().copied());
    }

    fn take(&mut self, n: usize) -> Result<&[u8]> {
        if self.len() < n {
            return error::ShortBuffer { needed: n, remaining: self.len() }.fail();
        }
        let s = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        let mut a = [0u8; 8];
        a.copy_from_slice(b);
        Ok(u64::from_be_bytes(a))
    }

    pub fn get_data(&mut self, n: usize) -> Result<Vec<u8>> {
        Ok(self.take(n)?.to_vec())
    }

    pub fn get_string(&mut self) -> Result<Vec<u8>> {
        let len = self.get_u32()? as usize;
        if len > MAX_STRING_LEN {
            return error::Protocol { msg: "string length exceeds cap" }.fail();
        }
        self.get_data(len)
    }

    pub fn get_mpint(&mut self) -> Result<BigUint> {
        let bytes = self.get_string()?;
        // protocol values are non-negative, a leading zero only pads the sign
        Ok(BigUint::from_bytes_be(&bytes))
    }

    /// Advances the read cursor as if `n` bytes had been read.
    pub fn pass_bytes(&mut self, n: usize) -> Result<()> {
        self.take(n).map(|_| ())
    }

    /// Appends values according to `fmt`. The argument count and every
    /// argument type must match the format, checked at runtime before any
    /// byte is written: a mismatch leaves the buffer untouched.
    pub fn pack(&mut self, fmt: &str, args: &[Val]) -> Result<()> {
        if fmt.len() != args.len() {
            return error::Protocol { msg: "pack format/argument mismatch" }.fail();
        }
        for (c, a) in fmt.chars().zip(args) {
            let ok = matches!(
                (c, a),
                ('b', Val::Byte(_))
                    | ('w', Val::U16(_))
                    | ('d', Val::U32(_))
                    | ('q', Val::U64(_))
                    | ('s', Val::Str(_))
                    | ('S', Val::Str(_))
                    | ('P', Val::Raw(_))
                    | ('B', Val::Mpint(_))
            );
            if !ok {
                return error::Protocol { msg: "pack format/argument mismatch" }.fail();
            }
        }
        // the pairing is fully checked, dispatch on the values
        for a in args {
            match a {
                Val::Byte(v) => self.add_u8(*v),
                Val::U16(v) => self.add_u16(*v),
                Val::U32(v) => self.add_u32(*v),
                Val::U64(v) => self.add_u64(*v),
                Val::Str(v) => self.add_string(v),
                Val::Raw(v) => self.add_data(v),
                Val::Mpint(v) => self.add_mpint(v),
            }
        }
        Ok(())
    }

    /// Consumes values according to `fmt`, returning owned [`Val`]s.
    /// `P` is only valid as the final character and takes the remainder.
    pub fn unpack(&mut self, fmt: &str) -> Result<Vec<Val>> {
        let mut out = Vec::with_capacity(fmt.len());
        let mut chars = fmt.chars().peekable();
        while let Some(c) = chars.next() {
            let v = match c {
                'b' => Val::Byte(self.get_u8()?),
                'w' => Val::U16(self.get_u16()?),
                'd' => Val::U32(self.get_u32()?),
                'q' => Val::U64(self.get_u64()?),
                's' | 'S' => Val::Str(self.get_string()?),
                'B' => Val::Mpint(self.get_mpint()?),
                'P' => {
                    if chars.peek().is_some() {
                        return error::Protocol {
                            msg: "raw bytes must end an unpack format",
                        }
                        .fail();
                    }
                    let rest = self.len();
                    Val::Raw(self.get_data(rest)?)
                }
                _ => return error::Protocol { msg: "unknown format character" }.fail(),
            };
            out.push(v);
        }
        Ok(out)
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if self.secure {
            self.data.as_mut_slice().zeroize();
        }
    }
}

impl core::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Buffer")
            .field("pos", &self.pos)
            .field("len", &self.data.len())
            .field("secure", &self.secure)
            .finish()
    }
}

/// Encodes an mpint to its full wire form including the length prefix.
pub(crate) fn encode_mpint(n: &BigUint) -> Vec<u8> {
    if n == &BigUint::default() {
        return vec![0, 0, 0, 0];
    }
    let bytes = n.to_bytes_be();
    let pad = (bytes[0] & 0x80) != 0;
    let len = bytes.len() + usize::from(pad);
    let mut out = Vec::with_capacity(4 + len);
    out.extend_from_slice(&(len as u32).to_be_bytes());
    if pad {
        out.push(0);
    }
    out.extend_from_slice(&bytes);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_bounds() {
        let mut b = Buffer::new();
        b.add_u32(7);
        assert_eq!(b.len(), 4);
        assert_eq!(b.get_u32().unwrap(), 7);
        assert!(matches!(b.get_u8(), Err(Error::ShortBuffer { .. })));
    }

    #[test]
    fn reinit_resets() {
        let mut b = Buffer::new();
        b.set_secure();
        b.add_string(b"secret");
        b.reinit();
        assert_eq!(b.len(), 0);
        b.add_u8(1);
        assert_eq!(b.get_u8().unwrap(), 1);
    }

    #[test]
    fn prepend_keeps_unread() {
        let mut b = Buffer::new();
        b.add_data(b"xxpayload");
        b.pass_bytes(2).unwrap();
        b.prepend_data(b"hdr");
        assert_eq!(b.payload(), b"hdrpayload");
    }

    #[test]
    fn pack_unpack_roundtrip() {
        let args = vec![
            Val::Byte(50),
            Val::U16(22),
            Val::U32(0xdeadbeef),
            Val::U64(1 << 40),
            Val::Str(b"ssh-userauth".to_vec()),
            Val::Mpint(BigUint::from(0x81u32)),
            Val::Raw(vec![1, 2, 3, 4]),
        ];
        let mut b = Buffer::new();
        b.pack("bwdqsBP", &args).unwrap();
        let got = b.unpack("bwdqsBP").unwrap();
        assert_eq!(got, args);
        assert!(b.is_empty());
    }

    #[test]
    fn pack_arity_mismatch() {
        let mut b = Buffer::new();
        let r = b.pack("bs", &[Val::Byte(1)]);
        assert!(matches!(r, Err(Error::Protocol { .. })));
        let r = b.pack("b", &[Val::U32(1)]);
        assert!(matches!(r, Err(Error::Protocol { .. })));
    }

    #[test]
    fn failed_pack_leaves_buffer_untouched() {
        let mut b = Buffer::new();
        b.add_u8(9);
        // the first argument matches, the second does not; nothing may land
        let r = b.pack("bs", &[Val::Byte(1), Val::U32(2)]);
        assert!(matches!(r, Err(Error::Protocol { .. })));
        assert_eq!(b.payload(), &[9]);
    }

    #[test]
    fn unpack_short_buffer() {
        let mut b = Buffer::new();
        b.add_u32(10);
        b.add_data(b"abc");
        assert!(matches!(b.unpack("s"), Err(Error::ShortBuffer { .. })));
    }

    #[test]
    fn string_cap() {
        let mut b = Buffer::new();
        b.add_u32((MAX_STRING_LEN + 1) as u32);
        assert!(matches!(b.get_string(), Err(Error::Protocol { .. })));
    }

    #[test]
    fn mpint_encoding() {
        // zero is an empty string
        assert_eq!(encode_mpint(&BigUint::default()), vec![0, 0, 0, 0]);
        // high bit set gains a leading zero byte
        assert_eq!(encode_mpint(&BigUint::from(0x80u32)), vec![0, 0, 0, 2, 0, 0x80]);
        assert_eq!(encode_mpint(&BigUint::from(0x7fu32)), vec![0, 0, 0, 1, 0x7f]);
        // RFC 4251 example: 9a378f9b2e332a7
        let n = BigUint::parse_bytes(b"9a378f9b2e332a7", 16).unwrap();
        assert_eq!(
            encode_mpint(&n),
            vec![0, 0, 0, 8, 0x09, 0xa3, 0x78, 0xf9, 0xb2, 0xe3, 0x32, 0xa7]
        );
    }

    #[test]
    fn mpint_roundtrip() {
        for hex in ["0", "7f", "80", "ff00ff", "9a378f9b2e332a7", "ffffffffffffffff"] {
            let n = BigUint::parse_bytes(hex.as_bytes(), 16).unwrap();
            let mut b = Buffer::new();
            b.add_mpint(&n);
            assert_eq!(b.get_mpint().unwrap(), n);
        }
    }
}
