//! Crate-wide error type.
//!
//! Every failure carries a kind and a human-readable message. All kinds
//! except [`Error::AuthExhausted`] and [`Error::RequestDenied`] are fatal to
//! the session: the driver reinitialises its output buffer and closes the
//! stream before surfacing them.

use snafu::prelude::*;

pub type Result<T, E = Error> = core::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)), visibility(pub(crate)))]
pub enum Error {
    /// Socket read/write failure or unexpected EOF.
    #[snafu(display("IO error: {source}"))]
    #[snafu(context(false))]
    Io { source: std::io::Error },

    /// Malformed framing, unexpected message type, or a forbidden state
    /// transition.
    #[snafu(display("SSH protocol error: {msg}"))]
    Protocol { msg: &'static str },

    /// An unpack ran past the end of the buffer.
    #[snafu(display("short buffer: needed {needed} bytes, {remaining} remain"))]
    ShortBuffer { needed: usize, remaining: usize },

    /// No common algorithm in one of the KEXINIT slots.
    #[snafu(display("no matching {algo} algorithm"))]
    AlgoNoMatch { algo: &'static str },

    /// A cipher, digest or HMAC context could not be constructed.
    #[snafu(display("crypto initialisation failed: {msg}"))]
    CryptoInit { msg: &'static str },

    /// MAC or AEAD tag mismatch on a received packet.
    #[snafu(display("packet integrity check failed"))]
    BadIntegrity,

    /// The server signature did not verify, or the host key was refused.
    #[snafu(display("host key verification failed: {msg}"))]
    HostKey { msg: &'static str },

    /// Password authentication retries reached the bound.
    #[snafu(display("authentication failed after {tries} attempts"))]
    AuthExhausted { tries: u32 },

    /// An invalid session option was supplied.
    #[snafu(display("request denied: {msg}"))]
    RequestDenied { msg: &'static str },

    /// Umbrella for unrecoverable conditions without a more specific kind.
    #[snafu(display("fatal: {msg}"))]
    Fatal { msg: &'static str },
}

impl Error {
    /// Whether this error terminates the session.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Error::AuthExhausted { .. } | Error::RequestDenied { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatality() {
        assert!(Error::BadIntegrity.is_fatal());
        assert!(Error::Protocol { msg: "x" }.is_fatal());
        assert!(!Error::AuthExhausted { tries: 3 }.is_fatal());
        assert!(!Error::RequestDenied { msg: "x" }.is_fatal());
    }
}
