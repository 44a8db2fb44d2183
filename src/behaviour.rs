//! Application hooks consumed by the transport engine.
//!
//! The engine makes no policy decisions of its own: host-key trust, password
//! capture and banner display all route through a caller-provided
//! [`CliBehaviour`]. Implementations that prompt on a terminal should
//! disable echo while reading the password.

use zeroize::Zeroizing;

pub trait CliBehaviour {
    /// Whether to trust the server host key, presented as the raw wire blob.
    /// Implementations typically compare against a known-hosts store for
    /// `host`/`port`.
    fn valid_hostkey(&mut self, host: &str, port: u16, key_blob: &[u8]) -> bool;

    /// Optionally persist a first-use trust decision.
    #[allow(unused)]
    fn record_hostkey(&mut self, host: &str, port: u16, key_blob: &[u8]) {}

    /// Produce a password for the next authentication attempt. Called again
    /// with each retry; returning `None` abandons authentication.
    fn auth_password(&mut self) -> Option<Zeroizing<String>>;

    /// Display a server banner sent during authentication. The text is
    /// server-controlled; display should escape it appropriately.
    #[allow(unused)]
    fn show_banner(&mut self, banner: &str) {}
}
