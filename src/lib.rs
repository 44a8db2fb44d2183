//! A client-side SSH transport and user authentication library.
//!
//! `halyard` speaks the SSH-2 binary packet protocol (RFC 4253) as a client:
//! version exchange, algorithm negotiation, Diffie-Hellman key exchange,
//! packet encryption and integrity, and the RFC 4252 password authentication
//! method. Higher-level services (channels, SFTP) are layered on top of the
//! authenticated payload stream a [`Session`] exposes.
//!
//! The caller supplies policy through [`CliBehaviour`]: host-key trust
//! decisions, password prompting, and banner display.

mod auth;
mod behaviour;
pub mod buffer;
mod crypto;
mod error;
mod hostkey;
mod ident;
mod kdf;
mod kex;
mod packet;
mod session;
mod sshnames;

#[cfg(test)]
pub(crate) mod testserver;

pub use behaviour::CliBehaviour;
pub use buffer::{Buffer, Val};
pub use error::{Error, Result};
pub use session::{Session, SessionOpts};

#[cfg(test)]
pub(crate) fn init_test_log() {
    let _ = env_logger::builder()
        .is_test(true)
        .filter_level(log::LevelFilter::Trace)
        .try_init();
}
