//! User authentication, RFC 4252.
//!
//! After NEWKEYS the client requests the `ssh-userauth` service and runs the
//! password method. The server may interleave `USERAUTH_BANNER` messages at
//! any point before success; a banner is displayed and waiting continues, it
//! never consumes a retry. Each failure (or password-change demand, which
//! this client treats the same way) prompts the caller for a fresh password
//! and retries, bounded by [`MAX_AUTH_TRIES`] per session.

#[allow(unused_imports)]
use {
    crate::error::{self, Error, Result},
    log::{debug, error, info, log, trace, warn},
};

use std::io::{Read, Write};

use zeroize::{Zeroize, Zeroizing};

use crate::behaviour::CliBehaviour;
use crate::buffer::Val;
use crate::session::Session;
use crate::sshnames::*;

/// Bound on password attempts for one session.
pub(crate) const MAX_AUTH_TRIES: u32 = 3;

/// Runs the service request and the password method to completion.
pub(crate) fn authenticate<S: Read + Write>(
    s: &mut Session<S>,
    b: &mut dyn CliBehaviour,
) -> Result<()> {
    request_userauth_service(s)?;

    let username = s.username()?;
    let mut tries = 0u32;
    let mut password = prompt(b)?;

    loop {
        send_password_request(s, &username, &password)?;

        // wait for a verdict; banners are shown and waiting continues
        loop {
            match s.recv_msg()? {
                SSH_MSG_USERAUTH_BANNER => {
                    let vals = s.in_buf().unpack("ss")?;
                    if let [Val::Str(msg), Val::Str(_lang)] = &vals[..] {
                        b.show_banner(&String::from_utf8_lossy(msg));
                    }
                }
                SSH_MSG_USERAUTH_SUCCESS => {
                    info!("authenticated as {username}");
                    return Ok(());
                }
                SSH_MSG_USERAUTH_FAILURE | SSH_MSG_USERAUTH_PASSWD_CHANGEREQ => {
                    tries += 1;
                    debug!("authentication attempt {tries} failed");
                    if tries >= MAX_AUTH_TRIES {
                        return error::AuthExhausted { tries }.fail();
                    }
                    password = prompt(b)?;
                    break;
                }
                _ => {
                    return error::Protocol { msg: "unexpected message during authentication" }
                        .fail()
                }
            }
        }
    }
}

fn request_userauth_service<S: Read + Write>(s: &mut Session<S>) -> Result<()> {
    s.out_buf().pack(
        "bs",
        &[
            Val::Byte(SSH_MSG_SERVICE_REQUEST),
            Val::Str(SSH_SERVICE_USERAUTH.as_bytes().to_vec()),
        ],
    )?;
    s.send_packet()?;

    if s.recv_msg()? != SSH_MSG_SERVICE_ACCEPT {
        return error::Protocol { msg: "service request refused" }.fail();
    }
    let name = s.in_buf().get_string()?;
    if name != SSH_SERVICE_USERAUTH.as_bytes() {
        return error::Protocol { msg: "service accept name mismatch" }.fail();
    }
    Ok(())
}

fn prompt(b: &mut dyn CliBehaviour) -> Result<Zeroizing<String>> {
    b.auth_password().ok_or(Error::Fatal { msg: "no password available" })
}

fn send_password_request<S: Read + Write>(
    s: &mut Session<S>,
    username: &str,
    password: &str,
) -> Result<()> {
    let mut args = [
        Val::Byte(SSH_MSG_USERAUTH_REQUEST),
        Val::Str(username.as_bytes().to_vec()),
        Val::Str(SSH_SERVICE_CONNECTION.as_bytes().to_vec()),
        Val::Str(SSH_AUTHMETHOD_PASSWORD.as_bytes().to_vec()),
        Val::Byte(0), // FALSE, not a password change
        Val::Str(password.as_bytes().to_vec()),
    ];
    let packed = s.out_buf().pack("bsssbs", &args);
    for a in &mut args {
        if let Val::Str(v) = a {
            v.zeroize();
        }
    }
    packed?;
    s.send_packet()
}
