//! Session setup and the transport driver.
//!
//! A [`Session`] owns one connection and drives it through version exchange,
//! key exchange, NEWKEYS and user authentication. All I/O is synchronous and
//! blocking; every protocol step is one send followed by one (or, for
//! banners, several) receives. After [`Session::connect`] returns, upper
//! services exchange raw payloads over the encrypted transport.

#[allow(unused_imports)]
use {
    crate::error::{self, Error, Result},
    log::{debug, error, info, log, trace, warn},
};

use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::PathBuf;

use crate::auth;
use crate::behaviour::CliBehaviour;
use crate::buffer::{Buffer, Val};
use crate::hostkey;
use crate::ident::{self, RemoteVersion};
use crate::kex::{self, AlgoConfig, DhExchange};
use crate::packet::{KeyState, Keys};
use crate::sshnames::*;

/// Session configuration.
///
/// `host` accepts a bare host name or `user@host`. The username defaults to
/// the local login name, the SSH directory to `~/.ssh`, and the known-hosts
/// path to `<sshdir>/known_hosts`.
#[derive(Debug, Clone)]
pub struct SessionOpts {
    host: String,
    port: u16,
    user: Option<String>,
    sshdir: Option<PathBuf>,
    knownhosts: Option<PathBuf>,
}

impl SessionOpts {
    pub fn new(host: &str) -> Result<Self> {
        let mut opts = SessionOpts {
            host: String::new(),
            port: 22,
            user: None,
            sshdir: None,
            knownhosts: None,
        };
        opts.set_host(host)?;
        Ok(opts)
    }

    pub fn set_host(&mut self, host: &str) -> Result<()> {
        let (user, host) = match host.split_once('@') {
            Some((u, h)) => (Some(u), h),
            None => (None, host),
        };
        if host.is_empty() {
            return error::RequestDenied { msg: "empty host name" }.fail();
        }
        if let Some(u) = user {
            if u.is_empty() {
                return error::RequestDenied { msg: "empty user name" }.fail();
            }
            self.user = Some(u.to_string());
        }
        self.host = host.to_string();
        Ok(())
    }

    pub fn set_port(&mut self, port: u16) -> Result<()> {
        if port == 0 {
            return error::RequestDenied { msg: "port out of range" }.fail();
        }
        self.port = port;
        Ok(())
    }

    pub fn set_user(&mut self, user: &str) -> Result<()> {
        if user.is_empty() {
            return error::RequestDenied { msg: "empty user name" }.fail();
        }
        self.user = Some(user.to_string());
        Ok(())
    }

    pub fn set_sshdir(&mut self, dir: PathBuf) {
        self.sshdir = Some(dir);
    }

    pub fn set_knownhosts(&mut self, path: PathBuf) {
        self.knownhosts = Some(path);
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Configured or local username.
    pub fn username(&self) -> Result<String> {
        if let Some(u) = &self.user {
            return Ok(u.clone());
        }
        std::env::var("USER")
            .or_else(|_| std::env::var("LOGNAME"))
            .map_err(|_| Error::RequestDenied { msg: "no username configured" })
    }

    pub fn sshdir(&self) -> Result<PathBuf> {
        if let Some(d) = &self.sshdir {
            return Ok(d.clone());
        }
        std::env::var_os("HOME")
            .map(|h| PathBuf::from(h).join(".ssh"))
            .ok_or(Error::RequestDenied { msg: "no home directory" })
    }

    pub fn knownhosts(&self) -> Result<PathBuf> {
        if let Some(p) = &self.knownhosts {
            return Ok(p.clone());
        }
        Ok(self.sshdir()?.join("known_hosts"))
    }
}

/// Transport progress, version exchange through authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Version,
    KexInitSent,
    KexInitReceived,
    DhInitSent,
    DhReplyReceived,
    NewKeysExchanged,
    AuthPending,
    Authenticated,
    Failed,
}

pub struct Session<S: Read + Write> {
    stream: S,
    opts: SessionOpts,
    keys: KeyState,
    in_buf: Buffer,
    out_buf: Buffer,
    server_version: Option<RemoteVersion>,
    session_id: Option<Vec<u8>>,
    state: State,
}

impl Session<TcpStream> {
    /// Connects to the configured host and runs the full handshake:
    /// version exchange, key exchange, host-key check, NEWKEYS and password
    /// authentication.
    pub fn connect(opts: SessionOpts, b: &mut dyn CliBehaviour) -> Result<Self> {
        let stream = TcpStream::connect((opts.host(), opts.port()))?;
        debug!("connected to {}:{}", opts.host(), opts.port());
        Self::establish(stream, opts, b)
    }
}

impl<S: Read + Write> Session<S> {
    /// Runs the handshake over an already-connected stream.
    pub fn establish(stream: S, opts: SessionOpts, b: &mut dyn CliBehaviour) -> Result<Self> {
        let mut in_buf = Buffer::new();
        let mut out_buf = Buffer::new();
        // both buffers carry key material and passwords at times
        in_buf.set_secure();
        out_buf.set_secure();

        let mut s = Session {
            stream,
            opts,
            keys: KeyState::new_cleartext(),
            in_buf,
            out_buf,
            server_version: None,
            session_id: None,
            state: State::Version,
        };
        match s.handshake(b) {
            Ok(()) => Ok(s),
            Err(e) => {
                s.terminate(&e);
                Err(e)
            }
        }
    }

    /// Error cleanup: fatal kinds reinitialise the out-buffer and mark the
    /// session failed; auth-exhausted and request-denied do not terminate
    /// the session state. Either way the stream closes when the session is
    /// dropped.
    fn terminate(&mut self, e: &Error) {
        if e.is_fatal() {
            self.out_buf.reinit();
            self.state = State::Failed;
        }
    }

    fn handshake(&mut self, b: &mut dyn CliBehaviour) -> Result<()> {
        ident::send_version(&mut self.stream)?;
        let remote = ident::recv_version(&mut self.stream)?;
        info!("server identification: {}", remote.id);
        debug!("server software: {}", remote.software);
        let server_id = remote.id.clone();
        self.server_version = Some(remote);

        // both KEXINIT payloads are retained for the exchange hash
        let conf = AlgoConfig::default();
        let i_c = kex::kexinit_payload(&conf);
        self.out_buf.add_data(&i_c);
        self.send_packet()?;
        self.state = State::KexInitSent;

        if self.recv_msg()? != SSH_MSG_KEXINIT {
            return error::Protocol { msg: "expected KEXINIT" }.fail();
        }
        let mut i_s = vec![SSH_MSG_KEXINIT];
        i_s.extend_from_slice(self.in_buf.payload());
        let remote_kex = kex::parse_kexinit(&i_s)?;
        let algos = kex::negotiate(&conf, &remote_kex)?;
        self.state = State::KexInitReceived;

        let dh = DhExchange::new(algos.kex.group());
        self.out_buf
            .pack("bB", &[Val::Byte(SSH_MSG_KEXDH_INIT), Val::Mpint(dh.e.clone())])?;
        self.send_packet()?;
        self.state = State::DhInitSent;

        if self.recv_msg()? != SSH_MSG_KEXDH_REPLY {
            return error::Protocol { msg: "expected KEXDH_REPLY" }.fail();
        }
        let k_s = self.in_buf.get_string()?;
        let f = self.in_buf.get_mpint()?;
        let sig = self.in_buf.get_string()?;
        self.state = State::DhReplyReceived;

        let k = dh.shared_secret(&f)?;
        let h = kex::exchange_hash(
            algos.kex.hash(),
            ident::CLIENT_VERSION,
            &server_id,
            &i_c,
            &i_s,
            &k_s,
            &dh.e,
            &f,
            &k,
        );

        hostkey::verify_signature(&k_s, &h, &sig)?;
        if !b.valid_hostkey(&self.opts.host, self.opts.port, &k_s) {
            return error::HostKey { msg: "host key rejected" }.fail();
        }
        b.record_hostkey(&self.opts.host, self.opts.port, &k_s);

        // the first exchange hash is the session id, fixed for the lifetime
        self.session_id = Some(h.clone());
        let newkeys = Keys::derive(&algos, &k, &h, &h, true)?;

        self.out_buf.add_u8(SSH_MSG_NEWKEYS);
        self.send_packet()?;
        if self.recv_msg()? != SSH_MSG_NEWKEYS {
            return error::Protocol { msg: "expected NEWKEYS" }.fail();
        }
        self.keys.rekey(newkeys);
        self.state = State::NewKeysExchanged;

        self.state = State::AuthPending;
        auth::authenticate(self, b)?;
        self.state = State::Authenticated;
        Ok(())
    }

    /// Frames and sends the contents of the out-buffer as one packet.
    pub(crate) fn send_packet(&mut self) -> Result<()> {
        let Session { stream, keys, out_buf, .. } = self;
        keys.send_packet(stream, out_buf)
    }

    /// Receives the next meaningful message and returns its type byte; the
    /// rest of the payload stays in the in-buffer. IGNORE and DEBUG messages
    /// are skipped, DISCONNECT terminates.
    pub(crate) fn recv_msg(&mut self) -> Result<u8> {
        loop {
            {
                let Session { stream, keys, in_buf, .. } = self;
                keys.recv_packet(stream, in_buf)?;
            }
            match self.in_buf.get_u8()? {
                SSH_MSG_IGNORE | SSH_MSG_DEBUG => {
                    trace!("skipping keepalive/debug message");
                }
                SSH_MSG_UNIMPLEMENTED => {
                    return error::Protocol { msg: "server rejected our last message" }.fail()
                }
                SSH_MSG_DISCONNECT => {
                    if let Ok([Val::U32(reason), Val::Str(desc), _]) =
                        self.in_buf.unpack("dss").as_deref()
                    {
                        warn!(
                            "server disconnected ({reason}): {}",
                            String::from_utf8_lossy(desc)
                        );
                    }
                    return error::Protocol { msg: "server sent disconnect" }.fail();
                }
                ty => return Ok(ty),
            }
        }
    }

    pub(crate) fn out_buf(&mut self) -> &mut Buffer {
        &mut self.out_buf
    }

    pub(crate) fn in_buf(&mut self) -> &mut Buffer {
        &mut self.in_buf
    }

    pub(crate) fn username(&self) -> Result<String> {
        self.opts.username()
    }

    /// The exchange hash of the first key exchange.
    pub fn session_id(&self) -> Option<&[u8]> {
        self.session_id.as_deref()
    }

    pub fn server_id(&self) -> Option<&str> {
        self.server_version.as_ref().map(|v| v.id.as_str())
    }

    /// Protocol version announced by the server, always 2 once connected.
    pub fn protocol_version(&self) -> Option<u32> {
        self.server_version.as_ref().map(|v| v.protoversion)
    }

    pub fn opts(&self) -> &SessionOpts {
        &self.opts
    }

    /// Sends one payload over the authenticated transport.
    pub fn send_payload(&mut self, payload: &[u8]) -> Result<()> {
        if self.state != State::Authenticated {
            return error::Protocol { msg: "session not authenticated" }.fail();
        }
        self.out_buf.add_data(payload);
        self.send_packet()
    }

    /// Receives one payload from the authenticated transport.
    pub fn recv_payload(&mut self) -> Result<Vec<u8>> {
        if self.state != State::Authenticated {
            return error::Protocol { msg: "session not authenticated" }.fail();
        }
        let ty = self.recv_msg()?;
        let mut payload = vec![ty];
        payload.extend_from_slice(self.in_buf.payload());
        Ok(payload)
    }

    /// Sends a clean DISCONNECT and closes the connection.
    pub fn disconnect(mut self) -> Result<()> {
        self.out_buf.pack(
            "bdss",
            &[
                Val::Byte(SSH_MSG_DISCONNECT),
                Val::U32(SSH_DISCONNECT_BY_APPLICATION),
                Val::Str(b"disconnected by user".to_vec()),
                Val::Str(Vec::new()),
            ],
        )?;
        self.send_packet()
    }

    #[cfg(test)]
    pub(crate) fn seq_numbers(&self) -> (u32, u32) {
        (self.keys.tx_seq(), self.keys.rx_seq())
    }
}
