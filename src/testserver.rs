//! Scripted in-process SSH server for end-to-end tests.
//!
//! The fixture speaks just enough of the server side of the protocol to
//! exercise the client: version exchange, group14 key exchange signed with a
//! throwaway RSA key, NEWKEYS, service accept and a scripted authentication
//! dialogue. It runs over an in-memory duplex pipe so tests need no sockets.

#[allow(unused_imports)]
use {
    crate::error::{self, Error, Result},
    log::{debug, error, info, log, trace, warn},
};

use std::io::{self, Read, Write};
use std::sync::mpsc;
use std::sync::OnceLock;

use rsa::RsaPrivateKey;

use crate::buffer::{Buffer, Val};
use crate::crypto::{CipherAlgo, MacAlgo};
use crate::hostkey::tests::{make_rsa_key, rsa_key_blob, rsa_sign_blob};
use crate::ident;
use crate::kex::{self, AlgoConfig, Algos, DhExchange, KexAlgo, DH_GROUP14};
use crate::packet::{KeyState, Keys};
use crate::sshnames::*;

pub(crate) const SERVER_ID: &str = "SSH-2.0-OpenSSH_8.9";

/// One half of an in-memory duplex byte stream. Reads block until the peer
/// writes; EOF is reported once the peer end is dropped.
pub(crate) struct PipeEnd {
    tx: mpsc::Sender<Vec<u8>>,
    rx: mpsc::Receiver<Vec<u8>>,
    pending: Vec<u8>,
    pos: usize,
}

pub(crate) fn pipe() -> (PipeEnd, PipeEnd) {
    let (atx, brx) = mpsc::channel();
    let (btx, arx) = mpsc::channel();
    (
        PipeEnd { tx: atx, rx: arx, pending: Vec::new(), pos: 0 },
        PipeEnd { tx: btx, rx: brx, pending: Vec::new(), pos: 0 },
    )
}

impl Read for PipeEnd {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pos >= self.pending.len() {
            match self.rx.recv() {
                Ok(chunk) => {
                    self.pending = chunk;
                    self.pos = 0;
                }
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len() - self.pos);
        buf[..n].copy_from_slice(&self.pending[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

impl Write for PipeEnd {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.tx
            .send(buf.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer closed"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// How the fixture answers authentication requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AuthScript {
    Success,
    AlwaysFail,
    BannerThenSuccess,
    /// First request fails; the second gets a banner before its failure;
    /// the third fails.
    FailBannerFailFail,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Script {
    pub auth: AuthScript,
    /// Flip one ciphertext byte of the first encrypted packet sent.
    pub corrupt_first_encrypted: bool,
    /// Send an unassigned message type instead of proceeding with KEX.
    pub send_unknown_kex_msg: bool,
}

impl Default for Script {
    fn default() -> Self {
        Script {
            auth: AuthScript::Success,
            corrupt_first_encrypted: false,
            send_unknown_kex_msg: false,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct ServerReport {
    pub userauth_requests: usize,
    pub saw_client_newkeys: bool,
}

/// The throwaway host key is expensive to generate, share it across tests.
fn host_key() -> &'static RsaPrivateKey {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    KEY.get_or_init(make_rsa_key)
}

pub(crate) struct TestServer {
    script: Script,
    keys: KeyState,
    inb: Buffer,
    outb: Buffer,
}

impl TestServer {
    pub fn new(script: Script) -> Self {
        TestServer {
            script,
            keys: KeyState::new_cleartext(),
            inb: Buffer::new(),
            outb: Buffer::new(),
        }
    }

    pub fn run(mut self, mut stream: PipeEnd) -> ServerReport {
        let mut report = ServerReport::default();
        if let Err(e) = self.serve(&mut stream, &mut report) {
            debug!("test server stopped: {e}");
        }
        report
    }

    /// Reads and discards until the client hangs up, so that the client side
    /// never sees a broken pipe before it finishes its own error handling.
    fn drain(stream: &mut PipeEnd) {
        let mut sink = [0u8; 256];
        while matches!(stream.read(&mut sink), Ok(n) if n > 0) {}
    }

    fn recv(&mut self, stream: &mut PipeEnd) -> Result<u8> {
        let TestServer { keys, inb, .. } = self;
        keys.recv_packet(stream, inb)?;
        self.inb.get_u8()
    }

    fn send(&mut self, stream: &mut PipeEnd) -> Result<()> {
        let TestServer { keys, outb, .. } = self;
        keys.send_packet(stream, outb)
    }

    fn serve(&mut self, stream: &mut PipeEnd, report: &mut ServerReport) -> Result<()> {
        let client_version = ident::recv_version(stream)?;
        stream.write_all(format!("{SERVER_ID}\r\n").as_bytes())?;

        // fixed server preferences, a subset of what the client offers
        let sconf = AlgoConfig {
            kexs: &[SSH_NAME_KEX_GROUP14_SHA1],
            hostkeys: &[SSH_NAME_RSA],
            ciphers: &[SSH_NAME_AES128_CTR],
            macs: &[SSH_NAME_HMAC_SHA2_256],
            comps: &[SSH_NAME_NONE],
        };

        if self.recv(stream)? != SSH_MSG_KEXINIT {
            return error::Protocol { msg: "fixture expected KEXINIT" }.fail();
        }
        let mut i_c = vec![SSH_MSG_KEXINIT];
        i_c.extend_from_slice(self.inb.payload());
        let i_s = kex::kexinit_payload(&sconf);
        self.outb.add_data(&i_s);
        self.send(stream)?;

        if self.script.send_unknown_kex_msg {
            self.outb.add_u8(99);
            self.send(stream)?;
            Self::drain(stream);
            return Ok(());
        }

        // server view: enc is server-to-client
        let algos = Algos {
            kex: KexAlgo::DhGroup14Sha1,
            hostkey: SSH_NAME_RSA.into(),
            cipher_enc: CipherAlgo::Aes128Ctr,
            cipher_dec: CipherAlgo::Aes128Ctr,
            mac_enc: MacAlgo::HmacSha256,
            mac_dec: MacAlgo::HmacSha256,
        };

        if self.recv(stream)? != SSH_MSG_KEXDH_INIT {
            return error::Protocol { msg: "fixture expected KEXDH_INIT" }.fail();
        }
        let e = self.inb.get_mpint()?;

        let dh = DhExchange::new(&DH_GROUP14);
        let f = dh.e.clone();
        let k = dh.shared_secret(&e)?;
        let key = host_key();
        let key_blob = rsa_key_blob(key);
        let h = kex::exchange_hash(
            algos.kex.hash(),
            &client_version.id,
            SERVER_ID,
            &i_c,
            &i_s,
            &key_blob,
            &e,
            &f,
            &k,
        );
        let sig_blob = rsa_sign_blob(key, &h);

        self.outb.pack(
            "bsBs",
            &[
                Val::Byte(SSH_MSG_KEXDH_REPLY),
                Val::Str(key_blob),
                Val::Mpint(f),
                Val::Str(sig_blob),
            ],
        )?;
        self.send(stream)?;

        self.outb.add_u8(SSH_MSG_NEWKEYS);
        self.send(stream)?;
        let newkeys = Keys::derive(&algos, &k, &h, &h, false)?;
        if self.recv(stream)? != SSH_MSG_NEWKEYS {
            return error::Protocol { msg: "fixture expected NEWKEYS" }.fail();
        }
        report.saw_client_newkeys = true;
        self.keys.rekey(newkeys);

        if self.recv(stream)? != SSH_MSG_SERVICE_REQUEST {
            return error::Protocol { msg: "fixture expected SERVICE_REQUEST" }.fail();
        }
        self.outb.pack(
            "bs",
            &[
                Val::Byte(SSH_MSG_SERVICE_ACCEPT),
                Val::Str(SSH_SERVICE_USERAUTH.as_bytes().to_vec()),
            ],
        )?;
        if self.script.corrupt_first_encrypted {
            let mut wire = Vec::new();
            {
                let TestServer { keys, outb, .. } = self;
                keys.send_packet(&mut wire, outb)?;
            }
            // flip a ciphertext byte beyond the first block
            wire[20] ^= 0x20;
            stream.write_all(&wire)?;
            Self::drain(stream);
            return Ok(());
        }
        self.send(stream)?;

        self.auth_dialogue(stream, report)
    }

    fn auth_dialogue(&mut self, stream: &mut PipeEnd, report: &mut ServerReport) -> Result<()> {
        loop {
            if self.recv(stream)? != SSH_MSG_USERAUTH_REQUEST {
                return error::Protocol { msg: "fixture expected USERAUTH_REQUEST" }.fail();
            }
            report.userauth_requests += 1;
            let n = report.userauth_requests;

            match self.script.auth {
                AuthScript::Success => {
                    self.send_success(stream)?;
                    return Ok(());
                }
                AuthScript::BannerThenSuccess => {
                    self.send_banner(stream, "Welcome\n")?;
                    self.send_success(stream)?;
                    return Ok(());
                }
                AuthScript::AlwaysFail => {
                    self.send_failure(stream)?;
                }
                AuthScript::FailBannerFailFail => {
                    if n == 2 {
                        self.send_banner(stream, "maintenance window tonight\n")?;
                    }
                    self.send_failure(stream)?;
                }
            }
        }
    }

    fn send_success(&mut self, stream: &mut PipeEnd) -> Result<()> {
        self.outb.add_u8(SSH_MSG_USERAUTH_SUCCESS);
        self.send(stream)
    }

    fn send_failure(&mut self, stream: &mut PipeEnd) -> Result<()> {
        self.outb.pack(
            "bsb",
            &[
                Val::Byte(SSH_MSG_USERAUTH_FAILURE),
                Val::Str(SSH_AUTHMETHOD_PASSWORD.as_bytes().to_vec()),
                Val::Byte(0),
            ],
        )?;
        self.send(stream)
    }

    fn send_banner(&mut self, stream: &mut PipeEnd, text: &str) -> Result<()> {
        self.outb.pack(
            "bss",
            &[
                Val::Byte(SSH_MSG_USERAUTH_BANNER),
                Val::Str(text.as_bytes().to_vec()),
                Val::Str(Vec::new()),
            ],
        )?;
        self.send(stream)
    }
}
