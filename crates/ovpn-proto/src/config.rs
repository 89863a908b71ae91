//! Engine configuration.
//!
//! Loads the recognized directives into a typed `Config`, applies
//! server-pushed updates on clients, and renders the two strings
//! exchanged during the handshake: the options consistency string
//! and the peer-info capability block.

use ovpn_core::options::{OptionError, OptionItem, OptionList};
use ovpn_core::pid::{PidForm, PidMode};
use ovpn_core::time::Duration;
use ovpn_crypto::{CipherAlg, DataChannelCrypto, DigestAlg, OpenVpnStaticKey};

use crate::comp::{CompressContext, CompressMethod};
use crate::errors::{ProtoError, ProtoResult};

/// Which side of the session this endpoint plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Transport carrying the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportProtocol {
    Udp,
    Tcp,
}

impl TransportProtocol {
    pub fn is_udp(&self) -> bool {
        matches!(self, TransportProtocol::Udp)
    }

    pub fn is_tcp(&self) -> bool {
        matches!(self, TransportProtocol::Tcp)
    }

    /// A stream transport already retransmits; the control channel
    /// must not.
    pub fn is_reliable(&self) -> bool {
        self.is_tcp()
    }

    /// Stream framing bytes counted in the link MTU.
    pub fn extra_transport_bytes(&self) -> usize {
        if self.is_tcp() {
            2
        } else {
            0
        }
    }

    /// Name used in the options consistency string.
    pub fn options_name(&self) -> &'static str {
        match self {
            TransportProtocol::Udp => "UDPv4",
            TransportProtocol::Tcp => "TCPv4_CLIENT",
        }
    }
}

/// OSI layer of the virtual device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer {
    /// Layer 3 (tun).
    Tun,
    /// Layer 2 (tap).
    Tap,
}

impl Layer {
    pub fn dev_type(&self) -> &'static str {
        match self {
            Layer::Tun => "tun",
            Layer::Tap => "tap",
        }
    }
}

/// Immutable-after-load session parameters (server push on a client
/// is the one sanctioned mutation path).
#[derive(Debug)]
pub struct Config {
    pub role: Role,
    pub protocol: TransportProtocol,
    pub layer: Layer,

    // data channel
    pub cipher: CipherAlg,
    pub digest: DigestAlg,

    // tls-auth
    pub tls_auth_key: Option<OpenVpnStaticKey>,
    pub tls_auth_digest: DigestAlg,
    /// 0, 1, or -1 for bidirectional.
    pub key_direction: i8,

    pub comp: CompressContext,

    // reliability layer
    pub reliable_window: usize,
    pub max_ack_list: usize,
    pub pid_mode: PidMode,

    // timeouts, relative to KeyContext construction
    pub handshake_window: Duration,
    pub become_primary: Duration,
    pub renegotiate: Duration,
    pub expire: Duration,
    pub tls_timeout: Duration,

    // keepalive
    pub keepalive_ping: Duration,
    pub keepalive_timeout: Duration,

    // op header
    pub enable_op32: bool,
    pub remote_peer_id: i32,
    pub local_peer_id: i32,

    pub tun_mtu: u32,

    /// Transmit username/password to the server (client only).
    pub xmit_creds: bool,
    /// Defer data-channel init until after the options pull.
    pub dc_deferred: bool,

    /// Extra peer-info pairs supplied by the host application.
    pub extra_peer_info: Vec<(String, String)>,
}

enum LoadKind {
    Server,
    Client,
    ClientPushed,
}

impl Config {
    fn defaults(role: Role) -> Self {
        Self {
            role,
            protocol: TransportProtocol::Udp,
            layer: Layer::Tun,
            cipher: CipherAlg::BfCbc,
            digest: DigestAlg::Sha1,
            tls_auth_key: None,
            tls_auth_digest: DigestAlg::None,
            key_direction: -1,
            comp: CompressContext::default(),
            reliable_window: 4,
            max_ack_list: 4,
            pid_mode: PidMode::Udp,
            handshake_window: Duration::from_secs(60),
            become_primary: Duration::from_secs(60),
            renegotiate: Duration::from_secs(3600),
            expire: Duration::from_secs(7200),
            tls_timeout: Duration::from_secs(1),
            keepalive_ping: Duration::from_secs(8),
            keepalive_timeout: Duration::from_secs(40),
            enable_op32: false,
            remote_peer_id: -1,
            local_peer_id: -1,
            tun_mtu: 1500,
            xmit_creds: true,
            dc_deferred: false,
            extra_peer_info: Vec::new(),
        }
    }

    /// Load configuration directives. Parse problems abort
    /// initialization with a typed error.
    pub fn load(opt: &OptionList, role: Role) -> ProtoResult<Self> {
        let mut c = Self::defaults(role);

        // layer
        let dev = opt
            .get("dev-type")
            .or_else(|| opt.get("dev"))
            .ok_or_else(|| OptionError::MissingOption("dev-type or dev".into()))?;
        let dev_type = dev.get(1, 64)?;
        c.layer = if dev_type.starts_with("tun") {
            Layer::Tun
        } else if dev_type.starts_with("tap") {
            Layer::Tap
        } else {
            return Err(bad_value(dev, format!("bad dev-type '{dev_type}'")).into());
        };

        // data channel cipher/digest
        if let Some(o) = opt.get("cipher") {
            c.cipher = CipherAlg::lookup(o.get(1, 128)?)?;
        }
        if let Some(o) = opt.get("auth") {
            c.digest = DigestAlg::lookup(o.get(1, 128)?)?;
        }

        // tls-auth
        if let Some(o) = opt.get("tls-auth") {
            c.tls_auth_key = Some(OpenVpnStaticKey::parse(o.get(1, 0)?)?);
            if let Some(dir) = o.get_optional(2) {
                c.key_direction = parse_key_direction(o, dir)?;
            }
            let ta_digest = match opt.get("tls-auth-digest") {
                Some(o) => DigestAlg::lookup(o.get(1, 128)?)?,
                None => c.digest,
            };
            c.tls_auth_digest = ta_digest;
        }

        // key-direction
        if let Some(o) = opt.get("key-direction") {
            c.key_direction = parse_key_direction(o, o.get(1, 16)?)?;
        }

        // compression; codecs themselves are external, so every
        // negotiated method runs in stub mode here
        if let Some(o) = opt.get("compress") {
            c.comp = match o.get_optional(1) {
                None | Some("stub") => CompressContext::new(CompressMethod::Stub),
                Some("lzo") => CompressContext::new(CompressMethod::LzoStub),
                Some(meth) => {
                    return Err(bad_value(o, format!("unknown compressor '{meth}'")).into())
                }
            };
        } else if opt.get("comp-lzo").is_some() {
            // with or without "no", interop requires the LZO framing
            c.comp = CompressContext::new(CompressMethod::LzoStub);
        }

        // tun-mtu
        if let Some(o) = opt.get("tun-mtu") {
            c.tun_mtu = parse_number(o, 1, 576, 65535)? as u32;
        }

        let kind = match role {
            Role::Server => LoadKind::Server,
            Role::Client => LoadKind::Client,
        };
        c.load_common(opt, kind)?;
        Ok(c)
    }

    // parameters accepted both at load time and via server push
    fn load_common(&mut self, opt: &OptionList, kind: LoadKind) -> ProtoResult<()> {
        if let Some(o) = opt.get("reneg-sec") {
            self.renegotiate = parse_secs(o, 1, 10)?;
        }
        self.expire = self.renegotiate;
        if let Some(o) = opt.get("tran-window") {
            self.expire = parse_secs(o, 1, 10)?;
        }
        self.expire += self.renegotiate;

        if let Some(o) = opt.get("hand-window") {
            self.handshake_window = parse_secs(o, 1, 10)?;
        }

        if self.cipher.is_bs64() {
            // short crossover keeps exposure of the old 64-bit-block
            // key minimal (CVE-2016-6329)
            self.become_primary = Duration::from_secs(5);
            self.tls_timeout = Duration::from_secs(1);
        } else {
            self.become_primary = self.handshake_window.min(self.renegotiate.half());
        }
        if let Some(o) = opt.get("become-primary") {
            self.become_primary = parse_secs(o, 1, 0)?;
        }
        if let Some(o) = opt.get("tls-timeout") {
            self.tls_timeout = Duration::from_millis(parse_number(o, 1, 100, u64::MAX)?);
        }

        if matches!(kind, LoadKind::Server) {
            // the client's shorter deadline makes it initiate
            // renegotiation, avoiding a collision
            self.renegotiate += self.handshake_window;
        }

        if let Some(o) = opt.get("keepalive") {
            self.keepalive_ping = parse_secs(o, 1, 1)?;
            self.keepalive_timeout = parse_secs(o, 2, 1)?;
            if matches!(kind, LoadKind::Server) {
                self.keepalive_timeout = self.keepalive_timeout.saturating_mul(2);
            }
        } else {
            if let Some(o) = opt.get("ping") {
                self.keepalive_ping = parse_secs(o, 1, 1)?;
            }
            if let Some(o) = opt.get("ping-restart") {
                self.keepalive_timeout = parse_secs(o, 1, 1)?;
            }
        }
        Ok(())
    }

    /// Apply an options string pushed by the server (client side).
    pub fn process_push(&mut self, opt: &OptionList) -> ProtoResult<()> {
        if let Some(o) = opt.get("cipher") {
            let name = o.get(1, 128).map_err(push_err)?;
            if name != "none" {
                self.cipher = CipherAlg::lookup(name)
                    .map_err(|e| ProtoError::ServerPush(format!("cipher: {e}")))?;
            }
        }
        if let Some(o) = opt.get("auth") {
            let name = o.get(1, 128).map_err(push_err)?;
            if name != "none" {
                self.digest = DigestAlg::lookup(name)
                    .map_err(|e| ProtoError::ServerPush(format!("auth: {e}")))?;
            }
        }

        if let Some(o) = opt.get("compress") {
            self.comp = match o.get_optional(1) {
                None | Some("stub") => CompressContext::new(CompressMethod::Stub),
                Some("lzo") => CompressContext::new(CompressMethod::LzoStub),
                Some(meth) => {
                    return Err(ProtoError::ServerPush(format!("unknown compressor '{meth}'")))
                }
            };
        } else if opt.get("comp-lzo").is_some() {
            self.comp = CompressContext::new(CompressMethod::LzoStub);
        }

        if let Some(o) = opt.get("peer-id") {
            let id = parse_signed(o, 1, -1, 0xFFFFFE)
                .map_err(|e| ProtoError::ServerPush(format!("peer-id: {e}")))?;
            self.remote_peer_id = id as i32;
            self.enable_op32 = true;
        }

        self.load_common(opt, LoadKind::ClientPushed)
            .map_err(|e| ProtoError::ServerPush(e.to_string()))?;
        Ok(())
    }

    pub fn set_protocol(&mut self, protocol: TransportProtocol) {
        self.protocol = protocol;
        self.set_pid_mode(false);
    }

    /// Select the replay-window policy. Strict TCP mode exists for
    /// stream transports but current call sites always pass
    /// `tcp_linear = false`.
    pub fn set_pid_mode(&mut self, tcp_linear: bool) {
        self.pid_mode = if self.protocol.is_udp() || !tcp_linear {
            PidMode::Udp
        } else {
            PidMode::Tcp
        };
    }

    pub fn tls_auth_enabled(&self) -> bool {
        self.tls_auth_key.is_some() && self.tls_auth_digest != DigestAlg::None
    }

    /// Options consistency string sent inside the auth record; peers
    /// compare these to catch configuration mismatches.
    pub fn options_string(&self) -> String {
        let l2extra = if self.layer == Layer::Tap { 32 } else { 0 };
        let mut out = String::from("V4");

        out.push_str(&format!(",dev-type {}", self.layer.dev_type()));
        out.push_str(&format!(
            ",link-mtu {}",
            self.tun_mtu as usize + self.link_mtu_adjust() + l2extra
        ));
        out.push_str(&format!(",tun-mtu {}", self.tun_mtu as usize + l2extra));
        out.push_str(&format!(",proto {}", self.protocol.options_name()));

        if let Some(comp) = self.comp.options_fragment() {
            out.push(',');
            out.push_str(comp);
        }
        if self.key_direction >= 0 {
            out.push_str(&format!(",keydir {}", self.key_direction));
        }

        let cipher_name = if self.cipher == CipherAlg::None {
            "[null-cipher]"
        } else {
            self.cipher.name()
        };
        let digest_name = if self.digest == DigestAlg::None {
            "[null-digest]"
        } else {
            self.digest.name()
        };
        out.push_str(&format!(",cipher {cipher_name}"));
        out.push_str(&format!(",auth {digest_name}"));
        out.push_str(&format!(",keysize {}", self.cipher.key_len() * 8));

        if self.tls_auth_key.is_some() {
            out.push_str(",tls-auth");
        }
        out.push_str(",key-method 2");
        out.push_str(match self.role {
            Role::Server => ",tls-server",
            Role::Client => ",tls-client",
        });
        out
    }

    /// Newline-delimited capability block sent by clients.
    pub fn peer_info_string(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("IV_VER={}\n", env!("CARGO_PKG_VERSION")));
        out.push_str(&format!("IV_PLAT={}\n", platform_name()));
        out.push_str("IV_NCP=2\n");
        out.push_str("IV_TCPNL=1\n");
        out.push_str("IV_PROTO=2\n");
        if let Some(comp) = self.comp.peer_info_fragment() {
            out.push_str(comp);
        }
        for (key, value) in &self.extra_peer_info {
            out.push_str(&format!("{key}={value}\n"));
        }
        if self.cipher.is_bs64() {
            out.push_str("IV_BS64DL=1\n");
        }
        out
    }

    /// Bytes the protocol adds on top of the tun MTU.
    fn link_mtu_adjust(&self) -> usize {
        self.protocol.extra_transport_bytes()
            + if self.enable_op32 { 4 } else { 1 }
            + self.comp.extra_payload_bytes()
            + PidForm::Short.size()
            + DataChannelCrypto::encap_overhead(self.cipher, self.digest)
    }
}

fn platform_name() -> &'static str {
    if cfg!(target_os = "linux") {
        "linux"
    } else if cfg!(target_os = "macos") {
        "mac"
    } else if cfg!(target_os = "windows") {
        "win"
    } else if cfg!(target_os = "android") {
        "android"
    } else if cfg!(target_os = "ios") {
        "ios"
    } else {
        "unknown"
    }
}

fn bad_value(item: &OptionItem, reason: String) -> OptionError {
    OptionError::BadValue {
        directive: item.name().to_string(),
        reason,
    }
}

fn push_err(e: OptionError) -> ProtoError {
    ProtoError::ServerPush(e.to_string())
}

fn parse_number(item: &OptionItem, index: usize, min: u64, max: u64) -> Result<u64, OptionError> {
    let s = item.get(index, 16)?;
    let v: u64 = s
        .parse()
        .map_err(|_| bad_value(item, format!("bad number '{s}'")))?;
    if v < min || v > max {
        return Err(bad_value(item, format!("{v} outside [{min}, {max}]")));
    }
    Ok(v)
}

fn parse_signed(item: &OptionItem, index: usize, min: i64, max: i64) -> Result<i64, OptionError> {
    let s = item.get(index, 16)?;
    let v: i64 = s
        .parse()
        .map_err(|_| bad_value(item, format!("bad number '{s}'")))?;
    if v < min || v > max {
        return Err(bad_value(item, format!("{v} outside [{min}, {max}]")));
    }
    Ok(v)
}

fn parse_secs(item: &OptionItem, index: usize, min_secs: u64) -> Result<Duration, OptionError> {
    Ok(Duration::from_secs(parse_number(
        item,
        index,
        min_secs,
        u64::MAX / 1000,
    )?))
}

fn parse_key_direction(item: &OptionItem, dir: &str) -> Result<i8, OptionError> {
    match dir {
        "0" => Ok(0),
        "1" => Ok(1),
        "bidirectional" | "bi" => Ok(-1),
        other => Err(bad_value(item, format!("bad key-direction '{other}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn load(text: &str, role: Role) -> ProtoResult<Config> {
        Config::load(&OptionList::parse(text).unwrap(), role)
    }

    #[test]
    fn test_defaults() {
        let c = load("dev tun\n", Role::Client).unwrap();
        assert_eq!(c.cipher, CipherAlg::BfCbc);
        assert_eq!(c.digest, DigestAlg::Sha1);
        assert_eq!(c.reliable_window, 4);
        assert_eq!(c.keepalive_ping, Duration::from_secs(8));
        assert_eq!(c.keepalive_timeout, Duration::from_secs(40));
        assert_eq!(c.renegotiate, Duration::from_secs(3600));
        assert_eq!(c.expire, Duration::from_secs(7200));
        // bs64 default cipher forces the short crossover
        assert_eq!(c.become_primary, Duration::from_secs(5));
        assert!(!c.tls_auth_enabled());
    }

    #[test]
    fn test_missing_dev_rejected() {
        assert!(load("cipher none\n", Role::Client).is_err());
    }

    #[test]
    fn test_become_primary_default() {
        let c = load("dev tun\ncipher AES-256-GCM\nreneg-sec 100\n", Role::Client).unwrap();
        // min(hand-window 60, reneg 100 / 2)
        assert_eq!(c.become_primary, Duration::from_secs(50));
    }

    #[test]
    fn test_server_renegotiate_offset() {
        let client = load("dev tun\ncipher none\nreneg-sec 60\n", Role::Client).unwrap();
        let server = load("dev tun\ncipher none\nreneg-sec 60\n", Role::Server).unwrap();
        assert_eq!(client.renegotiate, Duration::from_secs(60));
        assert_eq!(
            server.renegotiate,
            Duration::from_secs(60) + client.handshake_window
        );
    }

    #[test]
    fn test_keepalive_server_doubles_timeout() {
        let client = load("dev tun\nkeepalive 8 40\n", Role::Client).unwrap();
        let server = load("dev tun\nkeepalive 8 40\n", Role::Server).unwrap();
        assert_eq!(client.keepalive_timeout, Duration::from_secs(40));
        assert_eq!(server.keepalive_timeout, Duration::from_secs(80));
        assert_eq!(server.keepalive_ping, Duration::from_secs(8));
    }

    #[test]
    fn test_tls_auth_block() {
        let mut rng = StdRng::seed_from_u64(5);
        let key = OpenVpnStaticKey::random(&mut rng);
        let text = format!(
            "dev tun\nauth SHA256\n<tls-auth>\n{}</tls-auth>\n",
            key.render()
        );
        let c = load(&text, Role::Client).unwrap();
        assert!(c.tls_auth_enabled());
        assert_eq!(c.tls_auth_digest, DigestAlg::Sha256);

        let text = format!(
            "dev tun\n<tls-auth>\n{}</tls-auth>\ntls-auth-digest SHA512\nkey-direction 1\n",
            key.render()
        );
        let c = load(&text, Role::Server).unwrap();
        assert_eq!(c.tls_auth_digest, DigestAlg::Sha512);
        assert_eq!(c.key_direction, 1);
    }

    #[test]
    fn test_options_string_shape() {
        let c = load("dev tun\ncipher AES-256-GCM\nauth SHA1\n", Role::Client).unwrap();
        let s = c.options_string();
        assert!(s.starts_with("V4,dev-type tun,link-mtu "));
        assert!(s.contains(",tun-mtu 1500,proto UDPv4,"));
        assert!(s.contains(",cipher AES-256-GCM,auth SHA1,keysize 256,"));
        assert!(s.ends_with(",key-method 2,tls-client"));
        assert!(!s.contains("tls-auth"));
    }

    #[test]
    fn test_options_string_null_algorithms() {
        let c = load("dev tun\ncipher none\nauth none\n", Role::Server).unwrap();
        let s = c.options_string();
        assert!(s.contains(",cipher [null-cipher],auth [null-digest],keysize 0,"));
        assert!(s.ends_with(",tls-server"));
    }

    #[test]
    fn test_peer_info_string() {
        let mut c = load("dev tun\ncomp-lzo\n", Role::Client).unwrap();
        c.extra_peer_info.push(("IV_GUI_VER".into(), "test 1".into()));
        let s = c.peer_info_string();
        assert!(s.contains("IV_NCP=2\n"));
        assert!(s.contains("IV_PROTO=2\n"));
        assert!(s.contains("IV_LZO_STUB=1\n"));
        assert!(s.contains("IV_GUI_VER=test 1\n"));
        // BF-CBC default is a 64-bit block cipher
        assert!(s.contains("IV_BS64DL=1\n"));
    }

    #[test]
    fn test_process_push() {
        let mut c = load("dev tun\ncipher BF-CBC\n", Role::Client).unwrap();
        let push = OptionList::parse("cipher AES-256-GCM\npeer-id 7\nreneg-sec 120\n").unwrap();
        c.process_push(&push).unwrap();
        assert_eq!(c.cipher, CipherAlg::Aes256Gcm);
        assert_eq!(c.remote_peer_id, 7);
        assert!(c.enable_op32);
        assert_eq!(c.renegotiate, Duration::from_secs(120));
    }

    #[test]
    fn test_process_push_bad_peer_id() {
        let mut c = load("dev tun\n", Role::Client).unwrap();
        let push = OptionList::parse("peer-id 16777215\n").unwrap();
        assert!(matches!(
            c.process_push(&push),
            Err(ProtoError::ServerPush(_))
        ));
    }

    #[test]
    fn test_set_protocol_keeps_udp_pid_mode() {
        let mut c = load("dev tun\n", Role::Client).unwrap();
        c.set_protocol(TransportProtocol::Tcp);
        assert_eq!(c.pid_mode, PidMode::Udp);
        c.set_pid_mode(true);
        assert_eq!(c.pid_mode, PidMode::Tcp);
    }
}
