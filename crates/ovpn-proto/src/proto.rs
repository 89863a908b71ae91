//! Session orchestration.
//!
//! `ProtoContext` owns at most two key contexts (primary encrypts,
//! secondary renegotiates), the session IDs, the tls-auth state, and
//! the keepalive timers. It is single-threaded and never blocks: the
//! host drives it through the entry points and a `housekeeping` tick
//! at the time returned by `next_housekeeping`.

use rand::RngCore;
use tracing::debug;

use ovpn_core::constants::*;
use ovpn_core::pid::{PacketIdSend, PidForm, ReplayWindow};
use ovpn_core::stats::{ErrorCode, SessionStats};
use ovpn_core::time::{Duration, Time};
use ovpn_crypto::key_dir;
use ovpn_crypto::{CryptoError, OvpnHmac, RekeyType};

use crate::config::{Config, Role, TransportProtocol};
use crate::datalimit::{DataLimitMode, DataLimitState};
use crate::errors::{ProtoError, ProtoResult};
use crate::key_context::{KeyContext, KeyEvent};
use crate::key_method::write_empty_auth_string;
use crate::packet::{classify, Packet, PacketType};
use crate::psid::{ProtoSessionId, PSID_SIZE};
use crate::tls::TlsFactory;

/// Callbacks into the host application.
pub trait ProtoHost {
    /// Transmit a framed packet on the network.
    fn control_net_send(&mut self, packet: &[u8]);

    /// Deliver an assembled app-level control message.
    fn control_recv(&mut self, msg: Vec<u8>);

    /// Append username and password auth strings to the outgoing
    /// auth record (client side).
    fn client_auth(&mut self, buf: &mut Vec<u8>) {
        write_empty_auth_string(buf);
        write_empty_auth_string(buf);
    }

    /// Validate credentials and peer info from a client (server
    /// side).
    fn server_auth(&mut self, _username: &str, _password: &str, _peer_info: &str) {}

    /// The primary key context reached the ACTIVE state.
    fn active(&mut self) {}
}

/// Outcome of [`ProtoContext::data_decrypt`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecryptStatus {
    /// Payload bytes for the tun device.
    Data,
    /// Keepalive magic; discarded.
    Keepalive,
    /// Peer announced a graceful shutdown.
    ExitNotify,
    /// Nothing came out (drop, error, or inactive key).
    Empty,
}

/// State shared between the session layer and its key contexts.
pub(crate) struct Shared {
    pub(crate) config: Config,
    pub(crate) stats: SessionStats,
    pub(crate) rng: Box<dyn RngCore>,
    pub(crate) now: Time,

    pub(crate) use_tls_auth: bool,
    pub(crate) hmac_size: usize,
    pub(crate) ta_hmac_send: Option<OvpnHmac>,
    pub(crate) ta_hmac_recv: Option<OvpnHmac>,
    pub(crate) ta_pid_send: PacketIdSend,
    pub(crate) ta_pid_recv: ReplayWindow,

    pub(crate) psid_self: ProtoSessionId,
    pub(crate) psid_peer: Option<ProtoSessionId>,

    pub(crate) keepalive_xmit: Time,
    pub(crate) keepalive_expire: Time,

    pub(crate) dc_deferred: bool,
    pub(crate) slowest_handshake: Duration,
}

impl Shared {
    pub(crate) fn is_server(&self) -> bool {
        self.config.role == Role::Server
    }

    pub(crate) fn is_client(&self) -> bool {
        !self.is_server()
    }

    pub(crate) fn is_tcp(&self) -> bool {
        self.config.protocol.is_tcp()
    }

    pub(crate) fn is_udp(&self) -> bool {
        self.config.protocol.is_udp()
    }

    /// Push the session-expiry deadline out after any authenticated
    /// packet from the peer.
    pub(crate) fn update_last_received(&mut self) {
        self.keepalive_expire = self.now + self.config.keepalive_timeout;
    }

    /// Reset the keepalive transmit deadline after a data send.
    pub(crate) fn update_last_sent(&mut self) {
        self.keepalive_xmit = self.now + self.config.keepalive_ping;
    }
}

/// The OpenVPN-compatible protocol engine, usable on either side of
/// the session.
pub struct ProtoContext {
    sh: Shared,
    tls_factory: Box<dyn TlsFactory>,
    primary: Option<KeyContext>,
    secondary: Option<KeyContext>,
    upcoming_key_id: u8,
    n_key_ids: u32,
}

impl ProtoContext {
    pub fn new(config: Config, tls_factory: Box<dyn TlsFactory>, mut rng: Box<dyn RngCore>) -> Self {
        let use_tls_auth = config.tls_auth_enabled();
        let hmac_size = if use_tls_auth {
            config.tls_auth_digest.output_size()
        } else {
            0
        };
        let psid_self = ProtoSessionId::random(rng.as_mut());
        let pid_mode = config.pid_mode;
        Self {
            sh: Shared {
                config,
                stats: SessionStats::new(),
                rng,
                now: Time::ZERO,
                use_tls_auth,
                hmac_size,
                ta_hmac_send: None,
                ta_hmac_recv: None,
                ta_pid_send: PacketIdSend::new(PidForm::Long),
                ta_pid_recv: ReplayWindow::new(pid_mode),
                psid_self,
                psid_peer: None,
                keepalive_xmit: Time::infinite(),
                keepalive_expire: Time::infinite(),
                dc_deferred: false,
                slowest_handshake: Duration::ZERO,
            },
            tls_factory,
            primary: None,
            secondary: None,
            upcoming_key_id: 0,
            n_key_ids: 0,
        }
    }

    /// Initialize (or re-initialize) the session: fresh session ID,
    /// fresh tls-auth state, a new primary key context with key_id 0.
    pub fn reset(&mut self) -> ProtoResult<()> {
        self.sh.dc_deferred = self.sh.config.dc_deferred;

        if let Some(p) = self.primary.as_mut() {
            p.rekey(RekeyType::DeactivateAll);
        }
        self.primary = None;
        self.secondary = None;
        self.upcoming_key_id = 0;

        if self.sh.use_tls_auth {
            let config = &self.sh.config;
            let Some(key) = config.tls_auth_key.as_ref() else {
                return Err(ProtoError::Crypto(CryptoError::NotInitialized));
            };
            let (send_slice, recv_slice) = if config.key_direction >= 0 {
                let dir = if config.key_direction == 1 {
                    key_dir::INVERSE
                } else {
                    key_dir::NORMAL
                };
                (
                    key.slice(key_dir::HMAC | key_dir::ENCRYPT | dir),
                    key.slice(key_dir::HMAC | key_dir::DECRYPT | dir),
                )
            } else {
                // bidirectional mode uses one slot for both directions
                (key.slice(key_dir::HMAC), key.slice(key_dir::HMAC))
            };
            self.sh.ta_hmac_send = Some(OvpnHmac::new(config.tls_auth_digest, &send_slice)?);
            self.sh.ta_hmac_recv = Some(OvpnHmac::new(config.tls_auth_digest, &recv_slice)?);
            self.sh.ta_pid_send = PacketIdSend::new(PidForm::Long);
            self.sh.ta_pid_recv = ReplayWindow::new(self.sh.config.pid_mode);
        }

        self.sh.psid_self = ProtoSessionId::random(self.sh.rng.as_mut());
        self.sh.psid_peer = None;

        let initiator = self.sh.is_client();
        let key_id = self.next_key_id();
        debug!(key_id, "new primary key context");
        let kc = KeyContext::new(&mut self.sh, &*self.tls_factory, key_id, initiator);
        self.primary = Some(kc);

        self.sh.keepalive_expire = Time::infinite();
        self.sh.update_last_sent();
        Ok(())
    }

    /// Start protocol negotiation (sends the initial reset on the
    /// client).
    pub fn start(&mut self) -> ProtoResult<()> {
        let Some(p) = self.primary.as_mut() else {
            return Err(ProtoError::NoPrimary);
        };
        p.start(&mut self.sh);
        // sets an upper bound on when we expect a response
        self.sh.update_last_received();
        Ok(())
    }

    /// Classify an inbound packet against the live key contexts.
    pub fn packet_type(&self, buf: &[u8]) -> PacketType {
        classify(
            buf,
            self.sh.is_server(),
            self.primary.as_ref().map(|k| k.key_id()),
            self.secondary.as_ref().map(|k| k.key_id()),
            self.upcoming_key_id,
        )
    }

    /// Feed a received control-channel packet into the engine. Call
    /// [`flush`](Self::flush) with `control_channel = true` when the
    /// inbound batch is done.
    pub fn control_net_recv(
        &mut self,
        pt: &PacketType,
        buf: Vec<u8>,
        host: &mut dyn ProtoHost,
    ) -> ProtoResult<bool> {
        let pkt = Packet::new(pt.opcode(), buf);
        if pt.is_soft_reset() && !self.renegotiate_request(&pkt) {
            return Ok(false);
        }
        if !pt.is_control() {
            return Err(ProtoError::SelectKeyContext);
        }
        let slot = if pt.is_secondary() {
            &mut self.secondary
        } else {
            &mut self.primary
        };
        let Some(kc) = slot.as_mut() else {
            return Err(ProtoError::SelectKeyContext);
        };
        kc.net_recv(&mut self.sh, host, pkt)
    }

    /// Validate a control packet without mutating window state, e.g.
    /// for early drop decisions.
    pub fn control_net_validate(&mut self, pt: &PacketType, buf: &[u8]) -> bool {
        pt.is_defined() && KeyContext::validate(buf, &mut self.sh)
    }

    /// Encrypt a data packet with the primary key context.
    pub fn data_encrypt(&mut self, buf: &mut Vec<u8>) -> ProtoResult<()> {
        let Some(p) = self.primary.as_mut() else {
            return Err(ProtoError::NoPrimary);
        };
        p.encrypt(&mut self.sh, buf)
    }

    /// Decrypt a data packet, selecting primary or secondary by the
    /// packet's key ID.
    pub fn data_decrypt(
        &mut self,
        pt: &PacketType,
        buf: &mut Vec<u8>,
    ) -> ProtoResult<DecryptStatus> {
        if !pt.is_data() {
            return Err(ProtoError::SelectKeyContext);
        }
        let slot = if pt.is_secondary() {
            &mut self.secondary
        } else {
            &mut self.primary
        };
        let Some(kc) = slot.as_mut() else {
            return Err(ProtoError::SelectKeyContext);
        };
        kc.decrypt(&mut self.sh, buf);

        if buf.is_empty() {
            return Ok(DecryptStatus::Empty);
        }
        self.sh.update_last_received();
        if is_keepalive(buf) {
            buf.clear();
            Ok(DecryptStatus::Keepalive)
        } else if is_explicit_exit_notify(buf) {
            buf.clear();
            Ok(DecryptStatus::ExitNotify)
        } else {
            Ok(DecryptStatus::Data)
        }
    }

    /// Queue app-level cleartext (a control message) for the peer;
    /// a terminating null is appended on the wire.
    pub fn control_send(&mut self, msg: &[u8]) -> ProtoResult<()> {
        let Some(p) = self.primary.as_mut() else {
            return Err(ProtoError::NoPrimary);
        };
        let mut buf = Vec::with_capacity(msg.len() + 1);
        buf.extend_from_slice(msg);
        buf.push(0);
        p.app_send(buf)
    }

    /// Drive queued work to completion. Call at the end of a batch
    /// of send/recv operations; `control_channel = false` is the
    /// cheap data-path variant.
    pub fn flush(&mut self, control_channel: bool, host: &mut dyn ProtoHost) -> ProtoResult<()> {
        if control_channel || self.process_events(host)? {
            loop {
                if let Some(p) = self.primary.as_mut() {
                    p.flush(&mut self.sh, host)?;
                }
                if let Some(s) = self.secondary.as_mut() {
                    s.flush(&mut self.sh, host)?;
                }
                if !self.process_events(host)? {
                    break;
                }
            }
        }
        Ok(())
    }

    /// Time-based duties: retransmission, key events, keepalive.
    /// Call at the time returned by
    /// [`next_housekeeping`](Self::next_housekeeping).
    pub fn housekeeping(&mut self, host: &mut dyn ProtoHost) -> ProtoResult<()> {
        if let Some(p) = self.primary.as_mut() {
            p.retransmit(&mut self.sh, host);
        }
        if let Some(s) = self.secondary.as_mut() {
            s.retransmit(&mut self.sh, host);
        }
        self.flush(false, host)?;
        self.keepalive_housekeeping(host)
    }

    /// Earliest deadline among retransmit timers, key events, and
    /// keepalive timers.
    pub fn next_housekeeping(&self) -> Time {
        if self.invalidated() {
            return self.sh.now;
        }
        let mut t = Time::infinite();
        if let Some(p) = &self.primary {
            t = t.min(p.next_retransmit());
        }
        if let Some(s) = &self.secondary {
            t = t.min(s.next_retransmit());
        }
        t.min(self.sh.keepalive_xmit).min(self.sh.keepalive_expire)
    }

    /// Trigger a local renegotiation: a fresh secondary key context
    /// takes the next key ID and starts its handshake.
    pub fn renegotiate(&mut self) -> ProtoResult<()> {
        self.new_secondary_key(true);
        if let Some(s) = self.secondary.as_mut() {
            s.start(&mut self.sh);
        }
        Ok(())
    }

    /// Invalidate both key contexts; no further emission happens.
    pub fn disconnect(&mut self, reason: ErrorCode) {
        if let Some(p) = self.primary.as_mut() {
            p.invalidate(reason);
        }
        if let Some(s) = self.secondary.as_mut() {
            s.invalidate(reason);
        }
    }

    /// UDP clients send the explicit-exit magic once on graceful
    /// shutdown.
    pub fn send_explicit_exit_notify(&mut self, host: &mut dyn ProtoHost) -> ProtoResult<()> {
        if self.sh.is_client() && self.sh.is_udp() {
            if let Some(p) = self.primary.as_mut() {
                p.send_explicit_exit_notify(&mut self.sh, host)?;
            }
        }
        Ok(())
    }

    /// Apply a server-pushed options update (client side).
    pub fn process_push(&mut self, opt: &ovpn_core::options::OptionList) -> ProtoResult<()> {
        self.sh.config.process_push(opt)?;
        self.keepalive_parms_modified();
        Ok(())
    }

    /// Late data-channel initialization, e.g. after a server push.
    pub fn init_data_channel(&mut self) -> ProtoResult<()> {
        self.sh.dc_deferred = false;
        if let Some(p) = self.primary.as_mut() {
            p.init_data_channel(&mut self.sh)?;
        }
        if let Some(s) = self.secondary.as_mut() {
            s.init_data_channel(&mut self.sh)?;
        }
        Ok(())
    }

    /// Forward an externally observed data-limit state change to the
    /// owning key context.
    pub fn data_limit_notify(&mut self, key_id: u8, mode: DataLimitMode, state: DataLimitState) {
        if self.primary.as_ref().map(|k| k.key_id()) == Some(key_id) {
            if let Some(p) = self.primary.as_mut() {
                p.data_limit_notify(&mut self.sh, mode, state);
            }
        } else if self.secondary.as_ref().map(|k| k.key_id()) == Some(key_id) {
            if let Some(s) = self.secondary.as_mut() {
                s.data_limit_notify(&mut self.sh, mode, state);
            }
        }
    }

    pub fn set_protocol(&mut self, protocol: TransportProtocol) {
        self.sh.config.set_protocol(protocol);
    }

    /// Reset the keepalive timers after the host reports a data
    /// send.
    pub fn update_last_sent(&mut self) {
        self.sh.update_last_sent();
    }

    pub fn update_now(&mut self, now: Time) {
        self.sh.now = now;
    }

    pub fn now(&self) -> Time {
        self.sh.now
    }

    pub fn data_channel_ready(&self) -> bool {
        self.primary.as_ref().is_some_and(|p| p.data_channel_ready())
    }

    /// Total SSL/TLS negotiations over the session lifetime.
    pub fn negotiations(&self) -> u32 {
        self.n_key_ids
    }

    /// Worst-case observed handshake duration.
    pub fn slowest_handshake(&self) -> Duration {
        self.sh.slowest_handshake
    }

    pub fn invalidated(&self) -> bool {
        self.primary.as_ref().is_some_and(|p| p.invalidated())
    }

    pub fn invalidation_reason(&self) -> Option<ErrorCode> {
        self.primary.as_ref().and_then(|p| p.invalidation_reason())
    }

    pub fn is_keepalive_enabled(&self) -> bool {
        self.sh.config.keepalive_ping.is_enabled() || self.sh.config.keepalive_timeout.is_enabled()
    }

    /// Disable keepalive for the rest of the session; returns the
    /// previous (ping, timeout) seconds, zero for a timer that was
    /// already disabled.
    pub fn disable_keepalive(&mut self) -> (u64, u64) {
        let ping = self.sh.config.keepalive_ping;
        let timeout = self.sh.config.keepalive_timeout;
        let previous = (
            if ping.is_enabled() { ping.as_secs() } else { 0 },
            if timeout.is_enabled() {
                timeout.as_secs()
            } else {
                0
            },
        );
        self.sh.config.keepalive_ping = Duration::infinite();
        self.sh.config.keepalive_timeout = Duration::infinite();
        self.keepalive_parms_modified();
        previous
    }

    pub fn stats(&self) -> &SessionStats {
        &self.sh.stats
    }

    pub fn config(&self) -> &Config {
        &self.sh.config
    }

    pub fn psid_self(&self) -> &ProtoSessionId {
        &self.sh.psid_self
    }

    pub fn psid_peer(&self) -> Option<&ProtoSessionId> {
        self.sh.psid_peer.as_ref()
    }

    /// Key ID of the live primary context, if any.
    pub fn primary_key_id(&self) -> Option<u8> {
        self.primary.as_ref().map(|k| k.key_id())
    }

    /// Key ID of the live secondary context, if any.
    pub fn secondary_key_id(&self) -> Option<u8> {
        self.secondary.as_ref().map(|k| k.key_id())
    }

    // ---- internals ----

    // key_id 0 is reserved for the first key; afterwards the IDs
    // cycle 1..7
    fn next_key_id(&mut self) -> u8 {
        self.n_key_ids += 1;
        let ret = self.upcoming_key_id;
        self.upcoming_key_id = (self.upcoming_key_id + 1) & KEY_ID_MASK;
        if self.upcoming_key_id == 0 {
            self.upcoming_key_id = 1;
        }
        ret
    }

    fn renegotiate_request(&mut self, pkt: &Packet) -> bool {
        if KeyContext::validate(&pkt.buf, &mut self.sh) {
            self.new_secondary_key(false);
            true
        } else {
            false
        }
    }

    fn new_secondary_key(&mut self, initiator: bool) {
        let key_id = self.next_key_id();
        debug!(key_id, initiator, "new secondary key context");
        let kc = KeyContext::new(&mut self.sh, &*self.tls_factory, key_id, initiator);
        self.secondary = Some(kc);
    }

    /// Swap the primary and secondary slots; the old primary is
    /// retired and marked for expiration.
    fn promote_secondary_to_primary(&mut self) {
        std::mem::swap(&mut self.primary, &mut self.secondary);
        debug!(
            primary = ?self.primary_key_id(),
            secondary = ?self.secondary_key_id(),
            "promoted secondary to primary"
        );
        if let Some(p) = self.primary.as_mut() {
            p.rekey(RekeyType::PromoteSecondaryToPrimary);
        }
        if let Some(s) = self.secondary.as_mut() {
            s.prepare_expire(&self.sh);
        }
    }

    fn keepalive_housekeeping(&mut self, host: &mut dyn ProtoHost) -> ProtoResult<()> {
        if self.sh.now >= self.sh.keepalive_xmit {
            if let Some(p) = self.primary.as_mut() {
                p.send_keepalive(&mut self.sh, host)?;
            }
            self.sh.update_last_sent();
        }
        if self.sh.now >= self.sh.keepalive_expire {
            // no contact with the peer, give up the session
            self.sh.stats.error(ErrorCode::KeepaliveTimeout);
            self.disconnect(ErrorCode::KeepaliveTimeout);
        }
        Ok(())
    }

    fn process_events(&mut self, host: &mut dyn ProtoHost) -> ProtoResult<bool> {
        let mut did_work = false;

        let pending = match self.primary.as_mut() {
            Some(p) => p.event_pending(&mut self.sh),
            None => false,
        };
        if pending {
            self.process_primary_event(host)?;
            did_work = true;
        }

        let pending = match self.secondary.as_mut() {
            Some(s) => s.event_pending(&mut self.sh),
            None => false,
        };
        if pending {
            self.process_secondary_event()?;
            did_work = true;
        }

        Ok(did_work)
    }

    fn process_primary_event(&mut self, host: &mut dyn ProtoHost) -> ProtoResult<()> {
        let event = match self.primary.as_mut() {
            Some(p) => {
                let event = p.get_event();
                p.reset_event();
                event
            }
            None => return Ok(()),
        };
        match event {
            KeyEvent::Active => {
                debug!("session active");
                if let Some(p) = self.primary.as_mut() {
                    p.rekey(RekeyType::ActivatePrimary);
                }
                host.active();
            }
            KeyEvent::Renegotiate | KeyEvent::RenegotiateForce => {
                self.renegotiate()?;
            }
            KeyEvent::Expire => {
                if self.secondary.as_ref().is_some_and(|s| !s.invalidated()) {
                    self.promote_secondary_to_primary();
                } else {
                    // primary expired with no successor
                    self.sh.stats.error(ErrorCode::PrimaryExpire);
                    self.disconnect(ErrorCode::PrimaryExpire);
                }
            }
            KeyEvent::Negotiate => {
                self.sh.stats.error(ErrorCode::HandshakeTimeout);
                self.disconnect(ErrorCode::HandshakeTimeout);
            }
            _ => {}
        }
        if let Some(p) = self.primary.as_mut() {
            p.set_next_event_if_unspecified(&self.sh);
        }
        Ok(())
    }

    fn process_secondary_event(&mut self) -> ProtoResult<()> {
        let event = match self.secondary.as_mut() {
            Some(s) => {
                let event = s.get_event();
                s.reset_event();
                event
            }
            None => return Ok(()),
        };
        match event {
            KeyEvent::Active => {
                if let Some(s) = self.secondary.as_mut() {
                    s.rekey(RekeyType::NewSecondary);
                }
                if let Some(p) = self.primary.as_mut() {
                    p.prepare_expire(&self.sh);
                }
            }
            KeyEvent::BecomePrimary => {
                if self.secondary.as_ref().is_some_and(|s| !s.invalidated()) {
                    self.promote_secondary_to_primary();
                }
            }
            KeyEvent::Expire => {
                if let Some(s) = self.secondary.as_mut() {
                    s.rekey(RekeyType::DeactivateSecondary);
                }
                self.secondary = None;
            }
            KeyEvent::RenegotiateQueue => {
                // the queued request crosses over to the primary at
                // promotion time
                let at = self.secondary.as_ref().and_then(|s| s.become_primary_time());
                if let (Some(p), Some(at)) = (self.primary.as_mut(), at) {
                    p.key_limit_reneg(&self.sh, KeyEvent::RenegotiateForce, at);
                }
            }
            KeyEvent::Negotiate => {
                self.sh.stats.error(ErrorCode::HandshakeTimeout);
                self.renegotiate()?;
            }
            KeyEvent::PrimaryPending | KeyEvent::RenegotiateForce => {
                self.renegotiate()?;
            }
            _ => {}
        }
        if let Some(s) = self.secondary.as_mut() {
            s.set_next_event_if_unspecified(&self.sh);
        }
        Ok(())
    }

    fn keepalive_parms_modified(&mut self) {
        self.sh.update_last_received();
        // only pull the transmit timer earlier; later cycles pick up
        // the new period on their own
        let kx = self.sh.now + self.sh.config.keepalive_ping;
        if kx < self.sh.keepalive_xmit {
            self.sh.keepalive_xmit = kx;
        }
    }
}

/// Standalone first-packet validator for tls-auth deployments:
/// checks that an initial packet is the expected hard reset with
/// key_id 0 and a valid HMAC, without any session state.
pub struct TlsAuthPreValidate {
    hmac: OvpnHmac,
    reset_op: u8,
}

impl TlsAuthPreValidate {
    pub fn new(config: &Config, server: bool) -> ProtoResult<Self> {
        let Some(key) = config.tls_auth_key.as_ref().filter(|_| config.tls_auth_enabled())
        else {
            return Err(ProtoError::Crypto(CryptoError::NotInitialized));
        };
        let recv_slice = if config.key_direction >= 0 {
            let dir = if config.key_direction == 1 {
                key_dir::INVERSE
            } else {
                key_dir::NORMAL
            };
            key.slice(key_dir::HMAC | key_dir::DECRYPT | dir)
        } else {
            key.slice(key_dir::HMAC)
        };
        Ok(Self {
            hmac: OvpnHmac::new(config.tls_auth_digest, &recv_slice)?,
            reset_op: if server {
                CONTROL_HARD_RESET_CLIENT_V2
            } else {
                CONTROL_HARD_RESET_SERVER_V2
            },
        })
    }

    pub fn validate(&self, net_buf: &[u8]) -> bool {
        let Some(&op) = net_buf.first() else {
            return false;
        };
        if opcode_extract(op) != self.reset_op || key_id_extract(op) != 0 {
            return false;
        }
        self.hmac.verify(net_buf, 1 + PSID_SIZE, PidForm::Long.size())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::testing::LoopbackTlsFactory;
    use ovpn_core::options::OptionList;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn proto(role: Role) -> ProtoContext {
        let opt = OptionList::parse("dev tun\ncipher AES-128-GCM\n").unwrap();
        let config = Config::load(&opt, role).unwrap();
        ProtoContext::new(
            config,
            Box::new(LoopbackTlsFactory),
            Box::new(StdRng::seed_from_u64(9)),
        )
    }

    #[test]
    fn test_key_id_cycle_skips_zero() {
        let mut p = proto(Role::Client);
        let mut ids = Vec::new();
        for _ in 0..16 {
            ids.push(p.next_key_id());
        }
        assert_eq!(ids[..9], [0, 1, 2, 3, 4, 5, 6, 7, 1]);
        assert!(!ids[1..].contains(&0));
        assert_eq!(p.negotiations(), 16);
    }

    #[test]
    fn test_reset_creates_primary() {
        let mut p = proto(Role::Client);
        p.update_now(Time::from_secs(1));
        p.reset().unwrap();
        assert_eq!(p.primary_key_id(), Some(0));
        assert_eq!(p.secondary_key_id(), None);
        assert!(!p.data_channel_ready());
        assert!(!p.invalidated());
    }

    #[test]
    fn test_disable_keepalive() {
        let mut p = proto(Role::Client);
        assert!(p.is_keepalive_enabled());
        let (ping, timeout) = p.disable_keepalive();
        assert_eq!((ping, timeout), (8, 40));
        assert!(!p.is_keepalive_enabled());

        // disabling again reports zeros, not the infinite sentinel
        assert_eq!(p.disable_keepalive(), (0, 0));
    }

    #[test]
    fn test_packet_type_uses_live_keys() {
        let mut p = proto(Role::Client);
        p.update_now(Time::from_secs(1));
        p.reset().unwrap();
        let pt = p.packet_type(&[op_compose(CONTROL_HARD_RESET_SERVER_V2, 0)]);
        assert!(pt.is_control());
        let pt = p.packet_type(&[op_compose(CONTROL_V1, 5)]);
        assert!(!pt.is_defined());
    }
}
