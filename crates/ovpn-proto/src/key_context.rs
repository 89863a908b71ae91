//! Per-key protocol state.
//!
//! A `KeyContext` encapsulates one SSL/TLS session: the reliable
//! control-channel windows, the handshake state machine, the
//! key-method 2 auth exchange, and the data-channel crypto instance
//! once keys are derived.
//!
//! ```text
//! Client:  C_INITIAL -> C_WAIT_RESET -> C_WAIT_RESET_ACK
//!            -> C_WAIT_AUTH -> C_WAIT_AUTH_ACK -> ACTIVE
//! Server:  S_INITIAL -> S_WAIT_RESET -> S_WAIT_RESET_ACK
//!            -> S_WAIT_AUTH -> S_WAIT_AUTH_ACK -> ACTIVE
//! ```
//!
//! The very first key (key_id 0) is created as the primary;
//! renegotiated keys start as the secondary and promote via
//! `KEV_BECOME_PRIMARY`, which swaps the primary and secondary slots
//! and marks the old primary for expiration.

use std::collections::VecDeque;

use tracing::{debug, trace};

use ovpn_core::buf::Reader;
use ovpn_core::constants::*;
use ovpn_core::pid::{PacketId, PidForm};
use ovpn_core::stats::ErrorCode;
use ovpn_core::time::{Duration, Time};
use ovpn_crypto::dc::crypto_flags;
use ovpn_crypto::key_dir;
use ovpn_crypto::{DataChannelCrypto, OpenVpnStaticKey, RekeyType, TlsPrf};

use crate::comp::Compressor;
use crate::datalimit::{DataLimit, DataLimitMode, DataLimitState};
use crate::errors::{ProtoError, ProtoResult};
use crate::key_method::{
    auth_record_complete, check_auth_prefix, read_auth_string, write_auth_string,
    write_empty_auth_string,
};
use crate::packet::Packet;
use crate::proto::{ProtoHost, Shared};
use crate::psid::{ProtoSessionId, PSID_SIZE};
use crate::reliable::{AckList, MsgId, ReliableRecv, ReliableSend, ACK_TO_SENDER, IN_WINDOW};
use crate::tls::{AppWrite, TlsFactory, TlsSession};

/// Key lifecycle events, consumed by the session layer's event pump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyEvent {
    None,
    /// Reached the ACTIVE state; fires on primary and secondary.
    Active,
    /// Negotiation deadline hit. Fatal on the first primary,
    /// triggers a fresh renegotiation on a secondary.
    Negotiate,
    /// Secondary is scheduled to take over as primary.
    BecomePrimary,
    /// Waiting for peer dataflow before BecomePrimary (64-bit-block
    /// ciphers on clients).
    PrimaryPending,
    /// Start renegotiating a new secondary (primary only).
    Renegotiate,
    /// Renegotiation forced from either slot.
    RenegotiateForce,
    /// Renegotiation queued on a secondary until it promotes.
    RenegotiateQueue,
    /// Key context has expired.
    Expire,
}

/// Handshake states. ACK states come first; `Active` is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KeyState {
    CWaitResetAck,
    CWaitAuthAck,
    SWaitResetAck,
    SWaitAuthAck,
    CInitial,
    CWaitReset,
    CWaitAuth,
    SInitial,
    SWaitReset,
    SWaitAuth,
    Active,
}

impl KeyState {
    fn is_ack_state(&self) -> bool {
        matches!(
            self,
            KeyState::CWaitResetAck
                | KeyState::CWaitAuthAck
                | KeyState::SWaitResetAck
                | KeyState::SWaitAuthAck
        )
    }
}

/// Derived key material pending data-channel activation, e.g. while
/// waiting for a server options push.
struct DataChannelKey {
    key: OpenVpnStaticKey,
    rekey_type: Option<RekeyType>,
}

/// One SSL/TLS session and its data-channel keys.
pub struct KeyContext {
    key_id: u8,
    state: KeyState,
    is_reliable: bool,
    dirty: bool,
    key_limit_renegotiation_fired: bool,

    invalidated: bool,
    invalidation_reason: Option<ErrorCode>,

    construct_time: Time,
    reached_active_time: Time,

    current_event: KeyEvent,
    next_event: KeyEvent,
    next_event_time: Time,

    // reliability layer
    rel_send: ReliableSend,
    rel_recv: ReliableRecv,
    xmit_acks: AckList,
    max_ack_list: usize,

    // handshake bridge
    ssl: Box<dyn TlsSession>,
    ssl_started: bool,
    tlsprf: TlsPrf,
    raw_write_queue: VecDeque<Packet>,
    app_write_queue: VecDeque<Vec<u8>>,
    app_pre_write_queue: VecDeque<Vec<u8>>,
    app_recv_buf: Vec<u8>,

    // data channel
    data_channel_key: Option<DataChannelKey>,
    crypto: Option<DataChannelCrypto>,
    crypto_flags: u32,
    compress: Option<Compressor>,
    data_limit: Option<DataLimit>,
    enable_op32: bool,
    remote_peer_id: i32,
}

impl KeyContext {
    pub(crate) fn new(
        sh: &mut Shared,
        tls_factory: &dyn TlsFactory,
        key_id: u8,
        initiator: bool,
    ) -> Self {
        let server = sh.is_server();
        let state = match (server, initiator) {
            (false, true) => KeyState::CInitial,
            (false, false) => KeyState::CWaitReset,
            (true, true) => KeyState::SInitial,
            (true, false) => KeyState::SWaitReset,
        };
        let config = &sh.config;
        let mut kc = Self {
            key_id,
            state,
            is_reliable: config.protocol.is_reliable(),
            dirty: false,
            key_limit_renegotiation_fired: false,
            invalidated: false,
            invalidation_reason: None,
            construct_time: sh.now,
            reached_active_time: Time::ZERO,
            current_event: KeyEvent::None,
            next_event: KeyEvent::None,
            next_event_time: Time::infinite(),
            rel_send: ReliableSend::new(config.reliable_window, config.tls_timeout),
            rel_recv: ReliableRecv::new(config.reliable_window),
            xmit_acks: AckList::new(),
            max_ack_list: config.max_ack_list,
            ssl: tls_factory.new_session(server),
            ssl_started: false,
            tlsprf: TlsPrf::new(server),
            raw_write_queue: VecDeque::new(),
            app_write_queue: VecDeque::new(),
            app_pre_write_queue: VecDeque::new(),
            app_recv_buf: Vec::new(),
            data_channel_key: None,
            crypto: None,
            crypto_flags: 0,
            compress: None,
            data_limit: None,
            enable_op32: config.enable_op32,
            remote_peer_id: config.remote_peer_id,
        };
        let deadline = kc.construct_time + sh.config.handshake_window;
        kc.set_event_next(KeyEvent::Negotiate, deadline);
        kc
    }

    pub(crate) fn key_id(&self) -> u8 {
        self.key_id
    }

    pub(crate) fn data_channel_ready(&self) -> bool {
        self.state == KeyState::Active
    }

    pub(crate) fn invalidated(&self) -> bool {
        self.invalidated
    }

    pub(crate) fn invalidation_reason(&self) -> Option<ErrorCode> {
        self.invalidation_reason
    }

    pub(crate) fn invalidate(&mut self, reason: ErrorCode) {
        if !self.invalidated {
            debug!(key_id = self.key_id, %reason, "key context invalidated");
            self.invalidated = true;
            self.invalidation_reason = Some(reason);
            self.reached_active_time = Time::ZERO;
            self.next_event = KeyEvent::None;
            self.next_event_time = Time::infinite();
        }
    }

    /// Initiator side: emit the initial reset and leave the INITIAL
    /// state. A no-op on the listening side.
    pub(crate) fn start(&mut self, sh: &mut Shared) {
        match self.state {
            KeyState::CInitial => {
                self.send_reset(sh);
                self.set_state(KeyState::CWaitReset);
                self.dirty = true;
            }
            KeyState::SInitial => {
                self.send_reset(sh);
                self.set_state(KeyState::SWaitReset);
                self.dirty = true;
            }
            _ => {}
        }
    }

    /// Control-channel flush: advance the state machine, move queued
    /// data down the stack, and emit pending ACKs.
    pub(crate) fn flush(&mut self, sh: &mut Shared, host: &mut dyn ProtoHost) -> ProtoResult<()> {
        if !self.dirty {
            return Ok(());
        }
        if self.invalidated {
            self.dirty = false;
            return Ok(());
        }
        self.post_ack_action(sh, host)?;
        self.down_stack_raw(sh, host)?;
        self.down_stack_app(sh, host)?;
        self.send_pending_acks(sh, host)?;
        self.dirty = false;
        Ok(())
    }

    /// Re-emit unacknowledged control packets whose timer expired.
    /// Datagram transports only; a stream transport already
    /// retransmits on its own.
    pub(crate) fn retransmit(&mut self, sh: &mut Shared, host: &mut dyn ProtoHost) {
        if self.invalidated {
            return;
        }
        let is_reliable = self.is_reliable;
        self.rel_send.visit_due(sh.now, |pkt| {
            // a stream transport retransmits on its own; the timer
            // still resets so n_unacked bookkeeping stays uniform
            if !is_reliable {
                host.control_net_send(&pkt.buf);
            }
        });
    }

    /// Earliest deadline of the retransmit timers and the key event.
    pub(crate) fn next_retransmit(&self) -> Time {
        self.rel_send.next_retransmit().min(self.next_event_time)
    }

    /// Queue app-level cleartext for the peer. Before ACTIVE the
    /// bytes wait in a pre-write queue.
    pub(crate) fn app_send(&mut self, buf: Vec<u8>) -> ProtoResult<()> {
        if self.state == KeyState::Active {
            self.app_send_validate(buf)?;
            self.dirty = true;
        } else {
            self.app_pre_write_queue.push_back(buf);
        }
        Ok(())
    }

    fn app_send_validate(&mut self, buf: Vec<u8>) -> ProtoResult<()> {
        if buf.len() > APP_MSG_MAX {
            return Err(ProtoError::AppMsgTooLarge);
        }
        self.app_write_queue.push_back(buf);
        Ok(())
    }

    /// Feed a received control-channel packet through decapsulation
    /// and, when accepted, up into the TLS stream.
    pub(crate) fn net_recv(
        &mut self,
        sh: &mut Shared,
        host: &mut dyn ProtoHost,
        pkt: Packet,
    ) -> ProtoResult<bool> {
        if self.invalidated {
            return Ok(false);
        }
        let accepted = self.decapsulate(sh, pkt)?;
        if accepted {
            self.up_sequenced(sh, host)?;
        }
        self.dirty = true;
        Ok(accepted)
    }

    // ---- data channel ----

    /// Encrypt a data packet in place, prepending the op header.
    pub(crate) fn encrypt(&mut self, sh: &mut Shared, buf: &mut Vec<u8>) -> ProtoResult<()> {
        if self.state == KeyState::Active
            && self.crypto_flags & crypto_flags::CRYPTO_DEFINED != 0
            && !self.invalidated
        {
            let pid_wrap = self.do_encrypt(sh, buf, true)?;
            // a wrapped 32-bit packet ID would look like a replay
            // storm to the peer; rekey before it happens
            if pid_wrap {
                self.schedule_key_limit_renegotiation(sh);
            }
        } else {
            buf.clear();
        }
        Ok(())
    }

    /// Decrypt a data packet in place. Failures are counted; on a
    /// stream transport they invalidate the key since resync is
    /// impossible.
    pub(crate) fn decrypt(&mut self, sh: &mut Shared, buf: &mut Vec<u8>) {
        if self.state != KeyState::Active
            || self.crypto_flags & crypto_flags::CRYPTO_DEFINED == 0
            || self.invalidated
        {
            buf.clear();
            return;
        }
        let Some(&op) = buf.first() else {
            sh.stats.error(ErrorCode::BufferError);
            return;
        };
        let head_size = op_head_size(op);
        if buf.len() < head_size {
            sh.stats.error(ErrorCode::BufferError);
            if sh.is_tcp() {
                self.invalidate(ErrorCode::BufferError);
            }
            buf.clear();
            return;
        }
        let ad = (head_size == OP_SIZE_V2).then(|| [buf[0], buf[1], buf[2], buf[3]]);
        buf.drain(..head_size);

        let Some(dc) = self.crypto.as_mut() else {
            buf.clear();
            return;
        };
        if let Err(code) = dc.decrypt(buf, sh.now.seconds_since_epoch(), ad) {
            sh.stats.error(code);
            if sh.is_tcp() && matches!(code, ErrorCode::DecryptError | ErrorCode::HmacError) {
                self.invalidate(code);
            }
            buf.clear();
            return;
        }

        let size = buf.len();
        self.data_limit_add(sh, DataLimitMode::Decrypt, size);

        if let Some(comp) = &self.compress {
            if let Err(code) = comp.decompress(buf) {
                sh.stats.error(code);
                buf.clear();
            }
        }
    }

    fn do_encrypt(
        &mut self,
        sh: &mut Shared,
        buf: &mut Vec<u8>,
        compress_hint: bool,
    ) -> ProtoResult<bool> {
        if let Some(comp) = &self.compress {
            comp.compress(buf, compress_hint);
        }
        let size = buf.len();
        self.data_limit_add(sh, DataLimitMode::Encrypt, size);

        let Some(dc) = self.crypto.as_mut() else {
            buf.clear();
            return Ok(false);
        };
        let now_secs = sh.now.seconds_since_epoch();
        let pid_wrap;
        if self.enable_op32 {
            let op32 = op32_compose(DATA_V2, self.key_id, self.remote_peer_id).to_be_bytes();
            pid_wrap = dc.encrypt(buf, now_secs, Some(op32), sh.rng.as_mut())?;
            buf.splice(0..0, op32);
        } else {
            pid_wrap = dc.encrypt(buf, now_secs, None, sh.rng.as_mut())?;
            buf.insert(0, op_compose(DATA_V1, self.key_id));
        }
        Ok(pid_wrap)
    }

    /// Encrypt and transmit a fixed data-channel message (keepalive,
    /// explicit exit).
    fn send_data_channel_message(
        &mut self,
        sh: &mut Shared,
        host: &mut dyn ProtoHost,
        data: &[u8],
    ) -> ProtoResult<()> {
        if self.state == KeyState::Active
            && self.crypto_flags & crypto_flags::CRYPTO_DEFINED != 0
            && !self.invalidated
        {
            let mut buf = data.to_vec();
            self.do_encrypt(sh, &mut buf, false)?;
            host.control_net_send(&buf);
        }
        Ok(())
    }

    pub(crate) fn send_keepalive(
        &mut self,
        sh: &mut Shared,
        host: &mut dyn ProtoHost,
    ) -> ProtoResult<()> {
        self.send_data_channel_message(sh, host, &KEEPALIVE_MESSAGE)
    }

    pub(crate) fn send_explicit_exit_notify(
        &mut self,
        sh: &mut Shared,
        host: &mut dyn ProtoHost,
    ) -> ProtoResult<()> {
        self.send_data_channel_message(sh, host, &EXPLICIT_EXIT_NOTIFY_MESSAGE)
    }

    /// Build the data-channel crypto context from the deferred key
    /// material.
    pub(crate) fn init_data_channel(&mut self, sh: &mut Shared) -> ProtoResult<()> {
        let Some(dck) = self.data_channel_key.take() else {
            return Ok(());
        };
        let config = &sh.config;

        if config.cipher.is_bs64() {
            debug!(limit = BS64_DATA_LIMIT, "per-key data limit enabled");
            self.data_limit = Some(DataLimit::new(BS64_DATA_LIMIT, BS64_DATA_LIMIT));
        }

        let mut dc = DataChannelCrypto::new(config.cipher, config.digest);
        let flags = dc.defined();
        let dir = if sh.is_server() {
            key_dir::INVERSE
        } else {
            key_dir::NORMAL
        };
        if flags & crypto_flags::CIPHER_DEFINED != 0 {
            dc.init_cipher(
                dck.key.slice(key_dir::CIPHER | key_dir::ENCRYPT | dir),
                dck.key.slice(key_dir::CIPHER | key_dir::DECRYPT | dir),
            )?;
        }
        if flags & crypto_flags::HMAC_DEFINED != 0 {
            dc.init_hmac(
                dck.key.slice(key_dir::HMAC | key_dir::ENCRYPT | dir),
                dck.key.slice(key_dir::HMAC | key_dir::DECRYPT | dir),
            )?;
        }
        dc.init_pid(config.pid_mode);
        if let Some(rekey_type) = dck.rekey_type {
            dc.rekey(rekey_type);
        }
        let enable_compress = dc.consider_compression();

        self.crypto_flags = flags;
        self.crypto = Some(dc);
        self.compress = enable_compress.then(|| sh.config.comp.new_compressor());
        self.cache_op32(sh);
        Ok(())
    }

    /// Lifecycle notification from the session layer.
    pub(crate) fn rekey(&mut self, rekey_type: RekeyType) {
        if let Some(dc) = self.crypto.as_mut() {
            dc.rekey(rekey_type);
        } else if let Some(dck) = self.data_channel_key.as_mut() {
            dck.rekey_type = Some(rekey_type);
        }
    }

    fn cache_op32(&mut self, sh: &Shared) {
        self.enable_op32 = sh.config.enable_op32;
        self.remote_peer_id = sh.config.remote_peer_id;
    }

    // ---- data limits ----

    pub(crate) fn data_limit_notify(
        &mut self,
        sh: &mut Shared,
        mode: DataLimitMode,
        state: DataLimitState,
    ) {
        if let Some(dl) = self.data_limit.as_mut() {
            let merged = dl.update_state(mode, state);
            self.data_limit_event(sh, mode, merged);
        }
    }

    fn data_limit_add(&mut self, sh: &mut Shared, mode: DataLimitMode, size: usize) {
        let Some(dl) = self.data_limit.as_mut() else {
            return;
        };
        let state = dl.add(mode, size);
        if state > DataLimitState::None {
            self.data_limit_event(sh, mode, state);
        }
    }

    fn data_limit_event(&mut self, sh: &mut Shared, mode: DataLimitMode, state: DataLimitState) {
        trace!(key_id = self.key_id, ?mode, ?state, "data limit");
        if state == DataLimitState::Red {
            self.schedule_key_limit_renegotiation(sh);
        }
        // in PRIMARY_PENDING we must see at least one decrypted
        // packet on this key before transmitting on it
        if self.next_event == KeyEvent::PrimaryPending
            && self.data_limit.as_ref().is_some_and(|d| d.is_decrypt_green())
        {
            let at = sh.now + Duration::from_secs(1);
            self.set_event_next(KeyEvent::BecomePrimary, at);
        }
    }

    /// Renegotiate because of a data limit or packet-ID wrap. On a
    /// secondary still waiting to promote, the request is queued and
    /// crosses over at promotion.
    fn schedule_key_limit_renegotiation(&mut self, sh: &mut Shared) {
        if !self.key_limit_renegotiation_fired
            && self.state == KeyState::Active
            && !self.invalidated
        {
            debug!(key_id = self.key_id, "key limit renegotiation scheduled");
            self.key_limit_renegotiation_fired = true;
            sh.stats.error(ErrorCode::KeyLimitReneg);

            if self.next_event == KeyEvent::BecomePrimary {
                self.set_event_current(KeyEvent::RenegotiateQueue);
            } else {
                let now = sh.now;
                self.key_limit_reneg(sh, KeyEvent::Renegotiate, now);
            }
        }
    }

    pub(crate) fn key_limit_reneg(&mut self, sh: &Shared, event: KeyEvent, at: Time) {
        let pad = Duration::from_secs(if sh.is_server() { 2 } else { 1 });
        self.set_event_both(KeyEvent::None, event, at + pad);
    }

    fn data_limit_defer(&self, sh: &Shared) -> bool {
        !sh.is_server()
            && self.key_id != 0
            && self
                .data_limit
                .as_ref()
                .is_some_and(|d| !d.is_decrypt_green())
    }

    fn data_limit_expire(&self, sh: &Shared) -> Time {
        sh.now + sh.config.handshake_window.saturating_mul(2)
    }

    // ---- key events ----

    pub(crate) fn event_pending(&mut self, sh: &mut Shared) -> bool {
        if self.current_event == KeyEvent::None && sh.now >= self.next_event_time {
            self.process_next_event(sh);
        }
        self.current_event != KeyEvent::None
    }

    pub(crate) fn get_event(&self) -> KeyEvent {
        self.current_event
    }

    pub(crate) fn reset_event(&mut self) {
        self.current_event = KeyEvent::None;
    }

    pub(crate) fn become_primary_time(&self) -> Option<Time> {
        (self.next_event == KeyEvent::BecomePrimary).then_some(self.next_event_time)
    }

    /// Schedule expiration, usually when this context is retired to
    /// the secondary slot.
    pub(crate) fn prepare_expire(&mut self, sh: &Shared) {
        self.prepare_expire_as(sh, KeyEvent::None);
    }

    fn prepare_expire_as(&mut self, sh: &Shared, current: KeyEvent) {
        let at = if self.key_limit_renegotiation_fired {
            self.data_limit_expire(sh)
        } else {
            self.construct_time + sh.config.expire
        };
        self.set_event_both(current, KeyEvent::Expire, at);
    }

    pub(crate) fn set_next_event_if_unspecified(&mut self, sh: &Shared) {
        if self.next_event == KeyEvent::None && !self.invalidated {
            self.prepare_expire(sh);
        }
    }

    fn process_next_event(&mut self, sh: &mut Shared) {
        if sh.now < self.next_event_time {
            return;
        }
        match self.next_event {
            KeyEvent::BecomePrimary => {
                if self.data_limit_defer(sh) {
                    let at = self.data_limit_expire(sh);
                    self.set_event_both(KeyEvent::None, KeyEvent::PrimaryPending, at);
                } else {
                    let at = self.construct_time + sh.config.renegotiate;
                    self.set_event_both(KeyEvent::BecomePrimary, KeyEvent::Renegotiate, at);
                }
            }
            KeyEvent::Renegotiate | KeyEvent::RenegotiateForce => {
                let ev = self.next_event;
                self.prepare_expire_as(sh, ev);
            }
            KeyEvent::Negotiate => self.kev_error(sh, KeyEvent::Negotiate, ErrorCode::KevNegotiate),
            KeyEvent::PrimaryPending => {
                self.kev_error(sh, KeyEvent::PrimaryPending, ErrorCode::KevPendingTimeout)
            }
            KeyEvent::Expire => self.kev_error(sh, KeyEvent::Expire, ErrorCode::KevExpire),
            _ => {}
        }
    }

    fn kev_error(&mut self, sh: &mut Shared, event: KeyEvent, reason: ErrorCode) {
        sh.stats.error(reason);
        self.invalidate(reason);
        self.set_event_current(event);
    }

    fn active_event(&mut self, sh: &Shared) {
        let at = self.reached_active_time + sh.config.become_primary;
        self.set_event_both(KeyEvent::Active, KeyEvent::BecomePrimary, at);
    }

    fn set_event_current(&mut self, current: KeyEvent) {
        trace!(key_id = self.key_id, ?current, "key event");
        self.current_event = current;
    }

    fn set_event_next(&mut self, next: KeyEvent, at: Time) {
        self.next_event = next;
        self.next_event_time = at;
    }

    fn set_event_both(&mut self, current: KeyEvent, next: KeyEvent, at: Time) {
        trace!(key_id = self.key_id, ?current, ?next, %at, "key event");
        self.current_event = current;
        self.next_event = next;
        self.next_event_time = at;
    }

    // ---- handshake state machine ----

    fn set_state(&mut self, state: KeyState) {
        trace!(key_id = self.key_id, from = ?self.state, to = ?state, "state");
        self.state = state;
    }

    fn initial_op(&self, sender: bool, is_server: bool) -> u8 {
        if self.key_id != 0 {
            CONTROL_SOFT_RESET_V1
        } else if is_server == sender {
            CONTROL_HARD_RESET_SERVER_V2
        } else {
            CONTROL_HARD_RESET_CLIENT_V2
        }
    }

    fn send_reset(&mut self, sh: &Shared) {
        let opcode = self.initial_op(true, sh.is_server());
        self.raw_write_queue.push_back(Packet::new(opcode, Vec::new()));
    }

    fn raw_recv(&mut self, sh: &mut Shared, pkt: Packet) {
        if pkt.buf.is_empty() && pkt.opcode == self.initial_op(false, sh.is_server()) {
            match self.state {
                KeyState::CWaitReset => {
                    self.send_reset(sh);
                    self.set_state(KeyState::CWaitResetAck);
                }
                KeyState::SWaitReset => {
                    self.send_reset(sh);
                    self.set_state(KeyState::SWaitResetAck);
                }
                _ => {}
            }
        }
    }

    fn start_handshake(&mut self) -> ProtoResult<()> {
        self.ssl.start_handshake()?;
        self.ssl_started = true;
        Ok(())
    }

    /// Advance out of an ACK-wait state once every outbound message
    /// has been acknowledged.
    fn post_ack_action(&mut self, sh: &mut Shared, host: &mut dyn ProtoHost) -> ProtoResult<()> {
        if !self.state.is_ack_state() || self.rel_send.n_unacked() != 0 {
            return Ok(());
        }
        match self.state {
            KeyState::CWaitResetAck => {
                self.start_handshake()?;
                self.send_auth(sh, host)?;
                self.set_state(KeyState::CWaitAuth);
            }
            KeyState::SWaitResetAck => {
                self.start_handshake()?;
                self.set_state(KeyState::SWaitAuth);
            }
            KeyState::CWaitAuthAck | KeyState::SWaitAuthAck => {
                self.on_active(sh)?;
                self.set_state(KeyState::Active);
            }
            _ => {}
        }
        Ok(())
    }

    fn send_auth(&mut self, sh: &mut Shared, host: &mut dyn ProtoHost) -> ProtoResult<()> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&AUTH_PREFIX);
        self.tlsprf.self_randomize(sh.rng.as_mut());
        self.tlsprf.self_write(&mut buf)?;
        let options = sh.config.options_string();
        write_auth_string(&options, &mut buf)?;
        if !sh.is_server() {
            debug!(%options, "tunnel options");
            if sh.config.xmit_creds {
                host.client_auth(&mut buf);
            } else {
                write_empty_auth_string(&mut buf);
                write_empty_auth_string(&mut buf);
            }
            let peer_info = sh.config.peer_info_string();
            write_auth_string(&peer_info, &mut buf)?;
        }
        self.app_send_validate(buf)?;
        self.dirty = true;
        Ok(())
    }

    fn recv_auth(&mut self, sh: &mut Shared, host: &mut dyn ProtoHost) -> ProtoResult<()> {
        let consumed;
        {
            let mut r = Reader::new(&self.app_recv_buf);
            check_auth_prefix(&mut r)?;
            self.tlsprf.peer_read(&mut r)?;
            let _peer_options = read_auth_string(&mut r)?;
            if sh.is_server() {
                let username = read_auth_string(&mut r)?;
                let password = read_auth_string(&mut r)?;
                let peer_info = read_auth_string(&mut r)?;
                host.server_auth(&username, &password, &peer_info);
            }
            consumed = r.position();
        }
        self.app_recv_buf.drain(..consumed);
        Ok(())
    }

    fn auth_complete(&self, sh: &Shared) -> bool {
        auth_record_complete(
            &self.app_recv_buf,
            sh.is_server(),
            self.tlsprf.peer_input_size(),
        )
    }

    /// Handshake done, every ACK in: derive data-channel keys and
    /// release queued writes.
    fn on_active(&mut self, sh: &mut Shared) -> ProtoResult<()> {
        debug!(key_id = self.key_id, "handshake complete, going active");
        self.generate_session_keys(sh)?;
        while let Some(buf) = self.app_pre_write_queue.pop_front() {
            self.app_send_validate(buf)?;
            self.dirty = true;
        }
        self.reached_active_time = sh.now;
        sh.slowest_handshake = sh
            .slowest_handshake
            .max(self.reached_active_time - self.construct_time);
        self.active_event(sh);
        Ok(())
    }

    fn generate_session_keys(&mut self, sh: &mut Shared) -> ProtoResult<()> {
        let psid_peer = sh.psid_peer.ok_or(ProtoError::PeerPsidUndefined)?;
        let key = self
            .tlsprf
            .generate_key_expansion(sh.psid_self.as_bytes(), psid_peer.as_bytes())?;
        self.tlsprf.erase();
        let rekey_type = self.data_channel_key.take().and_then(|d| d.rekey_type);
        self.data_channel_key = Some(DataChannelKey { key, rekey_type });
        if !sh.dc_deferred {
            self.init_data_channel(sh)?;
        }
        Ok(())
    }

    // ---- control-channel framing ----

    /// Assemble the control-packet head and trailer around `payload`:
    /// `op | psid_self | [hmac | pid] | acks | [psid_peer] |
    /// [msg_id] | payload`.
    fn frame_control(
        &mut self,
        sh: &mut Shared,
        opcode: u8,
        msg_id: Option<MsgId>,
        payload: &[u8],
    ) -> ProtoResult<Vec<u8>> {
        let mut out = Vec::with_capacity(1 + PSID_SIZE + sh.hmac_size + 16 + payload.len());
        out.push(op_compose(opcode, self.key_id));
        sh.psid_self.write(&mut out);
        if sh.use_tls_auth {
            out.resize(out.len() + sh.hmac_size, 0);
            sh.ta_pid_send
                .write_next(&mut out, sh.now.seconds_since_epoch());
        }

        // ACKs, and the peer's own session ID when ACKing
        let had_acks = !self.xmit_acks.is_empty();
        self.xmit_acks.write(&mut out, self.max_ack_list);
        if had_acks {
            match sh.psid_peer {
                Some(psid) => psid.write(&mut out),
                None => {
                    sh.stats.error(ErrorCode::CcError);
                    return Err(ProtoError::PeerPsidUndefined);
                }
            }
        }

        if let Some(id) = msg_id {
            out.extend_from_slice(&id.to_be_bytes());
        }
        out.extend_from_slice(payload);

        if sh.use_tls_auth {
            if let Some(hmac) = &sh.ta_hmac_send {
                hmac.sign(&mut out, 1 + PSID_SIZE, PidForm::Long.size())?;
            }
        }
        Ok(out)
    }

    fn encapsulate(&mut self, sh: &mut Shared, id: MsgId, pkt: &mut Packet) -> ProtoResult<()> {
        pkt.buf = self.frame_control(sh, pkt.opcode, Some(id), &std::mem::take(&mut pkt.buf))?;
        Ok(())
    }

    fn generate_ack(&mut self, sh: &mut Shared, pkt: &mut Packet) -> ProtoResult<()> {
        pkt.buf = self.frame_control(sh, ACK_V1, None, &[])?;
        Ok(())
    }

    fn verify_src_psid(&mut self, sh: &mut Shared, src_psid: ProtoSessionId) -> bool {
        match sh.psid_peer {
            Some(psid) if psid == src_psid => true,
            Some(_) => {
                sh.stats.error(ErrorCode::CcError);
                if sh.is_tcp() {
                    self.invalidate(ErrorCode::CcError);
                }
                false
            }
            None => {
                sh.psid_peer = Some(src_psid);
                true
            }
        }
    }

    fn verify_dest_psid(&mut self, sh: &mut Shared, r: &mut Reader<'_>) -> ProtoResult<bool> {
        let dest_psid = ProtoSessionId::read(r)?;
        if dest_psid != sh.psid_self {
            sh.stats.error(ErrorCode::CcError);
            if sh.is_tcp() {
                self.invalidate(ErrorCode::CcError);
            }
            return Ok(false);
        }
        Ok(true)
    }

    fn decapsulate(&mut self, sh: &mut Shared, pkt: Packet) -> ProtoResult<bool> {
        match self.decapsulate_inner(sh, pkt) {
            Ok(accepted) => Ok(accepted),
            Err(ProtoError::Buffer(_)) => {
                sh.stats.error(ErrorCode::BufferError);
                if sh.is_tcp() {
                    self.invalidate(ErrorCode::BufferError);
                }
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn decapsulate_inner(&mut self, sh: &mut Shared, pkt: Packet) -> ProtoResult<bool> {
        let Packet { opcode, buf } = pkt;

        if sh.use_tls_auth {
            // HMAC must pass before the packet touches any state
            let hmac_ok = sh
                .ta_hmac_recv
                .as_ref()
                .is_some_and(|h| h.verify(&buf, 1 + PSID_SIZE, PidForm::Long.size()));
            if !hmac_ok {
                sh.stats.error(ErrorCode::HmacError);
                if sh.is_tcp() {
                    self.invalidate(ErrorCode::HmacError);
                }
                return Ok(false);
            }

            sh.update_last_received();

            let mut r = Reader::new(&buf);
            r.skip(1)?;
            let src_psid = ProtoSessionId::read(&mut r)?;
            r.skip(sh.hmac_size)?;
            let pid = PacketId::read(&mut r, PidForm::Long)?;

            if !self.verify_src_psid(sh, src_psid) {
                return Ok(false);
            }

            // probe only; committed when the packet is accepted
            let pid_ok = sh.ta_pid_recv.test_add(pid, false);

            let acks = AckList::read(&mut r)?;
            if pid_ok {
                for id in &acks {
                    self.rel_send.ack(*id);
                }
            }
            if !acks.is_empty() && !self.verify_dest_psid(sh, &mut r)? {
                return Ok(false);
            }

            if opcode != ACK_V1 {
                let id = r.u32()?;
                if pid_ok {
                    let payload = r.rest().to_vec();
                    let rflags = self.rel_recv.receive(Packet::new(opcode, payload), id);
                    if rflags & ACK_TO_SENDER != 0 {
                        self.xmit_acks.push(id);
                    }
                    if rflags & IN_WINDOW != 0 {
                        sh.ta_pid_recv.test_add(pid, true);
                        return Ok(true);
                    }
                } else {
                    sh.stats.error(ErrorCode::ReplayError);
                    // even a replayed packet must be ACKed or the
                    // protocol could deadlock
                    if pid.is_valid() {
                        self.xmit_acks.push(id);
                    }
                }
            } else if pid_ok {
                sh.ta_pid_recv.test_add(pid, true);
            } else {
                sh.stats.error(ErrorCode::ReplayError);
            }
            Ok(false)
        } else {
            sh.update_last_received();

            let mut r = Reader::new(&buf);
            r.skip(1)?;
            let src_psid = ProtoSessionId::read(&mut r)?;
            if !self.verify_src_psid(sh, src_psid) {
                return Ok(false);
            }

            let acks = AckList::read(&mut r)?;
            for id in &acks {
                self.rel_send.ack(*id);
            }
            if !acks.is_empty() && !self.verify_dest_psid(sh, &mut r)? {
                return Ok(false);
            }

            if opcode != ACK_V1 {
                let id = r.u32()?;
                let payload = r.rest().to_vec();
                let rflags = self.rel_recv.receive(Packet::new(opcode, payload), id);
                if rflags & ACK_TO_SENDER != 0 {
                    self.xmit_acks.push(id);
                }
                if rflags & IN_WINDOW != 0 {
                    return Ok(true);
                }
            }
            Ok(false)
        }
    }

    /// Standalone integrity pre-check, used before committing to a
    /// peer-requested renegotiation.
    pub(crate) fn validate(net_buf: &[u8], sh: &mut Shared) -> bool {
        Self::validate_inner(net_buf, sh).unwrap_or(false)
    }

    fn validate_inner(net_buf: &[u8], sh: &mut Shared) -> Option<bool> {
        let mut r = Reader::new(net_buf);
        r.skip(1).ok()?;
        let src_psid = ProtoSessionId::read(&mut r).ok()?;

        if sh.use_tls_auth {
            let hmac_ok = sh
                .ta_hmac_recv
                .as_ref()
                .is_some_and(|h| h.verify(net_buf, 1 + PSID_SIZE, PidForm::Long.size()));
            if !hmac_ok {
                return Some(false);
            }
            if sh.psid_peer != Some(src_psid) {
                return Some(false);
            }
            r.skip(sh.hmac_size).ok()?;
            let pid = PacketId::read(&mut r, PidForm::Long).ok()?;
            let pid_ok = sh.ta_pid_recv.test_add(pid, false);

            if AckList::skip(&mut r).ok()? {
                let dest_psid = ProtoSessionId::read(&mut r).ok()?;
                if dest_psid != sh.psid_self {
                    return Some(false);
                }
            }
            Some(pid_ok)
        } else {
            if sh.psid_peer != Some(src_psid) {
                return Some(false);
            }
            if AckList::skip(&mut r).ok()? {
                let dest_psid = ProtoSessionId::read(&mut r).ok()?;
                if dest_psid != sh.psid_self {
                    return Some(false);
                }
            }
            Some(true)
        }
    }

    // ---- stack plumbing ----

    fn up_sequenced(&mut self, sh: &mut Shared, host: &mut dyn ProtoHost) -> ProtoResult<()> {
        loop {
            let Some(front) = self.rel_recv.peek_ready() else {
                break;
            };
            if !front.is_raw() && !self.ssl_started {
                break;
            }
            let Some(pkt) = self.rel_recv.next_sequenced() else {
                break;
            };
            if pkt.is_raw() {
                self.raw_recv(sh, pkt);
            } else {
                self.ssl.write_ciphertext(&pkt.buf)?;
            }
        }
        self.drain_cleartext(sh, host)
    }

    fn drain_cleartext(&mut self, sh: &mut Shared, host: &mut dyn ProtoHost) -> ProtoResult<()> {
        if !self.ssl_started {
            return Ok(());
        }
        while let Some(chunk) = self.ssl.read_cleartext() {
            self.app_recv_buf.extend_from_slice(&chunk);
        }
        if self.app_recv_buf.len() > APP_MSG_MAX {
            return Err(ProtoError::AppMsgTooLarge);
        }
        loop {
            match self.state {
                KeyState::CWaitAuth => {
                    if !self.auth_complete(sh) {
                        break;
                    }
                    self.recv_auth(sh, host)?;
                    self.set_state(KeyState::CWaitAuthAck);
                }
                KeyState::SWaitAuth => {
                    if !self.auth_complete(sh) {
                        break;
                    }
                    self.recv_auth(sh, host)?;
                    self.send_auth(sh, host)?;
                    self.set_state(KeyState::SWaitAuthAck);
                }
                // rare case: the peer went active but our final ACK
                // was dropped, so app messages arrive early
                KeyState::SWaitAuthAck | KeyState::Active => {
                    let Some(pos) = self.app_recv_buf.iter().position(|&b| b == 0) else {
                        break;
                    };
                    let msg: Vec<u8> = self.app_recv_buf.drain(..=pos).take(pos).collect();
                    host.control_recv(msg);
                }
                _ => break,
            }
        }
        Ok(())
    }

    fn down_stack_raw(&mut self, sh: &mut Shared, host: &mut dyn ProtoHost) -> ProtoResult<()> {
        while !self.raw_write_queue.is_empty() && self.rel_send.ready() {
            let Some(mut pkt) = self.raw_write_queue.pop_front() else {
                break;
            };
            let id = self.rel_send.peek_next_id();
            self.encapsulate(sh, id, &mut pkt)?;
            host.control_net_send(&pkt.buf);
            self.rel_send.send(pkt, sh.now);
        }
        Ok(())
    }

    fn down_stack_app(&mut self, sh: &mut Shared, host: &mut dyn ProtoHost) -> ProtoResult<()> {
        if !self.ssl_started {
            return Ok(());
        }
        // push queued cleartext into the TLS stream
        loop {
            let outcome = match self.app_write_queue.front() {
                Some(buf) => self.ssl.write_cleartext(buf)?,
                None => break,
            };
            match outcome {
                AppWrite::Consumed => {
                    self.app_write_queue.pop_front();
                }
                AppWrite::Retry => break,
            }
        }
        // frame TLS ciphertext into CONTROL_V1 packets
        while self.rel_send.ready() {
            let Some(ciphertext) = self.ssl.read_ciphertext() else {
                break;
            };
            let mut pkt = Packet::new(CONTROL_V1, ciphertext);
            let id = self.rel_send.peek_next_id();
            self.encapsulate(sh, id, &mut pkt)?;
            host.control_net_send(&pkt.buf);
            self.rel_send.send(pkt, sh.now);
        }
        Ok(())
    }

    fn send_pending_acks(&mut self, sh: &mut Shared, host: &mut dyn ProtoHost) -> ProtoResult<()> {
        while !self.xmit_acks.is_empty() {
            let mut pkt = Packet::new(ACK_V1, Vec::new());
            self.generate_ack(sh, &mut pkt)?;
            host.control_net_send(&pkt.buf);
        }
        Ok(())
    }
}

impl std::fmt::Debug for KeyContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyContext")
            .field("key_id", &self.key_id)
            .field("state", &self.state)
            .field("current_event", &self.current_event)
            .field("next_event", &self.next_event)
            .field("invalidated", &self.invalidated)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ack_states() {
        assert!(KeyState::CWaitResetAck.is_ack_state());
        assert!(KeyState::SWaitAuthAck.is_ack_state());
        assert!(!KeyState::CWaitAuth.is_ack_state());
        assert!(!KeyState::Active.is_ack_state());
    }
}
