//! End-to-end session scenarios: a client and a server ProtoContext
//! joined by an in-memory link, driven on a virtual clock.

use std::collections::VecDeque;

use rand::rngs::StdRng;
use rand::SeedableRng;

use ovpn_core::constants::{op_compose, CONTROL_HARD_RESET_CLIENT_V2};
use ovpn_core::options::OptionList;
use ovpn_core::stats::ErrorCode;
use ovpn_core::time::{Duration, Time};
use ovpn_crypto::OpenVpnStaticKey;
use ovpn_proto::key_method::write_auth_string;
use ovpn_proto::testing::LoopbackTlsFactory;
use ovpn_proto::{
    Config, DecryptStatus, ProtoContext, ProtoHost, Role, TlsAuthPreValidate,
};

#[derive(Default)]
struct TestHost {
    outbound: VecDeque<Vec<u8>>,
    messages: Vec<Vec<u8>>,
    auths: Vec<(String, String, String)>,
    active_count: u32,
}

impl ProtoHost for TestHost {
    fn control_net_send(&mut self, packet: &[u8]) {
        self.outbound.push_back(packet.to_vec());
    }

    fn control_recv(&mut self, msg: Vec<u8>) {
        self.messages.push(msg);
    }

    fn client_auth(&mut self, buf: &mut Vec<u8>) {
        write_auth_string("alice", buf).unwrap();
        write_auth_string("wonderland", buf).unwrap();
    }

    fn server_auth(&mut self, username: &str, password: &str, peer_info: &str) {
        self.auths
            .push((username.into(), password.into(), peer_info.into()));
    }

    fn active(&mut self) {
        self.active_count += 1;
    }
}

struct Endpoint {
    proto: ProtoContext,
    host: TestHost,
    data_recv: Vec<Vec<u8>>,
    exit_notified: bool,
}

impl Endpoint {
    fn new(config_text: &str, role: Role, seed: u64, now: Time) -> Self {
        let opt = OptionList::parse(config_text).unwrap();
        let config = Config::load(&opt, role).unwrap();
        let mut proto = ProtoContext::new(
            config,
            Box::new(LoopbackTlsFactory),
            Box::new(StdRng::seed_from_u64(seed)),
        );
        proto.update_now(now);
        proto.reset().unwrap();
        Self {
            proto,
            host: TestHost::default(),
            data_recv: Vec::new(),
            exit_notified: false,
        }
    }

    fn deliver(&mut self, packet: Vec<u8>) {
        let pt = self.proto.packet_type(&packet);
        if pt.is_control() {
            let _ = self.proto.control_net_recv(&pt, packet, &mut self.host);
            self.proto.flush(true, &mut self.host).unwrap();
        } else if pt.is_data() {
            let mut buf = packet;
            match self.proto.data_decrypt(&pt, &mut buf) {
                Ok(DecryptStatus::Data) => self.data_recv.push(buf),
                Ok(DecryptStatus::ExitNotify) => self.exit_notified = true,
                _ => {}
            }
            self.proto.flush(false, &mut self.host).unwrap();
        }
    }

    fn set_now(&mut self, now: Time) {
        self.proto.update_now(now);
    }

    fn housekeep(&mut self) {
        self.proto.housekeeping(&mut self.host).unwrap();
    }
}

/// Exchange queued packets until both directions run dry.
fn pump(a: &mut Endpoint, b: &mut Endpoint) {
    loop {
        let mut moved = false;
        while let Some(pkt) = a.host.outbound.pop_front() {
            b.deliver(pkt);
            moved = true;
        }
        while let Some(pkt) = b.host.outbound.pop_front() {
            a.deliver(pkt);
            moved = true;
        }
        if !moved {
            break;
        }
    }
}

/// Step the clock one second at a time, running housekeeping and
/// exchanging packets at each step.
fn advance_to(client: &mut Endpoint, server: &mut Endpoint, to: Time) {
    let mut now = client.proto.now();
    while now < to {
        now = now + Duration::from_secs(1);
        client.set_now(now);
        server.set_now(now);
        client.housekeep();
        server.housekeep();
        pump(client, server);
    }
}

fn handshake(client: &mut Endpoint, server: &mut Endpoint) {
    client.proto.start().unwrap();
    client.proto.flush(true, &mut client.host).unwrap();
    server.proto.start().unwrap();
    pump(client, server);
    assert!(client.proto.data_channel_ready(), "client not active");
    assert!(server.proto.data_channel_ready(), "server not active");
}

const BASE_CONFIG: &str = "dev tun\ncipher AES-128-GCM\nauth SHA1\n";

fn start_time() -> Time {
    Time::from_secs(100)
}

fn pair(config_text: &str) -> (Endpoint, Endpoint) {
    let client = Endpoint::new(config_text, Role::Client, 1, start_time());
    let server = Endpoint::new(config_text, Role::Server, 2, start_time());
    (client, server)
}

fn tls_auth_config() -> String {
    let mut rng = StdRng::seed_from_u64(99);
    let key = OpenVpnStaticKey::random(&mut rng);
    format!("{BASE_CONFIG}<tls-auth>\n{}</tls-auth>\n", key.render())
}

#[test]
fn client_hard_reset_first_packet_bytes() {
    let mut client = Endpoint::new(BASE_CONFIG, Role::Client, 1, start_time());
    client.proto.start().unwrap();
    client.proto.flush(true, &mut client.host).unwrap();

    let pkt = client.host.outbound.pop_front().expect("no reset emitted");
    assert!(client.host.outbound.is_empty());

    // op byte | psid_self | ack count 0 | msg id 0
    assert_eq!(pkt.len(), 1 + 8 + 1 + 4);
    assert_eq!(pkt[0], op_compose(CONTROL_HARD_RESET_CLIENT_V2, 0));
    assert_eq!(pkt[0], 0x38);
    assert_eq!(&pkt[1..9], client.proto.psid_self().as_bytes());
    assert_eq!(pkt[9], 0x00);
    assert_eq!(&pkt[10..14], &[0, 0, 0, 0]);
}

#[test]
fn full_handshake_and_data_exchange() {
    let (mut client, mut server) = pair(BASE_CONFIG);
    handshake(&mut client, &mut server);

    assert_eq!(client.host.active_count, 1);
    assert_eq!(server.host.active_count, 1);
    assert_eq!(client.proto.primary_key_id(), Some(0));
    assert_eq!(server.proto.primary_key_id(), Some(0));

    // the client transmitted its credentials and peer info
    let (username, password, peer_info) = &server.host.auths[0];
    assert_eq!(username, "alice");
    assert_eq!(password, "wonderland");
    assert!(peer_info.contains("IV_PROTO=2\n"));
    assert!(peer_info.contains("IV_NCP=2\n"));

    // each side learned the other's session ID
    assert_eq!(
        client.proto.psid_peer().unwrap(),
        server.proto.psid_self()
    );
    assert_eq!(
        server.proto.psid_peer().unwrap(),
        client.proto.psid_self()
    );

    // data both ways
    let mut buf = b"ping from client".to_vec();
    client.proto.data_encrypt(&mut buf).unwrap();
    assert_ne!(buf, b"ping from client");
    server.deliver(buf);
    assert_eq!(server.data_recv, vec![b"ping from client".to_vec()]);

    let mut buf = b"pong from server".to_vec();
    server.proto.data_encrypt(&mut buf).unwrap();
    client.deliver(buf);
    assert_eq!(client.data_recv, vec![b"pong from server".to_vec()]);

    // control messages flow once active
    client.proto.control_send(b"PUSH_REQUEST").unwrap();
    client.proto.flush(true, &mut client.host).unwrap();
    pump(&mut client, &mut server);
    assert_eq!(server.host.messages, vec![b"PUSH_REQUEST".to_vec()]);
}

#[test]
fn tls_auth_handshake_and_replay_rejection() {
    let config = tls_auth_config();
    let (mut client, mut server) = pair(&config);
    handshake(&mut client, &mut server);

    // capture a control packet and deliver it twice
    client.proto.control_send(b"PUSH_REQUEST").unwrap();
    client.proto.flush(true, &mut client.host).unwrap();
    let packets: Vec<Vec<u8>> = client.host.outbound.drain(..).collect();

    for pkt in &packets {
        server.deliver(pkt.clone());
    }
    assert_eq!(server.host.messages, vec![b"PUSH_REQUEST".to_vec()]);
    let replays_before = server.proto.stats().get(ErrorCode::ReplayError);

    for pkt in &packets {
        server.deliver(pkt.clone());
    }
    // exactly one delivery upward, replays counted
    assert_eq!(server.host.messages, vec![b"PUSH_REQUEST".to_vec()]);
    assert!(server.proto.stats().get(ErrorCode::ReplayError) > replays_before);

    // the session is still healthy after the replay
    pump(&mut client, &mut server);
    let mut buf = b"still alive".to_vec();
    client.proto.data_encrypt(&mut buf).unwrap();
    server.deliver(buf);
    assert_eq!(server.data_recv.last().unwrap(), b"still alive");
}

#[test]
fn tls_auth_garbage_rejected_without_state_change() {
    let config = tls_auth_config();
    let (mut client, mut server) = pair(&config);

    client.proto.start().unwrap();
    client.proto.flush(true, &mut client.host).unwrap();
    let mut reset = client.host.outbound.pop_front().unwrap();

    // corrupt one payload byte; the HMAC must catch it
    let last = reset.len() - 1;
    reset[last] ^= 0xff;
    server.deliver(reset);

    assert_eq!(server.proto.stats().get(ErrorCode::HmacError), 1);
    assert!(server.proto.psid_peer().is_none(), "state mutated by bad HMAC");
    assert!(server.host.outbound.is_empty());
}

#[test]
fn renegotiation_promotes_secondary() {
    // become-primary pinned so both roles promote on the same tick
    let config =
        "dev tun\ncipher AES-128-GCM\nauth SHA1\nreneg-sec 60\ntran-window 30\nbecome-primary 20\n";
    let mut client = Endpoint::new(config, Role::Client, 1, start_time());
    let mut server = Endpoint::new(config, Role::Server, 2, start_time());
    handshake(&mut client, &mut server);

    // client deadline is reneg-sec; the server adds hand-window so
    // the client initiates
    advance_to(&mut client, &mut server, start_time() + Duration::from_secs(65));
    assert_eq!(client.proto.secondary_key_id(), Some(1), "no renegotiation");
    assert_eq!(server.proto.secondary_key_id(), Some(1));
    assert_eq!(client.proto.primary_key_id(), Some(0));
    assert_eq!(client.proto.negotiations(), 2);

    // promotion at reached-active + become-primary; the retired key
    // then expires at construction + reneg-sec + tran-window
    advance_to(&mut client, &mut server, start_time() + Duration::from_secs(100));
    assert_eq!(client.proto.primary_key_id(), Some(1), "no promotion");
    assert_eq!(server.proto.primary_key_id(), Some(1));
    assert_eq!(client.proto.secondary_key_id(), None, "old key not expired");
    assert!(client.proto.stats().get(ErrorCode::KevExpire) >= 1);
    assert!(!client.proto.invalidated());

    // no data loss across the swap
    let mut buf = b"after rekey".to_vec();
    client.proto.data_encrypt(&mut buf).unwrap();
    server.deliver(buf);
    assert_eq!(server.data_recv.last().unwrap(), b"after rekey");
}

#[test]
fn peer_soft_reset_creates_secondary() {
    let (mut client, mut server) = pair(BASE_CONFIG);
    handshake(&mut client, &mut server);

    client.proto.renegotiate().unwrap();
    client.proto.flush(true, &mut client.host).unwrap();
    assert_eq!(client.proto.secondary_key_id(), Some(1));

    // the soft reset alone makes the server spin up key id 1
    let soft_reset = client.host.outbound.pop_front().unwrap();
    server.deliver(soft_reset);
    assert_eq!(server.proto.secondary_key_id(), Some(1));
    assert_eq!(server.proto.negotiations(), 2);

    // and the renegotiated key completes its handshake
    pump(&mut client, &mut server);
    let target_time = client.proto.now() + Duration::from_secs(2);
    advance_to(&mut client, &mut server, target_time);
    let mut buf = b"data on old key".to_vec();
    client.proto.data_encrypt(&mut buf).unwrap();
    server.deliver(buf);
    assert_eq!(server.data_recv.last().unwrap(), b"data on old key");
}

#[test]
fn keepalive_timeout_disconnects() {
    let config = "dev tun\ncipher AES-128-GCM\nauth SHA1\nkeepalive 8 40\n";
    let mut client = Endpoint::new(config, Role::Client, 1, start_time());
    let mut server = Endpoint::new(config, Role::Server, 2, start_time());
    handshake(&mut client, &mut server);

    // total silence: tick the clock but drop every packet, stopping
    // (as a real host would) once the session dies
    let mut now = client.proto.now();
    for _ in 0..45 {
        now = now + Duration::from_secs(1);
        client.set_now(now);
        client.housekeep();
        client.host.outbound.clear();
        if client.proto.invalidated() {
            break;
        }
    }

    assert!(client.proto.invalidated());
    assert!(client.proto.now() >= start_time() + Duration::from_secs(40));
    assert_eq!(
        client.proto.invalidation_reason(),
        Some(ErrorCode::KeepaliveTimeout)
    );
    assert_eq!(client.proto.stats().get(ErrorCode::KeepaliveTimeout), 1);
}

#[test]
fn keepalive_magic_is_discarded() {
    let config = "dev tun\ncipher AES-128-GCM\nauth SHA1\nkeepalive 8 40\n";
    let mut client = Endpoint::new(config, Role::Client, 1, start_time());
    let mut server = Endpoint::new(config, Role::Server, 2, start_time());
    handshake(&mut client, &mut server);

    // after 8+ quiet seconds the client emits a keepalive
    advance_to(&mut client, &mut server, start_time() + Duration::from_secs(10));
    assert!(server.data_recv.is_empty(), "keepalive leaked to the app");
    // and the server's expiry timer moved out past the ping
    assert!(!server.proto.invalidated());
}

#[test]
fn explicit_exit_notify_surfaces() {
    let (mut client, mut server) = pair(BASE_CONFIG);
    handshake(&mut client, &mut server);

    client
        .proto
        .send_explicit_exit_notify(&mut client.host)
        .unwrap();
    let pkt = client.host.outbound.pop_front().unwrap();
    server.deliver(pkt);
    assert!(server.exit_notified);
    assert!(server.data_recv.is_empty());
}

#[test]
fn bs64_data_limit_forces_renegotiation() {
    // long ping intervals so no keepalive traffic tickles the new
    // key before the test does
    let config = "dev tun\ncipher BF-CBC\nauth SHA1\nping 120\nping-restart 600\n";
    let mut client = Endpoint::new(config, Role::Client, 1, start_time());
    let mut server = Endpoint::new(config, Role::Server, 2, start_time());
    handshake(&mut client, &mut server);

    // get past the primary's become-primary transition (5s for
    // 64-bit-block ciphers)
    advance_to(&mut client, &mut server, start_time() + Duration::from_secs(10));

    // push OPENVPN_BS64_DATA_LIMIT bytes through encrypt
    let mut sent = 0u64;
    while sent <= ovpn_core::constants::BS64_DATA_LIMIT {
        let mut buf = vec![0xa5u8; 1_000_000];
        client.proto.data_encrypt(&mut buf).unwrap();
        assert!(!buf.is_empty());
        sent += 1_000_000;
        // bulk traffic dropped on the floor, as UDP is allowed to
    }
    assert_eq!(client.proto.stats().get(ErrorCode::KeyLimitReneg), 1);

    // the scheduled renegotiation fires about a second later
    let t0 = client.proto.now();
    advance_to(&mut client, &mut server, t0 + Duration::from_secs(3));
    assert_eq!(client.proto.secondary_key_id(), Some(1));
    assert_eq!(server.proto.secondary_key_id(), Some(1));

    // client side defers promotion until the peer proves it can
    // talk on the new key; the server promotes on its own
    advance_to(&mut client, &mut server, t0 + Duration::from_secs(10));
    assert_eq!(server.proto.primary_key_id(), Some(1));
    assert_eq!(client.proto.primary_key_id(), Some(0));

    // first decrypted packet on the new key unblocks the client
    let mut buf = b"green light".to_vec();
    server.proto.data_encrypt(&mut buf).unwrap();
    client.deliver(buf);
    assert_eq!(client.data_recv.last().unwrap(), b"green light");
    let t1 = client.proto.now();
    advance_to(&mut client, &mut server, t1 + Duration::from_secs(3));
    assert_eq!(client.proto.primary_key_id(), Some(1));
}

#[test]
fn handshake_timeout_is_fatal_on_primary() {
    let config = "dev tun\ncipher AES-128-GCM\nauth SHA1\nhand-window 30\n";
    let mut client = Endpoint::new(config, Role::Client, 1, start_time());
    client.proto.start().unwrap();
    client.proto.flush(true, &mut client.host).unwrap();

    // the server never answers
    let mut now = start_time();
    for _ in 0..35 {
        now = now + Duration::from_secs(1);
        client.set_now(now);
        client.housekeep();
        client.host.outbound.clear();
    }

    assert!(client.proto.invalidated());
    assert_eq!(client.proto.stats().get(ErrorCode::HandshakeTimeout), 1);
}

#[test]
fn tls_auth_prevalidate_gates_initial_packets() {
    let config = tls_auth_config();
    let mut client = Endpoint::new(&config, Role::Client, 1, start_time());
    client.proto.start().unwrap();
    client.proto.flush(true, &mut client.host).unwrap();
    let reset = client.host.outbound.pop_front().unwrap();

    let opt = OptionList::parse(&config).unwrap();
    let server_config = Config::load(&opt, Role::Server).unwrap();
    let prevalidate = TlsAuthPreValidate::new(&server_config, true).unwrap();
    assert!(prevalidate.validate(&reset));

    // tampered copy fails the HMAC
    let mut bad = reset.clone();
    bad[10] ^= 0x01;
    assert!(!prevalidate.validate(&bad));

    // non-reset opcodes are not accepted as first packets
    let mut wrong_op = reset;
    wrong_op[0] = op_compose(ovpn_core::constants::CONTROL_V1, 0);
    assert!(!prevalidate.validate(&wrong_op));
}

#[test]
fn retransmission_recovers_from_loss() {
    let (mut client, mut server) = pair(BASE_CONFIG);
    client.proto.start().unwrap();
    client.proto.flush(true, &mut client.host).unwrap();

    // lose the first reset entirely
    client.host.outbound.clear();

    // tls-timeout (1s) later the reliability layer resends it
    advance_to(&mut client, &mut server, start_time() + Duration::from_secs(3));
    assert!(client.proto.data_channel_ready(), "client never recovered");
    assert!(server.proto.data_channel_ready());
}
