//! End-to-end coverage for the six concrete scenarios in spec section 8,
//! driven entirely through the crate's public API (no `pub(crate)` access
//! — this is a separate crate from `sipstack`'s own `#[cfg(test)]` units).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use sipstack::b2bua::{B2bua, B2buaHandler, B2buaSession, BridgeRouter, BridgeTarget};
use sipstack::core::config::StackConfig;
use sipstack::core::{AgentHandler, Core, IncomingRequest};
use sipstack::dialog::{Dialog, DialogState, InviteOption, InviteStatus};
use sipstack::message::headers::{HeaderField, HeaderName};
use sipstack::message::typed::{NameAddr, Via};
use sipstack::message::{parse_message, Method, Request, Response, StatusCode, TransportKind};
use sipstack::transaction::state::TimerConfig;
use sipstack::transport::TransportConfig;
use sipstack::{Result, SipError};

async fn loopback_core() -> Arc<Core> {
    let config = StackConfig::builder()
        .transport(TransportConfig::udp("127.0.0.1:0".parse::<SocketAddr>().unwrap()))
        .build();
    Core::new(config).await.unwrap()
}

async fn loopback_core_with_timers(timers: TimerConfig) -> Arc<Core> {
    let config = StackConfig::builder()
        .transport(TransportConfig::udp("127.0.0.1:0".parse::<SocketAddr>().unwrap()))
        .timers(timers)
        .build();
    Core::new(config).await.unwrap()
}

async fn wait_for<F: Fn() -> bool>(condition: F, timeout: Duration) {
    let step = Duration::from_millis(20);
    let mut waited = Duration::ZERO;
    while !condition() && waited < timeout {
        tokio::time::sleep(step).await;
        waited += step;
    }
}

// ---------------------------------------------------------------------
// 1. Basic request/response
// ---------------------------------------------------------------------

struct HelloWorldHandler;

#[async_trait::async_trait]
impl AgentHandler for HelloWorldHandler {
    async fn on_request(&self, core: Arc<Core>, args: IncomingRequest) -> Option<Response> {
        let mut resp = core.make_response(&args.request, StatusCode::OK, Some(Bytes::from_static(&[5, 6, 7, 8]))).ok()?;
        resp.reason = "Hello World!".to_string();
        Some(resp)
    }
}

#[tokio::test]
async fn basic_request_response() {
    let server = loopback_core().await;
    server.set_handler(Arc::new(HelloWorldHandler));
    let server_addr = server.local_addr(TransportKind::Udp).await.unwrap();

    let client = loopback_core().await;
    let client_addr = client.local_addr(TransportKind::Udp).await.unwrap();

    let via = Via::new(
        TransportKind::Udp,
        sipstack::message::Host::Ip(client_addr.addr.ip()),
        Some(client_addr.addr.port()),
        sipstack::message::new_branch(),
    );
    let from = NameAddr::new(format!("sip:alice@{}", client_addr.addr).parse().unwrap()).with_tag(sipstack::message::new_tag());
    let to = NameAddr::new(format!("sip:bob@{}", server_addr.addr).parse().unwrap());
    let req = client.make_request(
        Method::Info,
        format!("sip:bob@{}", server_addr.addr).parse().unwrap(),
        via,
        from,
        to,
        sipstack::message::new_call_id("127.0.0.1"),
        1,
    );

    let original_via = req.headers.get(&HeaderName::Via).unwrap().to_string();
    let original_call_id = req.call_id().unwrap().to_string();
    let original_cseq = req.cseq().unwrap();
    let original_from = req.from().unwrap();
    let original_to = req.to().unwrap();

    let resp = client.send_request(req).await.unwrap();

    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(resp.reason, "Hello World!");
    assert_eq!(&resp.body[..], &[5, 6, 7, 8]);
    assert_eq!(resp.headers.get(&HeaderName::Via).unwrap(), original_via);
    assert_eq!(resp.call_id().unwrap(), original_call_id);
    assert_eq!(resp.cseq().unwrap(), original_cseq);
    assert_eq!(resp.from().unwrap().uri, original_from.uri);
    assert_eq!(resp.to().unwrap().uri, original_to.uri);

    server.shutdown().await;
    client.shutdown().await;
}

// ---------------------------------------------------------------------
// 2. Provisional-then-final, single transaction, in order
// ---------------------------------------------------------------------

fn build_scripted_response(req: &Request, status: StatusCode, to_tag: Option<&str>, contact: Option<&str>, body: Option<Bytes>) -> Response {
    let mut resp = Response::new(status);
    for via in req.headers.get_all(&HeaderName::Via) {
        resp.headers.push(HeaderField::new(HeaderName::Via, via.to_string()));
    }
    resp.headers.push(HeaderField::new(HeaderName::CallId, req.call_id().unwrap().to_string()));
    resp.headers.push(HeaderField::new(HeaderName::From, req.from().unwrap().to_string()));
    let mut to = req.to().unwrap();
    if let Some(tag) = to_tag {
        to = to.with_tag(tag.to_string());
    }
    resp.headers.push(HeaderField::new(HeaderName::To, to.to_string()));
    resp.headers.push(HeaderField::new(HeaderName::CSeq, req.cseq().unwrap().to_string()));
    if let Some(contact) = contact {
        resp.headers.push(HeaderField::new(HeaderName::Contact, format!("<{contact}>")));
    }
    if let Some(body) = body {
        resp.headers.push(HeaderField::new(HeaderName::ContentLength, body.len().to_string()));
        resp.body = body;
    } else {
        resp.headers.push(HeaderField::new(HeaderName::ContentLength, "0"));
    }
    resp
}

/// Stands in for a minimal, conformant UAS: receives one INVITE and
/// manually scripts 100 Trying -> 180 Ringing -> 200 OK, by hand, over a
/// bare UDP socket (bypassing this crate's own transport/transaction
/// layers entirely, so the client Core under test is the only thing
/// whose transaction state machine is actually exercised). Reports how
/// many INVITE datagrams it saw in total — more than one means the
/// client retransmitted instead of suppressing on the provisional.
async fn scripted_uas(socket: UdpSocket, invite_count: mpsc::UnboundedSender<usize>) {
    let mut buf = vec![0u8; 8192];
    let (n, peer) = socket.recv_from(&mut buf).await.unwrap();
    let req = parse_message(&buf[..n]).unwrap().into_request().unwrap();
    let to_tag = sipstack::message::new_tag();
    let local_addr = socket.local_addr().unwrap();
    let contact = format!("sip:callee@{local_addr}");

    let trying = build_scripted_response(&req, StatusCode::TRYING, None, None, None);
    socket.send_to(trying.to_string().as_bytes(), peer).await.unwrap();

    tokio::time::sleep(Duration::from_millis(30)).await;
    let ringing = build_scripted_response(&req, StatusCode::RINGING, Some(&to_tag), Some(&contact), None);
    socket.send_to(ringing.to_string().as_bytes(), peer).await.unwrap();

    tokio::time::sleep(Duration::from_millis(30)).await;
    let ok = build_scripted_response(&req, StatusCode::OK, Some(&to_tag), Some(&contact), Some(Bytes::from_static(b"answer-sdp")));
    socket.send_to(ok.to_string().as_bytes(), peer).await.unwrap();

    let mut seen = 1;
    while tokio::time::timeout(Duration::from_millis(200), socket.recv_from(&mut buf)).await.is_ok() {
        seen += 1;
    }
    let _ = invite_count.send(seen);
}

#[tokio::test]
async fn provisional_then_final_single_transaction() {
    let uas_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let uas_addr = uas_socket.local_addr().unwrap();
    let (count_tx, mut count_rx) = mpsc::unbounded_channel();
    tokio::spawn(scripted_uas(uas_socket, count_tx));

    let caller = loopback_core().await;
    let caller_addr = caller.local_addr(TransportKind::Udp).await.unwrap();

    let opt = InviteOption {
        caller: format!("sip:alice@{}", caller_addr.addr).parse().unwrap(),
        callee: format!("sip:callee@{uas_addr}").parse().unwrap(),
        contact: format!("sip:alice@{}", caller_addr.addr).parse().unwrap(),
        content_type: None,
        offer: Some(Bytes::from_static(b"offer-sdp")),
        destination: None,
    };

    let (dialog, status) = caller.create_dialog(opt).await.unwrap();
    assert!(matches!(status, InviteStatus::Ok));
    assert!(dialog.is_confirmed());
    assert_eq!(caller.dialog_count(), 1);

    let datagrams_seen = count_rx.recv().await.expect("scripted UAS should report its datagram count");
    assert_eq!(datagrams_seen, 1, "client must not retransmit once a provisional response arrives");

    caller.close_dialog(&dialog).await.unwrap();
    caller.shutdown().await;
}

// ---------------------------------------------------------------------
// 3. Dialog establishment + BYE from initiator
// ---------------------------------------------------------------------

#[tokio::test]
async fn dialog_establishment_and_bye_from_initiator() {
    let callee = loopback_core().await;
    let (confirmed_tx, mut confirmed_rx) = mpsc::unbounded_channel();
    callee.set_handler(Arc::new(AutoAnswerThenSignal { confirmed: confirmed_tx }));
    let callee_addr = callee.local_addr(TransportKind::Udp).await.unwrap();

    let caller = loopback_core().await;
    let caller_addr = caller.local_addr(TransportKind::Udp).await.unwrap();

    let opt = InviteOption {
        caller: format!("sip:alice@{}", caller_addr.addr).parse().unwrap(),
        callee: format!("sip:bob@{}", callee_addr.addr).parse().unwrap(),
        contact: format!("sip:alice@{}", caller_addr.addr).parse().unwrap(),
        content_type: None,
        offer: Some(Bytes::from_static(b"offer-sdp")),
        destination: None,
    };

    let (dialog, status) = caller.create_dialog(opt).await.unwrap();
    assert!(matches!(status, InviteStatus::Ok));
    assert!(dialog.is_confirmed());

    // The callee's on_dialog_confirmed fires once it processes the ACK.
    confirmed_rx.recv().await.expect("callee should confirm its own dialog leg");

    assert_eq!(caller.dialog_count(), 1);
    assert_eq!(callee.dialog_count(), 1);

    caller.close_dialog(&dialog).await.unwrap();
    assert!(matches!(dialog.state(), DialogState::Closed(Some(StatusCode::OK))));

    wait_for(|| caller.dialog_count() == 0 && callee.dialog_count() == 0, Duration::from_secs(2)).await;
    assert_eq!(caller.dialog_count(), 0);
    assert_eq!(callee.dialog_count(), 0);

    callee.shutdown().await;
    caller.shutdown().await;
}

struct AutoAnswerThenSignal {
    confirmed: mpsc::UnboundedSender<()>,
}

#[async_trait::async_trait]
impl AgentHandler for AutoAnswerThenSignal {
    async fn on_request(&self, core: Arc<Core>, args: IncomingRequest) -> Option<Response> {
        match args.request.method {
            Method::Invite => core
                .make_response(&args.request, StatusCode::OK, Some(Bytes::from_static(&[0, 1, 2, 3, 4])))
                .ok(),
            Method::Bye => core.make_response(&args.request, StatusCode::OK, None).ok(),
            _ => None,
        }
    }

    async fn on_dialog_confirmed(&self, _core: Arc<Core>, _dialog: Dialog) {
        let _ = self.confirmed.send(());
    }
}

// ---------------------------------------------------------------------
// 4. Rejection
// ---------------------------------------------------------------------

struct BusyHandler;

#[async_trait::async_trait]
impl AgentHandler for BusyHandler {
    async fn on_request(&self, core: Arc<Core>, args: IncomingRequest) -> Option<Response> {
        match args.request.method {
            Method::Invite => core.make_response(&args.request, StatusCode::BUSY_HERE, None).ok(),
            _ => None,
        }
    }
}

/// `create_dialog` never calls `on_dialog_created` on the originating
/// side — that hook only exists for a server dialog an inbound INVITE
/// creates. Installed on the caller purely to make "did not fire on A"
/// an assertion instead of an assumption.
struct PanicsOnDialogCreated;

#[async_trait::async_trait]
impl AgentHandler for PanicsOnDialogCreated {
    async fn on_dialog_created(&self, _core: Arc<Core>, _dialog: Dialog) {
        panic!("on_dialog_created must not fire on the originating side of a rejected invite");
    }
}

#[tokio::test]
async fn rejection_busy_here() {
    let callee = loopback_core().await;
    callee.set_handler(Arc::new(BusyHandler));
    let callee_addr = callee.local_addr(TransportKind::Udp).await.unwrap();

    let caller = loopback_core().await;
    caller.set_handler(Arc::new(PanicsOnDialogCreated));
    let caller_addr = caller.local_addr(TransportKind::Udp).await.unwrap();

    let opt = InviteOption {
        caller: format!("sip:alice@{}", caller_addr.addr).parse().unwrap(),
        callee: format!("sip:bob@{}", callee_addr.addr).parse().unwrap(),
        contact: format!("sip:alice@{}", caller_addr.addr).parse().unwrap(),
        content_type: None,
        offer: Some(Bytes::from_static(b"offer-sdp")),
        destination: None,
    };

    let (dialog, status) = caller.create_dialog(opt).await.unwrap();
    assert!(matches!(status, InviteStatus::BusyHere));
    assert!(dialog.is_closed());

    wait_for(|| caller.dialog_count() == 0, Duration::from_secs(1)).await;
    assert_eq!(caller.dialog_count(), 0);
    assert_eq!(callee.dialog_count(), 0);

    callee.shutdown().await;
    caller.shutdown().await;
}

// ---------------------------------------------------------------------
// 5. UDP timeout
// ---------------------------------------------------------------------

#[tokio::test]
async fn udp_timeout_bounded_by_64_t1() {
    // A small T1 keeps the test fast while still exercising the real
    // doubling/cap schedule; 64*T1 is the bound spec section 8 names.
    let timers = TimerConfig {
        t1: Duration::from_millis(20),
        t2: Duration::from_millis(160),
        t4: Duration::from_millis(320),
    };
    let caller = loopback_core_with_timers(timers.clone()).await;
    let caller_addr = caller.local_addr(TransportKind::Udp).await.unwrap();

    // Nothing is listening at this address; every retransmission goes
    // unanswered until Timer B fires.
    let dead_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = dead_socket.local_addr().unwrap();
    drop(dead_socket);

    let opt = InviteOption {
        caller: format!("sip:alice@{}", caller_addr.addr).parse().unwrap(),
        callee: format!("sip:bob@{dead_addr}").parse().unwrap(),
        contact: format!("sip:alice@{}", caller_addr.addr).parse().unwrap(),
        content_type: None,
        offer: Some(Bytes::from_static(b"offer-sdp")),
        destination: None,
    };

    let started = tokio::time::Instant::now();
    let result: Result<(Dialog, InviteStatus)> = caller.create_dialog(opt).await;
    let elapsed = started.elapsed();

    assert!(matches!(result, Err(SipError::RequestTimeout)));
    let lower_bound = timers.t1x64();
    assert!(elapsed >= lower_bound, "timed out too early: {elapsed:?} < {lower_bound:?}");
    assert!(elapsed <= lower_bound + timers.t1 * 4, "timed out too late: {elapsed:?}");

    caller.shutdown().await;
}

// ---------------------------------------------------------------------
// 6. B2BUA transparent bridge
// ---------------------------------------------------------------------

struct FixedRouter {
    target: BridgeTarget,
}

#[async_trait::async_trait]
impl BridgeRouter for FixedRouter {
    async fn route(&self, _invite: &Request) -> Option<BridgeTarget> {
        Some(BridgeTarget { callee: self.target.callee.clone(), contact: self.target.contact.clone() })
    }
}

struct BridgeRecorder {
    invite_request_seen: mpsc::UnboundedSender<()>,
    invite_response_seen: mpsc::UnboundedSender<()>,
    confirmed: mpsc::UnboundedSender<()>,
    closing: mpsc::UnboundedSender<()>,
}

#[async_trait::async_trait]
impl B2buaHandler for BridgeRecorder {
    async fn on_invite_request(&self, _session: Arc<B2buaSession>, _request: &mut Request) {
        let _ = self.invite_request_seen.send(());
    }
    async fn on_invite_response(&self, _session: Arc<B2buaSession>, _response: &mut Response) {
        let _ = self.invite_response_seen.send(());
    }
    async fn on_session_confirmed(&self, _session: Arc<B2buaSession>) {
        let _ = self.confirmed.send(());
    }
    async fn on_session_closing(&self, _session: Arc<B2buaSession>) {
        let _ = self.closing.send(());
    }
}

struct FarSideHandler;

#[async_trait::async_trait]
impl AgentHandler for FarSideHandler {
    async fn on_request(&self, core: Arc<Core>, args: IncomingRequest) -> Option<Response> {
        match args.request.method {
            Method::Invite => core
                .make_response(&args.request, StatusCode::OK, Some(Bytes::from_static(b"far-side-sdp")))
                .ok(),
            Method::Bye => core.make_response(&args.request, StatusCode::OK, None).ok(),
            Method::Info => core.make_response(&args.request, StatusCode::OK, Some(Bytes::from_static(b"far-side-info-reply"))).ok(),
            _ => None,
        }
    }
}

#[tokio::test]
async fn b2bua_transparent_bridge() {
    let far_side = loopback_core().await;
    far_side.set_handler(Arc::new(FarSideHandler));
    let far_side_addr = far_side.local_addr(TransportKind::Udp).await.unwrap();

    let bridge_core = loopback_core().await;
    let bridge_addr = bridge_core.local_addr(TransportKind::Udp).await.unwrap();

    let (invite_req_tx, mut invite_req_rx) = mpsc::unbounded_channel();
    let (invite_resp_tx, mut invite_resp_rx) = mpsc::unbounded_channel();
    let (confirmed_tx, mut confirmed_rx) = mpsc::unbounded_channel();
    let (closing_tx, mut closing_rx) = mpsc::unbounded_channel();
    let router = Arc::new(FixedRouter {
        target: BridgeTarget {
            callee: format!("sip:farside@{}", far_side_addr.addr).parse().unwrap(),
            contact: format!("sip:bridge@{}", bridge_addr.addr).parse().unwrap(),
        },
    });
    let handler: Arc<dyn B2buaHandler> = Arc::new(BridgeRecorder {
        invite_request_seen: invite_req_tx,
        invite_response_seen: invite_resp_tx,
        confirmed: confirmed_tx,
        closing: closing_tx,
    });
    let bridge = B2bua::new(router, Some(handler));
    bridge.attach(bridge_core.clone());

    let near_side = loopback_core().await;
    let near_side_addr = near_side.local_addr(TransportKind::Udp).await.unwrap();

    let opt = InviteOption {
        caller: format!("sip:alice@{}", near_side_addr.addr).parse().unwrap(),
        callee: format!("sip:bridge@{}", bridge_addr.addr).parse().unwrap(),
        contact: format!("sip:alice@{}", near_side_addr.addr).parse().unwrap(),
        content_type: None,
        offer: Some(Bytes::from_static(b"near-side-sdp")),
        destination: None,
    };

    let (dialog, status) = near_side.create_dialog(opt).await.unwrap();
    assert!(matches!(status, InviteStatus::Ok));

    invite_req_rx.recv().await.expect("on_invite_request should fire while bridging the INVITE");
    invite_resp_rx.recv().await.expect("on_invite_response should fire while relaying the final response");
    confirmed_rx.recv().await.expect("on_session_confirmed should fire once both legs are up");
    assert_eq!(bridge_core.dialog_count(), 2);

    let info_reply = dialog.send_request(Method::Info, Some(Bytes::from_static(b"near-side-info"))).await.unwrap();
    assert_eq!(info_reply.status, StatusCode::OK);
    assert_eq!(&info_reply.body[..], b"far-side-info-reply");

    near_side.close_dialog(&dialog).await.unwrap();
    closing_rx.recv().await.expect("on_session_closing should fire exactly once");
    assert!(closing_rx.try_recv().is_err(), "on_session_closing must not fire a second time");

    wait_for(|| near_side.dialog_count() == 0 && bridge_core.dialog_count() == 0 && far_side.dialog_count() == 0, Duration::from_secs(2)).await;
    assert_eq!(near_side.dialog_count(), 0);
    assert_eq!(bridge_core.dialog_count(), 0);
    assert_eq!(far_side.dialog_count(), 0);

    far_side.shutdown().await;
    bridge_core.shutdown().await;
    near_side.shutdown().await;
}
