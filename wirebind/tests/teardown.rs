//! Unbind reasons, cancellation of outstanding calls and channel reclaim.

#![allow(clippy::unwrap_used, clippy::expect_used, missing_docs)]

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;

use common::{DEFER, ECHO, NOTIFY, TIMEOUT, Unbound, deferring_router, echo_router};
use wirebind::proto::encode_message;
use wirebind::{
    Channel, Client, Dispatcher, Error, Message, Readable, Reason, Router, ServerBuilder, Status,
    Transport, UnbindInfo, bind_server,
};

/// Never readable; every write fails with [`Status::IO`].
#[derive(Debug)]
struct BrokenWrites;

impl Transport for BrokenWrites {
    fn write(&self, _message: Message) -> Result<(), Status> {
        Err(Status::IO)
    }

    fn read(&self) -> Result<Message, Status> {
        Err(Status::SHOULD_WAIT)
    }

    fn readable(&self) -> Readable<'_> {
        Box::pin(std::future::pending())
    }
}

/// A client bound to a raw channel the test drives by hand.
fn raw_peer(dispatcher: &Dispatcher) -> (Client, Channel, Unbound) {
    let (client_end, peer) = Channel::create();
    let (observer, unbound) = Unbound::new();
    let client = Client::builder(dispatcher).on_unbound(observer).bind(client_end);
    (client, peer, unbound)
}

#[test]
fn peer_close_is_reported_with_its_status() {
    let rt = common::runtime();
    let dispatcher = Dispatcher::new(rt.handle().clone());
    let (client, peer, unbound) = raw_peer(&dispatcher);

    drop(peer);
    let info = unbound.wait();
    assert_eq!(info, UnbindInfo::peer_closed(Status::PEER_CLOSED));
    assert_eq!(
        info.format_description(),
        "endpoint was unbound due to peer closed, status: PEER_CLOSED (-24)"
    );
    assert_eq!(client.unbind_info(), Some(info));
    assert!(!client.is_bound());
}

#[test]
fn reply_to_unknown_transaction_is_a_protocol_error() {
    let rt = common::runtime();
    let dispatcher = Dispatcher::new(rt.handle().clone());
    let (client, peer, unbound) = raw_peer(&dispatcher);

    let pending = client.call::<str, String>(ECHO, "never answered");
    peer.write(Message::new(encode_message(42, ECHO, "stray").unwrap()))
        .unwrap();
    let info = unbound.wait();
    assert_eq!(info, UnbindInfo::unexpected_message(Status::NOT_FOUND));
    assert!(info.is_protocol_error());

    let err = rt.block_on(pending).unwrap_err();
    assert_eq!(err, Error::Protocol(info));
    assert!(!err.is_canceled());
    assert_eq!(err.status(), Status::NOT_FOUND);
}

#[test]
fn event_without_handler_is_a_protocol_error() {
    let rt = common::runtime();
    let dispatcher = Dispatcher::new(rt.handle().clone());
    let (_client, peer, unbound) = raw_peer(&dispatcher);

    peer.write(Message::new(encode_message(0, 9, &()).unwrap()))
        .unwrap();
    assert_eq!(
        unbound.wait(),
        UnbindInfo::unexpected_message(Status::NOT_SUPPORTED)
    );
}

#[test]
fn epitaph_status_reaches_client_and_pending_calls() {
    let rt = common::runtime();
    let dispatcher = Dispatcher::new(rt.handle().clone());
    let (client_end, server_end) = Channel::create();
    let (router, deferred) = deferring_router();
    let (server_observer, server_unbound) = Unbound::new();
    let server = bind_server(&dispatcher, server_end, router, server_observer);
    let (observer, unbound) = Unbound::new();
    let client = Client::builder(&dispatcher).on_unbound(observer).bind(client_end);

    let pending = client.call::<str, String>(DEFER, "never answered");
    let (_, owned) = deferred.recv_timeout(TIMEOUT).unwrap();
    server.close(Status::ACCESS_DENIED);

    let expected = UnbindInfo::peer_closed(Status::ACCESS_DENIED);
    assert_eq!(unbound.wait(), expected);
    assert_eq!(rt.block_on(pending).unwrap_err(), Error::Canceled(expected));
    assert_eq!(server_unbound.wait(), UnbindInfo::close(Status::ACCESS_DENIED));
    // The reply is moot once the server binding is gone.
    drop(owned);
}

#[test]
fn outstanding_call_is_canceled_once_when_peer_closes() {
    let rt = common::runtime();
    let dispatcher = Dispatcher::new(rt.handle().clone());
    let (client, peer, unbound) = raw_peer(&dispatcher);

    let calls = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = mpsc::channel();
    let counter = Arc::clone(&calls);
    client
        .call_with(ECHO, "into the void", move |reply: wirebind::Result<String>| {
            counter.fetch_add(1, Ordering::SeqCst);
            tx.send(reply).unwrap();
        })
        .unwrap();
    assert_eq!(client.pending_calls(), 1);

    drop(peer);
    let err = rx.recv_timeout(TIMEOUT).unwrap().unwrap_err();
    assert!(err.is_canceled());
    assert_eq!(err.unbind_info(), Some(UnbindInfo::peer_closed(Status::PEER_CLOSED)));
    unbound.wait();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(client.pending_calls(), 0);
}

#[test]
fn failed_request_write_never_reaches_the_callback() {
    let rt = common::runtime();
    let dispatcher = Dispatcher::new(rt.handle().clone());
    let (observer, unbound) = Unbound::new();
    let client = Client::builder(&dispatcher)
        .on_unbound(observer)
        .bind(BrokenWrites);

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let sent = client.call_with(ECHO, "lost", move |_: wirebind::Result<String>| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(sent, Err(Error::Transport(Status::IO)));
    assert_eq!(client.pending_calls(), 0);

    assert_eq!(unbound.wait(), UnbindInfo::transport_error(Status::IO));
    assert!(unbound.quiet());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn binding_on_a_stopped_runtime_reports_a_dispatcher_error() {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let dispatcher = Dispatcher::new(rt.handle().clone());
    drop(rt);

    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let (client_end, _peer) = Channel::create();
        let (observer, unbound) = Unbound::new();
        let client = Client::builder(&dispatcher)
            .on_unbound(observer)
            .bind(client_end);
        let late: wirebind::Result<String> = client.call_sync(ECHO, "nobody home");
        tx.send((unbound.wait(), client.is_bound(), late)).unwrap();
    });

    let (info, bound, late) = rx.recv_timeout(TIMEOUT).expect("bind did not return");
    assert_eq!(info, UnbindInfo::dispatcher_error(Status::CANCELED));
    assert!(!bound);
    assert!(late.unwrap_err().is_canceled());
}

#[test]
fn unbind_cancels_outstanding_calls() {
    let rt = common::runtime();
    let dispatcher = Dispatcher::new(rt.handle().clone());
    let (client, _peer, unbound) = raw_peer(&dispatcher);

    let pending = client.call::<str, String>(ECHO, "waiting");
    client.unbind();
    client.unbind();
    assert_eq!(unbound.wait(), UnbindInfo::unbind());
    assert!(unbound.quiet());
    assert_eq!(
        rt.block_on(pending).unwrap_err(),
        Error::Canceled(UnbindInfo::unbind())
    );

    let late: wirebind::Result<String> = client.call_sync(ECHO, "too late");
    assert!(late.unwrap_err().is_canceled());
    assert!(client.send(NOTIFY, "too late").unwrap_err().is_canceled());
}

#[test]
fn one_way_messages_then_close_fire_observer_once() {
    let rt = common::runtime();
    let dispatcher = Dispatcher::new(rt.handle().clone());
    let (client_end, server_end) = Channel::create();
    let received = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&received);
    let router = Router::new().one_way(NOTIFY, move |_: String, _| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let (observer, unbound) = Unbound::new();
    bind_server(&dispatcher, server_end, router, observer);
    let client = Client::bind(&dispatcher, client_end);

    for i in 0..50 {
        client.send(NOTIFY, &format!("message {i}")).unwrap();
    }
    assert_eq!(client.pending_calls(), 0);
    drop(client);

    assert_eq!(unbound.wait(), UnbindInfo::peer_closed(Status::PEER_CLOSED));
    assert!(unbound.quiet());
    assert_eq!(received.load(Ordering::SeqCst), 50);
}

#[test]
fn unknown_ordinal_tears_down_the_server() {
    let rt = common::runtime();
    let dispatcher = Dispatcher::new(rt.handle().clone());
    let (client_end, server_end) = Channel::create();
    let (observer, server_unbound) = Unbound::new();
    let server = ServerBuilder::new(&dispatcher)
        .on_unbound(observer)
        .bind(server_end, echo_router());
    let client = Client::bind(&dispatcher, client_end);

    let reply: wirebind::Result<String> = client.call_sync(99, "no such method");
    assert!(reply.unwrap_err().is_canceled());
    let info = server_unbound.wait();
    assert_eq!(info, UnbindInfo::unexpected_message(Status::NOT_SUPPORTED));
    assert_eq!(server.unbind_info(), Some(info));
    assert!(!server.is_bound());
}

#[test]
fn undecodable_request_is_a_decode_error() {
    let rt = common::runtime();
    let dispatcher = Dispatcher::new(rt.handle().clone());
    let (client_end, server_end) = Channel::create();
    let (observer, server_unbound) = Unbound::new();
    bind_server(&dispatcher, server_end, echo_router(), observer);
    let client = Client::bind(&dispatcher, client_end);

    // Echo expects a string; an empty body cannot be one.
    let pending = client.call::<(), String>(ECHO, &());
    let info = server_unbound.wait();
    assert_eq!(info.reason(), Reason::DecodeError);
    assert!(info.is_protocol_error());
    assert!(rt.block_on(pending).unwrap_err().is_canceled());
}

#[test]
fn one_way_call_on_two_way_method_is_rejected() {
    let rt = common::runtime();
    let dispatcher = Dispatcher::new(rt.handle().clone());
    let (client_end, server_end) = Channel::create();
    let (observer, server_unbound) = Unbound::new();
    bind_server(&dispatcher, server_end, echo_router(), observer);
    let client = Client::bind(&dispatcher, client_end);

    client.send(ECHO, "no reply expected").unwrap();
    assert_eq!(
        server_unbound.wait(),
        UnbindInfo::unexpected_message(Status::INVALID_ARGS)
    );
}

#[test]
fn wait_for_channel_returns_the_transport() {
    let rt = common::runtime();
    let dispatcher = Dispatcher::new(rt.handle().clone());
    let (client, peer, unbound) = raw_peer(&dispatcher);

    let reclaimed = thread::spawn(move || client.wait_for_channel())
        .join()
        .unwrap()
        .expect("transport was already released");
    assert_eq!(unbound.wait(), UnbindInfo::unbind());

    assert!(!peer.is_peer_closed());
    reclaimed
        .write(Message::new(b"still open".to_vec()))
        .unwrap();
    assert_eq!(peer.read().unwrap().bytes, b"still open");
    drop(reclaimed);
    assert!(peer.is_peer_closed());
}

#[test]
fn dropping_last_client_clone_unbinds() {
    let rt = common::runtime();
    let dispatcher = Dispatcher::new(rt.handle().clone());
    let (client_end, server_end) = Channel::create();
    let (observer, server_unbound) = Unbound::new();
    bind_server(&dispatcher, server_end, echo_router(), observer);
    let (client_observer, client_unbound) = Unbound::new();
    let client = Client::builder(&dispatcher)
        .on_unbound(client_observer)
        .bind(client_end);

    let clone = client.clone();
    drop(client);
    assert!(client_unbound.quiet());
    let reply: String = clone.call_sync(ECHO, "still here").unwrap();
    assert_eq!(reply, "still here");

    drop(clone);
    assert_eq!(client_unbound.wait(), UnbindInfo::unbind());
    assert_eq!(server_unbound.wait(), UnbindInfo::peer_closed(Status::PEER_CLOSED));
}
