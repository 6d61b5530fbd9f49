use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{Instant, sleep, timeout};

use super::protocol::{DecodeError, Message, read_message};
use super::{DispatchRegistry, ViolationEngine, session};

/// Bind a full server instance on an ephemeral port.
async fn start_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");

    let registry = Arc::new(DispatchRegistry::new());
    let engine = ViolationEngine::spawn(Arc::clone(&registry));
    tokio::spawn(async move {
        loop {
            let Ok((stream, peer)) = listener.accept().await else {
                return;
            };
            tokio::spawn(session::serve(
                stream,
                peer,
                engine.clone(),
                Arc::clone(&registry),
            ));
        }
    });

    addr
}

async fn connect(addr: SocketAddr) -> TcpStream {
    TcpStream::connect(addr).await.expect("connect")
}

async fn send(stream: &mut TcpStream, message: Message) {
    stream
        .write_all(&message.encode())
        .await
        .expect("write message");
}

async fn recv(stream: &mut TcpStream) -> Message {
    timeout(Duration::from_secs(2), read_message(stream))
        .await
        .expect("reply within two seconds")
        .expect("decodable reply")
}

async fn recv_error(stream: &mut TcpStream) -> String {
    match recv(stream).await {
        Message::Error { msg } => msg,
        other => panic!("expected error, got {other:?}"),
    }
}

/// After an error the server closes the connection.
async fn expect_eof(stream: &mut TcpStream) {
    let ending = timeout(Duration::from_secs(2), read_message(stream))
        .await
        .expect("close within two seconds");
    assert!(matches!(ending, Err(DecodeError::Closed)));
}

fn camera(road: u16, mile: u16, limit: u16) -> Message {
    Message::IAmCamera { road, mile, limit }
}

fn plate(plate: &str, timestamp: u32) -> Message {
    Message::Plate {
        plate: plate.to_string(),
        timestamp,
    }
}

#[tokio::test]
async fn speeding_vehicle_gets_exactly_one_ticket() {
    let addr = start_server().await;

    let mut dispatcher = connect(addr).await;
    send(&mut dispatcher, Message::IAmDispatcher { roads: vec![66] }).await;

    let mut cam1 = connect(addr).await;
    send(&mut cam1, camera(66, 100, 60)).await;
    send(&mut cam1, plate("UN1X", 0)).await;

    let mut cam2 = connect(addr).await;
    send(&mut cam2, camera(66, 110, 60)).await;
    send(&mut cam2, plate("UN1X", 300)).await;

    assert_eq!(
        recv(&mut dispatcher).await,
        Message::Ticket {
            plate: "UN1X".to_string(),
            road: 66,
            mile1: 100,
            timestamp1: 0,
            mile2: 110,
            timestamp2: 300,
            speed_x100: 12000,
        }
    );

    // A second violation the same day produces nothing further.
    send(&mut cam1, plate("UN1X", 600)).await;
    let extra = timeout(Duration::from_millis(300), read_message(&mut dispatcher)).await;
    assert!(extra.is_err(), "same-day violation must not re-ticket");
}

#[tokio::test]
async fn tickets_are_buffered_until_a_dispatcher_connects() {
    let addr = start_server().await;

    let mut cam1 = connect(addr).await;
    send(&mut cam1, camera(42, 0, 50)).await;
    send(&mut cam1, plate("L4TE", 1000)).await;

    let mut cam2 = connect(addr).await;
    send(&mut cam2, camera(42, 30, 50)).await;
    send(&mut cam2, plate("L4TE", 2000)).await;

    // Give the engine time to issue into the empty road queue.
    sleep(Duration::from_millis(100)).await;

    let mut dispatcher = connect(addr).await;
    send(&mut dispatcher, Message::IAmDispatcher { roads: vec![42] }).await;

    match recv(&mut dispatcher).await {
        Message::Ticket { plate, road, .. } => {
            assert_eq!(plate, "L4TE");
            assert_eq!(road, 42);
        }
        other => panic!("expected ticket, got {other:?}"),
    }
}

#[tokio::test]
async fn ticket_survives_a_dispatcher_that_disconnected() {
    let addr = start_server().await;

    let mut quitter = connect(addr).await;
    send(&mut quitter, Message::IAmDispatcher { roads: vec![7] }).await;
    drop(quitter);
    sleep(Duration::from_millis(100)).await;

    let mut cam1 = connect(addr).await;
    send(&mut cam1, camera(7, 0, 60)).await;
    send(&mut cam1, plate("GH0ST", 0)).await;

    let mut cam2 = connect(addr).await;
    send(&mut cam2, camera(7, 20, 60)).await;
    send(&mut cam2, plate("GH0ST", 600)).await;

    let mut replacement = connect(addr).await;
    send(&mut replacement, Message::IAmDispatcher { roads: vec![7] }).await;

    match recv(&mut replacement).await {
        Message::Ticket { plate, .. } => assert_eq!(plate, "GH0ST"),
        other => panic!("expected ticket, got {other:?}"),
    }
}

#[tokio::test]
async fn identifying_twice_is_refused() {
    let addr = start_server().await;

    let mut client = connect(addr).await;
    send(&mut client, Message::IAmDispatcher { roads: vec![66] }).await;
    send(&mut client, camera(66, 100, 60)).await;

    assert_eq!(recv_error(&mut client).await, "cannot identify yourself twice");
    expect_eof(&mut client).await;
}

#[tokio::test]
async fn plates_from_non_cameras_are_refused() {
    let addr = start_server().await;

    let mut client = connect(addr).await;
    send(&mut client, plate("N0PE", 0)).await;

    assert_eq!(recv_error(&mut client).await, "must be a camera to send plates");
    expect_eof(&mut client).await;
}

#[tokio::test]
async fn second_heartbeat_request_is_refused() {
    let addr = start_server().await;

    let mut client = connect(addr).await;
    send(&mut client, Message::WantHeartbeat { interval: 0 }).await;
    send(&mut client, Message::WantHeartbeat { interval: 10 }).await;

    assert_eq!(recv_error(&mut client).await, "cannot send WantHeartbeat twice");
    expect_eof(&mut client).await;
}

#[tokio::test]
async fn clients_cannot_send_server_messages() {
    let addr = start_server().await;

    let mut client = connect(addr).await;
    send(&mut client, Message::Heartbeat).await;

    assert_eq!(recv_error(&mut client).await, "clients cannot send Heartbeat");
    expect_eof(&mut client).await;
}

#[tokio::test]
async fn unknown_message_types_are_refused() {
    let addr = start_server().await;

    let mut client = connect(addr).await;
    client.write_all(&[0x99]).await.expect("write");

    assert_eq!(recv_error(&mut client).await, "message not implemented");
    expect_eof(&mut client).await;
}

#[tokio::test]
async fn heartbeats_arrive_at_the_requested_cadence() {
    let addr = start_server().await;

    let mut client = connect(addr).await;
    send(&mut client, Message::WantHeartbeat { interval: 1 }).await;

    let started = Instant::now();
    for _ in 0..3 {
        assert_eq!(recv(&mut client).await, Message::Heartbeat);
    }
    let elapsed = started.elapsed();

    // Three beats at one decisecond each: at least two full periods must
    // have passed, and well under the two-second reply timeout.
    assert!(elapsed >= Duration::from_millis(200), "too fast: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(2), "too slow: {elapsed:?}");
}
