mod support;

use std::io::{Read, Write};
use std::net::TcpListener;
use std::thread;
use std::time::Duration;
use strand::{NetError, StreamLayer};
use tempfile::TempDir;

#[test]
fn tls_peer_sessions_round_trip() {
    let tmp = TempDir::new().unwrap();
    let tls = support::tls_materials(&tmp).unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let layer = StreamLayer::new(listener, Some(tls.server.clone()), Some(tls.peer.clone()));

    let server = thread::spawn(move || {
        let mut conn = layer.accept().unwrap();
        let mut buf = [0u8; 5];
        conn.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        conn.write_all(b"world").unwrap();
        conn.flush().unwrap();
    });

    // Dialer from a sibling layer sharing the same trust material.
    let client_listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let client_layer = StreamLayer::new(client_listener, None, Some(tls.peer.clone()));
    let dialer = client_layer.peer_client();

    let mut conn = dialer
        .dial(&addr.to_string(), Duration::from_secs(1))
        .unwrap();
    conn.write_all(b"hello").unwrap();
    conn.flush().unwrap();
    let mut buf = [0u8; 5];
    conn.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"world");

    server.join().unwrap();
}

#[test]
fn plaintext_dial_writes_discriminator_first() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let layer = StreamLayer::new(listener, None, None);

    let server = thread::spawn(move || match layer.accept() {
        Ok(mut conn) => {
            let mut buf = [0u8; 4];
            conn.read_exact(&mut buf).unwrap();
            buf.to_vec()
        }
        Err(err) => panic!("accept failed: {err}"),
    });

    let dial_listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let dial_layer = StreamLayer::new(dial_listener, None, None);
    let mut conn = dial_layer
        .peer_client()
        .dial(&addr.to_string(), Duration::from_secs(1))
        .unwrap();
    conn.write_all(b"ping").unwrap();
    assert_eq!(server.join().unwrap(), b"ping");
}

#[test]
fn foreign_first_byte_is_rejected() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let layer = StreamLayer::new(listener, None, None);

    let client = thread::spawn(move || {
        let mut stream = std::net::TcpStream::connect(addr).unwrap();
        stream.write_all(b"GET / HTTP/1.1\r\n").unwrap();
    });

    assert!(matches!(layer.accept(), Err(NetError::NotRaftRpc)));
    client.join().unwrap();
}
