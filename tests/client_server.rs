//! End-to-end client/server scenarios over loopback.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::time::{Duration, Instant};

use tidepool::{IoService, ReadRequest, TcpClient, TcpServer, WriteRequest};

const TIMEOUT: Duration = Duration::from_secs(2);

fn service() -> Arc<IoService> {
    Arc::new(IoService::with_workers(2).unwrap())
}

/// Spins until `condition` holds or the timeout elapses.
fn wait_until(condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Keeps one read scheduled on `client`, writing every received buffer
/// straight back.
fn schedule_echo(client: &Arc<TcpClient>) {
    let chained = Arc::clone(client);
    let _ = client.async_read(ReadRequest {
        size: 1024,
        callback: Some(Box::new(move |result| {
            if result.success {
                let _ = chained.async_write(WriteRequest {
                    buffer: result.buffer,
                    callback: None,
                });
                schedule_echo(&chained);
            }
        })),
    });
}

fn start_echo_server(io: &Arc<IoService>, port: u32) -> TcpServer {
    let server = TcpServer::with_io_service(Arc::clone(io));
    server
        .start("127.0.0.1", port, |client| {
            schedule_echo(client);
            false
        })
        .unwrap();
    server
}

#[test]
fn echo_round_trip() {
    let io = service();
    let server = start_echo_server(&io, 3801);

    let client = TcpClient::with_io_service(Arc::clone(&io));
    client.connect("127.0.0.1", 3801, 1000).unwrap();

    let (write_tx, write_rx) = mpsc::channel();
    client
        .async_write(WriteRequest {
            buffer: b"123456abc".to_vec(),
            callback: Some(Box::new(move |result| {
                write_tx.send(result).unwrap();
            })),
        })
        .unwrap();

    let written = write_rx.recv_timeout(TIMEOUT).unwrap();
    assert!(written.success);
    assert_eq!(written.size, 9);

    let (read_tx, read_rx) = mpsc::channel();
    client
        .async_read(ReadRequest {
            size: 1024,
            callback: Some(Box::new(move |result| {
                read_tx.send(result).unwrap();
            })),
        })
        .unwrap();

    let read = read_rx.recv_timeout(TIMEOUT).unwrap();
    assert!(read.success);
    assert_eq!(read.buffer, b"123456abc");

    client.disconnect(true);
    server.stop(true, true);
}

#[test]
fn reject_double_connect() {
    let io = service();
    let server = start_echo_server(&io, 3802);

    let client = TcpClient::with_io_service(Arc::clone(&io));
    assert!(!client.is_connected());
    client.connect("127.0.0.1", 3802, 1000).unwrap();
    assert!(client.is_connected());

    let second = client.connect("127.0.0.1", 3802, 1000);
    assert!(second.is_err());
    assert!(client.is_connected());

    client.disconnect(true);
    server.stop(true, true);
}

#[test]
fn connect_to_unresolvable_host_fails() {
    let io = service();
    let client = TcpClient::with_io_service(io);
    assert!(client.connect("invalid host", 1234, 0).is_err());
    assert!(!client.is_connected());
}

#[test]
fn peer_close_reports_failure_and_fires_handler_once() {
    let io = service();
    let server = TcpServer::with_io_service(Arc::clone(&io));
    server
        .start("127.0.0.1", 3803, |client| {
            // Close the connection right away; the peer observes a failed
            // read and disconnects itself.
            client.disconnect(false);
            true
        })
        .unwrap();

    let client = TcpClient::with_io_service(Arc::clone(&io));
    client.connect("127.0.0.1", 3803, 1000).unwrap();

    let fired = Arc::new(AtomicUsize::new(0));
    let handler_fired = Arc::clone(&fired);
    let (handler_tx, handler_rx) = mpsc::channel();
    client.set_disconnection_handler(Some(Arc::new(move || {
        handler_fired.fetch_add(1, Ordering::SeqCst);
        let _ = handler_tx.send(());
    })));

    let (read_tx, read_rx) = mpsc::channel();
    client
        .async_read(ReadRequest {
            size: 1024,
            callback: Some(Box::new(move |result| {
                read_tx.send(result).unwrap();
            })),
        })
        .unwrap();

    let result = read_rx.recv_timeout(TIMEOUT).unwrap();
    assert!(!result.success);
    assert!(result.buffer.is_empty());

    handler_rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert!(!client.is_connected());

    // Operating while disconnected is a usage error.
    assert!(
        client
            .async_read(ReadRequest {
                size: 16,
                callback: None,
            })
            .is_err()
    );

    server.stop(true, true);
}

#[test]
fn parallel_clients_are_independent() {
    let io = service();
    let server = start_echo_server(&io, 3804);

    let first = TcpClient::with_io_service(Arc::clone(&io));
    let second = TcpClient::with_io_service(Arc::clone(&io));
    first.connect("127.0.0.1", 3804, 1000).unwrap();
    second.connect("127.0.0.1", 3804, 1000).unwrap();

    assert!(first != second);

    first.disconnect(true);
    assert!(!first.is_connected());
    assert!(second.is_connected());

    // The survivor still echoes.
    let (read_tx, read_rx) = mpsc::channel();
    second
        .async_write(WriteRequest {
            buffer: b"still here".to_vec(),
            callback: None,
        })
        .unwrap();
    second
        .async_read(ReadRequest {
            size: 1024,
            callback: Some(Box::new(move |result| {
                read_tx.send(result).unwrap();
            })),
        })
        .unwrap();

    let read = read_rx.recv_timeout(TIMEOUT).unwrap();
    assert!(read.success);
    assert_eq!(read.buffer, b"still here");

    second.disconnect(true);
    server.stop(true, true);
}

#[test]
fn read_requests_are_serviced_in_fifo_order() {
    let io = service();
    let server = TcpServer::with_io_service(Arc::clone(&io));
    server
        .start("127.0.0.1", 3805, |client| {
            let _ = client.async_write(WriteRequest {
                buffer: b"abcdef".to_vec(),
                callback: None,
            });
            false
        })
        .unwrap();

    let client = TcpClient::with_io_service(Arc::clone(&io));
    client.connect("127.0.0.1", 3805, 1000).unwrap();

    let (tx, rx) = mpsc::channel();
    for index in 0..2 {
        let tx = tx.clone();
        client
            .async_read(ReadRequest {
                size: 3,
                callback: Some(Box::new(move |result| {
                    tx.send((index, result)).unwrap();
                })),
            })
            .unwrap();
    }

    let (first_index, first) = rx.recv_timeout(TIMEOUT).unwrap();
    let (second_index, second) = rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!((first_index, second_index), (0, 1));
    assert!(first.success && second.success);
    assert_eq!(first.buffer, b"abc");
    assert_eq!(second.buffer, b"def");

    client.disconnect(true);
    server.stop(true, true);
}

#[test]
fn write_callbacks_fire_once_each_across_worker_resize() {
    let io = Arc::new(IoService::with_workers(1).unwrap());
    let server = TcpServer::with_io_service(Arc::clone(&io));
    // A sink: connections are retained and never read from.
    server.start("127.0.0.1", 3806, |_client| false).unwrap();

    let client = TcpClient::with_io_service(Arc::clone(&io));
    client.connect("127.0.0.1", 3806, 1000).unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    let (tx, rx) = mpsc::channel();
    for index in 0..100usize {
        let order = Arc::clone(&order);
        let tx = tx.clone();
        client
            .async_write(WriteRequest {
                buffer: vec![b'x'; 32],
                callback: Some(Box::new(move |result| {
                    assert!(result.success);
                    order.lock().unwrap().push(index);
                    tx.send(()).unwrap();
                })),
            })
            .unwrap();
    }

    // Grow the pool while the dispatches are draining.
    io.set_worker_count(8);

    for _ in 0..100 {
        rx.recv_timeout(TIMEOUT).unwrap();
    }
    assert!(rx.try_recv().is_err(), "a callback fired more than once");

    let order = order.lock().unwrap();
    assert_eq!(*order, (0..100).collect::<Vec<_>>());

    client.disconnect(true);
    server.stop(true, true);
}

#[test]
fn orderly_server_stop_drops_pending_reads() {
    let io = service();
    let server = TcpServer::with_io_service(Arc::clone(&io));
    server.start("127.0.0.1", 3807, |_client| false).unwrap();

    let clients: Vec<TcpClient> = (0..3)
        .map(|_| {
            let client = TcpClient::with_io_service(Arc::clone(&io));
            client.connect("127.0.0.1", 3807, 1000).unwrap();
            client
        })
        .collect();

    assert!(wait_until(|| server.clients().len() == 3));

    // Schedule a read on every adopted client; no data will ever arrive.
    let fired = Arc::new(AtomicBool::new(false));
    let adopted = server.clients();
    for client in &adopted {
        let fired = Arc::clone(&fired);
        client
            .async_read(ReadRequest {
                size: 1024,
                callback: Some(Box::new(move |_| {
                    fired.store(true, Ordering::SeqCst);
                })),
            })
            .unwrap();
    }

    server.stop(true, true);

    assert!(server.clients().is_empty());
    assert!(!server.is_running());
    for client in &adopted {
        assert!(!client.is_connected());
    }
    assert!(!fired.load(Ordering::SeqCst));

    drop(clients);
}

#[test]
fn client_reconnects_after_disconnect() {
    let io = service();
    let server = start_echo_server(&io, 3808);

    let client = TcpClient::with_io_service(Arc::clone(&io));
    client.connect("127.0.0.1", 3808, 1000).unwrap();
    client.disconnect(true);
    assert!(!client.is_connected());

    client.connect("127.0.0.1", 3808, 1000).unwrap();
    assert!(client.is_connected());

    let (read_tx, read_rx) = mpsc::channel();
    client
        .async_write(WriteRequest {
            buffer: b"again".to_vec(),
            callback: None,
        })
        .unwrap();
    client
        .async_read(ReadRequest {
            size: 1024,
            callback: Some(Box::new(move |result| {
                read_tx.send(result).unwrap();
            })),
        })
        .unwrap();

    let read = read_rx.recv_timeout(TIMEOUT).unwrap();
    assert!(read.success);
    assert_eq!(read.buffer, b"again");

    client.disconnect(true);
    server.stop(true, true);
}

#[test]
fn client_disconnect_is_idempotent() {
    let io = service();
    let server = start_echo_server(&io, 3811);

    // Disconnecting a never-connected client is a no-op.
    let fresh = TcpClient::with_io_service(Arc::clone(&io));
    fresh.disconnect(true);
    assert!(!fresh.is_connected());

    let client = TcpClient::with_io_service(Arc::clone(&io));
    client.connect("127.0.0.1", 3811, 1000).unwrap();
    assert!(client.is_connected());

    client.disconnect(true);
    assert!(!client.is_connected());

    // Only the first call acts; repeats must not panic, double-close or
    // double-untrack.
    client.disconnect(true);
    client.disconnect(false);
    assert!(!client.is_connected());

    // The client remains usable afterwards.
    client.connect("127.0.0.1", 3811, 1000).unwrap();
    assert!(client.is_connected());

    client.disconnect(true);
    server.stop(true, true);
}

#[test]
fn adopted_clients_start_connected() {
    let io = service();
    let server = TcpServer::with_io_service(Arc::clone(&io));
    let (tx, rx) = mpsc::channel();
    server
        .start("127.0.0.1", 3809, move |client| {
            tx.send(client.is_connected()).unwrap();
            false
        })
        .unwrap();

    let client = TcpClient::with_io_service(Arc::clone(&io));
    client.connect("127.0.0.1", 3809, 1000).unwrap();

    assert!(rx.recv_timeout(TIMEOUT).unwrap());

    client.disconnect(true);
    server.stop(true, true);
}

#[test]
fn server_rejects_double_start_and_stops_idempotently() {
    let io = service();
    let server = TcpServer::with_io_service(Arc::clone(&io));
    server.start("127.0.0.1", 3810, |_client| false).unwrap();
    assert!(server.is_running());
    assert!(server.start("127.0.0.1", 3810, |_client| false).is_err());

    server.stop(true, true);
    assert!(!server.is_running());
    server.stop(true, true);

    // A stopped server can be started again.
    server.start("127.0.0.1", 3810, |_client| false).unwrap();
    assert!(server.is_running());
    server.stop(true, true);
}
