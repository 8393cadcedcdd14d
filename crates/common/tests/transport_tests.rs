//! Integration tests for the TCP line transport
//!
//! Tests the socket roles end to end over loopback:
//! - publisher fan-out and dead-subscriber eviction
//! - inbox in bind and connect mode
//! - request/reply turn-taking
//!
//! Run with: cargo test -p common --test transport_tests

use common::test_utils::wait_until;
use common::transport::{DEFAULT_POLL_INTERVAL, resolve};
use common::{Inbox, Publisher, Received, ReplySocket, Requester, Subscriber};
use protocol::{RawRecord, StandardResponse, SubscribeRequest, decode_line, encode_line};
use std::io::Write;
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(2);

mod publisher {
    use super::*;

    #[test]
    fn test_fan_out_to_every_subscriber() {
        let mut publisher = Publisher::bind("127.0.0.1:0").unwrap();
        let addr = publisher.local_addr();

        let mut first = Subscriber::connect(addr, TIMEOUT).unwrap();
        let mut second = Subscriber::connect(addr, TIMEOUT).unwrap();

        let delivered = publisher.send(&RawRecord::new("$GPGGA,1")).unwrap();
        assert_eq!(delivered, 2);

        let a: RawRecord = first.recv_record().unwrap().unwrap();
        let b: RawRecord = second.recv_record().unwrap().unwrap();
        assert_eq!(a.data, "$GPGGA,1");
        assert_eq!(b.data, "$GPGGA,1");
    }

    #[test]
    fn test_dead_subscriber_is_dropped() {
        let mut publisher = Publisher::bind("127.0.0.1:0").unwrap();
        let addr = publisher.local_addr();

        let subscriber = Subscriber::connect(addr, TIMEOUT).unwrap();
        assert_eq!(publisher.poll_subscribers(), 1);
        drop(subscriber);

        // The first write after a peer reset may still succeed; keep sending
        // until the kernel reports the broken pipe.
        let dropped = wait_until(TIMEOUT, || {
            publisher.send_line(r#"{"data":"x"}"#).unwrap() == 0
        });
        assert!(dropped);
    }

    #[test]
    fn test_records_arrive_in_order() {
        let mut publisher = Publisher::bind("127.0.0.1:0").unwrap();
        let mut subscriber = Subscriber::connect(publisher.local_addr(), TIMEOUT).unwrap();

        for i in 0..20 {
            publisher.send(&RawRecord::new(format!("frame-{}", i))).unwrap();
        }
        for i in 0..20 {
            let record: RawRecord = subscriber.recv_record().unwrap().unwrap();
            assert_eq!(record.data, format!("frame-{}", i));
        }
    }
}

mod inbox {
    use super::*;

    #[test]
    fn test_bind_mode_accepts_controller() {
        let mut inbox = Inbox::bind("127.0.0.1:0", DEFAULT_POLL_INTERVAL).unwrap();
        let addr = inbox.local_addr().unwrap();

        let mut controller = TcpStream::connect(addr).unwrap();
        controller.write_all(b"{\"data\":\"AT\"}\n").unwrap();

        let mut received = None;
        assert!(wait_until(TIMEOUT, || match inbox.recv().unwrap() {
            Received::Line(line) => {
                received = Some(line);
                true
            }
            _ => false,
        }));
        let record: RawRecord = decode_line(&received.unwrap()).unwrap();
        assert_eq!(record.data, "AT");
    }

    #[test]
    fn test_bind_mode_reports_peer_close_then_accepts_again() {
        let mut inbox = Inbox::bind("127.0.0.1:0", DEFAULT_POLL_INTERVAL).unwrap();
        let addr = inbox.local_addr().unwrap();

        let first = TcpStream::connect(addr).unwrap();
        assert!(wait_until(TIMEOUT, || {
            inbox.recv().unwrap();
            inbox.is_connected()
        }));
        drop(first);
        assert!(wait_until(TIMEOUT, || inbox.recv().unwrap() == Received::Closed));
        assert!(!inbox.is_connected());

        let mut second = TcpStream::connect(addr).unwrap();
        second.write_all(b"{\"data\":\"again\"}\n").unwrap();
        assert!(wait_until(TIMEOUT, || matches!(
            inbox.recv().unwrap(),
            Received::Line(_)
        )));
    }

    #[test]
    fn test_connect_mode_reaches_controller() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let controller = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream.write_all(b"{\"data\":\"from controller\"}\n").unwrap();
            thread::sleep(Duration::from_millis(200));
        });

        let mut inbox = Inbox::connect(addr, DEFAULT_POLL_INTERVAL);
        let mut line = None;
        assert!(wait_until(TIMEOUT, || {
            if let Received::Line(l) = inbox.recv().unwrap() {
                line = Some(l);
            }
            line.is_some()
        }));
        let record: RawRecord = decode_line(&line.unwrap()).unwrap();
        assert_eq!(record.data, "from controller");
        controller.join().unwrap();
    }
}

mod request_reply {
    use super::*;

    #[test]
    fn test_one_reply_per_request() {
        let socket = ReplySocket::bind("127.0.0.1:0", Duration::from_millis(20)).unwrap();
        let addr = socket.local_addr().unwrap();

        let server = thread::spawn(move || {
            let mut conn = loop {
                if let Some(conn) = socket.accept().unwrap() {
                    break conn;
                }
            };
            let mut served = 0;
            while served < 2 {
                match conn.recv().unwrap() {
                    Received::Line(line) => {
                        let req: SubscribeRequest = decode_line(&line).unwrap();
                        let reply = if req.subscribe {
                            StandardResponse::ok()
                        } else {
                            StandardResponse::failure("unsubscribed")
                        };
                        conn.reply(&encode_line(&reply).unwrap()).unwrap();
                        served += 1;
                    }
                    Received::Timeout => continue,
                    Received::Closed => break,
                }
            }
            served
        });

        let mut requester = Requester::connect(addr, TIMEOUT).unwrap();
        let first: StandardResponse = requester
            .request(&SubscribeRequest { subscribe: true })
            .unwrap();
        assert!(first.success);

        let second: StandardResponse = requester
            .request(&SubscribeRequest { subscribe: false })
            .unwrap();
        assert!(!second.success);
        assert_eq!(second.message.as_deref(), Some("unsubscribed"));

        assert_eq!(server.join().unwrap(), 2);
    }

    #[test]
    fn test_requester_times_out_without_reply() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let holder = thread::spawn(move || {
            let (_stream, _) = listener.accept().unwrap();
            thread::sleep(Duration::from_millis(300));
        });

        let mut requester = Requester::connect(addr, Duration::from_millis(50)).unwrap();
        let result = requester.request_line(r#"{"subscribe":true}"#);
        assert!(matches!(result, Err(common::Error::Timeout(_))));
        holder.join().unwrap();
    }

    #[test]
    fn test_resolve_localhost() {
        let addr = resolve(("127.0.0.1", 10000)).unwrap();
        assert_eq!(addr.port(), 10000);
    }
}
