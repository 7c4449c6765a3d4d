//! Client-side tests: outbound requests ride the same loop as the
//! server, so each test runs a server whose background hook originates
//! the request against itself and reports back over a channel.

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use ember::{Bytes, ClientResponse, Options, Server};

type Report = (u16, Vec<u8>);

/// Runs `setup` on a fresh server in its own thread and hands back the
/// channel the test callbacks report through.
fn run_with<F>(setup: F) -> mpsc::Receiver<Report>
where
    F: FnOnce(&mut Server, mpsc::Sender<Report>) + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut server =
            Server::open(Options::new().service("dynamic").ttl(10)).expect("server opens");
        setup(&mut server, tx);
        let _ = server.run();
    });
    rx
}

fn recv(rx: &mpsc::Receiver<Report>) -> Report {
    rx.recv_timeout(Duration::from_secs(10)).expect("report")
}

#[test]
fn roundtrip_to_own_server() {
    let rx = run_with(|server, tx| {
        server
            .route("/ping", |_ex| Some(Bytes::from_static(b"pong")))
            .unwrap();
        let started = std::cell::Cell::new(false);
        server.background(move |scope| {
            if started.replace(true) {
                return;
            }
            let url = format!("http://127.0.0.1:{}/ping", scope.port());
            let tx = tx.clone();
            let request = scope.client("GET", &url).expect("client opens");
            request
                .submit(b"", move |response| {
                    let _ = tx.send((response.status(), response.body().to_vec()));
                })
                .expect("submit");
        });
    });
    assert_eq!(recv(&rx), (200, b"pong".to_vec()));
}

#[test]
fn redirect_chain_reports_only_the_final_response() {
    // The callback re-submits through `redirected` until a non-redirect
    // arrives, carrying the original request headers along.
    fn follow(tx: mpsc::Sender<Report>) -> Box<dyn FnOnce(&mut ClientResponse<'_>)> {
        Box::new(move |response| match response.redirected("GET") {
            Ok(Some(request)) => {
                request.submit(b"", follow(tx)).expect("resubmit");
            }
            Ok(None) => {
                let _ = tx.send((response.status(), response.body().to_vec()));
            }
            Err(_) => {
                let _ = tx.send((500, Vec::new()));
            }
        })
    }

    let rx = run_with(|server, tx| {
        server
            .route("/a", |ex| {
                ex.error(302, "Found");
                ex.set_header("Location", "/b");
                None
            })
            .unwrap();
        server
            .route("/b", |ex| {
                // The redirected request must still carry the header the
                // original was given.
                match ex.header("X-Origin") {
                    Some("first") => Some(Bytes::from_static(b"OK")),
                    _ => Some(Bytes::from_static(b"lost headers")),
                }
            })
            .unwrap();

        let started = std::cell::Cell::new(false);
        server.background(move |scope| {
            if started.replace(true) {
                return;
            }
            let url = format!("http://127.0.0.1:{}/a", scope.port());
            let mut request = scope.client("GET", &url).expect("client opens");
            request.header("X-Origin", "first");
            request.submit(b"", follow(tx.clone())).expect("submit");
        });
    });

    assert_eq!(recv(&rx), (200, b"OK".to_vec()));
    // Exactly one report: the intermediate 302 never reaches the test.
    assert!(rx.recv_timeout(Duration::from_secs(1)).is_err());
}

#[test]
fn see_other_forces_get() {
    fn follow(tx: mpsc::Sender<Report>) -> Box<dyn FnOnce(&mut ClientResponse<'_>)> {
        Box::new(move |response| match response.redirected("POST") {
            Ok(Some(request)) => {
                request.submit(b"", follow(tx)).expect("resubmit");
            }
            Ok(None) => {
                let _ = tx.send((response.status(), response.body().to_vec()));
            }
            Err(_) => {
                let _ = tx.send((500, Vec::new()));
            }
        })
    }

    let rx = run_with(|server, tx| {
        server
            .route("/submit", |ex| {
                ex.error(303, "See Other");
                ex.set_header("Location", "/result");
                None
            })
            .unwrap();
        server
            .route("/result", |ex| Some(Bytes::from(ex.method().to_owned())))
            .unwrap();

        let started = std::cell::Cell::new(false);
        server.background(move |scope| {
            if started.replace(true) {
                return;
            }
            let url = format!("http://127.0.0.1:{}/submit", scope.port());
            let request = scope.client("POST", &url).expect("client opens");
            request.submit(b"payload", follow(tx.clone())).expect("submit");
        });
    });

    assert_eq!(recv(&rx), (200, b"GET".to_vec()));
}

#[test]
fn dead_connection_reports_505() {
    // Reserve a port nothing listens on.
    let unused = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let dead_port = unused.local_addr().unwrap().port();
    drop(unused);

    let rx = run_with(move |server, tx| {
        let started = std::cell::Cell::new(false);
        server.background(move |scope| {
            if started.replace(true) {
                return;
            }
            let url = format!("http://127.0.0.1:{}/", dead_port);
            let request = match scope.client("GET", &url) {
                Ok(request) => request,
                Err(_) => {
                    let _ = tx.send((505, Vec::new()));
                    return;
                }
            };
            let tx = tx.clone();
            request
                .submit(b"", move |response| {
                    let _ = tx.send((response.status(), response.body().to_vec()));
                })
                .expect("submit");
        });
    });

    assert_eq!(recv(&rx).0, 505);
}

#[test]
fn handler_can_originate_a_nested_request() {
    let rx = run_with(|server, tx| {
        server
            .route("/inner", |_ex| Some(Bytes::from_static(b"inner-body")))
            .unwrap();
        let inner_tx = tx;
        server
            .route("/outer", move |ex| {
                // The test passes the loop's own port along in a header.
                let port = ex.header("X-Self").expect("test sets X-Self").to_owned();
                let url = format!("http://127.0.0.1:{}/inner", port);
                let tx = inner_tx.clone();
                let request = ex.client("GET", &url).expect("nested client");
                request
                    .submit(b"", move |response| {
                        let _ = tx.send((response.status(), response.body().to_vec()));
                    })
                    .expect("nested submit");
                Some(Bytes::from_static(b"outer-done"))
            })
            .unwrap();

        let started = std::cell::Cell::new(false);
        server.background(move |scope| {
            if started.replace(true) {
                return;
            }
            let port = scope.port();
            let url = format!("http://127.0.0.1:{}/outer", port);
            let mut request = scope.client("GET", &url).expect("client opens");
            request.header("X-Self", &port.to_string());
            request
                .submit(b"", |_response| {})
                .expect("outer submit");
        });
    });

    // The nested request completes even though it was issued mid-handler.
    assert_eq!(recv(&rx), (200, b"inner-body".to_vec()));
}
