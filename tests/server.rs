//! End-to-end server tests over real sockets: a `Server` runs on its own
//! thread with a dynamic port while the test speaks literal HTTP/1.1
//! through `std::net::TcpStream`.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use ember::{Bytes, Options, Server};

/// Starts a configured server on a background thread, returns its port.
fn serve<F>(ttl: u64, setup: F) -> u16
where
    F: FnOnce(&mut Server) + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut server =
            Server::open(Options::new().service("dynamic").ttl(ttl)).expect("server opens");
        setup(&mut server);
        tx.send(server.port()).expect("port reported");
        let _ = server.run();
    });
    rx.recv().expect("server started")
}

fn connect(port: u16) -> TcpStream {
    let stream = TcpStream::connect(("127.0.0.1", port)).expect("connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
}

struct Response {
    status_line: String,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Response {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Reads exactly one response (status line, headers, `Content-Length`
/// body) off the stream, leaving anything behind it unread.
fn read_response(stream: &mut TcpStream) -> Response {
    let mut raw = Vec::new();
    let mut byte = [0u8; 1];
    while !raw.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte) {
            Ok(1) => raw.push(byte[0]),
            other => panic!("header read ended early: {:?} after {} bytes", other, raw.len()),
        }
    }
    let head = String::from_utf8(raw[..raw.len() - 4].to_vec()).expect("ascii head");
    let mut lines = head.split("\r\n");
    let status_line = lines.next().expect("status line").to_owned();
    let headers: Vec<(String, String)> = lines
        .filter_map(|line| {
            line.split_once(": ")
                .map(|(n, v)| (n.to_owned(), v.to_owned()))
        })
        .collect();

    let length: usize = headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case("Content-Length"))
        .map(|(_, v)| v.parse().expect("numeric length"))
        .unwrap_or(0);
    let mut body = vec![0u8; length];
    stream.read_exact(&mut body).expect("body");

    Response {
        status_line,
        headers,
        body,
    }
}

#[test]
fn minimal_get() {
    let port = serve(10, |server| {
        server
            .route("/welcome", |_ex| Some(Bytes::from_static(b"Hi!")))
            .unwrap();
    });
    let mut stream = connect(port);
    stream
        .write_all(b"GET /welcome HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let response = read_response(&mut stream);
    assert_eq!(response.status_line, "HTTP/1.1 200 OK");
    assert_eq!(response.header("Content-Length"), Some("3"));
    assert!(response.header("Date").unwrap().ends_with(" GMT"));
    assert_eq!(response.body, b"Hi!");
}

#[test]
fn query_parameters_are_decoded() {
    let port = serve(10, |server| {
        server
            .route_prefix("/echo", |ex| {
                let what = ex.parameter("what").unwrap_or("missing").to_owned();
                Some(Bytes::from(what))
            })
            .unwrap();
    });
    let mut stream = connect(port);
    stream
        .write_all(b"GET /echo?what=hello%20world HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let response = read_response(&mut stream);
    assert_eq!(response.status_line, "HTTP/1.1 200 OK");
    assert_eq!(response.body, b"hello world");
}

#[test]
fn unrouted_uri_gets_404_and_close() {
    let port = serve(10, |server| {
        server
            .route_prefix("/a", |_ex| Some(Bytes::from_static(b"a")))
            .unwrap();
    });
    let mut stream = connect(port);
    stream
        .write_all(b"GET /z HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let response = read_response(&mut stream);
    assert_eq!(response.status_line, "HTTP/1.1 404 Not found");
    assert_eq!(response.header("Connection"), Some("Closed"));
    // The server hangs up after the error reply drains.
    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).expect("clean close");
    assert!(rest.is_empty());
}

#[test]
fn path_traversal_closes_without_reply() {
    let port = serve(10, |server| {
        server
            .route_prefix("/static", |_ex| Some(Bytes::from_static(b"file")))
            .unwrap();
    });
    let mut stream = connect(port);
    stream
        .write_all(b"GET /static/../etc/passwd HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).expect("closed");
    assert!(rest.is_empty(), "no HTTP reply expected, got {:?}", rest);
}

#[test]
fn chunked_request_body_is_decoded() {
    let port = serve(10, |server| {
        server
            .route("/p", |ex| {
                let body = ex.body().expect("chunked body").to_vec();
                Some(Bytes::from(body))
            })
            .unwrap();
    });
    let mut stream = connect(port);
    stream
        .write_all(
            b"POST /p HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n",
        )
        .unwrap();
    let response = read_response(&mut stream);
    assert_eq!(response.status_line, "HTTP/1.1 200 OK");
    assert_eq!(response.header("Content-Length"), Some("9"));
    assert_eq!(response.body, b"Wikipedia");
}

#[test]
fn chunked_body_split_across_writes() {
    let port = serve(10, |server| {
        server
            .route("/p", |ex| ex.body().map(Bytes::copy_from_slice))
            .unwrap();
    });
    let mut stream = connect(port);
    stream
        .write_all(b"POST /p HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWi")
        .unwrap();
    stream.flush().unwrap();
    thread::sleep(Duration::from_millis(100));
    stream.write_all(b"ki\r\n0\r\n\r\n").unwrap();
    let response = read_response(&mut stream);
    assert_eq!(response.body, b"Wiki");
}

#[test]
fn pipelined_requests_answered_in_order() {
    let port = serve(10, |server| {
        server
            .route("/first", |_ex| Some(Bytes::from_static(b"one")))
            .unwrap();
        server
            .route("/second", |_ex| Some(Bytes::from_static(b"two")))
            .unwrap();
    });
    let mut stream = connect(port);
    stream
        .write_all(
            b"GET /first HTTP/1.1\r\nHost: x\r\nConnection: keep-alive\r\n\r\nGET /second HTTP/1.1\r\nHost: x\r\nConnection: keep-alive\r\n\r\n",
        )
        .unwrap();
    let first = read_response(&mut stream);
    assert_eq!(first.status_line, "HTTP/1.1 200 OK");
    assert_eq!(first.header("Connection"), Some("keep-alive"));
    assert_eq!(first.body, b"one");
    let second = read_response(&mut stream);
    assert_eq!(second.body, b"two");

    // The connection survived both; a third request still works.
    stream
        .write_all(b"GET /first HTTP/1.1\r\nHost: x\r\nConnection: keep-alive\r\n\r\n")
        .unwrap();
    assert_eq!(read_response(&mut stream).body, b"one");
}

#[test]
fn content_length_body_is_delivered() {
    let port = serve(10, |server| {
        server
            .route("/sum", |ex| {
                let total: u32 = ex
                    .body()
                    .unwrap_or(b"")
                    .iter()
                    .map(|&b| u32::from(b - b'0'))
                    .sum();
                Some(Bytes::from(total.to_string()))
            })
            .unwrap();
    });
    let mut stream = connect(port);
    stream
        .write_all(b"POST /sum HTTP/1.1\r\nHost: x\r\nContent-Length: 4\r\n\r\n1234")
        .unwrap();
    assert_eq!(read_response(&mut stream).body, b"10");
}

#[test]
fn body_and_queued_segments_precede_file_bytes() {
    let path = std::env::temp_dir().join(format!("ember-transfer-{}.dat", std::process::id()));
    std::fs::write(&path, b"FILEBYTES").unwrap();
    let handler_path = path.clone();
    let port = serve(10, move |server| {
        server
            .route("/file", move |ex| {
                let file = std::fs::File::open(&handler_path).expect("transfer file");
                ex.queue(Bytes::from_static(b"def"));
                ex.transfer(file, 9);
                Some(Bytes::from_static(b"abc"))
            })
            .unwrap();
    });
    let mut stream = connect(port);
    stream
        .write_all(b"GET /file HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let response = read_response(&mut stream);
    assert_eq!(response.header("Content-Length"), Some("15"));
    assert_eq!(response.body, b"abcdefFILEBYTES");
    let _ = std::fs::remove_file(&path);
}

#[test]
fn asynchronous_route_streams_body_to_file() {
    let path = std::env::temp_dir().join(format!("ember-upload-{}.dat", std::process::id()));
    let body = b"0123456789012345678901234567890123456789"; // 40 bytes
    let sink = path.clone();
    let port = serve(10, move |server| {
        let id = server
            .route("/upload", |_ex| Some(Bytes::from_static(b"stored")))
            .unwrap();
        server
            .asynchronous_route(id, move |ex| {
                let length = ex
                    .header("Content-Length")
                    .and_then(|v| v.parse::<u64>().ok())
                    .expect("upload has a length");
                let file = std::fs::File::create(&sink).expect("sink file");
                ex.transfer(file, length);
                None
            })
            .unwrap();
    });
    let mut stream = connect(port);
    // Headers first; the body trickles in afterwards.
    stream
        .write_all(b"POST /upload HTTP/1.1\r\nHost: x\r\nContent-Length: 40\r\n\r\n")
        .unwrap();
    stream.flush().unwrap();
    thread::sleep(Duration::from_millis(200));
    stream.write_all(&body[..25]).unwrap();
    stream.flush().unwrap();
    thread::sleep(Duration::from_millis(100));
    stream.write_all(&body[25..]).unwrap();

    let response = read_response(&mut stream);
    assert_eq!(response.status_line, "HTTP/1.1 200 OK");
    assert_eq!(response.body, b"stored");
    assert_eq!(std::fs::read(&path).unwrap(), body);
    let _ = std::fs::remove_file(&path);
}

#[test]
fn protect_hook_short_circuits() {
    let port = serve(10, |server| {
        let id = server
            .route("/guarded", |_ex| Some(Bytes::from_static(b"secret")))
            .unwrap();
        server
            .protect(id, |ex| {
                if ex.header("X-Token") != Some("open-sesame") {
                    ex.error(403, "Forbidden");
                }
            })
            .unwrap();
    });

    let mut stream = connect(port);
    stream
        .write_all(b"GET /guarded HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let denied = read_response(&mut stream);
    assert_eq!(denied.status_line, "HTTP/1.1 403 Forbidden");

    let mut stream = connect(port);
    stream
        .write_all(b"GET /guarded HTTP/1.1\r\nHost: x\r\nX-Token: open-sesame\r\n\r\n")
        .unwrap();
    let allowed = read_response(&mut stream);
    assert_eq!(allowed.body, b"secret");
}

#[test]
fn invalid_request_line_gets_406() {
    let port = serve(10, |server| {
        server
            .route("/x", |_ex| Some(Bytes::from_static(b"x")))
            .unwrap();
    });
    let mut stream = connect(port);
    stream.write_all(b"BROKEN\r\nHost: x\r\n\r\n").unwrap();
    let response = read_response(&mut stream);
    assert!(
        response.status_line.starts_with("HTTP/1.1 406 "),
        "{}",
        response.status_line
    );
}

#[test]
fn idle_connection_is_pruned() {
    let port = serve(1, |server| {
        server
            .route("/x", |_ex| Some(Bytes::from_static(b"x")))
            .unwrap();
    });
    let mut stream = connect(port);
    // No traffic at all: the deadline passes and the server closes.
    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).expect("pruned");
    assert!(rest.is_empty());
}

#[test]
fn redirect_helpers_use_current_codes() {
    let port = serve(10, |server| {
        server
            .route("/old", |ex| {
                ex.redirect("/new");
                None
            })
            .unwrap();
        server
            .route("/gone", |ex| {
                ex.permanent_redirect("/new");
                None
            })
            .unwrap();
    });

    let mut stream = connect(port);
    stream
        .write_all(b"GET /old HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let temporary = read_response(&mut stream);
    assert_eq!(temporary.status_line, "HTTP/1.1 307 Temporary Redirect");
    assert_eq!(temporary.header("Location"), Some("/new"));

    let mut stream = connect(port);
    stream
        .write_all(b"GET /gone HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let permanent = read_response(&mut stream);
    assert_eq!(permanent.status_line, "HTTP/1.1 308 Redirected permanently");
}
