#![deny(missing_debug_implementations)]

//! # ember
//!
//! ember is a small HTTP/1.1 server **and** client designed to be embedded
//! in an existing application: one single-threaded event loop drives the
//! listening socket, every accepted peer, every outbound client connection,
//! and any file descriptor the application wants watched, so the whole
//! program can run off one loop with no threads and no locking.
//!
//! ## Server
//!
//! Routes map a URI (exact or by prefix) to a handler. Handlers run on the
//! loop thread, read the request through an [`Exchange`] handle, and return
//! the response body:
//!
//! ```no_run
//! use ember::{Bytes, Options, Server};
//!
//! let mut server = Server::open(Options::new()).unwrap();
//! server.route("/welcome", |_ex| Some(Bytes::from_static(b"Hi!"))).unwrap();
//! server.run().unwrap();
//! ```
//!
//! ## Client
//!
//! Outbound requests share the same loop. The response callback fires once
//! the full response has arrived (or with status 505 if the connection
//! died first):
//!
//! ```no_run
//! # use ember::{Options, Server};
//! # let mut server = Server::open(Options::new()).unwrap();
//! let mut request = server.client("GET", "http://example.com/").unwrap();
//! request.submit(b"", |response| {
//!     println!("status {}", response.status());
//! }).unwrap();
//! server.run().unwrap();
//! ```
//!
//! ## "Low-level"
//!
//! ember is deliberately low-level: no routing macros, no middleware, no
//! compression, no HTTP/2. Handlers must not block; the only way to wait
//! is to return to the loop and let it call back.

pub use crate::client::{ClientRequest, ClientResponse};
pub use crate::error::{Error, Result};
pub use crate::headers::HeaderMap;
pub use crate::options::Options;
pub use crate::routes::RouteId;
pub use crate::server::{Exchange, Scope, Server};
pub use crate::reactor::Watch;

#[doc(no_inline)]
pub use bytes::Bytes;

mod client;
pub mod encoding;
mod error;
mod headers;
pub mod options;
mod proto;
mod reactor;
mod routes;
mod server;
mod tls;
