//! HTTP/1.1 protocol state, shared between the server and client sides of
//! a connection.

pub(crate) mod conn;
pub(crate) mod date;
pub(crate) mod decode;

/// Where a connection is in its current HTTP message.
#[derive(Clone, Copy, PartialEq, Debug)]
pub(crate) enum Phase {
    /// Between messages; the next bytes start a header block.
    Idle,
    /// Headers are parsed, body bytes are still arriving.
    AwaitingBody,
    /// A fatal protocol or policy error; remaining input is discarded
    /// until the connection closes.
    Error,
}

/// Direction of a file transfer attached to a message.
#[derive(Clone, Copy, PartialEq, Debug)]
pub(crate) enum Direction {
    /// Received body bytes are written to the file.
    In,
    /// The file is streamed out as the message body.
    Out,
}
