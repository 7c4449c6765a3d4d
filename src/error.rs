//! Error and Result module.

use std::error::Error as StdError;
use std::fmt;

/// Result type often returned from methods that can have ember `Error`s.
pub type Result<T> = std::result::Result<T, Error>;

type Cause = Box<dyn StdError + Send + Sync>;

/// Represents errors that can occur while setting up or driving HTTP
/// connections.
///
/// Note that connection-level failures (a peer resetting the socket, a
/// malformed request) do not surface as `Error`: the loop closes the
/// offending connection with a logged reason and keeps running. `Error` is
/// reserved for operations the caller invoked directly.
pub struct Error {
    inner: Box<ErrorImpl>,
}

struct ErrorImpl {
    kind: Kind,
    cause: Option<Cause>,
}

#[derive(Debug)]
pub(crate) enum Kind {
    Parse(Parse),
    /// Error creating the listening socket.
    Listen,
    /// Error occurred while connecting.
    Connect,
    /// An `io::Error` while reading or writing a network stream.
    Io,
    /// TLS could not be set up for an outbound connection.
    Tls,
    /// A fixed-capacity table (slots, routes) is full.
    Capacity,
    /// The slot or route addressed by the caller no longer exists.
    Stale,
    /// A client URL did not start with `http://` or `https://`.
    UnsupportedScheme,
    /// A redirect response carried no usable `Location`.
    Redirect,
}

#[derive(Debug)]
pub(crate) enum Parse {
    Uri,
    TooLarge,
}

impl Error {
    /// Returns true if this was caused by a parse error.
    pub fn is_parse(&self) -> bool {
        matches!(self.inner.kind, Kind::Parse(_))
    }

    /// Returns true if the input exceeded a fixed buffer or table.
    pub fn is_too_large(&self) -> bool {
        matches!(
            self.inner.kind,
            Kind::Parse(Parse::TooLarge) | Kind::Capacity
        )
    }

    /// Returns true if this error came from opening an outbound connection.
    pub fn is_connect(&self) -> bool {
        matches!(self.inner.kind, Kind::Connect)
    }

    /// Returns true if this error came from the TLS layer.
    pub fn is_tls(&self) -> bool {
        matches!(self.inner.kind, Kind::Tls)
    }

    pub(crate) fn new(kind: Kind) -> Error {
        Error {
            inner: Box::new(ErrorImpl { kind, cause: None }),
        }
    }

    pub(crate) fn with<C: Into<Cause>>(mut self, cause: C) -> Error {
        self.inner.cause = Some(cause.into());
        self
    }

    pub(crate) fn new_listen<C: Into<Cause>>(cause: C) -> Error {
        Error::new(Kind::Listen).with(cause)
    }

    pub(crate) fn new_connect<C: Into<Cause>>(cause: C) -> Error {
        Error::new(Kind::Connect).with(cause)
    }

    pub(crate) fn new_io(cause: std::io::Error) -> Error {
        Error::new(Kind::Io).with(cause)
    }

    pub(crate) fn new_tls<C: Into<Cause>>(cause: C) -> Error {
        Error::new(Kind::Tls).with(cause)
    }

    pub(crate) fn new_capacity() -> Error {
        Error::new(Kind::Capacity)
    }

    pub(crate) fn new_too_large() -> Error {
        Error::new(Kind::Parse(Parse::TooLarge))
    }

    pub(crate) fn new_stale() -> Error {
        Error::new(Kind::Stale)
    }

    pub(crate) fn new_scheme() -> Error {
        Error::new(Kind::UnsupportedScheme)
    }

    pub(crate) fn new_redirect() -> Error {
        Error::new(Kind::Redirect)
    }

    pub(crate) fn new_uri() -> Error {
        Error::new(Kind::Parse(Parse::Uri))
    }

    fn description(&self) -> &str {
        match self.inner.kind {
            Kind::Parse(Parse::Uri) => "invalid URI",
            Kind::Parse(Parse::TooLarge) => "message too large",
            Kind::Listen => "error creating server listener",
            Kind::Connect => "error connecting",
            Kind::Io => "connection error",
            Kind::Tls => "TLS error",
            Kind::Capacity => "capacity exhausted",
            Kind::Stale => "connection or route no longer exists",
            Kind::UnsupportedScheme => "unsupported URL scheme",
            Kind::Redirect => "redirect without a location",
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_tuple("ember::Error");
        f.field(&self.inner.kind);
        if let Some(ref cause) = self.inner.cause {
            f.field(cause);
        }
        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .cause
            .as_ref()
            .map(|cause| &**cause as &(dyn StdError + 'static))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_size_of() {
        assert_eq!(
            std::mem::size_of::<Error>(),
            std::mem::size_of::<usize>()
        );
    }

    #[test]
    fn predicates() {
        assert!(Error::new_capacity().is_too_large());
        assert!(Error::new_too_large().is_parse());
        assert!(Error::new_connect("refused").is_connect());
        assert!(!Error::new_tls("handshake").is_connect());
    }
}
