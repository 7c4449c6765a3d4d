//! Command-line option handling for the HTTP and TLS layers.
//!
//! Applications hand their argument list to [`Options::parse`]; the options
//! this library consumes are absorbed and the rest is returned untouched.
//! Both the `-name[=value]` and `--name[=value]` spellings are accepted.
//! [`Options::default_arg`] lets an application override the built-in
//! defaults before parsing the real command line.

use std::path::PathBuf;

/// Matches `input` against a reference option like `-http-service=`.
///
/// Returns the value following the `=` on a match. References not ending
/// in `=` match only the bare flag and yield an empty value.
pub fn option_match<'a>(reference: &str, input: &'a str) -> Option<&'a str> {
    // Accept --name for a -name reference.
    let input = if input.starts_with("--") && !reference.starts_with("--") {
        &input[1..]
    } else {
        input
    };
    if reference.ends_with('=') {
        input.strip_prefix(reference)
    } else if input == reference {
        Some("")
    } else {
        None
    }
}

/// True when `input` is exactly the flag `reference` (either spelling).
pub fn option_present(reference: &str, input: &str) -> bool {
    option_match(reference, input) == Some("")
}

/// Usage lines for the options the core consumes. `level` 0 is the
/// one-line summary; higher levels describe one option each until `None`.
pub fn help(level: usize) -> Option<&'static str> {
    const HELP: &[&str] = &[
        " [-http-service=NAME] [-http-ttl=SECONDS] [-http-debug] [-tls-certs=PATH] [-tls-debug]",
        "-http-service=NAME:  name or port number for the HTTP socket (http), or 'dynamic'.",
        "-http-ttl=SECONDS:   idle connection time-to-live (10, 0 disables pruning).",
        "-http-debug:         enable debug traces.",
        "-tls-certs=PATH:     CA certificate bundle or directory (/etc/ssl/certs).",
        "-tls-debug:          enable TLS debug traces.",
    ];
    HELP.get(level).copied()
}

/// Startup configuration, typically filled from the command line.
#[derive(Debug, Clone)]
pub struct Options {
    pub(crate) service: String,
    pub(crate) ttl: u64,
    pub(crate) debug: bool,
    pub(crate) tls_certs: PathBuf,
    pub(crate) tls_debug: bool,
}

impl Options {
    /// Built-in defaults: service `http`, 10 second idle TTL, CA
    /// certificates from `/etc/ssl/certs`.
    pub fn new() -> Options {
        Options {
            service: "http".to_owned(),
            ttl: 10,
            debug: false,
            tls_certs: PathBuf::from("/etc/ssl/certs"),
            tls_debug: false,
        }
    }

    /// Service name, numeric port, or `dynamic`.
    pub fn service(mut self, service: &str) -> Options {
        self.service = service.to_owned();
        self
    }

    /// Idle TTL in seconds; 0 disables pruning.
    pub fn ttl(mut self, ttl: u64) -> Options {
        self.ttl = ttl;
        self
    }

    /// Applies one argument in command-line syntax, overriding a default.
    /// Unrecognized arguments are ignored. Must be used before the server
    /// is opened.
    pub fn default_arg(&mut self, arg: &str) {
        self.absorb(arg);
    }

    /// Consumes the recognized options from `args` and returns whatever is
    /// left, preserving order.
    pub fn parse<I>(&mut self, args: I) -> Vec<String>
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let mut rest = Vec::new();
        for arg in args {
            let arg = arg.into();
            if !self.absorb(&arg) {
                rest.push(arg);
            }
        }
        rest
    }

    fn absorb(&mut self, arg: &str) -> bool {
        if let Some(value) = option_match("-http-service=", arg) {
            self.service = value.to_owned();
            return true;
        }
        if let Some(value) = option_match("-http-ttl=", arg) {
            // Negative values clamp to 0 (pruning disabled).
            self.ttl = value.parse::<i64>().unwrap_or(0).max(0) as u64;
            return true;
        }
        if option_present("-http-debug", arg) {
            self.debug = true;
            return true;
        }
        if let Some(value) = option_match("-tls-certs=", arg) {
            self.tls_certs = PathBuf::from(value);
            return true;
        }
        if option_present("-tls-debug", arg) {
            self.tls_debug = true;
            return true;
        }
        false
    }
}

impl Default for Options {
    fn default() -> Options {
        Options::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn match_both_spellings() {
        assert_eq!(option_match("-http-service=", "-http-service=8080"), Some("8080"));
        assert_eq!(option_match("-http-service=", "--http-service=8080"), Some("8080"));
        assert_eq!(option_match("-http-service=", "-http-services=1"), None);
        assert!(option_present("-http-debug", "--http-debug"));
        assert!(!option_present("-http-debug", "-http-debug=yes"));
    }

    #[test]
    fn parse_strips_known_options() {
        let mut options = Options::new();
        let rest = options.parse(vec![
            "prog",
            "-http-service=dynamic",
            "--http-ttl=30",
            "-other",
            "-http-debug",
        ]);
        assert_eq!(rest, ["prog", "-other"]);
        assert_eq!(options.service, "dynamic");
        assert_eq!(options.ttl, 30);
        assert!(options.debug);
    }

    #[test]
    fn negative_ttl_clamps_to_zero() {
        let mut options = Options::new();
        options.parse(vec!["-http-ttl=-5"]);
        assert_eq!(options.ttl, 0);
    }

    #[test]
    fn default_arg_preseeds() {
        let mut options = Options::new();
        options.default_arg("-tls-certs=/tmp/certs");
        options.default_arg("-tls-debug");
        assert_eq!(options.tls_certs, PathBuf::from("/tmp/certs"));
        assert!(options.tls_debug);
    }

    #[test]
    fn help_levels() {
        assert!(help(0).unwrap().contains("-http-service"));
        assert!(help(6).is_none());
    }
}
