use std::cell::RefCell;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

// "Sun, 06 Nov 1994 08:49:37 GMT".len()
pub(crate) const DATE_VALUE_LENGTH: usize = 29;

/// Returns the current `Date` header value (RFC 7231 IMF-fixdate).
pub(crate) fn now() -> String {
    CACHED.with(|cache| {
        String::from_utf8_lossy(cache.borrow_mut().check()).into_owned()
    })
}

struct CachedDate {
    bytes: [u8; DATE_VALUE_LENGTH],
    next_update: u64,
}

thread_local!(static CACHED: RefCell<CachedDate> = RefCell::new(CachedDate::new()));

impl CachedDate {
    fn new() -> Self {
        let mut cache = CachedDate {
            bytes: [0; DATE_VALUE_LENGTH],
            next_update: 0,
        };
        cache.update(SystemTime::now());
        cache
    }

    fn check(&mut self) -> &[u8] {
        let now = SystemTime::now();
        let secs = now
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::from_secs(0))
            .as_secs();
        if secs >= self.next_update {
            self.update(now);
        }
        &self.bytes[..]
    }

    fn update(&mut self, now: SystemTime) {
        let formatted = httpdate::fmt_http_date(now);
        debug_assert_eq!(formatted.len(), DATE_VALUE_LENGTH);
        self.bytes.copy_from_slice(formatted.as_bytes());
        self.next_update = now
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::from_secs(0))
            .as_secs()
            + 1;
    }
}
