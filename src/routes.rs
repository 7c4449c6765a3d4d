//! The route table: URI patterns mapped to handlers.
//!
//! Routes are either exact (`/status`) or prefixes (`/static` also matches
//! `/static/css/site.css`). Lookup tries a verbatim match first, then
//! strips trailing path segments one at a time looking for a prefix entry,
//! and finally falls back to a `/` prefix route. The longest matching
//! prefix therefore always wins.

use tracing::{debug, warn};

use crate::headers::signature;
use crate::server::{Handler, ProtectHook};

const BUCKETS: usize = 127;
const MAX_ROUTES: usize = 512;

/// Identifies a registered route.
///
/// `RouteId::GLOBAL` addresses no route; registering a protect hook on it
/// installs the hook that runs before every request.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct RouteId(pub(crate) usize);

impl RouteId {
    /// The pseudo-route addressed to install a global protect hook.
    pub const GLOBAL: RouteId = RouteId(0);
}

#[derive(Clone, Copy, PartialEq, Debug)]
pub(crate) enum Match {
    Exact,
    Prefix,
}

pub(crate) struct RouteEntry {
    pub uri: String,
    pub handler: Handler,
    pub asynchronous: Option<Handler>,
    pub protect: Option<ProtectHook>,
    pub kind: Match,
    signature: u32,
    next: Option<usize>,
}

pub(crate) struct RouteTable {
    /// Index 0 is never a route; ids stay non-zero so `RouteId::GLOBAL`
    /// cannot collide with one.
    entries: Vec<Option<RouteEntry>>,
    buckets: [Option<usize>; BUCKETS],
    pub protect: Option<ProtectHook>,
}

impl RouteTable {
    pub fn new() -> RouteTable {
        let mut entries = Vec::with_capacity(16);
        entries.push(None);
        RouteTable {
            entries,
            buckets: [None; BUCKETS],
            protect: None,
        }
    }

    fn search(&self, uri: &str, signature: u32, kind: Option<Match>) -> Option<usize> {
        let mut cursor = self.buckets[(signature as usize) % BUCKETS];
        while let Some(i) = cursor {
            let entry = self.entries[i].as_ref().expect("chained route exists");
            cursor = entry.next;
            if let Some(kind) = kind {
                if entry.kind != kind {
                    continue;
                }
            }
            if entry.signature == signature && entry.uri == uri {
                return Some(i);
            }
        }
        None
    }

    /// Registers `uri`. Re-adding an existing URI replaces its handler and
    /// returns the existing id.
    pub fn add(&mut self, uri: &str, handler: Handler, kind: Match) -> crate::Result<RouteId> {
        let signature = signature(uri);
        if let Some(i) = self.search(uri, signature, None) {
            debug!("route {} updated", uri);
            let entry = self.entries[i].as_mut().expect("found route exists");
            entry.handler = handler;
            entry.kind = kind;
            return Ok(RouteId(i));
        }

        // Reuse a removed slot before growing; removals are rare, so a
        // linear scan is fine.
        let index = self.entries.iter().skip(1).position(|e| e.is_none());
        let index = match index {
            Some(hole) => hole + 1,
            None if self.entries.len() >= MAX_ROUTES => {
                warn!("too many routes, rejecting {}", uri);
                return Err(crate::Error::new_capacity());
            }
            None => {
                self.entries.push(None);
                self.entries.len() - 1
            }
        };

        let bucket = (signature as usize) % BUCKETS;
        self.entries[index] = Some(RouteEntry {
            uri: uri.to_owned(),
            handler,
            asynchronous: None,
            protect: None,
            kind,
            signature,
            next: self.buckets[bucket],
        });
        self.buckets[bucket] = Some(index);
        Ok(RouteId(index))
    }

    /// Removes `uri` from the table. Unknown URIs are ignored.
    pub fn remove(&mut self, uri: &str) {
        let signature = signature(uri);
        let index = match self.search(uri, signature, None) {
            Some(i) => i,
            None => return,
        };

        // Unlink from the bucket chain.
        let bucket = (signature as usize) % BUCKETS;
        if self.buckets[bucket] == Some(index) {
            self.buckets[bucket] = self.entries[index].as_ref().unwrap().next;
        } else {
            let mut cursor = self.buckets[bucket];
            while let Some(i) = cursor {
                let next = self.entries[i].as_ref().unwrap().next;
                if next == Some(index) {
                    let unlinked = self.entries[index].as_ref().unwrap().next;
                    self.entries[i].as_mut().unwrap().next = unlinked;
                    break;
                }
                cursor = next;
            }
        }
        self.entries[index] = None;
    }

    /// Returns the id of a route registered for exactly `uri`.
    pub fn find(&self, uri: &str) -> Option<RouteId> {
        self.search(uri, signature(uri), None).map(RouteId)
    }

    /// Resolves the route serving `uri`: verbatim match first, then the
    /// longest registered prefix, then `/`.
    pub fn lookup(&self, uri: &str) -> Option<RouteId> {
        if let Some(i) = self.search(uri, signature(uri), None) {
            return Some(RouteId(i));
        }
        let mut prefix = uri;
        while prefix.len() > 1 {
            let cut = match prefix[1..].rfind('/') {
                Some(cut) => cut,
                None => break,
            };
            prefix = &prefix[..cut + 1];
            if let Some(i) = self.search(prefix, signature(prefix), Some(Match::Prefix)) {
                return Some(RouteId(i));
            }
        }
        self.search("/", signature("/"), Some(Match::Prefix))
            .map(RouteId)
    }

    pub fn get(&self, id: RouteId) -> Option<&RouteEntry> {
        self.entries.get(id.0).and_then(|e| e.as_ref())
    }

    /// Installs a protect hook on `id`, or the global hook for
    /// `RouteId::GLOBAL`.
    pub fn set_protect(&mut self, id: RouteId, hook: ProtectHook) -> crate::Result<()> {
        if id == RouteId::GLOBAL {
            self.protect = Some(hook);
            return Ok(());
        }
        match self.entries.get_mut(id.0).and_then(|e| e.as_mut()) {
            Some(entry) => {
                entry.protect = Some(hook);
                Ok(())
            }
            None => Err(crate::Error::new_stale()),
        }
    }

    /// Upgrades `id` to also accept oversized request bodies through the
    /// asynchronous handler.
    pub fn set_asynchronous(&mut self, id: RouteId, handler: Handler) -> crate::Result<()> {
        match self.entries.get_mut(id.0).and_then(|e| e.as_mut()) {
            Some(entry) => {
                entry.asynchronous = Some(handler);
                Ok(())
            }
            None => Err(crate::Error::new_stale()),
        }
    }
}

impl std::fmt::Debug for RouteTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteTable")
            .field("routes", &(self.entries.len() - 1))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    fn nop() -> Handler {
        Rc::new(|_: &mut crate::server::Exchange<'_>| None)
    }

    fn table(routes: &[(&str, Match)]) -> RouteTable {
        let mut t = RouteTable::new();
        for (uri, kind) in routes {
            t.add(uri, nop(), *kind).unwrap();
        }
        t
    }

    fn uri_of(t: &RouteTable, id: RouteId) -> &str {
        &t.get(id).unwrap().uri
    }

    #[test]
    fn longest_prefix_wins() {
        let t = table(&[
            ("/a", Match::Prefix),
            ("/a/b", Match::Prefix),
            ("/a/b/c", Match::Exact),
        ]);
        assert_eq!(uri_of(&t, t.lookup("/a/b/c").unwrap()), "/a/b/c");
        assert_eq!(uri_of(&t, t.lookup("/a/b/c/d").unwrap()), "/a/b");
        assert_eq!(uri_of(&t, t.lookup("/a/x").unwrap()), "/a");
        assert_eq!(t.lookup("/z"), None);
    }

    #[test]
    fn root_prefix_is_the_last_resort() {
        let t = table(&[("/", Match::Prefix), ("/api", Match::Exact)]);
        assert_eq!(uri_of(&t, t.lookup("/anything/else").unwrap()), "/");
        assert_eq!(uri_of(&t, t.lookup("/api").unwrap()), "/api");
    }

    #[test]
    fn exact_routes_do_not_match_children() {
        let t = table(&[("/only", Match::Exact)]);
        assert_eq!(t.lookup("/only/child"), None);
        assert!(t.lookup("/only").is_some());
    }

    #[test]
    fn update_returns_existing_id() {
        let mut t = RouteTable::new();
        let first = t.add("/dup", nop(), Match::Exact).unwrap();
        let second = t.add("/dup", nop(), Match::Exact).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn removed_ids_are_reused() {
        let mut t = RouteTable::new();
        let a = t.add("/a", nop(), Match::Exact).unwrap();
        let _b = t.add("/b", nop(), Match::Exact).unwrap();
        t.remove("/a");
        assert_eq!(t.find("/a"), None);
        let c = t.add("/c", nop(), Match::Exact).unwrap();
        assert_eq!(a, c);
        assert!(t.find("/b").is_some());
    }

    fn quiet() -> crate::server::ProtectHook {
        Rc::new(|_: &mut crate::server::Exchange<'_>| {})
    }

    #[test]
    fn protect_on_global_and_route() {
        let mut t = table(&[("/p", Match::Exact)]);
        let id = t.find("/p").unwrap();
        t.set_protect(RouteId::GLOBAL, quiet()).unwrap();
        t.set_protect(id, quiet()).unwrap();
        assert!(t.protect.is_some());
        assert!(t.get(id).unwrap().protect.is_some());
        assert!(t.set_protect(RouteId(99), quiet()).is_err());
    }
}
