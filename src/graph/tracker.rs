//! Per-key cache bookkeeping.
//!
//! Every fetch the graph issues is identified by a [CacheKey]. While a fetch is in flight its
//! key maps to a [Pending] handle; callers asking for the same key receive a clone of that
//! handle instead of starting a second fetch. Once the fetch has finished the key is either
//! recorded as cached or simply dropped, depending on whether its result is tracked here or in
//! the entities themselves.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::{
    collections::{BTreeSet, HashMap},
    fmt,
};

use crate::error::GraphError;

/// Handle to an in-flight fetch. Cloning it joins the fetch.
pub type Pending = Shared<BoxFuture<'static, Result<(), GraphError>>>;

/// Wraps an already settled outcome as a [Pending].
pub fn settled(result: Result<(), GraphError>) -> Pending {
    futures::future::ready(result).boxed().shared()
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CacheKey {
    /// Core and spatial attributes of an absent image.
    Full(String),
    /// Spatial attributes of a known, incomplete image.
    Fill(String),
    /// Sequence by sequence id.
    Sequence(String),
    /// Every image of a sequence, by sequence id.
    SequenceImages(String),
    /// Core images of a cell, by cell id.
    Cell(String),
    /// Completion of the images around an image, by image id.
    SpatialArea(String),
    /// Binary assets of an image, by image id.
    Assets(String),
}

impl CacheKey {
    pub fn id(&self) -> &str {
        match self {
            CacheKey::Full(id)
            | CacheKey::Fill(id)
            | CacheKey::Sequence(id)
            | CacheKey::SequenceImages(id)
            | CacheKey::Cell(id)
            | CacheKey::SpatialArea(id)
            | CacheKey::Assets(id) => id,
        }
    }

    /// The image this key fetches for, when it is keyed by image id.
    pub fn image_id(&self) -> Option<&str> {
        match self {
            CacheKey::Full(id)
            | CacheKey::Fill(id)
            | CacheKey::SpatialArea(id)
            | CacheKey::Assets(id) => Some(id),
            _ => None,
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheKey::Full(id) => write!(f, "full:{id}"),
            CacheKey::Fill(id) => write!(f, "fill:{id}"),
            CacheKey::Sequence(id) => write!(f, "sequence:{id}"),
            CacheKey::SequenceImages(id) => write!(f, "sequence-images:{id}"),
            CacheKey::Cell(id) => write!(f, "cell:{id}"),
            CacheKey::SpatialArea(id) => write!(f, "spatial-area:{id}"),
            CacheKey::Assets(id) => write!(f, "assets:{id}"),
        }
    }
}

/// Outcome of [CacheTracker::mark_caching].
#[derive(Clone)]
pub enum Begin {
    /// The key was idle; the given fetch is now registered under it.
    Started(Pending),
    /// A fetch was already registered; the caller joins it.
    Joined(Pending),
}

impl Begin {
    pub fn pending(self) -> Pending {
        match self {
            Begin::Started(pending) | Begin::Joined(pending) => pending,
        }
    }

    pub fn started(&self) -> bool {
        matches!(self, Begin::Started(_))
    }
}

impl fmt::Debug for Begin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Begin::Started(_) => write!(f, "Started"),
            Begin::Joined(_) => write!(f, "Joined"),
        }
    }
}

struct InFlight {
    ticket: u64,
    pending: Pending,
}

/// Single-flight registry. Performs no I/O.
///
/// Each registration carries a ticket so that a batch fetch covering a key it joined cannot end
/// the registration of the fetch that owns that key.
#[derive(Default)]
pub struct CacheTracker {
    caching: HashMap<CacheKey, InFlight>,
    cached: BTreeSet<CacheKey>,
    next_ticket: u64,
}

impl CacheTracker {
    fn ticket(&mut self) -> u64 {
        self.next_ticket += 1;
        self.next_ticket
    }

    /// Registers the fetch produced by `start` under `key`, unless a fetch is already
    /// registered, in which case `start` is not called and the existing handle is returned.
    /// `start` receives the ticket to hand back to [CacheTracker::finish].
    pub fn mark_caching<F>(&mut self, key: CacheKey, start: F) -> Begin
    where
        F: FnOnce(u64) -> Pending,
    {
        if let Some(in_flight) = self.caching.get(&key) {
            tracing::trace!("Joining in-flight fetch {}", key);
            return Begin::Joined(in_flight.pending.clone());
        }
        let ticket = self.ticket();
        let pending = start(ticket);
        tracing::trace!("Started fetch {}", key);
        self.caching.insert(key, InFlight { ticket, pending: pending.clone() });
        Begin::Started(pending)
    }

    /// Registers one fetch covering several keys. Keys that already have a fetch in flight
    /// keep it.
    pub fn mark_caching_all<F>(&mut self, keys: &[CacheKey], start: F) -> Pending
    where
        F: FnOnce(u64) -> Pending,
    {
        let ticket = self.ticket();
        let pending = start(ticket);
        for key in keys {
            if !self.caching.contains_key(key) {
                self.caching.insert(
                    key.clone(),
                    InFlight {
                        ticket,
                        pending: pending.clone(),
                    },
                );
            }
        }
        pending
    }

    /// Ends the in-flight state of `key` and records it as cached.
    pub fn mark_cached(&mut self, key: CacheKey) {
        self.caching.remove(&key);
        self.cached.insert(key);
    }

    /// Ends the in-flight state registered under `ticket`. Returns false when another fetch owns
    /// `key`.
    pub fn finish(&mut self, key: &CacheKey, ticket: u64) -> bool {
        match self.caching.get(key) {
            Some(in_flight) if in_flight.ticket == ticket => {
                self.caching.remove(key);
                true
            }
            _ => false,
        }
    }

    pub fn is_caching(&self, key: &CacheKey) -> bool {
        self.caching.contains_key(key)
    }

    pub fn has(&self, key: &CacheKey) -> bool {
        self.cached.contains(key)
    }

    /// Forgets that `key` was cached. In-flight state is untouched.
    pub fn forget(&mut self, key: &CacheKey) {
        self.cached.remove(key);
    }

    pub fn pending(&self, key: &CacheKey) -> Option<Pending> {
        self.caching.get(key).map(|in_flight| in_flight.pending.clone())
    }

    pub fn in_flight(&self) -> impl Iterator<Item = &CacheKey> {
        self.caching.keys()
    }
}

impl fmt::Debug for CacheTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheTracker")
            .field("caching", &self.caching.keys().collect::<Vec<_>>())
            .field("cached", &self.cached)
            .finish()
    }
}
