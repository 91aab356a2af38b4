//! Idle-connection deadlines
//!
//! The wheel is an expiry-sorted doubly linked list stored in an arena, so
//! nodes are addressed by index instead of pointer. The reactor owns the
//! wheel: deadlines are added on accept, pushed forward on activity, and
//! reaped by [`TimerWheel::tick`] each time the alarm fires.

use std::time::Instant;

use mio::Token;
use slab::Slab;

/// Handle to one deadline in the wheel.
///
/// Valid from [`TimerWheel::add`] until the deadline is removed or expires;
/// operations on a stale handle are no-ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerHandle(usize);

#[derive(Debug)]
struct TimerNode {
    expire: Instant,
    token: Token,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Sorted list of per-connection deadlines.
///
/// Ordered by expiry ascending from head to tail. A connection has at most
/// one node in the wheel at any time.
#[derive(Debug, Default)]
pub struct TimerWheel {
    nodes: Slab<TimerNode>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl TimerWheel {
    /// Creates an empty wheel.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pending deadlines.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether no deadline is pending.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Inserts a deadline for `token`, keeping the list sorted.
    pub fn add(&mut self, token: Token, expire: Instant) -> TimerHandle {
        let idx = self.nodes.insert(TimerNode {
            expire,
            token,
            prev: None,
            next: None,
        });
        self.link_sorted(idx);
        TimerHandle(idx)
    }

    /// Moves a deadline to `expire`.
    ///
    /// Deadlines only ever move forward here, so the node stays put unless
    /// its successor now expires earlier; only then is it re-inserted.
    /// Calling this twice with the same instant leaves the list unchanged.
    pub fn adjust(&mut self, handle: TimerHandle, expire: Instant) {
        let idx = handle.0;
        if !self.nodes.contains(idx) {
            return;
        }

        self.nodes[idx].expire = expire;
        match self.nodes[idx].next {
            Some(next) if self.nodes[next].expire < expire => {}
            _ => return,
        }

        self.unlink(idx);
        self.link_sorted(idx);
    }

    /// Drops a deadline.
    pub fn remove(&mut self, handle: TimerHandle) {
        let idx = handle.0;
        if !self.nodes.contains(idx) {
            return;
        }

        self.unlink(idx);
        self.nodes.remove(idx);
    }

    /// Pops every deadline at or before `now`, in expiry order, returning
    /// the tokens to evict.
    pub fn tick(&mut self, now: Instant) -> Vec<Token> {
        let mut expired = Vec::new();
        while let Some(idx) = self.head {
            if self.nodes[idx].expire > now {
                break;
            }
            expired.push(self.nodes[idx].token);
            self.unlink(idx);
            self.nodes.remove(idx);
        }
        expired
    }

    /// Empties the wheel, returning every pending token. Used by the
    /// shutdown walk to close all remaining connections.
    pub fn drain(&mut self) -> Vec<Token> {
        let mut tokens = Vec::with_capacity(self.nodes.len());
        while let Some(idx) = self.head {
            tokens.push(self.nodes[idx].token);
            self.unlink(idx);
            self.nodes.remove(idx);
        }
        tokens
    }

    /// Inserts node `idx` before the first node with a later expiry.
    /// Equal expiries keep insertion order.
    fn link_sorted(&mut self, idx: usize) {
        let expire = self.nodes[idx].expire;
        let mut prev = None;
        let mut cur = self.head;
        while let Some(c) = cur {
            if expire < self.nodes[c].expire {
                break;
            }
            prev = cur;
            cur = self.nodes[c].next;
        }

        self.nodes[idx].prev = prev;
        self.nodes[idx].next = cur;
        match prev {
            Some(p) => self.nodes[p].next = Some(idx),
            None => self.head = Some(idx),
        }
        match cur {
            Some(c) => self.nodes[c].prev = Some(idx),
            None => self.tail = Some(idx),
        }
    }

    fn unlink(&mut self, idx: usize) {
        let prev = self.nodes[idx].prev;
        let next = self.nodes[idx].next;
        match prev {
            Some(p) => self.nodes[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.nodes[n].prev = prev,
            None => self.tail = prev,
        }
        self.nodes[idx].prev = None;
        self.nodes[idx].next = None;
    }

    #[cfg(test)]
    fn expiries(&self) -> Vec<Instant> {
        let mut out = Vec::new();
        let mut cur = self.head;
        while let Some(idx) = cur {
            out.push(self.nodes[idx].expire);
            cur = self.nodes[idx].next;
        }
        out
    }
}
