//! Pending request registry.
//!
//! Deduplicates in-flight work: for every [`RequestKey`] there is at most one
//! producer, and every waiter that asks for the key while it is pending gets
//! the same result.
//!
//! # State machine
//!
//! ```text
//!            attach (created)              complete (current owner)
//!   Idle ───────────────────────► Pending ─────────────────────────► Idle
//!    ▲                           (producer,        flush waiters in
//!    │                            waiters[])       registration order
//!    │    detach (last waiter)       │
//!    └───────────────────────────────┘
//!         returns the producer so the caller can tear down upstream work
//! ```
//!
//! The registry is owned by a single coordination context and is never shared
//! across threads; every call takes `&mut self`. Targets are held as
//! [`Weak`] references, so a pending load never keeps a consumer alive; a
//! target that is gone by completion time is skipped.
//!
//! Producers can themselves wait on other keys (a transform waits on its
//! source). Such a producer records a [`Dependency`] per key it waits on, and
//! [`PendingRequestRegistry::detach_cascade`] follows those records down so
//! that abandoning a transform also abandons a source nobody else wants.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use tracing::{debug, trace};

use crate::bitmap::BitmapResult;
use crate::error::LoadError;
use crate::key::RequestKey;

/// Terminal outcome delivered to waiters.
pub type LoadResult = Result<Arc<BitmapResult>, LoadError>;

/// Something that wants to be told when a key completes.
pub trait Waiter: Send + Sync {
    /// Called once with the terminal result for `key`.
    ///
    /// The result is shared, so [`BitmapResult::loaded_from`] reports how it
    /// was first produced. A memory-cache hit hands back that same result;
    /// callers that need to tell the two apart use the
    /// [`Attached`](crate::loader::Attached) returned by the request.
    fn on_complete(&self, key: &RequestKey, result: &LoadResult);
}

/// Identity of one producer run. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProducerId(u64);

impl fmt::Display for ProducerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

/// Identity of one registration on a key. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WaiterId(u64);

/// A key a producer is itself waiting on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    pub key: RequestKey,
    pub waiter: WaiterId,
}

/// The single active producer of a pending key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Producer {
    pub id: ProducerId,
    pub key: RequestKey,
    pub depends_on: Vec<Dependency>,
}

/// A producer waiting on another key, handed back by
/// [`PendingRequestRegistry::complete`] for the caller to resume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependent {
    pub key: RequestKey,
    pub producer: ProducerId,
}

/// Outcome of an attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attachment {
    pub waiter: WaiterId,
    pub producer: ProducerId,

    /// The entry was created by this call; the caller must start the producer
    pub created: bool,
}

/// Outcome of a completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// The caller is not the current owner; nothing was delivered
    Stale,

    /// The entry was flushed
    Delivered {
        /// Live targets that were notified
        notified: usize,

        /// Dependent producers, in registration order
        dependents: Vec<Dependent>,
    },
}

enum Registered {
    Target(Weak<dyn Waiter>),
    Dependent(Dependent),
}

struct Registration {
    id: WaiterId,
    waiter: Registered,
}

struct PendingEntry {
    producer: Producer,
    waiters: Vec<Registration>,
}

// =============================================================================
// Registry
// =============================================================================

/// Per-key dedup of in-flight work with waiter fan-out.
///
/// # Example
///
/// ```ignore
/// let mut registry = PendingRequestRegistry::new();
/// let first = registry.attach(&key, &waiter_a);
/// let second = registry.attach(&key, &waiter_b);
/// assert!(first.created && !second.created);
///
/// // ... later, from the producer's completion message:
/// registry.complete(&key, first.producer, &Ok(result));
/// ```
#[derive(Default)]
pub struct PendingRequestRegistry {
    entries: HashMap<RequestKey, PendingEntry>,
    next_producer: u64,
    next_waiter: u64,
}

impl PendingRequestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `target` on `key`, creating the entry if none is pending.
    ///
    /// Attaching a target that is already registered on `key` returns the
    /// existing registration.
    pub fn attach(&mut self, key: &RequestKey, target: &Arc<dyn Waiter>) -> Attachment {
        let weak = Arc::downgrade(target);

        if let Some(entry) = self.entries.get(key) {
            let existing = entry.waiters.iter().find(|r| match &r.waiter {
                Registered::Target(w) => Weak::ptr_eq(w, &weak),
                Registered::Dependent(_) => false,
            });
            if let Some(registration) = existing {
                return Attachment {
                    waiter: registration.id,
                    producer: entry.producer.id,
                    created: false,
                };
            }
        }

        self.register(key, Registered::Target(weak))
    }

    /// Register the producer `dependent` (pending on `dependent_key`) as a
    /// waiter on `key`, and record the dependency on that producer.
    ///
    /// Returns `None` without registering anything if `dependent` no longer
    /// owns `dependent_key`.
    pub fn attach_dependent(
        &mut self,
        key: &RequestKey,
        dependent_key: &RequestKey,
        dependent: ProducerId,
    ) -> Option<Attachment> {
        if !self.is_current_owner(dependent_key, dependent) {
            return None;
        }

        let attachment = self.register(
            key,
            Registered::Dependent(Dependent {
                key: dependent_key.clone(),
                producer: dependent,
            }),
        );

        if let Some(entry) = self.entries.get_mut(dependent_key) {
            entry.producer.depends_on.push(Dependency {
                key: key.clone(),
                waiter: attachment.waiter,
            });
        }
        Some(attachment)
    }

    fn register(&mut self, key: &RequestKey, waiter: Registered) -> Attachment {
        let waiter_id = WaiterId(self.next_waiter);
        self.next_waiter += 1;

        let mut created = false;
        let next_producer = &mut self.next_producer;
        let entry = self.entries.entry(key.clone()).or_insert_with(|| {
            created = true;
            let id = ProducerId(*next_producer);
            *next_producer += 1;
            PendingEntry {
                producer: Producer {
                    id,
                    key: key.clone(),
                    depends_on: Vec::new(),
                },
                waiters: Vec::new(),
            }
        });
        entry.waiters.push(Registration {
            id: waiter_id,
            waiter,
        });

        if created {
            debug!(key = %key, producer = %entry.producer.id, "pending entry created");
        } else {
            trace!(key = %key, waiters = entry.waiters.len(), "joined pending entry");
        }

        Attachment {
            waiter: waiter_id,
            producer: entry.producer.id,
            created,
        }
    }

    /// Remove one registration from `key`.
    ///
    /// If it was the last one the entry is torn down and its producer is
    /// returned; the caller decides what upstream work to abandon.
    pub fn detach(&mut self, key: &RequestKey, waiter: WaiterId) -> Option<Producer> {
        let entry = self.entries.get_mut(key)?;
        let position = entry.waiters.iter().position(|r| r.id == waiter)?;
        entry.waiters.remove(position);

        if !entry.waiters.is_empty() {
            return None;
        }

        let entry = self.entries.remove(key)?;
        debug!(key = %key, producer = %entry.producer.id, "last waiter detached, entry removed");
        Some(entry.producer)
    }

    /// Detach and follow torn-down producers' dependencies downward.
    ///
    /// Returns every producer whose entry was removed, top first.
    pub fn detach_cascade(&mut self, key: &RequestKey, waiter: WaiterId) -> Vec<Producer> {
        let mut removed = Vec::new();
        let mut pending = vec![Dependency {
            key: key.clone(),
            waiter,
        }];

        while let Some(dependency) = pending.pop() {
            if let Some(producer) = self.detach(&dependency.key, dependency.waiter) {
                pending.extend(producer.depends_on.iter().rev().cloned());
                removed.push(producer);
            }
        }
        removed
    }

    /// Deliver `result` for `key` on behalf of `producer`.
    ///
    /// Only the current owner may complete: any other caller gets
    /// [`Completion::Stale`] and nothing happens. The entry is removed before
    /// any target is notified, so an attach that follows starts a fresh entry.
    /// Targets are notified in registration order; dependent producers are
    /// returned in registration order for the caller to resume.
    ///
    /// If the completing producer was still waiting on other keys, it is
    /// detached from them (cascading), since its result no longer needs them.
    pub fn complete(
        &mut self,
        key: &RequestKey,
        producer: ProducerId,
        result: &LoadResult,
    ) -> Completion {
        if !self.is_current_owner(key, producer) {
            debug!(key = %key, producer = %producer, "stale completion ignored");
            return Completion::Stale;
        }
        let Some(entry) = self.entries.remove(key) else {
            return Completion::Stale;
        };

        for dependency in &entry.producer.depends_on {
            self.detach_cascade(&dependency.key, dependency.waiter);
        }

        let mut notified = 0;
        let mut dependents = Vec::new();
        for registration in entry.waiters {
            match registration.waiter {
                Registered::Target(weak) => {
                    if let Some(target) = weak.upgrade() {
                        target.on_complete(key, result);
                        notified += 1;
                    }
                }
                Registered::Dependent(dependent) => {
                    self.forget_dependency(&dependent, registration.id);
                    dependents.push(dependent);
                }
            }
        }

        debug!(
            key = %key,
            producer = %producer,
            notified,
            dependents = dependents.len(),
            ok = result.is_ok(),
            "pending entry completed"
        );
        Completion::Delivered {
            notified,
            dependents,
        }
    }

    fn forget_dependency(&mut self, dependent: &Dependent, waiter: WaiterId) {
        if let Some(entry) = self.entries.get_mut(&dependent.key) {
            if entry.producer.id == dependent.producer {
                entry.producer.depends_on.retain(|d| d.waiter != waiter);
            }
        }
    }

    /// Whether `candidate` is the producer currently pending on `key`.
    pub fn is_current_owner(&self, key: &RequestKey, candidate: ProducerId) -> bool {
        self.producer_for(key) == Some(candidate)
    }

    /// The producer currently pending on `key`.
    pub fn producer_for(&self, key: &RequestKey) -> Option<ProducerId> {
        self.entries.get(key).map(|entry| entry.producer.id)
    }

    /// Keys the producer of `key` is waiting on.
    pub fn dependencies(&self, key: &RequestKey) -> &[Dependency] {
        self.entries
            .get(key)
            .map(|entry| entry.producer.depends_on.as_slice())
            .unwrap_or(&[])
    }

    pub fn waiter_count(&self, key: &RequestKey) -> usize {
        self.entries.get(key).map(|e| e.waiters.len()).unwrap_or(0)
    }

    pub fn contains(&self, key: &RequestKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Number of pending keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
