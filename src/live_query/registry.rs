// src/live_query/registry.rs

//! Bookkeeping of which request ids are awaiting a server acknowledgement (`pending`)
//! and which are confirmed (`current`).
//!
//! A request id normally lives in exactly one of the two maps. While an update or an
//! unsubscribe is in flight the id is in both: `current` keeps the confirmed query
//! until the server answers for the pending one.

use std::collections::BTreeMap;

use crate::error::ParseError;
use crate::query::ParseQuery;
use crate::types::RequestId;

/// What a pending entry is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingKind {
    /// A first subscription, or a resubscription after reconnecting.
    Subscribe,
    /// A new query for an id that is already confirmed.
    Update,
    Unsubscribe,
}

#[derive(Debug, Clone)]
pub struct RegistryEntry<H> {
    pub query: ParseQuery,
    pub handler: H,
}

#[derive(Debug, Clone)]
struct PendingEntry<H> {
    entry: RegistryEntry<H>,
    kind: PendingKind,
}

/// Result of moving a pending entry into `current`.
#[derive(Debug, Clone)]
pub struct Promotion<H> {
    pub handler: H,
    pub query: ParseQuery,
    /// `false` when the id was already confirmed, i.e. an update was acknowledged.
    pub is_new: bool,
}

/// Pending and confirmed subscriptions of one client, keyed by request id.
///
/// `H` is whatever the owner needs to reach the subscriber; the client stores a
/// type-erased subscription handler.
#[derive(Debug)]
pub struct SubscriptionRegistry<H> {
    last_request_id: u32,
    pending: BTreeMap<RequestId, PendingEntry<H>>,
    current: BTreeMap<RequestId, RegistryEntry<H>>,
}

impl<H> Default for SubscriptionRegistry<H> {
    fn default() -> Self {
        SubscriptionRegistry {
            last_request_id: 0,
            pending: BTreeMap::new(),
            current: BTreeMap::new(),
        }
    }
}

impl<H: Clone> SubscriptionRegistry<H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issues the next request id. Ids start at 1 and are never reused, even after
    /// [`clear`](Self::clear); once `u32::MAX` was handed out every call fails.
    pub fn next_request_id(&mut self) -> Result<RequestId, ParseError> {
        self.last_request_id = self
            .last_request_id
            .checked_add(1)
            .ok_or(ParseError::RequestIdsExhausted)?;
        Ok(RequestId(self.last_request_id))
    }

    /// Records `request_id` as awaiting acknowledgement, replacing any earlier pending
    /// entry for the same id.
    pub fn add_pending(
        &mut self,
        request_id: RequestId,
        query: ParseQuery,
        handler: H,
        kind: PendingKind,
    ) {
        self.pending.insert(
            request_id,
            PendingEntry {
                entry: RegistryEntry { query, handler },
                kind,
            },
        );
    }

    /// Moves `request_id` from `pending` to `current`. Returns `None` when nothing is
    /// pending under that id.
    pub fn promote(&mut self, request_id: RequestId) -> Option<Promotion<H>> {
        let pending = self.pending.remove(&request_id)?;
        let is_new = !self.current.contains_key(&request_id);
        let promotion = Promotion {
            handler: pending.entry.handler.clone(),
            query: pending.entry.query.clone(),
            is_new,
        };
        self.current.insert(request_id, pending.entry);
        Some(promotion)
    }

    pub fn remove_current(&mut self, request_id: RequestId) -> Option<RegistryEntry<H>> {
        self.current.remove(&request_id)
    }

    pub fn remove_pending(&mut self, request_id: RequestId) -> Option<RegistryEntry<H>> {
        self.pending.remove(&request_id).map(|pending| pending.entry)
    }

    /// Removes every pending entry with the given query; returns the removed ids.
    pub fn remove_pending_query(&mut self, query: &ParseQuery) -> Vec<RequestId> {
        let ids: Vec<RequestId> = self
            .pending
            .iter()
            .filter(|(_, pending)| pending.entry.query == *query)
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            self.pending.remove(id);
        }
        ids
    }

    pub fn pending_kind(&self, request_id: RequestId) -> Option<PendingKind> {
        self.pending.get(&request_id).map(|pending| pending.kind)
    }

    pub fn is_pending(&self, request_id: RequestId) -> bool {
        self.pending.contains_key(&request_id)
    }

    pub fn is_current(&self, request_id: RequestId) -> bool {
        self.current.contains_key(&request_id)
    }

    pub fn contains(&self, request_id: RequestId) -> bool {
        self.is_pending(request_id) || self.is_current(request_id)
    }

    /// The query registered under `request_id`, preferring the confirmed one.
    pub fn query_for(&self, request_id: RequestId) -> Option<&ParseQuery> {
        self.current
            .get(&request_id)
            .map(|entry| &entry.query)
            .or_else(|| self.pending.get(&request_id).map(|p| &p.entry.query))
    }

    pub fn handler_for(&self, request_id: RequestId) -> Option<H> {
        self.current
            .get(&request_id)
            .map(|entry| entry.handler.clone())
            .or_else(|| {
                self.pending
                    .get(&request_id)
                    .map(|pending| pending.entry.handler.clone())
            })
    }

    /// The lowest request id registered for `query`, confirmed ids first.
    pub fn request_id_for(&self, query: &ParseQuery) -> Option<RequestId> {
        self.current_request_id_for(query).or_else(|| {
            self.pending
                .iter()
                .find(|(_, pending)| pending.entry.query == *query)
                .map(|(id, _)| *id)
        })
    }

    pub fn current_request_id_for(&self, query: &ParseQuery) -> Option<RequestId> {
        self.current
            .iter()
            .find(|(_, entry)| entry.query == *query)
            .map(|(id, _)| *id)
    }

    pub fn is_current_query(&self, query: &ParseQuery) -> bool {
        self.current.values().any(|entry| entry.query == *query)
    }

    pub fn is_pending_query(&self, query: &ParseQuery) -> bool {
        self.pending
            .values()
            .any(|pending| pending.entry.query == *query)
    }

    pub fn snapshot_current(&self) -> BTreeMap<RequestId, ParseQuery> {
        self.current
            .iter()
            .map(|(id, entry)| (*id, entry.query.clone()))
            .collect()
    }

    pub fn snapshot_pending(&self) -> BTreeMap<RequestId, ParseQuery> {
        self.pending
            .iter()
            .map(|(id, pending)| (*id, pending.entry.query.clone()))
            .collect()
    }

    /// Pending requests in request id order, as they should be (re)sent.
    pub fn pending_requests(&self) -> Vec<(RequestId, ParseQuery, PendingKind)> {
        self.pending
            .iter()
            .map(|(id, pending)| (*id, pending.entry.query.clone(), pending.kind))
            .collect()
    }

    /// Prepares the registry for a fresh connection, where the server knows none of
    /// our subscriptions.
    ///
    /// Pending unsubscribes are complete (there is nothing left to remove) and are
    /// returned so their subscribers can be told. Every confirmed subscription moves
    /// back to `pending` as a `Subscribe`; an in-flight update keeps its newer query.
    pub fn requeue_for_resubscribe(&mut self) -> Vec<(RequestId, RegistryEntry<H>)> {
        let unsubscribing: Vec<RequestId> = self
            .pending
            .iter()
            .filter(|(_, pending)| pending.kind == PendingKind::Unsubscribe)
            .map(|(id, _)| *id)
            .collect();

        let mut completed = Vec::with_capacity(unsubscribing.len());
        for id in unsubscribing {
            self.current.remove(&id);
            if let Some(pending) = self.pending.remove(&id) {
                completed.push((id, pending.entry));
            }
        }

        for (id, entry) in std::mem::take(&mut self.current) {
            self.pending.entry(id).or_insert(PendingEntry {
                entry,
                kind: PendingKind::Subscribe,
            });
        }
        for pending in self.pending.values_mut() {
            pending.kind = PendingKind::Subscribe;
        }

        completed
    }

    /// Drops every entry. The request id counter keeps counting.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.current.clear();
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn current_len(&self) -> usize {
        self.current.len()
    }
}
