//! Stanza routing and IQ reply correlation.
//!
//! Inbound stanzas are classified by kind and offered to registered
//! handlers in tier order (`First` → `Normal` → `Last`), preserving
//! registration order within a tier. IQ `result`/`error` stanzas are
//! matched against the outstanding-request table first; a matched
//! callback fires exactly once and the entry is gone.
//!
//! The bus is generic over the context handed to handlers so it can be
//! tested without a full session.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::{debug, warn};
use uuid::Uuid;

use super::element::Element;
use super::stanzas::IqKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StanzaKind {
    Message,
    Presence,
    Iq,
}

/// Classifies a top-level stanza by element name.
pub fn classify(el: &Element) -> Option<StanzaKind> {
    match el.name.as_str() {
        "message" => Some(StanzaKind::Message),
        "presence" => Some(StanzaKind::Presence),
        "iq" => Some(StanzaKind::Iq),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HandlerTier {
    First,
    Normal,
    Last,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerVerdict {
    /// Stanza handled; stop propagation.
    Consume,
    /// Let later handlers see it too.
    AllowMore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A handler (or an IQ reply callback) consumed the stanza.
    Consumed,
    /// No handler consumed it.
    Unhandled,
    /// Not a message/presence/iq element; reported and dropped.
    NotAStanza,
}

/// The reply handed to an outstanding-IQ callback.
pub enum IqReply<'a> {
    Result(&'a Element),
    Error(&'a Element),
    /// No reply within the configured window.
    Timeout,
    /// The stream closed with the request still pending.
    Disconnected,
}

pub type HandlerId = u32;
pub type StanzaHandler<C> = Box<dyn FnMut(&mut C, &Element) -> HandlerVerdict + Send>;
pub type IqCallback<C> = Box<dyn FnOnce(&mut C, IqReply) + Send>;

struct HandlerEntry<C> {
    id: HandlerId,
    kind: StanzaKind,
    tier: HandlerTier,
    seq: u32,
    handler: StanzaHandler<C>,
}

struct PendingIq<C> {
    callback: IqCallback<C>,
    created: Instant,
}

pub struct StanzaBus<C> {
    handlers: Vec<HandlerEntry<C>>,
    pending: HashMap<String, PendingIq<C>>,
    next_id: u32,
}

impl<C> StanzaBus<C> {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
            pending: HashMap::new(),
            next_id: 0,
        }
    }

    /// Allocates a fresh stanza id.
    pub fn new_stanza_id(&self) -> String {
        Uuid::new_v4().simple().to_string()
    }

    pub fn register(
        &mut self,
        kind: StanzaKind,
        tier: HandlerTier,
        handler: impl FnMut(&mut C, &Element) -> HandlerVerdict + Send + 'static,
    ) -> HandlerId {
        self.next_id += 1;
        let id = self.next_id;
        self.handlers.push(HandlerEntry {
            id,
            kind,
            tier,
            seq: self.next_id,
            handler: Box::new(handler),
        });
        self.handlers.sort_by_key(|e| (e.tier, e.seq));
        id
    }

    pub fn unregister(&mut self, id: HandlerId) {
        self.handlers.retain(|e| e.id != id);
    }

    /// Registers the reply callback for an outgoing IQ.
    pub fn expect_reply(&mut self, id: String, callback: IqCallback<C>) {
        self.pending.insert(
            id,
            PendingIq {
                callback,
                created: Instant::now(),
            },
        );
    }

    pub fn has_pending(&self, id: &str) -> bool {
        self.pending.contains_key(id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Routes one inbound stanza.
    pub fn dispatch(&mut self, ctx: &mut C, el: &Element) -> DispatchOutcome {
        let Some(kind) = classify(el) else {
            warn!("dropping non-stanza element <{}>", el.name);
            return DispatchOutcome::NotAStanza;
        };

        // IQ replies resolve the outstanding table before any handler
        if kind == StanzaKind::Iq {
            let iq_kind = IqKind::from_attr(el.attr("type"));
            if matches!(iq_kind, Some(IqKind::Result) | Some(IqKind::Error)) {
                if let Some(id) = el.attr("id") {
                    if let Some(pending) = self.pending.remove(id) {
                        debug!("iq reply for {id}");
                        let reply = if iq_kind == Some(IqKind::Result) {
                            IqReply::Result(el)
                        } else {
                            IqReply::Error(el)
                        };
                        (pending.callback)(ctx, reply);
                        return DispatchOutcome::Consumed;
                    }
                }
            } else if iq_kind.is_none() {
                warn!("dropping iq without a valid type attribute");
                return DispatchOutcome::NotAStanza;
            }
        }

        for entry in self.handlers.iter_mut() {
            if entry.kind != kind {
                continue;
            }
            match (entry.handler)(ctx, el) {
                HandlerVerdict::Consume => return DispatchOutcome::Consumed,
                HandlerVerdict::AllowMore => continue,
            }
        }
        DispatchOutcome::Unhandled
    }

    /// Cancels every outstanding request (stream closed): each callback
    /// fires once with a synthetic disconnected error, then its captured
    /// state is dropped.
    pub fn cancel_all(&mut self, ctx: &mut C) {
        let pending = std::mem::take(&mut self.pending);
        for (id, entry) in pending {
            debug!("cancelling pending iq {id}");
            (entry.callback)(ctx, IqReply::Disconnected);
        }
    }

    /// Times out requests older than `timeout`.
    pub fn expire_pending(&mut self, ctx: &mut C, timeout: Duration, now: Instant) {
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, p)| now.duration_since(p.created) >= timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            warn!("iq {id} timed out");
            if let Some(entry) = self.pending.remove(&id) {
                (entry.callback)(ctx, IqReply::Timeout);
            }
        }
    }
}

impl<C> Default for StanzaBus<C> {
    fn default() -> Self {
        Self::new()
    }
}
