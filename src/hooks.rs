//! Named extension points.
//!
//! External modules (UI, history, crypto plugins) register handlers on
//! hook names; the core fires them with an ordered list of string
//! arguments. A handler can let the event propagate, consume it, or
//! consume it and ask the core to drop the data it describes (e.g.
//! suppress a message entirely).

use std::collections::HashMap;

use tracing::debug;

// Core hook names
pub const PRE_MESSAGE_IN: &str = "hook-pre-message-in";
pub const POST_MESSAGE_IN: &str = "hook-post-message-in";
pub const MESSAGE_OUT: &str = "hook-message-out";
pub const STATUS_CHANGE: &str = "hook-status-change";
pub const MY_STATUS_CHANGE: &str = "hook-my-status-change";
pub const POST_CONNECT: &str = "hook-post-connect";
pub const PRE_DISCONNECT: &str = "hook-pre-disconnect";
pub const UNREAD_LIST_CHANGE: &str = "hook-unread-list-change";
pub const MDR_RECEIVED: &str = "hook-mdr-received";
pub const SUBSCRIPTION: &str = "hook-subscription";
/// Informational text for the log window (IQ results, notices).
pub const LOGWINDOW: &str = "hook-logwindow";

pub type HookArgs = Vec<(String, String)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookVerdict {
    AllowMore,
    Consume,
    ConsumeAndDrop,
}

pub type HookId = u32;

type Handler = Box<dyn FnMut(&str, &[(String, String)]) -> HookVerdict + Send>;

struct Entry {
    id: HookId,
    priority: i32,
    handler: Handler,
}

/// Handler table. Handlers for a hook run in priority order (lower
/// first); within a priority, registration order is preserved.
#[derive(Default)]
pub struct HookRegistry {
    handlers: HashMap<String, Vec<Entry>>,
    next_id: HookId,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_handler(
        &mut self,
        hookname: &str,
        priority: i32,
        handler: impl FnMut(&str, &[(String, String)]) -> HookVerdict + Send + 'static,
    ) -> HookId {
        self.next_id += 1;
        let id = self.next_id;
        let entries = self.handlers.entry(hookname.to_string()).or_default();
        entries.push(Entry {
            id,
            priority,
            handler: Box::new(handler),
        });
        // Stable: same-priority handlers keep registration order
        entries.sort_by_key(|e| e.priority);
        id
    }

    pub fn del_handler(&mut self, hookname: &str, id: HookId) {
        if let Some(entries) = self.handlers.get_mut(hookname) {
            entries.retain(|e| e.id != id);
        }
    }

    /// Fires a hook. Stops at the first handler that does not return
    /// `AllowMore` and reports that verdict.
    pub fn run(&mut self, hookname: &str, args: &[(String, String)]) -> HookVerdict {
        debug!("hook {hookname}: {args:?}");
        let Some(entries) = self.handlers.get_mut(hookname) else {
            return HookVerdict::AllowMore;
        };
        for entry in entries.iter_mut() {
            match (entry.handler)(hookname, args) {
                HookVerdict::AllowMore => continue,
                verdict => return verdict,
            }
        }
        HookVerdict::AllowMore
    }
}

/// Convenience for building hook argument lists.
pub fn args(pairs: &[(&str, &str)]) -> HookArgs {
    pairs
        .iter()
        .map(|(n, v)| (n.to_string(), v.to_string()))
        .collect()
}
