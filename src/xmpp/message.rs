//! Message handling: inbound delivery (carbons, receipts, chat states,
//! invitations, the unread index) and outbound sends.

use tracing::{debug, warn};

use super::bus::HandlerVerdict;
use super::element::Element;
use super::session::Session;
use super::stanzas::{
    self, CarbonDirection, ChatState, MessageKind, ParsedMessage,
};
use super::ns;
use crate::hooks::{self, HookVerdict};
use crate::jid;
use crate::roster::{kind, ChatStateSupport, Presence};

impl Session {
    /// Built-in message handler.
    pub fn handle_message_stanza(&mut self, el: &Element) -> HandlerVerdict {
        let Some(parsed) = stanzas::parse_message(el) else {
            warn!("Dropping message without sender");
            return HandlerVerdict::Consume;
        };
        let bjid = jid::bare_lower(&parsed.from);
        let resource = jid::resource_of(&parsed.from).map(str::to_string);

        if parsed.kind == MessageKind::Error {
            let error = parsed.error.clone().unwrap_or_else(|| stanzas::parse_error(el));
            self.logwindow(
                &bjid,
                &format!("Received error packet [{}] from <{bjid}>", error.describe()),
            );
            // A probed chat-state support goes back to unknown so we
            // probe again
            self.chatstates_reset_probed(&parsed.from);
            return HandlerVerdict::Consume;
        }

        self.note_chat_state(&bjid, resource.as_deref(), &parsed);

        // Carbons are unwrapped before anything else looks at addressing
        match stanzas::carbon_wrapper(el) {
            Some(Err(why)) => {
                warn!("Malformed carbon copy: {why}");
                return HandlerVerdict::Consume;
            }
            Some(Ok((CarbonDirection::Received, inner))) => {
                let Some(inner_parsed) = stanzas::parse_message(&inner) else {
                    warn!("Malformed carbon copy: no sender on forwarded message");
                    return HandlerVerdict::Consume;
                };
                debug!("Received incoming carbon from <{}>", inner_parsed.from);
                let inner_bjid = jid::bare_lower(&inner_parsed.from);
                let inner_res = jid::resource_of(&inner_parsed.from).map(str::to_string);
                self.note_chat_state(&inner_bjid, inner_res.as_deref(), &inner_parsed);
                let has_body = inner_parsed
                    .body
                    .as_deref()
                    .map(|b| !b.is_empty())
                    .unwrap_or(false);
                if has_body {
                    self.deliver_message(&inner_bjid, inner_res.as_deref(), &inner_parsed, true);
                }
                return HandlerVerdict::Consume;
            }
            Some(Ok((CarbonDirection::Sent, inner))) => {
                let Some(to) = inner.attr("to") else {
                    warn!("Malformed carbon copy: no recipient on sent copy");
                    return HandlerVerdict::Consume;
                };
                let peer = jid::bare_lower(to);
                debug!("Received outgoing carbon for <{peer}>");
                if let Some(body) = inner.child_text("body").filter(|b| !b.is_empty()) {
                    let args = hooks::args(&[
                        ("jid", &peer),
                        ("message", &body),
                        ("carbon", "1"),
                    ]);
                    self.hooks.run(hooks::MESSAGE_OUT, &args);
                }
                return HandlerVerdict::Consume;
            }
            None => {}
        }

        // Groupchat from a room we are not inside is a server anomaly:
        // acknowledge with unavailable and remember the jid as a room
        if parsed.kind == MessageKind::GroupChat && self.roster.nickname(&bjid).is_none() {
            self.logwindow(&bjid, "Unexpected groupchat packet!");
            let unavailable = stanzas::build_presence(
                Presence::Offline,
                Some(&bjid),
                None,
                0,
                None,
            );
            self.send(&unavailable);
            if self.roster.contact_by_jid(&bjid).is_none() {
                self.roster
                    .add_user(&bjid, None, None, kind::ROOM, Default::default(), None);
            } else {
                self.roster.set_kind(&bjid, kind::ROOM);
            }
            return HandlerVerdict::Consume;
        }

        // Room subject updates
        if parsed.kind == MessageKind::GroupChat && parsed.subject.is_some() {
            let subject = parsed.subject.clone().unwrap_or_default();
            self.roster.set_topic(&bjid, Some(&subject));
            let notice = match (resource.as_deref(), subject.is_empty()) {
                (Some(nick), false) => format!("{nick} has set the topic to: {subject}"),
                (Some(nick), true) => format!("{nick} has cleared the topic"),
                (None, false) => format!("The topic has been set to: {subject}"),
                (None, true) => "The topic has been cleared".to_string(),
            };
            self.logwindow(&bjid, &notice);
        }

        if self.is_blocked_sender(&bjid, parsed.kind) {
            self.logwindow(&bjid, &format!("Blocked a message from <{bjid}>"));
            return HandlerVerdict::Consume;
        }

        let deliverable = parsed.body.is_some()
            || (parsed.subject.is_some() && parsed.kind != MessageKind::GroupChat);
        if deliverable {
            self.deliver_message(&bjid, resource.as_deref(), &parsed, false);
        }

        // XEP-0184: answer a receipt request when the peer may see our
        // presence anyway
        if parsed.receipt_request && self.roster.subscription(&bjid).has_from() {
            if let Some(id) = &parsed.id {
                let receipt = stanzas::build_receipt(&parsed.from, id);
                self.send(&receipt);
            }
        }
        if let Some(receipt_id) = &parsed.receipt_received {
            let args = hooks::args(&[("jid", parsed.from.as_str()), ("id", receipt_id)]);
            self.hooks.run(hooks::MDR_RECEIVED, &args);
        }

        // Invitations (direct form and muc#user form)
        let invite = parsed.direct_invite.as_ref().or(parsed.muc_user_invite.as_ref());
        if let Some(invite) = invite {
            let mut notice = format!("Received an invitation to <{}>", invite.room);
            if let Some(reason) = &invite.reason {
                notice.push_str(&format!(" ({reason})"));
            }
            self.logwindow(&bjid, &notice);
        }

        HandlerVerdict::Consume
    }

    /// `block_unsubscribed`: drop 1:1 messages from contacts without a
    /// `from` subscription, except rooms and our own server.
    fn is_blocked_sender(&self, bjid: &str, kind_val: MessageKind) -> bool {
        if !self.config.block_unsubscribed {
            return false;
        }
        if kind_val == MessageKind::GroupChat {
            return false;
        }
        if self.roster.kind_of(bjid) & kind::ROOM != 0 {
            return false;
        }
        if self.roster.subscription(bjid).has_from() {
            return false;
        }
        // Messages from our own server (bare domain) pass
        bjid != self.config.domain()
    }

    /// Runs the inbound hooks and maintains the unread index. `carbon`
    /// marks messages mirrored from another of our resources.
    fn deliver_message(
        &mut self,
        bjid: &str,
        resource: Option<&str>,
        parsed: &ParsedMessage,
        carbon: bool,
    ) {
        let mut body = parsed.body.clone().unwrap_or_default();
        if let Some(subject) = &parsed.subject {
            // Room subjects never reach here; they became topic updates
            if parsed.kind != MessageKind::GroupChat {
                body = format!("[{subject}]\n{body}");
            }
        }

        let timestamp = parsed
            .timestamp
            .map(|t| t.timestamp().to_string())
            .unwrap_or_default();
        let args = hooks::args(&[
            ("jid", bjid),
            ("resource", resource.unwrap_or("")),
            ("message", &body),
            ("groupchat", if parsed.kind == MessageKind::GroupChat { "1" } else { "0" }),
            ("timestamp", &timestamp),
            ("encrypted", if parsed.encrypted.is_some() { "1" } else { "0" }),
            ("signed", if parsed.signed.is_some() { "1" } else { "0" }),
            ("carbon", if carbon { "1" } else { "0" }),
        ]);
        if self.hooks.run(hooks::PRE_MESSAGE_IN, &args) == HookVerdict::ConsumeAndDrop {
            debug!("message from <{bjid}> dropped by hook");
            return;
        }

        let unread_changed = self.roster.msg_set_flag(bjid, false, true);
        self.hooks.run(hooks::POST_MESSAGE_IN, &args);
        if unread_changed {
            self.run_unread_list_hook();
        }
    }

    pub(crate) fn run_unread_list_hook(&mut self) {
        let summary = self.roster.unread_summary();
        let args = hooks::args(&[
            ("unread", &summary.unread.to_string()),
            ("attention", &summary.attention.to_string()),
            ("muc_unread", &summary.muc_unread.to_string()),
            ("muc_attention", &summary.muc_attention.to_string()),
        ]);
        self.hooks.run(hooks::UNREAD_LIST_CHANGE, &args);
    }

    /// Records a peer chat-state notification: support is confirmed and
    /// the state lands on the resource.
    fn note_chat_state(&mut self, bjid: &str, resource: Option<&str>, parsed: &ParsedMessage) {
        let Some(state) = parsed.chat_state else { return };
        if let Some(states) = self.roster.chat_states_mut(bjid, resource) {
            states.support = ChatStateSupport::Ok;
            states.last_rcvd = Some(state);
        }
    }

    /// A probed resource did not answer; probe again next time.
    pub(crate) fn chatstates_reset_probed(&mut self, full_jid: &str) {
        let bjid = jid::bare_lower(full_jid);
        let Some(resource) = jid::resource_of(full_jid) else {
            return;
        };
        if let Some(states) = self.roster.chat_states_mut(&bjid, Some(resource)) {
            if states.support == ChatStateSupport::Probed {
                states.support = ChatStateSupport::Unknown;
            }
        }
    }

    // ── outbound ────────────────────────────────────────

    /// Sends a chat message. Returns the stanza id when a delivery
    /// receipt was requested (the caller tracks it until `mdr_received`
    /// fires). `encrypted` marks a body an external crypto hook already
    /// transformed; with carbons enabled such messages are flagged
    /// private so the server won't mirror them.
    pub fn send_message(
        &mut self,
        to: &str,
        body: &str,
        subject: Option<&str>,
        encrypted: bool,
    ) -> Option<String> {
        if !self.is_online() {
            return None;
        }
        let bjid = jid::bare_lower(to);
        let is_room = self.roster.kind_of(&bjid) & kind::ROOM != 0 && jid::resource_of(to).is_none();

        let mut message = Element::new("message")
            .with_attr("to", to)
            .with_attr("type", if is_room { "groupchat" } else { "chat" });
        message.push_child(Element::new("body").with_text(body));
        if let Some(subject) = subject {
            message.push_child(Element::new("subject").with_text(subject));
        }
        if encrypted && self.carbons_enabled {
            message.push_child(Element::new("private").with_attr("xmlns", ns::CARBONS_2));
        }

        let resource = jid::resource_of(to);
        let mut receipt_id = None;
        if !is_room {
            // Receipt request, when the peer's caps advertise support
            let caps_ver = self.roster.resource_caps(&bjid, resource);
            if let Some(ver) = caps_ver {
                if self.caps.has_feature(&ver, ns::RECEIPTS, Some(&bjid)) {
                    let id = self.new_stanza_id();
                    message.set_attr("id", id.clone());
                    message
                        .push_child(Element::new("request").with_attr("xmlns", ns::RECEIPTS));
                    receipt_id = Some(id);
                }
            }

            // XEP-0085 §5.1: attach `active` and probe until the peer
            // answers with any chat state
            if !self.config.disable_chatstates {
                if let Some(states) = self.roster.chat_states_mut(&bjid, resource) {
                    if matches!(
                        states.support,
                        ChatStateSupport::Ok | ChatStateSupport::Unknown
                    ) {
                        if states.support == ChatStateSupport::Unknown {
                            states.support = ChatStateSupport::Probed;
                        }
                        states.last_sent = Some(ChatState::Active);
                        message.push_child(
                            Element::new("active").with_attr("xmlns", ns::CHATSTATES),
                        );
                    }
                }
            }
        }

        self.update_last_use();
        self.send(&message);

        let args = hooks::args(&[
            ("jid", bjid.as_str()),
            ("message", body),
            ("encrypted", if encrypted { "1" } else { "0" }),
            ("carbon", "0"),
        ]);
        self.hooks.run(hooks::MESSAGE_OUT, &args);
        receipt_id
    }

    /// Sends a chat-state notification to the active (or best) resource
    /// that confirmed support, skipping repeats of the same state.
    pub fn send_chat_state(&mut self, bjid: &str, state: ChatState) {
        if !self.is_online() || self.config.disable_chatstates {
            return;
        }
        let bjid = jid::bare_lower(bjid);
        if self.roster.kind_of(&bjid) & kind::ROOM != 0 {
            return;
        }
        let Some(contact) = self.roster.contact_by_jid(&bjid) else {
            return;
        };
        let Some(res) = contact.active_or_best_resource() else {
            return;
        };
        if res.chat_states.support != ChatStateSupport::Ok
            || res.chat_states.last_sent == Some(state)
        {
            return;
        }
        let resource = res.name.clone();
        let full = format!("{bjid}/{resource}");
        if let Some(states) = self.roster.chat_states_mut(&bjid, Some(&resource)) {
            states.last_sent = Some(state);
        }
        let stanza = stanzas::build_chat_state(&full, state);
        self.send(&stanza);
    }
}
