//! Presence subscription workflow.
//!
//! Inbound requests become pending events the user resolves later;
//! resolution answers with `subscribed`/`unsubscribed` on the wire.

use tracing::warn;

use super::bus::HandlerVerdict;
use super::element::Element;
use super::session::Session;
use super::stanzas::{self, PresenceKind};
use crate::events::{EventContext, EventKind};
use crate::hooks::{self, HookVerdict};
use crate::jid;
use crate::roster::Subscription;

impl Session {
    /// Built-in handler for subscription presences (`Normal` tier, ahead
    /// of the status handler).
    pub fn handle_s10n_stanza(&mut self, el: &Element) -> HandlerVerdict {
        let kind = PresenceKind::from_attr(el.attr("type"));
        if !kind.is_subscription() {
            return HandlerVerdict::AllowMore;
        }
        let Some(from) = el.attr("from") else {
            warn!("Subscription packet without sender");
            return HandlerVerdict::Consume;
        };
        let bjid = jid::bare_lower(from);
        let reason = el.child_text("status").filter(|s| !s.is_empty());

        let type_name = match kind {
            PresenceKind::Subscribe => "subscribe",
            PresenceKind::Subscribed => "subscribed",
            PresenceKind::Unsubscribe => "unsubscribe",
            _ => "unsubscribed",
        };
        let hook_args = hooks::args(&[
            ("type", type_name),
            ("jid", &bjid),
            ("message", reason.as_deref().unwrap_or("")),
        ]);
        let hook_verdict = self.hooks.run(hooks::SUBSCRIPTION, &hook_args);

        match kind {
            PresenceKind::Subscribe => {
                if hook_verdict != HookVerdict::AllowMore {
                    return HandlerVerdict::Consume;
                }
                let description =
                    format!("<{bjid}> wants to subscribe to your presence updates");
                self.logwindow(&bjid, &description);
                if let Some(reason) = &reason {
                    self.logwindow(&bjid, &format!("<{bjid}> said: {reason}"));
                }
                let id = self.events.create(
                    EventKind::Subscription,
                    &description,
                    &bjid,
                    None,
                );
                self.logwindow(&bjid, &format!("Please use /event {id} accept|reject"));
            }
            PresenceKind::Unsubscribe => {
                // The peer no longer wants our presence; confirm
                self.send_s10n(&bjid, "unsubscribed");
                self.logwindow(
                    &bjid,
                    &format!("<{bjid}> is unsubscribing from your presence updates"),
                );
            }
            PresenceKind::Subscribed => {
                self.logwindow(
                    &bjid,
                    &format!("<{bjid}> has allowed you to receive their presence updates"),
                );
            }
            PresenceKind::Unsubscribed => {
                self.roster.unsubscribed(&bjid);
                self.logwindow(
                    &bjid,
                    &format!(
                        "<{bjid}> has cancelled your subscription to their presence updates"
                    ),
                );
            }
            _ => unreachable!(),
        }
        HandlerVerdict::Consume
    }

    pub fn send_s10n(&mut self, bjid: &str, subtype: &str) {
        let stanza = stanzas::build_s10n(bjid, subtype);
        self.send(&stanza);
    }

    /// Resolves a pending subscription event.
    pub fn resolve_event(&mut self, event_id: &str, context: EventContext) {
        let Some(event) = self.events.take(event_id) else {
            warn!("no such event: {event_id}");
            return;
        };
        match event.kind {
            EventKind::Subscription => self.resolve_subscription(&event.peer, context),
        }
    }

    fn resolve_subscription(&mut self, bjid: &str, context: EventContext) {
        match context {
            EventContext::Accept => {
                self.send_s10n(bjid, "subscribed");
                self.logwindow(
                    bjid,
                    &format!("<{bjid}> is allowed to receive your presence updates"),
                );
            }
            EventContext::Reject => {
                self.send_s10n(bjid, "unsubscribed");
                self.logwindow(
                    bjid,
                    &format!("<{bjid}> won't receive your presence updates"),
                );
                if self.config.delete_on_reject
                    && self.roster.subscription(bjid) == Subscription::None
                {
                    self.del_buddy(bjid);
                }
            }
            EventContext::Cancel => {
                self.logwindow(bjid, &format!("Subscription event for {bjid} cancelled"));
            }
            EventContext::Timeout => {
                self.logwindow(
                    bjid,
                    &format!("Subscription event for {bjid} timed out, cancelled"),
                );
            }
        }
    }

    /// Auto-cancels events whose deadline passed; driven by the timer
    /// tick.
    pub(crate) fn expire_events(&mut self) {
        let expired = self.events.take_expired(std::time::Instant::now());
        for event in expired {
            match event.kind {
                EventKind::Subscription => {
                    self.resolve_subscription(&event.peer, EventContext::Timeout);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use crate::config::Config;
    use crate::roster::kind;
    use crate::xmpp::client::Client;
    use crate::xmpp::session::{test_config, SessionState};

    fn live_client() -> Client {
        let mut client = Client::new(test_config());
        client.session_mut().set_state(SessionState::Live);
        client.session_mut().take_outbound();
        client
    }

    fn feed(client: &mut Client, xml: &str) {
        let el = Element::parse(xml).unwrap();
        client.handle_stanza(&el);
    }

    #[test]
    fn test_subscribe_creates_event_and_accept_answers() {
        // Scenario: inbound subscribe → pending event → accept →
        // <presence type='subscribed'/>
        let mut client = live_client();
        feed(&mut client, "<presence from='carol@ex' type='subscribe'/>");
        let events = client.session().events.list();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].peer, "carol@ex");
        let id = events[0].id.clone();

        client.session_mut().take_outbound();
        client.session_mut().resolve_event(&id, EventContext::Accept);
        let out = client.session_mut().take_outbound().join("");
        assert!(out.contains("<presence to='carol@ex' type='subscribed'/>"));
        assert!(client.session().events.is_empty());
    }

    #[test]
    fn test_reject_sends_unsubscribed() {
        let mut client = live_client();
        feed(&mut client, "<presence from='carol@ex' type='subscribe'/>");
        let id = client.session().events.list()[0].id.clone();
        client.session_mut().take_outbound();
        client.session_mut().resolve_event(&id, EventContext::Reject);
        let out = client.session_mut().take_outbound().join("");
        assert!(out.contains("<presence to='carol@ex' type='unsubscribed'/>"));
    }

    #[test]
    fn test_reject_with_delete_on_reject_removes_contact() {
        let config = Config::from_toml(
            "jid = 'me@example.org'\npassword = 'pw'\ndelete_on_reject = true\n",
        )
        .unwrap();
        let mut client = Client::new(config);
        client.session_mut().set_state(SessionState::Live);
        client.session_mut().roster.add_user(
            "carol@ex",
            None,
            None,
            kind::USER,
            Subscription::None,
            Some(true),
        );
        feed(&mut client, "<presence from='carol@ex' type='subscribe'/>");
        let id = client.session().events.list()[0].id.clone();
        client.session_mut().resolve_event(&id, EventContext::Reject);
        assert!(client.session().roster.contact_by_jid("carol@ex").is_none());
        let out = client.session_mut().take_outbound().join("");
        assert!(out.contains("subscription='remove'"));
    }

    #[test]
    fn test_reject_keeps_contact_with_existing_subscription() {
        let config = Config::from_toml(
            "jid = 'me@example.org'\npassword = 'pw'\ndelete_on_reject = true\n",
        )
        .unwrap();
        let mut client = Client::new(config);
        client.session_mut().set_state(SessionState::Live);
        client.session_mut().roster.add_user(
            "carol@ex",
            None,
            None,
            kind::USER,
            Subscription::To,
            Some(true),
        );
        feed(&mut client, "<presence from='carol@ex' type='subscribe'/>");
        let id = client.session().events.list()[0].id.clone();
        client.session_mut().resolve_event(&id, EventContext::Reject);
        assert!(client.session().roster.contact_by_jid("carol@ex").is_some());
    }

    #[test]
    fn test_subscription_hook_can_suppress_event() {
        let mut client = live_client();
        client
            .session_mut()
            .hooks
            .add_handler(hooks::SUBSCRIPTION, 0, |_, _| HookVerdict::Consume);
        feed(&mut client, "<presence from='carol@ex' type='subscribe'/>");
        assert!(client.session().events.is_empty());
    }

    #[test]
    fn test_unsubscribe_answered_automatically() {
        let mut client = live_client();
        feed(&mut client, "<presence from='carol@ex' type='unsubscribe'/>");
        let out = client.session_mut().take_outbound().join("");
        assert!(out.contains("<presence to='carol@ex' type='unsubscribed'/>"));
    }

    #[test]
    fn test_unsubscribed_wipes_resources() {
        let mut client = live_client();
        feed(&mut client, "<presence from='carol@ex/x'/>");
        assert_eq!(client.session().roster.resources("carol@ex"), vec!["x"]);
        feed(&mut client, "<presence from='carol@ex' type='unsubscribed'/>");
        assert!(client.session().roster.resources("carol@ex").is_empty());
    }

    #[test]
    fn test_subscribe_with_reason_logged() {
        let mut client = live_client();
        let lines = Arc::new(Mutex::new(Vec::new()));
        let l = lines.clone();
        client
            .session_mut()
            .hooks
            .add_handler(hooks::LOGWINDOW, 0, move |_, args| {
                if let Some((_, text)) = args.iter().find(|(n, _)| n == "text") {
                    l.lock().unwrap().push(text.clone());
                }
                HookVerdict::AllowMore
            });
        feed(
            &mut client,
            "<presence from='carol@ex' type='subscribe'>\
             <status>it's me, carol</status></presence>",
        );
        let lines = lines.lock().unwrap();
        assert!(lines.iter().any(|l| l.contains("wants to subscribe")));
        assert!(lines.iter().any(|l| l.contains("it's me, carol")));
    }

    #[test]
    fn test_resolve_unknown_event_is_noop() {
        let mut client = live_client();
        client.session_mut().resolve_event("42", EventContext::Accept);
        assert!(client.session_mut().take_outbound().is_empty());
    }
}
