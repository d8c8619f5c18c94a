//! Presence: inbound handling (resource tracking, caps hints) and
//! outbound status changes.

use tracing::{debug, warn};

use super::bus::{HandlerVerdict, IqReply};
use super::element::Element;
use super::session::{status_name, Session};
use super::stanzas::{self, IqKind, ParsedPresence, PresenceKind};
use super::ns;
use crate::hooks;
use crate::jid;
use crate::roster::{kind, Presence};

impl Session {
    /// Built-in presence handler (runs in the `Last` tier; the
    /// subscription handler in the `Normal` tier consumes s10n subtypes
    /// before this one sees them).
    pub fn handle_presence_stanza(&mut self, el: &Element) -> HandlerVerdict {
        let Some(parsed) = stanzas::parse_presence(el) else {
            warn!("Unexpected presence packet (no sender)");
            return HandlerVerdict::Consume;
        };
        if parsed.kind.is_subscription() || parsed.kind == PresenceKind::Probe {
            return HandlerVerdict::AllowMore;
        }

        if self.config.ignore_self_presence {
            if let Some(self_jid) = self.self_jid() {
                if self_jid.eq_ignore_ascii_case(&parsed.from) {
                    return HandlerVerdict::AllowMore;
                }
            }
        }

        let bjid = jid::bare_lower(&parsed.from);
        let resource = jid::resource_of(&parsed.from);

        if parsed.kind == PresenceKind::Error {
            let error = parsed.error.clone().unwrap_or_else(|| stanzas::parse_error(el));
            self.logwindow(
                &bjid,
                &format!("Error presence packet from <{bjid}>: {}", error.describe()),
            );
            // Nickname conflict: forget the nick so the next join can
            // pick a fresh one
            if error.code == Some(409) || error.condition == "conflict" {
                if !self.roster.inside_room(&bjid) {
                    self.roster.set_nickname(&bjid, None);
                }
            }
            return HandlerVerdict::Consume;
        }

        if parsed.has_muc_user || self.roster.kind_of(&bjid) & kind::ROOM != 0 {
            self.handle_muc_presence(el, &parsed, &bjid, resource);
        } else {
            self.handle_buddy_presence(&parsed, &bjid, resource);
        }

        self.process_caps_hint(&parsed, &bjid, resource);
        HandlerVerdict::Consume
    }

    fn handle_buddy_presence(
        &mut self,
        parsed: &ParsedPresence,
        bjid: &str,
        resource: Option<&str>,
    ) {
        // Fire the hook only when something observable changed
        let old_status = self.roster.status(bjid, resource);
        let old_msg = self.roster.status_msg(bjid, resource);
        let old_prio = self.roster.prio_of(bjid, resource);
        let changed = parsed.presence != old_status
            || parsed.status_msg != old_msg
            || parsed.priority != old_prio;
        if changed {
            let args = hooks::args(&[
                ("jid", bjid),
                ("resource", resource.unwrap_or("")),
                ("old_status", status_name(old_status)),
                ("new_status", status_name(parsed.presence)),
                ("message", parsed.status_msg.as_deref().unwrap_or("")),
                ("priority", &parsed.priority.to_string()),
            ]);
            self.hooks.run(hooks::STATUS_CHANGE, &args);
        }

        self.roster.set_status(
            bjid,
            resource,
            parsed.priority,
            parsed.presence,
            parsed.status_msg.as_deref(),
            parsed.timestamp,
            Default::default(),
            Default::default(),
            None,
        );
    }

    /// Room member presence: the nickname is the resource; role,
    /// affiliation and (in non-anonymous rooms) the real jid ride in the
    /// muc#user extension.
    fn handle_muc_presence(
        &mut self,
        el: &Element,
        parsed: &ParsedPresence,
        room: &str,
        nick: Option<&str>,
    ) {
        if self.roster.contact_by_jid(room).is_none() {
            self.roster
                .add_user(room, None, None, kind::ROOM, Default::default(), None);
        } else if self.roster.kind_of(room) & kind::ROOM == 0 {
            self.roster.set_kind(room, kind::ROOM);
        }
        let (role, affil, real_jid) = stanzas::muc_item(el);
        self.roster.set_status(
            room,
            nick,
            parsed.priority,
            parsed.presence,
            parsed.status_msg.as_deref(),
            parsed.timestamp,
            role,
            affil,
            real_jid.as_deref(),
        );
        // Track whether this is us entering or leaving the room
        if let Some(nick) = nick {
            if self.roster.nickname(room).as_deref() == Some(nick) {
                self.roster
                    .set_inside_room(room, parsed.presence != Presence::Offline);
            }
        }
    }

    /// XEP-0115 hint processing: remember the ver on the resource and
    /// fetch the disco#info behind unknown hashes.
    fn process_caps_hint(
        &mut self,
        parsed: &ParsedPresence,
        bjid: &str,
        resource: Option<&str>,
    ) {
        let Some((node, ver, hash)) = parsed.caps.clone() else {
            return;
        };
        if parsed.presence == Presence::Offline {
            return;
        }
        let Some(resource) = resource else { return };
        // Only cache for contacts that live on the server roster
        if !self.roster.on_server(bjid) {
            return;
        }
        self.roster.set_resource_caps(bjid, resource, Some(&ver));

        if self.caps.has_hash(&ver, Some(bjid)) || self.caps.restore_from_persistent(&ver) {
            return;
        }

        debug!("querying caps {ver} from {}", parsed.from);
        let query = Element::new("query")
            .with_attr("xmlns", ns::DISCO_INFO)
            .with_attr("node", format!("{node}#{ver}"));
        let from = parsed.from.clone();
        let owner = bjid.to_string();
        self.send_iq(
            IqKind::Get,
            Some(&from),
            query,
            Box::new(move |session, reply| {
                let IqReply::Result(el) = reply else { return };
                session.store_caps_reply(&owner, &ver, &hash, el);
            }),
        );
    }

    /// Verifies a caps disco#info reply and files it globally (verified)
    /// or local to the sender (hash mismatch).
    pub(crate) fn store_caps_reply(&mut self, bjid: &str, ver: &str, hash: &str, el: &Element) {
        if self.caps.has_hash(ver, Some(bjid)) {
            return;
        }
        let Some(query) = el.find_xmlns(ns::DISCO_INFO) else {
            warn!("caps reply without disco#info query");
            return;
        };
        self.caps.add(ver);
        self.caps.merge_disco_info(ver, query);
        if self.caps.verify(ver, hash) {
            self.caps.copy_to_persistent(ver, &query.serialize());
        } else {
            self.caps.move_to_local(ver, bjid);
        }
    }

    // ── outbound presence ───────────────────────────────

    /// Announces a status. With `recipient == None` this is our global
    /// presence: it also goes to every joined room and updates the
    /// wanted-status memory used on reconnect.
    pub fn set_status(&mut self, status: Presence, recipient: Option<&str>, msg: Option<&str>) {
        let msg_owned: Option<String> = match msg {
            // "-" is the documented way to clear the message
            Some("-") => None,
            Some(m) => Some(m.to_string()),
            None => self.my_status_msg().map(str::to_string),
        };
        let msg = msg_owned.as_deref().filter(|m| !m.is_empty());

        let is_online = self.is_online();
        if is_online {
            let away = matches!(status, Presence::Away | Presence::NotAvailable);
            let prio = self.config.priority_for(away);
            let ver = self.entity_version(status);

            if recipient.is_none() && status != Presence::Invisible {
                // Global change: keep every joined room in the loop
                let mut rooms: Vec<String> = Vec::new();
                self.roster.for_each(kind::ROOM, |room| {
                    if room.inside_room {
                        rooms.push(room.jid.clone());
                    }
                });
                for room in rooms {
                    let pres = stanzas::build_presence(status, Some(&room), msg, prio, None);
                    self.send(&pres);
                }
            }

            let pres = stanzas::build_presence(status, recipient, msg, prio, Some(&ver));
            self.send(&pres);
        }

        if recipient.is_some() {
            return;
        }

        if is_online || status == Presence::Offline {
            let old = self.my_status();
            if old != status || msg != self.my_status_msg() {
                self.run_my_status_change_hook(old, status, msg);
            }
        }
        self.record_my_status(status, msg);
        if status != Presence::Invisible {
            self.update_last_use();
        }
    }

    /// Restores the wanted status, used right after (re)connecting.
    pub fn set_prev_status(&mut self) {
        let status = self.my_wanted_status();
        let msg = self.my_status_msg().map(str::to_string);
        self.set_status(status, None, msg.as_deref());
    }
}
