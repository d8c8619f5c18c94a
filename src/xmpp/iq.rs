//! IQ services: typed requests with correlated replies, the inbound
//! get/set responders, roster synchronization, and server-side private
//! storage (bookmarks, rosternotes).

use std::time::Instant;

use chrono::{DateTime, SecondsFormat, Utc};
use tracing::{debug, warn};

use super::bus::{HandlerVerdict, IqReply};
use super::element::Element;
use super::session::Session;
use super::stanzas::{self, IqKind};
use super::ns;
use crate::hooks;
use crate::jid;
use crate::roster::{kind, AutoWhois, FlagJoins, Presence, PrintStatus, Subscription};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IqRequestKind {
    Version,
    Time,
    Last,
    Ping,
    Vcard,
}

impl IqRequestKind {
    fn label(self) -> &'static str {
        match self {
            IqRequestKind::Version => "version",
            IqRequestKind::Time => "time",
            IqRequestKind::Last => "last",
            IqRequestKind::Ping => "ping",
            IqRequestKind::Vcard => "vCard",
        }
    }

    fn child(self) -> Element {
        match self {
            IqRequestKind::Version => Element::new("query").with_attr("xmlns", ns::VERSION),
            IqRequestKind::Time => Element::new("time").with_attr("xmlns", ns::XMPP_TIME),
            IqRequestKind::Last => Element::new("query").with_attr("xmlns", ns::LAST),
            IqRequestKind::Ping => Element::new("ping").with_attr("xmlns", ns::PING),
            IqRequestKind::Vcard => Element::new("vCard").with_attr("xmlns", ns::VCARD),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Bookmark {
    pub roomjid: String,
    pub name: Option<String>,
    pub nick: Option<String>,
    pub password: Option<String>,
    pub autojoin: bool,
    pub print_status: PrintStatus,
    pub auto_whois: AutoWhois,
    pub flag_joins: FlagJoins,
    pub group: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RosterNote {
    pub jid: String,
    pub cdate: Option<DateTime<Utc>>,
    pub mdate: Option<DateTime<Utc>>,
    pub text: String,
}

impl Session {
    // ── typed requests ──────────────────────────────────

    /// Sends a request to a contact. Bare jids fan out to every known
    /// resource (vCards always go to the bare jid).
    pub fn request(&mut self, to: &str, kind_req: IqRequestKind) {
        if !self.is_online() {
            return;
        }
        let is_room = self.roster.kind_of(to) & kind::ROOM != 0;
        let vcard_to_user = kind_req == IqRequestKind::Vcard && !is_room;

        if jid::resource_of(to).is_some() || vcard_to_user {
            self.send_typed_request(to, kind_req);
            return;
        }
        let resources = self.roster.resources(to);
        if resources.is_empty() {
            // No known resource; ask the bare jid anyway
            self.send_typed_request(to, kind_req);
            return;
        }
        for resource in resources {
            let full = format!("{to}/{resource}");
            self.send_typed_request(&full, kind_req);
        }
    }

    fn send_typed_request(&mut self, to: &str, kind_req: IqRequestKind) {
        let to_owned = to.to_string();
        let sent_at = Instant::now();
        self.send_iq(
            IqKind::Get,
            Some(to),
            kind_req.child(),
            Box::new(move |session, reply| {
                session.handle_typed_reply(&to_owned, kind_req, sent_at, reply);
            }),
        );
        self.logwindow(
            &jid::bare_lower(to),
            &format!("Sent {} request to <{to}>", kind_req.label()),
        );
    }

    fn handle_typed_reply(
        &mut self,
        from: &str,
        kind_req: IqRequestKind,
        sent_at: Instant,
        reply: IqReply,
    ) {
        let bjid = jid::bare_lower(from);
        let el = match reply {
            IqReply::Result(el) => el,
            IqReply::Error(el) => {
                let error = stanzas::parse_error(el);
                self.logwindow(
                    &bjid,
                    &format!(
                        "{} request to <{from}> failed: {}",
                        kind_req.label(),
                        error.describe()
                    ),
                );
                return;
            }
            IqReply::Timeout => {
                self.logwindow(
                    &bjid,
                    &format!("{} request to <{from}> timed out", kind_req.label()),
                );
                return;
            }
            IqReply::Disconnected => return,
        };
        let el = el.clone();
        match kind_req {
            IqRequestKind::Ping => {
                let elapsed = sent_at.elapsed();
                self.logwindow(
                    &bjid,
                    &format!(
                        "Pong from <{from}>: {}.{:03} s",
                        elapsed.as_secs(),
                        elapsed.subsec_millis()
                    ),
                );
            }
            IqRequestKind::Version => {
                let Some(query) = el.find_xmlns(ns::VERSION) else {
                    self.logwindow(&bjid, &format!("Invalid version result from <{from}>"));
                    return;
                };
                self.logwindow(&bjid, &format!("Version result from <{from}>"));
                for (label, field) in
                    [("Name", "name"), ("Version", "version"), ("OS", "os")]
                {
                    if let Some(value) = query.child_text(field).filter(|v| !v.is_empty()) {
                        self.logwindow(&bjid, &format!("{label}: {value}"));
                    }
                }
            }
            IqRequestKind::Time => {
                let Some(time) = el.find_xmlns(ns::XMPP_TIME) else {
                    self.logwindow(&bjid, &format!("Invalid time result from <{from}>"));
                    return;
                };
                self.logwindow(&bjid, &format!("Time result from <{from}>"));
                for (label, field) in [("UTC", "utc"), ("TZ", "tzo")] {
                    if let Some(value) = time.child_text(field).filter(|v| !v.is_empty()) {
                        self.logwindow(&bjid, &format!("{label}: {value}"));
                    }
                }
            }
            IqRequestKind::Last => {
                let Some(query) = el.find_xmlns(ns::LAST) else {
                    self.logwindow(&bjid, &format!("Invalid last result from <{from}>"));
                    return;
                };
                match query.attr("seconds").and_then(|s| s.parse::<u64>().ok()) {
                    Some(seconds) => {
                        let (h, m, s) =
                            (seconds / 3600, (seconds % 3600) / 60, seconds % 60);
                        self.logwindow(
                            &bjid,
                            &format!("Idle time for <{from}>: {h:02}:{m:02}:{s:02}"),
                        );
                    }
                    None => {
                        self.logwindow(&bjid, &format!("No idle time reported by <{from}>"));
                    }
                }
                let status = query.text();
                if !status.is_empty() {
                    self.logwindow(&bjid, &format!("Status message: {status}"));
                }
            }
            IqRequestKind::Vcard => {
                let Some(vcard) = el.find_xmlns(ns::VCARD) else {
                    self.logwindow(&bjid, &format!("Empty vCard result from <{from}>"));
                    return;
                };
                self.logwindow(&bjid, &format!("vCard result from <{from}>"));
                for line in vcard_lines(vcard) {
                    self.logwindow(&bjid, &line);
                }
            }
        }
    }

    // ── roster synchronization ──────────────────────────

    /// Initial roster fetch; the post-connect hook fires when it lands.
    pub(crate) fn request_roster(&mut self) {
        let query = Element::new("query").with_attr("xmlns", ns::ROSTER);
        self.send_iq(
            IqKind::Get,
            None,
            query,
            Box::new(|session, reply| {
                if let IqReply::Result(el) = reply {
                    if let Some(query) = el.find_xmlns(ns::ROSTER).cloned() {
                        session.apply_roster_items(&query);
                    }
                    session.hooks.run(hooks::POST_CONNECT, &[]);
                }
            }),
        );
    }

    /// Applies `<item/>` entries from a roster result or push.
    pub(crate) fn apply_roster_items(&mut self, query: &Element) {
        for item in query.child_elements().filter(|c| c.name == "item") {
            let Some(item_jid) = item.attr("jid") else {
                warn!("roster item without jid");
                continue;
            };
            let subscription = item
                .attr("subscription")
                .map(Subscription::from_attr)
                .unwrap_or_default();
            if subscription == Subscription::Remove {
                self.roster.del_user(item_jid);
                continue;
            }
            let ask_pending = item.attr("ask") == Some("subscribe");
            let subscription = if ask_pending && subscription == Subscription::None {
                Subscription::Pending
            } else {
                subscription
            };
            let name = item.attr("name");
            let group = item.child_text("group");
            // Entries without a node are gateways/agents
            let kind_val = if item_jid.contains(jid::DOMAIN_SEPARATOR) {
                kind::USER
            } else {
                kind::AGENT
            };
            self.roster.add_user(
                item_jid,
                name,
                group.as_deref(),
                kind_val,
                subscription,
                Some(true),
            );
        }
    }

    // ── server feature discovery ────────────────────────

    pub(crate) fn request_server_disco_info(&mut self) {
        let domain = self.config.domain().to_string();
        let query = Element::new("query").with_attr("xmlns", ns::DISCO_INFO);
        self.send_iq(
            IqKind::Get,
            Some(&domain),
            query,
            Box::new(|session, reply| {
                let IqReply::Result(el) = reply else { return };
                let Some(query) = el.find_xmlns(ns::DISCO_INFO) else { return };
                let has_carbons = query
                    .child_elements()
                    .any(|c| c.name == "feature" && c.attr("var") == Some(ns::CARBONS_2));
                if has_carbons {
                    session.carbons_available();
                }
            }),
        );
    }

    // ── inbound iq ──────────────────────────────────────

    /// Built-in iq handler: answers the namespaces we serve and applies
    /// roster pushes. Unhandled `get`/`set` falls through to the
    /// fallback handler.
    pub fn handle_iq_stanza(&mut self, el: &Element) -> HandlerVerdict {
        let iq_kind = IqKind::from_attr(el.attr("type"));
        match iq_kind {
            Some(IqKind::Error) => {
                let error = stanzas::parse_error(el);
                let from = el.attr("from").unwrap_or("server");
                self.logwindow(
                    &jid::bare_lower(from),
                    &format!("Received error packet [{}] from <{from}>", error.describe()),
                );
                return HandlerVerdict::Consume;
            }
            Some(IqKind::Result) => {
                debug!("unhandled iq result {:?}", el.attr("id"));
                return HandlerVerdict::AllowMore;
            }
            _ => {}
        }

        for child in el.child_elements() {
            let Some(xmlns) = child.xmlns() else { continue };
            let handled = match (xmlns, iq_kind) {
                (ns::ROSTER, Some(IqKind::Set)) => {
                    let query = child.clone();
                    self.apply_roster_items(&query);
                    let ack = stanzas::build_iq_result(el, None);
                    self.send(&ack);
                    true
                }
                (ns::PING, Some(IqKind::Get)) => {
                    let pong = stanzas::build_iq_result(el, None);
                    self.send(&pong);
                    true
                }
                (ns::VERSION, Some(IqKind::Get)) => {
                    let reply = stanzas::build_iq_result(
                        el,
                        Some(
                            Element::new("query")
                                .with_attr("xmlns", ns::VERSION)
                                .with_child(Element::new("name").with_text("swiftlet"))
                                .with_child(
                                    Element::new("version")
                                        .with_text(env!("CARGO_PKG_VERSION")),
                                )
                                .with_child(
                                    Element::new("os").with_text(std::env::consts::OS),
                                ),
                        ),
                    );
                    self.send(&reply);
                    true
                }
                (ns::XMPP_TIME, Some(IqKind::Get)) => {
                    let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
                    let reply = stanzas::build_iq_result(
                        el,
                        Some(
                            Element::new("time")
                                .with_attr("xmlns", ns::XMPP_TIME)
                                .with_child(Element::new("tzo").with_text("+00:00"))
                                .with_child(Element::new("utc").with_text(now)),
                        ),
                    );
                    self.send(&reply);
                    true
                }
                (ns::LAST, Some(IqKind::Get)) => {
                    let disabled = self.config.iq_last_disable
                        || (self.config.iq_last_disable_when_notavail
                            && self.my_status() == Presence::NotAvailable);
                    let reply = if disabled {
                        stanzas::build_iq_error_reply(el, 503)
                    } else {
                        stanzas::build_iq_result(
                            el,
                            Some(
                                Element::new("query")
                                    .with_attr("xmlns", ns::LAST)
                                    .with_attr("seconds", self.idle_seconds().to_string()),
                            ),
                        )
                    };
                    self.send(&reply);
                    true
                }
                (ns::DISCO_INFO, Some(IqKind::Get)) => {
                    let node = child.attr("node").map(str::to_string);
                    let reply = self.build_disco_info_reply(el, node.as_deref());
                    self.send(&reply);
                    true
                }
                (ns::DISCO_ITEMS, Some(IqKind::Get)) => {
                    let reply = stanzas::build_iq_result(
                        el,
                        Some(Element::new("query").with_attr("xmlns", ns::DISCO_ITEMS)),
                    );
                    self.send(&reply);
                    true
                }
                _ => false,
            };
            if handled {
                return HandlerVerdict::Consume;
            }
        }
        HandlerVerdict::AllowMore
    }

    /// Fallback (`Last` tier): any `get`/`set` nobody answered gets
    /// `feature-not-implemented`.
    pub fn handle_iq_fallback(&mut self, el: &Element) -> HandlerVerdict {
        match IqKind::from_attr(el.attr("type")) {
            Some(IqKind::Get) | Some(IqKind::Set) => {
                debug!("unhandled iq request from {:?}", el.attr("from"));
                let reply = stanzas::build_iq_error_reply(el, 501);
                self.send(&reply);
                HandlerVerdict::Consume
            }
            _ => HandlerVerdict::Consume,
        }
    }

    fn build_disco_info_reply(&mut self, iq: &Element, node: Option<&str>) -> Element {
        let status = self.my_status();
        let own_node = self.own_caps_node(status);
        let ver = self.entity_version(status);
        if let Some(node) = node {
            if node != own_node && node != super::CAPS_NODE {
                return stanzas::build_iq_error_reply(iq, 404);
            }
        }
        let entry = self
            .caps
            .entry(&ver, None)
            .cloned()
            .unwrap_or_default();
        stanzas::build_iq_result(iq, Some(entry.to_disco_info(node)))
    }

    // ── private storage ─────────────────────────────────

    pub(crate) fn request_storage(&mut self, storage_ns: &'static str) {
        let query = Element::new("query").with_attr("xmlns", ns::PRIVATE).with_child(
            Element::new("storage").with_attr("xmlns", storage_ns),
        );
        self.send_iq(
            IqKind::Get,
            None,
            query,
            Box::new(move |session, reply| session.handle_storage_reply(storage_ns, reply)),
        );
    }

    fn handle_storage_reply(&mut self, storage_ns: &'static str, reply: IqReply) {
        let storage = match reply {
            IqReply::Result(el) => el
                .find_xmlns(ns::PRIVATE)
                .and_then(|q| q.find_xmlns(storage_ns))
                .cloned(),
            IqReply::Error(el) => {
                let error = stanzas::parse_error(el);
                if error.condition == "item-not-found" {
                    // The server supports private storage; it is just empty
                    Some(Element::new("storage").with_attr("xmlns", storage_ns))
                } else {
                    warn!("private storage request failed: {}", error.describe());
                    return;
                }
            }
            _ => return,
        };
        let Some(storage) = storage else {
            warn!("invalid private storage result ({storage_ns})");
            return;
        };
        match storage_ns {
            ns::STORAGE_BOOKMARKS => {
                let bookmarks: Vec<Bookmark> = storage
                    .child_elements()
                    .filter(|c| c.name == "conference")
                    .filter_map(parse_bookmark)
                    .collect();
                for bookmark in &bookmarks {
                    self.apply_bookmark(bookmark);
                }
                self.bookmarks = Some(storage);
            }
            ns::STORAGE_ROSTERNOTES => {
                self.rosternotes = Some(storage);
            }
            _ => {}
        }
    }

    /// Bookmarked rooms appear in the roster; autojoin ones are entered.
    fn apply_bookmark(&mut self, bookmark: &Bookmark) {
        let bjid = jid::bare_lower(&bookmark.roomjid);
        if self.roster.contact_by_jid(&bjid).is_none() {
            self.roster.add_user(
                &bjid,
                bookmark.name.as_deref(),
                bookmark.group.as_deref(),
                kind::ROOM,
                Subscription::None,
                None,
            );
        } else {
            self.roster.set_kind(&bjid, kind::ROOM);
        }
        self.roster.set_print_status(&bjid, bookmark.print_status);
        self.roster.set_auto_whois(&bjid, bookmark.auto_whois);
        self.roster.set_flag_joins(&bjid, bookmark.flag_joins);
        if bookmark.autojoin {
            let nick = bookmark
                .nick
                .clone()
                .unwrap_or_else(|| self.config.username().to_string());
            self.logwindow(&bjid, &format!("Auto-join bookmark <{bjid}>"));
            self.join_muc(&bjid, &nick, bookmark.password.as_deref());
        }
    }

    /// Re-sends a whole storage subtree after a local update.
    fn send_storage(&mut self, storage: Element) {
        let query = Element::new("query")
            .with_attr("xmlns", ns::PRIVATE)
            .with_child(storage);
        self.send_iq_ignore_result(IqKind::Set, None, query);
    }

    pub fn bookmarks(&self) -> Vec<Bookmark> {
        let Some(bookmarks) = &self.bookmarks else {
            return Vec::new();
        };
        bookmarks
            .child_elements()
            .filter(|c| c.name == "conference")
            .filter_map(parse_bookmark)
            .collect()
    }

    pub fn is_bookmarked(&self, roomjid: &str) -> bool {
        self.bookmark(roomjid).is_some()
    }

    pub fn bookmark(&self, roomjid: &str) -> Option<Bookmark> {
        self.bookmarks()
            .into_iter()
            .find(|b| b.roomjid.eq_ignore_ascii_case(roomjid))
    }

    /// Adds or replaces the bookmark for a room. Requires the storage to
    /// have been fetched (server support).
    pub fn set_bookmark(&mut self, bookmark: Bookmark) {
        let Some(mut storage) = self.bookmarks.clone() else {
            self.logwindow(
                &jid::bare_lower(&bookmark.roomjid),
                "Sorry, your server doesn't seem to support private storage",
            );
            return;
        };
        let roomjid = bookmark.roomjid.clone();
        storage.retain_children(|c| {
            !(c.name == "conference" && c.attr("jid") == Some(roomjid.as_str()))
        });
        let mut conference = Element::new("conference")
            .with_attr("jid", &bookmark.roomjid)
            .with_attr("autojoin", if bookmark.autojoin { "1" } else { "0" });
        if let Some(name) = &bookmark.name {
            conference.set_attr("name", name);
        }
        if bookmark.auto_whois != AutoWhois::Default {
            conference.set_attr(
                "autowhois",
                if bookmark.auto_whois == AutoWhois::On { "1" } else { "0" },
            );
        }
        if let Some(nick) = &bookmark.nick {
            conference.push_child(Element::new("nick").with_text(nick));
        }
        if let Some(password) = &bookmark.password {
            conference.push_child(Element::new("password").with_text(password));
        }
        if bookmark.print_status != PrintStatus::Default {
            conference.push_child(
                Element::new("print_status").with_text(bookmark.print_status.as_str()),
            );
        }
        if bookmark.flag_joins != FlagJoins::Default {
            conference.push_child(
                Element::new("flag_joins").with_text(bookmark.flag_joins.as_str()),
            );
        }
        if let Some(group) = bookmark.group.as_ref().filter(|g| !g.is_empty()) {
            conference.push_child(Element::new("group").with_text(group));
        }
        storage.push_child(conference);
        self.bookmarks = Some(storage.clone());
        if self.is_online() {
            self.send_storage(storage);
        }
    }

    /// Deletes the bookmark for a room, if any.
    pub fn del_bookmark(&mut self, roomjid: &str) {
        let Some(mut storage) = self.bookmarks.clone() else {
            return;
        };
        let before = storage.children.len();
        storage.retain_children(|c| {
            !(c.name == "conference" && c.attr("jid") == Some(roomjid))
        });
        if storage.children.len() == before {
            return;
        }
        self.logwindow(&jid::bare_lower(roomjid), "Deleting bookmark...");
        self.bookmarks = Some(storage.clone());
        if self.is_online() {
            self.send_storage(storage);
        }
    }

    pub fn rosternotes(&self) -> Vec<RosterNote> {
        let Some(notes) = &self.rosternotes else {
            return Vec::new();
        };
        notes
            .child_elements()
            .filter(|c| c.name == "note")
            .filter_map(parse_rosternote)
            .collect()
    }

    pub fn rosternote(&self, bjid: &str) -> Option<RosterNote> {
        self.rosternotes()
            .into_iter()
            .find(|n| n.jid.eq_ignore_ascii_case(bjid))
    }

    /// Adds, replaces or (with `None`) deletes the note for a contact,
    /// preserving its creation date across edits.
    pub fn set_rosternote(&mut self, bjid: &str, note: Option<&str>) {
        let Some(mut storage) = self.rosternotes.clone() else {
            self.logwindow(
                bjid,
                "Sorry, your server doesn't seem to support private storage",
            );
            return;
        };
        let mut cdate: Option<String> = None;
        for child in storage.child_elements() {
            if child.name == "note" && child.attr("jid") == Some(bjid) {
                cdate = child.attr("cdate").map(str::to_string);
            }
        }
        storage.retain_children(|c| !(c.name == "note" && c.attr("jid") == Some(bjid)));
        if let Some(note) = note {
            let mdate = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
            let cdate = cdate.unwrap_or_else(|| mdate.clone());
            storage.push_child(
                Element::new("note")
                    .with_attr("jid", bjid)
                    .with_attr("cdate", cdate)
                    .with_attr("mdate", mdate)
                    .with_text(note),
            );
        }
        self.rosternotes = Some(storage.clone());
        if self.is_online() {
            self.send_storage(storage);
        }
    }

    // ── buddy management ────────────────────────────────

    /// Adds a contact to the server roster and asks for its presence.
    pub fn add_buddy(&mut self, bjid: &str, name: Option<&str>, group: Option<&str>) {
        if !self.is_online() {
            return;
        }
        let clean = jid::bare_lower(bjid);
        self.send_roster_item(&clean, name, group, None);
        self.send_s10n(&clean, "subscribe");
        self.roster.add_user(
            &clean,
            name,
            group,
            kind::USER,
            Subscription::Pending,
            None,
        );
    }

    /// Renames or regroups a contact on the server roster.
    pub fn update_buddy(&mut self, bjid: &str, name: Option<&str>, group: Option<&str>) {
        if !self.is_online() {
            return;
        }
        let clean = jid::bare_lower(bjid);
        self.send_roster_item(&clean, name, group, None);
    }

    /// Removes a contact: cancels both subscription directions, then
    /// asks the server to drop the roster item. Gateways are
    /// unregistered first.
    pub fn del_buddy(&mut self, bjid: &str) {
        if !self.is_online() {
            return;
        }
        let clean = jid::bare_lower(bjid);
        if self.roster.kind_of(&clean) & kind::AGENT != 0 {
            self.logwindow(&clean, &format!("Unregistering from the {clean} agent"));
            let remove = Element::new("query")
                .with_attr("xmlns", ns::REGISTER)
                .with_child(Element::new("remove"));
            self.send_iq_ignore_result(IqKind::Set, Some(&clean), remove);
        }
        self.send_s10n(&clean, "unsubscribed"); // cancel "from"
        self.send_s10n(&clean, "unsubscribe"); // cancel "to"
        self.send_roster_item(&clean, None, None, Some("remove"));
        self.roster.del_user(&clean);
    }

    fn send_roster_item(
        &mut self,
        bjid: &str,
        name: Option<&str>,
        group: Option<&str>,
        subscription: Option<&str>,
    ) {
        let mut item = Element::new("item").with_attr("jid", bjid);
        if let Some(name) = name {
            item.set_attr("name", name);
        }
        if let Some(subscription) = subscription {
            item.set_attr("subscription", subscription);
        }
        if let Some(group) = group.filter(|g| !g.is_empty()) {
            item.push_child(Element::new("group").with_text(group));
        }
        let query = Element::new("query")
            .with_attr("xmlns", ns::ROSTER)
            .with_child(item);
        self.send_iq_ignore_result(IqKind::Set, None, query);
    }

    /// Joins a chat room and remembers the nickname.
    pub fn join_muc(&mut self, roomjid: &str, nick: &str, password: Option<&str>) {
        let room = jid::bare_lower(roomjid);
        if self.roster.contact_by_jid(&room).is_none() {
            self.roster
                .add_user(&room, None, None, kind::ROOM, Subscription::None, None);
        } else {
            self.roster.set_kind(&room, kind::ROOM);
        }
        self.roster.set_nickname(&room, Some(nick));
        let join = stanzas::build_muc_join(&room, nick, password);
        self.send(&join);
    }
}

fn parse_bookmark(conference: &Element) -> Option<Bookmark> {
    let roomjid = conference.attr("jid")?.to_string();
    let autojoin = matches!(conference.attr("autojoin"), Some("1") | Some("true"));
    Some(Bookmark {
        roomjid,
        name: conference.attr("name").map(str::to_string),
        nick: conference.child_text("nick").filter(|n| !n.is_empty()),
        password: conference.child_text("password").filter(|p| !p.is_empty()),
        autojoin,
        print_status: conference
            .child_text("print_status")
            .and_then(|s| PrintStatus::from_name(&s))
            .unwrap_or_default(),
        auto_whois: conference
            .attr("autowhois")
            .map(AutoWhois::from_flag)
            .unwrap_or_default(),
        flag_joins: conference
            .child_text("flag_joins")
            .and_then(|s| FlagJoins::from_name(&s))
            .unwrap_or_default(),
        group: conference.child_text("group").filter(|g| !g.is_empty()),
    })
}

fn parse_rosternote(note: &Element) -> Option<RosterNote> {
    let jid_attr = note.attr("jid")?.to_string();
    let parse_date = |attr: &str| {
        note.attr(attr)
            .and_then(|d| DateTime::parse_from_rfc3339(d).ok())
            .map(|d| d.with_timezone(&Utc))
    };
    Some(RosterNote {
        jid: jid_attr,
        cdate: parse_date("cdate"),
        mdate: parse_date("mdate"),
        text: note.text(),
    })
}

/// Flattens a vCard into display lines, tagging address/phone/email
/// entries with their context attributes.
fn vcard_lines(vcard: &Element) -> Vec<String> {
    let mut lines = Vec::new();
    let mut push = |label: &str, tags: &str, value: Option<String>| {
        if let Some(value) = value.filter(|v| !v.is_empty()) {
            if tags.is_empty() {
                lines.push(format!("{label}: {value}"));
            } else {
                lines.push(format!("{label}: {tags} {value}"));
            }
        }
    };
    for field in vcard.child_elements() {
        match field.name.as_str() {
            "FN" => push("Name", "", Some(field.text())),
            "NICKNAME" => push("Nickname", "", Some(field.text())),
            "URL" => push("URL", "", Some(field.text())),
            "BDAY" => push("Birthday", "", Some(field.text())),
            "TZ" => push("Timezone", "", Some(field.text())),
            "TITLE" => push("Title", "", Some(field.text())),
            "ROLE" => push("Role", "", Some(field.text())),
            "DESC" => push("Comment", "", Some(field.text())),
            "N" => {
                push("Family Name", "", field.child_text("FAMILY"));
                push("Given Name", "", field.child_text("GIVEN"));
                push("Middle Name", "", field.child_text("MIDDLE"));
            }
            "ORG" => {
                push("Organisation name", "", field.child_text("ORGNAME"));
                push("Organisation unit", "", field.child_text("ORGUNIT"));
            }
            "ADR" | "TEL" | "EMAIL" => {
                let mut tags = String::new();
                for tag in ["HOME", "WORK", "POSTAL", "VOICE", "FAX", "CELL", "INTERNET", "PREF"]
                {
                    if field.child(tag).is_some() {
                        tags.push_str(&format!("[{}]", tag.to_lowercase()));
                    }
                }
                match field.name.as_str() {
                    "ADR" => {
                        push("Addr (ext)", &tags, field.child_text("EXTADD"));
                        push("Street", &tags, field.child_text("STREET"));
                        push("Locality", &tags, field.child_text("LOCALITY"));
                        push("Region", &tags, field.child_text("REGION"));
                        push("Postal code", &tags, field.child_text("PCODE"));
                        push("Country", &tags, field.child_text("CTRY"));
                    }
                    "TEL" => push("Phone", &tags, field.child_text("NUMBER")),
                    _ => push("Email", &tags, field.child_text("USERID")),
                }
            }
            _ => {}
        }
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use crate::hooks::HookVerdict;
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

    fn capture_log(client: &mut Client) -> Arc<Mutex<Vec<String>>> {
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
        lines
    }

    fn sent_id(out: &str) -> String {
        out.split("id='")
            .nth(1)
            .unwrap()
            .split('\'')
            .next()
            .unwrap()
            .to_string()
    }

    #[test]
    fn test_ping_round_trip_reports_elapsed() {
        // Scenario: ping correlation by generated id
        let mut client = live_client();
        let log = capture_log(&mut client);
        client
            .session_mut()
            .request("alice@ex/b", IqRequestKind::Ping);
        let out = client.session_mut().take_outbound().join("");
        assert!(out.contains("<ping xmlns='urn:xmpp:ping'/>"));
        let id = sent_id(&out);
        client.flush_queued_iq();
        assert!(client.bus_pending(&id));

        feed(
            &mut client,
            &format!("<iq type='result' id='{id}' from='alice@ex/b'/>"),
        );
        assert!(!client.bus_pending(&id));
        let lines = log.lock().unwrap();
        assert!(lines.iter().any(|l| l.starts_with("Pong from <alice@ex/b>")));
    }

    #[test]
    fn test_reply_handler_fires_at_most_once() {
        let mut client = live_client();
        let log = capture_log(&mut client);
        client
            .session_mut()
            .request("alice@ex/b", IqRequestKind::Ping);
        let out = client.session_mut().take_outbound().join("");
        let id = sent_id(&out);
        feed(
            &mut client,
            &format!("<iq type='result' id='{id}' from='alice@ex/b'/>"),
        );
        feed(
            &mut client,
            &format!("<iq type='result' id='{id}' from='alice@ex/b'/>"),
        );
        let pongs = log
            .lock()
            .unwrap()
            .iter()
            .filter(|l| l.starts_with("Pong"))
            .count();
        assert_eq!(pongs, 1);
    }

    #[test]
    fn test_version_request_fans_out_to_resources() {
        let mut client = live_client();
        feed(&mut client, "<presence from='alice@ex/a'/>");
        feed(&mut client, "<presence from='alice@ex/b'/>");
        client.session_mut().take_outbound();
        client.session_mut().request("alice@ex", IqRequestKind::Version);
        let out = client.session_mut().take_outbound();
        let versions: Vec<&String> =
            out.iter().filter(|s| s.contains("jabber:iq:version")).collect();
        assert_eq!(versions.len(), 2);
        assert!(versions.iter().any(|s| s.contains("to='alice@ex/a'")));
        assert!(versions.iter().any(|s| s.contains("to='alice@ex/b'")));
    }

    #[test]
    fn test_version_reply_formatted() {
        let mut client = live_client();
        let log = capture_log(&mut client);
        client
            .session_mut()
            .request("alice@ex/a", IqRequestKind::Version);
        let out = client.session_mut().take_outbound().join("");
        let id = sent_id(&out);
        feed(
            &mut client,
            &format!(
                "<iq type='result' id='{id}' from='alice@ex/a'>\
                 <query xmlns='jabber:iq:version'><name>Psi</name>\
                 <version>1.1.2</version><os>Linux</os></query></iq>"
            ),
        );
        let lines = log.lock().unwrap();
        assert!(lines.iter().any(|l| l == "Name: Psi"));
        assert!(lines.iter().any(|l| l == "Version: 1.1.2"));
        assert!(lines.iter().any(|l| l == "OS: Linux"));
    }

    #[test]
    fn test_error_reply_surfaces_condition() {
        let mut client = live_client();
        let log = capture_log(&mut client);
        client
            .session_mut()
            .request("gone@ex/a", IqRequestKind::Last);
        let out = client.session_mut().take_outbound().join("");
        let id = sent_id(&out);
        feed(
            &mut client,
            &format!(
                "<iq type='error' id='{id}' from='gone@ex/a'>\
                 <error code='404' type='cancel'>\
                 <item-not-found xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/>\
                 </error></iq>"
            ),
        );
        let lines = log.lock().unwrap();
        assert!(lines.iter().any(|l| l.contains("item-not-found")));
    }

    #[test]
    fn test_inbound_ping_answered() {
        let mut client = live_client();
        feed(
            &mut client,
            "<iq type='get' id='p1' from='peer@ex/r'><ping xmlns='urn:xmpp:ping'/></iq>",
        );
        let out = client.session_mut().take_outbound().join("");
        assert!(out.contains("type='result'"));
        assert!(out.contains("id='p1'"));
        assert!(out.contains("to='peer@ex/r'"));
    }

    #[test]
    fn test_inbound_version_answered() {
        let mut client = live_client();
        feed(
            &mut client,
            "<iq type='get' id='v1' from='peer@ex/r'>\
             <query xmlns='jabber:iq:version'/></iq>",
        );
        let out = client.session_mut().take_outbound().join("");
        assert!(out.contains("<name>swiftlet</name>"));
        assert!(out.contains(env!("CARGO_PKG_VERSION")));
    }

    #[test]
    fn test_inbound_time_answered() {
        let mut client = live_client();
        feed(
            &mut client,
            "<iq type='get' id='t1' from='peer@ex/r'><time xmlns='urn:xmpp:time'/></iq>",
        );
        let out = client.session_mut().take_outbound().join("");
        assert!(out.contains("<tzo>+00:00</tzo>"));
        assert!(out.contains("<utc>"));
    }

    #[test]
    fn test_inbound_last_honors_disable() {
        let config = crate::config::Config::from_toml(
            "jid = 'me@example.org'\npassword = 'pw'\niq_last_disable = true\n",
        )
        .unwrap();
        let mut client = Client::new(config);
        client.session_mut().set_state(SessionState::Live);
        client.session_mut().take_outbound();
        feed(
            &mut client,
            "<iq type='get' id='l1' from='peer@ex/r'><query xmlns='jabber:iq:last'/></iq>",
        );
        let out = client.session_mut().take_outbound().join("");
        assert!(out.contains("type='error'"));
        assert!(out.contains("service-unavailable"));
    }

    #[test]
    fn test_inbound_last_reports_idle() {
        let mut client = live_client();
        feed(
            &mut client,
            "<iq type='get' id='l1' from='peer@ex/r'><query xmlns='jabber:iq:last'/></iq>",
        );
        let out = client.session_mut().take_outbound().join("");
        assert!(out.contains("seconds='"));
    }

    #[test]
    fn test_inbound_disco_info_lists_features() {
        let mut client = live_client();
        feed(
            &mut client,
            "<iq type='get' id='d1' from='peer@ex/r'>\
             <query xmlns='http://jabber.org/protocol/disco#info'/></iq>",
        );
        let out = client.session_mut().take_outbound().join("");
        assert!(out.contains("category='client'"));
        assert!(out.contains("var='urn:xmpp:ping'"));
        assert!(out.contains("var='urn:xmpp:receipts'"));
    }

    #[test]
    fn test_inbound_disco_info_with_caps_node() {
        let mut client = live_client();
        let node = client
            .session_mut()
            .own_caps_node(crate::roster::Presence::Offline);
        feed(
            &mut client,
            &format!(
                "<iq type='get' id='d2' from='peer@ex/r'>\
                 <query xmlns='http://jabber.org/protocol/disco#info' node='{node}'/></iq>"
            ),
        );
        let out = client.session_mut().take_outbound().join("");
        assert!(out.contains(&format!("node='{node}'")));
        assert!(out.contains("var='urn:xmpp:ping'"));
        // Unknown node → item-not-found
        feed(
            &mut client,
            "<iq type='get' id='d3' from='peer@ex/r'>\
             <query xmlns='http://jabber.org/protocol/disco#info' node='bogus#x'/></iq>",
        );
        let out = client.session_mut().take_outbound().join("");
        assert!(out.contains("item-not-found"));
    }

    #[test]
    fn test_unknown_iq_get_feature_not_implemented() {
        let mut client = live_client();
        feed(
            &mut client,
            "<iq type='get' id='x1' from='peer@ex/r'>\
             <query xmlns='jabber:iq:browse'/></iq>",
        );
        let out = client.session_mut().take_outbound().join("");
        assert!(out.contains("feature-not-implemented"));
        assert!(out.contains("code='501'"));
    }

    #[test]
    fn test_roster_fetch_populates_and_fires_post_connect() {
        let mut client = live_client();
        use std::sync::atomic::{AtomicUsize, Ordering};
        let connected = Arc::new(AtomicUsize::new(0));
        let c = connected.clone();
        client
            .session_mut()
            .hooks
            .add_handler(hooks::POST_CONNECT, 0, move |_, _| {
                c.fetch_add(1, Ordering::SeqCst);
                HookVerdict::AllowMore
            });
        client.session_mut().request_roster();
        let out = client.session_mut().take_outbound().join("");
        let id = sent_id(&out);
        feed(
            &mut client,
            &format!(
                "<iq type='result' id='{id}'><query xmlns='jabber:iq:roster'>\
                 <item jid='alice@ex' name='Alice' subscription='both'>\
                 <group>Friends</group></item>\
                 <item jid='gateway.ex' subscription='to'/>\
                 <item jid='pending@ex' subscription='none' ask='subscribe'/>\
                 </query></iq>"
            ),
        );
        let session = client.session();
        assert_eq!(connected.load(Ordering::SeqCst), 1);
        let alice = session.roster.contact_by_jid("alice@ex").unwrap();
        assert_eq!(alice.name, "Alice");
        assert_eq!(alice.subscription, Subscription::Both);
        assert!(session.roster.on_server("alice@ex"));
        assert_eq!(session.roster.kind_of("gateway.ex"), kind::AGENT);
        assert_eq!(
            session.roster.subscription("pending@ex"),
            Subscription::Pending
        );
    }

    #[test]
    fn test_roster_push_updates_and_acks() {
        let mut client = live_client();
        feed(
            &mut client,
            "<iq type='set' id='push1'><query xmlns='jabber:iq:roster'>\
             <item jid='bob@ex' name='Bobby' subscription='from'/></query></iq>",
        );
        let session = client.session();
        assert_eq!(
            session.roster.name_of("bob@ex"),
            Some("Bobby".to_string())
        );
        let out = client.session_mut().take_outbound().join("");
        assert!(out.contains("type='result'"));
        assert!(out.contains("id='push1'"));
    }

    #[test]
    fn test_roster_push_remove_keeps_unread_jid() {
        let mut client = live_client();
        feed(
            &mut client,
            "<message from='bob@ex/x' type='chat'><body>hi</body></message>",
        );
        feed(
            &mut client,
            "<iq type='set' id='push2'><query xmlns='jabber:iq:roster'>\
             <item jid='bob@ex' subscription='remove'/></query></iq>",
        );
        let session = client.session();
        assert!(session.roster.contact_by_jid("bob@ex").is_none());
        assert_eq!(session.roster.unread_jids(), vec!["bob@ex"]);
    }

    #[test]
    fn test_server_disco_enables_carbons_when_configured() {
        let config = crate::config::Config::from_toml(
            "jid = 'me@example.org'\npassword = 'pw'\ncarbons = true\n",
        )
        .unwrap();
        let mut client = Client::new(config);
        client.session_mut().set_state(SessionState::Live);
        client.session_mut().request_server_disco_info();
        let out = client.session_mut().take_outbound().join("");
        let id = sent_id(&out);
        feed(
            &mut client,
            &format!(
                "<iq type='result' id='{id}' from='example.org'>\
                 <query xmlns='http://jabber.org/protocol/disco#info'>\
                 <feature var='urn:xmpp:carbons:2'/></query></iq>"
            ),
        );
        // The enable request went out
        let out = client.session_mut().take_outbound().join("");
        assert!(out.contains("<enable xmlns='urn:xmpp:carbons:2'/>"));
    }

    #[test]
    fn test_storage_bookmarks_autojoin() {
        let mut client = live_client();
        client.session_mut().request_storage(ns::STORAGE_BOOKMARKS);
        let out = client.session_mut().take_outbound().join("");
        let id = sent_id(&out);
        feed(
            &mut client,
            &format!(
                "<iq type='result' id='{id}'><query xmlns='jabber:iq:private'>\
                 <storage xmlns='storage:bookmarks'>\
                 <conference jid='room@conf.ex' name='The Room' autojoin='1'>\
                 <nick>mynick</nick><password>pw</password></conference>\
                 <conference jid='quiet@conf.ex' name='Quiet' autojoin='0'/>\
                 </storage></query></iq>"
            ),
        );
        let session = client.session();
        assert_eq!(session.roster.kind_of("room@conf.ex"), kind::ROOM);
        assert_eq!(
            session.roster.nickname("room@conf.ex"),
            Some("mynick".to_string())
        );
        assert!(session.is_bookmarked("room@conf.ex"));
        let bookmark = session.bookmark("room@conf.ex").unwrap();
        assert_eq!(bookmark.password, Some("pw".to_string()));
        assert!(bookmark.autojoin);
        // The join presence went out for the autojoin room only
        let out = client.session_mut().take_outbound().join("");
        assert!(out.contains("to='room@conf.ex/mynick'"));
        assert!(out.contains("<password>pw</password>"));
        assert!(!out.contains("quiet@conf.ex/"));
    }

    #[test]
    fn test_storage_item_not_found_means_empty() {
        let mut client = live_client();
        client.session_mut().request_storage(ns::STORAGE_ROSTERNOTES);
        let out = client.session_mut().take_outbound().join("");
        let id = sent_id(&out);
        feed(
            &mut client,
            &format!(
                "<iq type='error' id='{id}'>\
                 <error code='404' type='cancel'>\
                 <item-not-found xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/>\
                 </error></iq>"
            ),
        );
        // Storage exists and is empty: notes can be stored now
        assert!(client.session().rosternotes().is_empty());
        client.session_mut().set_rosternote("alice@ex", Some("my note"));
        let note = client.session().rosternote("alice@ex").unwrap();
        assert_eq!(note.text, "my note");
        let out = client.session_mut().take_outbound().join("");
        assert!(out.contains("type='set'"));
        assert!(out.contains("storage:rosternotes"));
        assert!(out.contains("my note"));
    }

    #[test]
    fn test_rosternote_edit_preserves_cdate() {
        let mut client = live_client();
        client.session_mut().rosternotes = Some(
            Element::parse(
                "<storage xmlns='storage:rosternotes'>\
                 <note jid='alice@ex' cdate='2020-01-01T00:00:00Z' \
                 mdate='2020-01-01T00:00:00Z'>old</note></storage>",
            )
            .unwrap(),
        );
        client.session_mut().set_rosternote("alice@ex", Some("new"));
        let note = client.session().rosternote("alice@ex").unwrap();
        assert_eq!(note.text, "new");
        assert_eq!(
            note.cdate.unwrap().to_rfc3339(),
            "2020-01-01T00:00:00+00:00"
        );
        assert_ne!(note.cdate, note.mdate);
    }

    #[test]
    fn test_set_bookmark_without_storage_support() {
        let mut client = live_client();
        let log = capture_log(&mut client);
        client.session_mut().set_bookmark(Bookmark {
            roomjid: "room@conf.ex".to_string(),
            ..Default::default()
        });
        assert!(log
            .lock()
            .unwrap()
            .iter()
            .any(|l| l.contains("doesn't seem to support private storage")));
    }

    #[test]
    fn test_set_and_delete_bookmark() {
        let mut client = live_client();
        client.session_mut().bookmarks =
            Some(Element::parse("<storage xmlns='storage:bookmarks'/>").unwrap());
        client.session_mut().set_bookmark(Bookmark {
            roomjid: "room@conf.ex".to_string(),
            name: Some("The Room".to_string()),
            nick: Some("me".to_string()),
            autojoin: true,
            ..Default::default()
        });
        assert!(client.session().is_bookmarked("room@conf.ex"));
        let out = client.session_mut().take_outbound().join("");
        assert!(out.contains("storage:bookmarks"));
        assert!(out.contains("autojoin='1'"));

        client.session_mut().del_bookmark("room@conf.ex");
        assert!(!client.session().is_bookmarked("room@conf.ex"));
    }

    #[test]
    fn test_add_buddy_sends_roster_set_and_subscribe() {
        let mut client = live_client();
        client
            .session_mut()
            .add_buddy("carol@ex", Some("Carol"), Some("Friends"));
        let out = client.session_mut().take_outbound().join("");
        assert!(out.contains("jabber:iq:roster"));
        assert!(out.contains("jid='carol@ex'"));
        assert!(out.contains("name='Carol'"));
        assert!(out.contains("<group>Friends</group>"));
        assert!(out.contains("<presence to='carol@ex' type='subscribe'/>"));
        assert_eq!(
            client.session().roster.subscription("carol@ex"),
            Subscription::Pending
        );
    }

    #[test]
    fn test_del_buddy_cancels_subscriptions() {
        let mut client = live_client();
        client.session_mut().roster.add_user(
            "carol@ex",
            None,
            None,
            kind::USER,
            Subscription::Both,
            Some(true),
        );
        client.session_mut().del_buddy("carol@ex");
        let out = client.session_mut().take_outbound().join("");
        assert!(out.contains("<presence to='carol@ex' type='unsubscribed'/>"));
        assert!(out.contains("<presence to='carol@ex' type='unsubscribe'/>"));
        assert!(out.contains("subscription='remove'"));
        assert!(client.session().roster.contact_by_jid("carol@ex").is_none());
    }

    #[test]
    fn test_del_agent_unregisters() {
        let mut client = live_client();
        client.session_mut().roster.add_user(
            "gateway.ex",
            None,
            None,
            kind::AGENT,
            Subscription::To,
            Some(true),
        );
        client.session_mut().del_buddy("gateway.ex");
        let out = client.session_mut().take_outbound().join("");
        assert!(out.contains("jabber:iq:register"));
        assert!(out.contains("<remove/>"));
    }

    #[test]
    fn test_join_muc_sets_nickname() {
        let mut client = live_client();
        client.session_mut().join_muc("Room@Conf.Ex", "mynick", None);
        let session = client.session();
        assert_eq!(session.roster.kind_of("room@conf.ex"), kind::ROOM);
        assert_eq!(
            session.roster.nickname("room@conf.ex"),
            Some("mynick".to_string())
        );
        let out = client.session_mut().take_outbound().join("");
        assert!(out.contains("to='room@conf.ex/mynick'"));
        assert!(out.contains("http://jabber.org/protocol/muc"));
    }

    #[test]
    fn test_vcard_lines() {
        let vcard = Element::parse(
            "<vCard xmlns='vcard-temp'><FN>Alice Doe</FN>\
             <N><FAMILY>Doe</FAMILY><GIVEN>Alice</GIVEN></N>\
             <ORG><ORGNAME>ACME</ORGNAME></ORG>\
             <TEL><WORK/><VOICE/><NUMBER>555-1234</NUMBER></TEL>\
             <EMAIL><INTERNET/><PREF/><USERID>alice@example.org</USERID></EMAIL>\
             </vCard>",
        )
        .unwrap();
        let lines = vcard_lines(&vcard);
        assert!(lines.contains(&"Name: Alice Doe".to_string()));
        assert!(lines.contains(&"Family Name: Doe".to_string()));
        assert!(lines.contains(&"Organisation name: ACME".to_string()));
        assert!(lines.contains(&"Phone: [work][voice] 555-1234".to_string()));
        assert!(lines.contains(&"Email: [internet][pref] alice@example.org".to_string()));
    }
}
