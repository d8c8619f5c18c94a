//! The session: connection state and everything the client knows.
//!
//! All mutable client state lives here — roster, caps cache, hook
//! registry, pending events, carbons state, server-side private storage —
//! and is only touched from the owning event loop. Stanza handlers are
//! `impl Session` blocks spread over the sibling modules (presence,
//! message, iq, s10n, carbons); the network driver in [`super::client`]
//! feeds them.

use std::collections::VecDeque;
use std::time::Instant;

use tracing::info;
use uuid::Uuid;

use super::bus::IqCallback;
use super::element::Element;
use super::stanzas::{self, IqKind};
use super::{ns, CAPS_NODE};
use crate::caps::CapsCache;
use crate::config::Config;
use crate::events::EventStore;
use crate::hooks::{self, HookRegistry};
use crate::roster::{Presence, Roster};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    TlsNegotiating,
    Authenticating,
    Binding,
    Live,
    Closing,
}

pub struct Session {
    pub config: Config,
    pub roster: Roster,
    pub caps: CapsCache,
    pub hooks: HookRegistry,
    pub events: EventStore,

    state: SessionState,
    /// Full jid assigned by the server at bind time.
    self_jid: Option<String>,

    my_status: Presence,
    my_wanted_status: Presence,
    my_status_msg: Option<String>,

    pub(crate) carbons_available: bool,
    pub(crate) carbons_enabled: bool,

    /// Canonical private-storage subtrees, as the server holds them.
    pub(crate) bookmarks: Option<Element>,
    pub(crate) rosternotes: Option<Element>,

    /// Cached entity-caps ver strings for our own advertisement.
    own_ver: Option<String>,
    own_ver_notavail: Option<String>,

    /// Last outgoing activity, reported by jabber:iq:last.
    last_activity: Instant,

    /// Serialized stanzas waiting for the transport.
    outbound: VecDeque<String>,
    /// IQ reply callbacks queued for the bus (handlers cannot reach the
    /// bus directly while it is dispatching into them).
    queued_iq: Vec<(String, IqCallback<Session>)>,
}

impl Session {
    pub fn new(config: Config) -> Self {
        let caps_dir = config.caps_cache_dir.clone();
        Self {
            config,
            roster: Roster::new(),
            caps: CapsCache::new(caps_dir),
            hooks: HookRegistry::new(),
            events: EventStore::new(),
            state: SessionState::Disconnected,
            self_jid: None,
            my_status: Presence::Offline,
            my_wanted_status: Presence::Online,
            my_status_msg: None,
            carbons_available: false,
            carbons_enabled: false,
            bookmarks: None,
            rosternotes: None,
            own_ver: None,
            own_ver_notavail: None,
            last_activity: Instant::now(),
            outbound: VecDeque::new(),
            queued_iq: Vec::new(),
        }
    }

    // ── state machine ───────────────────────────────────

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            info!("session state: {:?} -> {state:?}", self.state);
            self.state = state;
        }
    }

    pub fn is_online(&self) -> bool {
        self.state == SessionState::Live
    }

    pub fn self_jid(&self) -> Option<&str> {
        self.self_jid.as_deref()
    }

    pub fn self_bare_jid(&self) -> Option<String> {
        self.self_jid.as_deref().map(crate::jid::bare_lower)
    }

    pub(crate) fn set_self_jid(&mut self, jid: String) {
        self.self_jid = Some(jid);
    }

    // ── output ──────────────────────────────────────────

    pub fn send(&mut self, stanza: &Element) {
        self.outbound.push_back(stanza.serialize());
    }

    pub fn send_raw(&mut self, data: String) {
        self.outbound.push_back(data);
    }

    /// Drains everything waiting for the transport, in send order.
    pub fn take_outbound(&mut self) -> Vec<String> {
        self.outbound.drain(..).collect()
    }

    pub fn has_outbound(&self) -> bool {
        !self.outbound.is_empty()
    }

    // ── iq plumbing ─────────────────────────────────────

    pub fn new_stanza_id(&self) -> String {
        Uuid::new_v4().simple().to_string()
    }

    /// Sends an iq with a generated id and queues its reply callback.
    pub fn send_iq(
        &mut self,
        kind: IqKind,
        to: Option<&str>,
        child: Element,
        callback: IqCallback<Session>,
    ) -> String {
        let id = self.new_stanza_id();
        let iq = stanzas::build_iq(kind, &id, to, child);
        self.send(&iq);
        self.queued_iq.push((id.clone(), callback));
        id
    }

    /// Fire-and-forget iq (reply errors are surfaced, results ignored).
    pub fn send_iq_ignore_result(&mut self, kind: IqKind, to: Option<&str>, child: Element) {
        self.send_iq(
            kind,
            to,
            child,
            Box::new(|session, reply| {
                if let super::bus::IqReply::Error(el) = reply {
                    let error = stanzas::parse_error(el);
                    let from = el.attr("from").unwrap_or("server").to_string();
                    session.logwindow(
                        &from,
                        &format!("Received error packet [{}]", error.describe()),
                    );
                }
            }),
        );
    }

    /// Taken by the driver after each dispatch and registered on the bus.
    pub fn take_queued_iq(&mut self) -> Vec<(String, IqCallback<Session>)> {
        std::mem::take(&mut self.queued_iq)
    }

    // ── own presence bookkeeping ────────────────────────

    pub fn my_status(&self) -> Presence {
        self.my_status
    }

    pub fn my_status_msg(&self) -> Option<&str> {
        self.my_status_msg.as_deref()
    }

    pub fn my_wanted_status(&self) -> Presence {
        self.my_wanted_status
    }

    pub(crate) fn record_my_status(&mut self, status: Presence, msg: Option<&str>) {
        self.my_status = status;
        if status != Presence::Offline {
            self.my_wanted_status = status;
        }
        self.my_status_msg = msg.filter(|m| !m.is_empty()).map(str::to_string);
    }

    // ── entity capabilities advertisement ───────────────

    /// Our own XEP-0115 ver string for the given status. Cached; the
    /// not-available variant may differ when jabber:iq:last is disabled
    /// for that status.
    pub fn entity_version(&mut self, status: Presence) -> String {
        if status != Presence::NotAvailable {
            if let Some(ver) = &self.own_ver {
                return ver.clone();
            }
        } else if let Some(ver) = &self.own_ver_notavail {
            return ver.clone();
        }

        self.caps.add("");
        self.caps.set_identity(
            "",
            "client",
            concat!("swiftlet ", env!("CARGO_PKG_VERSION")),
            "pc",
        );
        self.caps.add_feature("", ns::DISCO_INFO);
        self.caps.add_feature("", ns::CAPS);
        self.caps.add_feature("", ns::MUC);
        if !self.config.disable_chatstates {
            self.caps.add_feature("", ns::CHATSTATES);
        }
        self.caps.add_feature("", ns::XMPP_TIME);
        self.caps.add_feature("", ns::VERSION);
        self.caps.add_feature("", ns::PING);
        self.caps.add_feature("", ns::RECEIPTS);
        self.caps.add_feature("", ns::X_CONFERENCE);
        if !self.config.iq_last_disable
            && (!self.config.iq_last_disable_when_notavail
                || status != Presence::NotAvailable)
        {
            self.caps.add_feature("", ns::LAST);
        }
        let ver = self.caps.generate();
        if status == Presence::NotAvailable {
            self.own_ver_notavail = Some(ver.clone());
        } else {
            self.own_ver = Some(ver.clone());
        }
        ver
    }

    /// The disco#info node form `node#ver` we answer queries for.
    pub fn own_caps_node(&mut self, status: Presence) -> String {
        format!("{CAPS_NODE}#{}", self.entity_version(status))
    }

    // ── last activity ───────────────────────────────────

    pub(crate) fn update_last_use(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn idle_seconds(&self) -> u64 {
        self.last_activity.elapsed().as_secs()
    }

    // ── session lifecycle ───────────────────────────────

    /// Entry into the live state: initial roster fetch, server disco,
    /// private storage, presence restore.
    pub(crate) fn on_live(&mut self) {
        self.set_state(SessionState::Live);
        self.request_roster();
        self.request_server_disco_info();
        self.request_storage(ns::STORAGE_BOOKMARKS);
        self.request_storage(ns::STORAGE_ROSTERNOTES);
        self.set_prev_status();
    }

    /// Teardown common to orderly and forced closes. The unread-jids
    /// index survives inside the roster for the next session.
    pub(crate) fn on_disconnect(&mut self) {
        if self.is_online() {
            self.hooks.run(hooks::PRE_DISCONNECT, &[]);
            self.set_state(SessionState::Closing);
        }
        self.set_state(SessionState::Disconnected);
        self.bookmarks = None;
        self.rosternotes = None;
        self.carbons_reset();
        self.roster.clear();
        self.self_jid = None;
        if self.my_status != Presence::Offline {
            let msg = self.my_status_msg.clone();
            self.run_my_status_change_hook(self.my_status, Presence::Offline, msg.as_deref());
            self.my_status = Presence::Offline;
        }
    }

    pub(crate) fn run_my_status_change_hook(
        &mut self,
        old: Presence,
        new: Presence,
        msg: Option<&str>,
    ) {
        let args = hooks::args(&[
            ("old_status", status_name(old)),
            ("new_status", status_name(new)),
            ("message", msg.unwrap_or("")),
        ]);
        self.hooks.run(hooks::MY_STATUS_CHANGE, &args);
    }

    /// Informational line for the log window hook.
    pub fn logwindow(&mut self, jid: &str, text: &str) {
        let args = hooks::args(&[("jid", jid), ("text", text)]);
        self.hooks.run(hooks::LOGWINDOW, &args);
    }
}

/// Stable status names used in hook arguments.
pub fn status_name(status: Presence) -> &'static str {
    match status {
        Presence::Offline => "offline",
        Presence::Online => "online",
        Presence::FreeForChat => "free",
        Presence::DoNotDisturb => "dnd",
        Presence::NotAvailable => "notavail",
        Presence::Away => "away",
        Presence::Invisible => "invisible",
    }
}

/// Test support: a config pointing at a throwaway account, with tracing
/// wired up so `RUST_LOG=debug cargo test` shows the handler traffic.
#[cfg(test)]
pub(crate) fn test_config() -> Config {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("swiftlet=info")),
        )
        .with_test_writer()
        .try_init();
    Config::from_toml("jid = 'me@example.org'\npassword = 'pw'\n").unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let session = Session::new(test_config());
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(!session.is_online());
        assert_eq!(session.my_status(), Presence::Offline);
        assert_eq!(session.my_wanted_status(), Presence::Online);
    }

    #[test]
    fn test_outbound_queue_preserves_order() {
        let mut session = Session::new(test_config());
        session.send(&Element::new("presence"));
        session.send_raw("<a/>".to_string());
        assert!(session.has_outbound());
        assert_eq!(session.take_outbound(), vec!["<presence/>", "<a/>"]);
        assert!(!session.has_outbound());
    }

    #[test]
    fn test_send_iq_queues_callback() {
        let mut session = Session::new(test_config());
        let id = session.send_iq(
            IqKind::Get,
            Some("example.org"),
            Element::new("ping").with_attr("xmlns", ns::PING),
            Box::new(|_, _| {}),
        );
        let out = session.take_outbound();
        assert!(out[0].contains(&format!("id='{id}'")));
        assert!(out[0].contains("urn:xmpp:ping"));
        let queued = session.take_queued_iq();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].0, id);
        assert!(session.take_queued_iq().is_empty());
    }

    #[test]
    fn test_entity_version_is_cached_and_status_dependent() {
        let config = Config::from_toml(
            "jid = 'me@example.org'\npassword = 'pw'\n\
             iq_last_disable_when_notavail = true\n",
        )
        .unwrap();
        let mut session = Session::new(config);
        let online = session.entity_version(Presence::Online);
        assert_eq!(session.entity_version(Presence::Online), online);
        let notavail = session.entity_version(Presence::NotAvailable);
        // jabber:iq:last is dropped from the notavail advertisement
        assert_ne!(online, notavail);
        assert!(session.caps.has_feature(&online, ns::LAST, None));
        assert!(!session.caps.has_feature(&notavail, ns::LAST, None));
    }

    #[test]
    fn test_entity_version_same_when_last_not_status_dependent() {
        let mut session = Session::new(test_config());
        let online = session.entity_version(Presence::Online);
        let away = session.entity_version(Presence::Away);
        assert_eq!(online, away);
    }

    #[test]
    fn test_own_caps_verify() {
        let mut session = Session::new(test_config());
        let ver = session.entity_version(Presence::Online);
        assert!(session.caps.verify(&ver, "sha-1"));
    }

    #[test]
    fn test_disconnect_wipes_state_keeps_unread() {
        let mut session = Session::new(test_config());
        session.set_state(SessionState::Live);
        session.roster.add_user(
            "alice@example.org",
            None,
            None,
            crate::roster::kind::USER,
            crate::roster::Subscription::Both,
            Some(true),
        );
        session.roster.msg_set_flag("alice@example.org", false, true);
        session.bookmarks = Some(Element::new("storage"));
        session.carbons_enabled = true;
        session.on_disconnect();
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(session.roster.is_empty());
        assert!(session.bookmarks.is_none());
        assert!(!session.carbons_enabled);
        assert_eq!(session.roster.unread_jids(), vec!["alice@example.org"]);
    }

    #[test]
    fn test_pre_disconnect_hook_runs_when_live() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;
        let mut session = Session::new(test_config());
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        session.hooks.add_handler(hooks::PRE_DISCONNECT, 0, move |_, _| {
            c.fetch_add(1, Ordering::SeqCst);
            crate::hooks::HookVerdict::AllowMore
        });
        // Not live: no hook
        session.on_disconnect();
        assert_eq!(count.load(Ordering::SeqCst), 0);
        session.set_state(SessionState::Live);
        session.on_disconnect();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
