//! Stanza building and parsing.
//!
//! Typed views over [`Element`] for the stanzas the core sends and
//! receives: stream features, SASL/bind negotiation elements, presence,
//! message (with carbons, receipts, chat states, invitations), iq shells
//! and stanza errors.

use chrono::{DateTime, NaiveDateTime, Utc};

use super::element::Element;
use super::ns;
use crate::jid;
use crate::roster::{Affiliation, Presence, Role};

// ── stream features ──────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct StreamFeatures {
    pub starttls: bool,
    pub starttls_required: bool,
    pub mechanisms: Vec<String>,
    pub bind: bool,
    pub session: bool,
}

pub fn parse_features(el: &Element) -> StreamFeatures {
    let mut features = StreamFeatures::default();
    if let Some(starttls) = el.find_xmlns(ns::TLS) {
        features.starttls = true;
        features.starttls_required = starttls.child("required").is_some();
    }
    if let Some(mechs) = el.find_xmlns(ns::SASL) {
        features.mechanisms = mechs
            .child_elements()
            .filter(|m| m.name == "mechanism")
            .map(Element::text)
            .collect();
    }
    features.bind = el.find_xmlns(ns::BIND).is_some();
    features.session = el.find_xmlns(ns::SESSION).is_some();
    features
}

pub fn is_features(el: &Element) -> bool {
    el.name == "stream:features" || el.name == "features"
}

// ── STARTTLS ─────────────────────────────────────────────

pub fn build_starttls() -> Element {
    Element::new("starttls").with_attr("xmlns", ns::TLS)
}

pub fn is_tls_proceed(el: &Element) -> bool {
    el.name == "proceed"
}

// ── SASL ─────────────────────────────────────────────────

pub fn build_sasl_auth(mechanism: &str, payload_b64: &str) -> Element {
    Element::new("auth")
        .with_attr("xmlns", ns::SASL)
        .with_attr("mechanism", mechanism)
        .with_text(payload_b64)
}

pub fn build_sasl_response(payload_b64: &str) -> Element {
    Element::new("response")
        .with_attr("xmlns", ns::SASL)
        .with_text(payload_b64)
}

/// Condition of a SASL `<failure/>`, e.g. `not-authorized`.
pub fn sasl_failure_condition(el: &Element) -> String {
    el.child_elements()
        .next()
        .map(|c| c.name.clone())
        .unwrap_or_else(|| "undefined-condition".to_string())
}

// ── resource binding ─────────────────────────────────────

pub fn build_bind(id: &str, resource: &str) -> Element {
    Element::new("iq")
        .with_attr("type", "set")
        .with_attr("id", id)
        .with_child(
            Element::new("bind")
                .with_attr("xmlns", ns::BIND)
                .with_child(Element::new("resource").with_text(resource)),
        )
}

pub fn bound_jid(iq_result: &Element) -> Option<String> {
    iq_result
        .find_xmlns(ns::BIND)
        .and_then(|bind| bind.child_text("jid"))
        .filter(|jid| !jid.is_empty())
}

// ── stanza errors ────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StanzaError {
    pub code: Option<u16>,
    pub condition: String,
    pub text: Option<String>,
}

/// Standard conditions: (legacy code, condition, meaning, error type).
pub const ERROR_TABLE: &[(u16, &str, &str, &str)] = &[
    (302, "redirect", "Redirect", "modify"),
    (400, "bad-request", "Bad Request", "modify"),
    (401, "not-authorized", "Not Authorized", "auth"),
    (402, "payment-required", "Payment Required", "auth"),
    (403, "forbidden", "Forbidden", "auth"),
    (404, "item-not-found", "Not Found", "cancel"),
    (405, "not-allowed", "Not Allowed", "cancel"),
    (406, "not-acceptable", "Not Acceptable", "modify"),
    (407, "registration-required", "Registration Required", "auth"),
    (408, "remote-server-timeout", "Request Timeout", "wait"),
    (409, "conflict", "Conflict", "cancel"),
    (500, "internal-server-error", "Internal Server Error", "wait"),
    (501, "feature-not-implemented", "Not Implemented", "cancel"),
    (502, "service-unavailable", "Remote Server Error", "wait"),
    (503, "service-unavailable", "Service Unavailable", "cancel"),
    (504, "remote-server-timeout", "Remote Server Timeout", "wait"),
    (510, "service-unavailable", "Disconnected", "cancel"),
];

pub fn error_meaning(code: u16) -> Option<&'static str> {
    ERROR_TABLE
        .iter()
        .find(|(c, _, _, _)| *c == code)
        .map(|(_, _, meaning, _)| *meaning)
}

/// Parses the `<error/>` child of a stanza. An absent or empty error
/// child yields an empty condition, not a failure.
pub fn parse_error(stanza: &Element) -> StanzaError {
    let Some(error) = stanza.child("error") else {
        return StanzaError {
            code: None,
            condition: String::new(),
            text: None,
        };
    };
    let code = error.attr("code").and_then(|c| c.parse().ok());
    let condition = error
        .child_elements()
        .find(|c| c.name != "text")
        .map(|c| c.name.clone())
        .unwrap_or_default();
    let text = error.child_text("text").filter(|t| !t.is_empty());
    StanzaError {
        code,
        condition,
        text,
    }
}

impl StanzaError {
    /// Human-readable description, falling back to the legacy code table.
    pub fn describe(&self) -> String {
        if let Some(text) = &self.text {
            return text.clone();
        }
        if !self.condition.is_empty() {
            return self.condition.clone();
        }
        self.code
            .and_then(error_meaning)
            .unwrap_or("")
            .to_string()
    }
}

/// Builds an error reply for an inbound iq `get`/`set`.
pub fn build_iq_error_reply(iq: &Element, code: u16) -> Element {
    let (_, condition, _, error_type) = ERROR_TABLE
        .iter()
        .find(|(c, _, _, _)| *c == code)
        .copied()
        .unwrap_or((500, "internal-server-error", "", "wait"));
    let mut reply = Element::new("iq").with_attr("type", "error");
    if let Some(from) = iq.attr("from") {
        reply.set_attr("to", from);
    }
    if let Some(id) = iq.attr("id") {
        reply.set_attr("id", id);
    }
    reply.with_child(
        Element::new("error")
            .with_attr("code", code.to_string())
            .with_attr("type", error_type)
            .with_child(Element::new(condition).with_attr("xmlns", ns::STANZAS)),
    )
}

// ── delayed delivery ─────────────────────────────────────

/// Timestamp from a delay element, modern `urn:xmpp:delay` first, then
/// the legacy `jabber:x:delay` form.
pub fn delay_timestamp(stanza: &Element) -> Option<DateTime<Utc>> {
    if let Some(delay) = stanza.find_xmlns(ns::XMPP_DELAY) {
        if delay.name == "delay" {
            if let Some(stamp) = delay.attr("stamp") {
                if let Ok(ts) = DateTime::parse_from_rfc3339(stamp) {
                    return Some(ts.with_timezone(&Utc));
                }
            }
        }
    }
    if let Some(delay) = stanza.find_xmlns(ns::DELAY) {
        if let Some(stamp) = delay.attr("stamp") {
            // Legacy CCYYMMDDThh:mm:ss, implicitly UTC
            if let Ok(naive) = NaiveDateTime::parse_from_str(stamp, "%Y%m%dT%H:%M:%S") {
                return Some(naive.and_utc());
            }
        }
    }
    None
}

// ── presence ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceKind {
    Available,
    Unavailable,
    Subscribe,
    Subscribed,
    Unsubscribe,
    Unsubscribed,
    Probe,
    Error,
}

impl PresenceKind {
    pub fn from_attr(attr: Option<&str>) -> PresenceKind {
        match attr {
            Some("unavailable") => PresenceKind::Unavailable,
            Some("subscribe") => PresenceKind::Subscribe,
            Some("subscribed") => PresenceKind::Subscribed,
            Some("unsubscribe") => PresenceKind::Unsubscribe,
            Some("unsubscribed") => PresenceKind::Unsubscribed,
            Some("probe") => PresenceKind::Probe,
            Some("error") => PresenceKind::Error,
            _ => PresenceKind::Available,
        }
    }

    pub fn is_subscription(self) -> bool {
        matches!(
            self,
            PresenceKind::Subscribe
                | PresenceKind::Subscribed
                | PresenceKind::Unsubscribe
                | PresenceKind::Unsubscribed
        )
    }
}

#[derive(Debug, Clone)]
pub struct ParsedPresence {
    pub from: String,
    pub kind: PresenceKind,
    pub presence: Presence,
    pub status_msg: Option<String>,
    /// Saturating parse of the `<priority/>` element.
    pub priority: i8,
    pub timestamp: Option<DateTime<Utc>>,
    /// (node, ver, hash) from a XEP-0115 `<c/>` hint.
    pub caps: Option<(String, String, String)>,
    pub has_muc_user: bool,
    pub error: Option<StanzaError>,
}

/// Parses an inbound presence stanza. Returns `None` when the required
/// `from` attribute is missing (the stanza is dropped with a warning at
/// the call site).
pub fn parse_presence(el: &Element) -> Option<ParsedPresence> {
    let from = el.attr("from")?.to_string();
    let kind = PresenceKind::from_attr(el.attr("type"));

    let priority = el
        .child_text("priority")
        .and_then(|p| {
            let p = p.trim().to_string();
            if p.is_empty() {
                None
            } else {
                Some(match p.parse::<i64>() {
                    Ok(v) => v.clamp(i8::MIN as i64, i8::MAX as i64) as i8,
                    Err(_) => 0,
                })
            }
        })
        .unwrap_or(0);

    let mut presence = el
        .child_text("show")
        .map(|s| Presence::from_show(s.trim()))
        .unwrap_or(Presence::Online);
    if kind == PresenceKind::Unavailable {
        presence = Presence::Offline;
    }

    let status_msg = el.child_text("status").filter(|s| !s.is_empty());

    let caps = el.find_xmlns(ns::CAPS).and_then(|c| {
        let node = c.attr("node")?.to_string();
        let ver = c.attr("ver")?.to_string();
        let hash = c.attr("hash")?.to_string();
        if ver.is_empty() || hash.is_empty() {
            return None;
        }
        Some((node, ver, hash))
    });

    Some(ParsedPresence {
        from,
        kind,
        presence,
        status_msg,
        priority,
        timestamp: delay_timestamp(el),
        caps,
        has_muc_user: el.find_xmlns(ns::MUC_USER).is_some(),
        error: (kind == PresenceKind::Error).then(|| parse_error(el)),
    })
}

/// Builds an outbound presence for the given status. `priority` is
/// omitted when zero; an entity-caps element is attached when `caps_ver`
/// is given.
pub fn build_presence(
    status: Presence,
    to: Option<&str>,
    msg: Option<&str>,
    priority: i8,
    caps_ver: Option<&str>,
) -> Element {
    let mut pres = Element::new("presence");
    if let Some(to) = to {
        pres.set_attr("to", to);
    }
    match status {
        Presence::Offline => pres.set_attr("type", "unavailable"),
        Presence::Invisible => pres.set_attr("type", "invisible"),
        _ => {}
    }
    if let Some(show) = status.show() {
        pres.push_child(Element::new("show").with_text(show));
    }
    if priority != 0 {
        pres.push_child(Element::new("priority").with_text(priority.to_string()));
    }
    if let Some(msg) = msg {
        if !msg.is_empty() && status != Presence::Invisible {
            pres.push_child(Element::new("status").with_text(msg));
        }
    }
    if let Some(ver) = caps_ver {
        pres.push_child(
            Element::new("c")
                .with_attr("xmlns", ns::CAPS)
                .with_attr("hash", "sha-1")
                .with_attr("node", super::CAPS_NODE)
                .with_attr("ver", ver),
        );
    }
    pres
}

pub fn build_s10n(to: &str, subtype: &str) -> Element {
    Element::new("presence")
        .with_attr("to", to)
        .with_attr("type", subtype)
}

/// Room join presence (XEP-0045).
pub fn build_muc_join(room_jid: &str, nick: &str, password: Option<&str>) -> Element {
    let mut x = Element::new("x").with_attr("xmlns", ns::MUC);
    if let Some(password) = password {
        x.push_child(Element::new("password").with_text(password));
    }
    Element::new("presence")
        .with_attr("to", format!("{room_jid}/{nick}"))
        .with_child(x)
}

// ── chat states (XEP-0085) ───────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatState {
    Active,
    Composing,
    Paused,
    Inactive,
    Gone,
}

impl ChatState {
    pub fn as_str(self) -> &'static str {
        match self {
            ChatState::Active => "active",
            ChatState::Composing => "composing",
            ChatState::Paused => "paused",
            ChatState::Inactive => "inactive",
            ChatState::Gone => "gone",
        }
    }

    pub fn from_name(name: &str) -> Option<ChatState> {
        match name {
            "active" => Some(ChatState::Active),
            "composing" => Some(ChatState::Composing),
            "paused" => Some(ChatState::Paused),
            "inactive" => Some(ChatState::Inactive),
            "gone" => Some(ChatState::Gone),
            _ => None,
        }
    }
}

/// Standalone chat-state notification.
pub fn build_chat_state(to: &str, state: ChatState) -> Element {
    Element::new("message")
        .with_attr("to", to)
        .with_attr("type", "chat")
        .with_child(Element::new(state.as_str()).with_attr("xmlns", ns::CHATSTATES))
}

// ── message ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Normal,
    Chat,
    GroupChat,
    Headline,
    Error,
}

impl MessageKind {
    pub fn from_attr(attr: Option<&str>) -> MessageKind {
        match attr {
            Some("chat") => MessageKind::Chat,
            Some("groupchat") => MessageKind::GroupChat,
            Some("headline") => MessageKind::Headline,
            Some("error") => MessageKind::Error,
            _ => MessageKind::Normal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CarbonDirection {
    Received,
    Sent,
}

#[derive(Debug, Clone)]
pub struct DirectInvite {
    pub room: String,
    pub reason: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ParsedMessage {
    pub from: String,
    pub to: Option<String>,
    pub id: Option<String>,
    pub kind: MessageKind,
    pub body: Option<String>,
    pub subject: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub chat_state: Option<ChatState>,
    /// Base64 payload of a `jabber:x:encrypted` extension.
    pub encrypted: Option<String>,
    /// Signature payload of a `jabber:x:signed` extension.
    pub signed: Option<String>,
    /// XEP-0184: the peer asked for a delivery receipt.
    pub receipt_request: bool,
    /// XEP-0184: the peer confirmed delivery of this id.
    pub receipt_received: Option<String>,
    pub direct_invite: Option<DirectInvite>,
    pub muc_user_invite: Option<DirectInvite>,
    pub error: Option<StanzaError>,
}

pub fn parse_message(el: &Element) -> Option<ParsedMessage> {
    let from = el.attr("from")?.to_string();
    let kind = MessageKind::from_attr(el.attr("type"));

    let chat_state = el
        .find_xmlns(ns::CHATSTATES)
        .and_then(|c| ChatState::from_name(&c.name));

    let receipt_received = el.child("received").and_then(|r| {
        if r.xmlns() == Some(ns::RECEIPTS) {
            // Pre-1.1 senders omit the id attribute; fall back to the
            // message id
            Some(
                r.attr("id")
                    .map(str::to_string)
                    .or_else(|| el.attr("id").map(str::to_string))
                    .unwrap_or_default(),
            )
        } else {
            None
        }
    });

    let direct_invite = el.find_xmlns(ns::X_CONFERENCE).and_then(|x| {
        x.attr("jid").map(|room| DirectInvite {
            room: room.to_string(),
            reason: x.attr("reason").map(str::to_string),
            password: x.attr("password").map(str::to_string),
        })
    });

    let muc_user_invite = el.find_xmlns(ns::MUC_USER).and_then(|x| {
        x.child("invite").map(|invite| DirectInvite {
            room: el.attr("from").unwrap_or_default().to_string(),
            reason: invite.child_text("reason").filter(|r| !r.is_empty()),
            password: x.child_text("password").filter(|p| !p.is_empty()),
        })
    });

    Some(ParsedMessage {
        from,
        to: el.attr("to").map(str::to_string),
        id: el.attr("id").map(str::to_string),
        kind,
        body: el.child_text("body"),
        subject: el.child_text("subject"),
        timestamp: delay_timestamp(el),
        chat_state,
        encrypted: el
            .find_xmlns(ns::ENCRYPTED)
            .map(|x| x.text())
            .filter(|t| !t.is_empty()),
        signed: el
            .find_xmlns(ns::SIGNED)
            .map(|x| x.text())
            .filter(|t| !t.is_empty()),
        receipt_request: el
            .child("request")
            .map(|r| r.xmlns() == Some(ns::RECEIPTS))
            .unwrap_or(false),
        receipt_received,
        direct_invite,
        muc_user_invite,
        error: (kind == MessageKind::Error).then(|| parse_error(el)),
    })
}

/// The carbons wrapper of a message, if any: direction plus the
/// forwarded inner `<message/>`. `Some(Err)` marks a malformed carbon
/// (missing forwarded message) that must be dropped with a warning.
pub fn carbon_wrapper(el: &Element) -> Option<Result<(CarbonDirection, Element), String>> {
    let wrapper = el.find_xmlns(ns::CARBONS_2)?;
    let direction = match wrapper.name.as_str() {
        "received" => CarbonDirection::Received,
        "sent" => CarbonDirection::Sent,
        _ => return None,
    };
    let inner = wrapper
        .find_xmlns(ns::FORWARD)
        .and_then(|fwd| fwd.child("message").cloned());
    match inner {
        Some(message) => Some(Ok((direction, message))),
        None => Some(Err("carbon without forwarded message".to_string())),
    }
}

/// XEP-0184 receipt confirmation for a delivered message.
pub fn build_receipt(to: &str, id: &str) -> Element {
    Element::new("message")
        .with_attr("to", to)
        .with_attr("id", id)
        .with_child(
            Element::new("received")
                .with_attr("xmlns", ns::RECEIPTS)
                .with_attr("id", id),
        )
}

// ── iq shells ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IqKind {
    Get,
    Set,
    Result,
    Error,
}

impl IqKind {
    pub fn from_attr(attr: Option<&str>) -> Option<IqKind> {
        match attr {
            Some("get") => Some(IqKind::Get),
            Some("set") => Some(IqKind::Set),
            Some("result") => Some(IqKind::Result),
            Some("error") => Some(IqKind::Error),
            _ => None,
        }
    }
}

pub fn build_iq(kind: IqKind, id: &str, to: Option<&str>, child: Element) -> Element {
    let kind = match kind {
        IqKind::Get => "get",
        IqKind::Set => "set",
        IqKind::Result => "result",
        IqKind::Error => "error",
    };
    let mut iq = Element::new("iq").with_attr("type", kind).with_attr("id", id);
    if let Some(to) = to {
        iq.set_attr("to", to);
    }
    iq.with_child(child)
}

/// Empty result acknowledging an inbound `get`/`set`.
pub fn build_iq_result(iq: &Element, child: Option<Element>) -> Element {
    let mut reply = Element::new("iq").with_attr("type", "result");
    if let Some(from) = iq.attr("from") {
        reply.set_attr("to", from);
    }
    if let Some(id) = iq.attr("id") {
        reply.set_attr("id", id);
    }
    if let Some(child) = child {
        reply.push_child(child);
    }
    reply
}

/// Role/affiliation/real-jid of a MUC user item, for room presences.
pub fn muc_item(el: &Element) -> (Role, Affiliation, Option<String>) {
    let Some(item) = el.find_xmlns(ns::MUC_USER).and_then(|x| x.child("item")) else {
        return (Role::None, Affiliation::None, None);
    };
    (
        item.attr("role").map(Role::from_attr).unwrap_or_default(),
        item.attr("affiliation")
            .map(Affiliation::from_attr)
            .unwrap_or_default(),
        item.attr("jid").map(|j| jid::bare_of(j).to_string()),
    )
}
