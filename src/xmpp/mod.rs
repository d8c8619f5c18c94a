//! The XMPP protocol engine: stream parsing, stanza building and routing,
//! the session state machine and the stanza handlers.

pub mod bus;
pub mod carbons;
pub mod client;
pub mod element;
pub mod iq;
pub mod message;
pub mod presence;
pub mod s10n;
pub mod sasl;
pub mod session;
pub mod stanzas;
pub mod stream;

/// Namespace URIs used on the wire.
pub mod ns {
    pub const CLIENT: &str = "jabber:client";
    pub const STREAM: &str = "http://etherx.jabber.org/streams";
    pub const TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
    pub const SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
    pub const BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";
    pub const SESSION: &str = "urn:ietf:params:xml:ns:xmpp-session";
    pub const STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";

    pub const ROSTER: &str = "jabber:iq:roster";
    pub const PRIVATE: &str = "jabber:iq:private";
    pub const VERSION: &str = "jabber:iq:version";
    pub const LAST: &str = "jabber:iq:last";
    pub const REGISTER: &str = "jabber:iq:register";

    pub const DISCO_INFO: &str = "http://jabber.org/protocol/disco#info";
    pub const DISCO_ITEMS: &str = "http://jabber.org/protocol/disco#items";
    pub const CAPS: &str = "http://jabber.org/protocol/caps";
    pub const CHATSTATES: &str = "http://jabber.org/protocol/chatstates";
    pub const MUC: &str = "http://jabber.org/protocol/muc";
    pub const MUC_USER: &str = "http://jabber.org/protocol/muc#user";

    pub const XMPP_DELAY: &str = "urn:xmpp:delay";
    pub const DELAY: &str = "jabber:x:delay";
    pub const PING: &str = "urn:xmpp:ping";
    pub const XMPP_TIME: &str = "urn:xmpp:time";
    pub const RECEIPTS: &str = "urn:xmpp:receipts";
    pub const CARBONS_2: &str = "urn:xmpp:carbons:2";
    pub const FORWARD: &str = "urn:xmpp:forward:0";

    pub const VCARD: &str = "vcard-temp";
    pub const X_CONFERENCE: &str = "jabber:x:conference";
    pub const X_DATA: &str = "jabber:x:data";
    pub const SIGNED: &str = "jabber:x:signed";
    pub const ENCRYPTED: &str = "jabber:x:encrypted";

    pub const STORAGE_BOOKMARKS: &str = "storage:bookmarks";
    pub const STORAGE_ROSTERNOTES: &str = "storage:rosternotes";
}

/// Client node URL advertised in entity capabilities (XEP-0115).
/// Part of the verification hash input; fixed forever.
pub const CAPS_NODE: &str = "https://swiftlet.im/caps";
