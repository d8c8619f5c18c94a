//! Local roster: the contact graph with groups, per-contact resources,
//! presence, and the unread-message index.
//!
//! Contacts and groups live in id-keyed tables with relational links
//! (a contact stores its group id, a group stores an ordered contact-id
//! list), so there are no cyclic references. All mutators set a dirty flag
//! and the flat display list is rebuilt lazily.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use crate::jid::{self, bare_lower};
use crate::xmpp::stanzas::ChatState;

pub type GroupId = u32;
pub type ContactId = u32;

/// Contact kinds, as a mask so searches can match several at once.
pub mod kind {
    pub const USER: u32 = 1;
    pub const GROUP: u32 = 1 << 1;
    pub const AGENT: u32 = 1 << 2;
    pub const ROOM: u32 = 1 << 3;
    pub const SPECIAL: u32 = 1 << 4;
    pub const CONTACTS: u32 = USER | AGENT | ROOM;
}

/// UI flags on contacts and groups.
pub mod flags {
    /// Message waiting.
    pub const MSG: u32 = 1;
    /// Group is shrunk / contact hidden.
    pub const HIDE: u32 = 1 << 1;
    /// The buddy window is currently open.
    pub const LOCK: u32 = 1 << 2;
    /// Lock requested by the user.
    pub const USRLOCK: u32 = 1 << 3;
}

/// ui_prio thresholds used by the unread summary.
pub const UI_PRIO_MUC_MESSAGE: u32 = 5;
pub const UI_PRIO_MUC_HL_MESSAGE: u32 = 10;
pub const UI_PRIO_ATTENTION_MESSAGE: u32 = 15;
pub const UI_PRIO_STATUS_WIN_MESSAGE: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Presence {
    Offline,
    Online,
    FreeForChat,
    DoNotDisturb,
    NotAvailable,
    Away,
    Invisible,
}

impl Presence {
    /// The `<show/>` value for this presence, if it has one.
    pub fn show(self) -> Option<&'static str> {
        match self {
            Presence::FreeForChat => Some("chat"),
            Presence::DoNotDisturb => Some("dnd"),
            Presence::NotAvailable => Some("xa"),
            Presence::Away => Some("away"),
            _ => None,
        }
    }

    pub fn from_show(show: &str) -> Presence {
        match show {
            "chat" => Presence::FreeForChat,
            "dnd" => Presence::DoNotDisturb,
            "xa" => Presence::NotAvailable,
            "away" => Presence::Away,
            _ => Presence::Online,
        }
    }

    fn filter_bit(self) -> u8 {
        match self {
            Presence::Offline => 1,
            Presence::Online => 1 << 1,
            Presence::FreeForChat => 1 << 2,
            Presence::DoNotDisturb => 1 << 3,
            Presence::NotAvailable => 1 << 4,
            Presence::Away => 1 << 5,
            Presence::Invisible => 1 << 6,
        }
    }
}

pub const FILTER_ALL: u8 = 0x7f;
pub const FILTER_ONLINE: u8 = FILTER_ALL & !1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Subscription {
    #[default]
    None,
    To,
    From,
    Both,
    Remove,
    Pending,
}

impl Subscription {
    pub fn from_attr(attr: &str) -> Subscription {
        match attr {
            "to" => Subscription::To,
            "from" => Subscription::From,
            "both" => Subscription::Both,
            "remove" => Subscription::Remove,
            _ => Subscription::None,
        }
    }

    pub fn has_from(self) -> bool {
        matches!(self, Subscription::From | Subscription::Both)
    }

    pub fn has_to(self) -> bool {
        matches!(self, Subscription::To | Subscription::Both)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    #[default]
    None,
    Moderator,
    Participant,
    Visitor,
}

impl Role {
    pub fn from_attr(attr: &str) -> Role {
        match attr {
            "moderator" => Role::Moderator,
            "participant" => Role::Participant,
            "visitor" => Role::Visitor,
            _ => Role::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Affiliation {
    #[default]
    None,
    Owner,
    Admin,
    Member,
    Outcast,
}

impl Affiliation {
    pub fn from_attr(attr: &str) -> Affiliation {
        match attr {
            "owner" => Affiliation::Owner,
            "admin" => Affiliation::Admin,
            "member" => Affiliation::Member,
            "outcast" => Affiliation::Outcast,
            _ => Affiliation::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrintStatus {
    #[default]
    Default,
    None,
    InAndOut,
    All,
}

impl PrintStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PrintStatus::Default => "default",
            PrintStatus::None => "none",
            PrintStatus::InAndOut => "in_and_out",
            PrintStatus::All => "all",
        }
    }

    pub fn from_name(name: &str) -> Option<PrintStatus> {
        match name {
            "default" => Some(PrintStatus::Default),
            "none" => Some(PrintStatus::None),
            "in_and_out" => Some(PrintStatus::InAndOut),
            "all" => Some(PrintStatus::All),
            _ => Option::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AutoWhois {
    #[default]
    Default,
    Off,
    On,
}

impl AutoWhois {
    pub fn from_flag(flag: &str) -> AutoWhois {
        match flag {
            "1" | "true" => AutoWhois::On,
            "0" | "false" => AutoWhois::Off,
            _ => AutoWhois::Default,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlagJoins {
    #[default]
    Default,
    None,
    Joins,
    All,
}

impl FlagJoins {
    pub fn as_str(self) -> &'static str {
        match self {
            FlagJoins::Default => "default",
            FlagJoins::None => "none",
            FlagJoins::Joins => "joins",
            FlagJoins::All => "all",
        }
    }

    pub fn from_name(name: &str) -> Option<FlagJoins> {
        match name {
            "default" => Some(FlagJoins::Default),
            "none" => Some(FlagJoins::None),
            "joins" => Some(FlagJoins::Joins),
            "all" => Some(FlagJoins::All),
            _ => Option::None,
        }
    }
}

/// XEP-0085 support negotiation state for one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChatStateSupport {
    #[default]
    Unknown,
    Probed,
    Ok,
}

#[derive(Debug, Clone, Default)]
pub struct ChatStates {
    pub support: ChatStateSupport,
    pub last_sent: Option<ChatState>,
    pub last_rcvd: Option<ChatState>,
}

#[derive(Debug, Clone)]
pub struct Resource {
    pub name: String,
    pub prio: i8,
    pub presence: Presence,
    pub status_msg: Option<String>,
    pub status_ts: Option<DateTime<Utc>>,
    pub role: Role,
    pub affil: Affiliation,
    /// Real jid of a room member, when the room is non-anonymous.
    pub real_jid: Option<String>,
    pub caps_ver: Option<String>,
    pub chat_states: ChatStates,
}

impl Resource {
    fn new(name: &str, prio: i8) -> Self {
        Self {
            name: name.to_string(),
            prio,
            presence: Presence::Offline,
            status_msg: None,
            status_ts: None,
            role: Role::None,
            affil: Affiliation::None,
            real_jid: None,
            caps_ver: None,
            chat_states: ChatStates::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Contact {
    pub id: ContactId,
    /// Bare jid as first seen (case preserved for display).
    pub jid: String,
    pub name: String,
    pub group: GroupId,
    pub kind: u32,
    pub subscription: Subscription,
    pub on_server: bool,
    pub flags: u32,
    pub ui_prio: u32,
    /// Status message kept from the last resource that went offline.
    pub offline_status_message: Option<String>,
    // Room-only state
    pub nickname: Option<String>,
    pub topic: Option<String>,
    pub inside_room: bool,
    pub print_status: PrintStatus,
    pub auto_whois: AutoWhois,
    pub flag_joins: FlagJoins,
    /// Live resources, ordered by priority ascending (best one last).
    pub resources: Vec<Resource>,
    pub active_resource: Option<String>,
}

impl Contact {
    /// Resource by name; with `None`, the highest-priority one.
    pub fn resource(&self, name: Option<&str>) -> Option<&Resource> {
        match name {
            Some(n) => self.resources.iter().find(|r| r.name == n),
            None => self.resources.last(),
        }
    }

    pub fn resource_mut(&mut self, name: Option<&str>) -> Option<&mut Resource> {
        match name {
            Some(n) => self.resources.iter_mut().find(|r| r.name == n),
            None => self.resources.last_mut(),
        }
    }

    /// Highest-priority live resource.
    pub fn best_resource(&self) -> Option<&Resource> {
        self.resources.last()
    }

    /// The resource a directed send should go to: the explicit active
    /// resource if set, the best resource otherwise.
    pub fn active_or_best_resource(&self) -> Option<&Resource> {
        if let Some(active) = &self.active_resource {
            if let Some(r) = self.resources.iter().find(|r| &r.name == active) {
                return Some(r);
            }
        }
        self.best_resource()
    }

    fn get_or_add_resource(&mut self, name: &str, prio: i8) -> &mut Resource {
        if let Some(idx) = self.resources.iter().position(|r| r.name == name) {
            if self.resources[idx].prio != prio {
                self.resources[idx].prio = prio;
                self.resources.sort_by_key(|r| r.prio);
            }
            let idx = self.resources.iter().position(|r| r.name == name).unwrap();
            return &mut self.resources[idx];
        }
        self.resources.push(Resource::new(name, prio));
        self.resources.sort_by_key(|r| r.prio);
        let idx = self.resources.iter().position(|r| r.name == name).unwrap();
        &mut self.resources[idx]
    }

    fn del_resource(&mut self, name: &str) {
        let Some(idx) = self.resources.iter().position(|r| r.name == name) else {
            return;
        };
        // The last resource's status message survives as the offline one
        if self.resources.len() == 1 {
            self.offline_status_message = self.resources[idx].status_msg.take();
        }
        if self.active_resource.as_deref() == Some(name) {
            self.active_resource = None;
        }
        self.resources.remove(idx);
    }

    pub fn status(&self, resname: Option<&str>) -> Presence {
        self.resource(resname)
            .map(|r| r.presence)
            .unwrap_or(Presence::Offline)
    }

    pub fn status_msg(&self, resname: Option<&str>) -> Option<&str> {
        match self.resource(resname) {
            Some(r) => r.status_msg.as_deref(),
            None => self.offline_status_message.as_deref(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    pub flags: u32,
    /// Contact ids ordered by contact display name.
    pub contacts: Vec<ContactId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FindBy {
    Jid,
    Name,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiPrioOp {
    Set,
    Max,
    Inc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewItem {
    Special,
    Group(GroupId),
    Contact(ContactId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UnreadSummary {
    pub unread: u32,
    pub attention: u32,
    pub muc_unread: u32,
    pub muc_attention: u32,
}

pub struct Roster {
    groups: HashMap<GroupId, Group>,
    contacts: HashMap<ContactId, Contact>,
    by_jid: HashMap<String, ContactId>,
    /// Group ids ordered by group name, default group first.
    group_order: Vec<GroupId>,
    /// Contacts with the message flag, ordered by ui_prio descending.
    unread: Vec<ContactId>,
    /// Jids that still had unread messages when they left the roster;
    /// survives the roster wipe on disconnect.
    unread_jids: HashSet<String>,
    /// The status-buffer pseudo entry.
    special_flags: u32,
    special_ui_prio: u32,
    display_filter: u8,
    view: Vec<ViewItem>,
    view_dirty: bool,
    next_id: u32,
}

impl Roster {
    pub fn new() -> Self {
        Self {
            groups: HashMap::new(),
            contacts: HashMap::new(),
            by_jid: HashMap::new(),
            group_order: Vec::new(),
            unread: Vec::new(),
            unread_jids: HashSet::new(),
            special_flags: 0,
            special_ui_prio: 0,
            display_filter: FILTER_ALL,
            view: Vec::new(),
            view_dirty: true,
            next_id: 1,
        }
    }

    fn alloc_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    // ── groups ──────────────────────────────────────────

    pub fn find_group(&self, name: &str) -> Option<GroupId> {
        self.group_order
            .iter()
            .copied()
            .find(|id| self.groups[id].name == name)
    }

    /// Returns the existing group with that name, or creates it.
    /// The default group has the empty name.
    pub fn add_group(&mut self, name: &str) -> GroupId {
        if let Some(id) = self.find_group(name) {
            return id;
        }
        let id = self.alloc_id();
        self.groups.insert(
            id,
            Group {
                id,
                name: name.to_string(),
                flags: 0,
                contacts: Vec::new(),
            },
        );
        self.group_order.push(id);
        let groups = &self.groups;
        self.group_order.sort_by(|a, b| groups[a].name.cmp(&groups[b].name));
        self.view_dirty = true;
        id
    }

    pub fn group(&self, id: GroupId) -> Option<&Group> {
        self.groups.get(&id)
    }

    pub fn groups(&self) -> impl Iterator<Item = &Group> {
        self.group_order.iter().map(|id| &self.groups[id])
    }

    // ── lookup ──────────────────────────────────────────

    /// Finds a contact by bare jid (case-insensitive) or display name,
    /// restricted to the given kind mask. A mask of 0 matches any kind.
    pub fn find(&self, key: &str, by: FindBy, kind_mask: u32) -> Option<ContactId> {
        let mask = if kind_mask == 0 { u32::MAX } else { kind_mask };
        match by {
            FindBy::Jid => {
                let id = *self.by_jid.get(&bare_lower(key))?;
                (self.contacts[&id].kind & mask != 0).then_some(id)
            }
            FindBy::Name => self
                .contacts
                .values()
                .find(|c| c.kind & mask != 0 && c.name == key)
                .map(|c| c.id),
        }
    }

    pub fn contact(&self, id: ContactId) -> Option<&Contact> {
        self.contacts.get(&id)
    }

    pub fn contact_by_jid(&self, jid: &str) -> Option<&Contact> {
        let id = self.find(jid, FindBy::Jid, 0)?;
        self.contacts.get(&id)
    }

    fn contact_mut_by_jid(&mut self, jid: &str) -> Option<&mut Contact> {
        let id = *self.by_jid.get(&bare_lower(jid))?;
        self.contacts.get_mut(&id)
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    // ── contact lifecycle ───────────────────────────────

    /// Creates or updates a contact. `on_server: None` leaves the flag
    /// untouched on update. Returns `None` for kinds that cannot live in
    /// the roster (groups, special).
    pub fn add_user(
        &mut self,
        jid: &str,
        name: Option<&str>,
        group: Option<&str>,
        kind_val: u32,
        subscription: Subscription,
        on_server: Option<bool>,
    ) -> Option<ContactId> {
        if kind_val != kind::USER && kind_val != kind::ROOM && kind_val != kind::AGENT {
            return None;
        }
        let group_name = group.unwrap_or("");

        if let Some(id) = self.find(jid, FindBy::Jid, 0) {
            // Update path
            let old_group = self.contacts[&id].group;
            let contact = self.contacts.get_mut(&id).unwrap();
            contact.subscription = subscription;
            if let Some(flag) = on_server {
                contact.on_server = flag;
            }
            if let Some(name) = name {
                contact.name = name.to_string();
                self.resort_group(old_group);
            }
            if self.groups[&old_group].name != group_name {
                self.move_to_group(id, group_name);
            }
            self.view_dirty = true;
            return Some(id);
        }

        let group_id = self.add_group(group_name);
        let id = self.alloc_id();
        let display_name = name
            .map(str::to_string)
            .unwrap_or_else(|| jid::bare_of(jid).to_string());
        let mut contact = Contact {
            id,
            jid: jid::bare_of(jid).to_string(),
            name: display_name,
            group: group_id,
            kind: kind_val,
            subscription,
            on_server: on_server.unwrap_or(false),
            flags: 0,
            ui_prio: 0,
            offline_status_message: None,
            nickname: None,
            topic: None,
            inside_room: false,
            print_status: PrintStatus::Default,
            auto_whois: AutoWhois::Default,
            flag_joins: FlagJoins::Default,
            resources: Vec::new(),
            active_resource: None,
        };
        // A jid removed earlier with a pending unread message gets the
        // flag back on its return
        if self.unread_jids.remove(&bare_lower(jid)) {
            contact.flags |= flags::MSG;
        }
        let has_msg = contact.flags & flags::MSG != 0;
        self.by_jid.insert(bare_lower(jid), id);
        self.contacts.insert(id, contact);
        self.groups.get_mut(&group_id).unwrap().contacts.push(id);
        self.resort_group(group_id);
        if has_msg {
            self.groups.get_mut(&group_id).unwrap().flags |= flags::MSG;
            self.unread_insert(id);
        }
        self.view_dirty = true;
        Some(id)
    }

    pub fn del_user(&mut self, jid: &str) {
        let Some(id) = self.find(jid, FindBy::Jid, kind::CONTACTS) else {
            return;
        };
        self.unread.retain(|&u| u != id);
        let contact = self.contacts.remove(&id).unwrap();
        self.by_jid.remove(&bare_lower(&contact.jid));
        if contact.flags & flags::MSG != 0 {
            self.unread_jids.insert(bare_lower(&contact.jid));
        }
        if let Some(group) = self.groups.get_mut(&contact.group) {
            group.contacts.retain(|&c| c != id);
        }
        self.refresh_group_msg_flag(contact.group);
        self.view_dirty = true;
    }

    /// Wipes the whole roster (disconnect); unread jids are preserved for
    /// the next session.
    pub fn clear(&mut self) {
        for contact in self.contacts.values() {
            if contact.flags & flags::MSG != 0 {
                self.unread_jids.insert(bare_lower(&contact.jid));
            }
        }
        self.groups.clear();
        self.contacts.clear();
        self.by_jid.clear();
        self.group_order.clear();
        self.unread.clear();
        self.view_dirty = true;
    }

    // ── presence ────────────────────────────────────────

    /// Applies a presence update. The contact is created on demand; an
    /// offline presence removes the resource (keeping its status message
    /// when it was the last one).
    #[allow(clippy::too_many_arguments)]
    pub fn set_status(
        &mut self,
        jid: &str,
        resname: Option<&str>,
        prio: i8,
        presence: Presence,
        status_msg: Option<&str>,
        timestamp: Option<DateTime<Utc>>,
        role: Role,
        affil: Affiliation,
        real_jid: Option<&str>,
    ) {
        if self.find(jid, FindBy::Jid, kind::CONTACTS).is_none() {
            self.add_user(jid, None, None, kind::USER, Subscription::None, None);
        }
        let Some(resname) = resname else { return };
        let contact = self.contact_mut_by_jid(jid).unwrap();
        if presence == Presence::Offline {
            let present = contact.resources.iter().any(|r| r.name == resname);
            if present {
                // Record the parting words before dropping the resource
                if contact.resources.len() == 1 {
                    if let Some(msg) = status_msg {
                        contact.resource_mut(Some(resname)).unwrap().status_msg =
                            Some(msg.to_string());
                    }
                }
                contact.del_resource(resname);
            } else if let Some(msg) = status_msg {
                contact.offline_status_message = Some(msg.to_string());
            }
            self.view_dirty = true;
            return;
        }
        let res = contact.get_or_add_resource(resname, prio);
        res.presence = presence;
        res.status_msg = status_msg.map(str::to_string);
        res.status_ts = timestamp.or_else(|| Some(Utc::now()));
        res.role = role;
        res.affil = affil;
        res.real_jid = real_jid.map(str::to_string);
        self.view_dirty = true;
    }

    /// Presence updates stopped flowing; all resources go away but the
    /// last status message is kept.
    pub fn unsubscribed(&mut self, jid: &str) {
        self.del_all_resources(jid);
    }

    pub fn del_all_resources(&mut self, jid: &str) {
        if let Some(contact) = self.contact_mut_by_jid(jid) {
            while let Some(r) = contact.resources.last() {
                let name = r.name.clone();
                contact.del_resource(&name);
            }
            self.view_dirty = true;
        }
    }

    // ── flags, unread index ─────────────────────────────

    pub fn set_flags(&mut self, jid: &str, mask: u32, value: bool) {
        if let Some(contact) = self.contact_mut_by_jid(jid) {
            if value {
                contact.flags |= mask;
            } else {
                contact.flags &= !mask;
            }
            self.view_dirty = true;
        }
    }

    pub fn flags_of(&self, jid: &str) -> u32 {
        self.contact_by_jid(jid).map(|c| c.flags).unwrap_or(0)
    }

    /// Sets or clears the message-waiting flag, maintaining the group
    /// OR-flag and the ordered unread index. Returns true when the unread
    /// index actually changed (the caller persists state and runs the
    /// unread hook then).
    pub fn msg_set_flag(&mut self, jid: &str, special: bool, value: bool) -> bool {
        if special {
            let had = self.special_flags & flags::MSG != 0;
            if value {
                self.special_flags |= flags::MSG;
            } else {
                self.special_flags &= !flags::MSG;
                self.special_ui_prio = 0;
            }
            return had != value;
        }

        let id = match self.find(jid, FindBy::Jid, kind::CONTACTS) {
            Some(id) => id,
            None => match self.add_user(jid, None, None, kind::USER, Subscription::None, None)
            {
                Some(id) => id,
                None => return false,
            },
        };
        let contact = self.contacts.get_mut(&id).unwrap();
        let group_id = contact.group;
        let had = contact.flags & flags::MSG != 0;
        if value {
            contact.flags |= flags::MSG;
            self.groups.get_mut(&group_id).unwrap().flags |= flags::MSG;
            if !self.unread.contains(&id) {
                self.unread_insert(id);
            }
        } else {
            contact.flags &= !flags::MSG;
            contact.ui_prio = 0;
            self.unread.retain(|&u| u != id);
            self.refresh_group_msg_flag(group_id);
        }
        self.view_dirty = true;
        had != value
    }

    fn unread_insert(&mut self, id: ContactId) {
        self.unread.push(id);
        let contacts = &self.contacts;
        self.unread
            .sort_by(|a, b| contacts[b].ui_prio.cmp(&contacts[a].ui_prio));
    }

    fn refresh_group_msg_flag(&mut self, group_id: GroupId) {
        let Some(group) = self.groups.get(&group_id) else {
            return;
        };
        let any_msg = group
            .contacts
            .iter()
            .any(|id| self.contacts[id].flags & flags::MSG != 0);
        let group = self.groups.get_mut(&group_id).unwrap();
        if any_msg {
            group.flags |= flags::MSG;
        } else {
            group.flags &= !flags::MSG;
        }
    }

    pub fn set_ui_prio(&mut self, jid: &str, special: bool, value: u32, op: UiPrioOp) {
        if special {
            self.special_ui_prio = match op {
                UiPrioOp::Set => value,
                UiPrioOp::Max => self.special_ui_prio.max(value),
                UiPrioOp::Inc => self.special_ui_prio + value,
            };
            return;
        }
        let Some(contact) = self.contact_mut_by_jid(jid) else {
            return;
        };
        contact.ui_prio = match op {
            UiPrioOp::Set => value,
            UiPrioOp::Max => contact.ui_prio.max(value),
            UiPrioOp::Inc => contact.ui_prio + value,
        };
        let contacts = &self.contacts;
        self.unread
            .sort_by(|a, b| contacts[b].ui_prio.cmp(&contacts[a].ui_prio));
    }

    pub fn ui_prio(&self, jid: &str, special: bool) -> u32 {
        if special {
            return self.special_ui_prio;
        }
        self.contact_by_jid(jid).map(|c| c.ui_prio).unwrap_or(0)
    }

    /// Bare jids with pending messages, ordered by ui_prio descending.
    pub fn unread_list(&self) -> Vec<String> {
        self.unread
            .iter()
            .map(|id| self.contacts[id].jid.clone())
            .collect()
    }

    /// The next unread buddy after `current`, wrapping around.
    pub fn unread_next(&self, current: Option<&str>) -> Option<String> {
        if self.unread.is_empty() {
            return None;
        }
        let first = || self.contacts[&self.unread[0]].jid.clone();
        let Some(current) = current else {
            return Some(first());
        };
        let key = bare_lower(current);
        match self
            .unread
            .iter()
            .position(|id| bare_lower(&self.contacts[id].jid) == key)
        {
            Some(pos) if pos + 1 < self.unread.len() => {
                Some(self.contacts[&self.unread[pos + 1]].jid.clone())
            }
            _ => Some(first()),
        }
    }

    pub fn unread_summary(&self) -> UnreadSummary {
        let mut summary = UnreadSummary::default();
        for id in &self.unread {
            let contact = &self.contacts[id];
            summary.unread += 1;
            if contact.kind & kind::ROOM != 0 {
                summary.muc_unread += 1;
                if contact.ui_prio >= UI_PRIO_MUC_HL_MESSAGE {
                    summary.muc_attention += 1;
                }
            } else if contact.ui_prio >= UI_PRIO_ATTENTION_MESSAGE {
                summary.attention += 1;
            }
        }
        summary
    }

    // ── unread-jids persistence table ───────────────────

    pub fn unread_jid_add(&mut self, jid: &str) {
        self.unread_jids.insert(bare_lower(jid));
    }

    pub fn unread_jids(&self) -> Vec<String> {
        let mut jids: Vec<String> = self.unread_jids.iter().cloned().collect();
        jids.sort();
        jids
    }

    // ── per-contact setters / getters ───────────────────

    pub fn set_name(&mut self, jid: &str, name: &str) {
        if let Some(contact) = self.contact_mut_by_jid(jid) {
            contact.name = name.to_string();
            let group = contact.group;
            self.resort_group(group);
            self.view_dirty = true;
        }
    }

    /// Moves a contact to another group, creating the target and dropping
    /// the old group when it becomes empty.
    pub fn set_group(&mut self, jid: &str, group_name: &str) {
        let Some(id) = self.find(jid, FindBy::Jid, kind::CONTACTS) else {
            return;
        };
        self.move_to_group(id, group_name);
        self.view_dirty = true;
    }

    fn move_to_group(&mut self, id: ContactId, group_name: &str) {
        let old_group = self.contacts[&id].group;
        if self.groups[&old_group].name == group_name {
            return;
        }
        let new_group = self.add_group(group_name);
        let old = self.groups.get_mut(&old_group).unwrap();
        old.contacts.retain(|&c| c != id);
        let drop_old = old.contacts.is_empty() && !old.name.is_empty();
        if drop_old {
            self.groups.remove(&old_group);
            self.group_order.retain(|&g| g != old_group);
        } else {
            self.refresh_group_msg_flag(old_group);
        }
        self.contacts.get_mut(&id).unwrap().group = new_group;
        self.groups.get_mut(&new_group).unwrap().contacts.push(id);
        self.resort_group(new_group);
        if self.contacts[&id].flags & flags::MSG != 0 {
            self.groups.get_mut(&new_group).unwrap().flags |= flags::MSG;
        }
    }

    fn resort_group(&mut self, group_id: GroupId) {
        let Some(group) = self.groups.get_mut(&group_id) else {
            return;
        };
        let contacts = &self.contacts;
        group
            .contacts
            .sort_by(|a, b| contacts[a].name.cmp(&contacts[b].name));
    }

    pub fn set_kind(&mut self, jid: &str, kind_val: u32) {
        if let Some(contact) = self.contact_mut_by_jid(jid) {
            contact.kind = kind_val;
            self.view_dirty = true;
        }
    }

    pub fn kind_of(&self, jid: &str) -> u32 {
        self.contact_by_jid(jid).map(|c| c.kind).unwrap_or(0)
    }

    pub fn subscription(&self, jid: &str) -> Subscription {
        self.contact_by_jid(jid)
            .map(|c| c.subscription)
            .unwrap_or(Subscription::None)
    }

    pub fn name_of(&self, jid: &str) -> Option<String> {
        self.contact_by_jid(jid).map(|c| c.name.clone())
    }

    pub fn set_nickname(&mut self, jid: &str, nickname: Option<&str>) {
        if let Some(contact) = self.contact_mut_by_jid(jid) {
            contact.nickname = nickname.map(str::to_string);
        }
    }

    pub fn nickname(&self, jid: &str) -> Option<String> {
        self.contact_by_jid(jid).and_then(|c| c.nickname.clone())
    }

    pub fn set_topic(&mut self, jid: &str, topic: Option<&str>) {
        if let Some(contact) = self.contact_mut_by_jid(jid) {
            if contact.kind & kind::ROOM != 0 {
                contact.topic = topic.map(str::to_string);
            }
        }
    }

    pub fn topic(&self, jid: &str) -> Option<String> {
        self.contact_by_jid(jid).and_then(|c| c.topic.clone())
    }

    pub fn set_inside_room(&mut self, jid: &str, inside: bool) {
        if let Some(contact) = self.contact_mut_by_jid(jid) {
            if contact.kind & kind::ROOM != 0 {
                contact.inside_room = inside;
            }
        }
    }

    pub fn inside_room(&self, jid: &str) -> bool {
        self.contact_by_jid(jid)
            .map(|c| c.inside_room)
            .unwrap_or(false)
    }

    pub fn set_print_status(&mut self, jid: &str, ps: PrintStatus) {
        if let Some(contact) = self.contact_mut_by_jid(jid) {
            contact.print_status = ps;
        }
    }

    pub fn set_auto_whois(&mut self, jid: &str, aw: AutoWhois) {
        if let Some(contact) = self.contact_mut_by_jid(jid) {
            contact.auto_whois = aw;
        }
    }

    pub fn set_flag_joins(&mut self, jid: &str, fj: FlagJoins) {
        if let Some(contact) = self.contact_mut_by_jid(jid) {
            contact.flag_joins = fj;
        }
    }

    pub fn set_on_server(&mut self, jid: &str, on_server: bool) {
        if let Some(contact) = self.contact_mut_by_jid(jid) {
            contact.on_server = on_server;
        }
    }

    pub fn on_server(&self, jid: &str) -> bool {
        self.contact_by_jid(jid)
            .map(|c| c.on_server)
            .unwrap_or(false)
    }

    pub fn set_active_resource(&mut self, jid: &str, resname: Option<&str>) {
        if let Some(contact) = self.contact_mut_by_jid(jid) {
            contact.active_resource = resname
                .filter(|r| contact.resources.iter().any(|res| res.name == *r))
                .map(str::to_string);
        }
    }

    pub fn set_resource_caps(&mut self, jid: &str, resname: &str, ver: Option<&str>) {
        if let Some(contact) = self.contact_mut_by_jid(jid) {
            if let Some(res) = contact.resource_mut(Some(resname)) {
                res.caps_ver = ver.map(str::to_string);
            }
        }
    }

    pub fn resource_caps(&self, jid: &str, resname: Option<&str>) -> Option<String> {
        self.contact_by_jid(jid)
            .and_then(|c| c.resource(resname))
            .and_then(|r| r.caps_ver.clone())
    }

    pub fn chat_states_mut(
        &mut self,
        jid: &str,
        resname: Option<&str>,
    ) -> Option<&mut ChatStates> {
        self.contact_mut_by_jid(jid)
            .and_then(|c| c.resource_mut(resname))
            .map(|r| &mut r.chat_states)
    }

    pub fn resources(&self, jid: &str) -> Vec<String> {
        self.contact_by_jid(jid)
            .map(|c| c.resources.iter().map(|r| r.name.clone()).collect())
            .unwrap_or_default()
    }

    pub fn status(&self, jid: &str, resname: Option<&str>) -> Presence {
        self.contact_by_jid(jid)
            .map(|c| c.status(resname))
            .unwrap_or(Presence::Offline)
    }

    pub fn status_msg(&self, jid: &str, resname: Option<&str>) -> Option<String> {
        self.contact_by_jid(jid)
            .and_then(|c| c.status_msg(resname).map(str::to_string))
    }

    pub fn prio_of(&self, jid: &str, resname: Option<&str>) -> i8 {
        self.contact_by_jid(jid)
            .and_then(|c| c.resource(resname))
            .map(|r| r.prio)
            .unwrap_or(0)
    }

    // ── iteration ───────────────────────────────────────

    /// All contacts matching the kind mask, group by group.
    pub fn for_each(&self, kind_mask: u32, mut f: impl FnMut(&Contact)) {
        for group_id in &self.group_order {
            for id in &self.groups[group_id].contacts {
                let contact = &self.contacts[id];
                if contact.kind & kind_mask != 0 {
                    f(contact);
                }
            }
        }
    }

    pub fn for_each_in_group(&self, group_id: GroupId, mut f: impl FnMut(&Contact)) {
        let Some(group) = self.groups.get(&group_id) else {
            return;
        };
        for id in &group.contacts {
            f(&self.contacts[id]);
        }
    }

    // ── display view ────────────────────────────────────

    /// "hide" semantics: 1 = online only, 0 = show all, -1 = invert.
    pub fn set_hide_offline_buddies(&mut self, hide: i32) {
        self.display_filter = match hide {
            h if h > 0 => FILTER_ONLINE,
            0 => FILTER_ALL,
            _ if self.display_filter == FILTER_ALL => FILTER_ONLINE,
            _ => FILTER_ALL,
        };
        self.view_dirty = true;
    }

    pub fn set_filter(&mut self, filter: u8) {
        self.display_filter = filter;
        self.view_dirty = true;
    }

    pub fn filter(&self) -> u8 {
        self.display_filter
    }

    pub fn is_status_filtered(&self, presence: Presence) -> bool {
        self.display_filter & presence.filter_bit() != 0
    }

    /// The flat display list: group header, then its visible members, for
    /// each non-empty group. Idempotent; only rebuilds when a mutator ran.
    pub fn view(&mut self) -> &[ViewItem] {
        self.rebuild_view();
        &self.view
    }

    pub fn rebuild_view(&mut self) {
        if !self.view_dirty {
            return;
        }
        self.view_dirty = false;
        self.view.clear();
        self.view.push(ViewItem::Special);
        for group_id in self.group_order.clone() {
            let shrunk = self.groups[&group_id].flags & flags::HIDE != 0;
            let mut header_pending = true;
            for id in self.groups[&group_id].contacts.clone() {
                let contact = &self.contacts[&id];
                let visible = self.is_status_filtered(contact.status(None))
                    || contact.flags & (flags::LOCK | flags::USRLOCK | flags::MSG) != 0;
                if visible {
                    if header_pending {
                        self.view.push(ViewItem::Group(group_id));
                        header_pending = false;
                    }
                    if !shrunk {
                        self.view.push(ViewItem::Contact(id));
                    }
                }
            }
        }
    }
}

impl Default for Roster {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add(roster: &mut Roster, jid: &str) -> ContactId {
        roster
            .add_user(jid, None, None, kind::USER, Subscription::None, Some(true))
            .unwrap()
    }

    fn online(roster: &mut Roster, jid: &str, res: &str, prio: i8) {
        roster.set_status(
            jid,
            Some(res),
            prio,
            Presence::Online,
            None,
            None,
            Role::None,
            Affiliation::None,
            None,
        );
    }

    #[test]
    fn test_add_user_defaults_name_to_bare_jid() {
        let mut roster = Roster::new();
        let id = add(&mut roster, "alice@example.org");
        assert_eq!(roster.contact(id).unwrap().name, "alice@example.org");
    }

    #[test]
    fn test_add_user_is_idempotent() {
        let mut roster = Roster::new();
        let a = roster.add_user(
            "alice@example.org",
            Some("Alice"),
            Some("Friends"),
            kind::USER,
            Subscription::Both,
            Some(true),
        );
        let b = roster.add_user(
            "alice@example.org",
            Some("Alice"),
            Some("Friends"),
            kind::USER,
            Subscription::Both,
            Some(true),
        );
        assert_eq!(a, b);
        assert_eq!(roster.len(), 1);
    }

    #[test]
    fn test_find_is_case_insensitive_on_jid() {
        let mut roster = Roster::new();
        add(&mut roster, "alice@example.org");
        assert!(roster.find("Alice@Example.Org", FindBy::Jid, 0).is_some());
        assert!(roster
            .find("Alice@Example.Org/home", FindBy::Jid, 0)
            .is_some());
    }

    #[test]
    fn test_find_respects_kind_mask() {
        let mut roster = Roster::new();
        roster.add_user(
            "room@conf.example.org",
            None,
            None,
            kind::ROOM,
            Subscription::None,
            None,
        );
        assert!(roster
            .find("room@conf.example.org", FindBy::Jid, kind::USER)
            .is_none());
        assert!(roster
            .find("room@conf.example.org", FindBy::Jid, kind::ROOM)
            .is_some());
    }

    #[test]
    fn test_group_membership_is_consistent() {
        let mut roster = Roster::new();
        let id = roster
            .add_user(
                "alice@example.org",
                None,
                Some("Work"),
                kind::USER,
                Subscription::None,
                None,
            )
            .unwrap();
        let group = roster.contact(id).unwrap().group;
        assert!(roster.group(group).unwrap().contacts.contains(&id));
        assert_eq!(roster.group(group).unwrap().name, "Work");
    }

    #[test]
    fn test_group_move_drops_empty_old_group() {
        let mut roster = Roster::new();
        let id = roster
            .add_user(
                "alice@example.org",
                None,
                Some("Work"),
                kind::USER,
                Subscription::None,
                None,
            )
            .unwrap();
        let old_group = roster.contact(id).unwrap().group;
        roster.set_group("alice@example.org", "Friends");
        assert!(roster.group(old_group).is_none());
        let new_group = roster.contact(id).unwrap().group;
        assert_eq!(roster.group(new_group).unwrap().name, "Friends");
        assert!(roster.group(new_group).unwrap().contacts.contains(&id));
    }

    #[test]
    fn test_group_move_preserves_unread_state() {
        let mut roster = Roster::new();
        add(&mut roster, "alice@example.org");
        roster.msg_set_flag("alice@example.org", false, true);
        roster.set_group("alice@example.org", "Friends");
        let id = roster.find("alice@example.org", FindBy::Jid, 0).unwrap();
        let group = roster.contact(id).unwrap().group;
        assert!(roster.contact(id).unwrap().flags & flags::MSG != 0);
        assert!(roster.group(group).unwrap().flags & flags::MSG != 0);
        assert_eq!(roster.unread_list(), vec!["alice@example.org"]);
    }

    #[test]
    fn test_resources_sorted_by_priority_ascending() {
        let mut roster = Roster::new();
        add(&mut roster, "alice@example.org");
        online(&mut roster, "alice@example.org", "laptop", 10);
        online(&mut roster, "alice@example.org", "phone", 3);
        online(&mut roster, "alice@example.org", "tablet", 7);
        let contact = roster.contact_by_jid("alice@example.org").unwrap();
        let prios: Vec<i8> = contact.resources.iter().map(|r| r.prio).collect();
        assert_eq!(prios, vec![3, 7, 10]);
        assert_eq!(contact.best_resource().unwrap().name, "laptop");
    }

    #[test]
    fn test_priority_change_resorts() {
        let mut roster = Roster::new();
        add(&mut roster, "alice@example.org");
        online(&mut roster, "alice@example.org", "a", 0);
        online(&mut roster, "alice@example.org", "b", 5);
        online(&mut roster, "alice@example.org", "a", 9);
        let contact = roster.contact_by_jid("alice@example.org").unwrap();
        assert_eq!(contact.best_resource().unwrap().name, "a");
    }

    #[test]
    fn test_offline_removes_resource() {
        let mut roster = Roster::new();
        add(&mut roster, "alice@example.org");
        online(&mut roster, "alice@example.org", "a", 0);
        online(&mut roster, "alice@example.org", "b", 5);
        roster.set_status(
            "alice@example.org",
            Some("a"),
            0,
            Presence::Offline,
            None,
            None,
            Role::None,
            Affiliation::None,
            None,
        );
        assert_eq!(roster.resources("alice@example.org"), vec!["b"]);
        assert_eq!(roster.status("alice@example.org", None), Presence::Online);
    }

    #[test]
    fn test_last_offline_preserves_status_message() {
        let mut roster = Roster::new();
        add(&mut roster, "alice@example.org");
        online(&mut roster, "alice@example.org", "a", 0);
        roster.set_status(
            "alice@example.org",
            Some("a"),
            0,
            Presence::Offline,
            Some("bye"),
            None,
            Role::None,
            Affiliation::None,
            None,
        );
        assert!(roster.resources("alice@example.org").is_empty());
        assert_eq!(roster.status("alice@example.org", None), Presence::Offline);
        assert_eq!(
            roster.status_msg("alice@example.org", None),
            Some("bye".to_string())
        );
    }

    #[test]
    fn test_set_status_creates_unknown_contact() {
        let mut roster = Roster::new();
        online(&mut roster, "stranger@example.org", "res", 0);
        let contact = roster.contact_by_jid("stranger@example.org").unwrap();
        assert_eq!(contact.kind, kind::USER);
        assert_eq!(contact.subscription, Subscription::None);
    }

    #[test]
    fn test_active_resource_overrides_best() {
        let mut roster = Roster::new();
        add(&mut roster, "alice@example.org");
        online(&mut roster, "alice@example.org", "low", 1);
        online(&mut roster, "alice@example.org", "high", 9);
        roster.set_active_resource("alice@example.org", Some("low"));
        let contact = roster.contact_by_jid("alice@example.org").unwrap();
        assert_eq!(contact.active_or_best_resource().unwrap().name, "low");
        // Removing the active resource falls back to the best one
        roster.set_status(
            "alice@example.org",
            Some("low"),
            1,
            Presence::Offline,
            None,
            None,
            Role::None,
            Affiliation::None,
            None,
        );
        let contact = roster.contact_by_jid("alice@example.org").unwrap();
        assert_eq!(contact.active_or_best_resource().unwrap().name, "high");
    }

    #[test]
    fn test_unread_list_ordered_by_ui_prio() {
        let mut roster = Roster::new();
        add(&mut roster, "a@example.org");
        add(&mut roster, "b@example.org");
        add(&mut roster, "c@example.org");
        roster.msg_set_flag("a@example.org", false, true);
        roster.msg_set_flag("b@example.org", false, true);
        roster.msg_set_flag("c@example.org", false, true);
        roster.set_ui_prio("b@example.org", false, UI_PRIO_ATTENTION_MESSAGE, UiPrioOp::Set);
        roster.set_ui_prio("c@example.org", false, UI_PRIO_MUC_HL_MESSAGE, UiPrioOp::Set);
        assert_eq!(
            roster.unread_list(),
            vec!["b@example.org", "c@example.org", "a@example.org"]
        );
    }

    #[test]
    fn test_msg_flag_maintains_group_or() {
        let mut roster = Roster::new();
        roster.add_user(
            "a@example.org",
            None,
            Some("G"),
            kind::USER,
            Subscription::None,
            None,
        );
        roster.add_user(
            "b@example.org",
            None,
            Some("G"),
            kind::USER,
            Subscription::None,
            None,
        );
        let group = roster
            .contact_by_jid("a@example.org")
            .unwrap()
            .group;
        assert!(roster.msg_set_flag("a@example.org", false, true));
        assert!(roster.msg_set_flag("b@example.org", false, true));
        assert!(roster.group(group).unwrap().flags & flags::MSG != 0);
        assert!(roster.msg_set_flag("a@example.org", false, false));
        // b still has a message, the group flag stays
        assert!(roster.group(group).unwrap().flags & flags::MSG != 0);
        assert!(roster.msg_set_flag("b@example.org", false, false));
        assert!(roster.group(group).unwrap().flags & flags::MSG == 0);
    }

    #[test]
    fn test_msg_flag_reports_changes_only() {
        let mut roster = Roster::new();
        add(&mut roster, "a@example.org");
        assert!(roster.msg_set_flag("a@example.org", false, true));
        assert!(!roster.msg_set_flag("a@example.org", false, true));
        assert!(roster.msg_set_flag("a@example.org", false, false));
        assert!(!roster.msg_set_flag("a@example.org", false, false));
    }

    #[test]
    fn test_del_user_remembers_unread_jid() {
        let mut roster = Roster::new();
        add(&mut roster, "a@example.org");
        roster.msg_set_flag("a@example.org", false, true);
        roster.del_user("a@example.org");
        assert!(roster.contact_by_jid("a@example.org").is_none());
        assert_eq!(roster.unread_jids(), vec!["a@example.org"]);
        // Re-adding restores the message flag
        let id = add(&mut roster, "a@example.org");
        assert!(roster.contact(id).unwrap().flags & flags::MSG != 0);
        assert_eq!(roster.unread_list(), vec!["a@example.org"]);
        assert!(roster.unread_jids().is_empty());
    }

    #[test]
    fn test_clear_preserves_unread_jids() {
        let mut roster = Roster::new();
        add(&mut roster, "a@example.org");
        roster.msg_set_flag("a@example.org", false, true);
        roster.clear();
        assert!(roster.is_empty());
        assert_eq!(roster.unread_jids(), vec!["a@example.org"]);
    }

    #[test]
    fn test_unread_next_cycles() {
        let mut roster = Roster::new();
        add(&mut roster, "a@example.org");
        add(&mut roster, "b@example.org");
        roster.msg_set_flag("a@example.org", false, true);
        roster.msg_set_flag("b@example.org", false, true);
        let first = roster.unread_next(None).unwrap();
        let second = roster.unread_next(Some(&first)).unwrap();
        let third = roster.unread_next(Some(&second)).unwrap();
        assert_ne!(first, second);
        assert_eq!(first, third);
    }

    #[test]
    fn test_unread_summary() {
        let mut roster = Roster::new();
        add(&mut roster, "a@example.org");
        roster.add_user(
            "room@conf.example.org",
            None,
            None,
            kind::ROOM,
            Subscription::None,
            None,
        );
        roster.msg_set_flag("a@example.org", false, true);
        roster.msg_set_flag("room@conf.example.org", false, true);
        roster.set_ui_prio(
            "a@example.org",
            false,
            UI_PRIO_ATTENTION_MESSAGE,
            UiPrioOp::Set,
        );
        roster.set_ui_prio(
            "room@conf.example.org",
            false,
            UI_PRIO_MUC_HL_MESSAGE,
            UiPrioOp::Set,
        );
        let summary = roster.unread_summary();
        assert_eq!(summary.unread, 2);
        assert_eq!(summary.attention, 1);
        assert_eq!(summary.muc_unread, 1);
        assert_eq!(summary.muc_attention, 1);
    }

    #[test]
    fn test_ui_prio_ops() {
        let mut roster = Roster::new();
        add(&mut roster, "a@example.org");
        roster.set_ui_prio("a@example.org", false, 5, UiPrioOp::Set);
        assert_eq!(roster.ui_prio("a@example.org", false), 5);
        roster.set_ui_prio("a@example.org", false, 3, UiPrioOp::Max);
        assert_eq!(roster.ui_prio("a@example.org", false), 5);
        roster.set_ui_prio("a@example.org", false, 7, UiPrioOp::Max);
        assert_eq!(roster.ui_prio("a@example.org", false), 7);
        roster.set_ui_prio("a@example.org", false, 2, UiPrioOp::Inc);
        assert_eq!(roster.ui_prio("a@example.org", false), 9);
    }

    #[test]
    fn test_unsubscribed_wipes_resources_keeps_message() {
        let mut roster = Roster::new();
        add(&mut roster, "a@example.org");
        online(&mut roster, "a@example.org", "r1", 1);
        roster.set_status(
            "a@example.org",
            Some("r2"),
            5,
            Presence::Away,
            Some("afk"),
            None,
            Role::None,
            Affiliation::None,
            None,
        );
        roster.unsubscribed("a@example.org");
        assert!(roster.resources("a@example.org").is_empty());
        assert_eq!(roster.status("a@example.org", None), Presence::Offline);
        // Last removed resource left its message behind
        assert_eq!(roster.status_msg("a@example.org", None), Some("afk".to_string()));
    }

    #[test]
    fn test_view_grouping_and_filter() {
        let mut roster = Roster::new();
        roster.add_user(
            "on@example.org",
            None,
            Some("G"),
            kind::USER,
            Subscription::None,
            None,
        );
        roster.add_user(
            "off@example.org",
            None,
            Some("G"),
            kind::USER,
            Subscription::None,
            None,
        );
        online(&mut roster, "on@example.org", "r", 0);
        let on_id = roster.find("on@example.org", FindBy::Jid, 0).unwrap();
        let off_id = roster.find("off@example.org", FindBy::Jid, 0).unwrap();

        roster.set_filter(FILTER_ALL);
        let view = roster.view().to_vec();
        assert!(view.contains(&ViewItem::Contact(on_id)));
        assert!(view.contains(&ViewItem::Contact(off_id)));
        assert_eq!(view[0], ViewItem::Special);

        roster.set_hide_offline_buddies(1);
        let view = roster.view().to_vec();
        assert!(view.contains(&ViewItem::Contact(on_id)));
        assert!(!view.contains(&ViewItem::Contact(off_id)));
    }

    #[test]
    fn test_view_keeps_unread_offline_contact() {
        let mut roster = Roster::new();
        add(&mut roster, "off@example.org");
        roster.msg_set_flag("off@example.org", false, true);
        roster.set_hide_offline_buddies(1);
        let id = roster.find("off@example.org", FindBy::Jid, 0).unwrap();
        assert!(roster.view().contains(&ViewItem::Contact(id)));
    }

    #[test]
    fn test_view_is_idempotent() {
        let mut roster = Roster::new();
        add(&mut roster, "a@example.org");
        let first = roster.view().to_vec();
        let second = roster.view().to_vec();
        assert_eq!(first, second);
    }

    #[test]
    fn test_room_only_setters_ignore_users() {
        let mut roster = Roster::new();
        add(&mut roster, "a@example.org");
        roster.set_topic("a@example.org", Some("nope"));
        assert_eq!(roster.topic("a@example.org"), None);
        roster.set_inside_room("a@example.org", true);
        assert!(!roster.inside_room("a@example.org"));
    }

    #[test]
    fn test_special_unread_flag() {
        let mut roster = Roster::new();
        assert!(roster.msg_set_flag("", true, true));
        assert!(!roster.msg_set_flag("", true, true));
        roster.set_ui_prio("", true, UI_PRIO_STATUS_WIN_MESSAGE, UiPrioOp::Set);
        assert_eq!(roster.ui_prio("", true), UI_PRIO_STATUS_WIN_MESSAGE);
        assert!(roster.msg_set_flag("", true, false));
        assert_eq!(roster.ui_prio("", true), 0);
    }

    #[test]
    fn test_groups_sorted_by_name() {
        let mut roster = Roster::new();
        roster.add_group("zeta");
        roster.add_group("alpha");
        roster.add_group("midway");
        let names: Vec<&str> = roster.groups().map(|g| g.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "midway", "zeta"]);
    }
}
