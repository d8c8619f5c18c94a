//! Entity capabilities cache (XEP-0115).
//!
//! Content-addressed storage of disco#info results, keyed by the
//! advertised verification hash. Verified entries are *global* (safe to
//! share across contacts and sessions, optionally persisted to disk);
//! entries whose hash does not recompute are quarantined *local to the
//! jid* they came from and never shared.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::PathBuf;

use base64::Engine;
use sha1::{Digest, Sha1};
use tracing::{debug, warn};

use crate::xmpp::element::Element;
use crate::xmpp::ns;

const B64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;

/// category / type / lang / name, ordered the way the hash input wants.
pub type Identity = (String, String, String, String);

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CapsEntry {
    pub identities: BTreeSet<Identity>,
    pub features: BTreeSet<String>,
    /// FORM_TYPE → var → values
    pub forms: BTreeMap<String, BTreeMap<String, BTreeSet<String>>>,
}

impl CapsEntry {
    /// The XEP-0115 §5 canonical serialization: sorted identities as
    /// `category/type/lang/name`, sorted features, then each data form
    /// sorted by FORM_TYPE with its fields sorted by var, all joined
    /// with `<` including a trailing one.
    pub fn canonical(&self) -> String {
        let mut s = String::new();
        for (category, typ, lang, name) in &self.identities {
            s.push_str(&format!("{category}/{typ}/{lang}/{name}<"));
        }
        for feature in &self.features {
            s.push_str(feature);
            s.push('<');
        }
        for (form_type, fields) in &self.forms {
            s.push_str(form_type);
            s.push('<');
            for (var, values) in fields {
                s.push_str(var);
                s.push('<');
                for value in values {
                    s.push_str(value);
                    s.push('<');
                }
            }
        }
        s
    }

    /// base64(SHA-1(canonical)).
    pub fn ver(&self) -> String {
        B64.encode(Sha1::digest(self.canonical().as_bytes()))
    }

    /// Populates the entry from a disco#info `<query/>` result.
    pub fn merge_disco_info(&mut self, query: &Element) {
        for child in query.child_elements() {
            match child.name.as_str() {
                "identity" => {
                    self.identities.insert((
                        child.attr("category").unwrap_or("").to_string(),
                        child.attr("type").unwrap_or("").to_string(),
                        child.attr("xml:lang").unwrap_or("").to_string(),
                        child.attr("name").unwrap_or("").to_string(),
                    ));
                }
                "feature" => {
                    if let Some(var) = child.attr("var") {
                        self.features.insert(var.to_string());
                    }
                }
                "x" => {
                    if child.xmlns() != Some(ns::X_DATA)
                        || child.attr("type") != Some("result")
                    {
                        continue;
                    }
                    let form_type = child
                        .child_elements()
                        .filter(|f| {
                            f.name == "field"
                                && f.attr("var") == Some("FORM_TYPE")
                                && f.attr("type") == Some("hidden")
                        })
                        .find_map(|f| f.child_text("value"));
                    let Some(form_type) = form_type else { continue };
                    let fields = self.forms.entry(form_type).or_default();
                    for field in child.child_elements().filter(|f| f.name == "field") {
                        let Some(var) = field.attr("var") else { continue };
                        if var == "FORM_TYPE" && field.attr("type") == Some("hidden") {
                            continue;
                        }
                        let values = fields.entry(var.to_string()).or_default();
                        for value in field.child_elements().filter(|v| v.name == "value") {
                            values.insert(value.text());
                        }
                    }
                }
                _ => {}
            }
        }
    }

    /// Renders the entry back to a disco#info `<query/>`, used for the
    /// persistent cache and for answering disco queries about ourselves.
    pub fn to_disco_info(&self, node: Option<&str>) -> Element {
        let mut query = Element::new("query").with_attr("xmlns", ns::DISCO_INFO);
        if let Some(node) = node {
            query.set_attr("node", node);
        }
        for (category, typ, lang, name) in &self.identities {
            let mut identity = Element::new("identity")
                .with_attr("category", category)
                .with_attr("type", typ);
            if !lang.is_empty() {
                identity.set_attr("xml:lang", lang);
            }
            if !name.is_empty() {
                identity.set_attr("name", name);
            }
            query.push_child(identity);
        }
        for feature in &self.features {
            query.push_child(Element::new("feature").with_attr("var", feature));
        }
        query
    }
}

pub struct CapsCache {
    /// Hash-verified entries, keyed by ver.
    global: HashMap<String, CapsEntry>,
    /// Unverified entries, keyed by (ver, bare jid).
    local: HashMap<(String, String), CapsEntry>,
    cache_dir: Option<PathBuf>,
}

impl CapsCache {
    pub fn new(cache_dir: Option<PathBuf>) -> Self {
        Self {
            global: HashMap::new(),
            local: HashMap::new(),
            cache_dir,
        }
    }

    /// Creates an empty global entry for `ver` (populated before
    /// verification).
    pub fn add(&mut self, ver: &str) {
        self.global.entry(ver.to_string()).or_default();
    }

    pub fn remove(&mut self, ver: &str) {
        self.global.remove(ver);
    }

    pub fn entry(&self, ver: &str, bjid: Option<&str>) -> Option<&CapsEntry> {
        if let Some(entry) = self.global.get(ver) {
            return Some(entry);
        }
        let bjid = bjid?;
        self.local.get(&(ver.to_string(), bjid.to_string()))
    }

    fn entry_mut(&mut self, ver: &str) -> Option<&mut CapsEntry> {
        self.global.get_mut(ver)
    }

    pub fn has_hash(&self, ver: &str, bjid: Option<&str>) -> bool {
        self.entry(ver, bjid).is_some()
    }

    pub fn has_feature(&self, ver: &str, feature: &str, bjid: Option<&str>) -> bool {
        self.entry(ver, bjid)
            .map(|e| e.features.contains(feature))
            .unwrap_or(false)
    }

    pub fn foreach_feature(&self, ver: &str, bjid: Option<&str>, mut f: impl FnMut(&str)) {
        if let Some(entry) = self.entry(ver, bjid) {
            for feature in &entry.features {
                f(feature);
            }
        }
    }

    pub fn add_identity(
        &mut self,
        ver: &str,
        category: &str,
        name: &str,
        typ: &str,
        lang: &str,
    ) {
        if let Some(entry) = self.entry_mut(ver) {
            entry.identities.insert((
                category.to_string(),
                typ.to_string(),
                lang.to_string(),
                name.to_string(),
            ));
        }
    }

    /// Replaces all identities with a single one (used for our own entry).
    pub fn set_identity(&mut self, ver: &str, category: &str, name: &str, typ: &str) {
        if let Some(entry) = self.entry_mut(ver) {
            entry.identities.clear();
            entry.identities.insert((
                category.to_string(),
                typ.to_string(),
                String::new(),
                name.to_string(),
            ));
        }
    }

    pub fn add_feature(&mut self, ver: &str, feature: &str) {
        if let Some(entry) = self.entry_mut(ver) {
            entry.features.insert(feature.to_string());
        }
    }

    pub fn add_dataform(&mut self, ver: &str, form_type: &str) {
        if let Some(entry) = self.entry_mut(ver) {
            entry.forms.entry(form_type.to_string()).or_default();
        }
    }

    pub fn add_dataform_field(&mut self, ver: &str, form_type: &str, var: &str, value: &str) {
        if let Some(entry) = self.entry_mut(ver) {
            entry
                .forms
                .entry(form_type.to_string())
                .or_default()
                .entry(var.to_string())
                .or_default()
                .insert(value.to_string());
        }
    }

    /// Merges a disco#info query result into the entry for `ver`.
    pub fn merge_disco_info(&mut self, ver: &str, query: &Element) {
        if let Some(entry) = self.entry_mut(ver) {
            entry.merge_disco_info(query);
        }
    }

    /// Recomputes the canonical digest of the entry stored under `ver`
    /// and compares it with the key. Only `sha-1` is supported.
    pub fn verify(&self, ver: &str, algo: &str) -> bool {
        if algo != "sha-1" {
            return false;
        }
        self.global
            .get(ver)
            .map(|entry| entry.ver() == ver)
            .unwrap_or(false)
    }

    /// Quarantines a failed-verification entry: it leaves the global
    /// table and is only visible for this jid.
    pub fn move_to_local(&mut self, ver: &str, bjid: &str) {
        if let Some(entry) = self.global.remove(ver) {
            warn!("caps hash mismatch for {ver}, keeping local to {bjid}");
            self.local
                .insert((ver.to_string(), bjid.to_string()), entry);
        }
    }

    /// Computes the verification string of the entry under the empty key
    /// (our own advertisement being built) and re-files it under its ver.
    pub fn generate(&mut self) -> String {
        let entry = self.global.remove("").unwrap_or_default();
        let ver = entry.ver();
        self.global.insert(ver.clone(), entry);
        ver
    }

    // ── session-crossing persistence ────────────────────

    fn persistent_path(&self, ver: &str) -> Option<PathBuf> {
        let dir = self.cache_dir.as_ref()?;
        // File name is the hex of the ver string; raw base64 could
        // contain path separators
        Some(dir.join("sha-1").join(hex::encode(ver.as_bytes())))
    }

    /// Saves the canonical disco#info XML for a verified entry.
    pub fn copy_to_persistent(&self, ver: &str, xml: &str) {
        let Some(path) = self.persistent_path(ver) else {
            return;
        };
        if path.exists() {
            return;
        }
        let result = path
            .parent()
            .map(fs::create_dir_all)
            .unwrap_or(Ok(()))
            .and_then(|_| fs::write(&path, xml));
        match result {
            Ok(()) => debug!("caps entry {ver} persisted"),
            Err(e) => warn!("cannot persist caps entry {ver}: {e}"),
        }
    }

    /// Loads a persisted entry back into the global table. Returns true
    /// when the entry is available afterwards.
    pub fn restore_from_persistent(&mut self, ver: &str) -> bool {
        if self.global.contains_key(ver) {
            return true;
        }
        let Some(path) = self.persistent_path(ver) else {
            return false;
        };
        let Ok(xml) = fs::read_to_string(&path) else {
            return false;
        };
        match Element::parse(&xml) {
            Ok(query) => {
                let mut entry = CapsEntry::default();
                entry.merge_disco_info(&query);
                self.global.insert(ver.to_string(), entry);
                debug!("caps entry {ver} restored from cache");
                true
            }
            Err(e) => {
                warn!("corrupt caps cache file for {ver}: {e}");
                let _ = fs::remove_file(&path);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The XEP-0115 §5.2 example: Exodus 0.9.1.
    fn exodus_entry() -> CapsEntry {
        let mut entry = CapsEntry::default();
        entry.identities.insert((
            "client".to_string(),
            "pc".to_string(),
            String::new(),
            "Exodus 0.9.1".to_string(),
        ));
        for feature in [
            "http://jabber.org/protocol/caps",
            "http://jabber.org/protocol/disco#info",
            "http://jabber.org/protocol/disco#items",
            "http://jabber.org/protocol/muc",
        ] {
            entry.features.insert(feature.to_string());
        }
        entry
    }

    const EXODUS_VER: &str = "QgayPKawpkPSDYmwT/WM94uAlu0=";

    #[test]
    fn test_canonical_string() {
        assert_eq!(
            exodus_entry().canonical(),
            "client/pc//Exodus 0.9.1<http://jabber.org/protocol/caps<\
             http://jabber.org/protocol/disco#info<\
             http://jabber.org/protocol/disco#items<\
             http://jabber.org/protocol/muc<"
        );
    }

    #[test]
    fn test_ver_matches_xep_vector() {
        assert_eq!(exodus_entry().ver(), EXODUS_VER);
    }

    #[test]
    fn test_verify_round_trip_through_disco() {
        let mut cache = CapsCache::new(None);
        cache.add(EXODUS_VER);
        let query = exodus_entry().to_disco_info(None);
        cache.merge_disco_info(EXODUS_VER, &query);
        assert!(cache.verify(EXODUS_VER, "sha-1"));
        assert!(!cache.verify(EXODUS_VER, "md5"));
    }

    #[test]
    fn test_verify_detects_tampering() {
        let mut cache = CapsCache::new(None);
        cache.add(EXODUS_VER);
        cache.merge_disco_info(EXODUS_VER, &exodus_entry().to_disco_info(None));
        cache.add_feature(EXODUS_VER, "urn:xmpp:bogus");
        assert!(!cache.verify(EXODUS_VER, "sha-1"));
    }

    #[test]
    fn test_forms_affect_hash() {
        let mut entry = exodus_entry();
        let base = entry.ver();
        entry
            .forms
            .entry("urn:xmpp:dataforms:softwareinfo".to_string())
            .or_default()
            .entry("os".to_string())
            .or_default()
            .insert("Mac".to_string());
        assert_ne!(entry.ver(), base);
        assert!(entry
            .canonical()
            .contains("urn:xmpp:dataforms:softwareinfo<os<Mac<"));
    }

    #[test]
    fn test_has_hash_global_vs_local() {
        let mut cache = CapsCache::new(None);
        cache.add("V1");
        cache.add_feature("V1", "urn:xmpp:ping");
        assert!(cache.has_hash("V1", None));
        assert!(cache.has_hash("V1", Some("anyone@ex")));

        cache.move_to_local("V1", "alice@ex");
        assert!(!cache.has_hash("V1", None));
        assert!(cache.has_hash("V1", Some("alice@ex")));
        assert!(!cache.has_hash("V1", Some("bob@ex")));
    }

    #[test]
    fn test_has_feature() {
        let mut cache = CapsCache::new(None);
        cache.add("V1");
        cache.add_feature("V1", "urn:xmpp:receipts");
        assert!(cache.has_feature("V1", "urn:xmpp:receipts", None));
        assert!(!cache.has_feature("V1", "urn:xmpp:ping", None));
        assert!(!cache.has_feature("V2", "urn:xmpp:receipts", None));
    }

    #[test]
    fn test_generate_files_own_entry_under_its_ver() {
        let mut cache = CapsCache::new(None);
        cache.add("");
        cache.set_identity("", "client", "Exodus 0.9.1", "pc");
        for feature in [
            "http://jabber.org/protocol/caps",
            "http://jabber.org/protocol/disco#info",
            "http://jabber.org/protocol/disco#items",
            "http://jabber.org/protocol/muc",
        ] {
            cache.add_feature("", feature);
        }
        let ver = cache.generate();
        assert_eq!(ver, EXODUS_VER);
        assert!(cache.has_hash(&ver, None));
        assert!(cache.verify(&ver, "sha-1"));
    }

    #[test]
    fn test_persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let entry = exodus_entry();
        let xml = entry.to_disco_info(None).serialize();
        {
            let cache = CapsCache::new(Some(dir.path().to_path_buf()));
            cache.copy_to_persistent(EXODUS_VER, &xml);
        }
        let mut cache = CapsCache::new(Some(dir.path().to_path_buf()));
        assert!(!cache.has_hash(EXODUS_VER, None));
        assert!(cache.restore_from_persistent(EXODUS_VER));
        assert!(cache.has_hash(EXODUS_VER, None));
        assert!(cache.verify(EXODUS_VER, "sha-1"));
        assert!(cache.has_feature(EXODUS_VER, "http://jabber.org/protocol/muc", None));
    }

    #[test]
    fn test_restore_missing_entry() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = CapsCache::new(Some(dir.path().to_path_buf()));
        assert!(!cache.restore_from_persistent("absent="));
    }

    #[test]
    fn test_restore_without_cache_dir() {
        let mut cache = CapsCache::new(None);
        assert!(!cache.restore_from_persistent("whatever="));
    }

    #[test]
    fn test_corrupt_cache_file_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = CapsCache::new(Some(dir.path().to_path_buf()));
        let path = dir
            .path()
            .join("sha-1")
            .join(hex::encode("BAD=".as_bytes()));
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "<query xmlns='oops'").unwrap();
        assert!(!cache.restore_from_persistent("BAD="));
        assert!(!path.exists());
    }

    #[test]
    fn test_merge_disco_info_with_form() {
        let query = Element::parse(
            "<query xmlns='http://jabber.org/protocol/disco#info'>\
             <identity category='client' type='pc' name='Psi 0.11' xml:lang='en'/>\
             <feature var='http://jabber.org/protocol/caps'/>\
             <x xmlns='jabber:x:data' type='result'>\
             <field var='FORM_TYPE' type='hidden'>\
             <value>urn:xmpp:dataforms:softwareinfo</value></field>\
             <field var='os'><value>Mac</value></field>\
             <field var='software_version'><value>0.11</value></field>\
             </x></query>",
        )
        .unwrap();
        let mut entry = CapsEntry::default();
        entry.merge_disco_info(&query);
        assert!(entry.identities.contains(&(
            "client".to_string(),
            "pc".to_string(),
            "en".to_string(),
            "Psi 0.11".to_string()
        )));
        let form = &entry.forms["urn:xmpp:dataforms:softwareinfo"];
        assert!(form["os"].contains("Mac"));
        assert!(form["software_version"].contains("0.11"));
    }
}
