//! Owned XML element tree.
//!
//! Stanzas are small and short-lived, so the tree keeps owned strings and
//! an ordered child list. Prefixed names (`stream:features`) are kept
//! literally; namespaces are plain `xmlns` attributes the way the wire
//! carries them.

use anyhow::{anyhow, Result};
use quick_xml::events::Event;
use quick_xml::Reader;

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Element(Element),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Element {
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub children: Vec<Node>,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attrs: Vec::new(),
            children: Vec::new(),
        }
    }

    // ── builders ────────────────────────────────────────

    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_attr(name, value);
        self
    }

    pub fn with_child(mut self, child: Element) -> Self {
        self.children.push(Node::Element(child));
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.children.push(Node::Text(text.into()));
        self
    }

    // ── mutators ────────────────────────────────────────

    pub fn set_attr(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        if let Some(slot) = self.attrs.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = value.into();
        } else {
            self.attrs.push((name, value.into()));
        }
    }

    pub fn push_child(&mut self, child: Element) -> &mut Element {
        self.children.push(Node::Element(child));
        match self.children.last_mut() {
            Some(Node::Element(el)) => el,
            _ => unreachable!(),
        }
    }

    pub fn push_text(&mut self, text: impl Into<String>) {
        self.children.push(Node::Text(text.into()));
    }

    /// Removes all element children matching the predicate.
    pub fn retain_children(&mut self, mut keep: impl FnMut(&Element) -> bool) {
        self.children.retain(|node| match node {
            Node::Element(el) => keep(el),
            Node::Text(_) => true,
        });
    }

    // ── accessors ───────────────────────────────────────

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn xmlns(&self) -> Option<&str> {
        self.attr("xmlns")
    }

    /// First child element with the given name.
    pub fn child(&self, name: &str) -> Option<&Element> {
        self.child_elements().find(|el| el.name == name)
    }

    /// First child element carrying the given `xmlns` attribute.
    pub fn find_xmlns(&self, xmlns: &str) -> Option<&Element> {
        self.child_elements().find(|el| el.xmlns() == Some(xmlns))
    }

    pub fn child_elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|node| match node {
            Node::Element(el) => Some(el),
            Node::Text(_) => None,
        })
    }

    /// Concatenated direct text content.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for node in &self.children {
            if let Node::Text(t) = node {
                out.push_str(t);
            }
        }
        out
    }

    /// Text of the named child. `Some("")` when the child exists but is
    /// empty, `None` when there is no such child — the two cases matter
    /// (empty body vs missing body).
    pub fn child_text(&self, name: &str) -> Option<String> {
        self.child(name).map(Element::text)
    }

    // ── serialization ───────────────────────────────────

    pub fn serialize(&self) -> String {
        let mut out = String::new();
        self.write_to(&mut out);
        out
    }

    fn write_to(&self, out: &mut String) {
        out.push('<');
        out.push_str(&self.name);
        for (name, value) in &self.attrs {
            out.push(' ');
            out.push_str(name);
            out.push_str("='");
            out.push_str(&escape(value));
            out.push('\'');
        }
        if self.children.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        for node in &self.children {
            match node {
                Node::Element(el) => el.write_to(out),
                Node::Text(t) => out.push_str(&escape(t)),
            }
        }
        out.push_str("</");
        out.push_str(&self.name);
        out.push('>');
    }

    /// Parses a single complete element from a string. Used for cache
    /// restore and in tests; live traffic goes through the stream parser.
    pub fn parse(input: &str) -> Result<Element> {
        let mut reader = Reader::from_str(input);
        let mut stack: Vec<Element> = Vec::new();
        loop {
            match reader.read_event() {
                Ok(Event::Start(start)) => {
                    stack.push(element_from_tag(&start)?);
                }
                Ok(Event::Empty(start)) => {
                    let el = element_from_tag(&start)?;
                    match stack.last_mut() {
                        Some(parent) => {
                            parent.children.push(Node::Element(el));
                        }
                        None => return finish(el, &mut reader),
                    }
                }
                Ok(Event::End(_)) => {
                    let el = stack.pop().ok_or_else(|| anyhow!("Unbalanced end tag"))?;
                    match stack.last_mut() {
                        Some(parent) => {
                            parent.children.push(Node::Element(el));
                        }
                        None => return finish(el, &mut reader),
                    }
                }
                Ok(Event::Text(t)) => {
                    let text = t.unescape().map_err(|e| anyhow!("Bad text: {e}"))?;
                    if let Some(parent) = stack.last_mut() {
                        parent.children.push(Node::Text(text.into_owned()));
                    }
                }
                Ok(Event::CData(c)) => {
                    if let Some(parent) = stack.last_mut() {
                        parent
                            .children
                            .push(Node::Text(String::from_utf8_lossy(&c).into_owned()));
                    }
                }
                Ok(Event::Decl(_)) | Ok(Event::Comment(_)) | Ok(Event::PI(_))
                | Ok(Event::DocType(_)) => {}
                Ok(Event::Eof) => return Err(anyhow!("Unexpected end of document")),
                Err(e) => return Err(anyhow!("XML parse error: {e}")),
            }
        }
    }
}

fn finish(el: Element, reader: &mut Reader<&[u8]>) -> Result<Element> {
    // Nothing meaningful may follow the root element
    loop {
        match reader.read_event() {
            Ok(Event::Eof) => return Ok(el),
            Ok(Event::Text(t)) if t.unescape().map(|s| s.trim().is_empty()).unwrap_or(false) => {}
            Ok(other) => return Err(anyhow!("Trailing content after element: {other:?}")),
            Err(e) => return Err(anyhow!("XML parse error: {e}")),
        }
    }
}

pub(crate) fn element_from_tag(start: &quick_xml::events::BytesStart<'_>) -> Result<Element> {
    let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
    let mut el = Element::new(name);
    for attr in start.attributes() {
        let attr = attr.map_err(|e| anyhow!("Bad attribute: {e}"))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|e| anyhow!("Bad attribute value: {e}"))?
            .into_owned();
        el.attrs.push((key, value));
    }
    Ok(el)
}

fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\'' => out.push_str("&apos;"),
            '"' => out.push_str("&quot;"),
            other => out.push(other),
        }
    }
    out
}
