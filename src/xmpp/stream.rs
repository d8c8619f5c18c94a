//! Incremental XML stream engine.
//!
//! XMPP runs one long-lived XML document per direction, so the parser must
//! survive arbitrary chunk boundaries and keep state across reads. Bytes
//! go in through [`XmlStream::feed`]; complete top-level stanzas come out
//! as [`StreamEvent`]s.
//!
//! The parser only commits consumed input at stanza boundaries: a partial
//! stanza is re-parsed from its first byte on the next feed. Stanzas are
//! bounded (64 KiB) so the rescan cost stays small, and it makes text and
//! entity splits across chunks a non-issue.

use quick_xml::events::Event;
use quick_xml::Reader;
use rand::Rng;
use tracing::{debug, warn};

use super::element::{element_from_tag, Element, Node};
use super::ns;

pub const DEFAULT_MAX_DEPTH: usize = 128;
pub const DEFAULT_MAX_STANZA_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// The opening `<stream:stream>` envelope with its attributes.
    StreamStart {
        name: String,
        attrs: Vec<(String, String)>,
    },
    /// A complete top-level stanza.
    Stanza(Element),
    /// The `</stream:stream>` envelope close.
    StreamEnd,
    /// Fatal parser condition; the stream emits nothing further until
    /// [`XmlStream::reset`].
    StreamError {
        kind: StreamErrorKind,
        detail: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamErrorKind {
    Parse,
    DepthExceeded,
    SizeExceeded,
}

pub struct XmlStream {
    /// Raw bytes not yet decoded (may end inside a UTF-8 sequence).
    raw_tail: Vec<u8>,
    /// Decoded document text.
    buf: String,
    /// Byte offset into `buf` up to which events have been committed.
    consumed: usize,
    envelope_open: bool,
    poisoned: bool,
    max_depth: usize,
    max_stanza_bytes: usize,
}

impl XmlStream {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_MAX_DEPTH, DEFAULT_MAX_STANZA_BYTES)
    }

    pub fn with_limits(max_depth: usize, max_stanza_bytes: usize) -> Self {
        Self {
            raw_tail: Vec::new(),
            buf: String::new(),
            consumed: 0,
            envelope_open: false,
            poisoned: false,
            max_depth,
            max_stanza_bytes,
        }
    }

    /// Discards all parser state. Used before a TLS upgrade and after SASL
    /// to begin a fresh XML document on the same transport.
    pub fn reset(&mut self) {
        self.raw_tail.clear();
        self.buf.clear();
        self.consumed = 0;
        self.envelope_open = false;
        self.poisoned = false;
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Produces the opening stream header for the given namespace.
    pub fn open_stream(namespace: &str, to: &str, from: Option<&str>) -> String {
        let id: u64 = rand::thread_rng().gen();
        let from_attr = from
            .map(|f| format!(" from='{f}'"))
            .unwrap_or_default();
        format!(
            "<?xml version='1.0'?>\
             <stream:stream xmlns='{namespace}' \
             xmlns:stream='{}' \
             id='{id:016x}' to='{to}'{from_attr} version='1.0'>",
            ns::STREAM
        )
    }

    /// Serializes an outbound stanza.
    pub fn serialize(stanza: &Element) -> String {
        stanza.serialize()
    }

    /// Feeds a chunk of transport bytes and returns the events it
    /// completes. Chunk boundaries are irrelevant: any byte split of an
    /// input produces the same event sequence.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<StreamEvent> {
        if self.poisoned {
            return Vec::new();
        }
        self.raw_tail.extend_from_slice(bytes);
        match std::str::from_utf8(&self.raw_tail) {
            Ok(text) => {
                self.buf.push_str(text);
                self.raw_tail.clear();
            }
            Err(e) if e.error_len().is_none() => {
                // Ends inside a UTF-8 sequence; decode the valid prefix
                let valid = e.valid_up_to();
                self.buf
                    .push_str(std::str::from_utf8(&self.raw_tail[..valid]).unwrap());
                self.raw_tail.drain(..valid);
            }
            Err(e) => {
                self.poisoned = true;
                return vec![StreamEvent::StreamError {
                    kind: StreamErrorKind::Parse,
                    detail: format!("invalid UTF-8 in stream: {e}"),
                }];
            }
        }
        let events = self.drain_events();
        self.compact();
        events
    }

    fn drain_events(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        // Offset of the last committed boundary, relative to the
        // unconsumed slice
        let mut safe = 0usize;
        let mut fatal: Option<(StreamErrorKind, String)> = None;
        let mut envelope_open = self.envelope_open;

        {
            let data = &self.buf[self.consumed..];
            let mut reader = Reader::from_str(data);
            let mut stack: Vec<Element> = Vec::new();

            loop {
                match reader.read_event() {
                    Ok(Event::Start(start)) => {
                        let el = match element_from_tag(&start) {
                            Ok(el) => el,
                            Err(e) => {
                                fatal = Some((StreamErrorKind::Parse, e.to_string()));
                                break;
                            }
                        };
                        if !envelope_open && stack.is_empty() {
                            debug!("stream open: <{}>", el.name);
                            envelope_open = true;
                            events.push(StreamEvent::StreamStart {
                                name: el.name,
                                attrs: el.attrs,
                            });
                            safe = reader.buffer_position() as usize;
                            continue;
                        }
                        stack.push(el);
                        if stack.len() > self.max_depth {
                            fatal = Some((
                                StreamErrorKind::DepthExceeded,
                                format!("element depth exceeds {}", self.max_depth),
                            ));
                            break;
                        }
                    }
                    Ok(Event::Empty(start)) => {
                        let el = match element_from_tag(&start) {
                            Ok(el) => el,
                            Err(e) => {
                                fatal = Some((StreamErrorKind::Parse, e.to_string()));
                                break;
                            }
                        };
                        match stack.last_mut() {
                            Some(parent) => parent.children.push(Node::Element(el)),
                            None => {
                                if !envelope_open {
                                    fatal = Some((
                                        StreamErrorKind::Parse,
                                        "stanza before stream header".to_string(),
                                    ));
                                    break;
                                }
                                events.push(StreamEvent::Stanza(el));
                                safe = reader.buffer_position() as usize;
                            }
                        }
                    }
                    Ok(Event::End(_)) => match stack.pop() {
                        Some(el) => {
                            if let Some(parent) = stack.last_mut() {
                                parent.children.push(Node::Element(el));
                            } else {
                                events.push(StreamEvent::Stanza(el));
                                safe = reader.buffer_position() as usize;
                            }
                        }
                        None => {
                            // </stream:stream>
                            debug!("stream close");
                            events.push(StreamEvent::StreamEnd);
                            safe = reader.buffer_position() as usize;
                        }
                    },
                    Ok(Event::Text(t)) => {
                        if let Some(parent) = stack.last_mut() {
                            match t.unescape() {
                                Ok(text) => {
                                    parent.children.push(Node::Text(text.into_owned()))
                                }
                                Err(e) => {
                                    fatal = Some((StreamErrorKind::Parse, e.to_string()));
                                    break;
                                }
                            }
                        } else {
                            // Whitespace keep-alives between stanzas
                            safe = reader.buffer_position() as usize;
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
                    | Ok(Event::DocType(_)) => {
                        if stack.is_empty() {
                            safe = reader.buffer_position() as usize;
                        }
                    }
                    Ok(Event::Eof) => break,
                    Err(e) => {
                        if reader.buffer_position() as usize >= data.len() {
                            // Cut off mid-construct; wait for more bytes
                            break;
                        }
                        fatal = Some((StreamErrorKind::Parse, e.to_string()));
                        break;
                    }
                }
            }
        }

        self.envelope_open = envelope_open;
        if let Some((kind, detail)) = fatal {
            events.push(self.poison(kind, detail));
            return events;
        }

        self.consumed += safe;
        let pending = self.buf.len() - self.consumed;
        if pending > self.max_stanza_bytes {
            events.push(self.poison(
                StreamErrorKind::SizeExceeded,
                format!("stanza exceeds {} bytes", self.max_stanza_bytes),
            ));
        }
        events
    }

    fn poison(&mut self, kind: StreamErrorKind, detail: String) -> StreamEvent {
        warn!("stream poisoned: {kind:?}: {detail}");
        self.poisoned = true;
        self.buf.clear();
        self.raw_tail.clear();
        self.consumed = 0;
        StreamEvent::StreamError { kind, detail }
    }

    fn compact(&mut self) {
        if self.consumed > 8192 {
            self.buf.drain(..self.consumed);
            self.consumed = 0;
        }
    }
}

impl Default for XmlStream {
    fn default() -> Self {
        Self::new()
    }
}
