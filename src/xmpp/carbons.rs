//! Message Carbons (XEP-0280): server-side mirroring of our messages to
//! all of our resources.

use super::element::Element;
use super::session::Session;
use super::stanzas::IqKind;
use super::ns;

impl Session {
    /// Called when the server disco result advertises carbons; honors
    /// the `carbons` auto-enable option.
    pub(crate) fn carbons_available(&mut self) {
        self.carbons_available = true;
        if self.config.carbons {
            self.carbons_enable();
        }
    }

    pub fn carbons_enabled(&self) -> bool {
        self.carbons_enabled
    }

    pub fn carbons_enable(&mut self) {
        if !self.carbons_available {
            self.logwindow("", "Carbons not available on this server!");
            return;
        }
        if self.carbons_enabled {
            return;
        }
        self.send_carbons_toggle("enable");
    }

    pub fn carbons_disable(&mut self) {
        if !self.carbons_available {
            self.logwindow("", "Carbons not available on this server!");
            return;
        }
        if !self.carbons_enabled {
            return;
        }
        self.send_carbons_toggle("disable");
    }

    fn send_carbons_toggle(&mut self, action: &str) {
        let child = Element::new(action).with_attr("xmlns", ns::CARBONS_2);
        self.send_iq(
            IqKind::Set,
            None,
            child,
            Box::new(|session, reply| {
                if let super::bus::IqReply::Result(_) = reply {
                    session.carbons_enabled = !session.carbons_enabled;
                    if session.carbons_enabled {
                        session.logwindow("", "Carbons enabled.");
                    } else {
                        session.logwindow("", "Carbons disabled.");
                    }
                }
            }),
        );
    }

    /// Carbons state does not survive the stream.
    pub(crate) fn carbons_reset(&mut self) {
        self.carbons_available = false;
        self.carbons_enabled = false;
    }

    pub fn carbons_info(&mut self) {
        let text = if self.carbons_enabled {
            "Carbons enabled."
        } else if self.carbons_available {
            "Carbons available, but not enabled."
        } else {
            "Carbons not available."
        };
        self.logwindow("", text);
    }
}
