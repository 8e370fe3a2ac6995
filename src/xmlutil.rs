//! XML helpers shared by every XML-consuming handler.
//!
//! A single hardened parse entry point builds an `xmltree::Element` tree
//! from a request body while enforcing depth and element-count limits.
//! The underlying reader performs no external entity resolution.

use std::borrow::Cow;
use std::io::Write;

use xml::reader::{EventReader, ParserConfig, XmlEvent};
use xml::writer::{EventWriter, XmlEvent as XmlWEvent};
use xmltree::{Element, XMLNode};

use crate::errors::DavError;
use crate::DavResult;

pub const NS_DAV: &str = "DAV:";
pub const NS_CALDAV: &str = "urn:ietf:params:xml:ns:caldav";
pub const NS_CARDDAV: &str = "urn:ietf:params:xml:ns:carddav";
pub const NS_ICAL: &str = "http://apple.com/ns/ical/";
pub const NS_CALSERVER: &str = "http://calendarserver.org/ns/";
pub const NS_RADICALE: &str = "http://radicale.org/ns/";

// protection against XML bombs.
const MAX_DEPTH: usize = 64;
const MAX_ELEMENTS: usize = 65536;

/// Canonical prefix for a namespace URI, if it has one.
pub fn known_prefix(uri: &str) -> Option<&'static str> {
    match uri {
        NS_DAV => Some("D"),
        NS_CALDAV => Some("C"),
        NS_CARDDAV => Some("CR"),
        NS_ICAL => Some("ICAL"),
        NS_CALSERVER => Some("CS"),
        NS_RADICALE => Some("RADICALE"),
        _ => None,
    }
}

fn prefix_uri(prefix: &str) -> Option<&'static str> {
    match prefix {
        "D" => Some(NS_DAV),
        "C" => Some(NS_CALDAV),
        "CR" => Some(NS_CARDDAV),
        "ICAL" => Some(NS_ICAL),
        "CS" => Some(NS_CALSERVER),
        "RADICALE" => Some(NS_RADICALE),
        _ => None,
    }
}

/// Parse an XML request body into an element tree.
pub fn parse_xml(data: &[u8]) -> DavResult<Element> {
    let config = ParserConfig::new()
        .trim_whitespace(false)
        .cdata_to_characters(true)
        .ignore_comments(true);
    let parser = EventReader::new_with_config(data, config);

    let mut count = 0usize;
    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    for event in parser {
        match event.map_err(|_| DavError::XmlParseError)? {
            XmlEvent::StartElement {
                name,
                attributes,
                namespace,
            } => {
                count += 1;
                if count > MAX_ELEMENTS || stack.len() >= MAX_DEPTH {
                    return Err(DavError::XmlOverflow);
                }
                let mut elem = Element::new(&name.local_name);
                elem.namespace = name.namespace.clone();
                if elem.namespace.is_none() {
                    if let Some(ref prefix) = name.prefix {
                        elem.namespace = namespace.get(prefix.as_str()).map(|s| s.to_string());
                    }
                }
                for attr in attributes {
                    elem.attributes.insert(attr.name.local_name, attr.value);
                }
                stack.push(elem);
            }
            XmlEvent::EndElement { .. } => {
                let elem = match stack.pop() {
                    Some(e) => e,
                    None => return Err(DavError::XmlParseError),
                };
                match stack.last_mut() {
                    Some(parent) => parent.children.push(XMLNode::Element(elem)),
                    None => {
                        root = Some(elem);
                        break;
                    }
                }
            }
            XmlEvent::Characters(text) => {
                if let Some(elem) = stack.last_mut() {
                    elem.children.push(XMLNode::Text(text));
                }
            }
            _ => {}
        }
    }

    root.ok_or(DavError::XmlParseError)
}

/// Extension helpers on `xmltree::Element`.
pub trait ElementExt {
    /// New element from a `"D:name"` style qualified name.
    fn new2(qname: &str) -> Element;
    /// New element with text content.
    fn new_text(qname: &str, text: impl Into<String>) -> Element;
    /// Concatenated text content of this element.
    fn text_content(&self) -> String;
    /// Child elements.
    fn child_elems(&self) -> Vec<&Element>;
    /// Take ownership of the child elements.
    fn take_child_elems(self) -> Vec<Element>;
    /// First child element with a given namespace and local name.
    fn find(&self, ns: &str, name: &str) -> Option<&Element>;
    /// Is this element `name` in namespace `ns`?
    fn is(&self, ns: &str, name: &str) -> bool;
    /// Serialize this element (and children) into an event writer.
    fn write_ev<W: Write>(&self, emitter: &mut EventWriter<W>) -> Result<(), xml::writer::Error>;
}

impl ElementExt for Element {
    fn new2(qname: &str) -> Element {
        match qname.split_once(':') {
            Some((prefix, local)) if prefix_uri(prefix).is_some() => {
                let mut e = Element::new(local);
                e.prefix = Some(prefix.to_string());
                e.namespace = prefix_uri(prefix).map(|s| s.to_string());
                e
            }
            _ => Element::new(qname),
        }
    }

    fn new_text(qname: &str, text: impl Into<String>) -> Element {
        let mut e = Element::new2(qname);
        e.children.push(XMLNode::Text(text.into()));
        e
    }

    fn text_content(&self) -> String {
        let mut out = String::new();
        for child in &self.children {
            match child {
                XMLNode::Text(t) => out.push_str(t),
                XMLNode::CData(t) => out.push_str(t),
                _ => {}
            }
        }
        out
    }

    fn child_elems(&self) -> Vec<&Element> {
        self.children
            .iter()
            .filter_map(|n| match n {
                XMLNode::Element(e) => Some(e),
                _ => None,
            })
            .collect()
    }

    fn take_child_elems(self) -> Vec<Element> {
        self.children
            .into_iter()
            .filter_map(|n| match n {
                XMLNode::Element(e) => Some(e),
                _ => None,
            })
            .collect()
    }

    fn find(&self, ns: &str, name: &str) -> Option<&Element> {
        self.children.iter().find_map(|n| match n {
            XMLNode::Element(e) if e.name == name && e.namespace.as_deref() == Some(ns) => Some(e),
            _ => None,
        })
    }

    fn is(&self, ns: &str, name: &str) -> bool {
        self.name == name && self.namespace.as_deref() == Some(ns)
    }

    fn write_ev<W: Write>(&self, emitter: &mut EventWriter<W>) -> Result<(), xml::writer::Error> {
        // Elements in a known namespace are written with the canonical
        // prefix (declared on the multistatus root); anything else gets
        // an inline default-namespace declaration.
        let (qname, inline_ns): (Cow<'_, str>, Option<&str>) = match self.namespace.as_deref() {
            Some(uri) => match known_prefix(uri) {
                Some(prefix) => (Cow::Owned(format!("{}:{}", prefix, self.name)), None),
                None => (Cow::Borrowed(self.name.as_str()), Some(uri)),
            },
            None => (Cow::Borrowed(self.name.as_str()), None),
        };
        let mut start = XmlWEvent::start_element(qname.as_ref());
        if let Some(uri) = inline_ns {
            start = start.default_ns(uri);
        }
        for (k, v) in &self.attributes {
            start = start.attr(k.as_str(), v);
        }
        emitter.write(start)?;
        for child in &self.children {
            match child {
                XMLNode::Element(e) => e.write_ev(emitter)?,
                XMLNode::Text(t) => emitter.write(XmlWEvent::characters(t))?,
                XMLNode::CData(t) => emitter.write(XmlWEvent::characters(t))?,
                _ => {}
            }
        }
        emitter.write(XmlWEvent::end_element())?;
        Ok(())
    }
}

/// Property key used by the storage layer: `D:displayname` style for
/// the known namespaces, Clark notation `{uri}name` otherwise.
pub fn qualified_name(elem: &Element) -> String {
    match elem.namespace.as_deref() {
        Some(uri) => match known_prefix(uri) {
            Some(prefix) => format!("{}:{}", prefix, elem.name),
            None => format!("{{{}}}{}", uri, elem.name),
        },
        None => elem.name.clone(),
    }
}

/// Inverse of `qualified_name`.
pub fn element_for_qname(qname: &str) -> Element {
    if let Some(rest) = qname.strip_prefix('{') {
        if let Some((uri, name)) = rest.split_once('}') {
            let mut e = Element::new(name);
            e.namespace = Some(uri.to_string());
            return e;
        }
    }
    Element::new2(qname)
}
