//! The item model: parsing, canonical serialization and inspection of
//! iCalendar (RFC 5545) and vCard (RFC 6350) payloads.
//!
//! An `Item` is one logical component (plus overridden recurrences that
//! share its UID) or a single card. Payloads are canonicalized on
//! write: lines are re-folded, `VERSION` and `UID` are guaranteed, and
//! VCALENDAR wrappers carry this server's `PRODID`.

use std::borrow::Cow;
use std::fmt::Write as _;
use std::str::FromStr;
use std::time::SystemTime;

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// PRODID emitted on every VCALENDAR this server serializes.
pub const PRODID: &str = "-//Carillon//NONSGML Carillon Server//EN";

#[derive(Debug, Error)]
pub enum ItemError {
    #[error("invalid item: {0}")]
    Invalid(String),
    #[error("item has no UID")]
    MissingUid,
    #[error("duplicate UID {0}")]
    DuplicateUid(String),
    #[error("unsupported component {0}")]
    UnsupportedComponent(String),
}

/// The kind of component stored in an item, which constrains the
/// collection tag it is compatible with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentKind {
    Event,
    Todo,
    Journal,
    Card,
}

impl ComponentKind {
    pub fn name(self) -> &'static str {
        match self {
            ComponentKind::Event => "VEVENT",
            ComponentKind::Todo => "VTODO",
            ComponentKind::Journal => "VJOURNAL",
            ComponentKind::Card => "VCARD",
        }
    }

    pub fn is_calendar(self) -> bool {
        !matches!(self, ComponentKind::Card)
    }

    fn from_name(name: &str) -> Result<ComponentKind, ItemError> {
        match name {
            "VEVENT" => Ok(ComponentKind::Event),
            "VTODO" => Ok(ComponentKind::Todo),
            "VJOURNAL" => Ok(ComponentKind::Journal),
            "VCARD" => Ok(ComponentKind::Card),
            other => Err(ItemError::UnsupportedComponent(other.to_string())),
        }
    }
}

/// A single unfolded content line: name, parameters, raw value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentLine {
    pub name: String,
    pub params: Vec<(String, Vec<String>)>,
    pub value: String,
}

impl ContentLine {
    pub fn new(name: &str, value: impl Into<String>) -> ContentLine {
        ContentLine {
            name: name.to_string(),
            params: Vec::new(),
            value: value.into(),
        }
    }

    /// First value of a parameter, case-insensitive name.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .and_then(|(_, v)| v.first())
            .map(|s| s.as_str())
    }

    pub fn param_values(&self, name: &str) -> &[String] {
        self.params
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_slice())
            .unwrap_or(&[])
    }

    fn parse(line: &str) -> Result<ContentLine, ItemError> {
        let bytes = line.as_bytes();
        let mut i = 0;
        while i < bytes.len() && bytes[i] != b';' && bytes[i] != b':' {
            i += 1;
        }
        if i == 0 || i == bytes.len() {
            return Err(ItemError::Invalid(format!("malformed content line: {line:.40}")));
        }
        let name = line[..i].to_ascii_uppercase();
        let mut params = Vec::new();

        while bytes[i] == b';' {
            i += 1;
            let pstart = i;
            while i < bytes.len() && bytes[i] != b'=' && bytes[i] != b';' && bytes[i] != b':' {
                i += 1;
            }
            if i == bytes.len() {
                return Err(ItemError::Invalid(format!("unterminated parameter: {line:.40}")));
            }
            let pname = line[pstart..i].to_ascii_uppercase();
            let mut values = Vec::new();
            if bytes[i] == b'=' {
                i += 1;
                loop {
                    let mut value = String::new();
                    if i < bytes.len() && bytes[i] == b'"' {
                        i += 1;
                        let vstart = i;
                        while i < bytes.len() && bytes[i] != b'"' {
                            i += 1;
                        }
                        if i == bytes.len() {
                            return Err(ItemError::Invalid(format!(
                                "unterminated quoted parameter: {line:.40}"
                            )));
                        }
                        value.push_str(&line[vstart..i]);
                        i += 1;
                    } else {
                        let vstart = i;
                        while i < bytes.len()
                            && bytes[i] != b','
                            && bytes[i] != b';'
                            && bytes[i] != b':'
                        {
                            i += 1;
                        }
                        value.push_str(&line[vstart..i]);
                    }
                    values.push(value);
                    if i < bytes.len() && bytes[i] == b',' {
                        i += 1;
                    } else {
                        break;
                    }
                }
                if i == bytes.len() {
                    return Err(ItemError::Invalid(format!("unterminated parameter: {line:.40}")));
                }
            }
            params.push((pname, values));
        }

        // bytes[i] == b':'
        let value = line[i + 1..].to_string();
        Ok(ContentLine { name, params, value })
    }

    pub fn serialize_into(&self, out: &mut String) {
        let mut line = String::with_capacity(self.name.len() + self.value.len() + 2);
        line.push_str(&self.name);
        for (pname, pvalues) in &self.params {
            line.push(';');
            line.push_str(pname);
            if !pvalues.is_empty() {
                line.push('=');
                for (i, v) in pvalues.iter().enumerate() {
                    if i > 0 {
                        line.push(',');
                    }
                    if v.contains([';', ':', ',']) {
                        line.push('"');
                        line.push_str(v);
                        line.push('"');
                    } else {
                        line.push_str(v);
                    }
                }
            }
        }
        line.push(':');
        line.push_str(&self.value);
        fold_into(&line, out);
    }
}

// fold a logical line into physical lines of at most 75 octets.
fn fold_into(line: &str, out: &mut String) {
    let mut budget = 75;
    let mut len = 0;
    for c in line.chars() {
        let clen = c.len_utf8();
        if len + clen > budget {
            out.push_str("\r\n ");
            len = 0;
            budget = 74;
        }
        out.push(c);
        len += clen;
    }
    out.push_str("\r\n");
}

/// A component: `BEGIN:NAME` ... `END:NAME` with properties and nested
/// components, in input order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Component {
    pub name: String,
    pub properties: Vec<ContentLine>,
    pub components: Vec<Component>,
}

impl Component {
    pub fn new(name: &str) -> Component {
        Component {
            name: name.to_string(),
            properties: Vec::new(),
            components: Vec::new(),
        }
    }

    pub fn property(&self, name: &str) -> Option<&ContentLine> {
        self.properties.iter().find(|p| p.name == name)
    }

    pub fn properties_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a ContentLine> {
        self.properties.iter().filter(move |p| p.name == name)
    }

    pub fn set_property(&mut self, line: ContentLine) {
        match self.properties.iter_mut().find(|p| p.name == line.name) {
            Some(p) => *p = line,
            None => self.properties.push(line),
        }
    }

    pub fn remove_property(&mut self, name: &str) {
        self.properties.retain(|p| p.name != name);
    }

    pub fn serialize_into(&self, out: &mut String) {
        let _ = write!(out, "BEGIN:{}\r\n", self.name);
        for prop in &self.properties {
            prop.serialize_into(out);
        }
        for comp in &self.components {
            comp.serialize_into(out);
        }
        let _ = write!(out, "END:{}\r\n", self.name);
    }

    pub fn serialize(&self) -> String {
        let mut out = String::new();
        self.serialize_into(&mut out);
        out
    }
}

/// Remove control characters that would break the parser; CR, LF and
/// TAB survive.
pub fn strip_control(input: &str) -> Cow<'_, str> {
    if input.chars().any(|c| c.is_control() && c != '\r' && c != '\n' && c != '\t') {
        Cow::Owned(
            input
                .chars()
                .filter(|c| !c.is_control() || *c == '\r' || *c == '\n' || *c == '\t')
                .collect(),
        )
    } else {
        Cow::Borrowed(input)
    }
}

fn unfold(input: &str) -> Vec<String> {
    let mut lines: Vec<String> = Vec::new();
    for raw in input.split('\n') {
        let raw = raw.strip_suffix('\r').unwrap_or(raw);
        if let Some(rest) = raw.strip_prefix(' ').or_else(|| raw.strip_prefix('\t')) {
            if let Some(last) = lines.last_mut() {
                last.push_str(rest);
                continue;
            }
        }
        if !raw.is_empty() {
            lines.push(raw.to_string());
        }
    }
    lines
}

/// Parse a text stream into its top-level components.
pub fn parse_components(input: &str) -> Result<Vec<Component>, ItemError> {
    let cleaned = strip_control(input);
    let lines = unfold(&cleaned);
    let mut stack: Vec<Component> = Vec::new();
    let mut roots: Vec<Component> = Vec::new();

    for line in &lines {
        let prop = ContentLine::parse(line)?;
        match prop.name.as_str() {
            "BEGIN" => stack.push(Component::new(&prop.value.to_ascii_uppercase())),
            "END" => {
                let comp = stack
                    .pop()
                    .ok_or_else(|| ItemError::Invalid("END without BEGIN".to_string()))?;
                if comp.name != prop.value.to_ascii_uppercase() {
                    return Err(ItemError::Invalid(format!(
                        "END:{} does not close BEGIN:{}",
                        prop.value, comp.name
                    )));
                }
                match stack.last_mut() {
                    Some(parent) => parent.components.push(comp),
                    None => roots.push(comp),
                }
            }
            _ => match stack.last_mut() {
                Some(comp) => comp.properties.push(prop),
                None => {
                    return Err(ItemError::Invalid(format!(
                        "property {} outside of any component",
                        prop.name
                    )))
                }
            },
        }
    }
    if !stack.is_empty() {
        return Err(ItemError::Invalid("unterminated component".to_string()));
    }
    if roots.is_empty() {
        return Err(ItemError::Invalid("empty document".to_string()));
    }
    Ok(roots)
}

/// Deterministic UID for a component that was uploaded without one.
pub fn synthesize_uid(component: &Component) -> String {
    let mut hasher = Sha256::new();
    hasher.update(component.serialize().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// One stored item.
#[derive(Debug, Clone)]
pub struct Item {
    root: Component,
    kind: ComponentKind,
    uid: String,
    text: String,
    etag: String,
    pub last_modified: Option<SystemTime>,
}

impl Item {
    /// Parse a single logical item: a VCALENDAR with one set of
    /// same-UID components, or one VCARD.
    pub fn parse(raw: &str) -> Result<Item, ItemError> {
        let mut comps = parse_components(raw)?;
        if comps.len() != 1 {
            return Err(ItemError::Invalid(
                "expected a single calendar or card".to_string(),
            ));
        }
        Item::from_component(comps.remove(0))
    }

    /// Build a canonical item from a parsed component tree.
    pub fn from_component(mut root: Component) -> Result<Item, ItemError> {
        let (kind, uid) = match root.name.as_str() {
            "VCARD" => {
                if root.property("VERSION").is_none() {
                    root.properties
                        .insert(0, ContentLine::new("VERSION", "3.0"));
                }
                if root.property("FN").is_none() {
                    return Err(ItemError::Invalid("card without FN".to_string()));
                }
                let uid = match root.property("UID") {
                    Some(p) => p.value.clone(),
                    None => {
                        let uid = synthesize_uid(&root);
                        root.properties.push(ContentLine::new("UID", uid.clone()));
                        uid
                    }
                };
                (ComponentKind::Card, uid)
            }
            "VCALENDAR" => {
                let mains: Vec<usize> = root
                    .components
                    .iter()
                    .enumerate()
                    .filter(|(_, c)| c.name != "VTIMEZONE")
                    .map(|(i, _)| i)
                    .collect();
                if mains.is_empty() {
                    return Err(ItemError::Invalid("calendar without components".to_string()));
                }
                let kind = ComponentKind::from_name(&root.components[mains[0]].name)?;
                for &i in &mains {
                    if root.components[i].name != kind.name() {
                        return Err(ItemError::Invalid(
                            "mixed component kinds in one item".to_string(),
                        ));
                    }
                }
                let mut uid: Option<String> = None;
                for &i in &mains {
                    match root.components[i].property("UID") {
                        Some(p) => match &uid {
                            Some(u) if *u != p.value => {
                                return Err(ItemError::Invalid(
                                    "conflicting UID values in one item".to_string(),
                                ))
                            }
                            _ => uid = Some(p.value.clone()),
                        },
                        None if mains.len() == 1 => {
                            let u = synthesize_uid(&root.components[i]);
                            root.components[i]
                                .properties
                                .push(ContentLine::new("UID", u.clone()));
                            uid = Some(u);
                        }
                        None => return Err(ItemError::MissingUid),
                    }
                }
                (kind, uid.ok_or(ItemError::MissingUid)?)
            }
            other => return Err(ItemError::UnsupportedComponent(other.to_string())),
        };

        let text = canonical_text(&root, kind);
        let etag = payload_etag(&text);
        Ok(Item {
            root,
            kind,
            uid,
            text,
            etag,
            last_modified: None,
        })
    }

    pub fn kind(&self) -> ComponentKind {
        self.kind
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn etag(&self) -> &str {
        &self.etag
    }

    /// Canonical serialized payload.
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn root(&self) -> &Component {
        &self.root
    }

    pub fn content_type(&self) -> &'static str {
        if self.kind.is_calendar() {
            "text/calendar; charset=utf-8"
        } else {
            "text/vcard; charset=utf-8"
        }
    }

    /// The event/todo/journal components (main plus overrides), or the
    /// card itself.
    pub fn main_components(&self) -> Vec<&Component> {
        if self.kind == ComponentKind::Card {
            vec![&self.root]
        } else {
            self.root
                .components
                .iter()
                .filter(|c| c.name != "VTIMEZONE")
                .collect()
        }
    }

    pub fn timezones(&self) -> Vec<&Component> {
        self.root
            .components
            .iter()
            .filter(|c| c.name == "VTIMEZONE")
            .collect()
    }
}

fn payload_etag(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("\"{:x}\"", hasher.finalize())
}

fn canonical_text(root: &Component, kind: ComponentKind) -> String {
    let mut out = String::new();
    match kind {
        ComponentKind::Card => {
            out.push_str("BEGIN:VCARD\r\n");
            let version = root
                .property("VERSION")
                .map(|p| p.value.clone())
                .unwrap_or_else(|| "3.0".to_string());
            ContentLine::new("VERSION", version).serialize_into(&mut out);
            for prop in &root.properties {
                if prop.name != "VERSION" {
                    prop.serialize_into(&mut out);
                }
            }
            for comp in &root.components {
                comp.serialize_into(&mut out);
            }
            out.push_str("END:VCARD\r\n");
        }
        _ => {
            out.push_str("BEGIN:VCALENDAR\r\n");
            out.push_str("VERSION:2.0\r\n");
            ContentLine::new("PRODID", PRODID).serialize_into(&mut out);
            for prop in &root.properties {
                if prop.name != "VERSION" && prop.name != "PRODID" {
                    prop.serialize_into(&mut out);
                }
            }
            for comp in &root.components {
                comp.serialize_into(&mut out);
            }
            out.push_str("END:VCALENDAR\r\n");
        }
    }
    out
}

/// Split a whole-collection upload into items. Calendar components are
/// grouped by UID (overridden recurrences join their master); every
/// VTIMEZONE is carried into each produced item. Cards map one to one.
pub fn split_collection_upload(raw: &str) -> Result<Vec<Item>, ItemError> {
    let roots = parse_components(raw)?;
    if roots.iter().all(|c| c.name == "VCARD") {
        return roots.into_iter().map(Item::from_component).collect();
    }
    if !roots.iter().all(|c| c.name == "VCALENDAR") {
        return Err(ItemError::Invalid(
            "upload mixes calendars and cards".to_string(),
        ));
    }

    let mut timezones: Vec<Component> = Vec::new();
    let mut groups: Vec<(String, Vec<Component>)> = Vec::new();
    for root in roots {
        for mut comp in root.components {
            if comp.name == "VTIMEZONE" {
                timezones.push(comp);
                continue;
            }
            let uid = match comp.property("UID") {
                Some(p) => p.value.clone(),
                None => {
                    let uid = synthesize_uid(&comp);
                    comp.properties.push(ContentLine::new("UID", uid.clone()));
                    uid
                }
            };
            match groups.iter_mut().find(|(u, _)| *u == uid) {
                Some((_, comps)) => comps.push(comp),
                None => groups.push((uid, vec![comp])),
            }
        }
    }

    let mut items = Vec::new();
    for (uid, comps) in groups {
        let masters = comps
            .iter()
            .filter(|c| c.property("RECURRENCE-ID").is_none())
            .count();
        if masters > 1 {
            return Err(ItemError::DuplicateUid(uid));
        }
        let mut root = Component::new("VCALENDAR");
        for tz in &timezones {
            root.components.push(tz.clone());
        }
        root.components.extend(comps);
        items.push(Item::from_component(root)?);
    }
    Ok(items)
}

/// Parse an iCalendar DATE or DATE-TIME value. Dates become midnight.
/// Floating times and unknown TZIDs are interpreted as UTC.
pub fn parse_datetime(value: &str, tzid: Option<&str>) -> Option<DateTime<Utc>> {
    let value = value.trim();
    let naive = if value.len() == 8 {
        let date = NaiveDate::parse_from_str(value, "%Y%m%d").ok()?;
        date.and_time(NaiveTime::MIN)
    } else {
        let value = value.strip_suffix('Z').unwrap_or(value);
        NaiveDateTime::parse_from_str(value, "%Y%m%dT%H%M%S").ok()?
    };
    if value.ends_with('Z') {
        return Some(Utc.from_utc_datetime(&naive));
    }
    match tzid {
        Some(name) => match resolve_tzid(name) {
            Some(tz) => tz
                .from_local_datetime(&naive)
                .earliest()
                .map(|dt| dt.with_timezone(&Utc)),
            None => Some(Utc.from_utc_datetime(&naive)),
        },
        None => Some(Utc.from_utc_datetime(&naive)),
    }
}

fn resolve_tzid(tzid: &str) -> Option<chrono_tz::Tz> {
    chrono_tz::Tz::from_str(tzid)
        .or_else(|_| chrono_tz::Tz::from_str(tzid.trim_start_matches('/')))
        .ok()
}

/// Parse the value of a date property, honoring VALUE=DATE and TZID.
/// Returns the instant and whether it was a whole-day date.
pub fn property_datetime(prop: &ContentLine) -> Option<(DateTime<Utc>, bool)> {
    let is_date = prop.param("VALUE").map(|v| v.eq_ignore_ascii_case("DATE")).unwrap_or(false)
        || prop.value.len() == 8;
    let dt = parse_datetime(&prop.value, prop.param("TZID"))?;
    Some((dt, is_date))
}

/// RFC 5545 duration, e.g. `P1DT2H` or `-PT15M`.
pub fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    let (negative, rest) = match value.strip_prefix('-') {
        Some(r) => (true, r),
        None => (false, value.strip_prefix('+').unwrap_or(value)),
    };
    let rest = rest.strip_prefix('P')?;
    let mut total = Duration::zero();
    let mut number = String::new();
    let mut in_time = false;
    for c in rest.chars() {
        match c {
            'T' => in_time = true,
            '0'..='9' => number.push(c),
            'W' | 'D' | 'H' | 'M' | 'S' => {
                let n: i64 = number.parse().ok()?;
                number.clear();
                total = total
                    + match (c, in_time) {
                        ('W', _) => Duration::weeks(n),
                        ('D', _) => Duration::days(n),
                        ('H', true) => Duration::hours(n),
                        ('M', true) => Duration::minutes(n),
                        ('S', true) => Duration::seconds(n),
                        _ => return None,
                    };
            }
            _ => return None,
        }
    }
    Some(if negative { -total } else { total })
}

/// `YYYYMMDDTHHMMSSZ`.
pub fn format_utc(dt: DateTime<Utc>) -> String {
    dt.format("%Y%m%dT%H%M%SZ").to_string()
}

/// Undo RFC 5545/6350 text escaping for matching purposes.
pub fn unescape_text(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') | Some('N') => out.push('\n'),
                Some(other) => out.push(other),
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// The time span covered by a component, per the CalDAV time-range
/// rules, simplified: DTEND, then DURATION, then DUE for todos; whole
/// days for DATE values.
pub fn component_times(comp: &Component) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let dtstart = comp.property("DTSTART").and_then(property_datetime);
    match comp.name.as_str() {
        "VTODO" => {
            let due = comp.property("DUE").and_then(property_datetime);
            match (dtstart, due) {
                (Some((start, is_date)), due) => {
                    let end = due
                        .map(|(d, _)| d)
                        .or_else(|| {
                            comp.property("DURATION")
                                .and_then(|p| parse_duration(&p.value))
                                .map(|d| start + d)
                        })
                        .unwrap_or_else(|| default_end(start, is_date));
                    Some((start, end))
                }
                (None, Some((due, _))) => Some((due, due)),
                (None, None) => None,
            }
        }
        _ => {
            let (start, is_date) = dtstart?;
            let end = comp
                .property("DTEND")
                .and_then(property_datetime)
                .map(|(d, _)| d)
                .or_else(|| {
                    comp.property("DURATION")
                        .and_then(|p| parse_duration(&p.value))
                        .map(|d| start + d)
                })
                .unwrap_or_else(|| default_end(start, is_date));
            Some((start, end))
        }
    }
}

fn default_end(start: DateTime<Utc>, is_date: bool) -> DateTime<Utc> {
    if is_date {
        start + Duration::days(1)
    } else {
        start
    }
}

/// The RECURRENCE-ID of an override, in UTC.
pub fn recurrence_id(comp: &Component) -> Option<DateTime<Utc>> {
    comp.property("RECURRENCE-ID")
        .and_then(property_datetime)
        .map(|(dt, _)| dt)
}

#[cfg(test)]
mod tests {
    use super::*;

    const EVENT: &str = "BEGIN:VCALENDAR\r\nVERSION:2.0\r\nPRODID:-//Test//Test//EN\r\n\
        BEGIN:VEVENT\r\nUID:e1@example.com\r\nDTSTART:20240101T100000Z\r\n\
        DTEND:20240101T110000Z\r\nSUMMARY:New year planning\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n";

    #[test]
    fn test_parse_event() {
        let item = Item::parse(EVENT).unwrap();
        assert_eq!(item.kind(), ComponentKind::Event);
        assert_eq!(item.uid(), "e1@example.com");
        assert!(item.text().contains("PRODID:-//Carillon"));
        assert!(!item.text().contains("-//Test//Test//EN"));
        assert!(item.etag().starts_with('"'));
    }

    #[test]
    fn test_canonical_roundtrip() {
        let item = Item::parse(EVENT).unwrap();
        let again = Item::parse(item.text()).unwrap();
        assert_eq!(item.text(), again.text());
        assert_eq!(item.etag(), again.etag());
    }

    #[test]
    fn test_control_chars_stripped() {
        let dirty = EVENT.replace("SUMMARY:New", "SUMMARY:\u{0007}New");
        let item = Item::parse(&dirty).unwrap();
        assert!(item.text().contains("SUMMARY:New year planning"));
    }

    #[test]
    fn test_vcard_without_uid_is_stable() {
        let card = "BEGIN:VCARD\r\nVERSION:3.0\r\nFN:Ada Lovelace\r\nEND:VCARD\r\n";
        let a = Item::parse(card).unwrap();
        let b = Item::parse(card).unwrap();
        assert_eq!(a.uid(), b.uid());
        assert!(!a.uid().is_empty());
        assert!(a.text().contains(&format!("UID:{}", a.uid())));
    }

    #[test]
    fn test_vcard_version_added() {
        let card = "BEGIN:VCARD\r\nFN:Ada\r\nUID:c1\r\nEND:VCARD\r\n";
        let item = Item::parse(card).unwrap();
        assert!(item.text().starts_with("BEGIN:VCARD\r\nVERSION:3.0\r\n"));
    }

    #[test]
    fn test_folding() {
        let mut comp = Component::new("VCARD");
        comp.properties.push(ContentLine::new("VERSION", "3.0"));
        comp.properties.push(ContentLine::new("UID", "c1"));
        comp.properties.push(ContentLine::new("FN", "Long Note"));
        comp.properties
            .push(ContentLine::new("NOTE", "x".repeat(200)));
        let item = Item::from_component(comp).unwrap();
        for line in item.text().split("\r\n") {
            assert!(line.len() <= 75, "line too long: {}", line.len());
        }
        let again = Item::parse(item.text()).unwrap();
        assert_eq!(again.root().property("NOTE").unwrap().value, "x".repeat(200));
    }

    #[test]
    fn test_param_quoting() {
        let line = ContentLine::parse(
            r#"ATTENDEE;CN="Lovelace, Ada";ROLE=REQ-PARTICIPANT:mailto:ada@example.com"#,
        )
        .unwrap();
        assert_eq!(line.param("CN"), Some("Lovelace, Ada"));
        assert_eq!(line.param("ROLE"), Some("REQ-PARTICIPANT"));
        assert_eq!(line.value, "mailto:ada@example.com");
        let mut out = String::new();
        line.serialize_into(&mut out);
        assert!(out.contains(r#"CN="Lovelace, Ada""#));
    }

    #[test]
    fn test_missing_uid_multiple_components() {
        let cal = "BEGIN:VCALENDAR\r\nBEGIN:VEVENT\r\nDTSTART:20240101T100000Z\r\nEND:VEVENT\r\n\
            BEGIN:VEVENT\r\nDTSTART:20240102T100000Z\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n";
        assert!(matches!(Item::parse(cal), Err(ItemError::MissingUid)));
    }

    #[test]
    fn test_split_collection() {
        let cal = "BEGIN:VCALENDAR\r\nVERSION:2.0\r\n\
            BEGIN:VEVENT\r\nUID:a\r\nDTSTART:20240101T100000Z\r\nEND:VEVENT\r\n\
            BEGIN:VEVENT\r\nUID:b\r\nDTSTART:20240102T100000Z\r\nEND:VEVENT\r\n\
            BEGIN:VEVENT\r\nUID:a\r\nRECURRENCE-ID:20240108T100000Z\r\n\
            DTSTART:20240108T120000Z\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n";
        let items = split_collection_upload(cal).unwrap();
        assert_eq!(items.len(), 2);
        let a = items.iter().find(|i| i.uid() == "a").unwrap();
        assert_eq!(a.main_components().len(), 2);
    }

    #[test]
    fn test_split_collection_duplicate_uid() {
        let cal = "BEGIN:VCALENDAR\r\n\
            BEGIN:VEVENT\r\nUID:a\r\nDTSTART:20240101T100000Z\r\nEND:VEVENT\r\n\
            BEGIN:VEVENT\r\nUID:a\r\nDTSTART:20240102T100000Z\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n";
        assert!(matches!(
            split_collection_upload(cal),
            Err(ItemError::DuplicateUid(_))
        ));
    }

    #[test]
    fn test_datetime_parsing() {
        let dt = parse_datetime("20240101T100000Z", None).unwrap();
        assert_eq!(format_utc(dt), "20240101T100000Z");
        let berlin = parse_datetime("20240601T120000", Some("Europe/Berlin")).unwrap();
        assert_eq!(format_utc(berlin), "20240601T100000Z");
        let date = parse_datetime("20240101", None).unwrap();
        assert_eq!(format_utc(date), "20240101T000000Z");
    }

    #[test]
    fn test_duration() {
        assert_eq!(parse_duration("P1DT2H"), Some(Duration::hours(26)));
        assert_eq!(parse_duration("-PT15M"), Some(Duration::minutes(-15)));
        assert_eq!(parse_duration("P2W"), Some(Duration::weeks(2)));
        assert_eq!(parse_duration("gibberish"), None);
    }

    #[test]
    fn test_component_times_date_value() {
        let cal = "BEGIN:VCALENDAR\r\nBEGIN:VEVENT\r\nUID:d\r\n\
            DTSTART;VALUE=DATE:20240101\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n";
        let item = Item::parse(cal).unwrap();
        let (start, end) = component_times(item.main_components()[0]).unwrap();
        assert_eq!(format_utc(start), "20240101T000000Z");
        assert_eq!(format_utc(end), "20240102T000000Z");
    }
}
