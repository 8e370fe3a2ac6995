//! REPORT filter trees and their evaluation.
//!
//! Filters are evaluated strictly bottom-up against parsed items.
//! Time-range tests against recurring components expand the RRULE
//! (with RDATE/EXDATE and RECURRENCE-ID overrides replacing their
//! instances) inside the requested window.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use http::StatusCode;
use rrule::{RRule, Unvalidated};
use xmltree::Element;

use crate::errors::DavError;
use crate::ical::{
    component_times, format_utc, parse_datetime, property_datetime, recurrence_id, unescape_text,
    Component, ContentLine, Item, PRODID,
};
use crate::xmlutil::{ElementExt, NS_CALDAV, NS_CARDDAV};
use crate::DavResult;

/// Hard caps on recurrence expansion, from `[reporting]`.
#[derive(Debug, Clone, Copy)]
pub struct ReportLimits {
    pub max_occurrences: usize,
    pub max_freebusy_occurrences: usize,
}

impl Default for ReportLimits {
    fn default() -> Self {
        ReportLimits {
            max_occurrences: 10000,
            max_freebusy_occurrences: 10000,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeRange {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl TimeRange {
    fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        // half-open [start, end); zero-length spans count as a point.
        if let Some(wend) = self.end {
            if start >= wend {
                return false;
            }
        }
        if let Some(wstart) = self.start {
            if end <= wstart && !(start == end && start >= wstart) {
                return false;
            }
        }
        true
    }

    pub fn is_unbounded(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchType {
    Equals,
    Contains,
    StartsWith,
    EndsWith,
}

#[derive(Debug, Clone)]
pub struct TextMatch {
    pub value: String,
    pub collation: String,
    pub negate: bool,
    pub match_type: MatchType,
}

#[derive(Debug, Clone)]
pub struct ParamFilter {
    pub name: String,
    pub is_not_defined: bool,
    pub text_match: Option<TextMatch>,
}

#[derive(Debug, Clone)]
pub struct PropFilter {
    pub name: String,
    pub is_not_defined: bool,
    pub time_range: Option<TimeRange>,
    pub text_match: Option<TextMatch>,
    pub param_filters: Vec<ParamFilter>,
}

#[derive(Debug, Clone)]
pub struct CompFilter {
    pub name: String,
    pub is_not_defined: bool,
    pub time_range: Option<TimeRange>,
    pub prop_filters: Vec<PropFilter>,
    pub comp_filters: Vec<CompFilter>,
}

/// The CardDAV filter grammar differs: a flat list of prop-filters
/// combined with anyof/allof.
#[derive(Debug, Clone)]
pub struct CardFilter {
    pub all_of: bool,
    pub prop_filters: Vec<PropFilter>,
}

// ---- parsing from request XML ----

fn parse_time_range(elem: &Element) -> DavResult<TimeRange> {
    let start = match elem.attributes.get("start") {
        Some(v) => Some(parse_datetime(v, None).ok_or(DavError::XmlParseError)?),
        None => None,
    };
    let end = match elem.attributes.get("end") {
        Some(v) => Some(parse_datetime(v, None).ok_or(DavError::XmlParseError)?),
        None => None,
    };
    Ok(TimeRange { start, end })
}

fn parse_text_match(elem: &Element) -> TextMatch {
    let match_type = match elem.attributes.get("match-type").map(|s| s.as_str()) {
        Some("equals") => MatchType::Equals,
        Some("starts-with") => MatchType::StartsWith,
        Some("ends-with") => MatchType::EndsWith,
        _ => MatchType::Contains,
    };
    TextMatch {
        value: elem.text_content(),
        collation: elem
            .attributes
            .get("collation")
            .cloned()
            .unwrap_or_else(|| "i;ascii-casemap".to_string()),
        negate: elem
            .attributes
            .get("negate-condition")
            .map(|v| v == "yes")
            .unwrap_or(false),
        match_type,
    }
}

fn parse_param_filter(elem: &Element) -> DavResult<ParamFilter> {
    let name = elem
        .attributes
        .get("name")
        .cloned()
        .ok_or(DavError::XmlParseError)?;
    let mut filter = ParamFilter {
        name,
        is_not_defined: false,
        text_match: None,
    };
    for child in elem.child_elems() {
        match child.name.as_str() {
            "is-not-defined" => filter.is_not_defined = true,
            "text-match" => filter.text_match = Some(parse_text_match(child)),
            _ => {}
        }
    }
    Ok(filter)
}

fn parse_prop_filter(elem: &Element) -> DavResult<PropFilter> {
    let name = elem
        .attributes
        .get("name")
        .cloned()
        .ok_or(DavError::XmlParseError)?;
    let mut filter = PropFilter {
        name: name.to_ascii_uppercase(),
        is_not_defined: false,
        time_range: None,
        text_match: None,
        param_filters: Vec::new(),
    };
    for child in elem.child_elems() {
        match child.name.as_str() {
            "is-not-defined" => filter.is_not_defined = true,
            "time-range" => filter.time_range = Some(parse_time_range(child)?),
            "text-match" => filter.text_match = Some(parse_text_match(child)),
            "param-filter" => filter.param_filters.push(parse_param_filter(child)?),
            _ => {}
        }
    }
    Ok(filter)
}

pub fn parse_comp_filter(elem: &Element) -> DavResult<CompFilter> {
    let name = elem
        .attributes
        .get("name")
        .cloned()
        .ok_or(DavError::XmlParseError)?;
    let mut filter = CompFilter {
        name: name.to_ascii_uppercase(),
        is_not_defined: false,
        time_range: None,
        prop_filters: Vec::new(),
        comp_filters: Vec::new(),
    };
    for child in elem.child_elems() {
        match child.name.as_str() {
            "is-not-defined" => filter.is_not_defined = true,
            "time-range" => filter.time_range = Some(parse_time_range(child)?),
            "prop-filter" => filter.prop_filters.push(parse_prop_filter(child)?),
            "comp-filter" => filter.comp_filters.push(parse_comp_filter(child)?),
            _ => {}
        }
    }
    Ok(filter)
}

/// Parse a `C:filter` element of a calendar-query.
pub fn parse_calendar_filter(filter_elem: &Element) -> DavResult<Option<CompFilter>> {
    for child in filter_elem.child_elems() {
        if child.is(NS_CALDAV, "comp-filter") {
            return Ok(Some(parse_comp_filter(child)?));
        }
    }
    Ok(None)
}

/// Parse a `CR:filter` element of an addressbook-query.
pub fn parse_card_filter(filter_elem: &Element) -> DavResult<CardFilter> {
    let all_of = filter_elem
        .attributes
        .get("test")
        .map(|t| t == "allof")
        .unwrap_or(false);
    let mut prop_filters = Vec::new();
    for child in filter_elem.child_elems() {
        if child.is(NS_CARDDAV, "prop-filter") {
            prop_filters.push(parse_prop_filter(child)?);
        }
    }
    Ok(CardFilter { all_of, prop_filters })
}

// ---- evaluation ----

fn collate(a: &str, b: &str, collation: &str) -> (String, String) {
    match collation {
        "i;octet" => (a.to_string(), b.to_string()),
        "i;unicode-casemap" => (a.to_lowercase(), b.to_lowercase()),
        // i;ascii-casemap and anything unknown.
        _ => (a.to_ascii_lowercase(), b.to_ascii_lowercase()),
    }
}

impl TextMatch {
    fn matches(&self, raw_value: &str) -> bool {
        let value = unescape_text(raw_value);
        let (haystack, needle) = collate(&value, &self.value, &self.collation);
        let hit = match self.match_type {
            MatchType::Equals => haystack == needle,
            MatchType::Contains => haystack.contains(&needle),
            MatchType::StartsWith => haystack.starts_with(&needle),
            MatchType::EndsWith => haystack.ends_with(&needle),
        };
        hit != self.negate
    }
}

fn param_filter_matches(filter: &ParamFilter, prop: &ContentLine) -> bool {
    let values = prop.param_values(&filter.name);
    if filter.is_not_defined {
        return values.is_empty();
    }
    if values.is_empty() {
        return false;
    }
    match &filter.text_match {
        Some(tm) => values.iter().any(|v| tm.matches(v)),
        None => true,
    }
}

fn prop_filter_matches(filter: &PropFilter, comp: &Component) -> bool {
    let props: Vec<&ContentLine> = comp.properties_named(&filter.name).collect();
    if filter.is_not_defined {
        return props.is_empty();
    }
    if props.is_empty() {
        return false;
    }
    props.iter().any(|prop| {
        if let Some(range) = &filter.time_range {
            match property_datetime(prop) {
                Some((dt, _)) => {
                    if !range.overlaps(dt, dt) {
                        return false;
                    }
                }
                None => return false,
            }
        }
        if let Some(tm) = &filter.text_match {
            if !tm.matches(&prop.value) {
                return false;
            }
        }
        filter.param_filters.iter().all(|pf| param_filter_matches(pf, prop))
    })
}

/// Evaluate a calendar-query filter against an item. The root filter
/// names VCALENDAR; nested filters descend into the component tree.
pub fn match_calendar_filter(
    item: &Item,
    filter: &CompFilter,
    limits: &ReportLimits,
) -> DavResult<bool> {
    if filter.is_not_defined {
        return Ok(item.root().name != filter.name);
    }
    if item.root().name != filter.name {
        return Ok(false);
    }
    for pf in &filter.prop_filters {
        if !prop_filter_matches(pf, item.root()) {
            return Ok(false);
        }
    }
    for cf in &filter.comp_filters {
        if !match_component_level(item, cf, limits)? {
            return Ok(false);
        }
    }
    Ok(true)
}

// filters one level below VCALENDAR, where time-range needs the whole
// item (master plus overrides) for recurrence handling.
fn match_component_level(item: &Item, filter: &CompFilter, limits: &ReportLimits) -> DavResult<bool> {
    let comps: Vec<&Component> = item
        .root()
        .components
        .iter()
        .filter(|c| c.name == filter.name)
        .collect();
    if filter.is_not_defined {
        return Ok(comps.is_empty());
    }
    if comps.is_empty() {
        return Ok(false);
    }
    if let Some(range) = &filter.time_range {
        if item.main_components().first().map(|c| c.name.as_str()) == Some(filter.name.as_str()) {
            if occurrences(item, range, limits.max_occurrences)?.is_empty() {
                return Ok(false);
            }
        } else {
            // non-item components (e.g. VTIMEZONE never; VALARM has no
            // span of its own): fall back to the component's own times.
            let hit = comps.iter().any(|c| match component_times(c) {
                Some((s, e)) => range.overlaps(s, e),
                None => true,
            });
            if !hit {
                return Ok(false);
            }
        }
    }
    Ok(comps.iter().any(|comp| {
        filter.prop_filters.iter().all(|pf| prop_filter_matches(pf, comp))
            && filter.comp_filters.iter().all(|cf| match_nested(comp, cf))
    }))
}

// filters nested deeper than the item components (VALARM and friends).
fn match_nested(parent: &Component, filter: &CompFilter) -> bool {
    let comps: Vec<&Component> = parent
        .components
        .iter()
        .filter(|c| c.name == filter.name)
        .collect();
    if filter.is_not_defined {
        return comps.is_empty();
    }
    if comps.is_empty() {
        return false;
    }
    comps.iter().any(|comp| {
        if let Some(range) = &filter.time_range {
            if let Some((s, e)) = component_times(comp) {
                if !range.overlaps(s, e) {
                    return false;
                }
            }
        }
        filter.prop_filters.iter().all(|pf| prop_filter_matches(pf, comp))
            && filter.comp_filters.iter().all(|cf| match_nested(comp, cf))
    })
}

/// Evaluate an addressbook-query filter.
pub fn match_card_filter(item: &Item, filter: &CardFilter) -> bool {
    if filter.prop_filters.is_empty() {
        return true;
    }
    let card = item.root();
    if filter.all_of {
        filter.prop_filters.iter().all(|pf| prop_filter_matches(pf, card))
    } else {
        filter.prop_filters.iter().any(|pf| prop_filter_matches(pf, card))
    }
}

// ---- recurrence expansion ----

/// One concrete instance of a calendar item.
#[derive(Debug, Clone)]
pub struct Occurrence<'a> {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub recurrence_id: Option<DateTime<Utc>>,
    pub component: &'a Component,
}

fn over_limit() -> DavError {
    DavError::Condition(StatusCode::FORBIDDEN, "C:max-resource-size")
}

/// Enumerate the instances of an item that overlap `window`, expanding
/// RRULE/RDATE with EXDATE applied and RECURRENCE-ID overrides
/// replacing the instance they override.
pub fn occurrences<'a>(
    item: &'a Item,
    window: &TimeRange,
    max_occurrences: usize,
) -> DavResult<Vec<Occurrence<'a>>> {
    let mains = item.main_components();
    let master: Option<&Component> = mains.iter().copied().find(|c| recurrence_id(c).is_none());
    let mut overrides: HashMap<i64, &Component> = HashMap::new();
    for comp in mains.iter().copied() {
        if let Some(rid) = recurrence_id(comp) {
            overrides.insert(rid.timestamp(), comp);
        }
    }

    let mut out: Vec<Occurrence<'a>> = Vec::new();
    let mut replaced: Vec<i64> = Vec::new();

    if let Some(master) = master {
        let times = component_times(master);
        let has_rrule = master.property("RRULE").is_some();
        match (times, has_rrule) {
            (Some((start, end)), true) => {
                let duration = end - start;
                let dates = expand_rrule(master, start, window, duration, max_occurrences)?;
                for date in dates {
                    match overrides.get(&date.timestamp()).copied() {
                        Some(comp) => {
                            replaced.push(date.timestamp());
                            if let Some((s, e)) = component_times(comp) {
                                out.push(Occurrence {
                                    start: s,
                                    end: e,
                                    recurrence_id: Some(date),
                                    component: comp,
                                });
                            }
                        }
                        None => out.push(Occurrence {
                            start: date,
                            end: date + duration,
                            recurrence_id: Some(date),
                            component: master,
                        }),
                    }
                    if out.len() > max_occurrences {
                        return Err(over_limit());
                    }
                }
            }
            (Some((start, end)), false) => out.push(Occurrence {
                start,
                end,
                recurrence_id: None,
                component: master,
            }),
            (None, _) => out.push(Occurrence {
                // a component without times (e.g. a bare VTODO)
                // matches every window.
                start: window.start.unwrap_or(DateTime::<Utc>::MIN_UTC),
                end: window.end.unwrap_or(DateTime::<Utc>::MAX_UTC),
                recurrence_id: None,
                component: master,
            }),
        }
    }

    // overrides that moved outside the expanded set keep their own times.
    for (rid, comp) in overrides.iter() {
        if replaced.contains(rid) {
            continue;
        }
        if let Some((s, e)) = component_times(comp) {
            out.push(Occurrence {
                start: s,
                end: e,
                recurrence_id: DateTime::from_timestamp(*rid, 0),
                component: *comp,
            });
        }
    }

    out.retain(|o| window.overlaps(o.start, o.end));
    out.sort_by_key(|o| o.start);
    if out.len() > max_occurrences {
        return Err(over_limit());
    }
    Ok(out)
}

fn expand_rrule(
    master: &Component,
    dtstart: DateTime<Utc>,
    window: &TimeRange,
    duration: Duration,
    max_occurrences: usize,
) -> DavResult<Vec<DateTime<Utc>>> {
    let rrule_prop = match master.property("RRULE") {
        Some(p) => p,
        None => return Ok(Vec::new()),
    };
    let rrule = rrule_prop
        .value
        .parse::<RRule<Unvalidated>>()
        .map_err(|e| DavError::Item(crate::ical::ItemError::Invalid(format!("bad RRULE: {e}"))))?;
    let dt_start = dtstart.with_timezone(&rrule::Tz::UTC);
    let mut set = rrule
        .build(dt_start)
        .map_err(|e| DavError::Item(crate::ical::ItemError::Invalid(format!("bad RRULE: {e}"))))?;

    let rdates: Vec<chrono::DateTime<rrule::Tz>> = master
        .properties_named("RDATE")
        .flat_map(|p| {
            let tzid = p.param("TZID").map(|s| s.to_string());
            p.value
                .split(',')
                .filter_map(|v| parse_datetime(v, tzid.as_deref()))
                .collect::<Vec<_>>()
        })
        .map(|dt| dt.with_timezone(&rrule::Tz::UTC))
        .collect();
    if !rdates.is_empty() {
        set = set.set_rdates(rdates);
    }
    let exdates: Vec<chrono::DateTime<rrule::Tz>> = master
        .properties_named("EXDATE")
        .flat_map(|p| {
            let tzid = p.param("TZID").map(|s| s.to_string());
            p.value
                .split(',')
                .filter_map(|v| parse_datetime(v, tzid.as_deref()))
                .collect::<Vec<_>>()
        })
        .map(|dt| dt.with_timezone(&rrule::Tz::UTC))
        .collect();
    if !exdates.is_empty() {
        set = set.set_exdates(exdates);
    }

    if let Some(wstart) = window.start {
        // include instances that started earlier but still overlap.
        let lead = (wstart - duration) - Duration::seconds(1);
        set = set.after(lead.with_timezone(&rrule::Tz::UTC));
    }
    if let Some(wend) = window.end {
        set = set.before(wend.with_timezone(&rrule::Tz::UTC));
    }

    let limit = max_occurrences.saturating_add(1).min(u16::MAX as usize) as u16;
    let result = set.all(limit);
    if result.limited || result.dates.len() > max_occurrences {
        return Err(over_limit());
    }
    Ok(result
        .dates
        .into_iter()
        .map(|d| d.with_timezone(&Utc))
        .collect())
}

// ---- expand / free-busy ----

/// Materialize the instances of a VEVENT item within `window` as a new
/// calendar stream, honoring overridden occurrences. Returns `None`
/// for non-event items.
pub fn expand_item(item: &Item, window: &TimeRange, limits: &ReportLimits) -> DavResult<Option<String>> {
    if item.kind() != crate::ical::ComponentKind::Event {
        return Ok(None);
    }
    let occs = occurrences(item, window, limits.max_occurrences)?;
    let mut out = String::new();
    out.push_str("BEGIN:VCALENDAR\r\nVERSION:2.0\r\n");
    ContentLine::new("PRODID", PRODID).serialize_into(&mut out);
    let recurring = item
        .main_components()
        .iter()
        .any(|c| c.property("RRULE").is_some() || recurrence_id(c).is_some());
    for occ in &occs {
        let mut comp = occ.component.clone();
        comp.remove_property("RRULE");
        comp.remove_property("RDATE");
        comp.remove_property("EXDATE");
        comp.remove_property("DTSTART");
        comp.remove_property("DTEND");
        comp.remove_property("DURATION");
        comp.remove_property("RECURRENCE-ID");
        let mut props = vec![
            ContentLine::new("DTSTART", format_utc(occ.start)),
            ContentLine::new("DTEND", format_utc(occ.end)),
        ];
        if recurring {
            if let Some(rid) = occ.recurrence_id {
                props.push(ContentLine::new("RECURRENCE-ID", format_utc(rid)));
            }
        }
        comp.properties.splice(0..0, props);
        comp.serialize_into(&mut out);
    }
    out.push_str("END:VCALENDAR\r\n");
    Ok(Some(out))
}

/// Aggregate the busy periods of a set of items into one VFREEBUSY.
pub fn free_busy(items: &[&Item], window: &TimeRange, limits: &ReportLimits) -> DavResult<String> {
    let mut periods: Vec<(DateTime<Utc>, DateTime<Utc>)> = Vec::new();
    for item in items {
        if item.kind() != crate::ical::ComponentKind::Event {
            continue;
        }
        let transparent = item.main_components().iter().all(|c| {
            c.property("TRANSP")
                .map(|p| p.value.eq_ignore_ascii_case("TRANSPARENT"))
                .unwrap_or(false)
        });
        let cancelled = item.main_components().iter().all(|c| {
            c.property("STATUS")
                .map(|p| p.value.eq_ignore_ascii_case("CANCELLED"))
                .unwrap_or(false)
        });
        if transparent || cancelled {
            continue;
        }
        for occ in occurrences(item, window, limits.max_freebusy_occurrences)? {
            periods.push((occ.start, occ.end));
            if periods.len() > limits.max_freebusy_occurrences {
                return Err(over_limit());
            }
        }
    }
    periods.sort();

    let mut out = String::new();
    out.push_str("BEGIN:VCALENDAR\r\nVERSION:2.0\r\n");
    ContentLine::new("PRODID", PRODID).serialize_into(&mut out);
    out.push_str("BEGIN:VFREEBUSY\r\n");
    if let Some(start) = window.start {
        ContentLine::new("DTSTART", format_utc(start)).serialize_into(&mut out);
    }
    if let Some(end) = window.end {
        ContentLine::new("DTEND", format_utc(end)).serialize_into(&mut out);
    }
    for (start, end) in periods {
        ContentLine::new("FREEBUSY", format!("{}/{}", format_utc(start), format_utc(end)))
            .serialize_into(&mut out);
    }
    out.push_str("END:VFREEBUSY\r\nEND:VCALENDAR\r\n");
    Ok(out)
}
