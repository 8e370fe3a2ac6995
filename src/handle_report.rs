//
// REPORT: calendar-query, calendar-multiget, addressbook-query,
// addressbook-multiget, free-busy-query, sync-collection and
// expand-property. Reports that the target does not advertise in its
// supported-report-set are answered with 403 `DAV:supported-report`.
//
use http::{Response, StatusCode};
use log::debug;
use xmltree::{Element, XMLNode};

use crate::body::Body;
use crate::davpath::DavPath;
use crate::errors::DavError;
use crate::filters::{
    expand_item, free_busy, match_calendar_filter, match_card_filter, parse_calendar_filter,
    parse_card_filter, TimeRange,
};
use crate::handle_props::{empty_prop, href_element};
use crate::handler::DavInner;
use crate::ical::{parse_datetime, Item};
use crate::multistatus::MultistatusWriter;
use crate::storage::{Collection, CollectionTag, FsError};
use crate::xmlutil::{parse_xml, ElementExt, NS_CALDAV, NS_CARDDAV, NS_DAV};
use crate::DavResult;

fn unsupported_report() -> DavError {
    DavError::Condition(StatusCode::FORBIDDEN, "D:supported-report")
}

fn bad_sync_token() -> DavError {
    DavError::Condition(StatusCode::FORBIDDEN, "D:valid-sync-token")
}

impl DavInner {
    pub(crate) fn handle_report(&self, path: &DavPath, body: &[u8]) -> DavResult<Response<Body>> {
        let root = parse_xml(body)?;
        let storage_path = path.storage_path();

        // the target is a collection, or a single item within one.
        let (col, only_item): (Collection, Option<String>) =
            match self.storage.collection(&storage_path)? {
                Some(col) => (col, None),
                None => {
                    let parent = path.parent().storage_path();
                    match self.storage.collection(&parent)? {
                        Some(col) if col.tag.is_some() => (col, Some(path.name().to_string())),
                        _ => return Err(self.not_found(&parent)),
                    }
                }
            };
        if !self.can_read(&col.path, col.tag.is_some()) {
            return Err(self.access_denied());
        }

        let ns = root.namespace.as_deref().unwrap_or("");
        debug!("report {}:{} on /{}", ns, root.name, col.path);
        match (ns, root.name.as_str()) {
            (NS_CALDAV, "calendar-query") if col.tag == Some(CollectionTag::Calendar) => {
                self.calendar_query(path, &col, only_item.as_deref(), &root)
            }
            (NS_CALDAV, "calendar-multiget") if col.tag == Some(CollectionTag::Calendar) => {
                self.multiget(path, &col, &root)
            }
            (NS_CALDAV, "free-busy-query") if col.tag == Some(CollectionTag::Calendar) => {
                self.free_busy_query(&col, only_item.as_deref(), &root)
            }
            (NS_CARDDAV, "addressbook-query") if col.tag == Some(CollectionTag::Addressbook) => {
                self.addressbook_query(path, &col, only_item.as_deref(), &root)
            }
            (NS_CARDDAV, "addressbook-multiget") if col.tag == Some(CollectionTag::Addressbook) => {
                self.multiget(path, &col, &root)
            }
            (NS_DAV, "sync-collection") if col.tag.is_some() && only_item.is_none() => {
                self.sync_collection(path, &col, &root)
            }
            (NS_DAV, "expand-property") => self.expand_property(path, &col, only_item.as_deref(), &root),
            _ => Err(unsupported_report()),
        }
    }

    // items in scope: the whole collection or a single addressed item.
    fn scope(&self, col: &Collection, only_item: Option<&str>) -> DavResult<Vec<(String, Item)>> {
        match only_item {
            Some(name) => match self.storage.get(col, name)? {
                Some(item) => Ok(vec![(name.to_string(), item)]),
                None => Err(DavError::Status(StatusCode::NOT_FOUND)),
            },
            None => Ok(self.storage.get_all(col)?),
        }
    }

    fn calendar_query(
        &self,
        path: &DavPath,
        col: &Collection,
        only_item: Option<&str>,
        root: &Element,
    ) -> DavResult<Response<Body>> {
        let filter = match root.find(NS_CALDAV, "filter") {
            Some(f) => parse_calendar_filter(f)?,
            None => None,
        };
        let props = requested_props(root);
        let expand = expand_window(&props);
        let limits = self.limits();

        let mut writer = MultistatusWriter::new()?;
        for (name, item) in self.scope(col, only_item)? {
            if let Some(filter) = &filter {
                if !match_calendar_filter(&item, filter, &limits)? {
                    continue;
                }
            }
            let href = item_href(path, col, &name);
            let props = self.report_item_props(col, &name, &item, &props, expand.as_ref())?;
            writer.response_props(&href, props)?;
        }
        writer.finish()
    }

    fn addressbook_query(
        &self,
        path: &DavPath,
        col: &Collection,
        only_item: Option<&str>,
        root: &Element,
    ) -> DavResult<Response<Body>> {
        let filter = match root.find(NS_CARDDAV, "filter") {
            Some(f) => Some(parse_card_filter(f)?),
            None => None,
        };
        let props = requested_props(root);

        let mut writer = MultistatusWriter::new()?;
        for (name, item) in self.scope(col, only_item)? {
            if let Some(filter) = &filter {
                if !match_card_filter(&item, filter) {
                    continue;
                }
            }
            let href = item_href(path, col, &name);
            let props = self.report_item_props(col, &name, &item, &props, None)?;
            writer.response_props(&href, props)?;
        }
        writer.finish()
    }

    fn multiget(
        &self,
        path: &DavPath,
        col: &Collection,
        root: &Element,
    ) -> DavResult<Response<Body>> {
        let props = requested_props(root);
        let expand = expand_window(&props);
        let mut writer = MultistatusWriter::new()?;

        for href_elem in root.child_elems() {
            if !href_elem.is(NS_DAV, "href") {
                continue;
            }
            let raw_href = href_elem.text_content();
            let target = match DavPath::from_str(raw_href.trim(), path.prefix()) {
                Ok(p) => p,
                Err(_) => {
                    writer.response_status(raw_href.trim(), StatusCode::NOT_FOUND)?;
                    continue;
                }
            };
            let name = target.name().to_string();
            let found = if target.parent().storage_path() == col.path {
                self.storage.get(col, &name)?
            } else {
                None
            };
            match found {
                Some(item) => {
                    let href = item_href(path, col, &name);
                    let props =
                        self.report_item_props(col, &name, &item, &props, expand.as_ref())?;
                    writer.response_props(&href, props)?;
                }
                None => {
                    writer.response_status(&target.as_url_string(), StatusCode::NOT_FOUND)?;
                }
            }
        }
        writer.finish()
    }

    fn free_busy_query(
        &self,
        col: &Collection,
        only_item: Option<&str>,
        root: &Element,
    ) -> DavResult<Response<Body>> {
        let window = match root.find(NS_CALDAV, "time-range") {
            Some(elem) => time_range_from_attrs(elem)?,
            None => return Err(DavError::XmlParseError),
        };
        let items = self.scope(col, only_item)?;
        let refs: Vec<&Item> = items.iter().map(|(_, i)| i).collect();
        let text = free_busy(&refs, &window, &self.limits())?;

        let mut resp = Response::new(Body::from(text));
        *resp.status_mut() = StatusCode::OK;
        resp.headers_mut()
            .insert("content-type", "text/calendar; charset=utf-8".parse().unwrap());
        Ok(resp)
    }

    fn sync_collection(
        &self,
        path: &DavPath,
        col: &Collection,
        root: &Element,
    ) -> DavResult<Response<Body>> {
        let token = root
            .find(NS_DAV, "sync-token")
            .map(|e| e.text_content().trim().to_string())
            .filter(|t| !t.is_empty());
        let props = requested_props(root);

        let changes = match self.storage.sync(col, token.as_deref()) {
            Ok(changes) => changes,
            Err(FsError::BadSyncToken) => return Err(bad_sync_token()),
            Err(e) => return Err(e.into()),
        };

        let mut writer = MultistatusWriter::new()?;
        for name in &changes.changed {
            if let Some(item) = self.storage.get(col, name)? {
                let href = item_href(path, col, name);
                let props = self.report_item_props(col, name, &item, &props, None)?;
                writer.response_props(&href, props)?;
            }
        }
        for name in &changes.removed {
            writer.response_status(&item_href(path, col, name), StatusCode::NOT_FOUND)?;
        }
        writer.sync_token(&changes.token)?;
        writer.finish()
    }

    // RFC 3253 expand-property, one level deep: properties whose value
    // is a list of hrefs are replaced by nested responses carrying the
    // requested sub-properties.
    fn expand_property(
        &self,
        path: &DavPath,
        col: &Collection,
        only_item: Option<&str>,
        root: &Element,
    ) -> DavResult<Response<Body>> {
        let mut writer = MultistatusWriter::new()?;
        let href = match only_item {
            Some(name) => item_href(path, col, name),
            None => path.for_storage_path(&col.path, true).as_url_string(),
        };

        let mut props = Vec::new();
        for request in root.child_elems() {
            if !request.is(NS_DAV, "property") {
                continue;
            }
            let name = match request.attributes.get("name") {
                Some(n) => n.clone(),
                None => continue,
            };
            let ns = request
                .attributes
                .get("namespace")
                .cloned()
                .unwrap_or_else(|| NS_DAV.to_string());
            let mut wanted = Element::new(&name);
            wanted.namespace = Some(ns);

            let (status, mut value) = match only_item {
                Some(name_str) => match self.storage.get(col, name_str)? {
                    Some(item) => self.prop_for_item(col, name_str, &item, &wanted),
                    None => return Err(DavError::Status(StatusCode::NOT_FOUND)),
                },
                None => self.prop_for_collection(col, &wanted),
            };

            let nested: Vec<&Element> = request
                .child_elems()
                .into_iter()
                .filter(|e| e.is(NS_DAV, "property"))
                .collect();
            if status == StatusCode::OK && !nested.is_empty() {
                value = self.expand_hrefs(&value, &nested)?;
            }
            props.push((status, value));
        }

        writer.response_props(&href, props)?;
        writer.finish()
    }

    fn expand_hrefs(&self, value: &Element, nested: &[&Element]) -> DavResult<Element> {
        let mut expanded = empty_prop(value);
        for child in value.child_elems() {
            if !child.is(NS_DAV, "href") {
                expanded.children.push(XMLNode::Element(child.clone()));
                continue;
            }
            let target = child.text_content();
            let target_path = match DavPath::from_str(target.trim(), &self.prefix) {
                Ok(p) => p,
                Err(_) => {
                    expanded.children.push(XMLNode::Element(child.clone()));
                    continue;
                }
            };
            let target_col = match self.storage.collection(&target_path.storage_path())? {
                Some(c) => c,
                None => {
                    expanded.children.push(XMLNode::Element(child.clone()));
                    continue;
                }
            };
            let mut response = Element::new2("D:response");
            response
                .children
                .push(XMLNode::Element(href_element(target.trim())));
            let mut propstat = Element::new2("D:propstat");
            let mut prop = Element::new2("D:prop");
            for wanted in nested {
                let name = match wanted.attributes.get("name") {
                    Some(n) => n.clone(),
                    None => continue,
                };
                let ns = wanted
                    .attributes
                    .get("namespace")
                    .cloned()
                    .unwrap_or_else(|| NS_DAV.to_string());
                let mut wanted_elem = Element::new(&name);
                wanted_elem.namespace = Some(ns);
                let (_, elem) = self.prop_for_collection(&target_col, &wanted_elem);
                prop.children.push(XMLNode::Element(elem));
            }
            propstat.children.push(XMLNode::Element(prop));
            propstat.children.push(XMLNode::Element(Element::new_text(
                "D:status",
                crate::util::status_line(StatusCode::OK),
            )));
            response.children.push(XMLNode::Element(propstat));
            expanded.children.push(XMLNode::Element(response));
        }
        Ok(expanded)
    }

    // resolve the requested properties of one matched item, including
    // the payload-carrying calendar-data/address-data.
    fn report_item_props(
        &self,
        col: &Collection,
        name: &str,
        item: &Item,
        requested: &[Element],
        expand: Option<&TimeRange>,
    ) -> DavResult<Vec<(StatusCode, Element)>> {
        let mut out = Vec::new();
        for prop in requested {
            let ns = prop.namespace.as_deref().unwrap_or("");
            match (ns, prop.name.as_str()) {
                (NS_CALDAV, "calendar-data") => {
                    let text = match expand {
                        Some(window) => expand_item(item, window, &self.limits())?
                            .unwrap_or_else(|| item.text().to_string()),
                        None => item.text().to_string(),
                    };
                    let mut elem = Element::new2("C:calendar-data");
                    elem.children.push(XMLNode::Text(text));
                    out.push((StatusCode::OK, elem));
                }
                (NS_CARDDAV, "address-data") => {
                    let mut elem = Element::new2("CR:address-data");
                    elem.children.push(XMLNode::Text(item.text().to_string()));
                    out.push((StatusCode::OK, elem));
                }
                _ => out.push(self.prop_for_item(col, name, item, prop)),
            }
        }
        if out.is_empty() {
            out.push(self.prop_for_item(col, name, item, &Element::new2("D:getetag")));
        }
        Ok(out)
    }
}

fn item_href(path: &DavPath, col: &Collection, name: &str) -> String {
    let mut p = path.for_storage_path(&col.path, true);
    p.push_segment(name);
    p.as_url_string()
}

// the `D:prop` children of a report body.
fn requested_props(root: &Element) -> Vec<Element> {
    root.find(NS_DAV, "prop")
        .map(|prop| prop.child_elems().into_iter().cloned().collect())
        .unwrap_or_default()
}

// an `expand` request inside C:calendar-data.
fn expand_window(props: &[Element]) -> Option<TimeRange> {
    for prop in props {
        if prop.is(NS_CALDAV, "calendar-data") {
            if let Some(expand) = prop.find(NS_CALDAV, "expand") {
                let start = expand
                    .attributes
                    .get("start")
                    .and_then(|v| parse_datetime(v, None));
                let end = expand
                    .attributes
                    .get("end")
                    .and_then(|v| parse_datetime(v, None));
                return Some(TimeRange { start, end });
            }
        }
    }
    None
}

fn time_range_from_attrs(elem: &Element) -> DavResult<TimeRange> {
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
