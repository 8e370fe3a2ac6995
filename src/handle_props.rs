//
// PROPFIND and PROPPATCH, plus the live/dead property machinery that
// the REPORT handlers reuse.
//
use headers::HeaderMapExt;
use http::{Request, Response, StatusCode};
use log::debug;
use xmltree::Element;

use crate::body::Body;
use crate::davheaders::Depth;
use crate::davpath::DavPath;
use crate::errors::DavError;
use crate::handle_mkcol::property_value;
use crate::handler::DavInner;
use crate::ical::Item;
use crate::multistatus::MultistatusWriter;
use crate::storage::{collection_etag, Collection, CollectionTag};
use crate::util::systemtime_to_httpdate;
use crate::xmlutil::{
    parse_xml, qualified_name, ElementExt, NS_CALDAV, NS_CALSERVER, NS_CARDDAV, NS_DAV,
};
use crate::DavResult;

// guard rail for Depth: infinity walks.
const MAX_PROPFIND_RESOURCES: usize = 65536;

// properties reported by <allprop/> and an empty body.
const COLLECTION_ALLPROP: &[&str] = &[
    "D:resourcetype",
    "D:displayname",
    "D:getetag",
    "D:getlastmodified",
    "D:owner",
    "D:current-user-principal",
];
const ITEM_ALLPROP: &[&str] = &[
    "D:resourcetype",
    "D:getetag",
    "D:getcontenttype",
    "D:getcontentlength",
    "D:getlastmodified",
    "D:owner",
];

// extra names advertised by <propname/>.
const COLLECTION_PROPNAME: &[&str] = &[
    "D:current-user-privilege-set",
    "D:supported-report-set",
    "D:sync-token",
    "CS:getctag",
];

enum PropRequest {
    Prop(Vec<Element>),
    Allprop,
    Propname,
}

impl DavInner {
    pub(crate) fn handle_propfind(
        &self,
        req: &Request<()>,
        path: &DavPath,
        body: &[u8],
    ) -> DavResult<Response<Body>> {
        let request = parse_propfind(body)?;
        let depth = req.headers().typed_get::<Depth>().unwrap_or(Depth::Infinity);

        let storage_path = path.storage_path();
        let mut writer = MultistatusWriter::new()?;
        let mut budget = MAX_PROPFIND_RESOURCES;

        if let Some(col) = self.storage.collection(&storage_path)? {
            if !self.can_read(&storage_path, col.tag.is_some()) {
                return Err(self.access_denied());
            }
            self.propfind_collection(&mut writer, path, &col, depth, &request, &mut budget)?;
        } else {
            let parent_path = path.parent().storage_path();
            let col = match self.storage.collection(&parent_path)? {
                Some(col) if col.tag.is_some() => col,
                _ => return Err(self.not_found(&parent_path)),
            };
            if !self.can_read(&parent_path, true) {
                return Err(self.access_denied());
            }
            let item = match self.storage.get(&col, path.name())? {
                Some(item) => item,
                None => return Err(DavError::Status(StatusCode::NOT_FOUND)),
            };
            let href = path.as_url_string();
            self.write_item_props(&mut writer, &href, &col, path.name(), &item, &request)?;
        }

        let mut resp = writer.finish()?;
        resp.headers_mut()
            .typed_insert(headers::CacheControl::new().with_no_cache());
        Ok(resp)
    }

    fn propfind_collection(
        &self,
        writer: &mut MultistatusWriter,
        path: &DavPath,
        col: &Collection,
        depth: Depth,
        request: &PropRequest,
        budget: &mut usize,
    ) -> DavResult<()> {
        if *budget == 0 {
            return Err(DavError::Status(StatusCode::LOOP_DETECTED));
        }
        *budget -= 1;

        let href = path.for_storage_path(&col.path, true).as_url_string();
        self.write_collection_props(writer, &href, col, request)?;
        if depth == Depth::Zero {
            return Ok(());
        }
        let child_depth = match depth {
            Depth::One => Depth::Zero,
            _ => Depth::Infinity,
        };

        match col.tag {
            Some(_) => {
                for (name, item) in self.storage.get_all(col)? {
                    if *budget == 0 {
                        return Err(DavError::Status(StatusCode::LOOP_DETECTED));
                    }
                    *budget -= 1;
                    let mut item_path = path.for_storage_path(&col.path, true);
                    item_path.push_segment(&name);
                    let href = item_path.as_url_string();
                    self.write_item_props(writer, &href, col, &name, &item, request)?;
                }
            }
            None => {
                for sub in self.storage.subcollections(&col.path)? {
                    // children the user may not read are left out.
                    if !self.can_read(&sub.path, sub.tag.is_some()) {
                        debug!("propfind skips unreadable /{}", sub.path);
                        continue;
                    }
                    self.propfind_collection(writer, path, &sub, child_depth, request, budget)?;
                }
            }
        }
        Ok(())
    }

    fn write_collection_props(
        &self,
        writer: &mut MultistatusWriter,
        href: &str,
        col: &Collection,
        request: &PropRequest,
    ) -> DavResult<()> {
        let props = match request {
            PropRequest::Prop(elems) => elems
                .iter()
                .map(|e| self.prop_for_collection(col, e))
                .collect(),
            PropRequest::Allprop => {
                let mut out = Vec::new();
                for name in COLLECTION_ALLPROP {
                    let (status, elem) = self.prop_for_collection(col, &Element::new2(name));
                    if status == StatusCode::OK {
                        out.push((status, elem));
                    }
                }
                for key in col.props.keys() {
                    let elem = crate::xmlutil::element_for_qname(key);
                    let (status, elem) = self.prop_for_collection(col, &elem);
                    if status == StatusCode::OK && !COLLECTION_ALLPROP.contains(&key.as_str()) {
                        out.push((status, elem));
                    }
                }
                out
            }
            PropRequest::Propname => {
                let mut names: Vec<String> =
                    COLLECTION_ALLPROP.iter().map(|s| s.to_string()).collect();
                names.extend(COLLECTION_PROPNAME.iter().map(|s| s.to_string()));
                names.extend(col.props.keys().cloned());
                names.sort();
                names.dedup();
                names
                    .iter()
                    .map(|n| (StatusCode::OK, crate::xmlutil::element_for_qname(n)))
                    .collect()
            }
        };
        writer.response_props(href, props)
    }

    fn write_item_props(
        &self,
        writer: &mut MultistatusWriter,
        href: &str,
        col: &Collection,
        name: &str,
        item: &Item,
        request: &PropRequest,
    ) -> DavResult<()> {
        let props = match request {
            PropRequest::Prop(elems) => elems
                .iter()
                .map(|e| self.prop_for_item(col, name, item, e))
                .collect(),
            PropRequest::Allprop => ITEM_ALLPROP
                .iter()
                .map(|n| self.prop_for_item(col, name, item, &Element::new2(n)))
                .filter(|(status, _)| *status == StatusCode::OK)
                .collect(),
            PropRequest::Propname => ITEM_ALLPROP
                .iter()
                .map(|n| (StatusCode::OK, Element::new2(n)))
                .collect(),
        };
        writer.response_props(href, props)
    }

    /// Resolve one requested property on a collection.
    pub(crate) fn prop_for_collection(
        &self,
        col: &Collection,
        prop: &Element,
    ) -> (StatusCode, Element) {
        let ns = prop.namespace.as_deref().unwrap_or("");
        let name = prop.name.as_str();
        let not_found = || (StatusCode::NOT_FOUND, empty_prop(prop));
        let ok = |elem| (StatusCode::OK, elem);

        match (ns, name) {
            (NS_DAV, "resourcetype") => {
                let mut elem = Element::new2("D:resourcetype");
                elem.children
                    .push(xmltree::XMLNode::Element(Element::new2("D:collection")));
                match col.tag {
                    Some(CollectionTag::Calendar) => elem
                        .children
                        .push(xmltree::XMLNode::Element(Element::new2("C:calendar"))),
                    Some(CollectionTag::Addressbook) => elem
                        .children
                        .push(xmltree::XMLNode::Element(Element::new2("CR:addressbook"))),
                    None => {
                        if col.is_principal() {
                            elem.children
                                .push(xmltree::XMLNode::Element(Element::new2("D:principal")));
                        }
                    }
                }
                ok(elem)
            }
            (NS_DAV, "getetag") | (NS_CALSERVER, "getctag") => match col.tag {
                Some(_) => match self.storage.list(col) {
                    Ok(listing) => {
                        let qname = if ns == NS_DAV { "D:getetag" } else { "CS:getctag" };
                        ok(Element::new_text(qname, collection_etag(col, &listing)))
                    }
                    Err(_) => not_found(),
                },
                None => not_found(),
            },
            (NS_DAV, "getlastmodified") => match self.storage.last_modified(col) {
                Ok(t) => ok(Element::new_text(
                    "D:getlastmodified",
                    systemtime_to_httpdate(t),
                )),
                Err(_) => not_found(),
            },
            (NS_DAV, "owner") => match col.owner() {
                Some(owner) => {
                    let mut elem = Element::new2("D:owner");
                    elem.children.push(xmltree::XMLNode::Element(href_element(
                        &self.href(&format!("/{}/", owner)),
                    )));
                    ok(elem)
                }
                None => not_found(),
            },
            (NS_DAV, "current-user-principal") => {
                let mut elem = Element::new2("D:current-user-principal");
                if self.user.is_empty() {
                    elem.children
                        .push(xmltree::XMLNode::Element(Element::new2("D:unauthenticated")));
                } else {
                    elem.children.push(xmltree::XMLNode::Element(href_element(
                        &self.href(&format!("/{}/", self.user)),
                    )));
                }
                ok(elem)
            }
            (NS_DAV, "principal-URL") if col.is_principal() => {
                let mut elem = Element::new2("D:principal-URL");
                elem.children.push(xmltree::XMLNode::Element(href_element(
                    &self.href(&format!("/{}/", col.path)),
                )));
                ok(elem)
            }
            (NS_DAV, "current-user-privilege-set") => {
                let mut elem = Element::new2("D:current-user-privilege-set");
                let leaf = col.tag.is_some();
                let mut add = |name: &str| {
                    let mut privilege = Element::new2("D:privilege");
                    privilege
                        .children
                        .push(xmltree::XMLNode::Element(Element::new2(name)));
                    elem.children.push(xmltree::XMLNode::Element(privilege));
                };
                if self.can_read(&col.path, leaf) {
                    add("D:read");
                }
                if self.can_write(&col.path, leaf) {
                    add("D:write");
                    add("D:write-properties");
                    add("D:write-content");
                }
                ok(elem)
            }
            (NS_DAV, "supported-report-set") => {
                let mut elem = Element::new2("D:supported-report-set");
                let reports: &[&str] = match col.tag {
                    Some(CollectionTag::Calendar) => &[
                        "C:calendar-query",
                        "C:calendar-multiget",
                        "C:free-busy-query",
                        "D:sync-collection",
                        "D:expand-property",
                    ],
                    Some(CollectionTag::Addressbook) => &[
                        "CR:addressbook-query",
                        "CR:addressbook-multiget",
                        "D:sync-collection",
                        "D:expand-property",
                    ],
                    None => &["D:expand-property"],
                };
                for name in reports {
                    let mut supported = Element::new2("D:supported-report");
                    let mut report = Element::new2("D:report");
                    report
                        .children
                        .push(xmltree::XMLNode::Element(Element::new2(name)));
                    supported.children.push(xmltree::XMLNode::Element(report));
                    elem.children.push(xmltree::XMLNode::Element(supported));
                }
                ok(elem)
            }
            (NS_DAV, "sync-token") => match col.tag {
                Some(_) => match self.storage.sync(col, None) {
                    Ok(changes) => ok(Element::new_text("D:sync-token", changes.token)),
                    Err(_) => not_found(),
                },
                None => not_found(),
            },
            (NS_CALDAV, "calendar-home-set") if col.is_principal() => {
                let mut elem = Element::new2("C:calendar-home-set");
                elem.children.push(xmltree::XMLNode::Element(href_element(
                    &self.href(&format!("/{}/", col.path)),
                )));
                ok(elem)
            }
            (NS_CARDDAV, "addressbook-home-set") if col.is_principal() => {
                let mut elem = Element::new2("CR:addressbook-home-set");
                elem.children.push(xmltree::XMLNode::Element(href_element(
                    &self.href(&format!("/{}/", col.path)),
                )));
                ok(elem)
            }
            (NS_CALDAV, "supported-calendar-component-set") => {
                if col.tag != Some(CollectionTag::Calendar) {
                    return not_found();
                }
                let components = col
                    .props
                    .get("C:supported-calendar-component-set")
                    .cloned()
                    .unwrap_or_else(|| "VEVENT,VTODO,VJOURNAL".to_string());
                let mut elem = Element::new2("C:supported-calendar-component-set");
                for comp in components.split(',').filter(|c| !c.is_empty()) {
                    let mut c = Element::new2("C:comp");
                    c.attributes.insert("name".to_string(), comp.to_string());
                    elem.children.push(xmltree::XMLNode::Element(c));
                }
                ok(elem)
            }
            _ => {
                // anything else round-trips through the property map.
                match col.props.get(&qualified_name(prop)) {
                    Some(value) => {
                        let mut elem = empty_prop(prop);
                        elem.children.push(xmltree::XMLNode::Text(value.clone()));
                        ok(elem)
                    }
                    None => not_found(),
                }
            }
        }
    }

    /// Resolve one requested property on an item.
    pub(crate) fn prop_for_item(
        &self,
        col: &Collection,
        _name: &str,
        item: &Item,
        prop: &Element,
    ) -> (StatusCode, Element) {
        let ns = prop.namespace.as_deref().unwrap_or("");
        let ok = |elem| (StatusCode::OK, elem);
        match (ns, prop.name.as_str()) {
            (NS_DAV, "resourcetype") => ok(Element::new2("D:resourcetype")),
            (NS_DAV, "getetag") => ok(Element::new_text("D:getetag", item.etag())),
            (NS_DAV, "getcontenttype") => ok(Element::new_text(
                "D:getcontenttype",
                format!("{}; component={}", item.content_type(), item.kind().name()),
            )),
            (NS_DAV, "getcontentlength") => ok(Element::new_text(
                "D:getcontentlength",
                item.text().len().to_string(),
            )),
            (NS_DAV, "getlastmodified") => match item.last_modified {
                Some(t) => ok(Element::new_text(
                    "D:getlastmodified",
                    systemtime_to_httpdate(t),
                )),
                None => (StatusCode::NOT_FOUND, empty_prop(prop)),
            },
            (NS_DAV, "owner") => match col.owner() {
                Some(owner) => {
                    let mut elem = Element::new2("D:owner");
                    elem.children.push(xmltree::XMLNode::Element(href_element(
                        &self.href(&format!("/{}/", owner)),
                    )));
                    ok(elem)
                }
                None => (StatusCode::NOT_FOUND, empty_prop(prop)),
            },
            (NS_DAV, "current-user-principal") => {
                let mut elem = Element::new2("D:current-user-principal");
                if self.user.is_empty() {
                    elem.children
                        .push(xmltree::XMLNode::Element(Element::new2("D:unauthenticated")));
                } else {
                    elem.children.push(xmltree::XMLNode::Element(href_element(
                        &self.href(&format!("/{}/", self.user)),
                    )));
                }
                ok(elem)
            }
            _ => (StatusCode::NOT_FOUND, empty_prop(prop)),
        }
    }

    pub(crate) fn handle_proppatch(
        &self,
        path: &DavPath,
        body: &[u8],
    ) -> DavResult<Response<Body>> {
        let storage_path = path.storage_path();
        let col = match self.storage.collection(&storage_path)? {
            Some(col) => col,
            None => return Err(self.not_found(&storage_path)),
        };
        if !self.can_write(&storage_path, col.tag.is_some()) {
            return Err(self.access_denied());
        }

        let root = parse_xml(body)?;
        if !root.is(NS_DAV, "propertyupdate") {
            return Err(DavError::XmlParseError);
        }

        // collect (qname, element, new value or None for remove) in
        // document order.
        let mut ops: Vec<(String, Element, Option<String>)> = Vec::new();
        for child in root.child_elems() {
            let is_set = child.is(NS_DAV, "set");
            let is_remove = child.is(NS_DAV, "remove");
            if !is_set && !is_remove {
                continue;
            }
            if let Some(prop) = child.find(NS_DAV, "prop") {
                for elem in prop.child_elems() {
                    let value = if is_set {
                        Some(property_value(elem))
                    } else {
                        None
                    };
                    ops.push((qualified_name(elem), empty_prop(elem), value));
                }
            }
        }

        const PROTECTED: &[&str] = &[
            "D:resourcetype",
            "D:getetag",
            "D:getlastmodified",
            "D:getcontenttype",
            "D:getcontentlength",
            "D:sync-token",
            "CS:getctag",
        ];
        let any_forbidden = ops.iter().any(|(qname, _, _)| PROTECTED.contains(&qname.as_str()));

        let mut writer = MultistatusWriter::new()?;
        let href = path.for_storage_path(&col.path, col.tag.is_some()).as_url_string();
        if any_forbidden {
            // all-or-nothing: nothing is applied, the rest fails as a
            // dependency.
            let props = ops
                .into_iter()
                .map(|(qname, elem, _)| {
                    if PROTECTED.contains(&qname.as_str()) {
                        (StatusCode::FORBIDDEN, elem)
                    } else {
                        (StatusCode::FAILED_DEPENDENCY, elem)
                    }
                })
                .collect();
            writer.response_props(&href, props)?;
            return writer.finish();
        }

        let mut props = col.props.clone();
        let mut results = Vec::new();
        for (qname, elem, value) in ops {
            match value {
                Some(value) => {
                    props.insert(qname, value);
                }
                None => {
                    props.remove(&qname);
                }
            }
            results.push((StatusCode::OK, elem));
        }
        self.storage.set_props(&col, props)?;
        writer.response_props(&href, results)?;
        writer.finish()
    }
}

fn parse_propfind(body: &[u8]) -> DavResult<PropRequest> {
    if body.is_empty() {
        return Ok(PropRequest::Allprop);
    }
    let root = parse_xml(body)?;
    if !root.is(NS_DAV, "propfind") {
        return Err(DavError::XmlParseError);
    }
    for child in root.child_elems() {
        if child.is(NS_DAV, "propname") {
            return Ok(PropRequest::Propname);
        }
        if child.is(NS_DAV, "allprop") {
            return Ok(PropRequest::Allprop);
        }
        if child.is(NS_DAV, "prop") {
            let props = child.child_elems().into_iter().cloned().collect();
            return Ok(PropRequest::Prop(props));
        }
    }
    Err(DavError::XmlParseError)
}

pub(crate) fn href_element(path: &str) -> Element {
    Element::new_text("D:href", path)
}

// requested property echoed back without content.
pub(crate) fn empty_prop(prop: &Element) -> Element {
    let mut elem = Element::new(&prop.name);
    elem.prefix = prop.prefix.clone();
    elem.namespace = prop.namespace.clone();
    elem
}
