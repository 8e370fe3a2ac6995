//
// Assembly of `207 Multi-Status` responses.
//
// The writer emits one `D:response` per href; properties are grouped so
// that each status code gets a single `D:propstat`.
//
use std::collections::BTreeMap;

use http::{Response, StatusCode};
use xml::common::XmlVersion;
use xml::writer::{EmitterConfig, EventWriter, XmlEvent as XmlWEvent};
use xmltree::Element;

use crate::body::Body;
use crate::util::{status_line, MemBuffer};
use crate::xmlutil::{ElementExt, NS_CALDAV, NS_CALSERVER, NS_CARDDAV, NS_DAV, NS_ICAL};
use crate::DavResult;

pub(crate) struct MultistatusWriter {
    xw: EventWriter<MemBuffer>,
}

impl MultistatusWriter {
    pub fn new() -> DavResult<MultistatusWriter> {
        let mut xw = EventWriter::new_with_config(
            MemBuffer::new(),
            EmitterConfig {
                perform_indent: false,
                ..EmitterConfig::default()
            },
        );
        xw.write(XmlWEvent::StartDocument {
            version: XmlVersion::Version10,
            encoding: Some("utf-8"),
            standalone: None,
        })?;
        xw.write(
            XmlWEvent::start_element("D:multistatus")
                .ns("D", NS_DAV)
                .ns("C", NS_CALDAV)
                .ns("CR", NS_CARDDAV)
                .ns("CS", NS_CALSERVER)
                .ns("ICAL", NS_ICAL),
        )?;
        Ok(MultistatusWriter { xw })
    }

    /// A response carrying property results, one propstat per status.
    pub fn response_props(
        &mut self,
        href: &str,
        props: Vec<(StatusCode, Element)>,
    ) -> DavResult<()> {
        let mut by_status: BTreeMap<u16, Vec<Element>> = BTreeMap::new();
        for (status, elem) in props {
            by_status.entry(status.as_u16()).or_default().push(elem);
        }

        self.xw.write(XmlWEvent::start_element("D:response"))?;
        self.write_text_elem("D:href", href)?;
        for (status, elems) in by_status {
            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            self.xw.write(XmlWEvent::start_element("D:propstat"))?;
            self.xw.write(XmlWEvent::start_element("D:prop"))?;
            for elem in elems {
                elem.write_ev(&mut self.xw)?;
            }
            self.xw.write(XmlWEvent::end_element())?; // prop
            self.write_text_elem("D:status", &status_line(status))?;
            self.xw.write(XmlWEvent::end_element())?; // propstat
        }
        self.xw.write(XmlWEvent::end_element())?; // response
        Ok(())
    }

    /// A response carrying only a status (sync-collection removals,
    /// multiget misses).
    pub fn response_status(&mut self, href: &str, status: StatusCode) -> DavResult<()> {
        self.xw.write(XmlWEvent::start_element("D:response"))?;
        self.write_text_elem("D:href", href)?;
        self.write_text_elem("D:status", &status_line(status))?;
        self.xw.write(XmlWEvent::end_element())?;
        Ok(())
    }

    /// The trailing `D:sync-token` of a sync-collection report.
    pub fn sync_token(&mut self, token: &str) -> DavResult<()> {
        self.write_text_elem("D:sync-token", token)
    }

    pub fn finish(mut self) -> DavResult<Response<Body>> {
        self.xw.write(XmlWEvent::end_element())?; // multistatus
        let mut buf = self.xw.into_inner();
        let mut resp = Response::new(Body::from(buf.take()));
        *resp.status_mut() = StatusCode::MULTI_STATUS;
        resp.headers_mut().insert(
            "content-type",
            "application/xml; charset=utf-8".parse().unwrap(),
        );
        Ok(resp)
    }

    fn write_text_elem(&mut self, name: &str, text: &str) -> DavResult<()> {
        self.xw.write(XmlWEvent::start_element(name))?;
        if !text.is_empty() {
            self.xw.write(XmlWEvent::characters(text))?;
        }
        self.xw.write(XmlWEvent::end_element())?;
        Ok(())
    }
}
