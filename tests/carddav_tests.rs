//
// CardDAV integration tests: extended MKCOL, addressbook reports and
// UID synthesis for cards.
//
use std::sync::Arc;

use carillon::body::Body;
use carillon::config::Config;
use carillon::DavHandler;
use http::{Method, Request, Response, StatusCode};

// base64 of "alice:x"
const ALICE: &str = "Basic YWxpY2U6eA==";

fn server(dir: &tempfile::TempDir) -> DavHandler {
    let mut config = Config::default();
    config.storage.filesystem_folder = dir.path().to_str().unwrap().to_string();
    config.storage.filesystem_fsync = false;
    config.auth.delay = 0.0;
    config.rights.r#type = "owner_only".to_string();
    DavHandler::new(Arc::new(config)).unwrap()
}

async fn request(
    server: &DavHandler,
    method: &str,
    uri: &str,
    body: &str,
    headers: &[(&str, &str)],
) -> Response<Body> {
    let mut builder = Request::builder()
        .method(Method::from_bytes(method.as_bytes()).unwrap())
        .uri(uri)
        .header("Authorization", ALICE);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let req = builder.body(Body::from(body)).unwrap();
    server.handle(req, "127.0.0.1").await
}

fn body_str(resp: &Response<Body>) -> String {
    String::from_utf8(resp.body().to_bytes().to_vec()).unwrap()
}

const MKCOL_ADDRESSBOOK: &str = r#"<?xml version="1.0" encoding="utf-8" ?>
<D:mkcol xmlns:D="DAV:" xmlns:CR="urn:ietf:params:xml:ns:carddav">
  <D:set>
    <D:prop>
      <D:resourcetype><D:collection/><CR:addressbook/></D:resourcetype>
      <D:displayname>Contacts</D:displayname>
    </D:prop>
  </D:set>
</D:mkcol>"#;

const CARD: &str = "BEGIN:VCARD\r\nVERSION:3.0\r\nUID:c1\r\nFN:Ada Lovelace\r\n\
    EMAIL;TYPE=WORK:ada@example.com\r\nEND:VCARD\r\n";

async fn make_addressbook(server: &DavHandler) {
    let resp = request(server, "MKCOL", "/alice/book/", MKCOL_ADDRESSBOOK, &[]).await;
    assert_eq!(resp.status(), StatusCode::CREATED);
}

#[tokio::test]
async fn test_extended_mkcol_addressbook() {
    let dir = tempfile::tempdir().unwrap();
    let server = server(&dir);
    make_addressbook(&server).await;

    let propfind = r#"<?xml version="1.0" encoding="utf-8" ?>
<D:propfind xmlns:D="DAV:">
  <D:prop><D:resourcetype/><D:displayname/></D:prop>
</D:propfind>"#;
    let resp = request(&server, "PROPFIND", "/alice/book/", propfind, &[("Depth", "0")]).await;
    let body = body_str(&resp);
    assert!(body.contains("<CR:addressbook"));
    assert!(body.contains("<D:displayname>Contacts</D:displayname>"));
}

#[tokio::test]
async fn test_put_card_and_get() {
    let dir = tempfile::tempdir().unwrap();
    let server = server(&dir);
    make_addressbook(&server).await;

    let put = request(&server, "PUT", "/alice/book/c1.vcf", CARD, &[]).await;
    assert_eq!(put.status(), StatusCode::CREATED);

    let get = request(&server, "GET", "/alice/book/c1.vcf", "", &[]).await;
    assert_eq!(get.status(), StatusCode::OK);
    let content_type = get.headers().get("content-type").unwrap().to_str().unwrap();
    assert!(content_type.starts_with("text/vcard"));
    assert!(body_str(&get).contains("FN:Ada Lovelace"));
}

#[tokio::test]
async fn test_card_without_uid_gets_stable_uid() {
    let dir = tempfile::tempdir().unwrap();
    let server = server(&dir);
    make_addressbook(&server).await;

    let card = "BEGIN:VCARD\r\nVERSION:3.0\r\nFN:Grace Hopper\r\nEND:VCARD\r\n";
    let put = request(&server, "PUT", "/alice/book/g.vcf", card, &[]).await;
    assert_eq!(put.status(), StatusCode::CREATED);
    let first_etag = put.headers().get("etag").unwrap().to_str().unwrap().to_string();

    let get = request(&server, "GET", "/alice/book/g.vcf", "", &[]).await;
    let body = body_str(&get);
    assert!(body.contains("UID:"), "server must synthesize a UID: {body}");

    // reuploading the same bytes yields the same UID and etag.
    let put = request(&server, "PUT", "/alice/book/g.vcf", card, &[]).await;
    assert_eq!(put.status(), StatusCode::NO_CONTENT);
    assert_eq!(
        put.headers().get("etag").unwrap().to_str().unwrap(),
        first_etag
    );
}

#[tokio::test]
async fn test_addressbook_query_text_match() {
    let dir = tempfile::tempdir().unwrap();
    let server = server(&dir);
    make_addressbook(&server).await;
    request(&server, "PUT", "/alice/book/c1.vcf", CARD, &[]).await;
    let other = CARD
        .replace("UID:c1", "UID:c2")
        .replace("FN:Ada Lovelace", "FN:Charles Babbage")
        .replace("ada@example.com", "charles@elsewhere.org");
    request(&server, "PUT", "/alice/book/c2.vcf", &other, &[]).await;

    let report = r#"<?xml version="1.0" encoding="utf-8" ?>
<CR:addressbook-query xmlns:D="DAV:" xmlns:CR="urn:ietf:params:xml:ns:carddav">
  <D:prop><D:getetag/><CR:address-data/></D:prop>
  <CR:filter>
    <CR:prop-filter name="EMAIL">
      <CR:text-match collation="i;ascii-casemap" match-type="contains">example.com</CR:text-match>
    </CR:prop-filter>
  </CR:filter>
</CR:addressbook-query>"#;
    let resp = request(&server, "REPORT", "/alice/book/", report, &[]).await;
    assert_eq!(resp.status(), StatusCode::MULTI_STATUS);
    let body = body_str(&resp);
    assert!(body.contains("c1.vcf"));
    assert!(!body.contains("c2.vcf"));
    assert!(body.contains("FN:Ada Lovelace"));
}

#[tokio::test]
async fn test_addressbook_multiget() {
    let dir = tempfile::tempdir().unwrap();
    let server = server(&dir);
    make_addressbook(&server).await;
    request(&server, "PUT", "/alice/book/c1.vcf", CARD, &[]).await;

    let report = r#"<?xml version="1.0" encoding="utf-8" ?>
<CR:addressbook-multiget xmlns:D="DAV:" xmlns:CR="urn:ietf:params:xml:ns:carddav">
  <D:prop><D:getetag/><CR:address-data/></D:prop>
  <D:href>/alice/book/c1.vcf</D:href>
</CR:addressbook-multiget>"#;
    let resp = request(&server, "REPORT", "/alice/book/", report, &[]).await;
    assert_eq!(resp.status(), StatusCode::MULTI_STATUS);
    assert!(body_str(&resp).contains("FN:Ada Lovelace"));
}

#[tokio::test]
async fn test_event_in_addressbook_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let server = server(&dir);
    make_addressbook(&server).await;
    let event = "BEGIN:VCALENDAR\r\nBEGIN:VEVENT\r\nUID:e1\r\n\
        DTSTART:20240101T100000Z\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n";
    let resp = request(&server, "PUT", "/alice/book/e1.ics", event, &[]).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_whole_addressbook_upload() {
    let dir = tempfile::tempdir().unwrap();
    let server = server(&dir);

    let stream = "BEGIN:VCARD\r\nVERSION:3.0\r\nUID:a\r\nFN:A\r\nEND:VCARD\r\n\
        BEGIN:VCARD\r\nVERSION:3.0\r\nUID:b\r\nFN:B\r\nEND:VCARD\r\n";
    let resp = request(&server, "PUT", "/alice/imported/", stream, &[]).await;
    assert_eq!(resp.status(), StatusCode::CREATED);

    let resp = request(&server, "PROPFIND", "/alice/imported/", "", &[("Depth", "1")]).await;
    let body = body_str(&resp);
    assert!(body.contains("/alice/imported/a.vcf"));
    assert!(body.contains("/alice/imported/b.vcf"));
}
