//
// sync-collection reports and collection etag behavior across
// restarts.
//
use std::sync::Arc;

use carillon::body::Body;
use carillon::config::Config;
use carillon::DavHandler;
use http::{Method, Request, Response, StatusCode};

// base64 of "alice:x"
const ALICE: &str = "Basic YWxpY2U6eA==";

fn test_config(dir: &tempfile::TempDir) -> Config {
    let mut config = Config::default();
    config.storage.filesystem_folder = dir.path().to_str().unwrap().to_string();
    config.storage.filesystem_fsync = false;
    config.auth.delay = 0.0;
    config.rights.r#type = "owner_only".to_string();
    config
}

fn server(dir: &tempfile::TempDir) -> DavHandler {
    DavHandler::new(Arc::new(test_config(dir))).unwrap()
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

fn extract(body: &str, open: &str, close: &str) -> String {
    let start = body.find(open).map(|i| i + open.len()).unwrap();
    let end = body[start..].find(close).unwrap() + start;
    body[start..end].to_string()
}

const EVENT: &str = "BEGIN:VCALENDAR\r\nVERSION:2.0\r\nBEGIN:VEVENT\r\nUID:e1\r\n\
    DTSTART:20240101T100000Z\r\nDTEND:20240101T110000Z\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n";

fn sync_report(token: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="utf-8" ?>
<D:sync-collection xmlns:D="DAV:">
  <D:sync-token>{token}</D:sync-token>
  <D:sync-level>1</D:sync-level>
  <D:prop><D:getetag/></D:prop>
</D:sync-collection>"#
    )
}

#[tokio::test]
async fn test_sync_collection_full_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let server = server(&dir);
    request(&server, "MKCALENDAR", "/alice/cal/", "", &[]).await;
    request(&server, "PUT", "/alice/cal/e1.ics", EVENT, &[]).await;
    let e2 = EVENT.replace("UID:e1", "UID:e2");
    request(&server, "PUT", "/alice/cal/e2.ics", &e2, &[]).await;

    // empty token: full listing plus a fresh token.
    let resp = request(&server, "REPORT", "/alice/cal/", &sync_report(""), &[]).await;
    assert_eq!(resp.status(), StatusCode::MULTI_STATUS);
    let body = body_str(&resp);
    assert!(body.contains("/alice/cal/e1.ics"));
    assert!(body.contains("/alice/cal/e2.ics"));
    let token = extract(&body, "<D:sync-token>", "</D:sync-token>");
    assert!(token.starts_with("http://radicale.org/ns/sync/"));

    // no changes: same token, empty diff.
    let resp = request(&server, "REPORT", "/alice/cal/", &sync_report(&token), &[]).await;
    let body = body_str(&resp);
    assert!(!body.contains("e1.ics"));
    assert_eq!(extract(&body, "<D:sync-token>", "</D:sync-token>"), token);

    // delete one item: it is reported as removed under the old token.
    request(&server, "DELETE", "/alice/cal/e1.ics", "", &[]).await;
    let resp = request(&server, "REPORT", "/alice/cal/", &sync_report(&token), &[]).await;
    let body = body_str(&resp);
    assert!(body.contains("/alice/cal/e1.ics"));
    assert!(body.contains("HTTP/1.1 404 Not Found"));
    assert!(!body.contains("e2.ics"));
    let new_token = extract(&body, "<D:sync-token>", "</D:sync-token>");
    assert_ne!(new_token, token);
}

#[tokio::test]
async fn test_sync_collection_reports_modifications() {
    let dir = tempfile::tempdir().unwrap();
    let server = server(&dir);
    request(&server, "MKCALENDAR", "/alice/cal/", "", &[]).await;
    request(&server, "PUT", "/alice/cal/e1.ics", EVENT, &[]).await;

    let resp = request(&server, "REPORT", "/alice/cal/", &sync_report(""), &[]).await;
    let token = extract(&body_str(&resp), "<D:sync-token>", "</D:sync-token>");

    let changed = EVENT.replace("DTSTART:20240101T100000Z", "DTSTART:20240101T120000Z");
    request(&server, "PUT", "/alice/cal/e1.ics", &changed, &[]).await;

    let resp = request(&server, "REPORT", "/alice/cal/", &sync_report(&token), &[]).await;
    let body = body_str(&resp);
    assert!(body.contains("/alice/cal/e1.ics"));
    assert!(body.contains("HTTP/1.1 200 OK"));
}

#[tokio::test]
async fn test_invalid_sync_token() {
    let dir = tempfile::tempdir().unwrap();
    let server = server(&dir);
    request(&server, "MKCALENDAR", "/alice/cal/", "", &[]).await;

    let report = sync_report("http://radicale.org/ns/sync/00000000000000000000000000000000");
    let resp = request(&server, "REPORT", "/alice/cal/", &report, &[]).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    assert!(body_str(&resp).contains("valid-sync-token"));
}

#[tokio::test]
async fn test_collection_etag_stable_across_restart() {
    let dir = tempfile::tempdir().unwrap();
    let ctag_query = r#"<?xml version="1.0" encoding="utf-8" ?>
<D:propfind xmlns:D="DAV:" xmlns:CS="http://calendarserver.org/ns/">
  <D:prop><CS:getctag/></D:prop>
</D:propfind>"#;

    let first = {
        let server = server(&dir);
        request(&server, "MKCALENDAR", "/alice/cal/", "", &[]).await;
        request(&server, "PUT", "/alice/cal/e1.ics", EVENT, &[]).await;
        let resp =
            request(&server, "PROPFIND", "/alice/cal/", ctag_query, &[("Depth", "0")]).await;
        extract(&body_str(&resp), "<CS:getctag>", "</CS:getctag>")
    };

    // a fresh handler over the same folder computes the same etag.
    let server = server(&dir);
    let resp = request(&server, "PROPFIND", "/alice/cal/", ctag_query, &[("Depth", "0")]).await;
    let second = extract(&body_str(&resp), "<CS:getctag>", "</CS:getctag>");
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_collection_etag_changes_with_content() {
    let dir = tempfile::tempdir().unwrap();
    let server = server(&dir);
    let ctag_query = r#"<?xml version="1.0" encoding="utf-8" ?>
<D:propfind xmlns:D="DAV:" xmlns:CS="http://calendarserver.org/ns/">
  <D:prop><CS:getctag/></D:prop>
</D:propfind>"#;
    request(&server, "MKCALENDAR", "/alice/cal/", "", &[]).await;

    let resp = request(&server, "PROPFIND", "/alice/cal/", ctag_query, &[("Depth", "0")]).await;
    let empty = extract(&body_str(&resp), "<CS:getctag>", "</CS:getctag>");

    request(&server, "PUT", "/alice/cal/e1.ics", EVENT, &[]).await;
    let resp = request(&server, "PROPFIND", "/alice/cal/", ctag_query, &[("Depth", "0")]).await;
    let with_item = extract(&body_str(&resp), "<CS:getctag>", "</CS:getctag>");
    assert_ne!(empty, with_item);

    // an identical re-upload leaves the etag unchanged.
    request(&server, "PUT", "/alice/cal/e1.ics", EVENT, &[]).await;
    let resp = request(&server, "PROPFIND", "/alice/cal/", ctag_query, &[("Depth", "0")]).await;
    let unchanged = extract(&body_str(&resp), "<CS:getctag>", "</CS:getctag>");
    assert_eq!(with_item, unchanged);
}
