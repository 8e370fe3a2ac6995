//
// WebDAV integration tests: the handler is driven directly with
// http::Request values over a throwaway storage folder.
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

const EVENT: &str = "BEGIN:VCALENDAR\r\nVERSION:2.0\r\nBEGIN:VEVENT\r\nUID:e1\r\n\
    DTSTART:20240101T100000Z\r\nDTEND:20240101T110000Z\r\nSUMMARY:Kickoff\r\n\
    END:VEVENT\r\nEND:VCALENDAR\r\n";

async fn make_calendar(server: &DavHandler, uri: &str) {
    let resp = request(server, "MKCALENDAR", uri, "", &[]).await;
    assert_eq!(resp.status(), StatusCode::CREATED);
}

#[tokio::test]
async fn test_options_advertises_dav() {
    let dir = tempfile::tempdir().unwrap();
    let server = server(&dir);
    let resp = request(&server, "OPTIONS", "/", "", &[]).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let dav = resp.headers().get("DAV").unwrap().to_str().unwrap();
    assert!(dav.contains("calendar-access"));
    assert!(dav.contains("addressbook"));
    assert!(dav.contains("extended-mkcol"));
}

#[tokio::test]
async fn test_unauthenticated_gets_challenge() {
    let dir = tempfile::tempdir().unwrap();
    let server = server(&dir);
    let req = Request::builder()
        .method("PROPFIND")
        .uri("/")
        .header("Depth", "0")
        .body(Body::empty())
        .unwrap();
    let resp = server.handle(req, "127.0.0.1").await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let challenge = resp.headers().get("WWW-Authenticate").unwrap().to_str().unwrap();
    assert!(challenge.starts_with("Basic realm="));
}

#[tokio::test]
async fn test_principal_collection_autocreated() {
    let dir = tempfile::tempdir().unwrap();
    let server = server(&dir);
    let resp = request(&server, "PROPFIND", "/", "", &[("Depth", "1")]).await;
    assert_eq!(resp.status(), StatusCode::MULTI_STATUS);
    assert!(body_str(&resp).contains("<D:href>/alice/</D:href>"));
}

#[tokio::test]
async fn test_put_get_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let server = server(&dir);
    make_calendar(&server, "/alice/cal/").await;

    let put = request(&server, "PUT", "/alice/cal/e1.ics", EVENT, &[]).await;
    assert_eq!(put.status(), StatusCode::CREATED);
    let etag = put.headers().get("etag").unwrap().to_str().unwrap().to_string();

    let get = request(&server, "GET", "/alice/cal/e1.ics", "", &[]).await;
    assert_eq!(get.status(), StatusCode::OK);
    assert_eq!(get.headers().get("etag").unwrap().to_str().unwrap(), etag);
    let text = body_str(&get);
    assert!(text.contains("SUMMARY:Kickoff"));
    assert!(text.contains("UID:e1"));

    // a second GET returns the identical canonical payload.
    let again = request(&server, "GET", "/alice/cal/e1.ics", "", &[]).await;
    assert_eq!(body_str(&again), text);
}

#[tokio::test]
async fn test_head_has_no_body() {
    let dir = tempfile::tempdir().unwrap();
    let server = server(&dir);
    make_calendar(&server, "/alice/cal/").await;
    request(&server, "PUT", "/alice/cal/e1.ics", EVENT, &[]).await;

    let head = request(&server, "HEAD", "/alice/cal/e1.ics", "", &[]).await;
    assert_eq!(head.status(), StatusCode::OK);
    assert!(head.body().is_empty());
    let len: usize = head
        .headers()
        .get("content-length")
        .unwrap()
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(len > 0);
}

#[tokio::test]
async fn test_put_idempotent_with_if_match() {
    let dir = tempfile::tempdir().unwrap();
    let server = server(&dir);
    make_calendar(&server, "/alice/cal/").await;

    let put = request(&server, "PUT", "/alice/cal/e1.ics", EVENT, &[]).await;
    let etag = put.headers().get("etag").unwrap().to_str().unwrap().to_string();

    let second = request(
        &server,
        "PUT",
        "/alice/cal/e1.ics",
        EVENT,
        &[("If-Match", etag.as_str())],
    )
    .await;
    assert_eq!(second.status(), StatusCode::NO_CONTENT);
    assert_eq!(
        second.headers().get("etag").unwrap().to_str().unwrap(),
        etag
    );
}

#[tokio::test]
async fn test_put_preconditions() {
    let dir = tempfile::tempdir().unwrap();
    let server = server(&dir);
    make_calendar(&server, "/alice/cal/").await;
    request(&server, "PUT", "/alice/cal/e1.ics", EVENT, &[]).await;

    let stale = request(
        &server,
        "PUT",
        "/alice/cal/e1.ics",
        EVENT,
        &[("If-Match", "\"bogus\"")],
    )
    .await;
    assert_eq!(stale.status(), StatusCode::PRECONDITION_FAILED);

    let exists = request(
        &server,
        "PUT",
        "/alice/cal/e1.ics",
        EVENT,
        &[("If-None-Match", "*")],
    )
    .await;
    assert_eq!(exists.status(), StatusCode::PRECONDITION_FAILED);
}

#[tokio::test]
async fn test_delete_then_delete_then_put() {
    let dir = tempfile::tempdir().unwrap();
    let server = server(&dir);
    make_calendar(&server, "/alice/cal/").await;
    request(&server, "PUT", "/alice/cal/e1.ics", EVENT, &[]).await;

    let del = request(&server, "DELETE", "/alice/cal/e1.ics", "", &[]).await;
    assert_eq!(del.status(), StatusCode::NO_CONTENT);
    let again = request(&server, "DELETE", "/alice/cal/e1.ics", "", &[]).await;
    assert_eq!(again.status(), StatusCode::NOT_FOUND);
    let put = request(&server, "PUT", "/alice/cal/e1.ics", EVENT, &[]).await;
    assert_eq!(put.status(), StatusCode::CREATED);
}

#[tokio::test]
async fn test_duplicate_uid_conflict() {
    let dir = tempfile::tempdir().unwrap();
    let server = server(&dir);
    make_calendar(&server, "/alice/cal/").await;
    request(&server, "PUT", "/alice/cal/e1.ics", EVENT, &[]).await;
    // same UID under a different name.
    let resp = request(&server, "PUT", "/alice/cal/other.ics", EVENT, &[]).await;
    assert_eq!(resp.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_proppatch_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let server = server(&dir);
    make_calendar(&server, "/alice/cal/").await;

    let patch = r#"<?xml version="1.0" encoding="utf-8" ?>
<D:propertyupdate xmlns:D="DAV:">
  <D:set><D:prop><D:displayname>Family</D:displayname></D:prop></D:set>
</D:propertyupdate>"#;
    let resp = request(&server, "PROPPATCH", "/alice/cal/", patch, &[]).await;
    assert_eq!(resp.status(), StatusCode::MULTI_STATUS);
    assert!(body_str(&resp).contains("HTTP/1.1 200 OK"));

    let propfind = r#"<?xml version="1.0" encoding="utf-8" ?>
<D:propfind xmlns:D="DAV:"><D:prop><D:displayname/></D:prop></D:propfind>"#;
    let resp = request(&server, "PROPFIND", "/alice/cal/", propfind, &[("Depth", "0")]).await;
    assert!(body_str(&resp).contains("<D:displayname>Family</D:displayname>"));

    let remove = r#"<?xml version="1.0" encoding="utf-8" ?>
<D:propertyupdate xmlns:D="DAV:">
  <D:remove><D:prop><D:displayname/></D:prop></D:remove>
</D:propertyupdate>"#;
    let resp = request(&server, "PROPPATCH", "/alice/cal/", remove, &[]).await;
    assert_eq!(resp.status(), StatusCode::MULTI_STATUS);
    let resp = request(&server, "PROPFIND", "/alice/cal/", propfind, &[("Depth", "0")]).await;
    assert!(body_str(&resp).contains("HTTP/1.1 404 Not Found"));
}

#[tokio::test]
async fn test_proppatch_protected_is_atomic() {
    let dir = tempfile::tempdir().unwrap();
    let server = server(&dir);
    make_calendar(&server, "/alice/cal/").await;

    let patch = r#"<?xml version="1.0" encoding="utf-8" ?>
<D:propertyupdate xmlns:D="DAV:">
  <D:set><D:prop>
    <D:displayname>X</D:displayname>
    <D:getetag>"forged"</D:getetag>
  </D:prop></D:set>
</D:propertyupdate>"#;
    let resp = request(&server, "PROPPATCH", "/alice/cal/", patch, &[]).await;
    assert_eq!(resp.status(), StatusCode::MULTI_STATUS);
    let body = body_str(&resp);
    assert!(body.contains("HTTP/1.1 403 Forbidden"));
    assert!(body.contains("HTTP/1.1 424 Failed Dependency"));

    // the displayname must not have been applied.
    let propfind = r#"<?xml version="1.0" encoding="utf-8" ?>
<D:propfind xmlns:D="DAV:"><D:prop><D:displayname/></D:prop></D:propfind>"#;
    let resp = request(&server, "PROPFIND", "/alice/cal/", propfind, &[("Depth", "0")]).await;
    assert!(body_str(&resp).contains("HTTP/1.1 404 Not Found"));
}

#[tokio::test]
async fn test_move_item() {
    let dir = tempfile::tempdir().unwrap();
    let server = server(&dir);
    make_calendar(&server, "/alice/cal/").await;
    request(&server, "PUT", "/alice/cal/e1.ics", EVENT, &[]).await;

    let resp = request(
        &server,
        "MOVE",
        "/alice/cal/e1.ics",
        "",
        &[("Destination", "/alice/cal/renamed.ics")],
    )
    .await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let old = request(&server, "GET", "/alice/cal/e1.ics", "", &[]).await;
    assert_eq!(old.status(), StatusCode::NOT_FOUND);
    let new = request(&server, "GET", "/alice/cal/renamed.ics", "", &[]).await;
    assert_eq!(new.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_move_no_overwrite() {
    let dir = tempfile::tempdir().unwrap();
    let server = server(&dir);
    make_calendar(&server, "/alice/cal/").await;
    request(&server, "PUT", "/alice/cal/e1.ics", EVENT, &[]).await;
    let other = EVENT.replace("UID:e1", "UID:e2");
    request(&server, "PUT", "/alice/cal/e2.ics", &other, &[]).await;

    let resp = request(
        &server,
        "MOVE",
        "/alice/cal/e1.ics",
        "",
        &[("Destination", "/alice/cal/e2.ics"), ("Overwrite", "F")],
    )
    .await;
    assert_eq!(resp.status(), StatusCode::PRECONDITION_FAILED);
}

#[tokio::test]
async fn test_move_collection() {
    let dir = tempfile::tempdir().unwrap();
    let server = server(&dir);
    make_calendar(&server, "/alice/cal/").await;
    request(&server, "PUT", "/alice/cal/e1.ics", EVENT, &[]).await;

    let resp = request(
        &server,
        "MOVE",
        "/alice/cal/",
        "",
        &[("Destination", "/alice/moved/")],
    )
    .await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let get = request(&server, "GET", "/alice/moved/e1.ics", "", &[]).await;
    assert_eq!(get.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_mkcol_status_codes() {
    let dir = tempfile::tempdir().unwrap();
    let server = server(&dir);

    let ok = request(&server, "MKCOL", "/alice/plain/", "", &[]).await;
    assert_eq!(ok.status(), StatusCode::CREATED);
    let exists = request(&server, "MKCOL", "/alice/plain/", "", &[]).await;
    assert_eq!(exists.status(), StatusCode::METHOD_NOT_ALLOWED);
    let orphan = request(&server, "MKCOL", "/alice/missing/sub/", "", &[]).await;
    assert_eq!(orphan.status(), StatusCode::CONFLICT);

    // creating below a leaf collection is refused.
    make_calendar(&server, "/alice/cal/").await;
    let inside_leaf = request(&server, "MKCOL", "/alice/cal/sub/", "", &[]).await;
    assert_eq!(inside_leaf.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_foreign_principal_forbidden() {
    let dir = tempfile::tempdir().unwrap();
    let server = server(&dir);
    let resp = request(&server, "MKCOL", "/bob/cal/", "", &[]).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    // absence may be revealed: alice can read the root listing.
    let resp = request(&server, "PROPFIND", "/bob/", "", &[("Depth", "0")]).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    // once bob exists, alice gets 403 instead.
    let req = Request::builder()
        .method("PROPFIND")
        .uri("/bob/")
        .header("Authorization", "Basic Ym9iOng=")
        .header("Depth", "0")
        .body(Body::empty())
        .unwrap();
    let resp = server.handle(req, "127.0.0.1").await;
    assert_eq!(resp.status(), StatusCode::MULTI_STATUS);
    let resp = request(&server, "PROPFIND", "/bob/", "", &[("Depth", "0")]).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_max_content_length_boundary() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.server.max_content_length = EVENT.len();
    let server = DavHandler::new(Arc::new(config)).unwrap();
    make_calendar(&server, "/alice/cal/").await;

    let at_limit = request(&server, "PUT", "/alice/cal/e1.ics", EVENT, &[]).await;
    assert_eq!(at_limit.status(), StatusCode::CREATED);

    let over = format!("{} ", EVENT);
    let resp = request(&server, "PUT", "/alice/cal/e2.ics", &over, &[]).await;
    assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn test_well_known_redirect() {
    let dir = tempfile::tempdir().unwrap();
    let server = server(&dir);
    let resp = request(&server, "GET", "/.well-known/caldav", "", &[]).await;
    assert_eq!(resp.status(), StatusCode::MOVED_PERMANENTLY);
    assert_eq!(resp.headers().get("location").unwrap(), "/");
}

#[tokio::test]
async fn test_script_name_prefix() {
    let dir = tempfile::tempdir().unwrap();
    let server = server(&dir);
    let resp = request(
        &server,
        "PROPFIND",
        "/dav/alice/",
        "",
        &[("Depth", "0"), ("X-Script-Name", "/dav")],
    )
    .await;
    assert_eq!(resp.status(), StatusCode::MULTI_STATUS);
    assert!(body_str(&resp).contains("<D:href>/dav/alice/</D:href>"));
}

#[tokio::test]
async fn test_whole_collection_upload() {
    let dir = tempfile::tempdir().unwrap();
    let server = server(&dir);

    let stream = "BEGIN:VCALENDAR\r\nVERSION:2.0\r\n\
        BEGIN:VEVENT\r\nUID:a\r\nDTSTART:20240101T100000Z\r\nEND:VEVENT\r\n\
        BEGIN:VEVENT\r\nUID:b\r\nDTSTART:20240102T100000Z\r\nEND:VEVENT\r\n\
        END:VCALENDAR\r\n";
    let resp = request(&server, "PUT", "/alice/imported/", stream, &[]).await;
    assert_eq!(resp.status(), StatusCode::CREATED);

    let resp = request(&server, "PROPFIND", "/alice/imported/", "", &[("Depth", "1")]).await;
    let body = body_str(&resp);
    assert!(body.contains("/alice/imported/a.ics"));
    assert!(body.contains("/alice/imported/b.ics"));

    // duplicate UIDs in one upload are rejected.
    let dup = stream.replace("UID:b", "UID:a");
    let resp = request(&server, "PUT", "/alice/dup/", &dup, &[]).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_extra_response_headers() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config
        .headers
        .insert("Access-Control-Allow-Origin".to_string(), "*".to_string());
    let server = DavHandler::new(Arc::new(config)).unwrap();
    let resp = request(&server, "OPTIONS", "/", "", &[]).await;
    assert_eq!(
        resp.headers().get("access-control-allow-origin").unwrap(),
        "*"
    );
}

#[tokio::test]
async fn test_concurrent_puts() {
    let dir = tempfile::tempdir().unwrap();
    let server = server(&dir);
    make_calendar(&server, "/alice/cal/").await;

    let mut tasks = Vec::new();
    for i in 0..16 {
        let server = server.clone();
        tasks.push(tokio::spawn(async move {
            let body = EVENT.replace("UID:e1", &format!("UID:c{i}"));
            let uri = format!("/alice/cal/c{i}.ics");
            let resp = request(&server, "PUT", &uri, &body, &[]).await;
            assert_eq!(resp.status(), StatusCode::CREATED);
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    for i in 0..16 {
        let uri = format!("/alice/cal/c{i}.ics");
        let resp = request(&server, "GET", &uri, "", &[]).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
