//
// This module contains the main entry point of the library, DavHandler:
// it authenticates the request, resolves the path, takes the storage
// lock in the mode the method requires, and dispatches to the
// per-method handlers. A single top-level guard turns any DavError
// into the proper HTTP error response.
//
use std::io;
use std::sync::Arc;

use bytes::Buf;
use headers::HeaderMapExt;
use http::{header, Request, Response, StatusCode};
use http_body_util::BodyExt;
use log::{debug, error, info, warn};

use crate::auth::{parse_basic_authorization, Auth};
use crate::body::Body;
use crate::config::Config;
use crate::davheaders::XScriptName;
use crate::davpath::DavPath;
use crate::errors::DavError;
use crate::filters::ReportLimits;
use crate::hook::Hook;
use crate::rights::Rights;
use crate::storage::{Collection, PropMap, Storage};
use crate::storelock::StorageLock;
use crate::util::{dav_method, dav_xml_error, systemtime_to_httpdate, DavMethod};
use crate::DavResult;

/// The server handler. Cheap to clone; shared between connections.
#[derive(Clone)]
pub struct DavHandler {
    shared: Arc<Shared>,
}

struct Shared {
    config: Arc<Config>,
    storage: Arc<dyn Storage>,
    rights: Arc<dyn Rights>,
    auth: Arc<Auth>,
    lock: Arc<StorageLock>,
    hook: Option<Arc<Hook>>,
}

impl DavHandler {
    /// Wire up storage, auth and rights from the configuration.
    pub fn new(config: Arc<Config>) -> io::Result<DavHandler> {
        if !config.encoding.request.eq_ignore_ascii_case("utf-8")
            || !config.encoding.stock.eq_ignore_ascii_case("utf-8")
        {
            warn!("only utf-8 encoding is supported; non-utf-8 input is decoded lossily");
        }
        let storage = crate::storage::create(&config)?;
        let rights = crate::rights::create(&config).map_err(|e| {
            io::Error::new(io::ErrorKind::InvalidInput, e.to_string())
        })?;
        let auth = Arc::new(Auth::new(&config)?);
        let lock = Arc::new(StorageLock::new(std::path::Path::new(
            &config.storage.filesystem_folder,
        ))?);
        let hook = Hook::new(&config.storage.hook, &config.storage.filesystem_folder);
        Ok(DavHandler {
            shared: Arc::new(Shared {
                config,
                storage,
                rights,
                auth,
                lock,
                hook,
            }),
        })
    }

    pub fn hook(&self) -> Option<Arc<Hook>> {
        self.shared.hook.clone()
    }

    /// Handle one request. `source` is the peer address, used for
    /// logging and auth rate limiting.
    pub async fn handle<ReqBody, ReqData, ReqError>(
        &self,
        req: Request<ReqBody>,
        source: &str,
    ) -> Response<Body>
    where
        ReqData: Buf + Send,
        ReqBody: http_body::Body<Data = ReqData, Error = ReqError> + Send + Unpin,
    {
        let (parts, body) = req.into_parts();
        let req = Request::from_parts(parts, ());

        let mut resp = match self.handle2(&req, body, source).await {
            Ok(resp) => {
                debug!("== {} {} -> {}", req.method(), req.uri(), resp.status());
                resp
            }
            Err(err) => {
                debug!("== {} {} -> {}", req.method(), req.uri(), err);
                self.error_response(err)
            }
        };

        // HEAD gets every header of GET but no body.
        if req.method() == http::Method::HEAD {
            let len = resp.body().len();
            resp.headers_mut()
                .typed_insert(headers::ContentLength(len));
            resp.body_mut().clear();
        }
        for (name, value) in &self.shared.config.headers {
            if let (Ok(name), Ok(value)) = (
                header::HeaderName::try_from(name.as_str()),
                header::HeaderValue::try_from(value.as_str()),
            ) {
                resp.headers_mut().insert(name, value);
            }
        }
        if self.shared.config.logging.response_content_on_debug && !resp.body().is_empty() {
            debug!("response content: {}", String::from_utf8_lossy(&resp.body().to_bytes()));
        }
        resp
    }

    fn error_response(&self, err: DavError) -> Response<Body> {
        let status = err.statuscode();
        let mut builder = Response::builder().status(status);
        let body = match &err {
            DavError::Condition(_, element) => {
                builder = builder.header("content-type", "application/xml; charset=utf-8");
                dav_xml_error(element)
            }
            _ => Body::empty(),
        };
        if status == StatusCode::UNAUTHORIZED {
            let challenge = format!("Basic realm=\"{}\"", self.shared.auth.realm());
            builder = builder.header(header::WWW_AUTHENTICATE, challenge);
        }
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("internal server error: {}", err);
            if self.shared.config.logging.backtrace_on_debug {
                debug!("backtrace: {}", std::backtrace::Backtrace::force_capture());
            }
        }
        if err.must_close() {
            builder = builder.header(header::CONNECTION, "close");
        }
        builder.body(body).unwrap_or_else(|_| {
            let mut resp = Response::new(Body::empty());
            *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            resp
        })
    }

    async fn handle2<ReqBody, ReqData, ReqError>(
        &self,
        req: &Request<()>,
        body: ReqBody,
        source: &str,
    ) -> DavResult<Response<Body>>
    where
        ReqData: Buf + Send,
        ReqBody: http_body::Body<Data = ReqData, Error = ReqError> + Send + Unpin,
    {
        let shared = &self.shared;
        let method = dav_method(req.method())?;

        // reverse proxies hand us the mount point via X-Script-Name.
        let prefix = match req.headers().typed_get::<XScriptName>() {
            Some(XScriptName(p)) => {
                if !p.starts_with('/') || p.ends_with('/') {
                    warn!("invalid X-Script-Name {:?}", p);
                    return Err(StatusCode::BAD_REQUEST.into());
                }
                p
            }
            None => String::new(),
        };

        // clients discover the server through /.well-known.
        let raw_path = req.uri().path();
        if raw_path == "/.well-known/caldav" || raw_path == "/.well-known/carddav" {
            let resp = Response::builder()
                .status(StatusCode::MOVED_PERMANENTLY)
                .header(header::LOCATION, format!("{}/", prefix))
                .body(Body::empty())
                .unwrap();
            return Ok(resp);
        }

        let path = DavPath::from_uri(req.uri(), &prefix)?;

        let client = req
            .headers()
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
            .unwrap_or_else(|| source.to_string());
        debug!("== START {:?} {} (client {})", method, path, client);
        if shared.config.logging.request_header_on_debug {
            for (name, value) in req.headers() {
                if name == header::AUTHORIZATION && shared.config.logging.mask_passwords {
                    debug!("header {}: ***", name);
                } else {
                    debug!("header {}: {:?}", name, value);
                }
            }
        }

        let user = self.identify(req, &client).await?;
        if !user.is_empty() {
            self.ensure_principal(&user).await?;
        }

        let body_data = read_request(body, shared.config.server.max_content_length).await?;
        match method {
            DavMethod::Put
            | DavMethod::PropFind
            | DavMethod::PropPatch
            | DavMethod::Report
            | DavMethod::MkCol
            | DavMethod::MkCalendar => {}
            _ => {
                if !body_data.is_empty() {
                    return Err(DavError::StatusClose(StatusCode::UNSUPPORTED_MEDIA_TYPE));
                }
            }
        }
        if shared.config.logging.request_content_on_debug && !body_data.is_empty() {
            debug!("request content: {}", String::from_utf8_lossy(&body_data));
        }

        let guard = shared.lock.acquire(method.is_write()).await?;
        let inner = DavInner {
            config: shared.config.clone(),
            storage: shared.storage.clone(),
            rights: shared.rights.clone(),
            user: user.clone(),
            prefix: prefix.clone(),
        };
        let result = match method {
            DavMethod::Options => inner.handle_options(req, &path),
            DavMethod::Head | DavMethod::Get => inner.handle_get(req, &path),
            DavMethod::Put => inner.handle_put(req, &path, &body_data),
            DavMethod::Delete => inner.handle_delete(req, &path),
            DavMethod::MkCol => inner.handle_mkcol(&path, &body_data, false),
            DavMethod::MkCalendar => inner.handle_mkcol(&path, &body_data, true),
            DavMethod::Move => inner.handle_move(req, &path),
            DavMethod::PropFind => inner.handle_propfind(req, &path, &body_data),
            DavMethod::PropPatch => inner.handle_proppatch(&path, &body_data),
            DavMethod::Report => inner.handle_report(&path, &body_data),
        };
        if method.is_write() && result.is_ok() {
            if let Some(hook) = &shared.hook {
                // the hook runs while the exclusive lock is held.
                hook.run(&user).await;
            }
        }
        drop(guard);

        let mut resp = result?;
        if !resp.headers().contains_key(header::DATE) {
            let now = systemtime_to_httpdate(std::time::SystemTime::now());
            if let Ok(value) = header::HeaderValue::try_from(now) {
                resp.headers_mut().insert(header::DATE, value);
            }
        }
        Ok(resp)
    }

    // figure out who is asking, per the configured auth type.
    async fn identify(&self, req: &Request<()>, source: &str) -> DavResult<String> {
        let auth = &self.shared.auth;
        match auth.auth_type() {
            "remote_user" => Ok(std::env::var("REMOTE_USER").unwrap_or_default()),
            "http_x_remote_user" => Ok(req
                .headers()
                .get("x-remote-user")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string()),
            _ => {
                let header_value = req
                    .headers()
                    .get(header::AUTHORIZATION)
                    .and_then(|v| v.to_str().ok());
                match header_value {
                    Some(value) => match parse_basic_authorization(value) {
                        Some((login, password)) => {
                            let user = auth.login(&login, &password, source).await;
                            if user.is_empty() {
                                Err(DavError::Unauthorized)
                            } else {
                                if user != login {
                                    info!("authenticated {:?} as {:?}", login, user);
                                }
                                Ok(user)
                            }
                        }
                        None => Err(DavError::Unauthorized),
                    },
                    None => Ok(String::new()),
                }
            }
        }
    }

    // the principal collection springs into existence on the first
    // authenticated request.
    async fn ensure_principal(&self, user: &str) -> DavResult<()> {
        let shared = &self.shared;
        if crate::multifs::check_path(user).is_err() {
            warn!("cannot create principal collection for unsafe user name {:?}", user);
            return Ok(());
        }
        {
            let _guard = shared.lock.acquire(false).await?;
            if shared.storage.collection(user)?.is_some() {
                return Ok(());
            }
        }
        let _guard = shared.lock.acquire(true).await?;
        if shared.storage.collection(user)?.is_none() {
            info!("creating principal collection for {:?}", user);
            shared.storage.create_collection(user, None, PropMap::new())?;
        }
        Ok(())
    }
}

// read and buffer the request body, enforcing max_content_length.
async fn read_request<ReqBody, ReqData, ReqError>(
    mut body: ReqBody,
    max_size: usize,
) -> DavResult<Vec<u8>>
where
    ReqData: Buf + Send,
    ReqBody: http_body::Body<Data = ReqData, Error = ReqError> + Send + Unpin,
{
    let mut data = Vec::new();
    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(|_| DavError::BodyRead)?;
        if let Ok(mut buf) = frame.into_data() {
            if data.len() + buf.remaining() > max_size {
                return Err(DavError::StatusClose(StatusCode::PAYLOAD_TOO_LARGE));
            }
            let chunk = buf.copy_to_bytes(buf.remaining());
            data.extend_from_slice(&chunk);
        }
    }
    Ok(data)
}

// Per-request state handed to the method handlers.
pub(crate) struct DavInner {
    pub config: Arc<Config>,
    pub storage: Arc<dyn Storage>,
    pub rights: Arc<dyn Rights>,
    pub user: String,
    pub prefix: String,
}

impl DavInner {
    /// An absolute href below the base prefix.
    pub(crate) fn href(&self, path: &str) -> String {
        format!("{}{}", self.prefix, path)
    }

    pub(crate) fn limits(&self) -> ReportLimits {
        ReportLimits {
            max_occurrences: self.config.reporting.max_occurrences,
            max_freebusy_occurrences: self.config.reporting.max_freebusy_occurrences,
        }
    }

    pub(crate) fn authorization(&self, path: &str) -> String {
        self.rights.authorization(&self.user, path)
    }

    /// 401 for the anonymous, 403 for everyone else.
    pub(crate) fn access_denied(&self) -> DavError {
        if self.user.is_empty() {
            DavError::Unauthorized
        } else {
            DavError::Status(StatusCode::FORBIDDEN)
        }
    }

    pub(crate) fn can_read(&self, path: &str, leaf: bool) -> bool {
        let perms = self.authorization(path);
        perms.contains(if leaf { 'r' } else { 'R' })
    }

    /// GET/HEAD also honor the `i` (read-only http) permission.
    pub(crate) fn can_read_http(&self, path: &str, leaf: bool) -> bool {
        self.can_read(path, leaf) || self.authorization(path).contains('i')
    }

    pub(crate) fn can_write(&self, path: &str, leaf: bool) -> bool {
        let perms = self.authorization(path);
        perms.contains(if leaf { 'w' } else { 'W' })
    }

    /// Deleting a collection needs `permit_delete_collection` or a
    /// `D`/`d` grant for this path.
    pub(crate) fn can_delete_collection(&self, col: &Collection) -> bool {
        let leaf = col.tag.is_some();
        if !self.can_write(&col.path, leaf) {
            return false;
        }
        self.config.rights.permit_delete_collection
            || self
                .authorization(&col.path)
                .contains(if leaf { 'd' } else { 'D' })
    }

    /// Overwriting an existing collection (whole-collection PUT, and
    /// MOVE onto an existing target) needs `permit_overwrite_collection`
    /// or an `O`/`o` grant.
    pub(crate) fn can_overwrite_collection(&self, path: &str, leaf: bool) -> bool {
        self.config.rights.permit_overwrite_collection
            || self.authorization(path).contains(if leaf { 'o' } else { 'O' })
    }

    /// Is the target allowed to learn that a resource does not exist?
    /// 404 leaks existence; rights decide whether that is acceptable.
    pub(crate) fn not_found(&self, path: &str) -> DavError {
        if self.can_read(path, true) || self.can_read(path, false) {
            DavError::Status(StatusCode::NOT_FOUND)
        } else {
            self.access_denied()
        }
    }
}
