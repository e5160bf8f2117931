use reqwest::{Client, Method, Response, StatusCode};
use thiserror::Error;
use tracing::debug;
use url::Url;

#[derive(Debug, Error)]
pub enum DavError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("path cannot be mapped onto the server url: {0}")]
    Path(String),
}

/// How a transport outcome affects the item and the run. `Soft` and
/// `Normal` fail the item only; `Fatal` aborts the whole propagation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Success,
    Soft,
    Normal,
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classified {
    pub class: ErrorClass,
    pub message: Option<String>,
}

impl Classified {
    fn ok() -> Self {
        Self {
            class: ErrorClass::Success,
            message: None,
        }
    }

    fn err(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: Some(message.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.class == ErrorClass::Success
    }
}

/// Identifies one chunk of a logical upload. `count == 1` produces a plain
/// PUT to the resource path; larger transfers address per-chunk URIs tied
/// together by the transfer id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkMeta {
    pub transfer_id: u32,
    pub index: u32,
    pub count: u32,
}

#[derive(Clone)]
pub struct DavClient {
    http: Client,
    base_url: Url,
    username: String,
    password: String,
}

impl DavClient {
    pub fn new(
        base_url: &str,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self, DavError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
            username: username.into(),
            password: password.into(),
        })
    }

    pub fn with_http(mut self, http: Client) -> Self {
        self.http = http;
        self
    }

    /// Maps a `/`-separated sync path onto the server url, percent-encoding
    /// each segment.
    pub fn url_for(&self, path: &str) -> Result<Url, DavError> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| DavError::Path(path.to_string()))?;
            segments.pop_if_empty();
            for part in path.split('/').filter(|part| !part.is_empty()) {
                segments.push(part);
            }
        }
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> reqwest::RequestBuilder {
        self.http
            .request(method, url)
            .basic_auth(&self.username, Some(&self.password))
    }

    /// GET the resource body. Setting `Accept-Encoding` by hand keeps
    /// reqwest from transparently decoding; the caller inspects
    /// `Content-Encoding` and installs the matching body sink.
    pub async fn get(&self, path: &str, resume_from: Option<u64>) -> Result<Response, DavError> {
        let mut req = self
            .request(Method::GET, self.url_for(path)?)
            .header("Accept-Encoding", "gzip");
        if let Some(offset) = resume_from {
            req = req
                .header("Range", format!("bytes={offset}-"))
                .header("Accept-Ranges", "bytes");
        }
        Ok(req.send().await?)
    }

    pub async fn put_chunk(
        &self,
        path: &str,
        chunk: ChunkMeta,
        body: Vec<u8>,
        previous_etag: Option<&str>,
        modtime: i64,
    ) -> Result<Response, DavError> {
        let url = if chunk.count > 1 {
            self.url_for(&format!(
                "{path}-chunking-{}-{}-{}",
                chunk.transfer_id, chunk.count, chunk.index
            ))?
        } else {
            self.url_for(path)?
        };
        debug!(%url, "PUT request");
        let mut req = self
            .request(Method::PUT, url)
            .header("X-OC-MTime", modtime.to_string());
        if chunk.count > 1 {
            req = req.header("OC-Chunked", "1");
        }
        if let Some(etag) = previous_etag {
            // The server wraps etags in double quotes on the wire; ours are
            // stored stripped.
            req = req.header("If-Match", format!("\"{etag}\""));
        }
        Ok(req.body(body).send().await?)
    }

    pub async fn delete(&self, path: &str) -> Result<Response, DavError> {
        Ok(self
            .request(Method::DELETE, self.url_for(path)?)
            .send()
            .await?)
    }

    pub async fn mkcol(&self, path: &str) -> Result<Response, DavError> {
        Ok(self
            .request(dav_method("MKCOL"), self.url_for(path)?)
            .send()
            .await?)
    }

    pub async fn move_to(&self, from: &str, to: &str) -> Result<Response, DavError> {
        let destination = self.url_for(to)?;
        debug!(from, to, "MOVE request");
        Ok(self
            .request(dav_method("MOVE"), self.url_for(from)?)
            .header("Destination", destination.to_string())
            .header("Overwrite", "T")
            .send()
            .await?)
    }

    /// PROPPATCH of `DAV:lastmodified` to the UNIX-seconds value.
    pub async fn proppatch_mtime(&self, path: &str, modtime: i64) -> Result<Response, DavError> {
        let body = format!(
            "<?xml version=\"1.0\"?>\
             <d:propertyupdate xmlns:d=\"DAV:\">\
             <d:set><d:prop><d:lastmodified>{modtime}</d:lastmodified></d:prop></d:set>\
             </d:propertyupdate>"
        );
        Ok(self
            .request(dav_method("PROPPATCH"), self.url_for(path)?)
            .header("Content-Type", "text/xml; charset=utf-8")
            .body(body)
            .send()
            .await?)
    }

    pub async fn head(&self, path: &str) -> Result<Response, DavError> {
        Ok(self
            .request(Method::HEAD, self.url_for(path)?)
            .send()
            .await?)
    }
}

fn dav_method(name: &'static str) -> Method {
    Method::from_bytes(name.as_bytes()).expect("static method name")
}

/// The server double-quotes etag values on the wire; the engine stores them
/// stripped.
pub fn response_etag(response: &Response) -> Option<String> {
    let raw = response.headers().get("etag")?.to_str().ok()?;
    Some(strip_etag_quotes(raw).to_string())
}

pub fn strip_etag_quotes(raw: &str) -> &str {
    raw.strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
        .unwrap_or(raw)
}

pub fn response_file_id(response: &Response) -> Option<String> {
    let raw = response.headers().get("OC-FileId")?.to_str().ok()?;
    Some(raw.to_string())
}

/// Whether the server accepted the client-supplied modification time sent
/// with the upload. When it did, the response etag is final and no
/// PROPPATCH round-trip is needed.
pub fn mtime_accepted(response: &Response) -> bool {
    response
        .headers()
        .get("X-OC-MTime")
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.eq_ignore_ascii_case("accepted"))
}

/// Maps a transport outcome to an error class, honoring a per-call
/// "ignore this status" exemption (404 on DELETE, 405 on MKCOL).
pub fn classify(
    outcome: Result<StatusCode, &DavError>,
    ignore_status: Option<StatusCode>,
) -> Classified {
    match outcome {
        Ok(status) => classify_status(status, ignore_status),
        Err(err) => classify_error(err, ignore_status),
    }
}

pub fn classify_status(status: StatusCode, ignore_status: Option<StatusCode>) -> Classified {
    if status.is_success() || Some(status) == ignore_status {
        return Classified::ok();
    }
    let reason = status
        .canonical_reason()
        .map(str::to_string)
        .unwrap_or_else(|| status.as_str().to_string());
    // Neon surfaced authentication trouble as transport-level failures that
    // abort the run; over plain HTTP those arrive as statuses.
    if matches!(
        status,
        StatusCode::UNAUTHORIZED | StatusCode::PROXY_AUTHENTICATION_REQUIRED
    ) {
        return Classified::err(ErrorClass::Fatal, reason);
    }
    if status.is_redirection() || status == StatusCode::PRECONDITION_FAILED {
        return Classified::err(ErrorClass::Soft, reason);
    }
    Classified::err(ErrorClass::Normal, reason)
}

pub fn classify_error(err: &DavError, ignore_status: Option<StatusCode>) -> Classified {
    match err {
        DavError::Request(req_err) => {
            if let Some(status) = req_err.status()
                && Some(status) == ignore_status
            {
                return Classified::ok();
            }
            if req_err.is_timeout() || req_err.is_connect() {
                return Classified::err(ErrorClass::Fatal, req_err.to_string());
            }
            if req_err.is_redirect() {
                return Classified::err(ErrorClass::Soft, req_err.to_string());
            }
            Classified::err(ErrorClass::Normal, req_err.to_string())
        }
        DavError::Url(_) | DavError::Path(_) => {
            Classified::err(ErrorClass::Normal, err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_for_percent_encodes_segments() {
        let client = DavClient::new("http://server/remote.php/webdav", "u", "p").unwrap();
        let url = client.url_for("Docs/Hello World.txt").unwrap();
        assert_eq!(
            url.as_str(),
            "http://server/remote.php/webdav/Docs/Hello%20World.txt"
        );
    }

    #[test]
    fn url_for_keeps_base_path() {
        let client = DavClient::new("http://server/remote.php/webdav/", "u", "p").unwrap();
        let url = client.url_for("a/b").unwrap();
        assert_eq!(url.as_str(), "http://server/remote.php/webdav/a/b");
    }

    #[test]
    fn strip_etag_quotes_removes_surrounding_quotes_only() {
        assert_eq!(strip_etag_quotes("\"abc123\""), "abc123");
        assert_eq!(strip_etag_quotes("abc123"), "abc123");
        assert_eq!(strip_etag_quotes("\"unterminated"), "\"unterminated");
    }

    #[test]
    fn classify_success_and_ignored_status() {
        assert!(classify_status(StatusCode::CREATED, None).is_success());
        assert!(classify_status(StatusCode::NOT_FOUND, Some(StatusCode::NOT_FOUND)).is_success());
        assert!(
            classify_status(StatusCode::METHOD_NOT_ALLOWED, Some(StatusCode::METHOD_NOT_ALLOWED))
                .is_success()
        );
    }

    #[test]
    fn classify_auth_statuses_are_fatal() {
        assert_eq!(
            classify_status(StatusCode::UNAUTHORIZED, None).class,
            ErrorClass::Fatal
        );
        assert_eq!(
            classify_status(StatusCode::PROXY_AUTHENTICATION_REQUIRED, None).class,
            ErrorClass::Fatal
        );
    }

    #[test]
    fn classify_redirect_and_precondition_are_soft() {
        assert_eq!(
            classify_status(StatusCode::MOVED_PERMANENTLY, None).class,
            ErrorClass::Soft
        );
        assert_eq!(
            classify_status(StatusCode::PRECONDITION_FAILED, None).class,
            ErrorClass::Soft
        );
    }

    #[test]
    fn classify_other_statuses_are_normal_with_reason() {
        let classified = classify_status(StatusCode::INTERNAL_SERVER_ERROR, None);
        assert_eq!(classified.class, ErrorClass::Normal);
        assert_eq!(classified.message.as_deref(), Some("Internal Server Error"));
    }
}
