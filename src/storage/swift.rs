//! OpenStack Swift storage backend over plain HTTP
//!
//! Objects live at `{storage_url}/{container}/{name}`; large objects are
//! Dynamic Large Objects: numbered segments in `{container}_segments` plus a
//! zero-byte manifest carrying `X-Object-Manifest`.

use super::traits::{ByteStream, ObjectStore, PutOptions, StorageError};
use crate::auth::TokenProvider;
use crate::types::{ObjectPath, SegmentPrefix};
use async_trait::async_trait;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

const AUTH_TOKEN_HEADER: &str = "X-Auth-Token";
const MANIFEST_HEADER: &str = "X-Object-Manifest";

/// Swift object storage backend
pub struct SwiftBackend {
    client: Client,
    /// Account URL template; `{project}` is replaced per request.
    storage_url: String,
    tokens: Arc<dyn TokenProvider>,
}

impl SwiftBackend {
    pub fn new(
        storage_url: String,
        timeout_secs: u64,
        tokens: Arc<dyn TokenProvider>,
    ) -> Result<Self, StorageError> {
        // No total-request timeout: a streamed single write can legitimately
        // run for a long time. Stalls are caught by the read timeout.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(timeout_secs))
            .read_timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| StorageError::Http(e.to_string()))?;
        debug!("SwiftBackend initialized for {}", storage_url);
        Ok(Self {
            client,
            storage_url,
            tokens,
        })
    }

    fn account_url(&self, account: &str) -> String {
        self.storage_url
            .replace("{project}", account)
            .trim_end_matches('/')
            .to_string()
    }

    fn container_url(&self, account: &str, container: &str) -> String {
        format!(
            "{}/{}",
            self.account_url(account),
            urlencoding::encode(container)
        )
    }

    /// Object URL; each `/`-separated component of the name is encoded on
    /// its own so pseudo-directories survive.
    fn object_url(&self, path: &ObjectPath) -> String {
        let name = path
            .name
            .split('/')
            .map(|part| urlencoding::encode(part).into_owned())
            .collect::<Vec<_>>()
            .join("/");
        format!(
            "{}/{}",
            self.container_url(&path.account, &path.container),
            name
        )
    }

    async fn authorized(
        &self,
        method: Method,
        url: &str,
    ) -> Result<RequestBuilder, StorageError> {
        let mut req = self.client.request(method, url);
        if let Some(token) = self.tokens.token().await? {
            req = req.header(AUTH_TOKEN_HEADER, token);
        }
        Ok(req)
    }

    /// Send a request without a streamed body, refreshing the token once
    /// on 401. Streamed PUTs cannot be replayed and go through `authorized`.
    async fn replayable(
        &self,
        method: Method,
        url: &str,
        extra: &[(&str, String)],
        context: &str,
    ) -> Result<Response, StorageError> {
        let mut reauthed = false;
        loop {
            let mut req = self.authorized(method.clone(), url).await?;
            for (name, value) in extra {
                req = req.header(*name, value.as_str());
            }
            let resp = req.send().await.map_err(|e| classify_reqwest(e, context))?;
            if resp.status() == StatusCode::UNAUTHORIZED && !reauthed {
                warn!("{} got 401, refreshing token and retrying", context);
                self.tokens.invalidate();
                reauthed = true;
                continue;
            }
            return Ok(resp);
        }
    }
}

fn classify_reqwest(e: reqwest::Error, context: &str) -> StorageError {
    if e.is_timeout() {
        StorageError::Timeout(format!("{}: {}", context, e))
    } else {
        StorageError::Http(format!("{}: {}", context, e))
    }
}

fn classify_status(status: StatusCode, context: &str) -> StorageError {
    match status {
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
            StorageError::Timeout(format!("{} returned {}", context, status))
        }
        StatusCode::NOT_FOUND => StorageError::NotFound(context.to_string()),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            StorageError::Auth(format!("{} returned {}", context, status))
        }
        _ => StorageError::Rejected {
            status: status.as_u16(),
            context: context.to_string(),
        },
    }
}

#[async_trait]
impl ObjectStore for SwiftBackend {
    #[instrument(skip(self), fields(path = %path))]
    async fn head_object(&self, path: &ObjectPath) -> Result<bool, StorageError> {
        let url = self.object_url(path);
        let resp = self.replayable(Method::HEAD, &url, &[], "HEAD object").await?;
        match resp.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            s => Err(classify_status(s, "HEAD object")),
        }
    }

    #[instrument(skip(self), fields(container = %prefix.container, prefix = %prefix.prefix))]
    async fn list_segments(&self, prefix: &SegmentPrefix) -> Result<Vec<String>, StorageError> {
        let base = self.container_url(&prefix.account, &prefix.container);
        let mut names = Vec::new();
        let mut marker: Option<String> = None;

        // Swift pages listings (10k names by default); follow markers until
        // a page comes back empty.
        loop {
            let mut url = format!(
                "{}?format=plain&prefix={}",
                base,
                urlencoding::encode(&prefix.prefix)
            );
            if let Some(ref m) = marker {
                url.push_str(&format!("&marker={}", urlencoding::encode(m)));
            }

            let resp = self
                .replayable(Method::GET, &url, &[], "GET segment listing")
                .await?;
            let status = resp.status();
            if status == StatusCode::NOT_FOUND {
                // Segment container not created yet
                return Ok(names);
            }
            if status == StatusCode::NO_CONTENT {
                break;
            }
            if !status.is_success() {
                return Err(classify_status(status, "GET segment listing"));
            }

            let body = resp
                .text()
                .await
                .map_err(|e| classify_reqwest(e, "GET segment listing"))?;
            let page: Vec<String> = body
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect();
            match page.last() {
                Some(last) => marker = Some(last.clone()),
                None => break,
            }
            names.extend(page);
        }

        debug!("Listed {} segments", names.len());
        Ok(names)
    }

    #[instrument(skip(self, body), fields(path = %path))]
    async fn put_object(
        &self,
        path: &ObjectPath,
        body: ByteStream,
        opts: PutOptions,
    ) -> Result<(), StorageError> {
        let url = self.object_url(path);
        let mut req = self.authorized(Method::PUT, &url).await?;
        if let Some(len) = opts.content_length {
            req = req.header(CONTENT_LENGTH, len);
        }
        if let Some(ct) = opts.content_type.as_deref().filter(|ct| !ct.is_empty()) {
            req = req.header(CONTENT_TYPE, ct);
        }

        let resp = req
            .body(reqwest::Body::wrap_stream(body))
            .send()
            .await
            .map_err(|e| classify_reqwest(e, "PUT object"))?;

        match resp.status() {
            StatusCode::CREATED => Ok(()),
            s => Err(classify_status(s, "PUT object")),
        }
    }

    #[instrument(skip(self), fields(path = %path, segments = %segments.manifest_value()))]
    async fn put_manifest(
        &self,
        path: &ObjectPath,
        segments: &SegmentPrefix,
        content_type: Option<String>,
    ) -> Result<(), StorageError> {
        let url = self.object_url(path);
        let mut headers = vec![
            (MANIFEST_HEADER, segments.manifest_value()),
            ("Content-Length", "0".to_string()),
        ];
        if let Some(ct) = content_type.filter(|ct| !ct.is_empty()) {
            headers.push(("Content-Type", ct));
        }

        let resp = self
            .replayable(Method::PUT, &url, &headers, "PUT manifest")
            .await?;
        match resp.status() {
            StatusCode::CREATED => Ok(()),
            s => Err(classify_status(s, "PUT manifest")),
        }
    }

    fn kind(&self) -> &'static str {
        "swift"
    }
}
