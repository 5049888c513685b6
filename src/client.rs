//! Authenticated, retrying HTTP client for the database API
//!
//! One [`CouchClient`] wraps a keep-alive connection pool sized to the
//! pipeline's parallelism and exposes the typed operations the pipelines
//! need. Every operation classifies failures through a single status
//! conversion point and retries transient ones per the configured policy.

use crate::config::RetryConfig;
use crate::error::{Error, Result};
use crate::retry::with_retry;
use crate::types::{DatabaseInfo, DocumentRef};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// User-Agent sent with every request
const USER_AGENT: &str = concat!(
    "couchbackup-cloudant/",
    env!("CARGO_PKG_VERSION"),
    " (rust-tokio)"
);

/// Default IAM token endpoint, overridable via `CLOUDANT_IAM_TOKEN_URL`
const DEFAULT_IAM_TOKEN_URL: &str = "https://iam.cloud.ibm.com/identity/token";

/// Connection options for [`CouchClient::connect`]
#[derive(Clone, Debug)]
pub struct ClientOptions {
    /// Keep-alive pool size hint; matches the pipeline's parallelism
    pub parallelism: usize,
    /// Per-attempt request timeout
    pub request_timeout: Option<Duration>,
    /// IAM API key, exchanged for a bearer token before the first request
    pub iam_api_key: Option<String>,
    /// Retry policy for transient failures
    pub retry: RetryConfig,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            parallelism: 5,
            request_timeout: Some(Duration::from_millis(120_000)),
            iam_api_key: None,
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug)]
struct ClientInner {
    http: reqwest::Client,
    /// Server root, credentials stripped
    server: Url,
    /// Database path segment as it appears in request paths
    db_segment: String,
    /// Human-readable database name (decoded segment)
    db_name: String,
    /// Bearer token from the IAM exchange, when IAM auth is in use
    bearer: Option<String>,
    retry: RetryConfig,
    request_timeout: Option<Duration>,
}

/// Handle to one database on one server
///
/// Cheap to clone; all clones share the connection pool and session state.
#[derive(Clone, Debug)]
pub struct CouchClient {
    inner: Arc<ClientInner>,
}

impl CouchClient {
    /// Connect to the database at `url` and authenticate.
    ///
    /// The URL names the database as its final path segment and may embed
    /// user-info credentials, which trigger a cookie session login
    /// (`POST /_session`). An IAM API key in the options is exchanged for a
    /// bearer token instead. The credentials never appear in later request
    /// URLs or log output.
    pub async fn connect(url: &str, options: ClientOptions) -> Result<Self> {
        let parsed = Url::parse(url)
            .map_err(|e| Error::InvalidOption(format!("invalid database URL: {e}")))?;

        let username = parsed.username().to_string();
        let password = parsed.password().map(str::to_string);

        let db_segment = parsed
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .ok_or_else(|| {
                Error::InvalidOption("database URL must include a database name".into())
            })?;
        let db_name = urlencoding::decode(&db_segment)
            .map(|s| s.into_owned())
            .unwrap_or_else(|_| db_segment.clone());

        let mut server = parsed.clone();
        server.set_username("").ok();
        server.set_password(None).ok();
        {
            let mut segments = server
                .path_segments_mut()
                .map_err(|_| Error::InvalidOption("database URL cannot be a base".into()))?;
            segments.pop();
        }

        let mut builder = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .gzip(true)
            .cookie_store(true)
            .pool_max_idle_per_host(options.parallelism.max(1));
        if let Some(timeout) = options.request_timeout {
            builder = builder.connect_timeout(timeout);
        }
        let http = builder.build()?;

        let bearer = match options.iam_api_key.as_deref() {
            Some(api_key) => Some(exchange_iam_key(&http, &options.retry, api_key).await?),
            None => None,
        };

        let client = Self {
            inner: Arc::new(ClientInner {
                http,
                server,
                db_segment,
                db_name,
                bearer,
                retry: options.retry,
                request_timeout: options.request_timeout,
            }),
        };

        if client.inner.bearer.is_none() && !username.is_empty() {
            client
                .session_login(&username, password.as_deref().unwrap_or(""))
                .await?;
        }

        Ok(client)
    }

    /// Human-readable name of the database this handle points at
    pub fn db_name(&self) -> &str {
        &self.inner.db_name
    }

    /// `HEAD /<db>` — existence and access check.
    pub async fn head_database(&self) -> Result<()> {
        let path = self.db_path("");
        with_retry(&self.inner.retry, || async {
            let resp = self.request(reqwest::Method::HEAD, &path).send().await?;
            match resp.status().as_u16() {
                404 => Err(Error::DatabaseNotFound {
                    db: self.inner.db_name.clone(),
                }),
                _ => check_status(resp, "head", &path).await.map(|_| ()),
            }
        })
        .await
    }

    /// `GET /<db>` — database metadata.
    pub async fn get_database(&self) -> Result<DatabaseInfo> {
        let path = self.db_path("");
        with_retry(&self.inner.retry, || async {
            let resp = self.request(reqwest::Method::GET, &path).send().await?;
            if resp.status().as_u16() == 404 {
                return Err(Error::DatabaseNotFound {
                    db: self.inner.db_name.clone(),
                });
            }
            let resp = check_status(resp, "get", &path).await?;
            Ok(resp.json::<DatabaseInfo>().await?)
        })
        .await
    }

    /// `POST /<db>/_changes` — the full changes feed as a streaming response.
    ///
    /// The caller consumes the body incrementally; the per-attempt timeout
    /// is not applied here since spool time grows with database size.
    pub async fn post_changes(&self, since: &str, seq_interval: usize) -> Result<reqwest::Response> {
        let path = self.db_path("/_changes");
        with_retry(&self.inner.retry, || async {
            let resp = self
                .untimed_request(reqwest::Method::POST, &path)
                .query(&[
                    ("seq_interval", seq_interval.to_string().as_str()),
                    ("since", since),
                ])
                .json(&json!({}))
                .send()
                .await?;
            check_status(resp, "post", &path).await
        })
        .await
    }

    /// `POST /<db>/_bulk_get` — fetch full bodies for a list of references.
    ///
    /// Returns only the `ok` rows. A 404 means the server predates the
    /// endpoint and is reported as [`Error::BulkGet`].
    pub async fn post_bulk_get(
        &self,
        refs: &[DocumentRef],
        attachments: bool,
    ) -> Result<Vec<Value>> {
        let path = self.db_path("/_bulk_get");
        let mut query = vec![("revs", "true")];
        if attachments {
            query.push(("attachments", "true"));
        }
        with_retry(&self.inner.retry, || async {
            let resp = self
                .request(reqwest::Method::POST, &path)
                .query(&query)
                .json(&json!({ "docs": refs }))
                .send()
                .await?;
            if resp.status().as_u16() == 404 {
                return Err(Error::BulkGet {
                    db: self.inner.db_name.clone(),
                });
            }
            let resp = check_status(resp, "post", &path).await?;
            let body: Value = resp.json().await?;
            Ok(extract_bulk_get_docs(&body))
        })
        .await
    }

    /// `POST /<db>/_bulk_docs` — write a batch of documents.
    ///
    /// Returns the server's per-document result array.
    pub async fn post_bulk_docs(&self, docs: &[Value], new_edits: bool) -> Result<Vec<Value>> {
        let path = self.db_path("/_bulk_docs");
        with_retry(&self.inner.retry, || async {
            let resp = self
                .request(reqwest::Method::POST, &path)
                .json(&json!({ "docs": docs, "new_edits": new_edits }))
                .send()
                .await?;
            let resp = check_status(resp, "post", &path).await?;
            let body: Value = resp.json().await?;
            Ok(body.as_array().cloned().unwrap_or_default())
        })
        .await
    }

    /// `POST /<db>/_all_docs` — one page of winning revisions.
    pub async fn post_all_docs(&self, limit: usize, start_key: Option<&str>) -> Result<Vec<Value>> {
        let path = self.db_path("/_all_docs");
        let mut body = json!({ "limit": limit, "include_docs": true });
        if let Some(key) = start_key {
            body["start_key"] = Value::String(key.to_string());
        }
        with_retry(&self.inner.retry, || async {
            let resp = self
                .request(reqwest::Method::POST, &path)
                .json(&body)
                .send()
                .await?;
            let resp = check_status(resp, "post", &path).await?;
            let page: Value = resp.json().await?;
            let docs = page
                .get("rows")
                .and_then(Value::as_array)
                .map(|rows| {
                    rows.iter()
                        .filter_map(|row| row.get("doc").filter(|d| !d.is_null()).cloned())
                        .collect()
                })
                .unwrap_or_default();
            Ok(docs)
        })
        .await
    }

    /// `GET /<db>/<docId>/<attName>` — raw attachment body.
    pub async fn get_attachment(&self, doc_id: &str, name: &str) -> Result<Vec<u8>> {
        let path = self.db_path(&format!(
            "/{}/{}",
            urlencoding::encode(doc_id),
            urlencoding::encode(name)
        ));
        with_retry(&self.inner.retry, || async {
            let resp = self.request(reqwest::Method::GET, &path).send().await?;
            let resp = check_status(resp, "get", &path).await?;
            Ok(resp.bytes().await?.to_vec())
        })
        .await
    }

    /// `GET /_session` — current session details.
    pub async fn get_session(&self) -> Result<Value> {
        let path = "/_session";
        with_retry(&self.inner.retry, || async {
            let resp = self.request(reqwest::Method::GET, path).send().await?;
            let resp = check_status(resp, "get", path).await?;
            Ok(resp.json().await?)
        })
        .await
    }

    /// Cookie login with user-info credentials from the URL.
    async fn session_login(&self, name: &str, password: &str) -> Result<()> {
        let path = "/_session";
        with_retry(&self.inner.retry, || async {
            let resp = self
                .request(reqwest::Method::POST, path)
                .json(&json!({ "name": name, "password": password }))
                .send()
                .await?;
            check_status(resp, "post", path).await.map(|_| ())
        })
        .await?;
        tracing::debug!(user = name, "Session cookie established");
        Ok(())
    }

    /// Build a request with auth and the per-attempt timeout.
    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self.untimed_request(method, path);
        if let Some(timeout) = self.inner.request_timeout {
            builder = builder.timeout(timeout);
        }
        builder
    }

    /// Build a request with auth but no whole-request timeout.
    fn untimed_request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self.inner.http.request(method, self.abs(path));
        if let Some(token) = &self.inner.bearer {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    fn abs(&self, path: &str) -> Url {
        let mut url = self.inner.server.clone();
        url.set_path(path);
        url
    }

    fn db_path(&self, suffix: &str) -> String {
        format!("/{}{}", self.inner.db_segment, suffix)
    }
}

/// Single conversion point from HTTP responses to the error taxonomy.
async fn check_status(
    resp: reqwest::Response,
    method: &'static str,
    path: &str,
) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    match status.as_u16() {
        401 => Err(Error::Unauthorized {
            message: error_reason(resp).await,
        }),
        403 => Err(Error::Forbidden {
            message: error_reason(resp).await,
        }),
        code => Err(Error::http(code, method, path)),
    }
}

/// Best-effort extraction of the server's `reason` field from an error body.
async fn error_reason(resp: reqwest::Response) -> String {
    let status = resp.status();
    match resp.json::<Value>().await {
        Ok(body) => body
            .get("reason")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| status.to_string()),
        Err(_) => status.to_string(),
    }
}

/// Exchange an IAM API key for a bearer token.
async fn exchange_iam_key(
    http: &reqwest::Client,
    retry: &RetryConfig,
    api_key: &str,
) -> Result<String> {
    let token_url = std::env::var("CLOUDANT_IAM_TOKEN_URL")
        .unwrap_or_else(|_| DEFAULT_IAM_TOKEN_URL.to_string());
    let token = with_retry(retry, || async {
        let resp = http
            .post(&token_url)
            .form(&[
                ("grant_type", "urn:ibm:params:oauth:grant-type:apikey"),
                ("apikey", api_key),
            ])
            .send()
            .await?;
        let resp = check_status(resp, "post", "/identity/token").await?;
        let body: Value = resp.json().await?;
        body.get("access_token")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::Unauthorized {
                message: "IAM token response had no access_token".into(),
            })
    })
    .await?;
    tracing::debug!("IAM bearer token acquired");
    Ok(token)
}

/// Flatten a `_bulk_get` response into its `ok` documents.
fn extract_bulk_get_docs(body: &Value) -> Vec<Value> {
    body.get("results")
        .and_then(Value::as_array)
        .map(|results| {
            results
                .iter()
                .filter_map(|result| result.get("docs").and_then(Value::as_array))
                .flatten()
                .filter_map(|entry| entry.get("ok").cloned())
                .collect()
        })
        .unwrap_or_default()
}
