use std::fmt;
use std::io::{self, Write};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use md5::{Digest, Md5};
use reqwest::Method;
use reqwest::blocking::{Client, Response};
use serde::Deserialize;
use tracing::trace;
use url::Url;

use super::sigv4::{self, CanonicalRequest, EMPTY_PAYLOAD_SHA256};
use super::{ClientError, ListPage, MAX_KEYS_PER_DELETE, MAX_KEYS_PER_PAGE, ObjectClient};

const DEFAULT_REGION: &str = "us-east-1";

/// Static access keys. `Debug` never prints the secret.
#[derive(Clone, PartialEq, Eq)]
pub struct S3Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl S3Credentials {
    pub fn new(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
        }
    }
}

impl fmt::Debug for S3Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .finish()
    }
}

/// Where a bucket lives. Without an endpoint the AWS regional endpoint is used.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct S3Location {
    pub bucket: String,
    pub endpoint: Option<String>,
    pub region: Option<String>,
}

impl S3Location {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            ..Self::default()
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn region(&self) -> &str {
        self.region
            .as_deref()
            .filter(|region| !region.is_empty())
            .unwrap_or(DEFAULT_REGION)
    }

    pub fn endpoint_url(&self) -> String {
        match self.endpoint.as_deref().filter(|e| !e.is_empty()) {
            Some(endpoint) => endpoint.trim_end_matches('/').to_string(),
            None => format!("https://s3.{}.amazonaws.com", self.region()),
        }
    }

    /// `s3://bucket at scheme://host[:port]`, dropping any userinfo.
    pub fn describe(&self) -> String {
        let endpoint = self.endpoint_url();
        let shown = Url::parse(&endpoint)
            .ok()
            .and_then(|url| {
                url.host_str()
                    .map(|host| format!("{}://{}", url.scheme(), authority(host, url.port())))
            })
            .unwrap_or_else(|| "<invalid endpoint>".to_string());
        format!("s3://{} at {shown}", self.bucket)
    }
}

fn authority(host: &str, port: Option<u16>) -> String {
    match port {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

/// Path-style S3 REST client over blocking reqwest.
pub struct S3Client {
    http: Client,
    location: S3Location,
    scheme: String,
    authority: String,
    base_path: String,
    credentials: Option<S3Credentials>,
    identity: String,
}

impl fmt::Debug for S3Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Client")
            .field("location", &self.identity)
            .field("credentials", &self.credentials)
            .finish()
    }
}

struct Outgoing<'a> {
    method: Method,
    key: Option<&'a str>,
    query: Vec<(&'a str, String)>,
    body: Vec<u8>,
    headers: Vec<(&'static str, String)>,
}

impl<'a> Outgoing<'a> {
    fn new(method: Method, key: Option<&'a str>) -> Self {
        Self {
            method,
            key,
            query: Vec::new(),
            body: Vec::new(),
            headers: Vec::new(),
        }
    }
}

impl S3Client {
    pub fn new(
        location: S3Location,
        credentials: Option<S3Credentials>,
        timeout: Option<Duration>,
    ) -> Result<Self, ClientError> {
        let endpoint = Url::parse(&location.endpoint_url()).map_err(|err| {
            ClientError::Backend(format!("invalid endpoint for bucket {}: {err}", location.bucket))
        })?;
        let host = endpoint.host_str().ok_or_else(|| {
            ClientError::Backend(format!("endpoint for bucket {} has no host", location.bucket))
        })?;
        let mut builder = Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let http = builder
            .build()
            .map_err(|err| ClientError::Backend(format!("failed to build http client: {err}")))?;
        Ok(Self {
            http,
            scheme: endpoint.scheme().to_string(),
            authority: authority(host, endpoint.port()),
            base_path: endpoint.path().trim_end_matches('/').to_string(),
            identity: location.describe(),
            location,
            credentials,
        })
    }

    pub fn location(&self) -> &S3Location {
        &self.location
    }

    fn send(&self, request: Outgoing<'_>) -> Result<Response, ClientError> {
        let mut uri = format!(
            "{}/{}",
            self.base_path,
            sigv4::uri_encode(&self.location.bucket, true)
        );
        if let Some(key) = request.key {
            uri.push('/');
            uri.push_str(&sigv4::uri_encode(key, false));
        }
        let query = sigv4::canonical_query(&request.query);
        let payload_sha256 = if request.body.is_empty() {
            EMPTY_PAYLOAD_SHA256.to_string()
        } else {
            sigv4::payload_sha256(&request.body)
        };

        let mut url = format!("{}://{}{uri}", self.scheme, self.authority);
        if !query.is_empty() {
            url.push('?');
            url.push_str(&query);
        }

        let mut headers = request.headers.clone();
        match &self.credentials {
            Some(credentials) => {
                let canonical = CanonicalRequest {
                    method: request.method.as_str(),
                    uri: &uri,
                    query: &query,
                    host: &self.authority,
                    payload_sha256: &payload_sha256,
                    headers: &request.headers,
                };
                headers.extend(sigv4::sign(
                    credentials,
                    self.location.region(),
                    Utc::now(),
                    &canonical,
                )?);
            }
            None => headers.push(("x-amz-content-sha256", payload_sha256)),
        }

        trace!(method = %request.method, %uri, %query, "s3 request");
        let mut builder = self.http.request(request.method.clone(), &url);
        for (name, value) in headers {
            builder = builder.header(name, value);
        }
        if !request.body.is_empty() || request.method == Method::PUT {
            builder = builder.body(request.body);
        }
        let response = builder.send().map_err(|err| {
            ClientError::Backend(format!(
                "{} {uri} on {} failed: {err}",
                request.method, self.identity
            ))
        })?;
        if response.status().is_success() {
            Ok(response)
        } else {
            Err(self.failure(&request.method, &uri, response))
        }
    }

    fn failure(&self, method: &Method, uri: &str, response: Response) -> ClientError {
        let status = response.status();
        let body = response.text().unwrap_or_default();
        let parsed: ErrorBody = quick_xml::de::from_str(&body).unwrap_or_default();
        match parsed.code.as_deref() {
            Some("NoSuchKey") => ClientError::NoSuchKey,
            Some(code) => ClientError::Backend(format!(
                "{method} {uri} on {} returned {status} {code}: {}",
                self.identity,
                parsed.message.unwrap_or_default()
            )),
            None if status == reqwest::StatusCode::NOT_FOUND => ClientError::NoSuchKey,
            None => ClientError::Backend(format!(
                "{method} {uri} on {} returned {status}",
                self.identity
            )),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListBucketResult {
    #[serde(default)]
    is_truncated: bool,
    #[serde(default)]
    contents: Vec<ListedObject>,
    #[serde(default)]
    next_continuation_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListedObject {
    key: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DeleteResult {
    #[serde(default)]
    error: Vec<DeleteFailure>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DeleteFailure {
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    code: Option<String>,
}

fn delete_body(keys: &[String]) -> String {
    let mut body = String::from("<Delete><Quiet>true</Quiet>");
    for key in keys {
        body.push_str("<Object><Key>");
        body.push_str(&quick_xml::escape::escape(key.as_str()));
        body.push_str("</Key></Object>");
    }
    body.push_str("</Delete>");
    body
}

fn read_text(response: Response, identity: &str) -> Result<String, ClientError> {
    response
        .text()
        .map_err(|err| ClientError::Backend(format!("failed to read response from {identity}: {err}")))
}

impl ObjectClient for S3Client {
    fn describe(&self) -> String {
        self.identity.clone()
    }

    fn list_page(&self, prefix: &str, token: Option<&str>) -> Result<ListPage, ClientError> {
        let mut request = Outgoing::new(Method::GET, None);
        request.query.push(("list-type", "2".to_string()));
        request.query.push(("max-keys", MAX_KEYS_PER_PAGE.to_string()));
        if !prefix.is_empty() {
            request.query.push(("prefix", prefix.to_string()));
        }
        if let Some(token) = token {
            request.query.push(("continuation-token", token.to_string()));
        }
        let body = read_text(self.send(request)?, &self.identity)?;
        let listing: ListBucketResult = quick_xml::de::from_str(&body).map_err(|err| {
            ClientError::Backend(format!("unreadable listing from {}: {err}", self.identity))
        })?;
        Ok(ListPage {
            keys: listing.contents.into_iter().map(|object| object.key).collect(),
            next_token: listing
                .next_continuation_token
                .filter(|_| listing.is_truncated),
        })
    }

    fn head_object(&self, key: &str) -> Result<bool, ClientError> {
        match self.send(Outgoing::new(Method::HEAD, Some(key))) {
            Ok(_) => Ok(true),
            Err(ClientError::NoSuchKey) => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn get_object(&self, key: &str, sink: &mut dyn Write) -> Result<u64, ClientError> {
        let mut response = self.send(Outgoing::new(Method::GET, Some(key)))?;
        io::copy(&mut response, sink)
            .map_err(|err| ClientError::Backend(format!("failed to stream {key}: {err}")))
    }

    fn put_object(&self, key: &str, contents: &[u8]) -> Result<(), ClientError> {
        let mut request = Outgoing::new(Method::PUT, Some(key));
        request.body = contents.to_vec();
        self.send(request).map(|_| ())
    }

    fn delete_object(&self, key: &str) -> Result<(), ClientError> {
        self.send(Outgoing::new(Method::DELETE, Some(key))).map(|_| ())
    }

    fn delete_objects(&self, keys: &[String]) -> Result<(), ClientError> {
        if keys.is_empty() {
            return Ok(());
        }
        if keys.len() > MAX_KEYS_PER_DELETE {
            return Err(ClientError::Backend(format!(
                "bulk delete of {} keys exceeds the limit of {MAX_KEYS_PER_DELETE}",
                keys.len()
            )));
        }
        let body = delete_body(keys).into_bytes();
        let mut request = Outgoing::new(Method::POST, None);
        request.query.push(("delete", String::new()));
        request
            .headers
            .push(("content-md5", BASE64.encode(Md5::digest(&body))));
        request.headers.push(("content-type", "application/xml".to_string()));
        request.body = body;

        let text = read_text(self.send(request)?, &self.identity)?;
        let result = parse_delete_result(&text, &self.identity)?;
        if let Some(failure) = result.error.first() {
            return Err(ClientError::Backend(format!(
                "bulk delete on {} failed for {} of {} keys (first: {} {})",
                self.identity,
                result.error.len(),
                keys.len(),
                failure.key.as_deref().unwrap_or("?"),
                failure.code.as_deref().unwrap_or("unknown error"),
            )));
        }
        Ok(())
    }
}

/// An empty body counts as a quiet success.
fn parse_delete_result(text: &str, identity: &str) -> Result<DeleteResult, ClientError> {
    if text.trim().is_empty() {
        return Ok(DeleteResult::default());
    }
    quick_xml::de::from_str(text).map_err(|err| {
        ClientError::Backend(format!("unreadable bulk delete result from {identity}: {err}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_debug_hides_secret() {
        let rendered = format!("{:?}", S3Credentials::new("AKID", "very-secret"));
        assert!(rendered.contains("AKID"));
        assert!(!rendered.contains("very-secret"));
    }

    #[test]
    fn location_defaults_to_aws() {
        let location = S3Location::new("packs");
        assert_eq!(location.region(), "us-east-1");
        assert_eq!(location.endpoint_url(), "https://s3.us-east-1.amazonaws.com");
        assert_eq!(
            location.describe(),
            "s3://packs at https://s3.us-east-1.amazonaws.com"
        );
    }

    #[test]
    fn describe_drops_userinfo() {
        let location = S3Location::new("packs").with_endpoint("http://user:pw@minio:9000/");
        assert_eq!(location.describe(), "s3://packs at http://minio:9000");
    }

    #[test]
    fn parses_truncated_listing() {
        let body = r#"<?xml version="1.0" encoding="UTF-8"?>
<ListBucketResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">
  <Name>packs</Name>
  <Prefix>a/</Prefix>
  <KeyCount>2</KeyCount>
  <IsTruncated>true</IsTruncated>
  <Contents><Key>a/1</Key><Size>1</Size></Contents>
  <Contents><Key>a/2</Key><Size>1</Size></Contents>
  <NextContinuationToken>tok</NextContinuationToken>
</ListBucketResult>"#;
        let parsed: ListBucketResult = quick_xml::de::from_str(body).unwrap();
        assert!(parsed.is_truncated);
        assert_eq!(parsed.contents.len(), 2);
        assert_eq!(parsed.contents[1].key, "a/2");
        assert_eq!(parsed.next_continuation_token.as_deref(), Some("tok"));
    }

    #[test]
    fn delete_body_escapes_keys() {
        let body = delete_body(&["a&b".to_string(), "c".to_string()]);
        assert_eq!(
            body,
            "<Delete><Quiet>true</Quiet><Object><Key>a&amp;b</Key></Object>\
             <Object><Key>c</Key></Object></Delete>"
        );
    }

    #[test]
    fn delete_result_reports_failures_and_rejects_garbage() {
        let body = r#"<DeleteResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">
  <Error><Key>a/1</Key><Code>AccessDenied</Code><Message>denied</Message></Error>
</DeleteResult>"#;
        let parsed = parse_delete_result(body, "s3://packs").unwrap();
        assert_eq!(parsed.error.len(), 1);
        assert_eq!(parsed.error[0].key.as_deref(), Some("a/1"));
        assert_eq!(parsed.error[0].code.as_deref(), Some("AccessDenied"));

        assert!(parse_delete_result("<DeleteResult></DeleteResult>", "s3://packs")
            .unwrap()
            .error
            .is_empty());
        assert!(parse_delete_result("  ", "s3://packs").unwrap().error.is_empty());

        let err = parse_delete_result("<DeleteResult><Error></DeleteResult>", "s3://packs").unwrap_err();
        assert!(matches!(err, ClientError::Backend(message) if message.contains("s3://packs")));
    }
}
