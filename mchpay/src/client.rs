//! Signed request transport.
//!
//! A [`Client`] owns its [`ClientConfig`] (credentials, algorithm, environment) so several
//! independently configured clients can coexist in one process. [`Client::post_xml`] is the
//! path every typed operation goes through:
//!
//! ```text
//! post_xml(path, fields)
//!   ├─ default appid / mch_id / nonce_str / sign_type
//!   ├─ sign
//!   ├─ post()            // encode, POST, decode body regardless of HTTP status
//!   └─ verify response sign (required when return_code = SUCCESS)
//! ```
//!
//! Business failure (`return_code` or `result_code` = `FAIL`) is a valid [`Response`], never an
//! `Err`. Errors are reserved for transport failures, malformed bodies and missing or bad signatures.

use std::sync::Arc;
use std::time::Duration;

use bon::Builder;
use reqwest::header::CONTENT_TYPE;

use crate::codec;
use crate::errors::{Error, Result};
use crate::fields::{APPID, FieldMap, MCH_ID, NONCE_STR, SIGN, SIGN_TYPE};
use crate::signing::{self, SignType};

pub const PRODUCTION_BASE_URL: &str = "https://api.mch.weixin.qq.com";
/// Sandbox differs from production only by this path prefix
pub const SANDBOX_PATH_PREFIX: &str = "/sandboxnew";

const REQUEST_CONTENT_TYPE: &str = "text/xml; charset=utf-8";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Environment {
    #[default]
    Production,
    Sandbox,
}

#[derive(Debug, Clone, Builder)]
pub struct ClientConfig {
    #[builder(into)]
    pub app_id: String,
    #[builder(into)]
    pub mch_id: String,
    #[builder(into)]
    pub api_key: String,
    /// Algorithm used when a request does not name its own `sign_type`
    #[builder(default)]
    pub sign_type: SignType,
    #[builder(default)]
    pub environment: Environment,
    /// Replaces the production/sandbox base address entirely (test doubles)
    #[builder(into)]
    pub override_base_url: Option<String>,
    /// Whole-request timeout. Unset means reqwest's default (none).
    pub timeout: Option<Duration>,
}

impl ClientConfig {
    /// The base address requests are sent to. The override wins over the environment.
    pub fn base_url(&self) -> String {
        if let Some(base) = &self.override_base_url {
            return base.trim_end_matches('/').to_string();
        }
        match self.environment {
            Environment::Production => PRODUCTION_BASE_URL.to_string(),
            Environment::Sandbox => format!("{PRODUCTION_BASE_URL}{SANDBOX_PATH_PREFIX}"),
        }
    }
}

/// A resolved base address plus an API path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    base: String,
    path: String,
}

impl Endpoint {
    pub fn new(base: impl Into<String>, path: impl Into<String>) -> Self {
        let base = base.into().trim_end_matches('/').to_string();
        let path = path.into();
        let path = if path.starts_with('/') { path } else { format!("/{path}") };
        Self { base, path }
    }

    pub fn resolve(config: &ClientConfig, path: &str) -> Self {
        Self::new(config.base_url(), path)
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn url(&self) -> String {
        format!("{}{}", self.base, self.path)
    }
}

/// A decoded response together with the body it was decoded from.
#[derive(Debug, Clone)]
pub struct Response {
    fields: FieldMap,
    body: String,
}

impl Response {
    pub fn from_body(body: &[u8]) -> Result<Self> {
        let fields = codec::decode(body)?;
        Ok(Self {
            fields,
            body: String::from_utf8_lossy(body).into_owned(),
        })
    }

    pub fn fields(&self) -> &FieldMap {
        &self.fields
    }

    /// The raw body, for audit logging
    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn is_return_success(&self) -> bool {
        self.fields.is_return_success()
    }

    pub fn is_result_success(&self) -> bool {
        self.fields.is_result_success()
    }
}

#[derive(Debug, Clone)]
pub struct Client {
    config: Arc<ClientConfig>,
    http: reqwest::Client,
}

impl Client {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        let http = builder.build().map_err(|e| Error::Config {
            message: format!("failed to build HTTP client: {e}"),
        })?;
        Ok(Self::with_http_client(config, http))
    }

    /// Use a caller-supplied reqwest client (shared connection pool, custom TLS)
    pub fn with_http_client(config: ClientConfig, http: reqwest::Client) -> Self {
        Self {
            config: Arc::new(config),
            http,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn endpoint(&self, path: &str) -> Endpoint {
        Endpoint::resolve(&self.config, path)
    }

    /// Encode and POST `fields` as-is, then decode whatever body comes back.
    ///
    /// The HTTP status is ignored: the provider reports failure inside the body.
    #[tracing::instrument(skip(self, endpoint, fields), fields(url = %endpoint.url()))]
    pub async fn post(&self, endpoint: &Endpoint, fields: &FieldMap) -> Result<Response> {
        let url = endpoint.url();
        let body = codec::encode(fields)?;

        tracing::debug!(bytes = body.len(), "Sending request");
        let response = self
            .http
            .post(&url)
            .header(CONTENT_TYPE, REQUEST_CONTENT_TYPE)
            .body(body)
            .send()
            .await
            .map_err(|source| Error::Transport { url: url.clone(), source })?;

        let status = response.status();
        let bytes = response.bytes().await.map_err(|source| Error::Transport { url: url.clone(), source })?;
        tracing::debug!(status = status.as_u16(), bytes = bytes.len(), "Received response");

        Response::from_body(&bytes).inspect_err(|e| {
            tracing::warn!(error = %e, status = status.as_u16(), "Failed to decode response body");
        })
    }

    /// Default, sign and send a request to `path`, then check the response signature.
    pub async fn post_xml(&self, path: &str, mut fields: FieldMap) -> Result<Response> {
        let sign_type = self.prepare(&mut fields)?;
        let response = self.post(&self.endpoint(path), &fields).await?;
        self.check_response(&response, sign_type)?;
        Ok(response)
    }

    /// Fill defaults and sign in place, returning the algorithm used.
    fn prepare(&self, fields: &mut FieldMap) -> Result<SignType> {
        if !self.config.app_id.is_empty() {
            fields.insert_default_with(APPID, || self.config.app_id.clone());
        }
        if !self.config.mch_id.is_empty() {
            fields.insert_default_with(MCH_ID, || self.config.mch_id.clone());
        }
        fields.insert_default_with(NONCE_STR, signing::nonce_str);

        let sign_type = match fields.get(SIGN_TYPE) {
            None | Some("") => self.config.sign_type,
            Some(name) => name.parse()?,
        };
        // MD5 is the provider default and is left implicit
        if sign_type != SignType::Md5 {
            fields.insert(SIGN_TYPE, sign_type.as_str());
        }

        let signature = signing::sign(fields, &self.config.api_key, sign_type);
        fields.insert(SIGN, signature);
        Ok(sign_type)
    }

    fn check_response(&self, response: &Response, request_sign_type: SignType) -> Result<()> {
        let fields = response.fields();
        // FAIL bodies are unsigned
        if !fields.is_return_success() {
            return Ok(());
        }
        if fields.get(SIGN).is_none_or(str::is_empty) {
            tracing::warn!("Successful response carries no signature");
            return Err(Error::missing(SIGN));
        }

        let sign_type = match fields.get(SIGN_TYPE) {
            None | Some("") => request_sign_type,
            Some(name) => name.parse()?,
        };
        if !signing::verify_embedded(fields, &self.config.api_key, sign_type) {
            tracing::warn!(sign_type = %sign_type, "Response signature does not verify");
            return Err(Error::SignatureMismatch);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::{FAIL, RESULT_CODE, RETURN_CODE, RETURN_MSG, SUCCESS};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const KEY: &str = "testkey";

    fn config(base: Option<&str>) -> ClientConfig {
        ClientConfig::builder()
            .app_id("wx-app")
            .mch_id("10000100")
            .api_key(KEY)
            .maybe_override_base_url(base.map(str::to_string))
            .build()
    }

    fn xml(fields: &FieldMap) -> Vec<u8> {
        codec::encode(fields).unwrap()
    }

    fn signed(mut fields: FieldMap, sign_type: SignType) -> FieldMap {
        let signature = signing::sign(&fields, KEY, sign_type);
        fields.insert(SIGN, signature);
        fields
    }

    #[test]
    fn test_endpoint_resolution() {
        let production = config(None);
        assert_eq!(Endpoint::resolve(&production, "/pay/unifiedorder").url(), "https://api.mch.weixin.qq.com/pay/unifiedorder");

        let sandbox = ClientConfig {
            environment: Environment::Sandbox,
            ..config(None)
        };
        assert_eq!(
            Endpoint::resolve(&sandbox, "pay/unifiedorder").url(),
            "https://api.mch.weixin.qq.com/sandboxnew/pay/unifiedorder"
        );

        // Override wins over the environment
        let overridden = ClientConfig {
            environment: Environment::Sandbox,
            ..config(Some("http://127.0.0.1:18080/"))
        };
        let endpoint = Endpoint::resolve(&overridden, "/pay/unifiedorder");
        assert_eq!(endpoint.base(), "http://127.0.0.1:18080");
        assert_eq!(endpoint.path(), "/pay/unifiedorder");
        assert_eq!(endpoint.url(), "http://127.0.0.1:18080/pay/unifiedorder");
    }

    #[tokio::test]
    async fn test_business_failure_is_not_an_error() {
        let server = MockServer::start().await;
        let body: FieldMap = [(RETURN_CODE, FAIL), (RETURN_MSG, "appid not exist")].into_iter().collect();
        Mock::given(method("POST"))
            .and(path("/pay/unifiedorder"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(xml(&body)))
            .expect(1)
            .mount(&server)
            .await;

        let client = Client::new(config(Some(&server.uri()))).unwrap();
        let response = client.post_xml("/pay/unifiedorder", FieldMap::new()).await.unwrap();

        assert!(!response.is_return_success());
        assert_eq!(response.fields().get(RETURN_MSG), Some("appid not exist"));
        assert!(response.body().contains("appid not exist"));
    }

    #[tokio::test]
    async fn test_body_decoded_regardless_of_status() {
        let server = MockServer::start().await;
        let body: FieldMap = [(RETURN_CODE, FAIL), (RETURN_MSG, "busy")].into_iter().collect();
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_bytes(xml(&body)))
            .mount(&server)
            .await;

        let client = Client::new(config(Some(&server.uri()))).unwrap();
        let response = client.post(&client.endpoint("/anything"), &FieldMap::new()).await.unwrap();
        assert_eq!(response.fields().get(RETURN_MSG), Some("busy"));
    }

    #[tokio::test]
    async fn test_connection_refused_is_transport_error() {
        // Bind then drop to get a port nothing listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = Client::new(config(Some(&format!("http://{addr}")))).unwrap();
        let err = client.post_xml("/pay/unifiedorder", FieldMap::new()).await.unwrap_err();
        assert!(err.is_transport(), "{err:?}");
    }

    #[tokio::test]
    async fn test_malformed_body_is_decode_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html><body>gateway error"))
            .mount(&server)
            .await;

        let client = Client::new(config(Some(&server.uri()))).unwrap();
        let err = client.post_xml("/pay/unifiedorder", FieldMap::new()).await.unwrap_err();
        assert!(matches!(err, Error::Decode { .. }), "{err:?}");
        assert!(!err.is_transport());
    }

    #[tokio::test]
    async fn test_request_is_defaulted_and_signed() {
        let server = MockServer::start().await;
        let body = signed([(RETURN_CODE, SUCCESS)].into_iter().collect(), SignType::HmacSha256);
        Mock::given(method("POST"))
            .and(header("content-type", REQUEST_CONTENT_TYPE))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(xml(&body)))
            .expect(1)
            .mount(&server)
            .await;

        let client = Client::new(config(Some(&server.uri()))).unwrap();
        let request: FieldMap = [("out_trade_no", "T1"), ("total_fee", "100"), (SIGN_TYPE, "HMAC-SHA256")]
            .into_iter()
            .collect();
        client.post_xml("/pay/unifiedorder", request).await.unwrap();

        let received = server.received_requests().await.unwrap();
        let sent = codec::decode(&received[0].body).unwrap();
        assert_eq!(sent.get(APPID), Some("wx-app"));
        assert_eq!(sent.get(MCH_ID), Some("10000100"));
        assert_eq!(sent.get(NONCE_STR).map(str::len), Some(signing::NONCE_LEN));
        assert_eq!(sent.get(SIGN_TYPE), Some("HMAC-SHA256"));
        assert!(signing::verify_embedded(&sent, KEY, SignType::HmacSha256));
    }

    #[tokio::test]
    async fn test_md5_sign_type_left_implicit() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(xml(&signed(
                [(RETURN_CODE, SUCCESS)].into_iter().collect(),
                SignType::Md5,
            ))))
            .mount(&server)
            .await;

        let client = Client::new(config(Some(&server.uri()))).unwrap();
        let request: FieldMap = [(APPID, "caller-app"), (NONCE_STR, "fixednonce")].into_iter().collect();
        client.post_xml("/pay/unifiedorder", request).await.unwrap();

        let received = server.received_requests().await.unwrap();
        let sent = codec::decode(&received[0].body).unwrap();
        assert!(!sent.contains_key(SIGN_TYPE));
        assert_eq!(sent.get(APPID), Some("caller-app"));
        assert_eq!(sent.get(NONCE_STR), Some("fixednonce"));
        assert!(signing::verify_embedded(&sent, KEY, SignType::Md5));
    }

    #[tokio::test]
    async fn test_unknown_sign_type_fails_before_sending() {
        let server = MockServer::start().await;
        Mock::given(method("POST")).respond_with(ResponseTemplate::new(200)).expect(0).mount(&server).await;

        let client = Client::new(config(Some(&server.uri()))).unwrap();
        let request: FieldMap = [(SIGN_TYPE, "SHA512")].into_iter().collect();
        let err = client.post_xml("/pay/unifiedorder", request).await.unwrap_err();
        assert!(matches!(err, Error::UnsupportedSignType(name) if name == "SHA512"));
    }

    #[tokio::test]
    async fn test_response_signature_checked() {
        let server = MockServer::start().await;
        let good = signed(
            [(RETURN_CODE, SUCCESS), (RESULT_CODE, SUCCESS), ("prepay_id", "wx1")].into_iter().collect(),
            SignType::Md5,
        );
        let mut forged = good.clone();
        forged.insert("prepay_id", "wx2");

        Mock::given(path("/good"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(xml(&good)))
            .mount(&server)
            .await;
        Mock::given(path("/forged"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(xml(&forged)))
            .mount(&server)
            .await;

        let client = Client::new(config(Some(&server.uri()))).unwrap();
        let response = client.post_xml("/good", FieldMap::new()).await.unwrap();
        assert!(response.is_result_success());

        let err = client.post_xml("/forged", FieldMap::new()).await.unwrap_err();
        assert!(matches!(err, Error::SignatureMismatch));
    }

    #[tokio::test]
    async fn test_unsigned_success_response_rejected() {
        let server = MockServer::start().await;
        let unsigned: FieldMap = [(RETURN_CODE, SUCCESS), (RESULT_CODE, SUCCESS), ("prepay_id", "forged")]
            .into_iter()
            .collect();
        let mut blank = unsigned.clone();
        blank.insert(SIGN, "");

        Mock::given(path("/unsigned"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(xml(&unsigned)))
            .mount(&server)
            .await;
        Mock::given(path("/blank"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(xml(&blank)))
            .mount(&server)
            .await;

        let client = Client::new(config(Some(&server.uri()))).unwrap();
        for route in ["/unsigned", "/blank"] {
            let err = client.post_xml(route, FieldMap::new()).await.unwrap_err();
            assert!(matches!(&err, Error::MissingField { field, index: None } if field == SIGN), "{route}: {err:?}");
        }

        // The raw transport does no verification
        let response = client.post(&client.endpoint("/unsigned"), &FieldMap::new()).await.unwrap();
        assert_eq!(response.fields().get("prepay_id"), Some("forged"));
    }
}
