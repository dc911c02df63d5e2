//! Request signing
//!
//! Hawk 1.x header authentication (HMAC-SHA256 over the normalized request
//! string) and plain bearer tokens. Temporary credentials carry their
//! certificate in the Hawk `ext` field as
//! `base64(json({"certificate": <certificate>}))`.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use hmac::{Hmac, Mac};
use reqwest::Url;
use sha2::Sha256;
use tcproxy_core::{AuthScheme, Credentials, Result, TcProxyError};

type HmacSha256 = Hmac<Sha256>;

/// The parts of a request Hawk signs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HawkRequest {
    pub method: String,
    pub resource: String,
    pub host: String,
    pub port: u16,
}

impl HawkRequest {
    pub fn from_url(method: &str, url: &Url) -> Result<Self> {
        let host = url
            .host_str()
            .ok_or_else(|| TcProxyError::Signing(format!("URL has no host: {}", url)))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| TcProxyError::Signing(format!("URL has no port: {}", url)))?;

        let resource = match url.query() {
            Some(query) => format!("{}?{}", url.path(), query),
            None => url.path().to_string(),
        };

        Ok(Self {
            method: method.to_uppercase(),
            resource,
            host: host.to_lowercase(),
            port,
        })
    }

    fn normalized(&self, ts: i64, nonce: &str, ext: &str) -> String {
        format!(
            "hawk.1.header\n{}\n{}\n{}\n{}\n{}\n{}\n\n{}\n",
            ts, nonce, self.method, self.resource, self.host, self.port, ext
        )
    }

    /// MAC for this request, base64 encoded
    pub fn mac(&self, key: &str, ts: i64, nonce: &str, ext: &str) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(key.as_bytes())
            .map_err(|e| TcProxyError::Signing(e.to_string()))?;
        mac.update(self.normalized(ts, nonce, ext).as_bytes());
        Ok(STANDARD.encode(mac.finalize().into_bytes()))
    }

    /// Full `Authorization` header value
    pub fn header(
        &self,
        id: &str,
        key: &str,
        ts: i64,
        nonce: &str,
        ext: Option<&str>,
    ) -> Result<String> {
        let ext = ext.unwrap_or("");
        let mac = self.mac(key, ts, nonce, ext)?;

        let mut header = format!(r#"Hawk id="{}", ts="{}", nonce="{}""#, id, ts, nonce);
        if !ext.is_empty() {
            header.push_str(&format!(r#", ext="{}""#, ext));
        }
        header.push_str(&format!(r#", mac="{}""#, mac));
        Ok(header)
    }
}

/// `ext` value carrying a temporary credential's certificate
fn certificate_ext(credentials: &Credentials) -> Result<Option<String>> {
    let Some(certificate) = credentials.certificate.as_deref() else {
        return Ok(None);
    };

    let certificate: serde_json::Value = serde_json::from_str(certificate)
        .map_err(|e| TcProxyError::Signing(format!("Malformed certificate: {}", e)))?;
    let ext = serde_json::json!({ "certificate": certificate });
    Ok(Some(STANDARD.encode(ext.to_string())))
}

/// `Authorization` header value for a request to `url`
pub fn authorization_header(
    scheme: AuthScheme,
    credentials: &Credentials,
    method: &str,
    url: &Url,
) -> Result<String> {
    match scheme {
        AuthScheme::Bearer => Ok(format!("Bearer {}", credentials.access_token)),
        AuthScheme::Hawk => {
            let request = HawkRequest::from_url(method, url)?;
            let ext = certificate_ext(credentials)?;
            let ts = chrono::Utc::now().timestamp();
            let nonce = uuid::Uuid::new_v4().simple().to_string();
            request.header(
                &credentials.client_id,
                &credentials.access_token,
                ts,
                &nonce[..12],
                ext.as_deref(),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_vector() {
        // Example from the Hawk protocol documentation
        let url = Url::parse("http://example.com:8000/resource/1?b=1&a=2").unwrap();
        let request = HawkRequest::from_url("GET", &url).unwrap();
        let mac = request
            .mac(
                "werxhqb98rpaxn39848xrunpaw3489ruxnpa98w4rxn",
                1353832234,
                "j4h3g2",
                "some-app-ext-data",
            )
            .unwrap();
        assert_eq!(mac, "6R4rV5iE+NPoym+WwjeHzjAGXUtLNIxmo1vpMofpLAE=");
    }

    #[test]
    fn test_request_normalization() {
        let url = Url::parse("https://Queue.Example.com/api/queue/v1/ping").unwrap();
        let request = HawkRequest::from_url("post", &url).unwrap();
        assert_eq!(request.method, "POST");
        assert_eq!(request.host, "queue.example.com");
        assert_eq!(request.port, 443);
        assert_eq!(request.resource, "/api/queue/v1/ping");
    }

    #[test]
    fn test_header_layout() {
        let url = Url::parse("http://localhost:8080/api/queue/v1/ping").unwrap();
        let request = HawkRequest::from_url("GET", &url).unwrap();

        let header = request.header("client", "key", 100, "abc", None).unwrap();
        assert!(header.starts_with(r#"Hawk id="client", ts="100", nonce="abc", mac=""#));
        assert!(!header.contains("ext="));

        let header = request.header("client", "key", 100, "abc", Some("e30=")).unwrap();
        assert!(header.contains(r#"ext="e30=""#));
    }

    #[test]
    fn test_bearer() {
        let url = Url::parse("http://localhost/api/queue/v1/ping").unwrap();
        let creds = Credentials::new("client", "tok");
        let header = authorization_header(AuthScheme::Bearer, &creds, "GET", &url).unwrap();
        assert_eq!(header, "Bearer tok");
    }

    #[test]
    fn test_hawk_with_certificate_sets_ext() {
        let url = Url::parse("http://localhost/api/queue/v1/ping").unwrap();
        let creds = Credentials::new("task-client", "tok").with_certificate(r#"{"version":1}"#);
        let header = authorization_header(AuthScheme::Hawk, &creds, "GET", &url).unwrap();
        assert!(header.starts_with(r#"Hawk id="task-client""#));

        let expected_ext = STANDARD.encode(r#"{"certificate":{"version":1}}"#);
        assert!(header.contains(&format!(r#"ext="{}""#, expected_ext)));
    }

    #[test]
    fn test_malformed_certificate_is_rejected() {
        let url = Url::parse("http://localhost/api/queue/v1/ping").unwrap();
        let creds = Credentials::new("task-client", "tok").with_certificate("not json");
        let result = authorization_header(AuthScheme::Hawk, &creds, "GET", &url);
        assert!(matches!(result, Err(TcProxyError::Signing(_))));
    }
}
