use base64::Engine;
use regex::Regex;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::{Pkcs1v15Sign, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use sha2::Sha256;
use snafu::prelude::*;
use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;
use url::Url;

/// Max time spent on outgoing calls (cert fetch, subscription confirm);
/// the SNS delivery itself times out at 15s on the AWS side.
const HTTP_CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to decode notification signature: {message}"))]
    SignatureDecode { message: String },

    #[snafu(display("Invalid signing cert url: {message}"))]
    CertUrl { message: String },

    #[snafu(display("Failed to get signing certificate: {source}"))]
    CertFetch { source: reqwest::Error },

    #[snafu(display("Failed to get signing certificate (bad status code {status})"))]
    CertFetchStatus { status: u16 },

    #[snafu(display("Failed to parse signing certificate: {message}"))]
    CertParse { message: String },

    #[snafu(display("Unsupported signature version {version}"))]
    UnsupportedSignatureVersion { version: String },

    #[snafu(display("Signature verification failed"))]
    BadSignature,

    #[snafu(display("Failed to confirm subscription: {source}"))]
    Confirm { source: reqwest::Error },

    #[snafu(display("Failed to confirm subscription (bad status code {status})"))]
    ConfirmStatus { status: u16 },
}

pub type Result<T> = std::result::Result<T, Error>;

/// An SNS delivery envelope: both notifications and subscription
/// confirmations arrive in this shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SnsNotification {
    #[serde(rename = "Type")]
    pub message_type: String,

    #[serde(rename = "MessageId")]
    pub message_id: String,

    #[serde(rename = "Subject")]
    pub subject: String,

    #[serde(rename = "Message")]
    pub message: String,

    #[serde(rename = "Timestamp")]
    pub timestamp: String,

    #[serde(rename = "Token")]
    pub token: String,

    #[serde(rename = "TopicArn")]
    pub topic_arn: String,

    #[serde(rename = "Signature")]
    pub signature: String,

    #[serde(rename = "SignatureVersion")]
    pub signature_version: String,

    #[serde(rename = "SigningCertURL")]
    pub signing_cert_url: String,

    #[serde(rename = "SubscribeURL")]
    pub subscribe_url: String,

    #[serde(rename = "UnsubscribeURL")]
    pub unsubscribe_url: String,

    #[serde(rename = "MessageAttributes")]
    pub message_attributes: HashMap<String, MessageAttribute>,
}

/// See <https://docs.aws.amazon.com/sns/latest/dg/sns-message-attributes.html>
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageAttribute {
    #[serde(rename = "Type")]
    pub attribute_type: String,

    #[serde(rename = "Value")]
    pub value: serde_json::Value,
}

impl SnsNotification {
    /// The topic name, i.e. the last segment of the ARN.
    pub fn arn_short(&self) -> &str {
        match self.topic_arn.rsplit_once(':') {
            Some((_, name)) => name,
            None => &self.topic_arn,
        }
    }

    /// The canonical string AWS signs: a fixed subset of fields in fixed
    /// order, each non-empty one contributing `Key\nValue\n`.
    pub fn canonical_string(&self) -> String {
        let signable: [(&str, &str); 8] = [
            ("Message", &self.message),
            ("MessageId", &self.message_id),
            ("Subject", &self.subject),
            ("SubscribeURL", &self.subscribe_url),
            ("Timestamp", &self.timestamp),
            ("Token", &self.token),
            ("TopicArn", &self.topic_arn),
            ("Type", &self.message_type),
        ];

        let mut canonical = String::new();
        for (key, value) in signable {
            if value.is_empty() {
                continue;
            }
            canonical.push_str(key);
            canonical.push('\n');
            canonical.push_str(value);
            canonical.push('\n');
        }
        canonical
    }
}

fn cert_host_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"^sns\.[a-zA-Z0-9\-]{3,}\.amazonaws\.com(\.cn)?$").expect("invalid regex")
    })
}

/// Rejects cert urls that are not HTTPS or do not point at an SNS
/// endpoint, before anything is fetched.
pub fn validate_cert_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw).map_err(|e| Error::CertUrl {
        message: format!("{raw}: {e}"),
    })?;

    ensure!(
        url.scheme() == "https",
        CertUrlSnafu {
            message: "cert url must use the https scheme".to_string(),
        }
    );

    let host = url.host_str().unwrap_or_default();
    ensure!(
        cert_host_regex().is_match(host),
        CertUrlSnafu {
            message: format!("cert url is using an invalid domain {host}"),
        }
    );

    Ok(url)
}

/// Verifies SNS message signatures against the (cached) signing
/// certificate and confirms subscriptions.
#[derive(Debug)]
pub struct SnsValidator {
    http: reqwest::Client,
    cert_cache: tokio::sync::Mutex<HashMap<String, Vec<u8>>>,
}

impl Default for SnsValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl SnsValidator {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .timeout(HTTP_CLIENT_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            http,
            cert_cache: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub async fn verify(&self, notification: &SnsNotification) -> Result<()> {
        let signature = base64::engine::general_purpose::STANDARD
            .decode(notification.signature.trim())
            .map_err(|e| Error::SignatureDecode {
                message: e.to_string(),
            })?;

        validate_cert_url(&notification.signing_cert_url)?;
        let cert_pem = self.signing_cert(&notification.signing_cert_url).await?;
        let public_key = rsa_public_key(&cert_pem)?;

        let canonical = notification.canonical_string();
        let verified = match notification.signature_version.as_str() {
            "" | "1" => {
                let hashed = Sha1::digest(canonical.as_bytes());
                public_key.verify(Pkcs1v15Sign::new::<Sha1>(), &hashed, &signature)
            }
            "2" => {
                let hashed = Sha256::digest(canonical.as_bytes());
                public_key.verify(Pkcs1v15Sign::new::<Sha256>(), &hashed, &signature)
            }
            version => {
                return UnsupportedSignatureVersionSnafu {
                    version: version.to_string(),
                }
                .fail();
            }
        };

        verified.map_err(|_| Error::BadSignature)
    }

    /// Confirms a pending subscription by following the subscribe url.
    /// Any 2xx status counts as success.
    pub async fn confirm_subscription(&self, subscribe_url: &str) -> Result<()> {
        let response = self
            .http
            .get(subscribe_url)
            .send()
            .await
            .context(ConfirmSnafu)?;

        let status = response.status();
        ensure!(
            status.is_success(),
            ConfirmStatusSnafu {
                status: status.as_u16(),
            }
        );
        Ok(())
    }

    async fn signing_cert(&self, cert_url: &str) -> Result<Vec<u8>> {
        {
            let cache = self.cert_cache.lock().await;
            if let Some(body) = cache.get(cert_url) {
                tracing::debug!(url = cert_url, "found cached sns cert");
                return Ok(body.clone());
            }
        }

        let response = self.http.get(cert_url).send().await.context(CertFetchSnafu)?;
        let status = response.status();
        ensure!(
            status.is_success(),
            CertFetchStatusSnafu {
                status: status.as_u16(),
            }
        );

        let body = response.bytes().await.context(CertFetchSnafu)?.to_vec();
        self.cert_cache
            .lock()
            .await
            .insert(cert_url.to_string(), body.clone());
        Ok(body)
    }
}

fn rsa_public_key(cert_pem: &[u8]) -> Result<RsaPublicKey> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(cert_pem).map_err(|e| Error::CertParse {
        message: e.to_string(),
    })?;
    let cert = pem.parse_x509().map_err(|e| Error::CertParse {
        message: e.to_string(),
    })?;

    RsaPublicKey::from_pkcs1_der(cert.public_key().subject_public_key.data.as_ref()).map_err(|e| {
        Error::CertParse {
            message: format!("unsupported public key: {e}"),
        }
    })
}
