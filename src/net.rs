use anyhow::Result;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use serde_json::value::RawValue;
use sha2::Sha256;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{HeartbeatError, HeartbeatResult};
use crate::types::{HeartbeatPayload, PushReceipt};

type HmacSha256 = Hmac<Sha256>;

pub const HEADER_VEHICLE_ID: &str = "X-Vehicle-Id";
pub const HEADER_TIMESTAMP: &str = "X-Timestamp";
pub const HEADER_NONCE: &str = "X-Nonce";
pub const HEADER_SIGNATURE: &str = "X-Signature";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const READ_TIMEOUT: Duration = Duration::from_secs(30);
/// Whole-request budget; sized for uploading the image.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Everything one push needs.
#[derive(Debug, Clone)]
pub struct PushRequest {
    pub endpoint: String,
    pub device_id: String,
    pub secret: String,
    pub image_bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub source_count: usize,
    pub status_json: Option<String>,
}

#[async_trait]
pub trait Submitter: Send + Sync {
    /// Exactly one attempt; failures are terminal for the cycle.
    async fn push(&self, request: PushRequest) -> HeartbeatResult<PushReceipt>;
}

/// Lowercase hex HMAC-SHA256 over `device_id || timestamp || nonce`.
pub fn sign(device_id: &str, timestamp: i64, nonce: &str, secret: &str) -> HeartbeatResult<String> {
    if secret.is_empty() {
        return Err(HeartbeatError::Signature("secret is empty".to_string()));
    }
    let message = format!("{}{}{}", device_id, timestamp, nonce);
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| HeartbeatError::Signature(e.to_string()))?;
    mac.update(message.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

pub fn generate_nonce() -> String {
    Uuid::new_v4().to_string()
}

pub struct SubmissionClient {
    http: Client,
}

impl SubmissionClient {
    pub fn new() -> Result<Self> {
        let http = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(READ_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self { http })
    }
}

#[async_trait]
impl Submitter for SubmissionClient {
    async fn push(&self, request: PushRequest) -> HeartbeatResult<PushReceipt> {
        if request.endpoint.trim().is_empty() {
            return Err(HeartbeatError::Config("server address not configured".to_string()));
        }
        if request.image_bytes.is_empty() {
            return Err(HeartbeatError::Capture("image data is empty".to_string()));
        }

        let timestamp = Utc::now().timestamp_millis();
        let nonce = generate_nonce();
        let signature = sign(&request.device_id, timestamp, &nonce, &request.secret)?;

        let status: Option<Box<RawValue>> = match request.status_json.as_deref() {
            Some(json) if !json.trim().is_empty() => Some(
                RawValue::from_string(json.to_string())
                    .map_err(|e| HeartbeatError::Unexpected(format!("invalid status JSON: {}", e)))?,
            ),
            _ => None,
        };

        let payload = HeartbeatPayload {
            vehicle_id: &request.device_id,
            timestamp,
            nonce: &nonce,
            signature: &signature,
            image_base64: STANDARD.encode(&request.image_bytes),
            image_width: request.width,
            image_height: request.height,
            image_size_bytes: request.image_bytes.len(),
            camera_count: request.source_count,
            status: status.as_deref(),
        };
        let body = serde_json::to_vec(&payload).map_err(|e| HeartbeatError::Unexpected(e.to_string()))?;

        log::debug!(
            "Sending heartbeat to {}, image {}KB",
            request.endpoint,
            request.image_bytes.len() / 1024
        );

        let response = self
            .http
            .post(&request.endpoint)
            .header(CONTENT_TYPE, "application/json")
            .header(HEADER_VEHICLE_ID, &request.device_id)
            .header(HEADER_TIMESTAMP, timestamp.to_string())
            .header(HEADER_NONCE, &nonce)
            .header(HEADER_SIGNATURE, &signature)
            .body(body)
            .send()
            .await
            .map_err(classify)?;

        let status = response.status();
        let body = response.text().await.map_err(classify)?;

        if status.is_success() {
            log::info!("Heartbeat accepted: {}", status.as_u16());
            Ok(PushReceipt {
                status: status.as_u16(),
                body,
            })
        } else {
            log::warn!("Heartbeat rejected: {}, {}", status.as_u16(), body);
            Err(HeartbeatError::Protocol {
                status: status.as_u16(),
                body,
            })
        }
    }
}

fn classify(e: reqwest::Error) -> HeartbeatError {
    if e.is_builder() {
        HeartbeatError::Unexpected(e.to_string())
    } else {
        HeartbeatError::Network(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};

    fn request(endpoint: String) -> PushRequest {
        PushRequest {
            endpoint,
            device_id: "EV-0A1B2C3D".to_string(),
            secret: "topsecret".to_string(),
            image_bytes: vec![0xFF, 0xD8, 0x01, 0x02, 0xFF, 0xD9],
            width: 1280,
            height: 720,
            source_count: 2,
            status_json: Some(r#"{"recording":false}"#.to_string()),
        }
    }

    #[test]
    fn signature_is_deterministic_lowercase_hex() {
        let a = sign("EV-0A1B2C3D", 1_700_000_000_000, "n-1", "k").unwrap();
        let b = sign("EV-0A1B2C3D", 1_700_000_000_000, "n-1", "k").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
    }

    #[test]
    fn signature_changes_with_any_input() {
        let base = sign("EV-0A1B2C3D", 1_700_000_000_000, "n-1", "k").unwrap();
        assert_ne!(base, sign("EV-0A1B2C3E", 1_700_000_000_000, "n-1", "k").unwrap());
        assert_ne!(base, sign("EV-0A1B2C3D", 1_700_000_000_001, "n-1", "k").unwrap());
        assert_ne!(base, sign("EV-0A1B2C3D", 1_700_000_000_000, "n-2", "k").unwrap());
        assert_ne!(base, sign("EV-0A1B2C3D", 1_700_000_000_000, "n-1", "K").unwrap());
    }

    #[test]
    fn signature_covers_decimal_timestamp_concatenation() {
        let sig = sign("EV-1", 1_700_000_000_123, "abc", "Jefe").unwrap();
        let mut mac = HmacSha256::new_from_slice(b"Jefe").unwrap();
        mac.update(b"EV-11700000000123abc");
        assert_eq!(sig, hex::encode(mac.finalize().into_bytes()));
    }

    #[test]
    fn empty_secret_refuses_to_sign() {
        assert!(matches!(
            sign("EV-0A1B2C3D", 1, "n", ""),
            Err(HeartbeatError::Signature(_))
        ));
    }

    #[test]
    fn nonces_are_unique() {
        assert_ne!(generate_nonce(), generate_nonce());
    }

    #[tokio::test]
    async fn push_sends_signed_headers_and_body() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/heartbeat")
            .match_header("content-type", "application/json")
            .match_header("x-vehicle-id", "EV-0A1B2C3D")
            .match_header("x-timestamp", Matcher::Regex(r"^\d{13}$".to_string()))
            .match_header("x-nonce", Matcher::Any)
            .match_header("x-signature", Matcher::Regex(r"^[0-9a-f]{64}$".to_string()))
            .match_body(Matcher::PartialJson(serde_json::json!({
                "vehicleId": "EV-0A1B2C3D",
                "imageBase64": "/9gBAv/Z",
                "imageWidth": 1280,
                "imageHeight": 720,
                "imageSizeBytes": 6,
                "cameraCount": 2,
                "status": { "recording": false }
            })))
            .with_status(200)
            .with_body("ok")
            .create_async()
            .await;

        let client = SubmissionClient::new().unwrap();
        let receipt = client
            .push(request(format!("{}/heartbeat", server.url())))
            .await
            .unwrap();

        assert_eq!(receipt, PushReceipt { status: 200, body: "ok".to_string() });
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn missing_status_is_json_null() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/")
            .match_body(Matcher::PartialJson(serde_json::json!({ "status": null })))
            .with_status(204)
            .create_async()
            .await;

        let mut req = request(server.url());
        req.status_json = None;
        let receipt = SubmissionClient::new().unwrap().push(req).await.unwrap();
        assert_eq!(receipt.status, 204);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn non_success_status_is_a_protocol_error() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/")
            .with_status(401)
            .with_body("bad signature")
            .create_async()
            .await;

        let err = SubmissionClient::new()
            .unwrap()
            .push(request(server.url()))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            HeartbeatError::Protocol {
                status: 401,
                body: "bad signature".to_string()
            }
        );
    }

    #[tokio::test]
    async fn preconditions_fail_without_network() {
        let client = SubmissionClient::new().unwrap();

        let err = client.push(request(String::new())).await.unwrap_err();
        assert!(matches!(err, HeartbeatError::Config(_)));

        let mut req = request("http://127.0.0.1:9".to_string());
        req.image_bytes.clear();
        assert!(matches!(client.push(req).await, Err(HeartbeatError::Capture(_))));

        let mut req = request("http://127.0.0.1:9".to_string());
        req.secret.clear();
        assert!(matches!(client.push(req).await, Err(HeartbeatError::Signature(_))));
    }

    #[tokio::test]
    async fn invalid_status_json_is_unexpected() {
        let mut req = request("http://127.0.0.1:9".to_string());
        req.status_json = Some("{not json".to_string());
        let err = SubmissionClient::new().unwrap().push(req).await.unwrap_err();
        assert!(matches!(err, HeartbeatError::Unexpected(_)));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_a_network_error() {
        // port 9 (discard) is closed on test hosts
        let err = SubmissionClient::new()
            .unwrap()
            .push(request("http://127.0.0.1:9/".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, HeartbeatError::Network(_)));
    }
}
