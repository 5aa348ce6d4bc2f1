//! Device service over HTTP.
//!
//! `POST request-id` returns `{"request-id": ...}`; `POST serial` takes the
//! signed serial request and answers 200 with the serial assertion or 202
//! while the serial is being prepared; `POST session` opens a store
//! session for a model.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use dl_core::model::ModelAssertion;
use dl_core::ports::{DeviceServiceError, DeviceServicePort, SerialResponse};
use dl_core::{DeviceState, SerialAssertion};

const SERIAL_REQUEST_CONTENT_TYPE: &str = "application/x.devicelife.serial-request";

pub struct HttpDeviceService {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct RequestIdResponse {
    #[serde(rename = "request-id")]
    request_id: String,
}

#[derive(Deserialize)]
struct SessionResponse {
    macaroon: String,
}

impl HttpDeviceService {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, DeviceServiceError> {
        reqwest::Url::parse(base_url).map_err(|e| {
            DeviceServiceError::Rejected(format!("invalid device service URL {base_url:?}: {e}"))
        })?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DeviceServiceError::Rejected(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, DeviceServiceError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let msg = format!("unexpected status {status}: {}", body.trim());
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            Err(DeviceServiceError::Transient(msg))
        } else {
            Err(DeviceServiceError::Rejected(msg))
        }
    }
}

fn transport(err: reqwest::Error) -> DeviceServiceError {
    DeviceServiceError::Transient(err.to_string())
}

fn decode(err: reqwest::Error) -> DeviceServiceError {
    DeviceServiceError::Rejected(format!("cannot decode response: {err}"))
}

#[async_trait]
impl DeviceServicePort for HttpDeviceService {
    async fn request_id(&self) -> Result<String, DeviceServiceError> {
        let response = self
            .client
            .post(self.url("request-id"))
            .send()
            .await
            .map_err(transport)?;
        let body: RequestIdResponse = Self::check(response).await?.json().await.map_err(decode)?;
        Ok(body.request_id)
    }

    async fn submit_serial_request(
        &self,
        request: &str,
    ) -> Result<SerialResponse, DeviceServiceError> {
        let response = self
            .client
            .post(self.url("serial"))
            .header(reqwest::header::CONTENT_TYPE, SERIAL_REQUEST_CONTENT_TYPE)
            .body(request.to_string())
            .send()
            .await
            .map_err(transport)?;
        let response = Self::check(response).await?;
        if response.status() == StatusCode::ACCEPTED {
            debug!("serial request accepted, serial not ready yet");
            return Ok(SerialResponse::Poll);
        }
        let serial: SerialAssertion = response.json().await.map_err(decode)?;
        Ok(SerialResponse::Issued(serial))
    }

    async fn open_store_session(
        &self,
        model: &ModelAssertion,
        device: &DeviceState,
    ) -> Result<String, DeviceServiceError> {
        let response = self
            .client
            .post(self.url("session"))
            .json(&json!({
                "brand-id": model.brand_id,
                "model": model.model,
                "store": model.store,
                "serial": device.serial,
            }))
            .send()
            .await
            .map_err(transport)?;
        let body: SessionResponse = Self::check(response).await?.json().await.map_err(decode)?;
        Ok(body.macaroon)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Server;

    fn service(url: String) -> HttpDeviceService {
        HttpDeviceService::new(&url, Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn request_id_is_fetched() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/request-id")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"request-id":"REQ-1"}"#)
            .create_async()
            .await;

        let id = service(server.url()).request_id().await.unwrap();

        mock.assert_async().await;
        assert_eq!(id, "REQ-1");
    }

    #[tokio::test]
    async fn accepted_serial_request_means_poll() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/serial")
            .match_header("content-type", SERIAL_REQUEST_CONTENT_TYPE)
            .match_body("body\nsig")
            .with_status(202)
            .create_async()
            .await;

        let response = service(server.url())
            .submit_serial_request("body\nsig")
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(response, SerialResponse::Poll);
    }

    #[tokio::test]
    async fn issued_serial_is_decoded() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/serial")
            .with_status(200)
            .with_body(
                r#"{"brand_id":"canonical","model":"pc","serial":"s-1","device_key_id":"abcd"}"#,
            )
            .create_async()
            .await;

        let response = service(server.url())
            .submit_serial_request("body\nsig")
            .await
            .unwrap();

        let SerialResponse::Issued(serial) = response else {
            panic!("expected an issued serial");
        };
        assert_eq!(serial.serial, "s-1");
        assert!(serial.matches("canonical", "pc", "abcd"));
    }

    #[tokio::test]
    async fn server_errors_are_transient_and_client_errors_rejected() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/serial")
            .with_status(503)
            .create_async()
            .await;
        let err = service(server.url())
            .submit_serial_request("x")
            .await
            .unwrap_err();
        assert!(matches!(err, DeviceServiceError::Transient(_)));

        let mut server = Server::new_async().await;
        server
            .mock("POST", "/serial")
            .with_status(400)
            .with_body("bad signature")
            .create_async()
            .await;
        let err = service(server.url())
            .submit_serial_request("x")
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "unexpected status 400 Bad Request: bad signature");
    }
}
