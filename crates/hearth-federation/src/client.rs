//! Server-to-server HTTP client.
//!
//! [`Transport`] is everything the sender, key ring and backfill need from the
//! network. [`FederationClient`] implements it over HTTPS with `reqwest`,
//! signing every request except the unauthenticated key fetch and probe.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::{
    discovery::DiscoveryCache,
    error::FederationError,
    keys::ServerKeyPair,
    signatures::sign_request,
    types::{
        MissingEventsRequest, MissingEventsResponse, ServerKeyDocument, Transaction, TransactionResponse,
        VersionResponse,
    },
};

/// Outbound federation calls.
#[async_trait]
pub trait Transport: Send + Sync {
    /// `PUT /_hearth/federation/v1/send/{txnId}`
    async fn send_transaction(
        &self,
        destination: &str,
        txn_id: &str,
        txn: &Transaction,
    ) -> Result<TransactionResponse, FederationError>;

    /// Cheap liveness check (`GET /_hearth/federation/v1/version`).
    async fn probe(&self, destination: &str) -> Result<(), FederationError>;

    /// `GET /_hearth/key/v2/server`
    async fn fetch_server_keys(&self, destination: &str) -> Result<ServerKeyDocument, FederationError>;

    /// `POST /_hearth/federation/v1/get_missing_events/{roomId}`
    async fn get_missing_events(
        &self,
        destination: &str,
        room_id: &str,
        request: &MissingEventsRequest,
    ) -> Result<MissingEventsResponse, FederationError>;
}

// ─── Client ──────────────────────────────────────────────────────────────────

/// Async HTTP client for outbound server-to-server federation requests.
pub struct FederationClient {
    server_name: String,
    key_pair: Arc<ServerKeyPair>,
    http: Client,
    discovery: DiscoveryCache,
}

impl FederationClient {
    pub fn new(
        server_name: impl Into<String>,
        key_pair: Arc<ServerKeyPair>,
        request_timeout: Duration,
    ) -> Result<Self, FederationError> {
        let http = Client::builder()
            .timeout(request_timeout)
            .user_agent(concat!("Hearth-Federation/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            server_name: server_name.into(),
            key_pair,
            http,
            discovery: DiscoveryCache::new()?,
        })
    }

    async fn signed<T: DeserializeOwned>(
        &self,
        method: Method,
        destination: &str,
        uri: &str,
        body: Option<&Value>,
    ) -> Result<T, FederationError> {
        let auth = sign_request(&self.key_pair, &self.server_name, destination, method.as_str(), uri, body);
        let url = format!("{}{}", self.discovery.resolve(destination).await?, uri);
        debug!(destination = %destination, "Federation {} {}", method, url);

        let mut req = self.http.request(method, &url).header("Authorization", auth.to_header());
        if let Some(body) = body {
            req = req.json(body);
        }
        let resp = self.send(destination, req).await?;
        decode(destination, resp).await
    }

    async fn unsigned<T: DeserializeOwned>(&self, destination: &str, uri: &str) -> Result<T, FederationError> {
        let url = format!("{}{}", self.discovery.resolve(destination).await?, uri);
        debug!(destination = %destination, "Federation GET {}", url);
        let resp = self.send(destination, self.http.get(&url)).await?;
        decode(destination, resp).await
    }

    async fn send(
        &self,
        destination: &str,
        req: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, FederationError> {
        let resp = match req.send().await {
            Ok(resp) => resp,
            Err(e) => {
                // The delegation may have moved; resolve again next time.
                self.discovery.invalidate(destination).await;
                return Err(e.into());
            }
        };
        resp.error_for_status()
            .map_err(|e| FederationError::RemoteHttp(destination.to_owned(), e.to_string()))
    }
}

#[async_trait]
impl Transport for FederationClient {
    async fn send_transaction(
        &self,
        destination: &str,
        txn_id: &str,
        txn: &Transaction,
    ) -> Result<TransactionResponse, FederationError> {
        let uri = format!("/_hearth/federation/v1/send/{}", urlencoded(txn_id));
        let body = serde_json::to_value(txn)?;
        self.signed(Method::PUT, destination, &uri, Some(&body)).await
    }

    async fn probe(&self, destination: &str) -> Result<(), FederationError> {
        let _: VersionResponse = self.unsigned(destination, "/_hearth/federation/v1/version").await?;
        Ok(())
    }

    async fn fetch_server_keys(&self, destination: &str) -> Result<ServerKeyDocument, FederationError> {
        self.unsigned(destination, "/_hearth/key/v2/server").await
    }

    async fn get_missing_events(
        &self,
        destination: &str,
        room_id: &str,
        request: &MissingEventsRequest,
    ) -> Result<MissingEventsResponse, FederationError> {
        let uri = format!("/_hearth/federation/v1/get_missing_events/{}", urlencoded(room_id));
        let body = serde_json::to_value(request)?;
        self.signed(Method::POST, destination, &uri, Some(&body)).await
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

async fn decode<T: DeserializeOwned>(destination: &str, resp: reqwest::Response) -> Result<T, FederationError> {
    resp.json()
        .await
        .map_err(|e| FederationError::RemoteProtocol(destination.to_owned(), e.to_string()))
}

fn urlencoded(s: &str) -> String {
    url::form_urlencoded::byte_serialize(s.as_bytes()).collect()
}
