// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Provisioning Control API
//!
//! Client for the hosted-broker control API used to create disposable broker
//! instances for test runs. Requests authenticate with a `Basic` header built
//! from an empty user name and the API key.
//!
//! Replies distinguish transport failures (`Err`, worth retrying) from
//! application errors reported by the API (`ApiReply::Rejected`, terminal).

use crate::errors::BusError;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use reqwest::{header::AUTHORIZATION, Client, RequestBuilder};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Base address of the customer control API
pub const CONTROL_API_URL: &str = "https://customer.cloudamqp.com/api";

/// A broker instance as listed by the control API.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Instance {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub plan: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// A region instances can be created in.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Region {
    pub provider: String,
    pub region: String,
    pub name: String,
    #[serde(default)]
    pub has_shared_plans: bool,
}

impl Region {
    /// Identifier used when creating an instance, `<provider>::<region>`.
    pub fn id(&self) -> String {
        format!("{}::{}", self.provider, self.region)
    }
}

/// Body of an instance creation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewInstance {
    pub name: String,
    pub plan: String,
    pub region: String,
    pub tags: Vec<String>,
}

/// A freshly created instance.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CreatedInstance {
    pub id: u64,
    pub url: String,
    #[serde(default)]
    pub apikey: String,
}

/// Outcome of a call the API answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiReply<T> {
    Data(T),
    /// Application error reported by the API
    Rejected(String),
}

/// Operations of the provisioning control API.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ControlApi: Send + Sync + 'static {
    async fn list_instances(&self) -> Result<ApiReply<Vec<Instance>>, BusError>;

    async fn list_regions(&self) -> Result<ApiReply<Vec<Region>>, BusError>;

    async fn create_instance(
        &self,
        request: &NewInstance,
    ) -> Result<ApiReply<CreatedInstance>, BusError>;

    async fn delete_instance(&self, id: u64) -> Result<(), BusError>;
}

/// [`ControlApi`] over HTTPS.
#[derive(Clone)]
pub struct HttpControlApi {
    client: Client,
    base_url: String,
    authorization: String,
}

impl HttpControlApi {
    pub fn new(api_key: &str) -> HttpControlApi {
        Self::with_base_url(api_key, CONTROL_API_URL)
    }

    pub fn with_base_url(api_key: &str, base_url: &str) -> HttpControlApi {
        HttpControlApi {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_owned(),
            authorization: authorization_header(api_key),
        }
    }

    fn request(&self, builder: RequestBuilder) -> RequestBuilder {
        builder.header(AUTHORIZATION, &self.authorization)
    }

    async fn send<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<ApiReply<T>, BusError> {
        let response = self
            .request(builder)
            .send()
            .await
            .map_err(|err| BusError::ControlApiError(err.to_string()))?;

        let body: Value = response
            .json()
            .await
            .map_err(|err| BusError::ControlApiError(err.to_string()))?;

        parse_reply(body)
    }
}

#[async_trait]
impl ControlApi for HttpControlApi {
    async fn list_instances(&self) -> Result<ApiReply<Vec<Instance>>, BusError> {
        debug!("listing control api instances");
        self.send(self.client.get(format!("{}/instances", self.base_url)))
            .await
    }

    async fn list_regions(&self) -> Result<ApiReply<Vec<Region>>, BusError> {
        debug!("listing control api regions");
        self.send(self.client.get(format!("{}/regions", self.base_url)))
            .await
    }

    async fn create_instance(
        &self,
        request: &NewInstance,
    ) -> Result<ApiReply<CreatedInstance>, BusError> {
        self.send(
            self.client
                .post(format!("{}/instances", self.base_url))
                .json(request),
        )
        .await
    }

    async fn delete_instance(&self, id: u64) -> Result<(), BusError> {
        let response = self
            .request(self.client.delete(format!("{}/instances/{}", self.base_url, id)))
            .send()
            .await
            .map_err(|err| BusError::ControlApiError(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(BusError::ControlApiError(format!("{status}: {text}")));
        }

        Ok(())
    }
}

/// `Basic` credentials with an empty user name and the API key as password.
pub fn authorization_header(api_key: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!(":{api_key}")))
}

fn parse_reply<T: DeserializeOwned>(body: Value) -> Result<ApiReply<T>, BusError> {
    if let Some(error) = body.get("error") {
        let reason = match error {
            Value::String(reason) => reason.clone(),
            other => other.to_string(),
        };
        return Ok(ApiReply::Rejected(reason));
    }

    serde_json::from_value(body)
        .map(ApiReply::Data)
        .map_err(|err| BusError::ControlApiError(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builds_basic_credentials_from_the_api_key() {
        assert_eq!(authorization_header("secret"), "Basic OnNlY3JldA==");
    }

    #[test]
    fn reported_errors_are_rejections() {
        let reply: ApiReply<Vec<Instance>> =
            parse_reply(json!({"error": "Invalid API key"})).unwrap();
        assert_eq!(reply, ApiReply::Rejected("Invalid API key".into()));
    }

    #[test]
    fn parses_data_replies() {
        let reply: ApiReply<Vec<Region>> = parse_reply(json!([{
            "provider": "amazon-web-services",
            "region": "us-east-1",
            "name": "US-East-1 (Northern Virginia)",
            "has_shared_plans": true
        }]))
        .unwrap();

        let ApiReply::Data(regions) = reply else {
            panic!("expected data");
        };
        assert_eq!(regions[0].id(), "amazon-web-services::us-east-1");
    }

    #[test]
    fn unexpected_shapes_are_transport_errors() {
        let reply: Result<ApiReply<CreatedInstance>, BusError> = parse_reply(json!("oops"));
        assert!(matches!(reply, Err(BusError::ControlApiError(_))));
    }
}
