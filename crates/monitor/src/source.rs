//! Data source access: the gateway/DER model as the API reports it, the
//! `DataSource` seam used by the reconciler, and the GraphQL client that
//! implements it in production.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::warn;

use crate::error::FetchError;
use crate::timestamp::RawTimestamp;

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gateway {
    pub id: String,
    pub name: String,
    #[serde(rename = "typeOf", default)]
    pub type_of: Option<String>,
    #[serde(rename = "ders", default)]
    pub devices: Vec<Device>,
}

/// A distributed energy resource attached to a gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    #[serde(rename = "type", default)]
    pub der_type: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "sn", default)]
    pub serial: Option<String>,
    #[serde(default)]
    pub meta: Option<DeviceMeta>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceMeta {
    #[serde(default)]
    pub make: Option<String>,
    #[serde(rename = "nominalPower", default)]
    pub nominal_power: Option<f64>,
}

/// Latest reading for one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    #[serde(default)]
    pub ts: Option<RawTimestamp>,
    #[serde(default)]
    pub power: Option<f64>,
}

/// Everything fetched for a gateway in one go: its description plus the
/// latest reading of every device that reported one, keyed by serial.
#[derive(Debug, Clone)]
pub struct GatewaySnapshot {
    pub gateway: Gateway,
    pub readings: HashMap<String, Reading>,
}

// ---------------------------------------------------------------------------
// Seam
// ---------------------------------------------------------------------------

#[async_trait]
pub trait DataSource: Send + Sync {
    /// `Ok(None)` when the data source does not know the gateway.
    async fn fetch_gateway(&self, gateway_id: &str) -> Result<Option<Gateway>, FetchError>;

    /// `Ok(None)` when the device has no reading.
    async fn fetch_latest_reading(&self, serial: &str) -> Result<Option<Reading>, FetchError>;
}

/// Fetch a gateway and the latest reading of each of its devices. Every
/// request is bounded by `timeout` on its own: a slow or failed gateway
/// lookup fails the snapshot, a slow or failed reading only drops that
/// device's data.
pub async fn fetch_snapshot(
    source: &dyn DataSource,
    gateway_id: &str,
    timeout: Duration,
) -> Result<GatewaySnapshot, FetchError> {
    let gateway = tokio::time::timeout(timeout, source.fetch_gateway(gateway_id))
        .await
        .map_err(|_| FetchError::Timeout(timeout))??
        .ok_or_else(|| FetchError::NotFound(gateway_id.to_string()))?;

    let mut readings = HashMap::new();
    for serial in gateway.devices.iter().filter_map(|d| d.serial.as_deref()) {
        let result = tokio::time::timeout(timeout, source.fetch_latest_reading(serial))
            .await
            .unwrap_or(Err(FetchError::Timeout(timeout)));
        match result {
            Ok(Some(reading)) => {
                readings.insert(serial.to_string(), reading);
            }
            Ok(None) => {}
            Err(e) => {
                warn!(gateway = %gateway_id, serial, "reading fetch failed: {e}");
            }
        }
    }

    Ok(GatewaySnapshot { gateway, readings })
}

// ---------------------------------------------------------------------------
// GraphQL client
// ---------------------------------------------------------------------------

const GATEWAY_QUERY: &str = r#"
query {
  gateway {
    gateway(id: __ID__) {
      name
      id
      typeOf
      ders {
        type
        name
        sn
        meta {
          make
          nominalPower
        }
      }
    }
  }
}"#;

const DER_DATA_QUERY: &str = r#"
query {
  derData {
    solar(sn: __SN__) {
      latest {
        ts
        power
      }
    }
  }
}"#;

#[derive(Debug, Deserialize)]
struct GraphQlResponse<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Option<Vec<serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
struct GatewayData {
    gateway: Option<GatewayField>,
}

#[derive(Debug, Deserialize)]
struct GatewayField {
    gateway: Option<Gateway>,
}

#[derive(Debug, Deserialize)]
struct DerDataRoot {
    #[serde(rename = "derData")]
    der_data: Option<DerData>,
}

#[derive(Debug, Deserialize)]
struct DerData {
    solar: Option<SolarData>,
}

#[derive(Debug, Deserialize)]
struct SolarData {
    latest: Option<Reading>,
}

/// Client for the Srcful GraphQL API.
#[derive(Clone)]
pub struct SrcfulClient {
    api_url: String,
    auth_token: String,
    client: reqwest::Client,
}

impl SrcfulClient {
    pub fn new(api_url: &str, auth_token: &str, request_timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            api_url: api_url.to_string(),
            auth_token: auth_token.to_string(),
            client,
        })
    }

    async fn query<T: serde::de::DeserializeOwned>(&self, query: String) -> Result<Option<T>, FetchError> {
        let response: GraphQlResponse<T> = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.auth_token)
            .json(&serde_json::json!({ "query": query }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if let Some(errors) = response.errors.filter(|e| !e.is_empty()) {
            return Err(FetchError::Api(serde_json::Value::Array(errors).to_string()));
        }
        Ok(response.data)
    }
}

/// Render an identifier as a GraphQL string literal.
fn graphql_string(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}

#[async_trait]
impl DataSource for SrcfulClient {
    async fn fetch_gateway(&self, gateway_id: &str) -> Result<Option<Gateway>, FetchError> {
        let query = GATEWAY_QUERY.replace("__ID__", &graphql_string(gateway_id));
        let data: Option<GatewayData> = self.query(query).await?;
        Ok(data.and_then(|d| d.gateway).and_then(|g| g.gateway))
    }

    async fn fetch_latest_reading(&self, serial: &str) -> Result<Option<Reading>, FetchError> {
        let query = DER_DATA_QUERY.replace("__SN__", &graphql_string(serial));
        let data: Option<DerDataRoot> = self.query(query).await?;
        Ok(data
            .and_then(|d| d.der_data)
            .and_then(|d| d.solar)
            .and_then(|s| s.latest))
    }
}

// ===========================================================================
// Tests
// ===========================================================================
