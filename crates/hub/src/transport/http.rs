//! HTTP poll transport: one request per tick, value pulled out of the JSON
//! response body.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;

use super::{lookup_path, number, Delivery, SampleSender, Transport};
use crate::error::{Result, SensorError};
use crate::model::{ConnectionParams, HttpMethod};

pub struct HttpTransport {
    sensor_id: String,
    parameter: String,
    url: String,
    method: HttpMethod,
    json_path: Option<String>,
    body: Option<Value>,
    client: Option<reqwest::Client>,
}

impl HttpTransport {
    pub fn new(sensor_id: &str, parameter: &str, params: &ConnectionParams, timeout: Duration) -> Result<Self> {
        let ConnectionParams::Http {
            url,
            method,
            json_path,
            headers,
            body,
        } = params
        else {
            return Err(SensorError::config(sensor_id, "not an http connection"));
        };

        reqwest::Url::parse(url).map_err(|e| SensorError::config(sensor_id, format!("url {url:?}: {e}")))?;

        let mut default_headers = HeaderMap::new();
        for (k, v) in headers {
            let name = HeaderName::from_bytes(k.as_bytes())
                .map_err(|e| SensorError::config(sensor_id, format!("header {k:?}: {e}")))?;
            let value = HeaderValue::from_str(v)
                .map_err(|e| SensorError::config(sensor_id, format!("header {k:?} value: {e}")))?;
            default_headers.insert(name, value);
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(default_headers)
            .build()
            .map_err(|e| SensorError::connection(sensor_id, e))?;

        Ok(Self {
            sensor_id: sensor_id.to_string(),
            parameter: parameter.to_string(),
            url: url.clone(),
            method: *method,
            json_path: json_path.clone(),
            body: body.clone(),
            client: Some(client),
        })
    }
}

/// Pull the reading out of a response document.
///
/// With an explicit path only that path is tried. Otherwise `value`, then
/// `data.value`, then a top-level field named after the parameter.
pub(crate) fn extract_value(doc: &Value, json_path: Option<&str>, parameter: &str) -> Option<f64> {
    if let Some(path) = json_path {
        return lookup_path(doc, path).and_then(number);
    }
    if let Some(n) = number(doc) {
        return Some(n);
    }
    ["value", "data.value", parameter]
        .iter()
        .find_map(|p| lookup_path(doc, p).and_then(number))
}

#[async_trait]
impl Transport for HttpTransport {
    fn delivery(&self) -> Delivery {
        Delivery::Pull
    }

    async fn read_once(&mut self) -> Result<f64> {
        let id = self.sensor_id.as_str();
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| SensorError::connection(id, "client closed"))?;

        let request = match self.method {
            HttpMethod::Get => client.get(&self.url),
            HttpMethod::Post => {
                let req = client.post(&self.url);
                match &self.body {
                    Some(body) => req.json(body),
                    None => req,
                }
            }
        };

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() || e.is_connect() {
                SensorError::connection(id, e)
            } else {
                SensorError::read(id, e)
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(SensorError::read(id, format!("{} returned {status}", self.url)));
        }

        let doc: Value = response
            .json()
            .await
            .map_err(|e| SensorError::parse(id, format!("response is not json: {e}")))?;

        extract_value(&doc, self.json_path.as_deref(), &self.parameter).ok_or_else(|| {
            let wanted = self.json_path.as_deref().unwrap_or("value | data.value | <parameter>");
            SensorError::parse(id, format!("no numeric field at {wanted}"))
        })
    }

    async fn subscribe(&mut self, _tx: SampleSender) -> Result<()> {
        Err(SensorError::UnsupportedOperation(
            "http devices are polled, not subscribed".into(),
        ))
    }

    async fn close(&mut self) {
        self.client = None;
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode, routing::get, routing::post, Json, Router};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn params(url: String, method: HttpMethod, json_path: Option<&str>) -> ConnectionParams {
        ConnectionParams::Http {
            url,
            method,
            json_path: json_path.map(str::to_string),
            headers: BTreeMap::from([("x-api-key".to_string(), "k".to_string())]),
            body: Some(json!({"probe": 2})),
        }
    }

    async fn spawn_server() -> String {
        let app = Router::new()
            .route("/flat", get(|| async { Json(json!({"value": 1.9})) }))
            .route("/nested", get(|| async { Json(json!({"data": {"value": "412"}})) }))
            .route("/named", get(|| async { Json(json!({"co2": 655, "unit": "ppm"})) }))
            .route("/deep", get(|| async { Json(json!({"probes": [{"ec": 1.2}, {"ec": 1.6}]})) }))
            .route("/echo", post(|Json(b): Json<Value>| async move { Json(json!({"value": b["probe"]})) }))
            .route("/down", get(|| async { (StatusCode::SERVICE_UNAVAILABLE, "maintenance") }))
            .route("/text", get(|| async { "not json" }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    async fn read(base: &str, path: &str, method: HttpMethod, json_path: Option<&str>, parameter: &str) -> Result<f64> {
        let mut t = HttpTransport::new(
            "dev-1",
            parameter,
            &params(format!("{base}{path}"), method, json_path),
            Duration::from_secs(5),
        )?;
        t.read_once().await
    }

    #[tokio::test]
    async fn default_lookup_order() {
        let base = spawn_server().await;
        assert_eq!(read(&base, "/flat", HttpMethod::Get, None, "ec").await.unwrap(), 1.9);
        assert_eq!(read(&base, "/nested", HttpMethod::Get, None, "co2").await.unwrap(), 412.0);
        assert_eq!(read(&base, "/named", HttpMethod::Get, None, "co2").await.unwrap(), 655.0);
    }

    #[tokio::test]
    async fn explicit_path_and_post_body() {
        let base = spawn_server().await;
        let v = read(&base, "/deep", HttpMethod::Get, Some("probes.1.ec"), "ec").await.unwrap();
        assert_eq!(v, 1.6);
        let v = read(&base, "/echo", HttpMethod::Post, None, "ec").await.unwrap();
        assert_eq!(v, 2.0);
    }

    #[tokio::test]
    async fn non_2xx_and_bad_bodies_are_read_errors() {
        let base = spawn_server().await;
        assert!(matches!(
            read(&base, "/down", HttpMethod::Get, None, "ec").await,
            Err(SensorError::Read { .. })
        ));
        assert!(matches!(
            read(&base, "/text", HttpMethod::Get, None, "ec").await,
            Err(SensorError::Parse { .. })
        ));
        assert!(matches!(
            read(&base, "/named", HttpMethod::Get, None, "ph").await,
            Err(SensorError::Parse { .. })
        ));
    }

    #[test]
    fn invalid_url_is_a_configuration_error() {
        let err = HttpTransport::new(
            "dev-1",
            "ec",
            &params("not a url".into(), HttpMethod::Get, None),
            Duration::from_secs(1),
        )
        .err()
        .unwrap();
        assert!(matches!(err, SensorError::Configuration { .. }));
    }

    #[test]
    fn extract_value_prefers_explicit_path() {
        let doc = json!({"value": 1.0, "reading": {"ph": 6.1}});
        assert_eq!(extract_value(&doc, Some("reading.ph"), "ph"), Some(6.1));
        assert_eq!(extract_value(&doc, Some("reading.ec"), "ph"), None);
        assert_eq!(extract_value(&doc, None, "ph"), Some(1.0));
        assert_eq!(extract_value(&json!(3.5), None, "ph"), Some(3.5));
    }
}
