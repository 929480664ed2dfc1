//! HTTP client for the other platform services.

use async_trait::async_trait;
use bytes::Bytes;
use codefarm_core::callback::TypeName;
use codefarm_core::services::PlatformServices;
use codefarm_core::{Error, Result};
use serde_json::{Value, json};
use std::collections::HashMap;
use tracing::debug;
use url::Url;

/// Calls platform services over their REST interface.
///
/// A type name `service.type` resolves to `<endpoint of service>/<type>`.
pub struct HttpServices {
    client: reqwest::Client,
    endpoints: HashMap<String, Url>,
}

impl HttpServices {
    pub fn new(endpoints: HashMap<String, Url>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoints,
        }
    }

    /// `<endpoint>/<segment>/<segment>...`, each segment percent-encoded.
    fn url(&self, service: &str, segments: &[&str]) -> Result<Url> {
        let base = self
            .endpoints
            .get(service)
            .ok_or_else(|| Error::Unavailable(format!("no endpoint for service {}", service)))?;
        let path: Vec<String> = segments
            .iter()
            .map(|s| urlencoding::encode(s).into_owned())
            .collect();
        let url = format!("{}/{}", base.as_str().trim_end_matches('/'), path.join("/"));
        Url::parse(&url).map_err(|e| Error::InvalidInput(format!("{}: {}", url, e)))
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Value> {
        let response = request
            .send()
            .await
            .map_err(|e| Error::Unavailable(e.to_string()))?;

        let status = response.status();
        let url = response.url().clone();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::ExecutionFailed(format!(
                "{} returned {}: {}",
                url, status, text
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| Error::ExecutionFailed(format!("invalid response from {}: {}", url, e)))?;
        debug!(url = %url, "Service call succeeded");
        unwrap_envelope(body)
    }
}

/// Extract `data` from a `{ "result": ..., "data": ... }` response.
///
/// Bodies without a `result` field are returned as they are.
fn unwrap_envelope(body: Value) -> Result<Value> {
    let result = match body.get("result").and_then(Value::as_str) {
        Some(result) => result.to_string(),
        None => return Ok(body),
    };
    if result == "success" {
        return Ok(body.get("data").cloned().unwrap_or(Value::Null));
    }
    let message = body
        .get("error")
        .map(|e| match e {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .unwrap_or_else(|| format!("service reported {}", result));
    Err(Error::ExecutionFailed(message))
}

#[async_trait]
impl PlatformServices for HttpServices {
    async fn read_type(
        &self,
        type_name: &TypeName,
        id: Option<&str>,
        getter: Option<&str>,
    ) -> Result<Value> {
        let mut segments = vec![type_name.kind.as_str()];
        segments.extend(id);
        segments.extend(getter);
        let url = self.url(&type_name.service, &segments)?;
        self.send(self.client.get(url)).await
    }

    async fn create_type(&self, type_name: &TypeName, data: Value) -> Result<Value> {
        let url = self.url(&type_name.service, &[type_name.kind.as_str()])?;
        self.send(self.client.post(url).json(&data)).await
    }

    async fn update_type(&self, type_name: &TypeName, id: &str, data: Value) -> Result<Value> {
        let url = self.url(&type_name.service, &[type_name.kind.as_str(), id])?;
        self.send(self.client.patch(url).json(&data)).await
    }

    async fn type_action(
        &self,
        type_name: &TypeName,
        id: &str,
        action: &str,
        data: Value,
    ) -> Result<Value> {
        let url = self.url(&type_name.service, &[type_name.kind.as_str(), id, action])?;
        self.send(self.client.post(url).json(&data)).await
    }

    async fn upload_file(&self, target: &TypeName, id: &str, content: Bytes) -> Result<Value> {
        let url = self.url(&target.service, &[target.kind.as_str(), id, "upload"])?;
        self.send(
            self.client
                .post(url)
                .header("Content-Type", "application/octet-stream")
                .body(content),
        )
        .await
    }

    async fn merge_revision(&self, revision_id: &str) -> Result<Value> {
        let url = self.url("coderepo", &["revision", revision_id, "merge"])?;
        self.send(self.client.post(url)).await
    }

    async fn allocate_log(&self, name: &str, tags: &[String]) -> Result<String> {
        let url = self.url("logrepo", &["log"])?;
        let created = self
            .send(self.client.post(url).json(&json!({ "name": name, "tags": tags })))
            .await?;
        created
            .get("_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::ExecutionFailed("logrepo returned no log id".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn services() -> HttpServices {
        let mut endpoints = HashMap::new();
        endpoints.insert(
            "artifactrepo".to_string(),
            Url::parse("http://localhost:9001/api/").unwrap(),
        );
        HttpServices::new(endpoints)
    }

    #[test]
    fn test_url_joins_and_encodes_segments() {
        let url = services()
            .url("artifactrepo", &["artifact", "a b/c", "upload"])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "http://localhost:9001/api/artifact/a%20b%2Fc/upload"
        );
    }

    #[test]
    fn test_unknown_service_is_unavailable() {
        assert!(matches!(
            services().url("coderepo", &["revision"]),
            Err(Error::Unavailable(_))
        ));
    }

    #[test]
    fn test_unwrap_envelope() {
        let data = unwrap_envelope(json!({ "result": "success", "data": { "_id": "x" } })).unwrap();
        assert_eq!(data, json!({ "_id": "x" }));

        let err = unwrap_envelope(json!({ "result": "fail", "error": "no such artifact" }))
            .unwrap_err();
        assert!(err.to_string().contains("no such artifact"));

        let raw = unwrap_envelope(json!([1, 2])).unwrap();
        assert_eq!(raw, json!([1, 2]));
    }
}
