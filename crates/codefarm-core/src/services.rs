//! Cross-service calls made on behalf of running jobs.

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;

use crate::Result;
use crate::callback::TypeName;

/// Port to the other platform services (artifact repo, log repo, code repo, ...).
///
/// Every method returns the `data` part of the service's response.
#[async_trait]
pub trait PlatformServices: Send + Sync {
    /// Read a typed record, a collection, or a getter of a record.
    async fn read_type(
        &self,
        type_name: &TypeName,
        id: Option<&str>,
        getter: Option<&str>,
    ) -> Result<Value>;

    async fn create_type(&self, type_name: &TypeName, data: Value) -> Result<Value>;

    async fn update_type(&self, type_name: &TypeName, id: &str, data: Value) -> Result<Value>;

    async fn type_action(
        &self,
        type_name: &TypeName,
        id: &str,
        action: &str,
        data: Value,
    ) -> Result<Value>;

    /// Upload file content to `<service>/<kind>/<id>/upload`.
    async fn upload_file(&self, target: &TypeName, id: &str, content: Bytes) -> Result<Value>;

    async fn merge_revision(&self, revision_id: &str) -> Result<Value>;

    /// Allocate a new log and return its id.
    async fn allocate_log(&self, name: &str, tags: &[String]) -> Result<String>;
}
