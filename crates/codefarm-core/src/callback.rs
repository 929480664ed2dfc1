//! Callback protocol between a running job script and the platform.
//!
//! A script talks back through its executor; each request becomes an
//! `executor.<kind>` event which the scheduler brokers and answers with
//! either a [`CallbackReply`] or an error message.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;

use crate::Error;

/// A platform type name of the form `service.type`, e.g. `artifactrepo.artifact`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TypeName {
    pub service: String,
    pub kind: String,
}

impl TypeName {
    pub fn new(service: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            kind: kind.into(),
        }
    }
}

impl FromStr for TypeName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('.') {
            Some((service, kind)) if !service.is_empty() && !kind.is_empty() => {
                Ok(Self::new(service, kind))
            }
            _ => Err(Error::InvalidInput(format!(
                "type name must be <service>.<type>, got '{}'",
                s
            ))),
        }
    }
}

impl TryFrom<String> for TypeName {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TypeName> for String {
    fn from(name: TypeName) -> Self {
        name.to_string()
    }
}

impl std::fmt::Display for TypeName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.service, self.kind)
    }
}

/// What a `file_upload` request archives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, derive_more::Display)]
#[serde(rename_all = "lowercase")]
pub enum UploadKind {
    #[display("artifact")]
    Artifact,
    #[display("log")]
    Log,
    /// A kind the platform does not know how to archive.
    #[display("{_0}")]
    #[serde(untagged)]
    Other(String),
}

/// Parameters of a `file_upload` request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSpec {
    /// Path of the file on the executor side.
    pub path: Option<String>,
    pub artifact_id: Option<String>,
    pub log_id: Option<String>,
    pub name: Option<String>,
    pub repository: Option<String>,
    pub version: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// A request from a running script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CallbackRequest {
    TypeRead {
        type_name: TypeName,
        id: Option<String>,
        getter: Option<String>,
    },
    TypeCreate {
        type_name: TypeName,
        data: Value,
    },
    TypeAction {
        type_name: TypeName,
        id: String,
        action: String,
        data: Value,
    },
    TypeUpdate {
        type_name: TypeName,
        id: String,
        data: Value,
    },
    FileUpload {
        upload: UploadKind,
        data: UploadSpec,
    },
    RevisionMerge {
        revision_id: Option<String>,
    },
}

impl CallbackRequest {
    /// Event topic this request arrives on.
    pub fn topic(&self) -> &'static str {
        match self {
            CallbackRequest::TypeRead { .. } => "executor.type_read",
            CallbackRequest::TypeCreate { .. } => "executor.type_create",
            CallbackRequest::TypeAction { .. } => "executor.type_action",
            CallbackRequest::TypeUpdate { .. } => "executor.type_update",
            CallbackRequest::FileUpload { .. } => "executor.file_upload",
            CallbackRequest::RevisionMerge { .. } => "executor.revision_merge",
        }
    }
}

/// Kind of a successful callback answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, derive_more::Display)]
#[serde(rename_all = "snake_case")]
pub enum ReplyKind {
    #[display("type_read")]
    TypeRead,
    #[display("type_created")]
    TypeCreated,
    #[display("type_action_done")]
    TypeActionDone,
    #[display("type_updated")]
    TypeUpdated,
    #[display("file_uploaded")]
    FileUploaded,
    #[display("revision_merged")]
    RevisionMerged,
}

/// A successful callback answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackReply {
    pub kind: ReplyKind,
    pub data: Value,
}

impl CallbackReply {
    pub fn new(kind: ReplyKind, data: Value) -> Self {
        Self { kind, data }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_type_name_parse() {
        let name: TypeName = "artifactrepo.artifact".parse().unwrap();
        assert_eq!(name.service, "artifactrepo");
        assert_eq!(name.kind, "artifact");
        assert!("artifact".parse::<TypeName>().is_err());
        assert!(".artifact".parse::<TypeName>().is_err());
    }

    #[test]
    fn test_request_wire_format() {
        let request: CallbackRequest = serde_json::from_value(json!({
            "kind": "type_create",
            "type_name": "exec.subjob",
            "data": { "name": "child" }
        }))
        .unwrap();
        assert_eq!(request.topic(), "executor.type_create");
        assert!(matches!(
            request,
            CallbackRequest::TypeCreate { ref type_name, .. } if type_name.kind == "subjob"
        ));
    }

    #[test]
    fn test_upload_spec_uses_camel_case() {
        let request: CallbackRequest = serde_json::from_value(json!({
            "kind": "file_upload",
            "upload": "log",
            "data": { "path": "out.txt", "logId": "l1" }
        }))
        .unwrap();
        match request {
            CallbackRequest::FileUpload { upload, data } => {
                assert_eq!(upload, UploadKind::Log);
                assert_eq!(data.log_id.as_deref(), Some("l1"));
                assert!(data.tags.is_empty());
            }
            other => panic!("unexpected request {:?}", other),
        }
    }
}
