//! Object model shared by clusters, handlers and reconcilers.
//!
//! Objects are schemaless: identity lives in [`ObjectMeta`], everything else is
//! an opaque JSON payload. Typed resources are a concern of the cluster backend.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::result::Result;

/// Group/version/kind of a resource type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKind {
    /// API group, empty for the core group.
    #[serde(default)]
    pub group: String,
    /// API version.
    pub version: String,
    /// Kind name, e.g. `Pod`.
    pub kind: String,
}

impl ResourceKind {
    /// Create a new resource kind.
    pub fn new(group: impl Into<String>, version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            kind: kind.into(),
        }
    }

    /// Parse an `apiVersion` string (`group/version` or `version`) plus a kind.
    pub fn from_api_version(api_version: &str, kind: impl Into<String>) -> Self {
        let (group, version) = split_api_version(api_version);
        Self::new(group, version, kind)
    }

    /// `group/version`, or just `version` for the core group.
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// Whether `other` names the same group and kind, ignoring version.
    pub fn same_group_kind(&self, other: &Self) -> bool {
        self.group == other.group && self.kind == other.kind
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}", self.version, self.kind)
        } else {
            write!(f, "{}/{}/{}", self.group, self.version, self.kind)
        }
    }
}

fn split_api_version(api_version: &str) -> (&str, &str) {
    api_version
        .split_once('/')
        .unwrap_or(("", api_version))
}

/// Reference from a dependent object to its owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    /// `apiVersion` of the owner.
    pub api_version: String,
    /// Kind of the owner.
    pub kind: String,
    /// Name of the owner.
    pub name: String,
    /// UID of the owner.
    #[serde(default)]
    pub uid: String,
    /// Whether the owner is the managing controller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller: Option<bool>,
}

impl OwnerReference {
    /// Build a controlling reference to `owner`.
    pub fn controller_of(owner: &DynamicObject) -> Result<Self> {
        let name = owner.metadata.require_name()?;
        Ok(Self {
            api_version: owner.kind.api_version(),
            kind: owner.kind.kind.clone(),
            name: name.to_string(),
            uid: owner.metadata.uid.clone().unwrap_or_default(),
            controller: Some(true),
        })
    }

    /// Group/version/kind this reference points at.
    pub fn resource_kind(&self) -> ResourceKind {
        ResourceKind::from_api_version(&self.api_version, self.kind.clone())
    }

    /// Whether this is the controlling reference.
    pub fn is_controller(&self) -> bool {
        self.controller.unwrap_or(false)
    }
}

/// Standard object metadata.
///
/// `name` is optional so that malformed payloads can be represented; anything
/// that needs an identity goes through [`ObjectMeta::require_name`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owner_references: Vec<OwnerReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    #[serde(default)]
    pub generation: i64,
}

impl ObjectMeta {
    /// Name of the object, or a [`Error::MissingMetadata`] when absent or empty.
    pub fn require_name(&self) -> Result<&str> {
        match self.name.as_deref() {
            Some(name) if !name.is_empty() => Ok(name),
            _ => Err(Error::missing_metadata("object has no name")),
        }
    }

    /// Namespace, empty for cluster-scoped objects.
    pub fn namespace_or_empty(&self) -> &str {
        self.namespace.as_deref().unwrap_or("")
    }
}

/// Namespace/name pair identifying an object within one cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NamespacedName {
    pub namespace: String,
    pub name: String,
}

impl NamespacedName {
    /// Create a new namespaced name.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

/// A resource of any kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DynamicObject {
    pub kind: ResourceKind,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl DynamicObject {
    /// Create a namespaced object with an empty payload.
    pub fn new(kind: ResourceKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        let namespace = namespace.into();
        Self {
            kind,
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: (!namespace.is_empty()).then_some(namespace),
                ..ObjectMeta::default()
            },
            data: serde_json::Value::Null,
        }
    }

    /// Set the payload.
    #[must_use]
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    /// Add a label.
    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.labels.insert(key.into(), value.into());
        self
    }

    /// Add an annotation.
    #[must_use]
    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.annotations.insert(key.into(), value.into());
        self
    }

    /// Add an owner reference.
    #[must_use]
    pub fn with_owner(mut self, owner: OwnerReference) -> Self {
        self.metadata.owner_references.push(owner);
        self
    }

    /// Namespace/name of this object, failing when it has no name.
    pub fn namespaced_name(&self) -> Result<NamespacedName> {
        let name = self.metadata.require_name()?;
        Ok(NamespacedName::new(self.metadata.namespace_or_empty(), name))
    }
}
