//! Platform data model
//!
//! Mirrors the JSON the platform API returns. Fields the client does not model
//! are kept in `extra` maps so that a read-modify-write never drops them.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Organization owning instances and workspaces
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Organization {
    /// Organization id
    pub id: String,
    /// Organization name
    pub name: String,
}

/// Tenancy boundary inside an organization
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workspace {
    /// Workspace id
    pub id: String,
    /// Workspace name
    pub name: String,
    /// True for the organization's default workspace
    #[serde(default)]
    pub is_default: bool,
}

/// One entry of an instance's IP allow list
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IpAllowListEntry {
    /// IPv4/IPv6 address or CIDR block
    pub ip: String,
    /// Optional human description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl IpAllowListEntry {
    /// Entry with a description
    pub fn new(ip: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            description: Some(description.into()),
        }
    }

    /// Entry without a description
    pub fn bare(ip: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            description: None,
        }
    }

    /// Treat an empty description like an absent one
    pub fn normalized(mut self) -> Self {
        if self.description.as_deref() == Some("") {
            self.description = None;
        }
        self
    }
}

/// Instance-level settings
///
/// Only the IP allow list is modelled; every other setting is carried
/// through unchanged in `extra`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSpec {
    /// Source-ip predicates gating ingress to the instance
    #[serde(default)]
    pub ip_allow_list: Vec<IpAllowListEntry>,
    /// Every other instance setting, round-tripped verbatim
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl InstanceSpec {
    /// Ips currently on the list
    pub fn ips(&self) -> impl Iterator<Item = &str> {
        self.ip_allow_list.iter().map(|e| e.ip.as_str())
    }
}

macro_rules! status_code_enum {
    (
        $(#[$meta:meta])*
        $name:ident, $prefix:literal {
            $($(#[$vmeta:meta])* $variant:ident => $wire:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(from = "String", into = "String")]
        pub enum $name {
            /// Status not reported
            #[default]
            Unknown,
            $($(#[$vmeta])* $variant,)+
        }

        impl $name {
            /// Short name, e.g. `HEALTHY`
            pub fn as_str(&self) -> &'static str {
                match self {
                    Self::Unknown => "UNKNOWN",
                    $(Self::$variant => $wire,)+
                }
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                let short = s.strip_prefix($prefix).unwrap_or(&s);
                match short.to_ascii_uppercase().as_str() {
                    $($wire => Self::$variant,)+
                    _ => Self::Unknown,
                }
            }
        }

        impl From<$name> for String {
            fn from(code: $name) -> String {
                format!("{}{}", $prefix, code.as_str())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

status_code_enum! {
    /// Runtime availability reported for instances and agents
    HealthStatusCode, "STATUS_CODE_" {
        /// Running and available
        Healthy => "HEALTHY",
        /// Converging
        Progressing => "PROGRESSING",
        /// Running with problems
        Degraded => "DEGRADED",
    }
}

status_code_enum! {
    /// Convergence of the platform's own controller
    ReconciliationStatusCode, "STATUS_CODE_" {
        /// Reconciled
        Successful => "SUCCESSFUL",
        /// Reconciliation in progress
        Progressing => "PROGRESSING",
        /// Reconciliation failed
        Failed => "FAILED",
    }
}

/// Health status with message
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    /// Status code
    #[serde(default)]
    pub code: HealthStatusCode,
    /// Detail from the platform
    #[serde(default)]
    pub message: String,
}

/// Reconciliation status with message
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationStatus {
    /// Status code
    #[serde(default)]
    pub code: ReconciliationStatusCode,
    /// Detail from the platform
    #[serde(default)]
    pub message: String,
}

/// A managed control plane hosted by the platform
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    /// Stable opaque id
    pub id: String,
    /// Human name
    pub name: String,
    /// Free-form description
    #[serde(default)]
    pub description: String,
    /// Control plane version
    #[serde(default)]
    pub version: String,
    /// Instance settings
    #[serde(default)]
    pub spec: InstanceSpec,
    /// Runtime health
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_status: Option<HealthStatus>,
    /// Platform reconciliation status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconciliation_status: Option<ReconciliationStatus>,
    /// Fields not modelled here
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Instance {
    /// Health code, `Unknown` when not reported
    pub fn health(&self) -> HealthStatusCode {
        self.health_status
            .as_ref()
            .map(|s| s.code)
            .unwrap_or_default()
    }
}

/// Kargo agent footprint
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum AgentSize {
    /// Let the platform choose
    #[default]
    Unspecified,
    /// Small footprint
    Small,
    /// Medium footprint
    Medium,
    /// Large footprint
    Large,
}

impl AgentSize {
    /// Lowercase name used in declarations and on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unspecified => "unspecified",
            Self::Small => "small",
            Self::Medium => "medium",
            Self::Large => "large",
        }
    }
}

impl From<String> for AgentSize {
    fn from(s: String) -> Self {
        let lower = s.to_ascii_lowercase();
        let short = lower
            .strip_prefix("kargo_agent_size_")
            .unwrap_or(&lower);
        match short {
            "small" => Self::Small,
            "medium" => Self::Medium,
            "large" => Self::Large,
            _ => Self::Unspecified,
        }
    }
}

impl From<AgentSize> for String {
    fn from(size: AgentSize) -> String {
        size.as_str().to_string()
    }
}

impl fmt::Display for AgentSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Agent settings as stored by the platform
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KargoAgentData {
    /// Footprint
    #[serde(default)]
    pub size: AgentSize,
    /// Pin the agent version
    #[serde(default)]
    pub auto_upgrade_disabled: bool,
    /// Desired agent version
    #[serde(default)]
    pub target_version: String,
    /// Kustomization applied to rendered manifests, as JSON
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kustomization: Option<Value>,
    /// Argo CD instance the agent talks to
    #[serde(default, rename = "remoteArgocd")]
    pub remote_argocd: String,
    /// Agent installed into a platform-managed cluster
    #[serde(default)]
    pub akuity_managed: bool,
    /// Namespace of the Argo CD the agent talks to
    #[serde(default, rename = "argocdNamespace")]
    pub argocd_namespace: String,
}

/// A Kargo agent registered against an instance
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KargoAgent {
    /// Server-assigned id
    pub id: String,
    /// Agent name, unique per instance
    pub name: String,
    /// Free-form description
    #[serde(default)]
    pub description: String,
    /// Namespace the agent is installed into
    #[serde(default)]
    pub namespace: String,
    /// Labels
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Annotations
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    /// Settings
    #[serde(default)]
    pub data: KargoAgentData,
    /// Runtime health
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_status: Option<HealthStatus>,
    /// Platform reconciliation status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconciliation_status: Option<ReconciliationStatus>,
}

impl KargoAgent {
    /// Health code, `Unknown` when not reported
    pub fn health(&self) -> HealthStatusCode {
        self.health_status
            .as_ref()
            .map(|s| s.code)
            .unwrap_or_default()
    }

    /// Reconciliation code, `Unknown` when not reported
    pub fn reconciliation(&self) -> ReconciliationStatusCode {
        self.reconciliation_status
            .as_ref()
            .map(|s| s.code)
            .unwrap_or_default()
    }
}
