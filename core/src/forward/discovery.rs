//! Read-only cluster discovery via kubectl.
//!
//! Produces the namespace/service listings a caller browses when building a
//! [`ConnectionConfig`](super::models::ConnectionConfig). The kubectl path is
//! injected; locating binaries is not this crate's job.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::time::timeout;

use super::errors::{ForwardError, Result};

/// Timeout for kubectl discovery commands.
const KUBECTL_TIMEOUT: Duration = Duration::from_secs(15);

/// A Kubernetes namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClusterNamespace {
    pub name: String,
}

/// A port exposed by a Kubernetes service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServicePort {
    pub name: Option<String>,
    pub port: u16,
    pub target_port: u16,
    pub protocol: Option<String>,
}

impl ServicePort {
    /// Display name like "8080 (http)".
    pub fn display_name(&self) -> String {
        match &self.name {
            Some(name) if !name.is_empty() => format!("{} ({})", self.port, name),
            _ => self.port.to_string(),
        }
    }
}

/// A Kubernetes service and its exposed ports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterService {
    pub name: String,
    pub namespace: String,
    pub service_type: String,
    pub ports: Vec<ServicePort>,
}

impl ClusterService {
    /// "namespace/name" identity.
    pub fn id(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

// kubectl `-o json` response shapes.

#[derive(Debug, Deserialize)]
struct NamespaceListResponse {
    items: Vec<NamespaceItem>,
}

#[derive(Debug, Deserialize)]
struct NamespaceItem {
    metadata: ObjectMetadata,
}

#[derive(Debug, Deserialize)]
struct ObjectMetadata {
    name: String,
    #[serde(default)]
    namespace: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ServiceListResponse {
    items: Vec<ServiceItem>,
}

#[derive(Debug, Deserialize)]
struct ServiceItem {
    metadata: ObjectMetadata,
    spec: ServiceSpec,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServiceSpec {
    #[serde(rename = "type")]
    service_type: Option<String>,
    ports: Option<Vec<ServicePortSpec>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServicePortSpec {
    name: Option<String>,
    port: u16,
    target_port: Option<TargetPort>,
    protocol: Option<String>,
}

/// targetPort is either an integer or a named port string.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TargetPort {
    Int(u16),
    Named(String),
}

impl TargetPort {
    fn as_int(&self) -> Option<u16> {
        match self {
            TargetPort::Int(v) => Some(*v),
            TargetPort::Named(_) => None,
        }
    }
}

/// kubectl-backed discovery adapter.
pub struct ClusterDiscovery {
    kubectl: PathBuf,
}

impl ClusterDiscovery {
    /// Creates a discovery adapter for a validated kubectl path.
    pub fn new(kubectl: PathBuf) -> Self {
        Self { kubectl }
    }

    /// Fetches all namespaces, sorted by name.
    pub async fn fetch_namespaces(&self) -> Result<Vec<ClusterNamespace>> {
        let output = self
            .execute_kubectl(&["get", "namespaces", "-o", "json", "--request-timeout=10s"])
            .await?;

        let response: NamespaceListResponse = serde_json::from_str(&output)
            .map_err(|e| ForwardError::ParsingFailed(e.to_string()))?;

        let mut namespaces: Vec<ClusterNamespace> = response
            .items
            .into_iter()
            .map(|item| ClusterNamespace {
                name: item.metadata.name,
            })
            .collect();
        namespaces.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(namespaces)
    }

    /// Fetches services in a namespace, sorted by name.
    pub async fn fetch_services(&self, namespace: &str) -> Result<Vec<ClusterService>> {
        let output = self
            .execute_kubectl(&[
                "get",
                "services",
                "-n",
                namespace,
                "-o",
                "json",
                "--request-timeout=10s",
            ])
            .await?;

        let response: ServiceListResponse = serde_json::from_str(&output)
            .map_err(|e| ForwardError::ParsingFailed(e.to_string()))?;

        let mut services: Vec<ClusterService> = response
            .items
            .into_iter()
            .map(|item| ClusterService {
                name: item.metadata.name,
                namespace: item.metadata.namespace.unwrap_or_else(|| namespace.to_string()),
                service_type: item
                    .spec
                    .service_type
                    .unwrap_or_else(|| "ClusterIP".to_string()),
                ports: item
                    .spec
                    .ports
                    .unwrap_or_default()
                    .into_iter()
                    .map(|p| ServicePort {
                        name: p.name,
                        port: p.port,
                        target_port: p.target_port.and_then(|tp| tp.as_int()).unwrap_or(p.port),
                        protocol: p.protocol,
                    })
                    .collect(),
            })
            .collect();
        services.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(services)
    }

    async fn execute_kubectl(&self, args: &[&str]) -> Result<String> {
        let result = timeout(KUBECTL_TIMEOUT, async {
            let output = Command::new(&self.kubectl).args(args).output().await?;
            Ok::<_, std::io::Error>((output.status, output.stdout, output.stderr))
        })
        .await;

        match result {
            Ok(Ok((status, stdout, stderr))) => {
                if status.success() {
                    String::from_utf8(stdout)
                        .map_err(|e| ForwardError::ParsingFailed(e.to_string()))
                } else {
                    let stderr_str = String::from_utf8_lossy(&stderr);
                    Err(ForwardError::from_kubectl_stderr(&stderr_str))
                }
            }
            Ok(Err(e)) => Err(ForwardError::Io(e)),
            Err(_) => Err(ForwardError::Timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_port_display_name() {
        let named = ServicePort {
            name: Some("http".to_string()),
            port: 8080,
            target_port: 80,
            protocol: Some("TCP".to_string()),
        };
        assert_eq!(named.display_name(), "8080 (http)");

        let unnamed = ServicePort {
            name: None,
            port: 3000,
            target_port: 3000,
            protocol: None,
        };
        assert_eq!(unnamed.display_name(), "3000");
    }

    #[test]
    fn test_service_list_parsing() {
        let json = r#"{
            "items": [{
                "metadata": {"name": "api-svc", "namespace": "default"},
                "spec": {
                    "type": "ClusterIP",
                    "ports": [
                        {"name": "http", "port": 80, "targetPort": 8080, "protocol": "TCP"},
                        {"port": 443, "targetPort": "https"}
                    ]
                }
            }]
        }"#;

        let response: ServiceListResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.items.len(), 1);
        let ports = response.items[0].spec.ports.as_ref().unwrap();
        assert_eq!(ports[0].target_port.as_ref().unwrap().as_int(), Some(8080));
        assert_eq!(ports[1].target_port.as_ref().unwrap().as_int(), None);
    }

    #[test]
    fn test_service_id() {
        let svc = ClusterService {
            name: "api-svc".to_string(),
            namespace: "default".to_string(),
            service_type: "ClusterIP".to_string(),
            ports: vec![],
        };
        assert_eq!(svc.id(), "default/api-svc");
    }
}
