//! Client certificate and kubeconfig issuance for approved requests

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::info;

#[cfg(test)]
use mockall::automock;

use crate::pki::{CertificateAuthority, ClientCertificate};
use crate::Error;

/// Issues credentials for a requester
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CredentialIssuer: Send + Sync {
    /// Sign a client certificate for `email` in `namespace`
    async fn generate_client_certificate(
        &self,
        namespace: &str,
        policy: &str,
        email: &str,
    ) -> Result<ClientCertificate, Error>;

    /// Write a kubeconfig embedding `certificate` and return its path
    async fn make_kubeconfig(
        &self,
        namespace: &str,
        policy: &str,
        email: &str,
        certificate: &ClientCertificate,
    ) -> Result<PathBuf, Error>;
}

/// Kubeconfig file layout
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Kubeconfig {
    /// API version
    pub api_version: String,
    /// Kind (always "Config")
    pub kind: String,
    /// Clusters
    pub clusters: Vec<NamedCluster>,
    /// Users
    pub users: Vec<NamedUser>,
    /// Contexts
    pub contexts: Vec<NamedContext>,
    /// Current context
    pub current_context: String,
}

/// Cluster entry in a kubeconfig
#[derive(Debug, Serialize, Deserialize)]
pub struct NamedCluster {
    /// Cluster name
    pub name: String,
    /// Cluster config
    pub cluster: ClusterConfig,
}

/// Cluster configuration
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ClusterConfig {
    /// API server URL
    pub server: String,
    /// CA certificate (base64 encoded PEM)
    pub certificate_authority_data: String,
}

/// User entry in a kubeconfig
#[derive(Debug, Serialize, Deserialize)]
pub struct NamedUser {
    /// User name
    pub name: String,
    /// User config
    pub user: UserConfig,
}

/// Client certificate credentials
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct UserConfig {
    /// Client certificate (base64 encoded PEM)
    pub client_certificate_data: String,
    /// Client key (base64 encoded PEM)
    pub client_key_data: String,
}

/// Context entry in a kubeconfig
#[derive(Debug, Serialize, Deserialize)]
pub struct NamedContext {
    /// Context name
    pub name: String,
    /// Context config
    pub context: ContextConfig,
}

/// Context configuration
#[derive(Debug, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Cluster name (reference)
    pub cluster: String,
    /// User name (reference)
    pub user: String,
    /// Default namespace
    pub namespace: String,
}

/// Issuer signing with a local CA and writing kubeconfigs to a directory
pub struct PkiCredentialIssuer {
    ca: Arc<CertificateAuthority>,
    cluster_name: String,
    server: String,
    output_dir: PathBuf,
}

impl PkiCredentialIssuer {
    /// Issuer for the API server at `server`, writing into `output_dir`
    pub fn new(
        ca: Arc<CertificateAuthority>,
        cluster_name: impl Into<String>,
        server: impl Into<String>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            ca,
            cluster_name: cluster_name.into(),
            server: server.into(),
            output_dir: output_dir.into(),
        }
    }

    /// Where the kubeconfig for `namespace` and `policy` is written
    pub fn kubeconfig_path(&self, namespace: &str, policy: &str) -> PathBuf {
        self.output_dir
            .join(format!("{namespace}-{policy}.kubeconfig"))
    }

    fn build_kubeconfig(
        &self,
        namespace: &str,
        email: &str,
        certificate: &ClientCertificate,
    ) -> Kubeconfig {
        let context = format!("{}-{}", self.cluster_name, namespace);
        Kubeconfig {
            api_version: "v1".to_string(),
            kind: "Config".to_string(),
            clusters: vec![NamedCluster {
                name: self.cluster_name.clone(),
                cluster: ClusterConfig {
                    server: self.server.clone(),
                    certificate_authority_data: STANDARD.encode(self.ca.ca_cert_pem()),
                },
            }],
            users: vec![NamedUser {
                name: email.to_string(),
                user: UserConfig {
                    client_certificate_data: STANDARD.encode(&certificate.cert_pem),
                    client_key_data: STANDARD.encode(&certificate.key_pem),
                },
            }],
            contexts: vec![NamedContext {
                name: context.clone(),
                context: ContextConfig {
                    cluster: self.cluster_name.clone(),
                    user: email.to_string(),
                    namespace: namespace.to_string(),
                },
            }],
            current_context: context,
        }
    }
}

#[async_trait]
impl CredentialIssuer for PkiCredentialIssuer {
    async fn generate_client_certificate(
        &self,
        namespace: &str,
        _policy: &str,
        email: &str,
    ) -> Result<ClientCertificate, Error> {
        let ca = self.ca.clone();
        let (email, namespace) = (email.to_string(), namespace.to_string());
        // key generation and signing are CPU bound
        tokio::task::spawn_blocking(move || ca.issue_client_certificate(&email, &namespace))
            .await
            .map_err(|e| Error::internal(format!("certificate task failed: {e}")))?
            .map_err(|e| Error::credential(e.to_string()))
    }

    async fn make_kubeconfig(
        &self,
        namespace: &str,
        policy: &str,
        email: &str,
        certificate: &ClientCertificate,
    ) -> Result<PathBuf, Error> {
        let kubeconfig = self.build_kubeconfig(namespace, email, certificate);
        let yaml = serde_yaml::to_string(&kubeconfig)
            .map_err(|e| Error::serialization(format!("failed to serialize kubeconfig: {e}")))?;

        let path = self.kubeconfig_path(namespace, policy);
        write_file(&path, &yaml).await?;
        info!(path = %path.display(), namespace, "kubeconfig written");
        Ok(path)
    }
}

async fn write_file(path: &Path, contents: &str) -> Result<(), Error> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|e| {
            Error::credential(format!("failed to create {}: {e}", parent.display()))
        })?;
    }
    tokio::fs::write(path, contents)
        .await
        .map_err(|e| Error::credential(format!("failed to write {}: {e}", path.display())))
}

/// Issuer used when no CA is configured; every request fails
pub struct UnconfiguredCredentialIssuer;

#[async_trait]
impl CredentialIssuer for UnconfiguredCredentialIssuer {
    async fn generate_client_certificate(
        &self,
        _namespace: &str,
        _policy: &str,
        _email: &str,
    ) -> Result<ClientCertificate, Error> {
        Err(Error::credential("no certificate authority configured"))
    }

    async fn make_kubeconfig(
        &self,
        _namespace: &str,
        _policy: &str,
        _email: &str,
        _certificate: &ClientCertificate,
    ) -> Result<PathBuf, Error> {
        Err(Error::credential("no certificate authority configured"))
    }
}
