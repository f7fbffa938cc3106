//! Kubelet pod-list client
//!
//! Tries the unauthenticated readonly endpoint first; when that is refused,
//! retries the authorized port with the node's kubelet client certificate.
//! Every request carries a 5 s timeout.

use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::List;
use log::debug;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::domain::{AgentError, Result};

const KUBELET_TIMEOUT: Duration = Duration::from_secs(5);
const CLIENT_CERT_FILE: &str = "kubelet-client-current.pem";

#[derive(Debug, Clone)]
pub struct KubeletConfig {
    /// Readonly-port URL, e.g. `http://127.0.0.1:10255/pods`.
    pub readonly_url: String,
    /// Authorized-port URL, e.g. `https://127.0.0.1:10250/pods`.
    pub authorized_url: String,
    /// CA certificate for the authorized port.
    pub ca_cert_path: String,
    /// Directory holding `kubelet-client-current.pem` (cert and key in one
    /// file).
    pub client_cert_dir: String,
}

pub struct KubeletClient {
    config: KubeletConfig,
}

impl KubeletClient {
    #[must_use]
    pub fn new(config: KubeletConfig) -> KubeletClient {
        KubeletClient { config }
    }

    /// Fetch the node's pod list.
    pub async fn pod_list(&self) -> Result<List<Pod>> {
        let plain = reqwest::Client::builder().timeout(KUBELET_TIMEOUT).build()?;
        match self.do_request(&plain, &self.config.readonly_url).await {
            Ok(pods) => return Ok(pods),
            Err(e) => debug!("kubelet readonly port: {e}"),
        }

        let client = self.tls_client()?;
        self.do_request(&client, &self.config.authorized_url).await
    }

    fn tls_client(&self) -> Result<reqwest::Client> {
        let cert_path = Path::new(&self.config.client_cert_dir).join(CLIENT_CERT_FILE);
        let pem = std::fs::read(&cert_path)
            .map_err(|e| AgentError::file(cert_path.display().to_string(), e))?;
        let identity = reqwest::Identity::from_pem(&pem)?;

        let ca_path = PathBuf::from(&self.config.ca_cert_path);
        let ca_pem = std::fs::read(&ca_path)
            .map_err(|e| AgentError::file(ca_path.display().to_string(), e))?;
        let ca = reqwest::Certificate::from_pem(&ca_pem)?;

        Ok(reqwest::Client::builder()
            .timeout(KUBELET_TIMEOUT)
            .identity(identity)
            .add_root_certificate(ca)
            // the kubelet serving cert rarely matches its address
            .danger_accept_invalid_certs(true)
            .build()?)
    }

    async fn do_request(&self, client: &reqwest::Client, url: &str) -> Result<List<Pod>> {
        let resp = client.get(url).send().await?;
        if !resp.status().is_success() {
            return Err(AgentError::Kubelet(format!("{url}: status {}", resp.status())));
        }
        Ok(resp.json::<List<Pod>>().await?)
    }
}

/// A pod counts as running when its phase is `Running` and every container
/// status is in the `Running` sub-state.
#[must_use]
pub fn is_running_pod(pod: &Pod) -> bool {
    let Some(status) = pod.status.as_ref() else {
        return false;
    };
    if status.phase.as_deref() != Some("Running") {
        return false;
    }
    status
        .container_statuses
        .as_deref()
        .unwrap_or_default()
        .iter()
        .all(|cs| cs.state.as_ref().is_some_and(|s| s.running.is_some()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{ContainerState, ContainerStateRunning, ContainerStatus, PodStatus};

    fn pod_with(phase: &str, running: &[bool]) -> Pod {
        Pod {
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                container_statuses: Some(
                    running
                        .iter()
                        .map(|&r| ContainerStatus {
                            state: Some(ContainerState {
                                running: r.then(ContainerStateRunning::default),
                                ..Default::default()
                            }),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_running_pod() {
        assert!(is_running_pod(&pod_with("Running", &[true, true])));
        assert!(!is_running_pod(&pod_with("Running", &[true, false])));
        assert!(!is_running_pod(&pod_with("Pending", &[true])));
        assert!(!is_running_pod(&Pod::default()));
    }
}
