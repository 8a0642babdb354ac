use k8s_openapi::{
    api::core::v1::{Service, ServicePort, ServiceSpec},
    apimachinery::pkg::util::intstr::IntOrString,
};
use kube::core::ObjectMeta;

use super::labels::{get_proxy_selector_labels, get_proxy_service_labels};

pub const KUBERNETES_PROXY_PORT: i32 = 6443;
pub const KUBESPHERE_PROXY_PORT: i32 = 80;

/// In-cluster entry point of a proxy-mode member, served by the tunnel.
#[derive(Debug, Clone)]
pub struct ProxyRelease {
    pub cluster_name: String,
    pub namespace: String,
    pub kubernetes_port: u16,
    pub kubesphere_port: u16,
}

impl ProxyRelease {
    pub fn new(cluster_name: &str, namespace: &str) -> Self {
        Self {
            cluster_name: cluster_name.to_owned(),
            namespace: namespace.to_owned(),
            kubernetes_port: 0,
            kubesphere_port: 0,
        }
    }

    pub fn with_ports(self, kubernetes_port: u16, kubesphere_port: u16) -> Self {
        Self {
            kubernetes_port,
            kubesphere_port,
            ..self
        }
    }

    pub fn service_name(&self) -> String {
        format!("mc-{}", self.cluster_name)
    }

    pub fn kubernetes_api_endpoint(&self) -> String {
        format!(
            "https://{}.{}.svc:{KUBERNETES_PROXY_PORT}",
            self.service_name(),
            self.namespace
        )
    }

    pub fn kubesphere_api_endpoint(&self) -> String {
        format!(
            "http://{}.{}.svc:{KUBESPHERE_PROXY_PORT}",
            self.service_name(),
            self.namespace
        )
    }

    pub fn generate_service_metadata(&self) -> ObjectMeta {
        ObjectMeta {
            name: Some(self.service_name()),
            namespace: Some(self.namespace.to_owned()),
            labels: Some(get_proxy_service_labels(&self.cluster_name)),
            ..Default::default()
        }
    }

    pub fn generate_service(&self) -> Service {
        let ports = vec![
            ServicePort {
                name: Some("kube-apiserver".to_owned()),
                port: KUBERNETES_PROXY_PORT,
                protocol: Some("TCP".to_owned()),
                target_port: Some(IntOrString::Int(self.kubernetes_port.into())),
                ..Default::default()
            },
            ServicePort {
                name: Some("kubesphere".to_owned()),
                port: KUBESPHERE_PROXY_PORT,
                protocol: Some("TCP".to_owned()),
                target_port: Some(IntOrString::Int(self.kubesphere_port.into())),
                ..Default::default()
            },
        ];

        Service {
            metadata: self.generate_service_metadata(),
            spec: Some(ServiceSpec {
                selector: Some(get_proxy_selector_labels()),
                type_: Some("ClusterIP".to_owned()),
                ports: Some(ports),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}
