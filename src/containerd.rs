//! containerd implementation of [`RuntimeClient`].
//!
//! Container, task and event calls go through the containerd gRPC API with
//! the `containerd-namespace` header set. Pod sandbox status is read from the
//! CRI runtime service served on the same socket.

use async_trait::async_trait;
use containerd_client::services::v1::containers_client::ContainersClient;
use containerd_client::services::v1::events_client::EventsClient;
use containerd_client::services::v1::tasks_client::TasksClient;
use containerd_client::services::v1::version_client::VersionClient;
use containerd_client::services::v1::{
    Container, GetContainerRequest, GetRequest, ListContainersRequest, SubscribeRequest,
};
use containerd_client::tonic::codec::ProstCodec;
use containerd_client::tonic::codegen::http::uri::PathAndQuery;
use containerd_client::tonic::metadata::AsciiMetadataValue;
use containerd_client::tonic::transport::Channel;
use containerd_client::tonic::{self, Code, Request};
use futures::StreamExt;
use std::net::{IpAddr, Ipv4Addr};
use tracing::{info, warn};

use crate::error::DiscoveryError;
use crate::events::Envelope;
use crate::metadata::{ContainerInfo, RuntimeSpec, OCI_SPEC_TYPE_URL};
use crate::runtime::{EventStream, RuntimeClient};

const NAMESPACE_HEADER: &str = "containerd-namespace";
const POD_SANDBOX_STATUS_PATH: &str = "/runtime.v1.RuntimeService/PodSandboxStatus";

/// containerd client scoped to one namespace.
#[derive(Clone)]
pub struct ContainerdClient {
    channel: Channel,
    namespace: String,
    namespace_header: AsciiMetadataValue,
}

impl ContainerdClient {
    /// Connect to the containerd socket at `endpoint`.
    ///
    /// Fails when the socket cannot be reached or does not answer a version
    /// request.
    pub async fn connect(endpoint: &str, namespace: &str) -> Result<Self, DiscoveryError> {
        let connection_error = |reason: String| DiscoveryError::Connection {
            endpoint: endpoint.to_string(),
            reason,
        };

        let channel = containerd_client::connect(endpoint)
            .await
            .map_err(|e| connection_error(e.to_string()))?;

        let version = VersionClient::new(channel.clone())
            .version(Request::new(()))
            .await
            .map_err(|e| connection_error(e.message().to_string()))?
            .into_inner();
        info!(
            endpoint,
            version = %version.version,
            revision = %version.revision,
            "connected to containerd"
        );

        let namespace_header = namespace
            .parse::<AsciiMetadataValue>()
            .map_err(|e| DiscoveryError::Config(format!("invalid namespace {namespace:?}: {e}")))?;

        Ok(Self {
            channel,
            namespace: namespace.to_string(),
            namespace_header,
        })
    }

    fn request<T>(&self, message: T) -> Request<T> {
        let mut request = Request::new(message);
        request
            .metadata_mut()
            .insert(NAMESPACE_HEADER, self.namespace_header.clone());
        request
    }
}

fn query_error(what: &str, status: tonic::Status) -> DiscoveryError {
    DiscoveryError::RuntimeQuery(format!("{what}: {}", status.message()))
}

/// Convert a containerd container record.
fn container_info(container: Container) -> Result<ContainerInfo, DiscoveryError> {
    let spec = match container.spec {
        Some(any) if any.type_url == OCI_SPEC_TYPE_URL => {
            Some(RuntimeSpec::from_json(&any.value).map_err(|e| {
                DiscoveryError::RuntimeQuery(format!(
                    "invalid runtime spec for {}: {}",
                    container.id, e
                ))
            })?)
        }
        _ => None,
    };

    Ok(ContainerInfo {
        id: container.id,
        image: container.image,
        labels: container.labels.into_iter().collect(),
        spec,
    })
}

#[async_trait]
impl RuntimeClient for ContainerdClient {
    async fn list_containers(&self) -> Result<Vec<ContainerInfo>, DiscoveryError> {
        let response = ContainersClient::new(self.channel.clone())
            .list(self.request(ListContainersRequest { filters: vec![] }))
            .await
            .map_err(|e| query_error("list containers", e))?
            .into_inner();

        let mut containers = Vec::with_capacity(response.containers.len());
        for container in response.containers {
            let id = container.id.clone();
            match container_info(container) {
                Ok(info) => containers.push(info),
                Err(e) => warn!(container_id = %id, "skipping container: {}", e),
            }
        }
        Ok(containers)
    }

    async fn load_container(&self, id: &str) -> Result<ContainerInfo, DiscoveryError> {
        let response = ContainersClient::new(self.channel.clone())
            .get(self.request(GetContainerRequest { id: id.to_string() }))
            .await
            .map_err(|e| query_error("get container", e))?
            .into_inner();

        let container = response
            .container
            .ok_or_else(|| DiscoveryError::RuntimeQuery(format!("container {id} not returned")))?;
        container_info(container)
    }

    async fn subscribe(&self) -> Result<EventStream, DiscoveryError> {
        let request = self.request(SubscribeRequest {
            filters: vec![format!("namespace=={}", self.namespace)],
        });
        let stream = EventsClient::new(self.channel.clone())
            .subscribe(request)
            .await
            .map_err(|e| DiscoveryError::Subscription(e.message().to_string()))?
            .into_inner();

        Ok(stream
            .map(|item| match item {
                Ok(envelope) => {
                    let (type_url, payload) = envelope
                        .event
                        .map(|any| (any.type_url, any.value))
                        .unwrap_or_default();
                    Ok(Envelope {
                        namespace: envelope.namespace,
                        topic: envelope.topic,
                        type_url,
                        payload,
                    })
                }
                Err(status) => Err(DiscoveryError::Subscription(status.message().to_string())),
            })
            .boxed())
    }

    async fn task_pid(&self, id: &str) -> Result<Option<u32>, DiscoveryError> {
        let result = TasksClient::new(self.channel.clone())
            .get(self.request(GetRequest {
                container_id: id.to_string(),
                exec_id: String::new(),
            }))
            .await;

        match result {
            Ok(response) => Ok(response
                .into_inner()
                .process
                .map(|p| p.pid)
                .filter(|pid| *pid > 0)),
            Err(status) if status.code() == Code::NotFound => Ok(None),
            Err(status) => Err(query_error("get task", status)),
        }
    }

    async fn sandbox_address(
        &self,
        container: &ContainerInfo,
    ) -> Result<Option<Ipv4Addr>, DiscoveryError> {
        let mut grpc = tonic::client::Grpc::new(self.channel.clone());
        grpc.ready()
            .await
            .map_err(|e| DiscoveryError::RuntimeQuery(format!("CRI service not ready: {e}")))?;

        let request = Request::new(cri::PodSandboxStatusRequest {
            pod_sandbox_id: container.sandbox_id().to_string(),
            verbose: false,
        });
        let codec: ProstCodec<cri::PodSandboxStatusRequest, cri::PodSandboxStatusResponse> =
            ProstCodec::default();

        let response = match grpc
            .unary(request, PathAndQuery::from_static(POD_SANDBOX_STATUS_PATH), codec)
            .await
        {
            Ok(response) => response.into_inner(),
            Err(status) if status.code() == Code::NotFound => return Ok(None),
            Err(status) => return Err(query_error("pod sandbox status", status)),
        };

        let Some(network) = response.status.and_then(|s| s.network) else {
            return Ok(None);
        };
        Ok(std::iter::once(network.ip.as_str())
            .chain(network.additional_ips.iter().map(|ip| ip.ip.as_str()))
            .find_map(|ip| match ip.parse::<IpAddr>() {
                Ok(IpAddr::V4(v4)) => Some(v4),
                _ => None,
            }))
    }
}

/// The parts of the CRI `runtime.v1` API used for sandbox status.
mod cri {
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct PodSandboxStatusRequest {
        #[prost(string, tag = "1")]
        pub pod_sandbox_id: String,
        #[prost(bool, tag = "2")]
        pub verbose: bool,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct PodSandboxStatusResponse {
        #[prost(message, optional, tag = "1")]
        pub status: Option<PodSandboxStatus>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct PodSandboxStatus {
        #[prost(message, optional, tag = "5")]
        pub network: Option<PodSandboxNetworkStatus>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct PodSandboxNetworkStatus {
        #[prost(string, tag = "1")]
        pub ip: String,
        #[prost(message, repeated, tag = "2")]
        pub additional_ips: Vec<PodIp>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct PodIp {
        #[prost(string, tag = "1")]
        pub ip: String,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;
    use std::collections::HashMap;

    #[test]
    fn test_container_info_parses_oci_spec() {
        let container = Container {
            id: "c1".to_string(),
            image: "docker.io/library/redis:7".to_string(),
            labels: HashMap::from([("app".to_string(), "cache".to_string())]),
            spec: Some(prost_types_any(
                OCI_SPEC_TYPE_URL,
                br#"{"hostname":"cache","process":{"env":["A=1"],"user":{"uid":0,"gid":0}}}"#,
            )),
            ..Default::default()
        };

        let info = container_info(container).unwrap();
        assert_eq!(info.hostname(), Some("cache"));
        assert_eq!(info.labels.get("app").map(String::as_str), Some("cache"));
    }

    #[test]
    fn test_container_info_ignores_foreign_spec_type() {
        let container = Container {
            id: "c1".to_string(),
            spec: Some(prost_types_any("example.com/Other", b"\x00")),
            ..Default::default()
        };
        assert!(container_info(container).unwrap().spec.is_none());
    }

    #[test]
    fn test_sandbox_status_response_decodes_ip() {
        let response = cri::PodSandboxStatusResponse {
            status: Some(cri::PodSandboxStatus {
                network: Some(cri::PodSandboxNetworkStatus {
                    ip: "10.244.1.9".to_string(),
                    additional_ips: vec![],
                }),
            }),
        };
        let decoded =
            cri::PodSandboxStatusResponse::decode(response.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded.status.unwrap().network.unwrap().ip, "10.244.1.9");
    }

    fn prost_types_any(type_url: &str, value: &[u8]) -> prost_types::Any {
        prost_types::Any {
            type_url: type_url.to_string(),
            value: value.to_vec(),
        }
    }
}
