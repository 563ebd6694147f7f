//! Shared test infrastructure for DNS answering and discovery tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{DNSClass, Name, RData, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinDecoder, BinEncoder};
use hickory_server::authority::{MessageRequest, MessageResponse, MessageResponseBuilder};
use hickory_server::proto::rr::Record;
use hickory_server::proto::xfer::Protocol;
use hickory_server::server::{Request, RequestHandler, ResponseHandler, ResponseInfo};
use parking_lot::Mutex;
use prost::Message as _;
use tokio::sync::mpsc;

use containerd_dns::events::{Envelope, TaskExit, TaskStart, TASK_EXIT_TOPIC, TASK_START_TOPIC};
use containerd_dns::metadata::{ContainerInfo, RuntimeSpec};
use containerd_dns::runtime::{EventStream, RuntimeClient};
use containerd_dns::DiscoveryError;

// --- Constants ---

pub const DOMAIN: &str = "node.local";
pub const NAMESPACE: &str = "k8s.io";

// --- TestResponseHandler ---

/// Captures the serialized DNS response for inspection in tests.
///
/// The response is serialized via `MessageResponse::destructive_emit()` and
/// stored as raw wire-format bytes, which can then be parsed with
/// `Message::from_vec()`.
#[derive(Clone)]
pub struct TestResponseHandler {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl TestResponseHandler {
    pub fn new() -> Self {
        Self {
            buf: Arc::new(Mutex::new(Vec::with_capacity(512))),
        }
    }

    /// Parse the captured wire bytes into a `Message` for assertions.
    pub fn into_message(self) -> Message {
        let buf = self.buf.lock();
        assert!(!buf.is_empty(), "no response was captured");
        Message::from_vec(&buf).expect("failed to parse captured DNS response")
    }

    pub fn is_empty(&self) -> bool {
        self.buf.lock().is_empty()
    }
}

#[async_trait]
impl ResponseHandler for TestResponseHandler {
    async fn send_response<'a>(
        &mut self,
        response: MessageResponse<
            '_,
            'a,
            impl Iterator<Item = &'a Record> + Send + 'a,
            impl Iterator<Item = &'a Record> + Send + 'a,
            impl Iterator<Item = &'a Record> + Send + 'a,
            impl Iterator<Item = &'a Record> + Send + 'a,
        >,
    ) -> io::Result<ResponseInfo> {
        let mut buf = self.buf.lock();
        buf.clear();
        let mut encoder = BinEncoder::new(&mut *buf);
        encoder.set_max_size(u16::MAX);
        let info = response
            .destructive_emit(&mut encoder)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        Ok(info)
    }
}

// --- NextHandler ---

/// Stand-in for the next handler in the chain: answers every request with a
/// fixed response code and counts how often it was reached.
#[derive(Clone)]
pub struct NextHandler {
    code: ResponseCode,
    calls: Arc<AtomicUsize>,
}

impl NextHandler {
    pub fn new(code: ResponseCode) -> Self {
        Self {
            code,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RequestHandler for NextHandler {
    async fn handle_request<R: ResponseHandler>(
        &self,
        request: &Request,
        mut response_handle: R,
    ) -> ResponseInfo {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let response = MessageResponseBuilder::from_message_request(request)
            .error_msg(request.header(), self.code);
        response_handle
            .send_response(response)
            .await
            .expect("next handler failed to respond")
    }
}

// --- Query/Request construction ---

/// Build wire-format bytes for a DNS query.
pub fn build_query_bytes(name: &str, record_type: RecordType, id: u16) -> Vec<u8> {
    let mut msg = Message::new();
    msg.set_id(id);
    msg.set_message_type(MessageType::Query);
    msg.set_op_code(OpCode::Query);
    msg.set_recursion_desired(true);
    let mut query = Query::new();
    query.set_name(Name::from_ascii(name).unwrap());
    query.set_query_type(record_type);
    query.set_query_class(DNSClass::IN);
    msg.add_query(query);
    msg.to_vec().unwrap()
}

/// Parse wire bytes into a MessageRequest.
pub fn parse_message_request(bytes: &[u8]) -> MessageRequest {
    let mut decoder = BinDecoder::new(bytes);
    MessageRequest::read(&mut decoder).expect("failed to parse MessageRequest")
}

/// Build a full `Request` from a local client.
pub fn build_request(name: &str, record_type: RecordType, id: u16) -> Request {
    let bytes = build_query_bytes(name, record_type, id);
    let msg = parse_message_request(&bytes);
    let src: SocketAddr = "127.0.0.1:40000".parse().unwrap();
    Request::new(msg, src, Protocol::Udp)
}

/// Execute a query through a handler and return the parsed response.
pub async fn execute_query<H: RequestHandler>(
    handler: &H,
    name: &str,
    record_type: RecordType,
    id: u16,
) -> Message {
    let request = build_request(name, record_type, id);
    let response = TestResponseHandler::new();
    handler.handle_request(&request, response.clone()).await;
    response.into_message()
}

// --- Response helpers ---

/// Extract A addresses from a response.
pub fn extract_a_ips(msg: &Message) -> Vec<Ipv4Addr> {
    msg.answers()
        .iter()
        .filter_map(|r| match r.data() {
            RData::A(a) => Some(Ipv4Addr::from(*a)),
            _ => None,
        })
        .collect()
}

/// Assert response code.
pub fn assert_response_code(msg: &Message, expected: ResponseCode) {
    assert_eq!(
        msg.response_code(),
        expected,
        "expected {:?}, got {:?}",
        expected,
        msg.response_code()
    );
}

/// Assert an authoritative single-address A answer with the given TTL.
pub fn assert_a_response(msg: &Message, expected: Ipv4Addr, ttl: u32) {
    assert_response_code(msg, ResponseCode::NoError);
    assert!(msg.authoritative(), "answer is not authoritative");
    assert!(!msg.recursion_available(), "recursion available is set");
    assert_eq!(extract_a_ips(msg), vec![expected]);
    assert_eq!(msg.answers()[0].ttl(), ttl);
}

// --- Fake runtime ---

/// In-memory runtime: a mutable container table, the ids with a running
/// task and a single event stream fed from the test.
pub struct FakeRuntime {
    containers: Mutex<HashMap<String, ContainerInfo>>,
    running: Mutex<HashSet<String>>,
    events: Mutex<Option<mpsc::UnboundedReceiver<Envelope>>>,
}

impl FakeRuntime {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedSender<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let runtime = Arc::new(Self {
            containers: Mutex::new(HashMap::new()),
            running: Mutex::new(HashSet::new()),
            events: Mutex::new(Some(rx)),
        });
        (runtime, tx)
    }

    /// Add a container with a running task.
    pub fn add_container(&self, container: ContainerInfo) {
        self.running.lock().insert(container.id.clone());
        self.containers.lock().insert(container.id.clone(), container);
    }

    /// Add a container whose task has exited.
    pub fn add_stopped_container(&self, container: ContainerInfo) {
        self.containers.lock().insert(container.id.clone(), container);
    }

    /// Forget a container and its task.
    pub fn remove_container(&self, id: &str) {
        self.running.lock().remove(id);
        self.containers.lock().remove(id);
    }
}

#[async_trait]
impl RuntimeClient for FakeRuntime {
    async fn list_containers(&self) -> Result<Vec<ContainerInfo>, DiscoveryError> {
        Ok(self.containers.lock().values().cloned().collect())
    }

    async fn load_container(&self, id: &str) -> Result<ContainerInfo, DiscoveryError> {
        self.containers
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| DiscoveryError::RuntimeQuery(format!("container {id} not found")))
    }

    async fn subscribe(&self) -> Result<EventStream, DiscoveryError> {
        match self.events.lock().take() {
            Some(rx) => Ok(futures::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|envelope| (Ok(envelope), rx))
            })
            .boxed()),
            None => Ok(futures::stream::pending().boxed()),
        }
    }

    async fn task_pid(&self, id: &str) -> Result<Option<u32>, DiscoveryError> {
        Ok(self.running.lock().contains(id).then_some(100))
    }

    async fn sandbox_address(
        &self,
        _container: &ContainerInfo,
    ) -> Result<Option<Ipv4Addr>, DiscoveryError> {
        Ok(None)
    }
}

// --- Container and event builders ---

pub fn container(id: &str, hostname: &str, labels: &[(&str, &str)]) -> ContainerInfo {
    ContainerInfo {
        id: id.to_string(),
        image: format!("docker.io/library/{hostname}:latest"),
        labels: labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        spec: Some(RuntimeSpec {
            hostname: hostname.to_string(),
            ..Default::default()
        }),
    }
}

/// Write the CNI result the bridge plugin would leave for `id`.
pub fn write_cni_result(dir: &Path, id: &str, addr: Ipv4Addr) {
    let body = format!(
        r#"{{"kind":"cniCacheV1","result":{{"cniVersion":"1.0.0","ips":[{{"address":"{addr}/16","gateway":"10.88.0.1"}}]}}}}"#
    );
    std::fs::write(dir.join(format!("bridge-{id}-eth0")), body).unwrap();
}

pub fn start_envelope(id: &str) -> Envelope {
    Envelope {
        namespace: NAMESPACE.to_string(),
        topic: TASK_START_TOPIC.to_string(),
        type_url: "containerd.events.TaskStart".to_string(),
        payload: TaskStart {
            container_id: id.to_string(),
            pid: 100,
        }
        .encode_to_vec(),
    }
}

pub fn exit_envelope(id: &str) -> Envelope {
    Envelope {
        namespace: NAMESPACE.to_string(),
        topic: TASK_EXIT_TOPIC.to_string(),
        type_url: "containerd.events.TaskExit".to_string(),
        payload: TaskExit {
            container_id: id.to_string(),
            id: id.to_string(),
            pid: 100,
            exit_status: 0,
        }
        .encode_to_vec(),
    }
}

/// Poll `check` until it holds or two seconds pass.
pub async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
