//! DNS request handler answering container names from the record store.
//!
//! [`ContainerHandler`] sits in front of another [`RequestHandler`]. Queries
//! it has an answer for are answered here; everything else goes to `next`
//! untouched.

use async_trait::async_trait;
use hickory_proto::op::{Edns, Header, MessageType, OpCode};
use hickory_proto::rr::rdata::{A, AAAA};
use hickory_proto::rr::{DNSClass, RData, Record, RecordType};
use hickory_server::authority::MessageResponseBuilder;
use hickory_server::server::{Request, RequestHandler, ResponseHandler, ResponseInfo};
use std::net::IpAddr;
use tracing::{debug, error, trace};

use crate::config::DEFAULT_TTL;
use crate::error::DiscoveryError;
use crate::metrics::{self, QueryResult, Timer};
use crate::state::RecordStore;

/// Answers A and AAAA queries for discovered containers.
pub struct ContainerHandler<N> {
    store: RecordStore,
    ttl: u32,
    next: N,
}

impl<N: RequestHandler> ContainerHandler<N> {
    /// Wrap `next` with answers from `store`.
    pub fn new(store: RecordStore, next: N) -> Self {
        Self {
            store,
            ttl: DEFAULT_TTL,
            next,
        }
    }

    /// Set the TTL of returned records. Zero keeps the current value.
    pub fn with_ttl(mut self, ttl: u32) -> Self {
        if ttl > 0 {
            self.ttl = ttl;
        }
        self
    }

    /// Handler name.
    pub fn name(&self) -> &'static str {
        "containerd"
    }

    /// TTL of returned records.
    pub fn ttl(&self) -> u32 {
        self.ttl
    }

    /// Build the answer for a query, if the store has one.
    fn answer(&self, request: &Request) -> Option<(Record, QueryResult)> {
        let query = request.queries().first()?;
        let name = query.original().name().clone();
        let lookup_name = query.name().to_string();

        match query.query_type() {
            RecordType::A => match self.store.lookup(&lookup_name, RecordType::A)? {
                IpAddr::V4(addr) => Some((
                    Record::from_rdata(name, self.ttl, RData::A(A::from(addr))),
                    QueryResult::Answered,
                )),
                IpAddr::V6(_) => None,
            },
            RecordType::AAAA => match self.store.lookup(&lookup_name, RecordType::AAAA) {
                Some(IpAddr::V6(addr)) => Some((
                    Record::from_rdata(name, self.ttl, RData::AAAA(AAAA::from(addr))),
                    QueryResult::Answered,
                )),
                Some(IpAddr::V4(_)) => None,
                // The name exists as A only: answer with an empty AAAA so the
                // client does not treat the name as missing.
                None if self.store.has_a(&lookup_name) => Some((
                    Record::update0(name, self.ttl, RecordType::AAAA),
                    QueryResult::EmptyAaaa,
                )),
                None => None,
            },
            _ => None,
        }
    }
}

/// EDNS options for the response, mirroring the request's.
fn response_edns(request: &Request) -> Option<Edns> {
    let request_edns = request.edns()?;
    let mut edns = Edns::new();
    edns.set_max_payload(request_edns.max_payload().max(512));
    edns.set_version(request_edns.version());
    Some(edns)
}

#[async_trait]
impl<N: RequestHandler> RequestHandler for ContainerHandler<N> {
    async fn handle_request<R: ResponseHandler>(
        &self,
        request: &Request,
        mut response_handle: R,
    ) -> ResponseInfo {
        let timer = Timer::start();
        let record_type = request
            .queries()
            .first()
            .map(|q| q.query_type())
            .unwrap_or(RecordType::Unknown(0));

        let answer = if request.message_type() == MessageType::Query
            && request.op_code() == OpCode::Query
        {
            self.answer(request)
        } else {
            None
        };

        let Some((mut record, result)) = answer else {
            trace!(query_type = %record_type, "no container record, passing on");
            metrics::record_query(
                &record_type.to_string(),
                QueryResult::Forwarded,
                timer.elapsed(),
            );
            return self.next.handle_request(request, response_handle).await;
        };

        record.set_dns_class(DNSClass::IN);
        debug!(
            name = %record.name(),
            query_type = %record_type,
            "answering from container records"
        );

        let mut header = Header::response_from_request(request.header());
        header.set_authoritative(true);
        header.set_recursion_available(false);

        let mut builder = MessageResponseBuilder::from_message_request(request);
        if let Some(edns) = response_edns(request) {
            builder.edns(edns);
        }
        let answers = [record];
        let response = builder.build(
            header,
            answers.iter(),
            std::iter::empty(),
            std::iter::empty(),
            std::iter::empty(),
        );

        match response_handle.send_response(response).await {
            Ok(info) => {
                metrics::record_query(&record_type.to_string(), result, timer.elapsed());
                info
            }
            Err(e) => {
                error!("{}", DiscoveryError::Write(e.to_string()));
                metrics::record_query(
                    &record_type.to_string(),
                    QueryResult::WriteError,
                    timer.elapsed(),
                );
                ResponseInfo::from(header)
            }
        }
    }
}
