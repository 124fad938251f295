//! Per-request context: the `cn`/`rd` header surface consulted by admission,
//! modeled after `core-network`'s `NetworkContext` (`CtxSessionId`/`CtxRpcId`
//! getter/setter wrapper pattern) and `protocol`'s `ServiceContext`.

use crate::identifiers::{CallerName, EndpointName, HostPort, ServiceName};

/// Incoming request headers and identity, handed to the dispatcher's
/// admission pipeline. Analogous to `ServiceContext` in the teacher crate,
/// trimmed to the fields the dispatch core's admission path reads.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub service_name: ServiceName,
    pub endpoint_name: EndpointName,
    pub caller_name: Option<CallerName>,
    /// `rd` header: overrides the effective destination service.
    pub routing_delegate: Option<ServiceName>,
    /// Remote peer this request arrived from, if known.
    pub remote_host_port: Option<HostPort>,
}

impl RequestContext {
    pub fn new(service_name: ServiceName, endpoint_name: EndpointName) -> Self {
        RequestContext {
            service_name,
            endpoint_name,
            caller_name: None,
            routing_delegate: None,
            remote_host_port: None,
        }
    }

    pub fn with_caller_name(mut self, cn: CallerName) -> Self {
        self.caller_name = Some(cn);
        self
    }

    pub fn with_routing_delegate(mut self, rd: ServiceName) -> Self {
        self.routing_delegate = Some(rd);
        self
    }

    pub fn with_remote_host_port(mut self, hp: HostPort) -> Self {
        self.remote_host_port = Some(hp);
        self
    }

    /// The service name admission should actually act on: `rd` if present,
    /// else the declared `service_name` (§4.2 step 1).
    pub fn effective_service_name(&self) -> &ServiceName {
        self.routing_delegate.as_ref().unwrap_or(&self.service_name)
    }
}
