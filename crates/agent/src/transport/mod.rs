// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! gRPC client for the panel service defined in `xboard.v1`.

pub mod retry;
pub mod state;

use std::future::Future;

use tokio_util::sync::CancellationToken;
use tonic::metadata::{Ascii, MetadataValue};
use tonic::service::interceptor::InterceptedService;
use tonic::service::Interceptor;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Identity};
use tonic::{Request, Status};
use tracing::warn;

use crate::config::{AgentConfig, GrpcConfig};
use crate::transport::retry::{with_retry, CallClass};
use crate::transport::state::StateTracker;

/// Generated protobuf types for the `xboard.v1` package.
pub mod proto {
    tonic::include_proto!("xboard.v1");
}

type GrpcClient = proto::panel_client::PanelClient<InterceptedService<Channel, AuthInterceptor>>;

/// Client interceptor that attaches the host bearer token to every call.
#[derive(Clone)]
pub struct AuthInterceptor {
    header: MetadataValue<Ascii>,
}

impl AuthInterceptor {
    pub fn new(token: &str) -> anyhow::Result<Self> {
        let header = format!("Bearer {token}")
            .parse()
            .map_err(|_| anyhow::anyhow!("host token contains non-ASCII characters"))?;
        Ok(Self { header })
    }
}

impl Interceptor for AuthInterceptor {
    fn call(&mut self, mut req: Request<()>) -> Result<Request<()>, Status> {
        req.metadata_mut().insert("authorization", self.header.clone());
        Ok(req)
    }
}

/// Long-lived authenticated channel to the panel.
///
/// The underlying channel connects lazily and reconnects internally; RPC
/// outcomes feed the [`StateTracker`] so the orchestrator can observe
/// `{disconnected, connecting, connected, reconnecting}` transitions.
pub struct PanelTransport {
    grpc: GrpcClient,
    config: GrpcConfig,
    node_id: i64,
    cancel: CancellationToken,
    pub state: StateTracker,
}

impl PanelTransport {
    /// Build the channel from agent config. Does not block on connect.
    pub fn connect(config: &AgentConfig, cancel: CancellationToken) -> anyhow::Result<Self> {
        let grpc = &config.grpc;
        let mut endpoint = Channel::from_shared(grpc.address.clone())
            .map_err(|e| anyhow::anyhow!("invalid grpc.address {}: {e}", grpc.address))?
            .connect_timeout(grpc.timeout.connect)
            .http2_keep_alive_interval(grpc.keepalive.time)
            .keep_alive_timeout(grpc.keepalive.timeout)
            .keep_alive_while_idle(true);

        if grpc.tls.enabled {
            let mut tls = ClientTlsConfig::new().with_enabled_roots();
            if let Some(ref ca) = grpc.tls.ca {
                let pem = std::fs::read(ca)
                    .map_err(|e| anyhow::anyhow!("reading grpc.tls.ca {}: {e}", ca.display()))?;
                tls = tls.ca_certificate(Certificate::from_pem(pem));
            }
            if let (Some(cert), Some(key)) = (&grpc.tls.cert, &grpc.tls.key) {
                let cert_pem = std::fs::read(cert)?;
                let key_pem = std::fs::read(key)?;
                tls = tls.identity(Identity::from_pem(cert_pem, key_pem));
            }
            if grpc.tls.insecure_skip_verify {
                // rustls offers no unverified mode through tonic; flag is
                // accepted for config compatibility and ignored.
                warn!("grpc.tls.insecure_skip_verify is not supported; verifying normally");
            }
            endpoint = endpoint.tls_config(tls)?;
        }

        let channel = endpoint.connect_lazy();
        let interceptor = AuthInterceptor::new(&config.panel.host_token)?;
        let grpc_client = proto::panel_client::PanelClient::with_interceptor(channel, interceptor);

        let tracker = StateTracker::new();
        tracker.note_connecting();

        Ok(Self {
            grpc: grpc_client,
            config: config.grpc.clone(),
            node_id: config.node_id,
            cancel,
            state: tracker,
        })
    }

    pub fn node_id(&self) -> i64 {
        self.node_id
    }

    /// Run one RPC under `min(root ctx, per-call timeout)` with classified
    /// retry, feeding the state tracker with the outcome.
    async fn retry_call<T, F, Fut>(&self, class: CallClass, mut make: F) -> Result<T, Status>
    where
        F: FnMut(GrpcClient) -> Fut,
        Fut: Future<Output = Result<tonic::Response<T>, Status>>,
    {
        let timeout = self.config.timeout.default;
        let cancel = self.cancel.clone();
        let client = self.grpc.clone();
        let result = with_retry(&self.config.retry, &self.cancel, class, move || {
            let fut = make(client.clone());
            let cancel = cancel.clone();
            async move {
                tokio::select! {
                    _ = cancel.cancelled() => Err(Status::cancelled("agent shutting down")),
                    result = tokio::time::timeout(timeout, fut) => match result {
                        Ok(r) => r.map(tonic::Response::into_inner),
                        Err(_) => Err(Status::deadline_exceeded("rpc deadline exceeded")),
                    },
                }
            }
        })
        .await;

        match &result {
            Ok(_) => self.state.note_success(),
            Err(status) => {
                if self.state.note_failure() {
                    warn!(code = ?status.code(), "panel rpc failed: {}", status.message());
                }
            }
        }
        result
    }

    pub async fn heartbeat(&self, timestamp: i64) -> Result<(), Status> {
        let node_id = self.node_id;
        self.retry_call(CallClass::Normal, move |mut c| async move {
            c.heartbeat(proto::HeartbeatRequest { node_id, timestamp }).await
        })
        .await
        .map(|_: proto::HeartbeatResponse| ())
    }

    pub async fn get_config(&self, etag: &str) -> Result<proto::GetConfigResponse, Status> {
        let node_id = self.node_id;
        let etag = etag.to_owned();
        self.retry_call(CallClass::Normal, move |mut c| {
            let etag = etag.clone();
            async move { c.get_config(proto::GetConfigRequest { node_id, etag }).await }
        })
        .await
    }

    pub async fn get_users(
        &self,
        etag: &str,
        since_version: i64,
    ) -> Result<proto::GetUsersResponse, Status> {
        let node_id = self.node_id;
        let etag = etag.to_owned();
        self.retry_call(CallClass::Normal, move |mut c| {
            let etag = etag.clone();
            async move { c.get_users(proto::GetUsersRequest { node_id, etag, since_version }).await }
        })
        .await
    }

    pub async fn report_status(
        &self,
        report: proto::StatusReport,
    ) -> Result<proto::ReportStatusResponse, Status> {
        self.retry_call(CallClass::Critical, move |mut c| {
            let report = report.clone();
            async move { c.report_status(report).await }
        })
        .await
    }

    pub async fn report_traffic(
        &self,
        timestamp: i64,
        traffic: Vec<proto::UserTraffic>,
    ) -> Result<proto::ReportTrafficResponse, Status> {
        let node_id = self.node_id;
        self.retry_call(CallClass::Critical, move |mut c| {
            let traffic = traffic.clone();
            async move {
                c.report_traffic(proto::ReportTrafficRequest { node_id, timestamp, traffic }).await
            }
        })
        .await
    }

    pub async fn report_alive(&self, timestamp: i64, user_ids: Vec<i64>) -> Result<(), Status> {
        let node_id = self.node_id;
        self.retry_call(CallClass::Normal, move |mut c| {
            let user_ids = user_ids.clone();
            async move {
                c.report_alive(proto::ReportAliveRequest { node_id, timestamp, user_ids }).await
            }
        })
        .await
        .map(|_: proto::ReportAliveResponse| ())
    }

    pub async fn get_forwarding_rules(
        &self,
        version: i64,
    ) -> Result<proto::GetForwardingRulesResponse, Status> {
        let node_id = self.node_id;
        self.retry_call(CallClass::Normal, move |mut c| async move {
            c.get_forwarding_rules(proto::GetForwardingRulesRequest { node_id, version }).await
        })
        .await
    }

    pub async fn report_forwarding_status(
        &self,
        report: proto::ForwardingStatusReport,
    ) -> Result<(), Status> {
        self.retry_call(CallClass::Normal, move |mut c| {
            let report = report.clone();
            async move { c.report_forwarding_status(report).await }
        })
        .await
        .map(|_: proto::ReportForwardingStatusResponse| ())
    }

    pub async fn report_access_logs(
        &self,
        entries: Vec<proto::AccessLogEntry>,
    ) -> Result<proto::ReportAccessLogsResponse, Status> {
        let node_id = self.node_id;
        self.retry_call(CallClass::Normal, move |mut c| {
            let entries = entries.clone();
            async move {
                c.report_access_logs(proto::ReportAccessLogsRequest { node_id, entries }).await
            }
        })
        .await
    }

    /// Open the bidirectional command stream. The caller owns the outbound
    /// message stream and consumes inbound panel commands.
    pub async fn status_stream<S>(
        &self,
        outbound: S,
    ) -> Result<tonic::Streaming<proto::PanelCommand>, Status>
    where
        S: tokio_stream::Stream<Item = proto::AgentMessage> + Send + 'static,
    {
        let mut client = self.grpc.clone();
        let connect_timeout = self.config.timeout.connect + self.config.timeout.default;
        let result = tokio::select! {
            _ = self.cancel.cancelled() => Err(Status::cancelled("agent shutting down")),
            r = tokio::time::timeout(connect_timeout, client.status_stream(Request::new(outbound))) => {
                match r {
                    Ok(resp) => resp.map(tonic::Response::into_inner),
                    Err(_) => Err(Status::deadline_exceeded("stream open deadline exceeded")),
                }
            }
        };
        match &result {
            Ok(_) => self.state.note_success(),
            Err(status) => {
                if self.state.note_failure() {
                    warn!(code = ?status.code(), "status stream open failed: {}", status.message());
                }
            }
        }
        result
    }
}

/// Epoch seconds for report timestamps.
pub fn now_epoch_secs() -> i64 {
    match std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(_) => 0,
    }
}
