// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! gRPC implementation of the `xboard.v1.Panel` service.

use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, warn};

use crate::state::PanelState;

/// Generated protobuf types for the `xboard.v1` package.
pub mod proto {
    tonic::include_proto!("xboard.v1");
}

type GrpcStream<T> = Pin<Box<dyn tokio_stream::Stream<Item = Result<T, Status>> + Send + 'static>>;

/// Constant-time string comparison to prevent timing side channels on
/// the host token.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut acc = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        acc |= x ^ y;
    }
    acc == 0
}

/// Interceptor validating `authorization: Bearer <token>` on every RPC.
#[derive(Clone)]
pub struct AuthInterceptor {
    token: String,
}

impl AuthInterceptor {
    pub fn new(token: String) -> Self {
        Self { token }
    }
}

impl tonic::service::Interceptor for AuthInterceptor {
    fn call(&mut self, req: Request<()>) -> Result<Request<()>, Status> {
        let header = req
            .metadata()
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| Status::unauthenticated("missing authorization header"))?;

        let bearer = header
            .strip_prefix("Bearer ")
            .ok_or_else(|| Status::unauthenticated("invalid authorization scheme"))?;

        if constant_time_eq(bearer, &self.token) {
            Ok(req)
        } else {
            Err(Status::unauthenticated("invalid token"))
        }
    }
}

/// The service handle: thin wrapper over shared state.
pub struct PanelGrpc {
    state: Arc<PanelState>,
}

impl PanelGrpc {
    pub fn new(state: Arc<PanelState>) -> Self {
        Self { state }
    }

    /// Build a [`tonic`] router with the auth interceptor installed.
    pub fn into_router(self) -> tonic::transport::server::Router {
        let interceptor = AuthInterceptor::new(self.state.token().to_owned());
        tonic::transport::Server::builder()
            .add_service(proto::panel_server::PanelServer::with_interceptor(self, interceptor))
    }
}

#[tonic::async_trait]
impl proto::panel_server::Panel for PanelGrpc {
    async fn heartbeat(
        &self,
        request: Request<proto::HeartbeatRequest>,
    ) -> Result<Response<proto::HeartbeatResponse>, Status> {
        let req = request.into_inner();
        debug!(node = req.node_id, ts = req.timestamp, "heartbeat");
        Ok(Response::new(proto::HeartbeatResponse {}))
    }

    async fn get_config(
        &self,
        request: Request<proto::GetConfigRequest>,
    ) -> Result<Response<proto::GetConfigResponse>, Status> {
        let req = request.into_inner();
        let docs = self.state.node_docs(req.node_id).await.unwrap_or_default();
        if !docs.config_etag.is_empty() && docs.config_etag == req.etag {
            return Ok(Response::new(proto::GetConfigResponse {
                config_json: String::new(),
                version: docs.config_version,
                etag: docs.config_etag,
                not_modified: true,
            }));
        }
        Ok(Response::new(proto::GetConfigResponse {
            config_json: docs.config_json,
            version: docs.config_version,
            etag: docs.config_etag,
            not_modified: false,
        }))
    }

    async fn get_users(
        &self,
        request: Request<proto::GetUsersRequest>,
    ) -> Result<Response<proto::GetUsersResponse>, Status> {
        let req = request.into_inner();
        let docs = self.state.node_docs(req.node_id).await.unwrap_or_default();
        if !docs.users_etag.is_empty() && docs.users_etag == req.etag {
            return Ok(Response::new(proto::GetUsersResponse {
                users: vec![],
                etag: docs.users_etag,
                not_modified: true,
            }));
        }
        Ok(Response::new(proto::GetUsersResponse {
            users: docs.users,
            etag: docs.users_etag,
            not_modified: false,
        }))
    }

    async fn report_status(
        &self,
        request: Request<proto::StatusReport>,
    ) -> Result<Response<proto::ReportStatusResponse>, Status> {
        let report = request.into_inner();
        let (sync_interval_seconds, report_interval_seconds) =
            self.state.interval_overrides().await;
        self.state.record_status(report).await;
        Ok(Response::new(proto::ReportStatusResponse {
            sync_interval_seconds,
            report_interval_seconds,
        }))
    }

    async fn report_traffic(
        &self,
        request: Request<proto::ReportTrafficRequest>,
    ) -> Result<Response<proto::ReportTrafficResponse>, Status> {
        let req = request.into_inner();
        for entry in &req.traffic {
            self.state.accumulators.collect_with_host(
                req.node_id,
                entry.user_id,
                entry.upload_bytes,
                entry.download_bytes,
            );
        }
        Ok(Response::new(proto::ReportTrafficResponse { success: true }))
    }

    async fn report_alive(
        &self,
        request: Request<proto::ReportAliveRequest>,
    ) -> Result<Response<proto::ReportAliveResponse>, Status> {
        let req = request.into_inner();
        self.state.record_alive(req.node_id, req.user_ids).await;
        Ok(Response::new(proto::ReportAliveResponse {}))
    }

    async fn get_forwarding_rules(
        &self,
        request: Request<proto::GetForwardingRulesRequest>,
    ) -> Result<Response<proto::GetForwardingRulesResponse>, Status> {
        let req = request.into_inner();
        let docs = self.state.node_docs(req.node_id).await.unwrap_or_default();
        if docs.forwarding_version == req.version {
            return Ok(Response::new(proto::GetForwardingRulesResponse {
                rules: vec![],
                version: docs.forwarding_version,
                not_modified: true,
                success: true,
                error_message: String::new(),
            }));
        }
        Ok(Response::new(proto::GetForwardingRulesResponse {
            rules: docs.forwarding_rules,
            version: docs.forwarding_version,
            not_modified: false,
            success: true,
            error_message: String::new(),
        }))
    }

    async fn report_forwarding_status(
        &self,
        request: Request<proto::ForwardingStatusReport>,
    ) -> Result<Response<proto::ReportForwardingStatusResponse>, Status> {
        let ack = request.into_inner();
        if !ack.success {
            warn!(node = ack.node_id, version = ack.version, "forwarding apply failed: {}", ack.error_message);
        }
        self.state.record_forwarding_ack(ack).await;
        Ok(Response::new(proto::ReportForwardingStatusResponse {}))
    }

    async fn report_access_logs(
        &self,
        request: Request<proto::ReportAccessLogsRequest>,
    ) -> Result<Response<proto::ReportAccessLogsResponse>, Status> {
        let req = request.into_inner();
        debug!(node = req.node_id, entries = req.entries.len(), "access logs received");
        Ok(Response::new(proto::ReportAccessLogsResponse {
            success: true,
            message: format!("{} entries accepted", req.entries.len()),
        }))
    }

    type StatusStreamStream = GrpcStream<proto::PanelCommand>;

    async fn status_stream(
        &self,
        request: Request<Streaming<proto::AgentMessage>>,
    ) -> Result<Response<Self::StatusStreamStream>, Status> {
        let mut inbound = request.into_inner();
        let (tx, rx) = mpsc::channel(16);
        let state = Arc::clone(&self.state);

        tokio::spawn(async move {
            let mut node_id: Option<i64> = None;
            loop {
                let message = tokio::select! {
                    _ = state.shutdown.cancelled() => break,
                    msg = inbound.message() => msg,
                };
                let message = match message {
                    Ok(Some(msg)) => msg,
                    Ok(None) => break,
                    Err(e) => {
                        debug!("agent stream error: {}", e.message());
                        break;
                    }
                };
                match message.message {
                    Some(proto::agent_message::Message::Hello(hello)) => {
                        node_id = Some(hello.node_id);
                        state.register_agent(hello.node_id, tx.clone()).await;
                    }
                    Some(proto::agent_message::Message::SwitchResult(result)) => {
                        let command_id = result.command_id;
                        state
                            .resolve_reply(command_id, proto::AgentMessage {
                                message: Some(proto::agent_message::Message::SwitchResult(result)),
                            })
                            .await;
                    }
                    Some(proto::agent_message::Message::Cores(report)) => {
                        let command_id = report.command_id;
                        state
                            .resolve_reply(command_id, proto::AgentMessage {
                                message: Some(proto::agent_message::Message::Cores(report)),
                            })
                            .await;
                    }
                    None => {}
                }
            }
            if let Some(id) = node_id {
                state.unregister_agent(id).await;
            }
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }
}

#[cfg(test)]
#[path = "service_tests.rs"]
mod tests;
