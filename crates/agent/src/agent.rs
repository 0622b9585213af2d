// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Agent orchestrator: wires engines, switcher, nftables, and the panel
//! transport together and runs the periodic loops.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, Notify};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::accesslog::AccessLogCollector;
use crate::capability::CapabilityCache;
use crate::config::{AgentConfig, EngineConfig};
use crate::engine::adapter::EngineAdapter;
use crate::engine::inject::{inject_users, PanelUser};
use crate::engine::manager::CoreManager;
use crate::engine::registry::InstanceRegistry;
use crate::engine::{parse, EngineKind};
use crate::metrics::MetricsCollector;
use crate::nft::forward::{ForwardingApplier, ForwardingRule};
use crate::nft::{ApplyLock, Nft, Protocol};
use crate::service::ServiceManager;
use crate::switch::{SwitchOutcome, SwitchRequest, Switcher};
use crate::transport::state::ConnState;
use crate::transport::{now_epoch_secs, proto, PanelTransport};

/// Everything the loops share.
pub struct AgentState {
    pub config: AgentConfig,
    pub transport: Arc<PanelTransport>,
    pub manager: Arc<CoreManager>,
    pub switcher: Option<Arc<Switcher<CoreManager>>>,
    pub capabilities: Arc<CapabilityCache>,
    pub shutdown: CancellationToken,

    forwarding: Option<Mutex<ForwardingApplier>>,
    apply_lock: Arc<ApplyLock>,
    metrics: Mutex<MetricsCollector>,

    /// ETags for cache-coherent pulls; updated only after a successful
    /// local apply so recovery re-pulls cleanly.
    config_etag: Mutex<String>,
    users_etag: Mutex<String>,
    /// Engine flavor and staged path of the currently-applied config.
    active_config: Mutex<Option<(EngineKind, PathBuf)>>,

    /// Tick periods in seconds, swapped atomically by server overrides.
    sync_secs: AtomicU64,
    report_secs: AtomicU64,
    /// Rung on transition to connected for an immediate sync + report.
    sync_now: Notify,
    report_now: Notify,
}

impl AgentState {
    pub fn sync_period(&self) -> Duration {
        Duration::from_secs(self.sync_secs.load(Ordering::Relaxed).max(1))
    }

    pub fn report_period(&self) -> Duration {
        Duration::from_secs(self.report_secs.load(Ordering::Relaxed).max(1))
    }

    /// Install server-sent tick overrides; zero means "keep current".
    /// The next tick boundary picks the new period up.
    pub fn apply_interval_overrides(&self, sync_secs: u32, report_secs: u32) {
        if sync_secs > 0 {
            self.sync_secs.store(u64::from(sync_secs), Ordering::Relaxed);
            info!(seconds = sync_secs, "sync interval overridden");
        }
        if report_secs > 0 {
            self.report_secs.store(u64::from(report_secs), Ordering::Relaxed);
            info!(seconds = report_secs, "report interval overridden");
        }
    }
}

/// Build the full agent and run until a termination signal.
pub async fn run(config: AgentConfig) -> anyhow::Result<()> {
    run_with_shutdown(config, CancellationToken::new()).await
}

/// Run with an externally-owned shutdown token.
pub async fn run_with_shutdown(
    config: AgentConfig,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let state = Arc::new(build(config, shutdown.clone()).await?);

    // A connected channel means the panel may have newer state than our
    // ETags; pull and report immediately instead of waiting a tick.
    {
        let sync_state = Arc::downgrade(&state);
        state.transport.state.on_change(Arc::new(move |conn| {
            if conn == ConnState::Connected {
                if let Some(state) = sync_state.upgrade() {
                    state.sync_now.notify_one();
                    state.report_now.notify_one();
                }
            }
        }));
    }

    let mut tasks = vec![
        tokio::spawn(sync_loop(Arc::clone(&state))),
        tokio::spawn(report_loop(Arc::clone(&state))),
        tokio::spawn(stream_loop(Arc::clone(&state))),
    ];
    if state.forwarding.is_some() {
        tasks.push(tokio::spawn(forwarding_loop(Arc::clone(&state))));
    }
    tasks.extend(spawn_accesslog_loops(&state));

    wait_for_shutdown(&shutdown).await;
    info!("shutting down");
    shutdown.cancel();

    for task in tasks {
        let _ = tokio::time::timeout(Duration::from_secs(5), task).await;
    }
    if let Some(ref switcher) = state.switcher {
        switcher.shutdown().await;
    }
    Ok(())
}

/// Construct the shared state without spawning any loops. The normal
/// entry point is [`run`]; this is also the seam embedding tests use.
pub async fn build(
    config: AgentConfig,
    shutdown: CancellationToken,
) -> anyhow::Result<AgentState> {
    let service = Arc::new(ServiceManager::detect(&config.service, &config.proxy.pid_dir));
    info!(backend = service.kind(), "service manager selected");

    let registry = Arc::new(InstanceRegistry::new());
    let capabilities = Arc::new(CapabilityCache::default());

    let mut manager = CoreManager::new(Arc::clone(&registry));
    for (kind, engine_config) in configured_engines(&config) {
        manager.register(Arc::new(EngineAdapter::new(
            kind,
            engine_config,
            Arc::clone(&service),
            Arc::clone(&registry),
            Arc::clone(&capabilities),
        )));
        info!(engine = %kind, "engine adapter registered");
    }
    let manager = Arc::new(manager);

    let apply_lock = Arc::new(ApplyLock::new());
    let switcher = if config.proxy.enabled {
        let switcher = Arc::new(Switcher::new(
            Arc::clone(&manager),
            config.proxy.clone(),
            Arc::clone(&apply_lock),
            shutdown.clone(),
        ));
        switcher.initialize().await?;
        Some(switcher)
    } else {
        None
    };

    let forwarding = config.forwarding.enabled.then(|| {
        Mutex::new(ForwardingApplier::new(
            Nft::new(config.proxy.nft_bin.clone()),
            config.forwarding.table_name.clone(),
        ))
    });

    let transport = Arc::new(PanelTransport::connect(&config, shutdown.clone())?);

    Ok(AgentState {
        sync_secs: AtomicU64::new(config.interval.sync),
        report_secs: AtomicU64::new(config.interval.report),
        config,
        transport,
        manager,
        switcher,
        capabilities,
        shutdown,
        forwarding,
        apply_lock,
        metrics: Mutex::new(MetricsCollector::new()),
        config_etag: Mutex::new(String::new()),
        users_etag: Mutex::new(String::new()),
        active_config: Mutex::new(None),
        sync_now: Notify::new(),
        report_now: Notify::new(),
    })
}

fn configured_engines(config: &AgentConfig) -> Vec<(EngineKind, EngineConfig)> {
    let mut engines = vec![];
    if let Some(ref xray) = config.engines.xray {
        engines.push((EngineKind::Xray, xray.clone()));
    }
    if let Some(ref singbox) = config.engines.singbox {
        engines.push((EngineKind::SingBox, singbox.clone()));
    }
    engines
}

async fn wait_for_shutdown(shutdown: &CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();
    let mut sigterm =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();
    tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = ctrl_c => {}
        _ = async {
            match sigterm.as_mut() {
                Some(sig) => { sig.recv().await; }
                None => std::future::pending().await,
            }
        } => {}
    }
}

// -- Sync loop ----------------------------------------------------------------

async fn sync_loop(state: Arc<AgentState>) {
    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,
            _ = state.sync_now.notified() => {}
            _ = tokio::time::sleep(state.sync_period()) => {}
        }
        if state.shutdown.is_cancelled() {
            break;
        }
        sync_tick(&state).await;
    }
}

/// One sync pass: ETag-gated config pull, then ETag-gated user pull.
pub async fn sync_tick(state: &AgentState) {
    let config_etag = state.config_etag.lock().await.clone();
    match state.transport.get_config(&config_etag).await {
        Ok(resp) if !resp.not_modified => {
            if resp.config_json.is_empty() {
                debug!("panel has no config for this node yet");
            } else {
                match apply_config(state, &resp.config_json).await {
                    Ok(kind) => {
                        *state.config_etag.lock().await = resp.etag;
                        info!(engine = %kind, version = resp.version, "config applied");
                    }
                    Err(e) => warn!("config apply failed, etag unchanged: {e:#}"),
                }
            }
        }
        Ok(_) => debug!("config not modified"),
        Err(e) => debug!("config pull failed: {}", e.message()),
    }

    let users_etag = state.users_etag.lock().await.clone();
    match state.transport.get_users(&users_etag, 0).await {
        Ok(resp) if !resp.not_modified => {
            let users: Vec<PanelUser> = resp
                .users
                .into_iter()
                .map(|u| PanelUser { uuid: u.uuid, email: u.email, enabled: u.enabled })
                .collect();
            match apply_users(state, &users).await {
                Ok(touched) => {
                    *state.users_etag.lock().await = resp.etag;
                    info!(users = users.len(), inbounds = touched, "users injected");
                }
                Err(e) => warn!("user injection failed, etag unchanged: {e:#}"),
            }
        }
        Ok(_) => debug!("users not modified"),
        Err(e) => debug!("user pull failed: {}", e.message()),
    }
}

/// Validate, stage, and reload the node config pushed by the panel.
async fn apply_config(state: &AgentState, config_json: &str) -> anyhow::Result<EngineKind> {
    let (kind, _details) = parse::parse_config(config_json)?;
    let adapter = state.manager.adapter(kind)?;

    let base_id = adapter.config().service_name.clone();
    let staged = adapter.staged_path(&base_id);
    let unchanged = std::fs::read(&staged).map(|b| b == config_json.as_bytes()).unwrap_or(false);
    if !unchanged {
        if let Some(parent) = staged.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&staged, config_json)?;
        reload_if_running(state, kind, &base_id).await?;
    }

    *state.active_config.lock().await = Some((kind, staged));
    Ok(kind)
}

/// Reload the base service only when it is actually running; staging a
/// config for a stopped or not-yet-installed engine is still success.
async fn reload_if_running(
    state: &AgentState,
    kind: EngineKind,
    base_id: &str,
) -> anyhow::Result<()> {
    let adapter = state.manager.adapter(kind)?;
    let running = adapter.status(base_id).await.map(|s| s.running).unwrap_or(false);
    if running {
        adapter.reload(base_id).await?;
    } else {
        debug!(engine = %kind, "service not running; staged config applies on next start");
    }
    Ok(())
}

/// Inject panel users into the active staged config and reload.
async fn apply_users(state: &AgentState, users: &[PanelUser]) -> anyhow::Result<usize> {
    let Some((kind, staged)) = state.active_config.lock().await.clone() else {
        anyhow::bail!("no active config to inject users into");
    };
    let current = std::fs::read_to_string(&staged)?;
    let (rewritten, touched) = inject_users(&current, users)?;
    if rewritten != current {
        std::fs::write(&staged, rewritten)?;
        let base_id = state.manager.adapter(kind)?.config().service_name.clone();
        reload_if_running(state, kind, &base_id).await?;
    }
    Ok(touched)
}

// -- Report loop --------------------------------------------------------------

async fn report_loop(state: Arc<AgentState>) {
    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,
            _ = state.report_now.notified() => {}
            _ = tokio::time::sleep(state.report_period()) => {}
        }
        if state.shutdown.is_cancelled() {
            break;
        }
        report_tick(&state).await;
    }
}

/// One report pass: liveness, then status, then traffic and presence.
pub async fn report_tick(state: &AgentState) {
    if let Err(e) = state.transport.heartbeat(now_epoch_secs()).await {
        debug!("heartbeat failed: {}", e.message());
    }

    let report = build_status_report(state).await;
    match state.transport.report_status(report).await {
        Ok(resp) => {
            state.apply_interval_overrides(resp.sync_interval_seconds, resp.report_interval_seconds);
        }
        Err(e) => debug!("status report failed: {}", e.message()),
    }

    let deltas = state.manager.collect_traffic().await;
    if !deltas.is_empty() {
        let timestamp = now_epoch_secs();
        let user_ids: Vec<i64> = deltas.iter().map(|d| d.user_id).collect();
        let traffic: Vec<proto::UserTraffic> = deltas
            .into_iter()
            .map(|d| proto::UserTraffic {
                user_id: d.user_id,
                upload_bytes: d.upload,
                download_bytes: d.download,
            })
            .collect();
        if let Err(e) = state.transport.report_traffic(timestamp, traffic).await {
            warn!("traffic report failed: {}", e.message());
        }
        if let Err(e) = state.transport.report_alive(timestamp, user_ids).await {
            debug!("alive report failed: {}", e.message());
        }
    }
}

async fn build_status_report(state: &AgentState) -> proto::StatusReport {
    let (metrics, netio) = {
        let mut collector = state.metrics.lock().await;
        (collector.collect(), collector.netio_delta())
    };

    let mut engines = vec![];
    for kind in state.manager.kinds() {
        let Ok(adapter) = state.manager.adapter(kind) else { continue };
        let probe = adapter.probe().await;
        engines.push(proto::EngineCapabilities {
            engine_kind: probe.engine_kind,
            version: probe.version,
            capabilities: probe.capabilities,
            build_tags: probe.build_tags,
        });
    }

    let instances = state
        .manager
        .instances()
        .await
        .into_iter()
        .map(|record| proto::CoreInstanceInfo {
            id: record.id,
            engine_kind: record.engine_kind.as_str().to_owned(),
            state: record.state.as_str().to_owned(),
            listen_ports: record.listen_ports.iter().map(|&p| u32::from(p)).collect(),
            config_path: record.config_path.to_string_lossy().into_owned(),
            config_hash: record.config_hash,
            pid: record.pid.unwrap_or(0),
            started_at: record.started_at.unwrap_or(0),
            last_error: record.last_error.unwrap_or_default(),
        })
        .collect();

    let mut configs = vec![];
    if let Some((_, ref staged)) = *state.active_config.lock().await {
        if let Ok(bytes) = std::fs::read_to_string(staged) {
            let protocols = parse::parse_config(&bytes)
                .map(|(_, details)| details.into_iter().map(|d| d.protocol).collect())
                .unwrap_or_default();
            configs.push(proto::LocalConfigInfo {
                path: staged.to_string_lossy().into_owned(),
                content_hash: crate::engine::config_digest(bytes.as_bytes()),
                protocols,
            });
        }
    }

    proto::StatusReport {
        node_id: state.transport.node_id(),
        timestamp: now_epoch_secs(),
        system: Some(proto::SystemMetrics {
            cpu_percent: metrics.cpu_percent,
            mem_used_bytes: metrics.mem_used_bytes,
            mem_total_bytes: metrics.mem_total_bytes,
            disk_used_bytes: metrics.disk_used_bytes,
            disk_total_bytes: metrics.disk_total_bytes,
            load1: metrics.load1,
            load5: metrics.load5,
            load15: metrics.load15,
            uptime_secs: metrics.uptime_secs,
            process_count: metrics.process_count,
            tcp_count: metrics.tcp_count,
            udp_count: metrics.udp_count,
        }),
        net_io: Some(proto::NetIoDelta { rx_bytes: netio.rx_bytes, tx_bytes: netio.tx_bytes }),
        engines,
        instances,
        configs,
    }
}

// -- Forwarding loop ----------------------------------------------------------

async fn forwarding_loop(state: Arc<AgentState>) {
    let period = state.config.forwarding.sync_interval;
    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,
            _ = tokio::time::sleep(period) => {}
        }
        if state.shutdown.is_cancelled() {
            break;
        }
        forwarding_tick(&state).await;
    }
}

/// One forwarding pass: versioned pull, validate, atomic apply, report.
pub async fn forwarding_tick(state: &AgentState) {
    let Some(ref applier_lock) = state.forwarding else {
        return;
    };
    if state.transport.state.current() != ConnState::Connected {
        warn!("skipping forwarding sync: transport not connected");
        return;
    }

    let mut applier = applier_lock.lock().await;
    let resp = match state.transport.get_forwarding_rules(applier.version()).await {
        Ok(resp) => resp,
        Err(e) => {
            debug!("forwarding pull failed: {}", e.message());
            return;
        }
    };
    if resp.not_modified {
        return;
    }
    if !resp.success {
        warn!("panel refused forwarding pull: {}", resp.error_message);
        return;
    }

    if !applier.nft_available().await {
        warn!("nftables unavailable; reporting failure without version bump");
        report_forwarding(state, resp.version, false, "nftables not available").await;
        return;
    }

    let rules = convert_forwarding_rules(&resp.rules);
    match applier.apply(&state.apply_lock, &rules, resp.version).await {
        Ok(()) => {
            info!(version = resp.version, rules = rules.len(), "forwarding rules applied");
            report_forwarding(state, resp.version, true, "").await;
        }
        Err(e) => {
            warn!(version = resp.version, "forwarding apply failed: {e:#}");
            report_forwarding(state, resp.version, false, &format!("{e:#}")).await;
        }
    }
}

fn convert_forwarding_rules(rules: &[proto::ForwardingRule]) -> Vec<ForwardingRule> {
    rules
        .iter()
        .filter_map(|rule| {
            let protocol = match Protocol::parse(&rule.protocol) {
                Ok(p) => p,
                Err(e) => {
                    warn!(rule = rule.id, "skipping forwarding rule: {e:#}");
                    return None;
                }
            };
            Some(ForwardingRule {
                id: rule.id,
                listen_port: rule.listen_port as u16,
                target_address: rule.target_address.clone(),
                target_port: rule.target_port as u16,
                protocol,
                priority: rule.priority,
                enabled: rule.enabled,
            })
        })
        .collect()
}

async fn report_forwarding(state: &AgentState, version: i64, success: bool, error: &str) {
    let report = proto::ForwardingStatusReport {
        node_id: state.transport.node_id(),
        version,
        success,
        error_message: error.to_owned(),
        applied_at: now_epoch_secs(),
    };
    if let Err(e) = state.transport.report_forwarding_status(report).await {
        debug!("forwarding status report failed: {}", e.message());
    }
}

// -- Command stream -----------------------------------------------------------

async fn stream_loop(state: Arc<AgentState>) {
    let mut backoff = crate::transport::retry::Backoff::new(&state.config.grpc.retry);
    loop {
        if state.shutdown.is_cancelled() {
            break;
        }
        match run_stream(&state).await {
            Ok(()) => {
                debug!("status stream closed by panel");
                backoff = crate::transport::retry::Backoff::new(&state.config.grpc.retry);
            }
            Err(e) => {
                if state.transport.state.note_failure() {
                    warn!("status stream failed: {}", e.message());
                }
            }
        }
        let delay = backoff.next_delay();
        tokio::select! {
            _ = state.shutdown.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn run_stream(state: &Arc<AgentState>) -> Result<(), tonic::Status> {
    let (tx, rx) = mpsc::channel::<proto::AgentMessage>(16);
    tx.send(proto::AgentMessage {
        message: Some(proto::agent_message::Message::Hello(proto::AgentHello {
            node_id: state.transport.node_id(),
        })),
    })
    .await
    .map_err(|_| tonic::Status::cancelled("stream sender closed"))?;

    let mut inbound = state.transport.status_stream(ReceiverStream::new(rx)).await?;
    info!("status stream established");

    loop {
        let command = tokio::select! {
            _ = state.shutdown.cancelled() => return Ok(()),
            msg = inbound.message() => msg?,
        };
        let Some(command) = command else {
            return Ok(());
        };
        match command.command {
            Some(proto::panel_command::Command::SwitchCore(cmd)) => {
                let reply = handle_switch_core(state, cmd).await;
                let _ = tx
                    .send(proto::AgentMessage {
                        message: Some(proto::agent_message::Message::SwitchResult(reply)),
                    })
                    .await;
            }
            Some(proto::panel_command::Command::GetCores(cmd)) => {
                let reply = handle_get_cores(state, cmd.command_id).await;
                let _ = tx
                    .send(proto::AgentMessage {
                        message: Some(proto::agent_message::Message::Cores(reply)),
                    })
                    .await;
            }
            None => debug!("empty panel command ignored"),
        }
    }
}

/// Dispatch one `SwitchCore` command. Zero-downtime and cold paths are
/// distinct: a request for one never falls back to the other.
pub(crate) async fn handle_switch_core(
    state: &AgentState,
    cmd: proto::SwitchCoreCommand,
) -> proto::SwitchCoreResult {
    let command_id = cmd.command_id;
    let fail = |error: String| proto::SwitchCoreResult {
        command_id,
        success: false,
        new_instance_id: String::new(),
        error,
        message: String::new(),
        port_mappings: Default::default(),
    };

    let kind = match EngineKind::parse(&cmd.engine_kind) {
        Ok(kind) => kind,
        Err(e) => return fail(format!("{e:#}")),
    };
    let external_ports: Vec<u16> = cmd.listen_ports.iter().map(|&p| p as u16).collect();
    let from = (!cmd.from_instance_id.is_empty()).then(|| cmd.from_instance_id.clone());

    if cmd.zero_downtime {
        let Some(ref switcher) = state.switcher else {
            return fail("zero-downtime switching is disabled on this agent".to_owned());
        };
        let request = SwitchRequest {
            from_instance_id: from,
            engine_kind: kind,
            config_json: cmd.config_json,
            external_ports,
        };
        match switcher.switch(request).await {
            Ok(SwitchOutcome { new_instance_id, port_mappings }) => proto::SwitchCoreResult {
                command_id,
                success: true,
                new_instance_id,
                error: String::new(),
                message: format!("switch {} complete", cmd.switch_id),
                port_mappings: port_mappings
                    .into_iter()
                    .map(|(e, i)| (u32::from(e), u32::from(i)))
                    .collect(),
            },
            Err(e) => fail(format!("{e:#}")),
        }
    } else {
        match state
            .manager
            .switch_core(from.as_deref(), kind, &cmd.config_json, &external_ports)
            .await
        {
            Ok(new_instance_id) => proto::SwitchCoreResult {
                command_id,
                success: true,
                new_instance_id,
                error: String::new(),
                message: format!("cold switch {} complete", cmd.switch_id),
                port_mappings: Default::default(),
            },
            Err(e) => fail(format!("{e:#}")),
        }
    }
}

async fn handle_get_cores(state: &AgentState, command_id: u64) -> proto::CoresReport {
    let mut cores = vec![];
    for kind in state.manager.kinds() {
        let Ok(adapter) = state.manager.adapter(kind) else { continue };
        let probe = adapter.probe().await;
        cores.push(proto::InstalledCore {
            engine_kind: kind.as_str().to_owned(),
            version: probe.version,
            installed: adapter.is_installed(),
        });
    }
    let instances = state
        .manager
        .instances()
        .await
        .into_iter()
        .map(|record| proto::CoreInstanceInfo {
            id: record.id,
            engine_kind: record.engine_kind.as_str().to_owned(),
            state: record.state.as_str().to_owned(),
            listen_ports: record.listen_ports.iter().map(|&p| u32::from(p)).collect(),
            config_path: record.config_path.to_string_lossy().into_owned(),
            config_hash: record.config_hash,
            pid: record.pid.unwrap_or(0),
            started_at: record.started_at.unwrap_or(0),
            last_error: record.last_error.unwrap_or_default(),
        })
        .collect();
    proto::CoresReport { command_id, cores, instances }
}

// -- Access log loops ---------------------------------------------------------

fn spawn_accesslog_loops(state: &Arc<AgentState>) -> Vec<tokio::task::JoinHandle<()>> {
    let mut tasks = vec![];
    for (kind, engine_config) in configured_engines(&state.config) {
        let Some(access_log) = engine_config.access_log else { continue };
        info!(engine = %kind, path = %access_log.display(), "access log collector enabled");

        let (tx, mut rx) = mpsc::channel(16);
        let collector = AccessLogCollector::new(access_log);
        tasks.push(tokio::spawn(collector.run(tx, state.shutdown.clone())));

        let state = Arc::clone(state);
        tasks.push(tokio::spawn(async move {
            while let Some(batch) = rx.recv().await {
                let entries: Vec<proto::AccessLogEntry> = batch
                    .into_iter()
                    .map(|e| proto::AccessLogEntry {
                        timestamp: e.timestamp,
                        user: e.user,
                        target: e.target,
                        protocol: e.protocol,
                    })
                    .collect();
                match state.transport.report_access_logs(entries).await {
                    Ok(resp) if !resp.success => {
                        debug!("panel rejected access logs: {}", resp.message);
                    }
                    Ok(_) => {}
                    Err(e) => debug!("access log report failed: {}", e.message()),
                }
            }
        }));
    }
    tasks
}

#[cfg(test)]
#[path = "agent_tests.rs"]
mod tests;
