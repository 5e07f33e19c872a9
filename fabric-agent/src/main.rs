mod control_socket;

use clap::Parser;
use control_socket::{AgentState, SharedStatus};
use fabric_core::{
    adaptor::Adaptor,
    controller::{ControllerClient, Organization},
    endpoint_discovery::{self, DiscoveryInputs},
    informer::Informer,
    nat::{self, NatKind},
    reconcile::{LivenessMap, Reconciler},
    relay, security_group, stun,
};
use fabric_shared::{
    interface_config::{ApiToken, InterfaceKeys},
    AgentError, Device, DeviceEndpoint, Endpoint, EndpointSource, WgLocalConfig,
};
use ipnet::IpNet;
use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};
use tokio_util::sync::CancellationToken;
use wireguard_control::InterfaceName;

/// Mesh agent: joins a controller-managed overlay network and keeps the
/// local WireGuard interface converged with the rest of the mesh.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Opts {
    /// Base URL of the controller, e.g. https://mesh.example.com
    #[arg(long)]
    controller_url: url::Url,

    /// Directory for persisted keys and cached tokens.
    #[arg(long, default_value = "/var/lib/fabric-agent")]
    state_dir: PathBuf,

    /// Name of the tunnel interface to manage.
    #[arg(long, default_value = "fabric0")]
    interface: String,

    /// Request a specific tunnel IP from the controller's IPAM.
    #[arg(long)]
    request_ip: Option<IpAddr>,

    /// Override local endpoint discovery with an explicit address.
    #[arg(long)]
    local_endpoint_ip: Option<IpAddr>,

    /// Additional CIDRs this node advertises beyond its tunnel address.
    #[arg(long)]
    child_prefix: Vec<IpNet>,

    /// Disable STUN-based reflexive address discovery.
    #[arg(long)]
    no_stun: bool,

    /// STUN servers to probe, in `host:port` form. At least two are
    /// required for NAT classification.
    #[arg(long, default_value = "stun.l.google.com:19302,stun1.l.google.com:19302")]
    stun_servers: String,

    /// Register this node as the organization's relay.
    #[arg(long)]
    relay: bool,

    /// Assume a symmetric NAT without probing (forces relay-only mode).
    #[arg(long)]
    relay_only: bool,

    /// Skip TLS certificate verification against the controller (testing only).
    #[arg(long)]
    insecure_skip_tls_verify: bool,

    /// Run the userspace WireGuard backend instead of the kernel module.
    #[arg(long)]
    userspace_mode: bool,

    /// Organization to join; if omitted, the sole organization the
    /// authenticated user belongs to is used.
    #[arg(long)]
    org_id: Option<String>,

    /// Local WireGuard listen port. 0 selects a free port automatically.
    #[arg(long, default_value_t = 0)]
    listen_port: u16,

    /// Path to the control socket.
    #[arg(long, default_value = "/run/fabric-agent.sock")]
    control_socket: PathBuf,

    /// Bearer token for the controller, bypassing the OIDC device flow.
    /// In production this is acquired by the external token collaborator
    /// and cached at `<state_dir>/apitoken.json`.
    #[arg(long, env = "FABRIC_AGENT_TOKEN")]
    token: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pretty_env_logger::init();
    let args = Opts::parse();

    if args.controller_url.scheme() != "https" {
        anyhow::bail!("controller_url must use https");
    }

    let status = SharedStatus::default();
    status.set(AgentState::Starting, "initializing").await;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            cancel.cancel();
        });
    }

    fabric_shared::ensure_dirs_exist(&[&args.state_dir])?;
    let keys = InterfaceKeys::load_or_generate(&args.state_dir)?;
    let token = resolve_token(&args)?;

    let interface: InterfaceName = args
        .interface
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid interface name: {e}"))?;

    let controller = Arc::new(ControllerClient::new(
        args.controller_url.clone(),
        token,
        args.insecure_skip_tls_verify,
    ));

    status.set(AgentState::WaitingForAuth, "authenticating").await;
    let user = controller.get_user_me().await?;
    log::info!("authenticated as {}", user.username);

    let orgs = controller.list_organizations().await?;
    let org = match &args.org_id {
        Some(id) => orgs
            .into_iter()
            .find(|o| &o.id == id)
            .ok_or_else(|| anyhow::anyhow!("organization {id} not found for this user"))?,
        None => {
            if orgs.len() != 1 {
                anyhow::bail!(
                    "--org-id is required when the user belongs to more than one organization"
                );
            }
            orgs.into_iter().next().expect("checked len == 1 above")
        },
    };
    let org_id = org.id.clone();

    let actual_listen_port = if args.listen_port == 0 {
        fabric_shared::WG_LISTEN_PORT_DEFAULT
    } else {
        args.listen_port
    };

    let stun_servers: Vec<String> = args
        .stun_servers
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    let registry = stun::ServerRegistry::new(stun_servers);

    let (mut nat_kind, mut reflexive) = if args.relay_only || args.no_stun || registry.len() < 2 {
        (NatKind::Symmetric, None)
    } else {
        match nat::classify(&registry, actual_listen_port).await {
            Ok(classification) => (classification.kind, Some(classification.reflexive)),
            Err(e) => {
                log::warn!("NAT classification failed, assuming symmetric: {e}");
                (NatKind::Symmetric, None)
            },
        }
    };
    log::info!("local NAT classified as {nat_kind:?}");

    let local_ip = endpoint_discovery::discover(DiscoveryInputs {
        user_supplied: args.local_endpoint_ip,
        stun_enabled: !args.no_stun,
        nat_kind: Some(nat_kind),
        stun_reflexive: reflexive.map(|addr| addr.ip()),
        controller_host: args.controller_url.host_str().unwrap_or(""),
    })?;

    let mut local_device = build_local_device(
        &keys,
        &org_id,
        local_ip,
        actual_listen_port,
        reflexive,
        registry.nth(0),
        &args,
        nat_kind,
    );
    controller.create_device(&local_device).await?;

    let backend = Adaptor::resolve_backend(&interface, args.userspace_mode);
    let mut adaptor = Adaptor::new(interface.clone(), backend, false);

    let local_config = WgLocalConfig {
        private_key: keys.private_key.clone(),
        listen_port: if args.listen_port == 0 {
            None
        } else {
            Some(args.listen_port)
        },
    };

    let informer = Informer::new();
    let mut reconciler = Reconciler::new(keys.public_key.clone(), args.relay, nat_kind);
    if let Some(addr) = reflexive {
        reconciler.set_local_reflexive(addr.ip());
    }
    reconciler.set_org_cidrs(org_cidrs(&org));

    {
        let control_socket = args.control_socket.clone();
        let status = status.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            control_socket::serve(control_socket, status, cancel).await;
        });
    }

    {
        let informer = informer.clone();
        let controller = Arc::clone(&controller);
        let org_id = org_id.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            run_informer_loop(informer, controller, org_id, cancel).await;
        });
    }

    status.set(AgentState::Running, "converging").await;

    let mut poll_ticker = tokio::time::interval(fabric_shared::CONTROLLER_POLL_INTERVAL);
    let mut security_group_ticker =
        tokio::time::interval(fabric_shared::SECURITY_GROUP_SYNC_INTERVAL);
    let mut stun_rebind_ticker = tokio::time::interval(fabric_shared::STUN_REBIND_INTERVAL);
    let mut security_groups = security_group::SecurityGroupState::new();

    // Relay-singleton check (§4.H) only gates startup: scan the first
    // informer snapshot once, before this node's own relay registration can
    // show up in later snapshots and fatally trip the check on every wake.
    if args.relay {
        let (first_snapshot, _) = informer.execute().await;
        if let Err(e) = relay::check_no_other_relay(&first_snapshot, &keys.public_key) {
            log::error!("fatal: {e}");
            status.set(AgentState::Unknown, e.to_string()).await;
            anyhow::bail!(e);
        }
    }

    loop {
        let mut do_security_sync = false;
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = informer.changed() => {},
            _ = poll_ticker.tick() => {},
            _ = security_group_ticker.tick() => { do_security_sync = true; },
            _ = stun_rebind_ticker.tick() => {
                if !(args.relay_only || args.no_stun) && registry.len() >= 2 {
                    match nat::classify(&registry, actual_listen_port).await {
                        Ok(classification) => {
                            let rebound = Some(classification.reflexive) != reflexive
                                || classification.kind != nat_kind;
                            if rebound {
                                log::info!(
                                    "STUN rebind detected: reflexive {:?} -> {}, nat {:?} -> {:?}",
                                    reflexive, classification.reflexive, nat_kind, classification.kind
                                );
                                reflexive = Some(classification.reflexive);
                                nat_kind = classification.kind;
                                reconciler.set_local_reflexive(classification.reflexive.ip());
                                reconciler.set_local_nat(nat_kind);
                                local_device = build_local_device(
                                    &keys,
                                    &org_id,
                                    local_ip,
                                    actual_listen_port,
                                    reflexive,
                                    registry.nth(0),
                                    &args,
                                    nat_kind,
                                );
                                if let Err(e) =
                                    controller.update_device(&keys.public_key, &local_device).await
                                {
                                    log::warn!("failed to republish rebound endpoint to controller: {e}");
                                }
                            }
                        },
                        Err(e) => log::warn!("STUN rebind probe failed: {e}"),
                    }
                }
            },
        }

        if cancel.is_cancelled() {
            break;
        }

        let (snapshot, informer_error) = informer.execute().await;
        if let Some(err) = informer_error {
            if matches!(err, AgentError::AuthExpired) {
                // §4.F step 1: reinitialize with retained credentials if a
                // durable username/password is available; this agent only
                // carries a bearer token (see DESIGN.md), so there is no
                // retained credential to reauthenticate with and the error
                // surfaces fatal.
                log::error!(
                    "fatal: controller authentication expired and no durable credential source \
                     is configured to reauthenticate"
                );
                status.set(AgentState::Unknown, "authentication expired").await;
                anyhow::bail!(err);
            }
            log::warn!("informer reported a transient error: {err}");
        }

        if do_security_sync {
            if let Err(e) = sync_security_group(
                controller.as_ref(),
                &org_id,
                &interface,
                &keys.public_key,
                &snapshot,
                &mut security_groups,
                args.userspace_mode,
            )
            .await
            {
                log::warn!("security group sync failed: {e}");
            }
        }

        let liveness: LivenessMap = adaptor.dump_peers().unwrap_or_default();
        let outcome = reconciler.tick(&snapshot, &liveness);

        if outcome.peer_updates.is_empty() && outcome.peer_deletes.is_empty() {
            continue;
        }

        let tunnel_addr = match tunnel_address(&args, &snapshot, &keys.public_key) {
            Some(addr) => addr,
            None => continue,
        };

        match adaptor.apply(
            &local_config,
            tunnel_addr,
            &outcome.peer_updates,
            &outcome.peer_deletes,
        ) {
            Ok(()) => {
                status
                    .set(AgentState::Running, format!("{} peers", outcome.peer_updates.len()))
                    .await;
            },
            Err(e) => {
                log::warn!("failed to apply data plane update: {e}");
                if e.forces_rebuild() {
                    reconciler.force_rebuild();
                }
            },
        }
    }

    let _ = adaptor.teardown();
    Ok(())
}

fn resolve_token(args: &Opts) -> anyhow::Result<String> {
    if let Some(token) = &args.token {
        return Ok(token.clone());
    }
    if let Some(cached) = ApiToken::load(&args.state_dir)? {
        return Ok(cached.access_token);
    }
    anyhow::bail!(
        "no token available: pass --token, set FABRIC_AGENT_TOKEN, or populate {}/apitoken.json \
         via the external authentication flow",
        args.state_dir.display()
    )
}

/// The organization supernet CIDRs (§3: "a relay peer's `allowed_ips` equals
/// the organization supernet CIDRs"), fetched once from `list_organizations`
/// rather than re-derived from a relay device's own advertised `allowed_ips`.
fn org_cidrs(org: &Organization) -> Vec<IpNet> {
    let mut cidrs = vec![org.cidr_v4];
    if let Some(v6) = org.cidr_v6 {
        cidrs.push(v6);
    }
    cidrs
}

#[allow(clippy::too_many_arguments)]
fn build_local_device(
    keys: &InterfaceKeys,
    org_id: &str,
    local_ip: IpAddr,
    listen_port: u16,
    reflexive: Option<SocketAddr>,
    reflexive_server: Option<&str>,
    args: &Opts,
    nat_kind: NatKind,
) -> Device {
    let mut endpoints = vec![DeviceEndpoint {
        source: EndpointSource::Local,
        address: Endpoint::from(SocketAddr::new(local_ip, listen_port)),
        distance: 0,
    }];
    if let (Some(addr), Some(server)) = (reflexive, reflexive_server) {
        endpoints.push(DeviceEndpoint {
            source: EndpointSource::Stun(server.to_string()),
            address: Endpoint::from(addr),
            distance: 1,
        });
    }

    let allowed_ips = args
        .request_ip
        .map(|ip| vec![IpNet::new(ip, if ip.is_ipv4() { 32 } else { 128 }).expect("valid host prefix")])
        .unwrap_or_default();

    Device {
        id: keys.public_key.clone(),
        public_key: keys.public_key.clone(),
        hostname: hostname(),
        tunnel_ip_v4: args.request_ip.and_then(|ip| match ip {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        }),
        tunnel_ip_v6: args.request_ip.and_then(|ip| match ip {
            IpAddr::V6(v6) => Some(v6),
            IpAddr::V4(_) => None,
        }),
        allowed_ips,
        child_prefix: args.child_prefix.clone(),
        endpoints,
        endpoint_local_address_ip4: match local_ip {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        },
        relay: args.relay,
        symmetric_nat: nat_kind == NatKind::Symmetric,
        security_group_id: None,
        organization_id: org_id.to_string(),
        revision: 0,
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

fn tunnel_address(
    args: &Opts,
    snapshot: &HashMap<String, Device>,
    local_public_key: &str,
) -> Option<IpNet> {
    if let Some(ip) = args.request_ip {
        return IpNet::new(ip, if ip.is_ipv4() { 32 } else { 128 }).ok();
    }
    snapshot
        .get(local_public_key)
        .and_then(|d| d.tunnel_ip_v4)
        .and_then(|ip| IpNet::new(ip.into(), 32).ok())
}

async fn run_informer_loop(
    informer: Informer,
    controller: Arc<ControllerClient>,
    org_id: String,
    cancel: CancellationToken,
) {
    let mut gt_revision = 0;
    let mut backoff = Duration::from_secs(1);

    loop {
        if cancel.is_cancelled() {
            return;
        }
        match informer.run_once(controller.as_ref(), &org_id, gt_revision).await {
            Ok(last_revision) => {
                gt_revision = last_revision;
                backoff = Duration::from_secs(1);
            },
            Err(e) => {
                log::debug!("informer stream error, reconnecting: {e}");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(Duration::from_secs(30));
            },
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn sync_security_group(
    controller: &ControllerClient,
    org_id: &str,
    interface: &InterfaceName,
    local_public_key: &str,
    snapshot: &HashMap<String, Device>,
    state: &mut security_group::SecurityGroupState,
    userspace_mode: bool,
) -> Result<(), AgentError> {
    let security_group_id = snapshot
        .get(local_public_key)
        .and_then(|d| d.security_group_id.clone());

    if !state.needs_sync(security_group_id.as_deref()) {
        return Ok(());
    }

    let group = match &security_group_id {
        Some(id) => controller.get_security_group(org_id, id).await?,
        None => None,
    };
    state.apply(interface, group.as_ref(), userspace_mode)
}
