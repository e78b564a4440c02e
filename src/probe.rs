//! Probe dispatch: the [`ProbeExecutor`] contract the controller talks to,
//! and a UDP implementation that fans one ECS-annotated query per vantage
//! point out to the authoritative and collects the parsed answers
//! asynchronously.
use std::fs;
use std::sync::mpsc;
use std::time::Duration;

use log::debug;
use serde::Deserialize;
use tokio::net::UdpSocket;
use tokio::runtime::Runtime;
use tokio::time::timeout;

use crate::error::{ECSError, ECSResult};
use crate::scan::{InstResponse, QueryRequest, VantagePoint};
use crate::wire::{self, EcsOption, QType, MAX_DNS_PACKET_SIZE};

/// How long a single probe waits for the authoritative to answer.
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Contract between the controller and the probe dispatch service.
pub trait ProbeExecutor {
    /// Select a subset of the available vantage points by name. Fails when a
    /// configured VP is not currently available.
    fn add_vantage_points(&mut self, names: &[String]) -> ECSResult<()>;

    /// Number of active vantage points.
    fn num_vps(&self) -> usize;

    /// The active vantage points, in selection order.
    fn vantage_points(&self) -> &[VantagePoint];

    /// Enqueue one ECS-annotated query per active VP, tagged with the
    /// request's domain identifier. Non-blocking; no ordering guarantee
    /// across dispatches.
    fn dispatch(&mut self, request: &QueryRequest) -> ECSResult<()>;

    /// Drain ready per-VP responses, waiting at most `timeout` for the first
    /// one. May return fewer than `num_vps` entries per dispatch.
    fn poll(&mut self, timeout: Duration) -> Vec<InstResponse>;

    /// Fatal executor errors; any entry terminates the run.
    fn poll_exceptions(&mut self) -> Vec<String>;
}

/// The vantage-point inventory behind the `--mux` argument: the recursive
/// resolver used by the NS pre-phase and the vantage points available for
/// probing.
#[derive(Debug, Deserialize)]
pub struct MuxInventory {
    #[serde(default)]
    pub resolver: Option<String>,
    pub vantage_points: Vec<VantagePoint>,
}

impl MuxInventory {
    pub fn load(path: &str) -> ECSResult<MuxInventory> {
        let text = fs::read_to_string(path).map_err(|e| {
            ECSError::Config(format!("the mux inventory '{}' was not found: {}", path, e))
        })?;
        let inventory: MuxInventory = serde_yaml::from_str(&text)?;
        Ok(inventory)
    }
}

/// Dispatches probes itself over UDP, one logical instance per selected
/// vantage point. Queries run on an owned tokio runtime; completed
/// [`InstResponse`]s come back over a channel drained by [`Self::poll`].
pub struct UdpProbeExecutor {
    runtime: Runtime,
    available: Vec<VantagePoint>,
    selected: Vec<VantagePoint>,
    resolver: Option<String>,
    response_tx: mpsc::Sender<InstResponse>,
    response_rx: mpsc::Receiver<InstResponse>,
    exception_tx: mpsc::Sender<String>,
    exception_rx: mpsc::Receiver<String>,
}

impl UdpProbeExecutor {
    /// Open the inventory the `--mux` argument points at.
    pub fn open(mux: &str) -> ECSResult<UdpProbeExecutor> {
        let inventory = MuxInventory::load(mux)?;
        let runtime = Runtime::new()?;
        let (response_tx, response_rx) = mpsc::channel();
        let (exception_tx, exception_rx) = mpsc::channel();

        Ok(UdpProbeExecutor {
            runtime,
            available: inventory.vantage_points,
            selected: Vec::new(),
            resolver: inventory.resolver,
            response_tx,
            response_rx,
            exception_tx,
            exception_rx,
        })
    }

    /// Recursive resolver address from the inventory, if any.
    pub fn resolver(&self) -> Option<&str> {
        self.resolver.as_deref()
    }
}

impl ProbeExecutor for UdpProbeExecutor {
    fn add_vantage_points(&mut self, names: &[String]) -> ECSResult<()> {
        for name in names {
            match self.available.iter().find(|vp| &vp.shortname == name) {
                Some(vp) => {
                    debug!("adding VP {} to the executor", vp.shortname);
                    self.selected.push(vp.clone());
                }
                None => {
                    return Err(ECSError::Config(format!(
                        "configured VP '{}' is not active",
                        name
                    )))
                }
            }
        }
        Ok(())
    }

    fn num_vps(&self) -> usize {
        self.selected.len()
    }

    fn vantage_points(&self) -> &[VantagePoint] {
        &self.selected
    }

    fn dispatch(&mut self, request: &QueryRequest) -> ECSResult<()> {
        for vp in &self.selected {
            let request = request.clone();
            let vp_name = vp.shortname.clone();
            let response_tx = self.response_tx.clone();
            let exception_tx = self.exception_tx.clone();

            self.runtime.spawn(async move {
                let inst = match issue_ecs_query(&request).await {
                    Ok(parsed) => InstResponse::new(
                        request.identifier,
                        &vp_name,
                        parsed.answers.iter().map(|a| a.to_string()).collect(),
                        parsed.cnames,
                        parsed.scope_prefix_length,
                        parsed.nsid,
                        None,
                    ),
                    Err(e) => InstResponse::errored(request.identifier, &vp_name, e.to_string()),
                };
                if response_tx.send(inst).is_err() {
                    let _ = exception_tx.send("response channel closed".to_string());
                }
            });
        }
        Ok(())
    }

    fn poll(&mut self, timeout: Duration) -> Vec<InstResponse> {
        let mut responses = Vec::new();
        if let Ok(first) = self.response_rx.recv_timeout(timeout) {
            responses.push(first);
            while let Ok(next) = self.response_rx.try_recv() {
                responses.push(next);
            }
        }
        responses
    }

    fn poll_exceptions(&mut self) -> Vec<String> {
        let mut exceptions = Vec::new();
        while let Ok(exc) = self.exception_rx.try_recv() {
            exceptions.push(exc);
        }
        exceptions
    }
}

/// One probe: build the ECS query, fire it at the authoritative, wait for the
/// matching answer.
async fn issue_ecs_query(request: &QueryRequest) -> ECSResult<wire::DNSResponse> {
    let bind_addr = if request.nameserver_ip.is_ipv6() {
        "[::]:0"
    } else {
        "0.0.0.0:0"
    };
    let socket = UdpSocket::bind(bind_addr).await?;

    let id: u16 = rand::random();
    let qtype = if request.family == 2 { QType::AAAA } else { QType::A };
    let ecs = EcsOption {
        family: request.family as u16,
        source_prefix_length: request.source_prefix_length,
        address: request.ip_address_client,
    };
    let query = wire::build_query(id, &request.domain, qtype, false, Some(&ecs), true)?;
    socket.send_to(&query, (request.nameserver_ip, 53)).await?;

    let mut buf = [0u8; MAX_DNS_PACKET_SIZE];
    let (received, _) = timeout(PROBE_TIMEOUT, socket.recv_from(&mut buf))
        .await
        .map_err(|_| ECSError::Transport("timed out waiting for response".to_string()))??;

    let parsed = wire::parse_response(&buf[..received])?;
    if parsed.id != id {
        return Err(ECSError::DNS("response id does not match the query".to_string()));
    }
    Ok(parsed)
}
