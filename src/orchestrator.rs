//! Flash driver orchestrator (design §4.3): builds per-target protocol
//! instances over a shared dispatcher, activates routing hop-by-hop, and keeps
//! routed sessions alive with periodic `tester_present` polling.

use crate::config::{ResetWaitKind, SystemDefinition};
use crate::dispatcher::{CanDispatcher, CanFrame, CanTransport, IpDispatcher};
use crate::error::{Error, Result};
use crate::opensyde::OpenSydeClient;
use crate::stw::StwClient;
use crate::types::RoutingRoute;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// The reset-ID a legacy-routing dispatcher listens for on its tunneled
/// channel (design §4.3: "filtering is constrained to the reset-ID `0x52`").
const LEGACY_RESET_ID: u32 = 0x52;

/// Minimum poll period for `tester_present` keepalives (design §4.3: "bounded
/// below the smallest session-timeout in the path, default poll: 1s").
const DEFAULT_TESTER_PRESENT_PERIOD: Duration = Duration::from_secs(1);

/// Per-target protocol instance the orchestrator dispatches service calls
/// through, hiding whether the target speaks openSYDE or STW (design §4.3).
pub enum TargetProtocol {
    OpenSyde(OpenSydeClient),
    Stw(StwClient),
}

/// Tunnels raw CAN frames over the last openSYDE hop's single-frame tunneling
/// service, for an STW target reached through an openSYDE gateway (design
/// §4.3 "legacy-routing dispatcher"). Only the reset-ID `0x52` is recognized on
/// the return channel; anything else is dropped.
pub struct LegacyRoutingDispatcher {
    gateway: Arc<Mutex<OpenSydeClient>>,
    inbox: Mutex<VecDeque<CanFrame>>,
}

impl LegacyRoutingDispatcher {
    pub fn new(gateway: Arc<Mutex<OpenSydeClient>>) -> Self {
        Self {
            gateway,
            inbox: Mutex::new(VecDeque::new()),
        }
    }
}

impl CanTransport for LegacyRoutingDispatcher {
    fn send_frame(&self, frame: &CanFrame) -> Result<()> {
        let gateway = self.gateway.lock().unwrap();
        let response = gateway.tunnel_can_frame(frame.id, frame.payload())?;
        if !response.is_empty() {
            self.inbox.lock().unwrap().push_back(CanFrame::new(LEGACY_RESET_ID, false, &response));
        }
        Ok(())
    }

    fn try_recv_frame(&self) -> Result<Option<CanFrame>> {
        Ok(self.inbox.lock().unwrap().pop_front())
    }
}

/// Initializes once per system (design §4.3). Owns the shared dispatcher(s),
/// the per-target protocol instances, their routes, and any installed
/// legacy-routing dispatchers.
pub struct Orchestrator {
    can: Option<Arc<CanDispatcher>>,
    ip: Option<Arc<IpDispatcher>>,
    targets: HashMap<String, TargetProtocol>,
    routes: HashMap<String, RoutingRoute>,
    legacy_routing: HashMap<String, Arc<LegacyRoutingDispatcher>>,
    last_tester_present: Mutex<Instant>,
}

impl Orchestrator {
    pub fn new(can: Option<Arc<CanDispatcher>>, ip: Option<Arc<IpDispatcher>>) -> Self {
        Self {
            can,
            ip,
            targets: HashMap::new(),
            routes: HashMap::new(),
            legacy_routing: HashMap::new(),
            last_tester_present: Mutex::new(Instant::now()),
        }
    }

    pub fn can_dispatcher(&self) -> Option<&Arc<CanDispatcher>> {
        self.can.as_ref()
    }

    pub fn ip_dispatcher(&self) -> Option<&Arc<IpDispatcher>> {
        self.ip.as_ref()
    }

    pub fn register_target(&mut self, server_id: impl Into<String>, protocol: TargetProtocol, route: RoutingRoute) {
        let server_id = server_id.into();
        self.routes.insert(server_id.clone(), route);
        self.targets.insert(server_id, protocol);
    }

    pub fn route_for(&self, server_id: &str) -> Option<&RoutingRoute> {
        self.routes.get(server_id)
    }

    pub fn target(&self, server_id: &str) -> Result<&TargetProtocol> {
        self.targets
            .get(server_id)
            .ok_or_else(|| Error::Config(format!("unknown target '{}'", server_id)))
    }

    pub fn target_mut(&mut self, server_id: &str) -> Result<&mut TargetProtocol> {
        self.targets
            .get_mut(server_id)
            .ok_or_else(|| Error::Config(format!("unknown target '{}'", server_id)))
    }

    /// Activates routing hop-by-hop for `server_id` (design §4.3). For each
    /// point on the route, installs a `LegacyRoutingDispatcher` for an STW
    /// target whose last hop is an openSYDE gateway, and issues
    /// `routing_activation` on every openSYDE hop along the way.
    pub fn activate_route(&mut self, server_id: &str, gateway: Option<Arc<Mutex<OpenSydeClient>>>) -> Result<()> {
        let route = self
            .routes
            .get(server_id)
            .ok_or_else(|| Error::Config(format!("unknown target '{}'", server_id)))?
            .clone();

        if route.is_direct() {
            return Ok(());
        }

        for point in route.points() {
            if let Some(gateway) = &gateway {
                let client = gateway.lock().unwrap();
                client.routing_activation(point.out_interface)?;
            }
        }

        if let (Some(gateway), TargetProtocol::Stw(_)) = (&gateway, self.target(server_id)?) {
            self.legacy_routing
                .insert(server_id.to_string(), Arc::new(LegacyRoutingDispatcher::new(gateway.clone())));
        }

        Ok(())
    }

    pub fn teardown_route(&mut self, server_id: &str) {
        self.legacy_routing.remove(server_id);
    }

    /// Sends `tester_present` to every openSYDE target if at least
    /// `period` has elapsed since the last poll (design §4.3: "periodically
    /// invokes `tester_present` on every router in the route").
    pub fn poll_keepalive(&self, period: Option<Duration>) -> Result<()> {
        let period = period.unwrap_or(DEFAULT_TESTER_PRESENT_PERIOD);
        let mut last = self.last_tester_present.lock().unwrap();
        if last.elapsed() < period {
            return Ok(());
        }
        for target in self.targets.values() {
            if let TargetProtocol::OpenSyde(client) = target {
                client.tester_present()?;
            }
        }
        *last = Instant::now();
        Ok(())
    }

    /// Minimum flashloader-reset wait time across the active target set
    /// (design §4.3): the maximum of each node's configured value, with a
    /// 500 ms floor.
    pub fn min_flashloader_reset_wait_time(system_definition: &SystemDefinition, over_ethernet: bool, has_com_changes: bool) -> Duration {
        let kind = match (has_com_changes, over_ethernet) {
            (false, false) => ResetWaitKind::NoChangesCan,
            (false, true) => ResetWaitKind::NoChangesEthernet,
            (true, false) => ResetWaitKind::FundamentalComChangesCan,
            (true, true) => ResetWaitKind::FundamentalComChangesEthernet,
        };
        Duration::from_millis(system_definition.reset_wait_time_ms(kind).max(500) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SystemDefinition;
    use crate::opensyde::{ServiceResponse, Tp};
    use crate::types::NodeAddress;

    struct NoopTp;

    impl Tp for NoopTp {
        fn set_client_id(&mut self, _client: NodeAddress) {}
        fn set_server_id(&mut self, _server: NodeAddress) {}
        fn send_request(&self, _payload: &[u8]) -> Result<()> {
            Ok(())
        }
        fn recv_response(&self, _expected_sid: u8, _timeout: Duration) -> Result<ServiceResponse> {
            Ok(ServiceResponse::Positive(Vec::new()))
        }
    }

    fn sample_system_definition() -> SystemDefinition {
        SystemDefinition::parse(
            r#"
                flashloader_reset_wait_times = [200, 300, 1000, 1100, 2000, 2100]

                [[node]]
                name = "ECU1"
                flashloader = "OPEN_SYDE"
            "#,
        )
        .unwrap()
    }

    #[test]
    fn reset_wait_time_has_a_500ms_floor() {
        let sysdef = sample_system_definition();
        let wait = Orchestrator::min_flashloader_reset_wait_time(&sysdef, false, false);
        assert_eq!(wait, Duration::from_millis(500));
    }

    #[test]
    fn reset_wait_time_uses_configured_value_above_floor() {
        let sysdef = sample_system_definition();
        let wait = Orchestrator::min_flashloader_reset_wait_time(&sysdef, true, true);
        assert_eq!(wait, Duration::from_millis(2100));
    }

    #[test]
    fn direct_route_activation_is_a_no_op() {
        let mut orchestrator = Orchestrator::new(None, None);
        orchestrator.routes.insert("n1".into(), RoutingRoute::direct());
        orchestrator.targets.insert(
            "n1".into(),
            TargetProtocol::OpenSyde(OpenSydeClient::new(Box::new(NoopTp))),
        );
        assert!(orchestrator.activate_route("n1", None).is_ok());
    }
}
