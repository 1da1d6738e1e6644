//! The processing graph: owner of all stages, ports, and connections.
//!
//! Topology is only ever mutated from the dispatch loop, so none of the
//! structures here are locked. Stage threads see the graph only through the
//! link queues and compositor layouts handed to them at `Playing`.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use petgraph::algo::{has_path_connecting, toposort};
use petgraph::graph::{DiGraph, NodeIndex};

use livemix_common::error::{LivemixError, LivemixResult};

use crate::format::{Caps, FormatContract, FormatTemplate};
use crate::layout::{shared_layout, Background, Placement, SharedLayout};
use crate::port::{ConnectionId, Direction, Port, PortId, PortState, Presence, StageId};
use crate::processor::{PortBinding, StageConfig};
use crate::provider::CapabilityProvider;
use crate::stage::{CapsRule, OptionValue, Stage, StageKind};

/// Lifecycle state shared by every member of a graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GraphState {
    /// Constructed; no device or socket has been touched.
    Built,
    /// Every mandatory port is connected.
    Ready,
    /// Stage threads are moving data.
    Playing,
    /// Terminal; everything has been released.
    Stopped,
}

impl fmt::Display for GraphState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Built => "Built",
            Self::Ready => "Ready",
            Self::Playing => "Playing",
            Self::Stopped => "Stopped",
        };
        f.write_str(s)
    }
}

/// A directed edge from one output port to one input port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub id: ConnectionId,
    pub upstream: PortId,
    pub downstream: PortId,
    pub contract: FormatContract,
}

/// What teardown released and destroyed, in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    pub released_ports: Vec<String>,
    pub destroyed_stages: Vec<String>,
}

pub struct Graph {
    name: String,
    state: GraphState,
    provider: Arc<dyn CapabilityProvider>,
    stages: Vec<Option<Stage>>,
    ports: Vec<Port>,
    connections: Vec<Option<Connection>>,
    names: HashMap<String, StageId>,
    layouts: HashMap<StageId, SharedLayout>,
    /// Release flags of ports handed out as leases.
    pub(crate) leases: HashMap<PortId, Arc<AtomicBool>>,
    /// Ports whose lease was dropped without an explicit release.
    pub(crate) abandoned: Arc<Mutex<Vec<PortId>>>,
    torn_down: bool,
}

impl fmt::Debug for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Graph")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("stages", &self.stages().count())
            .field("connections", &self.connections().count())
            .finish()
    }
}

fn unknown_stage(id: StageId) -> LivemixError {
    LivemixError::Other(anyhow::anyhow!("{id} is not part of the graph"))
}

impl Graph {
    pub fn new(name: impl Into<String>, provider: Arc<dyn CapabilityProvider>) -> Self {
        Self {
            name: name.into(),
            state: GraphState::Built,
            provider,
            stages: Vec::new(),
            ports: Vec::new(),
            connections: Vec::new(),
            names: HashMap::new(),
            layouts: HashMap::new(),
            leases: HashMap::new(),
            abandoned: Arc::new(Mutex::new(Vec::new())),
            torn_down: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> GraphState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: GraphState) {
        if self.state != state {
            tracing::debug!(graph = %self.name, from = %self.state, to = %state, "State changed");
            self.state = state;
        }
    }

    pub fn provider(&self) -> &Arc<dyn CapabilityProvider> {
        &self.provider
    }

    // ── Lookup ──────────────────────────────────────────────────────────

    pub fn stage(&self, id: StageId) -> Option<&Stage> {
        self.stages.get(id.index()).and_then(Option::as_ref)
    }

    pub fn stage_id(&self, name: &str) -> Option<StageId> {
        self.names.get(name).copied()
    }

    /// Live stages in creation order.
    pub fn stages(&self) -> impl Iterator<Item = &Stage> {
        self.stages.iter().flatten()
    }

    pub fn port(&self, id: PortId) -> Option<&Port> {
        self.ports.get(id.index())
    }

    /// Live ports of a stage.
    pub fn ports_of(&self, stage: StageId) -> Vec<&Port> {
        self.stage(stage)
            .map(|s| {
                s.ports
                    .iter()
                    .filter_map(|p| self.port(*p))
                    .filter(|p| !p.is_released())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn connection(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(id.index()).and_then(Option::as_ref)
    }

    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.connections.iter().flatten()
    }

    /// `stage.port`, for messages.
    pub fn port_label(&self, id: PortId) -> String {
        match self.port(id) {
            Some(port) => {
                let stage = self.stage(port.stage).map_or("?", Stage::name);
                format!("{stage}.{}", port.name)
            }
            None => id.to_string(),
        }
    }

    pub fn layout(&self, compositor: StageId) -> Option<SharedLayout> {
        self.layouts.get(&compositor).cloned()
    }

    fn stage_ref(&self, id: StageId) -> LivemixResult<&Stage> {
        self.stage(id).ok_or_else(|| unknown_stage(id))
    }

    fn port_ref(&self, id: PortId) -> LivemixResult<&Port> {
        self.port(id)
            .ok_or_else(|| LivemixError::invalid_port(format!("{id} does not exist")))
    }

    // ── Mutation guards ─────────────────────────────────────────────────

    /// Topology may change while `Built` or `Ready`; a change in `Ready`
    /// sends the graph back to `Built` for revalidation.
    fn begin_topology_change(&mut self) -> LivemixResult<()> {
        match self.state {
            GraphState::Built => {}
            GraphState::Ready => self.set_state(GraphState::Built),
            GraphState::Playing | GraphState::Stopped => {
                return Err(LivemixError::InvalidTransition {
                    from: self.state.to_string(),
                    to: GraphState::Built.to_string(),
                })
            }
        }
        self.release_abandoned();
        Ok(())
    }

    fn ensure_alive(&self) -> LivemixResult<()> {
        if self.state == GraphState::Stopped {
            return Err(LivemixError::InvalidTransition {
                from: GraphState::Stopped.to_string(),
                to: GraphState::Stopped.to_string(),
            });
        }
        Ok(())
    }

    /// Release ports whose lease was dropped unreleased.
    pub(crate) fn release_abandoned(&mut self) {
        let abandoned: Vec<PortId> = std::mem::take(&mut *self.abandoned.lock());
        for port in abandoned {
            if self.port(port).is_some_and(|p| !p.is_released()) {
                tracing::warn!(port = %self.port_label(port), "Releasing leaked on-demand port");
                self.release_port_unchecked(port);
            }
        }
    }

    // ── Stages ──────────────────────────────────────────────────────────

    /// Create a stage of `kind` and add it to the graph with its always-ports.
    pub fn add_stage<'a>(
        &mut self,
        kind: StageKind,
        name: &str,
        options: impl IntoIterator<Item = (&'a str, OptionValue)>,
    ) -> LivemixResult<StageId> {
        self.begin_topology_change()?;
        if self.names.contains_key(name) {
            return Err(LivemixError::DuplicateStage {
                name: name.to_string(),
            });
        }
        let mut stage = Stage::create(self.provider.as_ref(), kind, name, options)?;
        let id = StageId(self.stages.len() as u32);
        stage.id = id;

        let templates: Vec<_> = stage.descriptor.always_templates().cloned().collect();
        for template in templates {
            let port = self.new_port(id, template.name.to_string(), &template);
            stage.ports.push(port);
        }

        if kind == StageKind::Compositor {
            let background = stage
                .option("background")
                .and_then(OptionValue::as_str)
                .and_then(|s| s.parse::<Background>().ok())
                .unwrap_or_default();
            self.layouts.insert(id, shared_layout(background));
        }

        tracing::debug!(stage = %name, %kind, "Stage added");
        self.names.insert(name.to_string(), id);
        self.stages.push(Some(stage));
        Ok(id)
    }

    fn new_port(
        &mut self,
        stage: StageId,
        name: String,
        template: &crate::stage::PortTemplate,
    ) -> PortId {
        let id = PortId(self.ports.len() as u32);
        self.ports.push(Port {
            id,
            stage,
            name,
            direction: template.direction,
            presence: template.presence,
            caps: template.caps.clone(),
            mandatory: template.mandatory,
            state: PortState::Unconnected,
            contract: None,
        });
        id
    }

    /// Validate and set a stage option. The compositor background also
    /// updates the live layout, so it applies while playing.
    pub fn set_option(
        &mut self,
        stage: StageId,
        key: &str,
        value: impl Into<OptionValue>,
    ) -> LivemixResult<()> {
        self.ensure_alive()?;
        let stage_ref = self
            .stages
            .get_mut(stage.index())
            .and_then(Option::as_mut)
            .ok_or_else(|| unknown_stage(stage))?;
        stage_ref.set_option(key, value)?;
        if key == "background" {
            if let (Some(layout), Some(value)) = (
                self.layouts.get(&stage),
                stage_ref.option(key).and_then(OptionValue::as_str),
            ) {
                if let Ok(background) = value.parse::<Background>() {
                    layout.write().set_background(background);
                }
            }
        }
        Ok(())
    }

    pub fn set_background(&mut self, compositor: StageId, background: Background) -> LivemixResult<()> {
        self.set_option(compositor, "background", background.as_str())
    }

    /// Remove a stage, detaching its connections and releasing its ports.
    ///
    /// Fails with `StageInUse` while playing if any of its mandatory ports
    /// is connected.
    pub fn remove_stage(&mut self, id: StageId) -> LivemixResult<()> {
        let stage = self.stage_ref(id)?;
        if self.state == GraphState::Playing {
            if let Some(port) = stage
                .ports
                .iter()
                .filter_map(|p| self.port(*p))
                .find(|p| p.mandatory && p.is_connected())
            {
                return Err(LivemixError::StageInUse {
                    stage: stage.name.clone(),
                    message: format!("mandatory port '{}' is connected while playing", port.name),
                });
            }
        } else {
            self.begin_topology_change()?;
        }
        self.destroy_stage(id);
        Ok(())
    }

    /// Unconditionally detach and drop a stage. Returns its name.
    fn destroy_stage(&mut self, id: StageId) -> Option<String> {
        let ports = self.stage(id)?.ports.clone();
        for port in ports {
            self.disconnect_port(port);
            if self.port(port).is_some_and(|p| p.presence == Presence::Request && !p.is_released()) {
                self.release_port_unchecked(port);
            }
        }
        self.layouts.remove(&id);
        let stage = self.stages.get_mut(id.index())?.take()?;
        self.names.remove(&stage.name);
        tracing::debug!(stage = %stage.name, "Stage destroyed");
        Some(stage.name)
    }

    // ── Ports ───────────────────────────────────────────────────────────

    /// Create an on-demand port from the stage's request template.
    pub fn request_port(&mut self, stage: StageId, direction: Direction) -> LivemixResult<PortId> {
        self.begin_topology_change()?;
        let stage_ref = self.stage_ref(stage)?;
        let template = stage_ref
            .descriptor
            .request_template(direction)
            .cloned()
            .ok_or_else(|| {
                LivemixError::invalid_port(format!(
                    "stage '{}' has no on-demand {direction:?} ports",
                    stage_ref.name
                ))
            })?;
        let counter = stage_ref.request_counter;
        let port = self.new_port(stage, template.port_name(counter), &template);
        if let Some(stage_mut) = self.stages.get_mut(stage.index()).and_then(Option::as_mut) {
            stage_mut.request_counter += 1;
            stage_mut.ports.push(port);
        }
        tracing::debug!(port = %self.port_label(port), "Port requested");
        Ok(port)
    }

    /// Release an on-demand port, detaching it first if connected.
    ///
    /// Fails with `InvalidPort` for always-ports and for ports already
    /// released, and with `InvalidTransition` while playing: running stages
    /// keep their queues until teardown.
    pub fn release_port(&mut self, port: PortId) -> LivemixResult<()> {
        self.ensure_alive()?;
        let port_ref = self.port_ref(port)?;
        if port_ref.presence != Presence::Request {
            return Err(LivemixError::invalid_port(format!(
                "{} is not an on-demand port",
                self.port_label(port)
            )));
        }
        if port_ref.is_released() {
            return Err(LivemixError::invalid_port(format!(
                "{} was already released",
                self.port_label(port)
            )));
        }
        match self.state {
            GraphState::Playing => {
                return Err(LivemixError::InvalidTransition {
                    from: GraphState::Playing.to_string(),
                    to: GraphState::Built.to_string(),
                })
            }
            GraphState::Ready => self.set_state(GraphState::Built),
            GraphState::Built | GraphState::Stopped => {}
        }
        self.release_port_unchecked(port);
        Ok(())
    }

    pub(crate) fn release_port_unchecked(&mut self, port: PortId) {
        self.disconnect_port(port);
        let stage = match self.ports.get_mut(port.index()) {
            Some(p) => {
                p.state = PortState::Released;
                p.stage
            }
            None => return,
        };
        if let Some(layout) = self.layouts.get(&stage) {
            layout.write().forget_input(port);
        }
        if let Some(flag) = self.leases.remove(&port) {
            flag.store(true, Ordering::SeqCst);
        }
        tracing::debug!(port = %self.port_label(port), "Port released");
    }

    /// First unconnected always-port, or a freshly requested one.
    /// The flag tells whether the port was requested.
    fn free_port(&mut self, stage: StageId, direction: Direction) -> LivemixResult<(PortId, bool)> {
        let stage_ref = self.stage_ref(stage)?;
        let free = stage_ref.ports.iter().copied().find(|p| {
            self.port(*p).is_some_and(|p| {
                p.direction == direction && p.presence == Presence::Always && !p.is_connected()
            })
        });
        if let Some(port) = free {
            return Ok((port, false));
        }
        if stage_ref.descriptor.request_template(direction).is_some() {
            return Ok((self.request_port(stage, direction)?, true));
        }
        Err(LivemixError::invalid_port(format!(
            "stage '{}' has no free {} port",
            stage_ref.name,
            match direction {
                Direction::Input => "input",
                Direction::Output => "output",
            }
        )))
    }

    // ── Negotiation ─────────────────────────────────────────────────────

    /// What `port` can carry right now, given the contracts already
    /// negotiated on its stage.
    pub fn caps_of(&self, port: PortId) -> LivemixResult<Caps> {
        let port_ref = self.port_ref(port)?;
        let stage = self.stage_ref(port_ref.stage)?;
        let template = port_ref.caps.clone();
        let rule = stage.descriptor.caps_rule;
        let opposite = self.connected_contracts(stage, port_ref.direction.opposite());

        let caps = match (rule, port_ref.direction, opposite.first()) {
            (CapsRule::Passthrough, _, Some(c)) => template.intersect(&Caps::fixed(c)),
            (CapsRule::Geometry, Direction::Output, Some(c)) => {
                template.map(|t| t.intersect(&geometry_of(t, c.width, c.height, Some(*c))))
            }
            (CapsRule::Canvas, Direction::Output, first) => {
                let width = option_dimension(stage, "width");
                let height = option_dimension(stage, "height");
                template.map(|t| {
                    let mut g = FormatTemplate::new(t.encodings.clone());
                    g.width = width;
                    g.height = height;
                    g.framerate = first.map(|c| c.framerate);
                    t.intersect(&g)
                })
            }
            _ => template,
        };

        // Compositor inputs must all carry the same contract.
        if rule == CapsRule::Canvas && port_ref.direction == Direction::Input {
            let sibling = stage
                .ports
                .iter()
                .filter(|p| **p != port)
                .filter_map(|p| self.port(*p))
                .filter(|p| p.direction == Direction::Input)
                .find_map(|p| p.contract);
            if let Some(c) = sibling {
                return Ok(caps.intersect(&Caps::fixed(&c)));
            }
        }
        Ok(caps)
    }

    /// Contracts on a stage's connected ports of one direction, in
    /// connection order.
    fn connected_contracts(&self, stage: &Stage, direction: Direction) -> Vec<FormatContract> {
        let mut connected: Vec<(ConnectionId, FormatContract)> = stage
            .ports
            .iter()
            .filter_map(|p| self.port(*p))
            .filter(|p| p.direction == direction)
            .filter_map(|p| Some((p.connection()?, p.contract?)))
            .collect();
        connected.sort_by_key(|(id, _)| *id);
        connected.into_iter().map(|(_, c)| c).collect()
    }

    // ── Links ───────────────────────────────────────────────────────────

    /// Link two ports, picking the first mutually supported contract in the
    /// upstream port's order of preference.
    pub fn link(&mut self, upstream: PortId, downstream: PortId) -> LivemixResult<ConnectionId> {
        self.begin_topology_change()?;
        self.check_endpoints(upstream, downstream)?;
        let up_caps = self.caps_of(upstream)?;
        let down_caps = self.caps_of(downstream)?;
        let contract = up_caps
            .negotiate(&down_caps)
            .ok_or_else(|| LivemixError::NoCommonFormat {
                upstream: self.port_label(upstream),
                downstream: self.port_label(downstream),
            })?;
        Ok(self.connect(upstream, downstream, contract))
    }

    /// Link two ports with exactly `contract`, which both ends must support.
    pub fn link_with_contract(
        &mut self,
        upstream: PortId,
        downstream: PortId,
        contract: FormatContract,
    ) -> LivemixResult<ConnectionId> {
        self.begin_topology_change()?;
        self.check_endpoints(upstream, downstream)?;
        if !self.caps_of(upstream)?.accepts(&contract) || !self.caps_of(downstream)?.accepts(&contract)
        {
            return Err(LivemixError::IncompatibleFormat {
                upstream: self.port_label(upstream),
                downstream: self.port_label(downstream),
                contract: contract.to_string(),
            });
        }
        Ok(self.connect(upstream, downstream, contract))
    }

    /// Link two stages through free ports, requesting ports where the
    /// stage offers them.
    pub fn link_stages(&mut self, upstream: StageId, downstream: StageId) -> LivemixResult<ConnectionId> {
        self.link_stage_ports(upstream, downstream, None)
    }

    pub fn link_stages_with_contract(
        &mut self,
        upstream: StageId,
        downstream: StageId,
        contract: FormatContract,
    ) -> LivemixResult<ConnectionId> {
        self.link_stage_ports(upstream, downstream, Some(contract))
    }

    /// Link a chain of stages in order.
    pub fn link_many(&mut self, chain: &[StageId]) -> LivemixResult<Vec<ConnectionId>> {
        chain
            .windows(2)
            .map(|pair| self.link_stages(pair[0], pair[1]))
            .collect()
    }

    fn link_stage_ports(
        &mut self,
        upstream: StageId,
        downstream: StageId,
        contract: Option<FormatContract>,
    ) -> LivemixResult<ConnectionId> {
        self.begin_topology_change()?;
        let (src, src_requested) = self.free_port(upstream, Direction::Output)?;
        let (sink, sink_requested) = match self.free_port(downstream, Direction::Input) {
            Ok(found) => found,
            Err(e) => {
                if src_requested {
                    self.release_port_unchecked(src);
                }
                return Err(e);
            }
        };
        let result = match contract {
            Some(c) => self.link_with_contract(src, sink, c),
            None => self.link(src, sink),
        };
        if result.is_err() {
            if src_requested {
                self.release_port_unchecked(src);
            }
            if sink_requested {
                self.release_port_unchecked(sink);
            }
        }
        result
    }

    fn check_endpoints(&self, upstream: PortId, downstream: PortId) -> LivemixResult<()> {
        let up = self.port_ref(upstream)?;
        let down = self.port_ref(downstream)?;
        for (port, direction) in [(up, Direction::Output), (down, Direction::Input)] {
            let label = self.port_label(port.id);
            if port.direction != direction {
                return Err(LivemixError::invalid_port(format!(
                    "{label} has the wrong direction for this end of a link"
                )));
            }
            match port.state {
                PortState::Released => {
                    return Err(LivemixError::invalid_port(format!("{label} was released")))
                }
                PortState::Connected(_) => {
                    return Err(LivemixError::invalid_port(format!("{label} is already linked")))
                }
                PortState::Unconnected => {}
            }
        }
        if self.would_cycle(up.stage, down.stage) {
            return Err(LivemixError::LinkCycle {
                upstream: self.port_label(upstream),
                downstream: self.port_label(downstream),
            });
        }
        Ok(())
    }

    fn connect(&mut self, upstream: PortId, downstream: PortId, contract: FormatContract) -> ConnectionId {
        let id = ConnectionId(self.connections.len() as u32);
        self.connections.push(Some(Connection {
            id,
            upstream,
            downstream,
            contract,
        }));
        for port in [upstream, downstream] {
            if let Some(p) = self.ports.get_mut(port.index()) {
                p.state = PortState::Connected(id);
                p.contract = Some(contract);
            }
        }
        if let Some(layout) = self
            .port(downstream)
            .and_then(|p| self.layouts.get(&p.stage))
        {
            layout.write().add_input(downstream);
        }
        tracing::debug!(
            upstream = %self.port_label(upstream),
            downstream = %self.port_label(downstream),
            %contract,
            "Linked"
        );
        id
    }

    /// Remove a connection, leaving both ports unconnected.
    pub fn unlink(&mut self, connection: ConnectionId) -> LivemixResult<()> {
        self.begin_topology_change()?;
        let conn = self
            .connection(connection)
            .cloned()
            .ok_or_else(|| LivemixError::invalid_port(format!("{connection} does not exist")))?;
        self.disconnect_port(conn.upstream);
        Ok(())
    }

    /// Drop the connection on `port`, if any.
    fn disconnect_port(&mut self, port: PortId) {
        let Some(id) = self.port(port).and_then(Port::connection) else {
            return;
        };
        let Some(conn) = self.connections.get_mut(id.index()).and_then(Option::take) else {
            return;
        };
        for end in [conn.upstream, conn.downstream] {
            if let Some(p) = self.ports.get_mut(end.index()) {
                if p.state == PortState::Connected(id) {
                    p.state = PortState::Unconnected;
                    p.contract = None;
                }
            }
        }
        if let Some(layout) = self
            .port(conn.downstream)
            .and_then(|p| self.layouts.get(&p.stage))
        {
            layout.write().remove_input(conn.downstream);
        }
        tracing::debug!(link = %id, "Unlinked");
    }

    // ── Placement ───────────────────────────────────────────────────────

    /// Place a compositor input. Allowed in every state but `Stopped`;
    /// a running compositor picks it up on its next frame.
    pub fn set_placement(&mut self, port: PortId, placement: Placement) -> LivemixResult<()> {
        self.ensure_alive()?;
        let port_ref = self.port_ref(port)?;
        let layout = match (port_ref.direction, self.layouts.get(&port_ref.stage)) {
            (Direction::Input, Some(layout)) if !port_ref.is_released() => layout,
            _ => {
                return Err(LivemixError::invalid_port(format!(
                    "{} is not a compositor input",
                    self.port_label(port)
                )))
            }
        };
        layout.write().set_placement(port, placement);
        tracing::debug!(port = %self.port_label(port), x = placement.x, y = placement.y, "Placement set");
        Ok(())
    }

    pub fn placement(&self, port: PortId) -> Option<Placement> {
        let port_ref = self.port(port)?;
        self.layouts
            .get(&port_ref.stage)
            .map(|layout| layout.read().placement(port))
    }

    // ── Validation and ordering ─────────────────────────────────────────

    /// Labels of mandatory ports (and request-port minimums) left
    /// unconnected.
    pub fn unconnected_mandatory(&self) -> Vec<String> {
        let mut missing = Vec::new();
        for stage in self.stages() {
            for port in stage.ports.iter().filter_map(|p| self.port(*p)) {
                if port.mandatory && !port.is_released() && !port.is_connected() {
                    missing.push(format!("{}.{}", stage.name, port.name));
                }
            }
            for template in stage.descriptor.templates.iter() {
                if template.presence != Presence::Request || template.min_count == 0 {
                    continue;
                }
                let connected = stage
                    .ports
                    .iter()
                    .filter_map(|p| self.port(*p))
                    .filter(|p| {
                        p.presence == Presence::Request
                            && p.direction == template.direction
                            && p.is_connected()
                    })
                    .count();
                if connected < template.min_count {
                    missing.push(format!(
                        "{}.{} (needs {}, has {connected})",
                        stage.name, template.name, template.min_count
                    ));
                }
            }
        }
        missing
    }

    /// Fails with `GraphIncomplete` when a mandatory port is unconnected.
    pub fn check_complete(&self) -> LivemixResult<()> {
        let missing = self.unconnected_mandatory();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(LivemixError::GraphIncomplete { missing })
        }
    }

    fn dependency_graph(&self) -> (DiGraph<StageId, ()>, HashMap<StageId, NodeIndex>) {
        let mut graph = DiGraph::new();
        let mut nodes = HashMap::new();
        for stage in self.stages() {
            nodes.insert(stage.id, graph.add_node(stage.id));
        }
        for conn in self.connections() {
            let up = self.port(conn.upstream).and_then(|p| nodes.get(&p.stage));
            let down = self.port(conn.downstream).and_then(|p| nodes.get(&p.stage));
            if let (Some(up), Some(down)) = (up, down) {
                graph.add_edge(*up, *down, ());
            }
        }
        (graph, nodes)
    }

    fn would_cycle(&self, upstream: StageId, downstream: StageId) -> bool {
        if upstream == downstream {
            return true;
        }
        let (graph, nodes) = self.dependency_graph();
        match (nodes.get(&downstream), nodes.get(&upstream)) {
            (Some(from), Some(to)) => has_path_connecting(&graph, *from, *to, None),
            _ => false,
        }
    }

    /// Stages ordered so every stage comes after all of its upstreams.
    pub fn topological_order(&self) -> LivemixResult<Vec<StageId>> {
        let (graph, _) = self.dependency_graph();
        let order = toposort(&graph, None).map_err(|cycle| {
            let name = self
                .stage(graph[cycle.node_id()])
                .map_or_else(String::new, |s| s.name.clone());
            LivemixError::LinkCycle {
                upstream: name.clone(),
                downstream: name,
            }
        })?;
        Ok(order.into_iter().map(|n| graph[n]).collect())
    }

    /// Everything a provider needs to instantiate a stage's processor.
    pub fn stage_config(&self, id: StageId) -> LivemixResult<StageConfig> {
        let stage = self.stage_ref(id)?;
        let bindings = |direction: Direction| {
            let mut bound: Vec<(ConnectionId, PortBinding)> = stage
                .ports
                .iter()
                .filter_map(|p| self.port(*p))
                .filter(|p| p.direction == direction)
                .filter_map(|p| {
                    Some((
                        p.connection()?,
                        PortBinding {
                            port: p.id,
                            name: p.name.clone(),
                            contract: p.contract?,
                        },
                    ))
                })
                .collect();
            bound.sort_by_key(|(id, _)| *id);
            bound.into_iter().map(|(_, b)| b).collect::<Vec<_>>()
        };
        Ok(StageConfig {
            id,
            name: stage.name.clone(),
            kind: stage.kind(),
            options: stage.resolved_options(),
            inputs: bindings(Direction::Input),
            outputs: bindings(Direction::Output),
            layout: self.layouts.get(&id).cloned(),
        })
    }

    // ── Teardown ────────────────────────────────────────────────────────

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    /// Release on-demand ports, then destroy stages sinks first. Leaves the
    /// graph `Stopped`. Calling it again returns an empty report.
    pub fn teardown(&mut self) -> TeardownReport {
        let mut report = TeardownReport::default();
        if self.torn_down {
            return report;
        }
        self.release_abandoned();

        let order = self
            .topological_order()
            .unwrap_or_else(|_| self.stages().map(|s| s.id).collect());

        for stage in &order {
            let requested: Vec<PortId> = self
                .stage(*stage)
                .map(|s| s.ports.clone())
                .unwrap_or_default()
                .into_iter()
                .filter(|p| {
                    self.port(*p)
                        .is_some_and(|p| p.presence == Presence::Request && !p.is_released())
                })
                .collect();
            for port in requested {
                report.released_ports.push(self.port_label(port));
                self.release_port_unchecked(port);
            }
        }

        for stage in order.iter().rev() {
            if let Some(name) = self.destroy_stage(*stage) {
                report.destroyed_stages.push(name);
            }
        }

        self.torn_down = true;
        self.set_state(GraphState::Stopped);
        tracing::info!(
            graph = %self.name,
            released = report.released_ports.len(),
            destroyed = report.destroyed_stages.len(),
            "Graph torn down"
        );
        report
    }
}

impl Drop for Graph {
    fn drop(&mut self) {
        if !self.torn_down {
            self.teardown();
        }
    }
}

fn option_dimension(stage: &Stage, key: &str) -> Option<u32> {
    stage
        .option(key)
        .and_then(OptionValue::as_int)
        .and_then(|v| u32::try_from(v).ok())
}

fn geometry_of(
    template: &FormatTemplate,
    width: u32,
    height: u32,
    rate_from: Option<FormatContract>,
) -> FormatTemplate {
    let mut g = FormatTemplate::new(template.encodings.clone()).with_size(width, height);
    g.framerate = rate_from.map(|c| c.framerate);
    g
}
