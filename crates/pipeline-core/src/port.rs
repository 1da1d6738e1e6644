//! Ports and graph identifiers.

use std::fmt;

use crate::format::{Caps, FormatContract};

macro_rules! graph_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub(crate) u32);

        impl $name {
            pub fn index(&self) -> usize {
                self.0 as usize
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

graph_id!(
    /// Identifies a stage inside one graph.
    StageId,
    "stage#"
);
graph_id!(
    /// Identifies a port inside one graph.
    PortId,
    "port#"
);
graph_id!(
    /// Identifies a connection inside one graph.
    ConnectionId,
    "link#"
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Input,
    Output,
}

impl Direction {
    pub fn opposite(&self) -> Direction {
        match self {
            Self::Input => Self::Output,
            Self::Output => Self::Input,
        }
    }
}

/// When a port exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Presence {
    /// Created with the stage and alive for its whole lifetime.
    Always,
    /// Created on demand and explicitly released.
    Request,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    Unconnected,
    Connected(ConnectionId),
    Released,
}

/// A typed attachment point on a stage.
#[derive(Debug, Clone)]
pub struct Port {
    pub(crate) id: PortId,
    pub(crate) stage: StageId,
    pub(crate) name: String,
    pub(crate) direction: Direction,
    pub(crate) presence: Presence,
    pub(crate) caps: Caps,
    pub(crate) mandatory: bool,
    pub(crate) state: PortState,
    pub(crate) contract: Option<FormatContract>,
}

impl Port {
    pub fn id(&self) -> PortId {
        self.id
    }

    pub fn stage(&self) -> StageId {
        self.stage
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn presence(&self) -> Presence {
        self.presence
    }

    /// Template capabilities, before any negotiation.
    pub fn template_caps(&self) -> &Caps {
        &self.caps
    }

    /// Whether the graph refuses to become ready while this port is unconnected.
    pub fn is_mandatory(&self) -> bool {
        self.mandatory
    }

    pub fn state(&self) -> PortState {
        self.state
    }

    pub fn connection(&self) -> Option<ConnectionId> {
        match self.state {
            PortState::Connected(id) => Some(id),
            _ => None,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state, PortState::Connected(_))
    }

    pub fn is_released(&self) -> bool {
        matches!(self.state, PortState::Released)
    }

    /// Contract negotiated on this port's connection, if linked.
    pub fn contract(&self) -> Option<&FormatContract> {
        self.contract.as_ref()
    }
}
