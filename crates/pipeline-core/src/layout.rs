//! Compositor layout: per-input placement and the background layer.
//!
//! A layout is shared between the graph (which edits it from the dispatch
//! loop) and the running compositor (which reads it once per output frame),
//! so edits take effect on the next composited frame.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::port::PortId;

/// Offset of one compositor input inside the canvas. Offsets may be negative
/// or exceed the canvas; whatever falls outside is clipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Placement {
    pub x: i32,
    pub y: i32,
}

impl Placement {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// Layer drawn beneath all inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Background {
    Checker,
    #[default]
    Black,
    White,
    /// No background layer; uncovered pixels keep their initial value.
    Transparent,
}

impl Background {
    /// Nick and numeric value of every background, for option schemas.
    pub const VALUES: &'static [(&'static str, i64)] = &[
        ("checker", 0),
        ("black", 1),
        ("white", 2),
        ("transparent", 3),
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Checker => "checker",
            Self::Black => "black",
            Self::White => "white",
            Self::Transparent => "transparent",
        }
    }

    /// Whether a background layer is painted at all.
    pub fn is_painted(&self) -> bool {
        !matches!(self, Self::Transparent)
    }
}

impl fmt::Display for Background {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Background {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "checker" => Ok(Self::Checker),
            "black" => Ok(Self::Black),
            "white" => Ok(Self::White),
            "transparent" => Ok(Self::Transparent),
            other => Err(format!("unknown background '{other}'")),
        }
    }
}

/// Per-input placements, the stacking order of connected inputs, and the
/// background choice.
#[derive(Debug, Clone, Default)]
pub struct Layout {
    background: Background,
    placements: HashMap<PortId, Placement>,
    stack: Vec<PortId>,
}

impl Layout {
    pub fn background(&self) -> Background {
        self.background
    }

    pub fn set_background(&mut self, background: Background) {
        self.background = background;
    }

    /// Put a newly connected input at the top of the stack.
    pub(crate) fn add_input(&mut self, port: PortId) {
        if !self.stack.contains(&port) {
            self.stack.push(port);
        }
    }

    /// Take a disconnected input off the stack. Its placement is kept in case
    /// it is linked again.
    pub(crate) fn remove_input(&mut self, port: PortId) {
        self.stack.retain(|p| *p != port);
    }

    /// Forget a released input entirely.
    pub(crate) fn forget_input(&mut self, port: PortId) {
        self.remove_input(port);
        self.placements.remove(&port);
    }

    /// Placement of an input; unplaced inputs sit at the origin.
    pub fn placement(&self, port: PortId) -> Placement {
        self.placements.get(&port).copied().unwrap_or_default()
    }

    pub(crate) fn set_placement(&mut self, port: PortId, placement: Placement) {
        self.placements.insert(port, placement);
    }

    /// Stacking position: 0 is drawn first (bottom).
    pub fn position(&self, port: PortId) -> Option<usize> {
        self.stack.iter().position(|p| *p == port)
    }

    /// Connected inputs bottom to top with their placements.
    pub fn inputs(&self) -> Vec<(PortId, Placement)> {
        self.stack
            .iter()
            .map(|p| (*p, self.placement(*p)))
            .collect()
    }
}

pub type SharedLayout = Arc<RwLock<Layout>>;

pub fn shared_layout(background: Background) -> SharedLayout {
    Arc::new(RwLock::new(Layout {
        background,
        ..Layout::default()
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inputs_stack_in_connection_order() {
        let mut layout = Layout::default();
        layout.add_input(PortId(7));
        layout.add_input(PortId(3));
        layout.add_input(PortId(7));
        assert_eq!(layout.position(PortId(7)), Some(0));
        assert_eq!(layout.position(PortId(3)), Some(1));
        assert_eq!(layout.inputs().len(), 2);
    }

    #[test]
    fn test_placement_survives_relink_but_not_release() {
        let mut layout = Layout::default();
        assert_eq!(layout.placement(PortId(1)), Placement::default());
        layout.set_placement(PortId(1), Placement::new(10, -4));
        layout.add_input(PortId(1));
        assert_eq!(layout.inputs(), vec![(PortId(1), Placement::new(10, -4))]);
        layout.remove_input(PortId(1));
        assert!(layout.inputs().is_empty());
        assert_eq!(layout.placement(PortId(1)), Placement::new(10, -4));
        layout.forget_input(PortId(1));
        assert_eq!(layout.placement(PortId(1)), Placement::default());
    }

    #[test]
    fn test_background_nicks() {
        for (nick, _) in Background::VALUES {
            assert_eq!(nick.parse::<Background>().unwrap().as_str(), *nick);
        }
        assert!(Background::Black.is_painted());
        assert!(!Background::Transparent.is_painted());
    }
}
