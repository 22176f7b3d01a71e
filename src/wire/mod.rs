//! # Wire Connection Rules
//!
//! Ready-made [`BlockNode::find_connections`](crate::BlockNode::find_connections)
//! and [`BlockNode::can_connect`](crate::BlockNode::can_connect) logic for
//! the three usual wire shapes:
//!
//! | Shape | Occupies | Connects to |
//! |-------|----------|-------------|
//! | `Full` | the whole block | anything across a face |
//! | `Center` | a strand through the block centre | neighbours, and sided wires in its own block |
//! | `Sided(dir)` | one face of the block | its own block, along its face, around corners, and the block it sits on |
//!
//! A node opts in by returning its shape from
//! [`BlockNode::wire_shape`](crate::BlockNode::wire_shape). Nodes without a
//! shape never connect through these rules. Both sides of a link run the
//! same rules, so the checks agree as the engine requires.

use crate::engine::NodeContext;
use crate::model::{BlockPos, Direction, HalfLink, LinkKeyValue, NodePos};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WireShape {
    Full,
    Center,
    /// Attached to the given face of its block.
    Sided(Direction),
}

/// How a sided wire reaches the other node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WireConnectionKind {
    /// Another sided wire in the same block, on a perpendicular face.
    Internal,
    /// A neighbour along the face the wire sits on.
    External,
    /// A sided wire wrapped around the edge of the supporting block.
    Corner,
    /// The full block the wire sits on.
    Under,
    /// A center wire in the same block.
    Above,
}

/// One candidate connection, as handed to a [`WireFilter`].
#[derive(Debug, Clone, Copy)]
pub struct WireConnection<'a> {
    pub node: &'a NodePos,
    pub other: &'a NodePos,
    /// Face of `node` the connection goes through.
    pub side: Direction,
    /// Set when `node` is a sided wire.
    pub kind: Option<WireConnectionKind>,
    /// Face the other wire sits on, when a full block meets a sided wire.
    pub wire_side: Option<Direction>,
}

/// Extra veto on top of the shape rules, for colours, channels and the like.
pub type WireFilter<'f> = Option<&'f dyn Fn(&WireConnection<'_>) -> bool>;

/// Candidate links for the asking node according to its shape.
pub fn find_connections(ctx: &mut NodeContext<'_>, filter: WireFilter<'_>) -> Vec<HalfLink> {
    let node = ctx.node().clone();
    let positions: Vec<BlockPos> = match node.node.get().wire_shape() {
        None => return Vec::new(),
        Some(WireShape::Full) => node.pos.adjacent().to_vec(),
        Some(WireShape::Center) => std::iter::once(node.pos).chain(node.pos.adjacent()).collect(),
        Some(WireShape::Sided(side)) => sided_reach(node.pos, side),
    };

    let mut found = Vec::new();
    for pos in positions {
        for other in ctx.nodes_at(pos) {
            if other != node && can_connect(&node, &other, filter) {
                found.push(HalfLink::new(LinkKeyValue::empty(), other));
            }
        }
    }
    found
}

/// Whether `node` may connect to `other` according to `node`'s shape.
pub fn can_connect(node: &NodePos, other: &NodePos, filter: WireFilter<'_>) -> bool {
    match node.node.get().wire_shape() {
        Some(WireShape::Full) => full_block_can_connect(node, other, filter),
        Some(WireShape::Center) => center_wire_can_connect(node, other, filter),
        Some(WireShape::Sided(side)) => sided_wire_can_connect(node, side, other, filter),
        None => false,
    }
}

pub fn full_block_can_connect(node: &NodePos, other: &NodePos, filter: WireFilter<'_>) -> bool {
    let Some(side) = Direction::between(node.pos, other.pos) else {
        return false;
    };
    let wire_side = match other.node.get().wire_shape() {
        Some(WireShape::Full | WireShape::Center) => None,
        // A wire on the far face of the neighbour does not touch us.
        Some(WireShape::Sided(other_side)) if other_side != side => Some(other_side),
        _ => return false,
    };
    accept(filter, WireConnection { node, other, side, kind: None, wire_side })
}

pub fn center_wire_can_connect(node: &NodePos, other: &NodePos, filter: WireFilter<'_>) -> bool {
    let side = match other.node.get().wire_shape() {
        Some(WireShape::Full | WireShape::Center) => match Direction::between(node.pos, other.pos) {
            Some(side) => side,
            None => return false,
        },
        Some(WireShape::Sided(other_side)) if other.pos == node.pos => other_side,
        _ => return false,
    };
    accept(filter, WireConnection { node, other, side, kind: None, wire_side: None })
}

/// Rules for a wire attached to face `side` of its block.
pub fn sided_wire_can_connect(
    node: &NodePos,
    side: Direction,
    other: &NodePos,
    filter: WireFilter<'_>,
) -> bool {
    let toward = Direction::between(node.pos, other.pos);
    let (through, kind) = match other.node.get().wire_shape() {
        Some(WireShape::Sided(other_side)) => {
            if other.pos == node.pos {
                if other_side.axis() == side.axis() {
                    return false;
                }
                (other_side, WireConnectionKind::Internal)
            } else if let Some(dir) = toward {
                if dir.axis() == side.axis() || other_side != side {
                    return false;
                }
                (dir, WireConnectionKind::External)
            } else {
                let Some(dir) = Direction::between(node.pos.step(side), other.pos) else {
                    return false;
                };
                if dir.axis() == side.axis() || other_side != dir.opposite() {
                    return false;
                }
                (dir, WireConnectionKind::Corner)
            }
        }
        Some(WireShape::Full) => match toward {
            Some(dir) if dir == side => (dir, WireConnectionKind::Under),
            Some(dir) if dir != side.opposite() => (dir, WireConnectionKind::External),
            _ => return false,
        },
        Some(WireShape::Center) if other.pos == node.pos => (side.opposite(), WireConnectionKind::Above),
        _ => return false,
    };
    accept(filter, WireConnection { node, other, side: through, kind: Some(kind), wire_side: None })
}

/// Positions a sided wire can reach: its own block, the four neighbours
/// along its face, the four corners around the supporting block and the
/// supporting block itself.
fn sided_reach(pos: BlockPos, side: Direction) -> Vec<BlockPos> {
    let under = pos.step(side);
    let mut reach = vec![pos];
    for dir in side.perpendiculars() {
        reach.push(pos.step(dir));
        reach.push(under.step(dir));
    }
    reach.push(under);
    reach
}

fn accept(filter: WireFilter<'_>, connection: WireConnection<'_>) -> bool {
    filter.is_none_or(|f| f(&connection))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BlockNode, NodeValue, TypeTag};

    #[derive(Debug, PartialEq, Eq, Hash)]
    struct Shaped(WireShape);

    impl BlockNode for Shaped {
        fn type_tag(&self) -> TypeTag {
            TypeTag::from_static("test:shaped")
        }

        fn find_connections(&self, ctx: &mut NodeContext<'_>) -> Vec<HalfLink> {
            find_connections(ctx, None)
        }

        fn can_connect(&self, ctx: &mut NodeContext<'_>, link: &HalfLink) -> bool {
            can_connect(ctx.node(), &link.other, None)
        }

        fn wire_shape(&self) -> Option<WireShape> {
            Some(self.0)
        }
    }

    #[derive(Debug, PartialEq, Eq, Hash)]
    struct Plain;

    impl BlockNode for Plain {
        fn type_tag(&self) -> TypeTag {
            TypeTag::from_static("test:plain")
        }

        fn find_connections(&self, _ctx: &mut NodeContext<'_>) -> Vec<HalfLink> {
            Vec::new()
        }

        fn can_connect(&self, _ctx: &mut NodeContext<'_>, _link: &HalfLink) -> bool {
            true
        }
    }

    fn at(x: i32, y: i32, z: i32, shape: WireShape) -> NodePos {
        NodePos::new(BlockPos::new(x, y, z), NodeValue::new(Shaped(shape)))
    }

    fn floor(x: i32, y: i32, z: i32) -> NodePos {
        at(x, y, z, WireShape::Sided(Direction::Down))
    }

    /// Both directions agree, and return the shared answer.
    fn linked(a: &NodePos, b: &NodePos) -> bool {
        let forward = can_connect(a, b, None);
        assert_eq!(forward, can_connect(b, a, None), "{a} and {b} disagree");
        forward
    }

    #[test]
    fn test_full_blocks_connect_across_faces_only() {
        let origin = at(0, 0, 0, WireShape::Full);
        assert!(linked(&origin, &at(1, 0, 0, WireShape::Full)));
        assert!(linked(&origin, &at(0, -1, 0, WireShape::Center)));
        assert!(!linked(&origin, &at(1, 1, 0, WireShape::Full)));
        assert!(!linked(&origin, &at(2, 0, 0, WireShape::Full)));
        assert!(!linked(&origin, &NodePos::new(BlockPos::new(1, 0, 0), NodeValue::new(Plain))));
    }

    #[test]
    fn test_center_wire_joins_sided_wire_in_its_block() {
        let pipe = at(0, 0, 0, WireShape::Center);
        assert!(linked(&pipe, &floor(0, 0, 0)));
        assert!(!linked(&pipe, &floor(1, 0, 0)));
        assert!(linked(&pipe, &at(0, 1, 0, WireShape::Center)));
    }

    #[test]
    fn test_sided_wire_rules() {
        let trace = floor(0, 0, 0);
        // Along the floor.
        assert!(linked(&trace, &floor(1, 0, 0)));
        assert!(!linked(&trace, &at(1, 0, 0, WireShape::Sided(Direction::Up))));
        // Same block, perpendicular face only.
        assert!(linked(&trace, &at(0, 0, 0, WireShape::Sided(Direction::North))));
        assert!(!linked(&trace, &at(0, 0, 0, WireShape::Sided(Direction::Up))));
        // Around the edge of the supporting block.
        assert!(linked(&trace, &at(1, -1, 0, WireShape::Sided(Direction::West))));
        assert!(!linked(&trace, &at(1, -1, 0, WireShape::Sided(Direction::East))));
        // The block it sits on, but not the one above.
        assert!(linked(&trace, &at(0, -1, 0, WireShape::Full)));
        assert!(!linked(&trace, &at(0, 1, 0, WireShape::Full)));
        assert!(linked(&trace, &at(0, 0, 1, WireShape::Full)));
    }

    #[test]
    fn test_filter_sees_connection_kind() {
        let trace = floor(0, 0, 0);
        let corner = at(1, -1, 0, WireShape::Sided(Direction::West));
        let no_corners = |c: &WireConnection<'_>| c.kind != Some(WireConnectionKind::Corner);
        assert!(!can_connect(&trace, &corner, Some(&no_corners)));
        assert!(can_connect(&trace, &floor(1, 0, 0), Some(&no_corners)));

        let under = at(0, -1, 0, WireShape::Full);
        let only_under = |c: &WireConnection<'_>| c.kind == Some(WireConnectionKind::Under) && c.side == Direction::Down;
        assert!(can_connect(&trace, &under, Some(&only_under)));
        assert!(!can_connect(&trace, &floor(1, 0, 0), Some(&only_under)));
    }

    #[test]
    fn test_sided_reach() {
        let reach = sided_reach(BlockPos::new(0, 5, 0), Direction::Down);
        assert_eq!(reach.len(), 10);
        assert!(reach.contains(&BlockPos::new(0, 4, 0)));
        assert!(reach.contains(&BlockPos::new(-1, 4, 0)));
        assert!(reach.contains(&BlockPos::new(0, 5, 1)));
        assert!(!reach.contains(&BlockPos::new(0, 6, 0)));
    }
}
