//! Navigation trees, the unified graph cache, and pathfinding.
//!
//! A navigation tree declares the screens of a product surface and the
//! transitions between them, each transition carrying the concrete device
//! actions that perform it. The tree is flattened into a unified graph
//! per (team, interface), cached with a short TTL, and queried by the
//! pathfinder, which pre-expands paths into action sequences embedded
//! into plans so execution never consults the tree.

pub mod cache;
pub mod pathfinder;
pub mod tree;
pub mod unified;

pub use cache::{NavigationCache, NavigationCacheConfig};
pub use pathfinder::{find_path, NavigationPath, TransitionStep};
pub use tree::{EdgeAction, NavEdge, NavNode, NavigationTree};
pub use unified::UnifiedGraph;
