//! The Prolly tree: the indexed ordered map used for every table's
//! primary and secondary indexes.

pub mod chunker;
pub mod diff;
pub mod node;
pub mod tree;

pub use diff::{diff, three_way_diff, DiffEntry, ThreeWayEntry, TreeDiffer};
pub use node::Node;
pub use tree::{ProllyTree, TreeBuilder, TreeCursor};
