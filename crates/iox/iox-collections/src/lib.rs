mod prefix_tree;

pub use prefix_tree::{PrefixTree, node_capacity};
