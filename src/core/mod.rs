pub mod history;
pub mod models;
pub mod process_tree;

pub use history::ProcessHistory;
pub use models::*;
pub use process_tree::{ProcessTree, ProcessTreeError, TreeSnapshot};
