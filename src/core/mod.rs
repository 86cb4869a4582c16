pub mod globals;

pub use globals::{ADJACENCY_POOL, SEARCH_POOL, TOKIO_RUNTIME};
