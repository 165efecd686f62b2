pub mod booklist;
pub mod engine;
pub mod folders;
pub mod plan;
pub mod pull;
pub mod reconcile;
pub mod render;
