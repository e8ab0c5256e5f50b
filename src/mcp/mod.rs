pub mod rewrite;
pub mod router;
pub mod types;
pub mod websocket;
