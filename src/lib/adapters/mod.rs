pub mod recovery;
pub mod websocket;

pub use recovery::*;
pub use websocket::*;
