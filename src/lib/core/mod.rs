pub mod error;
pub mod message;
pub mod relay;
pub mod session;

pub use error::*;
pub use message::*;
pub use relay::*;
pub use session::*;
