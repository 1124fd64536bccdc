pub mod audit;
pub mod outbox;
pub mod post;

pub use audit::*;
pub use outbox::*;
pub use post::*;
