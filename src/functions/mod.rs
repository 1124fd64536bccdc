pub mod delivery;
pub mod dispatch;
pub mod publish;
pub mod review;
pub mod scheduler;
pub mod webhook;

pub use delivery::DeliveryPipeline;
pub use publish::Publisher;
pub use review::{Review, ReviewError};
pub use scheduler::Scheduler;
