pub mod admission;
pub mod broker;
pub mod dispatcher;
pub mod image;
pub mod postback;
pub mod registry;
pub mod router;

pub use admission::{AdmissionController, AdmissionHandle, AdmissionSnapshot};
pub use broker::{BrokerError, BrokerSession, ReplyDelivery};
pub use dispatcher::Dispatcher;
pub use postback::PostbackDriver;
pub use registry::{RegistryError, RequestRegistry};
pub use router::ReplyRouter;
