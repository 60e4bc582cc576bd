#![warn(clippy::unwrap_used)]

pub mod background;
pub mod catalog;
pub mod dispatcher;
pub mod funnel;
pub mod gateway;
pub mod scrub;
pub mod state;
pub mod template;
pub mod transport;

pub use background::BackgroundTasks;
pub use catalog::ActionCatalog;
pub use dispatcher::ActionDispatcher;
pub use funnel::{FunnelService, StepOutcome};
pub use gateway::{GatewayOutcome, HttpPaymentGateway, PaymentGateway, PaymentRequest};
pub use scrub::{ScrubEngine, ScrubRequest};
pub use state::TransactionStore;
pub use template::{TemplateResolver, TemplateSources, Token};
pub use transport::{ActionTransport, HttpTransport, OutboundBody, OutboundRequest};
