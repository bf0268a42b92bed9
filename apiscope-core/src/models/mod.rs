pub mod alert;
pub mod data_field;
pub mod endpoint;
pub mod spec;
pub mod trace;

pub use alert::{Alert, AlertStatus, AlertType};
pub use data_field::{DataField, DataSection, SENSITIVE_TAG};
pub use endpoint::{Endpoint, RiskScore};
pub use spec::OpenApiSpecDoc;
pub use trace::{PairObject, QueuedTrace, SessionMeta, Trace};
