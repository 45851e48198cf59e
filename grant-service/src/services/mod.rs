pub mod coordinator;
pub mod database;
pub mod error;
pub mod mailer;
pub mod memory;
pub mod metrics;
pub mod policy;
pub mod provisioner;
pub mod registry;
pub mod store;

pub use coordinator::{GrantCoordinator, RevokeOutcome, RevokeRequest};
pub use database::GrantDb;
pub use error::GrantError;
pub use mailer::{MailError, Mailer, MailgunMailer, MockMailer, SmtpMailer};
pub use memory::MemoryStore;
pub use metrics::{get_metrics, init_metrics};
pub use policy::{Decision, RuleEvaluator};
pub use provisioner::{
    AccountAdmin, AdminClients, Credentials, MockAccountAdmin, MongoAccountAdmin, Provisioner,
};
pub use registry::{IssuedFetchToken, TokenRegistry, TokenSettings};
pub use store::{GrantFilter, GrantStore, RuleStore, Store, TokenStore};
