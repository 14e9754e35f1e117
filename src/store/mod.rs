pub mod credentials;
pub mod events;
pub mod plans;
pub mod subscriptions;
pub mod tokens;

pub use credentials::{Credential, CredentialsStore, KeyLimits};
pub use events::EventsStore;
pub use plans::{Plan, PlansStore};
pub use subscriptions::{Subscription, SubscriptionStatus, SubscriptionsStore};
pub use tokens::{ConsumeOutcome, TokensStore};
