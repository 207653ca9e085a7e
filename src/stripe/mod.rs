pub mod client;
pub mod event;
pub mod signature;

pub use client::{
    CheckoutSessionRequest, CreatedSession, PaymentProvider, ProviderError, SessionMode,
    StripeClient,
};
pub use event::{BillingMetadata, PurchaseKind, StripeEvent, WebhookEvent};
pub use signature::SignatureError;
