//! Bus-facing adapters: the envelope codec, the ingress consumer and the
//! outbox relay for ledger notifications.

pub mod codec;
pub mod consumer;
pub mod outbox;
