//! Types shared between the protocol engine (`smtpd`) and the listener /
//! session manager (`smtpd-server`): the envelope/address data model,
//! SMTP reply status codes, and the error hierarchies each layer composes
//! from via `#[from]`.

pub mod address;
pub mod envelope;
pub mod error;
pub mod logging;
pub mod status;

pub use address::{Address, AddressList, MailParameters};
pub use envelope::Envelope;
pub use status::Status;
