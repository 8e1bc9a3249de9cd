//! PostgreSQL v3 wire protocol, limited to what the pooler needs:
//! framing, startup negotiation, authentication exchange and the
//! ReadyForQuery transaction status used as the pooling boundary.

pub mod codec;
pub mod messages;
pub mod packet;
pub mod startup;

pub use codec::{MessageCodec, StartupCodec};
pub use messages::{sqlstate, AuthRequest, ErrorResponse, TransactionStatus};
pub use packet::{backend, frontend, Message};
pub use startup::{StartupError, StartupMessage, StartupRequest};
