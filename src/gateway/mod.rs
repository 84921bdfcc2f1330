pub mod close;
pub mod payload;
pub mod transport;

pub use close::{classify, ErrorAction};
pub use payload::{InboundEvent, OutboundPayload, SpeakingFlags};
pub use transport::{ControlTransport, MAX_PAYLOAD_BYTES};
