pub mod multi_recipient;

pub use multi_recipient::{build_multi_recipient_envelope, open_multi_recipient_envelope, OpenedEnvelope};
