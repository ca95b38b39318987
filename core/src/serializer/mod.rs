//! Request and response serializers.
//!
//! Both sides are strategy objects selected by configuration rather than a
//! hierarchy of overriding types: `RequestEncoding` picks form or JSON bodies
//! (multipart is chosen per call from the parameters), and a
//! `ResponseSerializer` is a pair of injected validate/deserialize functions.

pub mod request;
pub mod response;

pub use request::{RequestEncoding, RequestSerializer};
pub use response::{Payload, ResponseEncoding, ResponseSerializer};
