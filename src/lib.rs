//! Client for the [Hessian][hessian] binary RPC protocol.
//!
//! Hessian frames a method call as a compact, self-describing byte
//! sequence carrying a dynamic value tree; the reply carries either a
//! result value or a fault record. Shared and cyclic structures are
//! preserved exactly through a per-operation reference table. Both
//! published wire generations are supported and selected statically
//! through [Version].
//!
//! The transport is abstract: a [Dispatcher] hands opaque request
//! bytes to a [Channel] and decodes the opaque reply bytes it returns.
//! Concrete transports, connection management and authentication live
//! outside this crate.
//!
//! [hessian]: http://hessian.caucho.com/doc/hessian-serialization.html
mod decode;
mod dispatcher;
mod encode;
mod envelope;
mod error;
mod grammar;
mod reference;
mod registry;
mod value;

#[doc(inline)]
pub use decode::decode_value;

#[doc(inline)]
pub use dispatcher::{Channel, Dispatcher, InvokeError, TransportError};

#[doc(inline)]
pub use encode::encode_value;

#[doc(inline)]
pub use envelope::{CallEnvelope, Fault, InvocationState, Reply};

#[doc(inline)]
pub use error::ProtocolError;

#[doc(inline)]
pub use grammar::Version;

#[doc(inline)]
pub use registry::{TypeDef, TypeRegistry, TypeRegistryBuilder};

#[doc(inline)]
pub use value::{Handle, List, Map, Object, Value};
