//! Call and reply frames for one invocation.

use crate::decode::Decoder;
use crate::encode::Encoder;
use crate::error::ProtocolError;
use crate::grammar::{v1, v2, Version};
use crate::registry::TypeRegistry;
use crate::value::Value;

/// Server-reported failure of a call.
///
/// A fault is a successfully decoded, semantically negative reply. It
/// is a terminal outcome like a result value and is never conflated
/// with a transport or protocol failure.
#[derive(Debug, Clone, PartialEq)]
pub struct Fault {
    /// Machine-readable code, e.g. `ServiceException`.
    pub code: String,
    pub message: String,
    /// Optional structured payload, often an object describing the
    /// remote failure.
    pub detail: Option<Value>,
}

impl Fault {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(
        code: impl Into<String>,
        message: impl Into<String>,
        detail: Value,
    ) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            detail: Some(detail),
        }
    }
}

/// Decoded reply frame: a result value or a fault record.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Success(Value),
    Fault(Fault),
}

impl Reply {
    /// Build the wire frame for this reply. The counterpart of
    /// [CallEnvelope::decode_reply], used by in-process channels and
    /// test servers.
    pub fn encode(&self, version: Version, registry: &TypeRegistry) -> Vec<u8> {
        let mut encoder = Encoder::new(version, registry);
        match version {
            Version::Hessian1 => {
                encoder.write_u8(v1::REPLY);
                encoder.write_bytes(&version.marker());
                match self {
                    Reply::Success(value) => encoder.write_value(value),
                    Reply::Fault(fault) => {
                        encoder.write_u8(v1::FAULT);
                        encoder.write_value(&Value::string("code"));
                        encoder.write_value(&Value::string(fault.code.as_str()));
                        encoder.write_value(&Value::string("message"));
                        encoder.write_value(&Value::string(fault.message.as_str()));
                        if let Some(detail) = &fault.detail {
                            encoder.write_value(&Value::string("detail"));
                            encoder.write_value(detail);
                        }
                    }
                }
                encoder.write_u8(v1::END);
            }
            Version::Hessian2 => {
                encoder.write_u8(v2::FRAME);
                encoder.write_bytes(&version.marker());
                match self {
                    Reply::Success(value) => {
                        encoder.write_u8(v2::REPLY);
                        encoder.write_value(value);
                    }
                    Reply::Fault(fault) => {
                        encoder.write_u8(v2::FAULT);
                        let mut entries = vec![
                            (Value::string("code"), Value::string(fault.code.as_str())),
                            (
                                Value::string("message"),
                                Value::string(fault.message.as_str()),
                            ),
                        ];
                        if let Some(detail) = &fault.detail {
                            entries.push((Value::string("detail"), detail.clone()));
                        }
                        encoder.write_value(&Value::map(entries));
                    }
                }
            }
        }
        encoder.finish()
    }
}

/// Lifecycle of one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationState {
    Built,
    Sent,
    AwaitingReply,
    Resolved,
    Faulted,
    TransportFailed,
}

/// One invocation: protocol version, method name and ordered arguments,
/// plus the state the dispatcher drives it through.
///
/// An envelope belongs to exactly one invocation. The reference tables
/// used to encode its call and decode its reply are created fresh for
/// each operation, so concurrent invocations never share state.
#[derive(Debug)]
pub struct CallEnvelope {
    version: Version,
    method: String,
    args: Vec<Value>,
    state: InvocationState,
}

impl CallEnvelope {
    pub fn new(version: Version, method: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            version,
            method: method.into(),
            args,
            state: InvocationState::Built,
        }
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn state(&self) -> InvocationState {
        self.state
    }

    pub(crate) fn mark_sent(&mut self) {
        self.state = InvocationState::Sent;
    }

    pub(crate) fn mark_awaiting(&mut self) {
        self.state = InvocationState::AwaitingReply;
    }

    pub(crate) fn fail_transport(&mut self) {
        self.state = InvocationState::TransportFailed;
    }

    /// Build the call frame with a fresh reference table.
    pub fn encode_call(&self, registry: &TypeRegistry) -> Vec<u8> {
        let mut encoder = Encoder::new(self.version, registry);
        match self.version {
            Version::Hessian1 => {
                encoder.write_u8(v1::CALL);
                encoder.write_bytes(&self.version.marker());
                encoder.write_u8(v1::METHOD);
                encoder.write_v1_name(&self.method);
                for arg in &self.args {
                    encoder.write_value(arg);
                }
                encoder.write_u8(v1::END);
            }
            Version::Hessian2 => {
                encoder.write_u8(v2::FRAME);
                encoder.write_bytes(&self.version.marker());
                encoder.write_u8(v2::CALL);
                encoder.write_raw_string(&self.method);
                encoder.write_raw_int(self.args.len() as i32);
                for arg in &self.args {
                    encoder.write_value(arg);
                }
            }
        }
        encoder.finish()
    }

    /// Parse a call frame. The counterpart of [CallEnvelope::encode_call],
    /// used by in-process channels and test servers.
    pub fn decode_call(
        bytes: &[u8],
        version: Version,
        registry: &TypeRegistry,
    ) -> Result<Self, ProtocolError> {
        let mut decoder = Decoder::new(bytes, version, registry);
        let (method, args) = match version {
            Version::Hessian1 => {
                decoder.expect_u8(v1::CALL, "call frame")?;
                decoder.expect_version_marker(version.marker())?;
                let tag = skip_headers(&mut decoder)?;
                if tag != v1::METHOD {
                    return Err(ProtocolError::UnexpectedTag {
                        expected: "method name",
                        tag,
                    });
                }
                let method = decoder.read_v1_name()?;
                let mut args = Vec::new();
                loop {
                    let tag = decoder.read_u8()?;
                    if tag == v1::END {
                        break;
                    }
                    args.push(decoder.read_tagged(tag)?);
                }
                (method, args)
            }
            Version::Hessian2 => {
                decoder.expect_u8(v2::FRAME, "call frame")?;
                decoder.expect_version_marker(version.marker())?;
                decoder.expect_u8(v2::CALL, "call marker")?;
                let method = decoder.read_raw_string()?;
                let count = decoder.read_raw_int()?;
                if count < 0 {
                    return Err(ProtocolError::InvalidLength {
                        length: i64::from(count),
                    });
                }
                let mut args = Vec::new();
                for _ in 0..count {
                    args.push(decoder.read_value()?);
                }
                (method, args)
            }
        };
        decoder.expect_end()?;
        Ok(Self {
            version,
            method,
            args,
            state: InvocationState::Built,
        })
    }

    /// Parse the reply frame and attach its outcome, with a fresh
    /// reference table independent of the call's.
    ///
    /// A frame carrying the fault marker always resolves to
    /// [Reply::Fault], regardless of how its payload would parse.
    pub fn decode_reply(
        &mut self,
        bytes: &[u8],
        registry: &TypeRegistry,
    ) -> Result<Reply, ProtocolError> {
        let mut decoder = Decoder::new(bytes, self.version, registry);
        let reply = match self.version {
            Version::Hessian1 => {
                decoder.expect_u8(v1::REPLY, "reply frame")?;
                decoder.expect_version_marker(self.version.marker())?;
                let tag = skip_headers(&mut decoder)?;
                if tag == v1::FAULT {
                    let mut entries = Vec::new();
                    loop {
                        let tag = decoder.read_u8()?;
                        if tag == v1::END {
                            break;
                        }
                        let key = decoder.read_tagged(tag)?;
                        let value = decoder.read_value()?;
                        entries.push((key, value));
                    }
                    Reply::Fault(fault_from_entries(entries)?)
                } else {
                    let value = decoder.read_tagged(tag)?;
                    decoder.expect_u8(v1::END, "reply terminator")?;
                    Reply::Success(value)
                }
            }
            Version::Hessian2 => {
                decoder.expect_u8(v2::FRAME, "reply frame")?;
                decoder.expect_version_marker(self.version.marker())?;
                let tag = decoder.read_u8()?;
                match tag {
                    v2::REPLY => Reply::Success(decoder.read_value()?),
                    v2::FAULT => {
                        let entries = match decoder.read_value()? {
                            Value::Map(map) => map.borrow().entries.clone(),
                            _ => {
                                return Err(ProtocolError::MalformedFault {
                                    reason: "fault body is not a map",
                                })
                            }
                        };
                        Reply::Fault(fault_from_entries(entries)?)
                    }
                    tag => {
                        return Err(ProtocolError::UnexpectedTag {
                            expected: "success or fault marker",
                            tag,
                        })
                    }
                }
            }
        };
        decoder.expect_end()?;
        self.state = match &reply {
            Reply::Success(_) => InvocationState::Resolved,
            Reply::Fault(_) => InvocationState::Faulted,
        };
        Ok(reply)
    }
}

/// Version 1 frames may carry header entries. They are never emitted
/// here and are skipped on decode. Returns the first tag after the
/// headers.
fn skip_headers(decoder: &mut Decoder<'_>) -> Result<u8, ProtocolError> {
    let mut tag = decoder.read_u8()?;
    while tag == v1::HEADER {
        let name = decoder.read_v1_name()?;
        let _value = decoder.read_value()?;
        tracing::warn!(header = %name, "ignoring frame header entry");
        tag = decoder.read_u8()?;
    }
    Ok(tag)
}

fn fault_from_entries(entries: Vec<(Value, Value)>) -> Result<Fault, ProtocolError> {
    let mut code = None;
    let mut message = None;
    let mut detail = None;
    for (key, value) in entries {
        let key = match key {
            Value::String(s) => (*s).clone(),
            // unknown or non-string keys are tolerated
            _ => continue,
        };
        match key.as_str() {
            "code" => match value {
                Value::String(s) => code = Some((*s).clone()),
                _ => {
                    return Err(ProtocolError::MalformedFault {
                        reason: "code is not a string",
                    })
                }
            },
            "message" => match value {
                Value::String(s) => message = Some((*s).clone()),
                _ => {
                    return Err(ProtocolError::MalformedFault {
                        reason: "message is not a string",
                    })
                }
            },
            "detail" => detail = Some(value),
            _ => {}
        }
    }
    Ok(Fault {
        code: code.ok_or(ProtocolError::MalformedFault {
            reason: "missing code",
        })?,
        message: message.ok_or(ProtocolError::MalformedFault {
            reason: "missing message",
        })?,
        detail,
    })
}
