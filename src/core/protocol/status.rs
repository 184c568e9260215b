// src/core/protocol/status.rs

//! LLRP status codes and the LLRPStatus parameter carried by responses.

use strum_macros::Display;

/// The message-level subset of the LLRP status code space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum StatusCode {
    #[strum(serialize = "M_Success")]
    MSuccess,
    #[strum(serialize = "M_ParameterError")]
    MParameterError,
    #[strum(serialize = "M_FieldError")]
    MFieldError,
    #[strum(serialize = "M_UnsupportedMessage")]
    MUnsupportedMessage,
    #[strum(serialize = "M_UnsupportedVersion")]
    MUnsupportedVersion,
    #[strum(serialize = "M_UnsupportedParameter")]
    MUnsupportedParameter,
    #[strum(serialize = "R_DeviceError")]
    RDeviceError,
}

impl StatusCode {
    pub fn as_u16(self) -> u16 {
        match self {
            StatusCode::MSuccess => 0,
            StatusCode::MParameterError => 100,
            StatusCode::MFieldError => 101,
            StatusCode::MUnsupportedMessage => 109,
            StatusCode::MUnsupportedVersion => 110,
            StatusCode::MUnsupportedParameter => 111,
            StatusCode::RDeviceError => 401,
        }
    }

    pub fn from_u16(raw: u16) -> Option<Self> {
        match raw {
            0 => Some(StatusCode::MSuccess),
            100 => Some(StatusCode::MParameterError),
            101 => Some(StatusCode::MFieldError),
            109 => Some(StatusCode::MUnsupportedMessage),
            110 => Some(StatusCode::MUnsupportedVersion),
            111 => Some(StatusCode::MUnsupportedParameter),
            401 => Some(StatusCode::RDeviceError),
            _ => None,
        }
    }
}

/// The LLRPStatus parameter: a status code plus a human-readable description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LlrpStatus {
    pub code: StatusCode,
    pub description: String,
}

impl LlrpStatus {
    pub fn success() -> Self {
        Self {
            code: StatusCode::MSuccess,
            description: String::new(),
        }
    }

    pub fn new(code: StatusCode, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == StatusCode::MSuccess
    }
}
