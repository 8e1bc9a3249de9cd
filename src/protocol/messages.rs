use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use super::packet::{backend, frontend, Message};

/// SQLSTATE codes the pooler reports itself
pub mod sqlstate {
    pub const CONNECTION_FAILURE: &str = "08006";
    pub const PROTOCOL_VIOLATION: &str = "08P01";
    pub const FEATURE_NOT_SUPPORTED: &str = "0A000";
    pub const INVALID_PASSWORD: &str = "28P01";
    pub const INVALID_CATALOG_NAME: &str = "3D000";
    pub const TOO_MANY_CONNECTIONS: &str = "53300";
    pub const ADMIN_SHUTDOWN: &str = "57P01";
    pub const IDLE_SESSION_TIMEOUT: &str = "57P05";
}

/// Transaction status reported by ReadyForQuery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionStatus {
    #[default]
    Idle,
    InTransaction,
    Failed,
}

impl TransactionStatus {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            b'I' => Some(Self::Idle),
            b'T' => Some(Self::InTransaction),
            b'E' => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            Self::Idle => b'I',
            Self::InTransaction => b'T',
            Self::Failed => b'E',
        }
    }
}

/// Authentication request sent by a backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthRequest {
    Ok,
    CleartextPassword,
    Md5Password { salt: [u8; 4] },
    Sasl { mechanisms: Vec<String> },
    Other(i32),
}

impl AuthRequest {
    pub fn parse(payload: &[u8]) -> Option<Self> {
        let kind = read_i32(payload, 0)?;
        Some(match kind {
            0 => Self::Ok,
            3 => Self::CleartextPassword,
            5 => {
                let salt = payload.get(4..8)?;
                Self::Md5Password {
                    salt: [salt[0], salt[1], salt[2], salt[3]],
                }
            }
            10 => {
                let mechanisms = payload[4..]
                    .split(|&b| b == 0)
                    .filter(|m| !m.is_empty())
                    .map(|m| String::from_utf8_lossy(m).into_owned())
                    .collect();
                Self::Sasl { mechanisms }
            }
            other => Self::Other(other),
        })
    }
}

/// ErrorResponse fields relevant to the pooler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorResponse {
    pub severity: String,
    pub code: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            severity: "ERROR".to_string(),
            code: code.to_string(),
            message: message.into(),
        }
    }

    /// Error that terminates the session
    pub fn fatal(code: &str, message: impl Into<String>) -> Self {
        Self {
            severity: "FATAL".to_string(),
            ..Self::new(code, message)
        }
    }

    pub fn encode(&self) -> Message {
        let mut payload = BytesMut::new();
        for (field, value) in [
            (b'S', &self.severity),
            (b'V', &self.severity),
            (b'C', &self.code),
            (b'M', &self.message),
        ] {
            payload.put_u8(field);
            payload.put_slice(value.as_bytes());
            payload.put_u8(0);
        }
        payload.put_u8(0);
        Message::new(backend::ERROR_RESPONSE, payload.freeze())
    }

    pub fn parse(payload: &[u8]) -> Option<Self> {
        let mut severity = None;
        let mut code = None;
        let mut message = None;

        let mut rest = payload;
        while let Some((&field, tail)) = rest.split_first() {
            if field == 0 {
                break;
            }
            let end = tail.iter().position(|&b| b == 0)?;
            let value = String::from_utf8_lossy(&tail[..end]).into_owned();
            match field {
                b'S' => severity = Some(value),
                b'C' => code = Some(value),
                b'M' => message = Some(value),
                _ => {}
            }
            rest = &tail[end + 1..];
        }

        Some(Self {
            severity: severity.unwrap_or_else(|| "ERROR".to_string()),
            code: code?,
            message: message.unwrap_or_default(),
        })
    }
}

impl fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.severity, self.code, self.message)
    }
}

pub fn authentication_ok() -> Message {
    Message::new(backend::AUTHENTICATION, Bytes::from_static(&[0, 0, 0, 0]))
}

pub fn authentication_cleartext_password() -> Message {
    Message::new(backend::AUTHENTICATION, Bytes::from_static(&[0, 0, 0, 3]))
}

pub fn parameter_status(name: &str, value: &str) -> Message {
    let mut payload = BytesMut::with_capacity(name.len() + value.len() + 2);
    put_cstr(&mut payload, name);
    put_cstr(&mut payload, value);
    Message::new(backend::PARAMETER_STATUS, payload.freeze())
}

pub fn backend_key_data(process_id: i32, secret_key: i32) -> Message {
    let mut payload = BytesMut::with_capacity(8);
    payload.put_i32(process_id);
    payload.put_i32(secret_key);
    Message::new(backend::BACKEND_KEY_DATA, payload.freeze())
}

pub fn ready_for_query(status: TransactionStatus) -> Message {
    Message::new(backend::READY_FOR_QUERY, vec![status.as_byte()])
}

pub fn password_message(password: &str) -> Message {
    let mut payload = BytesMut::with_capacity(password.len() + 1);
    put_cstr(&mut payload, password);
    Message::new(frontend::PASSWORD, payload.freeze())
}

pub fn query(sql: &str) -> Message {
    let mut payload = BytesMut::with_capacity(sql.len() + 1);
    put_cstr(&mut payload, sql);
    Message::new(frontend::QUERY, payload.freeze())
}

pub fn terminate() -> Message {
    Message::new(frontend::TERMINATE, Bytes::new())
}

pub fn parse_ready_for_query(payload: &[u8]) -> Option<TransactionStatus> {
    payload.first().copied().and_then(TransactionStatus::from_byte)
}

pub fn parse_parameter_status(payload: &[u8]) -> Option<(String, String)> {
    let mut parts = payload.split(|&b| b == 0);
    let name = parts.next()?;
    let value = parts.next()?;
    Some((
        String::from_utf8_lossy(name).into_owned(),
        String::from_utf8_lossy(value).into_owned(),
    ))
}

pub fn parse_backend_key_data(payload: &[u8]) -> Option<(i32, i32)> {
    Some((read_i32(payload, 0)?, read_i32(payload, 4)?))
}

pub fn parse_password_message(payload: &[u8]) -> Option<String> {
    let end = payload.iter().position(|&b| b == 0)?;
    std::str::from_utf8(&payload[..end]).ok().map(str::to_string)
}

/// Response to an AuthenticationMD5Password request
pub fn md5_password(user: &str, password: &str, salt: [u8; 4]) -> String {
    let inner = md5::compute(format!("{password}{user}").as_bytes());
    let mut outer = format!("{inner:x}").into_bytes();
    outer.extend_from_slice(&salt);
    format!("md5{:x}", md5::compute(&outer))
}

fn put_cstr(dst: &mut BytesMut, s: &str) {
    dst.put_slice(s.as_bytes());
    dst.put_u8(0);
}

fn read_i32(data: &[u8], offset: usize) -> Option<i32> {
    let bytes = data.get(offset..offset + 4)?;
    Some(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}
