use bytes::{BufMut, BytesMut};

/// Protocol version 3.0
pub const PROTOCOL_VERSION_3: i32 = 196_608;
pub const SSL_REQUEST_CODE: i32 = 80_877_103;
pub const GSSENC_REQUEST_CODE: i32 = 80_877_104;
pub const CANCEL_REQUEST_CODE: i32 = 80_877_102;

/// Errors while interpreting a startup packet
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StartupError {
    #[error("startup packet truncated")]
    Truncated,

    #[error("unsupported frontend protocol {major}.{minor}")]
    UnsupportedVersion { major: i32, minor: i32 },

    #[error("no PostgreSQL user name specified in startup packet")]
    MissingUser,

    #[error("startup packet is not valid UTF-8")]
    InvalidUtf8,
}

/// First packet a client sends
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartupRequest {
    Startup(StartupMessage),
    SslRequest,
    GssEncRequest,
    Cancel { process_id: i32, secret_key: i32 },
}

impl StartupRequest {
    /// Parse a startup packet body (length prefix already stripped)
    pub fn parse(body: &[u8]) -> Result<Self, StartupError> {
        if body.len() < 4 {
            return Err(StartupError::Truncated);
        }
        let code = i32::from_be_bytes([body[0], body[1], body[2], body[3]]);
        let rest = &body[4..];

        match code {
            SSL_REQUEST_CODE => Ok(Self::SslRequest),
            GSSENC_REQUEST_CODE => Ok(Self::GssEncRequest),
            CANCEL_REQUEST_CODE => {
                if rest.len() < 8 {
                    return Err(StartupError::Truncated);
                }
                Ok(Self::Cancel {
                    process_id: i32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]),
                    secret_key: i32::from_be_bytes([rest[4], rest[5], rest[6], rest[7]]),
                })
            }
            version => {
                let major = version >> 16;
                if major != 3 {
                    return Err(StartupError::UnsupportedVersion {
                        major,
                        minor: version & 0xFFFF,
                    });
                }
                let params = parse_params(rest)?;
                let message = StartupMessage {
                    protocol_version: version,
                    params,
                };
                if message.param("user").map_or(true, str::is_empty) {
                    return Err(StartupError::MissingUser);
                }
                Ok(Self::Startup(message))
            }
        }
    }
}

/// StartupMessage: protocol version and key/value parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupMessage {
    pub protocol_version: i32,
    pub params: Vec<(String, String)>,
}

impl StartupMessage {
    /// Build a v3 startup message for connecting to a backend
    pub fn new(user: &str, database: &str) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION_3,
            params: vec![
                ("user".to_string(), user.to_string()),
                ("database".to_string(), database.to_string()),
            ],
        }
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn user(&self) -> &str {
        self.param("user").unwrap_or_default()
    }

    /// Database defaults to the user name when omitted
    pub fn database(&self) -> &str {
        match self.param("database") {
            Some(db) if !db.is_empty() => db,
            _ => self.user(),
        }
    }

    /// Encode with the length prefix, ready to write to a socket
    pub fn encode(&self) -> BytesMut {
        let mut body = BytesMut::new();
        body.put_i32(self.protocol_version);
        for (k, v) in &self.params {
            body.put_slice(k.as_bytes());
            body.put_u8(0);
            body.put_slice(v.as_bytes());
            body.put_u8(0);
        }
        body.put_u8(0);

        let mut out = BytesMut::with_capacity(body.len() + 4);
        out.put_i32((body.len() + 4) as i32);
        out.extend_from_slice(&body);
        out
    }
}

fn parse_params(mut data: &[u8]) -> Result<Vec<(String, String)>, StartupError> {
    let mut params = Vec::new();
    loop {
        let key = read_cstr(&mut data)?;
        if key.is_empty() {
            break;
        }
        let value = read_cstr(&mut data)?;
        params.push((key, value));
    }
    Ok(params)
}

fn read_cstr(data: &mut &[u8]) -> Result<String, StartupError> {
    let end = data
        .iter()
        .position(|&b| b == 0)
        .ok_or(StartupError::Truncated)?;
    let s = std::str::from_utf8(&data[..end])
        .map_err(|_| StartupError::InvalidUtf8)?
        .to_string();
    *data = &data[end + 1..];
    Ok(s)
}
