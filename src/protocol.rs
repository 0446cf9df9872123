//! The client wire protocol: length-prefixed json frames over the unix
//! socket. Each request carries a verb with its fields; each response an
//! error code (0 = success), an optional message and a verb-specific
//! payload. The framing is the transport; everything interesting happens in
//! the dispatcher.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind, Result};

/// Frames above this size are rejected outright.
const MAX_FRAME: u32 = 16 << 20;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "verb", rename_all = "snake_case")]
pub enum Request {
    Create { name: String },
    Destroy { name: String },
    List,
    Start { name: String },
    Stop { name: String },
    Pause { name: String },
    Resume { name: String },
    Kill { name: String, signal: i32 },
    GetProperty { name: String, property: String },
    SetProperty { name: String, property: String, value: String },
    GetData { name: String, data: String },
    Get { names: Vec<String>, variables: Vec<String> },
    Plist,
    Dlist,
    Wait { names: Vec<String>, timeout_ms: Option<u64> },
    /// Debugging passthrough: a full request as text, dispatched in place.
    Raw { request: String },
    CreateVolume {
        path: Option<String>,
        properties: BTreeMap<String, String>,
    },
    DestroyVolume { path: String },
    LinkVolume { path: String, container: String },
    UnlinkVolume { path: String, container: String },
    ListVolumes,
    TuneVolume {
        path: String,
        properties: BTreeMap<String, String>,
    },
    ImportLayer {
        layer: String,
        tarball: String,
        merge: bool,
    },
    ExportLayer { volume: String, tarball: String },
    RemoveLayer { layer: String },
    ListLayers,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct VolumeDescription {
    pub path: String,
    pub backend: String,
    pub containers: Vec<String>,
    pub properties: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Response {
    /// Error kind code; zero is success.
    pub error: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volumes: Option<Vec<VolumeDescription>>,
    /// Get(multi) payload: container -> variable -> value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub map: Option<BTreeMap<String, BTreeMap<String, String>>>,
}

impl Response {
    pub fn ok() -> Response {
        Response::default()
    }

    pub fn value<T: Into<String>>(value: T) -> Response {
        Response {
            value: Some(value.into()),
            ..Response::default()
        }
    }

    pub fn list(list: Vec<String>) -> Response {
        Response {
            list: Some(list),
            ..Response::default()
        }
    }

    pub fn error(error: &Error) -> Response {
        Response {
            error: error.kind().code(),
            message: error.text().to_string(),
            ..Response::default()
        }
    }
}

impl From<Result<Response>> for Response {
    fn from(result: Result<Response>) -> Response {
        match result {
            Ok(response) => response,
            Err(e) => Response::error(&e),
        }
    }
}

pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, message: &T) -> Result<()> {
    let payload = serde_json::to_vec(message)
        .map_err(|e| Error::new(ErrorKind::Unknown, format!("encode: {}", e)))?;
    if payload.len() as u32 > MAX_FRAME {
        return Err(Error::new(ErrorKind::InvalidValue, "frame too large"));
    }
    writer.write_all(&(payload.len() as u32).to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.flush()?;
    Ok(())
}

/// None on a clean EOF between frames.
pub fn read_frame<R: Read, T: for<'de> Deserialize<'de>>(reader: &mut R) -> Result<Option<T>> {
    let mut len = [0u8; 4];
    match reader.read_exact(&mut len) {
        Ok(()) => {}
        Err(ref e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(len);
    if len > MAX_FRAME {
        return Err(Error::new(ErrorKind::InvalidValue, "frame too large"));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload)?;
    serde_json::from_slice(&payload)
        .map(Some)
        .map_err(|e| Error::new(ErrorKind::InvalidValue, format!("decode: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_frames_round_trip() {
        let requests = vec![
            Request::Create {
                name: "a".to_string(),
            },
            Request::SetProperty {
                name: "a".to_string(),
                property: "command".to_string(),
                value: "sleep 1000".to_string(),
            },
            Request::Wait {
                names: vec!["a*".to_string()],
                timeout_ms: Some(5000),
            },
            Request::CreateVolume {
                path: None,
                properties: vec![("backend".to_string(), "plain".to_string())]
                    .into_iter()
                    .collect(),
            },
        ];
        let mut buf = vec![];
        for request in &requests {
            write_frame(&mut buf, request).unwrap();
        }
        let mut cursor = std::io::Cursor::new(buf);
        for request in &requests {
            let decoded: Request = read_frame(&mut cursor).unwrap().unwrap();
            assert_eq!(decoded, *request);
        }
        assert!(read_frame::<_, Request>(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn response_success_is_zero() {
        let response = Response::ok();
        assert_eq!(response.error, 0);
        let encoded = serde_json::to_string(&response).unwrap();
        assert!(!encoded.contains("message"));
    }

    #[test]
    fn error_response_carries_kind() {
        let e = Error::new(ErrorKind::ContainerDoesNotExist, "no such container");
        let response = Response::error(&e);
        assert_eq!(response.error, ErrorKind::ContainerDoesNotExist.code());
        assert_eq!(response.message, "no such container");
    }

    #[test]
    fn oversized_frames_are_rejected() {
        let mut buf = vec![];
        buf.extend_from_slice(&(MAX_FRAME + 1).to_le_bytes());
        let mut cursor = std::io::Cursor::new(buf);
        assert!(read_frame::<_, Request>(&mut cursor).is_err());
    }
}
