//! Inform notifications published by the adjacent session interceptor.
//!
//! Wire format, delivered on `<prefix>:<device id>`:
//!
//! ```json
//! {
//!   "acs_id": "0011AA-Router-SN1",
//!   "body": {
//!     "eventCodes": ["4 VALUE CHANGE"],
//!     "parameterList": [{"name": "Device.WiFi.SSID.1.SSID", "type": "xsd:string", "value": "home"}],
//!     "type": "cwmp:Inform"
//!   },
//!   "header": "optional"
//! }
//! ```

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use snafu::ResultExt;

use crate::ingest::error::DecodeSnafu;
use crate::ingest::error::InvalidParameterSnafu;
use crate::ingest::error::Result;

/// Separator between the channel prefix and the device id.
pub const CHANNEL_SEPARATOR: char = ':';

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InformEvent {
    pub acs_id: String,
    pub body: InformBody,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InformBody {
    pub event_codes: Vec<String>,
    pub parameter_list: Vec<InformParameter>,
    #[serde(rename = "type")]
    pub message_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InformParameter {
    pub name: String,
    #[serde(rename = "type")]
    pub value_type: String,
    /// Copied verbatim into the device record.
    pub value: Value,
}

impl InformEvent {
    /// Decode and validate a raw payload.
    ///
    /// Parameter names become dotted field paths, so empty segments and
    /// store operator characters are rejected up front.
    pub fn decode(payload: &str) -> Result<Self> {
        let event: InformEvent = serde_json::from_str(payload).context(DecodeSnafu)?;
        for param in &event.body.parameter_list {
            validate_parameter_name(&param.name)?;
        }
        Ok(event)
    }
}

fn validate_parameter_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return InvalidParameterSnafu {
            name,
            reason: "empty name",
        }
        .fail();
    }
    if name.split('.').any(str::is_empty) {
        return InvalidParameterSnafu {
            name,
            reason: "empty path segment",
        }
        .fail();
    }
    if name.contains('$') {
        return InvalidParameterSnafu {
            name,
            reason: "'$' is not allowed",
        }
        .fail();
    }
    Ok(())
}

/// Extract the device id from `<prefix>:<device id>`.
pub fn device_id_from_channel<'a>(prefix: &str, channel: &'a str) -> Option<&'a str> {
    channel
        .strip_prefix(prefix)?
        .strip_prefix(CHANNEL_SEPARATOR)
        .filter(|id| !id.is_empty())
}
