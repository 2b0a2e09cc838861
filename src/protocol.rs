//! Charging station wire codec
//!
//! Commands are short text lines (`report 2`, `ena 1`, `curr 16000`). Answers
//! arrive on the same UDP port as unsolicited broadcasts and come in three
//! shapes: the `TCH-OK :done` / `TCH-ERR` sentinels, a JSON object, or a legacy
//! `Key: k=v;k=v` text line. [`decode`] turns any of them into a [`Response`];
//! [`Expectation`] decides whether a response answers the command in flight.

use crate::error::{HeliosError, Result};
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;

/// Field map of a decoded report
pub type Fields = Map<String, Value>;

const ACK_SENTINEL: &str = "TCH-OK";
const ERR_SENTINEL: &str = "TCH-ERR";

/// Report numbers understood by the charging station
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ReportId {
    /// Product, serial and firmware
    Info = 1,
    /// State, plug, enable, max current, digital input
    Status = 2,
    /// Per-phase electrical values and energy counters
    Metering = 3,
}

impl ReportId {
    pub fn number(self) -> u8 {
        self as u8
    }

    /// Keys that only appear in this report. Broadcasts share `State`, `Plug`
    /// and `E pres` with reports 2 and 3 but never carry an `ID`.
    fn unique_keys(self) -> &'static [&'static str] {
        match self {
            ReportId::Info => &["Product", "Serial", "Firmware"],
            ReportId::Status => &["State", "Plug", "Max curr"],
            ReportId::Metering => &["U1", "I1", "P", "E total"],
        }
    }
}

/// Outgoing command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceCommand {
    Report(ReportId),
    Enable(bool),
    /// Charging current in milliamps
    Current(u32),
}

impl DeviceCommand {
    /// Current command from whole amperes
    pub fn current_ampere(ampere: u32) -> Self {
        DeviceCommand::Current(ampere.saturating_mul(1000))
    }

    /// Text sent on the wire, without the line terminator
    pub fn to_wire(&self) -> String {
        match self {
            DeviceCommand::Report(id) => format!("report {}", id.number()),
            DeviceCommand::Enable(on) => format!("ena {}", u8::from(*on)),
            DeviceCommand::Current(ma) => format!("curr {}", ma),
        }
    }

    /// What an answer to this command must look like
    pub fn expectation(&self) -> Expectation {
        match self {
            DeviceCommand::Report(id) => Expectation::Report(*id),
            DeviceCommand::Enable(_) | DeviceCommand::Current(_) => Expectation::Acknowledgment,
        }
    }
}

impl fmt::Display for DeviceCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_wire())
    }
}

/// Decoded datagram
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Acknowledged,
    Rejected(String),
    Report { id: Option<u8>, fields: Fields },
    Unrecognized(String),
}

impl Response {
    /// Fields of a report, empty for every other shape
    pub fn fields(&self) -> Option<&Fields> {
        match self {
            Response::Report { fields, .. } => Some(fields),
            _ => None,
        }
    }
}

/// Decode a raw datagram
pub fn decode(datagram: &[u8]) -> Response {
    let text = String::from_utf8_lossy(datagram);
    let text = text.trim_matches(|c: char| c.is_whitespace() || c == '\0');

    if text.starts_with(ACK_SENTINEL) {
        return Response::Acknowledged;
    }
    if text.starts_with(ERR_SENTINEL) {
        return Response::Rejected(text.to_string());
    }
    if text.starts_with('{') {
        return match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(fields)) => report_from_fields(fields),
            _ => Response::Unrecognized(text.to_string()),
        };
    }
    match decode_legacy(text) {
        Some(fields) => report_from_fields(fields),
        None => Response::Unrecognized(text.to_string()),
    }
}

fn report_from_fields(fields: Fields) -> Response {
    let id = fields.get("ID").and_then(value_as_u64).and_then(|v| u8::try_from(v).ok());
    Response::Report { id, fields }
}

/// Parse `Key: k=v;k=v` (the leading tag is optional). Numeric values become
/// JSON numbers.
fn decode_legacy(text: &str) -> Option<Fields> {
    let body = match (text.find(':'), text.find('=')) {
        (Some(colon), Some(eq)) if colon < eq => &text[colon + 1..],
        _ => text,
    };

    let mut fields = Fields::new();
    for pair in body.split([';', '\n']) {
        let Some((key, value)) = pair.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value.trim();
        let parsed = if let Ok(n) = value.parse::<i64>() {
            Value::from(n)
        } else if let Ok(n) = value.parse::<f64>() {
            Value::from(n)
        } else {
            Value::from(value)
        };
        fields.insert(key.to_string(), parsed);
    }
    if fields.is_empty() { None } else { Some(fields) }
}

fn value_as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn value_as_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Shape an answer to the in-flight command must have
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expectation {
    /// `ena`/`curr`: either sentinel
    Acknowledgment,
    /// `report N`: same ID plus at least one key unique to report N
    Report(ReportId),
}

impl Expectation {
    pub fn matches(&self, response: &Response) -> bool {
        match (self, response) {
            (Expectation::Acknowledgment, Response::Acknowledged | Response::Rejected(_)) => true,
            (Expectation::Report(want), Response::Report { id, fields }) => {
                *id == Some(want.number())
                    && want.unique_keys().iter().any(|k| fields.contains_key(*k))
            }
            _ => false,
        }
    }
}

fn require_u64(fields: &Fields, key: &str, report: ReportId) -> Result<u64> {
    fields.get(key).and_then(value_as_u64).ok_or_else(|| {
        HeliosError::protocol_mismatch(format!(
            "report {} is missing numeric field '{}'",
            report.number(),
            key
        ))
    })
}

fn optional_u64(fields: &Fields, key: &str) -> u64 {
    fields.get(key).and_then(value_as_u64).unwrap_or(0)
}

/// Report 1
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Report1 {
    pub product: String,
    pub serial: String,
    pub firmware: String,
}

impl Report1 {
    pub fn from_fields(fields: &Fields) -> Result<Self> {
        let get = |key: &str| fields.get(key).map(value_as_string).unwrap_or_default();
        if !ReportId::Info.unique_keys().iter().any(|k| fields.contains_key(*k)) {
            return Err(HeliosError::protocol_mismatch("report 1 carries no identity fields"));
        }
        Ok(Self {
            product: get("Product"),
            serial: get("Serial"),
            firmware: get("Firmware"),
        })
    }
}

/// Report 2
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Report2 {
    /// 0 starting, 1 not ready, 2 ready, 3 charging, 4 error, 5 interrupted
    pub state: u8,
    /// Bit field: 1 cable at station, 2 locked, 4 cable at vehicle
    pub plug: u8,
    pub enable_sys: bool,
    /// Current the station currently signals to the vehicle (mA). Follows the
    /// last `curr` command, 0 when unknown.
    pub max_curr_ma: u32,
    /// Hardware current limit set by the installer (mA), if reported
    pub curr_hw_ma: Option<u32>,
    pub input: u8,
}

fn checked_u8(
    value: u64,
    key: &str,
    report: ReportId,
    allowed: impl Fn(u8) -> bool,
) -> Result<u8> {
    u8::try_from(value)
        .ok()
        .filter(|v| allowed(*v))
        .ok_or_else(|| {
            HeliosError::protocol_mismatch(format!(
                "report {} field '{}' out of range: {}",
                report.number(),
                key,
                value
            ))
        })
}

impl Report2 {
    pub const STATE_CHARGING: u8 = 3;

    pub fn from_fields(fields: &Fields) -> Result<Self> {
        let report = ReportId::Status;
        let state = checked_u8(require_u64(fields, "State", report)?, "State", report, |v| {
            v <= 5
        })?;
        let plug = checked_u8(require_u64(fields, "Plug", report)?, "Plug", report, |v| {
            matches!(v, 0 | 1 | 3 | 5 | 7)
        })?;
        let input = match fields.get("Input").and_then(value_as_u64) {
            Some(raw) => checked_u8(raw, "Input", report, |v| v <= 1)?,
            None => 0,
        };
        Ok(Self {
            state,
            plug,
            enable_sys: optional_u64(fields, "Enable sys") != 0,
            max_curr_ma: u32::try_from(optional_u64(fields, "Max curr")).unwrap_or(u32::MAX),
            curr_hw_ma: fields
                .get("Curr HW")
                .and_then(value_as_u64)
                .and_then(|v| u32::try_from(v).ok())
                .filter(|v| *v > 0),
            input,
        })
    }

    pub fn is_charging(&self) -> bool {
        self.state == Self::STATE_CHARGING
    }
}

/// Report 3
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Report3 {
    /// Per-phase voltage (V)
    pub voltages: [u32; 3],
    /// Per-phase current (mA)
    pub currents_ma: [u32; 3],
    /// Active power (mW)
    pub power_mw: u64,
    /// Session energy (Wh)
    pub energy_session_wh: u64,
    /// Meter total (Wh)
    pub energy_total_wh: u64,
}

impl Report3 {
    pub fn from_fields(fields: &Fields) -> Result<Self> {
        let report = ReportId::Metering;
        let phase = |prefix: &str| -> [u32; 3] {
            [1, 2, 3].map(|n| optional_u64(fields, &format!("{}{}", prefix, n)) as u32)
        };
        Ok(Self {
            voltages: phase("U"),
            currents_ma: phase("I"),
            power_mw: require_u64(fields, "P", report)?,
            energy_session_wh: optional_u64(fields, "E pres"),
            energy_total_wh: optional_u64(fields, "E total"),
        })
    }

    pub fn power_watt(&self) -> f64 {
        self.power_mw as f64 / 1000.0
    }

    /// Phases drawing more than `threshold_ma`
    pub fn active_phases(&self, threshold_ma: u32) -> usize {
        self.currents_ma.iter().filter(|i| **i > threshold_ma).count()
    }
}

/// Unsolicited state-change datagram
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BroadcastEvent {
    pub input: Option<u8>,
    pub plug: Option<u8>,
    pub state: Option<u8>,
    pub energy_session_wh: Option<u64>,
}

impl BroadcastEvent {
    /// Interpret a datagram that did not answer a request. Reports carrying an
    /// `ID` are late answers, not broadcasts.
    pub fn from_response(response: &Response) -> Option<Self> {
        let Response::Report { id: None, fields } = response else {
            return None;
        };
        let small = |key: &str| {
            fields
                .get(key)
                .and_then(value_as_u64)
                .and_then(|v| u8::try_from(v).ok())
        };
        let event = Self {
            input: small("Input"),
            plug: small("Plug"),
            state: small("State"),
            energy_session_wh: fields.get("E pres").and_then(value_as_u64),
        };
        if event == Self::default() { None } else { Some(event) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_wire_format() {
        assert_eq!(DeviceCommand::Report(ReportId::Status).to_wire(), "report 2");
        assert_eq!(DeviceCommand::Enable(true).to_wire(), "ena 1");
        assert_eq!(DeviceCommand::Enable(false).to_wire(), "ena 0");
        assert_eq!(DeviceCommand::current_ampere(16).to_wire(), "curr 16000");
    }

    #[test]
    fn decodes_sentinels() {
        assert_eq!(decode(b"TCH-OK :done\n"), Response::Acknowledged);
        assert!(matches!(decode(b"TCH-ERR"), Response::Rejected(_)));
    }

    #[test]
    fn decodes_json_report() {
        let raw = br#"{"ID": "2", "State": 3, "Plug": 7, "Enable sys": 1, "Max curr": 16000, "Input": 0}"#;
        let response = decode(raw);
        assert!(Expectation::Report(ReportId::Status).matches(&response));
        let report = Report2::from_fields(response.fields().unwrap()).unwrap();
        assert!(report.is_charging());
        assert_eq!(report.max_curr_ma, 16000);
        assert_eq!(report.curr_hw_ma, None);
        assert!(report.enable_sys);
    }

    #[test]
    fn report2_reads_hardware_limit() {
        let response = decode(br#"{"ID": "2", "State": 2, "Plug": 1, "Max curr": 6000, "Curr HW": 20000}"#);
        let report = Report2::from_fields(response.fields().unwrap()).unwrap();
        assert_eq!(report.max_curr_ma, 6000);
        assert_eq!(report.curr_hw_ma, Some(20000));
    }

    #[test]
    fn report2_rejects_out_of_range_values() {
        let cases: [&[u8]; 5] = [
            br#"{"ID": "2", "State": 259, "Plug": 7}"#,
            br#"{"ID": "2", "State": 6, "Plug": 7}"#,
            br#"{"ID": "2", "State": 2, "Plug": 2}"#,
            br#"{"ID": "2", "State": 2, "Plug": 263}"#,
            br#"{"ID": "2", "State": 2, "Plug": 7, "Input": 2}"#,
        ];
        for raw in cases {
            let response = decode(raw);
            assert!(
                matches!(
                    Report2::from_fields(response.fields().unwrap()),
                    Err(HeliosError::ProtocolMismatch { .. })
                ),
                "accepted {}",
                String::from_utf8_lossy(raw)
            );
        }
    }

    #[test]
    fn decodes_legacy_report() {
        let response = decode(b"Report: ID=3;U1=230;U2=231;U3=229;I1=6000;I2=5900;I3=6100;P=4140000;E pres=1200");
        assert!(Expectation::Report(ReportId::Metering).matches(&response));
        let report = Report3::from_fields(response.fields().unwrap()).unwrap();
        assert_eq!(report.currents_ma, [6000, 5900, 6100]);
        assert_eq!(report.active_phases(1000), 3);
        assert!((report.power_watt() - 4140.0).abs() < 1e-9);
    }

    #[test]
    fn broadcast_does_not_answer_report_request() {
        let response = decode(br#"{"State": 2}"#);
        assert!(!Expectation::Report(ReportId::Status).matches(&response));
        assert!(!Expectation::Acknowledgment.matches(&response));
        let event = BroadcastEvent::from_response(&response).unwrap();
        assert_eq!(event.state, Some(2));
        assert_eq!(event.input, None);
    }

    #[test]
    fn wrong_report_id_is_not_a_match() {
        let response = decode(br#"{"ID": "3", "State": 3, "Plug": 7}"#);
        assert!(!Expectation::Report(ReportId::Status).matches(&response));
    }

    #[test]
    fn garbage_is_unrecognized() {
        assert!(matches!(decode(b"hello"), Response::Unrecognized(_)));
        assert!(matches!(decode(b"{not json"), Response::Unrecognized(_)));
        assert!(matches!(decode(&[0xff, 0xfe]), Response::Unrecognized(_)));
    }

    #[test]
    fn report2_requires_state() {
        let response = decode(br#"{"ID": "2", "Max curr": 16000}"#);
        assert!(matches!(
            Report2::from_fields(response.fields().unwrap()),
            Err(HeliosError::ProtocolMismatch { .. })
        ));
    }
}
