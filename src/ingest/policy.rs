//! Which parameters an inform event may touch, and under what guard.
//!
//! The ingestor is a secondary writer racing the protocol engine, so it only
//! touches the `{_value, _type, _timestamp}` leaves of a parameter and never
//! creates a device record. Two knobs narrow it further:
//!
//! - `name_suffix` keeps only parameters whose name ends with the suffix
//! - `existence_gate` decides whether every targeted leaf must already exist
//!
//! With [`ExistenceGate::AllLeaves`] the whole event is one conditional write:
//! if any targeted leaf is missing, nothing is written.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::api::UpdateRequest;
use crate::ingest::event::InformEvent;
use crate::ingest::event::InformParameter;

pub const VALUE_FIELD: &str = "_value";
pub const TYPE_FIELD: &str = "_type";
pub const TIMESTAMP_FIELD: &str = crate::api::TIMESTAMP_LEAF;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExistenceGate {
    /// Every targeted `_value`, `_type` and `_timestamp` leaf must exist.
    #[default]
    AllLeaves,
    /// Only the device record must exist; missing leaves are created.
    RecordOnly,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IngestPolicy {
    /// Keep only parameters whose name ends with this suffix.
    pub name_suffix: Option<String>,
    pub existence_gate: ExistenceGate,
}

impl IngestPolicy {
    pub fn admits(&self, param: &InformParameter) -> bool {
        self.name_suffix.as_deref().is_none_or(|suffix| param.name.ends_with(suffix))
    }

    /// Build the conditional update for `event`, or `None` if the policy
    /// filters out every parameter.
    ///
    /// `timestamp_ms` is the processing time; payloads carry no timestamp.
    pub fn plan(&self, device_id: &str, event: &InformEvent, timestamp_ms: u64) -> Option<UpdateRequest> {
        let admitted: Vec<&InformParameter> =
            event.body.parameter_list.iter().filter(|param| self.admits(param)).collect();
        if admitted.is_empty() {
            return None;
        }

        let mut required_fields = Vec::new();
        let mut set_fields = Vec::with_capacity(admitted.len() * 3);
        for param in admitted {
            let value_path = leaf_path(&param.name, VALUE_FIELD);
            let type_path = leaf_path(&param.name, TYPE_FIELD);
            let timestamp_path = leaf_path(&param.name, TIMESTAMP_FIELD);

            if self.existence_gate == ExistenceGate::AllLeaves {
                required_fields.extend([value_path.clone(), type_path.clone(), timestamp_path.clone()]);
            }

            set_fields.push((value_path, param.value.clone()));
            set_fields.push((type_path, Value::String(param.value_type.clone())));
            set_fields.push((timestamp_path, Value::from(timestamp_ms)));
        }

        Some(UpdateRequest {
            device_id: device_id.to_string(),
            required_fields,
            set_fields,
        })
    }
}

fn leaf_path(name: &str, leaf: &str) -> String {
    format!("{name}.{leaf}")
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::ingest::event::InformBody;

    fn event(names: &[&str]) -> InformEvent {
        InformEvent {
            acs_id: "dev-1".into(),
            body: InformBody {
                event_codes: vec!["4 VALUE CHANGE".into()],
                parameter_list: names
                    .iter()
                    .map(|name| InformParameter {
                        name: (*name).to_string(),
                        value_type: "xsd:string".into(),
                        value: json!("v"),
                    })
                    .collect(),
                message_type: "cwmp:Inform".into(),
            },
            header: None,
        }
    }

    #[test]
    fn test_default_policy_gates_every_leaf() {
        let update = IngestPolicy::default().plan("dev-1", &event(&["A.B"]), 42).unwrap();
        assert_eq!(update.device_id, "dev-1");
        assert_eq!(update.required_fields, vec!["A.B._value", "A.B._type", "A.B._timestamp"]);
        assert_eq!(
            update.set_fields,
            vec![
                ("A.B._value".to_string(), json!("v")),
                ("A.B._type".to_string(), json!("xsd:string")),
                ("A.B._timestamp".to_string(), json!(42)),
            ]
        );
    }

    #[test]
    fn test_record_only_gate_requires_nothing() {
        let policy = IngestPolicy {
            existence_gate: ExistenceGate::RecordOnly,
            ..Default::default()
        };
        let update = policy.plan("dev-1", &event(&["A", "B"]), 1).unwrap();
        assert!(update.required_fields.is_empty());
        assert_eq!(update.set_fields.len(), 6);
    }

    #[test]
    fn test_suffix_filter() {
        let policy = IngestPolicy {
            name_suffix: Some("ConnectionRequestURL".into()),
            ..Default::default()
        };
        let update = policy
            .plan("dev-1", &event(&["Device.ManagementServer.ConnectionRequestURL", "Device.WiFi.SSID"]), 1)
            .unwrap();
        assert!(update.set_fields.iter().all(|(path, _)| path.contains("ConnectionRequestURL")));

        assert!(policy.plan("dev-1", &event(&["Device.WiFi.SSID"]), 1).is_none());
    }

    #[test]
    fn test_empty_parameter_list_plans_nothing() {
        assert!(IngestPolicy::default().plan("dev-1", &event(&[]), 1).is_none());
    }
}
