//! Module kinds known to both agents and the orchestrator.

use serde::{Deserialize, Serialize};

/// Closed set of hardware module kinds.
///
/// The wire name (`led`, `ndi`) is used for topic segments, config keys and
/// lease keys.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
    strum::IntoStaticStr,
    strum::EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ModuleKind {
    /// Lighting controller.
    Led,
    /// NDI video viewer/recorder backed by helper processes.
    Ndi,
}

impl ModuleKind {
    /// Wire name of the kind.
    pub fn as_str(self) -> &'static str {
        self.into()
    }

    /// Module actions the orchestrator forwards verbatim to devices.
    pub fn passthrough_actions(self) -> &'static [&'static str] {
        match self {
            Self::Led => &["off", "solid", "effect", "brightness"],
            Self::Ndi => &["start", "stop", "set_input", "record_start", "record_stop"],
        }
    }

    pub fn is_passthrough(self, action: &str) -> bool {
        self.passthrough_actions().contains(&action)
    }
}

/// Lease key guarding one module on one device.
pub fn lease_key(module: &str, device_id: &str) -> String {
    format!("{module}:{device_id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::str::FromStr;

    #[test]
    fn test_names_round_trip() {
        assert_eq!(ModuleKind::from_str("ndi").unwrap(), ModuleKind::Ndi);
        assert_eq!(ModuleKind::Led.to_string(), "led");
        assert!(ModuleKind::from_str("camera").is_err());
    }

    #[rstest]
    #[case(ModuleKind::Ndi, "record_start", true)]
    #[case(ModuleKind::Ndi, "solid", false)]
    #[case(ModuleKind::Led, "solid", true)]
    #[case(ModuleKind::Led, "reserve", false)]
    fn test_passthrough_sets(#[case] kind: ModuleKind, #[case] action: &str, #[case] expected: bool) {
        assert_eq!(kind.is_passthrough(action), expected);
    }

    #[test]
    fn test_lease_key() {
        assert_eq!(lease_key("ndi", "dev1"), "ndi:dev1");
    }
}
