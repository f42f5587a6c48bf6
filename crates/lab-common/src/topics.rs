//! Topic namespace shared by devices and the orchestrator.
//!
//! All producers and consumers build topic strings through these helpers so
//! the namespace stays consistent on both sides of the bus.

/// Root of the lab namespace.
pub const LAB_PREFIX: &str = "/lab";

/// Retained registry snapshot published by the orchestrator.
pub const REGISTRY: &str = "/lab/orchestrator/registry";

/// Retained liveness document of a device.
pub fn device_status(device_id: &str) -> String {
    format!("{LAB_PREFIX}/device/{device_id}/status")
}

/// Retained capability/meta document of a device.
pub fn device_meta(device_id: &str) -> String {
    format!("{LAB_PREFIX}/device/{device_id}/meta")
}

/// Device-level administrative commands.
pub fn device_cmd(device_id: &str) -> String {
    format!("{LAB_PREFIX}/device/{device_id}/cmd")
}

/// Acks for device-level commands.
pub fn device_evt(device_id: &str) -> String {
    format!("{LAB_PREFIX}/device/{device_id}/evt")
}

pub fn module_cmd(device_id: &str, module: &str) -> String {
    format!("{LAB_PREFIX}/devices/{device_id}/{module}/cmd")
}

pub fn module_cfg(device_id: &str, module: &str) -> String {
    format!("{LAB_PREFIX}/devices/{device_id}/{module}/cfg")
}

pub fn module_status(device_id: &str, module: &str) -> String {
    format!("{LAB_PREFIX}/devices/{device_id}/{module}/status")
}

pub fn module_evt(device_id: &str, module: &str) -> String {
    format!("{LAB_PREFIX}/devices/{device_id}/{module}/evt")
}

/// Orchestrator-level command topic owned by one plugin.
pub fn orch_cmd(module: &str) -> String {
    format!("{LAB_PREFIX}/orchestrator/{module}/cmd")
}

/// Orchestrator-level ack topic of one plugin.
pub fn orch_evt(module: &str) -> String {
    format!("{LAB_PREFIX}/orchestrator/{module}/evt")
}

/// Filters matching every device's meta and liveness documents.
pub fn device_announcement_filters() -> Vec<String> {
    vec![
        format!("{LAB_PREFIX}/device/+/meta"),
        format!("{LAB_PREFIX}/device/+/status"),
    ]
}

/// A topic under `/lab/devices/{device}/{module}/{leaf}` split into its parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleTopic<'a> {
    pub device_id: &'a str,
    pub module: &'a str,
    pub leaf: &'a str,
}

/// Split a per-module topic into device, module and leaf.
///
/// Returns `None` for anything outside the per-module namespace.
pub fn parse_module_topic(topic: &str) -> Option<ModuleTopic<'_>> {
    let rest = topic.strip_prefix(LAB_PREFIX)?.strip_prefix("/devices/")?;
    let mut parts = rest.split('/');
    let device_id = parts.next()?;
    let module = parts.next()?;
    let leaf = parts.next()?;
    if parts.next().is_some() || device_id.is_empty() || module.is_empty() {
        return None;
    }
    Some(ModuleTopic {
        device_id,
        module,
        leaf,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_topic_shapes() {
        assert_eq!(device_status("dev1"), "/lab/device/dev1/status");
        assert_eq!(device_meta("dev1"), "/lab/device/dev1/meta");
        assert_eq!(device_cmd("dev1"), "/lab/device/dev1/cmd");
        assert_eq!(module_cmd("dev1", "ndi"), "/lab/devices/dev1/ndi/cmd");
        assert_eq!(module_cfg("dev1", "led"), "/lab/devices/dev1/led/cfg");
        assert_eq!(orch_cmd("ndi"), "/lab/orchestrator/ndi/cmd");
        assert_eq!(orch_evt("led"), "/lab/orchestrator/led/evt");
    }

    #[test]
    fn test_parse_module_topic() {
        let parsed = parse_module_topic("/lab/devices/dev1/ndi/cmd").unwrap();
        assert_eq!(parsed.device_id, "dev1");
        assert_eq!(parsed.module, "ndi");
        assert_eq!(parsed.leaf, "cmd");
    }

    #[rstest]
    #[case("/lab/device/dev1/cmd")]
    #[case("/lab/devices/dev1/ndi/cmd/extra")]
    #[case("/lab/devices/dev1/ndi")]
    fn test_parse_module_topic_rejects(#[case] topic: &str) {
        assert!(parse_module_topic(topic).is_none());
    }
}
