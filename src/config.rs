//! `SystemDefinition` (design §6 "Persisted state"): the boundary struct
//! standing in for the original XML project file, loaded here from TOML via
//! `serde`/`toml`.

use crate::error::{Error, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlashloaderKind {
    OpenSyde,
    Stw,
    None,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InterfaceConfig {
    pub bus: Option<u8>,
    #[serde(default)]
    pub routing_enabled: bool,
    #[serde(default)]
    pub update_enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    pub name: String,
    pub flashloader: FlashloaderKind,
    #[serde(default)]
    pub interfaces: Vec<InterfaceConfig>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct StwResetMessage {
    pub id: u32,
    pub xtd: bool,
    pub dlc: u8,
    pub data: [u8; 8],
}

/// Indexes into [`SystemDefinition::flashloader_reset_wait_times`] (design §6,
/// §4.3 "typed by `{no-changes, no-fundamental-com-changes,
/// fundamental-com-changes} x {CAN, Ethernet}`").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetWaitKind {
    NoChangesCan = 0,
    NoChangesEthernet = 1,
    NoFundamentalComChangesCan = 2,
    NoFundamentalComChangesEthernet = 3,
    FundamentalComChangesCan = 4,
    FundamentalComChangesEthernet = 5,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SystemDefinition {
    pub node: Vec<NodeConfig>,
    pub stw_reset_message: Option<StwResetMessage>,
    pub flashloader_reset_wait_times: [u32; 6],
}

impl SystemDefinition {
    pub fn load(path: &str) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::SysDef(e.to_string()))
    }

    pub fn reset_wait_time_ms(&self, kind: ResetWaitKind) -> u32 {
        self.flashloader_reset_wait_times[kind as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> &'static str {
        r#"
            flashloader_reset_wait_times = [500, 500, 1000, 1000, 2000, 2000]

            [[node]]
            name = "ECU1"
            flashloader = "OPEN_SYDE"

            [[node.interfaces]]
            bus = 0
            routing_enabled = true
            update_enabled = true
        "#
    }

    #[test]
    fn parses_nodes_and_wait_times() {
        let def = SystemDefinition::parse(sample()).unwrap();
        assert_eq!(def.node.len(), 1);
        assert_eq!(def.node[0].flashloader, FlashloaderKind::OpenSyde);
        assert_eq!(def.reset_wait_time_ms(ResetWaitKind::FundamentalComChangesEthernet), 2000);
    }

    #[test]
    fn malformed_toml_is_a_sysdef_error() {
        assert!(matches!(SystemDefinition::parse("not = [valid"), Err(Error::SysDef(_))));
    }
}
