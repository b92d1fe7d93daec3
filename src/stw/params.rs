//! Hex-download sequencer parameters (design §4.1), supplemented from
//! `CXFLFlashWriteParameters.cpp`'s INI-backed parameter bag as `StwWriteParams`
//! with round-trip INI helpers (design §3.1, tested by §8 "round-trip/idempotence").

use crate::error::{Error, Result};
use std::fmt::Write as _;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EraseMode {
    Automatic,
    UserDefined,
    #[cfg(feature = "legacy-sector-tables")]
    CApplication,
    #[cfg(feature = "legacy-sector-tables")]
    CanOpenConfig,
    #[cfg(feature = "legacy-sector-tables")]
    IecApp,
    #[cfg(feature = "legacy-sector-tables")]
    IecRts,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishedAction {
    NodeReturn,
    NodeReset,
    NodeSleep,
    NetStart,
    NetReset,
    None,
    AskUser,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreInvalidHex {
    Fail,
    Warn,
    Ask,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevIdCheck {
    None,
    ScanHex,
    AskForAddressThenScan,
    AskForAddressThenFail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetIdFailureReaction {
    Fail,
    Warn,
    Ask,
}

/// One named, comma/`"a-b"`-separated sector list for `EraseMode::UserDefined`
/// (design §4.1 "Sector selection").
pub fn parse_user_defined_sectors(spec: &str) -> Result<Vec<usize>> {
    let mut sectors = Vec::new();
    for part in spec.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        if let Some((lo, hi)) = part.split_once('-') {
            let lo: usize = lo
                .trim()
                .parse()
                .map_err(|_| Error::Range(format!("invalid sector range '{}'", part)))?;
            let hi: usize = hi
                .trim()
                .parse()
                .map_err(|_| Error::Range(format!("invalid sector range '{}'", part)))?;
            if lo > hi {
                return Err(Error::Range(format!("invalid sector range '{}'", part)));
            }
            sectors.extend(lo..=hi);
        } else {
            let index: usize = part
                .parse()
                .map_err(|_| Error::Range(format!("invalid sector index '{}'", part)))?;
            sectors.push(index);
        }
    }
    Ok(sectors)
}

/// The hex-download sequencer's full parameter bag (design §4.1 step 0 input).
#[derive(Debug, Clone)]
pub struct StwWriteParams {
    pub erase_mode: EraseMode,
    pub user_defined_sectors: Option<String>,
    pub finished_action: FinishedAction,
    pub inter_frame_delay_us: u32,
    pub hex_record_length: u8,
    pub write_crcs: bool,
    pub verbose: bool,
    pub xfl_exchange: bool,
    pub ignore_invalid_hex: IgnoreInvalidHex,
    pub dev_id_check: DevIdCheck,
    pub get_id_failure_reaction: GetIdFailureReaction,
}

impl Default for StwWriteParams {
    fn default() -> Self {
        Self {
            erase_mode: EraseMode::Automatic,
            user_defined_sectors: None,
            finished_action: FinishedAction::NodeReset,
            inter_frame_delay_us: 0,
            hex_record_length: 8,
            write_crcs: true,
            verbose: false,
            xfl_exchange: false,
            ignore_invalid_hex: IgnoreInvalidHex::Warn,
            dev_id_check: DevIdCheck::ScanHex,
            get_id_failure_reaction: GetIdFailureReaction::Warn,
        }
    }
}

fn erase_mode_tag(mode: EraseMode) -> &'static str {
    match mode {
        EraseMode::Automatic => "automatic",
        EraseMode::UserDefined => "user-defined",
        #[cfg(feature = "legacy-sector-tables")]
        EraseMode::CApplication => "c-application",
        #[cfg(feature = "legacy-sector-tables")]
        EraseMode::CanOpenConfig => "canopen-config",
        #[cfg(feature = "legacy-sector-tables")]
        EraseMode::IecApp => "iec-app",
        #[cfg(feature = "legacy-sector-tables")]
        EraseMode::IecRts => "iec-rts",
    }
}

fn erase_mode_from_tag(tag: &str) -> Result<EraseMode> {
    Ok(match tag {
        "automatic" => EraseMode::Automatic,
        "user-defined" => EraseMode::UserDefined,
        #[cfg(feature = "legacy-sector-tables")]
        "c-application" => EraseMode::CApplication,
        #[cfg(feature = "legacy-sector-tables")]
        "canopen-config" => EraseMode::CanOpenConfig,
        #[cfg(feature = "legacy-sector-tables")]
        "iec-app" => EraseMode::IecApp,
        #[cfg(feature = "legacy-sector-tables")]
        "iec-rts" => EraseMode::IecRts,
        other => return Err(Error::Config(format!("unknown erase mode '{}'", other))),
    })
}

fn finished_action_tag(action: FinishedAction) -> &'static str {
    match action {
        FinishedAction::NodeReturn => "node_return",
        FinishedAction::NodeReset => "node_reset",
        FinishedAction::NodeSleep => "node_sleep",
        FinishedAction::NetStart => "net_start",
        FinishedAction::NetReset => "net_reset",
        FinishedAction::None => "none",
        FinishedAction::AskUser => "ask_user",
    }
}

fn finished_action_from_tag(tag: &str) -> Result<FinishedAction> {
    Ok(match tag {
        "node_return" => FinishedAction::NodeReturn,
        "node_reset" => FinishedAction::NodeReset,
        "node_sleep" => FinishedAction::NodeSleep,
        "net_start" => FinishedAction::NetStart,
        "net_reset" => FinishedAction::NetReset,
        "none" => FinishedAction::None,
        "ask_user" => FinishedAction::AskUser,
        other => return Err(Error::Config(format!("unknown finished action '{}'", other))),
    })
}

fn ignore_invalid_hex_tag(v: IgnoreInvalidHex) -> &'static str {
    match v {
        IgnoreInvalidHex::Fail => "fail",
        IgnoreInvalidHex::Warn => "warn",
        IgnoreInvalidHex::Ask => "ask",
    }
}

fn ignore_invalid_hex_from_tag(tag: &str) -> Result<IgnoreInvalidHex> {
    Ok(match tag {
        "fail" => IgnoreInvalidHex::Fail,
        "warn" => IgnoreInvalidHex::Warn,
        "ask" => IgnoreInvalidHex::Ask,
        other => return Err(Error::Config(format!("unknown ignore-invalid-hex policy '{}'", other))),
    })
}

fn dev_id_check_tag(v: DevIdCheck) -> &'static str {
    match v {
        DevIdCheck::None => "none",
        DevIdCheck::ScanHex => "scan-hex",
        DevIdCheck::AskForAddressThenScan => "ask-then-scan",
        DevIdCheck::AskForAddressThenFail => "ask-then-fail",
    }
}

fn dev_id_check_from_tag(tag: &str) -> Result<DevIdCheck> {
    Ok(match tag {
        "none" => DevIdCheck::None,
        "scan-hex" => DevIdCheck::ScanHex,
        "ask-then-scan" => DevIdCheck::AskForAddressThenScan,
        "ask-then-fail" => DevIdCheck::AskForAddressThenFail,
        other => return Err(Error::Config(format!("unknown dev-id-check policy '{}'", other))),
    })
}

fn get_id_failure_reaction_tag(v: GetIdFailureReaction) -> &'static str {
    match v {
        GetIdFailureReaction::Fail => "fail",
        GetIdFailureReaction::Warn => "warn",
        GetIdFailureReaction::Ask => "ask",
    }
}

fn get_id_failure_reaction_from_tag(tag: &str) -> Result<GetIdFailureReaction> {
    Ok(match tag {
        "fail" => GetIdFailureReaction::Fail,
        "warn" => GetIdFailureReaction::Warn,
        "ask" => GetIdFailureReaction::Ask,
        other => return Err(Error::Config(format!("unknown get-id-failure reaction '{}'", other))),
    })
}

impl StwWriteParams {
    /// Minimal `[Section]` / `key=value` INI writer, in the spirit of the
    /// original's `CSCLIniFile`-backed parameter bag (design §3.1).
    pub fn to_ini_string(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "[FlashWriteParameters]");
        let _ = writeln!(out, "erase_mode={}", erase_mode_tag(self.erase_mode));
        let _ = writeln!(
            out,
            "user_defined_sectors={}",
            self.user_defined_sectors.as_deref().unwrap_or("")
        );
        let _ = writeln!(out, "finished_action={}", finished_action_tag(self.finished_action));
        let _ = writeln!(out, "inter_frame_delay_us={}", self.inter_frame_delay_us);
        let _ = writeln!(out, "hex_record_length={}", self.hex_record_length);
        let _ = writeln!(out, "write_crcs={}", self.write_crcs);
        let _ = writeln!(out, "verbose={}", self.verbose);
        let _ = writeln!(out, "xfl_exchange={}", self.xfl_exchange);
        let _ = writeln!(
            out,
            "ignore_invalid_hex={}",
            ignore_invalid_hex_tag(self.ignore_invalid_hex)
        );
        let _ = writeln!(out, "dev_id_check={}", dev_id_check_tag(self.dev_id_check));
        let _ = writeln!(
            out,
            "get_id_failure_reaction={}",
            get_id_failure_reaction_tag(self.get_id_failure_reaction)
        );
        out
    }

    pub fn from_ini_str(ini: &str) -> Result<Self> {
        let mut params = StwWriteParams::default();
        for line in ini.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('[') || line.starts_with(';') {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| Error::Config(format!("malformed INI line '{}'", line)))?;
            match key.trim() {
                "erase_mode" => params.erase_mode = erase_mode_from_tag(value.trim())?,
                "user_defined_sectors" => {
                    params.user_defined_sectors = if value.trim().is_empty() {
                        None
                    } else {
                        Some(value.trim().to_string())
                    }
                }
                "finished_action" => params.finished_action = finished_action_from_tag(value.trim())?,
                "inter_frame_delay_us" => {
                    params.inter_frame_delay_us = value
                        .trim()
                        .parse()
                        .map_err(|_| Error::Config("invalid inter_frame_delay_us".into()))?
                }
                "hex_record_length" => {
                    params.hex_record_length = value
                        .trim()
                        .parse()
                        .map_err(|_| Error::Config("invalid hex_record_length".into()))?
                }
                "write_crcs" => params.write_crcs = value.trim() == "true",
                "verbose" => params.verbose = value.trim() == "true",
                "xfl_exchange" => params.xfl_exchange = value.trim() == "true",
                "ignore_invalid_hex" => {
                    params.ignore_invalid_hex = ignore_invalid_hex_from_tag(value.trim())?
                }
                "dev_id_check" => params.dev_id_check = dev_id_check_from_tag(value.trim())?,
                "get_id_failure_reaction" => {
                    params.get_id_failure_reaction = get_id_failure_reaction_from_tag(value.trim())?
                }
                other => return Err(Error::Config(format!("unknown INI key '{}'", other))),
            }
        }
        Ok(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ini_round_trips_defaults() {
        let params = StwWriteParams::default();
        let ini = params.to_ini_string();
        let parsed = StwWriteParams::from_ini_str(&ini).unwrap();
        assert_eq!(parsed.erase_mode, params.erase_mode);
        assert_eq!(parsed.finished_action, params.finished_action);
        assert_eq!(parsed.hex_record_length, params.hex_record_length);
        assert_eq!(parsed.write_crcs, params.write_crcs);
    }

    #[test]
    fn ini_round_trips_user_defined_sectors() {
        let params = StwWriteParams {
            erase_mode: EraseMode::UserDefined,
            user_defined_sectors: Some("0-3,7,10-12".into()),
            ..StwWriteParams::default()
        };
        let ini = params.to_ini_string();
        let parsed = StwWriteParams::from_ini_str(&ini).unwrap();
        assert_eq!(parsed.user_defined_sectors.as_deref(), Some("0-3,7,10-12"));
    }

    #[test]
    fn parses_mixed_ranges_and_singletons() {
        let sectors = parse_user_defined_sectors("0-3,7,10-12").unwrap();
        assert_eq!(sectors, vec![0, 1, 2, 3, 7, 10, 11, 12]);
    }

    #[test]
    fn rejects_inverted_range() {
        assert!(parse_user_defined_sectors("5-2").is_err());
    }
}
