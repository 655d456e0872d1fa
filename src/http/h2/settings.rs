//! SETTINGS parameters (RFC 7540 Section 6.5)

use super::error::{Error, Result};
use super::{DEFAULT_HEADER_TABLE_SIZE, DEFAULT_INITIAL_WINDOW_SIZE, DEFAULT_MAX_FRAME_SIZE};
use std::fmt;

/// Largest legal SETTINGS_MAX_FRAME_SIZE
pub const MAX_ALLOWED_FRAME_SIZE: u32 = 0x00FF_FFFF;

/// Largest legal window (2^31 - 1)
pub const MAX_WINDOW_SIZE: u32 = 0x7FFF_FFFF;

/// Setting identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum SettingsParameter {
    HeaderTableSize = 0x1,
    EnablePush = 0x2,
    MaxConcurrentStreams = 0x3,
    InitialWindowSize = 0x4,
    MaxFrameSize = 0x5,
    MaxHeaderListSize = 0x6,
    /// RFC 8441
    EnableConnectProtocol = 0x8,
}

impl SettingsParameter {
    /// Wire identifier
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Known parameter for a wire identifier
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x1 => Some(SettingsParameter::HeaderTableSize),
            0x2 => Some(SettingsParameter::EnablePush),
            0x3 => Some(SettingsParameter::MaxConcurrentStreams),
            0x4 => Some(SettingsParameter::InitialWindowSize),
            0x5 => Some(SettingsParameter::MaxFrameSize),
            0x6 => Some(SettingsParameter::MaxHeaderListSize),
            0x8 => Some(SettingsParameter::EnableConnectProtocol),
            _ => None,
        }
    }

    /// RFC name without the `SETTINGS_` prefix
    pub fn name(&self) -> &'static str {
        match self {
            SettingsParameter::HeaderTableSize => "HEADER_TABLE_SIZE",
            SettingsParameter::EnablePush => "ENABLE_PUSH",
            SettingsParameter::MaxConcurrentStreams => "MAX_CONCURRENT_STREAMS",
            SettingsParameter::InitialWindowSize => "INITIAL_WINDOW_SIZE",
            SettingsParameter::MaxFrameSize => "MAX_FRAME_SIZE",
            SettingsParameter::MaxHeaderListSize => "MAX_HEADER_LIST_SIZE",
            SettingsParameter::EnableConnectProtocol => "ENABLE_CONNECT_PROTOCOL",
        }
    }
}

impl fmt::Display for SettingsParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:x})", self.name(), self.as_u16())
    }
}

/// A set of SETTINGS values; `None` means "not sent" (protocol default)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    pub header_table_size: Option<u32>,
    pub enable_push: Option<bool>,
    /// `None` = unlimited
    pub max_concurrent_streams: Option<u32>,
    pub initial_window_size: Option<u32>,
    pub max_frame_size: Option<u32>,
    /// `None` = unlimited
    pub max_header_list_size: Option<u32>,
    pub enable_connect_protocol: Option<bool>,
}

impl Settings {
    /// Nothing set
    pub fn new() -> Self {
        Settings::default()
    }

    /// Settings from `(identifier, value)` pairs as they appear on the wire.
    ///
    /// Unknown identifiers are ignored. ENABLE_PUSH values other than 0/1 are
    /// a protocol error.
    pub fn from_entries(entries: &[(u16, u32)]) -> Result<Self> {
        let mut settings = Settings::new();
        for &(id, value) in entries {
            let flag = || match value {
                0 => Ok(false),
                1 => Ok(true),
                other => Err(Error::Protocol(format!(
                    "SETTINGS 0x{:x} must be 0 or 1, got {}",
                    id, other
                ))),
            };
            match SettingsParameter::from_u16(id) {
                Some(SettingsParameter::HeaderTableSize) => settings.header_table_size = Some(value),
                Some(SettingsParameter::EnablePush) => settings.enable_push = Some(flag()?),
                Some(SettingsParameter::MaxConcurrentStreams) => {
                    settings.max_concurrent_streams = Some(value)
                }
                Some(SettingsParameter::InitialWindowSize) => {
                    settings.initial_window_size = Some(value)
                }
                Some(SettingsParameter::MaxFrameSize) => settings.max_frame_size = Some(value),
                Some(SettingsParameter::MaxHeaderListSize) => {
                    settings.max_header_list_size = Some(value)
                }
                Some(SettingsParameter::EnableConnectProtocol) => {
                    settings.enable_connect_protocol = Some(flag()?)
                }
                None => {}
            }
        }
        Ok(settings)
    }

    /// Wire `(identifier, value)` pairs for every value that is set
    pub fn entries(&self) -> Vec<(u16, u32)> {
        let flag = |b: bool| -> u32 { if b { 1 } else { 0 } };
        [
            (SettingsParameter::HeaderTableSize, self.header_table_size),
            (SettingsParameter::EnablePush, self.enable_push.map(flag)),
            (SettingsParameter::MaxConcurrentStreams, self.max_concurrent_streams),
            (SettingsParameter::InitialWindowSize, self.initial_window_size),
            (SettingsParameter::MaxFrameSize, self.max_frame_size),
            (SettingsParameter::MaxHeaderListSize, self.max_header_list_size),
            (SettingsParameter::EnableConnectProtocol, self.enable_connect_protocol.map(flag)),
        ]
        .into_iter()
        .filter_map(|(param, value)| value.map(|v| (param.as_u16(), v)))
        .collect()
    }

    /// HEADER_TABLE_SIZE, defaulting to 4096
    pub fn get_header_table_size(&self) -> u32 {
        self.header_table_size.unwrap_or(DEFAULT_HEADER_TABLE_SIZE)
    }

    /// ENABLE_PUSH, defaulting to true
    pub fn get_enable_push(&self) -> bool {
        self.enable_push.unwrap_or(true)
    }

    /// INITIAL_WINDOW_SIZE, defaulting to 65535
    pub fn get_initial_window_size(&self) -> u32 {
        self.initial_window_size.unwrap_or(DEFAULT_INITIAL_WINDOW_SIZE)
    }

    /// MAX_FRAME_SIZE, defaulting to 16384
    pub fn get_max_frame_size(&self) -> u32 {
        self.max_frame_size.unwrap_or(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Check the ranges RFC 7540 Section 6.5.2 imposes
    pub fn validate(&self) -> Result<()> {
        if let Some(size) = self.initial_window_size {
            if size > MAX_WINDOW_SIZE {
                return Err(Error::FlowControl(format!(
                    "Initial window size {} exceeds 2^31-1",
                    size
                )));
            }
        }

        if let Some(size) = self.max_frame_size {
            if !(DEFAULT_MAX_FRAME_SIZE..=MAX_ALLOWED_FRAME_SIZE).contains(&size) {
                return Err(Error::InvalidSettings(format!(
                    "Max frame size {} outside 16384-16777215",
                    size
                )));
            }
        }

        Ok(())
    }

    /// Overwrite with every value `other` sets
    pub fn merge(&mut self, other: &Settings) {
        fn take<T: Copy>(dst: &mut Option<T>, src: Option<T>) {
            if src.is_some() {
                *dst = src;
            }
        }
        take(&mut self.header_table_size, other.header_table_size);
        take(&mut self.enable_push, other.enable_push);
        take(&mut self.max_concurrent_streams, other.max_concurrent_streams);
        take(&mut self.initial_window_size, other.initial_window_size);
        take(&mut self.max_frame_size, other.max_frame_size);
        take(&mut self.max_header_list_size, other.max_header_list_size);
        take(&mut self.enable_connect_protocol, other.enable_connect_protocol);
    }
}

/// Builder for [`Settings`]
#[derive(Debug, Clone, Default)]
pub struct SettingsBuilder {
    settings: Settings,
}

impl SettingsBuilder {
    pub fn new() -> Self {
        SettingsBuilder::default()
    }

    pub fn header_table_size(mut self, size: u32) -> Self {
        self.settings.header_table_size = Some(size);
        self
    }

    pub fn enable_push(mut self, enable: bool) -> Self {
        self.settings.enable_push = Some(enable);
        self
    }

    pub fn max_concurrent_streams(mut self, max: u32) -> Self {
        self.settings.max_concurrent_streams = Some(max);
        self
    }

    pub fn initial_window_size(mut self, size: u32) -> Self {
        self.settings.initial_window_size = Some(size);
        self
    }

    pub fn max_frame_size(mut self, size: u32) -> Self {
        self.settings.max_frame_size = Some(size);
        self
    }

    pub fn max_header_list_size(mut self, size: u32) -> Self {
        self.settings.max_header_list_size = Some(size);
        self
    }

    /// Validate and build
    pub fn build(self) -> Result<Settings> {
        self.settings.validate()?;
        Ok(self.settings)
    }
}
