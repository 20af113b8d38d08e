// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::Duration;

/// Configuration for a device bridge session.
#[derive(Debug, Clone, clap::Args)]
pub struct BridgeConfig {
    /// Device hostname or address.
    #[arg(long, default_value = "seestar.local", env = "STARBRIDGE_HOST")]
    pub host: String,

    /// Device control port.
    #[arg(long, default_value_t = 4700, env = "STARBRIDGE_PORT")]
    pub port: u16,

    /// Socket connect timeout in milliseconds.
    #[arg(long, default_value_t = 5000, env = "STARBRIDGE_CONNECT_TIMEOUT_MS")]
    pub connect_timeout_ms: u64,

    /// Site latitude in degrees. 0 means unknown (resolved at startup).
    #[arg(long, default_value_t = 0.0, env = "STARBRIDGE_SITE_LAT")]
    pub site_lat: f64,

    /// Site longitude in degrees. 0 means unknown (resolved at startup).
    #[arg(long, default_value_t = 0.0, env = "STARBRIDGE_SITE_LON")]
    pub site_lon: f64,

    /// Run the mount in equatorial mode (enables the below-horizon offset
    /// workaround for southern targets).
    #[arg(
        long,
        default_value_t = true,
        action = clap::ArgAction::Set,
        env = "STARBRIDGE_EQ_MODE"
    )]
    pub eq_mode: bool,

    /// Default imaging gain.
    #[arg(long, default_value_t = 80, env = "STARBRIDGE_GAIN")]
    pub gain: i64,

    /// Stacked sub-exposure length in milliseconds.
    #[arg(long, default_value_t = 10000, env = "STARBRIDGE_EXPO_STACK_MS")]
    pub expo_stack_ms: u64,

    /// Preview (continuous) exposure length in milliseconds.
    #[arg(long, default_value_t = 500, env = "STARBRIDGE_EXPO_PREVIEW_MS")]
    pub expo_preview_ms: u64,

    /// Dither distance in pixels.
    #[arg(long, default_value_t = 50, env = "STARBRIDGE_DITHER_PIX")]
    pub dither_pix: u64,

    /// Dither every N frames.
    #[arg(long, default_value_t = 5, env = "STARBRIDGE_DITHER_INTERVAL")]
    pub dither_interval: u64,

    /// Enable dithering.
    #[arg(
        long,
        default_value_t = true,
        action = clap::ArgAction::Set,
        env = "STARBRIDGE_DITHER_ENABLED"
    )]
    pub dither_enabled: bool,

    /// Start with the light-pollution filter in the optical path.
    #[arg(long, default_value_t = false, env = "STARBRIDGE_LP_FILTER")]
    pub lp_filter: bool,

    /// Dew heater power, 0-100. 0 disables the heater.
    #[arg(long, default_value_t = 0, env = "STARBRIDGE_DEW_HEATER")]
    pub dew_heater_power: i64,

    /// Save accepted sub-frames alongside the stack.
    #[arg(
        long,
        default_value_t = true,
        action = clap::ArgAction::Set,
        env = "STARBRIDGE_SAVE_GOOD_FRAMES"
    )]
    pub save_good_frames: bool,

    /// Save every sub-frame, including rejected ones.
    #[arg(long, default_value_t = false, env = "STARBRIDGE_SAVE_ALL_FRAMES")]
    pub save_all_frames: bool,

    /// Horizon-coordinate latitude of a clear patch of sky the startup
    /// sequence aims the arm at (clamped to 80).
    #[arg(long, default_value_t = 60.0, env = "STARBRIDGE_AIM_LAT")]
    pub aim_lat: f64,

    /// Horizon-coordinate longitude of the clear patch of sky.
    #[arg(long, default_value_t = 20.0, env = "STARBRIDGE_AIM_LON")]
    pub aim_lon: f64,

    /// IANA time zone name sent to the device at startup. Falls back to the
    /// TZ environment variable, then UTC.
    #[arg(long, env = "STARBRIDGE_TIME_ZONE")]
    pub time_zone: Option<String>,

    /// Base control-loop tick in milliseconds. Loop waits are expressed in
    /// ticks so the end-to-end suite can compress long captures.
    #[arg(long, default_value_t = 1000, env = "STARBRIDGE_TICK_MS")]
    pub tick_ms: u64,
}

impl BridgeConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Duration of `n` control-loop ticks (nominal seconds).
    pub fn ticks(&self, n: u64) -> Duration {
        Duration::from_millis(self.tick_ms.saturating_mul(n))
    }

    /// Time zone name reported to the device.
    pub fn time_zone_name(&self) -> String {
        self.time_zone
            .clone()
            .or_else(|| std::env::var("TZ").ok())
            .unwrap_or_else(|| "UTC".to_owned())
    }
}
