// SPDX-License-Identifier: CEPL-1.0
use std::fs;
use std::path::{Path, PathBuf};

use lumen_render::{PresentPreference, RenderSettings, ShaderPaths};
use serde::Deserialize;
use tracing::{info, warn};

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppCfg {
    pub window: WindowCfg,
    pub render: RenderCfg,
    pub device: DeviceCfg,
    pub shaders: ShaderCfg,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WindowCfg {
    pub title: String,
    pub width: u32,
    pub height: u32,
}

impl Default for WindowCfg {
    fn default() -> Self {
        Self {
            title: "lumen".into(),
            width: 1280,
            height: 720,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum PresentMode {
    #[default]
    LowLatency,
    Vsync,
    Immediate,
}

impl From<PresentMode> for PresentPreference {
    fn from(mode: PresentMode) -> Self {
        match mode {
            PresentMode::LowLatency => PresentPreference::LowLatency,
            PresentMode::Vsync => PresentPreference::Vsync,
            PresentMode::Immediate => PresentPreference::Immediate,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RenderCfg {
    pub clear_color: [f32; 4],
    pub present_mode: PresentMode,
    pub flight_slots: usize,
    /// Unset means "on in debug builds".
    pub validation: Option<bool>,
}

impl Default for RenderCfg {
    fn default() -> Self {
        Self {
            clear_color: [0.02, 0.02, 0.04, 1.0],
            present_mode: PresentMode::default(),
            flight_slots: 2,
            validation: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DeviceCfg {
    pub require_ray_tracing: bool,
}

impl Default for DeviceCfg {
    fn default() -> Self {
        Self {
            require_ray_tracing: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct ShaderCfg {
    pub vertex: Option<PathBuf>,
    pub fragment: Option<PathBuf>,
}

pub fn parse(text: &str) -> Result<AppCfg, toml::de::Error> {
    toml::from_str(text)
}

/// Missing file gives defaults; a malformed one is reported and ignored.
pub fn load(path: &Path) -> AppCfg {
    let text = match fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) => {
            info!("config {} not read ({e}), using defaults", path.display());
            return AppCfg::default();
        }
    };
    match parse(&text) {
        Ok(cfg) => {
            info!("config loaded from {}", path.display());
            cfg
        }
        Err(e) => {
            warn!("config {} malformed, using defaults: {e}", path.display());
            AppCfg::default()
        }
    }
}

impl AppCfg {
    pub fn apply_overrides(&mut self, present_mode: Option<PresentMode>, flight_slots: Option<usize>) {
        if let Some(mode) = present_mode {
            self.render.present_mode = mode;
        }
        if let Some(n) = flight_slots {
            self.render.flight_slots = n;
        }
    }

    pub fn shader_paths(&self) -> Option<ShaderPaths> {
        match (&self.shaders.vertex, &self.shaders.fragment) {
            (Some(vertex), Some(fragment)) => Some(ShaderPaths {
                vertex: vertex.clone(),
                fragment: fragment.clone(),
            }),
            (None, None) => None,
            _ => {
                warn!("[shaders] needs both vertex and fragment; using built-in pair");
                None
            }
        }
    }

    pub fn render_settings(&self) -> RenderSettings {
        RenderSettings {
            clear_color: self.render.clear_color,
            present: self.render.present_mode.into(),
            flight_slots: self.render.flight_slots.max(1),
            require_ray_tracing: self.device.require_ray_tracing,
            validation: self.render.validation.unwrap_or(cfg!(debug_assertions)),
            shaders: self.shader_paths(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let cfg = parse("").unwrap();
        assert_eq!(cfg.window.width, 1280);
        assert_eq!(cfg.render.flight_slots, 2);
        assert_eq!(cfg.render.present_mode, PresentMode::LowLatency);
        assert!(cfg.device.require_ray_tracing);
        assert!(cfg.shader_paths().is_none());
    }

    #[test]
    fn full_file_round_trips_into_settings() {
        let cfg = parse(
            r#"
            [window]
            title = "demo"
            width = 800
            height = 600

            [render]
            clear_color = [0.1, 0.2, 0.3, 1.0]
            present_mode = "vsync"
            flight_slots = 3
            validation = false

            [device]
            require_ray_tracing = false

            [shaders]
            vertex = "shaders/a.vert.spv"
            fragment = "shaders/a.frag.spv"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.window.title, "demo");
        let s = cfg.render_settings();
        assert_eq!(s.clear_color, [0.1, 0.2, 0.3, 1.0]);
        assert_eq!(s.present, PresentPreference::Vsync);
        assert_eq!(s.flight_slots, 3);
        assert!(!s.validation);
        assert!(!s.require_ray_tracing);
        let paths = s.shaders.unwrap();
        assert_eq!(paths.vertex, PathBuf::from("shaders/a.vert.spv"));
    }

    #[test]
    fn zero_flight_slots_clamp_to_one() {
        let cfg = parse("[render]\nflight_slots = 0\n").unwrap();
        assert_eq!(cfg.render_settings().flight_slots, 1);
    }

    #[test]
    fn half_shader_pair_falls_back_to_builtin() {
        let cfg = parse("[shaders]\nvertex = \"only.vert.spv\"\n").unwrap();
        assert!(cfg.render_settings().shaders.is_none());
    }

    #[test]
    fn unknown_present_mode_is_rejected() {
        assert!(parse("[render]\npresent_mode = \"turbo\"\n").is_err());
    }

    #[test]
    fn malformed_or_missing_file_loads_defaults() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("lumen-cfg-test-{}.toml", std::process::id()));
        fs::write(&path, "[render\nflight_slots = ").unwrap();
        let cfg = load(&path);
        assert_eq!(cfg.render.flight_slots, 2);
        fs::remove_file(&path).unwrap();

        let cfg = load(&dir.join("lumen-cfg-test-does-not-exist.toml"));
        assert_eq!(cfg.window.height, 720);
    }

    #[test]
    fn cli_overrides_win() {
        let mut cfg = parse("[render]\npresent_mode = \"vsync\"\nflight_slots = 4\n").unwrap();
        cfg.apply_overrides(Some(PresentMode::Immediate), None);
        assert_eq!(cfg.render.present_mode, PresentMode::Immediate);
        assert_eq!(cfg.render.flight_slots, 4);
        cfg.apply_overrides(None, Some(1));
        assert_eq!(cfg.render.flight_slots, 1);
    }
}
