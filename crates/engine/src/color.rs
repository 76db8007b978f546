//! Camera/Color Resolver
//!
//! Deterministically assigns a grading preset to each clip. Resolution order is
//! exact camera signature, then filename rules, then the mandatory `mixed` preset.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::registry::{CameraSignature, Clip};

pub const FALLBACK_PRESET_ID: &str = "mixed";

#[derive(Error, Debug, PartialEq)]
pub enum ColorError {
    #[error("Color library has no \"mixed\" fallback preset")]
    MissingFallback,

    #[error("Duplicate color preset id: {0}")]
    DuplicatePreset(String),

    #[error("Invalid color library: {0}")]
    InvalidLibrary(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rgb {
    pub r: f64,
    pub g: f64,
    pub b: f64,
}

impl Rgb {
    pub const fn splat(v: f64) -> Self {
        Rgb { r: v, g: v, b: v }
    }

    pub const fn new(r: f64, g: f64, b: f64) -> Self {
        Rgb { r, g, b }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColorPreset {
    pub id: String,
    pub name: String,
    /// Camera this preset is tuned for, `None` for the fallback
    #[serde(default)]
    pub camera: Option<CameraSignature>,
    pub lift: Rgb,
    pub gamma: Rgb,
    pub gain: Rgb,
    pub saturation: f64,
    pub contrast: f64,
    pub highlights: f64,
    pub shadows: f64,
    pub temperature: f64,
    pub tint: f64,
}

/// Which rule produced a resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionSource {
    CameraSignature,
    FilenamePattern,
    Fallback,
}

/// Preset collection keyed by id; always contains the fallback
#[derive(Debug, Clone, PartialEq)]
pub struct ColorLibrary {
    presets: BTreeMap<String, ColorPreset>,
}

impl ColorLibrary {
    pub fn new(presets: Vec<ColorPreset>) -> Result<Self, ColorError> {
        let mut map = BTreeMap::new();
        for preset in presets {
            if map.contains_key(&preset.id) {
                return Err(ColorError::DuplicatePreset(preset.id));
            }
            map.insert(preset.id.clone(), preset);
        }
        if !map.contains_key(FALLBACK_PRESET_ID) {
            return Err(ColorError::MissingFallback);
        }
        Ok(ColorLibrary { presets: map })
    }

    pub fn from_json(json: &str) -> Result<Self, ColorError> {
        let presets: Vec<ColorPreset> =
            serde_json::from_str(json).map_err(|e| ColorError::InvalidLibrary(e.to_string()))?;
        Self::new(presets)
    }

    pub fn builtin() -> Self {
        let presets = builtin_presets()
            .into_iter()
            .map(|p| (p.id.clone(), p))
            .collect();
        ColorLibrary { presets }
    }

    pub fn get(&self, id: &str) -> Option<&ColorPreset> {
        self.presets.get(id)
    }

    pub fn fallback(&self) -> &ColorPreset {
        // Construction guarantees the fallback exists
        &self.presets[FALLBACK_PRESET_ID]
    }

    /// First preset (by id) tuned for the camera
    pub fn for_camera(&self, camera: CameraSignature) -> Option<&ColorPreset> {
        self.presets.values().find(|p| p.camera == Some(camera))
    }

    pub fn presets(&self) -> impl Iterator<Item = &ColorPreset> {
        self.presets.values()
    }
}

impl Default for ColorLibrary {
    fn default() -> Self {
        Self::builtin()
    }
}

struct FilenameRule {
    pattern: Regex,
    camera: CameraSignature,
}

pub struct ColorResolver {
    library: ColorLibrary,
    rules: Vec<FilenameRule>,
}

impl ColorResolver {
    pub fn new(library: ColorLibrary) -> Self {
        ColorResolver {
            library,
            rules: filename_rules(),
        }
    }

    pub fn builtin() -> Self {
        Self::new(ColorLibrary::builtin())
    }

    pub fn library(&self) -> &ColorLibrary {
        &self.library
    }

    pub fn resolve(&self, clip: &Clip) -> &ColorPreset {
        self.resolve_with_source(clip).0
    }

    pub fn resolve_with_source(&self, clip: &Clip) -> (&ColorPreset, ResolutionSource) {
        if clip.camera != CameraSignature::Unknown {
            if let Some(preset) = self.library.for_camera(clip.camera) {
                return (preset, ResolutionSource::CameraSignature);
            }
        }

        if let Some(camera) = self.camera_from_filename(clip.key.file_name()) {
            if let Some(preset) = self.library.for_camera(camera) {
                return (preset, ResolutionSource::FilenamePattern);
            }
        }

        (self.library.fallback(), ResolutionSource::Fallback)
    }

    /// Camera implied by the filename; `None` when no rule or conflicting rules match
    fn camera_from_filename(&self, file_name: &str) -> Option<CameraSignature> {
        let mut matched: Option<CameraSignature> = None;
        for rule in &self.rules {
            if rule.pattern.is_match(file_name) {
                match matched {
                    None => matched = Some(rule.camera),
                    Some(existing) if existing != rule.camera => return None,
                    Some(_) => {}
                }
            }
        }
        matched
    }
}

impl Default for ColorResolver {
    fn default() -> Self {
        Self::builtin()
    }
}

fn filename_rules() -> Vec<FilenameRule> {
    // DJI and GoPro names survive renames like "trip_DJI_0001", so those two are unanchored
    [
        (r"(?i)dji_\d+", CameraSignature::Dji),
        (r"(?i)^img_\d{4}\.(mov|heic|mp4)$", CameraSignature::Iphone),
        (r"(?i)^c\d{4}\.mp4$", CameraSignature::Sony),
        (r"(?i)(^|_)(gx|gh|gopr)\d{4,}", CameraSignature::GoPro),
    ]
    .into_iter()
    .filter_map(|(pattern, camera)| {
        Regex::new(pattern)
            .ok()
            .map(|pattern| FilenameRule { pattern, camera })
    })
    .collect()
}

fn builtin_presets() -> Vec<ColorPreset> {
    vec![
        ColorPreset {
            id: "dji_dlog".to_string(),
            name: "DJI D-Log to Rec.709".to_string(),
            camera: Some(CameraSignature::Dji),
            lift: Rgb::splat(-0.02),
            gamma: Rgb::new(1.0, 1.0, 1.02),
            gain: Rgb::splat(1.08),
            saturation: 1.15,
            contrast: 1.12,
            highlights: -10.0,
            shadows: 5.0,
            temperature: 0.0,
            tint: 0.0,
        },
        ColorPreset {
            id: "iphone_hdr".to_string(),
            name: "iPhone HDR tame".to_string(),
            camera: Some(CameraSignature::Iphone),
            lift: Rgb::splat(0.0),
            gamma: Rgb::splat(0.98),
            gain: Rgb::splat(0.95),
            saturation: 0.95,
            contrast: 1.0,
            highlights: -20.0,
            shadows: 0.0,
            temperature: -150.0,
            tint: 0.0,
        },
        ColorPreset {
            id: "sony_slog3".to_string(),
            name: "Sony S-Log3 to Rec.709".to_string(),
            camera: Some(CameraSignature::Sony),
            lift: Rgb::splat(-0.04),
            gamma: Rgb::new(1.02, 1.0, 0.99),
            gain: Rgb::splat(1.15),
            saturation: 1.25,
            contrast: 1.25,
            highlights: -5.0,
            shadows: 8.0,
            temperature: 100.0,
            tint: 2.0,
        },
        ColorPreset {
            id: "gopro_flat".to_string(),
            name: "GoPro Protune flat".to_string(),
            camera: Some(CameraSignature::GoPro),
            lift: Rgb::splat(-0.01),
            gamma: Rgb::splat(1.0),
            gain: Rgb::splat(1.05),
            saturation: 1.1,
            contrast: 1.08,
            highlights: -8.0,
            shadows: 4.0,
            temperature: -50.0,
            tint: 0.0,
        },
        ColorPreset {
            id: FALLBACK_PRESET_ID.to_string(),
            name: "Mixed sources neutral".to_string(),
            camera: None,
            lift: Rgb::splat(0.0),
            gamma: Rgb::splat(1.0),
            gain: Rgb::splat(1.0),
            saturation: 1.05,
            contrast: 1.05,
            highlights: -5.0,
            shadows: 2.0,
            temperature: 0.0,
            tint: 0.0,
        },
    ]
}
