// SPDX-License-Identifier: GPL-3.0-only

//! Parses and emits the working folder's `stacking.txt` configuration file, plus the
//! `options.json` sidecar of overridable tunables (ambient configuration layer).

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{StackError, StackResult};

const OPTIONS_FILE: &str = "options.json";

/// Overridable tunables for a working folder, persisted as a JSON sidecar next to
/// `stacking.txt`. Falls back to the hardcoded constants (see `crate::constants`)
/// for any field missing from the file, so older working folders keep loading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StackingOptions {
    pub star_max_size: f64,
    pub roundness_tolerance: f64,
    pub detector_min_stars: usize,
    pub detector_max_stars: usize,
    pub stacking_batch_size: usize,
}

impl Default for StackingOptions {
    fn default() -> Self {
        StackingOptions {
            star_max_size: crate::constants::STARMAXSIZE,
            roundness_tolerance: crate::constants::ROUNDNESS_TOLERANCE,
            detector_min_stars: crate::constants::DETECTOR_MIN_STARS,
            detector_max_stars: crate::constants::DETECTOR_MAX_STARS,
            stacking_batch_size: crate::constants::DEFAULT_STACKING_BATCH,
        }
    }
}

impl StackingOptions {
    pub fn load(path: &Path) -> StackResult<Self> {
        let text = fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|e| StackError::Format(e.to_string()))
    }

    pub fn save(&self, path: &Path) -> StackResult<()> {
        let text = serde_json::to_string_pretty(self).map_err(|e| StackError::Format(e.to_string()))?;
        fs::write(path, text)?;
        Ok(())
    }

    /// Reads `options.json` from `folder`, falling back to [`StackingOptions::default`]
    /// when it is missing or unparseable.
    pub fn load_or_default(folder: &Path) -> Self {
        Self::load(&folder.join(OPTIONS_FILE)).unwrap_or_default()
    }
}

/// The parsed contents of a `stacking.txt` file: dark frame paths, light frame
/// paths, and an optional reference light frame index.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StackingConfig {
    pub dark_frames: Vec<PathBuf>,
    pub light_frames: Vec<PathBuf>,
    pub reference: Option<usize>,
}

impl StackingConfig {
    pub fn load(path: &Path) -> StackResult<Self> {
        let text = fs::read_to_string(path)?;
        Self::parse(&text)
    }

    pub fn save(&self, path: &Path) -> StackResult<()> {
        fs::write(path, self.render())?;
        Ok(())
    }

    fn parse(text: &str) -> StackResult<Self> {
        let mut config = StackingConfig::default();
        let mut lines = text.lines().map(str::trim);

        if lines.next() != Some("DARKFRAMES") {
            return Err(StackError::Format("missing DARKFRAMES header".into()));
        }
        for line in lines.by_ref() {
            if line == "---" {
                break;
            }
            if !line.is_empty() {
                config.dark_frames.push(PathBuf::from(line));
            }
        }

        if lines.next() != Some("LIGHTFRAMES") {
            return Err(StackError::Format("missing LIGHTFRAMES header".into()));
        }
        for line in lines.by_ref() {
            if line == "---" {
                break;
            }
            if let Some(index) = line.strip_prefix("REF ") {
                config.reference = index.trim().parse().ok();
            } else if !line.is_empty() {
                config.light_frames.push(PathBuf::from(line));
            }
        }

        Ok(config)
    }

    fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("DARKFRAMES\n");
        for path in &self.dark_frames {
            out.push_str(&path.to_string_lossy());
            out.push('\n');
        }
        out.push_str("---\n");
        out.push_str("LIGHTFRAMES\n");
        for path in &self.light_frames {
            out.push_str(&path.to_string_lossy());
            out.push('\n');
        }
        if let Some(index) = self.reference {
            out.push_str(&format!("REF {index}\n"));
        }
        out.push_str("---\n");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_parse_and_render() {
        let config = StackingConfig {
            dark_frames: vec![PathBuf::from("dark1.fits"), PathBuf::from("dark2.fits")],
            light_frames: vec![PathBuf::from("light1.fits"), PathBuf::from("light2.fits")],
            reference: Some(1),
        };

        let parsed = StackingConfig::parse(&config.render()).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn missing_reference_line_leaves_it_unset() {
        let text = "DARKFRAMES\n---\nLIGHTFRAMES\nlight1.fits\n---\n";
        let parsed = StackingConfig::parse(text).unwrap();
        assert_eq!(parsed.reference, None);
        assert_eq!(parsed.light_frames, vec![PathBuf::from("light1.fits")]);
    }

    #[test]
    fn options_round_trip_through_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("options.json");

        let options = StackingOptions { stacking_batch_size: 42, ..StackingOptions::default() };
        options.save(&path).unwrap();

        let loaded = StackingOptions::load(&path).unwrap();
        assert_eq!(loaded, options);
    }

    #[test]
    fn missing_options_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = StackingOptions::load_or_default(dir.path());
        assert_eq!(loaded, StackingOptions::default());
    }
}
