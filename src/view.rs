//! Planar view configuration.
//!
//! A source carries an ordered list of `ViewConfig` slots. A slot may be
//! `Disabled`; it still occupies its index, so `partition_<i>` always refers
//! to the i-th configured slot.

use anyhow::{anyhow, bail, Result};
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_PAN_DEG: f64 = 0.0;
pub const DEFAULT_TILT_DEG: f64 = 0.0;
pub const DEFAULT_FOV_DEG: f64 = 90.0;

/// Closed polygon in normalized view coordinates (0..1 on both axes, origin top-left).
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct ZonePolygon {
    #[serde(default)]
    pub name: Option<String>,
    pub points: Vec<[f32; 2]>,
}

impl ZonePolygon {
    pub fn new(points: Vec<[f32; 2]>) -> Self {
        Self { name: None, points }
    }

    /// Even-odd point-in-polygon test. Polygons with fewer than three points contain nothing.
    pub fn contains(&self, x: f32, y: f32) -> bool {
        let n = self.points.len();
        if n < 3 {
            return false;
        }
        let mut inside = false;
        let mut j = n - 1;
        for i in 0..n {
            let [xi, yi] = self.points[i];
            let [xj, yj] = self.points[j];
            if (yi > y) != (yj > y) && x < (xj - xi) * (y - yi) / (yj - yi) + xi {
                inside = !inside;
            }
            j = i;
        }
        inside
    }
}

/// One planar sub-view slot.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(from = "Option<ViewFile>")]
pub enum ViewConfig {
    Active {
        pan_deg: f64,
        tilt_deg: f64,
        fov_deg: f64,
        zones: Vec<ZonePolygon>,
    },
    Disabled,
}

#[derive(Debug, Deserialize, Default)]
struct ViewFile {
    #[serde(default, alias = "angle_z")]
    pan: Option<f64>,
    #[serde(default, alias = "angle_up")]
    tilt: Option<f64>,
    #[serde(default, alias = "zoom")]
    fov: Option<f64>,
    #[serde(default)]
    zones: Option<Vec<ZonePolygon>>,
    #[serde(default)]
    disabled: bool,
}

impl From<Option<ViewFile>> for ViewConfig {
    fn from(file: Option<ViewFile>) -> Self {
        match file {
            None => ViewConfig::Disabled,
            Some(file) if file.disabled => ViewConfig::Disabled,
            Some(file) => ViewConfig::Active {
                pan_deg: file.pan.unwrap_or(DEFAULT_PAN_DEG),
                tilt_deg: file.tilt.unwrap_or(DEFAULT_TILT_DEG),
                fov_deg: file.fov.unwrap_or(DEFAULT_FOV_DEG),
                zones: file.zones.unwrap_or_default(),
            },
        }
    }
}

impl Default for ViewConfig {
    fn default() -> Self {
        ViewConfig::active(DEFAULT_PAN_DEG, DEFAULT_TILT_DEG, DEFAULT_FOV_DEG)
    }
}

impl ViewConfig {
    pub fn active(pan_deg: f64, tilt_deg: f64, fov_deg: f64) -> Self {
        ViewConfig::Active {
            pan_deg,
            tilt_deg,
            fov_deg,
            zones: Vec::new(),
        }
    }

    pub fn with_zones(self, zones: Vec<ZonePolygon>) -> Self {
        match self {
            ViewConfig::Active {
                pan_deg,
                tilt_deg,
                fov_deg,
                ..
            } => ViewConfig::Active {
                pan_deg,
                tilt_deg,
                fov_deg,
                zones,
            },
            ViewConfig::Disabled => ViewConfig::Disabled,
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, ViewConfig::Active { .. })
    }

    pub fn zones(&self) -> &[ZonePolygon] {
        match self {
            ViewConfig::Active { zones, .. } => zones,
            ViewConfig::Disabled => &[],
        }
    }

    /// Rejects parameters that cannot describe a pinhole view.
    pub fn validate(&self) -> Result<()> {
        let ViewConfig::Active {
            pan_deg,
            tilt_deg,
            fov_deg,
            ..
        } = self
        else {
            return Ok(());
        };
        if !pan_deg.is_finite() || !tilt_deg.is_finite() {
            bail!("pan/tilt must be finite (pan={}, tilt={})", pan_deg, tilt_deg);
        }
        if !(*fov_deg > 0.0 && *fov_deg < 180.0) {
            bail!("output fov must be in (0, 180) degrees, got {}", fov_deg);
        }
        Ok(())
    }
}

/// Evenly spaced ring of views around the boresight.
///
/// `default_ring(8, 35.0, 80.0)` is the stock ceiling-camera layout.
pub fn default_ring(count: usize, tilt_deg: f64, fov_deg: f64) -> Vec<ViewConfig> {
    if count == 0 {
        return Vec::new();
    }
    let step = 360.0 / count as f64;
    (0..count)
        .map(|i| ViewConfig::active(step * i as f64, tilt_deg, fov_deg))
        .collect()
}

/// Key of one image inside a snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ViewKey {
    Original,
    Partition(usize),
}

impl fmt::Display for ViewKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ViewKey::Original => write!(f, "original"),
            ViewKey::Partition(index) => write!(f, "partition_{}", index),
        }
    }
}

impl FromStr for ViewKey {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        if s == "original" {
            return Ok(ViewKey::Original);
        }
        let index = s
            .strip_prefix("partition_")
            .ok_or_else(|| anyhow!("unknown view key '{}'", s))?;
        let index = index
            .parse::<usize>()
            .map_err(|_| anyhow!("invalid partition index in view key '{}'", s))?;
        Ok(ViewKey::Partition(index))
    }
}

impl ViewKey {
    /// Client-side view index convention: -1 is the original frame.
    pub fn from_index(index: i64) -> Result<Self> {
        match index {
            -1 => Ok(ViewKey::Original),
            i if i >= 0 => Ok(ViewKey::Partition(i as usize)),
            other => Err(anyhow!("invalid view index {}", other)),
        }
    }
}

/// Restricts which views a render pass produces.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ViewSelector {
    #[default]
    All,
    Only(ViewKey),
}

impl ViewSelector {
    pub fn includes_partition(&self, index: usize) -> bool {
        match self {
            ViewSelector::All => true,
            ViewSelector::Only(ViewKey::Partition(selected)) => *selected == index,
            ViewSelector::Only(ViewKey::Original) => false,
        }
    }

    pub fn includes_original(&self) -> bool {
        matches!(self, ViewSelector::All | ViewSelector::Only(ViewKey::Original))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_and_flagged_entries_are_disabled() {
        let views: Vec<ViewConfig> =
            serde_json::from_str(r#"[{"pan": 10}, null, {"disabled": true}]"#).unwrap();
        assert!(views[0].is_enabled());
        assert_eq!(views[1], ViewConfig::Disabled);
        assert_eq!(views[2], ViewConfig::Disabled);
    }

    #[test]
    fn missing_fields_take_defaults() {
        let view: ViewConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(view, ViewConfig::active(0.0, 0.0, 90.0));
    }

    #[test]
    fn legacy_field_names_are_accepted() {
        let view: ViewConfig =
            serde_json::from_str(r#"{"angle_z": 45, "angle_up": 35, "zoom": 80}"#).unwrap();
        assert_eq!(view, ViewConfig::active(45.0, 35.0, 80.0));
    }

    #[test]
    fn validate_rejects_degenerate_fov() {
        assert!(ViewConfig::active(0.0, 0.0, 0.0).validate().is_err());
        assert!(ViewConfig::active(0.0, 0.0, 180.0).validate().is_err());
        assert!(ViewConfig::active(f64::NAN, 0.0, 90.0).validate().is_err());
        assert!(ViewConfig::Disabled.validate().is_ok());
    }

    #[test]
    fn view_keys_round_trip_through_strings() {
        assert_eq!("original".parse::<ViewKey>().unwrap(), ViewKey::Original);
        assert_eq!(
            "partition_7".parse::<ViewKey>().unwrap(),
            ViewKey::Partition(7)
        );
        assert_eq!(ViewKey::Partition(2).to_string(), "partition_2");
        assert!("partition_x".parse::<ViewKey>().is_err());
        assert_eq!(ViewKey::from_index(-1).unwrap(), ViewKey::Original);
    }

    #[test]
    fn zones_attach_to_active_views_only() {
        let zone = ZonePolygon::new(vec![[0.0, 0.0], [1.0, 0.0], [0.0, 1.0]]);
        let view = ViewConfig::active(0.0, 35.0, 80.0).with_zones(vec![zone.clone()]);
        assert_eq!(view.zones(), &[zone.clone()]);
        assert!(zone.contains(0.2, 0.2));
        assert!(!zone.contains(0.8, 0.8));
        assert!(ViewConfig::Disabled.with_zones(vec![zone]).zones().is_empty());
    }

    #[test]
    fn ring_spaces_pans_evenly() {
        let ring = default_ring(8, 35.0, 80.0);
        assert_eq!(ring.len(), 8);
        assert_eq!(ring[3], ViewConfig::active(135.0, 35.0, 80.0));
    }

    #[test]
    fn selector_filters_keys() {
        let only_two = ViewSelector::Only(ViewKey::Partition(2));
        assert!(only_two.includes_partition(2));
        assert!(!only_two.includes_partition(0));
        assert!(!only_two.includes_original());
        let original = ViewSelector::Only(ViewKey::Original);
        assert!(!original.includes_partition(0));
        assert!(original.includes_original());
        assert!(ViewSelector::All.includes_partition(5));
    }

    #[test]
    fn zone_contains_uses_even_odd_rule() {
        let zone = ZonePolygon::new(vec![[0.0, 0.0], [0.5, 0.0], [0.5, 0.5], [0.0, 0.5]]);
        assert!(zone.contains(0.25, 0.25));
        assert!(!zone.contains(0.75, 0.25));
    }
}
