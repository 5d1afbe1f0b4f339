//! Component A: metadata extraction.
//!
//! Maps a fixed set of HDF5 dataset/attribute locations under a master
//! file's `/entry` tree onto a flat JSON object, using one of two
//! property tables depending on the detector firmware's reported
//! software version.

use anyhow::{anyhow, Context, Result};
use hdf5::types::FixedAscii;
use hdf5::File as H5File;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::Mutex;

/// The HDF5 storage type a property's `get_json`-equivalent reader
/// dispatches on. `FloatArray` covers both the rank-1 and rank-2 cases
/// `isH5.c` handles in one branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyType {
    Int,
    Float,
    Str,
    FloatArray,
}

#[derive(Debug, Clone, Copy)]
pub struct PropertyDef {
    pub h5_location: &'static str,
    pub json_name: &'static str,
    pub ty: PropertyType,
    /// Entries marked `/* pre-1.8.0 */` in the original source: present
    /// only in firmware older than 1.8.0, dropped from the 1.8.0+ table.
    pub pre_1_8_0_only: bool,
}

macro_rules! prop {
    ($loc:literal, $name:literal, $ty:expr, pre) => {
        PropertyDef {
            h5_location: $loc,
            json_name: $name,
            ty: $ty,
            pre_1_8_0_only: true,
        }
    };
    ($loc:literal, $name:literal, $ty:expr) => {
        PropertyDef {
            h5_location: $loc,
            json_name: $name,
            ty: $ty,
            pre_1_8_0_only: false,
        }
    };
}

use PropertyType::{Float, FloatArray, Int, Str};

/// The single annotated property list `isH5.c` carries; `pre_1_8_0_only`
/// marks the 14 entries dropped from the 1.8.0+ firmware's metadata
/// tree. [`table_for_version`] derives both concrete tables from this
/// one list.
pub const ALL_PROPERTIES: &[PropertyDef] = &[
    prop!("/entry/instrument/detector/detectorSpecific/auto_summation", "auto_summation", Int),
    prop!("/entry/instrument/detector/beam_center_x", "beam_center_x", Float),
    prop!("/entry/instrument/detector/beam_center_y", "beam_center_y", Float),
    prop!("/entry/instrument/detector/bit_depth_readout", "bit_depth_readout", Int),
    prop!("/entry/instrument/detector/bit_depth_image", "bit_depth_image", Int),
    prop!("/entry/instrument/detector/detectorSpecific/calibration_type", "calibration_type", Str, pre),
    prop!("/entry/sample/goniometer/chi_increment", "chi_increment", Float, pre),
    prop!("/entry/sample/goniometer/chi_start", "chi_start", Float, pre),
    prop!("/entry/instrument/detector/count_time", "count_time", Float),
    prop!("/entry/instrument/detector/detectorSpecific/countrate_correction_bunch_mode", "countrate_correction_bunch_mode", Str, pre),
    prop!("/entry/instrument/detector/detectorSpecific/data_collection_date", "data_collection_date", Str),
    prop!("/entry/instrument/detector/description", "description", Str),
    prop!("/entry/instrument/detector/detector_distance", "detector_distance", Float),
    prop!("/entry/instrument/detector/detector_number", "detector_number", Str),
    prop!("/entry/instrument/detector/geometry/orientation/value", "detector_orientation", FloatArray),
    prop!("/entry/instrument/detector/detectorSpecific/detector_readout_period", "detector_readout_period", Float, pre),
    prop!("/entry/instrument/detector/detector_readout_time", "detector_readout_time", Float),
    prop!("/entry/instrument/detector/geometry/translation/distances", "detector_translation", FloatArray),
    prop!("/entry/instrument/detector/efficiency_correction_applied", "efficiency_correction_applied", Int, pre),
    prop!("/entry/instrument/detector/detectorSpecific/element", "element", Str),
    prop!("/entry/instrument/detector/flatfield_correction_applied", "flatfield_correction_applied", Int),
    prop!("/entry/instrument/detector/detectorSpecific/frame_count_time", "frame_count_time", Float),
    prop!("/entry/instrument/detector/detectorSpecific/frame_period", "frame_period", Float),
    prop!("/entry/instrument/detector/frame_time", "frame_time", Float),
    prop!("/entry/sample/goniometer/kappa_increment", "kappa_increment", Float, pre),
    prop!("/entry/sample/goniometer/kappa_start", "kappa_start", Float),
    prop!("/entry/instrument/detector/detectorSpecific/nframes_sum", "nframes_sum", Int, pre),
    prop!("/entry/instrument/detector/detectorSpecific/nimages", "nimages", Int),
    prop!("/entry/instrument/detector/detectorSpecific/ntrigger", "ntrigger", Int),
    prop!("/entry/instrument/detector/detectorSpecific/number_of_excluded_pixels", "number_of_excluded_pixels", Int),
    // NOTE: omega_increment is stored as an integer in the source table
    // while every other `*_increment` property is a float. Preserved
    // as-is rather than "corrected" to Float.
    prop!("/entry/sample/goniometer/omega_increment", "omega_increment", Int, pre),
    prop!("/entry/sample/goniometer/omega_start", "omega_start", Float, pre),
    prop!("/entry/sample/goniometer/phi_increment", "phi_increment", Float, pre),
    prop!("/entry/sample/goniometer/phi_start", "phi_start", Float, pre),
    prop!("/entry/instrument/detector/detectorSpecific/photon_energy", "photon_energy", Float),
    prop!("/entry/instrument/detector/pixel_mask_applied", "pixel_mask_applied", Int),
    prop!("/entry/instrument/detector/sensor_material", "sensor_material", Str),
    prop!("/entry/instrument/detector/sensor_thickness", "sensor_thickness", Float),
    prop!("/entry/instrument/detector/detectorSpecific/software_version", "software_version", Str),
    prop!("/entry/instrument/detector/detectorSpecific/summation_nimages", "summation_nimages", Int, pre),
    prop!("/entry/instrument/detector/threshold_energy", "threshold_energy", Float),
    prop!("/entry/instrument/detector/detectorSpecific/trigger_mode", "trigger_mode", Str),
    prop!("/entry/instrument/detector/goniometer/two_theta_increment", "two_theta_increment", Float, pre),
    prop!("/entry/instrument/detector/goniometer/two_theta_start", "two_theta_start", Float),
    prop!("/entry/instrument/detector/virtual_pixel_correction_applied", "virtual_pixel_correction_applied", Int),
    prop!("/entry/instrument/beam/incident_wavelength", "wavelength", Float),
    prop!("/entry/instrument/detector/x_pixel_size", "x_pixel_size", Float),
    prop!("/entry/instrument/detector/detectorSpecific/x_pixels_in_detector", "x_pixels_in_detector", Int),
    prop!("/entry/instrument/detector/y_pixel_size", "y_pixel_size", Float),
    prop!("/entry/instrument/detector/detectorSpecific/y_pixels_in_detector", "y_pixels_in_detector", Int),
];

/// A single property, borrowed either from the embedded
/// [`ALL_PROPERTIES`] table or from a deployment-supplied override file.
/// Exists so [`read_property`] has one shape to read regardless of
/// which source produced the entry.
struct PropSpec<'a> {
    h5_location: &'a str,
    json_name: &'a str,
    ty: PropertyType,
}

impl<'a> From<&'a PropertyDef> for PropSpec<'a> {
    fn from(p: &'a PropertyDef) -> Self {
        Self {
            h5_location: p.h5_location,
            json_name: p.json_name,
            ty: p.ty,
        }
    }
}

impl<'a> From<&'a OwnedPropertyDef> for PropSpec<'a> {
    fn from(p: &'a OwnedPropertyDef) -> Self {
        Self {
            h5_location: &p.h5_location,
            json_name: &p.json_name,
            ty: p.ty,
        }
    }
}

/// On-disk shape of a property-table override file: the same
/// `(h5_path, json_name, type_code)` triples as [`ALL_PROPERTIES`], but
/// owned and deserializable, for sites that need to supply a table
/// without recompiling (§6's "static configuration input", made
/// swappable).
#[derive(Debug, Clone, Deserialize)]
struct OwnedPropertyDef {
    h5_location: String,
    json_name: String,
    #[serde(rename = "type")]
    ty: PropertyType,
    #[serde(default)]
    pre_1_8_0_only: bool,
}

impl<'de> Deserialize<'de> for PropertyType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        match raw.as_str() {
            "int" => Ok(PropertyType::Int),
            "float" => Ok(PropertyType::Float),
            "str" => Ok(PropertyType::Str),
            "float_array" => Ok(PropertyType::FloatArray),
            other => Err(serde::de::Error::custom(format!(
                "unknown property type code '{}'",
                other
            ))),
        }
    }
}

fn load_property_table_override(path: &Path) -> Result<Vec<OwnedPropertyDef>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read property table override {}", path.display()))?;
    let table: Vec<OwnedPropertyDef> = serde_json::from_str(&raw).with_context(|| {
        format!("invalid property table override {}", path.display())
    })?;
    Ok(table)
}

const SOFTWARE_VERSION_1_8_0: &str = "1.8.0";

/// Select the property table for a given reported software version
/// string. Anything other than an exact `"1.8.0"` match — including an
/// unrecognized or unreadable version — falls back to the older, fuller
/// table. This is intentional: the original dispatcher does the same
/// and nothing downstream depends on the fallback being "fixed".
pub fn table_for_version(version: Option<&str>) -> Vec<&'static PropertyDef> {
    let use_new_table = version == Some(SOFTWARE_VERSION_1_8_0);
    ALL_PROPERTIES
        .iter()
        .filter(|p| !use_new_table || !p.pre_1_8_0_only)
        .collect()
}

/// Component A: builds the JSON metadata object for one master file.
/// All reads happen under a single mutex so only one thread touches
/// libhdf5 at a time; the HDF5 C library is not thread-safe by default.
pub struct MetadataExtractor {
    meta_mutex: Mutex<()>,
    override_table: Option<Vec<OwnedPropertyDef>>,
}

impl MetadataExtractor {
    pub fn new() -> Self {
        Self {
            meta_mutex: Mutex::new(()),
            override_table: None,
        }
    }

    /// Load a deployment-supplied property table instead of the
    /// embedded [`ALL_PROPERTIES`]. A `None` path keeps the default.
    pub fn with_table_override(path: Option<&Path>) -> Result<Self> {
        let override_table = path.map(load_property_table_override).transpose()?;
        Ok(Self {
            meta_mutex: Mutex::new(()),
            override_table,
        })
    }

    fn resolved_table(&self, version: Option<&str>) -> Vec<PropSpec<'_>> {
        let use_new_table = version == Some(SOFTWARE_VERSION_1_8_0);
        match &self.override_table {
            Some(table) => table
                .iter()
                .filter(|p| !use_new_table || !p.pre_1_8_0_only)
                .map(PropSpec::from)
                .collect(),
            None => table_for_version(version)
                .into_iter()
                .map(PropSpec::from)
                .collect(),
        }
    }

    pub fn extract(&self, master_path: &str) -> Result<Value> {
        let _guard = self.meta_mutex.lock().expect("lock poisoned");
        let file = H5File::open(master_path)
            .map_err(|e| anyhow!("failed to open master file {}: {}", master_path, e))?;

        let version = read_string_property(&file, software_version_location()).ok();
        let table = self.resolved_table(version.as_deref());

        let mut meta = Map::new();
        let mut bit_depth_image: Option<i64> = None;
        for prop in &table {
            let value = match read_property(&file, prop) {
                Ok(v) => v,
                Err(_) => continue, // added/removed across firmware versions; not an error
            };
            if prop.json_name == "bit_depth_image" {
                bit_depth_image = value.as_i64();
            }
            meta.insert(prop.json_name.to_string(), value);
        }

        if let Some(bits) = bit_depth_image {
            meta.insert("image_depth".to_string(), Value::from(bits / 8));
        }
        meta.insert("fn".to_string(), Value::String(master_path.to_string()));

        Ok(Value::Object(meta))
    }
}

impl Default for MetadataExtractor {
    fn default() -> Self {
        Self::new()
    }
}

fn software_version_location() -> &'static str {
    ALL_PROPERTIES
        .iter()
        .find(|p| p.json_name == "software_version")
        .expect("software_version is always in the table")
        .h5_location
}

fn read_string_property(file: &H5File, location: &str) -> Result<String> {
    let dataset = file
        .dataset(location)
        .map_err(|e| anyhow!("no dataset at {}: {}", location, e))?;
    let value: FixedAscii<64> = dataset
        .read_scalar()
        .map_err(|e| anyhow!("failed to read {}: {}", location, e))?;
    Ok(value.as_str().trim_end_matches('\0').to_string())
}

fn read_property(file: &H5File, prop: &PropSpec<'_>) -> Result<Value> {
    let dataset = file
        .dataset(prop.h5_location)
        .map_err(|e| anyhow!("no dataset at {}: {}", prop.h5_location, e))?;
    match prop.ty {
        PropertyType::Int => {
            let v: i64 = dataset
                .read_scalar()
                .map_err(|e| anyhow!("failed to read int at {}: {}", prop.h5_location, e))?;
            Ok(Value::from(v))
        }
        PropertyType::Float => {
            let v: f64 = dataset
                .read_scalar()
                .map_err(|e| anyhow!("failed to read float at {}: {}", prop.h5_location, e))?;
            Ok(Value::from(v))
        }
        PropertyType::Str => {
            let s = read_string_property(file, prop.h5_location)?;
            Ok(Value::String(s))
        }
        PropertyType::FloatArray => {
            let shape = dataset.shape();
            let data: Vec<f64> = dataset
                .read_raw()
                .map_err(|e| anyhow!("failed to read float array at {}: {}", prop.h5_location, e))?;
            match shape.len() {
                1 => Ok(Value::Array(data.into_iter().map(Value::from).collect())),
                2 => {
                    // Storage is row-major (dims[0] rows, dims[1] cols);
                    // the emitted JSON transposes it so the outer array
                    // length equals dims[1] (the original's
                    // `set_json_object_float_array_2d` does the same).
                    let rows = shape[0];
                    let cols = shape[1];
                    let mut outer = Vec::with_capacity(cols);
                    for c in 0..cols {
                        let mut inner = Vec::with_capacity(rows);
                        for r in 0..rows {
                            inner.push(Value::from(data[r * cols + c]));
                        }
                        outer.push(Value::Array(inner));
                    }
                    Ok(Value::Array(outer))
                }
                other => Err(anyhow!(
                    "unexpected rank {} for float array at {}",
                    other,
                    prop.h5_location
                )),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_version_falls_back_to_pre_1_8_0_table() {
        let table = table_for_version(Some("1.6.3"));
        assert_eq!(table.len(), ALL_PROPERTIES.len());
    }

    #[test]
    fn missing_version_falls_back_to_pre_1_8_0_table() {
        let table = table_for_version(None);
        assert_eq!(table.len(), ALL_PROPERTIES.len());
    }

    #[test]
    fn exact_1_8_0_selects_newer_smaller_table() {
        let table = table_for_version(Some("1.8.0"));
        let expected = ALL_PROPERTIES.iter().filter(|p| !p.pre_1_8_0_only).count();
        assert_eq!(table.len(), expected);
        assert!(table.len() < ALL_PROPERTIES.len());
    }

    #[test]
    fn override_table_loads_and_filters_like_the_embedded_one() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("properties.json");
        std::fs::write(
            &path,
            r#"[
                {"h5_location": "/a", "json_name": "alpha", "type": "int"},
                {"h5_location": "/b", "json_name": "beta", "type": "float", "pre_1_8_0_only": true}
            ]"#,
        )
        .expect("write override file");

        let extractor =
            MetadataExtractor::with_table_override(Some(&path)).expect("load override");
        let new_table = extractor.resolved_table(Some("1.8.0"));
        assert_eq!(new_table.len(), 1);
        assert_eq!(new_table[0].json_name, "alpha");

        let old_table = extractor.resolved_table(Some("1.6.0"));
        assert_eq!(old_table.len(), 2);
    }

    #[test]
    fn every_property_name_is_unique() {
        let mut names: Vec<&str> = ALL_PROPERTIES.iter().map(|p| p.json_name).collect();
        names.sort_unstable();
        let mut deduped = names.clone();
        deduped.dedup();
        assert_eq!(names.len(), deduped.len());
    }
}
