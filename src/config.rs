//! Settings file loading.
//!
//! Settings are a flat YAML mapping with dotted keys, e.g.:
//!
//! ```yaml
//! Camera.fps: 30.0
//! Camera.width: 640
//! Camera.height: 480
//! Camera.fx: 458.654
//! Camera.fy: 457.296
//! Camera.cx: 367.215
//! Camera.cy: 248.375
//! Camera.bf: 47.9
//! ORBextractor.nLevels: 8
//! ORBextractor.scaleFactor: 1.2
//! Server.Address: "tcp://0.0.0.0:6767"
//! Publisher.Address: "tcp://0.0.0.0:6768"
//! ```
//!
//! Every missing required key fails startup with a message naming the key.

use std::fs;
use std::path::Path;

use yaml_rust::{Yaml, YamlLoader};

use crate::error::{Error, Result};
use crate::map::{CameraIntrinsics, ScalePyramid};

/// Parsed mapper settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub camera_fps: f64,
    pub camera: CameraIntrinsics,
    pub pyramid: ScalePyramid,
    pub server_address: String,
    pub publisher_address: String,
}

impl Settings {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to open settings file {}: {}", path.display(), e))
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let docs = YamlLoader::load_from_str(text)
            .map_err(|e| Error::Config(format!("settings file is not valid YAML: {}", e)))?;
        let doc = docs
            .first()
            .ok_or_else(|| Error::Config("settings file is empty".into()))?;

        let camera = CameraIntrinsics {
            fx: require_f64(doc, "Camera.fx")?,
            fy: require_f64(doc, "Camera.fy")?,
            cx: require_f64(doc, "Camera.cx")?,
            cy: require_f64(doc, "Camera.cy")?,
            bf: optional_f64(doc, "Camera.bf").unwrap_or(0.0),
            width: require_u32(doc, "Camera.width")?,
            height: require_u32(doc, "Camera.height")?,
        };

        let pyramid = ScalePyramid::new(
            require_u32(doc, "ORBextractor.nLevels")?,
            require_f64(doc, "ORBextractor.scaleFactor")?,
        );

        Ok(Self {
            camera_fps: require_f64(doc, "Camera.fps")?,
            camera,
            pyramid,
            server_address: require_string(doc, "Server.Address")?,
            publisher_address: require_string(doc, "Publisher.Address")?,
        })
    }

    /// The request socket address with any `tcp://` scheme stripped.
    pub fn server_bind_addr(&self) -> &str {
        strip_scheme(&self.server_address)
    }

    /// The publish socket address with any `tcp://` scheme stripped.
    pub fn publisher_bind_addr(&self) -> &str {
        strip_scheme(&self.publisher_address)
    }
}

fn strip_scheme(address: &str) -> &str {
    address
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(address)
}

fn lookup<'a>(doc: &'a Yaml, key: &str) -> Result<&'a Yaml> {
    let value = &doc[key];
    if value.is_badvalue() {
        return Err(Error::Config(format!(
            "{} property is not set",
            key
        )));
    }
    Ok(value)
}

fn require_f64(doc: &Yaml, key: &str) -> Result<f64> {
    let value = lookup(doc, key)?;
    value
        .as_f64()
        .or_else(|| value.as_i64().map(|v| v as f64))
        .ok_or_else(|| Error::Config(format!("{} property is not a number", key)))
}

fn optional_f64(doc: &Yaml, key: &str) -> Option<f64> {
    let value = &doc[key];
    value.as_f64().or_else(|| value.as_i64().map(|v| v as f64))
}

fn require_u32(doc: &Yaml, key: &str) -> Result<u32> {
    let value = lookup(doc, key)?;
    value
        .as_i64()
        .filter(|&v| v >= 0 && v <= u32::MAX as i64)
        .map(|v| v as u32)
        .ok_or_else(|| Error::Config(format!("{} property is not a valid integer", key)))
}

fn require_string(doc: &Yaml, key: &str) -> Result<String> {
    lookup(doc, key)?
        .as_str()
        .map(|s| s.to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            Error::Config(format!(
                "{} property is not set or value is not in quotes",
                key
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    const GOOD: &str = r#"
Camera.fps: 30.0
Camera.width: 640
Camera.height: 480
Camera.fx: 458.654
Camera.fy: 457.296
Camera.cx: 367.215
Camera.cy: 248.375
Camera.bf: 47.9
ORBextractor.nLevels: 8
ORBextractor.scaleFactor: 1.2
Server.Address: "tcp://0.0.0.0:6767"
Publisher.Address: "tcp://0.0.0.0:6768"
"#;

    #[test]
    fn test_parse_complete_settings() {
        let settings = Settings::parse(GOOD).unwrap();
        assert_eq!(settings.camera.width, 640);
        assert_eq!(settings.camera.fx, 458.654);
        assert_eq!(settings.pyramid.n_levels, 8);
        assert_eq!(settings.server_bind_addr(), "0.0.0.0:6767");
        assert_eq!(settings.publisher_bind_addr(), "0.0.0.0:6768");
    }

    #[test]
    fn test_missing_key_names_the_key() {
        let text = GOOD.replace("Server.Address: \"tcp://0.0.0.0:6767\"\n", "");
        match Settings::parse(&text) {
            Err(Error::Config(message)) => assert!(message.contains("Server.Address")),
            other => panic!("expected config error, got {:?}", other),
        }
    }

    #[test]
    fn test_integer_accepted_for_float_key() {
        let text = GOOD.replace("Camera.fps: 30.0", "Camera.fps: 30");
        let settings = Settings::parse(&text).unwrap();
        assert_eq!(settings.camera_fps, 30.0);
    }

    #[test]
    fn test_scheme_is_optional() {
        let text = GOOD.replace("tcp://0.0.0.0:6767", "0.0.0.0:6767");
        let settings = Settings::parse(&text).unwrap();
        assert_eq!(settings.server_bind_addr(), "0.0.0.0:6767");
    }
}
