//! Open options and create parameters.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::block::{Capabilities, BDRV_SECTOR_SIZE};
use crate::error::{GlusterError, Result};

/// Option dictionary handed to `open`.
pub type OptionsDict = BTreeMap<String, String>;

/// Virtual disk size in bytes.
pub const BLOCK_OPT_SIZE: &str = "size";
/// Preallocation mode.
pub const BLOCK_OPT_PREALLOC: &str = "preallocation";

/// Value type of an option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OptionType {
    /// Free text.
    String,
    /// Byte count, optionally with a `k`, `M`, `G` or `T` suffix.
    Size,
}

/// Describes one accepted option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OptionDesc {
    /// Option name.
    pub name: &'static str,
    /// Value type.
    #[serde(rename = "type")]
    pub kind: OptionType,
    /// One-line description.
    pub help: &'static str,
}

/// Options `open` absorbs from its dictionary.
pub const GLUSTER_RUNTIME_OPTS: &[OptionDesc] = &[OptionDesc {
    name: "filename",
    kind: OptionType::String,
    help: "URL to the gluster image",
}];

/// Parameters `create` accepts.
pub const GLUSTER_CREATE_OPTIONS: &[OptionDesc] = &[
    OptionDesc {
        name: BLOCK_OPT_SIZE,
        kind: OptionType::Size,
        help: "Virtual disk size",
    },
    OptionDesc {
        name: BLOCK_OPT_PREALLOC,
        kind: OptionType::String,
        help: "Preallocation mode (allowed values: off, full)",
    },
];

/// Removes the runtime options from `options` and returns the image location.
///
/// Options that are not runtime options stay in the dictionary.
pub fn absorb_runtime_opts(options: &mut OptionsDict) -> Result<String> {
    let mut filename = None;
    for desc in GLUSTER_RUNTIME_OPTS {
        if let Some(value) = options.remove(desc.name) {
            filename = Some(value);
        }
    }
    filename.ok_or(GlusterError::MissingFilename)
}

/// Parses a byte count such as `4096`, `64k`, `10M` or `1.5G`.
pub fn parse_size(value: &str) -> Result<u64> {
    let invalid = || GlusterError::InvalidOption {
        name: BLOCK_OPT_SIZE.to_string(),
        reason: format!("'{}' is not a valid size", value),
    };

    let value = value.trim();
    let (number, shift) = match value.char_indices().last() {
        Some((idx, suffix)) if suffix.is_ascii_alphabetic() => {
            let shift = match suffix.to_ascii_lowercase() {
                'b' => 0,
                'k' => 10,
                'm' => 20,
                'g' => 30,
                't' => 40,
                _ => return Err(invalid()),
            };
            (&value[..idx], shift)
        }
        _ => (value, 0),
    };

    if let Ok(n) = number.parse::<u64>() {
        return n.checked_mul(1u64 << shift).ok_or_else(invalid);
    }
    let n: f64 = number.parse().map_err(|_| invalid())?;
    let bytes = n * (1u64 << shift) as f64;
    if !bytes.is_finite() || bytes < 0.0 || bytes >= u64::MAX as f64 {
        return Err(invalid());
    }
    Ok(bytes as u64)
}

/// Value of a create parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptionValue {
    /// A byte count.
    Size(u64),
    /// Text; `None` when the parameter was given without a value.
    String(Option<String>),
}

/// One create parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateOption {
    /// Parameter name.
    pub name: String,
    /// Parameter value.
    pub value: OptionValue,
}

impl CreateOption {
    /// A `size` parameter.
    pub fn size(bytes: u64) -> Self {
        Self {
            name: BLOCK_OPT_SIZE.to_string(),
            value: OptionValue::Size(bytes),
        }
    }

    /// A `preallocation` parameter.
    pub fn preallocation(mode: Option<&str>) -> Self {
        Self {
            name: BLOCK_OPT_PREALLOC.to_string(),
            value: OptionValue::String(mode.map(str::to_string)),
        }
    }

    /// Builds a parameter from text, typed by [`GLUSTER_CREATE_OPTIONS`].
    /// Names not listed there are kept as text.
    pub fn parse(name: &str, value: &str) -> Result<Self> {
        let kind = GLUSTER_CREATE_OPTIONS
            .iter()
            .find(|desc| desc.name == name)
            .map(|desc| desc.kind)
            .unwrap_or(OptionType::String);
        let value = match kind {
            OptionType::Size => OptionValue::Size(parse_size(value)?),
            OptionType::String => OptionValue::String(Some(value.to_string())),
        };
        Ok(Self {
            name: name.to_string(),
            value,
        })
    }
}

/// Preallocation performed by `create`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreallocMode {
    /// Sparse image.
    #[default]
    Off,
    /// Zero-fill the whole image.
    Full,
}

impl PreallocMode {
    /// Parses a mode. A missing value means `off`; `full` needs zero-fill.
    pub fn parse(value: Option<&str>, caps: Capabilities) -> Result<Self> {
        match value {
            None | Some("off") => Ok(PreallocMode::Off),
            Some("full") if caps.zerofill => Ok(PreallocMode::Full),
            Some(mode) => Err(GlusterError::InvalidPreallocation {
                mode: mode.to_string(),
            }),
        }
    }
}

/// Largest image, in sectors, whose byte size still fits an `i64`.
const MAX_TOTAL_SECTORS: i64 = i64::MAX / BDRV_SECTOR_SIZE;

/// Validated create parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CreateParams {
    /// Image size in whole sectors.
    pub total_sectors: i64,
    /// Preallocation mode.
    pub prealloc: PreallocMode,
}

impl CreateParams {
    /// Scans `options` for `size` and `preallocation`; anything else is
    /// ignored. The size is rounded down to whole sectors.
    pub fn parse(options: &[CreateOption], caps: Capabilities) -> Result<Self> {
        let mut params = CreateParams::default();
        for opt in options {
            match (opt.name.as_str(), &opt.value) {
                (BLOCK_OPT_SIZE, OptionValue::Size(bytes)) => {
                    params.total_sectors = i64::try_from(*bytes / BDRV_SECTOR_SIZE as u64)
                        .ok()
                        .filter(|&sectors| sectors <= MAX_TOTAL_SECTORS)
                        .ok_or_else(|| GlusterError::InvalidOption {
                            name: opt.name.clone(),
                            reason: format!("{} bytes exceeds the largest image size", bytes),
                        })?;
                }
                (BLOCK_OPT_PREALLOC, OptionValue::String(mode)) => {
                    params.prealloc = PreallocMode::parse(mode.as_deref(), caps)?;
                }
                (BLOCK_OPT_SIZE, _) | (BLOCK_OPT_PREALLOC, _) => {
                    return Err(GlusterError::InvalidOption {
                        name: opt.name.clone(),
                        reason: "value has the wrong type".to_string(),
                    });
                }
                _ => {}
            }
        }
        Ok(params)
    }

    /// Image size in bytes.
    pub fn size_bytes(&self) -> i64 {
        self.total_sectors * BDRV_SECTOR_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ZEROFILL: Capabilities = Capabilities {
        discard: true,
        zerofill: true,
    };

    #[test]
    fn test_absorb_filename() {
        let mut opts = OptionsDict::new();
        opts.insert("filename".into(), "gluster://h/v/i".into());
        opts.insert("cache".into(), "none".into());
        assert_eq!(absorb_runtime_opts(&mut opts).unwrap(), "gluster://h/v/i");
        assert!(!opts.contains_key("filename"));
        assert!(opts.contains_key("cache"));
    }

    #[test]
    fn test_absorb_missing_filename() {
        let mut opts = OptionsDict::new();
        assert!(matches!(
            absorb_runtime_opts(&mut opts),
            Err(GlusterError::MissingFilename)
        ));
    }

    #[test]
    fn test_parse_size_suffixes() {
        assert_eq!(parse_size("4096").unwrap(), 4096);
        assert_eq!(parse_size("64k").unwrap(), 65536);
        assert_eq!(parse_size("1M").unwrap(), 1 << 20);
        assert_eq!(parse_size("1.5G").unwrap(), 3 << 29);
        assert_eq!(parse_size("2T").unwrap(), 2 << 40);
        assert_eq!(parse_size("512b").unwrap(), 512);
        assert!(parse_size("").is_err());
        assert!(parse_size("10X").is_err());
        assert!(parse_size("-1").is_err());
        assert!(parse_size("99999999999T").is_err());
    }

    #[test]
    fn test_create_params_size_in_sectors() {
        let params = CreateParams::parse(&[CreateOption::size(1_048_576)], ZEROFILL).unwrap();
        assert_eq!(params.total_sectors, 2048);
        assert_eq!(params.size_bytes(), 1_048_576);
        assert_eq!(params.prealloc, PreallocMode::Off);

        let params = CreateParams::parse(&[CreateOption::size(1000)], ZEROFILL).unwrap();
        assert_eq!(params.size_bytes(), 512);
    }

    #[test]
    fn test_create_params_size_limit() {
        let largest = (i64::MAX as u64 / 512) * 512;
        let params = CreateParams::parse(&[CreateOption::size(largest)], ZEROFILL).unwrap();
        assert_eq!(params.size_bytes() as u64, largest);
        let params = CreateParams::parse(&[CreateOption::size(largest + 511)], ZEROFILL).unwrap();
        assert_eq!(params.size_bytes() as u64, largest);

        for bytes in [largest + 512, u64::MAX] {
            let err = CreateParams::parse(&[CreateOption::size(bytes)], ZEROFILL).unwrap_err();
            assert!(matches!(err, GlusterError::InvalidOption { ref name, .. } if name == "size"));
            assert_eq!(err.to_errno(), libc::EINVAL);
        }
        let err = CreateOption::parse("size", "9000000T")
            .and_then(|opt| CreateParams::parse(&[opt], ZEROFILL))
            .unwrap_err();
        assert_eq!(err.to_errno(), libc::EINVAL);
    }

    #[test]
    fn test_prealloc_modes() {
        assert_eq!(PreallocMode::parse(None, Capabilities::NONE).unwrap(), PreallocMode::Off);
        assert_eq!(
            PreallocMode::parse(Some("off"), Capabilities::NONE).unwrap(),
            PreallocMode::Off
        );
        assert_eq!(PreallocMode::parse(Some("full"), ZEROFILL).unwrap(), PreallocMode::Full);
        assert!(matches!(
            PreallocMode::parse(Some("full"), Capabilities::NONE),
            Err(GlusterError::InvalidPreallocation { .. })
        ));
        assert!(PreallocMode::parse(Some("metadata"), ZEROFILL).is_err());
    }

    #[test]
    fn test_create_params_rejects_wrong_type() {
        let opts = [CreateOption {
            name: BLOCK_OPT_SIZE.to_string(),
            value: OptionValue::String(Some("big".into())),
        }];
        let err = CreateParams::parse(&opts, ZEROFILL).unwrap_err();
        assert_eq!(err.to_errno(), libc::EINVAL);
    }

    #[test]
    fn test_create_params_ignores_unknown() {
        let opts = [
            CreateOption::parse("cluster_size", "64k").unwrap(),
            CreateOption::parse("size", "10M").unwrap(),
            CreateOption::preallocation(None),
        ];
        let params = CreateParams::parse(&opts, ZEROFILL).unwrap();
        assert_eq!(params.size_bytes(), 10 << 20);
        assert_eq!(params.prealloc, PreallocMode::Off);
    }

    #[test]
    fn test_create_option_schema() {
        let names: Vec<&str> = GLUSTER_CREATE_OPTIONS.iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["size", "preallocation"]);
        assert_eq!(GLUSTER_RUNTIME_OPTS[0].help, "URL to the gluster image");
    }
}
