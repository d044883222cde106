//! Numeric precision of compiled engines

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Precision mode an engine is compiled for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    /// Full precision
    Fp32,
    /// Half precision
    #[default]
    Fp16,
    /// Reduced precision, requires calibration data
    Int8,
}

impl Precision {
    /// Get string representation (also used in artifact file names)
    pub fn as_str(&self) -> &'static str {
        match self {
            Precision::Fp32 => "fp32",
            Precision::Fp16 => "fp16",
            Precision::Int8 => "int8",
        }
    }

    pub fn requires_calibration(&self) -> bool {
        matches!(self, Precision::Int8)
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Precision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fp32" | "float" => Ok(Precision::Fp32),
            "fp16" | "half" => Ok(Precision::Fp16),
            "int8" => Ok(Precision::Int8),
            other => Err(format!("unknown precision '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        assert_eq!("FP16".parse::<Precision>().unwrap(), Precision::Fp16);
        assert_eq!(Precision::Int8.to_string(), "int8");
        assert!("bf16".parse::<Precision>().is_err());
        assert!(Precision::Int8.requires_calibration());
        assert!(!Precision::Fp32.requires_calibration());
    }
}
