// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Resource quantity parsing and memory unit conversion.
//!
//! Memory figures arrive in orchestrator notation (`512Mi`, `2Gi`) and are
//! stored on run records in megabytes. Binary (`Ki`/`Mi`/`Gi`) and decimal-looking
//! (`KB`/`MB`/`GB`) units share the same 1024-based factors, so converting between
//! them never introduces a 1000/1024 drift.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Errors from quantity parsing.
#[derive(Debug, Error, PartialEq)]
pub enum UnitError {
    /// The unit suffix is not recognized.
    #[error("Unknown memory unit: {0}")]
    UnknownUnit(String),

    /// The numeric part could not be parsed.
    #[error("Invalid quantity: {0}")]
    InvalidQuantity(String),
}

/// A memory unit. Every multiple is a power of 1024.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryUnit {
    /// Bytes.
    Bytes,
    /// Kibibytes (`Ki`).
    Ki,
    /// Mebibytes (`Mi`).
    Mi,
    /// Gibibytes (`Gi`).
    Gi,
    /// Tebibytes (`Ti`).
    Ti,
    /// Kilobytes (`KB`), 1024 bytes.
    Kb,
    /// Megabytes (`MB`), 1024 KB.
    Mb,
    /// Gigabytes (`GB`), 1024 MB.
    Gb,
    /// Terabytes (`TB`), 1024 GB.
    Tb,
}

const KIB: f64 = 1024.0;
const MIB: f64 = KIB * 1024.0;
const GIB: f64 = MIB * 1024.0;
const TIB: f64 = GIB * 1024.0;

impl MemoryUnit {
    /// Number of bytes in one unit.
    pub fn factor(self) -> f64 {
        match self {
            MemoryUnit::Bytes => 1.0,
            MemoryUnit::Ki | MemoryUnit::Kb => KIB,
            MemoryUnit::Mi | MemoryUnit::Mb => MIB,
            MemoryUnit::Gi | MemoryUnit::Gb => GIB,
            MemoryUnit::Ti | MemoryUnit::Tb => TIB,
        }
    }

    /// Canonical suffix for this unit.
    pub fn suffix(self) -> &'static str {
        match self {
            MemoryUnit::Bytes => "B",
            MemoryUnit::Ki => "Ki",
            MemoryUnit::Mi => "Mi",
            MemoryUnit::Gi => "Gi",
            MemoryUnit::Ti => "Ti",
            MemoryUnit::Kb => "KB",
            MemoryUnit::Mb => "MB",
            MemoryUnit::Gb => "GB",
            MemoryUnit::Tb => "TB",
        }
    }
}

impl fmt::Display for MemoryUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

impl FromStr for MemoryUnit {
    type Err = UnitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "B" => Ok(MemoryUnit::Bytes),
            "Ki" => Ok(MemoryUnit::Ki),
            "Mi" => Ok(MemoryUnit::Mi),
            "Gi" => Ok(MemoryUnit::Gi),
            "Ti" => Ok(MemoryUnit::Ti),
            "K" | "k" | "KB" | "kB" => Ok(MemoryUnit::Kb),
            "M" | "MB" => Ok(MemoryUnit::Mb),
            "G" | "GB" => Ok(MemoryUnit::Gb),
            "T" | "TB" => Ok(MemoryUnit::Tb),
            other => Err(UnitError::UnknownUnit(other.to_string())),
        }
    }
}

/// Convert a memory amount between units.
pub fn convert_memory(value: f64, from: MemoryUnit, to: MemoryUnit) -> f64 {
    if from.factor() == to.factor() {
        return value;
    }
    value * from.factor() / to.factor()
}

/// Split `"512Mi"` into `("512", "Mi")`.
fn split_quantity(quantity: &str) -> (&str, &str) {
    let quantity = quantity.trim();
    let idx = quantity
        .find(|c: char| c.is_ascii_alphabetic())
        .unwrap_or(quantity.len());
    quantity.split_at(idx)
}

/// Parse a memory quantity such as `512Mi`, `1.5GB` or `1048576` into bytes.
pub fn parse_memory_quantity(quantity: &str) -> Result<f64, UnitError> {
    let (number, suffix) = split_quantity(quantity);
    let value: f64 = number
        .parse()
        .map_err(|_| UnitError::InvalidQuantity(quantity.to_string()))?;
    let unit: MemoryUnit = suffix.parse()?;
    Ok(value * unit.factor())
}

/// Parse a memory quantity and express it in `unit`.
pub fn parse_memory_as(quantity: &str, unit: MemoryUnit) -> Result<f64, UnitError> {
    Ok(parse_memory_quantity(quantity)? / unit.factor())
}

/// Parse a CPU quantity (`250m`, `1.5`, `120000000n`) into cores.
pub fn parse_cpu_quantity(quantity: &str) -> Result<f64, UnitError> {
    let (number, suffix) = split_quantity(quantity);
    let value: f64 = number
        .parse()
        .map_err(|_| UnitError::InvalidQuantity(quantity.to_string()))?;
    let divisor = match suffix {
        "" => 1.0,
        "m" => 1_000.0,
        "u" => 1_000_000.0,
        "n" => 1_000_000_000.0,
        other => return Err(UnitError::UnknownUnit(other.to_string())),
    };
    Ok(value / divisor)
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPSILON: f64 = 1e-9;

    #[test]
    fn test_binary_round_trip_is_exact() {
        let gi = convert_memory(1024.0, MemoryUnit::Mi, MemoryUnit::Gi);
        assert!((gi - 1.0).abs() < EPSILON);
        let mi = convert_memory(gi, MemoryUnit::Gi, MemoryUnit::Mi);
        assert!((mi - 1024.0).abs() < EPSILON);
    }

    #[test]
    fn test_decimal_labels_use_binary_factors() {
        assert_eq!(convert_memory(1.0, MemoryUnit::Gb, MemoryUnit::Mb), 1024.0);
        assert_eq!(convert_memory(512.0, MemoryUnit::Mi, MemoryUnit::Mb), 512.0);
        assert_eq!(convert_memory(3.0, MemoryUnit::Gi, MemoryUnit::Gb), 3.0);
        assert_eq!(convert_memory(2048.0, MemoryUnit::Ki, MemoryUnit::Mb), 2.0);
    }

    #[test]
    fn test_odd_values_survive_round_trip() {
        for value in [0.1, 3.7, 1234.5678, 1e6] {
            let there = convert_memory(value, MemoryUnit::Ki, MemoryUnit::Gb);
            let back = convert_memory(there, MemoryUnit::Gb, MemoryUnit::Ki);
            assert!((back - value).abs() < EPSILON, "{value} drifted to {back}");
        }
    }

    #[test]
    fn test_parse_memory_quantity() {
        assert_eq!(parse_memory_quantity("512Mi").unwrap(), 512.0 * MIB);
        assert_eq!(parse_memory_quantity("2Gi").unwrap(), 2.0 * GIB);
        assert_eq!(parse_memory_quantity("1.5GB").unwrap(), 1.5 * GIB);
        assert_eq!(parse_memory_quantity("4096").unwrap(), 4096.0);
        assert_eq!(parse_memory_as("2Gi", MemoryUnit::Mb).unwrap(), 2048.0);
    }

    #[test]
    fn test_parse_memory_quantity_rejects_garbage() {
        assert_eq!(
            parse_memory_quantity("12Zi"),
            Err(UnitError::UnknownUnit("Zi".to_string()))
        );
        assert!(matches!(
            parse_memory_quantity("Mi"),
            Err(UnitError::InvalidQuantity(_))
        ));
    }

    #[test]
    fn test_parse_cpu_quantity() {
        assert!((parse_cpu_quantity("250m").unwrap() - 0.25).abs() < EPSILON);
        assert!((parse_cpu_quantity("2").unwrap() - 2.0).abs() < EPSILON);
        assert!((parse_cpu_quantity("1500000000n").unwrap() - 1.5).abs() < EPSILON);
        assert!(parse_cpu_quantity("3x").is_err());
    }
}
