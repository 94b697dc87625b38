/// Coordinate file reader and writer anchoring the local frame to UTM
use crate::error::Result;
use crate::utm::{self, Hemisphere};
use log::warn;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

/// Parsed coordinate file.
/// When `is_valid` is false no other field may be used.
#[derive(Debug, Clone, PartialEq)]
pub struct Georef {
    pub utm_zone: u8,
    pub utm_hemisphere: Hemisphere,
    pub utm_east_offset: f64,
    pub utm_north_offset: f64,
    pub is_valid: bool,
}

impl Default for Georef {
    fn default() -> Self {
        Self {
            utm_zone: 0,
            utm_hemisphere: Hemisphere::North,
            utm_east_offset: 0.0,
            utm_north_offset: 0.0,
            is_valid: false,
        }
    }
}

impl Georef {
    /// Read a coordinate file; a missing or malformed file yields an invalid value.
    pub fn read(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(text) => Self::parse(&text).unwrap_or_else(|| {
                warn!("Invalid coordinate file '{}'", path.display());
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    /// Parse the two header lines: `<DATUM> UTM <zone><N|S>` and `<x> <y>`.
    pub fn parse(text: &str) -> Option<Self> {
        let mut lines = text.lines();

        let header: Vec<&str> = lines.next()?.split_whitespace().collect();
        if header.len() != 3 {
            return None;
        }
        let zone_token = header[2];
        let hemisphere = Hemisphere::from_char(zone_token.chars().last()?)?;
        let zone: u8 = zone_token[..zone_token.len() - 1].parse().ok()?;
        if !(1..=60).contains(&zone) {
            return None;
        }

        let offsets: Vec<&str> = lines.next()?.split_whitespace().collect();
        if offsets.len() != 2 {
            return None;
        }
        let east = offsets[0].parse().ok()?;
        let north = offsets[1].parse().ok()?;

        Some(Self {
            utm_zone: zone,
            utm_hemisphere: hemisphere,
            utm_east_offset: east,
            utm_north_offset: north,
            is_valid: true,
        })
    }

    /// PROJ string for the zone, `None` when invalid.
    pub fn proj_string(&self) -> Option<String> {
        self.is_valid
            .then(|| utm::proj_string(self.utm_zone, self.utm_hemisphere))
    }

    /// Write a coordinate file: header, offsets, then one local point per line.
    pub fn write_coords(
        path: &Path,
        zone: u8,
        hemisphere: Hemisphere,
        east_offset: f64,
        north_offset: f64,
        points: &[(f64, f64, f64)],
    ) -> Result<()> {
        let mut text = format!(
            "WGS84 UTM {}{}\n{} {}\n",
            zone,
            hemisphere.as_char(),
            east_offset,
            north_offset
        );
        for (x, y, z) in points {
            let _ = writeln!(text, "{x} {y} {z}");
        }
        fs::write(path, text)?;
        Ok(())
    }
}
