//! Physical-to-genetic position interpolation.

use std::{
    io::BufRead,
    path::Path,
};
use crate::{
    Error,
    err::{error, add_path},
    ext,
};
use super::{UNITS_PER_CM, cm_to_units};

/// Monotone piecewise-linear map from physical positions (bp) to genetic coordinates (1e-6 cM).
///
/// Outside of the map points, as well as for an empty map, the uniform rate of 1 cM/Mb is used
/// (one genetic unit per base pair).
#[derive(Clone, Debug, Default)]
pub struct GeneticMap {
    /// Physical positions, strictly increasing.
    positions: Vec<u64>,
    /// Genetic coordinates, non-decreasing.
    coords: Vec<u64>,
}

impl GeneticMap {
    /// Uniform 1 cM/Mb map.
    pub fn uniform() -> Self {
        Self::default()
    }

    /// Creates genetic map from `(position bp, position cM)` pairs.
    pub fn from_points(points: impl IntoIterator<Item = (u32, f64)>) -> Result<Self, Error> {
        let mut positions = Vec::new();
        let mut coords = Vec::new();
        for (pos, cm) in points {
            let coord = cm_to_units(cm).ok_or_else(||
                error!(InvalidData, "Genetic position {} at {} bp must be finite and non-negative", cm, pos))?;
            let pos = u64::from(pos);
            if let Some(&last_pos) = positions.last() {
                if pos <= last_pos {
                    return Err(error!(InvalidData,
                        "Genetic map positions are not in ascending order ({} after {})", pos, last_pos));
                }
                let last_coord = *coords.last().unwrap();
                if coord < last_coord {
                    return Err(error!(InvalidData,
                        "Genetic map decreases at position {} ({} -> {} cM)",
                        pos, last_coord as f64 / UNITS_PER_CM as f64, cm));
                }
            }
            positions.push(pos);
            coords.push(coord);
        }
        Ok(Self { positions, coords })
    }

    /// Loads genetic map for one chromosome from a whitespace separated file with four columns:
    /// `chrom position_bp rate_cM_per_Mb position_cM`. Rate column is ignored.
    /// Empty lines, comments and a header line are skipped. Chromosome names are compared
    /// ignoring the `chr` prefix.
    pub fn load(filename: &Path, chrom: &str) -> Result<Self, Error> {
        let reader = ext::sys::open(filename).map_err(add_path!(filename))?;
        let target = strip_chr(chrom);
        let mut points = Vec::new();
        for (line_num, line) in reader.lines().enumerate() {
            let line = line.map_err(add_path!(filename))?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 4 {
                return Err(error!(ParsingError, "{}:{}: expected 4 columns, found {}",
                    ext::fmt::path(filename), line_num + 1, parts.len()));
            }
            let pos = match parts[1].parse::<u32>() {
                Ok(val) => val,
                // Header.
                Err(_) if line_num == 0 => continue,
                Err(_) => return Err(error!(ParsingError, "{}:{}: cannot parse position '{}'",
                    ext::fmt::path(filename), line_num + 1, parts[1])),
            };
            if strip_chr(parts[0]) != target {
                continue;
            }
            let cm: f64 = parts[3].parse().map_err(|_| error!(ParsingError, "{}:{}: cannot parse genetic position '{}'",
                ext::fmt::path(filename), line_num + 1, parts[3]))?;
            points.push((pos, cm));
        }
        if points.is_empty() {
            log::warn!("Genetic map {} has no entries for {}, using uniform 1 cM/Mb rate",
                ext::fmt::path(filename), chrom);
        }
        Self::from_points(points)
    }

    /// Number of map points.
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Genetic coordinate of the physical position.
    pub fn coord(&self, pos: u32) -> u64 {
        let pos = u64::from(pos);
        let n = self.positions.len();
        if n == 0 {
            return pos;
        }
        // First map point with position > pos.
        let j = self.positions.partition_point(|&p| p <= pos);
        if j == 0 {
            self.coords[0].saturating_sub(self.positions[0] - pos)
        } else if j == n {
            self.coords[n - 1] + (pos - self.positions[n - 1])
        } else {
            let (p0, p1) = (self.positions[j - 1], self.positions[j]);
            let (c0, c1) = (self.coords[j - 1], self.coords[j]);
            c0 + ((u128::from(c1 - c0) * u128::from(pos - p0)) / u128::from(p1 - p0)) as u64
        }
    }

    /// Smallest physical position with genetic coordinate at least `coord`.
    pub fn first_pos(&self, coord: u64) -> u64 {
        let n = self.coords.len();
        if n == 0 {
            return coord;
        }
        // First map point with coordinate >= coord.
        let j = self.coords.partition_point(|&c| c < coord);
        if coord == 0 {
            0
        } else if j == 0 {
            self.positions[0].saturating_sub(self.coords[0] - coord)
        } else if j == n {
            self.positions[n - 1] + (coord - self.coords[n - 1])
        } else {
            let (p0, p1) = (self.positions[j - 1], self.positions[j]);
            let (c0, c1) = (self.coords[j - 1], self.coords[j]);
            // c0 < coord <= c1, therefore c1 > c0.
            let num = u128::from(coord - c0) * u128::from(p1 - p0);
            let den = u128::from(c1 - c0);
            p0 + ((num + den - 1) / den) as u64
        }
    }
}

fn strip_chr(name: &str) -> &str {
    name.strip_prefix("chr").unwrap_or(name)
}
