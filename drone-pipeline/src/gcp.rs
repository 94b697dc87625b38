/// Ground control point file parsing and derived copies
use crate::error::{PipelineError, Result};
use log::{info, warn};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

/// One surveyed point observed in one image.
#[derive(Debug, Clone, PartialEq)]
pub struct GcpEntry {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub px: f64,
    pub py: f64,
    pub filename: String,
    /// Any trailing tokens after the image name, kept verbatim.
    pub extras: Vec<String>,
}

impl GcpEntry {
    fn parse(line: &str) -> Option<Self> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() < 6 {
            return None;
        }
        Some(Self {
            x: tokens[0].parse().ok()?,
            y: tokens[1].parse().ok()?,
            z: tokens[2].parse().ok()?,
            px: tokens[3].parse().ok()?,
            py: tokens[4].parse().ok()?,
            filename: tokens[5].to_string(),
            extras: tokens[6..].iter().map(|t| t.to_string()).collect(),
        })
    }

    /// Key identifying the surveyed point regardless of image.
    fn coords_key(&self) -> String {
        format!("{} {} {}", self.x, self.y, self.z)
    }

    fn to_line(&self) -> String {
        let mut line = format!(
            "{} {} {} {} {} {}",
            self.x, self.y, self.z, self.px, self.py, self.filename
        );
        for extra in &self.extras {
            line.push(' ');
            line.push_str(extra);
        }
        line
    }
}

/// A GCP file: SRS header plus entries.
#[derive(Debug, Clone)]
pub struct GcpFile {
    pub path: PathBuf,
    pub srs: String,
    pub entries: Vec<GcpEntry>,
}

impl GcpFile {
    pub fn read(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(PipelineError::missing("GCP file", path));
        }
        let text = fs::read_to_string(path)?;
        let mut lines = text.lines();

        let srs = lines
            .by_ref()
            .map(|l| strip_comment(l).trim())
            .find(|l| !l.is_empty())
            .ok_or_else(|| PipelineError::malformed("GCP file", "missing SRS header"))?
            .to_string();

        let mut entries = Vec::new();
        for line in lines {
            let content = strip_comment(line).trim();
            if content.is_empty() {
                continue;
            }
            match GcpEntry::parse(content) {
                Some(entry) => entries.push(entry),
                None => warn!("Malformed GCP line (skipped): {line}"),
            }
        }

        Ok(Self {
            path: path.to_path_buf(),
            srs,
            entries,
        })
    }

    pub fn entries_count(&self) -> usize {
        self.entries.len()
    }

    /// Warn about GCPs tagged in too few images, or too few GCPs overall.
    /// Returns the number of distinct points.
    pub fn check_entries(&self) -> usize {
        let mut per_point: BTreeMap<String, usize> = BTreeMap::new();
        for entry in &self.entries {
            *per_point.entry(entry.coords_key()).or_default() += 1;
        }
        for (coords, count) in &per_point {
            if *count < 3 {
                warn!("GCP {coords} is marked in only {count} image(s); at least 3 are recommended");
            }
        }
        if per_point.len() < 3 {
            warn!(
                "Only {} GCP(s) found; at least 3 are needed for georeferencing",
                per_point.len()
            );
        }
        per_point.len()
    }

    fn write(&self, out: &Path, entries: &[GcpEntry]) -> Result<()> {
        let mut text = format!("{}\n", self.srs);
        for entry in entries {
            let _ = writeln!(text, "{}", entry.to_line());
        }
        fs::write(out, text)?;
        Ok(())
    }

    /// Copy with pixel coordinates scaled by `ratio` (for resized images).
    pub fn make_resized_copy(&self, out: &Path, ratio: f64) -> Result<()> {
        let resized: Vec<GcpEntry> = self
            .entries
            .iter()
            .map(|e| GcpEntry {
                px: e.px * ratio,
                py: e.py * ratio,
                ..e.clone()
            })
            .collect();
        self.write(out, &resized)
    }

    /// Copy keeping only entries whose image exists in `images_dir`.
    /// Nothing is written when fewer than `min_images` entries survive.
    pub fn make_filtered_copy(&self, out: &Path, images_dir: &Path, min_images: usize) -> Result<bool> {
        let kept: Vec<GcpEntry> = self
            .entries
            .iter()
            .filter(|e| images_dir.join(&e.filename).exists())
            .cloned()
            .collect();

        if kept.len() < min_images {
            warn!(
                "Only {} GCP entries reference available images, not writing {}",
                kept.len(),
                out.display()
            );
            return Ok(false);
        }
        self.write(out, &kept)?;
        info!("Wrote {} GCP entries to {}", kept.len(), out.display());
        Ok(true)
    }

    /// Distinct image names referenced by the file.
    pub fn images(&self) -> BTreeSet<&str> {
        self.entries.iter().map(|e| e.filename.as_str()).collect()
    }
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(idx) => &line[..idx],
        None => line,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const SAMPLE: &str = "\
+proj=utm +zone=32 +datum=WGS84 +units=m +no_defs
# surveyed on site
322263.0 5157982.0 120.5 1024 768 IMG_0001.JPG
322263.0 5157982.0 120.5 900 700 IMG_0002.JPG gcp1
322300.0 5158000.0 121.0 10 20
322300.0 5158000.0 121.0 10 20 IMG_0003.JPG # trailing comment
";

    fn sample_file(dir: &Path) -> GcpFile {
        let path = dir.join("gcp_list.txt");
        fs::write(&path, SAMPLE).unwrap();
        GcpFile::read(&path).unwrap()
    }

    #[test]
    fn parses_header_and_skips_malformed_lines() {
        let dir = tempdir().unwrap();
        let gcp = sample_file(dir.path());
        assert!(gcp.srs.starts_with("+proj=utm"));
        assert_eq!(gcp.entries_count(), 3);
        assert_eq!(gcp.entries[1].extras, vec!["gcp1"]);
        assert_eq!(gcp.check_entries(), 2);
    }

    #[test]
    fn resized_copy_scales_pixels() {
        let dir = tempdir().unwrap();
        let gcp = sample_file(dir.path());
        let out = dir.path().join("resized.txt");
        gcp.make_resized_copy(&out, 0.5).unwrap();

        let resized = GcpFile::read(&out).unwrap();
        assert_eq!(resized.entries[0].px, 512.0);
        assert_eq!(resized.entries[0].py, 384.0);
        assert_eq!(resized.srs, gcp.srs);
    }

    #[test]
    fn filtered_copy_requires_minimum() {
        let dir = tempdir().unwrap();
        let gcp = sample_file(dir.path());
        let images = dir.path().join("images");
        fs::create_dir_all(&images).unwrap();
        fs::write(images.join("IMG_0001.JPG"), b"").unwrap();

        let out = dir.path().join("filtered.txt");
        assert!(!gcp.make_filtered_copy(&out, &images, 3).unwrap());
        assert!(!out.exists());

        assert!(gcp.make_filtered_copy(&out, &images, 1).unwrap());
        assert_eq!(GcpFile::read(&out).unwrap().entries_count(), 1);
    }
}
