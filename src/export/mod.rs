//! CSV export of one day's stored readings.

use crate::models::Reading;
use anyhow::{Context, Result};
use std::fs::File;
use std::io::Write;
use std::path::Path;
use tracing::info;

/// Write `readings` as CSV with a header row. Returns the number of rows written.
pub fn write_csv<W: Write>(readings: &[Reading], out: W) -> Result<usize> {
    let mut writer = csv::Writer::from_writer(out);
    for r in readings {
        writer.serialize(r).with_context(|| format!("write row {}", r))?;
    }
    writer.flush().context("flush CSV output")?;
    Ok(readings.len())
}

pub fn write_csv_file(readings: &[Reading], path: &Path) -> Result<usize> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Could not create dir {:?}", parent))?;
    }
    let file = File::create(path).with_context(|| format!("Could not create {:?}", path))?;
    let n = write_csv(readings, file)?;
    info!("Wrote {} readings to {:?}", n, path);
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_csv_has_header_and_keeps_empty_fields() {
        let readings = vec![Reading {
            city: "北京市".to_string(),
            aqi: "43".to_string(),
            contaminant: String::new(),
            date: "2018-08-01".to_string(),
            level: "优".to_string(),
        }];

        let mut buf = Vec::new();
        assert_eq!(write_csv(&readings, &mut buf).unwrap(), 1);

        let text = String::from_utf8(buf).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("city,aqi,contaminant,date,level"));
        assert_eq!(lines.next(), Some("北京市,43,,2018-08-01,优"));
        assert_eq!(lines.next(), None);
    }

    #[test]
    fn test_empty_day_writes_nothing() {
        let mut buf = Vec::new();
        assert_eq!(write_csv(&[], &mut buf).unwrap(), 0);
        assert!(buf.is_empty());
    }
}
