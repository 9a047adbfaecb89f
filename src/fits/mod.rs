// SPDX-License-Identifier: GPL-3.0-only

//! Typed FITS store (spec §4.6): a thin wrapper around [`fitsio`] (bindings to
//! `cfitsio`) that exposes only the typed operations the rest of the pipeline needs.
//! No caller outside this module ever sees a raw HDU index or a `fitsio` type.

use std::io::Read;
use std::path::Path;

use fitsio::images::{ImageDescription, ImageType};
use fitsio::tables::{ColumnDataType, ColumnDescription};
use fitsio::FitsFile;

use crate::background::BackgroundCalibrationParameters;
use crate::bitmap::{Bitmap, CaptureInfo, Channels, Depth, Range, Space};
use crate::error::{StackError, StackResult};
use crate::stars::{Point, Star};
use crate::transform::Transformation;

/// Selects a HDU either by name or by zero-based index; used by every `read_*`
/// operation's "indexed access" parameter.
#[derive(Debug, Clone)]
pub enum HduRef<'a> {
    Name(&'a str),
    Index(usize),
}

/// A typed FITS file. Wraps a single open [`fitsio::FitsFile`] handle.
pub struct Store {
    file: FitsFile,
}

impl Store {
    /// Opens an existing FITS file, read-only or read-write.
    pub fn open(path: &Path, readonly: bool) -> StackResult<Self> {
        let file = if readonly {
            FitsFile::open(path).map_err(|e| StackError::Format(e.to_string()))?
        } else {
            FitsFile::edit(path).map_err(|e| StackError::Format(e.to_string()))?
        };
        Ok(Store { file })
    }

    /// Creates a new FITS file (truncating an existing one), with a minimal empty
    /// primary HDU.
    pub fn create(path: &Path) -> StackResult<Self> {
        let file = FitsFile::create(path)
            .open()
            .map_err(|e| StackError::Format(e.to_string()))?;
        Ok(Store { file })
    }

    /// Closes the file. Equivalent to dropping the `Store`, spelled out because the
    /// original contract names it explicitly.
    pub fn close(self) {}

    pub fn nb_hdus(&mut self) -> usize {
        let mut n = 0;
        while self.file.hdu(n).is_ok() {
            n += 1;
        }
        n
    }

    pub fn nb_images(&mut self) -> usize {
        self.count_hdus(|hdu| {
            matches!(
                hdu.info,
                fitsio::hdu::HduInfo::ImageInfo { ref shape, .. } if !shape.is_empty()
            )
        })
    }

    pub fn nb_tables(&mut self) -> usize {
        self.count_hdus(|hdu| matches!(hdu.info, fitsio::hdu::HduInfo::TableInfo { .. }))
    }

    fn count_hdus<F>(&mut self, predicate: F) -> usize
    where
        F: Fn(&fitsio::hdu::FitsHdu) -> bool,
    {
        let mut count = 0;
        let mut i = 0;
        loop {
            let Ok(hdu) = self.file.hdu(i) else {
                break;
            };
            if predicate(&hdu) {
                count += 1;
            }
            i += 1;
        }
        count
    }

    fn locate(&mut self, which: &HduRef) -> StackResult<fitsio::hdu::FitsHdu> {
        match which {
            HduRef::Name(name) => self
                .file
                .hdu(*name)
                .map_err(|e| StackError::Format(e.to_string())),
            HduRef::Index(index) => self
                .file
                .hdu(*index)
                .map_err(|e| StackError::Format(e.to_string())),
        }
    }

    /// Writes `bmp` as a new image HDU, preserving depth (via the FITS `BITPIX`),
    /// range (via `DATAMAX`), color space (via the `SRGB` key) and capture metadata.
    pub fn write_bitmap(&mut self, bmp: &Bitmap, name: Option<&str>) -> StackResult<()> {
        let image_type = match bmp.depth() {
            Depth::U8 => ImageType::UnsignedByte,
            Depth::U16 => ImageType::UnsignedShort,
            Depth::U32 => ImageType::UnsignedLong,
            Depth::F32 => ImageType::Float,
            Depth::F64 => ImageType::Double,
        };

        let dimensions = if bmp.channels() == Channels::Three {
            vec![3, bmp.height() as usize, bmp.width() as usize]
        } else {
            vec![bmp.height() as usize, bmp.width() as usize]
        };

        let description = ImageDescription {
            data_type: image_type,
            dimensions: &dimensions,
        };

        let mut hdu = self
            .file
            .create_image(name.unwrap_or("IMAGE"), &description)
            .map_err(|e| StackError::Format(e.to_string()))?;

        let n = bmp.channels().count();
        let mut data = Vec::with_capacity((bmp.width() * bmp.height() * n) as usize);
        for c in 0..n {
            for y in 0..bmp.height() {
                for x in 0..bmp.width() {
                    data.push(bmp.get_raw(x, y, c));
                }
            }
        }

        hdu.write_image(&mut self.file, &data)
            .map_err(|e| StackError::Format(e.to_string()))?;

        hdu.write_key(&mut self.file, "DATAMAX", bmp.range().max())
            .map_err(|e| StackError::Format(e.to_string()))?;
        hdu.write_key(&mut self.file, "SRGB", bmp.space() == Space::SRgb)
            .map_err(|e| StackError::Format(e.to_string()))?;

        if let Some(iso) = bmp.info.iso {
            hdu.write_key(&mut self.file, "ISO", iso)
                .map_err(|e| StackError::Format(e.to_string()))?;
        }
        if let Some(shutter) = bmp.info.shutter_speed {
            hdu.write_key(&mut self.file, "SHUTTER", shutter)
                .map_err(|e| StackError::Format(e.to_string()))?;
        }
        if let Some(aperture) = bmp.info.aperture {
            hdu.write_key(&mut self.file, "APERTURE", aperture)
                .map_err(|e| StackError::Format(e.to_string()))?;
        }
        if let Some(focal) = bmp.info.focal_length {
            hdu.write_key(&mut self.file, "FOCALLEN", focal)
                .map_err(|e| StackError::Format(e.to_string()))?;
        }

        Ok(())
    }

    pub fn read_bitmap(&mut self, which: HduRef) -> StackResult<Bitmap> {
        let hdu = self.locate(&which)?;

        let (shape, image_type) = match &hdu.info {
            fitsio::hdu::HduInfo::ImageInfo { shape, image_type } => (shape.clone(), image_type.clone()),
            _ => return Err(StackError::Format("HDU is not an image".into())),
        };

        let (channels, height, width) = match shape.as_slice() {
            [h, w] => (Channels::One, *h as u32, *w as u32),
            [3, h, w] => (Channels::Three, *h as u32, *w as u32),
            _ => return Err(StackError::Format("unsupported image shape".into())),
        };

        let depth = depth_from_image_type(image_type)?;

        let data_max: f64 = hdu
            .read_key(&mut self.file, "DATAMAX")
            .unwrap_or(Range::One.max());
        let range = range_from_datamax(data_max);

        let srgb: bool = hdu.read_key(&mut self.file, "SRGB").unwrap_or(false);
        let space = if srgb { Space::SRgb } else { Space::Linear };

        let flat: Vec<f64> = hdu
            .read_image(&mut self.file)
            .map_err(|e| StackError::Format(e.to_string()))?;

        let mut bmp = Bitmap::with_range_space(depth, channels, range, space);
        bmp.resize(width, height, None);

        let n = channels.count();
        let plane = (width * height) as usize;
        for c in 0..n {
            for y in 0..height {
                for x in 0..width {
                    let idx = (c as usize) * plane + (y * width + x) as usize;
                    bmp.set_raw(x, y, c, flat[idx]);
                }
            }
        }

        bmp.info = CaptureInfo {
            iso: hdu.read_key(&mut self.file, "ISO").ok(),
            shutter_speed: hdu.read_key(&mut self.file, "SHUTTER").ok(),
            aperture: hdu.read_key(&mut self.file, "APERTURE").ok(),
            focal_length: hdu.read_key(&mut self.file, "FOCALLEN").ok(),
        };

        Ok(bmp)
    }

    /// Writes a star list as a binary table with columns {X, Y, INTENSITY, QUALITY,
    /// MEANRADIUS} and scalar keys `IMAGEW`/`IMAGEH`/`LUMINANCYTHRESHOLD`.
    pub fn write_stars(
        &mut self,
        stars: &[Star],
        image_size: (u32, u32),
        luminancy_threshold: Option<f64>,
        name: &str,
    ) -> StackResult<()> {
        let descriptions = [
            column("X"),
            column("Y"),
            column("INTENSITY"),
            column("QUALITY"),
            column("MEANRADIUS"),
        ];

        let mut hdu = self
            .file
            .create_table(name.to_string(), &descriptions)
            .map_err(|e| StackError::Format(e.to_string()))?;

        let xs: Vec<f64> = stars.iter().map(|s| s.position.x).collect();
        let ys: Vec<f64> = stars.iter().map(|s| s.position.y).collect();
        let intensities: Vec<f64> = stars.iter().map(|s| s.intensity).collect();
        let qualities: Vec<f64> = stars.iter().map(|s| s.quality).collect();
        let radii: Vec<f64> = stars.iter().map(|s| s.mean_radius).collect();

        hdu.write_col(&mut self.file, "X", &xs)
            .map_err(|e| StackError::Format(e.to_string()))?;
        hdu.write_col(&mut self.file, "Y", &ys)
            .map_err(|e| StackError::Format(e.to_string()))?;
        hdu.write_col(&mut self.file, "INTENSITY", &intensities)
            .map_err(|e| StackError::Format(e.to_string()))?;
        hdu.write_col(&mut self.file, "QUALITY", &qualities)
            .map_err(|e| StackError::Format(e.to_string()))?;
        hdu.write_col(&mut self.file, "MEANRADIUS", &radii)
            .map_err(|e| StackError::Format(e.to_string()))?;

        hdu.write_key(&mut self.file, "IMAGEW", image_size.0 as i64)
            .map_err(|e| StackError::Format(e.to_string()))?;
        hdu.write_key(&mut self.file, "IMAGEH", image_size.1 as i64)
            .map_err(|e| StackError::Format(e.to_string()))?;
        if let Some(t) = luminancy_threshold {
            hdu.write_key(&mut self.file, "LUMINANCYTHRESHOLD", t)
                .map_err(|e| StackError::Format(e.to_string()))?;
        }
        hdu.write_key(&mut self.file, "DATATYPE", "STARS")
            .map_err(|e| StackError::Format(e.to_string()))?;

        Ok(())
    }

    pub fn read_stars(&mut self, which: HduRef) -> StackResult<(Vec<Star>, (u32, u32))> {
        let hdu = self.locate(&which)?;

        let xs: Vec<f64> = hdu
            .read_col(&mut self.file, "X")
            .map_err(|e| StackError::Format(e.to_string()))?;
        let ys: Vec<f64> = hdu
            .read_col(&mut self.file, "Y")
            .map_err(|e| StackError::Format(e.to_string()))?;
        let intensities: Vec<f64> = hdu
            .read_col(&mut self.file, "INTENSITY")
            .map_err(|e| StackError::Format(e.to_string()))?;
        let qualities: Vec<f64> = hdu
            .read_col(&mut self.file, "QUALITY")
            .map_err(|e| StackError::Format(e.to_string()))?;
        let radii: Vec<f64> = hdu
            .read_col(&mut self.file, "MEANRADIUS")
            .map_err(|e| StackError::Format(e.to_string()))?;

        let stars = (0..xs.len())
            .map(|i| Star::new(Point::new(xs[i], ys[i]), intensities[i], qualities[i], radii[i]))
            .collect();

        let width: i64 = hdu
            .read_key(&mut self.file, "IMAGEW")
            .map_err(|e| StackError::Format(e.to_string()))?;
        let height: i64 = hdu
            .read_key(&mut self.file, "IMAGEH")
            .map_err(|e| StackError::Format(e.to_string()))?;

        Ok((stars, (width as u32, height as u32)))
    }

    pub fn write_points(&mut self, points: &[Point], name: &str) -> StackResult<()> {
        let descriptions = [column("X"), column("Y")];
        let mut hdu = self
            .file
            .create_table(name.to_string(), &descriptions)
            .map_err(|e| StackError::Format(e.to_string()))?;

        let xs: Vec<f64> = points.iter().map(|p| p.x).collect();
        let ys: Vec<f64> = points.iter().map(|p| p.y).collect();
        hdu.write_col(&mut self.file, "X", &xs)
            .map_err(|e| StackError::Format(e.to_string()))?;
        hdu.write_col(&mut self.file, "Y", &ys)
            .map_err(|e| StackError::Format(e.to_string()))?;
        hdu.write_key(&mut self.file, "DATATYPE", "POINTS")
            .map_err(|e| StackError::Format(e.to_string()))?;

        Ok(())
    }

    pub fn read_points(&mut self, which: HduRef) -> StackResult<Vec<Point>> {
        let hdu = self.locate(&which)?;
        let xs: Vec<f64> = hdu
            .read_col(&mut self.file, "X")
            .map_err(|e| StackError::Format(e.to_string()))?;
        let ys: Vec<f64> = hdu
            .read_col(&mut self.file, "Y")
            .map_err(|e| StackError::Format(e.to_string()))?;
        Ok((0..xs.len()).map(|i| Point::new(xs[i], ys[i])).collect())
    }

    /// Writes a transformation as an (otherwise empty) table carrying only scalar
    /// keys: `A0`..`A3`, `B0`..`B3`, `XWIDTH`, `YWIDTH`.
    pub fn write_transformation(&mut self, t: &Transformation, name: &str) -> StackResult<()> {
        let descriptions = [column("UNUSED")];
        let mut hdu = self
            .file
            .create_table(name.to_string(), &descriptions)
            .map_err(|e| StackError::Format(e.to_string()))?;

        let keys: [(&str, f64); 10] = [
            ("A0", t.a0),
            ("A1", t.a1),
            ("A2", t.a2),
            ("A3", t.a3),
            ("B0", t.b0),
            ("B1", t.b1),
            ("B2", t.b2),
            ("B3", t.b3),
            ("XWIDTH", t.x_width),
            ("YWIDTH", t.y_width),
        ];
        for (key, value) in keys {
            hdu.write_key(&mut self.file, key, value)
                .map_err(|e| StackError::Format(e.to_string()))?;
        }
        hdu.write_key(&mut self.file, "DATATYPE", "TRANSFORMS")
            .map_err(|e| StackError::Format(e.to_string()))?;

        Ok(())
    }

    pub fn read_transformation(&mut self, which: HduRef) -> StackResult<Transformation> {
        let hdu = self.locate(&which)?;
        let get = |hdu: &fitsio::hdu::FitsHdu, file: &mut FitsFile, key: &str| -> StackResult<f64> {
            hdu.read_key(file, key).map_err(|e| StackError::Format(e.to_string()))
        };

        Ok(Transformation {
            a0: get(&hdu, &mut self.file, "A0")?,
            a1: get(&hdu, &mut self.file, "A1")?,
            a2: get(&hdu, &mut self.file, "A2")?,
            a3: get(&hdu, &mut self.file, "A3")?,
            b0: get(&hdu, &mut self.file, "B0")?,
            b1: get(&hdu, &mut self.file, "B1")?,
            b2: get(&hdu, &mut self.file, "B2")?,
            b3: get(&hdu, &mut self.file, "B3")?,
            x_width: get(&hdu, &mut self.file, "XWIDTH")?,
            y_width: get(&hdu, &mut self.file, "YWIDTH")?,
        })
    }

    pub fn write_background_calibration(
        &mut self,
        params: &BackgroundCalibrationParameters,
        name: &str,
    ) -> StackResult<()> {
        let descriptions = [column("UNUSED")];
        let mut hdu = self
            .file
            .create_table(name.to_string(), &descriptions)
            .map_err(|e| StackError::Format(e.to_string()))?;

        let channel_keys = ["R", "G", "B"];
        for (i, suffix) in channel_keys.iter().enumerate() {
            hdu.write_key(&mut self.file, &format!("BACKGROUND_{suffix}"), params.background[i])
                .map_err(|e| StackError::Format(e.to_string()))?;
            hdu.write_key(&mut self.file, &format!("MAX_{suffix}"), params.max[i])
                .map_err(|e| StackError::Format(e.to_string()))?;
        }
        hdu.write_key(&mut self.file, "DATATYPE", "BACKGROUNDCALIBRATION")
            .map_err(|e| StackError::Format(e.to_string()))?;

        Ok(())
    }

    pub fn read_background_calibration(
        &mut self,
        which: HduRef,
    ) -> StackResult<BackgroundCalibrationParameters> {
        let hdu = self.locate(&which)?;
        let mut background = [0.0; 3];
        let mut max = [0.0; 3];
        for (i, suffix) in ["R", "G", "B"].iter().enumerate() {
            background[i] = hdu
                .read_key(&mut self.file, &format!("BACKGROUND_{suffix}"))
                .map_err(|e| StackError::Format(e.to_string()))?;
            max[i] = hdu
                .read_key(&mut self.file, &format!("MAX_{suffix}"))
                .map_err(|e| StackError::Format(e.to_string()))?;
        }
        Ok(BackgroundCalibrationParameters::new(background, max))
    }

    /// Writes the astrometry.net-compatible keyword set onto HDU 0.
    pub fn write_astrometry_keywords(&mut self, image_size: (u32, u32)) -> StackResult<()> {
        let mut hdu = self.file.primary_hdu().map_err(|e| StackError::Format(e.to_string()))?;
        hdu.write_key(&mut self.file, "IMAGEW", image_size.0 as i64)
            .map_err(|e| StackError::Format(e.to_string()))?;
        hdu.write_key(&mut self.file, "IMAGEH", image_size.1 as i64)
            .map_err(|e| StackError::Format(e.to_string()))?;
        hdu.write_key(&mut self.file, "ANRUN", true)
            .map_err(|e| StackError::Format(e.to_string()))?;
        hdu.write_key(&mut self.file, "ANVERUNI", true)
            .map_err(|e| StackError::Format(e.to_string()))?;
        hdu.write_key(&mut self.file, "ANVERDUP", false)
            .map_err(|e| StackError::Format(e.to_string()))?;
        hdu.write_key(&mut self.file, "ANTWEAK", true)
            .map_err(|e| StackError::Format(e.to_string()))?;
        hdu.write_key(&mut self.file, "ANTWEAKO", 2i64)
            .map_err(|e| StackError::Format(e.to_string()))?;
        Ok(())
    }

    pub fn write_bool(&mut self, key: &str, value: bool) -> StackResult<()> {
        let mut hdu = self.file.primary_hdu().map_err(|e| StackError::Format(e.to_string()))?;
        hdu.write_key(&mut self.file, key, value)
            .map_err(|e| StackError::Format(e.to_string()))?;
        Ok(())
    }

    pub fn read_bool(&mut self, key: &str) -> StackResult<bool> {
        let hdu = self.file.primary_hdu().map_err(|e| StackError::Format(e.to_string()))?;
        hdu.read_key(&mut self.file, key)
            .map_err(|e| StackError::Format(e.to_string()))
    }

    /// Checks for the `SIMPLE` FITS magic in the first six bytes, without opening the
    /// file through `cfitsio`.
    pub fn is_fits(path: &Path) -> bool {
        let Ok(mut f) = std::fs::File::open(path) else {
            return false;
        };
        let mut magic = [0u8; 6];
        if f.read_exact(&mut magic).is_err() {
            return false;
        }
        &magic == b"SIMPLE"
    }
}

fn column(name: &str) -> ColumnDescription {
    ColumnDescription::new(name)
        .with_type(ColumnDataType::Double)
        .create()
        .expect("static column description is always valid")
}

/// Recovers the bitmap depth from the HDU's `BITPIX`, via the `ImageType` fitsio
/// already decoded it into. This must be the source of truth for depth on read —
/// `DATAMAX` alone is ambiguous (an `F32` and an `F64` frame both normalized to
/// `Range::One` share the same `DATAMAX`).
fn depth_from_image_type(image_type: ImageType) -> StackResult<Depth> {
    match image_type {
        ImageType::UnsignedByte => Ok(Depth::U8),
        ImageType::UnsignedShort => Ok(Depth::U16),
        ImageType::UnsignedLong => Ok(Depth::U32),
        ImageType::Float => Ok(Depth::F32),
        ImageType::Double => Ok(Depth::F64),
        _ => Err(StackError::Format("unsupported FITS image type".into())),
    }
}

fn range_from_datamax(data_max: f64) -> Range {
    if data_max <= 2.0 {
        Range::One
    } else if data_max <= 256.0 {
        Range::Byte
    } else if data_max <= 65_536.0 {
        Range::UShort
    } else {
        Range::UInt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap::{Channels, Depth};

    fn temp_path(name: &str) -> std::path::PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("astrophoto-stack-test-{}-{}", std::process::id(), name));
        p
    }

    #[test]
    fn bitmap_round_trips_depth_range_and_space() {
        let path = temp_path("bitmap.fits");
        let _ = std::fs::remove_file(&path);

        let mut bmp = Bitmap::with_size(Depth::F64, Channels::One, 3, 2);
        bmp.set_raw(0, 0, 0, 1.5);
        bmp.set_raw(1, 0, 0, 2.5);
        bmp.info.iso = Some(800.0);

        {
            let mut store = Store::create(&path).unwrap();
            store.write_bitmap(&bmp, Some("IMAGE")).unwrap();
        }

        {
            let mut store = Store::open(&path, true).unwrap();
            let read_back = store.read_bitmap(HduRef::Index(1)).unwrap();
            assert_eq!(read_back.width(), 3);
            assert_eq!(read_back.height(), 2);
            assert!((read_back.get_raw(1, 0, 0) - 2.5).abs() < 1e-9);
            assert_eq!(read_back.info.iso, Some(800.0));
        }

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn depth_is_recovered_from_bitpix_not_datamax() {
        let path = temp_path("f32-depth.fits");
        let _ = std::fs::remove_file(&path);

        let mut bmp = Bitmap::with_size(Depth::F32, Channels::One, 2, 2);
        bmp.set_raw(0, 0, 0, 1.0);

        {
            let mut store = Store::create(&path).unwrap();
            store.write_bitmap(&bmp, Some("IMAGE")).unwrap();
        }

        {
            let mut store = Store::open(&path, true).unwrap();
            let read_back = store.read_bitmap(HduRef::Index(1)).unwrap();
            // F32 and F64 both normalize to Range::One (same DATAMAX); only BITPIX
            // tells them apart.
            assert_eq!(read_back.depth(), Depth::F32);
        }

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn u16_bitmap_round_trips_with_its_native_depth() {
        let path = temp_path("u16-depth.fits");
        let _ = std::fs::remove_file(&path);

        let mut bmp = Bitmap::with_size(Depth::U16, Channels::One, 2, 2);
        bmp.set_raw(0, 0, 0, 4000.0);

        {
            let mut store = Store::create(&path).unwrap();
            store.write_bitmap(&bmp, Some("IMAGE")).unwrap();
        }

        {
            let mut store = Store::open(&path, true).unwrap();
            let read_back = store.read_bitmap(HduRef::Index(1)).unwrap();
            assert_eq!(read_back.depth(), Depth::U16);
            assert!((read_back.get_raw(0, 0, 0) - 4000.0).abs() < 1e-9);
        }

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn stars_round_trip_with_fixed_column_layout() {
        let path = temp_path("stars.fits");
        let _ = std::fs::remove_file(&path);

        let stars = vec![
            Star::new(Point::new(1.0, 2.0), 10.0, 0.9, 3.2),
            Star::new(Point::new(4.0, 5.0), 20.0, 0.8, 2.1),
        ];

        {
            let mut store = Store::create(&path).unwrap();
            store.write_stars(&stars, (100, 80), Some(42.0), "STARS").unwrap();
        }

        {
            let mut store = Store::open(&path, true).unwrap();
            let (read_back, size) = store.read_stars(HduRef::Name("STARS")).unwrap();
            assert_eq!(size, (100, 80));
            assert_eq!(read_back.len(), 2);
            assert!((read_back[0].quality - 0.9).abs() < 1e-9);
            assert!((read_back[0].mean_radius - 3.2).abs() < 1e-9);
            assert!((read_back[1].mean_radius - 2.1).abs() < 1e-9);
        }

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn is_fits_rejects_non_fits_files() {
        let path = temp_path("not-fits.txt");
        std::fs::write(&path, b"hello").unwrap();
        assert!(!Store::is_fits(&path));
        let _ = std::fs::remove_file(&path);
    }
}
